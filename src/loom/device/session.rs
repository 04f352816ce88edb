use std::{sync::Arc, thread::JoinHandle};

use derive_more::{Deref, Display};
#[cfg(not(feature = "rayon"))]
use itertools::Itertools;

use super::{Accelerator, DispatchError, ExecutionMode, TileCall, TileKernel};
use crate::loom::{num::Scalar, platform, tensor::Tensor, tiled::TiledTensor};

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash, Deref)]
pub struct SessionId(uid::Id<SessionId>);

/// Operand grids a session works on.
///
/// Inputs and weights are shared read-only. Outputs are moved into the session and only handed
/// back by its barrier.
#[derive(Debug, Clone)]
pub struct Workspace<T> {
    pub inputs: Arc<TiledTensor<T>>,
    pub weights: Arc<TiledTensor<T>>,
    pub outputs: TiledTensor<T>,
}

type Reply<T> = Result<TiledTensor<T>, DispatchError>;

enum SessionEvent<T> {
    Invoke { index: usize, call: TileCall },
    Barrier { sender: flume::Sender<Reply<T>> },
}

enum Channel<T: Scalar> {
    Eager(Box<Backend<T>>),
    Deferred(flume::Sender<SessionEvent<T>>),
}

enum Barrier<T> {
    Ready(Reply<T>),
    Pending(flume::Receiver<Reply<T>>),
}

/// The scoped unit of accelerator work of one operator execution.
///
/// Calls are enqueued synchronously; [`Session::run`] is the barrier that blocks until every
/// enqueued call has completed and returns the output grid, or the first fault. Dropping a
/// session without running it discards the pending work.
pub struct Session<T: Scalar> {
    id: SessionId,
    mode: ExecutionMode,
    count: usize,
    channel: Option<Channel<T>>,
    worker: Option<JoinHandle<()>>,
    fault: Option<DispatchError>,
}

impl<T: Scalar> std::fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("count", &self.count)
            .finish()
    }
}

impl<T: Scalar> Session<T> {
    pub fn create(accelerator: &Accelerator<T>, workspace: Workspace<T>) -> Result<Self, DispatchError> {
        let id = SessionId(uid::Id::new());
        let mode = accelerator.mode();
        let Workspace {
            inputs,
            weights,
            outputs,
        } = workspace;
        let backend = Backend {
            id,
            kernel: accelerator.kernel(),
            inputs,
            weights,
            outputs,
            pending: vec![],
            fault: None,
        };

        let (channel, worker) = match mode {
            ExecutionMode::Eager => (Channel::Eager(Box::new(backend)), None),
            ExecutionMode::Deferred => {
                let (sender, receiver) = flume::unbounded();
                let worker = platform::spawn(format!("session-{id}"), move || {
                    platform::block_on(serve(backend, receiver))
                })?;
                (Channel::Deferred(sender), Some(worker))
            }
        };
        log::debug!("session {id}: created, {mode} execution");

        Ok(Self {
            id,
            mode,
            count: 0,
            channel: Some(channel),
            worker,
            fault: None,
        })
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Number of calls enqueued so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Enqueues one kernel invocation. Faults are reported by the barrier.
    pub fn enqueue(&mut self, call: TileCall) {
        let index = self.count;
        self.count += 1;
        match self.channel.as_mut() {
            Some(Channel::Eager(backend)) => backend.invoke(index, &call),
            Some(Channel::Deferred(sender)) => {
                let event = SessionEvent::Invoke { index, call };
                if sender.send(event).is_err() && self.fault.is_none() {
                    self.fault = Some(DispatchError::Disconnected);
                }
            }
            None => {}
        }
    }

    /// Blocks until all enqueued work completes and returns the output grid.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    pub fn run(mut self) -> Result<TiledTensor<T>, DispatchError> {
        match self.barrier() {
            Barrier::Ready(reply) => reply,
            Barrier::Pending(receiver) => receiver.recv()?,
        }
    }

    /// Same as [`Session::run`], but awaits the barrier instead of blocking.
    pub async fn run_async(mut self) -> Result<TiledTensor<T>, DispatchError> {
        match self.barrier() {
            Barrier::Ready(reply) => reply,
            Barrier::Pending(receiver) => receiver.recv_async().await?,
        }
    }

    fn barrier(&mut self) -> Barrier<T> {
        log::debug!("session {}: barrier after {} calls", self.id, self.count);
        let channel = self.channel.take();
        if let Some(err) = self.fault.take() {
            return Barrier::Ready(Err(err));
        }
        match channel {
            Some(Channel::Eager(backend)) => Barrier::Ready(backend.finish()),
            Some(Channel::Deferred(sender)) => {
                let (reply, receiver) = flume::bounded(1);
                match sender.send(SessionEvent::Barrier { sender: reply }) {
                    Ok(()) => Barrier::Pending(receiver),
                    Err(_) => Barrier::Ready(Err(DispatchError::Disconnected)),
                }
            }
            None => Barrier::Ready(Err(DispatchError::Disconnected)),
        }
    }
}

impl<T: Scalar> Drop for Session<T> {
    fn drop(&mut self) {
        if self.channel.take().is_some() {
            log::debug!("session {}: dropped before its barrier, discarding work", self.id);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("session {}: worker panicked", self.id);
            }
        }
        log::debug!("session {}: destroyed", self.id);
    }
}

/// Session state: the kernel, the operand grids and the calls not yet executed.
struct Backend<T: Scalar> {
    id: SessionId,
    kernel: Arc<dyn TileKernel<T>>,
    inputs: Arc<TiledTensor<T>>,
    weights: Arc<TiledTensor<T>>,
    outputs: TiledTensor<T>,
    pending: Vec<(usize, TileCall)>,
    fault: Option<DispatchError>,
}

impl<T: Scalar> Backend<T> {
    fn check(&self, index: usize, call: &TileCall) -> Result<(), DispatchError> {
        let operands = [
            ("input", call.input, self.inputs.len()),
            ("weight", call.weight, self.weights.len()),
            ("output", call.output, self.outputs.len()),
        ];
        match operands.into_iter().find(|&(_, tile, len)| tile >= len) {
            Some((operand, tile, len)) => Err(DispatchError::Tile {
                index,
                operand,
                tile,
                len,
            }),
            None => Ok(()),
        }
    }

    /// Executes one call right away.
    fn invoke(&mut self, index: usize, call: &TileCall) {
        if self.fault.is_some() {
            log::warn!("session {}: skipping tile call {index} after a fault", self.id);
            return;
        }
        if let Err(err) = self.check(index, call) {
            self.fault = Some(err);
            return;
        }
        let output = self.outputs.tile_mut(call.output);
        if let Err(err) = execute(&*self.kernel, &self.inputs, &self.weights, output, index, call) {
            self.fault = Some(err);
        }
    }

    /// Executes all pending calls.
    ///
    /// Calls on disjoint output tiles are independent; calls on the same output tile run in the
    /// order they were enqueued.
    #[cfg_attr(feature = "trace", tracing::instrument(skip_all))]
    fn flush(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if self.fault.is_some() {
            return;
        }
        if let Some(err) = pending
            .iter()
            .find_map(|(index, call)| self.check(*index, call).err())
        {
            self.fault = Some(err);
            return;
        }
        log::debug!("session {}: flushing {} calls", self.id, pending.len());

        let mut groups = vec![vec![]; self.outputs.len()];
        for (index, call) in pending {
            groups[call.output].push((index, call));
        }

        let kernel = &*self.kernel;
        let inputs = &*self.inputs;
        let weights = &*self.weights;
        let run = |(output, calls): (&mut Tensor<T>, Vec<(usize, TileCall)>)| {
            calls
                .iter()
                .try_for_each(|(index, call)| execute(kernel, inputs, weights, output, *index, call))
        };

        #[cfg(not(feature = "rayon"))]
        let errors: Vec<_> = self
            .outputs
            .tiles_mut()
            .iter_mut()
            .zip_eq(groups)
            .map(run)
            .filter_map(Result::err)
            .collect();
        #[cfg(feature = "rayon")]
        let errors: Vec<_> = {
            use rayon::prelude::*;
            self.outputs
                .tiles_mut()
                .par_iter_mut()
                .zip_eq(groups)
                .map(run)
                .filter_map(Result::err)
                .collect()
        };

        self.fault = errors.into_iter().min_by_key(|err| err.index());
    }

    fn finish(mut self) -> Reply<T> {
        self.flush();
        match self.fault {
            Some(err) => Err(err),
            None => Ok(self.outputs),
        }
    }
}

fn execute<T: Scalar>(
    kernel: &dyn TileKernel<T>,
    inputs: &TiledTensor<T>,
    weights: &TiledTensor<T>,
    output: &mut Tensor<T>,
    index: usize,
    call: &TileCall,
) -> Result<(), DispatchError> {
    log::trace!(
        "tile call {index}: input {}, weight {}, output {}, first: {}",
        call.input,
        call.weight,
        call.output,
        call.args.first
    );
    let input = inputs.tile(call.input);
    let weight = weights.tile(call.weight);
    kernel.execute(&call.args, input, weight, output).map_err(|source| {
        log::error!("tile call {index} failed: {source}");
        DispatchError::Kernel {
            index,
            kernel: kernel.name(),
            source,
        }
    })
}

async fn serve<T: Scalar>(mut backend: Backend<T>, receiver: flume::Receiver<SessionEvent<T>>) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            SessionEvent::Invoke { index, call } => backend.pending.push((index, call)),
            SessionEvent::Barrier { sender } => {
                let reply = backend.finish();
                _ = sender.send_async(reply).await;
                return;
            }
        }
    }
    log::debug!(
        "session {}: channel closed, {} pending calls discarded",
        backend.id,
        backend.pending.len()
    );
}
