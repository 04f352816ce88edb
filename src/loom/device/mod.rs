use std::{borrow::Cow, sync::Arc};

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{num::Scalar, tensor::Tensor};

pub use session::{Session, SessionId, Workspace};

pub mod session;

/// Arguments of one tile kernel invocation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileArgs {
    /// Logical dims of the input tile, halo included.
    pub input_dims: [usize; 4],
    /// Logical dims of the weight tile.
    pub weight_dims: [usize; 4],
    /// Logical dims of the output tile.
    pub output_dims: [usize; 4],
    /// Padding of the input tile on the channel axis.
    pub input_pad: usize,
    /// Padding of the weight tile on the channel axis.
    pub weight_pad: usize,
    /// Padding of the output tile on the channel axis.
    pub output_pad: usize,
    pub row_stride: usize,
    pub col_stride: usize,
    /// Index of the weight tile along the output channels, i.e., which output slab is produced.
    pub weight_group: usize,
    /// Index of the input tile along the channel-reduction axis.
    pub input_channel_tile: usize,
    /// Logical channel of the first channel held by the input tile.
    pub input_channel_start: usize,
    /// Logical channel of the first channel held by the weight tile.
    pub weight_channel_start: usize,
    /// If set, the kernel initializes the output tile instead of accumulating into it.
    pub first: bool,
}

/// One enqueued kernel invocation: positions of the tiles in their grids plus the arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TileCall {
    pub input: usize,
    pub weight: usize,
    pub output: usize,
    pub args: TileArgs,
}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("{operand} tile with dims {actual:?} does not match declared dims {declared:?}")]
    Operand {
        operand: &'static str,
        declared: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("{operand} tile with dims {actual:?} cannot produce an output tile with dims {output:?}")]
    Extent {
        operand: &'static str,
        actual: [usize; 4],
        output: [usize; 4],
    },
    #[error("input channels [{input_start}, {input_end}) and weight channels [{weight_start}, {weight_end}) do not overlap")]
    Channels {
        input_start: usize,
        input_end: usize,
        weight_start: usize,
        weight_end: usize,
    },
    #[error("kernel fault: {0}")]
    Fault(Cow<'static, str>),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("tile call {index} ({kernel}) failed: {source}")]
    Kernel {
        index: usize,
        kernel: Cow<'static, str>,
        #[source]
        source: KernelError,
    },
    #[error("tile call {index} references {operand} tile {tile}, but the grid holds {len}")]
    Tile {
        index: usize,
        operand: &'static str,
        tile: usize,
        len: usize,
    },
    #[error("session worker disconnected")]
    Disconnected,
    #[error("failed to spawn session worker: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("failed to receive barrier reply: {0}")]
    Recv(#[from] flume::RecvError),
}

impl DispatchError {
    /// Enqueue index of the call that faulted, if the fault belongs to a call.
    pub fn index(&self) -> Option<usize> {
        match self {
            DispatchError::Kernel { index, .. } | DispatchError::Tile { index, .. } => Some(*index),
            _ => None,
        }
    }
}

/// A compute kernel applied to one matched (input, weight, output) tile group.
///
/// This is the capability the tile loop depends on; hardware and software implementations are
/// chosen when building the [`Accelerator`].
pub trait TileKernel<T: Scalar>: Send + Sync {
    #[inline]
    fn name(&self) -> Cow<'static, str> {
        Cow::from(std::any::type_name::<Self>())
    }

    fn execute(
        &self,
        args: &TileArgs,
        input: &Tensor<T>,
        weight: &Tensor<T>,
        output: &mut Tensor<T>,
    ) -> Result<(), KernelError>;
}

/// How a session executes the calls enqueued into it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ExecutionMode {
    /// Run each call in the calling thread as it is enqueued.
    Eager,
    /// Send calls to a session worker, which batches them and runs them at the barrier.
    #[default]
    Deferred,
}

/// A fixed-capacity accelerator: the configured kernel strategy plus its execution mode.
#[derive(Clone)]
pub struct Accelerator<T: Scalar> {
    kernel: Arc<dyn TileKernel<T>>,
    mode: ExecutionMode,
}

impl<T: Scalar> std::fmt::Debug for Accelerator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accelerator")
            .field("kernel", &self.kernel.name())
            .field("mode", &self.mode)
            .finish()
    }
}

impl<T: Scalar> Accelerator<T> {
    #[inline]
    pub fn kernel(&self) -> Arc<dyn TileKernel<T>> {
        self.kernel.clone()
    }

    #[inline]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Opens a dispatch session over the given operand grids.
    #[inline]
    pub fn session(&self, workspace: Workspace<T>) -> Result<Session<T>, DispatchError> {
        Session::create(self, workspace)
    }
}

pub struct AcceleratorBuilder<T: Scalar> {
    pub kernel: Arc<dyn TileKernel<T>>,
    pub mode: ExecutionMode,
}

impl<T: Scalar> AcceleratorBuilder<T> {
    pub fn new(kernel: impl TileKernel<T> + 'static) -> Self {
        Self {
            kernel: Arc::new(kernel),
            mode: Default::default(),
        }
    }

    pub fn mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn build(self) -> Accelerator<T> {
        let Self { kernel, mode } = self;
        log::debug!("accelerator: kernel {}, {mode} execution", kernel.name());
        Accelerator { kernel, mode }
    }
}
