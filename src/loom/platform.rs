use std::thread::JoinHandle;

/// Spawns a named worker thread.
#[inline]
pub fn spawn<F>(name: impl Into<String>, f: F) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new().name(name.into()).spawn(f)
}

/// Drives a future to completion on the current thread.
#[inline]
pub fn block_on<F: std::future::Future>(future: F) -> F::Output {
    futures::executor::block_on(future)
}
