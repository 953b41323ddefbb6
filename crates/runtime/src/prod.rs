//! Production implementation of [`crate::Runtime`], backed by a shared
//! multi-threaded `tokio::runtime::Runtime`.
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    time::SystemTime,
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::{
    rngs::ThreadRng,
    RngCore,
};

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

/// Set a consistent thread stack size regardless of environment. This is 2x
/// Rust's default.
pub const STACK_SIZE: usize = 4 * 1024 * 1024;

pub struct FutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for FutureHandle {
    fn shutdown(&mut self) {
        self.handle.abort();
    }

    fn join(&mut self) -> futures::future::BoxFuture<'_, Result<(), JoinError>> {
        async move {
            match (&mut self.handle).await {
                Ok(()) => Ok(()),
                Err(e) if e.is_cancelled() => Err(JoinError::Canceled),
                Err(e) => Err(JoinError::Panicked(anyhow::anyhow!(e))),
            }
        }
        .boxed()
    }
}

pub struct ThreadHandle {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ThreadHandle {
    pub fn from_std(handle: std::thread::JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl SpawnHandle for ThreadHandle {
    fn shutdown(&mut self) {
        // We don't have a portable way to forcibly interrupt a running OS
        // thread; the thread is expected to observe cancellation through its
        // own future (e.g. the isolate's own termination signal) and exit.
    }

    fn join(&mut self) -> futures::future::BoxFuture<'_, Result<(), JoinError>> {
        async move {
            let handle = self.handle.take().expect("ThreadHandle joined twice");
            tokio::task::spawn_blocking(move || handle.join())
                .await
                .map_err(|e| JoinError::Panicked(anyhow::anyhow!(e)))?
                .map_err(|e| JoinError::Panicked(anyhow::anyhow!("{e:?}")))
        }
        .boxed()
    }
}

#[derive(Clone)]
pub struct TokioRuntime {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioRuntime {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }
}

impl Runtime for TokioRuntime {
    fn wait(&self, duration: std::time::Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        tokio::time::sleep(duration).fuse().boxed()
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let span = tracing::info_span!("spawned_future", name);
        let handle = self.handle.spawn(tracing::Instrument::instrument(f, span));
        Box::new(FutureHandle { handle })
    }

    fn spawn_thread<Fut, F>(&self, f: F) -> Box<dyn SpawnHandle>
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        let rt_handle = self.handle.clone();
        let handle = std::thread::Builder::new()
            .stack_size(STACK_SIZE)
            .spawn(move || {
                let fut = f();
                rt_handle.block_on(fut);
            })
            .expect("Failed to spawn OS thread");
        Box::new(ThreadHandle::from_std(handle))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        Box::new(ThreadRng::default())
    }
}
