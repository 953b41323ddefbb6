//! Abstraction over the core systems primitives the dispatcher depends on:
//! wallclock/monotonic time, randomness, and spawning futures/threads. A
//! production binary runs on [`prod::TokioRuntime`]; tests run on
//! [`testing::TestRuntime`], which pauses and steps tokio's virtual clock so
//! that deadline math is deterministic.
use std::{
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::future::{
    BoxFuture,
    FusedFuture,
};
use rand::RngCore;

pub mod prod;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

/// A millisecond-resolution Unix timestamp, used anywhere a deadline or clock
/// reading crosses an API boundary (metrics, logs, wire formats).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(Duration);

impl UnixTimestamp {
    pub fn from_millis(millis: u64) -> Self {
        Self(Duration::from_millis(millis))
    }

    pub fn as_millis(&self) -> u128 {
        self.0.as_millis()
    }
}

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("task was canceled")]
    Canceled,
    #[error("task panicked: {0}")]
    Panicked(anyhow::Error),
}

/// A handle to a spawned future or thread. Dropping the handle does not cancel
/// the underlying work; call [`SpawnHandle::shutdown`] to preempt it.
pub trait SpawnHandle: Send + Sync {
    fn shutdown(&mut self);
    fn join(&mut self) -> BoxFuture<'_, Result<(), JoinError>>;
}

/// Shut down the associated future, preempting it at its next yield point,
/// and join on its result, swallowing a clean cancellation.
pub async fn shutdown_and_join(mut handle: Box<dyn SpawnHandle>) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Everything the dispatcher needs from its host process. Implementations
/// must be `Clone + Send + Sync` since the same `Environment` is shared across
/// request threads.
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Sleep for the given duration. Returned as a boxed, fused future so it
    /// composes inside `select!` without extra allocation at call sites.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;

    /// Spawn a future on a reserved OS thread. Used by `BackgroundThreadFactory`
    /// where the callee needs an isolated stack.
    fn spawn_thread<Fut, F>(&self, f: F) -> Box<dyn SpawnHandle>
    where
        Fut: std::future::Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static;

    /// Wallclock time, compare against `UNIX_EPOCH` for a Unix timestamp.
    fn system_time(&self) -> SystemTime;

    fn unix_timestamp(&self) -> UnixTimestamp {
        let since_epoch = self
            .system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        UnixTimestamp::from_millis(since_epoch.as_millis() as u64)
    }

    /// A monotonic clock reading. Never goes backwards within one process.
    fn monotonic_now(&self) -> tokio::time::Instant;

    /// A source of randomness, used for ids and jitter.
    fn rng(&self) -> Box<dyn RngCore>;
}
