//! Deterministic runtime for tests. Time is virtual: it only advances when
//! [`TestDriver::run_until`] drives the executor forward and that future is
//! blocked purely on a timer, so deadline arithmetic is reproducible instead
//! of being at the mercy of scheduler jitter.
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
use parking_lot::Mutex;
use rand::{
    RngCore,
    SeedableRng,
};
use rand_chacha::ChaCha12Rng;

use crate::{
    JoinError,
    Runtime,
    SpawnHandle,
};

const DEFAULT_SEED: u64 = 0;

/// Owns the single-threaded tokio runtime with paused time. Only the test
/// thread may call [`TestDriver::run_until`]; `TestRuntime` clones are `Send`
/// so they can be handed to spawned tasks, but they always drive the same
/// underlying executor.
pub struct TestDriver {
    rt: tokio::runtime::Runtime,
    state: Arc<Mutex<TestState>>,
}

struct TestState {
    rng: ChaCha12Rng,
}

impl TestDriver {
    pub fn new() -> Self {
        Self::new_with_seed(DEFAULT_SEED)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .expect("Failed to build test tokio runtime");
        Self {
            rt,
            state: Arc::new(Mutex::new(TestState {
                rng: ChaCha12Rng::seed_from_u64(seed),
            })),
        }
    }

    pub fn rt(&self) -> TestRuntime {
        TestRuntime {
            state: self.state.clone(),
        }
    }

    /// Run `f` to completion. Tokio auto-advances paused time whenever every
    /// task is parked on a timer, so deadline/watchdog logic runs instantly
    /// instead of burning wall-clock seconds.
    pub fn run_until<F: Future>(&mut self, f: F) -> F::Output {
        self.rt.block_on(f)
    }
}

impl Default for TestDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone)]
pub struct TestRuntime {
    state: Arc<Mutex<TestState>>,
}

pub struct TestFutureHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle for TestFutureHandle {
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

impl Runtime for TestRuntime {
    fn wait(&self, duration: std::time::Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        tokio::time::sleep(duration).fuse().boxed()
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        Box::new(TestFutureHandle {
            handle: tokio::task::spawn(f),
        })
    }

    fn spawn_thread<Fut, F>(&self, f: F) -> Box<dyn SpawnHandle>
    where
        Fut: Future<Output = ()>,
        F: FnOnce() -> Fut + Send + 'static,
    {
        // `Fut` need not be `Send` (mirroring the production impl, which
        // reserves a dedicated OS thread for exactly this reason), so we give
        // it its own single-threaded runtime rather than folding it into the
        // paused-time test executor.
        let handle = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .expect("Failed to build thread-local tokio runtime");
            rt.block_on(f());
        });
        Box::new(crate::prod::ThreadHandle::from_std(handle))
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn monotonic_now(&self) -> tokio::time::Instant {
        tokio::time::Instant::now()
    }

    fn rng(&self) -> Box<dyn RngCore> {
        let mut guard = self.state.lock();
        let mut seed = [0u8; 32];
        guard.rng.fill_bytes(&mut seed);
        Box::new(ChaCha12Rng::from_seed(seed))
    }
}
