//! Bounds how many API calls one request may have in flight at once. Built
//! the same way `isolate::ConcurrencyLimiter` bounds concurrent isolate
//! threads: a bounded channel whose capacity *is* the permit count,
//! so acquiring a permit is a bounded `send` and releasing it is a `recv`
//! that never blocks.
use std::time::Duration;

use futures::{
    select_biased,
    FutureExt,
};
use runtime::Runtime;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateAcquireError {
    /// The deadline passed to `acquire` elapsed before a permit became
    /// available. The dispatcher maps this to `Cancelled{DeadlineReached}`.
    #[error("deadline used up awaiting a concurrency slot")]
    DeadlineUsedUpAwaitingSlot,
}

/// A counted semaphore with `permits` equal to the configured concurrent-API-
/// call limit for one request's `Environment`.
#[derive(Clone)]
pub struct ConcurrencyGate {
    tx: async_channel::Sender<()>,
    rx: async_channel::Receiver<()>,
}

impl ConcurrencyGate {
    pub fn new(max_concurrency: usize) -> Self {
        assert!(
            max_concurrency > 0,
            "max_concurrency must be greater than zero"
        );
        let (tx, rx) = async_channel::bounded(max_concurrency);
        Self { tx, rx }
    }

    /// No concurrency bound at all; used by offline/background callers that
    /// opt out of the gate.
    pub fn unlimited() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    /// How many permits are currently held, for tests and diagnostics.
    pub fn in_flight(&self) -> usize {
        self.tx.len()
    }

    /// Blocks until a permit is available or `deadline_seconds` elapses.
    /// Returns the permit together with the milliseconds actually spent
    /// waiting, so the caller can deduct that wait from its own deadline.
    pub async fn acquire<RT: Runtime>(
        &self,
        rt: &RT,
        deadline_seconds: f64,
    ) -> Result<(ConcurrencyPermit, u64), GateAcquireError> {
        let start = rt.monotonic_now();
        let deadline = Duration::from_secs_f64(deadline_seconds.max(0.0));
        let permit = select_biased! {
            result = self.tx.send(()).fuse() => {
                result.expect("ConcurrencyGate's receiver was dropped while held open");
                ConcurrencyPermit {
                    rx: self.rx.clone(),
                }
            },
            _ = rt.wait(deadline) => return Err(GateAcquireError::DeadlineUsedUpAwaitingSlot),
        };
        let waited = rt.monotonic_now().saturating_duration_since(start);
        Ok((permit, waited.as_millis() as u64))
    }
}

/// Held for the lifetime of one outstanding RPC. Releasing is idempotent with
/// respect to the acquisition it came from: dropping it is the only way to
/// release it, and it can only be dropped once.
pub struct ConcurrencyPermit {
    rx: async_channel::Receiver<()>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.rx
            .try_recv()
            .expect("ConcurrencyPermit outlived the message it was holding");
    }
}

#[cfg(test)]
mod tests {
    use runtime::testing::TestDriver;

    use super::*;

    #[test]
    fn acquire_succeeds_immediately_under_capacity() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let gate = ConcurrencyGate::new(4);
        let (_, waited) = td.run_until(gate.acquire(&rt, 1.0)).unwrap();
        assert_eq!(waited, 0);
    }

    #[test]
    fn acquire_times_out_at_capacity() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let gate = ConcurrencyGate::new(1);
        let _held = td.run_until(gate.acquire(&rt, 1.0)).unwrap();
        let err = td.run_until(gate.acquire(&rt, 1.0)).unwrap_err();
        assert_eq!(err, GateAcquireError::DeadlineUsedUpAwaitingSlot);
    }

    #[test]
    fn release_frees_exactly_one_waiter() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let gate = ConcurrencyGate::new(1);
        let held = td.run_until(gate.acquire(&rt, 1.0)).unwrap().0;
        drop(held);
        let (_second, waited) = td.run_until(gate.acquire(&rt, 1.0)).unwrap();
        assert_eq!(waited, 0);
        assert_eq!(gate.in_flight(), 1);
    }

    #[test]
    fn unlimited_gate_never_blocks() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let gate = ConcurrencyGate::unlimited();
        let mut permits = Vec::new();
        for _ in 0..64 {
            permits.push(td.run_until(gate.acquire(&rt, 1.0)).unwrap());
        }
    }
}
