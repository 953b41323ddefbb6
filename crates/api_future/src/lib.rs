//! The user-facing result handle for one outstanding API call.
//! Built the same way `isolate::Timeout` guards an isolate execution: a
//! background watchdog task spawned at construction, and a broadcast channel
//! the real completion races against.
use std::{
    sync::Arc,
    time::Duration,
};

use api_host_client::{
    CallContext,
    CallStatus,
    HostFailure,
};
use bytes::Bytes;
use errors::{
    CancelReason,
    DispatchError,
};
use futures::{
    select_biased,
    FutureExt,
};
use parking_lot::Mutex;
use runtime::{
    Runtime,
    SpawnHandle,
};

mod service_codes;

/// `deadline + WATCHDOG_PADDING` is the absolute point at which a Future
/// fails itself even if the transport callback never arrives.
pub const WATCHDOG_PADDING: Duration = Duration::from_millis(500);

/// Below this much remaining soft-deadline time, an observed cancellation is
/// attributed to the deadline rather than to an explicit interrupt.
pub const CANCEL_ATTRIBUTION_THRESHOLD_MS: i64 = 50;

#[derive(Debug, Clone)]
pub struct CallDescriptor {
    pub service: String,
    pub method: String,
}

#[derive(Clone)]
enum State {
    Pending,
    Succeeded {
        response_bytes: Bytes,
        cpu_megacycles: Option<u64>,
        wallclock_millis: u64,
    },
    Failed(DispatchError),
}

/// A closure snapshotting an `Environment`'s soft-deadline clock, used only
/// to disambiguate cancellation. Kept generic over `Environment`
/// so this crate doesn't need to depend on it.
pub type RemainingMillisFn = Arc<dyn Fn() -> i64 + Send + Sync>;

pub struct ApiFuture<RT: Runtime> {
    descriptor: CallDescriptor,
    ctx: CallContext,
    state: Arc<Mutex<State>>,
    done_tx: async_broadcast::Sender<()>,
    done_rx: async_broadcast::Receiver<()>,
    remaining_millis: RemainingMillisFn,
    watchdog: Mutex<Option<Box<dyn SpawnHandle>>>,
    rt: RT,
}

impl<RT: Runtime> ApiFuture<RT> {
    /// Constructs a Future and starts its watchdog. `deadline` is the
    /// already-gate-reduced deadline set on `ctx`.
    pub fn new(
        rt: RT,
        descriptor: CallDescriptor,
        ctx: CallContext,
        deadline: Duration,
        remaining_millis: RemainingMillisFn,
    ) -> Arc<Self> {
        let state = Arc::new(Mutex::new(State::Pending));
        let (mut done_tx, done_rx) = async_broadcast::broadcast(1);
        done_tx.set_overflow(true);

        let watchdog_state = state.clone();
        let watchdog_descriptor = descriptor.clone();
        let watchdog_done_tx = done_tx.clone();
        let watchdog_rt = rt.clone();
        let watchdog = rt.spawn("api_future_watchdog", async move {
            watchdog_rt.wait(deadline + WATCHDOG_PADDING).await;
            let mut guard = watchdog_state.lock();
            if matches!(*guard, State::Pending) {
                *guard = State::Failed(DispatchError::ApiDeadlineExceeded {
                    service: watchdog_descriptor.service,
                    method: watchdog_descriptor.method,
                });
                drop(guard);
                let _ = watchdog_done_tx.try_broadcast(());
            }
        });

        Arc::new(Self {
            descriptor,
            ctx,
            state,
            done_tx,
            done_rx,
            remaining_millis,
            watchdog: Mutex::new(Some(watchdog)),
            rt,
        })
    }

    /// Constructs a Future that is already terminally failed, for the
    /// zero-deadline case in the dispatch procedure. No
    /// watchdog is started and no RPC is ever issued against it.
    pub fn pre_failed(
        rt: RT,
        descriptor: CallDescriptor,
        ctx: CallContext,
        error: DispatchError,
    ) -> Arc<Self> {
        let (mut done_tx, done_rx) = async_broadcast::broadcast(1);
        done_tx.set_overflow(true);
        let _ = done_tx.try_broadcast(());
        Arc::new(Self {
            descriptor,
            ctx,
            state: Arc::new(Mutex::new(State::Failed(error))),
            done_tx,
            done_rx,
            remaining_millis: Arc::new(|| i64::MAX),
            watchdog: Mutex::new(None),
            rt,
        })
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    pub fn call_context(&self) -> &CallContext {
        &self.ctx
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.state.lock(), State::Pending)
    }

    /// Called by the host callback on success. A no-op if the Future has
    /// already transitioned (e.g. the watchdog beat the callback to it).
    pub fn succeed(&self, response_bytes: Bytes, cpu_megacycles: Option<u64>, wallclock_millis: u64) {
        let mut guard = self.state.lock();
        if !matches!(*guard, State::Pending) {
            return;
        }
        *guard = State::Succeeded {
            response_bytes,
            cpu_megacycles,
            wallclock_millis,
        };
        drop(guard);
        self.finish();
    }

    /// Called by the host callback on transport failure. Translates the raw
    /// host status into the user-facing taxonomy.
    pub fn fail_from_host(&self, failure: HostFailure) {
        let error = self.translate(failure);
        self.fail(error);
    }

    /// Directly fails the Future with an already-classified error, used by
    /// the dispatcher for conditions it detects itself (gate timeout,
    /// zero-deadline).
    pub fn fail(&self, error: DispatchError) {
        let mut guard = self.state.lock();
        if !matches!(*guard, State::Pending) {
            return;
        }
        *guard = State::Failed(error);
        drop(guard);
        self.finish();
    }

    fn finish(&self) {
        if let Some(mut watchdog) = self.watchdog.lock().take() {
            watchdog.shutdown();
        }
        let _ = self.done_tx.try_broadcast(());
    }

    fn translate(&self, failure: HostFailure) -> DispatchError {
        let service = self.descriptor.service.clone();
        let method = self.descriptor.method.clone();
        match failure.status {
            CallStatus::Ok => unreachable!("HostFailure with status Ok"),
            CallStatus::Cancelled => DispatchError::Cancelled {
                reason: self.attribute_cancellation(),
            },
            CallStatus::DeadlineExceeded => DispatchError::ApiDeadlineExceeded { service, method },
            CallStatus::Unavailable => DispatchError::ServiceUnavailable { service, method },
            CallStatus::ApplicationError => {
                let code = failure.application_error_code.unwrap_or(0);
                service_codes::refine(&service, &method, code, &failure.detail).unwrap_or(
                    DispatchError::ApplicationError {
                        service,
                        method,
                        code,
                        detail: failure.detail,
                    },
                )
            },
            CallStatus::Internal => DispatchError::Internal {
                service,
                method,
                detail: failure.detail,
            },
        }
    }

    fn attribute_cancellation(&self) -> CancelReason {
        if (self.remaining_millis)() <= CANCEL_ATTRIBUTION_THRESHOLD_MS {
            CancelReason::DeadlineReached
        } else {
            CancelReason::Interrupted
        }
    }

    /// Requests cancellation. Only `interrupt=true` is honored; otherwise
    /// this is a no-op and returns `false`. Returns `false` if the Future was
    /// already terminal.
    pub fn cancel(&self, interrupt: bool) -> bool {
        if !interrupt {
            return false;
        }
        let mut guard = self.state.lock();
        if !matches!(*guard, State::Pending) {
            return false;
        }
        self.ctx.start_cancel();
        *guard = State::Failed(DispatchError::Cancelled {
            reason: self.attribute_cancellation(),
        });
        drop(guard);
        self.finish();
        true
    }

    /// Blocks until completion, with no bound beyond the Future's own
    /// watchdog.
    pub async fn get(&self) -> Result<Bytes, DispatchError> {
        let mut rx = self.done_rx.clone();
        if !matches!(*self.state.lock(), State::Pending) {
            return self.take_result();
        }
        let _ = rx.recv().await;
        self.take_result()
    }

    /// Blocks until completion or `timeout`, whichever comes first. Timing
    /// out here is purely local and does not depend on the watchdog; it
    /// fails with `ApiDeadlineExceeded` without mutating the Future's state,
    /// since the RPC may still be in flight.
    pub async fn get_with_timeout(&self, timeout: Duration) -> Result<Bytes, DispatchError> {
        let mut rx = self.done_rx.clone();
        if !matches!(*self.state.lock(), State::Pending) {
            return self.take_result();
        }
        select_biased! {
            _ = rx.recv().fuse() => self.take_result(),
            _ = self.rt.wait(timeout).fuse() => Err(DispatchError::ApiDeadlineExceeded {
                service: self.descriptor.service.clone(),
                method: self.descriptor.method.clone(),
            }),
        }
    }

    fn take_result(&self) -> Result<Bytes, DispatchError> {
        match self.state.lock().clone() {
            State::Pending => unreachable!("get() resolved while still pending"),
            State::Succeeded { response_bytes, .. } => Ok(response_bytes),
            State::Failed(error) => Err(error),
        }
    }

    /// Defined only after completion; 0 if the host never reported usage.
    pub fn get_cpu_megacycles(&self) -> u64 {
        match &*self.state.lock() {
            State::Succeeded { cpu_megacycles, .. } => cpu_megacycles.unwrap_or(0),
            _ => 0,
        }
    }

    /// Defined only after completion; falls back to the Future's own
    /// deadline (in milliseconds) if the host never reported a wallclock
    /// figure.
    pub fn get_wallclock_millis(&self, deadline_millis: u64) -> u64 {
        match &*self.state.lock() {
            State::Succeeded {
                wallclock_millis, ..
            } => *wallclock_millis,
            _ => deadline_millis,
        }
    }

    /// Resolves when the Future transitions out of `Pending`, for the
    /// dispatcher's completion listener to release the gate permit and
    /// retire the Future from the registry.
    pub fn wait_until_complete(&self) -> impl std::future::Future<Output = ()> + 'static {
        let mut rx = self.done_rx.clone();
        async move {
            let _ = rx.recv().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use api_host_client::CallContext;
    use runtime::testing::TestDriver;

    use super::*;

    fn descriptor() -> CallDescriptor {
        CallDescriptor {
            service: "datastore_v3".to_string(),
            method: "Get".to_string(),
        }
    }

    #[test]
    fn succeed_resolves_get() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.succeed(Bytes::from_static(b"value"), Some(7), 50);
        let result = td.run_until(future.get()).unwrap();
        assert_eq!(&result[..], b"value");
        assert_eq!(future.get_cpu_megacycles(), 7);
    }

    #[test]
    fn watchdog_fires_after_deadline_plus_padding() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(1.0),
            Duration::from_secs(1),
            Arc::new(|| i64::MAX),
        );
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(err, DispatchError::ApiDeadlineExceeded { .. }));
    }

    #[test]
    fn pre_failed_future_never_starts_a_watchdog() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::pre_failed(
            rt,
            descriptor(),
            CallContext::new(0.0),
            DispatchError::Cancelled {
                reason: CancelReason::DeadlineReached,
            },
        );
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Cancelled {
                reason: CancelReason::DeadlineReached
            }
        ));
    }

    #[test]
    fn cancel_without_interrupt_is_a_no_op() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        assert!(!future.cancel(false));
        assert!(future.is_pending());
    }

    #[test]
    fn cancel_attributes_to_interrupted_with_time_remaining() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| 10_000),
        );
        assert!(future.cancel(true));
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Cancelled {
                reason: CancelReason::Interrupted
            }
        ));
    }

    #[test]
    fn cancel_attributes_to_deadline_reached_near_expiry() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| 10),
        );
        assert!(future.cancel(true));
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Cancelled {
                reason: CancelReason::DeadlineReached
            }
        ));
    }

    #[test]
    fn datastore_concurrent_transaction_becomes_concurrent_modification() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.fail_from_host(HostFailure::application_error(2, "conflict"));
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(err, DispatchError::ConcurrentModification));
    }

    #[test]
    fn memcache_invalid_value_code_is_refined() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            CallDescriptor {
                service: "memcache".to_string(),
                method: "Set".to_string(),
            },
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.fail_from_host(HostFailure::application_error(6, "value too large"));
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidValue { .. }));
    }

    #[test]
    fn search_timeout_code_becomes_search_error() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            CallDescriptor {
                service: "search".to_string(),
                method: "Search".to_string(),
            },
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.fail_from_host(HostFailure::application_error(6, "index busy"));
        let err = td.run_until(future.get()).unwrap_err();
        match err {
            DispatchError::Search {
                operation, primary, ..
            } => {
                assert!(matches!(operation, errors::dispatch::SearchOperation::Search));
                assert!(matches!(
                    primary.code,
                    errors::dispatch::OperationStatusCode::Timeout
                ));
            },
            other => panic!("expected Search, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_application_error_code_stays_generic() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.fail_from_host(HostFailure::application_error(99, "weird"));
        let err = td.run_until(future.get()).unwrap_err();
        assert!(matches!(err, DispatchError::ApplicationError { code: 99, .. }));
    }

    #[test]
    fn cancel_after_terminal_state_is_a_no_op() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let future = ApiFuture::new(
            rt.clone(),
            descriptor(),
            CallContext::new(2.0),
            Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.succeed(Bytes::from_static(b"value"), None, 10);
        assert!(!future.cancel(true));
    }
}
