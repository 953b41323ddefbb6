//! Per-request context: identity, trace, the soft-deadline clock,
//! the attribute map, the async-future registry, the ConcurrencyGate, and the
//! LogBatcher. One `Environment` is created per incoming request and shared
//! by reference with every thread the request spawns.
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        atomic::{
            AtomicU64,
            Ordering,
        },
        Arc,
    },
    time::Duration,
};

use api_future::ApiFuture;
use concurrency_gate::{
    ConcurrencyGate,
    ConcurrencyPermit,
    GateAcquireError,
};
use errors::{
    CancelReason,
    DispatchError,
};
use futures::{
    select_biased,
    FutureExt,
};
use log_batcher::LogBatcher;
use parking_lot::Mutex;
use request_context::{
    AppIdentity,
    SecurityTicket,
    TraceContext,
    UserIdentity,
};
use runtime::Runtime;

/// Sentinel `RemainingMillis()` value for a request with no soft deadline.
pub const REMAINING_MILLIS_INFINITE: i64 = i64::MAX;

/// The recognized `Environment` attribute keys. Unlisted keys are accepted
/// and stored opaquely.
pub mod attribute_keys {
    pub const API_DEADLINE: &str = "API_DEADLINE";
    pub const BACKGROUND_THREAD_REQUEST_DEADLINE: &str = "BACKGROUND_THREAD_REQUEST_DEADLINE";
    pub const USER_ID: &str = "USER_ID";
    pub const USER_ORGANIZATION: &str = "USER_ORGANIZATION";
    pub const GAIA_ID: &str = "GAIA_ID";
    pub const AUTH_USER: &str = "AUTH_USER";
    pub const GAIA_SESSION: &str = "GAIA_SESSION";
    pub const LOAS_PEER_USERNAME: &str = "LOAS_PEER_USERNAME";
    pub const LOAS_SECURITY_LEVEL: &str = "LOAS_SECURITY_LEVEL";
    pub const IS_TRUSTED_IP: &str = "IS_TRUSTED_IP";
    pub const REQUEST_LOG_ID: &str = "REQUEST_LOG_ID";
    pub const REQUEST_ID_HASH: &str = "REQUEST_ID_HASH";
    pub const DEFAULT_VERSION_HOSTNAME: &str = "DEFAULT_VERSION_HOSTNAME";
    pub const DATACENTER: &str = "DATACENTER";
    pub const APPSERVER_DATACENTER: &str = "APPSERVER_DATACENTER";
    pub const APPSERVER_TASK_BNS: &str = "APPSERVER_TASK_BNS";
    pub const APPS_NAMESPACE: &str = "APPS_NAMESPACE";
    pub const CURRENT_NAMESPACE: &str = "CURRENT_NAMESPACE";
    pub const REQUEST_THREAD_FACTORY: &str = "REQUEST_THREAD_FACTORY";
    pub const BACKGROUND_THREAD_FACTORY: &str = "BACKGROUND_THREAD_FACTORY";
    pub const CLOUD_SQL_JDBC_CONNECTIVITY_ENABLED: &str = "CLOUD_SQL_JDBC_CONNECTIVITY_ENABLED";
}

#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Number(f64),
    Text(String),
    Bool(bool),
}

struct ThreadSetState {
    accepting: bool,
    next_id: u64,
    active: HashSet<u64>,
}

/// A permit acquired via [`Environment::api_rpc_starting`]; releasing it is
/// the dispatcher's job via [`Environment::api_rpc_finished`], normally
/// attached to a Future's completion listener so pairing can't be missed.
pub struct RpcSlot(ConcurrencyPermit);

pub struct Environment<RT: Runtime> {
    rt: RT,
    pub app_identity: AppIdentity,
    pub security_ticket: SecurityTicket,
    pub user_identity: UserIdentity,
    trace: Mutex<TraceContext>,
    attributes: Mutex<HashMap<String, AttributeValue>>,
    registry: Mutex<HashMap<u64, Arc<ApiFuture<RT>>>>,
    next_future_id: AtomicU64,
    gate: ConcurrencyGate,
    log_batcher: LogBatcher<RT>,
    offline: bool,
    request_start: tokio::time::Instant,
    soft_deadline: Option<Duration>,
    thread_state: Mutex<ThreadSetState>,
}

impl<RT: Runtime> Environment<RT> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rt: RT,
        app_identity: AppIdentity,
        security_ticket: SecurityTicket,
        user_identity: UserIdentity,
        trace: TraceContext,
        gate: ConcurrencyGate,
        log_batcher: LogBatcher<RT>,
        offline: bool,
        soft_deadline_seconds: Option<f64>,
    ) -> Self {
        let request_start = rt.monotonic_now();
        Self {
            soft_deadline: soft_deadline_seconds.map(Duration::from_secs_f64),
            rt,
            app_identity,
            security_ticket,
            user_identity,
            trace: Mutex::new(trace),
            attributes: Mutex::new(HashMap::new()),
            registry: Mutex::new(HashMap::new()),
            next_future_id: AtomicU64::new(0),
            gate,
            log_batcher,
            offline,
            request_start,
            thread_state: Mutex::new(ThreadSetState {
                accepting: true,
                next_id: 0,
                active: HashSet::new(),
            }),
        }
    }

    pub fn rt(&self) -> &RT {
        &self.rt
    }

    pub fn is_offline(&self) -> bool {
        self.offline
    }

    pub fn trace_context(&self) -> TraceContext {
        self.trace.lock().clone()
    }

    pub fn log_batcher(&self) -> &LogBatcher<RT> {
        &self.log_batcher
    }

    /// `RemainingMillis()`: soft-deadline minus elapsed
    /// wallclock, or [`REMAINING_MILLIS_INFINITE`] if the request was given
    /// no soft deadline.
    pub fn remaining_millis(&self) -> i64 {
        let Some(soft_deadline) = self.soft_deadline else {
            return REMAINING_MILLIS_INFINITE;
        };
        let elapsed = self.rt.monotonic_now().saturating_duration_since(self.request_start);
        soft_deadline.saturating_sub(elapsed).as_millis() as i64
    }

    /// A closure suitable for `api_future::ApiFuture`'s cancellation
    /// attribution, snapshotting this Environment's soft-deadline clock.
    pub fn remaining_millis_fn(self: &Arc<Self>) -> api_future::RemainingMillisFn {
        let env = self.clone();
        Arc::new(move || env.remaining_millis())
    }

    /// Acquires a gate permit within `deadline_seconds` and returns the
    /// reduced deadline to issue the call with, plus the permit the
    /// dispatcher must later release via [`Self::api_rpc_finished`].
    pub async fn api_rpc_starting(
        &self,
        deadline_seconds: f64,
    ) -> Result<(f64, RpcSlot), DispatchError> {
        match self.gate.acquire(&self.rt, deadline_seconds).await {
            Ok((permit, waited_millis)) => {
                let reduced = (deadline_seconds - waited_millis as f64 / 1000.0).max(0.0);
                Ok((reduced, RpcSlot(permit)))
            },
            Err(GateAcquireError::DeadlineUsedUpAwaitingSlot) => Err(DispatchError::Cancelled {
                reason: CancelReason::DeadlineReached,
            }),
        }
    }

    /// Releases a permit acquired by `api_rpc_starting`. Dropping the slot
    /// does the same thing; this exists so call sites read as a pair.
    pub fn api_rpc_finished(&self, slot: RpcSlot) {
        drop(slot);
    }

    pub fn add_async_future(&self, future: Arc<ApiFuture<RT>>) -> u64 {
        let id = self.next_future_id.fetch_add(1, Ordering::SeqCst);
        self.registry.lock().insert(id, future);
        id
    }

    pub fn remove_async_future(&self, id: u64) -> Option<Arc<ApiFuture<RT>>> {
        self.registry.lock().remove(&id)
    }

    pub fn snapshot_async_futures(&self) -> Vec<Arc<ApiFuture<RT>>> {
        self.registry.lock().values().cloned().collect()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.lock().insert(key.into(), value);
    }

    pub fn get_attribute(&self, key: &str) -> Option<AttributeValue> {
        self.attributes.lock().get(key).cloned()
    }

    /// Stops accepting new `RequestThread`s. Called once the request is
    /// winding down; in-flight threads are unaffected.
    pub fn close_thread_set(&self) {
        self.thread_state.lock().accepting = false;
    }

    pub fn active_thread_count(&self) -> usize {
        self.thread_state.lock().active.len()
    }
}

/// `RequestThreadFactory.NewThread`: spawns a task that inherits
/// `env` and a child trace span, recorded in the Environment's thread set at
/// start and forgotten on exit.
pub struct RequestThreadFactory;

impl RequestThreadFactory {
    pub fn new_thread<RT, F, Fut>(env: &Arc<Environment<RT>>, runnable: F) -> Result<(), DispatchError>
    where
        RT: Runtime,
        F: FnOnce(Arc<Environment<RT>>, TraceContext) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let id = {
            let mut state = env.thread_state.lock();
            if !state.accepting {
                return Err(DispatchError::IllegalState {
                    detail: "request no longer accepts new threads".to_string(),
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.active.insert(id);
            id
        };
        let trace_context = env.trace_context().child_span();
        let env_for_body = env.clone();
        let env_for_cleanup = env.clone();
        let handle = env.rt.spawn("request_thread", async move {
            runnable(env_for_body, trace_context).await;
        });
        env.rt.spawn("request_thread_reaper", async move {
            let _ = runtime::shutdown_and_join(handle).await;
            env_for_cleanup.thread_state.lock().active.remove(&id);
        });
        Ok(())
    }
}

pub const DEFAULT_BACKGROUND_THREAD_DEADLINE: Duration = Duration::from_secs(30);

/// The host-side mechanism `BackgroundThreadFactory` calls out to: an
/// out-of-band RPC asking the host to stand up a new request context, whose
/// completion signals that a thread is ready on the host side.
#[async_trait::async_trait]
pub trait BackgroundRequestCoordinator: Send + Sync {
    async fn start_background_request(&self) -> anyhow::Result<()>;
}

/// `BackgroundThreadFactory.NewThread`. Blocks up to
/// `deadline` waiting for the coordinator to hand over a thread; on timeout
/// this is treated as a cancellation, since from the caller's perspective the
/// background request simply never started.
pub struct BackgroundThreadFactory;

impl BackgroundThreadFactory {
    pub async fn new_thread<RT: Runtime>(
        rt: &RT,
        coordinator: &dyn BackgroundRequestCoordinator,
        deadline: Duration,
    ) -> Result<(), DispatchError> {
        select_biased! {
            result = coordinator.start_background_request().fuse() => {
                result.map_err(|e| DispatchError::Internal {
                    service: "modules".to_string(),
                    method: "StartBackgroundRequest".to_string(),
                    detail: e.to_string(),
                })
            },
            _ = rt.wait(deadline).fuse() => Err(DispatchError::Cancelled {
                reason: CancelReason::Interrupted,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use log_batcher::LogBatcherConfig;
    use runtime::testing::TestDriver;

    use super::*;

    fn test_environment<RT: Runtime>(rt: RT) -> Arc<Environment<RT>> {
        let sink = log_batcher::testing::RecordingSink::new();
        Arc::new(Environment::new(
            rt.clone(),
            AppIdentity {
                application_id: "app".to_string(),
                module_id: "default".to_string(),
                version_id: "1".to_string(),
            },
            SecurityTicket::new(vec![0u8; 4]),
            UserIdentity::default(),
            TraceContext::root(),
            ConcurrencyGate::new(1),
            LogBatcher::new(rt, sink, LogBatcherConfig::online()),
            false,
            Some(2.0),
        ))
    }

    #[test]
    fn remaining_millis_counts_down_from_soft_deadline() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt);
        let before = env.remaining_millis();
        assert!(before <= 2000);
        assert!(before > 1000);
    }

    #[test]
    fn no_soft_deadline_is_infinite() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let sink = log_batcher::testing::RecordingSink::new();
        let env = Arc::new(Environment::new(
            rt.clone(),
            AppIdentity {
                application_id: "app".to_string(),
                module_id: "default".to_string(),
                version_id: "1".to_string(),
            },
            SecurityTicket::new(vec![]),
            UserIdentity::default(),
            TraceContext::root(),
            ConcurrencyGate::unlimited(),
            LogBatcher::new(rt, sink, LogBatcherConfig::online()),
            false,
            None,
        ));
        assert_eq!(env.remaining_millis(), REMAINING_MILLIS_INFINITE);
    }

    #[test]
    fn rpc_starting_reduces_deadline_by_wait_time() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt);
        let (reduced, slot) = td.run_until(env.api_rpc_starting(2.0)).unwrap();
        assert_eq!(reduced, 2.0);
        env.api_rpc_finished(slot);
    }

    #[test]
    fn attribute_map_round_trips() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt);
        env.set_attribute(attribute_keys::USER_ID, AttributeValue::Text("u1".to_string()));
        assert_eq!(
            env.get_attribute(attribute_keys::USER_ID),
            Some(AttributeValue::Text("u1".to_string()))
        );
    }

    #[test]
    fn async_future_registry_tracks_only_unobserved_futures() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt.clone());
        let future = ApiFuture::new(
            rt,
            api_future::CallDescriptor {
                service: "datastore_v3".to_string(),
                method: "Get".to_string(),
            },
            api_host_client::CallContext::new(2.0),
            Duration::from_secs(2),
            env.remaining_millis_fn(),
        );
        let id = env.add_async_future(future.clone());
        assert_eq!(env.snapshot_async_futures().len(), 1);
        future.succeed(bytes::Bytes::from_static(b"x"), None, 5);
        env.remove_async_future(id);
        assert!(env.snapshot_async_futures().is_empty());
    }

    #[test]
    fn closed_thread_set_rejects_new_threads() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt);
        env.close_thread_set();
        let started = Arc::new(AtomicBool::new(false));
        let started2 = started.clone();
        let err = RequestThreadFactory::new_thread(&env, move |_env, _trace| {
            started2.store(true, Ordering::SeqCst);
            async {}
        })
        .unwrap_err();
        assert!(matches!(err, DispatchError::IllegalState { .. }));
        assert!(!started.load(Ordering::SeqCst));
        drop(td);
    }
}
