//! The public façade user code calls into: resolves a deadline
//! via [`deadline_oracle::DeadlineOracle`], acquires a concurrency slot from
//! the request's [`environment::Environment`], issues the call through an
//! [`api_host_client::ApiHostClient`], and hands back an
//! [`api_future::ApiFuture`]. `MakeSyncCall` is the thin synchronous wrapper
//! every service stub (datastore, search, mail, ...) is built on top of.
use std::{
    sync::Arc,
    time::Duration,
};

use api_future::{
    ApiFuture,
    CallDescriptor,
};
use api_host_client::{
    ApiHostClient,
    CallContext,
    HostRequest,
};
use bytes::Bytes;
use deadline_oracle::{
    DeadlineOracle,
    RequestClass,
};
use environment::{
    attribute_keys,
    AttributeValue,
    Environment,
};
use errors::{
    CancelReason,
    DispatchError,
};
use metrics::{
    log_counter_with_labels,
    register_app_counter,
    register_app_histogram,
    MetricLabel,
    StatusTimer,
};
use runtime::Runtime;

mod metrics_defs {
    use super::*;

    register_app_histogram!(
        DISPATCH_CALL_SECONDS,
        "Time from MakeAsyncCall to the Future reaching a terminal state",
        &["service", "status"]
    );
    register_app_counter!(
        DISPATCH_CALLS_TOTAL,
        "Calls dispatched to the service host, by service and outcome",
        &["service", "status"]
    );

    pub fn call_timer(service: &str) -> StatusTimer {
        let mut t = StatusTimer::new(&DISPATCH_CALL_SECONDS);
        t.add_label(MetricLabel::new("service", service.to_string()));
        t
    }

    pub fn log_call_outcome(service: &str, status: &'static str) {
        log_counter_with_labels(
            &DISPATCH_CALLS_TOTAL,
            1,
            vec![
                MetricLabel::new("service", service.to_string()),
                MetricLabel::new("status", status),
            ],
        );
    }
}

/// Per-call configuration passed to `MakeAsyncCall`, distinct from the
/// `Environment`-wide `API_DEADLINE` attribute: a caller can override the
/// deadline for one specific call without touching the whole request's
/// default. When `user_deadline_seconds` is `None`, `make_async_call` falls
/// back to the `Environment`'s `API_DEADLINE` attribute before letting the
/// `DeadlineOracle` apply its package default.
#[derive(Debug, Clone, Default)]
pub struct CallConfig {
    pub user_deadline_seconds: Option<f64>,
}

impl CallConfig {
    pub fn with_deadline_seconds(seconds: f64) -> Self {
        Self {
            user_deadline_seconds: Some(seconds),
        }
    }
}

pub struct Dispatcher<RT: Runtime> {
    rt: RT,
    oracle: Arc<DeadlineOracle>,
    host: Arc<dyn ApiHostClient>,
}

impl<RT: Runtime> Dispatcher<RT> {
    pub fn new(rt: RT, oracle: Arc<DeadlineOracle>, host: Arc<dyn ApiHostClient>) -> Self {
        Self { rt, oracle, host }
    }

    /// `MakeSyncCall`: resolves the deadline, dispatches
    /// asynchronously, then blocks on the result. The bound on this wait is
    /// entirely the Future's own watchdog; there is no separate sync-only
    /// timeout layer.
    pub async fn make_sync_call(
        &self,
        env: &Arc<Environment<RT>>,
        service: impl Into<String>,
        method: impl Into<String>,
        request_bytes: Bytes,
    ) -> Result<Bytes, DispatchError> {
        let future = self
            .make_async_call(env, service, method, request_bytes, CallConfig::default())
            .await;
        future.get().await
    }

    /// `MakeAsyncCall`, the nine-step dispatch procedure.
    pub async fn make_async_call(
        &self,
        env: &Arc<Environment<RT>>,
        service: impl Into<String>,
        method: impl Into<String>,
        request_bytes: Bytes,
        call_config: CallConfig,
    ) -> Arc<ApiFuture<RT>> {
        let service = service.into();
        let method = method.into();
        let class = if env.is_offline() {
            RequestClass::Offline
        } else {
            RequestClass::Online
        };
        // Step 1: resolve the deadline. A per-call override in `call_config`
        // wins; otherwise fall back to the request-wide `API_DEADLINE`
        // attribute before letting the Oracle apply its own package default.
        let user_seconds = call_config
            .user_deadline_seconds
            .or_else(|| match env.get_attribute(attribute_keys::API_DEADLINE) {
                Some(AttributeValue::Number(seconds)) => Some(seconds),
                _ => None,
            });
        let resolved_seconds = self.oracle.resolve(&service, class, user_seconds);

        // Step 2: open a child trace span, if this request carries one.
        let trace_context = env.trace_context().child_span();

        let descriptor = CallDescriptor {
            service: service.clone(),
            method: method.clone(),
        };

        // Step 3: acquire a concurrency slot, reducing the deadline by the
        // time spent waiting for one.
        let (reduced_seconds, slot) = match env.api_rpc_starting(resolved_seconds).await {
            Ok(pair) => pair,
            Err(gate_error) => {
                metrics_defs::log_call_outcome(&service, "gate_timeout");
                return ApiFuture::pre_failed(
                    self.rt.clone(),
                    descriptor,
                    CallContext::new(0.0),
                    gate_error,
                );
            },
        };

        // Step 4: a deadline used up entirely by the gate wait never issues
        // an RPC.
        if reduced_seconds <= 0.0 {
            env.api_rpc_finished(slot);
            metrics_defs::log_call_outcome(&service, "deadline_exhausted");
            return ApiFuture::pre_failed(
                self.rt.clone(),
                descriptor,
                CallContext::new(0.0),
                DispatchError::Cancelled {
                    reason: CancelReason::DeadlineReached,
                },
            );
        }

        // Steps 5-6: build the host request and its mutable call context.
        let ctx = CallContext::new(reduced_seconds);
        let request = HostRequest {
            service: service.clone(),
            method: method.clone(),
            security_ticket: env.security_ticket.clone(),
            request_bytes,
            trace_context: Some(trace_context),
        };

        // Step 7: construct and register the Future.
        let future = ApiFuture::new(
            self.rt.clone(),
            descriptor,
            ctx.clone(),
            Duration::from_secs_f64(reduced_seconds),
            env.remaining_millis_fn(),
        );
        let future_id = env.add_async_future(future.clone());

        // Step 8: issue the host call; its callback resolves the Future.
        let host = self.host.clone();
        let call_future = future.clone();
        let call_service = service.clone();
        let started_at = self.rt.monotonic_now();
        let rt_for_elapsed = self.rt.clone();
        self.rt.spawn("dispatcher_host_call", async move {
            let timer = metrics_defs::call_timer(&call_service);
            match host.call(&ctx, request).await {
                Ok(response) => {
                    let wallclock_millis = rt_for_elapsed
                        .monotonic_now()
                        .saturating_duration_since(started_at)
                        .as_millis() as u64;
                    call_future.succeed(
                        response.response_bytes,
                        response.cpu_usage_megacycles,
                        wallclock_millis,
                    );
                    timer.finish();
                },
                Err(failure) => {
                    call_future.fail_from_host(failure);
                    timer.finish_with("host_failure");
                },
            }
        });

        // Step 9: release the gate slot and retire the Future from the
        // registry as soon as it completes, wherever the completion came
        // from (the host callback, the watchdog, or an explicit cancel).
        let completion_env = env.clone();
        let completion_future = future.clone();
        self.rt.spawn("dispatcher_completion_listener", async move {
            completion_future.wait_until_complete().await;
            completion_env.api_rpc_finished(slot);
            completion_env.remove_async_future(future_id);
        });

        future
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use api_host_client::{
        testing::ScriptedHostClient,
        CallStatus,
        HostFailure,
    };
    use environment::attribute_keys;
    use request_context::{
        AppIdentity,
        SecurityTicket,
        TraceContext,
        UserIdentity,
    };
    use runtime::testing::TestDriver;

    use super::*;

    fn test_environment<RT: Runtime>(rt: RT, offline: bool) -> Arc<Environment<RT>> {
        let sink = log_batcher::testing::RecordingSink::new();
        Arc::new(Environment::new(
            rt.clone(),
            AppIdentity {
                application_id: "app".to_string(),
                module_id: "default".to_string(),
                version_id: "1".to_string(),
            },
            SecurityTicket::new(vec![1, 2, 3]),
            UserIdentity::default(),
            TraceContext::root(),
            concurrency_gate::ConcurrencyGate::new(4),
            log_batcher::LogBatcher::new(rt, sink, log_batcher::LogBatcherConfig::online()),
            offline,
            Some(10.0),
        ))
    }

    #[test]
    fn online_get_with_user_deadline_succeeds() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt.clone(), false);
        env.set_attribute(
            attribute_keys::API_DEADLINE,
            environment::AttributeValue::Number(2.0),
        );
        let host = Arc::new(ScriptedHostClient::always_succeeding(Bytes::from_static(b"value")));
        let dispatcher = Dispatcher::new(rt, Arc::new(DeadlineOracle::new()), host);

        let future = td.run_until(dispatcher.make_async_call(
            &env,
            "datastore_v3",
            "Get",
            Bytes::from_static(b"key"),
            CallConfig::default(),
        ));
        // The `API_DEADLINE` attribute set above, not the package default of
        // 60.0, must be what the Oracle resolved to.
        assert_eq!(future.call_context().deadline_seconds(), 2.0);
        let result = td.run_until(future.get());
        assert_eq!(&result.unwrap()[..], b"value");
        assert!(env.snapshot_async_futures().is_empty());
    }

    #[test]
    fn online_urlfetch_clamps_to_service_max() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt.clone(), false);
        let host = Arc::new(ScriptedHostClient::always_succeeding(Bytes::from_static(b"page")));
        let dispatcher = Dispatcher::new(rt, Arc::new(DeadlineOracle::new()), host);

        let future = td.run_until(dispatcher.make_async_call(
            &env,
            "urlfetch",
            "Fetch",
            Bytes::new(),
            CallConfig::with_deadline_seconds(90.0),
        ));
        assert_eq!(future.call_context().deadline_seconds(), 60.0);
    }

    #[test]
    fn zero_capacity_gate_fails_with_deadline_reached_and_issues_no_rpc() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt.clone(), false);
        // `test_environment` gives the gate 4 permits; hold all of them so
        // the dispatcher's own acquire has none left to take.
        let _held: Vec<_> = (0..4)
            .map(|_| td.run_until(env.api_rpc_starting(10.0)).unwrap())
            .collect();
        let host = Arc::new(ScriptedHostClient::new(|_| {
            panic!("no RPC should be issued once the deadline is exhausted by the gate wait")
        }));
        let dispatcher = Dispatcher::new(rt, Arc::new(DeadlineOracle::new()), host);

        let err = td
            .run_until(dispatcher.make_sync_call(
                &env,
                "datastore_v3",
                "Get",
                Bytes::from_static(b"key"),
            ))
            .unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Cancelled {
                reason: CancelReason::DeadlineReached
            }
        ));
    }

    #[test]
    fn host_application_error_is_translated() {
        let mut td = TestDriver::new();
        let rt = td.rt();
        let env = test_environment(rt.clone(), true);
        let host = Arc::new(ScriptedHostClient::new(|_| {
            Err(HostFailure {
                status: CallStatus::ApplicationError,
                application_error_code: Some(42),
                detail: "entity too large".to_string(),
            })
        }));
        let dispatcher = Dispatcher::new(rt, Arc::new(DeadlineOracle::new()), host);

        let err = td
            .run_until(dispatcher.make_sync_call(
                &env,
                "datastore_v3",
                "Put",
                Bytes::new(),
            ))
            .unwrap_err();
        match err {
            DispatchError::ApplicationError { code, .. } => assert_eq!(code, 42),
            other => panic!("expected ApplicationError, got {other:?}"),
        }
    }
}
