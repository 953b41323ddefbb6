//! Transport-agnostic RPC to the service host. The dispatcher
//! never talks to a transport directly; it only ever calls through this
//! trait, so the same dispatcher code runs against a real host connection in
//! production and a scripted double in tests.
use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use request_context::{
    SecurityTicket,
    TraceContext,
};

/// One outstanding call's mutable context: its deadline and whether it has
/// been asked to cancel. Cheaply cloned; all clones share the same
/// cancellation flag.
#[derive(Clone)]
pub struct CallContext {
    deadline_seconds: f64,
    cancelled: Arc<AtomicBool>,
}

impl CallContext {
    pub fn new(deadline_seconds: f64) -> Self {
        Self {
            deadline_seconds,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn deadline_seconds(&self) -> f64 {
        self.deadline_seconds
    }

    /// Best-effort request to abandon the call. The transport observes this
    /// on its own schedule; it is not synchronous with the caller.
    pub fn start_cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// A call to the host, independent of wire format: the core never interprets
/// `request_bytes`, only routes it.
#[derive(Clone)]
pub struct HostRequest {
    pub service: String,
    pub method: String,
    pub security_ticket: SecurityTicket,
    pub request_bytes: Bytes,
    pub trace_context: Option<TraceContext>,
}

#[derive(Clone)]
pub struct HostResponse {
    pub response_bytes: Bytes,
    pub cpu_usage_megacycles: Option<u64>,
}

/// Failure classification surfaced by a call. Distinct from
/// `errors::DispatchError`: this is the raw transport-level status before
/// `api_future` translates it into the user-facing taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Ok,
    Cancelled,
    DeadlineExceeded,
    Unavailable,
    ApplicationError,
    Internal,
}

#[derive(Debug, Clone)]
pub struct HostFailure {
    pub status: CallStatus,
    pub application_error_code: Option<i32>,
    pub detail: String,
}

impl HostFailure {
    pub fn new(status: CallStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            application_error_code: None,
            detail: detail.into(),
        }
    }

    pub fn application_error(code: i32, detail: impl Into<String>) -> Self {
        Self {
            status: CallStatus::ApplicationError,
            application_error_code: Some(code),
            detail: detail.into(),
        }
    }
}

/// Exposed by the host connection. `disable`/`enable` are serialized against
/// each other and idempotent; in-flight calls are left to finish (or to be
/// refused by the transport on its own, surfacing `Unavailable`).
#[async_trait]
pub trait ApiHostClient: Send + Sync {
    async fn call(
        &self,
        ctx: &CallContext,
        request: HostRequest,
    ) -> Result<HostResponse, HostFailure>;

    fn disable(&self);

    fn enable(&self);
}

/// An in-memory host used by tests of everything layered above this crate:
/// dispatcher, api_future, transaction_core. Responses are supplied by a
/// caller-installed handler; `disable`/`enable` behave like a real transport
/// refusing new calls while `disabled`.
#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;

    pub type Handler =
        dyn Fn(&HostRequest) -> Result<HostResponse, HostFailure> + Send + Sync + 'static;

    pub struct ScriptedHostClient {
        enabled: Mutex<bool>,
        handler: Box<Handler>,
    }

    impl ScriptedHostClient {
        pub fn new(handler: impl Fn(&HostRequest) -> Result<HostResponse, HostFailure> + Send + Sync + 'static) -> Self {
            Self {
                enabled: Mutex::new(true),
                handler: Box::new(handler),
            }
        }

        pub fn always_succeeding(response_bytes: impl Into<Bytes> + Clone + Send + Sync + 'static) -> Self {
            Self::new(move |_| {
                Ok(HostResponse {
                    response_bytes: response_bytes.clone().into(),
                    cpu_usage_megacycles: Some(1),
                })
            })
        }
    }

    #[async_trait]
    impl ApiHostClient for ScriptedHostClient {
        async fn call(
            &self,
            ctx: &CallContext,
            request: HostRequest,
        ) -> Result<HostResponse, HostFailure> {
            if !*self.enabled.lock() {
                return Err(HostFailure::new(
                    CallStatus::Unavailable,
                    "host client is disabled",
                ));
            }
            if ctx.is_cancelled() {
                return Err(HostFailure::new(CallStatus::Cancelled, "call was cancelled"));
            }
            (self.handler)(&request)
        }

        fn disable(&self) {
            *self.enabled.lock() = false;
        }

        fn enable(&self) {
            *self.enabled.lock() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        testing::ScriptedHostClient,
        *,
    };

    fn request() -> HostRequest {
        HostRequest {
            service: "datastore_v3".to_string(),
            method: "Get".to_string(),
            security_ticket: SecurityTicket::new(vec![1, 2, 3]),
            request_bytes: Bytes::from_static(b"key"),
            trace_context: None,
        }
    }

    #[tokio::test]
    async fn disable_refuses_new_calls() {
        let client = ScriptedHostClient::always_succeeding(Bytes::from_static(b"ok"));
        client.disable();
        let ctx = CallContext::new(5.0);
        let err = client.call(&ctx, request()).await.unwrap_err();
        assert_eq!(err.status, CallStatus::Unavailable);
    }

    #[tokio::test]
    async fn enable_resumes_accepting_calls() {
        let client = ScriptedHostClient::always_succeeding(Bytes::from_static(b"ok"));
        client.disable();
        client.enable();
        let ctx = CallContext::new(5.0);
        let resp = client.call(&ctx, request()).await.unwrap();
        assert_eq!(&resp.response_bytes[..], b"ok");
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let client = ScriptedHostClient::always_succeeding(Bytes::from_static(b"ok"));
        let ctx = CallContext::new(5.0);
        ctx.start_cancel();
        let err = client.call(&ctx, request()).await.unwrap_err();
        assert_eq!(err.status, CallStatus::Cancelled);
    }
}
