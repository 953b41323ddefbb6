//! Identity and trace-propagation types carried by an `Environment`,
//! but useful on their own wherever a request crosses an async boundary
//! (logging, RPC headers, metrics).
use std::{
    fmt,
    str::FromStr,
};

use rand::Rng;

/// Opaque, per-request id minted at request start. Unlike `ExecutionId`,
/// there is exactly one `RequestId` per incoming request even if that request
/// issues many API calls.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        let bytes = rand::thread_rng().gen::<[u8; 8]>();
        Self(hex::encode(bytes))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for RequestId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RequestId(s.to_string()))
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies one outstanding API call for log correlation: a single request
/// can have many of these (one per `MakeAsyncCall`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
pub struct ExecutionId(String);

impl ExecutionId {
    pub fn new() -> Self {
        let bytes = rand::thread_rng().gen::<[u8; 16]>();
        Self(hex::encode(bytes))
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trace propagation carried alongside a `CallDescriptor`: a trace
/// id shared across an entire request, a span id unique to this call, and an
/// optional parent span for nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
}

impl TraceContext {
    pub fn root() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            trace_id: hex::encode(rng.gen::<[u8; 16]>()),
            span_id: hex::encode(rng.gen::<[u8; 8]>()),
            parent_span_id: None,
        }
    }

    /// Derive a child span sharing this context's trace id.
    pub fn child_span(&self) -> Self {
        let span_id = hex::encode(rand::thread_rng().gen::<[u8; 8]>());
        Self {
            trace_id: self.trace_id.clone(),
            span_id,
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// Opaque bytes handed to `ApiHostClient` to authenticate a call as acting on
/// behalf of a specific request.
#[derive(Clone, PartialEq, Eq)]
pub struct SecurityTicket(Vec<u8>);

impl SecurityTicket {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SecurityTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecurityTicket({} bytes, redacted)", self.0.len())
    }
}

/// The caller's identity, as established by the front-end before the request
/// reached this dispatcher. `None` fields mean "not established", not
/// "anonymous" -- `email.is_none()` is the usual signal for an unauthenticated
/// caller.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserIdentity {
    pub email: Option<String>,
    pub is_admin: bool,
    pub auth_domain: Option<String>,
    pub gaia_id: Option<String>,
}

/// Which application/module/version this request is executing, mirroring the
/// three-part key every managed-runtime request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppIdentity {
    pub application_id: String,
    pub module_id: String,
    pub version_id: String,
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn request_ids_are_unique() {
        assert_ne!(RequestId::new(), RequestId::new());
    }

    #[test]
    fn request_id_round_trips_through_string() {
        let id = RequestId::new();
        let parsed = RequestId::from_str(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn child_span_shares_trace_id_and_records_parent() {
        let root = TraceContext::root();
        let child = root.child_span();
        assert_eq!(root.trace_id, child.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
        assert_ne!(root.span_id, child.span_id);
    }
}
