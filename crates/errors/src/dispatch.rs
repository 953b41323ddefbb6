//! The error taxonomy the call dispatcher surfaces to user code. Every
//! variant here is a *kind*, not a wire type: individual services may attach
//! additional detail by nesting one of these inside their own error enum, but
//! the dispatcher itself only ever produces one of these kinds.
use std::fmt;

/// Why a `Cancelled` was observed. Lets callers tell "the request's overall
/// deadline elapsed" apart from "someone explicitly canceled this call".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    DeadlineReached,
    Interrupted,
    UserRequested,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DeadlineReached => "deadline reached",
            Self::Interrupted => "interrupted",
            Self::UserRequested => "user requested",
        };
        f.write_str(s)
    }
}

/// Per-item status used by batch-oriented services (search put/delete/get).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatusCode {
    Ok,
    InvalidRequest,
    TransientError,
    InternalError,
    PermissionDenied,
    Timeout,
    ConcurrentTransaction,
}

impl OperationStatusCode {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

/// One entry in a batch result: the per-item outcome of a search put, delete,
/// or get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub code: OperationStatusCode,
    pub message: Option<String>,
}

impl OperationResult {
    pub fn ok() -> Self {
        Self {
            code: OperationStatusCode::Ok,
            message: None,
        }
    }

    pub fn failed(code: OperationStatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// The error kinds a call to `Dispatcher::MakeSyncCall` /
/// `Dispatcher::MakeAsyncCall` can surface to user code.
#[derive(thiserror::Error, Debug, Clone)]
pub enum DispatchError {
    /// User-supplied inputs failed local validation (null key, negative
    /// count, offset+cursor both set, ...). Never issues an RPC.
    #[error("invalid argument: {detail}")]
    InvalidArgument { detail: String },

    /// The operation was attempted in a state that forbids it: a transaction
    /// not in `Begun`, a thread factory used after the request ended, a log
    /// batch appended to after close.
    #[error("illegal state: {detail}")]
    IllegalState { detail: String },

    /// The call did not complete. `reason` disambiguates an elapsed overall
    /// deadline from an explicit `Cancel(interrupt=true)`.
    #[error("cancelled ({reason})")]
    Cancelled { reason: CancelReason },

    /// The per-call deadline elapsed before the host replied.
    #[error("{service}.{method} exceeded its deadline")]
    ApiDeadlineExceeded { service: String, method: String },

    /// The host executed the call and returned a service-specific failure.
    #[error("{service}.{method} failed with application error {code}: {detail}")]
    ApplicationError {
        service: String,
        method: String,
        code: i32,
        detail: String,
    },

    /// The transport is down, or the client has been `Disable()`d.
    #[error("{service}.{method} is unavailable")]
    ServiceUnavailable { service: String, method: String },

    /// An unexpected host or transport failure that doesn't fit any of the
    /// above.
    #[error("{service}.{method} failed internally: {detail}")]
    Internal {
        service: String,
        method: String,
        detail: String,
    },

    /// datastore_v3/v4: the requested entity does not exist.
    #[error("entity not found")]
    EntityNotFound,

    /// datastore_v3/v4: the transaction conflicted with a concurrent write.
    #[error("concurrent modification")]
    ConcurrentModification,

    /// datastore_v3/v4: the commit RPC itself failed (surfaced to the user;
    /// see `RollbackFailed` for the absorbed counterpart).
    #[error("commit failed: {detail}")]
    CommitFailed { detail: String },

    /// datastore_v3/v4: the rollback RPC failed. Always absorbed (logged,
    /// not raised) by `TransactionCore::rollback`; the variant exists so the
    /// log line carries a structured cause.
    #[error("rollback failed: {detail}")]
    RollbackFailed { detail: String },

    /// search: a put/delete/get/search batch call failed, or partially
    /// failed. `primary` is the call-level status; `per_item` carries the
    /// individual outcomes for entries that were attempted.
    #[error("search {operation} failed: {primary:?}")]
    Search {
        operation: SearchOperation,
        primary: OperationResult,
        per_item: Vec<OperationResult>,
    },

    /// memcache: the provided value could not be stored (too large, wrong
    /// flags, etc).
    #[error("invalid memcache value: {detail}")]
    InvalidValue { detail: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOperation {
    Put,
    Delete,
    Get,
    Search,
}

impl fmt::Display for SearchOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Put => "Put",
            Self::Delete => "Delete",
            Self::Get => "Get",
            Self::Search => "Search",
        };
        f.write_str(s)
    }
}

impl DispatchError {
    pub fn service_method(&self) -> Option<(&str, &str)> {
        match self {
            Self::ApiDeadlineExceeded { service, method }
            | Self::ApplicationError {
                service, method, ..
            }
            | Self::ServiceUnavailable { service, method }
            | Self::Internal {
                service, method, ..
            } => Some((service, method)),
            _ => None,
        }
    }

    /// Locally recoverable errors the dispatcher itself absorbs rather than
    /// raising: a gate-acquisition timeout becomes `Cancelled{DeadlineReached}`
    /// and a failed rollback is logged, never rethrown.
    pub fn is_user_visible(&self) -> bool {
        !matches!(self, Self::RollbackFailed { .. })
    }
}
