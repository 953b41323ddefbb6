//! Error classification shared by every crate in this workspace.
//!
//! `ErrorMetadata` is attached to an `anyhow::Error` chain via `.context(..)`
//! to tag it with an HTTP-ish status class and a short, stable tag usable in
//! tests and metrics. `dispatch` builds the call-dispatcher-specific error
//! taxonomy on top of this generic classification.
#![feature(let_chains)]
use std::borrow::Cow;

pub mod dispatch;

pub use dispatch::{
    CancelReason,
    DispatchError,
    OperationResult,
    OperationStatusCode,
    SearchOperation,
};

/// `ErrorMetadata` can be attached to an anyhow error chain via
/// `.context(e /* ErrorMetadata */)`. It tags errors with information used to
/// classify them for clients and for metrics.
///
/// `msg` is surfaced as a user-facing message if it reaches the client.
/// `short_msg` is a stable, ScreamingCamelCase tag usable in tests and metrics
/// without being sensitive to changes in the human-readable copy.
#[derive(thiserror::Error, Clone, Debug, PartialEq, Eq)]
#[error("{msg}")]
pub struct ErrorMetadata {
    pub code: ErrorCode,
    pub short_msg: Cow<'static, str>,
    pub msg: Cow<'static, str>,
}

#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    BadRequest,
    Unauthenticated,
    Forbidden,
    NotFound,
    ClientDisconnect,
    Overloaded,
    OperationalInternalServerError,
}

impl ErrorMetadata {
    /// Bad Request. Maps to 400 in HTTP.
    pub fn bad_request(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::BadRequest,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Resource not found. Maps to 404 in HTTP.
    pub fn not_found(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::NotFound,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Not authenticated. Maps to 401 in HTTP.
    pub fn unauthenticated(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Unauthenticated,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Forbidden. Maps to 403 in HTTP.
    pub fn forbidden(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Forbidden,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    /// Client disconnected the connection.
    pub fn client_disconnect() -> Self {
        Self {
            code: ErrorCode::ClientDisconnect,
            short_msg: "ClientDisconnected".into(),
            msg: "Client disconnected".into(),
        }
    }

    /// Internal error with a user-visible message indicating the request was
    /// rejected due to a defensive limit rather than a developer mistake.
    /// Maps to 503 in HTTP.
    pub fn overloaded(
        short_msg: impl Into<Cow<'static, str>>,
        msg: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            code: ErrorCode::Overloaded,
            short_msg: short_msg.into(),
            msg: msg.into(),
        }
    }

    pub fn operational_internal_server_error() -> Self {
        Self {
            code: ErrorCode::OperationalInternalServerError,
            short_msg: "InternalServerError".into(),
            msg: "Our engineering team has been notified. Please reach out if the issue \
                  persists."
                .into(),
        }
    }

    pub fn is_bad_request(&self) -> bool {
        self.code == ErrorCode::BadRequest
    }

    pub fn is_overloaded(&self) -> bool {
        self.code == ErrorCode::Overloaded
    }

    pub fn is_forbidden(&self) -> bool {
        self.code == ErrorCode::Forbidden
    }

    pub fn should_report_to_sentry(&self) -> Option<sentry::Level> {
        match self.code {
            ErrorCode::ClientDisconnect => None,
            ErrorCode::BadRequest
            | ErrorCode::NotFound
            | ErrorCode::Unauthenticated
            | ErrorCode::Forbidden => Some(sentry::Level::Info),
            ErrorCode::Overloaded | ErrorCode::OperationalInternalServerError => {
                Some(sentry::Level::Warning)
            },
        }
    }
}

/// Extension trait for pulling `ErrorMetadata` back out of an `anyhow` chain,
/// mirroring how callers attach it with `.context(..)`.
pub trait ErrorMetadataAnyhowExt {
    fn error_metadata(&self) -> Option<&ErrorMetadata>;
    fn is_bad_request(&self) -> bool {
        self.error_metadata().is_some_and(|e| e.is_bad_request())
    }
}

impl ErrorMetadataAnyhowExt for anyhow::Error {
    fn error_metadata(&self) -> Option<&ErrorMetadata> {
        self.chain().find_map(|e| e.downcast_ref::<ErrorMetadata>())
    }
}

pub fn report_error(e: &mut anyhow::Error) {
    tracing::error!("{e:?}");
    if let Some(metadata) = e.error_metadata()
        && metadata.should_report_to_sentry().is_none()
    {
        return;
    }
    #[allow(clippy::disallowed_methods)]
    sentry::integrations::anyhow::capture_anyhow(e);
}
