//! Per-service interpretation of the host's `application_error_code`.
//!
//! The transport only tells us a bare integer and a service/method name; the
//! meaning of that integer is defined by whichever service proto it came
//! from. These tables are the well-known datastore_v3/v4, memcache, and
//! search error-code enums, used to refine a generic
//! `DispatchError::ApplicationError` into the specific kind callers actually
//! want to match on.
use errors::{
    DispatchError,
    OperationResult,
    OperationStatusCode,
    SearchOperation,
};

mod datastore_v3 {
    pub const CONCURRENT_TRANSACTION: i32 = 2;
}

mod memcache {
    pub const INVALID_VALUE: i32 = 6;
}

mod search {
    pub const TRANSIENT_ERROR: i32 = 2;
    pub const INTERNAL_ERROR: i32 = 3;
    pub const PERMISSION_DENIED: i32 = 4;
    pub const TIMEOUT: i32 = 6;
    pub const CONCURRENT_TRANSACTION: i32 = 7;
}

fn search_operation(method: &str) -> SearchOperation {
    if method.eq_ignore_ascii_case("delete") || method.eq_ignore_ascii_case("deletedocument") {
        SearchOperation::Delete
    } else if method.eq_ignore_ascii_case("get") || method.eq_ignore_ascii_case("listdocuments") {
        SearchOperation::Get
    } else if method.eq_ignore_ascii_case("search") {
        SearchOperation::Search
    } else {
        SearchOperation::Put
    }
}

fn search_status(code: i32) -> Option<OperationStatusCode> {
    match code {
        search::TRANSIENT_ERROR => Some(OperationStatusCode::TransientError),
        search::INTERNAL_ERROR => Some(OperationStatusCode::InternalError),
        search::PERMISSION_DENIED => Some(OperationStatusCode::PermissionDenied),
        search::TIMEOUT => Some(OperationStatusCode::Timeout),
        search::CONCURRENT_TRANSACTION => Some(OperationStatusCode::ConcurrentTransaction),
        _ => None,
    }
}

/// Refines a generic application error into the specific per-service
/// `DispatchError` variant, when `service`/`code` are recognized; otherwise
/// returns `None` and the caller falls back to
/// `DispatchError::ApplicationError`.
pub fn refine(service: &str, method: &str, code: i32, detail: &str) -> Option<DispatchError> {
    match service {
        "datastore_v3" | "datastore_v4" if code == datastore_v3::CONCURRENT_TRANSACTION => {
            Some(DispatchError::ConcurrentModification)
        },
        "memcache" if code == memcache::INVALID_VALUE => Some(DispatchError::InvalidValue {
            detail: detail.to_string(),
        }),
        "search" => search_status(code).map(|status_code| {
            let primary = OperationResult::failed(status_code, detail.to_string());
            DispatchError::Search {
                operation: search_operation(method),
                primary,
                // The transport surfaces one failure per call; no per-item
                // breakdown is available below `api_future`.
                per_item: Vec::new(),
            }
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datastore_concurrent_transaction_refines_to_concurrent_modification() {
        let err = refine("datastore_v3", "Commit", 2, "conflict").unwrap();
        assert!(matches!(err, DispatchError::ConcurrentModification));
    }

    #[test]
    fn memcache_invalid_value_code_refines() {
        let err = refine("memcache", "Set", 6, "value too large").unwrap();
        assert!(matches!(err, DispatchError::InvalidValue { .. }));
    }

    #[test]
    fn search_timeout_refines_with_operation_kind() {
        let err = refine("search", "DeleteDocument", 6, "slow").unwrap();
        match err {
            DispatchError::Search {
                operation, primary, ..
            } => {
                assert_eq!(operation, SearchOperation::Delete);
                assert_eq!(primary.code, OperationStatusCode::Timeout);
            },
            other => panic!("expected Search, got {other:?}"),
        }
    }

    #[test]
    fn unrecognized_code_falls_through_to_none() {
        assert!(refine("datastore_v3", "Commit", 999, "?").is_none());
        assert!(refine("unknown_service", "Whatever", 1, "?").is_none());
    }
}
