//! The storage service's scoped-transaction state machine:
//! `Begun -> CompletionInProgress -> { Committed | RolledBack | Error }`,
//! with a direct `Begun -> Error` edge if preparation fails. Built the same
//! way `api_future::ApiFuture` enforces "transitions at most once": a mutex
//! guarding an enum, checked-and-set under one lock acquisition.
//!
//! Transactions have single-thread affinity: the thread that calls
//! [`Transaction::begin`] is the only one that should drive it. Nested
//! scopes resolve "the current transaction" through a thread-local stack of
//! ids plus a [`TransactionRegistry`] of weak references, rather than a
//! strong back-reference from thread to transaction, so a transaction that
//! has gone out of scope can still be dropped instead of being pinned alive
//! by the thread-local.
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        Weak,
    },
};

use api_future::ApiFuture;
use api_host_client::HostFailure;
use errors::DispatchError;
use metrics::{
    log_counter,
    register_app_counter,
    register_app_histogram,
    StatusTimer,
    STATUS_LABEL,
};
use parking_lot::Mutex;
use request_context::RequestId;
use runtime::Runtime;

mod metrics_defs {
    use super::*;

    register_app_histogram!(
        TRANSACTION_COMMIT_SECONDS,
        "Time spent draining futures and issuing the commit RPC for a transaction",
        &STATUS_LABEL
    );
    register_app_counter!(
        TRANSACTION_ROLLBACK_RPC_FAILURES_TOTAL,
        "Rollback RPCs that failed and were absorbed rather than raised"
    );

    pub fn commit_timer() -> StatusTimer {
        StatusTimer::new(&TRANSACTION_COMMIT_SECONDS)
    }

    pub fn log_absorbed_rollback_failure() {
        log_counter(&TRANSACTION_ROLLBACK_RPC_FAILURES_TOTAL, 1);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionId(String);

impl TransactionId {
    pub fn new(request_id: &RequestId, sequence: u64) -> Self {
        Self(format!("{request_id}:{sequence}"))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Begun,
    CompletionInProgress,
    Committed,
    RolledBack,
    Error,
}

/// Abstraction over the host RPCs a transaction issues once its registered
/// futures have drained, mirroring how [`api_host_client::ApiHostClient`]
/// abstracts an individual call.
#[async_trait::async_trait]
pub trait TransactionHost: Send + Sync {
    async fn commit(&self, application_id: &str, txn: &TransactionId) -> Result<(), HostFailure>;
    async fn rollback(&self, application_id: &str, txn: &TransactionId) -> Result<(), HostFailure>;
}

enum PostCommitCallback {
    Put(Box<dyn FnOnce() + Send>),
    Delete(Box<dyn FnOnce() + Send>),
}

impl PostCommitCallback {
    fn run(self) {
        match self {
            Self::Put(f) | Self::Delete(f) => f(),
        }
    }
}

/// One scoped storage transaction. Owned by the thread that created it;
/// registry entries let other code resolve "the current transaction"
/// without the transaction holding a reference back to its owning thread or
/// `Environment`.
pub struct Transaction<RT: Runtime> {
    pub application_id: String,
    pub id: TransactionId,
    state: Mutex<TransactionState>,
    registry: Mutex<Vec<Arc<ApiFuture<RT>>>>,
    post_commit: Mutex<Vec<PostCommitCallback>>,
    host: Arc<dyn TransactionHost>,
}

impl<RT: Runtime> Transaction<RT> {
    pub fn begin(application_id: impl Into<String>, id: TransactionId, host: Arc<dyn TransactionHost>) -> Arc<Self> {
        Arc::new(Self {
            application_id: application_id.into(),
            id,
            state: Mutex::new(TransactionState::Begun),
            registry: Mutex::new(Vec::new()),
            post_commit: Mutex::new(Vec::new()),
            host,
        })
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    fn require_begun(&self) -> Result<(), DispatchError> {
        if *self.state.lock() != TransactionState::Begun {
            return Err(DispatchError::IllegalState {
                detail: format!("transaction {} is not in state Begun", self.id),
            });
        }
        Ok(())
    }

    /// Appends a write operation's Future to this transaction's registry, to
    /// be drained before commit/rollback. Fails if the transaction has
    /// already left `Begun`.
    pub fn register_operation(&self, future: Arc<ApiFuture<RT>>) -> Result<(), DispatchError> {
        self.require_begun()?;
        self.registry.lock().push(future);
        Ok(())
    }

    pub fn register_post_put_callback(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), DispatchError> {
        self.require_begun()?;
        self.post_commit.lock().push(PostCommitCallback::Put(Box::new(callback)));
        Ok(())
    }

    pub fn register_post_delete_callback(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), DispatchError> {
        self.require_begun()?;
        self.post_commit
            .lock()
            .push(PostCommitCallback::Delete(Box::new(callback)));
        Ok(())
    }

    pub fn registered_operation_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Awaits every registered Future, returning the drained errors in
    /// registration order. The registry is emptied either way: a drained
    /// Future has been observed and is no longer outstanding.
    async fn drain(&self) -> Vec<DispatchError> {
        let futures = std::mem::take(&mut *self.registry.lock());
        let mut errors = Vec::new();
        for future in futures {
            if let Err(e) = future.get().await {
                errors.push(e);
            }
        }
        errors
    }

    /// Commit procedure: drain registered futures, issue the
    /// commit RPC, run post-commit callbacks in order. If any drained future
    /// failed, the first failure is returned and the rest are logged; the
    /// commit RPC is never issued and the transaction ends in `Error`.
    pub async fn commit(self: &Arc<Self>) -> Result<(), DispatchError> {
        self.require_begun()?;
        let timer = metrics_defs::commit_timer();

        let mut errors = self.drain().await;
        if !errors.is_empty() {
            *self.state.lock() = TransactionState::Error;
            let first = errors.remove(0);
            for rest in &errors {
                tracing::error!(
                    transaction_id = %self.id,
                    "transaction {} commit: drained future failed (not raised): {rest}",
                    self.id
                );
            }
            return Err(first);
        }

        *self.state.lock() = TransactionState::CompletionInProgress;
        match self.host.commit(&self.application_id, &self.id).await {
            Ok(()) => {
                *self.state.lock() = TransactionState::Committed;
                timer.finish();
                for callback in std::mem::take(&mut *self.post_commit.lock()) {
                    callback.run();
                }
                Ok(())
            },
            Err(failure) => {
                *self.state.lock() = TransactionState::Error;
                Err(DispatchError::CommitFailed {
                    detail: failure.detail,
                })
            },
        }
    }

    /// Rollback procedure: same drain, but every failure --
    /// including the rollback RPC itself -- is logged and absorbed rather
    /// than raised, so user code never needs to wrap a rollback in its own
    /// error handling. Only an attempt to roll back a transaction that has
    /// already left `Begun` is reported to the caller.
    pub async fn rollback(self: &Arc<Self>) -> Result<(), DispatchError> {
        self.require_begun()?;

        for error in self.drain().await {
            tracing::warn!(transaction_id = %self.id, "transaction {} rollback: drained future failed: {error}", self.id);
        }

        *self.state.lock() = TransactionState::CompletionInProgress;
        match self.host.rollback(&self.application_id, &self.id).await {
            Ok(()) => {
                *self.state.lock() = TransactionState::RolledBack;
            },
            Err(failure) => {
                *self.state.lock() = TransactionState::Error;
                metrics_defs::log_absorbed_rollback_failure();
                tracing::error!(
                    transaction_id = %self.id,
                    "transaction {} rollback RPC failed (absorbed): {}",
                    self.id,
                    failure.detail,
                );
            },
        }
        Ok(())
    }
}

/// Maps transaction ids to weak handles, so the per-thread "current
/// transaction" stack (see [`scope`]) can resolve a live transaction without
/// holding a strong reference that would keep a completed transaction alive.
pub struct TransactionRegistry<RT: Runtime> {
    entries: Mutex<HashMap<TransactionId, Weak<Transaction<RT>>>>,
}

impl<RT: Runtime> TransactionRegistry<RT> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, txn: &Arc<Transaction<RT>>) {
        self.entries.lock().insert(txn.id.clone(), Arc::downgrade(txn));
    }

    pub fn remove(&self, id: &TransactionId) {
        self.entries.lock().remove(id);
    }

    pub fn get(&self, id: &TransactionId) -> Option<Arc<Transaction<RT>>> {
        self.entries.lock().get(id).and_then(Weak::upgrade)
    }
}

impl<RT: Runtime> Default for TransactionRegistry<RT> {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static CURRENT_STACK: RefCell<Vec<TransactionId>> = const { RefCell::new(Vec::new()) };
}

/// The per-thread stack of in-scope transaction ids, so nested scopes can
/// resolve the current transaction. Entering a nested scope pushes; leaving
/// it pops -- callers typically do this via a guard, see [`enter`].
pub mod scope {
    use super::*;

    pub fn push(id: TransactionId) {
        CURRENT_STACK.with(|stack| stack.borrow_mut().push(id));
    }

    pub fn pop() {
        CURRENT_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
    }

    pub fn current() -> Option<TransactionId> {
        CURRENT_STACK.with(|stack| stack.borrow().last().cloned())
    }
}

/// RAII guard pushing `id` onto the current thread's transaction stack for
/// the lifetime of the guard.
pub struct ScopeGuard;

impl ScopeGuard {
    pub fn enter(id: TransactionId) -> Self {
        scope::push(id);
        Self
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        scope::pop();
    }
}

/// Resolves the current thread's innermost transaction, if any is both
/// in-scope and still live in `registry`.
pub fn current_transaction<RT: Runtime>(registry: &TransactionRegistry<RT>) -> Option<Arc<Transaction<RT>>> {
    scope::current().and_then(|id| registry.get(&id))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{
        AtomicUsize,
        Ordering,
    };

    use api_host_client::CallContext;
    use bytes::Bytes;
    use runtime::testing::TestDriver;

    use super::*;

    struct FakeHost {
        commit_result: Result<(), HostFailure>,
        rollback_result: Result<(), HostFailure>,
    }

    #[async_trait::async_trait]
    impl TransactionHost for FakeHost {
        async fn commit(&self, _application_id: &str, _txn: &TransactionId) -> Result<(), HostFailure> {
            self.commit_result.clone()
        }

        async fn rollback(&self, _application_id: &str, _txn: &TransactionId) -> Result<(), HostFailure> {
            self.rollback_result.clone()
        }
    }

    fn succeeding_future(td: &mut TestDriver) -> Arc<ApiFuture<runtime::testing::TestRuntime>> {
        let rt = td.rt();
        let future = ApiFuture::new(
            rt,
            api_future::CallDescriptor {
                service: "datastore_v3".to_string(),
                method: "Put".to_string(),
            },
            CallContext::new(2.0),
            std::time::Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.succeed(Bytes::new(), None, 5);
        future
    }

    fn failing_future(td: &mut TestDriver) -> Arc<ApiFuture<runtime::testing::TestRuntime>> {
        let rt = td.rt();
        let future = ApiFuture::new(
            rt,
            api_future::CallDescriptor {
                service: "datastore_v3".to_string(),
                method: "Put".to_string(),
            },
            CallContext::new(2.0),
            std::time::Duration::from_secs(2),
            Arc::new(|| i64::MAX),
        );
        future.fail(DispatchError::ApplicationError {
            service: "datastore_v3".to_string(),
            method: "Put".to_string(),
            code: 1,
            detail: "boom".to_string(),
        });
        future
    }

    #[test]
    fn commit_drains_futures_runs_callbacks_and_reaches_committed() {
        let mut td = TestDriver::new();
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Ok(()),
        });
        let txn = Transaction::<runtime::testing::TestRuntime>::begin(
            "app",
            TransactionId::new(&RequestId::new(), 0),
            host,
        );
        let f1 = succeeding_future(&mut td);
        let f2 = succeeding_future(&mut td);
        txn.register_operation(f1).unwrap();
        txn.register_operation(f2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        txn.register_post_put_callback(move || {
            ran2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        td.run_until(txn.commit()).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(txn.registered_operation_count(), 0);
    }

    #[test]
    fn commit_rethrows_first_failure_logs_rest_and_skips_rpc() {
        let mut td = TestDriver::new();
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Ok(()),
        });
        let txn = Transaction::<runtime::testing::TestRuntime>::begin(
            "app",
            TransactionId::new(&RequestId::new(), 0),
            host,
        );
        let f1 = failing_future(&mut td);
        let f2 = failing_future(&mut td);
        txn.register_operation(f1).unwrap();
        txn.register_operation(f2).unwrap();

        let err = td.run_until(txn.commit()).unwrap_err();
        assert!(matches!(err, DispatchError::ApplicationError { .. }));
        assert_eq!(txn.state(), TransactionState::Error);
    }

    #[test]
    fn rollback_absorbs_rpc_failure_and_never_raises() {
        let mut td = TestDriver::new();
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Err(HostFailure::new(api_host_client::CallStatus::Unavailable, "down")),
        });
        let txn = Transaction::<runtime::testing::TestRuntime>::begin(
            "app",
            TransactionId::new(&RequestId::new(), 0),
            host,
        );
        td.run_until(txn.rollback()).unwrap();
        assert_eq!(txn.state(), TransactionState::Error);
    }

    #[test]
    fn rollback_succeeds_when_rpc_succeeds() {
        let mut td = TestDriver::new();
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Ok(()),
        });
        let txn = Transaction::<runtime::testing::TestRuntime>::begin(
            "app",
            TransactionId::new(&RequestId::new(), 0),
            host,
        );
        td.run_until(txn.rollback()).unwrap();
        assert_eq!(txn.state(), TransactionState::RolledBack);
    }

    #[test]
    fn commit_after_terminal_state_fails_illegal_state() {
        let mut td = TestDriver::new();
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Ok(()),
        });
        let txn = Transaction::<runtime::testing::TestRuntime>::begin(
            "app",
            TransactionId::new(&RequestId::new(), 0),
            host,
        );
        td.run_until(txn.commit()).unwrap();
        let err = td.run_until(txn.commit()).unwrap_err();
        assert!(matches!(err, DispatchError::IllegalState { .. }));
    }

    #[test]
    fn scope_stack_resolves_current_transaction() {
        let host = Arc::new(FakeHost {
            commit_result: Ok(()),
            rollback_result: Ok(()),
        });
        let registry = TransactionRegistry::<runtime::testing::TestRuntime>::new();
        let txn = Transaction::begin("app", TransactionId::new(&RequestId::new(), 0), host);
        registry.insert(&txn);
        assert!(current_transaction(&registry).is_none());
        let guard = ScopeGuard::enter(txn.id.clone());
        assert_eq!(current_transaction(&registry).unwrap().id, txn.id);
        drop(guard);
        assert!(current_transaction(&registry).is_none());
    }
}
