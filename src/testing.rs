//! Test helpers: a migrated temp-file database and a fault-injecting wrapper.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::db::libsql::LibSqlBackend;
use crate::db::{
    ActionQuery, ActionRecord, ActionStore, Database, EntityRecord, EntityState, EntityStore,
    EntityTable, NewActionRecord, NewEntity, NewProposal, ProposalRecord, ProposalStore,
    ProposalTransition,
};
use crate::error::DatabaseError;

/// Fresh, migrated libSQL database in a temp dir. Keep the `TempDir` alive.
pub(crate) async fn test_db() -> (Arc<dyn Database>, TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let backend = LibSqlBackend::new_local(&dir.path().join("ledger-test.db"))
        .await
        .expect("open libsql");
    backend.run_migrations().await.expect("migrations");
    (Arc::new(backend), dir)
}

fn injected(what: &str) -> DatabaseError {
    DatabaseError::Query(format!("injected {what} failure"))
}

/// Wraps a real backend and fails or delays selected calls.
pub(crate) struct FaultyDb {
    inner: Arc<dyn Database>,
    fail_action_appends: AtomicBool,
    fail_fetches: AtomicBool,
    fail_updates: AtomicBool,
    /// 1-based index of the insert that should fail; 0 disables.
    fail_insert_at: AtomicUsize,
    inserts_seen: AtomicUsize,
    fetch_gate: Mutex<Option<Arc<Barrier>>>,
    gated_fetches_left: AtomicUsize,
}

impl FaultyDb {
    pub(crate) fn new(inner: Arc<dyn Database>) -> Self {
        Self {
            inner,
            fail_action_appends: AtomicBool::new(false),
            fail_fetches: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
            fail_insert_at: AtomicUsize::new(0),
            inserts_seen: AtomicUsize::new(0),
            fetch_gate: Mutex::new(None),
            gated_fetches_left: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_action_appends(&self, on: bool) {
        self.fail_action_appends.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_fetches(&self, on: bool) {
        self.fail_fetches.store(on, Ordering::SeqCst);
    }

    pub(crate) fn fail_updates(&self, on: bool) {
        self.fail_updates.store(on, Ordering::SeqCst);
    }

    /// Fail the `n`th entity insert counted from now.
    pub(crate) fn fail_insert_number(&self, n: usize) {
        self.inserts_seen.store(0, Ordering::SeqCst);
        self.fail_insert_at.store(n, Ordering::SeqCst);
    }

    /// The next `parties` entity fetches each read, then wait for one another.
    pub(crate) fn gate_fetches(&self, parties: usize) {
        *self.fetch_gate.lock().expect("gate lock") = Some(Arc::new(Barrier::new(parties)));
        self.gated_fetches_left.store(parties, Ordering::SeqCst);
    }

    fn take_gate(&self) -> Option<Arc<Barrier>> {
        self.gated_fetches_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        self.fetch_gate.lock().expect("gate lock").clone()
    }
}

#[async_trait]
impl EntityStore for FaultyDb {
    async fn insert_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        input: &NewEntity,
    ) -> Result<EntityRecord, DatabaseError> {
        let seen = self.inserts_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if seen == self.fail_insert_at.load(Ordering::SeqCst) {
            return Err(injected("insert"));
        }
        self.inner.insert_entity(table, user_id, input).await
    }

    async fn get_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        if self.fail_fetches.load(Ordering::SeqCst) {
            return Err(injected("fetch"));
        }
        let gate = self.take_gate();
        let result = self.inner.get_entity(table, user_id, id).await;
        if let Some(barrier) = gate {
            barrier.wait().await;
        }
        result
    }

    async fn update_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
        state: &EntityState,
    ) -> Result<Option<EntityRecord>, DatabaseError> {
        if self.fail_updates.load(Ordering::SeqCst) {
            return Err(injected("update"));
        }
        self.inner.update_entity(table, user_id, id, state).await
    }

    async fn delete_entity(
        &self,
        table: EntityTable,
        user_id: &str,
        id: Uuid,
    ) -> Result<bool, DatabaseError> {
        self.inner.delete_entity(table, user_id, id).await
    }

    async fn find_entities_by_attribute(
        &self,
        table: EntityTable,
        user_id: &str,
        key: &str,
        value: &str,
        limit: i64,
    ) -> Result<Vec<EntityRecord>, DatabaseError> {
        self.inner
            .find_entities_by_attribute(table, user_id, key, value, limit)
            .await
    }
}

#[async_trait]
impl ActionStore for FaultyDb {
    async fn append_action(&self, input: &NewActionRecord) -> Result<ActionRecord, DatabaseError> {
        if self.fail_action_appends.load(Ordering::SeqCst) {
            return Err(injected("action append"));
        }
        self.inner.append_action(input).await
    }

    async fn get_action(
        &self,
        user_id: Option<&str>,
        id: Uuid,
    ) -> Result<Option<ActionRecord>, DatabaseError> {
        self.inner.get_action(user_id, id).await
    }

    async fn list_actions(
        &self,
        user_id: &str,
        query: &ActionQuery,
    ) -> Result<Vec<ActionRecord>, DatabaseError> {
        self.inner.list_actions(user_id, query).await
    }

    async fn mark_action_rolled_back(
        &self,
        id: Uuid,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        self.inner.mark_action_rolled_back(id, reason, at).await
    }
}

#[async_trait]
impl ProposalStore for FaultyDb {
    async fn insert_proposal(
        &self,
        user_id: &str,
        input: &NewProposal,
    ) -> Result<ProposalRecord, DatabaseError> {
        self.inner.insert_proposal(user_id, input).await
    }

    async fn get_proposal(
        &self,
        user_id: &str,
        id: Uuid,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        self.inner.get_proposal(user_id, id).await
    }

    async fn find_proposal_by_idempotency_key(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        self.inner
            .find_proposal_by_idempotency_key(user_id, key)
            .await
    }

    async fn transition_proposal(
        &self,
        user_id: &str,
        id: Uuid,
        transition: &ProposalTransition,
    ) -> Result<Option<ProposalRecord>, DatabaseError> {
        self.inner.transition_proposal(user_id, id, transition).await
    }
}

#[async_trait]
impl Database for FaultyDb {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        self.inner.run_migrations().await
    }
}
