//! In-memory implementations of the persistence seams, used by pipeline and
//! handler tests in place of Postgres and the hosted identity provider.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tbs_core::{RelationKind, StoreRecord, SyncRunSummary};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    AssignmentChange, AssignmentState, Directory, DirectoryError, IdentityProvider, NewAccount,
    NewUserProfile, ProvisionError, StoreUpsert, UserProfile, UserProfileUpdate,
};

#[derive(Debug, Clone)]
struct MemoryAssignment {
    manager_id: Uuid,
    subject_id: Uuid,
    active: bool,
}

#[derive(Default)]
struct DirectoryState {
    users: Vec<UserProfile>,
    stores: Vec<(Uuid, StoreRecord)>,
    assignments: HashMap<RelationKind, Vec<MemoryAssignment>>,
    logs: Vec<SyncRunSummary>,
}

/// Mirror of [`crate::PgDirectory`] semantics over plain vectors.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<DirectoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn users(&self) -> Vec<UserProfile> {
        self.state.lock().await.users.clone()
    }

    pub async fn stores(&self) -> Vec<StoreRecord> {
        self.state
            .lock()
            .await
            .stores
            .iter()
            .map(|(_, store)| store.clone())
            .collect()
    }

    pub async fn logs(&self) -> Vec<SyncRunSummary> {
        self.state.lock().await.logs.clone()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> Result<Option<UserProfile>, DirectoryError> {
        let state = self.state.lock().await;
        Ok(state.users.iter().find(|u| u.email == email).cloned())
    }

    async fn insert_user(&self, user: &NewUserProfile) -> Result<Uuid, DirectoryError> {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        state.users.push(UserProfile {
            id,
            email: user.email.clone(),
            username: user.username.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            role: user.role,
            active: true,
        });
        Ok(id)
    }

    async fn update_user(
        &self,
        id: Uuid,
        update: &UserProfileUpdate,
    ) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some(user) = state.users.iter_mut().find(|u| u.id == id) {
            user.username = update.username.clone();
            user.first_name = update.first_name.clone();
            user.last_name = update.last_name.clone();
            user.role = update.role;
            user.active = true;
        }
        Ok(())
    }

    async fn upsert_store(&self, store: &StoreRecord) -> Result<StoreUpsert, DirectoryError> {
        let mut state = self.state.lock().await;
        if let Some((id, existing)) = state
            .stores
            .iter_mut()
            .find(|(_, existing)| existing.code == store.code)
        {
            existing.name = store.name.clone();
            existing.region = store.region.clone();
            return Ok(StoreUpsert {
                id: *id,
                created: false,
            });
        }
        let id = Uuid::new_v4();
        state.stores.push((id, store.clone()));
        Ok(StoreUpsert { id, created: true })
    }

    async fn find_store_by_code(&self, code: &str) -> Result<Option<Uuid>, DirectoryError> {
        let state = self.state.lock().await;
        Ok(state
            .stores
            .iter()
            .find(|(_, store)| store.code == code)
            .map(|(id, _)| *id))
    }

    async fn activate_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<AssignmentChange, DirectoryError> {
        let mut state = self.state.lock().await;
        let rows = state.assignments.entry(kind).or_default();
        if let Some(row) = rows
            .iter_mut()
            .find(|row| row.manager_id == manager_id && row.subject_id == subject_id)
        {
            if row.active {
                return Ok(AssignmentChange::Unchanged);
            }
            row.active = true;
            return Ok(AssignmentChange::Reactivated);
        }
        rows.push(MemoryAssignment {
            manager_id,
            subject_id,
            active: true,
        });
        Ok(AssignmentChange::Created)
    }

    async fn deactivate_assignments_except(
        &self,
        kind: RelationKind,
        keep: &[(Uuid, Uuid)],
    ) -> Result<u32, DirectoryError> {
        let mut state = self.state.lock().await;
        let rows = state.assignments.entry(kind).or_default();
        let mut deactivated = 0u32;
        for row in rows.iter_mut() {
            if row.active && !keep.contains(&(row.manager_id, row.subject_id)) {
                row.active = false;
                deactivated += 1;
            }
        }
        Ok(deactivated)
    }

    async fn find_assignment(
        &self,
        kind: RelationKind,
        manager_id: Uuid,
        subject_id: Uuid,
    ) -> Result<Option<AssignmentState>, DirectoryError> {
        let state = self.state.lock().await;
        Ok(state
            .assignments
            .get(&kind)
            .and_then(|rows| {
                rows.iter()
                    .find(|row| row.manager_id == manager_id && row.subject_id == subject_id)
            })
            .map(|row| AssignmentState { active: row.active }))
    }

    async fn insert_sync_log(&self, summary: &SyncRunSummary) -> Result<(), DirectoryError> {
        let mut state = self.state.lock().await;
        state.logs.push(summary.clone());
        Ok(())
    }

    async fn recent_sync_logs(&self, limit: i64) -> Result<Vec<SyncRunSummary>, DirectoryError> {
        let state = self.state.lock().await;
        Ok(state
            .logs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}

/// Fake auth service: records every provisioned account and can be primed to
/// reject specific emails for failure-path tests.
#[derive(Default)]
pub struct MemoryIdentityProvider {
    created: Mutex<Vec<NewAccount>>,
    reject: Mutex<HashSet<String>>,
}

impl MemoryIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject_email(&self, email: &str) {
        self.reject.lock().await.insert(email.to_string());
    }

    pub async fn created_accounts(&self) -> Vec<NewAccount> {
        self.created.lock().await.clone()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentityProvider {
    async fn ensure_account(&self, account: &NewAccount) -> Result<(), ProvisionError> {
        if self.reject.lock().await.contains(&account.email) {
            return Err(ProvisionError::Rejected {
                email: account.email.clone(),
                status: 422,
                message: "rejected by test configuration".to_string(),
            });
        }
        self.created.lock().await.push(account.clone());
        Ok(())
    }
}
