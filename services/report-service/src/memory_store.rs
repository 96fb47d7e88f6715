//! Process-local record store.
//!
//! Selected with a `memory://` database URL. State lives for the lifetime of
//! the process, which makes it suitable for local runs and tests only.

use crate::record_store::{
    NewReport, ProblemReport, RecordStore, ReportPatch, StaffCredential, StoreError, StoreResult,
    UpdatedReport,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    admins: BTreeMap<i64, StaffCredential>,
    problems: BTreeMap<i64, ProblemReport>,
    next_admin_id: i64,
    next_problem_id: i64,
}

/// In-memory record store with the same contract as the PostgreSQL one
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn has_staff(&self) -> StoreResult<bool> {
        Ok(!self.tables.read().await.admins.is_empty())
    }

    async fn find_staff_by_username(
        &self,
        username: &str,
    ) -> StoreResult<Option<StaffCredential>> {
        let tables = self.tables.read().await;
        Ok(tables
            .admins
            .values()
            .find(|staff| staff.username == username)
            .cloned())
    }

    async fn find_staff_by_id(&self, id: i64) -> StoreResult<Option<StaffCredential>> {
        Ok(self.tables.read().await.admins.get(&id).cloned())
    }

    async fn insert_staff(
        &self,
        username: &str,
        password_hash: &str,
    ) -> StoreResult<StaffCredential> {
        let mut tables = self.tables.write().await;
        if tables.admins.values().any(|staff| staff.username == username) {
            return Err(StoreError::Duplicate(format!("username '{username}'")));
        }

        tables.next_admin_id += 1;
        let staff = StaffCredential {
            id: tables.next_admin_id,
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at: Utc::now(),
        };
        tables.admins.insert(staff.id, staff.clone());
        Ok(staff)
    }

    async fn insert_report(&self, report: NewReport) -> StoreResult<ProblemReport> {
        let mut tables = self.tables.write().await;
        tables.next_problem_id += 1;

        let now = Utc::now();
        let stored = ProblemReport {
            id: tables.next_problem_id,
            room_id: report.room_id,
            category: report.category,
            user_name: report.user_name,
            user_status: report.user_status,
            user_phone: report.user_phone,
            user_email: report.user_email,
            problem_desc: report.problem_desc,
            img_path: report.img_path,
            status: report.status,
            reporter_token: report.reporter_token,
            created_at: now,
            updated_at: now,
        };
        tables.problems.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn get_report(&self, id: i64) -> StoreResult<Option<ProblemReport>> {
        Ok(self.tables.read().await.problems.get(&id).cloned())
    }

    async fn list_reports(&self) -> StoreResult<Vec<ProblemReport>> {
        let tables = self.tables.read().await;
        let mut reports: Vec<_> = tables.problems.values().cloned().collect();
        reports.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(reports)
    }

    async fn update_report(&self, id: i64, patch: &ReportPatch) -> StoreResult<UpdatedReport> {
        let mut tables = self.tables.write().await;
        let current = tables.problems.get(&id).ok_or(StoreError::NotFound)?;
        let previous_img_path = current.img_path.clone();

        // Work on a copy so the stored record is replaced in one step
        let mut updated = current.clone();
        updated.apply(patch);
        updated.updated_at = Utc::now();

        tables.problems.insert(id, updated.clone());
        Ok(UpdatedReport {
            report: updated,
            previous_img_path,
        })
    }

    async fn delete_report(&self, id: i64) -> StoreResult<ProblemReport> {
        self.tables
            .write()
            .await
            .problems
            .remove(&id)
            .ok_or(StoreError::NotFound)
    }
}
