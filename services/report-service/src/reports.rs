use crate::attachments::{AttachmentStore, UploadedFile};
use crate::credentials::StaffIdentity;
use crate::error::{ServiceError, ServiceResult};
use crate::record_store::{
    NewReport, ProblemReport, RecordStore, ReportPatch, ReportStatus, UpdatedReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Report fields as submitted, before validation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportFields {
    pub room_id: Option<String>,
    pub category: Option<String>,
    pub user_name: Option<String>,
    pub user_status: Option<String>,
    pub user_phone: Option<String>,
    pub user_email: Option<String>,
    pub problem_desc: Option<String>,
    pub reporter_token: Option<String>,
    /// Only honoured for staff submissions
    pub status: Option<String>,
}

/// Report as shown to the public, without contact details
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublicReportView {
    pub id: i64,
    pub room_id: String,
    pub category: Option<String>,
    pub user_name: Option<String>,
    pub user_status: Option<String>,
    pub problem_desc: Option<String>,
    pub img_path: Option<String>,
    pub status: ReportStatus,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl From<ProblemReport> for PublicReportView {
    fn from(r: ProblemReport) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id,
            category: r.category,
            user_name: r.user_name,
            user_status: r.user_status,
            problem_desc: r.problem_desc,
            img_path: r.img_path,
            status: r.status,
            timestamp: r.created_at,
        }
    }
}

/// Report as shown to staff, contact details included
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StaffReportView {
    pub id: i64,
    pub room_id: String,
    pub category: Option<String>,
    pub user_name: Option<String>,
    pub user_status: Option<String>,
    pub user_phone: Option<String>,
    pub user_email: Option<String>,
    pub problem_desc: Option<String>,
    pub img_path: Option<String>,
    pub status: ReportStatus,
    pub timestamp: DateTime<Utc>,
}

impl From<ProblemReport> for StaffReportView {
    fn from(r: ProblemReport) -> Self {
        Self {
            id: r.id,
            room_id: r.room_id,
            category: r.category,
            user_name: r.user_name,
            user_status: r.user_status,
            user_phone: r.user_phone,
            user_email: r.user_email,
            problem_desc: r.problem_desc,
            img_path: r.img_path,
            status: r.status,
            timestamp: r.created_at,
        }
    }
}

/// Problem report lifecycle: submission, listing, triage and removal
pub struct ReportService {
    store: Arc<dyn RecordStore>,
    attachments: Arc<AttachmentStore>,
}

impl ReportService {
    pub fn new(store: Arc<dyn RecordStore>, attachments: Arc<AttachmentStore>) -> Self {
        Self { store, attachments }
    }

    /// Public submission. Any supplied status is ignored.
    #[instrument(skip_all, fields(room_id = ?fields.room_id))]
    pub async fn submit_public(
        &self,
        fields: ReportFields,
        image: Option<UploadedFile>,
    ) -> ServiceResult<i64> {
        let report = self.create(fields, ReportStatus::Pending, image).await?;
        info!(report_id = report.id, "Public report submitted");
        Ok(report.id)
    }

    /// Staff submission. A supplied status is kept, defaulting to pending.
    #[instrument(skip_all, fields(room_id = ?fields.room_id, staff_id = staff.id))]
    pub async fn submit_as_staff(
        &self,
        fields: ReportFields,
        image: Option<UploadedFile>,
        staff: &StaffIdentity,
    ) -> ServiceResult<i64> {
        let status = fields
            .status
            .as_deref()
            .map(str::parse::<ReportStatus>)
            .transpose()
            .map_err(|e| ServiceError::Validation(e.to_string()))?
            .unwrap_or_default();

        let report = self.create(fields, status, image).await?;
        info!(report_id = report.id, status = %report.status, "Staff report submitted");
        Ok(report.id)
    }

    async fn create(
        &self,
        fields: ReportFields,
        status: ReportStatus,
        image: Option<UploadedFile>,
    ) -> ServiceResult<ProblemReport> {
        let room_id = fields
            .room_id
            .ok_or_else(|| ServiceError::Validation("room_id is required".to_string()))?;

        let img_path = self.attachments.store(image.as_ref()).await?;

        let new_report = NewReport {
            room_id,
            category: fields.category,
            user_name: fields.user_name,
            user_status: fields.user_status,
            user_phone: fields.user_phone,
            user_email: fields.user_email,
            problem_desc: fields.problem_desc,
            img_path: img_path.clone(),
            status,
            reporter_token: fields.reporter_token,
        };

        match self.store.insert_report(new_report).await {
            Ok(report) => {
                metrics::counter!("reports.created").increment(1);
                Ok(report)
            }
            Err(e) => {
                if let Some(path) = &img_path {
                    self.attachments.remove(path).await;
                }
                Err(e.into())
            }
        }
    }

    /// All reports, newest first, contact details removed
    pub async fn list_public(&self) -> ServiceResult<Vec<PublicReportView>> {
        let reports = self.store.list_reports().await?;
        Ok(reports.into_iter().map(Into::into).collect())
    }

    /// All reports, newest first, every field included
    pub async fn list_for_staff(&self, staff: &StaffIdentity) -> ServiceResult<Vec<StaffReportView>> {
        let reports = self.store.list_reports().await?;
        debug!(staff_id = staff.id, count = reports.len(), "Staff listed reports");
        Ok(reports.into_iter().map(Into::into).collect())
    }

    /// Overwrite the fields present in `patch` and optionally the attachment
    #[instrument(skip(self, patch, image, staff), fields(staff_id = staff.id))]
    pub async fn update(
        &self,
        id: i64,
        mut patch: ReportPatch,
        image: Option<UploadedFile>,
        staff: &StaffIdentity,
    ) -> ServiceResult<ProblemReport> {
        if self.store.get_report(id).await?.is_none() {
            return Err(ServiceError::NotFound);
        }

        let new_img_path = self.attachments.store(image.as_ref()).await?;
        patch.img_path = new_img_path.clone();

        let UpdatedReport {
            report: updated,
            previous_img_path,
        } = match self.store.update_report(id, &patch).await {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "Report update rolled back");
                if let Some(path) = &new_img_path {
                    self.attachments.remove(path).await;
                }
                return Err(e.into());
            }
        };

        // The replaced image is unreachable once the new path is committed
        if let (Some(_), Some(previous)) = (&new_img_path, &previous_img_path) {
            self.attachments.remove(previous).await;
        }

        metrics::counter!("reports.updated").increment(1);
        info!(status = %updated.status, "Report updated");
        Ok(updated)
    }

    /// Remove a report and its attachment
    #[instrument(skip(self, staff), fields(staff_id = staff.id))]
    pub async fn delete(&self, id: i64, staff: &StaffIdentity) -> ServiceResult<()> {
        let removed = self.store.delete_report(id).await?;

        if let Some(path) = &removed.img_path {
            self.attachments.remove(path).await;
        }

        metrics::counter!("reports.deleted").increment(1);
        info!("Report deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryRecordStore;
    use crate::record_store::{MockRecordStore, StoreError};
    use axum::body::Bytes;
    use std::time::Duration;
    use tempfile::TempDir;

    fn staff() -> StaffIdentity {
        StaffIdentity {
            id: 1,
            username: "admin".to_string(),
        }
    }

    fn fields(room_id: &str) -> ReportFields {
        ReportFields {
            room_id: Some(room_id.to_string()),
            category: Some("plumbing".to_string()),
            user_name: Some("Tee".to_string()),
            user_phone: Some("0812345678".to_string()),
            user_email: Some("tee@example.com".to_string()),
            problem_desc: Some("leak".to_string()),
            ..Default::default()
        }
    }

    fn image(name: &str) -> Option<UploadedFile> {
        Some(UploadedFile {
            file_name: name.to_string(),
            bytes: Bytes::from_static(b"GIF89a"),
        })
    }

    async fn service_with(store: Arc<dyn RecordStore>) -> (ReportService, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let attachments = Arc::new(AttachmentStore::new(dir.path()).await.unwrap());
        (ReportService::new(store, attachments), dir)
    }

    async fn memory_service() -> (ReportService, Arc<dyn RecordStore>, TempDir) {
        let store: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
        let (service, dir) = service_with(store.clone()).await;
        (service, store, dir)
    }

    fn files_in(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path()).unwrap().count()
    }

    #[tokio::test]
    async fn test_public_submission_forces_pending() {
        let (service, store, _dir) = memory_service().await;
        let mut input = fields("A101");
        input.status = Some("completed".to_string());

        let id = service.submit_public(input, None).await.unwrap();

        let stored = store.get_report(id).await.unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Pending);
        assert_eq!(stored.img_path, None);
    }

    #[tokio::test]
    async fn test_staff_submission_keeps_status() {
        let (service, store, _dir) = memory_service().await;

        for status in ReportStatus::ALL {
            let mut input = fields("A101");
            input.status = Some(status.as_str().to_string());
            let id = service.submit_as_staff(input, None, &staff()).await.unwrap();
            assert_eq!(store.get_report(id).await.unwrap().unwrap().status, status);
        }

        let id = service
            .submit_as_staff(fields("A102"), None, &staff())
            .await
            .unwrap();
        assert_eq!(
            store.get_report(id).await.unwrap().unwrap().status,
            ReportStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_staff_submission_rejects_unknown_status() {
        let (service, store, _dir) = memory_service().await;
        let mut input = fields("A101");
        input.status = Some("archived".to_string());

        assert!(matches!(
            service.submit_as_staff(input, None, &staff()).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(store.list_reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_room_id_is_rejected_before_upload() {
        let (service, _store, dir) = memory_service().await;
        let mut input = fields("A101");
        input.room_id = None;

        assert!(matches!(
            service.submit_public(input, image("photo.png")).await,
            Err(ServiceError::Validation(_))
        ));
        assert_eq!(files_in(&dir), 0);
    }

    #[tokio::test]
    async fn test_attachment_allow_list() {
        let (service, store, _dir) = memory_service().await;

        let rejected = service
            .submit_public(fields("A101"), image("photo.EXE"))
            .await
            .unwrap();
        let accepted = service
            .submit_public(fields("A101"), image("photo.JPG"))
            .await
            .unwrap();

        assert_eq!(store.get_report(rejected).await.unwrap().unwrap().img_path, None);
        let img_path = store.get_report(accepted).await.unwrap().unwrap().img_path.unwrap();
        assert!(img_path.starts_with("/uploads/"));
        assert!(img_path.ends_with("_photo.JPG"));
    }

    #[tokio::test]
    async fn test_views_redact_contact_fields() {
        let (service, _store, _dir) = memory_service().await;
        service.submit_public(fields("A101"), None).await.unwrap();

        let public = serde_json::to_value(service.list_public().await.unwrap()).unwrap();
        let staff_view = serde_json::to_value(service.list_for_staff(&staff()).await.unwrap()).unwrap();

        assert!(public[0].get("user_phone").is_none());
        assert!(public[0].get("user_email").is_none());
        assert_eq!(staff_view[0]["user_phone"], "0812345678");
        assert_eq!(staff_view[0]["user_email"], "tee@example.com");
        assert_eq!(public[0]["status"], "pending");
    }

    #[tokio::test]
    async fn test_status_only_update_leaves_other_fields() {
        let (service, store, _dir) = memory_service().await;
        let id = service.submit_public(fields("A101"), None).await.unwrap();
        let before = store.get_report(id).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let patch = ReportPatch {
            status: Some(ReportStatus::Completed),
            ..Default::default()
        };
        let after = service.update(id, patch, None, &staff()).await.unwrap();

        assert_eq!(after.status, ReportStatus::Completed);
        assert!(after.updated_at > before.updated_at);
        assert_eq!(
            ProblemReport {
                status: before.status,
                updated_at: before.updated_at,
                ..after.clone()
            },
            before
        );
    }

    #[tokio::test]
    async fn test_update_replaces_attachment() {
        let (service, store, dir) = memory_service().await;
        let id = service
            .submit_public(fields("A101"), image("first.png"))
            .await
            .unwrap();
        let first = store.get_report(id).await.unwrap().unwrap().img_path.unwrap();

        let updated = service
            .update(id, ReportPatch::default(), image("second.gif"), &staff())
            .await
            .unwrap();

        let second = updated.img_path.unwrap();
        assert_ne!(first, second);
        assert!(second.ends_with("_second.gif"));
        assert_eq!(files_in(&dir), 1);
    }

    #[tokio::test]
    async fn test_update_unknown_report_is_not_found() {
        let (service, _store, dir) = memory_service().await;

        assert!(matches!(
            service
                .update(99, ReportPatch::default(), image("photo.png"), &staff())
                .await,
            Err(ServiceError::NotFound)
        ));
        assert_eq!(files_in(&dir), 0);
    }

    #[tokio::test]
    async fn test_delete_unknown_report_leaves_store_unchanged() {
        let (service, store, _dir) = memory_service().await;
        service.submit_public(fields("A101"), None).await.unwrap();
        let before = store.list_reports().await.unwrap();

        assert!(matches!(
            service.delete(12345, &staff()).await,
            Err(ServiceError::NotFound)
        ));
        assert_eq!(store.list_reports().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_delete_removes_report_and_attachment() {
        let (service, store, dir) = memory_service().await;
        let id = service
            .submit_public(fields("A101"), image("photo.png"))
            .await
            .unwrap();
        assert_eq!(files_in(&dir), 1);

        service.delete(id, &staff()).await.unwrap();

        assert!(store.get_report(id).await.unwrap().is_none());
        assert_eq!(files_in(&dir), 0);
    }

    fn stored_report(img_path: Option<&str>) -> ProblemReport {
        let now = Utc::now();
        ProblemReport {
            id: 1,
            room_id: "A101".to_string(),
            category: None,
            user_name: None,
            user_status: None,
            user_phone: None,
            user_email: None,
            problem_desc: None,
            img_path: img_path.map(str::to_string),
            status: ReportStatus::Pending,
            reporter_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_update_removes_image_replaced_at_commit_time() {
        // The row changed between the existence check and the write
        let stale = stored_report(Some("/uploads/stale.png"));
        let committed = stored_report(Some("/uploads/current.png"));

        let mut store = MockRecordStore::new();
        store
            .expect_get_report()
            .returning(move |_| Ok(Some(stale.clone())));
        store.expect_update_report().times(1).returning(move |_, patch| {
            let mut report = committed.clone();
            let previous_img_path = report.img_path.clone();
            report.apply(patch);
            Ok(UpdatedReport {
                report,
                previous_img_path,
            })
        });

        let (service, dir) = service_with(Arc::new(store)).await;
        std::fs::write(dir.path().join("stale.png"), b"old").unwrap();
        std::fs::write(dir.path().join("current.png"), b"newer").unwrap();

        let updated = service
            .update(1, ReportPatch::default(), image("third.png"), &staff())
            .await
            .unwrap();

        assert!(updated.img_path.unwrap().ends_with("_third.png"));
        assert!(dir.path().join("stale.png").exists());
        assert!(!dir.path().join("current.png").exists());
        assert_eq!(files_in(&dir), 2);
    }

    #[tokio::test]
    async fn test_failed_commit_reports_persistence_failure_and_drops_upload() {
        let existing = stored_report(None);

        let mut store = MockRecordStore::new();
        store
            .expect_get_report()
            .returning(move |_| Ok(Some(existing.clone())));
        store
            .expect_update_report()
            .times(1)
            .returning(|_, _| Err(StoreError::Persistence("deadlock detected".to_string())));

        let (service, dir) = service_with(Arc::new(store)).await;
        let patch = ReportPatch {
            status: Some(ReportStatus::InProgress),
            ..Default::default()
        };

        let err = service
            .update(1, patch, image("photo.png"), &staff())
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Persistence(detail) if detail == "deadlock detected"));
        assert_eq!(files_in(&dir), 0);
    }

    #[tokio::test]
    async fn test_failed_insert_drops_upload() {
        let mut store = MockRecordStore::new();
        store
            .expect_insert_report()
            .returning(|_| Err(StoreError::Persistence("disk full".to_string())));

        let (service, dir) = service_with(Arc::new(store)).await;

        assert!(matches!(
            service.submit_public(fields("A101"), image("photo.png")).await,
            Err(ServiceError::Persistence(_))
        ));
        assert_eq!(files_in(&dir), 0);
    }
}
