//! Facility Report Service
//!
//! Lets anyone report a facility problem (a leaking tap, a broken light) for a
//! room, optionally with a photo, and lets staff triage those reports.
//!
//! ## Features
//!
//! - **Public submissions**: multipart, urlencoded or JSON forms, tolerant of
//!   hyphenated field names, always stored as `pending`
//! - **Redacted public listing**: reporter phone and e-mail are only visible
//!   to staff
//! - **Staff triage**: token-protected create, list, partial update and delete
//! - **Attachments**: extension allow-listed images stored under unique names
//!   and served back from `/uploads`
//!
//! ## Architecture
//!
//! ```text
//!  HTTP clients
//!       │
//!       ▼
//! ┌──────────────┐   bearer    ┌──────────────┐
//! │ API Layer    │────────────▶│ Credential   │
//! │ (axum)       │   token     │ Service      │
//! └──────────────┘             └──────────────┘
//!       │                             │
//!       ▼                             │
//! ┌──────────────┐           ┌──────────────┐
//! │ Report       │──────────▶│ Attachment   │──▶ upload directory
//! │ Service      │           │ Store        │
//! └──────────────┘           └──────────────┘
//!       │                             │
//!       ▼                             ▼
//! ┌─────────────────────────────────────────┐
//! │ Record Store (PostgreSQL / in-memory)   │
//! └─────────────────────────────────────────┘
//! ```

pub mod api;
pub mod attachments;
pub mod config;
pub mod credentials;
pub mod error;
pub mod form;
pub mod memory_store;
pub mod record_store;
pub mod reports;
pub mod token;

pub use api::{create_router, start_api_server, AppState};
pub use attachments::{AttachmentStore, UploadedFile};
pub use config::Config;
pub use credentials::{CredentialService, StaffIdentity};
pub use error::{AuthError, ServiceError, ServiceResult};
pub use memory_store::MemoryRecordStore;
pub use record_store::{
    NewReport, PgRecordStore, ProblemReport, RecordStore, ReportPatch, ReportStatus,
    StaffCredential, StoreError, UpdatedReport,
};
pub use reports::{PublicReportView, ReportFields, ReportService, StaffReportView};
