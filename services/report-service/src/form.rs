//! Request payload extraction for report submissions and updates.
//!
//! Report endpoints accept multipart forms (with an optional `image` file),
//! urlencoded forms and JSON objects. All three are reduced to a flat
//! [`FormPayload`] before any field is interpreted.

use crate::attachments::UploadedFile;
use crate::error::{ServiceError, ServiceResult};
use crate::record_store::{ReportPatch, ReportStatus};
use crate::reports::ReportFields;
use axum::async_trait;
use axum::extract::{Form, FromRequest, Json, Multipart, Request};
use axum::http::header;
use std::collections::HashMap;

/// Multipart field carrying the report image
pub const IMAGE_FIELD: &str = "image";

/// Hyphenated spellings the public form is known to send, keyed by canonical name
pub const PUBLIC_FIELD_ALIASES: [(&str, &str); 7] = [
    ("room_id", "room-id"),
    ("user_name", "user-name"),
    ("user_status", "user-status"),
    ("user_phone", "user-phone"),
    ("user_email", "user-email"),
    ("problem_desc", "problem-desc"),
    ("reporter_token", "reporter-token"),
];

const NULLABLE_FIELDS: [&str; 6] = [
    "category",
    "user_name",
    "user_status",
    "user_phone",
    "user_email",
    "problem_desc",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    /// Explicit JSON `null`
    Null,
}

/// Flattened request payload
#[derive(Debug, Default)]
pub struct FormPayload {
    pub fields: HashMap<String, FieldValue>,
    pub image: Option<UploadedFile>,
}

impl FormPayload {
    pub fn from_text_fields(fields: HashMap<String, String>) -> Self {
        Self {
            fields: fields
                .into_iter()
                .map(|(k, v)| (k, FieldValue::Text(v)))
                .collect(),
            image: None,
        }
    }

    fn from_json(value: serde_json::Value) -> ServiceResult<Self> {
        let serde_json::Value::Object(object) = value else {
            return Err(ServiceError::Validation(
                "expected a JSON object".to_string(),
            ));
        };

        let fields = object
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::Null => FieldValue::Null,
                    serde_json::Value::String(s) => FieldValue::Text(s),
                    other => FieldValue::Text(other.to_string()),
                };
                (key, value)
            })
            .collect();

        Ok(Self {
            fields,
            image: None,
        })
    }

    async fn from_multipart(mut multipart: Multipart) -> ServiceResult<Self> {
        let mut payload = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ServiceError::Validation(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == IMAGE_FIELD {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ServiceError::Validation(e.body_text()))?;
                // Browsers send an empty part when no file was picked
                if !file_name.is_empty() && payload.image.is_none() {
                    payload.image = Some(UploadedFile { file_name, bytes });
                }
            } else {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ServiceError::Validation(e.body_text()))?;
                payload
                    .fields
                    .entry(name)
                    .or_insert(FieldValue::Text(text));
            }
        }

        Ok(payload)
    }

    /// Non-empty text value of `key`
    pub fn text(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::Text(s)) if !s.is_empty() => Some(s.as_str()),
            _ => None,
        }
    }

    fn owned(&self, key: &str) -> Option<String> {
        self.text(key).map(str::to_string)
    }

    /// Canonical value, falling back to the hyphenated alias
    fn public_text(&self, key: &str) -> Option<String> {
        self.owned(key).or_else(|| {
            PUBLIC_FIELD_ALIASES
                .iter()
                .find(|(canonical, _)| *canonical == key)
                .and_then(|(_, alias)| self.owned(alias))
        })
    }

    /// Fields of a public submission, with alias tolerance
    pub fn public_fields(&self) -> ReportFields {
        ReportFields {
            room_id: self.public_text("room_id"),
            category: self.public_text("category"),
            user_name: self.public_text("user_name"),
            user_status: self.public_text("user_status"),
            user_phone: self.public_text("user_phone"),
            user_email: self.public_text("user_email"),
            problem_desc: self.public_text("problem_desc"),
            reporter_token: self.public_text("reporter_token"),
            status: self.owned("status"),
        }
    }

    /// Fields of a staff submission, canonical names only
    pub fn staff_fields(&self) -> ReportFields {
        ReportFields {
            room_id: self.owned("room_id"),
            category: self.owned("category"),
            user_name: self.owned("user_name"),
            user_status: self.owned("user_status"),
            user_phone: self.owned("user_phone"),
            user_email: self.owned("user_email"),
            problem_desc: self.owned("problem_desc"),
            reporter_token: self.owned("reporter_token"),
            status: self.owned("status"),
        }
    }

    /// Partial update built from the keys actually present
    pub fn patch(&self) -> ServiceResult<ReportPatch> {
        let mut patch = ReportPatch::default();

        match self.fields.get("room_id") {
            Some(FieldValue::Text(room_id)) if !room_id.is_empty() => {
                patch.room_id = Some(room_id.clone());
            }
            Some(_) => {
                return Err(ServiceError::Validation(
                    "room_id cannot be empty".to_string(),
                ))
            }
            None => {}
        }

        for key in NULLABLE_FIELDS {
            let Some(value) = self.fields.get(key) else {
                continue;
            };
            let value = match value {
                FieldValue::Text(s) => Some(s.clone()),
                FieldValue::Null => None,
            };
            let slot = match key {
                "category" => &mut patch.category,
                "user_name" => &mut patch.user_name,
                "user_status" => &mut patch.user_status,
                "user_phone" => &mut patch.user_phone,
                "user_email" => &mut patch.user_email,
                _ => &mut patch.problem_desc,
            };
            *slot = Some(value);
        }

        match self.fields.get("status") {
            Some(FieldValue::Text(status)) => {
                let status = status
                    .parse::<ReportStatus>()
                    .map_err(|e| ServiceError::Validation(e.to_string()))?;
                patch.status = Some(status);
            }
            Some(FieldValue::Null) => {
                return Err(ServiceError::Validation(
                    "status cannot be null".to_string(),
                ))
            }
            None => {}
        }

        Ok(patch)
    }
}

#[async_trait]
impl<S> FromRequest<S> for FormPayload
where
    S: Send + Sync,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| ServiceError::Validation(e.body_text()))?;
            Self::from_multipart(multipart).await
        } else if content_type.starts_with("application/json") {
            let Json(value) = Json::<serde_json::Value>::from_request(req, state)
                .await
                .map_err(|e| ServiceError::Validation(e.body_text()))?;
            Self::from_json(value)
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(fields) = Form::<HashMap<String, String>>::from_request(req, state)
                .await
                .map_err(|e| ServiceError::Validation(e.body_text()))?;
            Ok(Self::from_text_fields(fields))
        } else {
            Ok(Self::default())
        }
    }
}
