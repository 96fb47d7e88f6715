use anyhow::{Context, Result};
use axum::body::Bytes;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Public path prefix under which stored attachments are served
pub const URL_PREFIX: &str = "/uploads";

/// Image extensions accepted for attachments
pub const ALLOWED_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "gif"];

/// An uploaded file as received from the client
#[derive(Debug, Clone)]
pub struct UploadedFile {
    /// Client-supplied file name, untrusted
    pub file_name: String,
    pub bytes: Bytes,
}

/// Local-filesystem attachment store for report images
pub struct AttachmentStore {
    directory: PathBuf,
}

impl AttachmentStore {
    /// Create the store, creating the content directory if needed
    pub async fn new(directory: impl Into<PathBuf>) -> Result<Self> {
        let directory = directory.into();
        tokio::fs::create_dir_all(&directory)
            .await
            .with_context(|| format!("Failed to create upload directory {}", directory.display()))?;

        info!(directory = %directory.display(), "Attachment store initialized");

        Ok(Self { directory })
    }

    /// Content directory served under [`URL_PREFIX`]
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Persist an accepted image and return its retrieval path.
    ///
    /// Returns `None` when there is no file or its extension is not allowed.
    #[instrument(skip(self, file), fields(file_name = file.map(|f| f.file_name.as_str())))]
    pub async fn store(&self, file: Option<&UploadedFile>) -> Result<Option<String>> {
        let Some(file) = file else {
            return Ok(None);
        };
        let Some(extension) = allowed_extension(&file.file_name) else {
            metrics::counter!("attachments.rejected").increment(1);
            debug!("Attachment rejected by extension allow-list");
            return Ok(None);
        };

        let mut safe_name = secure_filename(&file.file_name);
        if allowed_extension(&safe_name).is_none() {
            safe_name = format!("upload.{extension}");
        }
        let generated = format!("{}_{}", Uuid::new_v4().simple(), safe_name);

        tokio::fs::write(self.directory.join(&generated), &file.bytes)
            .await
            .context("Failed to write attachment")?;

        metrics::counter!("attachments.stored").increment(1);
        info!(
            stored_as = %generated,
            content_type = content_type(&extension),
            size_bytes = file.bytes.len(),
            "Attachment stored"
        );

        Ok(Some(format!("{URL_PREFIX}/{generated}")))
    }

    /// Delete a previously stored attachment, logging instead of failing
    pub async fn remove(&self, img_path: &str) {
        let Some(name) = img_path
            .strip_prefix(URL_PREFIX)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| !name.is_empty() && *name == secure_filename(name))
        else {
            warn!(img_path = %img_path, "Refusing to remove attachment outside upload directory");
            return;
        };

        match tokio::fs::remove_file(self.directory.join(name)).await {
            Ok(()) => debug!(img_path = %img_path, "Attachment removed"),
            Err(e) => warn!(img_path = %img_path, error = %e, "Failed to remove attachment"),
        }
    }
}

/// Lower-cased extension of `file_name` if it is on the allow-list
pub fn allowed_extension(file_name: &str) -> Option<String> {
    let (_, extension) = file_name.rsplit_once('.')?;
    let extension = extension.to_ascii_lowercase();
    ALLOWED_EXTENSIONS
        .contains(&extension.as_str())
        .then_some(extension)
}

/// Reduce a client file name to a safe, flat ASCII name
fn secure_filename(file_name: &str) -> String {
    let flattened = file_name.replace(['/', '\\'], " ");
    let joined = flattened.split_whitespace().collect::<Vec<_>>().join("_");
    joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect::<String>()
        .trim_matches(|c| c == '.' || c == '_')
        .to_string()
}

/// Get content type for an image extension
fn content_type(extension: &str) -> &'static str {
    match extension {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
