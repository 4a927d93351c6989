//! Image upload storage under a single root directory.

use service_core::error::AppError;
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];

/// A file written by [`UploadStore::save`].
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct SavedFile {
    pub original_name: String,
    pub saved_name: String,
    /// Path relative to the upload root, as accepted by generation requests.
    pub path: String,
}

pub fn mime_for(path: &Path) -> &'static str {
    match extension_of(path).as_deref() {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

pub fn is_allowed(filename: &str) -> bool {
    extension_of(Path::new(filename))
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

/// Reduce a client-supplied file name to a safe single path component.
/// Returns `None` if nothing usable is left.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let cleaned = cleaned.trim_start_matches(['.', '_']).to_string();

    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Join `relative` onto `root` if it stays inside it.
fn confine(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() {
        return None;
    }
    let mut joined = root.to_path_buf();
    for component in relative.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(joined)
}

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
}

impl UploadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn ensure_root(&self) -> Result<(), AppError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Absolute path of an existing file under the root, or `None` if the
    /// reference escapes the root or the file does not exist.
    pub async fn resolve(&self, relative: &str) -> Option<PathBuf> {
        let path = confine(&self.root, relative)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Some(path),
            _ => None,
        }
    }

    /// Resolve every reference, dropping (and logging) the ones that do not
    /// exist. Returns the relative names alongside their resolved paths.
    pub async fn resolve_all(&self, references: &[String]) -> Vec<(String, PathBuf)> {
        let mut resolved = Vec::with_capacity(references.len());
        for reference in references {
            match self.resolve(reference).await {
                Some(path) => resolved.push((reference.clone(), path)),
                None => warn!(path = %reference, "Image not found; dropping from request"),
            }
        }
        resolved
    }

    pub async fn save(&self, original_name: &str, bytes: &[u8]) -> Result<SavedFile, AppError> {
        if !is_allowed(original_name) {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "File type not allowed: {}",
                original_name
            )));
        }
        let clean = sanitize_filename(original_name).ok_or_else(|| {
            AppError::BadRequest(anyhow::anyhow!("Invalid file name: {}", original_name))
        })?;
        let saved_name = format!("{}_{}", Uuid::new_v4(), clean);

        self.ensure_root().await?;
        tokio::fs::write(self.root.join(&saved_name), bytes).await?;
        info!(saved_name = %saved_name, size = bytes.len(), "File uploaded");

        Ok(SavedFile {
            original_name: clean,
            path: saved_name.clone(),
            saved_name,
        })
    }

    pub async fn read(&self, filename: &str) -> Result<(Vec<u8>, &'static str), AppError> {
        let path = self.existing(filename).await?;
        let bytes = tokio::fs::read(&path).await?;
        Ok((bytes, mime_for(&path)))
    }

    pub async fn delete(&self, filename: &str) -> Result<(), AppError> {
        let path = self.existing(filename).await?;
        tokio::fs::remove_file(&path).await?;
        info!(filename = %filename, "File deleted");
        Ok(())
    }

    async fn existing(&self, filename: &str) -> Result<PathBuf, AppError> {
        if confine(&self.root, filename).is_none() {
            return Err(AppError::BadRequest(anyhow::anyhow!("Invalid file name")));
        }
        self.resolve(filename)
            .await
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("File not found")))
    }
}
