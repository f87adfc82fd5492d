//! Multipart package upload.
//!
//! The file field is streamed to a hidden part file under the artifact
//! directory while its checksum is computed. The part file is renamed into
//! place inside the package insert, so no row exists without its artifact.

use axum::extract::Multipart;
use chrono::Utc;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tokio::io::AsyncWriteExt;

use super::ApiError;
use crate::db::{NewPackage, OsCompatibility, Package, Store};

static ALLOWED_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\.(zip|exe|msi|deb|rpm|dmg)$").expect("valid artifact extension pattern")
});

/// An uploaded file written to a part file, not yet in place.
#[derive(Debug)]
pub struct StagedFile {
    pub file_name: String,
    pub path: PathBuf,
    pub size: i64,
    pub checksum: String,
}

impl StagedFile {
    async fn discard(&self) {
        if let Err(e) = tokio::fs::remove_file(&self.path).await {
            tracing::warn!("Failed to remove {}: {}", self.path.display(), e);
        }
    }
}

/// Writes chunks to a part file, hashing as it goes.
pub struct PartWriter {
    path: PathBuf,
    file: tokio::fs::File,
    hasher: Sha256,
    size: u64,
}

impl PartWriter {
    pub async fn create(dir: &Path) -> Result<Self, ApiError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| ApiError::Internal(format!("create {}: {}", dir.display(), e)))?;
        let path = dir.join(format!(".upload-{:016x}.part", rand::random::<u64>()));
        let file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| ApiError::Internal(format!("create {}: {}", path.display(), e)))?;
        Ok(Self {
            path,
            file,
            hasher: Sha256::new(),
            size: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), ApiError> {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| ApiError::Internal(format!("write {}: {}", self.path.display(), e)))
    }

    pub async fn finish(mut self, file_name: String) -> Result<StagedFile, ApiError> {
        self.file
            .flush()
            .await
            .map_err(|e| ApiError::Internal(format!("write {}: {}", self.path.display(), e)))?;
        Ok(StagedFile {
            file_name,
            path: self.path,
            size: self.size as i64,
            checksum: format!("{:x}", self.hasher.finalize()),
        })
    }

    async fn abandon(self) {
        drop(self.file);
        let _ = tokio::fs::remove_file(&self.path).await;
    }
}

/// Fields of an upload form, as received.
#[derive(Debug, Default)]
pub struct UploadForm {
    pub name: String,
    pub version: String,
    pub description: String,
    pub os_compatibility: Option<String>,
    pub file: Option<StagedFile>,
}

impl UploadForm {
    /// Read the form, streaming the `file` field into `artifact_dir`.
    pub async fn read(mut multipart: Multipart, artifact_dir: &str) -> Result<Self, ApiError> {
        let mut form = UploadForm::default();
        match form.read_fields(&mut multipart, Path::new(artifact_dir)).await {
            Ok(()) => Ok(form),
            Err(e) => {
                if let Some(file) = &form.file {
                    file.discard().await;
                }
                Err(e)
            }
        }
    }

    async fn read_fields(&mut self, multipart: &mut Multipart, dir: &Path) -> Result<(), ApiError> {
        while let Some(mut field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name == "file" {
                if self.file.is_some() {
                    return Err(ApiError::BadRequest("only one file may be uploaded".to_string()));
                }
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mut writer = PartWriter::create(dir).await?;
                loop {
                    let chunk = match field.chunk().await {
                        Ok(Some(chunk)) => chunk,
                        Ok(None) => break,
                        Err(e) => {
                            writer.abandon().await;
                            return Err(ApiError::BadRequest(e.to_string()));
                        }
                    };
                    if let Err(e) = writer.write(&chunk).await {
                        writer.abandon().await;
                        return Err(e);
                    }
                }
                self.file = Some(writer.finish(file_name).await?);
                continue;
            }

            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            match name.as_str() {
                "name" => self.name = value.trim().to_string(),
                "version" => self.version = value.trim().to_string(),
                "description" => self.description = value,
                "os_compatibility" => self.os_compatibility = Some(value.trim().to_string()),
                _ => {}
            }
        }
        Ok(())
    }
}

fn allowed_file(file_name: &str) -> bool {
    ALLOWED_FILE.is_match(file_name)
}

fn safe_component(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// Where the artifact of a package is kept.
pub fn artifact_path(artifact_dir: &Path, name: &str, version: &str, checksum: &str, extension: &str) -> PathBuf {
    artifact_dir.join(format!(
        "{}-{}-{}.{}",
        safe_component(name),
        safe_component(version),
        &checksum[..checksum.len().min(12)],
        extension
    ))
}

/// Validate the form and record the package with its artifact moved into
/// place. On any error the staged file is removed and no row is written.
pub async fn save_package(store: &Store, artifact_dir: &str, mut form: UploadForm) -> Result<Package, ApiError> {
    let file = form
        .file
        .take()
        .ok_or_else(|| ApiError::BadRequest("file is required".to_string()))?;
    let result = place_package(store, Path::new(artifact_dir), form, &file).await;
    if result.is_err() && tokio::fs::try_exists(&file.path).await.unwrap_or(false) {
        file.discard().await;
    }
    result
}

async fn place_package(
    store: &Store,
    artifact_dir: &Path,
    form: UploadForm,
    file: &StagedFile,
) -> Result<Package, ApiError> {
    if form.name.is_empty() || form.version.is_empty() {
        return Err(ApiError::BadRequest("name and version are required".to_string()));
    }
    let os_compatibility = match form.os_compatibility.as_deref() {
        None | Some("") => OsCompatibility::All,
        Some(raw) => OsCompatibility::parse(raw)
            .ok_or_else(|| ApiError::BadRequest(format!("invalid os_compatibility: {}", raw)))?,
    };
    if !allowed_file(&file.file_name) {
        return Err(ApiError::BadRequest(format!(
            "unsupported file type: {} (allowed: zip, exe, msi, deb, rpm, dmg)",
            file.file_name
        )));
    }
    let extension = Path::new(&file.file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let final_path = artifact_path(artifact_dir, &form.name, &form.version, &file.checksum, &extension);
    let new_package = NewPackage {
        name: form.name,
        version: form.version,
        description: form.description,
        os_compatibility,
        size: file.size,
        checksum: file.checksum.clone(),
        artifact_ref: final_path.to_string_lossy().into_owned(),
    };

    let mut placed = false;
    let result = store.add_package_with(&new_package, Utc::now(), || {
        std::fs::rename(&file.path, &final_path)?;
        placed = true;
        Ok(())
    });
    let package = match result {
        Ok(p) => p,
        Err(e) => {
            if placed {
                // Moved into place but the commit failed.
                let _ = tokio::fs::remove_file(&final_path).await;
            }
            return Err(e.into());
        }
    };

    tracing::info!(
        package_id = package.id,
        "Stored package {} {} ({} bytes)",
        package.name,
        package.version,
        package.size
    );
    Ok(package)
}
