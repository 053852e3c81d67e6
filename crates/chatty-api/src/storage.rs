use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

/// Local-disk blob store. Blobs live at `{dir}/{key}` and are served
/// read-only under `{public_url}/attachments/{key}`.
pub struct Storage {
    dir: PathBuf,
    public_url: String,
}

impl Storage {
    pub async fn new(dir: PathBuf, public_url: &str) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self {
            dir,
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn url_for(&self, key: &str) -> String {
        format!("{}/attachments/{}", self.public_url, key)
    }

    /// Fresh key `{prefix}/{uuid}{ext}`, keeping the extension of the
    /// uploaded file name when it has a sane one.
    pub fn new_key(prefix: &str, original_name: Option<&str>) -> String {
        let ext = original_name
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty() && ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
            .map(|ext| format!(".{}", ext.to_ascii_lowercase()))
            .unwrap_or_default();
        format!("{}/{}{}", prefix, Uuid::new_v4(), ext)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let rel = Path::new(key);
        if rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Invalid storage key: {}", key);
        }
        Ok(self.dir.join(rel))
    }

    /// Write a blob and return its public URL.
    pub async fn save(&self, key: &str, data: &[u8]) -> Result<String> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, data).await?;
        Ok(self.url_for(key))
    }

    /// Remove a blob. A missing blob is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort removal of several blobs; failures are only logged.
    pub async fn delete_all(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.delete(key).await {
                warn!("Failed to delete blob {}: {}", key, e);
            }
        }
    }
}
