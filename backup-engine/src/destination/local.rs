//! Local directory destination.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::{Destination, RemoteObject};
use crate::utils::errors::{EngineError, Result};

const PARTIAL_SUFFIX: &str = ".partial";

/// Stores every object as a file directly under `root`.
///
/// Writes go to `<name>.partial` first and are renamed into place once
/// flushed, so a listing never shows a half-written object.
#[derive(Debug, Clone)]
pub struct LocalDestination {
    root: PathBuf,
}

impl LocalDestination {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| EngineError::destination("open", root.display().to_string(), e))?;
        Ok(Self { root })
    }

    /// Parse a `file://` URL or a bare path.
    pub async fn from_url(url: &str) -> Result<Self> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        if path.is_empty() {
            return Err(EngineError::Config("destination path is empty".into()));
        }
        Self::open(path).await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Regular files under the root, either finished objects or `.partial` leftovers.
    async fn scan(&self, partial: bool) -> Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| EngineError::destination("list", self.root.display().to_string(), e))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::destination("list", self.root.display().to_string(), e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(PARTIAL_SUFFIX) != partial {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    debug!("Skipping {} in listing: {}", name, e);
                    continue;
                }
            };
            if metadata.is_file() {
                objects.push(RemoteObject {
                    name,
                    size: metadata.len(),
                });
            }
        }

        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains(&['/', '\\'][..]) || name == "." || name == ".." {
            return Err(EngineError::destination("resolve", name, "invalid object name"));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn id(&self) -> String {
        let root = std::fs::canonicalize(&self.root).unwrap_or_else(|_| self.root.clone());
        format!("file://{}", root.display())
    }

    async fn list(&self) -> Result<Vec<RemoteObject>> {
        self.scan(false).await
    }

    async fn put(&self, name: &str, data: Bytes) -> Result<()> {
        let path = self.object_path(name)?;
        let partial = self.root.join(format!("{name}{PARTIAL_SUFFIX}"));

        let write = async {
            let mut file = fs::File::create(&partial).await?;
            file.write_all(&data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&partial, &path).await
        };

        if let Err(e) = write.await {
            let _ = fs::remove_file(&partial).await;
            return Err(EngineError::destination("put", name, e));
        }

        debug!("Stored {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<Bytes> {
        let path = self.object_path(name)?;
        let data = fs::read(&path)
            .await
            .map_err(|e| EngineError::destination("get", name, e))?;
        Ok(Bytes::from(data))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(EngineError::destination("delete", name, e)),
        }
    }

    async fn list_incomplete(&self) -> Result<Vec<RemoteObject>> {
        self.scan(true).await
    }
}
