//! Local cover images, stored as `<dir>/<id>.<ext>`.

use std::path::PathBuf;

use tracing::debug;

use crate::entity::EntityId;

#[derive(Debug, Clone)]
pub struct ImageStore {
    dir: PathBuf,
}

impl ImageStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Every file named `<id>.*`.
    async fn files_for(&self, id: EntityId) -> std::io::Result<Vec<PathBuf>> {
        let stem = id.to_string();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.file_stem().and_then(|s| s.to_str()) != Some(stem.as_str()) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// The stored image for `id`, if any.
    pub async fn path_for(&self, id: EntityId) -> std::io::Result<Option<PathBuf>> {
        Ok(self.files_for(id).await?.into_iter().next())
    }

    pub async fn missing(&self, id: EntityId) -> std::io::Result<bool> {
        Ok(self.path_for(id).await?.is_none())
    }

    /// Remove every `<id>.*` file, then write `data` if given.
    ///
    /// Returns the new file's path.
    pub async fn replace(&self, id: EntityId, data: Option<&[u8]>) -> std::io::Result<Option<PathBuf>> {
        self.remove(id).await?;
        let Some(data) = data else {
            return Ok(None);
        };
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{id}.{}", sniff_extension(data)));
        tokio::fs::write(&path, data).await?;
        debug!(id, path = %path.display(), bytes = data.len(), "image stored");
        Ok(Some(path))
    }

    pub async fn remove(&self, id: EntityId) -> std::io::Result<()> {
        for path in self.files_for(id).await? {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// File extension for image bytes, `img` when the format is unknown.
pub fn sniff_extension(data: &[u8]) -> &'static str {
    image::guess_format(data)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("img")
}
