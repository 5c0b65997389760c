//! Holding area for finished artifacts.
//!
//! Files are named `{expires_ms}-{uuid}.mp4` so expiry can be read from the
//! directory listing alone. An artifact is removed when its handle drops,
//! unless it was retained for a grant, in which case pruning removes it after
//! the grant has expired.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ArtifactSpool {
    dir: PathBuf,
    ttl: Duration,
}

impl ArtifactSpool {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Moves `src` into the spool.
    pub async fn adopt(&self, src: &Path) -> std::io::Result<SpooledArtifact> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let expires_at_ms = Utc::now().timestamp_millis() + self.ttl.as_millis() as i64;
        let name = format!("{}-{}.mp4", expires_at_ms, Uuid::new_v4());
        let dest = self.dir.join(&name);

        if tokio::fs::rename(src, &dest).await.is_err() {
            // different filesystem
            tokio::fs::copy(src, &dest).await?;
            let _ = tokio::fs::remove_file(src).await;
        }
        let size = tokio::fs::metadata(&dest).await?.len();
        debug!(path = %dest.display(), size, "Artifact spooled");

        Ok(SpooledArtifact {
            path: dest,
            name,
            size,
            expires_at_ms,
            retained: false,
        })
    }

    /// Looks up a spooled file by name. Rejects anything that is not a plain
    /// file name, and files whose expiry has passed.
    pub fn resolve(&self, name: &str, now_ms: i64) -> Option<PathBuf> {
        let mut components = Path::new(name).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => {}
            _ => return None,
        }
        if expiry_from_name(name)? <= now_ms {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }

    /// Deletes every artifact whose expiry is at or before `now_ms`.
    pub async fn prune_expired(&self, now_ms: i64) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(expires) = name.to_str().and_then(expiry_from_name) else {
                continue;
            };
            if expires <= now_ms {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %entry.path().display(), error = %e, "Failed to prune artifact"),
                }
            }
        }
        if removed > 0 {
            debug!(removed, "Pruned expired artifacts");
        }
        removed
    }
}

fn expiry_from_name(name: &str) -> Option<i64> {
    name.split_once('-')?.0.parse().ok()
}

/// A file in the spool. Deleted on drop unless retained.
#[derive(Debug)]
pub struct SpooledArtifact {
    path: PathBuf,
    name: String,
    size: u64,
    expires_at_ms: i64,
    retained: bool,
}

impl SpooledArtifact {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn expires_at_ms(&self) -> i64 {
        self.expires_at_ms
    }

    /// Leaves the file in place for later retrieval; pruning owns it from now on.
    pub fn retain(mut self) -> String {
        self.retained = true;
        std::mem::take(&mut self.name)
    }

    /// Moves the file out of the spool to `dest`.
    pub async fn persist_to(mut self, dest: &Path) -> std::io::Result<u64> {
        if tokio::fs::rename(&self.path, dest).await.is_err() {
            tokio::fs::copy(&self.path, dest).await?;
            let _ = tokio::fs::remove_file(&self.path).await;
        }
        self.retained = true;
        Ok(self.size)
    }
}

impl Drop for SpooledArtifact {
    fn drop(&mut self) {
        if !self.retained {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
