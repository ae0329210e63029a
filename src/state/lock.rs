//! Per-source advisory lock so two processes never drive the same poll state.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use super::error::StateError;
use crate::types::SourceKind;

#[derive(Debug)]
pub struct SourceLock {
    file: File,
    path: PathBuf,
}

impl SourceLock {
    /// Take `<state_dir>/<source>.lock`, failing at once if another process holds it.
    pub async fn acquire(state_dir: &Path, source: SourceKind) -> Result<Self, StateError> {
        let path = state_dir.join(format!("{}.lock", source.as_str()));
        tokio::task::spawn_blocking(move || {
            let file = File::create(&path).map_err(|error| StateError::LockFile {
                path: path.clone(),
                error,
            })?;
            file.try_lock_exclusive().map_err(|_| StateError::Locked {
                kind: source,
                path: path.clone(),
            })?;
            Ok(Self { file, path })
        })
        .await?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SourceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to release lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_fails_until_release() {
        let dir = tempfile::tempdir().unwrap();
        let first = SourceLock::acquire(dir.path(), SourceKind::Drive)
            .await
            .unwrap();
        assert!(first.path().ends_with("drive.lock"));

        let err = SourceLock::acquire(dir.path(), SourceKind::Drive)
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Locked { .. }));

        // Different sources do not contend.
        let _slack = SourceLock::acquire(dir.path(), SourceKind::Slack)
            .await
            .unwrap();

        drop(first);
        SourceLock::acquire(dir.path(), SourceKind::Drive)
            .await
            .unwrap();
    }
}
