//! Materialises one remote item in the knowledge base.
//!
//! Policy checks run on listing metadata first, an existing file at the
//! destination is adopted instead of fetched again, and everything else is
//! streamed through a `.part` file that is fsynced and renamed into place.
//! Transient failures are retried with backoff; the caller decides what an
//! exhausted or skipped fetch means for the poll state.

pub mod error;
pub mod file;
pub mod paths;

pub use error::FetchError;

use std::path::{Path, PathBuf};

use crate::retry::{self, RetryConfig};
use crate::source::{RemoteItem, Source};
use crate::types::FileNamePolicy;

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// `<knowledge_base>/<source>`
    pub dir: PathBuf,
    /// Lowercase extensions with a leading dot. Empty allows everything.
    pub allowed_extensions: Vec<String>,
    pub max_file_size: Option<u64>,
    pub retry: RetryConfig,
    pub name_policy: FileNamePolicy,
}

/// A file that is now durably at `path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedFile {
    pub path: PathBuf,
    pub size: u64,
    pub checksum: String,
    /// True when the file was already on disk and no transfer happened.
    pub adopted: bool,
}

#[derive(Debug)]
pub struct Fetcher {
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Self {
        Self { config }
    }

    /// Reject items the policy excludes, using listing metadata only.
    ///
    /// The allow-list is checked against the local extension, so exported
    /// documents are judged as `.docx`/`.xlsx`/`.pptx`.
    pub fn precheck(&self, item: &RemoteItem) -> Result<(), FetchError> {
        let local_name = paths::base_file_name(item);
        let extension = paths::extension_of(&local_name);
        if !self.config.allowed_extensions.is_empty()
            && !self.config.allowed_extensions.contains(&extension)
        {
            return Err(FetchError::UnsupportedType {
                name: item.name.clone(),
                extension,
            });
        }

        if let (Some(limit), Some(size)) = (self.config.max_file_size, item.size) {
            if size > limit {
                return Err(FetchError::SizeExceeded {
                    name: item.name.clone(),
                    size,
                    limit,
                });
            }
        }
        Ok(())
    }

    /// Final path for `item`; see [`paths::destination`].
    pub fn destination(&self, item: &RemoteItem, taken: impl Fn(&Path) -> bool) -> PathBuf {
        paths::destination(&self.config.dir, item, self.config.name_policy, taken)
    }

    /// Fetch `item` to `dest`, or adopt a non-empty file already there.
    pub async fn fetch(
        &self,
        source: &dyn Source,
        item: &RemoteItem,
        dest: &Path,
    ) -> Result<FetchedFile, FetchError> {
        if file::existing_size(dest).await.is_some() {
            let hashed = file::hash_file(dest)
                .await
                .map_err(|e| FetchError::disk(dest, e))?;
            tracing::info!(
                source = %item.source,
                item_id = %item.id,
                path = %dest.display(),
                "Adopting file already on disk"
            );
            return Ok(FetchedFile {
                path: dest.to_path_buf(),
                size: hashed.size,
                checksum: hashed.checksum,
                adopted: true,
            });
        }

        let max_size = self.config.max_file_size;
        let result = retry::retry_with_backoff(
            &self.config.retry,
            |e: &FetchError| e.retry_action(),
            || async {
                let download = source.open(item).await?;
                if let (Some(limit), Some(len)) = (max_size, download.content_length) {
                    if len > limit {
                        return Err(FetchError::SizeExceeded {
                            name: item.name.clone(),
                            size: len,
                            limit,
                        });
                    }
                }
                file::write_atomically(download.body, dest, &item.name, max_size).await
            },
        )
        .await;

        match result {
            Ok(written) => {
                tracing::debug!(
                    source = %item.source,
                    item_id = %item.id,
                    path = %dest.display(),
                    size = written.size,
                    "Fetched"
                );
                Ok(FetchedFile {
                    path: dest.to_path_buf(),
                    size: written.size,
                    checksum: written.checksum,
                    adopted: false,
                })
            }
            Err(e) if e.is_retryable() => Err(FetchError::RetriesExhausted {
                name: item.name.clone(),
                retries: self.config.retry.max_retries,
                last_error: e.to_string(),
            }),
            Err(e) => Err(e),
        }
    }
}
