use std::path::Path;

use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::error::FetchError;
use super::paths::part_path;
use crate::source::ByteStream;

/// Size and SHA-256 of a file that is now durably on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenFile {
    pub size: u64,
    pub checksum: String,
}

/// Stream `body` into `final_path` via a `.part` sibling.
///
/// The temp file is flushed and fsynced before the rename, so either the
/// final path holds the complete bytes or it does not exist. `max_size`
/// aborts the transfer as soon as the body grows past the limit; an empty
/// body is rejected rather than materialised.
pub async fn write_atomically(
    mut body: ByteStream,
    final_path: &Path,
    name: &str,
    max_size: Option<u64>,
) -> Result<WrittenFile, FetchError> {
    let dir = final_path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .map_err(|e| FetchError::disk(dir, e))?;

    let part = part_path(final_path);
    let written = match stream_to_part(&mut body, &part, name, max_size).await {
        Ok(w) => w,
        Err(e) => {
            let _ = fs::remove_file(&part).await;
            return Err(e);
        }
    };

    fs::rename(&part, final_path)
        .await
        .map_err(|e| FetchError::disk(final_path, e))?;
    sync_dir(dir).await;
    Ok(written)
}

async fn stream_to_part(
    body: &mut ByteStream,
    part: &Path,
    name: &str,
    max_size: Option<u64>,
) -> Result<WrittenFile, FetchError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(part)
        .await
        .map_err(|e| FetchError::disk(part, e))?;

    let mut hasher = Sha256::new();
    let mut written: u64 = 0;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        written += chunk.len() as u64;
        if let Some(limit) = max_size {
            if written > limit {
                return Err(FetchError::SizeExceeded {
                    name: name.to_string(),
                    size: written,
                    limit,
                });
            }
        }
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::disk(part, e))?;
    }
    if written == 0 {
        return Err(FetchError::EmptyFile(name.to_string()));
    }

    file.flush().await.map_err(|e| FetchError::disk(part, e))?;
    file.sync_all().await.map_err(|e| FetchError::disk(part, e))?;

    Ok(WrittenFile {
        size: written,
        checksum: hex(&hasher.finalize()),
    })
}

/// Persist the rename itself. Not every platform can open a directory.
#[cfg(unix)]
async fn sync_dir(dir: &Path) {
    if let Ok(d) = fs::File::open(dir).await {
        if let Err(e) = d.sync_all().await {
            tracing::debug!(dir = %dir.display(), error = %e, "Directory fsync failed");
        }
    }
}

#[cfg(not(unix))]
async fn sync_dir(_dir: &Path) {}

/// Size and SHA-256 of an existing file, for adoption and `verify --checksums`.
pub async fn hash_file(path: &Path) -> std::io::Result<WrittenFile> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size: u64 = 0;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(WrittenFile {
        size,
        checksum: hex(&hasher.finalize()),
    })
}

/// Size of a regular, non-empty file at `path`, if there is one.
pub async fn existing_size(path: &Path) -> Option<u64> {
    match fs::metadata(path).await {
        Ok(m) if m.is_file() && m.len() > 0 => Some(m.len()),
        _ => None,
    }
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}
