use std::path::{Path, PathBuf};

use crate::source::RemoteItem;
use crate::types::FileNamePolicy;

/// Longest final file name, leaving room for the `.<name>.part` temp name
/// inside the usual 255-byte limit.
pub const MAX_FILE_NAME_BYTES: usize = 255 - ".".len() - ".part".len();

/// Extensions longer than this are treated as part of the stem when capping.
const MAX_EXTENSION_BYTES: usize = 16;

/// Replace characters that are invalid or dangerous in a file name.
///
/// Path separators, control characters and `: * ? " < > |` become `_`.
/// Leading dots are replaced too so a remote name can never produce a
/// hidden file, `.` or `..`. An empty result becomes `untitled`.
pub fn sanitize_file_name(name: &str) -> String {
    let mut cleaned: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    cleaned.truncate(cleaned.trim_end_matches(['.', ' ']).len());
    if cleaned.is_empty() {
        return "untitled".to_string();
    }
    let leading_dots = cleaned.len() - cleaned.trim_start_matches('.').len();
    if leading_dots > 0 {
        cleaned.replace_range(..leading_dots, &"_".repeat(leading_dots));
    }
    cleaned
}

/// First 7 characters of an item id.
pub fn id7(id: &str) -> &str {
    match id.char_indices().nth(7) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Split off a short extension (with its dot), if the name has one.
fn split_extension(file_name: &str) -> (&str, &str) {
    match file_name.rfind('.') {
        Some(dot) if dot > 0 && file_name.len() - dot <= MAX_EXTENSION_BYTES => {
            file_name.split_at(dot)
        }
        _ => (file_name, ""),
    }
}

/// Longest prefix of `s` that fits in `max` bytes without splitting a char.
fn truncate_bytes(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Shorten the stem so the whole name fits in `max` bytes, keeping the
/// extension.
pub fn cap_file_name(file_name: &str, max: usize) -> String {
    if file_name.len() <= max {
        return file_name.to_string();
    }
    let (stem, ext) = split_extension(file_name);
    let stem = truncate_bytes(stem, max.saturating_sub(ext.len()).max(1));
    format!("{}{}", stem, ext)
}

/// Insert `_<suffix>` before the file extension, shortening the stem when
/// the result would exceed [`MAX_FILE_NAME_BYTES`].
///
/// `"report.pdf"` with `"1aBcDeF"` becomes `"report_1aBcDeF.pdf"`.
pub fn insert_suffix(file_name: &str, suffix: &str) -> String {
    let (stem, ext) = split_extension(file_name);
    let budget = MAX_FILE_NAME_BYTES.saturating_sub(ext.len() + 1 + suffix.len());
    format!("{}_{}{}", truncate_bytes(stem, budget), suffix, ext)
}

/// Lowercase extension with its leading dot, or empty when there is none.
pub fn extension_of(file_name: &str) -> String {
    Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default()
}

/// The remote name as it will appear locally, before any id suffix:
/// sanitized, with the export extension appended for native documents and
/// capped at [`MAX_FILE_NAME_BYTES`].
pub fn base_file_name(item: &RemoteItem) -> String {
    let name = sanitize_file_name(&item.name);
    let name = match item.kind.export_extension() {
        Some(ext) if !name.to_ascii_lowercase().ends_with(ext) => format!("{}{}", name, ext),
        _ => name,
    };
    cap_file_name(&name, MAX_FILE_NAME_BYTES)
}

/// Deterministic `name-id7` file name for an item.
pub fn name_id7(item: &RemoteItem) -> String {
    insert_suffix(&base_file_name(item), id7(&item.id))
}

/// Choose the destination path for an item inside `dir`.
///
/// `taken` reports paths that belong to a different item (recorded earlier
/// or reserved by a concurrent fetch in this cycle). Under
/// [`FileNamePolicy::Name`] a taken path falls back to `name-id7`; if even
/// that is taken (two ids sharing a 7-character prefix) the full id is used.
pub fn destination(
    dir: &Path,
    item: &RemoteItem,
    policy: FileNamePolicy,
    taken: impl Fn(&Path) -> bool,
) -> PathBuf {
    if policy == FileNamePolicy::Name {
        let plain = dir.join(base_file_name(item));
        if !taken(&plain) {
            return plain;
        }
    }

    let short = dir.join(name_id7(item));
    if !taken(&short) {
        return short;
    }
    dir.join(insert_suffix(
        &base_file_name(item),
        &sanitize_file_name(&item.id),
    ))
}

/// Temp path a fetch writes to before renaming onto `final_path`.
///
/// Derived from the final name so a retry after a crash overwrites the
/// stale `.part` file instead of leaving another one behind.
pub fn part_path(final_path: &Path) -> PathBuf {
    let name = final_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    final_path.with_file_name(format!(".{}.part", name))
}
