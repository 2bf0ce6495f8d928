//! Filesystem helpers shared across the harvest pipeline.
//!
//! Covers safe file naming, the run-scoped temp workspace, content-type
//! sniffing for downloaded bundles, and cross-device file moves.

use std::env;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::debug;

/// Content type reported for zip data by [`detect_content_type`].
pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Workspaces fall back to the working directory when the system temp
/// location has less free space than this (5 GB).
const MIN_TEMP_FREE_BYTES: u64 = 5 * 1024 * 1024 * 1024;

const BYTE_UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

/// Renders a byte count in SI units with one decimal, e.g. `1.4 MB`.
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    #[allow(clippy::cast_precision_loss)]
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1000.0 && unit < BYTE_UNITS.len() - 1 {
        value /= 1000.0;
        unit += 1;
    }
    format!("{value:.1} {}", BYTE_UNITS[unit])
}

/// Returns `count` random bytes encoded as lowercase hex.
#[must_use]
pub fn random_hex(count: usize) -> String {
    let mut bytes = vec![0u8; count];
    rand::thread_rng().fill(&mut bytes[..]);
    bytes.iter().fold(String::with_capacity(count * 2), |mut out, b| {
        use std::fmt::Write;
        let _ = write!(out, "{b:02x}");
        out
    })
}

/// Maps a string to something safe to use as a file name: letters, digits
/// and dots pass through, everything else becomes `-`.
#[must_use]
pub fn safe_file_name(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' { c } else { '-' })
        .collect()
}

/// Like [`safe_file_name`], with a random hex suffix to avoid collisions.
#[must_use]
pub fn safe_file_name_rnd(value: &str) -> String {
    format!("{}_{}", safe_file_name(value), random_hex(6))
}

/// File stem of `path` as an owned string, empty when there is none.
#[must_use]
pub fn file_stem_lossy(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Creates a uniquely named run workspace directory.
///
/// The directory lives under the system temp location unless that volume
/// has less than 5 GB free, in which case the current working directory
/// is used instead. Extracted leak bundles can be large.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn temp_workspace(prefix: &str) -> io::Result<PathBuf> {
    let mut base = env::temp_dir();
    if let Some(free) = available_disk_space(&base) {
        debug!(path = %base.display(), free = %format_bytes(free), "free disk space");
        if free <= MIN_TEMP_FREE_BYTES
            && let Ok(cwd) = env::current_dir()
        {
            base = cwd;
            debug!(path = %base.display(), "temp volume low on space, using working directory");
        }
    }

    let path = base.join(format!("{prefix}{}", random_hex(16)));
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Sniffs the content type of a file from its first 512 bytes.
///
/// Recognizes the archive and document formats a provider bundle could
/// plausibly be; falls back to `text/plain` for printable content and
/// `application/octet-stream` otherwise.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn detect_content_type(path: &Path) -> io::Result<&'static str> {
    let file = fs::File::open(path)?;
    let mut head = Vec::with_capacity(512);
    file.take(512).read_to_end(&mut head)?;
    Ok(sniff_content_type(&head))
}

fn sniff_content_type(head: &[u8]) -> &'static str {
    // PK\x03\x04 plus the empty and spanned zip signatures.
    if head.starts_with(&[0x50, 0x4B, 0x03, 0x04])
        || head.starts_with(&[0x50, 0x4B, 0x05, 0x06])
        || head.starts_with(&[0x50, 0x4B, 0x07, 0x08])
    {
        return ZIP_CONTENT_TYPE;
    }
    if head.starts_with(&[0x1F, 0x8B]) {
        return "application/gzip";
    }
    if head.starts_with(&[0x37, 0x7A, 0xBC, 0xAF, 0x27, 0x1C]) {
        return "application/x-7z-compressed";
    }
    if head.starts_with(b"Rar!\x1A\x07") {
        return "application/vnd.rar";
    }
    if head.starts_with(b"%PDF-") {
        return "application/pdf";
    }
    if head.starts_with(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A]) {
        return "image/png";
    }
    if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return "image/jpeg";
    }
    if looks_textual(head) {
        return "text/plain";
    }
    "application/octet-stream"
}

fn looks_textual(head: &[u8]) -> bool {
    !head.is_empty()
        && head
            .iter()
            .all(|&b| b >= 0x20 || matches!(b, b'\t' | b'\n' | b'\r' | 0x0C))
}

/// Moves a file, falling back to copy-and-remove when rename fails
/// (for example across filesystem boundaries).
///
/// # Errors
///
/// Returns an error if both the rename and the copy fallback fail.
pub fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)?;
    fs::remove_file(src)?;
    Ok(())
}

/// Strips a leading UTF-8 byte order mark if present.
#[must_use]
pub fn strip_utf8_bom(bytes: &[u8]) -> &[u8] {
    bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes)
}

#[cfg(unix)]
fn available_disk_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    // SAFETY: statvfs is a plain C struct for which all-zeroes is a valid
    // initial value.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    // SAFETY: c_path is a valid null-terminated C string, stat is a live
    // out-pointer, and the fields are only read after the call reports
    // success.
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &raw mut stat) };
    if rc != 0 {
        return None;
    }
    #[allow(clippy::unnecessary_cast)]
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(not(unix))]
fn available_disk_space(_path: &Path) -> Option<u64> {
    None
}
