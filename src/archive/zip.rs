//! Zip extraction for provider bundles and packing of the final artifact.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};
use zip::ZipArchive;
use zip::ZipWriter;
use zip::write::SimpleFileOptions;

/// Errors raised while reading or writing zip archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// The archive could not be opened or an entry could not be read.
    #[error("failed to read archive {path}: {reason}")]
    Read {
        /// The archive being read.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// The archive could not be created or finalized.
    #[error("failed to create archive {path}: {reason}")]
    Create {
        /// The archive being written.
        path: PathBuf,
        /// What went wrong.
        reason: String,
    },

    /// File system error during extraction or packing.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn read(path: &Path, error: &zip::result::ZipError) -> Self {
        Self::Read {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }

    fn create(path: &Path, error: &zip::result::ZipError) -> Self {
        Self::Create {
            path: path.to_path_buf(),
            reason: error.to_string(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Extracts a zip archive into `dest_path`, creating it if needed.
///
/// Entries with unsafe paths (absolute, or escaping the destination via
/// `..`) are skipped with a warning. Returns the extracted file paths.
///
/// # Errors
///
/// Returns [`ArchiveError::Read`] when the archive is corrupt and
/// [`ArchiveError::Io`] when writing an entry fails.
pub fn unpack_zip(archive_path: &Path, dest_path: &Path) -> Result<Vec<PathBuf>, ArchiveError> {
    debug!(
        archive = %archive_path.display(),
        dest = %dest_path.display(),
        "extracting zip bundle"
    );

    fs::create_dir_all(dest_path).map_err(|e| ArchiveError::io(dest_path, e))?;

    let file = File::open(archive_path).map_err(|e| ArchiveError::io(archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| ArchiveError::read(archive_path, &e))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| ArchiveError::read(archive_path, &e))?;

        let Some(relative) = entry.enclosed_name() else {
            warn!(entry = %entry.name(), "skipping entry with unsafe path");
            continue;
        };
        let out_path = dest_path.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| ArchiveError::io(&out_path, e))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ArchiveError::io(parent, e))?;
        }
        let mut out_file = File::create(&out_path).map_err(|e| ArchiveError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out_file).map_err(|e| ArchiveError::io(&out_path, e))?;
        extracted.push(out_path);
    }

    debug!(extracted = extracted.len(), "bundle extraction complete");
    Ok(extracted)
}

/// Packs every regular file at the top level of `dir` into a zip at `dest`.
///
/// Entries are written in name order with a fixed timestamp so the same
/// workspace always produces the same archive. Subdirectories are not
/// descended into, and a file that fails to pack is skipped with a
/// warning rather than aborting the archive.
///
/// Returns the number of files packed.
///
/// # Errors
///
/// Returns [`ArchiveError::Io`] when the workspace cannot be listed or
/// the destination cannot be created, and [`ArchiveError::Create`] when
/// the archive cannot be finalized.
pub fn pack_dir(dir: &Path, dest: &Path) -> Result<usize, ArchiveError> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| ArchiveError::io(dir, e))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    let file = File::create(dest).map_err(|e| ArchiveError::io(dest, e))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    let mut packed = 0usize;
    for path in entries {
        if !path.is_file() {
            debug!(path = %path.display(), "skipping non-file entry");
            continue;
        }
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            continue;
        };
        if let Err(error) = append_file(&mut writer, &path, &name, options) {
            warn!(path = %path.display(), %error, "failed to pack file, skipping");
            continue;
        }
        packed += 1;
    }

    writer.finish().map_err(|e| ArchiveError::create(dest, &e))?;
    debug!(packed, dest = %dest.display(), "archive packed");
    Ok(packed)
}

fn append_file(
    writer: &mut ZipWriter<File>,
    path: &Path,
    name: &str,
    options: SimpleFileOptions,
) -> Result<(), ArchiveError> {
    writer
        .start_file(name, options)
        .map_err(|e| ArchiveError::create(path, &e))?;
    let mut reader = File::open(path).map_err(|e| ArchiveError::io(path, e))?;
    io::copy(&mut reader, writer).map_err(|e| ArchiveError::io(path, e))?;
    Ok(())
}
