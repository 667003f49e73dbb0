//! Archive detection and safe extraction.
//!
//! Handles the compressed containers personal data exports arrive in
//! (zip, tar, tar.gz, tar.bz2), including archives nested inside archives.
//! Every entry is checked for path traversal before anything is written,
//! and temporary extraction directories are cleaned up on all exit paths.

use flate2::read::GzDecoder;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Maximum depth of nested archives expanded during extraction.
const MAX_NESTED_DEPTH: u32 = 2;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("path does not exist: {0}")]
    NotFound(PathBuf),
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("unsafe path in archive: {0}")]
    UnsafePath(String),
    #[error("failed to extract {path}: {message}")]
    Extraction { path: PathBuf, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Supported archive container formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
    TarBz2,
}

/// Determine the archive format from the file name, or None if the path
/// is not a recognized archive.
pub fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let name = path.file_name()?.to_string_lossy().to_lowercase();

    if name.ends_with(".zip") {
        Some(ArchiveKind::Zip)
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(ArchiveKind::TarGz)
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz2") {
        Some(ArchiveKind::TarBz2)
    } else if name.ends_with(".tar") {
        Some(ArchiveKind::Tar)
    } else {
        None
    }
}

/// Check whether a path is a supported archive file.
pub fn is_archive(path: &Path) -> bool {
    path.is_file() && archive_kind(path).is_some()
}

/// Handle for an extracted archive.
///
/// When `is_temporary` is true the extraction directory is removed exactly
/// once: either by an explicit [`cleanup`](ExtractedArchive::cleanup) call
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct ExtractedArchive {
    pub source_path: PathBuf,
    pub extract_path: PathBuf,
    pub is_temporary: bool,
    cleaned: bool,
}

impl ExtractedArchive {
    /// Remove the temporary extraction directory, if owned.
    pub fn cleanup(&mut self) {
        if self.cleaned {
            return;
        }
        self.cleaned = true;
        if self.is_temporary && self.extract_path.exists() {
            debug!(path = %self.extract_path.display(), "removing temporary extraction directory");
            if let Err(e) = std::fs::remove_dir_all(&self.extract_path) {
                warn!(
                    path = %self.extract_path.display(),
                    error = %e,
                    "failed to remove extraction directory"
                );
            }
        }
    }
}

impl Drop for ExtractedArchive {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Extract an archive into `dest`, or into a fresh scratch directory when
/// `dest` is None.
///
/// Rejects any archive member whose path is absolute or contains a `..`
/// component before extracting anything. With `extract_nested`, archives
/// found inside the extracted tree are expanded in place (up to depth 2)
/// and the nested archive file removed afterwards; nested failures are
/// logged and skipped. If extraction fails and the destination was a
/// generated scratch directory, the directory is removed before the error
/// is returned.
pub fn extract_archive(
    archive_path: &Path,
    dest: Option<&Path>,
    extract_nested: bool,
) -> Result<ExtractedArchive, ArchiveError> {
    let kind = archive_kind(archive_path)
        .ok_or_else(|| ArchiveError::UnsupportedFormat(archive_path.to_path_buf()))?;

    let (dest_path, is_temporary) = match dest {
        Some(d) => (d.to_path_buf(), false),
        None => {
            let scratch =
                std::env::temp_dir().join(format!("shoebox-extract-{}", Uuid::new_v4()));
            std::fs::create_dir_all(&scratch)?;
            (scratch, true)
        }
    };

    info!(
        archive = %archive_path.display(),
        dest = %dest_path.display(),
        "extracting archive"
    );

    let result = (|| {
        extract_one(archive_path, kind, &dest_path)?;
        if extract_nested {
            extract_nested_archives(&dest_path, MAX_NESTED_DEPTH);
        }
        Ok(())
    })();

    match result {
        Ok(()) => Ok(ExtractedArchive {
            source_path: archive_path.to_path_buf(),
            extract_path: dest_path,
            is_temporary,
            cleaned: false,
        }),
        Err(e) => {
            // No leaked partial state: a generated scratch dir goes away
            // before the error propagates.
            if is_temporary && dest_path.exists() {
                let _ = std::fs::remove_dir_all(&dest_path);
            }
            Err(e)
        }
    }
}

fn extract_one(archive_path: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), ArchiveError> {
    match kind {
        ArchiveKind::Zip => extract_zip(archive_path, dest),
        ArchiveKind::Tar | ArchiveKind::TarGz | ArchiveKind::TarBz2 => {
            extract_tar(archive_path, kind, dest)
        }
    }
}

fn extraction_error(archive_path: &Path, err: impl std::fmt::Display) -> ArchiveError {
    ArchiveError::Extraction {
        path: archive_path.to_path_buf(),
        message: err.to_string(),
    }
}

fn ensure_safe_name(name: &str) -> Result<(), ArchiveError> {
    let path = Path::new(name);
    let unsafe_path = name.starts_with('/')
        || path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir));
    if unsafe_path {
        return Err(ArchiveError::UnsafePath(name.to_string()));
    }
    Ok(())
}

fn extract_zip(archive_path: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| extraction_error(archive_path, e))?;

    let names: Vec<String> = archive.file_names().map(|n| n.to_string()).collect();
    for name in &names {
        ensure_safe_name(name)?;
    }

    archive
        .extract(dest)
        .map_err(|e| extraction_error(archive_path, e))
}

fn open_tar(
    archive_path: &Path,
    kind: ArchiveKind,
) -> Result<tar::Archive<Box<dyn Read>>, ArchiveError> {
    let file = std::fs::File::open(archive_path)?;
    let reader: Box<dyn Read> = match kind {
        ArchiveKind::Tar => Box::new(file),
        ArchiveKind::TarGz => Box::new(GzDecoder::new(file)),
        ArchiveKind::TarBz2 => Box::new(bzip2::read::BzDecoder::new(file)),
        ArchiveKind::Zip => unreachable!("zip handled separately"),
    };
    Ok(tar::Archive::new(reader))
}

fn extract_tar(archive_path: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), ArchiveError> {
    // First pass validates every entry path; the reader is consumed, so the
    // archive is reopened for the actual unpack.
    let mut archive = open_tar(archive_path, kind)?;
    for entry in archive
        .entries()
        .map_err(|e| extraction_error(archive_path, e))?
    {
        let entry = entry.map_err(|e| extraction_error(archive_path, e))?;
        let entry_path = entry
            .path()
            .map_err(|e| extraction_error(archive_path, e))?;
        ensure_safe_name(&entry_path.to_string_lossy())?;
    }

    let mut archive = open_tar(archive_path, kind)?;
    archive
        .unpack(dest)
        .map_err(|e| extraction_error(archive_path, e))
}

/// Directory a nested archive expands into: the archive name minus its
/// archive extension, next to the archive itself.
fn nested_dest(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let lower = name.to_lowercase();

    let stem_len = if lower.ends_with(".tar.gz") {
        name.len() - 7
    } else if lower.ends_with(".tar.bz2") {
        name.len() - 8
    } else {
        name.rfind('.').unwrap_or(name.len())
    };

    let stem = if stem_len == 0 { "extracted" } else { &name[..stem_len] };
    path.with_file_name(stem)
}

fn extract_nested_archives(base: &Path, depth: u32) {
    if depth == 0 {
        return;
    }

    // Snapshot the file list first; extraction mutates the tree underneath.
    let mut nested: Vec<PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(base)
        .into_iter()
        .filter_map(|e| e.ok())
    {
        if entry.file_type().is_file() && is_archive(entry.path()) {
            nested.push(entry.into_path());
        }
    }
    nested.sort();

    for archive_path in nested {
        let Some(kind) = archive_kind(&archive_path) else {
            continue;
        };
        let dest = nested_dest(&archive_path);

        debug!(archive = %archive_path.display(), "extracting nested archive");

        let result = (|| {
            if !dest.exists() {
                std::fs::create_dir_all(&dest)?;
            }
            extract_one(&archive_path, kind, &dest)
        })();

        match result {
            Ok(()) => {
                if let Err(e) = std::fs::remove_file(&archive_path) {
                    warn!(
                        archive = %archive_path.display(),
                        error = %e,
                        "failed to remove nested archive after extraction"
                    );
                }
                extract_nested_archives(&dest, depth - 1);
            }
            Err(e) => {
                warn!(
                    archive = %archive_path.display(),
                    error = %e,
                    "failed to extract nested archive, skipping"
                );
            }
        }
    }
}

/// Scoped access to a path's contents.
///
/// Directories and plain files are borrowed unchanged; archives are
/// extracted into a scratch directory that is removed when the guard drops.
#[derive(Debug)]
pub enum Extracted {
    /// The original path, used as-is (directory or plain file).
    Original(PathBuf),
    /// An owned temporary extraction.
    Archive(ExtractedArchive),
}

impl Extracted {
    /// The path to read content from.
    pub fn path(&self) -> &Path {
        match self {
            Extracted::Original(p) => p,
            Extracted::Archive(a) => &a.extract_path,
        }
    }
}

/// Extract `path` if it is an archive, otherwise use it unchanged.
pub fn extracted(path: &Path) -> Result<Extracted, ArchiveError> {
    if !path.exists() {
        return Err(ArchiveError::NotFound(path.to_path_buf()));
    }

    if path.is_dir() || !is_archive(path) {
        Ok(Extracted::Original(path.to_path_buf()))
    } else {
        Ok(Extracted::Archive(extract_archive(path, None, true)?))
    }
}
