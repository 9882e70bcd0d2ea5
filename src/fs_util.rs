use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use flate2::read::MultiGzDecoder;
use zip::ZipArchive;

use crate::cancel::CancelToken;
use crate::error::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveKind {
    Zip,
    Gzip,
}

fn archive_kind(path: &Path) -> Option<ArchiveKind> {
    let ext = path.extension()?.to_str()?;
    if ext.eq_ignore_ascii_case("zip") {
        Some(ArchiveKind::Zip)
    } else if ext.eq_ignore_ascii_case("gz") {
        Some(ArchiveKind::Gzip)
    } else {
        None
    }
}

pub fn is_archive(path: &Path) -> bool {
    archive_kind(path).is_some()
}

pub fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}

pub fn extract_zip(
    zip_path: &Path,
    target_dir: &Path,
    cancel: &CancelToken,
) -> Result<usize, IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| IngestError::expansion(zip_path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| IngestError::expansion(zip_path, err))?;
    fs::create_dir_all(target_dir).map_err(|err| IngestError::Filesystem(err.to_string()))?;

    let mut files = 0usize;
    for i in 0..archive.len() {
        cancel.check()?;
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::expansion(zip_path, err))?;
        let entry_path = match entry.enclosed_name() {
            Some(path) => target_dir.join(path),
            None => {
                return Err(IngestError::expansion(
                    zip_path,
                    format!("entry {:?} escapes the destination", entry.name()),
                ));
            }
        };

        if entry.is_dir() {
            fs::create_dir_all(&entry_path)
                .map_err(|err| IngestError::Filesystem(err.to_string()))?;
            continue;
        }

        if let Some(parent) = entry_path.parent() {
            fs::create_dir_all(parent).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        let mut outfile =
            fs::File::create(&entry_path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        io::copy(&mut entry, &mut outfile).map_err(|err| IngestError::expansion(zip_path, err))?;
        files += 1;
    }
    Ok(files)
}

pub fn validate_zip(zip_path: &Path) -> Result<(), IngestError> {
    let file = fs::File::open(zip_path).map_err(|err| IngestError::expansion(zip_path, err))?;
    let mut archive = ZipArchive::new(file).map_err(|err| IngestError::expansion(zip_path, err))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| IngestError::expansion(zip_path, err))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| IngestError::expansion(zip_path, err))?;
    }
    Ok(())
}

// Every member of a concatenated stream is decoded, not just the first.
fn gunzip(gz_path: &Path) -> Result<PathBuf, IngestError> {
    let target = gz_path.with_extension("");
    let input = fs::File::open(gz_path).map_err(|err| IngestError::expansion(gz_path, err))?;
    let mut decoder = MultiGzDecoder::new(input);
    let mut output =
        fs::File::create(&target).map_err(|err| IngestError::Filesystem(err.to_string()))?;
    io::copy(&mut decoder, &mut output).map_err(|err| IngestError::expansion(gz_path, err))?;
    Ok(target)
}

pub fn expand(
    archive_path: &Path,
    destination_dir: &Path,
    cancel: &CancelToken,
) -> Result<usize, IngestError> {
    match archive_kind(archive_path) {
        Some(ArchiveKind::Gzip) => {
            return Err(IngestError::expansion(
                archive_path,
                "top-level archive must be a zip file",
            ));
        }
        Some(ArchiveKind::Zip) | None => {}
    }
    extract_zip(archive_path, destination_dir, cancel)?;

    let mut nested = 0usize;
    let mut pending = VecDeque::from([destination_dir.to_path_buf()]);
    while let Some(dir) = pending.pop_front() {
        for path in walk_dir(&dir)? {
            cancel.check()?;
            if !path.is_file() {
                continue;
            }
            match archive_kind(&path) {
                Some(ArchiveKind::Zip) => {
                    let subdir = path.with_extension("");
                    tracing::debug!(archive = %path.display(), "expanding nested archive");
                    extract_zip(&path, &subdir, cancel)?;
                    fs::remove_file(&path)
                        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
                    pending.push_back(subdir);
                    nested += 1;
                }
                Some(ArchiveKind::Gzip) => {
                    let target = gunzip(&path)?;
                    fs::remove_file(&path)
                        .map_err(|err| IngestError::Filesystem(err.to_string()))?;
                    if is_archive(&target) {
                        pending.push_back(dir.clone());
                    }
                    nested += 1;
                }
                None => {}
            }
        }
    }
    Ok(nested)
}

pub fn walk_dir(root: &Path) -> Result<Vec<PathBuf>, IngestError> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let entries = fs::read_dir(&path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        for entry in entries {
            let entry = entry.map_err(|err| IngestError::Filesystem(err.to_string()))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path.clone());
            }
            items.push(path);
        }
    }
    items.sort();
    Ok(items)
}

#[derive(Debug)]
pub struct ExtractionWorkspace {
    path: PathBuf,
    keep: bool,
}

impl ExtractionWorkspace {
    pub fn create(path: impl Into<PathBuf>) -> Result<Self, IngestError> {
        let path = path.into();
        if path.exists() {
            tracing::debug!(path = %path.display(), "removing stale extraction");
            fs::remove_dir_all(&path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        }
        fs::create_dir_all(&path).map_err(|err| IngestError::Filesystem(err.to_string()))?;
        Ok(Self { path, keep: false })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for ExtractionWorkspace {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "failed to remove extraction: {err}");
            }
        }
    }
}
