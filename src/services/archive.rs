// Zip archive extraction into an exclusively owned, self-deleting scratch area

use std::fs::{File, OpenOptions};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;

use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::types::{Candidate, CandidateSource};
use crate::services::validation::has_image_extension;

pub const ARCHIVE_EXTENSION: &str = "zip";

/// macOS resource-fork directory; extracted but never processed
pub const RESOURCE_FORK_DIR: &str = "__MACOSX";

const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

pub fn is_archive_name(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case(ARCHIVE_EXTENSION))
        .unwrap_or(false)
}

fn in_resource_fork(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str() == RESOURCE_FORK_DIR)
}

fn is_symlink_mode(unix_mode: Option<u32>) -> bool {
    unix_mode
        .map(|mode| mode & S_IFMT == S_IFLNK)
        .unwrap_or(false)
}

/// Regular file that is not a link; never follows symlinks
fn is_plain_file(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_file())
        .unwrap_or(false)
}

/// Caps applied while unpacking one archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_entries: usize,
    pub max_total_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_entries: 10_000,
            max_total_bytes: 1024 * 1024 * 1024,
        }
    }
}

/// Extracted archive contents for one batch request.
///
/// Deleted by `release`, or by `Drop` if the batch exits early.
pub struct ScratchArea {
    dir: TempDir,
    extracted: PathBuf,
    entries: Vec<PathBuf>,
}

impl ScratchArea {
    /// Candidate image entries, relative to the extraction root, in archive listing order
    pub fn entries(&self) -> &[PathBuf] {
        &self.entries
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Copy one entry out of the scratch area. Links are refused.
    pub async fn read_candidate(&self, entry: &Path) -> io::Result<Candidate> {
        let path = self.extracted.join(entry);
        let meta = tokio::fs::symlink_metadata(&path).await?;
        if !meta.file_type().is_file() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", entry.display()),
            ));
        }

        let bytes = tokio::fs::read(&path).await?;
        let name = entry
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        Ok(Candidate::new(name, bytes, CandidateSource::ArchiveEntry))
    }

    /// Delete the scratch area and everything extracted into it.
    pub fn release(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!("🧹 Removed scratch area {}", path.display()),
            Err(e) => warn!("Failed to remove scratch area {}: {}", path.display(), e),
        }
    }
}

/// Unpacks uploaded archives into private scratch areas
#[derive(Debug, Clone, Default)]
pub struct ArchiveExtractor {
    scratch_parent: Option<PathBuf>,
    limits: ArchiveLimits,
}

impl ArchiveExtractor {
    pub fn new(scratch_parent: Option<PathBuf>, limits: ArchiveLimits) -> Self {
        Self {
            scratch_parent,
            limits,
        }
    }

    /// Extract `archive_bytes` and list its candidate images. Blocking.
    ///
    /// Entries are written one by one as regular files. Directories, links and
    /// names that would land outside the scratch area are skipped.
    #[instrument(skip(self, archive_bytes), fields(archive_size = archive_bytes.len()))]
    pub fn extract(&self, archive_bytes: &[u8]) -> PipelineResult<ScratchArea> {
        let builder = {
            let mut builder = tempfile::Builder::new();
            builder.prefix("unet_batch_");
            builder
        };
        let dir = match &self.scratch_parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        }
        .map_err(PipelineError::Scratch)?;

        let archive_path = dir.path().join("upload.zip");
        std::fs::write(&archive_path, archive_bytes).map_err(PipelineError::Scratch)?;

        let file = File::open(&archive_path).map_err(PipelineError::Scratch)?;
        let mut archive =
            ZipArchive::new(file).map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;

        if archive.len() > self.limits.max_entries {
            return Err(PipelineError::ArchiveTooLarge(format!(
                "{} entries, limit is {}",
                archive.len(),
                self.limits.max_entries
            )));
        }

        let extracted = dir.path().join("extracted");
        std::fs::create_dir_all(&extracted).map_err(PipelineError::Scratch)?;

        let mut remaining = self.limits.max_total_bytes;
        let mut listing = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| PipelineError::ArchiveCorrupt(e.to_string()))?;
            if entry.is_dir() {
                continue;
            }
            if is_symlink_mode(entry.unix_mode()) {
                warn!("Skipping symlink archive entry: {}", entry.name());
                continue;
            }
            let Some(relative) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
                warn!("Skipping archive entry with unsafe path: {}", entry.name());
                continue;
            };
            if entry.size() > remaining {
                return Err(self.too_large());
            }

            let target = extracted.join(&relative);
            let created = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| OpenOptions::new().write(true).create_new(true).open(&target));
            let mut out = match created {
                Ok(out) => out,
                Err(e) => {
                    warn!("Skipping archive entry {}: {}", relative.display(), e);
                    continue;
                }
            };

            // Declared sizes can lie; cap what is actually inflated
            let mut capped = (&mut entry).take(remaining.saturating_add(1));
            let written = io::copy(&mut capped, &mut out).map_err(|e| {
                PipelineError::ArchiveCorrupt(format!("{}: {}", relative.display(), e))
            })?;
            if written > remaining {
                return Err(self.too_large());
            }
            remaining -= written;
            listing.push(relative);
        }

        let total = listing.len();
        let entries: Vec<PathBuf> = listing
            .into_iter()
            .filter(|path| !in_resource_fork(path))
            .filter(|path| path.to_str().map(has_image_extension).unwrap_or(false))
            .filter(|path| is_plain_file(&extracted.join(path)))
            .collect();

        info!(
            "Extracted {} files into {}, {} candidate images",
            total,
            dir.path().display(),
            entries.len()
        );

        Ok(ScratchArea {
            dir,
            extracted,
            entries,
        })
    }

    fn too_large(&self) -> PipelineError {
        PipelineError::ArchiveTooLarge(format!(
            "uncompressed contents exceed {} bytes",
            self.limits.max_total_bytes
        ))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    /// Build an in-memory zip from (name, contents) pairs
    pub(crate) fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, contents) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_archive_name_detection() {
        assert!(is_archive_name("batch.zip"));
        assert!(is_archive_name("BATCH.ZIP"));
        assert!(!is_archive_name("cat.jpg"));
        assert!(!is_archive_name("zip"));
    }

    #[tokio::test]
    async fn test_extract_filters_entries() {
        let bytes = build_zip(&[
            ("a.png", b"not really a png"),
            ("b.txt", b"hello"),
            ("__MACOSX/._a.png", b"resource fork"),
            ("sub/c.JPG", b"jpeg bytes"),
        ]);

        let scratch = ArchiveExtractor::default().extract(&bytes).unwrap();
        assert_eq!(
            scratch.entries(),
            &[PathBuf::from("a.png"), PathBuf::from("sub/c.JPG")]
        );

        // Sentinel entries are still physically extracted
        assert!(scratch.path().join("extracted/__MACOSX/._a.png").is_file());

        let candidate = scratch.read_candidate(&scratch.entries()[1]).await.unwrap();
        assert_eq!(candidate.name, "sub/c.JPG");
        assert_eq!(candidate.bytes, b"jpeg bytes");
        assert_eq!(candidate.source, CandidateSource::ArchiveEntry);
    }

    #[test]
    fn test_release_removes_scratch_area() {
        let bytes = build_zip(&[("a.png", b"x")]);
        let scratch = ArchiveExtractor::default().extract(&bytes).unwrap();
        let path = scratch.path().to_path_buf();
        assert!(path.exists());

        scratch.release();
        assert!(!path.exists());
    }

    #[test]
    fn test_drop_removes_scratch_area() {
        let bytes = build_zip(&[("a.png", b"x")]);
        let path = {
            let scratch = ArchiveExtractor::default().extract(&bytes).unwrap();
            scratch.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_corrupt_archive_rejected() {
        let err = ArchiveExtractor::default()
            .extract(b"PK\x03\x04 this is not a zip")
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::ArchiveCorrupt(_)));
    }

    #[test]
    fn test_scratch_parent_is_honoured() {
        let parent = tempfile::tempdir().unwrap();
        let bytes = build_zip(&[("a.png", b"x")]);
        let scratch = ArchiveExtractor::new(
            Some(parent.path().to_path_buf()),
            ArchiveLimits::default(),
        )
        .extract(&bytes)
            .unwrap();
        assert!(scratch.path().starts_with(parent.path()));
    }

    #[test]
    fn test_symlink_entries_are_not_followed() {
        let outside = tempfile::tempdir().unwrap();
        let secret = outside.path().join("secret.png");
        std::fs::write(&secret, crate::test_support::png_bytes(4, 4)).unwrap();

        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_symlink("leak.png", secret.to_string_lossy(), SimpleFileOptions::default())
            .unwrap();
        writer.start_file("a.png", SimpleFileOptions::default()).unwrap();
        writer.write_all(b"inside").unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let scratch = ArchiveExtractor::default().extract(&bytes).unwrap();
        assert_eq!(scratch.entries(), &[PathBuf::from("a.png")]);
        assert!(std::fs::symlink_metadata(scratch.path().join("extracted/leak.png")).is_err());
    }

    #[tokio::test]
    async fn test_read_candidate_refuses_links() {
        let bytes = build_zip(&[("a.png", b"inside")]);
        let scratch = ArchiveExtractor::default().extract(&bytes).unwrap();

        #[cfg(unix)]
        {
            let outside = tempfile::tempdir().unwrap();
            let secret = outside.path().join("secret.png");
            std::fs::write(&secret, b"secret").unwrap();
            std::os::unix::fs::symlink(&secret, scratch.path().join("extracted/link.png")).unwrap();

            let err = scratch.read_candidate(Path::new("link.png")).await.unwrap_err();
            assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        }

        let candidate = scratch.read_candidate(Path::new("a.png")).await.unwrap();
        assert_eq!(candidate.bytes, b"inside");
    }

    #[test]
    fn test_unsafe_names_are_skipped() {
        let bytes = build_zip(&[("../evil.png", b"escape"), ("ok.png", b"fine")]);
        let parent = tempfile::tempdir().unwrap();

        let scratch = ArchiveExtractor::new(
            Some(parent.path().to_path_buf()),
            ArchiveLimits::default(),
        )
        .extract(&bytes)
            .unwrap();

        assert_eq!(scratch.entries(), &[PathBuf::from("ok.png")]);
        assert!(!scratch.path().join("evil.png").exists());
        assert!(!parent.path().join("evil.png").exists());
    }

    #[test]
    fn test_entry_count_limit() {
        let bytes = build_zip(&[("a.png", b"1"), ("b.png", b"2"), ("c.png", b"3")]);
        let limits = ArchiveLimits {
            max_entries: 2,
            ..ArchiveLimits::default()
        };
        let err = ArchiveExtractor::new(None, limits).extract(&bytes).err().unwrap();
        assert!(matches!(err, PipelineError::ArchiveTooLarge(_)));
    }

    #[test]
    fn test_uncompressed_size_limit() {
        let big = vec![0u8; 4096];
        let bytes = build_zip(&[("a.png", b"small"), ("b.png", big.as_slice())]);
        let parent = tempfile::tempdir().unwrap();
        let limits = ArchiveLimits {
            max_entries: 10,
            max_total_bytes: 1024,
        };

        let err = ArchiveExtractor::new(Some(parent.path().to_path_buf()), limits)
            .extract(&bytes)
            .err()
            .unwrap();
        assert!(matches!(err, PipelineError::ArchiveTooLarge(_)));
        // The half-built scratch area is removed on the error path
        assert!(std::fs::read_dir(parent.path()).unwrap().next().is_none());
    }
}
