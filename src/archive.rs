//! Archive handling for ZIP file operations
//!
//! The input package is read fully into memory. Every variant is written
//! to a temporary file next to its destination and renamed into place, so
//! a failed or cancelled write never leaves a truncated ZIP behind.

use crate::error::{GhostPcbError, Result, ResultExt};
use crate::parser::{detect, MemberKind};
use chrono::{Datelike, NaiveDateTime, Timelike};
use md5::{Digest, Md5};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{ZipArchive, ZipWriter};

/// One named member of a package
#[derive(Debug, Clone, PartialEq)]
pub struct ArchiveEntry {
    pub path: String,
    pub data: Vec<u8>,
    /// Modification time recorded in the source ZIP
    pub modified: Option<zip::DateTime>,
}

impl ArchiveEntry {
    pub fn new(path: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            data,
            modified: None,
        }
    }
}

/// Content hash of a whole package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 16]);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// Ordered set of uniquely named members
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    entries: Vec<ArchiveEntry>,
}

impl Archive {
    /// Build an archive, rejecting duplicate paths and empty packages
    pub fn new(entries: Vec<ArchiveEntry>) -> Result<Self> {
        if entries.is_empty() {
            return Err(GhostPcbError::archive("archive contains no files").into());
        }
        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.path.as_str()) {
                return Err(
                    GhostPcbError::archive(format!("duplicate member {}", entry.path)).into(),
                );
            }
        }
        Ok(Self { entries })
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Hash over member names and contents, in order
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Md5::new();
        for entry in &self.entries {
            hasher.update(entry.path.as_bytes());
            hasher.update([0u8]);
            hasher.update((entry.data.len() as u64).to_le_bytes());
            hasher.update(&entry.data);
        }
        Fingerprint(hasher.finalize().into())
    }
}

/// Reads an input package
pub struct ArchiveReader;

impl ArchiveReader {
    /// Load every file member of the ZIP at `path`
    pub fn load(path: &Path) -> Result<Archive> {
        info!("Loading archive: {}", path.display());

        let file = fs::File::open(path).map_err(|e| {
            GhostPcbError::archive(format!("cannot open {}: {}", path.display(), e))
        })?;
        let mut zip = ZipArchive::new(file).map_err(|e| {
            GhostPcbError::archive(format!("{} is not a valid ZIP: {}", path.display(), e))
        })?;

        let mut entries = Vec::with_capacity(zip.len());
        for i in 0..zip.len() {
            let mut member = zip.by_index(i).map_err(|e| {
                GhostPcbError::archive(format!("cannot read member at index {}: {}", i, e))
            })?;
            if member.is_dir() {
                continue;
            }

            let name = member.name().to_string();
            let mut data = Vec::with_capacity(member.size() as usize);
            member.read_to_end(&mut data).map_err(|e| {
                GhostPcbError::archive(format!("cannot decompress {}: {}", name, e))
            })?;
            debug!("Read member {} ({} bytes)", name, data.len());

            entries.push(ArchiveEntry {
                path: name,
                data,
                modified: member.last_modified(),
            });
        }

        let archive = Archive::new(entries)?;
        let cam_members = archive
            .entries()
            .iter()
            .filter(|e| detect(&e.path, &e.data) != MemberKind::Other)
            .count();
        if cam_members == 0 {
            return Err(GhostPcbError::archive(format!(
                "{} contains no Gerber or Excellon files",
                path.display()
            ))
            .into());
        }

        info!(
            "Loaded {} members ({} CAM) from {}",
            archive.len(),
            cam_members,
            path.display()
        );
        Ok(archive)
    }
}

/// Writes variant packages
pub struct ArchiveWriter;

impl ArchiveWriter {
    /// Write `archive` to `destination` through a temporary file.
    ///
    /// When `modified` is given every entry carries that time, otherwise
    /// the source entry's time is kept.
    pub fn write(
        archive: &Archive,
        destination: &Path,
        modified: Option<NaiveDateTime>,
    ) -> Result<()> {
        let fail = |reason: String| GhostPcbError::Write {
            path: destination.display().to_string(),
            reason,
        };

        let parent = destination
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let tmp = NamedTempFile::new_in(parent)
            .map_err(|e| fail(format!("cannot create temporary file: {}", e)))?;

        let stamp = modified.and_then(Self::zip_time);
        let mut zip = ZipWriter::new(tmp);
        for entry in archive.entries() {
            zip.start_file(entry.path.as_str(), Self::entry_options(stamp.or(entry.modified)))
                .map_err(|e| fail(format!("cannot start entry {}: {}", entry.path, e)))?;
            zip.write_all(&entry.data)
                .map_err(|e| fail(format!("cannot write entry {}: {}", entry.path, e)))?;
        }

        let tmp = zip
            .finish()
            .map_err(|e| fail(format!("cannot finalize ZIP: {}", e)))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| fail(format!("cannot flush ZIP: {}", e)))?;
        tmp.persist(destination)
            .map_err(|e| fail(format!("cannot move ZIP into place: {}", e.error)))?;

        debug!("Wrote {}", destination.display());
        Ok(())
    }

    fn entry_options(modified: Option<zip::DateTime>) -> SimpleFileOptions {
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(0o644);
        match modified {
            Some(time) => options.last_modified_time(time),
            None => options,
        }
    }

    fn zip_time(time: NaiveDateTime) -> Option<zip::DateTime> {
        zip::DateTime::from_date_and_time(
            u16::try_from(time.year()).ok()?,
            time.month() as u8,
            time.day() as u8,
            time.hour() as u8,
            time.minute() as u8,
            time.second() as u8,
        )
        .ok()
    }
}

/// Input file name without its extension
pub fn base_name(input: &Path) -> String {
    input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "gerber".to_string())
}

/// `<dir>/<base>_obf<index>.zip`
pub fn output_path(dir: &Path, base: &str, index: u32) -> PathBuf {
    dir.join(format!("{}_obf{}.zip", base, index))
}

/// Resolve and create the directory variants are written to
pub fn prepare_output_dir(input: &Path, output_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => input
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    if !dir.exists() {
        fs::create_dir_all(&dir).with_path_context("create output directory", &dir)?;
        info!("Created output directory: {}", dir.display());
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use tempfile::TempDir;

    const GERBER: &[u8] = b"%FSLAX46Y46*%\n%MOMM*%\nD10*\nX0Y0D03*\nM02*\n";

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let mut zip = ZipWriter::new(fs::File::create(path).unwrap());
        for (name, data) in members {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    fn archive_error(path: &Path) -> bool {
        let err = ArchiveReader::load(path).unwrap_err();
        matches!(classify(&err), Some(GhostPcbError::Archive { .. }))
    }

    #[test]
    fn test_load_rejects_bad_packages() {
        let dir = TempDir::new().unwrap();

        let not_zip = dir.path().join("board.zip");
        fs::write(&not_zip, b"definitely not a zip").unwrap();
        assert!(archive_error(&not_zip));

        let empty = dir.path().join("empty.zip");
        write_zip(&empty, &[]);
        assert!(archive_error(&empty));

        let no_cam = dir.path().join("docs.zip");
        write_zip(&no_cam, &[("README.txt", b"hello")]);
        assert!(archive_error(&no_cam));

        assert!(archive_error(&dir.path().join("missing.zip")));
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("board.zip");
        write_zip(&source, &[("top.gtl", GERBER), ("README.txt", b"notes")]);

        let archive = ArchiveReader::load(&source).unwrap();
        assert_eq!(archive.len(), 2);

        let stamp = chrono::NaiveDate::from_ymd_opt(2024, 2, 29)
            .and_then(|d| d.and_hms_opt(14, 7, 20))
            .unwrap();
        let out = output_path(dir.path(), &base_name(&source), 1);
        ArchiveWriter::write(&archive, &out, Some(stamp)).unwrap();
        assert!(out.ends_with("board_obf1.zip"));

        let reloaded = ArchiveReader::load(&out).unwrap();
        assert_eq!(reloaded.fingerprint(), archive.fingerprint());

        let mut zip = ZipArchive::new(fs::File::open(&out).unwrap()).unwrap();
        let entry = zip.by_name("top.gtl").unwrap();
        let time = entry.last_modified().unwrap();
        assert_eq!((time.year(), time.month(), time.day()), (2024, 2, 29));
        assert_eq!((time.hour(), time.minute()), (14, 7));
    }

    #[test]
    fn test_fingerprint_tracks_content_and_names() {
        let a = Archive::new(vec![ArchiveEntry::new("a.gbr", b"X".to_vec())]).unwrap();
        let b = Archive::new(vec![ArchiveEntry::new("a.gbr", b"Y".to_vec())]).unwrap();
        let c = Archive::new(vec![ArchiveEntry::new("b.gbr", b"X".to_vec())]).unwrap();
        assert_ne!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_eq!(a.fingerprint().to_string().len(), 32);

        let dup = Archive::new(vec![
            ArchiveEntry::new("a.gbr", vec![]),
            ArchiveEntry::new("a.gbr", vec![]),
        ]);
        assert!(dup.is_err());
    }

    #[test]
    fn test_output_dir_defaults_to_input_dir() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("board.zip");
        assert_eq!(prepare_output_dir(&input, None).unwrap(), dir.path());

        let nested = dir.path().join("out/variants");
        assert_eq!(prepare_output_dir(&input, Some(nested.as_path())).unwrap(), nested);
        assert!(nested.is_dir());
    }
}
