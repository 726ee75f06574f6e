//! `tar.gz` archive container for backup points.
//!
//! Layout:
//!
//! ```text
//! manifest.json        ArchiveHeader (point id, chain, entries, tombstones)
//! files/<rel path>     one member per manifest entry
//! ```
//!
//! Content is hashed while it streams in and out so the caller never has to
//! trust an archive it has not read back.

use crate::error::{BackupError, Result};
use crate::manifest::ManifestEntry;
use crate::paths::{fsync_dir, LiveLayout};
use crate::point::PointKind;
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use tar::{Archive, Builder, EntryType, Header};

pub const ARCHIVE_FORMAT: u32 = 1;
pub const ARCHIVE_EXTENSION: &str = "tar.gz";
const HEADER_MEMBER: &str = "manifest.json";
const FILES_PREFIX: &str = "files/";

/// Manifest embedded in every archive so an archive can be audited without
/// the catalog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveHeader {
    pub format: u32,
    pub point_id: String,
    pub chain_id: String,
    pub kind: PointKind,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
    pub tombstones: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub sha256: String,
    pub size: u64,
}

/// What an archive actually holds: path → (BLAKE3 hex, size).
#[derive(Debug, Clone, Default)]
pub struct ArchiveContents {
    pub header: Option<ArchiveHeader>,
    pub files: BTreeMap<String, (String, u64)>,
}

/// Stream every header entry from `source_root` into a new archive at `dest`.
///
/// Fails if a file no longer matches the hash recorded during the scan.
pub fn write_archive(dest: &Path, source_root: &Path, header: &ArchiveHeader) -> Result<ArchiveSummary> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = Builder::new(encoder);

    let header_json = serde_json::to_vec_pretty(header)?;
    let mut tar_header = member_header(header_json.len() as u64, header.created_at);
    builder.append_data(&mut tar_header, HEADER_MEMBER, header_json.as_slice())?;

    for entry in &header.entries {
        let source = LiveLayout::resolve_under(source_root, &entry.path)?;
        let file = File::open(&source).map_err(|e| {
            BackupError::SnapshotWrite(format!("cannot read {}: {e}", entry.path))
        })?;
        let mut reader = HashingReader::new(file.take(entry.size));
        let mut tar_header = member_header(entry.size, header.created_at);
        builder.append_data(&mut tar_header, format!("{FILES_PREFIX}{}", entry.path), &mut reader)?;
        let (hash, read) = reader.finish();
        if read != entry.size || hash != entry.hash {
            return Err(BackupError::SnapshotWrite(format!(
                "{} changed while the backup was being written",
                entry.path
            )));
        }
    }

    let encoder = builder.into_inner()?;
    let file = encoder.finish()?;
    file.sync_all()?;
    if let Some(parent) = dest.parent() {
        fsync_dir(parent)?;
    }

    let (sha256, size) = sha256_file(dest)?;
    Ok(ArchiveSummary { sha256, size })
}

/// Read an archive without extracting it.
pub fn read_archive(path: &Path) -> Result<ArchiveContents> {
    walk_archive(path, None)
}

/// Extract the archive's files under `dest_root`, overwriting what is there.
pub fn extract_archive(path: &Path, dest_root: &Path) -> Result<ArchiveContents> {
    walk_archive(path, Some(dest_root))
}

fn walk_archive(path: &Path, dest_root: Option<&Path>) -> Result<ArchiveContents> {
    let file = File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(file));
    let mut contents = ArchiveContents::default();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().replace('\\', "/");
        if name == HEADER_MEMBER {
            contents.header = Some(serde_json::from_reader(&mut entry)?);
            continue;
        }
        let Some(rel) = name.strip_prefix(FILES_PREFIX) else {
            return Err(BackupError::integrity(
                path.display().to_string(),
                format!("unexpected archive member {name}"),
            ));
        };
        if entry.header().entry_type() != EntryType::Regular {
            return Err(BackupError::integrity(
                path.display().to_string(),
                format!("archive member {name} is not a regular file"),
            ));
        }

        let digest = match dest_root {
            Some(root) => {
                let target = LiveLayout::resolve_under(root, rel)?;
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = HashingWriter::new(File::create(&target)?);
                io::copy(&mut entry, &mut out)?;
                let (hash, size, file) = out.finish();
                file.sync_all()?;
                (hash, size)
            }
            None => {
                let mut out = HashingWriter::new(io::sink());
                io::copy(&mut entry, &mut out)?;
                let (hash, size, _) = out.finish();
                (hash, size)
            }
        };
        contents.files.insert(rel.to_string(), digest);
    }

    Ok(contents)
}

fn member_header(size: u64, mtime: DateTime<Utc>) -> Header {
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Regular);
    header.set_size(size);
    header.set_mode(0o600);
    header.set_mtime(mtime.timestamp().max(0) as u64);
    header
}

/// SHA-256 hex digest and size of a file.
pub fn sha256_file(path: &Path) -> Result<(String, u64)> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        size += n as u64;
        hasher.update(&buf[..n]);
    }
    Ok((hex::encode(hasher.finalize()), size))
}

struct HashingReader<R> {
    inner: R,
    hasher: blake3::Hasher,
    read: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            read: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (self.hasher.finalize().to_hex().to_string(), self.read)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.read += n as u64;
        Ok(n)
    }
}

struct HashingWriter<W> {
    inner: W,
    hasher: blake3::Hasher,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: blake3::Hasher::new(),
            written: 0,
        }
    }

    fn finish(self) -> (String, u64, W) {
        (self.hasher.finalize().to_hex().to_string(), self.written, self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
