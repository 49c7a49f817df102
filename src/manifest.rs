//! Shard file headers and import planning.
//!
//! Every shard file starts with the number of entries it holds, as an
//! 8-byte little-endian unsigned integer. The remainder belongs to the
//! node engine and is never parsed here: the header is trusted.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use fs_err::{self as fs, File};
use serde::Serialize;

use crate::error::{MeshError, Result};

pub const SHARD_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManifestFile {
    pub path: PathBuf,
    pub entries: u64,
}

/// Header counts of every shard file in a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPlan {
    pub files: Vec<ManifestFile>,
    pub total: u64,
}

pub fn encode_shard_header(count: u64) -> [u8; SHARD_HEADER_LEN] {
    count.to_le_bytes()
}

/// `None` if `bytes` is shorter than the header.
pub fn decode_shard_header(bytes: &[u8]) -> Option<u64> {
    let header: [u8; SHARD_HEADER_LEN] = bytes.get(..SHARD_HEADER_LEN)?.try_into().ok()?;
    Some(u64::from_le_bytes(header))
}

pub fn write_shard_header<W: Write>(writer: &mut W, count: u64) -> io::Result<()> {
    writer.write_all(&encode_shard_header(count))
}

/// Read only the header of one shard file.
pub fn read_shard_header(path: &Path) -> Result<u64> {
    let file = File::open(path)?;
    let mut header = Vec::with_capacity(SHARD_HEADER_LEN);
    file.take(SHARD_HEADER_LEN as u64).read_to_end(&mut header)?;
    decode_shard_header(&header).ok_or_else(|| MeshError::MalformedManifest {
        path: path.to_path_buf(),
        reason: format!(
            "{} bytes is shorter than the {SHARD_HEADER_LEN}-byte header",
            header.len()
        ),
    })
}

/// Regular, non-hidden files directly inside `dir`, sorted by path.
///
/// Hidden files are skipped so that engines can stage partial output
/// under a dot-prefixed name and rename it into place.
pub fn list_shard_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let hidden = path
            .file_name()
            .map_or(true, |name| name.to_string_lossy().starts_with('.'));
        if !hidden && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Sum the header counts of every shard file in `dir`.
pub fn plan_import(dir: &Path) -> Result<ImportPlan> {
    let mut files = Vec::new();
    let mut total = 0u64;
    for path in list_shard_files(dir)? {
        let entries = read_shard_header(&path)?;
        total = total
            .checked_add(entries)
            .ok_or_else(|| MeshError::MalformedManifest {
                path: path.clone(),
                reason: "entry counts overflow u64".into(),
            })?;
        files.push(ManifestFile { path, entries });
    }
    Ok(ImportPlan { files, total })
}
