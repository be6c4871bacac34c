//! File transfer packages.
//!
//! A file travels in-band as a [`TransferPackage`]: its name, size, md5 hash
//! and a base64 `data` field. When `is_compressed` is set, `data` is the base64
//! encoding of a zlib stream of the file bytes; otherwise it is the base64
//! encoding of the bytes themselves.
//!
//! Large packages can be split into [`TransferChunk`]s and rebuilt on the
//! receiving side with a [`ChunkAssembler`].

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compression;
use crate::protocol::error::{Result, RpcError};

/// Files at or below this size are never compressed.
pub const COMPRESSION_MIN_SIZE: u64 = 1024;

/// Default size of one chunk's `data` slice.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Progress callback: fraction in `[0, 1]` and a status message.
pub type ProgressFn<'a> = &'a (dyn Fn(f64, &str) + Send + Sync);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPackage {
    pub file_name: String,
    pub file_size: u64,
    /// md5 of the original file bytes, lowercase hex.
    pub file_hash: String,
    pub is_compressed: bool,
    #[serde(alias = "file_data")]
    pub data: String,
}

/// Everything in a package except its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferHeader {
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub is_compressed: bool,
}

impl TransferPackage {
    /// Parses a package received as a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        const REQUIRED: [&str; 4] = ["file_name", "file_size", "file_hash", "is_compressed"];
        let Some(map) = value.as_object() else {
            return Err(RpcError::FileTransfer("Invalid transfer package: not an object".to_string()));
        };
        for key in REQUIRED {
            if !map.contains_key(key) {
                return Err(RpcError::FileTransfer(format!(
                    "Invalid transfer package: missing '{}'",
                    key
                )));
            }
        }
        if !map.contains_key("data") && !map.contains_key("file_data") {
            return Err(RpcError::FileTransfer("Invalid transfer package: missing 'data'".to_string()));
        }
        serde_json::from_value(value)
            .map_err(|e| RpcError::FileTransfer(format!("Invalid transfer package: {}", e)))
    }

    pub fn header(&self) -> TransferHeader {
        TransferHeader {
            file_name: self.file_name.clone(),
            file_size: self.file_size,
            file_hash: self.file_hash.clone(),
            is_compressed: self.is_compressed,
        }
    }

    pub fn from_parts(header: TransferHeader, data: String) -> Self {
        Self {
            file_name: header.file_name,
            file_size: header.file_size,
            file_hash: header.file_hash,
            is_compressed: header.is_compressed,
            data,
        }
    }
}

fn report(progress: Option<ProgressFn<'_>>, value: f64, message: &str) {
    if let Some(progress) = progress {
        progress(value, message);
    }
}

/// md5 of a file's contents as lowercase hex, read in 4 KiB blocks.
pub fn calculate_file_hash(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let mut file = fs::File::open(path)
        .map_err(|e| RpcError::FileTransfer(format!("Cannot open {}: {}", path.display(), e)))?;

    let mut context = md5::Context::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Reads a file into a transfer package.
///
/// Compression is applied only when requested and the file is larger than
/// [`COMPRESSION_MIN_SIZE`].
pub fn encode_file(
    path: impl AsRef<Path>,
    compress: bool,
    progress: Option<ProgressFn<'_>>,
) -> Result<TransferPackage> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(RpcError::FileTransfer(format!("File not found: {}", path.display())));
    }

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| RpcError::FileTransfer(format!("Invalid file path: {}", path.display())))?;

    report(progress, 0.1, &format!("Reading file: {}", file_name));
    let bytes = fs::read(path)?;
    let file_size = bytes.len() as u64;

    report(progress, 0.4, "Calculating hash");
    let file_hash = format!("{:x}", md5::compute(&bytes));

    report(progress, 0.5, "Encoding data");
    let is_compressed = compress && file_size > COMPRESSION_MIN_SIZE;
    let data = if is_compressed {
        report(progress, 0.7, "Compressing data");
        STANDARD.encode(compression::compress(&bytes)?)
    } else {
        STANDARD.encode(&bytes)
    };

    report(progress, 0.9, "Preparing transfer package");
    let package = TransferPackage {
        file_name,
        file_size,
        file_hash,
        is_compressed,
        data,
    };

    report(progress, 1.0, "File encoded successfully");
    Ok(package)
}

/// Unpacks and verifies a transfer package, returning the bytes.
pub fn decode_bytes(package: &TransferPackage, progress: Option<ProgressFn<'_>>) -> Result<Vec<u8>> {
    report(progress, 0.3, "Decoding data");
    let raw = STANDARD
        .decode(package.data.as_bytes())
        .map_err(|e| RpcError::Integrity(format!("Invalid base64 data: {}", e)))?;

    let bytes = if package.is_compressed {
        report(progress, 0.4, "Decompressing data");
        let limit = usize::try_from(package.file_size).unwrap_or(usize::MAX);
        compression::decompress(&raw, limit)?
    } else {
        raw
    };

    report(progress, 0.7, "Verifying file integrity");
    let actual = format!("{:x}", md5::compute(&bytes));
    if !actual.eq_ignore_ascii_case(&package.file_hash) {
        return Err(RpcError::Integrity(format!(
            "hash mismatch (expected: {}, got: {})",
            package.file_hash, actual
        )));
    }

    Ok(bytes)
}

/// Unpacks a transfer package to disk and returns the written path.
///
/// The target is `output_file` when given, else `output_dir/<file_name>`
/// (the directory is created), else the system temp directory. Only the final
/// component of the package's file name is used.
pub fn decode_file(
    package: &TransferPackage,
    output_dir: Option<&Path>,
    output_file: Option<&Path>,
    progress: Option<ProgressFn<'_>>,
) -> Result<PathBuf> {
    report(progress, 0.1, "Validating transfer package");
    let bytes = decode_bytes(package, progress)?;

    report(progress, 0.8, "Writing file to disk");
    let output_path = match output_file {
        Some(file) => {
            if let Some(parent) = file.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            file.to_path_buf()
        }
        None => {
            let dir = match output_dir {
                Some(dir) => {
                    fs::create_dir_all(dir)?;
                    dir.to_path_buf()
                }
                None => std::env::temp_dir(),
            };
            let name = Path::new(&package.file_name)
                .file_name()
                .ok_or_else(|| {
                    RpcError::FileTransfer(format!("Invalid file name '{}'", package.file_name))
                })?;
            dir.join(name)
        }
    };

    fs::write(&output_path, &bytes)?;

    report(progress, 1.0, &format!("File saved to {}", output_path.display()));
    Ok(output_path)
}

/// One slice of a chunked transfer.
///
/// The first chunk (index 0) carries the package header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferChunk {
    pub transfer_id: String,
    pub index: u32,
    pub total: u32,
    /// md5 of this chunk's `data`.
    pub chunk_hash: String,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header: Option<TransferHeader>,
}

pub fn split_into_chunks(package: &TransferPackage, chunk_size: usize) -> Vec<TransferChunk> {
    let chunk_size = chunk_size.max(1);
    let transfer_id = uuid::Uuid::new_v4().to_string();

    // base64 text is ASCII, so byte slicing stays on char boundaries
    let mut slices: Vec<&str> = package
        .data
        .as_bytes()
        .chunks(chunk_size)
        .filter_map(|c| std::str::from_utf8(c).ok())
        .collect();
    if slices.is_empty() {
        slices.push("");
    }

    let total = slices.len() as u32;
    slices
        .into_iter()
        .enumerate()
        .map(|(index, data)| TransferChunk {
            transfer_id: transfer_id.clone(),
            index: index as u32,
            total,
            chunk_hash: format!("{:x}", md5::compute(data.as_bytes())),
            data: data.to_string(),
            header: (index == 0).then(|| package.header()),
        })
        .collect()
}

/// Collects the chunks of one transfer, in any order.
#[derive(Debug)]
pub struct ChunkAssembler {
    transfer_id: String,
    total: u32,
    header: Option<TransferHeader>,
    parts: BTreeMap<u32, String>,
}

impl ChunkAssembler {
    pub fn new(transfer_id: impl Into<String>, total: u32) -> Self {
        Self {
            transfer_id: transfer_id.into(),
            total,
            header: None,
            parts: BTreeMap::new(),
        }
    }

    pub fn transfer_id(&self) -> &str {
        &self.transfer_id
    }

    pub fn received(&self) -> usize {
        self.parts.len()
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    /// Adds a chunk after checking that it belongs here and is intact.
    pub fn add(&mut self, chunk: TransferChunk) -> Result<()> {
        if chunk.transfer_id != self.transfer_id {
            return Err(RpcError::FileTransfer(format!(
                "Chunk belongs to transfer {}, not {}",
                chunk.transfer_id, self.transfer_id
            )));
        }
        if chunk.total != self.total || chunk.index >= self.total {
            return Err(RpcError::FileTransfer(format!(
                "Chunk {}/{} does not fit a transfer of {} chunks",
                chunk.index, chunk.total, self.total
            )));
        }

        let actual = format!("{:x}", md5::compute(chunk.data.as_bytes()));
        if !actual.eq_ignore_ascii_case(&chunk.chunk_hash) {
            return Err(RpcError::Integrity(format!(
                "chunk {} hash mismatch (expected: {}, got: {})",
                chunk.index, chunk.chunk_hash, actual
            )));
        }

        if let Some(header) = chunk.header {
            self.header = Some(header);
        }
        self.parts.insert(chunk.index, chunk.data);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.parts.len() as u32 == self.total && self.header.is_some()
    }

    /// Joins the chunks back into a package.
    pub fn finish(self) -> Result<TransferPackage> {
        if self.parts.len() as u32 != self.total {
            return Err(RpcError::FileTransfer(format!(
                "Transfer {} incomplete: {}/{} chunks",
                self.transfer_id,
                self.parts.len(),
                self.total
            )));
        }
        let header = self.header.ok_or_else(|| {
            RpcError::FileTransfer(format!("Transfer {} is missing its header chunk", self.transfer_id))
        })?;
        let data: String = self.parts.into_values().collect();
        Ok(TransferPackage::from_parts(header, data))
    }
}
