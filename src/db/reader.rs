//! Parser for the versioned on-disk fingerprint database file.
//!
//! Layout (all integers little-endian):
//!
//!   i32 version            -- must equal `DB_FILE_VERSION`
//!   cstring dbkey
//!   i32 fp_bitcount        -- width W, multiple of 32
//!   i32 fp_count
//!   i32 fp_block_count,     then per block [i32 compressed_len][bytes]
//!   i32 smiles_block_count, blocks as above
//!   i32 id_block_count,     blocks as above
//!
//! A `cstring` is `[i32 len_including_nul][bytes][NUL]`; `len == -1` encodes
//! a null string. Block payloads carry a 4-byte big-endian uncompressed
//! length (the source toolchain's convention) followed by a zlib stream.
//! Fingerprint blocks decompress to contiguous packed words; SMILES and
//! identifier blocks decompress to cstring sequences. Blocks decompress in
//! parallel on the worker pool and concatenate in file order.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use flate2::read::ZlibDecoder;
use memmap2::Mmap;
use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, SimError};

/// On-disk format version this reader understands.
pub const DB_FILE_VERSION: i32 = 3;

/// Upper bound on the block count fields, against corrupt headers.
const MAX_BLOCK_COUNT: i32 = 1 << 20;

/// Everything read out of one database file, still as flat arrays.
#[derive(Debug)]
pub struct RawDatabase {
    pub dbkey: String,
    pub bit_count: usize,
    pub fp_count: usize,
    pub fp_words: Vec<u32>,
    pub smiles: Vec<String>,
    pub ids: Vec<String>,
}

pub fn read_database_file(path: &Path) -> Result<RawDatabase> {
    let file = File::open(path)?;
    let mmap = unsafe { Mmap::map(&file)? };
    let mut cursor = FileCursor::new(&mmap, path);

    let version = cursor.read_i32()?;
    if version != DB_FILE_VERSION {
        return Err(SimError::Version {
            path: path.to_path_buf(),
            found: version,
            expected: DB_FILE_VERSION,
        });
    }

    let dbkey = cursor.read_cstring()?.unwrap_or_default();
    let bit_count = cursor.read_i32()?;
    if bit_count <= 0 || bit_count % 32 != 0 {
        return Err(cursor.corrupt(format!("bit count {bit_count} is not a multiple of 32")));
    }
    let bit_count = bit_count as usize;
    let fp_count = cursor.read_i32()?;
    if fp_count < 0 {
        return Err(cursor.corrupt(format!("negative fingerprint count {fp_count}")));
    }
    let fp_count = fp_count as usize;

    let fp_chunks = decompress_section(&mut cursor)?;
    let smiles_chunks = decompress_section(&mut cursor)?;
    let id_chunks = decompress_section(&mut cursor)?;

    let fp_bytes: usize = fp_chunks.iter().map(Vec::len).sum();
    if fp_bytes != fp_count * bit_count / 8 {
        return Err(cursor.corrupt(format!(
            "fingerprint payload is {fp_bytes} bytes, expected {} for {fp_count} x {bit_count} bits",
            fp_count * bit_count / 8
        )));
    }

    let mut fp_words = Vec::with_capacity(fp_bytes / 4);
    for chunk in &fp_chunks {
        if chunk.len() % 4 != 0 {
            return Err(cursor.corrupt("fingerprint block is not word-aligned".into()));
        }
        fp_words.extend(
            chunk
                .chunks_exact(4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
        );
    }

    let smiles = parse_string_section(&smiles_chunks, fp_count, path, "SMILES")?;
    let ids = parse_string_section(&id_chunks, fp_count, path, "identifier")?;

    debug!(
        path = %path.display(),
        fp_count,
        bit_count,
        "database file loaded"
    );

    Ok(RawDatabase {
        dbkey,
        bit_count,
        fp_count,
        fp_words,
        smiles,
        ids,
    })
}

/// Read one `[block_count][len][bytes]...` section and inflate every block on
/// the worker pool, preserving file order.
fn decompress_section(cursor: &mut FileCursor<'_>) -> Result<Vec<Vec<u8>>> {
    let block_count = cursor.read_i32()?;
    if !(0..=MAX_BLOCK_COUNT).contains(&block_count) {
        return Err(cursor.corrupt(format!("implausible block count {block_count}")));
    }
    let mut blocks = Vec::with_capacity(block_count as usize);
    for _ in 0..block_count {
        let len = cursor.read_i32()?;
        if len < 0 {
            return Err(cursor.corrupt(format!("negative block length {len}")));
        }
        blocks.push(cursor.read_bytes(len as usize)?);
    }
    blocks
        .par_iter()
        .map(|block| decompress_block(block))
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|err| cursor.corrupt(format!("block decompression failed: {err}")))
}

/// Inflate one block: 4-byte big-endian expected length, then a zlib stream.
fn decompress_block(data: &[u8]) -> std::io::Result<Vec<u8>> {
    if data.len() < 4 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "compressed block shorter than its length prefix",
        ));
    }
    let expected = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let mut payload = Vec::with_capacity(expected);
    ZlibDecoder::new(&data[4..]).read_to_end(&mut payload)?;
    if payload.len() != expected {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "block inflated to {} bytes, header promised {expected}",
                payload.len()
            ),
        ));
    }
    Ok(payload)
}

/// Parse cstring sequences out of decompressed blocks, concatenating in file
/// order, and require exactly `expected` strings in total.
fn parse_string_section(
    chunks: &[Vec<u8>],
    expected: usize,
    path: &Path,
    what: &str,
) -> Result<Vec<String>> {
    let mut strings = Vec::with_capacity(expected);
    for chunk in chunks {
        let mut cursor = FileCursor::new(chunk, path);
        while cursor.remaining() > 0 {
            strings.push(cursor.read_cstring()?.unwrap_or_default());
        }
    }
    if strings.len() != expected {
        return Err(SimError::Config(format!(
            "{}: {what} section holds {} strings, expected {expected}",
            path.display(),
            strings.len()
        )));
    }
    Ok(strings)
}

/// Bounds-checked little-endian cursor over a byte slice.
struct FileCursor<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> FileCursor<'a> {
    fn new(buf: &'a [u8], path: &'a Path) -> Self {
        Self { buf, pos: 0, path }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn corrupt(&self, detail: String) -> SimError {
        SimError::Config(format!("{}: {detail}", self.path.display()))
    }

    fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| self.corrupt("truncated file".into()))?;
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn read_i32(&mut self) -> Result<i32> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// `[i32 len_including_nul][bytes][NUL]`; `len == -1` is a null string.
    fn read_cstring(&mut self) -> Result<Option<String>> {
        let len = self.read_i32()?;
        if len == -1 {
            return Ok(None);
        }
        if len < 1 {
            return Err(self.corrupt(format!("invalid string length {len}")));
        }
        let mut bytes = self.read_bytes(len as usize)?;
        match bytes.pop() {
            Some(0) => {}
            _ => return Err(self.corrupt("string is not NUL-terminated".into())),
        }
        String::from_utf8(bytes).map(Some).map_err(|_| {
            self.corrupt("string is not valid UTF-8".into())
        })
    }
}
