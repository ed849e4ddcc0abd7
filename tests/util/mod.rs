//! Test fixtures: an in-process writer for the versioned database file
//! format, mirroring what the offline database builder produces.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use flate2::{Compression, write::ZlibEncoder};

/// One fingerprint row destined for a fixture file.
#[derive(Debug, Clone)]
pub struct FixtureRow {
    pub words: Vec<u32>,
    pub smiles: String,
    pub id: String,
}

impl FixtureRow {
    pub fn new(words: Vec<u32>, smiles: &str, id: &str) -> Self {
        Self {
            words,
            smiles: smiles.to_string(),
            id: id.to_string(),
        }
    }
}

/// Rows holding a 64-bit fingerprint in the low words.
pub fn rows64(entries: &[(u64, &str, &str)]) -> Vec<FixtureRow> {
    entries
        .iter()
        .map(|(bits, smiles, id)| {
            FixtureRow::new(
                vec![(*bits & 0xFFFF_FFFF) as u32, (*bits >> 32) as u32],
                smiles,
                id,
            )
        })
        .collect()
}

/// Serialize a version-3 database file: little-endian header, then three
/// sections of zlib blocks (4-byte big-endian uncompressed-length prefix on
/// each). `rows_per_block` controls how rows split into blocks so tests can
/// exercise multi-block assembly.
pub fn write_database_file(
    path: &Path,
    dbkey: &str,
    bit_count: usize,
    rows: &[FixtureRow],
    rows_per_block: usize,
) {
    write_database_file_with_version(path, 3, dbkey, bit_count, rows, rows_per_block);
}

pub fn write_database_file_with_version(
    path: &Path,
    version: i32,
    dbkey: &str,
    bit_count: usize,
    rows: &[FixtureRow],
    rows_per_block: usize,
) {
    let mut buf = Vec::new();
    put_i32(&mut buf, version);
    put_cstring(&mut buf, dbkey);
    put_i32(&mut buf, bit_count as i32);
    put_i32(&mut buf, rows.len() as i32);

    let chunks: Vec<&[FixtureRow]> = if rows.is_empty() {
        Vec::new()
    } else {
        rows.chunks(rows_per_block.max(1)).collect()
    };

    // Fingerprint word blocks.
    put_i32(&mut buf, chunks.len() as i32);
    for chunk in &chunks {
        let mut payload = Vec::new();
        for row in *chunk {
            for word in &row.words {
                payload.extend_from_slice(&word.to_le_bytes());
            }
        }
        put_block(&mut buf, &payload);
    }

    // SMILES blocks.
    put_i32(&mut buf, chunks.len() as i32);
    for chunk in &chunks {
        let mut payload = Vec::new();
        for row in *chunk {
            put_cstring(&mut payload, &row.smiles);
        }
        put_block(&mut buf, &payload);
    }

    // Identifier blocks.
    put_i32(&mut buf, chunks.len() as i32);
    for chunk in &chunks {
        let mut payload = Vec::new();
        for row in *chunk {
            put_cstring(&mut payload, &row.id);
        }
        put_block(&mut buf, &payload);
    }

    let mut file = File::create(path).expect("create fixture db file");
    file.write_all(&buf).expect("write fixture db file");
}

fn put_i32(buf: &mut Vec<u8>, value: i32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_cstring(buf: &mut Vec<u8>, value: &str) {
    put_i32(buf, value.len() as i32 + 1);
    buf.extend_from_slice(value.as_bytes());
    buf.push(0);
}

fn put_block(buf: &mut Vec<u8>, payload: &[u8]) {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload).expect("compress block");
    let stream = encoder.finish().expect("finish block");
    let mut block = (payload.len() as u32).to_be_bytes().to_vec();
    block.extend_from_slice(&stream);
    put_i32(buf, block.len() as i32);
    buf.extend_from_slice(&block);
}
