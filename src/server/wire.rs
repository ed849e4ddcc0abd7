//! Little-endian framing for the search protocol.
//!
//! Request layout:
//!
//!   i32 db_count
//!   db_count x (cstring db_name, cstring db_key)
//!   i32 request_id
//!   i32 k
//!   f32 cutoff
//!   i32 fp_byte_len, then that many bytes of packed query words
//!
//! Response layout:
//!
//!   i32 request_id
//!   i32 result_count n
//!   u64 approximate_total_matches
//!   n x cstring smiles
//!   n x cstring id
//!   n x f32 score
//!
//! A `cstring` is `[i32 len_including_nul][bytes][NUL]`; `len == -1` encodes
//! a null string. Everything else is little-endian. Both sides of the
//! protocol live here so the client used by tests cannot drift from the
//! server.

use std::io::{self, Read, Write};

use crate::aggregate::QueryResults;
use crate::error::{Result, SimError};

/// Caps against malformed frames; a request tripping one of these is a
/// protocol error and the connection is closed.
const MAX_DB_COUNT: i32 = 256;
const MAX_STRING_LEN: i32 = 1 << 16;
const MAX_FP_BYTES: i32 = 1 << 20;
const MAX_RESULT_COUNT: i32 = 1 << 20;

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// `(database name, database key)` pairs, searched in order.
    pub selections: Vec<(String, String)>,
    pub request_id: i32,
    pub return_count: i32,
    pub cutoff: f32,
    pub query_words: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResponse {
    pub request_id: i32,
    pub approximate_total: u64,
    pub smiles: Vec<String>,
    pub ids: Vec<String>,
    pub scores: Vec<f32>,
}

impl SearchRequest {
    /// Read one request frame. `Ok(None)` means the peer closed the stream
    /// cleanly before sending another request.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Option<Self>> {
        let Some(db_count) = read_i32_or_eof(reader)? else {
            return Ok(None);
        };
        if !(0..=MAX_DB_COUNT).contains(&db_count) {
            return Err(SimError::Protocol(format!(
                "implausible database count {db_count}"
            )));
        }

        let mut selections = Vec::with_capacity(db_count as usize);
        for _ in 0..db_count {
            let name = read_cstring(reader)?.unwrap_or_default();
            let key = read_cstring(reader)?.unwrap_or_default();
            selections.push((name, key));
        }

        let request_id = read_i32(reader)?;
        let return_count = read_i32(reader)?;
        if return_count < 0 {
            return Err(SimError::Protocol(format!(
                "negative result budget {return_count}"
            )));
        }
        let cutoff = read_f32(reader)?;
        if !(0.0..=1.0).contains(&cutoff) {
            return Err(SimError::Protocol(format!(
                "similarity cutoff {cutoff} outside [0, 1]"
            )));
        }

        let fp_byte_len = read_i32(reader)?;
        if !(0..=MAX_FP_BYTES).contains(&fp_byte_len) || fp_byte_len % 4 != 0 {
            return Err(SimError::Protocol(format!(
                "invalid fingerprint byte length {fp_byte_len}"
            )));
        }
        let mut fp_bytes = vec![0u8; fp_byte_len as usize];
        reader.read_exact(&mut fp_bytes)?;
        let query_words = fp_bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(Some(Self {
            selections,
            request_id,
            return_count,
            cutoff,
            query_words,
        }))
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_i32(writer, self.selections.len() as i32)?;
        for (name, key) in &self.selections {
            write_cstring(writer, Some(name))?;
            write_cstring(writer, Some(key))?;
        }
        write_i32(writer, self.request_id)?;
        write_i32(writer, self.return_count)?;
        write_f32(writer, self.cutoff)?;
        write_i32(writer, self.query_words.len() as i32 * 4)?;
        for word in &self.query_words {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }
}

impl SearchResponse {
    pub fn from_results(request_id: i32, results: QueryResults) -> Self {
        Self {
            request_id,
            approximate_total: results.approximate_total,
            smiles: results.smiles,
            ids: results.ids,
            scores: results.scores,
        }
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        write_i32(writer, self.request_id)?;
        write_i32(writer, self.smiles.len() as i32)?;
        writer.write_all(&self.approximate_total.to_le_bytes())?;
        for smiles in &self.smiles {
            write_cstring(writer, Some(smiles))?;
        }
        for id in &self.ids {
            write_cstring(writer, Some(id))?;
        }
        for score in &self.scores {
            write_f32(writer, *score)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let request_id = read_i32(reader)?;
        let result_count = read_i32(reader)?;
        if !(0..=MAX_RESULT_COUNT).contains(&result_count) {
            return Err(SimError::Protocol(format!(
                "implausible result count {result_count}"
            )));
        }
        let n = result_count as usize;
        let mut total_bytes = [0u8; 8];
        reader.read_exact(&mut total_bytes)?;
        let approximate_total = u64::from_le_bytes(total_bytes);

        let mut smiles = Vec::with_capacity(n);
        for _ in 0..n {
            smiles.push(read_cstring(reader)?.unwrap_or_default());
        }
        let mut ids = Vec::with_capacity(n);
        for _ in 0..n {
            ids.push(read_cstring(reader)?.unwrap_or_default());
        }
        let mut scores = Vec::with_capacity(n);
        for _ in 0..n {
            scores.push(read_f32(reader)?);
        }

        Ok(Self {
            request_id,
            approximate_total,
            smiles,
            ids,
            scores,
        })
    }
}

fn read_i32<R: Read>(reader: &mut R) -> Result<i32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read an i32, reporting a clean EOF before the first byte as `None`.
fn read_i32_or_eof<R: Read>(reader: &mut R) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < 4 {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(SimError::Protocol("truncated frame header".into()));
        }
        filled += n;
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

fn read_f32<R: Read>(reader: &mut R) -> Result<f32> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    let value = f32::from_le_bytes(buf);
    if value.is_nan() {
        return Err(SimError::Protocol("NaN float in frame".into()));
    }
    Ok(value)
}

/// `[i32 len_including_nul][bytes][NUL]`; `len == -1` is a null string.
fn read_cstring<R: Read>(reader: &mut R) -> Result<Option<String>> {
    let len = read_i32(reader)?;
    if len == -1 {
        return Ok(None);
    }
    if !(1..=MAX_STRING_LEN).contains(&len) {
        return Err(SimError::Protocol(format!("invalid string length {len}")));
    }
    let mut bytes = vec![0u8; len as usize];
    reader.read_exact(&mut bytes)?;
    match bytes.pop() {
        Some(0) => {}
        _ => return Err(SimError::Protocol("string is not NUL-terminated".into())),
    }
    String::from_utf8(bytes)
        .map(Some)
        .map_err(|_| SimError::Protocol("string is not valid UTF-8".into()))
}

fn write_i32<W: Write>(writer: &mut W, value: i32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_f32<W: Write>(writer: &mut W, value: f32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_cstring<W: Write>(writer: &mut W, value: Option<&str>) -> io::Result<()> {
    match value {
        None => write_i32(writer, -1),
        Some(s) => {
            write_i32(writer, s.len() as i32 + 1)?;
            writer.write_all(s.as_bytes())?;
            writer.write_all(&[0])
        }
    }
}
