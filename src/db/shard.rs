//! One device partition of a database: a contiguous packed-fingerprint array
//! plus the parallel identifier/SMILES arrays for that range.

use rayon::prelude::*;

use crate::bitops;
use crate::device::{Device, DeviceBuffer, DeviceSet};
use crate::error::{Result, SimError};

/// Minimum fingerprint count for a parallel scan. Below this the worker-pool
/// dispatch overhead outweighs the scoring work.
const PARALLEL_THRESHOLD: usize = 8_192;

/// Rows per parallel work unit. Smaller chunks balance load better at the
/// cost of more dispatch overhead.
const PARALLEL_CHUNK_SIZE: usize = 1_024;

/// Cached parallel-scan enable flag (checked once at first use).
/// Set FPSIM_PARALLEL_SCAN=0 to force sequential scoring.
static PARALLEL_SCAN_ENABLED: once_cell::sync::Lazy<bool> = once_cell::sync::Lazy::new(|| {
    dotenvy::var("FPSIM_PARALLEL_SCAN")
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(true)
});

/// Scores plus the exact count of scores at or above the cutoff.
pub struct ScanResult {
    pub scores: Vec<f32>,
    pub over_cutoff: u64,
}

#[derive(Debug)]
pub struct Shard {
    fp_count: usize,
    /// Words per fingerprint in the device-resident (possibly folded) copy.
    word_count: usize,
    unfolded_word_count: usize,
    index_offset: usize,
    device: Device,
    /// Unfolded words, retained for `fingerprint_at` and the CPU path.
    host_words: Vec<u32>,
    device_words: Option<DeviceBuffer>,
    smiles: Vec<String>,
    ids: Vec<String>,
}

impl Shard {
    pub fn new(
        index_offset: usize,
        bit_count: usize,
        host_words: Vec<u32>,
        smiles: Vec<String>,
        ids: Vec<String>,
        device: Device,
    ) -> Result<Self> {
        let word_count = bit_count / 32;
        if word_count == 0 || host_words.len() % word_count != 0 {
            return Err(SimError::Config(format!(
                "shard word array length {} is not a multiple of width {}",
                host_words.len(),
                word_count
            )));
        }
        let fp_count = host_words.len() / word_count;
        if smiles.len() != fp_count || ids.len() != fp_count {
            return Err(SimError::Config(format!(
                "shard metadata arrays ({} smiles, {} ids) do not match {} fingerprints",
                smiles.len(),
                ids.len(),
                fp_count
            )));
        }
        Ok(Self {
            fp_count,
            word_count,
            unfolded_word_count: word_count,
            index_offset,
            device,
            host_words,
            device_words: None,
            smiles,
            ids,
        })
    }

    pub fn fp_count(&self) -> usize {
        self.fp_count
    }

    pub fn word_count(&self) -> usize {
        self.word_count
    }

    pub fn index_offset(&self) -> usize {
        self.index_offset
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn smiles_at(&self, local_index: usize) -> &str {
        &self.smiles[local_index]
    }

    pub fn id_at(&self, local_index: usize) -> &str {
        &self.ids[local_index]
    }

    /// Copy of the unfolded packed words for one fingerprint.
    pub fn fingerprint_at(&self, local_index: usize) -> Vec<u32> {
        let wc = self.unfolded_word_count;
        self.host_words[local_index * wc..(local_index + 1) * wc].to_vec()
    }

    pub fn host_words(&self) -> &[u32] {
        &self.host_words
    }

    pub fn is_uploaded(&self) -> bool {
        self.device_words.is_some()
    }

    /// Fold this shard's words by `factor` in parallel across fingerprints.
    pub fn fold_words(&self, factor: usize) -> Vec<u32> {
        let src_wc = self.unfolded_word_count;
        let dst_wc = src_wc / factor;
        let mut folded = vec![0u32; self.fp_count * dst_wc];
        if self.fp_count >= PARALLEL_THRESHOLD {
            folded
                .par_chunks_mut(dst_wc)
                .zip(self.host_words.par_chunks(src_wc))
                .for_each(|(dst, src)| bitops::fold_into(src, dst));
        } else {
            for (dst, src) in folded
                .chunks_mut(dst_wc)
                .zip(self.host_words.chunks(src_wc))
            {
                bitops::fold_into(src, dst);
            }
        }
        folded
    }

    /// Upload `words` (the folded copy at `word_count` words per fingerprint)
    /// to this shard's device. A failed transfer is retried once; out of
    /// memory is immediately fatal to startup.
    pub fn upload(
        &mut self,
        devices: &DeviceSet,
        words: &[u32],
        word_count: usize,
    ) -> Result<()> {
        debug_assert_eq!(words.len(), self.fp_count * word_count);
        let Device::Ordinal(ordinal) = self.device else {
            return Ok(());
        };
        let buffer = match devices.upload(ordinal, words) {
            Ok(buf) => buf,
            Err(err @ crate::device::DeviceError::OutOfMemory { .. }) => {
                return Err(SimError::Config(err.to_string()));
            }
            Err(first) => {
                tracing::warn!(error = %first, ordinal, "device transfer failed, retrying");
                devices
                    .upload(ordinal, words)
                    .map_err(|err| SimError::Transient(err.to_string()))?
            }
        };
        self.word_count = word_count;
        self.device_words = Some(buffer);
        Ok(())
    }

    /// Scan the device-resident words with a query already folded to the
    /// shard's effective width.
    pub fn scan(&self, query: &[u32], cutoff: f32) -> Result<ScanResult> {
        let buffer = self
            .device_words
            .as_ref()
            .ok_or_else(|| SimError::Transient("shard has no device-resident data".into()))?;
        debug_assert_eq!(query.len(), self.word_count);
        Ok(scan_words(buffer.words(), self.word_count, query, cutoff))
    }

    /// Scan the unfolded host words on the worker pool.
    pub fn scan_host(&self, query: &[u32], cutoff: f32) -> ScanResult {
        debug_assert_eq!(query.len(), self.unfolded_word_count);
        scan_words(&self.host_words, self.unfolded_word_count, query, cutoff)
    }
}

/// Data-parallel Tanimoto map over a dense row-major word array. Both scan
/// paths funnel through here so equal data gives equal scores.
fn scan_words(words: &[u32], word_count: usize, query: &[u32], cutoff: f32) -> ScanResult {
    let fp_count = words.len() / word_count;
    let mut scores = vec![0f32; fp_count];
    if *PARALLEL_SCAN_ENABLED && fp_count >= PARALLEL_THRESHOLD {
        scores
            .par_chunks_mut(PARALLEL_CHUNK_SIZE)
            .zip(words.par_chunks(PARALLEL_CHUNK_SIZE * word_count))
            .for_each(|(out, rows)| {
                for (slot, fp) in out.iter_mut().zip(rows.chunks_exact(word_count)) {
                    *slot = bitops::tanimoto(fp, query);
                }
            });
    } else {
        for (slot, fp) in scores.iter_mut().zip(words.chunks_exact(word_count)) {
            *slot = bitops::tanimoto(fp, query);
        }
    }
    let over_cutoff = scores.iter().filter(|s| **s >= cutoff).count() as u64;
    ScanResult {
        scores,
        over_cutoff,
    }
}
