//! A named, keyed fingerprint database: an ordered collection of shards with
//! contiguous global numbering, plus the fold/upload lifecycle.

pub mod fold_cache;
pub mod reader;
pub mod shard;
pub mod topk;

use std::path::Path;

use rayon::prelude::*;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::bitops;
use crate::device::{Device, DeviceSet};
use crate::error::{Result, SimError};
use fold_cache::FoldCache;
use reader::RawDatabase;
use shard::{ScanResult, Shard};
use topk::partial_top_k;

/// One database's contribution to a query: parallel result arrays plus the
/// exact count of fingerprints scoring at or above the cutoff. The string
/// slices borrow from the database's own arrays; the aggregator copies what
/// it keeps.
pub struct SearchHits<'a> {
    pub smiles: Vec<&'a str>,
    pub ids: Vec<&'a str>,
    pub scores: Vec<f32>,
    pub approx_total: u64,
}

impl SearchHits<'_> {
    fn empty() -> Self {
        Self {
            smiles: Vec::new(),
            ids: Vec::new(),
            scores: Vec::new(),
            approx_total: 0,
        }
    }
}

#[derive(Debug)]
pub struct Database {
    name: String,
    dbkey: String,
    bit_count: usize,
    fold_factor: usize,
    content_hash: [u8; 32],
    total_count: usize,
    shards: Vec<Shard>,
}

impl Database {
    /// Build a database from flat file arrays, splitting the fingerprints
    /// into one shard per available device (a single host shard when the
    /// device set is empty). Device ordinals are assigned round-robin.
    pub fn new(name: impl Into<String>, raw: RawDatabase, devices: &DeviceSet) -> Result<Self> {
        let RawDatabase {
            dbkey,
            bit_count,
            fp_count,
            fp_words,
            smiles,
            ids,
        } = raw;
        let word_count = bit_count / 32;
        if fp_words.len() != fp_count * word_count {
            return Err(SimError::Config(format!(
                "fingerprint array holds {} words, expected {}",
                fp_words.len(),
                fp_count * word_count
            )));
        }

        let mut content_hash = Sha256::new();
        for word in &fp_words {
            content_hash.update(word.to_le_bytes());
        }
        let content_hash: [u8; 32] = content_hash.finalize().into();

        let shard_count = devices.device_count().max(1);
        let per_shard = fp_count.div_ceil(shard_count).max(1);

        let mut shards = Vec::with_capacity(shard_count);
        let mut fp_words = fp_words;
        let mut smiles = smiles;
        let mut ids = ids;
        let mut offset = 0;
        while offset < fp_count || shards.is_empty() {
            let take = per_shard.min(fp_count - offset);
            let rest_words = fp_words.split_off(take * word_count);
            let rest_smiles = smiles.split_off(take);
            let rest_ids = ids.split_off(take);
            let device = if devices.is_empty() {
                Device::Cpu
            } else {
                Device::Ordinal(devices.next_ordinal())
            };
            shards.push(Shard::new(offset, bit_count, fp_words, smiles, ids, device)?);
            fp_words = rest_words;
            smiles = rest_smiles;
            ids = rest_ids;
            offset += take;
            if take == 0 {
                break;
            }
        }

        Ok(Self {
            name: name.into(),
            dbkey,
            bit_count,
            fold_factor: 1,
            content_hash,
            total_count: fp_count,
            shards,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dbkey(&self) -> &str {
        &self.dbkey
    }

    pub fn bit_count(&self) -> usize {
        self.bit_count
    }

    pub fn fp_count(&self) -> usize {
        self.total_count
    }

    pub fn fold_factor(&self) -> usize {
        self.fold_factor
    }

    pub fn content_hash(&self) -> &[u8; 32] {
        &self.content_hash
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    /// Unfolded fingerprint data size, the number that has to fit on device
    /// before folding.
    pub fn data_bytes(&self) -> u64 {
        self.total_count as u64 * (self.bit_count as u64 / 8)
    }

    /// Check an access key. A mismatch is silent toward the client: the
    /// caller logs it and the database contributes nothing to the results.
    fn authorize(&self, dbkey: &str) -> Result<()> {
        if dbkey != self.dbkey {
            return Err(SimError::Auth);
        }
        Ok(())
    }

    /// Copy of the unfolded packed words for a global index, located by
    /// binary search over the shard offsets.
    pub fn fingerprint_at(&self, global_index: usize) -> Option<Vec<u32>> {
        if global_index >= self.total_count {
            return None;
        }
        let shard_idx = self
            .shards
            .partition_point(|s| s.index_offset() <= global_index)
            .checked_sub(1)?;
        let shard = &self.shards[shard_idx];
        Some(shard.fingerprint_at(global_index - shard.index_offset()))
    }

    /// Top-`k` most similar fingerprints from the device-resident copy.
    ///
    /// A wrong `dbkey` yields empty results and contributes nothing to the
    /// approximate total. The query is folded to the database's effective
    /// width before scoring.
    pub fn search(&self, query: &[u32], dbkey: &str, k: usize, cutoff: f32) -> Result<SearchHits<'_>> {
        if let Err(err) = self.authorize(dbkey) {
            debug!(db = %self.name, error = %err, "search rejected");
            return Ok(SearchHits::empty());
        }
        let folded;
        let scan_query = if self.fold_factor > 1 {
            folded = bitops::fold(query, self.fold_factor);
            folded.as_slice()
        } else {
            query
        };
        let scans = self
            .shards
            .par_iter()
            .map(|shard| shard.scan(scan_query, cutoff))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.select_hits(scans, k, cutoff))
    }

    /// Same contract as [`search`](Self::search), scoring the unfolded host
    /// copy on the worker pool.
    pub fn search_cpu(&self, query: &[u32], dbkey: &str, k: usize, cutoff: f32) -> SearchHits<'_> {
        if let Err(err) = self.authorize(dbkey) {
            debug!(db = %self.name, error = %err, "search rejected");
            return SearchHits::empty();
        }
        let scans: Vec<ScanResult> = self
            .shards
            .par_iter()
            .map(|shard| shard.scan_host(query, cutoff))
            .collect();
        self.select_hits(scans, k, cutoff)
    }

    /// Partial top-K per shard, then a database-level merge in descending
    /// score order (ties keep the lower global index), truncated to `k`.
    fn select_hits(&self, scans: Vec<ScanResult>, k: usize, cutoff: f32) -> SearchHits<'_> {
        let approx_total: u64 = scans.iter().map(|s| s.over_cutoff).sum();

        let mut merged: Vec<(f32, usize, usize)> = Vec::new();
        for (shard_idx, scan) in scans.into_iter().enumerate() {
            let mut scores = scan.scores;
            let mut indices: Vec<usize> = (0..scores.len()).collect();
            partial_top_k(&mut indices, &mut scores, k);
            for pos in 0..k.min(scores.len()) {
                // The selected prefix is descending, so the first miss ends
                // this shard's contribution.
                if scores[pos] < cutoff {
                    break;
                }
                merged.push((scores[pos], shard_idx, indices[pos]));
            }
        }

        merged.sort_by(|a, b| {
            b.0.total_cmp(&a.0).then_with(|| {
                let ga = self.shards[a.1].index_offset() + a.2;
                let gb = self.shards[b.1].index_offset() + b.2;
                ga.cmp(&gb)
            })
        });
        merged.truncate(k);

        let mut hits = SearchHits::empty();
        hits.approx_total = approx_total;
        for (score, shard_idx, local) in merged {
            let shard = &self.shards[shard_idx];
            hits.scores.push(score);
            hits.smiles.push(shard.smiles_at(local));
            hits.ids.push(shard.id_at(local));
        }
        hits
    }

    /// Establish device residency at fold factor `factor`, consulting the
    /// fold cache when a directory is configured. `factor` is rounded up
    /// until it divides the bit width into whole words.
    pub fn fold_to(
        &mut self,
        factor: usize,
        cache_dir: Option<&Path>,
        devices: &DeviceSet,
    ) -> Result<()> {
        if factor <= 1 {
            self.fold_factor = 1;
            let word_count = self.bit_count / 32;
            for shard in &mut self.shards {
                let words = shard.host_words().to_vec();
                shard.upload(devices, &words, word_count)?;
            }
            return Ok(());
        }

        let factor = bitops::next_valid_fold_factor(self.bit_count, factor);
        self.fold_factor = factor;
        let folded_wc = (self.bit_count / factor) / 32;

        let mut cache =
            cache_dir.and_then(|dir| FoldCache::open(dir, factor, &self.content_hash));

        // A readable cache yields every shard's blob in shard order; a read
        // failure abandons the cache and falls through to in-process folding.
        let mut blobs: Vec<Vec<u32>> = Vec::with_capacity(self.shards.len());
        if let Some(handle) = cache.as_mut()
            && handle.is_reader()
        {
            for shard in &self.shards {
                match handle.read_shard(shard.fp_count() * folded_wc) {
                    Ok(words) => blobs.push(words),
                    Err(err) => {
                        warn!(
                            db = %self.name,
                            error = %err,
                            "fold cache read failed, folding in memory"
                        );
                        blobs.clear();
                        break;
                    }
                }
            }
            if blobs.is_empty() && !self.shards.is_empty() {
                cache = None;
            }
        }

        if blobs.len() != self.shards.len() {
            blobs = self
                .shards
                .par_iter()
                .map(|shard| shard.fold_words(factor))
                .collect();
            if let Some(handle) = cache.as_mut()
                && !handle.is_reader()
            {
                for blob in &blobs {
                    if let Err(err) = handle.write_shard(blob) {
                        warn!(
                            db = %self.name,
                            error = %err,
                            "fold cache write failed, continuing without cache"
                        );
                        cache = None;
                        break;
                    }
                }
            }
        }

        for (shard, blob) in self.shards.iter_mut().zip(&blobs) {
            shard.upload(devices, blob, folded_wc)?;
        }

        if let Some(handle) = cache.take()
            && !handle.is_reader()
            && let Err(err) = handle.finish()
        {
            warn!(db = %self.name, error = %err, "fold cache flush failed");
        }
        Ok(())
    }
}
