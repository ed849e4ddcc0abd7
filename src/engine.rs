//! The engine owns every loaded database, establishes device residency once
//! at startup, and fans each query out across the named databases.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::aggregate::{self, DbHit, QueryResults};
use crate::config::ServerConfig;
use crate::db::{Database, SearchHits, reader};
use crate::device::DeviceSet;
use crate::error::{Result, SimError};

#[derive(Debug)]
pub struct Engine {
    databases: HashMap<String, Database>,
    devices: DeviceSet,
    use_devices: AtomicBool,
    fold_factor: usize,
}

impl Engine {
    /// Load every database file, compute the global fold factor, and
    /// establish device residency. Databases are named by file stem.
    pub fn start(paths: &[PathBuf], config: &ServerConfig) -> Result<Self> {
        let devices = DeviceSet::detect(config);
        let mut databases = Vec::with_capacity(paths.len());
        for path in paths {
            let raw = reader::read_database_file(path)?;
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    SimError::Config(format!("cannot derive a database name from {path:?}"))
                })?;
            info!(
                db = %name,
                fingerprints = raw.fp_count,
                bits = raw.bit_count,
                "database loaded"
            );
            databases.push(Database::new(name, raw, &devices)?);
        }
        Self::assemble(databases, devices, config)
    }

    /// Wire up an engine from already-constructed databases. This is the
    /// tail of [`start`](Self::start); tests and benches enter here.
    pub fn assemble(
        databases: Vec<Database>,
        devices: DeviceSet,
        config: &ServerConfig,
    ) -> Result<Self> {
        let mut engine = Self {
            databases: databases
                .into_iter()
                .map(|db| (db.name().to_string(), db))
                .collect(),
            use_devices: AtomicBool::new(!devices.is_empty()),
            devices,
            fold_factor: 1,
        };
        engine.establish_residency(config)?;
        Ok(engine)
    }

    /// Compute the global fold factor from the memory budgets and upload
    /// every database. With no devices, searches stay on the CPU path and no
    /// upload happens.
    fn establish_residency(&mut self, config: &ServerConfig) -> Result<()> {
        if self.devices.is_empty() {
            info!("no compute devices available, searches will run on the worker pool");
            return Ok(());
        }

        let total_bytes: u64 = self.databases.values().map(Database::data_bytes).sum();
        let max_count = self
            .databases
            .values()
            .map(Database::fp_count)
            .max()
            .unwrap_or(0);
        let max_bits = self
            .databases
            .values()
            .map(Database::bit_count)
            .max()
            .unwrap_or(0);

        // Reserve room for the per-query index vector.
        let available = self.devices.free_bytes().saturating_sub(max_count as u64 * 4);
        if available == 0 {
            return Err(SimError::Config(
                "devices report no memory available for fingerprint data".into(),
            ));
        }

        let mut fold_factor = if total_bytes <= available {
            1
        } else {
            total_bytes.div_ceil(available) as usize
        };
        info!(
            database_mb = total_bytes / 1024 / 1024,
            device_mb = available / 1024 / 1024,
            fold_factor,
            "sizing device residency"
        );

        if config.gpu_bitcount > 0 {
            if max_bits % config.gpu_bitcount != 0 {
                return Err(SimError::Config(format!(
                    "forced device width {} does not divide the fingerprint width {max_bits}",
                    config.gpu_bitcount
                )));
            }
            let forced = max_bits / config.gpu_bitcount;
            if forced < fold_factor {
                return Err(SimError::Config(format!(
                    "forced device width {} needs fold factor {forced}, \
                     but the data only fits at {fold_factor}",
                    config.gpu_bitcount
                )));
            }
            fold_factor = forced;
        }

        if fold_factor > 1 {
            info!(fold_factor, "folding databases to fit device memory");
        }
        for db in self.databases.values_mut() {
            db.fold_to(fold_factor, config.cache_dir.as_deref(), &self.devices)
                .map_err(|err| match err {
                    // A transfer that failed its retry is a startup
                    // configuration problem, not a per-query condition.
                    SimError::Transient(msg) => {
                        SimError::Config(format!("device upload failed: {msg}"))
                    }
                    other => other,
                })?;
        }
        self.fold_factor = fold_factor;
        info!("device residency established, ready for searches");
        Ok(())
    }

    pub fn fold_factor(&self) -> usize {
        self.fold_factor
    }

    pub fn database(&self, name: &str) -> Option<&Database> {
        self.databases.get(name)
    }

    /// Fetch an unfolded fingerprint from a loaded database, mostly useful
    /// for tests and diagnostics.
    pub fn fingerprint_at(&self, name: &str, index: usize) -> Option<Vec<u32>> {
        self.databases.get(name)?.fingerprint_at(index)
    }

    pub fn using_devices(&self) -> bool {
        !self.devices.is_empty() && self.use_devices.load(Ordering::Relaxed)
    }

    /// Runtime toggle between the device and worker-pool scan paths.
    pub fn set_use_devices(&self, enable: bool) {
        self.use_devices.store(enable, Ordering::Relaxed);
    }

    /// Run one similarity query across the named databases and aggregate.
    ///
    /// Unknown database names are skipped with a warning. A query whose
    /// width does not match a named database is a protocol error. A database
    /// that fails transiently contributes empty results.
    pub fn query(
        &self,
        selections: &[(String, String)],
        request_id: i32,
        k: usize,
        cutoff: f32,
        query: &[u32],
    ) -> Result<QueryResults> {
        let started = Instant::now();

        let mut per_db: Vec<SearchHits<'_>> = Vec::with_capacity(selections.len());
        for (name, key) in selections {
            let Some(db) = self.databases.get(name.as_str()) else {
                warn!(db = %name, "unknown database in request, skipping");
                continue;
            };
            if query.len() * 32 != db.bit_count() {
                return Err(SimError::Protocol(format!(
                    "query width {} does not match database {} width {}",
                    query.len() * 32,
                    name,
                    db.bit_count()
                )));
            }
            let hits = if self.using_devices() {
                match db.search(query, key, k, cutoff) {
                    Ok(hits) => hits,
                    Err(err) => {
                        warn!(db = %name, error = %err, "search failed, omitting database");
                        continue;
                    }
                }
            } else {
                db.search_cpu(query, key, k, cutoff)
            };
            per_db.push(hits);
        }

        let approximate_total: u64 = per_db.iter().map(|h| h.approx_total).sum();
        let mut merged: Vec<DbHit<'_>> = Vec::new();
        for hits in &per_db {
            for i in 0..hits.scores.len() {
                merged.push(DbHit {
                    score: hits.scores[i],
                    smiles: hits.smiles[i],
                    id: hits.ids[i],
                });
            }
        }
        let results = aggregate::merge(merged, k, approximate_total);

        debug!(
            request_id,
            results = results.len(),
            approximate_total = results.approximate_total,
            elapsed_us = started.elapsed().as_micros() as u64,
            "search completed"
        );
        Ok(results)
    }
}
