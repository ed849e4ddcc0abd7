//! Content-addressed on-disk cache of folded fingerprint blobs.
//!
//! A cache file is named `{fold_factor}-{hex(sha256(unfolded_concat))}` and
//! holds the raw folded words of every shard concatenated in shard order,
//! little-endian, no header. Correctness derives entirely from the hashed
//! key: if the file exists, its contents equal the fold of the originals.
//! Concurrent writers are not supported; a file is opened at most once per
//! `(database, fold_factor)` pair per process.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

enum Handle {
    Reader(BufReader<File>),
    Writer(BufWriter<File>),
}

pub struct FoldCache {
    path: PathBuf,
    handle: Handle,
}

impl FoldCache {
    /// Open the cache entry for `(fold_factor, content_hash)` under `dir`.
    ///
    /// Creates `dir` if missing. An existing file opens read-only, otherwise
    /// a fresh file opens write-only. Any failure is non-fatal: the caller
    /// gets `None` and folds in memory.
    pub fn open(dir: &Path, fold_factor: usize, content_hash: &[u8; 32]) -> Option<FoldCache> {
        if let Err(err) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %err, "cannot create fold cache directory");
            return None;
        }
        let path = dir.join(format!("{fold_factor}-{}", hex::encode(content_hash)));
        if path.exists() {
            match File::open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "reading folded fingerprints from cache");
                    Some(FoldCache {
                        path,
                        handle: Handle::Reader(BufReader::new(file)),
                    })
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot open fold cache file");
                    None
                }
            }
        } else {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!(path = %path.display(), "writing folded fingerprints to cache");
                    Some(FoldCache {
                        path,
                        handle: Handle::Writer(BufWriter::new(file)),
                    })
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "cannot create fold cache file");
                    None
                }
            }
        }
    }

    /// Whether this handle reads back an existing blob (as opposed to filling
    /// a fresh one).
    pub fn is_reader(&self) -> bool {
        matches!(self.handle, Handle::Reader(_))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read exactly `word_count` words, the next shard's folded blob.
    pub fn read_shard(&mut self, word_count: usize) -> io::Result<Vec<u32>> {
        let Handle::Reader(reader) = &mut self.handle else {
            return Err(io::Error::other("fold cache opened write-only"));
        };
        let mut bytes = vec![0u8; word_count * 4];
        reader.read_exact(&mut bytes)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    /// Append one shard's folded words.
    pub fn write_shard(&mut self, words: &[u32]) -> io::Result<()> {
        let Handle::Writer(writer) = &mut self.handle else {
            return Err(io::Error::other("fold cache opened read-only"));
        };
        for word in words {
            writer.write_all(&word.to_le_bytes())?;
        }
        Ok(())
    }

    /// Flush a write handle; errors are surfaced so the caller can log and
    /// fall back.
    pub fn finish(mut self) -> io::Result<()> {
        if let Handle::Writer(writer) = &mut self.handle {
            writer.flush()?;
        }
        Ok(())
    }
}
