//! Compute-device bookkeeping: enumeration, round-robin shard assignment, and
//! device-resident fingerprint buffers.
//!
//! Device memory is partitioned statically at startup; once every shard has
//! uploaded its words no further device allocation happens during a query.
//! The backend here keeps "device" buffers in host memory behind the same
//! interface the scan code sees, so the engine's placement, budgeting and
//! retry logic is exercised identically on hosts without dedicated hardware.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::config::ServerConfig;

/// Where a shard's scan data lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    /// Host memory; scans run directly over the shard's unfolded words.
    Cpu,
    /// A compute device ordinal in `[0, device_count)`.
    Ordinal(u32),
}

#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("device {ordinal} out of memory ({requested} bytes requested)")]
    OutOfMemory { ordinal: u32, requested: u64 },

    #[error("transfer to device {ordinal} failed")]
    TransferFailed { ordinal: u32 },
}

/// Words uploaded to one device for one shard.
#[derive(Debug)]
pub struct DeviceBuffer {
    ordinal: u32,
    words: Vec<u32>,
}

impl DeviceBuffer {
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn byte_len(&self) -> u64 {
        self.words.len() as u64 * 4
    }
}

#[derive(Debug)]
struct DeviceSlot {
    free_bytes: AtomicU64,
}

/// The set of compute devices available to this process.
///
/// Empty when the host has none or GPU use is disabled; searches then take
/// the CPU path and no upload happens.
#[derive(Debug)]
pub struct DeviceSet {
    slots: Vec<DeviceSlot>,
    next: AtomicUsize,
}

impl DeviceSet {
    /// Enumerate devices from the server configuration. `cpu_only` forces an
    /// empty set regardless of what the host reports.
    pub fn detect(config: &ServerConfig) -> Self {
        if config.cpu_only {
            debug!("device use disabled, running CPU-only");
            return Self::with_devices(0, 0);
        }
        Self::with_devices(config.device_count, config.device_memory_bytes)
    }

    /// Build a set of `count` devices with `free_bytes` of memory each.
    pub fn with_devices(count: usize, free_bytes: u64) -> Self {
        let slots = (0..count)
            .map(|_| DeviceSlot {
                free_bytes: AtomicU64::new(free_bytes),
            })
            .collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    /// Total free bytes across every device.
    pub fn free_bytes(&self) -> u64 {
        self.slots
            .iter()
            .map(|s| s.free_bytes.load(Ordering::Relaxed))
            .sum()
    }

    /// Next device ordinal, round-robin. The counter cycles through
    /// `[0, device_count)` and resets on wrap.
    pub fn next_ordinal(&self) -> u32 {
        let count = self.slots.len();
        debug_assert!(count > 0);
        let prev = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(if v + 1 >= count { 0 } else { v + 1 })
            })
            .unwrap_or(0);
        prev as u32
    }

    /// Copy `words` into device-resident storage, charging the device's
    /// memory budget. Fails with `OutOfMemory` when the budget is exhausted.
    pub fn upload(&self, ordinal: u32, words: &[u32]) -> Result<DeviceBuffer, DeviceError> {
        let slot = self
            .slots
            .get(ordinal as usize)
            .ok_or(DeviceError::TransferFailed { ordinal })?;
        let requested = words.len() as u64 * 4;
        slot.free_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |free| {
                free.checked_sub(requested)
            })
            .map_err(|_| DeviceError::OutOfMemory { ordinal, requested })?;
        Ok(DeviceBuffer {
            ordinal,
            words: words.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_and_resets() {
        let set = DeviceSet::with_devices(3, 1024);
        // Two full passes land on the same ordinals in the same order.
        for _ in 0..2 {
            for expect in 0..3 {
                assert_eq!(set.next_ordinal(), expect);
            }
        }
    }

    #[test]
    fn upload_charges_memory_budget() {
        let set = DeviceSet::with_devices(1, 64);
        let words = vec![0u32; 8]; // 32 bytes
        let buf = set.upload(0, &words).unwrap();
        assert_eq!(buf.byte_len(), 32);
        assert_eq!(set.free_bytes(), 32);
        set.upload(0, &words).unwrap();
        let err = set.upload(0, &words).unwrap_err();
        assert!(matches!(err, DeviceError::OutOfMemory { .. }));
    }

    #[test]
    fn empty_set_reports_cpu_mode() {
        let set = DeviceSet::with_devices(0, 0);
        assert!(set.is_empty());
        assert_eq!(set.free_bytes(), 0);
    }

    #[test]
    fn upload_to_unknown_ordinal_fails() {
        let set = DeviceSet::with_devices(1, 1024);
        assert!(matches!(
            set.upload(5, &[1, 2, 3]),
            Err(DeviceError::TransferFailed { ordinal: 5 })
        ));
    }
}
