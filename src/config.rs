//! Server configuration from CLI flags with `FPSIM_*` environment fallbacks.

use std::path::PathBuf;
use std::time::Duration;

/// Default local stream socket the server listens on.
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/gpusimilarity";

/// Per-device memory budget assumed when none is configured.
const DEFAULT_DEVICE_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Path to the Unix socket.
    pub socket_path: PathBuf,
    /// Directory for folded-fingerprint blobs. `None` disables caching.
    pub cache_dir: Option<PathBuf>,
    /// Forced on-device fingerprint width; 0 auto-computes the fold factor.
    pub gpu_bitcount: usize,
    /// Disable device use entirely; searches run on the worker pool.
    pub cpu_only: bool,
    /// Number of compute devices to partition shards across.
    pub device_count: usize,
    /// Free bytes per device used for the fold-factor computation.
    pub device_memory_bytes: u64,
    /// Per-connection read/write timeout.
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            cache_dir: None,
            gpu_bitcount: 0,
            cpu_only: false,
            device_count: 0,
            device_memory_bytes: DEFAULT_DEVICE_MEMORY_BYTES,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl ServerConfig {
    /// Load config from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = dotenvy::var("FPSIM_SOCKET") {
            cfg.socket_path = PathBuf::from(path);
        }

        if let Ok(dir) = dotenvy::var("FPSIM_CACHE_DIR")
            && !dir.is_empty()
        {
            cfg.cache_dir = Some(PathBuf::from(dir));
        }

        if let Ok(val) = dotenvy::var("FPSIM_GPU_BITCOUNT")
            && let Ok(n) = val.parse()
        {
            cfg.gpu_bitcount = n;
        }

        if let Ok(val) = dotenvy::var("FPSIM_CPU_ONLY") {
            cfg.cpu_only = val != "0" && val.to_lowercase() != "false";
        }

        if let Ok(val) = dotenvy::var("FPSIM_DEVICE_COUNT")
            && let Ok(n) = val.parse()
        {
            cfg.device_count = n;
        }

        if let Ok(val) = dotenvy::var("FPSIM_DEVICE_MEMORY")
            && let Ok(bytes) = val.parse()
        {
            cfg.device_memory_bytes = bytes;
        }

        if let Ok(val) = dotenvy::var("FPSIM_REQUEST_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.request_timeout = Duration::from_secs(secs);
        }

        cfg
    }
}
