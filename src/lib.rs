pub mod aggregate;
pub mod bitops;
pub mod config;
pub mod db;
pub mod device;
pub mod engine;
pub mod error;
pub mod server;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::ServerConfig;
use engine::Engine;
use server::SimServer;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "fpsimserver",
    version,
    about = "Fingerprint similarity search server on a local socket"
)]
pub struct Cli {
    /// Database files (.fsim) to load and serve
    #[arg(required = true)]
    pub databases: Vec<PathBuf>,

    /// Maximum on-device fingerprint width in bits (0 = auto)
    #[arg(long = "gpu_bitcount", default_value_t = 0)]
    pub gpu_bitcount: usize,

    /// Search on the worker pool only, never upload to a device
    #[arg(long = "cpu_only")]
    pub cpu_only: bool,

    /// Directory for cached folded fingerprints
    #[arg(long = "cache_dir")]
    pub cache_dir: Option<PathBuf>,

    /// Socket path to listen on (defaults to /tmp/gpusimilarity)
    #[arg(long)]
    pub socket: Option<PathBuf>,
}

impl Cli {
    /// Fold the CLI flags over the environment-derived configuration.
    pub fn into_config(self) -> (Vec<PathBuf>, ServerConfig) {
        let mut config = ServerConfig::from_env();
        if self.gpu_bitcount > 0 {
            config.gpu_bitcount = self.gpu_bitcount;
        }
        if self.cpu_only {
            config.cpu_only = true;
        }
        if self.cache_dir.is_some() {
            config.cache_dir = self.cache_dir;
        }
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        (self.databases, config)
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .with_target(false)
        .init();

    let (databases, config) = cli.into_config();
    let engine = Engine::start(&databases, &config)?;
    let server = SimServer::new(engine, config);
    server.run()?;
    Ok(())
}
