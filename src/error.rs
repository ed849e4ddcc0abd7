//! Error kinds for the similarity engine.
//!
//! Kinds map onto how failures are contained: `Config` is fatal at startup,
//! `Auth` is silent (the database contributes nothing), `Protocol` closes the
//! offending connection without a reply, `Io` is logged and worked around,
//! `Transient` is retried once before escalating.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database key rejected")]
    Auth,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transient device error: {0}")]
    Transient(String),

    #[error("unsupported database file version {found} in {path:?} (expected {expected})")]
    Version {
        path: PathBuf,
        found: i32,
        expected: i32,
    },
}

pub type Result<T> = std::result::Result<T, SimError>;
