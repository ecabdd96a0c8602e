use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to read desired state from {path}: {source}")]
    ReadState {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse desired state from {path}: {source}")]
    ParseState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("ipset error: {0}")]
    Ipset(#[from] mesh_cni_ipset::Error),

    #[error("reconciliation task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl Error {
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Ipset(e) if e.is_unrecoverable())
    }
}
