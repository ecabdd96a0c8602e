use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("`{command}` exited with {status}: {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    #[error("invalid ip set id {0:?}")]
    InvalidId(String),

    #[error("no active ip set with id {0}")]
    UnknownIpSet(String),

    #[error("incremental update unavailable: {0}")]
    DeltaUnavailable(String),

    #[error("failed to render ipset script: {0}")]
    Script(#[from] std::fmt::Error),

    #[error("invalid ip set name pattern: {0}")]
    NamePattern(#[from] regex::Error),

    #[error("failed to rewrite ip set {id} after {attempts} attempts: {source}")]
    Unrecoverable {
        id: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Dataplane state can no longer be trusted; the process should shut down.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Error::Unrecoverable { .. })
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
