pub mod config;
pub mod error;
pub mod reconciler;
pub mod state;

pub use error::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;
