pub mod cache;
pub mod command;
pub mod error;
pub mod naming;
pub mod registry;
pub mod set;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cache::{ExistenceCache, IpSetExistenceCache};
pub use command::{Cmd, CommandFactory, SystemCommandFactory};
pub use error::{Error, Result};
pub use naming::{IpFamily, IpVersionConfig, MAX_IPSET_NAME_LENGTH};
pub use registry::Registry;
pub use set::{IpSet, IpSetId, IpSetMetadata, IpSetType, RetryPolicy};

pub(crate) const IPSET_BIN: &str = "ipset";
