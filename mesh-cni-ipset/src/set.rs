use std::fmt::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{Level, debug, enabled, error, info, warn};

use crate::cache::ExistenceCache;
use crate::command::{Cmd, CommandFactory};
use crate::naming::IpVersionConfig;
use crate::{Error, Result};

/// Opaque set identifier. Upstream ids are already hashes, so the only
/// interpretation applied is truncation when building dataplane names.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IpSetId(String);

impl IpSetId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(Error::InvalidId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IpSetId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<IpSetId> for String {
    fn from(value: IpSetId) -> Self {
        value.0
    }
}

impl fmt::Display for IpSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpSetType {
    #[serde(rename = "hash:ip")]
    HashIp,
    #[serde(rename = "hash:net")]
    HashNet,
}

impl fmt::Display for IpSetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpSetType::HashIp => write!(f, "hash:ip"),
            IpSetType::HashNet => write!(f, "hash:net"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IpSetMetadata {
    pub id: IpSetId,
    pub set_type: IpSetType,
    pub max_size: u32,
}

/// Bounds the full-rewrite retry loop in [`IpSet::apply`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

/// A single ip set.
///
/// Membership changes are only recorded until [`IpSet::apply`] writes them
/// to the dataplane. While `rewrite_pending` is set the delta sets are
/// empty and the next apply rewrites the whole set from `desired`.
pub struct IpSet<C, F> {
    metadata: IpSetMetadata,
    config: Arc<IpVersionConfig>,

    desired: ahash::HashSet<String>,
    pending_adds: ahash::HashSet<String>,
    pending_deletions: ahash::HashSet<String>,
    rewrite_pending: bool,

    cache: Arc<C>,
    cmd: Arc<F>,
    retry: RetryPolicy,
}

impl<C, F> IpSet<C, F>
where
    C: ExistenceCache,
    F: CommandFactory,
{
    pub fn new(
        config: Arc<IpVersionConfig>,
        metadata: IpSetMetadata,
        cache: Arc<C>,
        cmd: Arc<F>,
    ) -> Self {
        Self {
            metadata,
            config,
            desired: ahash::HashSet::default(),
            pending_adds: ahash::HashSet::default(),
            pending_deletions: ahash::HashSet::default(),
            rewrite_pending: true,
            cache,
            cmd,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn metadata(&self) -> &IpSetMetadata {
        &self.metadata
    }

    pub fn main_name(&self) -> String {
        self.config.name_for_main_set(&self.metadata.id)
    }

    pub fn temp_name(&self) -> String {
        self.config.name_for_temp_set(&self.metadata.id)
    }

    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.desired.iter().map(String::as_str)
    }

    pub fn is_rewrite_pending(&self) -> bool {
        self.rewrite_pending
    }

    pub fn replace_members<I>(&mut self, members: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.desired = members.into_iter().collect();
        self.rewrite_pending = true;
        self.pending_adds.clear();
        self.pending_deletions.clear();
    }

    pub fn add_members<I>(&mut self, members: I)
    where
        I: IntoIterator<Item = String>,
    {
        for member in members {
            if !self.rewrite_pending {
                self.pending_deletions.remove(&member);
                self.pending_adds.insert(member.clone());
            }
            self.desired.insert(member);
        }
    }

    pub fn remove_members<I>(&mut self, members: I)
    where
        I: IntoIterator<Item = String>,
    {
        for member in members {
            self.desired.remove(&member);
            if !self.rewrite_pending {
                self.pending_adds.remove(&member);
                self.pending_deletions.insert(member);
            }
        }
    }

    /// Writes pending changes to the dataplane.
    ///
    /// Deltas are tried first; any failure there falls back to a full
    /// rewrite. A rewrite that still fails after the retry budget returns
    /// [`Error::Unrecoverable`].
    pub fn apply(&mut self) -> Result<()> {
        let mut attempts = 0;
        loop {
            if !self.rewrite_pending {
                match self.flush_deltas() {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        warn!(
                            %e,
                            set_id = %self.metadata.id,
                            "failed to update ip set, rewriting it"
                        );
                        self.rewrite_pending = true;
                        self.pending_adds.clear();
                        self.pending_deletions.clear();
                        continue;
                    }
                }
            }

            attempts += 1;
            match self.rewrite() {
                Ok(()) => {
                    self.rewrite_pending = false;
                    return Ok(());
                }
                Err(e) if attempts >= self.retry.attempts => {
                    error!(
                        %e,
                        set_id = %self.metadata.id,
                        attempts,
                        "failed to rewrite ip set, giving up"
                    );
                    return Err(Error::Unrecoverable {
                        id: self.metadata.id.to_string(),
                        attempts,
                        source: Box::new(e),
                    });
                }
                Err(e) => {
                    // ipset has been seen to fail at random (segfaults, the
                    // kernel rejecting the netlink socket) so back off and
                    // resync the existence cache in case it drifted
                    warn!(
                        %e,
                        set_id = %self.metadata.id,
                        attempts,
                        "sleeping before retrying ip set rewrite"
                    );
                    thread::sleep(self.retry.backoff);
                    if let Err(e) = self.cache.reload() {
                        warn!(%e, "failed to reload ip set existence cache");
                    }
                }
            }
        }
    }

    fn flush_deltas(&mut self) -> Result<()> {
        if self.pending_adds.is_empty() && self.pending_deletions.is_empty() {
            return Ok(());
        }
        let main_name = self.main_name();
        if !self.cache.exists(&main_name) {
            return Err(Error::DeltaUnavailable(format!("{main_name} does not exist")));
        }

        let mut script = String::new();
        self.write_deltas(&mut script, &main_name)?;
        debug!(
            set_id = %self.metadata.id,
            adds = self.pending_adds.len(),
            deletions = self.pending_deletions.len(),
            "flushing ip set deltas"
        );
        self.restore(script)?;

        self.pending_adds.clear();
        self.pending_deletions.clear();
        Ok(())
    }

    fn write_deltas(&self, buf: &mut impl Write, main_name: &str) -> fmt::Result {
        for member in sorted(&self.pending_deletions) {
            writeln!(buf, "del {main_name} {member}")?;
        }
        for member in sorted(&self.pending_adds) {
            writeln!(buf, "add {main_name} {member}")?;
        }
        writeln!(buf, "COMMIT")
    }

    /// Full, atomic, idempotent rewrite of the set.
    fn rewrite(&self) -> Result<()> {
        info!(set_id = %self.metadata.id, members = self.desired.len(), "rewriting ip set");
        let mut script = String::new();
        self.write_full_rewrite(&mut script)?;
        if enabled!(Level::DEBUG) {
            debug!(set_id = %self.metadata.id, input = %script, "about to rewrite ip set");
        }
        self.restore(script)?;

        // the main set now exists and the temp set was destroyed after the swap
        info!(set_id = %self.metadata.id, "rewrote ip set");
        self.cache.set_exists(&self.main_name(), true);
        self.cache.set_exists(&self.temp_name(), false);
        Ok(())
    }

    /// Builds the restore input for a rewrite: fill a temp set, swap it into
    /// place, destroy what used to be the main set. Only the swap is atomic.
    fn write_full_rewrite(&self, buf: &mut impl Write) -> fmt::Result {
        let main_name = self.main_name();
        let temp_name = self.temp_name();
        let IpSetMetadata {
            set_type, max_size, ..
        } = self.metadata;
        let family = self.config.family();

        if !self.cache.exists(&main_name) {
            // empty main set so the swap below has something to swap with;
            // -exist is no help as it still fails on changed parameters
            debug!(set_id = %self.metadata.id, "pre-creating main ip set");
            writeln!(buf, "create {main_name} {set_type} family {family} maxelem {max_size}")?;
        }
        if self.cache.exists(&temp_name) {
            // may have been created with different parameters
            debug!(set_id = %self.metadata.id, "temp ip set exists, deleting it before rewrite");
            writeln!(buf, "destroy {temp_name}")?;
        }
        writeln!(buf, "create {temp_name} {set_type} family {family} maxelem {max_size}")?;
        for member in sorted(&self.desired) {
            writeln!(buf, "add {temp_name} {member}")?;
        }
        writeln!(buf, "swap {main_name} {temp_name}")?;
        writeln!(buf, "destroy {temp_name}")?;
        writeln!(buf, "COMMIT")
    }

    fn restore(&self, script: String) -> Result<()> {
        let mut cmd = self.cmd.new_command(&["restore"]);
        cmd.set_stdin(script.into_bytes());
        if let Err(e) = cmd.combined_output() {
            warn!(%e, set_id = %self.metadata.id, "failed to execute ipset restore");
            return Err(e);
        }
        Ok(())
    }

    /// Best effort; a failure most likely means the temp set is already gone.
    pub fn delete_temp_set(&self) {
        let temp_name = self.temp_name();
        match self
            .cmd
            .new_command(&["destroy", &temp_name])
            .combined_output()
        {
            Ok(_) => self.cache.set_exists(&temp_name, false),
            Err(e) => {
                info!(
                    %e,
                    set_name = %temp_name,
                    "failed to delete temporary ip set, assuming it is not present"
                )
            }
        }
    }
}

fn sorted(members: &ahash::HashSet<String>) -> Vec<&String> {
    let mut members: Vec<_> = members.iter().collect();
    members.sort();
    members
}
