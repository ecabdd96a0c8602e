use std::sync::Arc;

use ipnetwork::IpNetwork;
use tracing::{debug, error, info, warn};

use crate::cache::{ExistenceCache, IpSetExistenceCache};
use crate::command::{Cmd, CommandFactory};
use crate::naming::{IpFamily, IpVersionConfig};
use crate::set::{IpSet, IpSetId, IpSetMetadata, IpSetType, RetryPolicy};
use crate::{Error, Result};

/// Owns the life-cycle of every ip set for one IP version.
///
/// All sets should be created through a registry; cleanup treats anything
/// with our prefix that the registry doesn't know about as left over from an
/// earlier run and destroys it.
///
/// Not internally synchronised: callers serialise mutations, applies and
/// cleanup against each other.
pub struct Registry<C, F> {
    config: Arc<IpVersionConfig>,

    active: ahash::HashMap<IpSetId, IpSet<C, F>>,
    dirty: ahash::HashSet<IpSetId>,
    pending_deletions: ahash::HashSet<IpSetId>,

    cache: Arc<C>,
    cmd: Arc<F>,
    retry: RetryPolicy,
}

impl<F: CommandFactory> Registry<IpSetExistenceCache<F>, F> {
    pub fn new(config: IpVersionConfig, cmd: Arc<F>) -> Self {
        let cache = Arc::new(IpSetExistenceCache::new(cmd.clone()));
        Self::with_overrides(config, cache, cmd)
    }
}

impl<C, F> Registry<C, F>
where
    C: ExistenceCache,
    F: CommandFactory,
{
    pub fn with_overrides(config: IpVersionConfig, cache: Arc<C>, cmd: Arc<F>) -> Self {
        Self {
            config: Arc::new(config),
            active: ahash::HashMap::default(),
            dirty: ahash::HashSet::default(),
            pending_deletions: ahash::HashSet::default(),
            cache,
            cmd,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn get(&self, id: &IpSetId) -> Option<&IpSet<C, F>> {
        self.active.get(id)
    }

    pub fn is_dirty(&self, id: &IpSetId) -> bool {
        self.dirty.contains(id)
    }

    pub fn is_pending_deletion(&self, id: &IpSetId) -> bool {
        self.pending_deletions.contains(id)
    }

    /// Installs a fresh set for `metadata.id`, dropping any earlier object and
    /// its unapplied deltas. Members of the other IP family, malformed
    /// members and networks in a `hash:ip` set are dropped.
    pub fn add_or_replace_set<I>(&mut self, metadata: IpSetMetadata, members: I)
    where
        I: IntoIterator<Item = String>,
    {
        let members = valid_members(self.config.family(), metadata.set_type, members);
        let id = metadata.id.clone();
        let mut set = IpSet::new(
            self.config.clone(),
            metadata,
            self.cache.clone(),
            self.cmd.clone(),
        )
        .with_retry_policy(self.retry);
        set.replace_members(members);
        self.active.insert(id.clone(), set);
        self.pending_deletions.remove(&id);
        self.dirty.insert(id);
    }

    pub fn add_members<I>(&mut self, id: &IpSetId, members: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let family = self.config.family();
        let set = self
            .active
            .get_mut(id)
            .ok_or_else(|| Error::UnknownIpSet(id.to_string()))?;
        let set_type = set.metadata().set_type;
        set.add_members(valid_members(family, set_type, members));
        self.dirty.insert(id.clone());
        Ok(())
    }

    pub fn remove_members<I>(&mut self, id: &IpSetId, members: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let family = self.config.family();
        let set = self
            .active
            .get_mut(id)
            .ok_or_else(|| Error::UnknownIpSet(id.to_string()))?;
        let set_type = set.metadata().set_type;
        set.remove_members(valid_members(family, set_type, members));
        self.dirty.insert(id.clone());
        Ok(())
    }

    /// Queues the set for deletion by the next [`Registry::apply_deletions`].
    pub fn remove_set(&mut self, id: &IpSetId) {
        self.active.remove(id);
        self.dirty.remove(id);
        self.pending_deletions.insert(id.clone());
    }

    /// Flushes updates and creations to the dataplane.
    ///
    /// Kept separate from [`Registry::apply_deletions`] so rules referencing
    /// new sets can be programmed in between, and rules referencing old sets
    /// removed before the sets themselves.
    pub fn apply_updates(&mut self) -> Result<()> {
        let dirty: Vec<IpSetId> = self.dirty.iter().cloned().collect();
        for id in dirty {
            if let Some(set) = self.active.get_mut(&id) {
                set.apply()?;
            }
            self.dirty.remove(&id);
        }
        Ok(())
    }

    /// Tries to destroy every set queued by [`Registry::remove_set`].
    ///
    /// Failures are logged and the set is still dropped from the queue; the
    /// next [`Registry::attempt_cleanup`] retries it.
    pub fn apply_deletions(&mut self) {
        let mut reload = false;
        for id in std::mem::take(&mut self.pending_deletions) {
            info!(set_id = %id, "deleting ip set (if it exists)");
            for name in [
                self.config.name_for_main_set(&id),
                self.config.name_for_temp_set(&id),
            ] {
                if self.cache.exists(&name) && self.destroy(&name).is_err() {
                    reload = true;
                }
            }
        }
        if reload {
            warn!("an ip set delete failed, reloading existence cache");
            if let Err(e) = self.cache.reload() {
                warn!(%e, "failed to reload ip set existence cache");
            }
        }
    }

    /// Destroys any of our sets that are neither active nor queued for
    /// deletion, either left over from a previous run or from a failed
    /// deletion.
    pub fn attempt_cleanup(&mut self) {
        let mut expected = ahash::HashSet::default();
        for id in self.active.keys().chain(self.pending_deletions.iter()) {
            let main_name = self.config.name_for_main_set(id);
            let temp_name = self.config.name_for_temp_set(id);
            debug!(set_id = %id, %main_name, %temp_name, "whitelisting ip sets");
            expected.insert(main_name);
            expected.insert(temp_name);
        }

        if let Err(e) = self.cache.reload() {
            error!(%e, "failed to load ip sets from dataplane, unable to do cleanup");
            return;
        }

        self.cache.for_each(|set_name| {
            if !self.config.owns_set_name(set_name) {
                debug!(%set_name, "skipping ip set: not ours or wrong ip version");
                return;
            }
            if expected.contains(set_name) {
                debug!(%set_name, "skipping expected ip set");
                return;
            }
            info!(%set_name, "removing left-over ip set");
            if let Err(e) = self.destroy(set_name) {
                warn!(
                    %e,
                    %set_name,
                    "failed to delete ip set during cleanup, is it still referenced?"
                );
            }
        });
    }

    fn destroy(&self, set_name: &str) -> Result<()> {
        info!(%set_name, "deleting ip set");
        match self
            .cmd
            .new_command(&["destroy", set_name])
            .combined_output()
        {
            Ok(_) => {
                info!(%set_name, "deleted ip set");
                self.cache.set_exists(set_name, false);
                Ok(())
            }
            Err(e) => {
                warn!(%e, %set_name, "failed to delete ip set, may be out-of-sync");
                Err(e)
            }
        }
    }
}

/// Keeps the members a set of `set_type` in `family` can hold. Members of the
/// other family are skipped silently. Anything that isn't an address or
/// network is dropped with a warning, as are networks wider than one host in
/// a `hash:ip` set. Host routes like `10.0.0.1/32` go into a `hash:ip` set as
/// the bare address.
fn valid_members<I>(family: IpFamily, set_type: IpSetType, members: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    members
        .into_iter()
        .filter(|member| family.matches_member(member))
        .filter_map(|member| match (set_type, member.parse::<IpNetwork>()) {
            (_, Err(e)) => {
                warn!(%e, %member, "dropping malformed ip set member");
                None
            }
            (IpSetType::HashIp, Ok(net)) if !is_single_host(&net) => {
                warn!(%member, %set_type, "dropping network from address-only ip set");
                None
            }
            (IpSetType::HashIp, Ok(net)) => Some(net.ip().to_string()),
            (IpSetType::HashNet, Ok(_)) => Some(member),
        })
        .collect()
}

fn is_single_host(net: &IpNetwork) -> bool {
    let max_prefix = if net.is_ipv4() { 32 } else { 128 };
    net.prefix() == max_prefix
}
