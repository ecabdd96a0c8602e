use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, warn};

use crate::Result;
use crate::command::{Cmd, CommandFactory};

/// Belief about which ip set names exist in the dataplane, shared by a
/// registry and all of its sets.
///
/// Never authoritative: anything that observes a surprising failure should
/// call [`ExistenceCache::reload`] to resync with the dataplane.
pub trait ExistenceCache: Send + Sync {
    fn exists(&self, name: &str) -> bool;

    /// Records the outcome of a create or destroy this process just saw succeed.
    fn set_exists(&self, name: &str, exists: bool);

    /// Snapshot of every name currently believed to exist.
    fn names(&self) -> Vec<String>;

    /// Replaces the whole belief set with the dataplane's listing.
    fn reload(&self) -> Result<()>;

    /// Visits a snapshot, so `visit` is free to update the cache.
    fn for_each<V>(&self, mut visit: V)
    where
        V: FnMut(&str),
        Self: Sized,
    {
        for name in self.names() {
            visit(&name);
        }
    }
}

pub struct IpSetExistenceCache<F> {
    names: RwLock<ahash::HashSet<String>>,
    cmd: Arc<F>,
}

impl<F: CommandFactory> IpSetExistenceCache<F> {
    /// Creates the cache and does an initial load. A failed load leaves the
    /// cache empty; the next cleanup pass reloads it.
    pub fn new(cmd: Arc<F>) -> Self {
        let cache = Self {
            names: RwLock::new(ahash::HashSet::default()),
            cmd,
        };
        if let Err(e) = cache.reload() {
            warn!(%e, "failed initial load of ip set existence cache");
        }
        cache
    }
}

impl<F: CommandFactory> ExistenceCache for IpSetExistenceCache<F> {
    fn exists(&self, name: &str) -> bool {
        let names = self.names.read().unwrap_or_else(PoisonError::into_inner);
        names.contains(name)
    }

    fn set_exists(&self, name: &str, exists: bool) {
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        if exists {
            names.insert(name.to_owned());
        } else {
            names.remove(name);
        }
    }

    fn names(&self) -> Vec<String> {
        let names = self.names.read().unwrap_or_else(PoisonError::into_inner);
        names.iter().cloned().collect()
    }

    fn reload(&self) -> Result<()> {
        info!("reloading ip set existence cache");
        let output = self.cmd.new_command(&["list", "-n"]).output()?;
        let listed = parse_set_names(&output);
        let mut names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        *names = listed;
        Ok(())
    }
}

fn parse_set_names(output: &[u8]) -> ahash::HashSet<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .inspect(|name| debug!(set_name = %name, "found ip set"))
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::FakeDataplane;

    #[test]
    fn test_new_loads_existing_names() {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-a", "hash:ip", ["10.0.0.1"]);
        dataplane.insert_set("KUBE-X", "hash:net", [] as [&str; 0]);

        let cache = IpSetExistenceCache::new(Arc::new(dataplane.clone()));
        assert!(cache.exists("mesh4-a"));
        assert!(cache.exists("KUBE-X"));
        assert!(!cache.exists("mesh4-b"));
        assert_eq!(dataplane.invocations(), vec!["list -n".to_string()]);
    }

    #[test]
    fn test_set_exists_updates_belief_only() {
        let dataplane = FakeDataplane::new();
        let cache = IpSetExistenceCache::new(Arc::new(dataplane.clone()));
        cache.set_exists("mesh4-a", true);
        assert!(cache.exists("mesh4-a"));
        assert!(!dataplane.has_set("mesh4-a"));
        cache.set_exists("mesh4-a", false);
        assert!(!cache.exists("mesh4-a"));
    }

    #[test]
    fn test_reload_replaces_everything() -> crate::Result<()> {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-a", "hash:ip", [] as [&str; 0]);
        let cache = IpSetExistenceCache::new(Arc::new(dataplane.clone()));
        cache.set_exists("mesh4-stale", true);

        dataplane.remove_set("mesh4-a");
        dataplane.insert_set("mesh4-b", "hash:ip", [] as [&str; 0]);
        cache.reload()?;

        let mut names = cache.names();
        names.sort();
        assert_eq!(names, vec!["mesh4-b".to_string()]);
        Ok(())
    }

    #[test]
    fn test_failed_reload_keeps_previous_belief() {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-a", "hash:ip", [] as [&str; 0]);
        let cache = IpSetExistenceCache::new(Arc::new(dataplane.clone()));

        dataplane.fail_next_lists(1);
        assert!(cache.reload().is_err());
        assert!(cache.exists("mesh4-a"));
    }

    #[test]
    fn test_for_each_may_mutate() {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-a", "hash:ip", [] as [&str; 0]);
        dataplane.insert_set("mesh4-b", "hash:ip", [] as [&str; 0]);
        let cache = IpSetExistenceCache::new(Arc::new(dataplane));

        let mut visited = 0;
        cache.for_each(|name| {
            visited += 1;
            cache.set_exists(name, false);
        });
        assert_eq!(visited, 2);
        assert!(cache.names().is_empty());
    }

    #[test]
    fn test_parse_skips_blank_lines() {
        let names = parse_set_names(b"a\n\n  b \nc");
        assert_eq!(names.len(), 3);
        assert!(names.contains("b"));
    }
}
