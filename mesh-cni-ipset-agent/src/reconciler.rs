use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mesh_cni_ipset::{
    CommandFactory, ExistenceCache, IpSetExistenceCache, Registry, SystemCommandFactory,
};
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::Result;
use crate::config::IpsetArgs;
use crate::state::{Change, DesiredState};

pub type SystemReconciler =
    Reconciler<IpSetExistenceCache<SystemCommandFactory>, SystemCommandFactory>;

/// Drives one registry per IP family from the desired state file.
pub struct Reconciler<C, F> {
    registries: Vec<Registry<C, F>>,
    state_file: PathBuf,
    applied: DesiredState,
    loaded: bool,
}

impl SystemReconciler {
    pub fn from_args(args: &IpsetArgs) -> Result<Self> {
        let cmd = Arc::new(SystemCommandFactory::new(args.ipset_path.clone()));
        let registries = args
            .families()
            .into_iter()
            .map(|family| Ok(Registry::new(args.version_config(family)?, cmd.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(registries, args.state_file.clone()))
    }
}

impl<C, F> Reconciler<C, F>
where
    C: ExistenceCache,
    F: CommandFactory,
{
    pub fn new(registries: Vec<Registry<C, F>>, state_file: PathBuf) -> Self {
        Self {
            registries,
            state_file,
            applied: DesiredState::default(),
            loaded: false,
        }
    }

    /// Loads the desired state file and records what changed since the last
    /// load in every registry, without touching the dataplane.
    pub fn stage(&mut self) -> Result<()> {
        let desired = DesiredState::load(&self.state_file)?;
        let changes = desired.changes_since(&self.applied);
        if !changes.is_empty() {
            info!(changes = changes.len(), sets = desired.len(), "desired ip sets changed");
        }
        for registry in &mut self.registries {
            for change in &changes {
                match change {
                    Change::Replace(spec) => {
                        registry.add_or_replace_set(spec.metadata(), spec.members.iter().cloned())
                    }
                    Change::Members { id, added, removed } => {
                        registry.remove_members(id, removed.iter().cloned())?;
                        registry.add_members(id, added.iter().cloned())?;
                    }
                    Change::Remove(id) => registry.remove_set(id),
                }
            }
        }
        self.applied = desired;
        self.loaded = true;
        Ok(())
    }

    /// Stages the desired state and writes it: updates in every registry
    /// first, then deletions.
    pub fn sync(&mut self) -> Result<()> {
        self.stage()?;
        for registry in &mut self.registries {
            registry.apply_updates()?;
        }
        for registry in &mut self.registries {
            registry.apply_deletions();
        }
        Ok(())
    }

    /// Sweeps left-over sets. Skipped until a desired state has been loaded
    /// since every one of our sets would look left over.
    pub fn cleanup(&mut self) {
        if !self.loaded {
            warn!("no desired ip set state loaded yet, skipping cleanup");
            return;
        }
        for registry in &mut self.registries {
            registry.attempt_cleanup();
        }
    }
}

/// Reconciles until cancelled or until the dataplane can no longer be
/// trusted, which is returned as an error.
pub async fn run<C, F>(
    reconciler: Reconciler<C, F>,
    resync_interval: Duration,
    cleanup_interval: Duration,
    cancel: CancellationToken,
) -> Result<()>
where
    C: ExistenceCache + 'static,
    F: CommandFactory + 'static,
{
    info!("starting ip set reconciler");
    let (mut reconciler, result) = on_blocking(reconciler, |r| {
        r.sync()?;
        r.cleanup();
        Ok(())
    })
    .await?;
    check(result)?;

    let mut resync = interval(resync_interval);
    let mut cleanup = interval(cleanup_interval);
    // both fire immediately and startup already did both
    resync.tick().await;
    cleanup.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = resync.tick() => {
                let (r, result) = on_blocking(reconciler, Reconciler::sync).await?;
                reconciler = r;
                check(result)?;
            }
            _ = cleanup.tick() => {
                let (r, result) = on_blocking(reconciler, |r| {
                    r.cleanup();
                    Ok(())
                })
                .await?;
                reconciler = r;
                check(result)?;
            }
        }
    }

    info!("ip set reconciler stopped");
    Ok(())
}

// the engine shells out and sleeps between retries, so keep it off the runtime
async fn on_blocking<C, F, P>(
    mut reconciler: Reconciler<C, F>,
    pass: P,
) -> Result<(Reconciler<C, F>, Result<()>)>
where
    C: ExistenceCache + 'static,
    F: CommandFactory + 'static,
    P: FnOnce(&mut Reconciler<C, F>) -> Result<()> + Send + 'static,
{
    let out = tokio::task::spawn_blocking(move || {
        let result = pass(&mut reconciler);
        (reconciler, result)
    })
    .await?;
    Ok(out)
}

fn check(result: Result<()>) -> Result<()> {
    match result {
        Err(e) if e.is_unrecoverable() => Err(e),
        Err(e) => {
            error!(%e, "ip set reconciliation failed");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

#[cfg(test)]
mod test {
    use mesh_cni_ipset::testing::FakeDataplane;
    use mesh_cni_ipset::{IpFamily, IpVersionConfig, RetryPolicy};
    use tempfile::NamedTempFile;

    use super::*;
    use crate::Error;

    type TestReconciler = Reconciler<IpSetExistenceCache<FakeDataplane>, FakeDataplane>;

    fn registry(
        dataplane: &FakeDataplane,
        family: IpFamily,
    ) -> Registry<IpSetExistenceCache<FakeDataplane>, FakeDataplane> {
        let config = IpVersionConfig::new(family, "mesh", ["mesh"], [] as [&str; 0]).unwrap();
        Registry::new(config, Arc::new(dataplane.clone())).with_retry_policy(RetryPolicy {
            attempts: 3,
            backoff: Duration::ZERO,
        })
    }

    fn reconciler(dataplane: &FakeDataplane, file: &NamedTempFile) -> TestReconciler {
        Reconciler::new(
            vec![
                registry(dataplane, IpFamily::V4),
                registry(dataplane, IpFamily::V6),
            ],
            file.path().to_path_buf(),
        )
    }

    fn write_state(file: &NamedTempFile, contents: &str) {
        std::fs::write(file.path(), contents).unwrap();
    }

    const S1: &str = r#"{ "sets": [
        { "id": "s1", "type": "hash:ip", "maxSize": 100, "members": ["10.0.0.1", "fd00::1"] }
    ] }"#;

    #[test]
    fn test_sync_programs_both_families() -> Result<()> {
        let dataplane = FakeDataplane::new();
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let mut reconciler = reconciler(&dataplane, &file);

        reconciler.sync()?;

        assert_eq!(dataplane.members("mesh4-s1"), Some(vec!["10.0.0.1".to_string()]));
        assert_eq!(dataplane.members("mesh6-s1"), Some(vec!["fd00::1".to_string()]));
        assert_eq!(
            dataplane.parameters("mesh6-s1"),
            Some(("hash:ip".to_string(), "inet6".to_string()))
        );
        Ok(())
    }

    #[test]
    fn test_member_change_is_incremental() -> Result<()> {
        let dataplane = FakeDataplane::new();
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let mut reconciler = reconciler(&dataplane, &file);
        reconciler.sync()?;
        dataplane.clear_invocations();

        write_state(
            &file,
            r#"{ "sets": [
                { "id": "s1", "type": "hash:ip", "maxSize": 100, "members": ["10.0.0.2", "fd00::1"] }
            ] }"#,
        );
        reconciler.sync()?;

        assert_eq!(dataplane.invocations(), vec!["restore"]);
        assert_eq!(
            dataplane.last_stdin().as_deref(),
            Some("del mesh4-s1 10.0.0.1\nadd mesh4-s1 10.0.0.2\nCOMMIT\n")
        );
        assert_eq!(dataplane.members("mesh4-s1"), Some(vec!["10.0.0.2".to_string()]));
        Ok(())
    }

    #[test]
    fn test_unchanged_state_is_noop() -> Result<()> {
        let dataplane = FakeDataplane::new();
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let mut reconciler = reconciler(&dataplane, &file);
        reconciler.sync()?;
        dataplane.clear_invocations();

        reconciler.sync()?;
        assert!(dataplane.invocations().is_empty());
        Ok(())
    }

    #[test]
    fn test_removed_set_is_destroyed() -> Result<()> {
        let dataplane = FakeDataplane::new();
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let mut reconciler = reconciler(&dataplane, &file);
        reconciler.sync()?;

        write_state(&file, r#"{ "sets": [] }"#);
        reconciler.sync()?;

        assert!(dataplane.set_names().is_empty());
        Ok(())
    }

    #[test]
    fn test_unreadable_state_keeps_sets_and_skips_cleanup() {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-live", "hash:ip", ["10.0.0.1"]);
        let file = NamedTempFile::new().unwrap();
        write_state(&file, "{ not json");
        let mut reconciler = reconciler(&dataplane, &file);
        dataplane.clear_invocations();

        let err = reconciler.sync().unwrap_err();
        assert!(matches!(err, Error::ParseState { .. }));
        assert!(!err.is_unrecoverable());
        reconciler.cleanup();

        assert!(dataplane.invocations().is_empty());
        assert!(dataplane.has_set("mesh4-live"));
    }

    #[test]
    fn test_cleanup_keeps_desired_sets() -> Result<()> {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-s1", "hash:ip", ["10.0.0.1"]);
        dataplane.insert_set("mesh4-stale", "hash:ip", ["10.0.0.9"]);
        dataplane.insert_set("mesh6-stale", "hash:ip", ["fd00::9"]);
        dataplane.insert_set("KUBE-NODE-PORT", "hash:ip", [] as [&str; 0]);
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let mut reconciler = reconciler(&dataplane, &file);

        // staged only: nothing is written, but the sets are expected
        reconciler.stage()?;
        reconciler.cleanup();

        assert_eq!(dataplane.set_names(), vec!["KUBE-NODE-PORT", "mesh4-s1"]);
        assert_eq!(dataplane.members("mesh4-s1"), Some(vec!["10.0.0.1".to_string()]));
        Ok(())
    }

    #[tokio::test]
    async fn test_run_until_cancelled() -> Result<()> {
        let dataplane = FakeDataplane::new();
        dataplane.insert_set("mesh4-stale", "hash:ip", [] as [&str; 0]);
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let reconciler = reconciler(&dataplane, &file);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(run(
            reconciler,
            Duration::from_millis(10),
            Duration::from_millis(10),
            cancel.child_token(),
        ));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        handle.await??;

        assert_eq!(dataplane.set_names(), vec!["mesh4-s1", "mesh6-s1"]);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_stops_on_unrecoverable() {
        let dataplane = FakeDataplane::new();
        let file = NamedTempFile::new().unwrap();
        write_state(&file, S1);
        let reconciler = reconciler(&dataplane, &file);
        dataplane.fail_next_restores(100);

        let result = run(
            reconciler,
            Duration::from_millis(10),
            Duration::from_millis(10),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err_and(|e| e.is_unrecoverable()));
    }
}
