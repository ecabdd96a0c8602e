use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use mesh_cni_ipset::{IpFamily, IpVersionConfig};

use crate::Result;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Keep the dataplane ip sets in sync with the desired state file
    Run(RunArgs),
    /// Reconcile once, sweep left-over sets and exit
    Apply(IpsetArgs),
    /// Sweep sets that are not in the desired state file and exit
    Cleanup(IpsetArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[command(flatten)]
    pub ipset: IpsetArgs,

    /// Seconds between reloads of the desired state file
    #[arg(long, env = "IPSET_RESYNC_INTERVAL", default_value_t = 10)]
    pub resync_interval: u64,

    /// Seconds between sweeps for left-over ip sets
    #[arg(long, env = "IPSET_CLEANUP_INTERVAL", default_value_t = 300)]
    pub cleanup_interval: u64,
}

impl RunArgs {
    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval.max(1))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval.max(1))
    }
}

#[derive(Args, Debug, Clone)]
pub struct IpsetArgs {
    /// Path to the ipset binary
    #[arg(long, env = "IPSET_PATH", default_value = "ipset")]
    pub ipset_path: PathBuf,

    /// Prefix for the names of ip sets created by this agent
    #[arg(long, env = "IPSET_NAME_PREFIX", default_value = "mesh")]
    pub name_prefix: String,

    /// Prefixes used by earlier releases; matching sets are still ours to clean up
    #[arg(long = "historic-prefix", default_value = "mesh")]
    pub historic_prefixes: Vec<String>,

    /// Unversioned set names that are ours to clean up
    #[arg(long = "extra-unversioned-set")]
    pub extra_unversioned_sets: Vec<String>,

    /// Also manage IPv6 ip sets
    #[arg(long, env = "IPSET_IPV6")]
    pub ipv6: bool,

    /// Desired state file
    #[arg(
        long,
        env = "IPSET_STATE_FILE",
        default_value = "/etc/mesh-cni/ipsets.json"
    )]
    pub state_file: PathBuf,
}

impl IpsetArgs {
    pub fn families(&self) -> Vec<IpFamily> {
        if self.ipv6 {
            vec![IpFamily::V4, IpFamily::V6]
        } else {
            vec![IpFamily::V4]
        }
    }

    pub fn version_config(&self, family: IpFamily) -> Result<IpVersionConfig> {
        Ok(IpVersionConfig::new(
            family,
            &self.name_prefix,
            &self.historic_prefixes,
            &self.extra_unversioned_sets,
        )?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["mesh-cni-ipset-agent", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.ipset.ipset_path, PathBuf::from("ipset"));
        assert_eq!(args.ipset.historic_prefixes, vec!["mesh".to_string()]);
        assert!(args.ipset.extra_unversioned_sets.is_empty());
        assert_eq!(args.resync_interval(), Duration::from_secs(10));
        assert_eq!(args.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(args.ipset.families(), vec![IpFamily::V4]);
    }

    #[test]
    fn test_repeated_prefixes() -> Result<()> {
        let cli = Cli::parse_from([
            "mesh-cni-ipset-agent",
            "cleanup",
            "--ipv6",
            "--name-prefix",
            "mesh",
            "--historic-prefix",
            "mesh",
            "--historic-prefix",
            "cali",
            "--extra-unversioned-set",
            "mesh-all-hosts",
        ]);
        let Commands::Cleanup(args) = cli.command else {
            panic!("expected cleanup command");
        };
        assert_eq!(args.families(), vec![IpFamily::V4, IpFamily::V6]);
        let v6 = args.version_config(IpFamily::V6)?;
        assert!(v6.owns_set_name("cali6-abc"));
        assert!(v6.owns_set_name("mesh-all-hosts"));
        assert!(!v6.owns_set_name("cali4-abc"));
        Ok(())
    }
}
