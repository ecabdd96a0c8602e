use std::fmt;

use regex::Regex;
use tracing::debug;

use crate::Result;
use crate::set::IpSetId;

/// Longest name the kernel accepts for an ip set.
pub const MAX_IPSET_NAME_LENGTH: usize = 31;

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    fn version(&self) -> &'static str {
        match self {
            IpFamily::V4 => "4",
            IpFamily::V6 => "6",
        }
    }

    /// Family membership of a set member literal. Anything containing a colon
    /// is treated as an IPv6 literal.
    pub fn matches_member(&self, member: &str) -> bool {
        let is_v6 = member.contains(':');
        match self {
            IpFamily::V4 => !is_v6,
            IpFamily::V6 => is_v6,
        }
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpFamily::V4 => write!(f, "inet"),
            IpFamily::V6 => write!(f, "inet6"),
        }
    }
}

/// Naming scheme for the ip sets of one IP version.
///
/// For a prefix of `mesh` and IPv4 the main set for id `qMt7iLlGDhvLnCjM0l9nzxbabcd`
/// is `mesh4-qMt7iLlGDhvLnCjM0l9nzxbab` and its temp set is
/// `mesh4tqMt7iLlGDhvLnCjM0l9nzxbab`. Both prefixes have the same length so
/// truncation keeps the same amount of the id in either name.
#[derive(Clone, Debug)]
pub struct IpVersionConfig {
    family: IpFamily,
    temp_set_name_prefix: String,
    main_set_name_prefix: String,
    owned_names: Regex,
}

impl IpVersionConfig {
    pub fn new<P, U>(
        family: IpFamily,
        name_prefix: &str,
        historic_prefixes: P,
        extra_unversioned_sets: U,
    ) -> Result<Self>
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        U: IntoIterator,
        U::Item: AsRef<str>,
    {
        let version = family.version();
        let set_name_prefix = format!("{name_prefix}{version}");

        let mut alternatives: Vec<String> = historic_prefixes
            .into_iter()
            .map(|prefix| regex::escape(&format!("{}{version}", prefix.as_ref())))
            .collect();
        // the current prefix is always ours, even if the caller left it out
        alternatives.push(regex::escape(&set_name_prefix));
        alternatives.extend(
            extra_unversioned_sets
                .into_iter()
                .map(|name| regex::escape(name.as_ref())),
        );
        let pattern = format!("^({})", alternatives.join("|"));
        debug!(%pattern, %family, "calculated ip set name pattern");

        Ok(Self {
            family,
            temp_set_name_prefix: format!("{set_name_prefix}t"),
            main_set_name_prefix: format!("{set_name_prefix}-"),
            owned_names: Regex::new(&pattern)?,
        })
    }

    pub fn family(&self) -> IpFamily {
        self.family
    }

    pub fn name_for_main_set(&self, id: &IpSetId) -> String {
        combine_and_truncate(&self.main_set_name_prefix, id.as_str())
    }

    pub fn name_for_temp_set(&self, id: &IpSetId) -> String {
        combine_and_truncate(&self.temp_set_name_prefix, id.as_str())
    }

    /// True if the set name starts with one of the prefixes this component
    /// has ever used for this IP version, or is one of the extra unversioned
    /// names.
    pub fn owns_set_name(&self, name: &str) -> bool {
        self.owned_names.is_match(name)
    }
}

// ids are validated as ASCII so cutting at a byte offset is always a char boundary
fn combine_and_truncate(prefix: &str, id: &str) -> String {
    let mut name = format!("{prefix}{id}");
    name.truncate(MAX_IPSET_NAME_LENGTH);
    name
}
