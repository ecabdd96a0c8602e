//! In-memory stand-in for the ipset tool.
//!
//! Interprets `list -n`, `destroy <name>` and `restore` scripts the way ipset
//! does: restore applies lines in order and stops at the first failing line,
//! leaving everything before it applied. Every invocation is recorded.
//! Like ipset, `hash:ip` sets only take plain addresses and adds beyond
//! `maxelem` fail.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::command::{Cmd, CommandFactory};
use crate::{Error, Result};

#[derive(Clone, Debug)]
struct FakeSet {
    set_type: String,
    family: String,
    max_elements: usize,
    members: BTreeSet<String>,
}

const DEFAULT_MAX_ELEMENTS: usize = 65536;

#[derive(Default)]
struct State {
    sets: BTreeMap<String, FakeSet>,
    invocations: Vec<String>,
    stdins: Vec<String>,
    failing_restores: u32,
    failing_destroys: u32,
    failing_lists: u32,
}

#[derive(Clone, Default)]
pub struct FakeDataplane {
    state: Arc<Mutex<State>>,
}

impl FakeDataplane {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates a set directly, bypassing the recorded command log. The family
    /// is inferred from the members and defaults to inet; `maxelem` is
    /// ipset's default.
    pub fn insert_set<I>(&self, name: &str, set_type: &str, members: I)
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        let members: BTreeSet<String> =
            members.into_iter().map(|m| m.as_ref().to_owned()).collect();
        let family = if members.iter().any(|m| m.contains(':')) {
            "inet6"
        } else {
            "inet"
        };
        self.lock().sets.insert(
            name.to_owned(),
            FakeSet {
                set_type: set_type.to_owned(),
                family: family.to_owned(),
                max_elements: DEFAULT_MAX_ELEMENTS,
                members,
            },
        );
    }

    pub fn remove_set(&self, name: &str) {
        self.lock().sets.remove(name);
    }

    pub fn has_set(&self, name: &str) -> bool {
        self.lock().sets.contains_key(name)
    }

    pub fn set_names(&self) -> Vec<String> {
        self.lock().sets.keys().cloned().collect()
    }

    /// Sorted members of the named set.
    pub fn members(&self, name: &str) -> Option<Vec<String>> {
        self.lock()
            .sets
            .get(name)
            .map(|set| set.members.iter().cloned().collect())
    }

    /// `(type, family)` of the named set.
    pub fn parameters(&self, name: &str) -> Option<(String, String)> {
        self.lock()
            .sets
            .get(name)
            .map(|set| (set.set_type.clone(), set.family.clone()))
    }

    /// Every invocation so far, as the space-joined argument list.
    pub fn invocations(&self) -> Vec<String> {
        self.lock().invocations.clone()
    }

    pub fn last_stdin(&self) -> Option<String> {
        self.lock().stdins.last().cloned()
    }

    pub fn clear_invocations(&self) {
        let mut state = self.lock();
        state.invocations.clear();
        state.stdins.clear();
    }

    pub fn fail_next_restores(&self, count: u32) {
        self.lock().failing_restores = count;
    }

    pub fn fail_next_destroys(&self, count: u32) {
        self.lock().failing_destroys = count;
    }

    pub fn fail_next_lists(&self, count: u32) {
        self.lock().failing_lists = count;
    }
}

impl CommandFactory for FakeDataplane {
    type Command = FakeCommand;

    fn new_command(&self, args: &[&str]) -> FakeCommand {
        FakeCommand {
            dataplane: self.clone(),
            args: args.iter().map(|a| a.to_string()).collect(),
            stdin: None,
        }
    }
}

pub struct FakeCommand {
    dataplane: FakeDataplane,
    args: Vec<String>,
    stdin: Option<String>,
}

impl FakeCommand {
    fn execute(self) -> Result<Vec<u8>> {
        let command = self.args.join(" ");
        let mut state = self.dataplane.lock();
        state.invocations.push(command.clone());
        if let Some(stdin) = &self.stdin {
            state.stdins.push(stdin.clone());
        }
        let args: Vec<&str> = self.args.iter().map(String::as_str).collect();
        let result = match args.as_slice() {
            ["list", "-n"] => {
                if take_failure(&mut state.failing_lists) {
                    Err("Kernel error received: Operation not permitted".to_owned())
                } else {
                    let mut out = String::new();
                    for name in state.sets.keys() {
                        out.push_str(name);
                        out.push('\n');
                    }
                    Ok(out)
                }
            }
            ["destroy", name] => {
                if take_failure(&mut state.failing_destroys) {
                    Err("Set cannot be destroyed: it is in use by a kernel component".to_owned())
                } else {
                    destroy(&mut state, name).map(|_| String::new())
                }
            }
            ["restore"] => {
                if take_failure(&mut state.failing_restores) {
                    Err("Segmentation fault".to_owned())
                } else {
                    let script = self.stdin.clone().unwrap_or_default();
                    restore(&mut state, &script).map(|_| String::new())
                }
            }
            _ => Err(format!("unsupported invocation: {command}")),
        };
        result.map(String::into_bytes).map_err(|output| Error::CommandFailed {
            command: format!("ipset {command}"),
            status: "exit status: 1".to_owned(),
            output,
        })
    }
}

impl Cmd for FakeCommand {
    fn set_stdin(&mut self, input: Vec<u8>) {
        self.stdin = Some(String::from_utf8_lossy(&input).into_owned());
    }

    fn output(self) -> Result<Vec<u8>> {
        self.execute()
    }

    fn combined_output(self) -> Result<Vec<u8>> {
        self.execute()
    }
}

fn take_failure(counter: &mut u32) -> bool {
    if *counter > 0 {
        *counter -= 1;
        true
    } else {
        false
    }
}

fn destroy(state: &mut State, name: &str) -> Result<(), String> {
    match state.sets.remove(name) {
        Some(_) => Ok(()),
        None => Err(format!("The set with the given name does not exist: {name}")),
    }
}

fn restore(state: &mut State, script: &str) -> Result<(), String> {
    for (lineno, line) in script.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let result = match fields.as_slice() {
            [] | ["COMMIT"] => Ok(()),
            ["create", name, set_type, "family", family, "maxelem", max_elements] => {
                match max_elements.parse() {
                    _ if state.sets.contains_key(*name) => Err(
                        "Set cannot be created: set with the same name already exists".to_owned(),
                    ),
                    Err(_) => Err(format!("Syntax error: invalid maxelem {max_elements}")),
                    Ok(max_elements) => {
                        state.sets.insert(
                            name.to_string(),
                            FakeSet {
                                set_type: set_type.to_string(),
                                family: family.to_string(),
                                max_elements,
                                members: BTreeSet::new(),
                            },
                        );
                        Ok(())
                    }
                }
            }
            ["destroy", name] => destroy(state, name),
            ["add", name, member] => match state.sets.get_mut(*name) {
                None => Err("The set with the given name does not exist".to_owned()),
                Some(set) => add(set, member),
            },
            ["del", name, member] => match state.sets.get_mut(*name) {
                None => Err("The set with the given name does not exist".to_owned()),
                Some(set) => {
                    if set.members.remove(*member) {
                        Ok(())
                    } else {
                        Err("Element cannot be deleted from the set: it's not added".to_owned())
                    }
                }
            },
            ["swap", a, b] => swap(state, a, b),
            _ => Err(format!("Syntax error: {line}")),
        };
        if let Err(e) = result {
            return Err(format!("Error in line {}: {e}", lineno + 1));
        }
    }
    Ok(())
}

fn add(set: &mut FakeSet, member: &str) -> Result<(), String> {
    if set.set_type == "hash:ip" && member.contains('/') {
        return Err(format!("Syntax error: plain IP address must be supplied: {member}"));
    }
    if set.members.contains(member) {
        return Err("Element cannot be added to the set: it's already added".to_owned());
    }
    if set.members.len() >= set.max_elements {
        return Err("Hash is full, cannot add more elements".to_owned());
    }
    set.members.insert(member.to_owned());
    Ok(())
}

fn swap(state: &mut State, a: &str, b: &str) -> Result<(), String> {
    let (Some(first), Some(second)) = (state.sets.get(a), state.sets.get(b)) else {
        return Err("The set with the given name does not exist".to_owned());
    };
    if first.set_type != second.set_type || first.family != second.family {
        return Err("The sets cannot be swapped: their type does not match".to_owned());
    }
    let first = first.clone();
    let second = second.clone();
    state.sets.insert(a.to_owned(), second);
    state.sets.insert(b.to_owned(), first);
    Ok(())
}
