//! External process control
//!
//! The proxy and the resolver run under their own process groups so the
//! owner-match rules can exempt their traffic. This module spawns them with
//! the right primary gid, finds them again by name, and stops them:
//! SIGTERM first, then SIGKILL for anything still alive once the
//! [`Backoff`] schedule runs out.
//!
//! [`SystemProcesses`] talks to the real host through `libc` and `/proc`;
//! [`MemoryProcesses`] simulates a process table for `--dry-run` and tests.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::error::ProcessError;

/// Kernel limit on `/proc/<pid>/comm` (TASK_COMM_LEN - 1)
const COMM_LEN: usize = 15;

/// Signals the engine sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// SIGTERM
    Terminate,
    /// SIGKILL
    Kill,
}

/// A program to launch in the background
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Executable
    pub program: String,
    /// Arguments
    pub args: Vec<String>,
    /// Primary group to run under
    pub group: Option<String>,
    /// File receiving stdout and stderr
    pub log_file: Option<PathBuf>,
}

/// Process supervision primitives
pub trait ProcessControl {
    /// Numeric gid of a group name (numeric names are taken literally)
    fn group_id(&self, name: &str) -> Option<u32>;

    /// Launch a detached background process, returning its pid.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the group is unknown or the launch fails.
    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, ProcessError>;

    /// Run a shell command to completion under `group`.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError` if the command cannot run or exits non-zero.
    fn run_shell(&self, command: &str, group: Option<&str>) -> Result<(), ProcessError>;

    /// Whether a pid refers to a running (non-zombie) process
    fn is_alive(&self, pid: u32) -> bool;

    /// Send a signal. Signalling an exited process succeeds.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Signal` for permission and similar failures.
    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError>;

    /// Pids of running processes whose command name is `name`
    fn pids_by_name(&self, name: &str) -> Vec<u32>;
}

/// Outcome of [`terminate`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Termination {
    /// Processes that were running and got SIGTERM
    pub signalled: usize,
    /// Processes that needed SIGKILL
    pub killed: usize,
}

/// Stop `pids` gracefully, escalating to SIGKILL after the schedule.
/// Pids that are already gone are ignored.
pub fn terminate(procs: &dyn ProcessControl, pids: &[u32], backoff: &Backoff) -> Termination {
    let targets: Vec<u32> = pids
        .iter()
        .copied()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|&pid| procs.is_alive(pid))
        .collect();

    let mut outcome = Termination::default();
    if targets.is_empty() {
        return outcome;
    }

    for &pid in &targets {
        match procs.signal(pid, Signal::Terminate) {
            Ok(()) => outcome.signalled += 1,
            Err(e) => warn!("{}", e),
        }
    }

    let exited = backoff.wait_until(|| targets.iter().all(|&pid| !procs.is_alive(pid)));
    if !exited {
        for &pid in &targets {
            if procs.is_alive(pid) {
                warn!("pid {} ignored SIGTERM, killing", pid);
                match procs.signal(pid, Signal::Kill) {
                    Ok(()) => outcome.killed += 1,
                    Err(e) => warn!("{}", e),
                }
            }
        }
    }
    outcome
}

/// Resolve a group name against `/etc/group` style contents.
#[must_use]
pub fn lookup_gid(group_file: &str, name: &str) -> Option<u32> {
    if let Ok(gid) = name.parse::<u32>() {
        return Some(gid);
    }
    group_file.lines().find_map(|line| {
        let mut fields = line.split(':');
        let group = fields.next()?;
        let _password = fields.next()?;
        let gid = fields.next()?;
        (group == name).then(|| gid.parse().ok()).flatten()
    })
}

/// Name the kernel reports in `/proc/<pid>/comm` for an executable
fn comm_name(program: &str) -> String {
    let base = Path::new(program)
        .file_name()
        .map_or_else(|| program.to_string(), |n| n.to_string_lossy().into_owned());
    base.chars().take(COMM_LEN).collect()
}

/// Host processes via `libc` and `/proc`
#[derive(Debug, Clone)]
pub struct SystemProcesses {
    group_file: PathBuf,
    proc_root: PathBuf,
}

impl Default for SystemProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemProcesses {
    /// Use `/etc/group` and `/proc`
    #[must_use]
    pub fn new() -> Self {
        Self {
            group_file: PathBuf::from("/etc/group"),
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn gid_for(&self, group: Option<&str>) -> Result<Option<u32>, ProcessError> {
        match group {
            Some(name) => self
                .group_id(name)
                .map(Some)
                .ok_or_else(|| ProcessError::UnknownGroup(name.to_string())),
            None => Ok(None),
        }
    }
}

impl ProcessControl for SystemProcesses {
    fn group_id(&self, name: &str) -> Option<u32> {
        let contents = fs::read_to_string(&self.group_file).unwrap_or_default();
        lookup_gid(&contents, name)
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, ProcessError> {
        let gid = self.gid_for(spec.group.as_deref())?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args).stdin(Stdio::null()).process_group(0);
        if let Some(gid) = gid {
            cmd.gid(gid);
        }
        match &spec.log_file {
            Some(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                cmd.stdout(file.try_clone()?).stderr(file);
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::spawn(&spec.program, e.to_string()))?;
        info!("Started {} (pid {})", spec.program, child.id());
        Ok(child.id())
    }

    fn run_shell(&self, command: &str, group: Option<&str>) -> Result<(), ProcessError> {
        let gid = self.gid_for(group)?;
        debug!("sh -c {:?} (group {:?})", command, group);

        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).stdin(Stdio::null());
        if let Some(gid) = gid {
            cmd.gid(gid);
        }
        let status = cmd.status().map_err(|e| ProcessError::spawn("sh", e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::CommandFailed {
                command: command.to_string(),
                status: status.to_string(),
            })
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        let Ok(stat) = fs::read_to_string(self.proc_root.join(pid.to_string()).join("stat")) else {
            return false;
        };
        // state is the first field after the parenthesised command name
        let state = stat
            .rfind(')')
            .and_then(|idx| stat[idx + 1..].split_whitespace().next());
        !matches!(state, Some("Z" | "X") | None)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let raw = i32::try_from(pid).map_err(|_| ProcessError::Signal {
            pid,
            reason: "pid out of range".into(),
        })?;
        let signo = match signal {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) has no memory-safety preconditions
        let rc = unsafe { libc::kill(raw, signo) };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(())
        } else {
            Err(ProcessError::Signal {
                pid,
                reason: err.to_string(),
            })
        }
    }

    fn pids_by_name(&self, name: &str) -> Vec<u32> {
        let wanted = comm_name(name);
        let Ok(entries) = fs::read_dir(&self.proc_root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
            .filter(|pid| {
                fs::read_to_string(self.proc_root.join(pid.to_string()).join("comm"))
                    .map_or(false, |comm| comm.trim_end() == wanted)
            })
            .filter(|&pid| self.is_alive(pid))
            .collect();
        pids.sort_unstable();
        pids
    }
}

#[derive(Debug, Clone)]
struct SimProcess {
    name: String,
    group: Option<String>,
    alive: bool,
    ignores_term: bool,
}

#[derive(Debug, Default)]
struct SimState {
    next_pid: u32,
    table: BTreeMap<u32, SimProcess>,
    spawns: Vec<SpawnSpec>,
    shell: Vec<String>,
    known_groups: Option<BTreeSet<String>>,
    gids: BTreeMap<String, u32>,
    fail_spawns: bool,
    fail_shell: bool,
}

/// Simulated process table
#[derive(Debug)]
pub struct MemoryProcesses {
    state: Mutex<SimState>,
}

impl Default for MemoryProcesses {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProcesses {
    /// Empty process table; every group name resolves
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState {
                next_pid: 1000,
                ..SimState::default()
            }),
        }
    }

    /// Only these group names resolve from now on
    pub fn restrict_groups(&self, groups: &[&str]) {
        self.state.lock().known_groups = Some(groups.iter().map(|g| (*g).to_string()).collect());
    }

    /// Pin the gid a group name resolves to
    pub fn set_group_id(&self, name: &str, gid: u32) {
        self.state.lock().gids.insert(name.to_string(), gid);
    }

    /// Make spawns fail
    pub fn fail_spawns(&self, fail: bool) {
        self.state.lock().fail_spawns = fail;
    }

    /// Make shell commands fail
    pub fn fail_shell(&self, fail: bool) {
        self.state.lock().fail_shell = fail;
    }

    /// Add a running process, as if started outside the engine
    pub fn add_process(&self, name: &str, group: Option<&str>) -> u32 {
        let mut state = self.state.lock();
        state.next_pid += 1;
        let pid = state.next_pid;
        state.table.insert(
            pid,
            SimProcess {
                name: comm_name(name),
                group: group.map(str::to_string),
                alive: true,
                ignores_term: false,
            },
        );
        pid
    }

    /// Process exits on its own
    pub fn crash(&self, pid: u32) {
        if let Some(p) = self.state.lock().table.get_mut(&pid) {
            p.alive = false;
        }
    }

    /// Process survives SIGTERM
    pub fn ignore_term(&self, pid: u32) {
        if let Some(p) = self.state.lock().table.get_mut(&pid) {
            p.ignores_term = true;
        }
    }

    /// Every spawn request so far
    #[must_use]
    pub fn spawns(&self) -> Vec<SpawnSpec> {
        self.state.lock().spawns.clone()
    }

    /// Every shell command run so far
    #[must_use]
    pub fn shell_commands(&self) -> Vec<String> {
        self.state.lock().shell.clone()
    }

    /// Group of a pid
    #[must_use]
    pub fn group_of(&self, pid: u32) -> Option<String> {
        self.state.lock().table.get(&pid).and_then(|p| p.group.clone())
    }

    /// Pids still running
    #[must_use]
    pub fn running(&self) -> Vec<u32> {
        self.state
            .lock()
            .table
            .iter()
            .filter(|(_, p)| p.alive)
            .map(|(pid, _)| *pid)
            .collect()
    }
}

impl ProcessControl for MemoryProcesses {
    fn group_id(&self, name: &str) -> Option<u32> {
        let state = self.state.lock();
        match &state.known_groups {
            Some(known) if !known.contains(name) => None,
            _ => state
                .gids
                .get(name)
                .copied()
                .or_else(|| Some(name.bytes().fold(2000u32, |acc, b| acc.wrapping_add(u32::from(b))))),
        }
    }

    fn spawn(&self, spec: &SpawnSpec) -> Result<u32, ProcessError> {
        if let Some(group) = &spec.group {
            if self.group_id(group).is_none() {
                return Err(ProcessError::UnknownGroup(group.clone()));
            }
        }
        {
            let mut state = self.state.lock();
            state.spawns.push(spec.clone());
            if state.fail_spawns {
                return Err(ProcessError::spawn(&spec.program, "No such file or directory"));
            }
        }
        let pid = self.add_process(&spec.program, spec.group.as_deref());
        info!("[dry-run] started {} {} (pid {})", spec.program, spec.args.join(" "), pid);
        Ok(pid)
    }

    fn run_shell(&self, command: &str, group: Option<&str>) -> Result<(), ProcessError> {
        let mut state = self.state.lock();
        state.shell.push(command.to_string());
        info!("[dry-run] sh -c {:?} (group {:?})", command, group);
        if state.fail_shell {
            return Err(ProcessError::CommandFailed {
                command: command.to_string(),
                status: "exit status: 1".into(),
            });
        }
        Ok(())
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.state.lock().table.get(&pid).map_or(false, |p| p.alive)
    }

    fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        if let Some(p) = self.state.lock().table.get_mut(&pid) {
            match signal {
                Signal::Terminate if p.ignores_term => {}
                _ => p.alive = false,
            }
        }
        Ok(())
    }

    fn pids_by_name(&self, name: &str) -> Vec<u32> {
        let wanted = comm_name(name);
        self.state
            .lock()
            .table
            .iter()
            .filter(|(_, p)| p.alive && p.name == wanted)
            .map(|(pid, _)| *pid)
            .collect()
    }
}
