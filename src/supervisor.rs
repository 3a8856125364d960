//! The runtime supervisor: concurrent session-leader process trees.
//!
//! Every task runs as the session leader of its own process group so a
//! signal can be delivered to the whole tree with `killpg`. Completions are
//! drained through a single channel; signal reception is centralised in one
//! listener thread that fans out to the live task set.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, LazyLock};
use std::time::SystemTime;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use regex::Regex;

use crate::error::SupervisorError;
use crate::exec::exit_code;
use crate::logging::Log;

/// Init script filenames: `<app-index>_<name>.sh` for mains and
/// `<app-index>_<sidecar-index>_<name>.sh` for sidecars.
static INIT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a literal, verified by tests
    let pattern = Regex::new(r"^(\d+_\d+|\d+)_(.*)\.sh$").unwrap();
    pattern
});

/// One init script discovered in the droplet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitScript {
    /// Absolute path of the script.
    pub path: PathBuf,
    /// File stem, used as the task name (e.g. `0_web`).
    pub stem: String,
    /// Application name extracted from the filename.
    pub app: String,
}

/// Scan an init directory for supervisable scripts, sorted by filename.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn scan_init_scripts(initd: &Path) -> Result<Vec<InitScript>, SupervisorError> {
    let mut scripts = Vec::new();
    let entries = std::fs::read_dir(initd).map_err(|source| {
        SupervisorError::InitDirUnreadable {
            path: initd.to_path_buf(),
            source,
        }
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| SupervisorError::InitDirUnreadable {
            path: initd.to_path_buf(),
            source,
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(captures) = INIT_NAME.captures(&name) {
            let app = captures.get(2).map_or("", |m| m.as_str()).to_string();
            let stem = name.trim_end_matches(".sh").to_string();
            scripts.push(InitScript {
                path: entry.path(),
                stem,
                app,
            });
        }
    }
    scripts.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(scripts)
}

/// A planned task: command, environment and name.
#[derive(Debug, Clone)]
struct TaskSpec {
    name: String,
    argv: Vec<String>,
    env: BTreeMap<String, String>,
}

/// Terminal record of one supervised task.
#[derive(Debug, Clone)]
pub struct TaskReport {
    /// Task name (init script stem).
    pub name: String,
    /// Argument vector that was executed.
    pub argv: Vec<String>,
    /// Process id (equal to the process group id).
    pub pid: i32,
    /// Wall-clock start time.
    pub start: SystemTime,
    /// Wall-clock end time.
    pub end: SystemTime,
    /// Exit code; signal deaths are mapped to `128 + signo`.
    pub code: i32,
}

/// The resolved uid and gid tasks are switched to before exec.
#[derive(Debug, Clone, Copy)]
struct RunUser {
    uid: nix::unistd::Uid,
    gid: nix::unistd::Gid,
}

/// Shared view of the live task set, used by signal listeners to fan a
/// signal out to every running process group.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    live: Arc<Mutex<BTreeMap<i32, i32>>>,
    log: Arc<dyn Log>,
}

impl SupervisorHandle {
    /// Deliver `signal` to the process group of every live task.
    ///
    /// Delivery is best effort: a group that exited in the meantime is
    /// skipped.
    pub fn propagate(&self, signal: Signal) {
        self.log
            .info(&format!("Propagating signal '{signal}' to all children ..."));
        let live = self
            .live
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for pgid in live.values() {
            self.log
                .debug(&format!("Sending signal {signal} to process group {pgid}"));
            if let Err(e) = killpg(Pid::from_raw(*pgid), signal) {
                self.log
                    .debug(&format!("Process group {pgid} not signalled: {e}"));
            }
        }
    }
}

/// Launches every planned task in its own session and process group,
/// drains completions and computes the aggregate exit code.
#[derive(Debug)]
pub struct Supervisor {
    workdir: PathBuf,
    env: BTreeMap<String, String>,
    user: Option<RunUser>,
    tasks: Vec<TaskSpec>,
    live: Arc<Mutex<BTreeMap<i32, i32>>>,
    log: Arc<dyn Log>,
}

impl Supervisor {
    /// Create a supervisor rooted at `workdir` with a base environment.
    ///
    /// A non-empty `user` is resolved to its uid and gid; tasks switch to
    /// that identity before exec.
    ///
    /// # Errors
    ///
    /// Returns an error if the user cannot be found.
    pub fn new(
        workdir: &Path,
        env: BTreeMap<String, String>,
        user: &str,
        log: Arc<dyn Log>,
    ) -> Result<Self, SupervisorError> {
        let user = if user.is_empty() {
            None
        } else {
            let entry = nix::unistd::User::from_name(user)
                .ok()
                .flatten()
                .ok_or_else(|| SupervisorError::UserNotFound(user.to_string()))?;
            log.debug(&format!("Setting running user: '{user}'"));
            Some(RunUser {
                uid: entry.uid,
                gid: entry.gid,
            })
        };
        Ok(Self {
            workdir: workdir.to_path_buf(),
            env,
            user,
            tasks: Vec::new(),
            live: Arc::new(Mutex::new(BTreeMap::new())),
            log,
        })
    }

    /// Plan a task. Nothing starts until [`Supervisor::run`].
    pub fn add_task(&mut self, name: &str, argv: Vec<String>, env: BTreeMap<String, String>) {
        self.tasks.push(TaskSpec {
            name: name.to_string(),
            argv,
            env,
        });
    }

    /// Number of planned tasks.
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// A handle for delivering signals to the live task set.
    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            live: Arc::clone(&self.live),
            log: Arc::clone(&self.log),
        }
    }

    /// Launch every planned task and wait for all of them.
    ///
    /// With `exit_if_any`, the first completion triggers `SIGKILL` to every
    /// still-live process group; the supervisor then waits for the
    /// remaining completions. Reports are returned in completion order.
    pub fn run(&mut self, exit_if_any: bool) -> Vec<TaskReport> {
        let specs = std::mem::take(&mut self.tasks);
        let total = specs.len();
        // Snapshot the process environment once for the whole batch.
        let environ: BTreeMap<String, String> = std::env::vars().collect();
        let (sender, receiver) = mpsc::channel::<TaskReport>();

        let mut workers = Vec::new();
        for spec in specs {
            let mut env = environ.clone();
            env.extend(self.env.clone());
            env.extend(spec.env.clone());
            let workdir = self.workdir.clone();
            let live = Arc::clone(&self.live);
            let log = Arc::clone(&self.log);
            let sender = sender.clone();
            let user = self.user;
            workers.push(std::thread::spawn(move || {
                run_task(&spec, env, &workdir, user, &live, &log, &sender);
            }));
        }
        drop(sender);

        let mut reports = Vec::new();
        let mut killed = false;
        while reports.len() < total {
            let Ok(report) = receiver.recv() else { break };
            self.log.debug(&format!(
                "Task {} running pid {} finished with returncode {}",
                report.name, report.pid, report.code
            ));
            reports.push(report);
            if exit_if_any && !killed {
                killed = true;
                self.handle().propagate(Signal::SIGKILL);
            }
        }
        for worker in workers {
            worker.join().ok();
        }
        reports
    }
}

/// Aggregate exit code: the arithmetic sum of the per-task codes. Zero
/// means every task succeeded.
#[must_use]
pub fn aggregate_exit(reports: &[TaskReport]) -> i32 {
    reports.iter().map(|r| r.code).sum()
}

/// The signals the run entry point forwards to its children.
#[must_use]
pub fn forwarded_signals() -> nix::sys::signal::SigSet {
    let mut set = nix::sys::signal::SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGUSR1);
    set
}

/// Block the forwarded signals in the calling thread (and every thread it
/// spawns afterwards), so they are received only by the listener thread's
/// `sigwait` and never interrupt a slow syscall.
///
/// # Errors
///
/// Returns an error if the signal mask cannot be changed.
pub fn block_forwarded_signals() -> nix::Result<()> {
    nix::sys::signal::pthread_sigmask(
        nix::sys::signal::SigmaskHow::SIG_BLOCK,
        Some(&forwarded_signals()),
        None,
    )
}

/// Spawn the central signal listener: waits for a forwarded signal and
/// fans it out to the live task set. Runs for the lifetime of the process.
pub fn spawn_signal_forwarder(handle: SupervisorHandle) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let set = forwarded_signals();
        loop {
            match set.wait() {
                Ok(signal) => handle.propagate(signal),
                Err(_) => break,
            }
        }
    })
}

/// Worker body: spawn the task as a session leader, register it as live,
/// wait for it and send the terminal report.
fn run_task(
    spec: &TaskSpec,
    env: BTreeMap<String, String>,
    workdir: &Path,
    user: Option<RunUser>,
    live: &Arc<Mutex<BTreeMap<i32, i32>>>,
    log: &Arc<dyn Log>,
    sender: &mpsc::Sender<TaskReport>,
) {
    let start = SystemTime::now();
    let Some((program, args)) = spec.argv.split_first() else {
        sender
            .send(TaskReport {
                name: spec.name.clone(),
                argv: spec.argv.clone(),
                pid: -1,
                start,
                end: SystemTime::now(),
                code: 127,
            })
            .ok();
        return;
    };
    let mut command = std::process::Command::new(program);
    command
        .args(args)
        .current_dir(workdir)
        .env_clear()
        .envs(&env);
    set_pre_exec(&mut command, user);

    let spawned = command.spawn();
    let mut child = match spawned {
        Ok(child) => child,
        Err(source) => {
            log.error(&format!("Cannot start task '{}': {source}", spec.name));
            sender
                .send(TaskReport {
                    name: spec.name.clone(),
                    argv: spec.argv.clone(),
                    pid: -1,
                    start,
                    end: SystemTime::now(),
                    code: 127,
                })
                .ok();
            return;
        }
    };

    // Register the task as live immediately after spawn: the child has
    // already exec'd (spawn reports exec failures), so its pgid equals its
    // pid and signal fan-out cannot miss it.
    let pid = i32::try_from(child.id()).unwrap_or(-1);
    log.debug(&format!(
        "Running task '{}' controlling pid {pid}: {:?}",
        spec.name, spec.argv
    ));
    if let Ok(mut guard) = live.lock() {
        guard.insert(pid, pid);
    }

    let code = child.wait().map_or(1, exit_code);
    let end = SystemTime::now();
    if let Ok(mut guard) = live.lock() {
        guard.remove(&pid);
    }
    sender
        .send(TaskReport {
            name: spec.name.clone(),
            argv: spec.argv.clone(),
            pid,
            start,
            end,
            code,
        })
        .ok();
}

/// Arrange for the child to become a session leader (and optionally switch
/// identity) between fork and exec.
///
/// The parent blocks the forwarded signals process-wide and that mask is
/// inherited across exec, so the child also resets its mask — otherwise a
/// forwarded `SIGTERM` would never be delivered to the task tree.
#[allow(unsafe_code)]
fn set_pre_exec(command: &mut std::process::Command, user: Option<RunUser>) {
    use std::os::unix::process::CommandExt as _;
    // SAFETY: the closure only calls async-signal-safe syscalls (setsid,
    // sigprocmask, setgid, setuid) and touches no heap state of the parent.
    unsafe {
        command.pre_exec(move || {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            nix::sys::signal::pthread_sigmask(
                nix::sys::signal::SigmaskHow::SIG_SETMASK,
                Some(&nix::sys::signal::SigSet::empty()),
                None,
            )
            .map_err(std::io::Error::from)?;
            if let Some(user) = user {
                nix::unistd::setgid(user.gid).map_err(std::io::Error::from)?;
                nix::unistd::setuid(user.uid).map_err(std::io::Error::from)?;
            }
            Ok(())
        });
    }
}
