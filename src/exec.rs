//! Subprocess execution with merged environment and line-streamed output.
use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use crate::logging::{Log, strip_ansi};

/// Result of a command execution.
///
/// A non-zero exit code is not an error at this layer; callers decide what
/// it means for the step they are running.
#[derive(Debug)]
pub struct ExecResult {
    /// Exit code; signal deaths are mapped to `128 + signo`.
    pub code: i32,
    /// Captured stdout lines, ANSI-stripped with trailing `\r` removed.
    pub stdout: Vec<String>,
    /// Captured stderr lines, ANSI-stripped with trailing `\r` removed.
    pub stderr: Vec<String>,
}

impl ExecResult {
    /// Whether the command exited with status 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        self.code == 0
    }
}

/// How a command is handed to the operating system.
#[derive(Debug, Clone)]
pub enum CommandLine {
    /// One string interpreted by `/bin/sh -c`.
    Shell(String),
    /// An explicit argument vector; the first element is the program.
    Argv(Vec<String>),
}

impl CommandLine {
    /// Human-readable rendering for log lines.
    #[must_use]
    pub fn display(&self) -> String {
        match self {
            Self::Shell(s) => s.clone(),
            Self::Argv(v) => v.join(" "),
        }
    }
}

/// Executes subprocesses with a fixed working directory and component
/// environment, streaming their output line by line.
///
/// The effective environment of each child is the process environment
/// overlaid with the component environment and then the per-call
/// environment, later keys winning. The environment is snapshotted at spawn
/// time so concurrent mutation cannot leak between children.
///
/// Buildpack scripts that expect a terminal are run on pipes; line
/// streaming is preserved and `TERM` can be provided through the component
/// environment.
#[derive(Debug)]
pub struct CommandRunner {
    working_path: PathBuf,
    env: BTreeMap<String, String>,
    log: Arc<dyn Log>,
}

impl CommandRunner {
    /// Create a runner rooted at `working_path` with a component environment.
    #[must_use]
    pub fn new(working_path: &Path, env: BTreeMap<String, String>, log: Arc<dyn Log>) -> Self {
        Self {
            working_path: working_path.to_path_buf(),
            env,
            log,
        }
    }

    /// Run a command in the runner's working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned or its output
    /// descriptors cannot be read. A non-zero exit code is surfaced in the
    /// result, not as an error.
    pub fn run(
        &self,
        command: &CommandLine,
        env: &BTreeMap<String, String>,
        echo: bool,
        prefix: &str,
    ) -> std::io::Result<ExecResult> {
        self.run_in(&self.working_path, command, env, echo, prefix)
    }

    /// Run a command in an explicit working directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the child cannot be spawned or its output
    /// descriptors cannot be read. A non-zero exit code is surfaced in the
    /// result, not as an error.
    pub fn run_in(
        &self,
        dir: &Path,
        command: &CommandLine,
        env: &BTreeMap<String, String>,
        echo: bool,
        prefix: &str,
    ) -> std::io::Result<ExecResult> {
        let mut cmd = match command {
            CommandLine::Shell(line) => {
                let mut c = Command::new("/bin/sh");
                c.arg("-c").arg(line);
                c
            }
            CommandLine::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argument vector")
                })?;
                let mut c = Command::new(program);
                c.args(args);
                c
            }
        };

        // Snapshot the process environment once per spawn.
        let mut environ: BTreeMap<String, String> = std::env::vars().collect();
        environ.extend(self.env.clone());
        environ.extend(env.clone());

        self.log.debug(&format!("Running: {}", command.display()));
        let mut child = cmd
            .current_dir(dir)
            .env_clear()
            .envs(&environ)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let child_stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("child stdout descriptor unavailable")
        })?;
        let child_stderr = child.stderr.take().ok_or_else(|| {
            std::io::Error::other("child stderr descriptor unavailable")
        })?;

        let (stdout, stderr) = std::thread::scope(|scope| {
            let out = scope.spawn(|| stream_lines(child_stdout, echo, prefix, false));
            let err = scope.spawn(|| stream_lines(child_stderr, echo, prefix, true));
            let stdout = out.join().map_err(|_| {
                std::io::Error::other("stdout reader thread panicked")
            })?;
            let stderr = err.join().map_err(|_| {
                std::io::Error::other("stderr reader thread panicked")
            })?;
            Ok::<_, std::io::Error>((stdout?, stderr?))
        })?;

        let status = child.wait()?;
        Ok(ExecResult {
            code: exit_code(status),
            stdout,
            stderr,
        })
    }
}

/// Map an [`std::process::ExitStatus`] to a numeric exit code.
///
/// Children terminated by a signal report `128 + signo`, the shell
/// convention downstream tooling expects in aggregate sums.
#[must_use]
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt as _;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}

/// Read one output stream to EOF, echoing each raw line and collecting a
/// cleaned copy (ANSI escapes and trailing `\r` stripped).
///
/// `EIO` surfaces as end-of-stream the way terminal-backed descriptors
/// report EOF; every other read error is propagated.
fn stream_lines<R: Read>(
    stream: R,
    echo: bool,
    prefix: &str,
    to_stderr: bool,
) -> std::io::Result<Vec<String>> {
    let mut reader = BufReader::new(stream);
    let mut lines = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => break,
            Ok(_) => {
                if buf.last() == Some(&b'\n') {
                    buf.pop();
                }
                let raw = String::from_utf8_lossy(&buf);
                if echo {
                    if to_stderr {
                        eprintln!("{prefix}{raw}");
                    } else {
                        println!("{prefix}{raw}");
                    }
                }
                lines.push(strip_ansi(raw.trim_end_matches('\r')));
            }
            Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(lines)
}
