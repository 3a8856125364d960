//! Fetching git repositories for buildpack downloads.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::GitError;
use crate::exec::{CommandLine, CommandRunner, ExecResult};
use crate::logging::Log;

/// Clones a remote repository into a target directory, optionally at a
/// tag or branch, by driving the `git` binary.
#[derive(Debug)]
pub struct GitFetcher {
    directory: PathBuf,
    echo: bool,
    runner: CommandRunner,
}

impl GitFetcher {
    /// Create a fetcher for the given target directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory resolves to the filesystem root or
    /// the `git` binary is not on PATH.
    pub fn new(directory: &Path, echo: bool, log: Arc<dyn Log>) -> Result<Self, GitError> {
        if path_is_root(directory) {
            return Err(GitError::RootDirectory(directory.to_path_buf()));
        }
        if which::which("git").is_err() {
            return Err(GitError::GitMissing);
        }
        // vt220 keeps colour-capable git output line oriented.
        let env = BTreeMap::from([("TERM".to_string(), "vt220".to_string())]);
        let runner = CommandRunner::new(directory, env, log);
        Ok(Self {
            directory: directory.to_path_buf(),
            echo,
            runner,
        })
    }

    /// Clone a repository into the target directory at an optional tag or
    /// branch, then optionally strip VCS metadata from the clone.
    ///
    /// The tag is resolved by reverse-sorting the refs matching
    /// `tag_or_branch` and checking out `tags/<first match>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the target directory already exists, the clone or
    /// checkout fails, or no ref matches the requested tag.
    pub fn download(
        url: &str,
        directory: &Path,
        tag_or_branch: Option<&str>,
        strip_metadata: bool,
        echo: bool,
        log: Arc<dyn Log>,
    ) -> Result<(), GitError> {
        if directory.is_dir() {
            return Err(GitError::TargetExists(directory.to_path_buf()));
        }
        let git = Self::new(directory, echo, log)?;
        git.clone_into(url)?;
        if let Some(tag) = tag_or_branch {
            let tags = git.list_tags(tag)?;
            let newest = tags
                .first()
                .ok_or_else(|| GitError::TagNotFound(tag.to_string()))?;
            git.checkout(&format!("tags/{newest}"))?;
        }
        if strip_metadata {
            git.strip_metadata()?;
        }
        Ok(())
    }

    /// Clone `url` (with submodules) into the target directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the clone exits non-zero or cannot be spawned.
    pub fn clone_into(&self, url: &str) -> Result<(), GitError> {
        // Clone runs from the parent so git creates the target itself.
        let parent = self
            .directory
            .parent()
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let argv = vec![
            "git".to_string(),
            "clone".to_string(),
            "--recurse-submodules".to_string(),
            url.to_string(),
            self.directory.to_string_lossy().into_owned(),
        ];
        let result = self.exec_in("clone", &parent, argv)?;
        Self::expect_success("clone", &result)
    }

    /// List tags matching `pattern`, newest first (reverse ref-name sort).
    ///
    /// # Errors
    ///
    /// Returns an error if `git tag` exits non-zero or cannot be spawned.
    pub fn list_tags(&self, pattern: &str) -> Result<Vec<String>, GitError> {
        let argv = vec![
            "git".to_string(),
            "tag".to_string(),
            "--sort=-refname".to_string(),
            "--list".to_string(),
            pattern.to_string(),
        ];
        let result = self.exec_in("tag", &self.directory, argv)?;
        Self::expect_success("tag", &result)?;
        Ok(result
            .stdout
            .into_iter()
            .filter(|l| !l.is_empty())
            .collect())
    }

    /// Check out a ref in the clone.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkout exits non-zero or cannot be spawned.
    pub fn checkout(&self, refname: &str) -> Result<(), GitError> {
        let argv = vec![
            "git".to_string(),
            "checkout".to_string(),
            refname.to_string(),
        ];
        let result = self.exec_in("checkout", &self.directory, argv)?;
        Self::expect_success("checkout", &result)
    }

    /// Delete `.git`, `.gitignore` and `.gitallowed` from the clone root.
    ///
    /// # Errors
    ///
    /// Returns an error if any of the entries exists but cannot be removed.
    pub fn strip_metadata(&self) -> Result<(), GitError> {
        for name in [".git", ".gitignore", ".gitallowed"] {
            let path = self.directory.join(name);
            let result = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else if path.is_file() {
                std::fs::remove_file(&path)
            } else {
                continue;
            };
            result.map_err(|source| GitError::Cleanup { path, source })?;
        }
        Ok(())
    }

    fn exec_in(
        &self,
        op: &'static str,
        dir: &Path,
        argv: Vec<String>,
    ) -> Result<ExecResult, GitError> {
        self.runner
            .run_in(dir, &CommandLine::Argv(argv), &BTreeMap::new(), self.echo, "[GIT] ")
            .map_err(|e| GitError::CommandFailed {
                op,
                detail: e.to_string(),
            })
    }

    fn expect_success(op: &'static str, result: &ExecResult) -> Result<(), GitError> {
        if result.success() {
            Ok(())
        } else {
            Err(GitError::CommandFailed {
                op,
                detail: result.stderr.join(" "),
            })
        }
    }
}

/// Whether a path resolves to the filesystem root.
fn path_is_root(path: &Path) -> bool {
    std::path::absolute(path).map_or(false, |p| p.parent().is_none())
}
