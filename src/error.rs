//! Domain-specific error types for the droplet engine.
//!
//! This module provides a structured error hierarchy using [`thiserror`].
//! Internal modules return typed errors (e.g., [`ConfigError`],
//! [`BuildpackError`]) while command handlers at the CLI boundary convert
//! them to [`anyhow::Error`] via the standard `?` operator.
//!
//! # Error hierarchy
//!
//! ```text
//! ConfigError     — manifest reading, application lookup, healthcheck kinds
//! GitError        — clone, tag resolution, checkout, metadata strip
//! BuildpackError  — buildpack resolution, download, lifecycle steps
//! SupervisorError — init directory scan, user resolution, task spawn
//! ```

use std::path::PathBuf;

use thiserror::Error;

/// Errors that arise from manifest loading and application lookup.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The manifest file could not be read.
    #[error("Cannot read CF manifest {path}: {source}")]
    ManifestRead {
        /// Path to the manifest that could not be read.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The manifest file is not valid YAML.
    #[error("Cannot parse CF manifest {path}: {source}")]
    ManifestParse {
        /// Path to the manifest that could not be parsed.
        path: String,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },

    /// The manifest has no `applications` list.
    #[error("CloudFoundry manifest is incomplete: no applications defined")]
    NoApplications,

    /// The requested application name is not defined in the manifest.
    #[error("Application '{0}' not found in manifest")]
    UnknownApplication(String),

    /// The application source path does not exist under the context.
    #[error("application path not found: {0}")]
    AppPathNotFound(String),

    /// The manifest declares an unsupported health check kind.
    #[error("Health check type '{0}' not supported")]
    UnknownHealthCheck(String),
}

/// Errors that arise from git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// The clone target directory already exists.
    #[error("Directory already exists: {0}")]
    TargetExists(PathBuf),

    /// The clone target resolves to the filesystem root.
    #[error("Git directory cannot be root: {0}")]
    RootDirectory(PathBuf),

    /// A git subcommand exited non-zero.
    #[error("git {op} failed: {detail}")]
    CommandFailed {
        /// The git subcommand that failed.
        op: &'static str,
        /// Captured stderr of the failed command.
        detail: String,
    },

    /// The requested tag or branch matched no refs.
    #[error("Not found tag/branch: {0}")]
    TagNotFound(String),

    /// Deleting VCS metadata from the clone failed.
    #[error("Error deleting {path}: {source}")]
    Cleanup {
        /// Path that could not be removed.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The `git` binary is not available on PATH.
    #[error("git not found on PATH")]
    GitMissing,
}

/// Errors that arise from buildpack resolution and lifecycle execution.
#[derive(Error, Debug)]
pub enum BuildpackError {
    /// The buildpack reference is neither a git URL nor a known name.
    #[error("Unknown buildpack '{0}', is not a git resource, neither is in the known buildpack list")]
    UnknownSource(String),

    /// The buildpack URL does not point at a git repository.
    #[error("Unknown buildpack '{0}', is not a git resource")]
    NotGit(String),

    /// Downloading the buildpack failed.
    #[error("Downloading buildpack failed: {0}")]
    Download(#[from] GitError),

    /// A lifecycle step exited non-zero.
    #[error("Error running {step} step in buildpack #{index}")]
    StepFailed {
        /// The lifecycle step that failed (`supply`, `compile`, ...).
        step: &'static str,
        /// Ordinal of the buildpack in the application's list.
        index: usize,
    },

    /// The release output was not valid YAML.
    #[error("Cannot parse release output of buildpack #{index}: {source}")]
    ReleaseParse {
        /// Ordinal of the buildpack in the application's list.
        index: usize,
        /// Underlying YAML error.
        source: serde_yaml::Error,
    },
}

/// Errors that arise from the runtime supervisor.
#[derive(Error, Debug)]
pub enum SupervisorError {
    /// The init script directory could not be read.
    #[error("Cannot read init directory {path}: {source}")]
    InitDirUnreadable {
        /// Path to the init directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The requested run user does not exist on the system.
    #[error("User '{0}' not found in the system")]
    UserNotFound(String),

    /// A supervised task could not be spawned.
    #[error("Cannot start task '{name}': {source}")]
    Spawn {
        /// Name of the task that failed to start.
        name: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use std::io;

    // -----------------------------------------------------------------------
    // ConfigError
    // -----------------------------------------------------------------------

    #[test]
    fn config_error_unknown_application_display() {
        let e = ConfigError::UnknownApplication("web".to_string());
        assert_eq!(e.to_string(), "Application 'web' not found in manifest");
    }

    #[test]
    fn config_error_unknown_health_check_display() {
        let e = ConfigError::UnknownHealthCheck("tcp".to_string());
        assert_eq!(e.to_string(), "Health check type 'tcp' not supported");
    }

    #[test]
    fn config_error_manifest_read_has_source() {
        use std::error::Error as StdError;
        let e = ConfigError::ManifestRead {
            path: "/app/manifest.yml".to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(e.source().is_some());
        assert!(e.to_string().contains("/app/manifest.yml"));
    }

    // -----------------------------------------------------------------------
    // GitError
    // -----------------------------------------------------------------------

    #[test]
    fn git_error_tag_not_found_display() {
        let e = GitError::TagNotFound("v1.7".to_string());
        assert_eq!(e.to_string(), "Not found tag/branch: v1.7");
    }

    #[test]
    fn git_error_root_directory_display() {
        let e = GitError::RootDirectory(PathBuf::from("/"));
        assert_eq!(e.to_string(), "Git directory cannot be root: /");
    }

    // -----------------------------------------------------------------------
    // BuildpackError
    // -----------------------------------------------------------------------

    #[test]
    fn buildpack_error_step_failed_display() {
        let e = BuildpackError::StepFailed {
            step: "supply",
            index: 2,
        };
        assert_eq!(e.to_string(), "Error running supply step in buildpack #2");
    }

    #[test]
    fn buildpack_error_from_git_error() {
        let git = GitError::TagNotFound("v4".to_string());
        let e: BuildpackError = git.into();
        assert!(e.to_string().contains("Downloading buildpack failed"));
        assert!(e.to_string().contains("v4"));
    }

    // -----------------------------------------------------------------------
    // SupervisorError
    // -----------------------------------------------------------------------

    #[test]
    fn supervisor_error_user_not_found_display() {
        let e = SupervisorError::UserNotFound("vcap".to_string());
        assert_eq!(e.to_string(), "User 'vcap' not found in the system");
    }

    #[test]
    fn supervisor_error_spawn_has_source() {
        use std::error::Error as StdError;
        let e = SupervisorError::Spawn {
            name: "0_web".to_string(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "permission denied"),
        };
        assert!(e.source().is_some());
    }

    // -----------------------------------------------------------------------
    // Send + Sync bounds
    // -----------------------------------------------------------------------

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn all_error_types_are_send_sync() {
        assert_send_sync::<ConfigError>();
        assert_send_sync::<GitError>();
        assert_send_sync::<BuildpackError>();
        assert_send_sync::<SupervisorError>();
    }

    // -----------------------------------------------------------------------
    // anyhow conversion
    // -----------------------------------------------------------------------

    #[test]
    fn config_error_converts_to_anyhow() {
        let e = ConfigError::UnknownApplication("x".to_string());
        let _anyhow_err: anyhow::Error = e.into();
    }

    #[test]
    fn supervisor_error_converts_to_anyhow() {
        let e = SupervisorError::UserNotFound("x".to_string());
        let _anyhow_err: anyhow::Error = e.into();
    }
}
