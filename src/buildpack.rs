//! Buildpack lifecycle execution: detect, supply, compile, finalize, release.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Deserializer};

use crate::error::BuildpackError;
use crate::exec::{CommandLine, CommandRunner};
use crate::logging::Log;

/// Ordered registry of known buildpacks, tried in this order during
/// autodetection. Each entry maps a buildpack name to its canonical git URL
/// on the default branch.
pub const KNOWN_BUILDPACKS: &[(&str, &str)] = &[
    (
        "staticfile_buildpack",
        "https://github.com/cloudfoundry/staticfile-buildpack.git",
    ),
    (
        "java_buildpack",
        "https://github.com/cloudfoundry/java-buildpack.git",
    ),
    (
        "python_buildpack",
        "https://github.com/cloudfoundry/python-buildpack.git",
    ),
    (
        "ruby_buildpack",
        "https://github.com/cloudfoundry/ruby-buildpack.git",
    ),
    (
        "nodejs_buildpack",
        "https://github.com/cloudfoundry/nodejs-buildpack.git",
    ),
    (
        "php_buildpack",
        "https://github.com/cloudfoundry/php-buildpack.git",
    ),
    (
        "go_buildpack",
        "https://github.com/cloudfoundry/go-buildpack.git",
    ),
    (
        "dotnet_core_buildpack",
        "https://github.com/cloudfoundry/dotnet-core-buildpack.git",
    ),
    (
        "binary_buildpack",
        "https://github.com/cloudfoundry/binary-buildpack.git",
    ),
    (
        "nginx_buildpack",
        "https://github.com/cloudfoundry/nginx-buildpack.git",
    ),
    (
        "r_buildpack",
        "https://github.com/cloudfoundry/r-buildpack.git",
    ),
];

/// The canonical URL of a known buildpack name.
#[must_use]
pub fn known_url(name: &str) -> Option<&'static str> {
    KNOWN_BUILDPACKS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, url)| *url)
}

/// Deserialise a key whose absent *or null* value means "empty container".
fn null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parsed output of a buildpack's `bin/release` script.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ReleaseResult {
    /// Addon declarations (carried through, not interpreted).
    #[serde(default, deserialize_with = "null_default")]
    pub addons: Vec<String>,
    /// Environment variables exported to later buildpacks and to runtime.
    #[serde(default, deserialize_with = "null_default")]
    pub config_vars: BTreeMap<String, String>,
    /// Process type to start command mapping; `web` feeds the init script.
    #[serde(default, deserialize_with = "null_default")]
    pub default_process_types: BTreeMap<String, String>,
}

impl ReleaseResult {
    /// Parse release stdout; an empty document yields the empty result.
    ///
    /// # Errors
    ///
    /// Returns an error if the output is present but not valid YAML.
    fn parse(index: usize, out: &str) -> Result<Self, BuildpackError> {
        serde_yaml::from_str::<Option<Self>>(out)
            .map(Option::unwrap_or_default)
            .map_err(|source| BuildpackError::ReleaseParse { index, source })
    }
}

/// Outcome of driving one buildpack through its lifecycle.
#[derive(Debug, Default)]
pub struct BuildpackOutcome {
    /// Whether the buildpack applied itself (detect passed or was skipped).
    pub applied: bool,
    /// Release output; empty unless this was the final buildpack.
    pub release: ReleaseResult,
}

/// One buildpack instance bound to an application's directory layout.
///
/// `index` is the buildpack's ordinal in the application's list and names
/// its deps directory `depsdir/<index>/` on disk. The cache directory is
/// shared by all buildpacks of one application.
#[derive(Debug)]
pub struct Buildpack {
    name: String,
    index: usize,
    dir: PathBuf,
    appdir: PathBuf,
    depsdir: PathBuf,
    cachedir: PathBuf,
    runner: CommandRunner,
    log: Arc<dyn Log>,
}

impl Buildpack {
    /// Bind a downloaded buildpack to an application layout.
    ///
    /// `env` is the application's own environment (manifest `env`), visible
    /// to every lifecycle step underneath the staging variables.
    #[must_use]
    pub fn new(
        name: &str,
        index: usize,
        dir: &Path,
        appdir: &Path,
        depsdir: &Path,
        cachedir: &Path,
        env: BTreeMap<String, String>,
        log: Arc<dyn Log>,
    ) -> Self {
        let runner = CommandRunner::new(dir, env, Arc::clone(&log));
        Self {
            name: name.to_string(),
            index,
            dir: dir.to_path_buf(),
            appdir: appdir.to_path_buf(),
            depsdir: depsdir.to_path_buf(),
            cachedir: cachedir.to_path_buf(),
            runner,
            log,
        }
    }

    /// Buildpack name as referenced by the manifest.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ordinal in the application's buildpack list.
    #[must_use]
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Directory holding the buildpack scripts.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Whether the downloaded tree carries buildpack lifecycle scripts.
    #[must_use]
    pub fn has_scripts(&self) -> bool {
        self.dir.join("bin").join("detect").is_file()
    }

    fn script(&self, step: &str) -> String {
        self.dir
            .join("bin")
            .join(step)
            .to_string_lossy()
            .into_owned()
    }

    fn step(
        &self,
        step: &'static str,
        argv: Vec<String>,
        env: &BTreeMap<String, String>,
        echo: bool,
        prefix: &str,
    ) -> (i32, Vec<String>) {
        self.log
            .debug(&format!("Buildpack #{} running {step} step ...", self.index));
        match self.runner.run(&CommandLine::Argv(argv), env, echo, prefix) {
            Ok(result) => (result.code, result.stdout),
            Err(e) => {
                self.log.error(&format!(
                    "Buildpack #{}, error running {step}: {e}",
                    self.index
                ));
                (1, Vec::new())
            }
        }
    }

    /// Run `bin/detect`; exit 0 means the buildpack applies.
    #[must_use]
    pub fn detect(&self, echo: bool, env: &BTreeMap<String, String>) -> bool {
        let argv = vec![self.script("detect"), self.appdir.display().to_string()];
        let (rc, _) = self.step("detect", argv, env, echo, "[STG.det] ");
        self.log
            .info(&format!("Buildpack #{} detection: {}", self.index, rc == 0));
        rc == 0
    }

    /// Run `bin/supply` after creating `depsdir/<index>`.
    ///
    /// # Errors
    ///
    /// Returns an error if the deps directory cannot be created. A non-zero
    /// script exit is surfaced in the returned code.
    pub fn supply(
        &self,
        echo: bool,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<i32> {
        make_dir_0755(&self.depsdir.join(self.index.to_string()))?;
        let argv = vec![
            self.script("supply"),
            self.appdir.display().to_string(),
            self.cachedir.display().to_string(),
            self.depsdir.display().to_string(),
            self.index.to_string(),
        ];
        Ok(self.step("supply", argv, env, echo, "[STG.sup] ").0)
    }

    /// Run legacy `bin/compile`.
    ///
    /// # Errors
    ///
    /// Returns an error if the deps directory cannot be created. A non-zero
    /// script exit is surfaced in the returned code.
    pub fn compile(
        &self,
        echo: bool,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<i32> {
        make_dir_0755(&self.depsdir)?;
        let argv = vec![
            self.script("compile"),
            self.appdir.display().to_string(),
            self.cachedir.display().to_string(),
        ];
        Ok(self.step("compile", argv, env, echo, "[STG.com] ").0)
    }

    /// Run `bin/finalize` after ensuring `depsdir/<index>` exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the deps directory cannot be created. A non-zero
    /// script exit is surfaced in the returned code.
    pub fn finalize(
        &self,
        echo: bool,
        env: &BTreeMap<String, String>,
    ) -> std::io::Result<i32> {
        make_dir_0755(&self.depsdir.join(self.index.to_string()))?;
        let argv = vec![
            self.script("finalize"),
            self.appdir.display().to_string(),
            self.cachedir.display().to_string(),
            self.depsdir.display().to_string(),
            self.index.to_string(),
        ];
        Ok(self.step("finalize", argv, env, echo, "[STG.fin] ").0)
    }

    /// Run `bin/release` and parse its stdout.
    ///
    /// # Errors
    ///
    /// Returns an error if the script exits non-zero or its output is not
    /// valid YAML.
    pub fn release(
        &self,
        echo: bool,
        env: &BTreeMap<String, String>,
    ) -> Result<ReleaseResult, BuildpackError> {
        let argv = vec![self.script("release"), self.appdir.display().to_string()];
        let (rc, out) = self.step("release", argv, env, echo, "[STG.rel] ");
        if rc != 0 {
            return Err(BuildpackError::StepFailed {
                step: "release",
                index: self.index,
            });
        }
        let release = ReleaseResult::parse(self.index, &out.join("\n"))?;
        if release.default_process_types.is_empty() {
            self.log.debug(&format!(
                "Buildpack #{} does not provide startup command!",
                self.index
            ));
        } else {
            self.log.debug(&format!(
                "Buildpack #{} provides startup command: {:?}",
                self.index, release.default_process_types
            ));
        }
        Ok(release)
    }

    /// Drive the buildpack through its lifecycle.
    ///
    /// When `detect_required` is set, a failed detect reports *not applied*
    /// without error. A non-final buildpack runs `supply` only. A final
    /// buildpack runs `supply` (if present) and `finalize` when
    /// `bin/finalize` exists, legacy `compile` otherwise, then `release`.
    ///
    /// # Errors
    ///
    /// Returns an error if any required step exits non-zero, a deps
    /// directory cannot be created, or the release output cannot be parsed.
    pub fn run(
        &self,
        detect_required: bool,
        is_final: bool,
        staging_env: &BTreeMap<String, String>,
    ) -> Result<BuildpackOutcome, BuildpackError> {
        let verbose = self.log.verbose();
        let echo_detect_release = verbose;
        let echo_supply_finalize = true;
        self.log.info(&format!(
            "Running staging process with buildpack #{}: {}",
            self.index, self.name
        ));
        if detect_required && !self.detect(echo_detect_release, staging_env) {
            self.log.info(&format!("Skipping #{} buildpack!", self.index));
            return Ok(BuildpackOutcome::default());
        }
        if !is_final {
            let rc = self
                .supply(echo_supply_finalize, staging_env)
                .map_err(|_| BuildpackError::StepFailed {
                    step: "supply",
                    index: self.index,
                })?;
            if rc != 0 {
                return Err(BuildpackError::StepFailed {
                    step: "supply",
                    index: self.index,
                });
            }
            self.log.info(&format!(
                "Non final buildpack #{}, skipping rest of steps",
                self.index
            ));
            return Ok(BuildpackOutcome {
                applied: true,
                release: ReleaseResult::default(),
            });
        }
        if self.dir.join("bin").join("finalize").is_file() {
            if self.dir.join("bin").join("supply").is_file() {
                let rc = self
                    .supply(echo_supply_finalize, staging_env)
                    .map_err(|_| BuildpackError::StepFailed {
                        step: "supply",
                        index: self.index,
                    })?;
                if rc != 0 {
                    return Err(BuildpackError::StepFailed {
                        step: "supply",
                        index: self.index,
                    });
                }
            }
            let rc = self
                .finalize(echo_supply_finalize, staging_env)
                .map_err(|_| BuildpackError::StepFailed {
                    step: "finalize",
                    index: self.index,
                })?;
            if rc != 0 {
                return Err(BuildpackError::StepFailed {
                    step: "finalize",
                    index: self.index,
                });
            }
        } else {
            let rc = self
                .compile(echo_supply_finalize, staging_env)
                .map_err(|_| BuildpackError::StepFailed {
                    step: "compile",
                    index: self.index,
                })?;
            if rc != 0 {
                return Err(BuildpackError::StepFailed {
                    step: "compile",
                    index: self.index,
                });
            }
        }
        let release = self.release(echo_detect_release, staging_env)?;
        self.log
            .debug(&format!("Buildpack #{} successfully applied", self.index));
        Ok(BuildpackOutcome {
            applied: true,
            release,
        })
    }
}

/// Create a directory (and parents) with mode `0755`.
fn make_dir_0755(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt as _;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
}
