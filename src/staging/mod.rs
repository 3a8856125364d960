//! The staging pipeline: per-application buildpack lifecycle orchestration.
pub mod appfiles;
pub mod scripts;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result, bail};

use crate::buildpack::{Buildpack, KNOWN_BUILDPACKS, known_url};
use crate::cfenv;
use crate::error::BuildpackError;
use crate::git::GitFetcher;
use crate::logging::Log;
use crate::manifest::{ApplicationParams, Manifest};
use scripts::HealthCheck;

/// Drives the staging pipeline for every application of a manifest.
///
/// Owns the droplet layout under the home directory (`app/`, `deps/`,
/// `logs/`, `tmp/`, `init.d/`), the buildpack working directory and the
/// shared buildpack cache. An error staging one application halts the whole
/// run.
#[derive(Debug)]
pub struct Stager {
    homedir: PathBuf,
    buildpacksdir: PathBuf,
    cachedir: PathBuf,
    contextdir: PathBuf,
    healthcheck: Option<PathBuf>,
    appdir: PathBuf,
    depsdir: PathBuf,
    initd: PathBuf,
    cleaning_paths: Vec<PathBuf>,
    log: Arc<dyn Log>,
}

impl Stager {
    /// Prepare the droplet layout and the buildpack working directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the buildpack directory resolves to the
    /// filesystem root or any layout directory cannot be created.
    pub fn new(
        homedir: &Path,
        buildpacksdir: &Path,
        cachedir: &Path,
        contextdir: &Path,
        healthcheck: Option<&Path>,
        log: Arc<dyn Log>,
    ) -> Result<Self> {
        if std::path::absolute(buildpacksdir)
            .map_or(false, |p| p.parent().is_none())
        {
            bail!("Buildpack directory cannot be root: {}", buildpacksdir.display());
        }
        make_dir_0755(cachedir).with_context(|| {
            format!("Buildpacks caching directory cannot be created: {}", cachedir.display())
        })?;
        for dir in ["app", "deps", "logs", "tmp", "init.d"] {
            let path = homedir.join(dir);
            make_dir_0755(&path)
                .with_context(|| format!("Directory '{}' cannot be created", path.display()))?;
            log.debug(&format!("Directory '{}' created successfully", path.display()));
        }
        Ok(Self {
            homedir: homedir.to_path_buf(),
            buildpacksdir: buildpacksdir.to_path_buf(),
            cachedir: cachedir.to_path_buf(),
            contextdir: contextdir.to_path_buf(),
            healthcheck: healthcheck.map(Path::to_path_buf),
            appdir: homedir.join("app"),
            depsdir: homedir.join("deps"),
            initd: homedir.join("init.d"),
            cleaning_paths: Vec::new(),
            log,
        })
    }

    /// Stage every application of the manifest (or the one selected by
    /// `application`): materialise its tree, resolve and download its
    /// buildpacks, drive the lifecycle and emit the startup and healthcheck
    /// scripts.
    ///
    /// # Errors
    ///
    /// Returns an error on the first application that fails to stage.
    pub fn run(
        &mut self,
        appbits: &str,
        cfmanifest: &str,
        application: &str,
        variables: Option<&Path>,
        extra_buildpacks: &[String],
        force: bool,
    ) -> Result<()> {
        let manifest_path = self.contextdir.join(cfmanifest);
        let manifest = Manifest::load(&manifest_path, variables)?;
        std::fs::copy(&manifest_path, self.appdir.join(cfmanifest))
            .context("Cannot copy CF manifest")?;

        for app in manifest.list_apps() {
            let path = self.buildpacksdir.join(&app);
            make_dir_0755(&path).with_context(|| {
                format!("Buildpacks directory cannot be created: {}", path.display())
            })?;
        }

        let mut healthchecks: Vec<(String, HealthCheck)> = Vec::new();
        let mut app_index = 0;
        for app in manifest.list_apps() {
            if !application.is_empty() && app != application {
                self.log.info(&format!(
                    "Ignoring application name '{app}' defined in the manifest"
                ));
                continue;
            }
            self.log
                .debug(&format!("Found application {app} in manifest file"));
            let params = manifest.get_app_params(&app)?;
            self.stage_app(
                &app,
                app_index,
                &params,
                appbits,
                extra_buildpacks,
                force,
                &mut healthchecks,
            )?;
            app_index += 1;
        }

        if let Some(path) = self.healthcheck.clone() {
            scripts::write_healthcheck(&path, &healthchecks)?;
        }
        Ok(())
    }

    /// Stage one application end to end.
    #[allow(clippy::too_many_arguments)]
    fn stage_app(
        &mut self,
        app: &str,
        app_index: usize,
        params: &ApplicationParams,
        appbits: &str,
        extra_buildpacks: &[String],
        force: bool,
        healthchecks: &mut Vec<(String, HealthCheck)>,
    ) -> Result<()> {
        // 1. Materialise the application tree.
        let bits = if params.path.is_empty() {
            appbits
        } else {
            params.path.as_str()
        };
        let source = self.contextdir.join(bits);
        appfiles::materialize(&source, &self.appdir, &self.contextdir)
            .with_context(|| format!("Cannot copy application files for '{app}'"))?;

        // 2. Resolve the buildpack list.
        let mut names: Vec<String> = extra_buildpacks.to_vec();
        names.extend(params.buildpacks.iter().cloned());
        let autodetect = names.is_empty();
        if autodetect {
            self.log.info(&format!(
                "No buildpacks defined for application '{app}', trying to autodetect a suitable one ..."
            ));
            names = KNOWN_BUILDPACKS
                .iter()
                .map(|(name, _)| (*name).to_string())
                .collect();
        }
        self.log
            .info(&format!("Application '{app}' buildpacks: {names:?}"));

        // 3. Download and bind the buildpacks.
        let mut buildpacks = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let path = self.buildpacksdir.join(app).join(i.to_string());
            self.download_buildpack(name, &path, force)?;
            let bp = Buildpack::new(
                name,
                i,
                &path,
                &self.appdir,
                &self.depsdir,
                &self.cachedir,
                params.env.clone(),
                Arc::clone(&self.log),
            );
            if !bp.has_scripts() {
                self.log
                    .warn(&format!("Buildpack '{name}' carries no detect script"));
            }
            buildpacks.push(bp);
        }

        // 4. Build the staging environment.
        let mut staging_env = cfenv::staging_vars(app, params, &self.log);
        let mut running_env: BTreeMap<String, String> = BTreeMap::new();

        // 5. Collect start commands from the manifest and the Procfile.
        let (mut startcommands, mut sidecarcommands) = self.manifest_commands(params);
        self.procfile_commands(&mut startcommands, &mut sidecarcommands)?;

        // 6. Run the buildpacks in order.
        let total = buildpacks.len();
        let mut final_buildpack = "-".to_string();
        for (i, bp) in buildpacks.iter().enumerate() {
            let is_final = i + 1 == total || autodetect;
            let outcome = bp.run(autodetect, is_final, &staging_env).with_context(|| {
                format!("Cannot apply buildpack '{}' to application '{app}'", bp.name())
            })?;
            if outcome.applied {
                final_buildpack = bp.name().to_string();
                if is_final
                    && let Some(web) = outcome.release.default_process_types.get("web")
                {
                    startcommands.push(web.clone());
                }
                // Config vars become visible to every subsequent buildpack
                // and are exported to the runtime scripts.
                staging_env.extend(outcome.release.config_vars.clone());
                running_env.extend(outcome.release.config_vars);
                if autodetect {
                    break;
                }
            }
        }
        self.log
            .info(&format!("Application '{app}' successfully staged/compiled"));

        // 7.-9. Emit staging info, init scripts and the healthcheck entry.
        if let Some(first) = startcommands.first() {
            scripts::write_staging_info(&self.homedir, &final_buildpack, first)?;
            scripts::write_init(&self.initd, &self.appdir, app, app_index, first, &running_env)?;
            self.log.info(&format!(
                "Application '{app}' startup command: \x1b[0;33m{first}\x1b[0m"
            ));
            let kind = params.health_check_type.clone();
            let data = if kind == "process" {
                first.clone()
            } else {
                params.health_check_http_endpoint.clone()
            };
            healthchecks.push((app.to_string(), HealthCheck { kind, data }));
        }
        for (k, command) in sidecarcommands.iter().enumerate() {
            scripts::write_init(
                &self.initd,
                &self.appdir,
                &format!("{k}_{app}"),
                app_index,
                command,
                &running_env,
            )?;
            self.log.info(&format!(
                "Application '{app}' sidecar command: \x1b[0;33m{command}\x1b[0m"
            ));
        }
        Ok(())
    }

    /// Seed the start and sidecar command lists from the manifest.
    fn manifest_commands(&self, params: &ApplicationParams) -> (Vec<String>, Vec<String>) {
        let mut startcommands = Vec::new();
        let mut sidecarcommands = Vec::new();
        for sidecar in &params.sidecars {
            match &sidecar.command {
                Some(command) => sidecarcommands.push(command.trim().to_string()),
                None => self.log.error(&format!(
                    "Sidecar '{}' without 'command' key",
                    sidecar.name.as_deref().unwrap_or("?")
                )),
            }
        }
        if !params.command.is_empty() {
            startcommands.push(params.command.clone());
        }
        (startcommands, sidecarcommands)
    }

    /// Append `web:` and `worker:` entries of the application `Procfile`
    /// (either spelling) to the command lists.
    fn procfile_commands(
        &self,
        startcommands: &mut Vec<String>,
        sidecarcommands: &mut Vec<String>,
    ) -> Result<()> {
        let procfile = ["Procfile", "procfile"]
            .into_iter()
            .map(|name| self.appdir.join(name))
            .find(|path| path.is_file());
        let Some(procfile) = procfile else {
            self.log.debug("No procfile found");
            return Ok(());
        };
        self.log.debug(&format!("Reading {}", procfile.display()));
        let text = std::fs::read_to_string(&procfile)
            .with_context(|| format!("cannot read {}", procfile.display()))?;
        for line in text.lines() {
            let line = line.trim();
            if let Some(command) = line.strip_prefix("web:") {
                startcommands.push(command.trim().to_string());
            } else if let Some(command) = line.strip_prefix("worker:") {
                sidecarcommands.push(command.trim().to_string());
            }
        }
        Ok(())
    }

    /// Download one buildpack into `path` unless it is already present.
    ///
    /// A bare name is resolved through the known-buildpack registry; a URL
    /// must point at a git repository (`.git` suffix). The requested
    /// version rides in the URL fragment. Returns whether a download
    /// happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the reference cannot be resolved or the clone
    /// fails.
    pub fn download_buildpack(&mut self, name: &str, path: &Path, force: bool) -> Result<bool> {
        if path.is_dir() {
            self.log.debug(&format!(
                "Buildpack '{name}' already downloaded in '{}'",
                path.display()
            ));
            if !force {
                return Ok(false);
            }
            std::fs::remove_dir_all(path).with_context(|| {
                format!("Error deleting buildpack directory '{}'", path.display())
            })?;
        }
        self.cleaning_paths.push(path.to_path_buf());

        let (base, version) = split_fragment(name);
        let url = if base.contains("://") {
            base.to_string()
        } else {
            known_url(base)
                .ok_or_else(|| BuildpackError::UnknownSource(name.to_string()))?
                .to_string()
        };
        if !url.ends_with(".git") {
            return Err(BuildpackError::NotGit(name.to_string()).into());
        }
        self.log
            .info(&format!("Downloading buildpack '{name}' ({url}) ..."));
        GitFetcher::download(
            &url,
            path,
            version,
            true,
            self.log.verbose(),
            Arc::clone(&self.log),
        )
        .map_err(BuildpackError::Download)?;
        self.log.debug(&format!(
            "Buildpack '{name}' downloaded to '{}'",
            path.display()
        ));
        Ok(true)
    }

    /// Delete the buildpacks downloaded by this run; with `also_cache`,
    /// empty the cache directory too. Returns the deleted paths.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be removed.
    pub fn cleanup_buildpacks(&mut self, also_cache: bool) -> Result<Vec<PathBuf>> {
        let mut deleted = Vec::new();
        self.log.info("Deleting downloaded buildpacks ...");
        for path in std::mem::take(&mut self.cleaning_paths) {
            if path.is_dir() {
                self.log
                    .debug(&format!("Deleting buildpack: {}", path.display()));
                std::fs::remove_dir_all(&path).with_context(|| {
                    format!("Error deleting buildpack directory '{}'", path.display())
                })?;
                deleted.push(path);
            }
        }
        if also_cache {
            for entry in std::fs::read_dir(&self.cachedir)
                .with_context(|| format!("Error reading cache directory '{}'", self.cachedir.display()))?
            {
                let path = entry?.path();
                if path.is_dir() {
                    std::fs::remove_dir_all(&path)
                } else {
                    std::fs::remove_file(&path)
                }
                .with_context(|| {
                    format!("Error deleting cache entry '{}'", path.display())
                })?;
                deleted.push(path);
            }
        }
        Ok(deleted)
    }

    /// Replace the context directory with a symlink to the staged
    /// application directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the context directory cannot be removed or the
    /// symlink cannot be created.
    pub fn link_context(&self) -> Result<()> {
        self.log.debug(&format!(
            "Deleting context directory: {}",
            self.contextdir.display()
        ));
        std::fs::remove_dir_all(&self.contextdir).with_context(|| {
            format!("Error deleting context directory '{}'", self.contextdir.display())
        })?;
        self.log.debug(&format!(
            "Creating link '{}' to '{}'",
            self.contextdir.display(),
            self.appdir.display()
        ));
        std::os::unix::fs::symlink(&self.appdir, &self.contextdir).with_context(|| {
            format!("Error creating context link '{}'", self.contextdir.display())
        })?;
        Ok(())
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

/// Split a buildpack reference into its base and optional `#fragment`
/// version.
fn split_fragment(name: &str) -> (&str, Option<&str>) {
    match name.split_once('#') {
        Some((base, fragment)) if !fragment.is_empty() => (base, Some(fragment)),
        Some((base, _)) => (base, None),
        None => (name, None),
    }
}
