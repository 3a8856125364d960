//! The `run` command: supervise every init script of the staged droplet.
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};

use crate::cfenv;
use crate::cli::RunOpts;
use crate::logging::{Log, Logger};
use crate::manifest::Manifest;
use crate::supervisor::{self, Supervisor, aggregate_exit, scan_init_scripts};

/// Run the run command, returning the aggregate exit code (the sum of the
/// supervised process exit codes).
///
/// The manifest and variables file names can be overridden through the
/// `CF_MANIFEST` and `CF_VARS` environment variables.
///
/// # Errors
///
/// Returns an error if the manifest or init directory cannot be read, the
/// run user does not exist, or the environment cannot be synthesised.
pub fn run(opts: &RunOpts, log: &Arc<Logger>) -> Result<i32> {
    let log_dyn: Arc<dyn Log> = Arc::clone(log) as Arc<dyn Log>;
    let cfmanifest = std::env::var("CF_MANIFEST").unwrap_or_else(|_| opts.manifest.clone());
    let cfvars = std::env::var("CF_VARS").unwrap_or_else(|_| opts.manifest_vars.clone());

    let appdir = opts.home.join("app");
    let initd = opts.home.join("init.d");
    let manifest_path = appdir.join(&cfmanifest);
    log.debug(&format!(
        "Starting runner: home={}, appdir={}, manifest={}",
        opts.home.display(),
        appdir.display(),
        manifest_path.display()
    ));
    let manifest = Manifest::load(&manifest_path, Some(Path::new(&cfvars)))?;
    for app in manifest.list_apps() {
        log.debug(&format!("Found application {app} in manifest file"));
    }
    if let Some((buildpack, command)) = read_staging_info(&opts.home) {
        log.debug(&format!(
            "Staged with buildpack '{buildpack}', start command '{command}'"
        ));
    }

    let mut sup = Supervisor::new(&appdir, BTreeMap::new(), &opts.user, Arc::clone(&log_dyn))?;
    for script in scan_init_scripts(&initd)? {
        let params = manifest.get_app_params(&script.app)?;
        let mut env = BTreeMap::new();
        if opts.cf_fake_env {
            log.debug("Application running in local container, generating synthetic metadata ...");
            env = cfenv::runtime_vars(&script.app, &params, &log_dyn);
        }
        if let Some(dir) = &opts.cf_k8s_env {
            log.debug("Application running in Kubernetes, reading downward API metadata ...");
            env = cfenv::k8s_vars(&script.app, &params, dir, &log_dyn)
                .context("cannot synthesise Kubernetes environment")?;
        }
        if opts.manifest_env {
            // Manifest environment wins over the synthesised values.
            env.extend(params.env.clone());
        }
        let mut argv = vec![script.path.display().to_string()];
        if log.verbose() {
            argv.push("--debug".to_string());
        }
        sup.add_task(&script.stem, argv, env);
    }

    log.info(&format!("Supervising {} init script(s)", sup.task_count()));

    // Signals are blocked process-wide and received by one listener thread
    // that fans them out to the live task groups.
    supervisor::block_forwarded_signals().context("cannot set up signal forwarding")?;
    let _listener = supervisor::spawn_signal_forwarder(sup.handle());

    let reports = sup.run(true);
    for report in &reports {
        log.info(&format!(
            "Application {} (pid={}) exited with code {}",
            report.name, report.pid, report.code
        ));
    }
    Ok(aggregate_exit(&reports))
}

/// Read `staging_info.yml` back from the droplet, if present.
fn read_staging_info(homedir: &Path) -> Option<(String, String)> {
    let text = std::fs::read_to_string(homedir.join("staging_info.yml")).ok()?;
    let info: serde_yaml::Value = serde_yaml::from_str(&text).ok()?;
    Some((
        info.get("detected_buildpack")?.as_str()?.to_string(),
        info.get("start_command")?.as_str()?.to_string(),
    ))
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn staging_info_round_trips_through_the_reader() {
        let tmp = tempfile::tempdir().unwrap();
        crate::staging::scripts::write_staging_info(tmp.path(), "python_buildpack", "run me")
            .expect("write staging info");
        let (buildpack, command) = read_staging_info(tmp.path()).expect("read staging info");
        assert_eq!(buildpack, "python_buildpack");
        assert_eq!(command, "run me");
    }

    #[test]
    fn missing_staging_info_reads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_staging_info(tmp.path()).is_none());
    }
}
