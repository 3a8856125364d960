//! The `stage` command: run the buildpack lifecycle and emit a droplet.
use std::path::Path;
use std::sync::Arc;

use anyhow::Result;

use crate::cli::StageOpts;
use crate::logging::{Log, Logger};
use crate::staging::Stager;

/// Run the stage command.
///
/// The manifest and variables file names can be overridden through the
/// `CF_MANIFEST` and `CF_VARS` environment variables.
///
/// # Errors
///
/// Returns an error if the droplet layout cannot be prepared or any
/// application fails to stage.
pub fn run(opts: &StageOpts, log: &Arc<Logger>) -> Result<()> {
    let version = option_env!("DROPLET_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"));
    log.info(&format!("droplet {version}"));

    let cfmanifest = std::env::var("CF_MANIFEST").unwrap_or_else(|_| opts.manifest.clone());
    let cfvars = std::env::var("CF_VARS").unwrap_or_else(|_| opts.manifest_vars.clone());

    log.stage("Staging applications");
    let mut stager = Stager::new(
        &opts.home,
        &opts.builddir,
        &opts.buildcache,
        &opts.appcontext,
        Some(&opts.healthcheck),
        Arc::clone(log) as Arc<dyn Log>,
    )?;
    stager.run(
        &opts.application,
        &cfmanifest,
        &opts.app,
        Some(Path::new(&cfvars)),
        &opts.buildpacks,
        opts.force,
    )?;

    if opts.clean > 0 {
        log.stage("Cleaning buildpacks");
        stager.cleanup_buildpacks(opts.clean > 1)?;
    }
    if opts.link_context {
        stager.link_context()?;
    }
    Ok(())
}
