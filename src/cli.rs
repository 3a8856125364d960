//! Command-line surface for the staging and run entry points.
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Top-level argument parser.
#[derive(Parser, Debug)]
#[command(
    name = "droplet",
    about = "Cloud Foundry staging and run lifecycle engine for container images",
    version
)]
pub struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Command,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Stage the application: run the buildpack lifecycle and emit a droplet
    Stage(StageOpts),
    /// Run the staged droplet: supervise every init script
    Run(RunOpts),
    /// Print version information
    Version,
}

/// Options for the `stage` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct StageOpts {
    /// Re-clone buildpacks even when already downloaded
    #[arg(short, long)]
    pub force: bool,

    /// Buildpack to prepend to the manifest list (repeatable)
    #[arg(short, long = "buildpack")]
    pub buildpacks: Vec<String>,

    /// Working directory for downloaded buildpacks
    #[arg(long, default_value = "/buildpacks")]
    pub builddir: PathBuf,

    /// Cache directory shared by the buildpacks of one application
    #[arg(long, default_value = "/var/local/buildpacks/cache")]
    pub buildcache: PathBuf,

    /// Cloud Foundry application manifest file
    #[arg(short, long, default_value = "manifest.yml")]
    pub manifest: String,

    /// Variables file for manifest interpolation
    #[arg(short = 'v', long, default_value = "vars.yml")]
    pub manifest_vars: String,

    /// VCAP home directory receiving the droplet layout
    #[arg(long, default_value = "/home/vcap")]
    pub home: PathBuf,

    /// Restrict staging to one application of the manifest
    #[arg(short, long, default_value = "")]
    pub app: String,

    /// Context directory where the application bits live
    #[arg(long, default_value = "/app")]
    pub appcontext: PathBuf,

    /// File to write the healthcheck script to
    #[arg(long, default_value = "/healthcheck.sh")]
    pub healthcheck: PathBuf,

    /// Replace the context directory with a symlink to home/app
    #[arg(long)]
    pub link_context: bool,

    /// Delete downloaded buildpacks; given twice, also empty the cache
    #[arg(long, action = clap::ArgAction::Count)]
    pub clean: u8,

    /// Application zip file or directory, relative to the context
    #[arg(default_value = ".")]
    pub application: String,
}

/// Options for the `run` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct RunOpts {
    /// Merge manifest environment variables into each task
    #[arg(short = 'e', long)]
    pub manifest_env: bool,

    /// Synthesise a local Cloud Foundry environment
    #[arg(short = 'f', long)]
    pub cf_fake_env: bool,

    /// Synthesise the Cloud Foundry environment from a Kubernetes
    /// downward API directory
    #[arg(short = 'k', long, value_name = "PATH")]
    pub cf_k8s_env: Option<PathBuf>,

    /// Cloud Foundry application manifest file
    #[arg(short, long, default_value = "manifest.yml")]
    pub manifest: String,

    /// Run the application(s) as this user
    #[arg(short, long, default_value = "vcap")]
    pub user: String,

    /// Variables file for manifest interpolation
    #[arg(short = 'v', long, default_value = "vars.yml")]
    pub manifest_vars: String,

    /// VCAP home directory containing the droplet layout
    #[arg(short = 'H', long, default_value = "/home/vcap")]
    pub home: PathBuf,
}
