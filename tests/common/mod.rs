// Shared helpers for integration tests.
//
// Provides a temporary-directory-backed droplet workspace and fake
// buildpack trees so each integration test can drive the staging pipeline
// and the supervisor without network access or real buildpacks.
//
// Used by all integration test binaries that declare `mod common;`.
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use droplet_cli::buildpack::KNOWN_BUILDPACKS;
use droplet_cli::logging::{Log, Logger};
use droplet_cli::staging::Stager;

/// An isolated droplet workspace backed by a [`tempfile::TempDir`].
///
/// Layout: `context/` (push context with manifest and app sources),
/// `home/` (droplet target), `buildpacks/` (pre-seeded fake buildpacks),
/// `cache/` and `healthcheck.sh`.
pub struct Fixture {
    /// Temporary directory holding the whole workspace.
    pub tmp: tempfile::TempDir,
}

impl Fixture {
    /// Create an empty workspace.
    pub fn new() -> Self {
        let tmp = tempfile::tempdir().expect("create temp dir");
        for dir in ["context", "home", "buildpacks", "cache"] {
            std::fs::create_dir_all(tmp.path().join(dir)).expect("create workspace dir");
        }
        Self { tmp }
    }

    /// Path to the push context directory.
    pub fn context(&self) -> PathBuf {
        self.tmp.path().join("context")
    }

    /// Path to the droplet home directory.
    pub fn home(&self) -> PathBuf {
        self.tmp.path().join("home")
    }

    /// Path to the emitted healthcheck script.
    pub fn healthcheck(&self) -> PathBuf {
        self.tmp.path().join("healthcheck.sh")
    }

    /// Path to the init script directory of the droplet.
    pub fn initd(&self) -> PathBuf {
        self.home().join("init.d")
    }

    /// Write the manifest into the context.
    pub fn write_manifest(&self, content: &str) {
        std::fs::write(self.context().join("manifest.yml"), content).expect("write manifest");
    }

    /// Write the variables file into the context and return its path.
    pub fn write_vars(&self, content: &str) -> PathBuf {
        let path = self.context().join("vars.yml");
        std::fs::write(&path, content).expect("write vars");
        path
    }

    /// Write one application source file below the context.
    pub fn write_app_file(&self, rel: &str, content: &str) {
        let path = self.context().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("create app source dir");
        }
        std::fs::write(&path, content).expect("write app file");
    }

    /// Seed one fake buildpack at `buildpacks/<app>/<index>` with the given
    /// name-specific detect rule and release output. The pre-seeded
    /// directory keeps the pipeline from cloning anything.
    pub fn seed_buildpack(&self, app: &str, index: usize, name: &str, release_yaml: &str) {
        let bin = self
            .tmp
            .path()
            .join("buildpacks")
            .join(app)
            .join(index.to_string())
            .join("bin");
        std::fs::create_dir_all(&bin).expect("create buildpack bin");
        write_script(
            &bin.join("detect"),
            &format!("#!/bin/sh\n{}\n", detect_rule(name)),
        );
        write_script(&bin.join("supply"), "#!/bin/sh\nexit 0\n");
        write_script(&bin.join("finalize"), "#!/bin/sh\nexit 0\n");
        write_script(
            &bin.join("release"),
            &format!("#!/bin/sh\ncat <<'EOF'\n{release_yaml}EOF\n"),
        );
    }

    /// Seed the full known-buildpack registry for `app` so autodetection
    /// runs offline; every buildpack reports `release_yaml` on release.
    pub fn seed_autodetect_registry(&self, app: &str, release_yaml: &str) {
        for (index, (name, _)) in KNOWN_BUILDPACKS.iter().enumerate() {
            self.seed_buildpack(app, index, name, release_yaml);
        }
    }

    /// Build a stager over this workspace.
    pub fn stager(&self) -> Stager {
        let log: Arc<dyn Log> = Arc::new(Logger::new("test", false));
        Stager::new(
            &self.home(),
            &self.tmp.path().join("buildpacks"),
            &self.tmp.path().join("cache"),
            &self.context(),
            Some(&self.healthcheck()),
            log,
        )
        .expect("create stager")
    }

    /// Stage every application of the manifest with default options.
    pub fn stage(&self) -> anyhow::Result<()> {
        self.stager().run(".", "manifest.yml", "", None, &[], false)
    }
}

/// The detect rule a fake buildpack of the given name applies.
fn detect_rule(name: &str) -> &'static str {
    match name {
        "staticfile_buildpack" => "[ -f \"$1/Staticfile\" ]",
        "python_buildpack" => "[ -f \"$1/requirements.txt\" ]",
        _ => "exit 1",
    }
}

/// A release document whose `web` process type runs `command`. The value
/// is single-quoted so shell text always parses as a YAML string.
pub fn release_with_web(command: &str) -> String {
    format!("default_process_types:\n  web: '{command}'\n")
}

/// Write an executable script.
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::write(path, body).expect("write script");
    let mut perms = std::fs::metadata(path).expect("stat script").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms).expect("chmod script");
}
