//! Emission of init scripts, the staging info file and the healthcheck.
use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt as _;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};

use crate::error::ConfigError;

/// Literal header of every emitted init script. Production buildpacks rely
/// on this exact shape (profile.d sourcing, `DEPS_DIR`, `--debug` handling),
/// so it is preserved verbatim.
const INIT_SCRIPT: &str = r#"#!/bin/bash
# This file was automatically generated

# source all files
load_folder() {
    local dir="${1}"
    local files=()
    if [ -d "${dir}" ]
    then
        # Get list of files by order in the specific path
        while IFS=  read -r -d $'\0' line
        do
            files+=("${line}")
        done < <(find -L ${dir}  -maxdepth 1 -type f -name '*.sh' -print0 | sort -z)
        # launch files
        for filename in "${files[@]}"
        do
            echo "Loading ${filename}"
            source "${filename}"
        done
    fi
}

export HOME="${HOME-/home/vcap/app}"
export LANG="${LANG-C.UTF-8}"
export USER="${USER-root}"
export TMPDIR="${TMPDIR-/home/vcap/tmp}"
export DEPS_DIR="${DEPS_DIR-/home/vcap/deps}"

case "$1" in
    --help|-h)
        echo "Script to start $0 application in the same way as CF"
        echo "Usage: $0 [--help|--debug]"
        exit 1
        ;;
    --debug|-d)
        DEBUG=1
        ;;
esac

[ -z ${DEBUG} ] || set -x
load_folder "/home/vcap/profile.d"
load_folder "${HOME}/.profile.d"
[ -f "${HOME}/.profile" ] && source "${HOME}/.profile"
[ -z ${DEBUG} ] || env

"#;

/// One healthcheck entry for an application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    /// Check kind: `http`, `port` or `process`.
    pub kind: String,
    /// Kind-specific payload: the endpoint for `http`, the start command
    /// for `process`.
    pub data: String,
}

/// Write one init script `<index>_<name>.sh` into `initd`.
///
/// The script sources the profile folders, exports the running environment
/// (each variable defaulting to its staged value) and execs the start
/// command from the application directory. Mode `0775`.
///
/// # Errors
///
/// Returns an error if the script cannot be written.
pub fn write_init(
    initd: &Path,
    appdir: &Path,
    name: &str,
    index: usize,
    command: &str,
    env: &BTreeMap<String, String>,
) -> Result<PathBuf> {
    let path = initd.join(format!("{index}_{name}.sh"));
    let mut content = String::from(INIT_SCRIPT);
    content.push('\n');
    content.push_str(&format!("cd {}\n\n", appdir.display()));
    for (key, value) in env {
        let escaped = value.replace('"', "\\\"").replace('\n', "\\n");
        content.push_str(&format!("export {key}=\"${{{key}-{escaped}}}\"\n"));
    }
    content.push_str(&format!("\n{command}\n"));
    std::fs::write(&path, content)
        .with_context(|| format!("Startup file '{}' cannot be created", path.display()))?;
    set_mode(&path, 0o775)?;
    Ok(path)
}

/// Write `staging_info.yml` (JSON content, historical filename) into the
/// home directory.
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_staging_info(
    homedir: &Path,
    detected_buildpack: &str,
    start_command: &str,
) -> Result<()> {
    let path = homedir.join("staging_info.yml");
    let info = serde_json::json!({
        "detected_buildpack": detected_buildpack,
        "start_command": start_command,
    });
    std::fs::write(&path, info.to_string())
        .with_context(|| format!("Staging info '{}' cannot be created", path.display()))?;
    Ok(())
}

/// Write the healthcheck script: one commented section and one probe
/// command per application. Mode `0775`.
///
/// # Errors
///
/// Returns an error if an application declares an unsupported check kind
/// or the file cannot be written.
pub fn write_healthcheck(path: &Path, checks: &[(String, HealthCheck)]) -> Result<()> {
    let mut content = String::from("#!/bin/bash -e\n# This file was automatically generated\n\n");
    for (app, check) in checks {
        content.push_str(&format!("# checks for {app}\n"));
        match check.kind.as_str() {
            "http" => content.push_str(&format!(
                "curl --silent --fail --connect-timeout 2 http://127.0.0.1:${{APP_PORT:-${{PORT:-8080}}}}{}\n",
                check.data
            )),
            "port" => content
                .push_str("nc -z -w 2 127.0.0.1 ${APP_PORT:-${PORT:-8080}}\n"),
            "process" => {
                content.push_str(&format!(
                    "pgrep --ignore-case --full {} >/dev/null\n",
                    check.data
                ));
            }
            other => {
                return Err(ConfigError::UnknownHealthCheck(other.to_string()).into());
            }
        }
    }
    std::fs::write(path, content)
        .with_context(|| format!("Healthcheck file '{}' cannot be created", path.display()))?;
    set_mode(path, 0o775)?;
    Ok(())
}

/// Apply a unix permission mode to a path.
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .with_context(|| format!("cannot stat {}", path.display()))?
        .permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
        .with_context(|| format!("cannot chmod {}", path.display()))?;
    Ok(())
}
