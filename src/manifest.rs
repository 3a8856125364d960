//! Cloud Foundry application manifest parsing and variable interpolation.
use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use crate::error::ConfigError;

/// A parsed Cloud Foundry manifest plus its variables file.
///
/// Variable interpolation replaces every textual `((name))` occurrence in
/// string leaves with the scalar form of `variables[name]`. Interpolation
/// never fails a lookup: any deserialisation or substitution problem for a
/// key yields that key's documented default, so a malformed variable cannot
/// abort a whole push.
#[derive(Debug)]
pub struct Manifest {
    applications: Vec<Mapping>,
    variables: Mapping,
    version: u64,
}

/// One `routes:` entry.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Route {
    /// The route host name.
    pub route: String,
}

/// One `sidecars:` entry. Only the fields the lifecycle consumes are
/// modelled; everything else is ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Sidecar {
    /// Display name of the sidecar.
    #[serde(default)]
    pub name: Option<String>,
    /// Start command; a sidecar without one is reported and skipped.
    #[serde(default)]
    pub command: Option<String>,
}

/// Fully defaulted per-application parameters.
///
/// Every documented manifest key is always materialised: a missing or
/// malformed key falls back to the default recorded in
/// [`ApplicationParams::default`].
#[derive(Debug, Clone)]
pub struct ApplicationParams {
    /// Ordered buildpack references.
    pub buildpacks: Vec<String>,
    /// Explicit start command.
    pub command: String,
    /// Disk quota size string.
    pub disk_quota: String,
    /// Docker settings (unused by the staging lifecycle).
    pub docker: Mapping,
    /// Endpoint probed by `http` health checks.
    pub health_check_http_endpoint: String,
    /// Health check kind: `http`, `port` or `process`.
    ///
    /// Carried as a string and validated when the healthcheck script is
    /// emitted, so an unknown kind is a hard error there instead of being
    /// silently replaced by the default here.
    pub health_check_type: String,
    /// Requested instance count.
    pub instances: i64,
    /// Memory limit size string.
    pub memory: String,
    /// Free-form metadata.
    pub metadata: Mapping,
    /// Whether the application opts out of routing.
    pub no_route: bool,
    /// Application bits path relative to the push context; empty means the
    /// path given on the command line.
    pub path: String,
    /// Process declarations (unused by the staging lifecycle).
    pub processes: Vec<Value>,
    /// Whether a random route was requested.
    pub random_route: bool,
    /// Declared routes.
    pub routes: Vec<Route>,
    /// Declared sidecars.
    pub sidecars: Vec<Sidecar>,
    /// Root filesystem stack name.
    pub stack: String,
    /// Health check timeout in seconds.
    pub timeout: i64,
    /// Application environment variables.
    pub env: BTreeMap<String, String>,
    /// Bound service names (unused by the staging lifecycle).
    pub services: Vec<Value>,
}

impl Default for ApplicationParams {
    fn default() -> Self {
        Self {
            buildpacks: Vec::new(),
            command: String::new(),
            disk_quota: "2048M".to_string(),
            docker: Mapping::new(),
            health_check_http_endpoint: "/".to_string(),
            health_check_type: "port".to_string(),
            instances: 1,
            memory: "1024M".to_string(),
            metadata: Mapping::new(),
            no_route: false,
            path: String::new(),
            processes: Vec::new(),
            random_route: false,
            routes: Vec::new(),
            sidecars: Vec::new(),
            stack: "cflinuxfs3".to_string(),
            timeout: 60,
            env: BTreeMap::new(),
            services: Vec::new(),
        }
    }
}

impl Manifest {
    /// Read a manifest and an optional variables file.
    ///
    /// A missing or unreadable variables file yields an empty variable set;
    /// a variables file that exists but is not valid YAML is an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest cannot be read or parsed.
    pub fn load(manifest: &Path, variables: Option<&Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(manifest).map_err(|source| {
            ConfigError::ManifestRead {
                path: manifest.display().to_string(),
                source,
            }
        })?;
        let doc: Value = serde_yaml::from_str(&text).map_err(|source| {
            ConfigError::ManifestParse {
                path: manifest.display().to_string(),
                source,
            }
        })?;

        let applications = doc
            .get("applications")
            .and_then(Value::as_sequence)
            .ok_or(ConfigError::NoApplications)?
            .iter()
            .filter_map(|v| v.as_mapping().cloned())
            .collect();
        let version = doc.get("version").and_then(Value::as_u64).unwrap_or(1);

        let variables = variables
            .and_then(|path| std::fs::read_to_string(path).ok())
            .map(|text| {
                serde_yaml::from_str::<Value>(&text).map(|v| {
                    v.as_mapping().cloned().unwrap_or_default()
                })
            })
            .transpose()
            .map_err(|source| ConfigError::ManifestParse {
                path: "variables".to_string(),
                source,
            })?
            .unwrap_or_default();

        Ok(Self {
            applications,
            variables,
            version,
        })
    }

    /// Manifest schema version; defaults to 1.
    #[must_use]
    pub const fn version(&self) -> u64 {
        self.version
    }

    /// Application names in manifest order. Entries without a `name` key
    /// are skipped.
    #[must_use]
    pub fn list_apps(&self) -> Vec<String> {
        self.applications
            .iter()
            .filter_map(|app| {
                app.get("name").and_then(Value::as_str).map(ToOwned::to_owned)
            })
            .collect()
    }

    /// Fully defaulted, variable-interpolated parameters for one
    /// application.
    ///
    /// # Errors
    ///
    /// Returns an error if no application with the given name exists.
    pub fn get_app_params(&self, name: &str) -> Result<ApplicationParams, ConfigError> {
        let app = self
            .applications
            .iter()
            .find(|app| app.get("name").and_then(Value::as_str) == Some(name))
            .ok_or_else(|| ConfigError::UnknownApplication(name.to_string()))?;

        let d = ApplicationParams::default();
        Ok(ApplicationParams {
            buildpacks: self.param(app, "buildpacks", d.buildpacks),
            command: self.param(app, "command", d.command),
            disk_quota: self.param(app, "disk_quota", d.disk_quota),
            docker: self.param(app, "docker", d.docker),
            health_check_http_endpoint: self.param(
                app,
                "health-check-http-endpoint",
                d.health_check_http_endpoint,
            ),
            health_check_type: self.param(app, "health-check-type", d.health_check_type),
            instances: self.param(app, "instances", d.instances),
            memory: self.param(app, "memory", d.memory),
            metadata: self.param(app, "metadata", d.metadata),
            no_route: self.param(app, "no-route", d.no_route),
            path: self.param(app, "path", d.path),
            processes: self.param(app, "processes", d.processes),
            random_route: self.param(app, "random-route", d.random_route),
            routes: self.param(app, "routes", d.routes),
            sidecars: self.param(app, "sidecars", d.sidecars),
            stack: self.param(app, "stack", d.stack),
            timeout: self.param(app, "timeout", d.timeout),
            env: self.string_map(app, "env"),
            services: self.param(app, "services", d.services),
        })
    }

    /// Fetch one key, interpolate variables through its string leaves and
    /// deserialise it; any failure yields the default.
    fn param<T: serde::de::DeserializeOwned>(&self, app: &Mapping, key: &str, default: T) -> T {
        match app.get(key) {
            Some(raw) => {
                let value = interpolate(raw, &self.variables);
                // Malformed values keep the documented default.
                serde_yaml::from_value(value).unwrap_or(default)
            }
            None => default,
        }
    }

    /// Fetch a flat string→string mapping, coercing scalar values (numbers,
    /// booleans) to their string forms and skipping everything else.
    fn string_map(&self, app: &Mapping, key: &str) -> BTreeMap<String, String> {
        let Some(raw) = app.get(key) else {
            return BTreeMap::new();
        };
        let value = interpolate(raw, &self.variables);
        value.as_mapping().map_or_else(BTreeMap::new, |map| {
            map.iter()
                .filter_map(|(k, v)| {
                    let key = k.as_str()?.to_string();
                    let val = scalar_to_string(v)?;
                    Some((key, val))
                })
                .collect()
        })
    }
}

/// Apply `((name))` substitution for every variable through the string
/// leaves of `value`: plain strings, strings inside sequences, string
/// values of mappings inside sequences (`routes`), and string values of
/// flat mappings.
fn interpolate(value: &Value, variables: &Mapping) -> Value {
    let mut result = value.clone();
    for (name, replacement) in variables {
        let Some(name) = name.as_str() else { continue };
        let Some(replacement) = scalar_to_string(replacement) else {
            continue;
        };
        let pattern = format!("(({name}))");
        substitute(&mut result, &pattern, &replacement);
    }
    result
}

/// Replace `pattern` with `replacement` in the string leaves of one value,
/// one mapping level deep.
fn substitute(value: &mut Value, pattern: &str, replacement: &str) {
    match value {
        Value::String(s) => {
            if s.contains(pattern) {
                *s = s.replace(pattern, replacement);
            }
        }
        Value::Sequence(items) => {
            for item in items {
                match item {
                    Value::String(s) => {
                        if s.contains(pattern) {
                            *s = s.replace(pattern, replacement);
                        }
                    }
                    Value::Mapping(map) => {
                        substitute_map_values(map, pattern, replacement);
                    }
                    _ => {}
                }
            }
        }
        Value::Mapping(map) => {
            substitute_map_values(map, pattern, replacement);
        }
        _ => {}
    }
}

/// Replace `pattern` in every string value of a mapping.
fn substitute_map_values(map: &mut Mapping, pattern: &str, replacement: &str) {
    for (_, v) in map.iter_mut() {
        if let Value::String(s) = v
            && s.contains(pattern)
        {
            *s = s.replace(pattern, replacement);
        }
    }
}

/// Render a scalar YAML value as a string; non-scalars have no textual
/// substitution form.
fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    /// Write a manifest (and optional vars file) into a temp dir and load it.
    fn load(manifest: &str, vars: Option<&str>) -> Manifest {
        let dir = tempfile::tempdir().expect("create temp dir");
        let mpath = dir.path().join("manifest.yml");
        std::fs::write(&mpath, manifest).expect("write manifest");
        let vpath = dir.path().join("vars.yml");
        if let Some(vars) = vars {
            std::fs::write(&vpath, vars).expect("write vars");
        }
        Manifest::load(&mpath, Some(&vpath)).expect("load manifest")
    }

    #[test]
    fn load_missing_manifest_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Manifest::load(&dir.path().join("manifest.yml"), None);
        assert!(matches!(result, Err(ConfigError::ManifestRead { .. })));
    }

    #[test]
    fn load_without_applications_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mpath = dir.path().join("manifest.yml");
        std::fs::write(&mpath, "version: 1\n").unwrap();
        let result = Manifest::load(&mpath, None);
        assert!(matches!(result, Err(ConfigError::NoApplications)));
    }

    #[test]
    fn list_apps_preserves_manifest_order() {
        let m = load(
            "applications:\n- name: b\n- name: a\n- name: c\n",
            None,
        );
        assert_eq!(m.list_apps(), vec!["b", "a", "c"]);
    }

    #[test]
    fn version_defaults_to_one() {
        let m = load("applications:\n- name: x\n", None);
        assert_eq!(m.version(), 1);
    }

    #[test]
    fn version_is_read_when_present() {
        let m = load("version: 2\napplications:\n- name: x\n", None);
        assert_eq!(m.version(), 2);
    }

    #[test]
    fn unknown_application_is_an_error() {
        let m = load("applications:\n- name: x\n", None);
        assert!(matches!(
            m.get_app_params("y"),
            Err(ConfigError::UnknownApplication(_))
        ));
    }

    // -----------------------------------------------------------------------
    // Default closure
    // -----------------------------------------------------------------------

    #[test]
    fn minimal_application_gets_every_default() {
        let m = load("applications:\n- name: x\n", None);
        let p = m.get_app_params("x").unwrap();
        assert!(p.buildpacks.is_empty());
        assert_eq!(p.command, "");
        assert_eq!(p.disk_quota, "2048M");
        assert!(p.docker.is_empty());
        assert_eq!(p.health_check_http_endpoint, "/");
        assert_eq!(p.health_check_type, "port");
        assert_eq!(p.instances, 1);
        assert_eq!(p.memory, "1024M");
        assert!(p.metadata.is_empty());
        assert!(!p.no_route);
        assert_eq!(p.path, "");
        assert!(p.processes.is_empty());
        assert!(!p.random_route);
        assert!(p.routes.is_empty());
        assert!(p.sidecars.is_empty());
        assert_eq!(p.stack, "cflinuxfs3");
        assert_eq!(p.timeout, 60);
        assert!(p.env.is_empty());
        assert!(p.services.is_empty());
    }

    #[test]
    fn declared_values_replace_defaults() {
        let m = load(
            "applications:\n\
             - name: x\n  \
               memory: 256M\n  \
               instances: 3\n  \
               buildpacks: [python_buildpack]\n  \
               health-check-type: http\n",
            None,
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.memory, "256M");
        assert_eq!(p.instances, 3);
        assert_eq!(p.buildpacks, vec!["python_buildpack"]);
        assert_eq!(p.health_check_type, "http");
    }

    #[test]
    fn malformed_value_falls_back_to_default() {
        let m = load(
            "applications:\n- name: x\n  instances: lots\n  routes: not-a-list\n",
            None,
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.instances, 1);
        assert!(p.routes.is_empty());
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let m = load(
            "applications:\n- name: x\n  meaning-of-life: 42\n",
            None,
        );
        assert!(m.get_app_params("x").is_ok());
    }

    // -----------------------------------------------------------------------
    // Interpolation
    // -----------------------------------------------------------------------

    #[test]
    fn route_variables_are_interpolated() {
        let m = load(
            "applications:\n- name: x\n  routes:\n  - route: ((host)).cf.local\n",
            Some("host: myapp\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.routes[0].route, "myapp.cf.local");
    }

    #[test]
    fn command_string_is_interpolated() {
        let m = load(
            "applications:\n- name: x\n  command: serve --port ((port))\n",
            Some("port: 9000\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.command, "serve --port 9000");
    }

    #[test]
    fn env_values_are_interpolated() {
        let m = load(
            "applications:\n- name: x\n  env:\n    GREETING: hello ((who))\n    COUNT: 3\n",
            Some("who: world\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.env.get("GREETING").map(String::as_str), Some("hello world"));
        assert_eq!(p.env.get("COUNT").map(String::as_str), Some("3"));
    }

    #[test]
    fn buildpack_list_entries_are_interpolated() {
        let m = load(
            "applications:\n- name: x\n  buildpacks:\n  - ((bp))\n",
            Some("bp: ruby_buildpack\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.buildpacks, vec!["ruby_buildpack"]);
    }

    #[test]
    fn multiple_occurrences_are_all_replaced() {
        let m = load(
            "applications:\n- name: x\n  command: ((v)) and ((v))\n",
            Some("v: twice\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.command, "twice and twice");
    }

    #[test]
    fn unknown_variable_is_left_verbatim() {
        let m = load(
            "applications:\n- name: x\n  command: run ((missing))\n",
            Some("host: set\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.command, "run ((missing))");
    }

    #[test]
    fn missing_vars_file_means_no_substitution() {
        let m = load(
            "applications:\n- name: x\n  command: run ((host))\n",
            None,
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.command, "run ((host))");
    }

    #[test]
    fn boolean_variable_uses_yaml_form() {
        let m = load(
            "applications:\n- name: x\n  command: flag=((flag))\n",
            Some("flag: true\n"),
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.command, "flag=true");
    }

    // -----------------------------------------------------------------------
    // Sidecars
    // -----------------------------------------------------------------------

    #[test]
    fn sidecars_expose_commands() {
        let m = load(
            "applications:\n\
             - name: x\n  \
               sidecars:\n  \
               - name: poller\n    \
                 command: poll --fast\n  \
               - name: broken\n",
            None,
        );
        let p = m.get_app_params("x").unwrap();
        assert_eq!(p.sidecars.len(), 2);
        assert_eq!(p.sidecars[0].command.as_deref(), Some("poll --fast"));
        assert_eq!(p.sidecars[1].command, None);
    }
}
