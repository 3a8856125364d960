//! Synthesis of the Cloud Foundry environment variable contract.
//!
//! Three flavours are produced: staging variables, a synthetic local
//! runtime set, and a runtime set derived from a Kubernetes downward API
//! directory. In every flavour a variable already present in the process
//! environment wins over the computed value.
use std::collections::BTreeMap;
use std::net::UdpSocket;
use std::path::Path;
use std::sync::Arc;

use serde_json::json;
use uuid::Uuid;

use crate::logging::Log;
use crate::manifest::ApplicationParams;

/// Derive the instance IP by connecting a UDP socket towards a public
/// resolver address; no packets are sent. Falls back to `127.0.0.1`.
#[must_use]
pub fn internal_ip() -> String {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("1.1.1.1:53")?;
            s.local_addr()
        })
        .map_or_else(|_| "127.0.0.1".to_string(), |addr| addr.ip().to_string())
}

/// The application port: `APP_PORT` when parseable, `8080` otherwise.
#[must_use]
pub fn app_port() -> String {
    let raw = std::env::var("APP_PORT").unwrap_or_else(|_| "8080".to_string());
    if raw.parse::<u16>().is_ok() {
        raw
    } else {
        "8080".to_string()
    }
}

/// JSON mapping of the instance's external and internal ports.
#[must_use]
pub fn instance_ports_json() -> String {
    let port: i64 = app_port().parse().unwrap_or(8080);
    json!([{"external": 80, "internal": port}]).to_string()
}

/// UUID v5 over the DNS namespace, the identity scheme for synthetic
/// instance and space GUIDs.
#[must_use]
pub fn name_uuid(name: &str) -> String {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
}

/// Application URIs: `APP_URIS` split on commas (empty entries dropped)
/// unioned with the manifest routes.
fn collect_uris(default_uris: &str, params: &ApplicationParams) -> Vec<String> {
    let mut uris: Vec<String> = std::env::var("APP_URIS")
        .unwrap_or_else(|_| default_uris.to_string())
        .split(',')
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect();
    uris.extend(params.routes.iter().map(|r| r.route.clone()));
    uris
}

/// The application name: `APP_NAME` when set and non-empty, the manifest
/// name otherwise.
fn app_name(name: &str) -> String {
    match std::env::var("APP_NAME") {
        Ok(v) if !v.is_empty() => v,
        _ => name.to_string(),
    }
}

/// `VCAP_APPLICATION` for staging and the synthetic local runtime.
///
/// The runtime flavour additionally carries `instance_id` and
/// `instance_index`.
fn vcap_application_json(name: &str, params: &ApplicationParams, runtime: bool) -> String {
    let default_uris = if runtime { "app.cf.local" } else { "" };
    let default_api = if runtime {
        "https://api.cf.local"
    } else {
        "https://api.cf"
    };
    let app_name = app_name(name);
    let space = std::env::var("CF_SPACE").unwrap_or_else(|_| "null".to_string());
    let org = std::env::var("CF_ORG").unwrap_or_else(|_| "null".to_string());
    let version = std::env::var("APP_VERSION").unwrap_or_else(|_| "latest".to_string());
    let uris = collect_uris(default_uris, params);
    let mut vcap = json!({
        "cf_api": std::env::var("CF_API").unwrap_or_else(|_| default_api.to_string()),
        "limits": {
            "fds": 16384,
            "mem": params.memory,
            "disk": params.disk_quota,
        },
        "users": "null",
        "name": app_name.clone(),
        "application_name": app_name.clone(),
        "application_id": name_uuid(&app_name),
        "version": version.clone(),
        "application_version": version,
        "uris": uris.clone(),
        "application_uris": uris,
        "space_name": space.clone(),
        "space_id": name_uuid(&space),
        "organization_id": org.clone(),
        "organization_name": org,
    });
    if runtime
        && let Some(map) = vcap.as_object_mut()
    {
        map.insert("instance_id".to_string(), json!(name_uuid(&app_name)));
        map.insert("instance_index".to_string(), json!("0"));
    }
    vcap.to_string()
}

/// Overlay the computed variables with any value already present in the
/// process environment; the observed value wins and the decision is logged.
fn override_with_environ(
    computed: Vec<(&'static str, String)>,
    log: &Arc<dyn Log>,
) -> BTreeMap<String, String> {
    let mut env_vars = BTreeMap::new();
    for (key, value) in computed {
        if let Ok(observed) = std::env::var(key) {
            log.debug(&format!("Environment variable already defined: {key}={observed}"));
            env_vars.insert(key.to_string(), observed);
        } else {
            log.debug(&format!("Defining environment variable: {key}={value}"));
            env_vars.insert(key.to_string(), value);
        }
    }
    env_vars
}

/// The staging environment variable set.
#[must_use]
pub fn staging_vars(
    name: &str,
    params: &ApplicationParams,
    log: &Arc<dyn Log>,
) -> BTreeMap<String, String> {
    let ip = internal_ip();
    let port = app_port();
    let computed = vec![
        ("MEMORY_LIMIT", params.memory.clone()),
        ("LANG", "en_US.UTF-8".to_string()),
        ("CF_INSTANCE_INDEX", "0".to_string()),
        ("CF_INSTANCE_IP", ip.clone()),
        ("CF_INSTANCE_PORT", port.clone()),
        ("CF_INSTANCE_ADDR", format!("{ip}:{port}")),
        ("CF_INSTANCE_INTERNAL_IP", ip),
        ("CF_INSTANCE_PORTS", instance_ports_json()),
        ("CF_STACK", params.stack.clone()),
        ("VCAP_APPLICATION", vcap_application_json(name, params, false)),
        ("VCAP_PLATFORM_OPTIONS", "{}".to_string()),
        (
            "VCAP_SERVICES",
            std::env::var("CF_VCAP_SERVICES").unwrap_or_else(|_| "{}".to_string()),
        ),
    ];
    override_with_environ(computed, log)
}

/// The synthetic local runtime environment variable set.
#[must_use]
pub fn runtime_vars(
    name: &str,
    params: &ApplicationParams,
    log: &Arc<dyn Log>,
) -> BTreeMap<String, String> {
    let ip = internal_ip();
    let port = app_port();
    let guid = name_uuid(name);
    let computed = vec![
        ("MEMORY_LIMIT", params.memory.clone()),
        ("PORT", port.clone()),
        ("DATABASE_URL", String::new()),
        ("INSTANCE_INDEX", "0".to_string()),
        ("INSTANCE_GUID", guid.clone()),
        ("CF_INSTANCE_GUID", guid),
        ("CF_INSTANCE_INDEX", "0".to_string()),
        ("CF_INSTANCE_IP", ip.clone()),
        ("CF_INSTANCE_PORT", port.clone()),
        ("CF_INSTANCE_ADDR", format!("{ip}:{port}")),
        ("CF_INSTANCE_INTERNAL_IP", ip),
        ("CF_INSTANCE_PORTS", instance_ports_json()),
        ("VCAP_APPLICATION", vcap_application_json(name, params, true)),
        ("VCAP_PLATFORM_OPTIONS", "{}".to_string()),
        (
            "VCAP_SERVICES",
            std::env::var("CF_VCAP_SERVICES").unwrap_or_else(|_| "{}".to_string()),
        ),
    ];
    override_with_environ(computed, log)
}

/// Parse a downward API `KEY="VALUE"` line file into a map.
fn keys_values_from_file(path: &Path) -> BTreeMap<String, String> {
    let Ok(text) = std::fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    text.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once('=')?;
            Some((
                name.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

/// Read a single downward API value file.
fn value_from_file(path: &Path) -> std::io::Result<String> {
    Ok(std::fs::read_to_string(path)?.trim().to_string())
}

/// The runtime environment variable set derived from a Kubernetes downward
/// API directory (`annotations`, `labels`, `MEMORY_LIMIT`, `CPU_LIMIT`,
/// `INSTANCE_GUID` files).
///
/// # Errors
///
/// Returns an error if `dir` is not a directory. Individual unreadable
/// files fall back to their documented defaults.
pub fn k8s_vars(
    name: &str,
    params: &ApplicationParams,
    dir: &Path,
    log: &Arc<dyn Log>,
) -> std::io::Result<BTreeMap<String, String>> {
    if !dir.is_dir() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("downward API directory not found: {}", dir.display()),
        ));
    }
    let annotations = keys_values_from_file(&dir.join("annotations"));
    let labels = keys_values_from_file(&dir.join("labels"));

    // Memory limit comes from the API in megabytes.
    let memory_limit = value_from_file(&dir.join("MEMORY_LIMIT")).unwrap_or_else(|e| {
        log.error(&format!(
            "Unable to read downward API file: {e}. Falling back to default value."
        ));
        "1024".to_string()
    });
    let cpu_limit = value_from_file(&dir.join("CPU_LIMIT")).unwrap_or_else(|e| {
        log.error(&format!(
            "Unable to read downward API file: {e}. Falling back to 1 CPU."
        ));
        "1".to_string()
    });
    let uid = value_from_file(&dir.join("INSTANCE_GUID")).unwrap_or_else(|e| {
        log.error(&format!(
            "Unable to read downward API file: {e}. Deriving GUID from application name."
        ));
        name_uuid(name)
    });
    let instance_index = labels
        .get("statefulset.kubernetes.io/pod-name")
        .and_then(|pod| pod.rsplit_once('-').map(|(_, idx)| idx.to_string()))
        .unwrap_or_else(|| {
            log.error("Unable to calculate instance index. Setting to 0");
            "0".to_string()
        });

    let ip = internal_ip();
    let port = app_port();
    let app_name = app_name(name);
    let uris: Vec<String> = annotations
        .iter()
        .filter(|(k, _)| k.starts_with("kubefoundry/route"))
        .map(|(_, v)| v.clone())
        .collect();
    let space = annotations.get("kubefoundry/space").cloned().unwrap_or_else(|| {
        std::env::var("CF_SPACE").unwrap_or_else(|_| "null".to_string())
    });
    let org = annotations.get("kubefoundry/org").cloned().unwrap_or_else(|| {
        std::env::var("CF_ORG").unwrap_or_else(|_| "null".to_string())
    });
    let version = annotations
        .get("kubefoundry/version.0")
        .cloned()
        .unwrap_or_else(|| std::env::var("APP_VERSION").unwrap_or_else(|_| "latest".to_string()));
    let mem_bytes = memory_limit.parse::<i64>().unwrap_or(1024) * 1_048_576;
    let vcap = json!({
        "cf_api": std::env::var("CF_API")
            .unwrap_or_else(|_| "https://kubefoundry.local".to_string()),
        "limits": {
            "fds": 16384,
            "mem": mem_bytes,
            "disk": 4000 * 1_048_576_i64,
        },
        "users": "null",
        "name": app_name.clone(),
        "instance_id": uid.clone(),
        "instance_index": instance_index.clone(),
        "application_name": app_name,
        "application_id": annotations.get("kubefoundry/appuid.0").cloned()
            .unwrap_or_else(|| uid.clone()),
        "version": version.clone(),
        "application_version": version,
        "uris": uris.clone(),
        "application_uris": uris,
        "space_name": space.clone(),
        "space_id": name_uuid(&space),
        "organization_name": org.clone(),
        "organization_id": name_uuid(&org),
    });

    let computed = vec![
        ("PORT", port.clone()),
        ("CPU_LIMIT", cpu_limit),
        ("MEMORY_LIMIT", format!("{memory_limit}M")),
        ("INSTANCE_INDEX", instance_index.clone()),
        ("INSTANCE_GUID", uid.clone()),
        ("CF_INSTANCE_GUID", uid),
        ("CF_INSTANCE_INDEX", instance_index),
        ("CF_INSTANCE_IP", ip.clone()),
        ("CF_INSTANCE_PORT", port.clone()),
        ("CF_INSTANCE_ADDR", format!("{ip}:{port}")),
        ("CF_INSTANCE_INTERNAL_IP", ip),
        ("CF_INSTANCE_PORTS", instance_ports_json()),
        ("VCAP_APPLICATION", vcap.to_string()),
    ];
    Ok(override_with_environ(computed, log))
}
