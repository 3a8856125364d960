//! Integration tests for the runtime supervisor and the run command.
mod common;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use common::{Fixture, release_with_web, write_script};
use droplet_cli::cli::RunOpts;
use droplet_cli::logging::{Log, Logger};
use droplet_cli::supervisor::{Supervisor, aggregate_exit, scan_init_scripts};

fn run_opts(home: PathBuf) -> RunOpts {
    RunOpts {
        manifest_env: false,
        cf_fake_env: false,
        cf_k8s_env: None,
        manifest: "manifest.yml".to_string(),
        user: String::new(),
        manifest_vars: "vars.yml".to_string(),
        home,
    }
}

#[test]
fn supervisor_aggregates_init_script_exit_codes() {
    let f = Fixture::new();
    std::fs::create_dir_all(f.initd()).expect("create init.d");
    write_script(&f.initd().join("0_a.sh"), "#!/bin/sh\nexit 2\n");
    write_script(&f.initd().join("1_b.sh"), "#!/bin/sh\nexit 3\n");

    let scripts = scan_init_scripts(&f.initd()).expect("scan");
    assert_eq!(scripts.len(), 2);

    let log: Arc<dyn Log> = Arc::new(Logger::new("test", false));
    let mut sup =
        Supervisor::new(&f.home(), BTreeMap::new(), "", log).expect("create supervisor");
    for script in &scripts {
        sup.add_task(
            &script.stem,
            vec![script.path.display().to_string()],
            BTreeMap::new(),
        );
    }
    let reports = sup.run(false);
    assert_eq!(reports.len(), 2);
    assert_eq!(aggregate_exit(&reports), 5);
}

#[test]
fn staged_droplet_runs_to_completion() {
    let f = Fixture::new();
    f.write_manifest("applications:\n- name: a\n  path: ./a\n");
    f.write_app_file("a/Staticfile", "");
    f.seed_autodetect_registry("a", &release_with_web("true"));
    f.stage().expect("staging should succeed");

    let log = Arc::new(Logger::new("test", false));
    let rc = droplet_cli::commands::run::run(&run_opts(f.home()), &log)
        .expect("run should succeed");
    assert_eq!(rc, 0);
}

#[test]
fn manifest_env_wins_over_the_synthetic_environment() {
    let f = Fixture::new();
    let out = f.tmp.path().join("observed");
    f.write_manifest(
        "applications:\n\
         - name: a\n  \
           path: ./a\n  \
           env:\n    \
             MEMORY_LIMIT: 9M\n",
    );
    f.write_app_file("a/Staticfile", "");
    f.seed_autodetect_registry(
        "a",
        &release_with_web(&format!("echo $MEMORY_LIMIT > {}", out.display())),
    );
    f.stage().expect("staging should succeed");

    let log = Arc::new(Logger::new("test", false));
    let mut opts = run_opts(f.home());
    opts.cf_fake_env = true;
    opts.manifest_env = true;
    let rc = droplet_cli::commands::run::run(&opts, &log).expect("run should succeed");
    assert_eq!(rc, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "9M");
}

#[test]
fn synthetic_environment_reaches_the_application() {
    let f = Fixture::new();
    let out = f.tmp.path().join("observed");
    f.write_manifest("applications:\n- name: a\n  path: ./a\n");
    f.write_app_file("a/Staticfile", "");
    f.seed_autodetect_registry(
        "a",
        &release_with_web(&format!("echo $INSTANCE_INDEX > {}", out.display())),
    );
    f.stage().expect("staging should succeed");

    let log = Arc::new(Logger::new("test", false));
    let mut opts = run_opts(f.home());
    opts.cf_fake_env = true;
    let rc = droplet_cli::commands::run::run(&opts, &log).expect("run should succeed");
    assert_eq!(rc, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "0");
}

#[test]
fn kubernetes_environment_reaches_the_application() {
    let f = Fixture::new();
    let out = f.tmp.path().join("observed");
    f.write_manifest("applications:\n- name: a\n  path: ./a\n");
    f.write_app_file("a/Staticfile", "");
    f.seed_autodetect_registry(
        "a",
        &release_with_web(&format!("echo $INSTANCE_INDEX > {}", out.display())),
    );
    f.stage().expect("staging should succeed");

    let podinfo = f.tmp.path().join("podinfo");
    std::fs::create_dir_all(&podinfo).expect("create podinfo");
    std::fs::write(podinfo.join("MEMORY_LIMIT"), "512").expect("write");
    std::fs::write(
        podinfo.join("labels"),
        "statefulset.kubernetes.io/pod-name=\"web-3\"\n",
    )
    .expect("write");

    let log = Arc::new(Logger::new("test", false));
    let mut opts = run_opts(f.home());
    opts.cf_k8s_env = Some(podinfo);
    let rc = droplet_cli::commands::run::run(&opts, &log).expect("run should succeed");
    assert_eq!(rc, 0);
    assert_eq!(std::fs::read_to_string(&out).unwrap().trim(), "3");
}

#[test]
fn missing_droplet_manifest_is_a_setup_error() {
    let f = Fixture::new();
    std::fs::create_dir_all(f.home().join("app")).expect("create appdir");
    let log = Arc::new(Logger::new("test", false));
    let result = droplet_cli::commands::run::run(&run_opts(f.home()), &log);
    assert!(result.is_err());
}

#[test]
fn first_completion_ends_the_whole_droplet() {
    let f = Fixture::new();
    let out = f.tmp.path().join("sidecar-ran");
    // The sidecar finishes after a short sleep (long enough for the main
    // task to be spawned and registered); the main application keeps
    // sleeping and is killed by the exit-if-any policy, contributing
    // 128+9 to the sum.
    f.write_manifest(&format!(
        "applications:\n\
         - name: a\n  \
           path: ./a\n  \
           command: sleep 30\n  \
           sidecars:\n  \
           - name: poller\n    \
             command: sleep 1 && touch {}\n",
        out.display()
    ));
    f.write_app_file("a/Staticfile", "");
    f.seed_autodetect_registry("a", &release_with_web("true"));
    f.stage().expect("staging should succeed");
    assert!(f.initd().join("0_0_a.sh").is_file());

    let log = Arc::new(Logger::new("test", false));
    let started = std::time::Instant::now();
    let rc = droplet_cli::commands::run::run(&run_opts(f.home()), &log)
        .expect("run should succeed");
    assert!(
        started.elapsed() < std::time::Duration::from_secs(10),
        "exit-if-any should not wait for the sleeper"
    );
    assert_eq!(rc, 128 + 9);
    assert!(out.is_file(), "sidecar command should have run");
}
