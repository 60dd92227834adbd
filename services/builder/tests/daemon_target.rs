//! Integration tests for building to the local daemon.
//!
//! A shell script stands in for the `docker` CLI so the tests can observe
//! what the subprocess received and control how it exits.

#![cfg(unix)]

use std::collections::{BTreeMap, HashMap};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rstest::rstest;
use tempfile::TempDir;
use tokio::sync::watch;

use stevedore_builder::{
    BuildContext, BuildError, BuildSettings, DaemonTarget, ImageReference, LayerCache, LayerEntry,
    LayerSource, Stage,
};

/// Write an executable fake `docker` script.
fn fake_docker(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("docker");
    // Written and closed before it is ever executed.
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn test_context(temp_dir: &TempDir, settings: BuildSettings) -> Arc<BuildContext> {
    let cache = Arc::new(LayerCache::open(temp_dir.path().join("cache")).unwrap());
    BuildContext::builder(cache)
        .layer(
            LayerSource::new("app")
                .with_entry(LayerEntry::bytes("/app/run.sh", "#!/bin/sh\necho hi\n").with_mode(0o755)),
        )
        .settings(settings)
        .build()
}

fn read_env_dump(path: &Path) -> HashMap<String, String> {
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn test_successful_load_reports_tag() {
    let temp_dir = TempDir::new().unwrap();
    let archive = temp_dir.path().join("received.tar");
    let exe = fake_docker(
        temp_dir.path(),
        &format!(r#"[ "$1" = load ] || exit 64; cat > "{}""#, archive.display()),
    );

    let mut target = DaemonTarget::named("myimage:latest").unwrap();
    target.set_executable(&exe);

    let plan = target.to_build_plan(test_context(&temp_dir, BuildSettings::default()));
    let result = plan.execute().await.unwrap();

    assert_eq!(result.tag.as_deref(), Some("myimage:latest"));
    assert_eq!(result.layers.len(), 1);

    // The daemon received a docker-save archive naming the tag.
    let mut tar = tar::Archive::new(std::fs::File::open(&archive).unwrap());
    let names: Vec<String> = tar
        .entries()
        .unwrap()
        .map(|e| e.unwrap().path().unwrap().display().to_string())
        .collect();
    assert!(names.contains(&"manifest.json".to_string()));
}

#[tokio::test]
async fn test_daemon_failure_carries_stderr() {
    let temp_dir = TempDir::new().unwrap();
    let exe = fake_docker(temp_dir.path(), "echo 'no such image' >&2; exit 1");

    let mut target = DaemonTarget::named("myimage:latest").unwrap();
    target.set_executable(&exe);

    let err = target
        .to_build_plan(test_context(&temp_dir, BuildSettings::default()))
        .execute()
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Deliver);
    assert!(matches!(err.error, BuildError::Daemon { exit_code: Some(1), .. }));
    assert!(err.error.daemon_stderr().unwrap().contains("no such image"));
    assert!(err.to_string().contains("no such image"));
}

#[tokio::test]
async fn test_missing_executable_is_unavailable() {
    let temp_dir = TempDir::new().unwrap();

    let mut target = DaemonTarget::named("myimage").unwrap();
    target.set_executable(temp_dir.path().join("no-such-docker"));

    let err = target
        .to_build_plan(test_context(&temp_dir, BuildSettings::default()))
        .execute()
        .await
        .unwrap_err();

    assert_eq!(err.stage, Stage::Deliver);
    assert_eq!(err.error.reason_code(), "daemon_unavailable");
}

#[tokio::test]
async fn test_slow_daemon_times_out() {
    let temp_dir = TempDir::new().unwrap();
    let exe = fake_docker(temp_dir.path(), "cat > /dev/null; sleep 30");

    let mut target = DaemonTarget::named("myimage").unwrap();
    target.set_executable(&exe);

    let settings = BuildSettings {
        daemon_timeout: Some(Duration::from_millis(300)),
        ..Default::default()
    };
    let start = Instant::now();
    let err = target
        .to_build_plan(test_context(&temp_dir, settings))
        .execute()
        .await
        .unwrap_err();

    assert!(matches!(err.error, BuildError::DaemonTimeout { .. }));
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_non_empty_environment_replaces_inherited() {
    let temp_dir = TempDir::new().unwrap();
    let dump = temp_dir.path().join("env.txt");
    let exe = fake_docker(
        temp_dir.path(),
        &format!(r#"cat > /dev/null; /usr/bin/env > "{}""#, dump.display()),
    );

    let mut target = DaemonTarget::named("myimage").unwrap();
    target.set_executable(&exe).set_environment(BTreeMap::from([
        ("PATH".to_string(), "/usr/bin:/bin".to_string()),
        ("STEVEDORE_PROBE".to_string(), "1".to_string()),
    ]));

    target
        .to_build_plan(test_context(&temp_dir, BuildSettings::default()))
        .execute()
        .await
        .unwrap();

    let seen = read_env_dump(&dump);
    assert_eq!(seen.get("STEVEDORE_PROBE").map(String::as_str), Some("1"));

    // Shells may export a few bookkeeping variables of their own.
    let shell_vars = ["PATH", "PWD", "OLDPWD", "SHLVL", "_"];
    for (name, _) in std::env::vars() {
        if shell_vars.contains(&name.as_str()) {
            continue;
        }
        assert!(!seen.contains_key(&name), "inherited variable {name} leaked");
    }
}

#[tokio::test]
async fn test_cleared_environment_inherits_again() {
    let temp_dir = TempDir::new().unwrap();
    let dump = temp_dir.path().join("env.txt");
    let exe = fake_docker(
        temp_dir.path(),
        &format!(r#"cat > /dev/null; env > "{}""#, dump.display()),
    );

    let mut target = DaemonTarget::named("myimage").unwrap();
    target
        .set_executable(&exe)
        .set_environment(BTreeMap::from([("STEVEDORE_PROBE".to_string(), "1".to_string())]))
        .set_environment(BTreeMap::new());

    target
        .to_build_plan(test_context(&temp_dir, BuildSettings::default()))
        .execute()
        .await
        .unwrap();

    let seen = read_env_dump(&dump);
    assert!(!seen.contains_key("STEVEDORE_PROBE"));

    let (name, value) = std::env::vars()
        .find(|(name, value)| {
            !name.is_empty() && !value.contains('\n') && !["PWD", "OLDPWD", "SHLVL", "_"].contains(&name.as_str())
        })
        .expect("test process has environment variables");
    assert_eq!(seen.get(&name), Some(&value));
}

#[tokio::test]
async fn test_plan_uses_settings_snapshot() {
    let temp_dir = TempDir::new().unwrap();
    let exe = fake_docker(temp_dir.path(), "cat > /dev/null");

    let mut target = DaemonTarget::named("myimage").unwrap();
    target.set_executable(&exe);
    let plan = target.to_build_plan(test_context(&temp_dir, BuildSettings::default()));

    // Later changes to the target do not reach an existing plan.
    target.set_executable(temp_dir.path().join("no-such-docker"));

    let result = plan.execute().await.unwrap();
    assert_eq!(result.tag.as_deref(), Some("myimage:latest"));
}

#[tokio::test]
async fn test_cancellation_kills_daemon() {
    let temp_dir = TempDir::new().unwrap();
    let exe = fake_docker(temp_dir.path(), "cat > /dev/null; sleep 30");

    let mut target = DaemonTarget::named("myimage").unwrap();
    target.set_executable(&exe);
    let plan = target.to_build_plan(test_context(&temp_dir, BuildSettings::default()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let _ = shutdown_tx.send(true);
    });

    let start = Instant::now();
    let err = plan.execute_until(shutdown_rx).await.unwrap_err();

    assert!(matches!(err.error, BuildError::Cancelled));
    assert_eq!(err.stage, Stage::Deliver);
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn test_invalid_reference_fails_at_construction() {
    let err: BuildError = DaemonTarget::named("bad ref!!").unwrap_err().into();
    assert_eq!(err.reason_code(), "invalid_reference");
}

#[rstest]
#[case("myimage:latest")]
#[case("myimage")]
#[case("ghcr.io/org/app:1.2.3")]
#[case("localhost:5000/team/app")]
#[case("quay.io/org/app@sha256:a3ed95caeb02ffe68cdd9fd84406680ae93d633cb16422d00e8a7c22955b46d4")]
fn test_image_configuration_round_trip(#[case] reference: &str) {
    let target = DaemonTarget::named(reference).unwrap();
    assert_eq!(
        target.to_image_configuration().reference(),
        &ImageReference::parse(reference).unwrap()
    );
}
