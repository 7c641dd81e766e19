//! Configuration loading from files.

use meshcast::config::Config;
use meshcast::telemetry;
use std::fs;
use tempfile::tempdir;

#[test]
fn toml_file_loads_and_validates() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meshcast.toml");
    fs::write(
        &path,
        r#"
[dispatch]
max_ttl_seconds = 3600
store_queue_depth = 16

[cluster]
flush_interval_ms = 10
frame_pool_size = 8

[fanout]
bloom_capacity = 256
bloom_fp_rate = 0.05
pool_size = 4

[telemetry]
log_level = "meshcast=debug"
"#,
    )
    .unwrap();
    let cfg = Config::load(&path).unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.dispatch.max_ttl_seconds, 3600);
    assert_eq!(cfg.cluster.frame_pool_size, 8);
    let options = cfg.dispatch_options();
    assert_eq!(options.max_ttl, 3600);
    assert_eq!(options.bloom_capacity, 256);
    assert_eq!(options.filter_pool_size, 4);
    assert_eq!(cfg.telemetry.log_level, "meshcast=debug");
}

#[test]
fn json_file_is_detected_by_extension() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("meshcast.json");
    fs::write(&path, r#"{"cluster": {"flush_interval_ms": 25}}"#).unwrap();
    let cfg = Config::load(&path).unwrap();
    assert_eq!(cfg.cluster.flush_interval_ms, 25);
    assert_eq!(cfg.fanout.pool_size, 32);
}

#[test]
fn missing_and_malformed_files_report_the_path() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("absent.toml");
    let err = Config::load(&missing).unwrap_err();
    assert!(format!("{err:?}").contains("unable to read config"));

    let broken = dir.path().join("broken.toml");
    fs::write(&broken, "[cluster\nframe_capacity = ").unwrap();
    let err = Config::load(&broken).unwrap_err();
    assert!(format!("{err:?}").contains("invalid TOML config"));
}

#[test]
fn env_selects_config_file_and_log_level() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("env.toml");
    fs::write(&path, "[telemetry]\nlog_level = \"warn\"\n").unwrap();
    std::env::set_var("MESHCAST_CONFIG", &path);
    std::env::set_var("MESHCAST_LOG_LEVEL", "debug");
    let cfg = Config::load_from_env();
    std::env::remove_var("MESHCAST_CONFIG");
    std::env::remove_var("MESHCAST_LOG_LEVEL");
    assert_eq!(cfg.unwrap().telemetry.log_level, "debug");
}

#[test]
fn tracing_installs_once() {
    let cfg = Config::default();
    let handle = telemetry::init_tracing(&cfg.telemetry).unwrap();
    telemetry::set_level(&handle, "meshcast=trace").unwrap();
    assert!(telemetry::init_tracing(&cfg.telemetry).is_err());
}
