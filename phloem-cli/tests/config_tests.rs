//! Tests for loading client settings from files and flags

use phloem_cli::config::{load, ConfigSources};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes()).expect("Failed to write config");
    file
}

#[test]
fn test_load_local_cluster_profile() {
    let config = load(&ConfigSources {
        file: Some(Path::new("../profiles/local-cluster.toml")),
        ..Default::default()
    })
    .expect("Failed to load local-cluster profile");

    assert_eq!(config.seeds.len(), 3);
    assert_eq!(config.seeds[0], "127.0.0.1:30001");
    assert_eq!(config.connect_timeout, Duration::from_millis(500));
    assert_eq!(config.command_timeout, Some(Duration::from_secs(2)));
    assert!(config.add_replicas);
    assert!(!config.use_cluster_slots);
}

#[test]
fn test_seeds_flag_replaces_file_seeds() {
    let file = write_config(
        r#"
seeds = ["10.0.0.1:7000"]
max_retry_count = 3
password = "secret"
"#,
    );
    let config = load(&ConfigSources {
        file: Some(file.path()),
        overrides: &[],
        seeds: Some("127.0.0.1:7000,127.0.0.1:7001"),
    })
    .unwrap();

    assert_eq!(config.seeds, vec!["127.0.0.1:7000".to_string(), "127.0.0.1:7001".to_string()]);
    assert_eq!(config.max_retry_count, 3);
    assert_eq!(config.password.as_deref(), Some("secret"));
}

#[test]
fn test_override_wins_over_file() {
    let file = write_config("seeds = [\"127.0.0.1:7000\"]\nselect_db = 2\n");
    let overrides = vec!["select_db=0".to_string(), "refresh_throttle=5s".to_string()];
    let config = load(&ConfigSources {
        file: Some(file.path()),
        overrides: &overrides,
        seeds: None,
    })
    .unwrap();

    assert_eq!(config.select_db, 0);
    assert_eq!(config.refresh_throttle, Duration::from_secs(5));
}

#[test]
fn test_unknown_field_rejected() {
    let file = write_config("seeds = [\"127.0.0.1:7000\"]\nretries = 3\n");
    let err = load(&ConfigSources { file: Some(file.path()), ..Default::default() }).unwrap_err();
    assert!(format!("{err:#}").contains("retries"));
}

#[test]
fn test_invalid_values_rejected() {
    let zero_retries = write_config("seeds = [\"127.0.0.1:7000\"]\nmax_retry_count = 0\n");
    assert!(load(&ConfigSources { file: Some(zero_retries.path()), ..Default::default() }).is_err());

    let bad_seed = write_config("seeds = [\"127.0.0.1\"]\n");
    assert!(load(&ConfigSources { file: Some(bad_seed.path()), ..Default::default() }).is_err());

    let user_only = write_config("seeds = [\"127.0.0.1:7000\"]\nusername = \"app\"\n");
    assert!(load(&ConfigSources { file: Some(user_only.path()), ..Default::default() }).is_err());
}

#[test]
fn test_missing_file() {
    let err = load(&ConfigSources {
        file: Some(Path::new("/nonexistent/phloem.toml")),
        ..Default::default()
    })
    .unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}

#[test]
fn test_malformed_file() {
    let file = write_config("seeds = [\"127.0.0.1:7000\"\n");
    let err = load(&ConfigSources { file: Some(file.path()), ..Default::default() }).unwrap_err();
    assert!(err.to_string().contains("Failed to parse config file"));
}
