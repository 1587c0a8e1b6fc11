//! Configuration loading tests

use constellation::Config;
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_from_file() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(
        file,
        "[runtime]\n\
         max_workers = 3\n\
         global_timeout_ms = 2500\n\
         \n\
         [cache]\n\
         default_backend = \"memory\"\n\
         max_entries = 42\n\
         \n\
         [logging]\n\
         level = \"debug\"\n\
         format = \"json\""
    )
    .expect("write config");

    let config = Config::from_file(file.path().to_str().expect("utf-8 path")).expect("load");
    assert_eq!(config.runtime.max_workers, 3);
    assert_eq!(config.runtime.global_timeout_ms, Some(2_500));
    assert_eq!(config.cache.max_entries, 42);
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, "json");
}

#[test]
fn test_partial_file_fills_defaults() {
    let mut file = NamedTempFile::new().expect("temp file");
    writeln!(file, "[runtime]\nmax_workers = 2").expect("write config");

    let config = Config::from_file(file.path().to_str().expect("utf-8 path")).expect("load");
    assert_eq!(config.runtime.max_workers, 2);
    // Everything else falls back to defaults
    assert_eq!(config.runtime.global_timeout_ms, None);
    assert_eq!(config.runtime.starvation_timeout_ms, 5_000);
    assert_eq!(config.cache.default_backend, "memory");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_missing_file_uses_defaults() {
    let config = Config::from_file("/nonexistent/config.toml").expect("defaults");
    assert_eq!(config.runtime.max_workers, 8);
}
