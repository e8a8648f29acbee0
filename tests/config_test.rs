use surge_rs::config::Config;

// Env vars are process-wide; keep every env mutation in this one test.
#[test]
fn config_from_env_applies_overrides() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("surge.toml");
    std::fs::write(
        &file,
        "[queues]\nmessage = 10\n\n[stats]\ninterval_secs = 5\n",
    )
    .unwrap();

    unsafe {
        std::env::set_var("SURGE_CONFIG", &file);
        std::env::set_var("SURGE_DATA_DIR", dir.path().join("data"));
        std::env::set_var("LOG_LEVEL", "debug");
        std::env::remove_var("OTEL_ENDPOINT");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.queues.message, 10);
    assert_eq!(config.queues.callback, 500);
    assert_eq!(config.stats.interval_secs, 5);
    assert_eq!(config.store.root, dir.path().join("data"));
    assert_eq!(config.log_level.0, "debug");
    assert!(config.otel_endpoint.is_none());

    // A broken config file is an error, not a silent default.
    std::fs::write(&file, "[queues\n").unwrap();
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("SURGE_CONFIG");
        std::env::remove_var("SURGE_DATA_DIR");
        std::env::remove_var("LOG_LEVEL");
    }

    let config = Config::from_env().unwrap();
    assert_eq!(config.queues.message, 1000);
    assert_eq!(config.log_level.0, "info");
}
