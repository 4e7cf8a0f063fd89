use std::io::Write;

use clap::Parser;

use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.gateway.base_url.as_str(), DEFAULT_BASE_URL);
    assert_eq!(settings.gateway.timeout, Duration::from_secs(10));
    assert_eq!(settings.cache.capacity.get(), DEFAULT_CACHE_CAPACITY);
    assert_eq!(settings.cache.retry_count, 1);
    assert!(settings.gateway.token.is_none());
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.gateway.base_url = Some("http://file:8083/api/".to_string());
    raw.logging.level = Some("info".to_string());

    let overrides = Overrides {
        base_url: Some("https://cli.example/api/".to_string()),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.gateway.base_url.host_str(), Some("cli.example"));
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn blank_token_is_ignored() {
    let mut raw = RawSettings::default();
    raw.gateway.token = Some("   ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert!(settings.gateway.token.is_none());
}

#[test]
fn zero_capacity_names_the_key() {
    let mut raw = RawSettings::default();
    raw.cache.capacity = Some(0);
    match Settings::from_raw(raw) {
        Err(LoadError::Invalid { key, .. }) => assert_eq!(key, "cache.capacity"),
        other => panic!("expected invalid capacity, got {other:?}"),
    }
}

#[test]
fn non_http_base_url_is_rejected() {
    let mut raw = RawSettings::default();
    raw.gateway.base_url = Some("ftp://example.com/".to_string());
    assert!(matches!(
        Settings::from_raw(raw),
        Err(LoadError::Invalid {
            key: "gateway.base_url",
            ..
        })
    ));
}

#[test]
fn stale_overrides_accept_env_style_names() {
    let mut raw = RawSettings::default();
    raw.cache
        .stale_seconds
        .insert("BOOKS_DETAIL".to_string(), 60);
    raw.cache
        .stale_seconds
        .insert("recommendations".to_string(), 120);
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(
        settings.cache.stale_overrides.get("books.detail"),
        Some(&Duration::from_secs(60))
    );
    assert_eq!(
        settings.cache.stale_overrides.get("recommendations"),
        Some(&Duration::from_secs(120))
    );
}

#[test]
fn explicit_config_file_is_layered() {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("temp config");
    writeln!(
        file,
        "[gateway]\ntimeout_seconds = 3\n\n[cache]\ncapacity = 64\n\n[cache.stale_seconds]\nbooks_list = 30"
    )
    .expect("write config");

    let path = file.path().to_string_lossy().into_owned();
    let cli = CliArgs::parse_from(["libris-sync", "--config-file", &path, "prefs", "show"]);
    let settings = load(&cli).expect("layered settings");

    assert_eq!(settings.gateway.timeout, Duration::from_secs(3));
    assert_eq!(settings.cache.capacity.get(), 64);
    assert_eq!(
        settings.cache.stale_overrides.get("books.list"),
        Some(&Duration::from_secs(30))
    );
}
