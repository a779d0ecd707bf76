use std::time::Duration;

use reldl_core::config::{DownloadOptions, FileDownloadSettings, DEFAULT_CHUNK_SIZE};
use reldl_core::types::error::DownloadError;

#[test]
fn test_defaults_are_valid() {
    let options = DownloadOptions::default();
    options.validate().unwrap();
    assert_eq!(options.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
    assert_eq!(options.max_concurrency, 4);
    assert_eq!(options.max_attempts, 5);
    assert_eq!(options.session_timeout(), None);
    assert!(options.verify_integrity);
}

#[test]
fn test_builder_methods() {
    let options = DownloadOptions::default()
        .with_chunk_size(1024)
        .with_max_concurrency(2)
        .with_max_attempts(7)
        .with_retry_delays(Duration::from_millis(10), Duration::from_millis(40))
        .with_session_timeout(Some(Duration::from_secs(3)));

    assert_eq!(options.chunk_size_bytes, 1024);
    assert_eq!(options.max_concurrency, 2);
    assert_eq!(options.max_attempts, 7);
    assert_eq!(options.base_retry_delay(), Duration::from_millis(10));
    assert_eq!(options.max_retry_delay(), Duration::from_millis(40));
    assert_eq!(options.session_timeout(), Some(Duration::from_secs(3)));
}

#[test]
fn test_validate_rejects_nonsense() {
    let bad = [
        DownloadOptions::default().with_chunk_size(0),
        DownloadOptions::default().with_max_concurrency(0),
        DownloadOptions::default().with_max_attempts(0),
        DownloadOptions::default().with_retry_jitter(1.5),
        DownloadOptions::default().with_retry_delays(Duration::from_secs(5), Duration::from_secs(1)),
        DownloadOptions::default().with_session_timeout(Some(Duration::ZERO)),
    ];
    for options in bad {
        assert!(
            matches!(options.validate(), Err(DownloadError::InvalidOptions(_))),
            "{:?}",
            options
        );
    }
}

#[test]
fn test_settings_partial_options_use_defaults() {
    let settings = FileDownloadSettings::from_json(
        r#"{ "source_url": "http://host/a.bin", "options": { "max_concurrency": 8 } }"#,
    )
    .unwrap();

    assert_eq!(settings.source_url.as_deref(), Some("http://host/a.bin"));
    assert_eq!(settings.destination, None);
    assert_eq!(settings.options.max_concurrency, 8);
    assert_eq!(settings.options.chunk_size_bytes, DEFAULT_CHUNK_SIZE);
}

#[test]
fn test_settings_without_options_section() {
    let settings = FileDownloadSettings::from_json(r#"{ "destination": "x.bin" }"#).unwrap();
    assert_eq!(settings.options, DownloadOptions::default());
}

#[test]
fn test_settings_bad_json() {
    assert!(matches!(
        FileDownloadSettings::from_json("{"),
        Err(DownloadError::InvalidOptions(_))
    ));
}

#[tokio::test]
async fn test_settings_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("job.json");
    std::fs::write(&path, r#"{ "options": { "verify_integrity": false } }"#).unwrap();

    let settings = FileDownloadSettings::load(&path).await.unwrap();
    assert!(!settings.options.verify_integrity);
}
