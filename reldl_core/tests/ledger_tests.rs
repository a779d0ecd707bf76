use std::collections::BTreeSet;

use reldl_core::downloader::ledger::{sidecar_path, FileLedger, MemoryLedger, ResumeLedger};
use reldl_core::types::types::{file_name_from_url, ContentDescriptor, LedgerKey, Validator};

fn key(validator: &str) -> LedgerKey {
    let descriptor = ContentDescriptor {
        total_size: Some(20),
        supports_ranges: true,
        validator: Some(Validator::ETag(validator.to_string())),
        integrity_hash: None,
    };
    LedgerKey::new("http://example.com/file.bin#section", &descriptor, Some(8))
}

fn set(indices: &[u32]) -> BTreeSet<u32> {
    indices.iter().copied().collect()
}

#[test]
fn test_sidecar_sits_next_to_output() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");
    assert_eq!(sidecar_path(&output), dir.path().join("out.bin.reldl.json"));
}

#[test]
fn test_key_drops_url_fragment() {
    assert_eq!(key("a").url, "http://example.com/file.bin");
}

#[test]
fn test_file_name_from_url() {
    assert_eq!(file_name_from_url("https://host/dir/big.iso?x=1#top").as_deref(), Some("big.iso"));
    assert_eq!(file_name_from_url("https://host/dir/sub/").as_deref(), Some("sub"));
    assert_eq!(file_name_from_url("https://host/"), None);
    assert_eq!(file_name_from_url("not a url"), None);
}

#[tokio::test]
async fn test_file_ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");

    let ledger = FileLedger::for_output(&output);
    ledger.mark_completed(&key("v1"), 0).await.unwrap();
    ledger.mark_completed(&key("v1"), 2).await.unwrap();
    assert!(ledger.path().exists());

    let reopened = FileLedger::for_output(&output);
    assert_eq!(reopened.load(&key("v1")).await.unwrap(), set(&[0, 2]));
}

#[tokio::test]
async fn test_mark_completed_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::for_output(dir.path().join("out.bin"));

    ledger.mark_completed(&key("v1"), 1).await.unwrap();
    ledger.mark_completed(&key("v1"), 1).await.unwrap();
    assert_eq!(ledger.load(&key("v1")).await.unwrap(), set(&[1]));
}

#[tokio::test]
async fn test_changed_validator_reads_as_nothing_completed() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::for_output(dir.path().join("out.bin"));

    ledger.mark_completed(&key("v1"), 0).await.unwrap();
    assert!(ledger.load(&key("v2")).await.unwrap().is_empty());

    // Marking under the new key starts a fresh record.
    ledger.mark_completed(&key("v2"), 1).await.unwrap();
    assert_eq!(ledger.load(&key("v2")).await.unwrap(), set(&[1]));
    assert!(ledger.load(&key("v1")).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_changed_chunk_size_reads_as_nothing_completed() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::for_output(dir.path().join("out.bin"));
    ledger.mark_completed(&key("v1"), 0).await.unwrap();

    let mut other = key("v1");
    other.chunk_size = Some(16);
    assert!(ledger.load(&other).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalidate_removes_sidecar() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::for_output(dir.path().join("out.bin"));

    ledger.mark_completed(&key("v1"), 0).await.unwrap();
    ledger.invalidate(&key("v1")).await.unwrap();

    assert!(!ledger.path().exists());
    assert!(ledger.load(&key("v1")).await.unwrap().is_empty());
    // Removing an absent sidecar is fine.
    ledger.invalidate(&key("v1")).await.unwrap();
}

#[tokio::test]
async fn test_corrupt_sidecar_is_treated_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.bin");
    std::fs::write(sidecar_path(&output), b"{ not json").unwrap();

    let ledger = FileLedger::for_output(&output);
    assert!(ledger.load(&key("v1")).await.unwrap().is_empty());

    ledger.mark_completed(&key("v1"), 2).await.unwrap();
    assert_eq!(ledger.load(&key("v1")).await.unwrap(), set(&[2]));
}

#[tokio::test]
async fn test_sidecar_is_plain_json() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = FileLedger::for_output(dir.path().join("out.bin"));
    ledger.mark_completed(&key("v1"), 1).await.unwrap();
    ledger.mark_completed(&key("v1"), 0).await.unwrap();

    let text = std::fs::read_to_string(ledger.path()).unwrap();
    let json: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(json["completed"], serde_json::json!([0, 1]));
    assert_eq!(json["key"]["chunk_size"], serde_json::json!(8));

    // No temp files are left behind.
    let leftovers = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .count();
    assert_eq!(leftovers, 0);
}

#[tokio::test]
async fn test_memory_ledger() {
    let ledger = MemoryLedger::new();
    assert!(ledger.load(&key("v1")).await.unwrap().is_empty());

    ledger.mark_completed(&key("v1"), 3).await.unwrap();
    ledger.mark_completed(&key("v1"), 1).await.unwrap();
    assert_eq!(ledger.load(&key("v1")).await.unwrap(), set(&[1, 3]));
    assert!(ledger.load(&key("v2")).await.unwrap().is_empty());

    ledger.invalidate(&key("v1")).await.unwrap();
    assert!(ledger.load(&key("v1")).await.unwrap().is_empty());
}
