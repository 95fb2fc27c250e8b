//! Result store integration tests.
//!
//! Exercises the stores built from configuration, the way the binary builds them.

use db_relay::config::{StoreConfig, StoreKind};
use db_relay::store::{build_store, open_reader, open_uploader, StoreBackend};
use futures::TryStreamExt;

fn object_config(dir: &tempfile::TempDir) -> StoreConfig {
    StoreConfig {
        backend: StoreKind::Object,
        object_url: Some(format!("file://{}", dir.path().display())),
        part_size: 7,
        ..StoreConfig::default()
    }
}

/// Scenario: Multi-byte text split across upload parts
/// Given an object store with a tiny part size
/// When a result with multi-byte characters is uploaded
/// Then reading it back yields the original lines intact
#[tokio::test]
async fn test_object_store_round_trip_with_multibyte_text() {
    let dir = tempfile::tempdir().unwrap();
    let store = build_store(&object_config(&dir)).await.unwrap();
    assert_eq!(store.backend(), StoreBackend::ObjectMultipart);

    let mut uploader = open_uploader(&store, "results/q/0/result.csv");
    uploader.start().await.unwrap();
    for chunk in ["city,price\n", "Zürich,12€\n", "東京,¥900\n"] {
        assert!(uploader.write(chunk).await.unwrap());
    }
    let entry = uploader.end().await.unwrap();
    assert_eq!(store.key_from_uri(&entry.uri).as_deref(), Some("results/q/0/result.csv"));

    let mut reader = open_reader(&store, "results/q/0/result.csv");
    reader.start().await.unwrap();
    let records: Vec<Vec<String>> = reader.get_csv_iter(None).try_collect().await.unwrap();
    reader.end();

    assert_eq!(
        records,
        vec![
            vec!["city".to_string(), "price".to_string()],
            vec!["Zürich".to_string(), "12€".to_string()],
            vec!["東京".to_string(), "¥900".to_string()],
        ]
    );
}

/// Scenario: Byte cap on the object store
/// Given an object store capped at 12 bytes
/// When a write would cross the cap
/// Then write returns false and earlier data is still finalized
#[tokio::test]
async fn test_object_store_cap_keeps_prior_data() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        max_bytes: 12,
        ..object_config(&dir)
    };
    let store = build_store(&config).await.unwrap();

    let mut uploader = open_uploader(&store, "k.csv");
    uploader.start().await.unwrap();
    assert!(uploader.write("a,b\n").await.unwrap());
    assert!(uploader.write("1,2\n").await.unwrap());
    assert!(!uploader.write("3,4\n5,6\n").await.unwrap());
    let entry = uploader.end().await.unwrap();
    assert!(entry.truncated);
    assert_eq!(entry.size, 8);

    let mut reader = open_reader(&store, "k.csv");
    reader.start().await.unwrap();
    let lines: Vec<String> = reader.read_lines(None).try_collect().await.unwrap();
    assert_eq!(lines, vec!["a,b", "1,2"]);
}

/// Scenario: Inline store on disk
/// Given an inline store backed by a file
/// When a result is written and the store is reopened
/// Then the result is still readable
#[tokio::test]
async fn test_inline_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig {
        backend: StoreKind::Inline,
        inline_path: Some(dir.path().join("results.db")),
        ..StoreConfig::default()
    };

    {
        let store = build_store(&config).await.unwrap();
        let mut uploader = open_uploader(&store, "q/0/result.csv");
        uploader.start().await.unwrap();
        uploader.write("n\n1\n").await.unwrap();
        uploader.end().await.unwrap();
    }

    let store = build_store(&config).await.unwrap();
    let mut reader = open_reader(&store, "q/0/result.csv");
    reader.start().await.unwrap();
    let lines: Vec<String> = reader.read_lines(Some(10)).try_collect().await.unwrap();
    assert_eq!(lines, vec!["n", "1"]);
}

/// Scenario: Object backend without a URL
/// Given an object store configuration missing object_url
/// When the store is built
/// Then a configuration error is returned
#[tokio::test]
async fn test_object_store_requires_url() {
    let config = StoreConfig {
        backend: StoreKind::Object,
        ..StoreConfig::default()
    };
    let err = build_store(&config).await.err().unwrap();
    assert_eq!(err.category(), "Configuration Error");
}
