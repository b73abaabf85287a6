// tests/ingest.rs

//! End-to-end archive ingestion tests.

mod common;

use common::{FakeCatalog, FlakyStore, fast_retry, memory_client, tar_gz_archive, title, zip_archive};
use depotkeep::catalog::TitleMetadata;
use depotkeep::keys::{KeyTable, MemoryKeyTable, SqliteKeyTable};
use depotkeep::report::SynthesizedRevision;
use depotkeep::script::ScriptDocument;
use depotkeep::{CommitStatus, Error, FilesystemStore, Ingestor, StoreClient};
use std::sync::Arc;

const SCRIPT_730: &str = "addappid(730)\naddappid(7301, 1, \"ABC\")\naddappid(7302)\n";

#[tokio::test]
async fn test_partial_key_failure_commits_resolvable_depots() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client.clone(), Arc::new(MemoryKeyTable::new()));

    let archive = zip_archive(&[
        ("730.script", SCRIPT_730.as_bytes()),
        ("7301_1111111111.manifest", b"manifest-7301"),
        ("7302_2222222222.manifest", b"manifest-7302"),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(report.titles.len(), 1);

    let commit = &report.titles[0];
    assert_eq!(commit.title_affected, title("730"));
    assert_eq!(commit.status, CommitStatus::Created);
    assert_eq!(commit.depot_count, 1);
    assert_eq!(commit.skipped_depot_count, 1);
    assert_eq!(commit.unresolved_keys.len(), 1);
    assert_eq!(commit.unresolved_keys[0].depot_id, "7302");
    assert_eq!(commit.unresolved_keys[0].manifest_filename, "7302_2222222222.manifest");

    let unit = client.read(&title("730")).await.unwrap().unwrap();
    let names: Vec<&str> = unit.files.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["730.script", "7301_1111111111.manifest"]);

    let script = unit.script().unwrap();
    let doc = ScriptDocument::parse(&script);
    assert!(doc.registers("7301"));
    assert!(!doc.registers("7302"));
    assert_eq!(doc.pins(), vec![("7301".to_string(), "1111111111".to_string())]);
}

#[tokio::test]
async fn test_independent_titles_created_then_updated() {
    let (_, client) = memory_client();
    let keys = Arc::new(MemoryKeyTable::with_entries([("4401", "K4401"), ("5701", "K5701")]));
    let ingestor = Ingestor::new(client.clone(), keys);

    let archive = tar_gz_archive(&[
        ("bundle/440.script", b"addappid(440)\naddappid(4401)\n"),
        ("bundle/4401_10.manifest", b"a"),
        ("bundle/570.script", b"addappid(570)\naddappid(5701)\n"),
        ("bundle/5701_20.manifest", b"b"),
    ]);

    let first = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(first.titles.len(), 2);
    assert_eq!(first.created().count(), 2);
    assert_eq!(first.titles[0].title_affected, title("440"));
    assert_eq!(first.titles[1].title_affected, title("570"));

    let second = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(second.updated().count(), 2);
    assert_eq!(client.list().await.unwrap(), vec![title("440"), title("570")]);
}

#[tokio::test]
async fn test_reingest_is_idempotent() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client.clone(), Arc::new(MemoryKeyTable::new()));
    let archive = zip_archive(&[
        ("730.script", SCRIPT_730.as_bytes()),
        ("7301_1111111111.manifest", b"m"),
    ]);

    let first = ingestor.ingest(&archive).await.unwrap();
    let before = client.read(&title("730")).await.unwrap().unwrap();
    let second = ingestor.ingest(&archive).await.unwrap();
    let after = client.read(&title("730")).await.unwrap().unwrap();

    assert_eq!(first.titles[0].status, CommitStatus::Created);
    assert_eq!(second.titles[0].status, CommitStatus::Updated);
    assert_eq!(before.files, after.files);
    assert_eq!(first.titles[0].digest, second.titles[0].digest);
}

#[tokio::test]
async fn test_referenced_depot_without_manifest_survives() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client.clone(), Arc::new(MemoryKeyTable::new()));
    let archive = zip_archive(&[
        (
            "730.script",
            b"addappid(730)\naddappid(7301, 1, \"ABC\")\naddappid(7303, 1, \"DEF\")\n",
        ),
        ("7301_1111111111.manifest", b"m"),
    ]);

    ingestor.ingest(&archive).await.unwrap();
    let unit = client.read(&title("730")).await.unwrap().unwrap();

    let script = unit.script().unwrap();
    assert!(script.contains("addappid(7303, 1, \"DEF\")"));
    assert!(unit.manifests().iter().all(|m| m.depot_id != "7303"));
}

#[tokio::test]
async fn test_empty_archive_aborts_call() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client, Arc::new(MemoryKeyTable::new()));
    let archive = zip_archive(&[("readme.txt", b"nothing to see")]);

    let err = ingestor.ingest(&archive).await.unwrap_err();
    assert!(matches!(err, Error::EmptyArchive));
}

#[tokio::test]
async fn test_embedded_key_beats_key_table() {
    let (_, client) = memory_client();
    let keys = Arc::new(SqliteKeyTable::open_in_memory().unwrap());
    keys.put("7301", "K2").unwrap();
    let ingestor = Ingestor::new(client.clone(), keys.clone());

    let archive = zip_archive(&[
        ("730.script", b"addappid(730)\naddappid(7301, 1, \"K1\")\n"),
        ("7301_1.manifest", b"m"),
    ]);
    ingestor.ingest(&archive).await.unwrap();

    let script = client.read(&title("730")).await.unwrap().unwrap().script().unwrap();
    assert!(script.contains("addappid(7301, 1, \"K1\")"));
    // Script keys are learned into the table as well
    assert_eq!(keys.get("7301").unwrap().as_deref(), Some("K1"));
}

#[tokio::test]
async fn test_depot_keys_table_resolves_and_is_counted() {
    let (_, client) = memory_client();
    let keys = Arc::new(MemoryKeyTable::new());
    let ingestor = Ingestor::new(client.clone(), keys.clone());

    let archive = zip_archive(&[
        ("730.script", b"addappid(730)\naddappid(7302)\n"),
        ("7302_2222222222.manifest", b"m"),
        ("DepotKeys.json", br#"{"7302": "FROMTABLE", "9999": "OTHER"}"#),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(report.titles[0].status, CommitStatus::Created);
    assert!(report.unresolved_keys().is_empty());
    assert_eq!(report.keys_learned, 2);

    let unit = client.read(&title("730")).await.unwrap().unwrap();
    assert!(unit.files.iter().any(|f| f.name == "depotkeys.json"));
}

#[tokio::test]
async fn test_store_failure_is_fatal_to_that_title_only() {
    let store = Arc::new(FlakyStore::new(3));
    let client = StoreClient::new(store.clone()).with_retry(fast_retry());
    let keys = Arc::new(MemoryKeyTable::with_entries([("4401", "A"), ("5701", "B")]));
    let ingestor = Ingestor::new(client.clone(), keys);

    let archive = zip_archive(&[
        ("440.script", b"addappid(4401)\n"),
        ("4401_1.manifest", b"a"),
        ("570.script", b"addappid(5701)\n"),
        ("5701_1.manifest", b"b"),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(report.titles[0].status, CommitStatus::Failed);
    assert!(report.titles[0].errors[0].contains("after 3 attempts"));
    assert_eq!(report.titles[1].status, CommitStatus::Created);
    assert_eq!(client.list().await.unwrap(), vec![title("570")]);
}

#[tokio::test]
async fn test_title_without_keys_is_reported_as_skipped() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client.clone(), Arc::new(MemoryKeyTable::new()));
    let archive = zip_archive(&[("440.script", b"addappid(440)\naddappid(4401)\n"), ("4401_1.manifest", b"a")]);

    let report = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(report.titles[0].status, CommitStatus::Skipped);
    assert_eq!(report.unresolved_keys().len(), 1);
    assert!(client.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_catalog_name_in_header_and_outage_degrades() {
    let (_, client) = memory_client();
    let catalog = Arc::new(FakeCatalog::new());
    catalog
        .insert(
            "730",
            TitleMetadata {
                name: Some("Counter-Strike 2".to_string()),
                ..Default::default()
            },
        )
        .await;
    catalog.fail_for("570").await;

    let keys = Arc::new(MemoryKeyTable::with_entries([("7301", "A"), ("5701", "B")]));
    let ingestor = Ingestor::new(client.clone(), keys).with_catalog(catalog);

    let archive = zip_archive(&[
        ("730.script", b"addappid(7301)\n"),
        ("7301_1.manifest", b"a"),
        ("570.script", b"addappid(5701)\n"),
        ("5701_1.manifest", b"b"),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    assert_eq!(report.created().count(), 2);

    let script = client.read(&title("730")).await.unwrap().unwrap().script().unwrap();
    assert!(script.contains("-- Title: Counter-Strike 2 (730)"));
    let script = client.read(&title("570")).await.unwrap().unwrap().script().unwrap();
    assert!(script.contains("-- Title: 570\n"));
}

#[tokio::test]
async fn test_author_lines_survive_reupload() {
    let (_, client) = memory_client();
    let keys = Arc::new(MemoryKeyTable::with_entries([("7301", "A")]));
    let ingestor = Ingestor::new(client.clone(), keys);

    let first = zip_archive(&[
        ("730.script", b"addappid(730)\naddappid(7301)\naddtoken(730, \"tok\")\n"),
        ("7301_1.manifest", b"a"),
    ]);
    let second = zip_archive(&[("730.script", b"addappid(730)\naddappid(7301)\n"), ("7301_2.manifest", b"b")]);

    ingestor.ingest(&first).await.unwrap();
    ingestor.ingest(&second).await.unwrap();

    let unit = client.read(&title("730")).await.unwrap().unwrap();
    let script = unit.script().unwrap();
    assert!(script.contains("addtoken(730, \"tok\")"));
    assert_eq!(unit.revisions().get("7301").map(String::as_str), Some("2"));
    assert_eq!(unit.manifests().len(), 1);
}

#[tokio::test]
async fn test_filesystem_store_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let client = StoreClient::new(Arc::new(FilesystemStore::new(dir.path()))).with_retry(fast_retry());
    let keys = Arc::new(SqliteKeyTable::open(dir.path().join("keys.db")).unwrap());
    let ingestor = Ingestor::new(client.clone(), keys);

    let archive_path = dir.path().join("upload.zip");
    std::fs::write(
        &archive_path,
        zip_archive(&[("730.script", SCRIPT_730.as_bytes()), ("7301_1111111111.manifest", b"m")]),
    )
    .unwrap();

    let report = ingestor.ingest_file(&archive_path).await.unwrap();
    assert_eq!(report.titles[0].status, CommitStatus::Created);
    assert!(dir.path().join("730").join("7301_1111111111.manifest").exists());
    assert!(dir.path().join("730").join("730.script").exists());
}

#[tokio::test]
async fn test_title_token_kept_when_title_named_manifest_is_unresolved() {
    let (_, client) = memory_client();
    let keys = Arc::new(MemoryKeyTable::with_entries([("7301", "A")]));
    let ingestor = Ingestor::new(client.clone(), keys);

    let archive = zip_archive(&[
        (
            "730.script",
            b"addappid(730)\naddappid(7301)\naddtoken(730, \"tok\") -- operator token\n".as_slice(),
        ),
        ("7301_1.manifest", b"a".as_slice()),
        ("730_99.manifest", b"b".as_slice()),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    let unresolved: Vec<&str> = report.unresolved_keys().iter().map(|u| u.depot_id.as_str()).collect();
    assert_eq!(unresolved, vec!["730"]);

    let script = client.read(&title("730")).await.unwrap().unwrap().script().unwrap();
    assert!(script.contains("addtoken(730, \"tok\") -- operator token"));
    assert!(script.contains("addappid(7301, 1, \"A\")"));
}

#[tokio::test]
async fn test_synthesized_revision_is_reported_and_recorded() {
    let (_, client) = memory_client();
    let ingestor = Ingestor::new(client.clone(), Arc::new(MemoryKeyTable::new())).with_clock(|| 1_700_000_000);

    let archive = zip_archive(&[
        ("730.script", b"addappid(730)\naddappid(7301, 1, \"K\")\n".as_slice()),
        ("7301.manifest", b"no revision here".as_slice()),
    ]);

    let report = ingestor.ingest(&archive).await.unwrap();
    let commit = &report.titles[0];
    assert_eq!(commit.status, CommitStatus::Created);
    assert_eq!(
        commit.synthesized_revisions,
        vec![SynthesizedRevision {
            depot_id: "7301".to_string(),
            revision_id: "1700000000".to_string(),
            manifest_filename: "7301.manifest".to_string(),
        }]
    );

    let unit = client.read(&title("730")).await.unwrap().unwrap();
    assert_eq!(
        unit.unverified_revisions().get("7301").map(String::as_str),
        Some("1700000000")
    );
    let manifests = unit.manifests();
    assert_eq!(manifests[0].revision_id, "1700000000");
    assert!(manifests[0].is_synthesized());
}
