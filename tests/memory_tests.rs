use automatosx::memory::{
    CleanupStrategy, ImportOptions, MemoryCleanupConfig, MemoryEntryType, MemoryError,
    MemoryManager, MemoryManagerConfig, MemoryMetadata, MemorySearchFilters, MemorySearchQuery,
};
use tempfile::TempDir;

fn manager_with(config: impl FnOnce(&mut MemoryManagerConfig)) -> (TempDir, MemoryManager) {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = MemoryManagerConfig {
        db_path: dir.path().join("memory.db"),
        ..Default::default()
    };
    config(&mut cfg);
    let manager = MemoryManager::new(cfg).unwrap();
    (dir, manager)
}

fn manager() -> (TempDir, MemoryManager) {
    manager_with(|_| {})
}

fn meta(entry_type: MemoryEntryType, source: &str) -> MemoryMetadata {
    MemoryMetadata::new(entry_type, source)
}

#[tokio::test]
async fn add_and_get_round_trip_content_and_metadata() {
    let (_dir, manager) = manager();
    let metadata = meta(MemoryEntryType::Code, "backend")
        .with_agent("backend")
        .with_session("11111111-2222-4333-8444-555555555555")
        .with_tag("auth")
        .with_importance(0.8);

    let id = manager
        .add("The auth service uses JWT refresh tokens", metadata.clone())
        .await
        .unwrap();

    let entry = manager.get(id).await.unwrap();
    assert_eq!(entry.content, "The auth service uses JWT refresh tokens");
    assert_eq!(
        serde_json::to_value(&entry.metadata).unwrap(),
        serde_json::to_value(&metadata).unwrap()
    );
    assert_eq!(entry.access_count, 0);
}

#[tokio::test]
async fn search_ranks_and_scores_hits() {
    let (_dir, manager) = manager();
    manager
        .add("Rust ownership and borrowing rules", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();
    manager
        .add("JavaScript event loop internals", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();

    let hits = manager
        .search(MemorySearchQuery {
            text: "ownership borrowing".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert!(hits[0].entry.content.contains("ownership"));
    assert!(hits[0].similarity > 0.0 && hits[0].similarity <= 1.0);
}

#[tokio::test]
async fn search_applies_metadata_filters_conjunctively() {
    let (_dir, manager) = manager();
    manager
        .add(
            "login endpoint design",
            meta(MemoryEntryType::Code, "backend").with_tag("auth").with_tag("api"),
        )
        .await
        .unwrap();
    manager
        .add(
            "login page design",
            meta(MemoryEntryType::Document, "frontend").with_tag("auth"),
        )
        .await
        .unwrap();

    let hits = manager
        .search(MemorySearchQuery {
            text: "login design".to_string(),
            filters: Some(MemorySearchFilters {
                types: Some(vec![MemoryEntryType::Code]),
                tags: Some(vec!["auth".to_string(), "api".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.metadata.source, "backend");
}

#[tokio::test]
async fn empty_sanitized_query_returns_nothing() {
    let (_dir, manager) = manager();
    manager
        .add("something searchable", meta(MemoryEntryType::Other, "cli"))
        .await
        .unwrap();

    let hits = manager
        .search(MemorySearchQuery {
            text: "AND OR NOT ()**".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn access_tracking_bumps_counters_on_search() {
    let (_dir, manager) = manager();
    let id = manager
        .add("tracked entry about caching", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();

    manager
        .search(MemorySearchQuery {
            text: "caching".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let entry = manager.get(id).await.unwrap();
    assert_eq!(entry.access_count, 1);
    assert!(entry.last_accessed_at.is_some());
}

#[tokio::test]
async fn smart_cleanup_runs_at_the_trigger_ratio() {
    let (_dir, manager) = manager_with(|cfg| {
        cfg.max_entries = 10;
        cfg.cleanup = MemoryCleanupConfig {
            enabled: true,
            strategy: CleanupStrategy::Oldest,
            trigger_threshold: 0.9,
            target_threshold: 0.7,
            min_cleanup_count: 1,
            max_cleanup_count: 1_000,
            retention_days: 30,
        };
    });

    for i in 1..=9 {
        manager
            .add(&format!("entry number {}", i), meta(MemoryEntryType::Other, "test"))
            .await
            .unwrap();
    }
    assert_eq!(manager.entry_count(), 9);

    // The 10th add crosses the 0.9 trigger: cleanup evicts the oldest
    // entries down to the 0.7 target (7), then inserts.
    manager
        .add("entry number 10", meta(MemoryEntryType::Other, "test"))
        .await
        .unwrap();

    assert_eq!(manager.entry_count(), 8);
    assert!(matches!(
        manager.get(1).await,
        Err(MemoryError::EntryNotFound(1))
    ));
    assert!(matches!(
        manager.get(2).await,
        Err(MemoryError::EntryNotFound(2))
    ));
    for id in 3..=10 {
        assert!(manager.get(id).await.is_ok(), "entry {} should survive", id);
    }
}

#[tokio::test]
async fn full_store_without_cleanup_rejects_with_memory_limit() {
    let (_dir, manager) = manager_with(|cfg| {
        cfg.max_entries = 100;
        cfg.cleanup.enabled = false;
    });

    let mut limit_errors = 0;
    for i in 0..200 {
        match manager
            .add(&format!("bulk entry {}", i), meta(MemoryEntryType::Other, "bulk"))
            .await
        {
            Ok(_) => {}
            Err(MemoryError::Limit { max_entries }) => {
                assert_eq!(max_entries, 100);
                limit_errors += 1;
            }
            Err(other) => panic!("unexpected error: {}", other),
        }
    }

    assert_eq!(manager.entry_count(), 100);
    assert_eq!(limit_errors, 100);
    let stats = manager.get_stats().await.unwrap();
    assert_eq!(stats.total_entries, 100);
}

#[tokio::test]
async fn fts_index_stays_in_sync_with_deletes() {
    let (_dir, manager) = manager();
    let id = manager
        .add("transient entry about volcanoes", meta(MemoryEntryType::Other, "test"))
        .await
        .unwrap();

    let hits = manager
        .search(MemorySearchQuery {
            text: "volcanoes".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    manager.delete(id).await.unwrap();
    let hits = manager
        .search(MemorySearchQuery {
            text: "volcanoes".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hits.is_empty());
    assert!(matches!(
        manager.delete(id).await,
        Err(MemoryError::EntryNotFound(_))
    ));
}

#[tokio::test]
async fn export_import_round_trip_preserves_entries() {
    let (_dir, source) = manager();
    source
        .add(
            "first exported entry",
            meta(MemoryEntryType::Task, "backend").with_tag("export"),
        )
        .await
        .unwrap();
    source
        .add("second exported entry", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();

    let export = source.export(None).await.unwrap();
    assert_eq!(export.metadata.total_entries, 2);
    assert!(!export.metadata.includes_embeddings);

    let (_dir2, dest) = manager();
    dest.add("stale entry", meta(MemoryEntryType::Other, "old"))
        .await
        .unwrap();

    let report = dest
        .import(
            &export,
            &ImportOptions {
                skip_duplicates: false,
                validate: true,
                clear_existing: true,
            },
        )
        .await
        .unwrap();
    assert_eq!(report.imported, 2);
    assert!(report.errors.is_empty());

    let round_trip = dest.export(None).await.unwrap();
    let contents: Vec<&str> = round_trip.entries.iter().map(|e| e.content.as_str()).collect();
    assert_eq!(contents, vec!["first exported entry", "second exported entry"]);
    assert_eq!(
        serde_json::to_value(&round_trip.entries[0].metadata).unwrap(),
        serde_json::to_value(&export.entries[0].metadata).unwrap()
    );
}

#[tokio::test]
async fn import_rejects_unknown_versions_and_collects_entry_errors() {
    let (_dir, manager) = manager();

    let mut export = manager.export(None).await.unwrap();
    export.version = "99.0".to_string();
    assert!(matches!(
        manager.import(&export, &ImportOptions::default()).await,
        Err(MemoryError::InvalidFormat(_))
    ));

    let mut export = manager.export(None).await.unwrap();
    export.entries.push(automatosx::memory::MemoryEntry {
        id: 1,
        content: "   ".to_string(),
        metadata: meta(MemoryEntryType::Other, "import"),
        created_at: chrono::Utc::now(),
        last_accessed_at: None,
        access_count: 0,
    });
    let report = manager
        .import(
            &export,
            &ImportOptions {
                validate: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(report.imported, 0);
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("empty content"));
}

#[tokio::test]
async fn import_skips_duplicates_by_content_hash() {
    let (_dir, manager) = manager();
    manager
        .add("duplicated content", meta(MemoryEntryType::Other, "original"))
        .await
        .unwrap();

    let export = manager.export(None).await.unwrap();
    let report = manager
        .import(
            &export,
            &ImportOptions {
                skip_duplicates: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(report.imported, 0);
    assert_eq!(report.skipped_duplicates, 1);
    assert_eq!(manager.entry_count(), 1);
}

#[tokio::test]
async fn listing_pages_newest_first() {
    let (_dir, manager) = manager();
    for i in 1..=5 {
        manager
            .add(&format!("listed entry {}", i), meta(MemoryEntryType::Other, "cli"))
            .await
            .unwrap();
    }

    let page = manager.list_recent(2, 0).await.unwrap();
    assert_eq!(page.len(), 2);
    assert_eq!(page[0].content, "listed entry 5");
    assert_eq!(page[1].content, "listed entry 4");

    let page = manager.list_recent(2, 4).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "listed entry 1");
}

#[tokio::test]
async fn backup_and_restore_recover_state() {
    let dir = tempfile::tempdir().unwrap();
    let (_mdir, manager) = manager();
    manager
        .add("entry before backup", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();

    let backup_path = dir.path().join("backups/memory-backup.db");
    manager.backup(&backup_path).await.unwrap();
    assert!(backup_path.exists());

    manager
        .add("entry after backup", meta(MemoryEntryType::Document, "docs"))
        .await
        .unwrap();
    assert_eq!(manager.entry_count(), 2);

    manager.restore(&backup_path).await.unwrap();
    assert_eq!(manager.entry_count(), 1);

    let hits = manager
        .search(MemorySearchQuery {
            text: "before backup".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);

    let hits = manager
        .search(MemorySearchQuery {
            text: "after backup".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(hits.is_empty());

    // Restoring from a missing file fails without clobbering state.
    assert!(manager.restore(&dir.path().join("nope.db")).await.is_err());
}

#[tokio::test]
async fn restore_from_missing_file_keeps_the_store_usable() {
    let dir = tempfile::tempdir().unwrap();
    let (_mdir, manager) = manager();
    manager
        .add("survivor entry", meta(MemoryEntryType::Other, "test"))
        .await
        .unwrap();

    assert!(manager.restore(&dir.path().join("ghost.db")).await.is_err());
    assert_eq!(manager.entry_count(), 1);
    assert!(manager.get(1).await.is_ok());
}

#[tokio::test]
async fn least_accessed_strategy_evicts_cold_entries() {
    let (_dir, manager) = manager_with(|cfg| {
        cfg.max_entries = 10;
        cfg.track_access = true;
        cfg.cleanup = MemoryCleanupConfig {
            enabled: true,
            strategy: CleanupStrategy::LeastAccessed,
            trigger_threshold: 0.9,
            target_threshold: 0.7,
            min_cleanup_count: 1,
            max_cleanup_count: 1_000,
            retention_days: 30,
        };
    });

    for i in 1..=9 {
        manager
            .add(&format!("cold or warm entry {}", i), meta(MemoryEntryType::Other, "test"))
            .await
            .unwrap();
    }

    // Warm up entries 1 and 2 so eviction prefers the untouched ones.
    for needle in ["entry 1", "entry 2"] {
        let hits = manager
            .search(MemorySearchQuery {
                text: needle.to_string(),
                limit: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!hits.is_empty());
    }

    manager
        .add("cold or warm entry 10", meta(MemoryEntryType::Other, "test"))
        .await
        .unwrap();

    assert!(manager.get(1).await.is_ok());
    assert!(manager.get(2).await.is_ok());
}
