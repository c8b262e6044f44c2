//! Integration tests for merging a timeline into its parent
//!
//! Tests for:
//! - clean merges carry the source's changes into the parent
//! - conflicting merges change nothing
//! - converged changes, schema changes and dropped tables
//! - state preconditions (root, terminal, open children)
//! - apply failures leave the parent untouched

use std::sync::Arc;
use std::time::Duration;
use timelines_core::{Query, Row, SchemaObject, TimelineStatus, Value};
use timelines_engine::{MergeConflict, MergeResult, MergeSide, RetryConfig, Timelines, TimelinesConfig};
use timelines_storage::{Fault, MemoryProvider, ProviderOp};

fn engine() -> (Arc<MemoryProvider>, Timelines) {
    let provider = Arc::new(MemoryProvider::new());
    let config = TimelinesConfig {
        retry: RetryConfig::new().with_base_delay_ms(1).with_max_delay_ms(10),
        ..Default::default()
    };
    let timelines = Timelines::with_config(provider.clone(), config).unwrap();
    (provider, timelines)
}

fn upsert(table: &str, key: &str, name: &str) -> Query {
    Query::Upsert {
        table: table.into(),
        row: Row::new(key).with("name", name),
    }
}

/// Root with a `users` table holding one row
async fn seeded(timelines: &Timelines) -> timelines_core::Timeline {
    let main = timelines.create_timeline("main", "", None).await.unwrap();
    timelines
        .execute(main.id, Query::CreateObject(SchemaObject::table("users", "id TEXT")))
        .await
        .unwrap();
    timelines
        .execute(main.id, upsert("users", "1", "original"))
        .await
        .unwrap();
    main
}

fn name_of(provider: &MemoryProvider, fork: &timelines_core::ForkRef, key: &str) -> Option<Value> {
    provider
        .read_row(fork, "users", key)
        .and_then(|row| row.get("name").cloned())
}

// ============================================================================
// Clean merges
// ============================================================================

#[tokio::test]
async fn test_merge_brings_child_changes_into_parent() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines
        .execute(feature.id, upsert("users", "2", "bob"))
        .await
        .unwrap();
    timelines
        .execute(main.id, upsert("users", "3", "carol"))
        .await
        .unwrap();

    let result = timelines.merge_timeline(feature.id).await.unwrap();
    let MergeResult::Merged {
        merged_snapshot,
        changes_applied,
        converged,
    } = result
    else {
        panic!("expected a clean merge");
    };
    assert_eq!(changes_applied, 1);
    assert_eq!(converged, 0);

    // The parent's head is the merge snapshot and holds both sides
    let main_now = timelines.get_timeline(main.id).unwrap();
    assert_eq!(main_now.head_snapshot_id, Some(merged_snapshot.id));
    let head = provider.snapshot_state(&merged_snapshot.provider_ref).unwrap();
    assert!(head.row("users", "1").is_some());
    assert!(head.row("users", "2").is_some());
    assert!(head.row("users", "3").is_some());

    // The source is terminal and holds no fork
    let merged = timelines.get_timeline(feature.id).unwrap();
    assert_eq!(merged.status, TimelineStatus::Merged);
    assert_eq!(merged.fork_ref, None);
    assert!(!provider.is_live(feature.fork_ref.as_ref().unwrap()));
}

#[tokio::test]
async fn test_merge_without_changes_still_snapshots_parent() {
    let (_provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    let before = timelines.get_history(main.id).unwrap().len();

    let result = timelines.merge_timeline(feature.id).await.unwrap();
    assert!(result.is_merged());
    assert_eq!(timelines.get_history(main.id).unwrap().len(), before + 1);
}

#[tokio::test]
async fn test_merge_applies_deletes_and_schema() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines
        .execute_transaction(
            feature.id,
            &[
                Query::CreateObject(SchemaObject::table("orders", "id TEXT")),
                upsert("orders", "o1", "first"),
                Query::CreateObject(SchemaObject::column("users", "email", "TEXT")),
                Query::Delete {
                    table: "users".into(),
                    key: "1".into(),
                },
            ],
        )
        .await
        .unwrap();

    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());

    let fork = timelines.checkout(main.id).await.unwrap();
    let state = provider.fork_state(&fork).unwrap();
    assert!(state.schema_object("orders").is_some());
    assert!(state.schema_object("users.email").is_some());
    assert!(state.row("orders", "o1").is_some());
    assert!(state.row("users", "1").is_none());
}

#[tokio::test]
async fn test_merge_replaces_table_with_view() {
    let (provider, timelines) = engine();
    let main = timelines.create_timeline("main", "", None).await.unwrap();
    timelines
        .execute_transaction(
            main.id,
            &[
                Query::CreateObject(SchemaObject::table("report", "id TEXT")),
                Query::CreateObject(SchemaObject::column("report", "x", "INT")),
                upsert("report", "1", "q1"),
            ],
        )
        .await
        .unwrap();
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines
        .execute_transaction(
            feature.id,
            &[
                Query::DropObject {
                    name: "report".into(),
                },
                Query::CreateObject(SchemaObject::view("report", "SELECT 1")),
            ],
        )
        .await
        .unwrap();

    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());

    let fork = timelines.checkout(main.id).await.unwrap();
    let state = provider.fork_state(&fork).unwrap();
    assert_eq!(
        state.schema_object("report"),
        Some(&SchemaObject::view("report", "SELECT 1"))
    );
    assert!(state.schema_object("report.x").is_none());
    assert_eq!(state.row_count(), 0);
}

#[tokio::test]
async fn test_identical_changes_converge() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines
        .execute(main.id, upsert("users", "1", "same"))
        .await
        .unwrap();
    timelines
        .execute(feature.id, upsert("users", "1", "same"))
        .await
        .unwrap();

    match timelines.merge_timeline(feature.id).await.unwrap() {
        MergeResult::Merged {
            changes_applied,
            converged,
            ..
        } => {
            assert_eq!(changes_applied, 0);
            assert_eq!(converged, 1);
        }
        other => panic!("expected convergence, got {:?}", other),
    }
    let fork = timelines.checkout(main.id).await.unwrap();
    assert_eq!(name_of(&provider, &fork, "1"), Some(Value::from("same")));
}

// ============================================================================
// Conflicts
// ============================================================================

#[tokio::test]
async fn test_sibling_merges_conflict_on_same_row() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let c1 = timelines.create_timeline("c1", "", Some(main.id)).await.unwrap();
    let c2 = timelines.create_timeline("c2", "", Some(main.id)).await.unwrap();

    timelines.execute(c1.id, upsert("users", "1", "from c1")).await.unwrap();
    timelines.execute(c2.id, upsert("users", "1", "from c2")).await.unwrap();

    assert!(timelines.merge_timeline(c1.id).await.unwrap().is_merged());
    let main_after_c1 = timelines.get_timeline(main.id).unwrap();
    let history_after_c1 = timelines.get_history(main.id).unwrap();

    let result = timelines.merge_timeline(c2.id).await.unwrap();
    let conflicts = result.conflicts();
    assert_eq!(conflicts.len(), 1);
    match &conflicts[0] {
        MergeConflict::Row {
            table,
            key,
            ours,
            theirs,
        } => {
            assert_eq!(table, "users");
            assert_eq!(key, "1");
            assert_eq!(
                ours.after.as_ref().and_then(|r| r.get("name")),
                Some(&Value::from("from c1"))
            );
            assert_eq!(
                theirs.after.as_ref().and_then(|r| r.get("name")),
                Some(&Value::from("from c2"))
            );
        }
        other => panic!("expected a row conflict, got {:?}", other),
    }

    // Nothing moved
    let main_now = timelines.get_timeline(main.id).unwrap();
    assert_eq!(main_now.head_snapshot_id, main_after_c1.head_snapshot_id);
    assert_eq!(timelines.get_history(main.id).unwrap(), history_after_c1);
    let fork = timelines.checkout(main.id).await.unwrap();
    assert_eq!(name_of(&provider, &fork, "1"), Some(Value::from("from c1")));
    assert_eq!(
        timelines.get_timeline(c2.id).unwrap().status,
        TimelineStatus::Active
    );
}

#[tokio::test]
async fn test_conflict_resolved_in_source_then_merges() {
    let (_provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines.execute(main.id, upsert("users", "1", "main")).await.unwrap();
    timelines
        .execute(feature.id, upsert("users", "1", "feature"))
        .await
        .unwrap();
    assert!(!timelines.merge_timeline(feature.id).await.unwrap().is_merged());

    // Taking the parent's value in the source converges the row
    timelines.execute(feature.id, upsert("users", "1", "main")).await.unwrap();
    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());
}

#[tokio::test]
async fn test_dropped_table_conflicts_with_row_changes() {
    let (_provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();

    timelines
        .execute(
            main.id,
            Query::DropObject {
                name: "users".into(),
            },
        )
        .await
        .unwrap();
    timelines
        .execute(feature.id, upsert("users", "2", "bob"))
        .await
        .unwrap();

    let result = timelines.merge_timeline(feature.id).await.unwrap();
    assert!(result.conflicts().iter().any(|c| matches!(
        c,
        MergeConflict::TableDropped {
            table,
            dropped_by: MergeSide::Parent,
            ..
        } if table == "users"
    )));
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_merge_state_preconditions() {
    let (_provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    let nested = timelines
        .create_timeline("nested", "", Some(feature.id))
        .await
        .unwrap();

    // Root has no parent
    assert!(timelines.merge_timeline(main.id).await.unwrap_err().is_invalid_state());

    // Open children block the merge
    assert!(timelines
        .merge_timeline(feature.id)
        .await
        .unwrap_err()
        .is_invalid_state());

    // Bottom-up works, and a merged timeline cannot merge again
    assert!(timelines.merge_timeline(nested.id).await.unwrap().is_merged());
    assert!(timelines.merge_timeline(nested.id).await.unwrap_err().is_invalid_state());
    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());
}

#[tokio::test]
async fn test_nested_changes_reach_the_root() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    let nested = timelines
        .create_timeline("nested", "", Some(feature.id))
        .await
        .unwrap();

    timelines.execute(nested.id, upsert("users", "9", "deep")).await.unwrap();
    assert!(timelines.merge_timeline(nested.id).await.unwrap().is_merged());
    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());

    let fork = timelines.checkout(main.id).await.unwrap();
    assert_eq!(name_of(&provider, &fork, "9"), Some(Value::from("deep")));
}

#[tokio::test]
async fn test_merge_into_deleted_parent_rejected() {
    let (_provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    let nested = timelines
        .create_timeline("nested", "", Some(feature.id))
        .await
        .unwrap();

    // Force the parent out of Active underneath its child
    timelines
        .store()
        .update(feature.id, |t| {
            t.status = TimelineStatus::Deleted;
            Ok(())
        })
        .unwrap();
    assert!(timelines.merge_timeline(nested.id).await.unwrap_err().is_invalid_state());
}

// ============================================================================
// Failures while applying
// ============================================================================

#[tokio::test]
async fn test_failed_apply_leaves_parent_untouched() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    for key in ["2", "3", "4"] {
        timelines
            .execute(feature.id, upsert("users", key, "new"))
            .await
            .unwrap();
    }
    let main_before = timelines.get_timeline(main.id).unwrap();
    let history_before = timelines.get_history(main.id).unwrap();

    // Begin and the first upsert go through, the second fails
    provider
        .faults()
        .inject_after(ProviderOp::Execute, 2, Fault::permanent("disk full"));
    let err = timelines.merge_timeline(feature.id).await.unwrap_err();
    assert_eq!(err.error_code(), "ProviderError");

    let fork = main_before.fork_ref.clone().unwrap();
    assert!(!provider.has_open_transaction(&fork));
    for key in ["2", "3", "4"] {
        assert!(provider.read_row(&fork, "users", key).is_none());
    }
    assert_eq!(timelines.get_history(main.id).unwrap(), history_before);
    assert_eq!(
        timelines.get_timeline(feature.id).unwrap().status,
        TimelineStatus::Active
    );

    // Nothing was consumed: the merge can simply be retried
    assert!(timelines.merge_timeline(feature.id).await.unwrap().is_merged());
    for key in ["2", "3", "4"] {
        assert!(provider.read_row(&fork, "users", key).is_some());
    }
}

#[tokio::test]
async fn test_timed_out_apply_rolls_back() {
    let (provider, timelines) = engine();
    let main = seeded(&timelines).await;
    let feature = timelines
        .create_timeline("feature", "", Some(main.id))
        .await
        .unwrap();
    timelines
        .execute(feature.id, upsert("users", "2", "bob"))
        .await
        .unwrap();

    let impatient = timelines.with_timeout(Duration::from_millis(50));
    provider.faults().inject_after(
        ProviderOp::Execute,
        1,
        Fault::Delay(Duration::from_millis(500)),
    );
    let err = impatient.merge_timeline(feature.id).await.unwrap_err();
    assert_eq!(err.error_code(), "ProviderTimeout");

    let fork = main.fork_ref.clone().unwrap();
    assert!(!provider.has_open_transaction(&fork));
    assert!(provider.read_row(&fork, "users", "2").is_none());
    assert_eq!(
        timelines.get_timeline(feature.id).unwrap().status,
        TimelineStatus::Active
    );
}
