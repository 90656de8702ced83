use keel::core::action_log::{ActionPayload, ActionType, NewAction};
use keel::core::config::KeelConfig;
use keel::core::context::{ContextDocument, DEFAULT_FOCUS};
use keel::core::engine::Engine;
use keel::core::executor::CommitInfo;
use keel::core::index::{
    Index, IndexRecord, QueryFilter, RecordKind, SOURCE_ACTIONS, SOURCE_CONTEXT, SyncStatus,
};
use keel::core::jsonfile;
use keel::core::store::ProjectId;
use std::fs;
use tempfile::{TempDir, tempdir};

fn setup() -> (TempDir, Engine, ProjectId) {
    let tmp = tempdir().expect("tempdir");
    let engine = Engine::with_config(tmp.path(), KeelConfig::default()).expect("engine");
    let id = ProjectId::parse("demo").expect("valid id");
    engine
        .create_project(&id, "Chart rendering service")
        .expect("create");
    (tmp, engine, id)
}

fn note(desc: &str) -> NewAction {
    NewAction::new(desc, ActionPayload::Note { chars: desc.len() })
}

fn commit(hash: &str, message: &str, ts: u64) -> CommitInfo {
    CommitInfo {
        commit_id: hash.to_string(),
        message: message.to_string(),
        files: vec!["src/lib.rs".to_string()],
        timestamp: Some(ts),
    }
}

#[test]
fn fresh_project_context_has_defaults() {
    let (_tmp, engine, id) = setup();
    let doc = engine.build(&id).expect("build");

    assert_eq!(doc.project.name, "demo");
    assert_eq!(doc.project.description, "Chart rendering service");
    assert_eq!(doc.activity.total_actions, 0);
    assert_eq!(doc.activity.recent_focus, DEFAULT_FOCUS);
    assert!(doc.activity.recent_actions.is_empty());
    assert!(doc.commits.last_commit.is_none());
    assert!(doc.degraded.is_empty());
    assert!(doc.user_memory.is_none());
    assert!(
        doc.readme
            .preview
            .as_deref()
            .is_some_and(|p| p.contains("Chart rendering service"))
    );
    assert!(doc.readme.checksum.is_some());
}

#[test]
fn unchanged_sources_build_the_same_hash() {
    let (_tmp, engine, id) = setup();
    engine.append(&id, note("wire up parser")).expect("append");

    let first = engine.build(&id).expect("build");
    let persisted = engine.regenerate(&id).expect("regenerate");
    let second = engine.build(&id).expect("build");

    assert_eq!(first.content_hash, second.content_hash);
    assert_eq!(first.content_hash, persisted.content_hash);
    assert!(first.same_content(&second));
    assert_eq!(
        first.computed_hash_hex().expect("hash"),
        first.content_hash
    );

    engine.append(&id, note("another change")).expect("append");
    let third = engine.build(&id).expect("build");
    assert_ne!(third.content_hash, first.content_hash);
}

#[test]
fn activity_block_summarizes_the_log() {
    let (_tmp, engine, id) = setup();
    for i in 0..7 {
        engine
            .append(&id, note(&format!("tune renderer step {i}")))
            .expect("append");
    }
    engine
        .record_commit(&id, &commit("abcdef1234567", "Speed up renderer", 1_000))
        .expect("commit")
        .expect("new commit");

    let doc = engine.build(&id).expect("build");
    assert_eq!(doc.activity.total_actions, 8);
    assert_eq!(doc.activity.recent_actions.len(), 5);
    assert_eq!(doc.activity.recent_actions[0].action, "Committed abcdef1: Speed up renderer");
    assert_eq!(doc.activity.common_operations[0], ActionType::Note);
    assert!(doc.activity.recent_focus.starts_with("renderer"));

    let last = doc.commits.last_commit.expect("last commit");
    assert_eq!(last.commit_id, "abcdef1");
    assert_eq!(doc.commits.recent.len(), 1);
}

#[test]
fn tech_stack_comes_from_markers_and_descriptions() {
    let (_tmp, engine, id) = setup();
    let root = engine.store().project(&id).root;
    fs::write(root.join("Cargo.toml"), "[package]\nname = \"demo\"\n").expect("marker");
    engine
        .append(&id, note("Added scripts/seed.py for fixtures"))
        .expect("append");

    let doc = engine.build(&id).expect("build");
    assert_eq!(doc.project.tech_stack, vec!["python", "rust"]);
}

#[test]
fn corrupt_sources_degrade_instead_of_failing() {
    let (_tmp, engine, id) = setup();
    let paths = engine.store().project(&id);
    fs::write(paths.commit_history(), "[[[").expect("corrupt history");
    fs::write(paths.snapshot(), "nope").expect("corrupt snapshot");

    let doc = engine.build(&id).expect("build");
    let sources: Vec<&str> = doc.degraded.iter().map(|d| d.source.as_str()).collect();
    assert_eq!(sources, vec!["commit_history", "snapshot"]);
    assert!(doc.commits.recent.is_empty());
    assert_eq!(doc.snapshot.status, "unknown");

    // Missing files are not degradation.
    fs::remove_file(paths.commit_history()).expect("remove history");
    fs::remove_file(paths.snapshot()).expect("remove snapshot");
    assert!(engine.build(&id).expect("build").degraded.is_empty());
}

#[test]
fn notes_are_capped_and_kept_out_of_config_block() {
    let (_tmp, engine, id) = setup();
    let stored = engine.save_notes(&id, &"n".repeat(450)).expect("notes");
    assert_eq!(stored, 300);

    let doc = engine.build(&id).expect("build");
    let memory = doc.user_memory.expect("user memory");
    assert_eq!(memory.notes.chars().count(), 300);
    assert!(doc.config.user_memory.is_none());
}

#[test]
fn missing_project_is_not_found() {
    let (_tmp, engine, _id) = setup();
    let ghost = ProjectId::parse("ghost").expect("valid id");
    assert_eq!(engine.build(&ghost).expect_err("missing").kind(), "not_found");
}

#[test]
fn regenerate_persists_and_indexes_the_document() {
    let (_tmp, engine, id) = setup();
    let doc = engine.regenerate(&id).expect("regenerate");
    let paths = engine.store().project(&id);

    let on_disk: ContextDocument = jsonfile::load_required(&paths.context()).expect("context file");
    assert_eq!(on_disk.content_hash, doc.content_hash);

    let records = engine
        .query(
            &id,
            &QueryFilter {
                kind: Some(RecordKind::Document),
                ..Default::default()
            },
        )
        .expect("query");
    assert_eq!(records.len(), 1);
    match &records[0] {
        IndexRecord::Document { version_hash, .. } => assert_eq!(version_hash, &doc.content_hash),
        other => panic!("unexpected record {:?}", other),
    }

    let state = Index::new(&id, &paths)
        .sync_state(SOURCE_CONTEXT)
        .expect("sync state")
        .expect("context row");
    assert_eq!(state.status, SyncStatus::Synced);
}

#[test]
fn action_queries_filter_and_order() {
    let (_tmp, engine, id) = setup();
    engine.append(&id, note("first")).expect("append");
    engine
        .append(
            &id,
            NewAction::new(
                "Wrote notes.md",
                ActionPayload::FileUpdate {
                    path: "notes.md".to_string(),
                    bytes: 3,
                },
            ),
        )
        .expect("append");
    engine.append(&id, note("third")).expect("append");

    let notes = engine
        .query(
            &id,
            &QueryFilter {
                kind: Some(RecordKind::Action),
                action_type: Some("note".to_string()),
                ..Default::default()
            },
        )
        .expect("query");
    let seqs: Vec<u64> = notes
        .iter()
        .map(|r| match r {
            IndexRecord::Action { seq, .. } => *seq,
            other => panic!("unexpected record {:?}", other),
        })
        .collect();
    assert_eq!(seqs, vec![2, 0]);

    let limited = engine
        .query(
            &id,
            &QueryFilter {
                kind: Some(RecordKind::Action),
                limit: Some(1),
                ..Default::default()
            },
        )
        .expect("query");
    assert_eq!(limited.len(), 1);
}

#[test]
fn rebuild_matches_incremental_state() {
    let cfg = KeelConfig {
        memory: keel::core::config::MemoryConfig {
            max_entries: 6,
            ..Default::default()
        },
        ..Default::default()
    };
    let tmp = tempdir().expect("tempdir");
    let engine = Engine::with_config(tmp.path(), cfg).expect("engine");
    let id = ProjectId::parse("demo").expect("valid id");
    engine.create_project(&id, "").expect("create");

    for i in 0..10 {
        engine.append(&id, note(&format!("n{i}"))).expect("append");
    }
    engine
        .record_commit(&id, &commit("1111111aaaa", "one", 10))
        .expect("commit");
    engine
        .record_commit(&id, &commit("2222222bbbb", "two", 20))
        .expect("commit");
    engine.regenerate(&id).expect("regenerate");

    let incremental = engine.aggregate(&id).expect("aggregate");
    assert_eq!(incremental.retained_actions, 6);
    assert_eq!(incremental.commits, 2);
    assert_eq!(incremental.documents, 1);

    let report = engine.reindex(&id).expect("reindex");
    assert_eq!(report.actions, 6);
    assert_eq!(report.commits, 2);
    assert!(report.skipped.is_empty());
    assert_eq!(engine.aggregate(&id).expect("aggregate"), incremental);

    let paths = engine.store().project(&id);
    let state = Index::new(&id, &paths)
        .sync_state(SOURCE_ACTIONS)
        .expect("sync state")
        .expect("actions row");
    assert_eq!(state.last_trim_offset, 6);
    assert_eq!(state.synced_length, 12);
}

#[test]
fn stale_index_is_rebuilt_before_reads() {
    let (_tmp, engine, id) = setup();
    for i in 0..3 {
        engine.append(&id, note(&format!("n{i}"))).expect("append");
    }
    let paths = engine.store().project(&id);
    let index = Index::new(&id, &paths);
    index.check_fresh().expect("fresh");

    index.mark_pending(SOURCE_ACTIONS).expect("mark pending");
    let err = index.check_fresh().expect_err("pending is stale");
    assert_eq!(err.kind(), "stale_index");

    let records = engine
        .query(
            &id,
            &QueryFilter {
                kind: Some(RecordKind::Action),
                ..Default::default()
            },
        )
        .expect("query");
    assert_eq!(records.len(), 3);
    index.check_fresh().expect("fresh after catch-up");

    // A missing database is stale too, and rebuilds on demand.
    for suffix in ["", "-wal", "-shm"] {
        let p = paths.state_dir.join(format!("context.db{}", suffix));
        if p.exists() {
            fs::remove_file(p).expect("remove db file");
        }
    }
    assert!(index.check_fresh().is_err());
    assert_eq!(engine.aggregate(&id).expect("aggregate").retained_actions, 3);
}

#[test]
fn reindex_all_covers_every_project() {
    let (_tmp, engine, id) = setup();
    let other = ProjectId::parse("other").expect("valid id");
    engine.create_project(&other, "").expect("create");
    engine.append(&id, note("a")).expect("append");
    engine.append(&other, note("b")).expect("append");

    let results = engine.reindex_all().expect("reindex all");
    assert_eq!(results.len(), 2);
    for (_, result) in results {
        assert_eq!(result.expect("reindex").actions, 1);
    }
}

#[test]
fn reads_never_observe_a_rebuild_in_progress() {
    use std::sync::Arc;
    use std::thread;

    let (_tmp, engine, id) = setup();
    for i in 0..8 {
        engine.append(&id, note(&format!("n{i}"))).expect("append");
    }
    let engine = Arc::new(engine);

    let rebuilder = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        thread::spawn(move || {
            for _ in 0..15 {
                engine.reindex(&id).expect("reindex");
            }
        })
    };
    for _ in 0..40 {
        let agg = engine.aggregate(&id).expect("aggregate");
        assert_eq!(agg.retained_actions, 8);
    }
    rebuilder.join().expect("rebuilder");

    let db = engine.store().project(&id).state_dir.join("context.db");
    assert!(db.exists());
}

#[test]
fn document_queries_honour_since() {
    let (_tmp, engine, id) = setup();
    engine.regenerate(&id).expect("regenerate");
    let documents = |since: Option<u64>| {
        engine
            .query(
                &id,
                &QueryFilter {
                    kind: Some(RecordKind::Document),
                    since,
                    ..Default::default()
                },
            )
            .expect("query")
            .len()
    };

    assert_eq!(documents(None), 1);
    assert_eq!(documents(Some(0)), 1);
    let an_hour_ahead = keel::core::time::now_epoch_ms() + 3_600_000;
    assert_eq!(documents(Some(an_hour_ahead)), 0);
}
