use keel::core::action_log::{ActionPayload, NewAction};
use keel::core::config::{KeelConfig, MemoryConfig};
use keel::core::engine::Engine;
use keel::core::index::{Index, SOURCE_ACTIONS, SyncStatus};
use keel::core::store::ProjectId;
use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn note(desc: String) -> NewAction {
    let chars = desc.len();
    NewAction::new(desc, ActionPayload::Note { chars })
}

#[test]
fn concurrent_appends_to_one_project_lose_nothing() {
    let tmp = tempdir().expect("tempdir");
    let config = KeelConfig {
        memory: MemoryConfig {
            max_entries: 50,
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Arc::new(Engine::with_config(tmp.path(), config).expect("engine"));
    let id = ProjectId::parse("shared").expect("valid id");
    engine.create_project(&id, "").expect("create");

    let writers = 6;
    let per_writer = 15;
    let barrier = Arc::new(Barrier::new(writers));
    let handles: Vec<_> = (0..writers)
        .map(|w| {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_writer {
                    engine
                        .append(&id, note(format!("writer {w} item {i}")))
                        .expect("append");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("writer thread");
    }

    let total = (writers * per_writer) as u64;
    let paths = engine.store().project(&id);
    let log = keel::core::action_log::ActionLog::new(&id, &paths, 50);
    let doc = log.document().expect("document");
    assert!(doc.is_consistent());
    assert_eq!(doc.stats.total_actions, total);
    assert_eq!(doc.actions.len(), 50);
    assert_eq!(doc.trim_offset(), total - 50);

    let seqs: BTreeSet<u64> = doc.actions.iter().map(|a| a.seq).collect();
    assert_eq!(seqs.len(), 50);
    assert!(doc.actions.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

    let state = Index::new(&id, &paths)
        .sync_state(SOURCE_ACTIONS)
        .expect("sync state")
        .expect("actions row");
    assert_eq!(state.status, SyncStatus::Synced);
    assert_eq!(state.synced_length, total);
    assert_eq!(
        engine.aggregate(&id).expect("aggregate").retained_actions,
        50
    );
}

#[test]
fn projects_progress_independently() {
    let tmp = tempdir().expect("tempdir");
    let engine = Arc::new(Engine::with_config(tmp.path(), KeelConfig::default()).expect("engine"));
    let ids: Vec<ProjectId> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|n| ProjectId::parse(n).expect("valid id"))
        .collect();
    for id in &ids {
        engine.create_project(id, "").expect("create");
    }

    let barrier = Arc::new(Barrier::new(ids.len() * 2));
    let mut handles = Vec::new();
    for id in &ids {
        for worker in 0..2 {
            let engine = Arc::clone(&engine);
            let barrier = Arc::clone(&barrier);
            let id = id.clone();
            handles.push(thread::spawn(move || {
                barrier.wait();
                for i in 0..10 {
                    engine
                        .append(&id, note(format!("{id} {worker} {i}")))
                        .expect("append");
                    if i % 5 == 4 {
                        engine.regenerate(&id).expect("regenerate");
                    }
                }
            }));
        }
    }
    for h in handles {
        h.join().expect("worker thread");
    }

    for id in &ids {
        let actions = engine.all_actions(id).expect("actions");
        assert_eq!(actions.len(), 20);
        assert!(
            actions
                .iter()
                .all(|a| a.description.starts_with(id.as_str()))
        );
        let doc = engine.build(id).expect("build");
        assert_eq!(doc.activity.total_actions, 20);
    }
}

#[test]
fn readers_see_whole_documents_during_writes() {
    let tmp = tempdir().expect("tempdir");
    let engine = Arc::new(Engine::with_config(tmp.path(), KeelConfig::default()).expect("engine"));
    let id = ProjectId::parse("demo").expect("valid id");
    engine.create_project(&id, "").expect("create");

    let writer = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        thread::spawn(move || {
            for i in 0..40 {
                engine
                    .append(&id, note(format!("write {i}")))
                    .expect("append");
            }
        })
    };
    let reader = {
        let engine = Arc::clone(&engine);
        let id = id.clone();
        thread::spawn(move || {
            let mut last = 0;
            for _ in 0..40 {
                let recent = engine.recent(&id, Some(5)).expect("recent");
                let seen = recent.first().map(|a| a.seq + 1).unwrap_or(0);
                assert!(seen >= last, "log went backwards");
                last = seen;
            }
        })
    };
    writer.join().expect("writer");
    reader.join().expect("reader");
    assert_eq!(engine.all_actions(&id).expect("actions").len(), 40);
}
