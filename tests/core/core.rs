use keel::core::action_log::{self, ActionType};
use keel::core::broker::{self, ProjectBroker};
use keel::core::config::{self, KeelConfig};
use keel::core::db;
use keel::core::error::KeelError;
use keel::core::jsonfile::{self, Loaded};
use keel::core::project;
use keel::core::records::{self, Snapshot};
use keel::core::store::{ProjectId, Store};
use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::tempdir;

fn id(name: &str) -> ProjectId {
    ProjectId::parse(name).expect("valid project id")
}

#[test]
fn project_ids_reject_hostile_names() {
    for bad in ["", "   ", "../evil", "a/b", "a b", "con", "LPT1", "naïve"] {
        assert!(
            matches!(ProjectId::parse(bad), Err(KeelError::ValidationError(_))),
            "'{}' should be rejected",
            bad
        );
    }
    assert!(ProjectId::parse(&"x".repeat(65)).is_err());
    assert_eq!(id(" web-app_2 ").as_str(), "web-app_2");
}

#[test]
fn create_seeds_tree_and_state_files() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let demo = id("demo");

    let paths = project::create(&store, &demo, "Chart rendering service").expect("create");
    for dir in ["src", "tests", "docs"] {
        assert!(paths.root.join(dir).is_dir(), "{} missing", dir);
    }
    assert!(paths.root.join("README.md").is_file());
    assert!(paths.action_log().is_file());
    assert!(paths.commit_history().is_file());
    assert!(paths.snapshot().is_file());
    assert!(paths.config().is_file());
    assert!(paths.index_db().is_file());
    assert!(paths.runs_dir().is_dir());

    let cfg = records::load_project_config(&paths)
        .expect("load config")
        .present()
        .expect("config present");
    assert_eq!(cfg.description, "Chart rendering service");

    let snapshot = jsonfile::load_required::<Snapshot>(&paths.snapshot()).expect("snapshot");
    assert_eq!(snapshot, Snapshot::default());

    let err = project::create(&store, &demo, "again").expect_err("duplicate create");
    assert_eq!(err.kind(), "validation");
}

#[test]
fn racing_creates_of_one_name_admit_a_single_winner() {
    let tmp = tempdir().expect("tempdir");
    let store = Arc::new(Store::new(tmp.path()));
    let racers = 8;
    let barrier = Arc::new(Barrier::new(racers));

    let handles: Vec<_> = (0..racers)
        .map(|i| {
            let store = Arc::clone(&store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                project::create(&store, &id("race"), &format!("racer {i}")).is_ok()
            })
        })
        .collect();
    let winners = handles
        .into_iter()
        .map(|h| h.join().expect("racer thread"))
        .filter(|ok| *ok)
        .count();
    assert_eq!(winners, 1);

    let paths = store.project(&id("race"));
    let log = action_log::load_document(&paths)
        .expect("load log")
        .present()
        .expect("log present");
    assert_eq!(log.stats.total_actions, 0);
}

#[test]
fn list_skips_trash_and_invalid_directories() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    assert!(project::list(&store).expect("empty list").is_empty());

    project::create(&store, &id("beta"), "").expect("beta");
    project::create(&store, &id("alpha"), "").expect("alpha");
    fs::create_dir_all(store.projects_dir().join("not valid")).expect("odd dir");
    fs::create_dir_all(store.trash_dir().join("old")).expect("trash dir");
    fs::write(store.projects_dir().join("stray.txt"), "x").expect("stray file");

    let names: Vec<String> = project::list(&store)
        .expect("list")
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, vec!["alpha", "beta"]);
}

#[test]
fn archive_moves_tree_and_records_the_action() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let demo = id("demo");
    project::create(&store, &demo, "").expect("create");

    let target = project::archive(&store, &demo, 300).expect("archive");
    assert_eq!(target, store.trash_dir().join("demo"));
    assert!(!store.project(&demo).root.exists());
    assert!(project::list(&store).expect("list").is_empty());
    assert_eq!(project::archived(&store).expect("archived"), vec!["demo"]);

    let archived_log = target.join(".keel").join("memory.json");
    let doc: action_log::ActionLogDocument =
        jsonfile::load_required(&archived_log).expect("archived log");
    let last = doc.actions.last().expect("archive action");
    assert_eq!(last.action_type, ActionType::Archive);

    // A second project of the same name can be archived over the first.
    project::create(&store, &demo, "second").expect("recreate");
    project::archive(&store, &demo, 300).expect("archive again");
    assert_eq!(project::archived(&store).expect("archived"), vec!["demo"]);

    let missing = project::archive(&store, &id("ghost"), 300).expect_err("missing project");
    assert_eq!(missing.kind(), "not_found");
}

#[test]
fn delete_removes_project_permanently() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let demo = id("demo");
    project::create(&store, &demo, "").expect("create");
    project::delete(&store, &demo).expect("delete");
    assert!(!store.project(&demo).root.exists());
    assert!(project::archived(&store).expect("archived").is_empty());
}

#[test]
fn config_file_is_partial_and_validated() {
    let tmp = tempdir().expect("tempdir");
    assert_eq!(
        config::load_config(tmp.path()).expect("defaults"),
        KeelConfig::default()
    );

    fs::write(
        tmp.path().join(config::CONFIG_FILE_NAME),
        "[memory]\nmax_entries = 10\n\n[protection]\nwrite_allow = [\"build/**\"]\n",
    )
    .expect("write keel.toml");
    let cfg = config::load_config(tmp.path()).expect("load");
    assert_eq!(cfg.memory.max_entries, 10);
    assert_eq!(cfg.memory.context_window, 5);
    assert_eq!(cfg.protection.write_allow, vec!["build/**"]);

    fs::write(
        tmp.path().join(config::CONFIG_FILE_NAME),
        "[context]\nreadme_chars = 100\n",
    )
    .expect("write keel.toml");
    let err = config::load_config(tmp.path()).expect_err("readme_chars out of range");
    assert_eq!(err.kind(), "validation");

    fs::write(
        tmp.path().join(config::CONFIG_FILE_NAME),
        "[protection]\nwrite_allow = [\"../outside/**\"]\n",
    )
    .expect("write keel.toml");
    assert!(config::load_config(tmp.path()).is_err());
}

#[test]
fn jsonfile_distinguishes_missing_present_and_corrupt() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("state.json");

    assert!(matches!(
        jsonfile::load::<Snapshot>(&path).expect("load"),
        Loaded::Missing
    ));

    jsonfile::write_atomic(&path, &Snapshot::default()).expect("write");
    assert!(matches!(
        jsonfile::load::<Snapshot>(&path).expect("load"),
        Loaded::Present(_)
    ));

    fs::write(&path, "{ not json").expect("corrupt");
    assert!(matches!(
        jsonfile::load::<Snapshot>(&path).expect("load"),
        Loaded::Corrupt { .. }
    ));
    let err = jsonfile::load_required::<Snapshot>(&path).expect_err("corrupt required");
    assert_eq!(err.kind(), "corrupt_source");

    let moved = jsonfile::quarantine(&path).expect("quarantine");
    assert!(!path.exists());
    assert!(moved.is_file());
    assert!(
        moved
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("state.json.corrupted_"))
    );
}

#[test]
fn broker_audits_every_scope_with_its_status() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let demo = id("demo");
    let paths = project::create(&store, &demo, "").expect("create");
    let broker = ProjectBroker::new(&demo, &paths).expect("broker");

    let before = broker::read_audit(&paths).expect("audit").len();
    broker
        .with_lock("tester", "probe.ok", || Ok(()))
        .expect("ok scope");
    let err = broker
        .with_lock("tester", "probe.fail", || -> Result<(), KeelError> {
            Err(KeelError::ValidationError("boom".to_string()))
        })
        .expect_err("failing scope");
    assert_eq!(err.kind(), "validation");

    let events = broker::read_audit(&paths).expect("audit");
    assert_eq!(events.len(), before + 2);
    let ok = &events[events.len() - 2];
    let failed = &events[events.len() - 1];
    assert_eq!((ok.op.as_str(), ok.status.as_str()), ("probe.ok", "success"));
    assert_eq!(
        (failed.op.as_str(), failed.status.as_str()),
        ("probe.fail", "error")
    );
    assert_eq!(failed.actor, "tester");
    assert_eq!(failed.project, "demo");
}

#[test]
fn broker_serializes_read_modify_write_across_threads() {
    let tmp = tempdir().expect("tempdir");
    let store = Store::new(tmp.path());
    let demo = id("demo");
    let paths = project::create(&store, &demo, "").expect("create");
    let counter = paths.root.join("counter.txt");
    fs::write(&counter, "0").expect("seed counter");

    let threads = 8;
    let rounds = 25;
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let barrier = Arc::clone(&barrier);
            let demo = demo.clone();
            let paths = paths.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    let broker = ProjectBroker::new(&demo, &paths).expect("broker");
                    broker
                        .with_lock("tester", "counter.bump", || {
                            let n: u64 = fs::read_to_string(&counter)?.trim().parse().unwrap_or(0);
                            fs::write(&counter, (n + 1).to_string())?;
                            Ok(())
                        })
                        .expect("bump");
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("thread");
    }

    let total: u64 = fs::read_to_string(&counter)
        .expect("read counter")
        .trim()
        .parse()
        .expect("number");
    assert_eq!(total, (threads * rounds) as u64);
}

#[test]
fn index_database_is_hardened() {
    let tmp = tempdir().expect("tempdir");
    let path = tmp.path().join("context.db");
    let conn = db::db_connect(&path).expect("db connect");
    db::ensure_index_schema(&conn).expect("schema");

    let fk_on: i64 = conn
        .query_row("PRAGMA foreign_keys;", [], |row| row.get(0))
        .expect("pragma foreign_keys");
    assert_eq!(fk_on, 1);

    let tables: Vec<String> = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
        .expect("prepare")
        .query_map([], |r| r.get::<_, String>(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows");
    for table in ["actions", "commits", "documents", "runs", "sync_metadata"] {
        assert!(tables.iter().any(|t| t == table), "{} missing", table);
    }
}
