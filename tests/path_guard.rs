use keel::core::config::{KeelConfig, ProtectionConfig};
use keel::core::engine::Engine;
use keel::core::action_log::{ActionPayload, ActionType};
use keel::core::error::KeelError;
use keel::core::path_guard::{OpKind, PathGuard, Verdict, glob_match};
use keel::core::store::ProjectId;
use std::fs;
use tempfile::tempdir;

fn demo() -> ProjectId {
    ProjectId::parse("demo").expect("valid id")
}

#[test]
fn traversal_and_foreign_paths_are_denied_for_every_kind() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("projects").join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();
    let guard = PathGuard::default();
    let scoped = guard.scoped(&id, &root);

    for kind in [OpKind::Read, OpKind::Write, OpKind::Delete] {
        let up = scoped.check("../other/secret.txt", kind);
        assert!(!up.is_allowed());
        assert_eq!(up.rule(), "traversal");

        let nested = scoped.check("src/../../escape.rs", kind);
        assert!(!nested.is_allowed());

        let abs = scoped.check("/etc/passwd", kind);
        assert!(!abs.is_allowed());
        assert_eq!(abs.rule(), "outside_project");

        let sibling = scoped.check("projects/other/src/lib.rs", kind);
        assert!(!sibling.is_allowed());
        assert_eq!(sibling.rule(), "outside_project");
    }

    assert_eq!(scoped.check("", OpKind::Read).rule(), "invalid_path");
    assert_eq!(scoped.check(".", OpKind::Read).rule(), "invalid_path");
}

#[test]
fn workspace_relative_and_absolute_forms_normalize() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("projects").join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();
    let guard = PathGuard::default();
    let scoped = guard.scoped(&id, &root);

    let ws = scoped.check("projects/demo/src/main.rs", OpKind::Write);
    assert!(ws.is_allowed());
    assert_eq!(ws.normalized.as_deref(), Some("src/main.rs"));

    let abs_path = root.join("src").join("main.rs");
    let abs = scoped.check(abs_path.to_str().expect("utf8 path"), OpKind::Write);
    assert!(abs.is_allowed());
    assert_eq!(abs.normalized.as_deref(), Some("src/main.rs"));

    let windows = scoped.check("src\\util\\mod.rs", OpKind::Write);
    assert_eq!(windows.normalized.as_deref(), Some("src/util/mod.rs"));
}

#[test]
fn infrastructure_is_readable_but_never_mutable() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();

    let config = ProtectionConfig {
        write_allow: vec![".keel/**".to_string()],
        delete_allow: vec![".keel/**".to_string()],
        ..Default::default()
    };
    let guard = PathGuard::from_config(&config);
    let scoped = guard.scoped(&id, &root);

    let read = scoped.check(".keel/memory.json", OpKind::Read);
    assert!(read.is_allowed());

    for kind in [OpKind::Write, OpKind::Delete] {
        let d = scoped.check(".keel/memory.json", kind);
        assert!(!d.is_allowed());
        assert_eq!(d.rule(), "protected:.keel/**");

        let dir = scoped.check(".keel", kind);
        assert!(!dir.is_allowed());

        let git = scoped.check(".git/config", kind);
        assert!(!git.is_allowed());
    }
}

#[test]
fn mutation_outside_allow_list_is_default_denied() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();
    let guard = PathGuard::default();
    let scoped = guard.scoped(&id, &root);

    let top = scoped.check("notes.md", OpKind::Write);
    assert!(top.is_allowed());
    assert_eq!(top.rule(), "allow:*");

    let src = scoped.check("src/deep/mod.rs", OpKind::Delete);
    assert_eq!(src.rule(), "allow:src/**");

    let build = scoped.check("build/out.bin", OpKind::Write);
    assert!(!build.is_allowed());
    assert_eq!(build.rule(), "default_deny");

    // Reading is open everywhere inside the project.
    assert!(scoped.check("build/out.bin", OpKind::Read).is_allowed());

    let extended = PathGuard::from_config(&ProtectionConfig {
        write_allow: vec!["build/**".to_string()],
        ..Default::default()
    });
    assert!(
        extended
            .scoped(&id, &root)
            .check("build/out.bin", OpKind::Write)
            .is_allowed()
    );
}

#[test]
fn extra_protected_patterns_win_over_allow_rules() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();
    let guard = PathGuard::from_config(&ProtectionConfig {
        protected: vec!["src/generated/**".to_string()],
        ..Default::default()
    });
    let scoped = guard.scoped(&id, &root);
    let d = scoped.check("src/generated/api.rs", OpKind::Write);
    assert!(!d.is_allowed());
    assert_eq!(d.rule(), "protected:src/generated/**");
    assert!(scoped.check("src/lib.rs", OpKind::Write).is_allowed());
}

#[cfg(unix)]
#[test]
fn symlinks_leaving_the_project_are_denied() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("demo");
    let outside = tmp.path().join("outside");
    fs::create_dir_all(&root).expect("root");
    fs::create_dir_all(&outside).expect("outside");
    fs::write(outside.join("secret.txt"), "s").expect("secret");
    std::os::unix::fs::symlink(&outside, root.join("link")).expect("symlink");

    let id = demo();
    let guard = PathGuard::default();
    let d = guard.scoped(&id, &root).check("link/secret.txt", OpKind::Read);
    assert!(!d.is_allowed());
    assert_eq!(d.rule(), "outside_project");
}

#[test]
fn denial_messages_hide_rule_internals() {
    let tmp = tempdir().expect("tempdir");
    let root = tmp.path().join("demo");
    fs::create_dir_all(&root).expect("root");
    let id = demo();
    let guard = PathGuard::default();
    let d = guard.scoped(&id, &root).check(".keel/config.json", OpKind::Write);

    let msg = d.user_message();
    assert!(msg.starts_with("Refused to write"));
    assert!(!msg.contains("protected:"));
    assert!(!msg.contains("**"));

    match d.into_result() {
        Err(KeelError::ProtectionDenied { path, rule, .. }) => {
            assert_eq!(path, ".keel/config.json");
            assert_eq!(rule, "protected:.keel/**");
        }
        other => panic!("expected denial, got {:?}", other),
    }
}

#[test]
fn glob_semantics() {
    assert!(glob_match("*", "notes.md"));
    assert!(!glob_match("*", "src/notes.md"));
    assert!(glob_match("src/**", "src/a/b/c.rs"));
    assert!(glob_match("src/**", "src"));
    assert!(glob_match("**/*.rs", "lib.rs"));
    assert!(glob_match("docs/?.md", "docs/a.md"));
    assert!(!glob_match("docs/?.md", "docs/ab.md"));
}

#[test]
fn engine_records_each_verdict_as_a_protection_action() {
    let tmp = tempdir().expect("tempdir");
    let engine = Engine::with_config(tmp.path(), KeelConfig::default()).expect("engine");
    let id = demo();
    engine.create_project(&id, "").expect("create");

    let allowed = engine.check(&id, "src/lib.rs", OpKind::Write).expect("check");
    assert!(allowed.is_allowed());
    let denied = engine.check(&id, "../x", OpKind::Read).expect("check");
    assert!(matches!(denied.verdict, Verdict::Deny { .. }));

    let actions = engine.all_actions(&id).expect("actions");
    let protections: Vec<_> = actions
        .iter()
        .filter(|a| a.action_type == ActionType::Protection)
        .collect();
    assert_eq!(protections.len(), 2);
    match &protections[1].extra {
        ActionPayload::Protection {
            path,
            operation,
            rule,
            allowed,
        } => {
            assert_eq!(path, "../x");
            assert_eq!(*operation, OpKind::Read);
            assert_eq!(rule, "traversal");
            assert!(!allowed);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}
