//! PathGuard: closed allow-list gate for filesystem access.
//!
//! Rules are evaluated in order and the first one that applies decides:
//! 1. invalid, traversing, or out-of-project paths are denied
//! 2. protected infrastructure is denied for write and delete
//! 3. the allow-list for the requested operation kind admits the path
//! 4. everything else is denied
//!
//! A check never fails with an error. Refusals come back as [`Verdict::Deny`]
//! carrying a user-safe reason and the internal rule name separately.

use crate::core::config::ProtectionConfig;
use crate::core::error::KeelError;
use crate::core::store::{PROJECTS_DIR, ProjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Read,
    Write,
    Delete,
}

impl OpKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OpKind::Read => "read",
            OpKind::Write => "write",
            OpKind::Delete => "delete",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "read" => Some(OpKind::Read),
            "write" => Some(OpKind::Write),
            "delete" => Some(OpKind::Delete),
            _ => None,
        }
    }

    pub fn is_mutating(self) -> bool {
        !matches!(self, OpKind::Read)
    }
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Allow { rule: String },
    Deny { rule: String, reason: String },
}

/// A single guard decision, complete enough to be replayed from the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardDecision {
    pub requested: String,
    /// Project-relative form, when normalisation succeeded.
    pub normalized: Option<String>,
    pub kind: OpKind,
    pub verdict: Verdict,
}

impl GuardDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self.verdict, Verdict::Allow { .. })
    }

    pub fn rule(&self) -> &str {
        match &self.verdict {
            Verdict::Allow { rule } | Verdict::Deny { rule, .. } => rule,
        }
    }

    /// Message fit for an end user. Never names the rule or pattern.
    pub fn user_message(&self) -> String {
        match &self.verdict {
            Verdict::Allow { .. } => format!("{} of '{}' permitted", self.kind, self.requested),
            Verdict::Deny { reason, .. } => format!(
                "Refused to {} '{}': {}",
                self.kind, self.requested, reason
            ),
        }
    }

    /// The normalized path when allowed, else `ProtectionDenied`.
    pub fn into_result(self) -> Result<String, KeelError> {
        match self.verdict {
            Verdict::Allow { .. } => Ok(self.normalized.unwrap_or(self.requested)),
            Verdict::Deny { rule, reason } => Err(KeelError::ProtectionDenied {
                path: self.requested,
                rule,
                reason,
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionRule {
    pub pattern: String,
    pub kind: OpKind,
    pub allow: bool,
}

pub const DEFAULT_PROTECTED: &[&str] = &[".keel", ".keel/**", ".git", ".git/**"];

pub const DEFAULT_MUTABLE: &[&str] = &[
    "*",
    "src/**",
    "lib/**",
    "app/**",
    "tests/**",
    "test/**",
    "docs/**",
    "scripts/**",
    "assets/**",
    "static/**",
    "templates/**",
    "config/**",
    "examples/**",
];

/// The rule set. Built once per process; immutable afterwards.
#[derive(Debug, Clone)]
pub struct PathGuard {
    rules: Vec<ProtectionRule>,
}

impl Default for PathGuard {
    fn default() -> Self {
        Self::from_config(&ProtectionConfig::default())
    }
}

impl PathGuard {
    pub fn from_config(config: &ProtectionConfig) -> Self {
        let protected = DEFAULT_PROTECTED
            .iter()
            .map(|s| s.to_string())
            .chain(config.protected.iter().cloned());

        let mut rules = Vec::new();
        for pattern in protected {
            for kind in [OpKind::Write, OpKind::Delete] {
                rules.push(ProtectionRule {
                    pattern: pattern.clone(),
                    kind,
                    allow: false,
                });
            }
        }
        rules.push(ProtectionRule {
            pattern: "**".to_string(),
            kind: OpKind::Read,
            allow: true,
        });
        for kind in [OpKind::Write, OpKind::Delete] {
            rules.extend(DEFAULT_MUTABLE.iter().map(|p| ProtectionRule {
                pattern: p.to_string(),
                kind,
                allow: true,
            }));
        }
        for (kind, extra) in [
            (OpKind::Read, &config.read_allow),
            (OpKind::Write, &config.write_allow),
            (OpKind::Delete, &config.delete_allow),
        ] {
            rules.extend(extra.iter().map(|p| ProtectionRule {
                pattern: p.clone(),
                kind,
                allow: true,
            }));
        }
        Self { rules }
    }

    pub fn rules(&self) -> &[ProtectionRule] {
        &self.rules
    }

    fn first_rule(&self, kind: OpKind, allow: bool, rel: &str) -> Option<&ProtectionRule> {
        self.rules
            .iter()
            .find(|r| r.kind == kind && r.allow == allow && glob_match(&r.pattern, rel))
    }

    /// Bind the rule set to one project root.
    pub fn scoped<'a>(&'a self, project: &'a ProjectId, root: &'a Path) -> ScopedGuard<'a> {
        ScopedGuard {
            guard: self,
            project,
            root,
        }
    }
}

pub struct ScopedGuard<'a> {
    guard: &'a PathGuard,
    project: &'a ProjectId,
    root: &'a Path,
}

impl ScopedGuard<'_> {
    pub fn check(&self, path: &str, kind: OpKind) -> GuardDecision {
        let deny = |normalized: Option<String>, rule: &str, reason: &str| GuardDecision {
            requested: path.to_string(),
            normalized,
            kind,
            verdict: Verdict::Deny {
                rule: rule.to_string(),
                reason: reason.to_string(),
            },
        };

        let rel = match self.normalize(path) {
            Ok(rel) => rel,
            Err((rule, reason)) => return deny(None, rule, reason),
        };

        if !resolves_inside(self.root, &rel) {
            return deny(Some(rel), "outside_project", "path resolves outside the project");
        }

        // Protection only ever blocks mutation; reads fall through to the allow list.
        if kind.is_mutating() {
            if let Some(r) = self.guard.first_rule(kind, false, &rel) {
                return deny(
                    Some(rel),
                    format!("protected:{}", r.pattern).as_str(),
                    "path belongs to protected infrastructure",
                );
            }
        }

        if let Some(r) = self.guard.first_rule(kind, true, &rel) {
            return GuardDecision {
                requested: path.to_string(),
                normalized: Some(rel),
                kind,
                verdict: Verdict::Allow {
                    rule: format!("allow:{}", r.pattern),
                },
            };
        }

        deny(
            Some(rel),
            "default_deny",
            format!("path is not open for {}", kind).as_str(),
        )
    }

    /// Project-relative, `/`-separated form of `path`, or the rule that rejects it.
    pub fn normalize(&self, path: &str) -> Result<String, (&'static str, &'static str)> {
        let trimmed = path.trim();
        if trimmed.is_empty() || trimmed.contains('\0') {
            return Err(("invalid_path", "path is empty or malformed"));
        }
        let unified = trimmed.replace('\\', "/");

        let candidate = Path::new(&unified);
        let relative: PathBuf = if candidate.is_absolute() {
            match candidate.strip_prefix(self.root) {
                Ok(rest) => rest.to_path_buf(),
                Err(_) => return Err(("outside_project", "path is outside the project")),
            }
        } else {
            candidate.to_path_buf()
        };

        let mut segments: Vec<String> = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(seg) => segments.push(seg.to_string_lossy().to_string()),
                Component::CurDir => {}
                Component::ParentDir => {
                    return Err(("traversal", "path contains a parent-directory segment"));
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(("outside_project", "path is outside the project"));
                }
            }
        }

        // Workspace-relative form: projects/<id>/...
        if segments.first().map(String::as_str) == Some(PROJECTS_DIR) {
            if segments.get(1).map(String::as_str) == Some(self.project.as_str()) {
                segments.drain(..2);
            } else {
                return Err(("outside_project", "path belongs to another project"));
            }
        }

        if segments.is_empty() {
            return Err(("invalid_path", "path names the project root itself"));
        }
        Ok(segments.join("/"))
    }
}

/// Follows symlinks for the longest existing prefix of `root/rel`.
fn resolves_inside(root: &Path, rel: &str) -> bool {
    let Ok(canonical_root) = root.canonicalize() else {
        // Nothing exists yet, so nothing can be linked elsewhere.
        return true;
    };
    let mut probe = root.join(rel);
    loop {
        if let Ok(resolved) = probe.canonicalize() {
            return resolved.starts_with(&canonical_root);
        }
        if !probe.pop() {
            return true;
        }
    }
}

/// Glob over `/`-separated paths: `*` and `?` stay within one segment, `**`
/// spans any number of segments (including none).
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let p: Vec<&str> = pattern.split('/').filter(|s| !s.is_empty()).collect();
    let t: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    match_segments(&p, &t)
}

fn match_segments(pattern: &[&str], text: &[&str]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some((&"**", rest)) => (0..=text.len()).any(|i| match_segments(rest, &text[i..])),
        Some((seg, rest)) => match text.split_first() {
            Some((head, tail)) => segment_match(seg, head) && match_segments(rest, tail),
            None => false,
        },
    }
}

fn segment_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard_fixture() -> (PathGuard, ProjectId, PathBuf) {
        (
            PathGuard::default(),
            ProjectId::parse("demo").unwrap(),
            PathBuf::from("/nonexistent-keel-root/projects/demo"),
        )
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "foo"));
        assert!(!glob_match("*", "src/foo"));
        assert!(glob_match("*.rs", "main.rs"));
        assert!(glob_match("**/.credentials", "foo/bar/.credentials"));
        assert!(glob_match("src/**", "src/lib.rs"));
        assert!(glob_match("src/**", "src/a/b/c.rs"));
        assert!(glob_match(".keel/**", ".keel"));
        assert!(glob_match(".env*", ".env.local"));
        assert!(glob_match("te?t/*.py", "test/a.py"));
        assert!(!glob_match("src/**", "srcx/lib.rs"));
    }

    #[test]
    fn normalisation_strips_workspace_prefix() {
        let (g, id, root) = guard_fixture();
        let scoped = g.scoped(&id, &root);
        assert_eq!(scoped.normalize("projects/demo/src/a.rs").unwrap(), "src/a.rs");
        assert_eq!(scoped.normalize("./src//a.rs").unwrap(), "src/a.rs");
        assert_eq!(
            scoped
                .normalize("/nonexistent-keel-root/projects/demo/README.md")
                .unwrap(),
            "README.md"
        );
        assert_eq!(scoped.normalize("projects/other/a.rs").unwrap_err().0, "outside_project");
        assert_eq!(scoped.normalize("/etc/passwd").unwrap_err().0, "outside_project");
        assert_eq!(scoped.normalize("src/../../x").unwrap_err().0, "traversal");
        assert_eq!(scoped.normalize("  ").unwrap_err().0, "invalid_path");
    }

    #[test]
    fn rule_order_is_honoured() {
        let (g, id, root) = guard_fixture();
        let scoped = g.scoped(&id, &root);

        let d = scoped.check("src/main.rs", OpKind::Write);
        assert!(d.is_allowed());
        assert_eq!(d.rule(), "allow:src/**");

        let d = scoped.check(".keel/memory.json", OpKind::Write);
        assert!(!d.is_allowed());
        assert_eq!(d.rule(), "protected:.keel/**");

        let d = scoped.check(".keel/memory.json", OpKind::Read);
        assert!(d.is_allowed());

        let d = scoped.check("vendor/lib.c", OpKind::Delete);
        assert_eq!(d.rule(), "default_deny");
    }

    #[test]
    fn deny_message_hides_rule() {
        let (g, id, root) = guard_fixture();
        let d = g.scoped(&id, &root).check(".git/config", OpKind::Delete);
        let msg = d.user_message();
        assert!(msg.contains(".git/config"));
        assert!(!msg.contains("protected:"));
    }

    #[test]
    fn configured_patterns_extend_defaults() {
        let config = ProtectionConfig {
            write_allow: vec!["vendor/**".to_string()],
            protected: vec!["src/generated/**".to_string()],
            ..Default::default()
        };
        let g = PathGuard::from_config(&config);
        let id = ProjectId::parse("demo").unwrap();
        let root = PathBuf::from("/nonexistent-keel-root/projects/demo");
        let scoped = g.scoped(&id, &root);
        assert!(scoped.check("vendor/x.c", OpKind::Write).is_allowed());
        assert!(!scoped.check("vendor/x.c", OpKind::Delete).is_allowed());
        assert!(!scoped.check("src/generated/a.rs", OpKind::Write).is_allowed());
    }
}
