//! Command Precision Layer.
//!
//! Classifies a free-form task string into a typed [`RoutedCommand`] before
//! anything executes. Routing is a pure function of the input text: matchers
//! are tried in the fixed order of [`MATCHERS`] and the first one that
//! extracts successfully wins. Confidence is a property of the matcher, not a
//! score that matchers compete on.
//!
//! Classification looks at the lower-cased text; parameters are cut from the
//! original text so their case survives.

use crate::core::time;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

pub const DELEGATE_CONFIDENCE: f64 = 0.5;

pub const SCRIPT_EXTENSIONS: &[&str] = &["py", "js", "go", "rs", "java", "rb", "sh", "ts"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    ArchiveProject,
    DeleteFile,
    UpdateFile,
    CommitChanges,
    RunLocal,
    /// Hand the whole task to the external executor.
    Delegate,
}

impl Intent {
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::ArchiveProject => "archive_project",
            Intent::DeleteFile => "delete_file",
            Intent::UpdateFile => "update_file",
            Intent::CommitChanges => "commit_changes",
            Intent::RunLocal => "run_local",
            Intent::Delegate => "delegate",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Intent::ArchiveProject,
            Intent::DeleteFile,
            Intent::UpdateFile,
            Intent::CommitChanges,
            Intent::RunLocal,
            Intent::Delegate,
        ]
        .into_iter()
        .find(|i| i.as_str() == raw)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of routing one task string. Never persisted on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutedCommand {
    pub intent: Intent,
    pub params: BTreeMap<String, String>,
    pub confidence: f64,
    /// Name of the matcher that fired.
    pub matcher: String,
    pub original: String,
    /// Epoch milliseconds at routing time.
    pub timestamp: u64,
}

impl RoutedCommand {
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Every filesystem path this command would touch, in parameter order.
    pub fn paths(&self) -> Vec<String> {
        match self.intent {
            Intent::DeleteFile => match self.param("file_paths") {
                Some(list) => list.split(',').map(|p| p.trim().to_string()).collect(),
                None => self.param("file_path").map(str::to_string).into_iter().collect(),
            },
            Intent::UpdateFile => self.param("file_path").map(str::to_string).into_iter().collect(),
            Intent::RunLocal => self
                .param("script_path")
                .map(str::to_string)
                .into_iter()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// The same routing decision with the timestamp blanked, for equality checks.
    pub fn decision(&self) -> (Intent, &BTreeMap<String, String>, f64) {
        (self.intent, &self.params, self.confidence)
    }
}

/// Pre-digested views of a task string shared by all matchers.
pub struct TaskText<'a> {
    pub original: &'a str,
    pub lower: String,
    /// Lower-cased whitespace tokens with surrounding punctuation removed.
    pub words: Vec<String>,
}

impl<'a> TaskText<'a> {
    pub fn new(original: &'a str) -> Self {
        let lower = original.to_lowercase();
        let words = lower
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '_' && c != '-'))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        Self {
            original,
            lower,
            words,
        }
    }

    fn has_word(&self, word: &str) -> bool {
        self.words.iter().any(|w| w == word)
    }

    fn has_any_word(&self, words: &[&str]) -> bool {
        words.iter().any(|w| self.has_word(w))
    }

    /// True when some word is an inflection of one of `bases` (fix, fixes, fixed, fixing).
    fn has_any_verb(&self, bases: &[&str]) -> bool {
        self.words
            .iter()
            .any(|w| bases.iter().any(|b| inflects(w, b)))
    }
}

fn inflects(word: &str, base: &str) -> bool {
    if !word.chars().all(|c| c.is_ascii_alphabetic()) {
        return false;
    }
    if word == base {
        return true;
    }
    let Some(rest) = word.strip_prefix(base) else {
        let stem = base
            .strip_suffix('e')
            .or_else(|| base.strip_suffix('y'))
            .unwrap_or(base);
        return match word.strip_prefix(stem) {
            Some(rest) if base.ends_with('e') => matches!(rest, "ing" | "ed"),
            Some(rest) if base.ends_with('y') => matches!(rest, "ies" | "ied"),
            _ => false,
        };
    };
    matches!(rest, "s" | "es" | "d" | "ed" | "ing")
}

struct Extraction {
    params: BTreeMap<String, String>,
    confidence: f64,
}

impl Extraction {
    fn new(confidence: f64) -> Self {
        Self {
            params: BTreeMap::new(),
            confidence,
        }
    }

    fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }
}

type Extractor = fn(&TaskText<'_>) -> Option<Extraction>;

/// One entry of the ordered matcher table.
pub struct Matcher {
    pub name: &'static str,
    pub intent: Intent,
    /// Lower runs first. Mirrors the position in [`MATCHERS`].
    pub priority: u16,
    extract: Extractor,
}

impl Matcher {
    /// Evaluate this matcher alone.
    pub fn evaluate(&self, task: &str) -> Option<(BTreeMap<String, String>, f64)> {
        (self.extract)(&TaskText::new(task)).map(|e| (e.params, e.confidence))
    }
}

/// Fixed precedence. Earlier entries win over later ones.
pub static MATCHERS: &[Matcher] = &[
    Matcher {
        name: "code_change_precheck",
        intent: Intent::Delegate,
        priority: 10,
        extract: code_change_precheck,
    },
    Matcher {
        name: "archive_project_phrase",
        intent: Intent::ArchiveProject,
        priority: 20,
        extract: archive_project_phrase,
    },
    Matcher {
        name: "archive_project_keyword",
        intent: Intent::ArchiveProject,
        priority: 30,
        extract: archive_project_keyword,
    },
    Matcher {
        name: "delete_file",
        intent: Intent::DeleteFile,
        priority: 40,
        extract: delete_file,
    },
    Matcher {
        name: "update_file",
        intent: Intent::UpdateFile,
        priority: 50,
        extract: update_file,
    },
    Matcher {
        name: "commit_changes",
        intent: Intent::CommitChanges,
        priority: 60,
        extract: commit_changes,
    },
    Matcher {
        name: "run_local_phrase",
        intent: Intent::RunLocal,
        priority: 70,
        extract: run_local_phrase,
    },
    Matcher {
        name: "run_local_endpoint",
        intent: Intent::RunLocal,
        priority: 80,
        extract: run_local_endpoint,
    },
    Matcher {
        name: "run_local_keyword",
        intent: Intent::RunLocal,
        priority: 90,
        extract: run_local_keyword,
    },
];

pub const FALLBACK_MATCHER: &str = "fallback";

pub fn route(task: &str) -> RoutedCommand {
    route_at(task, time::now_epoch_ms())
}

/// Route with an explicit timestamp. Everything except `timestamp` is a
/// function of `task` alone.
pub fn route_at(task: &str, timestamp: u64) -> RoutedCommand {
    let text = TaskText::new(task);
    for matcher in MATCHERS {
        if let Some(extraction) = (matcher.extract)(&text) {
            return RoutedCommand {
                intent: matcher.intent,
                params: extraction.params,
                confidence: extraction.confidence,
                matcher: matcher.name.to_string(),
                original: task.to_string(),
                timestamp,
            };
        }
    }
    RoutedCommand {
        intent: Intent::Delegate,
        params: delegate_params(&text),
        confidence: DELEGATE_CONFIDENCE,
        matcher: FALLBACK_MATCHER.to_string(),
        original: task.to_string(),
        timestamp,
    }
}

fn delegate_params(text: &TaskText<'_>) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    params.insert("task".to_string(), text.original.to_string());
    params
}

// --- vocabulary ---

const CODE_CHANGE_VERBS: &[&str] = &["analyze", "analyse", "update", "refactor", "improve"];
const PRECHECK_EXEMPT: &[&str] = &["delete", "remove", "archive", "create"];
const ARCHIVE_VERBS: &[&str] = &["delete", "remove", "archive"];
const DELETE_VERBS: &[&str] = &["delete", "remove", "erase"];
const CODE_NOUNS: &[&str] = &[
    "file", "files", "function", "functions", "class", "classes", "code", "method", "methods",
];
const COMPOUND_VERBS: &[&str] = &[
    "add",
    "create",
    "implement",
    "fix",
    "refactor",
    "delete",
    "remove",
    "update",
    "modify",
];
const GIT_WORDS: &[&str] = &[
    "git", "commit", "push", "pull", "sync", "status", "log", "branch", "diff", "merge", "rebase",
    "stash", "show", "checkout", "reset", "revert", "tag",
];
const RUN_VERBS: &[&str] = &["run", "execute", "launch", "start"];
const ARCHIVE_FILLERS: &[&str] = &["the", "folder", "named", "called", "directory", "project"];

static PROJECT_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

static ARCHIVE_PHRASES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r#"(?i)\b(?:delete|remove|archive)\s+(?:the\s+)?project\s+(?:folder\s+)?(?:(?:named|called)\s+)?["'`]?([A-Za-z0-9_-]+)["'`]?"#,
        r#"(?i)\bmove\s+(?:the\s+)?project\s+["'`]?([A-Za-z0-9_-]+)["'`]?\s+to\s+(?:the\s+)?trash\b"#,
        r#"(?i)\bsoft[\s-]delete\s+(?:the\s+)?project\s+["'`]?([A-Za-z0-9_-]+)["'`]?"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static PROJECT_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bprojects?\b").expect("static regex"));

static PATH_WITH_EXT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_./~-]*[A-Za-z0-9_-]\.[A-Za-z0-9]+$").expect("static regex")
});

static PATH_WITH_DIR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_./~-]*/[A-Za-z0-9_.-]+$").expect("static regex")
});

static UPDATE_FILE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:(?:create|make|add|write|generate)\s+(?:an?\s+)?(?:new\s+)?files?|new\s+file|(?:edit|modify|change|alter)\s+(?:the\s+)?files?)\b",
    )
    .expect("static regex")
});

static CONTENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)(?:\bwith\b|\bcontaining\b|\bcontent:)\s*(.+)$").expect("static regex")
});

static COMMIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:commit\s+(?:the\s+|all\s+|my\s+)?changes|git\s+commit|push\s+(?:the\s+|my\s+)?changes|push\s+to\s+(?:git|github|origin|remote))\b",
    )
    .expect("static regex")
});

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"["']([^"']+)["']"#).expect("static regex"));

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:^|[\s'`\x22(])((?:\.{{0,2}}/)?[A-Za-z0-9_./-]*[A-Za-z0-9_-]\.(?:{}))\b",
        SCRIPT_EXTENSIONS.join("|")
    ))
    .expect("static regex")
});

static RUN_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:run|execute|launch|start)\s+(?:the\s+)?(?:local\s+)?(?:script\s+)?['`\x22]?((?:\.{{0,2}}/)?[A-Za-z0-9_./-]*[A-Za-z0-9_-]\.(?:{}))\b",
        SCRIPT_EXTENSIONS.join("|")
    ))
    .expect("static regex")
});

// --- helpers ---

/// Strip wrapping quotes and trailing sentence punctuation from a token.
pub fn clean_token(raw: &str) -> &str {
    let mut s = raw;
    loop {
        let next = s
            .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '(' | ')' | '[' | ']' | '<' | '>'))
            .trim_end_matches(|c| matches!(c, '.' | ',' | ';' | ':' | '!' | '?'));
        if next == s {
            return s;
        }
        s = next;
    }
}

/// Path-like tokens of `text` in order of appearance, de-duplicated.
pub fn path_tokens(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for raw in text.split(|c: char| c.is_whitespace() || c == ',') {
        let token = clean_token(raw);
        if token.is_empty() {
            continue;
        }
        if (PATH_WITH_EXT_RE.is_match(token) || PATH_WITH_DIR_RE.is_match(token))
            && !out.iter().any(|t| t == token)
        {
            out.push(token.to_string());
        }
    }
    out
}

fn mentions_test_suite(text: &TaskText<'_>) -> bool {
    text.lower.contains("run tests")
        || text.lower.contains("run the tests")
        || text.lower.contains("test suite")
}

fn run_local_blocked(text: &TaskText<'_>) -> bool {
    text.has_any_verb(DELETE_VERBS) || text.has_any_word(GIT_WORDS) || mentions_test_suite(text)
}

fn script_path(text: &TaskText<'_>) -> Option<String> {
    SCRIPT_RE
        .captures(text.original)
        .and_then(|c| c.get(1))
        .map(|m| clean_token(m.as_str()).to_string())
}

// --- extractors ---

fn code_change_precheck(text: &TaskText<'_>) -> Option<Extraction> {
    if text.has_any_verb(CODE_CHANGE_VERBS)
        && !text.has_any_verb(PRECHECK_EXEMPT)
        && !text.has_word("new")
    {
        let mut e = Extraction::new(DELEGATE_CONFIDENCE);
        e.params = delegate_params(text);
        return Some(e);
    }
    None
}

fn archive_project_phrase(text: &TaskText<'_>) -> Option<Extraction> {
    for re in ARCHIVE_PHRASES.iter() {
        let Some(name) = re.captures(text.original).and_then(|c| c.get(1)) else {
            continue;
        };
        let name = clean_token(name.as_str());
        if ARCHIVE_FILLERS.contains(&name.to_lowercase().as_str()) {
            continue;
        }
        if PROJECT_NAME_RE.is_match(name) {
            return Some(Extraction::new(0.95).with("project_name", name));
        }
    }
    None
}

fn archive_project_keyword(text: &TaskText<'_>) -> Option<Extraction> {
    if !text.has_word("project")
        || !text.has_any_verb(ARCHIVE_VERBS)
        || text.has_any_word(CODE_NOUNS)
    {
        return None;
    }
    let tokens: Vec<&str> = text.original.split_whitespace().collect();
    let at = tokens
        .iter()
        .position(|t| clean_token(t).eq_ignore_ascii_case("project"))?;
    let name = tokens[at + 1..]
        .iter()
        .map(|t| clean_token(t))
        .find(|t| !ARCHIVE_FILLERS.contains(&t.to_lowercase().as_str()))?;
    if PROJECT_NAME_RE.is_match(name) {
        Some(Extraction::new(0.90).with("project_name", name))
    } else {
        None
    }
}

fn delete_file(text: &TaskText<'_>) -> Option<Extraction> {
    if !text.has_any_verb(DELETE_VERBS) || PROJECT_WORD_RE.is_match(&text.lower) {
        return None;
    }
    let paths = path_tokens(text.original);
    let first = paths.first()?;
    let explicit = text.has_any_word(&["file", "files"]) || first.contains('/');
    let mut e = Extraction::new(if explicit { 0.90 } else { 0.70 }).with("file_path", first);
    if paths.len() > 1 {
        e = e.with("file_paths", paths.join(","));
    }
    Some(e)
}

fn update_file(text: &TaskText<'_>) -> Option<Extraction> {
    if !UPDATE_FILE_RE.is_match(&text.lower) {
        return None;
    }
    let (head, content) = match CONTENT_RE.captures(text.original) {
        Some(c) => {
            let start = c.get(0).map(|m| m.start()).unwrap_or(text.original.len());
            let body = c.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            (&text.original[..start], Some(strip_wrapping_quotes(body)))
        }
        None => (text.original, None),
    };
    let path = path_tokens(head).into_iter().next()?;
    let mut e = Extraction::new(if content.is_some() { 0.90 } else { 0.80 }).with("file_path", path);
    if let Some(body) = content.filter(|b| !b.is_empty()) {
        e = e.with("content", body);
    }
    Some(e)
}

fn strip_wrapping_quotes(s: &str) -> &str {
    for q in ['"', '\'', '`'] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

fn commit_changes(text: &TaskText<'_>) -> Option<Extraction> {
    if !COMMIT_RE.is_match(&text.lower) {
        return None;
    }
    // A quoted commit message may legitimately say "fix ...".
    let unquoted = QUOTED_RE.replace_all(text.original, " ");
    if TaskText::new(&unquoted).has_any_verb(COMPOUND_VERBS) {
        return None;
    }
    let mut e = Extraction::new(0.90);
    if let Some(msg) = QUOTED_RE.captures(text.original).and_then(|c| c.get(1)) {
        let msg = msg.as_str().trim();
        if !msg.is_empty() {
            e = e.with("message", msg);
        }
    }
    Some(e)
}

fn run_local_phrase(text: &TaskText<'_>) -> Option<Extraction> {
    if run_local_blocked(text) {
        return None;
    }
    let script = RUN_PHRASE_RE.captures(text.original)?.get(1)?;
    Some(Extraction::new(0.95).with("script_path", clean_token(script.as_str())))
}

fn run_local_endpoint(text: &TaskText<'_>) -> Option<Extraction> {
    if run_local_blocked(text)
        || !(text.lower.contains("run-local") || text.lower.contains("run_local"))
    {
        return None;
    }
    Some(Extraction::new(0.90).with("script_path", script_path(text)?))
}

fn run_local_keyword(text: &TaskText<'_>) -> Option<Extraction> {
    if run_local_blocked(text) || !text.has_any_word(RUN_VERBS) {
        return None;
    }
    Some(Extraction::new(0.85).with("script_path", script_path(text)?))
}
