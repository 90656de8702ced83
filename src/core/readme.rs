//! README excerpt for the context document.
//!
//! The excerpt favours the introduction (or an overview-style section) and
//! an architecture-style section, with markdown noise removed, cut to a
//! character budget.

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::LazyLock;

static CODE_FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```.*?```").expect("static regex"));
static IMAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!\[[^\]]*\]\([^)]*\)").expect("static regex"));
static LINK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]+)\]\([^)]+\)").expect("static regex"));
static HEADING_MARK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#+[ \t]*").expect("static regex"));
static BLANK_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("static regex"));
static SPACE_RUN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("static regex"));
static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("static regex"));

const OVERVIEW_HEADINGS: &[&str] = &["description", "overview", "about", "summary", "introduction"];
const ARCHITECTURE_HEADINGS: &[&str] = &["architecture", "structure", "design", "system"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReadmeBlock {
    pub preview: Option<String>,
    pub checksum: Option<String>,
}

impl ReadmeBlock {
    pub fn from_content(content: &str, max_chars: usize) -> Self {
        let preview = excerpt(content, max_chars);
        Self {
            preview: (!preview.is_empty()).then_some(preview),
            checksum: Some(checksum(content.as_bytes())),
        }
    }
}

pub fn checksum(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

struct Section<'a> {
    heading: Option<String>,
    body: &'a str,
}

/// Split on level-2+ headings. The first section holds everything before
/// the first such heading, title included.
fn sections(text: &str) -> Vec<Section<'_>> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut heading: Option<String> = None;
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim_start();
        if trimmed.starts_with("##") {
            out.push(Section {
                heading: heading.take(),
                body: &text[start..offset],
            });
            heading = Some(trimmed.trim_start_matches('#').trim().to_lowercase());
            start = offset + line.len();
        }
        offset += line.len();
    }
    out.push(Section {
        heading,
        body: &text[start..],
    });
    out
}

fn paragraphs(text: &str) -> Vec<&str> {
    PARAGRAPH_RE
        .split(text.trim())
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect()
}

fn heading_has(section: &Section<'_>, keywords: &[&str]) -> bool {
    section
        .heading
        .as_deref()
        .is_some_and(|h| keywords.iter().any(|k| h.contains(k)))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let budget = max_chars.saturating_sub(1);
    let cut: String = text.chars().take(budget).collect();
    // Prefer a word boundary when it keeps most of the budget.
    let cut = match cut.rfind(' ') {
        Some(i) if cut[..i].chars().count() * 5 > budget * 4 => cut[..i].to_string(),
        _ => cut,
    };
    format!("{}…", cut.trim_end())
}

/// Plain-text excerpt of at most `max_chars` characters.
pub fn excerpt(content: &str, max_chars: usize) -> String {
    if content.trim().is_empty() || max_chars == 0 {
        return String::new();
    }
    let text = content.replace('\r', "");
    let text = CODE_FENCE_RE.replace_all(&text, "");
    let text = IMAGE_RE.replace_all(&text, "");
    let text = LINK_RE.replace_all(&text, "$1").into_owned();

    let sections = sections(&text);
    let mut overview: Option<String> = None;
    let mut architecture: Option<String> = None;

    if let Some(intro) = sections.first().filter(|s| s.heading.is_none()) {
        let paras = paragraphs(intro.body);
        let lower = intro.body.to_lowercase();
        let take = if ARCHITECTURE_HEADINGS.iter().any(|k| lower.contains(k)) {
            5
        } else {
            2
        };
        if !paras.is_empty() {
            overview = Some(paras.into_iter().take(take).collect::<Vec<_>>().join("\n\n"));
        }
    }
    for section in sections.iter().filter(|s| s.heading.is_some()) {
        let body = section.body.trim();
        if body.is_empty() {
            continue;
        }
        if overview.is_none() && heading_has(section, OVERVIEW_HEADINGS) {
            overview = Some(body.to_string());
        } else if architecture.is_none() && heading_has(section, ARCHITECTURE_HEADINGS) {
            architecture = Some(truncate_chars(body, max_chars / 2));
        }
    }

    let mut parts: Vec<String> = overview.into_iter().chain(architecture).collect();
    if parts.is_empty() {
        parts = paragraphs(&text).into_iter().take(2).map(str::to_string).collect();
    }

    let joined = parts.join("\n\n");
    let cleaned = HEADING_MARK_RE.replace_all(&joined, "");
    let cleaned = BLANK_RUN_RE.replace_all(&cleaned, "\n\n");
    let cleaned = SPACE_RUN_RE.replace_all(&cleaned, " ");
    truncate_chars(cleaned.trim(), max_chars)
}
