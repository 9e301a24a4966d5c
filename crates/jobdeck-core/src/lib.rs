//! Core domain model for jobdeck: remote items, local annotations, records.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jobdeck-core";

pub const RATING_MIN: u8 = 0;
pub const RATING_MAX: u8 = 5;

/// Kind of a remote item. Anything the remote reports beyond jobs and
/// comments (polls, poll options) is kept as `Other` and excluded from
/// listings by default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Job,
    Comment,
    Other,
}

/// Snapshot of a remote entity (job posting or discussion comment).
///
/// Item fields are replaced wholesale on every successful re-fetch of the
/// same ID; nothing user-authored lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: u64,
    pub kind: ItemKind,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub child_ids: Vec<u64>,
    #[serde(default)]
    pub dead: bool,
    #[serde(default)]
    pub deleted: bool,
}

impl Item {
    /// Placeholder for an ID the remote confirmed absent. Tombstones are
    /// cached so the ID is never fetched again.
    pub fn tombstone(id: u64, kind: ItemKind) -> Self {
        Self {
            id,
            kind,
            title: None,
            text: None,
            url: None,
            author: None,
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            child_ids: Vec::new(),
            dead: false,
            deleted: true,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.dead || self.deleted
    }

    /// True for the monthly "Who is hiring?" submissions, whose comments
    /// are the actual postings worth pulling in.
    pub fn is_hiring_thread(&self) -> bool {
        self.author.as_deref() == Some("whoishiring")
    }

    /// Plain-text rendering of the HTML `text` body.
    pub fn body_text(&self) -> String {
        html_to_text(self.text.as_deref().unwrap_or_default())
    }
}

/// User-authored overlay for one item. Never touched by fetches; only an
/// explicit edit mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub rating: Option<u8>,
    pub reviewed_at: DateTime<Utc>,
}

impl Annotation {
    pub fn empty(reviewed_at: DateTime<Utc>) -> Self {
        Self {
            tags: BTreeSet::new(),
            rating: None,
            reviewed_at,
        }
    }
}

/// One item paired with its local state: the optional annotation, when the
/// snapshot was taken, and whether the listing still carries it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub item: Item,
    #[serde(default)]
    pub annotation: Option<Annotation>,
    pub fetched_at: DateTime<Utc>,
    #[serde(default)]
    pub stale: bool,
}

impl Record {
    pub fn rating(&self) -> Option<u8> {
        self.annotation.as_ref().and_then(|a| a.rating)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.annotation
            .as_ref()
            .map(|a| a.tags.contains(tag))
            .unwrap_or(false)
    }
}

/// How an edit treats the rating field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RatingEdit {
    Set(u8),
    Clear,
}

/// A single user edit against one record's annotation.
#[derive(Debug, Clone, Default)]
pub struct AnnotationEdit {
    pub add_tags: Vec<String>,
    pub remove_tags: Vec<String>,
    pub rating: Option<RatingEdit>,
}

impl AnnotationEdit {
    pub fn add_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            add_tags: tags.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn set_rating(rating: u8) -> Self {
        Self {
            rating: Some(RatingEdit::Set(rating)),
            ..Self::default()
        }
    }

    pub fn clear_rating() -> Self {
        Self {
            rating: Some(RatingEdit::Clear),
            ..Self::default()
        }
    }

    pub fn is_noop(&self) -> bool {
        self.add_tags.is_empty() && self.remove_tags.is_empty() && self.rating.is_none()
    }
}

/// Convert the remote's HTML item bodies to plain text.
///
/// The remote only emits a small HTML subset in practice: `<p>`, `<br>`,
/// inline links/emphasis, and a handful of escaped entities. Paragraphs
/// become blank-line breaks, `<br>` a newline, every other tag is dropped.
pub fn html_to_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut i = 0;

    while i < html.len() {
        let rest = &html[i..];
        if let Some(rest) = rest.strip_prefix('<') {
            let end = match rest.find('>') {
                Some(end) => end,
                None => break,
            };
            let tag = rest[..end].trim().trim_end_matches('/').trim();
            if !tag.starts_with('/') {
                let name = tag
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_ascii_lowercase();
                match name.as_str() {
                    "br" => out.push('\n'),
                    "p" => out.push_str("\n\n"),
                    _ => {}
                }
            }
            i += end + 2;
        } else if rest.starts_with('&') {
            match decode_entity(rest) {
                Some((ch, len)) => {
                    out.push(ch);
                    i += len;
                }
                None => {
                    out.push('&');
                    i += 1;
                }
            }
        } else {
            let ch = rest.chars().next().expect("index sits on a char boundary");
            out.push(ch);
            i += ch.len_utf8();
        }
    }

    out
}

fn decode_entity(s: &str) -> Option<(char, usize)> {
    const ENTITIES: &[(&str, char)] = &[
        ("&amp;", '&'),
        ("&lt;", '<'),
        ("&gt;", '>'),
        ("&quot;", '"'),
        ("&#x27;", '\''),
        ("&#x2F;", '/'),
        ("&#39;", '\''),
    ];
    ENTITIES
        .iter()
        .find(|(entity, _)| {
            s.len() >= entity.len()
                && s.as_bytes()[..entity.len()].eq_ignore_ascii_case(entity.as_bytes())
        })
        .map(|(entity, ch)| (*ch, entity.len()))
}
