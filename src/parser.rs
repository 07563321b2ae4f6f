//! Markdown note parsing
//!
//! Handles Logseq-flavoured Markdown: YAML front matter, `[[page]]` wiki
//! links, `#tag` hashtags and `key:: value` properties. Cleaning strips
//! markup down to searchable text; chunking splits the cleaned text into
//! embedding units with character offsets into the cleaned content.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::warn;

use crate::error::{NoteseekError, Result};

/// One chunk of cleaned text with its char-offset span `[start, end)`
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkSpan {
    pub text: String,
    pub start: usize,
    pub end: usize,
}

/// A parsed note file
#[derive(Debug, Clone)]
pub struct ParsedNote {
    /// Raw body with front matter removed
    pub content: String,

    /// Front-matter values plus `title`, `created_at`, `modified_at`
    pub metadata: Map<String, Value>,

    pub title: String,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// Markdown document parser with precompiled patterns
pub struct MarkdownParser {
    backlink: Regex,
    tag: Regex,
    property: Regex,
    fenced_code: Regex,
    inline_code: Regex,
    image: Regex,
    link: Regex,
    wiki_link: Regex,
    heading: Regex,
    bold: Regex,
    italic: Regex,
    blockquote: Regex,
    bullet: Regex,
    ordered: Regex,
    blank_runs: Regex,
}

impl MarkdownParser {
    pub fn new() -> Self {
        Self {
            backlink: Regex::new(r"\[\[([^\]]+)\]\]").unwrap(),
            tag: Regex::new(r"(?:^|\s)#([A-Za-z0-9_\p{Han}]+)").unwrap(),
            property: Regex::new(r"(?m)^\s*-\s*(\w+)::\s*(.+)$").unwrap(),
            fenced_code: Regex::new(r"(?s)```.*?```").unwrap(),
            inline_code: Regex::new(r"`[^`]+`").unwrap(),
            image: Regex::new(r"!\[.*?\]\(.*?\)").unwrap(),
            link: Regex::new(r"\[([^\]]+)\]\([^)]+\)").unwrap(),
            wiki_link: Regex::new(r"\[\[([^\]]+)\]\]").unwrap(),
            heading: Regex::new(r"(?m)^#{1,6}\s+").unwrap(),
            bold: Regex::new(r"\*\*([^*]+)\*\*").unwrap(),
            italic: Regex::new(r"\*([^*]+)\*").unwrap(),
            blockquote: Regex::new(r"(?m)^>\s+").unwrap(),
            bullet: Regex::new(r"(?m)^\s*[-*+]\s+").unwrap(),
            ordered: Regex::new(r"(?m)^\s*\d+\.\s+").unwrap(),
            blank_runs: Regex::new(r"\n{3,}").unwrap(),
        }
    }

    /// Read a note file, splitting off YAML front matter and recording
    /// filesystem timestamps. Front matter that fails to parse is logged
    /// and treated as absent.
    pub fn parse_file(&self, file_path: &Path) -> Result<ParsedNote> {
        let raw = std::fs::read_to_string(file_path).map_err(|e| NoteseekError::Parse {
            path: file_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let (front_matter, content) = split_front_matter(&raw);

        let mut metadata = match front_matter {
            Some(yaml) => match serde_yml::from_str::<Value>(yaml) {
                Ok(Value::Object(map)) => map,
                Ok(_) => Map::new(),
                Err(e) => {
                    warn!("Ignoring malformed front matter in {}: {}", file_path.display(), e);
                    Map::new()
                }
            },
            None => Map::new(),
        };

        let fs_meta = std::fs::metadata(file_path).map_err(|e| NoteseekError::Parse {
            path: file_path.display().to_string(),
            reason: e.to_string(),
        })?;

        let modified_at = fs_meta.modified().ok().map(DateTime::<Utc>::from);
        let created_at = fs_meta
            .created()
            .ok()
            .map(DateTime::<Utc>::from)
            .or(modified_at);

        let title = metadata
            .get("title")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                file_path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            });

        metadata.insert("title".into(), Value::String(title.clone()));
        if let Some(t) = created_at {
            metadata.insert("created_at".into(), Value::String(t.to_rfc3339()));
        }
        if let Some(t) = modified_at {
            metadata.insert("modified_at".into(), Value::String(t.to_rfc3339()));
        }

        Ok(ParsedNote {
            content: content.to_string(),
            metadata,
            title,
            created_at,
            modified_at,
        })
    }

    /// Extract `[[page]]` wiki-link targets, deduplicated and sorted
    pub fn extract_backlinks(&self, content: &str) -> Vec<String> {
        let set: BTreeSet<String> = self
            .backlink
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .collect();
        set.into_iter().collect()
    }

    /// Extract `#tag` hashtags (preceded by start or whitespace),
    /// deduplicated and sorted
    pub fn extract_tags(&self, content: &str) -> Vec<String> {
        let set: BTreeSet<String> = self
            .tag
            .captures_iter(content)
            .map(|c| c[1].to_string())
            .collect();
        set.into_iter().collect()
    }

    /// Extract Logseq `- key:: value` property lines
    pub fn extract_properties(&self, content: &str) -> Map<String, Value> {
        let mut properties = Map::new();
        for cap in self.property.captures_iter(content) {
            properties.insert(
                cap[1].to_string(),
                Value::String(cap[2].trim().to_string()),
            );
        }
        properties
    }

    /// Strip markup down to searchable plain text
    pub fn clean_content(&self, content: &str) -> String {
        let text = self.fenced_code.replace_all(content, "");
        let text = self.inline_code.replace_all(&text, "");
        let text = self.image.replace_all(&text, "");
        let text = self.link.replace_all(&text, "$1");
        let text = self.wiki_link.replace_all(&text, "$1");
        let text = self.heading.replace_all(&text, "");
        let text = self.bold.replace_all(&text, "$1");
        let text = self.italic.replace_all(&text, "$1");
        let text = self.blockquote.replace_all(&text, "");
        let text = self.bullet.replace_all(&text, "");
        let text = self.ordered.replace_all(&text, "");
        let text = self.blank_runs.replace_all(&text, "\n\n");
        text.trim().to_string()
    }

    /// Split cleaned text into chunks.
    ///
    /// Documents shorter than `chunk_size` produce exactly one chunk
    /// covering the whole content. Longer documents are split on blank-line
    /// paragraph boundaries with greedy accumulation; accumulations beyond
    /// `1.5 × chunk_size` are refined at sentence boundaries. Offsets are
    /// character offsets into the cleaned content.
    pub fn chunk_content(
        &self,
        content: &str,
        chunk_size: usize,
        overlap: usize,
        min_chunk_size: usize,
    ) -> Vec<ChunkSpan> {
        let chars: Vec<char> = content.chars().collect();
        let total = chars.len();

        // Small-file protection: index the whole note as one chunk
        if total < chunk_size {
            if content.trim().is_empty() {
                return Vec::new();
            }
            return vec![ChunkSpan {
                text: content.to_string(),
                start: 0,
                end: total,
            }];
        }

        let paragraphs = paragraph_spans(&chars);

        let mut chunks = Vec::new();
        let mut acc: Option<(usize, usize)> = None;

        let flush = |chunks: &mut Vec<ChunkSpan>, start: usize, end: usize| {
            let len = end - start;
            if len < min_chunk_size {
                return;
            }
            if len * 2 > chunk_size * 3 {
                chunks.extend(split_large_span(
                    &chars,
                    start,
                    end,
                    chunk_size,
                    overlap,
                    min_chunk_size,
                ));
            } else {
                chunks.push(span_chunk(&chars, start, end));
            }
        };

        for &(p_start, p_end) in &paragraphs {
            match acc {
                None => acc = Some((p_start, p_end)),
                Some((a_start, a_end)) => {
                    if p_end - a_start > chunk_size {
                        flush(&mut chunks, a_start, a_end);
                        acc = Some((p_start, p_end));
                    } else {
                        acc = Some((a_start, p_end));
                    }
                }
            }
        }

        if let Some((a_start, a_end)) = acc {
            flush(&mut chunks, a_start, a_end);
        }

        chunks
    }
}

impl Default for MarkdownParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Split off a leading `--- ... ---` YAML front-matter block
fn split_front_matter(raw: &str) -> (Option<&str>, &str) {
    let Some(rest) = raw.strip_prefix("---\n").or_else(|| raw.strip_prefix("---\r\n")) else {
        return (None, raw);
    };

    for (candidate, skip) in [("\n---\n", 5), ("\n---\r\n", 6)] {
        if let Some(pos) = rest.find(candidate) {
            return (Some(&rest[..pos]), &rest[pos + skip..]);
        }
    }
    if let Some(stripped) = rest.strip_suffix("\n---") {
        return (Some(stripped), "");
    }

    (None, raw)
}

/// Trimmed paragraph spans between `\n\n` separators, in char coordinates
fn paragraph_spans(chars: &[char]) -> Vec<(usize, usize)> {
    let total = chars.len();
    let mut spans = Vec::new();
    let mut seg_start = 0;
    let mut i = 0;

    loop {
        let at_separator = i + 1 < total && chars[i] == '\n' && chars[i + 1] == '\n';
        if i >= total || at_separator {
            let (mut s, mut e) = (seg_start, i.min(total));
            while s < e && chars[s].is_whitespace() {
                s += 1;
            }
            while e > s && chars[e - 1].is_whitespace() {
                e -= 1;
            }
            if e > s {
                spans.push((s, e));
            }
            if i >= total {
                break;
            }
            seg_start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }

    spans
}

fn span_chunk(chars: &[char], start: usize, end: usize) -> ChunkSpan {
    ChunkSpan {
        text: chars[start..end].iter().collect(),
        start,
        end,
    }
}

/// Sentence-boundary delimiters, strongest first
const SENTENCE_DELIMITERS: [char; 6] = ['。', '！', '？', '.', '!', '?'];

/// Split an oversized span at sentence boundaries with overlap.
///
/// The cut point is searched backwards in
/// `[max(start + min_chunk_size, ideal_end - 200), ideal_end)`, preferring
/// sentence delimiters or a blank line, then the last space, then a forced
/// cut at `ideal_end`. The next start advances by `end - overlap` but never
/// regresses past the previous chunk's start.
fn split_large_span(
    chars: &[char],
    offset: usize,
    span_end: usize,
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
) -> Vec<ChunkSpan> {
    let window = &chars[offset..span_end];
    let text_len = window.len();
    let mut chunks: Vec<ChunkSpan> = Vec::new();
    let mut start = 0usize;

    while start < text_len {
        let ideal_end = (start + chunk_size).min(text_len);

        let cut = if ideal_end >= text_len {
            text_len
        } else {
            let search_start = (start + min_chunk_size).max(ideal_end.saturating_sub(200));
            match find_cut_point(window, search_start, ideal_end) {
                Some(pos) => pos + 1,
                None => ideal_end,
            }
        };

        // Trim the chunk while keeping offsets consistent with its text
        let (mut c_start, mut c_end) = (start, cut);
        while c_start < c_end && window[c_start].is_whitespace() {
            c_start += 1;
        }
        while c_end > c_start && window[c_end - 1].is_whitespace() {
            c_end -= 1;
        }

        if c_end - c_start >= min_chunk_size {
            chunks.push(span_chunk(chars, offset + c_start, offset + c_end));
        }

        let mut next = cut.saturating_sub(overlap);
        if let Some(last) = chunks.last() {
            // Overlap must never move the window backwards
            if next <= last.start - offset {
                next = cut;
            }
        }
        start = next;

        if text_len - start < min_chunk_size {
            break;
        }
    }

    chunks
}

/// Right-most delimiter position in `[search_start, search_end)`, with
/// sentence punctuation and blank lines preferred over plain spaces
fn find_cut_point(window: &[char], search_start: usize, search_end: usize) -> Option<usize> {
    if search_start >= search_end {
        return None;
    }

    let mut best: Option<usize> = None;
    for i in (search_start..search_end).rev() {
        let c = window[i];
        if SENTENCE_DELIMITERS.contains(&c)
            || (c == '\n' && i + 1 < window.len() && window[i + 1] == '\n')
        {
            best = Some(i);
            break;
        }
    }

    if best.is_none() {
        for i in (search_start..search_end).rev() {
            if window[i] == ' ' {
                best = Some(i);
                break;
            }
        }
    }

    best
}
