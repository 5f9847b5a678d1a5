//! Unified-diff application: parses standard `@@ -s,l +s,l @@` hunks and
//! applies them against a line vector. No dependency on the patched file
//! having been produced by this crate — any standard unified diff works.

use ws_core::{Error, Result};

struct Hunk {
    old_start: usize,
    old_count: usize,
    body: Vec<HunkLine>,
}

enum HunkLine {
    Context(String),
    Removed(String),
    Added(String),
}

fn parse_hunks(diff: &str) -> Result<Vec<Hunk>> {
    let mut hunks = Vec::new();
    let mut current: Option<Hunk> = None;

    for raw_line in diff.lines() {
        if raw_line.starts_with("--- ") || raw_line.starts_with("+++ ") {
            continue;
        }
        if let Some(rest) = raw_line.strip_prefix("@@ ") {
            if let Some(h) = current.take() {
                hunks.push(h);
            }
            let (old_start, old_count) = parse_hunk_header(rest)?;
            current = Some(Hunk { old_start, old_count, body: Vec::new() });
            continue;
        }
        let Some(hunk) = current.as_mut() else {
            continue;
        };
        if let Some(text) = raw_line.strip_prefix(' ') {
            hunk.body.push(HunkLine::Context(text.to_string()));
        } else if let Some(text) = raw_line.strip_prefix('-') {
            hunk.body.push(HunkLine::Removed(text.to_string()));
        } else if let Some(text) = raw_line.strip_prefix('+') {
            hunk.body.push(HunkLine::Added(text.to_string()));
        } else if raw_line.is_empty() {
            hunk.body.push(HunkLine::Context(String::new()));
        }
    }
    if let Some(h) = current.take() {
        hunks.push(h);
    }

    if hunks.is_empty() {
        return Err(Error::Internal("patch contains no hunks".into()));
    }
    Ok(hunks)
}

fn parse_hunk_header(rest: &str) -> Result<(usize, usize)> {
    // rest looks like "-12,5 +12,7 @@" (trailing context after the closing
    // "@@" is allowed and ignored).
    let minus = rest
        .split_whitespace()
        .next()
        .and_then(|tok| tok.strip_prefix('-'))
        .ok_or_else(|| Error::Internal(format!("malformed hunk header: {rest:?}")))?;
    let mut parts = minus.splitn(2, ',');
    let old_start: usize = parts
        .next()
        .unwrap_or("0")
        .parse()
        .map_err(|_| Error::Internal(format!("malformed hunk header: {rest:?}")))?;
    let old_count: usize = match parts.next() {
        Some(n) => n.parse().map_err(|_| Error::Internal(format!("malformed hunk header: {rest:?}")))?,
        None => 1,
    };
    Ok((old_start, old_count))
}

/// Apply `diff` against `lines` (each retaining its own line terminator),
/// returning the patched line vector. Fails if a hunk's context/removed
/// lines don't match the corresponding source lines.
pub fn apply(lines: &[String], diff: &str) -> Result<Vec<String>> {
    let hunks = parse_hunks(diff)?;
    let stripped: Vec<String> = lines.iter().map(|l| l.trim_end_matches('\n').to_string()).collect();

    let mut out = Vec::new();
    let mut cursor = 0usize; // 0-based index into `stripped` already copied

    for hunk in &hunks {
        // A zero-length old range (pure insertion) numbers its anchor as
        // the line *after* which the insertion happens, not a 1-based
        // index into the old file — unlike every other hunk kind.
        let start = if hunk.old_count == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if start > stripped.len() {
            return Err(Error::Internal(format!(
                "hunk starts at line {} beyond file length {}",
                hunk.old_start,
                stripped.len()
            )));
        }
        out.extend(stripped[cursor..start].iter().cloned());
        cursor = start;

        for line in &hunk.body {
            match line {
                HunkLine::Context(text) => {
                    verify_matches(&stripped, cursor, text)?;
                    out.push(stripped[cursor].clone());
                    cursor += 1;
                }
                HunkLine::Removed(text) => {
                    verify_matches(&stripped, cursor, text)?;
                    cursor += 1;
                }
                HunkLine::Added(text) => {
                    out.push(text.clone());
                }
            }
        }
    }
    out.extend(stripped[cursor..].iter().cloned());

    Ok(reattach_newlines(&out, lines.last().map(|l| l.ends_with('\n')).unwrap_or(true)))
}

fn verify_matches(stripped: &[String], cursor: usize, expected: &str) -> Result<()> {
    match stripped.get(cursor) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => Err(Error::Internal(format!(
            "patch context mismatch at line {}: expected {:?}, found {:?}",
            cursor + 1,
            expected,
            actual
        ))),
        None => Err(Error::Internal(format!(
            "patch context mismatch at line {}: file ended",
            cursor + 1
        ))),
    }
}

fn reattach_newlines(stripped: &[String], last_line_has_newline: bool) -> Vec<String> {
    let n = stripped.len();
    stripped
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i + 1 < n || last_line_has_newline {
                format!("{line}\n")
            } else {
                line.clone()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::{join, split_keepends};

    #[test]
    fn applies_simple_hunk() {
        let lines = split_keepends("a\nb\nc\nd\n");
        let diff = "@@ -2,1 +2,1 @@\n-b\n+B\n";
        let out = apply(&lines, diff).unwrap();
        assert_eq!(join(&out), "a\nB\nc\nd\n");
    }

    #[test]
    fn rejects_mismatched_context() {
        let lines = split_keepends("a\nb\nc\n");
        let diff = "@@ -2,1 +2,1 @@\n-X\n+Y\n";
        assert!(apply(&lines, diff).is_err());
    }

    #[test]
    fn applies_addition_only_hunk() {
        let lines = split_keepends("a\nb\n");
        let diff = "@@ -2,0 +3,1 @@\n+c\n";
        let out = apply(&lines, diff).unwrap();
        assert_eq!(join(&out), "a\nb\nc\n");
    }
}
