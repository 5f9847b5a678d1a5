//! `search(pattern)`: regex first, literal substring fallback.

use regex::Regex;

pub const MAX_MATCHES: usize = 500;

#[derive(Debug, Clone)]
pub struct Match {
    pub line: usize,
    pub text: String,
}

pub struct SearchResult {
    pub matches: Vec<Match>,
    pub truncated: bool,
}

pub fn search(lines: &[String], pattern: &str) -> SearchResult {
    match Regex::new(pattern) {
        Ok(re) => search_with(lines, |line| re.is_match(line)),
        Err(_) => search_with(lines, |line| line.contains(pattern)),
    }
}

fn search_with(lines: &[String], matches_fn: impl Fn(&str) -> bool) -> SearchResult {
    let mut matches = Vec::new();
    let mut truncated = false;
    for (i, line) in lines.iter().enumerate() {
        if matches.len() >= MAX_MATCHES {
            truncated = true;
            break;
        }
        let trimmed = line.trim_end_matches('\n');
        if matches_fn(trimmed) {
            matches.push(Match { line: i + 1, text: trimmed.to_string() });
        }
    }
    SearchResult { matches, truncated }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lines::split_keepends;

    #[test]
    fn regex_pattern_matches() {
        let lines = split_keepends("foo\nbar123\nbaz\n");
        let result = search(&lines, r"\d+");
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].line, 2);
    }

    #[test]
    fn invalid_regex_falls_back_to_literal() {
        let lines = split_keepends("a(b\nc\n");
        let result = search(&lines, "(b");
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].line, 1);
    }

    #[test]
    fn finds_literal_and_numbered_line_matches() {
        let lines = split_keepends("line 1\ntest line\nline 3\nanother test\nline 5\n");

        let result = search(&lines, "test");
        let at: Vec<usize> = result.matches.iter().map(|m| m.line).collect();
        assert_eq!(at, vec![2, 4]);

        let result = search(&lines, "line [0-9]+");
        assert_eq!(result.matches.len(), 3);
    }

    #[test]
    fn caps_matches_and_reports_truncation() {
        let content: String = (0..510).map(|_| "x\n").collect();
        let lines = split_keepends(&content);
        let result = search(&lines, "x");
        assert_eq!(result.matches.len(), MAX_MATCHES);
        assert!(result.truncated);
    }
}
