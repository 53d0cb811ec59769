//! Shell command construction for remote search and line-range reads
//!
//! Every value that ends up in a command line goes through this module.
//! Paths and patterns are single-quoted with the `'\''` idiom, numeric
//! bounds are clamped into a fixed range before being formatted. Nothing
//! here touches the network.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bounds for `head`/`tail` line counts
pub const MIN_LINES: u32 = 1;
pub const MAX_LINES: u32 = 100_000;

/// Bounds for search result limits
pub const MIN_RESULTS: u32 = 1;
pub const MAX_RESULTS: u32 = 10_000;

/// Longest preview line kept from a content match
const MAX_PREVIEW_LENGTH: usize = 500;

static GREP_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(.+?):(\d+):(.*)$").expect("static regex"));

/// Wrap a value in single quotes so the remote shell treats it literally.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('\'');
    quoted
}

/// Clamp a caller-supplied count into `[min, max]`.
///
/// Non-finite input (NaN, infinities) collapses to `min`.
pub fn clamp_count(value: impl Into<f64>, min: u32, max: u32) -> u32 {
    let value = value.into();
    if !value.is_finite() {
        return min;
    }
    let value = value.trunc();
    if value < min as f64 {
        min
    } else if value > max as f64 {
        max
    } else {
        value as u32
    }
}

/// Parse a textual count; anything malformed becomes `min`.
pub fn parse_count(raw: &str, min: u32, max: u32) -> u32 {
    match raw.trim().parse::<f64>() {
        Ok(value) => clamp_count(value, min, max),
        Err(_) => min,
    }
}

/// Split a comma separated pattern list, dropping empty fragments
pub fn split_patterns(list: &str) -> Vec<String> {
    list.split(',')
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .map(|p| p.to_string())
        .collect()
}

/// `head -n N 'path'`
pub fn head_command(path: &str, lines: impl Into<f64>) -> String {
    format!(
        "head -n {} {}",
        clamp_count(lines, MIN_LINES, MAX_LINES),
        shell_quote(path)
    )
}

/// `tail -n N 'path'`
pub fn tail_command(path: &str, lines: impl Into<f64>) -> String {
    format!(
        "tail -n {} {}",
        clamp_count(lines, MIN_LINES, MAX_LINES),
        shell_quote(path)
    )
}

/// Recursive removal. Kept apart from the SFTP delete primitive.
pub fn remove_recursive_command(path: &str) -> String {
    format!("rm -rf -- {}", shell_quote(path))
}

/// One or more base directories for a search
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPaths(Vec<String>);

impl SearchPaths {
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn quoted(&self) -> String {
        self.0
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl From<&str> for SearchPaths {
    fn from(path: &str) -> Self {
        SearchPaths(vec![path.to_string()])
    }
}

impl From<String> for SearchPaths {
    fn from(path: String) -> Self {
        SearchPaths(vec![path])
    }
}

impl From<Vec<String>> for SearchPaths {
    fn from(paths: Vec<String>) -> Self {
        SearchPaths(paths)
    }
}

impl From<&[&str]> for SearchPaths {
    fn from(paths: &[&str]) -> Self {
        SearchPaths(paths.iter().map(|p| p.to_string()).collect())
    }
}

impl<const N: usize> From<[&str; N]> for SearchPaths {
    fn from(paths: [&str; N]) -> Self {
        SearchPaths(paths.iter().map(|p| p.to_string()).collect())
    }
}

/// Which entries a filename search reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    #[default]
    Any,
    File,
    Directory,
}

/// Search options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Search file contents instead of file names
    pub search_content: bool,
    /// Treat the pattern as an extended regex (content search only)
    pub regex: bool,
    pub case_sensitive: bool,
    /// Comma separated globs a file must match (content search)
    pub include_pattern: Option<String>,
    /// Comma separated globs excluded as files and as directories
    pub exclude_pattern: Option<String>,
    pub max_results: u32,
    pub entry_type: EntryType,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            search_content: false,
            regex: false,
            case_sensitive: false,
            include_pattern: None,
            exclude_pattern: None,
            max_results: 2000,
            entry_type: EntryType::Any,
        }
    }
}

impl SearchOptions {
    pub fn content() -> Self {
        Self {
            search_content: true,
            ..Self::default()
        }
    }

    fn excludes(&self) -> Vec<String> {
        self.exclude_pattern
            .as_deref()
            .map(split_patterns)
            .unwrap_or_default()
    }

    fn includes(&self) -> Vec<String> {
        self.include_pattern
            .as_deref()
            .map(split_patterns)
            .unwrap_or_default()
    }

    fn limit(&self) -> u32 {
        clamp_count(self.max_results, MIN_RESULTS, MAX_RESULTS)
    }
}

/// Recursive content search restricted to regular files.
///
/// Literal (`-F`) matching unless `regex` is set. `-H` keeps the
/// `path:` prefix when a base path is a single file.
pub fn content_search_command(paths: &SearchPaths, pattern: &str, options: &SearchOptions) -> String {
    let mut cmd = String::from("grep -rnH");
    cmd.push_str(if options.regex { " -E" } else { " -F" });
    if !options.case_sensitive {
        cmd.push_str(" -i");
    }
    for include in options.includes() {
        cmd.push_str(" --include=");
        cmd.push_str(&shell_quote(&include));
    }
    for exclude in options.excludes() {
        let quoted = shell_quote(&exclude);
        cmd.push_str(" --exclude=");
        cmd.push_str(&quoted);
        cmd.push_str(" --exclude-dir=");
        cmd.push_str(&quoted);
    }
    cmd.push_str(" -e ");
    cmd.push_str(&shell_quote(pattern));
    cmd.push_str(" -- ");
    cmd.push_str(&paths.quoted());
    cmd.push_str(&format!(" 2>/dev/null | head -n {}", options.limit()));
    cmd
}

/// Directory-tree walk matching entry names, pruning excluded names and paths.
pub fn filename_search_command(paths: &SearchPaths, pattern: &str, options: &SearchOptions) -> String {
    let mut cmd = String::from("find ");
    cmd.push_str(&paths.quoted());

    let excludes = options.excludes();
    if !excludes.is_empty() {
        let predicates = excludes
            .iter()
            .map(|ex| {
                format!(
                    "-name {} -o -path {}",
                    shell_quote(ex),
                    shell_quote(&format!("*/{}", ex))
                )
            })
            .collect::<Vec<_>>()
            .join(" -o ");
        cmd.push_str(&format!(" \\( {} \\) -prune -o", predicates));
    }

    match options.entry_type {
        EntryType::File => cmd.push_str(" -type f"),
        EntryType::Directory => cmd.push_str(" -type d"),
        EntryType::Any => {}
    }

    let glob = if pattern.contains(['*', '?', '[']) {
        pattern.to_string()
    } else {
        format!("*{}*", pattern)
    };
    cmd.push_str(if options.case_sensitive { " -name " } else { " -iname " });
    cmd.push_str(&shell_quote(&glob));
    cmd.push_str(&format!(" -print 2>/dev/null | head -n {}", options.limit()));
    cmd
}

/// A single search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchMatch {
    pub name: String,
    pub path: String,
    /// 1-based line number for content matches
    pub line: Option<u32>,
    pub preview: Option<String>,
    pub connection_id: String,
}

fn base_name(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

/// Parse `path:line:text` output. Lines that do not fit (binary notices) are skipped.
pub fn parse_content_matches(output: &str, connection_id: &str) -> Vec<SearchMatch> {
    output
        .lines()
        .filter_map(|line| {
            let caps = GREP_LINE.captures(line)?;
            let path = caps.get(1)?.as_str().to_string();
            let line_no = caps.get(2)?.as_str().parse::<u32>().ok()?;
            let mut preview = caps.get(3)?.as_str().trim().to_string();
            if preview.len() > MAX_PREVIEW_LENGTH {
                let mut cut = MAX_PREVIEW_LENGTH;
                while !preview.is_char_boundary(cut) {
                    cut -= 1;
                }
                preview.truncate(cut);
            }
            Some(SearchMatch {
                name: base_name(&path),
                path,
                line: Some(line_no),
                preview: Some(preview),
                connection_id: connection_id.to_string(),
            })
        })
        .collect()
}

/// Parse one-path-per-line `find` output
pub fn parse_filename_matches(output: &str, connection_id: &str) -> Vec<SearchMatch> {
    output
        .lines()
        .map(|l| l.trim_end_matches('\r'))
        .filter(|l| !l.is_empty())
        .map(|path| SearchMatch {
            name: base_name(path),
            path: path.to_string(),
            line: None,
            preview: None,
            connection_id: connection_id.to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAYLOAD: &str = "'; rm -rf /; echo '";

    #[test]
    fn test_quote_plain() {
        assert_eq!(shell_quote("/var/log/syslog"), "'/var/log/syslog'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_quote_escapes_single_quotes() {
        let quoted = shell_quote(PAYLOAD);
        assert!(quoted.contains("'\\''"));
        assert_eq!(quoted, "''\\''; rm -rf /; echo '\\'''");
    }

    #[test]
    fn test_quote_neutralises_substitutions() {
        assert_eq!(shell_quote("$(whoami)`id`"), "'$(whoami)`id`'");
    }

    #[test]
    fn test_clamp_count() {
        assert_eq!(clamp_count(f64::NAN, MIN_LINES, MAX_LINES), 1);
        assert_eq!(clamp_count(f64::INFINITY, MIN_LINES, MAX_LINES), 1);
        assert_eq!(clamp_count(-5, MIN_LINES, MAX_LINES), 1);
        assert_eq!(clamp_count(0, MIN_LINES, MAX_LINES), 1);
        assert_eq!(clamp_count(42.9, MIN_LINES, MAX_LINES), 42);
        assert_eq!(clamp_count(999_999, MIN_LINES, MAX_LINES), 100_000);
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("250", MIN_LINES, MAX_LINES), 250);
        assert_eq!(parse_count("10; rm -rf /", MIN_LINES, MAX_LINES), 1);
        assert_eq!(parse_count("--help", MIN_LINES, MAX_LINES), 1);
        assert_eq!(parse_count("1e9", MIN_LINES, MAX_LINES), 100_000);
    }

    #[test]
    fn test_tail_command_clamps() {
        assert_eq!(tail_command("/a", f64::NAN), "tail -n 1 '/a'");
        assert_eq!(tail_command("/a", -5), "tail -n 1 '/a'");
        assert_eq!(tail_command("/a", 999_999), "tail -n 100000 '/a'");
    }

    #[test]
    fn test_line_commands_stay_quoted() {
        let tail_re = Regex::new(r"^tail -n \d+ '").unwrap();
        let head_re = Regex::new(r"^head -n \d+ '").unwrap();
        let tail = tail_command(PAYLOAD, 10);
        let head = head_command(PAYLOAD, 10);
        assert!(tail_re.is_match(&tail));
        assert!(head_re.is_match(&head));
        assert!(tail.contains("'\\''"));
        assert!(tail.ends_with('\''));
    }

    #[test]
    fn test_content_search_is_literal_by_default() {
        let cmd = content_search_command(&"/srv".into(), "a.b", &SearchOptions::content());
        assert!(cmd.starts_with("grep -rnH -F"));
        assert!(!cmd.contains(" -E"));
        assert!(cmd.contains("-e 'a.b' -- '/srv'"));

        let opts = SearchOptions {
            regex: true,
            case_sensitive: true,
            ..SearchOptions::content()
        };
        let cmd = content_search_command(&"/srv".into(), "a.b", &opts);
        assert!(cmd.starts_with("grep -rnH -E"));
        assert!(!cmd.contains(" -i"));
    }

    #[test]
    fn test_content_search_injection() {
        let cmd = content_search_command(&"/srv".into(), PAYLOAD, &SearchOptions::content());
        assert!(cmd.starts_with("grep "));
        assert!(cmd.contains("-e ''\\''; rm -rf /; echo '\\''' -- '/srv'"));
    }

    #[test]
    fn test_excludes_cover_files_and_dirs() {
        let opts = SearchOptions {
            exclude_pattern: Some("*.log, node_modules ,".into()),
            ..SearchOptions::content()
        };
        let cmd = content_search_command(&"/srv".into(), "x", &opts);
        assert!(cmd.contains("--exclude='*.log' --exclude-dir='*.log'"));
        assert!(cmd.contains("--exclude='node_modules' --exclude-dir='node_modules'"));
    }

    #[test]
    fn test_multiple_paths_single_invocation() {
        let paths = SearchPaths::from(["/a", "/b c"]);
        let cmd = content_search_command(&paths, "x", &SearchOptions::content());
        assert_eq!(cmd.matches("grep").count(), 1);
        assert!(cmd.contains("-- '/a' '/b c' 2>/dev/null"));

        let cmd = filename_search_command(&paths, "x", &SearchOptions::default());
        assert!(cmd.starts_with("find '/a' '/b c'"));
    }

    #[test]
    fn test_filename_search_command() {
        let opts = SearchOptions {
            exclude_pattern: Some(".git".into()),
            entry_type: EntryType::File,
            max_results: 0,
            ..SearchOptions::default()
        };
        let cmd = filename_search_command(&"/home/u".into(), "main", &opts);
        assert_eq!(
            cmd,
            "find '/home/u' \\( -name '.git' -o -path '*/.git' \\) -prune -o -type f -iname '*main*' -print 2>/dev/null | head -n 1"
        );
    }

    #[test]
    fn test_filename_search_injection() {
        let cmd = filename_search_command(&PAYLOAD.into(), PAYLOAD, &SearchOptions::default());
        assert!(Regex::new(r"^find '").unwrap().is_match(&cmd));
        assert_eq!(cmd.matches("'\\''").count(), 4);
    }

    #[test]
    fn test_glob_pattern_passed_through() {
        let cmd = filename_search_command(&"/".into(), "*.rs", &SearchOptions::default());
        assert!(cmd.contains("-iname '*.rs'"));
    }

    #[test]
    fn test_parse_content_matches() {
        let out = "/srv/a.txt:3:hello TOKEN\nBinary file /srv/b.bin matches\n/srv/dir:x/c.txt:10: TOKEN here\n";
        let matches = parse_content_matches(out, "h:22:u");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].path, "/srv/a.txt");
        assert_eq!(matches[0].name, "a.txt");
        assert_eq!(matches[0].line, Some(3));
        assert_eq!(matches[0].preview.as_deref(), Some("hello TOKEN"));
        assert_eq!(matches[1].path, "/srv/dir:x/c.txt");
        assert_eq!(matches[1].connection_id, "h:22:u");
    }

    #[test]
    fn test_single_file_search_keeps_filename() {
        let cmd = content_search_command(&"/tmp/notes.txt".into(), "TOKEN", &SearchOptions::content());
        assert!(cmd.starts_with("grep -rnH "));

        let matches = parse_content_matches("/tmp/notes.txt:1:hello TOKEN\n", "h:22:u");
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].path, "/tmp/notes.txt");
        assert_eq!(matches[0].line, Some(1));

        // Without -H grep drops the prefix and nothing parses
        assert!(parse_content_matches("1:hello TOKEN\n", "h:22:u").is_empty());
    }

    #[test]
    fn test_parse_filename_matches() {
        let matches = parse_filename_matches("/a/b.rs\n\n/a/dir/\n", "c");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].name, "b.rs");
        assert_eq!(matches[1].name, "dir");
        assert!(matches[1].line.is_none());
    }
}
