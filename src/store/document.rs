// SPDX-License-Identifier: AGPL-3.0-or-later
//! Line-oriented `KEY=VALUE` document
//!
//! Comments, blank lines and unparseable lines are kept so that an untouched
//! file serializes back byte for byte. Entries remember their original text
//! and reuse it until their value changes.

use std::fmt;

/// One physical line of the document
#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Entry(Entry),
    Comment(String),
    Blank,
    /// Text we could not parse; passed through untouched
    Raw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    key: String,
    value: String,
    /// Original line, only kept when it can be written back safely
    raw: Option<String>,
}

/// Ordered key/value configuration document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigDocument {
    lines: Vec<Line>,
}

impl ConfigDocument {
    /// Create an empty document
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse document text. Never fails: lines that are not `KEY=VALUE`,
    /// comments or blank are carried through as-is.
    pub fn parse(text: &str) -> Self {
        let lines = text.lines().map(parse_line).collect();
        Self { lines }
    }

    /// Build a document from ordered pairs
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut doc = Self::new();
        for (key, value) in pairs {
            doc.set(key, value);
        }
        doc
    }

    /// Value of `key`; the last occurrence wins, as with dotenv loaders
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries()
            .filter(|(k, _)| *k == key)
            .last()
            .map(|(_, v)| v)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Set `key`, updating the first occurrence in place (and dropping any
    /// duplicates) or appending a new entry
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let mut found = false;

        self.lines.retain_mut(|line| match line {
            Line::Entry(entry) if entry.key == key => {
                if found {
                    return false;
                }
                found = true;
                if entry.value != value {
                    entry.value = value.clone();
                    entry.raw = None;
                }
                true
            }
            _ => true,
        });

        if !found {
            self.lines.push(Line::Entry(Entry {
                key,
                value,
                raw: None,
            }));
        }
    }

    /// Remove all entries matching `predicate` and return the line index where
    /// the first one was, so a replacement can be inserted in the same place
    pub(crate) fn remove_where<F>(&mut self, predicate: F) -> Option<usize>
    where
        F: Fn(&str) -> bool,
    {
        let first = self
            .lines
            .iter()
            .position(|line| matches!(line, Line::Entry(entry) if predicate(&entry.key)));
        self.lines
            .retain(|line| !matches!(line, Line::Entry(entry) if predicate(&entry.key)));
        first
    }

    /// Insert fresh entries starting at line `index`
    pub(crate) fn insert_at(&mut self, index: usize, pairs: &[(String, String)]) {
        let index = index.min(self.lines.len());
        for (offset, (key, value)) in pairs.iter().enumerate() {
            self.lines.insert(
                index + offset,
                Line::Entry(Entry {
                    key: key.clone(),
                    value: value.clone(),
                    raw: None,
                }),
            );
        }
    }

    /// Iterate entries in document order
    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match line {
            Line::Entry(entry) => Some((entry.key.as_str(), entry.value.as_str())),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.entries().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for ConfigDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.lines {
            match line {
                Line::Entry(entry) => match &entry.raw {
                    Some(raw) => writeln!(f, "{}", raw)?,
                    None => writeln!(f, "{}={}", entry.key, format_value(&entry.value))?,
                },
                Line::Comment(text) | Line::Raw(text) => writeln!(f, "{}", text)?,
                Line::Blank => writeln!(f)?,
            }
        }
        Ok(())
    }
}

fn parse_line(line: &str) -> Line {
    let trimmed = line.trim();

    if trimmed.is_empty() {
        return Line::Blank;
    }
    if trimmed.starts_with('#') {
        return Line::Comment(line.to_string());
    }

    let body = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let Some((key, rest)) = body.split_once('=') else {
        return Line::Raw(line.to_string());
    };

    let key = key.trim();
    if !is_valid_key(key) {
        return Line::Raw(line.to_string());
    }

    let (value, quoted) = parse_value(rest.trim_start());

    // An unquoted value with inner whitespace is the legacy defect; drop the
    // original text so the entry is rewritten quoted on the next save.
    let raw = if !quoted && needs_quoting(&value) {
        None
    } else {
        Some(line.to_string())
    };

    Line::Entry(Entry {
        key: key.to_string(),
        value,
        raw,
    })
}

fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Returns the unquoted value and whether it was quoted in the source
fn parse_value(rest: &str) -> (String, bool) {
    let mut chars = rest.chars();
    match chars.next() {
        Some('"') => {
            let mut value = String::new();
            let mut escaped = false;
            for c in chars {
                if escaped {
                    match c {
                        'n' => value.push('\n'),
                        other => value.push(other),
                    }
                    escaped = false;
                } else if c == '\\' {
                    escaped = true;
                } else if c == '"' {
                    return (value, true);
                } else {
                    value.push(c);
                }
            }
            // Unterminated quote: take what we have
            (value, true)
        }
        Some('\'') => {
            let inner: String = chars.take_while(|c| *c != '\'').collect();
            (inner, true)
        }
        _ => {
            let value = match rest.find(" #").or_else(|| rest.find("\t#")) {
                Some(index) => &rest[..index],
                None => rest,
            };
            (value.trim_end().to_string(), false)
        }
    }
}

fn needs_quoting(value: &str) -> bool {
    value
        .chars()
        .any(|c| c.is_whitespace() || matches!(c, '#' | '"' | '\'' | '=' | '\\' | '$' | '`'))
}

/// Render a value for writing, quoting when required
pub fn format_value(value: &str) -> String {
    if !needs_quoting(value) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_entries() {
        let doc = ConfigDocument::parse("# header\n\nHOST=0.0.0.0\nPORT=8080\n");
        assert_eq!(doc.get("HOST"), Some("0.0.0.0"));
        assert_eq!(doc.get("PORT"), Some("8080"));
        assert_eq!(doc.len(), 2);
    }

    #[test]
    fn test_untouched_document_round_trips_byte_for_byte() {
        let text = "# Image Sequence Server\n\nexport HOST=0.0.0.0\nNAME='snow cam'\nODD LINE\nPORT = 8080 # web\n";
        let doc = ConfigDocument::parse(text);
        assert_eq!(doc.to_string(), text);
        assert_eq!(doc.get("PORT"), Some("8080"));
        assert_eq!(doc.get("NAME"), Some("snow cam"));
    }

    #[test]
    fn test_quoted_values_with_escapes() {
        let doc = ConfigDocument::parse(r#"MSG="say \"hi\" \\ bye""#);
        assert_eq!(doc.get("MSG"), Some(r#"say "hi" \ bye"#));
    }

    #[test]
    fn test_unquoted_multi_token_value_is_rewritten_quoted() {
        let doc = ConfigDocument::parse("VPS_RSYNC_OPTIONS=-avz --delete\n");
        assert_eq!(doc.get("VPS_RSYNC_OPTIONS"), Some("-avz --delete"));
        assert_eq!(doc.to_string(), "VPS_RSYNC_OPTIONS=\"-avz --delete\"\n");
    }

    #[test]
    fn test_set_updates_in_place_and_appends() {
        let mut doc = ConfigDocument::parse("A=1\nB=2\n");
        doc.set("A", "10");
        doc.set("C", "3");
        assert_eq!(doc.to_string(), "A=10\nB=2\nC=3\n");
    }

    #[test]
    fn test_set_same_value_keeps_original_text() {
        let mut doc = ConfigDocument::parse("A = 1\n");
        doc.set("A", "1");
        assert_eq!(doc.to_string(), "A = 1\n");
    }

    #[test]
    fn test_duplicates_last_wins_and_set_collapses() {
        let mut doc = ConfigDocument::parse("A=1\nB=2\nA=3\n");
        assert_eq!(doc.get("A"), Some("3"));
        doc.set("A", "4");
        assert_eq!(doc.to_string(), "A=4\nB=2\n");
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value("plain"), "plain");
        assert_eq!(format_value(""), "");
        assert_eq!(format_value("a b"), "\"a b\"");
        assert_eq!(format_value("p#ss"), "\"p#ss\"");
        assert_eq!(format_value(r#"q"uote"#), r#""q\"uote""#);
    }

    #[test]
    fn test_formatted_values_parse_back() {
        let mut doc = ConfigDocument::new();
        doc.set("PASS", r#"we"ird \ pa ss#"#);
        let reparsed = ConfigDocument::parse(&doc.to_string());
        assert_eq!(reparsed.get("PASS"), Some(r#"we"ird \ pa ss#"#));
    }
}
