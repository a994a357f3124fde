//! Minimal `key=value` properties format, as read by the location registry.

use std::collections::BTreeMap;

/// Ordered key/value pairs rendered as a properties file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Parse properties text. Comment lines start with `#` or `!`; the key
    /// ends at the first unescaped `=`, `:` or whitespace.
    pub fn parse(text: &str) -> Self {
        Self(text.lines().filter_map(parse_line).collect())
    }

    /// Render with a leading comment line, one pair per line
    pub fn render(&self, comment: &str) -> String {
        let mut out = format!("#{}\n#{}\n", comment, chrono::Utc::now().to_rfc2822());
        for (key, value) in &self.0 {
            out.push_str(&escape(key, true));
            out.push('=');
            out.push_str(&escape(value, false));
            out.push('\n');
        }
        out
    }
}

impl FromIterator<(String, String)> for Properties {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn escape(text: &str, is_key: bool) -> String {
    let mut out = String::with_capacity(text.len());
    for (i, c) in text.chars().enumerate() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{c}' => out.push_str("\\f"),
            '=' | ':' | '#' | '!' => {
                out.push('\\');
                out.push(c);
            }
            ' ' if is_key || i == 0 => out.push_str("\\ "),
            c => out.push(c),
        }
    }
    out
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        'r' => '\r',
        't' => '\t',
        'f' => '\u{c}',
        other => other,
    }
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let line = line.trim_start();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }

    let mut chars = line.chars().peekable();
    let mut key = String::new();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    key.push(unescape(next));
                }
            }
            '=' | ':' => break,
            c if c.is_whitespace() => {
                while chars.peek().is_some_and(|c| c.is_whitespace()) {
                    chars.next();
                }
                if matches!(chars.peek(), Some('=') | Some(':')) {
                    chars.next();
                }
                break;
            }
            c => key.push(c),
        }
    }

    while chars.peek().is_some_and(|c| c.is_whitespace()) {
        chars.next();
    }

    let mut value = String::new();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                value.push(unescape(next));
            }
        } else {
            value.push(c);
        }
    }
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_separators_and_comments() {
        let props = Properties::parse(
            "# header\n\
             ! also a comment\n\
             \n\
             a=1\n\
             b: two\n\
             c   three\n\
             d =  spaced value\n",
        );
        assert_eq!(props.len(), 4);
        assert_eq!(props.get("a"), Some("1"));
        assert_eq!(props.get("b"), Some("two"));
        assert_eq!(props.get("c"), Some("three"));
        assert_eq!(props.get("d"), Some("spaced value"));
    }

    #[test]
    fn test_render_escapes_special_characters() {
        let mut props = Properties::new();
        props.set("topo.location.named.azure", "azurecompute:East US");
        props.set("odd key", " leading\nnewline");

        let text = props.render("minimal config");
        assert!(text.starts_with("#minimal config\n#"));
        assert!(text.contains("topo.location.named.azure=azurecompute\\:East US\n"));
        assert!(text.contains("odd\\ key=\\ leading\\nnewline\n"));

        assert_eq!(Properties::parse(&text), props);
    }
}
