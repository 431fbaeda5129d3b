//! Minimal YAML-style frontmatter for phase files.
//!
//! Phase instructions are opaque text, but a phase may declare simple
//! `key: value` metadata (currently `kind`) between `---` fences at the top.

use std::collections::BTreeMap;

/// Frontmatter fields plus the remaining document body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document<'a> {
    pub fields: BTreeMap<String, String>,
    pub body: &'a str,
}

impl Document<'_> {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// Split `contents` into frontmatter fields and body. Documents without a
/// well-formed fence are returned whole as the body.
pub fn parse(contents: &str) -> Document<'_> {
    let Some((frontmatter, body)) = split_frontmatter(contents) else {
        return Document {
            fields: BTreeMap::new(),
            body: contents,
        };
    };
    let mut fields = BTreeMap::new();
    for line in frontmatter.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let value = unquote(value.trim());
        if !value.is_empty() {
            fields.insert(key.trim().to_string(), value.to_string());
        }
    }
    Document { fields, body }
}

fn unquote(value: &str) -> &str {
    if value.len() >= 2
        && ((value.starts_with('"') && value.ends_with('"'))
            || (value.starts_with('\'') && value.ends_with('\'')))
    {
        return &value[1..value.len() - 1];
    }
    value
}

fn split_frontmatter(contents: &str) -> Option<(&str, &str)> {
    let rest = contents
        .strip_prefix("---\n")
        .or_else(|| contents.strip_prefix("---\r\n"))?;
    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == "---" {
            let frontmatter = &rest[..offset];
            let body = rest[offset + line.len()..].trim_start_matches(['\n', '\r']);
            return Some((frontmatter, body));
        }
        offset += line.len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields_and_body() {
        let doc = parse("---\nkind: test-authoring\ntitle: \"Write tests\"\n---\n\nDo the thing.\n");
        assert_eq!(doc.get("kind"), Some("test-authoring"));
        assert_eq!(doc.get("title"), Some("Write tests"));
        assert_eq!(doc.body, "Do the thing.\n");
    }

    #[test]
    fn missing_frontmatter_returns_whole_body() {
        let doc = parse("# Phase\n\nkind: not frontmatter\n");
        assert!(doc.fields.is_empty());
        assert_eq!(doc.body, "# Phase\n\nkind: not frontmatter\n");
    }

    #[test]
    fn unterminated_fence_is_body() {
        let doc = parse("---\nkind: standard\nno closing fence\n");
        assert!(doc.fields.is_empty());
        assert!(doc.body.starts_with("---"));
    }
}
