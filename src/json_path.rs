//! Path expressions into a JSON document.
//!
//! Supported forms: `$`, `$.data.id`, `$.items[0].name`,
//! `$['odd key']`, `["k"]`, `[0].id` and the bare `data.id`.
//! Dotted numeric segments (`items.0`) index into arrays as well.

use serde_json::Value;
use std::fmt;

/// One step of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    /// Parse `path`, returning a human-readable reason on failure.
    pub fn parse(path: &str) -> Result<Self, String> {
        let raw = path.trim();
        let rest = raw.strip_prefix('$').unwrap_or(raw);
        let chars: Vec<char> = rest.chars().collect();
        let mut segments = Vec::new();
        let mut i = 0;

        while i < chars.len() {
            match chars[i] {
                '.' => {
                    i += 1;
                    let (key, next) = read_key(&chars, i);
                    segments.push(key_segment(key)?);
                    i = next;
                }
                '[' => {
                    let (segment, next) = read_bracket(&chars, i)?;
                    segments.push(segment);
                    i = next;
                }
                _ if i == 0 => {
                    let (key, next) = read_key(&chars, i);
                    segments.push(key_segment(key)?);
                    i = next;
                }
                c => {
                    return Err(format!("unexpected character '{c}' at offset {i}"));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Address of the root document.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The node this path points at, if any.
    pub fn resolve<'a>(&self, root: &'a Value) -> Option<&'a Value> {
        let mut current = root;
        for segment in &self.segments {
            current = match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key)?,
                (Segment::Key(key), Value::Array(items)) => {
                    items.get(key.parse::<usize>().ok()?)?
                }
                (Segment::Index(idx), Value::Array(items)) => items.get(*idx)?,
                _ => return None,
            };
        }
        Some(current)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse and resolve in one step.
pub fn resolve<'a>(root: &'a Value, path: &str) -> Result<Option<&'a Value>, String> {
    Ok(JsonPath::parse(path)?.resolve(root))
}

fn read_key(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '.' && chars[end] != '[' {
        end += 1;
    }
    (chars[start..end].iter().collect(), end)
}

fn key_segment(key: String) -> Result<Segment, String> {
    let key = key.trim().to_string();
    if key.is_empty() {
        return Err("empty path segment (recursive descent is not supported)".to_string());
    }
    if key == "*" {
        return Err("wildcards are not supported".to_string());
    }
    Ok(Segment::Key(key))
}

/// `chars[open]` is `[`. Returns the segment and the index after `]`.
fn read_bracket(chars: &[char], open: usize) -> Result<(Segment, usize), String> {
    let start = open + 1;
    match chars.get(start) {
        Some(&quote) if quote == '\'' || quote == '"' => {
            let close_quote = chars[start + 1..]
                .iter()
                .position(|c| *c == quote)
                .map(|p| start + 1 + p)
                .ok_or_else(|| "unterminated quoted key".to_string())?;
            if chars.get(close_quote + 1) != Some(&']') {
                return Err("expected ']' after quoted key".to_string());
            }
            let key: String = chars[start + 1..close_quote].iter().collect();
            Ok((Segment::Key(key), close_quote + 2))
        }
        _ => {
            let close = chars[start..]
                .iter()
                .position(|c| *c == ']')
                .map(|p| start + p)
                .ok_or_else(|| "unterminated '['".to_string())?;
            let content: String = chars[start..close].iter().collect();
            let content = content.trim();
            if content == "*" {
                return Err("wildcards are not supported".to_string());
            }
            let idx = content
                .parse::<usize>()
                .map_err(|_| format!("invalid index '[{content}]'"))?;
            Ok((Segment::Index(idx), close + 1))
        }
    }
}
