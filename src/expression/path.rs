//! Context-path parsing and lookup

use crate::core::Context;
use crate::expression::ExpressionError;
use serde_json::Value;
use std::fmt;

/// One step of a path below its root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    Field(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub key: Key,
    /// Reached through `?.`
    pub optional: bool,
}

/// A parsed lookup path such as `@input.items[0]?.name`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarPath {
    source: String,
    root: String,
    segments: Vec<Segment>,
}

/// Result of walking a path through a context
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<'a> {
    Found(&'a Value),
    /// Some segment was absent. `optional` is set when an optional-chained
    /// segment at or before the failure point absorbs the miss.
    Missing { optional: bool },
}

impl VarPath {
    pub fn parse(source: &str) -> Result<Self, ExpressionError> {
        let trimmed = source.trim();
        let chars: Vec<char> = trimmed.chars().collect();
        let fail = |message: &str| ExpressionError::InvalidPath {
            path: source.to_string(),
            message: message.to_string(),
        };

        let mut pos = 0;
        let mut root = String::new();
        if chars.first() == Some(&'@') {
            root.push('@');
            pos = 1;
        }
        let ident = read_ident(&chars, &mut pos);
        if ident.is_empty() {
            return Err(fail("expected a root identifier"));
        }
        root.push_str(&ident);

        let mut segments = Vec::new();
        while pos < chars.len() {
            let mut optional = false;
            if chars[pos] == '?' {
                if chars.get(pos + 1) != Some(&'.') {
                    return Err(fail("expected '.' after '?'"));
                }
                optional = true;
                pos += 2;
                if chars.get(pos) == Some(&'[') {
                    segments.push(Segment {
                        key: read_bracket(&chars, &mut pos).map_err(|m| fail(&m))?,
                        optional,
                    });
                    continue;
                }
            } else if chars[pos] == '.' {
                pos += 1;
            } else if chars[pos] == '[' {
                segments.push(Segment {
                    key: read_bracket(&chars, &mut pos).map_err(|m| fail(&m))?,
                    optional,
                });
                continue;
            } else {
                return Err(fail(&format!("unexpected character '{}'", chars[pos])));
            }

            let field = read_ident(&chars, &mut pos);
            if field.is_empty() {
                return Err(fail("expected a property name"));
            }
            segments.push(Segment {
                key: Key::Field(field),
                optional,
            });
        }

        Ok(Self {
            source: trimmed.to_string(),
            root,
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk the path through `ctx`
    pub fn lookup<'a>(&self, ctx: &'a Context) -> Lookup<'a> {
        let Some(mut current) = ctx.get(&self.root) else {
            return Lookup::Missing { optional: false };
        };

        let mut optional = false;
        for segment in &self.segments {
            optional |= segment.optional;
            let next = match (&segment.key, current) {
                (Key::Field(name), Value::Object(map)) => map.get(name),
                (Key::Index(index), Value::Array(items)) => items.get(*index),
                (Key::Field(name), Value::Array(items)) => {
                    name.parse::<usize>().ok().and_then(|index| items.get(index))
                }
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Lookup::Missing { optional },
            }
        }

        Lookup::Found(current)
    }
}

impl fmt::Display for VarPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn read_ident(chars: &[char], pos: &mut usize) -> String {
    let start = *pos;
    while *pos < chars.len() && (chars[*pos].is_alphanumeric() || chars[*pos] == '_' || chars[*pos] == '$') {
        *pos += 1;
    }
    chars[start..*pos].iter().collect()
}

fn read_bracket(chars: &[char], pos: &mut usize) -> Result<Key, String> {
    // Skip '['
    *pos += 1;
    let key = match chars.get(*pos) {
        Some(&quote) if quote == '"' || quote == '\'' => {
            *pos += 1;
            let mut field = String::new();
            loop {
                match chars.get(*pos) {
                    None => return Err("unterminated string in brackets".to_string()),
                    Some('\\') => {
                        let escaped = chars
                            .get(*pos + 1)
                            .ok_or_else(|| "dangling escape".to_string())?;
                        field.push(*escaped);
                        *pos += 2;
                    }
                    Some(&c) if c == quote => {
                        *pos += 1;
                        break;
                    }
                    Some(&c) => {
                        field.push(c);
                        *pos += 1;
                    }
                }
            }
            Key::Field(field)
        }
        Some(c) if c.is_ascii_digit() => {
            let start = *pos;
            while *pos < chars.len() && chars[*pos].is_ascii_digit() {
                *pos += 1;
            }
            let digits: String = chars[start..*pos].iter().collect();
            let index = digits
                .parse::<usize>()
                .map_err(|_| format!("index out of range: {}", digits))?;
            Key::Index(index)
        }
        _ => return Err("expected an index or quoted key in brackets".to_string()),
    };

    if chars.get(*pos) != Some(&']') {
        return Err("expected ']'".to_string());
    }
    *pos += 1;
    Ok(key)
}
