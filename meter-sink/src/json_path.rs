//! JSON path selection for meter value and group-by properties.
//!
//! Grammar:
//! ```text
//! path    = "$" segment*
//! segment = "." key | "['" text "']" | "[\"" text "\"]" | "[" digits "]"
//! key     = any characters except `.`, `[`, `]`; `*` alone is rejected
//! ```
//!
//! Valid paths: `$`, `$.duration_ms`, `$.request.tags[1]`, `$['model name']`
//! Invalid paths: `tokens`, `$..tokens`, `$.*`, `$.items[`, `$.items[x]`

use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while, take_while1},
    character::complete::{char, digit1},
    combinator::{map, map_res, verify},
    multi::many0,
    sequence::{delimited, preceded},
    IResult,
};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid json path {path:?}: {reason}")]
pub struct PathError {
    pub path: String,
    pub reason: String,
}

fn is_key_char(c: char) -> bool {
    c != '.' && c != '[' && c != ']'
}

/// `.key`
fn dotted_key(input: &str) -> IResult<&str, Segment> {
    map(
        preceded(
            char('.'),
            verify(take_while1(is_key_char), |key: &str| key != "*"),
        ),
        |key: &str| Segment::Key(key.to_string()),
    )(input)
}

/// `['key']` or `["key"]`
fn quoted_key(input: &str) -> IResult<&str, Segment> {
    map(
        alt((
            delimited(tag("['"), take_while(|c: char| c != '\''), tag("']")),
            delimited(tag("[\""), take_while(|c: char| c != '"'), tag("\"]")),
        )),
        |key: &str| Segment::Key(key.to_string()),
    )(input)
}

/// `[0]`
fn index(input: &str) -> IResult<&str, Segment> {
    map_res(delimited(char('['), digit1, char(']')), |digits: &str| {
        digits.parse::<usize>().map(Segment::Index)
    })(input)
}

fn segment(input: &str) -> IResult<&str, Segment> {
    alt((dotted_key, quoted_key, index))(input)
}

/// A parsed path, compiled once per meter and applied to every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonPath {
    raw: String,
    segments: Vec<Segment>,
}

impl JsonPath {
    pub fn parse(path: &str) -> Result<Self, PathError> {
        let fail = |reason: String| PathError {
            path: path.to_string(),
            reason,
        };

        let (rest, segments) = preceded(char('$'), many0(segment))(path)
            .map_err(|_: nom::Err<nom::error::Error<&str>>| fail("must start with $".to_string()))?;
        if !rest.is_empty() {
            return Err(fail(format!("unexpected {rest:?}")));
        }

        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// The value at this path, or `None` when the document has nothing there.
    pub fn select<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match (segment, current) {
                (Segment::Key(key), Value::Object(map)) => map.get(key),
                (Segment::Index(index), Value::Array(items)) => items.get(*index),
                _ => None,
            })
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
