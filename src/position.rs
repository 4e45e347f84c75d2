//! Canonical path identifiers into a compiled workflow graph
//!
//! A [`Position`] names a node the way a JSON Pointer names a value: an
//! ordered list of segments walked from the document root. Positions are the
//! only thing that survives between steps (spec: the envelope carries a
//! position, never a pointer into a live tree), so they are plain data with
//! structural equality, cheap to hash and to clone.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One step in a [`Position`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segment {
    /// A named child, e.g. the task name under a `do` block.
    Name(String),
    /// An index into an array, e.g. the nth entry of a `do` list.
    Index(usize),
    /// A reserved structural token (`do`, `try`, `catch`, `for`, `fork`, ...).
    Token(Token),
}

/// Reserved structural tokens used when compiling a task tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Token {
    Do,
    Try,
    Catch,
    For,
    Fork,
    Branch,
    Switch,
}

impl Token {
    fn as_str(self) -> &'static str {
        match self {
            Token::Do => "do",
            Token::Try => "try",
            Token::Catch => "catch",
            Token::For => "for",
            Token::Fork => "fork",
            Token::Branch => "branch",
            Token::Switch => "switch",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name(n) => write!(f, "{n}"),
            Segment::Index(i) => write!(f, "{i}"),
            Segment::Token(t) => write!(f, "{}", t.as_str()),
        }
    }
}

/// An immutable path into the compiled node graph.
///
/// Equality is structural. The canonical textual form is a JSON Pointer,
/// e.g. `/do/0/try/catch/do/2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position(Vec<Segment>);

impl Position {
    /// The root position (the workflow itself).
    pub fn root() -> Self {
        Position(Vec::new())
    }

    /// Whether this is the root position.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Append a named-child segment, returning the child position.
    pub fn child_name(&self, name: impl Into<String>) -> Self {
        self.append(Segment::Name(name.into()))
    }

    /// Append an array-index segment, returning the child position.
    pub fn child_index(&self, index: usize) -> Self {
        self.append(Segment::Index(index))
    }

    /// Append a reserved token segment, returning the child position.
    pub fn child_token(&self, token: Token) -> Self {
        self.append(Segment::Token(token))
    }

    fn append(&self, segment: Segment) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Position(segments)
    }

    /// The parent of this position, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Position(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// The last segment, i.e. this node's short name within its scope.
    pub fn last(&self) -> Option<&Segment> {
        self.0.last()
    }

    /// Segments, root to leaf.
    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// Render as a JSON-Pointer string (`/do/0/name`).
    pub fn to_pointer(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        for seg in &self.0 {
            out.push('/');
            out.push_str(&seg.to_string().replace('~', "~0").replace('/', "~1"));
        }
        out
    }

    /// Parse a JSON-Pointer string back into a `Position`.
    ///
    /// Integer-looking segments become [`Segment::Index`]; segments matching
    /// a reserved token become [`Segment::Token`]; everything else is a
    /// [`Segment::Name`].
    pub fn from_pointer(pointer: &str) -> Self {
        if pointer.is_empty() {
            return Position::root();
        }
        let segments = pointer
            .split('/')
            .skip(1)
            .map(|raw| {
                let unescaped = raw.replace("~1", "/").replace("~0", "~");
                if let Ok(index) = unescaped.parse::<usize>() {
                    Segment::Index(index)
                } else {
                    match unescaped.as_str() {
                        "do" => Segment::Token(Token::Do),
                        "try" => Segment::Token(Token::Try),
                        "catch" => Segment::Token(Token::Catch),
                        "for" => Segment::Token(Token::For),
                        "fork" => Segment::Token(Token::Fork),
                        "branch" => Segment::Token(Token::Branch),
                        "switch" => Segment::Token(Token::Switch),
                        _ => Segment::Name(unescaped),
                    }
                }
            })
            .collect();
        Position(segments)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_pointer())
    }
}

impl Serialize for PositionPointer {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_pointer())
    }
}

/// Newtype wrapper used when a `Position` needs to serialize as the bare
/// pointer string rather than its segment array (e.g. as a map key in the
/// message envelope's states map).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionPointer(pub Position);

impl<'de> Deserialize<'de> for PositionPointer {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(PositionPointer(Position::from_pointer(&s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_pointer_is_empty_string() {
        assert_eq!(Position::root().to_pointer(), "");
    }

    #[test]
    fn builds_canonical_try_catch_pointer() {
        let pos = Position::root()
            .child_token(Token::Do)
            .child_index(0)
            .child_token(Token::Try)
            .child_token(Token::Catch)
            .child_token(Token::Do)
            .child_index(2);

        assert_eq!(pos.to_pointer(), "/do/0/try/catch/do/2");
    }

    #[test]
    fn round_trips_through_pointer_string() {
        let pos = Position::root()
            .child_token(Token::Do)
            .child_index(3)
            .child_name("greet");

        let parsed = Position::from_pointer(&pos.to_pointer());
        assert_eq!(pos, parsed);
    }

    #[test]
    fn parent_pops_one_segment() {
        let pos = Position::root().child_token(Token::Do).child_index(1);
        let parent = pos.parent().unwrap();
        assert_eq!(parent.to_pointer(), "/do");
        assert_eq!(parent.parent().unwrap(), Position::root());
        assert!(Position::root().parent().is_none());
    }

    #[test]
    fn equality_is_structural() {
        let a = Position::root().child_name("x").child_index(1);
        let b = Position::root().child_name("x").child_index(1);
        assert_eq!(a, b);
    }
}
