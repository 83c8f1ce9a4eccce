//! Response paths and JSON helpers.

use std::fmt;

use itertools::Itertools;
use serde::Deserialize;
use serde::Serialize;
use serde_json_bytes::ByteString;
use serde_json_bytes::Map;

/// A JSON object.
pub type Object = Map<ByteString, JsonValue>;

/// Plain JSON value used for variables and error extensions.
pub type JsonValue = serde_json_bytes::Value;

/// One step of a [`Path`].
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PathElement {
    /// An index in a list.
    Index(usize),

    /// A response key in a record.
    Key(String),
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathElement::Index(index) => write!(f, "{index}"),
            PathElement::Key(key) => write!(f, "{key}"),
        }
    }
}

/// A path into the response data.
///
/// Serialized as a list of keys and indexes, the way GraphQL errors carry them.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Path(pub Vec<PathElement>);

impl Path {
    pub fn empty() -> Path {
        Path(Vec::new())
    }

    pub fn from_slice<T: AsRef<str>>(keys: &[T]) -> Self {
        Self(
            keys.iter()
                .map(|key| PathElement::Key(key.as_ref().to_string()))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathElement> {
        self.0.iter()
    }

    pub fn join(&self, other: impl AsRef<Self>) -> Self {
        let mut new = self.0.clone();
        new.extend(other.as_ref().0.iter().cloned());
        Path(new)
    }

    pub fn push_key(&mut self, key: impl Into<String>) {
        self.0.push(PathElement::Key(key.into()))
    }

    pub fn push_index(&mut self, index: usize) {
        self.0.push(PathElement::Index(index))
    }

    /// Returns a copy of this path extended with a key.
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        let mut path = self.clone();
        path.push_key(key);
        path
    }

    /// Returns a copy of this path extended with a list index.
    pub fn with_index(&self, index: usize) -> Self {
        let mut path = self.clone();
        path.push_index(index);
        path
    }

    pub fn parent(&self) -> Option<Path> {
        if self.is_empty() {
            None
        } else {
            Some(Path(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    pub fn last_key(&self) -> Option<&str> {
        self.0.iter().rev().find_map(|element| match element {
            PathElement::Key(key) => Some(key.as_str()),
            PathElement::Index(_) => None,
        })
    }

    pub fn starts_with(&self, other: &Path) -> bool {
        self.0.starts_with(&other.0)
    }

    /// The keys of this path joined with dots, list indexes left out.
    ///
    /// `/items/3/owner` becomes `items.owner`.
    pub fn dotted(&self) -> String {
        self.0
            .iter()
            .filter_map(|element| match element {
                PathElement::Key(key) => Some(key.as_str()),
                PathElement::Index(_) => None,
            })
            .join(".")
    }
}

impl AsRef<Path> for Path {
    fn as_ref(&self) -> &Path {
        self
    }
}

impl<T> From<T> for Path
where
    T: AsRef<str>,
{
    fn from(s: T) -> Self {
        Self(
            s.as_ref()
                .split('/')
                .filter(|s| !s.is_empty())
                .map(|s| match s.parse::<usize>() {
                    Ok(index) => PathElement::Index(index),
                    Err(_) => PathElement::Key(s.to_string()),
                })
                .collect(),
        )
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for element in self.iter() {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}
