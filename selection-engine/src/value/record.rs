use std::sync::Arc;

use serde::Serialize;
use serde::Serializer;
use serde::ser::SerializeMap;
use serde_json_bytes::ByteString;

use super::TypeTag;
use super::Value;
use crate::spec::FieldType;

/// Who produced a record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Origin {
    /// Built by the engine from a projection.
    #[default]
    Synthesized,
    /// Handed to the engine by a root context, provider or resolver.
    External,
}

/// One member of a record shape.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Member {
    pub name: String,
    pub tag: TypeTag,
    /// Field type the member was projected from, when known.
    pub declared: Option<FieldType>,
}

/// The ordered member list of a record.
///
/// Two records with equal shapes are instances of the same dynamic type.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Shape(Arc<[Member]>);

impl Shape {
    pub fn members(&self) -> &[Member] {
        &self.0
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|member| member.name == name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A dynamic record: named members with values, an optional runtime type name and an
/// [`Origin`].
#[derive(Clone, Debug, Default)]
pub struct Record {
    type_name: Option<ByteString>,
    origin: Origin,
    shape: Shape,
    values: Vec<Value>,
}

impl Record {
    pub fn type_name(&self) -> Option<&str> {
        self.type_name.as_ref().map(|name| name.as_str())
    }

    pub(crate) fn type_name_bytes(&self) -> Option<&ByteString> {
        self.type_name.as_ref()
    }

    pub fn origin(&self) -> Origin {
        self.origin
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.shape.position(name).map(|index| &self.values[index])
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.shape.position(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.shape
            .members()
            .iter()
            .map(|member| member.name.as_str())
            .zip(self.values.iter())
    }

    pub fn members(&self) -> impl Iterator<Item = (&Member, &Value)> {
        self.shape.members().iter().zip(self.values.iter())
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Replaces the member values while keeping the shape.
    ///
    /// Member tags are left untouched: this is how external records are updated in place.
    pub(crate) fn with_values(self, values: Vec<Value>) -> Record {
        debug_assert_eq!(self.values.len(), values.len());
        Record { values, ..self }
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.type_name == other.type_name
            && self.len() == other.len()
            && self.iter().zip(other.iter()).all(|(a, b)| a == b)
    }
}

impl Serialize for Record {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(self.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Builds [`Record`]s.
///
/// Adding a member with a name that is already present replaces the earlier value.
#[derive(Debug, Default)]
pub struct RecordBuilder {
    type_name: Option<ByteString>,
    origin: Origin,
    members: Vec<Member>,
    values: Vec<Value>,
}

impl RecordBuilder {
    pub fn synthesized() -> Self {
        Self {
            origin: Origin::Synthesized,
            ..Default::default()
        }
    }

    pub fn external() -> Self {
        Self {
            origin: Origin::External,
            ..Default::default()
        }
    }

    pub fn type_name(mut self, name: impl Into<ByteString>) -> Self {
        self.type_name = Some(name.into());
        self
    }

    pub fn maybe_type_name(mut self, name: Option<ByteString>) -> Self {
        self.type_name = name;
        self
    }

    pub fn member(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.push(name, None, value.into());
        self
    }

    pub fn typed_member(
        mut self,
        name: impl Into<String>,
        declared: FieldType,
        value: impl Into<Value>,
    ) -> Self {
        self.push(name, Some(declared), value.into());
        self
    }

    pub fn push(&mut self, name: impl Into<String>, declared: Option<FieldType>, value: Value) {
        let member = Member {
            name: name.into(),
            tag: value.tag(),
            declared,
        };
        match self.members.iter().position(|m| m.name == member.name) {
            Some(index) => {
                self.members[index] = member;
                self.values[index] = value;
            }
            None => {
                self.members.push(member);
                self.values.push(value);
            }
        }
    }

    pub fn build(self) -> Record {
        Record {
            type_name: self.type_name,
            origin: self.origin,
            shape: Shape(self.members.into()),
            values: self.values,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_members_share_a_shape() {
        let a = RecordBuilder::synthesized()
            .member("id", 1)
            .member("name", "a")
            .build();
        let b = RecordBuilder::synthesized()
            .member("id", 2)
            .member("name", "b")
            .build();
        assert_eq!(a.shape(), b.shape());
        assert_ne!(a, b);
    }

    #[test]
    fn later_member_replaces_earlier() {
        let record = RecordBuilder::external()
            .type_name("User")
            .member("name", "first")
            .member("id", 1)
            .member("name", "second")
            .build();
        assert_eq!(record.len(), 2);
        assert_eq!(record.get("name"), Some(&Value::from("second")));
        assert_eq!(record.type_name(), Some("User"));
        assert_eq!(record.origin(), Origin::External);
        assert_eq!(
            record.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            vec!["name", "id"]
        );
    }

    #[test]
    fn member_tags_follow_values() {
        let record = RecordBuilder::synthesized()
            .typed_member("age", FieldType::Int, 3)
            .member("tags", Value::List(vec![]))
            .build();
        let tags: Vec<_> = record.members().map(|(member, _)| member.tag).collect();
        assert_eq!(tags, vec![TypeTag::Number, TypeTag::List]);
        assert_eq!(
            record.members().next().unwrap().0.declared,
            Some(FieldType::Int)
        );
    }
}
