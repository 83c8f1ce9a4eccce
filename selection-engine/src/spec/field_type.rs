use crate::spec::Schema;
use crate::spec::TypeKind;
use crate::value::Value;

#[derive(Debug)]
pub(crate) struct InvalidValue;

// Primitives are taken from scalars: https://spec.graphql.org/draft/#sec-Scalars
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldType {
    /// Named type {0}
    Named(String),
    /// List type {0}
    List(Box<FieldType>),
    /// Non null type {0}
    NonNull(Box<FieldType>),
    /// String
    String,
    /// Int
    Int,
    /// Float
    Float,
    /// Id
    Id,
    /// Boolean
    Boolean,
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Named(ty) => write!(f, "{ty}"),
            FieldType::List(ty) => write!(f, "[{ty}]"),
            FieldType::NonNull(ty) => write!(f, "{ty}!"),
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Id => write!(f, "ID"),
            FieldType::Boolean => write!(f, "Boolean"),
        }
    }
}

impl FieldType {
    /// A named type reference, mapping the built-in scalar names to their variants.
    pub fn named(name: impl AsRef<str>) -> Self {
        match name.as_ref() {
            "String" => Self::String,
            "Int" => Self::Int,
            "Float" => Self::Float,
            "ID" => Self::Id,
            "Boolean" => Self::Boolean,
            other => Self::Named(other.to_string()),
        }
    }

    pub fn non_null(self) -> Self {
        match self {
            FieldType::NonNull(_) => self,
            other => FieldType::NonNull(Box::new(other)),
        }
    }

    pub fn list(self) -> Self {
        FieldType::List(Box::new(self))
    }

    pub fn is_non_null(&self) -> bool {
        matches!(self, FieldType::NonNull(_))
    }

    /// This type without its outer non-null wrapper.
    pub fn nullable(&self) -> &FieldType {
        match self {
            FieldType::NonNull(inner) => inner,
            other => other,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self.nullable(), FieldType::List(_))
    }

    /// The element type when this is a (possibly non-null) list.
    pub fn list_item(&self) -> Option<&FieldType> {
        match self.nullable() {
            FieldType::List(inner) => Some(inner),
            _ => None,
        }
    }

    /// return the name of the type on which selections happen
    ///
    /// Example if we get the field `list: [User!]!`, it will return "User"
    pub fn inner_type_name(&self) -> Option<&str> {
        match self {
            FieldType::Named(name) => Some(name.as_str()),
            FieldType::List(inner) | FieldType::NonNull(inner) => inner.inner_type_name(),
            FieldType::String
            | FieldType::Int
            | FieldType::Float
            | FieldType::Id
            | FieldType::Boolean => None,
        }
    }

    pub fn is_builtin_scalar(&self) -> bool {
        match self {
            FieldType::Named(_) | FieldType::List(_) | FieldType::NonNull(_) => false,
            FieldType::String
            | FieldType::Int
            | FieldType::Float
            | FieldType::Id
            | FieldType::Boolean => true,
        }
    }

    // Validates input values following GraphQL input coercion rules.
    // Each of the values are validated against the "input coercion" rules.
    pub(crate) fn validate_input_value(
        &self,
        value: &Value,
        schema: &Schema,
    ) -> Result<(), InvalidValue> {
        match (self, value) {
            (FieldType::NonNull(inner_ty), value) => {
                if value.is_null() {
                    Err(InvalidValue)
                } else {
                    inner_ty.validate_input_value(value, schema)
                }
            }
            // NOTE: graphql's types are all optional by default
            (_, Value::Null) => Ok(()),
            (FieldType::String, Value::String(_)) => Ok(()),
            // Spec: https://spec.graphql.org/June2018/#sec-Int
            (FieldType::Int, Value::Number(n)) if is_valid_int(n) => Ok(()),
            // Spec: https://spec.graphql.org/draft/#sec-Float.Input-Coercion
            (FieldType::Float, Value::Number(_)) => Ok(()),
            // In practice an Int is accepted as an ID
            (FieldType::Id, Value::String(_)) => Ok(()),
            (FieldType::Id, Value::Number(n)) if is_valid_int(n) => Ok(()),
            (FieldType::Boolean, Value::Bool(_)) => Ok(()),
            (FieldType::List(inner_ty), Value::List(items)) => items
                .iter()
                .try_for_each(|item| inner_ty.validate_input_value(item, schema)),
            // For coercion from single value to list
            (FieldType::List(inner_ty), value) => inner_ty.validate_input_value(value, schema),
            (FieldType::Named(name), value) => match schema.type_definition(name) {
                Some(ty) if matches!(ty.kind, TypeKind::Scalar | TypeKind::Enum) => Ok(()),
                Some(ty) if ty.kind == TypeKind::InputObject => {
                    let record = value.as_record().ok_or(InvalidValue)?;
                    if record.iter().any(|(key, _)| !ty.fields.contains_key(key)) {
                        return Err(InvalidValue);
                    }
                    ty.fields.values().try_for_each(|field| {
                        let value = record.get(&field.name).unwrap_or(&Value::Null);
                        field.ty.validate_input_value(value, schema)
                    })
                }
                _ => Err(InvalidValue),
            },
            _ => Err(InvalidValue),
        }
    }
}

fn is_valid_int(number: &serde_json::Number) -> bool {
    number
        .as_i64()
        .map(|n| i32::try_from(n).is_ok())
        .unwrap_or(false)
}
