//! Null propagation over a resolved value.

use crate::graphql::Error;
use crate::json_ext::Path;
use crate::json_ext::PathElement;
use crate::spec::FieldType;
use crate::value::Origin;
use crate::value::Record;
use crate::value::RecordBuilder;
use crate::value::Value;

pub(crate) const NULL_VALUE_IN_NON_NULL_FIELD: &str = "NULL_VALUE_IN_NON_NULL_FIELD";

/// A null reached a non-null position and must replace the nearest nullable ancestor.
#[derive(Debug)]
pub(crate) struct Nulled;

/// Checks `value` against its declared type.
///
/// `parent_type` names the type declaring the field, for error messages.
pub(crate) fn complete(
    value: Value,
    ty: &FieldType,
    parent_type: &str,
    path: &Path,
    errors: &mut Vec<Error>,
) -> Result<Value, Nulled> {
    match ty {
        // validate with the inner type; a null that is still there is invalid here and
        // goes up to the next nullable parent
        FieldType::NonNull(inner) => match complete(value, inner, parent_type, path, errors) {
            Err(Nulled) => Err(Nulled),
            Ok(value) if value.is_null() => {
                if !has_error_under(errors, path) {
                    let message = match path.0.last() {
                        Some(PathElement::Index(index)) => format!(
                            "Cannot return null for non-nullable array element of type {inner} at index {index}"
                        ),
                        Some(PathElement::Key(key)) => {
                            format!("Cannot return null for non-nullable field {parent_type}.{key}")
                        }
                        None => format!("Cannot return null for non-nullable field {parent_type}"),
                    };
                    errors.push(
                        Error::builder()
                            .message(message)
                            .path(path.clone())
                            .extension_code(NULL_VALUE_IN_NON_NULL_FIELD)
                            .build(),
                    );
                }
                Err(Nulled)
            }
            Ok(value) => Ok(value),
        },
        // a non-null element that was nulled replaces the entire list with null
        FieldType::List(item) => match value {
            Value::List(items) => {
                let completed: Result<Vec<Value>, Nulled> = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, element)| {
                        complete(element, item, parent_type, &path.with_index(index), errors)
                    })
                    .collect();
                Ok(completed.map(Value::List).unwrap_or_default())
            }
            other => Ok(other),
        },
        _ => match value {
            Value::Record(record) => Ok(complete_record(record, path, errors)),
            other => Ok(other),
        },
    }
}

fn complete_record(record: Record, path: &Path, errors: &mut Vec<Error>) -> Value {
    if record
        .members()
        .all(|(member, _)| member.declared.is_none())
    {
        return Value::Record(record);
    }
    let parent_type = record.type_name().unwrap_or_default().to_string();
    let origin = record.origin();
    let type_name = record.type_name_bytes().cloned();
    let members: Vec<_> = record
        .members()
        .map(|(member, value)| (member.clone(), value.clone()))
        .collect();

    let mut builder = match origin {
        Origin::Synthesized => RecordBuilder::synthesized(),
        Origin::External => RecordBuilder::external(),
    }
    .maybe_type_name(type_name);
    for (member, value) in members {
        let value = match &member.declared {
            Some(declared) => {
                match complete(
                    value,
                    declared,
                    &parent_type,
                    &path.with_key(member.name.as_str()),
                    errors,
                ) {
                    Ok(value) => value,
                    Err(Nulled) => return Value::Null,
                }
            }
            None => value,
        };
        builder.push(member.name, member.declared, value);
    }
    Value::Record(builder.build())
}

fn has_error_under(errors: &[Error], path: &Path) -> bool {
    errors.iter().any(|error| {
        error
            .path
            .as_ref()
            .map(|error_path| error_path.starts_with(path))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json_bytes::json;

    use super::*;

    fn user(name: Value) -> Value {
        Value::Record(
            RecordBuilder::synthesized()
                .type_name("User")
                .typed_member("name", FieldType::String.non_null(), name)
                .typed_member("nickname", FieldType::String, Value::Null)
                .build(),
        )
    }

    #[test]
    fn nulls_go_up_to_the_nearest_nullable_field() {
        let mut errors = Vec::new();
        let users = Value::List(vec![user(Value::from("Ada")), user(Value::Null)]);
        let ty = FieldType::named("User").list();
        let completed = complete(users, &ty, "Query", &Path::from("/users"), &mut errors).unwrap();
        assert_eq!(
            completed.to_json().unwrap(),
            json!([{"name": "Ada", "nickname": null}, null])
        );
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].path, Some(Path::from("/users/1/name")));
        assert_eq!(errors[0].message, "Cannot return null for non-nullable field User.name");
        assert_eq!(errors[0].code(), Some(NULL_VALUE_IN_NON_NULL_FIELD));
    }

    #[test]
    fn non_null_elements_null_the_whole_list() {
        let mut errors = Vec::new();
        let ty = FieldType::Int.non_null().list();
        let completed = complete(
            Value::from(json!([1, null, 3])),
            &ty,
            "Query",
            &Path::from("/numbers"),
            &mut errors,
        )
        .unwrap();
        assert!(completed.is_null());
        assert_eq!(errors[0].path, Some(Path::from("/numbers/1")));
    }

    #[test]
    fn existing_errors_are_not_repeated() {
        let mut errors = vec![
            Error::builder()
                .message("resolver failed")
                .path(Path::from("/me"))
                .build(),
        ];
        let ty = FieldType::named("User").non_null();
        assert!(complete(Value::Null, &ty, "Query", &Path::from("/me"), &mut errors).is_err());
        assert_eq!(errors.len(), 1);
    }
}
