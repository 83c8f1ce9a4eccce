//! Schema metadata and the selection graph the compiler consumes.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

mod directives;
mod document;
mod field_type;
mod schema;
mod selection;

pub use directives::DirectiveEvaluator;
pub use directives::IncludeSkip;
pub use document::Document;
pub use document::Fragment;
pub use document::Fragments;
pub use document::OperationKind;
pub use document::Statement;
pub use document::VariableDefinition;
pub use document::Variables;
pub(crate) use document::coerce_variables;
pub use field_type::FieldType;
pub use schema::ArgumentDefinition;
pub use schema::AsyncBulkFn;
pub use schema::BulkInput;
pub use schema::BulkLoader;
pub use schema::BulkResolverDefinition;
pub use schema::Cardinality;
pub use schema::DerivedView;
pub use schema::ExtractedField;
pub use schema::FieldBuilder;
pub use schema::FieldDefinition;
pub use schema::MutationFn;
pub use schema::OperationOutcome;
pub use schema::ResolverInput;
pub use schema::RootOperation;
pub use schema::Schema;
pub use schema::SchemaBuilder;
pub use schema::SubscriptionFn;
pub use schema::SyncBulkFn;
pub use schema::TypeBuilder;
pub use schema::TypeDefinition;
pub use schema::TypeKind;
pub use selection::ArgumentValue;
pub use selection::Directive;
pub use selection::NodeKind;
pub use selection::SelectionNode;
pub(crate) use selection::realize_for_type;

pub(crate) const TYPENAME: &str = "__typename";
