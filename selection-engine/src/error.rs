//! Engine errors.
use std::fmt;

use displaydoc::Display;
use serde::Serialize;
use thiserror::Error;

pub use crate::configuration::ConfigurationError;
pub use crate::graphql::Error;
use crate::graphql::ErrorExtension;
use crate::graphql::Response;
use crate::json_ext::Path;

/// Errors raised while turning a selection into an executable operation.
///
/// A compile error fails the whole statement.
#[derive(Error, Display, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum CompileError {
    /// type '{type_name}' has no field '{field}'
    UnknownField { type_name: String, field: String },

    /// missing required argument '{argument}' on field '{field}' at '{path}'
    MissingArgument {
        field: String,
        argument: String,
        path: Path,
    },

    /// unknown fragment '{name}' at '{path}'
    UnknownFragment { name: String, path: Path },

    /// non-null root field '{field}' was removed by a directive
    PrunedNonNullRoot { field: String },

    /// directive '@{directive}' at '{path}' could not be evaluated: {reason}
    Directive {
        directive: String,
        reason: String,
        path: Path,
    },

    /// variable '${name}' is required but was not provided
    MissingVariable { name: String },

    /// variable '${name}' does not match its declared type '{expected}'
    InvalidVariable { name: String, expected: String },

    /// invalid arguments on field '{field}' at '{path}': {errors}
    Validation {
        field: String,
        path: Path,
        errors: ValidationErrors,
    },

    /// selection at '{path}' cannot be compiled: {reason}
    Unsupported { reason: String, path: Path },

    /// selection processing recursion limit exceeded at '{path}'
    RecursionLimitExceeded { path: Path },
}

impl CompileError {
    pub fn path(&self) -> Option<&Path> {
        match self {
            CompileError::MissingArgument { path, .. }
            | CompileError::UnknownFragment { path, .. }
            | CompileError::Directive { path, .. }
            | CompileError::Validation { path, .. }
            | CompileError::Unsupported { path, .. }
            | CompileError::RecursionLimitExceeded { path } => Some(path),
            CompileError::UnknownField { .. }
            | CompileError::PrunedNonNullRoot { .. }
            | CompileError::MissingVariable { .. }
            | CompileError::InvalidVariable { .. } => None,
        }
    }

    /// Convert the compile error to GraphQL errors, one per validation failure.
    pub fn to_graphql_errors(&self) -> Vec<Error> {
        match self {
            CompileError::Validation { errors, .. } => errors
                .iter()
                .map(|error| {
                    Error::builder()
                        .message(error.message.clone())
                        .path(error.path.clone())
                        .extension_code(self.extension_code())
                        .build()
                })
                .collect(),
            _ => vec![
                Error::builder()
                    .message(self.to_string())
                    .and_path(self.path().cloned())
                    .extension_code(self.extension_code())
                    .build(),
            ],
        }
    }
}

impl ErrorExtension for CompileError {
    fn extension_code(&self) -> String {
        match self {
            CompileError::UnknownField { .. } => "UNKNOWN_FIELD",
            CompileError::MissingArgument { .. } => "MISSING_ARGUMENT",
            CompileError::UnknownFragment { .. } => "UNKNOWN_FRAGMENT",
            CompileError::PrunedNonNullRoot { .. } => "PRUNED_NON_NULL_ROOT",
            CompileError::Directive { .. } => "INVALID_DIRECTIVE",
            CompileError::MissingVariable { .. } => "MISSING_VARIABLE",
            CompileError::InvalidVariable { .. } => "VALIDATION_INVALID_TYPE_VARIABLE",
            CompileError::Validation { .. } => "GRAPHQL_VALIDATION_FAILED",
            CompileError::Unsupported { .. } => "UNSUPPORTED_SELECTION",
            CompileError::RecursionLimitExceeded { .. } => "RECURSION_LIMIT_EXCEEDED",
        }
        .to_string()
    }
}

/// One argument value that does not match its declared type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub message: String,
    pub path: Path,
}

/// Validation failures collected for one field and reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ValidationErrors(pub Vec<ValidationError>);

impl ValidationErrors {
    pub fn push(&mut self, message: impl Into<String>, path: Path) {
        self.0.push(ValidationError {
            message: message.into(),
            path,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ValidationError> {
        self.0.iter()
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, error) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            f.write_str(&error.message)?;
        }
        Ok(())
    }
}

/// Errors raised while resolving values.
///
/// Resolution errors are caught per root field and reported as field errors.
#[derive(Error, Display, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ResolveError {
    /// resolver for '{field}' failed: {reason}
    Resolver { field: String, reason: String },

    /// bulk loader for '{name}' failed: {reason}
    BulkLoader { name: String, reason: String },

    /// query provider failed: {reason}
    Provider { reason: String },

    /// service '{service}' is not registered
    MissingService { service: String },

    /// {reason}
    Evaluation { reason: String },

    /// execution was cancelled
    Cancelled,
}

impl ResolveError {
    pub(crate) fn evaluation(reason: impl Into<String>) -> Self {
        ResolveError::Evaluation {
            reason: reason.into(),
        }
    }

    /// Convert the resolve error to a GraphQL error.
    pub fn to_graphql_error(&self, path: Option<Path>) -> Error {
        let mut error = Error::builder()
            .message(self.to_string())
            .and_path(path)
            .extension_code(self.extension_code())
            .build();
        match self {
            ResolveError::Resolver { field, .. } => {
                error
                    .extensions
                    .entry("field")
                    .or_insert_with(|| field.as_str().into());
            }
            ResolveError::MissingService { service } => {
                error
                    .extensions
                    .entry("service")
                    .or_insert_with(|| service.as_str().into());
            }
            _ => {}
        }
        error
    }
}

impl ErrorExtension for ResolveError {
    fn extension_code(&self) -> String {
        match self {
            ResolveError::Resolver { .. } => "RESOLVER_ERROR",
            ResolveError::BulkLoader { .. } => "BULK_LOADER_ERROR",
            ResolveError::Provider { .. } => "QUERY_PROVIDER_ERROR",
            ResolveError::MissingService { .. } => "MISSING_SERVICE",
            ResolveError::Evaluation { .. } => "EVALUATION_ERROR",
            ResolveError::Cancelled => "CANCELLED",
        }
        .to_string()
    }
}

/// Errors that fail a whole execution.
#[derive(Error, Display, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ExecutionError {
    /// compilation failed: {0}
    Compile(#[from] CompileError),

    /// execution was cancelled
    Cancelled,

    /// operation '{0}' is not defined in the document
    UnknownOperation(String),

    /// the document defines several operations, an operation name is required
    OperationNameRequired,

    /// unsupported operation: {reason}
    UnsupportedOperation { reason: String },

    /// internal error: {reason}
    Internal { reason: String },
}

impl ExecutionError {
    /// Convert the error to an appropriate response.
    pub fn to_response(&self) -> Response {
        let errors = match self {
            ExecutionError::Compile(error) => error.to_graphql_errors(),
            _ => vec![
                Error::builder()
                    .message(self.to_string())
                    .extension_code(self.extension_code())
                    .build(),
            ],
        };
        Response::builder().errors(errors).build()
    }
}

impl ErrorExtension for ExecutionError {
    fn extension_code(&self) -> String {
        match self {
            ExecutionError::Compile(error) => return error.extension_code(),
            ExecutionError::Cancelled => "CANCELLED",
            ExecutionError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            ExecutionError::OperationNameRequired => "OPERATION_NAME_REQUIRED",
            ExecutionError::UnsupportedOperation { .. } => "UNSUPPORTED_OPERATION",
            ExecutionError::Internal { .. } => "INTERNAL_ERROR",
        }
        .to_string()
    }
}

impl From<ResolveError> for ExecutionError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::Cancelled => ExecutionError::Cancelled,
            other => ExecutionError::Internal {
                reason: other.to_string(),
            },
        }
    }
}
