use super::ArgumentValue;
use super::Directive;
use super::Variables;
use crate::error::CompileError;
use crate::json_ext::Path;

/// Decides whether a selection is kept.
///
/// Directives other than keep/drop conditions are ignored by the engine.
pub trait DirectiveEvaluator: Send + Sync {
    fn keep(
        &self,
        directives: &[Directive],
        variables: &Variables,
        path: &Path,
    ) -> Result<bool, CompileError>;
}

/// Evaluates `@include(if:)` and `@skip(if:)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeSkip;

impl DirectiveEvaluator for IncludeSkip {
    fn keep(
        &self,
        directives: &[Directive],
        variables: &Variables,
        path: &Path,
    ) -> Result<bool, CompileError> {
        for directive in directives {
            let keep_when = match directive.name.as_str() {
                "include" => true,
                "skip" => false,
                _ => continue,
            };
            if Condition::parse(directive, path)?.eval(variables, directive, path)? != keep_when {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Condition {
    Yes,
    No,
    Variable(String),
}

impl Condition {
    fn parse(directive: &Directive, path: &Path) -> Result<Self, CompileError> {
        match directive.arguments.get("if") {
            Some(ArgumentValue::Literal(value)) => match value.as_bool() {
                Some(true) => Ok(Condition::Yes),
                Some(false) => Ok(Condition::No),
                None => Err(invalid(directive, "'if' must be a boolean", path)),
            },
            Some(ArgumentValue::Variable(name)) => Ok(Condition::Variable(name.clone())),
            None => Err(invalid(directive, "missing 'if' argument", path)),
        }
    }

    fn eval(
        &self,
        variables: &Variables,
        directive: &Directive,
        path: &Path,
    ) -> Result<bool, CompileError> {
        match self {
            Condition::Yes => Ok(true),
            Condition::No => Ok(false),
            Condition::Variable(name) => variables
                .get(name)
                .and_then(|value| value.as_bool())
                .ok_or_else(|| {
                    invalid(
                        directive,
                        &format!("variable '${name}' is not a boolean"),
                        path,
                    )
                }),
        }
    }
}

fn invalid(directive: &Directive, reason: &str, path: &Path) -> CompileError {
    CompileError::Directive {
        directive: directive.name.clone(),
        reason: reason.to_string(),
        path: path.clone(),
    }
}
