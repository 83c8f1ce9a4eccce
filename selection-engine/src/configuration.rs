//! Logic for loading configuration in to an object model

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;

use derivative::Derivative;
use displaydoc::Display;
use schemars::JsonSchema;
use schemars::schema::RootSchema;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::ir::Expr;

/// Configuration error.
#[derive(Debug, Error, Display)]
#[non_exhaustive]
pub enum ConfigurationError {
    /// {message}: {error}
    InvalidConfiguration {
        message: &'static str,
        error: String,
    },
    /// could not deserialize configuration: {0}
    DeserializeConfigError(serde_yaml::Error),
}

/// The configuration for the engine.
///
/// Can be created through `serde::Deserialize` from various formats, or parsed from YAML
/// with [`FromStr`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Configuration {
    /// Execution options.
    pub execution: Execution,
}

/// Execution options.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Execution {
    /// Split operations that need injected services into a phase the query provider can
    /// run and a phase that runs the services. Defaults to `true`.
    pub phase_splitting: bool,

    /// Concurrency limits for asynchronous fields.
    pub concurrency: Concurrency,
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            phase_splitting: true,
            concurrency: Default::default(),
        }
    }
}

/// Concurrency limits. An unset limit is unbounded.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct Concurrency {
    /// Limit for each asynchronous field of one execution. A field declaring its own limit
    /// gets the smaller of the two.
    pub field: Option<usize>,

    /// Limit for all asynchronous fields of one execution.
    pub query: Option<usize>,

    /// Limit per injected service, shared by every execution.
    pub services: BTreeMap<String, usize>,
}

impl Configuration {
    /// The JSON schema of the configuration.
    pub fn json_schema() -> RootSchema {
        schemars::schema_for!(Configuration)
    }

    pub fn validate(self) -> Result<Self, ConfigurationError> {
        let concurrency = &self.execution.concurrency;
        let zero_limit = [
            ("execution.concurrency.field", concurrency.field),
            ("execution.concurrency.query", concurrency.query),
        ]
        .into_iter()
        .filter_map(|(name, limit)| (limit == Some(0)).then(|| name.to_string()))
        .chain(
            concurrency
                .services
                .iter()
                .filter(|(_, limit)| **limit == 0)
                .map(|(name, _)| format!("execution.concurrency.services.{name}")),
        )
        .next();
        if let Some(name) = zero_limit {
            return Err(ConfigurationError::InvalidConfiguration {
                message: "concurrency limits must be at least 1",
                error: format!("{name} is 0"),
            });
        }
        Ok(self)
    }

    /// The runtime options of an execution using this configuration.
    pub fn execution_options(&self) -> ExecutionOptions {
        let concurrency = &self.execution.concurrency;
        ExecutionOptions {
            phase_splitting: self.execution.phase_splitting,
            field_concurrency: concurrency.field,
            query_concurrency: concurrency.query,
            service_concurrency: Arc::new(concurrency.services.clone()),
            ..Default::default()
        }
    }
}

impl FromStr for Configuration {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Configuration::default());
        }
        let configuration: Configuration =
            serde_yaml::from_str(s).map_err(ConfigurationError::DeserializeConfigError)?;
        configuration.validate()
    }
}

/// Rewrites a compiled operation right before it is evaluated.
pub type OperationHook = Arc<dyn Fn(Expr) -> Expr + Send + Sync>;

/// Options for one execution: the configured limits plus the runtime-only parts.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct ExecutionOptions {
    pub phase_splitting: bool,
    pub field_concurrency: Option<usize>,
    pub query_concurrency: Option<usize>,
    pub service_concurrency: Arc<BTreeMap<String, usize>>,
    pub cancellation: CancellationToken,
    #[derivative(Debug = "ignore")]
    pub before_execute: Vec<OperationHook>,
}

impl Default for ExecutionOptions {
    fn default() -> Self {
        Self {
            phase_splitting: true,
            field_concurrency: None,
            query_concurrency: None,
            service_concurrency: Default::default(),
            cancellation: CancellationToken::new(),
            before_execute: Vec::new(),
        }
    }
}

impl ExecutionOptions {
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(Expr) -> Expr + Send + Sync + 'static,
    {
        self.before_execute.push(Arc::new(hook));
        self
    }

    pub(crate) fn apply_hooks(&self, mut expr: Expr) -> Expr {
        for hook in &self.before_execute {
            expr = hook(expr);
        }
        expr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let configuration = Configuration::from_str("").unwrap();
        assert!(configuration.execution.phase_splitting);
        let options = configuration.execution_options();
        assert!(options.phase_splitting);
        assert_eq!(options.field_concurrency, None);
        assert!(!options.cancellation.is_cancelled());
    }

    #[test]
    fn parses_yaml() {
        let configuration = Configuration::from_str(
            r#"
execution:
  phase_splitting: false
  concurrency:
    field: 4
    query: 16
    services:
      pricing: 2
"#,
        )
        .unwrap();
        let options = configuration.execution_options();
        assert!(!options.phase_splitting);
        assert_eq!(options.field_concurrency, Some(4));
        assert_eq!(options.query_concurrency, Some(16));
        assert_eq!(options.service_concurrency.get("pricing"), Some(&2));
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(matches!(
            Configuration::from_str("execution:\n  phase_split: false\n"),
            Err(ConfigurationError::DeserializeConfigError(_))
        ));
    }

    #[test]
    fn rejects_zero_limits() {
        let error = Configuration::from_str(
            "execution:\n  concurrency:\n    services:\n      pricing: 0\n",
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "concurrency limits must be at least 1: execution.concurrency.services.pricing is 0"
        );
    }

    #[test]
    fn schema_lists_options() {
        let schema = serde_json::to_value(Configuration::json_schema()).unwrap();
        let rendered = schema.to_string();
        assert!(rendered.contains("phase_splitting"));
        assert!(rendered.contains("services"));
    }

    #[test]
    fn hooks_run_in_order() {
        let options = ExecutionOptions::default()
            .with_hook(|expr| expr.member("a"))
            .with_hook(|expr| expr.member("b"));
        let Expr::Member { object, name } = options.apply_hooks(Expr::root()) else {
            panic!("expected a member read");
        };
        assert_eq!(name, "b");
        assert!(matches!(*object, Expr::Member { ref name, .. } if name == "a"));
    }
}
