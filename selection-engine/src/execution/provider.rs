use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::ResolveError;
use crate::flatten::flatten;
use crate::graphql::Error;
use crate::ir::Bindings;
use crate::ir::Env;
use crate::ir::Expr;
use crate::ir::evaluate;
use crate::json_ext::Path;
use crate::limiter::LimitScope;
use crate::value::Value;

/// A phase-one operation handed to the backing store.
///
/// The operation never needs injected services: it reads the root context, constants and
/// plain sub-expressions only.
#[derive(Debug)]
pub struct ProviderRequest {
    pub operation: Expr,
    pub root: Value,
    pub constants: Vec<Value>,
    pub limits: Option<LimitScope>,
    pub cancel: CancellationToken,
    /// Response path of the root field being materialized.
    pub path: Path,
}

/// The materialized result of a phase-one operation.
#[derive(Debug, Default)]
pub struct ProviderResponse {
    /// Fully resolved: contains no pending values.
    pub data: Value,
    pub errors: Vec<Error>,
}

/// Executes phase-one operations, pushing filtering and ordering to the store.
#[async_trait]
pub trait QueryProvider: Send + Sync {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, ResolveError>;
}

/// Runs operations with the in-process interpreter.
#[derive(Debug, Clone, Copy, Default)]
pub struct InMemoryProvider;

#[async_trait]
impl QueryProvider for InMemoryProvider {
    async fn execute(&self, request: ProviderRequest) -> Result<ProviderResponse, ResolveError> {
        let ProviderRequest {
            operation,
            root,
            constants,
            limits,
            cancel,
            path,
        } = request;
        let env = Env::new(
            Bindings::new(root)
                .constants(constants)
                .limits(limits)
                .cancellation(cancel.clone()),
        );
        let value = evaluate(&operation, &env)?;
        let (data, errors) = flatten(value, path, cancel).await?;
        Ok(ProviderResponse { data, errors })
    }
}
