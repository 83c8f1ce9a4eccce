//! Layered concurrency limits for asynchronous resolution.
//!
//! A call may be bounded at three scopes at once: its field, each service it uses and the
//! whole query. The effective limit is the smallest of them. `field:` and `query:` entries
//! live as long as one execution, `service:` entries are shared by every execution using
//! the same registry.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedSemaphorePermit;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::configuration::ExecutionOptions;
use crate::error::ResolveError;
use crate::ir::CallSite;

/// Identifies one execution sharing a registry with others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    pub fn new() -> Self {
        ExecutionId(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Field {
        execution: ExecutionId,
        coordinate: String,
    },
    Query(ExecutionId),
    Service(String),
}

impl ScopeKey {
    pub fn is_request_scoped(&self) -> bool {
        !matches!(self, ScopeKey::Service(_))
    }

    fn execution(&self) -> Option<ExecutionId> {
        match self {
            ScopeKey::Field { execution, .. } | ScopeKey::Query(execution) => Some(*execution),
            ScopeKey::Service(_) => None,
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Field { coordinate, .. } => write!(f, "field:{coordinate}"),
            ScopeKey::Query(execution) => write!(f, "query:{execution}"),
            ScopeKey::Service(name) => write!(f, "service:{name}"),
        }
    }
}

/// Counting permits keyed by scope.
///
/// Entries are created on first use and reused by key equality. The capacity of an entry
/// is fixed when it is created.
#[derive(Debug, Default)]
pub struct ConcurrencyLimiterRegistry {
    permits: DashMap<ScopeKey, Arc<Semaphore>>,
}

impl ConcurrencyLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_permit(&self, key: ScopeKey, capacity: usize) -> Arc<Semaphore> {
        self.permits
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(capacity.max(1))))
            .clone()
    }

    /// Removes every `field:` and `query:` entry, keeping `service:` entries.
    pub fn clear_request_scoped(&self) {
        self.permits.retain(|key, _| !key.is_request_scoped());
    }

    /// Removes the request scoped entries of one execution.
    pub fn clear_execution(&self, execution: ExecutionId) {
        self.permits
            .retain(|key, _| key.execution() != Some(execution));
    }

    pub fn contains(&self, key: &ScopeKey) -> bool {
        self.permits.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.permits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permits.is_empty()
    }
}

/// Permits held by one call. Dropping the guard releases them.
#[derive(Debug)]
pub struct LimiterGuard {
    _permits: Vec<OwnedSemaphorePermit>,
}

/// The limits that apply to one execution.
#[derive(Clone, Debug)]
pub struct LimitScope {
    registry: Arc<ConcurrencyLimiterRegistry>,
    execution: ExecutionId,
    field: Option<usize>,
    query: Option<usize>,
    services: Arc<BTreeMap<String, usize>>,
}

impl LimitScope {
    pub fn new(
        registry: Arc<ConcurrencyLimiterRegistry>,
        execution: ExecutionId,
        options: &ExecutionOptions,
    ) -> Self {
        LimitScope {
            registry,
            execution,
            field: options.field_concurrency,
            query: options.query_concurrency,
            services: options.service_concurrency.clone(),
        }
    }

    pub fn execution(&self) -> ExecutionId {
        self.execution
    }

    /// Waits for a permit at every scope bounding this call.
    ///
    /// Permits are always taken in the same order (field, services by name, query) so
    /// that calls waiting on each other cannot deadlock.
    pub async fn acquire(
        &self,
        site: &CallSite,
        services: &[String],
    ) -> Result<LimiterGuard, ResolveError> {
        let mut semaphores = Vec::new();
        let field = match (site.max_concurrency, self.field) {
            (Some(declared), Some(configured)) => Some(declared.min(configured)),
            (declared, configured) => declared.or(configured),
        };
        if let Some(capacity) = field {
            semaphores.push(self.registry.get_permit(
                ScopeKey::Field {
                    execution: self.execution,
                    coordinate: site.coordinate.clone(),
                },
                capacity,
            ));
        }
        let mut names: Vec<&String> = services.iter().collect();
        names.sort();
        names.dedup();
        for name in names {
            if let Some(capacity) = self.services.get(name) {
                semaphores.push(
                    self.registry
                        .get_permit(ScopeKey::Service(name.clone()), *capacity),
                );
            }
        }
        if let Some(capacity) = self.query {
            semaphores.push(
                self.registry
                    .get_permit(ScopeKey::Query(self.execution), capacity),
            );
        }

        let mut permits = Vec::with_capacity(semaphores.len());
        for semaphore in semaphores {
            let permit = semaphore
                .acquire_owned()
                .await
                .map_err(|_| ResolveError::evaluation("concurrency limiter was closed"))?;
            permits.push(permit);
        }
        tracing::trace!(
            coordinate = %site.coordinate,
            permits = permits.len(),
            "acquired concurrency permits"
        );
        Ok(LimiterGuard { _permits: permits })
    }
}
