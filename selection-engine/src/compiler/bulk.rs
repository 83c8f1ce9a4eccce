//! Bulk resolvers: one loader call per field site for a whole materialized result.
//!
//! Registrations are collected while compiling phase one. Once the provider materialized
//! the root field, every registration walks its ancestor path to collect the parent
//! rows, selects one key per row and invokes its loader exactly once with the distinct
//! keys. Phase two reads the loaded values with [`Expr::BulkLookup`].

use futures::future;
use indexmap::IndexMap;
use indexmap::IndexSet;
use tokio_util::sync::CancellationToken;

use super::MaterializedShape;
use crate::error::ResolveError;
use crate::execution::ServiceProvider;
use crate::ir::Bindings;
use crate::ir::Call;
use crate::ir::CallInput;
use crate::ir::CallSite;
use crate::ir::Env;
use crate::ir::Expr;
use crate::ir::InjectedServices;
use crate::ir::Resolver;
use crate::ir::evaluate;
use crate::ir::rewrite::extracted_name;
use crate::json_ext::Path;
use crate::limiter::LimitScope;
use crate::spec::BulkInput;
use crate::spec::BulkLoader;
use crate::spec::BulkResolverDefinition;
use crate::spec::FieldDefinition;
use crate::value::RecordBuilder;
use crate::value::Value;

/// One ancestor between the root field and the rows of a bulk field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Step {
    pub(crate) name: String,
    pub(crate) collection: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Registration {
    pub(crate) name: String,
    pub(crate) site: CallSite,
    pub(crate) data_selector: Expr,
    pub(crate) loader: BulkLoader,
    pub(crate) services: Vec<String>,
    pub(crate) ancestors: Vec<Step>,
    pub(crate) root_is_collection: bool,
    /// Only rows of this runtime type are keyed, for fields selected on one member of an
    /// interface or union.
    pub(crate) row_type: Option<String>,
}

impl Registration {
    pub(crate) fn new(
        name: String,
        field: &FieldDefinition,
        bulk: &BulkResolverDefinition,
        ancestors: Vec<Step>,
        root_is_collection: bool,
        row_type: Option<String>,
    ) -> Self {
        Registration {
            name,
            site: CallSite {
                coordinate: field.coordinate(),
                max_concurrency: field.max_concurrency,
            },
            data_selector: bulk.data_selector.clone(),
            loader: bulk.loader.clone(),
            services: bulk.services.clone(),
            ancestors,
            root_is_collection,
            row_type,
        }
    }

    pub(crate) fn is_async(&self) -> bool {
        self.loader.is_async()
    }

    /// The parent rows of the field, null rows left out.
    fn rows(&self, materialized: &Value) -> Vec<Value> {
        let mut rows = Vec::new();
        collect_rows(materialized, self.root_is_collection, &self.ancestors, &mut rows);
        if let Some(row_type) = &self.row_type {
            rows.retain(|row| {
                row.as_record()
                    .and_then(|record| record.type_name())
                    .map(|name| name == row_type)
                    .unwrap_or(false)
            });
        }
        rows
    }

    /// Distinct non-null keys, in the order rows were found.
    async fn keys(&self, rows: Vec<Value>) -> Result<Vec<Value>, ResolveError> {
        let shape = MaterializedShape::of(&Value::List(rows.clone()));
        let row = Expr::param(0);
        let mut next = 0;
        let selector = self
            .data_selector
            .rename_params(&mut || {
                next += 1;
                next
            })
            .replace_parent_chains(&row, &|chain| {
                let name = extracted_name(chain);
                shape.has(&name).then_some(name)
            })
            .substitute_parent(&row);
        let selected = evaluate(
            &Expr::literal(Value::List(rows)).map(0, selector),
            &Env::new(Bindings::new(Value::Null)),
        )?;
        let selected = match selected {
            Value::Pending(pending) => pending.resolve().await?,
            selected => selected,
        };

        let mut seen = IndexSet::new();
        let mut keys = Vec::new();
        for key in selected.as_list().unwrap_or_default() {
            let key = match key {
                Value::Pending(pending) => pending.resolve().await?,
                key => key.clone(),
            };
            if let Some(identity) = key.key_string() {
                if seen.insert(identity) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    async fn load(
        &self,
        keys: Vec<Value>,
        services: &dyn ServiceProvider,
        limits: Option<&LimitScope>,
        cancel: &CancellationToken,
    ) -> Result<Value, ResolveError> {
        let injected = self
            .services
            .iter()
            .map(|name| {
                services
                    .get_service(name)
                    .ok_or_else(|| ResolveError::MissingService {
                        service: name.clone(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let key_count = keys.len();
        let input = BulkInput {
            keys,
            services: InjectedServices(injected),
        };
        let failed = |error: tower::BoxError| ResolveError::BulkLoader {
            name: self.name.clone(),
            reason: error.to_string(),
        };
        let pairs = match &self.loader {
            BulkLoader::Sync(loader) => loader(input).map_err(failed)?,
            BulkLoader::Async(loader) => {
                let _permits = match limits {
                    Some(limits) => Some(limits.acquire(&self.site, &self.services).await?),
                    None => None,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                    result = loader(input) => result.map_err(failed)?,
                }
            }
        };
        tracing::debug!(
            name = %self.name,
            asynchronous = self.is_async(),
            keys = key_count,
            loaded = pairs.len(),
            "bulk loader completed"
        );

        let mut loaded = RecordBuilder::synthesized();
        for (key, value) in pairs {
            if let Some(key) = key.key_string() {
                loaded.push(key, None, value);
            }
        }
        Ok(Value::Record(loaded.build()))
    }
}

/// `orders.customer:Order.customer`: the dotted path of the field, then its coordinate.
pub(crate) fn registration_name(path: &Path, field: &FieldDefinition) -> String {
    format!("{}:{}", path.dotted(), field.coordinate())
}

fn collect_rows(value: &Value, collection: bool, steps: &[Step], rows: &mut Vec<Value>) {
    match value {
        Value::List(items) if collection => items
            .iter()
            .for_each(|item| collect_rows(item, item.as_list().is_some(), steps, rows)),
        Value::Record(record) => match steps.split_first() {
            None => rows.push(value.clone()),
            Some((step, rest)) => {
                if let Some(next) = record.get(&step.name) {
                    collect_rows(next, step.collection, rest, rows);
                }
            }
        },
        _ => {}
    }
}

/// Runs every registration against the materialized value.
///
/// Loaders run concurrently; each one runs exactly once, even when no row has a key.
pub(crate) async fn resolve_all(
    registrations: &[Registration],
    materialized: &Value,
    services: &dyn ServiceProvider,
    limits: Option<&LimitScope>,
    cancel: &CancellationToken,
) -> Result<IndexMap<String, Value>, ResolveError> {
    let loads = registrations.iter().map(|registration| async move {
        let rows = registration.rows(materialized);
        let keys = registration.keys(rows).await?;
        let loaded = registration.load(keys, services, limits, cancel).await?;
        Ok::<_, ResolveError>((registration.name.clone(), loaded))
    });
    Ok(future::try_join_all(loads).await?.into_iter().collect())
}

/// Loads one row at a time when no batch was prepared for the field.
pub(crate) fn per_row_call(
    field: &FieldDefinition,
    bulk: &BulkResolverDefinition,
    key: Expr,
) -> Expr {
    let resolver = match bulk.loader.clone() {
        BulkLoader::Sync(loader) => Resolver::sync(move |input: CallInput| {
            let (key, input) = single_key(input);
            Ok(pick(loader(input)?, &key))
        }),
        BulkLoader::Async(loader) => Resolver::future(move |input: CallInput| {
            let (key, input) = single_key(input);
            let loading = loader(input);
            async move { Ok::<_, tower::BoxError>(pick(loading.await?, &key)) }
        }),
    };
    Expr::Call(Call {
        site: CallSite {
            coordinate: field.coordinate(),
            max_concurrency: field.max_concurrency,
        },
        services: bulk.services.clone(),
        args: vec![key],
        resolver,
    })
}

fn single_key(input: CallInput) -> (Value, BulkInput) {
    let key = input.args.into_iter().next().unwrap_or_default();
    let keys = if key.is_null() {
        Vec::new()
    } else {
        vec![key.clone()]
    };
    (
        key,
        BulkInput {
            keys,
            services: input.services,
        },
    )
}

fn pick(pairs: Vec<(Value, Value)>, key: &Value) -> Value {
    let Some(wanted) = key.key_string() else {
        return Value::Null;
    };
    pairs
        .into_iter()
        .find(|(candidate, _)| candidate.key_string().as_deref() == Some(wanted.as_str()))
        .map(|(_, value)| value)
        .unwrap_or_default()
}
