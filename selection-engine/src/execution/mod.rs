//! Executes statements: compiles every root field, runs the phases and completes the
//! response.

pub(crate) mod completion;
mod provider;
mod services;

use std::sync::Arc;

use futures::StreamExt;
use futures::future;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

pub use self::provider::InMemoryProvider;
pub use self::provider::ProviderRequest;
pub use self::provider::ProviderResponse;
pub use self::provider::QueryProvider;
pub use self::services::RootContextFactory;
pub use self::services::ServiceCollection;
pub use self::services::ServiceProvider;
use crate::compiler::CompileContext;
use crate::compiler::Compiler;
use crate::compiler::MaterializedShape;
use crate::compiler::bulk;
use crate::compiler::rebind::Rebound;
use crate::compiler::rebind::rebind;
use crate::configuration::ExecutionOptions;
use crate::error::CompileError;
use crate::error::ExecutionError;
use crate::error::ResolveError;
use crate::flatten::flatten;
use crate::graphql::Error;
use crate::graphql::Response;
use crate::graphql::ResponseStream;
use crate::ir::Bindings;
use crate::ir::Env;
use crate::ir::Expr;
use crate::ir::evaluate;
use crate::json_ext::Object;
use crate::json_ext::Path;
use crate::limiter::ConcurrencyLimiterRegistry;
use crate::limiter::ExecutionId;
use crate::limiter::LimitScope;
use crate::spec::DirectiveEvaluator;
use crate::spec::Document;
use crate::spec::FieldType;
use crate::spec::IncludeSkip;
use crate::spec::NodeKind;
use crate::spec::OperationKind;
use crate::spec::OperationOutcome;
use crate::spec::ResolverInput;
use crate::spec::RootOperation;
use crate::spec::Schema;
use crate::spec::SelectionNode;
use crate::spec::Statement;
use crate::spec::TYPENAME;
use crate::spec::Variables;
use crate::spec::coerce_variables;
use crate::spec::realize_for_type;
use crate::value::RecordBuilder;
use crate::value::Value;

pub(crate) const EXECUTE_SPAN_NAME: &str = "execute";
pub(crate) const PHASE_ONE_SPAN_NAME: &str = "phase_one";
pub(crate) const BULK_SPAN_NAME: &str = "bulk_load";
pub(crate) const PHASE_TWO_SPAN_NAME: &str = "phase_two";
pub(crate) const FLATTEN_SPAN_NAME: &str = "flatten";

/// Runs statements against a schema.
///
/// An executor is cheap to clone. The limiter registry is shared by every clone so that
/// `service` limits hold across executions.
#[derive(Clone)]
pub struct Executor {
    schema: Arc<Schema>,
    provider: Arc<dyn QueryProvider>,
    services: Arc<dyn ServiceProvider>,
    directives: Arc<dyn DirectiveEvaluator>,
    limiter: Arc<ConcurrencyLimiterRegistry>,
    root_factory: Option<Arc<dyn RootContextFactory>>,
}

#[buildstructor::buildstructor]
impl Executor {
    /// Returns a builder for an [`Executor`].
    ///
    /// Only the schema is required. The provider defaults to [`InMemoryProvider`], services
    /// to an empty [`ServiceCollection`] and directives to [`IncludeSkip`].
    #[builder(visibility = "pub")]
    fn new(
        schema: Arc<Schema>,
        provider: Option<Arc<dyn QueryProvider>>,
        services: Option<Arc<dyn ServiceProvider>>,
        directives: Option<Arc<dyn DirectiveEvaluator>>,
        limiter: Option<Arc<ConcurrencyLimiterRegistry>>,
        root_factory: Option<Arc<dyn RootContextFactory>>,
    ) -> Self {
        Executor {
            schema,
            provider: provider.unwrap_or_else(|| Arc::new(InMemoryProvider)),
            services: services.unwrap_or_else(|| Arc::new(ServiceCollection::new())),
            directives: directives.unwrap_or_else(|| Arc::new(IncludeSkip)),
            limiter: limiter.unwrap_or_default(),
            root_factory,
        }
    }
}

/// One execution of a document.
#[derive(Clone, Debug)]
pub struct ExecutionRequest {
    pub document: Arc<Document>,
    pub operation_name: Option<String>,
    /// Raw variables, coerced against the statement's variable definitions.
    pub variables: Object,
    /// The root context.
    pub root: Value,
    pub options: ExecutionOptions,
}

#[buildstructor::buildstructor]
impl ExecutionRequest {
    #[builder(visibility = "pub")]
    fn new(
        document: Arc<Document>,
        operation_name: Option<String>,
        variables: Option<Object>,
        root: Option<Value>,
        options: Option<ExecutionOptions>,
    ) -> Self {
        ExecutionRequest {
            document,
            operation_name,
            variables: variables.unwrap_or_default(),
            root: root.unwrap_or_default(),
            options: options.unwrap_or_default(),
        }
    }
}

/// Clears the request scoped limiter entries of an execution once it is over.
struct ExecutionGuard {
    registry: Arc<ConcurrencyLimiterRegistry>,
    execution: ExecutionId,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        self.registry.clear_execution(self.execution);
    }
}

/// Everything one execution of a statement reads.
struct Run {
    document: Arc<Document>,
    statement: Statement,
    variables: Variables,
    options: ExecutionOptions,
    root: Value,
    limits: LimitScope,
    cancel: CancellationToken,
    _guard: ExecutionGuard,
}

/// What every event of a subscription starts a new run from.
struct EventTemplate {
    document: Arc<Document>,
    statement: Statement,
    variables: Variables,
    options: ExecutionOptions,
    root: Value,
}

/// A field value with the errors raised while resolving it.
type Resolved = (Value, Vec<Error>);

/// A root field after its phases were prepared.
enum Prepared {
    Done(Resolved),
    Compiled {
        expr: Expr,
        ctx: CompileContext,
        root: Value,
        bulk: IndexMap<String, Value>,
        errors: Vec<Error>,
    },
}

impl Executor {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiterRegistry> {
        &self.limiter
    }

    /// Executes a query or mutation.
    ///
    /// Query root fields are resolved concurrently, mutation root fields one after the
    /// other. Field errors are reported in the response; compile errors and cancellation
    /// fail the whole execution.
    pub async fn execute(&self, request: ExecutionRequest) -> Result<Response, ExecutionError> {
        let span = tracing::info_span!(
            EXECUTE_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            "graphql.operation.name" = request.operation_name.as_deref().unwrap_or_default()
        );
        async move {
            let run = self.prepare(request)?;
            let kind = run.statement.operation_kind;
            if !matches!(kind, OperationKind::Query | OperationKind::Mutation) {
                return Err(ExecutionError::UnsupportedOperation {
                    reason: "subscriptions are served by `subscribe`".to_string(),
                });
            }
            let compiler = self.compiler(&run);
            let root_type = self.root_type(kind)?;
            let roots = self.roots(&run, &compiler, root_type)?;

            let resolved = if kind == OperationKind::Mutation {
                let mut resolved = Vec::with_capacity(roots.len());
                for node in &roots {
                    resolved.push(self.resolve_root(&run, &compiler, node, root_type).await?);
                }
                resolved
            } else {
                future::join_all(
                    roots
                        .iter()
                        .map(|node| self.resolve_root(&run, &compiler, node, root_type)),
                )
                .await
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?
            };
            if run.cancel.is_cancelled() {
                return Err(ExecutionError::Cancelled);
            }
            Ok(response(&roots, resolved, root_type))
        }
        .instrument(span)
        .await
    }

    /// Starts a subscription.
    ///
    /// Every event of the subscription resolver is resolved like a query result, with a
    /// fresh root context per event when a [`RootContextFactory`] is configured. The stream
    /// ends with the resolver's stream or when the execution is cancelled.
    pub async fn subscribe(
        &self,
        request: ExecutionRequest,
    ) -> Result<ResponseStream, ExecutionError> {
        let run = self.prepare(request)?;
        if run.statement.operation_kind != OperationKind::Subscription {
            return Err(ExecutionError::UnsupportedOperation {
                reason: "only subscriptions can be subscribed to".to_string(),
            });
        }
        let compiler = self.compiler(&run);
        let root_type = self.root_type(OperationKind::Subscription)?.to_string();
        let roots = self.roots(&run, &compiler, &root_type)?;
        let [node] = roots.as_slice() else {
            return Err(ExecutionError::UnsupportedOperation {
                reason: "a subscription selects exactly one root field".to_string(),
            });
        };
        let (NodeKind::SubscriptionField, Some(field)) = (&node.kind, &node.field) else {
            return Err(ExecutionError::UnsupportedOperation {
                reason: format!("'{}' is not a subscription field", node.name),
            });
        };
        let Some(RootOperation::Subscription(subscriber)) = &field.operation else {
            return Err(ExecutionError::UnsupportedOperation {
                reason: format!("'{}' has no subscription resolver", field.coordinate()),
            });
        };

        let path = Path::from_slice(&[node.name.as_str()]);
        let arguments = compiler.arguments(node, field, &path)?;
        let input = ResolverInput::new(
            arguments,
            run.root.clone(),
            self.injected(&field.services)?,
        );
        let events = subscriber(input).map_err(|error| ExecutionError::Internal {
            reason: format!("subscription '{}' failed: {error}", field.coordinate()),
        })?;
        tracing::debug!(field = %field.coordinate(), "subscription started");

        let executor = self.clone();
        let node = node.clone();
        let cancel = run.cancel.clone();
        let template = Arc::new(EventTemplate {
            document: run.document.clone(),
            statement: run.statement.clone(),
            variables: run.variables.clone(),
            options: run.options.clone(),
            root: run.root.clone(),
        });
        let stream = events
            .then(move |event| {
                let executor = executor.clone();
                let node = node.clone();
                let template = template.clone();
                let root_type = root_type.clone();
                async move {
                    let root = match &executor.root_factory {
                        Some(factory) => factory.create(),
                        None => template.root.clone(),
                    };
                    let run = executor.start(
                        template.document.clone(),
                        template.statement.clone(),
                        template.variables.clone(),
                        template.options.clone(),
                        root,
                    );
                    executor
                        .subscription_event(&run, &node, &root_type, event)
                        .instrument(tracing::info_span!(
                            EXECUTE_SPAN_NAME,
                            "otel.kind" = "INTERNAL",
                            "graphql.subscription.event" = true
                        ))
                        .await
                }
            })
            .take_until(cancel.cancelled_owned());
        Ok(Box::pin(stream))
    }

    async fn subscription_event(
        &self,
        run: &Run,
        node: &SelectionNode,
        root_type: &str,
        event: Result<OperationOutcome, tower::BoxError>,
    ) -> Response {
        let path = Path::from_slice(&[node.name.as_str()]);
        let resolved = match event {
            Ok(outcome) => {
                let compiler = self.compiler(run);
                match self.resolve_outcome(run, &compiler, node, outcome).await {
                    Ok(resolved) => resolved,
                    Err(error) => return error.to_response(),
                }
            }
            Err(error) => (
                Value::Null,
                vec![resolver_error(node, error).to_graphql_error(Some(path))],
            ),
        };
        response(std::slice::from_ref(node), vec![resolved], root_type)
    }

    fn prepare(&self, request: ExecutionRequest) -> Result<Run, ExecutionError> {
        let ExecutionRequest {
            document,
            operation_name,
            variables,
            root,
            options,
        } = request;
        if options.cancellation.is_cancelled() {
            return Err(ExecutionError::Cancelled);
        }
        let statement = document.operation(operation_name.as_deref())?.clone();
        let variables = coerce_variables(&statement, &variables, &self.schema)?;
        Ok(self.start(document, statement, variables, options, root))
    }

    fn start(
        &self,
        document: Arc<Document>,
        statement: Statement,
        variables: Variables,
        options: ExecutionOptions,
        root: Value,
    ) -> Run {
        let execution = ExecutionId::new();
        Run {
            limits: LimitScope::new(self.limiter.clone(), execution, &options),
            cancel: options.cancellation.clone(),
            _guard: ExecutionGuard {
                registry: self.limiter.clone(),
                execution,
            },
            document,
            statement,
            variables,
            options,
            root,
        }
    }

    fn compiler<'a>(&'a self, run: &'a Run) -> Compiler<'a> {
        Compiler {
            schema: &self.schema,
            fragments: &run.document.fragments,
            variables: &run.variables,
            directives: self.directives.as_ref(),
        }
    }

    fn root_type(&self, kind: OperationKind) -> Result<&str, ExecutionError> {
        self.schema
            .root_type(kind)
            .ok_or_else(|| ExecutionError::UnsupportedOperation {
                reason: format!("the schema has no root type for {kind:?}"),
            })
    }

    /// The realized root fields that directives keep.
    fn roots(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        root_type: &str,
    ) -> Result<Vec<SelectionNode>, CompileError> {
        let expanded = SelectionNode::inline_fragment(None)
            .children(run.statement.root_selections.clone())
            .expand(compiler.fragments, false)?;
        let mut roots = Vec::new();
        for node in realize_for_type(&expanded, root_type, &self.schema) {
            let path = Path::from_slice(&[node.name.as_str()]);
            if compiler
                .directives
                .keep(&node.directives, compiler.variables, &path)?
            {
                roots.push(node);
                continue;
            }
            if node
                .field
                .as_ref()
                .map(|field| field.ty.is_non_null())
                .unwrap_or(false)
            {
                return Err(CompileError::PrunedNonNullRoot {
                    field: node.name.clone(),
                });
            }
            tracing::debug!(field = %node.name, "root field removed by a directive");
        }
        Ok(roots)
    }

    async fn resolve_root(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        node: &SelectionNode,
        root_type: &str,
    ) -> Result<Resolved, ExecutionError> {
        match &node.kind {
            NodeKind::Extracted(extracted) if extracted.name == TYPENAME => {
                Ok((Value::from(root_type), Vec::new()))
            }
            NodeKind::Extracted(extracted) => {
                let expr = extracted.expr.substitute_parent(&Expr::root());
                let value = evaluate(&expr, &Env::new(Bindings::new(run.root.clone())))
                    .map_err(ExecutionError::from)?;
                Ok((value, Vec::new()))
            }
            NodeKind::MutationField => self.resolve_mutation(run, compiler, node).await,
            NodeKind::SubscriptionField => Err(ExecutionError::UnsupportedOperation {
                reason: format!("'{}' can only be subscribed to", node.name),
            }),
            _ => {
                self.resolve_node(run, compiler, node, run.root.clone(), Vec::new())
                    .await
            }
        }
    }

    async fn resolve_mutation(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        node: &SelectionNode,
    ) -> Result<Resolved, ExecutionError> {
        let path = Path::from_slice(&[node.name.as_str()]);
        let Some(field) = &node.field else {
            return Err(CompileError::Unsupported {
                reason: "mutation selection has no field definition".to_string(),
                path,
            }
            .into());
        };
        let Some(RootOperation::Mutation(resolver)) = &field.operation else {
            return Err(ExecutionError::UnsupportedOperation {
                reason: format!("'{}' has no mutation resolver", field.coordinate()),
            });
        };
        let arguments = compiler.arguments(node, field, &path)?;
        let services = match self.injected(&field.services) {
            Ok(services) => services,
            Err(error) => return field_error(error, path),
        };
        let input = ResolverInput::new(arguments, run.root.clone(), services);
        let outcome = tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(ExecutionError::Cancelled),
            outcome = resolver(input) => outcome,
        };
        match outcome {
            Ok(outcome) => self.resolve_outcome(run, compiler, node, outcome).await,
            Err(error) => field_error(resolver_error(node, error), path),
        }
    }

    /// Resolves the selection of a mutation or subscription field over its outcome.
    async fn resolve_outcome(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        node: &SelectionNode,
        outcome: OperationOutcome,
    ) -> Result<Resolved, ExecutionError> {
        match rebind(&self.schema, node, outcome)? {
            Rebound::Value(value) if value.is_resolved() => Ok((value, Vec::new())),
            Rebound::Value(value) => {
                let path = Path::from_slice(&[node.name.as_str()]);
                Ok(flatten(value, path, run.cancel.clone()).await?)
            }
            Rebound::Node { node, constants } => {
                self.resolve_node(run, compiler, &node, run.root.clone(), constants)
                    .await
            }
        }
    }

    /// Compiles, evaluates and flattens one root field.
    async fn resolve_node(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        node: &SelectionNode,
        root: Value,
        constants: Vec<Value>,
    ) -> Result<Resolved, ExecutionError> {
        let path = Path::from_slice(&[node.name.as_str()]);
        let split = run.options.phase_splitting
            && !node.field_requires_services()
            && node.has_services_at_or_below(compiler.fragments)?;

        let prepared = if split {
            self.two_phases(run, compiler, node, root.clone(), constants.clone(), &path)
                .await?
        } else {
            None
        };
        let (expr, ctx, root, bulk, mut errors) = match prepared {
            Some(Prepared::Done(resolved)) => return Ok(resolved),
            Some(Prepared::Compiled {
                expr,
                ctx,
                root,
                bulk,
                errors,
            }) => (expr, ctx, root, bulk, errors),
            None => {
                let mut ctx = CompileContext::new(constants);
                let expr = compiler
                    .compile_root(node, &mut ctx, false, None, false)?
                    .ok_or_else(|| CompileError::Unsupported {
                        reason: "root field compiled to nothing".to_string(),
                        path: path.clone(),
                    })?;
                (expr, ctx, root, IndexMap::new(), Vec::new())
            }
        };

        let expr = run.options.apply_hooks(expr);
        let mut bindings = Bindings::new(root)
            .constants(ctx.constants)
            .bulk(bulk)
            .limits(Some(run.limits.clone()))
            .cancellation(run.cancel.clone());
        for name in &ctx.services {
            match self.services.get_service(name) {
                Some(service) => bindings = bindings.service(name.clone(), service),
                None => {
                    return field_error(
                        ResolveError::MissingService {
                            service: name.clone(),
                        },
                        path,
                    );
                }
            }
        }
        let value = match evaluate(&expr, &Env::new(bindings)) {
            Ok(value) => value,
            Err(ResolveError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(error) => {
                failfast_debug!("evaluation of '{}' failed: {}", path, error);
                errors.push(error.to_graphql_error(Some(path)));
                return Ok((Value::Null, errors));
            }
        };
        if !ctx.has_async && value.is_resolved() {
            return Ok((value, errors));
        }
        let (value, flatten_errors) = flatten(value, path.clone(), run.cancel.clone())
            .instrument(tracing::info_span!(
                FLATTEN_SPAN_NAME,
                "otel.kind" = "INTERNAL",
                "graphql.field.path" = %path
            ))
            .await?;
        errors.extend(flatten_errors);
        Ok((value, errors))
    }

    /// Runs phase one and the bulk loads, then compiles phase two.
    ///
    /// `None` when phase one selects nothing and the field is compiled in a single phase.
    async fn two_phases(
        &self,
        run: &Run,
        compiler: &Compiler<'_>,
        node: &SelectionNode,
        root: Value,
        constants: Vec<Value>,
        path: &Path,
    ) -> Result<Option<Prepared>, ExecutionError> {
        let mut first = CompileContext::new(constants);
        let Some(phase_one) = compiler.compile_root(node, &mut first, true, None, false)? else {
            tracing::debug!(field = %path, "phase one is empty, compiling a single phase");
            return Ok(None);
        };

        let request = ProviderRequest {
            operation: run.options.apply_hooks(phase_one),
            root,
            constants: first.constants.clone(),
            limits: Some(run.limits.clone()),
            cancel: run.cancel.clone(),
            path: path.clone(),
        };
        let materialized = self
            .provider
            .execute(request)
            .instrument(tracing::info_span!(
                PHASE_ONE_SPAN_NAME,
                "otel.kind" = "INTERNAL",
                "graphql.field.path" = %path
            ))
            .await;
        let (data, mut errors) = match materialized {
            Ok(response) => (response.data, response.errors),
            Err(ResolveError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(error) => {
                let error = error.to_graphql_error(Some(path.clone()));
                return Ok(Some(Prepared::Done((Value::Null, vec![error]))));
            }
        };
        if data.is_null() {
            tracing::debug!(field = %path, "phase one returned null, skipping phase two");
            return Ok(Some(Prepared::Done((Value::Null, errors))));
        }

        let loaded = bulk::resolve_all(
            &first.registrations,
            &data,
            self.services.as_ref(),
            Some(&run.limits),
            &run.cancel,
        )
        .instrument(tracing::info_span!(
            BULK_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            "graphql.field.path" = %path,
            "bulk.registrations" = first.registrations.len()
        ))
        .await;
        let loaded = match loaded {
            Ok(loaded) => loaded,
            Err(ResolveError::Cancelled) => return Err(ExecutionError::Cancelled),
            Err(error) => {
                errors.push(error.to_graphql_error(Some(path.clone())));
                return Ok(Some(Prepared::Done((Value::Null, errors))));
            }
        };

        let span = tracing::info_span!(
            PHASE_TWO_SPAN_NAME,
            "otel.kind" = "INTERNAL",
            "graphql.field.path" = %path
        );
        let _entered = span.enter();
        let shape = MaterializedShape::of(&data);
        let mut second =
            CompileContext::new(first.constants).with_loaded(loaded.keys().cloned());
        let expr = compiler
            .compile_root(node, &mut second, false, Some(&shape), true)?
            .ok_or_else(|| CompileError::Unsupported {
                reason: "phase two compiled to nothing".to_string(),
                path: path.clone(),
            })?;
        Ok(Some(Prepared::Compiled {
            expr,
            ctx: second,
            root: data,
            bulk: loaded,
            errors,
        }))
    }

    fn injected(
        &self,
        names: &[String],
    ) -> Result<IndexMap<String, Arc<dyn std::any::Any + Send + Sync>>, ResolveError> {
        names
            .iter()
            .map(|name| {
                self.services
                    .get_service(name)
                    .map(|service| (name.clone(), service))
                    .ok_or_else(|| ResolveError::MissingService {
                        service: name.clone(),
                    })
            })
            .collect()
    }
}

fn resolver_error(node: &SelectionNode, error: tower::BoxError) -> ResolveError {
    ResolveError::Resolver {
        field: node
            .field
            .as_ref()
            .map(|field| field.coordinate())
            .unwrap_or_else(|| node.name.clone()),
        reason: error.to_string(),
    }
}

fn field_error(error: ResolveError, path: Path) -> Result<Resolved, ExecutionError> {
    failfast_debug!("field '{}' failed: {}", path, error);
    Ok((Value::Null, vec![error.to_graphql_error(Some(path))]))
}

/// Completes every root value against its declared type and assembles the response.
///
/// A non-null root that ends up null nulls the whole data.
fn response(roots: &[SelectionNode], resolved: Vec<Resolved>, root_type: &str) -> Response {
    let mut data = RecordBuilder::synthesized();
    let mut errors = Vec::new();
    let mut nulled = false;
    for (node, (value, field_errors)) in roots.iter().zip(resolved) {
        errors.extend(field_errors);
        let ty = node
            .field
            .as_ref()
            .map(|field| field.ty.clone())
            .unwrap_or(FieldType::String);
        let path = Path::from_slice(&[node.name.as_str()]);
        match completion::complete(value, &ty, root_type, &path, &mut errors) {
            Ok(value) => data.push(node.name.clone(), None, value),
            Err(completion::Nulled) => nulled = true,
        }
    }
    let data = if nulled {
        Value::Null
    } else {
        Value::Record(data.build())
    };
    Response::builder().data(data).errors(errors).build()
}
