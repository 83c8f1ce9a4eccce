use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use selection_engine::CompileError;
use selection_engine::ExecutionError;
use selection_engine::ExecutionOptions;
use selection_engine::ExecutionRequest;
use selection_engine::Executor;
use selection_engine::Response;
use selection_engine::Schema;
use selection_engine::Value;
use selection_engine::execution::RootContextFactory;
use selection_engine::execution::ServiceCollection;
use selection_engine::execution::ServiceProvider;
use selection_engine::ir::CallInput;
use selection_engine::ir::Expr;
use selection_engine::ir::Resolver;
use selection_engine::spec::ArgumentValue;
use selection_engine::spec::BulkInput;
use selection_engine::spec::BulkLoader;
use selection_engine::spec::Cardinality;
use selection_engine::spec::DerivedView;
use selection_engine::spec::Directive;
use selection_engine::spec::Document;
use selection_engine::spec::FieldBuilder;
use selection_engine::spec::FieldType;
use selection_engine::spec::MutationFn;
use selection_engine::spec::OperationOutcome;
use selection_engine::spec::ResolverInput;
use selection_engine::spec::RootOperation;
use selection_engine::spec::SelectionNode;
use selection_engine::spec::Statement;
use selection_engine::spec::SubscriptionFn;
use selection_engine::spec::SyncBulkFn;
use selection_engine::spec::TypeBuilder;
use serde_json_bytes::json;
use tokio_util::sync::CancellationToken;
use tower::BoxError;

/// Stands in for any injected service; resolvers only need it to be present.
struct Backend;

fn services(names: &[&str]) -> Arc<dyn ServiceProvider> {
    let collection = names
        .iter()
        .fold(ServiceCollection::new(), |collection, name| {
            collection.with_service(*name, Backend)
        });
    Arc::new(collection)
}

fn executor(schema: Schema, names: &[&str]) -> Executor {
    Executor::builder()
        .schema(Arc::new(schema))
        .services(services(names))
        .build()
}

fn query(selections: impl IntoIterator<Item = SelectionNode>) -> Arc<Document> {
    let statement = selections
        .into_iter()
        .fold(Statement::query(), |statement, node| statement.select(node));
    Arc::new(Document::new([statement]))
}

fn field(schema: &Schema, type_name: &str, name: &str) -> SelectionNode {
    SelectionNode::field(schema, type_name, name).unwrap()
}

async fn execute(
    executor: &Executor,
    document: Arc<Document>,
    root: serde_json_bytes::Value,
    options: ExecutionOptions,
) -> Response {
    executor
        .execute(
            ExecutionRequest::builder()
                .document(document)
                .root(Value::from(root))
                .options(options)
                .build(),
        )
        .await
        .unwrap()
}

/// Counts resolver calls and the largest number of calls in flight at once.
#[derive(Default)]
struct InFlight {
    calls: AtomicUsize,
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    async fn track(&self, delay: Duration) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// `Query.orders: [Order]` where `Order.customer` is bulk loaded by `customerId`.
fn orders_schema(loads: Arc<Mutex<Vec<usize>>>) -> Schema {
    let loader = BulkLoader::sync(move |input: BulkInput| {
        loads.lock().push(input.keys.len());
        input.services.get::<Backend>(0)?;
        Ok(input
            .keys
            .into_iter()
            .map(|key| {
                let id = key.as_i64().unwrap_or_default();
                (
                    key,
                    Value::from(json!({"id": id, "name": format!("customer {id}")})),
                )
            })
            .collect())
    });
    Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("orders", FieldType::named("Order").list()))
            .build())
        .ty(TypeBuilder::object("Order")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("customer", FieldType::named("Customer")).bulk(
                Expr::parent().member("customerId"),
                loader,
                ["customers"],
            ))
            .build())
        .ty(TypeBuilder::object("Customer")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build()
}

fn orders(count: usize) -> serde_json_bytes::Value {
    let orders: Vec<_> = (0..count)
        .map(|id| json!({"id": id, "customerId": id % 10}))
        .collect();
    json!({ "orders": orders })
}

fn orders_query(schema: &Schema) -> Arc<Document> {
    query([field(schema, "Query", "orders")
        .child(field(schema, "Order", "id"))
        .child(field(schema, "Order", "customer").child(field(schema, "Customer", "name")))])
}

/// `Query.items: [Item]` with a plain `label` service field and a slow async field.
fn items_schema(in_flight: Arc<InFlight>, slow_limit: Option<usize>) -> Schema {
    let label = Expr::call(
        Resolver::sync(|input: CallInput| {
            let name = input.arg(0).and_then(Value::as_str).unwrap_or_default();
            Ok(Value::from(format!("<{name}>")))
        }),
        ["labels"],
        vec![Expr::parent().member("name")],
    );
    let slow = Expr::call(
        Resolver::future(move |input: CallInput| {
            let in_flight = in_flight.clone();
            async move {
                in_flight.track(Duration::from_millis(10)).await;
                let id = input.arg(0).and_then(Value::as_i64).unwrap_or_default();
                Ok::<_, BoxError>(Value::from(format!("slow {id}")))
            }
        }),
        ["slow"],
        vec![Expr::parent().member("id")],
    );
    let mut slow_field = FieldBuilder::new("slowField", FieldType::String).resolve(slow);
    if let Some(limit) = slow_limit {
        slow_field = slow_field.max_concurrency(limit);
    }
    Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("items", FieldType::named("Item").list()))
            .field(FieldBuilder::new("count", FieldType::Int.non_null()))
            .field(FieldBuilder::new("total", FieldType::Int))
            .build())
        .ty(TypeBuilder::object("Item")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("name", FieldType::String))
            .field(FieldBuilder::new("total", FieldType::Int))
            .field(FieldBuilder::new("label", FieldType::String).resolve(label))
            .field(slow_field)
            .build())
        .build()
}

fn items(count: usize) -> serde_json_bytes::Value {
    let items: Vec<_> = (1..=count)
        .map(|id| json!({"id": id, "name": format!("item {id}"), "total": id * 100}))
        .collect();
    json!({ "items": items, "count": count, "total": count * 100 })
}

#[tokio::test]
async fn phase_splitting_does_not_change_results() {
    let schema = items_schema(Arc::default(), None);
    let plain = || query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "id"))
        .child(field(&schema, "Item", "name"))]);
    let with_services = || query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "id"))
        .child(field(&schema, "Item", "label"))
        .child(field(&schema, "Item", "slowField"))]);
    let executor = executor(items_schema(Arc::default(), None), &["labels", "slow"]);

    for document in [plain(), with_services()] {
        let split = execute(
            &executor,
            document.clone(),
            items(3),
            ExecutionOptions::default(),
        )
        .await;
        let single = execute(
            &executor,
            document,
            items(3),
            ExecutionOptions {
                phase_splitting: false,
                ..Default::default()
            },
        )
        .await;
        assert!(split.errors.is_empty(), "{:?}", split.errors);
        assert_eq!(split.data.to_json().unwrap(), single.data.to_json().unwrap());
        assert_eq!(split.errors, single.errors);
    }

    let loads = Arc::new(Mutex::new(Vec::new()));
    let schema = orders_schema(loads.clone());
    let document = orders_query(&schema);
    let executor = self::executor(schema, &["customers"]);
    let split = execute(
        &executor,
        document.clone(),
        orders(12),
        ExecutionOptions::default(),
    )
    .await;
    let single = execute(
        &executor,
        document,
        orders(12),
        ExecutionOptions {
            phase_splitting: false,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(split.data.to_json().unwrap(), single.data.to_json().unwrap());
    // one bulk load for the split execution, one single-key load per row otherwise
    assert_eq!(loads.lock().len(), 13);
}

#[tokio::test]
async fn bulk_loaders_run_once_per_execution() {
    for count in [0, 1, 1000] {
        let loads = Arc::new(Mutex::new(Vec::new()));
        let schema = orders_schema(loads.clone());
        let document = orders_query(&schema);
        let executor = executor(schema, &["customers"]);

        let response = execute(
            &executor,
            document,
            orders(count),
            ExecutionOptions::default(),
        )
        .await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(*loads.lock(), vec![count.min(10)], "{count} orders");

        let orders = response.field("orders").and_then(Value::as_list).unwrap();
        assert_eq!(orders.len(), count);
        if let Some(last) = orders.last() {
            let id = count - 1;
            assert_eq!(
                last.to_json().unwrap(),
                json!({"id": id, "customer": {"name": format!("customer {}", id % 10)}})
            );
        }
    }
}

#[tokio::test]
async fn service_fields_on_interfaces_cover_every_implementation() {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let recorded = loads.clone();
    let loader = BulkLoader::sync(move |input: BulkInput| {
        let keys: Vec<i64> = input.keys.iter().filter_map(Value::as_i64).collect();
        recorded.lock().push(keys);
        Ok(input
            .keys
            .into_iter()
            .map(|key| {
                let id = key.as_i64().unwrap_or_default();
                (key, Value::from(json!({"name": format!("owner {id}")})))
            })
            .collect())
    });
    let greeting = Expr::call(
        Resolver::sync(|input: CallInput| {
            let name = input.arg(0).and_then(Value::as_str).unwrap_or_default();
            Ok(Value::from(format!("hello {name}")))
        }),
        ["owners"],
        vec![Expr::parent().member("name")],
    );
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("pets", FieldType::named("Animal").list()))
            .build())
        .ty(TypeBuilder::interface("Animal")
            .field(FieldBuilder::new("name", FieldType::String))
            .field(FieldBuilder::new("greeting", FieldType::String).resolve(greeting))
            .field(FieldBuilder::new("owner", FieldType::named("Person")).bulk(
                Expr::parent().member("ownerId"),
                loader,
                ["owners"],
            ))
            .build())
        .ty(TypeBuilder::object("Dog")
            .implements("Animal")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .ty(TypeBuilder::object("Cat")
            .implements("Animal")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .ty(TypeBuilder::object("Person")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build();
    let document = query([field(&schema, "Query", "pets")
        .child(field(&schema, "Animal", "name"))
        .child(field(&schema, "Animal", "greeting"))
        .child(field(&schema, "Animal", "owner").child(field(&schema, "Person", "name")))]);
    let executor = executor(schema, &["owners"]);
    let pets = || {
        json!({"pets": [
            {"__typename": "Dog", "name": "Rex", "ownerId": 1},
            {"__typename": "Cat", "name": "Tom", "ownerId": 2},
        ]})
    };

    let split = execute(&executor, document.clone(), pets(), ExecutionOptions::default()).await;
    assert!(split.errors.is_empty(), "{:?}", split.errors);
    assert_eq!(*loads.lock(), vec![vec![1, 2]]);
    assert_eq!(
        split.data.to_json().unwrap(),
        json!({"pets": [
            {"name": "Rex", "greeting": "hello Rex", "owner": {"name": "owner 1"}},
            {"name": "Tom", "greeting": "hello Tom", "owner": {"name": "owner 2"}},
        ]})
    );

    let single = execute(
        &executor,
        document,
        pets(),
        ExecutionOptions {
            phase_splitting: false,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(split.data.to_json().unwrap(), single.data.to_json().unwrap());
}

#[tokio::test]
async fn aliased_service_fields_resolve_under_phase_splitting() {
    let schema = items_schema(Arc::default(), None);
    let document = query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "id"))
        .child(field(&schema, "Item", "label").alias("first"))
        .child(field(&schema, "Item", "label").alias("second"))]);
    let executor = executor(items_schema(Arc::default(), None), &["labels"]);

    let split = execute(&executor, document.clone(), items(2), ExecutionOptions::default()).await;
    assert!(split.errors.is_empty(), "{:?}", split.errors);
    assert_eq!(
        split.data.to_json().unwrap(),
        json!({"items": [
            {"id": 1, "first": "<item 1>", "second": "<item 1>"},
            {"id": 2, "first": "<item 2>", "second": "<item 2>"},
        ]})
    );

    let single = execute(
        &executor,
        document,
        items(2),
        ExecutionOptions {
            phase_splitting: false,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(split.data.to_json().unwrap(), single.data.to_json().unwrap());
}

#[tokio::test]
async fn field_limits_never_exceed_the_configured_one() {
    let in_flight = Arc::new(InFlight::default());
    let schema = items_schema(in_flight.clone(), Some(6));
    let document = query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "id"))
        .child(field(&schema, "Item", "slowField"))]);
    let executor = executor(schema, &["slow"]);
    let options = ExecutionOptions {
        field_concurrency: Some(2),
        ..Default::default()
    };

    let response = execute(&executor, document, items(10), options).await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(in_flight.calls(), 10);
    assert!(in_flight.max() <= 2, "observed {}", in_flight.max());
}

#[tokio::test]
async fn one_callback_can_back_several_loaders() {
    let loads = Arc::new(Mutex::new(Vec::new()));
    let recorded = loads.clone();
    let people: Arc<SyncBulkFn> = Arc::new(move |input: BulkInput| {
        recorded.lock().push(input.keys.len());
        Ok(input
            .keys
            .into_iter()
            .map(|key| {
                let id = key.as_i64().unwrap_or_default();
                (key, Value::from(json!({"name": format!("person {id}")})))
            })
            .collect())
    });
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("orders", FieldType::named("Order").list()))
            .build())
        .ty(TypeBuilder::object("Order")
            .field(FieldBuilder::new("buyer", FieldType::named("Person")).bulk(
                Expr::parent().member("buyerId"),
                BulkLoader::Sync(people.clone()),
                ["people"],
            ))
            .field(FieldBuilder::new("seller", FieldType::named("Person")).bulk(
                Expr::parent().member("sellerId"),
                BulkLoader::Sync(people),
                ["people"],
            ))
            .build())
        .ty(TypeBuilder::object("Person")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build();
    let document = query([field(&schema, "Query", "orders")
        .child(field(&schema, "Order", "buyer").child(field(&schema, "Person", "name")))
        .child(field(&schema, "Order", "seller").child(field(&schema, "Person", "name")))]);
    let executor = executor(schema, &["people"]);

    let response = execute(
        &executor,
        document,
        json!({"orders": [{"buyerId": 1, "sellerId": 2}, {"buyerId": 3, "sellerId": 2}]}),
        ExecutionOptions::default(),
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({"orders": [
            {"buyer": {"name": "person 1"}, "seller": {"name": "person 2"}},
            {"buyer": {"name": "person 3"}, "seller": {"name": "person 2"}},
        ]})
    );
    let mut loads = loads.lock().clone();
    loads.sort();
    assert_eq!(loads, vec![1, 2]);
}

#[test]
fn root_operation_callbacks_are_nameable() {
    let schema = Schema::builder()
        .mutation("Mutation")
        .subscription("Subscription")
        .ty(TypeBuilder::object("Query").build())
        .ty(TypeBuilder::object("Mutation")
            .field(FieldBuilder::new("touch", FieldType::Int).mutation(|_| async {
                Ok::<_, BoxError>(OperationOutcome::from(Value::from(1)))
            }))
            .build())
        .ty(TypeBuilder::object("Subscription")
            .field(FieldBuilder::new("ticks", FieldType::Int).subscription(|_| {
                Ok::<_, BoxError>(futures::stream::empty::<Result<OperationOutcome, BoxError>>())
            }))
            .build())
        .build();
    let operation = |type_name: &str, name: &str| {
        schema
            .field(type_name, name)
            .and_then(|field| field.operation.clone())
    };

    let Some(RootOperation::Mutation(touch)) = operation("Mutation", "touch") else {
        panic!("touch should be a mutation");
    };
    let _: Arc<MutationFn> = touch;
    let Some(RootOperation::Subscription(ticks)) = operation("Subscription", "ticks") else {
        panic!("ticks should be a subscription");
    };
    let _: Arc<SubscriptionFn> = ticks;
}

#[tokio::test]
async fn object_service_calls_are_shared_by_sibling_fields() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let profile = Expr::call(
        Resolver::sync(move |input: CallInput| {
            counter.fetch_add(1, Ordering::SeqCst);
            let id = input.arg(0).and_then(Value::as_i64).unwrap_or_default();
            Ok(Value::from(json!({
                "bio": format!("bio {id}"),
                "age": 30 + id,
                "city": "Lyon",
            })))
        }),
        ["profiles"],
        vec![Expr::parent().member("id")],
    );
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("users", FieldType::named("User").list()))
            .build())
        .ty(TypeBuilder::object("User")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("profile", FieldType::named("Profile")).resolve(profile))
            .build())
        .ty(TypeBuilder::object("Profile")
            .field(FieldBuilder::new("bio", FieldType::String))
            .field(FieldBuilder::new("age", FieldType::Int))
            .field(FieldBuilder::new("city", FieldType::String))
            .build())
        .build();
    let document = query([field(&schema, "Query", "users").child(
        field(&schema, "User", "profile")
            .child(field(&schema, "Profile", "bio"))
            .child(field(&schema, "Profile", "age"))
            .child(field(&schema, "Profile", "city")),
    )]);
    let executor = executor(schema, &["profiles"]);

    let response = execute(
        &executor,
        document,
        json!({"users": [{"id": 1}, {"id": 2}]}),
        ExecutionOptions::default(),
    )
    .await;
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({"users": [
            {"profile": {"bio": "bio 1", "age": 31, "city": "Lyon"}},
            {"profile": {"bio": "bio 2", "age": 32, "city": "Lyon"}},
        ]})
    );
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn the_smallest_concurrency_limit_binds() {
    // (field, service, query) limits and the limit expected to bind
    let scenarios = [
        (2, 3, 4, 2),
        (5, 3, 4, 3),
        (5, 6, 4, 4),
    ];
    for (field_limit, service_limit, query_limit, expected) in scenarios {
        let in_flight = Arc::new(InFlight::default());
        let schema = items_schema(in_flight.clone(), None);
        let document = query([field(&schema, "Query", "items")
            .child(field(&schema, "Item", "id"))
            .child(field(&schema, "Item", "slowField"))]);
        let executor = executor(schema, &["slow"]);
        let options = ExecutionOptions {
            field_concurrency: Some(field_limit),
            query_concurrency: Some(query_limit),
            service_concurrency: Arc::new(BTreeMap::from([("slow".to_string(), service_limit)])),
            ..Default::default()
        };

        let response = execute(&executor, document, items(12), options).await;
        assert!(response.errors.is_empty(), "{:?}", response.errors);
        assert_eq!(in_flight.calls(), 12);
        assert_eq!(
            in_flight.max(),
            expected,
            "field={field_limit} service={service_limit} query={query_limit}"
        );
    }
}

#[test_log::test(tokio::test)]
async fn slow_fields_respect_their_own_limit() {
    let in_flight = Arc::new(InFlight::default());
    let schema = items_schema(in_flight.clone(), Some(2));
    let document = query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "total"))
        .child(field(&schema, "Item", "slowField"))]);
    let executor = executor(schema, &["slow"]);

    let response = execute(&executor, document, items(10), ExecutionOptions::default()).await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(in_flight.calls(), 10);
    assert!(in_flight.max() <= 2, "observed {}", in_flight.max());

    let items = response.field("items").and_then(Value::as_list).unwrap();
    assert_eq!(items.len(), 10);
    assert_eq!(
        items[9].to_json().unwrap(),
        json!({"total": 1000, "slowField": "slow 10"})
    );
}

#[tokio::test]
async fn nested_async_values_are_fully_resolved_in_order() {
    let answer = Expr::call(
        Resolver::future(|_| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok::<_, BoxError>(Value::from(42))
        }),
        ["backend"],
        vec![],
    );
    // later rows finish first
    let score = Expr::call(
        Resolver::future(|input: CallInput| async move {
            let id = input.arg(0).and_then(Value::as_i64).unwrap_or_default();
            tokio::time::sleep(Duration::from_millis((4 - id as u64) * 5)).await;
            Ok::<_, BoxError>(Value::from(id * 10))
        }),
        ["backend"],
        vec![Expr::parent().member("id")],
    );
    let profile = Expr::call(
        Resolver::future(|input: CallInput| async move {
            let id = input.arg(0).and_then(Value::as_i64).unwrap_or_default();
            Ok::<_, BoxError>(Value::from(json!({"bio": format!("bio {id}")})))
        }),
        ["backend"],
        vec![Expr::parent().member("id")],
    );
    let badge = Expr::call(
        Resolver::future(|input: CallInput| async move {
            let bio = input.arg(0).and_then(Value::as_str).unwrap_or_default().to_string();
            Ok::<_, BoxError>(Value::from(format!("*{bio}*")))
        }),
        ["backend"],
        vec![Expr::parent().member("bio")],
    );
    let events = Expr::call(
        Resolver::stream(|_| {
            futures::stream::iter((1..=3).map(|tick| Ok::<_, BoxError>(Value::from(tick))))
        }),
        ["backend"],
        vec![],
    );
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("answer", FieldType::Int).resolve(answer))
            .field(FieldBuilder::new("users", FieldType::named("User").list()))
            .field(FieldBuilder::new("events", FieldType::Int.list()).resolve(events))
            .build())
        .ty(TypeBuilder::object("User")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("score", FieldType::Int).resolve(score))
            .field(FieldBuilder::new("profile", FieldType::named("Profile")).resolve(profile))
            .build())
        .ty(TypeBuilder::object("Profile")
            .field(FieldBuilder::new("bio", FieldType::String))
            .field(FieldBuilder::new("badge", FieldType::String).resolve(badge))
            .build())
        .build();
    let document = query([
        field(&schema, "Query", "answer"),
        field(&schema, "Query", "users")
            .child(field(&schema, "User", "id"))
            .child(field(&schema, "User", "score"))
            .child(field(&schema, "User", "profile").child(field(&schema, "Profile", "badge"))),
        field(&schema, "Query", "events"),
    ]);
    let executor = executor(schema, &["backend"]);

    let response = execute(
        &executor,
        document,
        json!({"users": [{"id": 1}, {"id": 2}, {"id": 3}]}),
        ExecutionOptions::default(),
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert!(response.data.is_resolved());
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({
            "answer": 42,
            "users": [
                {"id": 1, "score": 10, "profile": {"badge": "*bio 1*"}},
                {"id": 2, "score": 20, "profile": {"badge": "*bio 2*"}},
                {"id": 3, "score": 30, "profile": {"badge": "*bio 3*"}},
            ],
            "events": [1, 2, 3],
        })
    );
}

#[tokio::test]
async fn null_roots_skip_the_second_phase() {
    let in_flight = Arc::new(InFlight::default());
    let tracked = in_flight.clone();
    let score = Expr::call(
        Resolver::future(move |_| {
            let tracked = tracked.clone();
            async move {
                tracked.track(Duration::ZERO).await;
                Ok::<_, BoxError>(Value::from(1))
            }
        }),
        ["scores"],
        vec![Expr::parent().member("id")],
    );
    let loads = Arc::new(AtomicUsize::new(0));
    let counter = loads.clone();
    let friend = BulkLoader::sync(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Vec::new())
    });
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("me", FieldType::named("User")))
            .build())
        .ty(TypeBuilder::object("User")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("score", FieldType::Int).resolve(score))
            .field(FieldBuilder::new("friend", FieldType::named("User")).bulk(
                Expr::parent().member("friendId"),
                friend,
                ["scores"],
            ))
            .build())
        .build();
    let document = query([field(&schema, "Query", "me")
        .child(field(&schema, "User", "id"))
        .child(field(&schema, "User", "score"))
        .child(field(&schema, "User", "friend").child(field(&schema, "User", "id")))]);
    let executor = executor(schema, &["scores"]);

    let response = execute(
        &executor,
        document,
        json!({"me": null}),
        ExecutionOptions::default(),
    )
    .await;
    assert_eq!(response.data.to_json().unwrap(), json!({"me": null}));
    assert!(response.errors.is_empty());
    assert_eq!(in_flight.calls(), 0);
    assert_eq!(loads.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn subtype_branches_win_field_merges() {
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("pets", FieldType::named("Animal").list()))
            .build())
        .ty(TypeBuilder::interface("Animal")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .ty(TypeBuilder::object("Dog")
            .implements("Animal")
            .field(
                FieldBuilder::new("name", FieldType::String)
                    .resolve(Expr::parent().member("callName")),
            )
            .build())
        .ty(TypeBuilder::object("Cat")
            .implements("Animal")
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build();
    let document = query([field(&schema, "Query", "pets")
        .child(
            SelectionNode::inline_fragment(Some("Animal"))
                .child(field(&schema, "Animal", "name")),
        )
        .child(SelectionNode::inline_fragment(Some("Dog")).child(field(&schema, "Dog", "name")))]);
    let executor = executor(schema, &[]);

    let response = execute(
        &executor,
        document,
        json!({"pets": [
            {"__typename": "Dog", "name": "Rex", "callName": "Good boy Rex"},
            {"__typename": "Cat", "name": "Tom"},
        ]}),
        ExecutionOptions::default(),
    )
    .await;
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({"pets": [{"name": "Good boy Rex"}, {"name": "Tom"}]})
    );
}

#[tokio::test]
async fn missing_services_fail_the_root_field() {
    let schema = items_schema(Arc::default(), None);
    let document = query([
        field(&schema, "Query", "items")
            .child(field(&schema, "Item", "id"))
            .child(field(&schema, "Item", "label")),
        field(&schema, "Query", "total"),
    ]);
    let executor = executor(schema, &[]);

    let response = execute(&executor, document, items(2), ExecutionOptions::default()).await;
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({"items": null, "total": 200})
    );
    assert_eq!(response.errors.len(), 1);
    assert!(response.errors[0].message.contains("labels"));
}

#[tokio::test]
async fn directives_prune_root_fields() {
    let schema = items_schema(Arc::default(), None);
    let skipped = |name: &str| {
        field(&schema, "Query", name).directive(Directive::skip(ArgumentValue::Literal(
            Value::Bool(true),
        )))
    };
    let executor = executor(items_schema(Arc::default(), None), &[]);

    let response = execute(
        &executor,
        query([skipped("total"), field(&schema, "Query", "count")]),
        items(2),
        ExecutionOptions::default(),
    )
    .await;
    assert_eq!(response.data.to_json().unwrap(), json!({"count": 2}));

    let error = executor
        .execute(
            ExecutionRequest::builder()
                .document(query([skipped("count")]))
                .root(Value::from(items(2)))
                .build(),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        ExecutionError::Compile(CompileError::PrunedNonNullRoot { ref field }) if field == "count"
    ));
}

#[tokio::test]
async fn mutations_run_in_order_and_rebind_their_results() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let rename_log = log.clone();
    let archive_log = log.clone();
    let schema = Schema::builder()
        .query("Query")
        .mutation("Mutation")
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("items", FieldType::named("Item").list()))
            .build())
        .ty(TypeBuilder::object("Mutation")
            .field(
                FieldBuilder::new("renameItem", FieldType::named("Item"))
                    .argument("id", FieldType::Int.non_null())
                    .argument("name", FieldType::String.non_null())
                    .mutation(move |input: ResolverInput| {
                        let log = rename_log.clone();
                        async move {
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            log.lock().push("rename");
                            let id = input.argument("id").and_then(Value::as_i64);
                            let name = input.argument("name").and_then(Value::as_str);
                            Ok::<_, BoxError>(OperationOutcome::from(Value::from(
                                json!({"id": id, "name": name}),
                            )))
                        }
                    }),
            )
            .field(
                FieldBuilder::new("archived", FieldType::named("Item").list()).mutation(
                    move |_| {
                        let log = archive_log.clone();
                        async move {
                            log.lock().push("archive");
                            Ok::<_, BoxError>(OperationOutcome::from(DerivedView {
                                expr: Expr::root().member("items").filter(
                                    0,
                                    Expr::param(0).member("archived"),
                                ),
                                cardinality: Cardinality::Many,
                            }))
                        }
                    },
                ),
            )
            .build())
        .ty(TypeBuilder::object("Item")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build();
    let statement = Statement::mutation()
        .select(
            field(&schema, "Mutation", "renameItem")
                .argument("id", 1)
                .argument("name", "renamed")
                .child(field(&schema, "Item", "id"))
                .child(field(&schema, "Item", "name")),
        )
        .select(field(&schema, "Mutation", "archived").child(field(&schema, "Item", "name")));
    let executor = executor(schema, &[]);

    let response = execute(
        &executor,
        Arc::new(Document::new([statement])),
        json!({"items": [
            {"id": 1, "name": "one", "archived": false},
            {"id": 2, "name": "two", "archived": true},
        ]}),
        ExecutionOptions::default(),
    )
    .await;
    assert!(response.errors.is_empty(), "{:?}", response.errors);
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({
            "renameItem": {"id": 1, "name": "renamed"},
            "archived": [{"name": "two"}],
        })
    );
    assert_eq!(*log.lock(), vec!["rename", "archive"]);
}

#[tokio::test]
async fn subscription_events_get_a_fresh_root_context() {
    let schema = Schema::builder()
        .subscription("Subscription")
        .ty(TypeBuilder::object("Query").build())
        .ty(TypeBuilder::object("Subscription")
            .field(
                FieldBuilder::new("itemAdded", FieldType::named("Item")).subscription(|_| {
                    let events = (0..3).map(|_| {
                        Ok::<_, BoxError>(OperationOutcome::from(DerivedView {
                            expr: Expr::root().member("latest"),
                            cardinality: Cardinality::One,
                        }))
                    });
                    Ok::<_, BoxError>(futures::stream::iter(events))
                }),
            )
            .build())
        .ty(TypeBuilder::object("Item")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("name", FieldType::String))
            .build())
        .build();
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let factory: Arc<dyn RootContextFactory> = Arc::new(move || {
        let id = counter.fetch_add(1, Ordering::SeqCst) + 1;
        Value::from(json!({"latest": {"id": id, "name": format!("item {id}")}}))
    });
    let document = Arc::new(Document::new([Statement::subscription().select(
        field(&schema, "Subscription", "itemAdded")
            .child(field(&schema, "Item", "id"))
            .child(field(&schema, "Item", "name")),
    )]));
    let executor = Executor::builder()
        .schema(Arc::new(schema))
        .root_factory(factory)
        .build();

    let responses: Vec<Response> = executor
        .subscribe(ExecutionRequest::builder().document(document).build())
        .await
        .unwrap()
        .collect()
        .await;
    let data: Vec<_> = responses
        .iter()
        .map(|response| response.data.to_json().unwrap())
        .collect();
    assert_eq!(
        data,
        vec![
            json!({"itemAdded": {"id": 1, "name": "item 1"}}),
            json!({"itemAdded": {"id": 2, "name": "item 2"}}),
            json!({"itemAdded": {"id": 3, "name": "item 3"}}),
        ]
    );
    assert_eq!(created.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn cancelled_executions_fail() {
    let schema = items_schema(Arc::default(), None);
    let document = query([field(&schema, "Query", "items").child(field(&schema, "Item", "id"))]);
    let executor = executor(items_schema(Arc::default(), None), &[]);
    let cancellation = CancellationToken::new();
    cancellation.cancel();

    let error = executor
        .execute(
            ExecutionRequest::builder()
                .document(document)
                .root(Value::from(items(2)))
                .options(ExecutionOptions::default().with_cancellation(cancellation))
                .build(),
        )
        .await
        .unwrap_err();
    assert_eq!(error, ExecutionError::Cancelled);
}

#[test_log::test(tokio::test)]
async fn cancellation_stops_pending_resolvers() {
    let slow = Expr::call(
        Resolver::future(|_| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, BoxError>(Value::from("late"))
        }),
        ["slow"],
        vec![Expr::parent().member("id")],
    );
    let schema = Schema::builder()
        .ty(TypeBuilder::object("Query")
            .field(FieldBuilder::new("items", FieldType::named("Item").list()))
            .build())
        .ty(TypeBuilder::object("Item")
            .field(FieldBuilder::new("id", FieldType::Int.non_null()))
            .field(FieldBuilder::new("slowField", FieldType::String).resolve(slow))
            .build())
        .build();
    let document = query([field(&schema, "Query", "items")
        .child(field(&schema, "Item", "id"))
        .child(field(&schema, "Item", "slowField"))]);
    let executor = executor(schema, &["slow"]);
    let cancellation = CancellationToken::new();
    let canceller = cancellation.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        executor.execute(
            ExecutionRequest::builder()
                .document(document)
                .root(Value::from(items(3)))
                .options(ExecutionOptions::default().with_cancellation(cancellation))
                .build(),
        ),
    )
    .await
    .expect("the execution should stop once cancelled");
    assert_eq!(result.unwrap_err(), ExecutionError::Cancelled);
}

#[tokio::test]
async fn hooks_rewrite_the_final_operation() {
    let schema = items_schema(Arc::default(), None);
    let document = query([field(&schema, "Query", "items").child(field(&schema, "Item", "id"))]);
    let executor = executor(items_schema(Arc::default(), None), &[]);
    let options = ExecutionOptions::default().with_hook(|expr| expr.take(Expr::literal(2)));

    let response = execute(&executor, document, items(5), options).await;
    assert_eq!(
        response.data.to_json().unwrap(),
        json!({"items": [{"id": 1}, {"id": 2}]})
    );
}
