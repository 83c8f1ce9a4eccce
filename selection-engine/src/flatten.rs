//! Turns an evaluated value with pending parts into a fully resolved value.
//!
//! Resolution failures are local: the failing value becomes null and an error is recorded
//! at its path. Only cancellation fails the whole flattening.

use futures::FutureExt;
use futures::StreamExt;
use futures::future;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use crate::error::ResolveError;
use crate::graphql::Error;
use crate::json_ext::Path;
use crate::value::Origin;
use crate::value::PendingStream;
use crate::value::Record;
use crate::value::RecordBuilder;
use crate::value::Value;

pub(crate) type Flattened = (Value, Vec<Error>);

pub(crate) fn flatten(
    value: Value,
    path: Path,
    cancel: CancellationToken,
) -> BoxFuture<'static, Result<Flattened, ResolveError>> {
    async move {
        if value.is_resolved() {
            return Ok((value, Vec::new()));
        }
        match value {
            Value::Pending(pending) => {
                let resolved = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
                    resolved = pending.resolve() => resolved,
                };
                match resolved {
                    Ok(value) => flatten(value, path, cancel).await,
                    Err(ResolveError::Cancelled) => Err(ResolveError::Cancelled),
                    Err(error) => {
                        failfast_debug!("value at '{}' failed to resolve: {}", path, error);
                        Ok((Value::Null, vec![error.to_graphql_error(Some(path))]))
                    }
                }
            }
            Value::Stream(stream) => drain(stream, path, cancel).await,
            Value::List(items) => {
                let flattened = future::try_join_all(
                    items
                        .into_iter()
                        .enumerate()
                        .map(|(index, item)| flatten(item, path.with_index(index), cancel.clone())),
                )
                .await?;
                let mut errors = Vec::new();
                let items = flattened
                    .into_iter()
                    .map(|(item, item_errors)| {
                        errors.extend(item_errors);
                        item
                    })
                    .collect();
                Ok((Value::List(items), errors))
            }
            Value::Record(record) => flatten_record(record, path, cancel).await,
            value => Ok((value, Vec::new())),
        }
    }
    .boxed()
}

async fn flatten_record(
    record: Record,
    path: Path,
    cancel: CancellationToken,
) -> Result<Flattened, ResolveError> {
    let flattened = future::try_join_all(
        record
            .iter()
            .map(|(name, value)| flatten(value.clone(), path.with_key(name), cancel.clone())),
    )
    .await?;
    let mut errors = Vec::new();
    let values: Vec<Value> = flattened
        .into_iter()
        .map(|(value, member_errors)| {
            errors.extend(member_errors);
            value
        })
        .collect();

    let record = match record.origin() {
        Origin::External => record.with_values(values),
        Origin::Synthesized => {
            // Member tags follow the resolved values.
            let mut builder =
                RecordBuilder::synthesized().maybe_type_name(record.type_name_bytes().cloned());
            for ((member, _), value) in record.members().zip(values) {
                builder.push(member.name.clone(), member.declared.clone(), value);
            }
            builder.build()
        }
    };
    Ok((Value::Record(record), errors))
}

/// Drains a stream into a list, keeping the order items were produced in.
async fn drain(
    stream: PendingStream,
    path: Path,
    cancel: CancellationToken,
) -> Result<Flattened, ResolveError> {
    let Some(mut stream) = stream.take() else {
        failfast_error!("stream at '{}' was already consumed", path);
        let error = ResolveError::evaluation("the stream was already consumed");
        return Ok((Value::Null, vec![error.to_graphql_error(Some(path))]));
    };

    let mut items = Vec::new();
    let mut errors = Vec::new();
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Ok(item)) => {
                let (item, item_errors) =
                    flatten(item, path.with_index(items.len()), cancel.clone()).await?;
                errors.extend(item_errors);
                items.push(item);
            }
            Some(Err(ResolveError::Cancelled)) => return Err(ResolveError::Cancelled),
            Some(Err(error)) => {
                failfast_debug!("stream at '{}' failed: {}", path, error);
                errors.push(error.to_graphql_error(Some(path)));
                return Ok((Value::Null, errors));
            }
        }
    }
    Ok((Value::List(items), errors))
}
