use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use futures::Stream;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::future::Shared;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use super::Value;
use crate::error::ResolveError;

type SharedResolution = Shared<BoxFuture<'static, Result<Value, ResolveError>>>;

/// An asynchronous value that is computed at most once.
///
/// Every clone observes the same resolution, so a pending service call can be read by
/// several projections without running twice. Nothing happens until the value is awaited.
#[derive(Clone)]
pub struct Pending(SharedResolution);

impl Pending {
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = Result<Value, ResolveError>> + Send + 'static,
    {
        Pending(future.boxed().shared())
    }

    pub fn ready(result: Result<Value, ResolveError>) -> Self {
        Pending::new(futures::future::ready(result))
    }

    /// Waits for the value, following pending values that resolve to other pending values.
    ///
    /// Values nested inside lists or records may still be pending.
    pub async fn resolve(&self) -> Result<Value, ResolveError> {
        let mut value = self.0.clone().await?;
        while let Value::Pending(next) = value {
            value = next.0.clone().await?;
        }
        Ok(value)
    }

    /// Chains a synchronous continuation onto this value.
    pub fn map<F>(&self, continuation: F) -> Pending
    where
        F: FnOnce(Value) -> Result<Value, ResolveError> + Send + 'static,
    {
        let source = self.clone();
        Pending::new(async move {
            let value = continuation(source.resolve().await?)?;
            match value {
                Value::Pending(next) => next.resolve().await,
                other => Ok(other),
            }
        })
    }

    pub fn ptr_eq(&self, other: &Pending) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.peek() {
            Some(Ok(value)) => f.debug_tuple("Pending").field(value).finish(),
            Some(Err(error)) => f.debug_tuple("Pending").field(error).finish(),
            None => f.write_str("Pending(..)"),
        }
    }
}

type SharedStream = Arc<Mutex<Option<BoxStream<'static, Result<Value, ResolveError>>>>>;

/// An asynchronous sequence of values.
///
/// Streams cannot be restarted: the first consumer takes the underlying stream and later
/// consumers find it gone.
#[derive(Clone)]
pub struct PendingStream(SharedStream);

impl PendingStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Value, ResolveError>> + Send + 'static,
    {
        PendingStream(Arc::new(Mutex::new(Some(stream.boxed()))))
    }

    pub fn take(&self) -> Option<BoxStream<'static, Result<Value, ResolveError>>> {
        self.0.lock().take()
    }

    pub fn ptr_eq(&self, other: &PendingStream) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PendingStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.lock().is_some() {
            f.write_str("PendingStream(..)")
        } else {
            f.write_str("PendingStream(consumed)")
        }
    }
}
