use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::value::Value;

/// Looks up injected services by name.
pub trait ServiceProvider: Send + Sync {
    fn get_service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// A fixed set of named services.
#[derive(Clone, Default)]
pub struct ServiceCollection {
    services: HashMap<String, Arc<dyn Any + Send + Sync>>,
}

impl ServiceCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service<S>(self, name: impl Into<String>, service: S) -> Self
    where
        S: Any + Send + Sync,
    {
        self.with_shared_service(name, Arc::new(service))
    }

    pub fn with_shared_service<S>(mut self, name: impl Into<String>, service: Arc<S>) -> Self
    where
        S: Any + Send + Sync,
    {
        self.services.insert(name.into(), service);
        self
    }
}

impl ServiceProvider for ServiceCollection {
    fn get_service(&self, name: &str) -> Option<Arc<dyn Any + Send + Sync>> {
        self.services.get(name).cloned()
    }
}

impl fmt::Debug for ServiceCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.services.keys()).finish()
    }
}

/// Creates a fresh root context, once per subscription event.
pub trait RootContextFactory: Send + Sync {
    fn create(&self) -> Value;
}

impl<F> RootContextFactory for F
where
    F: Fn() -> Value + Send + Sync,
{
    fn create(&self) -> Value {
        self()
    }
}
