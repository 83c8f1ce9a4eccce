//! Compiles selections over a typed root context and executes them in one or two phases.
//!
//! A selection that only reads the root context is compiled into a single operation.
//! When part of it needs injected services, the operation is split: the query provider
//! materializes everything it can compute, bulk loaders run once over the whole result,
//! and a second operation replays the service-backed resolvers over the materialized value.

#![cfg_attr(feature = "failfast", allow(unreachable_code))]
#![warn(unreachable_pub)]

macro_rules! failfast_debug {
    ($($tokens:tt)+) => {{
        tracing::debug!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

macro_rules! failfast_error {
    ($($tokens:tt)+) => {{
        tracing::error!($($tokens)+);
        #[cfg(feature = "failfast")]
        panic!(
            "failfast triggered. \
            Please remove the feature failfast if you don't want to see these panics"
        );
    }};
}

pub mod json_ext;

mod compiler;
pub mod configuration;
pub mod error;
pub mod execution;
mod flatten;
pub mod graphql;
pub mod ir;
pub mod limiter;
pub mod spec;
pub mod value;

pub use configuration::Configuration;
pub use configuration::ExecutionOptions;
pub use error::CompileError;
pub use error::ExecutionError;
pub use error::ResolveError;
pub use execution::ExecutionRequest;
pub use execution::Executor;
pub use graphql::Response;
pub use limiter::ConcurrencyLimiterRegistry;
pub use spec::Schema;
pub use value::Value;
