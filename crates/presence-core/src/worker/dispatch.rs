//! The capability a worker binds to: named operations over JSON values.

use crate::error::RemoteFault;
use async_trait::async_trait;
use serde_json::{Map, Value};

/// Name and member set of a remotely callable service.
///
/// Shared by both ends: the worker registers under `name`, and the client
/// proxy rejects members outside `methods` before touching the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub methods: Vec<String>,
}

impl ServiceDescriptor {
    pub fn new<I, S>(name: impl Into<String>, methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Same members under `name` followed by `suffix`.
    pub fn with_suffix(mut self, suffix: &str) -> Self {
        self.name.push_str(suffix);
        self
    }

    pub fn has_method(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m == method)
    }
}

/// Trait for handling calls routed to a worker.
///
/// Every remote member, including what would be a plain attribute elsewhere,
/// is a named operation taking zero or more arguments. Faults returned here
/// travel back to the caller as data; they never stop the worker.
#[async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Service name and the members `dispatch` understands.
    fn descriptor(&self) -> ServiceDescriptor;

    /// Execute `method` and return its result.
    async fn dispatch(
        &self,
        method: &str,
        args: Vec<Value>,
        kwargs: Map<String, Value>,
    ) -> std::result::Result<Value, RemoteFault>;
}
