//! Leaf dispatch: the uniform capability every step body implements.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::LeafFailure;

/// An opaque unit of work behind a leaf step.
///
/// The engine only sees input map -> value or failure. Retries and
/// timeouts are the body's own business.
#[async_trait]
pub trait LeafBody: Send + Sync {
    async fn call(&self, input: Map<String, Value>) -> Result<Value, LeafFailure>;
}

/// Adapter turning an async closure into a [`LeafBody`].
pub struct FnLeaf<F>(F);

#[async_trait]
impl<F, Fut> LeafBody for FnLeaf<F>
where
    F: Fn(Map<String, Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, LeafFailure>> + Send + 'static,
{
    async fn call(&self, input: Map<String, Value>) -> Result<Value, LeafFailure> {
        (self.0)(input).await
    }
}

/// Registry of leaf bodies keyed by body key (a script path or a step id).
#[derive(Clone, Default)]
pub struct Dispatcher {
    bodies: HashMap<String, Arc<dyn LeafBody>>,
}

impl Dispatcher {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a body.
    pub fn register(mut self, key: &str, body: impl LeafBody + 'static) -> Self {
        self.bodies.insert(key.to_string(), Arc::new(body));
        self
    }

    /// Register an async closure as a body.
    pub fn register_fn<F, Fut>(self, key: &str, f: F) -> Self
    where
        F: Fn(Map<String, Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, LeafFailure>> + Send + 'static,
    {
        self.register(key, FnLeaf(f))
    }

    /// Look up a body.
    pub fn get(&self, key: &str) -> Option<Arc<dyn LeafBody>> {
        self.bodies.get(key).cloned()
    }

    /// Whether a body is registered under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.bodies.contains_key(key)
    }

    /// Call the body registered under `key`.
    pub async fn dispatch(&self, key: &str, input: Map<String, Value>) -> Result<Value, LeafFailure> {
        match self.get(key) {
            Some(body) => body.call(input).await,
            None => Err(LeafFailure::new(format!("no leaf body registered for `{key}`"))),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<_> = self.bodies.keys().collect();
        keys.sort();
        f.debug_struct("Dispatcher").field("bodies", &keys).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl LeafBody for Echo {
        async fn call(&self, input: Map<String, Value>) -> Result<Value, LeafFailure> {
            Ok(Value::Object(input))
        }
    }

    #[tokio::test]
    async fn test_dispatch_registered_body() {
        let dispatcher = Dispatcher::new().register("echo", Echo);
        let mut input = Map::new();
        input.insert("x".to_string(), json!(1));

        let out = dispatcher.dispatch("echo", input).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_dispatch_closure() {
        let dispatcher = Dispatcher::new().register_fn("double", |input| async move {
            let n = input.get("n").and_then(Value::as_i64).unwrap_or(0);
            Ok::<_, LeafFailure>(json!(n * 2))
        });
        let mut input = Map::new();
        input.insert("n".to_string(), json!(21));

        assert_eq!(dispatcher.dispatch("double", input).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_missing_body_is_leaf_failure() {
        let err = Dispatcher::new().dispatch("nope", Map::new()).await.unwrap_err();
        assert!(err.message.contains("nope"));
    }
}
