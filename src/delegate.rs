//! In-process registry letting one domain announce an action so that other
//! domains can react, without the announcer importing them.
//!
//! Handlers are registered at startup. Delivery is synchronous with the
//! caller and follows registration order; the first handler error stops
//! delivery and is returned to the caller.

use crate::types::Result;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

/// An announced action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Data {
    /// Owning domain, e.g. `user`.
    pub domain: String,
    /// Action within the domain.
    pub action: String,
    /// Action parameters.
    pub params: serde_json::Value,
}

type Func = Arc<dyn Fn(Data) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Registry of action handlers keyed by domain and action.
#[derive(Default)]
pub struct Delegate {
    funcs: RwLock<HashMap<(String, String), Vec<Func>>>,
}

impl Delegate {
    /// A delegate with no subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler for `action` in `domain`.
    pub fn register<F, Fut>(&self, domain: &str, action: &str, f: F)
    where
        F: Fn(Data) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let func: Func = Arc::new(move |data| Box::pin(f(data)));
        self.funcs
            .write()
            .entry((domain.to_string(), action.to_string()))
            .or_default()
            .push(func);
    }

    /// Delivers `data` to every handler registered for its domain and action.
    pub async fn call(&self, data: Data) -> Result<()> {
        // Snapshot so no lock is held across handler awaits.
        let funcs = self
            .funcs
            .read()
            .get(&(data.domain.clone(), data.action.clone()))
            .cloned()
            .unwrap_or_default();

        debug!(domain = %data.domain, action = %data.action, handlers = funcs.len(), "delegate call");

        for func in funcs {
            func(data.clone()).await?;
        }

        Ok(())
    }
}
