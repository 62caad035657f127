//! Service function tables.
//!
//! A [`Service`] maps 16-bit function ids to async handlers. Stubs generated
//! at build time (or written by hand) reduce an interface method call to the
//! `{service_id, function_id, params}` triple the session layer routes on;
//! nothing here depends on runtime code generation.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use asterisque_core::Value;

use crate::{Abort, Pipe};

/// Boxed future returned by a service handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, Abort>> + Send>>;

/// One registered function: receives the serving [`Pipe`] and the `Open`
/// params, returns the close body.
pub type Handler = Arc<dyn Fn(Pipe, Value) -> HandlerFuture + Send + Sync>;

/// A function table exposed under one service id.
///
/// ```no_run
/// use asterisque::{Service, Abort};
/// use asterisque_core::Value;
///
/// let service = Service::new().func(1, |_pipe, params| async move {
///     match params {
///         Value::String(s) => Ok(Value::String(s)),
///         _ => Err(Abort::unexpected("echo takes a string")),
///     }
/// });
/// # let _ = service;
/// ```
#[derive(Clone, Default)]
pub struct Service {
    functions: HashMap<u16, Handler>,
}

impl Service {
    pub fn new() -> Service {
        Service { functions: HashMap::new() }
    }

    /// Register a handler under `function_id`, replacing any previous one.
    pub fn func<F, Fut>(mut self, function_id: u16, handler: F) -> Service
    where
        F: Fn(Pipe, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Abort>> + Send + 'static,
    {
        self.functions
            .insert(function_id, Arc::new(move |pipe, params| Box::pin(handler(pipe, params))));
        self
    }

    pub fn lookup(&self, function_id: u16) -> Option<Handler> {
        self.functions.get(&function_id).cloned()
    }

    pub fn function_ids(&self) -> impl Iterator<Item = u16> + '_ {
        self.functions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<u16> = self.functions.keys().copied().collect();
        ids.sort_unstable();
        f.debug_struct("Service").field("functions", &ids).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_registered_functions() {
        let service = Service::new()
            .func(1, |_pipe, params| async move { Ok(params) })
            .func(2, |_pipe, _params| async move { Err(Abort::unexpected("nope")) });

        assert_eq!(service.len(), 2);
        assert!(service.lookup(1).is_some());
        assert!(service.lookup(2).is_some());
        assert!(service.lookup(3).is_none());
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let service = Service::new()
            .func(1, |_pipe, _params| async move { Ok(Value::Int32(1)) })
            .func(1, |_pipe, _params| async move { Ok(Value::Int32(2)) });
        assert_eq!(service.len(), 1);
    }
}
