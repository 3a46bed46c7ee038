use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::JobHandler;
use crate::{QueueError, QueueOptions, QueueResult, RetryPolicy};

/// A queue as fixed at registration: name, options and handler
pub struct RegisteredQueue {
    name: String,
    options: QueueOptions,
    handler: Arc<dyn JobHandler>,
}

impl RegisteredQueue {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn concurrency(&self) -> usize {
        self.options.concurrency
    }

    pub fn handler(&self) -> Arc<dyn JobHandler> {
        self.handler.clone()
    }
}

impl fmt::Debug for RegisteredQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Opaque handle to a registered queue
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueHandle {
    name: Arc<str>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Registry of named queues, built once at startup.
///
/// The engine takes ownership of the registry and shares it behind an `Arc`,
/// so no queue can be added or have its handler swapped afterwards.
#[derive(Default)]
pub struct QueueRegistry {
    queues: Vec<Arc<RegisteredQueue>>,
    index: HashMap<String, usize>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a queue; fails on a duplicate name, invalid options or a missing handler
    pub fn register(
        &mut self,
        name: impl Into<String>,
        options: QueueOptions,
        handler: Option<Arc<dyn JobHandler>>,
    ) -> QueueResult<QueueHandle> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::config("queue name must not be empty"));
        }
        if self.index.contains_key(&name) {
            return Err(QueueError::config(format!("queue '{name}' already registered")));
        }
        options
            .validate()
            .map_err(|e| QueueError::config(format!("queue '{name}': {e}")))?;
        let handler =
            handler.ok_or_else(|| QueueError::config(format!("queue '{name}' has no handler")))?;

        self.index.insert(name.clone(), self.queues.len());
        self.queues.push(Arc::new(RegisteredQueue {
            name: name.clone(),
            options,
            handler,
        }));

        Ok(QueueHandle { name: name.into() })
    }

    /// Shorthand for the common case of concurrency plus retry policy
    pub fn register_queue(
        &mut self,
        name: impl Into<String>,
        concurrency: usize,
        retry: RetryPolicy,
        handler: Arc<dyn JobHandler>,
    ) -> QueueResult<QueueHandle> {
        let options = QueueOptions::default()
            .with_concurrency(concurrency)
            .with_retry(retry);
        self.register(name, options, Some(handler))
    }

    pub fn get(&self, name: &str) -> QueueResult<&Arc<RegisteredQueue>> {
        self.index
            .get(name)
            .map(|&i| &self.queues[i])
            .ok_or_else(|| QueueError::UnknownQueue(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Registered queue names in registration order
    pub fn list_queues(&self) -> Vec<String> {
        self.queues.iter().map(|q| q.name.clone()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<RegisteredQueue>> {
        self.queues.iter()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}
