pub mod registry;

pub use registry::{QueueHandle, QueueRegistry, RegisteredQueue};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::{JobError, JobRecord};

/// Work executed for every job of one queue.
///
/// Return `Ok(())` on success, [`JobError::Retryable`] for transient failures
/// that should go through the backoff path, and [`JobError::Terminal`] for
/// failures no retry can fix (for example an invalid payload).
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn process(&self, job: &JobRecord) -> Result<(), JobError>;
}

/// Handler built from an async closure over the job record
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn process(&self, job: &JobRecord) -> Result<(), JobError> {
        (self.f)(job.clone()).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(JobRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

/// Handler that decodes the payload as JSON before calling `f`.
///
/// A payload that does not decode into `T` is a terminal failure.
pub struct JsonHandler<T, F> {
    f: F,
    _payload: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T, F, Fut> JobHandler for JsonHandler<T, F>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    async fn process(&self, job: &JobRecord) -> Result<(), JobError> {
        let payload: T = serde_json::from_slice(&job.payload).map_err(|e| {
            JobError::terminal(format!("Failed to deserialize {} payload: {}", job.name, e))
        })?;
        (self.f)(payload).await
    }
}

pub fn json_handler<T, F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    T: DeserializeOwned + Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), JobError>> + Send + 'static,
{
    Arc::new(JsonHandler {
        f,
        _payload: PhantomData,
    })
}
