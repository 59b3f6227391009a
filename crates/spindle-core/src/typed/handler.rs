//! Handler trait - Task を実行する Handler の定義
//!
//! - `Handler<T>`: 型付きの表層
//! - `DynHandler`: object-safe な内部表現（registry に格納する形）
//! - `TypedHandler<T, H>`: 型消去のアダプタ

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::domain::HandlerError;

/// Executes one decoded task.
///
/// Tasks may be delivered more than once (a reclaimed lease re-runs the
/// handler), so implementations must tolerate re-execution.
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T) -> Result<(), HandlerError>;
}

/// Object-safe handler over the raw JSON payload.
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<(), HandlerError>;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        // decode できない payload は何度やっても失敗する
        let task: T = serde_json::from_value(payload)
            .map_err(|e| HandlerError::permanent(format!("json decode for {}: {e}", T::TYPE)))?;
        self.handler.handle(task).await
    }
}

/// Closure-backed `DynHandler`, handy for wiring small handlers inline.
pub struct FnHandler<F> {
    f: F,
}

pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> DynHandler for FnHandler<F>
where
    F: Fn(serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle_dyn(&self, payload: serde_json::Value) -> Result<(), HandlerError> {
        (self.f)(payload).await
    }
}
