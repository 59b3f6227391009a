//! HandlerRegistry - task_type から Handler への対応表
//!
//! Built mutably during initialization, then shared immutably behind an
//! `Arc` while the runner is live, so lookups take no lock.

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{DynHandler, Handler, TypedHandler};
use super::task::Task;
use crate::domain::{SpindleError, TaskType};

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn DynHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a typed handler under `T::TYPE`.
    pub fn register<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), SpindleError> {
        self.register_dyn(
            TaskType::new(T::TYPE),
            Arc::new(TypedHandler::<T, H>::new(handler)),
        )
    }

    /// Register a raw JSON handler. Duplicate registration is an error.
    pub fn register_dyn(
        &mut self,
        task_type: TaskType,
        handler: Arc<dyn DynHandler>,
    ) -> Result<(), SpindleError> {
        if task_type.is_empty() {
            return Err(SpindleError::InvalidTask(
                "task type must not be empty".into(),
            ));
        }
        if self.handlers.contains_key(&task_type) {
            return Err(SpindleError::DuplicateHandler(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn DynHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .handlers
            .keys()
            .map(|t| t.as_str().to_string())
            .collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
