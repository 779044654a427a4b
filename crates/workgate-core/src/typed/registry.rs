//! WorkRegistry - task_type から Work を引く
//!
//! # 内部実装
//! - `register_typed::<T, H>(handler)` は TypedHandler でラップして登録
//! - `register(task_type, work)` は生の `Work`（バイト列 payload）を登録
//! - HashMap<String, Arc<dyn Work>> で管理

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TypedHandler, Work};
use super::task::Task;

/// WorkRegistry は task_type ごとに 1 つの Work を持つ
///
/// # 使用例
/// ```ignore
/// let mut registry = WorkRegistry::new();
/// registry.register_typed::<UploadPhoto, _>(UploadHandler)?;
/// registry.register("cache.prune.v1", from_fn(|_ctx| async { Ok(Vec::new()) }))?;
///
/// let work = registry.get("media.photo.upload.v1");
/// ```
#[derive(Default, Clone)]
pub struct WorkRegistry {
    works: HashMap<String, Arc<dyn Work>>,
}

/// RegistryError は WorkRegistry の操作エラー
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Work for task type '{0}' is already registered")]
    AlreadyRegistered(String),
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<W: Work + 'static>(
        &mut self,
        task_type: impl Into<String>,
        work: W,
    ) -> Result<(), RegistryError> {
        self.insert(task_type.into(), Arc::new(work))
    }

    pub fn register_typed<T: Task, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.insert(T::TYPE.to_string(), Arc::new(TypedHandler::new(handler)))
    }

    fn insert(&mut self, task_type: String, work: Arc<dyn Work>) -> Result<(), RegistryError> {
        if self.works.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.works.insert(task_type, work);
        Ok(())
    }

    pub fn get(&self, task_type: &str) -> Option<Arc<dyn Work>> {
        self.works.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.works.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn registered_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.works.keys().cloned().collect();
        types.sort();
        types
    }
}
