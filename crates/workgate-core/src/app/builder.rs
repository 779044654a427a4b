//! SchedulerBuilder - スケジューラの構築とワイヤリング
//!
//! # 起動時検証（Fail-fast）
//! - store が無ければ BuildError::MissingStore
//! - config は build() 時に validate する
//! - expect_tasks() で期待される task_type が全て登録されているかチェック

use std::sync::Arc;

use crate::app::config::{ConfigError, SchedulerConfig};
use crate::app::runner::ExecutionRunner;
use crate::app::scheduler::Scheduler;
use crate::domain::{Decider, DefaultDecider};
use crate::impls::ManualEnvironment;
use crate::policy::BackoffPolicy;
use crate::ports::{Clock, EnvironmentProvider, SystemClock, TaskStore, UlidGenerator};
use crate::typed::{Handler, RegistryError, Task, Work, WorkRegistry};

/// SchedulerBuilder は Scheduler を構築
///
/// # 使用例
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .store(SqliteTaskStore::open("tasks.db")?)
///     .config(SchedulerConfig::from_file("workgate.toml")?)
///     .register::<UploadPhoto, _>(UploadHandler)?
///     .expect_tasks(&[UploadPhoto::TYPE])
///     .build()?;
/// scheduler.start().await?;
/// ```
///
/// 省略時のデフォルト:
/// - clock: `SystemClock`
/// - environment: `ManualEnvironment`（すべて利用可能）
/// - decider: `DefaultDecider`（config.backoff から）
pub struct SchedulerBuilder {
    store: Option<Arc<dyn TaskStore>>,
    config: SchedulerConfig,
    clock: Option<Arc<dyn Clock>>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    decider: Option<Arc<dyn Decider>>,
    registry: WorkRegistry,
    expected_tasks: Option<Vec<String>>,
}

/// BuildError はスケジューラ構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task types: {0:?}. These tasks were expected but not registered.")]
    MissingTaskTypes(Vec<String>),

    #[error("No task store configured")]
    MissingStore,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            config: SchedulerConfig::default(),
            clock: None,
            environment: None,
            decider: None,
            registry: WorkRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn store(self, store: impl TaskStore + 'static) -> Self {
        self.shared_store(Arc::new(store))
    }

    pub fn shared_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    /// 型付き Handler を登録
    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register_typed::<T, H>(handler)?;
        Ok(self)
    }

    /// バイト列 payload の Work を登録
    pub fn register_work<W: Work + 'static>(
        mut self,
        task_type: impl Into<String>,
        work: W,
    ) -> Result<Self, RegistryError> {
        self.registry.register(task_type, work)?;
        Ok(self)
    }

    /// 期待される task_type のリストを設定
    pub fn expect_tasks(mut self, task_types: &[&str]) -> Self {
        self.expected_tasks = Some(task_types.iter().map(|t| t.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Scheduler, BuildError> {
        self.config.validate()?;

        if let Some(expected_tasks) = &self.expected_tasks {
            let missing_tasks: Vec<String> = expected_tasks
                .iter()
                .filter(|t| !self.registry.contains(t))
                .cloned()
                .collect();
            if !missing_tasks.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing_tasks));
            }
        }

        let store = self.store.ok_or(BuildError::MissingStore)?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(ManualEnvironment::new(Arc::clone(&clock))));
        let decider = self.decider.unwrap_or_else(|| {
            Arc::new(DefaultDecider::new(BackoffPolicy::from_config(
                &self.config.backoff,
            )))
        });
        let runner = ExecutionRunner::new(Arc::new(self.registry), self.config.runner.clone());
        let ids = Box::new(UlidGenerator::new(Arc::clone(&clock)));

        Ok(Scheduler::new(
            store,
            runner,
            decider,
            environment,
            clock,
            ids,
            self.config,
        ))
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
