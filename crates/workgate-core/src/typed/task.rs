//! Task trait - 型付き Task の定義
//!
//! 型付き Task は serde_json で payload にエンコードされ、`T::TYPE` が
//! TaskRecord の `task_type` になる。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は task_type と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct UploadPhoto {
///     path: String,
/// }
///
/// impl Task for UploadPhoto {
///     const TYPE: &'static str = "media.photo.upload.v1";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: enqueue 時に payload へエンコードするため
/// - `DeserializeOwned`: 実行時に payload から復元するため
/// - `Send + Sync + 'static`: Arc に格納して別タスクで実行するため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// task_type の定義
    ///
    /// # 命名規約
    /// - `{namespace}.{domain}.{action}.v{major}`
    /// - 例: `acme.billing.charge.v1`
    const TYPE: &'static str;

    fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::collections::HashMap;

    use serde::{Deserialize, Serialize};

    use super::Task;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct TestTask {
        pub value: i32,
    }

    impl Task for TestTask {
        const TYPE: &'static str = "test.task.create.v1";
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct AnotherTestTask {
        pub name: String,
        pub family: HashMap<String, String>,
    }

    impl Task for AnotherTestTask {
        const TYPE: &'static str = "test.task.another.v1";
    }
}
