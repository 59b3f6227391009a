//! Task trait - 型付き Task の定義

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Binds a payload type to its task-type tag.
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendEmail {
///     to: String,
/// }
///
/// impl Task for SendEmail {
///     const TYPE: &'static str = "send-email";
/// }
/// ```
///
/// # Trait Bounds
/// - `Serialize`: 永続化のため
/// - `DeserializeOwned`: 永続化された payload からの復元のため
/// - `Send + Sync + 'static`: spawn されたタスクへ渡すため
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE: &'static str;
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::Task;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SendEmail {
        pub to: String,
    }

    impl Task for SendEmail {
        const TYPE: &'static str = "send-email";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RebuildIndex {
        pub organization_id: u64,
    }

    impl Task for RebuildIndex {
        const TYPE: &'static str = "rebuild-index";
    }
}
