pub mod catalog;
pub mod credentials;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod token;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::db;
    pub use crate::error::{LlmError, LlmResult};
    pub use crate::llm::{LlmManager, ManagerConfig, ModeObserver};
    pub use crate::models;
    pub use crate::server;
    pub use crate::settings::{SettingsPatch, SettingsStore};
    pub use crate::telemetry;
}
