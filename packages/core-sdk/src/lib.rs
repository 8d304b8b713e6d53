pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod models;
pub mod relay;
pub mod server;
pub mod store;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::config::AppConfig;
    pub use crate::error::ApiError;
    pub use crate::llm::{HttpGateway, ModelGateway};
    pub use crate::models::{Completion, RelayEvent, Role};
    pub use crate::relay::{Relay, RelayRequest};
    pub use crate::server::{self, AppState};
    pub use crate::store::ConversationStore;
}
