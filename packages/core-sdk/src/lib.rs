pub mod client;
pub mod llm;
pub mod models;
pub mod server;
pub mod session;
pub mod telemetry;

/**
 * \brief SDK 预导入集合，方便外部引用常用模块。
 */
pub mod prelude {
    pub use crate::client;
    pub use crate::llm;
    pub use crate::models;
    pub use crate::server;
    pub use crate::session;
    pub use crate::telemetry;
}
