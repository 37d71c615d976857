pub mod agent;
pub mod chat;
pub mod config;
pub mod memory;
pub mod notify;
pub mod progress;
pub mod projects;
pub mod scheduler;
pub mod store;
pub mod tasks;
pub mod telegram;
pub mod tui;
pub mod workspace;

pub use agent::{AgentReply, AgentRunner};
pub use chat::Conversations;
pub use config::Config;
pub use memory::Memory;
pub use scheduler::Scheduler;
pub use store::JsonFile;
pub use workspace::Workspace;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
