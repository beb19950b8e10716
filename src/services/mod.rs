pub mod chat;
pub mod database;
pub mod export;
pub mod history;
pub mod settings;
pub mod storage;

pub use chat::ChatController;
pub use database::Database;
pub use history::HistoryStore;
pub use settings::{AppSettings, SettingsService};
pub use storage::KeyValueStore;
