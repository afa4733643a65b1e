pub mod config;
pub mod counter_store;
pub mod database;

pub use config::DatabaseConfig;
pub use counter_store::PgCounterStore;
pub use database::Database;
