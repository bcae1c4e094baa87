pub mod catalog;
pub mod config;
pub mod credentials;
pub mod errors;
pub mod providers;
pub mod relay;
pub mod server;
pub mod session;

// Re-export commonly used types for easier access
pub use config::{Config, load_config};
pub use errors::{AppError, AppResult};
pub use server::{AppState, start_server};
