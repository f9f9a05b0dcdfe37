pub mod loader;
pub mod models;

pub use loader::{load_config, read_config};
pub use models::*;
