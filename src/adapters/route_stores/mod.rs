pub mod file;
pub mod memory;
pub mod sqlite;

pub use file::FileRouteStore;
pub use memory::MemoryRouteStore;
pub use sqlite::SqliteRouteStore;
