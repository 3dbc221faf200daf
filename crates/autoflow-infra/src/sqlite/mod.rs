//! SQLite storage layer.
//!
//! Repository implementations backed by SQLite with WAL mode and split
//! read/write connection pools. [`store::SqliteStore`] implements every
//! repository trait; the impls live next to the tables they touch.

mod codec;

pub mod cursor;
pub mod dag;
pub mod event;
pub mod instance;
pub mod lock;
pub mod pool;
pub mod store;
