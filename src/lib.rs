pub mod atomic;
pub mod collection;
pub mod document;
pub mod error;
pub mod git;
pub mod index;
pub mod serializer;
pub mod store;
pub mod transaction;
pub mod value;
pub mod watcher;

pub use document::{Document, Format};
pub use error::{Result, VaultError};
pub use store::{Store, StoreOptions};
pub use transaction::Transaction;
pub use value::{Map, Value};
pub use watcher::{ChangeEvent, ChangeKind, RestartPolicy, WatchHandle};
