pub mod config;
pub mod env;
pub mod error;
pub mod flock;
pub mod gc;
pub mod log;
pub mod meta;
pub mod scheduler;
pub mod tree;
pub mod txn;

pub use config::{EnvironmentConfig, LogConfig};
pub use env::Environment;
pub use error::{Error, Result};
pub use gc::GcHooks;
pub use log::Log;
pub use tree::StoreConfig;
pub use txn::{Store, Transaction, TransactionKind};
