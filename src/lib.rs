pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod remote;

pub use config::MigrationConfig;
pub use core::{MigrationEngine, MigrationReport, RunOutcome, ShutdownHandle};
pub use error::{ConfigError, MigrateError, RemoteError};
