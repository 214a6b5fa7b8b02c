pub mod engine;
pub mod filter;
pub mod reconcile;
pub mod retry;
pub mod scanner;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod transfer;
pub mod tree;

pub use engine::{
    EngineOptions, FailedFile, MigrationEngine, MigrationPlan, MigrationReport, PlannedFile,
    RunOutcome,
};
pub use filter::{FilterEngine, FilterRules};
pub use reconcile::{reconcile, ReconcileSummary};
pub use retry::{RetryDecision, RetryPolicy, TransferOutcome};
pub use scanner::FileScanner;
pub use scheduler::{SchedulerConfig, SchedulerSummary, TransferScheduler};
pub use shutdown::ShutdownHandle;
pub use store::{Claim, StateStore};
pub use transfer::{MigrationState, StateCounters, TransferRecord, TransferStatus};
pub use tree::{Tree, TreeNode};
