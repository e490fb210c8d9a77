//! Environment: the entry point that ties pages, journal and transactions
//! together.

mod environment;
mod flusher;
mod options;
mod report;

pub use environment::{Environment, METADATA_TREE};
pub use options::{EnvironmentOptions, TransactionsMode, TransactionsModeResult};
pub use report::{
    DataFileReport, EnvironmentStats, StorageReport, TreeReport, FREE_SPACE_TREE_NAME,
    ROOT_TREE_NAME,
};

pub(crate) use environment::{CommittedState, EnvInner};
