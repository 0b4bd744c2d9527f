pub mod batch;
pub mod outcome;
pub mod proxy;
pub mod snapshot;

pub use batch::{Batch, BatchParseError};
pub use outcome::{FetchOutcome, WalletStat};
pub use proxy::Proxy;
pub use snapshot::Snapshot;
