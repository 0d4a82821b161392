pub mod executor;
pub mod shutdown;
pub mod timeout;

pub use executor::{classify, run_with_retry, CommandExecutor, CommandResult, CommandRunner};
pub use shutdown::{listen_for_signals, Shutdown};
pub use timeout::{RetryPolicy, TimeoutStrategy, TimeoutTracker};
