pub mod merge_executor;
pub mod retry;

pub use merge_executor::{build_decision, commit_with_retry, MergeExecutor, MergeOutcome, MergePolicy};
pub use retry::RetryPolicy;
