pub mod bucket;
pub mod controller;
pub mod discriminator;
pub mod engine;
pub mod error;
pub mod scheduler;
pub mod scorer;
pub mod signals;
pub mod stats;
pub mod store;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;
#[cfg(feature = "test-utils")]
pub mod testutil;
pub mod topic;

pub use controller::{ClusterPass, RunMode};
pub use engine::{CatchallReason, Decision, PartitionEngine, Plan, Verdict};
pub use error::{ClusterError, Result};
pub use scheduler::{BatchReport, Scheduler};
pub use stats::PassStats;
pub use store::{
    CommitOutcome, MoveOutcome, PartitionLock, PendingTopic, PgTopicStore, TopicCommit,
    TopicStore, TopicWrite,
};
pub use topic::{Absorption, Topic, TopicSet};
