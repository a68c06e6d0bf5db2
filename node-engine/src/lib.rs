pub mod child;
pub mod engine;
pub mod logs;
pub mod util;

pub use child::ChildProcess;
pub use engine::{Engine, UsageRecord};
pub use logs::{LogBroadcaster, LogRingBuffer, LogSubscription};
