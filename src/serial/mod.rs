//! Per-key FIFO ordering (C4 `SerialQueue`, C5 `SerialManager`; §4.3, §4.4).

mod manager;
mod queue;

pub use manager::{SerialManager, SerialManagerConfig, SerialManagerStats, SerialQueueEvent};
pub use queue::{SerialConfig, SerialQueue, SerialQueueStats, SerialTaskInfo, TaskRunner};
