pub mod period;
pub mod sync;
pub mod task;
pub mod time;

pub use period::PeriodicTimer;
pub use sync::{ReadHold, Semaphore, TimedRwLock, WaitError, WriteHold};
pub use task::{TaskFlags, TaskHandle, in_task_context, stop_all};
pub use time::{TimeStats, as_ns, now_ns};
