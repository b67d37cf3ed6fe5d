// ABOUTME: Dispatch module - turns due tasks into serialized, quota-checked actions.
// ABOUTME: Contains the task model, the task store contract, and the dispatcher.

mod dispatcher;
mod store;
mod task;

pub use dispatcher::{Dispatcher, DispatcherParts};
pub use store::{MemoryTaskStore, TaskStore};
pub use task::{DEFAULT_TASK_PRIORITY, Task, TaskStatus};

#[cfg(test)]
mod dispatcher_test;
