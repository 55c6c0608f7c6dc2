//! Cross-thread execution substrate.
//!
//! Two threads exist: the embedder's main thread and the background I/O
//! thread. The only sanctioned channel between them is [`queue::TaskQueue`];
//! [`role`] tags each thread and routes deferred destruction to the thread
//! that owns it.

pub mod queue;
pub mod role;

pub use queue::{CondvarWaker, NotifyWaker, TaskQueue, Wake};
pub use role::{current_role, defer_drop, register_role, Role};
