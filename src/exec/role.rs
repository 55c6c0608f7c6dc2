//! Thread-role tagging and deferred destruction.
//!
//! Exactly two roles exist: the embedder's main thread and the background
//! I/O thread. Each registers its role once at startup. [`defer_drop`]
//! frees a value immediately when called on its home thread and otherwise
//! enqueues a drop closure onto the home thread's queue, so values with
//! thread-affinity are destroyed on the correct thread regardless of which
//! thread released them. Calling it from a thread with no registered role
//! is a threading-model violation and panics.

use std::cell::Cell;
use std::sync::Arc;

use parking_lot::RwLock;

use super::queue::TaskQueue;

/// The two thread roles of the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The embedder's application thread.
    Main,
    /// The network I/O thread.
    Background,
}

thread_local! {
    static ROLE: Cell<Option<Role>> = const { Cell::new(None) };
}

/// Queue of pending drop closures for one role's thread.
pub(crate) type DropQueue = TaskQueue<()>;

static DROP_QUEUES: RwLock<[Option<Arc<DropQueue>>; 2]> = RwLock::new([None, None]);

fn slot(role: Role) -> usize {
    match role {
        Role::Main => 0,
        Role::Background => 1,
    }
}

/// Tag the calling thread with `role`. Called once per thread at startup.
///
/// Re-registering the same role on the same thread is a no-op; claiming a
/// different role than the one already registered panics.
pub fn register_role(role: Role) {
    ROLE.with(|cell| match cell.get() {
        None => cell.set(Some(role)),
        Some(existing) if existing == role => {}
        Some(existing) => {
            panic!("thread already registered as {existing:?}, cannot become {role:?}")
        }
    });
}

/// The role registered for the calling thread, if any.
pub fn current_role() -> Option<Role> {
    ROLE.with(|cell| cell.get())
}

/// Install the drop queue drained by `role`'s thread.
pub(crate) fn install_drop_queue(role: Role, queue: Arc<DropQueue>) {
    DROP_QUEUES.write()[slot(role)] = Some(queue);
}

/// The drop queue for `role`, if a server has installed one.
pub(crate) fn drop_queue(role: Role) -> Option<Arc<DropQueue>> {
    DROP_QUEUES.read()[slot(role)].clone()
}

/// Free `value` on its home thread.
///
/// On the home thread the value is dropped immediately; on the other
/// thread a drop closure is enqueued onto the home thread's queue instead.
/// Panics when the calling thread has no registered role, since that
/// indicates a threading-model violation that must not be silently
/// ignored.
pub fn defer_drop<T: Send + 'static>(home: Role, value: T) {
    match current_role() {
        Some(role) if role == home => drop(value),
        Some(_) => match drop_queue(home) {
            Some(queue) => queue.push(move |_| drop(value)),
            // No engine loop to hand the value to; dropping here is the
            // only remaining option.
            None => drop(value),
        },
        None => panic!("defer_drop called from a thread with no registered role"),
    }
}
