use lumen_events::ItemId;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::inbox::CoreInbox;
use crate::vm::{AsyncCall, SyscallResult};

/// Runs long-running calls on the runtime's blocking pool and posts each
/// result back to the scheduler inbox.
#[derive(Clone)]
pub struct SyscallPool {
    handle: Handle,
    inbox: Arc<CoreInbox>,
}

impl SyscallPool {
    pub fn new(handle: Handle, inbox: Arc<CoreInbox>) -> Self {
        Self { handle, inbox }
    }

    /// Run `call` for `item_id`. `seq` comes back with the result so the
    /// scheduler can tell a current return from one a reset orphaned.
    pub fn spawn(&self, item_id: ItemId, seq: u64, call: AsyncCall) {
        let inbox = self.inbox.clone();
        debug!(target: "scheduler", "Dispatching syscall for {}", item_id);
        self.handle.spawn_blocking(move || {
            let result = catch_unwind(AssertUnwindSafe(call)).unwrap_or_else(|_| {
                warn!(target: "scheduler", "Syscall for {} panicked, resuming with no value", item_id);
                SyscallResult {
                    value: None,
                    delay_ms: 0,
                }
            });
            inbox.push_syscall_return(item_id, seq, result);
        });
    }
}
