//! The per-VM message queue.
//!
//! A mailbox entry pairs the sending VM with a value that has already been
//! deep-copied into the *receiving* VM's heap.  Pending entries are
//! collection roots of the receiver; once removed by a receive, the value
//! stays valid only until the receiver's next collection unless the caller
//! roots it.

use std::sync::Arc;

use crate::error::{RotorError, RotorResult};
use crate::objects::tagged::Value;
use crate::vm::Vm;

/// Fixed queue capacity; an append past this bound is fatal to the sender.
pub const INBOX_CAPACITY: usize = 1024;

/// One received message: the sender's handle and the copied value.
///
/// Dropping the `Message` releases the handle; the value's storage belongs
/// to the receiving VM's heap throughout.
pub struct Message {
    sender: Arc<Vm>,
    value: Value,
}

impl Message {
    pub(crate) fn new(sender: Arc<Vm>, value: Value) -> Self {
        Self { sender, value }
    }

    /// The message value, owned by the receiving VM's heap.
    pub fn value(&self) -> Value {
        self.value
    }

    /// The VM that sent this message.
    pub fn sender(&self) -> &Arc<Vm> {
        &self.sender
    }
}

/// The queue itself; always accessed under the owning VM's inbox lock.
pub(crate) struct Mailbox {
    entries: Vec<Message>,
}

impl Mailbox {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Append a message, preserving arrival order.
    pub(crate) fn try_push(&mut self, msg: Message) -> RotorResult<()> {
        if self.entries.len() >= INBOX_CAPACITY {
            return Err(RotorError::InboxFull);
        }
        self.entries.push(msg);
        Ok(())
    }

    /// Index of the first entry, or the first entry from `sender`.
    pub(crate) fn find(&self, sender: Option<&Arc<Vm>>) -> Option<usize> {
        self.entries.iter().position(|m| match sender {
            None => true,
            Some(s) => Arc::ptr_eq(&m.sender, s),
        })
    }

    /// Borrow the entry at `index`.
    pub(crate) fn entry(&self, index: usize) -> &Message {
        &self.entries[index]
    }

    /// Remove the entry at `index`, shifting later entries down so that
    /// per-sender arrival order is preserved.
    pub(crate) fn remove(&mut self, index: usize) -> Message {
        self.entries.remove(index)
    }

    /// Mutable access to every pending value (the collector's root walk).
    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Value> {
        self.entries.iter_mut().map(|m| &mut m.value)
    }

    /// Number of pending messages.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
