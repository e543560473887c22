use std::fmt;
use std::sync::Arc;

use crate::message::Message;

/// The outcome of attempting to enqueue a message onto a bounded edge.
///
/// Not an error: every variant is a legitimate result of a `try_put`,
/// and callers are expected to match on it rather than unwrap an `Ok`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PutResult {
    /// The message was appended; the queue had room.
    Ok,
    /// The queue was full and the policy is [`Policy::Block`]; the
    /// caller must retry.
    Blocked,
    /// The queue was full and the policy is [`Policy::Drop`]; the
    /// message was discarded.
    Dropped,
    /// The queue was full and the policy is [`Policy::Latest`]; the
    /// tail element was replaced with the new message.
    Replaced,
    /// The queue was full and the policy is [`Policy::Coalesce`]; the
    /// tail element was merged with the new message.
    Coalesced,
}

/// Function merging a queued message with an incoming one for the
/// [`Policy::Coalesce`] overflow policy.
pub type CoalesceFn = Arc<dyn Fn(&Message, &Message) -> Message + Send + Sync>;

/// What an [`crate::Edge`] does when a `try_put` arrives and the
/// queue is already at capacity.
#[derive(Clone)]
pub enum Policy {
    /// Reject the put; the caller is expected to retry later.
    Block,
    /// Discard the incoming message, leaving the queue unchanged.
    Drop,
    /// Discard the queue's tail message and enqueue the new one in
    /// its place.
    Latest,
    /// Merge the incoming message into the queue's tail message using
    /// the given function. If the function panics or the merge
    /// otherwise cannot be completed, the incoming message replaces the
    /// tail unchanged rather than being lost, and the outcome is still
    /// reported as coalesced.
    Coalesce(CoalesceFn),
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Policy::Block => write!(f, "Policy::Block"),
            Policy::Drop => write!(f, "Policy::Drop"),
            Policy::Latest => write!(f, "Policy::Latest"),
            Policy::Coalesce(_) => write!(f, "Policy::Coalesce(..)"),
        }
    }
}

impl Policy {
    /// Applies this policy to a full queue's tail slot, given the
    /// incoming message. Returns the message to install in the tail
    /// slot (if any) and the [`PutResult`] to report.
    pub(crate) fn on_full(&self, tail: &Message, incoming: Message) -> (Option<Message>, PutResult) {
        match self {
            Policy::Block => (None, PutResult::Blocked),
            Policy::Drop => (None, PutResult::Dropped),
            Policy::Latest => (Some(incoming), PutResult::Replaced),
            Policy::Coalesce(merge) => {
                let merged = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| merge(tail, &incoming)));
                match merged {
                    Ok(message) => (Some(message), PutResult::Coalesced),
                    Err(_) => (Some(incoming), PutResult::Coalesced),
                }
            }
        }
    }
}

impl Default for Policy {
    fn default() -> Self {
        Policy::Latest
    }
}
