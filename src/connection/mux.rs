//! Message multiplexer: allocates/reserves message ids and correlates
//! responses and input prompts to pending waiters.
//!
//! An id-keyed table of one-shot channels: register a waiter keyed by a
//! message id, resolve it when a matching reply or input arrives.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::oneshot;

use crate::error::{CatsError, Result};
use crate::protocol::action::{is_broadcast_id, Action, REQUEST_REPLY_MAX};

/// How many recently resolved `message_id`s are remembered for duplicate
/// detection. Bounded so the tombstone set can't grow forever over a
/// long-lived connection; old entries fall off in FIFO order as new replies
/// resolve, which just narrows the window in which a very late duplicate is
/// still caught.
const COMPLETED_TOMBSTONE_CAPACITY: usize = 256;

/// What a handler's `ask` call resolves to.
pub enum InputResolution {
    Reply(Action),
    Cancelled,
}

struct PendingInput {
    tx: oneshot::Sender<InputResolution>,
}

/// Per-connection multiplexer state. Not `Send`-shared directly; callers
/// wrap it in an async `Mutex` (see [`crate::connection::Connection`]).
#[derive(Default)]
pub struct Multiplexer {
    next_id: u16,
    /// message_ids currently in flight in the request/reply half-range,
    /// whether locally originated (awaiting reply) or peer originated
    /// (being handled).
    active: HashSet<u16>,
    /// Waiters for a reply to a locally originated request.
    reply_waiters: HashMap<u16, oneshot::Sender<Action>>,
    /// Waiters for an `ask()` issued by a handler processing message_id.
    pending_inputs: HashMap<u16, PendingInput>,
    /// Ids whose reply already resolved, kept a while so a stray duplicate
    /// reply is recognized as one instead of misread as a fresh request.
    completed: HashSet<u16>,
    completed_order: VecDeque<u16>,
}

impl Multiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh outbound message_id from the request/reply
    /// half-range, skipping ids already in flight.
    pub fn allocate_message_id(&mut self) -> Result<u16> {
        for _ in 0..=REQUEST_REPLY_MAX {
            let candidate = self.next_id;
            self.next_id = if self.next_id >= REQUEST_REPLY_MAX { 0 } else { self.next_id + 1 };
            if !self.active.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(CatsError::protocol("message id space exhausted"))
    }

    /// Register a waiter for `message_id` before sending the request that
    /// owns it, marking it active.
    pub fn register_reply_waiter(&mut self, message_id: u16, tx: oneshot::Sender<Action>) -> Result<()> {
        if self.active.contains(&message_id) {
            return Err(CatsError::protocol(format!("message_id {message_id:#06x} already in flight")));
        }
        self.active.insert(message_id);
        self.reply_waiters.insert(message_id, tx);
        Ok(())
    }

    /// Reserve an inbound request's id so a concurrent allocation can't
    /// collide with it while the handler is dispatched.
    pub fn reserve_incoming(&mut self, message_id: u16) {
        self.active.insert(message_id);
    }

    pub fn release(&mut self, message_id: u16) {
        self.active.remove(&message_id);
        self.reply_waiters.remove(&message_id);
        self.pending_inputs.remove(&message_id);
    }

    pub fn is_active(&self, message_id: u16) -> bool {
        self.active.contains(&message_id)
    }

    pub fn register_pending_input(&mut self, message_id: u16, tx: oneshot::Sender<InputResolution>) {
        self.pending_inputs.insert(message_id, PendingInput { tx });
    }

    /// Classify an inbound `Action`/`StreamAction` by its message_id.
    ///
    /// Takes `&mut self`: a hit against the `completed` tombstone set is
    /// consumed here, so exactly the next arrival for a resolved id is
    /// reported `Duplicate` rather than every one forever (which would
    /// otherwise permanently block a legitimate future reuse of the id).
    pub fn classify(&mut self, message_id: u16) -> Classification {
        if is_broadcast_id(message_id) {
            return Classification::Broadcast;
        }
        if self.reply_waiters.contains_key(&message_id) {
            return Classification::Reply;
        }
        if self.active.contains(&message_id) {
            // Active but not a reply-waiter: either the request itself
            // (handled elsewhere) or a duplicate reply to an id no longer
            // awaiting one.
            return Classification::Duplicate;
        }
        if self.completed.remove(&message_id) {
            return Classification::Duplicate;
        }
        Classification::NewRequest
    }

    fn mark_completed(&mut self, message_id: u16) {
        if self.completed.insert(message_id) {
            self.completed_order.push_back(message_id);
            if self.completed_order.len() > COMPLETED_TOMBSTONE_CAPACITY {
                if let Some(evicted) = self.completed_order.pop_front() {
                    self.completed.remove(&evicted);
                }
            }
        }
    }

    /// Wake the waiter for a reply, consuming it. Errors if none is
    /// registered (a duplicate reply).
    pub fn resolve_reply(&mut self, message_id: u16, action: Action) -> Result<()> {
        let tx = self
            .reply_waiters
            .remove(&message_id)
            .ok_or_else(|| CatsError::protocol(format!("reply for unknown message_id {message_id:#06x}")))?;
        self.active.remove(&message_id);
        self.mark_completed(message_id);
        let _ = tx.send(action);
        Ok(())
    }

    /// Resolve the `ask()` waiter registered against `message_id` with the
    /// peer's `InputAction` reply.
    pub fn resolve_input(&mut self, message_id: u16, action: Action) -> Result<()> {
        let pending = self
            .pending_inputs
            .remove(&message_id)
            .ok_or_else(|| CatsError::protocol(format!("input reply with no pending waiter for {message_id:#06x}")))?;
        let _ = pending.tx.send(InputResolution::Reply(action));
        Ok(())
    }

    /// Resolve the `ask()` waiter as cancelled, in response to an inbound
    /// `CancelInputAction`.
    pub fn resolve_cancel(&mut self, message_id: u16) -> Result<()> {
        if let Some(pending) = self.pending_inputs.remove(&message_id) {
            let _ = pending.tx.send(InputResolution::Cancelled);
        }
        // A cancel with no pending input is not an error: the handler may
        // have already resolved its own `ask` racing with this message.
        Ok(())
    }

    /// Cancel every pending input/reply waiter. Called on the transition to
    /// closed: all pending waiters resolve to a cancellation rather than
    /// hanging forever.
    pub fn cancel_all(&mut self) {
        for (_, pending) in self.pending_inputs.drain() {
            let _ = pending.tx.send(InputResolution::Cancelled);
        }
        self.reply_waiters.clear();
        self.active.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Reply,
    Broadcast,
    NewRequest,
    Duplicate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::action::ActionHead;
    use crate::headers::Headers;

    fn dummy_action(message_id: u16) -> Action {
        Action::Action {
            head: ActionHead { handler_id: 0, message_id, send_time: 0, data_type: 0, compressor: 0, data_len: 0 },
            headers: Headers::new(),
            payload: vec![],
        }
    }

    #[test]
    fn allocate_skips_active_ids() {
        let mut mux = Multiplexer::new();
        let (tx, _rx) = oneshot::channel();
        let first = mux.allocate_message_id().unwrap();
        mux.register_reply_waiter(first, tx).unwrap();
        let second = mux.allocate_message_id().unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn resolve_reply_wakes_waiter() {
        let mut mux = Multiplexer::new();
        let (tx, rx) = oneshot::channel();
        mux.register_reply_waiter(0x42, tx).unwrap();
        mux.resolve_reply(0x42, dummy_action(0x42)).unwrap();
        let action = rx.await.unwrap();
        assert_eq!(action.message_id(), Some(0x42));
    }

    #[test]
    fn duplicate_reply_is_protocol_error() {
        let mut mux = Multiplexer::new();
        let (tx, _rx) = oneshot::channel();
        mux.register_reply_waiter(0x42, tx).unwrap();
        mux.resolve_reply(0x42, dummy_action(0x42)).unwrap();
        assert!(mux.resolve_reply(0x42, dummy_action(0x42)).is_err());
    }

    #[test]
    fn classify_broadcast_range() {
        let mut mux = Multiplexer::new();
        assert_eq!(mux.classify(0x8000), Classification::Broadcast);
    }

    #[test]
    fn classify_new_request_when_not_active() {
        let mut mux = Multiplexer::new();
        assert_eq!(mux.classify(0x10), Classification::NewRequest);
    }

    #[test]
    fn stray_duplicate_after_resolve_is_not_a_new_request() {
        let mut mux = Multiplexer::new();
        let (tx, _rx) = oneshot::channel();
        mux.register_reply_waiter(0x42, tx).unwrap();
        mux.resolve_reply(0x42, dummy_action(0x42)).unwrap();

        // A stray retransmit of the same reply arrives after resolution:
        // both `reply_waiters` and `active` are empty for this id, but the
        // tombstone should still flag it as a duplicate rather than routing
        // it to a freshly spawned handler.
        assert_eq!(mux.classify(0x42), Classification::Duplicate);

        // The tombstone is consumed by that one detection; a later
        // legitimate reuse of the same id is classified as new again.
        assert_eq!(mux.classify(0x42), Classification::NewRequest);
    }

    #[tokio::test]
    async fn cancel_all_resolves_pending_inputs() {
        let mut mux = Multiplexer::new();
        let (tx, rx) = oneshot::channel();
        mux.register_pending_input(0x01, tx);
        mux.cancel_all();
        match rx.await.unwrap() {
            InputResolution::Cancelled => {}
            _ => panic!("expected cancellation"),
        }
    }
}
