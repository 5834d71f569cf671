//! Conversation store.
//!
//! Holds every conversation of the signed-in user and reconciles three
//! sources of change: REST snapshots, realtime deltas from the transport,
//! and optimistic local sends. Mutations return the outbound events they
//! produced (read receipts, send requests) and never perform I/O.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use tasker_net::{NetError, RestApi};
use tasker_shared::protocol::{
    OutboundEvent, OutgoingMessage, ReceivedMessage, SendAck, TypingSignal,
};
use tasker_shared::rest::{ConversationSnapshot, Participant};
use tasker_shared::{ConversationId, MessageId, MessageStatus, ServerMessageId, UserId};

use crate::error::{Result, StoreError};
use crate::models::{Conversation, LoadState, Message};

/// What `apply_inbound_message` did with an event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundOutcome {
    /// A message with this server id is already stored.
    Duplicate,
    /// The event is the server echo of one of our pending sends.
    Reconciled,
    Appended {
        /// Present when the conversation is active and the message was
        /// auto-read.
        read_receipt: Option<OutboundEvent>,
        /// The conversation was not known and got created from the event.
        new_conversation: bool,
    },
}

pub struct ConversationStore {
    self_id: UserId,
    /// Kept sorted by recency.
    conversations: Vec<Conversation>,
    active: Option<ConversationId>,
    /// Set once anything other than a snapshot changed state. From then on
    /// snapshots merge instead of replacing.
    diverged: bool,
    load_state: LoadState,
}

impl ConversationStore {
    pub fn new(self_id: UserId) -> Self {
        Self {
            self_id,
            conversations: Vec::new(),
            active: None,
            diverged: false,
            load_state: LoadState::Idle,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn self_id(&self) -> &UserId {
        &self.self_id
    }

    /// All conversations, most recent first.
    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == *id)
    }

    pub fn active(&self) -> Option<&ConversationId> {
        self.active.as_ref()
    }

    /// Number of conversations with an unread inbound message.
    pub fn unread_count(&self) -> usize {
        self.conversations.iter().filter(|c| c.unread).count()
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    fn index_of(&self, id: &ConversationId) -> Option<usize> {
        self.conversations.iter().position(|c| c.id == *id)
    }

    // -----------------------------------------------------------------------
    // Snapshots
    // -----------------------------------------------------------------------

    /// Fetch the conversation list and apply it.
    ///
    /// On failure the current conversations are kept and the load state
    /// records the error.
    pub async fn load_snapshot<A: RestApi + ?Sized>(&mut self, api: &A) -> Result<Vec<OutboundEvent>> {
        self.begin_load();
        match api.fetch_conversations(&self.self_id).await {
            Ok(snapshots) => Ok(self.apply_snapshot(snapshots)),
            Err(e) => {
                self.fail_load(&e);
                Err(e.into())
            }
        }
    }

    pub fn begin_load(&mut self) {
        self.load_state = LoadState::Loading;
    }

    pub fn fail_load(&mut self, err: &NetError) {
        warn!(error = %err, kept = self.conversations.len(), "Conversation fetch failed");
        self.load_state = LoadState::failed(err);
    }

    /// Apply a conversation list from the REST API.
    ///
    /// Replaces local state until the first realtime or local change, merges
    /// afterwards. Returns read receipts when the active conversation turns
    /// out to have unread messages.
    pub fn apply_snapshot(&mut self, snapshots: Vec<ConversationSnapshot>) -> Vec<OutboundEvent> {
        let count = snapshots.len();
        if !self.diverged {
            self.conversations.clear();
        }

        for snapshot in snapshots {
            let incoming = Conversation::from_snapshot(snapshot, &self.self_id);
            match self.index_of(&incoming.id) {
                Some(idx) => self.conversations[idx].merge_snapshot(incoming),
                None => self.conversations.push(incoming),
            }
        }

        let mut receipts = Vec::new();
        if let Some(idx) = self.active.as_ref().and_then(|id| self.index_of(id)) {
            if self.conversations[idx].unread {
                receipts.extend(self.mark_read_at(idx));
            }
        }

        self.sort();
        self.load_state = LoadState::Ready;
        info!(
            conversations = count,
            merged = self.diverged,
            unread = self.unread_count(),
            "Applied conversation snapshot"
        );
        receipts
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// Make `id` the active conversation.
    ///
    /// When it has unread messages they are marked read locally and one
    /// receipt for the latest inbound message is returned.
    pub fn select_conversation(&mut self, id: &ConversationId) -> Result<Option<OutboundEvent>> {
        let idx = self
            .index_of(id)
            .ok_or_else(|| StoreError::UnknownConversation(id.clone()))?;
        self.active = Some(id.clone());
        debug!(conversation = %id, "Conversation selected");

        if !self.conversations[idx].unread {
            return Ok(None);
        }
        Ok(self.mark_read_at(idx))
    }

    pub fn deselect(&mut self) {
        self.active = None;
    }

    fn is_active(&self, id: &ConversationId) -> bool {
        self.active.as_ref() == Some(id)
    }

    fn mark_read_at(&mut self, idx: usize) -> Option<OutboundEvent> {
        self.diverged = true;
        let conv = &mut self.conversations[idx];
        let latest = conv.mark_inbound_read();
        conv.refresh();
        latest.map(|message_id| OutboundEvent::read_receipt(conv.id.clone(), message_id))
    }

    // -----------------------------------------------------------------------
    // Local sends
    // -----------------------------------------------------------------------

    /// Optimistically append a text message. Returns the pending id and the
    /// event to hand to the transport.
    pub fn send_message(
        &mut self,
        conversation_id: &ConversationId,
        text: &str,
    ) -> Result<(MessageId, OutboundEvent)> {
        let text = text.trim();
        if text.is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        self.push_outgoing(conversation_id, Some(text.to_string()), None, None)
    }

    /// Optimistically append an image message. `image_ref` is the already
    /// uploaded image URL.
    pub fn send_image(
        &mut self,
        conversation_id: &ConversationId,
        image_ref: &str,
        image_type: Option<String>,
    ) -> Result<(MessageId, OutboundEvent)> {
        if image_ref.trim().is_empty() {
            return Err(StoreError::EmptyMessage);
        }
        self.push_outgoing(conversation_id, None, Some(image_ref.to_string()), image_type)
    }

    fn push_outgoing(
        &mut self,
        conversation_id: &ConversationId,
        text: Option<String>,
        image: Option<String>,
        image_type: Option<String>,
    ) -> Result<(MessageId, OutboundEvent)> {
        let idx = self
            .index_of(conversation_id)
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.clone()))?;
        if self.conversations[idx].archived {
            return Err(StoreError::Archived(conversation_id.clone()));
        }

        self.diverged = true;
        let id = MessageId::new_pending();
        let client_message_id = id.pending_id();
        let conv = &mut self.conversations[idx];

        // Never place a fresh send before the current tail because of clock
        // skew against server timestamps.
        let now = Utc::now();
        let sent_at = conv.last_message_time.map_or(now, |last| now.max(last));

        conv.insert(Message {
            id: id.clone(),
            sender_id: self.self_id.clone(),
            text: text.clone(),
            image: image.clone(),
            sent_at,
            status: MessageStatus::Sending,
        });
        conv.refresh();

        let event = OutboundEvent::SendMessage(OutgoingMessage {
            conversation_id: conv.id.clone(),
            receiver_id: conv.counterpart.id.clone(),
            message: text,
            image_url: image,
            image_type,
            client_message_id,
        });
        debug!(conversation = %conversation_id, id = %id, "Queued optimistic send");
        self.sort();
        Ok((id, event))
    }

    /// Mark a pending send failed, e.g. because the transport refused it.
    pub fn fail_pending(&mut self, conversation_id: &ConversationId, id: &MessageId) -> bool {
        let Some(idx) = self.index_of(conversation_id) else {
            return false;
        };
        let conv = &mut self.conversations[idx];
        let Some(message) = conv.message_mut(id) else {
            return false;
        };
        if !message.id.is_pending() || message.status.is_terminal() {
            return false;
        }
        message.status = message.status.merge(MessageStatus::Failed);
        warn!(conversation = %conversation_id, id = %id, "Send failed");
        true
    }

    // -----------------------------------------------------------------------
    // Realtime deltas
    // -----------------------------------------------------------------------

    pub fn apply_inbound_message(&mut self, event: ReceivedMessage) -> InboundOutcome {
        self.diverged = true;
        let from_self = event.sender_id == self.self_id;
        let is_active = self.is_active(&event.conversation_id);

        let (idx, created) = match self.index_of(&event.conversation_id) {
            Some(idx) => (idx, false),
            None => {
                let counterpart = Participant {
                    id: if from_self {
                        UserId::default()
                    } else {
                        event.sender_id.clone()
                    },
                    ..Participant::default()
                };
                info!(conversation = %event.conversation_id, "Message for unknown conversation, creating it");
                self.conversations.push(Conversation::new(
                    event.conversation_id.clone(),
                    self.self_id.clone(),
                    counterpart,
                ));
                (self.conversations.len() - 1, true)
            }
        };

        let server_id = MessageId::Confirmed(event.message_id.clone());
        let conv = &mut self.conversations[idx];
        if conv.contains(&server_id) {
            debug!(conversation = %event.conversation_id, id = %event.message_id, "Duplicate message dropped");
            return InboundOutcome::Duplicate;
        }

        if let (true, Some(pending)) = (from_self, event.client_message_id) {
            if let Some(pos) = conv.position(&MessageId::Pending(pending)) {
                let message = &mut conv.messages[pos];
                message.id = server_id;
                message.status = message.status.merge(MessageStatus::Sent);
                conv.settle_early_status(pos);
                conv.refresh();
                self.sort();
                return InboundOutcome::Reconciled;
            }
        }

        let status = if from_self {
            MessageStatus::Sent
        } else if is_active {
            MessageStatus::Read
        } else {
            MessageStatus::Delivered
        };
        conv.insert(Message {
            id: server_id,
            sender_id: event.sender_id.clone(),
            text: event.message,
            image: event.image,
            sent_at: event.time.unwrap_or_else(Utc::now),
            status,
        });
        conv.refresh();

        let read_receipt = (!from_self && is_active)
            .then(|| OutboundEvent::read_receipt(conv.id.clone(), event.message_id.clone()));
        debug!(
            conversation = %event.conversation_id,
            id = %event.message_id,
            unread = conv.unread,
            "Message received"
        );
        self.sort();
        InboundOutcome::Appended {
            read_receipt,
            new_conversation: created,
        }
    }

    /// Reconcile a pending send with the server's acknowledgment.
    ///
    /// The pending message is found by the echoed client id, or failing
    /// that, it is the most recent `sending` message of the conversation.
    pub fn apply_send_ack(&mut self, ack: SendAck) -> bool {
        self.diverged = true;
        let Some(idx) = self.index_of(&ack.conversation_id) else {
            warn!(conversation = %ack.conversation_id, "Send ack for unknown conversation");
            return false;
        };
        let conv = &mut self.conversations[idx];

        let by_client_id = ack
            .client_message_id
            .and_then(|id| conv.position(&MessageId::Pending(id)));
        let pos = by_client_id.or_else(|| {
            conv.messages
                .iter()
                .rposition(|m| m.id.is_pending() && m.status == MessageStatus::Sending)
        });
        let Some(pos) = pos else {
            debug!(conversation = %ack.conversation_id, "Send ack without pending message");
            return false;
        };

        if !ack.success {
            let failure = match ack.status {
                Some(MessageStatus::Rejected) => MessageStatus::Rejected,
                _ => MessageStatus::Failed,
            };
            let message = &mut conv.messages[pos];
            message.status = message.status.merge(failure);
            warn!(conversation = %ack.conversation_id, status = %message.status, "Send rejected by server");
        } else {
            let status = ack
                .status
                .filter(|s| !s.is_failure())
                .unwrap_or(MessageStatus::Sent);
            match ack.message_id {
                Some(server_id) => {
                    let confirmed = MessageId::Confirmed(server_id);
                    match conv.position(&confirmed) {
                        // The echo or a snapshot already delivered the
                        // confirmed copy; drop the placeholder.
                        Some(existing) => {
                            let merged = conv.messages[existing].status.merge(status);
                            conv.messages[existing].status = merged;
                            conv.messages.remove(pos);
                        }
                        None => {
                            let message = &mut conv.messages[pos];
                            if message.status.is_terminal() {
                                warn!(
                                    conversation = %ack.conversation_id,
                                    id = %confirmed,
                                    status = %message.status,
                                    "Late ack for a send already given up on, keeping its status"
                                );
                            }
                            message.id = confirmed;
                            message.status = message.status.merge(status);
                            conv.settle_early_status(pos);
                        }
                    }
                }
                None => {
                    let message = &mut conv.messages[pos];
                    message.status = message.status.merge(status);
                }
            }
        }

        conv.refresh();
        self.sort();
        true
    }

    /// Forward-only status change for a confirmed message. A status for an
    /// id not stored yet is held until the ack, echo or snapshot brings it.
    pub fn apply_status_update(
        &mut self,
        message_id: &ServerMessageId,
        conversation_id: &ConversationId,
        status: MessageStatus,
    ) -> bool {
        self.diverged = true;
        let Some(idx) = self.index_of(conversation_id) else {
            debug!(conversation = %conversation_id, "Status update for unknown conversation");
            return false;
        };
        let conv = &mut self.conversations[idx];
        let Some(pos) = conv.position(&MessageId::Confirmed(message_id.clone())) else {
            // The ack or echo introducing this id may still be on its way.
            debug!(conversation = %conversation_id, id = %message_id, status = %status, "Holding status for unknown message");
            conv.buffer_status(message_id.clone(), status);
            return false;
        };
        let message = &mut conv.messages[pos];

        let merged = message.status.merge(status);
        if merged == message.status {
            return false;
        }
        message.status = merged;
        conv.refresh();
        true
    }

    /// Counterpart typing indicator. Events about self are ignored.
    pub fn apply_typing(
        &mut self,
        conversation_id: &ConversationId,
        counterpart_id: &UserId,
        is_typing: bool,
        now: DateTime<Utc>,
    ) -> bool {
        if *counterpart_id == self.self_id {
            return false;
        }
        let Some(idx) = self.index_of(conversation_id) else {
            return false;
        };
        self.diverged = true;
        let conv = &mut self.conversations[idx];
        conv.typing = is_typing;
        conv.typing_since = is_typing.then_some(now);
        true
    }

    /// Build the typing signal for self.
    pub fn set_typing(&self, conversation_id: &ConversationId, is_typing: bool) -> Result<OutboundEvent> {
        let conv = self
            .get(conversation_id)
            .ok_or_else(|| StoreError::UnknownConversation(conversation_id.clone()))?;
        if conv.archived {
            return Err(StoreError::Archived(conversation_id.clone()));
        }
        Ok(OutboundEvent::Typing(TypingSignal {
            conversation_id: conv.id.clone(),
            receiver_id: conv.counterpart.id.clone(),
            is_typing,
        }))
    }

    // -----------------------------------------------------------------------
    // Maintenance
    // -----------------------------------------------------------------------

    /// Clear typing flags older than `ttl`. Returns the affected ids.
    pub fn expire_typing(&mut self, now: DateTime<Utc>, ttl: Duration) -> Vec<ConversationId> {
        let mut expired = Vec::new();
        for conv in &mut self.conversations {
            if conv.typing && conv.typing_since.map_or(true, |since| now - since >= ttl) {
                conv.typing = false;
                conv.typing_since = None;
                expired.push(conv.id.clone());
            }
        }
        expired
    }

    /// Fail pending sends that were not acknowledged within `timeout`.
    pub fn expire_pending(
        &mut self,
        now: DateTime<Utc>,
        timeout: Duration,
    ) -> Vec<(ConversationId, MessageId)> {
        let mut failed = Vec::new();
        for conv in &mut self.conversations {
            for message in conv.messages.iter_mut() {
                if message.id.is_pending()
                    && message.status == MessageStatus::Sending
                    && now - message.sent_at >= timeout
                {
                    message.status = MessageStatus::Failed;
                    failed.push((conv.id.clone(), message.id.clone()));
                }
            }
        }
        if !failed.is_empty() {
            warn!(count = failed.len(), "Pending sends timed out");
        }
        failed
    }

    /// Most recent first; ties by last message id; empty conversations last.
    fn sort(&mut self) {
        self.conversations.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| b.last_message_id.cmp(&a.last_message_id))
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    use tasker_net::Result as NetResult;
    use tasker_shared::protocol::StatusReceipt;
    use tasker_shared::rest::NotificationPage;
    use tasker_shared::NotificationId;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn me() -> UserId {
        UserId::from("me")
    }

    fn c(id: &str) -> ConversationId {
        ConversationId::from(id)
    }

    fn snapshot(value: serde_json::Value) -> Vec<ConversationSnapshot> {
        serde_json::from_value(value).unwrap()
    }

    /// C1 with one delivered inbound message m1 from ana.
    fn store_with_c1() -> ConversationStore {
        let mut store = ConversationStore::new(me());
        store.apply_snapshot(snapshot(json!([{
            "id": "C1",
            "recipient": {"id": "ana", "name": "Ana"},
            "messages": [{"id": "m1", "sender_id": "ana", "message": "Can you start tomorrow?",
                          "time": at(0), "status": "delivered"}]
        }])));
        store
    }

    fn inbound(conv: &str, id: &str, sender: &str, secs: i64) -> ReceivedMessage {
        ReceivedMessage {
            conversation_id: c(conv),
            message_id: ServerMessageId::from(id),
            sender_id: UserId::from(sender),
            message: Some(format!("text {id}")),
            image: None,
            time: Some(at(secs)),
            client_message_id: None,
        }
    }

    fn confirmed_id(id: u64) -> MessageId {
        MessageId::Confirmed(ServerMessageId::from(id))
    }

    fn ack(conv: &str, id: u64) -> SendAck {
        SendAck {
            conversation_id: c(conv),
            message_id: Some(ServerMessageId::from(id)),
            status: Some(MessageStatus::Sent),
            success: true,
            client_message_id: None,
        }
    }

    fn assert_sorted(store: &ConversationStore) {
        for pair in store.conversations().windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            assert!(
                (a.last_message_time, &a.last_message_id) >= (b.last_message_time, &b.last_message_id),
                "{} before {}",
                a.id,
                b.id
            );
        }
    }

    fn assert_unread_invariant(store: &ConversationStore) {
        for conv in store.conversations() {
            let expected = conv
                .latest_inbound()
                .map_or(false, |m| m.status != MessageStatus::Read);
            assert_eq!(conv.unread, expected, "unread for {}", conv.id);
        }
    }

    #[test]
    fn test_snapshot_marks_unread() {
        let store = store_with_c1();
        let conv = store.get(&c("C1")).unwrap();
        assert!(conv.unread);
        assert_eq!(conv.counterpart.name, "Ana");
        assert_eq!(conv.last_message_preview, "Can you start tomorrow?");
        assert_eq!(store.unread_count(), 1);
        assert_eq!(store.load_state(), &LoadState::Ready);
    }

    #[test]
    fn test_select_clears_unread_and_emits_one_receipt() {
        let mut store = store_with_c1();

        let receipt = store.select_conversation(&c("C1")).unwrap();
        assert_eq!(
            receipt,
            Some(OutboundEvent::MessageStatus(StatusReceipt {
                conversation_id: c("C1"),
                message_id: ServerMessageId::from("m1"),
                status: MessageStatus::Read,
            }))
        );
        assert!(!store.get(&c("C1")).unwrap().unread);

        // Selecting again has nothing left to confirm.
        assert_eq!(store.select_conversation(&c("C1")).unwrap(), None);
        assert_unread_invariant(&store);
    }

    #[test]
    fn test_select_unknown_conversation_fails() {
        let mut store = store_with_c1();
        let err = store.select_conversation(&c("nope")).unwrap_err();
        assert!(matches!(err, StoreError::UnknownConversation(_)));
        assert_eq!(store.active(), None);
    }

    #[test]
    fn test_send_is_optimistic_and_ack_reconciles_latest_pending() {
        let mut store = store_with_c1();

        let (pending, event) = store.send_message(&c("C1"), "  hi ").unwrap();
        assert!(pending.is_pending());
        match &event {
            OutboundEvent::SendMessage(out) => {
                assert_eq!(out.message.as_deref(), Some("hi"));
                assert_eq!(out.receiver_id, UserId::from("ana"));
                assert_eq!(out.client_message_id, pending.pending_id());
            }
            other => panic!("unexpected event {other:?}"),
        }
        let conv = store.get(&c("C1")).unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.last_message_id, Some(pending.clone()));
        assert_eq!(conv.message(&pending).unwrap().status, MessageStatus::Sending);

        assert!(store.apply_send_ack(ack("C1", 42)));

        let conv = store.get(&c("C1")).unwrap();
        let confirmed = MessageId::Confirmed(ServerMessageId::from(42));
        assert!(!conv.contains(&pending));
        assert_eq!(conv.message(&confirmed).unwrap().status, MessageStatus::Sent);
        assert_eq!(conv.last_message_id, Some(confirmed));
        assert_eq!(conv.pending_count(), 0);
    }

    #[test]
    fn test_ack_matches_echoed_client_id() {
        let mut store = store_with_c1();
        let (first, _) = store.send_message(&c("C1"), "one").unwrap();
        let (second, _) = store.send_message(&c("C1"), "two").unwrap();

        let mut a = ack("C1", 50);
        a.client_message_id = first.pending_id();
        store.apply_send_ack(a);

        let conv = store.get(&c("C1")).unwrap();
        let confirmed = conv
            .message(&MessageId::Confirmed(ServerMessageId::from(50)))
            .unwrap();
        assert_eq!(confirmed.text.as_deref(), Some("one"));
        assert_eq!(conv.message(&second).unwrap().status, MessageStatus::Sending);
    }

    #[test]
    fn test_failed_ack_marks_message_failed() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();

        store.apply_send_ack(SendAck {
            conversation_id: c("C1"),
            message_id: None,
            status: None,
            success: false,
            client_message_id: None,
        });
        let status = store.get(&c("C1")).unwrap().message(&pending).unwrap().status;
        assert_eq!(status, MessageStatus::Failed);

        // A late success cannot resurrect it.
        assert!(!store.apply_send_ack(ack("C1", 43)));
    }

    #[test]
    fn test_ack_after_echo_collapses_placeholder() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();

        // Echo without client id arrives first.
        let echo = inbound("C1", "42", "me", 5);
        assert!(matches!(
            store.apply_inbound_message(echo),
            InboundOutcome::Appended { .. }
        ));
        assert!(store.apply_send_ack(ack("C1", 42)));

        let conv = store.get(&c("C1")).unwrap();
        assert!(!conv.contains(&pending));
        let ids: Vec<_> = conv.messages.iter().map(|m| m.id.to_string()).collect();
        assert_eq!(ids, ["m1", "42"]);
    }

    #[test]
    fn test_echo_with_client_id_reconciles() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();

        let mut echo = inbound("C1", "42", "me", 5);
        echo.client_message_id = pending.pending_id();
        assert_eq!(store.apply_inbound_message(echo), InboundOutcome::Reconciled);
        assert_eq!(store.get(&c("C1")).unwrap().messages.len(), 2);
    }

    #[test]
    fn test_send_rejects_empty_unknown_and_archived() {
        let mut store = store_with_c1();
        assert!(matches!(
            store.send_message(&c("C1"), "   "),
            Err(StoreError::EmptyMessage)
        ));
        assert!(matches!(
            store.send_message(&c("C9"), "hi"),
            Err(StoreError::UnknownConversation(_))
        ));

        store.apply_snapshot(snapshot(json!([{"id": "C1", "archived": true}])));
        assert!(matches!(
            store.send_image(&c("C1"), "https://cdn/a.png", None),
            Err(StoreError::Archived(_))
        ));
    }

    #[test]
    fn test_duplicate_delivery_is_idempotent() {
        let mut store = store_with_c1();
        let first = store.apply_inbound_message(inbound("C1", "m2", "ana", 10));
        let second = store.apply_inbound_message(inbound("C1", "m2", "ana", 10));

        assert!(matches!(first, InboundOutcome::Appended { .. }));
        assert_eq!(second, InboundOutcome::Duplicate);
        let conv = store.get(&c("C1")).unwrap();
        let copies = conv
            .messages
            .iter()
            .filter(|m| m.id == MessageId::Confirmed(ServerMessageId::from("m2")))
            .count();
        assert_eq!(copies, 1);
    }

    #[test]
    fn test_inbound_unread_rules() {
        let mut store = store_with_c1();
        store.select_conversation(&c("C1")).unwrap();

        // Active conversation: auto-read with a receipt.
        match store.apply_inbound_message(inbound("C1", "m2", "ana", 10)) {
            InboundOutcome::Appended { read_receipt, .. } => assert!(read_receipt.is_some()),
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(!store.get(&c("C1")).unwrap().unread);

        // Own message elsewhere: never unread.
        store.apply_snapshot(snapshot(json!([{"id": "C2", "recipient": {"id": "bo"}}])));
        store.apply_inbound_message(inbound("C2", "m3", "me", 11));
        assert!(!store.get(&c("C2")).unwrap().unread);

        // Counterpart message in an inactive conversation: unread.
        store.apply_inbound_message(inbound("C2", "m4", "bo", 12));
        assert!(store.get(&c("C2")).unwrap().unread);
        assert_eq!(store.unread_count(), 1);
        assert_unread_invariant(&store);
        assert_sorted(&store);
    }

    #[test]
    fn test_inbound_for_unknown_conversation_creates_it() {
        let mut store = ConversationStore::new(me());
        let outcome = store.apply_inbound_message(inbound("C7", "1", "zoe", 3));
        assert_eq!(
            outcome,
            InboundOutcome::Appended {
                read_receipt: None,
                new_conversation: true
            }
        );
        let conv = store.get(&c("C7")).unwrap();
        assert_eq!(conv.counterpart_id(), &UserId::from("zoe"));
        assert!(conv.unread);
    }

    #[test]
    fn test_status_updates_only_move_forward() {
        let mut store = store_with_c1();
        store.send_message(&c("C1"), "hi").unwrap();
        store.apply_send_ack(ack("C1", 42));
        let id = ServerMessageId::from(42);
        let status = |store: &ConversationStore| {
            store
                .get(&c("C1"))
                .unwrap()
                .message(&MessageId::Confirmed(ServerMessageId::from(42)))
                .unwrap()
                .status
        };

        assert!(store.apply_status_update(&id, &c("C1"), MessageStatus::Read));
        assert!(!store.apply_status_update(&id, &c("C1"), MessageStatus::Delivered));
        assert_eq!(status(&store), MessageStatus::Read);

        assert!(!store.apply_status_update(&ServerMessageId::from(999), &c("C1"), MessageStatus::Read));
    }

    #[test]
    fn test_status_before_ack_is_kept() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();

        // The counterpart reads faster than our ack travels.
        let id = ServerMessageId::from(42);
        assert!(!store.apply_status_update(&id, &c("C1"), MessageStatus::Read));
        assert!(store.apply_send_ack(ack("C1", 42)));

        let conv = store.get(&c("C1")).unwrap();
        assert!(!conv.contains(&pending));
        assert_eq!(
            conv.message(&MessageId::Confirmed(id)).unwrap().status,
            MessageStatus::Read
        );
        assert!(conv.early_statuses.is_empty());
    }

    #[test]
    fn test_status_before_echo_is_kept() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();

        store.apply_status_update(&ServerMessageId::from(42), &c("C1"), MessageStatus::Delivered);
        let mut echo = inbound("C1", "42", "me", 5);
        echo.client_message_id = pending.pending_id();
        assert_eq!(store.apply_inbound_message(echo), InboundOutcome::Reconciled);

        // Without a client id the echo is inserted as a new message.
        store.apply_status_update(&ServerMessageId::from(43), &c("C1"), MessageStatus::Delivered);
        store.apply_status_update(&ServerMessageId::from(43), &c("C1"), MessageStatus::Read);
        store.apply_inbound_message(inbound("C1", "43", "me", 6));

        let conv = store.get(&c("C1")).unwrap();
        assert_eq!(conv.message(&confirmed_id(42)).unwrap().status, MessageStatus::Delivered);
        assert_eq!(conv.message(&confirmed_id(43)).unwrap().status, MessageStatus::Read);
        assert!(conv.early_statuses.is_empty());
    }

    #[test]
    fn test_status_before_snapshot_is_kept() {
        let mut store = store_with_c1();
        store.apply_status_update(&ServerMessageId::from(77), &c("C1"), MessageStatus::Read);

        store.apply_snapshot(snapshot(json!([{
            "id": "C1",
            "recipient": {"id": "ana"},
            "messages": [
                {"id": "m1", "sender_id": "ana", "time": at(0), "status": "delivered"},
                {"id": 77, "sender_id": "me", "time": at(3), "status": "sent"}
            ]
        }])));

        let conv = store.get(&c("C1")).unwrap();
        assert_eq!(conv.message(&confirmed_id(77)).unwrap().status, MessageStatus::Read);
    }

    #[test]
    fn test_late_ack_after_timeout_keeps_failed() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();
        let sent_at = store.get(&c("C1")).unwrap().message(&pending).unwrap().sent_at;
        store.expire_pending(sent_at + Duration::seconds(30), Duration::seconds(30));

        let mut late = ack("C1", 42);
        late.client_message_id = pending.pending_id();
        assert!(store.apply_send_ack(late));

        let conv = store.get(&c("C1")).unwrap();
        assert_eq!(conv.pending_count(), 0);
        assert_eq!(conv.message(&confirmed_id(42)).unwrap().status, MessageStatus::Failed);
    }

    #[test]
    fn test_typing_indicator() {
        let mut store = store_with_c1();
        let ana = UserId::from("ana");

        assert!(store.apply_typing(&c("C1"), &ana, true, at(0)));
        assert!(store.get(&c("C1")).unwrap().typing);

        assert!(store.apply_typing(&c("C1"), &ana, false, at(1)));
        assert!(!store.get(&c("C1")).unwrap().typing);

        // Our own typing echo is ignored entirely.
        assert!(!store.apply_typing(&c("C1"), &me(), true, at(2)));
        assert!(!store.get(&c("C1")).unwrap().typing);
    }

    #[test]
    fn test_typing_expires_after_ttl() {
        let mut store = store_with_c1();
        store.apply_typing(&c("C1"), &UserId::from("ana"), true, at(0));

        assert!(store.expire_typing(at(5), Duration::seconds(6)).is_empty());
        assert_eq!(store.expire_typing(at(6), Duration::seconds(6)), vec![c("C1")]);
        assert!(!store.get(&c("C1")).unwrap().typing);
    }

    #[test]
    fn test_set_typing_targets_counterpart() {
        let store = store_with_c1();
        match store.set_typing(&c("C1"), true).unwrap() {
            OutboundEvent::Typing(signal) => {
                assert_eq!(signal.receiver_id, UserId::from("ana"));
                assert!(signal.is_typing);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_pending_send_times_out() {
        let mut store = store_with_c1();
        let (pending, _) = store.send_message(&c("C1"), "hi").unwrap();
        let sent_at = store.get(&c("C1")).unwrap().message(&pending).unwrap().sent_at;

        assert!(store
            .expire_pending(sent_at + Duration::seconds(29), Duration::seconds(30))
            .is_empty());
        let failed = store.expire_pending(sent_at + Duration::seconds(30), Duration::seconds(30));
        assert_eq!(failed, vec![(c("C1"), pending.clone())]);
        let status = store.get(&c("C1")).unwrap().message(&pending).unwrap().status;
        assert_eq!(status, MessageStatus::Failed);
    }

    #[test]
    fn test_sort_by_recency_with_id_tie_break() {
        let mut store = ConversationStore::new(me());
        store.apply_snapshot(snapshot(json!([
            {"id": "empty"},
            {"id": "old", "messages": [{"id": 1, "sender_id": "a", "time": at(0)}]},
            {"id": "tie-low", "messages": [{"id": 5, "sender_id": "b", "time": at(10)}]},
            {"id": "tie-high", "messages": [{"id": 12, "sender_id": "c", "time": at(10)}]}
        ])));
        let order: Vec<_> = store.conversations().iter().map(|c| c.id.to_string()).collect();
        assert_eq!(order, ["tie-high", "tie-low", "old", "empty"]);

        store.apply_inbound_message(inbound("old", "20", "a", 30));
        assert_eq!(store.conversations()[0].id, c("old"));
        assert_sorted(&store);
    }

    #[test]
    fn test_snapshot_after_realtime_merges() {
        let mut store = store_with_c1();
        store.apply_inbound_message(inbound("C1", "m2", "ana", 10));
        let (pending, _) = store.send_message(&c("C1"), "on my way").unwrap();
        store.apply_typing(&c("C1"), &UserId::from("ana"), true, at(11));

        // Stale snapshot: only m1, with an older status than we hold.
        store.apply_snapshot(snapshot(json!([{
            "id": "C1",
            "recipient": {"id": "ana", "name": "Ana B."},
            "messages": [{"id": "m1", "sender_id": "ana", "time": at(0), "status": "sent"}]
        }])));

        let conv = store.get(&c("C1")).unwrap();
        assert_eq!(conv.messages.len(), 3);
        assert!(conv.contains(&pending));
        assert!(conv.typing);
        assert_eq!(conv.counterpart.name, "Ana B.");
        assert_eq!(
            conv.message(&MessageId::Confirmed(ServerMessageId::from("m1")))
                .unwrap()
                .status,
            MessageStatus::Delivered
        );
    }

    #[test]
    fn test_snapshot_before_realtime_replaces() {
        let mut store = store_with_c1();
        store.apply_snapshot(snapshot(json!([{"id": "C2"}])));
        assert!(store.get(&c("C1")).is_none());
        assert_eq!(store.conversations().len(), 1);
    }

    #[test]
    fn test_snapshot_marks_active_conversation_read() {
        let mut store = store_with_c1();
        store.select_conversation(&c("C1")).unwrap();
        let receipts = store.apply_snapshot(snapshot(json!([{
            "id": "C1",
            "messages": [{"id": "m9", "sender_id": "ana", "time": at(50), "status": "delivered"}]
        }])));
        assert_eq!(receipts.len(), 1);
        assert!(!store.get(&c("C1")).unwrap().unread);
    }

    struct FailingApi;

    #[async_trait]
    impl RestApi for FailingApi {
        async fn fetch_conversations(&self, _self_id: &UserId) -> NetResult<Vec<ConversationSnapshot>> {
            Err(NetError::Status {
                status: 502,
                url: "/conversations/me".to_string(),
            })
        }

        async fn fetch_notifications(&self, _page: u32, _per_page: u32) -> NetResult<NotificationPage> {
            Ok(NotificationPage::default())
        }

        async fn mark_notification_read(&self, _id: &NotificationId) -> NetResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_load_keeps_last_good_data() {
        let mut store = store_with_c1();
        let err = store.load_snapshot(&FailingApi).await.unwrap_err();

        assert!(matches!(err, StoreError::Net(NetError::Status { status: 502, .. })));
        assert!(store.get(&c("C1")).is_some());
        assert!(matches!(
            store.load_state(),
            LoadState::Failed { retryable: true, .. }
        ));
    }
}
