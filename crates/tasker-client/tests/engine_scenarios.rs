//! End-to-end scenarios through `Client`: in-memory transport, fake REST API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::time::timeout;

use tasker_client::{Client, ClientConfig, EngineHandle, EngineView, UiEvent};
use tasker_net::{Connector, Link, NetError, RemoteEnd, RestApi};
use tasker_shared::rest::{ConversationSnapshot, NotificationPage, NotificationRecord};
use tasker_shared::{
    ConnectionState, ConversationId, MessageId, MessageStatus, NotificationId, ServerMessageId,
    UserId,
};
use tasker_store::{Conversation, LoadState, ToastId};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

struct FakeApi {
    conversations: Value,
    conversation_fetches: AtomicUsize,
    read_calls: Mutex<Vec<NotificationId>>,
}

impl FakeApi {
    fn new() -> Self {
        Self {
            conversations: json!([{
                "id": "C1",
                "recipient": {"id": "ana", "name": "Ana"},
                "messages": [{"id": "m1", "sender_id": "ana", "message": "Can you start tomorrow?",
                              "time": "2024-05-01T10:00:00Z", "status": "delivered"}],
                "task": {"title": "Paint fence"}
            }]),
            conversation_fetches: AtomicUsize::new(0),
            read_calls: Mutex::new(Vec::new()),
        }
    }
}

/// Three pages of ten; page `n` has `5 - n` unread items at the front.
fn notification_page(page: u32, per_page: u32) -> NotificationPage {
    let notifications = (0..per_page)
        .map(|i| NotificationRecord {
            id: NotificationId::from(u64::from(page * 100 + i)),
            message: format!("notification {page}/{i}"),
            is_important: false,
            is_read: i >= 5 - page,
            created_at: None,
            sender: Default::default(),
        })
        .collect();
    NotificationPage {
        notifications,
        total: 30,
        page,
        per_page,
        pages: 3,
    }
}

#[async_trait]
impl RestApi for FakeApi {
    async fn fetch_conversations(&self, _self_id: &UserId) -> tasker_net::Result<Vec<ConversationSnapshot>> {
        self.conversation_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::from_value(self.conversations.clone())?)
    }

    async fn fetch_notifications(&self, page: u32, per_page: u32) -> tasker_net::Result<NotificationPage> {
        Ok(notification_page(page, per_page))
    }

    async fn mark_notification_read(&self, id: &NotificationId) -> tasker_net::Result<()> {
        self.read_calls.lock().unwrap().push(id.clone());
        Ok(())
    }
}

/// Hands the far end of every opened link to the test.
struct TestConnector {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
}

#[async_trait]
impl Connector for TestConnector {
    async fn open(&self, _identity: &UserId) -> tasker_net::Result<Link> {
        let (link, remote) = Link::in_memory(64);
        self.remotes
            .send(remote)
            .map_err(|_| NetError::Connect("test harness gone".to_string()))?;
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    client: Client,
    api: Arc<FakeApi>,
    remotes: mpsc::UnboundedReceiver<RemoteEnd>,
}

fn c1() -> ConversationId {
    ConversationId::from("C1")
}

impl Harness {
    async fn start() -> (Self, RemoteEnd) {
        let config = ClientConfig {
            reconnect_delay: Duration::from_millis(50),
            ..ClientConfig::default()
        };
        let api = Arc::new(FakeApi::new());
        let (tx, remotes) = mpsc::unbounded_channel();
        let client = Client::start(
            &config,
            UserId::from("me"),
            api.clone() as Arc<dyn RestApi>,
            TestConnector { remotes: tx },
        )
        .await
        .expect("client starts");

        let mut harness = Self {
            client,
            api,
            remotes,
        };
        let remote = harness.accept().await;
        harness
            .wait_view("conversation list", |v| v.conversation(&c1()).is_some())
            .await;
        (harness, remote)
    }

    /// Take the next opened link and acknowledge it.
    async fn accept(&mut self) -> RemoteEnd {
        let remote = timeout(Duration::from_secs(2), self.remotes.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped");
        push(&remote, json!({"event": "connection_ack"})).await;
        self.wait_view("connected", |v| v.connection == ConnectionState::Connected)
            .await;
        remote
    }

    fn engine(&self) -> &EngineHandle {
        self.client.engine()
    }

    async fn wait_view(&self, what: &str, pred: impl Fn(&EngineView) -> bool) -> EngineView {
        for _ in 0..200 {
            let view = self.engine().view().await.expect("engine running");
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    async fn wait_fetches(&self, more_than: usize) {
        for _ in 0..200 {
            if self.api.conversation_fetches.load(Ordering::SeqCst) > more_than {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("conversation list was not refetched");
    }

    async fn wait_conversation(&self, what: &str, pred: impl Fn(&Conversation) -> bool) -> Conversation {
        for _ in 0..200 {
            if let Some(conv) = self.engine().conversation(c1()).await.expect("engine running") {
                if pred(&conv) {
                    return conv;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }
}

async fn push(remote: &RemoteEnd, frame: Value) {
    remote
        .to_client
        .send(frame.to_string())
        .await
        .expect("client link open");
}

async fn next_frame(remote: &mut RemoteEnd) -> Value {
    let frame = timeout(Duration::from_secs(2), remote.from_client.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("client link open");
    serde_json::from_str(&frame).expect("outbound frame is JSON")
}

async fn assert_no_frame(remote: &mut RemoteEnd) {
    let next = timeout(Duration::from_millis(150), remote.from_client.recv()).await;
    assert!(next.is_err(), "unexpected outbound frame {next:?}");
}

fn confirmed(id: &str) -> MessageId {
    MessageId::Confirmed(ServerMessageId::from(id))
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn scenario_a_select_clears_unread_with_one_receipt() {
    let (h, mut remote) = Harness::start().await;

    let view = h.engine().view().await.unwrap();
    let summary = view.conversation(&c1()).unwrap();
    assert!(summary.unread);
    assert_eq!(summary.task.as_ref().map(|t| t.title.as_str()), Some("Paint fence"));
    assert_eq!(view.unread_conversations, 1);

    h.engine().select_conversation(c1()).await.unwrap();

    let frame = next_frame(&mut remote).await;
    assert_eq!(frame["event"], "message_status");
    assert_eq!(frame["data"]["conversation_id"], "C1");
    assert_eq!(frame["data"]["message_id"], "m1");
    assert_eq!(frame["data"]["status"], "read");

    let view = h.engine().view().await.unwrap();
    assert!(!view.conversation(&c1()).unwrap().unread);
    assert_eq!(view.active, Some(c1()));

    h.engine().select_conversation(c1()).await.unwrap();
    assert_no_frame(&mut remote).await;
}

#[tokio::test]
async fn scenario_b_send_is_reconciled_by_ack() {
    let (h, mut remote) = Harness::start().await;

    let pending = h.engine().send_message(c1(), "hi").await.unwrap();
    assert!(pending.is_pending());

    let conv = h.engine().conversation(c1()).await.unwrap().unwrap();
    let optimistic = conv.message(&pending).expect("optimistic copy");
    assert_eq!(optimistic.status, MessageStatus::Sending);
    assert_eq!(conv.last_message_preview, "hi");

    let frame = next_frame(&mut remote).await;
    assert_eq!(frame["event"], "send_message");
    assert_eq!(frame["data"]["message"], "hi");
    assert_eq!(frame["data"]["receiver_id"], "ana");

    push(
        &remote,
        json!({"event": "message_sent", "data": {
            "conversation_id": "C1", "message_id": 42, "status": "sent", "success": true
        }}),
    )
    .await;

    let conv = h
        .wait_conversation("ack reconciliation", |c| c.contains(&confirmed("42")))
        .await;
    assert!(!conv.contains(&pending));
    assert_eq!(conv.message(&confirmed("42")).unwrap().status, MessageStatus::Sent);
    assert_eq!(conv.last_message_id, Some(confirmed("42")));
}

#[tokio::test]
async fn scenario_c_duplicate_delivery_is_stored_once() {
    let (h, remote) = Harness::start().await;

    let message = json!({"event": "receive_message", "data": {
        "conversation_id": "C1", "message_id": "m2", "sender_id": "ana",
        "message": "Still on?", "time": "2024-05-01T11:00:00Z"
    }});
    push(&remote, message.clone()).await;
    push(&remote, message).await;
    push(
        &remote,
        json!({"event": "receive_message", "data": {
            "conversation_id": "C1", "message_id": "m3", "sender_id": "ana",
            "message": "Hello?", "time": "2024-05-01T11:05:00Z"
        }}),
    )
    .await;

    let conv = h
        .wait_conversation("marker message", |c| c.contains(&confirmed("m3")))
        .await;
    let copies = conv.messages.iter().filter(|m| m.id == confirmed("m2")).count();
    assert_eq!(copies, 1);
    assert_eq!(conv.messages.len(), 3);
    assert!(conv.unread);
}

#[tokio::test]
async fn scenario_d_typing_indicator() {
    let (h, remote) = Harness::start().await;
    let typing = |user: &str, is_typing: bool| {
        json!({"event": "typing_indicator", "data": {
            "conversation_id": "C1", "user_id": user, "is_typing": is_typing
        }})
    };

    push(&remote, typing("ana", true)).await;
    h.wait_view("typing on", |v| v.conversation(&c1()).unwrap().typing)
        .await;

    push(&remote, typing("ana", false)).await;
    h.wait_view("typing off", |v| !v.conversation(&c1()).unwrap().typing)
        .await;

    // Self echo is ignored; the presence event marks that it was processed.
    push(&remote, typing("me", true)).await;
    push(&remote, json!({"event": "user_connected", "data": {"user_id": "ana"}})).await;
    let view = h
        .wait_view("presence", |v| v.conversation(&c1()).unwrap().online)
        .await;
    assert!(!view.conversation(&c1()).unwrap().typing);
}

#[tokio::test]
async fn scenario_e_notification_pages() {
    let (h, _remote) = Harness::start().await;

    let view = h
        .wait_view("first page", |v| v.notifications_loaded == 10)
        .await;
    assert!(view.has_more_notifications);
    assert_eq!(view.notifications_unread, 4);

    assert!(h.engine().mark_notification_read(NotificationId::from(100)).await.unwrap());
    assert!(!h.engine().mark_notification_read(NotificationId::from(100)).await.unwrap());

    assert!(h.engine().fetch_next_notifications().await.unwrap());
    let view = h.engine().view().await.unwrap();
    assert_eq!(view.notifications_loaded, 20);
    assert!(view.has_more_notifications);
    // 3 left on page 1 plus page 2's own 3; page 1 is not recounted.
    assert_eq!(view.notifications_unread, 6);

    assert!(h.engine().fetch_next_notifications().await.unwrap());
    assert!(!h.engine().view().await.unwrap().has_more_notifications);
    assert!(!h.engine().fetch_next_notifications().await.unwrap());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.api.read_calls.lock().unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Connection lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn presence_is_rebuilt_after_reconnect() {
    let (mut h, remote) = Harness::start().await;

    push(&remote, json!({"event": "user_connected", "data": {"user_id": "ana"}})).await;
    h.wait_view("ana online", |v| v.conversation(&c1()).unwrap().online)
        .await;
    let fetches_before = h.api.conversation_fetches.load(Ordering::SeqCst);

    drop(remote);
    let _remote = h.accept().await;

    h.wait_view("presence cleared", |v| !v.conversation(&c1()).unwrap().online)
        .await;

    // Reconnect triggers a resync of the conversation list.
    h.wait_fetches(fetches_before).await;
}

#[tokio::test]
async fn chat_notification_refreshes_conversations_and_others_toast() {
    let (h, remote) = Harness::start().await;
    let mut events = h.engine().subscribe();

    // Startup loads the list once and again when the link is acknowledged.
    h.wait_fetches(1).await;
    h.wait_view("startup loads done", |v| v.conversations_load == LoadState::Ready)
        .await;
    let fetches_before = h.api.conversation_fetches.load(Ordering::SeqCst);

    push(
        &remote,
        json!({"event": "new_notification", "data": {
            "message": "New message from Ana", "source": "chat"
        }}),
    )
    .await;
    h.wait_fetches(fetches_before).await;
    let view = h
        .wait_view("refresh applied", |v| {
            v.conversations_load == LoadState::Ready && v.chat_signals == 0
        })
        .await;
    assert!(view.toasts.is_empty());

    push(
        &remote,
        json!({"event": "new_notification", "data": {
            "message": "Ana placed a bid", "source": "bid",
            "user_data": {"name": "Ana", "link": "/tasks/9"}
        }}),
    )
    .await;
    let view = h.wait_view("toast", |v| v.toasts.len() == 1).await;
    let toast = view.toasts[0].clone();

    let raised = timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(UiEvent::ToastRaised(t)) => return t,
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => panic!("engine stopped"),
            }
        }
    })
    .await
    .expect("toast event");
    assert_eq!(raised.id, toast.id);

    assert_eq!(
        h.engine().tap_toast(toast.id).await.unwrap(),
        Some("/tasks/9".to_string())
    );
    assert!(h.engine().view().await.unwrap().toasts.is_empty());
}

#[tokio::test]
async fn invalid_frames_are_dropped() {
    let (h, remote) = Harness::start().await;

    remote.to_client.send("not json".to_string()).await.unwrap();
    push(&remote, json!({"event": "receive_message", "data": {"conversation_id": "C1"}})).await;
    push(
        &remote,
        json!({"event": "receive_message", "data": {
            "conversation_id": "C1", "message_id": "m5", "sender_id": "ana", "message": "ok"
        }}),
    )
    .await;

    let conv = h
        .wait_conversation("valid message", |c| c.contains(&confirmed("m5")))
        .await;
    assert_eq!(conv.messages.len(), 2);
    assert_eq!(
        h.client.connection_state().await.unwrap(),
        ConnectionState::Connected
    );
}

#[tokio::test]
async fn tapping_unknown_toast_emits_nothing() {
    let (h, _remote) = Harness::start().await;
    let mut events = h.engine().subscribe();

    assert_eq!(h.engine().tap_toast(ToastId(999)).await.unwrap(), None);

    loop {
        match events.try_recv() {
            Ok(UiEvent::ToastDismissed { id }) => panic!("dismissed unknown toast {id:?}"),
            Ok(_) => {}
            Err(_) => break,
        }
    }
}
