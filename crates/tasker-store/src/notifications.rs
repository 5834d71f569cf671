//! Notification aggregator.
//!
//! Owns the persisted, paginated notification feed and the transient toasts
//! raised by realtime notifications. Fetching is split into
//! [`NotificationAggregator::begin_fetch`] and
//! [`NotificationAggregator::complete_fetch`] so that the owner can run the
//! request elsewhere and feed the result back.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use tasker_net::{NetError, RestApi};
use tasker_shared::protocol::RealtimeNotification;
use tasker_shared::rest::{NotificationPage, NotificationSource};
use tasker_shared::NotificationId;

use crate::error::{Result, StoreError};
use crate::models::{LoadState, Notification, Toast, ToastId};

/// A page fetch that has been started and not yet completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: u32,
    pub per_page: u32,
}

/// Result of ingesting a realtime notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Chat activity: the conversation list should be refetched.
    RefreshConversations,
    /// A toast was raised.
    Toast(ToastId),
}

pub struct NotificationAggregator {
    items: Vec<Notification>,
    unread_count: usize,
    current_page: u32,
    total_pages: u32,
    total: u32,
    page_size: u32,
    has_more: bool,
    in_flight: Option<PageRequest>,
    load_state: LoadState,
    toasts: Vec<Toast>,
    toast_duration: Duration,
    next_toast_id: u64,
    chat_signals: u64,
}

impl NotificationAggregator {
    pub fn new(page_size: u32, toast_duration: Duration) -> Self {
        Self {
            items: Vec::new(),
            unread_count: 0,
            current_page: 0,
            total_pages: 0,
            total: 0,
            page_size: page_size.max(1),
            has_more: true,
            in_flight: None,
            load_state: LoadState::Idle,
            toasts: Vec::new(),
            toast_duration,
            next_toast_id: 1,
            chat_signals: 0,
        }
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn notifications(&self) -> &[Notification] {
        &self.items
    }

    pub fn unread_count(&self) -> usize {
        self.unread_count
    }

    /// Unread count derived from the loaded items.
    pub fn recount_unread(&self) -> usize {
        self.items.iter().filter(|n| !n.is_read).count()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn total_pages(&self) -> u32 {
        self.total_pages
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_fetching(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn load_state(&self) -> &LoadState {
        &self.load_state
    }

    pub fn toasts(&self) -> &[Toast] {
        &self.toasts
    }

    /// Chat notifications seen since the last `clear_chat_signals`. The
    /// owner clears them once the conversation refresh they asked for lands.
    pub fn chat_signals(&self) -> u64 {
        self.chat_signals
    }

    pub fn clear_chat_signals(&mut self) {
        self.chat_signals = 0;
    }

    // -----------------------------------------------------------------------
    // Paging
    // -----------------------------------------------------------------------

    /// Start fetching `page`. Only one fetch may be outstanding.
    pub fn begin_fetch(&mut self, page: u32, per_page: u32) -> Result<PageRequest> {
        if let Some(pending) = self.in_flight {
            return Err(StoreError::FetchInFlight { page: pending.page });
        }
        let request = PageRequest {
            page: page.max(1),
            per_page: per_page.max(1),
        };
        self.in_flight = Some(request);
        self.load_state = LoadState::Loading;
        debug!(page = request.page, per_page = request.per_page, "Fetching notifications");
        Ok(request)
    }

    /// Start fetching the page after the last loaded one, if there is one.
    pub fn begin_next_page(&mut self) -> Result<Option<PageRequest>> {
        if !self.has_more {
            return Ok(None);
        }
        self.begin_fetch(self.current_page + 1, self.page_size).map(Some)
    }

    /// Apply the outcome of a fetch started by `begin_fetch`.
    ///
    /// Page 1 replaces the feed and recounts unread. Later pages append and
    /// add only their own unread items to the counter. A failure keeps the
    /// loaded feed and records a retryable load state.
    pub fn complete_fetch(
        &mut self,
        request: PageRequest,
        result: std::result::Result<NotificationPage, NetError>,
    ) -> Result<()> {
        if self.in_flight != Some(request) {
            warn!(page = request.page, "Completion for a fetch that is not in flight, ignoring");
            return Ok(());
        }
        self.in_flight = None;

        let page = match result {
            Ok(page) => page,
            Err(e) => {
                warn!(page = request.page, error = %e, "Notification fetch failed");
                self.load_state = LoadState::failed(&e);
                return Err(e.into());
            }
        };

        let fetched = page.notifications.len();
        if request.page == 1 {
            self.items = page.notifications;
            self.unread_count = self.recount_unread();
        } else {
            let delta = page.notifications.iter().filter(|n| !n.is_read).count();
            self.items.extend(page.notifications);
            self.unread_count += delta;
        }

        self.current_page = request.page;
        self.total_pages = page.pages;
        self.total = page.total;
        self.has_more = self.current_page < self.total_pages;
        self.load_state = LoadState::Ready;

        info!(
            page = self.current_page,
            pages = self.total_pages,
            fetched,
            unread = self.unread_count,
            "Notifications loaded"
        );
        Ok(())
    }

    /// Fetch `page` through `api` and apply it.
    pub async fn fetch_page<A: RestApi + ?Sized>(&mut self, api: &A, page: u32, per_page: u32) -> Result<()> {
        let request = self.begin_fetch(page, per_page)?;
        let result = api.fetch_notifications(request.page, request.per_page).await;
        self.complete_fetch(request, result)
    }

    /// Fetch the next page. Returns false when everything is loaded.
    pub async fn fetch_next_page<A: RestApi + ?Sized>(&mut self, api: &A) -> Result<bool> {
        let Some(request) = self.begin_next_page()? else {
            return Ok(false);
        };
        let result = api.fetch_notifications(request.page, request.per_page).await;
        self.complete_fetch(request, result)?;
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Read state
    // -----------------------------------------------------------------------

    /// Optimistically mark a notification read. Returns whether anything
    /// changed, i.e. whether the server needs to be told.
    pub fn mark_read(&mut self, id: &NotificationId) -> bool {
        let Some(item) = self.items.iter_mut().find(|n| n.id == *id) else {
            debug!(notification = %id, "mark_read for unloaded notification");
            return false;
        };
        if item.is_read {
            return false;
        }
        item.is_read = true;
        self.unread_count = self.unread_count.saturating_sub(1);
        true
    }

    /// Server outcome of a `mark_read`. Failures are logged and the local
    /// flip stays.
    pub fn confirm_read_result(&self, id: &NotificationId, result: &std::result::Result<(), NetError>) {
        match result {
            Ok(()) => debug!(notification = %id, "Notification read confirmed"),
            Err(e) => warn!(notification = %id, error = %e, "Failed to mark notification read"),
        }
    }

    /// Mark read locally and tell the server.
    pub async fn mark_read_remote<A: RestApi + ?Sized>(&mut self, api: &A, id: &NotificationId) -> bool {
        if !self.mark_read(id) {
            return false;
        }
        let result = api.mark_notification_read(id).await;
        self.confirm_read_result(id, &result);
        true
    }

    // -----------------------------------------------------------------------
    // Realtime
    // -----------------------------------------------------------------------

    /// Route a realtime notification. Chat activity becomes a conversation
    /// refresh; everything else becomes a toast. Nothing is added to the
    /// persisted feed.
    pub fn ingest_realtime_event(&mut self, event: RealtimeNotification, now: DateTime<Utc>) -> IngestOutcome {
        let mut sender = event.user_data;
        if event.source != NotificationSource::System {
            sender.source = event.source;
        }

        if sender.source.is_chat() {
            self.chat_signals += 1;
            debug!(signals = self.chat_signals, "Chat notification, refreshing conversations");
            return IngestOutcome::RefreshConversations;
        }

        let id = ToastId(self.next_toast_id);
        self.next_toast_id += 1;
        info!(toast = id.0, source = ?sender.source, "Raising toast");
        self.toasts.push(Toast {
            id,
            notification_id: event.notification_id,
            message: event.message,
            sender,
            created_at: now,
            expires_at: now + self.toast_duration,
        });
        IngestOutcome::Toast(id)
    }

    /// Dismiss a toast and return where it links to.
    pub fn tap_toast(&mut self, id: ToastId) -> Option<String> {
        let pos = self.toasts.iter().position(|t| t.id == id)?;
        self.toasts.remove(pos).sender.link
    }

    pub fn dismiss_toast(&mut self, id: ToastId) -> bool {
        let before = self.toasts.len();
        self.toasts.retain(|t| t.id != id);
        self.toasts.len() != before
    }

    /// Drop toasts whose display time is over. Returns the removed ids.
    pub fn expire_toasts(&mut self, now: DateTime<Utc>) -> Vec<ToastId> {
        let expired: Vec<ToastId> = self
            .toasts
            .iter()
            .filter(|t| t.expires_at <= now)
            .map(|t| t.id)
            .collect();
        self.toasts.retain(|t| t.expires_at > now);
        expired
    }
}
