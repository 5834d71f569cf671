/// Delay before the single automatic reconnect attempt
pub const RECONNECT_DELAY_MS: u64 = 3_000;

/// An open socket not acknowledged within this window counts as a failed attempt
pub const ACK_TIMEOUT_MS: u64 = 10_000;

/// Automatic reconnects allowed before the session is reported offline
pub const MAX_AUTO_RECONNECTS: u32 = 1;

/// How long a realtime toast stays visible
pub const TOAST_DURATION_MS: u64 = 5_000;

/// Notification feed page size
pub const DEFAULT_PAGE_SIZE: u32 = 10;

/// A typing indicator not refreshed within this window is cleared
pub const TYPING_TTL_MS: u64 = 6_000;

/// An optimistic send not acknowledged within this window is marked failed
pub const PENDING_SEND_TIMEOUT_MS: u64 = 30_000;

/// REST request timeout
pub const REQUEST_TIMEOUT_MS: u64 = 15_000;

/// Capacity of the internal command and event channels
pub const CHANNEL_CAPACITY: usize = 256;

/// Query parameter carrying the identity on socket connect
pub const IDENTITY_QUERY_PARAM: &str = "user_id";

/// Preview shown for a message that only carries an image
pub const IMAGE_PREVIEW: &str = "Photo";
