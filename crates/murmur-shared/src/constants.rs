/// Application name
pub const APP_NAME: &str = "murmur";

/// Maximum username length in characters
pub const MAX_USERNAME_LEN: usize = 50;

/// Separator used in canonical conversation keys (never valid in a username)
pub const CONVERSATION_KEY_SEPARATOR: char = '|';

/// Outbound queue capacity per connection
pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 256;

/// Capacity of the hub's event channel
pub const HUB_EVENT_QUEUE_CAPACITY: usize = 256;

/// Time allowed to write a frame to the peer (seconds)
pub const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 10;

/// Time allowed between two received frames, pongs included (seconds)
pub const DEFAULT_PONG_TIMEOUT_SECS: u64 = 60;

/// Ping period, must stay below the pong timeout (seconds)
pub const DEFAULT_PING_INTERVAL_SECS: u64 = DEFAULT_PONG_TIMEOUT_SECS * 9 / 10;

/// Maximum inbound frame size in bytes (512 KiB)
pub const MAX_FRAME_SIZE: usize = 512 * 1024;

/// Session lifetime in seconds (24 hours)
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;

/// Longest accepted session lifetime in seconds (one year)
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "session_id";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
