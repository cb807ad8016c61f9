pub mod probe;
pub mod retry;
pub mod ws;

pub use probe::{health_check, is_url_accessible};
pub use retry::{is_retryable_status, request_with_retry, RetryPolicy};
pub use ws::{safe_ws_send, ControlSocket, Outbox, SocketSink};
