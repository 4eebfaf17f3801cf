//! The dispatch contract between a session and application code.

use async_trait::async_trait;

use crate::config::SessionConfig;
use crate::message::InboundMessage;

/// Why a session left the logged-on state.
#[derive(Debug, Clone)]
pub enum LogoutReason {
    /// The peer sent Logout (35=5); carries its Text (58) if present.
    Logout(Option<String>),
    /// The transport dropped or failed; the session will reconnect.
    ConnectionLost(String),
    /// The application called `stop_session`.
    Stopped,
}

/// Upcalls a session makes into application code.
///
/// All methods default to no-ops so handlers implement only what they care
/// about. None may block the session for unbounded time; return values are
/// ignored. Every invocation runs behind a failure barrier: a panicking
/// handler is logged and the session survives.
///
/// Upcalls execute on the session's own task. An upcall that wants to send
/// on the same session must `tokio::spawn` the
/// [`send_message`](crate::registry::send_message) call rather than await
/// it inline: the inline await would wait on the very task that is running
/// the upcall.
///
/// The session does not thread per-session user state through these calls;
/// a handler owns whatever state it keeps across them.
#[async_trait]
pub trait SessionHandler: Send + Sync {
    /// The peer's Logon reply was accepted; the session is live.
    async fn on_logon(&self, _session_key: &str, _config: &SessionConfig) {}

    /// A non-administrative message arrived in sequence.
    async fn on_app_message(
        &self,
        _session_key: &str,
        _msg: InboundMessage,
        _config: &SessionConfig,
    ) {
    }

    /// A session-level event needing application policy: ResendRequest (2),
    /// Reject (3), and every sequence gap. Gap recovery (ResendRequest,
    /// disconnect, ...) is this handler's decision.
    async fn on_session_message(
        &self,
        _session_key: &str,
        _msg: InboundMessage,
        _config: &SessionConfig,
    ) {
    }

    /// The session left the logged-on state.
    async fn on_logout(
        &self,
        _session_key: &str,
        _reason: LogoutReason,
        _config: &SessionConfig,
    ) {
    }
}
