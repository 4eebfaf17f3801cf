//! Process-wide session registry and the public API verbs.
//!
//! Sessions register under a caller-chosen key so that `send_message` and
//! `stop_session` can be issued from any task without holding a direct
//! handle. The map itself is guarded by a plain mutex that is never held
//! across an await; all session interaction goes through the command
//! mailbox.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::error::{FixlineError, Result};
use crate::handler::SessionHandler;
use crate::message::FixMessage;
use crate::session::{run_session, SessionCommand, SessionCore};
use crate::transport::{Connector, TcpConnector};

struct SessionHandle {
    cmd_tx: mpsc::Sender<SessionCommand>,
}

static SESSIONS: OnceLock<Mutex<HashMap<String, SessionHandle>>> = OnceLock::new();

fn sessions() -> MutexGuard<'static, HashMap<String, SessionHandle>> {
    SESSIONS
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

fn lookup(key: &str) -> Result<mpsc::Sender<SessionCommand>> {
    sessions()
        .get(key)
        .map(|handle| handle.cmd_tx.clone())
        .ok_or_else(|| FixlineError::SessionNotFound(key.to_string()))
}

/// Starts a session over plain TCP and registers it under `key`.
///
/// The session connects immediately and keeps reconnecting until stopped.
/// Fails with [`FixlineError::AlreadyStarted`] when the key is live, and
/// with a configuration/credential error before anything is registered.
pub async fn start_session(
    key: impl Into<String>,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
) -> Result<()> {
    start_session_with_connector(key, config, handler, Arc::new(TcpConnector)).await
}

/// [`start_session`] with a caller-supplied transport connector (TLS,
/// in-memory pipes for tests, ...).
pub async fn start_session_with_connector(
    key: impl Into<String>,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    connector: Arc<dyn Connector>,
) -> Result<()> {
    let key = key.into();

    // Strategy problems (e.g. missing credentials) surface here, not on
    // the first connect attempt.
    config.logon_strategy.resolve().build_logon_fields(&config)?;

    let (cmd_tx, cmd_rx) = mpsc::channel(1024);
    {
        let mut map = sessions();
        match map.get(&key) {
            Some(existing) if !existing.cmd_tx.is_closed() => {
                return Err(FixlineError::AlreadyStarted(key));
            }
            Some(_) => {
                debug!(session = %key, "replacing entry of a dead session");
            }
            None => {}
        }
        map.insert(key.clone(), SessionHandle { cmd_tx });
    }

    info!(
        session = %key,
        host = %config.host,
        port = config.port,
        "session starting"
    );
    let core = SessionCore::new(key, config, handler, connector);
    tokio::spawn(run_session(core, cmd_rx));
    Ok(())
}

/// Hands a user-authored message to the session for transmission.
///
/// Returns the exact bytes written to the transport, with SOH rendered as
/// `|` for logging. Fails with [`FixlineError::SessionNotFound`] for an
/// unknown key and [`FixlineError::NotLoggedOn`] outside the logged-on
/// phase.
pub async fn send_message(key: &str, msg: FixMessage) -> Result<String> {
    let cmd_tx = lookup(key)?;
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(SessionCommand::Send {
            msg,
            respond_to: tx,
        })
        .await
        .map_err(|_| FixlineError::ChannelClosed)?;
    rx.await.map_err(|_| FixlineError::ChannelClosed)?
}

/// Gracefully stops a session: best-effort Logout (35=5), transport close,
/// deregistration. Returns once the key is free again.
pub async fn stop_session(key: &str) -> Result<()> {
    let cmd_tx = lookup(key)?;
    let (tx, rx) = oneshot::channel();
    cmd_tx
        .send(SessionCommand::Stop { respond_to: tx })
        .await
        .map_err(|_| FixlineError::ChannelClosed)?;
    // The session acknowledges after deregistering itself; a session that
    // died in between still counts as stopped.
    let _ = rx.await;
    Ok(())
}

pub(crate) fn deregister(key: &str) {
    if sessions().remove(key).is_some() {
        debug!(session = %key, "session deregistered");
    }
}
