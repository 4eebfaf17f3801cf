//! Minimal FIX initiator: connect, log on, print whatever arrives.
//!
//! Run an acceptor on localhost:9876 (any FIX 4.4 test server works), then:
//!
//! ```text
//! cargo run --example initiator
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fixline::{
    start_session, stop_session, InboundMessage, LogoutReason, SessionConfig, SessionHandler,
};

struct PrintHandler;

#[async_trait]
impl SessionHandler for PrintHandler {
    async fn on_logon(&self, key: &str, _config: &SessionConfig) {
        println!("[{key}] logged on");
    }

    async fn on_app_message(&self, key: &str, msg: InboundMessage, _config: &SessionConfig) {
        println!("[{key}] app message: {msg}");
    }

    async fn on_session_message(&self, key: &str, msg: InboundMessage, _config: &SessionConfig) {
        println!("[{key}] session event: {msg}");
    }

    async fn on_logout(&self, key: &str, reason: LogoutReason, _config: &SessionConfig) {
        println!("[{key}] logged out: {reason:?}");
    }
}

#[tokio::main]
async fn main() -> fixline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("fixline=debug")
        .init();

    let config = SessionConfig::builder()
        .host("127.0.0.1")
        .port(9876)
        .sender_comp_id("INITIATOR")
        .target_comp_id("ACCEPTOR")
        .build()?;

    start_session("demo", config, Arc::new(PrintHandler)).await?;
    println!("session running; stopping in 60s");

    tokio::time::sleep(Duration::from_secs(60)).await;
    stop_session("demo").await?;
    Ok(())
}
