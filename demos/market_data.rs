//! Market data subscriber.
//!
//! Logs on, subscribes to a handful of symbols with a MarketDataRequest
//! (35=V) carrying repeating groups, prints incremental refreshes, and
//! answers sequence gaps with a ResendRequest.
//!
//! Upcalls run on the session's own task, so anything that needs a
//! `send_message` round-trip is spawned instead of awaited inline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fixline::{
    send_message, start_session, stop_session, FixMessage, InboundMessage, LogoutReason,
    SessionConfig, SessionHandler,
};

const SYMBOLS: [&str; 3] = ["BTC-USD", "ETH-USD", "SOL-USD"];

// Market data tags beyond the session layer.
const MD_REQ_ID: u32 = 262;
const SUBSCRIPTION_REQUEST_TYPE: u32 = 263;
const MARKET_DEPTH: u32 = 264;
const NO_MD_ENTRY_TYPES: u32 = 267;
const MD_ENTRY_TYPE: u32 = 269;
const NO_RELATED_SYM: u32 = 146;
const SYMBOL: u32 = 55;

fn subscription_request() -> FixMessage {
    let mut req = FixMessage::new("V");
    req.set_field(MD_REQ_ID, "md-demo-1");
    req.set_field(SUBSCRIPTION_REQUEST_TYPE, "1"); // snapshot + updates
    req.set_field(MARKET_DEPTH, "1"); // top of book
    req.set_field(NO_MD_ENTRY_TYPES, "2");
    req.set_field(MD_ENTRY_TYPE, "0"); // bid
    req.set_field(MD_ENTRY_TYPE, "1"); // offer
    req.set_field(NO_RELATED_SYM, SYMBOLS.len().to_string());
    for symbol in SYMBOLS {
        req.set_field(SYMBOL, symbol);
    }
    req
}

#[derive(Default)]
struct MarketDataApp {
    /// Highest sequence number processed in order; gap recovery resumes
    /// right after it.
    last_seen: AtomicU64,
}

#[async_trait]
impl SessionHandler for MarketDataApp {
    async fn on_logon(&self, key: &str, _config: &SessionConfig) {
        println!("[{key}] logged on; subscribing to {SYMBOLS:?}");
        let key = key.to_string();
        tokio::spawn(async move {
            match send_message(&key, subscription_request()).await {
                Ok(written) => println!("[{key}] subscribed: {written}"),
                Err(e) => eprintln!("[{key}] subscription failed: {e}"),
            }
        });
    }

    async fn on_app_message(&self, key: &str, msg: InboundMessage, _config: &SessionConfig) {
        self.last_seen.store(msg.seq_num, Ordering::Relaxed);
        match msg.msg_type.as_str() {
            "W" | "X" => {
                let symbol = msg.get_field(SYMBOL).unwrap_or("?");
                println!("[{key}] {symbol}: {msg}");
            }
            "Y" => eprintln!("[{key}] market data request rejected: {msg}"),
            other => println!("[{key}] unhandled {other}: {msg}"),
        }
    }

    async fn on_session_message(&self, key: &str, msg: InboundMessage, _config: &SessionConfig) {
        // A gap means the feed skipped ahead of us; ask for everything
        // after the last message we processed (EndSeqNo=0 means "to the
        // latest").
        println!("[{key}] session event {}: {msg}", msg.msg_type);
        let key = key.to_string();
        let from = self.last_seen.load(Ordering::Relaxed) + 1;
        tokio::spawn(async move {
            if let Err(e) = send_message(&key, FixMessage::resend_request(from, 0)).await {
                eprintln!("[{key}] resend request failed: {e}");
            }
        });
    }

    async fn on_logout(&self, key: &str, reason: LogoutReason, _config: &SessionConfig) {
        println!("[{key}] logged out: {reason:?}");
    }
}

#[tokio::main]
async fn main() -> fixline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("fixline=info")
        .init();

    let config = SessionConfig::builder()
        .host("127.0.0.1")
        .port(9876)
        .sender_comp_id("MDCLIENT")
        .target_comp_id("FEED")
        .heartbeat_interval_secs(15)
        .build()?;

    start_session("md", config, Arc::new(MarketDataApp::default())).await?;
    println!("streaming; stopping in 120s");

    tokio::time::sleep(Duration::from_secs(120)).await;
    stop_session("md").await?;
    Ok(())
}
