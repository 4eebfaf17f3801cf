//! The per-session actor.
//!
//! Each session is one tokio task owning its transport, timers, sequence
//! counters, and receive buffer. The task multiplexes four inputs: the
//! command mailbox (`send_message` / `stop_session` round-trips), transport
//! reads, the heartbeat tick, and the reconnect timer. Nothing unwinds past
//! this task: every error is retried, dropped, or surfaced to the handler,
//! and a failed transport always ends in a scheduled reconnect.

use std::any::Any;
use std::cmp::Ordering;
use std::future::Future;
use std::io;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use crate::codec::{self, tags};
use crate::config::SessionConfig;
use crate::error::{FixlineError, Result};
use crate::handler::{LogoutReason, SessionHandler};
use crate::message::{msg_type, FixMessage, InboundMessage};
use crate::timestamp;
use crate::transport::{Connector, FixTransport};

/// Delay between a lost transport (or failed connect) and the next attempt.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

const READ_CHUNK_BYTES: usize = 8 * 1024;

/// Session lifecycle. Terminal only on explicit stop; every other path back
/// to `Disconnected` schedules a reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    Disconnected,
    Connecting,
    /// Transport is up and our Logon is sent; awaiting the peer's reply.
    Connected,
    LoggedOn,
    LoggingOut,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
            Self::LoggedOn => "LoggedOn",
            Self::LoggingOut => "LoggingOut",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
pub(crate) enum SessionCommand {
    Send {
        msg: FixMessage,
        respond_to: oneshot::Sender<Result<String>>,
    },
    Stop {
        respond_to: oneshot::Sender<()>,
    },
}

type TransportWriter = WriteHalf<Box<dyn FixTransport>>;
type TransportReader = ReadHalf<Box<dyn FixTransport>>;

pub(crate) struct SessionCore {
    key: String,
    config: SessionConfig,
    handler: Arc<dyn SessionHandler>,
    connector: Arc<dyn Connector>,
    phase: SessionPhase,
    send_seq_num: u64,
    recv_seq_num: u64,
    last_send: Instant,
    last_recv: Instant,
    buffer: BytesMut,
    writer: Option<TransportWriter>,
}

enum Event {
    Command(Option<SessionCommand>),
    Inbound(io::Result<Bytes>),
    HeartbeatDue,
    ConnectDue,
}

pub(crate) async fn run_session(mut core: SessionCore, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
    let mut reader: Option<TransportReader> = None;
    // First connect is immediate.
    let mut connect_deadline = Some(Instant::now());
    let mut heartbeat = new_heartbeat(core.config.heartbeat_interval_secs);
    let mut stop_ack: Option<oneshot::Sender<()>> = None;

    loop {
        let event = tokio::select! {
            cmd = cmd_rx.recv() => Event::Command(cmd),
            res = read_chunk(reader.as_mut()), if reader.is_some() => Event::Inbound(res),
            _ = heartbeat.tick() => Event::HeartbeatDue,
            _ = sleep_until_opt(connect_deadline), if connect_deadline.is_some() => Event::ConnectDue,
        };

        match event {
            Event::ConnectDue => {
                connect_deadline = None;
                match core.connect().await {
                    Some(r) => {
                        reader = Some(r);
                        heartbeat = new_heartbeat(core.config.heartbeat_interval_secs);
                    }
                    None => connect_deadline = Some(Instant::now() + RECONNECT_DELAY),
                }
            }
            Event::Inbound(Ok(chunk)) => core.handle_chunk(chunk).await,
            Event::Inbound(Err(e)) => core.transport_lost(e.to_string()).await,
            Event::HeartbeatDue => core.heartbeat_due().await,
            Event::Command(Some(SessionCommand::Send { msg, respond_to })) => {
                let _ = respond_to.send(core.send_app_message(msg).await);
            }
            Event::Command(Some(SessionCommand::Stop { respond_to })) => {
                core.stop().await;
                stop_ack = Some(respond_to);
                break;
            }
            Event::Command(None) => {
                core.shutdown();
                break;
            }
        }

        // Any path that dropped the writer mid-loop means the transport is
        // gone; retire the read half and arm the reconnect timer.
        if core.writer.is_none() && reader.is_some() {
            reader = None;
            connect_deadline = Some(Instant::now() + RECONNECT_DELAY);
        }
    }

    // Deregister before acknowledging the stop, so a caller seeing the ack
    // can immediately reuse the key.
    crate::registry::deregister(&core.key);
    if let Some(ack) = stop_ack {
        let _ = ack.send(());
    }
}

fn new_heartbeat(interval_secs: u32) -> Interval {
    let period = Duration::from_secs(u64::from(interval_secs));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn read_chunk(reader: Option<&mut TransportReader>) -> io::Result<Bytes> {
    match reader {
        Some(r) => {
            let mut buf = BytesMut::with_capacity(READ_CHUNK_BYTES);
            let n = r.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer closed connection",
                ));
            }
            Ok(buf.freeze())
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

impl SessionCore {
    pub(crate) fn new(
        key: String,
        config: SessionConfig,
        handler: Arc<dyn SessionHandler>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            key,
            config,
            handler,
            connector,
            phase: SessionPhase::Disconnected,
            send_seq_num: 1,
            recv_seq_num: 1,
            last_send: Instant::now(),
            last_recv: Instant::now(),
            buffer: BytesMut::new(),
            writer: None,
        }
    }

    fn set_phase(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(session = %self.key, from = %self.phase, to = %phase, "phase change");
            self.phase = phase;
        }
    }

    /// Opens the transport and runs the logon send. Returns the read half
    /// on success; on any failure the caller re-arms the reconnect timer.
    async fn connect(&mut self) -> Option<TransportReader> {
        self.set_phase(SessionPhase::Connecting);
        info!(
            session = %self.key,
            host = %self.config.host,
            port = self.config.port,
            "connecting"
        );
        let stream = match self
            .connector
            .connect(&self.config.host, self.config.port, &self.config.transport_opts)
            .await
        {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    session = %self.key,
                    error = %e,
                    retry_secs = RECONNECT_DELAY.as_secs(),
                    "transport connect failed"
                );
                self.set_phase(SessionPhase::Disconnected);
                return None;
            }
        };

        let (reader, writer) = tokio::io::split(stream);
        self.writer = Some(writer);
        self.buffer.clear();

        if let Err(e) = self.send_logon().await {
            warn!(session = %self.key, error = %e, "logon send failed");
            self.writer = None;
            self.set_phase(SessionPhase::Disconnected);
            return None;
        }

        self.set_phase(SessionPhase::Connected);
        Some(reader)
    }

    async fn send_logon(&mut self) -> Result<()> {
        let strategy = self.config.logon_strategy.resolve();
        let fields = strategy.build_logon_fields(&self.config)?;
        if fields
            .iter()
            .any(|(tag, value)| *tag == tags::RESET_SEQ_NUM_FLAG && value == "Y")
        {
            debug!(session = %self.key, "logon requests sequence reset; outbound counter back to 1");
            self.send_seq_num = 1;
        }
        self.write_frame(msg_type::LOGON, &fields).await?;
        Ok(())
    }

    /// Stamps headers, renders, writes, and advances the outbound counter.
    /// Tag 34 always carries the pre-increment counter, and the counter
    /// moves only for frames actually written.
    async fn write_frame(&mut self, msg_type: &str, body_fields: &[(u32, String)]) -> Result<Bytes> {
        if self.writer.is_none() {
            return Err(FixlineError::Transport("not connected".to_string()));
        }

        let mut fields: Vec<(u32, String)> = Vec::with_capacity(body_fields.len() + 6);
        fields.push((tags::MSG_TYPE, msg_type.to_string()));
        fields.push((tags::SENDER_COMP_ID, self.config.sender_comp_id.clone()));
        fields.push((tags::TARGET_COMP_ID, self.config.target_comp_id.clone()));
        fields.push((tags::MSG_SEQ_NUM, self.send_seq_num.to_string()));
        if let Some(sub) = &self.config.sender_sub_id {
            fields.push((tags::SENDER_SUB_ID, sub.clone()));
        }
        fields.push((tags::SENDING_TIME, timestamp::now_timestamp(true)));
        fields.extend(body_fields.iter().cloned());

        let frame = codec::encode_frame(&self.config.begin_string, &fields)?;

        let write_result = match self.writer.as_mut() {
            Some(writer) => match writer.write_all(&frame).await {
                Ok(()) => writer.flush().await,
                Err(e) => Err(e),
            },
            None => return Err(FixlineError::Transport("not connected".to_string())),
        };
        if let Err(e) = write_result {
            let cause = e.to_string();
            self.transport_lost(cause.clone()).await;
            return Err(FixlineError::Transport(cause));
        }

        self.send_seq_num += 1;
        self.last_send = Instant::now();
        trace!(session = %self.key, frame = %codec::render_readable(&frame), "sent");
        Ok(frame)
    }

    async fn send_app_message(&mut self, msg: FixMessage) -> Result<String> {
        if self.phase != SessionPhase::LoggedOn {
            return Err(FixlineError::NotLoggedOn);
        }
        let body = msg.wire_fields();
        let frame = self.write_frame(msg.msg_type(), &body).await?;
        Ok(codec::render_readable(&frame))
    }

    async fn handle_chunk(&mut self, chunk: Bytes) {
        self.buffer.extend_from_slice(&chunk);
        let frames = codec::split_stream(&mut self.buffer);
        for frame in frames {
            if self.writer.is_none() {
                // Disconnected mid-batch (peer Logout, write failure);
                // anything after that frame belongs to a dead connection.
                break;
            }
            self.handle_frame(frame).await;
        }
    }

    async fn handle_frame(&mut self, frame: Bytes) {
        self.last_recv = Instant::now();

        if !codec::verify_checksum(&frame) {
            warn!(
                session = %self.key,
                frame = %codec::render_readable(&frame),
                "checksum mismatch; frame dropped"
            );
            return;
        }
        let msg = match codec::parse_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    session = %self.key,
                    error = %e,
                    frame = %codec::render_readable(&frame),
                    "unparseable frame dropped"
                );
                return;
            }
        };
        trace!(session = %self.key, msg_type = %msg.msg_type, seq = msg.seq_num, "received");

        // A logon carrying ResetSeqNumFlag=Y rewinds the inbound counter
        // before any sequence validation.
        if msg.msg_type == msg_type::LOGON
            && msg.get_field(tags::RESET_SEQ_NUM_FLAG) == Some("Y")
        {
            debug!(session = %self.key, "peer logon resets inbound sequence to 1");
            self.recv_seq_num = 1;
        }

        match msg.seq_num.cmp(&self.recv_seq_num) {
            Ordering::Greater => {
                warn!(
                    session = %self.key,
                    expected = self.recv_seq_num,
                    got = msg.seq_num,
                    "sequence gap; deferring to handler"
                );
                self.upcall_session_message(msg).await;
            }
            Ordering::Less => {
                debug!(
                    session = %self.key,
                    expected = self.recv_seq_num,
                    got = msg.seq_num,
                    poss_dup = msg.poss_dup,
                    "stale frame dropped"
                );
            }
            Ordering::Equal => {
                self.recv_seq_num += 1;
                self.dispatch(msg).await;
            }
        }
    }

    async fn dispatch(&mut self, msg: InboundMessage) {
        match msg.msg_type.as_str() {
            msg_type::LOGON => {
                self.set_phase(SessionPhase::LoggedOn);
                info!(session = %self.key, "logon confirmed");
                self.upcall_logon().await;
            }
            msg_type::HEARTBEAT => {
                trace!(session = %self.key, seq = msg.seq_num, "heartbeat");
            }
            msg_type::TEST_REQUEST => {
                let body: Vec<(u32, String)> = msg
                    .get_field(tags::TEST_REQ_ID)
                    .map(|id| vec![(tags::TEST_REQ_ID, id.to_string())])
                    .unwrap_or_default();
                let _ = self.write_frame(msg_type::HEARTBEAT, &body).await;
            }
            msg_type::RESEND_REQUEST | msg_type::REJECT => {
                self.upcall_session_message(msg).await;
            }
            msg_type::SEQUENCE_RESET => self.apply_sequence_reset(&msg),
            msg_type::LOGOUT => {
                let text = msg.get_field(tags::TEXT).map(str::to_string);
                info!(session = %self.key, text = ?text, "peer logout");
                self.writer = None;
                self.set_phase(SessionPhase::Disconnected);
                self.upcall_logout(LogoutReason::Logout(text)).await;
            }
            _ => self.upcall_app_message(msg).await,
        }
    }

    fn apply_sequence_reset(&mut self, msg: &InboundMessage) {
        let Some(new_seq) = msg
            .get_field(tags::NEW_SEQ_NO)
            .and_then(|v| v.parse::<u64>().ok())
        else {
            warn!(session = %self.key, "SequenceReset without a usable NewSeqNo; ignored");
            return;
        };
        // GapFillFlag=Y and absent both mean "skip over the gap"; an
        // explicit N is the peer forcing a hard reset. The counter moves
        // either way.
        if msg.get_field(tags::GAP_FILL_FLAG) == Some("N") {
            warn!(
                session = %self.key,
                from = self.recv_seq_num,
                to = new_seq,
                "SequenceReset hard reset"
            );
        } else {
            info!(
                session = %self.key,
                from = self.recv_seq_num,
                to = new_seq,
                "SequenceReset gap fill"
            );
        }
        self.recv_seq_num = new_seq;
    }

    async fn heartbeat_due(&mut self) {
        if self.writer.is_none() {
            return;
        }
        let interval = Duration::from_secs(u64::from(self.config.heartbeat_interval_secs));
        if self.last_send.elapsed() >= interval {
            let _ = self.write_frame(msg_type::HEARTBEAT, &[]).await;
        }
    }

    /// Transport read/write failure or EOF. Sequence counters survive; the
    /// run loop schedules the reconnect.
    async fn transport_lost(&mut self, cause: String) {
        if self.writer.is_none() && self.phase == SessionPhase::Disconnected {
            return;
        }
        warn!(
            session = %self.key,
            cause = %cause,
            retry_secs = RECONNECT_DELAY.as_secs(),
            "transport lost"
        );
        self.writer = None;
        self.buffer.clear();
        self.set_phase(SessionPhase::Disconnected);
        self.upcall_logout(LogoutReason::ConnectionLost(cause)).await;
    }

    /// Graceful stop: best-effort Logout, then notify and retire.
    async fn stop(&mut self) {
        if self.writer.is_some() {
            self.set_phase(SessionPhase::LoggingOut);
            info!(session = %self.key, "stopping; sending logout");
            let _ = self.write_frame(msg_type::LOGOUT, &[]).await;
        }
        self.writer = None;
        self.set_phase(SessionPhase::Disconnected);
        self.upcall_logout(LogoutReason::Stopped).await;
    }

    /// Runtime shutdown (all command handles dropped): close and exit
    /// without upcalls.
    fn shutdown(&mut self) {
        debug!(session = %self.key, "command channel closed; shutting down");
        self.writer = None;
        self.set_phase(SessionPhase::Disconnected);
    }

    async fn upcall_logon(&self) {
        let handler = Arc::clone(&self.handler);
        let key = self.key.clone();
        let config = self.config.clone();
        guard_upcall(&self.key, "on_logon", async move {
            handler.on_logon(&key, &config).await;
        })
        .await;
    }

    async fn upcall_app_message(&self, msg: InboundMessage) {
        let handler = Arc::clone(&self.handler);
        let key = self.key.clone();
        let config = self.config.clone();
        guard_upcall(&self.key, "on_app_message", async move {
            handler.on_app_message(&key, msg, &config).await;
        })
        .await;
    }

    async fn upcall_session_message(&self, msg: InboundMessage) {
        let handler = Arc::clone(&self.handler);
        let key = self.key.clone();
        let config = self.config.clone();
        guard_upcall(&self.key, "on_session_message", async move {
            handler.on_session_message(&key, msg, &config).await;
        })
        .await;
    }

    async fn upcall_logout(&self, reason: LogoutReason) {
        let handler = Arc::clone(&self.handler);
        let key = self.key.clone();
        let config = self.config.clone();
        guard_upcall(&self.key, "on_logout", async move {
            handler.on_logout(&key, reason, &config).await;
        })
        .await;
    }
}

/// Failure barrier around handler upcalls: a panic is logged and contained.
async fn guard_upcall<F>(key: &str, upcall: &str, fut: F)
where
    F: Future<Output = ()>,
{
    if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
        error!(
            session = %key,
            upcall,
            panic = %panic_text(panic.as_ref()),
            "handler panicked; session continues"
        );
    }
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TcpConnector;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tokio::io::DuplexStream;

    #[derive(Debug)]
    enum HandlerEvent {
        Logon,
        App(InboundMessage),
        Session(InboundMessage),
        Logout(LogoutReason),
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<HandlerEvent>,
    }

    #[async_trait]
    impl SessionHandler for Recorder {
        async fn on_logon(&self, _key: &str, _config: &SessionConfig) {
            let _ = self.tx.send(HandlerEvent::Logon);
        }
        async fn on_app_message(&self, _key: &str, msg: InboundMessage, _config: &SessionConfig) {
            let _ = self.tx.send(HandlerEvent::App(msg));
        }
        async fn on_session_message(
            &self,
            _key: &str,
            msg: InboundMessage,
            _config: &SessionConfig,
        ) {
            let _ = self.tx.send(HandlerEvent::Session(msg));
        }
        async fn on_logout(&self, _key: &str, reason: LogoutReason, _config: &SessionConfig) {
            let _ = self.tx.send(HandlerEvent::Logout(reason));
        }
    }

    fn test_config() -> SessionConfig {
        SessionConfig::builder()
            .host("fix.test")
            .port(9876)
            .sender_comp_id("CLIENT")
            .target_comp_id("BROKER")
            .build()
            .unwrap()
    }

    /// A core wired to one side of an in-memory pipe, in the given phase.
    fn piped_core(
        phase: SessionPhase,
    ) -> (
        SessionCore,
        PeerEnd,
        mpsc::UnboundedReceiver<HandlerEvent>,
    ) {
        let (local, remote) = tokio::io::duplex(16 * 1024);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut core = SessionCore::new(
            "test".to_string(),
            test_config(),
            Arc::new(Recorder { tx: events_tx }),
            Arc::new(TcpConnector),
        );
        let (_reader, writer) = tokio::io::split(Box::new(local) as Box<dyn FixTransport>);
        core.writer = Some(writer);
        core.phase = phase;
        (core, PeerEnd::new(remote), events_rx)
    }

    /// What a broker fakes: a frame with correct envelope and checksum.
    fn peer_frame(msg_type: &str, seq: u64, extra: &[(u32, String)]) -> Bytes {
        let mut fields = vec![
            (tags::MSG_TYPE, msg_type.to_string()),
            (tags::SENDER_COMP_ID, "BROKER".to_string()),
            (tags::TARGET_COMP_ID, "CLIENT".to_string()),
            (tags::MSG_SEQ_NUM, seq.to_string()),
            (tags::SENDING_TIME, "20250104-14:30:45".to_string()),
        ];
        fields.extend(extra.iter().cloned());
        codec::encode_frame("FIX.4.4", &fields).unwrap()
    }

    struct PeerEnd {
        stream: DuplexStream,
        buf: BytesMut,
        pending: VecDeque<Bytes>,
    }

    impl PeerEnd {
        fn new(stream: DuplexStream) -> Self {
            Self {
                stream,
                buf: BytesMut::new(),
                pending: VecDeque::new(),
            }
        }

        async fn next_frame(&mut self) -> InboundMessage {
            loop {
                if let Some(frame) = self.pending.pop_front() {
                    return codec::parse_frame(&frame).unwrap();
                }
                let n = tokio::time::timeout(
                    Duration::from_secs(5),
                    self.stream.read_buf(&mut self.buf),
                )
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
                assert!(n > 0, "session closed its write half");
                self.pending.extend(codec::split_stream(&mut self.buf));
            }
        }
    }

    #[tokio::test]
    async fn test_request_is_answered_with_matching_heartbeat() {
        let (mut core, mut peer, _events) = piped_core(SessionPhase::LoggedOn);
        core.send_seq_num = 7;
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame("1", 5, &[(tags::TEST_REQ_ID, "ABC".to_string())]))
            .await;

        let hb = peer.next_frame().await;
        assert_eq!(hb.msg_type, "0");
        assert_eq!(hb.seq_num, 7);
        assert_eq!(hb.get_field(tags::TEST_REQ_ID), Some("ABC"));
        assert_eq!(core.send_seq_num, 8);
        assert_eq!(core.recv_seq_num, 6);
    }

    #[tokio::test]
    async fn sequence_reset_gap_fill_jumps_inbound_counter() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame(
            "4",
            5,
            &[(tags::GAP_FILL_FLAG, "Y".to_string()), (tags::NEW_SEQ_NO, "10".to_string())],
        ))
        .await;

        assert_eq!(core.recv_seq_num, 10);
    }

    #[tokio::test]
    async fn sequence_reset_hard_reset_also_applies() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame(
            "4",
            5,
            &[(tags::GAP_FILL_FLAG, "N".to_string()), (tags::NEW_SEQ_NO, "3".to_string())],
        ))
        .await;

        assert_eq!(core.recv_seq_num, 3);
    }

    #[tokio::test]
    async fn sequence_reset_without_new_seq_no_is_ignored() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame("4", 5, &[])).await;

        // The in-sequence frame itself still advanced the counter.
        assert_eq!(core.recv_seq_num, 6);
    }

    #[tokio::test]
    async fn gap_is_handed_to_the_handler_without_advancing() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame("W", 8, &[])).await;

        assert_eq!(core.recv_seq_num, 5);
        match events.try_recv().unwrap() {
            HandlerEvent::Session(msg) => {
                assert_eq!(msg.msg_type, "W");
                assert_eq!(msg.seq_num, 8);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(events.try_recv().is_err(), "gap must surface exactly once");
    }

    #[tokio::test]
    async fn stale_frames_are_dropped_silently() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame("W", 3, &[])).await;

        assert_eq!(core.recv_seq_num, 5);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn logon_with_reset_flag_rewinds_before_validation() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::Connected);
        core.recv_seq_num = 42;

        core.handle_frame(peer_frame(
            "A",
            1,
            &[(tags::RESET_SEQ_NUM_FLAG, "Y".to_string())],
        ))
        .await;

        assert_eq!(core.recv_seq_num, 2);
        assert_eq!(core.phase, SessionPhase::LoggedOn);
        assert!(matches!(events.try_recv().unwrap(), HandlerEvent::Logon));
    }

    #[tokio::test]
    async fn in_sequence_app_message_reaches_handler() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 9;

        core.handle_frame(peer_frame("8", 9, &[(17, "exec-1".to_string())]))
            .await;

        assert_eq!(core.recv_seq_num, 10);
        match events.try_recv().unwrap() {
            HandlerEvent::App(msg) => {
                assert_eq!(msg.msg_type, "8");
                assert_eq!(msg.get_field(17), Some("exec-1"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resend_request_and_reject_are_session_messages() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);

        core.handle_frame(peer_frame(
            "2",
            1,
            &[(tags::BEGIN_SEQ_NO, "1".to_string()), (tags::END_SEQ_NO, "0".to_string())],
        ))
        .await;
        core.handle_frame(peer_frame("3", 2, &[(tags::TEXT, "bad tag".to_string())]))
            .await;

        assert!(matches!(events.try_recv().unwrap(), HandlerEvent::Session(m) if m.msg_type == "2"));
        assert!(matches!(events.try_recv().unwrap(), HandlerEvent::Session(m) if m.msg_type == "3"));
    }

    #[tokio::test]
    async fn peer_logout_disconnects_and_notifies() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);

        core.handle_frame(peer_frame("5", 1, &[(tags::TEXT, "session closing".to_string())]))
            .await;

        assert!(core.writer.is_none());
        assert_eq!(core.phase, SessionPhase::Disconnected);
        match events.try_recv().unwrap() {
            HandlerEvent::Logout(LogoutReason::Logout(text)) => {
                assert_eq!(text.as_deref(), Some("session closing"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn bad_checksum_frame_is_dropped_without_advancing() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 1;

        let mut tampered = peer_frame("8", 1, &[]).to_vec();
        let len = tampered.len();
        tampered[len - 2] = if tampered[len - 2] == b'0' { b'1' } else { b'0' };
        core.handle_frame(Bytes::from(tampered)).await;

        assert_eq!(core.recv_seq_num, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unparseable_frame_is_dropped_without_advancing() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);

        // Well-formed envelope, but no MsgSeqNum.
        let frame = codec::encode_frame(
            "FIX.4.4",
            &[(tags::MSG_TYPE, "D".to_string()), (55, "BTC-USD".to_string())],
        )
        .unwrap();
        core.handle_frame(frame).await;

        assert_eq!(core.recv_seq_num, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn consecutive_sends_are_numbered_contiguously() {
        let (mut core, mut peer, _events) = piped_core(SessionPhase::LoggedOn);

        core.send_app_message(FixMessage::new("D")).await.unwrap();
        core.send_app_message(FixMessage::new("D")).await.unwrap();

        assert_eq!(peer.next_frame().await.seq_num, 1);
        assert_eq!(peer.next_frame().await.seq_num, 2);
        assert_eq!(core.send_seq_num, 3);
    }

    #[tokio::test]
    async fn in_sequence_frames_advance_by_count() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 4;

        for seq in 4..9 {
            core.handle_frame(peer_frame("8", seq, &[])).await;
        }

        assert_eq!(core.recv_seq_num, 9);
    }

    #[tokio::test]
    async fn send_while_not_logged_on_is_rejected() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::Connected);

        let err = core.send_app_message(FixMessage::new("D")).await.unwrap_err();
        assert!(matches!(err, FixlineError::NotLoggedOn));
        assert_eq!(core.send_seq_num, 1, "rejected send must not burn a sequence number");
    }

    #[tokio::test]
    async fn send_message_returns_readable_frame() {
        let (mut core, _peer, _events) = piped_core(SessionPhase::LoggedOn);

        let mut order = FixMessage::new("D");
        order.set_field(55, "BTC-USD");
        let written = core.send_app_message(order).await.unwrap();

        assert!(written.starts_with("8=FIX.4.4|"));
        assert!(written.contains("35=D|"));
        assert!(written.contains("55=BTC-USD|"));
        assert!(!written.contains('\x01'));
    }

    #[tokio::test]
    async fn repeated_tags_render_in_order_on_the_wire() {
        let (mut core, mut peer, _events) = piped_core(SessionPhase::LoggedOn);

        let mut md = FixMessage::new("V");
        md.set_field(269, "0");
        md.set_field(269, "1");
        core.send_app_message(md).await.unwrap();

        let sent = peer.next_frame().await;
        assert_eq!(sent.get_fields(269), vec!["0", "1"]);
    }

    #[tokio::test]
    async fn handler_panic_does_not_kill_the_session() {
        struct Exploding;

        #[async_trait]
        impl SessionHandler for Exploding {
            async fn on_app_message(
                &self,
                _key: &str,
                _msg: InboundMessage,
                _config: &SessionConfig,
            ) {
                panic!("handler exploded");
            }
        }

        let (local, _remote) = tokio::io::duplex(16 * 1024);
        let mut core = SessionCore::new(
            "test".to_string(),
            test_config(),
            Arc::new(Exploding),
            Arc::new(TcpConnector),
        );
        let (_reader, writer) = tokio::io::split(Box::new(local) as Box<dyn FixTransport>);
        core.writer = Some(writer);
        core.phase = SessionPhase::LoggedOn;

        core.handle_frame(peer_frame("8", 1, &[])).await;
        core.handle_frame(peer_frame("8", 2, &[])).await;

        assert_eq!(core.recv_seq_num, 3, "session keeps sequencing after a panic");
        assert_eq!(core.phase, SessionPhase::LoggedOn);
    }

    #[tokio::test]
    async fn stale_poss_dup_frames_are_still_dropped() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.recv_seq_num = 5;

        core.handle_frame(peer_frame(
            "W",
            3,
            &[(tags::POSS_DUP_FLAG, "Y".to_string())],
        ))
        .await;

        assert_eq!(core.recv_seq_num, 5);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn logon_uses_strategy_fields_and_resets_outbound_counter() {
        let (mut core, mut peer, _events) = piped_core(SessionPhase::Connected);
        core.send_seq_num = 9;

        core.send_logon().await.unwrap();

        let logon = peer.next_frame().await;
        assert_eq!(logon.msg_type, "A");
        assert_eq!(logon.seq_num, 1, "ResetSeqNumFlag=Y restarts numbering");
        assert_eq!(logon.get_field(tags::ENCRYPT_METHOD), Some("0"));
        assert_eq!(logon.get_field(tags::HEART_BT_INT), Some("30"));
        assert_eq!(logon.get_field(tags::RESET_SEQ_NUM_FLAG), Some("Y"));
        assert_eq!(core.send_seq_num, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_waits_for_the_send_side_to_go_idle() {
        let (mut core, mut peer, _events) = piped_core(SessionPhase::LoggedOn);

        core.heartbeat_due().await;
        assert_eq!(core.send_seq_num, 1, "fresh send side stays quiet");

        tokio::time::advance(Duration::from_secs(30)).await;
        core.heartbeat_due().await;

        assert_eq!(core.send_seq_num, 2);
        let hb = peer.next_frame().await;
        assert_eq!(hb.msg_type, "0");
        assert!(!hb.has_field(tags::TEST_REQ_ID));
    }

    #[tokio::test]
    async fn stop_sends_logout_and_notifies() {
        let (mut core, mut peer, mut events) = piped_core(SessionPhase::LoggedOn);

        core.stop().await;

        assert_eq!(peer.next_frame().await.msg_type, "5");
        assert_eq!(core.phase, SessionPhase::Disconnected);
        assert!(matches!(
            events.try_recv().unwrap(),
            HandlerEvent::Logout(LogoutReason::Stopped)
        ));
    }

    #[tokio::test]
    async fn transport_loss_preserves_sequence_counters() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        core.send_seq_num = 12;
        core.recv_seq_num = 34;

        core.transport_lost("broken pipe".to_string()).await;

        assert!(core.writer.is_none());
        assert_eq!(core.phase, SessionPhase::Disconnected);
        assert_eq!(core.send_seq_num, 12);
        assert_eq!(core.recv_seq_num, 34);
        assert!(matches!(
            events.try_recv().unwrap(),
            HandlerEvent::Logout(LogoutReason::ConnectionLost(_))
        ));
    }

    #[tokio::test]
    async fn split_frames_across_chunks_are_reassembled() {
        let (mut core, _peer, mut events) = piped_core(SessionPhase::LoggedOn);
        let frame = peer_frame("8", 1, &[]);
        let (head, tail) = frame.split_at(frame.len() / 2);

        core.handle_chunk(Bytes::copy_from_slice(head)).await;
        assert_eq!(core.recv_seq_num, 1);
        core.handle_chunk(Bytes::copy_from_slice(tail)).await;

        assert_eq!(core.recv_seq_num, 2);
        assert!(matches!(events.try_recv().unwrap(), HandlerEvent::App(_)));
    }
}
