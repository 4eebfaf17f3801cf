#![doc = include_str!("../README.md")]
#![warn(rustdoc::broken_intra_doc_links)]

pub mod codec;
pub mod config;
pub mod error;
pub mod handler;
pub mod logon;
pub mod message;
pub mod registry;
pub mod session;
pub mod timestamp;
pub mod transport;

pub use config::{SessionConfig, SessionConfigBuilder};
pub use error::{FixlineError, Result};
pub use handler::{LogoutReason, SessionHandler};
pub use logon::{
    CredentialsLogon, LogonStrategy, LogonStrategyChoice, OnBehalfOfLogon, StandardLogon,
};
pub use message::{FieldValue, FixMessage, InboundMessage};
pub use registry::{send_message, start_session, start_session_with_connector, stop_session};
pub use session::SessionPhase;
pub use transport::{Connector, FixTransport, TcpConnector};
