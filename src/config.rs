//! Per-session configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{FixlineError, Result};
use crate::logon::LogonStrategyChoice;

pub const DEFAULT_BEGIN_STRING: &str = "FIX.4.4";
pub const DEFAULT_HEARTBEAT_SECS: u32 = 30;

/// A validated description of one session endpoint. Build through
/// [`SessionConfig::builder`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Broker DNS name or IP.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// BeginString (tag 8).
    #[serde(default = "default_begin_string")]
    pub begin_string: String,
    /// SenderCompID (tag 49).
    pub sender_comp_id: String,
    /// TargetCompID (tag 56).
    pub target_comp_id: String,
    /// SenderSubID (tag 50); omitted from headers when absent.
    #[serde(default)]
    pub sender_sub_id: Option<String>,
    /// Heartbeat interval in seconds (tag 108).
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u32,
    /// Opaque options handed to the transport connector (TLS certificates,
    /// verify mode, SNI, ...).
    #[serde(default)]
    pub transport_opts: HashMap<String, serde_json::Value>,
    /// How the Logon body is built.
    #[serde(default)]
    pub logon_strategy: LogonStrategyChoice,
    /// Parameters consumed by the logon strategy (username, password,
    /// on_behalf_of_comp_id, ...).
    #[serde(default)]
    pub logon_fields: HashMap<String, String>,
}

fn default_begin_string() -> String {
    DEFAULT_BEGIN_STRING.to_string()
}

fn default_heartbeat_secs() -> u32 {
    DEFAULT_HEARTBEAT_SECS
}

impl SessionConfig {
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }
}

#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    host: Option<String>,
    port: Option<u16>,
    begin_string: Option<String>,
    sender_comp_id: Option<String>,
    target_comp_id: Option<String>,
    sender_sub_id: Option<String>,
    heartbeat_interval_secs: Option<u32>,
    transport_opts: HashMap<String, serde_json::Value>,
    logon_strategy: Option<LogonStrategyChoice>,
    logon_fields: HashMap<String, String>,
}

impl SessionConfigBuilder {
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn begin_string(mut self, v: impl Into<String>) -> Self {
        self.begin_string = Some(v.into());
        self
    }

    pub fn sender_comp_id(mut self, v: impl Into<String>) -> Self {
        self.sender_comp_id = Some(v.into());
        self
    }

    pub fn target_comp_id(mut self, v: impl Into<String>) -> Self {
        self.target_comp_id = Some(v.into());
        self
    }

    pub fn sender_sub_id(mut self, v: impl Into<String>) -> Self {
        self.sender_sub_id = Some(v.into());
        self
    }

    pub fn heartbeat_interval_secs(mut self, v: u32) -> Self {
        self.heartbeat_interval_secs = Some(v);
        self
    }

    pub fn transport_opt(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.transport_opts.insert(key.into(), value);
        self
    }

    pub fn logon_strategy(mut self, v: LogonStrategyChoice) -> Self {
        self.logon_strategy = Some(v);
        self
    }

    pub fn logon_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.logon_fields.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<SessionConfig> {
        let heartbeat_interval_secs = self
            .heartbeat_interval_secs
            .unwrap_or(DEFAULT_HEARTBEAT_SECS);
        if heartbeat_interval_secs == 0 {
            return Err(FixlineError::InvalidConfig(
                "heartbeat_interval_secs must be at least 1".into(),
            ));
        }
        Ok(SessionConfig {
            host: self
                .host
                .ok_or_else(|| FixlineError::InvalidConfig("host missing".into()))?,
            port: self
                .port
                .ok_or_else(|| FixlineError::InvalidConfig("port missing".into()))?,
            begin_string: self.begin_string.unwrap_or_else(default_begin_string),
            sender_comp_id: self
                .sender_comp_id
                .ok_or_else(|| FixlineError::InvalidConfig("sender_comp_id missing".into()))?,
            target_comp_id: self
                .target_comp_id
                .ok_or_else(|| FixlineError::InvalidConfig("target_comp_id missing".into()))?,
            sender_sub_id: self.sender_sub_id,
            heartbeat_interval_secs,
            transport_opts: self.transport_opts,
            logon_strategy: self.logon_strategy.unwrap_or_default(),
            logon_fields: self.logon_fields,
        })
    }
}
