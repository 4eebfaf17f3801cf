//! Pluggable logon (35=A) body construction.
//!
//! A strategy is a pure function from the session configuration to the
//! ordered body fields appended after the standard headers. Strategies
//! never see session state and cannot touch sequence numbers or headers;
//! anything richer (HMAC signatures and the like) composes through
//! `logon_fields` in the configuration.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::tags;
use crate::config::SessionConfig;
use crate::error::{FixlineError, Result};

pub trait LogonStrategy: Send + Sync + std::fmt::Debug {
    fn build_logon_fields(&self, config: &SessionConfig) -> Result<Vec<(u32, String)>>;
}

/// Which strategy a session uses. Serializable except for `Custom`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum LogonStrategyChoice {
    #[default]
    Standard,
    UsernamePassword,
    OnBehalfOf,
    #[serde(skip)]
    Custom(Arc<dyn LogonStrategy>),
}

impl LogonStrategyChoice {
    pub fn resolve(&self) -> Arc<dyn LogonStrategy> {
        match self {
            Self::Standard => Arc::new(StandardLogon),
            Self::UsernamePassword => Arc::new(CredentialsLogon),
            Self::OnBehalfOf => Arc::new(OnBehalfOfLogon),
            Self::Custom(strategy) => Arc::clone(strategy),
        }
    }
}

fn standard_fields(config: &SessionConfig) -> Vec<(u32, String)> {
    vec![
        (tags::ENCRYPT_METHOD, "0".to_string()),
        (
            tags::HEART_BT_INT,
            config.heartbeat_interval_secs.to_string(),
        ),
        (tags::RESET_SEQ_NUM_FLAG, "Y".to_string()),
    ]
}

/// EncryptMethod=None, the configured heartbeat interval, and a mutual
/// sequence reset.
#[derive(Debug, Clone, Copy)]
pub struct StandardLogon;

impl LogonStrategy for StandardLogon {
    fn build_logon_fields(&self, config: &SessionConfig) -> Result<Vec<(u32, String)>> {
        Ok(standard_fields(config))
    }
}

/// The standard fields plus Username (553) and Password (554) taken from
/// `logon_fields`.
#[derive(Debug, Clone, Copy)]
pub struct CredentialsLogon;

impl LogonStrategy for CredentialsLogon {
    fn build_logon_fields(&self, config: &SessionConfig) -> Result<Vec<(u32, String)>> {
        let username = config
            .logon_fields
            .get("username")
            .ok_or(FixlineError::MissingCredential("username"))?;
        let password = config
            .logon_fields
            .get("password")
            .ok_or(FixlineError::MissingCredential("password"))?;

        let mut fields = standard_fields(config);
        fields.push((tags::USERNAME, username.clone()));
        fields.push((tags::PASSWORD, password.clone()));
        Ok(fields)
    }
}

/// The standard fields only. OnBehalfOf identifiers (115/116) are never put
/// in administrative messages; callers include them in application messages
/// where the broker expects them.
#[derive(Debug, Clone, Copy)]
pub struct OnBehalfOfLogon;

impl LogonStrategy for OnBehalfOfLogon {
    fn build_logon_fields(&self, config: &SessionConfig) -> Result<Vec<(u32, String)>> {
        Ok(standard_fields(config))
    }
}
