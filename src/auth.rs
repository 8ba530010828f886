//! Request authorization shared by the chat and file services.
//!
//! Two independent checks, each disabled when unconfigured: a source-address
//! allow-list applied right after the TLS handshake, and a shared token that
//! every request header must carry.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::protocol::ProtocolError;

/// Process-wide authorization settings, fixed at service start
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    token: Option<String>,
    allowed: Option<HashSet<IpAddr>>,
}

impl AuthContext {
    /// No token, no allow-list
    pub fn open() -> Self {
        Self::default()
    }

    pub fn new<I>(token: Option<String>, allowed: Option<I>) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        Self {
            token: token.filter(|t| !t.is_empty()),
            allowed: allowed.map(|addrs| addrs.into_iter().map(|a| a.to_canonical()).collect()),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into()).filter(|t| !t.is_empty());
        self
    }

    pub fn with_allowed<I>(mut self, allowed: I) -> Self
    where
        I: IntoIterator<Item = IpAddr>,
    {
        self.allowed = Some(allowed.into_iter().map(|a| a.to_canonical()).collect());
        self
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn check_source(&self, addr: IpAddr) -> Result<(), ProtocolError> {
        match &self.allowed {
            Some(allowed) if !allowed.contains(&addr.to_canonical()) => {
                Err(ProtocolError::AllowListRejected(addr.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn check_token(&self, presented: Option<&str>) -> Result<(), ProtocolError> {
        match &self.token {
            Some(expected) if presented != Some(expected.as_str()) => {
                Err(ProtocolError::AuthRejected)
            }
            _ => Ok(()),
        }
    }
}
