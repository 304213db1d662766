//! Relay proxy configuration.

use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Relay endpoint used when direct paths are disallowed or fail.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(
        host: impl Into<String>,
        port: i32,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self, CallError> {
        let host = host.into();
        if host.trim().is_empty() {
            return Err(CallError::InvalidProxy("empty host".into()));
        }
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| CallError::InvalidProxy(format!("port {port} out of range")))?;

        Ok(Self {
            host,
            port,
            username,
            password,
        })
    }

    /// Username and password, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.as_str(), pass.as_str())),
            _ => None,
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn endpoint(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_validation() {
        assert!(ProxyConfig::new("", 1080, None, None).is_err());
        assert!(ProxyConfig::new("relay.example", 0, None, None).is_err());
        assert!(ProxyConfig::new("relay.example", 70000, None, None).is_err());

        let proxy = ProxyConfig::new("relay.example", 1080, None, None).unwrap();
        assert_eq!(proxy.endpoint(), "relay.example:1080");
        assert!(proxy.credentials().is_none());
    }

    #[test]
    fn test_credentials_require_both_halves() {
        let only_user =
            ProxyConfig::new("relay.example", 1080, Some("alice".into()), None).unwrap();
        assert!(only_user.credentials().is_none());

        let both = ProxyConfig::new(
            "relay.example",
            1080,
            Some("alice".into()),
            Some("hunter2".into()),
        )
        .unwrap();
        assert_eq!(both.credentials(), Some(("alice", "hunter2")));
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy = ProxyConfig::new(
            "relay.example",
            1080,
            Some("alice".into()),
            Some("hunter2".into()),
        )
        .unwrap();
        let printed = format!("{:?}", proxy);
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains("REDACTED"));
    }

    #[test]
    fn test_ipv6_endpoint_is_bracketed() {
        let proxy = ProxyConfig::new("2001:db8::1", 3480, None, None).unwrap();
        assert_eq!(proxy.endpoint(), "[2001:db8::1]:3480");
    }

    #[test]
    fn test_config_round_trip() {
        let json = r#"{"host":"relay.example","port":3480,"username":"alice","password":"hunter2"}"#;
        let proxy: ProxyConfig = serde_json::from_str(json).unwrap();
        assert_eq!(proxy.credentials(), Some(("alice", "hunter2")));

        let encoded = serde_json::to_string(&proxy).unwrap();
        let back: ProxyConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, proxy);

        // Out-of-range ports never deserialize.
        let bad = r#"{"host":"relay.example","port":70000,"username":null,"password":null}"#;
        assert!(serde_json::from_str::<ProxyConfig>(bad).is_err());
    }
}
