//! Authorizer verification and capability parsing.
//!
//! Two handler registries exist: the *cluster* registry authorizes peer MDS
//! daemons, the *service* registry authorizes everything else. Handlers
//! verify an authorizer payload against the monitor client's rotating
//! secrets and yield the peer's identity plus its capability string.

use crate::error::{LatticeError, Result};
use crate::types::GlobalId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Default authorizer protocol id.
pub const AUTH_PROTOCOL_SHARED_KEY: u32 = 2;

/// Rotating service secrets fetched from the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RotatingSecrets {
    pub generation: u32,
    pub key: u64,
}

impl RotatingSecrets {
    pub fn is_valid(&self) -> bool {
        self.key != 0
    }
}

/// The opaque authorizer a connecting peer presents.
#[derive(Debug, Clone)]
pub struct AuthorizerPayload {
    pub protocol: u32,
    pub name: String,
    pub global_id: GlobalId,
    pub key: u64,
    pub caps: Option<String>,
}

/// The verified identity of a peer.
#[derive(Debug, Clone)]
pub struct AuthIdentity {
    pub name: String,
    pub global_id: GlobalId,
    /// Set by providers that don't carry capability strings.
    pub allow_all: bool,
    pub caps: Option<String>,
}

/// One authorization scheme.
pub trait AuthorizeHandler: Send + Sync {
    fn verify(
        &self,
        secrets: &RotatingSecrets,
        payload: &AuthorizerPayload,
    ) -> Result<AuthIdentity>;
}

/// Shared-key verification against the current rotating secret.
pub struct SharedKeyAuthorizer;

impl AuthorizeHandler for SharedKeyAuthorizer {
    fn verify(
        &self,
        secrets: &RotatingSecrets,
        payload: &AuthorizerPayload,
    ) -> Result<AuthIdentity> {
        if !secrets.is_valid() {
            return Err(LatticeError::KeysUnavailable(
                "no rotating secrets installed".to_string(),
            ));
        }
        if payload.key != secrets.key {
            return Err(LatticeError::AuthFailed(format!(
                "bad authorizer from {}",
                payload.name
            )));
        }
        Ok(AuthIdentity {
            name: payload.name.clone(),
            global_id: payload.global_id,
            allow_all: false,
            caps: payload.caps.clone(),
        })
    }
}

/// Registry of authorize handlers keyed by protocol.
pub struct AuthorizeRegistry {
    handlers: RwLock<HashMap<u32, Arc<dyn AuthorizeHandler>>>,
}

impl AuthorizeRegistry {
    /// A registry preloaded with the default shared-key scheme.
    pub fn with_defaults() -> Self {
        let registry = Self {
            handlers: RwLock::new(HashMap::new()),
        };
        registry.register(AUTH_PROTOCOL_SHARED_KEY, Arc::new(SharedKeyAuthorizer));
        registry
    }

    pub fn register(&self, protocol: u32, handler: Arc<dyn AuthorizeHandler>) {
        self.handlers.write().insert(protocol, handler);
    }

    pub fn get_handler(&self, protocol: u32) -> Option<Arc<dyn AuthorizeHandler>> {
        self.handlers.read().get(&protocol).cloned()
    }
}

/// Parsed session capabilities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthCaps {
    /// Everything, including `tell` commands.
    allow_all: bool,
    /// Ordinary filesystem operations.
    fs_ops: bool,
    /// Out-of-band `tell` commands.
    tell: bool,
}

impl AuthCaps {
    /// Legacy default for peers with missing or undecodable caps: permit
    /// filesystem ops, deny `tell`.
    pub fn legacy() -> Self {
        Self {
            allow_all: false,
            fs_ops: true,
            tell: false,
        }
    }

    pub fn set_allow_all(&mut self) {
        self.allow_all = true;
    }

    pub fn allow_all(&self) -> bool {
        self.allow_all
    }

    pub fn allow_fs_ops(&self) -> bool {
        self.allow_all || self.fs_ops
    }

    pub fn allow_tell(&self) -> bool {
        self.allow_all || self.tell
    }

    /// Parse a capability string, e.g. `allow *` or `allow rw, allow tell`.
    pub fn parse(s: &str) -> Result<Self> {
        let mut caps = Self {
            allow_all: false,
            fs_ops: false,
            tell: false,
        };
        for clause in s.split(',') {
            let clause = clause.trim();
            if clause.is_empty() {
                continue;
            }
            let grant = clause.strip_prefix("allow").ok_or_else(|| {
                LatticeError::InvalidArgument(format!("unparseable cap clause '{}'", clause))
            })?;
            match grant.trim() {
                "*" => caps.allow_all = true,
                "r" | "rw" => caps.fs_ops = true,
                "tell" => caps.tell = true,
                other => {
                    return Err(LatticeError::InvalidArgument(format!(
                        "unknown cap grant '{}'",
                        other
                    )))
                }
            }
        }
        Ok(caps)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: u64) -> AuthorizerPayload {
        AuthorizerPayload {
            protocol: AUTH_PROTOCOL_SHARED_KEY,
            name: "client.foo".to_string(),
            global_id: GlobalId(99),
            key,
            caps: None,
        }
    }

    #[test]
    fn test_shared_key_verify() {
        let secrets = RotatingSecrets { generation: 1, key: 0xfeed };
        let registry = AuthorizeRegistry::with_defaults();
        let handler = registry.get_handler(AUTH_PROTOCOL_SHARED_KEY).unwrap();

        assert!(handler.verify(&secrets, &payload(0xfeed)).is_ok());
        assert!(handler.verify(&secrets, &payload(0xdead)).is_err());
    }

    #[test]
    fn test_unknown_protocol() {
        let registry = AuthorizeRegistry::with_defaults();
        assert!(registry.get_handler(42).is_none());
    }

    #[test]
    fn test_caps_parse() {
        let caps = AuthCaps::parse("allow *").unwrap();
        assert!(caps.allow_tell());
        assert!(caps.allow_fs_ops());

        let caps = AuthCaps::parse("allow rw, allow tell").unwrap();
        assert!(!caps.allow_all());
        assert!(caps.allow_tell());

        assert!(AuthCaps::parse("deny everything").is_err());
    }

    #[test]
    fn test_legacy_caps_deny_tell() {
        let caps = AuthCaps::legacy();
        assert!(caps.allow_fs_ops());
        assert!(!caps.allow_tell());
    }
}
