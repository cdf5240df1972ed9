//! Server configuration, loaded from TOML.

use flint::policy::{MessageSecurityMode, PolicyKind};
use girder::session::roles;
use hashbrown::HashMap;
use serde_derive::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 4840;

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerSection {
    pub address: String,
    pub application_uri: String,
    pub display_name: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct TransportSection {
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub max_token_lifetime_ms: u32,
    pub inactivity_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PolicySpec {
    pub policy: String,
    pub mode: String,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct SecuritySection {
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub policies: Vec<PolicySpec>,
    pub strict_application_uri: bool,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct SessionSection {
    pub max_sessions: usize,
    pub max_timeout_ms: u64,
    pub default_timeout_ms: u64,
    pub reject_concurrent_requests: bool,
    pub admin_thumbprints: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct UserSpec {
    pub password: String,
    pub roles: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct PkiSection {
    pub max_trust_list_size: usize,
    pub max_rejected_list_size: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct GdsSection {
    pub check_session_interval_ms: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct BatchSection {
    pub timeout_ms: u64,
    pub max_batch_size: usize,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct AsyncSection {
    pub operation_timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Clone)]
pub struct ServerConfig {
    pub server: ServerSection,
    pub transport: TransportSection,
    pub security: SecuritySection,
    pub session: SessionSection,
    pub users: HashMap<String, UserSpec>,
    pub pki: PkiSection,
    pub gds: GdsSection,
    pub batch: BatchSection,
    pub async_ops: AsyncSection,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            server: ServerSection {
                address: format!("0.0.0.0:{}", DEFAULT_PORT),
                application_uri: "urn:bushhammer:girder:server".to_string(),
                display_name: "girder server".to_string(),
            },
            transport: TransportSection {
                receive_buffer_size: 65536,
                send_buffer_size: 65536,
                max_message_size: 1 << 24,
                max_chunk_count: 64,
                max_token_lifetime_ms: 3_600_000,
                inactivity_timeout_ms: 60_000,
                handshake_timeout_ms: 5_000,
            },
            security: SecuritySection {
                certificate_file: None,
                private_key_file: None,
                policies: vec![PolicySpec {
                    policy: "None".to_string(),
                    mode: "None".to_string(),
                }],
                strict_application_uri: false,
            },
            session: SessionSection {
                max_sessions: 100,
                max_timeout_ms: 3_600_000,
                default_timeout_ms: 60_000,
                reject_concurrent_requests: true,
                admin_thumbprints: Vec::new(),
            },
            users: HashMap::new(),
            pki: PkiSection {
                max_trust_list_size: 65535,
                max_rejected_list_size: 100,
            },
            gds: GdsSection {
                check_session_interval_ms: 10_000,
            },
            batch: BatchSection {
                timeout_ms: 20,
                max_batch_size: 10,
            },
            async_ops: AsyncSection {
                operation_timeout_ms: 5_000,
            },
        }
    }
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> ServerConfig {
        serdeconv::from_toml_file(path).expect("Error loading server configuration file")
    }

    pub fn to_toml(&self) -> String {
        serdeconv::to_toml_string(self).expect("Error serializing server configuration")
    }

    /// Resolves the configured policy specs into (kind, mode) pairs.
    pub fn resolved_policies(&self) -> Result<Vec<(PolicyKind, MessageSecurityMode)>, String> {
        let mut resolved = Vec::with_capacity(self.security.policies.len());

        for spec in &self.security.policies {
            let kind = match spec.policy.as_str() {
                "None" => PolicyKind::None,
                "Basic128Rsa15" => PolicyKind::Basic128Rsa15,
                "Basic256" => PolicyKind::Basic256,
                "Basic256Sha256" => PolicyKind::Basic256Sha256,
                "Aes256Sha256RsaPss" => PolicyKind::Aes256Sha256RsaPss,
                other => return Err(format!("Unknown security policy {}", other)),
            };

            let mode = match spec.mode.as_str() {
                "None" => MessageSecurityMode::None,
                "Sign" => MessageSecurityMode::Sign,
                "SignAndEncrypt" => MessageSecurityMode::SignAndEncrypt,
                other => return Err(format!("Unknown security mode {}", other)),
            };

            if kind == PolicyKind::None && mode != MessageSecurityMode::None {
                return Err("Policy None only supports mode None".to_string());
            }

            resolved.push((kind, mode));
        }

        Ok(resolved)
    }

    /// Maps the configured role names onto the session role bits.
    pub fn resolve_roles(names: &[String]) -> u32 {
        let mut mask = 0;
        for name in names {
            mask |= match name.as_str() {
                "observer" => roles::OBSERVER,
                "operator" => roles::OPERATOR,
                "admin" => roles::CONFIGURE_ADMIN,
                _ => 0,
            };
        }
        mask
    }

    #[inline]
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.inactivity_timeout_ms)
    }

    #[inline]
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_toml_roundtrip() {
        let config = ServerConfig::default();
        let toml = config.to_toml();

        let reloaded: ServerConfig = serdeconv::from_toml_str(&toml).unwrap();
        assert_eq!(reloaded.server.address, config.server.address);
        assert_eq!(reloaded.pki.max_trust_list_size, 65535);
        assert_eq!(reloaded.batch.timeout_ms, 20);
    }

    #[test]
    fn test_resolved_policies() {
        let mut config = ServerConfig::default();
        config.security.policies.push(PolicySpec {
            policy: "Basic256Sha256".to_string(),
            mode: "SignAndEncrypt".to_string(),
        });

        let resolved = config.resolved_policies().unwrap();
        assert_eq!(resolved.len(), 2);
        assert_eq!(
            resolved[1],
            (PolicyKind::Basic256Sha256, MessageSecurityMode::SignAndEncrypt)
        );
    }

    #[test]
    fn test_resolved_policies_err_unknown() {
        let mut config = ServerConfig::default();
        config.security.policies[0].policy = "Basic31337".to_string();

        assert!(config.resolved_policies().is_err());
    }

    #[test]
    fn test_resolve_roles() {
        let mask = ServerConfig::resolve_roles(&[
            "observer".to_string(),
            "admin".to_string(),
            "unknown".to_string(),
        ]);

        assert_eq!(mask, roles::OBSERVER | roles::CONFIGURE_ADMIN);
    }
}
