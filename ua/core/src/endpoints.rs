//! Discovery data: the endpoint descriptions assembled from the configured
//! security policies and the current server certificate.

use crate::config::ServerConfig;
use byteorder::{LittleEndian, WriteBytesExt};
use girder::codec;
use girder::net::PolicySet;
use std::io::Cursor;

pub const TRANSPORT_PROFILE_URI: &str =
    "http://opcfoundation.org/UA-Profile/Transport/uatcp-uasc-uabinary";

/// User token policy kinds as they appear on the wire.
pub mod token_types {
    pub const ANONYMOUS: u32 = 0;
    pub const USERNAME: u32 = 1;
    pub const X509: u32 = 2;
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct UserTokenPolicy {
    pub token_type: u32,
    pub policy_uri: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct EndpointDescription {
    pub endpoint_url: String,
    pub policy_uri: String,
    pub security_mode: u32,
    pub security_level: u8,
    pub server_certificate: Option<Vec<u8>>,
    pub transport_profile_uri: String,
    pub user_token_policies: Vec<UserTokenPolicy>,
}

/// Builds one endpoint description per exposed security policy, strongest
/// first.
pub fn build(config: &ServerConfig, policies: &PolicySet) -> Vec<EndpointDescription> {
    let endpoint_url = format!("opc.tcp://{}/", config.server.address);

    let mut descriptions: Vec<EndpointDescription> = policies
        .entries()
        .iter()
        .map(|entry| {
            let mut user_token_policies = vec![UserTokenPolicy {
                token_type: token_types::ANONYMOUS,
                policy_uri: entry.policy.uri().to_string(),
            }];
            if !config.users.is_empty() {
                user_token_policies.push(UserTokenPolicy {
                    token_type: token_types::USERNAME,
                    policy_uri: entry.policy.uri().to_string(),
                });
            }
            user_token_policies.push(UserTokenPolicy {
                token_type: token_types::X509,
                policy_uri: entry.policy.uri().to_string(),
            });

            EndpointDescription {
                endpoint_url: endpoint_url.clone(),
                policy_uri: entry.policy.uri().to_string(),
                security_mode: entry.mode as u32,
                security_level: entry.policy.kind().security_level(),
                server_certificate: entry.policy.local_cert().map(|cert| cert.der().to_vec()),
                transport_profile_uri: TRANSPORT_PROFILE_URI.to_string(),
                user_token_policies,
            }
        })
        .collect();

    descriptions.sort_by(|a, b| b.security_level.cmp(&a.security_level));
    descriptions
}

/// Encodes the descriptions for the GetEndpoints response body.
pub fn encode(descriptions: &[EndpointDescription]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());

    cursor
        .write_i32::<LittleEndian>(descriptions.len() as i32)
        .expect("In-memory encode cannot fail");

    for description in descriptions {
        codec::write_string(&mut cursor, Some(&description.endpoint_url)).unwrap();
        codec::write_string(&mut cursor, Some(&description.policy_uri)).unwrap();
        cursor.write_u32::<LittleEndian>(description.security_mode).unwrap();
        cursor.write_u8(description.security_level).unwrap();
        codec::write_byte_string(&mut cursor, description.server_certificate.as_deref()).unwrap();
        codec::write_string(&mut cursor, Some(&description.transport_profile_uri)).unwrap();

        cursor
            .write_i32::<LittleEndian>(description.user_token_policies.len() as i32)
            .unwrap();
        for token in &description.user_token_policies {
            cursor.write_u32::<LittleEndian>(token.token_type).unwrap();
            codec::write_string(&mut cursor, Some(&token.policy_uri)).unwrap();
        }
    }

    cursor.into_inner()
}
