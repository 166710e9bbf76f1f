//! Wire-level constants and small codecs shared with the rendezvous
//! server: version banners, request-type names, the encoded identifier
//! carried in the SSH `User` field, and the server-info document.

use anyhow::{anyhow, Context};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Version banner announced by the host when dialing the rendezvous server.
pub const HOST_SSH_CLIENT_VERSION: &str = "SSH-2.0-upterm-host-client/1.0.0";

/// Version banner announced by the embedded server to joining clients.
pub const HOST_SSH_SERVER_VERSION: &str = "SSH-2.0-upterm-host/1.0.0";

/// Rendezvous servers identify themselves with banners of this prefix.
pub const SERVER_SSH_SERVER_VERSION_PREFIX: &str = "SSH-2.0-uptermd";

/// Request issued against the rendezvous server to learn the assigned
/// session; the reply body is [`ServerInfo`] as JSON.
pub const SERVER_INFO_REQUEST_TYPE: &str = "upterm-server-info@upterm.dev";

/// Keepalive request issued periodically against the rendezvous server.
pub const PING_REQUEST_TYPE: &str = "upterm-ping@upterm.dev";

/// OpenSSH-style keepalive request sent by the embedded server to clients.
pub const OPENSSH_KEEPALIVE_REQUEST_TYPE: &str = "keepalive@openssh.com";

/// Environment variable pointing the spawned command at the admin socket,
/// so `upterm session current` can discover the active session.
pub const ADMIN_SOCKET_ENV: &str = "UPTERM_ADMIN_SOCKET";

/// HTTP header carrying the host banner on WebSocket upgrade requests.
pub const CLIENT_VERSION_HEADER: &str = "Upterm-Client-Version";

/// The role baked into an encoded [`Identifier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentifierKind {
    Host,
    Client,
}

/// The structured identity carried in the SSH `User` field.
///
/// Hosts encode their username and the HOST tag; clients additionally
/// carry their remote address and version banner so the embedded server
/// can attribute sessions without trusting the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Type")]
    pub kind: IdentifierKind,
    #[serde(rename = "Addr", default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,
    #[serde(rename = "Version", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Identifier {
    pub fn host(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: IdentifierKind::Host,
            addr: None,
            version: None,
        }
    }

    /// Encode for use as an SSH `User` field.  The field must survive
    /// SSH and Basic-auth contexts, hence base64url without padding.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).expect("identifier serializes");
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(encoded: &str) -> anyhow::Result<Self> {
        let raw = URL_SAFE_NO_PAD
            .decode(encoded.as_bytes())
            .with_context(|| format!("decoding identifier {encoded:?}"))?;
        serde_json::from_slice(&raw).map_err(|e| anyhow!("malformed identifier: {e}"))
    }
}

/// The SSH username clients connect with: the session id, plus the
/// rendezvous node hint when the backend is multi-node, so the edge can
/// route the client to the node actually holding the tunnel.
pub fn ssh_user(session_id: &str, node_addr: &str) -> String {
    if node_addr.is_empty() {
        session_id.to_string()
    } else {
        format!("{session_id}:{}", URL_SAFE_NO_PAD.encode(node_addr))
    }
}

/// Session details assigned by the rendezvous server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    #[serde(rename = "SessionID")]
    pub session_id: String,
    #[serde(rename = "NodeAddr")]
    pub node_addr: String,
    #[serde(rename = "AdvisedUri")]
    pub advised_uri: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_round_trips() {
        let id = Identifier::host("alice");
        let decoded = Identifier::decode(&id.encode()).unwrap();
        k9::assert_equal!(id, decoded);
    }

    #[test]
    fn client_identifier_carries_addr_and_version() {
        let id = Identifier {
            id: "bob".into(),
            kind: IdentifierKind::Client,
            addr: Some("203.0.113.9:50022".into()),
            version: Some("SSH-2.0-OpenSSH_9.6".into()),
        };
        let decoded = Identifier::decode(&id.encode()).unwrap();
        k9::assert_equal!(decoded.addr.as_deref(), Some("203.0.113.9:50022"));
        k9::assert_equal!(decoded.kind, IdentifierKind::Client);
    }

    #[test]
    fn identifier_rejects_garbage() {
        assert!(Identifier::decode("!!not-base64!!").is_err());
        assert!(Identifier::decode("aGVsbG8").is_err());
    }

    #[test]
    fn ssh_user_embeds_the_node_hint() {
        k9::assert_equal!(ssh_user("abc", ""), "abc");
        let user = ssh_user("abc", "node-1:2222");
        assert!(user.starts_with("abc:"));
        let hint = URL_SAFE_NO_PAD
            .decode(user.split_once(':').unwrap().1)
            .unwrap();
        k9::assert_equal!(hint.as_slice(), b"node-1:2222");
    }

    #[test]
    fn server_info_uses_wire_field_names() {
        let info = ServerInfo {
            session_id: "abc".into(),
            node_addr: "node-1:22".into(),
            advised_uri: "ssh://uptermd.example:22".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        k9::assert_equal!(json["SessionID"], "abc");
        k9::assert_equal!(json["NodeAddr"], "node-1:22");
        k9::assert_equal!(json["AdvisedUri"], "ssh://uptermd.example:22");
    }
}
