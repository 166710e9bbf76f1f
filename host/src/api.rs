//! The data model shared between the session actors and the admin RPC.

use serde::{Deserialize, Serialize};
use ssh_key::PublicKey;

/// A public key (or set of keys from one source) permitted to join the
/// session.  `comment` names where the keys came from; an empty overall
/// authorized set means the session is open to any authenticated key.
#[derive(Debug, Clone)]
pub struct AuthorizedKey {
    pub comment: String,
    pub fingerprints: Vec<String>,
    pub keys: Vec<PublicKey>,
}

/// A connected remote attendee.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Client {
    /// The embedded server's session id for this client; unique among
    /// live clients.
    pub id: String,
    pub addr: String,
    pub version: String,
    pub public_key_fingerprint: String,
}

/// Immutable metadata describing the shared session.  Connected clients
/// live in the registry and are joined in at query time.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    /// The rendezvous URL the host dialed.
    pub host: String,
    /// The address the rendezvous server advises clients to connect to.
    pub advised_host: String,
    /// Opaque backend hint for the rendezvous node serving the session.
    pub node_addr: String,
    /// The stable identifier clients use as their SSH username.
    pub ssh_user: String,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub authorized_keys: Vec<AuthorizedKey>,
    pub read_only: bool,
    pub sftp_disabled: bool,
}

/// The admin RPC view of an [`AuthorizedKey`]; raw key material stays
/// out of the response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AuthorizedKeyInfo {
    pub comment: String,
    pub fingerprints: Vec<String>,
}

impl From<&AuthorizedKey> for AuthorizedKeyInfo {
    fn from(key: &AuthorizedKey) -> Self {
        Self {
            comment: key.comment.clone(),
            fingerprints: key.fingerprints.clone(),
        }
    }
}

/// Reply body of the admin socket's `GetSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GetSessionResponse {
    pub session_id: String,
    pub host: String,
    pub node_addr: String,
    pub ssh_user: String,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    pub authorized_keys: Vec<AuthorizedKeyInfo>,
    pub connected_clients: Vec<Client>,
    pub sftp_disabled: bool,
}

impl GetSessionResponse {
    pub fn new(session: &Session, clients: Vec<Client>) -> Self {
        Self {
            session_id: session.id.clone(),
            host: session.advised_host.clone(),
            node_addr: session.node_addr.clone(),
            ssh_user: session.ssh_user.clone(),
            command: session.command.clone(),
            force_command: session.force_command.clone(),
            authorized_keys: session.authorized_keys.iter().map(Into::into).collect(),
            connected_clients: clients,
            sftp_disabled: session.sftp_disabled,
        }
    }
}

/// The rendezvous server refused our public keys.
#[derive(Debug, thiserror::Error)]
#[error("{host}: Permission denied (publickey)")]
pub struct PermissionDeniedError {
    pub host: String,
}
