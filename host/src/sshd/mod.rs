//! The embedded SSH server that remote clients attach to.
//!
//! It never listens on a real socket: every connection it serves is a
//! channel forwarded down the reverse tunnel by the rendezvous server.
//! Authentication is public-key only, against the session's authorized
//! set (an empty set means open access).

mod session;
pub mod sftp;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::keys::{PrivateKey, PublicKey};
use russh::server::{self, Handle};
use russh::{ChannelId, CryptoVec};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::api::Client;
use crate::multiwriter::{MultiWriter, OutputSink};
use crate::terminal::{PtyRef, TerminalEventTx};
use crate::tunnel::ForwardedConnection;
use crate::wire;

pub use session::READ_ONLY_BANNER;
pub use sftp::{FileOperation, PermissionChecker, PermissionDecision, SftpClientInfo};

/// Everything a per-connection handler needs, shared across sessions.
pub struct SshdContext {
    pub authorized_keys: Vec<PublicKey>,
    pub read_only: bool,
    pub force_command: Vec<String>,
    pub sftp_disabled: bool,
    pub permission_checker: Option<Arc<dyn PermissionChecker>>,
    pub enable_direct_tcpip: bool,
    pub shared_pty: PtyRef,
    pub fanout: Arc<MultiWriter>,
    pub terminal_events: TerminalEventTx,
    pub clients_joined: mpsc::UnboundedSender<Client>,
    pub clients_left: mpsc::UnboundedSender<String>,
}

pub struct Sshd {
    config: Arc<server::Config>,
    ctx: Arc<SshdContext>,
}

impl Sshd {
    pub fn new(
        host_keys: Vec<PrivateKey>,
        keepalive: Duration,
        ctx: SshdContext,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!host_keys.is_empty(), "the embedded server needs a host key");
        let config = server::Config {
            server_id: russh::SshId::Standard(wire::HOST_SSH_SERVER_VERSION.to_string()),
            keys: host_keys,
            keepalive_interval: Some(keepalive),
            keepalive_max: 3,
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::from_secs(0)),
            ..Default::default()
        };
        Ok(Self {
            config: Arc::new(config),
            ctx: Arc::new(ctx),
        })
    }

    /// Serve forwarded connections until the token fires or the
    /// connection stream ends (i.e. the tunnel went away).
    pub async fn serve(
        &self,
        mut connections: mpsc::Receiver<ForwardedConnection>,
        token: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut sessions = JoinSet::new();
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                conn = connections.recv() => match conn {
                    Some(conn) => {
                        let config = self.config.clone();
                        let handler = session::ConnHandler::new(self.ctx.clone());
                        let source = conn.source.clone();
                        sessions.spawn(async move {
                            match server::run_stream(config, conn.channel.into_stream(), handler)
                                .await
                            {
                                Ok(session) => {
                                    if let Err(err) = session.await {
                                        log::debug!("ssh session from {source} ended: {err:#}");
                                    }
                                }
                                Err(err) => {
                                    log::warn!("ssh handshake with {source} failed: {err:#}");
                                }
                            }
                        });
                    }
                    None => break,
                },
                // Reap finished sessions so the set stays small.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }
        sessions.shutdown().await;
        Ok(())
    }
}

/// An empty authorized set is the open-access policy; otherwise the
/// presented key material must compare equal to one of the set.  For
/// certificates the caller passes the certificate's embedded key.
pub fn key_is_authorized(
    authorized: &[PublicKey],
    presented: &russh::keys::ssh_key::public::KeyData,
) -> bool {
    authorized.is_empty() || authorized.iter().any(|key| key.key_data() == presented)
}

/// A fan-out sink that writes into a client's session channel.
pub(crate) struct ChannelSink {
    handle: Handle,
    id: ChannelId,
}

impl ChannelSink {
    pub(crate) fn new(handle: Handle, id: ChannelId) -> Self {
        Self { handle, id }
    }
}

#[async_trait]
impl OutputSink for ChannelSink {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.handle
            .data(self.id, CryptoVec::from_slice(data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "ssh channel closed"))
    }
}
