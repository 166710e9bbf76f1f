//! The reverse tunnel to the rendezvous server.
//!
//! The host dials the rendezvous over plain SSH or SSH-over-WebSocket,
//! authenticates with the encoded host identifier, learns its assigned
//! session from the server-info request, and asks the server to open a
//! Unix-socket listener named after the session id.  Connections
//! accepted by that listener stream back as forwarded channels, which
//! the embedded SSH server consumes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context as _};
use russh::client::{self, AuthResult, Handle, Msg, Session};
use russh::keys::{HashAlg, PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::PermissionDeniedError;
use crate::knownhosts::{HostKeyVerifier, ServerKey};
use crate::wire::{self, Identifier, ServerInfo};
use crate::ws;

/// A connection accepted on the remote listener and forwarded to us.
pub struct ForwardedConnection {
    pub channel: Channel<Msg>,
    /// Where the connection came from, for logging only.
    pub source: String,
}

pub struct TunnelConfig {
    pub host: Url,
    pub host_user: String,
    pub signers: Vec<Arc<PrivateKey>>,
    pub verifier: Arc<dyn HostKeyVerifier>,
    pub keepalive: Duration,
}

pub struct Tunnel {
    handle: Handle<TunnelHandler>,
    keepalive: Duration,
    pub server_info: ServerInfo,
}

/// Establish the tunnel.  Returns the tunnel actor plus the stream of
/// forwarded connections for the embedded server.
pub async fn establish(
    config: TunnelConfig,
) -> anyhow::Result<(Tunnel, mpsc::Receiver<ForwardedConnection>)> {
    let scheme = config.host.scheme().to_string();
    if !matches!(scheme.as_str(), "ssh" | "ws" | "wss") {
        bail!(
            "unsupported rendezvous scheme {scheme:?} in {}; use ssh, ws or wss",
            config.host
        );
    }
    let hostname = config
        .host
        .host_str()
        .ok_or_else(|| anyhow!("rendezvous url {} has no host", config.host))?
        .to_string();
    let port = config.host.port().unwrap_or(match scheme.as_str() {
        "ssh" => 22,
        "ws" => 80,
        _ => 443,
    });

    let (conn_tx, conn_rx) = mpsc::channel(16);
    let handler = TunnelHandler {
        verifier: config.verifier.clone(),
        hostname: hostname.clone(),
        port,
        connections: conn_tx,
    };

    let ssh_config = Arc::new(client::Config {
        client_id: russh::SshId::Standard(wire::HOST_SSH_CLIENT_VERSION.to_string()),
        keepalive_interval: Some(config.keepalive),
        ..Default::default()
    });

    let user = Identifier::host(&config.host_user).encode();
    let mut handle = match scheme.as_str() {
        "ssh" => {
            let stream = TcpStream::connect((hostname.as_str(), port))
                .await
                .with_context(|| format!("connecting to {hostname}:{port}"))?;
            stream
                .set_nodelay(true)
                .context("setting TCP NODELAY on ssh connection")?;
            client::connect_stream(ssh_config, stream, handler)
                .await
                .with_context(|| format!("ssh handshake with {hostname}:{port}"))?
        }
        "ws" | "wss" => {
            let stream = ws::connect(&config.host, &user).await?;
            client::connect_stream(ssh_config, stream, handler)
                .await
                .with_context(|| format!("ssh handshake with {}", config.host))?
        }
        _ => unreachable!("scheme was validated above"),
    };

    authenticate(&mut handle, &user, &config.signers, &hostname).await?;

    let info = request_server_info(&mut handle)
        .await
        .context("fetching server info")?;
    log::debug!(
        "rendezvous assigned session {} on node {}",
        info.session_id,
        info.node_addr
    );

    // The remote side listens on a unix socket named by the session id
    // and streams accepted connections back over this transport.
    handle
        .streamlocal_forward(info.session_id.clone())
        .await
        .with_context(|| format!("requesting remote listener for {}", info.session_id))?;

    Ok((
        Tunnel {
            handle,
            keepalive: config.keepalive,
            server_info: info,
        },
        conn_rx,
    ))
}

async fn authenticate(
    handle: &mut Handle<TunnelHandler>,
    user: &str,
    signers: &[Arc<PrivateKey>],
    hostname: &str,
) -> anyhow::Result<()> {
    for signer in signers {
        let key = PrivateKeyWithHashAlg::new(signer.clone(), best_hash_for(signer));
        match handle.authenticate_publickey(user, key).await {
            Ok(AuthResult::Success) => return Ok(()),
            Ok(AuthResult::Failure { .. }) => continue,
            // The classic OpenSSH wording some transports surface.
            Err(err) if err.to_string().contains("unable to authenticate") => break,
            Err(err) => {
                return Err(err).with_context(|| format!("authenticating with {hostname}"))
            }
        }
    }
    Err(PermissionDeniedError {
        host: hostname.to_string(),
    }
    .into())
}

fn best_hash_for(key: &PrivateKey) -> Option<HashAlg> {
    // Prefer rsa-sha2-256 over the legacy ssh-rsa signature scheme;
    // other algorithms carry their hash implicitly.
    match key.algorithm() {
        russh::keys::Algorithm::Rsa { .. } => Some(HashAlg::Sha256),
        _ => None,
    }
}

/// Issue the server-info request and parse the JSON reply.
async fn request_server_info(handle: &mut Handle<TunnelHandler>) -> anyhow::Result<ServerInfo> {
    let body = request_reply(handle, wire::SERVER_INFO_REQUEST_TYPE).await?;
    serde_json::from_slice(&body).context("parsing server info reply")
}

/// Run a request/reply exchange with the rendezvous server over a
/// short-lived session channel.
async fn request_reply(
    handle: &mut Handle<TunnelHandler>,
    request: &str,
) -> anyhow::Result<Vec<u8>> {
    let mut channel = handle
        .channel_open_session()
        .await
        .context("opening request channel")?;
    channel
        .exec(true, request)
        .await
        .with_context(|| format!("sending {request}"))?;

    let mut body = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => body.extend_from_slice(&data),
            ChannelMsg::ExitStatus { exit_status } if exit_status != 0 => {
                bail!("{request} failed with status {exit_status}");
            }
            ChannelMsg::Eof | ChannelMsg::Close => break,
            _ => {}
        }
    }
    Ok(body)
}

impl Tunnel {
    /// The keepalive/ping actor.  A failed ping is logged, not fatal;
    /// only a closed transport ends the tunnel.
    pub async fn run(mut self, token: CancellationToken) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.keepalive);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    self.handle
                        .disconnect(Disconnect::ByApplication, "session ended", "")
                        .await
                        .ok();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    if self.handle.is_closed() {
                        bail!("connection to the rendezvous server was lost");
                    }
                    if let Err(err) = request_reply(&mut self.handle, wire::PING_REQUEST_TYPE).await {
                        log::warn!("rendezvous ping failed: {err:#}");
                    }
                }
            }
        }
    }
}

struct TunnelHandler {
    verifier: Arc<dyn HostKeyVerifier>,
    hostname: String,
    port: u16,
    connections: mpsc::Sender<ForwardedConnection>,
}

impl TunnelHandler {
    async fn accept(&self, channel: Channel<Msg>, source: String) {
        log::debug!("forwarded connection from {source}");
        if self
            .connections
            .send(ForwardedConnection { channel, source })
            .await
            .is_err()
        {
            log::warn!("dropping forwarded connection: the embedded server is gone");
        }
    }
}

impl client::Handler for TunnelHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let verifier = self.verifier.clone();
        let hostname = self.hostname.clone();
        let port = self.port;
        // Certificate host keys take the cert-authority path in the
        // known-hosts store rather than a literal key comparison.
        let encoded = server_public_key
            .to_openssh()
            .context("encode server host key")?;
        let key = ServerKey::from_public_key(
            &ssh_key::PublicKey::from_openssh(&encoded).context("decode server host key")?,
        );
        // The prompting verifier blocks on stdin; keep it off the
        // transport's reactor.
        let remote = format!("{hostname}:{port}");
        tokio::task::spawn_blocking(move || {
            verifier.verify(&hostname, port, &remote, &key).map(|_| true)
        })
        .await
        .context("host verification task")?
    }

    async fn server_channel_open_forwarded_streamlocal(
        &mut self,
        channel: Channel<Msg>,
        socket_path: &str,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.accept(channel, format!("unix:{socket_path}")).await;
        Ok(())
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let source = format!(
            "{originator_address}:{originator_port} -> {connected_address}:{connected_port}"
        );
        self.accept(channel, source).await;
        Ok(())
    }
}
