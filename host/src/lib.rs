//! The upterm host: shares a local terminal session over a reverse SSH
//! tunnel to a rendezvous server, so remote peers authenticated by
//! public key can attach to the same pty.
//!
//! The crate is organized around a handful of cooperating actors
//! supervised by a [`rungroup::RunGroup`]: the local command under its
//! pty ([`command`]), the tunnel keepalive ([`tunnel`]), the embedded
//! SSH server fed by tunnel-forwarded connections ([`sshd`]), the
//! terminal-size coordinator ([`terminal`]), the admin RPC ([`admin`]),
//! and the client join/leave drains.  The data plane is a single
//! [`multiwriter::MultiWriter`] fanning the pty output out to the host
//! stdout (wrapped in the [`queryfilter`]) and every attached remote.

pub mod admin;
pub mod api;
pub mod authkeys;
pub mod command;
pub mod knownhosts;
pub mod multiwriter;
pub mod queryfilter;
pub mod registry;
pub mod rungroup;
pub mod sshd;
pub mod terminal;
pub mod tunnel;
pub mod wire;
pub mod ws;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use russh::keys::PrivateKey;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::api::{AuthorizedKey, Client, Session};
use crate::knownhosts::HostKeyVerifier;
use crate::multiwriter::{MultiWriter, OutputSink};
use crate::queryfilter::FilteredSink;
use crate::registry::ClientRegistry;
use crate::rungroup::RunGroup;
use crate::sshd::{PermissionChecker, Sshd, SshdContext};

/// Callback invoked by the join/leave drains, e.g. to flash a desktop
/// notification.
pub type ClientCallback = Arc<dyn Fn(&Client) + Send + Sync>;

pub struct HostConfig {
    /// The rendezvous URL; scheme ssh, ws or wss.
    pub server: Url,
    /// Local username baked into the host identifier.
    pub host_user: String,
    pub command: Vec<String>,
    pub force_command: Vec<String>,
    /// Private keys: they authenticate us to the rendezvous server and
    /// serve as the embedded server's host keys.
    pub signers: Vec<PrivateKey>,
    pub authorized_keys: Vec<AuthorizedKey>,
    pub read_only: bool,
    pub keepalive: Duration,
    /// Fan-out replay ring size, in write records.
    pub ring_size: usize,
    pub verifier: Arc<dyn HostKeyVerifier>,
    pub sftp_disabled: bool,
    pub permission_checker: Option<Arc<dyn PermissionChecker>>,
    pub enable_direct_tcpip: bool,
    pub on_client_joined: Option<ClientCallback>,
    pub on_client_left: Option<ClientCallback>,
}

pub struct Host {
    config: HostConfig,
}

impl Host {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }

    /// Establish the session and run it to completion.
    pub async fn run(self) -> anyhow::Result<()> {
        let config = self.config;
        anyhow::ensure!(!config.command.is_empty(), "no command configured");
        anyhow::ensure!(
            !config.signers.is_empty(),
            "no private keys available to authenticate with"
        );

        // Control-plane uplink first: nothing else exists without it.
        let signers: Vec<Arc<PrivateKey>> =
            config.signers.iter().cloned().map(Arc::new).collect();
        let (tunnel, connections) = tunnel::establish(tunnel::TunnelConfig {
            host: config.server.clone(),
            host_user: config.host_user.clone(),
            signers,
            verifier: config.verifier.clone(),
            keepalive: config.keepalive,
        })
        .await
        .context("establishing the reverse tunnel")?;

        let info = tunnel.server_info.clone();
        let session = Arc::new(Session {
            id: info.session_id.clone(),
            host: config.server.to_string(),
            advised_host: if info.advised_uri.is_empty() {
                config.server.to_string()
            } else {
                info.advised_uri.clone()
            },
            node_addr: info.node_addr.clone(),
            ssh_user: wire::ssh_user(&info.session_id, &info.node_addr),
            command: config.command.clone(),
            force_command: config.force_command.clone(),
            authorized_keys: config.authorized_keys.clone(),
            read_only: config.read_only,
            sftp_disabled: config.sftp_disabled,
        });
        log::info!("session {} established", session.id);

        let admin_socket = admin::socket_path(&session.id)?;

        // The data plane: host stdout (filtered, required) plus remotes.
        let fanout = Arc::new(MultiWriter::new(config.ring_size));
        fanout
            .append(
                Box::new(FilteredSink::new(Box::new(StdoutSink::new()))),
                true,
            )
            .await
            .context("attaching host stdout")?;

        let spawned = command::spawn(&command::LocalCommand {
            command: config.command.clone(),
            env: vec![(
                wire::ADMIN_SOCKET_ENV.to_string(),
                admin_socket.display().to_string(),
            )],
        })?;
        let shared_pty = spawned.pty.clone();

        let (terminal_events, terminal_rx) = terminal::channel();
        let (joined_tx, joined_rx) = mpsc::unbounded_channel();
        let (left_tx, left_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ClientRegistry::new());

        let sshd = Sshd::new(
            config.signers.clone(),
            config.keepalive,
            SshdContext {
                authorized_keys: authkeys::flatten(&config.authorized_keys),
                read_only: config.read_only,
                force_command: config.force_command.clone(),
                sftp_disabled: config.sftp_disabled,
                permission_checker: config.permission_checker.clone(),
                enable_direct_tcpip: config.enable_direct_tcpip,
                shared_pty,
                fanout: fanout.clone(),
                terminal_events: terminal_events.clone(),
                clients_joined: joined_tx,
                clients_left: left_tx,
            },
        )?;

        let mut group = RunGroup::new();

        {
            let token = CancellationToken::new();
            let state = admin::AdminState {
                session: session.clone(),
                registry: registry.clone(),
            };
            group.add(
                "admin-rpc",
                admin::serve(admin_socket.clone(), state, token.clone()),
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            let registry = registry.clone();
            let callback = config.on_client_joined.clone();
            group.add(
                "client-joined-drain",
                drain_joined(joined_rx, registry, callback, token.clone()),
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            let registry = registry.clone();
            let callback = config.on_client_left.clone();
            group.add(
                "client-left-drain",
                drain_left(left_rx, registry, callback, token.clone()),
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            let serve_token = token.clone();
            group.add(
                "ssh-server",
                async move { sshd.serve(connections, serve_token).await },
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            let coordinator = terminal::Coordinator::new();
            group.add(
                "terminal-coordinator",
                coordinator.run(terminal_rx, token.clone()),
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            group.add("tunnel", tunnel.run(token.clone()), move || token.cancel());
        }

        {
            let token = CancellationToken::new();
            group.add(
                "command",
                command::run(spawned, fanout, terminal_events, token.clone()),
                move || token.cancel(),
            );
        }

        {
            let token = CancellationToken::new();
            group.add("signals", wait_for_shutdown_signal(token.clone()), move || {
                token.cancel()
            });
        }

        group.run().await
    }
}

async fn drain_joined(
    mut rx: mpsc::UnboundedReceiver<Client>,
    registry: Arc<ClientRegistry>,
    callback: Option<ClientCallback>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            client = rx.recv() => match client {
                Some(client) => {
                    log::info!(
                        "client joined: {} ({}) {}",
                        client.id,
                        client.addr,
                        client.public_key_fingerprint
                    );
                    if let Err(err) = registry.add(client.clone()) {
                        log::warn!("registering client: {err:#}");
                        continue;
                    }
                    if let Some(callback) = &callback {
                        callback(&client);
                    }
                }
                None => return Ok(()),
            },
        }
    }
}

async fn drain_left(
    mut rx: mpsc::UnboundedReceiver<String>,
    registry: Arc<ClientRegistry>,
    callback: Option<ClientCallback>,
    token: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            id = rx.recv() => match id {
                Some(id) => {
                    if let Some(client) = registry.delete(&id) {
                        log::info!("client left: {} ({})", client.id, client.addr);
                        if let Some(callback) = &callback {
                            callback(&client);
                        }
                    }
                }
                None => return Ok(()),
            },
        }
    }
}

/// On unix both INT and TERM unwind the session gracefully.
async fn wait_for_shutdown_signal(token: CancellationToken) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = token.cancelled() => {}
        _ = interrupt.recv() => log::info!("interrupted, shutting the session down"),
        _ = terminate.recv() => log::info!("terminated, shutting the session down"),
    }
    Ok(())
}

/// The host's own stdout as a fan-out sink.
struct StdoutSink {
    out: tokio::io::Stdout,
}

impl StdoutSink {
    fn new() -> Self {
        Self {
            out: tokio::io::stdout(),
        }
    }
}

#[async_trait]
impl OutputSink for StdoutSink {
    async fn send(&mut self, data: &[u8]) -> io::Result<()> {
        self.out.write_all(data).await?;
        self.out.flush().await
    }
}
