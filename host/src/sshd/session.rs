//! Per-connection handling for the embedded SSH server: public-key
//! auth, interactive attach to the shared pty, force-command sessions,
//! window changes, the sftp subsystem, and optional direct-tcpip.

use std::collections::HashMap;
use std::ffi::OsString;
use std::io::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::keys::ssh_key::Certificate;
use russh::keys::{HashAlg, PublicKey};
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use tokio::sync::mpsc;
use upterm_pty::{CommandBuilder, PtySize};
use uuid::Uuid;

use super::sftp::{SftpClientInfo, SftpSession};
use super::{ChannelSink, SshdContext};
use crate::api::Client;
use crate::multiwriter::SinkId;
use crate::terminal::{PtyRef, Window};
use crate::wire::Identifier;

/// Written to a viewer's stream the moment it attaches in read-only
/// mode; the viewer's keystrokes are then discarded.
pub const READ_ONLY_BANNER: &str = "\r\n=== Attached to read-only session ===\r\n\r\n";

type SharedWriter = Arc<Mutex<Box<dyn std::io::Write + Send>>>;

struct ForceSession {
    writer: SharedWriter,
    pty: PtyRef,
    child_pid: u32,
}

pub(crate) struct ConnHandler {
    ctx: Arc<SshdContext>,
    /// Doubles as the terminal id and the client id for this session.
    session_id: String,
    client: Option<Client>,
    joined_emitted: bool,
    term: String,
    window: Window,
    pty_requested: bool,
    /// Channels opened but not yet consumed by a subsystem.
    channels: HashMap<ChannelId, Channel<Msg>>,
    /// The channel carrying the interactive session, once one started.
    interactive_channel: Option<ChannelId>,
    attached_sink: Option<SinkId>,
    shared_writer: Option<SharedWriter>,
    force: Option<ForceSession>,
}

impl ConnHandler {
    pub(crate) fn new(ctx: Arc<SshdContext>) -> Self {
        Self {
            ctx,
            session_id: Uuid::new_v4().to_string(),
            client: None,
            joined_emitted: false,
            term: "xterm-256color".to_string(),
            window: Window::default(),
            pty_requested: false,
            channels: HashMap::new(),
            interactive_channel: None,
            attached_sink: None,
            shared_writer: None,
            force: None,
        }
    }

    /// Record who is knocking.  The `user` field carries the client's
    /// encoded identifier with its address and version banner.
    fn note_client(&mut self, user: &str, fingerprint: String) {
        let (addr, version) = match Identifier::decode(user) {
            Ok(id) => (
                id.addr.unwrap_or_default(),
                id.version.unwrap_or_default(),
            ),
            Err(err) => {
                log::debug!("client sent an opaque user field: {err:#}");
                (String::new(), String::new())
            }
        };
        self.client = Some(Client {
            id: self.session_id.clone(),
            addr,
            version,
            public_key_fingerprint: fingerprint,
        });
    }

    fn key_authorized(&self, presented: &russh::keys::ssh_key::public::KeyData) -> Auth {
        if super::key_is_authorized(&self.ctx.authorized_keys, presented) {
            Auth::Accept
        } else {
            Auth::Reject {
                proceed_with_methods: None,
                partial_success: false,
            }
        }
    }

    fn sftp_client_info(&self) -> SftpClientInfo {
        SftpClientInfo {
            session_id: self.session_id.clone(),
            fingerprint: self
                .client
                .as_ref()
                .map(|c| c.public_key_fingerprint.clone())
                .unwrap_or_default(),
        }
    }

    /// Attach this session as a viewer/participant of the shared pty.
    async fn attach_shared(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> anyhow::Result<()> {
        if self.ctx.read_only {
            // The banner goes out before the ring replay so the stream
            // visibly starts with it.
            session.data(channel, CryptoVec::from_slice(READ_ONLY_BANNER.as_bytes()))?;
        } else {
            let writer = self.ctx.shared_pty.take_writer()?;
            self.shared_writer = Some(Arc::new(Mutex::new(writer)));
        }

        let sink = Box::new(ChannelSink::new(session.handle(), channel));
        let sink_id = self.ctx.fanout.append(sink, false).await?;
        self.attached_sink = Some(sink_id);

        self.ctx.terminal_events.window_changed(
            &self.ctx.shared_pty,
            &self.session_id,
            self.window.width,
            self.window.height,
        );
        log::info!("client {} attached", self.session_id);
        Ok(())
    }

    /// Spawn the force command on a pty of its own, bound to this
    /// client's channel.
    fn start_force_command(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> anyhow::Result<()> {
        let argv: Vec<OsString> = self.ctx.force_command.iter().map(Into::into).collect();
        let mut cmd = CommandBuilder::from_argv(argv);
        cmd.env("TERM", &self.term);

        let size = PtySize::new(self.window.height.max(1), self.window.width.max(1));
        let pair = upterm_pty::openpty(size)?;
        let mut child = pair.slave.spawn_command(cmd)?;
        let child_pid = child.process_id();
        let master: PtyRef = Arc::from(pair.master);

        let writer = Arc::new(Mutex::new(master.take_writer()?));
        let reader = master.try_clone_reader()?;

        self.ctx.terminal_events.window_changed(
            &master,
            &self.session_id,
            self.window.width,
            self.window.height,
        );

        let handle = session.handle();
        pump_reader_to_channel(reader, handle.clone(), channel);
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let code = match status {
                Ok(Ok(status)) => status.exit_code(),
                _ => 1,
            };
            handle.exit_status_request(channel, code).await.ok();
            handle.eof(channel).await.ok();
            handle.close(channel).await.ok();
        });

        self.force = Some(ForceSession {
            writer,
            pty: master,
            child_pid,
        });
        log::info!(
            "client {} running force command on its own pty",
            self.session_id
        );
        Ok(())
    }

    /// Undo whatever the interactive session contributed to the shared
    /// state: its fan-out sink, its coordinator entries, and a running
    /// force command's process tree.
    fn detach(&mut self) {
        if let Some(sink_id) = self.attached_sink.take() {
            let fanout = self.ctx.fanout.clone();
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { fanout.remove(sink_id).await });
            }
            self.ctx
                .terminal_events
                .detached(&self.ctx.shared_pty, &self.session_id);
        }
        self.shared_writer = None;
        if let Some(force) = self.force.take() {
            if let Err(err) = upterm_pty::unix::kill_process_group(force.child_pid) {
                log::debug!("force command already gone: {err}");
            }
            self.ctx
                .terminal_events
                .detached(&force.pty, &self.session_id);
        }
    }
}

impl Drop for ConnHandler {
    fn drop(&mut self) {
        self.detach();
        if self.joined_emitted {
            self.joined_emitted = false;
            self.ctx
                .clients_left
                .send(self.session_id.clone())
                .ok();
            log::info!("client {} left", self.session_id);
        }
    }
}

impl Handler for ConnHandler {
    type Error = anyhow::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        self.note_client(user, key.fingerprint(HashAlg::Sha256).to_string());
        Ok(self.key_authorized(key.key_data()))
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        // Compare the key carried inside the certificate, not the
        // signed envelope, so a cert wrapping an authorized key passes.
        let key = PublicKey::new(certificate.public_key().clone(), "");
        self.note_client(user, key.fingerprint(HashAlg::Sha256).to_string());
        Ok(self.key_authorized(key.key_data()))
    }

    async fn auth_succeeded(&mut self, _session: &mut Session) -> Result<(), Self::Error> {
        // Joined strictly precedes any data delivered to the client.
        if let Some(client) = self.client.clone() {
            self.joined_emitted = true;
            self.ctx.clients_joined.send(client).ok();
        }
        Ok(())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), channel);
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.pty_requested = true;
        self.term = term.to_string();
        self.window = Window {
            width: col_width as u16,
            height: row_height as u16,
        };
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if !self.pty_requested {
            session.data(
                channel,
                CryptoVec::from_slice(b"PTY allocation is required (try ssh -t)\r\n"),
            )?;
            session.exit_status_request(channel, 1)?;
            session.close(channel)?;
            return Ok(());
        }

        // The channel object is not needed for the interactive path;
        // input arrives through the data callback.
        self.channels.remove(&channel);
        self.interactive_channel = Some(channel);

        if self.ctx.force_command.is_empty() {
            self.attach_shared(channel, session).await?;
        } else if let Err(err) = self.start_force_command(channel, session) {
            log::error!("spawning force command: {err:#}");
            session.data(
                channel,
                CryptoVec::from_slice(b"failed to start the session command\r\n"),
            )?;
            session.exit_status_request(channel, 1)?;
            session.close(channel)?;
            return Ok(());
        }
        session.channel_success(channel)?;
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        _data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // Clients share the host's command or the configured force
        // command; arbitrary exec is never offered.
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn data(
        &mut self,
        _channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let writer = if let Some(force) = &self.force {
            Some(force.writer.clone())
        } else if self.ctx.read_only {
            // Read-only viewers' keystrokes never reach the pty.
            None
        } else {
            self.shared_writer.clone()
        };
        if let Some(writer) = writer {
            let mut writer = writer.lock();
            if let Err(err) = writer.write_all(data) {
                log::warn!("writing client input to pty: {err}");
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        _channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.window = Window {
            width: col_width as u16,
            height: row_height as u16,
        };
        let pty = match &self.force {
            Some(force) => force.pty.clone(),
            None => self.ctx.shared_pty.clone(),
        };
        self.ctx.terminal_events.window_changed(
            &pty,
            &self.session_id,
            self.window.width,
            self.window.height,
        );
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel_id: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if name != "sftp" || self.ctx.sftp_disabled {
            log::debug!("rejecting subsystem {name:?}");
            session.channel_failure(channel_id)?;
            return Ok(());
        }
        let Some(channel) = self.channels.remove(&channel_id) else {
            session.channel_failure(channel_id)?;
            return Ok(());
        };

        let sftp = SftpSession::new(
            self.ctx.read_only,
            self.ctx.permission_checker.clone(),
            self.sftp_client_info(),
        )?;
        session.channel_success(channel_id)?;
        tokio::spawn(async move {
            russh_sftp::server::run(channel.into_stream(), sftp).await;
        });
        Ok(())
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if !self.ctx.enable_direct_tcpip {
            log::debug!(
                "denying direct-tcpip to {host_to_connect}:{port_to_connect} \
                 (originator {originator_address}:{originator_port})"
            );
            return Ok(false);
        }
        log::info!(
            "client {} forwarding to {host_to_connect}:{port_to_connect}",
            self.session_id
        );
        let target = (host_to_connect.to_string(), port_to_connect as u16);
        tokio::spawn(async move {
            match tokio::net::TcpStream::connect(target.clone()).await {
                Ok(mut upstream) => {
                    let mut stream = channel.into_stream();
                    if let Err(err) =
                        tokio::io::copy_bidirectional(&mut stream, &mut upstream).await
                    {
                        log::debug!("direct-tcpip to {}:{} ended: {err}", target.0, target.1);
                    }
                }
                Err(err) => {
                    log::warn!("direct-tcpip connect to {}:{} failed: {err}", target.0, target.1);
                }
            }
        });
        Ok(true)
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.channels.remove(&channel).is_some() {
            session.close(channel)?;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if self.interactive_channel == Some(channel) {
            self.interactive_channel = None;
            self.detach();
        }
        Ok(())
    }
}

/// Bridge a blocking pty reader onto a client channel.  The blocking
/// read lives on the blocking pool; a bounded queue hands the bytes to
/// the async side.
fn pump_reader_to_channel(
    mut reader: Box<dyn std::io::Read + Send>,
    handle: russh::server::Handle,
    channel: ChannelId,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(32);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if handle
                .data(channel, CryptoVec::from_slice(&data))
                .await
                .is_err()
            {
                break;
            }
        }
    });
}
