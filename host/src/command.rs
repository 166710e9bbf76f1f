//! The actor driving the host's own command under the shared pty.
//!
//! Spawns the command sized to the host terminal, switches the host
//! tty to raw mode, watches for window changes, and runs three pumps:
//! host stdin into the pty, pty output into the fan-out, and the child
//! wait.  Whichever finishes first unwinds the others; cancellation
//! kills the child's process group and reaps it.

use std::ffi::OsString;
use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::Context as _;
use crossterm::tty::IsTty;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use upterm_pty::{Child, CommandBuilder, PtySize};

use crate::multiwriter::MultiWriter;
use crate::terminal::{PtyRef, TerminalEventTx, LOCAL_TERMINAL_ID};

pub struct LocalCommand {
    pub command: Vec<String>,
    /// Extra environment exported to the child, e.g. the admin socket.
    pub env: Vec<(String, String)>,
}

pub struct SpawnedCommand {
    pub pty: PtyRef,
    child: Box<dyn Child>,
}

/// Spawn the command under a fresh pty sized to the host terminal (or
/// the usual 80x24 when stdin is not a tty).
pub fn spawn(config: &LocalCommand) -> anyhow::Result<SpawnedCommand> {
    anyhow::ensure!(!config.command.is_empty(), "no command to run");

    let size = host_terminal_size();
    let pair = upterm_pty::openpty(size).context("opening the session pty")?;

    let argv: Vec<OsString> = config.command.iter().map(Into::into).collect();
    let mut cmd = CommandBuilder::from_argv(argv);
    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .context("spawning the session command")?;

    Ok(SpawnedCommand {
        pty: Arc::from(pair.master),
        child,
    })
}

fn host_terminal_size() -> PtySize {
    if std::io::stdin().is_tty() {
        if let Ok((cols, rows)) = crossterm::terminal::size() {
            if cols > 0 && rows > 0 {
                return PtySize::new(rows, cols);
            }
        }
    }
    PtySize::default()
}

/// Restores the host terminal on unwind, however the actor exits.
struct RawModeGuard {
    active: bool,
}

impl RawModeGuard {
    fn enable() -> Self {
        match crossterm::terminal::enable_raw_mode() {
            Ok(()) => Self { active: true },
            Err(err) => {
                log::warn!("could not switch the terminal to raw mode: {err}");
                Self { active: false }
            }
        }
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if self.active {
            if let Err(err) = crossterm::terminal::disable_raw_mode() {
                log::warn!("could not restore the terminal: {err}");
            }
        }
    }
}

/// Run the command actor to completion.
pub async fn run(
    spawned: SpawnedCommand,
    fanout: Arc<MultiWriter>,
    events: TerminalEventTx,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let SpawnedCommand { pty, mut child } = spawned;
    let interactive = std::io::stdin().is_tty();

    let _raw = interactive.then(RawModeGuard::enable);

    if interactive {
        let size = host_terminal_size();
        events.window_changed(&pty, LOCAL_TERMINAL_ID, size.cols, size.rows);
    }

    // Window-change watcher: SIGWINCH on unix.
    let winch_task = if interactive {
        let events = events.clone();
        let pty = pty.clone();
        let token = token.clone();
        Some(tokio::spawn(async move {
            let Ok(mut winch) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::window_change())
            else {
                return;
            };
            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    received = winch.recv() => {
                        if received.is_none() {
                            return;
                        }
                        if let Ok((cols, rows)) = crossterm::terminal::size() {
                            events.window_changed(&pty, LOCAL_TERMINAL_ID, cols, rows);
                        }
                    }
                }
            }
        }))
    } else {
        None
    };

    // Pump 1: host stdin -> pty.  The blocking read is left behind on
    // cancel; it dies with the process.
    {
        let writer = pty.take_writer().context("cloning the pty writer")?;
        let token = token.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer;
            let mut stdin = std::io::stdin();
            let mut buf = [0u8; 4096];
            loop {
                if token.is_cancelled() {
                    return;
                }
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Pump 2: pty -> fan-out.  A read of 0 covers both EOF and the
    // EIO-after-slave-close quirk, which the pty layer normalizes.
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(32);
    {
        let mut reader = pty.try_clone_reader().context("cloning the pty reader")?;
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 8192];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                }
            }
        });
    }

    // Pump 3: reap the child.
    let pid = child.process_id();
    let mut wait_task = tokio::task::spawn_blocking(move || child.wait());

    let mut out_done = false;
    let result = loop {
        tokio::select! {
            _ = token.cancelled() => {
                upterm_pty::unix::kill_process_group(pid).ok();
                // Reap so the child doesn't linger as a zombie.
                wait_task.await.ok();
                break Ok(());
            }
            status = &mut wait_task => {
                // Flush whatever output is still in flight; short-lived
                // commands would otherwise lose their final lines.
                while let Ok(Some(data)) = tokio::time::timeout(
                    std::time::Duration::from_millis(50),
                    out_rx.recv(),
                )
                .await
                {
                    if fanout.write(&data).await.is_err() {
                        break;
                    }
                }
                match status {
                    Ok(Ok(status)) if status.success() => break Ok(()),
                    Ok(Ok(status)) => {
                        log::info!("command exited with status {}", status.exit_code());
                        break Ok(());
                    }
                    Ok(Err(err)) => break Err(err).context("waiting for the command"),
                    Err(err) => break Err(err).context("waiting for the command"),
                }
            }
            data = out_rx.recv(), if !out_done => {
                match data {
                    Some(data) => {
                        if let Err(err) = fanout.write(&data).await {
                            upterm_pty::unix::kill_process_group(pid).ok();
                            wait_task.await.ok();
                            break Err(err).context("writing session output");
                        }
                    }
                    // Pty closed; the wait pump will deliver the status.
                    None => out_done = true,
                }
            }
        }
    };

    events.detached(&pty, LOCAL_TERMINAL_ID);
    if let Some(task) = winch_task {
        task.abort();
    }
    result
}
