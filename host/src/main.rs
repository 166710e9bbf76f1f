use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use upterm_host::knownhosts::{
    AcceptNewVerifier, HostKeyVerifier, PromptingVerifier, StdioInteraction,
};
use upterm_host::{authkeys, Host, HostConfig};
use url::Url;

#[derive(Debug, Parser)]
#[command(
    name = "upterm-host",
    about = "Share a terminal session through an upterm rendezvous server",
    version
)]
struct Opt {
    /// Rendezvous server to share the session through
    #[arg(long, default_value = "ssh://uptermd.upterm.dev:22")]
    server: Url,

    /// Attach clients as read-only viewers
    #[arg(long)]
    read_only: bool,

    /// Run this command for each joining client instead of attaching
    /// them to the shared session
    #[arg(long, value_name = "COMMAND")]
    force_command: Option<String>,

    /// Private key for authentication; defaults to the usual ~/.ssh keys
    #[arg(short = 'i', long = "private-key", value_name = "FILE")]
    private_keys: Vec<PathBuf>,

    /// authorized_keys file restricting which clients may join
    #[arg(short = 'a', long = "authorized-keys", value_name = "FILE")]
    authorized_keys: Vec<PathBuf>,

    /// Trust unknown rendezvous hosts without prompting (accept-new)
    #[arg(long)]
    accept_new: bool,

    /// known_hosts file to verify the rendezvous server against
    #[arg(long, value_name = "FILE")]
    known_hosts: Option<PathBuf>,

    /// Keepalive interval in seconds for both tunnel directions
    #[arg(long, default_value_t = 30)]
    keepalive: u64,

    /// Disable the sftp subsystem for clients
    #[arg(long)]
    disable_sftp: bool,

    /// The command to share; defaults to your shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn default_private_keys() -> Vec<PathBuf> {
    let Some(home) = dirs_next::home_dir() else {
        return Vec::new();
    };
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .filter(|path| path.exists())
        .collect()
}

fn load_signers(paths: &[PathBuf]) -> anyhow::Result<Vec<russh::keys::PrivateKey>> {
    let mut signers = Vec::new();
    for path in paths {
        let key = russh::keys::load_secret_key(path, None)
            .with_context(|| format!("loading private key {}", path.display()))?;
        signers.push(key);
    }
    Ok(signers)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let opt = Opt::parse();

    let command = if opt.command.is_empty() {
        vec![std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())]
    } else {
        opt.command.clone()
    };

    let force_command = match &opt.force_command {
        Some(raw) => shell_words::split(raw).context("parsing --force-command")?,
        None => Vec::new(),
    };

    let key_paths = if opt.private_keys.is_empty() {
        default_private_keys()
    } else {
        opt.private_keys.clone()
    };
    let signers = load_signers(&key_paths)?;
    anyhow::ensure!(
        !signers.is_empty(),
        "no usable private key; pass one with --private-key"
    );

    let authorized_keys = authkeys::load_authorized_key_files(&opt.authorized_keys)?;

    let known_hosts = match &opt.known_hosts {
        Some(path) => path.clone(),
        None => dirs_next::home_dir()
            .context("cannot determine the home directory")?
            .join(".ssh")
            .join("known_hosts"),
    };
    let verifier: Arc<dyn HostKeyVerifier> = if opt.accept_new {
        Arc::new(AcceptNewVerifier::new(
            known_hosts,
            Box::new(StdioInteraction),
        ))
    } else {
        Arc::new(PromptingVerifier::new(
            known_hosts,
            Box::new(StdioInteraction),
        ))
    };

    let host_user = std::env::var("USER").unwrap_or_else(|_| "host".to_string());

    Host::new(HostConfig {
        server: opt.server,
        host_user,
        command,
        force_command,
        signers,
        authorized_keys,
        read_only: opt.read_only,
        keepalive: Duration::from_secs(opt.keepalive.max(1)),
        ring_size: upterm_host::multiwriter::DEFAULT_RING_SIZE,
        verifier,
        sftp_disabled: opt.disable_sftp,
        permission_checker: None,
        enable_direct_tcpip: false,
        on_client_joined: None,
        on_client_left: None,
    })
    .run()
    .await
}
