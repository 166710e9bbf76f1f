//! Local admin RPC: session metadata over a user-private Unix socket.
//!
//! The spawned command finds the socket through `UPTERM_ADMIN_SOCKET`,
//! which lets `upterm session current` style tooling introspect the
//! running session.  Confidentiality comes from filesystem permissions:
//! the socket directory is 0700 and the socket itself 0600.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use crate::api::{GetSessionResponse, Session};
use crate::registry::ClientRegistry;

#[derive(Clone)]
pub struct AdminState {
    pub session: Arc<Session>,
    pub registry: Arc<ClientRegistry>,
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/session", get(get_session))
        .with_state(state)
}

async fn get_session(State(state): State<AdminState>) -> Json<GetSessionResponse> {
    Json(GetSessionResponse::new(
        &state.session,
        state.registry.clients(),
    ))
}

/// The per-session socket path under the user's runtime directory.
pub fn socket_path(session_id: &str) -> anyhow::Result<PathBuf> {
    let base = dirs_next::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("upterm");
    Ok(base.join(format!("{session_id}.sock")))
}

/// Serve the admin API until the token fires; the socket file is
/// removed on the way out.
pub async fn serve(
    path: PathBuf,
    state: AdminState,
    token: CancellationToken,
) -> anyhow::Result<()> {
    let listener = bind_socket(&path)?;
    let app = router(state);

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(token.cancelled_owned())
        .await
        .with_context(|| format!("serving admin API on {}", path.display()));

    if let Err(err) = std::fs::remove_file(&path) {
        if err.kind() != std::io::ErrorKind::NotFound {
            log::debug!("removing admin socket {}: {err}", path.display());
        }
    }
    result
}

/// Bind the unix listener, creating a user-owned directory for it and
/// clearing out a stale socket from a previous run.
fn bind_socket(path: &Path) -> anyhow::Result<tokio::net::UnixListener> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("admin socket path {} has no parent dir", path.display()))?;

    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o700);
    }
    builder
        .create(dir)
        .with_context(|| format!("creating {}", dir.display()))?;

    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }

    let listener = tokio::net::UnixListener::bind(path)
        .with_context(|| format!("binding admin socket {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restricting {}", path.display()))?;
    }

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::Client;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state() -> AdminState {
        let session = Session {
            id: "sess-1".into(),
            host: "ssh://uptermd.example:22".into(),
            advised_host: "ssh://uptermd.example:22".into(),
            node_addr: "node-1".into(),
            ssh_user: "sess-1:user".into(),
            command: vec!["bash".into(), "-l".into()],
            force_command: vec![],
            authorized_keys: vec![],
            read_only: false,
            sftp_disabled: true,
        };
        AdminState {
            session: Arc::new(session),
            registry: Arc::new(ClientRegistry::new()),
        }
    }

    #[tokio::test]
    async fn get_session_includes_live_clients() {
        let state = state();
        state
            .registry
            .add(Client {
                id: "c1".into(),
                addr: "203.0.113.5:1022".into(),
                version: "SSH-2.0-OpenSSH_9.6".into(),
                public_key_fingerprint: "SHA256:zzz".into(),
            })
            .unwrap();
        let app = router(state);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        k9::assert_equal!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: GetSessionResponse = serde_json::from_slice(&body).unwrap();
        k9::assert_equal!(parsed.session_id, "sess-1");
        k9::assert_equal!(parsed.connected_clients.len(), 1);
        k9::assert_equal!(parsed.connected_clients[0].id, "c1");
        assert!(parsed.sftp_disabled);
    }

    #[tokio::test]
    async fn serve_removes_socket_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin").join("sess.sock");
        let token = CancellationToken::new();
        let handle = tokio::spawn(serve(path.clone(), state(), token.clone()));

        // Wait for the socket to appear, then shut down.
        for _ in 0..50 {
            if path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(path.exists());
        token.cancel();
        handle.await.unwrap().unwrap();
        assert!(!path.exists());
    }
}
