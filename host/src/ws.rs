//! SSH over WebSocket: the transport used when the rendezvous URL is
//! `ws://` or `wss://`.
//!
//! The upgrade request carries Basic auth with the encoded host
//! identifier as the username, plus the host banner in a vendor header.
//! After the upgrade, binary frames carry the raw SSH transport; this
//! adapter exposes them as `AsyncRead + AsyncWrite` so the SSH client
//! cannot tell it apart from a TCP stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use anyhow::Context as _;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::wire;

pub struct WsTransport {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
    /// Bytes of a binary frame not yet handed to the reader.
    pending: Vec<u8>,
    offset: usize,
}

/// Establish the WebSocket connection and return the framed transport.
pub async fn connect(url: &Url, user: &str) -> anyhow::Result<WsTransport> {
    let mut request = url
        .as_str()
        .into_client_request()
        .with_context(|| format!("building upgrade request for {url}"))?;

    let basic = STANDARD.encode(format!("{user}:"));
    request.headers_mut().insert(
        AUTHORIZATION,
        format!("Basic {basic}")
            .parse()
            .context("encoding authorization header")?,
    );
    request.headers_mut().insert(
        wire::CLIENT_VERSION_HEADER,
        wire::HOST_SSH_CLIENT_VERSION
            .parse()
            .context("encoding version header")?,
    );

    let (inner, _response) = connect_async(request)
        .await
        .with_context(|| format!("websocket handshake with {url}"))?;

    Ok(WsTransport {
        inner,
        pending: Vec::new(),
        offset: 0,
    })
}

fn to_io_error(err: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl AsyncRead for WsTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        loop {
            if self.offset < self.pending.len() {
                let n = buf.remaining().min(self.pending.len() - self.offset);
                let offset = self.offset;
                buf.put_slice(&self.pending[offset..offset + n]);
                self.offset += n;
                return Poll::Ready(Ok(()));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(to_io_error(err))),
                Poll::Ready(Some(Ok(Message::Binary(frame)))) => {
                    self.pending = frame;
                    self.offset = 0;
                }
                Poll::Ready(Some(Ok(Message::Close(_)))) => return Poll::Ready(Ok(())),
                // Pings are answered by the websocket layer itself;
                // text and pong frames carry nothing for the tunnel.
                Poll::Ready(Some(Ok(_))) => continue,
            }
        }
    }
}

impl AsyncWrite for WsTransport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match Pin::new(&mut self.inner).poll_ready(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(err)) => return Poll::Ready(Err(to_io_error(err))),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(to_io_error)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(to_io_error)
    }
}
