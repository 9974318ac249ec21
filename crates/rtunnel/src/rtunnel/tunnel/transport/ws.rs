use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use bytes::{Buf, Bytes};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::{
    WebSocketStream,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use url::Url;

use crate::rtunnel::tunnel::session::{BoxedStream, SessionError};

/// Opens a web-socket to `url` and exposes it as a byte stream. User-info in
/// the URL is sent as `Authorization: Basic` and stripped from the request line.
pub async fn connect(url: &Url) -> Result<BoxedStream, SessionError> {
    let auth = basic_authorization(url);

    let mut target = url.clone();
    let _ = target.set_username("");
    let _ = target.set_password(None);

    let mut req = target
        .as_str()
        .into_client_request()
        .map_err(|e| SessionError::WebSocket(e.to_string()))?;
    if let Some(auth) = auth {
        let v = HeaderValue::from_str(&auth).map_err(|e| SessionError::WebSocket(e.to_string()))?;
        req.headers_mut().insert(AUTHORIZATION, v);
    }

    let (ws, _resp) = tokio_tungstenite::connect_async(req)
        .await
        .map_err(|e| SessionError::WebSocket(e.to_string()))?;
    Ok(Box::new(WsByteStream::new(ws)))
}

fn basic_authorization(url: &Url) -> Option<String> {
    // Credentials produced by the identifier codec are URL-safe, so the
    // percent-encoded form equals the raw one.
    let user = url.username();
    if user.is_empty() {
        return None;
    }
    let pass = url.password().unwrap_or("");
    Some(format!("Basic {}", STANDARD.encode(format!("{user}:{pass}"))))
}

/// Byte stream over binary web-socket messages.
pub struct WsByteStream<S> {
    inner: WebSocketStream<S>,
    pending: Bytes,
    eof: bool,
}

impl<S> WsByteStream<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            eof: false,
        }
    }
}

impl<S> AsyncRead for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        loop {
            if !this.pending.is_empty() {
                let n = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending[..n]);
                this.pending.advance(n);
                return Poll::Ready(Ok(()));
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }
            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.pending = Bytes::from(data),
                Some(Ok(Message::Close(_))) | None => this.eof = true,
                // Ping/pong are answered by tungstenite itself.
                Some(Ok(_)) => {}
                Some(Err(err)) => return Poll::Ready(Err(io::Error::other(err))),
            }
        }
    }
}

impl<S> AsyncWrite for WsByteStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        ready!(Pin::new(&mut this.inner).poll_ready(cx)).map_err(io::Error::other)?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(io::Error::other)?;
        // Push the frame out eagerly; a pending flush is retried by the next poll.
        if let Poll::Ready(Err(err)) = Pin::new(&mut this.inner).poll_flush(cx) {
            return Poll::Ready(Err(io::Error::other(err)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_flush(cx)
            .map_err(io::Error::other)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner)
            .poll_close(cx)
            .map_err(io::Error::other)
    }
}
