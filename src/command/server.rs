//! TCP front end speaking the RESP request/reply protocol

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use super::codec;
use super::{execute, Protocol, Reply, Session};
use crate::engine::Engine;

const READ_CHUNK: usize = 16 * 1024;

/// Accept connections until `shutdown` resolves.
pub async fn serve(
    engine: Arc<Engine>,
    listener: TcpListener,
    protocol: Protocol,
    shutdown: impl Future<Output = ()>,
) -> std::io::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        tracing::info!(%addr, "Listening for command connections");
    }
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Command listener shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept connection");
                        continue;
                    }
                };
                let engine = engine.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(engine, stream, peer, protocol).await {
                        tracing::debug!(%peer, error = %e, "Connection closed with error");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    engine: Arc<Engine>,
    mut stream: TcpStream,
    peer: SocketAddr,
    protocol: Protocol,
) -> std::io::Result<()> {
    tracing::debug!(%peer, "Client connected");
    let mut session = Session::new(protocol);
    let mut buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        loop {
            let request = match codec::decode(&mut buf) {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    let reply = Reply::error(&e).to_bytes(session.protocol);
                    stream.write_all(&reply).await?;
                    return Ok(());
                }
            };
            if request.is_empty() {
                continue;
            }

            let engine = engine.clone();
            let mut state = session;
            let (reply, state) = tokio::task::spawn_blocking(move || {
                let reply = execute(&engine, &mut state, &request);
                (reply, state)
            })
            .await
            .map_err(std::io::Error::other)?;
            session = state;

            stream.write_all(&reply.to_bytes(session.protocol)).await?;
            if session.closing {
                tracing::debug!(%peer, "Client quit");
                return Ok(());
            }
        }

        buf.reserve(READ_CHUNK);
        if stream.read_buf(&mut buf).await? == 0 {
            tracing::debug!(%peer, "Client disconnected");
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Settings;

    async fn start() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
        let engine = Engine::with_settings(Settings::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(serve(engine, listener, Protocol::Resp2, async move {
            let _ = rx.await;
        }));
        (addr, tx)
    }

    async fn roundtrip(stream: &mut TcpStream, request: &[u8], expect: &[u8]) {
        stream.write_all(request).await.unwrap();
        let mut got = vec![0u8; expect.len()];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(String::from_utf8_lossy(&got), String::from_utf8_lossy(expect));
    }

    #[tokio::test]
    async fn test_inline_and_array_requests() {
        let (addr, _stop) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, b"PING\r\n", b"+PONG\r\n").await;
        roundtrip(
            &mut stream,
            b"*5\r\n$9\r\nFT.CREATE\r\n$3\r\nidx\r\n$6\r\nSCHEMA\r\n$1\r\nt\r\n$4\r\nTEXT\r\n",
            b"+OK\r\n",
        )
        .await;
        roundtrip(&mut stream, b"HSET d t hello\r\n", b":1\r\n").await;
        roundtrip(
            &mut stream,
            b"SEARCH idx hello NOCONTENT\r\n",
            b"*2\r\n:1\r\n$1\r\nd\r\n",
        )
        .await;
    }

    #[tokio::test]
    async fn test_hello_switches_protocol() {
        let (addr, _stop) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let hello = Reply::map([
            ("server", Reply::bulk(env!("CARGO_PKG_NAME"))),
            ("version", Reply::bulk(env!("CARGO_PKG_VERSION"))),
            ("proto", Reply::Integer(3)),
            ("mode", Reply::bulk("standalone")),
        ]);
        roundtrip(&mut stream, b"HELLO 3\r\n", &hello.to_bytes(Protocol::Resp3)).await;
        roundtrip(&mut stream, b"FT.GET nope x\r\n", b"-NOINDEX").await;
    }

    #[tokio::test]
    async fn test_quit_closes_connection() {
        let (addr, _stop) = start().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        roundtrip(&mut stream, b"QUIT\r\n", b"+OK\r\n").await;
        let mut buf = [0u8; 1];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
    }
}
