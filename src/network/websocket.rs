//! WebSocket transport. One binary message carries one packet.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tracing::{debug, warn};

use super::channel::{ChannelWriter, NetworkChannel, NetworkError, QueuedChannel};
use super::packet::{hex_prefix, PackInfo};
use super::session::Session;

/// Complete the server handshake and start the I/O task.
pub async fn accept<F>(stream: TcpStream, addr: SocketAddr, max_body: usize, make_session: F) -> Result<Session, NetworkError>
where
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    let ws = accept_async(stream).await?;
    Ok(spawn_connection(ws, addr, max_body, make_session))
}

/// Connect to `ws://addr`.
pub async fn connect<F>(addr: SocketAddr, max_body: usize, make_session: F) -> Result<Session, NetworkError>
where
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    let (ws, _response) = connect_async(format!("ws://{}", addr)).await?;
    Ok(spawn_connection(ws, addr, max_body, make_session))
}

fn spawn_connection<S, F>(ws: WebSocketStream<S>, addr: SocketAddr, max_body: usize, make_session: F) -> Session
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    let (channel, writer) = QueuedChannel::new(Some(addr));
    let session = make_session(Arc::new(channel));
    tokio::spawn(run(ws, addr, max_body, writer, session.clone()));
    session
}

async fn run<S>(ws: WebSocketStream<S>, addr: SocketAddr, max_body: usize, writer: ChannelWriter, session: Session)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();
    let ChannelWriter { mut rx, closed } = writer;

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Binary(data))) => {
                        let data = Bytes::from(data);
                        match PackInfo::decode(data.clone(), max_body) {
                            Ok(pack) => session.receive(pack),
                            Err(e) => {
                                warn!("Protocol error from {}: {} ({})", addr, e, hex_prefix(&data));
                                break;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("{} closed the connection", addr);
                        break;
                    }
                    Some(Ok(WsMessage::Text(_))) => {
                        warn!("Text frame from {}, expected binary", addr);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                }
            }
            outgoing = rx.recv() => {
                let Some(pack) = outgoing else { break };
                if let Err(e) = sink.send(WsMessage::Binary(pack.to_bytes().to_vec())).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
            _ = closed.notified() => {
                while let Ok(pack) = rx.try_recv() {
                    if sink.feed(WsMessage::Binary(pack.to_bytes().to_vec())).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    let _ = sink.close().await;
    session.dispose();
}
