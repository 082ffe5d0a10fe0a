//! TCP transport.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use super::channel::{ChannelWriter, NetworkChannel, NetworkError, QueuedChannel};
use super::packet::PacketCodec;
use super::session::Session;

/// Attach a session to an accepted or connected stream and start its I/O task.
pub fn spawn_connection<F>(stream: TcpStream, addr: SocketAddr, max_body: usize, make_session: F) -> Session
where
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    if let Err(e) = stream.set_nodelay(true) {
        debug!("Failed to set TCP_NODELAY for {}: {}", addr, e);
    }
    let (channel, writer) = QueuedChannel::new(Some(addr));
    let session = make_session(Arc::new(channel));
    let codec = PacketCodec::new(max_body).with_peer(addr);
    tokio::spawn(run(Framed::new(stream, codec), addr, writer, session.clone()));
    session
}

/// Connect to `addr`.
pub async fn connect<F>(addr: SocketAddr, max_body: usize, make_session: F) -> Result<Session, NetworkError>
where
    F: FnOnce(Arc<dyn NetworkChannel>) -> Session,
{
    let stream = TcpStream::connect(addr).await?;
    Ok(spawn_connection(stream, addr, max_body, make_session))
}

async fn run(framed: Framed<TcpStream, PacketCodec>, addr: SocketAddr, writer: ChannelWriter, session: Session) {
    let (mut sink, mut stream) = framed.split();
    let ChannelWriter { mut rx, closed } = writer;

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(pack)) => session.receive(pack),
                    Some(Err(e)) => {
                        warn!("Protocol error from {}: {}", addr, e);
                        break;
                    }
                    None => {
                        debug!("{} closed the connection", addr);
                        break;
                    }
                }
            }
            outgoing = rx.recv() => {
                let Some(pack) = outgoing else { break };
                if let Err(e) = sink.send(pack).await {
                    debug!("Write to {} failed: {}", addr, e);
                    break;
                }
            }
            _ = closed.notified() => {
                while let Ok(pack) = rx.try_recv() {
                    if sink.feed(pack).await.is_err() {
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
