//! Reply delivery back to the client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Weak;

use hickory_proto::op::Message;
use hickory_proto::serialize::binary::BinEncodable;
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Where the reply to one query goes.
pub trait ResponseWriter: Send + Sync + 'static {
    /// The client that sent the query.
    fn peer(&self) -> SocketAddr;

    fn write(&self, response: &Message) -> impl Future<Output = Result<()>> + Send;
}

/// Writes replies through the listening UDP socket.
///
/// Only the listener owns the socket. Once it stops, writes fail with
/// [`Error::ListenerClosed`] and the port is free again.
#[derive(Debug, Clone)]
pub struct UdpResponder {
    socket: Weak<UdpSocket>,
    peer: SocketAddr,
}

impl UdpResponder {
    pub const fn new(socket: Weak<UdpSocket>, peer: SocketAddr) -> Self {
        Self { socket, peer }
    }
}

impl ResponseWriter for UdpResponder {
    fn peer(&self) -> SocketAddr {
        self.peer
    }

    async fn write(&self, response: &Message) -> Result<()> {
        let socket = self.socket.upgrade().ok_or(Error::ListenerClosed)?;
        let bytes = response.to_bytes()?;
        socket.send_to(&bytes, self.peer).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use hickory_proto::serialize::binary::BinDecodable;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Writer that records replies instead of sending them.
    #[derive(Clone)]
    pub struct RecordingWriter {
        pub peer: SocketAddr,
        pub sent: Arc<Mutex<Vec<Message>>>,
        pub fail: bool,
    }

    impl RecordingWriter {
        pub fn new() -> Self {
            Self {
                peer: "127.0.0.1:40000".parse().unwrap(),
                sent: Arc::default(),
                fail: false,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new()
            }
        }

        pub fn sent(&self) -> Vec<Message> {
            self.sent.lock().clone()
        }
    }

    impl ResponseWriter for RecordingWriter {
        fn peer(&self) -> SocketAddr {
            self.peer
        }

        async fn write(&self, response: &Message) -> Result<()> {
            if self.fail {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "client went away",
                )));
            }
            self.sent.lock().push(response.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn should_send_reply_to_peer() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = client.local_addr().unwrap();

        let mut response = Message::new();
        response.set_id(77);
        UdpResponder::new(Arc::downgrade(&server), peer)
            .write(&response)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let len = client.recv(&mut buf).await.unwrap();
        assert_eq!(Message::from_bytes(&buf[..len]).unwrap().id(), 77);
    }

    #[tokio::test]
    async fn should_fail_once_listener_socket_is_dropped() {
        let server = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let responder = UdpResponder::new(Arc::downgrade(&server), "127.0.0.1:40001".parse().unwrap());
        drop(server);

        let result = responder.write(&Message::new()).await;

        assert!(matches!(result, Err(Error::ListenerClosed)));
    }
}
