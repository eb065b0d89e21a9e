use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("send failed: {0}")]
    Send(String),
    #[error("receive failed: {0}")]
    Receive(String),
}

/// Opens feed connections. One call per (re)connect attempt.
pub trait FeedTransport: Send + Sync + 'static {
    type Conn: FeedConnection;

    fn connect(&self) -> impl Future<Output = Result<Self::Conn, TransportError>> + Send;
}

/// Inbound frame. Control frames only prove the peer is still there.
#[derive(Debug)]
pub enum Frame {
    Text(String),
    Heartbeat,
}

/// A text-framed duplex connection.
///
/// `next_frame` must be cancel-safe: it is raced against timers and shutdown.
pub trait FeedConnection: Send + 'static {
    fn send_text(&mut self, text: String)
        -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_ping(&mut self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// `None` once the peer has closed the stream.
    fn next_frame(&mut self) -> impl Future<Output = Option<Result<Frame, TransportError>>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

pub struct WsTransport {
    url: String,
}

impl WsTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl FeedTransport for WsTransport {
    type Conn = WsConnection;

    async fn connect(&self) -> Result<WsConnection, TransportError> {
        let (stream, _response) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        Ok(WsConnection { stream })
    }
}

pub struct WsConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FeedConnection for WsConnection {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.stream
            .send(Message::Ping(Vec::new()))
            .await
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Frame::Text(text))),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => return Some(Ok(Frame::Text(text))),
                    Err(_) => continue,
                },
                // Pings are answered by tungstenite on the next read or write.
                Ok(Message::Ping(_) | Message::Pong(_)) => return Some(Ok(Frame::Heartbeat)),
                Ok(Message::Close(_)) => return None,
                Ok(Message::Frame(_)) => continue,
                Err(e) => return Some(Err(TransportError::Receive(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Channel-backed transport for driving the connection manager in tests.

    use super::{FeedConnection, FeedTransport, Frame, TransportError};
    use tokio::sync::{mpsc, Mutex};

    /// The test's side of one connection.
    pub struct Peer {
        pub sent: mpsc::UnboundedReceiver<String>,
        pub pings: mpsc::UnboundedReceiver<()>,
        pub inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    }

    impl Peer {
        pub async fn next_sent(&mut self) -> serde_json::Value {
            let text = self.sent.recv().await.expect("connection dropped");
            serde_json::from_str(&text).expect("client sent invalid json")
        }

        pub fn push(&self, text: &str) {
            let _ = self.inbound.send(Ok(Frame::Text(text.to_string())));
        }

        pub fn pong(&self) {
            let _ = self.inbound.send(Ok(Frame::Heartbeat));
        }
    }

    pub struct ChannelConnection {
        sent: mpsc::UnboundedSender<String>,
        pings: mpsc::UnboundedSender<()>,
        inbound: mpsc::UnboundedReceiver<Result<Frame, TransportError>>,
    }

    impl FeedConnection for ChannelConnection {
        async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
            self.sent
                .send(text)
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn send_ping(&mut self) -> Result<(), TransportError> {
            self.pings
                .send(())
                .map_err(|e| TransportError::Send(e.to_string()))
        }

        async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
            self.inbound.recv().await
        }

        async fn close(&mut self) {
            self.inbound.close();
        }
    }

    /// Each `connect` takes the next queued outcome; an empty, closed queue
    /// fails every attempt and an empty, open one hangs like a silent peer.
    pub struct ChannelTransport {
        queue: Mutex<mpsc::UnboundedReceiver<Result<ChannelConnection, TransportError>>>,
    }

    pub struct Dialer {
        tx: mpsc::UnboundedSender<Result<ChannelConnection, TransportError>>,
    }

    impl Dialer {
        /// Queue a successful connection and return its peer side.
        pub fn accept(&self) -> Peer {
            let (sent_tx, sent_rx) = mpsc::unbounded_channel();
            let (ping_tx, ping_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let _ = self.tx.send(Ok(ChannelConnection {
                sent: sent_tx,
                pings: ping_tx,
                inbound: in_rx,
            }));
            Peer {
                sent: sent_rx,
                pings: ping_rx,
                inbound: in_tx,
            }
        }

        pub fn refuse(&self) {
            let _ = self
                .tx
                .send(Err(TransportError::Connect("refused".to_string())));
        }
    }

    pub fn channel_transport() -> (ChannelTransport, Dialer) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ChannelTransport {
                queue: Mutex::new(rx),
            },
            Dialer { tx },
        )
    }

    impl FeedTransport for ChannelTransport {
        type Conn = ChannelConnection;

        async fn connect(&self) -> Result<ChannelConnection, TransportError> {
            let mut queue = self.queue.lock().await;
            let next = queue.recv().await;
            next.unwrap_or_else(|| Err(TransportError::Connect("no more connections".to_string())))
        }
    }
}
