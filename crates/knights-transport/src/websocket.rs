//! WebSocket transport via `tokio-tungstenite`: each binary frame is one
//! packet.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::{PacketConn, TransportError};

/// Counter for unique connection ids (used in log lines).
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

fn io_err(kind: io::ErrorKind, e: impl std::error::Error + Send + Sync + 'static) -> io::Error {
    io::Error::new(kind, e)
}

enum Stream {
    Server(WebSocketStream<TcpStream>),
    Client(WebSocketStream<MaybeTlsStream<TcpStream>>),
}

type ServerSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type ClientSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

enum Sink {
    Server(ServerSink),
    Client(ClientSink),
}

enum Source {
    Server(SplitStream<WebSocketStream<TcpStream>>),
    Client(SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>),
}

/// A WebSocket packet pipe (either direction).
pub struct WsConn {
    id: u64,
    peer: String,
    sink: Mutex<Sink>,
    source: Mutex<Source>,
}

impl WsConn {
    fn new(stream: Stream, peer: String) -> Arc<Self> {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (sink, source) = match stream {
            Stream::Server(ws) => {
                let (tx, rx) = ws.split();
                (Sink::Server(tx), Source::Server(rx))
            }
            Stream::Client(ws) => {
                let (tx, rx) = ws.split();
                (Sink::Client(tx), Source::Client(rx))
            }
        };
        Arc::new(WsConn {
            id,
            peer,
            sink: Mutex::new(sink),
            source: Mutex::new(source),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The remote address as a string, for logging.
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl PacketConn for WsConn {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        let msg = Message::Binary(data.to_vec().into());
        let result = match &mut *self.sink.lock().await {
            Sink::Server(tx) => tx.send(msg).await,
            Sink::Client(tx) => tx.send(msg).await,
        };
        result.map_err(|e| TransportError::SendFailed(io_err(io::ErrorKind::BrokenPipe, e)))
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        loop {
            let msg = match &mut *self.source.lock().await {
                Source::Server(rx) => rx.next().await,
                Source::Client(rx) => rx.next().await,
            };
            match msg {
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.into())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong/text
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(io_err(
                        io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let result = match &mut *self.sink.lock().await {
            Sink::Server(tx) => tx.send(Message::Close(None)).await,
            Sink::Client(tx) => tx.send(Message::Close(None)).await,
        };
        result.map_err(|e| TransportError::SendFailed(io_err(io::ErrorKind::BrokenPipe, e)))
    }
}

/// Listens for incoming WebSocket connections.
pub struct WsListener {
    listener: TcpListener,
}

impl WsListener {
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(TransportError::AcceptFailed)?;
        tracing::info!(addr, "listening");
        Ok(WsListener { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn accept(&self) -> Result<Arc<WsConn>, TransportError> {
        let (stream, addr) = self
            .listener
            .accept()
            .await
            .map_err(TransportError::AcceptFailed)?;
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(|e| {
                TransportError::AcceptFailed(io_err(io::ErrorKind::ConnectionRefused, e))
            })?;
        let conn = WsConn::new(Stream::Server(ws), addr.to_string());
        tracing::debug!(conn = conn.id(), %addr, "accepted connection");
        Ok(conn)
    }
}

/// Connects out to a WebSocket server, e.g. `ws://host:port/`.
pub async fn ws_connect(url: &str) -> Result<Arc<WsConn>, TransportError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::ConnectFailed(io_err(io::ErrorKind::ConnectionRefused, e)))?;
    let conn = WsConn::new(Stream::Client(ws), url.to_owned());
    tracing::debug!(conn = conn.id(), url, "connected");
    Ok(conn)
}
