//! Connection and Listener: framed TCP transport.
//!
//! A [`Connection`] owns one framed duplex stream to a single peer. Each
//! connection runs a dedicated receive task that reads frames, decodes them
//! and hands every message to the owner's [`EventHandler`] inline, so handler
//! code for different connections of the same owner runs concurrently.
//! Sends on one connection are serialized; sends on different connections
//! proceed independently.
//!
//! Any I/O error or peer close ends the receive task for good. There is no
//! reconnection: later sends on that connection fail with
//! [`WireError::ConnectionClosed`].

use crate::error::WireError;
use crate::frame::{read_frame, write_frame};
use crate::message::Message;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Trait for the owner of a set of connections to handle inbound traffic.
///
/// The receive task of each connection calls these methods; implementations
/// must treat their own state as shared between connections.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    /// Called once per connection before its first message is read.
    async fn on_connect(&self, _conn: &Connection) {}

    /// Called for every decoded message, in arrival order per connection.
    async fn on_event(&self, conn: &Connection, msg: Message);

    /// Called once when the receive loop ends on a close or I/O error.
    async fn on_disconnect(&self, conn: &Connection, reason: &WireError) {
        debug!(peer = %conn.peer_addr(), reason = %reason, "Connection ended");
    }

    /// Called when the stream is desynchronized and cannot be trusted.
    ///
    /// The default terminates the process.
    fn on_fatal(&self, conn: &Connection, err: &WireError) {
        error!(
            peer = %conn.peer_addr(),
            error = %err,
            "Protocol desync, aborting"
        );
        std::process::abort();
    }
}

struct Inner {
    id: u64,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    writer: Mutex<BoxedWriter>,
    open: AtomicBool,
}

/// A framed connection to one peer. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("peer_addr", &self.inner.peer_addr)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Connect to a remote listener and start receiving.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, WireError> {
        let stream = TcpStream::connect(addr).await?;
        Self::from_stream(stream, handler)
    }

    /// Wrap an established TCP stream and start its receive task.
    pub fn from_stream(
        stream: TcpStream,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Self, WireError> {
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_io(reader, writer, peer_addr, local_addr, handler))
    }

    /// Build a connection over arbitrary halves of a byte stream.
    pub fn from_io<R, W>(
        reader: R,
        writer: W,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        handler: Arc<dyn EventHandler>,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let conn = Self {
            inner: Arc::new(Inner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                peer_addr,
                local_addr,
                writer: Mutex::new(Box::new(writer)),
                open: AtomicBool::new(true),
            }),
        };
        tokio::spawn(receive_loop(reader, conn.clone(), handler));
        conn
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Address of the local end.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Whether the receive loop is still running.
    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Send one message. Concurrent senders on this connection are serialized.
    pub async fn send(&self, msg: &Message) -> Result<(), WireError> {
        if !self.is_open() {
            return Err(WireError::ConnectionClosed);
        }
        let mut writer = self.inner.writer.lock().await;
        if let Err(e) = write_frame(&mut *writer, msg).await {
            if !matches!(e, WireError::FieldTooLong { .. } | WireError::MessageTooLarge { .. }) {
                self.mark_closed();
            }
            return Err(e);
        }
        Ok(())
    }

    /// Shut down the write half. The peer observes a clean close.
    pub async fn shutdown(&self) -> Result<(), WireError> {
        self.mark_closed();
        let mut writer = self.inner.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }

    fn mark_closed(&self) {
        self.inner.open.store(false, Ordering::Release);
    }
}

/// Per-connection receive loop: read, decode, dispatch, until the stream ends.
async fn receive_loop<R>(mut reader: R, conn: Connection, handler: Arc<dyn EventHandler>)
where
    R: AsyncRead + Send + Unpin,
{
    handler.on_connect(&conn).await;
    loop {
        match read_frame(&mut reader).await {
            Ok(msg) => {
                debug!(peer = %conn.peer_addr(), kind = msg.kind(), "Received message");
                handler.on_event(&conn, msg).await;
            }
            Err(e) => {
                conn.mark_closed();
                if e.is_fatal() {
                    handler.on_fatal(&conn, &e);
                } else {
                    handler.on_disconnect(&conn, &e).await;
                }
                return;
            }
        }
    }
}

/// A bound TCP listener that turns accepted streams into connections.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind the listener. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self, WireError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("Listening on {}", local_addr);
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Get the actual bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Run the accept loop in a spawned task.
    pub fn serve(self, handler: Arc<dyn EventHandler>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move { self.accept_loop(handler).await })
    }

    async fn accept_loop(self, handler: Arc<dyn EventHandler>) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Accepted connection from {}", addr);
                    if let Err(e) = Connection::from_stream(stream, Arc::clone(&handler)) {
                        debug!("Dropping connection from {}: {}", addr, e);
                    }
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::message::{DataPacket, Status, TaskInitiate};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Seen {
        Connected(SocketAddr),
        Event(SocketAddr, Message),
        Disconnected,
        Fatal(String),
    }

    /// Minimal EventHandler that records everything it observes.
    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Seen>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait]
    impl EventHandler for Recorder {
        async fn on_connect(&self, conn: &Connection) {
            let _ = self.tx.send(Seen::Connected(conn.peer_addr()));
        }

        async fn on_event(&self, conn: &Connection, msg: Message) {
            let _ = self.tx.send(Seen::Event(conn.peer_addr(), msg));
        }

        async fn on_disconnect(&self, _conn: &Connection, _reason: &WireError) {
            let _ = self.tx.send(Seen::Disconnected);
        }

        fn on_fatal(&self, _conn: &Connection, err: &WireError) {
            let _ = self.tx.send(Seen::Fatal(err.to_string()));
        }
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for handler")
            .expect("handler channel closed")
    }

    fn local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_listener_delivers_messages_in_order() {
        let (server, mut server_rx) = Recorder::new();
        let listener = Listener::bind(local()).await.unwrap();
        let addr = listener.local_addr();
        let _task = listener.serve(server);

        let (client, _client_rx) = Recorder::new();
        let conn = Connection::connect(addr, client).await.unwrap();
        assert_eq!(conn.peer_addr(), addr);

        match next(&mut server_rx).await {
            Seen::Connected(peer) => assert_eq!(peer, conn.local_addr()),
            other => panic!("Expected Connected, got {other:?}"),
        }

        for n in 1..=3 {
            conn.send(&Message::TaskInitiate(TaskInitiate { message_count: n }))
                .await
                .unwrap();
        }
        for n in 1..=3 {
            match next(&mut server_rx).await {
                Seen::Event(peer, Message::TaskInitiate(t)) => {
                    assert_eq!(peer, conn.local_addr());
                    assert_eq!(t.message_count, n);
                }
                other => panic!("Expected TaskInitiate, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_concurrent_senders_do_not_interleave() {
        let (server, mut server_rx) = Recorder::new();
        let listener = Listener::bind(local()).await.unwrap();
        let addr = listener.local_addr();
        let _task = listener.serve(server);

        let (client, _client_rx) = Recorder::new();
        let conn = Connection::connect(addr, client).await.unwrap();

        let mut senders = Vec::new();
        for src in 0..8 {
            let conn = conn.clone();
            senders.push(tokio::spawn(async move {
                for payload in 0..50 {
                    let msg = Message::DataPacket(DataPacket {
                        dest: 99,
                        src,
                        payload,
                        trace: vec![src; (payload % 5) as usize],
                    });
                    conn.send(&msg).await.unwrap();
                }
            }));
        }
        for s in senders {
            s.await.unwrap();
        }

        let mut per_src = [0i32; 8];
        let mut received = 0;
        while received < 400 {
            match next(&mut server_rx).await {
                Seen::Event(_, Message::DataPacket(p)) => {
                    // Per-sender order is preserved.
                    assert_eq!(p.payload, per_src[p.src as usize]);
                    per_src[p.src as usize] += 1;
                    received += 1;
                }
                Seen::Connected(_) => {}
                other => panic!("Unexpected {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_peer_close_ends_loop_and_fails_sends() {
        let (server, mut server_rx) = Recorder::new();
        let listener = Listener::bind(local()).await.unwrap();
        let addr = listener.local_addr();
        let _task = listener.serve(server);

        let (client, mut client_rx) = Recorder::new();
        let conn = Connection::connect(addr, client).await.unwrap();
        assert!(matches!(next(&mut server_rx).await, Seen::Connected(_)));
        assert!(matches!(next(&mut client_rx).await, Seen::Connected(_)));

        conn.shutdown().await.unwrap();
        assert!(matches!(next(&mut server_rx).await, Seen::Disconnected));
        assert!(!conn.is_open());
        assert!(matches!(
            conn.send(&Message::SetupStatus(Status::success(1, "ok"))).await,
            Err(WireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_is_fatal() {
        let (handler, mut rx) = Recorder::new();
        let (mut remote, local_end) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local_end);
        let conn = Connection::from_io(reader, writer, local(), local(), handler);

        let good = encode_frame(&Message::TaskInitiate(TaskInitiate { message_count: 1 })).unwrap();
        remote.write_all(&good).await.unwrap();
        remote.write_all(&[0, 0, 0, 1, 42]).await.unwrap();

        assert!(matches!(next(&mut rx).await, Seen::Connected(_)));
        assert!(matches!(
            next(&mut rx).await,
            Seen::Event(_, Message::TaskInitiate(_))
        ));
        match next(&mut rx).await {
            Seen::Fatal(reason) => assert!(reason.contains("42"), "got {reason}"),
            other => panic!("Expected Fatal, got {other:?}"),
        }
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_oversized_send_keeps_connection_open() {
        let (handler, _rx) = Recorder::new();
        let (_remote, local_end) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(local_end);
        let conn = Connection::from_io(reader, writer, local(), local(), handler);

        let too_long = Message::SetupStatus(Status::failure("x".repeat(300)));
        assert!(matches!(
            conn.send(&too_long).await,
            Err(WireError::FieldTooLong { .. })
        ));
        assert!(conn.is_open());
    }
}
