//! Unix socket client multiplexer
//!
//! One listener, many clients, no tasks. Each tick the owner calls [`SocketMultiplexer::poll`]
//! to wait for activity, then [`accept_pending`](SocketMultiplexer::accept_pending),
//! [`receive`](SocketMultiplexer::receive) and [`flush`](SocketMultiplexer::flush)
//! for every client. Reads and writes never block: they use `try_read`/`try_write`
//! against the readiness observed during the last poll.
//!
//! Clients are identified by a [`ClientId`] that is never reused during the lifetime
//! of the multiplexer, so a stale id can never address a newer connection.

use crate::error::{Result, TransportError};
use crate::framing::InputBuffer;
use crate::{DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_MAX_CLIENTS, DEFAULT_SOCKET_PATH};
use busgate_codec::{CodecError, Packet, PACKET_SIZE};
use futures::FutureExt;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::Interest;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// A decoded frame, or the reason its bytes were not a valid packet
pub type Received = std::result::Result<Packet, CodecError>;

/// Opaque identity of a connected client
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientId(u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// Multiplexer configuration
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// Socket path
    pub path: PathBuf,
    /// Connections beyond this count are accepted and immediately dropped
    pub max_clients: usize,
    /// Per-client reassembly buffer size
    pub input_buffer_size: usize,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_SOCKET_PATH),
            max_clients: DEFAULT_MAX_CLIENTS,
            input_buffer_size: DEFAULT_INPUT_BUFFER_SIZE,
        }
    }
}

struct ClientConnection {
    stream: UnixStream,
    input: InputBuffer,
    output: VecDeque<[u8; PACKET_SIZE]>,
    /// Bytes of the head of `output` already written
    written: usize,
    readable: bool,
    writable: bool,
}

impl ClientConnection {
    fn new(stream: UnixStream, input_buffer_size: usize) -> Self {
        Self {
            stream,
            input: InputBuffer::new(input_buffer_size),
            output: VecDeque::new(),
            written: 0,
            readable: false,
            writable: false,
        }
    }
}

/// Non-blocking server side of the local packet socket
pub struct SocketMultiplexer {
    config: MultiplexerConfig,
    listener: UnixListener,
    clients: BTreeMap<ClientId, ClientConnection>,
    pending_accept: Option<UnixStream>,
    next_id: u64,
}

impl SocketMultiplexer {
    /// Bind the listening socket.
    ///
    /// A leftover socket file from a dead process is removed first. If another
    /// process still answers on the path, binding fails with
    /// [`TransportError::AddressInUse`] and the file is left alone.
    pub fn bind(config: MultiplexerConfig) -> Result<Self> {
        prepare_socket_path(&config.path)?;

        let listener = UnixListener::bind(&config.path)
            .map_err(|e| TransportError::network_with_source("Failed to bind Unix socket", e))?;

        info!(path = ?config.path, max_clients = config.max_clients, "Unix socket listening");

        Ok(Self {
            config,
            listener,
            clients: BTreeMap::new(),
            pending_accept: None,
            next_id: 1,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Wait until a connection arrives, a client becomes readable, or `timeout`
    /// elapses, then record which clients can be read from and written to.
    ///
    /// A failed accept is returned only once `timeout` has elapsed and client
    /// readiness has been refreshed.
    pub async fn poll(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut settled = Ok(());
        if self.pending_accept.is_none() {
            let accepted = {
                let listener = &self.listener;
                let clients = &self.clients;
                tokio::select! {
                    result = listener.accept() => Some(result.map(|(stream, _)| stream)),
                    _ = any_readable(clients) => None,
                    _ = tokio::time::sleep_until(deadline) => None,
                }
            };
            settled = self.settle_accept(accepted, deadline).await;
        }

        for client in self.clients.values_mut() {
            let readiness = client
                .stream
                .ready(Interest::READABLE | Interest::WRITABLE)
                .now_or_never();
            match readiness {
                Some(Ok(ready)) => {
                    client.readable = ready.is_readable();
                    client.writable = ready.is_writable();
                }
                // Let the next read surface the error and close the client.
                Some(Err(_)) => {
                    client.readable = true;
                    client.writable = false;
                }
                None => {
                    client.readable = false;
                    client.writable = false;
                }
            }
        }
        settled
    }

    async fn settle_accept(
        &mut self,
        accepted: Option<io::Result<UnixStream>>,
        deadline: Instant,
    ) -> Result<()> {
        match accepted {
            Some(Ok(stream)) => {
                self.pending_accept = Some(stream);
                Ok(())
            }
            Some(Err(e)) => {
                tokio::time::sleep_until(deadline).await;
                Err(TransportError::network_with_source("Failed to accept connection", e))
            }
            None => Ok(()),
        }
    }

    /// Register the connection found by the last poll, if any.
    ///
    /// The new client's queue starts with a Version packet. Returns `None` when
    /// nothing was pending or the client limit is reached.
    pub fn accept_pending(&mut self) -> Option<ClientId> {
        let stream = self.pending_accept.take()?;
        if self.clients.len() >= self.config.max_clients {
            warn!(
                max_clients = self.config.max_clients,
                "Client limit reached, dropping new connection"
            );
            return None;
        }

        let id = ClientId(self.next_id);
        self.next_id += 1;
        let mut client = ClientConnection::new(stream, self.config.input_buffer_size);
        if let Ok(frame) = Packet::version().encode() {
            client.output.push_back(frame);
        }
        self.clients.insert(id, client);
        info!(client = %id, clients = self.clients.len(), "New client");
        Some(id)
    }

    /// Read once from a client and return every complete frame in arrival order.
    ///
    /// End of stream or a read error closes the client. Frames whose head is not a
    /// known packet type come back as errors so the caller can reject them.
    pub fn receive(&mut self, id: ClientId) -> Vec<Received> {
        let Some(client) = self.clients.get_mut(&id) else {
            return Vec::new();
        };
        if !client.readable {
            return Vec::new();
        }
        client.readable = false;

        let stream = &client.stream;
        match client.input.fill_with(|buf| stream.try_read(buf)) {
            Ok(0) => {
                debug!(client = %id, "Client closed connection");
                self.close(id);
                Vec::new()
            }
            Ok(n) => {
                trace!(client = %id, bytes = n, "Read from client");
                let mut frames = Vec::new();
                while let Some(frame) = client.input.next_frame() {
                    frames.push(Packet::decode(&frame));
                }
                frames
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Vec::new(),
            Err(e) => {
                debug!(client = %id, error = %e, "Read failed");
                self.close(id);
                Vec::new()
            }
        }
    }

    /// Append a packet to one client's output queue.
    ///
    /// Returns false when the client is unknown or the packet cannot be encoded.
    pub fn enqueue(&mut self, id: ClientId, packet: &Packet) -> bool {
        let Some(client) = self.clients.get_mut(&id) else {
            trace!(client = %id, "Dropping packet for unknown client");
            return false;
        };
        match packet.encode() {
            Ok(frame) => {
                client.output.push_back(frame);
                true
            }
            Err(e) => {
                warn!(client = %id, packet = %packet, error = %e, "Refusing to queue packet");
                false
            }
        }
    }

    /// Append a packet to every client's output queue and return how many received it.
    pub fn broadcast(&mut self, packet: &Packet) -> usize {
        let frame = match packet.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(packet = %packet, error = %e, "Refusing to broadcast packet");
                return 0;
            }
        };
        for client in self.clients.values_mut() {
            client.output.push_back(frame);
        }
        self.clients.len()
    }

    /// Write as much of a client's queue as the socket takes without blocking.
    ///
    /// A frame leaves the queue only once all of its bytes are written. Returns
    /// the number of whole frames sent.
    pub fn flush(&mut self, id: ClientId) -> usize {
        let Some(client) = self.clients.get_mut(&id) else {
            return 0;
        };
        if !client.writable {
            return 0;
        }

        let mut sent = 0;
        let mut failed = false;
        while let Some(frame) = client.output.front() {
            match client.stream.try_write(&frame[client.written..]) {
                Ok(0) => break,
                Ok(n) => {
                    client.written += n;
                    if client.written == PACKET_SIZE {
                        client.output.pop_front();
                        client.written = 0;
                        sent += 1;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    client.writable = false;
                    break;
                }
                Err(e) => {
                    debug!(client = %id, error = %e, "Write failed");
                    failed = true;
                    break;
                }
            }
        }

        if failed {
            self.close(id);
        }
        sent
    }

    /// Drop a client and everything queued for it.
    pub fn close(&mut self, id: ClientId) {
        if self.clients.remove(&id).is_some() {
            info!(client = %id, clients = self.clients.len(), "Remove client");
        }
    }

    /// Ids of all connected clients in connection order
    pub fn client_ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Connection capacity
    pub fn max_clients(&self) -> usize {
        self.config.max_clients
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients.contains_key(&id)
    }

    /// Frames waiting in a client's output queue
    pub fn queued(&self, id: ClientId) -> usize {
        self.clients.get(&id).map_or(0, |c| c.output.len())
    }
}

impl Drop for SocketMultiplexer {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.config.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(path = ?self.config.path, error = %e, "Failed to remove socket file");
            }
        }
    }
}

async fn any_readable(clients: &BTreeMap<ClientId, ClientConnection>) {
    if clients.is_empty() {
        return futures::future::pending().await;
    }
    let waits: Vec<_> = clients
        .values()
        .map(|client| Box::pin(client.stream.readable()))
        .collect();
    let _ = futures::future::select_all(waits).await;
}

fn prepare_socket_path(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(meta) => {
            if !meta.file_type().is_socket() {
                return Err(TransportError::configuration(
                    format!("{} exists and is not a socket", path.display()),
                    Some("socket.path"),
                ));
            }
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(TransportError::address_in_use(path));
            }
            debug!(path = ?path, "Removing stale socket file");
            std::fs::remove_file(path).map_err(|e| {
                TransportError::network_with_source("Failed to remove existing socket", e)
            })?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(TransportError::network_with_source(
                "Failed to inspect socket path",
                e,
            ))
        }
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TransportError::network_with_source("Failed to create socket directory", e)
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use busgate_codec::{ErrorCode, Head};
    use tempfile::tempdir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const TICK: Duration = Duration::from_millis(5);

    fn config(dir: &Path, max_clients: usize) -> MultiplexerConfig {
        MultiplexerConfig {
            path: dir.join("gateway.sock"),
            max_clients,
            input_buffer_size: 2048,
        }
    }

    async fn accept_one(mux: &mut SocketMultiplexer) -> ClientId {
        for _ in 0..200 {
            mux.poll(TICK).await.unwrap();
            if let Some(id) = mux.accept_pending() {
                return id;
            }
        }
        panic!("no connection accepted");
    }

    async fn flush_all(mux: &mut SocketMultiplexer) {
        for _ in 0..200 {
            mux.poll(TICK).await.unwrap();
            for id in mux.client_ids() {
                mux.flush(id);
            }
            if mux.client_ids().iter().all(|id| mux.queued(*id) == 0) {
                return;
            }
        }
        panic!("queues never drained");
    }

    async fn receive_until(mux: &mut SocketMultiplexer, id: ClientId, count: usize) -> Vec<Received> {
        let mut received = Vec::new();
        for _ in 0..200 {
            mux.poll(TICK).await.unwrap();
            received.extend(mux.receive(id));
            if received.len() >= count {
                return received;
            }
        }
        panic!("received {} of {} frames", received.len(), count);
    }

    async fn read_packet(stream: &mut UnixStream) -> Packet {
        let mut frame = [0u8; PACKET_SIZE];
        stream.read_exact(&mut frame).await.unwrap();
        Packet::decode(&frame).unwrap()
    }

    #[tokio::test]
    async fn test_new_client_gets_version_first() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();
        let mut client = UnixStream::connect(mux.path()).await.unwrap();

        let id = accept_one(&mut mux).await;
        assert_eq!(mux.queued(id), 1);
        flush_all(&mut mux).await;

        assert_eq!(read_packet(&mut client).await, Packet::version());
    }

    #[tokio::test]
    async fn test_split_writes_reassemble() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();
        let mut client = UnixStream::connect(mux.path()).await.unwrap();
        let id = accept_one(&mut mux).await;

        let first = Packet::outgoing_message(0x22, b"hi").unwrap();
        let second = Packet::outgoing_message(0x23, b"there").unwrap();
        let mut bytes = first.encode().unwrap().to_vec();
        bytes.extend_from_slice(&second.encode().unwrap());

        client.write_all(&bytes[..30]).await.unwrap();
        client.flush().await.unwrap();
        let nothing = receive_until(&mut mux, id, 0).await;
        assert!(nothing.is_empty());

        client.write_all(&bytes[30..]).await.unwrap();
        let received = receive_until(&mut mux, id, 2).await;
        assert_eq!(received, vec![Ok(first), Ok(second)]);
    }

    #[tokio::test]
    async fn test_unknown_head_surfaces_as_error() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();
        let mut client = UnixStream::connect(mux.path()).await.unwrap();
        let id = accept_one(&mut mux).await;

        client.write_all(&[0xEE; PACKET_SIZE]).await.unwrap();
        let received = receive_until(&mut mux, id, 1).await;
        assert_eq!(received, vec![Err(CodecError::InvalidHead { head: 0xEE })]);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_client() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();
        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(UnixStream::connect(mux.path()).await.unwrap());
            accept_one(&mut mux).await;
        }

        let packet = Packet::error(ErrorCode::FailedOpenSerial);
        assert_eq!(mux.broadcast(&packet), 3);
        flush_all(&mut mux).await;

        for client in &mut clients {
            assert_eq!(read_packet(client).await.head(), Head::Version);
            assert_eq!(read_packet(client).await, packet);
        }
    }

    #[tokio::test]
    async fn test_disconnect_removes_client_and_ids_are_not_reused() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();

        let client = UnixStream::connect(mux.path()).await.unwrap();
        let first = accept_one(&mut mux).await;
        drop(client);

        for _ in 0..200 {
            mux.poll(TICK).await.unwrap();
            mux.receive(first);
            if !mux.contains(first) {
                break;
            }
        }
        assert_eq!(mux.client_count(), 0);
        assert!(!mux.enqueue(first, &Packet::version()));

        let _client = UnixStream::connect(mux.path()).await.unwrap();
        let second = accept_one(&mut mux).await;
        assert_ne!(first, second);
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_connections_over_limit_are_dropped() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 1)).unwrap();

        assert_eq!(mux.max_clients(), 1);
        let _kept = UnixStream::connect(mux.path()).await.unwrap();
        accept_one(&mut mux).await;

        let mut refused = UnixStream::connect(mux.path()).await.unwrap();
        for _ in 0..200 {
            mux.poll(TICK).await.unwrap();
            assert!(mux.accept_pending().is_none());
            if mux.pending_accept.is_none() && mux.client_count() == 1 {
                let mut buf = [0u8; 1];
                let read = tokio::time::timeout(Duration::from_millis(20), refused.read(&mut buf)).await;
                if let Ok(Ok(0)) = read {
                    return;
                }
            }
        }
        panic!("over-limit connection was never closed");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_accept_still_waits_out_the_tick() {
        let dir = tempdir().unwrap();
        let mut mux = SocketMultiplexer::bind(config(dir.path(), 8)).unwrap();
        let deadline = Instant::now() + Duration::from_millis(50);

        // EMFILE: the listener stays readable while every accept fails.
        let err = mux
            .settle_accept(Some(Err(io::Error::from_raw_os_error(24))), deadline)
            .await
            .unwrap_err();

        assert_eq!(err.category(), "network");
        assert!(Instant::now() >= deadline);
        assert!(mux.accept_pending().is_none());
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket_and_refuses_live_one() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.sock");

        // A socket file nobody listens on any more.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let mux = SocketMultiplexer::bind(config(dir.path(), 4)).unwrap();
        let err = SocketMultiplexer::bind(config(dir.path(), 4)).err().unwrap();
        assert!(matches!(err, TransportError::AddressInUse { .. }));

        drop(mux);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_bind_refuses_regular_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.sock");
        std::fs::write(&path, b"not a socket").unwrap();

        let err = SocketMultiplexer::bind(config(dir.path(), 4)).err().unwrap();
        assert_eq!(err.category(), "configuration");
        assert!(path.exists());
    }
}
