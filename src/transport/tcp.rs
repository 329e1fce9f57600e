//! # TCP Transport
//!
//! Peer-to-peer transport for publishers and subscribers running in separate
//! processes or on separate hosts. Publisher `pid` listens on `port + pid`;
//! every subscriber connects to every publisher, retrying until the listener
//! is up.
//!
//! ## Wire Format
//!
//! Each frame is a 4-byte little-endian length followed by a `bincode`
//! encoded [`Frame`]. A frame either announces a local endpoint (so the peer
//! can count matched readers and writers and learn content filters) or
//! carries one sample.
//!
//! ## Threading
//!
//! The adapter owns a small `tokio` runtime that runs one accept or connect
//! loop plus a read task and a write task per connection. The writer and
//! reader objects handed to the harness stay synchronous: sending enqueues an
//! encoded frame on the peer's outbound channel, and received samples are
//! pushed into the same per-reader queues the in-process transport uses.

use super::{
    Batcher, ContentFilter, InstanceKeys, MessageHandler, Messaging, MessagingReader,
    MessagingWriter, ReaderInbox, ReaderSlot, Role, Topic, TransportConfig,
};
use crate::error::PerftestError;
use crate::message::TestMessage;
use crate::sync::BinarySemaphore;
use anyhow::{anyhow, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use socket2::SockRef;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Room left in a frame for the topic, body tag and message header.
const FRAME_OVERHEAD: usize = 1024;

/// Largest sample, in wire bytes, that fits in one frame.
pub const MAX_SAMPLE_SIZE: u64 = (MAX_FRAME_LEN - FRAME_OVERHEAD) as u64;

/// Poll step used while waiting for outbound queues to drain.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One unit on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub topic: Topic,
    pub body: FrameBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FrameBody {
    WriterCreated { id: u64 },
    WriterDeleted { id: u64 },
    ReaderCreated { id: u64, filter: Option<ContentFilter> },
    ReaderDeleted { id: u64 },
    Sample(TestMessage),
}

impl Frame {
    /// Encode the frame, refusing anything a peer would reject as too large.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bytes = bincode::serialize(self).map_err(PerftestError::Codec)?;
        if bytes.len() > MAX_FRAME_LEN {
            return Err(PerftestError::Transport(format!(
                "frame of {} bytes on {} exceeds the {} byte limit",
                bytes.len(),
                self.topic,
                MAX_FRAME_LEN
            ))
            .into());
        }
        Ok(bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| PerftestError::Codec(e).into())
    }
}

#[derive(Debug, Clone, Copy)]
struct RemoteReader {
    topic: Topic,
    id: u64,
    filter: Option<ContentFilter>,
}

impl RemoteReader {
    fn wants(&self, topic: Topic, key: u32) -> bool {
        self.topic == topic && self.filter.map_or(true, |filter| filter.accepts(key))
    }
}

/// A connected remote participant.
struct Peer {
    id: u64,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames queued but not yet flushed to the socket.
    pending: AtomicUsize,
    readers: Mutex<Vec<RemoteReader>>,
    writers: Mutex<Vec<(Topic, u64)>>,
}

impl Peer {
    fn enqueue(&self, frame: Vec<u8>) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        if self.outbound.send(frame).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn enqueue_frame(&self, frame: &Frame) {
        match frame.to_bytes() {
            Ok(bytes) => self.enqueue(bytes),
            Err(e) => error!("Failed to encode frame for peer {}: {}", self.id, e),
        }
    }

    fn wants(&self, topic: Topic, key: u32) -> bool {
        self.readers.lock().iter().any(|reader| reader.wants(topic, key))
    }
}

struct LocalReader {
    topic: Topic,
    slot: ReaderSlot,
}

/// State shared between the synchronous endpoints and the runtime tasks.
struct TcpShared {
    config: TransportConfig,
    peers: RwLock<HashMap<u64, Arc<Peer>>>,
    local_writers: RwLock<Vec<(Topic, u64)>>,
    local_readers: RwLock<Vec<LocalReader>>,
    /// Samples written on transient-local topics, replayed to new readers.
    history: Mutex<HashMap<Topic, Vec<TestMessage>>>,
    next_endpoint_id: AtomicU64,
    next_peer_id: AtomicU64,
    closed: AtomicBool,
}

impl TcpShared {
    fn broadcast(&self, frame: &Frame) {
        for peer in self.peers.read().values() {
            peer.enqueue_frame(frame);
        }
    }

    /// Send samples to every peer with a reader that accepts them; returns
    /// the number of frames queued.
    fn publish(&self, topic: Topic, messages: Vec<TestMessage>) -> Result<u64> {
        let mut history = topic
            .is_transient_local()
            .then(|| self.history.lock());
        let peers = self.peers.read();
        let mut queued = 0;
        for message in messages {
            let key = message.key_value();
            let targets: Vec<&Arc<Peer>> =
                peers.values().filter(|peer| peer.wants(topic, key)).collect();
            if !targets.is_empty() {
                let frame = Frame {
                    topic,
                    body: FrameBody::Sample(message),
                };
                let bytes = frame.to_bytes()?;
                for peer in &targets {
                    peer.enqueue(bytes.clone());
                }
                queued += targets.len() as u64;
                if let FrameBody::Sample(message) = frame.body {
                    if let Some(history) = history.as_mut() {
                        history.entry(topic).or_default().push(message);
                    }
                }
            } else if let Some(history) = history.as_mut() {
                history.entry(topic).or_default().push(message);
            }
        }
        Ok(queued)
    }

    fn outbound_drained(&self) -> bool {
        self.peers
            .read()
            .values()
            .all(|peer| peer.pending.load(Ordering::Acquire) == 0)
    }

    fn matched_readers(&self, topic: Topic) -> usize {
        self.peers
            .read()
            .values()
            .map(|peer| peer.readers.lock().iter().filter(|r| r.topic == topic).count())
            .sum()
    }

    fn matched_writers(&self, topic: Topic) -> usize {
        self.peers
            .read()
            .values()
            .map(|peer| peer.writers.lock().iter().filter(|(t, _)| *t == topic).count())
            .sum()
    }

    /// Make a new connection visible and tell the peer about every local
    /// endpoint.
    fn register_peer(&self, peer: Arc<Peer>) {
        let writers = self.local_writers.read();
        let readers = self.local_readers.read();
        let mut peers = self.peers.write();
        for (topic, id) in writers.iter() {
            peer.enqueue_frame(&Frame {
                topic: *topic,
                body: FrameBody::WriterCreated { id: *id },
            });
        }
        for reader in readers.iter() {
            peer.enqueue_frame(&Frame {
                topic: reader.topic,
                body: FrameBody::ReaderCreated {
                    id: reader.slot.id,
                    filter: reader.slot.filter,
                },
            });
        }
        peers.insert(peer.id, peer);
    }

    fn remove_peer(&self, id: u64) {
        if self.peers.write().remove(&id).is_some() {
            info!("Peer {} disconnected", id);
        }
    }

    fn handle_frame(&self, peer: &Arc<Peer>, frame: Frame) {
        let topic = frame.topic;
        match frame.body {
            FrameBody::WriterCreated { id } => {
                debug!("Peer {} created writer {} on {}", peer.id, id, topic);
                peer.writers.lock().push((topic, id));
            }
            FrameBody::WriterDeleted { id } => {
                peer.writers.lock().retain(|w| *w != (topic, id));
            }
            FrameBody::ReaderCreated { id, filter } => {
                debug!("Peer {} created reader {} on {}", peer.id, id, topic);
                let reader = RemoteReader { topic, id, filter };
                if topic.is_transient_local() {
                    let history = self.history.lock();
                    peer.readers.lock().push(reader);
                    for message in history.get(&topic).into_iter().flatten() {
                        if reader.wants(topic, message.key_value()) {
                            peer.enqueue_frame(&Frame {
                                topic,
                                body: FrameBody::Sample(message.clone()),
                            });
                        }
                    }
                } else {
                    peer.readers.lock().push(reader);
                }
            }
            FrameBody::ReaderDeleted { id } => {
                peer.readers
                    .lock()
                    .retain(|r| !(r.topic == topic && r.id == id));
            }
            FrameBody::Sample(message) => {
                for reader in self.local_readers.read().iter() {
                    if reader.topic == topic {
                        reader.slot.offer(&message);
                    }
                }
            }
        }
    }
}

/// Configure a freshly connected socket.
fn configure_socket(stream: &TcpStream, buffer_size: usize) {
    let socket = SockRef::from(stream);
    if let Err(e) = socket.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    if buffer_size > 0 {
        if let Err(e) = socket.set_send_buffer_size(buffer_size) {
            warn!("Failed to set send buffer size to {}: {}", buffer_size, e);
        }
        if let Err(e) = socket.set_recv_buffer_size(buffer_size) {
            warn!("Failed to set receive buffer size to {}: {}", buffer_size, e);
        }
    }
}

fn attach_stream(shared: &Arc<TcpShared>, stream: TcpStream) {
    configure_socket(&stream, shared.config.buffer_size);
    let (read_half, write_half) = stream.into_split();
    let (outbound, queue) = mpsc::unbounded_channel();
    let peer = Arc::new(Peer {
        id: shared.next_peer_id.fetch_add(1, Ordering::Relaxed),
        outbound,
        pending: AtomicUsize::new(0),
        readers: Mutex::new(Vec::new()),
        writers: Mutex::new(Vec::new()),
    });
    info!("Peer {} connected", peer.id);
    tokio::spawn(write_frames(write_half, queue, Arc::clone(&peer)));
    tokio::spawn(read_frames(read_half, Arc::clone(&peer), Arc::clone(shared)));
    shared.register_peer(peer);
}

async fn read_frame(stream: &mut OwnedReadHalf) -> Result<Frame> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_LEN {
        error!(
            "Dropping peer: frame of {} bytes exceeds the {} byte limit",
            frame_len, MAX_FRAME_LEN
        );
        return Err(anyhow!("Frame too large: {} bytes", frame_len));
    }

    let mut frame_data = vec![0u8; frame_len];
    stream.read_exact(&mut frame_data).await?;
    Frame::from_bytes(&frame_data)
}

async fn read_frames(mut stream: OwnedReadHalf, peer: Arc<Peer>, shared: Arc<TcpShared>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(frame) => shared.handle_frame(&peer, frame),
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    debug!("Peer {} read loop ended: {}", peer.id, e);
                }
                break;
            }
        }
    }
    shared.remove_peer(peer.id);
}

async fn write_frames(
    stream: OwnedWriteHalf,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
    peer: Arc<Peer>,
) {
    let mut stream = BufWriter::new(stream);
    while let Some(frame) = queue.recv().await {
        let mut written = 1;
        let mut result = write_frame(&mut stream, &frame).await;
        // Coalesce whatever else is already queued into one flush.
        while result.is_ok() {
            match queue.try_recv() {
                Ok(frame) => {
                    written += 1;
                    result = write_frame(&mut stream, &frame).await;
                }
                Err(_) => break,
            }
        }
        if result.is_ok() {
            result = stream.flush().await;
        }
        peer.pending.fetch_sub(written, Ordering::AcqRel);
        if let Err(e) = result {
            warn!("Failed to write to peer {}: {}", peer.id, e);
            break;
        }
    }
}

async fn write_frame(
    stream: &mut BufWriter<OwnedWriteHalf>,
    frame: &[u8],
) -> std::io::Result<()> {
    stream.write_all(&(frame.len() as u32).to_le_bytes()).await?;
    stream.write_all(frame).await
}

async fn accept_loop(listener: TcpListener, shared: Arc<TcpShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("Accepted connection from {}", addr);
                attach_stream(&shared, stream);
            }
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                tokio::time::sleep(shared.config.discovery_interval).await;
            }
        }
    }
}

async fn connect_loop(address: String, shared: Arc<TcpShared>) {
    let mut attempts = 0u64;
    while !shared.closed.load(Ordering::Acquire) {
        match TcpStream::connect(&address).await {
            Ok(stream) => {
                debug!("Connected to publisher at {}", address);
                attach_stream(&shared, stream);
                return;
            }
            Err(e) => {
                attempts += 1;
                if attempts % 10 == 1 {
                    debug!("Publisher at {} not reachable yet: {}", address, e);
                }
                tokio::time::sleep(shared.config.discovery_interval).await;
            }
        }
    }
}

/// TCP implementation of [`Messaging`].
pub struct TcpMessaging {
    shared: Arc<TcpShared>,
    runtime: Mutex<Option<Runtime>>,
}

impl TcpMessaging {
    /// Start the runtime and either listen (publisher) or begin connecting
    /// to every publisher (subscriber).
    pub fn new(config: TransportConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("perftest-tcp")
            .enable_all()
            .build()
            .context("Failed to build TCP transport runtime")?;

        let shared = Arc::new(TcpShared {
            config: config.clone(),
            peers: RwLock::new(HashMap::new()),
            local_writers: RwLock::new(Vec::new()),
            local_readers: RwLock::new(Vec::new()),
            history: Mutex::new(HashMap::new()),
            next_endpoint_id: AtomicU64::new(1),
            next_peer_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        });

        match config.role {
            Role::Publisher { id } => {
                let port = publisher_port(config.port, id)?;
                let address = format!("{}:{}", config.host, port);
                let listener = runtime
                    .block_on(TcpListener::bind(&address))
                    .map_err(|e| {
                        PerftestError::Transport(format!("Failed to bind {}: {}", address, e))
                    })?;
                info!("Publisher {} listening on {}", id, address);
                runtime.spawn(accept_loop(listener, Arc::clone(&shared)));
            }
            Role::Subscriber { id } => {
                for pid in 0..config.num_publishers {
                    let port = publisher_port(config.port, pid as i32)?;
                    let address = format!("{}:{}", config.host, port);
                    debug!("Subscriber {} connecting to {}", id, address);
                    runtime.spawn(connect_loop(address, Arc::clone(&shared)));
                }
            }
        }

        Ok(Self {
            shared,
            runtime: Mutex::new(Some(runtime)),
        })
    }
}

fn publisher_port(base: u16, pid: i32) -> Result<u16> {
    u16::try_from(base as i64 + pid as i64).map_err(|_| {
        PerftestError::Config(format!("port {} + publisher id {} is out of range", base, pid))
            .into()
    })
}

impl Messaging for TcpMessaging {
    fn name(&self) -> &'static str {
        "tcp"
    }

    fn create_writer(&self, topic: Topic) -> Result<Arc<dyn MessagingWriter>> {
        let id = self.shared.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut writers = self.shared.local_writers.write();
            writers.push((topic, id));
            self.shared.broadcast(&Frame {
                topic,
                body: FrameBody::WriterCreated { id },
            });
        }
        debug!("Created tcp writer {} on topic {}", id, topic);
        Ok(Arc::new(TcpWriter {
            shared: Arc::clone(&self.shared),
            topic,
            id,
            reliable: topic.is_reliable(self.shared.config.reliable),
            keys: InstanceKeys::new(self.shared.config.instances),
            batcher: Batcher::new(self.shared.config.batch_size),
            ping: BinarySemaphore::new(),
            pulled: AtomicU64::new(0),
        }))
    }

    fn create_reader(
        &self,
        topic: Topic,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Arc<dyn MessagingReader>> {
        let config = &self.shared.config;
        let id = self.shared.next_endpoint_id.fetch_add(1, Ordering::Relaxed);
        let filter = match topic {
            Topic::Throughput => config.content_filter,
            _ => None,
        };
        let (slot, inbox) = ReaderInbox::open(
            id,
            topic,
            filter,
            topic.is_reliable(config.reliable),
            config.send_queue_size,
            handler,
        )?;
        {
            let mut readers = self.shared.local_readers.write();
            readers.push(LocalReader { topic, slot });
            self.shared.broadcast(&Frame {
                topic,
                body: FrameBody::ReaderCreated { id, filter },
            });
        }
        debug!("Created tcp reader {} on topic {}", id, topic);
        Ok(Arc::new(TcpReader {
            shared: Arc::clone(&self.shared),
            topic,
            id,
            inbox,
        }))
    }

    fn shutdown(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.peers.write().clear();
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
            debug!("TCP transport runtime stopped");
        }
    }
}

impl Drop for TcpMessaging {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct TcpWriter {
    shared: Arc<TcpShared>,
    topic: Topic,
    id: u64,
    reliable: bool,
    keys: InstanceKeys,
    batcher: Batcher,
    ping: BinarySemaphore,
    pulled: AtomicU64,
}

impl MessagingWriter for TcpWriter {
    fn send(&self, message: &TestMessage, wildcard_key: bool) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(PerftestError::Transport("transport is shut down".to_string()).into());
        }
        if let Some(batch) = self.batcher.push(self.keys.stamp(message, wildcard_key)) {
            let queued = self.shared.publish(self.topic, batch)?;
            self.pulled.fetch_add(queued, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let pending = self.batcher.drain();
        if !pending.is_empty() {
            let queued = self.shared.publish(self.topic, pending)?;
            self.pulled.fetch_add(queued, Ordering::Relaxed);
        }
        Ok(())
    }

    fn matched_readers(&self) -> usize {
        self.shared.matched_readers(self.topic)
    }

    fn discovery_interval(&self) -> Duration {
        self.shared.config.discovery_interval
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn wait_for_ack(&self, timeout: Duration) -> Result<()> {
        if !self.reliable {
            std::thread::sleep(timeout);
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        while !self.shared.outbound_drained() {
            if Instant::now() >= deadline {
                debug!("wait_for_ack on {} timed out after {:?}", self.topic, timeout);
                break;
            }
            std::thread::sleep(ACK_POLL_INTERVAL);
        }
        Ok(())
    }

    fn wait_for_ping_response(&self, timeout: Option<Duration>) -> bool {
        self.ping.take_unless(timeout, self.shared.config.discovery_interval, || {
            self.is_closed()
        })
    }

    fn notify_ping_response(&self) {
        self.ping.give();
    }

    fn pulled_sample_count(&self) -> u64 {
        self.pulled.load(Ordering::Relaxed)
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        let mut writers = self.shared.local_writers.write();
        writers.retain(|w| *w != (self.topic, self.id));
        self.shared.broadcast(&Frame {
            topic: self.topic,
            body: FrameBody::WriterDeleted { id: self.id },
        });
    }
}

struct TcpReader {
    shared: Arc<TcpShared>,
    topic: Topic,
    id: u64,
    inbox: ReaderInbox,
}

impl MessagingReader for TcpReader {
    fn receive_message(&self) -> Option<TestMessage> {
        self.inbox.receive()
    }

    fn unblock(&self) {
        self.inbox.unblock();
    }

    fn matched_writers(&self) -> usize {
        self.shared.matched_writers(self.topic)
    }

    fn discovery_interval(&self) -> Duration {
        self.shared.config.discovery_interval
    }

    fn is_closed(&self) -> bool {
        self.inbox.is_closed() || self.shared.closed.load(Ordering::Acquire)
    }
}

impl Drop for TcpReader {
    fn drop(&mut self) {
        {
            let mut readers = self.shared.local_readers.write();
            readers.retain(|r| !(r.topic == self.topic && r.slot.id == self.id));
            self.shared.broadcast(&Frame {
                topic: self.topic,
                body: FrameBody::ReaderDeleted { id: self.id },
            });
        }
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{INITIALIZE_SIZE, OVERHEAD_BYTES};

    #[test]
    fn frame_encoding_is_lossless() {
        let mut message = TestMessage::with_payload(2, 32);
        message.seq_num = 9;
        let frame = Frame {
            topic: Topic::Throughput,
            body: FrameBody::Sample(message.clone()),
        };
        let decoded = Frame::from_bytes(&frame.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded.topic, Topic::Throughput);
        match decoded.body {
            FrameBody::Sample(decoded) => assert_eq!(decoded, message),
            other => panic!("unexpected frame body {:?}", other),
        }
    }

    #[test]
    fn frames_above_the_limit_are_refused() {
        let largest = TestMessage::with_payload(0, (MAX_SAMPLE_SIZE as i32) - OVERHEAD_BYTES);
        let frame = Frame {
            topic: Topic::Throughput,
            body: FrameBody::Sample(largest),
        };
        assert!(frame.to_bytes().unwrap().len() <= MAX_FRAME_LEN);

        let oversized = TestMessage::with_payload(0, MAX_FRAME_LEN as i32);
        let frame = Frame {
            topic: Topic::Throughput,
            body: FrameBody::Sample(oversized),
        };
        let err = frame.to_bytes().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::Transport(_))
        ));
    }

    #[test]
    fn publisher_port_is_offset_by_id() {
        assert_eq!(publisher_port(7899, 2).unwrap(), 7901);
        assert!(publisher_port(65535, 1).is_err());
    }

    #[test]
    fn remote_reader_filter() {
        let reader = RemoteReader {
            topic: Topic::Throughput,
            id: 1,
            filter: Some(ContentFilter { start: 0, end: 0 }),
        };
        assert!(reader.wants(Topic::Throughput, 0));
        assert!(!reader.wants(Topic::Throughput, 1));
        assert!(!reader.wants(Topic::Latency, 0));
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn loopback_pub_sub_exchange() {
        let port = 23_000 + (std::process::id() % 2_000) as u16;
        let publisher = TcpMessaging::new(TransportConfig {
            role: Role::Publisher { id: 0 },
            port,
            discovery_interval: Duration::from_millis(20),
            ..TransportConfig::default()
        })
        .unwrap();
        let subscriber = TcpMessaging::new(TransportConfig {
            role: Role::Subscriber { id: 0 },
            port,
            discovery_interval: Duration::from_millis(20),
            ..TransportConfig::default()
        })
        .unwrap();

        let writer = publisher.create_writer(Topic::Throughput).unwrap();
        let reader = subscriber.create_reader(Topic::Throughput, None).unwrap();
        assert!(wait_until(|| writer.matched_readers() == 1));
        assert!(wait_until(|| reader.matched_writers() == 1));

        let announcer = subscriber.create_writer(Topic::Announcement).unwrap();
        announcer
            .send(&TestMessage::control(0, INITIALIZE_SIZE), false)
            .unwrap();
        let announcements = publisher.create_reader(Topic::Announcement, None).unwrap();
        let replayed = announcements.receive_message().unwrap();
        assert_eq!(replayed.size, INITIALIZE_SIZE);

        for seq in 0..10 {
            let mut message = TestMessage::with_payload(0, 64);
            message.seq_num = seq;
            writer.send(&message, false).unwrap();
        }
        writer.wait_for_ack(Duration::from_secs(1)).unwrap();
        let seqs: Vec<u64> = (0..10)
            .map(|_| reader.receive_message().unwrap().seq_num)
            .collect();
        assert_eq!(seqs, (0..10).collect::<Vec<_>>());

        drop(reader);
        drop(announcer);
        drop(announcements);
        drop(writer);
        subscriber.shutdown();
        publisher.shutdown();
    }
}
