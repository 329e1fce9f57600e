//! # Messaging Abstraction
//!
//! The measurement protocol talks to the middleware through a narrow set of
//! traits. A backend adapter implements them once and every orchestrator and
//! listener works unchanged on top of it.
//!
//! ## Roles
//!
//! - [`Messaging`]: the per-process factory for writers and readers
//! - [`MessagingWriter`]: send, flush, discovery and ping hand-off
//! - [`MessagingReader`]: blocking pull or push delivery to a [`MessageHandler`]
//!
//! ## Adapters
//!
//! - [`intra`]: an in-process bus built on `crossbeam` channels, used when
//!   publisher and subscribers run as threads of one process
//! - [`tcp`]: peer-to-peer TCP with length-prefixed `bincode` frames
//!
//! A reader is used either through its handler (push) or through
//! [`MessagingReader::receive_message`] (pull), never both.

use crate::cli::Transport;
use crate::error::PerftestError;
use crate::message::{TestMessage, MAX_CFT_VALUE};
use crate::sync::spawn_named;
use anyhow::Result;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

pub mod intra;
pub mod tcp;

pub use intra::{IntraDomain, IntraMessaging};
pub use tcp::TcpMessaging;

/// The three logical channels of a test run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Topic {
    /// Bulk measured samples, publisher to subscribers.
    Throughput,
    /// Pongs echoed by subscribers back to the ping originator.
    Latency,
    /// Readiness and termination handshakes.
    Announcement,
}

impl Topic {
    pub fn name(self) -> &'static str {
        match self {
            Topic::Throughput => "Throughput",
            Topic::Latency => "Latency",
            Topic::Announcement => "Announcement",
        }
    }

    /// Late-joining readers receive the samples already written.
    pub fn is_transient_local(self) -> bool {
        matches!(self, Topic::Announcement)
    }

    /// Whether delivery on this topic is reliable for the given run setting.
    /// The announcement channel is always reliable.
    pub fn is_reliable(self, reliable: bool) -> bool {
        reliable || self == Topic::Announcement
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Which side of the test this process (or thread) plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Publisher { id: i32 },
    Subscriber { id: i32 },
}

/// Inclusive key range accepted by a content-filtered reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    pub start: u32,
    pub end: u32,
}

impl ContentFilter {
    /// Wildcard-key samples pass every filter.
    pub fn accepts(&self, key: u32) -> bool {
        key == MAX_CFT_VALUE || (self.start..=self.end).contains(&key)
    }
}

/// Settings shared by every writer and reader an adapter creates.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub role: Role,
    pub reliable: bool,
    /// Bytes to coalesce before delivering a batch; 0 disables batching.
    pub batch_size: usize,
    /// Number of instance keys writers rotate through.
    pub instances: u32,
    /// Filter applied to the throughput reader.
    pub content_filter: Option<ContentFilter>,
    /// Depth of each best-effort reader queue.
    pub send_queue_size: usize,
    pub discovery_interval: Duration,
    pub host: String,
    pub port: u16,
    pub buffer_size: usize,
    pub num_publishers: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            role: Role::Publisher { id: 0 },
            reliable: true,
            batch_size: 0,
            instances: 1,
            content_filter: None,
            send_queue_size: crate::defaults::SEND_QUEUE_SIZE,
            discovery_interval: crate::defaults::DISCOVERY_INTERVAL,
            host: crate::defaults::HOST.to_string(),
            port: crate::defaults::PORT,
            buffer_size: crate::defaults::BUFFER_SIZE,
            num_publishers: 1,
        }
    }
}

/// Push-mode delivery target.
pub trait MessageHandler: Send + Sync {
    fn process_message(&self, message: &TestMessage);
}

/// Writing side of a topic.
pub trait MessagingWriter: Send + Sync {
    /// Send one sample. Wildcard sends use [`MAX_CFT_VALUE`] as key so every
    /// content-filtered reader receives them.
    fn send(&self, message: &TestMessage, wildcard_key: bool) -> Result<()>;

    /// Push out any partially filled batch.
    fn flush(&self) -> Result<()>;

    /// Number of readers currently matched on this topic.
    fn matched_readers(&self) -> usize;

    fn discovery_interval(&self) -> Duration;

    /// True once the owning adapter has shut down.
    fn is_closed(&self) -> bool {
        false
    }

    /// Block until at least `count` readers are matched, polling at the
    /// discovery interval.
    fn wait_for_readers(&self, count: usize) -> Result<()> {
        while self.matched_readers() < count {
            if self.is_closed() {
                return Err(PerftestError::Discovery(format!(
                    "transport closed while waiting for {} readers",
                    count
                ))
                .into());
            }
            debug!(
                "Waiting for readers: {}/{} matched",
                self.matched_readers(),
                count
            );
            std::thread::sleep(self.discovery_interval());
        }
        Ok(())
    }

    /// Wait up to `timeout` for matched readers to acknowledge everything
    /// sent so far. Best-effort writers sleep for the timeout instead.
    fn wait_for_ack(&self, timeout: Duration) -> Result<()>;

    /// Block until the latency listener signals a pong, at most `timeout`
    /// when given. Returns false on timeout.
    fn wait_for_ping_response(&self, timeout: Option<Duration>) -> bool;

    /// Release a pending [`MessagingWriter::wait_for_ping_response`].
    fn notify_ping_response(&self);

    /// Diagnostic count of samples taken out of the writer queue by readers.
    fn pulled_sample_count(&self) -> u64 {
        0
    }
}

/// Reading side of a topic.
pub trait MessagingReader: Send + Sync {
    /// Block until a sample arrives or [`MessagingReader::unblock`] is called.
    fn receive_message(&self) -> Option<TestMessage>;

    /// Wake a blocked [`MessagingReader::receive_message`], which returns `None`.
    fn unblock(&self);

    /// Number of writers currently matched on this topic.
    fn matched_writers(&self) -> usize;

    fn discovery_interval(&self) -> Duration;

    fn is_closed(&self) -> bool {
        false
    }

    /// Block until at least `count` writers are matched, polling at the
    /// discovery interval.
    fn wait_for_writers(&self, count: usize) -> Result<()> {
        while self.matched_writers() < count {
            if self.is_closed() {
                return Err(PerftestError::Discovery(format!(
                    "transport closed while waiting for {} writers",
                    count
                ))
                .into());
            }
            debug!(
                "Waiting for writers: {}/{} matched",
                self.matched_writers(),
                count
            );
            std::thread::sleep(self.discovery_interval());
        }
        Ok(())
    }
}

/// Per-process entry point of a backend.
pub trait Messaging: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_writer(&self, topic: Topic) -> Result<Arc<dyn MessagingWriter>>;

    /// Create a reader. With a handler, samples are pushed to it from a
    /// backend thread; without one, the caller pulls with `receive_message`.
    fn create_reader(
        &self,
        topic: Topic,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Arc<dyn MessagingReader>>;

    /// Number of warm-up samples the backend wants before measuring.
    fn initial_burst_size(&self) -> u64 {
        crate::defaults::INITIAL_BURST_SIZE
    }

    /// Close every endpoint this participant created. Pending waits return
    /// and later sends fail. Idempotent.
    fn shutdown(&self) {}
}

// Send, flush and acknowledgement failures are transient: the run continues.

pub(crate) fn send_or_log(writer: &dyn MessagingWriter, message: &TestMessage, wildcard_key: bool) {
    if let Err(e) = writer.send(message, wildcard_key) {
        error!("Failed to send sample {} (size {}): {:#}", message.seq_num, message.size, e);
    }
}

pub(crate) fn flush_or_log(writer: &dyn MessagingWriter) {
    if let Err(e) = writer.flush() {
        error!("Failed to flush writer: {:#}", e);
    }
}

pub(crate) fn wait_for_ack_or_log(writer: &dyn MessagingWriter, timeout: Duration) {
    if let Err(e) = writer.wait_for_ack(timeout) {
        warn!("Acknowledgement wait failed: {:#}", e);
    }
}

/// Creates the configured backend.
pub struct TransportFactory;

impl TransportFactory {
    /// `domain` connects in-process participants; it is ignored by the TCP
    /// backend.
    pub fn create(
        transport: &Transport,
        config: TransportConfig,
        domain: &IntraDomain,
    ) -> Result<Arc<dyn Messaging>> {
        match transport {
            Transport::Intra => Ok(Arc::new(IntraMessaging::new(domain.clone(), config))),
            Transport::Tcp => Ok(Arc::new(TcpMessaging::new(config)?)),
        }
    }
}

/// Rotates the instance key across the configured number of instances.
#[derive(Debug)]
pub(crate) struct InstanceKeys {
    instances: u64,
    counter: AtomicU64,
}

impl InstanceKeys {
    pub(crate) fn new(instances: u32) -> Self {
        Self {
            instances: instances.max(1) as u64,
            counter: AtomicU64::new(0),
        }
    }

    pub(crate) fn next(&self, wildcard: bool) -> u32 {
        if wildcard {
            return MAX_CFT_VALUE;
        }
        (self.counter.fetch_add(1, Ordering::Relaxed) % self.instances) as u32
    }

    /// Copy of `message` carrying the next key.
    pub(crate) fn stamp(&self, message: &TestMessage, wildcard: bool) -> TestMessage {
        let mut stamped = message.clone();
        stamped.set_key_value(self.next(wildcard));
        stamped
    }
}

/// Delivery side of a local reader: the sending half of its queue plus the
/// filter evaluated before a sample is queued.
pub(crate) struct ReaderSlot {
    pub(crate) id: u64,
    pub(crate) filter: Option<ContentFilter>,
    reliable: bool,
    queue: Sender<TestMessage>,
}

impl ReaderSlot {
    /// Returns true if the sample was queued for this reader.
    pub(crate) fn offer(&self, message: &TestMessage) -> bool {
        if let Some(filter) = &self.filter {
            if !filter.accepts(message.key_value()) {
                return false;
            }
        }
        if self.reliable {
            return self.queue.send(message.clone()).is_ok();
        }
        match self.queue.try_send(message.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Reader {} queue full, sample dropped", self.id);
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Receiving side of a local reader.
///
/// With a handler a dispatcher thread drains the queue into it; without one
/// the owner pulls with [`ReaderInbox::receive`].
pub(crate) struct ReaderInbox {
    inbox: Receiver<TestMessage>,
    wake: Sender<()>,
    woken: Receiver<()>,
    closed: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl ReaderInbox {
    /// Create the queue pair for a reader. Reliable readers get an unbounded
    /// queue, best-effort readers drop samples beyond `depth`.
    pub(crate) fn open(
        id: u64,
        topic: Topic,
        filter: Option<ContentFilter>,
        reliable: bool,
        depth: usize,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<(ReaderSlot, ReaderInbox)> {
        let (queue, inbox) = if reliable {
            channel::unbounded()
        } else {
            channel::bounded(depth.max(1))
        };
        let (wake, woken) = channel::bounded::<()>(1);
        let closed = Arc::new(AtomicBool::new(false));
        let dispatcher = match handler {
            Some(handler) => {
                let inbox = inbox.clone();
                let woken = woken.clone();
                let closed = Arc::clone(&closed);
                Some(spawn_named(
                    &format!("{}-reader-{}", topic.name().to_lowercase(), id),
                    None,
                    move || dispatch(inbox, woken, closed, handler),
                )?)
            }
            None => None,
        };
        let slot = ReaderSlot {
            id,
            filter,
            reliable,
            queue,
        };
        let inbox = ReaderInbox {
            inbox,
            wake,
            woken,
            closed,
            dispatcher: Mutex::new(dispatcher),
        };
        Ok((slot, inbox))
    }

    pub(crate) fn receive(&self) -> Option<TestMessage> {
        if self.is_closed() {
            return None;
        }
        crossbeam::select! {
            recv(self.inbox) -> message => message.ok(),
            recv(self.woken) -> _ => None,
        }
    }

    pub(crate) fn unblock(&self) {
        let _ = self.wake.try_send(());
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop delivery and join the dispatcher thread.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.unblock();
        if let Some(handle) = self.dispatcher.lock().take() {
            if handle.join().is_err() {
                warn!("Reader dispatcher thread panicked");
            }
        }
    }
}

fn dispatch(
    inbox: Receiver<TestMessage>,
    woken: Receiver<()>,
    closed: Arc<AtomicBool>,
    handler: Arc<dyn MessageHandler>,
) {
    while !closed.load(Ordering::Acquire) {
        crossbeam::select! {
            recv(inbox) -> message => match message {
                Ok(message) => handler.process_message(&message),
                Err(_) => break,
            },
            recv(woken) -> _ => continue,
        }
    }
}

#[derive(Debug, Default)]
struct PendingBatch {
    messages: Vec<TestMessage>,
    bytes: usize,
}

/// Coalesces samples until `batch_size` bytes are pending.
#[derive(Debug)]
pub(crate) struct Batcher {
    batch_size: usize,
    pending: Mutex<PendingBatch>,
}

impl Batcher {
    pub(crate) fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            pending: Mutex::new(PendingBatch::default()),
        }
    }

    /// Queue a sample; returns the samples ready for delivery, if any.
    pub(crate) fn push(&self, message: TestMessage) -> Option<Vec<TestMessage>> {
        if self.batch_size == 0 {
            return Some(vec![message]);
        }
        let mut pending = self.pending.lock();
        pending.bytes += message.wire_size() as usize;
        pending.messages.push(message);
        if pending.bytes >= self.batch_size {
            pending.bytes = 0;
            Some(std::mem::take(&mut pending.messages))
        } else {
            None
        }
    }

    /// Take whatever is pending.
    pub(crate) fn drain(&self) -> Vec<TestMessage> {
        let mut pending = self.pending.lock();
        pending.bytes = 0;
        std::mem::take(&mut pending.messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_names_are_fixed() {
        assert_eq!(Topic::Throughput.name(), "Throughput");
        assert_eq!(Topic::Latency.name(), "Latency");
        assert_eq!(Topic::Announcement.to_string(), "Announcement");
        assert!(Topic::Announcement.is_transient_local());
        assert!(Topic::Announcement.is_reliable(false));
        assert!(!Topic::Throughput.is_reliable(false));
    }

    #[test]
    fn content_filter_passes_wildcard() {
        let filter = ContentFilter { start: 2, end: 4 };
        assert!(filter.accepts(2));
        assert!(filter.accepts(4));
        assert!(!filter.accepts(5));
        assert!(filter.accepts(MAX_CFT_VALUE));
    }

    #[test]
    fn instance_keys_rotate() {
        let keys = InstanceKeys::new(3);
        let seen: Vec<u32> = (0..5).map(|_| keys.next(false)).collect();
        assert_eq!(seen, vec![0, 1, 2, 0, 1]);
        assert_eq!(keys.next(true), MAX_CFT_VALUE);
    }

    #[test]
    fn batcher_releases_at_threshold() {
        let batcher = Batcher::new(300);
        let sample = TestMessage::with_payload(0, 72);
        assert!(batcher.push(sample.clone()).is_none());
        assert!(batcher.push(sample.clone()).is_none());
        let batch = batcher.push(sample.clone()).unwrap();
        assert_eq!(batch.len(), 3);
        assert!(batcher.push(sample).is_none());
        assert_eq!(batcher.drain().len(), 1);
        assert!(batcher.drain().is_empty());
    }

    #[test]
    fn unbatched_push_is_immediate() {
        let batcher = Batcher::new(0);
        assert_eq!(batcher.push(TestMessage::default()).unwrap().len(), 1);
    }
}
