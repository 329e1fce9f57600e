//! # In-Process Transport
//!
//! A pub/sub bus for participants that live in the same process. Every
//! [`IntraMessaging`] attached to the same [`IntraDomain`] sees the writers
//! and readers of the others, which lets a publisher and its subscribers run
//! as threads of one test binary.
//!
//! ## Delivery
//!
//! Each reader owns a `crossbeam` channel. Reliable readers get an unbounded
//! channel; best-effort readers get a bounded one and samples that do not
//! fit are dropped. Content filters are evaluated per reader at delivery.
//! The announcement topic keeps a history that is replayed to readers
//! created after the samples were written.
//!
//! ## Shutdown
//!
//! [`Messaging::shutdown`] closes only the endpoints of that participant.
//! Its waits return and its sends fail; the other participants on the same
//! domain are untouched.

use super::{
    Batcher, InstanceKeys, MessageHandler, Messaging, MessagingReader, MessagingWriter,
    ReaderInbox, ReaderSlot, Topic, TransportConfig,
};
use crate::error::PerftestError;
use crate::message::TestMessage;
use crate::sync::BinarySemaphore;
use anyhow::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Poll step used while waiting for reader queues to drain.
const ACK_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Shared state connecting in-process participants.
#[derive(Clone, Default)]
pub struct IntraDomain {
    topics: Arc<Mutex<HashMap<Topic, Arc<TopicBus>>>>,
}

impl IntraDomain {
    pub fn new() -> Self {
        Self::default()
    }

    fn bus(&self, topic: Topic) -> Arc<TopicBus> {
        Arc::clone(
            self.topics
                .lock()
                .entry(topic)
                .or_insert_with(|| Arc::new(TopicBus::new(topic))),
        )
    }
}

struct TopicBus {
    topic: Topic,
    readers: RwLock<Vec<ReaderSlot>>,
    writers: AtomicUsize,
    history: Mutex<Vec<TestMessage>>,
    next_reader_id: AtomicU64,
}

impl TopicBus {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            readers: RwLock::new(Vec::new()),
            writers: AtomicUsize::new(0),
            history: Mutex::new(Vec::new()),
            next_reader_id: AtomicU64::new(1),
        }
    }

    /// Deliver samples to every reader; returns how many copies were queued.
    fn deliver(&self, messages: Vec<TestMessage>) -> u64 {
        // Transient-local delivery holds the history lock so a reader being
        // attached concurrently sees each sample exactly once.
        let mut history = self
            .topic
            .is_transient_local()
            .then(|| self.history.lock());
        let readers = self.readers.read();
        let mut queued = 0;
        for message in messages {
            queued += readers.iter().filter(|slot| slot.offer(&message)).count() as u64;
            if let Some(history) = history.as_mut() {
                history.push(message);
            }
        }
        queued
    }

    fn attach(&self, slot: ReaderSlot) {
        let history = self.history.lock();
        for message in history.iter() {
            slot.offer(message);
        }
        self.readers.write().push(slot);
    }

    fn detach(&self, id: u64) {
        self.readers.write().retain(|slot| slot.id != id);
    }

    fn queues_drained(&self) -> bool {
        self.readers.read().iter().all(ReaderSlot::is_drained)
    }
}

/// In-process implementation of [`Messaging`].
pub struct IntraMessaging {
    domain: IntraDomain,
    config: TransportConfig,
    /// Shared with every endpoint this participant created.
    closed: Arc<AtomicBool>,
}

impl IntraMessaging {
    pub fn new(domain: IntraDomain, config: TransportConfig) -> Self {
        Self {
            domain,
            config,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Messaging for IntraMessaging {
    fn name(&self) -> &'static str {
        "intra"
    }

    fn create_writer(&self, topic: Topic) -> Result<Arc<dyn MessagingWriter>> {
        let bus = self.domain.bus(topic);
        bus.writers.fetch_add(1, Ordering::SeqCst);
        debug!("Created intra writer on topic {}", topic);
        Ok(Arc::new(IntraWriter {
            bus,
            reliable: topic.is_reliable(self.config.reliable),
            keys: InstanceKeys::new(self.config.instances),
            batcher: Batcher::new(self.config.batch_size),
            ping: BinarySemaphore::new(),
            pulled: AtomicU64::new(0),
            discovery_interval: self.config.discovery_interval,
            closed: Arc::clone(&self.closed),
        }))
    }

    fn create_reader(
        &self,
        topic: Topic,
        handler: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Arc<dyn MessagingReader>> {
        let bus = self.domain.bus(topic);
        let id = bus.next_reader_id.fetch_add(1, Ordering::Relaxed);
        let filter = match topic {
            Topic::Throughput => self.config.content_filter,
            _ => None,
        };
        let (slot, inbox) = ReaderInbox::open(
            id,
            topic,
            filter,
            topic.is_reliable(self.config.reliable),
            self.config.send_queue_size,
            handler,
        )?;
        bus.attach(slot);
        debug!("Created intra reader {} on topic {}", id, topic);

        Ok(Arc::new(IntraReader {
            bus,
            id,
            inbox,
            discovery_interval: self.config.discovery_interval,
            closed: Arc::clone(&self.closed),
        }))
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Intra participant {:?} shut down", self.config.role);
        }
    }
}

struct IntraWriter {
    bus: Arc<TopicBus>,
    reliable: bool,
    keys: InstanceKeys,
    batcher: Batcher,
    ping: BinarySemaphore,
    pulled: AtomicU64,
    discovery_interval: Duration,
    closed: Arc<AtomicBool>,
}

impl MessagingWriter for IntraWriter {
    fn send(&self, message: &TestMessage, wildcard_key: bool) -> Result<()> {
        if self.is_closed() {
            return Err(PerftestError::Transport("participant is shut down".to_string()).into());
        }
        if let Some(batch) = self.batcher.push(self.keys.stamp(message, wildcard_key)) {
            let queued = self.bus.deliver(batch);
            self.pulled.fetch_add(queued, Ordering::Relaxed);
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let pending = self.batcher.drain();
        if !pending.is_empty() {
            let queued = self.bus.deliver(pending);
            self.pulled.fetch_add(queued, Ordering::Relaxed);
        }
        Ok(())
    }

    fn matched_readers(&self) -> usize {
        self.bus.readers.read().len()
    }

    fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn wait_for_ack(&self, timeout: Duration) -> Result<()> {
        if !self.reliable {
            std::thread::sleep(timeout);
            return Ok(());
        }
        let deadline = Instant::now() + timeout;
        while !self.bus.queues_drained() {
            if Instant::now() >= deadline {
                debug!("wait_for_ack on {} timed out after {:?}", self.bus.topic, timeout);
                break;
            }
            std::thread::sleep(ACK_POLL_INTERVAL);
        }
        Ok(())
    }

    fn wait_for_ping_response(&self, timeout: Option<Duration>) -> bool {
        self.ping
            .take_unless(timeout, self.discovery_interval, || self.is_closed())
    }

    fn notify_ping_response(&self) {
        self.ping.give();
    }

    fn pulled_sample_count(&self) -> u64 {
        self.pulled.load(Ordering::Relaxed)
    }
}

impl Drop for IntraWriter {
    fn drop(&mut self) {
        if !self.batcher.drain().is_empty() {
            warn!("Intra writer on {} dropped with unflushed samples", self.bus.topic);
        }
        self.bus.writers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct IntraReader {
    bus: Arc<TopicBus>,
    id: u64,
    inbox: ReaderInbox,
    discovery_interval: Duration,
    closed: Arc<AtomicBool>,
}

impl MessagingReader for IntraReader {
    fn receive_message(&self) -> Option<TestMessage> {
        self.inbox.receive()
    }

    fn unblock(&self) {
        self.inbox.unblock();
    }

    fn matched_writers(&self) -> usize {
        self.bus.writers.load(Ordering::SeqCst)
    }

    fn discovery_interval(&self) -> Duration {
        self.discovery_interval
    }

    fn is_closed(&self) -> bool {
        self.inbox.is_closed() || self.closed.load(Ordering::Acquire)
    }
}

impl Drop for IntraReader {
    fn drop(&mut self) {
        self.bus.detach(self.id);
        self.inbox.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{INITIALIZE_SIZE, MAX_CFT_VALUE};
    use crate::transport::{ContentFilter, Role};

    struct Collect(Mutex<Vec<TestMessage>>);

    impl MessageHandler for Collect {
        fn process_message(&self, message: &TestMessage) {
            self.0.lock().push(message.clone());
        }
    }

    fn messaging(domain: &IntraDomain, config: TransportConfig) -> IntraMessaging {
        IntraMessaging::new(domain.clone(), config)
    }

    #[test]
    fn pull_reader_receives_in_order() {
        let domain = IntraDomain::new();
        let bus = messaging(&domain, TransportConfig::default());
        let reader = bus.create_reader(Topic::Throughput, None).unwrap();
        let writer = bus.create_writer(Topic::Throughput).unwrap();
        assert_eq!(writer.matched_readers(), 1);
        assert_eq!(reader.matched_writers(), 1);
        for seq in 0..5 {
            let mut message = TestMessage::with_payload(0, 8);
            message.seq_num = seq;
            writer.send(&message, false).unwrap();
        }
        let seqs: Vec<u64> = (0..5)
            .map(|_| reader.receive_message().unwrap().seq_num)
            .collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn push_reader_dispatches_to_handler() {
        let domain = IntraDomain::new();
        let bus = messaging(&domain, TransportConfig::default());
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        let _reader = bus
            .create_reader(Topic::Latency, Some(collect.clone() as Arc<dyn MessageHandler>))
            .unwrap();
        let writer = bus.create_writer(Topic::Latency).unwrap();
        writer.send(&TestMessage::with_payload(0, 8), false).unwrap();
        writer.wait_for_ack(Duration::from_secs(1)).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while collect.0.lock().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(collect.0.lock().len(), 1);
    }

    #[test]
    fn announcements_replay_to_late_readers() {
        let domain = IntraDomain::new();
        let bus = messaging(&domain, TransportConfig::default());
        let writer = bus.create_writer(Topic::Announcement).unwrap();
        writer
            .send(&TestMessage::control(4, INITIALIZE_SIZE), false)
            .unwrap();
        let reader = bus.create_reader(Topic::Announcement, None).unwrap();
        let replayed = reader.receive_message().unwrap();
        assert_eq!(replayed.entity_id, 4);
        assert_eq!(replayed.size, INITIALIZE_SIZE);
    }

    #[test]
    fn content_filter_applies_to_throughput_only() {
        let domain = IntraDomain::new();
        let publisher = messaging(
            &domain,
            TransportConfig {
                instances: 4,
                ..TransportConfig::default()
            },
        );
        let subscriber = messaging(
            &domain,
            TransportConfig {
                role: Role::Subscriber { id: 0 },
                content_filter: Some(ContentFilter { start: 1, end: 1 }),
                ..TransportConfig::default()
            },
        );
        let reader = subscriber.create_reader(Topic::Throughput, None).unwrap();
        let writer = publisher.create_writer(Topic::Throughput).unwrap();
        for _ in 0..4 {
            writer.send(&TestMessage::with_payload(0, 8), false).unwrap();
        }
        writer.send(&TestMessage::with_payload(0, 8), true).unwrap();
        assert_eq!(reader.receive_message().unwrap().key_value(), 1);
        assert_eq!(reader.receive_message().unwrap().key_value(), MAX_CFT_VALUE);
    }

    #[test]
    fn best_effort_drops_when_queue_full() {
        let domain = IntraDomain::new();
        let bus = messaging(
            &domain,
            TransportConfig {
                reliable: false,
                send_queue_size: 2,
                ..TransportConfig::default()
            },
        );
        let reader = bus.create_reader(Topic::Throughput, None).unwrap();
        let writer = bus.create_writer(Topic::Throughput).unwrap();
        for seq in 0..5 {
            let mut message = TestMessage::with_payload(0, 8);
            message.seq_num = seq;
            writer.send(&message, false).unwrap();
        }
        assert_eq!(writer.pulled_sample_count(), 2);
        assert_eq!(reader.receive_message().unwrap().seq_num, 0);
        assert_eq!(reader.receive_message().unwrap().seq_num, 1);
    }

    #[test]
    fn unblock_wakes_pull_reader() {
        let domain = IntraDomain::new();
        let bus = messaging(&domain, TransportConfig::default());
        let reader = bus.create_reader(Topic::Throughput, None).unwrap();
        let waker = Arc::clone(&reader);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            waker.unblock();
        });
        assert!(reader.receive_message().is_none());
        handle.join().unwrap();
    }

    #[test]
    fn shutdown_releases_waits_of_that_participant_only() {
        let domain = IntraDomain::new();
        let publisher = messaging(&domain, TransportConfig::default());
        let subscriber = Arc::new(messaging(
            &domain,
            TransportConfig {
                role: Role::Subscriber { id: 0 },
                discovery_interval: Duration::from_millis(5),
                ..TransportConfig::default()
            },
        ));
        let reader = subscriber.create_reader(Topic::Throughput, None).unwrap();
        let announcer = subscriber.create_writer(Topic::Announcement).unwrap();
        let writer = publisher.create_writer(Topic::Latency).unwrap();

        let closer = {
            let subscriber = Arc::clone(&subscriber);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                subscriber.shutdown();
            })
        };
        // No publisher ever writes throughput, so only shutdown ends the wait.
        let err = reader.wait_for_writers(1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::Discovery(_))
        ));
        closer.join().unwrap();

        assert!(announcer.is_closed());
        assert!(!announcer.wait_for_ping_response(None));
        assert!(announcer.send(&TestMessage::with_payload(0, 8), false).is_err());
        assert!(!writer.is_closed());
        assert!(writer.send(&TestMessage::with_payload(0, 8), false).is_ok());
    }

    #[test]
    fn dropping_reader_unmatches() {
        let domain = IntraDomain::new();
        let bus = messaging(&domain, TransportConfig::default());
        let writer = bus.create_writer(Topic::Throughput).unwrap();
        let reader = bus.create_reader(Topic::Throughput, None).unwrap();
        assert_eq!(writer.matched_readers(), 1);
        drop(reader);
        assert_eq!(writer.matched_readers(), 0);
    }

    #[test]
    fn batching_holds_until_flush() {
        let domain = IntraDomain::new();
        let bus = messaging(
            &domain,
            TransportConfig {
                batch_size: 1000,
                ..TransportConfig::default()
            },
        );
        let reader = bus.create_reader(Topic::Throughput, None).unwrap();
        let writer = bus.create_writer(Topic::Throughput).unwrap();
        writer.send(&TestMessage::with_payload(0, 8), false).unwrap();
        assert_eq!(writer.pulled_sample_count(), 0);
        writer.flush().unwrap();
        assert!(reader.receive_message().is_some());
    }
}
