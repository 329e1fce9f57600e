//! Subscriber-side processing of the throughput topic.
//!
//! For every sample the listener:
//!
//! 1. echoes INITIALIZE samples back on the latency topic (publisher warm-up)
//! 2. records FINISHED per publisher and ends the test once all have finished
//! 3. echoes pings addressed to this subscriber
//! 4. closes the current size interval on LENGTH_CHANGED
//! 5. counts data samples and detects sequence gaps per publisher
//!
//! Only forward gaps count as loss. A sequence number at or below the last
//! one seen is taken as a publisher restart, so duplicates and reordering
//! are invisible to the loss counter.

use crate::cpu::CpuMonitor;
use crate::message::{MessageKind, TestMessage};
use crate::metrics::{ThroughputCounters, ThroughputSummary};
use crate::printer::Printer;
use crate::transport::{MessageHandler, MessagingWriter};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

/// Counters of the current size interval.
#[derive(Debug, Clone, Copy)]
pub struct ThroughputSnapshot {
    pub counters: ThroughputCounters,
    /// When the current size interval started.
    pub interval_start: Instant,
}

struct ThroughputState {
    packets_received: u64,
    bytes_received: u64,
    missing_packets: u64,
    last_data_length: Option<i32>,
    /// Data length of the last interval summarized.
    interval_data_length: Option<i32>,
    last_seq_num: Vec<Option<u64>>,
    finished_publishers: BTreeSet<i32>,
    begin_time: Instant,
    summaries: Vec<ThroughputSummary>,
    cpu: CpuMonitor,
}

impl ThroughputState {
    fn reset_interval(&mut self, now: Instant) {
        self.packets_received = 0;
        self.bytes_received = 0;
        self.missing_packets = 0;
        self.last_seq_num.iter_mut().for_each(|seq| *seq = None);
        self.begin_time = now;
    }

    fn track_sequence(&mut self, publisher: usize, seq_num: u64) {
        let last = &mut self.last_seq_num[publisher];
        match *last {
            None => *last = Some(seq_num),
            Some(previous) => {
                let expected = previous + 1;
                if seq_num != expected && seq_num > expected {
                    self.missing_packets += seq_num - expected;
                }
                *last = Some(seq_num);
            }
        }
    }
}

/// Processes every sample on the throughput topic of one subscriber.
pub struct ThroughputListener {
    echo_writer: Arc<dyn MessagingWriter>,
    subscriber_id: i32,
    use_cft: bool,
    num_publishers: usize,
    printer: Printer,
    state: Mutex<ThroughputState>,
    end_test: AtomicBool,
    change_size: AtomicBool,
}

impl ThroughputListener {
    /// `echo_writer` is the latency-topic writer used for pongs.
    pub fn new(
        echo_writer: Arc<dyn MessagingWriter>,
        subscriber_id: i32,
        use_cft: bool,
        num_publishers: usize,
        printer: Printer,
    ) -> Self {
        let num_publishers = num_publishers.max(1);
        Self {
            echo_writer,
            subscriber_id,
            use_cft,
            num_publishers,
            printer,
            state: Mutex::new(ThroughputState {
                packets_received: 0,
                bytes_received: 0,
                missing_packets: 0,
                last_data_length: None,
                interval_data_length: None,
                last_seq_num: vec![None; num_publishers],
                finished_publishers: BTreeSet::new(),
                begin_time: Instant::now(),
                summaries: Vec::new(),
                cpu: CpuMonitor::new(),
            }),
            end_test: AtomicBool::new(false),
            change_size: AtomicBool::new(false),
        }
    }

    /// Every publisher has sent FINISHED.
    pub fn end_test(&self) -> bool {
        self.end_test.load(Ordering::Acquire)
    }

    /// A LENGTH_CHANGED was seen and not yet acknowledged.
    pub fn change_size(&self) -> bool {
        self.change_size.load(Ordering::Acquire)
    }

    pub fn acknowledge_change_size(&self) {
        self.change_size.store(false, Ordering::Release);
    }

    pub fn snapshot(&self) -> ThroughputSnapshot {
        let state = self.state.lock();
        ThroughputSnapshot {
            counters: ThroughputCounters {
                packets_received: state.packets_received,
                bytes_received: state.bytes_received,
                missing_packets: state.missing_packets,
                last_data_length: state.last_data_length,
            },
            interval_start: state.begin_time,
        }
    }

    /// Summaries printed so far, one per completed data length.
    pub fn summaries(&self) -> Vec<ThroughputSummary> {
        self.state.lock().summaries.clone()
    }

    pub fn initialize_cpu(&self) {
        self.state.lock().cpu.initialize();
    }

    /// Instantaneous CPU usage, when CPU reporting is enabled.
    pub fn cpu_instant(&self) -> Option<f64> {
        if !self.printer.show_cpu {
            return None;
        }
        Some(self.state.lock().cpu.instant())
    }

    fn echo(&self, message: &TestMessage) {
        if let Err(e) = self.echo_writer.send(message, false) {
            error!("Failed to echo sample {}: {}", message.seq_num, e);
            return;
        }
        if let Err(e) = self.echo_writer.flush() {
            error!("Failed to flush echo writer: {}", e);
        }
    }

    /// Close the current interval using `control` (FINISHED or
    /// LENGTH_CHANGED) for the trailing loss check.
    fn print_summary(&self, state: &mut ThroughputState, control: &TestMessage) {
        let now = Instant::now();
        if state.interval_data_length != state.last_data_length {
            if let Some(payload_size) = state.last_data_length {
                if !self.use_cft {
                    // Samples lost after the last one received.
                    if let Some(Some(last)) = state.last_seq_num.get(control.entity_id as usize) {
                        if control.seq_num > *last {
                            state.missing_packets += control.seq_num - *last;
                        }
                    }
                }
                let cpu = self.printer.show_cpu.then(|| state.cpu.average());
                let summary = ThroughputSummary::new(
                    payload_size,
                    state.packets_received,
                    state.bytes_received,
                    state.missing_packets,
                    now.duration_since(state.begin_time).as_micros() as u64,
                    cpu,
                );
                self.printer.throughput_summary(&summary);
                state.summaries.push(summary);
            }
            state.interval_data_length = state.last_data_length;
        }
        state.reset_interval(now);
    }
}

impl MessageHandler for ThroughputListener {
    fn process_message(&self, message: &TestMessage) {
        if message.entity_id < 0 || message.entity_id as usize >= self.num_publishers {
            warn!(
                "Throughput sample from publisher {} ignored: expected ids below {}",
                message.entity_id, self.num_publishers
            );
            return;
        }

        match message.kind() {
            MessageKind::Initialize => {
                self.echo(message);
                return;
            }
            MessageKind::Finished => {
                let mut state = self.state.lock();
                if self.end_test() || !state.finished_publishers.insert(message.entity_id) {
                    return;
                }
                debug!(
                    "Publisher {} finished ({}/{})",
                    message.entity_id,
                    state.finished_publishers.len(),
                    self.num_publishers
                );
                if state.finished_publishers.len() >= self.num_publishers {
                    if state.last_data_length.is_none() {
                        warn!(
                            "No samples have been received from any publisher, \
                             subscriber {} ends with no throughput summary",
                            self.subscriber_id
                        );
                    }
                    self.print_summary(&mut state, message);
                    self.end_test.store(true, Ordering::Release);
                }
                return;
            }
            _ => {}
        }

        if message.latency_ping == self.subscriber_id
            || (self.use_cft && message.ping_target().is_some())
        {
            self.echo(message);
        }

        let size = match message.kind() {
            MessageKind::LengthChanged => {
                let mut state = self.state.lock();
                self.print_summary(&mut state, message);
                self.change_size.store(true, Ordering::Release);
                return;
            }
            MessageKind::Data(size) => size,
            _ => return,
        };

        let mut state = self.state.lock();
        if state.last_data_length != Some(size) {
            state.reset_interval(Instant::now());
            self.printer.new_data_length(message.wire_size() as i32);
        }
        state.last_data_length = Some(size);
        state.packets_received += 1;
        state.bytes_received += message.wire_size();

        if !self.use_cft {
            state.track_sequence(message.entity_id as usize, message.seq_num);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FINISHED_SIZE, INITIALIZE_SIZE, LENGTH_CHANGED_SIZE, NO_PING};
    use anyhow::Result;
    use std::time::Duration;

    /// Writer that records what the listener echoes.
    #[derive(Default)]
    struct EchoRecorder {
        sent: Mutex<Vec<TestMessage>>,
    }

    impl MessagingWriter for EchoRecorder {
        fn send(&self, message: &TestMessage, _wildcard_key: bool) -> Result<()> {
            self.sent.lock().push(message.clone());
            Ok(())
        }
        fn flush(&self) -> Result<()> {
            Ok(())
        }
        fn matched_readers(&self) -> usize {
            1
        }
        fn discovery_interval(&self) -> Duration {
            Duration::from_millis(1)
        }
        fn wait_for_ack(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
        fn wait_for_ping_response(&self, _timeout: Option<Duration>) -> bool {
            true
        }
        fn notify_ping_response(&self) {}
    }

    fn listener(num_publishers: usize, use_cft: bool) -> (ThroughputListener, Arc<EchoRecorder>) {
        let echo = Arc::new(EchoRecorder::default());
        let listener = ThroughputListener::new(
            echo.clone(),
            0,
            use_cft,
            num_publishers,
            Printer::new(false, false),
        );
        (listener, echo)
    }

    fn data(publisher: i32, seq_num: u64, size: i32) -> TestMessage {
        let mut message = TestMessage::with_payload(publisher, size);
        message.seq_num = seq_num;
        message
    }

    /// Shared buffer that collects formatted log lines.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn finished_without_samples_warns() {
        let capture = LogCapture::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer({
                let capture = capture.clone();
                move || capture.clone()
            })
            .with_ansi(false)
            .finish();

        let (listener, _) = listener(1, false);
        tracing::subscriber::with_default(subscriber, || {
            listener.process_message(&TestMessage::control(0, FINISHED_SIZE));
        });

        assert!(listener.end_test());
        assert!(listener.summaries().is_empty());
        let logged = String::from_utf8(capture.0.lock().clone()).unwrap();
        assert!(logged.contains("WARN"));
        assert!(logged.contains("No samples have been received"));
    }

    #[test]
    fn gap_free_stream_has_no_loss() {
        let (listener, _) = listener(1, false);
        for seq in 0..500 {
            listener.process_message(&data(0, seq, 72));
        }
        let counters = listener.snapshot().counters;
        assert_eq!(counters.packets_received, 500);
        assert_eq!(counters.bytes_received, 500 * 100);
        assert_eq!(counters.missing_packets, 0);
    }

    #[test]
    fn forward_gaps_are_summed() {
        let (listener, _) = listener(1, false);
        let seqs = (0..10).chain(13..20).chain(25..30);
        for seq in seqs {
            listener.process_message(&data(0, seq, 72));
        }
        assert_eq!(listener.snapshot().counters.missing_packets, 3 + 5);
    }

    #[test]
    fn backward_sequence_is_not_loss() {
        let (listener, _) = listener(1, false);
        for seq in [10, 11, 12, 0, 1, 2] {
            listener.process_message(&data(0, seq, 72));
        }
        assert_eq!(listener.snapshot().counters.missing_packets, 0);
    }

    #[test]
    fn publishers_are_tracked_independently() {
        let (listener, _) = listener(2, false);
        for seq in 0..5 {
            listener.process_message(&data(0, seq, 72));
            listener.process_message(&data(1, seq * 2, 72));
        }
        assert_eq!(listener.snapshot().counters.missing_packets, 4);
    }

    #[test]
    fn content_filter_disables_loss_detection() {
        let (listener, _) = listener(1, true);
        for seq in [0, 5, 10] {
            listener.process_message(&data(0, seq, 72));
        }
        assert_eq!(listener.snapshot().counters.missing_packets, 0);
    }

    #[test]
    fn finished_is_idempotent() {
        let (listener, _) = listener(2, false);
        listener.process_message(&data(0, 0, 72));
        listener.process_message(&TestMessage::control(0, FINISHED_SIZE));
        listener.process_message(&TestMessage::control(0, FINISHED_SIZE));
        assert!(!listener.end_test());
        assert!(listener.summaries().is_empty());

        listener.process_message(&TestMessage::control(1, FINISHED_SIZE));
        assert!(listener.end_test());
        assert_eq!(listener.summaries().len(), 1);
        listener.process_message(&TestMessage::control(1, FINISHED_SIZE));
        assert_eq!(listener.summaries().len(), 1);
    }

    #[test]
    fn control_samples_do_not_count() {
        let (listener, echo) = listener(1, false);
        for seq in 0..3 {
            listener.process_message(&data(0, seq, 72));
        }
        let before = listener.snapshot().counters;
        listener.process_message(&TestMessage::control(0, INITIALIZE_SIZE));
        assert_eq!(listener.snapshot().counters, before);
        assert_eq!(echo.sent.lock().len(), 1);

        let mut length_changed = TestMessage::control(0, LENGTH_CHANGED_SIZE);
        length_changed.seq_num = 2;
        listener.process_message(&length_changed);
        assert!(listener.change_size());
        listener.acknowledge_change_size();
        assert!(!listener.change_size());
        let after = listener.snapshot().counters;
        assert_eq!(after.packets_received, 0);
        assert_eq!(after.last_data_length, Some(72));
        assert_eq!(listener.summaries()[0].packets, 3);
        assert_eq!(listener.summaries()[0].lost, 0);

        listener.process_message(&TestMessage::control(0, FINISHED_SIZE));
        assert_eq!(listener.snapshot().counters.packets_received, 0);
    }

    #[test]
    fn pings_for_this_subscriber_are_echoed() {
        let (listener, echo) = listener(1, false);
        let mut ping = data(0, 0, 72);
        ping.latency_ping = 0;
        listener.process_message(&ping);
        let mut other = data(0, 1, 72);
        other.latency_ping = 1;
        listener.process_message(&other);
        let mut plain = data(0, 2, 72);
        plain.latency_ping = NO_PING;
        listener.process_message(&plain);
        let sent = echo.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].seq_num, 0);
    }

    #[test]
    fn content_filtered_subscriber_echoes_every_ping() {
        let (listener, echo) = listener(1, true);
        let mut ping = data(0, 0, 72);
        ping.latency_ping = 3;
        listener.process_message(&ping);
        assert_eq!(echo.sent.lock().len(), 1);
    }

    #[test]
    fn new_length_resets_interval() {
        let (listener, _) = listener(1, false);
        for seq in [0, 1, 5] {
            listener.process_message(&data(0, seq, 72));
        }
        let first = listener.snapshot();
        assert_eq!(first.counters.missing_packets, 3);

        std::thread::sleep(Duration::from_millis(2));
        let before_b = Instant::now();
        listener.process_message(&data(0, 6, 200));
        let second = listener.snapshot();
        assert_eq!(second.counters.packets_received, 1);
        assert_eq!(second.counters.bytes_received, 228);
        assert_eq!(second.counters.missing_packets, 0);
        assert_eq!(second.counters.last_data_length, Some(200));
        assert!(second.interval_start >= before_b);
    }

    #[test]
    fn out_of_range_publisher_is_ignored() {
        let (listener, _) = listener(1, false);
        listener.process_message(&data(3, 0, 72));
        listener.process_message(&data(-1, 0, 72));
        assert_eq!(listener.snapshot().counters.packets_received, 0);
    }

    #[test]
    fn trailing_loss_counted_at_finish() {
        let (listener, _) = listener(1, false);
        for seq in 0..8 {
            listener.process_message(&data(0, seq, 72));
        }
        let mut finished = TestMessage::control(0, FINISHED_SIZE);
        finished.seq_num = 10;
        listener.process_message(&finished);
        let summary = &listener.summaries()[0];
        assert_eq!(summary.packets, 8);
        assert_eq!(summary.lost, 3);
        assert_eq!(summary.data_length, 100);
    }
}
