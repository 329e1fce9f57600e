//! # Subscriber Orchestrator
//!
//! Wires a [`ThroughputListener`] to the throughput topic, announces itself
//! to every publisher and then polls the listener once per discovery
//! interval: acknowledging size changes, printing interval records and
//! answering FINISHED once every publisher is done.

use crate::config::TestConfig;
use crate::error::PerftestError;
use crate::listeners::{BoundReader, ReadMode, ThroughputListener};
use crate::message::{TestMessage, FINISHED_SIZE, INITIALIZE_SIZE, LENGTH_CHANGED_SIZE};
use crate::metrics::{IntervalTracker, ThroughputSummary};
use crate::transport::{flush_or_log, send_or_log, Messaging, MessagingWriter, Topic};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Outcome of one subscriber run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubscriberReport {
    pub subscriber_id: i32,
    /// One summary per data length received.
    pub throughput: Vec<ThroughputSummary>,
}

impl SubscriberReport {
    pub fn packets_received(&self) -> u64 {
        self.throughput.iter().map(|summary| summary.packets).sum()
    }

    pub fn packets_lost(&self) -> u64 {
        self.throughput.iter().map(|summary| summary.lost).sum()
    }
}

pub struct Subscriber {
    config: TestConfig,
    messaging: Arc<dyn Messaging>,
}

impl Subscriber {
    pub fn new(config: TestConfig, messaging: Arc<dyn Messaging>) -> Self {
        Self { config, messaging }
    }

    pub fn run(&self) -> Result<SubscriberReport> {
        let config = &self.config;
        let sid = config.sid;
        let printer = config.printer();

        let echo_writer = self.messaging.create_writer(Topic::Latency)?;
        let listener = Arc::new(ThroughputListener::new(
            Arc::clone(&echo_writer),
            sid,
            config.cft.is_some(),
            config.num_publishers,
            printer,
        ));
        let mode = if config.use_read_thread {
            ReadMode::Thread {
                core: config.receive_affinity,
            }
        } else {
            ReadMode::Callback
        };
        let reader = BoundReader::open(
            self.messaging.as_ref(),
            Topic::Throughput,
            listener.clone(),
            mode,
        )?;
        let announcer = self.messaging.create_writer(Topic::Announcement)?;

        info!("Waiting to discover {} publishers...", config.num_publishers);
        reader.reader().wait_for_writers(config.num_publishers)?;
        announcer.wait_for_readers(config.num_publishers)?;

        // Tell the publishers this subscriber is ready.
        let mut announcement = TestMessage::control(sid, INITIALIZE_SIZE);
        send_or_log(announcer.as_ref(), &announcement, false);
        flush_or_log(announcer.as_ref());

        info!("Waiting for data...");
        if config.show_cpu {
            listener.initialize_cpu();
        }

        let mut tracker = IntervalTracker::new();
        let mut last_poll = Instant::now();
        loop {
            std::thread::sleep(config.discovery_interval);

            if announcer.is_closed() {
                reader.finish();
                return Err(PerftestError::Transport(
                    "transport closed before every publisher finished".to_string(),
                )
                .into());
            }

            if listener.change_size() {
                debug!("Acknowledging size change");
                announcement.set_control_size(LENGTH_CHANGED_SIZE);
                self.announce(announcer.as_ref(), &announcement);
                listener.acknowledge_change_size();
            }

            if listener.end_test() {
                announcement.set_control_size(FINISHED_SIZE);
                self.announce(announcer.as_ref(), &announcement);
                break;
            }

            if config.print_intervals {
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_poll).as_micros() as u64;
                last_poll = now;
                let snapshot = listener.snapshot();
                if let Some(mut interval) = tracker.observe(snapshot.counters, elapsed_us) {
                    interval.cpu_percent = listener.cpu_instant();
                    printer.throughput_interval(&interval);
                }
            }
        }

        // Let pongs and acknowledgements in flight drain before teardown.
        std::thread::sleep(config.final_pause);

        reader.finish();
        drop(announcer);
        drop(echo_writer);

        info!("Finishing test...");
        Ok(SubscriberReport {
            subscriber_id: sid,
            throughput: listener.summaries(),
        })
    }

    fn announce(&self, writer: &dyn MessagingWriter, message: &TestMessage) {
        send_or_log(writer, message, false);
        flush_or_log(writer);
    }
}
