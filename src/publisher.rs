//! # Publisher Orchestrator
//!
//! Drives one publisher through a test run:
//!
//! 1. create the throughput writer, the pong reader (publisher 0 only) and
//!    the announcement reader
//! 2. wait until every subscriber is discovered and has announced itself
//! 3. send the initial burst of INITIALIZE samples and let the system settle
//! 4. run the send loop: pacing, round-robin pings, scan-size transitions
//! 5. broadcast FINISHED until every subscriber acknowledged or the retry
//!    budget runs out, then print the latency summary
//!
//! The loop ends after `num_iter` samples or when the execution timer fires.
//! In scan mode the timer instead marks the end of the current size and the
//! loop runs until the size list is exhausted.

use crate::config::TestConfig;
use crate::defaults;
use crate::error::PerftestError;
use crate::listeners::{AnnouncementListener, BoundReader, LatencyListener, ReadMode};
use crate::message::{TestMessage, FINISHED_SIZE, INITIALIZE_SIZE, LENGTH_CHANGED_SIZE, NO_PING};
use crate::metrics::LatencySummary;
use crate::sync::{wall_clock_usec, Timeout};
use crate::transport::{
    flush_or_log, send_or_log, wait_for_ack_or_log, Messaging, MessagingWriter, Topic,
};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of one publisher run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PublisherReport {
    pub publisher_id: i32,
    pub samples_sent: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    /// One summary per size epoch, publisher 0 only.
    pub latency: Vec<LatencySummary>,
    /// Subscribers that never acknowledged FINISHED.
    pub unfinished_subscribers: Vec<i32>,
    pub stopped_by_timer: bool,
    /// Run-time based estimate from `--low-resolution-clock`.
    pub average_latency_estimate_us: Option<u64>,
}

/// Position of the send loop within the current batch.
#[derive(Debug, Default)]
struct PingSchedule {
    num_pings: u64,
    current_index_in_batch: u64,
    ping_index_in_batch: u64,
    sent_ping: bool,
}

pub struct Publisher {
    config: TestConfig,
    messaging: Arc<dyn Messaging>,
}

impl Publisher {
    pub fn new(config: TestConfig, messaging: Arc<dyn Messaging>) -> Self {
        Self { config, messaging }
    }

    pub fn run(&self) -> Result<PublisherReport> {
        let config = &self.config;
        let pid = config.pid;
        let printer = config.printer();
        let num_subscribers = config.num_subscribers;
        let mut pacer = config.pacing.pacer()?;

        let writer = self.messaging.create_writer(Topic::Throughput)?;

        let read_mode = |core| {
            if config.use_read_thread {
                ReadMode::Thread { core }
            } else {
                ReadMode::Callback
            }
        };

        // Only publisher 0 sends pings, so only it listens for pongs.
        let latency = if pid == 0 {
            let ping_writer = config.latency_test.then(|| Arc::clone(&writer));
            let listener = Arc::new(LatencyListener::new(
                config.latency_history_capacity(),
                ping_writer,
                printer,
                config.latency_file.clone(),
            )?);
            let reader = BoundReader::open(
                self.messaging.as_ref(),
                Topic::Latency,
                listener.clone(),
                read_mode(config.receive_affinity),
            )?;
            Some((listener, reader))
        } else {
            None
        };

        let announcements = Arc::new(AnnouncementListener::new());
        let announcement_reader = BoundReader::open(
            self.messaging.as_ref(),
            Topic::Announcement,
            announcements.clone(),
            read_mode(None),
        )?;

        info!("Waiting to discover {} subscribers...", num_subscribers);
        writer.wait_for_readers(num_subscribers)?;
        if let Some((_, reader)) = &latency {
            reader.reader().wait_for_writers(num_subscribers)?;
        }
        announcement_reader.reader().wait_for_writers(num_subscribers)?;

        info!("Waiting for subscribers announcement...");
        while announcements.len() < num_subscribers {
            if writer.is_closed() {
                return Err(PerftestError::Discovery(
                    "transport closed while waiting for subscriber announcements".to_string(),
                )
                .into());
            }
            std::thread::sleep(config.discovery_interval);
        }

        if config.show_cpu {
            if let Some((listener, _)) = &latency {
                listener.initialize_cpu();
            }
        }

        let burst = config.initial_burst_size.unwrap_or_else(|| {
            self.messaging
                .initial_burst_size()
                .max(config.instances as u64)
        });
        info!("Sending {} initialization pings...", burst);
        let mut message = TestMessage::control(pid, INITIALIZE_SIZE);
        for _ in 0..burst {
            send_or_log(writer.as_ref(), &message, true);
        }
        flush_or_log(writer.as_ref());

        info!("Sending data...");
        message.set_payload_size(TestConfig::payload_size(config.data_len));
        std::thread::sleep(config.settle_time);

        let mut report = PublisherReport {
            publisher_id: pid,
            ..PublisherReport::default()
        };

        let timer_fired = Arc::new(AtomicBool::new(false));
        let scan_sizes = config.scan.clone().unwrap_or_default();
        let is_scan = !scan_sizes.is_empty();
        let mut timer = match (config.execution_time, is_scan) {
            (Some(time), false) => Some(Timeout::start(time, Arc::clone(&timer_fired))?),
            _ => None,
        };
        // The first ping of a scan moves to the first size.
        if is_scan {
            timer_fired.store(true, Ordering::Release);
        }
        let mut scan_index = 0;

        let num_iter = if is_scan { u64::MAX } else { config.num_iter };
        let latency_count = config.latency_count;
        let mut samples_per_batch = config.samples_per_batch(config.data_len);
        let ping_timeout = config.best_effort.then_some(defaults::PING_TIMEOUT);
        let mut schedule = PingSchedule::default();

        let start = Instant::now();
        pacer.start();

        let mut loop_index: u64 = 0;
        while loop_index < num_iter {
            if writer.is_closed() {
                return Err(PerftestError::Transport(format!(
                    "transport closed after {} samples",
                    loop_index
                ))
                .into());
            }
            if !is_scan && timer_fired.load(Ordering::Acquire) {
                report.stopped_by_timer = true;
                break;
            }

            pacer.pace(loop_index);

            let mut ping_id = NO_PING;
            let ping_slot = (loop_index / samples_per_batch) % latency_count == 0
                && schedule.current_index_in_batch == schedule.ping_index_in_batch
                && !schedule.sent_ping;
            let scan_boundary = if pid == 0 {
                ping_slot
            } else {
                schedule.current_index_in_batch == 0
            };

            if is_scan && scan_boundary && timer_fired.load(Ordering::Acquire) {
                timer_fired.store(false, Ordering::Release);
                flush_or_log(writer.as_ref());
                wait_for_ack_or_log(writer.as_ref(), config.ack_timeout);

                if scan_index == scan_sizes.len() {
                    break;
                }

                message.set_control_size(LENGTH_CHANGED_SIZE);
                message.latency_ping = (schedule.num_pings % num_subscribers as u64) as i32;
                self.broadcast_until_acknowledged(writer.as_ref(), &message, &announcements);

                let data_len = scan_sizes[scan_index];
                scan_index += 1;
                info!("Switching to data length {}", data_len);
                message.set_payload_size(TestConfig::payload_size(data_len));
                samples_per_batch = config.samples_per_batch(data_len);
                schedule.current_index_in_batch = 0;
                schedule.ping_index_in_batch = 0;
                let step = config.execution_time.unwrap_or(defaults::SCAN_EXECUTION_TIME);
                timer = Some(Timeout::start(step, Arc::clone(&timer_fired))?);
            }

            if pid == 0 && ping_slot {
                // Each ping asks a different subscriber to echo.
                ping_id = (schedule.num_pings % num_subscribers as u64) as i32;
                message.set_timestamp(wall_clock_usec());
                schedule.num_pings += 1;
                schedule.ping_index_in_batch = (schedule.ping_index_in_batch + 1) % samples_per_batch;
                schedule.sent_ping = true;

                if config.writer_stats && config.print_intervals {
                    printer.pulled_samples(writer.pulled_sample_count());
                }
            }
            schedule.current_index_in_batch = (schedule.current_index_in_batch + 1) % samples_per_batch;

            message.seq_num = loop_index;
            message.latency_ping = ping_id;
            send_or_log(writer.as_ref(), &message, false);
            report.samples_sent += 1;

            if config.latency_test && schedule.sent_ping && !writer.wait_for_ping_response(ping_timeout) {
                debug!("No pong for sample {} within {:?}", loop_index, ping_timeout);
            }

            // Start of a new batch.
            if schedule.current_index_in_batch == 0 {
                schedule.sent_ping = false;
            }
            loop_index += 1;
        }
        drop(timer);

        flush_or_log(writer.as_ref());
        report.pings_sent = schedule.num_pings;

        if config.low_resolution_clock && loop_index > 0 {
            let estimate = start.elapsed().as_micros() as u64 / (2 * loop_index);
            printer.average_latency_estimate(estimate);
            report.average_latency_estimate_us = Some(estimate);
        }

        // FINISHED keeps the last sequence number for the trailing loss check.
        message.set_control_size(FINISHED_SIZE);
        let mut attempts = 0;
        while !announcements.is_empty() && attempts < config.finished_retries {
            let started = Instant::now();
            send_or_log(writer.as_ref(), &message, true);
            flush_or_log(writer.as_ref());
            wait_for_ack_or_log(writer.as_ref(), config.ack_timeout);
            pause_remaining(started, config.ack_timeout);
            attempts += 1;
        }
        report.unfinished_subscribers = announcements.subscribers();
        if !report.unfinished_subscribers.is_empty() {
            warn!(
                "Subscribers {:?} did not acknowledge the end of the test after {} attempts",
                report.unfinished_subscribers, attempts
            );
        }

        match &latency {
            Some((listener, _)) => {
                listener.print_summary(true);
                report.latency = listener.summaries();
                report.pongs_received = listener.total_pongs();
            }
            None => info!("Latency results are only shown by the publisher with id 0"),
        }

        if config.writer_stats {
            printer.pulled_samples(writer.pulled_sample_count());
        }

        if let Some((_, reader)) = latency {
            reader.finish();
        }
        announcement_reader.finish();
        drop(writer);

        if report.stopped_by_timer {
            info!("Finishing test due to timer...");
        } else {
            info!("Finishing test...");
        }
        Ok(report)
    }

    /// Send `message` to every subscriber until all of them answered on the
    /// announcement topic.
    fn broadcast_until_acknowledged(
        &self,
        writer: &dyn MessagingWriter,
        message: &TestMessage,
        announcements: &AnnouncementListener,
    ) {
        announcements.clear();
        while announcements.len() < self.config.num_subscribers {
            if writer.is_closed() {
                warn!("Transport closed before every subscriber acknowledged the size change");
                return;
            }
            let started = Instant::now();
            send_or_log(writer, message, true);
            flush_or_log(writer);
            wait_for_ack_or_log(writer, self.config.ack_timeout);
            pause_remaining(started, self.config.ack_timeout);
        }
    }
}

/// Subscribers answer from their monitor loop, so each broadcast round takes
/// at least `period`.
fn pause_remaining(started: Instant, period: Duration) {
    let elapsed = started.elapsed();
    if elapsed < period {
        std::thread::sleep(period - elapsed);
    }
}
