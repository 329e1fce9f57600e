use anyhow::Result;
use pubsub_perftest::cli::PubRate;
use pubsub_perftest::config::PacingConfig;
use pubsub_perftest::pacing::PacingMethod;
use pubsub_perftest::{run_in_process, PerftestError, TestConfig, Transport};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Shrink every handshake delay so a run takes well under a second.
fn fast(config: TestConfig) -> TestConfig {
    TestConfig {
        transport: Transport::Intra,
        print_intervals: false,
        discovery_interval: Duration::from_millis(10),
        settle_time: Duration::from_millis(10),
        ack_timeout: Duration::from_millis(10),
        final_pause: Duration::from_millis(50),
        ..config
    }
}

/// Timed runs are paced so the subscribers keep up with the publisher.
fn paced() -> PacingConfig {
    PacingConfig::Rate(PubRate {
        rate: 20_000,
        method: PacingMethod::Sleep,
    })
}

/// Every subscriber sees every sample of a reliable run, and publisher 0
/// collects pongs from the subscribers it pinged.
#[test]
fn throughput_reaches_every_subscriber() -> Result<()> {
    let config = fast(TestConfig {
        num_iter: 2_000,
        latency_count: 100,
        num_subscribers: 2,
        ..TestConfig::default()
    });

    let report = run_in_process(&config)?;

    assert_eq!(report.publishers.len(), 1);
    assert_eq!(report.subscribers.len(), 2);
    let publisher = &report.publishers[0];
    assert_eq!(publisher.samples_sent, 2_000);
    assert_eq!(publisher.pings_sent, 20);
    assert!(publisher.unfinished_subscribers.is_empty());
    assert!(!publisher.stopped_by_timer);

    for subscriber in &report.subscribers {
        assert_eq!(subscriber.packets_received(), 2_000);
        assert_eq!(subscriber.packets_lost(), 0);
        assert_eq!(subscriber.throughput.len(), 1);
        assert_eq!(subscriber.throughput[0].data_length, 100);
    }
    Ok(())
}

/// Two publishers feed one subscriber; only publisher 0 reports latency.
#[test]
fn multiple_publishers_share_subscribers() -> Result<()> {
    let config = fast(TestConfig {
        num_iter: 500,
        latency_count: 50,
        num_publishers: 2,
        ..TestConfig::default()
    });

    let report = run_in_process(&config)?;

    assert_eq!(report.publishers.len(), 2);
    let subscriber = &report.subscribers[0];
    assert_eq!(subscriber.packets_received(), 1_000);
    assert_eq!(subscriber.packets_lost(), 0);

    for publisher in &report.publishers {
        if publisher.publisher_id == 0 {
            assert_eq!(publisher.pings_sent, 10);
        } else {
            assert_eq!(publisher.pings_sent, 0);
            assert!(publisher.latency.is_empty());
        }
    }
    Ok(())
}

/// In a latency test each sample waits for its pong.
#[test]
fn latency_test_answers_every_ping() -> Result<()> {
    let config = fast(TestConfig {
        num_iter: 200,
        latency_count: 1,
        latency_test: true,
        ..TestConfig::default()
    });

    let report = run_in_process(&config)?;

    let publisher = &report.publishers[0];
    assert_eq!(publisher.pings_sent, 200);
    assert_eq!(publisher.pongs_received, 200);
    let summaries: Vec<_> = report.latency().collect();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].count, 200);
    assert!(summaries[0].min_us <= summaries[0].percentiles.p50);
    assert!(summaries[0].percentiles.p50 <= summaries[0].max_us);
    Ok(())
}

/// A timed run ends on the timer rather than the iteration count.
#[test]
fn execution_time_stops_the_run() -> Result<()> {
    let config = fast(TestConfig {
        execution_time: Some(Duration::from_millis(200)),
        pacing: paced(),
        ..TestConfig::default()
    });

    let report = run_in_process(&config)?;

    let publisher = &report.publishers[0];
    assert!(publisher.stopped_by_timer);
    assert!(publisher.samples_sent > 0);
    assert_eq!(report.subscribers[0].packets_received(), publisher.samples_sent);
    Ok(())
}

/// A scan produces one throughput summary per size, in scan order.
#[test]
fn scan_reports_each_size() -> Result<()> {
    let config = fast(TestConfig {
        data_len: 128,
        scan: Some(vec![64, 128]),
        execution_time: Some(Duration::from_millis(200)),
        pacing: paced(),
        ..TestConfig::default()
    });

    let report = run_in_process(&config)?;

    let sizes: Vec<i32> = report.throughput().map(|s| s.data_length).collect();
    assert_eq!(sizes, vec![64, 128]);
    assert!(report.throughput().all(|s| s.packets > 0 && s.lost == 0));
    assert!(report.publishers[0].unfinished_subscribers.is_empty());
    Ok(())
}

/// A publisher that fails during setup ends the whole run with its error
/// instead of leaving the subscribers waiting for it.
#[test]
fn failing_publisher_stops_the_run() {
    // One ping per sample for u64::MAX samples: the latency history cannot
    // be allocated.
    let config = fast(TestConfig {
        num_iter: u64::MAX,
        latency_count: 1,
        num_subscribers: 2,
        ..TestConfig::default()
    });

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || tx.send(run_in_process(&config)));
    let outcome = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("run did not return after the publisher failed");

    let err = outcome.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PerftestError>(),
        Some(PerftestError::LatencyHistoryAllocation { .. })
    ));
}
