//! # Run Entry Points
//!
//! [`run`] executes the role this process was configured for. With the
//! in-process transport every participant lives in this process, so it
//! delegates to [`run_in_process`], which starts one thread per publisher
//! and subscriber on a shared [`IntraDomain`] and merges their reports.
//!
//! Participants report back over a channel as they finish. The first
//! failure shuts every participant's transport down, which releases peers
//! blocked in discovery or in the monitor loop, and becomes the run's error.

use crate::cli::Transport;
use crate::config::TestConfig;
use crate::error::PerftestError;
use crate::publisher::Publisher;
use crate::results::RunReport;
use crate::subscriber::Subscriber;
use crate::sync::spawn_named;
use crate::transport::{IntraDomain, Messaging, Role, TransportFactory};
use anyhow::Result;
use crossbeam::channel::{self, Sender};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info};

/// Run this process's participant(s) to completion.
pub fn run(config: &TestConfig) -> Result<RunReport> {
    config.validate()?;
    if config.transport == Transport::Intra {
        return run_in_process(config);
    }

    let role = role_of(config);
    let messaging = TransportFactory::create(
        &config.transport,
        config.transport_config(role),
        &IntraDomain::new(),
    )?;
    let result = run_role(config.clone(), role, Arc::clone(&messaging));
    messaging.shutdown();
    result
}

/// A participant thread and the transport it runs on.
struct Participant {
    name: String,
    messaging: Arc<dyn Messaging>,
    handle: JoinHandle<()>,
}

type Outcome = (String, Result<RunReport>);

/// Run every publisher and subscriber of `config` as threads of this
/// process.
///
/// `pid`/`sid` of `config` are ignored; each thread gets its own id. Returns
/// the first participant error once every thread has been joined.
pub fn run_in_process(config: &TestConfig) -> Result<RunReport> {
    config.validate()?;
    let domain = IntraDomain::new();
    info!(
        "Starting {} subscriber(s) and {} publisher(s) in-process over {}",
        config.num_subscribers, config.num_publishers, config.transport
    );

    // Subscribers first, so publishers find them on their first discovery poll.
    let mut roles: Vec<(TestConfig, Role)> = (0..config.num_subscribers as i32)
        .map(|sid| {
            let participant = TestConfig {
                publisher: false,
                sid,
                ..config.clone()
            };
            (participant, Role::Subscriber { id: sid })
        })
        .collect();
    roles.extend((0..config.num_publishers as i32).map(|pid| {
        let participant = TestConfig {
            publisher: true,
            pid,
            latency_test: config.latency_test && pid == 0,
            ..config.clone()
        };
        (participant, Role::Publisher { id: pid })
    }));

    let (done, outcomes) = channel::unbounded::<Outcome>();
    let mut participants = Vec::with_capacity(roles.len());
    for (participant, role) in roles {
        match start_participant(&participant, role, &domain, done.clone()) {
            Ok(started) => participants.push(started),
            Err(e) => {
                shutdown_all(&participants);
                join_all(participants);
                return Err(e);
            }
        }
    }
    drop(done);

    let mut report = RunReport::default();
    let mut first_error = None;
    // Ends once every participant thread has dropped its sender.
    for (name, outcome) in outcomes.iter() {
        match outcome {
            Ok(partial) => {
                debug!("{} finished", name);
                report.merge(partial);
            }
            Err(e) => {
                if first_error.is_none() {
                    error!("{} failed, stopping the other participants: {:#}", name, e);
                    shutdown_all(&participants);
                    first_error = Some(e);
                } else {
                    debug!("{} stopped: {:#}", name, e);
                }
            }
        }
    }
    join_all(participants);

    match first_error {
        Some(e) => Err(e),
        None => Ok(report),
    }
}

fn shutdown_all(participants: &[Participant]) {
    for participant in participants {
        participant.messaging.shutdown();
    }
}

fn join_all(participants: Vec<Participant>) {
    for participant in participants {
        if participant.handle.join().is_err() {
            error!("{} thread did not exit cleanly", participant.name);
        }
    }
}

fn role_of(config: &TestConfig) -> Role {
    if config.publisher {
        Role::Publisher { id: config.pid }
    } else {
        Role::Subscriber { id: config.sid }
    }
}

fn start_participant(
    config: &TestConfig,
    role: Role,
    domain: &IntraDomain,
    done: Sender<Outcome>,
) -> Result<Participant> {
    let name = match role {
        Role::Publisher { id } => format!("publisher-{}", id),
        Role::Subscriber { id } => format!("subscriber-{}", id),
    };
    let messaging =
        TransportFactory::create(&config.transport, config.transport_config(role), domain)?;
    let handle = {
        let config = config.clone();
        let messaging = Arc::clone(&messaging);
        let reported = name.clone();
        spawn_named(&name, None, move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                run_role(config, role, Arc::clone(&messaging))
            }))
            .unwrap_or_else(|_| {
                Err(PerftestError::Thread(format!("{} panicked", reported)).into())
            });
            messaging.shutdown();
            if done.send((reported, outcome)).is_err() {
                debug!("Run already collected its results");
            }
        })?
    };
    Ok(Participant {
        name,
        messaging,
        handle,
    })
}

fn run_role(config: TestConfig, role: Role, messaging: Arc<dyn Messaging>) -> Result<RunReport> {
    let mut report = RunReport::default();
    match role {
        Role::Publisher { .. } => {
            report
                .publishers
                .push(Publisher::new(config, messaging).run()?);
        }
        Role::Subscriber { .. } => {
            report
                .subscribers
                .push(Subscriber::new(config, messaging).run()?);
        }
    }
    Ok(report)
}
