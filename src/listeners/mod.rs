//! # Protocol Listeners
//!
//! The three message processors of the measurement protocol:
//!
//! - [`ThroughputListener`] (subscriber): counts samples and loss, echoes pings
//! - [`LatencyListener`] (publisher 0): turns pongs into one-way latency
//! - [`AnnouncementListener`] (publisher): tracks which subscribers are ready
//!
//! Each implements [`MessageHandler`] so it can be registered on a reader for
//! push delivery. In read-thread mode a [`ReceiveThread`] pulls from the
//! reader and feeds the same handler instead.

use crate::sync::spawn_named;
use crate::transport::{MessageHandler, Messaging, MessagingReader, Topic};
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, warn};

pub mod announcement;
pub mod latency;
pub mod throughput;

pub use announcement::AnnouncementListener;
pub use latency::LatencyListener;
pub use throughput::ThroughputListener;

/// How a reader hands samples to its listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// The backend invokes the listener for every sample.
    Callback,
    /// A [`ReceiveThread`] pulls and invokes the listener, optionally pinned.
    Thread { core: Option<usize> },
}

/// A reader wired to its listener.
pub struct BoundReader {
    // Declared first so the thread stops before the reader is released.
    thread: Option<ReceiveThread>,
    reader: Arc<dyn MessagingReader>,
}

impl BoundReader {
    pub fn open(
        messaging: &dyn Messaging,
        topic: Topic,
        handler: Arc<dyn MessageHandler>,
        mode: ReadMode,
    ) -> Result<Self> {
        match mode {
            ReadMode::Callback => Ok(Self {
                thread: None,
                reader: messaging.create_reader(topic, Some(handler))?,
            }),
            ReadMode::Thread { core } => {
                let reader = messaging.create_reader(topic, None)?;
                let name = format!("{}-receive", topic.name().to_lowercase());
                let thread = ReceiveThread::start(&name, Arc::clone(&reader), handler, core)?;
                Ok(Self {
                    thread: Some(thread),
                    reader,
                })
            }
        }
    }

    pub fn reader(&self) -> &dyn MessagingReader {
        self.reader.as_ref()
    }

    /// Stop the receive thread, if any.
    pub fn finish(mut self) {
        if let Some(thread) = self.thread.take() {
            thread.finish();
        }
    }
}

/// A thread that pulls from a reader and hands every sample to a handler.
pub struct ReceiveThread {
    reader: Arc<dyn MessagingReader>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceiveThread {
    pub fn start(
        name: &str,
        reader: Arc<dyn MessagingReader>,
        handler: Arc<dyn MessageHandler>,
        core: Option<usize>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let reader = Arc::clone(&reader);
            let stop = Arc::clone(&stop);
            spawn_named(name, core, move || {
                while !stop.load(Ordering::Acquire) {
                    match reader.receive_message() {
                        Some(message) => handler.process_message(&message),
                        None if reader.is_closed() => break,
                        None => {}
                    }
                }
                debug!("Receive thread exiting");
            })?
        };
        Ok(Self {
            reader,
            stop,
            handle: Some(handle),
        })
    }

    /// Stop pulling and join the thread.
    pub fn finish(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.reader.unblock();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Receive thread panicked");
            }
        }
    }
}

impl Drop for ReceiveThread {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}
