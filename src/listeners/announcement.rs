use crate::message::{MessageKind, TestMessage};
use crate::transport::MessageHandler;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tracing::{debug, trace};

/// Set of subscriber ids that announced readiness (INITIALIZE) or
/// acknowledged a size change (LENGTH_CHANGED). FINISHED removes the id.
///
/// The publisher polls the set size to gate discovery, scan transitions and
/// teardown.
#[derive(Debug, Default)]
pub struct AnnouncementListener {
    subscribers: Mutex<BTreeSet<i32>>,
}

impl AnnouncementListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    pub fn contains(&self, subscriber_id: i32) -> bool {
        self.subscribers.lock().contains(&subscriber_id)
    }

    /// Forget every subscriber, before collecting a fresh round of
    /// acknowledgements.
    pub fn clear(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscribers(&self) -> Vec<i32> {
        self.subscribers.lock().iter().copied().collect()
    }
}

impl MessageHandler for AnnouncementListener {
    fn process_message(&self, message: &TestMessage) {
        let mut subscribers = self.subscribers.lock();
        match message.kind() {
            MessageKind::Initialize | MessageKind::LengthChanged => {
                if subscribers.insert(message.entity_id) {
                    debug!("Subscriber {} announced", message.entity_id);
                }
            }
            MessageKind::Finished => {
                if subscribers.remove(&message.entity_id) {
                    debug!("Subscriber {} finished", message.entity_id);
                }
            }
            MessageKind::Data(size) => {
                trace!("Ignoring announcement with size {}", size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FINISHED_SIZE, INITIALIZE_SIZE, LENGTH_CHANGED_SIZE};

    #[test]
    fn duplicate_announcements_count_once() {
        let listener = AnnouncementListener::new();
        listener.process_message(&TestMessage::control(1, INITIALIZE_SIZE));
        listener.process_message(&TestMessage::control(1, INITIALIZE_SIZE));
        listener.process_message(&TestMessage::control(1, LENGTH_CHANGED_SIZE));
        listener.process_message(&TestMessage::control(2, LENGTH_CHANGED_SIZE));
        assert_eq!(listener.len(), 2);
        assert_eq!(listener.subscribers(), vec![1, 2]);
    }

    #[test]
    fn finished_removes_known_subscriber() {
        let listener = AnnouncementListener::new();
        listener.process_message(&TestMessage::control(1, INITIALIZE_SIZE));
        listener.process_message(&TestMessage::control(3, FINISHED_SIZE));
        assert!(listener.contains(1));
        listener.process_message(&TestMessage::control(1, FINISHED_SIZE));
        assert!(listener.is_empty());
    }

    #[test]
    fn data_samples_are_ignored() {
        let listener = AnnouncementListener::new();
        listener.process_message(&TestMessage::with_payload(1, 64));
        assert!(listener.is_empty());
        listener.process_message(&TestMessage::control(1, INITIALIZE_SIZE));
        listener.clear();
        assert_eq!(listener.len(), 0);
    }
}
