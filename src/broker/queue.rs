use crate::message::DeliveryMode;
use crate::transport::DeliveryTag;
use bytes::Bytes;
use std::collections::{BTreeMap, VecDeque};

/// A message held by the in-memory broker
#[derive(Debug, Clone)]
pub(crate) struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub content_type: String,
    pub delivery_mode: DeliveryMode,
    pub message_id: Option<String>,
    pub delivery_count: u32,
}

/// Owner connection and message for a delivery awaiting ack
#[derive(Debug)]
struct Unacked {
    owner: u64,
    message: StoredMessage,
}

/// FIFO queue with a side table of delivered-but-unacknowledged messages
#[derive(Debug)]
pub(crate) struct Queue {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    unacked: BTreeMap<DeliveryTag, Unacked>,
    consumers: usize,
}

impl Queue {
    pub fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            unacked: BTreeMap::new(),
            consumers: 0,
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn push(&mut self, message: StoredMessage) {
        self.ready.push_back(message);
    }

    /// Move the head message into the unacked table under `tag`
    pub fn checkout(&mut self, tag: DeliveryTag, owner: u64) -> Option<StoredMessage> {
        let message = self.ready.pop_front()?;
        self.unacked.insert(
            tag,
            Unacked {
                owner,
                message: message.clone(),
            },
        );
        Some(message)
    }

    pub fn ack(&mut self, tag: DeliveryTag) -> bool {
        self.unacked.remove(&tag).is_some()
    }

    /// Return an unacked message to the head of the queue
    pub fn requeue(&mut self, tag: DeliveryTag) -> bool {
        match self.unacked.remove(&tag) {
            Some(entry) => {
                self.ready.push_front(redelivered(entry.message));
                true
            }
            None => false,
        }
    }

    /// Requeue every message delivered to `owner`, keeping their original order
    pub fn requeue_owned_by(&mut self, owner: u64) -> usize {
        let tags: Vec<DeliveryTag> = self
            .unacked
            .iter()
            .filter(|(_, entry)| entry.owner == owner)
            .map(|(tag, _)| *tag)
            .collect();

        for tag in tags.iter().rev() {
            if let Some(entry) = self.unacked.remove(tag) {
                self.ready.push_front(redelivered(entry.message));
            }
        }
        tags.len()
    }

    /// Keep only what survives a broker restart
    pub fn retain_persistent(&mut self) {
        let owners: Vec<u64> = self.unacked.values().map(|entry| entry.owner).collect();
        for owner in owners {
            self.requeue_owned_by(owner);
        }
        self.ready
            .retain(|message| message.delivery_mode == DeliveryMode::Persistent);
        self.consumers = 0;
    }

    pub fn add_consumer(&mut self) {
        self.consumers += 1;
    }

    pub fn remove_consumer(&mut self) {
        self.consumers = self.consumers.saturating_sub(1);
    }

    pub fn depth(&self) -> usize {
        self.ready.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }
}

fn redelivered(mut message: StoredMessage) -> StoredMessage {
    message.delivery_count += 1;
    message
}
