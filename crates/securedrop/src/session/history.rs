//! Message history of the current session

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which way a message travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[serde(rename = "in")]
    Incoming,
    #[serde(rename = "out")]
    Outgoing,
}

/// Delivery status of a history entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Receiving,
    Received,
    Failed,
}

/// Content of a history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessagePayload {
    Text {
        text: String,
    },
    File {
        transfer_id: String,
        name: String,
        size: u64,
        mime: Option<String>,
        /// Received bytes, held in memory only
        #[serde(skip)]
        data: Option<Bytes>,
    },
}

/// One entry of the message history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub direction: Direction,
    pub payload: MessagePayload,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
}

impl ChatMessage {
    pub fn new(
        sender_id: &str,
        direction: Direction,
        payload: MessagePayload,
        status: MessageStatus,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            direction,
            payload,
            timestamp: Utc::now(),
            status,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.payload {
            MessagePayload::Text { text } => Some(text),
            MessagePayload::File { .. } => None,
        }
    }

    pub fn transfer_id(&self) -> Option<&str> {
        match &self.payload {
            MessagePayload::File { transfer_id, .. } => Some(transfer_id),
            MessagePayload::Text { .. } => None,
        }
    }
}

/// Ordered, append-only history; only entry status and file data change
#[derive(Debug, Clone, Default)]
pub struct MessageHistory {
    entries: Vec<ChatMessage>,
}

impl MessageHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.entries.push(message);
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Update the status of the file entry for `transfer_id` travelling in
    /// `direction`, returning the updated entry
    pub fn update_transfer(
        &mut self,
        transfer_id: &str,
        direction: Direction,
        status: MessageStatus,
        data: Option<Bytes>,
    ) -> Option<ChatMessage> {
        let entry = self
            .entries
            .iter_mut()
            .rev()
            .find(|m| m.direction == direction && m.transfer_id() == Some(transfer_id))?;

        entry.status = status;
        if let (Some(bytes), MessagePayload::File { data: slot, .. }) = (data, &mut entry.payload) {
            *slot = Some(bytes);
        }
        Some(entry.clone())
    }
}
