//! Message bus: job publication and progress collection.

pub mod pubsub;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use pubsub::{PubsubClient, PubsubConfig};

/// Message bus failures.
#[derive(Debug, Error)]
pub enum BusError {
    /// The topic or subscription does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("bus request failed: {0}")]
    Transient(String),

    #[error("invalid message payload: {0}")]
    Decode(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl BusError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub attributes: BTreeMap<String, String>,
    pub data: String,
}

/// A message pulled from a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub ack_id: String,
    pub message_id: String,
    pub attributes: BTreeMap<String, String>,
    pub data: Option<String>,
    pub publish_time: DateTime<Utc>,
}

/// Publishes job messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish to a fully qualified topic. Returns the bus message id.
    async fn publish(&self, topic: &str, message: &OutboundMessage) -> Result<String, BusError>;
}

/// Source of worker progress reports.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    /// Pull up to `max` messages without blocking for new ones.
    async fn pull(&self, subscription: &str, max: u32) -> Result<Vec<ReceivedMessage>, BusError>;

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BusError>;
}
