//! Cloud Pub/Sub REST client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{BusError, OutboundMessage, ProgressSource, Publisher, ReceivedMessage};

#[derive(Debug, Clone)]
pub struct PubsubConfig {
    pub base_url: String,
    pub access_token: Option<String>,
    pub timeout: Duration,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pubsub.googleapis.com/v1".to_string(),
            access_token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: [WireOutbound<'a>; 1],
}

#[derive(Serialize)]
struct WireOutbound<'a> {
    attributes: &'a BTreeMap<String, String>,
    data: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
    return_immediately: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<WireReceived>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireReceived {
    ack_id: String,
    message: WireMessage,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    message_id: String,
    publish_time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AcknowledgeRequest<'a> {
    ack_ids: &'a [String],
}

/// [`Publisher`] and [`ProgressSource`] over the Pub/Sub REST API.
pub struct PubsubClient {
    client: reqwest::Client,
    config: PubsubConfig,
}

impl PubsubClient {
    pub fn new(config: PubsubConfig) -> Result<Self, BusError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn post(&self, resource: &str, verb: &str) -> RequestBuilder {
        let url = format!("{}/{}:{}", self.config.base_url, resource, verb);
        let builder = self.client.post(url);
        match &self.config.access_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        resource: &str,
    ) -> Result<T, BusError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(BusError::NotFound(resource.to_string()));
        }
        warn!(status = %status, body = %body, resource, "Pub/Sub call failed");
        Err(BusError::Transient(format!("{resource}: {status}")))
    }
}

#[async_trait]
impl Publisher for PubsubClient {
    async fn publish(&self, topic: &str, message: &OutboundMessage) -> Result<String, BusError> {
        let request = PublishRequest {
            messages: [WireOutbound {
                attributes: &message.attributes,
                data: STANDARD.encode(message.data.as_bytes()),
            }],
        };
        let response: PublishResponse = self
            .send(self.post(topic, "publish").json(&request), topic)
            .await?;
        let message_id = response
            .message_ids
            .into_iter()
            .next()
            .ok_or_else(|| BusError::Transient(format!("{topic}: no message id returned")))?;
        debug!(topic, message_id = %message_id, "Published message");
        Ok(message_id)
    }
}

#[async_trait]
impl ProgressSource for PubsubClient {
    async fn pull(&self, subscription: &str, max: u32) -> Result<Vec<ReceivedMessage>, BusError> {
        let request = PullRequest {
            max_messages: max,
            return_immediately: true,
        };
        let response: PullResponse = self
            .send(self.post(subscription, "pull").json(&request), subscription)
            .await?;

        response
            .received_messages
            .into_iter()
            .map(|received| {
                let data = received
                    .message
                    .data
                    .map(|encoded| {
                        STANDARD
                            .decode(encoded.as_bytes())
                            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                            .map_err(|e| BusError::Decode(e.to_string()))
                    })
                    .transpose()?;
                Ok(ReceivedMessage {
                    ack_id: received.ack_id,
                    message_id: received.message.message_id,
                    attributes: received.message.attributes,
                    data,
                    publish_time: received.message.publish_time,
                })
            })
            .collect()
    }

    async fn acknowledge(&self, subscription: &str, ack_ids: &[String]) -> Result<(), BusError> {
        if ack_ids.is_empty() {
            return Ok(());
        }
        let request = AcknowledgeRequest { ack_ids };
        let _: serde_json::Value = self
            .send(
                self.post(subscription, "acknowledge").json(&request),
                subscription,
            )
            .await?;
        Ok(())
    }
}
