//! Topic subscription transport.
//!
//! Messages arrive as `(topic, payload)` pairs on an in-process channel, fed by
//! the HTTP bridge route that a broker's webhook or bridge plugin targets. The
//! consumer validates the topic against `<namespace>/nodes/<node_id>/telemetry`,
//! normalizes the payload and hands it to the node pipeline.
//!
//! Messages are handed to node mailboxes in arrival order, which keeps
//! per-node order. The consumer only waits for mailbox space; each reply is
//! awaited on its own task, so a node busy evaluating holds up nobody else.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::ingest::{self, SchemaError};
use super::pipeline::{IngestReceipt, NodeRouter, PipelineError};

/// Messages the subscription channel holds before the bridge waits.
const TOPIC_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("subscription consumer is not running")]
    Closed,
}

pub type SubscribeResult = Result<IngestReceipt, SubscribeError>;

/// One message received on a subscribed topic.
#[derive(Debug)]
pub struct TopicMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Where to report the outcome, if the producer waits for it
    pub reply: Option<oneshot::Sender<SubscribeResult>>,
}

/// Producer side of the subscription channel.
#[derive(Debug, Clone)]
pub struct TopicPublisher {
    tx: mpsc::Sender<TopicMessage>,
}

impl TopicPublisher {
    /// Deliver a message and wait for the pipeline's verdict.
    pub async fn deliver(&self, topic: String, payload: Vec<u8>) -> SubscribeResult {
        let (reply, outcome) = oneshot::channel();
        self.tx
            .send(TopicMessage {
                topic,
                payload,
                reply: Some(reply),
            })
            .await
            .map_err(|_| SubscribeError::Closed)?;
        outcome.await.map_err(|_| SubscribeError::Closed)?
    }
}

pub fn channel() -> (TopicPublisher, mpsc::Receiver<TopicMessage>) {
    let (tx, rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
    (TopicPublisher { tx }, rx)
}

fn respond(topic: &str, reply: Option<oneshot::Sender<SubscribeResult>>, outcome: SubscribeResult) {
    match reply {
        Some(reply) => {
            let _ = reply.send(outcome);
        }
        None => {
            if let Err(e) = outcome {
                tracing::debug!("Message on '{}' dropped: {}", topic, e);
            }
        }
    }
}

/// Consume the subscription channel until every publisher is dropped.
///
/// Should be spawned via `tokio::spawn(run_subscriber(...))`.
pub async fn run_subscriber(namespace: String, router: Arc<NodeRouter>, mut rx: mpsc::Receiver<TopicMessage>) {
    tracing::info!("Subscribed to {}/nodes/+/telemetry", namespace);

    while let Some(TopicMessage { topic, payload, reply }) = rx.recv().await {
        let record = match ingest::normalize_topic_message(&namespace, &topic, &payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!("Rejected message on '{}': {}", topic, e);
                respond(&topic, reply, Err(e.into()));
                continue;
            }
        };
        let node_id = record.node_id.clone();
        let response = match router.dispatch(record).await {
            Ok(response) => response,
            Err(e) => {
                respond(&topic, reply, Err(e.into()));
                continue;
            }
        };
        tokio::spawn(async move {
            let outcome = match response.await {
                Ok(result) => result.map_err(SubscribeError::from),
                Err(_) => Err(PipelineError::NodeUnavailable(node_id).into()),
            };
            respond(&topic, reply, outcome);
        });
    }
    tracing::info!("Subscription channel closed");
}
