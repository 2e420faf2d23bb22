//! Consuming login events from the message queue.
//!
//! The broker sits behind the `QueueClient` trait so the run can be exercised against
//! `MockQueueClient` in tests, following the same layout as our S3 client wrapper.

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::error::DisplayErrorContext;
use aws_sdk_sqs::types::DeleteMessageBatchRequestEntry;
use aws_sdk_sqs::Client as SqsClient;
use thiserror::Error;
use tracing::{debug, info};

use crate::record::{RawLoginEvent, RecordError};

/// SQS refuses to hand out more than this many messages per receive.
pub const MAX_MESSAGES_PER_RECEIVE: i32 = 10;
/// Longest long-poll wait SQS accepts, in seconds.
pub const MAX_WAIT_TIME_SECONDS: u64 = 20;

/// Enumeration of errors for operations with the queue broker.
/// These are transient: nothing about the messages themselves is known to be wrong.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("failed to receive messages: {0}")]
    Receive(String),
    #[error("failed to acknowledge messages: {0}")]
    Acknowledge(String),
}

/// A message as handed out by the broker, before its body is decoded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct QueueMessage {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    pub body: Option<String>,
}

impl QueueMessage {
    pub fn new(body: &str) -> Self {
        Self {
            message_id: None,
            receipt_handle: None,
            body: Some(body.to_owned()),
        }
    }
}

impl From<&aws_sdk_sqs::types::Message> for QueueMessage {
    fn from(message: &aws_sdk_sqs::types::Message) -> Self {
        Self {
            message_id: message.message_id().map(str::to_owned),
            receipt_handle: message.receipt_handle().map(str::to_owned),
            body: message.body().map(str::to_owned),
        }
    }
}

/// Broker operations used by a run.
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Receive up to `max_messages`, waiting at most `wait` for any to become available.
    async fn receive(
        &self,
        max_messages: i32,
        wait: time::Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Remove messages from the queue so they are not delivered again.
    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), QueueError>;
}

/// `QueueClient` backed by an SQS (or SQS-compatible, e.g. LocalStack) queue.
pub struct SqsQueueClient {
    client: SqsClient,
    queue_url: String,
}

impl SqsQueueClient {
    pub fn new(client: SqsClient, queue_url: &str) -> Self {
        Self {
            client,
            queue_url: queue_url.to_owned(),
        }
    }

    /// Build a client from the default AWS provider chain.
    /// Credentials are read from the environment, so local setups only need to export fake keys.
    pub async fn from_env(queue_url: &str, region: &str, endpoint_url: Option<&str>) -> Self {
        let mut loader =
            aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region.to_owned()));
        if let Some(endpoint) = endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        Self::new(SqsClient::new(&config), queue_url)
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }
}

#[async_trait]
impl QueueClient for SqsQueueClient {
    async fn receive(
        &self,
        max_messages: i32,
        wait: time::Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let wait_seconds = i32::try_from(wait.as_secs()).unwrap_or(i32::MAX);

        let output = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Receive(DisplayErrorContext(&e).to_string()))?;

        Ok(output.messages().iter().map(QueueMessage::from).collect())
    }

    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        for chunk in receipt_handles.chunks(MAX_MESSAGES_PER_RECEIVE as usize) {
            let entries = chunk
                .iter()
                .enumerate()
                .map(|(i, handle)| {
                    DeleteMessageBatchRequestEntry::builder()
                        .id(i.to_string())
                        .receipt_handle(handle)
                        .build()
                        .map_err(|e| QueueError::Acknowledge(e.to_string()))
                })
                .collect::<Result<Vec<_>, _>>()?;

            let output = self
                .client
                .delete_message_batch()
                .queue_url(&self.queue_url)
                .set_entries(Some(entries))
                .send()
                .await
                .map_err(|e| QueueError::Acknowledge(DisplayErrorContext(&e).to_string()))?;

            if !output.failed().is_empty() {
                let reasons: Vec<String> = output
                    .failed()
                    .iter()
                    .map(|f| format!("{}: {}", f.id(), f.message().unwrap_or(f.code())))
                    .collect();
                return Err(QueueError::Acknowledge(reasons.join(", ")));
            }
        }

        Ok(())
    }
}

/// In-memory queue for tests - always available, no conditional compilation needed.
///
/// Like the real queue, messages stay put until acknowledged, so every receive hands out the
/// oldest unacknowledged messages again.
#[derive(Default)]
pub struct MockQueueClient {
    messages: Mutex<VecDeque<QueueMessage>>,
    receive_error: Mutex<Option<QueueError>>,
    receive_calls: AtomicUsize,
    next_id: AtomicUsize,
}

impl MockQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a message body, assigning it a message id and receipt handle.
    pub fn send(&self, body: &str) -> &Self {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.push(QueueMessage {
            message_id: Some(format!("message-{id}")),
            receipt_handle: Some(format!("receipt-{id}")),
            body: Some(body.to_owned()),
        });
        self
    }

    /// Publish a message exactly as given.
    pub fn push(&self, message: QueueMessage) -> &Self {
        self.messages
            .lock()
            .expect("poisoned queue lock")
            .push_back(message);
        self
    }

    /// Fail the next receive with `error`.
    pub fn fail_next_receive(&self, error: QueueError) -> &Self {
        *self.receive_error.lock().expect("poisoned queue lock") = Some(error);
        self
    }

    /// Number of messages not yet acknowledged.
    pub fn len(&self) -> usize {
        self.messages.lock().expect("poisoned queue lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl QueueClient for MockQueueClient {
    async fn receive(
        &self,
        max_messages: i32,
        _wait: time::Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = self.receive_error.lock().expect("poisoned queue lock").take() {
            return Err(error);
        }

        let take = usize::try_from(max_messages).unwrap_or(0);
        Ok(self
            .messages
            .lock()
            .expect("poisoned queue lock")
            .iter()
            .take(take)
            .cloned()
            .collect())
    }

    async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        self.messages
            .lock()
            .expect("poisoned queue lock")
            .retain(|m| {
                m.receipt_handle
                    .as_ref()
                    .map_or(true, |h| !receipt_handles.contains(h))
            });
        Ok(())
    }
}

/// Number of messages requested per receive, within what SQS allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxMessages(pub i32);

impl Default for MaxMessages {
    fn default() -> Self {
        MaxMessages(MAX_MESSAGES_PER_RECEIVE)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseMaxMessagesError;

impl FromStr for MaxMessages {
    type Err = ParseMaxMessagesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let n = s.parse::<i32>().map_err(|_| ParseMaxMessagesError)?;
        if (1..=MAX_MESSAGES_PER_RECEIVE).contains(&n) {
            Ok(MaxMessages(n))
        } else {
            Err(ParseMaxMessagesError)
        }
    }
}

/// Long-poll wait in whole seconds, within what SQS allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTime(pub time::Duration);

impl Default for WaitTime {
    fn default() -> Self {
        WaitTime(time::Duration::from_secs(10))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseWaitTimeError;

impl FromStr for WaitTime {
    type Err = ParseWaitTimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseWaitTimeError)?;
        if secs <= MAX_WAIT_TIME_SECONDS {
            Ok(WaitTime(time::Duration::from_secs(secs)))
        } else {
            Err(ParseWaitTimeError)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: MaxMessages,
    pub wait: WaitTime,
}

/// A received message together with the result of decoding its body.
#[derive(Debug)]
pub struct Delivery {
    pub message_id: Option<String>,
    pub receipt_handle: Option<String>,
    pub event: Result<RawLoginEvent, RecordError>,
}

impl From<QueueMessage> for Delivery {
    fn from(message: QueueMessage) -> Self {
        let event = match message.body.as_deref() {
            Some(body) => RawLoginEvent::from_json(body),
            None => Err(RecordError::EmptyBody),
        };

        Delivery {
            message_id: message.message_id,
            receipt_handle: message.receipt_handle,
            event,
        }
    }
}

/// Pulls one bounded batch of login events per call.
pub struct QueueConsumer<'q> {
    client: &'q dyn QueueClient,
    options: ReceiveOptions,
}

impl<'q> QueueConsumer<'q> {
    pub fn new(client: &'q dyn QueueClient, options: ReceiveOptions) -> Self {
        Self { client, options }
    }

    pub fn options(&self) -> ReceiveOptions {
        self.options
    }

    /// Receive once and decode every message, keeping arrival order.
    ///
    /// Messages are not acknowledged here: everything handed out stays in the queue and will be
    /// delivered again to a later poll unless the caller acknowledges it.
    pub async fn poll(&self) -> Result<Vec<Delivery>, QueueError> {
        let messages = self
            .client
            .receive(self.options.max_messages.0, self.options.wait.0)
            .await?;

        if messages.is_empty() {
            info!("no messages available");
        } else {
            debug!(count = messages.len(), "received messages");
        }
        metrics::counter!("login_pipeline_messages_received_total")
            .increment(messages.len() as u64);

        Ok(messages.into_iter().map(Delivery::from).collect())
    }

    /// Remove delivered messages from the queue. Nothing calls this unless acknowledgement was
    /// asked for, since it turns redelivery off for those messages.
    pub async fn acknowledge(&self, receipt_handles: &[String]) -> Result<(), QueueError> {
        if receipt_handles.is_empty() {
            return Ok(());
        }
        self.client.acknowledge(receipt_handles).await
    }
}
