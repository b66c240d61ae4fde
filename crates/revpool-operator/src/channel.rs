//! Join/part channel access.
//!
//! The community's governance publishes membership changes on an ordered
//! message channel. [`ChannelClient`] abstracts the transport; the watcher
//! only sees an mpsc stream of envelopes starting at a resume timestamp.
//! [`HttpChannel`] polls a channel node over HTTP; [`MockChannel`] scripts
//! messages for tests.

use alloy_primitives::Address;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use revpool_core::ChannelMessage;

/// Capacity of the subscription buffer. Bounded so a stalled consumer
/// applies backpressure to the poller instead of growing without limit.
const SUBSCRIPTION_BUFFER: usize = 1024;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel transport error: {0}")]
    Transport(String),
}

/// Subscription source for join/part envelopes.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    /// Start a subscription delivering every message with
    /// `timestamp >= from_timestamp`, in channel order, then live messages
    /// as they arrive. Dropping the receiver ends the subscription.
    async fn subscribe(
        &self,
        from_timestamp: u64,
    ) -> Result<mpsc::Receiver<ChannelMessage>, ChannelError>;
}

/// HTTP polling implementation against a channel node.
///
/// `GET {base}/channels/{community}/messages?from={ts}` returns a JSON array
/// of envelopes ordered by timestamp; the poller advances its cursor past
/// the last delivered message.
pub struct HttpChannel {
    client: reqwest::Client,
    base_url: String,
    community_address: Address,
    poll_interval: Duration,
}

impl HttpChannel {
    pub fn new(
        base_url: impl Into<String>,
        community_address: Address,
    ) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChannelError::Transport(format!("failed to build http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            community_address,
            poll_interval: Duration::from_secs(2),
        })
    }

    fn messages_url(&self, from: u64) -> String {
        messages_url(&self.base_url, &self.community_address, from)
    }
}

fn messages_url(base: &str, community: &Address, from: u64) -> String {
    format!(
        "{}/channels/0x{}/messages?from={}",
        base.trim_end_matches('/'),
        hex::encode(community.as_slice()),
        from
    )
}

#[async_trait]
impl ChannelClient for HttpChannel {
    async fn subscribe(
        &self,
        from_timestamp: u64,
    ) -> Result<mpsc::Receiver<ChannelMessage>, ChannelError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let client = self.client.clone();
        let base = self.base_url.clone();
        let community = self.community_address;
        let interval = self.poll_interval;

        tokio::spawn(async move {
            let mut cursor = from_timestamp;
            loop {
                match client
                    .get(messages_url(&base, &community, cursor))
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                {
                    Ok(response) => match response.json::<Vec<ChannelMessage>>().await {
                        Ok(messages) => {
                            for message in messages {
                                // Cursor past the delivered message so the
                                // next poll starts after it.
                                cursor = cursor.max(message.timestamp + 1);
                                if tx.send(message).await.is_err() {
                                    debug!("channel subscriber dropped, poller exiting");
                                    return;
                                }
                            }
                        }
                        Err(e) => warn!(error = %e, "channel response decode failed"),
                    },
                    Err(e) => warn!(error = %e, "channel poll failed, retrying next cycle"),
                }
                tokio::time::sleep(interval).await;
            }
        });

        Ok(rx)
    }
}

/// Scripted channel for tests. Pre-loaded messages are delivered on
/// subscribe (filtered by the resume timestamp); `push` feeds live
/// subscribers afterwards.
#[derive(Debug, Default)]
pub struct MockChannel {
    scripted: Mutex<Vec<ChannelMessage>>,
    live: Mutex<Vec<mpsc::Sender<ChannelMessage>>>,
}

impl MockChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a message delivered to future subscribers.
    pub fn preload(&self, message: ChannelMessage) {
        self.scripted.lock().push(message);
    }

    /// Deliver a message to every live subscriber.
    pub async fn push(&self, message: ChannelMessage) {
        let senders = self.live.lock().clone();
        for sender in senders {
            let _ = sender.send(message.clone()).await;
        }
    }
}

#[async_trait]
impl ChannelClient for MockChannel {
    async fn subscribe(
        &self,
        from_timestamp: u64,
    ) -> Result<mpsc::Receiver<ChannelMessage>, ChannelError> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let backlog: Vec<ChannelMessage> = self
            .scripted
            .lock()
            .iter()
            .filter(|m| m.timestamp >= from_timestamp)
            .cloned()
            .collect();
        for message in backlog {
            tx.send(message)
                .await
                .map_err(|e| ChannelError::Transport(e.to_string()))?;
        }
        self.live.lock().push(tx);
        Ok(rx)
    }
}
