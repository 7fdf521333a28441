use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, warn};
use tokio::sync::mpsc;

use crate::events::{BusError, Event, EventBus};

/// Subject every flag change event is published to.
const SUBJECT: &str = "feature-toggles";

const RECEIVER_BUFFER: usize = 16;

/// NATS-backed event bus. Events are JSON-encoded onto a single well-known
/// subject.
pub struct NatsBus {
    client: async_nats::Client,
}

impl NatsBus {
    pub async fn connect(url: &str) -> Result<NatsBus, BusError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(NatsBus { client })
    }

    pub async fn connect_with_token(url: &str, token: String) -> Result<NatsBus, BusError> {
        let client = async_nats::ConnectOptions::new()
            .token(token)
            .connect(url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(NatsBus { client })
    }
}

#[async_trait]
impl EventBus for NatsBus {
    async fn send(&self, event: &Event) -> Result<(), BusError> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(SUBJECT, payload.into())
            .await
            .map_err(|e| BusError::Publish(e.to_string()))?;
        Ok(())
    }

    async fn receiver(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(RECEIVER_BUFFER);

        match self.client.subscribe(SUBJECT).await {
            Ok(mut subscriber) => {
                tokio::spawn(async move {
                    while let Some(message) = subscriber.next().await {
                        let event = match serde_json::from_slice::<Event>(&message.payload) {
                            Ok(event) => event,
                            Err(err) => {
                                warn!("discarding malformed bus payload: {err}");
                                continue;
                            }
                        };

                        if tx.send(event).await.is_err() {
                            debug!("event receiver dropped, ending subscription");
                            break;
                        }
                    }
                });
            }
            Err(err) => {
                // Terminal error event; the channel closes right after.
                let _ = tx.try_send(Event::error(err.to_string()));
            }
        }

        rx
    }
}
