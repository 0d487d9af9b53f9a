use anyhow::{anyhow, Result};
use async_nats::Client;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{error, info, warn};

use crate::{api::rpc::RpcHandler, domain::event::Event};

#[async_trait::async_trait]
pub trait EventTransport: Clone + Send + Sync {
    async fn publish(&self, event: &Event) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct NatsEventTransport {
    client: Client,
}

impl NatsEventTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl EventTransport for NatsEventTransport {
    async fn publish(&self, event: &Event) -> Result<()> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        self.client
            .publish(event.subject(), payload)
            .await
            .map_err(|e| anyhow!(e))?;
        Ok(())
    }
}

/// Pushes every notifier event to `transport` until the notifier goes away.
/// Events lost to lag or transport errors are logged and skipped.
pub async fn forward<E: EventTransport>(mut events: broadcast::Receiver<Event>, transport: E) {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Err(err) = transport.publish(&event).await {
                    warn!(subject = %event.subject(), error = %err, "Event publish failed");
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event forwarder lagged, events dropped");
            }
            Err(RecvError::Closed) => {
                info!("Event channel closed");
                return;
            }
        }
    }
}

/// Serves `<service>.rpc.<method>` requests on a NATS queue group, one task
/// per message.
#[derive(Clone, Debug)]
pub struct NatsRpc {
    client: Client,
    service: String,
}

impl NatsRpc {
    pub fn new(client: Client, service: String) -> Self {
        Self { client, service }
    }

    pub async fn listen<H: RpcHandler>(&self, handler: H) -> Result<()> {
        let subject = format!("{}.rpc.*", self.service);
        let mut requests = self
            .client
            .queue_subscribe(subject.clone(), self.service.clone())
            .await
            .map_err(|e| anyhow!(e))?;

        info!(subject, "Listening for requests");

        while let Some(message) = requests.next().await {
            let handler = handler.clone();
            let client = self.client.clone();

            tokio::spawn(async move {
                let method = message.subject.rsplit('.').next().unwrap_or_default();
                let reply = handler.handle(method, &message.payload).await;

                match &message.reply {
                    Some(reply_to) => {
                        if let Err(err) = client.publish(reply_to.clone(), Bytes::from(reply)).await
                        {
                            error!(method, error = %err, "Failed to send reply");
                        }
                    }
                    None => warn!(method, "Request without reply subject"),
                }
            });
        }

        Ok(())
    }
}
