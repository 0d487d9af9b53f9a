use std::{net::IpAddr, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::{
    api::{
        command::{
            AddToQueue, ClearQueue, Cleared, Envelope, ErrorBody, ForBar, GetQueue, RejectEntry,
            RemoveFromQueue, ReorderQueue, Reply, UpdateQueueEntry, Validate,
        },
        rate_limit::TokenBucketLimiter,
        service::QueueEngine,
    },
    domain::{
        admission::{AddOutcome, Denial},
        error::QueueError,
        repository::{BarDirectory, BarPolicyProvider, QueueStore, SongCatalog},
    },
};

/// Turns a raw request into a raw reply. Implemented by anything a transport
/// can serve.
#[async_trait::async_trait]
pub trait RpcHandler: Clone + Send + Sync + 'static {
    async fn handle(&self, method: &str, payload: &[u8]) -> Vec<u8>;
}

enum Failure {
    Denied(Denial),
    Error(QueueError),
}

impl From<QueueError> for Failure {
    fn from(err: QueueError) -> Self {
        Failure::Error(err)
    }
}

type Routed = std::result::Result<Value, Failure>;

fn decode<C: DeserializeOwned + Validate>(payload: &[u8]) -> Result<Envelope<C>, QueueError> {
    let envelope: Envelope<C> = serde_json::from_slice(payload)
        .map_err(|e| QueueError::Validation(format!("malformed request: {}", e)))?;
    envelope.command.validate()?;
    Ok(envelope)
}

fn encode<T: Serialize>(data: T) -> Routed {
    serde_json::to_value(data).map_err(|e| Failure::Error(QueueError::Internal(e.into())))
}

/// Decodes typed commands, applies rate limits to mutations and calls the engine.
#[derive(Clone)]
pub struct Dispatcher<QS, V>
where
    QS: QueueStore,
    V: BarDirectory + SongCatalog + BarPolicyProvider,
{
    engine: QueueEngine<QS, V>,
    limiter: Arc<TokenBucketLimiter>,
}

impl<QS, V> Dispatcher<QS, V>
where
    QS: QueueStore + 'static,
    V: BarDirectory + SongCatalog + BarPolicyProvider + 'static,
{
    pub fn new(engine: QueueEngine<QS, V>, limiter: Arc<TokenBucketLimiter>) -> Self {
        Self { engine, limiter }
    }

    fn throttle(&self, bar_id: Option<&str>, client: Option<IpAddr>) -> Result<(), QueueError> {
        self.limiter.check(bar_id, client)
    }

    async fn route(&self, method: &str, payload: &[u8]) -> Routed {
        match method {
            "add" => {
                let req = decode::<AddToQueue>(payload)?;
                self.throttle(Some(&req.command.bar_id), req.client_addr)?;
                match self.engine.add(&req.principal, req.command).await? {
                    AddOutcome::Added(entry) => encode(entry),
                    AddOutcome::Rejected(denial) => Err(Failure::Denied(denial)),
                }
            }
            "update" => {
                let req = decode::<UpdateQueueEntry>(payload)?;
                self.throttle(req.principal.bar_id.as_deref(), req.client_addr)?;
                encode(self.engine.update(&req.principal, req.command).await?)
            }
            "reject" => {
                let req = decode::<RejectEntry>(payload)?;
                self.throttle(req.principal.bar_id.as_deref(), req.client_addr)?;
                encode(self.engine.reject(&req.principal, req.command.id).await?)
            }
            "remove" => {
                let req = decode::<RemoveFromQueue>(payload)?;
                self.throttle(req.principal.bar_id.as_deref(), req.client_addr)?;
                self.engine.remove(&req.principal, req.command.id).await?;
                Ok(Value::Null)
            }
            "reorder" => {
                let req = decode::<ReorderQueue>(payload)?;
                self.throttle(Some(&req.command.bar_id), req.client_addr)?;
                self.engine.reorder(&req.principal, req.command).await?;
                Ok(Value::Null)
            }
            "clear" => {
                let req = decode::<ClearQueue>(payload)?;
                self.throttle(Some(&req.command.bar_id), req.client_addr)?;
                let cleared_count = self.engine.clear(&req.principal, req.command).await?;
                encode(Cleared { cleared_count })
            }
            "skip" => {
                let req = decode::<ForBar>(payload)?;
                self.throttle(Some(&req.command.bar_id), req.client_addr)?;
                encode(self.engine.skip(&req.principal, &req.command.bar_id).await?)
            }
            "play_next" => {
                let req = decode::<ForBar>(payload)?;
                self.throttle(Some(&req.command.bar_id), req.client_addr)?;
                encode(self.engine.play_next(&req.principal, &req.command.bar_id).await?)
            }
            "get" => {
                let req = decode::<GetQueue>(payload)?;
                encode(self.engine.get_queue(&req.command).await?)
            }
            "playing" => {
                let req = decode::<ForBar>(payload)?;
                encode(self.engine.currently_playing(&req.command.bar_id).await?)
            }
            "upcoming" => {
                let req = decode::<ForBar>(payload)?;
                encode(self.engine.next_in_queue(&req.command.bar_id).await?)
            }
            "stats" => {
                let req = decode::<ForBar>(payload)?;
                encode(self.engine.stats(&req.command.bar_id).await?)
            }
            other => Err(Failure::Error(QueueError::Validation(format!(
                "unknown method: {}",
                other
            )))),
        }
    }
}

#[async_trait::async_trait]
impl<QS, V> RpcHandler for Dispatcher<QS, V>
where
    QS: QueueStore + 'static,
    V: BarDirectory + SongCatalog + BarPolicyProvider + 'static,
{
    async fn handle(&self, method: &str, payload: &[u8]) -> Vec<u8> {
        let reply = match self.route(method, payload).await {
            Ok(data) => Reply::Ok { data },
            Err(Failure::Denied(denial)) => Reply::Error(ErrorBody::from(&denial)),
            Err(Failure::Error(err)) => {
                match &err {
                    QueueError::Internal(cause) => {
                        error!(method, error = ?cause, "Unexpected failure")
                    }
                    other => info!(method, code = other.code(), "Request failed: {}", other),
                }
                Reply::Error(ErrorBody::from(&err))
            }
        };

        serde_json::to_vec(&reply).unwrap_or_else(|e| {
            error!(method, error = %e, "Failed to encode reply");
            br#"{"status":"error","code":"internal_error","reason":"internal error"}"#.to_vec()
        })
    }
}
