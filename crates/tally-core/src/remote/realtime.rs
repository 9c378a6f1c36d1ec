//! Supabase Realtime change feed (Phoenix channels over a websocket).
//!
//! One websocket per subscribed table. The channel joins
//! `realtime:public:<table>` with a `postgres_changes` filter, heartbeats
//! every 25 seconds, and forwards decoded row changes into an mpsc queue
//! until it is shut down or the socket closes.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::error::{Error, RemoteError, Result};
use crate::models::SyncTable;
use crate::vault::SecretString;

use super::{ChangeEvent, ChangeFeed, ChangeKind, ChangeSubscription};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const EVENT_BUFFER: usize = 256;
const JOIN_REF: &str = "1";
const PROTOCOL_VERSION: &str = "1.0.0";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Phoenix channel frame (serializer v1: one JSON object per message).
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
}

/// Realtime implementation of [`ChangeFeed`].
#[derive(Clone)]
pub struct SupabaseRealtime {
    base_url: String,
    api_key: SecretString,
}

impl std::fmt::Debug for SupabaseRealtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseRealtime")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseRealtime {
    pub fn new(base_url: &str, api_key: SecretString) -> Self {
        Self {
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[async_trait]
impl ChangeFeed for SupabaseRealtime {
    async fn subscribe(&self, table: SyncTable) -> Result<ChangeSubscription> {
        let url = socket_url(&self.base_url, self.api_key.expose())?;
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|error| realtime_error(table, "connect", error))?;
        let (mut sink, mut source) = socket.split();

        let topic = channel_topic(table);
        let join = join_message(&topic, table, self.api_key.expose());
        send_frame(&mut sink, &join)
            .await
            .map_err(|error| realtime_error(table, "join", error))?;

        tokio::time::timeout(JOIN_TIMEOUT, wait_for_join(&mut source, &topic))
            .await
            .map_err(|_| realtime_error(table, "join", "timed out waiting for join reply"))?
            .map_err(|message| realtime_error(table, "join", message))?;
        tracing::debug!("Joined realtime channel {topic}");

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_channel(
            table,
            topic,
            sink,
            source,
            events_tx,
            shutdown_rx,
        ));

        Ok(ChangeSubscription {
            events,
            shutdown,
            task,
        })
    }
}

/// `wss://<host>/realtime/v1/websocket?apikey=<key>&vsn=1.0.0`
fn socket_url(base_url: &str, api_key: &str) -> Result<Url> {
    let mut url = Url::parse(base_url)
        .map_err(|error| Error::InvalidInput(format!("Invalid realtime URL: {error}")))?;
    let scheme = if url.scheme() == "http" { "ws" } else { "wss" };
    url.set_scheme(scheme)
        .map_err(|()| Error::InvalidInput(format!("Cannot derive websocket URL from {base_url}")))?;
    url.set_path("/realtime/v1/websocket");
    url.query_pairs_mut()
        .clear()
        .append_pair("apikey", api_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

fn channel_topic(table: SyncTable) -> String {
    format!("realtime:public:{table}")
}

fn join_message(topic: &str, table: SyncTable, access_token: &str) -> PhoenixMessage {
    PhoenixMessage {
        topic: topic.to_string(),
        event: "phx_join".to_string(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [
                    { "event": "*", "schema": "public", "table": table.name() }
                ]
            },
            "access_token": access_token,
        }),
        reference: Some(JOIN_REF.to_string()),
    }
}

async fn send_frame(
    sink: &mut SplitSink<Socket, Message>,
    message: &PhoenixMessage,
) -> std::result::Result<(), String> {
    let text = serde_json::to_string(message).map_err(|error| error.to_string())?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|error| error.to_string())
}

async fn wait_for_join(
    source: &mut SplitStream<Socket>,
    topic: &str,
) -> std::result::Result<(), String> {
    while let Some(frame) = source.next().await {
        let text = match frame.map_err(|error| error.to_string())? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(message) = serde_json::from_str::<PhoenixMessage>(text.as_str()) else {
            continue;
        };
        if message.topic != topic
            || message.event != "phx_reply"
            || message.reference.as_deref() != Some(JOIN_REF)
        {
            continue;
        }
        return match message.payload.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            _ => Err(format!(
                "channel join rejected: {}",
                message
                    .payload
                    .get("response")
                    .map_or_else(|| message.payload.to_string(), Value::to_string)
            )),
        };
    }
    Err("socket closed before join reply".to_string())
}

async fn run_channel(
    table: SyncTable,
    topic: String,
    mut sink: SplitSink<Socket, Message>,
    mut source: SplitStream<Socket>,
    events: mpsc::Sender<ChangeEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // the first tick completes immediately
    heartbeat.tick().await;
    let mut next_ref: u64 = 2;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                let leave = PhoenixMessage {
                    topic: topic.clone(),
                    event: "phx_leave".to_string(),
                    payload: json!({}),
                    reference: Some(next_ref.to_string()),
                };
                send_frame(&mut sink, &leave).await.ok();
                sink.close().await.ok();
                tracing::debug!("Left realtime channel {topic}");
                break;
            }
            _ = heartbeat.tick() => {
                let beat = PhoenixMessage {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(next_ref.to_string()),
                };
                next_ref += 1;
                if let Err(error) = send_frame(&mut sink, &beat).await {
                    tracing::warn!("Realtime heartbeat for {topic} failed: {error}");
                    break;
                }
            }
            frame = source.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<PhoenixMessage>(text.as_str()) {
                        Ok(message) => {
                            if let Some(event) = parse_change(table, &message) {
                                if events.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(error) => {
                            tracing::warn!("Ignoring undecodable realtime frame on {topic}: {error}");
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    sink.send(Message::Pong(data)).await.ok();
                }
                Some(Ok(Message::Close(_))) | None => {
                    tracing::info!("Realtime channel {topic} closed by server");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::warn!("Realtime channel {topic} failed: {error}");
                    break;
                }
            }
        }
    }
}

/// Decode a row change from a channel frame; other frames yield `None`.
fn parse_change(table: SyncTable, message: &PhoenixMessage) -> Option<ChangeEvent> {
    let data = match message.event.as_str() {
        "postgres_changes" => message.payload.get("data")?,
        "INSERT" | "UPDATE" | "DELETE" => &message.payload,
        _ => return None,
    };
    let kind = match data.get("type").and_then(Value::as_str)? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        _ => return None,
    };
    let new = data
        .get("record")
        .and_then(Value::as_object)
        .filter(|row| !row.is_empty())
        .cloned();
    let old = data
        .get("old_record")
        .and_then(Value::as_object)
        .filter(|row| !row.is_empty())
        .cloned();
    Some(ChangeEvent {
        table,
        kind,
        new,
        old,
    })
}

fn realtime_error(table: SyncTable, step: &str, error: impl std::fmt::Display) -> Error {
    RemoteError::new(format!("realtime {step} {table}"), error.to_string()).into()
}
