//! Real-time fan-out of lifecycle transitions to canvas subscribers.
//!
//! The hub only moves already-serialized messages into per-client bounded
//! queues. Transport (websocket pings, write deadlines) lives at the edge;
//! [`HubConfig`] carries the timings it should use.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::Execution;

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Messages queued per client before it is considered dead.
    pub client_buffer: usize,
    pub ping_period: Duration,
    /// Roughly twice the ping period.
    pub pong_wait: Duration,
    pub write_wait: Duration,
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_buffer: 4096,
            ping_period: Duration::from_secs(10),
            pong_wait: Duration::from_secs(20),
            write_wait: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
        }
    }
}

/// Lifecycle transitions mirrored to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HubEvent {
    EventSourceAdded,
    StageAdded,
    StageUpdated,
    NewStageEvent,
    StageEventApproved,
    ExecutionCreated,
    ExecutionStarted,
    ExecutionFinished,
}

impl HubEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            HubEvent::EventSourceAdded => "event_source_added",
            HubEvent::StageAdded => "stage_added",
            HubEvent::StageUpdated => "stage_updated",
            HubEvent::NewStageEvent => "new_stage_event",
            HubEvent::StageEventApproved => "stage_event_approved",
            HubEvent::ExecutionCreated => "execution_created",
            HubEvent::ExecutionStarted => "execution_started",
            HubEvent::ExecutionFinished => "execution_finished",
        }
    }
}

/// A registered client's end of the hub.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: Uuid,
    pub canvas_id: Uuid,
    pub receiver: mpsc::Receiver<Arc<str>>,
}

#[derive(Debug)]
struct Client {
    canvas_id: Uuid,
    sender: mpsc::Sender<Arc<str>>,
}

#[derive(Debug, Default)]
struct Indexes {
    clients: HashMap<Uuid, Client>,
    canvases: HashMap<Uuid, HashSet<Uuid>>,
}

#[derive(Debug)]
pub struct Hub {
    config: HubConfig,
    indexes: RwLock<Indexes>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

impl Hub {
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            indexes: RwLock::new(Indexes::default()),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn register(&self, canvas_id: Uuid) -> Subscription {
        let client_id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(self.config.client_buffer.max(1));

        let mut indexes = self.indexes.write();
        indexes.clients.insert(client_id, Client { canvas_id, sender });
        indexes.canvases.entry(canvas_id).or_default().insert(client_id);
        debug!(%client_id, %canvas_id, "hub client registered");

        Subscription {
            client_id,
            canvas_id,
            receiver,
        }
    }

    /// Drop a client from both indexes. Unknown clients are ignored.
    pub fn unregister(&self, client_id: Uuid) {
        let mut indexes = self.indexes.write();
        let Some(client) = indexes.clients.remove(&client_id) else {
            return;
        };
        if let Some(members) = indexes.canvases.get_mut(&client.canvas_id) {
            members.remove(&client_id);
            if members.is_empty() {
                indexes.canvases.remove(&client.canvas_id);
            }
        }
        debug!(%client_id, canvas_id = %client.canvas_id, "hub client unregistered");
    }

    pub fn client_count(&self) -> usize {
        self.indexes.read().clients.len()
    }

    pub fn canvas_client_count(&self, canvas_id: Uuid) -> usize {
        self.indexes
            .read()
            .canvases
            .get(&canvas_id)
            .map_or(0, HashSet::len)
    }

    /// Queue a message for every client of a canvas.
    pub fn broadcast_to_canvas(&self, canvas_id: Uuid, message: Arc<str>) {
        let dead = {
            let indexes = self.indexes.read();
            let Some(members) = indexes.canvases.get(&canvas_id) else {
                return;
            };
            members
                .iter()
                .filter_map(|id| indexes.clients.get(id).map(|c| (*id, c)))
                .filter(|(_, client)| client.sender.try_send(Arc::clone(&message)).is_err())
                .map(|(id, _)| id)
                .collect::<Vec<_>>()
        };
        self.drop_clients(dead);
    }

    /// Queue a message for every client.
    pub fn broadcast_all(&self, message: Arc<str>) {
        let dead = {
            let indexes = self.indexes.read();
            indexes
                .clients
                .iter()
                .filter(|(_, client)| client.sender.try_send(Arc::clone(&message)).is_err())
                .map(|(id, _)| *id)
                .collect::<Vec<_>>()
        };
        self.drop_clients(dead);
    }

    /// Serialize `{event, payload}` and broadcast it to the canvas.
    pub fn publish<P: Serialize>(&self, canvas_id: Uuid, event: HubEvent, payload: &P) {
        let message = json!({ "event": event.as_str(), "payload": payload });
        match serde_json::to_string(&message) {
            Ok(text) => self.broadcast_to_canvas(canvas_id, Arc::from(text)),
            Err(e) => warn!(event = event.as_str(), error = %e, "failed to serialize hub message"),
        }
    }

    pub fn publish_execution(&self, canvas_id: Uuid, event: HubEvent, execution: &Execution) {
        self.publish(canvas_id, event, &execution_payload(canvas_id, execution));
    }

    fn drop_clients(&self, dead: Vec<Uuid>) {
        for client_id in dead {
            // Full or closed buffer: the client is not keeping up.
            warn!(%client_id, "dropping slow hub client");
            self.unregister(client_id);
        }
    }
}

pub fn execution_payload(canvas_id: Uuid, execution: &Execution) -> serde_json::Value {
    json!({
        "id": execution.id,
        "stage_id": execution.stage_id,
        "canvas_id": canvas_id,
        "state": execution.state.as_str(),
        "result": execution.result.map(|r| r.as_str()).unwrap_or_default(),
        "timestamp": Utc::now(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub(buffer: usize) -> Hub {
        Hub::new(HubConfig {
            client_buffer: buffer,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn broadcasts_only_to_the_canvas() {
        let hub = hub(8);
        let canvas = Uuid::new_v4();
        let mut a = hub.register(canvas);
        let mut other = hub.register(Uuid::new_v4());

        hub.publish(canvas, HubEvent::StageAdded, &json!({"name": "build"}));

        let message = a.receiver.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(value["event"], "stage_added");
        assert_eq!(value["payload"]["name"], "build");
        assert!(other.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_all_reaches_every_client() {
        let hub = hub(8);
        let mut a = hub.register(Uuid::new_v4());
        let mut b = hub.register(Uuid::new_v4());
        hub.broadcast_all(Arc::from("ping"));
        assert_eq!(&*a.receiver.recv().await.unwrap(), "ping");
        assert_eq!(&*b.receiver.recv().await.unwrap(), "ping");
    }

    #[test]
    fn full_buffer_drops_the_client() {
        let hub = hub(1);
        let canvas = Uuid::new_v4();
        let _slow = hub.register(canvas);

        hub.broadcast_to_canvas(canvas, Arc::from("one"));
        assert_eq!(hub.client_count(), 1);
        hub.broadcast_to_canvas(canvas, Arc::from("two"));
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.canvas_client_count(canvas), 0);
    }

    #[test]
    fn closed_receiver_drops_the_client() {
        let hub = hub(4);
        let canvas = Uuid::new_v4();
        drop(hub.register(canvas));
        hub.broadcast_to_canvas(canvas, Arc::from("x"));
        assert_eq!(hub.client_count(), 0);
    }

    #[test]
    fn unregister_clears_both_indexes() {
        let hub = hub(4);
        let canvas = Uuid::new_v4();
        let sub = hub.register(canvas);
        hub.unregister(sub.client_id);
        hub.unregister(sub.client_id);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.canvas_client_count(canvas), 0);
    }
}
