use std::collections::BTreeMap;

use chrono::Utc;
use rand::RngCore;
use tracing::info;
use uuid::Uuid;

use super::{duplicate_name, validate_name, Service};
use crate::crypto::signature;
use crate::error::{Error, Result};
use crate::hub::HubEvent;
use crate::model::{Event, EventSource, SourceType};
use crate::store::Required;

const KEY_BYTES: usize = 32;

/// A freshly created event source with its verification key. The key is
/// only ever returned here.
#[derive(Debug, Clone)]
pub struct NewEventSource {
    pub source: EventSource,
    pub key: String,
}

impl Service {
    pub async fn create_event_source(&self, canvas_id: Uuid, name: &str) -> Result<NewEventSource> {
        validate_name("event source", name)?;
        self.canvas(canvas_id).await?;
        if self.store.find_event_source_by_name(canvas_id, name).await?.is_some() {
            return Err(duplicate_name("event source"));
        }

        let mut raw = [0u8; KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut raw);
        let key = hex::encode(raw);

        let now = Utc::now();
        let source = EventSource {
            id: Uuid::new_v4(),
            canvas_id,
            name: name.to_string(),
            key: self.encryptor.encrypt(key.as_bytes(), name.as_bytes())?,
            created_at: now,
            updated_at: now,
        };
        self.store.create_event_source(&source).await?;

        info!(%canvas_id, source_id = %source.id, name, "event source created");
        self.hub.publish(canvas_id, HubEvent::EventSourceAdded, &source);
        Ok(NewEventSource { source, key })
    }

    pub async fn describe_event_source(&self, canvas_id: Uuid, id_or_name: &str) -> Result<EventSource> {
        let source = match Uuid::parse_str(id_or_name) {
            Ok(id) => self.store.find_event_source(id).await,
            Err(_) => self.store.find_event_source_by_name(canvas_id, id_or_name).await,
        }
        .required("event source")?;

        if source.canvas_id != canvas_id {
            return Err(Error::not_found("event source"));
        }
        Ok(source)
    }

    pub async fn list_event_sources(&self, canvas_id: Uuid) -> Result<Vec<EventSource>> {
        self.store.list_event_sources(canvas_id).await
    }

    /// Check a webhook signature against the source's verification key.
    pub fn verify_signature(&self, source: &EventSource, body: &[u8], signature: &str) -> Result<bool> {
        let key = self.encryptor.decrypt(&source.key, source.name.as_bytes())?;
        Ok(signature::verify(&key, body, signature))
    }

    /// Accept a verified webhook delivery: persist it and route it.
    pub async fn receive_event(
        &self,
        source: &EventSource,
        body: &[u8],
        headers: BTreeMap<String, String>,
    ) -> Result<Event> {
        let raw: serde_json::Value = serde_json::from_slice(body)?;
        let event = Event::new(source.id, source.name.clone(), SourceType::EventSource, raw, headers);
        self.router.receive(event).await
    }
}
