//! Request dispatch for the chat socket.
//!
//! Every inbound frame produces exactly one [`Response`] for the requester.
//! Successful writes additionally produce an [`Event`] that is fanned out to
//! every *other* open connection before the response is queued.

use std::sync::Arc;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn, Span};

use murmur_core::messages::MessageDraft;
use murmur_core::protocol::{Event, Request, Response, CONVERSATION_UPDATED, MESSAGE_ADDED};
use murmur_core::records::{add_participant, remove_participant, Record};
use murmur_core::UserId;
use murmur_store::{Database, StoreError};

use crate::error::HubError;
use crate::registry::{Connection, ConnectionRegistry};
use crate::rpc::{require_str, require_u64, require_value, to_data};

pub const ATTACHMENT_ID_LEN: usize = 20;
pub const DEFAULT_MAX_ATTACHMENTS: usize = 100;
pub const DEFAULT_BLOB_BASE_URL: &str = "http://localhost:8000/blob";

/// What a handler hands back: the response payload and, for mutations, the
/// event the other connections should see.
struct Outcome {
    data: Value,
    event: Option<Event>,
}

impl Outcome {
    fn reply(data: Value) -> Self {
        Self { data, event: None }
    }

    fn broadcast(kind: &str, data: Value) -> Self {
        Self {
            event: Some(Event::new(kind, data.clone())),
            data,
        }
    }
}

pub struct EventHub {
    db: Database,
    registry: Arc<ConnectionRegistry>,
    blob_base_url: String,
    max_attachments: usize,
}

impl EventHub {
    pub fn new(db: Database, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            db,
            registry,
            blob_base_url: DEFAULT_BLOB_BASE_URL.into(),
            max_attachments: DEFAULT_MAX_ATTACHMENTS,
        }
    }

    pub fn with_blob_base_url(mut self, url: impl Into<String>) -> Self {
        self.blob_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_max_attachments(mut self, max: usize) -> Self {
        self.max_attachments = max;
        self
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Handle one frame and queue the response on the sender's connection.
    ///
    /// Broadcasts may be dropped for a saturated peer, but the response
    /// waits for queue room so every request is answered.
    pub async fn process(&self, conn: &Connection, raw: &str) {
        let response = self.handle_frame(conn, raw).await;
        match serde_json::to_string(&response) {
            Ok(json) => {
                if !conn.respond(json).await {
                    debug!(conn_id = %conn.id, "response dropped, connection closed");
                }
            }
            Err(e) => warn!(conn_id = %conn.id, error = %e, "failed to encode response"),
        }
    }

    /// Parse, dispatch, broadcast. Never fails: every problem becomes an
    /// error response for the requester.
    #[instrument(
        skip_all,
        fields(conn_id = %conn.id, user_id = %conn.user_id, request_type = tracing::field::Empty)
    )]
    pub async fn handle_frame(&self, conn: &Connection, raw: &str) -> Response {
        let request = match Request::parse(raw) {
            Ok(request) => request,
            Err(e) => {
                debug!(reason = %e, "malformed frame");
                return Response::error(e.request_id, e.reason);
            }
        };
        Span::current().record("request_type", request.kind.as_str());

        match self.dispatch(conn.user_id, &request).await {
            Ok(outcome) => {
                if let Some(event) = outcome.event {
                    self.publish(conn, &event);
                }
                Response::ok(request.id, outcome.data)
            }
            Err(e) => {
                if matches!(e, HubError::Internal(_)) {
                    warn!(error = %e, "request failed");
                } else {
                    debug!(error = %e, "request rejected");
                }
                Response::error(Some(request.id), e.to_string())
            }
        }
    }

    async fn dispatch(&self, user: UserId, request: &Request) -> Result<Outcome, HubError> {
        let data = &request.data;
        match request.kind.as_str() {
            "message.new" => self.message_new(data),
            "conversation.join" => self.conversation_join(user, data),
            "conversation.leave" => self.conversation_leave(user, data),
            "device.get" => self.device_get(data),
            "conversation_permission.get" => self.conversation_permission_get(user, data),
            "user.get" => self.user_get(data),
            "attachments.new" => self.attachments_new(data),
            other => Err(HubError::UnknownType(other.to_string())),
        }
    }

    fn publish(&self, sender: &Connection, event: &Event) {
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, event = %event.kind, "failed to encode event");
                return;
            }
        };
        let delivered = self.registry.broadcast_except(&sender.id, &text);
        debug!(event = %event.kind, delivered, "event published");
    }

    fn message_new(&self, data: &Value) -> Result<Outcome, HubError> {
        let draft: MessageDraft = serde_json::from_value(data.clone())
            .map_err(|e| HubError::MalformedRequest(format!("Invalid message: {e}")))?;
        let key_id = draft
            .conversation_key_id()
            .ok_or_else(|| HubError::missing_field("context.conversationKeyId"))?
            .to_string();

        let conversation_id = self.db.conversation_for_key(&key_id).map_err(|e| match e {
            StoreError::NotFound(_) => {
                HubError::NotFound(format!("Conversation key {key_id} not found"))
            }
            other => other.into(),
        })?;

        let message = self.db.messages().append(&conversation_id, draft)?;
        info!(
            conversation_id = %conversation_id,
            message_id = message.id,
            "message appended"
        );
        Ok(Outcome::broadcast(MESSAGE_ADDED, to_data(&message)?))
    }

    fn conversation_join(&self, user: UserId, data: &Value) -> Result<Outcome, HubError> {
        let id = require_value(data, "id")?;
        let (conversation, changed) = self
            .db
            .conversations()
            .modify(id, |conv| add_participant(conv, user))
            .map_err(|e| conversation_not_found(e, id))?;

        if !changed {
            debug!(conversation_id = %display_id(id), "already a participant");
            return Ok(Outcome::reply(Value::Object(conversation)));
        }
        info!(conversation_id = %display_id(id), "participant joined");
        Ok(Outcome::broadcast(CONVERSATION_UPDATED, Value::Object(conversation)))
    }

    fn conversation_leave(&self, user: UserId, data: &Value) -> Result<Outcome, HubError> {
        let id = require_value(data, "id")?;
        let (conversation, changed) = self
            .db
            .conversations()
            .modify(id, |conv| remove_participant(conv, user))
            .map_err(|e| conversation_not_found(e, id))?;

        if !changed {
            return Err(HubError::Conflict(format!(
                "User {user} is not a participant of conversation {}",
                display_id(id)
            )));
        }
        info!(conversation_id = %display_id(id), "participant left");
        Ok(Outcome::broadcast(CONVERSATION_UPDATED, Value::Object(conversation)))
    }

    fn device_get(&self, data: &Value) -> Result<Outcome, HubError> {
        let id = require_value(data, "id")?;
        let device = self.db.devices().get(id).map_err(|e| match e {
            StoreError::NotFound(_) => {
                HubError::NotFound(format!("Device with ID {} not found", display_id(id)))
            }
            other => other.into(),
        })?;
        Ok(Outcome::reply(Value::Object(device)))
    }

    fn conversation_permission_get(&self, user: UserId, data: &Value) -> Result<Outcome, HubError> {
        let key_id = require_str(data, "conversationKeyId")?;
        let permission = self.db.permissions().find(|p| owned_key(p, user, key_id))?;
        match permission {
            Some(permission) => Ok(Outcome::reply(Value::Object(permission))),
            None => Err(HubError::NotFound(format!(
                "Permission with key ID {key_id} and owner {user} not found"
            ))),
        }
    }

    fn user_get(&self, data: &Value) -> Result<Outcome, HubError> {
        let id = require_value(data, "id")?;
        let user = self.db.users().get(id).map_err(|e| match e {
            StoreError::NotFound(_) => {
                HubError::NotFound(format!("User with ID {} not found", display_id(id)))
            }
            other => other.into(),
        })?;
        Ok(Outcome::reply(Value::Object(user)))
    }

    fn attachments_new(&self, data: &Value) -> Result<Outcome, HubError> {
        let count = require_u64(data, "count")?;
        if count > self.max_attachments as u64 {
            return Err(HubError::MalformedRequest(format!(
                "Too many attachments requested: {count} (max {})",
                self.max_attachments
            )));
        }

        let attachments: Vec<Value> = (0..count)
            .map(|_| {
                let id = attachment_id();
                json!({"id": id, "uploadUrl": format!("{}/{id}", self.blob_base_url)})
            })
            .collect();
        Ok(Outcome::reply(Value::Array(attachments)))
    }
}

fn owned_key(permission: &Record, user: UserId, key_id: &str) -> bool {
    permission.get("ownerId").and_then(Value::as_i64) == Some(user.get())
        && permission.get("conversationKeyId").and_then(Value::as_str) == Some(key_id)
}

fn conversation_not_found(e: StoreError, id: &Value) -> HubError {
    match e {
        StoreError::NotFound(_) => {
            HubError::NotFound(format!("Conversation with ID {} not found", display_id(id)))
        }
        other => other.into(),
    }
}

/// Render an id without JSON string quotes.
fn display_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn attachment_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ATTACHMENT_ID_LEN)
        .map(char::from)
        .collect()
}
