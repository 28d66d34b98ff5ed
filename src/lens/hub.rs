//! # Snap Lens Hub
//!
//! Process-wide hub for AR lens clients connected at `/snap-lens`.
//!
//! ## What it does:
//! - Keeps the set of connected lens clients and broadcasts between them
//! - Validates object interactions against the training scenario
//! - Reports interactions to the longest-running voice session so the
//!   assistant can react to what the trainee is doing
//!
//! Message handling is split from delivery: `handle_text` returns the list of
//! deliveries and performs no socket I/O, which keeps it testable without actors.

use crate::lens::events::{ArContext, ArEvent};
use crate::lens::training::{TrainingProgress, Validation};
use crate::relay::messages::UpstreamFrame;
use crate::session::registry::SessionRegistry;

use actix::prelude::*;
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message to a lens client actor.
#[derive(Message, Debug, Clone, PartialEq)]
#[rtype(result = "()")]
pub enum LensOutbound {
    Text(String),
    Close,
}

/// Who receives a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Sender,
    /// Every connected client except the sender
    Others,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub target: Target,
    pub message: Value,
}

impl Delivery {
    fn to_sender(message: Value) -> Self {
        Self {
            target: Target::Sender,
            message,
        }
    }

    fn to_others(message: Value) -> Self {
        Self {
            target: Target::Others,
            message,
        }
    }
}

fn unknown_object() -> String {
    "Unknown object".to_string()
}

fn unknown_event() -> String {
    "unknown".to_string()
}

fn success() -> String {
    "success".to_string()
}

fn empty_object() -> Value {
    json!({})
}

fn yes() -> bool {
    true
}

/// Messages lens clients send.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LensInbound {
    Command {
        #[serde(default)]
        command: Option<String>,
        #[serde(default)]
        client_type: Option<String>,
    },
    Auth {
        #[serde(default)]
        client_type: Option<String>,
    },
    ObjectPinched {
        #[serde(default = "unknown_object")]
        object_name: String,
        #[serde(default = "empty_object")]
        position: Value,
        #[serde(default = "yes")]
        should_speak: bool,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        client_type: Option<String>,
    },
    ArEvent {
        #[serde(default = "unknown_event")]
        event_type: String,
        #[serde(default = "unknown_object")]
        object_name: String,
        #[serde(default = "success")]
        result: String,
        #[serde(default)]
        should_speak: bool,
        #[serde(default = "empty_object")]
        data: Value,
        #[serde(default)]
        timestamp: Option<Value>,
        #[serde(default)]
        client_type: Option<String>,
    },
}

const LENS_TYPES: &[&str] = &["command", "auth", "object_pinched", "ar_event"];

/// Shared state of the lens hub.
pub struct LensHub {
    clients: RwLock<HashMap<Uuid, Recipient<LensOutbound>>>,
    training: Mutex<TrainingProgress>,
    registry: SessionRegistry,
}

impl std::fmt::Debug for LensHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LensHub")
            .field("clients", &self.client_count())
            .field("current_step", &self.training.lock().current_step)
            .finish()
    }
}

impl LensHub {
    pub fn new(registry: SessionRegistry) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            training: Mutex::new(TrainingProgress::default()),
            registry,
        }
    }

    pub fn connect(&self, id: Uuid, recipient: Recipient<LensOutbound>) {
        let mut clients = self.clients.write();
        clients.insert(id, recipient);
        info!(client_id = %id, clients = clients.len(), "Snap Lens client connected");
    }

    pub fn disconnect(&self, id: Uuid) {
        let mut clients = self.clients.write();
        if clients.remove(&id).is_some() {
            info!(client_id = %id, clients = clients.len(), "Snap Lens client disconnected");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn current_step(&self) -> u32 {
        self.training.lock().current_step
    }

    /// Close every lens client. Returns how many were connected.
    pub fn clear(&self) -> usize {
        let drained: Vec<_> = self.clients.write().drain().collect();
        for (_, recipient) in &drained {
            recipient.do_send(LensOutbound::Close);
        }
        info!(cleared = drained.len(), "Cleared Snap Lens connections");
        drained.len()
    }

    /// Send `message` to every client except `from`.
    pub fn broadcast(&self, from: Uuid, message: &Value) {
        let text = message.to_string();
        let clients = self.clients.read();
        for (id, recipient) in clients.iter().filter(|(id, _)| **id != from) {
            if !recipient.connected() {
                debug!(client_id = %id, "Skipping disconnected lens client");
                continue;
            }
            recipient.do_send(LensOutbound::Text(text.clone()));
        }
    }

    /// Deliver the output of `handle_text`. Sender-targeted messages are
    /// returned for the caller to write on its own socket.
    pub fn dispatch(&self, from: Uuid, deliveries: Vec<Delivery>) -> Vec<Value> {
        let mut own = Vec::new();
        for delivery in deliveries {
            match delivery.target {
                Target::Sender => own.push(delivery.message),
                Target::Others => self.broadcast(from, &delivery.message),
            }
        }
        own
    }

    /// Decide what a lens text frame produces.
    pub fn handle_text(&self, text: &str) -> Vec<Delivery> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(_) => {
                return vec![Delivery::to_sender(json!({
                    "type": "error",
                    "message": "Invalid JSON format"
                }))]
            }
        };

        let msg_type = value.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string();
        if !LENS_TYPES.contains(&msg_type.as_str()) {
            return vec![Delivery::to_sender(json!({
                "type": "error",
                "message": format!("Unknown message type: {}", msg_type)
            }))];
        }

        match serde_json::from_value::<LensInbound>(value) {
            Ok(inbound) => self.handle(inbound),
            Err(e) => vec![Delivery::to_sender(json!({
                "type": "error",
                "message": format!("Invalid {} message: {}", msg_type, e)
            }))],
        }
    }

    pub fn handle(&self, inbound: LensInbound) -> Vec<Delivery> {
        match inbound {
            LensInbound::Command { command, client_type } => self.handle_command(command, client_type),
            LensInbound::Auth { .. } => {
                info!("Authentication attempt from Snap Lens client");
                vec![Delivery::to_sender(json!({
                    "type": "auth",
                    "status": "success",
                    "message": "Authentication successful"
                }))]
            }
            LensInbound::ObjectPinched {
                object_name,
                position,
                should_speak,
                timestamp,
                client_type,
            } => self.handle_object_pinched(object_name, position, should_speak, timestamp, client_type),
            LensInbound::ArEvent {
                event_type,
                object_name,
                result,
                should_speak,
                data,
                timestamp,
                client_type,
            } => {
                info!(event_type = %event_type, object = %object_name, result = %result, "AR event");
                let notified = self.notify_upstream(&ArEvent::new(&event_type, &object_name, &result), should_speak);

                vec![
                    Delivery::to_others(json!({
                        "type": "ar_event",
                        "event_type": event_type,
                        "object_name": object_name,
                        "result": result,
                        "data": data,
                        "timestamp": timestamp,
                        "client_type": client_type.unwrap_or_else(|| "snap_lens".to_string()),
                        "upstream_notified": notified
                    })),
                    Delivery::to_sender(json!({
                        "type": "ar_event",
                        "status": "received",
                        "event_type": event_type,
                        "object_name": object_name,
                        "result": result,
                        "message": format!("AR event received: {} on {}", event_type, object_name),
                        "upstream_notified": notified
                    })),
                ]
            }
        }
    }

    fn handle_command(&self, command: Option<String>, client_type: Option<String>) -> Vec<Delivery> {
        let Some(command) = command.filter(|c| !c.is_empty()) else {
            return vec![Delivery::to_sender(json!({
                "type": "error",
                "message": "No command specified"
            }))];
        };
        let client_type = client_type.unwrap_or_else(|| "unknown".to_string());
        info!(command = %command, client_type = %client_type, "Lens command received");

        vec![
            Delivery::to_others(json!({
                "type": "command",
                "command": command,
                "client_type": client_type
            })),
            Delivery::to_sender(json!({
                "type": "command",
                "status": "received",
                "command": command
            })),
        ]
    }

    fn handle_object_pinched(
        &self,
        object_name: String,
        position: Value,
        should_speak: bool,
        timestamp: Option<Value>,
        client_type: Option<String>,
    ) -> Vec<Delivery> {
        let mut training = self.training.lock();
        let validation = training.validate(&object_name);
        let is_correct = validation.is_correct();
        let mut deliveries = Vec::with_capacity(2);

        let notified = match validation {
            Validation::Correct {
                step,
                expected_action,
                ..
            } => {
                info!(object = %object_name, step = step, "Correct interaction");
                let event = ArEvent::new("correct_interaction", &object_name, "success").with_context(ArContext {
                    step: Some(step),
                    expected_action: Some(expected_action),
                    ..Default::default()
                });
                let notified = self.notify_upstream(&event, should_speak);

                if training.advance() {
                    deliveries.push(Delivery::to_sender(json!({
                        "type": "training_complete",
                        "status": "completed",
                        "message": "Fire emergency training completed successfully!",
                        "object_name": object_name
                    })));
                } else {
                    let next = training.current_step_info();
                    deliveries.push(Delivery::to_sender(json!({
                        "type": "step_advanced",
                        "status": "correct",
                        "object_name": object_name,
                        "current_step": training.current_step,
                        "next_instruction": next.map(|s| s.description.clone()).unwrap_or_else(|| "Continue training".to_string()),
                        "expected_objects": next.map(|s| s.expected_objects.clone()).unwrap_or_default()
                    })));
                }
                notified
            }
            Validation::Incorrect {
                reason,
                expected_objects,
                current_description,
            } => {
                warn!(object = %object_name, reason = %reason, "Incorrect interaction");
                let errors = training.record_error();
                let event = ArEvent::new("incorrect_interaction", &object_name, "error").with_context(ArContext {
                    step: Some(training.current_step),
                    expected_objects: Some(expected_objects.clone()),
                    consecutive_errors: Some(errors),
                    current_description: Some(current_description.clone()),
                    ..Default::default()
                });
                let notified = self.notify_upstream(&event, should_speak);

                deliveries.push(Delivery::to_sender(json!({
                    "type": "interaction_error",
                    "status": "incorrect",
                    "object_name": object_name,
                    "message": format!("Wrong object! Expected: {}", expected_objects.join(", ")),
                    "current_step": training.current_step,
                    "current_instruction": current_description,
                    "expected_objects": expected_objects,
                    "received_object": object_name,
                    "consecutive_errors": errors
                })));
                notified
            }
        };

        deliveries.push(Delivery::to_others(json!({
            "type": "object_pinched",
            "object_name": object_name,
            "position": position,
            "timestamp": timestamp,
            "client_type": client_type.unwrap_or_else(|| "snap_lens".to_string()),
            "validation_status": (if is_correct { "correct" } else { "incorrect" }),
            "current_step": training.current_step,
            "upstream_notified": notified
        })));
        deliveries
    }

    /// Send an AR event to the longest-attached voice session.
    ///
    /// Returns true only if at least the context message reached a live pair.
    pub fn notify_upstream(&self, event: &ArEvent, should_speak: bool) -> bool {
        let Some((session_id, pair)) = self.registry.oldest_active_pair() else {
            debug!(event_type = %event.event_type, "No active voice session for AR event");
            return false;
        };

        let at = chrono::Local::now().format("%H:%M").to_string();
        if let Err(err) = pair.to_upstream.try_send(UpstreamFrame::Control(event.add_message(&at))) {
            warn!(session_id = %session_id, error = %err, "AR event could not be delivered to the voice session");
            return false;
        }
        info!(session_id = %session_id, event_type = %event.event_type, object = %event.object_name, "Sent AR event upstream");

        if should_speak {
            if let Some(say) = event.say_message() {
                if let Err(err) = pair.to_upstream.try_send(UpstreamFrame::Control(say)) {
                    warn!(session_id = %session_id, error = %err, "Spoken AR response could not be delivered to the voice session");
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::registry::{PairHandle, Session, UPSTREAM_QUEUE_CAPACITY};
    use tokio::sync::mpsc;

    fn hub_with_session() -> (LensHub, mpsc::Receiver<UpstreamFrame>) {
        hub_with_queue(UPSTREAM_QUEUE_CAPACITY)
    }

    fn hub_with_queue(capacity: usize) -> (LensHub, mpsc::Receiver<UpstreamFrame>) {
        let registry = SessionRegistry::new(4);
        registry
            .reserve()
            .and_then(|slot| slot.register(Session::new("call-1".to_string(), "wss://voice.test".to_string(), None)))
            .unwrap();
        let (tx, rx) = mpsc::channel(capacity);
        registry.attach("call-1", PairHandle::new(tx)).unwrap();
        (LensHub::new(registry), rx)
    }

    fn sender_messages(deliveries: &[Delivery]) -> Vec<&Value> {
        deliveries
            .iter()
            .filter(|d| d.target == Target::Sender)
            .map(|d| &d.message)
            .collect()
    }

    fn control_texts(rx: &mut mpsc::Receiver<UpstreamFrame>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            match frame {
                UpstreamFrame::Control(text) => out.push(serde_json::from_str(&text).unwrap()),
                other => panic!("unexpected frame {:?}", other),
            }
        }
        out
    }

    #[test]
    fn test_invalid_and_unknown_messages() {
        let hub = LensHub::new(SessionRegistry::new(1));

        let out = hub.handle_text("not json");
        assert_eq!(out[0].message["message"], "Invalid JSON format");

        let out = hub.handle_text(r#"{"type":"teleport"}"#);
        assert_eq!(out[0].target, Target::Sender);
        assert_eq!(out[0].message["message"], "Unknown message type: teleport");
    }

    #[test]
    fn test_command_broadcasts_and_acknowledges() {
        let hub = LensHub::new(SessionRegistry::new(1));
        let out = hub.handle_text(r#"{"type":"command","command":"next","client_type":"web"}"#);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, Target::Others);
        assert_eq!(out[0].message, json!({"type": "command", "command": "next", "client_type": "web"}));
        assert_eq!(out[1].message["status"], "received");

        let out = hub.handle_text(r#"{"type":"command"}"#);
        assert_eq!(out[0].message["message"], "No command specified");
    }

    #[test]
    fn test_auth_is_acknowledged() {
        let hub = LensHub::new(SessionRegistry::new(1));
        let out = hub.handle_text(r#"{"type":"auth","token":"whatever"}"#);
        assert_eq!(out[0].message["status"], "success");
    }

    #[test]
    fn test_correct_pinch_advances_and_notifies_upstream() {
        let (hub, mut rx) = hub_with_session();
        let out = hub.handle_text(r#"{"type":"object_pinched","object_name":"Fire Extinguisher"}"#);

        let own = sender_messages(&out);
        assert_eq!(own[0]["type"], "step_advanced");
        assert_eq!(own[0]["current_step"], 2);
        assert_eq!(own[0]["next_instruction"], "Pull the pin from the fire extinguisher");

        let broadcast = out.iter().find(|d| d.target == Target::Others).unwrap();
        assert_eq!(broadcast.message["validation_status"], "correct");
        assert_eq!(broadcast.message["upstream_notified"], true);
        assert_eq!(broadcast.message["client_type"], "snap_lens");

        let sent = control_texts(&mut rx);
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["type"], "add-message");
        let content = sent[0]["message"]["content"].as_str().unwrap();
        assert!(content.starts_with("AR_EVENT: correct_interaction object='Fire Extinguisher' result=success at "));
        assert!(content.ends_with("step=1 expected_action='grab'"));
        assert_eq!(sent[1]["type"], "say");
    }

    #[test]
    fn test_full_voice_queue_drops_spoken_line_only() {
        let (hub, mut rx) = hub_with_queue(1);
        let out = hub.handle_text(r#"{"type":"object_pinched","object_name":"Fire Extinguisher"}"#);

        // The context message made it; the spoken line found the queue full
        let broadcast = out.iter().find(|d| d.target == Target::Others).unwrap();
        assert_eq!(broadcast.message["upstream_notified"], true);
        let sent = control_texts(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["type"], "add-message");

        // With the queue still full nothing is delivered
        let (hub, _rx) = hub_with_queue(1);
        let pair = hub.registry.oldest_active_pair().unwrap().1;
        pair.to_upstream.try_send(UpstreamFrame::Control("{}".to_string())).unwrap();
        assert!(!hub.notify_upstream(&ArEvent::new("ar_event", "flame", "success"), true));
    }

    #[test]
    fn test_wrong_pinch_records_errors() {
        let (hub, mut rx) = hub_with_session();
        hub.handle_text(r#"{"type":"object_pinched","object_name":"fire alarm","should_speak":false}"#);
        let out = hub.handle_text(r#"{"type":"object_pinched","object_name":"fire alarm","should_speak":false}"#);

        let own = sender_messages(&out);
        assert_eq!(own[0]["type"], "interaction_error");
        assert_eq!(own[0]["consecutive_errors"], 2);
        assert_eq!(own[0]["message"], "Wrong object! Expected: fire extinguisher");
        assert_eq!(hub.current_step(), 1);

        // should_speak=false: only the silent context messages went upstream
        let sent = control_texts(&mut rx);
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|m| m["type"] == "add-message"));
        assert!(sent[1]["message"]["content"].as_str().unwrap().contains("consecutive_errors=2"));
    }

    #[test]
    fn test_completing_the_scenario() {
        let hub = LensHub::new(SessionRegistry::new(1));
        for object in ["fire extinguisher", "fire extinguisher", "fire extinguisher", "flame"] {
            hub.handle_text(&json!({"type": "object_pinched", "object_name": object}).to_string());
        }
        let out = hub.handle_text(r#"{"type":"object_pinched","object_name":"Fire Alarm"}"#);
        assert_eq!(sender_messages(&out)[0]["type"], "training_complete");

        // No voice session was attached
        let broadcast = out.iter().find(|d| d.target == Target::Others).unwrap();
        assert_eq!(broadcast.message["upstream_notified"], false);
        assert_eq!(broadcast.message["current_step"], 6);
    }

    #[test]
    fn test_ar_event_defaults_to_silent() {
        let (hub, mut rx) = hub_with_session();
        let out = hub.handle_text(r#"{"type":"ar_event","event_type":"pull_pin","object_name":"pin"}"#);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message["result"], "success");
        assert_eq!(out[1].message["message"], "AR event received: pull_pin on pin");
        assert_eq!(out[1].message["upstream_notified"], true);

        let sent = control_texts(&mut rx);
        assert_eq!(sent.len(), 1);
        assert!(sent[0]["message"]["content"]
            .as_str()
            .unwrap()
            .starts_with("AR_EVENT: pull_pin object='pin' result=success at "));
    }
}
