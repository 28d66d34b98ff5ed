//! # Relay Wire Messages
//!
//! JSON messages exchanged with relay clients, and the mapping from upstream
//! frames to what the client receives.
//!
//! ## Message Format:
//! - **Client → Relay**: binary PCM16 frames, or JSON tagged by `type`
//! - **Relay → Client**: JSON tagged by `type`; upstream audio arrives as
//!   base64 inside `audio_chunk`
//! - **Relay → Upstream**: binary PCM16 frames and text control messages

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;

/// A frame queued for the upstream writer.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamFrame {
    /// PCM16 audio, written as a binary frame
    Audio(Vec<u8>),
    /// JSON control message, written as a text frame
    Control(String),
}

impl UpstreamFrame {
    /// Bytes carried by the frame, as counted in the relay metrics.
    pub fn payload_len(&self) -> usize {
        match self {
            UpstreamFrame::Audio(bytes) => bytes.len(),
            UpstreamFrame::Control(text) => text.len(),
        }
    }
}

impl From<UpstreamFrame> for Message {
    fn from(frame: UpstreamFrame) -> Self {
        match frame {
            UpstreamFrame::Audio(bytes) => Message::Binary(bytes),
            UpstreamFrame::Control(text) => Message::Text(text),
        }
    }
}

/// Messages a relay client may send as text frames.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientInbound {
    /// Base64 PCM16 audio to forward upstream
    #[serde(alias = "audio_to_upstream", alias = "audio_to_vapi")]
    AudioData { data: String },

    /// Arbitrary JSON control message forwarded upstream as a text frame
    Control { payload: Value },

    /// Base64 little-endian f32 samples at `sample_rate`, resampled before forwarding
    CaptureBlock { sample_rate: u32, data: String },

    /// Plain text, acknowledged locally
    TextMessage {
        #[serde(default)]
        text: String,
    },

    /// Application-level heartbeat
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },

    Pong {
        #[serde(default)]
        timestamp: Option<Value>,
    },
}

const KNOWN_TYPES: &[&str] = &[
    "audio_data",
    "audio_to_upstream",
    "audio_to_vapi",
    "control",
    "capture_block",
    "text_message",
    "ping",
    "pong",
];

/// Outcome of parsing a client text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedClientText {
    Message(ClientInbound),
    /// Valid JSON with a type the relay does not handle; echoed back
    Unknown(Value),
    /// A known type whose fields are missing or mistyped
    Malformed(String),
    /// Not JSON at all
    InvalidJson(String),
}

/// Classify a client text frame.
pub fn parse_client_text(text: &str) -> ParsedClientText {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return ParsedClientText::InvalidJson(e.to_string()),
    };

    let known = value
        .get("type")
        .and_then(|t| t.as_str())
        .map(|t| KNOWN_TYPES.contains(&t))
        .unwrap_or(false);

    if !known {
        return ParsedClientText::Unknown(value);
    }

    match serde_json::from_value::<ClientInbound>(value) {
        Ok(msg) => ParsedClientText::Message(msg),
        Err(e) => ParsedClientText::Malformed(e.to_string()),
    }
}

/// Messages the relay sends to its client.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Client socket accepted and bound to its session
    Connected { session_id: String },

    /// Upstream handshake finished; audio can flow
    UpstreamConnected { session_id: String },

    /// Upstream audio, base64 encoded
    AudioChunk { data: String, format: String },

    /// Any other JSON the upstream sent
    UpstreamMessage { data: Value },

    /// Upstream text that was not JSON
    UpstreamRaw { data: String },

    /// The upstream leg ended; the client socket closes next
    UpstreamClosed { reason: String },

    TextResponse { message: String },

    Echo { original: Value },

    Pong {
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Value>,
    },

    Error { code: String, message: String },
}

impl ClientEvent {
    pub fn audio_chunk(bytes: &[u8]) -> Self {
        ClientEvent::AudioChunk {
            data: STANDARD.encode(bytes),
            format: "pcm_s16le".to_string(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ClientEvent::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        // Serialising these variants cannot fail: every field is a String or a Value.
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","code":"internal_error","message":"serialization failed"}"#.to_string()
        })
    }
}

/// Map a text frame from the upstream to the client event it becomes.
///
/// The legacy `{"type":"audio","format":"raw","data":"<base64>"}` envelope is
/// unwrapped into `audio_chunk` so clients have a single audio path.
pub fn map_upstream_text(text: &str) -> ClientEvent {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => {
            let is_raw_audio = value.get("type").and_then(|t| t.as_str()) == Some("audio")
                && value.get("format").and_then(|f| f.as_str()) == Some("raw");

            match value.get("data").and_then(|d| d.as_str()) {
                Some(data) if is_raw_audio => ClientEvent::AudioChunk {
                    data: data.to_string(),
                    format: "pcm_s16le".to_string(),
                },
                _ => ClientEvent::UpstreamMessage { data: value },
            }
        }
        Err(_) => ClientEvent::UpstreamRaw { data: text.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binary_upstream_audio_becomes_base64_chunk() {
        let event = ClientEvent::audio_chunk(&[0x01, 0x00, 0xFF, 0x7F]);
        let json: Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(json["type"], "audio_chunk");
        assert_eq!(json["format"], "pcm_s16le");
        assert_eq!(STANDARD.decode(json["data"].as_str().unwrap()).unwrap(), vec![0x01, 0x00, 0xFF, 0x7F]);
    }

    #[test]
    fn test_upstream_text_mapping() {
        assert_eq!(
            map_upstream_text(r#"{"type":"audio","format":"raw","data":"AAA="}"#),
            ClientEvent::AudioChunk {
                data: "AAA=".to_string(),
                format: "pcm_s16le".to_string()
            }
        );
        assert_eq!(
            map_upstream_text(r#"{"type":"transcript","text":"hi"}"#),
            ClientEvent::UpstreamMessage {
                data: json!({"type": "transcript", "text": "hi"})
            }
        );
        assert_eq!(
            map_upstream_text("plain words"),
            ClientEvent::UpstreamRaw {
                data: "plain words".to_string()
            }
        );
    }

    #[test]
    fn test_parse_client_audio_aliases() {
        for ty in ["audio_data", "audio_to_upstream", "audio_to_vapi"] {
            let text = format!(r#"{{"type":"{}","data":"AAA="}}"#, ty);
            assert_eq!(
                parse_client_text(&text),
                ParsedClientText::Message(ClientInbound::AudioData { data: "AAA=".to_string() })
            );
        }
    }

    #[test]
    fn test_parse_client_classification() {
        assert!(matches!(parse_client_text("{not json"), ParsedClientText::InvalidJson(_)));
        assert_eq!(
            parse_client_text(r#"{"type":"dance"}"#),
            ParsedClientText::Unknown(json!({"type": "dance"}))
        );
        assert!(matches!(
            parse_client_text(r#"{"type":"capture_block","data":"AAA="}"#),
            ParsedClientText::Malformed(_)
        ));
        assert_eq!(
            parse_client_text(r#"{"type":"ping","timestamp":42}"#),
            ParsedClientText::Message(ClientInbound::Ping { timestamp: Some(json!(42)) })
        );
    }

    #[test]
    fn test_upstream_frame_into_message() {
        assert_eq!(Message::from(UpstreamFrame::Audio(vec![1, 2])), Message::Binary(vec![1, 2]));
        assert_eq!(
            Message::from(UpstreamFrame::Control("{}".to_string())),
            Message::Text("{}".to_string())
        );
    }
}
