//! Classification of inbound payloads.
//!
//! The transport hands over opaque bytes. [`decode`] sorts them into service
//! offers, audio results (JSON or binary) and malformed input, in that order
//! of precedence.

use crate::error::{Error, Result};
use crate::protocol::constants::{
    AUDIO_URL_FIELD, DEFAULT_MEDIA_EXTENSION, RESULT_ID_FIELD, SERVICE_OFFER_TYPE,
};
use crate::protocol::ServiceOffer;
use bytes::Bytes;
use serde_json::{Map, Value};
use uuid::Uuid;

/// A worker's result before it is stored.
#[derive(Debug, Clone, PartialEq)]
pub enum AudioResult {
    /// JSON mapping, expected to carry the job id under `id`.
    Json(Map<String, Value>),
    /// Raw bytes with the inferred media extension.
    Binary { bytes: Bytes, extension: String },
}

impl AudioResult {
    /// The job id carried inside a JSON result.
    ///
    /// Binary results carry no id of their own; `None` is returned for them.
    pub fn embedded_job_id(&self) -> Option<Result<Uuid>> {
        match self {
            AudioResult::Json(map) => Some(job_id_field(map)),
            AudioResult::Binary { .. } => None,
        }
    }
}

fn job_id_field(map: &Map<String, Value>) -> Result<Uuid> {
    let raw = map
        .get(RESULT_ID_FIELD)
        .ok_or_else(|| Error::Malformed(format!("Result is missing the `{}` field", RESULT_ID_FIELD)))?;
    let raw = raw
        .as_str()
        .ok_or_else(|| Error::Malformed(format!("Result `{}` must be a string", RESULT_ID_FIELD)))?;

    Uuid::parse_str(raw).map_err(|e| Error::Malformed(format!("Invalid job id {:?}: {}", raw, e)))
}

/// A classified inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ServiceOffer(ServiceOffer),
    AudioResult(AudioResult),
    Malformed(String),
}

/// Classify a payload arriving on the offer channel.
pub fn decode(raw: &[u8]) -> Message {
    decode_with_hint(raw, None)
}

/// Classify a payload, using the transport's content-type hint for binary results.
pub fn decode_with_hint(raw: &[u8], content_type: Option<&str>) -> Message {
    if raw.is_empty() {
        return Message::Malformed("Empty payload".to_string());
    }

    let value: Value = match serde_json::from_slice(raw) {
        Ok(value) => value,
        Err(_) => return binary_result(raw, content_type),
    };

    if is_service_offer(&value) {
        return match serde_json::from_value::<ServiceOffer>(value) {
            Ok(offer) => Message::ServiceOffer(offer),
            Err(e) => Message::Malformed(format!("Invalid service offer: {}", e)),
        };
    }

    match value {
        Value::Object(map) if map.contains_key(AUDIO_URL_FIELD) => {
            Message::AudioResult(AudioResult::Json(map))
        }
        _ => Message::Malformed("Unknown request type".to_string()),
    }
}

/// Classify a payload arriving on the result channel.
///
/// Any JSON object is a result here, not only those carrying `audio_url`.
pub fn decode_result(raw: &[u8], content_type: Option<&str>) -> Message {
    if raw.is_empty() {
        return Message::Malformed("Empty payload".to_string());
    }

    match serde_json::from_slice::<Value>(raw) {
        Ok(Value::Object(map)) => Message::AudioResult(AudioResult::Json(map)),
        Ok(_) => Message::Malformed("JSON result must be an object".to_string()),
        Err(_) => binary_result(raw, content_type),
    }
}

fn is_service_offer(value: &Value) -> bool {
    value
        .get("data")
        .and_then(|data| data.get("type"))
        .and_then(Value::as_str)
        == Some(SERVICE_OFFER_TYPE)
}

fn binary_result(raw: &[u8], content_type: Option<&str>) -> Message {
    Message::AudioResult(AudioResult::Binary {
        bytes: Bytes::copy_from_slice(raw),
        extension: infer_extension(raw, content_type).to_string(),
    })
}

/// Pick a file extension for a binary result: the content-type hint first,
/// then magic bytes, then the mp3 default.
pub fn infer_extension(raw: &[u8], content_type: Option<&str>) -> &'static str {
    content_type
        .and_then(extension_from_content_type)
        .or_else(|| sniff_extension(raw))
        .unwrap_or(DEFAULT_MEDIA_EXTENSION)
}

fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type.split(';').next()?.trim().to_ascii_lowercase();
    match mime.as_str() {
        "audio/mpeg" | "audio/mp3" => Some("mp3"),
        "audio/wav" | "audio/x-wav" | "audio/wave" => Some("wav"),
        "audio/ogg" => Some("ogg"),
        "audio/flac" | "audio/x-flac" => Some("flac"),
        "audio/mp4" | "audio/aac" | "audio/x-m4a" => Some("m4a"),
        _ => None,
    }
}

/// Content type to serve a stored audio file with.
pub fn media_type(extension: &str) -> &'static str {
    match extension {
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "ogg" => "audio/ogg",
        "flac" => "audio/flac",
        "m4a" => "audio/mp4",
        _ => "application/octet-stream",
    }
}

fn sniff_extension(raw: &[u8]) -> Option<&'static str> {
    if raw.starts_with(b"ID3") || (raw.len() >= 2 && raw[0] == 0xFF && raw[1] & 0xE0 == 0xE0) {
        return Some("mp3");
    }
    if raw.len() >= 12 && &raw[0..4] == b"RIFF" && &raw[8..12] == b"WAVE" {
        return Some("wav");
    }
    if raw.starts_with(b"OggS") {
        return Some("ogg");
    }
    if raw.starts_with(b"fLaC") {
        return Some("flac");
    }
    if raw.len() >= 8 && &raw[4..8] == b"ftyp" {
        return Some("m4a");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn offer_json() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "data": {
                "type": "service_offer",
                "timestamp": "2024-12-10T18:19:32.123Z",
                "provider": "acme",
                "capabilities": {"receipt_analysis": true, "data_processing": false, "data_storage": true}
            },
            "signature": "sig",
            "pubkey": "key"
        }))
        .unwrap()
    }

    #[test]
    fn test_service_offer_classification() {
        match decode(&offer_json()) {
            Message::ServiceOffer(offer) => assert_eq!(offer.data.provider, "acme"),
            other => panic!("Expected ServiceOffer, got {:?}", other),
        }
    }

    #[test]
    fn test_incomplete_service_offer_is_malformed() {
        let raw = br#"{"data":{"type":"service_offer"},"signature":"s"}"#;
        match decode(raw) {
            Message::Malformed(reason) => assert!(reason.contains("Invalid service offer")),
            other => panic!("Expected Malformed, got {:?}", other),
        }
    }

    #[test]
    fn test_audio_url_classification() {
        match decode(br#"{"audio_url":"x"}"#) {
            Message::AudioResult(AudioResult::Json(map)) => assert_eq!(map["audio_url"], "x"),
            other => panic!("Expected JSON AudioResult, got {:?}", other),
        }
    }

    #[test]
    fn test_binary_classification() {
        let blob = [0x49, 0x44, 0x33, 0x04, 0x00, 0xde, 0xad];
        match decode(&blob) {
            Message::AudioResult(AudioResult::Binary { bytes, extension }) => {
                assert_eq!(bytes.as_ref(), &blob);
                assert_eq!(extension, "mp3");
            }
            other => panic!("Expected binary AudioResult, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_shapes_are_malformed() {
        assert!(matches!(decode(b"{}"), Message::Malformed(_)));
        assert!(matches!(decode(br#"{"data":{"type":"other"}}"#), Message::Malformed(_)));
        assert!(matches!(decode(b"[1,2,3]"), Message::Malformed(_)));
        assert!(matches!(decode(b"42"), Message::Malformed(_)));
        assert!(matches!(decode(b""), Message::Malformed(_)));
    }

    #[test]
    fn test_offer_takes_precedence_over_audio_url() {
        let mut value: Value = serde_json::from_slice(&offer_json()).unwrap();
        value["audio_url"] = json!("http://x/y.mp3");
        let raw = serde_json::to_vec(&value).unwrap();

        assert!(matches!(decode(&raw), Message::ServiceOffer(_)));
    }

    #[test]
    fn test_result_channel_accepts_any_object() {
        match decode_result(br#"{"id":"abc","status":"done"}"#, None) {
            Message::AudioResult(AudioResult::Json(map)) => assert_eq!(map["status"], "done"),
            other => panic!("Expected JSON AudioResult, got {:?}", other),
        }
        assert!(matches!(decode_result(b"\"text\"", None), Message::Malformed(_)));
        assert!(matches!(
            decode_result(b"RIFF\0\0\0\0WAVEfmt ", None),
            Message::AudioResult(AudioResult::Binary { .. })
        ));
    }

    #[test]
    fn test_embedded_job_id() {
        let id = Uuid::new_v4();
        let result = AudioResult::Json(json!({"id": id.to_string()}).as_object().cloned().unwrap());
        assert_eq!(result.embedded_job_id().unwrap().unwrap(), id);

        let missing = AudioResult::Json(Map::new());
        assert!(matches!(missing.embedded_job_id(), Some(Err(Error::Malformed(_)))));

        let bad = AudioResult::Json(json!({"id": "not-a-uuid"}).as_object().cloned().unwrap());
        assert!(matches!(bad.embedded_job_id(), Some(Err(Error::Malformed(_)))));

        let numeric = AudioResult::Json(json!({"id": 7}).as_object().cloned().unwrap());
        assert!(matches!(numeric.embedded_job_id(), Some(Err(Error::Malformed(_)))));

        let binary = AudioResult::Binary {
            bytes: Bytes::from_static(b"\xff\xfb"),
            extension: "mp3".into(),
        };
        assert!(binary.embedded_job_id().is_none());
    }

    #[test]
    fn test_infer_extension() {
        assert_eq!(infer_extension(b"anything", Some("audio/wav; rate=16000")), "wav");
        assert_eq!(infer_extension(b"anything", Some("AUDIO/MPEG")), "mp3");
        assert_eq!(infer_extension(b"OggS\0\x02", None), "ogg");
        assert_eq!(infer_extension(b"fLaC\0\0\0\x22", None), "flac");
        assert_eq!(infer_extension(b"\0\0\0\x20ftypM4A ", None), "m4a");
        assert_eq!(infer_extension(b"\xff\xfb\x90\x64", None), "mp3");
        assert_eq!(infer_extension(b"unknown bytes", Some("application/octet-stream")), "mp3");
    }

    #[test]
    fn test_media_type() {
        assert_eq!(media_type("mp3"), "audio/mpeg");
        assert_eq!(media_type("m4a"), "audio/mp4");
        assert_eq!(media_type("bin"), "application/octet-stream");
    }
}
