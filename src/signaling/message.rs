//! Signaling wire format
//!
//! Outbound frames carry an action, a base64 encoded JSON payload and the
//! recipient viewer id. Inbound frames carry a message type, the payload and
//! the sender viewer id.

use super::{SignalingError, SignalingEvent};
use crate::peer::{IceCandidate, SessionDescription};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use log::{debug, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    SdpAnswer,
    IceCandidate,
}

/// Frame sent to a viewer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub action: Action,
    pub message_payload: String,
    pub recipient_client_id: String,
}

impl OutboundMessage {
    pub fn sdp_answer(answer: &SessionDescription, viewer_id: &str) -> Result<Self, SignalingError> {
        Ok(Self {
            action: Action::SdpAnswer,
            message_payload: encode_payload(answer)?,
            recipient_client_id: viewer_id.to_string(),
        })
    }

    pub fn ice_candidate(candidate: &IceCandidate, viewer_id: &str) -> Result<Self, SignalingError> {
        Ok(Self {
            action: Action::IceCandidate,
            message_payload: encode_payload(candidate)?,
            recipient_client_id: viewer_id.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self)
            .map_err(|e| SignalingError::ProtocolError(format!("Failed to serialize message: {}", e)))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    #[serde(default)]
    pub status_code: Option<String>,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Frame received from the signaling service
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub message_type: String,
    #[serde(default)]
    pub message_payload: Option<String>,
    #[serde(default)]
    pub sender_client_id: Option<String>,
    #[serde(default)]
    pub status_response: Option<StatusResponse>,
}

fn encode_payload<T: Serialize>(value: &T) -> Result<String, SignalingError> {
    let json = serde_json::to_vec(value)
        .map_err(|e| SignalingError::ProtocolError(format!("Failed to serialize payload: {}", e)))?;
    Ok(STANDARD.encode(json))
}

fn decode_payload<T: for<'de> Deserialize<'de>>(payload: Option<&str>) -> Result<T, SignalingError> {
    let payload = payload.ok_or_else(|| SignalingError::ProtocolError("Missing message payload".to_string()))?;
    let bytes = STANDARD
        .decode(payload)
        .map_err(|e| SignalingError::ProtocolError(format!("Invalid base64 payload: {}", e)))?;
    serde_json::from_slice(&bytes).map_err(|e| SignalingError::ProtocolError(format!("Invalid payload JSON: {}", e)))
}

fn sender(msg: &InboundMessage) -> Result<String, SignalingError> {
    msg.sender_client_id
        .clone()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| SignalingError::ProtocolError(format!("{} without sender id", msg.message_type)))
}

/// Decode one inbound text frame. Frames that carry no event yield `Ok(None)`.
pub fn decode(text: &str) -> Result<Option<SignalingEvent>, SignalingError> {
    if text.trim().is_empty() {
        return Ok(None);
    }

    let msg: InboundMessage = serde_json::from_str(text)
        .map_err(|e| SignalingError::ProtocolError(format!("Invalid signaling frame: {}", e)))?;

    match msg.message_type.as_str() {
        "SDP_OFFER" => {
            let offer: SessionDescription = decode_payload(msg.message_payload.as_deref())?;
            Ok(Some(SignalingEvent::SdpOffer { offer, viewer_id: sender(&msg)? }))
        }
        "ICE_CANDIDATE" => {
            let candidate: IceCandidate = decode_payload(msg.message_payload.as_deref())?;
            Ok(Some(SignalingEvent::IceCandidate { candidate, viewer_id: sender(&msg)? }))
        }
        "STATUS_RESPONSE" => {
            let status = msg.status_response.as_ref();
            let code = status.and_then(|s| s.status_code.as_deref()).unwrap_or("200");
            if code == "200" {
                return Ok(None);
            }
            let error_type = status.and_then(|s| s.error_type.as_deref()).unwrap_or("Unknown");
            let description = status.and_then(|s| s.description.as_deref()).unwrap_or("");
            Ok(Some(SignalingEvent::Error(format!("{} {}: {}", code, error_type, description))))
        }
        "GO_AWAY" => Ok(Some(SignalingEvent::Close)),
        "RECONNECT_ICE_SERVER" => {
            debug!("Ignoring RECONNECT_ICE_SERVER");
            Ok(None)
        }
        other => {
            warn!("Skipping unknown signaling message type {}", other);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(message_type: &str, payload: &str, sender: &str) -> String {
        serde_json::json!({
            "messageType": message_type,
            "messagePayload": STANDARD.encode(payload),
            "senderClientId": sender,
        })
        .to_string()
    }

    #[test]
    fn test_decode_sdp_offer() {
        let text = frame("SDP_OFFER", r#"{"type":"offer","sdp":"v=0\r\n"}"#, "viewer-7");
        match decode(&text).unwrap() {
            Some(SignalingEvent::SdpOffer { offer, viewer_id }) => {
                assert_eq!(viewer_id, "viewer-7");
                assert_eq!(offer, SessionDescription::offer("v=0\r\n"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_ice_candidate() {
        let text = frame(
            "ICE_CANDIDATE",
            r#"{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
            "viewer-7",
        );
        match decode(&text).unwrap() {
            Some(SignalingEvent::IceCandidate { candidate, viewer_id }) => {
                assert_eq!(viewer_id, "viewer-7");
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_status_response() {
        let ok = r#"{"messageType":"STATUS_RESPONSE","statusResponse":{"statusCode":"200"}}"#;
        assert!(decode(ok).unwrap().is_none());

        let failed = r#"{"messageType":"STATUS_RESPONSE","statusResponse":{"statusCode":"400","errorType":"InvalidArgumentException","description":"bad recipient"}}"#;
        match decode(failed).unwrap() {
            Some(SignalingEvent::Error(msg)) => assert!(msg.contains("InvalidArgumentException")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(decode(r#"{"messageType":"GO_AWAY"}"#).unwrap(), Some(SignalingEvent::Close));
        assert!(decode(r#"{"messageType":"RECONNECT_ICE_SERVER"}"#).unwrap().is_none());
        assert!(decode(r#"{"messageType":"SOMETHING_NEW"}"#).unwrap().is_none());
        assert!(decode("").unwrap().is_none());
    }

    #[test]
    fn test_decode_rejects_offer_without_sender() {
        let text = serde_json::json!({
            "messageType": "SDP_OFFER",
            "messagePayload": STANDARD.encode(r#"{"type":"offer","sdp":""}"#),
        })
        .to_string();
        assert!(matches!(decode(&text), Err(SignalingError::ProtocolError(_))));
        assert!(decode("not json").is_err());
    }

    #[test]
    fn test_outbound_answer_frame() {
        let msg = OutboundMessage::sdp_answer(&SessionDescription::answer("v=0"), "viewer-7").unwrap();
        let value: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(value["action"], "SDP_ANSWER");
        assert_eq!(value["recipientClientId"], "viewer-7");

        let payload = STANDARD.decode(value["messagePayload"].as_str().unwrap()).unwrap();
        let answer: SessionDescription = serde_json::from_slice(&payload).unwrap();
        assert_eq!(answer.sdp, "v=0");
    }

    #[test]
    fn test_outbound_candidate_action() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 9 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };
        let msg = OutboundMessage::ice_candidate(&candidate, "v1").unwrap();
        assert!(msg.to_json().unwrap().contains(r#""action":"ICE_CANDIDATE""#));
    }
}
