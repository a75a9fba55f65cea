//! Stratum Messages and Schema Validation
//!
//! Every wire message is an envelope `{ id, method, body }` or the
//! error form `{ id, error: { id, message } }`. Incoming bodies are
//! validated against typed schemas before dispatch; an invalid body
//! yields a `Malformed` error carrying the method name. Unknown
//! top-level keys on request bodies are ignored.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StratumError;

/// Stratum method names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StratumMethod {
    /// mining.subscribe
    Subscribe,
    /// mining.submit
    Submit,
    /// mining.get_status
    GetStatus,
    /// mining.subscribed
    Subscribed,
    /// mining.set_target
    SetTarget,
    /// mining.notify
    Notify,
    /// mining.wait_for_work
    WaitForWork,
    /// mining.status
    Status,
    /// mining.disconnect
    Disconnect,
    /// Unknown method
    Unknown(String),
}

impl From<&str> for StratumMethod {
    fn from(s: &str) -> Self {
        match s {
            "mining.subscribe" => StratumMethod::Subscribe,
            "mining.submit" => StratumMethod::Submit,
            "mining.get_status" => StratumMethod::GetStatus,
            "mining.subscribed" => StratumMethod::Subscribed,
            "mining.set_target" => StratumMethod::SetTarget,
            "mining.notify" => StratumMethod::Notify,
            "mining.wait_for_work" => StratumMethod::WaitForWork,
            "mining.status" => StratumMethod::Status,
            "mining.disconnect" => StratumMethod::Disconnect,
            _ => StratumMethod::Unknown(s.to_string()),
        }
    }
}

impl std::fmt::Display for StratumMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StratumMethod::Subscribe => "mining.subscribe",
            StratumMethod::Submit => "mining.submit",
            StratumMethod::GetStatus => "mining.get_status",
            StratumMethod::Subscribed => "mining.subscribed",
            StratumMethod::SetTarget => "mining.set_target",
            StratumMethod::Notify => "mining.notify",
            StratumMethod::WaitForWork => "mining.wait_for_work",
            StratumMethod::Status => "mining.status",
            StratumMethod::Disconnect => "mining.disconnect",
            StratumMethod::Unknown(s) => s.as_str(),
        };
        write!(f, "{}", name)
    }
}

/// Incoming request envelope
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    /// Client-assigned request id, echoed in responses
    pub id: u32,
    /// Method name
    pub method: String,
    /// Method body, validated per method
    #[serde(default)]
    pub body: Value,
}

/// `mining.subscribe` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeBody {
    /// Protocol version the client speaks
    pub version: u32,

    /// Payout address shares are credited to
    pub public_address: String,

    /// Optional worker name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Optional mining agent string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
}

/// `mining.subscribed` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribedBody {
    /// Server-assigned client id
    pub client_id: u64,

    /// Per-client extranonce, hex, 0-8 bytes
    pub xn: String,
}

/// `mining.set_target` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetTargetBody {
    /// Share target, 32 bytes hex
    pub target: String,
}

/// `mining.notify` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotifyBody {
    /// Work unit id
    pub mining_request_id: u32,

    /// Mineable header, 180 bytes hex
    pub header: String,
}

/// `mining.submit` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    /// Work unit the solution is for
    pub mining_request_id: u32,

    /// Solver nonce, 8 bytes hex
    pub randomness: String,
}

/// `mining.submitted` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmittedBody {
    /// Id of the `mining.submit` request being answered
    pub id: u32,

    /// Whether the submission was credited as a share
    pub result: bool,

    /// Short human-readable disposition when not credited
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `mining.disconnect` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisconnectBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_expected: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub banned_until: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// `mining.get_status` body
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetStatusBody {
    /// Restrict the report to one payout address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

/// `mining.status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBody {
    /// Pool name
    pub name: String,

    /// Currently connected sessions
    pub miners: u64,

    /// Pool-wide shares inside the recent-share window
    pub shares: u64,

    /// Address the per-address counters apply to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,

    /// Shares for `public_address` inside the window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_shares: Option<u64>,
}

/// A validated client request
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Subscribe(SubscribeBody),
    Submit(SubmitBody),
    GetStatus(GetStatusBody),
}

impl ClientMessage {
    /// Validate a request body against its method's schema.
    ///
    /// Unknown methods and schema mismatches are both `Malformed`; the
    /// caller treats either as a protocol violation.
    pub fn parse(method: &str, body: Value) -> Result<ClientMessage, StratumError> {
        match StratumMethod::from(method) {
            StratumMethod::Subscribe => Ok(ClientMessage::Subscribe(parse_body(method, body)?)),
            StratumMethod::Submit => Ok(ClientMessage::Submit(parse_body(method, body)?)),
            StratumMethod::GetStatus => {
                if body.is_null() {
                    return Ok(ClientMessage::GetStatus(GetStatusBody::default()));
                }
                Ok(ClientMessage::GetStatus(parse_body(method, body)?))
            }
            _ => Err(StratumError::Malformed {
                method: method.to_string(),
            }),
        }
    }
}

fn parse_body<T: DeserializeOwned>(method: &str, body: Value) -> Result<T, StratumError> {
    serde_json::from_value(body).map_err(|_| StratumError::Malformed {
        method: method.to_string(),
    })
}

/// Serialize an outbound envelope as a single wire line, without the
/// trailing delimiter
pub fn serialize_message<T: Serialize>(
    id: u32,
    method: &StratumMethod,
    body: &T,
) -> Result<String, StratumError> {
    let envelope = serde_json::json!({
        "id": id,
        "method": method.to_string(),
        "body": body,
    });
    Ok(serde_json::to_string(&envelope)?)
}

/// Serialize the error envelope answering request `request_id`
pub fn serialize_error(id: u32, request_id: u32, message: &str) -> String {
    serde_json::json!({
        "id": id,
        "error": {
            "id": request_id,
            "message": message,
        },
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_subscribe_parses() {
        let body = json!({
            "version": 3,
            "publicAddress": "lode123",
            "agent": "miner/1.0",
        });
        let message = ClientMessage::parse("mining.subscribe", body).unwrap();
        match message {
            ClientMessage::Subscribe(subscribe) => {
                assert_eq!(subscribe.version, 3);
                assert_eq!(subscribe.public_address, "lode123");
                assert_eq!(subscribe.agent.as_deref(), Some("miner/1.0"));
                assert_eq!(subscribe.name, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_keys_are_ignored() {
        let body = json!({
            "version": 3,
            "publicAddress": "lode123",
            "somethingNew": true,
        });
        assert!(ClientMessage::parse("mining.subscribe", body).is_ok());
    }

    #[test]
    fn test_missing_field_is_malformed() {
        let body = json!({ "version": 3 });
        assert!(matches!(
            ClientMessage::parse("mining.subscribe", body),
            Err(StratumError::Malformed { method }) if method == "mining.subscribe"
        ));
    }

    #[test]
    fn test_unknown_method_is_malformed() {
        assert!(matches!(
            ClientMessage::parse("mining.reboot", json!({})),
            Err(StratumError::Malformed { .. })
        ));
    }

    #[test]
    fn test_get_status_accepts_null_body() {
        let message = ClientMessage::parse("mining.get_status", Value::Null).unwrap();
        assert!(matches!(message, ClientMessage::GetStatus(body) if body.public_address.is_none()));
    }

    #[test]
    fn test_submit_parses() {
        let body = json!({ "miningRequestId": 7, "randomness": "00000000000000aa" });
        let message = ClientMessage::parse("mining.submit", body).unwrap();
        match message {
            ClientMessage::Submit(submit) => {
                assert_eq!(submit.mining_request_id, 7);
                assert_eq!(submit.randomness, "00000000000000aa");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let line = serialize_message(
            5,
            &StratumMethod::Notify,
            &NotifyBody {
                mining_request_id: 2,
                header: "aa".repeat(180),
            },
        )
        .unwrap();

        let envelope: RequestEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(envelope.id, 5);
        assert_eq!(envelope.method, "mining.notify");
        let body: NotifyBody = serde_json::from_value(envelope.body).unwrap();
        assert_eq!(body.mining_request_id, 2);
    }

    #[test]
    fn test_error_envelope_shape() {
        let line = serialize_error(9, 4, "no such method");
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["error"]["id"], 4);
        assert_eq!(value["error"]["message"], "no such method");
    }
}
