//! JSON-RPC payload model.
//!
//! Every frame on a topic carries either a request or a response. Requests
//! resolve their typed params by method name at decode time; a method this
//! build does not know decodes to [`RequestParams::Unsupported`] instead of
//! failing the whole frame.

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::errors::{PairkitError, Result};
use crate::types::{Participant, Permissions, Reason, RelayProtocolOptions, Topic};

/// Request identifier, unique per request on a topic at a given time.
pub type RequestId = u64;

/// Generate a random request id. 53 bits so the value survives JSON peers
/// that parse numbers as doubles.
pub fn generate_request_id() -> RequestId {
    rand::thread_rng().gen_range(1..(1u64 << 53))
}

/// JSON-RPC error codes used on the wire.
pub mod code {
    /// Standard JSON-RPC "method not found".
    pub const UNSUPPORTED_METHOD: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const UNAUTHORIZED: i64 = 3000;
    pub const INVALID_STATE: i64 = 3001;
    pub const PERMISSIONS_MISMATCH: i64 = 3002;
    pub const INTERNAL: i64 = -32000;
}

/// Map a handler failure to the wire error code reported to the peer.
pub fn code_for(err: &PairkitError) -> i64 {
    match err {
        PairkitError::UnsupportedMethod => code::UNSUPPORTED_METHOD,
        PairkitError::InvalidParams(_) => code::INVALID_PARAMS,
        PairkitError::UnauthorizedMatchingController(_) | PairkitError::Unauthorized(_) => {
            code::UNAUTHORIZED
        }
        PairkitError::InvalidSequenceState { .. }
        | PairkitError::NotFound(_)
        | PairkitError::DuplicateTopic(_) => code::INVALID_STATE,
        PairkitError::PermissionsMismatch => code::PERMISSIONS_MISMATCH,
        _ => code::INTERNAL,
    }
}

/// Approval of a pairing proposal, published by the responder on the
/// proposal topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PairingApproveParams {
    pub responder: Participant,
    pub relay: RelayProtocolOptions,
    pub expiry: u64,
}

/// A session proposal, sent over a settled pairing topic. Carries the fresh
/// session topic the session will settle on and the proposer's session key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionProposal {
    pub topic: Topic,
    pub proposer: Participant,
    pub permissions: Permissions,
    pub relay: RelayProtocolOptions,
    pub expiry: u64,
}

/// Approval of a session proposal, published on the session topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionApproveParams {
    pub responder: Participant,
    pub permissions: Permissions,
    pub expiry: u64,
}

/// Rejection of a session proposal, sent over the carrying pairing topic
/// since the session topic never establishes a key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionRejectParams {
    pub topic: Topic,
    pub reason: Reason,
}

/// Renegotiated permissions for a settled session.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionUpdateParams {
    pub permissions: Permissions,
}

/// Delete notification for a pairing or session topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeleteParams {
    pub reason: Reason,
}

/// Method name plus typed params, resolved at decode time.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum RequestParams {
    #[serde(rename = "pairing_approve")]
    PairingApprove(PairingApproveParams),
    #[serde(rename = "pairing_delete")]
    PairingDelete(DeleteParams),
    #[serde(rename = "session_propose")]
    SessionPropose(SessionProposal),
    #[serde(rename = "session_approve")]
    SessionApprove(SessionApproveParams),
    #[serde(rename = "session_reject")]
    SessionReject(SessionRejectParams),
    #[serde(rename = "session_update")]
    SessionUpdate(SessionUpdateParams),
    #[serde(rename = "session_delete")]
    SessionDelete(DeleteParams),
    #[serde(other)]
    Unsupported,
}

impl RequestParams {
    /// Methods this build understands. Anything else decodes to
    /// [`RequestParams::Unsupported`].
    pub const METHODS: [&'static str; 7] = [
        "pairing_approve",
        "pairing_delete",
        "session_propose",
        "session_approve",
        "session_reject",
        "session_update",
        "session_delete",
    ];

    pub fn method(&self) -> &'static str {
        match self {
            Self::PairingApprove(_) => "pairing_approve",
            Self::PairingDelete(_) => "pairing_delete",
            Self::SessionPropose(_) => "session_propose",
            Self::SessionApprove(_) => "session_approve",
            Self::SessionReject(_) => "session_reject",
            Self::SessionUpdate(_) => "session_update",
            Self::SessionDelete(_) => "session_delete",
            Self::Unsupported => "unsupported",
        }
    }
}

/// A JSON-RPC request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub call: RequestParams,
}

impl Request {
    pub fn new(call: RequestParams) -> Self {
        Self {
            id: generate_request_id(),
            call,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
}

/// A JSON-RPC response: exactly one of `result` or `error` is present.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: RequestId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl Response {
    pub fn ok(id: RequestId, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: RequestId, code: i64, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ResponseError {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn into_result(self) -> Result<serde_json::Value> {
        if let Some(err) = self.error {
            return Err(PairkitError::PeerError {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| PairkitError::Codec("response carries neither result nor error".into()))
    }
}

/// Any decoded frame payload.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

impl Payload {
    pub fn id(&self) -> RequestId {
        match self {
            Self::Request(r) => r.id,
            Self::Response(r) => r.id,
        }
    }
}

// Requests and responses share a wire shape apart from the `method` key, so
// the discriminant is resolved by hand: an untagged derive would let a
// request with an unknown method fall through to `Response` (both of whose
// fields are optional) instead of surfacing as an unsupported request.
impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;

        let value = serde_json::Value::deserialize(deserializer)?;
        let Some(method) = value.get("method") else {
            return Response::deserialize(value)
                .map(Payload::Response)
                .map_err(D::Error::custom);
        };

        let known = method
            .as_str()
            .is_some_and(|m| RequestParams::METHODS.contains(&m));
        if !known {
            let id = value
                .get("id")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| D::Error::custom("request without a numeric id"))?;
            return Ok(Payload::Request(Request {
                id,
                call: RequestParams::Unsupported,
            }));
        }
        Request::deserialize(value)
            .map(Payload::Request)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PublicKey;
    use crate::types::AppMetadata;

    fn participant(controller: bool) -> Participant {
        Participant {
            public_key: PublicKey::from_bytes([7u8; 32]),
            controller,
            metadata: Some(AppMetadata {
                name: Some("test wallet".into()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn request_round_trip() {
        let request = Request::new(RequestParams::PairingApprove(PairingApproveParams {
            responder: participant(true),
            relay: RelayProtocolOptions::new("waku"),
            expiry: 1_700_000_000,
        }));
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"method\":\"pairing_approve\""));

        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, Payload::Request(request));
    }

    #[test]
    fn response_round_trip() {
        let response = Response::ok(42, serde_json::Value::Bool(true));
        let json = serde_json::to_string(&response).unwrap();
        let decoded: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, Payload::Response(response));
    }

    #[test]
    fn unknown_method_decodes_to_unsupported() {
        let json = r#"{"id":7,"method":"wallet_teleport","params":{"x":1}}"#;
        let decoded: Payload = serde_json::from_str(json).unwrap();
        match decoded {
            Payload::Request(req) => {
                assert_eq!(req.id, 7);
                assert_eq!(req.call, RequestParams::Unsupported);
            }
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[test]
    fn error_response_decodes_as_response() {
        let json = r#"{"id":11,"error":{"code":-32601,"message":"unsupported method"}}"#;
        let decoded: Payload = serde_json::from_str(json).unwrap();
        match decoded {
            Payload::Response(response) => {
                assert_eq!(response.error.as_ref().unwrap().code, code::UNSUPPORTED_METHOD)
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn known_method_with_bad_params_is_an_error() {
        let json = r#"{"id":3,"method":"session_update","params":{"bogus":true}}"#;
        assert!(serde_json::from_str::<Payload>(json).is_err());
    }

    #[test]
    fn unknown_method_without_id_is_an_error() {
        let json = r#"{"method":"wallet_teleport","params":{}}"#;
        assert!(serde_json::from_str::<Payload>(json).is_err());
    }

    #[test]
    fn error_response_surfaces_peer_error() {
        let response = Response::err(9, code::PERMISSIONS_MISMATCH, "chains not granted");
        let err = response.into_result().unwrap_err();
        assert_eq!(
            err,
            PairkitError::PeerError {
                code: code::PERMISSIONS_MISMATCH,
                message: "chains not granted".into(),
            }
        );
    }

    #[test]
    fn request_ids_fit_double_precision() {
        for _ in 0..64 {
            assert!(generate_request_id() < (1u64 << 53));
        }
    }
}
