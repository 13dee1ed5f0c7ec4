//! JSON-RPC 2.0 signaling protocol types
//!
//! Envelopes travel as JSON-RPC notifications whose method names and
//! camelCase params match the browser client:
//!
//! ```json
//! {"jsonrpc":"2.0","method":"secureDrop:offer",
//!  "params":{"fromUserId":"alice","toUserId":"bob","sdp":{"type":"offer","sdp":"v=0..."}}}
//! ```

use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 protocol version
pub const JSONRPC_VERSION: &str = "2.0";

/// Method names understood by clients and the relay
pub mod methods {
    /// Bind the connection to a member id
    pub const REGISTER: &str = "register";

    /// Liveness probe answered by the relay
    pub const PING: &str = "ping";

    /// Session description offer
    pub const OFFER: &str = "secureDrop:offer";

    /// Session description answer
    pub const ANSWER: &str = "secureDrop:answer";

    /// Trickled ICE candidate
    pub const CANDIDATE: &str = "secureDrop:candidate";

    /// Offer rejected
    pub const DECLINE: &str = "secureDrop:decline";

    /// Session ended
    pub const END: &str = "secureDrop:end";

    /// All envelope methods routed peer to peer
    pub const ENVELOPES: [&str; 5] = [OFFER, ANSWER, CANDIDATE, DECLINE, END];

    /// Check whether `method` names a routed envelope
    pub fn is_envelope(method: &str) -> bool {
        ENVELOPES.contains(&method)
    }
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcRequest {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Method name to invoke
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: serde_json::Value,

    /// Request ID (absent for notifications)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
}

/// JSON-RPC 2.0 response (success)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Result data
    pub result: serde_json::Value,

    /// Request ID this response corresponds to
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    /// Protocol version (must be "2.0")
    pub jsonrpc: String,

    /// Error details
    pub error: ErrorObject,

    /// Request ID this error corresponds to (null for notifications)
    pub id: serde_json::Value,
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorObject {
    /// Error code
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Standard JSON-RPC 2.0 error codes
pub mod error_codes {
    /// Invalid JSON was received
    pub const PARSE_ERROR: i32 = -32700;

    /// The JSON sent is not a valid Request object
    pub const INVALID_REQUEST: i32 = -32600;

    /// The method does not exist / is not available
    pub const METHOD_NOT_FOUND: i32 = -32601;

    /// Invalid method parameter(s)
    pub const INVALID_PARAMS: i32 = -32602;

    /// Internal JSON-RPC error
    pub const INTERNAL_ERROR: i32 = -32603;

    // Relay-specific error codes

    /// Envelope sent before `register`
    pub const NOT_REGISTERED: i32 = -32001;

    /// `fromUserId` does not match the registered id of the connection
    pub const SENDER_MISMATCH: i32 = -32002;
}

/// Any JSON-RPC message a peer of the relay may receive
#[derive(Debug, Clone, PartialEq)]
pub enum JsonRpcMessage {
    /// Request or notification
    Request(JsonRpcRequest),
    /// Successful response
    Response(JsonRpcResponse),
    /// Error response
    Error(JsonRpcError),
}

impl JsonRpcMessage {
    /// Parse a text frame, classifying it by the members present
    pub fn from_json(json: &str) -> crate::Result<Self> {
        let value: serde_json::Value = serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to parse JSON-RPC message: {}", e))
        })?;

        let parsed = if value.get("method").is_some() {
            serde_json::from_value(value).map(JsonRpcMessage::Request)
        } else if value.get("error").is_some() {
            serde_json::from_value(value).map(JsonRpcMessage::Error)
        } else {
            serde_json::from_value(value).map(JsonRpcMessage::Response)
        };

        parsed.map_err(|e| {
            crate::Error::SerializationError(format!("Invalid JSON-RPC message: {}", e))
        })
    }
}

/// SDP type of a session description
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Initial offer
    Offer,
    /// Provisional answer
    Pranswer,
    /// Final answer
    Answer,
    /// Rollback of a pending description
    Rollback,
}

/// Session description in `RTCSessionDescriptionInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    /// Description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,

    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Create an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Create an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate in `RTCIceCandidateInit` shape
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Candidate attribute line
    pub candidate: String,

    /// Media stream identification tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Index of the media description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,

    /// ICE username fragment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// Parameters for `register`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegisterParams {
    /// Member id to bind the connection to
    pub user_id: String,
}

/// Parameters for `secureDrop:offer` and `secureDrop:answer`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DescriptionParams {
    /// Sender member id
    pub from_user_id: String,

    /// Recipient member id
    pub to_user_id: String,

    /// Session description
    pub sdp: SessionDescription,
}

/// Parameters for `secureDrop:candidate`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CandidateParams {
    /// Sender member id
    pub from_user_id: String,

    /// Recipient member id
    pub to_user_id: String,

    /// ICE candidate
    pub candidate: IceCandidate,
}

/// Parameters for `secureDrop:decline` and `secureDrop:end`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteParams {
    /// Sender member id
    pub from_user_id: String,

    /// Recipient member id
    pub to_user_id: String,
}

/// Session-control envelope exchanged between two members
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEnvelope {
    /// Offer to open a session
    Offer {
        from_id: String,
        to_id: String,
        sdp: SessionDescription,
    },
    /// Answer to an offer
    Answer {
        from_id: String,
        to_id: String,
        sdp: SessionDescription,
    },
    /// Trickled connectivity candidate
    Candidate {
        from_id: String,
        to_id: String,
        candidate: IceCandidate,
    },
    /// Offer rejected
    Decline { from_id: String, to_id: String },
    /// Session ended
    End { from_id: String, to_id: String },
}

impl SignalEnvelope {
    /// Sender member id
    pub fn from_id(&self) -> &str {
        match self {
            SignalEnvelope::Offer { from_id, .. }
            | SignalEnvelope::Answer { from_id, .. }
            | SignalEnvelope::Candidate { from_id, .. }
            | SignalEnvelope::Decline { from_id, .. }
            | SignalEnvelope::End { from_id, .. } => from_id,
        }
    }

    /// Recipient member id
    pub fn to_id(&self) -> &str {
        match self {
            SignalEnvelope::Offer { to_id, .. }
            | SignalEnvelope::Answer { to_id, .. }
            | SignalEnvelope::Candidate { to_id, .. }
            | SignalEnvelope::Decline { to_id, .. }
            | SignalEnvelope::End { to_id, .. } => to_id,
        }
    }

    /// JSON-RPC method name
    pub fn method(&self) -> &'static str {
        match self {
            SignalEnvelope::Offer { .. } => methods::OFFER,
            SignalEnvelope::Answer { .. } => methods::ANSWER,
            SignalEnvelope::Candidate { .. } => methods::CANDIDATE,
            SignalEnvelope::Decline { .. } => methods::DECLINE,
            SignalEnvelope::End { .. } => methods::END,
        }
    }

    /// Encode as a JSON-RPC notification
    pub fn to_request(&self) -> crate::Result<JsonRpcRequest> {
        let params = match self {
            SignalEnvelope::Offer { from_id, to_id, sdp }
            | SignalEnvelope::Answer { from_id, to_id, sdp } => {
                serde_json::to_value(DescriptionParams {
                    from_user_id: from_id.clone(),
                    to_user_id: to_id.clone(),
                    sdp: sdp.clone(),
                })
            }
            SignalEnvelope::Candidate {
                from_id,
                to_id,
                candidate,
            } => serde_json::to_value(CandidateParams {
                from_user_id: from_id.clone(),
                to_user_id: to_id.clone(),
                candidate: candidate.clone(),
            }),
            SignalEnvelope::Decline { from_id, to_id } | SignalEnvelope::End { from_id, to_id } => {
                serde_json::to_value(RouteParams {
                    from_user_id: from_id.clone(),
                    to_user_id: to_id.clone(),
                })
            }
        }
        .map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize envelope: {}", e))
        })?;

        Ok(JsonRpcRequest::new(self.method().to_string(), params, None))
    }

    /// Decode from a JSON-RPC request, rejecting unknown methods and bad params
    pub fn from_request(req: &JsonRpcRequest) -> crate::Result<Self> {
        fn params<T: serde::de::DeserializeOwned>(req: &JsonRpcRequest) -> crate::Result<T> {
            serde_json::from_value(req.params.clone()).map_err(|e| {
                crate::Error::InvalidData(format!("Invalid {} params: {}", req.method, e))
            })
        }

        match req.method.as_str() {
            methods::OFFER => {
                let p: DescriptionParams = params(req)?;
                Ok(SignalEnvelope::Offer {
                    from_id: p.from_user_id,
                    to_id: p.to_user_id,
                    sdp: p.sdp,
                })
            }
            methods::ANSWER => {
                let p: DescriptionParams = params(req)?;
                Ok(SignalEnvelope::Answer {
                    from_id: p.from_user_id,
                    to_id: p.to_user_id,
                    sdp: p.sdp,
                })
            }
            methods::CANDIDATE => {
                let p: CandidateParams = params(req)?;
                Ok(SignalEnvelope::Candidate {
                    from_id: p.from_user_id,
                    to_id: p.to_user_id,
                    candidate: p.candidate,
                })
            }
            methods::DECLINE => {
                let p: RouteParams = params(req)?;
                Ok(SignalEnvelope::Decline {
                    from_id: p.from_user_id,
                    to_id: p.to_user_id,
                })
            }
            methods::END => {
                let p: RouteParams = params(req)?;
                Ok(SignalEnvelope::End {
                    from_id: p.from_user_id,
                    to_id: p.to_user_id,
                })
            }
            other => Err(crate::Error::InvalidData(format!(
                "Unknown envelope method: {}",
                other
            ))),
        }
    }

    /// Convert envelope to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        self.to_request()?.to_json()
    }

    /// Parse envelope from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Self::from_request(&JsonRpcRequest::from_json(json)?)
    }
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request
    pub fn new(method: String, params: serde_json::Value, id: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method,
            params,
            id,
        }
    }

    /// Create a `register` request
    pub fn register(user_id: &str, id: serde_json::Value) -> Self {
        Self::new(
            methods::REGISTER.to_string(),
            serde_json::json!({ "userId": user_id }),
            Some(id),
        )
    }

    /// Whether the request is a notification (no response expected)
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC request: {}", e))
        })
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> crate::Result<Self> {
        serde_json::from_str(json).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to deserialize JSON-RPC request: {}",
                e
            ))
        })
    }
}

impl JsonRpcResponse {
    /// Create a new JSON-RPC response
    pub fn new(result: serde_json::Value, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result,
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!(
                "Failed to serialize JSON-RPC response: {}",
                e
            ))
        })
    }
}

impl JsonRpcError {
    /// Create a new JSON-RPC error
    pub fn new(code: i32, message: String, id: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            error: ErrorObject {
                code,
                message,
                data: None,
            },
            id,
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| {
            crate::Error::SerializationError(format!("Failed to serialize JSON-RPC error: {}", e))
        })
    }
}
