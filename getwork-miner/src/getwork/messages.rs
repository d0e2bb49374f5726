//! Getwork message types and JSON-RPC serialization.
//!
//! Requests are JSON-RPC 1.0 style objects POSTed over HTTP. Responses carry
//! either a `result` or an `error` object; a non-null `error.message` is a
//! server-reported failure, distinct from transport trouble.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;

use super::error::{GetworkError, GetworkResult};
use crate::work::{AssignedWork, DEFAULT_MASK};

/// Block height of the coordinator's current chain tip.
pub const X_BLOCKNUM: &str = "x-blocknum";

/// Long-poll endpoint advertisement (absolute or relative URL).
pub const X_LONG_POLLING: &str = "x-long-polling";

/// Explanation attached to a rejected result.
pub const X_REJECT_REASON: &str = "x-reject-reason";

/// The only RPC method this protocol uses, for both fetch and submit.
pub const GETWORK: &str = "getwork";

/// JSON-RPC request body.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub method: &'static str,
    pub params: Vec<Value>,
    pub id: u64,
}

impl JsonRpcRequest {
    /// Ask for work. `size` requests a specific range size from coordinators
    /// that support sizing.
    pub fn getwork(size: Option<u64>) -> Self {
        Self {
            method: GETWORK,
            params: size.map(|s| vec![Value::from(s)]).unwrap_or_default(),
            id: 1,
        }
    }

    /// Submit a hex-encoded result frame.
    pub fn submit(frame_hex: String) -> Self {
        Self {
            method: GETWORK,
            params: vec![Value::String(frame_hex)],
            id: 1,
        }
    }

    pub fn to_body(&self) -> GetworkResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse a JSON-RPC response body into its `result`.
///
/// A `null` or missing result is `Ok(None)`. An `error` object with a string
/// `message` becomes [`GetworkError::ServerMessage`]; error values without a
/// message are ignored.
pub fn parse_response(body: &[u8]) -> GetworkResult<Option<Value>> {
    let response: Value = serde_json::from_slice(body)?;
    let obj = response
        .as_object()
        .ok_or_else(|| GetworkError::Parse("response is not an object".to_string()))?;

    if let Some(message) = obj
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(Value::as_str)
    {
        return Err(GetworkError::ServerMessage(message.to_string()));
    }

    Ok(obj.get("result").filter(|r| !r.is_null()).cloned())
}

/// Parse a getwork `result` object into [`AssignedWork`].
pub fn parse_work(result: &Value) -> GetworkResult<AssignedWork> {
    let obj = result
        .as_object()
        .ok_or_else(|| GetworkError::Parse("work result is not an object".to_string()))?;

    let data_hex = obj
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| GetworkError::Parse("missing data".to_string()))?;
    let data_bytes =
        hex::decode(data_hex).map_err(|e| GetworkError::Parse(format!("data hex: {}", e)))?;
    let data: [u8; 80] = data_bytes
        .get(..80)
        .and_then(|prefix| prefix.try_into().ok())
        .ok_or_else(|| {
            GetworkError::Parse(format!("data too short: {} bytes", data_bytes.len()))
        })?;

    let target_hex = obj
        .get("target")
        .and_then(Value::as_str)
        .ok_or_else(|| GetworkError::Parse("missing target".to_string()))?;
    let target =
        hex::decode(target_hex).map_err(|e| GetworkError::Parse(format!("target hex: {}", e)))?;

    let mask = match obj.get("mask") {
        None | Some(Value::Null) => DEFAULT_MASK,
        Some(value) => value
            .as_u64()
            .and_then(|m| u32::try_from(m).ok())
            .ok_or_else(|| GetworkError::Parse("mask is not an integer".to_string()))?,
    };

    Ok(AssignedWork {
        data,
        target,
        mask,
        block: obj.get("block").and_then(parse_block),
    })
}

/// Block heights arrive as numbers or numeric strings.
pub fn parse_block(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Events emitted by the protocol client.
///
/// The application receives these on the channel given to the client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// First successful work after (re)connecting
    Connect,

    /// A previously working connection failed
    Disconnect,

    /// A connection attempt failed before ever succeeding
    Failure,

    /// Coordinator moved to a new block height
    Block(u64),

    /// New work is available
    Work(AssignedWork),

    /// Work arrived via long poll; always followed by the matching `Work`
    Push(AssignedWork),

    /// Long-poll subscription became active (true) or inactive (false)
    LongPoll(bool),

    /// Diagnostic text
    Debug(String),

    /// Message from the coordinator
    Msg(String),
}

/// Commands sent to the protocol client.
#[derive(Debug)]
pub enum ClientCommand {
    /// Begin communicating with the coordinator
    Connect,

    /// Cease communication; pending submissions resolve as rejected
    Disconnect,

    /// Ask for work immediately
    RequestWork,

    /// Submit a result; the reply carries acceptance
    Submit {
        result: Vec<u8>,
        reply: oneshot::Sender<bool>,
    },

    /// Change the advertised client version
    SetVersion {
        shortname: String,
        version: Option<String>,
    },
}
