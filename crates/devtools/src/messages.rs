//! DevTools protocol frame types and parser.
//!
//! Every frame is a JSON object. Command responses carry the `id` of
//! the command they answer plus either `result` or `error`; events carry
//! `method` and `params`. Frames for a flattened tab session also carry
//! `sessionId`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outgoing command frame.
#[derive(Debug, Serialize)]
pub struct CommandFrame<'a> {
    pub id: u64,
    pub method: &'a str,
    pub params: &'a Value,
    #[serde(rename = "sessionId", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<&'a str>,
}

/// Error payload of a failed command.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ErrorBody {
    pub code: i64,
    pub message: String,
}

/// A parsed incoming frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to a command we sent.
    Response {
        id: u64,
        session_id: Option<String>,
        result: Result<Value, ErrorBody>,
    },
    /// Unsolicited notification.
    Event {
        method: String,
        params: Value,
        session_id: Option<String>,
    },
}

#[derive(Deserialize)]
struct RawFrame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
    #[serde(rename = "sessionId", default)]
    session_id: Option<String>,
}

/// Errors from [`parse_message`].
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("Invalid frame JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame is neither a response nor an event")]
    Unrecognized,
}

/// Parse one text frame.
///
/// Callers should log failures and keep reading; one bad frame does not
/// poison the connection.
pub fn parse_message(text: &str) -> Result<IncomingMessage, MessageError> {
    let raw: RawFrame = serde_json::from_str(text)?;
    match (raw.id, raw.method) {
        (Some(id), _) => {
            let result = match raw.error {
                Some(error) => Err(error),
                None => Ok(raw.result.unwrap_or(Value::Null)),
            };
            Ok(IncomingMessage::Response {
                id,
                session_id: raw.session_id,
                result,
            })
        }
        (None, Some(method)) => Ok(IncomingMessage::Event {
            method,
            params: raw.params.unwrap_or(Value::Null),
            session_id: raw.session_id,
        }),
        (None, None) => Err(MessageError::Unrecognized),
    }
}

// ---- command results and event payloads ----

/// Result of `Target.createTarget`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTargetResult {
    pub target_id: String,
}

/// Result of `Target.attachToTarget`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachToTargetResult {
    pub session_id: String,
}

/// Result of `Browser.getVersion` (the fields we log).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserVersion {
    pub product: String,
    #[serde(default)]
    pub protocol_version: String,
}

/// Params of `Target.detachedFromTarget`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetachedFromTarget {
    pub session_id: String,
    #[serde(default)]
    pub target_id: Option<String>,
}

/// Params of `Runtime.executionContextCreated`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionContextCreated {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: i64,
    #[serde(default)]
    pub aux_data: Option<Value>,
}

impl ExecutionContextDescription {
    /// Whether this is the main-frame context rather than an iframe or an
    /// isolated world. Contexts without `auxData` count as default.
    pub fn is_default(&self) -> bool {
        self.aux_data
            .as_ref()
            .and_then(|aux| aux.get("isDefault"))
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
}

/// Exception report attached to script results.
#[derive(Debug, Clone, Deserialize)]
pub struct ExceptionDetails {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    /// Human-readable summary: the header text plus the thrown value's
    /// description when the engine provides one.
    pub fn summary(&self) -> String {
        let description = self
            .exception
            .as_ref()
            .and_then(|e| e.description.as_deref())
            .filter(|d| !d.is_empty());
        match description {
            Some(d) if self.text.is_empty() => d.to_string(),
            Some(d) => format!("{} {d}", self.text),
            None if self.text.is_empty() => "Script threw an exception".to_string(),
            None => self.text.clone(),
        }
    }
}

/// Mirror object for a value living in the page.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of `Runtime.compileScript`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileScriptResult {
    #[serde(default)]
    pub script_id: Option<String>,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

/// Result of `Runtime.runScript` and `Runtime.callFunctionOn`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    #[serde(default)]
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

/// Result of `Page.printToPDF`.
#[derive(Debug, Clone, Deserialize)]
pub struct PrintToPdfResult {
    pub data: String,
}
