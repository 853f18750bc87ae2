//! Terminal reports written to the output channel, and their wire forms.
//!
//! Every request ends in exactly one [`Report`]. How a report is written
//! depends on the [`ProtocolVersion`] the process was started with:
//!
//! - modern: `{"id": <int|null>, "success": <bool>, "msg": <value>}`
//! - legacy: `{"code": <int>, "message": <string>, "result": <value|null>, "version": <string>}`

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreError;
use crate::types::RequestId;

/// Legacy code for a successful export.
pub const CODE_SUCCESS: u16 = 0;

/// Legacy code for any failed request.
pub const CODE_FAILURE: u16 = 1;

/// Legacy code for a format whose external converter is not installed.
pub const CODE_MISSING_CONVERTER: u16 = 530;

/// Which request/response wire format the session speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    #[default]
    Modern,
    Legacy,
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolVersion::Modern => f.write_str("modern"),
            ProtocolVersion::Legacy => f.write_str("legacy"),
        }
    }
}

impl FromStr for ProtocolVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "modern" => Ok(ProtocolVersion::Modern),
            "legacy" => Ok(ProtocolVersion::Legacy),
            other => Err(CoreError::Validation(format!(
                "Unknown protocol version \"{other}\"; expected modern or legacy"
            ))),
        }
    }
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    Failure { code: u16, message: String },
}

/// One terminal event for the output channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// External correlation id; `None` for legacy requests and for
    /// requests rejected before an id could be read.
    pub id: Option<RequestId>,
    pub outcome: Outcome,
}

impl Report {
    pub fn success(id: Option<RequestId>, msg: Value) -> Self {
        Self {
            id,
            outcome: Outcome::Success(msg),
        }
    }

    pub fn failure(id: Option<RequestId>, message: impl Into<String>) -> Self {
        Self::failure_with_code(id, CODE_FAILURE, message)
    }

    pub fn failure_with_code(id: Option<RequestId>, code: u16, message: impl Into<String>) -> Self {
        Self {
            id,
            outcome: Outcome::Failure {
                code,
                message: message.into(),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success(_))
    }

    /// Failure text, if this report is a failure.
    pub fn error_message(&self) -> Option<&str> {
        match &self.outcome {
            Outcome::Failure { message, .. } => Some(message),
            Outcome::Success(_) => None,
        }
    }

    /// Render as one line of JSON (no trailing newline).
    pub fn encode(&self, protocol: ProtocolVersion, version: &str) -> String {
        let line = match protocol {
            ProtocolVersion::Modern => serde_json::to_string(&self.modern()),
            ProtocolVersion::Legacy => serde_json::to_string(&self.legacy(version)),
        };
        // Both line types hold only strings, integers and `Value`s.
        line.unwrap_or_else(|e| {
            format!(r#"{{"success":false,"msg":"failed to encode report: {e}"}}"#)
        })
    }

    fn modern(&self) -> ModernLine<'_> {
        match &self.outcome {
            Outcome::Success(msg) => ModernLine {
                id: self.id,
                success: true,
                msg: MsgRef::Value(msg),
            },
            Outcome::Failure { message, .. } => ModernLine {
                id: self.id,
                success: false,
                msg: MsgRef::Text(message),
            },
        }
    }

    fn legacy<'a>(&'a self, version: &'a str) -> LegacyLine<'a> {
        match &self.outcome {
            Outcome::Success(result) => LegacyLine {
                code: CODE_SUCCESS,
                message: "Success",
                result: Some(result),
                version,
            },
            Outcome::Failure { code, message } => LegacyLine {
                code: *code,
                message,
                result: None,
                version,
            },
        }
    }
}

#[derive(Serialize)]
#[serde(untagged)]
enum MsgRef<'a> {
    Value(&'a Value),
    Text(&'a str),
}

#[derive(Serialize)]
struct ModernLine<'a> {
    id: Option<RequestId>,
    success: bool,
    msg: MsgRef<'a>,
}

#[derive(Serialize)]
struct LegacyLine<'a> {
    code: u16,
    message: &'a str,
    result: Option<&'a Value>,
    version: &'a str,
}
