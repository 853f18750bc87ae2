//! Request-line parsing and validation.
//!
//! The request stream carries one JSON object per line. A
//! [`RequestSession`] turns each line into a validated [`Request`] or a
//! [`Rejection`] that already knows which id to report it under.
//! Nothing rejected here ever reaches the scheduler.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::format::ExportFormat;
use crate::report::{ProtocolVersion, Report};
use crate::scope::{Scope, ScopeProvider};
use crate::types::RequestId;

/// Fields consumed by the session rather than forwarded to the scope.
const ROUTING_FIELDS: [&str; 3] = ["id", "operation", "scope"];

/// Format assumed for legacy requests that do not name one.
const LEGACY_DEFAULT_FORMAT: ExportFormat = ExportFormat::Png;

/// Operations a request line may ask for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Export,
    CreateTab,
    Reload,
    Shutdown,
    Noop,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Export => "export",
            Operation::CreateTab => "create_tab",
            Operation::Reload => "reload",
            Operation::Shutdown => "shutdown",
            Operation::Noop => "noop",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export" => Ok(Operation::Export),
            "create_tab" => Ok(Operation::CreateTab),
            "reload" => Ok(Operation::Reload),
            "shutdown" => Ok(Operation::Shutdown),
            "noop" => Ok(Operation::Noop),
            other => Err(RequestError::UnknownOperation(other.to_string())),
        }
    }
}

/// A validated render request.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    pub format: ExportFormat,
    pub scope: Arc<Scope>,
    /// Forwarded verbatim as the first argument of the scope function.
    pub payload: Value,
}

/// What a validated request asks for.
#[derive(Debug, Clone)]
pub enum RequestKind {
    Export(ExportRequest),
    CreateTab,
    Reload,
    Shutdown,
    Noop,
}

impl RequestKind {
    pub fn operation(&self) -> Operation {
        match self {
            RequestKind::Export(_) => Operation::Export,
            RequestKind::CreateTab => Operation::CreateTab,
            RequestKind::Reload => Operation::Reload,
            RequestKind::Shutdown => Operation::Shutdown,
            RequestKind::Noop => Operation::Noop,
        }
    }
}

/// One accepted request line.
#[derive(Debug, Clone)]
pub struct Request {
    /// Caller-supplied correlation id (`None` on the legacy protocol).
    pub id: Option<RequestId>,
    pub kind: RequestKind,
}

/// Why a request line was refused.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("Invalid JSON: {0}")]
    Malformed(String),

    #[error("Missing required field \"{0}\"")]
    MissingField(&'static str),

    #[error("Invalid id: {0}")]
    InvalidId(String),

    #[error("Duplicate id: {0}")]
    DuplicateId(RequestId),

    #[error("Unknown operation \"{0}\"")]
    UnknownOperation(String),

    #[error(transparent)]
    Invalid(#[from] CoreError),
}

/// A refused request together with the id its failure is reported under.
#[derive(Debug)]
pub struct Rejection {
    pub id: Option<RequestId>,
    pub error: RequestError,
}

impl Rejection {
    fn new(id: Option<RequestId>, error: impl Into<RequestError>) -> Self {
        Self {
            id,
            error: error.into(),
        }
    }

    pub fn into_report(self) -> Report {
        Report::failure(self.id, self.error.to_string())
    }
}

/// Per-session request validator.
///
/// Remembers every id it has seen so that an id is accepted at most
/// once per session, whatever happened to the first request using it.
pub struct RequestSession {
    protocol: ProtocolVersion,
    scopes: Arc<dyn ScopeProvider>,
    default_scope: String,
    seen_ids: HashSet<RequestId>,
}

impl RequestSession {
    pub fn new(
        protocol: ProtocolVersion,
        scopes: Arc<dyn ScopeProvider>,
        default_scope: impl Into<String>,
    ) -> Self {
        Self {
            protocol,
            scopes,
            default_scope: default_scope.into(),
            seen_ids: HashSet::new(),
        }
    }

    pub fn protocol(&self) -> ProtocolVersion {
        self.protocol
    }

    /// Parse and validate one request line.
    pub fn accept(&mut self, line: &str) -> Result<Request, Rejection> {
        let object = parse_object(line).map_err(|e| Rejection::new(None, e))?;
        match self.protocol {
            ProtocolVersion::Modern => self.accept_modern(object),
            ProtocolVersion::Legacy => self.accept_legacy(object),
        }
    }

    fn accept_modern(&mut self, mut object: Map<String, Value>) -> Result<Request, Rejection> {
        let id = match object.get("id") {
            None => return Err(Rejection::new(None, RequestError::MissingField("id"))),
            Some(value) => parse_id(value).map_err(|e| Rejection::new(None, e))?,
        };
        if !self.seen_ids.insert(id) {
            return Err(Rejection::new(Some(id), RequestError::DuplicateId(id)));
        }

        let operation = match object.get("operation") {
            None => {
                return Err(Rejection::new(
                    Some(id),
                    RequestError::MissingField("operation"),
                ))
            }
            Some(value) => parse_operation(value).map_err(|e| Rejection::new(Some(id), e))?,
        };

        let kind = self
            .build_kind(operation, &mut object, None)
            .map_err(|e| Rejection::new(Some(id), e))?;
        Ok(Request { id: Some(id), kind })
    }

    fn accept_legacy(&mut self, mut object: Map<String, Value>) -> Result<Request, Rejection> {
        let operation = match object.get("operation") {
            None => Operation::Export,
            Some(value) => parse_operation(value).map_err(|e| Rejection::new(None, e))?,
        };
        let kind = self
            .build_kind(operation, &mut object, Some(LEGACY_DEFAULT_FORMAT))
            .map_err(|e| Rejection::new(None, e))?;
        Ok(Request { id: None, kind })
    }

    fn build_kind(
        &self,
        operation: Operation,
        object: &mut Map<String, Value>,
        default_format: Option<ExportFormat>,
    ) -> Result<RequestKind, RequestError> {
        Ok(match operation {
            Operation::Export => RequestKind::Export(self.build_export(object, default_format)?),
            Operation::CreateTab => RequestKind::CreateTab,
            Operation::Reload => RequestKind::Reload,
            Operation::Shutdown => RequestKind::Shutdown,
            Operation::Noop => RequestKind::Noop,
        })
    }

    fn build_export(
        &self,
        object: &mut Map<String, Value>,
        default_format: Option<ExportFormat>,
    ) -> Result<ExportRequest, RequestError> {
        let format = match (object.get("format"), default_format) {
            (Some(Value::String(name)), _) => name.parse::<ExportFormat>()?,
            (Some(other), _) => {
                return Err(CoreError::Validation(format!(
                    "format must be a string, got {other}"
                ))
                .into())
            }
            (None, Some(default)) => default,
            (None, None) => return Err(RequestError::MissingField("format")),
        };

        let scope_name = match object.get("scope") {
            None | Some(Value::Null) => self.default_scope.clone(),
            Some(Value::String(name)) => name.clone(),
            Some(other) => {
                return Err(CoreError::Validation(format!(
                    "scope must be a string, got {other}"
                ))
                .into())
            }
        };
        let scope = self
            .scopes
            .scope(&scope_name)
            .ok_or_else(|| CoreError::NotFound {
                entity: "scope",
                name: scope_name,
            })?;

        for field in ROUTING_FIELDS {
            object.remove(field);
        }

        Ok(ExportRequest {
            format,
            scope,
            payload: Value::Object(std::mem::take(object)),
        })
    }
}

fn parse_object(line: &str) -> Result<Map<String, Value>, RequestError> {
    match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(object)) => Ok(object),
        Ok(other) => Err(RequestError::Malformed(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
        Err(e) => Err(RequestError::Malformed(e.to_string())),
    }
}

fn parse_id(value: &Value) -> Result<RequestId, RequestError> {
    if let Some(id) = value.as_u64() {
        return Ok(id);
    }
    match value.as_i64() {
        Some(negative) => Err(RequestError::InvalidId(format!(
            "{negative} is negative; ids must be non-negative integers"
        ))),
        None => Err(RequestError::InvalidId(format!(
            "{value} is not a non-negative integer"
        ))),
    }
}

fn parse_operation(value: &Value) -> Result<Operation, RequestError> {
    match value {
        Value::String(name) => name.parse(),
        other => Err(RequestError::UnknownOperation(other.to_string())),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
