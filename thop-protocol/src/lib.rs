// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! thop-protocol defines the wire types shared between the thop JSON-RPC
//! server and its clients: the JSON-RPC envelope, tool argument/result
//! shapes, and the on-disk persisted-state document. It has no logic of
//! its own, only `serde`-derived shapes, the same role `shpool-protocol`
//! plays for `shpool`'s control socket.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// The execution-context kind a session wraps.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Local,
    Ssh,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Local => write!(f, "local"),
            SessionKind::Ssh => write!(f, "ssh"),
        }
    }
}

/// The result of running a command in a session.
///
/// `exit_code == 130` signals a user-initiated cancellation (the SIGINT
/// equivalent); `exit_code == 0` iff the command reported success.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteResult {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
}

/// A read-only snapshot of one session's state, as returned by
/// `ListSessions`/`GetSession` and embedded in RPC resource responses.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SessionSnapshot {
    pub name: String,
    pub kind: SessionKind,
    pub connected: bool,
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
}

/// The taxonomy of errors thop can surface, shared verbatim between the
/// core library, the CLI exit-code mapping, and the RPC tool-error mapping.
#[derive(Error, Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    #[error("connection failed")]
    ConnectionFailed,
    #[error("connection timed out")]
    ConnectionTimeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("password authentication required")]
    AuthPasswordRequired,
    #[error("public key authentication failed")]
    AuthKeyFailed,
    #[error("password authentication failed")]
    AuthPasswordFailed,
    #[error("host key verification failed")]
    HostKeyVerification,
    #[error("host key changed")]
    HostKeyChanged,
    #[error("host key unknown")]
    HostKeyUnknown,
    #[error("session not found")]
    SessionNotFound,
    #[error("session not connected")]
    SessionNotConnected,
    #[error("cannot close the local session")]
    CannotCloseLocal,
    #[error("no active session")]
    NoActiveSession,
    #[error("command timed out")]
    CommandTimeout,
    #[error("command not found")]
    CommandNotFound,
    #[error("permission denied")]
    PermissionDenied,
    #[error("command failed")]
    CommandFailed,
    #[error("missing parameter")]
    MissingParameter,
    #[error("not implemented")]
    NotImplemented,
    #[error("state file corrupted")]
    StateCorrupted,
    #[error("state file i/o error")]
    StateIOError,
    #[error("operation failed")]
    OperationFailed,
}

impl ErrorKind {
    /// Maps an error kind to the CLI exit code documented in spec.md §6/§7.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::AuthPasswordRequired
            | ErrorKind::AuthKeyFailed
            | ErrorKind::AuthPasswordFailed => 2,
            ErrorKind::HostKeyVerification | ErrorKind::HostKeyChanged | ErrorKind::HostKeyUnknown => 3,
            _ => 1,
        }
    }
}

/// A structured error, as attached to tool-call results and CLI failures.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[error("{message}")]
pub struct ErrorPayload {
    pub code: ErrorKind,
    pub message: String,
    #[serde(default)]
    pub session: String,
    #[serde(default)]
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// The persisted-state document, one JSON object written atomically to
/// `state.json` under an exclusive advisory lock.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistentState {
    pub active_session: String,
    #[serde(default)]
    pub sessions: BTreeMap<String, PersistedSession>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct PersistedSession {
    pub r#type: SessionKind,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub cwd: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl Default for SessionKind {
    fn default() -> Self {
        SessionKind::Local
    }
}

// ---------------------------------------------------------------------
// JSON-RPC envelope (JSON-RPC 2.0, line-delimited)
// ---------------------------------------------------------------------

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

pub const RPC_PARSE_ERROR: i64 = -32700;
pub const RPC_INVALID_REQUEST: i64 = -32600;
pub const RPC_METHOD_NOT_FOUND: i64 = -32601;
pub const RPC_INVALID_PARAMS: i64 = -32602;
pub const RPC_INTERNAL_ERROR: i64 = -32603;

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        JsonRpcResponse { jsonrpc: "2.0".to_string(), id, result: Some(result), error: None }
    }

    pub fn failure(id: serde_json::Value, code: i64, message: impl Into<String>) -> Self {
        JsonRpcResponse {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(JsonRpcErrorObject { code, message: message.into(), data: None }),
        }
    }
}

/// The arguments accepted by the `execute` tool.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ExecuteArgs {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub background: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct NamedSessionArgs {
    pub name: String,
}

/// A single content block of a tool-call result, as returned by
/// `tools/call`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolContent {
    Text { text: String },
}

/// The body of a `tools/call` response. Per spec.md §4.F / §9, tool-level
/// failures are NOT JSON-RPC errors: they're a successful RPC response
/// whose body carries `is_error: true`. This intentionally conflates
/// transport-level failures (e.g. session not found) with a successful
/// command that merely exited non-zero, preserving the source behavior
/// documented as an open question in spec.md -- splitting it would be a
/// breaking change for any client depending on today's shape.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallResult {
    pub is_error: bool,
    pub content: Vec<ToolContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_error: Option<ErrorPayload>,
}

impl ToolCallResult {
    pub fn ok(text: impl Into<String>) -> Self {
        ToolCallResult { is_error: false, content: vec![ToolContent::Text { text: text.into() }], structured_error: None }
    }

    pub fn err(text: impl Into<String>, payload: ErrorPayload) -> Self {
        ToolCallResult {
            is_error: true,
            content: vec![ToolContent::Text { text: text.into() }],
            structured_error: Some(payload),
        }
    }
}
