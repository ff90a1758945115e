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

//! The structured error type threaded through the Session/Manager/Store
//! layers. Call sites that don't need to inspect `kind` just propagate
//! these as `anyhow::Error` via `?`; call sites at the RPC and CLI
//! boundaries match on `.kind` to pick an exit code or tool-error payload.

use std::fmt;

pub use thop_protocol::ErrorKind;
use thop_protocol::ErrorPayload;

#[derive(Debug, Clone)]
pub struct ThopError {
    pub kind: ErrorKind,
    pub message: String,
    pub session: String,
    pub retryable: bool,
    pub suggestion: Option<String>,
}

impl ThopError {
    pub fn new(kind: ErrorKind, session: impl Into<String>, message: impl Into<String>) -> Self {
        ThopError {
            kind,
            message: message.into(),
            session: session.into(),
            retryable: false,
            suggestion: None,
        }
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    pub fn into_payload(self) -> ErrorPayload {
        ErrorPayload {
            code: self.kind,
            message: self.message,
            session: self.session,
            retryable: self.retryable,
            suggestion: self.suggestion,
        }
    }
}

impl fmt::Display for ThopError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.kind, self.session, self.message)
    }
}

impl std::error::Error for ThopError {}

/// Pulls a `ThopError` back out of an `anyhow::Error` chain if one is
/// present, otherwise falls back to `OperationFailed` so CLI/RPC code
/// always has a kind to match on.
pub fn downcast(err: &anyhow::Error) -> ThopError {
    if let Some(te) = err.downcast_ref::<ThopError>() {
        return te.clone();
    }
    ThopError::new(ErrorKind::OperationFailed, "", err.to_string())
}
