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

//! Line-framed JSON-RPC 2.0 dispatcher exposing the `SessionManager` as
//! typed tools and resources, analogous to the Model Context Protocol's
//! `Initialize`/`Initialized` handshake. Framing and dispatch are
//! hand-written -- one `serde_json::Value` parsed per newline-terminated
//! line read from a `BufRead` -- the same hand-rolled-wire-protocol
//! instinct the teacher applies in its own `protocol.rs`, just swapping
//! length-prefixed MessagePack for newline-delimited JSON because
//! spec.md §4.F mandates that framing. See spec.md §4.F.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use thop_protocol::{
    ErrorPayload, ExecuteArgs, JsonRpcRequest, JsonRpcResponse, NamedSessionArgs,
    ToolCallResult, RPC_INTERNAL_ERROR, RPC_INVALID_PARAMS, RPC_METHOD_NOT_FOUND, RPC_PARSE_ERROR, PROTOCOL_VERSION,
};
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::error::{downcast, ErrorKind};
use crate::manager::SessionManager;
use crate::session::CmdContext;
use crate::state::Store;

const TOOL_NAMES: &[&str] = &["connect", "switch", "close", "status", "execute"];
const RESOURCE_URIS: &[&str] = &["session://active", "session://all", "config://thop", "state://thop"];

pub struct RpcServer {
    manager: Arc<SessionManager>,
    config: Config,
    store: Arc<Store>,
    in_flight: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl RpcServer {
    pub fn new(manager: Arc<SessionManager>, config: Config, store: Arc<Store>) -> RpcServer {
        RpcServer { manager, config, store, in_flight: Mutex::new(HashMap::new()) }
    }

    /// Reads one JSON-RPC frame per line from `input` until EOF, writing
    /// one response frame per line to `output`. Each request that carries
    /// an id dispatches on its own scoped thread instead of inline, so a
    /// long-running tool call (`execute` against a slow SSH command)
    /// can't stall the reader -- a `cancelled` notification for an
    /// earlier request has to reach `in_flight` while that call is still
    /// running, which a sequential read-dispatch-write loop could never
    /// deliver. Never terminates on a tool error; only EOF or an
    /// unrecoverable framing error ends the loop (spec.md §7).
    #[instrument(skip_all)]
    pub fn run<R: BufRead, W: Write + Send>(&self, input: R, output: W) -> anyhow::Result<()> {
        let output = Mutex::new(output);
        let output = &output;

        thread::scope(|scope| -> anyhow::Result<()> {
            for line in input.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }

                let request: JsonRpcRequest = match serde_json::from_str(&line) {
                    Ok(r) => r,
                    Err(e) => {
                        warn!("parse error on incoming frame: {}", e);
                        let resp = JsonRpcResponse::failure(Value::Null, RPC_PARSE_ERROR, format!("parse error: {}", e));
                        write_frame(output, &resp)?;
                        continue;
                    }
                };

                match request.method.as_str() {
                    "initialized" | "cancelled" | "notifications/progress" => {
                        self.handle_notification(&request);
                        continue;
                    }
                    _ => {}
                }

                let Some(id) = request.id.clone() else {
                    warn!("request method {} missing id, treating as notification", request.method);
                    continue;
                };

                scope.spawn(move || {
                    let response = self.dispatch(id.clone(), &request);
                    if let Err(e) = write_frame(output, &response) {
                        warn!("writing response frame: {}", e);
                    }
                });
            }
            Ok(())
        })
    }

    fn handle_notification(&self, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "initialized" => info!("client acknowledged initialize"),
            "cancelled" => {
                if let Some(params) = &request.params {
                    if let Some(target_id) = params.get("id").map(|v| v.to_string()) {
                        if let Some(flag) = self.in_flight.lock().unwrap().get(&target_id) {
                            flag.store(true, Ordering::SeqCst);
                            info!("cancellation requested for in-flight request {}", target_id);
                        }
                    }
                }
            }
            "notifications/progress" => {
                // Pass-through only; thop has no long-running background
                // jobs to report progress for (background=true is
                // rejected outright, see handle_execute).
            }
            _ => {}
        }
    }

    fn dispatch(&self, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": { "tools": {}, "resources": {} },
                    "serverInfo": { "name": "thop", "version": env!("CARGO_PKG_VERSION") },
                }),
            ),
            "ping" => JsonRpcResponse::success(id, json!({ "pong": true })),
            "tools/list" => JsonRpcResponse::success(id, tool_list()),
            "tools/call" => self.handle_tools_call(id, request),
            "resources/list" => JsonRpcResponse::success(id, resource_list()),
            "resources/read" => self.handle_resources_read(id, request),
            other => JsonRpcResponse::failure(id, RPC_METHOD_NOT_FOUND, format!("unknown method: {}", other)),
        }
    }

    fn handle_tools_call(&self, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
        let params = match &request.params {
            Some(p) => p,
            None => return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, "tools/call requires params"),
        };
        let name = match params.get("name").and_then(Value::as_str) {
            Some(n) => n,
            None => return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, "tools/call requires params.name"),
        };
        if !TOOL_NAMES.contains(&name) {
            return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, format!("unknown tool: {}", name));
        }
        let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);

        let id_key = id.to_string();
        let cancel = Arc::new(AtomicBool::new(false));
        self.in_flight.lock().unwrap().insert(id_key.clone(), cancel.clone());

        let result = self.call_tool(name, arguments, cancel);
        self.in_flight.lock().unwrap().remove(&id_key);

        match serde_json::to_value(result) {
            Ok(v) => JsonRpcResponse::success(id, v),
            Err(e) => JsonRpcResponse::failure(id, RPC_INTERNAL_ERROR, format!("serializing tool result: {}", e)),
        }
    }

    fn call_tool(&self, name: &str, arguments: Value, cancel: Arc<AtomicBool>) -> ToolCallResult {
        match name {
            "status" => self.tool_status(),
            "connect" | "switch" | "close" => self.tool_named_session(name, arguments),
            "execute" => self.tool_execute(arguments, cancel),
            _ => unreachable!("checked against TOOL_NAMES above"),
        }
    }

    fn tool_status(&self) -> ToolCallResult {
        let sessions = self.manager.list_sessions();
        match serde_json::to_string(&sessions) {
            Ok(text) => ToolCallResult::ok(text),
            Err(e) => tool_error(ErrorKind::OperationFailed, "", e.to_string(), false, None),
        }
    }

    fn tool_named_session(&self, name: &str, arguments: Value) -> ToolCallResult {
        let args: NamedSessionArgs = match serde_json::from_value(arguments) {
            Ok(a) => a,
            Err(e) => return tool_error(ErrorKind::MissingParameter, "", e.to_string(), false, None),
        };
        let result = match name {
            "connect" => self.manager.connect(&args.name),
            "switch" => self.manager.set_active_session(&args.name),
            "close" => self.manager.disconnect(&args.name),
            _ => unreachable!(),
        };
        match result {
            Ok(()) => ToolCallResult::ok(format!("{} {}: ok", name, args.name)),
            Err(e) => {
                let te = downcast(&e);
                let retryable = te.retryable;
                let suggestion = te.suggestion.clone();
                tool_error(te.kind, &args.name, te.message.clone(), retryable, suggestion)
            }
        }
    }

    fn tool_execute(&self, arguments: Value, cancel: Arc<AtomicBool>) -> ToolCallResult {
        let args: ExecuteArgs = match serde_json::from_value(arguments) {
            Ok(a) => a,
            Err(e) => return tool_error(ErrorKind::MissingParameter, "", e.to_string(), false, None),
        };
        if args.background {
            return tool_error(
                ErrorKind::NotImplemented,
                args.session.as_deref().unwrap_or(""),
                "background execution is reserved but not implemented",
                false,
                None,
            );
        }

        let session_name = args.session.clone().unwrap_or_else(|| self.manager.get_active_session_name());
        let ctx = match args.timeout {
            Some(secs) => CmdContext::with_timeout(Duration::from_secs(secs)),
            None => CmdContext::unbounded(),
        };
        // Splice the server's cancel flag into the context so a
        // `cancelled` notification for this request id can interrupt it.
        let ctx_with_cancel = CmdContext::linked(ctx, cancel);

        match self.manager.execute(&session_name, &args.command, &ctx_with_cancel) {
            Ok(result) => match serde_json::to_string(&result) {
                Ok(text) => ToolCallResult::ok(text),
                Err(e) => tool_error(ErrorKind::OperationFailed, &session_name, e.to_string(), false, None),
            },
            Err(e) => {
                let te = downcast(&e);
                tool_error(te.kind, &session_name, te.message.clone(), te.retryable, te.suggestion.clone())
            }
        }
    }

    fn handle_resources_read(&self, id: Value, request: &JsonRpcRequest) -> JsonRpcResponse {
        let uri = request
            .params
            .as_ref()
            .and_then(|p| p.get("uri"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let Some(uri) = uri else {
            return JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, "resources/read requires params.uri");
        };

        let body = match uri.as_str() {
            "session://active" => {
                let name = self.manager.get_active_session_name();
                self.manager.get_session_snapshot(&name).ok().map(|s| json!(s))
            }
            "session://all" => Some(json!(self.manager.list_sessions())),
            "config://thop" => serde_json::to_value(&self.config).ok(),
            "state://thop" => Some(json!(self.store.snapshot())),
            _ => None,
        };

        match body {
            Some(value) => JsonRpcResponse::success(id, json!({ "uri": uri, "contents": [ { "uri": uri, "text": value.to_string() } ] })),
            None => JsonRpcResponse::failure(id, RPC_INVALID_PARAMS, format!("unknown resource: {}", uri)),
        }
    }
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "connect",
                "description": "Connect a named session (no-op if already connected).",
                "inputSchema": { "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] },
            },
            {
                "name": "switch",
                "description": "Set the active session, connecting it first if needed.",
                "inputSchema": { "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] },
            },
            {
                "name": "close",
                "description": "Disconnect a named session. Cannot close the local session.",
                "inputSchema": { "type": "object", "properties": { "name": { "type": "string" } }, "required": ["name"] },
            },
            {
                "name": "status",
                "description": "List every configured session and its connection state.",
                "inputSchema": { "type": "object", "properties": {} },
            },
            {
                "name": "execute",
                "description": "Run a command in a session (the active one by default).",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "command": { "type": "string" },
                        "session": { "type": "string" },
                        "timeout": { "type": "integer" },
                        "background": { "type": "boolean" },
                    },
                    "required": ["command"],
                },
            },
        ]
    })
}

fn resource_list() -> Value {
    json!({
        "resources": RESOURCE_URIS.iter().map(|uri| json!({ "uri": uri })).collect::<Vec<_>>()
    })
}

fn tool_error(kind: ErrorKind, session: &str, message: impl Into<String>, retryable: bool, suggestion: Option<String>) -> ToolCallResult {
    let message = message.into();
    let mut payload = ErrorPayload { code: kind, message: message.clone(), session: session.to_string(), retryable, suggestion };
    if payload.suggestion.is_none() && kind == ErrorKind::AuthPasswordRequired {
        payload.suggestion = Some("Check network connectivity and firewall settings".to_string());
    }
    ToolCallResult::err(message, payload)
}

fn write_frame<W: Write>(output: &Mutex<W>, response: &JsonRpcResponse) -> anyhow::Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    let mut output = output.lock().unwrap();
    output.write_all(line.as_bytes())?;
    output.flush()?;
    Ok(())
}

