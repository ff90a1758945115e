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

use std::time;

/// Default command timeout, used when a session config doesn't override it.
pub const DEFAULT_TIMEOUT: time::Duration = time::Duration::from_secs(300);

/// Default SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// How often a local command's timeout watchdog thread polls for the
/// deadline or a cancellation request.
pub const WATCHDOG_POLL_DURATION: time::Duration = time::Duration::from_millis(100);

pub const BUF_SIZE: usize = 1024 * 16;

/// Default number of SSH reconnect attempts before surfacing ConnectionFailed.
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;

/// Base for the exponential reconnect backoff, in seconds.
pub const DEFAULT_RECONNECT_BACKOFF_BASE: u64 = 2;

/// Reconnect backoff is capped at this many seconds.
pub const MAX_RECONNECT_BACKOFF: time::Duration = time::Duration::from_secs(60);

/// The name every SessionManager seeds unless configuration overrides it.
pub const LOCAL_SESSION_NAME: &str = "local";

pub const DEFAULT_TERM: &str = "xterm-256color";
