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
/// thop is a shell-session multiplexer that lets a human operator or an
/// AI agent execute commands against one of several named execution
/// contexts -- a local shell or a remote shell reached over SSH --
/// while keeping each context's working directory, environment, and
/// connection state persistent across commands and program restarts.
use clap::Parser;

fn main() -> anyhow::Result<()> {
    let args = libthop::Args::parse();
    libthop::run(args)
}
