// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "maestro",
    about = "An orchestration server for interactive AI coding assistant CLIs",
    version
)]
pub struct Cli {
    /// Explicit config file (merged over the discovered layers)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log to stderr (otherwise only MAESTRO_LOG_FILE receives logs)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the kernel with a stdio control loop: one ControlMessage JSON
    /// object per stdin line, one StreamEvent JSON object per stdout line.
    /// (The HTTP/WebSocket transport terminates into the same loop.)
    Serve,

    /// Inspect and manage stored sessions
    Sessions {
        #[command(subcommand)]
        command: SessionCommands,
    },

    /// Print the merged configuration
    ShowConfig,

    /// Classify a prompt the way the lead orchestrator would
    Classify {
        /// The prompt text
        prompt: String,
    },
}

#[derive(Subcommand)]
pub enum SessionCommands {
    /// List sessions, most recently updated first
    List {
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Print one session as JSON
    Show { id: String },
    /// Delete a session
    Delete { id: String },
    /// Export a session dump to stdout
    Export { id: String },
    /// Import a session dump from a file (assigns a fresh id)
    Import { path: PathBuf },
}
