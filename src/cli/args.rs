// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! CLI argument definitions using Clap

use clap::Parser;
use std::path::PathBuf;

use crate::config::Settings;

/// parley - stream one chat submission to an OpenAI-compatible endpoint
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about = "Stream one chat submission to an LLM provider")]
pub struct Cli {
    /// Prompt to send (reads stdin when omitted)
    pub prompt: Option<String>,

    /// Model to use
    #[arg(short, long)]
    pub model: Option<String>,

    /// Provider base URL
    #[arg(long)]
    pub base_url: Option<String>,

    /// System prompt
    #[arg(short, long)]
    pub system: Option<String>,

    /// Request a single JSON response instead of a stream
    #[arg(long)]
    pub no_stream: bool,

    /// Show reasoning output on stderr
    #[arg(long)]
    pub show_reasoning: bool,

    /// Config file path
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Fold command-line overrides into loaded settings
    pub fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(model) = &self.model {
            settings.provider.model = model.clone();
        }
        if let Some(base_url) = &self.base_url {
            settings.provider.base_url = base_url.clone();
        }
        if self.no_stream {
            settings.provider.stream = false;
        }
    }
}
