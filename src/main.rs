// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2025 Blackman Artificial Intelligence Technologies Inc.

//! parley - stream a chat submission from the terminal
//!
//! Entry point for the parley CLI.

use std::io::{self, Read, Write};
use std::sync::Arc;

use clap::Parser;

use parley::cli::Cli;
use parley::config::Settings;
use parley::error::{ParleyError, Result};
use parley::llm::{HttpTransport, ResilientTransport};
use parley::pipeline::{
    ChatPipeline, DefaultRequestBuilder, LogFinalizer, PipelineOptions, PipelineSnapshot,
    PipelineStatus, PrepareParams, StaticPreparer,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::WARN.into());

    // `-v` turns on pipeline diagnostics; `RUST_LOG` still takes precedence.
    if cli.verbose > 0 {
        let level = if cli.verbose > 1 { "trace" } else { "debug" };
        for target in ["parley.pipeline", "parley.llm"] {
            if let Ok(parsed) = format!("{target}={level}").parse() {
                env_filter = env_filter.add_directive(parsed);
            }
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(io::stderr)
        .init();

    let mut settings = match &cli.config {
        Some(path) => Settings::load_from(path)?,
        None => Settings::load()?,
    };
    cli.apply_overrides(&mut settings);
    settings.validate()?;

    let prompt = match &cli.prompt {
        Some(prompt) => prompt.clone(),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            buffer
        }
    };
    if prompt.trim().is_empty() {
        return Err(ParleyError::Config("empty prompt".to_string()));
    }

    let transport = ResilientTransport::new(HttpTransport::from_settings(&settings), &settings.resilience);
    let mut preparer = StaticPreparer::new(settings.provider.model.clone());
    if let Some(system) = &cli.system {
        preparer = preparer.with_system_prompt(system.clone());
    }

    let pipeline = Arc::new(
        ChatPipeline::new(Arc::new(transport), Arc::new(preparer), Arc::new(LogFinalizer))
            .with_request_builder(Arc::new(DefaultRequestBuilder::from_config(&settings.provider)))
            .with_options(PipelineOptions::from(&settings.tools)),
    );

    let interrupt = Arc::clone(&pipeline);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let mut subscription = pipeline.subscribe();
    let show_reasoning = cli.show_reasoning;
    let printer = tokio::spawn(async move {
        let mut printer = DeltaPrinter::new(show_reasoning);
        while let Some(snapshot) = subscription.recv().await {
            printer.print(&snapshot);
            if snapshot.status.is_terminal() {
                break;
            }
        }
    });

    let result = pipeline.start(PrepareParams::new(prompt)).await;
    let _ = printer.await;
    println!();

    match result {
        Ok(context) => {
            if let Some(usage) = context.streaming.as_ref().and_then(|s| s.usage) {
                tracing::info!(
                    target: "parley.pipeline.machine",
                    prompt_tokens = usage.prompt_tokens,
                    completion_tokens = usage.completion_tokens,
                    total_tokens = usage.total_tokens,
                    "usage"
                );
            }
            Ok(())
        }
        Err(ParleyError::Cancelled) => {
            eprintln!("Request aborted");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Prints only what each snapshot adds to the previous one
struct DeltaPrinter {
    show_reasoning: bool,
    turn: u32,
    content_printed: usize,
    reasoning_printed: usize,
}

impl DeltaPrinter {
    fn new(show_reasoning: bool) -> Self {
        Self {
            show_reasoning,
            turn: 0,
            content_printed: 0,
            reasoning_printed: 0,
        }
    }

    fn print(&mut self, snapshot: &PipelineSnapshot) {
        if snapshot.status != PipelineStatus::Streaming {
            return;
        }
        let Some(streaming) = snapshot.context.streaming.as_ref() else {
            return;
        };
        if streaming.turns != self.turn {
            self.turn = streaming.turns;
            self.content_printed = 0;
        }

        if self.show_reasoning {
            let reasoning = streaming.reasoning();
            if let Some(delta) = reasoning.get(self.reasoning_printed..) {
                if !delta.is_empty() {
                    eprint!("{delta}");
                    self.reasoning_printed = reasoning.len();
                }
            }
        }

        let content = &streaming.turn_content;
        if let Some(delta) = content.get(self.content_printed..) {
            if !delta.is_empty() {
                print!("{delta}");
                let _ = io::stdout().flush();
                self.content_printed = content.len();
            }
        }
    }
}
