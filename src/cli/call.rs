//! `call`: one prompt through one role

use crate::loader::load_settings;
use crate::relay::build_relay;
use anyhow::{Context, Result};
use clap::Args;
use futures::StreamExt;
use modelrelay_llm::{CallOptions, ChatOptions, Message, StreamChunk};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Role to route through
    #[arg(short, long)]
    pub role: String,

    /// User prompt
    #[arg(short, long)]
    pub prompt: String,

    /// Optional system prompt
    #[arg(long)]
    pub system: Option<String>,

    /// Stream tokens as they arrive (primary target only, no fallback)
    #[arg(long)]
    pub stream: bool,

    /// Project tag for accounting
    #[arg(long)]
    pub project: Option<String>,

    /// Maximum output tokens
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Sampling temperature
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Abandon the call after this many seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl CallArgs {
    fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(self.prompt.clone()));
        messages
    }

    fn options(&self, cancel: CancellationToken) -> CallOptions {
        let mut options = CallOptions::default()
            .with_chat(ChatOptions {
                max_tokens: self.max_tokens,
                temperature: self.temperature,
                ..Default::default()
            })
            .with_cancel(cancel);
        if let Some(project) = &self.project {
            options = options.with_project(project.clone());
        }
        if let Some(secs) = self.timeout_secs {
            options = options.with_timeout(Duration::from_secs(secs));
        }
        options
    }
}

pub async fn run(config: Option<&Path>, args: CallArgs) -> Result<()> {
    let relay = build_relay(load_settings(config)?)?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let options = args.options(cancel);
    if args.stream {
        let mut stream = relay
            .router
            .stream(&args.role, args.messages(), options)
            .await
            .with_context(|| format!("Stream for role {} failed", args.role))?;

        let mut stdout = std::io::stdout();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Delta { content } => {
                    print!("{content}");
                    stdout.flush()?;
                }
                StreamChunk::Done {
                    tokens,
                    cost,
                    provider,
                    model,
                    latency_ms,
                    ..
                } => {
                    println!();
                    eprintln!(
                        "[{provider}/{model}] {} tokens, ${:.6}, {latency_ms}ms",
                        tokens.total,
                        cost.unwrap_or(0.0)
                    );
                }
            }
        }
        return Ok(());
    }

    let response = relay
        .router
        .call_by_role(&args.role, args.messages(), options)
        .await
        .with_context(|| format!("Call for role {} failed", args.role))?;

    println!("{}", response.content);
    eprintln!(
        "[{}/{}] {} tokens, ${:.6}, {}ms, attempts {}{}",
        response.provider,
        response.model,
        response.tokens.total,
        response.cost_or_zero(),
        response.latency_ms,
        response.metadata.attempts,
        if response.metadata.fallback_used {
            format!(", fallback #{}", response.metadata.fallback_index)
        } else {
            String::new()
        }
    );
    Ok(())
}
