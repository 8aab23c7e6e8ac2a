use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::display::theme;
use crate::event::AppEvent;
use crate::protocol::emit::format_user_message;
use crate::protocol::types::InboundEvent;
use crate::session::bridge::SessionConfig;
use crate::session::driver::{Flow, RequestNotice, SessionDriver};
use crate::session::message::{ContentBlock, Role};
use crate::session::pending::{PermissionDecision, QuestionDecision, QuestionItem};
use crate::session::registry::SessionRegistry;
use crate::session::runner::{AgentCommand, AgentRunner};
use crate::session::state::SessionStatus;

pub struct RunOptions {
    pub prompt: String,
    pub model: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Agent-side session id to continue.
    pub resume: Option<String>,
    /// Tools approved without asking.
    pub allow: Vec<String>,
    pub agent_args: Vec<String>,
}

/// Run one prompt through the agent. Permission requests for tools outside
/// `allow` and clarification questions are asked on the terminal.
pub async fn run(opts: RunOptions, config: &Config) -> Result<SessionStatus> {
    let model = opts
        .model
        .or_else(|| config.default_model.clone())
        .context("no model given; pass --model or set default_model in the config")?;
    let cwd = match opts.cwd {
        Some(cwd) => cwd,
        None => std::env::current_dir().context("resolving working directory")?,
    };

    let registry = Arc::new(SessionRegistry::new(config.history_dir.clone()));
    registry.load_known_sessions().await?;
    let (session_id, bridge) = registry
        .create_session(SessionConfig {
            cwd: Some(cwd.clone()),
            model: Some(model.clone()),
            resume_session_id: opts.resume.clone(),
            history_path: None,
        })
        .await?;

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (event_tx, mut events) = mpsc::unbounded_channel();
    let mut command = AgentCommand::claude(&model, opts.resume.as_deref(), &opts.agent_args);
    command.cwd = Some(cwd);
    let mut runner = AgentRunner::spawn(&command, outbound_rx, event_tx)?;
    outbound_tx
        .send(format_user_message(&opts.prompt)?)
        .context("agent input closed before the prompt was sent")?;

    let (notice_tx, notices) = mpsc::unbounded_channel();
    let driver = SessionDriver::new(bridge.clone(), outbound_tx)
        .with_known_sessions(registry.known_sessions())
        .with_notices(notice_tx);
    let prompter = tokio::spawn(prompt_loop(
        Arc::clone(&registry),
        session_id.clone(),
        notices,
        opts.allow,
    ));

    while let Some(event) = events.recv().await {
        let turn_done = matches!(&event, AppEvent::Agent(e) if matches!(**e, InboundEvent::Result(_)));
        if driver.handle(event).await == Flow::Ended {
            break;
        }
        if turn_done {
            runner.close_input();
        }
    }
    prompter.abort();

    let status = {
        let bridge = bridge.lock().await;
        for turn in bridge.messages().iter().filter(|t| t.role == Role::Assistant) {
            for block in &turn.blocks {
                if let ContentBlock::Text { text } = block {
                    println!("{text}");
                }
            }
        }
        let usage = bridge.usage();
        eprintln!(
            "{}",
            theme::dim().apply(format!(
                "${:.2} · {} turns · {} tokens",
                usage.total_cost_usd,
                usage.num_turns,
                usage.total_tokens()
            ))
        );
        bridge.status()
    };
    registry.remove(&session_id).await?;
    info!(session_id = %session_id, status = ?status, "run finished");
    Ok(status)
}

/// Answer parked requests from the terminal, one at a time.
async fn prompt_loop(
    registry: Arc<SessionRegistry>,
    session_id: String,
    mut notices: mpsc::UnboundedReceiver<RequestNotice>,
    allow: Vec<String>,
) {
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(notice) = notices.recv().await {
        let resolved = match notice {
            RequestNotice::Permission { token, request } => {
                let decision = if allow.iter().any(|t| t == &request.tool_name) {
                    PermissionDecision::Allow
                } else {
                    eprintln!(
                        "{} {} {}",
                        theme::user_role().apply("allow"),
                        request.tool_name,
                        theme::dim().apply(compact(&request.tool_input)),
                    );
                    if let Some(reason) = &request.reason {
                        eprintln!("  {}", theme::dim().apply(reason));
                    }
                    eprint!("[y/N] ");
                    match stdin.next_line().await {
                        Ok(Some(line)) if line.trim().eq_ignore_ascii_case("y") => {
                            PermissionDecision::Allow
                        }
                        _ => PermissionDecision::Deny { message: None },
                    }
                };
                registry.resolve_permission(&session_id, &token, decision).await
            }
            RequestNotice::Question { token, request } => {
                let mut answers = Vec::with_capacity(request.questions.len());
                for item in &request.questions {
                    eprintln!("{}", theme::user_role().apply(&item.question));
                    for (i, option) in item.options.iter().enumerate() {
                        eprintln!("  {}. {}", i + 1, option.label);
                    }
                    match stdin.next_line().await {
                        Ok(Some(line)) => answers.push(parse_selection(&line, item)),
                        _ => break,
                    }
                }
                let decision = if answers.len() == request.questions.len() {
                    QuestionDecision::Answered(answers)
                } else {
                    QuestionDecision::Cancelled
                };
                match registry.resolve_question(&session_id, &token, decision).await {
                    Err(e) => {
                        eprintln!("{}", theme::error().apply(e.to_string()));
                        registry
                            .resolve_question(&session_id, &token, QuestionDecision::Cancelled)
                            .await
                    }
                    ok => ok,
                }
            }
        };
        if let Err(e) = resolved {
            warn!(error = %e, "could not resolve request");
        }
    }
}

/// Turn `"1, Search"` into option labels: numbers pick by position, anything
/// else is taken as a label.
pub fn parse_selection(line: &str, item: &QuestionItem) -> Vec<String> {
    line.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .ok()
                .and_then(|n| n.checked_sub(1))
                .and_then(|i| item.options.get(i))
                .map_or_else(|| s.to_string(), |o| o.label.clone())
        })
        .collect()
}

fn compact(input: &Value) -> String {
    let text = input.to_string();
    if text.chars().count() > 120 {
        let cut: String = text.chars().take(117).collect();
        format!("{cut}...")
    } else {
        text
    }
}
