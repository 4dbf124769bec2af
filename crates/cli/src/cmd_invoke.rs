//! `colloquy invoke` and `colloquy chat`

use anyhow::{anyhow, bail};
use clap::{Args, ValueEnum};
use colloquy_client::features::{
    ContentAnalysisFeature, Feature, HeadlineFeature, ProfileFeature, ProposalFeature,
    ViralPostFeature,
};
use colloquy_client::{FeatureController, InvocationPhase, InvocationState, StreamingController};
use console::style;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::info;

use crate::render::{self, StreamPrinter};
use crate::session::Session;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FeatureKind {
    Content,
    Headline,
    Profile,
    Proposal,
    Viral,
}

#[derive(Args)]
pub struct InvokeArgs {
    /// Feature panel to drive
    #[arg(value_enum)]
    pub feature: FeatureKind,

    /// Tool to invoke (defaults to the feature's first tool)
    #[arg(long, short)]
    pub tool: Option<String>,

    /// Tool argument as key=value; values parse as JSON, else as a string
    #[arg(long = "arg", short = 'a', value_parser = parse_key_value)]
    pub args: Vec<(String, Value)>,

    /// Print only the structured result as JSON
    #[arg(long)]
    pub json: bool,
}

impl InvokeArgs {
    fn arguments(&self) -> Map<String, Value> {
        self.args.iter().cloned().collect()
    }
}

fn parse_key_value(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("missing key in `{raw}`"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

pub async fn run(session: &Session, args: InvokeArgs, follow_up: bool) -> anyhow::Result<()> {
    match args.feature {
        FeatureKind::Content => drive::<ContentAnalysisFeature>(session, args, follow_up).await,
        FeatureKind::Headline => drive::<HeadlineFeature>(session, args, follow_up).await,
        FeatureKind::Profile => drive::<ProfileFeature>(session, args, follow_up).await,
        FeatureKind::Proposal => drive::<ProposalFeature>(session, args, follow_up).await,
        FeatureKind::Viral => drive::<ViralPostFeature>(session, args, follow_up).await,
    }
}

fn resolve_tool<F: Feature>(requested: Option<&str>) -> anyhow::Result<&'static str> {
    match requested {
        None => F::TOOLS
            .first()
            .copied()
            .ok_or_else(|| anyhow!("panel {} has no tools", F::PANEL_ID)),
        Some(name) => F::TOOLS.iter().copied().find(|t| *t == name).ok_or_else(|| {
            anyhow!(
                "tool `{name}` is not available on {} (expected one of: {})",
                F::PANEL_ID,
                F::TOOLS.join(", ")
            )
        }),
    }
}

async fn drive<F: Feature>(
    session: &Session,
    args: InvokeArgs,
    follow_up: bool,
) -> anyhow::Result<()> {
    let tool = resolve_tool::<F>(args.tool.as_deref())?;
    let character = session
        .character
        .clone()
        .unwrap_or_else(|| F::CHARACTER_ID.to_string());

    let feature = FeatureController::<F>::with_character(session.ctx.clone(), character);
    let controller = feature.controller();
    let mut state = controller.subscribe();

    let conversation_id = controller.invoke_tool(tool, args.arguments()).await?;
    info!(
        component = "cli",
        event = "cli.invoke.sent",
        panel_id = F::PANEL_ID,
        tool_name = tool,
        conversation_id = %conversation_id,
    );
    await_outcome(controller, &mut state, args.json).await?;

    if !follow_up {
        return Ok(());
    }

    eprintln!(
        "{}",
        style("Follow-ups go to the same conversation. /reset clears results, empty line or /quit exits.")
            .dim()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("{} ", style("you ›").cyan().bold());
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match line.trim() {
            "" | "/quit" => break,
            "/reset" => {
                controller.reset();
                eprintln!("{}", style("results cleared").dim());
            }
            text => {
                controller.send_follow_up_message(text).await?;
                if let Err(e) = await_outcome(controller, &mut state, args.json).await {
                    // Keep the session open; the next message can still succeed.
                    eprintln!("{} {e}", style("error:").red().bold());
                }
            }
        }
    }
    Ok(())
}

/// Stream content until the invocation completes or fails. Ctrl+C cancels.
async fn await_outcome(
    controller: &StreamingController,
    state: &mut watch::Receiver<InvocationState>,
    json: bool,
) -> anyhow::Result<()> {
    let mut printer = StreamPrinter::default();
    if json {
        printer.mute();
    }

    loop {
        let failure = {
            let current = state.borrow_and_update();
            printer.update(&current.streaming_content);
            match &current.phase {
                InvocationPhase::Complete => break,
                InvocationPhase::Error { message } => Some(message.clone()),
                _ => None,
            }
        };
        if let Some(message) = failure {
            printer.finish();
            bail!(message);
        }

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    bail!("controller dropped");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                printer.finish();
                controller.reset();
                bail!("cancelled");
            }
        }
    }

    printer.finish();
    render::print_outcome(&controller.snapshot(), json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_value_parses_json_then_falls_back_to_string() {
        assert_eq!(
            parse_key_value("goals=[\"reach\",\"hire\"]").unwrap(),
            ("goals".into(), json!(["reach", "hire"]))
        );
        assert_eq!(
            parse_key_value("platform=linkedin").unwrap(),
            ("platform".into(), json!("linkedin"))
        );
        assert_eq!(
            parse_key_value("headline=a = b").unwrap(),
            ("headline".into(), json!("a = b"))
        );
        assert!(parse_key_value("no-separator").is_err());
        assert!(parse_key_value("=value").is_err());
    }

    #[test]
    fn tool_defaults_to_first_and_rejects_foreign_tools() {
        assert_eq!(resolve_tool::<HeadlineFeature>(None).unwrap(), "analyze_headline");
        assert_eq!(
            resolve_tool::<ProposalFeature>(Some("refine_proposal")).unwrap(),
            "refine_proposal"
        );
        let err = resolve_tool::<HeadlineFeature>(Some("generate_proposal")).unwrap_err();
        assert!(err.to_string().contains("analyze_headline, generate_headline"));
    }
}
