//! `colloquy multi`

use std::collections::HashSet;

use anyhow::bail;
use clap::Args;
use colloquy_client::{MultiCharacterController, MultiCharacterState};
use colloquy_protocol::{CharacterStatus, MultiCharacterMode};
use console::style;
use tokio::sync::watch;

use crate::render;
use crate::session::Session;

const PANEL_ID: &str = "multi_character";

#[derive(Args)]
pub struct MultiArgs {
    /// Characters taking part, in speaking order
    #[arg(long, short, value_delimiter = ',', required = true)]
    pub characters: Vec<String>,

    /// sequential, simultaneous, discussion or moderated
    #[arg(long, short, default_value = "sequential", value_parser = parse_mode)]
    pub mode: MultiCharacterMode,

    /// Prompt for the first round
    pub message: String,

    /// Prompt for each following round, one per flag
    #[arg(long = "then")]
    pub follow_ups: Vec<String>,
}

fn parse_mode(raw: &str) -> Result<MultiCharacterMode, String> {
    raw.parse()
}

pub async fn run(session: &Session, args: MultiArgs) -> anyhow::Result<()> {
    let controller =
        MultiCharacterController::new(session.ctx.clone(), PANEL_ID, session.character_or_default());
    let mut state = controller.subscribe();

    let round = controller.snapshot().round_number;
    controller
        .start_session(args.characters.clone(), args.mode, &args.message)
        .await?;
    await_round(&controller, &mut state, round).await?;

    for prompt in &args.follow_ups {
        let round = controller.snapshot().round_number;
        controller.send_message(prompt).await?;
        await_round(&controller, &mut state, round).await?;
    }
    Ok(())
}

/// Report each character as it finishes, then print the round summary once
/// the round has run (or the counter moved past `previous_round` before we
/// saw it start).
async fn await_round(
    controller: &MultiCharacterController,
    state: &mut watch::Receiver<MultiCharacterState>,
    previous_round: u32,
) -> anyhow::Result<()> {
    let mut announced = HashSet::new();
    let mut current_turn: Option<String> = None;
    let mut seen_active = false;

    loop {
        let (done, failure) = {
            let current = state.borrow_and_update();
            seen_active |= current.is_active;

            if current.current_character != current_turn {
                current_turn = current.current_character.clone();
                if let Some(id) = &current_turn {
                    eprintln!("{} {}", style("›").cyan(), style(id).bold());
                }
            }
            // Slots left over from the previous round stay until the next
            // start event, so only report while the round is live.
            let live = current.is_active.then_some(current.responses.as_slice());
            for response in live.unwrap_or_default() {
                let finished = matches!(
                    response.status,
                    CharacterStatus::Complete | CharacterStatus::Error
                );
                if finished && announced.insert(response.character_id.clone()) {
                    let mark = match response.status {
                        CharacterStatus::Complete => style("✓").green(),
                        _ => style("✗").red(),
                    };
                    eprintln!("{mark} {}", response.character_id);
                }
            }

            let settled =
                (seen_active || current.round_number != previous_round) && !current.is_active;
            (settled, current.error.clone())
        };
        if let Some(error) = failure {
            bail!(error);
        }
        if done {
            break;
        }

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    bail!("controller dropped");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                controller.reset();
                bail!("cancelled");
            }
        }
    }

    let snapshot = controller.snapshot();
    println!(
        "{}",
        style(format!("Round {}", snapshot.round_number)).bold()
    );
    println!("{}", render::multi_character_table(&controller.get_all_responses()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_is_case_insensitive() {
        assert_eq!(parse_mode("Moderated"), Ok(MultiCharacterMode::Moderated));
        assert!(parse_mode("round-robin").is_err());
    }
}
