use anyhow::{Context, Result};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::json;

use crate::config::RuntimeConfig;
use crate::error::format_cli_error;
use crate::node::Node;
use crate::runner::{Runner, report_result};
use crate::telemetry::TelemetrySink;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Exit,
    Help,
    Status,
    State,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedChatCommand {
    NotACommand,
    Command(ChatCommand),
    UnknownCommand(String),
}

pub fn parse_chat_command(input: &str) -> ParsedChatCommand {
    let trimmed = input.trim();

    if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
        return ParsedChatCommand::Command(ChatCommand::Exit);
    }

    let Some(slashless) = trimmed.strip_prefix('/') else {
        return ParsedChatCommand::NotACommand;
    };

    let command = slashless
        .split_whitespace()
        .next()
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();

    match command.as_str() {
        "exit" | "quit" => ParsedChatCommand::Command(ChatCommand::Exit),
        "help" => ParsedChatCommand::Command(ChatCommand::Help),
        "status" => ParsedChatCommand::Command(ChatCommand::Status),
        "state" => ParsedChatCommand::Command(ChatCommand::State),
        other => ParsedChatCommand::UnknownCommand(format!("/{other}")),
    }
}

pub fn print_chat_help() {
    println!("Chat commands:");
    println!("- /help: show command quick reference");
    println!("- /status: show pipeline and session");
    println!("- /state: print the session state");
    println!("- exit, quit or /exit: leave chat (Ctrl-D works too)");
}

/// Reads prompts until exit and runs each through `root` over one session.
/// A failed run is reported and the loop continues.
pub async fn run_chat(
    cfg: &RuntimeConfig,
    runner: &Runner,
    root: &Node,
    telemetry: &TelemetrySink,
) -> Result<()> {
    let mut editor = DefaultEditor::new().context("failed to initialize line editor")?;

    telemetry.emit(
        "chat.started",
        json!({ "pipeline": root.name(), "profile": cfg.profile }),
    );
    println!(
        "Interactive mode started with pipeline '{}'. Type /help for commands or exit to quit.",
        root.name()
    );

    let mut turns = 0usize;
    loop {
        let line = match editor.readline("pipeline> ") {
            Ok(line) => line,
            Err(ReadlineError::Eof | ReadlineError::Interrupted) => break,
            Err(err) => return Err(err).context("failed to read input from terminal"),
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        match parse_chat_command(input) {
            ParsedChatCommand::NotACommand => {}
            ParsedChatCommand::UnknownCommand(command) => {
                println!("Unknown command {command}. Type /help.");
                continue;
            }
            ParsedChatCommand::Command(ChatCommand::Exit) => break,
            ParsedChatCommand::Command(ChatCommand::Help) => {
                print_chat_help();
                continue;
            }
            ParsedChatCommand::Command(ChatCommand::Status) => {
                println!(
                    "Pipeline: {} | app={} user={} session={} backend={}",
                    root.name(),
                    cfg.app_name,
                    cfg.user_id,
                    cfg.session_id,
                    runner.store().backend_name()
                );
                continue;
            }
            ParsedChatCommand::Command(ChatCommand::State) => {
                print_session_state(cfg, runner).await?;
                continue;
            }
        }

        turns += 1;
        let result = runner
            .run(root, &cfg.user_id, &cfg.session_id, input)
            .await;
        if let Err(err) = report_result(root.name(), &result, false) {
            eprintln!("{}", format_cli_error(&err, cfg.show_sensitive_config));
        }
    }

    telemetry.emit("chat.completed", json!({ "turns": turns }));
    println!("Goodbye.");
    Ok(())
}

async fn print_session_state(cfg: &RuntimeConfig, runner: &Runner) -> Result<()> {
    let key = crate::session::SessionKey::new(
        cfg.app_name.clone(),
        cfg.user_id.clone(),
        cfg.session_id.clone(),
    );
    match runner.store().get(&key).await {
        Ok(session) => {
            let state = serde_json::Value::Object(session.state().snapshot());
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Err(_) => println!("Session '{}' has no state yet.", cfg.session_id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_words_and_slash_commands_parse() {
        assert_eq!(
            parse_chat_command("  QUIT "),
            ParsedChatCommand::Command(ChatCommand::Exit)
        );
        assert_eq!(
            parse_chat_command("/state"),
            ParsedChatCommand::Command(ChatCommand::State)
        );
        assert_eq!(
            parse_chat_command("/nope now"),
            ParsedChatCommand::UnknownCommand("/nope".to_string())
        );
        assert_eq!(
            parse_chat_command("what time is it?"),
            ParsedChatCommand::NotACommand
        );
    }
}
