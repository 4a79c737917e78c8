use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use easel_contracts::config::EngineConfig;
use easel_contracts::prompt::{Role, TargetModel};
use easel_contracts::session::generate_session_id;
use easel_engine::feedback::CancelFlag;
use easel_engine::{EngineProviders, StudioEngine, TurnOutcome};
use serde_json::Value;

#[derive(Debug, Parser)]
#[command(name = "easel", version, about = "Conversational image studio")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat session.
    Chat(ChatArgs),
    /// One prompt, one image, exit.
    Run(RunArgs),
    /// Print the turn log of a session.
    History(SessionArgs),
    /// Delete a session.
    Clear(SessionArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long, default_value = ".easel")]
    out: PathBuf,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Offline providers regardless of configured API keys.
    #[arg(long)]
    dryrun: bool,
    #[arg(long, default_value = "sdxl")]
    target: String,
}

#[derive(Debug, Parser)]
struct RunArgs {
    #[arg(long)]
    prompt: String,
    #[arg(long, default_value = ".easel")]
    out: PathBuf,
    #[arg(long)]
    session: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    dryrun: bool,
    #[arg(long, default_value = "sdxl")]
    target: String,
}

#[derive(Debug, Parser)]
struct SessionArgs {
    #[arg(long, default_value = ".easel")]
    out: PathBuf,
    #[arg(long)]
    session: String,
}

const CHAT_HELP: &str = "\
/help                 show this message
/history              print the session turn log
/clear                reset the session
/feedback on|off      toggle visual feedback
/retries N            corrective re-render budget
/model DIALECT        sdxl | gpt-image | flux (new scenes only)
/save PATH            copy the last image to PATH
/quit                 leave the chat";

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("easel error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Chat(args) => {
            run_chat(args)?;
            Ok(0)
        }
        Command::Run(args) => run_once(args),
        Command::History(args) => {
            run_history(args)?;
            Ok(0)
        }
        Command::Clear(args) => {
            run_clear(args)?;
            Ok(0)
        }
    }
}

fn build_engine(
    out: &Path,
    config_path: Option<&Path>,
    dryrun: bool,
    target: &str,
) -> Result<StudioEngine> {
    let config = match config_path {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    let Some(target) = TargetModel::parse(target) else {
        bail!("unknown target dialect '{target}' (expected sdxl, gpt-image or flux)");
    };
    let providers = if dryrun {
        EngineProviders::dryrun()
    } else {
        EngineProviders::from_env()
    };
    Ok(StudioEngine::new(out, &config, providers, target))
}

fn run_chat(args: ChatArgs) -> Result<()> {
    let mut engine = build_engine(&args.out, args.config.as_deref(), args.dryrun, &args.target)?;
    let session_id = args.session.unwrap_or_else(generate_session_id);

    println!("Easel chat started (session {session_id}). Type /help for commands.");

    let stdin = io::stdin();
    let mut line = String::new();
    let mut last_artifact: Option<PathBuf> = None;

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match parse_slash(input) {
                Ok(SlashCommand::Quit) => break,
                Ok(command) => {
                    if let Err(err) =
                        handle_slash(command, &mut engine, &session_id, &mut last_artifact)
                    {
                        println!("{err:#}");
                    }
                }
                Err(err) => println!("{err:#}"),
            }
            continue;
        }

        match engine.handle_turn(&session_id, input, &CancelFlag::new()) {
            Ok(outcome) => print_outcome(&outcome, &mut last_artifact),
            // Committed state survives a failed turn; keep the session open.
            Err(err) => println!("Turn failed: {err:#}"),
        }
    }

    Ok(())
}

fn run_once(args: RunArgs) -> Result<i32> {
    let engine = build_engine(&args.out, args.config.as_deref(), args.dryrun, &args.target)?;
    let session_id = args.session.unwrap_or_else(generate_session_id);
    let outcome = engine.handle_turn(&session_id, &args.prompt, &CancelFlag::new())?;

    let mut last_artifact = None;
    print_outcome(&outcome, &mut last_artifact);
    match outcome {
        TurnOutcome::Generated { resolved: true, .. } | TurnOutcome::Answered { .. } => Ok(0),
        TurnOutcome::Generated { .. } => Ok(2),
    }
}

fn run_history(args: SessionArgs) -> Result<()> {
    let engine = build_engine(&args.out, None, true, "sdxl")?;
    let state = engine.memory().snapshot(&args.session)?;
    if state.turns.is_empty() {
        println!("Session {} has no turns.", args.session);
        return Ok(());
    }
    for turn in &state.turns {
        let role = match turn.role {
            Role::User => "user",
            Role::Agent => "easel",
        };
        match turn.resulting_prompt_version {
            Some(version) => println!("[{role}] (v{version}) {}", turn.text),
            None => println!("[{role}] {}", turn.text),
        }
    }
    if let Some(prompt) = &state.current_prompt {
        println!("current prompt v{}: {}", prompt.version, prompt.render_text());
    }
    Ok(())
}

fn run_clear(args: SessionArgs) -> Result<()> {
    let engine = build_engine(&args.out, None, true, "sdxl")?;
    engine.memory().clear(&args.session)?;
    println!("Session {} cleared.", args.session);
    Ok(())
}

#[derive(Debug, PartialEq)]
enum SlashCommand {
    Help,
    Quit,
    Clear,
    History,
    Feedback(bool),
    Retries(u32),
    Model(TargetModel),
    Save(PathBuf),
}

fn parse_slash(input: &str) -> Result<SlashCommand> {
    let parts = shell_words::split(input.trim_start_matches('/'))
        .with_context(|| format!("could not parse command '{input}'"))?;
    let Some((command, rest)) = parts.split_first() else {
        bail!("empty command; type /help");
    };
    match (command.as_str(), rest) {
        ("help", _) => Ok(SlashCommand::Help),
        ("quit" | "exit", _) => Ok(SlashCommand::Quit),
        ("clear", _) => Ok(SlashCommand::Clear),
        ("history", _) => Ok(SlashCommand::History),
        ("feedback", [value]) => match value.as_str() {
            "on" => Ok(SlashCommand::Feedback(true)),
            "off" => Ok(SlashCommand::Feedback(false)),
            other => bail!("/feedback takes on or off, not '{other}'"),
        },
        ("retries", [value]) => {
            let retries: u32 = value
                .parse()
                .with_context(|| format!("/retries takes a number, not '{value}'"))?;
            Ok(SlashCommand::Retries(retries))
        }
        ("model", [value]) => TargetModel::parse(value)
            .map(SlashCommand::Model)
            .ok_or_else(|| {
                anyhow::anyhow!("unknown dialect '{value}' (sdxl, gpt-image or flux)")
            }),
        ("save", [value]) => Ok(SlashCommand::Save(PathBuf::from(value))),
        (other, _) => bail!("unknown command '/{other}'; type /help"),
    }
}

fn handle_slash(
    command: SlashCommand,
    engine: &mut StudioEngine,
    session_id: &str,
    last_artifact: &mut Option<PathBuf>,
) -> Result<()> {
    match command {
        SlashCommand::Help => println!("{CHAT_HELP}"),
        SlashCommand::Quit => {}
        SlashCommand::Clear => {
            engine.memory().clear(session_id)?;
            *last_artifact = None;
            println!("Session cleared.");
        }
        SlashCommand::History => {
            let state = engine.memory().snapshot(session_id)?;
            for turn in &state.turns {
                let role = match turn.role {
                    Role::User => "user",
                    Role::Agent => "easel",
                };
                println!("[{role}] {}", turn.text);
            }
            match &state.current_prompt {
                Some(prompt) => {
                    println!("current prompt v{}: {}", prompt.version, prompt.render_text())
                }
                None => println!("No prompt committed yet."),
            }
        }
        SlashCommand::Feedback(enabled) => {
            engine.set_feedback_enabled(enabled);
            println!(
                "Visual feedback {}.",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        SlashCommand::Retries(retries) => {
            engine.set_max_retries(retries);
            println!("Corrective re-render budget set to {retries}.");
        }
        SlashCommand::Model(target) => {
            engine.set_target_model(target);
            println!("New scenes will target {}.", target.as_str());
        }
        SlashCommand::Save(dest) => match last_artifact {
            Some(source) => {
                std::fs::copy(&source, &dest)
                    .with_context(|| format!("copy {} to {}", source.display(), dest.display()))?;
                println!("Saved {}.", dest.display());
            }
            None => println!("No image rendered yet."),
        },
    }
    Ok(())
}

fn print_outcome(outcome: &TurnOutcome, last_artifact: &mut Option<PathBuf>) {
    match outcome {
        TurnOutcome::Answered { reply } => println!("{reply}"),
        TurnOutcome::Generated {
            prompt,
            image,
            verdict,
            resolved,
            corrective_rounds,
        } => {
            println!("Prompt v{}: {}", prompt.version, prompt.render_text());
            if let Some(path) = image.metadata.get("artifact_path").and_then(Value::as_str) {
                *last_artifact = Some(PathBuf::from(path));
                println!("Image: {path}");
            }
            if *resolved {
                if *corrective_rounds > 0 {
                    println!(
                        "Passed inspection after {corrective_rounds} corrective re-render(s)."
                    );
                }
            } else {
                println!(
                    "Unmet after {corrective_rounds} re-render(s): [{}] ({})",
                    verdict.unmet_constraints.join(", "),
                    verdict.rationale,
                );
            }
        }
    }
}
