//! The `stepwise` command line: chat with the agent, or poke at the
//! configured tool providers.

#[macro_use]
extern crate tracing;

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::pin::pin;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::OwoColorize;
use stepwise::core::flow::FlowRequest;
use stepwise::core::{
    Agent, AgentChatResult, AgentEvent, ConnectError, Error as AgentError,
};
use stepwise::{ConfigError, Session, SessionBuilder, Settings};
use thiserror::Error;
use tokio::io::{self, AsyncBufReadExt};
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::sleep;

const BAR_CHAR: &str = "▎";
const RESULT_PREVIEW: usize = 160;

#[derive(Parser)]
#[command(name = "stepwise")]
#[command(about = "Plan-and-execute agent over MCP tool providers", long_about = None)]
struct Cli {
    /// Configuration file (defaults to $STEPWISE_CONFIG or ./stepwise.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured model
    #[arg(short, long, global = true)]
    model: Option<String>,

    /// Answers without planning multi-step requests first
    #[arg(long, global = true)]
    no_plan: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,
    /// Answers a single prompt
    Ask {
        /// The prompt
        #[arg(required = true)]
        prompt: Vec<String>,
        /// Prints the result as JSON instead of rendering events
        #[arg(long)]
        json: bool,
    },
    /// Lists the tools of all configured providers
    Tools {
        /// Prints the catalog as JSON
        #[arg(long)]
        json: bool,
    },
    /// Connects one provider by id or name and lists its tools
    Probe {
        /// Provider id or name
        id: String,
    },
    /// Runs a tool flow described by a JSON file
    Flow {
        /// Path of the flow file
        file: PathBuf,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Agent(#[from] AgentError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error("no provider `{0}` in the configuration")]
    UnknownProvider(String),
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let settings = match Settings::load(cli.config.as_deref()) {
        Ok((settings, _)) => settings,
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            return ExitCode::FAILURE;
        }
    };

    let mut session = SessionBuilder::from_settings(&settings).build();
    if let Some(model) = cli.model {
        session.options_mut().model = Some(model);
    }
    if cli.no_plan {
        session.options_mut().planning = false;
    }

    let outcome = match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => chat(&mut session).await,
        Commands::Ask { prompt, json } => {
            ask(&mut session, &prompt.join(" "), json).await
        }
        Commands::Tools { json } => tools(session.agent(), json).await,
        Commands::Probe { id } => probe(session.agent(), &settings, &id).await,
        Commands::Flow { file } => flow(session.agent(), &file).await,
    };

    session.agent().pool().shutdown().await;

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err}", "error:".bright_red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn chat(session: &mut Session) -> Result<(), CliError> {
    let progress_style = progress_style();

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        let Some(line) = read_line().await else {
            break;
        };
        let line = line.trim();
        match line {
            "" => continue,
            "/exit" | "/quit" => break,
            "/clear" => {
                session.clear_history();
                println!("{}", "(history cleared)".dimmed());
                continue;
            }
            _ => {}
        }

        // A failed turn is reported and the conversation goes on.
        if let Err(err) = run_turn(session, line, &progress_style).await {
            eprintln!("{} {err}", "error:".bright_red().bold());
        }
        println!();
    }
    Ok(())
}

async fn ask(
    session: &mut Session,
    prompt: &str,
    json: bool,
) -> Result<(), CliError> {
    if json {
        let result = session.send_message(prompt, None).await?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    run_turn(session, prompt, &progress_style()).await?;
    Ok(())
}

async fn tools(agent: &Agent, json: bool) -> Result<(), CliError> {
    let tools = agent.list_tools().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
        return Ok(());
    }
    if tools.is_empty() {
        println!("{}", "No tools available.".dimmed());
    }
    for tool in tools {
        match &tool.description {
            Some(description) => {
                println!("{} {}", tool.name.bright_white().bold(), description)
            }
            None => println!("{}", tool.name.bright_white().bold()),
        }
    }
    Ok(())
}

async fn probe(
    agent: &Agent,
    settings: &Settings,
    key: &str,
) -> Result<(), CliError> {
    let config = settings
        .provider_configs()
        .into_iter()
        .find(|config| config.matches(key))
        .ok_or_else(|| CliError::UnknownProvider(key.to_owned()))?;

    let tools = agent.probe_provider(&config).await?;
    println!(
        "{} {} serves {} tools",
        "✓".bright_green(),
        config.name.bright_white().bold(),
        tools.len()
    );
    for tool in tools {
        println!("  {}", tool.name);
    }
    Ok(())
}

async fn flow(agent: &Agent, file: &Path) -> Result<(), CliError> {
    let text = tokio::fs::read_to_string(file).await.map_err(|source| {
        CliError::Read {
            path: file.to_owned(),
            source,
        }
    })?;
    let request: FlowRequest = serde_json::from_str(&text)?;
    let result = agent.run_flow(&request).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Sends one message and renders its events until the answer arrives.
async fn run_turn(
    session: &mut Session,
    message: &str,
    progress_style: &ProgressStyle,
) -> Result<AgentChatResult, AgentError> {
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let mut renderer = Renderer::new(progress_style.clone());

    let result = {
        let mut turn = pin!(session.send_message(message, Some(&event_tx)));
        loop {
            select! {
                result = &mut turn => break result,
                Some(event) = event_rx.recv() => renderer.render(event),
                _ = sleep(Duration::from_millis(100)) => renderer.tick(),
            }
        }
    };
    while let Ok(event) = event_rx.try_recv() {
        renderer.render(event);
    }
    renderer.finish();
    result
}

/// Prints agent events as they arrive, with a spinner while waiting.
struct Renderer {
    style: ProgressStyle,
    progress_bar: Option<ProgressBar>,
    streaming: bool,
}

impl Renderer {
    fn new(style: ProgressStyle) -> Self {
        Self {
            style,
            progress_bar: None,
            streaming: false,
        }
    }

    fn tick(&mut self) {
        if self.streaming {
            return;
        }
        // Create a new progress bar if it has been finished.
        self.progress_bar
            .get_or_insert_with(|| {
                let progress_bar = ProgressBar::new_spinner();
                progress_bar.set_style(self.style.clone());
                progress_bar.set_message("🤔 Thinking...");
                progress_bar
            })
            .inc(1);
    }

    fn clear_progress(&mut self) {
        // Finish the progress bar before printing anything else.
        if let Some(progress_bar) = self.progress_bar.take() {
            progress_bar.finish_and_clear();
        }
    }

    fn end_stream(&mut self) {
        if self.streaming {
            println!();
            self.streaming = false;
        }
    }

    fn render(&mut self, event: AgentEvent) {
        self.clear_progress();
        match event {
            AgentEvent::AssistantMessage {
                content,
                complete: false,
                ..
            } => {
                if !self.streaming {
                    print!("{}🤖 ", BAR_CHAR.bright_cyan());
                    self.streaming = true;
                }
                print!("{}", content.bright_white());
                std::io::stdout().flush().ok();
            }
            AgentEvent::AssistantMessage {
                step: Some(step), ..
            } => {
                self.end_stream();
                println!("{}", format!("(step {} done)", step + 1).dimmed());
            }
            AgentEvent::AssistantMessage { .. } => self.end_stream(),
            AgentEvent::Plan { steps } => {
                self.end_stream();
                let bar = BAR_CHAR.bright_magenta();
                println!("{bar}📋 Plan:");
                for (index, step) in steps.iter().enumerate() {
                    match &step.server {
                        Some(server) => println!(
                            "{bar}  {}. {} {}",
                            index + 1,
                            step.description,
                            format!("[{server}]").dimmed()
                        ),
                        None => {
                            println!("{bar}  {}. {}", index + 1, step.description)
                        }
                    }
                }
            }
            AgentEvent::ToolCall {
                name, arguments, ..
            } => {
                self.end_stream();
                let bar = BAR_CHAR.bright_yellow();
                println!(
                    "{bar}🔧 {} {}",
                    name.bright_white().bold(),
                    arguments.to_string().dimmed()
                );
            }
            AgentEvent::ToolResult {
                content, is_error, ..
            } => {
                let preview = preview(&content);
                if is_error {
                    println!("{}   {}", BAR_CHAR.bright_red(), preview.red());
                } else {
                    println!("{}   {}", BAR_CHAR.bright_yellow(), preview.dimmed());
                }
            }
            AgentEvent::FinalMessage {
                message,
                tool_calls_used,
            } => {
                if self.streaming {
                    self.end_stream();
                } else {
                    println!(
                        "{}🤖 {}",
                        BAR_CHAR.bright_cyan(),
                        message.bright_white()
                    );
                }
                if tool_calls_used > 0 {
                    println!(
                        "{}",
                        format!("({tool_calls_used} tool calls)").dimmed()
                    );
                }
            }
        }
    }

    fn finish(&mut self) {
        self.clear_progress();
        self.end_stream();
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner} {wide_msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
}

/// The first line of a tool result, cut to [`RESULT_PREVIEW`] chars. The
/// trailing `…` means more content follows, on that line or later ones.
fn preview(content: &str) -> String {
    let line = content.lines().next().unwrap_or_default();
    let mut preview: String = line.chars().take(RESULT_PREVIEW).collect();
    if preview.len() < content.trim_end().len() {
        preview.push('…');
    }
    preview
}

async fn read_line() -> Option<String> {
    let mut stdin = io::BufReader::new(io::stdin());
    let mut line = String::new();

    match stdin.read_line(&mut line).await {
        Ok(count) => {
            if count == 0 {
                return None;
            }
            Some(line)
        }
        Err(err) => {
            error!("error reading input: {}", err);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preview_marks_truncation() {
        assert_eq!(preview("done"), "done");
        assert_eq!(preview("done\n"), "done");
        assert_eq!(preview("first\nsecond"), "first…");

        let long = "x".repeat(RESULT_PREVIEW + 10);
        let shown = preview(&long);
        assert_eq!(shown.chars().count(), RESULT_PREVIEW + 1);
        assert!(shown.ends_with('…'));
    }
}
