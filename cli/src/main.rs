use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use medibot::answer::{Illustration, StepResult, StructuredAnswer};
use medibot::classify::{ImageView, Outcome, StepRender, classify, select_render};
use medibot::clock::SystemClock;
use medibot::config::{ConfigError, DEFAULT_BASE_URL, GatewayConfig};
use medibot::gateway::{Gateway, GatewayError, HttpGateway};
use medibot::orchestrator::{FileUpload, TurnOrchestrator};
use medibot::session::{AttachmentRejected, ChatSession, SubmitRejected, check_attachment_size};
use medibot::transcript::Role;
use medibot::turn::{TurnState, status_line};

#[cfg(test)]
#[path = "main_test.rs"]
mod main_test;

const DEGRADED_NOTICE: &str = "Some visual guides couldn't be generated. Text instructions are provided instead.";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("missing auth token; pass --token or set MEDIBOT_TOKEN")]
    MissingToken,
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Gateway(#[from] GatewayError),
    #[error("{0}")]
    Submit(#[from] SubmitRejected),
    #[error("{0}")]
    Attachment(#[from] AttachmentRejected),
    #[error("could not read {path}: {source}")]
    ReadFile { path: String, source: std::io::Error },
    #[error("{0}")]
    TurnFailed(String),
    #[error("invalid JSON payload: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

#[derive(Parser, Debug)]
#[command(name = "medibot", about = "MediBot first-aid assistant from the terminal")]
struct Cli {
    #[arg(long, env = "MEDIBOT_API_URL", default_value = DEFAULT_BASE_URL)]
    api_url: String,

    /// ID token forwarded verbatim as the `Authorization` header.
    #[arg(long, env = "MEDIBOT_TOKEN")]
    token: Option<String>,

    /// Log gateway and turn events to stderr.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check the backend health endpoint.
    Ping,
    /// Ask a question and wait for the illustrated answer.
    Ask {
        question: Option<String>,
        /// Skip step illustrations.
        #[arg(long, default_value_t = false)]
        no_images: bool,
        /// Upload a PDF or image and ask for its analysis.
        #[arg(long, conflicts_with = "question")]
        attach: Option<PathBuf>,
    },
    /// List past conversations.
    History,
    /// Show a past conversation.
    Replay { chat_id: String },
    /// Show the stored health profile.
    Profile,
}

type CliOrchestrator = TurnOrchestrator<HttpGateway, Rc<RefCell<ChatSession>>, SystemClock>;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { tracing::Level::DEBUG } else { tracing::Level::WARN };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    if let Err(error) = run(cli).await {
        eprintln!("error: {error}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let timeouts = GatewayConfig::from_env()?.timeouts;
    let config = GatewayConfig::new(&cli.api_url)?.with_timeouts(timeouts);
    let gateway = HttpGateway::new(config)?;
    let token = cli.token.filter(|t| !t.trim().is_empty());

    match cli.command {
        Command::Ping => run_ping(&gateway).await,
        Command::Ask { question, no_images, attach } => {
            let orchestrator = orchestrator(gateway, token);
            match (attach, question) {
                (Some(path), _) => run_attach(&orchestrator, &path).await,
                (None, Some(question)) => run_ask(&orchestrator, &question, !no_images).await,
                (None, None) => Err(CliError::Submit(SubmitRejected::EmptyInput)),
            }
        }
        Command::History => run_history(&gateway, token.as_deref().ok_or(CliError::MissingToken)?).await,
        Command::Replay { chat_id } => {
            let orchestrator = orchestrator(gateway, Some(token.ok_or(CliError::MissingToken)?));
            run_replay(&orchestrator, &chat_id).await
        }
        Command::Profile => {
            let profile = gateway
                .health_profile(token.as_deref().ok_or(CliError::MissingToken)?)
                .await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
            Ok(())
        }
    }
}

fn orchestrator(gateway: HttpGateway, token: Option<String>) -> CliOrchestrator {
    TurnOrchestrator::new(gateway, Rc::new(RefCell::new(ChatSession::new())), SystemClock).with_auth_token(token)
}

async fn run_ping(gateway: &HttpGateway) -> Result<(), CliError> {
    let health = gateway.health().await?;
    println!("{}", health.status);
    Ok(())
}

async fn run_ask(orchestrator: &CliOrchestrator, question: &str, generate_images: bool) -> Result<(), CliError> {
    let state = with_ticker(orchestrator, orchestrator.submit_text(question, generate_images)).await?;
    finish_turn(orchestrator, state)
}

async fn run_attach(orchestrator: &CliOrchestrator, path: &Path) -> Result<(), CliError> {
    let read_error = |source| CliError::ReadFile { path: path.display().to_string(), source };
    let metadata = tokio::fs::metadata(path).await.map_err(read_error)?;
    check_attachment_size(metadata.len())?;
    let bytes = tokio::fs::read(path).await.map_err(read_error)?;

    let name = path
        .file_name()
        .map_or_else(|| "attachment".to_owned(), |n| n.to_string_lossy().into_owned());
    let upload = FileUpload { content_type: content_type_for(&name).to_owned(), name, bytes };
    let state = with_ticker(orchestrator, orchestrator.submit_attachment(upload)).await?;
    finish_turn(orchestrator, state)
}

async fn run_history(gateway: &HttpGateway, token: &str) -> Result<(), CliError> {
    let history = gateway.conversation_history(token).await?;
    if history.items.is_empty() {
        println!("no conversations yet");
    }
    for item in history.items {
        let topic = if item.topic.is_empty() { String::new() } else { format!(" [{}]", item.topic) };
        println!("{}  {}{topic}", item.chat_id, item.query);
    }
    Ok(())
}

async fn run_replay(orchestrator: &CliOrchestrator, chat_id: &str) -> Result<(), CliError> {
    let state = orchestrator.load_persisted_turn(chat_id).await;
    if state == TurnState::Error {
        return Err(CliError::TurnFailed(turn_error(orchestrator)));
    }
    let session = orchestrator.session().borrow();
    for turn in session.transcript().turns() {
        match (&turn.role, &turn.response) {
            (Role::Assistant, Some(answer)) => print!("{}", render_answer(answer)),
            _ => println!("> {}\n", turn.content),
        }
    }
    Ok(())
}

/// Drive `turn` while printing the status line once a second.
async fn with_ticker<T>(orchestrator: &CliOrchestrator, turn: impl Future<Output = T>) -> T {
    let mut turn = std::pin::pin!(turn);
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.tick().await;
    loop {
        tokio::select! {
            out = &mut turn => {
                eprintln!();
                return out;
            }
            _ = interval.tick() => {
                orchestrator.tick();
                print_status(orchestrator);
            }
        }
    }
}

fn print_status(orchestrator: &CliOrchestrator) {
    if let Some(status) = status_line(orchestrator.session().borrow().turn()) {
        eprint!("\r\x1b[2K{status}");
    }
}

fn finish_turn(orchestrator: &CliOrchestrator, state: TurnState) -> Result<(), CliError> {
    if state == TurnState::Error {
        return Err(CliError::TurnFailed(turn_error(orchestrator)));
    }
    let session = orchestrator.session().borrow();
    if let Some(answer) = session.turn().answer.as_ref() {
        print!("{}", render_answer(answer));
    }
    Ok(())
}

fn turn_error(orchestrator: &CliOrchestrator) -> String {
    orchestrator
        .session()
        .borrow()
        .turn()
        .error
        .clone()
        .unwrap_or_else(|| "request failed".to_owned())
}

fn content_type_for(name: &str) -> &'static str {
    let extension = name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("pdf") => "application/pdf",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

fn render_answer(answer: &StructuredAnswer) -> String {
    let mut out = String::new();
    if classify(answer) == Outcome::Degraded {
        out.push_str(&format!("! {DEGRADED_NOTICE}\n\n"));
    }
    out.push_str(answer.answer.trim_end());
    out.push('\n');
    if !answer.steps.is_empty() {
        out.push_str(&format!("\nStep-by-Step Visual Guide ({} steps)\n", answer.steps_count()));
        for step in &answer.steps {
            out.push_str(&render_step(step));
        }
    }
    out
}

fn render_step(step: &StepResult) -> String {
    let mut out = format!("\n{}. {}\n", step.index, step.title);
    if !step.description.is_empty() {
        out.push_str(&format!("   {}\n", step.description));
    }
    match select_render(step, ImageView::Pending) {
        StepRender::Image { src, .. } => match &step.illustration {
            Illustration::Inline(data) => out.push_str(&format!("   [image: inline png, {} base64 chars]\n", data.len())),
            _ => out.push_str(&format!("   [image: {src}]\n")),
        },
        StepRender::Fallback(text) => {
            out.push_str("   Visual temporarily unavailable\n");
            for (label, value) in [
                ("Action", &text.action),
                ("Method", &text.method),
                ("Caution", &text.caution),
                ("Expected Result", &text.expected_result),
            ] {
                if !value.is_empty() {
                    out.push_str(&format!("   {label}: {value}\n"));
                }
            }
        }
        StepRender::Unavailable => out.push_str("   [Image not available]\n"),
    }
    out
}
