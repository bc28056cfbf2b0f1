//! rebecca-cli: terminal client for the Rebecca chat server
//!
//! # Subcommands
//! - `register <username>`         : create an account
//! - `login <username>`            : print a bearer token for `REBECCA_TOKEN`
//! - `chat [message]`              : stream a reply; without a message, start a prompt loop
//! - `history [-n <limit>] [--json]`: recent turns, oldest first
//! - `status`                      : show server health

use std::io::{BufRead, BufReader, Write};

use clap::{Parser, Subcommand};
use serde::Deserialize;

const DEFAULT_SERVER: &str = "http://127.0.0.1:5000";
const DEFAULT_HISTORY: u32 = 10;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "rebecca-cli", version, about = "Chat with Rebecca from the terminal")]
struct Cli {
    /// Rebecca HTTP server URL (overrides REBECCA_HTTP_URL env var)
    #[arg(long, env = "REBECCA_HTTP_URL", default_value = DEFAULT_SERVER)]
    server: String,

    /// Bearer token from `rebecca-cli login`
    #[arg(long, env = "REBECCA_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create a new account
    Register {
        username: String,

        /// Password (prompted on stdin when omitted)
        #[arg(long, env = "REBECCA_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Log in and print a bearer token
    Login {
        username: String,

        /// Password (prompted on stdin when omitted)
        #[arg(long, env = "REBECCA_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Send a message and stream the reply
    Chat {
        /// Message to send; omit for an interactive session
        message: Option<String>,
    },

    /// Show recent conversation turns
    History {
        #[arg(short = 'n', long, default_value_t = DEFAULT_HISTORY)]
        limit: u32,

        /// Print the raw JSON response
        #[arg(long)]
        json: bool,
    },

    /// Show Rebecca server status
    Status,
}

// ============================================================================
// API Response Types
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TurnView {
    pub id: i64,
    pub timestamp: String,
    pub prompt: String,
    pub response: String,
}

#[derive(Debug, Deserialize)]
pub struct HistoryResponse {
    pub conversations: Vec<TurnView>,
    pub count: usize,
}

// ============================================================================
// SSE parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Line-fed Server-Sent Events parser. A blank line dispatches the event.
#[derive(Debug, Default)]
pub struct SseParser {
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn feed(&mut self, line: &str) -> Option<SseEvent> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            let event = SseEvent {
                event: self.event.take().unwrap_or_else(|| "message".to_string()),
                data: self.data.join("\n"),
            };
            self.data.clear();
            return Some(event);
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

/// What a finished chat stream ended with.
#[derive(Debug, PartialEq, Eq)]
pub enum ChatOutcome {
    Done { turn_id: Option<i64> },
    Failed { kind: String, error: String },
    /// Connection closed without a terminal event.
    Truncated,
}

/// Read an SSE chat body, calling `on_sentence` for each message event.
pub fn consume_chat_stream<R: BufRead>(
    reader: R,
    mut on_sentence: impl FnMut(&str),
) -> anyhow::Result<ChatOutcome> {
    let mut parser = SseParser::default();
    for line in reader.lines() {
        let Some(event) = parser.feed(&line?) else {
            continue;
        };
        match event.event.as_str() {
            "message" => on_sentence(&event.data),
            "done" => {
                let body: serde_json::Value = serde_json::from_str(&event.data).unwrap_or_default();
                return Ok(ChatOutcome::Done {
                    turn_id: body["turn_id"].as_i64(),
                });
            }
            "error" => {
                let body: serde_json::Value = serde_json::from_str(&event.data).unwrap_or_default();
                return Ok(ChatOutcome::Failed {
                    kind: body["kind"].as_str().unwrap_or("unknown").to_string(),
                    error: body["error"].as_str().unwrap_or(&event.data).to_string(),
                });
            }
            _ => {}
        }
    }
    Ok(ChatOutcome::Truncated)
}

// ============================================================================
// HTTP Client Calls
// ============================================================================

fn client(timeout_secs: Option<u64>) -> anyhow::Result<reqwest::blocking::Client> {
    let mut builder = reqwest::blocking::Client::builder();
    // Chat streams have no overall deadline.
    builder = builder.timeout(timeout_secs.map(std::time::Duration::from_secs));
    Ok(builder.build()?)
}

fn require_token(token: Option<&str>) -> String {
    match token {
        Some(t) if !t.trim().is_empty() => t.trim().to_string(),
        _ => {
            eprintln!("rebecca-cli: no token; run `rebecca-cli login <username>` and set REBECCA_TOKEN");
            std::process::exit(1);
        }
    }
}

fn read_password(password: Option<String>) -> anyhow::Result<String> {
    if let Some(p) = password {
        return Ok(p);
    }
    eprint!("Password: ");
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn error_message(resp: reqwest::blocking::Response) -> String {
    let status = resp.status();
    let body: serde_json::Value = resp.json().unwrap_or_default();
    match body["error"].as_str() {
        Some(msg) => format!("{} ({})", msg, status),
        None => format!("server returned {}", status),
    }
}

fn post_credentials(
    server: &str,
    path: &str,
    username: &str,
    password: &str,
) -> anyhow::Result<reqwest::blocking::Response> {
    let url = format!("{}{}", server, path);
    let body = serde_json::json!({ "username": username, "password": password });
    match client(Some(30))?.post(&url).json(&body).send() {
        Ok(r) => Ok(r),
        Err(e) => {
            eprintln!("rebecca-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    }
}

fn do_register(server: &str, username: &str, password: Option<String>) -> anyhow::Result<()> {
    let password = read_password(password)?;
    let resp = post_credentials(server, "/auth/register", username, &password)?;
    if !resp.status().is_success() {
        eprintln!("rebecca-cli: registration failed: {}", error_message(resp));
        std::process::exit(1);
    }
    let body: serde_json::Value = resp.json()?;
    println!(
        "Registered {} (id {})",
        body["username"].as_str().unwrap_or(username),
        body["id"]
    );
    Ok(())
}

fn do_login(server: &str, username: &str, password: Option<String>) -> anyhow::Result<()> {
    let password = read_password(password)?;
    let resp = post_credentials(server, "/auth/login", username, &password)?;
    if !resp.status().is_success() {
        eprintln!("rebecca-cli: login failed: {}", error_message(resp));
        std::process::exit(1);
    }
    let body: serde_json::Value = resp.json()?;
    eprintln!(
        "Token valid for {} seconds. Export it as REBECCA_TOKEN:",
        body["expires_in"]
    );
    println!("{}", body["token"].as_str().unwrap_or_default());
    Ok(())
}

/// Send one message and print sentences as they arrive.
fn send_message(server: &str, token: &str, message: &str) -> anyhow::Result<ChatOutcome> {
    let url = format!("{}/chat", server);
    let resp = client(None)?
        .post(&url)
        .bearer_auth(token)
        .header("accept", "text/event-stream")
        .json(&serde_json::json!({ "user_input": message }))
        .send();

    let resp = match resp {
        Ok(r) => r,
        Err(e) => {
            eprintln!("rebecca-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };

    if !resp.status().is_success() {
        let msg = error_message(resp);
        return Ok(ChatOutcome::Failed {
            kind: "http".to_string(),
            error: msg,
        });
    }

    let stdout = std::io::stdout();
    let mut first = true;
    let outcome = consume_chat_stream(BufReader::new(resp), |sentence| {
        let mut out = stdout.lock();
        let sep = if first { "Rebecca: " } else { " " };
        first = false;
        let _ = write!(out, "{}{}", sep, sentence);
        let _ = out.flush();
    })?;
    if !first {
        println!();
    }
    Ok(outcome)
}

fn report(outcome: &ChatOutcome) -> bool {
    match outcome {
        ChatOutcome::Done { .. } => true,
        ChatOutcome::Failed { kind, error } => {
            eprintln!("rebecca-cli: chat failed [{}]: {}", kind, error);
            false
        }
        ChatOutcome::Truncated => {
            eprintln!("rebecca-cli: stream closed before the reply completed");
            false
        }
    }
}

fn do_chat(server: &str, token: Option<&str>, message: Option<String>) -> anyhow::Result<()> {
    let token = require_token(token);

    if let Some(message) = message {
        if !report(&send_message(server, &token, &message)?) {
            std::process::exit(1);
        }
        return Ok(());
    }

    eprintln!("Talking to {} (Ctrl+D to quit)", server);
    let stdin = std::io::stdin();
    loop {
        eprint!("> ");
        std::io::stderr().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        report(&send_message(server, &token, line)?);
    }
    Ok(())
}

fn do_history(server: &str, token: Option<&str>, limit: u32, json: bool) -> anyhow::Result<()> {
    let token = require_token(token);
    let url = format!("{}/chat/conversations?limit={}", server, limit);
    let resp = match client(Some(30))?.get(&url).bearer_auth(&token).send() {
        Ok(r) => r,
        Err(e) => {
            eprintln!("rebecca-cli: connection failed to {}: {}", url, e);
            std::process::exit(1);
        }
    };
    if !resp.status().is_success() {
        eprintln!("rebecca-cli: {}", error_message(resp));
        std::process::exit(1);
    }

    if json {
        let body: serde_json::Value = resp.json()?;
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let history: HistoryResponse = resp.json()?;
    if history.count == 0 {
        eprintln!("No conversations yet");
        return Ok(());
    }
    for turn in &history.conversations {
        println!("[{}] #{}", turn.timestamp, turn.id);
        println!("You:     {}", turn.prompt);
        println!("Rebecca: {}\n", turn.response);
    }
    Ok(())
}

/// Show the server status by calling GET /health.
fn do_status(server: &str) -> anyhow::Result<()> {
    let url = format!("{}/health", server);
    let resp = client(Some(10))?.get(&url).send();

    match resp {
        Ok(r) if r.status().is_success() => {
            let body: serde_json::Value = r.json().unwrap_or_default();
            println!("Rebecca server: {}", body["status"].as_str().unwrap_or("unknown"));
            println!("Version:        {}", body["version"].as_str().unwrap_or("?"));
            println!("Storage:        {}", body["storage"].as_str().unwrap_or("?"));
            if let Some(pg) = body["postgresql"].as_str() {
                println!("PostgreSQL:     {}", pg);
            }
        }
        Ok(r) => {
            eprintln!("rebecca-cli: server unhealthy (HTTP {})", r.status());
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("rebecca-cli: cannot reach {}: {}", url, e);
            std::process::exit(1);
        }
    }

    Ok(())
}

// ============================================================================
// Main
// ============================================================================

fn main() {
    let cli = Cli::parse();
    let server = cli.server.trim_end_matches('/').to_string();
    let token = cli.token.as_deref();

    let result = match cli.command {
        Commands::Register { username, password } => do_register(&server, &username, password),
        Commands::Login { username, password } => do_login(&server, &username, password),
        Commands::Chat { message } => do_chat(&server, token, message),
        Commands::History { limit, json } => do_history(&server, token, limit, json),
        Commands::Status => do_status(&server),
    };

    if let Err(e) = result {
        eprintln!("rebecca-cli: {}", e);
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
