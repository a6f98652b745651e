use std::io::{BufRead, Read, Write};
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::AsyncWriteExt;

use drive_progress_core::config::{self as settings_config, Settings};
use drive_progress_core::protocol::{decode_str, encode_line};
use drive_progress_core::session::SdkConfig;
use drive_progress_core::status::{read_progress_snapshot_json, status_json_path};
use drive_progress_core::{
    BatchKey, BatchProgressEvent, DecodeError, Event, FileType, HandleOutcome, ProgressState,
    TransferEvent, TransferFailure, TransferItem, TransferKind, TransferPhase, encode, logging,
};

#[derive(Parser)]
#[command(name = "driveprogress")]
#[command(about = "Inspect and replay worker progress streams", long_about = None)]
struct Cli {
    #[arg(long)]
    json: bool,

    /// Print one NDJSON line per handled message.
    #[arg(long)]
    events: bool,

    #[arg(long)]
    config_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode an NDJSON message stream (`-` for stdin) and report each line.
    Decode { input: PathBuf },
    /// Feed an NDJSON message stream into a receiver and print the final state.
    Replay { input: PathBuf },
    /// Print an SDK configuration with its secrets redacted.
    Redact { input: PathBuf },
    /// Generate a plausible worker stream.
    Simulate {
        #[arg(long, default_value_t = 3)]
        files: u32,
        #[arg(long, default_value_t = 1_048_576)]
        size: u64,
        /// Write to the daemon's worker socket instead of stdout.
        #[arg(long)]
        connect: bool,
    },
    Settings {
        #[command(subcommand)]
        cmd: SettingsCmd,
    },
    Status {
        #[command(subcommand)]
        cmd: StatusCmd,
    },
}

#[derive(Subcommand)]
enum SettingsCmd {
    Get,
    /// Read TOML settings from stdin, validate, and save them.
    Set,
    /// Write the default settings unless a config file exists.
    Init,
}

#[derive(Subcommand)]
enum StatusCmd {
    /// Print the last snapshot the daemon wrote.
    Get,
}

#[derive(Debug, Serialize)]
struct CliError {
    code: &'static str,
    message: String,
    details: serde_json::Value,
    retryable: bool,
}

impl CliError {
    fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: false,
        }
    }

    fn retryable(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: serde_json::json!({}),
            retryable: true,
        }
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            emit_error(&e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config_dir = settings_config::resolve_config_dir(cli.config_dir);
    let data_dir = settings_config::resolve_data_dir(cli.data_dir);

    let settings = settings_config::load_settings(&config_dir).map_err(map_core_err)?;
    logging::init_logging(settings.logging.filter.as_deref());

    match cli.cmd {
        Command::Decode { input } => decode_run(&input, cli.json),
        Command::Replay { input } => replay_run(&input, cli.json, cli.events),
        Command::Redact { input } => redact_run(&input),
        Command::Simulate {
            files,
            size,
            connect,
        } => simulate_run(&data_dir, files, size, connect).await,
        Command::Settings { cmd } => match cmd {
            SettingsCmd::Get => settings_get(&settings, cli.json),
            SettingsCmd::Set => settings_set(&config_dir, cli.json),
            SettingsCmd::Init => settings_init(&config_dir, cli.json),
        },
        Command::Status { cmd } => match cmd {
            StatusCmd::Get => status_get(&data_dir, cli.json),
        },
    }
}

fn open_input(path: &Path) -> Result<Box<dyn BufRead>, CliError> {
    if path.as_os_str() == "-" {
        return Ok(Box::new(std::io::stdin().lock()));
    }
    let file = std::fs::File::open(path).map_err(|e| {
        CliError::new("input.open_failed", e.to_string())
            .with_details(serde_json::json!({ "path": path.display().to_string() }))
    })?;
    Ok(Box::new(std::io::BufReader::new(file)))
}

/// Non-blank lines with their 1-based line numbers.
fn input_lines(path: &Path) -> Result<Vec<(usize, String)>, CliError> {
    let mut out = Vec::new();
    for (idx, line) in open_input(path)?.lines().enumerate() {
        let line = line.map_err(|e| CliError::new("input.read_failed", e.to_string()))?;
        if !line.trim().is_empty() {
            out.push((idx + 1, line));
        }
    }
    Ok(out)
}

fn decode_error_code(e: &DecodeError) -> &'static str {
    match e {
        DecodeError::UnknownType { .. } => "decode.unknown_type",
        DecodeError::MissingField { .. } => "decode.missing_field",
        DecodeError::InvalidField { .. } => "decode.invalid_field",
        DecodeError::Malformed { .. } => "decode.malformed",
    }
}

fn decode_run(input: &Path, json: bool) -> Result<(), CliError> {
    let mut failed = 0u64;
    let mut total = 0u64;

    for (line_no, line) in input_lines(input)? {
        total += 1;
        match decode_str(&line) {
            Ok(event) => {
                let route = event.route();
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "line": line_no,
                            "ok": true,
                            "route": route.to_string(),
                            "message": encode(&event),
                        })
                    );
                } else {
                    println!("{line_no}: {route}");
                }
            }
            Err(e) => {
                failed += 1;
                if json {
                    println!(
                        "{}",
                        serde_json::json!({
                            "line": line_no,
                            "ok": false,
                            "error": { "code": decode_error_code(&e), "message": e.to_string() },
                        })
                    );
                } else {
                    println!("{line_no}: error: {e}");
                }
            }
        }
    }

    if failed > 0 {
        return Err(
            CliError::new("decode.failed", format!("{failed} of {total} lines failed"))
                .with_details(serde_json::json!({ "failed": failed, "total": total })),
        );
    }
    Ok(())
}

fn outcome_json(line_no: usize, outcome: &HandleOutcome) -> serde_json::Value {
    match outcome {
        HandleOutcome::Applied => serde_json::json!({ "line": line_no, "outcome": "applied" }),
        HandleOutcome::Stale => serde_json::json!({ "line": line_no, "outcome": "stale" }),
        HandleOutcome::Discarded(v) => serde_json::json!({
            "line": line_no,
            "outcome": "discarded",
            "uuid": v.uuid(),
            "reason": v.to_string(),
        }),
        HandleOutcome::Dropped(e) => serde_json::json!({
            "line": line_no,
            "outcome": "dropped",
            "code": decode_error_code(e),
            "reason": e.to_string(),
        }),
    }
}

fn replay_run(input: &Path, json: bool, events: bool) -> Result<(), CliError> {
    let mut state = ProgressState::new();
    for (line_no, line) in input_lines(input)? {
        let outcome = state.handle_line(&line);
        if events {
            println!("{}", outcome_json(line_no, &outcome));
        }
    }

    let snapshot = state.snapshot();
    if json {
        let text = serde_json::to_string(&snapshot)
            .map_err(|e| CliError::new("json.encode_failed", e.to_string()))?;
        println!("{text}");
        return Ok(());
    }

    for view in &snapshot.transfers {
        let t = &view.transfer;
        println!(
            "{} {} {:<11} {:>6.1}% {}/{} {}",
            t.kind,
            t.uuid,
            t.state.name(),
            view.percent,
            t.transferred_bytes,
            t.total_bytes.map(|v| v.to_string()).unwrap_or_else(|| "?".to_string()),
            t.name
        );
    }
    for b in &snapshot.batches {
        println!("batch {} {}/{}", b.key.id(), b.done, b.total);
    }
    let stats = snapshot.stats;
    println!(
        "applied={} stale={} discarded={} dropped={}",
        stats.applied, stats.stale, stats.discarded, stats.dropped
    );
    Ok(())
}

fn redact_run(input: &Path) -> Result<(), CliError> {
    let mut text = String::new();
    open_input(input)?
        .read_to_string(&mut text)
        .map_err(|e| CliError::new("input.read_failed", e.to_string()))?;
    let config: SdkConfig = serde_json::from_str(&text)
        .map_err(|e| CliError::new("sdk_config.invalid", e.to_string()))?;
    let out = serde_json::to_string_pretty(&config.redacted())
        .map_err(|e| CliError::new("json.encode_failed", e.to_string()))?;
    println!("{out}");
    Ok(())
}

/// A download of `files` files, one of them stopped halfway, and a share
/// batch over all of them.
fn simulated_stream(files: u32, size: u64) -> Vec<Event> {
    let chunk = (size / 4).max(1);
    let request_uuid = uuid::Uuid::new_v4().to_string();
    let items: Vec<TransferItem> = (0..files)
        .map(|i| {
            TransferItem::new(
                uuid::Uuid::new_v4().to_string(),
                format!("file-{i}.bin"),
                FileType::File,
            )
        })
        .collect();

    let mut out: Vec<Event> = Vec::new();
    let push = |out: &mut Vec<Event>, item: &TransferItem, phase: TransferPhase| {
        out.push(TransferEvent::new(TransferKind::Download, item.clone(), phase).into());
    };

    for item in &items {
        push(&mut out, item, TransferPhase::Queued);
    }
    for (idx, item) in items.iter().enumerate() {
        push(&mut out, item, TransferPhase::Started { size });
        let mut sent = 0;
        while sent < size {
            let bytes = chunk.min(size - sent);
            push(&mut out, item, TransferPhase::Progress { bytes });
            sent += bytes;
            if idx == 1 && sent >= size / 2 {
                break;
            }
        }
        match idx {
            1 => push(&mut out, item, TransferPhase::Stopped { size: sent }),
            2 => push(
                &mut out,
                item,
                TransferPhase::Error {
                    err: TransferFailure {
                        name: "NetworkError".to_string(),
                        message: "connection reset".to_string(),
                    },
                    size: sent,
                },
            ),
            _ => push(&mut out, item, TransferPhase::Finished { size }),
        }

        if let Some(batch) = BatchProgressEvent::new(
            BatchKey::Share {
                request_uuid: request_uuid.clone(),
            },
            idx as u64 + 1,
            u64::from(files),
        ) {
            out.push(batch.into());
        }
    }
    out
}

async fn simulate_run(data_dir: &Path, files: u32, size: u64, connect: bool) -> Result<(), CliError> {
    let mut payload = String::new();
    for event in simulated_stream(files, size) {
        payload.push_str(&encode_line(&event));
        payload.push('\n');
    }

    if !connect {
        print!("{payload}");
        return std::io::stdout()
            .flush()
            .map_err(|e| CliError::new("output.write_failed", e.to_string()));
    }

    let socket_path = drive_progress_core::status::worker_ipc_socket_path(data_dir);
    let mut stream = tokio::net::UnixStream::connect(&socket_path)
        .await
        .map_err(|e| {
            CliError::retryable("daemon.unavailable", e.to_string())
                .with_details(serde_json::json!({ "path": socket_path.display().to_string() }))
        })?;
    stream
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| CliError::retryable("daemon.write_failed", e.to_string()))?;
    stream
        .shutdown()
        .await
        .map_err(|e| CliError::retryable("daemon.write_failed", e.to_string()))?;
    tracing::info!(
        event = "simulate.sent",
        bytes = payload.len(),
        path = %socket_path.display(),
        "simulate.sent"
    );
    Ok(())
}

fn settings_get(settings: &Settings, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    } else {
        let text = settings_config::to_toml(settings).map_err(map_core_err)?;
        print!("{text}");
        if !text.ends_with('\n') {
            println!();
        }
    }
    Ok(())
}

fn settings_set(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .map_err(|e| CliError::new("config.read_failed", e.to_string()))?;
    let settings = settings_config::parse_settings(&input)
        .map_err(|e| CliError::new("config.invalid", e.to_string()))?;
    settings_config::validate_settings(&settings).map_err(map_core_err)?;
    settings_config::save_settings(config_dir, &settings).map_err(map_core_err)?;

    if json {
        println!("{}", serde_json::json!({ "settings": settings }));
    }
    Ok(())
}

fn settings_init(config_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = settings_config::config_path(config_dir);
    let created = !path.exists();
    if created {
        settings_config::save_settings(config_dir, &Settings::default()).map_err(map_core_err)?;
    }

    if json {
        println!(
            "{}",
            serde_json::json!({ "path": path.display().to_string(), "created": created })
        );
    } else if created {
        println!("wrote {}", path.display());
    } else {
        println!("{} already exists", path.display());
    }
    Ok(())
}

fn status_get(data_dir: &Path, json: bool) -> Result<(), CliError> {
    let path = status_json_path(data_dir);
    let snapshot = read_progress_snapshot_json(&path).map_err(|e| {
        let err = if e.kind() == std::io::ErrorKind::NotFound {
            CliError::retryable("status.unavailable", "daemon has not written a snapshot yet")
        } else {
            CliError::new("status.invalid", e.to_string())
        };
        err.with_details(serde_json::json!({ "path": path.display().to_string() }))
    })?;

    if json {
        let text = serde_json::to_string(&snapshot)
            .map_err(|e| CliError::new("json.encode_failed", e.to_string()))?;
        println!("{text}");
    } else {
        println!(
            "activeTransfers={} activeBatches={} generatedAt={}",
            snapshot.active_transfers, snapshot.active_batches, snapshot.generated_at
        );
    }
    Ok(())
}

fn map_core_err(e: drive_progress_core::Error) -> CliError {
    use drive_progress_core::{Error, SessionError};
    match e {
        Error::InvalidConfig { message } => CliError::new("config.invalid", message),
        Error::Decode(e) => CliError::new(decode_error_code(&e), e.to_string()),
        Error::Session(SessionError::Json(e)) => CliError::new("session.corrupt", e.to_string()),
        Error::Session(e) => CliError::new("session.failed", e.to_string()),
        Error::ChannelClosed => CliError::retryable("channel.closed", "receiver is gone"),
        Error::Io(e) => CliError::new("io", e.to_string()),
    }
}

fn emit_error(e: &CliError) {
    let json = serde_json::to_string(e).unwrap_or_else(|_| "{\"code\":\"unknown\",\"message\":\"json encode failed\",\"details\":{},\"retryable\":false}".to_string());
    let _ = writeln!(std::io::stderr(), "{json}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_stream_replays_cleanly() {
        let mut state = ProgressState::new();
        for event in simulated_stream(3, 1000) {
            let outcome = state.apply(&event);
            assert!(matches!(outcome, HandleOutcome::Applied), "{outcome:?}");
        }

        let snapshot = state.snapshot();
        assert_eq!(snapshot.transfers.len(), 3);
        assert_eq!(snapshot.active_transfers, 0);
        assert_eq!(snapshot.active_batches, 0);
        let states: Vec<&str> = snapshot
            .transfers
            .iter()
            .map(|v| v.transfer.state.name())
            .collect();
        let mut sorted = states.clone();
        sorted.sort();
        assert_eq!(sorted, vec!["error", "finished", "stopped"]);
    }

    #[test]
    fn simulated_stream_survives_the_wire() {
        for event in simulated_stream(2, 10) {
            assert_eq!(decode_str(&encode_line(&event)).unwrap(), event);
        }
    }

    #[test]
    fn outcome_json_names_the_reason() {
        let mut state = ProgressState::new();
        let outcome = state.handle_line(r#"{"type":"rename"}"#);
        let v = outcome_json(7, &outcome);
        assert_eq!(v["outcome"], "dropped");
        assert_eq!(v["code"], "decode.unknown_type");
        assert_eq!(v["line"], 7);
    }

    #[test]
    fn core_errors_map_to_stable_codes() {
        let e = map_core_err(drive_progress_core::Error::InvalidConfig {
            message: "bad".to_string(),
        });
        assert_eq!(e.code, "config.invalid");
        assert!(!e.retryable);
        assert!(map_core_err(drive_progress_core::Error::ChannelClosed).retryable);

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let e = map_core_err(drive_progress_core::SessionError::Json(json_err).into());
        assert_eq!(e.code, "session.corrupt");
    }
}
