use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{ArgGroup, Parser, Subcommand};
use mxagent::config::AgentConfig;
use mxagent::manager::MessageStatus;
use mxagent::recovery::FetchOptions;
use mxagent::service::{self, AgentSession};
use mxagent_crypto::backup::RecoveryCredential;
use mxagent_shared::error::MxError;
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

/// Matrix agent device with end-to-end encryption
#[derive(Parser)]
#[command(name = "mxagent", version, about, long_about = None)]
struct Cli {
    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Operation timeout in seconds (also bounds verification)
    #[arg(long, global = true, value_name = "SECS")]
    timeout: Option<u64>,

    /// Config file path
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Log in with a password and create this agent's device
    Setup {
        /// Account password; read from MATRIX_PASSWORD when omitted
        password: Option<String>,
    },
    /// Log the device out and delete the local store
    Logout,
    /// Show this device's identity and store state
    Status,
    /// List this account's devices with their trust and fingerprints
    Devices,
    /// Send an encrypted text message
    Send {
        /// Room id or alias
        room: String,
        message: String,
    },
    /// Print recent messages, decrypting what we can
    Read {
        /// Room id or alias
        room: String,
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Verify this device interactively with another of our devices
    Verify {
        /// Device to verify with; picked automatically when omitted
        #[arg(long, value_name = "ID", conflicts_with = "wait")]
        device: Option<String>,
        /// Wait for another device to start verification instead
        #[arg(long)]
        wait: bool,
        /// Accept the code without asking (for supervised runs via the code file)
        #[arg(long)]
        yes: bool,
    },
    /// Ask our verified devices for missing room keys, then try the backup
    FetchKeys {
        /// Room id or alias; every room with gaps when omitted
        room: Option<String>,
        /// Recent messages of the room to scan for missing keys
        #[arg(long, default_value = "100")]
        limit: u32,
        /// Seconds to wait for forwarded keys
        #[arg(long, visible_alias = "window", value_name = "SECS")]
        sync_time: Option<u64>,
        /// Restore from the key backup with this recovery key if gaps remain
        #[arg(long, value_name = "KEY", conflicts_with = "passphrase")]
        recovery_key: Option<String>,
        /// Restore from the key backup with this passphrase if gaps remain
        #[arg(long, value_name = "PASSPHRASE")]
        passphrase: Option<String>,
    },
    /// Server-side key backup
    Backup {
        #[command(subcommand)]
        action: BackupAction,
    },
}

#[derive(Subcommand)]
enum BackupAction {
    /// Show the backup version and local session counts
    Status,
    /// Restore room keys from the backup
    #[command(group(ArgGroup::new("credential").required(true).args(["recovery_key", "passphrase"])))]
    Restore {
        #[arg(long, value_name = "KEY")]
        recovery_key: Option<String>,
        #[arg(long, value_name = "PASSPHRASE")]
        passphrase: Option<String>,
        /// Restore every room, not only rooms with missing keys
        #[arg(long)]
        all: bool,
    },
}

fn exit_code(err: &MxError) -> u8 {
    if err.is_configuration() {
        2
    } else if err.is_verification_failure() {
        3
    } else {
        1
    }
}

fn emit<T: Serialize>(json: bool, value: &T, human: impl FnOnce(&T)) -> Result<(), MxError> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        human(value);
    }
    Ok(())
}

fn recovery_credential(recovery_key: Option<String>, passphrase: Option<String>) -> Option<RecoveryCredential> {
    match (recovery_key, passphrase) {
        (Some(key), _) => Some(RecoveryCredential::RecoveryKey(Zeroizing::new(key))),
        (None, Some(p)) => Some(RecoveryCredential::Passphrase(Zeroizing::new(p))),
        (None, None) => None,
    }
}

async fn confirm_prompt<W, R>(question: &str, out: &mut W, mut input: R) -> Result<bool, MxError>
where
    W: AsyncWrite + Unpin,
    R: AsyncBufRead + Unpin,
{
    let io = |e: std::io::Error| MxError::Storage(format!("prompt: {e}"));
    out.write_all(question.as_bytes()).await.map_err(io)?;
    out.flush().await.map_err(io)?;
    let mut line = String::new();
    input.read_line(&mut line).await.map_err(io)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn run(cli: Cli, mut config: AgentConfig) -> Result<(), MxError> {
    if let Some(secs) = cli.timeout {
        config.operation_timeout_secs = secs;
        config.verification_timeout_secs = secs;
    }
    let json = cli.json;

    match cli.command {
        Command::Setup { password } => {
            let password = match password.or_else(|| std::env::var("MATRIX_PASSWORD").ok()) {
                Some(p) => Zeroizing::new(p),
                None => {
                    return Err(MxError::Config(
                        "no password given; pass it as an argument or set MATRIX_PASSWORD".into(),
                    ))
                }
            };
            let report = service::setup(&config, password).await?;
            emit(json, &report, |r| {
                println!("device {} created for {}", r.device_id, r.user_id);
                println!("name:        {}", r.display_name);
                println!("fingerprint: {}", r.fingerprint);
            })
        }
        Command::Logout => {
            let creds = service::logout(&config).await?;
            let device = creds.as_ref().map(|c| c.device_id.clone());
            emit(json, &serde_json::json!({ "logged_out": device }), |_| match &device {
                Some(d) => println!("device {d} logged out; local store removed"),
                None => println!("not set up; nothing to do"),
            })
        }
        Command::Status => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let status = session.status()?;
            emit(json, &status, |s| {
                println!("user:        {}", s.user_id);
                println!("device:      {}", s.device_id);
                println!("homeserver:  {}", s.homeserver);
                println!("fingerprint: {}", s.fingerprint);
                println!("trust:       {}", s.trust_policy);
                println!("verified own devices: {}", s.verified_own_devices);
                println!("pending key gaps:     {}", s.pending_gaps);
            })
        }
        Command::Devices => {
            let session = AgentSession::open(config).await?;
            let devices = session.devices().await?;
            emit(json, &devices, |list| {
                for d in list {
                    println!(
                        "{}{:<12} {:<11} {}  {}",
                        if d.current { "* " } else { "  " },
                        d.device_id,
                        d.trust,
                        d.fingerprint,
                        d.display_name.as_deref().unwrap_or("")
                    );
                }
            })
        }
        Command::Send { room, message } => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let event_id = session.manager().send_message(&room, &message).await?;
            emit(json, &serde_json::json!({ "event_id": event_id }), |_| println!("{event_id}"))
        }
        Command::Read { room, limit } => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let messages = session.manager().read(&room, limit).await?;
            emit(json, &messages, |list| {
                for m in list {
                    let marker = match m.status {
                        MessageStatus::Plaintext => " (unencrypted)",
                        _ => "",
                    };
                    println!("{} {}: {}{marker}", m.event_id, m.sender, m.body);
                }
            })
        }
        Command::Verify { device, wait, yes } => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let timeout = session.config().verification_timeout();
            let mut verifier = session.bridged_verifier(timeout);
            let pending = if wait {
                verifier.wait_for_request(timeout).await?
            } else {
                verifier.begin_verification(device.as_deref()).await?
            };
            if !json {
                println!("verifying with {}", pending.peer.label());
                println!("  {}", pending.short_code.emoji_line());
                println!("  {}", pending.short_code.decimal_line());
            }
            // The question goes to stderr so `--json` output stays parseable.
            let confirmed = yes
                || confirm_prompt(
                    "Do the codes match on the other device? [y/N] ",
                    &mut tokio::io::stderr(),
                    BufReader::new(tokio::io::stdin()),
                )
                .await?;
            if !confirmed {
                verifier.reject_code(&pending.transaction_id).await?;
                return Err(MxError::CodeMismatch);
            }
            let outcome = verifier.confirm_verification(&pending.transaction_id).await?;
            emit(json, &outcome, |o| {
                println!("{} {} verified", o.user_id, o.device_id);
                if o.keys_requested > 0 {
                    println!("requested {} missing room keys from it", o.keys_requested);
                }
            })
        }
        Command::FetchKeys {
            room,
            limit,
            sync_time,
            recovery_key,
            passphrase,
        } => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let window = sync_time
                .map(Duration::from_secs)
                .unwrap_or_else(|| session.config().key_request_window());
            let options = FetchOptions {
                scan_limit: limit,
                window,
                min_interval: window,
            };
            let credential = recovery_credential(recovery_key, passphrase);
            let recovery = session.recovery().on_progress(move |line| {
                if !json {
                    println!("{line}");
                }
            });
            let report = recovery
                .fetch_keys(room.as_deref(), &options, credential.as_ref())
                .await?;
            emit(json, &report, |_| {})
        }
        Command::Backup { action } => {
            let session = AgentSession::open(config).await?;
            session.catch_up().await?;
            let recovery = session.recovery().on_progress(move |line| {
                if !json {
                    println!("{line}");
                }
            });
            match action {
                BackupAction::Status => {
                    let status = recovery.backup_status().await?;
                    emit(json, &status, |s| {
                        match &s.backup {
                            Some(b) => println!(
                                "backup version {} ({}), {} keys, etag {}",
                                b.version,
                                b.algorithm,
                                b.count,
                                b.etag
                            ),
                            None => println!("no key backup on the server"),
                        }
                        for (room, count) in &s.local_sessions {
                            println!("  {room}: {count} sessions");
                        }
                        println!("pending key gaps: {}", s.pending_gaps);
                    })
                }
                BackupAction::Restore {
                    recovery_key,
                    passphrase,
                    all,
                } => {
                    let credential = recovery_credential(recovery_key, passphrase).ok_or_else(|| {
                        MxError::Config("a recovery key or passphrase is required".into())
                    })?;
                    let report = recovery.restore_from_backup(&credential, all).await?;
                    emit(json, &report, |_| {})
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = AgentConfig::load(cli.config.as_deref());
    let level = config
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "warn".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&level)))
        .with_writer(std::io::stderr)
        .init();

    let json = cli.json;
    let result = match config {
        Ok(config) => run(cli, config).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({ "error": e.to_string(), "remediation": e.remediation() })
                );
            } else {
                eprintln!("error: {e}");
                eprintln!("hint: {}", e.remediation());
            }
            ExitCode::from(exit_code(&e))
        }
    }
}
