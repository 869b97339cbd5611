// ExecGate - Main Entry Point
//
// Command-line front end for the gateway:
// - run a single command through the full pipeline
// - dry-run validation
// - audit export and payload decryption
// - key generation, metrics and effective config

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use execgate::audit::{AuditQuery, AuditSink, JsonlAuditSink, RedactedCommand, PAYLOAD_PURPOSE};
use execgate::command::{CommandRequest, CommandValidator, ValidationResult};
use execgate::config::{Config, LoggingConfig};
use execgate::crypto::SecretBox;
use execgate::identity::{CredentialPair, Identity, SecretString};
use execgate::{metrics, Gateway};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

/// ExecGate: command-execution security gateway
#[derive(Parser, Debug)]
#[command(name = "execgate")]
#[command(author = "ExecGate Contributors")]
#[command(version)]
#[command(about = "Security gateway for container-orchestration CLI commands", long_about = None)]
struct Args {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the config file (defaults to the XDG config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one operation through the gateway
    Run {
        /// Principal issuing the command
        #[arg(long)]
        principal: String,

        /// Access token passed to the wrapped tool
        #[arg(long, env = "EXECGATE_ACCESS_TOKEN", hide_env_values = true)]
        token: String,

        /// Refresh token used when the access token is rejected
        #[arg(long, env = "EXECGATE_REFRESH_TOKEN", hide_env_values = true)]
        refresh_token: Option<String>,

        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,

        /// Target server the command operates on
        #[arg(long)]
        context: Option<String>,

        /// Timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Skip the result cache
        #[arg(long)]
        fresh: bool,

        /// Operation name (see `validate --list`)
        operation: String,

        /// Operation arguments
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Validate an operation without running it
    Validate {
        /// List the known operations instead
        #[arg(long)]
        list: bool,

        /// Target server the command would operate on
        #[arg(long)]
        context: Option<String>,

        /// Operation name
        #[arg(required_unless_present = "list")]
        operation: Option<String>,

        /// Operation arguments
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Export audit entries from a JSON-lines audit file
    Audit {
        /// Audit file (defaults to `[audit] path`)
        #[arg(long)]
        path: Option<PathBuf>,

        /// Only entries for this principal
        #[arg(long)]
        principal: Option<String>,

        /// Only the most recent N entries
        #[arg(long)]
        limit: Option<usize>,

        /// Decrypt each entry's command line with the configured key
        #[arg(long)]
        decrypt: bool,
    },
    /// Generate a base64 audit key
    Keygen,
    /// Print Prometheus metrics
    Metrics,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_tracing(&config.logging, args.verbose)?;

    match args.command {
        Commands::Run {
            principal,
            token,
            refresh_token,
            expires_in,
            context,
            timeout,
            fresh,
            operation,
            args,
        } => {
            let credential = CredentialPair::new(
                token,
                refresh_token.map(SecretString::new),
                Utc::now() + chrono::Duration::seconds(expires_in),
            );
            let mut request = CommandRequest::new(Identity::new(principal), operation, args);
            if let Some(context) = context {
                request = request.with_context(context);
            }
            if let Some(secs) = timeout {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            if fresh {
                request = request.bypass_cache();
            }
            let code = run_command(&config, credential, request).await?;
            std::process::exit(code);
        }
        Commands::Validate {
            list,
            context,
            operation,
            args,
        } => {
            let code = validate_command(&config, list, context, operation, args);
            std::process::exit(code);
        }
        Commands::Audit {
            path,
            principal,
            limit,
            decrypt,
        } => export_audit(&config, path, principal, limit, decrypt).await?,
        Commands::Keygen => {
            let (_, key) = SecretBox::generate();
            println!("{}", key);
        }
        Commands::Metrics => {
            metrics::init().context("Failed to register metrics")?;
            print!("{}", metrics::gather_metrics()?);
        }
        Commands::Config => {
            let rendered = toml::to_string_pretty(&config).context("Failed to render config")?;
            print!("{}", rendered);
        }
    }

    Ok(())
}

/// Logs go to stderr so stdout carries only command results
fn init_tracing(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let level = if verbose {
        Level::DEBUG
    } else {
        logging.level.parse::<Level>().unwrap_or(Level::INFO)
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match logging.format.as_str() {
        "json" => builder.json().try_init(),
        "compact" => builder.compact().try_init(),
        _ => builder.pretty().try_init(),
    }
    .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}

/// Run a request through the gateway; returns the process exit code
async fn run_command(config: &Config, credential: CredentialPair, request: CommandRequest) -> Result<i32> {
    metrics::init().context("Failed to register metrics")?;
    let gateway = Gateway::from_config(config)?;
    let session = gateway.open_session(request.identity().clone(), credential);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; cancelling command");
            on_signal.cancel();
        }
    });

    let result = gateway.submit(&session, request, cancel).await;
    if let Err(e) = gateway.flush_audit().await {
        warn!(error = %e, "Audit flush failed");
    }

    match result {
        Ok(response) => {
            if response.cached {
                info!("Served from cache");
            } else if let Some(record) = &response.record {
                info!(execution_id = %record.execution_id(), "{}", record.summary());
            }
            print!("{}", response.protocol);
            if !response.diagnostics.is_empty() {
                eprint!("{}", response.diagnostics);
            }
            Ok(0)
        }
        Err(e) => {
            if let Some(response) = e.response() {
                print!("{}", response.protocol);
                eprint!("{}", response.diagnostics);
            }
            eprintln!("error [{}]: {}", e.code(), e.public_message());
            if let Some(retry_after) = e.retry_after() {
                eprintln!("retry after {}s", retry_after.as_secs().max(1));
            }
            Ok(1)
        }
    }
}

fn validate_command(
    config: &Config,
    list: bool,
    context: Option<String>,
    operation: Option<String>,
    args: Vec<String>,
) -> i32 {
    let validator = CommandValidator::new(Arc::new(config.registry()))
        .with_max_json_depth(config.validation.max_json_depth)
        .with_max_arg_len(config.validation.max_arg_len)
        .with_max_timeout(config.executor.max_timeout());

    if list {
        for name in validator.registry().names() {
            println!("{}", name);
        }
        return 0;
    }

    let Some(operation) = operation else {
        return 2;
    };
    let mut request = CommandRequest::new(Identity::new("cli"), operation, args);
    if let Some(context) = context {
        request = request.with_context(context);
    }

    match validator.validate(&request) {
        ValidationResult::Accepted => {
            println!("accepted");
            0
        }
        ValidationResult::Rejected(rejection) => {
            println!("rejected: {}", rejection);
            2
        }
    }
}

async fn export_audit(
    config: &Config,
    path: Option<PathBuf>,
    principal: Option<String>,
    limit: Option<usize>,
    decrypt: bool,
) -> Result<()> {
    let path = path
        .or_else(|| config.audit.path.clone())
        .context("No audit file given and no [audit] path configured")?;
    let sink = JsonlAuditSink::new(path);

    let mut query = AuditQuery::all();
    if let Some(principal) = principal {
        query = query.principal(principal);
    }
    if let Some(limit) = limit {
        query = query.limit(limit);
    }
    let entries = sink.export(&query).await.context("Failed to read audit file")?;

    let sealer = if decrypt {
        Some(SecretBox::from_env(&config.crypto.key_env).context("Failed to load audit key")?)
    } else {
        None
    };

    for entry in entries {
        let mut line = serde_json::to_value(&entry)?;
        if let (Some(sealer), Some(payload)) = (&sealer, &entry.payload) {
            let command = sealer
                .open(payload, PAYLOAD_PURPOSE)
                .ok()
                .and_then(|plain| serde_json::from_slice::<RedactedCommand>(&plain).ok());
            line["command"] = match command {
                Some(command) => serde_json::to_value(command)?,
                None => serde_json::Value::String("<integrity check failed>".to_string()),
            };
        }
        println!("{}", line);
    }
    Ok(())
}
