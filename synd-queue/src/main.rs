//! synd-queue - Manage the publishing queue
//!
//! Unix-style front end to the job queue, connected accounts and the
//! scheduler's operational state.

use std::io::{self, Read};
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use libsyndicate::clock::{Clock, SystemClock};
use libsyndicate::config::resolve_config_path;
use libsyndicate::credentials::{AccountInfo, ConnectRequest};
use libsyndicate::db::JobFilter;
use libsyndicate::error::CredentialError;
use libsyndicate::logging::{LogFormat, LoggingConfig};
use libsyndicate::platforms::AdapterRegistry;
use libsyndicate::scheduling::{format_timestamp, parse_duration_ms, parse_run_at};
use libsyndicate::service::health::HealthReport;
use libsyndicate::{
    Config, EnqueueOutcome, EnqueueRequest, JobPayload, JobState, JobStatus, OAuthGrant, Platform,
    Result, SyndicateError, SyndicateService, TokenCipher,
};
use serde::Serialize;
use zeroize::Zeroizing;

#[derive(Parser, Debug)]
#[command(name = "synd-queue")]
#[command(version)]
#[command(about = "Manage the multi-account publishing queue")]
#[command(long_about = "\
synd-queue - Manage the multi-account publishing queue

DESCRIPTION:
    synd-queue submits publish jobs, inspects and cancels them, connects
    platform accounts and tunes how the fair-share scheduler treats each
    account. Jobs are executed by synd-worker.

COMMANDS:
    enqueue     Submit a publish job
    status      Show one job
    cancel      Cancel a pending job
    list        List jobs
    connect     Store OAuth tokens for an account
    disconnect  Disable an account
    accounts    List connected accounts
    tune        Change an account's priority, weight, cooldown or state
    health      Breaker states, job counts and starved accounts
    keygen      Generate the master key used to encrypt tokens

USAGE EXAMPLES:
    # Post on a specific account in 30 minutes
    synd-queue enqueue --token acct-1 --platform tiktok --caption \"hi\" --at 30m

    # Let the scheduler pick the account
    synd-queue enqueue --auto --platform instagram --caption \"hi\" --media https://cdn/x.jpg

    # Connect an account, reading the tokens from stdin
    printf '%s\\n%s\\n' \"$ACCESS\" \"$REFRESH\" | synd-queue connect acct-1 --platform x --stdin

    # Machine-readable output
    synd-queue list --status pending --format json

CONFIGURATION:
    Configuration file: ~/.config/syndicate/config.toml
    Database location: ~/.local/share/syndicate/scheduler.db

    Override with environment variables:
        SYNDICATE_CONFIG      - Path to config file
        SYNDICATE_DB_PATH     - Path to database file
        SYNDICATE_MASTER_KEY  - age secret key (instead of the key file)

EXIT CODES:
    0 - Success
    1 - Operation failed (unknown job, credential problem)
    2 - Database or configuration error
    3 - Invalid input (bad platform, time format, payload, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: text or json
    #[arg(long, global = true, default_value = "text")]
    format: String,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a publish job
    Enqueue {
        /// Account to publish from
        #[arg(long, required_unless_present = "auto", conflicts_with = "auto")]
        token: Option<String>,

        /// Let the scheduler pick the account and add human-like jitter
        #[arg(long)]
        auto: bool,

        /// Target platform (instagram, tiktok, x, reddit)
        #[arg(short, long)]
        platform: String,

        /// Post caption
        #[arg(short, long, default_value = "")]
        caption: String,

        /// Media reference
        #[arg(short, long)]
        media: Option<String>,

        /// When to publish ("now", "30m", "tomorrow 3pm", "random:30m-90m")
        #[arg(long, default_value = "now", conflicts_with = "auto")]
        at: String,

        /// Idempotency key; derived from the payload when omitted
        #[arg(long)]
        dedupe: Option<String>,
    },

    /// Show one job
    Status {
        job_id: String,
    },

    /// Cancel a pending job
    Cancel {
        job_id: String,
    },

    /// List jobs, newest schedule last
    List {
        #[arg(long)]
        token: Option<String>,

        #[arg(short, long)]
        platform: Option<String>,

        /// pending, running, succeeded, failed or cancelled
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long)]
        limit: Option<u32>,
    },

    /// Store OAuth tokens for an account (creates or replaces it)
    Connect {
        account_id: String,

        #[arg(short, long)]
        platform: String,

        /// Platform user id
        #[arg(long)]
        user_id: Option<String>,

        /// Read the access token (and optionally the refresh token on the
        /// second line) from stdin
        #[arg(long)]
        stdin: bool,

        /// Also prompt for a refresh token
        #[arg(long, conflicts_with = "stdin")]
        with_refresh_token: bool,

        /// Access token lifetime ("2h", "60d"); platform default when omitted
        #[arg(long)]
        expires_in: Option<String>,

        /// Granted scope, repeatable
        #[arg(long = "scope")]
        scopes: Vec<String>,
    },

    /// Disable an account; reconnect to enable it again
    Disconnect {
        account_id: String,
    },

    /// List connected accounts (no token material)
    Accounts,

    /// Change how the scheduler treats an account
    Tune {
        token_id: String,

        /// Lower is more urgent
        #[arg(long)]
        priority: Option<i64>,

        #[arg(long)]
        weight: Option<i64>,

        /// Keep the account out of selection for this long ("2h")
        #[arg(long, conflicts_with = "clear_cooldown")]
        cooldown: Option<String>,

        #[arg(long)]
        clear_cooldown: bool,

        /// Resume scheduling
        #[arg(long, conflicts_with = "pause")]
        resume: bool,

        /// Stop scheduling without touching credentials
        #[arg(long)]
        pause: bool,
    },

    /// Breaker states, job counts and starved accounts
    Health,

    /// Generate the master key file
    Keygen {
        /// Destination; defaults to credentials.master_key_file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = SyndicateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(SyndicateError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "error" };
    LoggingConfig::new(LogFormat::Text, level.to_string(), cli.verbose).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let format: OutputFormat = cli.format.parse()?;
    let config = load_config()?;

    // No adapters: this process only reads and writes the store
    let service = SyndicateService::from_config(config, AdapterRegistry::new()).await?;
    let now = SystemClock.now_ms();

    let result = match cli.command {
        Commands::Enqueue {
            token,
            auto,
            platform,
            caption,
            media,
            at,
            dedupe,
        } => {
            let platform: Platform = platform.parse()?;
            let mut payload = JobPayload::text(caption);
            if let Some(media) = media {
                payload = payload.with_media(media);
            }

            let outcome = if auto {
                service
                    .queue()
                    .enqueue_auto(platform, payload, dedupe, now)
                    .await?
            } else {
                let token = token.ok_or_else(|| {
                    SyndicateError::InvalidInput("--token or --auto is required".to_string())
                })?;
                let mut request = EnqueueRequest::new(token, platform, payload);
                // "now" stays an ASAP request so resubmitting it deduplicates
                let run_at = parse_run_at(&at, now)?;
                if run_at > now {
                    request = request.at(run_at);
                }
                if let Some(key) = dedupe {
                    request = request.with_dedupe_key(key);
                }
                service.queue().enqueue(request, now).await?
            };
            output_enqueue(&outcome, format)
        }
        Commands::Status { job_id } => {
            let state = service.queue().get_status(&job_id).await?;
            match format {
                OutputFormat::Json => print_json(&state),
                OutputFormat::Text => {
                    output_job_detail(&state);
                    Ok(())
                }
            }
        }
        Commands::Cancel { job_id } => {
            if !service.queue().cancel(&job_id, now).await? {
                let state = service.queue().get_status(&job_id).await?;
                return Err(SyndicateError::InvalidInput(format!(
                    "Job {} is {} and can no longer be cancelled",
                    job_id, state.status
                )));
            }
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "job_id": job_id,
                    "status": JobStatus::Cancelled,
                })),
                OutputFormat::Text => {
                    println!("Cancelled {}", job_id);
                    Ok(())
                }
            }
        }
        Commands::List {
            token,
            platform,
            status,
            limit,
        } => {
            let filter = JobFilter {
                token_id: token,
                platform: platform.map(|p| p.parse()).transpose()?,
                status: status.map(|s| s.parse()).transpose()?,
                limit,
            };
            let jobs = service.queue().list(&filter).await?;
            match format {
                OutputFormat::Json => print_json(&jobs),
                OutputFormat::Text => {
                    output_job_list(&jobs, now);
                    Ok(())
                }
            }
        }
        Commands::Connect {
            account_id,
            platform,
            user_id,
            stdin,
            with_refresh_token,
            expires_in,
            scopes,
        } => {
            let platform: Platform = platform.parse()?;
            let (access, refresh) = read_tokens(stdin, with_refresh_token)?;

            let mut grant = OAuthGrant::new(&access);
            if let Some(refresh) = refresh.as_deref() {
                grant = grant.with_refresh_token(refresh);
            }
            if let Some(expires_in) = expires_in {
                grant = grant.expires_in(parse_duration_ms(&expires_in)?);
            }
            grant.scopes = scopes;

            let info = service
                .credentials()?
                .connect_account(
                    ConnectRequest {
                        account_id,
                        user_id,
                        platform,
                        grant,
                    },
                    now,
                )
                .await?;
            match format {
                OutputFormat::Json => print_json(&info),
                OutputFormat::Text => {
                    println!("Connected {} on {}", info.account_id, info.platform);
                    if let Some(expires_at) = info.expires_at {
                        println!("  access token expires {}", format_timestamp(expires_at));
                    }
                    Ok(())
                }
            }
        }
        Commands::Disconnect { account_id } => {
            if !service.credentials()?.disconnect_account(&account_id, now).await? {
                return Err(SyndicateError::NotFound(format!("Account {}", account_id)));
            }
            match format {
                OutputFormat::Json => print_json(&serde_json::json!({
                    "account_id": account_id,
                    "is_active": false,
                })),
                OutputFormat::Text => {
                    println!("Disconnected {}", account_id);
                    Ok(())
                }
            }
        }
        Commands::Accounts => {
            let accounts = service.credentials()?.list_accounts().await?;
            match format {
                OutputFormat::Json => print_json(&accounts),
                OutputFormat::Text => {
                    output_accounts(&accounts, now);
                    Ok(())
                }
            }
        }
        Commands::Tune {
            token_id,
            priority,
            weight,
            cooldown,
            clear_cooldown,
            resume,
            pause,
        } => {
            let cooldown_until = match cooldown {
                Some(duration) => Some(Some(now + parse_duration_ms(&duration)?)),
                None if clear_cooldown => Some(None),
                None => None,
            };

            let db = service.database();
            if !db
                .update_token_tuning(&token_id, priority, weight, cooldown_until, now)
                .await?
            {
                return Err(SyndicateError::NotFound(format!("Token {}", token_id)));
            }
            if resume || pause {
                db.set_token_active(&token_id, resume, now).await?;
            }

            let record = db
                .get_token_record(&token_id)
                .await?
                .ok_or_else(|| SyndicateError::NotFound(format!("Token {}", token_id)))?;
            match format {
                OutputFormat::Json => print_json(&record),
                OutputFormat::Text => {
                    println!(
                        "{} | priority {} | weight {} | {} | cooldown {}",
                        record.token_id,
                        record.priority,
                        record.weight,
                        if record.is_active { "active" } else { "paused" },
                        record
                            .cooldown_until
                            .map(format_timestamp)
                            .unwrap_or_else(|| "none".to_string())
                    );
                    Ok(())
                }
            }
        }
        Commands::Health => {
            let report = service.health(now).await?;
            match format {
                OutputFormat::Json => print_json(&report),
                OutputFormat::Text => {
                    output_health(&report, now);
                    Ok(())
                }
            }
        }
        Commands::Keygen { output } => cmd_keygen(service.config(), output, format),
    };

    // Enqueue and cancel counters join the totals the workers flush
    service.flush_metrics(SystemClock.now_ms()).await?;
    result
}

/// Configured file when present, built-in defaults otherwise
fn load_config() -> Result<Config> {
    let path = resolve_config_path()?;
    if path.exists() {
        Config::load_from_path(&path)
    } else {
        tracing::debug!(path = %path.display(), "No config file, using defaults");
        Ok(Config::default_config())
    }
}

fn cmd_keygen(config: &Config, output: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let path = match output {
        Some(path) => path,
        None => {
            let configured = config
                .credentials
                .master_key_file
                .as_deref()
                .ok_or(CredentialError::MasterKeyNotSet)?;
            PathBuf::from(shellexpand::tilde(configured).to_string())
        }
    };

    let recipient = TokenCipher::generate_key_file(&path)?;
    match format {
        OutputFormat::Json => print_json(&serde_json::json!({
            "path": path.display().to_string(),
            "recipient": recipient,
        })),
        OutputFormat::Text => {
            println!("Wrote master key to {}", path.display());
            println!("Public key: {}", recipient);
            Ok(())
        }
    }
}

/// Access token and optional refresh token, from stdin or interactive prompts
fn read_tokens(
    use_stdin: bool,
    with_refresh_token: bool,
) -> Result<(Zeroizing<String>, Option<Zeroizing<String>>)> {
    let (access, refresh) = if use_stdin {
        let mut buffer = Zeroizing::new(String::new());
        io::stdin()
            .read_to_string(&mut buffer)
            .map_err(CredentialError::Io)?;
        let mut lines = buffer.lines().map(str::trim).filter(|l| !l.is_empty());
        let access = Zeroizing::new(lines.next().unwrap_or_default().to_string());
        let refresh = lines.next().map(|l| Zeroizing::new(l.to_string()));
        (access, refresh)
    } else {
        let access = Zeroizing::new(
            rpassword::prompt_password("Access token: ").map_err(CredentialError::Io)?,
        );
        let refresh = if with_refresh_token {
            Some(Zeroizing::new(
                rpassword::prompt_password("Refresh token: ").map_err(CredentialError::Io)?,
            ))
        } else {
            None
        };
        (access, refresh)
    };

    if access.trim().is_empty() {
        return Err(SyndicateError::InvalidInput(
            "Access token cannot be empty".to_string(),
        ));
    }
    Ok((access, refresh.filter(|r| !r.trim().is_empty())))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| {
        SyndicateError::InvalidInput(format!("Failed to serialize output: {}", e))
    })?;
    println!("{}", json);
    Ok(())
}

fn output_enqueue(outcome: &EnqueueOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => print_json(outcome),
        OutputFormat::Text => {
            if outcome.is_duplicate() {
                println!("{} (duplicate)", outcome.job_id());
            } else {
                println!("{}", outcome.job_id());
            }
            Ok(())
        }
    }
}

fn output_job_detail(job: &JobState) {
    println!("job_id:       {}", job.job_id);
    println!("token:        {}", job.token_id);
    println!("platform:     {}", job.platform);
    println!("status:       {}", job.status);
    println!("scheduled_at: {}", format_timestamp(job.scheduled_at));
    println!("attempts:     {}", job.attempts);
    if let Some(code) = &job.error_code {
        println!("error_code:   {}", code);
    }
    if let Some(error) = &job.last_error {
        println!("last_error:   {}", error);
    }
    if let Some(id) = &job.external_id {
        println!("external_id:  {}", id);
    }
    if let Some(url) = &job.external_url {
        println!("external_url: {}", url);
    }
}

fn output_job_list(jobs: &[JobState], now: i64) {
    for job in jobs {
        let when = if job.status == JobStatus::Pending {
            format_time_until(now, job.scheduled_at)
        } else {
            job.error_code.clone().unwrap_or_default()
        };
        println!(
            "{} | {} | {} | {} | {}",
            job.job_id, job.token_id, job.platform, job.status, when
        );
    }
}

fn output_accounts(accounts: &[AccountInfo], now: i64) {
    for account in accounts {
        let expiry = match account.expires_at {
            Some(at) if at <= now => "expired".to_string(),
            Some(at) => format!("expires {}", format_time_until(now, at)),
            None => "expiry unknown".to_string(),
        };
        println!(
            "{} | {} | {} | {}",
            account.account_id,
            account.platform,
            if account.is_active { "active" } else { "inactive" },
            expiry
        );
    }
}

fn output_health(report: &HealthReport, now: i64) {
    println!("Tokens:");
    for token in &report.tokens {
        let mut line = format!(
            "  {} | {} | {} | failures {}",
            token.token_id, token.platform, token.circuit_state, token.consecutive_failures
        );
        if !token.is_active {
            line.push_str(" | inactive");
        }
        if let Some(until) = token.cooldown_until.filter(|until| *until > now) {
            line.push_str(&format!(" | cooldown {}", format_time_until(now, until)));
        }
        println!("{}", line);
    }

    println!("Jobs:");
    for (status, count) in &report.jobs {
        println!("  {}: {}", status, count);
    }

    if !report.starved.is_empty() {
        println!("Starved:");
        for starved in &report.starved {
            println!(
                "  {} | {} | {}s without a slot",
                starved.token_id,
                starved.platform,
                starved.starved_for_ms / 1000
            );
        }
    }

    let metrics = &report.metrics;
    println!("Metrics:");
    println!(
        "  jobs: {} enqueued, {} succeeded, {} failed, {} retried, {} deferred",
        metrics.jobs_enqueued,
        metrics.jobs_succeeded,
        metrics.jobs_failed,
        metrics.jobs_retried,
        metrics.jobs_rescheduled
    );
    println!(
        "  rate limits: {} hits, {} penalties",
        metrics.rate_limit_hits, metrics.rate_limit_penalties
    );
    println!(
        "  credentials: {} refreshes, {} refresh failures; {} circuits opened",
        metrics.token_refreshes, metrics.token_refresh_failures, metrics.circuit_opens
    );

    println!(
        "Status: {}",
        if report.is_healthy() { "healthy" } else { "degraded" }
    );
}

/// Time until `at` in human-readable form
fn format_time_until(now: i64, at: i64) -> String {
    let diff = (at - now) / 1000;

    if diff < 0 {
        return "overdue".to_string();
    }

    let minutes = diff / 60;
    let hours = minutes / 60;
    let days = hours / 24;

    if days > 0 {
        format!("in {} day{}", days, if days == 1 { "" } else { "s" })
    } else if hours > 0 {
        format!("in {} hour{}", hours, if hours == 1 { "" } else { "s" })
    } else if minutes > 0 {
        format!("in {} minute{}", minutes, if minutes == 1 { "" } else { "s" })
    } else {
        "in <1 minute".to_string()
    }
}
