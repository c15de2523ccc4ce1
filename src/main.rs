use anyhow::{Context, Result};
use clap::{ArgGroup, Parser};
use log::info;
use std::path::PathBuf;

use signin_audit::config::{AuthConfig, InputMode, RunConfig};
use signin_audit::input::{self, ResolvedInput};
use signin_audit::report;
use signin_audit::runner;
use signin_audit::{GraphClient, Session};

#[derive(Parser, Debug)]
#[command(name = "signin_audit")]
#[command(about = "Report which directory accounts signed in within the last N days")]
#[command(group(ArgGroup::new("source").required(true).args(["input", "group"])))]
struct Args {
    /// CSV file of users to audit (header row with an email column)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Audit the enabled user members of this group (email or display name)
    #[arg(short, long)]
    group: Option<String>,

    /// Day threshold for a "recent" sign-in (1-90, out-of-range is clamped)
    #[arg(short, long, default_value_t = 30)]
    days: u32,

    /// Report output path
    #[arg(short, long, default_value = "signin_report.csv")]
    output: PathBuf,

    /// Directory tenant id
    #[arg(long, env = "AUDIT_TENANT_ID")]
    tenant_id: String,

    /// OAuth client id of the audit application
    #[arg(long, env = "AUDIT_CLIENT_ID")]
    client_id: String,

    /// Authority base URL
    #[arg(
        long,
        env = "AUDIT_AUTH_URL",
        default_value = "https://login.microsoftonline.com"
    )]
    auth_url: String,

    /// Directory API base URL
    #[arg(
        long,
        env = "AUDIT_GRAPH_URL",
        default_value = "https://graph.microsoft.com"
    )]
    graph_url: String,

    /// Skip interactive sign-in and use the device code flow directly
    #[arg(long)]
    device_code: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(log_level));

    info!("Starting signin_audit v{}", env!("CARGO_PKG_VERSION"));

    let mode = match (&args.input, &args.group) {
        (Some(path), _) => InputMode::File(path.clone()),
        (None, Some(group)) => InputMode::Group(group.clone()),
        (None, None) => anyhow::bail!("either --input or --group is required"),
    };
    let run_cfg = RunConfig::new(mode, args.days, args.output.clone());
    let auth_cfg = AuthConfig {
        tenant_id: args.tenant_id.clone(),
        client_id: args.client_id.clone(),
        auth_base_url: args.auth_url.clone(),
        graph_base_url: args.graph_url.clone(),
        scopes: "User.Read.All AuditLog.Read.All GroupMember.Read.All".into(),
        force_device_code: args.device_code,
    };
    auth_cfg.validate().context("Invalid configuration")?;

    // File input is validated before any API call, including the session
    // handshake: a bad file should never prompt a sign-in. Group resolution
    // has to wait for the session.
    let pending = match &run_cfg.mode {
        InputMode::File(path) => PendingInput::Resolved(input::resolve_from_file(path)?),
        InputMode::Group(group) => PendingInput::Group(group.clone()),
    };

    let mut session = Session::connect(&auth_cfg)
        .await
        .context("Could not establish a directory session")?;

    // The session is released on every path out of the run.
    let outcome = run(&session, &run_cfg, &auth_cfg.graph_base_url, pending).await;
    session.disconnect();

    let written = outcome?;
    info!("Report written to {}", written.display());
    Ok(())
}

/// Input that is either already resolved (file mode, validated up front) or
/// still needs the authenticated client (group mode).
enum PendingInput {
    Resolved(ResolvedInput),
    Group(String),
}

async fn run(
    session: &Session,
    cfg: &RunConfig,
    graph_base_url: &str,
    pending: PendingInput,
) -> Result<PathBuf> {
    let client = GraphClient::new(session, graph_base_url);

    let resolved = match pending {
        PendingInput::Resolved(resolved) => resolved,
        PendingInput::Group(group) => input::resolve_from_group(&client, &group).await?,
    };
    if resolved.skipped_blank_rows > 0 {
        info!(
            "Skipped {} input row(s) with a blank identifier",
            resolved.skipped_blank_rows
        );
    }

    let mut report = runner::run_batch(&client, &resolved.users, cfg.threshold_days, |p| {
        info!("[{}/{}] {}", p.index + 1, p.total, p.identifier);
    })
    .await;
    report.skipped_blank_rows = resolved.skipped_blank_rows;

    info!(
        "Processed {} user(s): {} looked up, {} error(s), {} within {} day(s), {} outside",
        report.total(),
        report.success_count(),
        report.error_count(),
        report.within_count(),
        cfg.threshold_days,
        report.outside_count()
    );

    let written = report::write_report(&report, cfg.threshold_days, &cfg.output)?;
    Ok(written)
}
