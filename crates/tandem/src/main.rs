use std::env;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use futures::StreamExt;
use log::{LevelFilter, debug, info, warn};
use serde::Deserialize;
use tokio::net::TcpListener;

use tandem::api::{AppState, create_router};
use tandem::config::{self, APP_NAME, AppConfig, write_default_config};
use tandem::session::{ContinueRequest, StartRequest};
use tandem::supervisor::{OrchestratorBackend, READY_PREFIX, connect_backend};
use tandem_protocol::{PermissionDecision, Provider, ServerEvent, SessionStatus};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_serve(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

#[tokio::main]
async fn async_run(ctx: RuntimeContext, cmd: RunCommand) -> Result<()> {
    handle_run(&ctx, cmd).await
}

#[tokio::main]
async fn async_stop(ctx: RuntimeContext, cmd: StopCommand) -> Result<()> {
    handle_stop(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging()?;
    debug!("config file: {}", ctx.config_file.display());

    match cli.command {
        Command::Serve(cmd) => async_serve(ctx, cmd),
        Command::Run(cmd) => async_run(ctx, cmd),
        Command::Stop(cmd) => async_stop(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Tandem - coordinator for cancellable agent conversations.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Output machine readable JSON
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Output machine readable YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// Disable ANSI colors in output
    #[arg(long = "no-color", global = true, conflicts_with = "color")]
    no_color: bool,
    /// Control color output (auto, always, never)
    #[arg(long, value_enum, default_value_t = ColorOption::Auto, global = true)]
    color: ColorOption,
    /// Do not change anything on disk
    #[arg(long = "dry-run", global = true)]
    dry_run: bool,
    /// Assume "yes" for interactive prompts (approves every tool call in `run`)
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Emit additional diagnostics for troubleshooting
    #[arg(long = "diagnostics", global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorOption {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP + SSE server
    Serve(ServeCommand),
    /// Run one conversation turn and print its events as JSON lines
    Run(RunCommand),
    /// Stop the active run of a session on a running server
    Stop(StopCommand),
    /// Inspect and manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Host address to bind to (defaults to `server.host`)
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on (defaults to `server.port`)
    #[arg(short, long)]
    port: Option<u16>,
    /// Print `TANDEM_READY <addr>` on stdout once listening
    #[arg(long = "announce-ready")]
    announce_ready: bool,
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// Prompt to send
    #[arg(value_name = "PROMPT")]
    prompt: String,
    /// Provider backend for a new session
    #[arg(long, value_enum, default_value_t = ProviderArg::Claude)]
    provider: ProviderArg,
    /// Title of a new session (defaults to the start of the prompt)
    #[arg(long)]
    title: Option<String>,
    /// Working directory for the provider
    #[arg(long, value_name = "PATH")]
    cwd: Option<PathBuf>,
    /// Model override
    #[arg(long)]
    model: Option<String>,
    /// Continue this session (id or external id) instead of starting one
    #[arg(long = "session", value_name = "ID")]
    session: Option<String>,
    /// Continue the session holding this resume token
    #[arg(long = "resume-token", value_name = "TOKEN", conflicts_with = "session")]
    resume_token: Option<String>,
    /// Caller-supplied id for a new session, usable with `stop`
    #[arg(long = "external-id", value_name = "ID")]
    external_id: Option<String>,
    /// Tools pre-approved for the CLI provider
    #[arg(long = "allowed-tool", value_name = "TOOL")]
    allowed_tools: Vec<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ProviderArg {
    Claude,
    Codex,
}

impl From<ProviderArg> for Provider {
    fn from(value: ProviderArg) -> Self {
        match value {
            ProviderArg::Claude => Provider::Claude,
            ProviderArg::Codex => Provider::Codex,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct StopCommand {
    /// Session id or external id
    #[arg(value_name = "ID")]
    id: String,
    /// Server base URL (defaults to `http://<server.host>:<server.port>`)
    #[arg(long, value_name = "URL")]
    url: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Output the effective configuration
    Show,
    /// Print the resolved config file path
    Path,
    /// Write the default configuration file
    Init,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_file: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_file = match common.config.as_ref() {
            Some(path) => {
                let expanded = config::expand_str_path(&path.to_string_lossy())?;
                if expanded.is_dir() {
                    expanded.join("config.toml")
                } else {
                    expanded
                }
            }
            None => config::default_config_file()?,
        };
        let config = AppConfig::load(&config_file)?;
        Ok(Self {
            common,
            config_file,
            config,
        })
    }

    fn init_logging(&self) -> Result<()> {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return Ok(());
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("tandem={level},tower_http={level}"))
        });

        // Stdout is reserved for events and the readiness line.
        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(io::stderr),
                )
                .try_init()
                .ok();
        } else {
            let force_color = matches!(self.common.color, ColorOption::Always)
                || env::var_os("FORCE_COLOR").is_some();
            let disable_color = self.common.no_color
                || matches!(self.common.color, ColorOption::Never)
                || env::var_os("NO_COLOR").is_some()
                || (!force_color && !io::stderr().is_terminal());

            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_ansi(!disable_color)
                        .with_target(self.common.diagnostics)
                        .with_file(self.common.diagnostics)
                        .with_line_number(self.common.diagnostics),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder = env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(&self.config.logging.level),
        );
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();

        Ok(())
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            if ctx.common.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&ctx.config)
                        .context("serializing config to JSON")?
                );
            } else if ctx.common.yaml {
                println!(
                    "{}",
                    serde_yaml::to_string(&ctx.config).context("serializing config to YAML")?
                );
            } else {
                println!(
                    "{}",
                    toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
                );
            }
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.config_file.display());
            Ok(())
        }
        ConfigCommand::Init => {
            if ctx.common.dry_run {
                info!(
                    "dry-run: would write default config to {}",
                    ctx.config_file.display()
                );
                return Ok(());
            }
            if ctx.config_file.exists() && !ctx.common.assume_yes {
                return Err(anyhow!(
                    "config file {} already exists (use --yes to overwrite)",
                    ctx.config_file.display()
                ));
            }
            write_default_config(&ctx.config_file)?;
            info!("Wrote default config to {}", ctx.config_file.display());
            Ok(())
        }
    }
}

fn handle_completions(shell: Shell) -> Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, APP_NAME, &mut io::stdout());
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let service = tandem::build_service(&ctx.config).await?;

    let state = AppState::new(Arc::clone(&service))
        .with_cors_origins(ctx.config.server.cors_origins.clone());
    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let host = cmd.host.unwrap_or_else(|| ctx.config.server.host.clone());
    let port = cmd.port.unwrap_or(ctx.config.server.port);
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("invalid listen address {host}:{port}"))?;

    let listener = TcpListener::bind(addr)
        .await
        .context("binding to address")?;
    let local_addr = listener.local_addr().context("reading bound address")?;
    info!("Listening on {}", local_addr);

    if cmd.announce_ready {
        let mut stdout = io::stdout();
        writeln!(stdout, "{READY_PREFIX} {local_addr}").context("announcing readiness")?;
        stdout.flush().context("announcing readiness")?;
    }

    let shutdown_service = Arc::clone(&service);
    let graceful = async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        shutdown.cancel();
        let stopped = shutdown_service.stop_all();
        if stopped > 0 {
            info!("Stopped {} active run(s)", stopped);
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await
        .context("running server")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let config = ctx.config.clone();
    let backend = connect_backend(&ctx.config, Some(ctx.config_file.as_path()), || async move {
        tandem::build_service(&config).await
    })
    .await?;
    info!("Using {} backend", backend.mode());

    let result = run_turn(ctx, backend.as_ref(), cmd).await;
    backend.shutdown().await;
    result
}

async fn run_turn(
    ctx: &RuntimeContext,
    backend: &dyn OrchestratorBackend,
    cmd: RunCommand,
) -> Result<()> {
    let cwd = match cmd.cwd {
        Some(cwd) => Some(cwd),
        None => env::current_dir().ok(),
    }
    .map(|path| path.to_string_lossy().into_owned());

    let continuing = cmd.session.is_some() || cmd.resume_token.is_some();
    let mut events = if continuing {
        backend
            .continue_session(ContinueRequest {
                prompt: cmd.prompt,
                session_id: cmd.session,
                resume_token: cmd.resume_token,
                model: cmd.model,
            })
            .await?
    } else {
        let title = cmd
            .title
            .unwrap_or_else(|| default_title(&cmd.prompt));
        backend
            .start(StartRequest {
                title,
                prompt: cmd.prompt,
                cwd,
                provider: cmd.provider.into(),
                model: cmd.model,
                allowed_tools: (!cmd.allowed_tools.is_empty()).then_some(cmd.allowed_tools),
                external_id: cmd.external_id,
                metadata: None,
            })
            .await?
    };

    let mut session_id: Option<String> = None;
    let mut stop_sent = false;
    let mut final_status: Option<(SessionStatus, Option<String>)> = None;

    loop {
        let event = tokio::select! {
            event = events.next() => event,
            _ = tokio::signal::ctrl_c(), if !stop_sent => {
                stop_sent = true;
                match session_id.as_deref() {
                    Some(id) => {
                        info!("Stopping session {}", id);
                        if let Err(e) = backend.stop(id).await {
                            warn!("Failed to stop session {}: {}", id, e);
                        }
                    }
                    None => return Err(anyhow!("interrupted before the session started")),
                }
                continue;
            }
        };
        let Some(event) = event else {
            break;
        };

        if session_id.is_none() {
            session_id = event.session_id().map(str::to_string);
        }
        print_event(&event)?;

        match &event {
            ServerEvent::PermissionRequest {
                session_id,
                tool_use_id,
                tool_name,
                input,
            } => {
                let decision = decide_permission(ctx, tool_name, input).await;
                backend
                    .respond_permission(session_id, tool_use_id, decision)
                    .await?;
            }
            ServerEvent::SessionStatus { status, error, .. } if status.is_terminal() => {
                final_status = Some((*status, error.clone()));
            }
            _ => {}
        }
    }

    match final_status {
        Some((SessionStatus::Error, error)) => Err(anyhow!(
            "run failed: {}",
            error.unwrap_or_else(|| "unknown error".to_string())
        )),
        Some(_) => Ok(()),
        None => Err(anyhow!("event stream ended without a final status")),
    }
}

fn print_event(event: &ServerEvent) -> Result<()> {
    let line = serde_json::to_string(event).context("serializing event")?;
    let mut stdout = io::stdout();
    writeln!(stdout, "{line}").context("writing event")?;
    stdout.flush().context("writing event")
}

fn default_title(prompt: &str) -> String {
    let first_line = prompt.lines().next().unwrap_or_default().trim();
    let mut title: String = first_line.chars().take(60).collect();
    if first_line.chars().count() > 60 {
        title.push_str("...");
    }
    if title.is_empty() {
        "Untitled".to_string()
    } else {
        title
    }
}

/// Approve with `--yes`, ask on a terminal, deny otherwise.
async fn decide_permission(
    ctx: &RuntimeContext,
    tool_name: &str,
    input: &serde_json::Value,
) -> PermissionDecision {
    if ctx.common.assume_yes {
        return PermissionDecision::allow();
    }
    if !io::stdin().is_terminal() {
        return PermissionDecision::deny("Denied: no interactive terminal");
    }

    let prompt = format!("Allow {tool_name} with {input}? [y/N] ");
    let answer = tokio::task::spawn_blocking(move || {
        let mut stderr = io::stderr();
        let _ = write!(stderr, "{prompt}");
        let _ = stderr.flush();
        let mut line = String::new();
        io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
        Ok(Ok(line)) if matches!(line.trim(), "y" | "Y" | "yes") => PermissionDecision::allow(),
        _ => PermissionDecision::deny("Denied by user"),
    }
}

#[derive(Debug, Deserialize)]
struct StopResponse {
    stopped: bool,
}

async fn handle_stop(ctx: &RuntimeContext, cmd: StopCommand) -> Result<()> {
    let base = cmd.url.unwrap_or_else(|| {
        format!(
            "http://{}:{}",
            ctx.config.server.host, ctx.config.server.port
        )
    });
    let url = format!("{}/sessions/{}/stop", base.trim_end_matches('/'), cmd.id);

    let response = reqwest::Client::new()
        .post(&url)
        .send()
        .await
        .with_context(|| format!("contacting {url}"))?
        .error_for_status()
        .with_context(|| format!("stopping {}", cmd.id))?;
    let body: StopResponse = response.json().await.context("parsing stop response")?;

    if ctx.common.json {
        println!("{}", serde_json::json!({ "stopped": body.stopped }));
    } else if body.stopped {
        println!("Stopped {}", cmd.id);
    } else {
        println!("No active run for {}", cmd.id);
    }
    Ok(())
}
