use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use gearline::config::{ClientConfig, PoolConfig, SelectionMode, ServerConfig};
use gearline::pool::Pool;
use gearline::shutdown::install_shutdown_handler;
use gearline::{GearError, JobHandle, JobPriority, PacketType, Response, ResponseHandler, Status};

#[derive(Parser, Debug)]
#[command(name = "gearline")]
#[command(version)]
#[command(about = "Submit and inspect jobs on Gearman-compatible job servers")]
#[command(propagate_version = true)]
struct Args {
    #[command(flatten)]
    client: ClientArgs,

    #[command(subcommand)]
    command: Commands,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Job server, format "host[:port][=weight]" (repeatable)
    #[arg(long, short = 's', global = true, default_value = "127.0.0.1:4730")]
    server: Vec<String>,

    /// Seconds to wait for the server to acknowledge a request
    #[arg(long, global = true, default_value = "5")]
    timeout: u64,

    /// How to pick a server for each request
    #[arg(long, global = true, default_value = "weighted")]
    selection: SelectionArg,

    /// Output format
    #[arg(long, short = 'o', global = true, default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SelectionArg {
    Weighted,
    Uniform,
}

impl From<SelectionArg> for SelectionMode {
    fn from(arg: SelectionArg) -> Self {
        match arg {
            SelectionArg::Weighted => SelectionMode::Weighted,
            SelectionArg::Uniform => SelectionMode::Uniform,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PriorityArg {
    High,
    Normal,
    Low,
}

impl From<PriorityArg> for JobPriority {
    fn from(arg: PriorityArg) -> Self {
        match arg {
            PriorityArg::High => JobPriority::High,
            PriorityArg::Normal => JobPriority::Normal,
            PriorityArg::Low => JobPriority::Low,
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Round-trip data through a job server
    Echo {
        data: String,

        /// Send to this server instead of selecting one
        #[arg(long)]
        at: Option<String>,
    },
    /// Submit a job
    Submit {
        /// Registered function name
        function: String,
        /// Job payload
        data: String,

        #[arg(long, default_value = "normal")]
        priority: PriorityArg,

        /// Return as soon as the job is queued
        #[arg(long)]
        background: bool,
    },
    /// Schedule a background job
    Schedule {
        function: String,
        data: String,

        /// Five-field cron spec, e.g. "*/5 * * * *"
        #[arg(long, conflicts_with = "at", required_unless_present = "at")]
        cron: Option<String>,

        /// Run once at an RFC 3339 time, e.g. 2026-01-01T09:00:00Z
        #[arg(long)]
        at: Option<String>,
    },
    /// Get status of a job on the server that issued it
    Status {
        /// Server address the job was submitted to
        addr: String,
        handle: String,
    },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct EchoOutput {
    server: String,
    data: String,
}

#[derive(Serialize)]
struct SubmitOutput {
    server: String,
    handle: JobHandle,
    background: bool,
}

#[derive(Serialize)]
struct ScheduleOutput {
    server: String,
    handle: JobHandle,
    #[serde(skip_serializing_if = "Option::is_none")]
    cron: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_at: Option<i64>,
}

#[derive(Serialize)]
struct EventOutput {
    event: String,
    handle: JobHandle,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    progress: Option<Status>,
}

#[derive(Serialize)]
struct StatusOutput {
    server: String,
    #[serde(flatten)]
    status: Status,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn pool_config(args: &ClientArgs) -> Result<PoolConfig, GearError> {
    let servers = args
        .server
        .iter()
        .map(|spec| ServerConfig::parse(spec))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PoolConfig {
        servers,
        client: ClientConfig::default().with_request_timeout(Duration::from_secs(args.timeout)),
        selection: args.selection.into(),
    })
}

fn parse_run_at(at: &str) -> Result<i64, Box<dyn std::error::Error>> {
    let when = chrono::DateTime::parse_from_rfc3339(at)
        .map_err(|e| format!("invalid --at time {:?}: {}", at, e))?;
    Ok(when.timestamp())
}

fn print_event(event: &Response, output_format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    let data = String::from_utf8_lossy(&event.data).into_owned();
    let progress = if event.packet_type == PacketType::WorkStatus {
        Some(event.status()?)
    } else {
        None
    };

    match output_format {
        OutputFormat::Json => {
            let output = EventOutput {
                event: event.packet_type.to_string(),
                handle: event.handle.clone(),
                data,
                progress,
            };
            println!("{}", serde_json::to_string(&output)?);
        }
        OutputFormat::Table => match progress {
            Some(status) => println!(
                "{:<16} {}/{}",
                event.packet_type, status.numerator, status.denominator
            ),
            None => println!("{:<16} {}", event.packet_type, data),
        },
    }
    Ok(())
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_echo(
    pool: &Pool,
    data: String,
    at: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (server, reply) = match at {
        Some(addr) => {
            let reply = pool.echo_at(&addr, data.as_bytes()).await?;
            (addr, reply)
        }
        None => pool.echo(data.as_bytes()).await?,
    };
    let reply = String::from_utf8_lossy(&reply).into_owned();

    match output_format {
        OutputFormat::Json => {
            let output = EchoOutput { server, data: reply };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Server: {}", server);
            println!("Echo:   {}", reply);
        }
    }
    Ok(())
}

async fn handle_submit(
    pool: &Pool,
    timeout: Duration,
    function: String,
    data: String,
    priority: JobPriority,
    background: bool,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    if background {
        let (server, handle) = pool
            .submit_background(timeout, &function, data.as_bytes(), priority)
            .await?;
        match output_format {
            OutputFormat::Json => {
                let output = SubmitOutput { server, handle, background };
                println!("{}", serde_json::to_string_pretty(&output)?);
            }
            OutputFormat::Table => {
                println!("Job queued on {}", server);
                println!("Handle: {}", handle);
            }
        }
        return Ok(());
    }

    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let handler: ResponseHandler = Box::new(move |event: Result<&Response, &GearError>| {
        let _ = event_tx.send(event.cloned().map_err(GearError::clone));
    });

    let (server, handle) = pool
        .submit(timeout, &function, data.as_bytes(), priority, Some(handler))
        .await?;
    if let OutputFormat::Table = output_format {
        println!("Job {} running on {}", handle, server);
    }

    let shutdown = install_shutdown_handler();
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => {
                eprintln!("Stopped waiting for job {}; it keeps running on {}", handle, server);
                break;
            }
            event = event_rx.recv() => event,
        };

        match event {
            Some(Ok(response)) => {
                print_event(&response, output_format)?;
                if response.is_terminal() {
                    if response.packet_type != PacketType::WorkComplete {
                        return Err(format!("job {} ended with {}", handle, response.packet_type).into());
                    }
                    break;
                }
            }
            Some(Err(e)) => return Err(e.into()),
            None => break,
        }
    }
    Ok(())
}

async fn handle_schedule(
    pool: &Pool,
    timeout: Duration,
    function: String,
    data: String,
    cron: Option<String>,
    at: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let (server, handle, run_at) = match (&cron, at) {
        (Some(spec), _) => {
            let (server, handle) = pool
                .submit_cron(timeout, &function, spec, data.as_bytes())
                .await?;
            (server, handle, None)
        }
        (None, Some(at)) => {
            let epoch = parse_run_at(&at)?;
            let (server, handle) = pool
                .submit_at(timeout, &function, epoch, data.as_bytes())
                .await?;
            (server, handle, Some(epoch))
        }
        (None, None) => return Err("either --cron or --at is required".into()),
    };

    match output_format {
        OutputFormat::Json => {
            let output = ScheduleOutput { server, handle, cron, run_at };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job scheduled on {}", server);
            println!("Handle: {}", handle);
            if let Some(spec) = cron {
                println!("Cron:   {}", spec);
            }
            if let Some(epoch) = run_at {
                println!("Run at: {}", epoch);
            }
        }
    }
    Ok(())
}

async fn handle_status(
    pool: &Pool,
    addr: String,
    handle: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let status = pool.status(&addr, &JobHandle::from(handle.as_str())).await?;

    match output_format {
        OutputFormat::Json => {
            let output = StatusOutput { server: addr, status };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Server:   {}", addr);
            println!("Handle:   {}", status.handle);
            println!("Known:    {}", status.known);
            println!("Running:  {}", status.running);
            match status.progress() {
                Some(fraction) => println!(
                    "Progress: {}/{} ({:.0}%)",
                    status.numerator,
                    status.denominator,
                    fraction * 100.0
                ),
                None => println!("Progress: -"),
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = pool_config(&args.client)?;
    let timeout = config.client.request_timeout();
    let output = args.client.output.clone();

    tracing::debug!(
        servers = ?config.servers.iter().map(|s| format!("{}={}", s.addr, s.weight)).collect::<Vec<_>>(),
        selection = ?config.selection,
        "Connecting to job servers"
    );
    let pool = Pool::connect(config).await?;

    let result = match args.command {
        Commands::Echo { data, at } => handle_echo(&pool, data, at, &output).await,
        Commands::Submit {
            function,
            data,
            priority,
            background,
        } => {
            handle_submit(
                &pool,
                timeout,
                function,
                data,
                priority.into(),
                background,
                &output,
            )
            .await
        }
        Commands::Schedule {
            function,
            data,
            cron,
            at,
        } => handle_schedule(&pool, timeout, function, data, cron, at, &output).await,
        Commands::Status { addr, handle } => handle_status(&pool, addr, handle, &output).await,
    };

    for (addr, closed) in pool.close().await {
        if let Err(e) = closed {
            tracing::debug!(addr = %addr, error = %e, "Close failed");
        }
    }
    result
}
