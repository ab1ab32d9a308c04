use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail, eyre};
use log::info;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

mod cli;

use cli::Cli;
use cli::commands::Commands;
use taro::client::{Client, InstanceHandle, Reply};
use taro::config::{Config, data_base_dir};
use taro::domain::{Command, ExecutionState, InstanceFilter, InstanceSummary, JobDefinition};
use taro::events::{
    EchoPlugin, EventBus, ListenerRegistration, ListenerUpdate, ListeningServer, ListeningServerConfig, PluginRegistry,
};
use taro::registry::{InstanceRegistry, RegistryServer, RegistryServerConfig};
use taro::runner::Runner;
use taro::storage::{self, RecordQuery, SortCriteria};

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    let log_dir = data_base_dir().join("logs");
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("taro.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        match (&config.log_level, verbose) {
            (Some(level), _) => {
                builder.parse_filters(level);
            }
            (None, true) => {
                builder.parse_filters("debug");
            }
            (None, false) => {
                builder.parse_filters("info");
            }
        }
    }
    builder.target(env_logger::Target::Pipe(target)).init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<i32> {
    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        Commands::Exec {
            job,
            hold,
            grace_ms,
            command,
        } => handle_exec_command(job.as_deref(), *hold, *grace_ms, command, config).await,
        Commands::Ps { pattern } => handle_ps_command(pattern.as_deref(), config).await,
        Commands::Stop { pattern } => handle_instance_command(pattern, Command::Stop, config).await,
        Commands::Signal { pattern, signal } => {
            handle_instance_command(pattern, Command::signal(signal.as_str()), config).await
        }
        Commands::Release { pattern } => handle_instance_command(pattern, Command::Release, config).await,
        Commands::Listen => handle_listen_command(config).await,
        Commands::History {
            job,
            state,
            limit,
            last,
        } => handle_history_command(job.as_deref(), state.as_deref(), *limit, *last, config),
    }
}

fn job_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string())
}

fn state_colored(state: ExecutionState) -> ColoredString {
    let name = state.name();
    match state {
        ExecutionState::Completed => name.green(),
        ExecutionState::Running => name.cyan(),
        ExecutionState::Created | ExecutionState::Pending => name.yellow(),
        ExecutionState::Stopped => name.blue(),
        ExecutionState::Failed | ExecutionState::Interrupted => name.red(),
    }
}

fn print_summary(summary: &InstanceSummary) {
    let exit = summary
        .exit_code
        .map(|code| code.to_string())
        .unwrap_or_else(|| "-".to_string());
    let elapsed = summary
        .lifecycle
        .execution_time()
        .map(|d| format!("{:.1}s", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<32} {:<12} {:>5} {:>8}  {}",
        summary.id.to_string().bold(),
        state_colored(summary.state),
        exit,
        elapsed,
        summary.command
    );
    if let Some(failure) = &summary.failure {
        println!("  {} {}", "failure:".red(), failure);
    }
    if let Some(status) = &summary.status {
        println!("  {} {}", "status:".dimmed(), status);
    }
    for (name, count) in &summary.warnings {
        println!("  {} {} x{}", "warning:".yellow(), name, count);
    }
}

async fn handle_exec_command(
    job: Option<&str>,
    hold: bool,
    grace_ms: Option<u64>,
    command: &[String],
    config: &Config,
) -> Result<i32> {
    let Some((program, args)) = command.split_first() else {
        bail!("No command given");
    };
    let job_id = job.map(str::to_string).unwrap_or_else(|| job_name(program));
    let mut definition = JobDefinition::new(job_id, program.as_str())
        .args(args.iter().cloned())
        .hold_pending(hold);
    if let Some(ms) = grace_ms {
        definition = definition.grace_period_ms(ms);
    }
    info!("Executing job {}: {}", definition.job_id, definition.command_line());

    let registry = Arc::new(InstanceRegistry::new());
    let persistence = storage::open(&config.persistence).context("Failed to open persistence")?;
    let mut plugins = PluginRegistry::from_names(config.plugins.as_slice());
    if !plugins.contains("echo") {
        plugins.register(Arc::new(EchoPlugin::stdout()));
    }
    let bus = Arc::new(
        EventBus::builder()
            .config(config)
            .plugins(plugins)
            .terminal_observer(registry.clone())
            .persistence(persistence)
            .build(),
    );
    for listener in &config.listeners {
        bus.connect_listener(ListenerRegistration::from(listener));
    }

    let server = Arc::new(RegistryServer::new(
        RegistryServerConfig::for_process(&config.registry_endpoint_dir),
        Arc::clone(&registry),
    ));
    let listener = server.bind().context("Failed to bind registry endpoint")?;
    let server_task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };

    let runner = Runner::new(&config.job_defaults, registry, Arc::clone(&bus));
    let instance = runner.start(definition);
    println!("{} {}", "Started:".green(), instance.id());
    if hold {
        println!("  held in PENDING, run `taro release {}`", instance.id());
    }

    tokio::select! {
        _ = instance.wait() => {}
        _ = tokio::signal::ctrl_c() => {
            println!("{}", "Interrupted, stopping...".yellow());
            instance.stop();
            instance.wait().await;
        }
    }
    let summary = instance.summary();

    server.shutdown();
    match server_task.await {
        Ok(Err(e)) => log::warn!("Registry endpoint failed: {}", e),
        Err(e) => log::warn!("Registry endpoint task failed: {}", e),
        Ok(Ok(())) => {}
    }
    bus.close(Duration::from_millis(config.command_timeout_ms)).await;

    print_summary(&summary);
    let code = match summary.state {
        ExecutionState::Completed => 0,
        _ => summary.exit_code.filter(|code| *code != 0).unwrap_or(1),
    };
    Ok(code)
}

async fn handle_ps_command(pattern: Option<&str>, config: &Config) -> Result<i32> {
    let client = Client::from_config(config);
    let filter = match pattern {
        Some(p) => InstanceFilter::pattern(p),
        None => InstanceFilter::all(),
    };
    let handles = client.list_instances(&filter).await?;
    if handles.is_empty() {
        println!("{}", "No live instances".dimmed());
        return Ok(0);
    }
    for handle in &handles {
        print_summary(&handle.summary);
    }
    Ok(0)
}

async fn matching_handles(client: &Client, pattern: &str) -> Result<Vec<InstanceHandle>> {
    let handles = client.list_instances(&InstanceFilter::pattern(pattern)).await?;
    if handles.is_empty() {
        println!("{} {}", "No instances match".yellow(), pattern);
    }
    Ok(handles)
}

async fn handle_instance_command(pattern: &str, command: Command, config: &Config) -> Result<i32> {
    info!("Sending {} to instances matching {}", command, pattern);
    let client = Client::from_config(config);
    let handles = matching_handles(&client, pattern).await?;

    let mut failures = 0;
    for handle in &handles {
        match client.send_command(handle, command.clone()).await {
            Reply::Ok(summary) => {
                println!("{} {} -> {}", command.to_string().green(), handle.id, state_colored(summary.state))
            }
            Reply::NotFound => println!("{} {} already finished", "Gone:".dimmed(), handle.id),
            Reply::Rejected(reason) => {
                failures += 1;
                println!("{} {}: {}", "Rejected:".red(), handle.id, reason);
            }
            Reply::Unavailable(reason) => {
                failures += 1;
                println!("{} {}: {}", "Unavailable:".red(), handle.id, reason);
            }
            Reply::Timeout => {
                failures += 1;
                println!("{} {}", "Timed out:".red(), handle.id);
            }
        }
    }
    Ok(if failures > 0 { 1 } else { 0 })
}

async fn handle_listen_command(config: &Config) -> Result<i32> {
    let server = Arc::new(ListeningServer::new(ListeningServerConfig::new(
        &config.listener_bind_address,
    )));
    let listener = server.bind().context("Failed to bind listening socket")?;
    let mut updates = server.subscribe();
    let task = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.serve(listener).await })
    };
    println!(
        "{} {}",
        "Listening on".cyan(),
        config.listener_bind_address.display()
    );

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(update) => print_update(&update),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("{} {} updates", "Lagged:".red(), n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    server.shutdown();
    task.await.map_err(|e| eyre!("Listening server task failed: {}", e))??;
    Ok(0)
}

fn print_update(update: &ListenerUpdate) {
    match update {
        ListenerUpdate::Connected { source, .. } => println!("{} {}", "connected".green(), source),
        ListenerUpdate::Event { source, event } => println!(
            "{} {} #{} {} -> {}",
            source.dimmed(),
            event.instance_id.to_string().bold(),
            event.sequence,
            event
                .previous_state
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| "-".to_string()),
            state_colored(event.new_state)
        ),
        ListenerUpdate::Gap { source, missed } => {
            println!("{} {} dropped {} events", "gap".red(), source, missed)
        }
        ListenerUpdate::SequenceGap {
            source,
            instance_id,
            expected,
            received,
        } => println!(
            "{} {} {} expected #{} got #{}",
            "gap".red(),
            source,
            instance_id,
            expected,
            received
        ),
        ListenerUpdate::Disconnected { source, .. } => println!(
            "{} {}",
            "disconnected".yellow(),
            source.as_deref().unwrap_or("unknown")
        ),
    }
}

fn handle_history_command(
    job: Option<&str>,
    state: Option<&str>,
    limit: Option<usize>,
    last: bool,
    config: &Config,
) -> Result<i32> {
    let persistence = storage::open(&config.persistence).context("Failed to open persistence")?;
    let mut query = RecordQuery::all();
    if let Some(job) = job {
        query = query.job(job);
    }
    if let Some(state) = state {
        query = query.state(state.parse::<ExecutionState>()?);
    }

    let records = storage::read_jobs(persistence.as_ref(), &query, SortCriteria::Created, false, limit, last)?;
    if records.is_empty() {
        println!("{}", "No records".dimmed());
    }
    for record in &records {
        print_summary(record);
    }
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    setup_logging(&config, cli.is_verbose()).context("Failed to setup logging")?;
    info!("Starting with config from: {:?}", cli.config);

    let code = run_application(&cli, &config).await.context("Application failed")?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
