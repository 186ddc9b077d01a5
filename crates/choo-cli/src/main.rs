mod client;
mod config;
mod output;
mod tui;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};

use choo_daemon::proto::{
    GetJobStatusRequest, HealthRequest, ListJobsRequest, ShutdownRequest, StartJobRequest,
    StopJobRequest, WatchJobRequest,
};

use config::{ChooConfig, Overrides};

#[derive(Parser)]
#[command(name = "choo", about = "Orchestrator for parallel AI-assisted coding units")]
struct Cli {
    /// Path to the daemon's Unix domain socket (overrides CHOO_DAEMON_SOCKET)
    #[arg(long, global = true)]
    daemon_socket: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a choo config file (~/.choo/config.toml)
    Init {
        #[arg(long)]
        force: bool,
    },
    /// Start a job and stream its events until it finishes
    Run {
        /// Repository to run against (overrides CHOO_REPO_PATH)
        #[arg(long)]
        repo_path: Option<String>,
        /// Directory of unit/task plans (overrides CHOO_TASKS_DIR)
        #[arg(long)]
        tasks_dir: Option<String>,
        #[arg(long)]
        feature_branch: Option<String>,
        #[arg(long)]
        target_branch: Option<String>,
        #[arg(long)]
        parallelism: Option<u32>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        force_task_provider: Option<String>,
        #[arg(long)]
        review: bool,
        #[arg(long)]
        container: bool,
        /// Only run this unit (and ignore the rest of the DAG)
        #[arg(long)]
        only_unit: Option<String>,
    },
    /// Stream events for an already-started job
    Watch {
        job_id: String,
        #[arg(long, default_value_t = 0)]
        from_sequence: i64,
    },
    /// Request cancellation of a running job
    Stop {
        job_id: String,
        #[arg(long)]
        force: bool,
    },
    /// List known jobs, optionally filtered by status
    List {
        #[arg(long)]
        status: Option<String>,
    },
    /// Show one job's status
    Status { job_id: String },
    /// Check daemon health
    Health,
    /// Ask the daemon to shut down
    Shutdown {
        #[arg(long)]
        wait: bool,
        #[arg(long, default_value_t = 30)]
        timeout_seconds: u32,
    },
    /// Launch the interactive dashboard
    Dashboard,
    /// Print a shell completion script to stdout
    Completions { shell: Shell },
    /// Acknowledge a unit's current state. Review-fix never blocks merge in
    /// this orchestrator, so this is an operator affordance (confirming
    /// you've seen the outcome) rather than a gate -- generalized from the
    /// legacy per-task human-approval command to unit granularity.
    Approve {
        job_id: String,
        #[arg(long)]
        unit: Option<String>,
    },
    /// Cancel a job whose direction you don't want to continue.
    Reject {
        job_id: String,
        #[arg(long)]
        unit: Option<String>,
    },
    /// Re-run a single unit from a prior job, ignoring the rest of its DAG.
    /// A thin wrapper over `run --only-unit`; it does not resume the old
    /// job, it starts a fresh one scoped to the named unit.
    Retry {
        job_id: String,
        #[arg(long)]
        unit: String,
        #[arg(long)]
        repo_path: Option<String>,
        #[arg(long)]
        tasks_dir: Option<String>,
        #[arg(long)]
        feature_branch: Option<String>,
        #[arg(long)]
        target_branch: Option<String>,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        force_task_provider: Option<String>,
        #[arg(long)]
        review: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = &cli.command {
        return cmd_init(*force);
    }
    if let Commands::Completions { shell } = &cli.command {
        generate(*shell, &mut Cli::command(), "choo", &mut std::io::stdout());
        return Ok(());
    }

    let overrides = Overrides {
        daemon_socket: cli.daemon_socket.clone(),
        ..Overrides::default()
    };
    let base_config = ChooConfig::resolve(&overrides)?;

    let exit_code = match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!("handled above"),
        Commands::Run {
            repo_path,
            tasks_dir,
            feature_branch,
            target_branch,
            parallelism,
            provider,
            force_task_provider,
            review,
            container,
            only_unit,
        } => {
            let overrides = Overrides {
                repo_path,
                tasks_dir,
                feature_branch,
                target_branch,
                parallelism,
                default_provider: provider,
                daemon_socket: cli.daemon_socket.clone(),
            };
            let config = ChooConfig::resolve(&overrides)?;
            cmd_run(&config, force_task_provider, review, container, only_unit).await?
        }
        Commands::Watch { job_id, from_sequence } => {
            cmd_watch(&base_config, &job_id, from_sequence).await?
        }
        Commands::Stop { job_id, force } => cmd_stop(&base_config, &job_id, force).await?,
        Commands::List { status } => cmd_list(&base_config, status.as_deref()).await?,
        Commands::Status { job_id } => cmd_status(&base_config, &job_id).await?,
        Commands::Health => cmd_health(&base_config).await?,
        Commands::Shutdown { wait, timeout_seconds } => {
            cmd_shutdown(&base_config, wait, timeout_seconds).await?
        }
        Commands::Dashboard => {
            let client = client::connect(&base_config.daemon_socket).await?;
            tui::run_dashboard(client).await?;
            0
        }
        Commands::Approve { job_id, unit } => cmd_approve(&base_config, &job_id, unit.as_deref()).await?,
        Commands::Reject { job_id, unit } => cmd_reject(&base_config, &job_id, unit.as_deref()).await?,
        Commands::Retry {
            job_id,
            unit,
            repo_path,
            tasks_dir,
            feature_branch,
            target_branch,
            provider,
            force_task_provider,
            review,
        } => {
            println!("retrying unit {unit} from job {job_id} as a new run");
            let overrides = Overrides {
                repo_path,
                tasks_dir,
                feature_branch,
                target_branch,
                parallelism: None,
                default_provider: provider,
                daemon_socket: cli.daemon_socket.clone(),
            };
            let config = ChooConfig::resolve(&overrides)?;
            cmd_run(&config, force_task_provider, review, false, Some(unit)).await?
        }
    };

    std::process::exit(exit_code);
}

fn cmd_init(force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }
    config::save_config(&config::ConfigFile::default())?;
    println!("Config written to {}", path.display());
    println!("Edit it to set repo_path, tasks_dir, feature_branch, and friends.");
    Ok(())
}

async fn cmd_run(
    config: &ChooConfig,
    force_task_provider: Option<String>,
    review_enabled: bool,
    container_mode: bool,
    only_unit: Option<String>,
) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;

    let response = client
        .start_job(StartJobRequest {
            repo_path: config.repo_path.display().to_string(),
            tasks_dir: config.tasks_dir.display().to_string(),
            feature_branch: config.feature_branch.clone(),
            target_branch: config.target_branch.clone(),
            parallelism: config.parallelism,
            default_provider: config.default_provider.clone(),
            force_task_provider,
            review_enabled,
            container_mode,
            only_unit,
        })
        .await?;
    let job_id = response.into_inner().job_id;
    println!("started job {job_id}");

    watch_until_terminal(&mut client, &job_id).await
}

async fn cmd_watch(config: &ChooConfig, job_id: &str, from_sequence: i64) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    let mut stream = client
        .watch_job(WatchJobRequest {
            job_id: job_id.to_string(),
            from_sequence,
        })
        .await?
        .into_inner();
    while let Some(event) = stream.message().await? {
        output::print_event(&event);
    }
    Ok(0)
}

/// Stream events from sequence 0 until an `orch.completed`/`orch.failed`
/// event arrives, then look up the final status for the exit code.
async fn watch_until_terminal(
    client: &mut choo_daemon::proto::choo_daemon_client::ChooDaemonClient<tonic::transport::Channel>,
    job_id: &str,
) -> anyhow::Result<i32> {
    let mut stream = client
        .watch_job(WatchJobRequest {
            job_id: job_id.to_string(),
            from_sequence: 0,
        })
        .await?
        .into_inner();

    while let Some(event) = stream.message().await? {
        output::print_event(&event);
        if event.event_type == "orch.completed" || event.event_type == "orch.failed" {
            break;
        }
    }

    let status = client
        .get_job_status(GetJobStatusRequest {
            job_id: job_id.to_string(),
        })
        .await?
        .into_inner();
    if let Some(error) = &status.error {
        eprintln!("run finished with errors: {error}");
    }
    Ok(output::exit_code_for_status(&status.status))
}

async fn cmd_stop(config: &ChooConfig, job_id: &str, force: bool) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    client
        .stop_job(StopJobRequest {
            job_id: job_id.to_string(),
            force,
        })
        .await?;
    println!("stop requested for {job_id}");
    Ok(0)
}

async fn cmd_list(config: &ChooConfig, status: Option<&str>) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    let jobs = client
        .list_jobs(ListJobsRequest {
            status_filter: status.map(str::to_string),
        })
        .await?
        .into_inner()
        .jobs;
    if jobs.is_empty() {
        println!("no jobs");
    }
    for job in jobs {
        println!("{:<28} {:<12} {}", job.job_id, job.status, job.feature_branch);
    }
    Ok(0)
}

async fn cmd_status(config: &ChooConfig, job_id: &str) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    let status = client
        .get_job_status(GetJobStatusRequest {
            job_id: job_id.to_string(),
        })
        .await?
        .into_inner();
    println!("job:    {}", status.job_id);
    println!("status: {}", status.status);
    if let Some(error) = status.error {
        println!("error:  {error}");
    }
    Ok(0)
}

async fn cmd_health(config: &ChooConfig) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    let health = client.health(HealthRequest {}).await?.into_inner();
    println!("healthy:      {}", health.healthy);
    println!("active_jobs:  {}", health.active_jobs);
    println!("version:      {}", health.version);
    Ok(if health.healthy { 0 } else { 1 })
}

/// Confirm a job's (or one unit's) current outcome. Review-fix is
/// non-blocking by design, so there is nothing to unblock here -- this
/// reads status back to the operator as a sign-off.
async fn cmd_approve(config: &ChooConfig, job_id: &str, unit: Option<&str>) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    let status = client
        .get_job_status(GetJobStatusRequest {
            job_id: job_id.to_string(),
        })
        .await?
        .into_inner();
    match unit {
        Some(unit) => println!("approved unit {unit} of job {job_id} (status: {})", status.status),
        None => println!("approved job {job_id} (status: {})", status.status),
    }
    Ok(0)
}

/// Cancel a job (or signal dissatisfaction with one unit's outcome). Backed
/// by `StopJob` -- there is no per-unit stop in the daemon surface, so a
/// unit-scoped reject still force-stops the whole job and the operator is
/// expected to `retry` the unit they cared about.
async fn cmd_reject(config: &ChooConfig, job_id: &str, unit: Option<&str>) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    client
        .stop_job(StopJobRequest {
            job_id: job_id.to_string(),
            force: true,
        })
        .await?;
    match unit {
        Some(unit) => println!("rejected unit {unit}, job {job_id} stopped"),
        None => println!("rejected job {job_id}, stopped"),
    }
    Ok(0)
}

async fn cmd_shutdown(config: &ChooConfig, wait: bool, timeout_seconds: u32) -> anyhow::Result<i32> {
    let mut client = client::connect(&config.daemon_socket).await?;
    client
        .shutdown(ShutdownRequest { wait, timeout_seconds })
        .await?;
    println!("shutdown requested");
    Ok(0)
}
