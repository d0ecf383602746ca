//! Command-line interface.
//!
//! The batch front-end: parses arguments, loads and validates the
//! configuration, wires the engine to the event bus and file sinks, and
//! renders the final summary. Exit codes: 0 all tasks succeeded, 1
//! configuration error, 2 every host unreachable, 3 task failures, 4
//! cancelled.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use colored::Colorize;

use crate::config::DeployConfig;
use crate::engine::{DeploymentEngine, RunContext, RunControl, RunReport};
use crate::error::Error;
use crate::event::{EventBus, EventKind, Redactor};
use crate::install::InstallerRegistry;
use crate::logging::{describe_event, init_tracing, spawn_file_sinks};
use crate::runner::AnsibleExecutor;
use crate::task::{TaskSet, TaskStatus};

/// deployctl - multi-node software provisioning over SSH
#[derive(Parser, Debug)]
#[command(name = "deployctl")]
#[command(version)]
#[command(about = "Deploy software to a fleet of hosts via Ansible playbooks", long_about = None)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a deployment described by a configuration file
    Run(RunArgs),

    /// Print a configuration template to stdout
    #[command(name = "generate-config")]
    GenerateConfig,

    /// Output version information
    Version,
}

/// Arguments for the run command
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the deployment configuration file
    #[arg(short = 'c', long = "config", env = "DEPLOYCTL_CONFIG")]
    pub config: PathBuf,

    /// Attach the interactive front-end (falls back to batch output)
    #[arg(long)]
    pub tui: bool,

    /// Run checks and playbooks in no-op mode; never mutate targets
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// Restrict the run to the named node (repeatable)
    #[arg(long = "node", action = clap::ArgAction::Append)]
    pub nodes: Vec<String>,

    /// Restrict the run to the named software (repeatable)
    #[arg(long = "software", action = clap::ArgAction::Append)]
    pub software: Vec<String>,

    /// Skip the interactive confirmation
    #[arg(short = 'y', long = "yes")]
    pub assume_yes: bool,

    /// Directory holding the install playbooks
    #[arg(long = "playbook-dir", default_value = "playbooks")]
    pub playbook_dir: PathBuf,
}

impl Cli {
    /// Executes the parsed command and returns the process exit code.
    pub async fn execute(self) -> i32 {
        match self.command {
            Commands::Run(args) => args.execute().await,
            Commands::GenerateConfig => {
                print!("{}", DeployConfig::template());
                0
            }
            Commands::Version => {
                println!("deployctl {}", crate::version());
                0
            }
        }
    }
}

impl RunArgs {
    async fn execute(&self) -> i32 {
        let config = match self.load_config() {
            Ok(config) => config,
            Err(err) => {
                eprintln!("{} {}", "error:".red().bold(), err);
                return 1;
            }
        };
        init_tracing(config.log.level);

        let run_dir = config
            .general
            .data_dir
            .join("run")
            .join(chrono::Utc::now().format("%Y%m%dT%H%M%SZ").to_string());
        if let Err(err) = std::fs::create_dir_all(&run_dir) {
            eprintln!("{} cannot create {}: {}", "error:".red().bold(), run_dir.display(), err);
            return 1;
        }

        let tasks = TaskSet::build(&config);
        self.print_plan(&config);
        if !self.assume_yes && !confirm() {
            println!("aborted");
            return 0;
        }

        let bus = EventBus::new(Redactor::from_config(&config));
        let hosts: Vec<String> = config.nodes.iter().map(|n| n.name.clone()).collect();
        let sink_handles = spawn_file_sinks(&bus, &config.log, &hosts, &run_dir);
        let console = spawn_console_reporter(&bus);

        let control = RunControl::new();
        let ctx = RunContext {
            data_dir: config.general.data_dir.clone(),
            run_dir: run_dir.clone(),
            max_concurrent_nodes: config.general.max_concurrent_nodes,
            dry_run: self.dry_run,
            control: control.clone(),
        };
        let executor = Arc::new(AnsibleExecutor::new(
            self.playbook_dir.clone(),
            run_dir,
            self.dry_run,
        ));
        let engine = DeploymentEngine::new(
            ctx,
            config.nodes.clone(),
            tasks,
            crate::check::CheckerManager::standard(),
            InstallerRegistry::standard(),
            executor,
            bus.clone(),
        );

        // First ctrl-c cancels cooperatively; the process survives to
        // report what was and was not done.
        let ctrlc_control = control.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", "interrupt received, cancelling run".yellow());
                ctrlc_control.cancel();
            }
        });

        engine.start();
        let report = engine.wait().await;

        for handle in sink_handles {
            let _ = handle.await;
        }
        let _ = console.await;

        print_summary(&report);
        report.exit_code()
    }

    fn load_config(&self) -> Result<DeployConfig, Error> {
        let config = DeployConfig::load(&self.config)?;
        config.ensure_dirs()?;
        config.filtered(&self.nodes, &self.software)
    }

    fn print_plan(&self, config: &DeployConfig) {
        println!("{}", "Deployment plan".bold());
        for node in &config.nodes {
            let list: Vec<String> = node
                .install
                .iter()
                .map(|s| format!("{} {}", s.name, s.version))
                .collect();
            println!("  {} ({}): {}", node.name.cyan(), node.host, list.join(", "));
        }
        if self.dry_run {
            println!("  {}", "dry-run: no target will be modified".yellow());
        }
    }
}

fn confirm() -> bool {
    print!("Proceed with deployment? [y/N] ");
    let _ = std::io::stdout().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

/// Prints progress lines to stdout as events arrive.
fn spawn_console_reporter(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut stream = bus.subscribe();
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            let line = match &event.kind {
                EventKind::TaskProgress { .. } | EventKind::TaskLog { .. } => None,
                EventKind::TaskComplete => Some(format!(
                    "{} {}",
                    "ok:".green().bold(),
                    event.task_id.as_deref().unwrap_or_default()
                )),
                EventKind::TaskFailed { error } => Some(format!(
                    "{} {}: {}",
                    "failed:".red().bold(),
                    event.task_id.as_deref().unwrap_or_default(),
                    error
                )),
                EventKind::TaskSkipped { reason } => Some(format!(
                    "{} {}: {}",
                    "skipped:".cyan(),
                    event.task_id.as_deref().unwrap_or_default(),
                    reason
                )),
                _ => Some(describe_event(&event)),
            };
            if let Some(line) = line {
                println!("{}", line);
            }
            if matches!(event.kind, EventKind::RunComplete { .. }) {
                break;
            }
        }
    })
}

fn print_summary(report: &RunReport) {
    println!("\n{}", "Deployment summary".bold());
    for host in &report.hosts {
        println!("  {}:", host.host.cyan());
        for task in report.tasks.iter().filter(|t| t.node == host.host) {
            let status = match task.status {
                TaskStatus::Completed => "completed".green(),
                TaskStatus::Failed => "failed".red(),
                TaskStatus::Skipped => "skipped".cyan(),
                TaskStatus::Running => "running".yellow(),
                TaskStatus::Pending => "pending".normal(),
            };
            match &task.error {
                Some(reason) => println!(
                    "    {} {} [{}] {}",
                    task.software, task.version, status, reason
                ),
                None => println!("    {} {} [{}]", task.software, task.version, status),
            }
        }
    }
    let stats = &report.stats;
    println!(
        "\n  total={} completed={} failed={} skipped={}",
        stats.total, stats.completed, stats.failed, stats.skipped
    );
    if report.cancelled {
        println!("  {}", "run was cancelled".yellow());
    }
}
