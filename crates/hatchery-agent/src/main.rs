use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use hatchery_agent::docker::DockerRuntime;
use hatchery_agent::instance_manager::{CreateRequest, InstanceManager, SettingsPatch};
use hatchery_agent::runtime::RuntimeError;
use hatchery_agent::{AgentConfig, OrchestratorError};
use hatchery_instance::{PortMapping, ResourceLimits};
use tokio::sync::broadcast::error::RecvError;

#[derive(Debug, Parser)]
#[command(name = "hatchery", version, about = "Run game servers from egg blueprints in containers")]
struct Cli {
    /// Overrides HATCHERY_DATA_ROOT.
    #[arg(long, global = true)]
    data_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create and install a new instance.
    Create {
        #[arg(long)]
        name: String,
        /// Catalog reference, e.g. `minecraft/java/paper`.
        #[arg(long)]
        blueprint: String,
        /// `KEY=VALUE`, repeatable.
        #[arg(long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,
        /// `INTERNAL[:EXTERNAL][/udp]`; external 0 picks a free port.
        #[arg(long = "port", value_parser = parse_port)]
        ports: Vec<PortMapping>,
        #[arg(long, default_value_t = 1024)]
        memory: u64,
        #[arg(long, default_value_t = 100)]
        cpu: u64,
        #[arg(long, default_value_t = 5000)]
        disk: u64,
        #[arg(long)]
        startup: Option<String>,
    },
    List,
    Show { id: String },
    Start { id: String },
    Stop { id: String },
    Restart { id: String },
    Delete { id: String },
    /// Rebuild the container from the stored record.
    Recreate { id: String },
    /// Print console history; `--follow` streams until Ctrl-C.
    Console {
        id: String,
        #[arg(long)]
        follow: bool,
    },
    /// Run a command inside the server container.
    Command { id: String, text: Vec<String> },
    Ls {
        id: String,
        #[arg(default_value = "/")]
        path: String,
    },
    Cat { id: String, path: String },
    /// Write a file from `--from` or stdin.
    Put {
        id: String,
        path: String,
        #[arg(long)]
        from: Option<PathBuf>,
    },
    Mkdir { id: String, path: String },
    Rm { id: String, path: String },
    /// Change stored settings; run `recreate` to apply them.
    Settings {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        startup: Option<String>,
        #[arg(long = "var", value_parser = parse_key_value)]
        vars: Vec<(String, String)>,
        #[arg(long)]
        memory: Option<u64>,
        #[arg(long)]
        cpu: Option<u64>,
        #[arg(long)]
        disk: Option<u64>,
    },
    /// Roll back abandoned work and reattach consoles of running servers.
    Reconcile,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected KEY=VALUE, got `{raw}`"))
}

fn parse_port(raw: &str) -> Result<PortMapping, String> {
    PortMapping::parse(raw).ok_or_else(|| format!("invalid port mapping `{raw}`"))
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        match err.downcast_ref::<OrchestratorError>() {
            Some(e) => eprintln!("{}", e.to_payload()),
            None => eprintln!("error: {err:#}"),
        }
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = AgentConfig::from_env();
    if let Some(root) = cli.data_root {
        config.data_root = std::path::absolute(root)?;
    }

    let unavailable = |e: RuntimeError| OrchestratorError::RuntimeUnavailable(e.to_string());
    let runtime = DockerRuntime::connect().map_err(unavailable)?;
    runtime.ping().await.map_err(unavailable)?;
    let manager = InstanceManager::from_config(config, Arc::new(runtime))?;

    match cli.command {
        Command::Create {
            name,
            blueprint,
            vars,
            ports,
            memory,
            cpu,
            disk,
            startup,
        } => {
            let view = manager
                .create(CreateRequest {
                    name,
                    blueprint,
                    variables: vars.into_iter().collect(),
                    ports,
                    limits: ResourceLimits {
                        memory_mb: memory,
                        cpu_percent: cpu,
                        disk_mb: disk,
                    },
                    startup_override: startup,
                })
                .await?;
            print_json(&view)?;
        }
        Command::List => print_json(&manager.list().await?)?,
        Command::Show { id } => print_json(&manager.get(&id).await?)?,
        Command::Start { id } => print_json(&manager.start(&id).await?)?,
        Command::Stop { id } => print_json(&manager.stop(&id).await?)?,
        Command::Restart { id } => manager.restart(&id).await?,
        Command::Delete { id } => manager.delete(&id).await?,
        Command::Recreate { id } => print_json(&manager.recreate(&id).await?)?,
        Command::Console { id, follow } => {
            let mut sub = manager.attach_console(&id).await?;
            for line in &sub.backlog {
                println!("{}", line.text);
            }
            if follow {
                loop {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => break,
                        next = sub.live.recv() => match next {
                            Ok(line) => println!("{}", line.text),
                            Err(RecvError::Lagged(n)) => eprintln!("[hatchery] skipped {n} lines"),
                            Err(RecvError::Closed) => break,
                        },
                    }
                }
            }
        }
        Command::Command { id, text } => {
            let out = manager.send_command(&id, &text.join(" ")).await?;
            print!("{}", out.output);
        }
        Command::Ls { id, path } => print_json(&manager.files(&id).await?.list(&path).await?)?,
        Command::Cat { id, path } => {
            let data = manager.files(&id).await?.read(&path).await?;
            print!("{}", String::from_utf8_lossy(&data));
        }
        Command::Put { id, path, from } => {
            let data = match from {
                Some(file) => tokio::fs::read(&file).await?,
                None => {
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            manager.files(&id).await?.write(&path, &data).await?;
        }
        Command::Mkdir { id, path } => manager.files(&id).await?.mkdir(&path).await?,
        Command::Rm { id, path } => manager.files(&id).await?.delete(&path).await?,
        Command::Settings {
            id,
            name,
            startup,
            vars,
            memory,
            cpu,
            disk,
        } => {
            let current = manager.get(&id).await?.record.limits;
            let limits = (memory.is_some() || cpu.is_some() || disk.is_some()).then(|| {
                ResourceLimits {
                    memory_mb: memory.unwrap_or(current.memory_mb),
                    cpu_percent: cpu.unwrap_or(current.cpu_percent),
                    disk_mb: disk.unwrap_or(current.disk_mb),
                }
            });
            let environment = (!vars.is_empty()).then(|| vars.into_iter().collect::<BTreeMap<_, _>>());
            let record = manager
                .update_settings(
                    &id,
                    SettingsPatch {
                        name,
                        startup_override: startup,
                        environment,
                        limits,
                    },
                )
                .await?;
            print_json(&record)?;
        }
        Command::Reconcile => print_json(&manager.reconcile().await?)?,
    }
    Ok(())
}
