//! Operator CLI for the warden agent.

mod client;
mod shell;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use client::AgentClient;
use owo_colors::OwoColorize;
use warden_common::{b64, ActionResult, Method, ResponseData, ServiceOp, UpdateChannel};

#[derive(Parser)]
#[command(name = "wardenctl", version, about = "Control a warden agent")]
struct Cli {
    /// Agent address.
    #[arg(long, global = true, default_value = "127.0.0.1:7070", env = "WARDEN_ADDR")]
    addr: String,

    /// Authentication token.
    #[arg(long, global = true, env = "WARDEN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Authenticate and show agent status.
    Status,
    /// Show system inventory.
    Info,
    /// Stream metric samples.
    Metrics {
        #[arg(long, default_value_t = 2)]
        interval: u32,
        /// Stop after N samples (0 streams forever).
        #[arg(long, default_value_t = 0)]
        count: u32,
    },
    /// Run a command on the agent host.
    Exec {
        command: String,
        args: Vec<String>,
        #[arg(long)]
        cwd: Option<String>,
        #[arg(long, default_value_t = 60)]
        timeout: u64,
        #[arg(long)]
        sudo: bool,
    },
    /// Open an interactive shell.
    Shell {
        #[arg(long)]
        shell: Option<String>,
    },
    /// File operations.
    #[command(subcommand)]
    File(FileCommand),
    /// Tail a log file.
    Tail {
        path: String,
        #[arg(short = 'n', long, default_value_t = 100)]
        lines: u32,
        #[arg(short = 'f', long)]
        follow: bool,
    },
    /// Service management.
    #[command(subcommand)]
    Service(ServiceCommand),
    /// List processes.
    Ps {
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        user: Option<String>,
    },
    /// Send a signal to a process.
    Kill {
        pid: i32,
        #[arg(long, default_value_t = 15)]
        signal: i32,
    },
    /// Agent self-update control.
    #[command(subcommand)]
    Update(UpdateCommand),
}

#[derive(Subcommand)]
enum FileCommand {
    /// Print a remote file.
    Read { path: String },
    /// Write a remote file from stdin or --content.
    Write {
        path: String,
        #[arg(long)]
        content: Option<String>,
        #[arg(long, default_value_t = 0)]
        mode: u32,
        #[arg(long)]
        create_dirs: bool,
    },
    /// List a remote directory.
    Ls {
        path: String,
        #[arg(short, long)]
        recursive: bool,
        #[arg(short = 'a', long)]
        all: bool,
    },
    /// Delete a remote file or directory.
    Rm { path: String },
}

#[derive(Subcommand)]
enum ServiceCommand {
    List {
        #[arg(long)]
        filter: Option<String>,
    },
    Start { name: String },
    Stop { name: String },
    Restart { name: String },
    Enable { name: String },
    Disable { name: String },
}

#[derive(Subcommand)]
enum UpdateCommand {
    /// Query the release server.
    Check,
    /// Stage a release artifact.
    Download { version: String },
    /// Apply a staged update.
    Apply { version: String },
    /// Show the bounded update history.
    History,
    /// Show or change the update policy.
    Config {
        #[arg(long)]
        auto: Option<bool>,
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long, value_parser = parse_channel)]
        channel: Option<UpdateChannel>,
        #[arg(long)]
        notify_only: Option<bool>,
    },
}

fn parse_channel(s: &str) -> Result<UpdateChannel, String> {
    match s {
        "stable" => Ok(UpdateChannel::Stable),
        "beta" => Ok(UpdateChannel::Beta),
        "nightly" => Ok(UpdateChannel::Nightly),
        other => Err(format!("unknown channel {other:?} (stable|beta|nightly)")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut agent = AgentClient::connect(&cli.addr, cli.token.clone()).await?;

    match cli.command {
        Command::Status => {
            let data = agent
                .request(Method::Authenticate {
                    client_version: env!("CARGO_PKG_VERSION").to_string(),
                })
                .await?;
            let ResponseData::Auth(auth) = data else { bail!("unexpected response") };
            if auth.success {
                println!("{} agent v{}", "connected".green(), auth.agent_version);
                if let Some(expiry) = chrono::DateTime::from_timestamp(auth.expires_at, 0) {
                    println!("session valid until {expiry}");
                }
            } else {
                println!("{}: {}", "authentication failed".red(), auth.message);
            }
        }

        Command::Info => {
            let ResponseData::System(info) = agent.request(Method::GetSystemInfo).await? else {
                bail!("unexpected response");
            };
            println!("{}", info.hostname.bold());
            println!("  os       {} {} ({})", info.os, info.platform_version, info.arch);
            println!("  kernel   {}", info.kernel_version);
            println!("  uptime   {}", format_duration(info.uptime_secs));
            println!(
                "  cpu      {} ({} cores / {} threads)",
                info.cpu.model, info.cpu.cores, info.cpu.threads
            );
            println!(
                "  memory   {} / {} ({:.1}%)",
                format_bytes(info.memory.used),
                format_bytes(info.memory.total),
                info.memory.used_percent
            );
            for disk in &info.disks {
                println!(
                    "  disk     {} on {} {} / {} ({:.1}%)",
                    disk.device,
                    disk.mountpoint,
                    format_bytes(disk.used),
                    format_bytes(disk.total),
                    disk.used_percent
                );
            }
            for net in &info.networks {
                println!("  net      {} {} [{}]", net.name, net.addresses.join(" "), net.mac);
            }
        }

        Command::Metrics { interval, count } => {
            agent.send(Method::GetMetrics { interval_seconds: interval }, true).await?;
            let mut seen = 0u32;
            while let Some(frame) = agent.next_stream_frame().await? {
                let ResponseData::Metrics(sample) = frame else { continue };
                println!(
                    "cpu {:5.1}%  mem {:5.1}%  load {:.2} {:.2} {:.2}",
                    sample.cpu_usage, sample.memory_usage, sample.load1, sample.load5,
                    sample.load15
                );
                seen += 1;
                if count > 0 && seen >= count {
                    break;
                }
            }
        }

        Command::Exec { command, args, cwd, timeout, sudo } => {
            let ResponseData::Command(result) = agent
                .request(Method::ExecuteCommand {
                    command,
                    args,
                    working_dir: cwd,
                    env: Default::default(),
                    timeout_seconds: timeout,
                    sudo,
                })
                .await?
            else {
                bail!("unexpected response");
            };
            print!("{}", result.stdout);
            eprint!("{}", result.stderr);
            if result.exit_code != 0 {
                eprintln!("{} exit code {}", "!".red(), result.exit_code);
                std::process::exit(result.exit_code.clamp(0, 255));
            }
        }

        Command::Shell { shell } => {
            shell::run(agent, shell).await?;
        }

        Command::File(file) => run_file_command(&mut agent, file).await?,

        Command::Tail { path, lines, follow } => {
            agent.send(Method::TailLog { path, lines, follow }, true).await?;
            while let Some(frame) = agent.next_stream_frame().await? {
                if let ResponseData::LogLine { content, .. } = frame {
                    println!("{content}");
                }
            }
        }

        Command::Service(service) => run_service_command(&mut agent, service).await?,

        Command::Ps { name, user } => {
            let ResponseData::Processes(processes) = agent
                .request(Method::ListProcesses { name_filter: name, user_filter: user })
                .await?
            else {
                bail!("unexpected response");
            };
            println!("{:>8} {:>8} {:<12} {:>6} {:>6}  {}", "PID", "PPID", "USER", "CPU%", "MEM%", "COMMAND");
            for p in processes {
                println!(
                    "{:>8} {:>8} {:<12} {:>6.1} {:>6.1}  {}",
                    p.pid,
                    p.ppid,
                    p.user,
                    p.cpu_percent,
                    p.memory_percent,
                    if p.cmdline.is_empty() { p.name } else { p.cmdline }
                );
            }
        }

        Command::Kill { pid, signal } => {
            let ResponseData::Action(action) =
                agent.request(Method::KillProcess { pid, signal }).await?
            else {
                bail!("unexpected response");
            };
            print_action(&action);
        }

        Command::Update(update) => run_update_command(&mut agent, update).await?,
    }

    Ok(())
}

async fn run_file_command(agent: &mut AgentClient, command: FileCommand) -> Result<()> {
    match command {
        FileCommand::Read { path } => {
            let ResponseData::File(file) = agent.request(Method::ReadFile { path }).await? else {
                bail!("unexpected response");
            };
            let bytes = b64::decode(&file.content)?;
            use std::io::Write;
            std::io::stdout().write_all(&bytes)?;
        }

        FileCommand::Write { path, content, mode, create_dirs } => {
            let bytes = match content {
                Some(text) => text.into_bytes(),
                None => {
                    use std::io::Read;
                    let mut buf = Vec::new();
                    std::io::stdin().read_to_end(&mut buf)?;
                    buf
                }
            };
            let ResponseData::Action(action) = agent
                .request(Method::WriteFile {
                    path,
                    content: b64::encode(&bytes),
                    mode,
                    create_dirs,
                })
                .await?
            else {
                bail!("unexpected response");
            };
            print_action(&action);
        }

        FileCommand::Ls { path, recursive, all } => {
            let ResponseData::Dir(listing) = agent
                .request(Method::ListDirectory { path, recursive, show_hidden: all })
                .await?
            else {
                bail!("unexpected response");
            };
            for file in listing.files {
                let kind = if file.is_dir { "d" } else { "-" };
                println!(
                    "{kind}{:04o} {:<10} {:>10}  {}",
                    file.mode,
                    file.owner,
                    format_bytes(file.size),
                    file.path
                );
            }
        }

        FileCommand::Rm { path } => {
            let ResponseData::Action(action) = agent.request(Method::DeleteFile { path }).await?
            else {
                bail!("unexpected response");
            };
            print_action(&action);
        }
    }
    Ok(())
}

async fn run_service_command(agent: &mut AgentClient, command: ServiceCommand) -> Result<()> {
    let (name, op) = match command {
        ServiceCommand::List { filter } => {
            let ResponseData::Services(services) =
                agent.request(Method::ListServices { name_filter: filter }).await?
            else {
                bail!("unexpected response");
            };
            for s in services {
                let status = if s.status == "active" {
                    s.status.green().to_string()
                } else {
                    s.status.yellow().to_string()
                };
                let enabled = if s.enabled { "enabled" } else { "disabled" };
                println!("{:<40} {status:<18} {enabled:<9} {}", s.name, s.description);
            }
            return Ok(());
        }
        ServiceCommand::Start { name } => (name, ServiceOp::Start),
        ServiceCommand::Stop { name } => (name, ServiceOp::Stop),
        ServiceCommand::Restart { name } => (name, ServiceOp::Restart),
        ServiceCommand::Enable { name } => (name, ServiceOp::Enable),
        ServiceCommand::Disable { name } => (name, ServiceOp::Disable),
    };

    let ResponseData::Action(action) =
        agent.request(Method::ServiceAction { name, action: op }).await?
    else {
        bail!("unexpected response");
    };
    print_action(&action);
    Ok(())
}

async fn run_update_command(agent: &mut AgentClient, command: UpdateCommand) -> Result<()> {
    match command {
        UpdateCommand::Check => {
            let ResponseData::Update(info) = agent.request(Method::CheckUpdate).await? else {
                bail!("unexpected response");
            };
            if info.available {
                println!(
                    "{}: {} -> {}{}",
                    "update available".green(),
                    info.current_version,
                    info.latest_version,
                    if info.is_critical { " (critical)" } else { "" }
                );
                if !info.release_notes.is_empty() {
                    println!("{}", info.release_notes);
                }
            } else {
                println!("already on the latest version ({})", info.current_version);
            }
        }

        UpdateCommand::Download { version } => {
            agent.send(Method::DownloadUpdate { version }, true).await?;
            while let Some(frame) = agent.next_stream_frame().await? {
                if let ResponseData::Progress(p) = frame {
                    eprint!(
                        "\r{:?}: {} / {} ({}%)   ",
                        p.phase,
                        format_bytes(p.downloaded),
                        format_bytes(p.total),
                        p.percent
                    );
                }
            }
            eprintln!();
            println!("{}", "update staged".green());
        }

        UpdateCommand::Apply { version } => {
            let ResponseData::Action(action) =
                agent.request(Method::ApplyUpdate { version }).await?
            else {
                bail!("unexpected response");
            };
            print_action(&action);
        }

        UpdateCommand::History => {
            let ResponseData::UpdateHistory(history) =
                agent.request(Method::GetUpdateHistory).await?
            else {
                bail!("unexpected response");
            };
            for record in history {
                let when = chrono::DateTime::from_timestamp(record.timestamp, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| record.timestamp.to_string());
                let outcome = if record.success {
                    "ok".green().to_string()
                } else {
                    "failed".red().to_string()
                };
                print!("{when}  {} -> {}  {outcome}", record.from_version, record.version);
                if let Some(error) = &record.error {
                    print!("  ({error})");
                }
                println!();
            }
        }

        UpdateCommand::Config { auto, interval, channel, notify_only } => {
            let ResponseData::UpdateConfig(mut config) =
                agent.request(Method::GetUpdateConfig).await?
            else {
                bail!("unexpected response");
            };

            if auto.is_none() && interval.is_none() && channel.is_none() && notify_only.is_none()
            {
                println!("auto_update    {}", config.auto_update);
                println!("check_interval {}s", config.check_interval);
                println!("channel        {}", config.channel);
                println!("notify_only    {}", config.notify_only);
                if let Some(last) = &config.last_check {
                    println!("last_check     {last}");
                }
                return Ok(());
            }

            if let Some(auto) = auto {
                config.auto_update = auto;
            }
            if let Some(interval) = interval {
                config.check_interval = interval;
            }
            if let Some(channel) = channel {
                config.channel = channel;
            }
            if let Some(notify_only) = notify_only {
                config.notify_only = notify_only;
            }

            let ResponseData::Action(action) =
                agent.request(Method::SetUpdateConfig { config }).await?
            else {
                bail!("unexpected response");
            };
            print_action(&action);
        }
    }
    Ok(())
}

fn print_action(action: &ActionResult) {
    if action.success {
        println!("{} {}", "ok".green(), action.message);
    } else {
        eprintln!("{} {}", "error:".red(), action.error);
        std::process::exit(1);
    }
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn format_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3600;
    let minutes = (secs % 3600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
