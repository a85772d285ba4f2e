use anyhow::{anyhow, Result};
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use ipsec_gateway::logging::{init_logging, level_from_str, LogOptions};
use ipsec_gateway::{
    Config, GatewayCidr, ShellExecutor, TunnelEntry, TunnelLifecycleManager, TunnelRecord,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum LogLevelArg {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevelArg> for tracing::Level {
    fn from(level: LogLevelArg) -> Self {
        match level {
            LogLevelArg::Trace => tracing::Level::TRACE,
            LogLevelArg::Debug => tracing::Level::DEBUG,
            LogLevelArg::Info => tracing::Level::INFO,
            LogLevelArg::Warn => tracing::Level::WARN,
            LogLevelArg::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, after_help = "Examples:\n  ipsecctl createIpsecGateway br-int 10.1.0.254/24\n  ipsecctl addIpsecTunnel t1 10.0.0.1 10.0.0.2 192.0.2.1 left@example right@example --psk s3cret\n  ipsecctl listIpsecTunnels --output json\n  ipsecctl removeIpsecTunnel t1\n  ipsecctl destroyIpsecGateway")]
struct Args {
    /// Configuration file (default: <config dir>/ipsecctl/config.toml)
    #[arg(short, long, env = "IPSECCTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configured one)
    #[arg(short, long, value_enum, env = "IPSECCTL_LOG_LEVEL")]
    log_level: Option<LogLevelArg>,

    /// Emit logs as JSON
    #[arg(long, env = "IPSECCTL_JSON_LOGS")]
    json_logs: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, env = "IPSECCTL_LOG_DIR")]
    log_dir: Option<PathBuf>,

    /// Output format for command results (table|json)
    #[arg(long, value_enum, default_value = "table")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the local gateway and attach it to an OVS bridge
    #[command(name = "createIpsecGateway")]
    CreateGateway {
        #[arg(value_name = "ovsBridge")]
        ovs_bridge: String,
        #[arg(value_name = "gatewayIp/mask")]
        gateway_ip: GatewayCidr,
    },
    /// Remove every tunnel, then the gateway
    #[command(name = "destroyIpsecGateway")]
    DestroyGateway,
    /// Add a tunnel and bring it up
    #[command(name = "addIpsecTunnel")]
    AddTunnel {
        #[arg(value_name = "name")]
        name: String,
        #[arg(value_name = "sourceIp")]
        source_ip: Ipv4Addr,
        #[arg(value_name = "destIp")]
        dest_ip: Ipv4Addr,
        #[arg(value_name = "remoteGatewayIp")]
        remote_gateway_ip: Ipv4Addr,
        #[arg(value_name = "localId")]
        local_id: String,
        #[arg(value_name = "remoteId")]
        remote_id: String,
        /// Pre-shared key (default: daemon.default_psk from the config)
        #[arg(long, env = "IPSECCTL_PSK", hide_env_values = true)]
        psk: Option<String>,
    },
    /// Remove a tunnel
    #[command(name = "removeIpsecTunnel")]
    RemoveTunnel {
        #[arg(value_name = "name")]
        name: String,
    },
    /// List the managed tunnels
    #[command(name = "listIpsecTunnels")]
    ListTunnels,
}

#[derive(Serialize)]
struct Message<'a> {
    status: &'a str,
    detail: &'a str,
}

fn print_msg(fmt: OutputFormat, status: &str, detail: &str) -> Result<()> {
    match fmt {
        OutputFormat::Table => println!("{detail}"),
        OutputFormat::Json => {
            let msg = Message { status, detail };
            println!("{}", serde_json::to_string_pretty(&msg)?);
        }
    }
    Ok(())
}

/// `name: src <===> dst` lines with the addresses aligned.
fn format_tunnel_table(tunnels: &[TunnelRecord]) -> String {
    let Some(width) = tunnels.iter().map(|t| t.name.len()).max() else {
        return "No IPsec tunnels are currently up".to_string();
    };
    std::iter::once("Current IPsec tunnels:".to_string())
        .chain(tunnels.iter().map(|t| {
            format!(
                "{}: {}{} <===> {}",
                t.name,
                " ".repeat(width - t.name.len()),
                t.source_ip,
                t.dest_ip
            )
        }))
        .collect::<Vec<_>>()
        .join("\n    ")
}

/// `help`, `--help` or `-h` anywhere after the program name asks for usage,
/// even where a positional argument is expected.
fn wants_help<I, S>(args: I) -> bool
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    args.into_iter()
        .skip(1)
        .any(|arg| matches!(arg.as_ref(), "help" | "--help" | "-h"))
}

/// Load `path`, or `default` if none was given. A missing default file
/// yields the defaults and is returned so it can be reported once logging
/// is up.
fn load_config(path: Option<PathBuf>, default: PathBuf) -> Result<(Config, Option<PathBuf>)> {
    match path {
        Some(path) => Ok((Config::load(&path)?, None)),
        None => {
            let missing = (!default.exists()).then(|| default.clone());
            Ok((Config::load_or_default(&default)?, missing))
        }
    }
}

async fn run(args: Args, config: Config) -> Result<()> {
    let manager = TunnelLifecycleManager::from_config(&config, Arc::new(ShellExecutor::new()))?;

    match args.command {
        Command::CreateGateway {
            ovs_bridge,
            gateway_ip,
        } => {
            let descriptor = manager.create_gateway(&ovs_bridge, gateway_ip).await?;
            print_msg(
                args.output,
                "ok",
                &format!(
                    "Gateway {} ({}) attached to {}",
                    descriptor.gateway_ip, descriptor.gateway_mac, descriptor.ovs_bridge
                ),
            )?;
        }
        Command::DestroyGateway => {
            manager.destroy_gateway().await?;
            print_msg(args.output, "ok", "Gateway destroyed")?;
        }
        Command::AddTunnel {
            name,
            source_ip,
            dest_ip,
            remote_gateway_ip,
            local_id,
            remote_id,
            psk,
        } => {
            let psk = psk.or(config.daemon.default_psk.clone()).ok_or_else(|| {
                anyhow!("No pre-shared key given: pass --psk or set daemon.default_psk")
            })?;
            let entry = TunnelEntry {
                name,
                source_ip,
                dest_ip,
                remote_gateway_ip,
                local_id,
                remote_id,
                psk,
            };
            manager.add_tunnel(&entry).await?;
            print_msg(
                args.output,
                "ok",
                &format!("Tunnel '{}' is up", entry.name),
            )?;
        }
        Command::RemoveTunnel { name } => {
            manager.remove_tunnel(&name).await?;
            print_msg(args.output, "ok", &format!("Tunnel '{name}' removed"))?;
        }
        Command::ListTunnels => {
            let tunnels = manager.list_tunnels()?;
            match args.output {
                OutputFormat::Table => println!("{}", format_tunnel_table(&tunnels)),
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tunnels)?),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if wants_help(std::env::args()) {
        println!("{}", Args::command().render_help());
        return ExitCode::SUCCESS;
    }
    let args = Args::parse();

    let (config, missing_config) = match load_config(args.config.clone(), Config::default_path()) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    let level = args
        .log_level
        .map(tracing::Level::from)
        .unwrap_or_else(|| level_from_str(&config.log_level));
    let _guard = init_logging(LogOptions {
        level,
        log_dir: args.log_dir.clone(),
        json_format: args.json_logs,
        ..Default::default()
    });
    if let Some(path) = missing_config {
        warn!(path = %path.display(), "config file not found, using defaults");
    }
    debug!(conf = %config.paths.ipsec_conf.display(), "loaded configuration");

    match run(args, config).await {
        Ok(()) => {
            info!("ipsecctl command completed");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
