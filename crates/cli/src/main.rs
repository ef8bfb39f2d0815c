use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "forwarder")]
#[command(about = "Forwarder CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and rule file).
    Init {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (inbound endpoint, rule management, event stream) and the relay workers.
    Gateway {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default from config or 17171)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Show or change the persisted forwarding rule. A running gateway picks changes up on restart; use PUT /rule to change it live.
    Rule {
        #[command(subcommand)]
        action: RuleAction,
    },

    /// Print relay events from a running gateway until it shuts down.
    Events {
        /// Config file path (default: FORWARDER_CONFIG_PATH or ~/.forwarder/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[derive(Subcommand)]
enum RuleAction {
    /// Print the persisted rule as JSON.
    Show {
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Replace the rule. Omitted options keep their current value.
    Set {
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Destination to forward to (e.g. a phone number)
        #[arg(long, short)]
        target: Option<String>,

        /// Turn forwarding on
        #[arg(long, conflicts_with = "disable")]
        enable: bool,

        /// Turn forwarding off
        #[arg(long)]
        disable: bool,

        /// Body template with {body}, {sender} and {received_at} placeholders
        #[arg(long, conflicts_with = "clear_template")]
        template: Option<String>,

        /// Forward the body unchanged
        #[arg(long)]
        clear_template: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("forwarder {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config).await {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Rule { action }) => {
            if let Err(e) = run_rule(action).await {
                log::error!("rule failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Events { config }) => {
            if let Err(e) = run_events(config).await {
                log::error!("events failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

async fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(forwarder::config::default_config_path);
    let dir = forwarder::init::init_config_dir(&path).await?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = forwarder::config::load_config(config_path)?;
    if let Some(p) = port {
        config.gateway.port = p;
    }
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    forwarder::gateway::run_gateway(config, path).await
}

fn rule_file(config_path: Option<std::path::PathBuf>) -> anyhow::Result<forwarder::RuleFile> {
    let (config, path) = forwarder::config::load_config(config_path)?;
    Ok(forwarder::RuleFile::new(
        forwarder::config::resolve_rule_path(&config, &path),
    ))
}

async fn run_rule(action: RuleAction) -> anyhow::Result<()> {
    match action {
        RuleAction::Show { config } => {
            let file = rule_file(config)?;
            let rule = file.load().await.unwrap_or_default();
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
        RuleAction::Set {
            config,
            target,
            enable,
            disable,
            template,
            clear_template,
        } => {
            let file = rule_file(config)?;
            let current = file.load().await.unwrap_or_default();
            let target = target.unwrap_or_else(|| current.target.clone());
            let enabled = if enable {
                true
            } else if disable {
                false
            } else {
                current.enabled
            };
            let template = if clear_template {
                None
            } else {
                template.or_else(|| current.template.clone())
            };
            let store = forwarder::RuleStore::with_rule(current);
            let rule = store.update(&target, enabled, template)?;
            file.save(&rule).await?;
            println!("{}", serde_json::to_string_pretty(&rule)?);
        }
    }
    Ok(())
}

async fn run_events(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _) = forwarder::config::load_config(config_path)?;
    let ws_url = format!(
        "ws://{}:{}/events",
        config.gateway.bind.trim(),
        config.gateway.port
    );
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await?;
    log::info!("connected to {}", ws_url);

    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else { continue };
        let frame: serde_json::Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                log::debug!("ignoring unparsable frame: {}", e);
                continue;
            }
        };
        match frame.get("event").and_then(|v| v.as_str()) {
            Some("shutdown") => {
                println!("gateway shut down");
                break;
            }
            Some("relay") => {
                if let Some(payload) = frame.get("payload") {
                    println!("{}", format_event(payload));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// One line per relay event: time, kind, task, sender -> target, extras.
fn format_event(payload: &serde_json::Value) -> String {
    let s = |key: &str| payload.get(key).and_then(|v| v.as_str()).unwrap_or("-");
    let mut line = format!(
        "{} {:<9} {} {} -> {}",
        s("at"),
        s("kind"),
        s("taskId"),
        s("sender"),
        s("target")
    );
    if let Some(attempt) = payload.get("attempt").and_then(|v| v.as_u64()) {
        if attempt > 0 {
            line.push_str(&format!(" retry={}", attempt));
        }
    }
    if let Some(delay) = payload.get("delayMs").and_then(|v| v.as_u64()) {
        line.push_str(&format!(" delay={}ms", delay));
    }
    if let Some(reason) = payload.get("reason").and_then(|v| v.as_str()) {
        line.push_str(&format!(" ({})", reason));
    }
    line
}
