//! ai-relay CLI: send a chat message through the configured backend chain.
//!
//! Usage:
//!   ai-relay-cli ask <message> [--user <id>] [--system <prompt>] [--config <path>]
//!   ai-relay-cli order [--config <path>]
//!   ai-relay-cli version

use ai_relay::dispatcher::{BackendDispatcher, DispatcherConfig};
use ai_relay::Message;
use anyhow::{bail, Context};
use tracing_subscriber::EnvFilter;

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match args[1].as_str() {
        "ask" => cmd_ask(&args[2..]),
        "order" => cmd_order(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("ai-relay-cli {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

fn print_usage() {
    println!(
        r#"ai-relay-cli: 弹性聊天调度命令行工具

USAGE:
    ai-relay-cli <COMMAND> [OPTIONS]

COMMANDS:
    ask <message>               Send a message through the backend chain
        --user <id>             User id passed to backends (default: cli)
        --system <prompt>       System prompt
    order                       Print the computed attempt order
    version                     Show version information
    help                        Show this help message

OPTIONS:
    --config <path>             YAML or JSON dispatcher config

ENVIRONMENT:
    AI_RELAY_CONFIG             Config file used when --config is absent
    RUST_LOG                    Log filter (default: info)"#
    );
}

fn flag_value<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
}

fn positional(args: &[String]) -> Vec<&str> {
    let mut out = Vec::new();
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        if arg.starts_with("--") {
            skip = true;
            continue;
        }
        out.push(arg.as_str());
    }
    out
}

fn load_config(args: &[String]) -> anyhow::Result<DispatcherConfig> {
    match flag_value(args, "--config") {
        Some(path) => DispatcherConfig::from_file(path).with_context(|| format!("loading {path}")),
        None => DispatcherConfig::from_env().context("loading config from AI_RELAY_CONFIG"),
    }
}

fn cmd_order(args: &[String]) -> anyhow::Result<()> {
    let config = load_config(args)?;
    let order: Vec<&str> = config.attempt_order().iter().map(|id| id.as_str()).collect();
    println!("{}", order.join(" -> "));
    Ok(())
}

fn cmd_ask(args: &[String]) -> anyhow::Result<()> {
    let words = positional(args);
    if words.is_empty() {
        bail!("ask requires a message");
    }
    let message = words.join(" ");
    let user = flag_value(args, "--user").unwrap_or("cli").to_string();
    let system = flag_value(args, "--system").unwrap_or("").to_string();
    let config = load_config(args)?;

    let runtime = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    runtime.block_on(async move {
        let dispatcher = BackendDispatcher::with_default_backends(config)?;
        let out = dispatcher
            .send_message(&user, &[Message::user(message)], &system)
            .await?;
        println!("{}", out.response.content);
        println!();
        println!("{}", serde_json::to_string_pretty(&out.metadata)?);
        Ok::<(), anyhow::Error>(())
    })
}
