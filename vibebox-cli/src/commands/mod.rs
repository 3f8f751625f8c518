use std::collections::HashMap;

use crate::cli::{Cli, Commands};

pub mod exec;
pub mod images;
pub mod init;
pub mod probe;
pub mod up;

pub async fn dispatch(args: Cli) -> anyhow::Result<i32> {
    match args.command {
        Commands::Init(args) => init::execute(args).await,
        Commands::Up(args) => up::execute(args).await,
        Commands::Probe(args) => probe::execute(args).await,
        Commands::Exec(args) => exec::execute(args).await,
        Commands::Images(args) => images::execute(args).await,
    }
}

/// Parse repeatable `KEY=VALUE` flags.
pub(crate) fn parse_env(values: &[String]) -> anyhow::Result<HashMap<String, String>> {
    let mut out = HashMap::new();
    for value in values {
        let Some((key, val)) = value.split_once('=') else {
            anyhow::bail!("invalid env value: {value:?} (expected KEY=VALUE)");
        };
        if key.is_empty() {
            anyhow::bail!("invalid env value: {value:?} (expected KEY=VALUE)");
        }
        out.insert(key.to_string(), val.to_string());
    }
    Ok(out)
}

/// Parse a provider flag; an empty string means "not specified".
pub(crate) fn parse_provider(value: &str) -> anyhow::Result<Option<vibebox::Provider>> {
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value.parse::<vibebox::Provider>()?))
}

/// Progress rendering shared by init and images upgrade: one line per
/// event to stderr, throttled upstream by the emitter.
pub(crate) fn progress_handler() -> vibebox::EventHandler {
    std::sync::Arc::new(|event: vibebox::ServiceEvent| {
        let label = if event.phase.is_empty() {
            event.kind.clone()
        } else {
            event.phase.clone()
        };
        if event.bytes_total > 0 {
            eprintln!(
                "[{}] {} {:.1}% ({}/{} bytes, {:.0} B/s)",
                label, event.message, event.percent, event.bytes_done, event.bytes_total,
                event.speed_bps,
            );
        } else if !event.message.is_empty() {
            eprintln!("[{}] {}", label, event.message);
        }
    })
}
