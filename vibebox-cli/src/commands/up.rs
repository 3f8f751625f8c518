use vibebox::Service;

use crate::cli::UpArgs;
use crate::commands::parse_provider;

pub async fn execute(args: UpArgs) -> anyhow::Result<i32> {
    let provider = parse_provider(args.provider.as_deref().unwrap_or(""))?;
    let service = Service::new();

    let outcome = service
        .start(vibebox::StartRequest {
            project_root: args.project_root,
            provider_override: provider,
            io: Default::default(),
            on_event: Some(std::sync::Arc::new(|event: vibebox::ServiceEvent| {
                if !event.message.is_empty() {
                    eprintln!("{}", event.message);
                }
            })),
        })
        .await?;

    if outcome.was_fallback {
        eprintln!(
            "note: fell back from {} to {}",
            outcome.fallback_from,
            outcome.selected.as_str()
        );
    }
    Ok(0)
}
