use vibebox::images::{catalog, ImageManager};
use vibebox::Service;

use crate::cli::{ImagesArgs, ImagesCommands};
use crate::commands::progress_handler;

pub async fn execute(args: ImagesArgs) -> anyhow::Result<i32> {
    match args.command {
        ImagesCommands::List => list(),
        ImagesCommands::Upgrade { image_id } => upgrade(image_id).await,
    }
}

fn list() -> anyhow::Result<i32> {
    let service = Service::new();
    let images = service.list_images("");
    if images.is_empty() {
        println!("no official images for this architecture");
        return Ok(0);
    }
    for image in images {
        println!(
            "{}\t{}\t{}\t{} bytes",
            image.id, image.version, image.arch, image.size_bytes
        );
    }
    Ok(0)
}

async fn upgrade(image_id: Option<String>) -> anyhow::Result<i32> {
    let desc = match image_id.as_deref().filter(|id| !id.is_empty()) {
        Some(id) => catalog::find_by_id(id)
            .ok_or_else(|| anyhow::anyhow!("unknown image id: {id}"))?,
        None => catalog::list_for_arch("")
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("no official images for this architecture"))?,
    };

    let handler = progress_handler();
    let sink = vibebox::progress::FnSink(move |event: vibebox::ProgressEvent| {
        handler(vibebox::ServiceEvent {
            kind: "images.upgrade".into(),
            phase: event.phase.as_str().into(),
            message: event.message,
            percent: event.percent,
            bytes_done: event.bytes_done,
            bytes_total: event.bytes_total,
            speed_bps: event.speed_bps,
            eta: event.eta,
            error: event.error,
            done: event.done,
        })
    });

    let manager = ImageManager::new()?;
    let prepared = manager.ensure_prepared(&desc, &sink).await?;
    println!("image ready: {}", prepared.raw_path.display());
    Ok(0)
}
