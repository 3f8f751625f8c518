use vibebox::Service;

use crate::cli::InitArgs;
use crate::commands::{parse_provider, progress_handler};

pub async fn execute(args: InitArgs) -> anyhow::Result<i32> {
    let provider = parse_provider(&args.provider)?;
    let service = Service::new();

    let result = service
        .initialize(vibebox::InitializeRequest {
            project_root: args.project_root,
            image_id: args.image_id,
            provider,
            cpus: Some(args.cpus),
            ram_mb: Some(args.ram_mb),
            disk_gb: Some(args.disk_gb),
            provision_script: args.provision_script,
            no_default_mounts: false,
            mounts: Vec::new(),
            on_event: Some(progress_handler()),
        })
        .await?;

    println!("Initialized {}", result.project_root.display());
    println!("  config: {}", result.config_path.display());
    println!(
        "  image:  {} {} ({})",
        result.image.id, result.image.version, result.image.arch
    );
    println!("  disk:   {}", result.base_raw_path.display());
    Ok(0)
}
