use std::collections::HashMap;

use serde::Serialize;
use vibebox::{BackendDiagnostic, Service};

use crate::cli::ProbeArgs;
use crate::commands::parse_provider;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeJsonResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    selected: String,
    was_fallback: bool,
    fallback_from: String,
    diagnostics: HashMap<String, BackendDiagnostic>,
}

pub async fn execute(args: ProbeArgs) -> anyhow::Result<i32> {
    if let Some(root) = &args.project_root {
        if !root.exists() {
            let message = format!("project root does not exist: {}", root.display());
            if args.json {
                print_json(&ProbeJsonResponse {
                    ok: false,
                    error: Some(message),
                    selected: String::new(),
                    was_fallback: false,
                    fallback_from: String::new(),
                    diagnostics: HashMap::new(),
                })?;
                return Ok(1);
            }
            anyhow::bail!(message);
        }
    }

    let provider = match parse_provider(&args.provider) {
        Ok(provider) => provider,
        Err(e) => {
            if args.json {
                print_json(&ProbeJsonResponse {
                    ok: false,
                    error: Some(e.to_string()),
                    selected: String::new(),
                    was_fallback: false,
                    fallback_from: String::new(),
                    diagnostics: HashMap::new(),
                })?;
                return Ok(1);
            }
            return Err(e);
        }
    };

    let service = Service::new();
    let report = service.probe(provider).await;

    if args.json {
        print_json(&ProbeJsonResponse {
            ok: report.ok(),
            error: report.error.clone(),
            selected: report
                .selected
                .map(|p| p.as_str().to_string())
                .unwrap_or_default(),
            was_fallback: report.was_fallback,
            fallback_from: report.fallback_from.clone(),
            diagnostics: report.diagnostics,
        })?;
        return Ok(if report.error.is_none() { 0 } else { 1 });
    }

    if let Some(error) = report.error {
        anyhow::bail!(error);
    }
    println!(
        "selected={} fallback={} from={}",
        report
            .selected
            .map(|p| p.as_str().to_string())
            .unwrap_or_default(),
        report.was_fallback,
        report.fallback_from
    );
    for (name, diag) in &report.diagnostics {
        println!(
            "{} available={} reason={:?} hints={:?}",
            name, diag.available, diag.reason, diag.fix_hints
        );
    }
    Ok(0)
}

fn print_json<T: Serialize>(payload: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(payload)?);
    Ok(())
}
