use std::collections::HashMap;
use std::io::Write;

use serde::Serialize;
use vibebox::{BackendDiagnostic, Service};

use crate::cli::ExecArgs;
use crate::commands::{parse_env, parse_provider};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExecJsonResponse {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    selected: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
    diagnostics: HashMap<String, BackendDiagnostic>,
}

pub async fn execute(args: ExecArgs) -> anyhow::Result<i32> {
    let fail_json = |error: String, diagnostics: HashMap<String, BackendDiagnostic>| {
        print_json(&ExecJsonResponse {
            ok: false,
            error: Some(error),
            selected: String::new(),
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
            diagnostics,
        })
    };

    let env = match parse_env(&args.env) {
        Ok(env) => env,
        Err(e) => {
            if args.json {
                fail_json(e.to_string(), HashMap::new())?;
                return Ok(1);
            }
            return Err(e);
        }
    };
    let provider = match parse_provider(&args.provider) {
        Ok(provider) => provider,
        Err(e) => {
            if args.json {
                fail_json(e.to_string(), HashMap::new())?;
                return Ok(1);
            }
            return Err(e);
        }
    };

    let service = Service::new();
    let result = service
        .exec(vibebox::ExecRequest {
            project_root: args.project_root.clone(),
            provider_override: provider,
            command: args.command.clone(),
            cwd: args.cwd.clone(),
            env,
            timeout_seconds: args.timeout_seconds,
            on_event: None,
        })
        .await;

    match result {
        Ok(outcome) => {
            if args.json {
                print_json(&ExecJsonResponse {
                    ok: true,
                    error: None,
                    selected: outcome.selected.as_str().to_string(),
                    exit_code: outcome.exit_code,
                    stdout: outcome.stdout,
                    stderr: outcome.stderr,
                    diagnostics: outcome.diagnostics,
                })?;
                return Ok(outcome.exit_code);
            }
            if !outcome.stdout.is_empty() {
                print!("{}", outcome.stdout);
                std::io::stdout().flush()?;
            }
            if !outcome.stderr.is_empty() {
                eprint!("{}", outcome.stderr);
            }
            Ok(outcome.exit_code)
        }
        Err(e) => {
            if args.json {
                // The exec failed before producing a result; probe again so
                // the bridge still reports per-backend diagnostics.
                let report = service.probe(provider).await;
                fail_json(e.to_string(), report.diagnostics)?;
                return Ok(1);
            }
            Err(e.into())
        }
    }
}

fn print_json<T: Serialize>(payload: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string(payload)?);
    Ok(())
}
