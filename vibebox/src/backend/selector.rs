//! Provider selection over probed backends.
//!
//! All three probes run unconditionally so diagnostics are always complete,
//! even when the requested provider is decided by the first probe alone.

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{Backend, ProbeResult};
use crate::config::Provider;
use crate::errors::{VibeboxError, VibeboxResult};

/// Chosen backend plus the full diagnostics map.
#[derive(Clone)]
pub struct Selection {
    pub backend: Arc<dyn Backend>,
    pub provider: Provider,
    pub diagnostics: HashMap<String, ProbeResult>,
    pub was_fallback: bool,
    pub fallback_from: String,
}

impl std::fmt::Debug for Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Selection")
            .field("backend", &self.backend.name())
            .field("provider", &self.provider)
            .field("diagnostics", &self.diagnostics)
            .field("was_fallback", &self.was_fallback)
            .field("fallback_from", &self.fallback_from)
            .finish()
    }
}

/// Apply the provider decision table.
///
/// `off` is never chosen by `auto`; it must be requested explicitly.
pub async fn select(
    provider: Provider,
    off: Arc<dyn Backend>,
    apple_vm: Arc<dyn Backend>,
    docker: Arc<dyn Backend>,
) -> VibeboxResult<Selection> {
    let provider = provider.normalize();
    provider.validate()?;

    let (off_probe, apple_probe, docker_probe) =
        tokio::join!(off.probe(), apple_vm.probe(), docker.probe());

    let mut diagnostics = HashMap::new();
    diagnostics.insert(off.name().to_string(), off_probe.clone());
    diagnostics.insert(apple_vm.name().to_string(), apple_probe.clone());
    diagnostics.insert(docker.name().to_string(), docker_probe.clone());

    let unavailable = |backend: &Arc<dyn Backend>, probe: &ProbeResult| VibeboxError::Unavailable {
        name: backend.name().to_string(),
        reason: probe.reason.clone(),
        hints: probe.fix_hints.clone(),
    };

    let selected = |backend: &Arc<dyn Backend>, provider| Selection {
        backend: Arc::clone(backend),
        provider,
        diagnostics: diagnostics.clone(),
        was_fallback: false,
        fallback_from: String::new(),
    };

    match provider {
        Provider::Off => {
            if !off_probe.available {
                return Err(unavailable(&off, &off_probe));
            }
            Ok(selected(&off, Provider::Off))
        }
        Provider::AppleVm => {
            if !apple_probe.available {
                return Err(unavailable(&apple_vm, &apple_probe));
            }
            Ok(selected(&apple_vm, Provider::AppleVm))
        }
        Provider::Docker => {
            if !docker_probe.available {
                return Err(unavailable(&docker, &docker_probe));
            }
            Ok(selected(&docker, Provider::Docker))
        }
        Provider::Auto => {
            let darwin = cfg!(target_os = "macos");
            if darwin && apple_probe.available {
                return Ok(selected(&apple_vm, Provider::AppleVm));
            }
            if docker_probe.available {
                return Ok(Selection {
                    backend: docker,
                    provider: Provider::Docker,
                    diagnostics,
                    was_fallback: darwin,
                    fallback_from: "apple-vm".to_string(),
                });
            }
            Err(VibeboxError::AutoSelection {
                apple_reason: apple_probe.reason,
                docker_reason: docker_probe.reason,
            })
        }
        Provider::Macos => unreachable!("normalized above"),
    }
}
