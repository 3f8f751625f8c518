//! vibebox core: execute untrusted commands inside an isolated sandbox.
//!
//! Three isolation modes are offered: a host-local fallback (`off`), a
//! Linux container (`docker`), and a native Apple Silicon VM driven
//! through the platform Virtualization framework (`apple-vm`). A fourth
//! value, `auto`, is a selection strategy rather than a runtime. The
//! [`Service`] façade composes the image
//! catalog, the content-addressed artifact store, provider selection, and
//! the backends behind a small embedding API.
//!
//! # Example
//!
//! ```no_run
//! use vibebox::{Provider, Service};
//!
//! # async fn example() -> vibebox::VibeboxResult<()> {
//! let service = Service::new();
//! let result = service
//!     .exec(vibebox::ExecRequest {
//!         provider_override: Some(Provider::Off),
//!         command: "echo hello".into(),
//!         ..Default::default()
//!     })
//!     .await?;
//! assert_eq!(result.exit_code, 0);
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod errors;
pub mod images;
pub mod progress;
pub mod service;
mod util;

pub use config::{Config, Provider};
pub use errors::{ImageError, VibeboxError, VibeboxResult, VmError};
pub use progress::{Phase, ProgressEvent, ProgressSink};
pub use service::{
    BackendDiagnostic, EventHandler, ExecInSessionRequest, ExecOutcome, ExecRequest, Image,
    InitializeRequest, InitializeResult, ProbeReport, Service, ServiceEvent, Session,
    SessionState, StartOutcome, StartRequest, StartSessionRequest, StopSessionRequest,
};
