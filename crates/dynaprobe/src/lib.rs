//! Dynaprobe - concurrent execution engine for templated protocol health checks
//!
//! This library turns check definitions (a type tag, a templated JSON payload
//! and the attributes to fill it with) into protocol probes, runs a whole set
//! of them concurrently once per pass and hands one event per definition to a
//! publisher.

pub mod check;
pub mod context;
pub mod error;
pub mod model;
pub mod registry;
pub mod render;
pub mod scheduler;
pub mod secret;
pub mod sink;
pub mod transport;

// Re-export main types
pub use check::{CONTENT_NOT_FOUND, Check, ContentMatch};
pub use context::{DEFAULT_CONNECT_TIMEOUT, RunContext};
pub use error::{DefinitionError, ValidationError};
pub use model::{CheckDefinition, CheckEvent, CheckMeta, CheckResult, CheckStatus};
pub use registry::{CheckRegistry, Constructor};
pub use render::{RenderError, Rendered, render};
pub use scheduler::{DEFAULT_EVENT_TYPE, DefinitionStore, PassConfig, PassScheduler, PassSummary};
pub use secret::Secret;
pub use sink::{ChannelPublisher, PublishError, Publisher};

/// Re-export common error types
pub use anyhow;
