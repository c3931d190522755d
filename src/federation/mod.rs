//! Federation engine
//!
//! Handles:
//! - Envelope validation and typed documents
//! - The staged activity pipeline and its handler registry
//! - Signed delivery, scheduling and per-domain failure tracking
//! - Reply context resolution and bulk outbox import
//! - Publishing local content, WebFinger and inbox rate limiting

pub mod context;
pub mod delivery;
pub mod engine;
pub mod envelope;
pub mod failure;
pub mod fetch;
pub mod handlers;
pub mod ids;
pub mod import;
pub mod jobs;
pub mod pipeline;
pub mod publish;
pub mod rate_limit;
pub mod registry;
pub mod scheduler;
pub mod signature;
pub mod types;
pub mod webfinger;

/// Hops the reply context resolver follows before giving up.
pub const MAX_REPLY_DEPTH: usize = 3;

pub use context::{ContextError, ResolvedChain, resolve_context};
pub use delivery::{Delivery, delivery_key};
pub use engine::{ACTOR_KEY_BITS, Federation};
pub use envelope::{EnvelopeError, parse_envelope, validate_document};
pub use failure::{DEFAULT_FAILURE_DAYS_THRESHOLD, FailureTracker};
pub use handlers::default_registry;
pub use import::{ImportReport, import_outbox};
pub use jobs::{Job, run_worker};
pub use pipeline::{Origin, PipelineOutcome};
pub use rate_limit::{RateLimiter, extract_domain};
pub use registry::{HandlerFn, HandlerRegistry, Stage};
pub use scheduler::{LocalScheduler, TaskScheduler};
pub use types::{ApEntity, ApType, build_entity};
