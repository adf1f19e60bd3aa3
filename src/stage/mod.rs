//! The stage-service layer: contracts, clients, and call policy.
//!
//! Layering, outermost first:
//!
//! ```text
//! orchestrator ──▶ batch ──▶ executor ──▶ client ──▶ external service
//!  (sequencing)   (fan-out)  (policy)    (transport)
//! ```
//!
//! 1. [`contract`] — wire schemas every conforming service must speak
//! 2. [`client`]   — the [`client::StageClient`] capability seam plus the
//!    HTTP implementation; the only code that knows about reqwest
//! 3. [`executor`] — timeout, retry with backoff and jitter, health gating;
//!    the only code that knows about policy

pub mod client;
pub mod contract;
pub mod executor;
