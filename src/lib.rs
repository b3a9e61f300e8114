//! Out-of-tree scheduler extenders for GPU clusters: a GPU-aware extender
//! that places per-container GPU and tile sets, and a telemetry-aware
//! extender that filters, ranks and labels nodes from live metrics.

pub mod annotation;
pub mod cache;
pub mod deschedule;
pub mod enforcer;
pub mod error;
pub mod extender;
pub mod labels;
pub mod metrics;
pub mod placement;
pub mod policy;
pub mod resources;
pub mod strategy;
pub mod tiles;
pub mod watch;

#[doc(hidden)]
pub mod testutil;
