//! # Metron - Production-Safe Application Tracing
//!
//! Metron is a low-overhead tracing client for profiling production
//! applications:
//! - Per-transaction sampling with a fixed override priority order
//! - Span trees with microsecond, monotonic timers
//! - Function watches with default wrapping or custom callbacks
//! - Fire-and-forget export to a local collector daemon
//! - An inert null span so instrumentation never branches on tracing state
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use metron_core::prelude::*;
//!
//! fn main() -> Result<()> {
//!     let profiler = Profiler::new(ProfilerConfig::default())?;
//!
//!     profiler.start(StartOptions::new().sample_rate(0.25));
//!     profiler.set_transaction_name("checkout");
//!
//!     let span = profiler.create_span("sql");
//!     span.start_timer();
//!     // ... run the query ...
//!     span.stop_timer();
//!
//!     profiler.stop();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! Metron never disturbs the host application:
//! - **Sampling**: tier decided per transaction; overrides win over the
//!   configured rate in a fixed priority order
//! - **Tolerant API**: double starts, double stops, and out-of-order span
//!   stops are logged no-ops, never errors
//! - **Name gate**: transactions without a name are discarded at stop
//! - **Bounded export**: the transport queue drops rather than blocks, so
//!   `stop()` never stalls request completion

pub mod config;
pub mod context;
pub mod error;
pub mod export;
pub mod profiler;
pub mod sampling;
pub mod span;
pub mod transport;
pub mod watch;

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use profiler::{global, install};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ProfilerConfig, TransportConfig, DEFAULT_SAMPLE_RATE};
    pub use crate::context::{ErrorEvent, ErrorKind, Transaction, TransactionContext};
    pub use crate::error::{MetronError, Result};
    pub use crate::export::{Exporter, TransactionPayload};
    pub use crate::profiler::{
        global, install, Profiler, ProfilerBuilder, StartOptions, TransactionGuard,
    };
    pub use crate::sampling::{
        ModeRequest, SampleOverrides, SamplingDecider, SamplingTier,
    };
    pub use crate::span::{Scalar, Span, SpanData, SpanTree};
    pub use crate::transport::{MemoryTransport, NullTransport, QueuedTransport, Transport};
    pub use crate::watch::{CallSite, WatchMode, WatchRegistry};

    #[cfg(unix)]
    pub use crate::transport::UdsTransport;
}
