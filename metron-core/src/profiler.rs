//! Profiler Facade
//!
//! The process-wide context object: owns the configuration, watch
//! registry, sampling decider, and exporter, plus the currently-active
//! transaction slot. Hosts either inject a `Profiler` instance or install
//! one behind the [`install`]/[`global`] accessor.

use once_cell::sync::OnceCell;
use std::sync::{Mutex, MutexGuard};

use crate::config::ProfilerConfig;
use crate::context::{ErrorEvent, ErrorKind, TransactionContext};
use crate::error::{MetronError, Result};
use crate::export::Exporter;
use crate::sampling::{ModeRequest, SampleOverrides, SamplingDecider, SamplingTier};
use crate::span::{Scalar, Span};
use crate::transport::Transport;
use crate::watch::{CallSite, WatchMode, WatchRegistry};

/// Options for starting a transaction.
///
/// Override values arrive here already parsed by the host integration
/// layer; the core only applies the priority order.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Transaction name, when already known at start
    pub transaction_name: Option<String>,
    /// Service name override for this transaction
    pub service_name: Option<String>,
    /// Sample-rate overrides in priority order
    pub overrides: SampleOverrides,
    /// Trace only watched functions (explicit session request)
    pub whitelist_session: bool,
}

impl StartOptions {
    /// Empty options; the configured defaults apply
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the transaction name up front
    pub fn transaction_name(mut self, name: impl Into<String>) -> Self {
        self.transaction_name = Some(name.into());
        self
    }

    /// Set the service name for this transaction
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the explicit per-call-site sample rate (highest priority)
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.overrides.parameter = Some(rate);
        self
    }

    /// Supply all parsed override values at once
    pub fn overrides(mut self, overrides: SampleOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Request whitelist tracing for this transaction
    pub fn whitelist_session(mut self) -> Self {
        self.whitelist_session = true;
        self
    }
}

/// Builder for a [`Profiler`]
pub struct ProfilerBuilder {
    config: ProfilerConfig,
    transport: Option<Box<dyn Transport>>,
    sampling_seed: Option<u64>,
}

impl ProfilerBuilder {
    /// Start from the given configuration
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config,
            transport: None,
            sampling_seed: None,
        }
    }

    /// Use a specific transport instead of the configured daemon socket
    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Seed the sampling RNG for deterministic decisions
    pub fn sampling_seed(mut self, seed: u64) -> Self {
        self.sampling_seed = Some(seed);
        self
    }

    /// Build the profiler
    pub fn build(self) -> Result<Profiler> {
        self.config.validate()?;

        let transport = match self.transport {
            Some(transport) => transport,
            None => Profiler::default_transport(&self.config)?,
        };

        let rate = self.config.effective_sample_rate();
        let decider = match self.sampling_seed {
            Some(seed) => SamplingDecider::with_seed(rate, seed),
            None => SamplingDecider::new(rate),
        };

        let exporter = match &self.config.api_key {
            Some(api_key) => Exporter::new(transport).with_api_key(api_key.clone()),
            None => Exporter::new(transport),
        };

        Ok(Profiler {
            config: self.config,
            registry: WatchRegistry::new(),
            decider: Mutex::new(decider),
            exporter,
            current: Mutex::new(None),
        })
    }
}

/// The application tracing client.
///
/// One logical transaction is active per profiler at a time; hosts with
/// request-per-thread models keep one profiler per worker or reset the
/// shared one between requests.
pub struct Profiler {
    config: ProfilerConfig,
    registry: WatchRegistry,
    decider: Mutex<SamplingDecider>,
    exporter: Exporter,
    current: Mutex<Option<TransactionContext>>,
}

impl Profiler {
    /// Create a profiler talking to the configured collector socket
    pub fn new(config: ProfilerConfig) -> Result<Self> {
        ProfilerBuilder::new(config).build()
    }

    /// Builder with transport and sampling-seed injection
    pub fn builder(config: ProfilerConfig) -> ProfilerBuilder {
        ProfilerBuilder::new(config)
    }

    fn default_transport(config: &ProfilerConfig) -> Result<Box<dyn Transport>> {
        #[cfg(unix)]
        let inner: Box<dyn Transport> =
            Box::new(crate::transport::UdsTransport::from_config(&config.transport));
        #[cfg(not(unix))]
        let inner: Box<dyn Transport> = Box::new(crate::transport::NullTransport);

        Ok(Box::new(crate::transport::QueuedTransport::new(
            inner,
            config.transport.queue_size,
        )?))
    }

    // Lock helpers recover from poisoning: a panicking host thread must
    // not disable the profiler for the rest of the process.
    fn lock_current(&self) -> MutexGuard<'_, Option<TransactionContext>> {
        match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_decider(&self) -> MutexGuard<'_, SamplingDecider> {
        match self.decider.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Start a transaction.
    ///
    /// A second start while one is running is tolerated as a logged no-op;
    /// the running transaction keeps collecting.
    pub fn start(&self, options: StartOptions) {
        let mut current = self.lock_current();

        if current.is_some() {
            tracing::warn!("transaction already started, ignoring start");
            return;
        }

        let mode = ModeRequest {
            whitelist: options.whitelist_session,
            wall_time_always_on: self.config.always_on_wall_time,
        };
        let tier = self.lock_decider().decide(&options.overrides, &mode);

        let service_name = options
            .service_name
            .or_else(|| self.config.service_name.clone());
        let mut context = TransactionContext::new(tier, service_name);
        if let Some(name) = options.transaction_name {
            context.set_name(name);
        }

        tracing::debug!(id = context.id(), tier = tier.as_str(), "transaction started");
        *current = Some(context);
    }

    /// Start a transaction and return a guard that stops it on drop
    pub fn start_guarded(&self, options: StartOptions) -> TransactionGuard<'_> {
        self.start(options);
        TransactionGuard { profiler: self }
    }

    /// Stop the transaction, export it, and reset to not-started.
    ///
    /// Idempotent: a stop without a running transaction is a no-op. A
    /// transaction that never received a name is discarded entirely.
    pub fn stop(&self) {
        let context = self.lock_current().take();

        let Some(context) = context else {
            return;
        };

        if let Some(transaction) = context.seal() {
            self.exporter.export(&transaction);
        }
    }

    /// True when a transaction is running
    pub fn is_started(&self) -> bool {
        self.lock_current().is_some()
    }

    /// True when the running transaction collects any data
    pub fn is_profiling(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map(|c| c.tier().is_profiling())
            .unwrap_or(false)
    }

    /// True when span creation is meaningful for the running transaction
    pub fn is_tracing(&self) -> bool {
        self.lock_current()
            .as_ref()
            .map(|c| c.is_tracing())
            .unwrap_or(false)
    }

    /// The running transaction's sampling tier
    pub fn current_tier(&self) -> Option<SamplingTier> {
        self.lock_current().as_ref().map(|c| c.tier())
    }

    /// Set the transaction name; without one the data is discarded at stop
    pub fn set_transaction_name(&self, name: impl Into<String>) {
        if let Some(context) = self.lock_current().as_mut() {
            context.set_name(name);
        }
    }

    /// Set the service name
    pub fn set_service_name(&self, name: impl Into<String>) {
        if let Some(context) = self.lock_current().as_mut() {
            context.set_service_name(name);
        }
    }

    /// Set a custom variable from a typed scalar
    pub fn set_custom_variable(&self, name: impl Into<String>, value: impl Into<Scalar>) {
        if let Some(context) = self.lock_current().as_mut() {
            context.set_custom_variable(name, value);
        }
    }

    /// Set a custom variable from a JSON value; non-scalars are dropped
    pub fn set_custom_variable_json(&self, name: impl Into<String>, value: &serde_json::Value) {
        if let Some(context) = self.lock_current().as_mut() {
            context.set_custom_variable_json(name, value);
        }
    }

    /// Create a span of the given category.
    ///
    /// Returns the inert handle when no transaction is running or the
    /// tier does not trace spans, so call sites never branch.
    pub fn create_span(&self, category: &str) -> Span {
        self.lock_current()
            .as_ref()
            .map(|c| c.create_span(category))
            .unwrap_or_else(Span::null)
    }

    /// Record a fatal error against the running transaction
    pub fn log_fatal(&self, message: impl Into<String>, file: Option<&str>, line: Option<u32>) {
        if let Some(context) = self.lock_current().as_mut() {
            context.record_error(ErrorEvent {
                kind: ErrorKind::Fatal,
                message: message.into(),
                file: file.map(|f| f.to_string()),
                line,
            });
        }
    }

    /// Record a caught error against the running transaction
    pub fn log_error(&self, error: &dyn std::error::Error) {
        if let Some(context) = self.lock_current().as_mut() {
            context.record_error(ErrorEvent {
                kind: ErrorKind::Exception,
                message: error.to_string(),
                file: None,
                line: None,
            });
        }
    }

    /// Watch a function, wrapping calls in spans of the given category
    pub fn watch(&self, function: impl Into<String>, category: Option<&str>) {
        self.registry.watch(function, category);
    }

    /// Watch a function with a custom callback
    pub fn watch_callback<F>(&self, function: impl Into<String>, callback: F)
    where
        F: Fn(&CallSite<'_>) -> Option<u64> + Send + Sync + 'static,
    {
        self.registry.watch_callback(function, callback);
    }

    /// Remove functions from instrumentation consideration
    pub fn add_ignore_functions<I, S>(&self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.add_ignore_functions(names);
    }

    /// The watch registry
    pub fn registry(&self) -> &WatchRegistry {
        &self.registry
    }

    /// Instrumentation entry point: called before a watched function runs.
    ///
    /// Consults the registry and returns the span wrapping the call, or
    /// the inert handle when the function is unwatched, ignored, or the
    /// transaction is not tracing. Pass the result to [`end_call`](Self::end_call).
    pub fn begin_call(&self, function: &str, args: &[Scalar]) -> Span {
        if !self.is_tracing() {
            return Span::null();
        }

        match self.registry.lookup(function) {
            None => Span::null(),
            Some(WatchMode::Category(category)) => {
                let span = self.create_span(&category);
                span.start_timer();
                span
            }
            Some(WatchMode::Callback(callback)) => {
                // Invoked without holding the transaction lock so the
                // callback can create spans through this profiler.
                let site = CallSite { function, args };
                match callback(&site) {
                    Some(id) => self.span_by_id(id),
                    None => Span::null(),
                }
            }
        }
    }

    /// Instrumentation exit point: stops the span returned by `begin_call`
    pub fn end_call(&self, span: &Span) {
        span.stop_timer();
    }

    /// Resolve a span id from the running transaction's tree
    pub fn span_by_id(&self, id: u64) -> Span {
        if id == 0 {
            return Span::null();
        }

        self.lock_current()
            .as_ref()
            .and_then(|c| c.tree().cloned())
            .map(|tree| Span::recording(id, tree))
            .unwrap_or_else(Span::null)
    }
}

/// RAII guard that stops the transaction on drop.
///
/// The drop-stop is idempotent with an explicit earlier [`Profiler::stop`];
/// host runtimes register this as their request/shutdown finalizer.
pub struct TransactionGuard<'a> {
    profiler: &'a Profiler,
}

impl TransactionGuard<'_> {
    /// Stop the transaction now instead of at scope exit
    pub fn stop(self) {
        // Drop does the work.
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        self.profiler.stop();
    }
}

static GLOBAL: OnceCell<Profiler> = OnceCell::new();

/// Install the process-wide profiler; fails if one is already installed
pub fn install(profiler: Profiler) -> Result<()> {
    GLOBAL
        .set(profiler)
        .map_err(|_| MetronError::Configuration("profiler already installed".to_string()))
}

/// The process-wide profiler, when installed
pub fn global() -> Option<&'static Profiler> {
    GLOBAL.get()
}
