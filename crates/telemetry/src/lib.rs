//! Injected logging capability.
//!
//! Each component is handed a [`Logger`] bound to a `tracing::Span`
//! carrying its component name and peer id, rather than reaching for
//! `tracing::info!`/`tracing::debug!` at module scope against process-wide
//! subscriber state. Tests can then install a capturing subscriber scoped
//! to just the span they care about.

use std::fmt;
use tracing::Span;

/// A logging capability bound to one component instance.
///
/// `Logger` is cheap to clone (it wraps a `tracing::Span`, itself a
/// reference-counted handle) and is meant to be held as a struct field,
/// not constructed fresh per call.
#[derive(Clone)]
pub struct Logger {
    span: Span,
}

impl Logger {
    /// Create a logger for `component` scoped to `peer_id`.
    pub fn new(component: &'static str, peer_id: impl fmt::Display) -> Self {
        let span = tracing::info_span!("component", name = component, peer = %peer_id);
        Logger { span }
    }

    /// A logger with no bound peer id, for process-wide components (the
    /// Config Manager, for instance, is not peer-scoped).
    pub fn for_component(component: &'static str) -> Self {
        let span = tracing::info_span!("component", name = component);
        Logger { span }
    }

    /// Run `f` with this logger's span entered, so any `tracing` macro
    /// invocations inside `f` are attributed to this component.
    pub fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        self.span.in_scope(f)
    }

    /// The underlying span, for call sites that need to enter it across
    /// an `.instrument()`ed future rather than a synchronous closure.
    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

/// Install a process-wide `tracing_subscriber::fmt` subscriber reading
/// `RUST_LOG`/`PEERPIN_LOG` for filtering. Intended for binaries built on
/// top of this core; its own tests install scoped subscribers per call
/// site instead via `#[tracing_test::traced_test]`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("PEERPIN_LOG")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
