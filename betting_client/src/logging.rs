//! Tracing setup and per-operation spans

use std::time::{Duration, Instant};

use ethereum_types::{Address, H256};
use tracing::{info, info_span, Span};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

/// Install the global subscriber. `RUST_LOG` wins over `default_level`.
/// Calling this again once a subscriber is set does nothing.
pub fn init_subscriber(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    if tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .is_ok()
    {
        info!("Tracing initialized");
    }
}

/// Span and timing for one session operation
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation_id: Uuid,
    pub operation: &'static str,
    pub span: Span,
    started: Instant,
}

impl OperationContext {
    pub fn new(operation: &'static str, pool_id: &H256, participant: Option<Address>) -> Self {
        let operation_id = Uuid::new_v4();
        let span = info_span!(
            "bet_operation",
            operation = operation,
            operation_id = %operation_id,
            pool_id = ?pool_id,
            participant = ?participant,
        );
        Self {
            operation_id,
            operation,
            span,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
