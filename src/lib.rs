pub use crate::api::{ChatApi, HttpChatApi};
pub use crate::config::ChatConfig;
pub use crate::connection::{
    ConnectionManager, ConnectionStatus, Connector, Emitter, Link, Subscription,
    WebSocketConnector,
};
pub use crate::error::{ChatError, Result};
pub use crate::message_store::{MessageStore, Slot, Snapshot};
pub use crate::reconciliation::{ReconcileOutcome, ReconciliationEngine, ReconciliationPolicy};
pub use crate::send_pipeline::{OptimisticSendPipeline, PendingSend};
pub use crate::session::{ChatSession, HistoryState, SessionCredentials, SessionUpdate};
pub use crate::token_store::{TokenStore, TokenStoreError};
pub use crate::typing::{TypingSignalController, TypingState};
pub use crate::types::{
    CorrelationId, Delivery, EventChannel, InboundEvent, Message, MessageId, OutboundEvent,
    RetryInfo, UserId, UserProfile, WireMessage,
};

use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::Mutex;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

mod api;
mod config;
pub mod connection;
mod error;
mod message_store;
mod reconciliation;
mod send_pipeline;
mod session;
mod token_store;
mod typing;
pub mod types;

#[cfg(test)]
mod test_utils;

static TRACING_GUARDS: OnceCell<Mutex<Option<(WorkerGuard, WorkerGuard)>>> = OnceCell::new();
static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber: stdout plus a daily rolling file in
/// `logs_dir`, filtered by `RUST_LOG` (default `info`). Later calls are no-ops.
pub fn init_tracing(logs_dir: &Path) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        std::fs::create_dir_all(logs_dir)?;

        let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("rentchat")
            .filename_suffix("log")
            .build(logs_dir)
            .map_err(|e| ChatError::Configuration(format!("failed to create log file: {e}")))?;

        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

        TRACING_GUARDS
            .set(Mutex::new(Some((file_guard, stdout_guard))))
            .ok();

        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = Layer::new()
            .with_writer(non_blocking_file)
            .with_ansi(false)
            .with_target(true);

        // Another subscriber may already be installed by the embedding app
        Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init()
            .ok();

        Ok(())
    })?;
    Ok(())
}

/// Flushes buffered log lines. Call before the process exits.
pub fn flush_tracing() {
    if let Some(guards) = TRACING_GUARDS.get()
        && let Ok(mut guards) = guards.lock()
    {
        guards.take();
    }
}
