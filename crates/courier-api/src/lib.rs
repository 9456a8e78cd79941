//! Courier HTTP API.
//!
//! Exposes the operational surface of the notification pipeline: health
//! probes, pipeline start/stop/status, manual retry, queue management, and
//! per-user delivery history.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod handlers;
pub mod server;

use std::sync::Arc;

use courier_core::Clock;
use courier_pipeline::{controller::PipelineController, publish::Publisher, store::DeliveryStore};

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Delivery ledger.
    pub store: Arc<dyn DeliveryStore>,
    /// Pipeline lifecycle owner.
    pub controller: Arc<PipelineController>,
    /// Producer handle onto the event queue.
    pub publisher: Arc<Publisher>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}
