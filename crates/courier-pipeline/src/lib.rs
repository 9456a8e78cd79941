//! Notification delivery pipeline.
//!
//! Events published by business operations travel through a queue to a
//! polling worker, which records each delivery in a persistent ledger,
//! performs the channel send, and schedules retries with a fixed backoff
//! schedule. A durable sweeper recovers scheduled retries across restarts,
//! and a controller exposes the start/stop/status surface.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod controller;
pub mod error;
pub mod publish;
pub mod queue;
pub mod render;
pub mod retry;
pub mod scheduler;
pub mod sender;
pub mod store;
pub mod worker;

pub use controller::{PipelineConfig, PipelineController, PipelineStatus, WorkerState};
pub use error::{PipelineError, Result};
pub use publish::{PublishOutcome, Publisher};
pub use queue::{EventQueue, InMemoryQueue, RedisQueue};
pub use render::{render, Rendered};
pub use retry::{RetryDecision, RetryPolicy};
pub use scheduler::{RetrySweeper, SweeperConfig};
pub use sender::{ChannelSender, GatewayConfig, HttpGatewaySender, Outbound};
pub use store::{DeliveryStore, PostgresDeliveryStore};
pub use worker::{Worker, WorkerConfig, WorkerStats, WorkerStatsSnapshot};
