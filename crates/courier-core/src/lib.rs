//! Core domain models, storage, and time abstractions.
//!
//! Provides strongly-typed domain primitives, the delivery ledger
//! repository, and the injectable clock for the notification pipeline. All
//! other crates depend on these foundational types for type safety and
//! consistency.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    DeliveryRecord, DeliveryStatus, EventBody, EventId, EventPayload, NotificationEvent, SendAck,
    StatusCounts, UserId,
};
pub use time::{Clock, RealClock, TestClock};
