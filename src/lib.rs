//! # anvilq
//!
//! Weighted multi-queue async job processing for Rust applications.
//!
//! ## Features
//!
//! - **Weighted Queues**: named queues share workers in proportion to their weights
//! - **Idempotent Execution**: a per-key guard with fail-open or fail-closed behaviour
//! - **Retries**: bounded retries with backoff, and a terminal `Failed` state
//! - **Middleware**: panic recovery, tracing spans, metrics and structured logs
//! - **Graceful Shutdown**: in-flight tasks drain; interrupted ones are requeued
//! - **Admin Inspector**: stats, paginated listings, retry and delete of failed tasks
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anvilq::prelude::*;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct EmailTask {
//!     to: String,
//!     subject: String,
//! }
//!
//! #[async_trait]
//! impl AnvilTask for EmailTask {
//!     const TASK_TYPE: &'static str = "email:send";
//!
//!     async fn forge(self, ctx: &TaskContext) -> Result<(), HandlerError> {
//!         if self.to.is_empty() {
//!             return Err(HandlerError::validation("missing recipient"));
//!         }
//!         ctx.write_json(&format!("sent to {}", self.to))?;
//!         Ok(())
//!     }
//!
//!     fn queue(&self) -> &str {
//!         "critical"
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> AnvilResult<()> {
//!     let config = AnvilConfig::development();
//!     init_logging(&config.logging);
//!
//!     let registry = RegistryBuilder::new().register_task::<EmailTask>().build()?;
//!     let anvil = Anvil::in_memory(config, registry)?;
//!     anvil.start_forging().await?;
//!
//!     anvil
//!         .enqueue(EmailTask {
//!             to: "user@example.com".to_string(),
//!             subject: "Welcome".to_string(),
//!         })
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await.ok();
//!     anvil.stop_forging().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod idempotency;
pub mod inspector;
pub mod queue;
pub mod task;
pub mod utils;

#[cfg(feature = "metrics")]
#[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
pub mod metrics;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::core::Anvil;
    pub use crate::core::handler::{TaskContext, TaskHandler, handler_fn};
    pub use crate::core::registry::{HandlerOptions, RegistryBuilder, TaskRegistry};
    pub use crate::error::{AnvilError, AnvilResult, ErrorCode, FailureKind, HandlerError};
    pub use crate::idempotency::{IdempotencyGuard, IdempotencyMode, IdempotencyStore};
    pub use crate::inspector::{Page, PageRequest, Pagination, QueueInspector};
    pub use crate::queue::{QueueBackend, QueueCounts, TaskQueue};
    pub use crate::task::{AnvilTask, EnqueueOptions, QueuedTask, TaskId, TaskState};
    pub use crate::utils::init_logging;
    pub use async_trait::async_trait;

    #[cfg(feature = "metrics")]
    #[cfg_attr(docsrs, doc(cfg(feature = "metrics")))]
    pub use crate::metrics::AnvilMetrics;
}

pub use crate::config::*;
pub use crate::core::Anvil;
pub use crate::error::{AnvilError, AnvilResult, HandlerError};
pub use crate::queue::{QueueBackend, TaskQueue};
pub use crate::task::{AnvilTask, QueuedTask, TaskId, TaskState};
pub use async_trait::async_trait;
