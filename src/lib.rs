//! # Prometheus Bot Pool
//!
//! A slot pool scheduler for short-lived meeting bots.
//!
//! Bots are deployed onto a bounded pool of pre-provisioned execution slots
//! spread over pluggable backends (a self-hosted PaaS, a container-task
//! service, a cluster orchestrator, or local processes). Several scheduler
//! instances can share one set of stores; slot claims are serialized by an
//! advisory lock kept in the shared lock store, and every other slot
//! transition is a compare-and-set on the slot's status.
//!
//! ## Core Problem Solved
//!
//! - **Scarce slots**: requests that find no idle slot, or hit a concurrency
//!   cap, wait in a priority queue with a deadline instead of failing.
//! - **Eventually consistent backends**: reconciliation diffs each backend's
//!   inventory against the slot table and deletes orphans on both sides.
//! - **Stuck or broken slots**: a recovery worker stops or recreates
//!   instances with bounded exponential backoff.
//! - **Silent bots**: a heartbeat monitor frees the slot of a bot that stops
//!   reporting and marks the bot failed.
//! - **Thundering image pulls**: concurrent pulls of one image on one
//!   backend share a single in-flight pull.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use prometheus_bot_pool::builders::SchedulerBuilder;
//! use prometheus_bot_pool::config::SchedulerConfig;
//! use prometheus_bot_pool::core::DeploymentRequest;
//! use prometheus_bot_pool::infra::LocalProcessBackend;
//! use prometheus_bot_pool::runtime::Supervisor;
//! use prometheus_bot_pool::util::serde::BackendKind;
//!
//! let scheduler = SchedulerBuilder::new(SchedulerConfig::from_env()?)
//!     .with_backend(Arc::new(LocalProcessBackend::new().with_default_command("meeting-bot", &[])))
//!     .build()?;
//! scheduler.provision(BackendKind::Local, 4).await?;
//! let supervisor = Supervisor::start(&scheduler)?;
//!
//! let ticket = scheduler.submit(DeploymentRequest::new("bot-42")).await?;
//! let outcome = ticket.wait().await?;
//!
//! supervisor.shutdown().await;
//! ```
//!
//! For complete flows see the integration tests under `tests/`.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Slot state machine, admission queue, locks and background workers.
pub mod core;
/// Configuration models for the pool, backends and timeouts.
pub mod config;
/// Builders to construct schedulers from configuration.
pub mod builders;
/// Platform backends and store implementations.
pub mod infra;
/// Tokio spawner, background supervisor and administrative API.
pub mod runtime;
/// Shared utilities.
pub mod util;
