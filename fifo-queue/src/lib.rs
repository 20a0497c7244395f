//! Distributed FIFO queue for single-operation hand-off
//!
//! A purpose-built coordinator that lets several processes cooperate as
//! one ordered work queue:
//! - Broker holds the ordered pending-task list and hands out exactly
//!   one task per request
//! - Submitters enqueue task ids and may wait for completion
//! - Workers drain the queue and announce completion to every
//!   connected subscriber (fan-out, at-most-once)
//!
//! Durability of "what is pending" lives in the operation store, not
//! here; a broker restart re-seeds from storage.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod broker;
pub mod client;
pub mod error;
pub mod message;

pub use broker::Broker;
pub use client::{QueueClient, TaskProvider};
pub use error::{Error, Result};
pub use message::{Frame, Method, EVENT_TASK_COMPLETED};
