// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! TLS termination and origination for shared-memory stream dataplanes
//!
//! The host delivers framed `BEGIN`/`DATA`/`END`/`ABORT`/`WINDOW`/`RESET`/
//! `SIGNAL` messages over ring buffers; this crate translates between a
//! network-side stream carrying TLS records and an application-side stream
//! carrying cleartext, in either the server (terminating) or client
//! (originating) role. It owns no sockets and never blocks: TLS delegated
//! work runs on a worker pool and resumes the owning stream with a signal.

#[macro_use]
mod macros;

pub mod config;
pub mod control;
pub mod counter;
pub mod engine;
pub mod error;
pub mod frame;
pub mod route;
pub mod slot;
pub mod store;
pub mod stream;
pub mod task;
pub mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use config::Config;
pub use error::{Error, Kind};
pub use worker::Worker;
