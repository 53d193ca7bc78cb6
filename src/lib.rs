// SPDX-License-Identifier: AGPL-3.0-or-later
//! imgserv-provision: provisioning orchestrator for the imgserv host pair
//!
//! Brings up the private primary host that runs the capture service and the
//! public edge host that serves its synchronized output, and keeps both in
//! shape across repeated runs.
//!
//! # Features
//!
//! * **Idempotent configuration:** the service's `KEY=VALUE` file is merged, not
//!   rewritten; operator-owned groups survive every run
//! * **Key lifecycle:** Ed25519 provisioning key generated, validated and
//!   repaired atomically, then deployed to the edge host
//! * **Gated TLS:** certificates are only requested once DNS has converged on an
//!   external resolver

pub mod bootstrap;
pub mod certs;
pub mod connector;
pub mod dns;
pub mod error;
pub mod health;
pub mod input;
pub mod keys;
pub mod lock;
pub mod orchestrator;
pub mod process;
pub mod retry;
pub mod settings;
pub mod store;

pub use error::{ErrorKind, ProvisionError, Result};
pub use orchestrator::{Collaborators, Orchestrator, RunReport};
pub use settings::Settings;
