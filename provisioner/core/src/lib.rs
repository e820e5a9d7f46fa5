// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! NFS Provisioner Core
//!
//! Volume lifecycle engine for a dynamic NFS provisioner.
//!
//! # Architecture
//!
//! - **domain:** claims, volumes, export ids, the exporter and cluster traits
//! - **application:** the provisioner service and the reconciliation controller
//! - **infrastructure:** allocator, export config file, Ganesha and kernel
//!   exporters, Kubernetes client, event bus

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
