// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: claims, volumes, export identities, and the interfaces the
//! provisioner depends on (exporter backend, cluster API).

pub mod claim;
pub mod cluster;
pub mod config;
pub mod events;
pub mod export;
pub mod volume;
