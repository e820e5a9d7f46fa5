// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod export_config;
pub mod exporter;
pub mod id_allocator;
pub mod kube;
