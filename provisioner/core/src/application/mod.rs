// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod controller;
pub mod provisioner;

pub use controller::{Controller, ControllerConfig, SyncReport};
pub use provisioner::{DeleteError, NfsProvisioner, ProvisionError, Provisioner};
