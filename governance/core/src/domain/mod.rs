// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod alert;
pub mod approval;
pub mod audit;
pub mod clock;
pub mod governance_config;
pub mod policy;
pub mod repository;
