// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Shared utility helpers

pub mod concurrency;

pub use concurrency::map_bounded;
