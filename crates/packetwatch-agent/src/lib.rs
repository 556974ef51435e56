// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::all)]

pub mod capture;
pub mod config;
pub mod enrich;
pub mod identity;
pub mod pipeline;
