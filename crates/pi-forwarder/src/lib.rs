// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event forwarding pipeline for Meshtastic telemetry.
//!
//! Events enter through one of the [`sources`] (a newline-delimited JSON stream or a
//! supervised `meshtastic --listen` subprocess), are handed to the [`queue::DeliveryQueue`]
//! and are posted to a remote ingestion endpoint with retries, jitter and an
//! idempotency key derived by [`identity::identify`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod clock;
pub mod config;
pub mod errors;
pub mod identity;
pub mod queue;
pub mod sources;
pub mod transport;
