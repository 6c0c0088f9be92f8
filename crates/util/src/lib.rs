// SPDX-License-Identifier: AGPL-3.0-only

pub mod backoff;
pub mod conn;
pub mod telemetry;
