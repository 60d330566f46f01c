// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Backoff and retry helpers shared by startup and the reconnect loop.

pub mod retry;
