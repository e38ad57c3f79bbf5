// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Synchronizes a production repository installation onto a staging host.
//!
//! A run resolves the [configuration](config), checks that the local host is
//! not production ([`safety`]), snapshots the clone ([`backup`]) and then
//! drives the fixed [pipeline] of [stages]. A failed stage halts the pipeline
//! and hands over to the [`rollback`] manager. The [`report`] is printed on
//! every exit path and is built from the recorded [`context::RunContext`]
//! alone.
//!
//! Everything outside this process (the production host, the local database,
//! the application server, the search index and the integration registry) is
//! reached through the traits in [`services`]. The implementations used in
//! production live in [`host`].

pub mod backup;
pub mod certificate;
pub mod compare;
pub mod config;
pub mod context;
pub mod error;
pub mod host;
pub mod lock;
pub mod log;
pub mod orchestrator;
pub mod pipeline;
pub mod prompt;
pub mod report;
pub mod rollback;
pub mod safety;
pub mod services;
pub mod stages;
pub mod storage;
pub mod tree;
pub mod tuning;
pub mod wait;

#[cfg(test)]
mod testing;
