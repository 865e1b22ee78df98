// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Process controller: supervises a tree of processes that talk to it over
//! their standard streams and to authenticated peers over TCP.

pub mod auth;
pub mod codec;
pub mod config;
pub mod controller;
pub mod env;
pub mod error;
pub mod master;
pub mod process;
pub mod protocol;
pub mod respawn;
pub mod server;
pub mod state;
