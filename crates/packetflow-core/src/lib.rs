// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Packetflow Core - Resumable Packet-Processing Engine
//!
//! This crate pulls bounded pages ("packets") of records from an offset/limit
//! HTTP endpoint, processes every record through a pluggable processor with
//! its own retry bookkeeping, and checkpoints progress so a session survives
//! restarts. Sessions can be paused, resumed and cancelled at any time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Embedding application                          │
//! │             (start / pause / resume / cancel / retry)            │
//! └──────────────────────────────────────────────────────────────────┘
//!                                  │
//!                                  ▼
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                     session_handlers                              │
//! │        state machine, idempotent start, per-key slot lock         │
//! └──────────────────────────────────────────────────────────────────┘
//!            │ spawns                                │
//!            ▼                                       ▼
//! ┌───────────────────────┐   fetch    ┌──────────────────────────────┐
//! │     packet_loop       │───────────►│  packetflow-http              │
//! │ fetch/dispatch/       │            │  (PaginationClient, retries)  │
//! │ checkpoint            │            └──────────────────────────────┘
//! └───────────────────────┘
//!            │ records, checkpoints
//!            ▼
//! ┌───────────────────────┐
//! │  PostgreSQL / SQLite  │
//! │  (sessions, records)  │
//! └───────────────────────┘
//! ```
//!
//! # Session State Machine
//!
//! | From | Event | To |
//! |------|-------|----|
//! | (none) | start | ACTIVE |
//! | ACTIVE | pause | PAUSED |
//! | ACTIVE | all pages consumed | COMPLETED |
//! | ACTIVE | fetch failure / loop error | FAILED |
//! | ACTIVE, PAUSED | cancel | CANCELLED |
//! | PAUSED, FAILED | resume | ACTIVE |
//!
//! COMPLETED and CANCELLED are final. `start` on an ACTIVE or PAUSED key
//! returns the existing processing id without creating anything.
//!
//! # Checkpoint Semantics
//!
//! `current_offset` advances only after every record of a packet reached a
//! terminal status. After a crash the packet in flight is fetched again;
//! records already stored as SUCCESS or FAILED are skipped, the rest are
//! processed again (at-least-once).
//!
//! # Record Retries
//!
//! `retry_failed_records` resets FAILED records with retries left to
//! PENDING. The loop re-dispatches them from their stored payload before
//! fetching the next packet.

/// Failure message classification.
pub mod classifier;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types with stable error codes.
pub mod error;

/// Page source abstraction over the pagination client.
pub mod fetcher;

/// Embedded database migrations.
pub mod migrations;

/// The per-session fetch/dispatch/checkpoint loop.
pub mod packet_loop;

/// Session and record persistence (PostgreSQL, SQLite).
pub mod persistence;

/// Record processor collaborator.
pub mod processor;

/// Embeddable runtime with crash recovery.
pub mod runtime;

/// Control surface: start, status, pause, resume, cancel, retry, queries.
pub mod session_handlers;

/// Per-session locks and loop ownership.
pub mod slots;

/// Stale session detection.
pub mod stale_monitor;
