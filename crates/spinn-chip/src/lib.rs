// SPDX-License-Identifier: AGPL-3.0-only

//! Protocol and router model for SpiNNaker machines.
//!
//! This crate has **no dependencies** and **no I/O**: it is a pure model of
//! what the host has to agree with the machine on: SCP/SDP constants and
//! codes, multicast route identifiers, the router's in-memory entry record,
//! and the region words used by nearest-neighbour flood-fill.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`scp`] | Ports, header sizes, flags, command codes, return codes, data types |
//! | [`app`] | Application signals, states, nearest-neighbour and alloc opcodes |
//! | [`routes`] | Link/core route identifiers and the 24-bit route set |
//! | [`router`] | 16-byte router entry record, table capacity, router addresses |
//! | [`regions`] | Flood-fill region words (levels 0–3) |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod regions;
pub mod router;
pub mod routes;
pub mod scp;

pub use routes::{Link, Route, RouteSet};
