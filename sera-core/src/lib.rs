//! # sera-core
//!
//! Durable pipeline that reorganizes ripped anime series into a canonical
//! per-season library layout:
//!
//! - **Copy engine** — bounded-parallel transfers with liveness heartbeats
//!   and size-based integrity verification.
//! - **Cluster detector** — file-size histogram splitting episodes from
//!   extras, with an operator confirmation gate on low confidence.
//! - **Coordinators** — a six-stage library workflow fanning out per-disc
//!   state machines, checkpointed to an append-only journal so a process
//!   crash between any two steps resumes without re-doing completed work.
//! - **Activity seams** — filesystem, subtitle extraction, the AniList
//!   catalogue, and the episode matcher live behind async traits; the
//!   coordinators themselves are deterministic and side-effect free.

pub mod activities;
pub mod copy;
pub mod detect;
pub mod error;
pub mod fsops;
pub mod naming;
pub mod types;
pub mod workflow;

pub use error::{OrganizeError, Result};
pub use workflow::{start_organize, OrganizeEnvironment, OrganizeHandle, Signal};
