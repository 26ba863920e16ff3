//! # chunkmaster
//!
//! Coordination plane of a distributed chunk file system: the master-side
//! bookkeeping of chunk servers and the storage-layout enforcement engine.
//! File data lives in 64 MiB chunks on chunk servers; this crate tracks the
//! servers, speaks the master side of the chunkserver and metalogger
//! protocols, plans replication under per-server bandwidth caps, places new
//! chunks with a capacity-weighted round-robin, and keeps the mutation
//! changelog durable through a supervised background writer.
//!
//! ## Architecture
//!
//! - **proto / net**: big-endian framed TCP, one listener per peer type
//! - **csdb**: the durable directory of chunk servers (identity, csid,
//!   maintenance state, heavy-load grace)
//! - **matocs**: chunkserver session state machine, command ledgers,
//!   replication selection and weighted placement
//! - **matoml**: metalogger changelog streaming and metadata download
//! - **changelog / bgsaver**: mutation records fanned out to receivers and
//!   persisted off the hot path
//! - **runtime**: timer wheel, signals, shutdown ordering
//!
//! The filesystem tree, the chunk goal engine, and the client surface are
//! collaborators behind the contracts in [`metadata`].

pub mod bgsaver;
pub mod changelog;
pub mod config;
pub mod csdb;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod master;
pub mod matocs;
pub mod matoml;
pub mod metadata;
pub mod multilan;
pub mod net;
pub mod proto;
pub mod runtime;
pub mod testkit;
pub mod topology;

/// Identifier of a live protocol session (chunkserver or metalogger).
pub type SessId = u32;

pub use crate::config::Config;
pub use crate::error::{MasterError, Result};
pub use crate::master::{Clock, Master};
