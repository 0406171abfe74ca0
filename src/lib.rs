//! # Aurora SLS: a transparent checkpoint/restore engine
//!
//! Aurora captures the complete execution state of one or more cooperating
//! processes (address space, open resources, threads, signal state,
//! inter-process relationships) into a durable artifact, and later
//! reconstructs equivalent processes from it. Checkpointing is periodic
//! and low-pause: the only stop the workload sees covers metadata capture
//! and copy-on-write shadowing, while serialization runs against frozen
//! pages after the processes resume.
//!
//! ## Core Concepts
//!
//! - **Partition**: the unit of checkpointing, a set of processes plus
//!   attributes, a state machine, and a monotone epoch counter
//! - **Shadowing**: every writable anonymous object gets a copy-on-write
//!   child slid between it and the map entry, freezing the original
//! - **Records**: typed, magic-tagged byte buffers keyed by 64-bit
//!   SLS-IDs; cross-references between captured entities are by ID and
//!   resolved through per-restore tables
//! - **Backends**: a local sparse object store, a file tree, or a
//!   streaming network peer, behind one vtable
//!
//! ## Quick Start
//!
//! ```no_run
//! use aurora_sls::{SlsModule, SlsAttr, Target, Mode, PartBacking};
//!
//! # async fn example() -> Result<(), aurora_sls::SlsError> {
//! let sls = SlsModule::with_defaults();
//!
//! // A process doing some work on the modeled host.
//! let p = sls.host.spawn("worker")?;
//!
//! // Partition 1000: one-shot, full checkpoints into the local store.
//! sls.partadd(1000, SlsAttr::new(Target::Slos, Mode::Full), PartBacking::None)
//!     .await?;
//! sls.attach(1000, p.pid)?;
//!
//! let ticket = sls.checkpoint(1000, false).await?;
//!
//! // ... later, possibly after the process died:
//! sls.restore(1000, false, false).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Module Guide
//!
//! - [`module`] - The engine handle and control surface
//! - [`partition`] - Partitions, attributes, epochs, checkpoint data
//! - [`vm`] - Copy-on-write shadowing and collapse
//! - [`ckpt`] / [`rest`] - Checkpoint passes and restore orchestration
//! - [`resources`] - Per-kind capture of open resources
//! - [`record`] / [`kv`] - Records, SLS-IDs, and the keyed maps under it
//! - [`io`] - The page I/O pipeline and the writeback task queue
//! - [`backend`] - Local store, file tree, and streaming backends
//! - [`host`] - The modeled host the engine operates on

pub mod backend;
pub mod ckpt;
pub mod config;
pub mod error;
pub mod host;
pub mod io;
pub mod kv;
pub mod module;
pub mod partition;
pub mod prefault;
pub mod proc;
pub mod record;
pub mod resources;
pub mod rest;
pub mod stats;
pub mod telemetry;
pub mod vm;
pub mod vmobject;
pub mod vmspace;

pub use config::SlsConfig;
pub use error::{Result, SlsError};
pub use module::SlsModule;
pub use partition::{
    ATTR_ASYNC_SNAP, ATTR_CACHE_REST, ATTR_IGNORE_UNLINKED, ATTR_LAZY_REST, ATTR_NO_CKPT,
    ATTR_PRECOPY, ATTR_PREFAULT, Mode, PartBacking, SlsAttr, Target,
};
pub use record::{RecordType, SlsId};
