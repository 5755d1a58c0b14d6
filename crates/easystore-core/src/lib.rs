//! Easy Store Core
//!
//! This crate defines the building blocks shared by every other Easy Store
//! crate:
//!
//! 1. **Format primitives**: the byte-exact DES v1 container layout (header,
//!    footer, index entry codec, flag bits) used by writers and readers.
//! 2. **Container index**: the parsed, name-addressable view of a container's
//!    index region, including duplicate-name detection.
//! 3. **Name generation**: monotone, collision-resistant file name minting
//!    (`<PREFIX>_YYYYMMDD_<12hex>_<2hex>`).
//! 4. **Shard routing**: the stable `name -> shard_id` hash and the
//!    pod-ordinal shard assignment used by the distributed packer.
//! 5. **Canonical metadata**: the one JSON serialization rule for per-file
//!    metadata blobs.
//!
//! ## What is a DES container?
//!
//! A container is a single append-only object holding many small files plus
//! the metadata and binary index needed to locate any of them. Because the
//! index and footer are embedded, a reader needs no external catalog: the
//! trailing 80 bytes locate everything.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ HEADER (16 bytes)  magic "DESHEAD1" + version               │
//! ├─────────────────────────────────────────────────────────────┤
//! │ DATA               raw file bytes, insertion order          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ META               length-prefixed JSON blobs, one per file │
//! ├─────────────────────────────────────────────────────────────┤
//! │ INDEX              variable-width entries, insertion order  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ FOOTER (80 bytes)  region offsets + trailing "DESFOOT1"     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod encoding;
pub mod error;
pub mod format;
pub mod index;
pub mod meta;
pub mod naming;
pub mod sharding;

pub use error::{CoreError, Result};
pub use format::{ContainerStats, Footer, IndexEntry, FLAG_EXTERNAL};
pub use index::ContainerIndex;
pub use naming::{Clock, NameGenerator, NameGeneratorConfig, SystemClock};
pub use sharding::{consistent_hash, shard_assignment, shard_hex};
