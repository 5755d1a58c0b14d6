//! Easy Store Storage Layer
//!
//! This crate reads and writes DES containers — the append-only,
//! self-describing objects that pack very large numbers of small files for
//! object storage.
//!
//! ## Components
//!
//! ### ContainerWriter
//! Streams DATA as files are added, accumulates per-file metadata, and
//! finalizes META + INDEX + FOOTER in one pass. Payloads at or above the
//! big-file threshold are diverted to an external sidecar, leaving a stub
//! index entry behind.
//!
//! ### ContainerReader
//! Serves a container file on local disk: footer-first bootstrap, lazy
//! index load, point reads, and batched reads with gap merging.
//!
//! ### RangeContainerReader
//! The same surface against an object store. Point reads cost one HTTP
//! Range request; batch reads coalesce adjacent entries under a
//! configurable gap budget; the parsed index is cached keyed by
//! `{bucket, key, version}`.
//!
//! ### IndexCache
//! One advisory contract with two implementations: an in-process LRU+TTL
//! cache and an external key-value variant (JSON, optional gzip). A cache
//! miss never fails a read — it costs exactly one extra Range.
//!
//! ## Write path
//!
//! ```text
//! add(name, bytes, meta)
//!     ↓
//! DATA append            ← insertion order preserved
//!     ↓
//! finalize()
//!     ↓
//! META + INDEX + FOOTER  ← single trailing write
//!     ↓
//! upload / read back
//! ```

mod batch;

pub mod cache;
pub mod error;
pub mod external;
pub mod range_reader;
pub mod reader;
pub mod writer;

pub use cache::{IndexCache, InMemoryIndexCache, InMemoryKv, KvBackend, KvIndexCache, NullCache};
pub use error::{Error, Result};
pub use external::ExternalFileStore;
pub use range_reader::{RangeContainerReader, RangeReaderOptions, RequestStats};
pub use reader::{BatchOutcome, ContainerReader, ReaderOptions};
pub use writer::{with_container, ContainerWriter, ExternalFileRecord, WriterOptions};
