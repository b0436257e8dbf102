//! Core chunkdrive types and algorithms.
//!
//! This crate is the chunk-tree engine shared by the importer and the
//! NBD server.
//!
//! ## Wire-stable formats
//!
//! The following modules define on-disk formats that must stay stable
//! for repositories written with envelope version 1:
//!
//! - Chunk addresses (`address::Address`)
//! - The chunk envelope and child references (`envelope`)
//! - The intro record and intro URL (`intro`)
//! - Key derivation and the AEAD construction (`crypto`)
//!
//! Changes to any of these are format changes and need a new envelope
//! version.
//!
//! ## Engine
//!
//! On top of the formats sit the tree writer (`writer`), the resolver
//! (`reader`), the chunk cache (`cache`), the sparse source adapter
//! (`sparse`), and the pluggable blob store trait (`store`).

pub mod address;
pub mod cache;
pub mod crypto;
pub mod envelope;
pub mod error;
pub mod geometry;
pub mod intro;
pub mod reader;
pub mod sparse;
pub mod store;
pub mod writer;

// --- Core Public Surface ---

pub use address::Address;
pub use cache::ChunkCache;
pub use envelope::{ChildRef, ChunkKind, Envelope};
pub use error::{ChunkError, ChunkResult};
pub use geometry::Geometry;
pub use intro::{IntroRecord, IntroUrl, intro_line};
pub use reader::TreeReader;
pub use sparse::{Section, SectionReader};
pub use store::{BlobStore, StoreError, StoreResult};
pub use writer::{ImportOptions, ImportReceipt, ImportStats, TreeWriter, import};
