//! # snapmap Prelude
//!
//! This module provides a convenient prelude for the most commonly used types and traits
//! from the snapmap library.

// ================================================================================================
// Core Types and Error Handling
// ================================================================================================

/// The main error type for all snapmap operations
pub use crate::Error;

/// The result type used throughout snapmap
pub use crate::Result;

// ================================================================================================
// Main Entry Points
// ================================================================================================

/// Owner of a resource mapping
pub use crate::MappedResource;

/// Owner of a loaded snapshot image
pub use crate::ExecutableImage;

// ================================================================================================
// Namespaces
// ================================================================================================

/// Namespace trait, host directory namespace, and resolution
pub use crate::namespace::{resolve, DirAnchor, DirNamespace, Namespace};

// ================================================================================================
// Buffers and Memory Objects
// ================================================================================================

/// Buffer acquisition and memory object handles
pub use crate::vmo::{MemoryObject, Protection, Region, ResourceBuffer, Rights};

// ================================================================================================
// Snapshot Loading
// ================================================================================================

/// Image loader trait, default ELF loader, and resolved regions
pub use crate::snapshot::{ElfLoader, ElfLoaderConfig, ImageLoader, SnapshotRegions};
