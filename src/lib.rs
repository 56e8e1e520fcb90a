// Copyright 2025 Johann Kempter
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

#![doc(html_no_source)]
#![deny(missing_docs)]
// - 'namespace.rs' calls openat through libc
// - 'vmo/' and 'snapshot/elf.rs' use mmap to map files and images into memory

//! # snapmap
//!
//! Loads binary resources and executable code snapshots from a directory namespace into process
//! memory, for consumption by a language runtime.
//!
//! ## Features
//!
//! - **Namespace scoped lookups** - Paths are resolved relative to a namespace root, never the
//!   host root; absolute paths are rejected before any filesystem access
//! - **Read-only mappings** - Resources are mapped read-only, or read+execute when explicitly
//!   escalated; nothing is ever mapped writable
//! - **Snapshot images** - ELF snapshot images are laid out in memory and their four regions
//!   (VM data, VM instructions, isolate data, isolate instructions) resolved
//! - **Strict pairing** - Every mapping is unmapped and every image unloaded exactly once, when
//!   its owner is dropped
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapmap::prelude::*;
//!
//! let ns = DirNamespace::new("/pkg");
//!
//! let vm_data = MappedResource::load_from_namespace(Some(&ns), "data/vm_snapshot_data.bin", false)?;
//! println!("VM data: {} bytes at {:p}", vm_data.size(), vm_data.address());
//!
//! let aot = ExecutableImage::load(Some(&ns), "data/app_aot.so")?;
//! println!("isolate instructions at {:p}", aot.isolate_instructions());
//! # Ok::<(), snapmap::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - [`namespace`] - Resolves `(namespace, path)` into a directory anchor
//! - [`vmo`] - Buffer acquisition, memory object handles, rights and protections
//! - [`MappedResource`] - Owner of one resource mapping
//! - [`snapshot`] - [`ExecutableImage`] and the [`snapshot::ImageLoader`] it hands descriptors to
//! - [`Error`] and [`Result`] - Error handling
//!
//! ## Logging
//!
//! Diagnostics go through the [`log`] facade. Every failure is logged at `error` level with the
//! operation and path before it is returned; maps, unmaps, loads and unloads are logged at
//! `debug` level. The crate never installs a logger itself.
//!
//! ## Thread Safety
//!
//! Nothing in this crate spawns threads or takes locks. Loading different resources on different
//! threads is safe; a single [`MappedResource`] or [`ExecutableImage`] must not be dropped while
//! another thread still reads through its pointers.
#[macro_use]
pub(crate) mod error;

pub mod namespace;
pub mod snapshot;
pub mod vmo;

mod resource;

/// Shared functionality which is used in unit tests
#[cfg(test)]
pub(crate) mod test;

/// Convenient re-exports of the most commonly used types and traits.
///
/// # Example
///
/// ```rust,no_run
/// use snapmap::prelude::*;
///
/// let resource = MappedResource::load_from_namespace(None, "data/vm_snapshot.bin", false)?;
/// assert_eq!(resource.as_slice().len(), resource.size());
/// # Ok::<(), snapmap::Error>(())
/// ```
pub mod prelude;

/// `snapmap` Result type
///
/// A type alias for [`std::result::Result<T, Error>`] where the error type is always [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// `snapmap` Error type
///
/// Covers every failure of namespace resolution, acquisition, escalation, mapping and image
/// loading.
pub use error::Error;

/// A resource mapped into memory.
pub use resource::MappedResource;

/// An executable snapshot image loaded into memory.
pub use snapshot::ExecutableImage;
