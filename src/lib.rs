//! eld — an ELF link engine.
//!
//! The crate consumes relocatable objects, archives, shared objects,
//! bitcode, linker scripts, and binary blobs, and produces the laid-out
//! image of an ELF executable, shared object, or relocatable object.
//! The engine owns symbol resolution, section and COMDAT merging,
//! linker-script-directed placement, layout and program-header
//! synthesis, and the relocation scan/apply protocol.
//!
//! Everything with byte-exact format knowledge or target knowledge sits
//! behind a seam: [`input::ObjectReader`] and
//! [`object::linker::ObjectWriter`] for containers,
//! [`target::Backend`] and [`reloc::Relocator`] for the target, and
//! [`lto::LtoEngine`] for delegated code generation.

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic, missing_docs)]

pub mod config;
pub mod error;
pub mod input;
pub mod layout;
pub mod lto;
pub mod module;
pub mod object;
pub mod plugin;
pub mod reloc;
pub mod script;
pub mod section;
pub mod support;
pub mod symbol;
pub mod target;

pub use config::{LinkerConfig, OutputKind, TargetOptions};
pub use error::{DiagnosticEngine, Error, Result, Severity};
pub use module::Module;
pub use object::linker::{LinkOutput, ObjectLinker, ObjectWriter};
pub use target::{Backend, TargetInfo};
