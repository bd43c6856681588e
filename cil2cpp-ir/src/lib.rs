//! The IR Builder: turns a set of loaded .NET assemblies into a flat-struct C++ intermediate
//! representation ready for an (out-of-scope) emitter to print as source.
//!
//! [`driver::build`] runs the full pipeline — reachability, monomorphization, type layout, and
//! instruction lowering, in that order — and hands back a finished [`module::Module`].

pub mod clr_stub;
pub mod config;
pub mod disambiguate;
pub mod driver;
pub mod error;
pub mod generic_resolve;
pub mod generics;
pub mod icall;
pub mod lower;
pub mod module;
pub mod name_mapper;
pub mod reachability;
pub mod reader_model;
pub mod record_synth;
pub mod type_builder;

pub use config::{BuildConfig, BuildMode};
pub use driver::build;
pub use error::BuildError;
pub use module::Module;
pub use reachability::EntryPoint;
pub use reader_model::AssemblySet;
