//! Error taxonomy (§7). Everywhere except this type, failures are `Option`-shaped and silently
//! swallowed, per the propagation policy: the Builder never raises exceptions/panics for
//! incomplete metadata, only for a handful of truly unrecoverable driver-setup conditions.

use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum BuildError {
	/// Neither an explicit entry point was found nor was library mode requested.
	EntryPointNotFound { method_name: String },
	/// The requested root assembly isn't present in the supplied `AssemblySet`.
	RootAssemblyMissing { assembly_name: String },
	IoError(std::io::Error),
}

impl Display for BuildError {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		match self {
			BuildError::EntryPointNotFound { method_name } => write!(f, "entry point method not found: {method_name}"),
			BuildError::RootAssemblyMissing { assembly_name } => write!(f, "root assembly not loaded: {assembly_name}"),
			BuildError::IoError(e) => write!(f, "io error: {e}"),
		}
	}
}

impl std::error::Error for BuildError {}

impl From<std::io::Error> for BuildError {
	fn from(value: std::io::Error) -> Self {
		Self::IoError(value)
	}
}
