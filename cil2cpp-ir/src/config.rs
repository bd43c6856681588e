//! The core's only externally supplied knob (§6, §2a): everything else — CLI parsing, config
//! file loading, environment variables — belongs to the (external) CLI front end.

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum BuildMode {
	#[default]
	Debug,
	Release,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct BuildConfig {
	pub mode: BuildMode,
}

impl BuildConfig {
	pub fn debug() -> Self {
		Self { mode: BuildMode::Debug }
	}

	pub fn release() -> Self {
		Self { mode: BuildMode::Release }
	}

	pub fn is_release(&self) -> bool {
		self.mode == BuildMode::Release
	}
}
