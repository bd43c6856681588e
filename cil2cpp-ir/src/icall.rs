//! Icall Registry (§2, §4.4 point 3): maps BCL method references to runtime C++ function
//! symbols. Three lookup tiers, checked in order: exact (declaring type + name + parameter
//! types), arity wildcard (declaring type + name + arity, any parameter types), and
//! type-dispatched (declaring type + name, regardless of arity — covers `internalcall`
//! overload sets that all forward to one runtime entry point).
//!
//! Grounded on the teacher's `structured::resolver::DefaultAssemblyResolver`, which performs the
//! same exact-then-broader-match fallback shape over assembly names instead of method names.

use fxhash::FxHashMap;

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct ExactKey {
	declaring_type: String,
	name: String,
	parameter_types: Vec<String>,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct ArityKey {
	declaring_type: String,
	name: String,
	arity: usize,
}

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct TypeDispatchedKey {
	declaring_type: String,
	name: String,
}

/// Registry of BCL-method → runtime-symbol mappings. Populated once at Driver startup (§5: not a
/// shared/mutable resource during the pipeline, unlike the name-mapper's value-type set) and
/// consulted read-only from then on.
#[derive(Debug, Default)]
pub struct IcallRegistry {
	exact: FxHashMap<ExactKey, String>,
	by_arity: FxHashMap<ArityKey, String>,
	by_type: FxHashMap<TypeDispatchedKey, String>,
}

impl IcallRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn register_exact(&mut self, declaring_type: impl Into<String>, name: impl Into<String>, parameter_types: Vec<String>, symbol: impl Into<String>) {
		self.exact.insert(ExactKey { declaring_type: declaring_type.into(), name: name.into(), parameter_types }, symbol.into());
	}

	pub fn register_by_arity(&mut self, declaring_type: impl Into<String>, name: impl Into<String>, arity: usize, symbol: impl Into<String>) {
		self.by_arity.insert(ArityKey { declaring_type: declaring_type.into(), name: name.into(), arity }, symbol.into());
	}

	pub fn register_by_type(&mut self, declaring_type: impl Into<String>, name: impl Into<String>, symbol: impl Into<String>) {
		self.by_type.insert(TypeDispatchedKey { declaring_type: declaring_type.into(), name: name.into() }, symbol.into());
	}

	/// Looks up a call site's runtime symbol, trying the exact tier first, then arity, then
	/// type-dispatched. Returns `None` when no icall mapping applies — the caller falls through
	/// to ordinary name mangling (§4.4 point 3).
	pub fn lookup(&self, declaring_type: &str, name: &str, parameter_types: &[String]) -> Option<&str> {
		if let Some(sym) = self.exact.get(&ExactKey { declaring_type: declaring_type.to_string(), name: name.to_string(), parameter_types: parameter_types.to_vec() }) {
			return Some(sym);
		}
		if let Some(sym) = self.by_arity.get(&ArityKey { declaring_type: declaring_type.to_string(), name: name.to_string(), arity: parameter_types.len() }) {
			return Some(sym);
		}
		self.by_type.get(&TypeDispatchedKey { declaring_type: declaring_type.to_string(), name: name.to_string() }).map(|s| s.as_str())
	}

	pub fn has_mapping(&self, declaring_type: &str, name: &str, parameter_types: &[String]) -> bool {
		self.lookup(declaring_type, name, parameter_types).is_some()
	}
}

/// A small built-in seed set covering common runtime-provided entry points. Front ends are
/// expected to extend this with whatever their runtime library actually ships; the Driver only
/// guarantees these are present so that core lowering tests don't need a full BCL icall table.
pub fn default_registry() -> IcallRegistry {
	let mut reg = IcallRegistry::new();

	reg.register_exact("System.String", "get_Length", vec![], "rt::string_length");
	reg.register_exact("System.Array", "get_Length", vec![], "rt::array_length");
	reg.register_exact("System.Object", "GetType", vec![], "rt::object_get_type");
	reg.register_exact("System.Object", "MemberwiseClone", vec![], "rt::object_memberwise_clone");

	reg.register_by_type("System.GC", "Collect", "rt::gc_collect");
	reg.register_by_type("System.GC", "SuppressFinalize", "rt::gc_suppress_finalize");
	reg.register_by_type("System.Threading.Monitor", "Enter", "rt::monitor_enter");
	reg.register_by_type("System.Threading.Monitor", "Exit", "rt::monitor_exit");

	reg.register_by_arity("System.Math", "Max", 2, "rt::math_max");
	reg.register_by_arity("System.Math", "Min", 2, "rt::math_min");
	reg.register_by_arity("System.Math", "Abs", 1, "rt::math_abs");

	reg
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exact_tier_wins_over_broader_tiers() {
		let mut reg = IcallRegistry::new();
		reg.register_by_arity("T", "M", 1, "rt::by_arity");
		reg.register_exact("T", "M", vec!["System.Int32".into()], "rt::exact");
		assert_eq!(reg.lookup("T", "M", &["System.Int32".into()]), Some("rt::exact"));
	}

	#[test]
	fn arity_tier_falls_back_when_no_exact_match() {
		let mut reg = IcallRegistry::new();
		reg.register_by_arity("T", "M", 1, "rt::by_arity");
		assert_eq!(reg.lookup("T", "M", &["System.String".into()]), Some("rt::by_arity"));
	}

	#[test]
	fn type_dispatched_tier_ignores_arity() {
		let mut reg = IcallRegistry::new();
		reg.register_by_type("T", "M", "rt::by_type");
		assert_eq!(reg.lookup("T", "M", &["A".into(), "B".into()]), Some("rt::by_type"));
	}

	#[test]
	fn unmapped_call_returns_none() {
		let reg = default_registry();
		assert!(reg.lookup("My.Custom.Type", "DoStuff", &[]).is_none());
	}
}
