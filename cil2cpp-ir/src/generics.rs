//! Generic Monomorphization Engine (§4.2): scans reachable methods for closed generic
//! instantiations, filters out intrinsic/interop/reflection/diagnostics/security/internal
//! specializations, and resolves the substitution semantics the Type Builder and Instruction
//! Lowerer need to materialize closed shapes.
//!
//! Grounded on the teacher's `schema::type::TypePool`, which interns derived/instantiated type
//! forms (pointer/reference/array/generic-instantiation caches) the same way this module interns
//! instantiation keys — just over IL name strings instead of a `Bump`-backed `TypeId` graph.

use fxhash::{FxHashMap, FxHashSet};

use crate::name_mapper::mangle_generic_instantiation;
use crate::reachability::ReachabilityResult;
use crate::reader_model::{AssemblySet, Operand, RawOpCode};

const FILTERED_NAMESPACE_PREFIXES: &[&str] =
	&["System.Runtime.Intrinsics", "System.Runtime.InteropServices", "System.Reflection", "System.Diagnostics", "System.Security", "Internal"];

/// Bare (unqualified) type names treated as CLR-internal or otherwise unsuitable generic
/// arguments, named directly in §4.2's filter rules.
const FILTERED_GENERIC_ARG_TYPES: &[&str] =
	&["QCallTypeHandle", "RuntimeType", "RuntimeTypeHandle", "RuntimeMethodHandle", "RuntimeFieldHandle", "TimeZoneInfo", "RegistryKey"];

const VECTOR_SCALAR_FALLBACK_NAMES: &[&str] = &[
	"System.Runtime.Intrinsics.Vector64`1",
	"System.Runtime.Intrinsics.Vector128`1",
	"System.Runtime.Intrinsics.Vector256`1",
	"System.Runtime.Intrinsics.Vector512`1",
];

fn namespace_of(full_name: &str) -> &str {
	match full_name.rfind('.') {
		Some(i) => &full_name[..i],
		None => "",
	}
}

fn outer_type(full_name: &str) -> &str {
	let cut = full_name.find(['/', '+']).unwrap_or(full_name.len());
	&full_name[..cut]
}

fn is_unresolved_generic_parameter(name: &str) -> bool {
	name.starts_with("!!") || (name.starts_with('!') && name[1..].chars().next().is_some_and(|c| c.is_ascii_digit()))
}

fn matches_filtered_namespace(full_name: &str) -> bool {
	if VECTOR_SCALAR_FALLBACK_NAMES.contains(&full_name) {
		return false;
	}
	let ns = namespace_of(full_name);
	FILTERED_NAMESPACE_PREFIXES.iter().any(|p| ns.starts_with(p))
}

fn is_filtered_arg_type(full_name: &str) -> bool {
	let outer = outer_type(full_name);
	let bare = outer.rsplit('.').next().unwrap_or(outer);
	FILTERED_GENERIC_ARG_TYPES.contains(&bare) || matches_filtered_namespace(outer)
}

/// Splits `"Open<Arg1,Arg2<Nested>>"` into `("Open", ["Arg1", "Arg2<Nested>"])`. Returns `None`
/// for a name with no generic-instantiation syntax.
pub fn parse_generic_instantiation(name: &str) -> Option<(String, Vec<String>)> {
	let open_idx = name.find('<')?;
	if !name.ends_with('>') {
		return None;
	}
	let open_name = name[..open_idx].to_string();
	let inner = &name[open_idx + 1..name.len() - 1];
	Some((open_name, split_top_level_commas(inner)))
}

fn split_top_level_commas(s: &str) -> Vec<String> {
	let mut depth = 0i32;
	let mut start = 0;
	let mut out = Vec::new();
	for (i, c) in s.char_indices() {
		match c {
			'<' => depth += 1,
			'>' => depth -= 1,
			',' if depth == 0 => {
				out.push(s[start..i].trim().to_string());
				start = i + 1;
			}
			_ => {}
		}
	}
	out.push(s[start..].trim().to_string());
	out
}

fn split_suffix(name: &str) -> (&str, &str) {
	for suffix in ["[]", "&", "*"] {
		if let Some(stripped) = name.strip_suffix(suffix) {
			return (stripped, suffix);
		}
	}
	(name, "")
}

/// A closed generic type instantiation accepted into the module (§4.2 Pass 0/1.5).
#[derive(Debug, Clone)]
pub struct TypeInstantiation {
	pub open_name: String,
	pub type_args: Vec<String>,
	pub key: String,
	pub mangled_name: String,
}

/// A closed generic method instantiation, keyed so that overloads sharing an open name but
/// differing in parameter types (`GetReference<T>(Span<T>)` vs `(ReadOnlySpan<T>)`) stay distinct.
#[derive(Debug, Clone)]
pub struct MethodInstantiation {
	pub declaring_type: String,
	pub method_name: String,
	pub method_type_args: Vec<String>,
	pub parameter_types: Vec<String>,
	pub key: String,
	pub mangled_name: String,
}

#[derive(Debug, Default)]
pub struct GenericEngine {
	pub type_instantiations: FxHashMap<String, TypeInstantiation>,
	pub method_instantiations: FxHashMap<String, MethodInstantiation>,
	seen_method_ref_keys: FxHashSet<String>,
}

impl GenericEngine {
	pub fn new() -> Self {
		Self::default()
	}

	/// Registers a closed generic type instantiation, recursively discovering nested
	/// instantiations inside its own argument list (§4.2 "Transitive discovery"). Returns the
	/// instantiation key on success, `None` if the filter rules rejected it.
	pub fn register_type_instantiation(&mut self, open_name: &str, type_args: &[String]) -> Option<String> {
		if type_args.iter().any(|a| is_unresolved_generic_parameter(a)) {
			return None;
		}
		if matches_filtered_namespace(open_name) {
			return None;
		}
		if type_args.iter().any(|a| matches_filtered_namespace(a) || is_filtered_arg_type(a)) {
			return None;
		}

		let key = mangle_generic_instantiation(open_name, &type_args.iter().map(String::as_str).collect::<Vec<_>>(), false);
		let mangled_name = mangle_generic_instantiation(open_name, &type_args.iter().map(String::as_str).collect::<Vec<_>>(), true);

		for arg in type_args {
			if let Some((nested_open, nested_args)) = parse_generic_instantiation(arg) {
				self.register_type_instantiation(&nested_open, &nested_args);
			}
		}

		self.type_instantiations.entry(key.clone()).or_insert_with(|| TypeInstantiation {
			open_name: open_name.to_string(),
			type_args: type_args.to_vec(),
			key: key.clone(),
			mangled_name,
		});
		Some(key)
	}

	/// Registers a closed generic method instantiation (§4.2 Pass 0, `GenericInstanceMethod`).
	pub fn register_method_instantiation(&mut self, declaring_type: &str, method_name: &str, method_type_args: &[String], parameter_types: &[String]) -> Option<String> {
		if method_type_args.iter().any(|a| is_unresolved_generic_parameter(a)) {
			return None;
		}
		if method_type_args.iter().any(|a| matches_filtered_namespace(a) || is_filtered_arg_type(a)) {
			return None;
		}

		let args_key = method_type_args.join(",");
		let params_key = parameter_types.join(",");
		let key = format!("{declaring_type}::{method_name}<{args_key}>({params_key})");
		if !self.seen_method_ref_keys.insert(key.clone()) {
			return Some(key);
		}

		for arg in method_type_args {
			if let Some((nested_open, nested_args)) = parse_generic_instantiation(arg) {
				self.register_type_instantiation(&nested_open, &nested_args);
			}
		}

		let mangled_name = format!(
			"{}_{}",
			crate::name_mapper::mangle_type_name(&format!("{declaring_type}.{method_name}")),
			method_type_args.iter().map(|a| crate::name_mapper::mangle_type_name(a)).collect::<Vec<_>>().join("_")
		);

		self.method_instantiations.entry(key.clone()).or_insert_with(|| MethodInstantiation {
			declaring_type: declaring_type.to_string(),
			method_name: method_name.to_string(),
			method_type_args: method_type_args.to_vec(),
			parameter_types: parameter_types.to_vec(),
			key: key.clone(),
			mangled_name,
		});
		Some(key)
	}

	/// Pass 0: scans every reachable method's signature, locals, and instruction operands for
	/// generic instantiations, registering each that survives the filter rules.
	#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
	pub fn scan_reachable(&mut self, assemblies: &AssemblySet, reachable: &ReachabilityResult) {
		for key in &reachable.reachable_methods {
			let Some(ty) = assemblies.find_type(&key.declaring_type) else { continue };
			let Some(method) = ty.methods.iter().find(|m| m.name == key.name && m.parameters.len() == key.arity) else { continue };

			if let Some((open, args)) = parse_generic_instantiation(&method.return_type) {
				self.register_type_instantiation(&open, &args);
			}
			for param in &method.parameters {
				if let Some((open, args)) = parse_generic_instantiation(&param.type_name) {
					self.register_type_instantiation(&open, &args);
				}
			}

			let Some(body) = &method.body else { continue };
			for local in &body.locals {
				if let Some((open, args)) = parse_generic_instantiation(&local.type_name) {
					self.register_type_instantiation(&open, &args);
				}
			}
			for instr in &body.instructions {
				match &instr.opcode {
					RawOpCode::Newarr | RawOpCode::Box | RawOpCode::Unbox | RawOpCode::UnboxAny | RawOpCode::Castclass | RawOpCode::Isinst | RawOpCode::Initobj | RawOpCode::Ldtoken | RawOpCode::Sizeof => {
						if let Operand::TypeRef(t) = &instr.operand {
							if let Some((open, args)) = parse_generic_instantiation(&t.il_name) {
								self.register_type_instantiation(&open, &args);
							}
						}
					}
					RawOpCode::Ldfld | RawOpCode::Ldflda | RawOpCode::Stfld | RawOpCode::Ldsfld | RawOpCode::Ldsflda | RawOpCode::Stsfld => {
						if let Operand::FieldRef(f) = &instr.operand {
							if let Some((open, args)) = parse_generic_instantiation(&f.declaring_type) {
								self.register_type_instantiation(&open, &args);
							}
						}
					}
					RawOpCode::Call | RawOpCode::Callvirt | RawOpCode::Calli | RawOpCode::Newobj | RawOpCode::Ldftn | RawOpCode::Ldvirtftn => {
						if let Operand::MethodRef(m) = &instr.operand {
							if !m.declaring_type_generic_args.is_empty() {
								self.register_type_instantiation(&m.declaring_type, &m.declaring_type_generic_args);
							} else if let Some((open, args)) = parse_generic_instantiation(&m.declaring_type) {
								self.register_type_instantiation(&open, &args);
							}
							if !m.method_generic_args.is_empty() {
								self.register_method_instantiation(&m.declaring_type, &m.method_name, &m.method_generic_args, &m.parameter_types);
							}
						}
					}
					_ => {}
				}
			}
		}
	}

	/// Nested-type expansion (§4.2): for every registered type instantiation, produce matching
	/// specializations of any nested type sharing the parent's generic-parameter count, run to
	/// fixpoint. `nested_type_names` supplies, for an open generic type, the IL names of its
	/// nested types that themselves close over the same type parameters.
	pub fn expand_nested_types(&mut self, nested_type_names: impl Fn(&str) -> Vec<String>) {
		loop {
			let snapshot: Vec<_> = self.type_instantiations.values().cloned().collect();
			let mut changed = false;
			for inst in &snapshot {
				for nested in nested_type_names(&inst.open_name) {
					let args = inst.type_args.clone();
					if self.register_type_instantiation(&nested, &args).is_some() {
						changed = true;
					}
				}
			}
			if !changed {
				break;
			}
		}
	}
}

/// Substitution semantics (§4.2): resolves a type reference that may mention generic parameters,
/// given the enclosing type's and (if applicable) method's parameter maps. Method-level
/// parameters are checked first, matching the spec's declared lookup order.
pub fn substitute_type_name(name: &str, type_params: &FxHashMap<String, String>, method_params: &FxHashMap<String, String>) -> String {
	let (core, suffix) = split_suffix(name);

	if let Some((open, args)) = parse_generic_instantiation(core) {
		let substituted_args: Vec<_> = args.iter().map(|a| substitute_type_name(a, type_params, method_params)).collect();
		return format!("{open}<{}>{suffix}", substituted_args.join(","));
	}

	if let Some(resolved) = method_params.get(core).or_else(|| type_params.get(core)) {
		return format!("{resolved}{suffix}");
	}

	format!("{core}{suffix}")
}

/// Validates a generic argument against a constraint (struct/class/new()/interface/base).
/// Violations are reported, never fatal (§7).
pub fn validate_constraint(type_arg: &str, constraint_description: &str, satisfied: bool) {
	if !satisfied {
		eprintln!("warning: generic argument `{type_arg}` does not satisfy constraint `{constraint_description}`");
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registers_simple_instantiation() {
		let mut engine = GenericEngine::new();
		let key = engine.register_type_instantiation("System.Collections.Generic.List`1", &["System.Int32".to_string()]).unwrap();
		assert!(engine.type_instantiations.contains_key(&key));
	}

	#[test]
	fn filters_intrinsics_namespace_unless_vector_scalar_fallback() {
		let mut engine = GenericEngine::new();
		assert!(engine.register_type_instantiation("System.Runtime.Intrinsics.VectorMath`1", &["System.Int32".to_string()]).is_none());
		assert!(engine.register_type_instantiation("System.Runtime.Intrinsics.Vector128`1", &["System.Single".to_string()]).is_some());
	}

	#[test]
	fn filters_clr_internal_generic_args() {
		let mut engine = GenericEngine::new();
		assert!(engine.register_type_instantiation("System.Collections.Generic.List`1", &["RuntimeType".to_string()]).is_none());
	}

	#[test]
	fn skips_unresolved_generic_parameters() {
		let mut engine = GenericEngine::new();
		assert!(engine.register_type_instantiation("System.Collections.Generic.List`1", &["!0".to_string()]).is_none());
	}

	#[test]
	fn nested_instantiation_is_discovered_transitively() {
		let mut engine = GenericEngine::new();
		engine.register_type_instantiation("Outer`1", &["Inner`1<System.Int32>".to_string()]);
		assert!(engine.type_instantiations.values().any(|i| i.open_name == "Inner`1"));
	}

	#[test]
	fn substitution_preserves_array_suffix() {
		let mut type_params = FxHashMap::default();
		type_params.insert("T".to_string(), "System.Int32".to_string());
		let method_params = FxHashMap::default();
		assert_eq!(substitute_type_name("T[]", &type_params, &method_params), "System.Int32[]");
	}

	#[test]
	fn substitution_recurses_into_generic_instantiation_args() {
		let mut type_params = FxHashMap::default();
		type_params.insert("T".to_string(), "System.String".to_string());
		let method_params = FxHashMap::default();
		assert_eq!(substitute_type_name("List`1<T>", &type_params, &method_params), "List`1<System.String>");
	}

	#[test]
	fn method_params_take_precedence_over_type_params() {
		let mut type_params = FxHashMap::default();
		type_params.insert("T".to_string(), "System.Int32".to_string());
		let mut method_params = FxHashMap::default();
		method_params.insert("T".to_string(), "System.String".to_string());
		assert_eq!(substitute_type_name("T", &type_params, &method_params), "System.String");
	}
}
