//! Overload Disambiguation (§4.5). After mangling, C# overloads can collide — most commonly when
//! distinct enum types collapse onto the same C++ alias. Before bodies are lowered, every method
//! name that occurs more than once on a type gets a parameter-derived suffix, recorded in the
//! module-wide disambiguation map call-site lowering consults after basic mangling.

use fxhash::FxHashMap;

use crate::module::Module;
use crate::name_mapper::mangle_type_name;

/// Walks every type's method list and assigns disambiguating suffixes to name collisions,
/// populating `module.disambiguation` keyed by `"base-mangled-name|IL-param-signature"` (§4.5).
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn disambiguate_overloads(module: &mut Module) {
	for ty in module.types.clone() {
		let mut name_counts: FxHashMap<&str, u32> = FxHashMap::default();
		for method in ty.methods.get() {
			*name_counts.entry(method.cpp_name.get()).or_default() += 1;
		}

		for (base_name, count) in name_counts {
			if count <= 1 {
				continue;
			}
			for method in ty.methods.get().iter().filter(|m| m.cpp_name.get() == base_name) {
				let il_signature = method.parameter_types().collect::<Vec<_>>().join(",");
				let key = format!("{base_name}|{il_signature}");
				if module.disambiguation.contains_key(&key) {
					continue;
				}
				let suffix: String = method.parameter_types().map(|p| mangle_type_name(p)).collect::<Vec<_>>().join("_");
				let disambiguated = if suffix.is_empty() { base_name.to_string() } else { format!("{base_name}__{suffix}") };
				module.disambiguation.insert(key, disambiguated.clone());
				method.cpp_name.set(module.bump.alloc_str(&disambiguated));
			}
		}
	}
}

/// Looks up a call-site's final, possibly-disambiguated name. Falls back to the bare mangled
/// name when no collision was ever recorded for this signature.
pub fn resolve_call_site_name<'a>(module: &'a Module, base_mangled_name: &str, il_param_signature: &str) -> &'a str {
	let key = format!("{base_mangled_name}|{il_param_signature}");
	module.disambiguation.get(&key).map(String::as_str).unwrap_or(base_mangled_name)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::module::{Method, MethodIrFlags, Type, TypeIrFlags};
	use bumpalo::Bump;
	use std::cell::Cell;

	fn leaf_type<'l>(bump: &'l Bump, name: &'static str) -> &'l Type<'l> {
		bump.alloc(Type {
			il_full_name: name,
			namespace: "",
			name,
			cpp_name: Cell::new(name),
			flags: Cell::new(TypeIrFlags::empty()),
			base_type: Cell::new(None),
			interfaces: Cell::new(&[]),
			fields: Cell::new(&[]),
			static_fields: Cell::new(&[]),
			methods: Cell::new(&[]),
			vtable: Cell::new(&[]),
			interface_impls: Cell::new(&[]),
			finalizer: Cell::new(None),
			explicit_size: Cell::new(None),
			instance_size: Cell::new(16),
			enum_underlying_type: Cell::new(None),
			generic_type_args: &[],
			generic_variance: &[],
		})
	}

	fn leaf_method<'l>(bump: &'l Bump, declaring_type: &'l Type<'l>, name: &'static str, cpp_name: &'static str, param_types: &[&'static str]) -> &'l Method<'l> {
		let parameters: Vec<_> = param_types
			.iter()
			.enumerate()
			.map(|(i, t)| crate::module::Parameter { index: i as u32, cpp_name: "p", il_type_name: t, cpp_type: "int" })
			.collect();
		bump.alloc(Method {
			name,
			cpp_name: Cell::new(cpp_name),
			declaring_type,
			return_type_cpp: Cell::new("void"),
			flags: Cell::new(MethodIrFlags::empty()),
			parameters: bump.alloc_slice_copy(&parameters),
			locals: Cell::new(&[]),
			basic_blocks: Cell::new(&[]),
			vtable_slot: Cell::new(-1),
			explicit_overrides: &[],
			temp_var_types: Cell::new(&[]),
			generic_method_args: &[],
		})
	}

	#[test]
	fn colliding_overloads_receive_distinct_suffixes() {
		let bump = Bump::new();
		let mut module = Module::new(&bump);
		let ty = leaf_type(&bump, "App.Printer");
		let m1 = leaf_method(&bump, ty, "Print", "Print", &["App.Weekday"]);
		let m2 = leaf_method(&bump, ty, "Print", "Print", &["App.Color"]);
		ty.methods.set(bump.alloc_slice_copy(&[m1, m2]));
		module.types.push(ty);

		disambiguate_overloads(&mut module);

		assert_ne!(m1.cpp_name.get(), m2.cpp_name.get());
		assert!(m1.cpp_name.get().starts_with("Print__"));
	}

	#[test]
	fn unique_name_is_left_untouched() {
		let bump = Bump::new();
		let mut module = Module::new(&bump);
		let ty = leaf_type(&bump, "App.Printer");
		let m1 = leaf_method(&bump, ty, "Print", "Print", &["App.Weekday"]);
		ty.methods.set(bump.alloc_slice_copy(&[m1]));
		module.types.push(ty);

		disambiguate_overloads(&mut module);
		assert_eq!(m1.cpp_name.get(), "Print");
	}
}
