//! Type Builder (§4.3): produces a complete physical and virtual layout for every `Type` —
//! field offsets with alignment, class/interface vtables, interface-dispatch tables, and the
//! external-enum pointer-level fixup.
//!
//! Grounded on the teacher's `structured::types::{load_type_defs, populate_type_defs}` two-phase
//! shell/backfill shape: shells are allocated first (so cyclic base/derived references can be
//! taken by pointer), then every mutable `Cell` field is backfilled once its dependencies exist.

use std::cell::Cell;

use bumpalo::Bump;
use fxhash::{FxHashMap, FxHashSet};

use crate::module::{Field, FieldIrFlags, InterfaceImpl, Method, Module, Type, TypeIrFlags, VTableEntry, Variance};
use crate::name_mapper::{self, Primitive, ValueTypeRegistry};
use crate::reader_model::{AssemblySet, FieldFlags, RawType, TypeFlags};

const OBJECT_HEADER_SIZE: u32 = 16;

fn align_up(offset: u32, align: u32) -> u32 {
	let align = align.max(1);
	(offset + align - 1) / align * align
}

fn field_size_bytes(type_name: &str) -> u32 {
	name_mapper::Primitive::from_il_name(type_name).and_then(Primitive::size_class).map(|c| c.bytes()).unwrap_or(8)
}

/// Allocates an empty shell for every reachable type (Pass 1). Cross-references (`base_type`,
/// `interfaces`, etc.) are left at their default empty/`None` state until [`populate_details`].
pub fn create_shell<'l>(bump: &'l Bump, raw: &RawType) -> &'l Type<'l> {
	let mut flags = TypeIrFlags::empty();
	if raw.flags.contains(TypeFlags::IS_VALUE_TYPE) {
		flags |= TypeIrFlags::IS_VALUE_TYPE;
	}
	if raw.flags.contains(TypeFlags::IS_INTERFACE) {
		flags |= TypeIrFlags::IS_INTERFACE;
	}
	if raw.flags.contains(TypeFlags::IS_ABSTRACT) {
		flags |= TypeIrFlags::IS_ABSTRACT;
	}
	if raw.flags.contains(TypeFlags::IS_SEALED) {
		flags |= TypeIrFlags::IS_SEALED;
	}
	if raw.flags.contains(TypeFlags::IS_ENUM) {
		flags |= TypeIrFlags::IS_ENUM;
	}
	if raw.flags.contains(TypeFlags::IS_DELEGATE) {
		flags |= TypeIrFlags::IS_DELEGATE;
	}
	if raw.flags.contains(TypeFlags::IS_RECORD) {
		flags |= TypeIrFlags::IS_RECORD;
	}
	if Primitive::from_il_name(&raw.full_name).is_some() {
		flags |= TypeIrFlags::IS_PRIMITIVE;
	}
	if raw.methods.iter().any(|m| m.name == ".cctor") {
		flags |= TypeIrFlags::HAS_CCTOR;
	}

	let il_full_name = bump.alloc_str(&raw.full_name);
	let cpp_name = bump.alloc_str(&name_mapper::mangle_type_name(&raw.full_name));

	bump.alloc(Type {
		il_full_name,
		namespace: bump.alloc_str(&raw.namespace),
		name: bump.alloc_str(&raw.name),
		cpp_name: Cell::new(cpp_name),
		flags: Cell::new(flags),
		base_type: Cell::new(None),
		interfaces: Cell::new(&[]),
		fields: Cell::new(&[]),
		static_fields: Cell::new(&[]),
		methods: Cell::new(&[]),
		vtable: Cell::new(&[]),
		interface_impls: Cell::new(&[]),
		finalizer: Cell::new(None),
		explicit_size: Cell::new(raw.explicit_size),
		instance_size: Cell::new(0),
		enum_underlying_type: Cell::new(raw.enum_underlying_type.as_deref().map(|s| bump.alloc_str(s) as &str)),
		generic_type_args: bump.alloc_slice_fill_iter(raw.generic_instantiation.iter().flat_map(|(_, args)| args.iter()).map(|a| bump.alloc_str(a) as &str)),
		generic_variance: &[],
	})
}

/// Backfills base type, interfaces, and field layout for a shell (Pass 2). Must run in
/// base-first order — callers should topologically sort by `raw.base_type` before calling this,
/// the same guarantee the vtable pass depends on.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn populate_details<'l>(bump: &'l Bump, ty: &'l Type<'l>, raw: &RawType, module: &Module<'l>, value_types: &ValueTypeRegistry) {
	let base = raw.base_type.as_deref().and_then(|b| module.find_type(b));
	ty.base_type.set(base);

	let interfaces: Vec<&Type> = raw.interfaces.iter().filter_map(|i| module.find_type(i)).collect();
	ty.interfaces.set(bump.alloc_slice_copy(&interfaces));

	if ty.is_value_type() {
		value_types.register(raw.full_name.clone());
		value_types.register(ty.cpp_name.get().to_string());
	}

	let mut running_size = match base {
		Some(b) => b.instance_size.get(),
		None if ty.is_value_type() || ty.is_interface() => 0,
		None => OBJECT_HEADER_SIZE,
	};

	let mut instance_fields = Vec::new();
	let mut static_fields = Vec::new();
	for raw_field in &raw.fields {
		let size = field_size_bytes(&raw_field.type_name);
		let type_ref = module.find_type(&raw_field.type_name);
		let mut flags = FieldIrFlags::empty();
		if raw_field.flags.contains(FieldFlags::IS_STATIC) {
			flags |= FieldIrFlags::IS_STATIC;
		}
		if raw_field.flags.contains(FieldFlags::IS_PUBLIC) {
			flags |= FieldIrFlags::IS_PUBLIC;
		}

		let constant_value = raw_field.constant_value.map(|c| match c {
			crate::reader_model::ConstantValue::I32(v) => crate::module::ConstantValue::I32(v),
			crate::reader_model::ConstantValue::I64(v) => crate::module::ConstantValue::I64(v),
			crate::reader_model::ConstantValue::F64(v) => crate::module::ConstantValue::F64(v),
			crate::reader_model::ConstantValue::Bool(v) => crate::module::ConstantValue::Bool(v),
		});

		if raw_field.flags.contains(FieldFlags::IS_STATIC) {
			static_fields.push(Field {
				name: bump.alloc_str(&raw_field.name),
				cpp_name: bump.alloc_str(&format!("s_{}", raw_field.name)),
				type_name: bump.alloc_str(&raw_field.type_name),
				type_ref,
				flags,
				constant_value,
				offset: 0,
				declaring_type: ty,
			});
			continue;
		}

		running_size = align_up(running_size, size.min(8));
		let offset = running_size;
		running_size += size;

		instance_fields.push(Field {
			name: bump.alloc_str(&raw_field.name),
			cpp_name: bump.alloc_str(&format!("f_{}", raw_field.name)),
			type_name: bump.alloc_str(&raw_field.type_name),
			type_ref,
			flags,
			constant_value,
			offset,
			declaring_type: ty,
		});
	}

	if let Some(explicit) = ty.explicit_size.get() {
		running_size = running_size.max(explicit);
	}
	running_size = align_up(running_size, 8);

	ty.fields.set(bump.alloc_slice_copy(&instance_fields));
	ty.static_fields.set(bump.alloc_slice_copy(&static_fields));
	ty.instance_size.set(running_size);
}

/// Builds the class vtable recursively, base-first (§4.3 "VTable construction"). `built` tracks
/// which types already have a finished vtable so the recursive base-first guarantee holds even
/// when called out of order.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn build_vtable<'l>(bump: &'l Bump, ty: &'l Type<'l>, built: &mut FxHashSet<*const Type<'l>>) {
	if built.contains(&(ty as *const Type<'l>)) {
		return;
	}

	let mut entries: Vec<VTableEntry<'l>> = match ty.base_type.get() {
		Some(base) => {
			build_vtable(bump, base, built);
			base.vtable.get().to_vec()
		}
		None if !ty.is_interface() && !ty.is_value_type() => {
			vec![
				VTableEntry { slot: 0, method_name: "ToString", target: None, declaring_type: ty },
				VTableEntry { slot: 1, method_name: "Equals", target: None, declaring_type: ty },
				VTableEntry { slot: 2, method_name: "GetHashCode", target: None, declaring_type: ty },
			]
		}
		None => Vec::new(),
	};

	for method in ty.methods.get().iter().filter(|m| m.is_virtual()) {
		let param_types: Vec<_> = method.parameter_types().collect();
		let is_new_slot = method.flags.get().contains(crate::module::MethodIrFlags::IS_NEW_SLOT);
		if is_new_slot {
			let slot = entries.len() as u32;
			method.vtable_slot.set(slot as i32);
			entries.push(VTableEntry { slot, method_name: method.name, target: Some(method), declaring_type: ty });
			continue;
		}

		let hit = entries.iter().rposition(|e| e.method_name == method.name && {
			e.target.map(|t| t.parameter_types().collect::<Vec<_>>() == param_types).unwrap_or(true)
		});
		match hit {
			Some(idx) => {
				entries[idx].target = Some(method);
				entries[idx].declaring_type = ty;
				method.vtable_slot.set(entries[idx].slot as i32);
			}
			None => {
				let slot = entries.len() as u32;
				method.vtable_slot.set(slot as i32);
				entries.push(VTableEntry { slot, method_name: method.name, target: Some(method), declaring_type: ty });
			}
		}
	}

	ty.vtable.set(bump.alloc_slice_copy(&entries));
	built.insert(ty as *const Type<'l>);
}

/// Builds interface-dispatch tables (§4.3 "Interface implementation tables").
pub fn build_interface_impls<'l>(bump: &'l Bump, ty: &'l Type<'l>) {
	let impls: Vec<InterfaceImpl<'l>> = ty
		.interfaces
		.get()
		.iter()
		.map(|iface| {
			let iface_methods: Vec<_> = iface.methods.get().iter().filter(|m| !m.flags.get().contains(crate::module::MethodIrFlags::IS_CONSTRUCTOR)).collect();
			let slots: Vec<Option<&Method<'l>>> = iface_methods
				.iter()
				.map(|im| resolve_interface_slot(ty, iface, im))
				.collect();
			InterfaceImpl { interface_type: iface, slots: bump.alloc_slice_copy(&slots) }
		})
		.collect();
	ty.interface_impls.set(bump.alloc_slice_copy(&impls));
}

fn resolve_interface_slot<'l>(ty: &'l Type<'l>, iface: &'l Type<'l>, iface_method: &&'l Method<'l>) -> Option<&'l Method<'l>> {
	let param_types: Vec<_> = iface_method.parameter_types().collect();

	for t in ty.base_chain() {
		if let Some(m) = t.methods.get().iter().find(|m| {
			m.explicit_overrides.iter().any(|o| o.interface_il_name == iface.il_full_name && o.method_name == iface_method.name)
		}) {
			return Some(m);
		}
	}

	for t in ty.base_chain() {
		if let Some(m) = t.methods.get().iter().find(|m| m.name == iface_method.name && m.parameter_types().collect::<Vec<_>>() == param_types) {
			return Some(m);
		}
	}

	if !iface_method.flags.get().contains(crate::module::MethodIrFlags::IS_ABSTRACT) {
		return Some(*iface_method);
	}

	None
}

/// External enum fixup (§4.3): discovers enum types referenced only by mangled name (not yet
/// known to the module), records their underlying integer type, and registers them as value
/// types. Our `Parameter`/`Local`/`Field` C++-type strings are plain (not `Cell`-backed), so
/// rather than mutating already-built signatures in place, callers are expected to consult
/// [`ExternalEnumFixup::is_known_enum`] *before* allocating a parameter/local/field's C++ type —
/// this produces the same final output as the spec's re-entrant strip-one-trailing-star pass
/// without needing interior mutability on every signature string (see DESIGN.md).
#[derive(Debug, Default)]
pub struct ExternalEnumFixup {
	discovered: FxHashMap<String, String>,
}

impl ExternalEnumFixup {
	pub fn new() -> Self {
		Self::default()
	}

	/// Scans `candidate_names` (mangled type names pulled from signatures/locals/fields not yet
	/// present in `module`) against `assemblies`' full metadata, registering any that resolve to
	/// an enum definition.
	pub fn discover<'l>(&mut self, assemblies: &AssemblySet, module: &Module<'l>, value_types: &ValueTypeRegistry, candidate_names: impl Iterator<Item = String>) {
		for name in candidate_names {
			if module.find_type(&name).is_some() || self.discovered.contains_key(&name) {
				continue;
			}
			let Some(raw) = assemblies.find_type(&name) else { continue };
			if !raw.flags.contains(TypeFlags::IS_ENUM) {
				continue;
			}
			let underlying = raw.enum_underlying_type.clone().unwrap_or_else(|| "System.Int32".to_string());
			self.discovered.insert(name.clone(), underlying);
			value_types.register(name);
		}
	}

	pub fn is_known_enum(&self, name: &str) -> bool {
		self.discovered.contains_key(name)
	}

	pub fn underlying_type(&self, name: &str) -> Option<&str> {
		self.discovered.get(name).map(String::as_str)
	}

	/// Strips exactly one trailing `*` if `il_type_name` is a discovered external enum — the
	/// lowerer otherwise treats every non-primitive type as a reference type.
	pub fn fixup_cpp_type(&self, il_type_name: &str, cpp_type: &str) -> String {
		if self.is_known_enum(il_type_name) {
			cpp_type.strip_suffix('*').unwrap_or(cpp_type).to_string()
		} else {
			cpp_type.to_string()
		}
	}

	pub fn into_module_map(self) -> FxHashMap<String, String> {
		self.discovered
	}
}

/// Shared IL→C++ type spelling for a parameter/local/field/return type built outside of a method
/// body (the Instruction Lowerer carries its own copy, `LowerCtx::cpp_type_for_il`, scoped to a
/// single call's `LowerParams` instead of the ambient registries the Driver holds for all of
/// Pass 3/3.5 method-shell construction).
pub fn cpp_type_for_il(il_name: &str, value_types: &ValueTypeRegistry, enum_fixup: &ExternalEnumFixup) -> String {
	let base = if let Some(prim) = Primitive::from_il_name(il_name) {
		prim.cpp_name().to_string()
	} else if value_types.contains(il_name) {
		name_mapper::mangle_type_name(il_name)
	} else {
		format!("{}*", name_mapper::mangle_type_name(il_name))
	};
	enum_fixup.fixup_cpp_type(il_name, &base)
}

/// `Variance` from bool flags the reader might hand back (covariant/contravariant), used when
/// building `Type::generic_variance` for a generic type definition's own parameters.
pub fn variance_from_flags(is_covariant: bool, is_contravariant: bool) -> Variance {
	match (is_covariant, is_contravariant) {
		(true, false) => Variance::Covariant,
		(false, true) => Variance::Contravariant,
		_ => Variance::Invariant,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reader_model::AssemblyClass;

	fn make_module<'l>(bump: &'l Bump) -> Module<'l> {
		Module::new(bump)
	}

	#[test]
	fn field_layout_aligns_and_advances() {
		let bump = Bump::new();
		let mut module = make_module(&bump);
		let object_raw = RawType::new("System.Object", "System", "Object", TypeFlags::IS_PUBLIC);
		let object_shell = create_shell(&bump, &object_raw);
		module.types.push(object_shell);
		let value_types = ValueTypeRegistry::default();
		populate_details(&bump, object_shell, &object_raw, &module, &value_types);
		assert_eq!(object_shell.instance_size.get(), OBJECT_HEADER_SIZE);

		let mut point = RawType::new("Point", "", "Point", TypeFlags::IS_PUBLIC);
		point.base_type = Some("System.Object".into());
		point.fields.push(crate::reader_model::RawField { name: "X".into(), type_name: "System.Int32".into(), flags: FieldFlags::IS_PUBLIC, constant_value: None });
		point.fields.push(crate::reader_model::RawField { name: "Y".into(), type_name: "System.Int64".into(), flags: FieldFlags::IS_PUBLIC, constant_value: None });
		let point_shell = create_shell(&bump, &point);
		module.types.push(point_shell);
		populate_details(&bump, point_shell, &point, &module, &value_types);

		let fields = point_shell.fields.get();
		assert_eq!(fields[0].offset, 16);
		assert_eq!(fields[1].offset, 24);
		assert_eq!(point_shell.instance_size.get(), 32);
	}

	#[test]
	fn object_vtable_seeds_three_known_slots() {
		let bump = Bump::new();
		let module = make_module(&bump);
		let object_raw = RawType::new("System.Object", "System", "Object", TypeFlags::IS_PUBLIC);
		let object_shell = create_shell(&bump, &object_raw);
		let mut built = FxHashSet::default();
		build_vtable(&bump, object_shell, &mut built);
		let vtable = object_shell.vtable.get();
		assert_eq!(vtable.len(), 3);
		assert_eq!(vtable[0].method_name, "ToString");
		assert_eq!(vtable[1].method_name, "Equals");
		assert_eq!(vtable[2].method_name, "GetHashCode");
		let _ = module;
	}

	#[test]
	fn external_enum_fixup_strips_trailing_star() {
		let mut set = AssemblySet::new("App");
		let mut app = crate::reader_model::RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };
		let mut day = RawType::new("App.Day", "App", "Day", TypeFlags::IS_PUBLIC | TypeFlags::IS_ENUM);
		day.enum_underlying_type = Some("System.Int32".into());
		app.types.push(day);
		set.add_assembly(app);

		let bump = Bump::new();
		let module = make_module(&bump);
		let value_types = ValueTypeRegistry::default();
		let mut fixup = ExternalEnumFixup::new();
		fixup.discover(&set, &module, &value_types, std::iter::once("App.Day".to_string()));

		assert!(fixup.is_known_enum("App.Day"));
		assert_eq!(fixup.fixup_cpp_type("App.Day", "App_Day*"), "App_Day");
		assert!(value_types.contains("App.Day"));
	}
}
