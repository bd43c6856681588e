//! Record-Member Synthesis (§4.4/§9, Pass 7). `record class`/`record struct` declarations carry
//! compiler-generated `ToString`, `GetHashCode`, `Equals`, `PrintMembers`, `<Clone>$`,
//! `op_Equality`, `op_Inequality`, and `get_EqualityContract` bodies whose exact shape is an
//! implementation detail of the C# compiler, not something worth reproducing faithfully. This
//! pass overwrites whatever body Pass 6 lowered for those members with one built directly from
//! the type's field list, so two identical record shapes always produce byte-identical output.
//!
//! The hash-combining step mirrors `fxhash`'s own mixer (rotate-left-5, xor, multiply by its
//! fixed odd constant) rather than inventing a new one — this crate already depends on `fxhash`
//! for every hot lookup table, so its mixing idiom is the natural fit for a hand-rolled combine.

use std::cell::Cell;

use bumpalo::Bump;

use crate::module::{BasicBlock, Instruction, InstructionKind, Method, Module, Type};

const FXHASH_SEED: u64 = 0x51_7c_c1_b7_27_22_0a_95;

fn field_expr(_ty: &Type, field_cpp_name: &str) -> String {
	format!("this->{field_cpp_name}")
}

fn find_method<'l>(ty: &'l Type<'l>, name: &str, arity: usize) -> Option<&'l Method<'l>> {
	ty.methods.get().iter().copied().find(|m| m.name == name && m.parameters.len() == arity)
}

fn set_single_block<'l>(bump: &'l Bump, method: &'l Method<'l>, instructions: Vec<Instruction<'l>>) {
	let block = BasicBlock { id: 0, instructions: Cell::new(bump.alloc_slice_copy(&instructions)) };
	method.basic_blocks.set(bump.alloc_slice_copy(&[block]));
	method.locals.set(&[]);
}

fn synth_get_hash_code<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let fields = ty.fields.get();
	let mut expr = format!("0x{FXHASH_SEED:x}ULL");
	for f in fields {
		let value = field_expr(ty, f.cpp_name);
		expr = format!("(rt::rotl64({expr}, 5) ^ (uint64_t){value}) * 0x{FXHASH_SEED:x}ULL");
	}
	let code = bump.alloc_str(&format!("(int32_t)({expr})"));
	let tmp = "__hash";
	let instrs = vec![
		Instruction { offset: 0, result_var: Some(bump.alloc_str(tmp)), result_type_cpp: Some("int32_t"), kind: InstructionKind::RawCpp { code } },
		Instruction { offset: 1, result_var: None, result_type_cpp: None, kind: InstructionKind::Return { value: Some(bump.alloc_str(tmp)) } },
	];
	set_single_block(bump, method, instrs);
}

fn synth_equals<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>, strongly_typed: bool) {
	let cpp_name = ty.cpp_name.get();
	let other = if strongly_typed { "other".to_string() } else { format!("(({cpp_name}*)other)") };
	let fields = ty.fields.get();
	let mut comparisons: Vec<String> = fields.iter().map(|f| format!("this->{} == {}->{}", f.cpp_name, other, f.cpp_name)).collect();
	if comparisons.is_empty() {
		comparisons.push("true".to_string());
	}
	let guard = if strongly_typed {
		format!("if (other == nullptr) return false;\nreturn {};", comparisons.join(" && "))
	} else {
		format!("auto* other = dynamic_cast<{cpp_name}*>(obj);\nif (other == nullptr) return false;\nreturn {};", comparisons.join(" && "))
	};
	let code = bump.alloc_str(&guard);
	let instrs = vec![Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } }];
	set_single_block(bump, method, instrs);
}

fn synth_op_equality<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let equals_name = find_method(ty, "Equals", 1).map(|m| m.cpp_name.get()).unwrap_or("Equals");
	let code = bump.alloc_str(&format!("return (a == nullptr) ? (b == nullptr) : {equals_name}(a, b);"));
	let instrs = vec![Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } }];
	set_single_block(bump, method, instrs);
}

fn synth_op_inequality<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let op_eq_name = find_method(ty, "op_Equality", 2).map(|m| m.cpp_name.get()).unwrap_or("op_Equality");
	let code = bump.alloc_str(&format!("return !{op_eq_name}(a, b);"));
	let instrs = vec![Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } }];
	set_single_block(bump, method, instrs);
}

fn synth_get_equality_contract<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let code = bump.alloc_str(&format!("return &{}_TypeInfo;", ty.cpp_name.get()));
	let instrs = vec![Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } }];
	set_single_block(bump, method, instrs);
}

fn synth_print_members<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let fields = ty.fields.get();
	let parts: Vec<String> = fields.iter().map(|f| format!("rt::append_member(sb, \"{}\", this->{})", f.name, f.cpp_name)).collect();
	let code = if parts.is_empty() { bump.alloc_str("return false;") } else { bump.alloc_str(&format!("{};\nreturn true;", parts.join(";\n"))) };
	let instrs = vec![Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } }];
	set_single_block(bump, method, instrs);
}

fn synth_to_string<'l>(bump: &'l Bump, _ty: &'l Type<'l>, method: &'l Method<'l>) {
	let tmp = "__str";
	let instrs = vec![
		Instruction { offset: 0, result_var: Some(bump.alloc_str(tmp)), result_type_cpp: Some("String*"), kind: InstructionKind::RawCpp { code: "rt::record_to_string(this)" } },
		Instruction { offset: 1, result_var: None, result_type_cpp: None, kind: InstructionKind::Return { value: Some(bump.alloc_str(tmp)) } },
	];
	set_single_block(bump, method, instrs);
}

fn synth_clone<'l>(bump: &'l Bump, ty: &'l Type<'l>, method: &'l Method<'l>) {
	let cpp_name = ty.cpp_name.get();
	let tmp = "__clone";
	let code = bump.alloc_str(&format!("auto* {tmp} = ({cpp_name}*)rt::gc_alloc(sizeof({cpp_name}));\n*{tmp} = *this;"));
	let instrs = vec![
		Instruction { offset: 0, result_var: None, result_type_cpp: None, kind: InstructionKind::RawCpp { code } },
		Instruction { offset: 1, result_var: None, result_type_cpp: None, kind: InstructionKind::Return { value: Some(bump.alloc_str(tmp)) } },
	];
	set_single_block(bump, method, instrs);
}

/// Overwrites every compiler-generated record member's body on every `record` type in `module`
/// (§4.4, Pass 7). A member whose shell wasn't created (unreachable, so never built in Pass 3) is
/// simply skipped — there is nothing to synthesize a body into.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn synthesize<'l>(bump: &'l Bump, module: &Module<'l>) {
	for ty in module.types.iter().copied().filter(|t| t.flags.get().contains(crate::module::TypeIrFlags::IS_RECORD)) {
		if let Some(m) = find_method(ty, "GetHashCode", 0) {
			synth_get_hash_code(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "Equals", 1) {
			let strongly_typed = m.parameters.first().map(|p| p.il_type_name == ty.il_full_name).unwrap_or(false);
			synth_equals(bump, ty, m, strongly_typed);
		}
		if let Some(m) = find_method(ty, "op_Equality", 2) {
			synth_op_equality(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "op_Inequality", 2) {
			synth_op_inequality(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "get_EqualityContract", 0) {
			synth_get_equality_contract(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "PrintMembers", 1) {
			synth_print_members(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "ToString", 0) {
			synth_to_string(bump, ty, m);
		}
		if let Some(m) = find_method(ty, "<Clone>$", 0) {
			synth_clone(bump, ty, m);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::module::{FieldIrFlags, MethodIrFlags, Parameter, TypeIrFlags};

	fn make_record_type<'l>(bump: &'l Bump) -> &'l Type<'l> {
		let ty = bump.alloc(Type {
			il_full_name: "App.Point",
			namespace: "App",
			name: "Point",
			cpp_name: Cell::new("App_Point"),
			flags: Cell::new(TypeIrFlags::IS_RECORD),
			base_type: Cell::new(None),
			interfaces: Cell::new(&[]),
			fields: Cell::new(&[]),
			static_fields: Cell::new(&[]),
			methods: Cell::new(&[]),
			vtable: Cell::new(&[]),
			interface_impls: Cell::new(&[]),
			finalizer: Cell::new(None),
			explicit_size: Cell::new(None),
			instance_size: Cell::new(24),
			enum_underlying_type: Cell::new(None),
			generic_type_args: &[],
			generic_variance: &[],
		});
		let field = crate::module::Field {
			name: "X",
			cpp_name: "f_X",
			type_name: "System.Int32",
			type_ref: None,
			flags: FieldIrFlags::IS_PUBLIC,
			constant_value: None,
			offset: 16,
			declaring_type: ty,
		};
		ty.fields.set(bump.alloc_slice_copy(&[field]));

		let hash_method = bump.alloc(Method {
			name: "GetHashCode",
			cpp_name: Cell::new("App_Point_GetHashCode"),
			declaring_type: ty,
			return_type_cpp: Cell::new("int32_t"),
			flags: Cell::new(MethodIrFlags::IS_VIRTUAL),
			parameters: &[],
			locals: Cell::new(&[]),
			basic_blocks: Cell::new(&[]),
			vtable_slot: Cell::new(-1),
			explicit_overrides: &[],
			temp_var_types: Cell::new(&[]),
			generic_method_args: &[],
		});
		let equals_params = bump.alloc_slice_copy(&[Parameter { index: 0, cpp_name: "p_other", il_type_name: "App.Point", cpp_type: "App_Point*" }]);
		let equals_method = bump.alloc(Method {
			name: "Equals",
			cpp_name: Cell::new("App_Point_Equals"),
			declaring_type: ty,
			return_type_cpp: Cell::new("bool"),
			flags: Cell::new(MethodIrFlags::empty()),
			parameters: equals_params,
			locals: Cell::new(&[]),
			basic_blocks: Cell::new(&[]),
			vtable_slot: Cell::new(-1),
			explicit_overrides: &[],
			temp_var_types: Cell::new(&[]),
			generic_method_args: &[],
		});
		ty.methods.set(bump.alloc_slice_copy(&[hash_method, equals_method]));
		ty
	}

	#[test]
	fn hash_code_body_combines_every_field() {
		let bump = Bump::new();
		let module = Module::new(&bump);
		let ty = make_record_type(&bump);
		let mut m = module;
		m.types.push(ty);
		synthesize(&bump, &m);

		let method = find_method(ty, "GetHashCode", 0).unwrap();
		let blocks = method.basic_blocks.get();
		assert_eq!(blocks.len(), 1);
		let InstructionKind::RawCpp { code } = blocks[0].instructions.get()[0].kind else { panic!("expected RawCpp") };
		assert!(code.contains("f_X"));
		assert!(code.contains("rotl64"));
	}

	#[test]
	fn strongly_typed_equals_skips_dynamic_cast() {
		let bump = Bump::new();
		let module = Module::new(&bump);
		let ty = make_record_type(&bump);
		let mut m = module;
		m.types.push(ty);
		synthesize(&bump, &m);

		let method = find_method(ty, "Equals", 1).unwrap();
		let InstructionKind::RawCpp { code } = method.basic_blocks.get()[0].instructions.get()[0].kind else { panic!("expected RawCpp") };
		assert!(!code.contains("dynamic_cast"));
		assert!(code.contains("f_X"));
	}
}
