//! CLR-Internal Stubbing (§4.6). Methods whose body references undocumented CLR-internal types,
//! or BCL compiler-generated display classes under reserved namespaces, cannot be faithfully
//! lowered. The Driver substitutes a single `Return` instruction for their body instead of
//! running them through the Instruction Lowerer.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::reader_model::{Operand, RawMethod, RawOpCode};

/// Fixed set of CLR-internal type names (bare, unqualified) that make a method body
/// unlowerable, named directly in §4.6.
const CLR_INTERNAL_TYPE_NAMES: &[&str] = &[
	"QCallTypeHandle",
	"QCallAssembly",
	"QCallModule",
	"RuntimeType",
	"RuntimeTypeHandle",
	"RuntimeMethodHandle",
	"RuntimeFieldHandle",
	"RuntimeAssembly",
	"RuntimeModule",
	"AggregateException",
	"Assembly",
	"MethodBase",
	"MethodInfo",
	"ParameterInfo",
];

/// Reserved namespace prefixes BCL compiler-generated display/closure classes live under.
/// Deliberately excludes `System.Runtime.CompilerServices.Unsafe` — calls into it are intercepted
/// inline by the Instruction Lowerer's intrinsic catalog (§4.4), not stubbed; a caller that merely
/// invokes an `Unsafe` method must still get a real lowered body.
const RESERVED_NAMESPACE_PREFIXES: &[&str] = &["<PrivateImplementationDetails>"];

fn mentions_clr_internal_type(name: &str) -> bool {
	let bare = name.rsplit(['.', '/', '+']).next().unwrap_or(name);
	CLR_INTERNAL_TYPE_NAMES.contains(&bare) || RESERVED_NAMESPACE_PREFIXES.iter().any(|p| name.starts_with(p))
}

/// True when `method`'s locals, parameters, return type, or any instruction operand references a
/// CLR-internal type — meaning its body must be replaced with a stub (§4.6).
pub fn requires_stub(method: &RawMethod) -> bool {
	if mentions_clr_internal_type(&method.return_type) {
		return true;
	}
	if method.parameters.iter().any(|p| mentions_clr_internal_type(&p.type_name)) {
		return true;
	}
	let Some(body) = &method.body else { return false };
	if body.locals.iter().any(|l| mentions_clr_internal_type(&l.type_name)) {
		return true;
	}
	body.instructions.iter().any(|instr| match &instr.operand {
		Operand::TypeRef(t) => mentions_clr_internal_type(&t.il_name),
		Operand::FieldRef(f) => mentions_clr_internal_type(&f.declaring_type),
		Operand::MethodRef(m) => mentions_clr_internal_type(&m.declaring_type),
		_ => false,
	}) || instr_has_clr_opcode(&body.instructions)
}

fn instr_has_clr_opcode(instructions: &[crate::reader_model::RawInstruction]) -> bool {
	instructions.iter().any(|i| matches!(i.opcode, RawOpCode::Other(name) if name.starts_with("clr.")))
}

/// The replacement body kind for a stubbed method, chosen from its return type (§4.6: "yielding
/// `nullptr`, `{}`, or omitted depending on return type").
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StubReturn {
	Nullptr,
	EmptyBraceInit,
	Omitted,
}

pub fn stub_return_for(return_type_il_name: &str) -> StubReturn {
	match return_type_il_name {
		"System.Void" | "void" => StubReturn::Omitted,
		name if crate::name_mapper::Primitive::from_il_name(name).is_some() => StubReturn::EmptyBraceInit,
		_ => StubReturn::Nullptr,
	}
}

static REPORTED_ONCE: AtomicBool = AtomicBool::new(false);

/// §7: "Reported once to stderr at most." Subsequent calls are no-ops.
pub fn report_once() {
	if REPORTED_ONCE.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
		eprintln!("note: one or more methods depend on undocumented CLR-internal types; their bodies were stubbed");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reader_model::*;

	fn empty_method(return_type: &str) -> RawMethod {
		RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: return_type.into(), parameters: vec![], body: None, has_clr_internal_dependency: false }
	}

	#[test]
	fn return_type_referencing_clr_internal_requires_stub() {
		assert!(requires_stub(&empty_method("RuntimeType")));
	}

	#[test]
	fn plain_method_does_not_require_stub() {
		assert!(!requires_stub(&empty_method("System.Int32")));
	}

	#[test]
	fn void_methods_stub_to_omitted_return() {
		assert_eq!(stub_return_for("System.Void"), StubReturn::Omitted);
	}

	#[test]
	fn primitive_returns_stub_to_brace_init() {
		assert_eq!(stub_return_for("System.Int32"), StubReturn::EmptyBraceInit);
	}

	#[test]
	fn reference_returns_stub_to_nullptr() {
		assert_eq!(stub_return_for("App.Widget"), StubReturn::Nullptr);
	}
}
