//! The data contract the (external, out-of-scope) Assembly Reader hands to this crate.
//!
//! Nothing here parses bytes off disk: a real reader would walk a PE file's metadata tables,
//! the way `cilium`'s own `raw`/`schema` layers do, and hand the Driver the typed shape below.
//! This module exists purely so the rest of the crate has something concrete to consume and so
//! tests can build small fixtures by hand.

use std::fmt::{Debug, Formatter};

use fxhash::FxHashMap;

/// How an assembly relates to the compiled program, mirroring the classifier §6 describes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AssemblyClass {
	/// The assembly (or assemblies) containing the entry point / user code being compiled.
	User,
	/// Base Class Library assembly (System.Private.CoreLib and friends).
	Bcl,
	/// Any other referenced assembly.
	ThirdParty,
}

/// One loaded assembly's worth of typed metadata.
#[derive(Debug)]
pub struct RawAssembly {
	pub name: String,
	pub class: AssemblyClass,
	pub types: Vec<RawType>,
}

/// The full set of assemblies available to a build, as handed over by the reader.
#[derive(Debug, Default)]
pub struct AssemblySet {
	pub root_assembly: String,
	pub assemblies: FxHashMap<String, RawAssembly>,
}

impl AssemblySet {
	pub fn new(root_assembly: impl Into<String>) -> Self {
		Self { root_assembly: root_assembly.into(), assemblies: FxHashMap::default() }
	}

	pub fn add_assembly(&mut self, assembly: RawAssembly) {
		self.assemblies.insert(assembly.name.clone(), assembly);
	}

	/// Finds a type by IL full name across every loaded assembly.
	pub fn find_type(&self, il_full_name: &str) -> Option<&RawType> {
		self.assemblies.values().find_map(|a| a.types.iter().find(|t| t.full_name == il_full_name))
	}

	/// Finds a method by declaring-type IL full name + method name + parameter count.
	pub fn find_method(&self, declaring_type: &str, name: &str, arity: usize) -> Option<(&RawType, &RawMethod)> {
		let ty = self.find_type(declaring_type)?;
		let method = ty.methods.iter().find(|m| m.name == name && m.parameters.len() == arity)?;
		Some((ty, method))
	}
}

bitflags::bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeFlags: u32 {
		const IS_VALUE_TYPE   = 1 << 0;
		const IS_INTERFACE    = 1 << 1;
		const IS_ABSTRACT     = 1 << 2;
		const IS_SEALED       = 1 << 3;
		const IS_ENUM         = 1 << 4;
		const IS_DELEGATE     = 1 << 5;
		const IS_RECORD       = 1 << 6;
		const IS_PUBLIC       = 1 << 7;
		const IS_NESTED       = 1 << 8;
	}

	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodFlags: u32 {
		const IS_STATIC            = 1 << 0;
		const IS_VIRTUAL           = 1 << 1;
		const IS_ABSTRACT          = 1 << 2;
		const IS_NEW_SLOT          = 1 << 3;
		const IS_CONSTRUCTOR       = 1 << 4;
		const IS_STATIC_CONSTRUCTOR = 1 << 5;
		const IS_PUBLIC            = 1 << 6;
		const IS_PROTECTED         = 1 << 7;
		const HAS_VARARGS          = 1 << 8;
	}

	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldFlags: u32 {
		const IS_STATIC = 1 << 0;
		const IS_PUBLIC = 1 << 1;
		const HAS_CONSTANT = 1 << 2;
	}
}

#[derive(Debug, Clone)]
pub struct RawType {
	pub full_name: String,
	pub namespace: String,
	pub name: String,
	pub flags: TypeFlags,
	pub base_type: Option<String>,
	pub interfaces: Vec<String>,
	pub fields: Vec<RawField>,
	pub methods: Vec<RawMethod>,
	/// Layout metadata's explicit size, when present (fixed buffers, `[StructLayout(Size=..)]`).
	pub explicit_size: Option<u32>,
	/// For enums: the underlying integer type's IL name.
	pub enum_underlying_type: Option<String>,
	/// For generic instances discovered during monomorphization: the open definition's name and
	/// the resolved argument names, in order.
	pub generic_instantiation: Option<(String, Vec<String>)>,
	/// Generic parameter names declared directly on this type (empty for non-generic types and
	/// for already-closed instantiations).
	pub generic_parameters: Vec<String>,
}

impl RawType {
	pub fn new(full_name: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>, flags: TypeFlags) -> Self {
		Self {
			full_name: full_name.into(),
			namespace: namespace.into(),
			name: name.into(),
			flags,
			base_type: None,
			interfaces: Vec::new(),
			fields: Vec::new(),
			methods: Vec::new(),
			explicit_size: None,
			enum_underlying_type: None,
			generic_instantiation: None,
			generic_parameters: Vec::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct RawField {
	pub name: String,
	pub type_name: String,
	pub flags: FieldFlags,
	pub constant_value: Option<ConstantValue>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
	I32(i32),
	I64(i64),
	F64(f64),
	Bool(bool),
}

#[derive(Debug, Clone)]
pub struct RawParameter {
	pub name: String,
	pub type_name: String,
	pub is_by_ref: bool,
}

#[derive(Debug, Clone)]
pub struct RawLocal {
	pub type_name: String,
}

#[derive(Debug, Clone)]
pub struct RawMethod {
	pub name: String,
	pub flags: MethodFlags,
	pub return_type: String,
	pub parameters: Vec<RawParameter>,
	pub body: Option<RawMethodBody>,
	/// Set when this method's body references a type known to be undocumented CLR-internal
	/// plumbing; the Driver substitutes a stub body instead of lowering it (§4.6).
	pub has_clr_internal_dependency: bool,
}

#[derive(Debug, Clone)]
pub struct RawMethodBody {
	pub locals: Vec<RawLocal>,
	pub instructions: Vec<RawInstruction>,
	pub exception_regions: Vec<ExceptionRegion>,
}

#[derive(Debug, Clone)]
pub struct ExceptionRegion {
	pub try_start: u32,
	pub try_end: u32,
	pub handler_start: u32,
	pub handler_end: u32,
	pub kind: ExceptionRegionKind,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ExceptionRegionKind {
	Catch { exception_type: &'static str },
	Finally,
}

#[derive(Debug, Clone)]
pub struct RawInstruction {
	pub offset: u32,
	pub opcode: RawOpCode,
	pub operand: Operand,
}

/// The CIL opcodes this crate's lowerer has to understand. Not exhaustive of ECMA-335 — only
/// the opcodes the Instruction Lowerer (§4.4) has distinct handling for are named; everything
/// else a real reader would supply collapses to `Other` with its raw mnemonic preserved so the
/// lowerer can still report what it didn't understand instead of silently miscompiling.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum RawOpCode {
	Nop,
	Dup,
	Pop,
	LdArg,
	LdArgA,
	StArg,
	LdLoc,
	LdLocA,
	StLoc,
	LdNull,
	LdcI4,
	LdcI8,
	LdcR4,
	LdcR8,
	LdStr,
	Add,
	Sub,
	Mul,
	Div,
	DivUn,
	Rem,
	RemUn,
	And,
	Or,
	Xor,
	Shl,
	Shr,
	ShrUn,
	Neg,
	Not,
	Ceq,
	Cgt,
	CgtUn,
	Clt,
	CltUn,
	Conv,
	Box,
	Unbox,
	UnboxAny,
	Castclass,
	Isinst,
	Newobj,
	Newarr,
	Ldfld,
	Ldflda,
	Stfld,
	Ldsfld,
	Ldsflda,
	Stsfld,
	Ldelem,
	Ldelema,
	Stelem,
	Ldlen,
	Call,
	Callvirt,
	Calli,
	Ret,
	Br,
	Brtrue,
	Brfalse,
	Beq,
	Bne,
	Bgt,
	Blt,
	Ble,
	Bge,
	Switch,
	Throw,
	Rethrow,
	Leave,
	Endfinally,
	Initobj,
	Ldtoken,
	Sizeof,
	Constrained,
	Ldftn,
	Ldvirtftn,
	Other(&'static str),
}

/// The typed sum over CIL instruction operands (§6). `Castclass`/`Isinst`/`Newarr`/`Initobj`/
/// `Sizeof` carry the referenced type as `TypeRef`; so does `Conv` — its operand names the IL
/// target type (`System.SByte`, `System.Double`, `System.UIntPtr`, ...) rather than encoding a
/// fixed width, so `conv.i1`/`conv.r8`/`conv.u` all flow through the same typed path.
#[derive(Debug, Clone)]
pub enum Operand {
	None,
	Index(u32),
	I32(i32),
	I64(i64),
	F32(f32),
	F64(f64),
	String(String),
	BranchTarget(u32),
	BranchTargets(Vec<u32>),
	TypeRef(TypeRefOperand),
	FieldRef(FieldRefOperand),
	MethodRef(MethodRefOperand),
}

#[derive(Debug, Clone)]
pub struct TypeRefOperand {
	pub il_name: String,
}

#[derive(Debug, Clone)]
pub struct FieldRefOperand {
	pub declaring_type: String,
	pub field_name: String,
}

#[derive(Debug, Clone)]
pub struct MethodRefOperand {
	pub declaring_type: String,
	pub method_name: String,
	pub parameter_types: Vec<String>,
	/// Non-empty for `GenericInstanceMethod` operands: the bound method type-arguments.
	pub method_generic_args: Vec<String>,
	/// Set for `GenericInstanceType` declaring types (e.g. `List<int>.Add`).
	pub declaring_type_generic_args: Vec<String>,
}

impl Debug for AssemblySet {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AssemblySet")
			.field("root_assembly", &self.root_assembly)
			.field("assemblies", &self.assemblies.keys().collect::<Vec<_>>())
			.finish()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn find_type_searches_every_assembly() {
		let mut set = AssemblySet::new("App");
		let mut user = RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };
		user.types.push(RawType::new("App.Program", "App", "Program", TypeFlags::IS_PUBLIC));
		set.add_assembly(user);

		assert!(set.find_type("App.Program").is_some());
		assert!(set.find_type("App.Missing").is_none());
	}
}
