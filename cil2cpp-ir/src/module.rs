//! The IR data model (§3): the `Module` graph handed to the (external, out-of-scope) C++ emitter.
//!
//! Ownership mirrors the teacher's `structured::types` module: one arena (`bumpalo::Bump`) owns
//! every `Type`/`Method`/`Field`/`Instruction` for a build, cross-references are non-owning `&'l`
//! borrows compared by pointer identity, and two-phase construction (an `Uninit`-ish shell
//! followed by a `Cell`-swapped payload) breaks the cyclic type → base-type → derived-type
//! reference problem.

use std::cell::Cell;
use std::fmt::{Debug, Formatter};
use std::hash::{Hash, Hasher};

use bitflags::bitflags;
use derivative::Derivative;
use fxhash::FxHashMap;

bitflags! {
	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct TypeIrFlags: u32 {
		const IS_VALUE_TYPE      = 1 << 0;
		const IS_INTERFACE       = 1 << 1;
		const IS_ABSTRACT        = 1 << 2;
		const IS_SEALED          = 1 << 3;
		const IS_ENUM            = 1 << 4;
		const IS_DELEGATE        = 1 << 5;
		const IS_RECORD          = 1 << 6;
		const IS_RUNTIME_PROVIDED = 1 << 7;
		const IS_PRIMITIVE       = 1 << 8;
		const IS_GENERIC_INSTANCE = 1 << 9;
		const HAS_CCTOR          = 1 << 10;
	}

	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct MethodIrFlags: u32 {
		const IS_STATIC             = 1 << 0;
		const IS_VIRTUAL            = 1 << 1;
		const IS_ABSTRACT           = 1 << 2;
		const IS_NEW_SLOT           = 1 << 3;
		const IS_CONSTRUCTOR        = 1 << 4;
		const IS_STATIC_CONSTRUCTOR = 1 << 5;
		const IS_INTERNAL_CALL      = 1 << 6;
		const IS_FINALIZER          = 1 << 7;
		const IS_ENTRY_POINT        = 1 << 8;
		const IS_GENERIC_INSTANCE   = 1 << 9;
		const HAS_ICALL_MAPPING     = 1 << 10;
		const HAS_VARARGS           = 1 << 11;
	}

	#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
	pub struct FieldIrFlags: u32 {
		const IS_STATIC = 1 << 0;
		const IS_PUBLIC = 1 << 1;
	}
}

/// Generic-parameter variance, carried so the emitter can reproduce covariant/contravariant
/// interface instantiations faithfully.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Variance {
	Invariant,
	Covariant,
	Contravariant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
	I32(i32),
	I64(i64),
	F64(f64),
	Bool(bool),
}

/// A type in the flat-struct C++ model (§9 design note: no C++ inheritance).
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Type<'l> {
	pub il_full_name: &'l str,
	pub namespace: &'l str,
	pub name: &'l str,
	pub cpp_name: Cell<&'l str>,
	pub flags: Cell<TypeIrFlags>,
	pub base_type: Cell<Option<&'l Type<'l>>>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub interfaces: Cell<&'l [&'l Type<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub fields: Cell<&'l [Field<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub static_fields: Cell<&'l [Field<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub methods: Cell<&'l [&'l Method<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub vtable: Cell<&'l [VTableEntry<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub interface_impls: Cell<&'l [InterfaceImpl<'l>]>,
	pub finalizer: Cell<Option<&'l Method<'l>>>,
	pub explicit_size: Cell<Option<u32>>,
	pub instance_size: Cell<u32>,
	pub enum_underlying_type: Cell<Option<&'l str>>,
	pub generic_type_args: &'l [&'l str],
	pub generic_variance: &'l [Variance],
}

impl<'l> Type<'l> {
	pub fn is_value_type(&self) -> bool {
		self.flags.get().contains(TypeIrFlags::IS_VALUE_TYPE)
	}

	pub fn is_interface(&self) -> bool {
		self.flags.get().contains(TypeIrFlags::IS_INTERFACE)
	}

	/// Walks the base-type chain, innermost first, yielding `self` then every ancestor.
	pub fn base_chain(&'l self) -> impl Iterator<Item = &'l Type<'l>> {
		std::iter::successors(Some(self), |t| t.base_type.get())
	}

	/// True when `self` or any ancestor is `other` by identity.
	pub fn derives_from(&'l self, other: &'l Type<'l>) -> bool {
		self.base_chain().any(|t| std::ptr::eq(t, other))
	}
}

impl Eq for Type<'_> {}

impl PartialEq<Self> for Type<'_> {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for Type<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Self).hash(state)
	}
}

#[derive(Debug, Copy, Clone)]
pub struct Field<'l> {
	pub name: &'l str,
	pub cpp_name: &'l str,
	pub type_name: &'l str,
	pub type_ref: Option<&'l Type<'l>>,
	pub flags: FieldIrFlags,
	pub constant_value: Option<ConstantValue>,
	pub offset: u32,
	pub declaring_type: &'l Type<'l>,
}

#[derive(Debug, Copy, Clone)]
pub struct Parameter<'l> {
	pub index: u32,
	pub cpp_name: &'l str,
	pub il_type_name: &'l str,
	pub cpp_type: &'l str,
}

#[derive(Debug, Copy, Clone)]
pub struct Local<'l> {
	pub index: u32,
	pub cpp_name: &'l str,
	pub il_type_name: &'l str,
	pub cpp_type: &'l str,
}

#[derive(Debug, Copy, Clone)]
pub struct ExplicitOverride<'l> {
	pub interface_il_name: &'l str,
	pub method_name: &'l str,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub struct Method<'l> {
	pub name: &'l str,
	pub cpp_name: Cell<&'l str>,
	pub declaring_type: &'l Type<'l>,
	pub return_type_cpp: Cell<&'l str>,
	pub flags: Cell<MethodIrFlags>,
	pub parameters: &'l [Parameter<'l>],
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub locals: Cell<&'l [Local<'l>]>,
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub basic_blocks: Cell<&'l [BasicBlock<'l>]>,
	pub vtable_slot: Cell<i32>,
	pub explicit_overrides: &'l [ExplicitOverride<'l>],
	#[derivative(Debug(format_with = "fmt_debug_cell"))]
	pub temp_var_types: Cell<&'l [(&'l str, &'l str)]>,
	/// Non-empty for generic method specializations: the bound method type-arguments, in order.
	pub generic_method_args: &'l [&'l str],
}

impl Eq for Method<'_> {}

impl PartialEq<Self> for Method<'_> {
	fn eq(&self, other: &Self) -> bool {
		std::ptr::eq(self, other)
	}
}

impl Hash for Method<'_> {
	fn hash<H: Hasher>(&self, state: &mut H) {
		(self as *const Self).hash(state)
	}
}

impl<'l> Method<'l> {
	pub fn is_virtual(&self) -> bool {
		self.flags.get().contains(MethodIrFlags::IS_VIRTUAL)
	}

	pub fn parameter_types(&self) -> impl Iterator<Item = &'l str> + '_ {
		self.parameters.iter().map(|p| p.il_type_name)
	}

	pub fn signature_matches(&self, name: &str, param_types: &[&str]) -> bool {
		self.name == name && self.parameters.len() == param_types.len() && self.parameters.iter().zip(param_types).all(|(p, t)| p.il_type_name == *t)
	}
}

#[derive(Debug, Copy, Clone)]
pub struct VTableEntry<'l> {
	pub slot: u32,
	pub method_name: &'l str,
	pub target: Option<&'l Method<'l>>,
	pub declaring_type: &'l Type<'l>,
}

#[derive(Debug, Copy, Clone)]
pub struct InterfaceImpl<'l> {
	pub interface_type: &'l Type<'l>,
	/// One entry per interface method slot, preserving alignment; `None` where unimplemented.
	pub slots: &'l [Option<&'l Method<'l>>],
}

#[derive(Debug, Copy, Clone)]
pub struct BasicBlock<'l> {
	pub id: u32,
	pub instructions: Cell<&'l [Instruction<'l>]>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FieldAccessor {
	Dot,
	Arrow,
}

#[derive(Debug, Copy, Clone)]
pub enum CallDispatch<'l> {
	Direct,
	ClassVirtual { slot: u32 },
	InterfaceVirtual { interface_type_cpp_name: &'l str, slot: u32 },
}

#[derive(Debug, Copy, Clone)]
pub struct CallInstr<'l> {
	pub function_name: &'l str,
	pub arguments: &'l [&'l str],
	pub dispatch: CallDispatch<'l>,
	pub vtable_return_type: Option<&'l str>,
	pub vtable_param_types: &'l [&'l str],
	pub interface_type_cpp_name: Option<&'l str>,
	pub icall_symbol: Option<&'l str>,
	pub is_varargs: bool,
}

#[derive(Debug, Copy, Clone)]
pub enum NewObjKind {
	/// Value type: a local was declared and `&local` is prepended as `this`.
	ValueTypeLocal,
	/// Runtime-provided reference type (Object/String/Array/boxed exception): allocated via the
	/// runtime allocator using the runtime struct's `sizeof`.
	RuntimeAllocated,
	/// Any other reference type.
	PlainHeap,
}

#[derive(Debug, Copy, Clone)]
pub struct NewObjInstr<'l> {
	pub type_cpp_name: &'l str,
	pub ctor_name: &'l str,
	pub ctor_args: &'l [&'l str],
	pub kind: NewObjKind,
}

#[derive(Debug, Copy, Clone)]
pub struct FieldAccessInstr<'l> {
	pub object_expr: &'l str,
	pub field_cpp_name: &'l str,
	pub cast_to_type: Option<&'l str>,
	pub accessor: FieldAccessor,
	/// `None` for a load; `Some(value_expr)` for a store.
	pub store_value: Option<&'l str>,
}

#[derive(Debug, Copy, Clone)]
pub struct StaticFieldAccessInstr<'l> {
	pub declaring_type_cpp_name: &'l str,
	pub field_cpp_name: &'l str,
	pub store_value: Option<&'l str>,
}

#[derive(Debug, Copy, Clone)]
pub enum InstructionKind<'l> {
	Assign { value: &'l str },
	BinaryOp { op: &'l str, lhs: &'l str, rhs: &'l str },
	Conversion { target_type: &'l str, value: &'l str },
	Call(CallInstr<'l>),
	DelegateInvoke { target: &'l str, arguments: &'l [&'l str] },
	DelegateCreate { target_object: &'l str, function_cpp_name: &'l str, delegate_type_cpp_name: &'l str },
	NewObj(NewObjInstr<'l>),
	InitObj { cpp_type: &'l str },
	FieldAccess(FieldAccessInstr<'l>),
	StaticFieldAccess(StaticFieldAccessInstr<'l>),
	Cast { target_type: &'l str, value: &'l str },
	Box { value: &'l str, type_info_symbol: &'l str },
	Unbox { target_type: &'l str, value: &'l str },
	RawCpp { code: &'l str },
	ConditionalBranch { condition: &'l str, true_label: &'l str, false_label: Option<&'l str> },
	Return { value: Option<&'l str> },
	DeclareLocal { name: &'l str, cpp_type: &'l str },
	StaticCtorGuard { type_cpp_name: &'l str },
	TryBegin { region: u32 },
	TryEnd { region: u32 },
	CatchBegin { region: u32, exception_type_cpp_name: &'l str },
	CatchEnd { region: u32 },
	FinallyBegin { region: u32 },
	FinallyEnd { region: u32 },
}

#[derive(Debug, Copy, Clone)]
pub struct Instruction<'l> {
	pub offset: u32,
	pub result_var: Option<&'l str>,
	pub result_type_cpp: Option<&'l str>,
	pub kind: InstructionKind<'l>,
}

/// The module-wide string-literal pool: interns a literal once per distinct value and hands back
/// a stable identifier the emitter can turn into a static initializer.
#[derive(Debug, Default)]
pub struct StringPool<'l> {
	entries: FxHashMap<&'l str, u32>,
	order: Vec<&'l str>,
}

impl<'l> StringPool<'l> {
	pub fn intern(&mut self, bump: &'l bumpalo::Bump, value: &str) -> u32 {
		if let Some(id) = self.entries.get(value) {
			return *id;
		}
		let id = self.order.len() as u32;
		let interned = bump.alloc_str(value);
		self.entries.insert(interned, id);
		self.order.push(interned);
		id
	}

	pub fn entries(&self) -> &[&'l str] {
		&self.order
	}
}

/// The module-wide static-blob pool, used by array-initializer tokens (`ldtoken field` feeding
/// `RuntimeHelpers.InitializeArray`).
#[derive(Debug, Default)]
pub struct BlobPool {
	blobs: Vec<Vec<u8>>,
}

impl BlobPool {
	pub fn push(&mut self, bytes: Vec<u8>) -> u32 {
		let id = self.blobs.len() as u32;
		self.blobs.push(bytes);
		id
	}

	pub fn blobs(&self) -> &[Vec<u8>] {
		&self.blobs
	}
}

/// The finished IR module, the core's sole output (§6: "Exposed to the Emitter").
pub struct Module<'l> {
	pub bump: &'l bumpalo::Bump,
	pub types: Vec<&'l Type<'l>>,
	pub strings: StringPool<'l>,
	pub blobs: BlobPool,
	/// IL name → underlying integer type name, for enums whose definition lives outside the
	/// reachable type set (§4.3 "External enum fixup").
	pub external_enums: FxHashMap<String, String>,
	/// `"base-mangled-name|IL-param-signature"` → final disambiguated C++ name (§4.5).
	pub disambiguation: FxHashMap<String, String>,
	pub entry_point: Option<&'l Method<'l>>,
}

impl<'l> Module<'l> {
	pub fn new(bump: &'l bumpalo::Bump) -> Self {
		Self {
			bump,
			types: Vec::new(),
			strings: StringPool::default(),
			blobs: BlobPool::default(),
			external_enums: FxHashMap::default(),
			disambiguation: FxHashMap::default(),
			entry_point: None,
		}
	}

	pub fn find_type(&self, il_full_name: &str) -> Option<&'l Type<'l>> {
		self.types.iter().copied().find(|t| t.il_full_name == il_full_name)
	}
}

impl Debug for Module<'_> {
	fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Module")
			.field("types", &self.types.iter().map(|t| t.il_full_name).collect::<Vec<_>>())
			.field("entry_point", &self.entry_point.map(|m| m.name))
			.finish()
	}
}

fn fmt_debug_cell<T: Debug + Copy>(cell: &Cell<T>, f: &mut Formatter) -> std::fmt::Result {
	Debug::fmt(&cell.get(), f)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn alloc_leaf_type<'l>(bump: &'l bumpalo::Bump, name: &'static str) -> &'l Type<'l> {
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

	#[test]
	fn base_chain_walks_to_root() {
		let bump = bumpalo::Bump::new();
		let object = alloc_leaf_type(&bump, "System.Object");
		let animal = alloc_leaf_type(&bump, "Animal");
		animal.base_type.set(Some(object));
		let dog = alloc_leaf_type(&bump, "Dog");
		dog.base_type.set(Some(animal));

		let chain: Vec<_> = dog.base_chain().map(|t| t.il_full_name).collect();
		assert_eq!(chain, vec!["Dog", "Animal", "System.Object"]);
		assert!(dog.derives_from(object));
	}

	#[test]
	fn type_identity_is_by_pointer() {
		let bump = bumpalo::Bump::new();
		let a = alloc_leaf_type(&bump, "A");
		let b = alloc_leaf_type(&bump, "A");
		assert_eq!(a, a);
		assert_ne!(a, b);
	}
}
