//! Mangles CIL identifiers into valid C++ identifiers, classifies primitives/value types, and
//! maps BCL exception types onto their runtime aliases (§2, "Name Mapper").

use std::sync::Mutex;

use cil2cpp_ir_derive::FromRepr;
use fxhash::FxHashSet;

/// The CIL primitive catalogue, mirroring `cilium::structured::types::Primitive` but carrying
/// its own C++ spelling and byte-size class instead of a CIL display form.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
pub enum Primitive {
	#[default]
	Void,
	Bool,
	Char,
	Int8,
	UInt8,
	Int16,
	UInt16,
	Int32,
	UInt32,
	Int64,
	UInt64,
	Float,
	Double,
	IntPtr,
	UIntPtr,
	Object,
	String,
}

/// Byte-size classes used by the Type Builder's field-layout algorithm (§4.3). Modeled with an
/// explicit `#[repr(u32)]` so `FromRepr` can turn a raw byte-width (e.g. an enum's underlying
/// integer width) back into a class.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, FromRepr)]
#[repr(u32)]
pub enum PrimitiveClass {
	Size1 = 1,
	Size2 = 2,
	Size4 = 4,
	Size8 = 8,
}

impl PrimitiveClass {
	pub fn bytes(self) -> u32 {
		self as u32
	}
}

impl Primitive {
	pub fn from_il_name(full_name: &str) -> Option<Primitive> {
		Some(match full_name {
			"System.Void" => Primitive::Void,
			"System.Boolean" => Primitive::Bool,
			"System.Char" => Primitive::Char,
			"System.SByte" => Primitive::Int8,
			"System.Byte" => Primitive::UInt8,
			"System.Int16" => Primitive::Int16,
			"System.UInt16" => Primitive::UInt16,
			"System.Int32" => Primitive::Int32,
			"System.UInt32" => Primitive::UInt32,
			"System.Int64" => Primitive::Int64,
			"System.UInt64" => Primitive::UInt64,
			"System.Single" => Primitive::Float,
			"System.Double" => Primitive::Double,
			"System.IntPtr" => Primitive::IntPtr,
			"System.UIntPtr" => Primitive::UIntPtr,
			"System.Object" => Primitive::Object,
			"System.String" => Primitive::String,
			_ => return None,
		})
	}

	pub fn cpp_name(self) -> &'static str {
		match self {
			Primitive::Void => "void",
			Primitive::Bool => "bool",
			Primitive::Char => "char16_t",
			Primitive::Int8 => "int8_t",
			Primitive::UInt8 => "uint8_t",
			Primitive::Int16 => "int16_t",
			Primitive::UInt16 => "uint16_t",
			Primitive::Int32 => "int32_t",
			Primitive::UInt32 => "uint32_t",
			Primitive::Int64 => "int64_t",
			Primitive::UInt64 => "uint64_t",
			Primitive::Float => "float",
			Primitive::Double => "double",
			Primitive::IntPtr => "intptr_t",
			Primitive::UIntPtr => "uintptr_t",
			Primitive::Object => "Object*",
			Primitive::String => "String*",
		}
	}

	/// `None` for `Void`, `Object`, and `String` (pointer-sized / not struct-like for layout
	/// purposes — `Object`/`String` are always reference types, handled as 8-byte pointers).
	pub fn size_class(self) -> Option<PrimitiveClass> {
		match self {
			Primitive::Void => None,
			Primitive::Bool | Primitive::Int8 | Primitive::UInt8 => Some(PrimitiveClass::Size1),
			Primitive::Char | Primitive::Int16 | Primitive::UInt16 => Some(PrimitiveClass::Size2),
			Primitive::Int32 | Primitive::UInt32 | Primitive::Float => Some(PrimitiveClass::Size4),
			Primitive::Int64 | Primitive::UInt64 | Primitive::Double => Some(PrimitiveClass::Size8),
			Primitive::IntPtr | Primitive::UIntPtr | Primitive::Object | Primitive::String => Some(PrimitiveClass::Size8),
		}
	}

	pub fn is_pointer_sized(self) -> bool {
		matches!(self, Primitive::IntPtr | Primitive::UIntPtr | Primitive::Object | Primitive::String)
	}
}

/// Registered value-type names, both IL-keyed and C++-mangled-keyed. Guarded by a mutex (§5):
/// the downstream emitter may read this set while the IR Builder is still writing to it.
#[derive(Default)]
pub struct ValueTypeRegistry {
	names: Mutex<FxHashSet<String>>,
}

impl ValueTypeRegistry {
	pub fn register(&self, name: impl Into<String>) {
		self.names.lock().unwrap().insert(name.into());
	}

	pub fn contains(&self, name: &str) -> bool {
		self.names.lock().unwrap().contains(name)
	}
}

/// Well-known BCL exception types and their runtime symbolic aliases (§2 Name Mapper). The
/// runtime library (out of scope) is expected to define a matching C++ type for each alias.
const BCL_EXCEPTION_ALIASES: &[(&str, &str)] = &[
	("System.Exception", "rt::Exception"),
	("System.SystemException", "rt::SystemException"),
	("System.ArgumentException", "rt::ArgumentException"),
	("System.ArgumentNullException", "rt::ArgumentNullException"),
	("System.ArgumentOutOfRangeException", "rt::ArgumentOutOfRangeException"),
	("System.NullReferenceException", "rt::NullReferenceException"),
	("System.InvalidOperationException", "rt::InvalidOperationException"),
	("System.IndexOutOfRangeException", "rt::IndexOutOfRangeException"),
	("System.NotSupportedException", "rt::NotSupportedException"),
	("System.NotImplementedException", "rt::NotImplementedException"),
	("System.OverflowException", "rt::OverflowException"),
	("System.DivideByZeroException", "rt::DivideByZeroException"),
	("System.FormatException", "rt::FormatException"),
	("System.OutOfMemoryException", "rt::OutOfMemoryException"),
	("System.StackOverflowException", "rt::StackOverflowException"),
	("System.TypeLoadException", "rt::TypeLoadException"),
	("System.InvalidCastException", "rt::InvalidCastException"),
	("System.PlatformNotSupportedException", "rt::PlatformNotSupportedException"),
];

pub fn bcl_exception_alias(il_full_name: &str) -> Option<&'static str> {
	BCL_EXCEPTION_ALIASES.iter().find(|(name, _)| *name == il_full_name).map(|(_, alias)| *alias)
}

pub fn is_bcl_exception_type(il_full_name: &str) -> bool {
	bcl_exception_alias(il_full_name).is_some()
}

/// Mangles an IL full name (`Namespace.Outer/Nested`1<System.Int32>`) into a valid C++
/// identifier. Idempotent: re-mangling an already-mangled name is a no-op (§8 round-trip
/// property), since every character the function can produce is itself left untouched by a
/// second pass.
pub fn mangle_type_name(il_full_name: &str) -> String {
	if let Some(prim) = Primitive::from_il_name(il_full_name) {
		return prim.cpp_name().trim_end_matches('*').to_string();
	}

	let mut out = String::with_capacity(il_full_name.len() + 8);
	let mut chars = il_full_name.chars().peekable();
	while let Some(c) = chars.next() {
		match c {
			'.' | '/' | '+' | ',' | '<' | '>' | '[' | ']' | '&' | '*' | ' ' | '-' => out.push('_'),
			'`' => {
				out.push_str("_g");
				// swallow the arity digits; the generic-argument list that follows (for a
				// closed instantiation) supplies the real disambiguation.
				while matches!(chars.peek(), Some(d) if d.is_ascii_digit()) {
					chars.next();
				}
			}
			c if c.is_ascii_alphanumeric() || c == '_' => out.push(c),
			_ => out.push('_'),
		}
	}

	if out.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) {
		out.insert(0, '_');
	}

	collapse_runs(&out)
}

/// Builds an instantiation key / mangled name for a closed generic type: `"Open<arg1,arg2>"`
/// for the registry key, or the fully mangled C++ identifier when `mangled` is requested.
pub fn mangle_generic_instantiation(open_name: &str, type_args: &[&str], mangled: bool) -> String {
	if mangled {
		let mut out = mangle_type_name(open_name);
		for arg in type_args {
			out.push_str("_1_"); // mirrors the arity-prefixed pattern §4.7 substitutes over
			out.push_str(&mangle_type_name(arg));
		}
		out
	} else {
		format!("{}<{}>", open_name, type_args.join(","))
	}
}

fn collapse_runs(s: &str) -> String {
	let mut out = String::with_capacity(s.len());
	let mut last_underscore = false;
	for c in s.chars() {
		if c == '_' {
			if last_underscore {
				continue;
			}
			last_underscore = true;
		} else {
			last_underscore = false;
		}
		out.push(c);
	}
	out
}

/// Appends a return-type suffix for `op_Explicit`/`op_Implicit` overloads (§4.4 point 5):
/// C++ cannot overload on return type alone, so the mangled name must encode it.
pub fn mangle_conversion_operator(base_mangled_name: &str, return_type_cpp_mangled: &str) -> String {
	format!("{base_mangled_name}__to_{return_type_cpp_mangled}")
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn mangling_is_idempotent() {
		let once = mangle_type_name("System.Collections.Generic.List`1");
		let twice = mangle_type_name(&once);
		assert_eq!(once, twice);
	}

	#[test]
	fn nested_type_separator_becomes_underscore() {
		let mangled = mangle_type_name("System.Collections.Generic.Dictionary`2+Enumerator");
		assert!(mangled.contains("Dictionary"));
		assert!(mangled.contains("Enumerator"));
		assert!(!mangled.contains('+'));
		assert!(!mangled.contains('`'));
	}

	#[test]
	fn primitive_size_classes_match_layout_rules() {
		assert_eq!(Primitive::Int32.size_class(), Some(PrimitiveClass::Size4));
		assert_eq!(Primitive::Int64.size_class(), Some(PrimitiveClass::Size8));
		assert!(Primitive::IntPtr.is_pointer_sized());
	}

	#[test]
	fn primitive_class_from_repr_round_trips() {
		assert_eq!(PrimitiveClass::from_repr(4), Some(PrimitiveClass::Size4));
		assert_eq!(PrimitiveClass::from_repr(3), None);
	}

	#[test]
	fn exception_alias_lookup() {
		assert_eq!(bcl_exception_alias("System.ArgumentNullException"), Some("rt::ArgumentNullException"));
		assert!(bcl_exception_alias("My.Custom.Exception").is_none());
	}

	#[test]
	fn value_type_registry_is_shared_safely() {
		let registry = ValueTypeRegistry::default();
		registry.register("System.Int32");
		assert!(registry.contains("System.Int32"));
		assert!(!registry.contains("System.String"));
	}
}
