//! Type-Parameter Resolution Post-Pass (§4.7). After a generic specialization's body is lowered,
//! lingering generic-parameter names (`TChar`, `TKey`, ...) can still appear in C++ type fields,
//! raw code strings, and mangled identifiers. This pass replaces every whole-word occurrence
//! with its resolved binding, word-boundary aware so `TChar` is never replaced inside `TCharSet`.

use fxhash::FxHashMap;

use crate::module::{InstructionKind, Method};
use crate::name_mapper::mangle_type_name;

fn is_word_char(c: char) -> bool {
	c.is_ascii_alphanumeric() || c == '_'
}

/// Replaces whole-word occurrences of `from` with `to` in `text`, never matching inside a larger
/// identifier (§4.7 point 1/2).
pub fn replace_whole_word(text: &str, from: &str, to: &str) -> String {
	if from.is_empty() {
		return text.to_string();
	}
	let mut out = String::with_capacity(text.len());
	let bytes = text.as_bytes();
	let from_bytes = from.as_bytes();
	let mut i = 0;
	while i < bytes.len() {
		if text[i..].starts_with(from) {
			let before_ok = i == 0 || !is_word_char(text[..i].chars().last().unwrap());
			let after_idx = i + from_bytes.len();
			let after_ok = after_idx >= bytes.len() || !is_word_char(text[after_idx..].chars().next().unwrap());
			if before_ok && after_ok {
				out.push_str(to);
				i = after_idx;
				continue;
			}
		}
		let ch = text[i..].chars().next().unwrap();
		out.push(ch);
		i += ch.len_utf8();
	}
	out
}

/// Replaces every occurrence of `pattern` in `text` that is not immediately followed by an
/// ASCII letter — the boundary rule §4.7 point 3 specifies so `_1_T` never matches inside
/// `_1_ThreadLocalArray`, while still matching when followed by a digit, underscore, or nothing.
fn replace_not_followed_by_letter(text: &str, pattern: &str, replacement: &str) -> String {
	if pattern.is_empty() {
		return text.to_string();
	}
	let mut out = String::with_capacity(text.len());
	let mut i = 0;
	while i < text.len() {
		if text[i..].starts_with(pattern) {
			let after_idx = i + pattern.len();
			let after_ok = after_idx >= text.len() || !text[after_idx..].chars().next().unwrap().is_ascii_alphabetic();
			if after_ok {
				out.push_str(replacement);
				i = after_idx;
				continue;
			}
		}
		let ch = text[i..].chars().next().unwrap();
		out.push(ch);
		i += ch.len_utf8();
	}
	out
}

/// Replaces arity-prefixed mangled patterns `_1_TKey` → `_1_System_String` (arities 1–8),
/// boundary aware so `_1_ThreadLocalArray` is left untouched for an unrelated parameter name
/// (§4.7 point 3).
pub fn replace_mangled_arity_prefixed(text: &str, param_name: &str, resolved_mangled: &str) -> String {
	let mut out = text.to_string();
	for arity in 1..=8 {
		let pattern = format!("_{arity}_{param_name}");
		let replacement = format!("_{arity}_{resolved_mangled}");
		out = replace_not_followed_by_letter(&out, &pattern, &replacement);
	}
	out
}

fn resolve_str<'l>(bump: &'l bumpalo::Bump, s: &'l str, bindings: &FxHashMap<&str, &str>) -> &'l str {
	let mut result = s.to_string();
	for (param, resolved) in bindings {
		result = replace_whole_word(&result, param, resolved);
		let resolved_mangled = mangle_type_name(resolved);
		result = replace_mangled_arity_prefixed(&result, param, &resolved_mangled);
	}
	if result == s {
		s
	} else {
		bump.alloc_str(&result)
	}
}

/// Runs the post-pass over every basic block of `method`, resolving `bindings` (generic
/// parameter name → resolved IL/C++ type name) across every instruction field §4.7 point 4 and 5
/// name (`RawCpp.Code`, `Call.*`, `FieldAccess.*`, `StaticFieldAccess.*`, `Cast`, `Box`, `Unbox`,
/// `NewObj.*`, `InitObj`, `StaticCtorGuard`, and `TempVarTypes`).
pub fn resolve_generic_parameters_in_body<'l>(bump: &'l bumpalo::Bump, method: &'l Method<'l>, bindings: &FxHashMap<&str, &str>) {
	if bindings.is_empty() {
		return;
	}

	method.return_type_cpp.set(resolve_str(bump, method.return_type_cpp.get(), bindings));

	let temp_vars: Vec<_> = method
		.temp_var_types
		.get()
		.iter()
		.map(|(name, ty)| (resolve_str(bump, name, bindings), resolve_str(bump, ty, bindings)))
		.collect();
	method.temp_var_types.set(bump.alloc_slice_copy(&temp_vars));

	let blocks = method.basic_blocks.get();
	for block in blocks {
		let instructions: Vec<_> = block
			.instructions
			.get()
			.iter()
			.map(|instr| {
				let mut instr = *instr;
				instr.result_type_cpp = instr.result_type_cpp.map(|t| resolve_str(bump, t, bindings));
				instr.kind = resolve_kind(bump, instr.kind, bindings);
				instr
			})
			.collect();
		block.instructions.set(bump.alloc_slice_copy(&instructions));
	}
}

fn resolve_kind<'l>(bump: &'l bumpalo::Bump, kind: InstructionKind<'l>, b: &FxHashMap<&str, &str>) -> InstructionKind<'l> {
	use InstructionKind::*;
	match kind {
		RawCpp { code } => RawCpp { code: resolve_str(bump, code, b) },
		Call(mut c) => {
			c.function_name = resolve_str(bump, c.function_name, b);
			c.arguments = bump.alloc_slice_fill_iter(c.arguments.iter().map(|a| resolve_str(bump, a, b)));
			c.vtable_return_type = c.vtable_return_type.map(|t| resolve_str(bump, t, b));
			c.vtable_param_types = bump.alloc_slice_fill_iter(c.vtable_param_types.iter().map(|t| resolve_str(bump, t, b)));
			c.interface_type_cpp_name = c.interface_type_cpp_name.map(|t| resolve_str(bump, t, b));
			Call(c)
		}
		FieldAccess(mut f) => {
			f.object_expr = resolve_str(bump, f.object_expr, b);
			f.field_cpp_name = resolve_str(bump, f.field_cpp_name, b);
			f.cast_to_type = f.cast_to_type.map(|t| resolve_str(bump, t, b));
			f.store_value = f.store_value.map(|v| resolve_str(bump, v, b));
			FieldAccess(f)
		}
		StaticFieldAccess(mut s) => {
			s.declaring_type_cpp_name = resolve_str(bump, s.declaring_type_cpp_name, b);
			s.field_cpp_name = resolve_str(bump, s.field_cpp_name, b);
			s.store_value = s.store_value.map(|v| resolve_str(bump, v, b));
			StaticFieldAccess(s)
		}
		Cast { target_type, value } => Cast { target_type: resolve_str(bump, target_type, b), value: resolve_str(bump, value, b) },
		Box { value, type_info_symbol } => Box { value: resolve_str(bump, value, b), type_info_symbol: resolve_str(bump, type_info_symbol, b) },
		Unbox { target_type, value } => Unbox { target_type: resolve_str(bump, target_type, b), value: resolve_str(bump, value, b) },
		NewObj(mut n) => {
			n.type_cpp_name = resolve_str(bump, n.type_cpp_name, b);
			n.ctor_name = resolve_str(bump, n.ctor_name, b);
			n.ctor_args = bump.alloc_slice_fill_iter(n.ctor_args.iter().map(|a| resolve_str(bump, a, b)));
			NewObj(n)
		}
		InitObj { cpp_type } => InitObj { cpp_type: resolve_str(bump, cpp_type, b) },
		StaticCtorGuard { type_cpp_name } => StaticCtorGuard { type_cpp_name: resolve_str(bump, type_cpp_name, b) },
		other => other,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn whole_word_replacement_skips_prefix_matches() {
		let result = replace_whole_word("TChar __t7 = static_cast<TChar>(45); TCharSet x;", "TChar", "char16_t");
		assert_eq!(result, "char16_t __t7 = static_cast<char16_t>(45); TCharSet x;");
	}

	#[test]
	fn arity_prefixed_replacement_is_boundary_aware() {
		let result = replace_mangled_arity_prefixed("_1_TKey_1_ThreadLocalArray", "TKey", "System_String");
		assert_eq!(result, "_1_System_String_1_ThreadLocalArray");
	}

	#[test]
	fn arity_prefixed_replacement_does_not_touch_unrelated_suffix() {
		let result = replace_mangled_arity_prefixed("_1_ThreadLocalArray", "TKey", "System_String");
		assert_eq!(result, "_1_ThreadLocalArray");
	}
}
