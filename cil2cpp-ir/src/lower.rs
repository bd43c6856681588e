//! Instruction Lowerer (§4.4): the hardest subsystem. Simulates CIL's typed evaluation stack and
//! emits a basic-block list of typed IR instructions, correctly handling pointer arithmetic,
//! comparisons, bitwise ops on pointers, method calls (icall/generic/virtual/constrained), newobj
//! forms, field-access accessor selection, and the intrinsic catalog.
//!
//! Grounded on the teacher's `raw::il` opcode catalogue (the full `OpCode` enum drives the match
//! arms below) and the cordl `cpp_members.rs` call-argument cast conventions
//! (`examples/other_examples/3ce8faee_QuestPackageManager-cordl__...`) for the `(Target*)(void*)x`
//! double-cast idiom used throughout call lowering.

use bumpalo::Bump;
use fxhash::FxHashMap;

use crate::disambiguate::resolve_call_site_name;
use crate::generics::GenericEngine;
use crate::icall::IcallRegistry;
use crate::module::{
	BasicBlock, CallDispatch, CallInstr, FieldAccessInstr, FieldAccessor, Instruction, InstructionKind, Local, Method, Module, NewObjInstr, NewObjKind,
	Parameter, StaticFieldAccessInstr, Type,
};
use crate::name_mapper::{self, mangle_type_name, Primitive, ValueTypeRegistry};
use crate::type_builder::ExternalEnumFixup;
use crate::reader_model::{ExceptionRegionKind, Operand, RawInstruction, RawMethod, RawMethodBody, RawOpCode};

/// One entry of the simulated CIL evaluation stack (§4.4 "Evaluation stack simulation").
#[derive(Debug, Clone)]
struct StackEntry {
	expr: String,
	cpp_type: Option<String>,
}

impl StackEntry {
	fn new(expr: impl Into<String>, cpp_type: Option<String>) -> Self {
		Self { expr: expr.into(), cpp_type }
	}

	fn is_pointer(&self) -> bool {
		self.cpp_type.as_deref().map(|t| t.trim_end().ends_with('*')).unwrap_or(false)
	}
}

fn pointer_element<'a>(cpp_type: &'a str) -> Option<&'a str> {
	cpp_type.strip_suffix('*').map(|s| s.trim())
}

/// Strips one layer of a balanced-parenthesis cast wrapper, e.g. `((T*)expr)` → `expr`, used by
/// constrained-call `this`-argument rewriting (§4.4 point 11) which must tolerate nested casts.
fn strip_balanced_cast(expr: &str) -> &str {
	let bytes = expr.as_bytes();
	if bytes.first() != Some(&b'(') {
		return expr;
	}
	let mut depth = 0i32;
	for (i, b) in bytes.iter().enumerate() {
		match b {
			b'(' => depth += 1,
			b')' => {
				depth -= 1;
				if depth == 0 {
					if i == bytes.len() - 1 {
						// whole expression was one parenthesized group: recurse once more in case
						// it was a cast-of-a-cast, e.g. "((T*)expr)".
						let inner = &expr[1..i];
						if let Some(close) = inner.find(')') {
							if inner.as_bytes()[0] == b'(' {
								return &inner[close + 1..];
							}
						}
						return inner;
					}
					break;
				}
			}
			_ => {}
		}
	}
	expr
}

/// Fixed operator-symbol table §4.4 point 11 falls back to for static-abstract interface members
/// on primitive operands (`op_BitwiseOr` → `|`, etc).
fn intrinsic_operator_symbol(method_name: &str) -> Option<&'static str> {
	Some(match method_name {
		"op_Addition" => "+",
		"op_Subtraction" => "-",
		"op_Multiply" => "*",
		"op_Division" => "/",
		"op_Modulus" => "%",
		"op_BitwiseAnd" => "&",
		"op_BitwiseOr" => "|",
		"op_ExclusiveOr" => "^",
		"op_LeftShift" => "<<",
		"op_RightShift" => ">>",
		"op_Equality" => "==",
		"op_Inequality" => "!=",
		"op_GreaterThan" => ">",
		"op_LessThan" => "<",
		"op_GreaterThanOrEqual" => ">=",
		"op_LessThanOrEqual" => "<=",
		_ => return None,
	})
}

/// Per-call resolution context threaded into [`LowerCtx`] so the lowerer never reaches for mutable
/// global state (§9 "Active type-parameter map" design note: passed explicitly).
pub struct LowerParams<'a> {
	pub icalls: &'a IcallRegistry,
	pub value_types: &'a ValueTypeRegistry,
	pub enum_fixup: &'a ExternalEnumFixup,
	pub type_params: &'a FxHashMap<String, String>,
	pub method_params: &'a FxHashMap<String, String>,
}

struct LowerCtx<'a, 'l> {
	bump: &'l Bump,
	module: &'a mut Module<'l>,
	generics: &'a mut GenericEngine,
	params: &'a LowerParams<'a>,
	declaring_type: &'l Type<'l>,
	method_has_cctor_guard_target: Option<&'l str>,
	locals: Vec<(String, String)>,
	parameters: Vec<Parameter<'l>>,
	temp_counter: u32,
	stack_snapshots: FxHashMap<u32, Vec<StackEntry>>,
	pending_constrained: Option<String>,
}

impl<'a, 'l> LowerCtx<'a, 'l> {
	fn fresh_temp(&mut self) -> String {
		let name = format!("__t{}", self.temp_counter);
		self.temp_counter += 1;
		name
	}

	fn cpp_type_for_il(&self, il_name: &str) -> String {
		let base = if let Some(prim) = Primitive::from_il_name(il_name) {
			prim.cpp_name().to_string()
		} else if self.params.value_types.contains(il_name) {
			format!("{}", mangle_type_name(il_name))
		} else {
			format!("{}*", mangle_type_name(il_name))
		};
		self.params.enum_fixup.fixup_cpp_type(il_name, &base)
	}

	fn resolve_local(&self, index: u32) -> Option<(&str, &str)> {
		self.locals.get(index as usize).map(|(n, t)| (n.as_str(), t.as_str()))
	}

	fn resolve_param(&self, index: u32) -> Option<(&str, &str)> {
		self.parameters.get(index as usize).map(|p| (p.cpp_name, p.cpp_type))
	}

	/// §4.4 "Field access": `.` vs `->` decision.
	fn field_accessor(&self, object_expr: &str, object_cpp_type: Option<&str>, declaring_type_is_value: bool) -> FieldAccessor {
		if object_expr.starts_with('&') || object_expr == "__this" {
			return FieldAccessor::Arrow;
		}
		if object_cpp_type.map(|t| t.trim_end().ends_with('*')).unwrap_or(false) {
			return FieldAccessor::Arrow;
		}
		if declaring_type_is_value {
			FieldAccessor::Dot
		} else {
			FieldAccessor::Arrow
		}
	}
}

/// Lowers one method body into a basic-block list (§4.4). `method_shell` is the already-built
/// shell (Pass 3) whose `basic_blocks`/`locals`/`temp_var_types` this call populates.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(method = method_shell.name)))]
pub fn lower_body<'l>(bump: &'l Bump, module: &mut Module<'l>, generics: &mut GenericEngine, params: &LowerParams<'_>, declaring_type: &'l Type<'l>, method_shell: &'l Method<'l>, raw: &RawMethod) {
	let Some(body) = &raw.body else { return };

	let mut ctx = LowerCtx {
		bump,
		module,
		generics,
		params,
		declaring_type,
		method_has_cctor_guard_target: if declaring_type.flags.get().contains(crate::module::TypeIrFlags::HAS_CCTOR) { Some(declaring_type.cpp_name.get()) } else { None },
		locals: body.locals.iter().enumerate().map(|(i, l)| (format!("__l{i}"), ctx_cpp_type_bootstrap(params, &l.type_name))).collect(),
		parameters: method_shell.parameters.to_vec(),
		temp_counter: 0,
		stack_snapshots: FxHashMap::default(),
		pending_constrained: None,
	};

	let locals: Vec<Local<'l>> = body
		.locals
		.iter()
		.enumerate()
		.map(|(i, l)| Local { index: i as u32, cpp_name: bump.alloc_str(&ctx.locals[i].0), il_type_name: bump.alloc_str(&l.type_name), cpp_type: bump.alloc_str(&ctx.locals[i].1) })
		.collect();
	method_shell.locals.set(bump.alloc_slice_copy(&locals));

	let blocks = lower_blocks(&mut ctx, body);
	method_shell.basic_blocks.set(bump.alloc_slice_fill_iter(blocks.into_iter().map(|(id, instrs)| BasicBlock { id, instructions: std::cell::Cell::new(bump.alloc_slice_copy(&instrs)) })));
}

/// Standalone helper so the initial `locals` build above can call into the same CPP-type
/// resolution the full `LowerCtx` method wraps, before `ctx` itself is constructed.
fn ctx_cpp_type_bootstrap(params: &LowerParams<'_>, il_name: &str) -> String {
	let base = if let Some(prim) = Primitive::from_il_name(il_name) {
		prim.cpp_name().to_string()
	} else if params.value_types.contains(il_name) {
		mangle_type_name(il_name)
	} else {
		format!("{}*", mangle_type_name(il_name))
	};
	params.enum_fixup.fixup_cpp_type(il_name, &base)
}

fn leader_offsets(body: &RawMethodBody) -> Vec<u32> {
	let mut leaders = vec![0u32];
	for instr in &body.instructions {
		match &instr.opcode {
			RawOpCode::Br | RawOpCode::Brtrue | RawOpCode::Brfalse | RawOpCode::Beq | RawOpCode::Bne | RawOpCode::Bgt | RawOpCode::Blt | RawOpCode::Ble | RawOpCode::Bge | RawOpCode::Leave => {
				if let Operand::BranchTarget(t) = &instr.operand {
					leaders.push(*t);
				}
				leaders.push(instr.offset + 1);
			}
			RawOpCode::Switch => {
				if let Operand::BranchTargets(ts) = &instr.operand {
					leaders.extend(ts.iter().copied());
				}
				leaders.push(instr.offset + 1);
			}
			RawOpCode::Ret | RawOpCode::Throw | RawOpCode::Rethrow | RawOpCode::Endfinally => {
				leaders.push(instr.offset + 1);
			}
			_ => {}
		}
	}
	for region in &body.exception_regions {
		leaders.push(region.try_start);
		leaders.push(region.try_end);
		leaders.push(region.handler_start);
		leaders.push(region.handler_end);
	}
	leaders.sort_unstable();
	leaders.dedup();
	leaders
}

fn lower_blocks<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, body: &RawMethodBody) -> Vec<(u32, Vec<Instruction<'l>>)> {
	let leaders = leader_offsets(body);
	let mut blocks = Vec::new();
	let mut stack: Vec<StackEntry> = Vec::new();

	for (block_id, window) in leaders.windows(2).enumerate() {
		let (start, end) = (window[0], window[1]);
		if let Some(snapshot) = ctx.stack_snapshots.remove(&start) {
			stack = snapshot;
		}
		let mut out = Vec::new();
		for instr in body.instructions.iter().filter(|i| i.offset >= start && i.offset < end) {
			lower_one(ctx, instr, &mut stack, &mut out, body);
		}
		blocks.push((block_id as u32, out));
	}
	if let Some(&last) = leaders.last() {
		if let Some(snapshot) = ctx.stack_snapshots.remove(&last) {
			stack = snapshot;
		}
		let mut out = Vec::new();
		for instr in body.instructions.iter().filter(|i| i.offset >= last) {
			lower_one(ctx, instr, &mut stack, &mut out, body);
		}
		if !out.is_empty() {
			blocks.push((leaders.len() as u32 - 1, out));
		}
	}
	blocks
}

fn label_for(offset: u32) -> String {
	format!("IL_{offset}")
}

fn lower_one<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, body: &RawMethodBody) {
	for region in &body.exception_regions {
		if region.try_start == instr.offset {
			out.push(mk(ctx, instr.offset, None, None, InstructionKind::TryBegin { region: region.try_start }));
		}
		if region.handler_start == instr.offset {
			match region.kind {
				ExceptionRegionKind::Catch { exception_type } => {
					out.push(mk(ctx, instr.offset, None, None, InstructionKind::CatchBegin { region: region.try_start, exception_type_cpp_name: ctx.bump.alloc_str(&mangle_type_name(exception_type)) }));
				}
				ExceptionRegionKind::Finally => {
					out.push(mk(ctx, instr.offset, None, None, InstructionKind::FinallyBegin { region: region.try_start }));
				}
			}
		}
	}

	match &instr.opcode {
		RawOpCode::Nop => {}
		RawOpCode::Dup => {
			if let Some(top) = stack.last().cloned() {
				stack.push(top);
			}
		}
		RawOpCode::Pop => {
			stack.pop();
		}
		RawOpCode::LdNull => stack.push(StackEntry::new("nullptr", Some("void*".into()))),
		RawOpCode::LdcI4 => {
			if let Operand::I32(v) = &instr.operand {
				stack.push(StackEntry::new(v.to_string(), Some("int32_t".into())));
			}
		}
		RawOpCode::LdcI8 => {
			if let Operand::I64(v) = &instr.operand {
				stack.push(StackEntry::new(v.to_string(), Some("int64_t".into())));
			}
		}
		RawOpCode::LdcR4 => {
			if let Operand::F32(v) = &instr.operand {
				stack.push(StackEntry::new(format!("{v}f"), Some("float".into())));
			}
		}
		RawOpCode::LdcR8 => {
			if let Operand::F64(v) = &instr.operand {
				stack.push(StackEntry::new(v.to_string(), Some("double".into())));
			}
		}
		RawOpCode::LdStr => {
			if let Operand::String(s) = &instr.operand {
				let id = ctx.module_strings_intern(s);
				stack.push(StackEntry::new(format!("__strings[{id}]"), Some("String*".into())));
			}
		}
		RawOpCode::LdArg => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, ty)) = ctx.resolve_param(*i) {
					stack.push(StackEntry::new(name, Some(ty.to_string())));
				}
			}
		}
		RawOpCode::LdArgA => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, _)) = ctx.resolve_param(*i) {
					stack.push(StackEntry::new(format!("&{name}"), Some("void*".into())));
				}
			}
		}
		RawOpCode::StArg => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, ty)) = ctx.resolve_param(*i).map(|(n, t)| (n.to_string(), t.to_string())) {
					if let Some(value) = stack.pop() {
						let cast_value = cast_on_store(&ty, &value);
						out.push(mk(ctx, instr.offset, None, None, InstructionKind::Assign { value: ctx.bump.alloc_str(&format!("{name} = {cast_value}")) }));
					}
				}
			}
		}
		RawOpCode::LdLoc => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, ty)) = ctx.resolve_local(*i) {
					stack.push(StackEntry::new(name, Some(ty.to_string())));
				}
			}
		}
		RawOpCode::LdLocA => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, _)) = ctx.resolve_local(*i) {
					stack.push(StackEntry::new(format!("&{name}"), Some("void*".into())));
				}
			}
		}
		RawOpCode::StLoc => {
			if let Operand::Index(i) = &instr.operand {
				if let Some((name, ty)) = ctx.resolve_local(*i).map(|(n, t)| (n.to_string(), t.to_string())) {
					if let Some(value) = stack.pop() {
						let cast_value = cast_on_store(&ty, &value);
						out.push(mk(ctx, instr.offset, None, None, InstructionKind::Assign { value: ctx.bump.alloc_str(&format!("{name} = {cast_value}")) }));
					}
				}
			}
		}
		RawOpCode::Add | RawOpCode::Sub => lower_add_sub(ctx, instr, stack, out),
		RawOpCode::Mul | RawOpCode::Div | RawOpCode::DivUn | RawOpCode::Rem | RawOpCode::RemUn => lower_simple_binop(ctx, instr, stack, out, binop_symbol(&instr.opcode)),
		RawOpCode::And | RawOpCode::Or | RawOpCode::Xor => lower_bitwise(ctx, instr, stack, out, binop_symbol(&instr.opcode)),
		RawOpCode::Shl | RawOpCode::Shr | RawOpCode::ShrUn => lower_simple_binop(ctx, instr, stack, out, binop_symbol(&instr.opcode)),
		RawOpCode::Neg => {
			if let Some(v) = stack.pop() {
				let ty = v.cpp_type.clone();
				let tmp = ctx.fresh_temp();
				out.push(mk(ctx, instr.offset, Some(&tmp), ty.as_deref(), InstructionKind::Assign { value: ctx.bump.alloc_str(&format!("-{}", v.expr)) }));
				stack.push(StackEntry::new(tmp, ty));
			}
		}
		RawOpCode::Not => {
			if let Some(v) = stack.pop() {
				let ty = v.cpp_type.clone();
				let tmp = ctx.fresh_temp();
				out.push(mk(ctx, instr.offset, Some(&tmp), ty.as_deref(), InstructionKind::Assign { value: ctx.bump.alloc_str(&format!("~{}", v.expr)) }));
				stack.push(StackEntry::new(tmp, ty));
			}
		}
		RawOpCode::Ceq | RawOpCode::Cgt | RawOpCode::CgtUn | RawOpCode::Clt | RawOpCode::CltUn => lower_compare(ctx, instr, stack, out),
		RawOpCode::Conv => {
			if let Operand::TypeRef(t) = &instr.operand {
				if let Some(v) = stack.pop() {
					let target = ctx.cpp_type_for_il(&t.il_name);
					let tmp = ctx.fresh_temp();
					out.push(mk(ctx, instr.offset, Some(&tmp), Some(&target), InstructionKind::Conversion { target_type: ctx.bump.alloc_str(&target), value: ctx.bump.alloc_str(&v.expr) }));
					stack.push(StackEntry::new(tmp, Some(target)));
				}
			}
		}
		RawOpCode::Box => lower_box(ctx, instr, stack, out),
		RawOpCode::Unbox | RawOpCode::UnboxAny => lower_unbox(ctx, instr, stack, out),
		RawOpCode::Castclass | RawOpCode::Isinst => {
			if let Operand::TypeRef(t) = &instr.operand {
				if let Some(v) = stack.pop() {
					let target = ctx.cpp_type_for_il(&t.il_name);
					let tmp = ctx.fresh_temp();
					out.push(mk(ctx, instr.offset, Some(&tmp), Some(&target), InstructionKind::Cast { target_type: ctx.bump.alloc_str(&target), value: ctx.bump.alloc_str(&v.expr) }));
					stack.push(StackEntry::new(tmp, Some(target)));
				}
			}
		}
		RawOpCode::Newobj => lower_newobj(ctx, instr, stack, out),
		RawOpCode::Newarr => {
			if let Operand::TypeRef(t) = &instr.operand {
				if let Some(len) = stack.pop() {
					let elem_ty = ctx.cpp_type_for_il(&t.il_name);
					let tmp = ctx.fresh_temp();
					let result_ty = format!("{}[]*", elem_ty.trim_end_matches('*'));
					out.push(mk(ctx, instr.offset, Some(&tmp), Some(&result_ty), InstructionKind::RawCpp {
						code: ctx.bump.alloc_str(&format!("rt::new_array<{elem_ty}>({})", len.expr)),
					}));
					stack.push(StackEntry::new(tmp, Some(result_ty)));
				}
			}
		}
		RawOpCode::Ldfld => lower_field_access(ctx, instr, stack, out, false, None),
		RawOpCode::Ldflda => lower_field_access(ctx, instr, stack, out, false, None),
		RawOpCode::Stfld => {
			if let Some(value) = stack.pop() {
				lower_field_access(ctx, instr, stack, out, false, Some(value.expr));
			}
		}
		RawOpCode::Ldsfld | RawOpCode::Ldsflda => lower_static_field(ctx, instr, stack, out, None),
		RawOpCode::Stsfld => {
			if let Some(value) = stack.pop() {
				lower_static_field(ctx, instr, stack, out, Some(value.expr));
			}
		}
		RawOpCode::Ldelem | RawOpCode::Ldelema => {
			if let (Some(idx), Some(arr)) = (stack.pop(), stack.pop()) {
				let tmp = ctx.fresh_temp();
				let elem_ty = arr.cpp_type.clone().unwrap_or_else(|| "void*".into());
				out.push(mk(ctx, instr.offset, Some(&tmp), Some(&elem_ty), InstructionKind::RawCpp {
					code: ctx.bump.alloc_str(&format!("{}->data[{}]", arr.expr, idx.expr)),
				}));
				stack.push(StackEntry::new(tmp, Some(elem_ty)));
			}
		}
		RawOpCode::Stelem => {
			if let (Some(value), Some(idx), Some(arr)) = (stack.pop(), stack.pop(), stack.pop()) {
				out.push(mk(ctx, instr.offset, None, None, InstructionKind::Assign {
					value: ctx.bump.alloc_str(&format!("{}->data[{}] = {}", arr.expr, idx.expr, value.expr)),
				}));
			}
		}
		RawOpCode::Ldlen => {
			if let Some(arr) = stack.pop() {
				let tmp = ctx.fresh_temp();
				out.push(mk(ctx, instr.offset, Some(&tmp), Some("int32_t"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("{}->length", arr.expr)) }));
				stack.push(StackEntry::new(tmp, Some("int32_t".into())));
			}
		}
		RawOpCode::Call | RawOpCode::Callvirt | RawOpCode::Calli => {
			let constrained = ctx.pending_constrained.take();
			lower_call(ctx, instr, stack, out, constrained.as_deref());
		}
		RawOpCode::Constrained => {
			if let Operand::TypeRef(t) = &instr.operand {
				ctx.pending_constrained = Some(t.il_name.clone());
			}
		}
		RawOpCode::Ret => {
			let value = stack.pop().map(|v| v.expr);
			out.push(mk(ctx, instr.offset, None, None, InstructionKind::Return { value: value.map(|v| ctx.bump.alloc_str(&v) as &str) }));
		}
		RawOpCode::Br | RawOpCode::Leave => {
			if let Operand::BranchTarget(t) = &instr.operand {
				if !stack.is_empty() {
					ctx.stack_snapshots.insert(*t, stack.clone());
				}
				out.push(mk(ctx, instr.offset, None, None, InstructionKind::ConditionalBranch { condition: "true", true_label: ctx.bump.alloc_str(&label_for(*t)), false_label: None }));
			}
		}
		RawOpCode::Brtrue | RawOpCode::Brfalse => {
			if let (Operand::BranchTarget(t), Some(cond)) = (&instr.operand, stack.pop()) {
				let condition = if matches!(instr.opcode, RawOpCode::Brfalse) { format!("!({})", cond.expr) } else { cond.expr.clone() };
				if !stack.is_empty() {
					ctx.stack_snapshots.insert(*t, stack.clone());
				}
				out.push(mk(ctx, instr.offset, None, None, InstructionKind::ConditionalBranch { condition: ctx.bump.alloc_str(&condition), true_label: ctx.bump.alloc_str(&label_for(*t)), false_label: Some(ctx.bump.alloc_str(&label_for(instr.offset + 1))) }));
			}
		}
		RawOpCode::Beq | RawOpCode::Bne | RawOpCode::Bgt | RawOpCode::Blt | RawOpCode::Ble | RawOpCode::Bge => {
			if let (Operand::BranchTarget(t), Some(rhs), Some(lhs)) = (&instr.operand, stack.pop(), stack.pop()) {
				let sym = match instr.opcode {
					RawOpCode::Beq => "==",
					RawOpCode::Bne => "!=",
					RawOpCode::Bgt => ">",
					RawOpCode::Blt => "<",
					RawOpCode::Ble => "<=",
					_ => ">=",
				};
				let condition = format!("{} {} {}", lhs.expr, sym, rhs.expr);
				if !stack.is_empty() {
					ctx.stack_snapshots.insert(*t, stack.clone());
				}
				out.push(mk(ctx, instr.offset, None, None, InstructionKind::ConditionalBranch { condition: ctx.bump.alloc_str(&condition), true_label: ctx.bump.alloc_str(&label_for(*t)), false_label: Some(ctx.bump.alloc_str(&label_for(instr.offset + 1))) }));
			}
		}
		RawOpCode::Switch => {
			if let Operand::BranchTargets(targets) = &instr.operand {
				if let Some(selector) = stack.pop() {
					let arms: String = targets.iter().enumerate().map(|(i, t)| format!("case {i}: goto {};", label_for(*t))).collect::<Vec<_>>().join(" ");
					out.push(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("switch ({}) {{ {} }}", selector.expr, arms)) }));
				}
			}
		}
		RawOpCode::Throw => {
			if let Some(v) = stack.pop() {
				out.push(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("throw {};", v.expr)) }));
			}
		}
		RawOpCode::Rethrow => out.push(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: "throw;" })),
		RawOpCode::Endfinally => out.push(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: "/* endfinally */" })),
		RawOpCode::Initobj => {
			if let Operand::TypeRef(t) = &instr.operand {
				if let Some(target) = stack.pop() {
					let cpp_type = ctx.cpp_type_for_il(&t.il_name);
					out.push(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("memset({}, 0, sizeof({}))", target.expr, cpp_type.trim_end_matches('*'))) }));
				}
			}
		}
		RawOpCode::Ldtoken => {
			if let Operand::TypeRef(t) = &instr.operand {
				let name = mangle_type_name(&t.il_name);
				let tmp = ctx.fresh_temp();
				out.push(mk(ctx, instr.offset, Some(&tmp), Some("void*"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("&{name}_TypeInfo")) }));
				stack.push(StackEntry::new(tmp, Some("void*".into())));
			}
		}
		RawOpCode::Sizeof => {
			if let Operand::TypeRef(t) = &instr.operand {
				let cpp_type = ctx.cpp_type_for_il(&t.il_name);
				let tmp = ctx.fresh_temp();
				out.push(mk(ctx, instr.offset, Some(&tmp), Some("uint32_t"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&format!("sizeof({})", cpp_type.trim_end_matches('*'))) }));
				stack.push(StackEntry::new(tmp, Some("uint32_t".into())));
			}
		}
		RawOpCode::Ldftn | RawOpCode::Ldvirtftn => {
			if let Operand::MethodRef(m) = &instr.operand {
				let name = format!("{}_{}", mangle_type_name(&m.declaring_type), mangle_type_name(&m.method_name));
				stack.push(StackEntry::new(format!("&{name}"), Some("void*".into())));
			}
		}
		RawOpCode::Other(_) => {}
	}

	for region in &body.exception_regions {
		if region.try_end == instr.offset + 1 {
			out.push(mk(ctx, instr.offset, None, None, InstructionKind::TryEnd { region: region.try_start }));
		}
		if region.handler_end == instr.offset + 1 {
			match region.kind {
				ExceptionRegionKind::Catch { .. } => out.push(mk(ctx, instr.offset, None, None, InstructionKind::CatchEnd { region: region.try_start })),
				ExceptionRegionKind::Finally => out.push(mk(ctx, instr.offset, None, None, InstructionKind::FinallyEnd { region: region.try_start })),
			}
		}
	}
}

fn binop_symbol(op: &RawOpCode) -> &'static str {
	match op {
		RawOpCode::Mul => "*",
		RawOpCode::Div | RawOpCode::DivUn => "/",
		RawOpCode::Rem | RawOpCode::RemUn => "%",
		RawOpCode::And => "&",
		RawOpCode::Or => "|",
		RawOpCode::Xor => "^",
		RawOpCode::Shl => "<<",
		RawOpCode::Shr | RawOpCode::ShrUn => ">>",
		_ => "?",
	}
}

fn mk<'l>(ctx: &LowerCtx<'_, 'l>, offset: u32, result_var: Option<&str>, result_type: Option<&str>, kind: InstructionKind<'l>) -> Instruction<'l> {
	Instruction {
		offset,
		result_var: result_var.map(|v| ctx.bump.alloc_str(v) as &str),
		result_type_cpp: result_type.map(|t| ctx.bump.alloc_str(t) as &str),
		kind,
	}
}

fn cast_on_store(target_cpp_type: &str, value: &StackEntry) -> String {
	if target_cpp_type.ends_with('*') {
		if target_cpp_type == "void*" || target_cpp_type == "uintptr_t" {
			return format!("({target_cpp_type})(void*){}", value.expr);
		}
		if value.cpp_type.as_deref() == Some("uintptr_t") || value.cpp_type.as_deref() == Some("intptr_t") {
			return format!("({target_cpp_type})(void*){}", value.expr);
		}
		if value.is_pointer() && value.cpp_type.as_deref() != Some(target_cpp_type) {
			return format!("({target_cpp_type})(void*){}", value.expr);
		}
	}
	value.expr.clone()
}

/// §4.4 "Pointer arithmetic": CIL's byte-granularity `add`/`sub` on typed pointers, rewritten
/// through a `uint8_t*` cast so C++'s element-scaled pointer arithmetic doesn't double-scale.
fn lower_add_sub<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>) {
	let Some(rhs) = stack.pop() else { return };
	let Some(lhs) = stack.pop() else { return };
	let is_sub = matches!(instr.opcode, RawOpCode::Sub);

	let lhs_ptr = lhs.is_pointer() && pointer_element(lhs.cpp_type.as_deref().unwrap_or("")).is_some();
	let rhs_ptr = rhs.is_pointer() && pointer_element(rhs.cpp_type.as_deref().unwrap_or("")).is_some();

	if lhs_ptr && rhs_ptr {
		let tmp = ctx.fresh_temp();
		let expr = format!("(intptr_t)((uint8_t*){} - (uint8_t*){})", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some("intptr_t"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some("intptr_t".into())));
		return;
	}
	if lhs_ptr && !rhs_ptr {
		let ptr_ty = lhs.cpp_type.clone().unwrap();
		let sym = if is_sub { "-" } else { "+" };
		let tmp = ctx.fresh_temp();
		let expr = format!("({ptr_ty})((uint8_t*){} {sym} {})", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&ptr_ty), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some(ptr_ty)));
		return;
	}
	if rhs_ptr && !lhs_ptr && !is_sub {
		let ptr_ty = rhs.cpp_type.clone().unwrap();
		let tmp = ctx.fresh_temp();
		let expr = format!("({ptr_ty})((uint8_t*){} + {})", rhs.expr, lhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&ptr_ty), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some(ptr_ty)));
		return;
	}

	let sym = if is_sub { "-" } else { "+" };
	let result_ty = lhs.cpp_type.clone().or_else(|| rhs.cpp_type.clone()).unwrap_or_else(|| "int32_t".into());
	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), Some(&result_ty), InstructionKind::BinaryOp { op: ctx.bump.alloc_str(sym), lhs: ctx.bump.alloc_str(&lhs.expr), rhs: ctx.bump.alloc_str(&rhs.expr) }));
	stack.push(StackEntry::new(tmp, Some(result_ty)));
}

fn lower_simple_binop<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, sym: &'static str) {
	let Some(rhs) = stack.pop() else { return };
	let Some(lhs) = stack.pop() else { return };
	let result_ty = lhs.cpp_type.clone().or_else(|| rhs.cpp_type.clone()).unwrap_or_else(|| "int32_t".into());
	let tmp = ctx.fresh_temp();
	if matches!(instr.opcode, RawOpCode::DivUn | RawOpCode::RemUn) {
		let fn_name = if matches!(instr.opcode, RawOpCode::DivUn) { "unsigned_div" } else { "unsigned_rem" };
		let expr = format!("rt::{fn_name}(rt::to_unsigned({}), rt::to_unsigned({}))", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&result_ty), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
	} else {
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&result_ty), InstructionKind::BinaryOp { op: ctx.bump.alloc_str(sym), lhs: ctx.bump.alloc_str(&lhs.expr), rhs: ctx.bump.alloc_str(&rhs.expr) }));
	}
	stack.push(StackEntry::new(tmp, Some(result_ty)));
}

/// §4.4 "Bitwise operations": `&`/`|`/`^` on pointer operands must route through `uintptr_t`
/// (C++ forbids bitwise ops directly on pointer types).
fn lower_bitwise<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, sym: &'static str) {
	let Some(rhs) = stack.pop() else { return };
	let Some(lhs) = stack.pop() else { return };
	if lhs.is_pointer() || rhs.is_pointer() {
		let tmp = ctx.fresh_temp();
		let expr = format!("(uintptr_t){} {sym} (uintptr_t){}", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some("uintptr_t"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some("uintptr_t".into())));
		return;
	}
	let result_ty = lhs.cpp_type.clone().or_else(|| rhs.cpp_type.clone()).unwrap_or_else(|| "int32_t".into());
	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), Some(&result_ty), InstructionKind::BinaryOp { op: ctx.bump.alloc_str(sym), lhs: ctx.bump.alloc_str(&lhs.expr), rhs: ctx.bump.alloc_str(&rhs.expr) }));
	stack.push(StackEntry::new(tmp, Some(result_ty)));
}

/// §4.4 "Comparisons": `cgt.un`/`clt.un` against `nullptr` become idiomatic `!=` null checks;
/// pointer equality casts both sides to `void*`; unsigned comparisons route through helpers.
fn lower_compare<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>) {
	let Some(rhs) = stack.pop() else { return };
	let Some(lhs) = stack.pop() else { return };
	let tmp = ctx.fresh_temp();

	let is_null = |e: &StackEntry| e.expr == "nullptr";
	if matches!(instr.opcode, RawOpCode::CgtUn | RawOpCode::CltUn) && (is_null(&lhs) || is_null(&rhs)) {
		out.push(mk(ctx, instr.offset, Some(&tmp), Some("bool"), InstructionKind::BinaryOp { op: "!=", lhs: ctx.bump.alloc_str(&lhs.expr), rhs: ctx.bump.alloc_str(&rhs.expr) }));
		stack.push(StackEntry::new(tmp, Some("bool".into())));
		return;
	}

	if matches!(instr.opcode, RawOpCode::Ceq) && (lhs.is_pointer() || rhs.is_pointer()) {
		let expr = format!("(void*){} == (void*){}", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some("bool"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some("bool".into())));
		return;
	}

	if matches!(instr.opcode, RawOpCode::CgtUn | RawOpCode::CltUn) {
		let fn_name = if matches!(instr.opcode, RawOpCode::CgtUn) { "unsigned_gt" } else { "unsigned_lt" };
		let expr = format!("rt::{fn_name}({}, {})", lhs.expr, rhs.expr);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some("bool"), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&expr) }));
		stack.push(StackEntry::new(tmp, Some("bool".into())));
		return;
	}

	let sym = match instr.opcode {
		RawOpCode::Ceq => "==",
		RawOpCode::Cgt => ">",
		RawOpCode::Clt => "<",
		_ => "==",
	};
	out.push(mk(ctx, instr.offset, Some(&tmp), Some("bool"), InstructionKind::BinaryOp { op: ctx.bump.alloc_str(sym), lhs: ctx.bump.alloc_str(&lhs.expr), rhs: ctx.bump.alloc_str(&rhs.expr) }));
	stack.push(StackEntry::new(tmp, Some("bool".into())));
}

fn lower_box<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>) {
	let Operand::TypeRef(t) = &instr.operand else { return };
	let Some(v) = stack.pop() else { return };
	let cpp_type = mangle_type_name(&t.il_name);
	let type_info = format!("&{cpp_type}_TypeInfo");
	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), Some("Object*"), InstructionKind::Box { value: ctx.bump.alloc_str(&v.expr), type_info_symbol: ctx.bump.alloc_str(&type_info) }));
	stack.push(StackEntry::new(tmp, Some("Object*".into())));
}

fn lower_unbox<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>) {
	let Operand::TypeRef(t) = &instr.operand else { return };
	let Some(v) = stack.pop() else { return };
	let target = ctx.cpp_type_for_il(&t.il_name).trim_end_matches('*').to_string();
	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), Some(&format!("{target}*")), InstructionKind::Unbox { target_type: ctx.bump.alloc_str(&target), value: ctx.bump.alloc_str(&v.expr) }));
	stack.push(StackEntry::new(tmp, Some(format!("{target}*"))));
}

impl<'a, 'l> LowerCtx<'a, 'l> {
	/// §37: interns `s` into the module-wide string pool, returning its stable id. Distinct
	/// literals get distinct ids; repeats of the same literal collapse onto the first one's.
	fn module_strings_intern(&mut self, s: &str) -> u32 {
		self.module.strings.intern(self.bump, s)
	}
}

/// §4.4 "Field access": emits a `FieldAccess` instruction for a load or store.
fn lower_field_access<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, is_load_address: bool, store_value: Option<String>) {
	let Operand::FieldRef(f) = &instr.operand else { return };
	let Some(object) = stack.pop() else { return };
	let declaring_is_value = ctx.params.value_types.contains(&f.declaring_type);
	let accessor = ctx.field_accessor(&object.expr, object.cpp_type.as_deref(), declaring_is_value);
	let field_cpp_name = format!("f_{}", f.field_name.rsplit('.').next().unwrap_or(&f.field_name));

	if let Some(value) = store_value {
		out.push(mk(ctx, instr.offset, None, None, InstructionKind::FieldAccess(FieldAccessInstr {
			object_expr: ctx.bump.alloc_str(&object.expr),
			field_cpp_name: ctx.bump.alloc_str(&field_cpp_name),
			cast_to_type: None,
			accessor,
			store_value: Some(ctx.bump.alloc_str(&value)),
		})));
		return;
	}

	let tmp = ctx.fresh_temp();
	let accessor_str = if accessor == FieldAccessor::Arrow { "->" } else { "." };
	let prefix = if is_load_address { "&" } else { "" };
	let expr = format!("{prefix}{}{accessor_str}{field_cpp_name}", object.expr);
	out.push(mk(ctx, instr.offset, Some(&tmp), None, InstructionKind::FieldAccess(FieldAccessInstr {
		object_expr: ctx.bump.alloc_str(&object.expr),
		field_cpp_name: ctx.bump.alloc_str(&field_cpp_name),
		cast_to_type: None,
		accessor,
		store_value: None,
	})));
	stack.push(StackEntry::new(expr, None));
}

fn lower_static_field<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, store_value: Option<String>) {
	let Operand::FieldRef(f) = &instr.operand else { return };
	let declaring_type_cpp_name = mangle_type_name(&f.declaring_type);
	let field_cpp_name = format!("s_{}", f.field_name);

	if let Some(value) = store_value {
		out.push(mk(ctx, instr.offset, None, None, InstructionKind::StaticFieldAccess(StaticFieldAccessInstr {
			declaring_type_cpp_name: ctx.bump.alloc_str(&declaring_type_cpp_name),
			field_cpp_name: ctx.bump.alloc_str(&field_cpp_name),
			store_value: Some(ctx.bump.alloc_str(&value)),
		})));
		return;
	}

	let tmp = ctx.fresh_temp();
	let expr = format!("{declaring_type_cpp_name}::{field_cpp_name}");
	out.push(mk(ctx, instr.offset, Some(&tmp), None, InstructionKind::StaticFieldAccess(StaticFieldAccessInstr {
		declaring_type_cpp_name: ctx.bump.alloc_str(&declaring_type_cpp_name),
		field_cpp_name: ctx.bump.alloc_str(&field_cpp_name),
		store_value: None,
	})));
	stack.push(StackEntry::new(expr, None));
}

/// §4.4 "Newobj": six distinct forms selected by the target type's category.
/// True for `.ctor(object, native int)` on a type the module already knows is a delegate, or —
/// for a BCL delegate type not yet in the module (`System.Action`, `System.EventHandler`, ...) —
/// recognized by name (§4.4 "Newobj", "Delegates"). The driver's external-delegate discovery pass
/// registers a minimal shell for the latter case once the body is lowered.
fn is_delegate_type(ctx: &LowerCtx, declaring_type: &str) -> bool {
	if let Some(t) = ctx.module.find_type(declaring_type) {
		return t.flags.get().contains(crate::module::TypeIrFlags::IS_DELEGATE);
	}
	let bare = declaring_type.rsplit(['.', '/', '+']).next().unwrap_or(declaring_type);
	bare.ends_with("Delegate")
		|| matches!(declaring_type, "System.Delegate" | "System.MulticastDelegate" | "System.EventHandler")
		|| declaring_type.starts_with("System.Action`")
		|| declaring_type.starts_with("System.Action")
		|| declaring_type.starts_with("System.Func`")
		|| declaring_type.starts_with("System.Predicate`")
		|| declaring_type.starts_with("System.Comparison`")
}

fn lower_newobj<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>) {
	let Operand::MethodRef(m) = &instr.operand else { return };
	let arity = m.parameter_types.len();
	let mut args: Vec<String> = (0..arity).filter_map(|_| stack.pop()).map(|e| e.expr).collect();
	args.reverse();

	if arity == 2 && is_delegate_type(ctx, &m.declaring_type) {
		let target_object = args[0].clone();
		let function_cpp_name = args[1].clone();
		let delegate_type_cpp_name = mangle_type_name(&m.declaring_type);
		let cpp_type = format!("{delegate_type_cpp_name}*");
		let tmp = ctx.fresh_temp();
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&cpp_type), InstructionKind::DelegateCreate {
			target_object: ctx.bump.alloc_str(&target_object),
			function_cpp_name: ctx.bump.alloc_str(&function_cpp_name),
			delegate_type_cpp_name: ctx.bump.alloc_str(&delegate_type_cpp_name),
		}));
		stack.push(StackEntry::new(tmp, Some(cpp_type)));
		return;
	}

	if let Some(span_kind) = span_ctor_kind(&m.declaring_type, &args) {
		let tmp = ctx.fresh_temp();
		let cpp_type = mangle_type_name(&m.declaring_type);
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&cpp_type), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&span_kind) }));
		stack.push(StackEntry::new(tmp, Some(cpp_type)));
		return;
	}

	if name_mapper::is_bcl_exception_type(&m.declaring_type) {
		let alias = name_mapper::bcl_exception_alias(&m.declaring_type).unwrap();
		let tmp = ctx.fresh_temp();
		let message = args.first().cloned().unwrap_or_else(|| "nullptr".into());
		let code = format!("rt::alloc_exception<{alias}>(&{}_TypeInfo, {message})", mangle_type_name(&m.declaring_type));
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&format!("{alias}*")), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&code) }));
		stack.push(StackEntry::new(tmp, Some(format!("{alias}*"))));
		return;
	}

	let is_value_type = ctx.params.value_types.contains(&m.declaring_type);
	let cpp_type = mangle_type_name(&m.declaring_type);
	let ctor_name = format!("{cpp_type}_ctor");
	let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();

	if is_value_type {
		let local_name = ctx.fresh_temp();
		out.push(mk(ctx, instr.offset, None, None, InstructionKind::DeclareLocal { name: ctx.bump.alloc_str(&local_name), cpp_type: ctx.bump.alloc_str(&cpp_type) }));
		let mut full_args = vec![format!("&{local_name}")];
		full_args.extend(args.iter().cloned());
		out.push(mk(ctx, instr.offset, None, None, InstructionKind::NewObj(NewObjInstr {
			type_cpp_name: ctx.bump.alloc_str(&cpp_type),
			ctor_name: ctx.bump.alloc_str(&ctor_name),
			ctor_args: ctx.bump.alloc_slice_fill_iter(full_args.iter().map(|a| ctx.bump.alloc_str(a) as &str)),
			kind: NewObjKind::ValueTypeLocal,
		})));
		stack.push(StackEntry::new(local_name, Some(cpp_type)));
		return;
	}

	if matches!(m.declaring_type.as_str(), "System.Object" | "System.String" | "System.Array") {
		let tmp = ctx.fresh_temp();
		out.push(mk(ctx, instr.offset, Some(&tmp), Some(&format!("{cpp_type}*")), InstructionKind::NewObj(NewObjInstr {
			type_cpp_name: ctx.bump.alloc_str(&cpp_type),
			ctor_name: ctx.bump.alloc_str(&ctor_name),
			ctor_args: ctx.bump.alloc_slice_copy(&arg_refs),
			kind: NewObjKind::RuntimeAllocated,
		})));
		stack.push(StackEntry::new(tmp, Some(format!("{cpp_type}*"))));
		return;
	}

	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), Some(&format!("{cpp_type}*")), InstructionKind::NewObj(NewObjInstr {
		type_cpp_name: ctx.bump.alloc_str(&cpp_type),
		ctor_name: ctx.bump.alloc_str(&ctor_name),
		ctor_args: ctx.bump.alloc_slice_copy(&arg_refs),
		kind: NewObjKind::PlainHeap,
	})));
	stack.push(StackEntry::new(tmp, Some(format!("{cpp_type}*"))));
}

fn span_ctor_kind(declaring_type: &str, args: &[String]) -> Option<String> {
	if !declaring_type.starts_with("System.Span") && !declaring_type.starts_with("System.ReadOnlySpan") {
		return None;
	}
	Some(match args.len() {
		0 => "{ nullptr, 0 }".to_string(),
		1 => format!("{{ {}, {}->length }}", args[0], args[0]),
		2 => format!("{{ {}, {} }}", args[0], args[1]),
		_ => format!("{{ {}, {} }}", args[0], args[1]),
	})
}

/// §4.4 "Method calls": the largest single responsibility, the 11-step pipeline.
fn lower_call<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, out: &mut Vec<Instruction<'l>>, constrained_type: Option<&str>) {
	let Operand::MethodRef(m) = &instr.operand else { return };

	// Step 1: intrinsic interception.
	if let Some(kind) = intrinsic::try_lower(ctx, instr, m, stack) {
		out.push(kind);
		return;
	}

	let arity = m.parameter_types.len();
	let mut fixed_args: Vec<StackEntry> = (0..arity).filter_map(|_| stack.pop()).collect();
	fixed_args.reverse();

	// Resolved once, up front, so both the icall path (step 3) and the ordinary call path
	// (step 7) can read the callee's `HAS_VARARGS` flag off the same shell lookup.
	let param_type_refs: Vec<&str> = m.parameter_types.iter().map(String::as_str).collect();
	let is_varargs = ctx
		.module
		.find_type(&m.declaring_type)
		.and_then(|t| t.methods.get().iter().find(|mm| mm.signature_matches(&m.method_name, &param_type_refs)))
		.map(|mm| mm.flags.get().contains(crate::module::MethodIrFlags::HAS_VARARGS))
		.unwrap_or(false);

	// Callers that are instance calls also pop `this`; `MethodRefOperand` doesn't carry a static
	// flag so we infer it from whether a receiver remains that matches the declaring type shape.
	// Constructors (handled via Newobj) never reach here.
	let this_entry = if matches!(m.method_name.as_str(), "op_Implicit" | "op_Explicit") { None } else { stack.pop() };

	// Step 2: static-ctor guard for static calls on a type with a cctor.
	if this_entry.is_none() {
		if let Some(guard_target) = ctx.module.find_type(&m.declaring_type).filter(|t| t.flags.get().contains(crate::module::TypeIrFlags::HAS_CCTOR)).map(|t| t.cpp_name.get()) {
			out.push(mk(ctx, instr.offset, None, None, InstructionKind::StaticCtorGuard { type_cpp_name: ctx.bump.alloc_str(guard_target) }));
		}
	}

	// Step 3: icall registry lookup.
	if let Some(symbol) = ctx.params.icalls.lookup(&m.declaring_type, &m.method_name, &m.parameter_types) {
		let symbol = symbol.to_string();
		let mut args: Vec<&str> = Vec::new();
		let this_str;
		if let Some(this) = &this_entry {
			this_str = format!("(void*){}", this.expr);
			args.push(ctx.bump.alloc_str(&this_str));
		}
		let arg_strs: Vec<String> = fixed_args.iter().map(|a| a.expr.clone()).collect();
		args.extend(arg_strs.iter().map(|s| ctx.bump.alloc_str(s) as &str));
		if is_varargs {
			args.push("rt::make_vararg_handle()");
		}
		let tmp = ctx.fresh_temp();
		out.push(mk(ctx, instr.offset, Some(&tmp), None, InstructionKind::Call(CallInstr {
			function_name: ctx.bump.alloc_str(&symbol),
			arguments: ctx.bump.alloc_slice_copy(&args),
			dispatch: CallDispatch::Direct,
			vtable_return_type: None,
			vtable_param_types: &[],
			interface_type_cpp_name: None,
			icall_symbol: Some(ctx.bump.alloc_str(&symbol)),
			is_varargs,
		})));
		stack.push(StackEntry::new(tmp, None));
		return;
	}

	// Step 4: generic-instance-method resolution / transitive registration.
	if !m.method_generic_args.is_empty() {
		ctx.generics.register_method_instantiation(&m.declaring_type, &m.method_name, &m.method_generic_args, &m.parameter_types);
	}

	// A constrained call whose receiver type has its own override resolves directly to that
	// override rather than through the interface/base vtable (§4.4 point 11).
	let constrained_has_override = constrained_type
		.and_then(|n| ctx.module.find_type(n))
		.map(|t| t.methods.get().iter().any(|mm| mm.name == m.method_name))
		.unwrap_or(false);

	// Step 5: mangle the callee name, append return-type mangling for conversion operators, then
	// consult the disambiguation map. A constrained call with its own override mangles against the
	// receiver's concrete type instead of the interface/base the call site names.
	let name_source_type = match constrained_type {
		Some(n) if constrained_has_override => n,
		_ => m.declaring_type.as_str(),
	};
	let mut base_name = format!("{}_{}", mangle_type_name(name_source_type), mangle_type_name(&m.method_name));
	if matches!(m.method_name.as_str(), "op_Explicit" | "op_Implicit") {
		if let Some(ret) = m.parameter_types.first() {
			base_name = name_mapper::mangle_conversion_operator(&base_name, &mangle_type_name(ret));
		}
	}
	let il_signature = m.parameter_types.join(",");
	let resolved_name = resolve_call_site_name(ctx.module, &base_name, &il_signature).to_string();

	// Step 6/9: build the argument list, casting each fixed arg through a `void*` intermediate.
	let mut args: Vec<String> = Vec::new();

	// Step 8: instance `this`, cast through `void*` when needed. A constrained prefix (§4.4 point
	// 11) rewrites `this` per the box-or-direct-dispatch decision before the ordinary cast rules
	// would otherwise apply.
	if let Some(this) = &this_entry {
		let declaring_cpp = mangle_type_name(&m.declaring_type);
		if let Some(constrained_il_name) = constrained_type {
			let rewritten = lower_constrained_call(ctx.module, constrained_il_name, &m.method_name, &this.expr);
			args.push(rewritten);
		} else if matches!(m.declaring_type.as_str(), "System.Object") {
			args.push(format!("(void*){}", this.expr));
		} else {
			args.push(format!("({declaring_cpp}*)(void*){}", this.expr));
		}
	}
	for (arg, param_ty) in fixed_args.iter().zip(m.parameter_types.iter()) {
		let target = mangle_type_name(param_ty);
		if Primitive::from_il_name(param_ty).is_some() || ctx.params.value_types.contains(param_ty) {
			args.push(arg.expr.clone());
		} else {
			args.push(format!("({target}*)(void*){}", arg.expr));
		}
	}

	// Step 7: varargs handling.
	if is_varargs {
		args.push("rt::make_vararg_handle()".to_string());
	}

	// Step 10: virtual dispatch resolution.
	let dispatch_type = ctx.module.find_type(&m.declaring_type);
	let dispatch = if constrained_has_override {
		CallDispatch::Direct
	} else {
	match dispatch_type {
		Some(t) if t.is_interface() => {
			let slot = t.methods.get().iter().filter(|mm| !mm.flags.get().contains(crate::module::MethodIrFlags::IS_CONSTRUCTOR)).position(|mm| mm.signature_matches(&m.method_name, &m.parameter_types.iter().map(String::as_str).collect::<Vec<_>>()));
			match slot {
				Some(s) => CallDispatch::InterfaceVirtual { interface_type_cpp_name: ctx.bump.alloc_str(&mangle_type_name(&m.declaring_type)), slot: s as u32 },
				None => CallDispatch::Direct,
			}
		}
		Some(t) => {
			let slot = t.vtable.get().iter().find(|e| e.method_name == m.method_name).map(|e| e.slot);
			match slot {
				Some(s) => CallDispatch::ClassVirtual { slot: s },
				None => CallDispatch::Direct,
			}
		}
		None if matches!(m.method_name.as_str(), "ToString" | "Equals" | "GetHashCode") && matches!(m.declaring_type.as_str(), "System.Object") => {
			let slot = match m.method_name.as_str() {
				"ToString" => 0,
				"Equals" => 1,
				_ => 2,
			};
			CallDispatch::ClassVirtual { slot }
		}
		None => CallDispatch::Direct,
	}
	};

	let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
	let tmp = ctx.fresh_temp();
	out.push(mk(ctx, instr.offset, Some(&tmp), None, InstructionKind::Call(CallInstr {
		function_name: ctx.bump.alloc_str(&resolved_name),
		arguments: ctx.bump.alloc_slice_copy(&arg_refs),
		dispatch,
		vtable_return_type: None,
		vtable_param_types: &[],
		interface_type_cpp_name: None,
		icall_symbol: None,
		is_varargs,
	})));
	stack.push(StackEntry::new(tmp, None));
}

/// §4.4 "Constrained calls" (point 11): box-or-direct-dispatch decision for value-type receivers.
pub fn lower_constrained_call<'l>(ctx_module: &Module<'l>, constrained_type_il_name: &str, method_name: &str, this_expr: &str) -> String {
	let Some(ty) = ctx_module.find_type(constrained_type_il_name) else {
		return format!("rt::box_raw(&{this_expr}, sizeof({this_expr}), nullptr)");
	};
	let has_override = ty.methods.get().iter().any(|m| m.name == method_name);
	if has_override {
		strip_balanced_cast(this_expr).to_string()
	} else if let Some(sym) = intrinsic_operator_symbol(method_name) {
		sym.to_string()
	} else {
		let type_info = format!("&{}_TypeInfo", ty.cpp_name.get());
		format!("rt::box_raw(&{this_expr}, sizeof({}), {type_info})", ty.cpp_name.get())
	}
}

mod intrinsic {
	use super::*;
	use crate::reader_model::MethodRefOperand;

	/// §4.4 "Intrinsic catalog": call sites intercepted with inline C++. Returns `Some` when `m`
	/// named a known intrinsic and pushes its result onto `stack`; `None` falls through to
	/// ordinary call lowering.
	pub fn try_lower<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, m: &MethodRefOperand, stack: &mut Vec<StackEntry>) -> Option<Instruction<'l>> {
		let arity = m.parameter_types.len();
		match (m.declaring_type.as_str(), m.method_name.as_str()) {
			("System.Runtime.CompilerServices.Unsafe", "SizeOf") => {
				let arg = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "void".into());
				push_rawcpp(ctx, instr, stack, "uint32_t", format!("sizeof({arg})"))
			}
			("System.Runtime.CompilerServices.Unsafe", "As") => {
				let v = stack.pop()?;
				let target = m.method_generic_args.last().map(|a| format!("{}*", mangle_type_name(a))).unwrap_or_else(|| "void*".into());
				push_rawcpp(ctx, instr, stack, &target, format!("({target})(void*){}", v.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "AsRef") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("(void*){}", v.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "AsPointer") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("(void*)&{}", v.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "Add" | "AddByteOffset") if arity == 2 => {
				let offset = stack.pop()?;
				let base = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("(uint8_t*){} + {}", base.expr, offset.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "Subtract" | "SubtractByteOffset") if arity == 2 => {
				let offset = stack.pop()?;
				let base = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("(uint8_t*){} - {}", base.expr, offset.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "AreSame") => {
				let b = stack.pop()?;
				let a = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "bool", format!("(void*)&{} == (void*)&{}", a.expr, b.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "ByteOffset") => {
				let b = stack.pop()?;
				let a = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "intptr_t", format!("(intptr_t)((uint8_t*)&{} - (uint8_t*)&{})", b.expr, a.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "IsNullRef") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "bool", format!("&{} == nullptr", v.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "NullRef") => push_rawcpp(ctx, instr, stack, "void*", "nullptr".to_string()),
			("System.Runtime.CompilerServices.Unsafe", "SkipInit") => push_rawcpp(ctx, instr, stack, "void", "/* skipinit */".to_string()),
			("System.Runtime.CompilerServices.Unsafe", "CopyBlock" | "CopyBlockUnaligned") => {
				let len = stack.pop()?;
				let src = stack.pop()?;
				let dst = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void", format!("memcpy({}, {}, {})", dst.expr, src.expr, len.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "InitBlock" | "InitBlockUnaligned") => {
				let len = stack.pop()?;
				let val = stack.pop()?;
				let dst = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void", format!("memset({}, {}, {})", dst.expr, val.expr, len.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "ReadUnaligned") => {
				let ptr = stack.pop()?;
				let ty = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "int32_t".into());
				push_rawcpp(ctx, instr, stack, &ty, format!("*({ty}*){}", ptr.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "WriteUnaligned") => {
				let val = stack.pop()?;
				let ptr = stack.pop()?;
				let ty = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "int32_t".into());
				push_rawcpp(ctx, instr, stack, "void", format!("*({ty}*){} = {}", ptr.expr, val.expr))
			}
			("System.Runtime.CompilerServices.Unsafe", "Unbox") => {
				let v = stack.pop()?;
				let ty = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "void".into());
				push_rawcpp(ctx, instr, stack, &format!("{ty}*"), format!("({ty}*)rt::unbox_raw({})", v.expr))
			}
			("System.Runtime.CompilerServices.RuntimeHelpers", "InitializeArray") => {
				let field = stack.pop()?;
				let arr = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void", format!("rt::initialize_array({}, {})", arr.expr, field.expr))
			}
			("System.Runtime.CompilerServices.RuntimeHelpers", "GetSubArray") => {
				let range = stack.pop()?;
				let arr = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("rt::get_sub_array({}, {})", arr.expr, range.expr))
			}
			("System.Runtime.CompilerServices.RuntimeHelpers", "CreateSpan") => {
				let field = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("rt::create_span({})", field.expr))
			}
			("System.Runtime.CompilerServices.RuntimeHelpers", "IsReferenceOrContainsReferences") => {
				let contains_refs = m.method_generic_args.first().map(|a| !ctx.params.value_types.contains(a)).unwrap_or(true);
				push_rawcpp(ctx, instr, stack, "bool", if contains_refs { "true".to_string() } else { "false".to_string() })
			}
			("System.Runtime.InteropServices.MemoryMarshal", "GetReference" | "GetNonNullPinnableReference" | "GetArrayDataReference") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("{}.f_reference", v.expr))
			}
			("System.Runtime.InteropServices.MemoryMarshal", "Read") => {
				let v = stack.pop()?;
				let ty = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "int32_t".into());
				push_rawcpp(ctx, instr, stack, &ty, format!("*({ty}*){}.f_reference", v.expr))
			}
			("System.Runtime.InteropServices.MemoryMarshal", "CreateSpan" | "CreateReadOnlySpan") => {
				let len = stack.pop()?;
				let ptr = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("{{ {}, {} }}", ptr.expr, len.expr))
			}
			("System.Runtime.InteropServices.MemoryMarshal", "AsBytes") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("rt::as_bytes({})", v.expr))
			}
			("System.Array", "Empty") => push_rawcpp(ctx, instr, stack, "void*", "rt::empty_array()".to_string()),
			(_, "CreateTruncating") if m.declaring_type.contains("INumber") => {
				let v = stack.pop()?;
				let ty = m.method_generic_args.first().map(|a| mangle_type_name(a)).unwrap_or_else(|| "int32_t".into());
				push_rawcpp(ctx, instr, stack, &ty, format!("({ty}){}", v.expr))
			}
			(_, "CastFrom") if m.declaring_type.contains("IUtfChar") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "char16_t", format!("(char16_t){}", v.expr))
			}
			(_, "CastToUInt32") if m.declaring_type.contains("IUtfChar") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "uint32_t", format!("(uint32_t){}", v.expr))
			}
			("System.Span`1" | "System.ReadOnlySpan`1", "op_Implicit") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", v.expr)
			}
			("System.Delegate" | "System.MulticastDelegate", "Invoke") => {
				let mut args: Vec<String> = (0..arity).filter_map(|_| stack.pop()).map(|e| e.expr).collect();
				args.reverse();
				let target = stack.pop()?;
				let tmp = ctx.fresh_temp();
				let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
				Some(mk(ctx, instr.offset, Some(&tmp), None, InstructionKind::DelegateInvoke { target: ctx.bump.alloc_str(&target.expr), arguments: ctx.bump.alloc_slice_copy(&arg_refs) }))
			}
			(ty, "get_IsSupported" | "get_IsHardwareAccelerated" | "get_Count") if ty.starts_with("System.Runtime.Intrinsics") || ty.starts_with("System.Numerics.Vector") => {
				push_rawcpp(ctx, instr, stack, "int32_t", "0".to_string())
			}
			(ty, _) if ty.starts_with("System.Runtime.Intrinsics") => push_rawcpp(ctx, instr, stack, "void", "/* simd no-op */".to_string()),
			("System.Index", "FromStart" | "FromEnd" | ".ctor") => {
				let from_end = matches!(m.method_name.as_str(), "FromEnd");
				let v = stack.pop()?;
				let expr = if from_end { format!("~{}", v.expr) } else { v.expr };
				push_rawcpp(ctx, instr, stack, "int32_t", expr)
			}
			("System.Index", "GetOffset") => {
				let len = stack.pop()?;
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "int32_t", format!("{} < 0 ? {} + (~{}) : {}", v.expr, len.expr, v.expr, v.expr))
			}
			("System.Range", "All") => push_rawcpp(ctx, instr, stack, "void*", "{ 0, ~0 }".to_string()),
			("System.Range", "StartAt") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("{{ {}, ~0 }}", v.expr))
			}
			("System.Range", "EndAt") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("{{ 0, {} }}", v.expr))
			}
			("System.Range", "GetOffsetAndLength") => {
				let len = stack.pop()?;
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("rt::range_offset_and_length({}, {})", v.expr, len.expr))
			}
			(ty, ".ctor") if ty.starts_with("System.ValueTuple") => {
				let mut args: Vec<String> = (0..arity).filter_map(|_| stack.pop()).map(|e| e.expr).collect();
				args.reverse();
				let assigns: Vec<String> = args
					.iter()
					.enumerate()
					.map(|(i, a)| if i == 7 { format!("this->f_Rest = {a}") } else { format!("this->f_Item{} = {a}", i + 1) })
					.collect();
				push_rawcpp(ctx, instr, stack, "void", assigns.join("; "))
			}
			(ty, "ToString" | "Equals" | "GetHashCode") if ty.starts_with("System.ValueTuple") => push_rawcpp(ctx, instr, stack, "int32_t", "0".to_string()),
			// §9 open question: a second, broader catch on the method name alone, kept alongside the
			// exact-declaring-type match above. Unclear whether this covers a real metadata quirk
			// (a differently-qualified `Unsafe` reference) or is dead code; left in per the source's
			// own ambiguity rather than removed without evidence.
			(_, "AsPointer") => {
				let v = stack.pop()?;
				push_rawcpp(ctx, instr, stack, "void*", format!("(void*)&{}", v.expr))
			}
			_ => None,
		}
	}

	fn push_rawcpp<'a, 'l>(ctx: &mut LowerCtx<'a, 'l>, instr: &RawInstruction, stack: &mut Vec<StackEntry>, ty: &str, code: String) -> Option<Instruction<'l>> {
		if ty == "void" {
			return Some(mk(ctx, instr.offset, None, None, InstructionKind::RawCpp { code: ctx.bump.alloc_str(&code) }));
		}
		let tmp = ctx.fresh_temp();
		let result = mk(ctx, instr.offset, Some(&tmp), Some(ty), InstructionKind::RawCpp { code: ctx.bump.alloc_str(&code) });
		stack.push(StackEntry::new(tmp, Some(ty.to_string())));
		Some(result)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reader_model::*;
	use crate::type_builder::ExternalEnumFixup;

	fn params<'a>(icalls: &'a IcallRegistry, value_types: &'a ValueTypeRegistry, enum_fixup: &'a ExternalEnumFixup, tp: &'a FxHashMap<String, String>, mp: &'a FxHashMap<String, String>) -> LowerParams<'a> {
		LowerParams { icalls, value_types, enum_fixup, type_params: tp, method_params: mp }
	}

	fn simple_method<'l>(bump: &'l Bump, declaring_type: &'l Type<'l>, name: &'static str, params: &[(&'static str, &'static str)]) -> &'l Method<'l> {
		let parameters: Vec<_> = params
			.iter()
			.enumerate()
			.map(|(i, (cpp_name, cpp_type))| Parameter { index: i as u32, cpp_name, il_type_name: "System.Int32", cpp_type })
			.collect();
		bump.alloc(Method {
			name,
			cpp_name: std::cell::Cell::new(name),
			declaring_type,
			return_type_cpp: std::cell::Cell::new("void"),
			flags: std::cell::Cell::new(crate::module::MethodIrFlags::empty()),
			parameters: bump.alloc_slice_copy(&parameters),
			locals: std::cell::Cell::new(&[]),
			basic_blocks: std::cell::Cell::new(&[]),
			vtable_slot: std::cell::Cell::new(-1),
			explicit_overrides: &[],
			temp_var_types: std::cell::Cell::new(&[]),
			generic_method_args: &[],
		})
	}

	fn leaf_type<'l>(bump: &'l Bump, name: &'static str) -> &'l Type<'l> {
		bump.alloc(Type {
			il_full_name: name,
			namespace: "",
			name,
			cpp_name: std::cell::Cell::new(name),
			flags: std::cell::Cell::new(crate::module::TypeIrFlags::empty()),
			base_type: std::cell::Cell::new(None),
			interfaces: std::cell::Cell::new(&[]),
			fields: std::cell::Cell::new(&[]),
			static_fields: std::cell::Cell::new(&[]),
			methods: std::cell::Cell::new(&[]),
			vtable: std::cell::Cell::new(&[]),
			interface_impls: std::cell::Cell::new(&[]),
			finalizer: std::cell::Cell::new(None),
			explicit_size: std::cell::Cell::new(None),
			instance_size: std::cell::Cell::new(16),
			enum_underlying_type: std::cell::Cell::new(None),
			generic_type_args: &[],
			generic_variance: &[],
		})
	}

	fn instr(offset: u32, opcode: RawOpCode, operand: Operand) -> RawInstruction {
		RawInstruction { offset, opcode, operand }
	}

	#[test]
	fn pointer_arithmetic_scales_through_uint8_cast() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let method = simple_method(&bump, ty, "M", &[("p", "char16_t*")]);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::LdArg, Operand::Index(0)),
				instr(1, RawOpCode::LdcI4, Operand::I32(4)),
				instr(2, RawOpCode::Add, Operand::None),
				instr(3, RawOpCode::Pop, Operand::None),
				instr(4, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![RawParameter { name: "p".into(), type_name: "System.Char".into(), is_by_ref: false }], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		let blocks = method.basic_blocks.get();
		let instrs = blocks[0].instructions.get();
		let add_instr = instrs.iter().find(|i| matches!(i.kind, InstructionKind::RawCpp { .. })).unwrap();
		match &add_instr.kind {
			InstructionKind::RawCpp { code } => {
				assert!(code.contains("(char16_t*)((uint8_t*)p + 4)"), "unexpected code: {code}");
			}
			_ => unreachable!(),
		}
		assert_eq!(add_instr.result_type_cpp, Some("char16_t*"));
	}

	#[test]
	fn cgt_un_against_null_rewrites_to_not_equal() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let method = simple_method(&bump, ty, "M", &[("p", "void*")]);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::LdArg, Operand::Index(0)),
				instr(1, RawOpCode::LdNull, Operand::None),
				instr(2, RawOpCode::CgtUn, Operand::None),
				instr(3, RawOpCode::Brtrue, Operand::BranchTarget(10)),
				instr(4, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![RawParameter { name: "p".into(), type_name: "System.IntPtr".into(), is_by_ref: false }], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		let blocks = method.basic_blocks.get();
		let branch = blocks[0].instructions.get().iter().find_map(|i| match &i.kind {
			InstructionKind::ConditionalBranch { condition, true_label, .. } => Some((*condition, *true_label)),
			_ => None,
		}).unwrap();
		assert_eq!(branch.0, "p != nullptr");
		assert_eq!(branch.1, "IL_10");
	}

	#[test]
	fn simd_is_supported_becomes_zero_literal() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let method = simple_method(&bump, ty, "M", &[]);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::Call, Operand::MethodRef(MethodRefOperand {
					declaring_type: "System.Runtime.Intrinsics.Vector128`1".into(),
					method_name: "get_IsSupported".into(),
					parameter_types: vec![],
					method_generic_args: vec!["System.Byte".into()],
					declaring_type_generic_args: vec![],
				})),
				instr(1, RawOpCode::Pop, Operand::None),
				instr(2, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		let blocks = method.basic_blocks.get();
		let call_result = blocks[0].instructions.get().iter().find_map(|i| match &i.kind {
			InstructionKind::RawCpp { code } if *code == "0" => Some(*code),
			_ => None,
		});
		assert_eq!(call_result, Some("0"));
	}

	#[test]
	fn balanced_cast_stripping_handles_nested_casts() {
		assert_eq!(strip_balanced_cast("((S*)expr)"), "expr");
		assert_eq!(strip_balanced_cast("plain"), "plain");
	}

	#[test]
	fn distinct_string_literals_intern_to_distinct_ids() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let method = simple_method(&bump, ty, "M", &[]);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::LdStr, Operand::String("hello".into())),
				instr(1, RawOpCode::Pop, Operand::None),
				instr(2, RawOpCode::LdStr, Operand::String("world".into())),
				instr(3, RawOpCode::Pop, Operand::None),
				instr(4, RawOpCode::LdStr, Operand::String("hello".into())),
				instr(5, RawOpCode::Pop, Operand::None),
				instr(6, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		assert_eq!(module.strings.entries(), &["hello", "world"]);
	}

	#[test]
	fn conv_targets_the_instruction_operands_il_type() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let method = simple_method(&bump, ty, "M", &[("p", "int32_t")]);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::LdArg, Operand::Index(0)),
				instr(1, RawOpCode::Conv, Operand::TypeRef(TypeRefOperand { il_name: "System.Double".into() })),
				instr(2, RawOpCode::Pop, Operand::None),
				instr(3, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![RawParameter { name: "p".into(), type_name: "System.Int32".into(), is_by_ref: false }], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		let blocks = method.basic_blocks.get();
		let conv = blocks[0].instructions.get().iter().find_map(|i| match &i.kind {
			InstructionKind::Conversion { target_type, .. } => Some(*target_type),
			_ => None,
		});
		assert_eq!(conv, Some("double"));
	}

	#[test]
	fn varargs_callee_gets_a_trailing_handle_argument() {
		let bump = Bump::new();
		let icalls = IcallRegistry::new();
		let value_types = ValueTypeRegistry::default();
		let enum_fixup = ExternalEnumFixup::new();
		let tp = FxHashMap::default();
		let mp = FxHashMap::default();
		let p = params(&icalls, &value_types, &enum_fixup, &tp, &mp);
		let mut module = Module::new(&bump);
		let mut generics = GenericEngine::new();
		let ty = leaf_type(&bump, "App.Program");
		let callee = simple_method(&bump, ty, "Log", &[]);
		callee.flags.set(crate::module::MethodIrFlags::IS_STATIC | crate::module::MethodIrFlags::HAS_VARARGS);
		ty.methods.set(bump.alloc_slice_copy(&[callee]));
		let method = simple_method(&bump, ty, "M", &[]);
		module.types.push(ty);

		let body = RawMethodBody {
			locals: vec![],
			instructions: vec![
				instr(0, RawOpCode::Call, Operand::MethodRef(MethodRefOperand {
					declaring_type: "App.Program".into(),
					method_name: "Log".into(),
					parameter_types: vec![],
					method_generic_args: vec![],
					declaring_type_generic_args: vec![],
				})),
				instr(1, RawOpCode::Pop, Operand::None),
				instr(2, RawOpCode::Ret, Operand::None),
			],
			exception_regions: vec![],
		};
		let raw = RawMethod { name: "M".into(), flags: MethodFlags::empty(), return_type: "System.Void".into(), parameters: vec![], body: Some(body), has_clr_internal_dependency: false };

		lower_body(&bump, &mut module, &mut generics, &p, ty, method, &raw);
		let blocks = method.basic_blocks.get();
		let call = blocks[0].instructions.get().iter().find_map(|i| match &i.kind {
			InstructionKind::Call(c) => Some(*c),
			_ => None,
		}).unwrap();
		assert!(call.is_varargs);
		assert_eq!(call.arguments.last(), Some(&"rt::make_vararg_handle()"));
	}
}
