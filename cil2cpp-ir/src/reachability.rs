//! Reachability Analyzer (§4.1): worklist-driven tree shaking seeded from an entry point (or a
//! library-mode policy), extended to include virtual-override dispatch.
//!
//! Mirrors the teacher's `DefaultAssemblyResolver` worklist shape (exact-hit-then-broader-match
//! lookups, §`structured::resolver`) but walks CIL instruction operands instead of metadata
//! table rows.

use fxhash::FxHashSet;

use crate::reader_model::{AssemblySet, MethodFlags, Operand, RawMethod, RawOpCode, RawType, TypeFlags};

/// How the Driver selects the seed set (§4.1 point 1).
#[derive(Debug, Clone)]
pub enum EntryPoint {
	Method { declaring_type: String, name: String, arity: usize },
	/// Seed every public/protected method of every public type.
	Library,
	/// Seed every method of every non-`<Module>` type, public or not.
	ForcedLibrary,
}

/// A method identity stable across the worklist: declaring type + name + arity. Overload
/// resolution by exact parameter types happens downstream (§4.5); reachability only needs to
/// avoid re-scanning the same body twice and to match virtual-dispatch slots.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct MethodKey {
	pub declaring_type: String,
	pub name: String,
	pub arity: usize,
}

/// A virtual-dispatch slot: any method carrying this name + arity, on any type, must be seeded
/// once discovered reachable — this is what makes override sweeping sound against seeding order.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
struct DispatchSlot {
	name: String,
	arity: usize,
}

#[derive(Debug, Default)]
pub struct ReachabilityResult {
	pub reachable_types: FxHashSet<String>,
	pub reachable_methods: FxHashSet<MethodKey>,
}

impl ReachabilityResult {
	pub fn is_type_reachable(&self, full_name: &str) -> bool {
		self.reachable_types.contains(full_name)
	}

	pub fn is_method_reachable(&self, declaring_type: &str, name: &str, arity: usize) -> bool {
		self.reachable_methods.contains(&MethodKey { declaring_type: declaring_type.to_string(), name: name.to_string(), arity })
	}
}

fn is_boundary_excluded(full_name: &str) -> bool {
	full_name == "<Module>" || full_name == "System.Void" || full_name == "void"
}

struct Analyzer<'a> {
	assemblies: &'a AssemblySet,
	result: ReachabilityResult,
	dispatched_slots: FxHashSet<DispatchSlot>,
	method_worklist: Vec<MethodKey>,
	processed_methods: FxHashSet<MethodKey>,
}

impl<'a> Analyzer<'a> {
	fn new(assemblies: &'a AssemblySet) -> Self {
		Self {
			assemblies,
			result: ReachabilityResult::default(),
			dispatched_slots: FxHashSet::default(),
			method_worklist: Vec::new(),
			processed_methods: FxHashSet::default(),
		}
	}

	fn mark_type(&mut self, full_name: &str) {
		if is_boundary_excluded(full_name) {
			return;
		}
		if !self.result.reachable_types.insert(full_name.to_string()) {
			return;
		}

		let Some(ty) = self.assemblies.find_type(full_name) else { return };

		if let Some(base) = ty.base_type.clone() {
			self.mark_type(&base);
		}
		for iface in ty.interfaces.clone() {
			self.mark_type(&iface);
		}
		for field in &ty.fields {
			self.mark_type(&field.type_name);
		}
		if let Some(cctor) = ty.methods.iter().find(|m| m.flags.contains(MethodFlags::IS_STATIC_CONSTRUCTOR)) {
			self.seed_method(full_name, cctor);
		}
		if let Some(finalizer) = ty.methods.iter().find(|m| m.name == "Finalize" && m.parameters.is_empty()) {
			self.seed_method(full_name, finalizer);
		}

		self.sweep_type_for_overrides(ty);
	}

	/// Checks one newly-reachable type's methods against every previously recorded dispatch
	/// slot (§4.1 point 3, the "checks for overrides of any previously-dispatched slot" leg).
	fn sweep_type_for_overrides(&mut self, ty: &RawType) {
		let hits: Vec<_> = ty
			.methods
			.iter()
			.filter(|m| self.dispatched_slots.contains(&DispatchSlot { name: m.name.clone(), arity: m.parameters.len() }))
			.cloned()
			.collect();
		for m in hits {
			self.seed_method(&ty.full_name, &m);
		}
	}

	/// Checks every already-reachable type for overrides of a slot just recorded (§4.1 point 2,
	/// the symmetric sweep run when a new virtual method is first seeded).
	fn sweep_all_reachable_for_slot(&mut self, slot: &DispatchSlot) {
		let reachable: Vec<_> = self.result.reachable_types.iter().cloned().collect();
		for type_name in reachable {
			let Some(ty) = self.assemblies.find_type(&type_name) else { continue };
			if let Some(m) = ty.methods.iter().find(|m| m.name == slot.name && m.parameters.len() == slot.arity) {
				self.seed_method(&type_name, m);
			}
		}
	}

	fn seed_method(&mut self, declaring_type: &str, method: &RawMethod) {
		self.mark_type(declaring_type);
		let key = MethodKey { declaring_type: declaring_type.to_string(), name: method.name.clone(), arity: method.parameters.len() };
		if self.result.reachable_methods.insert(key.clone()) {
			self.method_worklist.push(key);
		}

		if method.flags.contains(MethodFlags::IS_VIRTUAL) {
			let slot = DispatchSlot { name: method.name.clone(), arity: method.parameters.len() };
			if self.dispatched_slots.insert(slot.clone()) {
				self.sweep_all_reachable_for_slot(&slot);
			}
		}
	}

	fn seed_by_name(&mut self, declaring_type: &str, name: &str, arity: usize) -> bool {
		let Some(ty) = self.assemblies.find_type(declaring_type) else { return false };
		let Some(m) = ty.methods.iter().find(|m| m.name == name && m.parameters.len() == arity).cloned() else { return false };
		self.seed_method(declaring_type, &m);
		true
	}

	fn seed_entry_point(&mut self, entry: &EntryPoint) -> bool {
		match entry {
			EntryPoint::Method { declaring_type, name, arity } => self.seed_by_name(declaring_type, name, *arity),
			EntryPoint::Library => {
				let types: Vec<_> = self
					.assemblies
					.assemblies
					.values()
					.flat_map(|a| a.types.iter())
					.filter(|t| t.flags.contains(TypeFlags::IS_PUBLIC))
					.cloned()
					.collect();
				for ty in &types {
					for m in ty.methods.iter().filter(|m| m.flags.contains(MethodFlags::IS_PUBLIC) || m.flags.contains(MethodFlags::IS_PROTECTED)) {
						self.seed_method(&ty.full_name, m);
					}
				}
				true
			}
			EntryPoint::ForcedLibrary => {
				let types: Vec<_> = self.assemblies.assemblies.values().flat_map(|a| a.types.iter()).filter(|t| t.full_name != "<Module>").cloned().collect();
				for ty in &types {
					for m in &ty.methods {
						self.seed_method(&ty.full_name, m);
					}
				}
				true
			}
		}
	}

	fn run_worklist(&mut self) {
		while let Some(key) = self.method_worklist.pop() {
			if !self.processed_methods.insert(key.clone()) {
				continue;
			}
			let Some(ty) = self.assemblies.find_type(&key.declaring_type) else { continue };
			let Some(method) = ty.methods.iter().find(|m| m.name == key.name && m.parameters.len() == key.arity).cloned() else { continue };
			let Some(body) = method.body.clone() else { continue };

			for param in &method.parameters {
				self.mark_type(&param.type_name);
			}
			self.mark_type(&method.return_type);

			let mut pending_constrained: Option<String> = None;
			for instr in &body.instructions {
				match &instr.opcode {
					RawOpCode::Constrained => {
						if let Operand::TypeRef(t) = &instr.operand {
							pending_constrained = Some(t.il_name.clone());
						}
						continue;
					}
					RawOpCode::Call | RawOpCode::Callvirt | RawOpCode::Calli | RawOpCode::Newobj | RawOpCode::Ldftn | RawOpCode::Ldvirtftn => {
						if let Operand::MethodRef(m) = &instr.operand {
							self.mark_type(&m.declaring_type);
							if let Some(constrained_type) = pending_constrained.take() {
								self.resolve_constrained_explicit_impl(&constrained_type, m.declaring_type.as_str(), &m.method_name, m.parameter_types.len());
							}
							self.seed_by_name(&m.declaring_type, &m.method_name, m.parameter_types.len());
							for arg in &m.declaring_type_generic_args {
								self.mark_type(arg);
							}
							for arg in &m.method_generic_args {
								self.mark_type(arg);
							}
						}
					}
					RawOpCode::Newarr | RawOpCode::Box | RawOpCode::Unbox | RawOpCode::UnboxAny | RawOpCode::Castclass | RawOpCode::Isinst | RawOpCode::Initobj | RawOpCode::Ldtoken | RawOpCode::Sizeof => {
						if let Operand::TypeRef(t) = &instr.operand {
							self.mark_type(&t.il_name);
						}
					}
					RawOpCode::Ldfld | RawOpCode::Ldflda | RawOpCode::Stfld | RawOpCode::Ldsfld | RawOpCode::Ldsflda | RawOpCode::Stsfld => {
						if let Operand::FieldRef(f) = &instr.operand {
							self.mark_type(&f.declaring_type);
							if let Some(field_ty) = self.assemblies.find_type(&f.declaring_type).and_then(|t| t.fields.iter().find(|fld| fld.name == f.field_name)) {
								self.mark_type(&field_ty.type_name.clone());
							}
						}
					}
					_ => {}
				}
				pending_constrained = None;
			}
		}
	}

	/// §4.1 point 4: a `Constrained` prefix resolves explicit interface implementations on the
	/// constrained type, matched either by exact interface-qualified name or by suffix match
	/// after the last `.` (explicit impls are stored as `Namespace.IFace<T>.MethodName`).
	fn resolve_constrained_explicit_impl(&mut self, constrained_type: &str, interface_type: &str, method_name: &str, arity: usize) {
		let Some(ty) = self.assemblies.find_type(constrained_type) else { return };
		let qualified = format!("{interface_type}.{method_name}");
		let hit = ty.methods.iter().find(|m| {
			m.parameters.len() == arity && (m.name == qualified || m.name.rsplit('.').next() == Some(method_name))
		}).cloned();
		if let Some(m) = hit {
			self.seed_method(constrained_type, &m);
		}
	}
}

/// Runs reachability analysis to its least fixed point (§4.1). Unresolvable references (a type
/// or method the reader never supplied) are silently skipped, per §7's propagation policy.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all))]
pub fn analyze(assemblies: &AssemblySet, entry: &EntryPoint) -> ReachabilityResult {
	let mut analyzer = Analyzer::new(assemblies);
	analyzer.seed_entry_point(entry);
	analyzer.run_worklist();
	analyzer.result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::reader_model::*;

	fn method(name: &str, params: usize, flags: MethodFlags) -> RawMethod {
		RawMethod {
			name: name.into(),
			flags,
			return_type: "System.Void".into(),
			parameters: (0..params).map(|i| RawParameter { name: format!("p{i}"), type_name: "System.Int32".into(), is_by_ref: false }).collect(),
			body: Some(RawMethodBody { locals: vec![], instructions: vec![], exception_regions: vec![] }),
			has_clr_internal_dependency: false,
		}
	}

	#[test]
	fn entry_point_pulls_in_its_declaring_type() {
		let mut set = AssemblySet::new("App");
		let mut app = RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };
		let mut program = RawType::new("App.Program", "App", "Program", TypeFlags::IS_PUBLIC);
		program.methods.push(method("Main", 0, MethodFlags::IS_STATIC | MethodFlags::IS_PUBLIC));
		app.types.push(program);
		set.add_assembly(app);

		let result = analyze(&set, &EntryPoint::Method { declaring_type: "App.Program".into(), name: "Main".into(), arity: 0 });
		assert!(result.is_type_reachable("App.Program"));
		assert!(result.is_method_reachable("App.Program", "Main", 0));
	}

	#[test]
	fn virtual_override_is_swept_into_reachable_set() {
		let mut set = AssemblySet::new("App");
		let mut app = RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };

		let mut animal = RawType::new("Animal", "", "Animal", TypeFlags::IS_PUBLIC);
		animal.methods.push(method("Speak", 0, MethodFlags::IS_VIRTUAL | MethodFlags::IS_PUBLIC));
		app.types.push(animal);

		let mut dog = RawType::new("Dog", "", "Dog", TypeFlags::IS_PUBLIC);
		dog.base_type = Some("Animal".into());
		dog.methods.push(method("Speak", 0, MethodFlags::IS_VIRTUAL | MethodFlags::IS_PUBLIC));
		app.types.push(dog);

		let mut program = RawType::new("App.Program", "App", "Program", TypeFlags::IS_PUBLIC);
		let mut main = method("Main", 0, MethodFlags::IS_STATIC | MethodFlags::IS_PUBLIC);
		main.body.as_mut().unwrap().instructions.push(RawInstruction {
			offset: 0,
			opcode: RawOpCode::Callvirt,
			operand: Operand::MethodRef(MethodRefOperand {
				declaring_type: "Animal".into(),
				method_name: "Speak".into(),
				parameter_types: vec![],
				method_generic_args: vec![],
				declaring_type_generic_args: vec![],
			}),
		});
		program.methods.push(main);
		app.types.push(program);

		set.add_assembly(app);

		let result = analyze(&set, &EntryPoint::Method { declaring_type: "App.Program".into(), name: "Main".into(), arity: 0 });
		assert!(result.is_method_reachable("Animal", "Speak", 0));
		assert!(result.is_method_reachable("Dog", "Speak", 0));
	}

	#[test]
	fn module_and_void_are_excluded() {
		let mut set = AssemblySet::new("App");
		let app = RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };
		set.add_assembly(app);
		let result = analyze(&set, &EntryPoint::ForcedLibrary);
		assert!(!result.is_type_reachable("<Module>"));
		assert!(!result.is_type_reachable("System.Void"));
	}
}
