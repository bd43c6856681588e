use std::fs::File;
use std::io::BufWriter;
use std::time::SystemTime;

use bumpalo::Bump;
use memory_stats::memory_stats;
use tracing_flame::FlameLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::Registry;

use cil2cpp_ir::reader_model::{
	AssemblyClass, AssemblySet, FieldRefOperand, MethodFlags, Operand, RawAssembly, RawField, RawInstruction, RawMethod, RawMethodBody, RawOpCode, RawParameter, RawType, TypeFlags, TypeRefOperand,
};
use cil2cpp_ir::{BuildConfig, EntryPoint};

fn setup_global_subscriber() -> impl Drop {
	let file = File::create("./trace.folded").unwrap();
	let flame_layer = FlameLayer::new(BufWriter::new(file)).with_file_and_line(false);
	let guard = flame_layer.flush_on_drop();

	let subscriber = Registry::default().with(flame_layer);

	tracing::subscriber::set_global_default(subscriber).expect("Could not set global default");
	guard
}

/// Stands in for the (out-of-scope) Assembly Reader: a small hand-built program with a generic
/// container type, so the monomorphization passes have something to chew on.
fn sample_assembly_set() -> AssemblySet {
	let mut set = AssemblySet::new("App");

	let mut corelib = RawAssembly { name: "System.Private.CoreLib".into(), class: AssemblyClass::Bcl, types: vec![] };
	corelib.types.push(RawType::new("System.Object", "System", "Object", TypeFlags::IS_PUBLIC));
	corelib.types.push(RawType::new("System.Int32", "System", "Int32", TypeFlags::IS_PUBLIC | TypeFlags::IS_VALUE_TYPE));
	set.add_assembly(corelib);

	let mut app = RawAssembly { name: "App".into(), class: AssemblyClass::User, types: vec![] };

	let mut box_ty = RawType::new("App.Box`1", "App", "Box`1", TypeFlags::IS_PUBLIC);
	box_ty.base_type = Some("System.Object".into());
	box_ty.generic_parameters = vec!["!0".into()];
	box_ty.fields.push(RawField { name: "value".into(), type_name: "!0".into(), flags: Default::default(), constant_value: None });
	box_ty.methods.push(RawMethod {
		name: "GetValue".into(),
		flags: MethodFlags::IS_PUBLIC,
		return_type: "!0".into(),
		parameters: vec![],
		body: Some(RawMethodBody {
			locals: vec![],
			instructions: vec![RawInstruction { offset: 0, opcode: RawOpCode::Ldfld, operand: Operand::FieldRef(FieldRefOperand { declaring_type: "App.Box`1".into(), field_name: "value".into() }) }, RawInstruction { offset: 1, opcode: RawOpCode::Ret, operand: Operand::None }],
			exception_regions: vec![],
		}),
		has_clr_internal_dependency: false,
	});
	app.types.push(box_ty);

	let mut program = RawType::new("App.Program", "App", "Program", TypeFlags::IS_PUBLIC);
	program.base_type = Some("System.Object".into());
	program.methods.push(RawMethod {
		name: "Main".into(),
		flags: MethodFlags::IS_STATIC | MethodFlags::IS_PUBLIC,
		return_type: "System.Void".into(),
		parameters: vec![RawParameter { name: "args".into(), type_name: "System.String[]".into(), is_by_ref: false }],
		body: Some(RawMethodBody {
			locals: vec![],
			instructions: vec![
				RawInstruction { offset: 0, opcode: RawOpCode::Newobj, operand: Operand::TypeRef(TypeRefOperand { il_name: "App.Box`1<System.Int32>".into() }) },
				RawInstruction { offset: 1, opcode: RawOpCode::Pop, operand: Operand::None },
				RawInstruction { offset: 2, opcode: RawOpCode::Ret, operand: Operand::None },
			],
			exception_regions: vec![],
		}),
		has_clr_internal_dependency: false,
	});
	app.types.push(program);

	set.add_assembly(app);
	set
}

fn main() {
	let _guard = setup_global_subscriber();

	let mut start = SystemTime::now();
	let assemblies = sample_assembly_set();

	println! {
		"Assembly load time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	start = SystemTime::now();

	let bump = Bump::new();
	let entry = EntryPoint::Method { declaring_type: "App.Program".into(), name: "Main".into(), arity: 1 };
	let module = cil2cpp_ir::build(&bump, &assemblies, &entry, &BuildConfig::release()).unwrap();

	println! {
		"IR build time: {:?}, RAM: {}MB",
		start.elapsed().unwrap(),
		memory_stats().unwrap().virtual_mem as f32 / 1000000.0,
	}

	println!("Types in module: {}", module.types.len());
	println!("Entry point resolved: {}", module.entry_point.is_some());

	// println!("{:#?}", module);
}
