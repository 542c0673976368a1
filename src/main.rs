//! Command-line driver: run a compiled library's entry point, or dump a
//! library file's contents.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use squill::code::CodeBuilder;
use squill::code::{disassemble, Opcode};
use squill::heap::object::{ObjBody, ObjTag};
use squill::library::{read, LibrarySummary};
use squill::messages::MessageTable;
use squill::value::Value;
use squill::vm::frame::Registers;
use squill::{MachineState, Runtime};

#[derive(Parser)]
#[command(name = "squill", about = "Scheme-core virtual machine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a compiled library and run one of its exported procedures.
    Run {
        /// Library file (.slib).
        library: PathBuf,
        /// Exported binding to invoke; must be a zero-argument procedure.
        #[arg(long, default_value = "main")]
        entry: String,
        /// Override the condition-text catalog.
        #[arg(long)]
        messages: Option<PathBuf>,
    },
    /// Show a library file's header and exports.
    Dump {
        /// Library file (.slib).
        library: PathBuf,
        /// Machine-readable output.
        #[arg(long)]
        json: bool,
        /// Disassemble exported procedures (plain output only).
        #[arg(long)]
        disasm: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    match Cli::parse().command {
        Command::Run {
            library,
            entry,
            messages,
        } => run(library, entry, messages),
        Command::Dump {
            library,
            json,
            disasm,
        } => dump(library, json, disasm),
    }
}

fn run(path: PathBuf, entry: String, messages: Option<PathBuf>) -> ExitCode {
    let table = match messages {
        Some(path) => match MessageTable::load(&path) {
            Ok(t) => t,
            Err(e) => {
                eprintln!("squill: cannot load message catalog: {e}");
                return ExitCode::FAILURE;
            }
        },
        None => MessageTable::standard(),
    };
    let rt = Runtime::with_messages(table);

    let mut machine = rt.machine();
    {
        let mut heap = rt.heap();
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("squill: cannot open {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        };
        let lib = match read::read_library(&mut heap, rt.natives(), &mut BufReader::new(file)) {
            Ok(lib) => lib,
            Err(e) => {
                eprintln!("squill: cannot read {}: {e}", path.display());
                return ExitCode::FAILURE;
            }
        };
        let Some((_, target)) = lib.exports.iter().find(|(name, _)| *name == entry) else {
            eprintln!(
                "squill: library ({}) exports no binding {entry:?}",
                lib.name_string()
            );
            return ExitCode::FAILURE;
        };
        log::info!(
            "running ({}) export {entry} [{} objects]",
            lib.name_string(),
            lib.objects
        );
        // The exports are not rooted yet: park the target in a register set
        // that rides along as a GC root while the launcher code is built.
        let mut regs = Registers::new();
        regs.acc = *target;
        if !regs.acc.is_object() || !heap.is_a(regs.acc, ObjTag::Lambda) {
            // Built-ins are callable too; anything else is not.
            if !heap.is_a(regs.acc, ObjTag::Cps) {
                eprintln!("squill: export {entry:?} is not a procedure");
                return ExitCode::FAILURE;
            }
        }
        let mut b = CodeBuilder::new();
        let ret = b.forward(Opcode::Frame);
        b.constant(regs.acc);
        b.emit(Opcode::Apply);
        b.patch(ret, b.here());
        b.emit(Opcode::Halt);
        let code = b.install(&mut heap, &mut regs);
        machine.start(&mut heap, code, Value::NIL);
    }

    match rt.run_parallel(vec![machine]).remove(0) {
        MachineState::Halted(v) => {
            println!("{}", rt.heap().render(v));
            ExitCode::SUCCESS
        }
        MachineState::Faulted(c) => {
            eprintln!("squill: uncaught condition: {}", rt.heap().render(c));
            ExitCode::FAILURE
        }
        MachineState::Running => ExitCode::FAILURE,
    }
}

fn dump(path: PathBuf, json: bool, disasm: bool) -> ExitCode {
    let rt = Runtime::new();
    let mut heap = rt.heap();
    let file = match File::open(&path) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("squill: cannot open {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let lib = match read::read_library(&mut heap, rt.natives(), &mut BufReader::new(file)) {
        Ok(lib) => lib,
        Err(e) => {
            eprintln!("squill: cannot read {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };
    let summary = LibrarySummary::of(&heap, &lib);
    if json {
        match serde_json::to_string_pretty(&summary) {
            Ok(text) => println!("{text}"),
            Err(e) => {
                eprintln!("squill: cannot encode summary: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "library ({}) version {:?}",
            lib.name_string(),
            summary.version
        );
        println!("objects: {}", summary.object_count);
        for (e, (_, v)) in summary.exports.iter().zip(&lib.exports) {
            println!("  export {} = {}", e.name, e.value);
            if disasm {
                let code = match v {
                    v if v.is_object() && heap.is_a(*v, ObjTag::Lambda) => {
                        match heap.body(*v) {
                            ObjBody::Lambda { code, .. } => Some(*code),
                            _ => None,
                        }
                    }
                    v if v.is_object() && heap.is_a(*v, ObjTag::Code) => Some(*v),
                    _ => None,
                };
                if let Some(code) = code {
                    for line in disassemble(&heap, code).lines() {
                        println!("    {line}");
                    }
                }
            }
        }
        for i in &summary.imports {
            println!(
                "  import ({}) version {:?}: {}",
                i.name.join(" "),
                i.version,
                i.bindings.join(", ")
            );
        }
    }
    ExitCode::SUCCESS
}
