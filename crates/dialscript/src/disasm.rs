//! Human-readable disassembly of a bytecode module.
//!
//! Diagnostics only: the listing shows addresses, mnemonics, raw operands,
//! and resolved constant/global/function/native names so a dump is readable
//! without the tables at hand.

use std::fmt::Write;

use crate::module::BytecodeModule;
use crate::native::{NativeId, NATIVE_PATHS};
use crate::opcode::Opcode;

/// Produce a full listing of the module.
pub fn disassemble(module: &BytecodeModule) -> String {
    let mut out = String::new();

    let meta = &module.metadata;
    let _ = writeln!(
        out,
        "; app {:?} v{} by {:?} (heap {} bytes)",
        meta.app_name, meta.app_version, meta.author, meta.heap_size
    );
    let _ = writeln!(
        out,
        "; constants: {}  globals: {}  functions: {}  code: {} bytes",
        module.constants.len(),
        module.globals.len(),
        module.functions.len(),
        module.code.len()
    );

    let mut pc = 0usize;
    while pc < module.code.len() {
        // Mark function entries and the start of main.
        for (i, name) in module.functions.iter().enumerate() {
            if module
                .function_entry_points
                .get(i)
                .is_some_and(|&e| e as usize == pc)
            {
                let _ = writeln!(out, "\n; function {name}:");
            }
        }
        if module.main_entry_point as usize == pc {
            let _ = writeln!(out, "\n; main:");
        }

        pc = disassemble_instruction(module, pc, &mut out);
    }

    out
}

/// Disassemble the instruction at `pc`, appending one line and returning
/// the next instruction boundary.
fn disassemble_instruction(module: &BytecodeModule, pc: usize, out: &mut String) -> usize {
    let code = &module.code;
    let byte = code[pc];
    let Ok(op) = Opcode::try_from(byte) else {
        let _ = writeln!(out, "{pc:04X}  .byte 0x{byte:02X}        ; invalid opcode");
        return pc + 1;
    };

    let width = op.operand_width();
    if pc + 1 + width > code.len() {
        let _ = writeln!(
            out,
            "{pc:04X}  {:12}; truncated operand",
            op.mnemonic()
        );
        return code.len();
    }
    let operands = &code[pc + 1..pc + 1 + width];

    let mut line = format!("{pc:04X}  {}", op.mnemonic());
    match op {
        Opcode::PushI8 => {
            let _ = write!(line, " {}", operands[0] as i8);
        }
        Opcode::LoadLocal | Opcode::StoreLocal => {
            let _ = write!(line, " {}", operands[0]);
        }
        Opcode::PushI16 => {
            let _ = write!(line, " {}", i16::from_le_bytes([operands[0], operands[1]]));
        }
        Opcode::PushI32 => {
            let _ = write!(line, " {}", read_i32(operands));
        }
        Opcode::PushF32 => {
            let _ = write!(line, " {}", f32::from_bits(read_i32(operands) as u32));
        }
        Opcode::PushStr | Opcode::NewObject | Opcode::GetField | Opcode::SetField => {
            let idx = u16::from_le_bytes([operands[0], operands[1]]);
            let name = module
                .constants
                .get(idx as usize)
                .map(String::as_str)
                .unwrap_or("<bad index>");
            let _ = write!(line, " {idx} ; {name:?}");
        }
        Opcode::LoadGlobal | Opcode::StoreGlobal => {
            let idx = u16::from_le_bytes([operands[0], operands[1]]);
            let name = module
                .globals
                .get(idx as usize)
                .map(String::as_str)
                .unwrap_or("<bad index>");
            let _ = write!(line, " {idx} ; {name}");
        }
        Opcode::Jump | Opcode::JumpIf | Opcode::JumpIfNot | Opcode::Try => {
            let delta = read_i32(operands);
            let target = pc as i64 + 1 + width as i64 + i64::from(delta);
            let _ = write!(line, " {delta:+} ; -> {target:04X}");
        }
        Opcode::Call => {
            let idx = u16::from_le_bytes([operands[0], operands[1]]);
            let argc = operands[2];
            let name = module
                .functions
                .get(idx as usize)
                .map(String::as_str)
                .unwrap_or("<bad index>");
            let _ = write!(line, " {idx} {argc} ; {name}");
        }
        Opcode::CallNative => {
            let raw = u16::from_le_bytes([operands[0], operands[1]]);
            let argc = operands[2];
            let path = NativeId::try_from(raw)
                .ok()
                .and_then(|id| {
                    NATIVE_PATHS
                        .iter()
                        .find(|(_, n)| *n == id)
                        .map(|(p, _)| *p)
                })
                .unwrap_or("<unknown native>");
            let _ = write!(line, " 0x{raw:04X} {argc} ; {path}");
        }
        _ => {}
    }

    let _ = writeln!(out, "{line}");
    pc + 1 + width
}

fn read_i32(bytes: &[u8]) -> i32 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
