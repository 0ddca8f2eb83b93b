//! dialscript — a statically-typed scripting language toolchain for
//! dial-style embedded devices (circular display, rotary encoder, touch,
//! RFID, GPIO).
//!
//! The crate covers the whole pipeline: lexer → recursive-descent parser →
//! bytecode compiler → `.dsb` module container → stack VM with a pluggable
//! host interface and cooperative scheduling.
//!
//! # Quick start
//!
//! ```
//! use dialscript::{Engine, ExecStatus, NullHost, Value};
//!
//! let mut engine = Engine::from_source(
//!     r#"
//!     function add(a: int, b: int): int { return a + b; }
//!     var r: add(40, 2);
//!     "#,
//!     Box::new(NullHost),
//! )
//! .unwrap();
//!
//! assert_eq!(engine.run_to_completion(10_000), ExecStatus::Finished);
//! assert_eq!(engine.get_global("r"), Some(Value::Int(42)));
//! ```
//!
//! # The language
//!
//! - `var NAME : EXPR ;` declares a variable (initializer required).
//! - **`=` is the equality operator.** Assignment is the keyword statement
//!   `assign TARGET VALUE ;` where the target is a variable, `obj.field`,
//!   or `arr[index]`. This removes the classic `=`/`==` ambiguity.
//! - Functions: `function name(a: int, b: string): int { … }`.
//! - Classes with fields, one constructor, and methods; `Name(args)` with an
//!   uppercase initial is a constructor call.
//! - Control flow: `if`/`else`, `while`,
//!   `for (var i: 0; i < n; assign i i + 1) { … }`, ternary `? :`,
//!   `try`/`catch`/`finally`.
//! - Template literals: `` `hi ${1 + 2}` ``.
//! - `and`/`or` compile to non-short-circuiting boolean opcodes; use `if`
//!   or the ternary for guarded evaluation.
//!
//! # Host interface
//!
//! Scripts reach the device through qualified native calls such as
//! `os.console.print(…)`, `os.display.drawCircle(…)`, or
//! `os.timer.setInterval(callback, ms)`. The VM dispatches them to a single
//! [`Host`] trait object; implement the subsystems your hardware has and
//! leave the rest as the built-in no-ops. Input callbacks are registered by
//! the script (`os.encoder.onTurn(handler)`) and delivered by the embedding
//! loop between instruction batches.
//!
//! # Execution model
//!
//! [`Vm::execute`] runs a bounded instruction batch and returns OK, YIELD
//! (cooperative sleep), FINISHED, ERROR, or OUT_OF_MEMORY. Heap usage is
//! byte-counted against the module's declared budget; there is no garbage
//! collector.

mod ast;
mod compiler;
mod diagnostic;
mod disasm;
mod engine;
mod error;
mod heap;
mod host;
mod lexer;
mod module;
mod native;
mod opcode;
mod parser;
mod serialize;
mod token;
mod value;
mod vm;

pub use ast::{
    BinaryOp, ClassDecl, ConstructorDecl, Expr, FieldDecl, ForIncrement, FunctionDecl, MethodDecl,
    Parameter, Pos, PrimitiveKind, Program, Stmt, TemplatePart, TypeExpr, UnaryOp,
};
pub use compiler::{compile, CompileOptions, CompileOutput};
pub use diagnostic::{render_fault, FaultReport};
pub use disasm::disassemble;
pub use engine::{compile_source, Engine};
pub use error::{Error, Result};
pub use heap::Heap;
pub use host::{Host, NullHost, RecordingHost};
pub use lexer::Lexer;
pub use module::{BytecodeModule, LineEntry, Metadata, MAGIC, VERSION_MAJOR, VERSION_MINOR};
pub use native::{native_for_path, NativeId, NATIVE_PATHS};
pub use opcode::Opcode;
pub use parser::Parser;
pub use serialize::{checksum, deserialize, serialize};
pub use token::{Token, TokenKind};
pub use value::{FromValue, Object, TypeMismatch, Value};
pub use vm::{ExecStatus, Limits, Vm, VmError};
