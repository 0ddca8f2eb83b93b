//! Embedding facade: compile, load, and drive a script against a host.
//!
//! The engine owns the VM and pumps it the way a device firmware loop does:
//! once per display frame it delivers queued input events (in observation
//! order), fires due timers, and then runs an instruction batch. Events are
//! queued — never delivered mid-batch — so callback invocations stay
//! serialized with the main program.

use std::collections::VecDeque;

use tracing::debug;

use crate::compiler::{compile, CompileOptions};
use crate::diagnostic::render_fault;
use crate::disasm::disassemble;
use crate::error::{Error, Result};
use crate::host::Host;
use crate::module::BytecodeModule;
use crate::parser::Parser;
use crate::serialize;
use crate::value::Value;
use crate::vm::{ExecStatus, Limits, Vm, VmError};

/// Compile source text to a module, collecting stage errors into the
/// crate-level [`Error`] surface.
pub fn compile_source(source: &str, options: CompileOptions) -> Result<BytecodeModule> {
    let mut parser = Parser::new(source);
    let program = parser.parse();
    if parser.has_errors() {
        return Err(Error::Syntax(parser.errors().join("\n")));
    }
    let output = compile(&program, options);
    if output.has_errors() {
        return Err(Error::Compile(output.errors.join("\n")));
    }
    Ok(output.module)
}

/// A loaded script bound to a host, ready to be pumped frame by frame.
pub struct Engine {
    vm: Vm,
    /// Original source, kept for fault reports; empty when loaded from a
    /// `.dsb` container.
    source: String,
    events: VecDeque<(String, Vec<Value>)>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("source", &self.source)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Compile `source` and bind it to `host`. Debug info is recorded so
    /// faults can be reported with source context.
    pub fn from_source(source: &str, host: Box<dyn Host>) -> Result<Self> {
        Self::from_source_with_limits(source, host, Limits::default())
    }

    pub fn from_source_with_limits(
        source: &str,
        host: Box<dyn Host>,
        limits: Limits,
    ) -> Result<Self> {
        let options = CompileOptions {
            debug_info: true,
            ..Default::default()
        };
        let module = compile_source(source, options)?;
        debug!(code_bytes = module.code.len(), "engine compiled source");
        Ok(Self {
            vm: Vm::with_limits(module, host, limits),
            source: source.to_string(),
            events: VecDeque::new(),
        })
    }

    /// Bind an already-built module.
    pub fn from_module(module: BytecodeModule, host: Box<dyn Host>) -> Self {
        Self {
            vm: Vm::new(module, host),
            source: String::new(),
            events: VecDeque::new(),
        }
    }

    /// Deserialize a `.dsb` container and bind it.
    pub fn from_bytes(bytes: &[u8], host: Box<dyn Host>) -> Result<Self> {
        let module = serialize::deserialize(bytes)?;
        Ok(Self::from_module(module, host))
    }

    // -----------------------------------------------------------------------
    // Frame pump
    // -----------------------------------------------------------------------

    /// Run one frame: deliver queued events, fire due timers, then execute
    /// up to `budget` instructions of the main program.
    pub fn run_frame(&mut self, budget: u32) -> ExecStatus {
        while let Some((event, args)) = self.events.pop_front() {
            let status = self.vm.dispatch_event(&event, &args);
            if matches!(status, ExecStatus::Error | ExecStatus::OutOfMemory) {
                return status;
            }
        }

        let now = self.vm.host_mut().system_get_time();
        let status = self.vm.tick_timers(now);
        if matches!(status, ExecStatus::Error | ExecStatus::OutOfMemory) {
            return status;
        }

        self.vm.execute(budget)
    }

    /// Keep running frames until the program leaves the runnable state.
    /// Returns on FINISHED, ERROR, OUT_OF_MEMORY, or the first YIELD.
    pub fn run_to_completion(&mut self, budget_per_frame: u32) -> ExecStatus {
        loop {
            match self.run_frame(budget_per_frame) {
                ExecStatus::Ok => continue,
                other => return other,
            }
        }
    }

    /// Deliver the app-load callback, once the main program has set it up.
    pub fn notify_load(&mut self) -> ExecStatus {
        self.vm.dispatch_event("app.onLoad", &[])
    }

    /// Deliver the app-exit callback.
    pub fn notify_exit(&mut self) -> ExecStatus {
        self.vm.dispatch_event("app.onExit", &[])
    }

    // -----------------------------------------------------------------------
    // Input events
    // -----------------------------------------------------------------------

    /// Queue a named event for the next frame.
    pub fn queue_event(&mut self, event: impl Into<String>, args: Vec<Value>) {
        self.events.push_back((event.into(), args));
    }

    pub fn encoder_turn(&mut self, delta: i32) {
        self.queue_event("encoder.onTurn", vec![Value::Int(delta)]);
    }

    pub fn encoder_button(&mut self, pressed: bool) {
        self.queue_event("encoder.onButton", vec![Value::Bool(pressed)]);
    }

    pub fn touch_press(&mut self, x: i32, y: i32) {
        self.queue_event("touch.onPress", vec![Value::Int(x), Value::Int(y)]);
    }

    pub fn touch_drag(&mut self, x: i32, y: i32) {
        self.queue_event("touch.onDrag", vec![Value::Int(x), Value::Int(y)]);
    }

    pub fn touch_release(&mut self, x: i32, y: i32) {
        self.queue_event("touch.onRelease", vec![Value::Int(x), Value::Int(y)]);
    }

    // -----------------------------------------------------------------------
    // State access
    // -----------------------------------------------------------------------

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.vm.get_global(name)
    }

    pub fn set_global(&mut self, name: &str, value: Value) -> bool {
        self.vm.set_global(name, value)
    }

    pub fn request_stop(&mut self) {
        self.vm.request_stop();
    }

    pub fn error(&self) -> Option<&VmError> {
        self.vm.error()
    }

    /// Rendered fault diagnostic with a ±5 line source window when the
    /// source is available.
    pub fn fault_report(&self) -> Option<String> {
        self.vm.error().map(|e| render_fault(&self.source, e))
    }

    pub fn host_mut(&mut self) -> &mut dyn Host {
        self.vm.host_mut()
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn vm_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }

    /// Disassembly listing of the loaded module.
    pub fn disassemble(&self) -> String {
        disassemble(self.vm.module())
    }

    /// Serialize the loaded module back to `.dsb` bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        serialize::serialize(self.vm.module())
    }
}
