//! Stack-based bytecode virtual machine.
//!
//! A classic fetch-decode-execute loop over the module's raw code bytes.
//! All runtime state lives here: the operand stack, call frames, the flat
//! locals vector, globals, the heap accountant, registered callbacks, and
//! timers. The host is reached only through the `Box<dyn Host>` the VM owns.
//!
//! Scheduling is cooperative. [`Vm::execute`] runs at most a caller-chosen
//! number of instructions and reports one of OK / YIELD / FINISHED / ERROR /
//! OUT_OF_MEMORY; the host calls it once per frame and delivers input events
//! and timers between batches via [`Vm::dispatch_event`] and
//! [`Vm::tick_timers`]. `system.sleep` never blocks: it parks the VM in a
//! yielded state carrying the wake deadline.
//!
//! A fault either transfers control to the innermost active `TRY` handler
//! (with the fault value on the operand stack) or stops the VM with a
//! diagnostic. Out-of-memory is never catchable.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use tracing::{debug, trace};

use crate::heap::Heap;
use crate::host::Host;
use crate::module::BytecodeModule;
use crate::native::{callback_event, NativeId};
use crate::opcode::Opcode;
use crate::value::{Object, Value};

/// Result of an [`Vm::execute`] batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Batch budget exhausted; more work remains.
    Ok,
    /// Sleeping until a wall-clock deadline.
    Yield,
    /// `HALT` reached (or stop requested).
    Finished,
    /// Script fault; see [`Vm::error`].
    Error,
    /// Heap budget exceeded; uncatchable.
    OutOfMemory,
}

/// Diagnostic for an unhandled fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    pub message: String,
    /// PC of the faulting instruction.
    pub pc: u32,
    /// Source line, when the module carries a debug map.
    pub line: Option<u32>,
}

/// Resource limits for a VM instance.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub operand_stack_limit: usize,
    pub call_stack_limit: usize,
    /// Instruction budget for a single callback invocation.
    pub callback_instruction_limit: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            operand_stack_limit: 1024,
            call_stack_limit: 64,
            callback_instruction_limit: 1_000_000,
        }
    }
}

/// An active `TRY` region in a frame.
#[derive(Debug, Clone, Copy)]
struct TryHandler {
    handler_pc: usize,
    /// Operand-stack depth at `TRY`; restored before entering the handler.
    stack_depth: usize,
}

/// A call activation record.
#[derive(Debug)]
struct Frame {
    /// Where to resume in the caller. [`SENTINEL_PC`] marks a host-initiated
    /// callback frame: returning from it ends the callback.
    return_pc: usize,
    locals_base: usize,
    /// Number of locals bound at entry (receiver + parameters).
    local_count: usize,
    try_handlers: Vec<TryHandler>,
}

/// `return_pc` marker for callback frames.
const SENTINEL_PC: usize = usize::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    /// Parked until the host clock reaches the deadline.
    Yielded { until_ms: u32 },
    Finished,
    Faulted,
    OutOfMemory,
}

/// A registered script timer.
#[derive(Debug, Clone)]
struct Timer {
    id: i32,
    callback: Value,
    interval_ms: u32,
    next_due_ms: u32,
    repeating: bool,
}

/// A fault raised by an instruction. Either transfers to a handler or stops
/// the VM.
enum StepFault {
    /// Catchable: the value lands on the operand stack at the handler.
    Fault { message: String, value: Value },
    /// Uncatchable heap exhaustion.
    OutOfMemory,
}

impl StepFault {
    fn new(message: impl Into<String>) -> Self {
        let message = message.into();
        let value = Value::string(&message);
        StepFault::Fault { message, value }
    }
}

type StepResult<T> = Result<T, StepFault>;

pub struct Vm {
    module: BytecodeModule,
    host: Box<dyn Host>,
    limits: Limits,

    pc: usize,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    locals: Vec<Value>,
    /// Parallel to `module.globals`.
    globals: Vec<Value>,
    heap: Heap,
    /// Constants interned once as `Rc<str>` so pushes do not allocate.
    constants: Vec<Rc<str>>,

    status: Status,
    error: Option<VmError>,
    stop_requested: bool,

    /// Event name → registered script callback.
    callbacks: HashMap<String, Value>,
    timers: Vec<Timer>,
    next_timer_id: i32,
}

impl Vm {
    pub fn new(module: BytecodeModule, host: Box<dyn Host>) -> Self {
        Self::with_limits(module, host, Limits::default())
    }

    pub fn with_limits(module: BytecodeModule, host: Box<dyn Host>, limits: Limits) -> Self {
        let heap = Heap::new(module.metadata.heap_size as usize);
        let constants = module.constants.iter().map(|c| Rc::from(c.as_str())).collect();
        let globals = vec![Value::Null; module.globals.len()];
        let pc = module.main_entry_point as usize;
        debug!(
            code_bytes = module.code.len(),
            heap_budget = module.metadata.heap_size,
            "vm created"
        );
        Self {
            module,
            host,
            limits,
            pc,
            stack: Vec::new(),
            frames: vec![Frame {
                return_pc: SENTINEL_PC,
                locals_base: 0,
                local_count: 0,
                try_handlers: Vec::new(),
            }],
            locals: Vec::new(),
            globals,
            heap,
            constants,
            status: Status::Running,
            error: None,
            stop_requested: false,
            callbacks: HashMap::new(),
            timers: Vec::new(),
            next_timer_id: 1,
        }
    }

    // -----------------------------------------------------------------------
    // Host-facing surface
    // -----------------------------------------------------------------------

    /// Run at most `max_instructions` steps of the main program.
    pub fn execute(&mut self, max_instructions: u32) -> ExecStatus {
        if self.stop_requested {
            self.status = Status::Finished;
        }
        match self.status {
            Status::Faulted => return ExecStatus::Error,
            Status::OutOfMemory => return ExecStatus::OutOfMemory,
            Status::Finished => return ExecStatus::Finished,
            Status::Yielded { until_ms } => {
                if self.host.system_get_time() < until_ms {
                    return ExecStatus::Yield;
                }
                self.status = Status::Running;
            }
            Status::Running => {}
        }

        for _ in 0..max_instructions {
            self.step();
            match self.status {
                Status::Running => {}
                Status::Yielded { .. } => return ExecStatus::Yield,
                Status::Finished => return ExecStatus::Finished,
                Status::Faulted => return ExecStatus::Error,
                Status::OutOfMemory => return ExecStatus::OutOfMemory,
            }
        }
        ExecStatus::Ok
    }

    /// Ask the VM to exit at the next batch boundary, without fault.
    pub fn request_stop(&mut self) {
        self.stop_requested = true;
    }

    /// Diagnostic of the last unhandled fault.
    pub fn error(&self) -> Option<&VmError> {
        self.error.as_ref()
    }

    /// Current heap accounting.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn host_mut(&mut self) -> &mut dyn Host {
        self.host.as_mut()
    }

    pub fn module(&self) -> &BytecodeModule {
        &self.module
    }

    /// Read a global by name.
    pub fn get_global(&self, name: &str) -> Option<Value> {
        let idx = self.module.globals.iter().position(|g| g == name)?;
        self.globals.get(idx).cloned()
    }

    /// Write a global by name. Returns false if the module never mentions it.
    pub fn set_global(&mut self, name: &str, value: Value) -> bool {
        match self.module.globals.iter().position(|g| g == name) {
            Some(idx) => {
                self.globals[idx] = value;
                true
            }
            None => false,
        }
    }

    /// A [`Value::Function`] for a module function, by name.
    pub fn function_value(&self, name: &str) -> Option<Value> {
        self.module
            .function_index(name)
            .map(|index| Value::Function {
                index,
                param_count: 0,
            })
    }

    /// Invoke a script function from the host: push the arguments, run a
    /// sentinel-framed activation to completion, and discard the result.
    ///
    /// Callback invocations are serialized with the main loop by
    /// construction (`&mut self`); the main PC and status are saved and
    /// restored around the activation. A fault inside the callback stops
    /// the VM.
    pub fn invoke_function(&mut self, func: &Value, args: &[Value]) -> ExecStatus {
        match self.status {
            Status::Faulted => return ExecStatus::Error,
            Status::OutOfMemory => return ExecStatus::OutOfMemory,
            _ => {}
        }

        let Some(index) = self.resolve_function(func) else {
            self.fail_with(VmError {
                message: "NameError: value is not callable".to_string(),
                pc: self.pc as u32,
                line: None,
            });
            return ExecStatus::Error;
        };

        let saved_pc = self.pc;
        let saved_status = self.status;
        self.status = Status::Running;

        for arg in args {
            self.stack.push(arg.clone());
        }
        let entered = self.enter_call(index, args.len());
        if let Err(fault) = entered {
            self.handle_fault(fault, saved_pc);
            return self.status_as_exec();
        }
        // Mark the newly pushed frame as the callback boundary.
        let callback_frame = self.frames.len() - 1;
        let stack_floor = self.stack.len();
        if let Some(frame) = self.frames.last_mut() {
            frame.return_pc = SENTINEL_PC;
        }

        let mut executed = 0u32;
        while self.pc != SENTINEL_PC {
            self.step();
            match self.status {
                Status::Running => {}
                // Sleeping inside a callback abandons the rest of the
                // callback; the sleep deadline is kept for the main loop.
                Status::Yielded { .. } => break,
                _ => return self.status_as_exec(),
            }
            executed += 1;
            if executed > self.limits.callback_instruction_limit {
                self.fail_with(VmError {
                    message: "Callback instruction limit exceeded".to_string(),
                    pc: self.pc as u32,
                    line: None,
                });
                return ExecStatus::Error;
            }
        }

        if self.pc == SENTINEL_PC {
            // Discard the callback's return value.
            self.stack.pop();
        } else {
            // Abandoned mid-flight: unwind the callback's frames, locals,
            // and operands so the main program resumes on a clean stack.
            if let Some(frame) = self.frames.get(callback_frame) {
                self.locals.truncate(frame.locals_base);
            }
            self.frames.truncate(callback_frame);
            self.stack.truncate(stack_floor);
        }
        self.pc = saved_pc;
        if matches!(self.status, Status::Running) {
            self.status = saved_status;
        }
        self.status_as_exec()
    }

    /// Deliver a named input event to the registered script callback, if
    /// any. Events arriving after a fault are suppressed.
    pub fn dispatch_event(&mut self, event: &str, args: &[Value]) -> ExecStatus {
        match self.status {
            Status::Faulted => return ExecStatus::Error,
            Status::OutOfMemory => return ExecStatus::OutOfMemory,
            _ => {}
        }
        let Some(callback) = self.callbacks.get(event).cloned() else {
            return self.status_as_exec();
        };
        trace!(event, "dispatching callback");
        self.invoke_function(&callback, args)
    }

    /// Fire every timer due at `now_ms`, in registration order. One-shot
    /// timers are removed, intervals rescheduled.
    pub fn tick_timers(&mut self, now_ms: u32) -> ExecStatus {
        let due: Vec<Timer> = self
            .timers
            .iter()
            .filter(|t| t.next_due_ms <= now_ms)
            .cloned()
            .collect();
        for timer in due {
            match self.status {
                Status::Faulted | Status::OutOfMemory => break,
                _ => {}
            }
            self.invoke_function(&timer.callback, &[]);
            if timer.repeating {
                if let Some(t) = self.timers.iter_mut().find(|t| t.id == timer.id) {
                    t.next_due_ms = now_ms.wrapping_add(t.interval_ms);
                }
            } else {
                self.timers.retain(|t| t.id != timer.id);
            }
        }
        self.status_as_exec()
    }

    /// Earliest timer deadline, for host frame pacing.
    pub fn next_timer_due(&self) -> Option<u32> {
        self.timers.iter().map(|t| t.next_due_ms).min()
    }

    /// Wake deadline while yielded in `system.sleep`.
    pub fn sleep_deadline(&self) -> Option<u32> {
        match self.status {
            Status::Yielded { until_ms } => Some(until_ms),
            _ => None,
        }
    }

    fn status_as_exec(&self) -> ExecStatus {
        match self.status {
            Status::Running => ExecStatus::Ok,
            Status::Yielded { .. } => ExecStatus::Yield,
            Status::Finished => ExecStatus::Finished,
            Status::Faulted => ExecStatus::Error,
            Status::OutOfMemory => ExecStatus::OutOfMemory,
        }
    }

    // -----------------------------------------------------------------------
    // Fetch/decode/execute
    // -----------------------------------------------------------------------

    fn step(&mut self) {
        let instr_pc = self.pc;
        if let Err(fault) = self.dispatch() {
            self.handle_fault(fault, instr_pc);
        }
    }

    fn fetch_u8(&mut self) -> StepResult<u8> {
        let byte = *self
            .module
            .code
            .get(self.pc)
            .ok_or_else(|| StepFault::new("Truncated instruction"))?;
        self.pc += 1;
        Ok(byte)
    }

    fn fetch_u16(&mut self) -> StepResult<u16> {
        let lo = self.fetch_u8()?;
        let hi = self.fetch_u8()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn fetch_i32(&mut self) -> StepResult<i32> {
        let b0 = self.fetch_u8()?;
        let b1 = self.fetch_u8()?;
        let b2 = self.fetch_u8()?;
        let b3 = self.fetch_u8()?;
        Ok(i32::from_le_bytes([b0, b1, b2, b3]))
    }

    fn push(&mut self, value: Value) -> StepResult<()> {
        if self.stack.len() >= self.limits.operand_stack_limit {
            return Err(StepFault::new("StackOverflow: operand stack limit exceeded"));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> StepResult<Value> {
        self.stack
            .pop()
            .ok_or_else(|| StepFault::new("StackUnderflow: operand stack is empty"))
    }

    fn dispatch(&mut self) -> StepResult<()> {
        let byte = self.fetch_u8()?;
        let op = Opcode::try_from(byte)
            .map_err(|_| StepFault::new(format!("NameError: invalid opcode 0x{byte:02X}")))?;

        match op {
            Opcode::Nop => {}
            Opcode::Pop => {
                self.pop()?;
            }
            Opcode::Dup => {
                let top = self
                    .stack
                    .last()
                    .cloned()
                    .ok_or_else(|| StepFault::new("StackUnderflow: operand stack is empty"))?;
                self.push(top)?;
            }
            Opcode::Swap => {
                let a = self.pop()?;
                let b = self.pop()?;
                self.push(a)?;
                self.push(b)?;
            }

            Opcode::PushNull => self.push(Value::Null)?,
            Opcode::PushTrue => self.push(Value::Bool(true))?,
            Opcode::PushFalse => self.push(Value::Bool(false))?,
            Opcode::PushI8 => {
                let v = self.fetch_u8()? as i8;
                self.push(Value::Int(i32::from(v)))?;
            }
            Opcode::PushI16 => {
                let v = self.fetch_u16()? as i16;
                self.push(Value::Int(i32::from(v)))?;
            }
            Opcode::PushI32 => {
                let v = self.fetch_i32()?;
                self.push(Value::Int(v))?;
            }
            Opcode::PushF32 => {
                let bits = self.fetch_i32()? as u32;
                self.push(Value::Float(f32::from_bits(bits)))?;
            }
            Opcode::PushStr => {
                let idx = self.fetch_u16()? as usize;
                let s = self
                    .constants
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| StepFault::new("NameError: bad constant index"))?;
                self.push(Value::Str(s))?;
            }

            Opcode::Add => self.binary_add()?,
            Opcode::Sub => self.binary_numeric(op)?,
            Opcode::Mul => self.binary_numeric(op)?,
            Opcode::Div => self.binary_numeric(op)?,
            Opcode::Mod => self.binary_numeric(op)?,
            Opcode::Neg => {
                let v = self.pop()?;
                let result = match v {
                    Value::Int(i) => Value::Int(i.wrapping_neg()),
                    Value::Float(f) => Value::Float(-f),
                    other => {
                        return Err(StepFault::new(format!(
                            "TypeError: cannot negate {}",
                            other.type_name()
                        )));
                    }
                };
                self.push(result)?;
            }
            Opcode::StrConcat => {
                let right = self.pop()?;
                let left = self.pop()?;
                let s = self.concat(&left, &right)?;
                self.push(s)?;
            }

            Opcode::Eq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left == right))?;
            }
            Opcode::Ne => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left != right))?;
            }
            Opcode::Lt | Opcode::Le | Opcode::Gt | Opcode::Ge => self.binary_compare(op)?,
            Opcode::Not => {
                let v = self.pop()?;
                self.push(Value::Bool(!v.is_truthy()))?;
            }
            Opcode::And => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left.is_truthy() && right.is_truthy()))?;
            }
            Opcode::Or => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Bool(left.is_truthy() || right.is_truthy()))?;
            }

            Opcode::Jump => {
                let delta = self.fetch_i32()?;
                self.jump(delta)?;
            }
            Opcode::JumpIf => {
                let delta = self.fetch_i32()?;
                if self.pop()?.is_truthy() {
                    self.jump(delta)?;
                }
            }
            Opcode::JumpIfNot => {
                let delta = self.fetch_i32()?;
                if !self.pop()?.is_truthy() {
                    self.jump(delta)?;
                }
            }

            Opcode::Call => {
                let func_idx = self.fetch_u16()?;
                let argc = self.fetch_u8()?;
                self.enter_call(func_idx, argc as usize)?;
            }
            Opcode::Return => {
                let result = self.pop()?;
                let frame = self
                    .frames
                    .pop()
                    .ok_or_else(|| StepFault::new("StackUnderflow: call stack is empty"))?;
                self.locals.truncate(frame.locals_base);
                self.pc = frame.return_pc;
                self.push(result)?;
            }
            Opcode::CallNative => {
                let raw = self.fetch_u16()?;
                let argc = self.fetch_u8()? as usize;
                self.call_native(raw, argc)?;
            }

            Opcode::LoadLocal => {
                let slot = self.fetch_u8()? as usize;
                let base = self.current_frame_base();
                let value = self.locals.get(base + slot).cloned().unwrap_or(Value::Null);
                self.push(value)?;
            }
            Opcode::StoreLocal => {
                let slot = self.fetch_u8()? as usize;
                let base = self.current_frame_base();
                let value = self.pop()?;
                let idx = base + slot;
                if idx >= self.locals.len() {
                    self.locals.resize(idx + 1, Value::Null);
                }
                self.locals[idx] = value;
            }
            Opcode::LoadGlobal => {
                let idx = self.fetch_u16()? as usize;
                let value = self
                    .globals
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| StepFault::new("NameError: bad global index"))?;
                self.push(value)?;
            }
            Opcode::StoreGlobal => {
                let idx = self.fetch_u16()? as usize;
                let value = self.pop()?;
                if idx >= self.globals.len() {
                    return Err(StepFault::new("NameError: bad global index"));
                }
                self.globals[idx] = value;
            }

            Opcode::NewObject => {
                let idx = self.fetch_u16()? as usize;
                let class_name = self
                    .constants
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| StepFault::new("NameError: bad constant index"))?;
                self.heap
                    .charge_object(&class_name)
                    .map_err(|_| StepFault::OutOfMemory)?;
                let object = Rc::new(RefCell::new(Object::new(class_name)));
                self.push(Value::Object(object))?;
            }
            Opcode::GetField => {
                let idx = self.fetch_u16()? as usize;
                let name = self
                    .constants
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| StepFault::new("NameError: bad constant index"))?;
                let target = self.pop()?;
                let Value::Object(object) = target else {
                    return Err(StepFault::new(format!(
                        "TypeError: cannot read field '{}' of {}",
                        name,
                        target.type_name()
                    )));
                };
                // A missing field reads as null.
                let value = object
                    .borrow()
                    .fields
                    .get(name.as_ref())
                    .cloned()
                    .unwrap_or(Value::Null);
                self.push(value)?;
            }
            Opcode::SetField => {
                let idx = self.fetch_u16()? as usize;
                let name = self
                    .constants
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| StepFault::new("NameError: bad constant index"))?;
                let target = self.pop()?;
                let value = self.pop()?;
                let Value::Object(object) = target else {
                    return Err(StepFault::new(format!(
                        "TypeError: cannot set field '{}' of {}",
                        name,
                        target.type_name()
                    )));
                };
                let is_new = !object.borrow().fields.contains_key(name.as_ref());
                if is_new {
                    self.heap
                        .charge_field(&name)
                        .map_err(|_| StepFault::OutOfMemory)?;
                }
                object
                    .borrow_mut()
                    .fields
                    .insert(name.to_string(), value.clone());
                // The stored value is the expression result.
                self.push(value)?;
            }
            Opcode::NewArray => {
                let size = self.pop()?;
                let Value::Int(size) = size else {
                    return Err(StepFault::new("TypeError: array size must be an int"));
                };
                if size < 0 {
                    return Err(StepFault::new("IndexError: negative array size"));
                }
                let size = size as usize;
                if self.stack.len() < size {
                    return Err(StepFault::new("StackUnderflow: operand stack is empty"));
                }
                self.heap
                    .charge_array(size)
                    .map_err(|_| StepFault::OutOfMemory)?;
                let elements = self.stack.split_off(self.stack.len() - size);
                self.push(Value::Array(Rc::new(RefCell::new(elements))))?;
            }
            Opcode::GetIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = self.read_index(&target, &index)?;
                self.push(value)?;
            }
            Opcode::SetIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = self.pop()?;
                self.write_index(&target, &index, value.clone())?;
                self.push(value)?;
            }

            Opcode::Try => {
                let delta = self.fetch_i32()?;
                let handler_pc = self.offset_pc(delta)?;
                let stack_depth = self.stack.len();
                self.current_frame_mut().try_handlers.push(TryHandler {
                    handler_pc,
                    stack_depth,
                });
            }
            Opcode::EndTry => {
                if self.current_frame_mut().try_handlers.pop().is_none() {
                    return Err(StepFault::new("END_TRY without an active TRY"));
                }
            }
            Opcode::Throw => {
                let value = self.pop()?;
                let message = value.to_display_string();
                return Err(StepFault::Fault { message, value });
            }

            Opcode::Print => {
                // Debug alias for the console print native.
                let value = self.pop()?;
                self.host.console_print(&value.to_display_string());
            }
            Opcode::Halt => {
                self.status = Status::Finished;
            }
        }
        Ok(())
    }

    fn jump(&mut self, delta: i32) -> StepResult<()> {
        self.pc = self.offset_pc(delta)?;
        Ok(())
    }

    /// Absolute PC for a jump delta relative to the current (post-operand)
    /// boundary.
    fn offset_pc(&self, delta: i32) -> StepResult<usize> {
        let target = self.pc as i64 + i64::from(delta);
        if target < 0 || target > self.module.code.len() as i64 {
            return Err(StepFault::new("Jump target outside code"));
        }
        Ok(target as usize)
    }

    fn current_frame_base(&self) -> usize {
        self.frames.last().map(|f| f.locals_base).unwrap_or(0)
    }

    fn current_frame_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().expect("frame stack is never empty")
    }

    /// Shared CALL path. The receiver, for `Class::…` callees, is the value
    /// immediately beneath the arguments and becomes local slot 0.
    fn enter_call(&mut self, func_idx: u16, argc: usize) -> StepResult<()> {
        let name = self
            .module
            .functions
            .get(func_idx as usize)
            .ok_or_else(|| StepFault::new("NameError: bad function index"))?;
        let is_method = name.contains("::");
        let entry = *self
            .module
            .function_entry_points
            .get(func_idx as usize)
            .ok_or_else(|| StepFault::new("NameError: missing function entry point"))?;

        if self.frames.len() >= self.limits.call_stack_limit {
            return Err(StepFault::new("CallStackOverflow: call stack limit exceeded"));
        }
        if self.stack.len() < argc + usize::from(is_method) {
            return Err(StepFault::new("StackUnderflow: operand stack is empty"));
        }

        let args_at = self.stack.len() - argc;
        let mut bound: Vec<Value> = self.stack.split_off(args_at);
        if is_method {
            let receiver = self.stack.pop().expect("receiver checked above");
            bound.insert(0, receiver);
        }

        let locals_base = self.locals.len();
        let local_count = bound.len();
        self.locals.extend(bound);
        self.frames.push(Frame {
            return_pc: self.pc,
            locals_base,
            local_count,
            try_handlers: Vec::new(),
        });
        self.pc = entry as usize;
        Ok(())
    }

    fn resolve_function(&self, func: &Value) -> Option<u16> {
        match func {
            Value::Function { index, .. } => Some(*index),
            Value::Str(name) => self.module.function_index(name),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Arithmetic, comparison, indexing
    // -----------------------------------------------------------------------

    /// ADD: numeric addition with int→float promotion, or string
    /// concatenation when either operand is a string.
    fn binary_add(&mut self) -> StepResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match (&left, &right) {
            (Value::Str(_), _) | (_, Value::Str(_)) => self.concat(&left, &right)?,
            (Value::Int(a), Value::Int(b)) => Value::Int(a.wrapping_add(*b)),
            _ => {
                let (a, b) = numeric_pair(&left, &right, "+")?;
                Value::Float(a + b)
            }
        };
        self.push(result)
    }

    fn binary_numeric(&mut self, op: Opcode) -> StepResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let result = match (&left, &right) {
            (Value::Int(a), Value::Int(b)) => {
                let (a, b) = (*a, *b);
                match op {
                    Opcode::Sub => Value::Int(a.wrapping_sub(b)),
                    Opcode::Mul => Value::Int(a.wrapping_mul(b)),
                    Opcode::Div => {
                        if b == 0 {
                            return Err(StepFault::new("ArithmeticError: division by zero"));
                        }
                        Value::Int(a.wrapping_div(b))
                    }
                    Opcode::Mod => {
                        if b == 0 {
                            return Err(StepFault::new("ArithmeticError: modulo by zero"));
                        }
                        Value::Int(a.wrapping_rem(b))
                    }
                    _ => unreachable!("binary_numeric called with {op:?}"),
                }
            }
            _ => {
                let symbol = match op {
                    Opcode::Sub => "-",
                    Opcode::Mul => "*",
                    Opcode::Div => "/",
                    Opcode::Mod => "%",
                    _ => unreachable!("binary_numeric called with {op:?}"),
                };
                let (a, b) = numeric_pair(&left, &right, symbol)?;
                match op {
                    Opcode::Sub => Value::Float(a - b),
                    Opcode::Mul => Value::Float(a * b),
                    Opcode::Div => Value::Float(a / b),
                    Opcode::Mod => Value::Float(a % b),
                    _ => unreachable!(),
                }
            }
        };
        self.push(result)
    }

    fn binary_compare(&mut self, op: Opcode) -> StepResult<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let ordering = match (&left, &right) {
            (Value::Str(a), Value::Str(b)) => a.as_ref().cmp(b.as_ref()),
            _ => {
                let (a, b) = numeric_pair(&left, &right, comparison_symbol(op))?;
                a.partial_cmp(&b).ok_or_else(|| {
                    StepFault::new("ArithmeticError: comparison with NaN")
                })?
            }
        };
        let result = match op {
            Opcode::Lt => ordering.is_lt(),
            Opcode::Le => ordering.is_le(),
            Opcode::Gt => ordering.is_gt(),
            Opcode::Ge => ordering.is_ge(),
            _ => unreachable!("binary_compare called with {op:?}"),
        };
        self.push(Value::Bool(result))
    }

    /// String conversion + concatenation with heap accounting.
    fn concat(&mut self, left: &Value, right: &Value) -> StepResult<Value> {
        let mut s = left.to_display_string();
        s.push_str(&right.to_display_string());
        self.heap
            .charge_string(s.len())
            .map_err(|_| StepFault::OutOfMemory)?;
        Ok(Value::string(s))
    }

    fn read_index(&mut self, target: &Value, index: &Value) -> StepResult<Value> {
        let Value::Int(i) = index else {
            return Err(StepFault::new("TypeError: index must be an int"));
        };
        match target {
            Value::Array(items) => {
                let items = items.borrow();
                usize::try_from(*i)
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .ok_or_else(|| {
                        StepFault::new(format!(
                            "IndexError: index {} out of range for length {}",
                            i,
                            items.len()
                        ))
                    })
            }
            Value::Str(s) => {
                let ch = usize::try_from(*i).ok().and_then(|i| s.chars().nth(i));
                match ch {
                    Some(ch) => {
                        self.heap
                            .charge_string(ch.len_utf8())
                            .map_err(|_| StepFault::OutOfMemory)?;
                        Ok(Value::string(ch.to_string()))
                    }
                    None => Err(StepFault::new(format!(
                        "IndexError: index {} out of range for length {}",
                        i,
                        s.chars().count()
                    ))),
                }
            }
            other => Err(StepFault::new(format!(
                "TypeError: {} is not indexable",
                other.type_name()
            ))),
        }
    }

    fn write_index(&mut self, target: &Value, index: &Value, value: Value) -> StepResult<()> {
        let Value::Int(i) = index else {
            return Err(StepFault::new("TypeError: index must be an int"));
        };
        let Value::Array(items) = target else {
            return Err(StepFault::new(format!(
                "TypeError: cannot assign into {}",
                target.type_name()
            )));
        };
        let mut items = items.borrow_mut();
        let len = items.len();
        let slot = usize::try_from(*i)
            .ok()
            .filter(|&i| i < len)
            .ok_or_else(|| {
                StepFault::new(format!(
                    "IndexError: index {i} out of range for length {len}"
                ))
            })?;
        items[slot] = value;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Fault handling
    // -----------------------------------------------------------------------

    /// Route a fault to the innermost active handler, or stop the VM.
    ///
    /// The search walks frames from the top but never crosses a callback
    /// sentinel boundary: a handler belonging to the suspended main program
    /// must not catch a fault raised inside a host callback.
    fn handle_fault(&mut self, fault: StepFault, instr_pc: usize) {
        let (message, value) = match fault {
            StepFault::OutOfMemory => {
                let message = format!(
                    "Out of memory: heap budget of {} bytes exhausted",
                    self.heap.budget()
                );
                self.error = Some(VmError {
                    message,
                    pc: instr_pc as u32,
                    line: self.module.line_for_pc(instr_pc as u32),
                });
                self.status = Status::OutOfMemory;
                return;
            }
            StepFault::Fault { message, value } => (message, value),
        };

        for i in (0..self.frames.len()).rev() {
            if let Some(handler) = self.frames[i].try_handlers.pop() {
                // Unwind callee frames and their locals.
                if let Some(next) = self.frames.get(i + 1) {
                    self.locals.truncate(next.locals_base);
                }
                self.frames.truncate(i + 1);
                self.stack.truncate(handler.stack_depth);
                // The fault value is on the stack at the handler.
                self.stack.push(value);
                self.pc = handler.handler_pc;
                trace!(%message, handler_pc = handler.handler_pc, "fault caught");
                return;
            }
            if self.frames[i].return_pc == SENTINEL_PC && i > 0 {
                break;
            }
        }

        let line = self.module.line_for_pc(instr_pc as u32);
        debug!(%message, pc = instr_pc, "unhandled fault");
        self.fail_with(VmError {
            message,
            pc: instr_pc as u32,
            line,
        });
    }

    fn fail_with(&mut self, error: VmError) {
        self.error = Some(error);
        self.status = Status::Faulted;
    }

    // -----------------------------------------------------------------------
    // Natives
    // -----------------------------------------------------------------------

    fn call_native(&mut self, raw_id: u16, argc: usize) -> StepResult<()> {
        let id = NativeId::try_from(raw_id)
            .map_err(|_| StepFault::new(format!("NameError: unknown native id 0x{raw_id:04X}")))?;

        if self.stack.len() < argc {
            return Err(StepFault::new("StackUnderflow: operand stack is empty"));
        }
        let args: Vec<Value> = self.stack.split_off(self.stack.len() - argc);

        // Callback registration binds the function argument to the event.
        if let Some(event) = callback_event(id) {
            let func = args
                .first()
                .ok_or_else(|| StepFault::new("TypeError: callback function required"))?;
            let resolved = self.resolve_function(func).map(|index| Value::Function {
                index,
                param_count: 0,
            });
            let Some(resolved) = resolved else {
                return Err(StepFault::new(format!(
                    "TypeError: '{}' is not a function",
                    func.to_display_string()
                )));
            };
            self.callbacks.insert(event.to_string(), resolved);
            return self.push(Value::Null);
        }

        let result = self.dispatch_native(id, &args)?;
        self.push(result)
    }

    fn dispatch_native(&mut self, id: NativeId, args: &[Value]) -> StepResult<Value> {
        use NativeId::*;
        let result = match id {
            ConsolePrint => {
                self.host.console_print(&nat_display(args, 0));
                Value::Null
            }
            ConsolePrintln => {
                self.host.console_println(&nat_display(args, 0));
                Value::Null
            }
            ConsoleLog => {
                self.host.console_log(&nat_display(args, 0));
                Value::Null
            }
            ConsoleWarn => {
                self.host.console_warn(&nat_display(args, 0));
                Value::Null
            }
            ConsoleError => {
                self.host.console_error(&nat_display(args, 0));
                Value::Null
            }
            ConsoleClear => {
                self.host.console_clear();
                Value::Null
            }

            DisplayClear => {
                let color = nat_int(args, 0)? as u32;
                self.host.display_clear(color);
                Value::Null
            }
            DisplayDrawPixel => {
                self.host.display_draw_pixel(
                    nat_int(args, 0)?,
                    nat_int(args, 1)?,
                    nat_int(args, 2)? as u32,
                );
                Value::Null
            }
            DisplayDrawLine => {
                self.host.display_draw_line(
                    nat_int(args, 0)?,
                    nat_int(args, 1)?,
                    nat_int(args, 2)?,
                    nat_int(args, 3)?,
                    nat_int(args, 4)? as u32,
                );
                Value::Null
            }
            DisplayDrawRect => {
                self.host.display_draw_rect(
                    nat_int(args, 0)?,
                    nat_int(args, 1)?,
                    nat_int(args, 2)?,
                    nat_int(args, 3)?,
                    nat_int(args, 4)? as u32,
                    nat_truthy(args, 5),
                );
                Value::Null
            }
            DisplayDrawCircle => {
                self.host.display_draw_circle(
                    nat_int(args, 0)?,
                    nat_int(args, 1)?,
                    nat_int(args, 2)?,
                    nat_int(args, 3)? as u32,
                    nat_truthy(args, 4),
                );
                Value::Null
            }
            DisplayDrawText => {
                self.host.display_draw_text(
                    nat_int(args, 0)?,
                    nat_int(args, 1)?,
                    &nat_display(args, 2),
                    nat_int(args, 3)? as u32,
                    nat_int(args, 4)?,
                );
                Value::Null
            }
            DisplayDrawImage => {
                self.host
                    .display_draw_image(nat_int(args, 0)?, nat_int(args, 1)?, &nat_str(args, 2)?);
                Value::Null
            }
            DisplaySetBrightness => {
                self.host.display_set_brightness(nat_int(args, 0)?);
                Value::Null
            }
            DisplaySetTitle => {
                self.host.display_set_title(&nat_str(args, 0)?);
                Value::Null
            }
            DisplayGetWidth => Value::Int(self.host.display_get_width()),
            DisplayGetHeight => Value::Int(self.host.display_get_height()),

            EncoderGetButton => Value::Bool(self.host.encoder_get_button()),
            EncoderGetDelta => Value::Int(self.host.encoder_get_delta()),
            EncoderGetPosition => Value::Int(self.host.encoder_get_position()),
            EncoderReset => {
                self.host.encoder_reset();
                Value::Null
            }

            TouchIsPressed => Value::Bool(self.host.touch_is_pressed()),
            TouchGetX => Value::Int(self.host.touch_get_x()),
            TouchGetY => Value::Int(self.host.touch_get_y()),

            RfidIsPresent => Value::Bool(self.host.rfid_is_present()),
            RfidRead => {
                let tag = self.host.rfid_read();
                self.charged_string(tag)?
            }

            SystemGetTime => Value::Int(self.host.system_get_time() as i32),
            SystemGetRtc => Value::Int(self.host.system_get_rtc() as i32),
            SystemSetRtc => {
                self.host.system_set_rtc(nat_int(args, 0)? as u32);
                Value::Null
            }
            SystemSleep => {
                let ms = nat_int(args, 0)?.max(0) as u32;
                let now = self.host.system_get_time();
                self.status = Status::Yielded {
                    until_ms: now.wrapping_add(ms),
                };
                Value::Null
            }
            SystemYield => {
                let now = self.host.system_get_time();
                self.status = Status::Yielded { until_ms: now };
                Value::Null
            }

            FileOpen => Value::Int(self.host.file_open(&nat_str(args, 0)?, &nat_str(args, 1)?)),
            FileRead => {
                let data = self.host.file_read(nat_int(args, 0)?, nat_int(args, 1)?);
                self.charged_string(data)?
            }
            FileWrite => Value::Int(
                self.host
                    .file_write(nat_int(args, 0)?, &nat_str(args, 1)?),
            ),
            FileClose => {
                self.host.file_close(nat_int(args, 0)?);
                Value::Null
            }
            FileExists => Value::Bool(self.host.file_exists(&nat_str(args, 0)?)),
            FileDelete => Value::Bool(self.host.file_delete(&nat_str(args, 0)?)),
            FileSize => Value::Int(self.host.file_size(&nat_str(args, 0)?)),

            DirList => {
                let entries = self.host.dir_list(&nat_str(args, 0)?);
                self.charged_string_array(entries)?
            }
            DirCreate => Value::Bool(self.host.dir_create(&nat_str(args, 0)?)),
            DirDelete => Value::Bool(self.host.dir_delete(&nat_str(args, 0)?)),
            DirExists => Value::Bool(self.host.dir_exists(&nat_str(args, 0)?)),

            GpioPinMode => {
                self.host.gpio_pin_mode(nat_int(args, 0)?, nat_int(args, 1)?);
                Value::Null
            }
            GpioDigitalWrite => {
                self.host
                    .gpio_digital_write(nat_int(args, 0)?, nat_truthy(args, 1));
                Value::Null
            }
            GpioDigitalRead => Value::Bool(self.host.gpio_digital_read(nat_int(args, 0)?)),
            GpioAnalogRead => Value::Int(self.host.gpio_analog_read(nat_int(args, 0)?)),
            GpioAnalogWrite => {
                self.host
                    .gpio_analog_write(nat_int(args, 0)?, nat_int(args, 1)?);
                Value::Null
            }

            I2cBegin => Value::Bool(self.host.i2c_begin(nat_int(args, 0)?)),
            I2cWrite => Value::Int(self.host.i2c_write(nat_int(args, 0)?, &nat_str(args, 1)?)),
            I2cRead => {
                let data = self.host.i2c_read(nat_int(args, 0)?, nat_int(args, 1)?);
                self.charged_string(data)?
            }
            I2cScan => {
                let found = self.host.i2c_scan();
                self.heap
                    .charge_array(found.len())
                    .map_err(|_| StepFault::OutOfMemory)?;
                Value::Array(Rc::new(RefCell::new(
                    found.into_iter().map(Value::Int).collect(),
                )))
            }

            BuzzerTone => {
                self.host.buzzer_tone(nat_int(args, 0)?, nat_int(args, 1)?);
                Value::Null
            }
            BuzzerNoTone => {
                self.host.buzzer_no_tone();
                Value::Null
            }
            BuzzerBeep => {
                self.host.buzzer_beep();
                Value::Null
            }

            TimerSetInterval => self.register_timer(args, true)?,
            TimerSetTimeout => self.register_timer(args, false)?,
            TimerClearInterval | TimerClearTimeout => {
                let id = nat_int(args, 0)?;
                self.timers.retain(|t| t.id != id);
                Value::Null
            }

            MemoryGetFree => Value::Int(self.host.memory_get_free()),
            MemoryGetUsed => Value::Int(self.host.memory_get_used()),

            PowerGetBatteryLevel => Value::Int(self.host.power_get_battery_level()),
            PowerIsCharging => Value::Bool(self.host.power_is_charging()),
            PowerReboot => {
                self.host.power_reboot();
                Value::Null
            }

            StorageGet => match self.host.storage_get(&nat_str(args, 0)?) {
                Some(value) => self.charged_string(value)?,
                None => Value::Null,
            },
            StorageSet => {
                self.host
                    .storage_set(&nat_str(args, 0)?, &nat_display(args, 1));
                Value::Null
            }
            StorageRemove => {
                self.host.storage_remove(&nat_str(args, 0)?);
                Value::Null
            }
            StorageClear => {
                self.host.storage_clear();
                Value::Null
            }

            SensorReadTemperature => Value::Int(self.host.sensor_read_temperature()),
            SensorReadLight => Value::Int(self.host.sensor_read_light()),

            WifiConnect => Value::Bool(
                self.host
                    .wifi_connect(&nat_str(args, 0)?, &nat_str(args, 1)?),
            ),
            WifiDisconnect => {
                self.host.wifi_disconnect();
                Value::Null
            }
            WifiIsConnected => Value::Bool(self.host.wifi_is_connected()),
            WifiGetIp => {
                let ip = self.host.wifi_get_ip();
                self.charged_string(ip)?
            }

            HttpGet => {
                let body = self.host.http_get(&nat_str(args, 0)?);
                self.charged_string(body)?
            }
            HttpPost => {
                let body = self
                    .host
                    .http_post(&nat_str(args, 0)?, &nat_str(args, 1)?);
                self.charged_string(body)?
            }

            IpcSend => Value::Bool(
                self.host
                    .ipc_send(&nat_str(args, 0)?, &nat_display(args, 1)),
            ),
            IpcReceive => match self.host.ipc_receive(&nat_str(args, 0)?) {
                Some(message) => self.charged_string(message)?,
                None => Value::Null,
            },

            AppExit => {
                self.host.app_exit();
                self.status = Status::Finished;
                Value::Null
            }
            AppLaunch => Value::Bool(self.host.app_launch(&nat_str(args, 0)?)),
            AppList => {
                let apps = self.host.app_list();
                self.charged_string_array(apps)?
            }

            // Registration natives are intercepted in `call_native`.
            EncoderOnTurn | EncoderOnButton | TouchOnPress | TouchOnDrag | TouchOnRelease
            | AppOnLoad | AppOnExit => Value::Null,
        };
        Ok(result)
    }

    fn register_timer(&mut self, args: &[Value], repeating: bool) -> StepResult<Value> {
        let func = args
            .first()
            .ok_or_else(|| StepFault::new("TypeError: callback function required"))?;
        let Some(index) = self.resolve_function(func) else {
            return Err(StepFault::new(format!(
                "TypeError: '{}' is not a function",
                func.to_display_string()
            )));
        };
        let interval_ms = nat_int(args, 1)?.max(0) as u32;
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let now = self.host.system_get_time();
        self.timers.push(Timer {
            id,
            callback: Value::Function {
                index,
                param_count: 0,
            },
            interval_ms,
            next_due_ms: now.wrapping_add(interval_ms),
            repeating,
        });
        Ok(Value::Int(id))
    }

    fn charged_string(&mut self, s: String) -> StepResult<Value> {
        self.heap
            .charge_string(s.len())
            .map_err(|_| StepFault::OutOfMemory)?;
        Ok(Value::string(s))
    }

    fn charged_string_array(&mut self, items: Vec<String>) -> StepResult<Value> {
        self.heap
            .charge_array(items.len())
            .map_err(|_| StepFault::OutOfMemory)?;
        let mut values = Vec::with_capacity(items.len());
        for item in items {
            values.push(self.charged_string(item)?);
        }
        Ok(Value::Array(Rc::new(RefCell::new(values))))
    }
}

/// Display-converted argument (total: any value has a display form).
fn nat_display(args: &[Value], i: usize) -> String {
    args.get(i).map(Value::to_display_string).unwrap_or_default()
}

fn nat_int(args: &[Value], i: usize) -> StepResult<i32> {
    let value = args
        .get(i)
        .ok_or_else(|| StepFault::new(format!("TypeError: missing argument {i}")))?;
    value.as_int().ok_or_else(|| {
        StepFault::new(format!(
            "TypeError: argument {} must be an int, got {}",
            i,
            value.type_name()
        ))
    })
}

fn nat_str(args: &[Value], i: usize) -> StepResult<String> {
    let value = args
        .get(i)
        .ok_or_else(|| StepFault::new(format!("TypeError: missing argument {i}")))?;
    value.as_str().map(str::to_string).ok_or_else(|| {
        StepFault::new(format!(
            "TypeError: argument {} must be a string, got {}",
            i,
            value.type_name()
        ))
    })
}

fn nat_truthy(args: &[Value], i: usize) -> bool {
    args.get(i).map(Value::is_truthy).unwrap_or(false)
}

fn numeric_pair(left: &Value, right: &Value, op: &str) -> StepResult<(f32, f32)> {
    match (left.as_float(), right.as_float()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(StepFault::new(format!(
            "TypeError: cannot apply '{}' to {} and {}",
            op,
            left.type_name(),
            right.type_name()
        ))),
    }
}

fn comparison_symbol(op: Opcode) -> &'static str {
    match op {
        Opcode::Lt => "<",
        Opcode::Le => "<=",
        Opcode::Gt => ">",
        Opcode::Ge => ">=",
        _ => "?",
    }
}
