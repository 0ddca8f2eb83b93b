//! Bytecode compiler: typed AST → [`BytecodeModule`].
//!
//! Layout is two-pass. A registration pass walks the top level and interns
//! every function and class member into the function table, so calls to
//! not-yet-emitted functions resolve to stable indices without patching.
//! The emission pass then lays out free functions, class constructors
//! (`Class::constructor`) and methods (`Class::method`, with the receiver in
//! local slot 0), records each entry PC, and finally places the top-level
//! statements at `main_entry_point` followed by `HALT`.
//!
//! Forward jump targets use the label/patch approach: jump operands are
//! emitted as placeholders and rewritten once every label's PC is known.
//! Each 4-byte offset is the signed delta from the instruction boundary
//! *after* the operand to the label.
//!
//! Errors are collected, not thrown: compilation always produces a module,
//! and [`CompileOutput::has_errors`] tells the caller not to serialize it.

use std::collections::HashMap;

use tracing::debug;

use crate::ast::{
    BinaryOp, ClassDecl, Expr, ForIncrement, FunctionDecl, Parameter, Pos, Program, Stmt,
    TemplatePart, TypeExpr, UnaryOp,
};
use crate::module::{BytecodeModule, LineEntry, Metadata};
use crate::native::{native_for_path, NativeId};
use crate::opcode::Opcode;

/// Compiler switches supplied by the embedding front-end.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Record the PC → source-line map alongside the code.
    pub debug_info: bool,
    /// App metadata copied into the module header. The serializer fills in
    /// the checksum.
    pub metadata: Metadata,
}

/// The module plus every error collected while producing it.
#[derive(Debug)]
pub struct CompileOutput {
    pub module: BytecodeModule,
    pub errors: Vec<String>,
}

impl CompileOutput {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Compile a parsed program.
pub fn compile(program: &Program, options: CompileOptions) -> CompileOutput {
    let mut compiler = Compiler::new(options);
    compiler.run(program);
    debug!(
        code_bytes = compiler.module.code.len(),
        functions = compiler.module.functions.len(),
        errors = compiler.errors.len(),
        "compilation finished"
    );
    CompileOutput {
        module: compiler.module,
        errors: compiler.errors,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Label(u32);

/// Signature info collected during the registration pass.
#[derive(Debug, Default)]
struct ClassInfo {
    ctor_params: Option<u8>,
    /// Method name → parameter count (excluding the receiver).
    methods: HashMap<String, u8>,
}

/// Per-function compile state, stacked across nested definitions so the
/// enclosing scope is unaffected.
#[derive(Debug, Default)]
struct FuncState {
    locals: HashMap<String, u8>,
    local_count: u8,
    /// Local variable → class name, for method resolution. `this` maps to
    /// the enclosing class inside constructors and methods.
    local_classes: HashMap<String, String>,
    in_function: bool,
}

struct Compiler {
    module: BytecodeModule,
    errors: Vec<String>,
    options: CompileOptions,

    func: FuncState,
    global_classes: HashMap<String, String>,

    /// Free function name → parameter count.
    functions: HashMap<String, u8>,
    classes: HashMap<String, ClassInfo>,

    labels: HashMap<Label, u32>,
    /// (operand byte offset, target) pairs awaiting resolution.
    patches: Vec<(usize, Label)>,
    next_label: u32,

    debug_lines: Vec<LineEntry>,
}

impl Compiler {
    fn new(options: CompileOptions) -> Self {
        let metadata = options.metadata.clone();
        Self {
            module: BytecodeModule {
                metadata,
                ..Default::default()
            },
            errors: Vec::new(),
            options,
            func: FuncState::default(),
            global_classes: HashMap::new(),
            functions: HashMap::new(),
            classes: HashMap::new(),
            labels: HashMap::new(),
            patches: Vec::new(),
            next_label: 0,
            debug_lines: Vec::new(),
        }
    }

    fn run(&mut self, program: &Program) {
        // Partition the top level: functions and classes are laid out before
        // the main code.
        let mut functions = Vec::new();
        let mut classes = Vec::new();
        let mut main = Vec::new();
        for stmt in &program.statements {
            match stmt {
                Stmt::Function(f) => functions.push(f),
                Stmt::Class(c) => classes.push(c),
                other => main.push(other),
            }
        }

        // Registration pass: every callable gets its table index up front so
        // forward references resolve without patching.
        for f in &functions {
            self.register_function(&f.name, f.params.len(), f.pos);
        }
        for c in &classes {
            self.register_class(c);
        }

        // Emission pass.
        for f in &functions {
            self.emit_function(f);
        }
        for c in &classes {
            self.emit_class(c);
        }

        self.module.main_entry_point = self.pc();
        for stmt in &main {
            self.compile_stmt(stmt);
        }
        self.emit(Opcode::Halt);

        self.resolve_patches();

        if self.options.debug_info {
            self.module.debug_line_map = Some(std::mem::take(&mut self.debug_lines));
        }
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn register_function(&mut self, name: &str, params: usize, pos: Pos) {
        if self.functions.contains_key(name) {
            self.error(pos, &format!("Function '{name}' is already defined"));
            return;
        }
        let params = self.clamped_arity(params, pos);
        self.functions.insert(name.to_string(), params);
        self.module.functions.push(name.to_string());
        self.module.function_entry_points.push(0);
    }

    fn register_class(&mut self, class: &ClassDecl) {
        if self.classes.contains_key(&class.name) {
            self.error(class.pos, &format!("Class '{}' is already defined", class.name));
            return;
        }
        let mut info = ClassInfo::default();
        if let Some(ctor) = &class.constructor {
            info.ctor_params = Some(self.clamped_arity(ctor.params.len(), ctor.pos));
            self.module
                .functions
                .push(format!("{}::constructor", class.name));
            self.module.function_entry_points.push(0);
        }
        for method in &class.methods {
            let params = self.clamped_arity(method.params.len(), method.pos);
            info.methods.insert(method.name.clone(), params);
            self.module
                .functions
                .push(format!("{}::{}", class.name, method.name));
            self.module.function_entry_points.push(0);
        }
        self.classes.insert(class.name.clone(), info);
    }

    fn clamped_arity(&mut self, params: usize, pos: Pos) -> u8 {
        if params > u8::MAX as usize {
            self.error(pos, "Too many parameters");
            u8::MAX
        } else {
            params as u8
        }
    }

    // -----------------------------------------------------------------------
    // Function emission
    // -----------------------------------------------------------------------

    fn emit_function(&mut self, decl: &FunctionDecl) {
        self.set_entry_point(&decl.name);
        let saved = self.enter_function(&decl.params, None);
        for stmt in &decl.body {
            self.compile_stmt(stmt);
        }
        self.emit_implicit_return(&decl.body);
        self.func = saved;
    }

    fn emit_class(&mut self, class: &ClassDecl) {
        if let Some(ctor) = &class.constructor {
            self.set_entry_point(&format!("{}::constructor", class.name));
            let saved = self.enter_function(&ctor.params, Some(&class.name));
            for stmt in &ctor.body {
                self.compile_stmt(stmt);
            }
            self.emit_implicit_return(&ctor.body);
            self.func = saved;
        }
        for method in &class.methods {
            self.set_entry_point(&format!("{}::{}", class.name, method.name));
            let saved = self.enter_function(&method.params, Some(&class.name));
            for stmt in &method.body {
                self.compile_stmt(stmt);
            }
            self.emit_implicit_return(&method.body);
            self.func = saved;
        }
    }

    fn set_entry_point(&mut self, name: &str) {
        let pc = self.pc();
        if let Some(i) = self.module.functions.iter().position(|f| f == name) {
            self.module.function_entry_points[i] = pc;
        }
    }

    /// Enter a fresh function scope. Methods get the receiver in slot 0 and
    /// parameters from slot 1; free functions start parameters at slot 0.
    fn enter_function(&mut self, params: &[Parameter], class: Option<&str>) -> FuncState {
        let mut state = FuncState {
            in_function: true,
            ..Default::default()
        };
        if let Some(class) = class {
            state.locals.insert("this".to_string(), 0);
            state.local_classes.insert("this".to_string(), class.to_string());
            state.local_count = 1;
        }
        for param in params {
            let slot = state.local_count;
            state.locals.insert(param.name.clone(), slot);
            state.local_count = state.local_count.saturating_add(1);
            // A class-typed parameter carries its class for method
            // resolution inside the body.
            if let TypeExpr::Named { name, .. } = &param.ty {
                state.local_classes.insert(param.name.clone(), name.clone());
            }
        }
        std::mem::replace(&mut self.func, state)
    }

    /// Every body ends with `PUSH_NULL; RETURN` unless its last statement
    /// already returns.
    fn emit_implicit_return(&mut self, body: &[Stmt]) {
        if !matches!(body.last(), Some(Stmt::Return { .. })) {
            self.emit(Opcode::PushNull);
            self.emit(Opcode::Return);
        }
    }

    // -----------------------------------------------------------------------
    // Statements
    // -----------------------------------------------------------------------

    fn compile_stmt(&mut self, stmt: &Stmt) {
        self.mark_line(stmt.pos());
        match stmt {
            Stmt::VarDecl {
                pos,
                name,
                initializer,
            } => {
                self.compile_expr(initializer);
                if let Some(class) = self.expr_class(initializer) {
                    if self.func.in_function {
                        self.func.local_classes.insert(name.clone(), class);
                    } else {
                        self.global_classes.insert(name.clone(), class);
                    }
                }
                if self.func.in_function {
                    let slot = self.declare_local(name, *pos);
                    self.emit_op_u8(Opcode::StoreLocal, slot);
                } else {
                    let idx = self.intern_global(name, *pos);
                    self.emit_op_u16(Opcode::StoreGlobal, idx);
                }
            }

            Stmt::Assign { pos, target, value } => {
                self.compile_assignment(target, value, *pos);
            }

            Stmt::Block { statements, .. } => {
                for stmt in statements {
                    self.compile_stmt(stmt);
                }
            }

            Stmt::If {
                condition,
                then_branch,
                else_branch,
                ..
            } => {
                self.compile_expr(condition);
                let else_label = self.new_label();
                self.emit_jump(Opcode::JumpIfNot, else_label);
                self.compile_stmt(then_branch);
                if let Some(else_branch) = else_branch {
                    let end_label = self.new_label();
                    self.emit_jump(Opcode::Jump, end_label);
                    self.place_label(else_label);
                    self.compile_stmt(else_branch);
                    self.place_label(end_label);
                } else {
                    self.place_label(else_label);
                }
            }

            Stmt::While {
                condition, body, ..
            } => {
                let start = self.new_label();
                let end = self.new_label();
                self.place_label(start);
                self.compile_expr(condition);
                self.emit_jump(Opcode::JumpIfNot, end);
                self.compile_stmt(body);
                self.emit_jump(Opcode::Jump, start);
                self.place_label(end);
            }

            Stmt::For {
                pos,
                init,
                condition,
                increment,
                body,
            } => {
                self.compile_stmt(init);
                let start = self.new_label();
                let end = self.new_label();
                self.place_label(start);
                if let Some(condition) = condition {
                    self.compile_expr(condition);
                    self.emit_jump(Opcode::JumpIfNot, end);
                }
                self.compile_stmt(body);
                if let Some(ForIncrement { target, value }) = increment {
                    self.compile_assignment(target, value, *pos);
                }
                self.emit_jump(Opcode::Jump, start);
                self.place_label(end);
            }

            Stmt::Return { value, .. } => {
                match value {
                    Some(expr) => self.compile_expr(expr),
                    None => self.emit(Opcode::PushNull),
                }
                self.emit(Opcode::Return);
            }

            Stmt::Expression { expr, .. } => {
                self.compile_expr(expr);
                self.emit(Opcode::Pop);
            }

            Stmt::Try {
                pos,
                body,
                err_var,
                catch_block,
                finally_block,
            } => {
                self.compile_try(*pos, body, err_var.as_deref(), catch_block.as_deref(), finally_block.as_deref());
            }

            Stmt::Function(decl) => {
                // A nested definition is emitted in place; a jump carries the
                // surrounding code past the body.
                let skip = self.new_label();
                self.emit_jump(Opcode::Jump, skip);
                self.register_function(&decl.name, decl.params.len(), decl.pos);
                self.emit_function(decl);
                self.place_label(skip);
            }

            Stmt::Class(decl) => {
                self.error(decl.pos, "Class declarations must be at the top level");
            }
        }
    }

    fn compile_try(
        &mut self,
        pos: Pos,
        body: &Stmt,
        err_var: Option<&str>,
        catch_block: Option<&Stmt>,
        finally_block: Option<&Stmt>,
    ) {
        match catch_block {
            Some(catch_stmt) => {
                let catch_label = self.new_label();
                let finally_label = self.new_label();

                self.emit_jump(Opcode::Try, catch_label);
                self.compile_stmt(body);
                self.emit(Opcode::EndTry);
                self.emit_jump(Opcode::Jump, finally_label);

                // Handler entry: the fault value is on the operand stack.
                self.place_label(catch_label);
                match err_var {
                    Some(name) => {
                        if self.func.in_function {
                            let slot = self.declare_local(name, pos);
                            self.emit_op_u8(Opcode::StoreLocal, slot);
                        } else {
                            let idx = self.intern_global(name, pos);
                            self.emit_op_u16(Opcode::StoreGlobal, idx);
                        }
                    }
                    None => self.emit(Opcode::Pop),
                }
                self.compile_stmt(catch_stmt);

                self.place_label(finally_label);
                if let Some(finally_stmt) = finally_block {
                    self.compile_stmt(finally_stmt);
                }
            }
            None => {
                // try/finally with no handler: the finally block runs on the
                // fall-through path; a fault unwinds past it.
                self.compile_stmt(body);
                if let Some(finally_stmt) = finally_block {
                    self.compile_stmt(finally_stmt);
                }
            }
        }
    }

    fn compile_assignment(&mut self, target: &Expr, value: &Expr, pos: Pos) {
        match target {
            Expr::Identifier { name, .. } => {
                self.compile_expr(value);
                if let Some(class) = self.expr_class(value) {
                    if self.func.in_function {
                        self.func.local_classes.insert(name.clone(), class);
                    } else {
                        self.global_classes.insert(name.clone(), class);
                    }
                }
                if let Some(&slot) = self.func.locals.get(name) {
                    self.emit_op_u8(Opcode::StoreLocal, slot);
                } else {
                    let idx = self.intern_global(name, pos);
                    self.emit_op_u16(Opcode::StoreGlobal, idx);
                }
            }
            Expr::Member {
                object, property, ..
            } => {
                // SET_FIELD pushes the stored value back as the expression
                // result; statement context discards it.
                self.compile_expr(value);
                self.compile_expr(object);
                let idx = self.intern_constant(property, pos);
                self.emit_op_u16(Opcode::SetField, idx);
                self.emit(Opcode::Pop);
            }
            Expr::Index { array, index, .. } => {
                self.compile_expr(value);
                self.compile_expr(array);
                self.compile_expr(index);
                self.emit(Opcode::SetIndex);
                self.emit(Opcode::Pop);
            }
            other => {
                self.error(other.pos(), "Invalid assignment target");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Expressions
    // -----------------------------------------------------------------------

    fn compile_expr(&mut self, expr: &Expr) {
        self.mark_line(expr.pos());
        match expr {
            Expr::Number {
                pos,
                text,
                is_float,
                is_hex,
            } => self.compile_number(*pos, text, *is_float, *is_hex),

            Expr::Str { pos, value } => {
                let idx = self.intern_constant(value, *pos);
                self.emit_op_u16(Opcode::PushStr, idx);
            }

            Expr::Boolean { value, .. } => {
                self.emit(if *value {
                    Opcode::PushTrue
                } else {
                    Opcode::PushFalse
                });
            }

            Expr::Null { .. } => self.emit(Opcode::PushNull),

            Expr::Identifier { pos, name } => {
                if let Some(&slot) = self.func.locals.get(name) {
                    self.emit_op_u8(Opcode::LoadLocal, slot);
                } else if self.functions.contains_key(name) {
                    // A bare function reference is its interned name; the
                    // callback-registration natives resolve it at runtime.
                    let idx = self.intern_constant(name, *pos);
                    self.emit_op_u16(Opcode::PushStr, idx);
                } else {
                    let idx = self.intern_global(name, *pos);
                    self.emit_op_u16(Opcode::LoadGlobal, idx);
                }
            }

            Expr::Binary {
                op, left, right, ..
            } => {
                self.compile_expr(left);
                self.compile_expr(right);
                self.emit(binary_opcode(*op));
            }

            Expr::Unary { op, operand, .. } => {
                self.compile_expr(operand);
                match op {
                    UnaryOp::Neg => self.emit(Opcode::Neg),
                    UnaryOp::Not => self.emit(Opcode::Not),
                    // Unary plus is the identity.
                    UnaryOp::Plus => {}
                }
            }

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
                ..
            } => {
                self.compile_expr(condition);
                let else_label = self.new_label();
                let end_label = self.new_label();
                self.emit_jump(Opcode::JumpIfNot, else_label);
                self.compile_expr(then_expr);
                self.emit_jump(Opcode::Jump, end_label);
                self.place_label(else_label);
                self.compile_expr(else_expr);
                self.place_label(end_label);
            }

            Expr::Call { pos, callee, args } => self.compile_call(*pos, callee, args),

            Expr::Member {
                pos,
                object,
                property,
            } => {
                self.compile_expr(object);
                let idx = self.intern_constant(property, *pos);
                self.emit_op_u16(Opcode::GetField, idx);
            }

            Expr::Index { array, index, .. } => {
                self.compile_expr(array);
                self.compile_expr(index);
                self.emit(Opcode::GetIndex);
            }

            Expr::Array { elements, .. } => {
                for element in elements {
                    self.compile_expr(element);
                }
                self.emit_op_i32(Opcode::PushI32, elements.len() as i32);
                self.emit(Opcode::NewArray);
            }

            Expr::Construct {
                pos,
                type_name,
                args,
            } => self.compile_construct(*pos, type_name, args),

            Expr::Template { parts, .. } => self.compile_template(parts),

            Expr::Paren { inner, .. } => self.compile_expr(inner),
        }
    }

    /// Integer literals are pushed with the smallest width that fits; hex
    /// literals are always 32-bit with wrap-around.
    fn compile_number(&mut self, pos: Pos, text: &str, is_float: bool, is_hex: bool) {
        if is_float {
            match text.parse::<f32>() {
                Ok(value) => self.emit_op_f32(Opcode::PushF32, value),
                Err(_) => self.error(pos, &format!("Invalid float literal '{text}'")),
            }
            return;
        }
        if is_hex {
            let digits = text.trim_start_matches("0x").trim_start_matches("0X");
            match u32::from_str_radix(digits, 16) {
                Ok(value) => self.emit_op_i32(Opcode::PushI32, value as i32),
                Err(_) => self.error(pos, &format!("Invalid hex literal '{text}'")),
            }
            return;
        }
        match text.parse::<i64>() {
            Ok(value) if value >= i64::from(i8::MIN) && value <= i64::from(i8::MAX) => {
                self.emit_op_i8(Opcode::PushI8, value as i8);
            }
            Ok(value) if value >= i64::from(i16::MIN) && value <= i64::from(i16::MAX) => {
                self.emit_op_i16(Opcode::PushI16, value as i16);
            }
            Ok(value) if value >= i64::from(i32::MIN) && value <= i64::from(i32::MAX) => {
                self.emit_op_i32(Opcode::PushI32, value as i32);
            }
            _ => self.error(pos, &format!("Integer literal '{text}' out of range")),
        }
    }

    fn compile_call(&mut self, pos: Pos, callee: &Expr, args: &[Expr]) {
        // Qualified `os.…` paths are native calls.
        if let Some(path) = dotted_path(callee) {
            if path.starts_with("os.") {
                match native_for_path(&path) {
                    Some(id) => {
                        for arg in args {
                            self.compile_expr(arg);
                        }
                        self.emit_call_native(id, args.len() as u8);
                        return;
                    }
                    None => {
                        self.error(pos, &format!("Unknown native operation '{path}'"));
                        return;
                    }
                }
            }
        }

        match callee {
            Expr::Identifier { name, .. } => {
                let Some(&params) = self.functions.get(name) else {
                    self.error(pos, &format!("Unknown function '{name}'"));
                    return;
                };
                if params as usize != args.len() {
                    self.error(
                        pos,
                        &format!(
                            "Function '{}' expects {} argument(s), got {}",
                            name,
                            params,
                            args.len()
                        ),
                    );
                    return;
                }
                for arg in args {
                    self.compile_expr(arg);
                }
                let idx = self
                    .module
                    .function_index(name)
                    .unwrap_or_default();
                self.emit_call(idx, args.len() as u8);
            }
            Expr::Member {
                object, property, ..
            } => {
                // Method call: the receiver is evaluated first and sits
                // immediately beneath the arguments at CALL; slot 0 of the
                // callee frame is the receiver.
                let Some(qualified) = self.resolve_method(object, property, args.len(), pos)
                else {
                    return;
                };
                self.compile_expr(object);
                for arg in args {
                    self.compile_expr(arg);
                }
                let idx = self
                    .module
                    .function_index(&qualified)
                    .unwrap_or_default();
                self.emit_call(idx, args.len() as u8);
            }
            other => {
                self.error(other.pos(), "Expression is not callable");
            }
        }
    }

    /// Resolve `object.method` to its `Class::method` table name.
    ///
    /// Uses the receiver's class when the compiler knows it (`this`, a
    /// variable initialized from a constructor call, or a direct constructor
    /// expression); otherwise falls back to a unique `::method` suffix
    /// across all classes.
    fn resolve_method(
        &mut self,
        object: &Expr,
        method: &str,
        args: usize,
        pos: Pos,
    ) -> Option<String> {
        if let Some(class) = self.expr_class(object) {
            let lookup = self
                .classes
                .get(&class)
                .map(|info| info.methods.get(method).copied());
            match lookup {
                None => {
                    self.error(pos, &format!("Unknown class '{class}'"));
                    return None;
                }
                Some(None) => {
                    self.error(pos, &format!("Class '{class}' has no method '{method}'"));
                    return None;
                }
                Some(Some(params)) => {
                    if params as usize != args {
                        self.error(
                            pos,
                            &format!(
                                "Method '{class}::{method}' expects {params} argument(s), got {args}"
                            ),
                        );
                        return None;
                    }
                    return Some(format!("{class}::{method}"));
                }
            }
        }

        let suffix = format!("::{method}");
        let mut candidates = self
            .module
            .functions
            .iter()
            .filter(|f| f.ends_with(&suffix));
        match (candidates.next(), candidates.next()) {
            (Some(name), None) => Some(name.clone()),
            (Some(_), Some(_)) => {
                self.error(
                    pos,
                    &format!("Ambiguous method call '{method}': receiver class is unknown"),
                );
                None
            }
            _ => {
                self.error(pos, &format!("Unknown method '{method}'"));
                None
            }
        }
    }

    fn compile_construct(&mut self, pos: Pos, type_name: &str, args: &[Expr]) {
        if self.classes.contains_key(type_name) {
            let ctor_params = self.classes[type_name].ctor_params;
            let class_idx = self.intern_constant(type_name, pos);
            self.emit_op_u16(Opcode::NewObject, class_idx);
            match ctor_params {
                Some(params) => {
                    if params as usize != args.len() {
                        self.error(
                            pos,
                            &format!(
                                "Constructor of '{}' expects {} argument(s), got {}",
                                type_name,
                                params,
                                args.len()
                            ),
                        );
                        return;
                    }
                    // Keep the object as the expression result: duplicate it
                    // as the receiver and discard the constructor's implicit
                    // null return.
                    self.emit(Opcode::Dup);
                    for arg in args {
                        self.compile_expr(arg);
                    }
                    let qualified = format!("{type_name}::constructor");
                    let idx = self
                        .module
                        .function_index(&qualified)
                        .unwrap_or_default();
                    self.emit_call(idx, args.len() as u8);
                    self.emit(Opcode::Pop);
                }
                None => {
                    if !args.is_empty() {
                        self.error(
                            pos,
                            &format!("Class '{type_name}' has no constructor taking arguments"),
                        );
                    }
                }
            }
            return;
        }

        // Conversion constructors on primitive type names lower to the ops
        // the instruction set already has.
        match type_name {
            "string" => {
                if args.len() != 1 {
                    self.error(pos, "string() expects exactly one argument");
                    return;
                }
                let empty = self.intern_constant("", pos);
                self.emit_op_u16(Opcode::PushStr, empty);
                self.compile_expr(&args[0]);
                self.emit(Opcode::StrConcat);
            }
            "float" => {
                if args.len() != 1 {
                    self.error(pos, "float() expects exactly one argument");
                    return;
                }
                self.compile_expr(&args[0]);
                self.emit_op_f32(Opcode::PushF32, 0.0);
                self.emit(Opcode::Add);
            }
            "bool" => {
                if args.len() != 1 {
                    self.error(pos, "bool() expects exactly one argument");
                    return;
                }
                self.compile_expr(&args[0]);
                self.emit(Opcode::Not);
                self.emit(Opcode::Not);
            }
            "int" | "uint" | "byte" | "short" | "void" | "any" => {
                self.error(pos, &format!("Cannot construct a value of type '{type_name}'"));
            }
            _ => {
                self.error(pos, &format!("Unknown class '{type_name}'"));
            }
        }
    }

    /// Template literal: the first part seeds the string, each further part
    /// appends with `STR_CONCAT`. A template beginning with `${…}` gets a
    /// leading empty string so concatenation always starts from a string.
    fn compile_template(&mut self, parts: &[TemplatePart]) {
        let pos = Pos::default();
        let mut first = true;
        if parts.is_empty() || matches!(parts[0], TemplatePart::Expr(_)) {
            let idx = self.intern_constant("", pos);
            self.emit_op_u16(Opcode::PushStr, idx);
            first = false;
        }
        for part in parts {
            match part {
                TemplatePart::Text(text) => {
                    let idx = self.intern_constant(text, pos);
                    self.emit_op_u16(Opcode::PushStr, idx);
                }
                TemplatePart::Expr(expr) => self.compile_expr(expr),
            }
            if first {
                first = false;
            } else {
                self.emit(Opcode::StrConcat);
            }
        }
    }

    /// The class of an expression's value, when statically known.
    fn expr_class(&self, expr: &Expr) -> Option<String> {
        match expr {
            Expr::Identifier { name, .. } => self
                .func
                .local_classes
                .get(name)
                .or_else(|| self.global_classes.get(name))
                .cloned(),
            Expr::Construct { type_name, .. } if self.classes.contains_key(type_name) => {
                Some(type_name.clone())
            }
            Expr::Paren { inner, .. } => self.expr_class(inner),
            _ => None,
        }
    }

    // -----------------------------------------------------------------------
    // Emit helpers
    // -----------------------------------------------------------------------

    fn pc(&self) -> u32 {
        self.module.code.len() as u32
    }

    fn emit(&mut self, op: Opcode) {
        self.module.code.push(op.into());
    }

    fn emit_op_u8(&mut self, op: Opcode, value: u8) {
        self.emit(op);
        self.module.code.push(value);
    }

    fn emit_op_i8(&mut self, op: Opcode, value: i8) {
        self.emit_op_u8(op, value as u8);
    }

    fn emit_op_u16(&mut self, op: Opcode, value: u16) {
        self.emit(op);
        self.module.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_op_i16(&mut self, op: Opcode, value: i16) {
        self.emit(op);
        self.module.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_op_i32(&mut self, op: Opcode, value: i32) {
        self.emit(op);
        self.module.code.extend_from_slice(&value.to_le_bytes());
    }

    fn emit_op_f32(&mut self, op: Opcode, value: f32) {
        self.emit(op);
        self.module
            .code
            .extend_from_slice(&value.to_bits().to_le_bytes());
    }

    fn emit_call(&mut self, func_idx: u16, argc: u8) {
        self.emit(Opcode::Call);
        self.module.code.extend_from_slice(&func_idx.to_le_bytes());
        self.module.code.push(argc);
    }

    fn emit_call_native(&mut self, id: NativeId, argc: u8) {
        self.emit(Opcode::CallNative);
        let raw: u16 = id.into();
        self.module.code.extend_from_slice(&raw.to_le_bytes());
        self.module.code.push(argc);
    }

    // -----------------------------------------------------------------------
    // Labels and patches
    // -----------------------------------------------------------------------

    fn new_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    fn place_label(&mut self, label: Label) {
        let pc = self.pc();
        self.labels.insert(label, pc);
    }

    /// Emit a jump-family instruction with a placeholder operand.
    fn emit_jump(&mut self, op: Opcode, label: Label) {
        self.emit(op);
        let operand_at = self.module.code.len();
        self.module.code.extend_from_slice(&[0; 4]);
        self.patches.push((operand_at, label));
    }

    /// Rewrite every placeholder as the signed delta from the boundary
    /// after the operand to the label.
    fn resolve_patches(&mut self) {
        for (operand_at, label) in std::mem::take(&mut self.patches) {
            let Some(&target) = self.labels.get(&label) else {
                self.errors
                    .push("Line 0:0 - Unresolved jump target".to_string());
                continue;
            };
            let after = operand_at as i64 + 4;
            let delta = i64::from(target) - after;
            let Ok(delta) = i32::try_from(delta) else {
                self.errors
                    .push("Line 0:0 - Jump offset out of range".to_string());
                continue;
            };
            self.module.code[operand_at..operand_at + 4]
                .copy_from_slice(&delta.to_le_bytes());
        }
    }

    // -----------------------------------------------------------------------
    // Tables and scope
    // -----------------------------------------------------------------------

    /// Intern a string into the constant pool.
    fn intern_constant(&mut self, value: &str, pos: Pos) -> u16 {
        if let Some(i) = self.module.constants.iter().position(|c| c == value) {
            return i as u16;
        }
        if self.module.constants.len() > u16::MAX as usize {
            self.error(pos, "Constant pool overflow");
            return 0;
        }
        self.module.constants.push(value.to_string());
        (self.module.constants.len() - 1) as u16
    }

    /// Intern a global name; names auto-intern on first reference.
    fn intern_global(&mut self, name: &str, pos: Pos) -> u16 {
        if let Some(i) = self.module.globals.iter().position(|g| g == name) {
            return i as u16;
        }
        if self.module.globals.len() > u16::MAX as usize {
            self.error(pos, "Global table overflow");
            return 0;
        }
        self.module.globals.push(name.to_string());
        (self.module.globals.len() - 1) as u16
    }

    fn declare_local(&mut self, name: &str, pos: Pos) -> u8 {
        if let Some(&slot) = self.func.locals.get(name) {
            // Redeclaration reuses the slot; locals are function-scoped.
            return slot;
        }
        if self.func.local_count == u8::MAX {
            self.error(pos, "Too many locals in function");
            return 0;
        }
        let slot = self.func.local_count;
        self.func.locals.insert(name.to_string(), slot);
        self.func.local_count += 1;
        slot
    }

    fn mark_line(&mut self, pos: Pos) {
        if !self.options.debug_info {
            return;
        }
        let pc = self.pc();
        // One entry per PC; the statement that starts at a PC wins, and
        // runs of the same line collapse into their first entry.
        let redundant = self
            .debug_lines
            .last()
            .is_some_and(|last| last.pc == pc || last.line == pos.line);
        if !redundant {
            self.debug_lines.push(LineEntry { pc, line: pos.line });
        }
    }

    fn error(&mut self, pos: Pos, message: &str) {
        self.errors
            .push(format!("Line {}:{} - {}", pos.line, pos.column, message));
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
    }
}

/// Flatten a pure identifier/member chain to its dotted spelling.
fn dotted_path(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier { name, .. } => Some(name.clone()),
        Expr::Member {
            object, property, ..
        } => Some(format!("{}.{}", dotted_path(object)?, property)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::Parser;

    fn compile_source(source: &str) -> CompileOutput {
        let mut parser = Parser::new(source);
        let program = parser.parse();
        assert!(!parser.has_errors(), "parse errors: {:?}", parser.errors());
        compile(&program, CompileOptions::default())
    }

    fn opcode_at(code: &[u8], offset: usize) -> Opcode {
        Opcode::try_from(code[offset]).expect("valid opcode")
    }

    #[test]
    fn integer_width_selection() {
        let out = compile_source("var a: 127; var b: 128; var c: 32767; var d: 32768;");
        assert!(!out.has_errors());
        let code = &out.module.code;
        let mut pc = out.module.main_entry_point as usize;
        // 127 fits in a signed byte.
        assert_eq!(opcode_at(code, pc), Opcode::PushI8);
        pc += 2 + 3; // PUSH_I8 + STORE_GLOBAL
        assert_eq!(opcode_at(code, pc), Opcode::PushI16);
        pc += 3 + 3;
        assert_eq!(opcode_at(code, pc), Opcode::PushI16);
        pc += 3 + 3;
        assert_eq!(opcode_at(code, pc), Opcode::PushI32);
    }

    #[test]
    fn hex_literal_is_always_i32() {
        let out = compile_source("var a: 0x01;");
        let pc = out.module.main_entry_point as usize;
        assert_eq!(opcode_at(&out.module.code, pc), Opcode::PushI32);
    }

    #[test]
    fn constants_are_interned() {
        let out = compile_source("var a: \"hi\"; var b: \"hi\"; var c: \"other\";");
        assert_eq!(
            out.module.constants,
            vec!["hi".to_string(), "other".to_string()]
        );
    }

    #[test]
    fn functions_are_laid_out_before_main() {
        let out = compile_source("function f(): int { return 1; } var x: f();");
        assert!(!out.has_errors());
        let module = &out.module;
        assert_eq!(module.functions, vec!["f".to_string()]);
        assert!(module.main_entry_point >= module.function_entry_points[0]);
        // Code ends with HALT.
        assert_eq!(*module.code.last().unwrap(), u8::from(Opcode::Halt));
    }

    #[test]
    fn class_members_get_qualified_names() {
        let out = compile_source(
            "class Counter { value: int; constructor(v: int) { assign this.value v; } \
             inc(): void { assign this.value this.value + 1; } }",
        );
        assert!(!out.has_errors());
        assert_eq!(
            out.module.functions,
            vec![
                "Counter::constructor".to_string(),
                "Counter::inc".to_string()
            ]
        );
    }

    #[test]
    fn unknown_function_is_collected_not_fatal() {
        let out = compile_source("var x: missing(1);");
        assert!(out.has_errors());
        assert!(out.errors[0].contains("Unknown function 'missing'"));
        // A module is still produced.
        assert_eq!(*out.module.code.last().unwrap(), u8::from(Opcode::Halt));
    }

    #[test]
    fn arity_mismatch_is_a_compile_error() {
        let out = compile_source("function f(a: int): int { return a; } var x: f(1, 2);");
        assert!(out.has_errors());
        assert!(out.errors[0].contains("expects 1 argument(s), got 2"));
    }

    #[test]
    fn native_call_lowering() {
        let out = compile_source("os.console.print(\"hi\");");
        assert!(!out.has_errors());
        let code = &out.module.code;
        let pc = out.module.main_entry_point as usize;
        assert_eq!(opcode_at(code, pc), Opcode::PushStr);
        let native_pc = pc + 3;
        assert_eq!(opcode_at(code, native_pc), Opcode::CallNative);
        let id = u16::from_le_bytes([code[native_pc + 1], code[native_pc + 2]]);
        assert_eq!(NativeId::try_from(id), Ok(NativeId::ConsolePrint));
        assert_eq!(code[native_pc + 3], 1); // arg count
    }

    #[test]
    fn unknown_native_path_is_an_error() {
        let out = compile_source("os.console.frobnicate(1);");
        assert!(out.has_errors());
        assert!(out.errors[0].contains("Unknown native operation 'os.console.frobnicate'"));
    }

    #[test]
    fn jump_offsets_are_relative_to_after_operand() {
        // `if (x = 0) {} else {}` — one JUMP_IF_NOT into the else branch and
        // one JUMP from the then branch past it.
        let out = compile_source("var x: 0; if (x = 0) { var a: 1; } else { var b: 2; }");
        assert!(!out.has_errors());
        let code = &out.module.code;
        let jin = code
            .iter()
            .position(|&b| b == u8::from(Opcode::JumpIfNot))
            .expect("JUMP_IF_NOT emitted");
        let delta = i32::from_le_bytes([code[jin + 1], code[jin + 2], code[jin + 3], code[jin + 4]]);
        let target = (jin as i32 + 5 + delta) as usize;
        // The else target must itself be an instruction boundary holding a
        // real opcode.
        assert!(Opcode::try_from(code[target]).is_ok());
        assert!(delta > 0);
    }

    #[test]
    fn debug_line_map_is_sorted() {
        let mut parser = Parser::new("var a: 1;\nvar b: 2;\nvar c: 3;");
        let program = parser.parse();
        let out = compile(
            &program,
            CompileOptions {
                debug_info: true,
                ..Default::default()
            },
        );
        let map = out.module.debug_line_map.as_ref().expect("map present");
        assert!(!map.is_empty());
        assert!(map.windows(2).all(|w| w[0].pc < w[1].pc));
    }

    #[test]
    fn template_starting_with_interpolation_gets_empty_prefix() {
        let out = compile_source("var s: `${1}`;");
        assert!(!out.has_errors());
        // The empty string is interned for the leading concat seed.
        assert!(out.module.constants.iter().any(|c| c.is_empty()));
        let code = &out.module.code;
        assert!(code.contains(&u8::from(Opcode::StrConcat)));
    }

    #[test]
    fn ambiguous_method_without_type_info() {
        let out = compile_source(
            "class A { go(): void { } } class B { go(): void { } } \
             function pick(o: any): void { o.go(); }",
        );
        assert!(out.has_errors());
        assert!(out.errors[0].contains("Ambiguous method call 'go'"));
    }

    #[test]
    fn method_resolution_by_known_class() {
        let out = compile_source(
            "class A { go(): void { } } class B { go(): void { } } \
             var a: A(); a.go();",
        );
        assert!(!out.has_errors(), "errors: {:?}", out.errors);
    }
}
