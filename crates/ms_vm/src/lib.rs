use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use ms_syntax::{
    equality, Code, FuncParam, LocalOnlyMode, MapKey, Opcode, SourceLoc, TacLine, ValMap, Value,
    ISA_KEY, MAX_ISA_DEPTH, MAX_SIZE,
};

mod intrinsics;
pub use intrinsics::{intrinsic_by_id, intrinsic_by_name, IntrinsicDef, IntrinsicResult};

mod interp;
pub use interp::Interpreter;

/// Upper bound on arguments in flight for a single call.
pub const MAX_ARGS: usize = 255;

#[derive(Debug, Clone)]
pub enum RuntimeError {
    Index {
        message: String,
        location: Option<SourceLoc>,
    },
    Key {
        message: String,
        location: Option<SourceLoc>,
    },
    Type {
        message: String,
        location: Option<SourceLoc>,
    },
    UndefinedIdentifier {
        message: String,
        location: Option<SourceLoc>,
    },
    UndefinedLocal {
        message: String,
        location: Option<SourceLoc>,
    },
    TooManyArguments {
        message: String,
        location: Option<SourceLoc>,
    },
    LimitExceeded {
        message: String,
        location: Option<SourceLoc>,
    },
    Runtime {
        message: String,
        location: Option<SourceLoc>,
    },
}

impl RuntimeError {
    pub fn index(message: impl Into<String>) -> Self {
        RuntimeError::Index {
            message: message.into(),
            location: None,
        }
    }

    pub fn key(message: impl Into<String>) -> Self {
        RuntimeError::Key {
            message: message.into(),
            location: None,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        RuntimeError::Type {
            message: message.into(),
            location: None,
        }
    }

    pub fn undefined_identifier(name: &str) -> Self {
        RuntimeError::UndefinedIdentifier {
            message: format!("Undefined Identifier: '{}' is unknown in this context", name),
            location: None,
        }
    }

    pub fn undefined_local(name: &str) -> Self {
        RuntimeError::UndefinedLocal {
            message: format!(
                "Undefined Local Identifier: '{}' is unknown in this context",
                name
            ),
            location: None,
        }
    }

    pub fn too_many_arguments() -> Self {
        RuntimeError::TooManyArguments {
            message: "Too Many Arguments".to_string(),
            location: None,
        }
    }

    pub fn limit(message: impl Into<String>) -> Self {
        RuntimeError::LimitExceeded {
            message: message.into(),
            location: None,
        }
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        RuntimeError::Runtime {
            message: message.into(),
            location: None,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            RuntimeError::Index { message, .. }
            | RuntimeError::Key { message, .. }
            | RuntimeError::Type { message, .. }
            | RuntimeError::UndefinedIdentifier { message, .. }
            | RuntimeError::UndefinedLocal { message, .. }
            | RuntimeError::TooManyArguments { message, .. }
            | RuntimeError::LimitExceeded { message, .. }
            | RuntimeError::Runtime { message, .. } => message,
        }
    }

    pub fn location(&self) -> Option<&SourceLoc> {
        match self {
            RuntimeError::Index { location, .. }
            | RuntimeError::Key { location, .. }
            | RuntimeError::Type { location, .. }
            | RuntimeError::UndefinedIdentifier { location, .. }
            | RuntimeError::UndefinedLocal { location, .. }
            | RuntimeError::TooManyArguments { location, .. }
            | RuntimeError::LimitExceeded { location, .. }
            | RuntimeError::Runtime { location, .. } => location.as_ref(),
        }
    }

    fn set_location_if_absent(&mut self, loc: SourceLoc) {
        let slot = match self {
            RuntimeError::Index { location, .. }
            | RuntimeError::Key { location, .. }
            | RuntimeError::Type { location, .. }
            | RuntimeError::UndefinedIdentifier { location, .. }
            | RuntimeError::UndefinedLocal { location, .. }
            | RuntimeError::TooManyArguments { location, .. }
            | RuntimeError::LimitExceeded { location, .. }
            | RuntimeError::Runtime { location, .. } => location,
        };
        if slot.is_none() {
            *slot = Some(loc);
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Runtime Error: {}", self.message())?;
        if let Some(location) = self.location() {
            write!(f, " {}", location)?;
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}

/// Output callback: `(text, append_eol)`.
pub type OutputSink = Box<dyn FnMut(&str, bool)>;

pub(crate) fn stdout_sink() -> OutputSink {
    Box::new(|text, eol| {
        if eol {
            println!("{}", text);
        } else {
            print!("{}", text);
        }
    })
}

/// A call frame.  The bottom frame of a [`Machine`] is the global context.
pub struct Context {
    pub code: Code,
    pub pc: usize,
    locals: Option<Rc<RefCell<ValMap>>>,
    outer_vars: Option<Rc<RefCell<ValMap>>>,
    pub self_value: Option<Value>,
    pending_args: Vec<Value>,
    result_storage: Option<Value>,
    partial_result: Option<Value>,
    temps: Vec<Value>,
    implicit_result_counter: usize,
}

impl Context {
    fn with_code(code: Code) -> Self {
        Self {
            code,
            pc: 0,
            locals: None,
            outer_vars: None,
            self_value: None,
            pending_args: Vec::new(),
            result_storage: None,
            partial_result: None,
            temps: Vec::new(),
            implicit_result_counter: 0,
        }
    }

    fn done(&self) -> bool {
        self.pc >= self.code.borrow().len()
    }

    fn locals_map(&mut self) -> Rc<RefCell<ValMap>> {
        if self.locals.is_none() {
            self.locals = Some(Rc::new(RefCell::new(ValMap::new())));
        }
        Rc::clone(self.locals.as_ref().expect("just created"))
    }

    fn get_temp(&self, index: usize) -> Value {
        self.temps.get(index).cloned().unwrap_or(Value::Null)
    }

    fn set_temp(&mut self, index: usize, value: Value) {
        if self.temps.len() <= index {
            self.temps.resize(index + 1, Value::Null);
        }
        self.temps[index] = value;
    }

    fn set_local(&mut self, name: &str, value: Value) {
        self.locals_map().borrow_mut().insert_str(name, value);
    }

    fn current_location(&self) -> Option<SourceLoc> {
        let code = self.code.borrow();
        let index = if self.pc == 0 { 0 } else { self.pc - 1 };
        code.get(index).and_then(|line| line.location.clone())
    }
}

/// The virtual machine: a stack of contexts plus per-VM shared state
/// (type prototype maps, stopwatch, output sink, PRNG).
pub struct Machine {
    stack: Vec<Context>,
    start_time: Instant,
    pub store_implicit: bool,
    pub yielding: bool,
    rng_state: u64,
    number_type: Option<Rc<RefCell<ValMap>>>,
    string_type: Option<Rc<RefCell<ValMap>>>,
    list_type: Option<Rc<RefCell<ValMap>>>,
    map_type: Option<Rc<RefCell<ValMap>>>,
    function_type: Option<Rc<RefCell<ValMap>>>,
    intrinsics_map: Option<Value>,
    version_map: Option<Value>,
    standard_output: OutputSink,
}

impl Machine {
    pub fn new(code: Code) -> Self {
        Self::with_output(code, stdout_sink())
    }

    pub fn with_output(code: Code, standard_output: OutputSink) -> Self {
        intrinsics::ensure_registered();
        Self {
            stack: vec![Context::with_code(code)],
            start_time: Instant::now(),
            store_implicit: false,
            yielding: false,
            rng_state: 0x2545_F491_4F6C_DD1D,
            number_type: None,
            string_type: None,
            list_type: None,
            map_type: None,
            function_type: None,
            intrinsics_map: None,
            version_map: None,
            standard_output,
        }
    }

    pub fn set_standard_output(&mut self, sink: OutputSink) {
        self.standard_output = sink;
    }

    pub fn write_output(&mut self, text: &str, append_eol: bool) {
        (self.standard_output)(text, append_eol);
    }

    fn ctx(&mut self) -> &mut Context {
        self.stack.last_mut().expect("stack always has the global context")
    }

    fn ctx_ref(&self) -> &Context {
        self.stack.last().expect("stack always has the global context")
    }

    pub fn global_code(&self) -> Code {
        Rc::clone(&self.stack[0].code)
    }

    pub fn done(&self) -> bool {
        self.stack.len() == 1 && self.stack[0].done()
    }

    /// Seconds since this machine started running.
    pub fn run_time(&self) -> f64 {
        self.start_time.elapsed().as_secs_f64()
    }

    fn globals_map(&mut self) -> Rc<RefCell<ValMap>> {
        self.stack[0].locals_map()
    }

    /// Count of implicit results stored in the global context; the REPL
    /// uses the delta to decide whether to echo `_`.
    pub fn implicit_result_count(&self) -> usize {
        self.stack[0].implicit_result_counter
    }

    pub fn get_global(&mut self, name: &str) -> Option<Value> {
        let globals = self.globals_map();
        let value = globals.borrow().get_str(name).cloned();
        value
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        self.globals_map().borrow_mut().insert_str(name, value);
    }

    /// Truncate the call stack to the global frame and move its pc past the
    /// end of code.
    pub fn stop(&mut self) {
        self.stack.truncate(1);
        let len = self.stack[0].code.borrow().len();
        self.stack[0].pc = len;
    }

    /// Clear the stack and rewind; optionally keep global variables.
    pub fn reset(&mut self, clear_variables: bool) {
        self.stack.truncate(1);
        let global = &mut self.stack[0];
        global.pc = 0;
        global.temps.clear();
        global.pending_args.clear();
        global.partial_result = None;
        if clear_variables {
            global.locals = None;
        }
        self.start_time = Instant::now();
        self.yielding = false;
    }

    /// Execute one TAC line.  Finished contexts are popped first; their
    /// return value (temp 0) lands in the caller's result slot.
    pub fn step(&mut self) -> Result<(), RuntimeError> {
        while self.stack.len() > 1 && self.ctx_ref().done() {
            self.pop_context()?;
        }
        if self.done() {
            return Ok(());
        }
        let line = {
            let ctx = self.ctx_ref();
            let code = ctx.code.borrow();
            code.get(ctx.pc).cloned()
        };
        let line = match line {
            Some(line) => line,
            None => return Ok(()),
        };
        self.ctx().pc += 1;
        let result = self.execute(&line);
        if let Err(mut err) = result {
            if let Some(loc) = &line.location {
                err.set_location_if_absent(loc.clone());
            }
            // Fall back to the nearest location on the call stack.
            if err.location().is_none() {
                for frame in self.stack.iter().rev() {
                    if let Some(loc) = frame.current_location() {
                        err.set_location_if_absent(loc);
                        break;
                    }
                }
            }
            return Err(err);
        }
        Ok(())
    }

    /// Run until the program ends, `yield` is called, a partial intrinsic
    /// result is pending (with `return_early`), or the time budget runs out.
    /// The budget is measured on a monotonic clock.
    pub fn run_until_done(
        &mut self,
        time_limit_secs: f64,
        return_early: bool,
    ) -> Result<(), RuntimeError> {
        self.yielding = false;
        let began = Instant::now();
        while !self.done() {
            self.step()?;
            if self.yielding {
                break;
            }
            if return_early && self.ctx_ref().partial_result.is_some() {
                break;
            }
            if began.elapsed().as_secs_f64() > time_limit_secs {
                break;
            }
        }
        Ok(())
    }

    fn pop_context(&mut self) -> Result<(), RuntimeError> {
        let ctx = self.stack.pop().expect("caller checked depth");
        let result = ctx.get_temp(0);
        if let Some(storage) = ctx.result_storage {
            self.assign(&storage, result)?;
        }
        Ok(())
    }

    fn execute(&mut self, line: &TacLine) -> Result<(), RuntimeError> {
        match line.op {
            Opcode::Noop => Ok(()),
            Opcode::Assign => {
                let value = self.operand(&line.rhs_a)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("assignment without a target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::AssignImplicit => {
                if self.store_implicit {
                    let value = self.operand(&line.rhs_a)?;
                    self.set_var("_", value)?;
                    self.ctx().implicit_result_counter += 1;
                }
                Ok(())
            }
            Opcode::Copy => {
                let value = self.copy_value(&line.rhs_a)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("copy without a target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Pow
            | Opcode::Eq
            | Opcode::Neq
            | Opcode::Gt
            | Opcode::Gte
            | Opcode::Lt
            | Opcode::Lte
            | Opcode::And
            | Opcode::Or => {
                let a = self.operand(&line.rhs_a)?;
                let b = self.operand(&line.rhs_b)?;
                let value = self.binary_op(line.op, a, b)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("operation without a result target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::Not => {
                let a = self.operand(&line.rhs_a)?;
                let truth = clamp01(a.truth_value().abs());
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("operation without a result target")
                })?;
                self.assign(&lhs, Value::Number(1.0 - truth))
            }
            Opcode::Isa => {
                let a = self.operand(&line.rhs_a)?;
                let b = self.operand(&line.rhs_b)?;
                let result = self.is_a(&a, &b)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("operation without a result target")
                })?;
                self.assign(&lhs, Value::one_or_zero(result))
            }
            Opcode::BindAssign => {
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("bind without a target")
                })?;
                let func = match &line.rhs_a {
                    Some(Value::Function(def, _)) => Rc::clone(def),
                    _ => return Err(RuntimeError::type_error("bind target is not a function")),
                };
                let outer = self.ctx().locals_map();
                self.assign(&lhs, Value::Function(func, Some(outer)))
            }
            Opcode::New => {
                let proto = self.operand(&line.rhs_a)?;
                let value = self.instantiate(proto)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("new without a target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::Goto => {
                let target = self.operand(&line.rhs_a)?.int_value();
                self.ctx().pc = target as usize;
                Ok(())
            }
            Opcode::GotoIf => {
                let cond = self.operand(&line.rhs_b)?;
                if cond.truth_value() != 0.0 {
                    let target = self.operand(&line.rhs_a)?.int_value();
                    self.ctx().pc = target as usize;
                }
                Ok(())
            }
            Opcode::GotoIfTruly => {
                let cond = self.operand(&line.rhs_b)?;
                if cond.truth_value() as i64 != 0 {
                    let target = self.operand(&line.rhs_a)?.int_value();
                    self.ctx().pc = target as usize;
                }
                Ok(())
            }
            Opcode::GotoIfNot => {
                let cond = self.operand(&line.rhs_b)?;
                if cond.truth_value() == 0.0 {
                    let target = self.operand(&line.rhs_a)?.int_value();
                    self.ctx().pc = target as usize;
                }
                Ok(())
            }
            Opcode::PushParam => {
                let value = self.operand(&line.rhs_a)?;
                let ctx = self.ctx();
                if ctx.pending_args.len() >= MAX_ARGS {
                    return Err(RuntimeError::too_many_arguments());
                }
                ctx.pending_args.push(value);
                Ok(())
            }
            Opcode::CallFunction => {
                let argc = match &line.rhs_b {
                    Some(value) => value.int_value().max(0) as usize,
                    None => 0,
                };
                let callee = line.rhs_a.clone().ok_or_else(|| {
                    RuntimeError::runtime("call without a callee")
                })?;
                self.call_function(line.lhs.clone(), &callee, argc)
            }
            Opcode::CallIntrinsic => {
                let id = match &line.rhs_a {
                    Some(value) => value.int_value() as usize,
                    None => return Err(RuntimeError::runtime("intrinsic call without an id")),
                };
                let argc = line
                    .rhs_b
                    .as_ref()
                    .map(|value| value.int_value().max(0) as usize)
                    .unwrap_or(0);
                if argc > 0 {
                    // Inline form (e.g. a slice expression): route through the
                    // normal call protocol using the intrinsic's stub.
                    let def = intrinsic_by_id(id).ok_or_else(|| {
                        RuntimeError::runtime(format!("unknown intrinsic id {}", id))
                    })?;
                    let callee = Value::Function(def.stub, None);
                    return self.call_function(line.lhs.clone(), &callee, argc);
                }
                let def = intrinsic_by_id(id).ok_or_else(|| {
                    RuntimeError::runtime(format!("unknown intrinsic id {}", id))
                })?;
                let partial = self.ctx().partial_result.take();
                match (def.func)(self, partial)? {
                    IntrinsicResult::Done(value) => {
                        if let Some(lhs) = line.lhs.clone() {
                            self.assign(&lhs, value)?;
                        }
                        Ok(())
                    }
                    IntrinsicResult::Partial(progress) => {
                        let ctx = self.ctx();
                        ctx.partial_result = Some(progress);
                        ctx.pc -= 1;
                        Ok(())
                    }
                }
            }
            Opcode::Return => {
                let value = self.operand(&line.rhs_a)?;
                let lhs = line.lhs.clone().unwrap_or(Value::Temp(0));
                self.assign(&lhs, value)?;
                let ctx = self.ctx();
                let len = ctx.code.borrow().len();
                ctx.pc = len;
                Ok(())
            }
            Opcode::Elem => {
                let base = self.operand(&line.rhs_a)?;
                let index = self.operand(&line.rhs_b)?;
                let value = self.elem_of(&base, &index, false)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("lookup without a target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::IterElem => {
                let base = self.operand(&line.rhs_a)?;
                let index = self.operand(&line.rhs_b)?;
                let value = self.elem_of(&base, &index, true)?;
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("lookup without a target")
                })?;
                self.assign(&lhs, value)
            }
            Opcode::Length => {
                let value = self.operand(&line.rhs_a)?;
                let len = match &value {
                    Value::Str(s) => s.chars().count() as f64,
                    Value::List(items) => items.borrow().len() as f64,
                    Value::Map(map) => map.borrow().len() as f64,
                    _ => 0.0,
                };
                let lhs = line.lhs.clone().ok_or_else(|| {
                    RuntimeError::runtime("length without a target")
                })?;
                self.assign(&lhs, Value::Number(len))
            }
        }
    }

    /// Evaluate a TAC operand in the current context.  Literal list/map
    /// nodes instantiate fresh containers with their elements evaluated;
    /// values fetched from variables and temps pass through by reference.
    fn operand(&mut self, value: &Option<Value>) -> Result<Value, RuntimeError> {
        match value {
            None => Ok(Value::Null),
            Some(value) => self.val_of(value),
        }
    }

    fn val_of(&mut self, value: &Value) -> Result<Value, RuntimeError> {
        match value {
            Value::Var {
                name, local_only, ..
            } => self.get_var(name, *local_only),
            Value::Temp(index) => Ok(self.ctx_ref().get_temp(*index)),
            Value::SeqElem { base, index, .. } => {
                let base = self.val_of(base)?;
                let index = self.val_of(index)?;
                self.elem_of(&base, &index, false)
            }
            Value::List(items) => {
                let snapshot: Vec<Value> = items.borrow().clone();
                let mut evaluated = Vec::with_capacity(snapshot.len());
                for item in snapshot {
                    evaluated.push(self.val_of(&item)?);
                }
                Ok(Value::from_vec(evaluated))
            }
            Value::Map(map) => {
                let snapshot: Vec<(MapKey, Value)> = map
                    .borrow()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                let mut evaluated = ValMap::new();
                for (key, entry) in snapshot {
                    let key = self.val_of(&key.to_value())?;
                    let entry = self.val_of(&entry)?;
                    evaluated.insert(key, entry);
                }
                Ok(Value::from_map(evaluated))
            }
            other => Ok(other.clone()),
        }
    }

    /// `Copy` semantics: literals instantiate, shared containers copy.
    fn copy_value(&mut self, operand: &Option<Value>) -> Result<Value, RuntimeError> {
        let value = self.operand(operand)?;
        match &value {
            Value::List(items) => Ok(Value::from_vec(items.borrow().clone())),
            Value::Map(map) => {
                let mut copy = ValMap::new();
                for (key, entry) in map.borrow().iter() {
                    copy.insert(key.to_value(), entry.clone());
                }
                Ok(Value::from_map(copy))
            }
            _ => Ok(value),
        }
    }

    /// Variable lookup: special names, locals, local-only enforcement,
    /// module-level outer vars, globals, then the intrinsic table.
    fn get_var(&mut self, name: &str, local_only: LocalOnlyMode) -> Result<Value, RuntimeError> {
        match name {
            "self" => {
                // The slot wins; a `self` bound positionally (direct call to
                // a method) lands in locals and is found below.
                if let Some(value) = self.ctx_ref().self_value.clone() {
                    return Ok(value);
                }
            }
            "outer" => {
                let outer = self.ctx_ref().outer_vars.clone();
                let map = match outer {
                    Some(outer) => outer,
                    None => self.globals_map(),
                };
                return Ok(Value::Map(map));
            }
            "locals" => {
                let map = self.ctx().locals_map();
                return Ok(Value::Map(map));
            }
            "globals" => {
                let map = self.globals_map();
                return Ok(Value::Map(map));
            }
            _ => {}
        }

        if let Some(locals) = &self.ctx_ref().locals {
            if let Some(value) = locals.borrow().get_str(name) {
                return Ok(value.clone());
            }
        }

        match local_only {
            LocalOnlyMode::Strict => return Err(RuntimeError::undefined_local(name)),
            LocalOnlyMode::Warn => {
                let warning = format!(
                    "Warning: reading local variable '{}' before it is assigned",
                    name
                );
                self.write_output(&warning, true);
            }
            LocalOnlyMode::Off => {}
        }

        if let Some(outer) = &self.ctx_ref().outer_vars {
            if let Some(value) = outer.borrow().get_str(name) {
                return Ok(value.clone());
            }
        }

        if self.stack.len() > 1 {
            if let Some(globals) = &self.stack[0].locals {
                if let Some(value) = globals.borrow().get_str(name) {
                    return Ok(value.clone());
                }
            }
        }

        if let Some(def) = intrinsic_by_name(name) {
            return Ok(Value::Function(def.stub, None));
        }

        Err(RuntimeError::undefined_identifier(name))
    }

    fn set_var(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        match name {
            "self" => {
                self.ctx().self_value = Some(value);
                return Ok(());
            }
            "globals" | "locals" => {
                return Err(RuntimeError::runtime(format!(
                    "can't assign to '{}'",
                    name
                )));
            }
            _ => {}
        }
        self.ctx().set_local(name, value);
        Ok(())
    }

    fn assign(&mut self, lhs: &Value, value: Value) -> Result<(), RuntimeError> {
        match lhs {
            Value::Temp(index) => {
                self.ctx().set_temp(*index, value);
                Ok(())
            }
            Value::Var { name, .. } => self.set_var(name, value),
            Value::SeqElem { base, index, .. } => {
                let base = self.val_of(base)?;
                let index = self.val_of(index)?;
                self.set_elem(&base, index, value)
            }
            _ => Err(RuntimeError::runtime("invalid assignment target")),
        }
    }

    fn set_elem(&mut self, base: &Value, index: Value, value: Value) -> Result<(), RuntimeError> {
        match base {
            Value::Map(map) => {
                let override_fn = map.borrow().assign_override;
                if let Some(hook) = override_fn {
                    match hook(&index, &value) {
                        Ok(true) => return Ok(()),
                        Ok(false) => {}
                        Err(message) => return Err(RuntimeError::runtime(message)),
                    }
                }
                map.borrow_mut().insert(index, value);
                Ok(())
            }
            Value::List(items) => {
                let len = items.borrow().len() as i64;
                let mut at = index.int_value();
                if at < 0 {
                    at += len;
                }
                if at < 0 || at >= len {
                    return Err(RuntimeError::index(format!(
                        "Index Error (list index {} out of range)",
                        index.int_value()
                    )));
                }
                items.borrow_mut()[at as usize] = value;
                Ok(())
            }
            Value::Str(_) => Err(RuntimeError::type_error("strings are immutable")),
            Value::Null => Err(RuntimeError::type_error("can't set an index on null")),
            other => Err(RuntimeError::type_error(format!(
                "can't set an index on a {}",
                other.type_name()
            ))),
        }
    }

    /// Walk a map's `__isa` chain looking for `key`.  Returns the value and
    /// the map it was found in (for `super` binding).
    fn lookup_in_map(
        &mut self,
        start: &Rc<RefCell<ValMap>>,
        key: &Value,
    ) -> Result<Option<(Value, Rc<RefCell<ValMap>>)>, RuntimeError> {
        let mut current = Rc::clone(start);
        for _ in 0..MAX_ISA_DEPTH {
            let found = current.borrow().get(key).cloned();
            if let Some(value) = found {
                return Ok(Some((value, current)));
            }
            let parent = current.borrow().isa_map();
            match parent {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }
        Err(RuntimeError::limit(
            "__isa depth exceeded (perhaps a reference loop?)",
        ))
    }

    /// `a[b]`, with the `for`-loop variant returning `{key, value}` pairs
    /// for maps.
    fn elem_of(&mut self, base: &Value, index: &Value, for_iter: bool) -> Result<Value, RuntimeError> {
        match base {
            Value::Map(map) => {
                if for_iter {
                    let position = index.int_value();
                    let entry = map
                        .borrow()
                        .get_index(position.max(0) as usize)
                        .map(|(k, v)| (k.to_value(), v.clone()));
                    return match entry {
                        Some((key, value)) => {
                            let mut pair = ValMap::new();
                            pair.insert_str("key", key);
                            pair.insert_str("value", value);
                            Ok(Value::from_map(pair))
                        }
                        None => Err(RuntimeError::index(format!(
                            "Index Error (map index {} out of range)",
                            position
                        ))),
                    };
                }
                match self.lookup_in_map(map, index)? {
                    Some((value, _)) => Ok(value),
                    None => {
                        // String keys fall back to the map prototype.
                        if index.as_str().is_some() {
                            let proto = self.map_type();
                            if let Some((value, _)) = self.lookup_in_map(&proto, index)? {
                                return Ok(value);
                            }
                        }
                        Err(RuntimeError::key(format!(
                            "Key Not Found: '{}' not found in map",
                            index.to_display_string()
                        )))
                    }
                }
            }
            Value::List(items) => {
                if let Some(name) = index.as_str() {
                    let proto = self.list_type();
                    let key = Value::string(name);
                    if let Some((value, _)) = self.lookup_in_map(&proto, &key)? {
                        return Ok(value);
                    }
                    return Err(RuntimeError::type_error(format!(
                        "Type Error (list does not have member '{}')",
                        name
                    )));
                }
                let len = items.borrow().len() as i64;
                let mut at = index.int_value();
                if at < 0 {
                    at += len;
                }
                if at < 0 || at >= len {
                    return Err(RuntimeError::index(format!(
                        "Index Error (list index {} out of range)",
                        index.int_value()
                    )));
                }
                Ok(items.borrow()[at as usize].clone())
            }
            Value::Str(text) => {
                if let Some(name) = index.as_str() {
                    let proto = self.string_type();
                    let key = Value::string(name);
                    if let Some((value, _)) = self.lookup_in_map(&proto, &key)? {
                        return Ok(value);
                    }
                    return Err(RuntimeError::type_error(format!(
                        "Type Error (string does not have member '{}')",
                        name
                    )));
                }
                let chars: Vec<char> = text.chars().collect();
                let len = chars.len() as i64;
                let mut at = index.int_value();
                if at < 0 {
                    at += len;
                }
                if at < 0 || at >= len {
                    return Err(RuntimeError::index(format!(
                        "Index Error (string index {} out of range)",
                        index.int_value()
                    )));
                }
                Ok(Value::string(chars[at as usize].to_string()))
            }
            Value::Number(_) => {
                if let Some(name) = index.as_str() {
                    let proto = self.number_type();
                    let key = Value::string(name);
                    if let Some((value, _)) = self.lookup_in_map(&proto, &key)? {
                        return Ok(value);
                    }
                    return Err(RuntimeError::type_error(format!(
                        "Type Error (number does not have member '{}')",
                        name
                    )));
                }
                Err(RuntimeError::type_error("number is not indexable"))
            }
            Value::Function(..) => {
                if let Some(name) = index.as_str() {
                    let proto = self.function_type();
                    let key = Value::string(name);
                    if let Some((value, _)) = self.lookup_in_map(&proto, &key)? {
                        return Ok(value);
                    }
                    return Err(RuntimeError::type_error(format!(
                        "Type Error (funcRef does not have member '{}')",
                        name
                    )));
                }
                Err(RuntimeError::type_error("funcRef is not indexable"))
            }
            Value::Null => Err(RuntimeError::type_error(format!(
                "Type Error (can't look up '{}' on null)",
                index.to_display_string()
            ))),
            other => Err(RuntimeError::type_error(format!(
                "{} is not indexable",
                other.type_name()
            ))),
        }
    }

    fn is_a(&mut self, a: &Value, b: &Value) -> Result<bool, RuntimeError> {
        match b {
            Value::Null => Ok(a.is_null()),
            Value::Map(proto) => match a {
                Value::Map(map) => {
                    let mut current = Rc::clone(map);
                    for _ in 0..MAX_ISA_DEPTH {
                        if Rc::ptr_eq(&current, proto) {
                            return Ok(true);
                        }
                        let parent = current.borrow().isa_map();
                        match parent {
                            Some(parent) => current = parent,
                            None => return Ok(false),
                        }
                    }
                    Err(RuntimeError::limit(
                        "__isa depth exceeded (perhaps a reference loop?)",
                    ))
                }
                Value::Number(_) => Ok(Rc::ptr_eq(&self.number_type(), proto)),
                Value::Str(_) => Ok(Rc::ptr_eq(&self.string_type(), proto)),
                Value::List(_) => Ok(Rc::ptr_eq(&self.list_type(), proto)),
                Value::Function(..) => Ok(Rc::ptr_eq(&self.function_type(), proto)),
                _ => Ok(false),
            },
            _ => Ok(false),
        }
    }

    fn instantiate(&mut self, proto: Value) -> Result<Value, RuntimeError> {
        match proto {
            Value::Map(map) => {
                for builtin in [
                    self.number_type(),
                    self.string_type(),
                    self.list_type(),
                    self.map_type(),
                    self.function_type(),
                ] {
                    if Rc::ptr_eq(&map, &builtin) {
                        return Err(RuntimeError::type_error(
                            "'new' can't be used on a built-in type",
                        ));
                    }
                }
                let mut fresh = ValMap::new();
                fresh.insert_str(ISA_KEY, Value::Map(map));
                Ok(Value::from_map(fresh))
            }
            other => Err(RuntimeError::type_error(format!(
                "argument to 'new' must be a map (got {})",
                other.type_name()
            ))),
        }
    }

    /// The `CallFunctionA` protocol.
    fn call_function(
        &mut self,
        lhs: Option<Value>,
        callee: &Value,
        argc: usize,
    ) -> Result<(), RuntimeError> {
        let mut self_value: Option<Value> = None;
        let mut super_value: Option<Value> = None;
        let mut via_dot = false;

        let resolved = match callee {
            Value::SeqElem { base, index, .. } => {
                via_dot = true;
                let is_super =
                    matches!(&**base, Value::Var { name, .. } if &**name == "super");
                let base_value = self.val_of(base)?;
                let index_value = self.val_of(index)?;
                let (value, found_in) =
                    self.elem_with_source(&base_value, &index_value)?;
                self_value = if is_super {
                    self.ctx_ref().self_value.clone()
                } else {
                    Some(base_value)
                };
                super_value = found_in
                    .and_then(|map| map.borrow().isa_map())
                    .map(Value::Map);
                value
            }
            other => self.val_of(other)?,
        };

        let (def, outer) = match resolved {
            Value::Function(def, outer) => (def, outer),
            value => {
                // Not a function: the "call" collapses into a plain read.
                if argc > 0 {
                    return Err(RuntimeError::too_many_arguments());
                }
                if let Some(lhs) = lhs {
                    self.assign(&lhs, value)?;
                }
                return Ok(());
            }
        };

        let params = &def.params;
        let skip = if via_dot
            && params
                .first()
                .map(|param| param.name == "self")
                .unwrap_or(false)
        {
            1
        } else {
            0
        };
        let effective: &[FuncParam] = &params[skip..];
        if argc > effective.len() {
            return Err(RuntimeError::too_many_arguments());
        }

        let args = {
            let pending = &mut self.ctx().pending_args;
            if pending.len() < argc {
                return Err(RuntimeError::runtime("argument stack underflow"));
            }
            let at = pending.len() - argc;
            pending.split_off(at)
        };

        let mut bindings: Vec<(String, Value)> = Vec::with_capacity(params.len() + 1);
        for (position, param) in effective.iter().enumerate() {
            let value = match args.get(position) {
                Some(value) => value.clone(),
                None => self.val_of(&param.default)?,
            };
            bindings.push((param.name.clone(), value));
        }
        if via_dot {
            bindings.push(("super".to_string(), super_value.unwrap_or(Value::Null)));
        }

        let mut frame = Context::with_code(Rc::clone(&def.code));
        frame.outer_vars = outer;
        frame.self_value = self_value;
        frame.result_storage = lhs;
        for (name, value) in bindings {
            frame.set_local(&name, value);
        }
        self.stack.push(frame);
        Ok(())
    }

    /// Like [`elem_of`], but reports the map the value was found in so the
    /// call protocol can bind `super`.
    fn elem_with_source(
        &mut self,
        base: &Value,
        index: &Value,
    ) -> Result<(Value, Option<Rc<RefCell<ValMap>>>), RuntimeError> {
        match base {
            Value::Map(map) => match self.lookup_in_map(map, index)? {
                Some((value, found_in)) => Ok((value, Some(found_in))),
                None => {
                    if index.as_str().is_some() {
                        let proto = self.map_type();
                        if let Some((value, found_in)) = self.lookup_in_map(&proto, index)? {
                            return Ok((value, Some(found_in)));
                        }
                    }
                    Err(RuntimeError::key(format!(
                        "Key Not Found: '{}' not found in map",
                        index.to_display_string()
                    )))
                }
            },
            _ => {
                let value = self.elem_of(base, index, false)?;
                Ok((value, None))
            }
        }
    }

    fn binary_op(&mut self, op: Opcode, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match op {
            Opcode::Eq => Ok(Value::Number(equality(&a, &b))),
            Opcode::Neq => Ok(Value::Number(1.0 - equality(&a, &b))),
            Opcode::And => {
                let x = clamp01(a.truth_value().abs());
                let y = clamp01(b.truth_value().abs());
                Ok(Value::Number(clamp01(x * y)))
            }
            Opcode::Or => {
                let x = clamp01(a.truth_value().abs());
                let y = clamp01(b.truth_value().abs());
                Ok(Value::Number(clamp01(x + y - x * y)))
            }
            _ => self.arithmetic(op, a, b),
        }
    }

    fn arithmetic(&mut self, op: Opcode, a: Value, b: Value) -> Result<Value, RuntimeError> {
        match (&a, &b) {
            (Value::Number(x), Value::Number(y)) => {
                let result = match op {
                    Opcode::Add => x + y,
                    Opcode::Sub => x - y,
                    Opcode::Mul => x * y,
                    Opcode::Div => x / y,
                    Opcode::Mod => x % y,
                    Opcode::Pow => x.powf(*y),
                    Opcode::Gt => return Ok(Value::one_or_zero(x > y)),
                    Opcode::Gte => return Ok(Value::one_or_zero(x >= y)),
                    Opcode::Lt => return Ok(Value::one_or_zero(x < y)),
                    Opcode::Lte => return Ok(Value::one_or_zero(x <= y)),
                    _ => return Err(RuntimeError::type_error("unsupported numeric operation")),
                };
                Ok(Value::Number(result))
            }
            (Value::Str(x), _) => self.string_op(op, x, &b),
            (Value::Number(_), Value::Str(_)) => match op {
                Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => Ok(Value::Null),
                _ => Err(RuntimeError::type_error(
                    "Type Error (number and string can't be combined)",
                )),
            },
            (Value::List(x), _) => self.list_op(op, x, &b),
            (Value::Map(x), Value::Map(y)) if op == Opcode::Add => {
                let mut merged = ValMap::new();
                for (key, value) in x.borrow().iter() {
                    merged.insert(key.to_value(), value.clone());
                }
                for (key, value) in y.borrow().iter() {
                    merged.insert(key.to_value(), value.clone());
                }
                Ok(Value::from_map(merged))
            }
            (Value::Null, _) | (_, Value::Null) => match op {
                Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => Ok(Value::Null),
                _ => Ok(Value::Null),
            },
            _ => match op {
                Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => Ok(Value::Null),
                _ => Err(RuntimeError::type_error(format!(
                    "Type Error ({} and {} can't be combined)",
                    a.type_name(),
                    b.type_name()
                ))),
            },
        }
    }

    fn string_op(&mut self, op: Opcode, a: &Rc<str>, b: &Value) -> Result<Value, RuntimeError> {
        match op {
            Opcode::Add => {
                let tail = match b {
                    Value::Null => String::new(),
                    other => other.to_display_string(),
                };
                if a.len() + tail.len() > MAX_SIZE {
                    return Err(RuntimeError::limit("Maximum string size exceeded"));
                }
                Ok(Value::string(format!("{}{}", a, tail)))
            }
            Opcode::Sub => {
                // Subtraction strips a trailing suffix, when present.
                let suffix = match b {
                    Value::Str(s) => s.to_string(),
                    other => other.to_display_string(),
                };
                match a.strip_suffix(suffix.as_str()) {
                    Some(stripped) if !suffix.is_empty() => Ok(Value::string(stripped)),
                    _ => Ok(Value::Str(Rc::clone(a))),
                }
            }
            Opcode::Mul | Opcode::Div => {
                let factor = match b {
                    Value::Number(n) => *n,
                    _ => {
                        return Err(RuntimeError::type_error(
                            "Type Error (string can only be multiplied by a number)",
                        ))
                    }
                };
                let factor = if op == Opcode::Div { 1.0 / factor } else { factor };
                let chars: Vec<char> = a.chars().collect();
                if factor <= 0.0 || chars.is_empty() {
                    return Ok(Value::string(""));
                }
                let total = (chars.len() as f64 * factor) as usize;
                if total > MAX_SIZE {
                    return Err(RuntimeError::limit("Maximum string size exceeded"));
                }
                let mut out = String::with_capacity(total);
                for i in 0..total {
                    out.push(chars[i % chars.len()]);
                }
                Ok(Value::string(out))
            }
            Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => match b {
                Value::Str(other) => {
                    let ord = a.as_ref().cmp(other.as_ref());
                    let result = match op {
                        Opcode::Gt => ord.is_gt(),
                        Opcode::Gte => ord.is_ge(),
                        Opcode::Lt => ord.is_lt(),
                        Opcode::Lte => ord.is_le(),
                        _ => unreachable!(),
                    };
                    Ok(Value::one_or_zero(result))
                }
                _ => Ok(Value::Null),
            },
            _ => Err(RuntimeError::type_error(
                "Type Error (unsupported string operation)",
            )),
        }
    }

    fn list_op(
        &mut self,
        op: Opcode,
        a: &Rc<RefCell<Vec<Value>>>,
        b: &Value,
    ) -> Result<Value, RuntimeError> {
        match op {
            Opcode::Add => match b {
                Value::List(other) => {
                    let mut combined = a.borrow().clone();
                    combined.extend(other.borrow().iter().cloned());
                    if combined.len() > MAX_SIZE {
                        return Err(RuntimeError::limit("Maximum list size exceeded"));
                    }
                    Ok(Value::from_vec(combined))
                }
                _ => Err(RuntimeError::type_error(
                    "Type Error (can only add a list to another list)",
                )),
            },
            Opcode::Mul | Opcode::Div => {
                let factor = match b {
                    Value::Number(n) => *n,
                    _ => {
                        return Err(RuntimeError::type_error(
                            "Type Error (list can only be multiplied by a number)",
                        ))
                    }
                };
                let factor = if op == Opcode::Div { 1.0 / factor } else { factor };
                let items = a.borrow();
                if factor <= 0.0 || items.is_empty() {
                    return Ok(Value::from_vec(Vec::new()));
                }
                let total = (items.len() as f64 * factor) as usize;
                if total > MAX_SIZE {
                    return Err(RuntimeError::limit("Maximum list size exceeded"));
                }
                let mut out = Vec::with_capacity(total);
                for i in 0..total {
                    out.push(items[i % items.len()].clone());
                }
                Ok(Value::from_vec(out))
            }
            Opcode::Gt | Opcode::Gte | Opcode::Lt | Opcode::Lte => Ok(Value::Null),
            _ => Err(RuntimeError::type_error(
                "Type Error (unsupported list operation)",
            )),
        }
    }
}

pub(crate) fn clamp01(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn capture_sinks(interp: &mut Interpreter) -> (Rc<RefCell<String>>, Rc<RefCell<String>>) {
        let out = Rc::new(RefCell::new(String::new()));
        let err = Rc::new(RefCell::new(String::new()));
        let out_handle = Rc::clone(&out);
        interp.set_standard_output(Box::new(move |text, eol| {
            out_handle.borrow_mut().push_str(text);
            if eol {
                out_handle.borrow_mut().push('\n');
            }
        }));
        let err_handle = Rc::clone(&err);
        interp.set_error_output(Box::new(move |text, eol| {
            err_handle.borrow_mut().push_str(text);
            if eol {
                err_handle.borrow_mut().push('\n');
            }
        }));
        (out, err)
    }

    fn run(source: &str) -> (String, String) {
        let mut interp = Interpreter::with_source(source);
        let (out, err) = capture_sinks(&mut interp);
        interp.run_until_done(10.0, false);
        let stdout = out.borrow().clone();
        let stderr = err.borrow().clone();
        (stdout, stderr)
    }

    fn run_ok(source: &str) -> String {
        let (stdout, stderr) = run(source);
        assert_eq!(stderr, "", "unexpected error output");
        stdout
    }

    #[test]
    fn prints_arithmetic() {
        assert_eq!(run_ok("print 6*7"), "42\n");
    }

    #[test]
    fn calls_user_function_with_return() {
        let source = "f = function(x)\n  return x*3\nend function\nprint f(14)";
        assert_eq!(run_ok(source), "42\n");
    }

    #[test]
    fn pushes_onto_list_and_sums() {
        let source = "x = [1,2,3]\nx.push 42\nprint x.sum";
        assert_eq!(run_ok(source), "48\n");
    }

    #[test]
    fn iterates_descending_range() {
        let source = "for i in range(3,1)\n  print i\nend for";
        assert_eq!(run_ok(source), "3\n2\n1\n");
    }

    #[test]
    fn map_dot_assignment_and_values() {
        let source = "d = {\"a\":1}\nd.b = 2\nprint d.values.sum";
        assert_eq!(run_ok(source), "3\n");
    }

    #[test]
    fn doubled_quotes_print_as_one() {
        assert_eq!(run_ok("print \"Hi\"\"There\""), "Hi\"There\n");
    }

    #[test]
    fn chained_comparison_in_single_line_if() {
        let source = "if 1 < 2 < 3 then print \"ok\" else print \"no\"";
        assert_eq!(run_ok(source), "ok\n");
        let source = "if 3 < 2 < 1 then print \"ok\" else print \"no\"";
        assert_eq!(run_ok(source), "no\n");
    }

    #[test]
    fn sorts_in_place_and_joins() {
        let source = "a = [3,1,2]; a.sort; print a.join(\"-\")";
        assert_eq!(run_ok(source), "1-2-3\n");
    }

    #[test]
    fn while_loop_with_break_and_continue() {
        let source = "i = 0\nwhile 1\n  i = i + 1\n  if i == 3 then continue\n  if i > 5 then break\n  print i\nend while";
        assert_eq!(run_ok(source), "1\n2\n4\n5\n");
    }

    #[test]
    fn string_repetition_and_suffix_subtraction() {
        assert_eq!(run_ok("print \"ab\" * 3"), "ababab\n");
        assert_eq!(run_ok("print \"hello world\" - \" world\""), "hello\n");
        assert_eq!(run_ok("print \"abc\" * 1.5"), "abca\n");
    }

    #[test]
    fn compound_assignment_updates_in_place() {
        assert_eq!(run_ok("x = 1\nx += 5\nprint x"), "6\n");
        assert_eq!(run_ok("x = 10\nx /= 4\nprint x"), "2.5\n");
    }

    #[test]
    fn short_circuit_or_skips_side_effects() {
        let source = "f = function()\n  globals.hit = 1\n  return 1\nend function\nhit = 0\nx = 1 or f\nprint x\nprint hit";
        assert_eq!(run_ok(source), "1\n0\n");
    }

    #[test]
    fn logic_is_fuzzy_between_zero_and_one() {
        assert_eq!(run_ok("print (0.5 and 0.5)"), "0.25\n");
        assert_eq!(run_ok("print (0.5 or 0.5)"), "0.75\n");
        assert_eq!(run_ok("print not 0.25"), "0.75\n");
    }

    #[test]
    fn closures_capture_defining_scope() {
        let source = "makeAdder = function(n)\n  f = function(x)\n    return x + outer.n\n  end function\n  return @f\nend function\nadd5 = makeAdder(5)\nprint add5(3)";
        assert_eq!(run_ok(source), "8\n");
    }

    #[test]
    fn new_creates_instance_with_isa_dispatch() {
        let source = "Point = {}\nPoint.mag = function()\n  return self.x + self.y\nend function\np = new Point\np.x = 3\np.y = 4\nprint p.mag";
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn super_resolves_in_parent_with_same_self() {
        let source = "Base = {}\nBase.describe = function()\n  return \"base\"\nend function\nChild = new Base\nChild.describe = function()\n  return \"child+\" + super.describe\nend function\nc = new Child\nprint c.describe";
        assert_eq!(run_ok(source), "child+base\n");
    }

    #[test]
    fn isa_operator_walks_prototype_chain() {
        let source = "Animal = {}\nDog = new Animal\nd = new Dog\nprint d isa Animal\nprint d isa Dog\nprint {} isa Animal";
        assert_eq!(run_ok(source), "1\n1\n0\n");
    }

    #[test]
    fn null_isa_null_is_true() {
        assert_eq!(run_ok("print null isa null"), "1\n");
    }

    #[test]
    fn isa_chain_depth_is_limited() {
        let source = "a = {}\nb = {}\na.__isa = b\nb.__isa = a\nprint a.missing";
        let (_, stderr) = run(source);
        assert!(stderr.contains("Runtime Error"), "{}", stderr);
        assert!(stderr.contains("depth"), "{}", stderr);
    }

    #[test]
    fn undefined_identifier_reports_location() {
        let (_, stderr) = run("x = 1\nprint zzz");
        assert!(stderr.contains("Undefined Identifier"), "{}", stderr);
        assert!(stderr.contains("line 2"), "{}", stderr);
    }

    #[test]
    fn strict_local_only_rejects_compound_on_unassigned() {
        let (_, stderr) = run("x += 1");
        assert!(stderr.contains("Undefined Local"), "{}", stderr);
    }

    #[test]
    fn assigning_to_globals_is_an_error() {
        let (_, stderr) = run("globals = 1");
        assert!(stderr.contains("can't assign"), "{}", stderr);
    }

    #[test]
    fn too_many_arguments_is_reported() {
        let source = "f = function(x)\n  return x\nend function\nprint f(1, 2)";
        let (_, stderr) = run(source);
        assert!(stderr.contains("Too Many Arguments"), "{}", stderr);
    }

    #[test]
    fn yield_pauses_and_resumes() {
        let mut interp = Interpreter::with_source("print 1\nyield\nprint 2");
        let (out, err) = capture_sinks(&mut interp);
        interp.run_until_done(10.0, true);
        assert!(!interp.done());
        assert_eq!(out.borrow().as_str(), "1\n");
        interp.run_until_done(10.0, true);
        assert!(interp.done());
        assert_eq!(out.borrow().as_str(), "1\n2\n");
        assert_eq!(err.borrow().as_str(), "");
    }

    #[test]
    fn wait_suspends_with_partial_result_then_completes() {
        let mut interp = Interpreter::with_source("wait 0.01\nprint \"done\"");
        let (out, _) = capture_sinks(&mut interp);
        let started = std::time::Instant::now();
        while !interp.done() && started.elapsed().as_secs_f64() < 5.0 {
            interp.run_until_done(0.05, true);
        }
        assert!(interp.done());
        assert_eq!(out.borrow().as_str(), "done\n");
    }

    #[test]
    fn numeric_display_follows_format_rules() {
        assert_eq!(run_ok("print 1/3"), "0.333333\n");
        assert_eq!(run_ok("print 100000000000"), "1E+11\n");
        assert_eq!(run_ok("print -0"), "0\n");
        assert_eq!(run_ok("print 2.5"), "2.5\n");
    }

    #[test]
    fn list_and_map_display_use_code_form() {
        assert_eq!(run_ok("print [1, \"a\", null]"), "[1, \"a\", null]\n");
        assert_eq!(run_ok("print {\"x\": 2}"), "{\"x\": 2}\n");
    }

    #[test]
    fn slices_wrap_negative_indexes() {
        assert_eq!(run_ok("print \"hello\"[1:3]"), "el\n");
        assert_eq!(run_ok("print [1,2,3,4][-2:]"), "[3, 4]\n");
        assert_eq!(run_ok("print [1,2,3][1]"), "2\n");
        assert_eq!(run_ok("print \"abc\"[-1]"), "c\n");
    }

    #[test]
    fn address_of_passes_function_without_calling() {
        let source = "f = function()\n  return 7\nend function\ng = @f\nprint g";
        assert_eq!(run_ok(source), "7\n");
    }

    #[test]
    fn for_loop_over_map_yields_key_value_pairs() {
        let source = "d = {\"a\": 1, \"b\": 2}\nfor kv in d\n  print kv.key + \"=\" + str(kv.value)\nend for";
        assert_eq!(run_ok(source), "a=1\nb=2\n");
    }

    #[test]
    fn repl_echoes_implicit_results() {
        let mut interp = Interpreter::new();
        let (out, err) = capture_sinks(&mut interp);
        interp.repl("6 * 7", 5.0);
        assert_eq!(out.borrow().as_str(), "42\n");
        assert_eq!(err.borrow().as_str(), "");
    }

    #[test]
    fn repl_accumulates_state_across_lines() {
        let mut interp = Interpreter::new();
        let (out, _) = capture_sinks(&mut interp);
        interp.repl("x = 40", 5.0);
        interp.repl("print x + 2", 5.0);
        assert_eq!(out.borrow().as_str(), "42\n");
    }

    #[test]
    fn repl_builds_functions_across_lines() {
        let mut interp = Interpreter::new();
        let (out, err) = capture_sinks(&mut interp);
        interp.repl("f = function(x)", 5.0);
        assert!(interp.need_more_input());
        interp.repl("return x + 1", 5.0);
        interp.repl("end function", 5.0);
        assert!(!interp.need_more_input());
        interp.repl("print f(2)", 5.0);
        assert_eq!(out.borrow().as_str(), "3\n");
        assert_eq!(err.borrow().as_str(), "");
    }

    #[test]
    fn repl_recovers_after_compile_error() {
        let mut interp = Interpreter::new();
        let (out, err) = capture_sinks(&mut interp);
        interp.repl("break", 5.0);
        assert!(err.borrow().contains("Compiler Error"));
        interp.repl("print 5", 5.0);
        assert_eq!(out.borrow().as_str(), "5\n");
    }

    #[test]
    fn globals_survive_restart_only_when_kept() {
        let mut interp = Interpreter::with_source("x = 3");
        let (_, _) = capture_sinks(&mut interp);
        interp.run_until_done(5.0, false);
        assert_eq!(
            interp.get_global_value("x").map(|v| v.as_number()),
            Some(3.0)
        );
        interp.restart();
        assert!(interp.get_global_value("x").is_none());
    }

    #[test]
    fn host_can_set_and_read_globals() {
        let mut interp = Interpreter::with_source("y = x * 2");
        let (_, err) = capture_sinks(&mut interp);
        interp.compile();
        interp.set_global_value("x", Value::Number(21.0));
        interp.run_until_done(5.0, false);
        assert_eq!(err.borrow().as_str(), "");
        assert_eq!(
            interp.get_global_value("y").map(|v| v.as_number()),
            Some(42.0)
        );
    }

    #[test]
    fn intrinsics_map_rejects_writes() {
        let (_, stderr) = run("m = intrinsics\nm.foo = 1");
        assert!(stderr.contains("read-only"), "{}", stderr);
    }

    #[test]
    fn sort_orders_nulls_per_contract() {
        assert_eq!(
            run_ok("a = [2, null, 1]\na.sort\nprint a.join(\",\")"),
            "1,2,\n"
        );
        let source = "a = [{\"k\": 2}, {\"k\": null}, {\"k\": 1}]\na.sort \"k\"\nprint a[0].k + \"\"";
        let (stdout, stderr) = run(source);
        assert_eq!(stderr, "");
        assert_eq!(stdout, "null\n");
    }

    #[test]
    fn stack_trace_is_newest_frame_first() {
        let source = "f = function()\n  return stackTrace\nend function\nt = f\nprint t.len >= 2\nprint t[0]";
        let (stdout, stderr) = run(source);
        assert_eq!(stderr, "");
        let mut lines = stdout.lines();
        assert_eq!(lines.next(), Some("1"));
        let top = lines.next().unwrap_or("");
        assert!(top.contains("line 2"), "{}", top);
    }

    #[test]
    fn warn_local_only_prints_warning_and_falls_through() {
        // A plain self-referential assignment of a name bound outside the
        // current scope warns on standard output, then resolves normally.
        let source = "x = 40\nf = function()\n  x = x + 2\n  return x\nend function\nprint f\nprint x";
        let (stdout, stderr) = run(source);
        assert_eq!(stderr, "");
        let mut lines = stdout.lines();
        let warning = lines.next().unwrap_or("");
        assert!(warning.starts_with("Warning:"), "{}", warning);
        assert!(warning.contains("'x'"), "{}", warning);
        assert_eq!(lines.next(), Some("42"));
        assert_eq!(lines.next(), Some("40"));
        assert_eq!(lines.next(), None);
    }

    #[test]
    fn bitwise_ops_split_sign_and_magnitude() {
        assert_eq!(run_ok("print bitAnd(12, 10)"), "8\n");
        assert_eq!(run_ok("print bitOr(12, 10)"), "14\n");
        assert_eq!(run_ok("print bitXor(12, 10)"), "6\n");
        // The sign bit combines under the same operation as the magnitudes.
        assert_eq!(run_ok("print bitAnd(-12, 10)"), "8\n");
        assert_eq!(run_ok("print bitAnd(-12, -10)"), "-8\n");
        assert_eq!(run_ok("print bitOr(-12, 10)"), "-14\n");
        assert_eq!(run_ok("print bitOr(12, -10)"), "-14\n");
        assert_eq!(run_ok("print bitXor(-12, 10)"), "-6\n");
        assert_eq!(run_ok("print bitXor(-12, -10)"), "6\n");
    }

    #[test]
    fn math_intrinsics_match_reference_values() {
        assert_eq!(run_ok("print abs(-3.5)"), "3.5\n");
        assert_eq!(run_ok("print floor(2.7)"), "2\n");
        assert_eq!(run_ok("print ceil(2.2)"), "3\n");
        assert_eq!(run_ok("print sign(-4)"), "-1\n");
        assert_eq!(run_ok("print sign(0)"), "0\n");
        assert_eq!(run_ok("print sqrt(9)"), "3\n");
        assert_eq!(run_ok("print log(1000)"), "3\n");
        assert_eq!(run_ok("print log(8, 2)"), "3\n");
        assert_eq!(run_ok("print pi"), "3.141593\n");
    }

    #[test]
    fn round_handles_negative_decimal_places() {
        assert_eq!(run_ok("print round(3.14159, 2)"), "3.14\n");
        assert_eq!(run_ok("print round(1234, -2)"), "1200\n");
        assert_eq!(run_ok("print round(2.5)"), "3\n");
    }

    #[test]
    fn trig_intrinsics_evaluate() {
        assert_eq!(run_ok("print sin(0)"), "0\n");
        assert_eq!(run_ok("print cos(0)"), "1\n");
        assert_eq!(run_ok("print tan(0)"), "0\n");
        assert_eq!(run_ok("print asin(1)"), "1.570796\n");
        assert_eq!(run_ok("print acos(1)"), "0\n");
        assert_eq!(run_ok("print atan(1)"), "0.785398\n");
        assert_eq!(run_ok("print atan(1, -1)"), "2.356194\n");
    }

    #[test]
    fn char_and_code_are_inverse() {
        assert_eq!(run_ok("print char(65)"), "A\n");
        assert_eq!(run_ok("print code(\"A\")"), "65\n");
        assert_eq!(run_ok("print char(code(\"Q\"))"), "Q\n");
    }

    #[test]
    fn has_index_checks_lists_strings_and_maps() {
        let source = "a = [10,20,30]\nprint a.hasIndex(2)\nprint a.hasIndex(3)\nprint \"abc\".hasIndex(1)\nprint {\"k\": 1}.hasIndex(\"k\")\nprint {\"k\": 1}.hasIndex(\"z\")";
        assert_eq!(run_ok(source), "1\n0\n1\n1\n0\n");
    }

    #[test]
    fn index_of_searches_forward_from_after() {
        let source = "a = [1,2,3,2]\nprint a.indexOf(2)\nprint a.indexOf(2, 1)\nprint a.indexOf(9) == null\nprint \"banana\".indexOf(\"an\")\nprint \"banana\".indexOf(\"an\", 1)";
        assert_eq!(run_ok(source), "1\n3\n1\n1\n3\n");
    }

    #[test]
    fn insert_mutates_lists_and_builds_strings() {
        let source = "a = [10,30]\na.insert 1, 20\nprint a.join(\",\")\nprint \"hll\".insert(1, \"e\")";
        assert_eq!(run_ok(source), "10,20,30\nhell\n");
    }

    #[test]
    fn remove_handles_each_container_type() {
        let source = "m = {\"a\": 1, \"b\": 2}\nprint m.remove(\"a\")\nprint m.remove(\"z\")\nprint m.len\na = [1,2,3]\na.remove 0\nprint a.join(\",\")\nprint \"banana\".remove(\"an\")";
        assert_eq!(run_ok(source), "1\n0\n1\n2,3\nbana\n");
    }

    #[test]
    fn replace_respects_max_count() {
        let source = "print \"banana\".replace(\"a\", \"o\")\nprint \"banana\".replace(\"a\", \"o\", 2)\na = [1,2,1]\na.replace 1, 9\nprint a.join(\",\")";
        assert_eq!(run_ok(source), "bonono\nbonona\n9,2,9\n");
    }

    #[test]
    fn split_honors_delimiter_and_max_count() {
        let source = "p = \"a,b,c\".split(\",\")\nprint p.len\nprint p[2]\nq = \"a,b,c\".split(\",\", 2)\nprint q.len\nprint q[1]";
        assert_eq!(run_ok(source), "3\nc\n2\nb,c\n");
    }

    #[test]
    fn pop_and_pull_take_from_opposite_ends() {
        let source = "a = [1,2,3]\nprint a.pop\nprint a.pull\nprint a.join(\",\")\nm = {\"x\": 1}\nprint m.pop\nprint m.len";
        assert_eq!(run_ok(source), "3\n1\n2\nx\n0\n");
    }

    #[test]
    fn shuffle_keeps_the_same_elements() {
        let source = "a = range(1, 10)\na.shuffle\nprint a.len\nprint a.sum";
        assert_eq!(run_ok(source), "10\n55\n");
    }

    #[test]
    fn lower_and_upper_transform_strings() {
        assert_eq!(run_ok("print \"MiXeD\".lower"), "mixed\n");
        assert_eq!(run_ok("print \"MiXeD\".upper"), "MIXED\n");
        assert_eq!(run_ok("print lower(3)"), "3\n");
    }

    #[test]
    fn val_of_str_round_trips_through_the_vm() {
        let source = "ok = 1\nfor x in [42, -7, 1.5, 0.25, 3.125, 100.5]\n  if val(str(x)) != x then ok = 0\nend for\nprint ok";
        assert_eq!(run_ok(source), "1\n");
        assert_eq!(run_ok("print val(\"3.14\")"), "3.14\n");
        assert_eq!(run_ok("print val(\"  12  \")"), "12\n");
        assert_eq!(run_ok("print val(\"nope\")"), "0\n");
    }

    #[test]
    fn hash_is_stable_for_equal_values() {
        let source = "print hash(3) == hash(3)\nprint hash(\"abc\") == hash(\"abc\")\nprint hash([1,2]) == hash([1,2])";
        assert_eq!(run_ok(source), "1\n1\n1\n");
    }

    #[test]
    fn ref_equals_distinguishes_identity_from_equality() {
        let source = "a = [1]\nb = a\nc = [1]\nprint refEquals(a, b)\nprint refEquals(a, c)\nprint a == c\nprint refEquals(\"x\", \"x\")";
        assert_eq!(run_ok(source), "1\n0\n1\n1\n");
    }

    #[test]
    fn func_ref_prototype_identifies_functions() {
        let source = "f = function\n  return 1\nend function\nprint @f isa funcRef";
        assert_eq!(run_ok(source), "1\n");
    }

    #[test]
    fn version_returns_a_cached_info_map() {
        let source = "v = version\nprint v.hasIndex(\"miniscript\")\nprint refEquals(v, version)";
        assert_eq!(run_ok(source), "1\n1\n");
    }

    #[test]
    fn rnd_is_deterministic_for_a_seed() {
        let source = "x = rnd(42)\ny = rnd(42)\nz = rnd\nprint x == y\nprint (x >= 0) * (x < 1)\nprint z == x";
        assert_eq!(run_ok(source), "1\n1\n0\n");
    }
}
