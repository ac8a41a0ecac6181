use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Maximum length of a string or list value.
pub const MAX_SIZE: usize = 0xFF_FFFF;

/// Maximum depth of an `__isa` prototype chain walk.
pub const MAX_ISA_DEPTH: usize = 256;

/// Maximum nesting considered when rendering a value as code.
pub const MAX_CODE_DEPTH: usize = 16;

pub const ISA_KEY: &str = "__isa";

/// A position in MiniScript source, attached to emitted instructions and
/// surfaced in error messages as `[<context> line N]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLoc {
    pub context: Option<String>,
    pub line_num: u32,
}

impl SourceLoc {
    pub fn new(context: Option<String>, line_num: u32) -> Self {
        Self { context, line_num }
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(context) => write!(f, "[{} line {}]", context, self.line_num),
            None => write!(f, "[line {}]", self.line_num),
        }
    }
}

/// How a variable read reacts to the name being assigned on the same
/// statement (`x = x + 1` where `x` is not yet bound locally).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LocalOnlyMode {
    #[default]
    Off,
    Warn,
    Strict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FuncParam {
    pub name: String,
    pub default: Value,
}

/// A shared, filled-in-place TAC vector.  The parser hands out a function
/// value while its body is still being emitted, so the code cell is shared
/// between the value and the open parse state.
pub type Code = Rc<RefCell<Vec<TacLine>>>;

pub fn new_code() -> Code {
    Rc::new(RefCell::new(Vec::new()))
}

/// A compiled function body: ordered parameters plus TAC code.
#[derive(Debug, Clone, PartialEq)]
pub struct FuncDef {
    pub params: Vec<FuncParam>,
    pub code: Code,
}

impl Default for FuncDef {
    fn default() -> Self {
        Self {
            params: Vec::new(),
            code: new_code(),
        }
    }
}

impl fmt::Display for FuncDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FUNCTION(")?;
        for (index, param) in self.params.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", param.name)?;
            if param.default != Value::Null {
                write!(f, "={}", param.default.to_code_string())?;
            }
        }
        write!(f, ")")
    }
}

/// Assignment hook carried by a map.  Returning `Ok(true)` means the
/// assignment was handled (or rejected) and the VM must not store the value.
pub type AssignOverride = fn(key: &Value, value: &Value) -> Result<bool, String>;

/// An insertion-ordered map keyed by value identity.
#[derive(Default)]
pub struct ValMap {
    entries: IndexMap<MapKey, Value>,
    pub assign_override: Option<AssignOverride>,
}

impl ValMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.entries.get(&MapKey::from_value(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&MapKey::Str(Rc::from(key)))
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.entries.contains_key(&MapKey::from_value(key))
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.insert(MapKey::from_value(&key), value);
    }

    pub fn insert_str(&mut self, key: &str, value: Value) {
        self.entries.insert(MapKey::Str(Rc::from(key)), value);
    }

    pub fn remove(&mut self, key: &Value) -> Option<Value> {
        self.entries.shift_remove(&MapKey::from_value(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MapKey, &Value)> {
        self.entries.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &MapKey> {
        self.entries.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.entries.values()
    }

    pub fn get_index(&self, index: usize) -> Option<(&MapKey, &Value)> {
        self.entries.get_index(index)
    }

    /// The `__isa` entry, when present and itself a map.
    pub fn isa_map(&self) -> Option<Rc<RefCell<ValMap>>> {
        match self.get_str(ISA_KEY) {
            Some(Value::Map(parent)) => Some(Rc::clone(parent)),
            _ => None,
        }
    }
}

impl fmt::Debug for ValMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter()).finish()
    }
}

/// Identity projection of a value, usable as a hash-map key.  Numbers key by
/// their bit pattern, strings by text, lists by recursive element identity,
/// maps and functions by object address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MapKey {
    Null,
    Number(u64),
    Str(Rc<str>),
    List(Vec<MapKey>),
    ListRef(usize),
    MapRef(usize),
    FuncRef(usize),
    Temp(usize),
}

impl MapKey {
    pub fn from_value(value: &Value) -> Self {
        Self::from_value_depth(value, 0)
    }

    fn from_value_depth(value: &Value, depth: usize) -> Self {
        match value {
            Value::Null => MapKey::Null,
            Value::Number(n) => MapKey::Number(n.to_bits()),
            Value::Str(s) => MapKey::Str(Rc::clone(s)),
            Value::List(items) => {
                // Deeply nested (or cyclic) lists fall back to object
                // identity rather than recursing forever.
                if depth >= 32 {
                    return MapKey::ListRef(Rc::as_ptr(items) as usize);
                }
                let items = items.borrow();
                MapKey::List(
                    items
                        .iter()
                        .map(|item| Self::from_value_depth(item, depth + 1))
                        .collect(),
                )
            }
            Value::Map(map) => MapKey::MapRef(Rc::as_ptr(map) as usize),
            Value::Function(def, _) => MapKey::FuncRef(Rc::as_ptr(def) as usize),
            Value::Var { name, .. } => MapKey::Str(Rc::clone(name)),
            Value::Temp(index) => MapKey::Temp(*index),
            Value::SeqElem { .. } => MapKey::Null,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            MapKey::Null | MapKey::ListRef(_) | MapKey::MapRef(_) | MapKey::FuncRef(_) => {
                Value::Null
            }
            MapKey::Temp(index) => Value::Temp(*index),
            MapKey::Number(bits) => Value::Number(f64::from_bits(*bits)),
            MapKey::Str(s) => Value::Str(Rc::clone(s)),
            MapKey::List(items) => Value::from_vec(items.iter().map(MapKey::to_value).collect()),
        }
    }
}

/// A MiniScript value.  The first six variants are runtime values; `Var`,
/// `Temp`, and `SeqElem` are compile-time expression nodes that appear as
/// TAC operands and evaluate against a context.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Number(f64),
    Str(Rc<str>),
    List(Rc<RefCell<Vec<Value>>>),
    Map(Rc<RefCell<ValMap>>),
    Function(Rc<FuncDef>, Option<Rc<RefCell<ValMap>>>),
    Var {
        name: Rc<str>,
        no_invoke: bool,
        local_only: LocalOnlyMode,
    },
    Temp(usize),
    SeqElem {
        base: Box<Value>,
        index: Box<Value>,
        no_invoke: bool,
    },
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl Value {
    pub fn string(text: impl Into<String>) -> Value {
        Value::Str(Rc::from(text.into()))
    }

    pub fn from_vec(items: Vec<Value>) -> Value {
        Value::List(Rc::new(RefCell::new(items)))
    }

    pub fn new_map() -> Value {
        Value::Map(Rc::new(RefCell::new(ValMap::new())))
    }

    pub fn from_map(map: ValMap) -> Value {
        Value::Map(Rc::new(RefCell::new(map)))
    }

    pub fn var(name: impl Into<String>) -> Value {
        Value::Var {
            name: Rc::from(name.into()),
            no_invoke: false,
            local_only: LocalOnlyMode::Off,
        }
    }

    pub fn one_or_zero(truth: bool) -> Value {
        Value::Number(if truth { 1.0 } else { 0.0 })
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Function(..) => "funcRef",
            Value::Var { .. } | Value::Temp(_) | Value::SeqElem { .. } => "unresolved",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Value::Number(n) => *n,
            _ => 0.0,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Truth value used by conditionals and the fuzzy-logic operators.
    pub fn truth_value(&self) -> f64 {
        match self {
            Value::Null => 0.0,
            Value::Number(n) => *n,
            Value::Str(s) => {
                if s.is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::List(items) => {
                if items.borrow().is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::Map(map) => {
                if map.borrow().is_empty() {
                    0.0
                } else {
                    1.0
                }
            }
            Value::Function(..) => 1.0,
            Value::Var { .. } | Value::Temp(_) | Value::SeqElem { .. } => 0.0,
        }
    }

    /// Integer truth, used by the short-circuit `or`/`and` jumps.
    pub fn truly(&self) -> bool {
        self.truth_value() as i64 != 0
    }

    pub fn int_value(&self) -> i64 {
        self.as_number() as i64
    }

    /// Same object, for `refEquals` and map/function key identity.
    pub fn ref_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => Rc::ptr_eq(a, b),
            (Value::Map(a), Value::Map(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a, _), Value::Function(b, _)) => Rc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Render for `print`: strings bare, everything else in code form.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Str(s) => s.to_string(),
            _ => self.to_code_string(),
        }
    }

    /// Render as MiniScript source: strings quoted with `"` doubled, lists
    /// `[...]`, maps `{k: v}`.
    pub fn to_code_string(&self) -> String {
        self.code_string_depth(0)
    }

    fn code_string_depth(&self, depth: usize) -> String {
        if depth > MAX_CODE_DEPTH {
            return "...".to_string();
        }
        match self {
            Value::Null => "null".to_string(),
            Value::Number(n) => format_number(*n),
            Value::Str(s) => format!("\"{}\"", s.replace('"', "\"\"")),
            Value::List(items) => {
                let items = items.borrow();
                let parts = items
                    .iter()
                    .map(|item| item.code_string_depth(depth + 1))
                    .collect::<Vec<_>>();
                format!("[{}]", parts.join(", "))
            }
            Value::Map(map) => {
                let map = map.borrow();
                let parts = map
                    .iter()
                    .map(|(key, value)| {
                        format!(
                            "{}: {}",
                            key.to_value().code_string_depth(depth + 1),
                            value.code_string_depth(depth + 1)
                        )
                    })
                    .collect::<Vec<_>>();
                format!("{{{}}}", parts.join(", "))
            }
            Value::Function(def, _) => def.to_string(),
            Value::Var { name, no_invoke, .. } => {
                if *no_invoke {
                    format!("@{}", name)
                } else {
                    name.to_string()
                }
            }
            Value::Temp(index) => format!("_{}", index),
            Value::SeqElem { base, index, .. } => format!(
                "{}[{}]",
                base.code_string_depth(depth + 1),
                index.code_string_depth(depth + 1)
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_display_string())
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        equality(self, other) == 1.0
    }
}

/// Recursive equality over values, returning a truth value in [0, 1].
/// Cyclic lists and maps terminate via a visited-pair set.
pub fn equality(a: &Value, b: &Value) -> f64 {
    let mut visited = HashSet::new();
    equality_guarded(a, b, &mut visited)
}

fn equality_guarded(a: &Value, b: &Value, visited: &mut HashSet<(usize, usize)>) -> f64 {
    match (a, b) {
        (Value::Null, Value::Null) => 1.0,
        (Value::Number(x), Value::Number(y)) => {
            if x == y {
                1.0
            } else {
                0.0
            }
        }
        (Value::Str(x), Value::Str(y)) => {
            if x == y {
                1.0
            } else {
                0.0
            }
        }
        (Value::List(x), Value::List(y)) => {
            if Rc::ptr_eq(x, y) {
                return 1.0;
            }
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if !visited.insert(pair) {
                // Already comparing this pair further up the walk.
                return 1.0;
            }
            let x = x.borrow();
            let y = y.borrow();
            if x.len() != y.len() {
                return 0.0;
            }
            for (left, right) in x.iter().zip(y.iter()) {
                if equality_guarded(left, right, visited) != 1.0 {
                    return 0.0;
                }
            }
            1.0
        }
        (Value::Map(x), Value::Map(y)) => {
            if Rc::ptr_eq(x, y) {
                return 1.0;
            }
            let pair = (Rc::as_ptr(x) as usize, Rc::as_ptr(y) as usize);
            if !visited.insert(pair) {
                return 1.0;
            }
            let x = x.borrow();
            let y = y.borrow();
            if x.len() != y.len() {
                return 0.0;
            }
            for (key, left) in x.iter() {
                match y.entries_get(key) {
                    Some(right) => {
                        if equality_guarded(left, right, visited) != 1.0 {
                            return 0.0;
                        }
                    }
                    None => return 0.0,
                }
            }
            1.0
        }
        (Value::Function(x, _), Value::Function(y, _)) => {
            if Rc::ptr_eq(x, y) {
                1.0
            } else {
                0.0
            }
        }
        (Value::Temp(x), Value::Temp(y)) => {
            if x == y {
                1.0
            } else {
                0.0
            }
        }
        (Value::Var { name: x, .. }, Value::Var { name: y, .. }) => {
            if x == y {
                1.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

impl ValMap {
    fn entries_get(&self, key: &MapKey) -> Option<&Value> {
        self.entries.get(key)
    }
}

/// Cycle-safe recursive hash, consistent with [`equality`].
pub fn value_hash(value: &Value) -> u64 {
    let mut visited = HashSet::new();
    hash_guarded(value, &mut visited)
}

fn hash_guarded(value: &Value, visited: &mut HashSet<usize>) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    match value {
        Value::Null => 0u8.hash(&mut hasher),
        Value::Number(n) => n.to_bits().hash(&mut hasher),
        Value::Str(s) => s.hash(&mut hasher),
        Value::List(items) => {
            let addr = Rc::as_ptr(items) as usize;
            if !visited.insert(addr) {
                return 0;
            }
            for item in items.borrow().iter() {
                hash_guarded(item, visited).hash(&mut hasher);
            }
            visited.remove(&addr);
        }
        Value::Map(map) => {
            let addr = Rc::as_ptr(map) as usize;
            if !visited.insert(addr) {
                return 0;
            }
            let map = map.borrow();
            let mut combined = 0u64;
            for (key, entry) in map.iter() {
                let mut pair = std::collections::hash_map::DefaultHasher::new();
                key.hash(&mut pair);
                hash_guarded(entry, visited).hash(&mut pair);
                combined ^= pair.finish();
            }
            combined.hash(&mut hasher);
            visited.remove(&addr);
        }
        Value::Function(def, _) => (Rc::as_ptr(def) as usize).hash(&mut hasher),
        Value::Var { name, .. } => name.hash(&mut hasher),
        Value::Temp(index) => index.hash(&mut hasher),
        Value::SeqElem { .. } => 1u8.hash(&mut hasher),
    }
    hasher.finish()
}

/// Format a number the way MiniScript prints it: integers without decimals,
/// very large or very small magnitudes in `1.23457E+10` form with six
/// significant digits, otherwise up to six fractional digits with trailing
/// zeros stripped.
pub fn format_number(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "INF" } else { "-INF" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }
    let magnitude = value.abs();
    if magnitude > 1e10 || magnitude < 1e-6 {
        let formatted = format!("{:.5E}", value);
        let (mantissa, exponent) = formatted
            .split_once('E')
            .expect("{:.5E} always contains an exponent");
        let mantissa = match mantissa.split_once('.') {
            Some((whole, frac)) => {
                let frac = frac.trim_end_matches('0');
                if frac.is_empty() {
                    whole.to_string()
                } else {
                    format!("{}.{}", whole, frac)
                }
            }
            None => mantissa.to_string(),
        };
        let exp: i32 = exponent.parse().unwrap_or(0);
        let sign = if exp < 0 { '-' } else { '+' };
        return format!("{}E{}{:02}", mantissa, sign, exp.abs());
    }
    if value == value.trunc() {
        return format!("{}", value as i64);
    }
    let formatted = format!("{:.6}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    trimmed.to_string()
}

/// The TAC operation set.  Every instruction has an optional destination and
/// up to two operands; see [`TacLine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Opcode {
    Noop,
    /// Evaluate rhs_a and store into lhs.
    Assign,
    /// Store into `_` when implicit results are enabled (REPL).
    AssignImplicit,
    /// Like `Assign` but instantiates list/map literals as fresh copies.
    Copy,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Isa,
    And,
    Or,
    Not,
    /// Bind the function at rhs_a to the current locals as outer vars.
    BindAssign,
    /// Fresh map whose `__isa` is rhs_a.
    New,
    Goto,
    GotoIf,
    /// Branch when the integer part of the condition is nonzero; used by the
    /// short-circuit `or` path.
    GotoIfTruly,
    GotoIfNot,
    PushParam,
    /// rhs_a = callee, rhs_b = argument count.
    CallFunction,
    /// rhs_a = intrinsic id.
    CallIntrinsic,
    Return,
    /// lhs = rhs_a[rhs_b], with `__isa` walk on maps.
    Elem,
    /// `for`-loop variant: maps yield `{key, value}` pairs.
    IterElem,
    Length,
}

/// One line of three-address code.
#[derive(Debug, Clone, PartialEq)]
pub struct TacLine {
    pub lhs: Option<Value>,
    pub op: Opcode,
    pub rhs_a: Option<Value>,
    pub rhs_b: Option<Value>,
    pub location: Option<SourceLoc>,
}

impl TacLine {
    pub fn new(lhs: Option<Value>, op: Opcode, rhs_a: Option<Value>, rhs_b: Option<Value>) -> Self {
        Self {
            lhs,
            op,
            rhs_a,
            rhs_b,
            location: None,
        }
    }
}

impl fmt::Display for TacLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lhs = self.lhs.as_ref().map(Value::to_code_string);
        let a = self.rhs_a.as_ref().map(Value::to_code_string);
        let b = self.rhs_b.as_ref().map(Value::to_code_string);
        let lhs = lhs.as_deref().unwrap_or("_");
        let a = a.as_deref().unwrap_or("_");
        let b = b.as_deref().unwrap_or("_");
        match self.op {
            Opcode::Noop => write!(f, "noop"),
            Opcode::Assign => write!(f, "{} := {}", lhs, a),
            Opcode::AssignImplicit => write!(f, "_ := {}", a),
            Opcode::Copy => write!(f, "{} := copy of {}", lhs, a),
            Opcode::Add => write!(f, "{} := {} + {}", lhs, a, b),
            Opcode::Sub => write!(f, "{} := {} - {}", lhs, a, b),
            Opcode::Mul => write!(f, "{} := {} * {}", lhs, a, b),
            Opcode::Div => write!(f, "{} := {} / {}", lhs, a, b),
            Opcode::Mod => write!(f, "{} := {} % {}", lhs, a, b),
            Opcode::Pow => write!(f, "{} := {} ^ {}", lhs, a, b),
            Opcode::Eq => write!(f, "{} := {} == {}", lhs, a, b),
            Opcode::Neq => write!(f, "{} := {} != {}", lhs, a, b),
            Opcode::Gt => write!(f, "{} := {} > {}", lhs, a, b),
            Opcode::Gte => write!(f, "{} := {} >= {}", lhs, a, b),
            Opcode::Lt => write!(f, "{} := {} < {}", lhs, a, b),
            Opcode::Lte => write!(f, "{} := {} <= {}", lhs, a, b),
            Opcode::Isa => write!(f, "{} := {} isa {}", lhs, a, b),
            Opcode::And => write!(f, "{} := {} and {}", lhs, a, b),
            Opcode::Or => write!(f, "{} := {} or {}", lhs, a, b),
            Opcode::Not => write!(f, "{} := not {}", lhs, a),
            Opcode::BindAssign => write!(f, "{} := bind {}", lhs, a),
            Opcode::New => write!(f, "{} := new {}", lhs, a),
            Opcode::Goto => write!(f, "goto {}", a),
            Opcode::GotoIf => write!(f, "goto {} if {}", a, b),
            Opcode::GotoIfTruly => write!(f, "goto {} if truly {}", a, b),
            Opcode::GotoIfNot => write!(f, "goto {} if not {}", a, b),
            Opcode::PushParam => write!(f, "push param {}", a),
            Opcode::CallFunction => write!(f, "{} := call {} with {} args", lhs, a, b),
            Opcode::CallIntrinsic => write!(f, "call intrinsic {}", a),
            Opcode::Return => write!(f, "{} := {}; return", lhs, a),
            Opcode::Elem => write!(f, "{} := {}[{}]", lhs, a, b),
            Opcode::IterElem => write!(f, "{} := {} iter {}", lhs, a, b),
            Opcode::Length => write!(f, "{} := len({})", lhs, a),
        }
    }
}

/// Registered intrinsic names, in id order.  The parser embeds these ids
/// into `CallIntrinsic` lines; the VM registers an implementation for each
/// at the same index.
pub const INTRINSIC_NAMES: &[&str] = &[
    "abs",
    "acos",
    "asin",
    "atan",
    "bitAnd",
    "bitOr",
    "bitXor",
    "ceil",
    "char",
    "code",
    "cos",
    "floor",
    "funcRef",
    "hash",
    "hasIndex",
    "indexes",
    "indexOf",
    "insert",
    "intrinsics",
    "join",
    "len",
    "list",
    "log",
    "lower",
    "map",
    "number",
    "pi",
    "pop",
    "print",
    "pull",
    "push",
    "range",
    "refEquals",
    "remove",
    "replace",
    "rnd",
    "round",
    "shuffle",
    "sign",
    "sin",
    "slice",
    "sort",
    "split",
    "sqrt",
    "stackTrace",
    "str",
    "string",
    "sum",
    "tan",
    "time",
    "upper",
    "val",
    "values",
    "version",
    "wait",
    "yield",
];

pub fn intrinsic_id(name: &str) -> Option<usize> {
    INTRINSIC_NAMES.iter().position(|&n| n == name)
}

/// Render a code vector for `--dump-tac`.
pub fn dump_code(code: &[TacLine]) -> String {
    let mut out = String::new();
    for (index, line) in code.iter().enumerate() {
        out.push_str(&format!("{}: {}\n", index, line));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_integers_without_decimals() {
        assert_eq!(format_number(42.0), "42");
        assert_eq!(format_number(-7.0), "-7");
        assert_eq!(format_number(0.0), "0");
        assert_eq!(format_number(-0.0), "0");
    }

    #[test]
    fn formats_fractions_with_trimmed_zeros() {
        assert_eq!(format_number(1.5), "1.5");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(1.0 / 3.0), "0.333333");
    }

    #[test]
    fn formats_extremes_in_exponential_form() {
        assert_eq!(format_number(1e11), "1E+11");
        assert_eq!(format_number(1.23e-7), "1.23E-07");
        assert_eq!(format_number(123456789012.0), "1.23457E+11");
    }

    #[test]
    fn numeric_format_round_trips() {
        for value in [42.0, -7.0, 1.5, 0.25, 100.5, -3.125] {
            let text = format_number(value);
            let parsed: f64 = text.parse().unwrap();
            assert_eq!(parsed, value, "{} -> {}", value, text);
        }
    }

    #[test]
    fn code_form_doubles_quotes() {
        let value = Value::string("Hi\"There");
        assert_eq!(value.to_code_string(), "\"Hi\"\"There\"");
        assert_eq!(value.to_display_string(), "Hi\"There");
    }

    #[test]
    fn code_form_renders_containers() {
        let list = Value::from_vec(vec![
            Value::Number(1.0),
            Value::string("a"),
            Value::Null,
        ]);
        assert_eq!(list.to_code_string(), "[1, \"a\", null]");
        let mut map = ValMap::new();
        map.insert_str("x", Value::Number(2.0));
        assert_eq!(Value::from_map(map).to_code_string(), "{\"x\": 2}");
    }

    #[test]
    fn equality_is_deep_on_lists() {
        let a = Value::from_vec(vec![Value::Number(1.0), Value::string("two")]);
        let b = Value::from_vec(vec![Value::Number(1.0), Value::string("two")]);
        assert_eq!(equality(&a, &b), 1.0);
        assert_eq!(equality(&b, &a), 1.0);
        let c = Value::from_vec(vec![Value::Number(1.0)]);
        assert_eq!(equality(&a, &c), 0.0);
    }

    #[test]
    fn equality_terminates_on_cycles() {
        let a = Value::from_vec(vec![Value::Number(1.0)]);
        if let Value::List(items) = &a {
            items.borrow_mut().push(a.clone());
        }
        let b = Value::from_vec(vec![Value::Number(1.0)]);
        if let Value::List(items) = &b {
            items.borrow_mut().push(b.clone());
        }
        assert_eq!(equality(&a, &a), 1.0);
        assert_eq!(equality(&a, &b), equality(&b, &a));
    }

    #[test]
    fn hash_terminates_on_cyclic_maps() {
        let value = Value::new_map();
        if let Value::Map(map) = &value {
            map.borrow_mut().insert_str("self", value.clone());
        }
        // Just needs to return without overflowing the stack.
        let _ = value_hash(&value);
    }

    #[test]
    fn map_keys_use_value_identity() {
        let mut map = ValMap::new();
        map.insert(Value::Number(1.0), Value::string("one"));
        assert!(map.contains_key(&Value::Number(1.0)));
        assert!(!map.contains_key(&Value::Number(2.0)));

        let key_list = Value::from_vec(vec![Value::Number(1.0), Value::Number(2.0)]);
        map.insert(key_list, Value::string("pair"));
        let same_shape = Value::from_vec(vec![Value::Number(1.0), Value::Number(2.0)]);
        assert!(map.contains_key(&same_shape));

        let inner = Value::new_map();
        map.insert(inner.clone(), Value::string("by ref"));
        assert!(map.contains_key(&inner));
        assert!(!map.contains_key(&Value::new_map()));
    }

    #[test]
    fn maps_preserve_insertion_order() {
        let mut map = ValMap::new();
        map.insert_str("b", Value::Number(1.0));
        map.insert_str("a", Value::Number(2.0));
        map.insert_str("c", Value::Number(3.0));
        let keys: Vec<_> = map
            .keys()
            .map(|key| key.to_value().to_display_string())
            .collect();
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn truth_values() {
        assert_eq!(Value::Null.truth_value(), 0.0);
        assert_eq!(Value::Number(0.5).truth_value(), 0.5);
        assert_eq!(Value::string("").truth_value(), 0.0);
        assert_eq!(Value::string("x").truth_value(), 1.0);
        assert!(!Value::Number(0.5).truly());
        assert!(Value::Number(1.0).truly());
    }
}
