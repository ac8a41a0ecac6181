//! The intrinsic library.  Intrinsics register once (per thread) into a
//! table in id order; the parser embeds those ids and the VM dispatches by
//! them.  Each intrinsic may return a partial result, which the VM stores on
//! the context and re-presents on the next step.

use std::cell::RefCell;
use std::f64::consts::PI;
use std::rc::Rc;

use ms_syntax::{
    value_hash, FuncDef, FuncParam, Opcode, TacLine, ValMap, Value, INTRINSIC_NAMES, MAX_SIZE,
};

use crate::{Machine, RuntimeError};

/// What an intrinsic hands back: a final value, or opaque in-progress state
/// that the same call site receives again on the next step.
pub enum IntrinsicResult {
    Done(Value),
    Partial(Value),
}

pub type IntrinsicFn = fn(&mut Machine, Option<Value>) -> Result<IntrinsicResult, RuntimeError>;

#[derive(Clone)]
pub struct IntrinsicDef {
    pub name: &'static str,
    pub id: usize,
    /// A function value whose body is a single `CallIntrinsic` line; calls
    /// go through the ordinary call protocol so arguments bind to params.
    pub stub: Rc<FuncDef>,
    pub func: IntrinsicFn,
}

thread_local! {
    static REGISTRY: RefCell<Vec<IntrinsicDef>> = const { RefCell::new(Vec::new()) };
}

pub(crate) fn ensure_registered() {
    REGISTRY.with(|registry| {
        if !registry.borrow().is_empty() {
            return;
        }
        let mut table = Vec::with_capacity(INTRINSIC_NAMES.len());
        for (id, &name) in INTRINSIC_NAMES.iter().enumerate() {
            let (params, func) = spec_for(name);
            let code = Rc::new(RefCell::new(vec![TacLine::new(
                Some(Value::Temp(0)),
                Opcode::CallIntrinsic,
                Some(Value::Number(id as f64)),
                None,
            )]));
            table.push(IntrinsicDef {
                name,
                id,
                stub: Rc::new(FuncDef { params, code }),
                func,
            });
        }
        *registry.borrow_mut() = table;
    });
}

pub fn intrinsic_by_id(id: usize) -> Option<IntrinsicDef> {
    ensure_registered();
    REGISTRY.with(|registry| registry.borrow().get(id).cloned())
}

pub fn intrinsic_by_name(name: &str) -> Option<IntrinsicDef> {
    ensure_registered();
    REGISTRY.with(|registry| {
        registry
            .borrow()
            .iter()
            .find(|def| def.name == name)
            .cloned()
    })
}

fn p(name: &str, default: Value) -> FuncParam {
    FuncParam {
        name: name.to_string(),
        default,
    }
}

fn num(value: f64) -> Value {
    Value::Number(value)
}

fn done(value: Value) -> Result<IntrinsicResult, RuntimeError> {
    Ok(IntrinsicResult::Done(value))
}

impl Machine {
    /// Read an intrinsic argument (bound as a local, or `self` via the
    /// context slot).
    pub(crate) fn arg(&mut self, name: &str) -> Value {
        self.get_var(name, ms_syntax::LocalOnlyMode::Off)
            .unwrap_or(Value::Null)
    }

    pub(crate) fn rand_u64(&mut self) -> u64 {
        // xorshift64* mix, same shape as the usual deterministic generators.
        let mut value = self.rng_state;
        value ^= value >> 12;
        value ^= value << 25;
        value ^= value >> 27;
        self.rng_state = value;
        value.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub(crate) fn rand_f64(&mut self) -> f64 {
        (self.rand_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    fn proto(
        slot: &mut Option<Rc<RefCell<ValMap>>>,
        members: &[&str],
    ) -> Rc<RefCell<ValMap>> {
        if let Some(map) = slot {
            return Rc::clone(map);
        }
        let mut fresh = ValMap::new();
        for &name in members {
            if let Some(def) = intrinsic_by_name(name) {
                fresh.insert_str(name, Value::Function(def.stub, None));
            }
        }
        let map = Rc::new(RefCell::new(fresh));
        *slot = Some(Rc::clone(&map));
        map
    }

    pub(crate) fn number_type(&mut self) -> Rc<RefCell<ValMap>> {
        Self::proto(&mut self.number_type, &[])
    }

    pub(crate) fn string_type(&mut self) -> Rc<RefCell<ValMap>> {
        Self::proto(
            &mut self.string_type,
            &[
                "code", "hasIndex", "indexes", "indexOf", "insert", "len", "lower", "remove",
                "replace", "split", "upper", "val", "values",
            ],
        )
    }

    pub(crate) fn list_type(&mut self) -> Rc<RefCell<ValMap>> {
        Self::proto(
            &mut self.list_type,
            &[
                "hasIndex", "indexes", "indexOf", "insert", "join", "len", "pop", "pull", "push",
                "remove", "replace", "shuffle", "sort", "sum", "values",
            ],
        )
    }

    pub(crate) fn map_type(&mut self) -> Rc<RefCell<ValMap>> {
        Self::proto(
            &mut self.map_type,
            &[
                "hasIndex", "indexes", "indexOf", "len", "pop", "pull", "push", "remove",
                "replace", "shuffle", "sum", "values",
            ],
        )
    }

    pub(crate) fn function_type(&mut self) -> Rc<RefCell<ValMap>> {
        Self::proto(&mut self.function_type, &[])
    }
}

fn math1(m: &mut Machine, f: fn(f64) -> f64) -> Result<IntrinsicResult, RuntimeError> {
    let x = m.arg("x").as_number();
    done(num(f(x)))
}

fn bit_op(m: &mut Machine, f: fn(u32, u32) -> u32) -> Result<IntrinsicResult, RuntimeError> {
    let i = m.arg("i").as_number();
    let j = m.arg("j").as_number();
    // Sign-magnitude split: the magnitudes combine as 32-bit values, and the
    // sign bit goes through the same operation, as if it were one more bit.
    // So bitAnd is negative only when both operands are, bitOr when either
    // is, and bitXor when exactly one is.
    let magnitude = f(i.abs() as u32, j.abs() as u32) as f64;
    let negative = f(u32::from(i < 0.0), u32::from(j < 0.0)) != 0;
    done(num(if negative { -magnitude } else { magnitude }))
}

fn spec_for(name: &str) -> (Vec<FuncParam>, IntrinsicFn) {
    match name {
        "abs" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::abs)),
        "acos" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::acos)),
        "asin" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::asin)),
        "atan" => (vec![p("y", num(0.0)), p("x", num(1.0))], |m, _| {
            let y = m.arg("y").as_number();
            let x = m.arg("x").as_number();
            done(num(if x == 1.0 { y.atan() } else { y.atan2(x) }))
        }),
        "bitAnd" => (vec![p("i", num(0.0)), p("j", num(0.0))], |m, _| {
            bit_op(m, |a, b| a & b)
        }),
        "bitOr" => (vec![p("i", num(0.0)), p("j", num(0.0))], |m, _| {
            bit_op(m, |a, b| a | b)
        }),
        "bitXor" => (vec![p("i", num(0.0)), p("j", num(0.0))], |m, _| {
            bit_op(m, |a, b| a ^ b)
        }),
        "ceil" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::ceil)),
        "char" => (vec![p("codePoint", num(65.0))], |m, _| {
            let code = m.arg("codePoint").as_number() as u32;
            match char::from_u32(code) {
                Some(c) => done(Value::string(c.to_string())),
                None => Err(RuntimeError::runtime(format!(
                    "char: invalid code point {}",
                    code
                ))),
            }
        }),
        "code" => (vec![p("self", Value::Null)], |m, _| {
            let value = m.arg("self");
            let text = value.to_display_string();
            match text.chars().next() {
                Some(c) => done(num(c as u32 as f64)),
                None => done(Value::Null),
            }
        }),
        "cos" => (vec![p("radians", num(0.0))], |m, _| {
            done(num(m.arg("radians").as_number().cos()))
        }),
        "floor" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::floor)),
        "funcRef" => (vec![], |m, _| done(Value::Map(m.function_type()))),
        "hash" => (vec![p("obj", Value::Null)], |m, _| {
            let value = m.arg("obj");
            done(num((value_hash(&value) as u32) as f64))
        }),
        "hasIndex" => (vec![p("self", Value::Null), p("index", Value::Null)], |m, _| {
            let target = m.arg("self");
            let index = m.arg("index");
            let result = match &target {
                Value::List(items) => {
                    let len = items.borrow().len() as i64;
                    matches!(index, Value::Number(_)) && {
                        let at = index.int_value();
                        at >= 0 && at < len
                    }
                }
                Value::Str(text) => {
                    let len = text.chars().count() as i64;
                    matches!(index, Value::Number(_)) && {
                        let at = index.int_value();
                        at >= 0 && at < len
                    }
                }
                Value::Map(map) => map.borrow().contains_key(&index),
                _ => false,
            };
            done(Value::one_or_zero(result))
        }),
        "indexes" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            let result = match &target {
                Value::List(items) => {
                    (0..items.borrow().len()).map(|i| num(i as f64)).collect()
                }
                Value::Str(text) => (0..text.chars().count())
                    .map(|i| num(i as f64))
                    .collect(),
                Value::Map(map) => map.borrow().keys().map(|k| k.to_value()).collect(),
                _ => return done(Value::Null),
            };
            done(Value::from_vec(result))
        }),
        "indexOf" => (
            vec![
                p("self", Value::Null),
                p("value", Value::Null),
                p("after", Value::Null),
            ],
            |m, _| {
                let target = m.arg("self");
                let wanted = m.arg("value");
                let after = m.arg("after");
                match &target {
                    Value::List(items) => {
                        let items = items.borrow();
                        let len = items.len() as i64;
                        let start = match after {
                            Value::Null => 0,
                            ref other => {
                                let mut at = other.int_value();
                                if at < 0 {
                                    at += len;
                                }
                                at + 1
                            }
                        };
                        for i in start.max(0)..len {
                            if ms_syntax::equality(&items[i as usize], &wanted) == 1.0 {
                                return done(num(i as f64));
                            }
                        }
                        done(Value::Null)
                    }
                    Value::Str(text) => {
                        let needle = wanted.to_display_string();
                        let chars: Vec<char> = text.chars().collect();
                        let len = chars.len() as i64;
                        let start = match after {
                            Value::Null => 0,
                            ref other => {
                                let mut at = other.int_value();
                                if at < 0 {
                                    at += len;
                                }
                                at + 1
                            }
                        };
                        let haystack: String =
                            chars.iter().skip(start.max(0) as usize).collect();
                        match haystack.find(&needle) {
                            Some(byte_at) => {
                                let char_at = haystack[..byte_at].chars().count();
                                done(num((start.max(0) as usize + char_at) as f64))
                            }
                            None => done(Value::Null),
                        }
                    }
                    Value::Map(map) => {
                        for (key, value) in map.borrow().iter() {
                            if ms_syntax::equality(value, &wanted) == 1.0 {
                                return done(key.to_value());
                            }
                        }
                        done(Value::Null)
                    }
                    _ => done(Value::Null),
                }
            },
        ),
        "insert" => (
            vec![
                p("self", Value::Null),
                p("index", Value::Null),
                p("value", Value::Null),
            ],
            |m, _| {
                let target = m.arg("self");
                let index = m.arg("index");
                let value = m.arg("value");
                if index.is_null() {
                    return Err(RuntimeError::runtime("insert: index argument required"));
                }
                match &target {
                    Value::List(items) => {
                        let len = items.borrow().len() as i64;
                        let mut at = index.int_value();
                        if at < 0 {
                            at += len + 1;
                        }
                        if at < 0 || at > len {
                            return Err(RuntimeError::index(format!(
                                "Index Error (list index {} out of range)",
                                index.int_value()
                            )));
                        }
                        if len as usize + 1 > MAX_SIZE {
                            return Err(RuntimeError::limit("Maximum list size exceeded"));
                        }
                        items.borrow_mut().insert(at as usize, value);
                        done(target.clone())
                    }
                    Value::Str(text) => {
                        let chars: Vec<char> = text.chars().collect();
                        let len = chars.len() as i64;
                        let mut at = index.int_value();
                        if at < 0 {
                            at += len + 1;
                        }
                        if at < 0 || at > len {
                            return Err(RuntimeError::index(format!(
                                "Index Error (string index {} out of range)",
                                index.int_value()
                            )));
                        }
                        let mut out: String = chars[..at as usize].iter().collect();
                        out.push_str(&value.to_display_string());
                        out.extend(&chars[at as usize..]);
                        if out.len() > MAX_SIZE {
                            return Err(RuntimeError::limit("Maximum string size exceeded"));
                        }
                        done(Value::string(out))
                    }
                    _ => Err(RuntimeError::type_error(
                        "insert requires a list or string",
                    )),
                }
            },
        ),
        "intrinsics" => (vec![], |m, _| {
            if let Some(cached) = &m.intrinsics_map {
                return done(cached.clone());
            }
            let mut map = ValMap::new();
            REGISTRY.with(|registry| {
                for def in registry.borrow().iter() {
                    map.insert_str(def.name, Value::Function(Rc::clone(&def.stub), None));
                }
            });
            map.assign_override = Some(|_key, _value| Err("intrinsics map is read-only".into()));
            let value = Value::from_map(map);
            m.intrinsics_map = Some(value.clone());
            done(value)
        }),
        "join" => (
            vec![p("self", Value::Null), p("delimiter", Value::string(" "))],
            |m, _| {
                let target = m.arg("self");
                let delimiter = match m.arg("delimiter") {
                    Value::Null => " ".to_string(),
                    other => other.to_display_string(),
                };
                match &target {
                    Value::List(items) => {
                        let parts: Vec<String> = items
                            .borrow()
                            .iter()
                            .map(|item| match item {
                                Value::Null => String::new(),
                                other => other.to_display_string(),
                            })
                            .collect();
                        let joined = parts.join(&delimiter);
                        if joined.len() > MAX_SIZE {
                            return Err(RuntimeError::limit("Maximum string size exceeded"));
                        }
                        done(Value::string(joined))
                    }
                    _ => done(target.clone()),
                }
            },
        ),
        "len" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            let result = match &target {
                Value::List(items) => num(items.borrow().len() as f64),
                Value::Str(text) => num(text.chars().count() as f64),
                Value::Map(map) => num(map.borrow().len() as f64),
                _ => Value::Null,
            };
            done(result)
        }),
        "list" => (vec![], |m, _| done(Value::Map(m.list_type()))),
        "log" => (vec![p("x", num(0.0)), p("base", num(10.0))], |m, _| {
            let x = m.arg("x").as_number();
            let base = m.arg("base").as_number();
            done(num(x.ln() / base.ln()))
        }),
        "lower" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            match &target {
                Value::Str(text) => done(Value::string(text.to_lowercase())),
                _ => done(target.clone()),
            }
        }),
        "map" => (vec![], |m, _| done(Value::Map(m.map_type()))),
        "number" => (vec![], |m, _| done(Value::Map(m.number_type()))),
        "pi" => (vec![], |_, _| done(num(PI))),
        "pop" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            match &target {
                Value::List(items) => {
                    let popped = items.borrow_mut().pop();
                    done(popped.unwrap_or(Value::Null))
                }
                Value::Map(map) => {
                    let last_key = map.borrow().keys().last().cloned();
                    match last_key {
                        Some(key) => {
                            let key = key.to_value();
                            map.borrow_mut().remove(&key);
                            done(key)
                        }
                        None => done(Value::Null),
                    }
                }
                _ => done(Value::Null),
            }
        }),
        "print" => (
            vec![p("s", Value::string("")), p("delimiter", Value::Null)],
            |m, _| {
                let value = m.arg("s");
                let text = match &value {
                    Value::Null => "null".to_string(),
                    other => other.to_display_string(),
                };
                match m.arg("delimiter") {
                    Value::Null => m.write_output(&text, true),
                    delimiter => {
                        let chunk = format!("{}{}", text, delimiter.to_display_string());
                        m.write_output(&chunk, false);
                    }
                }
                done(Value::Null)
            },
        ),
        "pull" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            match &target {
                Value::List(items) => {
                    let mut items = items.borrow_mut();
                    if items.is_empty() {
                        done(Value::Null)
                    } else {
                        done(items.remove(0))
                    }
                }
                Value::Map(map) => {
                    let first_key = map.borrow().keys().next().cloned();
                    match first_key {
                        Some(key) => {
                            let key = key.to_value();
                            map.borrow_mut().remove(&key);
                            done(key)
                        }
                        None => done(Value::Null),
                    }
                }
                _ => done(Value::Null),
            }
        }),
        "push" => (vec![p("self", Value::Null), p("value", Value::Null)], |m, _| {
            let target = m.arg("self");
            let value = m.arg("value");
            match &target {
                Value::List(items) => {
                    if items.borrow().len() + 1 > MAX_SIZE {
                        return Err(RuntimeError::limit("Maximum list size exceeded"));
                    }
                    items.borrow_mut().push(value);
                    done(target.clone())
                }
                Value::Map(map) => {
                    map.borrow_mut().insert(value, num(1.0));
                    done(target.clone())
                }
                _ => Err(RuntimeError::type_error("push requires a list or map")),
            }
        }),
        "range" => (
            vec![
                p("from", num(0.0)),
                p("to", num(0.0)),
                p("step", Value::Null),
            ],
            |m, _| {
                let from = m.arg("from").as_number();
                let to = m.arg("to").as_number();
                let step = match m.arg("step") {
                    Value::Null => {
                        if to >= from {
                            1.0
                        } else {
                            -1.0
                        }
                    }
                    other => other.as_number(),
                };
                if step == 0.0 {
                    return Err(RuntimeError::runtime("range() error (step==0)"));
                }
                let count = ((to - from) / step).floor() as i64 + 1;
                if count <= 0 {
                    return done(Value::from_vec(Vec::new()));
                }
                if count as usize > MAX_SIZE {
                    return Err(RuntimeError::limit("Maximum list size exceeded"));
                }
                let mut items = Vec::with_capacity(count as usize);
                for i in 0..count {
                    items.push(num(from + step * i as f64));
                }
                done(Value::from_vec(items))
            },
        ),
        "refEquals" => (vec![p("a", Value::Null), p("b", Value::Null)], |m, _| {
            let a = m.arg("a");
            let b = m.arg("b");
            done(Value::one_or_zero(a.ref_equals(&b)))
        }),
        "remove" => (vec![p("self", Value::Null), p("k", Value::Null)], |m, _| {
            let target = m.arg("self");
            let k = m.arg("k");
            match &target {
                Value::Map(map) => {
                    let removed = map.borrow_mut().remove(&k).is_some();
                    done(Value::one_or_zero(removed))
                }
                Value::List(items) => {
                    let len = items.borrow().len() as i64;
                    let mut at = k.int_value();
                    if at < 0 {
                        at += len;
                    }
                    if at < 0 || at >= len {
                        return Err(RuntimeError::index(format!(
                            "Index Error (list index {} out of range)",
                            k.int_value()
                        )));
                    }
                    items.borrow_mut().remove(at as usize);
                    done(Value::Null)
                }
                Value::Str(text) => {
                    let needle = k.to_display_string();
                    match text.find(&needle) {
                        Some(at) if !needle.is_empty() => {
                            let mut out = text.to_string();
                            out.replace_range(at..at + needle.len(), "");
                            done(Value::string(out))
                        }
                        _ => done(target.clone()),
                    }
                }
                _ => Err(RuntimeError::type_error(
                    "remove requires a list, map, or string",
                )),
            }
        }),
        "replace" => (
            vec![
                p("self", Value::Null),
                p("oldval", Value::Null),
                p("newval", Value::Null),
                p("maxCount", Value::Null),
            ],
            |m, _| {
                let target = m.arg("self");
                let oldval = m.arg("oldval");
                let newval = m.arg("newval");
                let max_count = match m.arg("maxCount") {
                    Value::Null => usize::MAX,
                    other => other.int_value().max(0) as usize,
                };
                match &target {
                    Value::Str(text) => {
                        let needle = oldval.to_display_string();
                        if needle.is_empty() {
                            return done(target.clone());
                        }
                        let replacement = newval.to_display_string();
                        let mut out = String::new();
                        let mut rest = text.as_ref();
                        let mut replaced = 0usize;
                        while replaced < max_count {
                            match rest.find(&needle) {
                                Some(at) => {
                                    out.push_str(&rest[..at]);
                                    out.push_str(&replacement);
                                    rest = &rest[at + needle.len()..];
                                    replaced += 1;
                                }
                                None => break,
                            }
                        }
                        out.push_str(rest);
                        if out.len() > MAX_SIZE {
                            return Err(RuntimeError::limit("Maximum string size exceeded"));
                        }
                        done(Value::string(out))
                    }
                    Value::List(items) => {
                        let mut items = items.borrow_mut();
                        let mut replaced = 0usize;
                        for item in items.iter_mut() {
                            if replaced >= max_count {
                                break;
                            }
                            if ms_syntax::equality(item, &oldval) == 1.0 {
                                *item = newval.clone();
                                replaced += 1;
                            }
                        }
                        drop(items);
                        done(target.clone())
                    }
                    Value::Map(map) => {
                        let keys: Vec<Value> = map
                            .borrow()
                            .iter()
                            .filter(|(_, value)| ms_syntax::equality(*value, &oldval) == 1.0)
                            .map(|(key, _)| key.to_value())
                            .collect();
                        let mut replaced = 0usize;
                        for key in keys {
                            if replaced >= max_count {
                                break;
                            }
                            map.borrow_mut().insert(key, newval.clone());
                            replaced += 1;
                        }
                        done(target.clone())
                    }
                    _ => Err(RuntimeError::type_error(
                        "replace requires a list, map, or string",
                    )),
                }
            },
        ),
        "rnd" => (vec![p("seed", Value::Null)], |m, _| {
            if let Value::Number(seed) = m.arg("seed") {
                m.rng_state = (seed as i64 as u64) ^ 0x9E37_79B9_7F4A_7C15;
            }
            done(num(m.rand_f64()))
        }),
        "round" => (
            vec![p("x", num(0.0)), p("decimalPlaces", num(0.0))],
            |m, _| {
                let x = m.arg("x").as_number();
                let places = m.arg("decimalPlaces").as_number() as i32;
                let factor = 10f64.powi(places);
                done(num((x * factor).round() / factor))
            },
        ),
        "shuffle" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            match &target {
                Value::List(items) => {
                    let len = items.borrow().len();
                    for i in (1..len).rev() {
                        let j = (m.rand_u64() % (i as u64 + 1)) as usize;
                        items.borrow_mut().swap(i, j);
                    }
                    done(Value::Null)
                }
                Value::Map(map) => {
                    // Shuffle the values among the existing keys.
                    let keys: Vec<Value> =
                        map.borrow().keys().map(|k| k.to_value()).collect();
                    let mut values: Vec<Value> =
                        map.borrow().values().cloned().collect();
                    let len = values.len();
                    for i in (1..len).rev() {
                        let j = (m.rand_u64() % (i as u64 + 1)) as usize;
                        values.swap(i, j);
                    }
                    let mut map_ref = map.borrow_mut();
                    for (key, value) in keys.into_iter().zip(values) {
                        map_ref.insert(key, value);
                    }
                    done(Value::Null)
                }
                _ => done(Value::Null),
            }
        }),
        "sign" => (vec![p("x", num(0.0))], |m, _| {
            let x = m.arg("x").as_number();
            let result = if x > 0.0 {
                1.0
            } else if x < 0.0 {
                -1.0
            } else {
                0.0
            };
            done(num(result))
        }),
        "sin" => (vec![p("radians", num(0.0))], |m, _| {
            done(num(m.arg("radians").as_number().sin()))
        }),
        "slice" => (
            vec![
                p("seq", Value::Null),
                p("from", num(0.0)),
                p("to", Value::Null),
            ],
            |m, _| {
                let seq = m.arg("seq");
                let from = m.arg("from");
                let to = m.arg("to");
                match &seq {
                    Value::List(items) => {
                        let items = items.borrow();
                        let (start, end) = slice_bounds(items.len(), &from, &to);
                        done(Value::from_vec(items[start..end].to_vec()))
                    }
                    Value::Str(text) => {
                        let chars: Vec<char> = text.chars().collect();
                        let (start, end) = slice_bounds(chars.len(), &from, &to);
                        done(Value::string(chars[start..end].iter().collect::<String>()))
                    }
                    _ => done(Value::Null),
                }
            },
        ),
        "sort" => (
            vec![
                p("self", Value::Null),
                p("byKey", Value::Null),
                p("ascending", num(1.0)),
            ],
            |m, _| {
                let target = m.arg("self");
                let by_key = m.arg("byKey");
                let ascending = m.arg("ascending").truth_value() != 0.0;
                let items = match &target {
                    Value::List(items) => items,
                    _ => return done(target.clone()),
                };
                let snapshot: Vec<Value> = items.borrow().clone();
                let mut keyed: Vec<(Value, Value)> = snapshot
                    .into_iter()
                    .map(|element| (sort_key(&element, &by_key), element))
                    .collect();
                let with_key = !by_key.is_null();
                keyed.sort_by(|(ka, _), (kb, _)| compare_sort_keys(ka, kb, with_key));
                if !ascending {
                    keyed.reverse();
                }
                *items.borrow_mut() = keyed.into_iter().map(|(_, element)| element).collect();
                done(target.clone())
            },
        ),
        "split" => (
            vec![
                p("self", Value::Null),
                p("delimiter", Value::string(" ")),
                p("maxCount", Value::Null),
            ],
            |m, _| {
                let target = m.arg("self");
                let delimiter = m.arg("delimiter").to_display_string();
                let max_count = match m.arg("maxCount") {
                    Value::Null => usize::MAX,
                    other => other.int_value().max(0) as usize,
                };
                let text = match &target {
                    Value::Str(text) => text.to_string(),
                    _ => return done(Value::Null),
                };
                let mut parts = Vec::new();
                if delimiter.is_empty() {
                    for c in text.chars() {
                        if parts.len() + 1 >= max_count {
                            break;
                        }
                        parts.push(Value::string(c.to_string()));
                    }
                } else {
                    let mut rest = text.as_str();
                    loop {
                        if parts.len() + 1 >= max_count {
                            break;
                        }
                        match rest.find(&delimiter) {
                            Some(at) => {
                                parts.push(Value::string(&rest[..at]));
                                rest = &rest[at + delimiter.len()..];
                            }
                            None => break,
                        }
                    }
                    parts.push(Value::string(rest));
                }
                done(Value::from_vec(parts))
            },
        ),
        "sqrt" => (vec![p("x", num(0.0))], |m, _| math1(m, f64::sqrt)),
        "stackTrace" => (vec![], |m, _| {
            if let Some(cached) = m.get_global("_stackAtBreak") {
                return done(cached);
            }
            // Newest frame first.
            let mut frames = Vec::new();
            for frame in m.stack.iter().rev() {
                if let Some(loc) = frame.current_location() {
                    frames.push(Value::string(loc.to_string()));
                }
            }
            done(Value::from_vec(frames))
        }),
        "str" => (vec![p("x", Value::string(""))], |m, _| {
            let value = m.arg("x");
            let text = match &value {
                Value::Null => "null".to_string(),
                other => other.to_display_string(),
            };
            done(Value::string(text))
        }),
        "string" => (vec![], |m, _| done(Value::Map(m.string_type()))),
        "sum" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            let total = match &target {
                Value::List(items) => items
                    .borrow()
                    .iter()
                    .map(Value::as_number)
                    .sum::<f64>(),
                Value::Map(map) => map.borrow().values().map(Value::as_number).sum::<f64>(),
                _ => 0.0,
            };
            done(num(total))
        }),
        "tan" => (vec![p("radians", num(0.0))], |m, _| {
            done(num(m.arg("radians").as_number().tan()))
        }),
        "time" => (vec![], |m, _| done(num(m.run_time()))),
        "upper" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            match &target {
                Value::Str(text) => done(Value::string(text.to_uppercase())),
                _ => done(target.clone()),
            }
        }),
        "val" => (vec![p("self", num(0.0))], |m, _| {
            let value = m.arg("self");
            let result = match &value {
                Value::Number(n) => num(*n),
                Value::Str(text) => num(text.trim().parse::<f64>().unwrap_or(0.0)),
                _ => Value::Null,
            };
            done(result)
        }),
        "values" => (vec![p("self", Value::Null)], |m, _| {
            let target = m.arg("self");
            let result = match &target {
                Value::List(items) => items.borrow().clone(),
                Value::Str(text) => text
                    .chars()
                    .map(|c| Value::string(c.to_string()))
                    .collect(),
                Value::Map(map) => map.borrow().values().cloned().collect(),
                _ => return done(Value::Null),
            };
            done(Value::from_vec(result))
        }),
        "version" => (vec![], |m, _| {
            if let Some(cached) = &m.version_map {
                return done(cached.clone());
            }
            let full = env!("CARGO_PKG_VERSION");
            let short: f64 = {
                let mut parts = full.split('.');
                let major = parts.next().unwrap_or("0");
                let minor = parts.next().unwrap_or("0");
                format!("{}.{}", major, minor).parse().unwrap_or(0.0)
            };
            let mut map = ValMap::new();
            map.insert_str("miniscript", num(short));
            map.insert_str("buildDate", Value::string(""));
            map.insert_str("host", num(0.0));
            map.insert_str("hostName", Value::string("miniscript-rs"));
            map.insert_str("hostInfo", Value::string(full));
            let value = Value::from_map(map);
            m.version_map = Some(value.clone());
            done(value)
        }),
        "wait" => (vec![p("seconds", num(1.0))], |m, partial| {
            match partial {
                None => {
                    // First entry: stash the wake-up time as the partial.
                    let seconds = m.arg("seconds").as_number();
                    Ok(IntrinsicResult::Partial(num(m.run_time() + seconds)))
                }
                Some(target) => {
                    if m.run_time() >= target.as_number() {
                        done(Value::Null)
                    } else {
                        Ok(IntrinsicResult::Partial(target))
                    }
                }
            }
        }),
        "yield" => (vec![], |m, _| {
            m.yielding = true;
            done(Value::Null)
        }),
        _ => unreachable!("unregistered intrinsic name: {}", name),
    }
}

fn slice_bounds(len: usize, from: &Value, to: &Value) -> (usize, usize) {
    let len = len as i64;
    let mut start = match from {
        Value::Null => 0,
        other => other.int_value(),
    };
    let mut end = match to {
        Value::Null => len,
        other => other.int_value(),
    };
    if start < 0 {
        start += len;
    }
    if end < 0 {
        end += len;
    }
    let start = start.clamp(0, len) as usize;
    let end = end.clamp(0, len) as usize;
    (start, end.max(start))
}

fn sort_key(element: &Value, by_key: &Value) -> Value {
    if by_key.is_null() {
        return element.clone();
    }
    match element {
        Value::Map(map) => map.borrow().get(by_key).cloned().unwrap_or(Value::Null),
        Value::List(items) => {
            if let Value::Number(_) = by_key {
                let items = items.borrow();
                let len = items.len() as i64;
                let mut at = by_key.int_value();
                if at < 0 {
                    at += len;
                }
                if at >= 0 && at < len {
                    return items[at as usize].clone();
                }
            }
            Value::Null
        }
        _ => Value::Null,
    }
}

/// Ascending-order comparator.  Without a sort key, nulls order last; with
/// one, they order first.  Descending order is a pure reversal, which flips
/// the null placement the way the sort contract requires.
fn compare_sort_keys(a: &Value, b: &Value, with_key: bool) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a.is_null(), b.is_null()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return if with_key { Ordering::Less } else { Ordering::Greater },
        (false, true) => return if with_key { Ordering::Greater } else { Ordering::Less },
        (false, false) => {}
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x.partial_cmp(y).unwrap_or(Ordering::Equal)
        }
        (Value::Str(x), Value::Str(y)) => x.cmp(y),
        _ => a.to_display_string().cmp(&b.to_display_string()),
    }
}
