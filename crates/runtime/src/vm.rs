//! The bytecode virtual machine (§4.G, §4.H, §6).
//!
//! `ObjRef::get()` extends every heap read to a `'static` lifetime (see
//! `rlox-core`'s `object` module doc comment), which means the `Chunk`,
//! `ObjFunction`, and `ObjClosure` a frame points at can be held as plain
//! local variables across the whole dispatch loop without ever borrowing
//! `self` — `self.stack`, `self.heap`, and `self.frames` stay free for the
//! loop body to mutate as each instruction demands.

use crate::config::Config;
use crate::error::{InterpretError, RuntimeError};
use crate::native::clock;
use rlox_compiler::compile;
use rlox_core::{
    disassemble_instruction, gc, is_truthy, values_equal, Chunk, Heap, NativeFn, Obj, ObjRef,
    OpCode, Table, Upvalue, Value,
};
use tracing::Level;

/// §4.H "initially... 64 call frames" analogue: clox fixes `FRAMES_MAX` at
/// 64 and `STACK_MAX` at `FRAMES_MAX * UINT8_COUNT`.
const FRAMES_MAX: usize = 64;
const STACK_MAX: usize = FRAMES_MAX * 256;

struct CallFrame {
    closure: ObjRef,
    ip: usize,
    /// Index into `Vm::stack` of this frame's slot 0.
    slots_base: usize,
}

/// Owns the heap, the value stack, and the call-frame stack; `interpret`
/// compiles and runs one source string to completion or first error.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Option<ObjRef>,
    init_string: ObjRef,
    gc_stress: bool,
}

impl Vm {
    pub fn new(config: Config) -> Self {
        let mut heap = Heap::new();
        if let Some(threshold) = config.gc_threshold_override {
            heap.set_next_gc(threshold);
        }
        let init_string = heap.intern("init");
        let mut vm = Vm {
            heap,
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            open_upvalues: None,
            init_string,
            gc_stress: cfg!(feature = "gc-stress-test") || config.gc_stress_test,
        };
        vm.define_native("clock", clock);
        vm
    }

    /// Interns `name` and wraps `function` as a native, rooting both while
    /// the global table entry is built (§4.H "Allocation safety").
    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name_ref = self.heap.intern(name);
        self.heap.push_root(Value::obj(name_ref));
        let native_ref = self.heap.alloc_native(name_ref, function);
        self.heap.push_root(Value::obj(native_ref));
        self.globals.set(name_ref, Value::obj(native_ref));
        self.heap.pop_root();
        self.heap.pop_root();
    }

    pub fn interpret(&mut self, source: &str) -> Result<(), InterpretError> {
        let function = compile(source, &mut self.heap)?;
        self.push(Value::obj(function));
        let closure = self.heap.alloc_closure(function, Vec::new());
        self.pop();
        self.push(Value::obj(closure));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots_base: 0,
        });
        self.run()
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("internal: stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn maybe_collect(&mut self) {
        if !self.heap.should_collect(self.gc_stress) {
            return;
        }
        let stack = &self.stack;
        let frames = &self.frames;
        let open_upvalues = self.open_upvalues;
        let globals = &self.globals;
        let init_string = self.init_string;
        gc::collect(&mut self.heap, |marker| {
            for &v in stack.iter() {
                marker.mark_value(v);
            }
            for frame in frames.iter() {
                marker.mark_object(frame.closure);
            }
            let mut current = open_upvalues;
            while let Some(r) = current {
                marker.mark_object(r);
                current = r.as_upvalue().expect("open-upvalues list holds upvalues").open_next();
            }
            marker.mark_table(globals);
            marker.mark_object(init_string);
        });
    }

    fn runtime_error(&mut self, message: String) -> Result<(), InterpretError> {
        eprintln!("{message}");
        let mut trace = Vec::with_capacity(self.frames.len());
        for frame in self.frames.iter().rev() {
            let closure = frame.closure.as_closure().expect("frame always holds a closure");
            let function = closure
                .function
                .as_function()
                .expect("closure always wraps a function");
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.line_at(instruction);
            let trace_line = if function.name.is_none() {
                format!("[line {line}] in script")
            } else {
                format!("[line {line}] in {}()", function.name_str())
            };
            eprintln!("{trace_line}");
            trace.push(trace_line);
        }
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
        Err(InterpretError::Runtime(RuntimeError { message, trace }))
    }

    fn numeric_binary(&mut self, op: fn(f64, f64) -> f64) -> Result<(), InterpretError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return self.runtime_error("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::number(op(a, b)));
        Ok(())
    }

    fn number_comparison(&mut self, cmp: fn(f64, f64) -> bool) -> Result<(), InterpretError> {
        if !self.peek(0).is_number() || !self.peek(1).is_number() {
            return self.runtime_error("Operands must be numbers.".to_string());
        }
        let b = self.pop().as_number();
        let a = self.pop().as_number();
        self.push(Value::bool(cmp(a, b)));
        Ok(())
    }

    /// Looks up `name` on `class`'s method table and, on a hit, pops the
    /// receiver on top of the stack and pushes a bound method in its place
    /// (§3 "BoundMethod").
    fn bind_method(&mut self, class: ObjRef, name: ObjRef) -> Result<(), InterpretError> {
        let method = class
            .as_class()
            .expect("bind_method called on a class")
            .methods
            .borrow()
            .get(name);
        match method {
            Some(m) => {
                let receiver = self.pop();
                let bound = self.heap.alloc_bound_method(receiver, m.as_obj());
                self.push(Value::obj(bound));
                Ok(())
            }
            None => self.runtime_error(format!("Undefined property '{name}'.")),
        }
    }

    fn invoke_from_class(&mut self, class: ObjRef, name: ObjRef, argc: u8) -> Result<(), InterpretError> {
        let method = class
            .as_class()
            .expect("invoke_from_class called on a class")
            .methods
            .borrow()
            .get(name);
        match method {
            Some(m) => self.call_closure(m.as_obj(), argc),
            None => self.runtime_error(format!("Undefined property '{name}'.")),
        }
    }

    /// `receiver.name(args)`: tries an instance field first — a field that
    /// holds a callable is invoked as a plain call, not a method dispatch
    /// (§9 Open Question) — then falls back to the class's method table.
    fn invoke(&mut self, name: ObjRef, argc: u8) -> Result<(), InterpretError> {
        let receiver = self.peek(argc as usize);
        if !receiver.is_obj() || receiver.as_obj().as_instance().is_none() {
            return self.runtime_error("Only instances have methods.".to_string());
        }
        let instance = receiver.as_obj().as_instance().unwrap();
        let field = instance.fields.borrow().get(name);
        if let Some(value) = field {
            let slot = self.stack.len() - 1 - argc as usize;
            self.stack[slot] = value;
            return self.call_value(value, argc);
        }
        self.invoke_from_class(instance.class, name, argc)
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: u8) -> Result<(), InterpretError> {
        let closure = closure_ref
            .as_closure()
            .expect("call_closure called on a closure");
        let function = closure.function.as_function().unwrap();
        if argc != function.arity {
            return self.runtime_error(format!(
                "Expected {} arguments but got {argc}.",
                function.arity
            ));
        }
        if self.frames.len() >= FRAMES_MAX {
            return self.runtime_error("Stack overflow.".to_string());
        }
        let slots_base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure: closure_ref,
            ip: 0,
            slots_base,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), InterpretError> {
        if callee.is_obj() {
            let obj = callee.as_obj();
            match obj.get() {
                Obj::Closure(_) => return self.call_closure(obj, argc),
                Obj::Class(class) => {
                    let instance = self.heap.alloc_instance(obj);
                    let slot = self.stack.len() - 1 - argc as usize;
                    self.stack[slot] = Value::obj(instance);
                    let initializer = class.methods.borrow().get(self.init_string);
                    if let Some(initializer) = initializer {
                        return self.call_closure(initializer.as_obj(), argc);
                    } else if argc != 0 {
                        return self.runtime_error(format!("Expected 0 arguments but got {argc}."));
                    }
                    return Ok(());
                }
                Obj::BoundMethod(bound) => {
                    let slot = self.stack.len() - 1 - argc as usize;
                    self.stack[slot] = bound.receiver;
                    return self.call_closure(bound.method, argc);
                }
                Obj::Native(native) => {
                    let args_start = self.stack.len() - argc as usize;
                    let result = (native.function)(&self.stack[args_start..]);
                    self.stack.truncate(args_start - 1);
                    self.push(result);
                    return Ok(());
                }
                _ => {}
            }
        }
        self.runtime_error("Can only call functions and classes.".to_string())
    }

    /// Finds (or creates) the open upvalue pointing at `stack_index`. The
    /// open-upvalues list is kept in strictly descending stack-index order so
    /// the search can stop as soon as it passes the insertion point (§3
    /// Invariants).
    fn capture_upvalue(&mut self, stack_index: usize) -> ObjRef {
        let mut previous: Option<ObjRef> = None;
        let mut current = self.open_upvalues;

        while let Some(upvalue_ref) = current {
            let upvalue = upvalue_ref.as_upvalue().unwrap();
            match upvalue.stack_index() {
                Some(idx) if idx == stack_index => return upvalue_ref,
                Some(idx) if idx < stack_index => break,
                _ => {}
            }
            previous = current;
            current = upvalue.open_next();
        }

        let created = self.heap.alloc_upvalue(stack_index);
        created.as_upvalue().unwrap().set_open_next(current);
        match previous {
            Some(p) => p.as_upvalue().unwrap().set_open_next(Some(created)),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Closes every open upvalue pointing at or above `boundary` on the
    /// stack, copying its current value in (§3 "Upvalue... closed").
    fn close_upvalues(&mut self, boundary: usize) {
        while let Some(upvalue_ref) = self.open_upvalues {
            let upvalue = upvalue_ref.as_upvalue().unwrap();
            match upvalue.stack_index() {
                Some(idx) if idx >= boundary => {
                    let value = self.stack[idx];
                    upvalue.close(value);
                    self.open_upvalues = upvalue.open_next();
                }
                _ => break,
            }
        }
    }

    fn run(&mut self) -> Result<(), InterpretError> {
        loop {
            self.maybe_collect();

            let frame_idx = self.frames.len() - 1;
            let closure_ref = self.frames[frame_idx].closure;
            let mut ip = self.frames[frame_idx].ip;
            let closure = closure_ref.as_closure().expect("frame always holds a closure");
            let function = closure
                .function
                .as_function()
                .expect("closure always wraps a function");
            let chunk: &'static Chunk = &function.chunk;

            if tracing::enabled!(Level::TRACE) {
                let (line, _) = disassemble_instruction(chunk, ip);
                tracing::trace!(stack = ?debug_stack(&self.stack), "{line}");
            }

            let op = OpCode::from_byte(read_byte(chunk, &mut ip));
            self.frames[frame_idx].ip = ip;

            match op {
                OpCode::Constant => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    self.push(chunk.constant_at(idx));
                }
                OpCode::Nil => self.push(Value::nil()),
                OpCode::True => self.push(Value::bool(true)),
                OpCode::False => self.push(Value::bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let base = self.frames[frame_idx].slots_base;
                    self.push(self.stack[base + slot as usize]);
                }
                OpCode::SetLocal => {
                    let slot = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let base = self.frames[frame_idx].slots_base;
                    self.stack[base + slot as usize] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    match self.globals.get(name) {
                        Some(v) => self.push(v),
                        None => return self.runtime_error(format!("Undefined variable '{name}'.")),
                    }
                }
                OpCode::DefineGlobal => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let value = self.pop();
                    self.globals.set(name, value);
                }
                OpCode::SetGlobal => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    if self.globals.set(name, self.peek(0)) {
                        self.globals.delete(name);
                        return self.runtime_error(format!("Undefined variable '{name}'."));
                    }
                }
                OpCode::GetUpvalue => {
                    let slot = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let upvalue_ref = closure.upvalues[slot as usize];
                    let upvalue = upvalue_ref.as_upvalue().unwrap();
                    let value = match upvalue.state() {
                        Upvalue::Open(idx) => self.stack[idx],
                        Upvalue::Closed => upvalue.get_closed(),
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let slot = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let upvalue_ref = closure.upvalues[slot as usize];
                    let upvalue = upvalue_ref.as_upvalue().unwrap();
                    let value = self.peek(0);
                    match upvalue.state() {
                        Upvalue::Open(idx) => self.stack[idx] = value,
                        Upvalue::Closed => upvalue.set_closed(value),
                    }
                }
                OpCode::GetProperty => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let receiver = self.peek(0);
                    if !receiver.is_obj() || receiver.as_obj().as_instance().is_none() {
                        return self.runtime_error("Only instances have properties.".to_string());
                    }
                    let instance = receiver.as_obj().as_instance().unwrap();
                    let field = instance.fields.borrow().get(name);
                    if let Some(value) = field {
                        self.pop();
                        self.push(value);
                    } else {
                        let class = instance.class;
                        self.bind_method(class, name)?;
                    }
                }
                OpCode::SetProperty => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    if !self.peek(1).is_obj() || self.peek(1).as_obj().as_instance().is_none() {
                        return self.runtime_error("Only instances have fields.".to_string());
                    }
                    let instance = self.peek(1).as_obj().as_instance().unwrap();
                    instance.fields.borrow_mut().set(name, self.peek(0));
                    let value = self.pop();
                    self.pop();
                    self.push(value);
                }
                OpCode::GetSuper => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let superclass = self.pop().as_obj();
                    self.bind_method(superclass, name)?;
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::bool(values_equal(a, b)));
                }
                OpCode::Greater => self.number_comparison(|a, b| a > b)?,
                OpCode::Less => self.number_comparison(|a, b| a < b)?,
                OpCode::Add => {
                    if self.peek(0).is_number() && self.peek(1).is_number() {
                        let b = self.pop().as_number();
                        let a = self.pop().as_number();
                        self.push(Value::number(a + b));
                    } else if self.peek(0).is_obj()
                        && self.peek(1).is_obj()
                        && self.peek(0).as_obj().as_string().is_some()
                        && self.peek(1).as_obj().as_string().is_some()
                    {
                        let b = self.peek(0).as_obj().as_string().unwrap().as_str().to_string();
                        let a = self.peek(1).as_obj().as_string().unwrap().as_str().to_string();
                        let concatenated = self.heap.intern_owned(format!("{a}{b}"));
                        self.pop();
                        self.pop();
                        self.push(Value::obj(concatenated));
                    } else {
                        return self
                            .runtime_error("Operands must be two numbers or two strings.".to_string());
                    }
                }
                OpCode::Subtract => self.numeric_binary(|a, b| a - b)?,
                OpCode::Multiply => self.numeric_binary(|a, b| a * b)?,
                OpCode::Divide => self.numeric_binary(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::bool(!is_truthy(v)));
                }
                OpCode::Negate => {
                    if !self.peek(0).is_number() {
                        return self.runtime_error("Operand must be a number.".to_string());
                    }
                    let v = self.pop().as_number();
                    self.push(Value::number(-v));
                }
                OpCode::Print => {
                    let value = self.pop();
                    println!("{value}");
                }
                OpCode::Jump => {
                    let offset = read_u16(chunk, &mut ip);
                    ip += offset as usize;
                    self.frames[frame_idx].ip = ip;
                }
                OpCode::JumpIfFalse => {
                    let offset = read_u16(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    if !is_truthy(self.peek(0)) {
                        self.frames[frame_idx].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = read_u16(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip - offset as usize;
                }
                OpCode::Call => {
                    let argc = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let callee = self.peek(argc as usize);
                    self.call_value(callee, argc)?;
                }
                OpCode::Invoke => {
                    let idx = read_byte(chunk, &mut ip);
                    let argc = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    self.invoke(name, argc)?;
                }
                OpCode::SuperInvoke => {
                    let idx = read_byte(chunk, &mut ip);
                    let argc = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let superclass = self.pop().as_obj();
                    self.invoke_from_class(superclass, name, argc)?;
                }
                OpCode::Closure => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let function_ref = chunk.constant_at(idx).as_obj();
                    let upvalue_count = function_ref.as_function().unwrap().upvalue_count;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = read_byte(chunk, &mut ip) != 0;
                        let index = read_byte(chunk, &mut ip);
                        self.frames[frame_idx].ip = ip;
                        if is_local {
                            let base = self.frames[frame_idx].slots_base;
                            upvalues.push(self.capture_upvalue(base + index as usize));
                        } else {
                            upvalues.push(closure.upvalues[index as usize]);
                        }
                    }
                    let new_closure = self.heap.alloc_closure(function_ref, upvalues);
                    self.push(Value::obj(new_closure));
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots_base = self.frames[frame_idx].slots_base;
                    self.close_upvalues(slots_base);
                    self.stack.truncate(slots_base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                OpCode::Class => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let class = self.heap.alloc_class(name);
                    self.push(Value::obj(class));
                }
                OpCode::Inherit => {
                    let superclass_val = self.peek(1);
                    if !superclass_val.is_obj() || superclass_val.as_obj().as_class().is_none() {
                        return self.runtime_error("Superclass must be a class.".to_string());
                    }
                    let superclass = superclass_val.as_obj().as_class().unwrap();
                    let subclass = self.peek(0).as_obj().as_class().unwrap();
                    subclass.methods.borrow_mut().add_all(&superclass.methods.borrow());
                    self.pop();
                }
                OpCode::Method => {
                    let idx = read_byte(chunk, &mut ip);
                    self.frames[frame_idx].ip = ip;
                    let name = chunk.constant_at(idx).as_obj();
                    let method = self.pop();
                    let class = self.peek(0).as_obj().as_class().unwrap();
                    class.methods.borrow_mut().set(name, method);
                }
            }
        }
    }
}

fn read_byte(chunk: &Chunk, ip: &mut usize) -> u8 {
    let byte = chunk.byte_at(*ip);
    *ip += 1;
    byte
}

fn read_u16(chunk: &Chunk, ip: &mut usize) -> u16 {
    let hi = read_byte(chunk, ip) as u16;
    let lo = read_byte(chunk, ip) as u16;
    (hi << 8) | lo
}

fn debug_stack(stack: &[Value]) -> String {
    let mut out = String::new();
    for v in stack {
        out.push_str(&format!("[ {v} ]"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> Result<(), InterpretError> {
        let mut vm = Vm::new(Config::default());
        vm.interpret(source)
    }

    #[test]
    fn arithmetic_precedence() {
        assert!(run("var a = 1 + 2 * 3; if (a != 7) { \"fail\"(); }").is_ok());
    }

    #[test]
    fn undefined_variable_is_a_runtime_error() {
        assert!(matches!(run("print nope;"), Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn closures_capture_by_reference() {
        let source = r#"
            fun makeCounter() {
                var i = 0;
                fun count() {
                    i = i + 1;
                    return i;
                }
                return count;
            }
            var counter = makeCounter();
            if (counter() != 1) { "fail"(); }
            if (counter() != 2) { "fail"(); }
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn classes_initializers_and_inheritance() {
        let source = r#"
            class Animal {
                init(name) {
                    this.name = name;
                }
                speak() {
                    return this.name;
                }
            }
            class Dog < Animal {
                speak() {
                    return super.speak() + " woofs";
                }
            }
            var d = Dog("Rex");
            if (d.speak() != "Rex woofs") { "fail"(); }
        "#;
        assert!(run(source).is_ok());
    }

    #[test]
    fn calling_a_non_callable_is_a_runtime_error() {
        assert!(matches!(run("var x = 1; x();"), Err(InterpretError::Runtime(_))));
    }

    #[test]
    fn native_clock_is_callable() {
        assert!(run("var t = clock(); print t;").is_ok());
    }
}
