//! Offline pretty-printer for a [`Chunk`] (§2 Component I, "external").
//!
//! The C original gates this behind `DEBUG_PRINT_CODE`/`DEBUG_TRACE_EXECUTION`
//! compile-time flags that print straight to stdout. Here it is plain data
//! production; `rlox-compiler` and `rlox-vm` decide whether to pay for it by
//! checking `tracing::enabled!(Level::TRACE)` before calling in, so a
//! release build with tracing off never formats a single instruction.

use crate::chunk::{Chunk, OpCode};

/// Renders every instruction in `chunk`, one line each, prefixed by `name`.
pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.len() {
        let (line, next) = disassemble_instruction(chunk, offset);
        out.push_str(&line);
        out.push('\n');
        offset = next;
    }
    out
}

/// Renders the single instruction at `offset`, returning the rendered line
/// and the offset of the next instruction.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut line = format!("{offset:04} ");
    if offset > 0 && chunk.line_at(offset) == chunk.line_at(offset - 1) {
        line.push_str("   | ");
    } else {
        line.push_str(&format!("{:4} ", chunk.line_at(offset)));
    }

    let op = OpCode::from_byte(chunk.byte_at(offset));
    let (rendered, next) = match op {
        OpCode::Constant => constant_instruction("OP_CONSTANT", chunk, offset),
        OpCode::GetGlobal => constant_instruction("OP_GET_GLOBAL", chunk, offset),
        OpCode::DefineGlobal => constant_instruction("OP_DEFINE_GLOBAL", chunk, offset),
        OpCode::SetGlobal => constant_instruction("OP_SET_GLOBAL", chunk, offset),
        OpCode::GetProperty => constant_instruction("OP_GET_PROPERTY", chunk, offset),
        OpCode::SetProperty => constant_instruction("OP_SET_PROPERTY", chunk, offset),
        OpCode::GetSuper => constant_instruction("OP_GET_SUPER", chunk, offset),
        OpCode::Class => constant_instruction("OP_CLASS", chunk, offset),
        OpCode::Method => constant_instruction("OP_METHOD", chunk, offset),
        OpCode::Nil => simple_instruction("OP_NIL", offset),
        OpCode::True => simple_instruction("OP_TRUE", offset),
        OpCode::False => simple_instruction("OP_FALSE", offset),
        OpCode::Pop => simple_instruction("OP_POP", offset),
        OpCode::Equal => simple_instruction("OP_EQUAL", offset),
        OpCode::Greater => simple_instruction("OP_GREATER", offset),
        OpCode::Less => simple_instruction("OP_LESS", offset),
        OpCode::Add => simple_instruction("OP_ADD", offset),
        OpCode::Subtract => simple_instruction("OP_SUBTRACT", offset),
        OpCode::Multiply => simple_instruction("OP_MULTIPLY", offset),
        OpCode::Divide => simple_instruction("OP_DIVIDE", offset),
        OpCode::Not => simple_instruction("OP_NOT", offset),
        OpCode::Negate => simple_instruction("OP_NEGATE", offset),
        OpCode::Print => simple_instruction("OP_PRINT", offset),
        OpCode::CloseUpvalue => simple_instruction("OP_CLOSE_UPVALUE", offset),
        OpCode::Return => simple_instruction("OP_RETURN", offset),
        OpCode::Inherit => simple_instruction("OP_INHERIT", offset),
        OpCode::GetLocal => byte_instruction("OP_GET_LOCAL", chunk, offset),
        OpCode::SetLocal => byte_instruction("OP_SET_LOCAL", chunk, offset),
        OpCode::GetUpvalue => byte_instruction("OP_GET_UPVALUE", chunk, offset),
        OpCode::SetUpvalue => byte_instruction("OP_SET_UPVALUE", chunk, offset),
        OpCode::Call => byte_instruction("OP_CALL", chunk, offset),
        OpCode::Jump => jump_instruction("OP_JUMP", 1, chunk, offset),
        OpCode::JumpIfFalse => jump_instruction("OP_JUMP_IF_FALSE", 1, chunk, offset),
        OpCode::Loop => jump_instruction("OP_LOOP", -1, chunk, offset),
        OpCode::Invoke => invoke_instruction("OP_INVOKE", chunk, offset),
        OpCode::SuperInvoke => invoke_instruction("OP_SUPER_INVOKE", chunk, offset),
        OpCode::Closure => closure_instruction(chunk, offset),
    };
    line.push_str(&rendered);
    (line, next)
}

fn simple_instruction(name: &str, offset: usize) -> (String, usize) {
    (name.to_string(), offset + 1)
}

fn byte_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let slot = chunk.byte_at(offset + 1);
    (format!("{name:<16} {slot:4}"), offset + 2)
}

fn constant_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let index = chunk.byte_at(offset + 1);
    let value = chunk.constant_at(index);
    (format!("{name:<16} {index:4} '{value}'"), offset + 2)
}

fn jump_instruction(name: &str, sign: i32, chunk: &Chunk, offset: usize) -> (String, usize) {
    let hi = chunk.byte_at(offset + 1) as u16;
    let lo = chunk.byte_at(offset + 2) as u16;
    let jump = (hi << 8) | lo;
    let target = offset as i32 + 3 + sign * jump as i32;
    (format!("{name:<16} {offset:4} -> {target}"), offset + 3)
}

fn invoke_instruction(name: &str, chunk: &Chunk, offset: usize) -> (String, usize) {
    let index = chunk.byte_at(offset + 1);
    let argc = chunk.byte_at(offset + 2);
    let value = chunk.constant_at(index);
    (
        format!("{name:<16} ({argc} args) {index:4} '{value}'"),
        offset + 3,
    )
}

fn closure_instruction(chunk: &Chunk, offset: usize) -> (String, usize) {
    let mut cursor = offset + 1;
    let index = chunk.byte_at(cursor);
    cursor += 1;
    let value = chunk.constant_at(index);
    let mut line = format!("{:<16} {index:4} '{value}'", "OP_CLOSURE");
    if let Some(function) = value.as_obj_checked().and_then(|o| o.as_function()) {
        for _ in 0..function.upvalue_count {
            let is_local = chunk.byte_at(cursor);
            cursor += 1;
            let index = chunk.byte_at(cursor);
            cursor += 1;
            let kind = if is_local != 0 { "local" } else { "upvalue" };
            line.push_str(&format!("\n{cursor:04}      |                     {kind} {index}"));
        }
    }
    (line, cursor)
}

impl crate::value::Value {
    fn as_obj_checked(self) -> Option<crate::object::ObjRef> {
        if self.is_obj() {
            Some(self.as_obj())
        } else {
            None
        }
    }
}

impl std::fmt::Display for crate::value::Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_nil() {
            write!(f, "nil")
        } else if self.is_bool() {
            write!(f, "{}", self.as_bool())
        } else if self.is_number() {
            write!(f, "{}", self.as_number())
        } else {
            write!(f, "{}", self.as_obj())
        }
    }
}
