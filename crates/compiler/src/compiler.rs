//! The single-pass Pratt compiler (§4.F).
//!
//! Bytecode is emitted directly as the parser descends; there is no
//! intermediate AST. A stack of [`FunctionScope`]s (one per nested function
//! being compiled) stands in for clox's linked list of `Compiler` structs —
//! the same nesting discipline, expressed as a `Vec` used strictly as a
//! stack rather than hand-rolled parent pointers.

use crate::error::CompileError;
use crate::scanner::{Scanner, Token, TokenKind};
use rlox_core::{disassemble_chunk, gc, Chunk, Heap, ObjFunction, ObjRef, OpCode, Value};
use tracing::Level;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        match self {
            Precedence::None => Precedence::Assignment,
            Precedence::Assignment => Precedence::Or,
            Precedence::Or => Precedence::And,
            Precedence::And => Precedence::Equality,
            Precedence::Equality => Precedence::Comparison,
            Precedence::Comparison => Precedence::Term,
            Precedence::Term => Precedence::Factor,
            Precedence::Factor => Precedence::Unary,
            Precedence::Unary => Precedence::Call,
            Precedence::Call | Precedence::Primary => Precedence::Primary,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Script,
    Function,
    Method,
    Initializer,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` marks "declared but not yet initialized" (§4.F "Locals & scopes").
    depth: i32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FunctionScope<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

impl<'src> FunctionScope<'src> {
    fn new(kind: FunctionKind, name: Option<ObjRef>) -> Self {
        let reserved_slot_name = if kind == FunctionKind::Method || kind == FunctionKind::Initializer {
            "this"
        } else {
            ""
        };
        FunctionScope {
            function: ObjFunction {
                arity: 0,
                upvalue_count: 0,
                chunk: Chunk::new(),
                name,
            },
            kind,
            locals: vec![Local {
                name: reserved_slot_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }
}

struct ClassScope {
    has_superclass: bool,
}

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<(u32, String)>,
    heap: &'h mut Heap,
    functions: Vec<FunctionScope<'src>>,
    classes: Vec<ClassScope>,
}

/// Compiles `source` into a top-level `Function` (§4.F "Output").
///
/// Returns the compiled function on success. Diagnostics are printed to
/// stderr as they are found (panic-mode recovery keeps parsing to surface
/// more than one per call); `Err` is only the after-the-fact failure signal.
pub fn compile(source: &str, heap: &mut Heap) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(source, heap);
    compiler.advance();
    while !compiler.check(TokenKind::Eof) {
        compiler.declaration();
    }
    compiler.consume(TokenKind::Eof, "Expect end of expression.");
    let function = compiler.end_function();

    if compiler.had_error {
        Err(CompileError {
            diagnostics: compiler.diagnostics,
        })
    } else {
        if tracing::enabled!(Level::TRACE) {
            tracing::trace!("{}", disassemble_chunk(&function.chunk, "script"));
        }
        Ok(compiler.heap.alloc_function(function))
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(source: &'src str, heap: &'h mut Heap) -> Self {
        let dummy = Token {
            kind: TokenKind::Error,
            lexeme: "",
            line: 0,
        };
        Compiler {
            scanner: Scanner::new(source),
            previous: dummy,
            current: dummy,
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            heap,
            functions: vec![FunctionScope::new(FunctionKind::Script, None)],
            classes: Vec::new(),
        }
    }

    // ---- token stream -----------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.to_string();
            self.error_at_current(&message);
        }
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    // ---- diagnostics ---------------------------------------------------

    fn error_at_current(&mut self, message: &str) {
        let token = self.current;
        self.error_at(token, message);
    }

    fn error(&mut self, message: &str) {
        let token = self.previous;
        self.error_at(token, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;

        let mut where_ = String::new();
        match token.kind {
            TokenKind::Eof => where_.push_str(" at end"),
            TokenKind::Error => {}
            _ => where_.push_str(&format!(" at '{}'", token.lexeme)),
        }
        let full_message = format!("[line {}] Error{where_}: {message}", token.line);
        eprintln!("{full_message}");
        self.diagnostics.push((token.line, full_message));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Fun
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => {}
            }
            self.advance();
        }
    }

    // ---- bytecode emission ----------------------------------------------

    fn current_chunk(&mut self) -> &mut Chunk {
        &mut self.functions.last_mut().expect("function stack never empty").function.chunk
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk().write_byte(byte, line);
        self.heap.track_bytes_delta(1);
    }

    fn emit_op(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_bytes(&mut self, a: u8, b: u8) {
        self.emit_byte(a);
        self.emit_byte(b);
    }

    fn emit_return(&mut self) {
        let kind = self.functions.last().unwrap().kind;
        if kind == FunctionKind::Initializer {
            self.emit_bytes(OpCode::GetLocal as u8, 0);
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.emit_op(OpCode::Return);
    }

    fn emit_constant(&mut self, value: Value) {
        let result = {
            let chunk = &mut self.functions.last_mut().unwrap().function.chunk;
            chunk.add_constant(self.heap, value)
        };
        match result {
            Ok(idx) => self.emit_bytes(OpCode::Constant as u8, idx),
            Err(_) => self.error("Too many constants in one chunk."),
        }
    }

    /// Emits a jump with a placeholder 16-bit operand and returns the offset
    /// of its first operand byte, to be filled in later by `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit_op(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        let jump = self.current_chunk().len() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let jump = jump as u16;
        self.current_chunk().patch_byte(offset, (jump >> 8) as u8);
        self.current_chunk().patch_byte(offset + 1, jump as u8);
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_op(OpCode::Loop);
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        let offset = offset as u16;
        self.emit_byte((offset >> 8) as u8);
        self.emit_byte(offset as u8);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let interned = self.heap.intern(name);
        let result = {
            let chunk = &mut self.functions.last_mut().unwrap().function.chunk;
            chunk.add_constant(self.heap, Value::obj(interned))
        };
        match result {
            Ok(idx) => idx,
            Err(_) => {
                self.error("Too many constants in one chunk.");
                0
            }
        }
    }

    // ---- scopes & locals -------------------------------------------------

    fn begin_scope(&mut self) {
        self.functions.last_mut().unwrap().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        let depth = {
            let scope = self.functions.last_mut().unwrap();
            scope.scope_depth -= 1;
            scope.scope_depth
        };
        loop {
            let is_captured = match self.functions.last().unwrap().locals.last() {
                Some(local) if local.depth > depth => local.is_captured,
                _ => break,
            };
            if is_captured {
                self.emit_op(OpCode::CloseUpvalue);
            } else {
                self.emit_op(OpCode::Pop);
            }
            self.functions.last_mut().unwrap().locals.pop();
        }
    }

    fn add_local(&mut self, name: &'src str) {
        let scope = self.functions.last_mut().unwrap();
        if scope.locals.len() >= 256 {
            self.error("Too many local variables in function.");
            return;
        }
        scope.locals.push(Local {
            name,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        let scope = self.functions.last().unwrap();
        if scope.scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let current_depth = scope.scope_depth;
        for local in scope.locals.iter().rev() {
            if local.depth != -1 && local.depth < current_depth {
                break;
            }
            if local.name == name {
                self.error("Already a variable with this name in this scope.");
                return;
            }
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.functions.last().unwrap().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let scope = self.functions.last_mut().unwrap();
        if scope.scope_depth == 0 {
            return;
        }
        let depth = scope.scope_depth;
        scope.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.functions.last().unwrap().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_bytes(OpCode::DefineGlobal as u8, global);
    }

    fn resolve_local(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        let scope = &self.functions[scope_index];
        for (i, local) in scope.locals.iter().enumerate().rev() {
            if local.name == name {
                if local.depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                return Some(i as u8);
            }
        }
        None
    }

    fn resolve_upvalue(&mut self, scope_index: usize, name: &str) -> Option<u8> {
        if scope_index == 0 {
            return None;
        }
        let enclosing = scope_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(scope_index, local_slot, true));
        }
        if let Some(upvalue_slot) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(scope_index, upvalue_slot, false));
        }
        None
    }

    fn add_upvalue(&mut self, scope_index: usize, index: u8, is_local: bool) -> u8 {
        let scope = &mut self.functions[scope_index];
        for (i, existing) in scope.upvalues.iter().enumerate() {
            if existing.index == index && existing.is_local == is_local {
                return i as u8;
            }
        }
        if scope.upvalues.len() >= 256 {
            self.error("Too many closure variables in function.");
            return 0;
        }
        scope.upvalues.push(UpvalueDesc { index, is_local });
        scope.function.upvalue_count = scope.upvalues.len() as u8;
        (scope.upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let scope_index = self.functions.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(scope_index, name) {
            (OpCode::GetLocal, OpCode::SetLocal, slot)
        } else if let Some(slot) = self.resolve_upvalue(scope_index, name) {
            (OpCode::GetUpvalue, OpCode::SetUpvalue, slot)
        } else {
            let idx = self.identifier_constant(name);
            (OpCode::GetGlobal, OpCode::SetGlobal, idx)
        };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(set_op as u8, arg);
        } else {
            self.emit_bytes(get_op as u8, arg);
        }
    }

    // ---- functions ---------------------------------------------------

    fn begin_function(&mut self, kind: FunctionKind, name: Option<ObjRef>) {
        self.functions.push(FunctionScope::new(kind, name));
    }

    fn end_function(&mut self) -> ObjFunction {
        self.emit_return();
        self.functions.pop().unwrap().function
    }

    fn function(&mut self, kind: FunctionKind) {
        let name = self.heap.intern(self.previous.lexeme);
        self.begin_function(kind, Some(name));
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                let scope = self.functions.last_mut().unwrap();
                scope.function.arity += 1;
                if scope.function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let upvalues = std::mem::take(&mut self.functions.last_mut().unwrap().upvalues);
        let function = self.end_function();
        if tracing::enabled!(Level::TRACE) {
            let label = function.name_str().to_string();
            tracing::trace!("{}", disassemble_chunk(&function.chunk, &label));
        }
        let function_ref = self.heap.alloc_function(function);
        self.emit_constant_ref(function_ref);

        for upvalue in upvalues {
            self.emit_byte(upvalue.is_local as u8);
            self.emit_byte(upvalue.index);
        }
        self.maybe_collect();
    }

    /// Like `emit_constant`, but for a `Value` that is already a heap
    /// `ObjRef` and must come out as `OP_CLOSURE idx` rather than
    /// `OP_CONSTANT idx` (§4.F "Upvalues": "`OP_CLOSURE idx` is emitted
    /// as `[opcode, constant-index, ...]`").
    fn emit_constant_ref(&mut self, function: ObjRef) {
        let result = {
            let chunk = &mut self.functions.last_mut().unwrap().function.chunk;
            chunk.add_constant(self.heap, Value::obj(function))
        };
        match result {
            Ok(idx) => self.emit_bytes(OpCode::Closure as u8, idx),
            Err(_) => self.error("Too many constants in one chunk."),
        }
    }

    // ---- GC integration ---------------------------------------------

    /// Mirrors §4.H's allocation-pressure trigger during compilation, since
    /// a long-running script's top-level function bodies can themselves
    /// allocate heavily (large string/number literal pools). Every
    /// in-progress function's name and constant pool is marked as a root
    /// (§4.H step 1, "every in-progress compiler's function").
    fn maybe_collect(&mut self) {
        if !self.heap.should_collect(false) {
            return;
        }
        let functions = &self.functions;
        gc::collect(self.heap, |marker| {
            for scope in functions {
                if let Some(name) = scope.function.name {
                    marker.mark_object(name);
                }
                scope.function.chunk.mark_constants(&mut |v| marker.mark_value(v));
            }
        });
    }

    // ---- statements ---------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Fun) {
            self.fun_declaration();
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_bytes(OpCode::Class as u8, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassScope {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);
            if self.previous.lexeme == class_name.lexeme {
                self.error("A class can't inherit from itself.");
            }
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name.lexeme, false);
            self.emit_op(OpCode::Inherit);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name.lexeme, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");
        self.emit_op(OpCode::Pop);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let name = self.previous.lexeme;
        let constant = self.identifier_constant(name);
        let kind = if name == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_bytes(OpCode::Method as u8, constant);
    }

    fn fun_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionKind::Function);
        self.define_variable(global);
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit_op(OpCode::Nil);
        }
        self.consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn statement(&mut self) {
        if self.match_token(TokenKind::Print) {
            self.print_statement();
        } else if self.match_token(TokenKind::For) {
            self.for_statement();
        } else if self.match_token(TokenKind::If) {
            self.if_statement();
        } else if self.match_token(TokenKind::Return) {
            self.return_statement();
        } else if self.match_token(TokenKind::While) {
            self.while_statement();
        } else if self.match_token(TokenKind::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit_op(OpCode::Print);
    }

    fn return_statement(&mut self) {
        if self.functions.last().unwrap().kind == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }
        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.functions.last().unwrap().kind == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit_op(OpCode::Return);
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();

        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenKind::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenKind::Semicolon) {
            // no initializer
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump = None;
        if !self.match_token(TokenKind::Semicolon) {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(OpCode::JumpIfFalse));
            self.emit_op(OpCode::Pop);
        }

        if !self.match_token(TokenKind::RightParen) {
            let body_jump = self.emit_jump(OpCode::Jump);
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_op(OpCode::Pop);
            self.consume(TokenKind::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit_op(OpCode::Pop);
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit_op(OpCode::Pop);
    }

    // ---- expressions ---------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = get_rule(self.previous.kind).prefix;
        let Some(prefix) = prefix else {
            self.error("Expect expression.");
            return;
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= get_rule(self.current.kind).precedence {
            self.advance();
            let infix = get_rule(self.previous.kind).infix.expect("precedence table guarantees an infix rule here");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = self.previous.lexeme.parse().expect("scanner guarantees a valid number lexeme");
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        let lexeme = self.previous.lexeme;
        let unquoted = &lexeme[1..lexeme.len() - 1];
        let interned = self.heap.intern(unquoted);
        self.emit_constant(Value::obj(interned));
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit_op(OpCode::False),
            TokenKind::Nil => self.emit_op(OpCode::Nil),
            TokenKind::True => self.emit_op(OpCode::True),
            _ => unreachable!("parse table only routes literal tokens here"),
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Minus => self.emit_op(OpCode::Negate),
            TokenKind::Bang => self.emit_op(OpCode::Not),
            _ => unreachable!("parse table only routes unary-operator tokens here"),
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        let rule = get_rule(operator);
        self.parse_precedence(rule.precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit_op(OpCode::Equal);
                self.emit_op(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit_op(OpCode::Equal),
            TokenKind::Greater => self.emit_op(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit_op(OpCode::Less);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Less => self.emit_op(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit_op(OpCode::Greater);
                self.emit_op(OpCode::Not);
            }
            TokenKind::Plus => self.emit_op(OpCode::Add),
            TokenKind::Minus => self.emit_op(OpCode::Subtract),
            TokenKind::Star => self.emit_op(OpCode::Multiply),
            TokenKind::Slash => self.emit_op(OpCode::Divide),
            _ => unreachable!("parse table only routes binary-operator tokens here"),
        }
    }

    fn and_(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or_(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn call(&mut self, _can_assign: bool) {
        let argc = self.argument_list();
        self.emit_bytes(OpCode::Call as u8, argc);
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        argc as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty as u8, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.emit_bytes(OpCode::Invoke as u8, name);
            self.emit_byte(argc);
        } else {
            self.emit_bytes(OpCode::GetProperty as u8, name);
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.previous.lexeme;
        self.named_variable(name, can_assign);
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.named_variable("this", false);
    }

    fn super_(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error("Can't use 'super' in a class with no superclass.");
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable("this", false);
        if self.match_token(TokenKind::LeftParen) {
            let argc = self.argument_list();
            self.named_variable("super", false);
            self.emit_bytes(OpCode::SuperInvoke as u8, name);
            self.emit_byte(argc);
        } else {
            self.named_variable("super", false);
            self.emit_bytes(OpCode::GetSuper as u8, name);
        }
    }
}

fn get_rule<'src, 'h>(kind: TokenKind) -> ParseRule<'src, 'h> {
    use Precedence::*;
    use TokenKind::*;
    let (prefix, infix, precedence): (
        Option<ParseFn<'src, 'h>>,
        Option<ParseFn<'src, 'h>>,
        Precedence,
    ) = match kind {
        LeftParen => (Some(Compiler::grouping), Some(Compiler::call), Call),
        Dot => (Option::None, Some(Compiler::dot), Call),
        Minus => (Some(Compiler::unary), Some(Compiler::binary), Term),
        Plus => (Option::None, Some(Compiler::binary), Term),
        Slash => (Option::None, Some(Compiler::binary), Factor),
        Star => (Option::None, Some(Compiler::binary), Factor),
        Bang => (Some(Compiler::unary), Option::None, None_),
        BangEqual => (Option::None, Some(Compiler::binary), Equality),
        EqualEqual => (Option::None, Some(Compiler::binary), Equality),
        Greater => (Option::None, Some(Compiler::binary), Comparison),
        GreaterEqual => (Option::None, Some(Compiler::binary), Comparison),
        Less => (Option::None, Some(Compiler::binary), Comparison),
        LessEqual => (Option::None, Some(Compiler::binary), Comparison),
        Identifier => (Some(Compiler::variable), Option::None, None_),
        String => (Some(Compiler::string), Option::None, None_),
        Number => (Some(Compiler::number), Option::None, None_),
        TokenKind::And => (Option::None, Some(Compiler::and_), Precedence::And),
        TokenKind::Or => (Option::None, Some(Compiler::or_), Precedence::Or),
        False => (Some(Compiler::literal), Option::None, None_),
        Nil => (Some(Compiler::literal), Option::None, None_),
        True => (Some(Compiler::literal), Option::None, None_),
        This => (Some(Compiler::this), Option::None, None_),
        Super => (Some(Compiler::super_), Option::None, None_),
        _ => (Option::None, Option::None, None_),
    };
    ParseRule {
        prefix,
        infix,
        precedence,
    }
}

#[allow(non_upper_case_globals)]
const None_: Precedence = Precedence::None;

#[cfg(test)]
mod tests {
    use super::*;

    fn compiles(source: &str) -> bool {
        let mut heap = Heap::new();
        compile(source, &mut heap).is_ok()
    }

    #[test]
    fn compiles_arithmetic() {
        assert!(compiles("print 1 + 2 * 3;"));
    }

    #[test]
    fn rejects_unterminated_block() {
        assert!(!compiles("fun f() { print 1;"));
    }

    #[test]
    fn rejects_return_at_top_level() {
        assert!(!compiles("return 1;"));
    }

    #[test]
    fn rejects_this_outside_class() {
        assert!(!compiles("print this;"));
    }

    #[test]
    fn accepts_closures_and_classes() {
        assert!(compiles(
            "fun makeCounter() { var i = 0; fun c() { i = i + 1; return i; } return c; }"
        ));
        assert!(compiles(
            "class A { speak() { print \"A\"; } } class B < A { speak() { super.speak(); } }"
        ));
    }
}
