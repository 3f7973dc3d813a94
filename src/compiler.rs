use std::io::Write;

use crate::{
    chunk::{Chunk, OpCode},
    gc::GarbageCollector,
    objects::{object_function::ObjectFunction, object_manager::ObjectManager},
    scanner::{Scanner, Token, TokenType},
    table::Table,
    value::{make_function_value, make_number_value, make_string_value, Value},
};

const LOCALS_MAX: usize = 256;
const UPVALUES_MAX: usize = 256;

pub struct Parser<'a> {
    current: Token<'a>,
    previous: Token<'a>,
    scanner: Option<Box<Scanner<'a>>>,
    has_error: bool,
    panic_mode: bool,
    compilers: Vec<Compiler<'a>>,
    class_compilers: Vec<ClassCompiler>,
    object_manager: &'a mut ObjectManager,
    intern_strings: &'a mut Table,
    gc: &'a mut GarbageCollector,
    // Session globals stay alive across compile-time collections; REPL lines
    // share one VM.
    globals: &'a Table,
}

struct Local<'a> {
    name: Token<'a>,
    depth: i32,
    captured: bool,
}

#[derive(Clone)]
struct Upvalue {
    index: usize,
    is_local: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionType {
    Script,
    Function,
    Method,
    Initializer,
}

struct Compiler<'a> {
    function: *mut ObjectFunction,
    function_type: FunctionType,
    locals: Vec<Local<'a>>,
    upvalues: Vec<Upvalue>,
    scope_depth: i32,
}

impl<'a> Compiler<'a> {
    fn new(function_type: FunctionType) -> Self {
        Compiler {
            function: std::ptr::null_mut(),
            function_type,
            locals: vec![],
            upvalues: vec![],
            scope_depth: 0,
        }
    }
}

// Marker for being somewhere inside a class body; gates `this`.
struct ClassCompiler;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl From<u8> for Precedence {
    fn from(value: u8) -> Self {
        match value {
            0 => Precedence::None,
            1 => Precedence::Assignment,
            2 => Precedence::Or,
            3 => Precedence::And,
            4 => Precedence::Equality,
            5 => Precedence::Comparison,
            6 => Precedence::Term,
            7 => Precedence::Factor,
            8 => Precedence::Unary,
            9 => Precedence::Call,
            10 => Precedence::Primary,
            _ => unreachable!("Invalid precedence value: {}", value),
        }
    }
}

type ParserFn = fn(&mut Parser<'_>, can_assign: bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParserFn>,
    infix: Option<ParserFn>,
    precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<ParserFn>,
        infix: Option<ParserFn>,
        precedence: Precedence,
    ) -> Self {
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }
}

const RULES: [ParseRule; TokenType::Eof as usize + 1] = {
    let mut rules = [ParseRule::new(None, None, Precedence::None); TokenType::Eof as usize + 1];

    rules[TokenType::LeftParen as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.grouping()),
        Some(|parser, _can_assign| parser.call()),
        Precedence::Call,
    );

    rules[TokenType::Dot as usize] = ParseRule::new(
        None,
        Some(|parser, can_assign| parser.dot(can_assign)),
        Precedence::Call,
    );

    rules[TokenType::Minus as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Plus as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Term,
    );

    rules[TokenType::Slash as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Star as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Factor,
    );

    rules[TokenType::Bang as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.unary()),
        None,
        Precedence::None,
    );

    rules[TokenType::BangEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::EqualEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Equality,
    );

    rules[TokenType::Greater as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::GreaterEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Less as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::LessEqual as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.binary()),
        Precedence::Comparison,
    );

    rules[TokenType::Identifier as usize] = ParseRule::new(
        Some(|parser, can_assign| parser.variable(can_assign)),
        None,
        Precedence::None,
    );

    rules[TokenType::String as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.string()),
        None,
        Precedence::None,
    );

    rules[TokenType::Number as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.number()),
        None,
        Precedence::None,
    );

    rules[TokenType::And as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.and()),
        Precedence::And,
    );

    rules[TokenType::Or as usize] = ParseRule::new(
        None,
        Some(|parser, _can_assign| parser.or()),
        Precedence::Or,
    );

    rules[TokenType::True as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::False as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::Nil as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.literal()),
        None,
        Precedence::None,
    );

    rules[TokenType::This as usize] = ParseRule::new(
        Some(|parser, _can_assign| parser.this_()),
        None,
        Precedence::None,
    );

    rules
};

impl<'a> Parser<'a> {
    pub fn new(
        object_manager: &'a mut ObjectManager,
        intern_strings: &'a mut Table,
        gc: &'a mut GarbageCollector,
        globals: &'a Table,
    ) -> Self {
        let mut parser = Parser {
            current: Token {
                token_type: TokenType::Eof,
                value: "",
                line: 0,
            },
            previous: Token {
                token_type: TokenType::Eof,
                value: "",
                line: 0,
            },
            scanner: None,
            has_error: false,
            panic_mode: false,
            compilers: vec![],
            class_compilers: vec![],
            object_manager,
            intern_strings,
            gc,
            globals,
        };
        parser.init_compiler(FunctionType::Script);
        parser
    }

    /// Compile a whole source string into the implicit script function.
    /// Scanning continues to the end even after errors so every independent
    /// error gets reported; the function is withheld on failure.
    pub fn compile(&mut self, source: &'a str) -> Option<*mut ObjectFunction> {
        self.scanner = Some(Scanner::new(source));

        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }

        let (function, _upvalues) = self.end_compiler();
        if self.has_error {
            None
        } else {
            Some(function)
        }
    }

    fn specific_compiler(&self, compiler_index: usize) -> &Compiler<'a> {
        self.compilers
            .get(compiler_index)
            .expect("compiler index is invalid")
    }

    fn specific_compiler_mut(&mut self, compiler_index: usize) -> &mut Compiler<'a> {
        self.compilers
            .get_mut(compiler_index)
            .expect("compiler index is invalid")
    }

    fn current_compiler(&self) -> &Compiler<'a> {
        self.compilers.last().expect("No compiler.")
    }

    fn current_compiler_mut(&mut self) -> &mut Compiler<'a> {
        self.compilers.last_mut().expect("No compiler.")
    }

    fn current_function(&self) -> &ObjectFunction {
        unsafe { &*self.current_compiler().function }
    }

    fn current_function_mut(&mut self) -> &mut ObjectFunction {
        unsafe { &mut *self.current_compiler_mut().function }
    }

    fn current_chunk(&self) -> &Chunk {
        &self.current_function().chunk
    }

    fn current_chunk_mut(&mut self) -> &mut Chunk {
        &mut self.current_function_mut().chunk
    }

    fn current_locals(&self) -> &Vec<Local<'a>> {
        &self.current_compiler().locals
    }

    fn current_locals_mut(&mut self) -> &mut Vec<Local<'a>> {
        &mut self.current_compiler_mut().locals
    }

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            let scanner = self.scanner.as_mut().expect("Scanner was not initialized.");
            self.current = scanner.scan_token();
            if self.current.token_type != TokenType::Error {
                break;
            }

            self.error_at_current(self.current.value);
        }
    }

    fn match_token(&mut self, token_type: TokenType) -> bool {
        if !self.check(token_type) {
            return false;
        }

        self.advance();
        true
    }

    fn check(&self, token_type: TokenType) -> bool {
        self.current.token_type == token_type
    }

    fn consume(&mut self, token_type: TokenType, message: &str) {
        if self.current.token_type == token_type {
            self.advance();
            return;
        }

        self.error_at_current(message);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.current_chunk_mut().write(byte, line);
    }

    fn emit_bytes(&mut self, byte1: u8, byte2: u8) {
        self.emit_byte(byte1);
        self.emit_byte(byte2);
    }

    fn emit_constant(&mut self, value: Value) {
        let byte = self.make_constant(value);
        self.emit_bytes(OpCode::Constant.to_byte(), byte);
    }

    fn emit_return(&mut self) {
        // An initializer always hands back the receiver in slot zero.
        if self.current_compiler().function_type == FunctionType::Initializer {
            self.emit_bytes(OpCode::GetLocal.to_byte(), 0);
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.emit_byte(OpCode::Return.to_byte());
    }

    fn init_compiler(&mut self, function_type: FunctionType) {
        self.collect_if_needed();

        let mut compiler = Compiler::new(function_type);
        let (object_function, _size) = self.object_manager.alloc_function(0, String::new());
        compiler.function = object_function;

        // For anything but the script, init_compiler runs right after the
        // name was parsed, so the name is sitting in the previous token.
        if function_type != FunctionType::Script {
            unsafe { (*compiler.function).name = self.previous.value.to_string() };
        }

        // Slot zero holds the callee; inside methods it is addressable as
        // `this`, elsewhere it has no name.
        let slot_zero = if matches!(function_type, FunctionType::Method | FunctionType::Initializer)
        {
            Token {
                token_type: TokenType::This,
                value: "this",
                line: 0,
            }
        } else {
            Token {
                token_type: TokenType::Eof,
                value: "",
                line: 0,
            }
        };
        compiler.locals.push(Local {
            name: slot_zero,
            depth: 0,
            captured: false,
        });
        self.compilers.push(compiler);
    }

    fn end_compiler(&mut self) -> (*mut ObjectFunction, Vec<Upvalue>) {
        self.emit_return();
        debug_feature::disassemble_compiled_function(self);

        let compiler = self.compilers.pop().expect("No compiler.");
        unsafe { (*compiler.function).upvalue_count = compiler.upvalues.len() };
        (compiler.function, compiler.upvalues)
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if let Some(index) = self.current_chunk().find_constant(value) {
            return index as u8;
        }

        let constant_index = self.current_chunk_mut().add_constant(value);
        if constant_index > u8::MAX.into() {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        constant_index as u8
    }

    // Run a collection before an allocation the compiler is about to make.
    // Roots are every function still being built plus the intern table and
    // the session globals.
    fn collect_if_needed(&mut self) {
        if !self.object_manager.should_collect() {
            return;
        }

        let functions: Vec<*mut ObjectFunction> =
            self.compilers.iter().map(|compiler| compiler.function).collect();
        let before = self.object_manager.bytes_allocated();

        self.gc.prepare_collection(&*self.object_manager);
        self.gc
            .mark_compiler_roots(&functions, self.globals, &*self.intern_strings);
        self.gc.trace_references();
        let freed = self.gc.sweep(&mut *self.object_manager);
        self.object_manager.rearm();
        self.gc.record_cycle(
            before,
            freed,
            self.object_manager.bytes_allocated(),
            self.object_manager.next_gc(),
        );
    }

    fn number(&mut self) {
        let value = self.previous.value.parse::<f64>().unwrap_or(0.0);
        self.emit_constant(make_number_value(value));
    }

    fn string(&mut self) {
        self.collect_if_needed();
        // Trim the surrounding quotes.
        let literal = &self.previous.value[1..self.previous.value.len() - 1];
        let value = make_string_value(&mut *self.object_manager, &mut *self.intern_strings, literal);
        self.emit_constant(value);
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        self.collect_if_needed();
        let value =
            make_string_value(&mut *self.object_manager, &mut *self.intern_strings, token.value);
        self.make_constant(value)
    }

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fun) {
            self.function_declaration();
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.statement();
        }

        if self.panic_mode {
            self.synchronize();
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous.clone();
        let name_constant = self.identifier_constant(self.previous.clone());
        self.declare_variable();

        self.emit_bytes(OpCode::Class.to_byte(), name_constant);
        self.define_variable(name_constant);

        self.class_compilers.push(ClassCompiler);

        // Reload the class so each Method instruction finds it under the
        // closure it binds.
        self.named_variable(class_name, false);
        self.consume(TokenType::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::RightBrace, "Expect '}' after class body.");
        self.emit_byte(OpCode::Pop.to_byte());

        self.class_compilers.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.clone());
        let function_type = if self.previous.value == "init" {
            FunctionType::Initializer
        } else {
            FunctionType::Method
        };
        self.function(function_type);
        self.emit_bytes(OpCode::Method.to_byte(), constant);
    }

    fn variable_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");

        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit_byte(OpCode::Nil.to_byte());
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");

        self.define_variable(global);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenType::Identifier, message);

        self.declare_variable();
        if self.current_compiler().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.clone())
    }

    fn declare_variable(&mut self) {
        if self.current_compiler().scope_depth == 0 {
            return;
        }

        let mut duplicate = false;
        let variable_name = self.previous.clone();
        let scope_depth = self.current_compiler().scope_depth;
        for local in self.current_locals().iter().rev() {
            if local.depth != -1 && local.depth < scope_depth {
                break;
            }

            if Self::identifier_equal(&variable_name, &local.name) {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }

        self.add_local(variable_name);
    }

    fn add_local(&mut self, variable_name: Token<'a>) {
        if self.current_locals().len() >= LOCALS_MAX {
            self.error("Too many local variables in function.");
            return;
        }

        // Depth -1 marks the variable as declared but not yet usable; it is
        // patched to the real depth once the initializer has compiled, which
        // is what makes `var a = a;` inside a block an error.
        self.current_locals_mut().push(Local {
            name: variable_name,
            depth: -1,
            captured: false,
        });
    }

    fn function_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        self.function(FunctionType::Function);
        self.define_variable(global);
    }

    fn function(&mut self, function_type: FunctionType) {
        self.init_compiler(function_type);

        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenType::RightParen) {
            loop {
                self.current_function_mut().arity += 1;
                if self.current_function().arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after parameters.");
        self.consume(TokenType::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (object_function, upvalues) = self.end_compiler();
        let function_constant = self.make_constant(make_function_value(object_function));
        self.emit_bytes(OpCode::Closure.to_byte(), function_constant);

        for upvalue in upvalues.iter() {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index as u8);
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argument_count: usize = 0;
        if !self.check(TokenType::RightParen) {
            loop {
                self.expression();
                if argument_count >= 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                argument_count += 1;

                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::RightParen, "Expect ')' after arguments.");
        argument_count as u8
    }

    fn define_variable(&mut self, global: u8) {
        if self.current_compiler().scope_depth > 0 {
            self.mark_initialized();
            return;
        }

        self.emit_bytes(OpCode::DefineGlobal.to_byte(), global);
    }

    fn mark_initialized(&mut self) {
        let scope_depth = self.current_compiler().scope_depth;
        if scope_depth == 0 {
            return;
        }

        self.current_locals_mut()
            .last_mut()
            .expect("No local to initialize.")
            .depth = scope_depth;
    }

    fn variable(&mut self, can_assign: bool) {
        self.named_variable(self.previous.clone(), can_assign);
    }

    fn this_(&mut self) {
        if self.class_compilers.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    fn named_variable(&mut self, name: Token, can_assign: bool) {
        let mut opcode_get = OpCode::GetLocal.to_byte();
        let mut opcode_set = OpCode::SetLocal.to_byte();
        let current_compiler_index = self.compilers.len() - 1;
        let mut index = self.resolve_local(current_compiler_index, &name);
        if index == -1 {
            index = self.resolve_upvalue(current_compiler_index, &name);
            if index == -1 {
                // global
                index = self.identifier_constant(name) as i32;
                opcode_get = OpCode::GetGlobal.to_byte();
                opcode_set = OpCode::SetGlobal.to_byte();
            } else {
                opcode_get = OpCode::GetUpvalue.to_byte();
                opcode_set = OpCode::SetUpvalue.to_byte();
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(opcode_set, index as u8);
        } else {
            self.emit_bytes(opcode_get, index as u8);
        }
    }

    fn resolve_local(&mut self, compiler_index: usize, name: &Token) -> i32 {
        let mut found: Option<(usize, i32)> = None;
        for (index, local) in self
            .specific_compiler(compiler_index)
            .locals
            .iter()
            .enumerate()
            .rev()
        {
            if Self::identifier_equal(name, &local.name) {
                found = Some((index, local.depth));
                break;
            }
        }

        match found {
            Some((index, depth)) => {
                if depth == -1 {
                    self.error("Can't read local variable in its own initializer.");
                }
                index as i32
            }
            None => -1,
        }
    }

    fn identifier_equal(left: &Token, right: &Token) -> bool {
        left.token_type == right.token_type && left.value == right.value
    }

    fn resolve_upvalue(&mut self, compiler_index: usize, name: &Token) -> i32 {
        if compiler_index == 0 {
            return -1;
        }

        let local = self.resolve_local(compiler_index - 1, name);
        if local != -1 {
            self.specific_compiler_mut(compiler_index - 1)
                .locals
                .get_mut(local as usize)
                .expect("resolved local is out of range")
                .captured = true;
            return self.add_upvalue(compiler_index, local, true) as i32;
        }

        let upvalue = self.resolve_upvalue(compiler_index - 1, name);
        if upvalue != -1 {
            return self.add_upvalue(compiler_index, upvalue, false) as i32;
        }

        -1
    }

    fn add_upvalue(&mut self, compiler_index: usize, index: i32, is_local: bool) -> usize {
        {
            let compiler = self.specific_compiler(compiler_index);
            for (slot, upvalue) in compiler.upvalues.iter().enumerate() {
                if upvalue.is_local == is_local && upvalue.index == index as usize {
                    return slot;
                }
            }
        }

        if self.specific_compiler(compiler_index).upvalues.len() >= UPVALUES_MAX {
            self.error("Too many closure variables in function.");
            return 0;
        }

        let compiler = self.specific_compiler_mut(compiler_index);
        compiler.upvalues.push(Upvalue {
            index: index as usize,
            is_local,
        });
        let count = compiler.upvalues.len();
        unsafe { (*compiler.function).upvalue_count = count };
        count - 1
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());
        self.parse_precedence(Precedence::And);
        self.patch_jump_offset(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        let end_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());

        self.patch_jump_offset(else_jump);
        self.emit_byte(OpCode::Pop.to_byte());

        self.parse_precedence(Precedence::Or);
        self.patch_jump_offset(end_jump);
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Print) {
            self.print_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement();
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::LeftBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::LeftParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte()); // condition, true path
        self.statement();

        let else_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
        self.patch_jump_offset(then_jump);
        self.emit_byte(OpCode::Pop.to_byte()); // condition, false path

        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump_offset(else_jump);
    }

    fn emit_jump_bytes(&mut self, instruction: u8) -> usize {
        self.emit_byte(instruction);
        // two placeholder bytes for the 16-bit offset
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_chunk().len() - 2
    }

    fn patch_jump_offset(&mut self, offset: usize) {
        // -2 to adjust for the offset bytes themselves.
        let jump_offset = self.current_chunk().len() - offset - 2;
        if jump_offset > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }

        let current_chunk = self.current_chunk_mut();
        current_chunk.write_by_offset(offset, ((jump_offset >> 8) & 0xff) as u8);
        current_chunk.write_by_offset(offset + 1, (jump_offset & 0xff) as u8);
    }

    fn begin_scope(&mut self) {
        self.current_compiler_mut().scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.current_compiler_mut().scope_depth -= 1;
        let scope_depth = self.current_compiler().scope_depth;
        loop {
            let captured = {
                let Some(local) = self.current_locals().last() else {
                    break;
                };
                if local.depth <= scope_depth {
                    break;
                }
                local.captured
            };

            // Captured locals move into their upvalue instead of vanishing.
            if captured {
                self.emit_byte(OpCode::CloseUpvalue.to_byte());
            } else {
                self.emit_byte(OpCode::Pop.to_byte());
            }

            self.current_locals_mut().pop();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::RightBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }

        self.consume(TokenType::RightBrace, "Expect '}' after block.");
    }

    fn return_statement(&mut self) {
        if self.current_compiler().function_type == FunctionType::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenType::Semicolon) {
            self.emit_return();
        } else {
            if self.current_compiler().function_type == FunctionType::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit_byte(OpCode::Return.to_byte());
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit_byte(OpCode::Print.to_byte());
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_chunk().len();

        self.consume(TokenType::LeftParen, "Expect '(' after 'while'.");
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after condition.");

        let exit_jump = self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte());
        self.emit_byte(OpCode::Pop.to_byte());

        self.statement();
        self.emit_loop(loop_start);

        self.patch_jump_offset(exit_jump);
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit_byte(OpCode::Loop.to_byte());

        // +2 to hop over the Loop operand itself.
        let offset = self.current_chunk().len() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }

        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    // for is sugar: initializer, then a while-shaped loop whose increment is
    // compiled in place but jumped over on the way in and back to after the
    // body, keeping everything single-pass.
    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::LeftParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.variable_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.current_chunk().len();
        let mut exit_jump: Option<usize> = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");

            exit_jump = Some(self.emit_jump_bytes(OpCode::JumpIfFalse.to_byte()));
            self.emit_byte(OpCode::Pop.to_byte());
        }

        if !self.match_token(TokenType::RightParen) {
            let body_jump = self.emit_jump_bytes(OpCode::Jump.to_byte());
            let increment_start = self.current_chunk().len();
            self.expression();
            self.emit_byte(OpCode::Pop.to_byte());
            self.consume(TokenType::RightParen, "Expect ')' after for clauses.");

            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump_offset(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);

        if let Some(exit_jump) = exit_jump {
            self.patch_jump_offset(exit_jump);
            self.emit_byte(OpCode::Pop.to_byte());
        }
        self.end_scope();
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit_byte(OpCode::Pop.to_byte());
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenType::RightParen, "Expect ')' after expression.");
    }

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn unary(&mut self) {
        let operator_type = self.previous.token_type;

        self.parse_precedence(Precedence::Unary);

        match operator_type {
            TokenType::Bang => self.emit_byte(OpCode::Not.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Negate.to_byte()),
            _ => unreachable!("Expect unary operator."),
        }
    }

    fn binary(&mut self) {
        let operator_type = self.previous.token_type;
        let rule = &RULES[operator_type as usize];
        self.parse_precedence((rule.precedence as u8 + 1).into());

        match operator_type {
            TokenType::BangEqual => self.emit_bytes(OpCode::Equal.to_byte(), OpCode::Not.to_byte()),
            TokenType::EqualEqual => self.emit_byte(OpCode::Equal.to_byte()),
            TokenType::Greater => self.emit_byte(OpCode::Greater.to_byte()),
            TokenType::GreaterEqual => {
                self.emit_bytes(OpCode::Less.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Less => self.emit_byte(OpCode::Less.to_byte()),
            TokenType::LessEqual => {
                self.emit_bytes(OpCode::Greater.to_byte(), OpCode::Not.to_byte())
            }
            TokenType::Plus => self.emit_byte(OpCode::Add.to_byte()),
            TokenType::Minus => self.emit_byte(OpCode::Subtract.to_byte()),
            TokenType::Star => self.emit_byte(OpCode::Multiply.to_byte()),
            TokenType::Slash => self.emit_byte(OpCode::Divide.to_byte()),
            _ => unreachable!("Unexpected binary operator: {}", operator_type),
        }
    }

    fn literal(&mut self) {
        let operator_type = self.previous.token_type;
        match operator_type {
            TokenType::False => self.emit_byte(OpCode::False.to_byte()),
            TokenType::True => self.emit_byte(OpCode::True.to_byte()),
            TokenType::Nil => self.emit_byte(OpCode::Nil.to_byte()),
            _ => unreachable!("Unexpected literal: {}", operator_type),
        }
    }

    fn call(&mut self) {
        let argument_count = self.argument_list();
        self.emit_bytes(OpCode::Call.to_byte(), argument_count);
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenType::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.clone());

        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_bytes(OpCode::SetProperty.to_byte(), name);
        } else if self.match_token(TokenType::LeftParen) {
            // receiver.name(args) goes through Invoke, skipping the bound
            // method allocation.
            let argument_count = self.argument_list();
            self.emit_bytes(OpCode::Invoke.to_byte(), name);
            self.emit_byte(argument_count);
        } else {
            self.emit_bytes(OpCode::GetProperty.to_byte(), name);
        }
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();

        let can_assign = precedence <= Precedence::Assignment;
        if let Some(prefix) = &RULES[self.previous.token_type as usize].prefix {
            prefix(self, can_assign);
        } else {
            self.error("Expect expression.");
            return;
        }

        while precedence as u8 <= RULES[self.current.token_type as usize].precedence as u8 {
            self.advance();
            if let Some(infix) = &RULES[self.previous.token_type as usize].infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.token_type != TokenType::Eof {
            if self.previous.token_type == TokenType::Semicolon {
                return;
            }

            match self.current.token_type {
                TokenType::Class
                | TokenType::Fun
                | TokenType::Var
                | TokenType::For
                | TokenType::If
                | TokenType::While
                | TokenType::Print
                | TokenType::Return => return,
                _ => (),
            }

            self.advance();
        }
    }

    fn error(&mut self, message: &str) {
        self.error_at(&self.previous.clone(), message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(&self.current.clone(), message);
    }

    fn error_at(&mut self, token: &Token, message: &str) {
        if self.panic_mode {
            return;
        }

        self.panic_mode = true;
        write!(&mut std::io::stderr(), "[line {}] Error", token.line)
            .expect("Failed to write to stderr");

        match token.token_type {
            TokenType::Eof => {
                write!(&mut std::io::stderr(), " at end").expect("Failed to write to stderr")
            }
            TokenType::Error => {}
            _ => write!(&mut std::io::stderr(), " at '{}'", token.value)
                .expect("Failed to write to stderr"),
        };

        writeln!(&mut std::io::stderr(), ": {}", message).expect("Failed to write to stderr");
        self.has_error = true;
    }
}

#[cfg(feature = "debug_print_code")]
mod debug_feature {
    use super::*;

    pub fn disassemble_compiled_function(parser: &Parser) {
        if parser.has_error {
            return;
        }
        let function = parser.current_function();
        if function.name.is_empty() {
            crate::debug::disassemble_chunk(function.chunk(), "<script>");
        } else {
            crate::debug::disassemble_chunk(function.chunk(), &function.name);
        }
    }
}

#[cfg(not(feature = "debug_print_code"))]
mod debug_feature {
    use super::*;

    pub fn disassemble_compiled_function(_parser: &Parser) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{
        as_function_object, as_number, is_function, is_string, ValueType, ValueUnion,
    };

    struct TestContext {
        object_manager: ObjectManager,
        intern_strings: Table,
        gc: GarbageCollector,
        globals: Table,
    }

    impl TestContext {
        fn new() -> Self {
            TestContext {
                object_manager: ObjectManager::new(),
                intern_strings: Table::new(),
                gc: GarbageCollector::new(),
                globals: Table::new(),
            }
        }

        fn compile(&mut self, source: &'static str) -> Option<*mut ObjectFunction> {
            let mut parser = Parser::new(
                &mut self.object_manager,
                &mut self.intern_strings,
                &mut self.gc,
                &self.globals,
            );
            parser.compile(source)
        }
    }

    #[test]
    fn expression_bytecode_shape() {
        let mut context = TestContext::new();
        let result = context.compile(r#"!(5 - 4 > 3 * 2 == !nil);"#);
        assert!(result.is_some());

        let function = unsafe { &*result.unwrap() };
        let chunk = &function.chunk;

        assert!(
            *chunk.get_constant(0)
                == Value {
                    value_type: ValueType::ValueNumber,
                    value_as: ValueUnion { number: 5.0 }
                }
        );
        assert!(
            *chunk.get_constant(1)
                == Value {
                    value_type: ValueType::ValueNumber,
                    value_as: ValueUnion { number: 4.0 }
                }
        );

        let expected = [
            OpCode::Constant.to_byte(),
            0,
            OpCode::Constant.to_byte(),
            1,
            OpCode::Subtract.to_byte(),
            OpCode::Constant.to_byte(),
            2,
            OpCode::Constant.to_byte(),
            3,
            OpCode::Multiply.to_byte(),
            OpCode::Greater.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Equal.to_byte(),
            OpCode::Not.to_byte(),
            OpCode::Pop.to_byte(),
            OpCode::Nil.to_byte(),
            OpCode::Return.to_byte(),
        ];
        for (offset, byte) in expected.iter().enumerate() {
            assert!(chunk.read_from_offset(offset) == Some(*byte), "mismatch at {}", offset);
        }
        assert_eq!(chunk.len(), expected.len());
    }

    #[test]
    fn equal_string_literals_are_interned_once() {
        let mut context = TestContext::new();
        assert!(context.compile(r#""this is a test string";"#).is_some());
        assert!(context.compile(r#""this is a test string";"#).is_some());
        assert_eq!(context.intern_strings.len(), 1);
    }

    #[test]
    fn function_declarations_compile() {
        let mut context = TestContext::new();
        let result = context.compile(
            r#"fun areWeHavingItYet() {
                print "Yes we are!";
            }
            print areWeHavingItYet;"#,
        );
        assert!(result.is_some());
    }

    #[test]
    fn closures_capture_enclosing_locals() {
        let mut context = TestContext::new();
        let result = context.compile(
            r#"fun outer() {
                var x = 1;
                fun inner() {
                    return x;
                }
                return inner;
            }"#,
        );
        assert!(result.is_some());

        let script = unsafe { &*result.unwrap() };
        let outer_value = script
            .chunk
            .iter_constants()
            .find(|value| is_function(value))
            .expect("outer function constant missing");
        let outer = unsafe { &*as_function_object(outer_value) };
        assert_eq!(outer.name, "outer");

        let inner_value = outer
            .chunk
            .iter_constants()
            .find(|value| is_function(value))
            .expect("inner function constant missing");
        let inner = unsafe { &*as_function_object(inner_value) };
        assert_eq!(inner.name, "inner");
        assert_eq!(inner.upvalue_count, 1);

        // outer emits Closure followed by one (is_local, index) pair.
        let closure_offset = outer
            .chunk
            .code
            .iter()
            .position(|&byte| byte == OpCode::Closure.to_byte())
            .expect("Closure instruction missing");
        assert_eq!(outer.chunk.code[closure_offset + 2], 1); // captures a local
        assert_eq!(outer.chunk.code[closure_offset + 3], 1); // slot of x
    }

    #[test]
    fn class_with_methods_compiles() {
        let mut context = TestContext::new();
        let result = context.compile(
            r#"class Point {
                init(x, y) {
                    this.x = x;
                    this.y = y;
                }
                sum() {
                    return this.x + this.y;
                }
            }
            print Point;"#,
        );
        assert!(result.is_some());

        let script = unsafe { &*result.unwrap() };
        let class_ops = script
            .chunk
            .code
            .iter()
            .filter(|&&byte| byte == OpCode::Class.to_byte())
            .count();
        assert!(class_ops >= 1);
        let method_ops = script
            .chunk
            .code
            .iter()
            .filter(|&&byte| byte == OpCode::Method.to_byte())
            .count();
        assert_eq!(method_ops, 2);
    }

    #[test]
    fn method_calls_use_invoke() {
        let mut context = TestContext::new();
        let result = context.compile(r#"var p = Point(1, 2); p.sum();"#);
        assert!(result.is_some());
        let script = unsafe { &*result.unwrap() };
        assert!(script
            .chunk
            .code
            .iter()
            .any(|&byte| byte == OpCode::Invoke.to_byte()));
    }

    #[test]
    fn global_number_parsing() {
        let mut context = TestContext::new();
        let result = context.compile("var answer = 42.5;");
        assert!(result.is_some());
        let script = unsafe { &*result.unwrap() };
        let constant = script
            .chunk
            .iter_constants()
            .find(|value| !is_string(value))
            .expect("number constant missing");
        assert_eq!(as_number(constant), 42.5);
    }

    #[test]
    fn self_referential_initializer_is_an_error() {
        let mut context = TestContext::new();
        assert!(context.compile("{ var a = a; }").is_none());
    }

    #[test]
    fn duplicate_local_in_scope_is_an_error() {
        let mut context = TestContext::new();
        assert!(context.compile("{ var a = 1; var a = 2; }").is_none());
        // Shadowing in a nested scope is fine.
        assert!(context.compile("{ var b = 1; { var b = 2; } }").is_some());
    }

    #[test]
    fn invalid_assignment_target_is_an_error() {
        let mut context = TestContext::new();
        assert!(context.compile("var a = 1; var b = 2; a + b = 3;").is_none());
    }

    #[test]
    fn top_level_return_is_an_error() {
        let mut context = TestContext::new();
        assert!(context.compile("return 1;").is_none());
    }

    #[test]
    fn returning_a_value_from_init_is_an_error() {
        let mut context = TestContext::new();
        assert!(context
            .compile("class Broken { init() { return 1; } }")
            .is_none());
        assert!(context
            .compile("class Fine { init() { return; } }")
            .is_some());
    }

    #[test]
    fn this_outside_a_class_is_an_error() {
        let mut context = TestContext::new();
        assert!(context.compile("print this;").is_none());
    }

    #[test]
    fn multiple_errors_are_recovered_per_statement() {
        let mut context = TestContext::new();
        // Both statements are broken; synchronization lets the parser reach
        // the second one without cascading.
        assert!(context.compile("var 1 = 2; print ;").is_none());
    }
}
