/// Parser — Single-Pass Bytecode Compiler
///
/// Recursive descent over the token stream with no AST: code is emitted into
/// the current function's growable buffer as productions are recognized,
/// with patch-backs for forward branches. A stack of function scopes records
/// hoisted `var` names, hoisted function declarations, strict-mode
/// inheritance and loop patch lists; hoisting lands in the bytecode header
/// so emission itself stays one pass. `for` update clauses replay a saved
/// token range after the body.
///
/// Every failure carries a stable `ParserErrId` and the 1-based position it
/// was detected at; errors abort the parse, there is no recovery.
use crate::bytecode::{
    ByteCode, Emitter, ExtOp, ModuleInfo, Op, TryRecord, BC_ARROW, BC_ASYNC, BC_GENERATOR,
    BC_MODULE, BC_SCRIPT, BC_STRICT, IP_NONE,
};
use crate::config::CONFIG;
use crate::context::Context;
use crate::errors::{ParseError, ParserErrId};
use crate::heap::{self, CellData, Idx};
use crate::lexer::{Lexeme, Lexer, Token};
use crate::strings::{self, Magic};
use crate::value::{HeapKind, Value};
use std::rc::Rc;

const MAX_NESTING: u32 = 256;
const MAX_ARGS: usize = 255;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct ParseOptions {
    pub module: bool,
    pub strict: bool,
    pub source_name: Option<String>,
    /// Opaque embedder cookie carried on the compiled unit.
    pub user_value: Value,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            module: false,
            strict: false,
            source_name: None,
            user_value: Value::UNDEFINED,
        }
    }
}

// ---------------------------------------------------------------------------
// Scopes
// ---------------------------------------------------------------------------

struct LoopCtx {
    breaks: Vec<usize>,
    continues: Vec<usize>,
    env_depth: u16,
}

struct FuncScope {
    emitter: Emitter,
    flags: u16,
    name: Value,
    arg_names: Vec<Value>,
    var_names: Vec<Value>,
    func_decls: Vec<(Value, u16)>,
    loops: Vec<LoopCtx>,
    env_depth: u16,
}

impl FuncScope {
    fn new(flags: u16, name: Value) -> FuncScope {
        FuncScope {
            emitter: Emitter::new(),
            flags,
            name,
            arg_names: Vec::new(),
            var_names: Vec::new(),
            func_decls: Vec::new(),
            loops: Vec::new(),
            env_depth: 0,
        }
    }

    fn is_strict(&self) -> bool {
        self.flags & BC_STRICT != 0
    }
}

/// Reference state of the most recently parsed member expression. `Value`
/// means the result is fully on the stack; the others defer the final
/// dereference so assignments and calls can reuse the base.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ExprRef {
    Value,
    Ident(Value),
    /// `[obj key]` on the stack.
    Member,
    /// `[obj]` on the stack, key in the literal pool.
    MemberLit(u16),
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Compile source text to a bytecode cell.
pub fn parse_source(
    ctx: &mut Context,
    source: &str,
    opts: &ParseOptions,
) -> Result<Idx, ParseError> {
    if !CONFIG.parser {
        return Err(ParseError::new(ParserErrId::ParserDisabled, 0, 0));
    }
    if opts.module && !CONFIG.modules {
        return Err(ParseError::new(ParserErrId::ModuleItemNotAtTop, 0, 0));
    }
    let toks = tokenize(source)?;
    let mark = ctx.roots_mark();
    let result = Parser::new(ctx, toks, opts).parse_program();
    ctx.roots_release(mark);
    result
}

fn tokenize(source: &str) -> Result<Vec<Lexeme>, ParseError> {
    let mut lexer = Lexer::new(source);
    let mut toks = Vec::new();
    loop {
        let lx = lexer.next()?;
        let eof = lx.token == Token::Eof;
        toks.push(lx);
        if eof {
            return Ok(toks);
        }
    }
}

// ---------------------------------------------------------------------------
// The parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    ctx: &'a mut Context,
    toks: Vec<Lexeme>,
    pos: usize,
    scopes: Vec<FuncScope>,
    module_requests: Vec<Value>,
    module_exports: Vec<(Value, Value)>,
    source_name: Value,
    user_value: Value,
    module: bool,
    nesting: u32,
}

type R<T> = Result<T, ParseError>;

impl<'a> Parser<'a> {
    fn new(ctx: &'a mut Context, toks: Vec<Lexeme>, opts: &ParseOptions) -> Parser<'a> {
        let source_name = match &opts.source_name {
            Some(n) => strings::intern_utf8(ctx, n),
            None => strings::magic_value(Magic::Anonymous),
        };
        let mut flags = if opts.module {
            BC_MODULE | BC_STRICT
        } else {
            BC_SCRIPT
        };
        if opts.strict {
            flags |= BC_STRICT;
        }
        let scope = FuncScope::new(flags, source_name);
        Parser {
            ctx,
            toks,
            pos: 0,
            scopes: vec![scope],
            module_requests: Vec::new(),
            module_exports: Vec::new(),
            source_name,
            user_value: opts.user_value,
            module: opts.module,
            nesting: 0,
        }
    }

    // -- token plumbing -----------------------------------------------------

    fn cur(&self) -> &Lexeme {
        &self.toks[self.pos.min(self.toks.len() - 1)]
    }

    fn tok(&self) -> &Token {
        &self.cur().token
    }

    fn peek_tok(&self, offset: usize) -> &Token {
        &self.peek_lexeme(offset).token
    }

    fn peek_lexeme(&self, offset: usize) -> &Lexeme {
        let i = (self.pos + offset).min(self.toks.len() - 1);
        &self.toks[i]
    }

    fn bump(&mut self) -> Lexeme {
        let lx = self.cur().clone();
        if self.pos < self.toks.len() - 1 {
            self.pos += 1;
        }
        lx
    }

    fn eat(&mut self, t: &Token) -> bool {
        if self.tok() == t {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, t: &Token, id: ParserErrId) -> R<()> {
        if self.tok() == t {
            self.bump();
            Ok(())
        } else {
            Err(self.err(id))
        }
    }

    fn err(&self, id: ParserErrId) -> ParseError {
        ParseError::new(id, self.cur().line, self.cur().column)
    }

    /// Semicolon or an insertion point (newline, `}`, end of input).
    fn expect_semicolon(&mut self) -> R<()> {
        if self.eat(&Token::Semicolon) {
            return Ok(());
        }
        if matches!(self.tok(), Token::RBrace | Token::Eof) || self.cur().newline_before {
            return Ok(());
        }
        Err(self.err(ParserErrId::SemicolonExpected))
    }

    // -- scope plumbing -----------------------------------------------------

    fn fs(&mut self) -> &mut FuncScope {
        self.scopes.last_mut().expect("scope stack never empty")
    }

    fn fs_ref(&self) -> &FuncScope {
        self.scopes.last().expect("scope stack never empty")
    }

    fn em(&mut self) -> &mut Emitter {
        &mut self.fs().emitter
    }

    fn mark_line(&mut self) {
        let line = self.cur().line;
        self.em().set_line(line);
    }

    fn intern(&mut self, s: &str) -> Value {
        strings::intern_utf8(self.ctx, s)
    }

    fn name_literal(&mut self, s: &str) -> R<u16> {
        let v = self.intern(s);
        self.value_literal(v)
    }

    fn value_literal(&mut self, v: Value) -> R<u16> {
        if self.fs_ref().emitter.literal_count() > u16::MAX as usize {
            return Err(self.err(ParserErrId::LiteralLimitReached));
        }
        Ok(self.em().literal(v))
    }

    /// Number literal value: small int word when it fits, boxed otherwise.
    fn number_value(&mut self, n: f64) -> Value {
        let as_int = n as i32;
        if as_int as f64 == n && Value::fits_i30(as_int) && !(n == 0.0 && n.is_sign_negative()) {
            Value::from_i30(as_int)
        } else {
            let idx = heap::alloc_number(self.ctx, n);
            let v = idx.value(HeapKind::Number);
            self.ctx.root(v);
            v
        }
    }

    // -- program ------------------------------------------------------------

    fn parse_program(mut self) -> R<Idx> {
        self.parse_directives();
        while !matches!(self.tok(), Token::Eof) {
            self.parse_statement(true)?;
        }
        self.em().op(Op::ReturnCompletion);
        let module_info = if self.module {
            Some(Box::new(ModuleInfo {
                requests: std::mem::take(&mut self.module_requests).into_boxed_slice(),
                exports: std::mem::take(&mut self.module_exports).into_boxed_slice(),
            }))
        } else {
            None
        };
        let scope = self.scopes.pop().expect("program scope");
        let bc = self.finish_scope(scope, module_info);
        let idx = heap::alloc(self.ctx, CellData::ByteCode(Rc::new(bc)));
        Ok(idx)
    }

    fn finish_scope(&mut self, scope: FuncScope, module: Option<Box<ModuleInfo>>) -> ByteCode {
        let name = scope.name;
        let flags = scope.flags;
        let arg_names = scope.arg_names.into_boxed_slice();
        let var_names = scope.var_names.into_boxed_slice();
        let func_decls = scope.func_decls.into_boxed_slice();
        let (code, literals, try_records, line_info, max_depth) = scope.emitter.into_parts();
        ByteCode {
            flags,
            arg_names,
            var_names,
            func_decls,
            stack_limit: max_depth + 4,
            literals: literals.into_boxed_slice(),
            code: code.into_boxed_slice(),
            try_records: try_records.into_boxed_slice(),
            line_info: if CONFIG.line_info {
                Some(line_info.into_boxed_slice())
            } else {
                None
            },
            module,
            name,
            source_name: self.source_name,
            user_value: self.user_value,
        }
    }

    fn parse_directives(&mut self) {
        loop {
            let is_directive = matches!(self.tok(), Token::Str(_))
                && matches!(
                    self.peek_tok(1),
                    Token::Semicolon | Token::RBrace | Token::Eof
                );
            if !is_directive {
                return;
            }
            let lx = self.bump();
            if let Token::Str(s) = lx.token {
                if s == "use strict" {
                    self.fs().flags |= BC_STRICT;
                }
            }
            self.eat(&Token::Semicolon);
        }
    }

    // -- statements ---------------------------------------------------------

    fn parse_statement(&mut self, top_level: bool) -> R<()> {
        self.mark_line();
        match self.tok().clone() {
            Token::LBrace => {
                self.bump();
                self.em().op(Op::EnvPush);
                self.fs().env_depth += 1;
                while !matches!(self.tok(), Token::RBrace | Token::Eof) {
                    self.parse_statement(false)?;
                }
                self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)?;
                self.em().op(Op::EnvPop);
                self.fs().env_depth -= 1;
                Ok(())
            }
            Token::Semicolon => {
                self.bump();
                Ok(())
            }
            Token::Var => {
                self.bump();
                self.parse_variable_declarations(DeclKind::Var)?;
                self.expect_semicolon()
            }
            Token::Let => {
                self.bump();
                self.parse_variable_declarations(DeclKind::Let)?;
                self.expect_semicolon()
            }
            Token::Const => {
                self.bump();
                self.parse_variable_declarations(DeclKind::Const)?;
                self.expect_semicolon()
            }
            Token::Function => {
                self.bump();
                self.parse_function_declaration(top_level, 0)
            }
            Token::Ident(name)
                if name == "async"
                    && matches!(self.peek_tok(1), Token::Function)
                    && !self.peek_lexeme(1).newline_before =>
            {
                self.bump();
                self.bump();
                self.parse_function_declaration(top_level, BC_ASYNC)
            }
            Token::If => self.parse_if(),
            Token::While => self.parse_while(),
            Token::Do => self.parse_do_while(),
            Token::For => self.parse_for(),
            Token::Break => {
                self.bump();
                self.expect_semicolon()?;
                self.emit_loop_exit(true)
            }
            Token::Continue => {
                self.bump();
                self.expect_semicolon()?;
                self.emit_loop_exit(false)
            }
            Token::Return => {
                self.bump();
                if self.scopes.len() == 1 {
                    return Err(self.err(ParserErrId::ReturnOutsideFunction));
                }
                if matches!(self.tok(), Token::Semicolon | Token::RBrace | Token::Eof)
                    || self.cur().newline_before
                {
                    self.expect_semicolon()?;
                    self.em().op(Op::ReturnUndefined);
                } else {
                    self.parse_expression()?;
                    self.expect_semicolon()?;
                    self.em().op(Op::Return);
                }
                Ok(())
            }
            Token::Throw => {
                self.bump();
                self.parse_expression()?;
                self.expect_semicolon()?;
                self.em().op(Op::Throw);
                Ok(())
            }
            Token::Try => self.parse_try(),
            Token::Import => {
                if !self.module || !top_level {
                    return Err(self.err(ParserErrId::ModuleItemNotAtTop));
                }
                self.parse_import()
            }
            Token::Export => {
                if !self.module || !top_level {
                    return Err(self.err(ParserErrId::ModuleItemNotAtTop));
                }
                self.parse_export()
            }
            Token::Class => Err(self.err(ParserErrId::ClassNotSupported)),
            Token::Switch => Err(self.err(ParserErrId::SwitchNotSupported)),
            Token::With => Err(self.err(ParserErrId::WithNotSupported)),
            _ => {
                // expression statement
                self.parse_expression()?;
                self.expect_semicolon()?;
                let completion = top_level && self.scopes.len() == 1;
                if completion {
                    self.em().op(Op::SetCompletion);
                } else {
                    self.em().op(Op::Pop);
                }
                Ok(())
            }
        }
    }

    fn emit_loop_exit(&mut self, is_break: bool) -> R<()> {
        let Some(loop_env_depth) = self.fs_ref().loops.last().map(|l| l.env_depth) else {
            return Err(self.err(if is_break {
                ParserErrId::IllegalBreak
            } else {
                ParserErrId::IllegalContinue
            }));
        };
        let cur_depth = self.fs_ref().env_depth;
        for _ in loop_env_depth..cur_depth {
            self.em().op(Op::EnvPop);
        }
        let site = self.em().jump_forward(Op::Jump16);
        let l = self.fs().loops.last_mut().expect("loop ctx");
        if is_break {
            l.breaks.push(site);
        } else {
            l.continues.push(site);
        }
        Ok(())
    }

    fn parse_if(&mut self) -> R<()> {
        self.bump();
        self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;
        self.parse_expression()?;
        self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
        let else_site = self.em().jump_forward(Op::JumpFalse16);
        self.parse_statement(false)?;
        if self.eat(&Token::Else) {
            let end_site = self.em().jump_forward(Op::Jump16);
            self.em().patch_jump(else_site);
            self.parse_statement(false)?;
            self.em().patch_jump(end_site);
        } else {
            self.em().patch_jump(else_site);
        }
        Ok(())
    }

    fn enter_loop(&mut self) {
        let env_depth = self.fs_ref().env_depth;
        self.fs().loops.push(LoopCtx {
            breaks: Vec::new(),
            continues: Vec::new(),
            env_depth,
        });
    }

    /// Patch break sites to here and continue sites to `continue_target`.
    fn leave_loop(&mut self, continue_target: u32) {
        let l = self.fs().loops.pop().expect("loop ctx");
        for site in l.breaks {
            self.em().patch_jump(site);
        }
        for site in l.continues {
            let from = site as i64 + 2;
            let delta = continue_target as i64 - from;
            let bytes = (delta as i16).to_le_bytes();
            self.fs().emitter.code[site] = bytes[0];
            self.fs().emitter.code[site + 1] = bytes[1];
        }
    }

    fn parse_while(&mut self) -> R<()> {
        self.bump();
        self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;
        let top = self.em().here();
        self.parse_expression()?;
        self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
        let exit_site = self.em().jump_forward(Op::JumpFalse16);
        self.enter_loop();
        self.parse_statement(false)?;
        self.em().jump_back(Op::Jump8, Op::Jump16, top);
        self.em().patch_jump(exit_site);
        self.leave_loop(top);
        Ok(())
    }

    fn parse_do_while(&mut self) -> R<()> {
        self.bump();
        let top = self.em().here();
        self.enter_loop();
        self.parse_statement(false)?;
        let cond_at = self.em().here();
        self.expect(&Token::While, ParserErrId::UnexpectedToken)?;
        self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;
        self.parse_expression()?;
        self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
        self.expect_semicolon()?;
        self.em().jump_back(Op::JumpTrue8, Op::JumpTrue16, top);
        self.leave_loop(cond_at);
        Ok(())
    }

    fn parse_for(&mut self) -> R<()> {
        self.bump();
        self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;

        let mut pushed_env = false;
        // init clause
        match self.tok().clone() {
            Token::Semicolon => {
                self.bump();
            }
            Token::Var => {
                self.bump();
                self.parse_variable_declarations(DeclKind::Var)?;
                self.check_no_for_in_of()?;
                self.expect(&Token::Semicolon, ParserErrId::SemicolonExpected)?;
            }
            Token::Let | Token::Const => {
                let kind = if matches!(self.tok(), Token::Let) {
                    DeclKind::Let
                } else {
                    DeclKind::Const
                };
                self.bump();
                self.em().op(Op::EnvPush);
                self.fs().env_depth += 1;
                pushed_env = true;
                self.parse_variable_declarations(kind)?;
                self.check_no_for_in_of()?;
                self.expect(&Token::Semicolon, ParserErrId::SemicolonExpected)?;
            }
            _ => {
                self.parse_expression()?;
                self.check_no_for_in_of()?;
                self.em().op(Op::Pop);
                self.expect(&Token::Semicolon, ParserErrId::SemicolonExpected)?;
            }
        }

        // condition
        let top = self.em().here();
        let exit_site = if matches!(self.tok(), Token::Semicolon) {
            None
        } else {
            self.parse_expression()?;
            Some(self.em().jump_forward(Op::JumpFalse16))
        };
        self.expect(&Token::Semicolon, ParserErrId::SemicolonExpected)?;

        // update clause: remember the token range, emit after the body
        let update_start = if matches!(self.tok(), Token::RParen) {
            None
        } else {
            let start = self.pos;
            self.skip_to_matching_rparen()?;
            Some(start)
        };
        self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;

        self.enter_loop();
        self.parse_statement(false)?;

        let update_at = self.em().here();
        if let Some(start) = update_start {
            let resume = self.pos;
            self.pos = start;
            self.parse_expression()?;
            self.em().op(Op::Pop);
            self.pos = resume;
        }
        self.em().jump_back(Op::Jump8, Op::Jump16, top);
        if let Some(site) = exit_site {
            self.em().patch_jump(site);
        }
        self.leave_loop(update_at);

        if pushed_env {
            self.em().op(Op::EnvPop);
            self.fs().env_depth -= 1;
        }
        Ok(())
    }

    fn check_no_for_in_of(&self) -> R<()> {
        if matches!(self.tok(), Token::In)
            || matches!(self.tok(), Token::Ident(n) if n == "of")
        {
            return Err(self.err(ParserErrId::ForInOfNotSupported));
        }
        Ok(())
    }

    /// Skip tokens up to (not past) the `)` matching the already-consumed
    /// `(` of the for-head.
    fn skip_to_matching_rparen(&mut self) -> R<()> {
        let mut depth = 0usize;
        loop {
            match self.tok() {
                Token::Eof => return Err(self.err(ParserErrId::UnexpectedEos)),
                Token::LParen | Token::LBracket | Token::LBrace => {
                    depth += 1;
                    self.bump();
                }
                Token::RParen if depth == 0 => return Ok(()),
                Token::RParen | Token::RBracket | Token::RBrace => {
                    depth -= 1;
                    self.bump();
                }
                _ => {
                    self.bump();
                }
            }
        }
    }

    fn parse_try(&mut self) -> R<()> {
        self.bump();
        let base_depth = self.em().depth();
        let base_env_depth = self.fs_ref().env_depth;

        let try_start = self.em().here();
        if !matches!(self.tok(), Token::LBrace) {
            return Err(self.err(ParserErrId::LeftBraceExpected));
        }
        self.parse_statement(false)?; // the block
        let try_end = self.em().here();

        let mut catch_ip = IP_NONE;
        let has_catch = matches!(self.tok(), Token::Catch);
        let mut skip_catch_site = None;
        if has_catch {
            skip_catch_site = Some(self.em().jump_forward(Op::Jump16));
            self.bump();
            catch_ip = self.em().here();
            // The unwinder leaves the thrown value on the stack.
            self.em().adjust(1);
            if self.eat(&Token::LParen) {
                let name = self.expect_identifier()?;
                let lit = self.name_literal(&name)?;
                self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
                self.em().op_lit(Op::EnvPushCatch8, Op::EnvPushCatch16, lit);
            } else {
                self.em().op(Op::Pop);
                self.em().op(Op::EnvPush);
            }
            self.fs().env_depth += 1;
            if !matches!(self.tok(), Token::LBrace) {
                return Err(self.err(ParserErrId::LeftBraceExpected));
            }
            self.bump();
            while !matches!(self.tok(), Token::RBrace | Token::Eof) {
                self.parse_statement(false)?;
            }
            self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)?;
            self.em().op(Op::EnvPop);
            self.fs().env_depth -= 1;
        }
        if let Some(site) = skip_catch_site {
            self.em().patch_jump(site);
        }
        let protected_end = self.em().here();

        let has_finally = matches!(self.tok(), Token::Finally);
        if !has_catch && !has_finally {
            return Err(self.err(ParserErrId::CatchOrFinallyExpected));
        }

        if has_catch {
            self.fs().emitter.try_records.push(TryRecord {
                start: try_start,
                end: try_end,
                catch_ip,
                finally_ip: IP_NONE,
                depth: base_depth,
                env_depth: base_env_depth,
            });
        }

        if has_finally {
            self.bump();
            self.em().op(Op::PendingNormal);
            let finally_ip = self.em().here();
            if !matches!(self.tok(), Token::LBrace) {
                return Err(self.err(ParserErrId::LeftBraceExpected));
            }
            self.parse_statement(false)?;
            self.em().op(Op::FinallyEnd);
            self.fs().emitter.try_records.push(TryRecord {
                start: try_start,
                end: protected_end,
                catch_ip: IP_NONE,
                finally_ip,
                depth: base_depth,
                env_depth: base_env_depth,
            });
        }
        Ok(())
    }

    // -- declarations -------------------------------------------------------

    fn expect_identifier(&mut self) -> R<String> {
        match self.tok().clone() {
            Token::Ident(name) => {
                self.bump();
                Ok(name)
            }
            _ => Err(self.err(ParserErrId::IdentifierExpected)),
        }
    }

    fn parse_variable_declarations(&mut self, kind: DeclKind) -> R<()> {
        loop {
            match self.tok() {
                Token::LBrace | Token::LBracket => {
                    return Err(self.err(ParserErrId::DestructuringNotSupported))
                }
                _ => {}
            }
            let name = self.expect_identifier()?;
            if self.fs_ref().is_strict() && (name == "eval" || name == "arguments") {
                return Err(self.err(ParserErrId::StrictEvalArguments));
            }
            let name_value = self.intern(&name);
            let lit = self.value_literal(name_value)?;
            match kind {
                DeclKind::Var => {
                    if !self.fs_ref().var_names.contains(&name_value) {
                        self.fs().var_names.push(name_value);
                    }
                    if self.eat(&Token::Assign) {
                        self.parse_assignment()?;
                        self.em().op_lit(Op::StoreIdent8, Op::StoreIdent16, lit);
                    }
                }
                DeclKind::Let => {
                    self.em().op_lit(Op::DeclLet8, Op::DeclLet16, lit);
                    if self.eat(&Token::Assign) {
                        self.parse_assignment()?;
                    } else {
                        self.em().op(Op::PushUndefined);
                    }
                    self.em().op_lit(Op::InitBinding8, Op::InitBinding16, lit);
                }
                DeclKind::Const => {
                    self.em().op_lit(Op::DeclConst8, Op::DeclConst16, lit);
                    if !self.eat(&Token::Assign) {
                        return Err(self.err(ParserErrId::UnexpectedToken));
                    }
                    self.parse_assignment()?;
                    self.em().op_lit(Op::InitBinding8, Op::InitBinding16, lit);
                }
            }
            if !self.eat(&Token::Comma) {
                return Ok(());
            }
        }
    }

    fn parse_function_declaration(&mut self, top_level: bool, extra_flags: u16) -> R<()> {
        let generator = self.eat(&Token::Star);
        let name = self.expect_identifier()?;
        let name_value = self.intern(&name);
        let flags = extra_flags | if generator { BC_GENERATOR } else { 0 };
        let lit = self.compile_function(flags, name_value, None)?;
        if top_level {
            self.fs().func_decls.push((name_value, lit));
        } else {
            // Block-level declaration behaves like let + immediate init.
            let name_lit = self.value_literal(name_value)?;
            self.em().op_lit(Op::DeclLet8, Op::DeclLet16, name_lit);
            self.em().op_lit(Op::PushFunc8, Op::PushFunc16, lit);
            self.em().op_lit(Op::InitBinding8, Op::InitBinding16, name_lit);
        }
        Ok(())
    }

    // -- modules ------------------------------------------------------------

    fn request_index(&mut self, spec: &str) -> R<u8> {
        let v = self.intern(spec);
        if let Some(i) = self.module_requests.iter().position(|r| *r == v) {
            return Ok(i as u8);
        }
        if self.module_requests.len() >= u8::MAX as usize {
            return Err(self.err(ParserErrId::LiteralLimitReached));
        }
        self.module_requests.push(v);
        Ok((self.module_requests.len() - 1) as u8)
    }

    fn module_source(&mut self) -> R<String> {
        match self.tok().clone() {
            Token::Str(s) => {
                self.bump();
                Ok(s)
            }
            _ => Err(self.err(ParserErrId::ModuleSourceExpected)),
        }
    }

    fn emit_import_binding(&mut self, request: u8, export: &str, local: &str) -> R<()> {
        let export_lit = self.name_literal(export)?;
        let local_lit = self.name_literal(local)?;
        self.em().ext(ExtOp::ImportBinding);
        self.em().u8(request);
        self.em().u16(export_lit);
        self.em().u16(local_lit);
        Ok(())
    }

    fn parse_import(&mut self) -> R<()> {
        self.bump();
        // import 'spec';
        if let Token::Str(spec) = self.tok().clone() {
            self.bump();
            self.request_index(&spec)?;
            return self.expect_semicolon();
        }

        let mut default_local: Option<String> = None;
        let mut namespace_local: Option<String> = None;
        let mut named: Vec<(String, String)> = Vec::new();

        if let Token::Ident(name) = self.tok().clone() {
            self.bump();
            default_local = Some(name);
            if self.eat(&Token::Comma) {
                self.parse_import_tail(&mut namespace_local, &mut named)?;
            }
        } else {
            self.parse_import_tail(&mut namespace_local, &mut named)?;
        }

        match self.tok().clone() {
            Token::Ident(n) if n == "from" => {
                self.bump();
            }
            _ => return Err(self.err(ParserErrId::ModuleSourceExpected)),
        }
        let spec = self.module_source()?;
        let request = self.request_index(&spec)?;
        self.expect_semicolon()?;

        if let Some(local) = default_local {
            self.emit_import_binding(request, "default", &local)?;
        }
        if let Some(local) = namespace_local {
            let local_lit = self.name_literal(&local)?;
            self.em().ext(ExtOp::ImportNamespace);
            self.em().u8(request);
            self.em().u16(local_lit);
        }
        for (export, local) in named {
            self.emit_import_binding(request, &export, &local)?;
        }
        Ok(())
    }

    fn parse_import_tail(
        &mut self,
        namespace_local: &mut Option<String>,
        named: &mut Vec<(String, String)>,
    ) -> R<()> {
        if self.eat(&Token::Star) {
            match self.tok().clone() {
                Token::Ident(n) if n == "as" => {
                    self.bump();
                }
                _ => return Err(self.err(ParserErrId::IdentifierExpected)),
            }
            *namespace_local = Some(self.expect_identifier()?);
            return Ok(());
        }
        self.expect(&Token::LBrace, ParserErrId::LeftBraceExpected)?;
        while !matches!(self.tok(), Token::RBrace) {
            let export = match self.tok().clone() {
                Token::Ident(n) => {
                    self.bump();
                    n
                }
                Token::Default => {
                    self.bump();
                    "default".to_string()
                }
                _ => return Err(self.err(ParserErrId::IdentifierExpected)),
            };
            let local = match self.tok().clone() {
                Token::Ident(n) if n == "as" => {
                    self.bump();
                    self.expect_identifier()?
                }
                _ => export.clone(),
            };
            named.push((export, local));
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)
    }

    fn parse_export(&mut self) -> R<()> {
        self.bump();
        match self.tok().clone() {
            Token::Default => {
                self.bump();
                let local = self.intern("*default*");
                let exported = strings::magic_value(Magic::Default);
                let lit = self.value_literal(local)?;
                self.em().op_lit(Op::DeclConst8, Op::DeclConst16, lit);
                if matches!(self.tok(), Token::Function) {
                    self.bump();
                    let generator = self.eat(&Token::Star);
                    let name_value = match self.tok().clone() {
                        Token::Ident(n) => {
                            self.bump();
                            self.intern(&n)
                        }
                        _ => strings::magic_value(Magic::Default),
                    };
                    let flags = if generator { BC_GENERATOR } else { 0 };
                    let func_lit = self.compile_function(flags, name_value, None)?;
                    self.em().op_lit(Op::PushFunc8, Op::PushFunc16, func_lit);
                } else {
                    self.parse_assignment()?;
                    self.expect_semicolon()?;
                }
                self.em().op_lit(Op::InitBinding8, Op::InitBinding16, lit);
                self.module_exports.push((local, exported));
                Ok(())
            }
            Token::Var => {
                self.bump();
                self.export_declared_names(DeclKind::Var)
            }
            Token::Let => {
                self.bump();
                self.export_declared_names(DeclKind::Let)
            }
            Token::Const => {
                self.bump();
                self.export_declared_names(DeclKind::Const)
            }
            Token::Function => {
                self.bump();
                let generator = self.eat(&Token::Star);
                let name = self.expect_identifier()?;
                let name_value = self.intern(&name);
                let flags = if generator { BC_GENERATOR } else { 0 };
                let lit = self.compile_function(flags, name_value, None)?;
                self.fs().func_decls.push((name_value, lit));
                self.module_exports.push((name_value, name_value));
                Ok(())
            }
            Token::LBrace => {
                self.bump();
                while !matches!(self.tok(), Token::RBrace) {
                    let local = self.expect_identifier()?;
                    let exported = match self.tok().clone() {
                        Token::Ident(n) if n == "as" => {
                            self.bump();
                            match self.tok().clone() {
                                Token::Ident(n2) => {
                                    self.bump();
                                    n2
                                }
                                Token::Default => {
                                    self.bump();
                                    "default".to_string()
                                }
                                _ => return Err(self.err(ParserErrId::IdentifierExpected)),
                            }
                        }
                        _ => local.clone(),
                    };
                    let local_v = self.intern(&local);
                    let exported_v = self.intern(&exported);
                    self.module_exports.push((local_v, exported_v));
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)?;
                self.expect_semicolon()
            }
            _ => Err(self.err(ParserErrId::UnexpectedToken)),
        }
    }

    /// `export <decl>`: compile the declaration, then record every declared
    /// name as an export of itself.
    fn export_declared_names(&mut self, kind: DeclKind) -> R<()> {
        // Names declared by this statement are found by diffing the literal
        // emission; simplest is to re-scan the declaration tokens first.
        let mut names: Vec<Value> = Vec::new();
        let mut look = self.pos;
        loop {
            let Token::Ident(n) = &self.toks[look].token else {
                break;
            };
            let v = strings::intern_utf8(self.ctx, n);
            names.push(v);
            // skip to the comma at this nesting level or statement end
            let mut depth = 0usize;
            look += 1;
            loop {
                match &self.toks[look].token {
                    Token::LParen | Token::LBracket | Token::LBrace => {
                        depth += 1;
                        look += 1;
                    }
                    Token::RParen | Token::RBracket | Token::RBrace if depth > 0 => {
                        depth -= 1;
                        look += 1;
                    }
                    Token::Comma if depth == 0 => {
                        look += 1;
                        break;
                    }
                    Token::Semicolon | Token::Eof | Token::RBrace if depth == 0 => break,
                    Token::Eof => break,
                    _ => {
                        look += 1;
                    }
                }
            }
            if !matches!(&self.toks[look.saturating_sub(1)].token, Token::Comma) {
                break;
            }
        }
        self.parse_variable_declarations(kind)?;
        self.expect_semicolon()?;
        for v in names {
            self.module_exports.push((v, v));
        }
        Ok(())
    }

    // -- functions ----------------------------------------------------------

    /// Compile a function body into a bytecode cell; returns the literal
    /// index of the template in the enclosing emitter.
    fn compile_function(
        &mut self,
        extra_flags: u16,
        name: Value,
        pre_parsed_params: Option<Vec<String>>,
    ) -> R<u16> {
        let inherited_strict = if self.fs_ref().is_strict() { BC_STRICT } else { 0 };
        let mut scope = FuncScope::new(extra_flags | inherited_strict, name);

        let params = match pre_parsed_params {
            Some(p) => p,
            None => {
                self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;
                let mut params = Vec::new();
                while !matches!(self.tok(), Token::RParen) {
                    match self.tok() {
                        Token::LBrace | Token::LBracket => {
                            return Err(self.err(ParserErrId::DestructuringNotSupported))
                        }
                        Token::Dot => return Err(self.err(ParserErrId::SpreadNotSupported)),
                        _ => {}
                    }
                    params.push(self.expect_identifier()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
                params
            }
        };
        for p in &params {
            let v = strings::intern_utf8(self.ctx, p);
            if scope.arg_names.contains(&v) {
                return Err(self.err(ParserErrId::DuplicateParameter));
            }
            scope.arg_names.push(v);
        }

        self.scopes.push(scope);
        let arrow = extra_flags & BC_ARROW != 0;
        if arrow && !matches!(self.tok(), Token::LBrace) {
            // Concise body: a single expression, implicitly returned.
            self.parse_assignment()?;
            self.em().op(Op::Return);
        } else {
            self.expect(&Token::LBrace, ParserErrId::LeftBraceExpected)?;
            self.parse_directives();
            while !matches!(self.tok(), Token::RBrace | Token::Eof) {
                self.parse_statement(true)?;
            }
            self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)?;
            self.em().op(Op::ReturnUndefined);
        }
        let finished = self.scopes.pop().expect("function scope");
        let bc = self.finish_scope(finished, None);
        let idx = heap::alloc(self.ctx, CellData::ByteCode(Rc::new(bc)));
        let v = idx.value(HeapKind::ByteCode);
        self.ctx.root(v);
        self.value_literal(v)
    }

    // -- expressions --------------------------------------------------------

    fn parse_expression(&mut self) -> R<()> {
        self.parse_assignment()?;
        while self.eat(&Token::Comma) {
            self.em().op(Op::Pop);
            self.parse_assignment()?;
        }
        Ok(())
    }

    fn parse_assignment(&mut self) -> R<()> {
        self.nesting += 1;
        if self.nesting > MAX_NESTING {
            self.nesting -= 1;
            return Err(self.err(ParserErrId::NestingLimitReached));
        }
        let result = self.parse_assignment_inner();
        self.nesting -= 1;
        result
    }

    fn parse_assignment_inner(&mut self) -> R<()> {
        // Arrow function forms need lookahead before expression parsing.
        if let Some(()) = self.try_parse_arrow()? {
            return Ok(());
        }

        // yield is assignment-level inside generators.
        if matches!(self.tok(), Token::Yield) {
            if self.fs_ref().flags & BC_GENERATOR == 0 {
                return Err(self.err(ParserErrId::YieldOutsideGenerator));
            }
            self.bump();
            if matches!(self.tok(), Token::Semicolon | Token::RParen | Token::RBrace | Token::RBracket | Token::Comma | Token::Eof)
                || self.cur().newline_before
            {
                self.em().op(Op::PushUndefined);
            } else {
                self.parse_assignment()?;
            }
            self.em().op(Op::Yield);
            return Ok(());
        }

        let r = self.parse_conditional()?;

        let op = match self.tok() {
            Token::Assign => AssignKind::Plain,
            Token::PlusAssign => AssignKind::Binary(Op::Add),
            Token::MinusAssign => AssignKind::Binary(Op::Sub),
            Token::StarAssign => AssignKind::Binary(Op::Mul),
            Token::SlashAssign => AssignKind::Binary(Op::Div),
            Token::PercentAssign => AssignKind::Binary(Op::Mod),
            Token::StarStarAssign => AssignKind::Binary(Op::Exp),
            Token::AmpAssign => AssignKind::Binary(Op::BitAnd),
            Token::PipeAssign => AssignKind::Binary(Op::BitOr),
            Token::CaretAssign => AssignKind::Binary(Op::BitXor),
            Token::ShlAssign => AssignKind::Binary(Op::Shl),
            Token::ShrAssign => AssignKind::Binary(Op::Shr),
            Token::UshrAssign => AssignKind::Binary(Op::Ushr),
            Token::AndAssign => AssignKind::LogicalAnd,
            Token::OrAssign => AssignKind::LogicalOr,
            Token::QuestionQuestionAssign => AssignKind::LogicalNullish,
            _ => {
                self.deref(r);
                return Ok(());
            }
        };
        self.bump();

        match op {
            AssignKind::Plain => match r {
                ExprRef::Ident(name) => {
                    self.check_strict_assign_target(name)?;
                    let lit = self.value_literal(name)?;
                    self.parse_assignment()?;
                    self.em().op(Op::Dup);
                    self.em().op_lit(Op::StoreIdent8, Op::StoreIdent16, lit);
                }
                ExprRef::MemberLit(lit) => {
                    self.parse_assignment()?;
                    self.em().op_lit(Op::SetPropLit8, Op::SetPropLit16, lit);
                }
                ExprRef::Member => {
                    self.parse_assignment()?;
                    self.em().op(Op::SetProp);
                }
                ExprRef::Value => return Err(self.err(ParserErrId::InvalidAssignmentTarget)),
            },
            AssignKind::Binary(binop) => match r {
                ExprRef::Ident(name) => {
                    self.check_strict_assign_target(name)?;
                    let lit = self.value_literal(name)?;
                    self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, lit);
                    self.parse_assignment()?;
                    self.em().op(binop);
                    self.em().op(Op::Dup);
                    self.em().op_lit(Op::StoreIdent8, Op::StoreIdent16, lit);
                }
                ExprRef::MemberLit(lit) => {
                    self.em().op(Op::Dup);
                    self.em().op_lit(Op::GetPropLit8, Op::GetPropLit16, lit);
                    self.parse_assignment()?;
                    self.em().op(binop);
                    self.em().op_lit(Op::SetPropLit8, Op::SetPropLit16, lit);
                }
                ExprRef::Member => {
                    self.em().op(Op::Dup2);
                    self.em().op(Op::GetProp);
                    self.parse_assignment()?;
                    self.em().op(binop);
                    self.em().op(Op::SetProp);
                }
                ExprRef::Value => return Err(self.err(ParserErrId::InvalidAssignmentTarget)),
            },
            AssignKind::LogicalAnd | AssignKind::LogicalOr | AssignKind::LogicalNullish => {
                let ExprRef::Ident(name) = r else {
                    return Err(self.err(ParserErrId::InvalidAssignmentTarget));
                };
                self.check_strict_assign_target(name)?;
                let lit = self.value_literal(name)?;
                self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, lit);
                let base = self.em().depth() - 1;
                let end_site = match op {
                    AssignKind::LogicalAnd => {
                        self.em().op(Op::Dup);
                        let s = self.em().jump_forward(Op::JumpFalse16);
                        s
                    }
                    AssignKind::LogicalOr => {
                        self.em().op(Op::Dup);
                        let s = self.em().jump_forward(Op::JumpTrue16);
                        s
                    }
                    _ => {
                        self.em().op(Op::Dup);
                        self.em().op(Op::IsNullish);
                        let s = self.em().jump_forward(Op::JumpFalse16);
                        self.em().op(Op::Pop);
                        s
                    }
                };
                if matches!(op, AssignKind::LogicalNullish) {
                    // site above jumps when NOT nullish keeping old value;
                    // fallthrough popped the old value already
                } else {
                    self.em().op(Op::Pop);
                }
                self.parse_assignment()?;
                self.em().op(Op::Dup);
                self.em().op_lit(Op::StoreIdent8, Op::StoreIdent16, lit);
                self.em().patch_jump(end_site);
                self.em().set_depth(base + 1);
            }
        }
        Ok(())
    }

    fn check_strict_assign_target(&self, name: Value) -> R<()> {
        if self.fs_ref().is_strict() {
            let bytes = strings::bytes_of(self.ctx, name);
            if bytes.as_ref() == b"eval" || bytes.as_ref() == b"arguments" {
                return Err(self.err(ParserErrId::StrictEvalArguments));
            }
        }
        Ok(())
    }

    // Arrow detection: `ident =>`, `(params) =>`, `async ident =>`,
    // `async (params) =>`.
    fn try_parse_arrow(&mut self) -> R<Option<()>> {
        let (is_async, offset) = match self.tok() {
            Token::Ident(n) if n == "async" && !self.peek_lexeme(1).newline_before => {
                match self.peek_tok(1) {
                    Token::Ident(_) | Token::LParen => (true, 1),
                    _ => (false, 0),
                }
            }
            _ => (false, 0),
        };

        // single identifier form
        if let Token::Ident(name) = self.peek_tok(offset).clone() {
            if matches!(self.peek_tok(offset + 1), Token::Arrow) {
                for _ in 0..offset {
                    self.bump();
                }
                self.bump(); // the parameter
                self.bump(); // =>
                return self.emit_arrow(is_async, vec![name]).map(Some);
            }
        }

        // parenthesized parameter list form
        if matches!(self.peek_tok(offset), Token::LParen) {
            if let Some(params) = self.scan_arrow_params(offset) {
                for _ in 0..offset {
                    self.bump();
                }
                self.bump(); // (
                // re-consume the parameter tokens
                let mut names = Vec::new();
                while !matches!(self.tok(), Token::RParen) {
                    names.push(self.expect_identifier()?);
                    if !self.eat(&Token::Comma) {
                        break;
                    }
                }
                debug_assert_eq!(names, params);
                self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
                self.expect(&Token::Arrow, ParserErrId::UnexpectedToken)?;
                return self.emit_arrow(is_async, names).map(Some);
            }
        }
        Ok(None)
    }

    /// Non-consuming scan for `( ident (, ident)* ) =>`.
    fn scan_arrow_params(&self, offset: usize) -> Option<Vec<String>> {
        let mut i = self.pos + offset + 1; // after '('
        let mut names = Vec::new();
        loop {
            match &self.toks[i.min(self.toks.len() - 1)].token {
                Token::RParen => {
                    i += 1;
                    break;
                }
                Token::Ident(n) => {
                    names.push(n.clone());
                    i += 1;
                    match &self.toks[i.min(self.toks.len() - 1)].token {
                        Token::Comma => i += 1,
                        Token::RParen => {
                            i += 1;
                            break;
                        }
                        _ => return None,
                    }
                }
                _ => return None,
            }
        }
        if matches!(&self.toks[i.min(self.toks.len() - 1)].token, Token::Arrow) {
            Some(names)
        } else {
            None
        }
    }

    fn emit_arrow(&mut self, is_async: bool, params: Vec<String>) -> R<()> {
        let flags = BC_ARROW | if is_async { BC_ASYNC } else { 0 };
        let name = strings::magic_value(Magic::Anonymous);
        let lit = self.compile_function(flags, name, Some(params))?;
        self.em().op_lit(Op::PushFunc8, Op::PushFunc16, lit);
        Ok(())
    }

    fn parse_conditional(&mut self) -> R<ExprRef> {
        let r = self.parse_nullish()?;
        if !matches!(self.tok(), Token::Question) {
            return Ok(r);
        }
        self.deref(r);
        self.bump();
        let base = self.em().depth() - 1;
        let else_site = self.em().jump_forward(Op::JumpFalse16);
        self.parse_assignment()?;
        let end_site = self.em().jump_forward(Op::Jump16);
        self.em().patch_jump(else_site);
        self.em().set_depth(base);
        self.expect(&Token::Colon, ParserErrId::ColonExpected)?;
        self.parse_assignment()?;
        self.em().patch_jump(end_site);
        self.em().set_depth(base + 1);
        Ok(ExprRef::Value)
    }

    fn parse_nullish(&mut self) -> R<ExprRef> {
        let mut r = self.parse_logical_or()?;
        while matches!(self.tok(), Token::QuestionQuestion) {
            self.deref(r);
            r = ExprRef::Value;
            self.bump();
            let base = self.em().depth() - 1;
            self.em().op(Op::Dup);
            self.em().op(Op::IsNullish);
            let end_site = self.em().jump_forward(Op::JumpFalse16);
            self.em().op(Op::Pop);
            let rhs = self.parse_logical_or()?;
            self.deref(rhs);
            self.em().patch_jump(end_site);
            self.em().set_depth(base + 1);
        }
        Ok(r)
    }

    fn parse_logical_or(&mut self) -> R<ExprRef> {
        let mut r = self.parse_logical_and()?;
        while matches!(self.tok(), Token::OrOr) {
            self.deref(r);
            r = ExprRef::Value;
            self.bump();
            let base = self.em().depth() - 1;
            self.em().op(Op::Dup);
            let end_site = self.em().jump_forward(Op::JumpTrue16);
            self.em().op(Op::Pop);
            let rhs = self.parse_logical_and()?;
            self.deref(rhs);
            self.em().patch_jump(end_site);
            self.em().set_depth(base + 1);
        }
        Ok(r)
    }

    fn parse_logical_and(&mut self) -> R<ExprRef> {
        let mut r = self.parse_bitwise_or()?;
        while matches!(self.tok(), Token::AndAnd) {
            self.deref(r);
            r = ExprRef::Value;
            self.bump();
            let base = self.em().depth() - 1;
            self.em().op(Op::Dup);
            let end_site = self.em().jump_forward(Op::JumpFalse16);
            self.em().op(Op::Pop);
            let rhs = self.parse_bitwise_or()?;
            self.deref(rhs);
            self.em().patch_jump(end_site);
            self.em().set_depth(base + 1);
        }
        Ok(r)
    }

    fn binary_level(
        &mut self,
        next: fn(&mut Self) -> R<ExprRef>,
        table: &[(Token, Op)],
    ) -> R<ExprRef> {
        let mut r = next(self)?;
        loop {
            let Some(op) = table
                .iter()
                .find(|(t, _)| t == self.tok())
                .map(|(_, op)| *op)
            else {
                return Ok(r);
            };
            self.deref(r);
            r = ExprRef::Value;
            self.bump();
            let rhs = next(self)?;
            self.deref(rhs);
            self.em().op(op);
        }
    }

    fn parse_bitwise_or(&mut self) -> R<ExprRef> {
        self.binary_level(Self::parse_bitwise_xor, &[(Token::Pipe, Op::BitOr)])
    }

    fn parse_bitwise_xor(&mut self) -> R<ExprRef> {
        self.binary_level(Self::parse_bitwise_and, &[(Token::Caret, Op::BitXor)])
    }

    fn parse_bitwise_and(&mut self) -> R<ExprRef> {
        self.binary_level(Self::parse_equality, &[(Token::Amp, Op::BitAnd)])
    }

    fn parse_equality(&mut self) -> R<ExprRef> {
        self.binary_level(
            Self::parse_relational,
            &[
                (Token::Eq, Op::Eq),
                (Token::NotEq, Op::Ne),
                (Token::StrictEq, Op::StrictEq),
                (Token::StrictNotEq, Op::StrictNe),
            ],
        )
    }

    fn parse_relational(&mut self) -> R<ExprRef> {
        self.binary_level(
            Self::parse_shift,
            &[
                (Token::Less, Op::Lt),
                (Token::LessEq, Op::Le),
                (Token::Greater, Op::Gt),
                (Token::GreaterEq, Op::Ge),
                (Token::Instanceof, Op::InstanceOf),
                (Token::In, Op::In),
            ],
        )
    }

    fn parse_shift(&mut self) -> R<ExprRef> {
        self.binary_level(
            Self::parse_additive,
            &[
                (Token::Shl, Op::Shl),
                (Token::Shr, Op::Shr),
                (Token::Ushr, Op::Ushr),
            ],
        )
    }

    fn parse_additive(&mut self) -> R<ExprRef> {
        self.binary_level(
            Self::parse_multiplicative,
            &[(Token::Plus, Op::Add), (Token::Minus, Op::Sub)],
        )
    }

    fn parse_multiplicative(&mut self) -> R<ExprRef> {
        self.binary_level(
            Self::parse_exponent,
            &[
                (Token::Star, Op::Mul),
                (Token::Slash, Op::Div),
                (Token::Percent, Op::Mod),
            ],
        )
    }

    fn parse_exponent(&mut self) -> R<ExprRef> {
        let r = self.parse_unary()?;
        if matches!(self.tok(), Token::StarStar) {
            self.deref(r);
            self.bump();
            // right associative
            let rhs = self.parse_exponent()?;
            self.deref(rhs);
            self.em().op(Op::Exp);
            return Ok(ExprRef::Value);
        }
        Ok(r)
    }

    fn parse_unary(&mut self) -> R<ExprRef> {
        match self.tok().clone() {
            Token::Bang => {
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::Not);
                Ok(ExprRef::Value)
            }
            Token::Tilde => {
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::BitNot);
                Ok(ExprRef::Value)
            }
            Token::Plus => {
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::ToNumber);
                Ok(ExprRef::Value)
            }
            Token::Minus => {
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::Neg);
                Ok(ExprRef::Value)
            }
            Token::Typeof => {
                self.bump();
                let r = self.parse_unary()?;
                match r {
                    ExprRef::Ident(name) => {
                        let lit = self.value_literal(name)?;
                        self.em().op_lit(Op::TypeofIdent8, Op::TypeofIdent16, lit);
                    }
                    other => {
                        self.deref(other);
                        self.em().op(Op::TypeofVal);
                    }
                }
                Ok(ExprRef::Value)
            }
            Token::Void => {
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::Pop);
                self.em().op(Op::PushUndefined);
                Ok(ExprRef::Value)
            }
            Token::Delete => {
                self.bump();
                let r = self.parse_unary()?;
                match r {
                    ExprRef::Ident(name) => {
                        if self.fs_ref().is_strict() {
                            return Err(self.err(ParserErrId::StrictDelete));
                        }
                        let lit = self.value_literal(name)?;
                        self.em().op_lit(Op::DeleteIdent8, Op::DeleteIdent16, lit);
                    }
                    ExprRef::MemberLit(lit) => {
                        self.em().op_lit(Op::PushLit8, Op::PushLit16, lit);
                        self.em().op(Op::DeleteProp);
                    }
                    ExprRef::Member => {
                        self.em().op(Op::DeleteProp);
                    }
                    ExprRef::Value => {
                        self.em().op(Op::Pop);
                        self.em().op(Op::PushTrue);
                    }
                }
                Ok(ExprRef::Value)
            }
            Token::Await => {
                if self.fs_ref().flags & BC_ASYNC == 0 {
                    return Err(self.err(ParserErrId::AwaitOutsideAsync));
                }
                self.bump();
                let r = self.parse_unary()?;
                self.deref(r);
                self.em().op(Op::Await);
                Ok(ExprRef::Value)
            }
            Token::PlusPlus | Token::MinusMinus => {
                let dec = matches!(self.tok(), Token::MinusMinus);
                self.bump();
                let r = self.parse_unary()?;
                self.emit_increment(r, dec, true)?;
                Ok(ExprRef::Value)
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> R<ExprRef> {
        let r = self.parse_member_chain(true)?;
        if matches!(self.tok(), Token::PlusPlus | Token::MinusMinus) && !self.cur().newline_before
        {
            let dec = matches!(self.tok(), Token::MinusMinus);
            self.bump();
            self.emit_increment(r, dec, false)?;
            return Ok(ExprRef::Value);
        }
        Ok(r)
    }

    /// `++`/`--`: compute the new numeric value, store it, and leave either
    /// the new (prefix) or reconstructed old (postfix) value.
    fn emit_increment(&mut self, r: ExprRef, dec: bool, prefix: bool) -> R<()> {
        let step = if dec { Op::Sub } else { Op::Add };
        let unstep = if dec { Op::Add } else { Op::Sub };
        match r {
            ExprRef::Ident(name) => {
                let lit = self.value_literal(name)?;
                self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, lit);
                self.em().op(Op::ToNumber);
                self.em().op(Op::PushInt8);
                self.em().i8(1);
                self.em().adjust(1);
                self.em().op(step);
                self.em().op(Op::Dup);
                self.em().op_lit(Op::StoreIdent8, Op::StoreIdent16, lit);
            }
            ExprRef::MemberLit(lit) => {
                self.em().op(Op::Dup);
                self.em().op_lit(Op::GetPropLit8, Op::GetPropLit16, lit);
                self.em().op(Op::ToNumber);
                self.em().op(Op::PushInt8);
                self.em().i8(1);
                self.em().adjust(1);
                self.em().op(step);
                self.em().op_lit(Op::SetPropLit8, Op::SetPropLit16, lit);
            }
            ExprRef::Member => {
                self.em().op(Op::Dup2);
                self.em().op(Op::GetProp);
                self.em().op(Op::ToNumber);
                self.em().op(Op::PushInt8);
                self.em().i8(1);
                self.em().adjust(1);
                self.em().op(step);
                self.em().op(Op::SetProp);
            }
            ExprRef::Value => return Err(self.err(ParserErrId::InvalidAssignmentTarget)),
        }
        if !prefix {
            // Reconstruct the pre-increment value from the stored result.
            self.em().op(Op::PushInt8);
            self.em().i8(1);
            self.em().adjust(1);
            self.em().op(unstep);
        }
        Ok(())
    }

    // -- member chains, calls, primaries ------------------------------------

    fn deref(&mut self, r: ExprRef) {
        match r {
            ExprRef::Value => {}
            ExprRef::Ident(name) => {
                let lit = self.em().literal(name);
                self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, lit);
            }
            ExprRef::Member => self.em().op(Op::GetProp),
            ExprRef::MemberLit(lit) => {
                self.em().op_lit(Op::GetPropLit8, Op::GetPropLit16, lit)
            }
        }
    }

    fn parse_member_chain(&mut self, allow_call: bool) -> R<ExprRef> {
        let mut r = self.parse_primary()?;
        let mut optional_sites: Vec<usize> = Vec::new();
        loop {
            match self.tok().clone() {
                Token::Dot => {
                    self.deref(r);
                    self.bump();
                    let name = self.expect_property_name()?;
                    let lit = self.name_literal(&name)?;
                    r = ExprRef::MemberLit(lit);
                }
                Token::QuestionDot => {
                    self.deref(r);
                    self.bump();
                    self.em().op(Op::Dup);
                    self.em().op(Op::IsNullish);
                    let site = self.em().jump_forward(Op::JumpTrue16);
                    optional_sites.push(site);
                    if self.eat(&Token::LBracket) {
                        self.parse_expression()?;
                        self.expect(&Token::RBracket, ParserErrId::RightSquareExpected)?;
                        r = ExprRef::Member;
                    } else {
                        let name = self.expect_property_name()?;
                        let lit = self.name_literal(&name)?;
                        r = ExprRef::MemberLit(lit);
                    }
                }
                Token::LBracket => {
                    self.deref(r);
                    self.bump();
                    self.parse_expression()?;
                    self.expect(&Token::RBracket, ParserErrId::RightSquareExpected)?;
                    r = ExprRef::Member;
                }
                Token::LParen if allow_call => {
                    // Build [func this] from the reference state.
                    match r {
                        ExprRef::Ident(name) => {
                            let lit = self.value_literal(name)?;
                            self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, lit);
                            self.em().op(Op::PushUndefined);
                        }
                        ExprRef::Value => {
                            self.em().op(Op::PushUndefined);
                        }
                        ExprRef::MemberLit(lit) => {
                            self.em().op(Op::Dup);
                            self.em().op_lit(Op::GetPropLit8, Op::GetPropLit16, lit);
                            self.em().op(Op::Swap);
                        }
                        ExprRef::Member => {
                            self.em().op(Op::Dup2);
                            self.em().op(Op::GetProp);
                            self.em().op(Op::Rot3);
                            self.em().op(Op::Pop);
                        }
                    }
                    let argc = self.parse_arguments()?;
                    self.em().op(Op::Call);
                    self.em().u8(argc);
                    self.em().adjust(-(argc as i32) - 1);
                    r = ExprRef::Value;
                }
                Token::Template(_) => return Err(self.err(ParserErrId::UnexpectedToken)),
                _ => break,
            }
        }
        if !optional_sites.is_empty() {
            self.deref(r);
            r = ExprRef::Value;
            let done = self.em().jump_forward(Op::Jump16);
            for site in optional_sites {
                self.em().patch_jump(site);
            }
            self.em().op(Op::Pop);
            self.em().op(Op::PushUndefined);
            self.em().patch_jump(done);
        }
        Ok(r)
    }

    /// Identifier or keyword used as a property name after `.`.
    fn expect_property_name(&mut self) -> R<String> {
        let text = token_name_text(self.tok());
        match text {
            Some(t) => {
                self.bump();
                Ok(t)
            }
            None => Err(self.err(ParserErrId::IdentifierExpected)),
        }
    }

    fn parse_arguments(&mut self) -> R<u8> {
        self.expect(&Token::LParen, ParserErrId::LeftParenExpected)?;
        let mut argc = 0usize;
        while !matches!(self.tok(), Token::RParen) {
            if matches!(self.tok(), Token::Dot) {
                return Err(self.err(ParserErrId::SpreadNotSupported));
            }
            self.parse_assignment()?;
            argc += 1;
            if argc > MAX_ARGS {
                return Err(self.err(ParserErrId::NestingLimitReached));
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
        Ok(argc as u8)
    }

    fn parse_primary(&mut self) -> R<ExprRef> {
        self.mark_line();
        match self.tok().clone() {
            Token::Number(n) => {
                self.bump();
                self.emit_number(n)?;
                Ok(ExprRef::Value)
            }
            Token::BigInt(_) => Err(self.err(ParserErrId::BigIntDisabled)),
            Token::Str(s) => {
                self.bump();
                let v = self.intern(&s);
                self.em().push_lit_value(v);
                Ok(ExprRef::Value)
            }
            Token::Template(parts) => {
                self.bump();
                self.compile_template(parts)?;
                Ok(ExprRef::Value)
            }
            Token::Regex(pattern, flags) => {
                self.bump();
                let p = self.intern(&pattern);
                let f = self.intern(&flags);
                let p_lit = self.value_literal(p)?;
                let f_lit = self.value_literal(f)?;
                self.em().ext(ExtOp::NewRegExp);
                self.em().u16(p_lit);
                self.em().u16(f_lit);
                self.em().adjust(1);
                Ok(ExprRef::Value)
            }
            Token::True => {
                self.bump();
                self.em().op(Op::PushTrue);
                Ok(ExprRef::Value)
            }
            Token::False => {
                self.bump();
                self.em().op(Op::PushFalse);
                Ok(ExprRef::Value)
            }
            Token::Null => {
                self.bump();
                self.em().op(Op::PushNull);
                Ok(ExprRef::Value)
            }
            Token::This => {
                self.bump();
                self.em().op(Op::PushThis);
                Ok(ExprRef::Value)
            }
            Token::Ident(name) => {
                // async function expression
                if name == "async"
                    && matches!(self.peek_tok(1), Token::Function)
                    && !self.peek_lexeme(1).newline_before
                {
                    self.bump();
                    self.bump();
                    return self.parse_function_expression(BC_ASYNC);
                }
                self.bump();
                let v = self.intern(&name);
                Ok(ExprRef::Ident(v))
            }
            Token::Function => {
                self.bump();
                self.parse_function_expression(0)
            }
            Token::New => {
                self.bump();
                let callee = self.parse_member_chain(false)?;
                self.deref(callee);
                let argc = if matches!(self.tok(), Token::LParen) {
                    self.parse_arguments()?
                } else {
                    0
                };
                self.em().op(Op::New);
                self.em().u8(argc);
                self.em().adjust(-(argc as i32));
                Ok(ExprRef::Value)
            }
            Token::LParen => {
                self.bump();
                self.parse_expression()?;
                self.expect(&Token::RParen, ParserErrId::RightParenExpected)?;
                Ok(ExprRef::Value)
            }
            Token::LBracket => {
                self.bump();
                self.parse_array_literal()?;
                Ok(ExprRef::Value)
            }
            Token::LBrace => {
                self.bump();
                self.parse_object_literal()?;
                Ok(ExprRef::Value)
            }
            Token::Eof => Err(self.err(ParserErrId::UnexpectedEos)),
            _ => Err(self.err(ParserErrId::ExpressionExpected)),
        }
    }

    fn emit_number(&mut self, n: f64) -> R<()> {
        let as_int = n as i32;
        if as_int as f64 == n && (-128..=127).contains(&as_int) && !(n == 0.0 && n.is_sign_negative())
        {
            self.em().op(Op::PushInt8);
            self.em().i8(as_int as i8);
            return Ok(());
        }
        let v = self.number_value(n);
        let lit = self.value_literal(v)?;
        self.em().op_lit(Op::PushLit8, Op::PushLit16, lit);
        Ok(())
    }

    fn parse_function_expression(&mut self, extra_flags: u16) -> R<ExprRef> {
        let generator = self.eat(&Token::Star);
        let name = match self.tok().clone() {
            Token::Ident(n) => {
                self.bump();
                self.intern(&n)
            }
            _ => strings::magic_value(Magic::Anonymous),
        };
        let flags = extra_flags | if generator { BC_GENERATOR } else { 0 };
        let lit = self.compile_function(flags, name, None)?;
        self.em().op_lit(Op::PushFunc8, Op::PushFunc16, lit);
        Ok(ExprRef::Value)
    }

    fn parse_array_literal(&mut self) -> R<()> {
        let mut count = 0usize;
        loop {
            match self.tok() {
                Token::RBracket => break,
                Token::Comma => {
                    // elision
                    self.bump();
                    self.em().push_lit_value(Value::HOLE);
                    count += 1;
                    continue;
                }
                _ => {}
            }
            self.parse_assignment()?;
            count += 1;
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBracket, ParserErrId::RightSquareExpected)?;
        if count > u16::MAX as usize {
            return Err(self.err(ParserErrId::LiteralLimitReached));
        }
        self.em().op(Op::NewArray16);
        self.em().u16(count as u16);
        self.em().adjust(-(count as i32) + 1);
        Ok(())
    }

    fn parse_object_literal(&mut self) -> R<()> {
        self.em().op(Op::NewObject);
        while !matches!(self.tok(), Token::RBrace) {
            match self.tok().clone() {
                Token::LBracket => {
                    // computed key
                    self.bump();
                    self.parse_assignment()?;
                    self.expect(&Token::RBracket, ParserErrId::RightSquareExpected)?;
                    self.expect(&Token::Colon, ParserErrId::ColonExpected)?;
                    self.parse_assignment()?;
                    self.em().op(Op::DefineOwn);
                }
                Token::Str(s) => {
                    self.bump();
                    self.parse_object_member_value(&s)?;
                }
                Token::Number(n) => {
                    self.bump();
                    let key = strings::number_to_string(n);
                    self.parse_object_member_value(&key)?;
                }
                tok => {
                    let Some(name) = token_name_text(&tok) else {
                        return Err(self.err(ParserErrId::IdentifierExpected));
                    };
                    self.bump();
                    match self.tok() {
                        Token::Colon | Token::LParen => {
                            self.parse_object_member_value(&name)?;
                        }
                        _ => {
                            // shorthand
                            let name_lit = self.name_literal(&name)?;
                            self.em().op_lit(Op::LoadIdent8, Op::LoadIdent16, name_lit);
                            self.emit_define_own_lit(name_lit)?;
                        }
                    }
                }
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBrace, ParserErrId::RightBraceExpected)?;
        Ok(())
    }

    fn emit_define_own_lit(&mut self, name_lit: u16) -> R<()> {
        if name_lit <= u8::MAX as u16 {
            self.em().op(Op::DefineOwnLit8);
            self.em().u8(name_lit as u8);
        } else {
            self.em().op_lit(Op::PushLit8, Op::PushLit16, name_lit);
            self.em().op(Op::Swap);
            self.em().op(Op::DefineOwn);
        }
        Ok(())
    }

    fn parse_object_member_value(&mut self, key: &str) -> R<()> {
        let name_lit = self.name_literal(key)?;
        if matches!(self.tok(), Token::LParen) {
            // method shorthand
            let name_value = self.intern(key);
            let lit = self.compile_function(0, name_value, None)?;
            self.em().op_lit(Op::PushFunc8, Op::PushFunc16, lit);
        } else {
            self.expect(&Token::Colon, ParserErrId::ColonExpected)?;
            self.parse_assignment()?;
        }
        self.emit_define_own_lit(name_lit)
    }

    fn compile_template(&mut self, parts: Vec<(bool, String)>) -> R<()> {
        if parts.len() == 1 && !parts[0].0 {
            let v = self.intern(&parts[0].1);
            self.em().push_lit_value(v);
            return Ok(());
        }
        let mut first = true;
        if parts.first().map_or(false, |(is_expr, _)| *is_expr) {
            self.em().push_lit_value(strings::magic_value(Magic::Empty));
            first = false;
        }
        for (is_expr, text) in parts {
            if is_expr {
                self.compile_sub_expression(&text)?;
            } else {
                let v = self.intern(&text);
                self.em().push_lit_value(v);
            }
            if first {
                first = false;
            } else {
                self.em().op(Op::Add);
            }
        }
        Ok(())
    }

    /// Compile an embedded expression source (template substitution) into
    /// the current emitter by swapping the token stream.
    fn compile_sub_expression(&mut self, src: &str) -> R<()> {
        let sub_toks = tokenize(src)?;
        let saved_toks = std::mem::replace(&mut self.toks, sub_toks);
        let saved_pos = std::mem::replace(&mut self.pos, 0);
        let result = (|| -> R<()> {
            self.parse_expression()?;
            if !matches!(self.tok(), Token::Eof) {
                return Err(self.err(ParserErrId::UnexpectedToken));
            }
            Ok(())
        })();
        self.toks = saved_toks;
        self.pos = saved_pos;
        result
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum DeclKind {
    Var,
    Let,
    Const,
}

#[derive(Debug, Clone, Copy)]
enum AssignKind {
    Plain,
    Binary(Op),
    LogicalAnd,
    LogicalOr,
    LogicalNullish,
}

/// Text of a token usable as a property name or object key (identifiers and
/// keywords).
fn token_name_text(t: &Token) -> Option<String> {
    let s = match t {
        Token::Ident(n) => return Some(n.clone()),
        Token::Var => "var",
        Token::Let => "let",
        Token::Const => "const",
        Token::Function => "function",
        Token::Return => "return",
        Token::If => "if",
        Token::Else => "else",
        Token::While => "while",
        Token::Do => "do",
        Token::For => "for",
        Token::Break => "break",
        Token::Continue => "continue",
        Token::Throw => "throw",
        Token::Try => "try",
        Token::Catch => "catch",
        Token::Finally => "finally",
        Token::New => "new",
        Token::Delete => "delete",
        Token::Typeof => "typeof",
        Token::Void => "void",
        Token::Instanceof => "instanceof",
        Token::In => "in",
        Token::This => "this",
        Token::Null => "null",
        Token::True => "true",
        Token::False => "false",
        Token::Await => "await",
        Token::Yield => "yield",
        Token::Import => "import",
        Token::Export => "export",
        Token::Default => "default",
        Token::Class => "class",
        Token::Switch => "switch",
        Token::Case => "case",
        Token::With => "with",
        Token::Super => "super",
        Token::Extends => "extends",
        _ => return None,
    };
    Some(s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;

    fn parse_ok(src: &str) -> bool {
        let mut ctx = Context::new(Default::default()).unwrap();
        parse_source(&mut ctx, src, &ParseOptions::default()).is_ok()
    }

    fn parse_err(src: &str) -> ParserErrId {
        let mut ctx = Context::new(Default::default()).unwrap();
        parse_source(&mut ctx, src, &ParseOptions::default())
            .unwrap_err()
            .id
    }

    #[test]
    fn accepts_core_constructs() {
        assert!(parse_ok("var x = 1 + 2 * 3;"));
        assert!(parse_ok("function f(a,b){return a+b}"));
        assert!(parse_ok("let f = (a, b) => a + b;"));
        assert!(parse_ok("for (let i = 0; i < 10; i++) { i; }"));
        assert!(parse_ok("try { f() } catch (e) { e } finally { g() }"));
        assert!(parse_ok("a?.b?.[c] ?? d"));
        assert!(parse_ok("obj.k += fn(1, 'two', [3], {four: 4})"));
        assert!(parse_ok("async function f() { await g(); }"));
        assert!(parse_ok("function* gen() { yield 1; yield 2; }"));
        assert!(parse_ok("`a${1+2}b`"));
        assert!(parse_ok("while (x) { if (y) break; else continue; }"));
        assert!(parse_ok("x = /ab+c/gi;"));
        assert!(parse_ok("do { x--; } while (x > 0);"));
    }

    #[test]
    fn rejects_with_stable_ids() {
        assert_eq!(parse_err("class A {}"), ParserErrId::ClassNotSupported);
        assert_eq!(parse_err("switch (x) {}"), ParserErrId::SwitchNotSupported);
        assert_eq!(parse_err("for (x in y) {}"), ParserErrId::ForInOfNotSupported);
        assert_eq!(parse_err("let {a} = b;"), ParserErrId::DestructuringNotSupported);
        assert_eq!(parse_err("1 = 2;"), ParserErrId::InvalidAssignmentTarget);
        assert_eq!(parse_err("return 1;"), ParserErrId::ReturnOutsideFunction);
        assert_eq!(parse_err("await x;"), ParserErrId::AwaitOutsideAsync);
        assert_eq!(parse_err("function f(a, a) {}"), ParserErrId::DuplicateParameter);
        assert_eq!(parse_err("break;"), ParserErrId::IllegalBreak);
        assert_eq!(parse_err("const x;"), ParserErrId::UnexpectedToken);
        assert_eq!(parse_err("try { }"), ParserErrId::CatchOrFinallyExpected);
    }

    #[test]
    fn error_carries_position() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let err = parse_source(&mut ctx, "var x = \n  @;", &ParseOptions::default()).unwrap_err();
        assert_eq!(err.line, 2);
        assert!(err.column >= 3);
    }

    #[test]
    fn strict_mode_directive_applies() {
        assert_eq!(
            parse_err("'use strict'; delete x;"),
            ParserErrId::StrictDelete
        );
        assert!(parse_ok("delete x;"));
    }

    #[test]
    fn parse_is_deterministic() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let src = "function f(a){ return a * 2 } var q = f(21);";
        let a = parse_source(&mut ctx, src, &ParseOptions::default()).unwrap();
        let b = parse_source(&mut ctx, src, &ParseOptions::default()).unwrap();
        let bc_a = ctx.heap.bytecode(a);
        let bc_b = ctx.heap.bytecode(b);
        assert_eq!(bc_a.code, bc_b.code);
        assert_eq!(bc_a.literals.len(), bc_b.literals.len());
        assert_eq!(bc_a.stack_limit, bc_b.stack_limit);
    }

    #[test]
    fn module_items_only_in_modules() {
        assert_eq!(
            parse_err("import {x} from 'm';"),
            ParserErrId::ModuleItemNotAtTop
        );
        let mut ctx = Context::new(Default::default()).unwrap();
        let opts = ParseOptions {
            module: true,
            ..Default::default()
        };
        let idx = parse_source(
            &mut ctx,
            "import { five } from 'synthetic'; export const ten = five + five;",
            &opts,
        )
        .unwrap();
        let bc = ctx.heap.bytecode(idx);
        let m = bc.module.as_ref().unwrap();
        assert_eq!(m.requests.len(), 1);
        assert_eq!(m.exports.len(), 1);
    }

    #[test]
    fn var_names_are_hoisted_to_header() {
        let mut ctx = Context::new(Default::default()).unwrap();
        let idx = parse_source(
            &mut ctx,
            "var a = 1; { var b = 2; } function g() {}",
            &ParseOptions::default(),
        )
        .unwrap();
        let bc = ctx.heap.bytecode(idx);
        assert_eq!(bc.var_names.len(), 2);
        assert_eq!(bc.func_decls.len(), 1);
    }
}
