use crate::lang::ast::*;
use crate::lang::error::{ScriptError, ScriptResult};
use crate::lang::lexer::{tokenize, Tok, Token};
use std::rc::Rc;

/// Operators allowed in one left-associative chain such as `a + b + c`.
const MAX_CHAIN: usize = 2_000;

/// Parse a whole program.
pub fn parse_program(source: &str, max_nesting: usize) -> ScriptResult<Block> {
    let tokens = tokenize(source)?;
    let mut parser = Parser::new(tokens, max_nesting);
    let mut body = Vec::new();
    while !parser.at(&Tok::Eof) {
        if parser.eat(&Tok::Newline) {
            continue;
        }
        parser.parse_statement(&mut body)?;
    }
    Ok(body)
}

/// Parse a single expression, as used by test assertions.
pub fn parse_expression(source: &str, max_nesting: usize) -> ScriptResult<Expr> {
    let tokens = tokenize(source.trim())?;
    let mut parser = Parser::new(tokens, max_nesting);
    if parser.at(&Tok::Newline) || parser.at(&Tok::Eof) {
        return Err(parser.error("empty expression"));
    }
    let expr = parser.parse_testlist()?;
    parser.eat(&Tok::Newline);
    if !parser.at(&Tok::Eof) {
        return Err(parser.error("invalid syntax"));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
    max_depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>, max_depth: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
            max_depth,
        }
    }

    fn current(&self) -> &Tok {
        self.tokens
            .get(self.pos)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn peek_next(&self) -> &Tok {
        self.tokens
            .get(self.pos + 1)
            .map(|t| &t.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(1)
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(message, self.line())
    }

    fn advance(&mut self) -> Tok {
        let tok = self.current().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.current() == tok
    }

    fn at_op(&self, op: &str) -> bool {
        matches!(self.current(), Tok::Op(o) if *o == op)
    }

    fn at_keyword(&self, kw: &str) -> bool {
        matches!(self.current(), Tok::Keyword(k) if *k == kw)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.at_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if self.at_keyword(kw) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_op(&mut self, op: &str) -> ScriptResult<()> {
        if self.eat_op(op) {
            Ok(())
        } else {
            Err(self.error(format!("expected '{op}'")))
        }
    }

    fn expect_name(&mut self) -> ScriptResult<String> {
        match self.current().clone() {
            Tok::Name(name) => {
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error("invalid syntax")),
        }
    }

    fn enter(&mut self) -> ScriptResult<()> {
        self.depth += 1;
        if self.depth > self.max_depth {
            return Err(self.error("too many nested expressions or blocks"));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn check_chain(&self, length: usize) -> ScriptResult<()> {
        if length > MAX_CHAIN {
            return Err(self.error("expression is too complex"));
        }
        Ok(())
    }

    // ----- statements -----

    fn parse_statement(&mut self, out: &mut Block) -> ScriptResult<()> {
        let line = self.line();
        let kind = match self.current().clone() {
            Tok::Keyword("if") => self.parse_if()?,
            Tok::Keyword("while") => self.parse_while()?,
            Tok::Keyword("for") => self.parse_for()?,
            Tok::Keyword("def") => self.parse_def()?,
            Tok::Keyword("try") => self.parse_try()?,
            Tok::Keyword(kw @ ("class" | "with" | "async" | "yield" | "await" | "nonlocal")) => {
                return Err(self.error(format!("'{kw}' is not supported in the sandbox")));
            }
            Tok::Op("@") => return Err(self.error("decorators are not supported in the sandbox")),
            Tok::Indent => return Err(self.error("unexpected indent")),
            _ => return self.parse_simple_statements(out),
        };
        out.push(Stmt { line, kind });
        Ok(())
    }

    fn parse_simple_statements(&mut self, out: &mut Block) -> ScriptResult<()> {
        loop {
            let line = self.line();
            let kind = self.parse_small_statement()?;
            out.push(Stmt { line, kind });
            if self.eat_op(";") {
                if self.at(&Tok::Newline) || self.at(&Tok::Eof) {
                    break;
                }
                continue;
            }
            break;
        }
        if !self.eat(&Tok::Newline) && !self.at(&Tok::Eof) {
            return Err(self.error("invalid syntax"));
        }
        Ok(())
    }

    fn parse_small_statement(&mut self) -> ScriptResult<StmtKind> {
        match self.current().clone() {
            Tok::Keyword("pass") => {
                self.advance();
                Ok(StmtKind::Pass)
            }
            Tok::Keyword("break") => {
                self.advance();
                Ok(StmtKind::Break)
            }
            Tok::Keyword("continue") => {
                self.advance();
                Ok(StmtKind::Continue)
            }
            Tok::Keyword("return") => {
                self.advance();
                if self.at_statement_end() {
                    Ok(StmtKind::Return(None))
                } else {
                    Ok(StmtKind::Return(Some(self.parse_testlist_star()?)))
                }
            }
            Tok::Keyword("global") => {
                self.advance();
                let mut names = vec![self.expect_name()?];
                while self.eat_op(",") {
                    names.push(self.expect_name()?);
                }
                Ok(StmtKind::Global(names))
            }
            Tok::Keyword("del") => {
                self.advance();
                let mut targets = vec![self.parse_bitor()?];
                while self.eat_op(",") {
                    if self.at_statement_end() {
                        break;
                    }
                    targets.push(self.parse_bitor()?);
                }
                for target in &targets {
                    if !target.is_assignable() {
                        return Err(self.error("cannot delete expression"));
                    }
                }
                Ok(StmtKind::Del(targets))
            }
            Tok::Keyword("assert") => {
                self.advance();
                let test = self.parse_test()?;
                let message = if self.eat_op(",") {
                    Some(self.parse_test()?)
                } else {
                    None
                };
                Ok(StmtKind::Assert { test, message })
            }
            Tok::Keyword("raise") => {
                self.advance();
                if self.at_statement_end() {
                    Ok(StmtKind::Raise(None))
                } else {
                    let exc = self.parse_test()?;
                    if self.eat_keyword("from") {
                        self.parse_test()?;
                    }
                    Ok(StmtKind::Raise(Some(exc)))
                }
            }
            Tok::Keyword("import") => {
                self.advance();
                let module = self.parse_dotted_name()?;
                self.skip_import_tail();
                Ok(StmtKind::Import(module))
            }
            Tok::Keyword("from") => {
                self.advance();
                let module = self.parse_dotted_name()?;
                if !self.eat_keyword("import") {
                    return Err(self.error("invalid syntax"));
                }
                self.skip_import_tail();
                Ok(StmtKind::Import(module))
            }
            _ => self.parse_expression_statement(),
        }
    }

    fn parse_dotted_name(&mut self) -> ScriptResult<String> {
        let mut name = String::new();
        while self.eat_op(".") || self.eat_op("...") {
            name.push('.');
        }
        if matches!(self.current(), Tok::Name(_)) {
            name.push_str(&self.expect_name()?);
            while self.eat_op(".") {
                name.push('.');
                name.push_str(&self.expect_name()?);
            }
        }
        if name.is_empty() {
            return Err(self.error("invalid syntax"));
        }
        Ok(name)
    }

    fn skip_import_tail(&mut self) {
        while !self.at_statement_end() {
            self.advance();
        }
    }

    fn at_statement_end(&self) -> bool {
        matches!(self.current(), Tok::Newline | Tok::Eof | Tok::Op(";"))
    }

    fn parse_expression_statement(&mut self) -> ScriptResult<StmtKind> {
        let first = self.parse_testlist_star()?;

        if let Tok::Op(op) = self.current().clone() {
            if let Some(bin) = augmented_op(op) {
                self.advance();
                if !matches!(first, Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. }) {
                    return Err(self.error("illegal expression for augmented assignment"));
                }
                let value = self.parse_testlist()?;
                return Ok(StmtKind::AugAssign {
                    target: first,
                    op: bin,
                    value,
                });
            }
            if op == ":" {
                self.advance();
                if !matches!(first, Expr::Name(_) | Expr::Subscript { .. } | Expr::Attribute { .. }) {
                    return Err(self.error("illegal target for annotation"));
                }
                self.parse_test()?;
                let value = if self.eat_op("=") {
                    Some(self.parse_testlist_star()?)
                } else {
                    None
                };
                return Ok(StmtKind::AnnAssign {
                    target: first,
                    value,
                });
            }
            if op == ":=" {
                return Err(self.error("assignment expressions are not supported in the sandbox"));
            }
        }

        if !self.at_op("=") {
            return Ok(StmtKind::Expr(first));
        }

        let mut targets = vec![first];
        while self.eat_op("=") {
            targets.push(self.parse_testlist_star()?);
        }
        let value = targets.pop().ok_or_else(|| self.error("invalid syntax"))?;
        for target in &targets {
            if !target.is_assignable() {
                return Err(self.error("cannot assign to expression"));
            }
        }
        Ok(StmtKind::Assign { targets, value })
    }

    fn parse_block(&mut self) -> ScriptResult<Block> {
        self.expect_op(":")?;
        self.enter()?;
        let mut body = Vec::new();
        if self.eat(&Tok::Newline) {
            if !self.eat(&Tok::Indent) {
                return Err(self.error("expected an indented block"));
            }
            while !self.eat(&Tok::Dedent) {
                if self.at(&Tok::Eof) {
                    break;
                }
                if self.eat(&Tok::Newline) {
                    continue;
                }
                self.parse_statement(&mut body)?;
            }
        } else {
            self.parse_simple_statements(&mut body)?;
        }
        self.leave();
        Ok(body)
    }

    fn parse_if(&mut self) -> ScriptResult<StmtKind> {
        self.advance();
        let mut branches = Vec::new();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        branches.push((test, body));
        let mut orelse = None;
        loop {
            if self.eat_keyword("elif") {
                let test = self.parse_test()?;
                let body = self.parse_block()?;
                branches.push((test, body));
            } else if self.eat_keyword("else") {
                orelse = Some(self.parse_block()?);
                break;
            } else {
                break;
            }
        }
        Ok(StmtKind::If { branches, orelse })
    }

    fn parse_while(&mut self) -> ScriptResult<StmtKind> {
        self.advance();
        let test = self.parse_test()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(StmtKind::While { test, body, orelse })
    }

    fn parse_for(&mut self) -> ScriptResult<StmtKind> {
        self.advance();
        let target = self.parse_target_list()?;
        if !self.eat_keyword("in") {
            return Err(self.error("expected 'in'"));
        }
        let iter = self.parse_testlist()?;
        let body = self.parse_block()?;
        let orelse = if self.eat_keyword("else") {
            Some(self.parse_block()?)
        } else {
            None
        };
        Ok(StmtKind::For {
            target,
            iter,
            body,
            orelse,
        })
    }

    /// Targets of `for` loops and comprehensions; stops before `in`.
    fn parse_target_list(&mut self) -> ScriptResult<Expr> {
        let first = self.parse_target_item()?;
        if !self.at_op(",") {
            if !first.is_assignable() {
                return Err(self.error("cannot assign to expression"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_keyword("in") {
                break;
            }
            items.push(self.parse_target_item()?);
        }
        let target = Expr::Tuple(items);
        if !target.is_assignable() {
            return Err(self.error("cannot assign to expression"));
        }
        Ok(target)
    }

    fn parse_target_item(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.parse_bitor()?)));
        }
        self.parse_bitor()
    }

    fn parse_def(&mut self) -> ScriptResult<StmtKind> {
        let line = self.line();
        self.advance();
        let name = self.expect_name()?;
        self.expect_op("(")?;
        let params = self.parse_params(&Tok::Op(")"))?;
        self.expect_op(")")?;
        if self.eat_op("->") {
            self.parse_test()?;
        }
        let body = self.parse_block()?;
        Ok(StmtKind::FunctionDef(Rc::new(FunctionDef {
            name,
            params,
            body,
            line,
        })))
    }

    fn parse_params(&mut self, close: &Tok) -> ScriptResult<Vec<Param>> {
        let mut params: Vec<Param> = Vec::new();
        let annotated = *close == Tok::Op(")");
        while !self.at(close) {
            if self.at_op("*") || self.at_op("**") || self.at_op("/") {
                return Err(self.error("variadic and positional-only parameters are not supported in the sandbox"));
            }
            let name = self.expect_name()?;
            if params.iter().any(|p| p.name == name) {
                return Err(self.error(format!(
                    "duplicate argument '{name}' in function definition"
                )));
            }
            if annotated && self.eat_op(":") {
                self.parse_test()?;
            }
            let default = if self.eat_op("=") {
                Some(self.parse_test()?)
            } else {
                None
            };
            if default.is_none() && params.iter().any(|p| p.default.is_some()) {
                return Err(self.error("non-default argument follows default argument"));
            }
            params.push(Param { name, default });
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(params)
    }

    fn parse_try(&mut self) -> ScriptResult<StmtKind> {
        self.advance();
        let body = self.parse_block()?;
        let mut handlers = Vec::new();
        while self.at_keyword("except") {
            let line = self.line();
            self.advance();
            let (matches, name) = if self.at_op(":") {
                (None, None)
            } else {
                let matches = self.parse_test()?;
                let name = if self.eat_keyword("as") {
                    Some(self.expect_name()?)
                } else {
                    None
                };
                (Some(matches), name)
            };
            let body = self.parse_block()?;
            handlers.push(Handler {
                line,
                matches,
                name,
                body,
            });
        }
        let orelse = if !handlers.is_empty() && self.eat_keyword("else") {
            Some(self.parse_block()?)
        } else {
            None
        };
        let finalbody = if self.eat_keyword("finally") {
            Some(self.parse_block()?)
        } else {
            None
        };
        if handlers.is_empty() && finalbody.is_none() {
            return Err(self.error("expected 'except' or 'finally' block"));
        }
        Ok(StmtKind::Try {
            body,
            handlers,
            orelse,
            finalbody,
        })
    }

    // ----- expressions -----

    /// Comma-separated tests; more than one becomes a tuple.
    fn parse_testlist(&mut self) -> ScriptResult<Expr> {
        let first = self.parse_test()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_testlist_end() {
                break;
            }
            items.push(self.parse_test()?);
        }
        Ok(Expr::Tuple(items))
    }

    /// Like [`Self::parse_testlist`] but allows `*starred` items.
    fn parse_testlist_star(&mut self) -> ScriptResult<Expr> {
        let first = self.parse_test_or_star()?;
        if !self.at_op(",") {
            if matches!(first, Expr::Starred(_)) {
                return Err(self.error("can't use starred expression here"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_testlist_end() {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn at_testlist_end(&self) -> bool {
        matches!(
            self.current(),
            Tok::Newline | Tok::Eof | Tok::Op("=") | Tok::Op(")") | Tok::Op(";") | Tok::Op(":")
        ) || matches!(self.current(), Tok::Op(op) if augmented_op(op).is_some())
    }

    fn parse_test_or_star(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("*") {
            return Ok(Expr::Starred(Box::new(self.parse_bitor()?)));
        }
        self.parse_test()
    }

    fn parse_test(&mut self) -> ScriptResult<Expr> {
        self.enter()?;
        let result = self.parse_test_inner();
        self.leave();
        result
    }

    fn parse_test_inner(&mut self) -> ScriptResult<Expr> {
        if self.at_keyword("lambda") {
            return self.parse_lambda();
        }
        let body = self.parse_or()?;
        if self.eat_keyword("if") {
            let test = self.parse_or()?;
            if !self.eat_keyword("else") {
                return Err(self.error("expected 'else' after 'if' expression"));
            }
            let orelse = self.parse_test()?;
            return Ok(Expr::IfExp {
                test: Box::new(test),
                body: Box::new(body),
                orelse: Box::new(orelse),
            });
        }
        Ok(body)
    }

    /// Condition position inside comprehensions: no bare conditional
    /// expressions.
    fn parse_test_no_cond(&mut self) -> ScriptResult<Expr> {
        self.enter()?;
        let result = if self.at_keyword("lambda") {
            self.parse_lambda()
        } else {
            self.parse_or()
        };
        self.leave();
        result
    }

    fn parse_lambda(&mut self) -> ScriptResult<Expr> {
        let line = self.line();
        self.advance();
        let params = self.parse_params(&Tok::Op(":"))?;
        self.expect_op(":")?;
        let body = self.parse_test()?;
        Ok(Expr::Lambda(Rc::new(FunctionDef {
            name: "<lambda>".to_string(),
            params,
            body: vec![Stmt {
                line,
                kind: StmtKind::Return(Some(body)),
            }],
            line,
        })))
    }

    fn parse_or(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_and()?;
        let mut chain = 0;
        while self.eat_keyword("or") {
            chain += 1;
            self.check_chain(chain)?;
            let right = self.parse_and()?;
            left = Expr::BoolOp {
                op: BoolOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ScriptResult<Expr> {
        let mut left = self.parse_not()?;
        let mut chain = 0;
        while self.eat_keyword("and") {
            chain += 1;
            self.check_chain(chain)?;
            let right = self.parse_not()?;
            left = Expr::BoolOp {
                op: BoolOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> ScriptResult<Expr> {
        if self.eat_keyword("not") {
            self.enter()?;
            let operand = self.parse_not();
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand?),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> ScriptResult<Expr> {
        let left = self.parse_bitor()?;
        let mut ops = Vec::new();
        loop {
            let op = match self.current().clone() {
                Tok::Op("==") => CmpOp::Eq,
                Tok::Op("!=") => CmpOp::NotEq,
                Tok::Op("<") => CmpOp::Lt,
                Tok::Op("<=") => CmpOp::LtE,
                Tok::Op(">") => CmpOp::Gt,
                Tok::Op(">=") => CmpOp::GtE,
                Tok::Keyword("in") => CmpOp::In,
                Tok::Keyword("not") if matches!(self.peek_next(), Tok::Keyword("in")) => {
                    self.advance();
                    CmpOp::NotIn
                }
                Tok::Keyword("is") => {
                    if matches!(self.peek_next(), Tok::Keyword("not")) {
                        self.advance();
                        CmpOp::IsNot
                    } else {
                        CmpOp::Is
                    }
                }
                _ => break,
            };
            self.advance();
            self.check_chain(ops.len() + 1)?;
            ops.push((op, self.parse_bitor()?));
        }
        if ops.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                ops,
            })
        }
    }

    fn parse_binary_level(
        &mut self,
        table: &[(&str, BinOp)],
        next: fn(&mut Self) -> ScriptResult<Expr>,
    ) -> ScriptResult<Expr> {
        let mut left = next(self)?;
        let mut chain = 0;
        'outer: loop {
            for (symbol, op) in table {
                if self.at_op(symbol) {
                    self.advance();
                    chain += 1;
                    self.check_chain(chain)?;
                    let right = next(self)?;
                    left = Expr::Binary {
                        op: *op,
                        left: Box::new(left),
                        right: Box::new(right),
                    };
                    continue 'outer;
                }
            }
            return Ok(left);
        }
    }

    fn parse_bitor(&mut self) -> ScriptResult<Expr> {
        self.parse_binary_level(&[("|", BinOp::BitOr)], Self::parse_bitxor)
    }

    fn parse_bitxor(&mut self) -> ScriptResult<Expr> {
        self.parse_binary_level(&[("^", BinOp::BitXor)], Self::parse_bitand)
    }

    fn parse_bitand(&mut self) -> ScriptResult<Expr> {
        self.parse_binary_level(&[("&", BinOp::BitAnd)], Self::parse_shift)
    }

    fn parse_shift(&mut self) -> ScriptResult<Expr> {
        self.parse_binary_level(
            &[("<<", BinOp::LShift), (">>", BinOp::RShift)],
            Self::parse_arith,
        )
    }

    fn parse_arith(&mut self) -> ScriptResult<Expr> {
        self.parse_binary_level(&[("+", BinOp::Add), ("-", BinOp::Sub)], Self::parse_term)
    }

    fn parse_term(&mut self) -> ScriptResult<Expr> {
        if self.at_op("@") {
            return Err(self.error("invalid syntax"));
        }
        self.parse_binary_level(
            &[
                ("*", BinOp::Mul),
                ("//", BinOp::FloorDiv),
                ("/", BinOp::Div),
                ("%", BinOp::Mod),
            ],
            Self::parse_factor,
        )
    }

    fn parse_factor(&mut self) -> ScriptResult<Expr> {
        let op = match self.current() {
            Tok::Op("-") => Some(UnaryOp::Neg),
            Tok::Op("+") => Some(UnaryOp::Pos),
            Tok::Op("~") => Some(UnaryOp::Invert),
            _ => None,
        };
        let Some(op) = op else {
            return self.parse_power();
        };
        self.advance();
        self.enter()?;
        let operand = self.parse_factor();
        self.leave();
        let operand = operand?;
        // Fold negative literals so `-9223372036854775808` style bounds work.
        if op == UnaryOp::Neg {
            match operand {
                Expr::Int(v) => return Ok(Expr::Int(-v)),
                Expr::Float(v) => return Ok(Expr::Float(-v)),
                _ => {}
            }
        }
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand),
        })
    }

    fn parse_power(&mut self) -> ScriptResult<Expr> {
        let base = self.parse_atom_expr()?;
        if self.eat_op("**") {
            self.enter()?;
            let exponent = self.parse_factor();
            self.leave();
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent?),
            });
        }
        Ok(base)
    }

    fn parse_atom_expr(&mut self) -> ScriptResult<Expr> {
        let mut expr = self.parse_atom()?;
        let mut chain = 0;
        loop {
            if self.eat_op("(") {
                let args = self.parse_call_args()?;
                self.expect_op(")")?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let index = self.parse_subscript()?;
                self.expect_op("]")?;
                expr = Expr::Subscript {
                    value: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat_op(".") {
                let name = self.expect_name()?;
                expr = Expr::Attribute {
                    value: Box::new(expr),
                    name,
                };
            } else {
                return Ok(expr);
            }
            chain += 1;
            self.check_chain(chain)?;
        }
    }

    fn parse_call_args(&mut self) -> ScriptResult<Vec<Arg>> {
        let mut args = Vec::new();
        let mut seen_keyword = false;
        while !self.at_op(")") {
            if self.eat_op("**") {
                return Err(self.error("'**' unpacking is not supported in the sandbox"));
            }
            if self.eat_op("*") {
                args.push(Arg::Star(self.parse_test()?));
            } else if matches!(self.current(), Tok::Name(_)) && matches!(self.peek_next(), Tok::Op("=")) {
                let name = self.expect_name()?;
                self.advance();
                args.push(Arg::Keyword(name, self.parse_test()?));
                seen_keyword = true;
            } else {
                if seen_keyword {
                    return Err(self.error("positional argument follows keyword argument"));
                }
                let value = self.parse_test()?;
                if self.at_keyword("for") {
                    let comp = self.parse_comprehension_tail(CompKind::Generator, value, None)?;
                    args.push(Arg::Positional(comp));
                } else {
                    args.push(Arg::Positional(value));
                }
            }
            if !self.eat_op(",") {
                break;
            }
        }
        Ok(args)
    }

    fn parse_subscript(&mut self) -> ScriptResult<Expr> {
        let first = self.parse_slice_item()?;
        if !self.at_op(",") {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op("]") {
                break;
            }
            items.push(self.parse_slice_item()?);
        }
        Ok(Expr::Tuple(items))
    }

    fn parse_slice_item(&mut self) -> ScriptResult<Expr> {
        let lower = if self.at_op(":") {
            None
        } else {
            let value = self.parse_test()?;
            if !self.at_op(":") {
                return Ok(value);
            }
            Some(Box::new(value))
        };
        self.expect_op(":")?;
        let upper = if self.at_op(":") || self.at_op("]") || self.at_op(",") {
            None
        } else {
            Some(Box::new(self.parse_test()?))
        };
        let step = if self.eat_op(":") {
            if self.at_op("]") || self.at_op(",") {
                None
            } else {
                Some(Box::new(self.parse_test()?))
            }
        } else {
            None
        };
        Ok(Expr::Slice { lower, upper, step })
    }

    fn parse_atom(&mut self) -> ScriptResult<Expr> {
        let tok = self.advance();
        match tok {
            Tok::Int(v) => Ok(Expr::Int(v)),
            Tok::Float(v) => Ok(Expr::Float(v)),
            Tok::Str(_) | Tok::FStr(_) => self.parse_strings(tok),
            Tok::Name(name) => Ok(Expr::Name(name)),
            Tok::Keyword("True") => Ok(Expr::Bool(true)),
            Tok::Keyword("False") => Ok(Expr::Bool(false)),
            Tok::Keyword("None") => Ok(Expr::None),
            Tok::Op("...") => Ok(Expr::Ellipsis),
            Tok::Op("(") => self.parse_paren(),
            Tok::Op("[") => self.parse_list_display(),
            Tok::Op("{") => self.parse_brace_display(),
            Tok::Keyword(kw @ ("yield" | "await")) => {
                Err(self.error(format!("'{kw}' is not supported in the sandbox")))
            }
            Tok::Indent => Err(self.error("unexpected indent")),
            _ => {
                self.pos = self.pos.saturating_sub(1);
                Err(self.error("invalid syntax"))
            }
        }
    }

    /// Adjacent string literals concatenate; any f-string makes the
    /// whole run an f-string.
    fn parse_strings(&mut self, first: Tok) -> ScriptResult<Expr> {
        let line = self.tokens.get(self.pos.saturating_sub(1)).map(|t| t.line).unwrap_or(1);
        let mut pieces = vec![first];
        while matches!(self.current(), Tok::Str(_) | Tok::FStr(_)) {
            pieces.push(self.advance());
        }
        if pieces.iter().all(|p| matches!(p, Tok::Str(_))) {
            let mut text = String::new();
            for piece in pieces {
                if let Tok::Str(s) = piece {
                    text.push_str(&s);
                }
            }
            return Ok(Expr::Str(Rc::from(text)));
        }
        let mut parts = Vec::new();
        for piece in pieces {
            match piece {
                Tok::Str(s) => push_literal(&mut parts, &s),
                Tok::FStr(body) => self.parse_fstring_body(&body, line, &mut parts)?,
                _ => {}
            }
        }
        Ok(Expr::FString(parts))
    }

    fn parse_fstring_body(&mut self, body: &str, line: u32, parts: &mut Vec<FPart>) -> ScriptResult<()> {
        let chars: Vec<char> = body.chars().collect();
        let mut i = 0;
        let mut literal = String::new();
        while i < chars.len() {
            let c = chars[i];
            if c == '{' {
                if chars.get(i + 1) == Some(&'{') {
                    literal.push('{');
                    i += 2;
                    continue;
                }
                push_literal(parts, &literal);
                literal.clear();
                let (field, next) = self.parse_fstring_field(&chars, i + 1, line)?;
                parts.push(field);
                i = next;
                continue;
            }
            if c == '}' {
                if chars.get(i + 1) == Some(&'}') {
                    literal.push('}');
                    i += 2;
                    continue;
                }
                return Err(ScriptError::syntax("f-string: single '}' is not allowed", line));
            }
            literal.push(c);
            i += 1;
        }
        push_literal(parts, &literal);
        Ok(())
    }

    /// Parses `expr[!conv][:spec]}` starting after the opening brace.
    fn parse_fstring_field(&mut self, chars: &[char], start: usize, line: u32) -> ScriptResult<(FPart, usize)> {
        let mut depth = 0usize;
        let mut quote: Option<char> = None;
        let mut i = start;
        let mut expr_end = None;
        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' | '"' => quote = Some(c),
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' if depth > 0 => depth -= 1,
                '}' | ':' if depth == 0 => {
                    expr_end = Some(i);
                    break;
                }
                '!' if depth == 0 && chars.get(i + 1) != Some(&'=') => {
                    expr_end = Some(i);
                    break;
                }
                _ => {}
            }
            i += 1;
        }
        let end = expr_end.ok_or_else(|| ScriptError::syntax("f-string: expecting '}'", line))?;
        let source: String = chars[start..end].iter().collect();
        if source.trim().is_empty() {
            return Err(ScriptError::syntax("f-string: empty expression not allowed", line));
        }
        let remaining_depth = self.max_depth.saturating_sub(self.depth);
        let expr = parse_expression(&source, remaining_depth).map_err(|mut e| {
            e.line = Some(line);
            e
        })?;

        let mut i = end;
        let mut conversion = None;
        if chars.get(i) == Some(&'!') {
            let conv = chars
                .get(i + 1)
                .copied()
                .filter(|c| matches!(c, 'r' | 's' | 'a'))
                .ok_or_else(|| ScriptError::syntax("f-string: invalid conversion character", line))?;
            conversion = Some(conv);
            i += 2;
        }
        let mut spec = String::new();
        if chars.get(i) == Some(&':') {
            i += 1;
            while i < chars.len() && chars[i] != '}' {
                if chars[i] == '{' {
                    return Err(ScriptError::syntax(
                        "f-string: nested replacement fields are not supported",
                        line,
                    ));
                }
                spec.push(chars[i]);
                i += 1;
            }
        }
        if chars.get(i) != Some(&'}') {
            return Err(ScriptError::syntax("f-string: expecting '}'", line));
        }
        Ok((
            FPart::Field {
                expr,
                conversion,
                spec,
            },
            i + 1,
        ))
    }

    fn parse_paren(&mut self) -> ScriptResult<Expr> {
        if self.eat_op(")") {
            return Ok(Expr::Tuple(Vec::new()));
        }
        self.enter()?;
        let result = self.parse_paren_inner();
        self.leave();
        result
    }

    fn parse_paren_inner(&mut self) -> ScriptResult<Expr> {
        let first = self.parse_test_or_star()?;
        if self.at_keyword("for") {
            let comp = self.parse_comprehension_tail(CompKind::Generator, first, None)?;
            self.expect_op(")")?;
            return Ok(comp);
        }
        if self.eat_op(")") {
            if matches!(first, Expr::Starred(_)) {
                return Err(self.error("can't use starred expression here"));
            }
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat_op(",") {
            if self.at_op(")") {
                break;
            }
            items.push(self.parse_test_or_star()?);
        }
        self.expect_op(")")?;
        Ok(Expr::Tuple(items))
    }

    fn parse_list_display(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        self.enter()?;
        let result = (|| -> ScriptResult<Expr> {
            let first = self.parse_test_or_star()?;
            if self.at_keyword("for") {
                let comp = self.parse_comprehension_tail(CompKind::List, first, None)?;
                self.expect_op("]")?;
                return Ok(comp);
            }
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_op("]") {
                    break;
                }
                items.push(self.parse_test_or_star()?);
            }
            self.expect_op("]")?;
            Ok(Expr::List(items))
        })();
        self.leave();
        result
    }

    fn parse_brace_display(&mut self) -> ScriptResult<Expr> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        self.enter()?;
        let result = (|| -> ScriptResult<Expr> {
            if self.at_op("**") {
                return Err(self.error("'**' unpacking is not supported in the sandbox"));
            }
            let first = self.parse_test_or_star()?;
            if self.eat_op(":") {
                let value = self.parse_test()?;
                if self.at_keyword("for") {
                    let comp = self.parse_comprehension_tail(CompKind::Dict, first, Some(value))?;
                    self.expect_op("}")?;
                    return Ok(comp);
                }
                let mut pairs = vec![(first, value)];
                while self.eat_op(",") {
                    if self.at_op("}") {
                        break;
                    }
                    let key = self.parse_test()?;
                    self.expect_op(":")?;
                    pairs.push((key, self.parse_test()?));
                }
                self.expect_op("}")?;
                return Ok(Expr::Dict(pairs));
            }
            if self.at_keyword("for") {
                let comp = self.parse_comprehension_tail(CompKind::Set, first, None)?;
                self.expect_op("}")?;
                return Ok(comp);
            }
            let mut items = vec![first];
            while self.eat_op(",") {
                if self.at_op("}") {
                    break;
                }
                items.push(self.parse_test_or_star()?);
            }
            self.expect_op("}")?;
            Ok(Expr::Set(items))
        })();
        self.leave();
        result
    }

    fn parse_comprehension_tail(
        &mut self,
        kind: CompKind,
        element: Expr,
        value: Option<Expr>,
    ) -> ScriptResult<Expr> {
        if matches!(element, Expr::Starred(_)) {
            return Err(self.error("iterable unpacking cannot be used in comprehension"));
        }
        let mut clauses = Vec::new();
        while self.eat_keyword("for") {
            let target = self.parse_target_list()?;
            if !self.eat_keyword("in") {
                return Err(self.error("expected 'in'"));
            }
            let iter = self.parse_or()?;
            let mut conditions = Vec::new();
            while self.eat_keyword("if") {
                conditions.push(self.parse_test_no_cond()?);
            }
            clauses.push(CompClause {
                target,
                iter,
                conditions,
            });
        }
        Ok(Expr::Comprehension {
            kind,
            element: Box::new(element),
            value: value.map(Box::new),
            clauses,
        })
    }
}

fn push_literal(parts: &mut Vec<FPart>, text: &str) {
    if text.is_empty() {
        return;
    }
    if let Some(FPart::Literal(existing)) = parts.last_mut() {
        existing.push_str(text);
    } else {
        parts.push(FPart::Literal(text.to_string()));
    }
}

fn augmented_op(op: &str) -> Option<BinOp> {
    Some(match op {
        "+=" => BinOp::Add,
        "-=" => BinOp::Sub,
        "*=" => BinOp::Mul,
        "/=" => BinOp::Div,
        "//=" => BinOp::FloorDiv,
        "%=" => BinOp::Mod,
        "**=" => BinOp::Pow,
        "&=" => BinOp::BitAnd,
        "|=" => BinOp::BitOr,
        "^=" => BinOp::BitXor,
        "<<=" => BinOp::LShift,
        ">>=" => BinOp::RShift,
        _ => return None,
    })
}
