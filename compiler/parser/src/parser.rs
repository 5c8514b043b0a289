use std::fmt::{Display, Formatter};
use std::iter::Peekable;

use thiserror::Error;

use ast::*;
use lexer::{Token, TokenType, TokenValue};

#[derive(Error, Clone, Debug)]
pub struct ParseError {
    message: String,
}

impl Display for ParseError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl ParseError {
    fn new(message: String) -> Self {
        Self { message }
    }
}

macro_rules! match_token_types {
    ($( $token:pat ),+ ) => {
        $(
        Some(Token{ kind: $token, ..})
        )|+
    };
}

pub struct Parser {
    tokens: Peekable<std::vec::IntoIter<Token>>,
}

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens: tokens.into_iter().peekable(),
        }
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let mut program = Program::default();

        while let Some(token) = self.peek().cloned() {
            match token.kind {
                TokenType::Var => program.globals.push(self.parse_global()?),
                TokenType::Proc => program.callables.push(self.parse_callable(false)?),
                TokenType::Fun => program.callables.push(self.parse_callable(true)?),
                _ => {
                    return Err(self.error_at(
                        "expected 'var', 'proc' or 'fun' at top level",
                        &token,
                    ))
                }
            }
        }

        Ok(program)
    }

    /// `var x = <expr> : <type> ;`
    fn parse_global(&mut self) -> Result<GlobalVar, ParseError> {
        self.expect(TokenType::Var)?;
        let name = self.parse_ident()?;
        self.expect(TokenType::Assign)?;
        let init = self.parse_expr(0)?;
        self.expect(TokenType::Colon)?;
        let ty = self.parse_type()?;
        self.expect(TokenType::Semicolon)?;

        Ok(GlobalVar { name, ty, init })
    }

    /// `proc name(params) { ... }` or `fun name(params) : T { ... }`
    fn parse_callable(&mut self, is_fun: bool) -> Result<Callable, ParseError> {
        self.advance();

        let name = self.parse_ident()?;

        self.expect(TokenType::OpenParen)?;
        let params = self.parse_params()?;
        self.expect(TokenType::CloseParen)?;

        let return_ty = if is_fun {
            self.expect(TokenType::Colon)?;
            Some(self.parse_type()?)
        } else {
            None
        };

        let body = self.parse_block()?;

        Ok(Callable {
            name,
            params,
            return_ty,
            body,
        })
    }

    /// Parameter groups: `x, y : int64, b : bool`
    fn parse_params(&mut self) -> Result<Vec<(String, Type)>, ParseError> {
        let mut params = vec![];

        if let match_token_types!(TokenType::CloseParen) = self.peek() {
            return Ok(params);
        }

        loop {
            let mut names = vec![self.parse_ident()?];

            while let match_token_types!(TokenType::Comma) = self.peek() {
                self.advance();
                names.push(self.parse_ident()?);

                // The group ends at ':'; a name followed by ':' closes it
                if let match_token_types!(TokenType::Colon) = self.peek() {
                    break;
                }
            }

            self.expect(TokenType::Colon)?;
            let ty = self.parse_type()?;

            for name in names {
                params.push((name, ty.clone()));
            }

            match self.peek() {
                match_token_types!(TokenType::Comma) => {
                    self.advance();
                }
                _ => break,
            }
        }

        Ok(params)
    }

    fn parse_type(&mut self) -> Result<Type, ParseError> {
        let mut ty = match self.advance() {
            match_token_types!(TokenType::Int64) => Type::Int64,
            match_token_types!(TokenType::Bool) => Type::Bool,
            Some(token) => return Err(self.error_at("expected a type", &token)),
            None => return Err(self.eof_error("a type")),
        };

        loop {
            match self.peek() {
                match_token_types!(TokenType::Star) => {
                    self.advance();
                    ty = Type::pointer(ty);
                }
                match_token_types!(TokenType::OpenBracket) => {
                    self.advance();
                    let len = self.parse_number()?;
                    if len <= 0 {
                        return Err(ParseError::new(format!(
                            "list length must be positive, found {}",
                            len
                        )));
                    }
                    self.expect(TokenType::CloseBracket)?;
                    ty = Type::list(ty, len as u64);
                }
                _ => break,
            }
        }

        Ok(ty)
    }

    fn parse_block(&mut self) -> Result<Block, ParseError> {
        self.expect(TokenType::OpenBrace)?;

        let mut stmts = vec![];

        while self
            .tokens
            .peek()
            .is_some_and(|t| t.kind != TokenType::CloseBrace)
        {
            stmts.push(self.parse_stmt()?);
        }

        self.expect(TokenType::CloseBrace)?;

        Ok(Block { stmts })
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        match self.peek() {
            match_token_types!(TokenType::Var) => self.parse_var_decl(),
            match_token_types!(TokenType::Print) => {
                self.advance();
                let expr = self.parse_expr(0)?;
                self.expect(TokenType::Semicolon)?;
                Ok(Stmt::Print(expr))
            }
            match_token_types!(TokenType::If) => self.parse_if(),
            match_token_types!(TokenType::While) => {
                self.advance();
                self.expect(TokenType::OpenParen)?;
                let condition = self.parse_expr(0)?;
                self.expect(TokenType::CloseParen)?;
                let body = Box::new(self.parse_stmt()?);
                Ok(Stmt::While { condition, body })
            }
            match_token_types!(TokenType::Return) => {
                self.advance();
                let expr = match self.peek() {
                    match_token_types!(TokenType::Semicolon) => None,
                    _ => Some(self.parse_expr(0)?),
                };
                self.expect(TokenType::Semicolon)?;
                Ok(Stmt::Return(expr))
            }
            match_token_types!(TokenType::OpenBrace) => Ok(Stmt::Block(self.parse_block()?)),
            Some(_) => self.parse_assign_or_eval(),
            None => Err(self.eof_error("a statement")),
        }
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, ParseError> {
        self.expect(TokenType::Var)?;
        let name = self.parse_ident()?;
        self.expect(TokenType::Assign)?;
        let init = self.parse_expr(0)?;
        self.expect(TokenType::Colon)?;
        let ty = self.parse_type()?;
        self.expect(TokenType::Semicolon)?;

        Ok(Stmt::Declare { name, ty, init })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        self.expect(TokenType::If)?;
        self.expect(TokenType::OpenParen)?;
        let condition = self.parse_expr(0)?;
        self.expect(TokenType::CloseParen)?;

        let true_branch = Box::new(self.parse_stmt()?);

        let false_branch = match self.peek() {
            match_token_types!(TokenType::Else) => {
                self.advance();
                Some(Box::new(self.parse_stmt()?))
            }
            _ => None,
        };

        Ok(Stmt::IfElse {
            condition,
            true_branch,
            false_branch,
        })
    }

    fn parse_assign_or_eval(&mut self) -> Result<Stmt, ParseError> {
        let expr = self.parse_expr(0)?;

        match self.peek() {
            match_token_types!(TokenType::Assign) => {
                self.advance();
                let value = self.parse_expr(0)?;
                self.expect(TokenType::Semicolon)?;
                Ok(Stmt::Assign {
                    target: expr,
                    value,
                })
            }
            _ => {
                self.expect(TokenType::Semicolon)?;
                Ok(Stmt::Eval(expr))
            }
        }
    }

    /// Precedence climbing over binary operators
    fn parse_expr(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut left = self.parse_unary()?;

        while let Some(token) = self.peek() {
            let Some((prec, op)) = binary_op(token.kind) else {
                break;
            };

            if prec < min_prec {
                break;
            }

            self.advance();
            let right = self.parse_expr(prec + 1)?;

            left = Expr::new(ExprKind::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            });
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        let kind = match self.peek() {
            match_token_types!(TokenType::Minus) => {
                self.advance();
                ExprKind::Unary {
                    op: UnaryOp::Negate,
                    arg: Box::new(self.parse_unary()?),
                }
            }
            match_token_types!(TokenType::Tilde) => {
                self.advance();
                ExprKind::Unary {
                    op: UnaryOp::BitNot,
                    arg: Box::new(self.parse_unary()?),
                }
            }
            match_token_types!(TokenType::Bang) => {
                self.advance();
                ExprKind::Unary {
                    op: UnaryOp::LogNot,
                    arg: Box::new(self.parse_unary()?),
                }
            }
            match_token_types!(TokenType::Star) => {
                self.advance();
                ExprKind::Deref(Box::new(self.parse_unary()?))
            }
            match_token_types!(TokenType::Amp) => {
                self.advance();
                ExprKind::AddressOf(Box::new(self.parse_unary()?))
            }
            _ => return self.parse_postfix(),
        };

        Ok(Expr::new(kind))
    }

    fn parse_postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_primary()?;

        while let match_token_types!(TokenType::OpenBracket) = self.peek() {
            self.advance();
            let index = self.parse_expr(0)?;
            self.expect(TokenType::CloseBracket)?;

            expr = Expr::new(ExprKind::ListElem {
                list: Box::new(expr),
                index: Box::new(index),
            });
        }

        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let token = match self.advance() {
            Some(token) => token,
            None => return Err(self.eof_error("an expression")),
        };

        let kind = match token.kind {
            TokenType::Number => match token.value {
                TokenValue::Integer(value) => ExprKind::IntConstant(value),
                _ => unreachable!("number token without integer value"),
            },
            TokenType::True => ExprKind::BoolConstant(true),
            TokenType::False => ExprKind::BoolConstant(false),
            TokenType::Null => ExprKind::Null,
            TokenType::Alloc => {
                let elem_ty = self.parse_type()?;
                self.expect(TokenType::OpenBracket)?;
                let len = self.parse_expr(0)?;
                self.expect(TokenType::CloseBracket)?;
                ExprKind::Alloc {
                    elem_ty,
                    len: Box::new(len),
                }
            }
            TokenType::OpenParen => {
                let expr = self.parse_expr(0)?;
                self.expect(TokenType::CloseParen)?;
                return Ok(expr);
            }
            TokenType::Identifier => {
                let name = match token.value {
                    TokenValue::Ident(name) => name,
                    _ => unreachable!("identifier token without name"),
                };

                match self.peek() {
                    match_token_types!(TokenType::OpenParen) => {
                        self.advance();
                        let args = self.parse_args()?;
                        self.expect(TokenType::CloseParen)?;
                        ExprKind::Call { func: name, args }
                    }
                    _ => ExprKind::Var(name),
                }
            }
            _ => return Err(self.error_at("expected an expression", &token)),
        };

        Ok(Expr::new(kind))
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = vec![];

        if let match_token_types!(TokenType::CloseParen) = self.peek() {
            return Ok(args);
        }

        loop {
            args.push(self.parse_expr(0)?);

            match self.peek() {
                match_token_types!(TokenType::Comma) => {
                    self.advance();
                }
                _ => break,
            }
        }

        Ok(args)
    }

    fn parse_ident(&mut self) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token {
                kind: TokenType::Identifier,
                value: TokenValue::Ident(name),
                ..
            }) => Ok(name),
            Some(token) => Err(self.error_at("expected an identifier", &token)),
            None => Err(self.eof_error("an identifier")),
        }
    }

    fn parse_number(&mut self) -> Result<i64, ParseError> {
        match self.advance() {
            Some(Token {
                kind: TokenType::Number,
                value: TokenValue::Integer(value),
                ..
            }) => Ok(value),
            Some(token) => Err(self.error_at("expected an integer literal", &token)),
            None => Err(self.eof_error("an integer literal")),
        }
    }

    fn expect(&mut self, kind: TokenType) -> Result<Token, ParseError> {
        match self.advance() {
            Some(token) if token.kind == kind => Ok(token),
            Some(token) => Err(self.error_at(&format!("expected {:?}", kind), &token)),
            None => Err(self.eof_error(&format!("{:?}", kind))),
        }
    }

    fn peek(&mut self) -> Option<&Token> {
        self.tokens.peek()
    }

    fn advance(&mut self) -> Option<Token> {
        self.tokens.next()
    }

    fn error_at(&self, message: &str, token: &Token) -> ParseError {
        ParseError::new(format!(
            "{}, found {:?} at {}:{}",
            message, token.kind, token.line, token.col
        ))
    }

    fn eof_error(&self, expected: &str) -> ParseError {
        ParseError::new(format!("expected {}, found end of file", expected))
    }
}

fn binary_op(kind: TokenType) -> Option<(u8, BinaryOp)> {
    let op = match kind {
        TokenType::PipePipe => (1, BinaryOp::LogOr),
        TokenType::AmpAmp => (2, BinaryOp::LogAnd),
        TokenType::Pipe => (3, BinaryOp::BitOr),
        TokenType::Caret => (4, BinaryOp::BitXor),
        TokenType::Amp => (5, BinaryOp::BitAnd),
        TokenType::EqualEqual => (6, BinaryOp::Eq),
        TokenType::BangEqual => (6, BinaryOp::NotEq),
        TokenType::Less => (7, BinaryOp::Less),
        TokenType::LessEqual => (7, BinaryOp::LessEq),
        TokenType::Greater => (7, BinaryOp::Greater),
        TokenType::GreaterEqual => (7, BinaryOp::GreaterEq),
        TokenType::LessLess => (8, BinaryOp::Lshift),
        TokenType::GreaterGreater => (8, BinaryOp::Rshift),
        TokenType::Plus => (9, BinaryOp::Add),
        TokenType::Minus => (9, BinaryOp::Subtract),
        TokenType::Star => (10, BinaryOp::Multiply),
        TokenType::Slash => (10, BinaryOp::Divide),
        TokenType::Percent => (10, BinaryOp::Modulo),
        _ => return None,
    };

    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lexer::Lexer;

    fn parse(src: &str) -> Program {
        let tokens = Lexer::new(src).tokenize();
        Parser::new(tokens).parse().unwrap()
    }

    fn parse_expr_src(src: &str) -> Expr {
        let program = parse(&format!("proc main() {{ x = {}; }}", src));
        match &program.callables[0].body.stmts[0] {
            Stmt::Assign { value, .. } => value.clone(),
            stmt => panic!("expected assignment, got {:?}", stmt),
        }
    }

    #[test]
    fn precedence_mul_over_add() {
        let expr = parse_expr_src("1 + 2 * 3");

        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Add,
                right,
                ..
            } => {
                assert!(matches!(
                    right.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Multiply,
                        ..
                    }
                ));
            }
            kind => panic!("expected addition at the top, got {:?}", kind),
        }
    }

    #[test]
    fn left_associativity() {
        // (1 - 2) - 3
        let expr = parse_expr_src("1 - 2 - 3");

        match expr.kind {
            ExprKind::Binary {
                op: BinaryOp::Subtract,
                left,
                ..
            } => {
                assert!(matches!(
                    left.kind,
                    ExprKind::Binary {
                        op: BinaryOp::Subtract,
                        ..
                    }
                ));
            }
            kind => panic!("expected subtraction at the top, got {:?}", kind),
        }
    }

    #[test]
    fn prefix_amp_is_address_of() {
        let expr = parse_expr_src("&y + 1");

        match expr.kind {
            ExprKind::Binary { op: BinaryOp::Add, left, .. } => {
                assert!(matches!(left.kind, ExprKind::AddressOf(_)));
            }
            kind => panic!("expected addition at the top, got {:?}", kind),
        }
    }

    #[test]
    fn postfix_index_binds_tighter_than_deref() {
        // *p[0] is *(p[0])
        let expr = parse_expr_src("*p[0]");

        match expr.kind {
            ExprKind::Deref(inner) => {
                assert!(matches!(inner.kind, ExprKind::ListElem { .. }));
            }
            kind => panic!("expected deref at the top, got {:?}", kind),
        }
    }

    #[test]
    fn pointer_and_list_types() {
        let program = parse("proc main() { var p = null : int64*; var a = 0 : bool[4]; }");

        match &program.callables[0].body.stmts[0] {
            Stmt::Declare { ty, .. } => assert_eq!(*ty, Type::pointer(Type::Int64)),
            stmt => panic!("expected declaration, got {:?}", stmt),
        }
        match &program.callables[0].body.stmts[1] {
            Stmt::Declare { ty, .. } => assert_eq!(*ty, Type::list(Type::Bool, 4)),
            stmt => panic!("expected declaration, got {:?}", stmt),
        }
    }

    #[test]
    fn grouped_params() {
        let program = parse("fun add(x, y : int64, b : bool) : int64 { return x; }");

        assert_eq!(
            program.callables[0].params,
            vec![
                ("x".to_string(), Type::Int64),
                ("y".to_string(), Type::Int64),
                ("b".to_string(), Type::Bool),
            ]
        );
    }

    #[test]
    fn alloc_expression() {
        let expr = parse_expr_src("alloc int64[3]");

        match expr.kind {
            ExprKind::Alloc { elem_ty, len } => {
                assert_eq!(elem_ty, Type::Int64);
                assert_eq!(len.kind, ExprKind::IntConstant(3));
            }
            kind => panic!("expected alloc, got {:?}", kind),
        }
    }

    #[test]
    fn globals_and_callables() {
        let program = parse("var g = 7 : int64; proc main() { print g; }");

        assert_eq!(program.globals.len(), 1);
        assert_eq!(program.globals[0].name, "g");
        assert_eq!(program.callables[0].name, "main");
    }

    #[test]
    fn rejects_stray_token() {
        let tokens = Lexer::new("proc main() { print 1; } }").tokenize();
        assert!(Parser::new(tokens).parse().is_err());
    }
}
