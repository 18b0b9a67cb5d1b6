//! Recursive-descent parser producing a syntax tree.
//!
//! ```text
//! Module      := VersionDecl? ModuleDecl? (Prolog ";")* Expr?
//! Prolog      := "import" "module" "namespace" NCName "=" String ("at" String)?
//!              | "declare" "namespace" NCName "=" String
//!              | "declare" "variable" "$" QName (":=" ExprSingle | "external")
//!              | "declare" "function" QName "(" Params? ")" "{" Expr? "}"
//! Expr        := ExprSingle ("," ExprSingle)*
//! ExprSingle  := ("let" "$" NCName ":=" ExprSingle)+ "return" ExprSingle
//!              | ConcatExpr
//! ConcatExpr  := PostfixExpr ("||" PostfixExpr)*
//! PostfixExpr := Primary ("(" Args? ")")*
//! Primary     := String | Integer | "$" QName | "(" Expr? ")"
//!              | "function" "(" Params? ")" "{" Expr? "}"
//!              | QName "(" Args? ")"
//! ```

use super::lexer::{tokenize, Pos, Spanned, Token};
use crate::error::{XQueryError, XQueryResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Ast {
    Str(String),
    Int(i64),
    Empty,
    Seq(Vec<Ast>),
    Concat(Vec<Ast>),
    Var {
        name: String,
        pos: Pos,
    },
    Let {
        bindings: Vec<(String, Ast)>,
        body: Box<Ast>,
    },
    Call {
        name: String,
        args: Vec<Ast>,
        pos: Pos,
    },
    Inline {
        params: Vec<String>,
        body: Box<Ast>,
    },
    Dynamic {
        target: Box<Ast>,
        args: Vec<Ast>,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct VariableAst {
    pub name: String,
    pub init: Option<Ast>,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionAst {
    pub name: String,
    pub params: Vec<String>,
    pub body: Ast,
    pub pos: Pos,
}

#[derive(Debug, Clone)]
pub(crate) struct ImportAst {
    pub prefix: String,
    pub namespace: String,
    pub pos: Pos,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ModuleAst {
    /// `(prefix, namespace)` of a library module.
    pub target: Option<(String, String)>,
    pub imports: Vec<ImportAst>,
    pub namespaces: Vec<(String, String)>,
    pub variables: Vec<VariableAst>,
    pub functions: Vec<FunctionAst>,
    pub body: Option<Ast>,
}

static EOF: Token = Token::Eof;

/// Deepest expression nesting a query may use.
pub(crate) const MAX_NESTING_DEPTH: usize = 128;

pub(crate) fn parse_module(source: &str) -> XQueryResult<ModuleAst> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        index: 0,
        depth: 0,
    };
    parser.module()
}

struct Parser {
    tokens: Vec<Spanned>,
    index: usize,
    /// Expressions currently open.
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, ahead: usize) -> &Token {
        self.tokens
            .get(self.index + ahead)
            .or_else(|| self.tokens.last())
            .map_or(&EOF, |s| &s.token)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.index)
            .or_else(|| self.tokens.last())
            .map_or(Pos { line: 1, column: 1 }, |s| s.pos)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.index < self.tokens.len() {
            self.index += 1;
        }
        token
    }

    fn error(&self, message: impl Into<String>) -> XQueryError {
        let pos = self.pos();
        XQueryError::compile(pos.line, pos.column, message)
    }

    fn unexpected(&self, expected: &str) -> XQueryError {
        self.error(format!("expected {expected}, found {}", self.peek().describe()))
    }

    fn expect(&mut self, token: Token) -> XQueryResult<()> {
        if *self.peek() == token {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&token.describe()))
        }
    }

    fn is_keyword(&self, ahead: usize, keyword: &str) -> bool {
        matches!(self.peek_at(ahead), Token::Name(n) if n == keyword)
    }

    fn expect_keyword(&mut self, keyword: &str) -> XQueryResult<()> {
        if self.is_keyword(0, keyword) {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(&format!("'{keyword}'")))
        }
    }

    fn name(&mut self) -> XQueryResult<String> {
        match self.peek() {
            Token::Name(name) => {
                let name = name.clone();
                self.advance();
                Ok(name)
            }
            _ => Err(self.unexpected("a name")),
        }
    }

    fn ncname(&mut self) -> XQueryResult<String> {
        let pos = self.pos();
        let name = self.name()?;
        if name.contains(':') {
            return Err(XQueryError::compile(
                pos.line,
                pos.column,
                format!("expected an unprefixed name, found '{name}'"),
            ));
        }
        Ok(name)
    }

    fn string(&mut self) -> XQueryResult<String> {
        match self.peek() {
            Token::Str(s) => {
                let s = s.clone();
                self.advance();
                Ok(s)
            }
            _ => Err(self.unexpected("a string literal")),
        }
    }

    fn module(&mut self) -> XQueryResult<ModuleAst> {
        let mut module = ModuleAst::default();

        if self.is_keyword(0, "xquery") && self.is_keyword(1, "version") {
            self.advance();
            self.advance();
            self.string()?;
            self.expect(Token::Semicolon)?;
        }

        if self.is_keyword(0, "module") && self.is_keyword(1, "namespace") {
            self.advance();
            self.advance();
            let prefix = self.ncname()?;
            self.expect(Token::Equals)?;
            let namespace = self.string()?;
            self.expect(Token::Semicolon)?;
            module.target = Some((prefix, namespace));
        }

        self.prolog(&mut module)?;

        if *self.peek() != Token::Eof {
            if module.target.is_some() {
                return Err(self.error("a library module cannot have a query body"));
            }
            module.body = Some(self.expr()?);
        }
        if *self.peek() != Token::Eof {
            return Err(self.unexpected("end of input"));
        }
        if module.target.is_none() && module.body.is_none() {
            return Err(self.error("expected a query body"));
        }
        Ok(module)
    }

    fn prolog(&mut self, module: &mut ModuleAst) -> XQueryResult<()> {
        loop {
            let pos = self.pos();
            if self.is_keyword(0, "import") && self.is_keyword(1, "module") {
                self.advance();
                self.advance();
                self.expect_keyword("namespace")?;
                let prefix = self.ncname()?;
                self.expect(Token::Equals)?;
                let namespace = self.string()?;
                if self.is_keyword(0, "at") {
                    self.advance();
                    self.string()?;
                }
                module.imports.push(ImportAst {
                    prefix,
                    namespace,
                    pos,
                });
            } else if self.is_keyword(0, "declare") && self.is_keyword(1, "namespace") {
                self.advance();
                self.advance();
                let prefix = self.ncname()?;
                self.expect(Token::Equals)?;
                let namespace = self.string()?;
                module.namespaces.push((prefix, namespace));
            } else if self.is_keyword(0, "declare") && self.is_keyword(1, "variable") {
                self.advance();
                self.advance();
                self.expect(Token::Dollar)?;
                let name = self.name()?;
                let init = if self.is_keyword(0, "external") {
                    self.advance();
                    None
                } else {
                    self.expect(Token::Assign)?;
                    Some(self.expr_single()?)
                };
                module.variables.push(VariableAst { name, init, pos });
            } else if self.is_keyword(0, "declare") && self.is_keyword(1, "function") {
                self.advance();
                self.advance();
                let name = self.name()?;
                let params = self.params()?;
                let body = self.enclosed()?;
                module.functions.push(FunctionAst {
                    name,
                    params,
                    body,
                    pos,
                });
            } else {
                return Ok(());
            }
            self.expect(Token::Semicolon)?;
        }
    }

    /// `"(" ("$" NCName ("," "$" NCName)*)? ")"`
    fn params(&mut self) -> XQueryResult<Vec<String>> {
        self.expect(Token::LParen)?;
        let mut params = Vec::new();
        if *self.peek() != Token::RParen {
            loop {
                self.expect(Token::Dollar)?;
                let pos = self.pos();
                let name = self.ncname()?;
                if params.contains(&name) {
                    return Err(XQueryError::compile(
                        pos.line,
                        pos.column,
                        format!("duplicate parameter ${name}"),
                    ));
                }
                params.push(name);
                if *self.peek() != Token::Comma {
                    break;
                }
                self.advance();
            }
        }
        self.expect(Token::RParen)?;
        Ok(params)
    }

    /// `"{" Expr? "}"`
    fn enclosed(&mut self) -> XQueryResult<Ast> {
        self.expect(Token::LBrace)?;
        let body = if *self.peek() == Token::RBrace {
            Ast::Empty
        } else {
            self.expr()?
        };
        self.expect(Token::RBrace)?;
        Ok(body)
    }

    fn args(&mut self) -> XQueryResult<Vec<Ast>> {
        self.expect(Token::LParen)?;
        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            loop {
                args.push(self.expr_single()?);
                if *self.peek() != Token::Comma {
                    break;
                }
                self.advance();
            }
        }
        self.expect(Token::RParen)?;
        Ok(args)
    }

    fn expr(&mut self) -> XQueryResult<Ast> {
        let first = self.expr_single()?;
        if *self.peek() != Token::Comma {
            return Ok(first);
        }
        let mut items = vec![first];
        while *self.peek() == Token::Comma {
            self.advance();
            items.push(self.expr_single()?);
        }
        Ok(Ast::Seq(items))
    }

    fn expr_single(&mut self) -> XQueryResult<Ast> {
        if self.depth >= MAX_NESTING_DEPTH {
            return Err(self.error("expression nested too deeply"));
        }
        self.depth += 1;
        let result = self.let_or_concat();
        self.depth -= 1;
        result
    }

    fn let_or_concat(&mut self) -> XQueryResult<Ast> {
        if !(self.is_keyword(0, "let") && *self.peek_at(1) == Token::Dollar) {
            return self.concat();
        }

        let outer = self.depth;
        let result = self.let_chain();
        self.depth = outer;
        result
    }

    /// Each binding nests the rest of the chain, so each one counts as a
    /// level.
    fn let_chain(&mut self) -> XQueryResult<Ast> {
        let mut bindings = Vec::new();
        while self.is_keyword(0, "let") {
            if self.depth >= MAX_NESTING_DEPTH {
                return Err(self.error("expression nested too deeply"));
            }
            self.depth += 1;
            self.advance();
            self.expect(Token::Dollar)?;
            let name = self.ncname()?;
            self.expect(Token::Assign)?;
            bindings.push((name, self.expr_single()?));
        }
        self.expect_keyword("return")?;
        let body = self.expr_single()?;
        Ok(Ast::Let {
            bindings,
            body: Box::new(body),
        })
    }

    fn concat(&mut self) -> XQueryResult<Ast> {
        let first = self.postfix()?;
        if *self.peek() != Token::Concat {
            return Ok(first);
        }
        let mut operands = vec![first];
        while *self.peek() == Token::Concat {
            self.advance();
            operands.push(self.postfix()?);
        }
        Ok(Ast::Concat(operands))
    }

    fn postfix(&mut self) -> XQueryResult<Ast> {
        let mut expr = self.primary()?;
        let mut depth = self.depth;
        while *self.peek() == Token::LParen {
            if depth >= MAX_NESTING_DEPTH {
                return Err(self.error("expression nested too deeply"));
            }
            depth += 1;
            let args = self.args()?;
            expr = Ast::Dynamic {
                target: Box::new(expr),
                args,
            };
        }
        Ok(expr)
    }

    fn primary(&mut self) -> XQueryResult<Ast> {
        let pos = self.pos();
        match self.peek().clone() {
            Token::Str(s) => {
                self.advance();
                Ok(Ast::Str(s))
            }
            Token::Int(i) => {
                self.advance();
                Ok(Ast::Int(i))
            }
            Token::Dollar => {
                self.advance();
                let name = self.name()?;
                Ok(Ast::Var { name, pos })
            }
            Token::LParen => {
                self.advance();
                if *self.peek() == Token::RParen {
                    self.advance();
                    return Ok(Ast::Empty);
                }
                let expr = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Token::Name(name) if name == "function" && *self.peek_at(1) == Token::LParen => {
                self.advance();
                let params = self.params()?;
                let body = self.enclosed()?;
                Ok(Ast::Inline {
                    params,
                    body: Box::new(body),
                })
            }
            Token::Name(name) if *self.peek_at(1) == Token::LParen => {
                self.advance();
                let args = self.args()?;
                Ok(Ast::Call { name, args, pos })
            }
            _ => Err(self.unexpected("an expression")),
        }
    }
}
