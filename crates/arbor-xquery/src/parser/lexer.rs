//! Tokenizer.

use crate::error::{XQueryError, XQueryResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    Str(String),
    Int(i64),
    /// An NCName or a prefixed name.
    Name(String),
    Dollar,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Assign,
    Equals,
    Concat,
    Eof,
}

impl Token {
    pub(crate) fn describe(&self) -> String {
        match self {
            Token::Str(s) => format!("string \"{s}\""),
            Token::Int(i) => format!("integer {i}"),
            Token::Name(n) => format!("'{n}'"),
            Token::Dollar => "'$'".to_string(),
            Token::LParen => "'('".to_string(),
            Token::RParen => "')'".to_string(),
            Token::LBrace => "'{'".to_string(),
            Token::RBrace => "'}'".to_string(),
            Token::Comma => "','".to_string(),
            Token::Semicolon => "';'".to_string(),
            Token::Assign => "':='".to_string(),
            Token::Equals => "'='".to_string(),
            Token::Concat => "'||'".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

/// Line and column of a token, both 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pos {
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub token: Token,
    pub pos: Pos,
}

struct Lexer {
    chars: Vec<char>,
    offset: usize,
    line: usize,
    column: usize,
}

pub(crate) fn tokenize(source: &str) -> XQueryResult<Vec<Spanned>> {
    let mut lexer = Lexer {
        chars: source.chars().collect(),
        offset: 0,
        line: 1,
        column: 1,
    };
    let mut tokens = Vec::new();
    loop {
        lexer.skip_trivia()?;
        let pos = lexer.pos();
        let token = lexer.next_token()?;
        let done = token == Token::Eof;
        tokens.push(Spanned { token, pos });
        if done {
            return Ok(tokens);
        }
    }
}

fn is_name_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | '-' | '.')
}

impl Lexer {
    fn pos(&self) -> Pos {
        Pos {
            line: self.line,
            column: self.column,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.offset).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.offset + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.offset += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(&self, message: impl Into<String>) -> XQueryError {
        XQueryError::compile(self.line, self.column, message)
    }

    /// Skips whitespace and `(: comments :)`, which nest.
    fn skip_trivia(&mut self) -> XQueryResult<()> {
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(c), _) if c.is_whitespace() => {
                    self.bump();
                }
                (Some('('), Some(':')) => {
                    let start = self.pos();
                    self.bump();
                    self.bump();
                    let mut depth = 1;
                    while depth > 0 {
                        match (self.bump(), self.peek()) {
                            (Some('('), Some(':')) => {
                                self.bump();
                                depth += 1;
                            }
                            (Some(':'), Some(')')) => {
                                self.bump();
                                depth -= 1;
                            }
                            (Some(_), _) => {}
                            (None, _) => {
                                return Err(XQueryError::compile(
                                    start.line,
                                    start.column,
                                    "unterminated comment",
                                ))
                            }
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn next_token(&mut self) -> XQueryResult<Token> {
        let Some(c) = self.peek() else {
            return Ok(Token::Eof);
        };

        let token = match c {
            '"' | '\'' => return self.string(c),
            '0'..='9' => return self.integer(),
            c if is_name_start(c) => return Ok(self.name()),
            '$' => Token::Dollar,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            ';' => Token::Semicolon,
            '=' => Token::Equals,
            ':' if self.peek_at(1) == Some('=') => {
                self.bump();
                Token::Assign
            }
            '|' if self.peek_at(1) == Some('|') => {
                self.bump();
                Token::Concat
            }
            other => return Err(self.error(format!("unexpected character '{other}'"))),
        };
        self.bump();
        Ok(token)
    }

    /// A string literal. The delimiter is escaped by doubling it.
    fn string(&mut self, quote: char) -> XQueryResult<Token> {
        let start = self.pos();
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                Some(c) if c == quote => {
                    if self.peek() == Some(quote) {
                        self.bump();
                        value.push(quote);
                    } else {
                        return Ok(Token::Str(value));
                    }
                }
                Some(c) => value.push(c),
                None => {
                    return Err(XQueryError::compile(
                        start.line,
                        start.column,
                        "unterminated string literal",
                    ))
                }
            }
        }
    }

    fn integer(&mut self) -> XQueryResult<Token> {
        let start = self.pos();
        let mut digits = String::new();
        while let Some(c) = self.peek().filter(char::is_ascii_digit) {
            digits.push(c);
            self.bump();
        }
        digits
            .parse()
            .map(Token::Int)
            .map_err(|_| XQueryError::compile(start.line, start.column, "integer literal out of range"))
    }

    /// An NCName, or `prefix:local` when a name follows the colon directly.
    fn name(&mut self) -> Token {
        let mut name = String::new();
        while let Some(c) = self.peek().filter(|c| is_name_char(*c)) {
            name.push(c);
            self.bump();
        }
        if self.peek() == Some(':') && self.peek_at(1).is_some_and(is_name_start) {
            name.push(':');
            self.bump();
            while let Some(c) = self.peek().filter(|c| is_name_char(*c)) {
                name.push(c);
                self.bump();
            }
        }
        Token::Name(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn test_declaration() {
        assert_eq!(
            tokens("declare variable $t:VAR := 123;"),
            vec![
                Token::Name("declare".to_string()),
                Token::Name("variable".to_string()),
                Token::Dollar,
                Token::Name("t:VAR".to_string()),
                Token::Assign,
                Token::Int(123),
                Token::Semicolon,
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_assign_without_spaces() {
        assert_eq!(
            tokens("$a:=1"),
            vec![
                Token::Dollar,
                Token::Name("a".to_string()),
                Token::Assign,
                Token::Int(1),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_comments() {
        assert_eq!(
            tokens("(: outer (: inner :) :) 'it''s' || \"a\"\"b\""),
            vec![
                Token::Str("it's".to_string()),
                Token::Concat,
                Token::Str("a\"b".to_string()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn test_positions() {
        let spanned = tokenize("let\n  $a").unwrap();
        assert_eq!(spanned[1].pos, Pos { line: 2, column: 3 });
    }

    #[test]
    fn test_errors() {
        let err = tokenize("\"open").unwrap_err();
        assert!(matches!(err, XQueryError::Compile { line: 1, column: 1, .. }));
        assert!(tokenize("(: never closed").is_err());
        assert!(matches!(
            tokenize("1 + 2").unwrap_err(),
            XQueryError::Compile { column: 3, .. }
        ));
    }
}
