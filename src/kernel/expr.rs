//! Arithmetic expressions used for output sizes and workgroup counts.
//!
//! Expressions are parsed once when a kernel is compiled and evaluated on
//! every run against the kernel's parameter environment.

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Num(f64),
    Var(String),
    Neg(Box<Expr>),
    Bin(Op, Box<Expr>, Box<Expr>),
    Call(Func, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Func {
    Ceil,
    Floor,
    Max,
    Min,
}

impl Func {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "ceil" => Some(Self::Ceil),
            "floor" => Some(Self::Floor),
            "max" => Some(Self::Max),
            "min" => Some(Self::Min),
            _ => None,
        }
    }

    const fn arity(self) -> usize {
        match self {
            Self::Ceil | Self::Floor => 1,
            Self::Max | Self::Min => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Sym(char),
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| format!("bad number \"{text}\""))?;
            tokens.push(Token::Num(value));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if "+-*/(),".contains(c) {
            tokens.push(Token::Sym(c));
            i += 1;
        } else {
            return Err(format!("unexpected character '{c}'"));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, sym: char) -> bool {
        if self.peek() == Some(&Token::Sym(sym)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, sym: char) -> std::result::Result<(), String> {
        if self.eat(sym) {
            Ok(())
        } else {
            Err(format!("expected '{sym}'"))
        }
    }

    fn sum(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.product()?;
        loop {
            let op = if self.eat('+') {
                Op::Add
            } else if self.eat('-') {
                Op::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.product()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn product(&mut self) -> std::result::Result<Expr, String> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat('*') {
                Op::Mul
            } else if self.eat('/') {
                Op::Div
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Bin(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> std::result::Result<Expr, String> {
        if self.eat('-') {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> std::result::Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::Num(n)) => {
                self.pos += 1;
                Ok(Expr::Num(n))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if !self.eat('(') {
                    return Ok(Expr::Var(name));
                }
                let func =
                    Func::from_name(&name).ok_or_else(|| format!("unknown function \"{name}\""))?;
                let mut args = vec![self.sum()?];
                while self.eat(',') {
                    args.push(self.sum()?);
                }
                self.expect(')')?;
                if args.len() != func.arity() {
                    return Err(format!(
                        "{name} takes {} argument(s), got {}",
                        func.arity(),
                        args.len()
                    ));
                }
                Ok(Expr::Call(func, args))
            }
            Some(Token::Sym('(')) => {
                self.pos += 1;
                let inner = self.sum()?;
                self.expect(')')?;
                Ok(inner)
            }
            Some(Token::Sym(c)) => Err(format!("unexpected '{c}'")),
            None => Err("unexpected end of expression".into()),
        }
    }
}

impl Expr {
    /// Parses `src` into an expression tree.
    pub fn parse(src: &str) -> Result<Self> {
        let fail = |reason: String| Error::Expr {
            source_text: src.to_owned(),
            reason,
        };
        let tokens = tokenize(src).map_err(fail)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.sum().map_err(fail)?;
        if parser.pos != parser.tokens.len() {
            return Err(fail("trailing input".into()));
        }
        Ok(expr)
    }

    /// Evaluates the expression, resolving identifiers through `lookup`.
    ///
    /// Fails with the name of the first identifier `lookup` cannot resolve.
    pub fn eval(&self, lookup: &impl Fn(&str) -> Option<f64>) -> std::result::Result<f64, String> {
        Ok(match self {
            Self::Num(n) => *n,
            Self::Var(name) => lookup(name).ok_or_else(|| name.clone())?,
            Self::Neg(inner) => -inner.eval(lookup)?,
            Self::Bin(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(lookup)?, rhs.eval(lookup)?);
                match op {
                    Op::Add => a + b,
                    Op::Sub => a - b,
                    Op::Mul => a * b,
                    Op::Div => a / b,
                }
            }
            Self::Call(func, args) => {
                let a = args[0].eval(lookup)?;
                match func {
                    Func::Ceil => a.ceil(),
                    Func::Floor => a.floor(),
                    Func::Max => a.max(args[1].eval(lookup)?),
                    Func::Min => a.min(args[1].eval(lookup)?),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(name: &str) -> Option<f64> {
        match name {
            "size" => Some(1000.0),
            "workgroupSize" => Some(256.0),
            "resultRows" => Some(3.0),
            "resultCols" => Some(4.0),
            _ => None,
        }
    }

    #[test]
    fn workgroup_count_rounds_up() {
        let e = Expr::parse("ceil(size / workgroupSize)").unwrap();
        assert_eq!(e.eval(&env).unwrap(), 4.0);
    }

    #[test]
    fn precedence_and_parens() {
        assert_eq!(Expr::parse("1 + 2 * 3").unwrap().eval(&env).unwrap(), 7.0);
        assert_eq!(Expr::parse("(1 + 2) * 3").unwrap().eval(&env).unwrap(), 9.0);
        assert_eq!(Expr::parse("-2 + max(1, 5)").unwrap().eval(&env).unwrap(), 3.0);
        assert_eq!(
            Expr::parse("resultRows * resultCols").unwrap().eval(&env).unwrap(),
            12.0
        );
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let e = Expr::parse("size * missing").unwrap();
        assert_eq!(e.eval(&env).unwrap_err(), "missing");
    }

    #[test]
    fn malformed_expressions_fail_to_parse() {
        for bad in ["", "1 +", "ceil(1, 2)", "(size", "size $ 2", "sqrt(4)"] {
            assert!(matches!(Expr::parse(bad), Err(Error::Expr { .. })), "{bad}");
        }
    }
}
