//! Lazy expression language
//!
//! Elementwise arithmetic over named operands:
//!
//! ```text
//! expr  := term (('+' | '-') term)*
//! term  := unary (('*' | '/') unary)*
//! unary := ('-' | '+') unary | power
//! power := atom ('**' unary)?
//! atom  := number | name | '(' expr ')'
//! ```
//!
//! Scalars broadcast against arrays; array operands must share a shape.

use std::collections::{BTreeMap, BTreeSet};

use crate::container::NdArray;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    fn apply(&self, a: f64, b: f64) -> f64 {
        match self {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div => a / b,
            BinOp::Pow => a.powf(b),
        }
    }
}

/// Parsed expression tree
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Name(String),
    Op(char),
    Pow,
    LParen,
    RParen,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '*' if chars.get(i + 1) == Some(&'*') => {
                tokens.push(Token::Pow);
                i += 2;
            }
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // exponent: 1e5, 2.5E-3
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        i = j;
                        while i < chars.len() && chars[i].is_ascii_digit() {
                            i += 1;
                        }
                    }
                }
                let text: String = chars[start..i].iter().collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| Error::Expression(format!("bad number {:?}", text)))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Name(chars[start..i].iter().collect()));
            }
            other => {
                return Err(Error::Expression(format!(
                    "unexpected character {:?} in {:?}",
                    other, src
                )));
            }
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

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut lhs = self.term()?;
        while let Some(Token::Op(c @ ('+' | '-'))) = self.peek() {
            let op = if *c == '+' { BinOp::Add } else { BinOp::Sub };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while let Some(Token::Op(c @ ('*' | '/'))) = self.peek() {
            let op = if *c == '*' { BinOp::Mul } else { BinOp::Div };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(Expr::Neg(Box::new(self.unary()?)))
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr> {
        let base = self.atom()?;
        if let Some(Token::Pow) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Name(n)) => Ok(Expr::Var(n)),
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(Error::Expression("missing ')'".into())),
                }
            }
            Some(t) => Err(Error::Expression(format!("unexpected token {:?}", t))),
            None => Err(Error::Expression("unexpected end of expression".into())),
        }
    }
}

/// Intermediate evaluation value
enum Value {
    Scalar(f64),
    Array(Vec<u64>, Vec<f64>),
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr> {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        let expr = parser.expr()?;
        if let Some(t) = parser.peek() {
            return Err(Error::Expression(format!("trailing token {:?} in {:?}", t, src)));
        }
        Ok(expr)
    }

    /// Names of all variables referenced
    pub fn variables(&self) -> BTreeSet<&str> {
        let mut out = BTreeSet::new();
        self.collect_vars(&mut out);
        out
    }

    fn collect_vars<'a>(&'a self, out: &mut BTreeSet<&'a str>) {
        match self {
            Expr::Number(_) => {}
            Expr::Var(n) => {
                out.insert(n.as_str());
            }
            Expr::Neg(e) => e.collect_vars(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_vars(out);
                rhs.collect_vars(out);
            }
        }
    }

    /// Evaluate elementwise; a scalar result is broadcast to `shape`
    pub fn evaluate(&self, operands: &BTreeMap<String, NdArray>, shape: &[u64]) -> Result<NdArray> {
        match self.eval(operands)? {
            Value::Array(s, data) if s.as_slice() == shape || data.len() != 1 => {
                Ok(NdArray::from_f64(s, &data))
            }
            Value::Array(_, data) => {
                let n = shape.iter().product::<u64>() as usize;
                Ok(NdArray::from_f64(shape.to_vec(), &vec![data[0]; n]))
            }
            Value::Scalar(v) => {
                let n = shape.iter().product::<u64>() as usize;
                Ok(NdArray::from_f64(shape.to_vec(), &vec![v; n]))
            }
        }
    }

    fn eval(&self, operands: &BTreeMap<String, NdArray>) -> Result<Value> {
        match self {
            Expr::Number(v) => Ok(Value::Scalar(*v)),
            Expr::Var(name) => {
                let arr = operands
                    .get(name)
                    .ok_or_else(|| Error::Expression(format!("unbound variable {:?}", name)))?;
                Ok(Value::Array(arr.shape.clone(), arr.to_f64()))
            }
            Expr::Neg(e) => Ok(match e.eval(operands)? {
                Value::Scalar(v) => Value::Scalar(-v),
                Value::Array(s, d) => Value::Array(s, d.into_iter().map(|v| -v).collect()),
            }),
            Expr::Binary { op, lhs, rhs } => {
                let (l, r) = (lhs.eval(operands)?, rhs.eval(operands)?);
                match (l, r) {
                    (Value::Scalar(a), Value::Scalar(b)) => Ok(Value::Scalar(op.apply(a, b))),
                    (Value::Array(s, d), Value::Scalar(b)) => {
                        Ok(Value::Array(s, d.into_iter().map(|a| op.apply(a, b)).collect()))
                    }
                    (Value::Scalar(a), Value::Array(s, d)) => {
                        Ok(Value::Array(s, d.into_iter().map(|b| op.apply(a, b)).collect()))
                    }
                    // a single-element array broadcasts like a scalar
                    (Value::Array(sa, da), Value::Array(sb, db)) if sa != sb && db.len() == 1 => {
                        Ok(Value::Array(sa, da.into_iter().map(|a| op.apply(a, db[0])).collect()))
                    }
                    (Value::Array(sa, da), Value::Array(sb, db)) if sa != sb && da.len() == 1 => {
                        Ok(Value::Array(sb, db.into_iter().map(|b| op.apply(da[0], b)).collect()))
                    }
                    (Value::Array(sa, da), Value::Array(sb, db)) => {
                        if sa != sb {
                            return Err(Error::Expression(format!(
                                "shape mismatch: {:?} vs {:?}",
                                sa, sb
                            )));
                        }
                        let data = da.iter().zip(&db).map(|(a, b)| op.apply(*a, *b)).collect();
                        Ok(Value::Array(sa, data))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arr(values: &[f64]) -> NdArray {
        NdArray::from_f64(vec![values.len() as u64], values)
    }

    #[test]
    fn test_precedence() {
        let e = Expr::parse("1 + 2 * 3 ** 2").unwrap();
        let out = e.evaluate(&BTreeMap::new(), &[]).unwrap();
        assert_eq!(out.to_f64(), vec![19.0]);

        let e = Expr::parse("-2 ** 2").unwrap();
        assert_eq!(e.evaluate(&BTreeMap::new(), &[]).unwrap().to_f64(), vec![-4.0]);

        let e = Expr::parse("(1 + 2) * 3 - 4 / 2").unwrap();
        assert_eq!(e.evaluate(&BTreeMap::new(), &[]).unwrap().to_f64(), vec![7.0]);
    }

    #[test]
    fn test_array_operands() {
        let e = Expr::parse("a * 2 + b").unwrap();
        assert_eq!(e.variables().into_iter().collect::<Vec<_>>(), vec!["a", "b"]);

        let mut ops = BTreeMap::new();
        ops.insert("a".to_string(), arr(&[1.0, 2.0, 3.0]));
        ops.insert("b".to_string(), arr(&[10.0, 20.0, 30.0]));
        let out = e.evaluate(&ops, &[3]).unwrap();
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.to_f64(), vec![12.0, 24.0, 36.0]);
    }

    #[test]
    fn test_scalar_broadcast_to_shape() {
        let out = Expr::parse("1.5e1").unwrap().evaluate(&BTreeMap::new(), &[2, 2]).unwrap();
        assert_eq!(out.shape, vec![2, 2]);
        assert_eq!(out.to_f64(), vec![15.0; 4]);
    }

    #[test]
    fn test_single_element_array_broadcasts() {
        let mut ops = BTreeMap::new();
        ops.insert("a".to_string(), arr(&[1.0, 2.0, 3.0]));
        ops.insert("s".to_string(), NdArray::from_f64(vec![], &[10.0]));
        ops.insert("t".to_string(), NdArray::from_f64(vec![1, 1], &[2.0]));

        let out = Expr::parse("a * t + s").unwrap().evaluate(&ops, &[3]).unwrap();
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.to_f64(), vec![12.0, 14.0, 16.0]);

        let out = Expr::parse("s - a").unwrap().evaluate(&ops, &[3]).unwrap();
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.to_f64(), vec![9.0, 8.0, 7.0]);

        let out = Expr::parse("t * 2").unwrap().evaluate(&ops, &[3]).unwrap();
        assert_eq!(out.shape, vec![3]);
        assert_eq!(out.to_f64(), vec![4.0, 4.0, 4.0]);
    }

    #[test]
    fn test_errors() {
        assert!(Expr::parse("a +").is_err());
        assert!(Expr::parse("(a + 1").is_err());
        assert!(Expr::parse("a $ b").is_err());
        assert!(Expr::parse("a b").is_err());

        let mut ops = BTreeMap::new();
        ops.insert("a".to_string(), arr(&[1.0, 2.0]));
        ops.insert("b".to_string(), arr(&[1.0, 2.0, 3.0]));
        assert!(Expr::parse("a + b").unwrap().evaluate(&ops, &[2]).is_err());
        assert!(Expr::parse("c").unwrap().evaluate(&ops, &[2]).is_err());
    }
}
