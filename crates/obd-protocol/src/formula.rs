//! Arithmetic formulas over response bytes
//!
//! PID tables describe conversions as small expressions such as
//! `(A*256+B)/4`, where `A` is the first data byte after the echoed
//! mode/PID, `B` the second, and so on. Formulas are compiled once and
//! evaluated per response.

use std::fmt;
use std::iter::Peekable;
use std::str::{CharIndices, FromStr};

use crate::error::FormulaError;

/// Longest formula text accepted
const MAX_FORMULA_LEN: usize = 256;

/// Deepest parenthesis or unary nesting accepted
const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(f64),
    Byte(char),
    Neg(Box<Expr>),
    Binary(Op, Box<Expr>, Box<Expr>),
}

impl Expr {
    fn eval(&self, bytes: &[u8]) -> Result<f64, FormulaError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Byte(var) => {
                let index = (*var as u8 - b'A') as usize;
                bytes
                    .get(index)
                    .map(|b| f64::from(*b))
                    .ok_or(FormulaError::MissingByte {
                        variable: *var,
                        available: bytes.len(),
                    })
            }
            Expr::Neg(inner) => Ok(-inner.eval(bytes)?),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(bytes)?;
                let r = rhs.eval(bytes)?;
                match op {
                    Op::Add => Ok(l + r),
                    Op::Sub => Ok(l - r),
                    Op::Mul => Ok(l * r),
                    Op::Div if r == 0.0 => Err(FormulaError::DivisionByZero),
                    Op::Div => Ok(l / r),
                }
            }
        }
    }

    fn highest_byte(&self) -> Option<char> {
        match self {
            Expr::Number(_) => None,
            Expr::Byte(var) => Some(*var),
            Expr::Neg(inner) => inner.highest_byte(),
            Expr::Binary(_, lhs, rhs) => lhs.highest_byte().max(rhs.highest_byte()),
        }
    }
}

/// A compiled conversion formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    /// Evaluate against the data bytes of a response
    pub fn evaluate(&self, bytes: &[u8]) -> Result<f64, FormulaError> {
        self.expr.eval(bytes)
    }

    /// Number of data bytes the formula reads
    pub fn bytes_needed(&self) -> usize {
        self.expr
            .highest_byte()
            .map(|var| (var as u8 - b'A') as usize + 1)
            .unwrap_or(0)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Formula {
    type Err = FormulaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() > MAX_FORMULA_LEN {
            return Err(FormulaError::Syntax {
                offset: MAX_FORMULA_LEN,
                message: format!("formula longer than {} characters", MAX_FORMULA_LEN),
            });
        }
        let mut parser = Parser {
            chars: s.char_indices().peekable(),
            len: s.len(),
            depth: 0,
        };
        let expr = parser.expression()?;
        parser.skip_whitespace();
        if let Some((offset, c)) = parser.chars.peek().copied() {
            return Err(FormulaError::Syntax {
                offset,
                message: format!("unexpected '{}'", c),
            });
        }
        Ok(Formula {
            source: s.trim().to_string(),
            expr,
        })
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for Formula {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Formula {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

struct Parser<'a> {
    chars: Peekable<CharIndices<'a>>,
    len: usize,
    depth: usize,
}

impl Parser<'_> {
    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some((_, c)) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.skip_whitespace();
        self.chars.peek().copied()
    }

    fn offset(&mut self) -> usize {
        self.peek().map(|(i, _)| i).unwrap_or(self.len)
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, FormulaError>,
    ) -> Result<T, FormulaError> {
        if self.depth >= MAX_NESTING {
            return Err(FormulaError::Syntax {
                offset: self.offset(),
                message: format!("nested deeper than {} levels", MAX_NESTING),
            });
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    // expression := term (('+' | '-') term)*
    fn expression(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        while let Some((_, c)) = self.peek() {
            let op = match c {
                '+' => Op::Add,
                '-' => Op::Sub,
                _ => break,
            };
            self.chars.next();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        while let Some((_, c)) = self.peek() {
            let op = match c {
                '*' => Op::Mul,
                '/' => Op::Div,
                _ => break,
            };
            self.chars.next();
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some((_, '-')) => {
                self.chars.next();
                let inner = self.nested(Self::unary)?;
                Ok(Expr::Neg(Box::new(inner)))
            }
            Some((_, '+')) => {
                self.chars.next();
                self.nested(Self::unary)
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let offset = self.offset();
        match self.peek() {
            Some((_, '(')) => {
                self.chars.next();
                let inner = self.nested(Self::expression)?;
                match self.peek() {
                    Some((_, ')')) => {
                        self.chars.next();
                        Ok(inner)
                    }
                    _ => Err(FormulaError::Syntax {
                        offset: self.offset(),
                        message: "expected ')'".into(),
                    }),
                }
            }
            Some((_, c)) if c.is_ascii_digit() || c == '.' => {
                let mut literal = String::new();
                while let Some((_, c)) = self.chars.peek().copied() {
                    if c.is_ascii_digit() || c == '.' {
                        literal.push(c);
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                literal
                    .parse::<f64>()
                    .map(Expr::Number)
                    .map_err(|_| FormulaError::Syntax {
                        offset,
                        message: format!("bad number '{}'", literal),
                    })
            }
            Some((_, c)) if c.is_ascii_alphabetic() => {
                self.chars.next();
                if matches!(self.chars.peek(), Some((_, next)) if next.is_ascii_alphanumeric()) {
                    return Err(FormulaError::Syntax {
                        offset,
                        message: "variables are single letters A-Z".into(),
                    });
                }
                Ok(Expr::Byte(c.to_ascii_uppercase()))
            }
            Some((_, c)) => Err(FormulaError::Syntax {
                offset,
                message: format!("unexpected '{}'", c),
            }),
            None => Err(FormulaError::Syntax {
                offset,
                message: "unexpected end of formula".into(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn eval(formula: &str, bytes: &[u8]) -> f64 {
        formula.parse::<Formula>().unwrap().evaluate(bytes).unwrap()
    }

    #[test]
    fn test_common_conversions() {
        assert_eq!(eval("(A*256+B)/4", &[0x1A, 0xF8]), 1726.0);
        assert_eq!(eval("A-40", &[0x7B]), 83.0);
        assert_eq!(eval("A", &[0x28]), 40.0);
        assert_eq!(eval("(A*256+B)-32768", &[0x80, 0x10]), 16.0);
        assert_eq!(eval("A*0.75-48", &[0x80]), 48.0);
    }

    #[test]
    fn test_precedence_and_unary() {
        assert_eq!(eval("2+3*4", &[]), 14.0);
        assert_eq!(eval("(2+3)*4", &[]), 20.0);
        assert_eq!(eval("-A+10", &[4]), 6.0);
        assert_eq!(eval("10-4-3", &[]), 3.0);
        assert_eq!(eval("100/5/2", &[]), 10.0);
    }

    #[test]
    fn test_missing_byte() {
        let formula: Formula = "(A*256+B)/4".parse().unwrap();
        assert_eq!(
            formula.evaluate(&[0x1A]),
            Err(FormulaError::MissingByte {
                variable: 'B',
                available: 1
            })
        );
        assert_eq!(formula.bytes_needed(), 2);
    }

    #[test]
    fn test_division_by_zero() {
        let formula: Formula = "100/A".parse().unwrap();
        assert_eq!(formula.evaluate(&[0]), Err(FormulaError::DivisionByZero));
    }

    #[test]
    fn test_syntax_errors() {
        assert!("(A*256".parse::<Formula>().is_err());
        assert!("A**2".parse::<Formula>().is_err());
        assert!("RPM/4".parse::<Formula>().is_err());
        assert!("".parse::<Formula>().is_err());
        assert!("A B".parse::<Formula>().is_err());
    }

    #[test]
    fn test_nesting_is_capped() {
        let shallow = format!("{}A{}", "(".repeat(MAX_NESTING), ")".repeat(MAX_NESTING));
        assert_eq!(eval(&shallow, &[7]), 7.0);

        let deep = format!("{}A{}", "(".repeat(MAX_NESTING + 1), ")".repeat(MAX_NESTING + 1));
        assert!(matches!(
            deep.parse::<Formula>(),
            Err(FormulaError::Syntax { message, .. }) if message.contains("nested")
        ));

        let negations = format!("{}A", "-".repeat(MAX_NESTING + 1));
        assert!(negations.parse::<Formula>().is_err());

        // Deep enough to exhaust the stack without the cap
        let hostile = "(".repeat(100_000);
        assert!(hostile.parse::<Formula>().is_err());
    }

    #[test]
    fn test_length_is_capped() {
        let long = vec!["A"; 200].join("+");
        assert!(matches!(
            long.parse::<Formula>(),
            Err(FormulaError::Syntax { offset: MAX_FORMULA_LEN, .. })
        ));
    }

    #[test]
    fn test_display_keeps_source() {
        let formula: Formula = " A*100/255 ".parse().unwrap();
        assert_eq!(formula.to_string(), "A*100/255");
    }

    proptest! {
        #[test]
        fn two_byte_formula_matches_integer_math(a: u8, b: u8) {
            let value = eval("(A*256+B)/4", &[a, b]);
            prop_assert_eq!(value, (u32::from(a) * 256 + u32::from(b)) as f64 / 4.0);
        }
    }
}
