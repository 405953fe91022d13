//! Comparator expression mini-language.
//!
//! Stores without an index specification may carry a comparator expression:
//! a predicate over the two candidate keys, bound to the variables `mapX`
//! and `mapY`, evaluating to -1, 0 or 1. The shape is nested ternaries over
//! field comparisons:
//!
//! ```text
//! mapX.age < mapY.age ? -1 : (mapX.age > mapY.age ? 1 : 0)
//! ```
//!
//! Expressions are parsed (and rejected) at store-creation time; evaluation
//! happens only when the owning store has no index specification. Result
//! literals outside {-1, 0, 1} fail the parse.

use crate::error::{Error, Result};
use crate::key::FieldValue;
use logos::Logos;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Logos, Debug, Clone, PartialEq)]
enum Tok {
    #[regex(r"[ \t\r\n]+", logos::skip)]
    Whitespace,

    #[token("?")]
    Question,
    #[token(":")]
    Colon,
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token(".")]
    Dot,

    #[token("<=")]
    Le,
    #[token("<")]
    Lt,
    #[token(">=")]
    Ge,
    #[token(">")]
    Gt,
    #[token("==")]
    EqEq,
    #[token("!=")]
    Ne,

    #[regex(r"-?[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r#""([^"\\]|\\.)*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].to_string())
    })]
    Str(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl CmpOp {
    fn matches(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Operand {
    /// `mapX.<field>`
    FieldX(String),
    /// `mapY.<field>`
    FieldY(String),
    Int(i64),
    Str(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Condition {
    left: Operand,
    op: CmpOp,
    right: Operand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Expr {
    Literal(i64),
    Ternary {
        cond: Condition,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
}

/// A parsed, validated comparator expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparatorExpression {
    source: String,
    root: Expr,
}

impl ComparatorExpression {
    /// Parse and validate. The error is `InvalidConfig`; an expression that
    /// does not parse is never persisted.
    pub fn parse(source: &str) -> Result<Self> {
        let mut tokens = Vec::new();
        for item in Tok::lexer(source) {
            match item {
                Ok(tok) => tokens.push(tok),
                Err(()) => {
                    return Err(Error::invalid_config(format!(
                        "comparator expression has unrecognizable input: {:?}",
                        source
                    )))
                }
            }
        }
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::invalid_config(
                "comparator expression has trailing input",
            ));
        }
        Ok(ComparatorExpression {
            source: source.to_string(),
            root,
        })
    }

    /// The original text, as persisted in store metadata.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate against two composite keys' field maps.
    pub fn compare(
        &self,
        x: &BTreeMap<String, FieldValue>,
        y: &BTreeMap<String, FieldValue>,
    ) -> Ordering {
        match eval(&self.root, x, y) {
            i if i < 0 => Ordering::Less,
            0 => Ordering::Equal,
            _ => Ordering::Greater,
        }
    }
}

fn resolve(
    operand: &Operand,
    x: &BTreeMap<String, FieldValue>,
    y: &BTreeMap<String, FieldValue>,
) -> Option<FieldValue> {
    match operand {
        Operand::FieldX(name) => x.get(name).cloned(),
        Operand::FieldY(name) => y.get(name).cloned(),
        Operand::Int(i) => Some(FieldValue::Integer(*i)),
        Operand::Str(s) => Some(FieldValue::String(s.clone())),
    }
}

fn eval(expr: &Expr, x: &BTreeMap<String, FieldValue>, y: &BTreeMap<String, FieldValue>) -> i64 {
    match expr {
        Expr::Literal(i) => *i,
        Expr::Ternary {
            cond,
            then,
            otherwise,
        } => {
            // A missing field orders before any present value.
            let ord = resolve(&cond.left, x, y).cmp(&resolve(&cond.right, x, y));
            if cond.op.matches(ord) {
                eval(then, x, y)
            } else {
                eval(otherwise, x, y)
            }
        }
    }
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, want: Tok) -> Result<()> {
        match self.bump() {
            Some(tok) if tok == want => Ok(()),
            other => Err(Error::invalid_config(format!(
                "comparator expression: expected {:?}, found {:?}",
                want, other
            ))),
        }
    }

    fn expr(&mut self) -> Result<Expr> {
        match self.peek() {
            Some(Tok::Int(_)) => {
                let value = match self.bump() {
                    Some(Tok::Int(i)) => i,
                    _ => unreachable!(),
                };
                if !(-1..=1).contains(&value) {
                    return Err(Error::invalid_config(format!(
                        "comparator expression must yield -1, 0 or 1, found {}",
                        value
                    )));
                }
                Ok(Expr::Literal(value))
            }
            Some(Tok::LParen) => {
                self.bump();
                let inner = self.expr()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            _ => {
                let cond = self.condition()?;
                self.expect(Tok::Question)?;
                let then = self.expr()?;
                self.expect(Tok::Colon)?;
                let otherwise = self.expr()?;
                Ok(Expr::Ternary {
                    cond,
                    then: Box::new(then),
                    otherwise: Box::new(otherwise),
                })
            }
        }
    }

    fn condition(&mut self) -> Result<Condition> {
        let left = self.operand()?;
        let op = match self.bump() {
            Some(Tok::Lt) => CmpOp::Lt,
            Some(Tok::Le) => CmpOp::Le,
            Some(Tok::Gt) => CmpOp::Gt,
            Some(Tok::Ge) => CmpOp::Ge,
            Some(Tok::EqEq) => CmpOp::Eq,
            Some(Tok::Ne) => CmpOp::Ne,
            other => {
                return Err(Error::invalid_config(format!(
                    "comparator expression: expected comparison operator, found {:?}",
                    other
                )))
            }
        };
        let right = self.operand()?;
        Ok(Condition { left, op, right })
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.bump() {
            Some(Tok::Ident(var)) if var == "mapX" || var == "mapY" => {
                self.expect(Tok::Dot)?;
                match self.bump() {
                    Some(Tok::Ident(field)) => Ok(if var == "mapX" {
                        Operand::FieldX(field)
                    } else {
                        Operand::FieldY(field)
                    }),
                    other => Err(Error::invalid_config(format!(
                        "comparator expression: expected field name after {}., found {:?}",
                        var, other
                    ))),
                }
            }
            Some(Tok::Int(i)) => Ok(Operand::Int(i)),
            Some(Tok::Str(s)) => Ok(Operand::Str(s)),
            other => Err(Error::invalid_config(format!(
                "comparator expression: expected mapX.<field>, mapY.<field> or literal, found {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, i64)]) -> BTreeMap<String, FieldValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), FieldValue::Integer(*v)))
            .collect()
    }

    const AGE_CMP: &str = "mapX.age < mapY.age ? -1 : (mapX.age > mapY.age ? 1 : 0)";

    #[test]
    fn parses_and_compares() {
        let expr = ComparatorExpression::parse(AGE_CMP).unwrap();
        assert_eq!(
            expr.compare(&map(&[("age", 30)]), &map(&[("age", 40)])),
            Ordering::Less
        );
        assert_eq!(
            expr.compare(&map(&[("age", 40)]), &map(&[("age", 40)])),
            Ordering::Equal
        );
        assert_eq!(
            expr.compare(&map(&[("age", 50)]), &map(&[("age", 40)])),
            Ordering::Greater
        );
        assert_eq!(expr.source(), AGE_CMP);
    }

    #[test]
    fn missing_field_orders_first() {
        let expr = ComparatorExpression::parse(AGE_CMP).unwrap();
        assert_eq!(expr.compare(&map(&[]), &map(&[("age", 1)])), Ordering::Less);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ComparatorExpression::parse("mapX.age <").is_err());
        assert!(ComparatorExpression::parse("hello world").is_err());
        assert!(ComparatorExpression::parse("mapX.age < mapY.age ? -1 : 0 extra").is_err());
        assert!(ComparatorExpression::parse("mapX.@ < 1 ? -1 : 0").is_err());
    }

    #[test]
    fn rejects_out_of_range_result() {
        assert!(ComparatorExpression::parse("mapX.a < mapY.a ? -2 : 0").is_err());
    }

    #[test]
    fn string_literal_operands() {
        let expr =
            ComparatorExpression::parse("mapX.region == \"EU\" ? -1 : 1").unwrap();
        let eu: BTreeMap<String, FieldValue> =
            [("region".to_string(), FieldValue::from("EU"))].into();
        let us: BTreeMap<String, FieldValue> =
            [("region".to_string(), FieldValue::from("US"))].into();
        assert_eq!(expr.compare(&eu, &us), Ordering::Less);
        assert_eq!(expr.compare(&us, &eu), Ordering::Greater);
    }

    #[test]
    fn serde_round_trip() {
        let expr = ComparatorExpression::parse(AGE_CMP).unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        let back: ComparatorExpression = serde_json::from_str(&json).unwrap();
        assert_eq!(expr, back);
    }
}
