//! Boolean condition expressions over sub-threshold ids.
//!
//! Rule rows store trigger conditions as text like `1 || (2 && 3)` where each
//! integer names a sub-threshold of the same program. The textual operator
//! forms `and`/`or` (any case) are accepted alongside `&&`/`||`. Expressions
//! are parsed once at rule load into a small AST and evaluated by tree walk
//! per tick.

use std::collections::BTreeSet;

use crate::error::{Result, SignalError};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    Var(u32),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
}

/// A parsed condition expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionExpr {
    text: String,
    root: Node,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Var(u32),
    And,
    Or,
    Open,
    Close,
}

fn rule_error(text: &str, details: impl Into<String>) -> SignalError {
    SignalError::Rule { context: format!("expression '{text}'"), details: details.into() }
}

fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some(&(at, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '&' | '|' => {
                chars.next();
                match chars.next() {
                    Some((_, second)) if second == c => {
                        tokens.push(if c == '&' { Token::And } else { Token::Or });
                    }
                    _ => return Err(rule_error(text, format!("lone '{c}' at offset {at}"))),
                }
            }
            '0'..='9' => {
                let mut value = 0u32;
                while let Some(&(_, d)) = chars.peek() {
                    let Some(digit) = d.to_digit(10) else { break };
                    value = value
                        .checked_mul(10)
                        .and_then(|v| v.checked_add(digit))
                        .ok_or_else(|| rule_error(text, "sub-threshold id out of range"))?;
                    chars.next();
                }
                tokens.push(Token::Var(value));
            }
            c if c.is_alphabetic() => {
                let mut word = String::new();
                while let Some(&(_, a)) = chars.peek() {
                    if !a.is_alphabetic() {
                        break;
                    }
                    word.push(a);
                    chars.next();
                }
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    other => return Err(rule_error(text, format!("unknown word '{other}'"))),
                }
            }
            other => return Err(rule_error(text, format!("unexpected '{other}' at offset {at}"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    text: &'a str,
    tokens: Vec<Token>,
    at: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.at).cloned();
        if token.is_some() {
            self.at += 1;
        }
        token
    }

    // or := and ('||' and)*
    fn parse_or(&mut self) -> Result<Node> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Node::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // and := primary ('&&' primary)*
    fn parse_and(&mut self) -> Result<Node> {
        let mut left = self.parse_primary()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_primary()?;
            left = Node::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    // primary := '(' or ')' | integer
    fn parse_primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Var(id)) => Ok(Node::Var(id)),
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(rule_error(self.text, "missing ')'")),
                }
            }
            Some(token) => Err(rule_error(self.text, format!("unexpected {token:?}"))),
            None => Err(rule_error(self.text, "expression ended early")),
        }
    }
}

impl ConditionExpr {
    /// Parse `text` into an evaluable expression.
    pub fn parse(text: &str) -> Result<Self> {
        let tokens = tokenize(text)?;
        if tokens.is_empty() {
            return Err(rule_error(text, "empty expression"));
        }
        let mut parser = Parser { text, tokens, at: 0 };
        let root = parser.parse_or()?;
        if parser.peek().is_some() {
            return Err(rule_error(text, "trailing tokens after expression"));
        }
        Ok(Self { text: text.to_string(), root })
    }

    /// Every sub-threshold id the expression references.
    pub fn variables(&self) -> BTreeSet<u32> {
        fn walk(node: &Node, out: &mut BTreeSet<u32>) {
            match node {
                Node::Var(id) => {
                    out.insert(*id);
                }
                Node::And(l, r) | Node::Or(l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
            }
        }
        let mut out = BTreeSet::new();
        walk(&self.root, &mut out);
        out
    }

    /// Evaluate with `lookup` supplying each sub-threshold's matched flag.
    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(u32) -> bool,
    {
        fn walk<F: Fn(u32) -> bool>(node: &Node, lookup: &F) -> bool {
            match node {
                Node::Var(id) => lookup(*id),
                Node::And(l, r) => walk(l, lookup) && walk(r, lookup),
                Node::Or(l, r) => walk(l, lookup) || walk(r, lookup),
            }
        }
        walk(&self.root, lookup)
    }

    pub fn text(&self) -> &str {
        &self.text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eval(text: &str, matched: &[u32]) -> bool {
        let expr = ConditionExpr::parse(text).unwrap();
        expr.evaluate(&|id| matched.contains(&id))
    }

    #[test]
    fn single_variable() {
        assert!(eval("1", &[1]));
        assert!(!eval("1", &[]));
    }

    #[test]
    fn or_of_two_variables() {
        assert!(eval("1 || 2", &[1]));
        assert!(eval("1 || 2", &[2]));
        assert!(!eval("1 || 2", &[]));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // 1 || (2 && 3)
        assert!(eval("1 || 2 && 3", &[1]));
        assert!(!eval("1 || 2 && 3", &[2]));
        assert!(eval("1 || 2 && 3", &[2, 3]));
    }

    #[test]
    fn parentheses_override_precedence() {
        assert!(!eval("(1 || 2) && 3", &[1]));
        assert!(eval("(1 || 2) && 3", &[1, 3]));
    }

    #[test]
    fn word_operators_are_accepted() {
        assert!(eval("1 AND 2", &[1, 2]));
        assert!(!eval("1 and 2", &[1]));
        assert!(eval("1 Or 2", &[2]));
    }

    #[test]
    fn unreferenced_thresholds_do_not_matter() {
        assert!(eval("2", &[1, 2, 3]));
    }

    #[test]
    fn variables_are_collected_sorted_and_deduplicated() {
        let expr = ConditionExpr::parse("3 || 1 && (2 || 1)").unwrap();
        assert_eq!(expr.variables().into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn malformed_expressions_are_rule_errors() {
        for bad in ["", "1 ||", "|| 1", "1 & 2", "(1", "1)", "1 xor 2", "1 2"] {
            let err = ConditionExpr::parse(bad).unwrap_err();
            assert!(matches!(err, SignalError::Rule { .. }), "{bad}");
        }
    }
}
