//! Shunting-yard expression parser.
//!
//! Text formulas are converted once into a reverse-polish token stream;
//! integer constants are precomputed into the active field after every
//! prime change, so evaluation is a single stack pass per probe.

use std::collections::HashMap;

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::ToPrimitive;

use firefly_core::FFInt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Number(BigInt),
    Variable(usize),
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    /// Unary negation.
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpToken {
    Plus,
    Minus,
    Times,
    Divide,
    Power,
    Negate,
    LeftParen,
}

fn precedence(op: OpToken) -> u8 {
    match op {
        OpToken::Plus | OpToken::Minus => 1,
        OpToken::Times | OpToken::Divide => 2,
        OpToken::Negate => 3,
        OpToken::Power => 4,
        OpToken::LeftParen => 0,
    }
}

fn right_associative(op: OpToken) -> bool {
    matches!(op, OpToken::Power | OpToken::Negate)
}

/// A parsed expression in reverse-polish form with per-prime precomputed
/// constants.
#[derive(Debug, Clone)]
pub struct ParsedExpression {
    rpn: Vec<Token>,
    /// `rpn` constants reduced into the active field, refreshed by
    /// [`ParsedExpression::precompute_tokens`].
    constants: Vec<FFInt>,
}

#[derive(Debug)]
pub struct ParseError(pub String);

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "parse error: {}", self.0)
    }
}

impl std::error::Error for ParseError {}

impl ParsedExpression {
    /// Parse an expression over the named variables.
    pub fn parse(input: &str, vars: &[String]) -> Result<Self, ParseError> {
        let var_map: HashMap<&str, usize> = vars
            .iter()
            .enumerate()
            .map(|(i, v)| (v.as_str(), i))
            .collect();

        let mut output = Vec::new();
        let mut ops: Vec<OpToken> = Vec::new();
        let mut prev_was_value = false;

        let chars: Vec<char> = input.chars().collect();
        let mut pos = 0;

        while pos < chars.len() {
            let c = chars[pos];

            if c.is_whitespace() {
                pos += 1;
                continue;
            }

            if c.is_ascii_digit() {
                let start = pos;
                while pos < chars.len() && chars[pos].is_ascii_digit() {
                    pos += 1;
                }
                let number: String = chars[start..pos].iter().collect();
                let value = number
                    .parse::<BigInt>()
                    .map_err(|e| ParseError(format!("bad number '{number}': {e}")))?;
                output.push(Token::Number(value));
                prev_was_value = true;
                continue;
            }

            if c.is_alphabetic() || c == '_' {
                let start = pos;
                while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                    pos += 1;
                }
                let name: String = chars[start..pos].iter().collect();
                let index = var_map
                    .get(name.as_str())
                    .ok_or_else(|| ParseError(format!("unknown variable '{name}'")))?;
                output.push(Token::Variable(*index));
                prev_was_value = true;
                continue;
            }

            let op = match c {
                '+' => {
                    if prev_was_value {
                        OpToken::Plus
                    } else {
                        // unary plus, skip
                        pos += 1;
                        continue;
                    }
                }
                '-' => {
                    if prev_was_value {
                        OpToken::Minus
                    } else {
                        OpToken::Negate
                    }
                }
                '*' => OpToken::Times,
                '/' => OpToken::Divide,
                '^' => OpToken::Power,
                '(' => {
                    ops.push(OpToken::LeftParen);
                    prev_was_value = false;
                    pos += 1;
                    continue;
                }
                ')' => {
                    loop {
                        match ops.pop() {
                            Some(OpToken::LeftParen) => break,
                            Some(op) => output.push(op_to_token(op)),
                            None => return Err(ParseError("unbalanced parentheses".into())),
                        }
                    }
                    prev_was_value = true;
                    pos += 1;
                    continue;
                }
                other => return Err(ParseError(format!("unexpected character '{other}'"))),
            };

            while let Some(&top) = ops.last() {
                if top == OpToken::LeftParen {
                    break;
                }
                let pop = if right_associative(op) {
                    precedence(top) > precedence(op)
                } else {
                    precedence(top) >= precedence(op)
                };
                if !pop {
                    break;
                }
                ops.pop();
                output.push(op_to_token(top));
            }
            ops.push(op);
            prev_was_value = false;
            pos += 1;
        }

        while let Some(op) = ops.pop() {
            if op == OpToken::LeftParen {
                return Err(ParseError("unbalanced parentheses".into()));
            }
            output.push(op_to_token(op));
        }

        if output.is_empty() {
            return Err(ParseError("empty expression".into()));
        }

        let mut parsed = Self {
            rpn: output,
            constants: Vec::new(),
        };
        parsed.check_arity()?;
        parsed.precompute_tokens();
        Ok(parsed)
    }

    fn check_arity(&self) -> Result<(), ParseError> {
        let mut depth: i64 = 0;
        for token in &self.rpn {
            match token {
                Token::Number(_) | Token::Variable(_) => depth += 1,
                Token::Negate => {
                    if depth < 1 {
                        return Err(ParseError("malformed expression".into()));
                    }
                }
                _ => {
                    depth -= 1;
                    if depth < 1 {
                        return Err(ParseError("malformed expression".into()));
                    }
                }
            }
        }
        if depth != 1 {
            return Err(ParseError("malformed expression".into()));
        }
        Ok(())
    }

    /// Reduce all integer constants into the active prime field. Must be
    /// called after every prime change.
    pub fn precompute_tokens(&mut self) {
        let prime = BigInt::from(FFInt::prime());
        self.constants = self
            .rpn
            .iter()
            .map(|token| match token {
                Token::Number(value) => {
                    let reduced = value.mod_floor(&prime);
                    FFInt::from_reduced(reduced.to_u64().unwrap_or(0))
                }
                _ => FFInt::zero(),
            })
            .collect();
    }

    /// Evaluate at a point of the active field.
    pub fn eval(&self, values: &[FFInt]) -> FFInt {
        let mut stack: Vec<FFInt> = Vec::with_capacity(8);

        for (i, token) in self.rpn.iter().enumerate() {
            match token {
                Token::Number(_) => stack.push(self.constants[i]),
                Token::Variable(index) => stack.push(values[*index]),
                Token::Negate => {
                    let a = stack.pop().expect("checked arity");
                    stack.push(-a);
                }
                Token::Power => {
                    let exponent = stack.pop().expect("checked arity");
                    let base = stack.pop().expect("checked arity");
                    // Exponents are small integers; a value above the half
                    // field is a reduced negative exponent.
                    let p = FFInt::prime();
                    if exponent.n > p / 2 {
                        stack.push(base.pow_i64(-((p - exponent.n) as i64)));
                    } else {
                        stack.push(base.pow(exponent.n));
                    }
                }
                op => {
                    let b = stack.pop().expect("checked arity");
                    let a = stack.pop().expect("checked arity");
                    let result = match op {
                        Token::Plus => a + b,
                        Token::Minus => a - b,
                        Token::Times => a * b,
                        Token::Divide => a / b,
                        _ => unreachable!(),
                    };
                    stack.push(result);
                }
            }
        }

        stack.pop().expect("checked arity")
    }
}

fn op_to_token(op: OpToken) -> Token {
    match op {
        OpToken::Plus => Token::Plus,
        OpToken::Minus => Token::Minus,
        OpToken::Times => Token::Times,
        OpToken::Divide => Token::Divide,
        OpToken::Power => Token::Power,
        OpToken::Negate => Token::Negate,
        OpToken::LeftParen => unreachable!("parenthesis in output"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use firefly_core::primes::primes;
    use serial_test::serial;

    fn setup() -> Vec<String> {
        FFInt::set_new_prime(primes()[0]);
        vec!["x".to_string(), "y".to_string()]
    }

    fn f(n: i64) -> FFInt {
        FFInt::from_i64(n)
    }

    #[test]
    #[serial]
    fn test_basic_arithmetic() {
        let vars = setup();
        let expr = ParsedExpression::parse("2*x + y^2 - 3", &vars).unwrap();
        // 2*5 + 7^2 - 3 = 56
        assert_eq!(expr.eval(&[f(5), f(7)]), f(56));
    }

    #[test]
    #[serial]
    fn test_parentheses_and_division() {
        let vars = setup();
        let expr = ParsedExpression::parse("(x + y) / (x*y + 1)", &vars).unwrap();
        assert_eq!(expr.eval(&[f(2), f(3)]), f(5) / f(7));
    }

    #[test]
    #[serial]
    fn test_unary_minus() {
        let vars = setup();
        let expr = ParsedExpression::parse("-x + 2", &vars).unwrap();
        assert_eq!(expr.eval(&[f(5), f(0)]), f(-3));

        let expr = ParsedExpression::parse("3 * -x", &vars).unwrap();
        assert_eq!(expr.eval(&[f(2), f(0)]), f(-6));
    }

    #[test]
    #[serial]
    fn test_power_right_associative() {
        let vars = setup();
        let expr = ParsedExpression::parse("x^2^3", &vars).unwrap();
        // 2^(2^3) = 256
        assert_eq!(expr.eval(&[f(2), f(0)]), f(256));
    }

    #[test]
    #[serial]
    fn test_precompute_after_prime_change() {
        let vars = setup();
        let mut expr = ParsedExpression::parse("x + 123456789123456789123456789", &vars).unwrap();

        let v1 = expr.eval(&[f(1), f(0)]);

        FFInt::set_new_prime(primes()[1]);
        expr.precompute_tokens();
        let v2 = expr.eval(&[FFInt::from_i64(1), FFInt::zero()]);

        // Different fields reduce the constant differently.
        assert_ne!(v1.n, v2.n);

        FFInt::set_new_prime(primes()[0]);
    }

    #[test]
    #[serial]
    fn test_errors() {
        let vars = setup();
        assert!(ParsedExpression::parse("x + ", &vars).is_err());
        assert!(ParsedExpression::parse("(x", &vars).is_err());
        assert!(ParsedExpression::parse("z + 1", &vars).is_err());
        assert!(ParsedExpression::parse("", &vars).is_err());
    }
}
