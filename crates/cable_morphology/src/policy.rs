//! Compartments-per-branch policies and their s-expression form.
//!
//! Recognised expressions: `(single)`, `(fixed-per-branch N)`,
//! `(max-extent L)` and `(join A B)`.

use crate::CableSegment;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq)]
pub enum CvPolicy {
    /// One compartment per cable.
    Single,
    /// Fixed count per cable; 0 requests one CV per geometry interval.
    FixedPerBranch(u32),
    /// As many compartments as needed so none exceeds the given length [µm].
    MaxExtent(f64),
    /// Per-segment maximum of both operands.
    Join(Box<CvPolicy>, Box<CvPolicy>),
}

impl CvPolicy {
    pub fn compartments(&self, cable: &CableSegment) -> u32 {
        match self {
            CvPolicy::Single => 1,
            CvPolicy::FixedPerBranch(n) => *n,
            CvPolicy::MaxExtent(extent) => (cable.length() / extent).ceil().max(1.0) as u32,
            CvPolicy::Join(a, b) => a.compartments(cable).max(b.compartments(cable)),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum PolicyParseError {
    #[error("invalid CV policy expression: unexpected end of input")]
    UnexpectedEnd,
    #[error("invalid CV policy expression: unexpected token `{0}`")]
    UnexpectedToken(String),
    #[error("invalid CV policy expression: unknown policy `{0}`")]
    UnknownPolicy(String),
    #[error("invalid CV policy expression: bad argument `{0}`")]
    BadArgument(String),
    #[error("invalid CV policy expression: trailing input `{0}`")]
    TrailingInput(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Open,
    Close,
    Atom(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            _ => {
                let mut atom = String::new();
                while let Some(&c) = chars.peek() {
                    if c == '(' || c == ')' || c.is_whitespace() {
                        break;
                    }
                    atom.push(c);
                    chars.next();
                }
                tokens.push(Token::Atom(atom));
            }
        }
    }
    tokens
}

struct Parser<'a> {
    tokens: &'a [Token],
    at: usize,
}

impl<'a> Parser<'a> {
    fn next(&mut self) -> Result<&'a Token, PolicyParseError> {
        let token = self.tokens.get(self.at).ok_or(PolicyParseError::UnexpectedEnd)?;
        self.at += 1;
        Ok(token)
    }

    fn expect_close(&mut self) -> Result<(), PolicyParseError> {
        match self.next()? {
            Token::Close => Ok(()),
            Token::Open => Err(PolicyParseError::UnexpectedToken("(".into())),
            Token::Atom(a) => Err(PolicyParseError::UnexpectedToken(a.clone())),
        }
    }

    fn atom(&mut self) -> Result<&'a str, PolicyParseError> {
        match self.next()? {
            Token::Atom(a) => Ok(a),
            Token::Open => Err(PolicyParseError::UnexpectedToken("(".into())),
            Token::Close => Err(PolicyParseError::UnexpectedToken(")".into())),
        }
    }

    fn policy(&mut self) -> Result<CvPolicy, PolicyParseError> {
        match self.next()? {
            Token::Open => {}
            Token::Close => return Err(PolicyParseError::UnexpectedToken(")".into())),
            Token::Atom(a) => return Err(PolicyParseError::UnexpectedToken(a.clone())),
        }
        let head = self.atom()?.to_string();
        let policy = match head.as_str() {
            "single" => CvPolicy::Single,
            "fixed-per-branch" => {
                let arg = self.atom()?;
                let n = arg
                    .parse::<u32>()
                    .map_err(|_| PolicyParseError::BadArgument(arg.to_string()))?;
                CvPolicy::FixedPerBranch(n)
            }
            "max-extent" => {
                let arg = self.atom()?;
                let extent = arg
                    .parse::<f64>()
                    .ok()
                    .filter(|v| *v > 0.0)
                    .ok_or_else(|| PolicyParseError::BadArgument(arg.to_string()))?;
                CvPolicy::MaxExtent(extent)
            }
            "join" => {
                let a = self.policy()?;
                let b = self.policy()?;
                CvPolicy::Join(Box::new(a), Box::new(b))
            }
            _ => return Err(PolicyParseError::UnknownPolicy(head)),
        };
        self.expect_close()?;
        Ok(policy)
    }
}

pub fn parse_cv_policy(input: &str) -> Result<CvPolicy, PolicyParseError> {
    let tokens = tokenize(input);
    let mut parser = Parser {
        tokens: &tokens,
        at: 0,
    };
    let policy = parser.policy()?;
    if parser.at != tokens.len() {
        let rest = match &tokens[parser.at] {
            Token::Open => "(".to_string(),
            Token::Close => ")".to_string(),
            Token::Atom(a) => a.clone(),
        };
        return Err(PolicyParseError::TrailingInput(rest));
    }
    Ok(policy)
}
