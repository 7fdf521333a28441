use std::fmt;
use std::iter::Peekable;
use std::str::CharIndices;

use crate::condition::{Condition, ConditionField, ConditionOp, ConditionValue, FieldOp, Value};

#[derive(Debug, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid character {ch:?} at position {pos}")]
    InvalidChar { ch: char, pos: usize },
    #[error("integer literal out of range at position {pos}")]
    IntOutOfRange { pos: usize },
    #[error("unexpected {found} at position {pos}")]
    UnexpectedToken { found: String, pos: usize },
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("trailing input at position {pos}")]
    TrailingTokens { pos: usize },
}

/// Parses a condition expression.
///
/// The grammar is boolean combinations of comparison fields, with `&&`
/// binding tighter than `||` and parentheses overriding both. Fields are
/// written `ident OP literal`; the reversed `literal OP ident` form is
/// accepted too, flipping `<` and `>` so the stored field is always
/// `ident OP literal`.
pub fn parse_condition(input: &str) -> Result<Condition, ParseError> {
    let tokens = lex(input)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
    };

    let parsed = parser.or_expr()?;
    if let Some(t) = parser.peek() {
        return Err(ParseError::TrailingTokens { pos: t.pos });
    }

    Ok(match parsed {
        Parsed::Field(f) => Condition {
            fields: vec![f],
            ..Condition::default()
        },
        Parsed::Node(c) => c,
    })
}

impl std::str::FromStr for Condition {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_condition(s)
    }
}

#[derive(Clone, Debug, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(String),
    Float(String),
    Bool(bool),
    Str(String),
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Gt,
    LParen,
    RParen,
}

#[derive(Clone, Debug, PartialEq)]
struct Token {
    kind: TokenKind,
    pos: usize,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Ident(s) => write!(f, "identifier {s:?}"),
            TokenKind::Int(s) => write!(f, "integer {s:?}"),
            TokenKind::Float(s) => write!(f, "float {s:?}"),
            TokenKind::Bool(b) => write!(f, "boolean {b:?}"),
            TokenKind::Str(s) => write!(f, "string {s:?}"),
            TokenKind::And => f.write_str("\"&&\""),
            TokenKind::Or => f.write_str("\"||\""),
            TokenKind::Eq => f.write_str("\"==\""),
            TokenKind::Ne => f.write_str("\"!=\""),
            TokenKind::Lt => f.write_str("\"<\""),
            TokenKind::Gt => f.write_str("\">\""),
            TokenKind::LParen => f.write_str("\"(\""),
            TokenKind::RParen => f.write_str("\")\""),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some((pos, ch)) = chars.next() {
        match ch {
            c if c.is_whitespace() => {}
            '(' => tokens.push(Token {
                kind: TokenKind::LParen,
                pos,
            }),
            ')' => tokens.push(Token {
                kind: TokenKind::RParen,
                pos,
            }),
            '<' => tokens.push(Token {
                kind: TokenKind::Lt,
                pos,
            }),
            '>' => tokens.push(Token {
                kind: TokenKind::Gt,
                pos,
            }),
            '&' => {
                chars.next_if(|&(_, c)| c == '&');
                tokens.push(Token {
                    kind: TokenKind::And,
                    pos,
                });
            }
            '|' => {
                chars.next_if(|&(_, c)| c == '|');
                tokens.push(Token {
                    kind: TokenKind::Or,
                    pos,
                });
            }
            '=' => {
                chars.next_if(|&(_, c)| c == '=');
                tokens.push(Token {
                    kind: TokenKind::Eq,
                    pos,
                });
            }
            '!' => {
                chars.next_if(|&(_, c)| c == '=');
                tokens.push(Token {
                    kind: TokenKind::Ne,
                    pos,
                });
            }
            '\'' | '"' => tokens.push(lex_string(pos, ch, &mut chars)),
            c if c.is_alphabetic() || c == '_' => {
                let mut val = String::from(c);
                while let Some(&(_, c)) = chars.peek() {
                    if !c.is_alphanumeric() && c != '_' {
                        break;
                    }
                    val.push(c);
                    chars.next();
                }

                let kind = match val.as_str() {
                    "true" => TokenKind::Bool(true),
                    "false" => TokenKind::Bool(false),
                    _ => TokenKind::Ident(val),
                };
                tokens.push(Token { kind, pos });
            }
            c if c.is_numeric() => {
                let mut val = String::from(c);
                let mut is_float = false;
                while let Some(&(p, c)) = chars.peek() {
                    if c.is_numeric() {
                        val.push(c);
                    } else if c == '.' {
                        if is_float {
                            return Err(ParseError::InvalidChar { ch: '.', pos: p });
                        }
                        is_float = true;
                        val.push(c);
                    } else if c.is_alphabetic() || c == '_' {
                        return Err(ParseError::InvalidChar { ch: c, pos: p });
                    } else {
                        break;
                    }
                    chars.next();
                }

                let kind = if is_float {
                    TokenKind::Float(val)
                } else {
                    TokenKind::Int(val)
                };
                tokens.push(Token { kind, pos });
            }
            _ => return Err(ParseError::InvalidChar { ch, pos }),
        }
    }

    Ok(tokens)
}

/// Scans a string literal after its opening quote.
///
/// The opening quote determines the closer, the non-matching quote is
/// literal, and a backslash is literal except directly before the matching
/// quote, where it inserts the quote. Reaching the end of input inside a
/// string yields the value read so far.
fn lex_string(pos: usize, quote: char, chars: &mut Peekable<CharIndices>) -> Token {
    let mut val = String::new();
    let mut escape = false;

    for (_, c) in chars.by_ref() {
        if c == '\\' {
            if escape {
                val.push('\\');
                val.push('\\');
                escape = false;
            } else {
                escape = true;
            }
        } else if c == quote {
            if !escape {
                break;
            }
            val.push(c);
            escape = false;
        } else {
            if escape {
                val.push('\\');
                escape = false;
            }
            val.push(c);
        }
    }

    Token {
        kind: TokenKind::Str(val),
        pos,
    }
}

/// A parsed sub-expression: either a bare comparison field or a nested
/// condition node. Bare fields attach to the `fields` list of the node that
/// combines them, which produces the canonical flattening where
/// sub-conditions come before fields.
enum Parsed {
    Field(ConditionField),
    Node(Condition),
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn or_expr(&mut self) -> Result<Parsed, ParseError> {
        // An empty expression (or empty parentheses) is the empty condition.
        match self.peek().map(|t| &t.kind) {
            None | Some(TokenKind::RParen) => return Ok(Parsed::Node(Condition::default())),
            _ => {}
        }

        let first = self.and_expr()?;
        let mut rest = Vec::new();
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::Or)) {
            self.advance();
            rest.push(self.and_expr()?);
        }

        Ok(combine(ConditionOp::Or, first, rest))
    }

    fn and_expr(&mut self) -> Result<Parsed, ParseError> {
        let first = self.atom()?;
        let mut rest = Vec::new();
        while matches!(self.peek().map(|t| &t.kind), Some(TokenKind::And)) {
            self.advance();
            rest.push(self.atom()?);
        }

        Ok(combine(ConditionOp::And, first, rest))
    }

    fn atom(&mut self) -> Result<Parsed, ParseError> {
        let token = self.advance().ok_or(ParseError::UnexpectedEnd)?;
        match &token.kind {
            TokenKind::LParen => {
                let inner = self.or_expr()?;
                match self.advance() {
                    Some(Token {
                        kind: TokenKind::RParen,
                        ..
                    }) => Ok(inner),
                    Some(t) => Err(unexpected(t)),
                    None => Err(ParseError::UnexpectedEnd),
                }
            }
            TokenKind::Ident(name) => {
                let op = self.field_op()?;
                let value = self.literal()?;
                Ok(Parsed::Field(ConditionField {
                    value: ConditionValue::new(name.clone(), value),
                    op,
                }))
            }
            TokenKind::Int(_) | TokenKind::Float(_) | TokenKind::Bool(_) | TokenKind::Str(_) => {
                let value = literal_value(token)?;
                // The literal came first: flip the ordering operators so the
                // field reads `ident OP literal`.
                let op = match self.field_op()? {
                    FieldOp::Lt => FieldOp::Gt,
                    FieldOp::Gt => FieldOp::Lt,
                    op => op,
                };
                let name = self.ident()?;
                Ok(Parsed::Field(ConditionField {
                    value: ConditionValue::new(name, value),
                    op,
                }))
            }
            _ => Err(unexpected(token)),
        }
    }

    fn field_op(&mut self) -> Result<FieldOp, ParseError> {
        let token = self.advance().ok_or(ParseError::UnexpectedEnd)?;
        match token.kind {
            TokenKind::Eq => Ok(FieldOp::Eq),
            TokenKind::Ne => Ok(FieldOp::Ne),
            TokenKind::Lt => Ok(FieldOp::Lt),
            TokenKind::Gt => Ok(FieldOp::Gt),
            _ => Err(unexpected(token)),
        }
    }

    fn literal(&mut self) -> Result<Value, ParseError> {
        let token = self.advance().ok_or(ParseError::UnexpectedEnd)?;
        literal_value(token)
    }

    fn ident(&mut self) -> Result<String, ParseError> {
        let token = self.advance().ok_or(ParseError::UnexpectedEnd)?;
        match &token.kind {
            TokenKind::Ident(name) => Ok(name.clone()),
            _ => Err(unexpected(token)),
        }
    }
}

fn combine(op: ConditionOp, first: Parsed, rest: Vec<Parsed>) -> Parsed {
    if rest.is_empty() {
        return first;
    }

    let mut node = Condition {
        op,
        ..Condition::default()
    };
    for part in std::iter::once(first).chain(rest) {
        match part {
            Parsed::Field(f) => node.fields.push(f),
            Parsed::Node(c) => node.conditions.push(c),
        }
    }

    Parsed::Node(node)
}

fn literal_value(token: &Token) -> Result<Value, ParseError> {
    match &token.kind {
        TokenKind::Int(s) => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| ParseError::IntOutOfRange { pos: token.pos }),
        TokenKind::Float(s) => s
            .parse::<f64>()
            .map(Value::Float)
            .map_err(|_| unexpected(token)),
        TokenKind::Bool(b) => Ok(Value::Bool(*b)),
        TokenKind::Str(s) => Ok(Value::String(s.clone())),
        _ => Err(unexpected(token)),
    }
}

fn unexpected(token: &Token) -> ParseError {
    ParseError::UnexpectedToken {
        found: token.kind.to_string(),
        pos: token.pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spectral::prelude::*;
    use test_case::test_case;

    const COND1: &str = r#"userID < 10 && (serviceName == 'serv1' || serviceName == 'serv2') || userGroup == "tes\"t'er""#;
    const COND2: &str = "useriD < 10 && s == true || foo == \"bar\" && alpha == 14 \
                         || test == 42.1 && test2 == false";

    fn field(name: &str, op: FieldOp, value: impl Into<Value>) -> ConditionField {
        ConditionField::new(name, op, value)
    }

    fn token(kind: TokenKind, pos: usize) -> Token {
        Token { kind, pos }
    }

    #[test_case("userID", vec![TokenKind::Ident("userID".to_string())]; "ident")]
    #[test_case("10", vec![TokenKind::Int("10".to_string())]; "int")]
    #[test_case("10.1", vec![TokenKind::Float("10.1".to_string())]; "float")]
    #[test_case("true", vec![TokenKind::Bool(true)]; "bool true")]
    #[test_case("false", vec![TokenKind::Bool(false)]; "bool false")]
    #[test_case("'false'", vec![TokenKind::Str("false".to_string())]; "quoted bool spelling")]
    #[test_case(">", vec![TokenKind::Gt]; "bare operator")]
    #[test_case(
        r#""true != \"false\"""#,
        vec![TokenKind::Str("true != \"false\"".to_string())];
        "escaped matching quotes"
    )]
    #[test_case(
        r#""some \'string""#,
        vec![TokenKind::Str(r"some \'string".to_string())];
        "escaped non matching quote stays literal"
    )]
    #[test_case(
        r"'some > string \< with \' \11 data |= &! @% \\ ()'",
        vec![TokenKind::Str(r#"some > string \< with ' \11 data |= &! @% \\ ()"#.to_string())];
        "operators and escapes inside a string"
    )]
    fn lexing(input: &str, want: Vec<TokenKind>) {
        let tokens: Vec<TokenKind> = lex(input).unwrap().into_iter().map(|t| t.kind).collect();
        assert_eq!(tokens, want);
    }

    #[test]
    fn lexing_tracks_positions() {
        let got = lex(COND1).unwrap();
        let want = vec![
            token(TokenKind::Ident("userID".to_string()), 0),
            token(TokenKind::Lt, 7),
            token(TokenKind::Int("10".to_string()), 9),
            token(TokenKind::And, 12),
            token(TokenKind::LParen, 15),
            token(TokenKind::Ident("serviceName".to_string()), 16),
            token(TokenKind::Eq, 28),
            token(TokenKind::Str("serv1".to_string()), 31),
            token(TokenKind::Or, 39),
            token(TokenKind::Ident("serviceName".to_string()), 42),
            token(TokenKind::Eq, 54),
            token(TokenKind::Str("serv2".to_string()), 57),
            token(TokenKind::RParen, 64),
            token(TokenKind::Or, 66),
            token(TokenKind::Ident("userGroup".to_string()), 69),
            token(TokenKind::Eq, 79),
            token(TokenKind::Str("tes\"t'er".to_string()), 82),
        ];
        assert_eq!(got, want);
    }

    #[test_case("14.1.2"; "second decimal point")]
    #[test_case("@"; "unknown character")]
    #[test_case("10a"; "letter inside a number")]
    #[test_case(".5"; "leading decimal point")]
    fn lexing_errors(input: &str) {
        assert_that!(lex(input)).is_err();
    }

    #[test]
    fn unterminated_string_is_accepted() {
        let tokens = lex("'no closing quote").unwrap();
        assert_eq!(
            tokens,
            vec![token(TokenKind::Str("no closing quote".to_string()), 0)]
        );
    }

    #[test]
    fn empty_string_literal_closes() {
        let tokens = lex("name == ''").unwrap();
        assert_eq!(tokens[2], token(TokenKind::Str(String::new()), 8));
    }

    fn cond1_expected() -> Condition {
        Condition {
            op: ConditionOp::Or,
            conditions: vec![Condition {
                conditions: vec![Condition {
                    op: ConditionOp::Or,
                    fields: vec![
                        field("serviceName", FieldOp::Eq, "serv1"),
                        field("serviceName", FieldOp::Eq, "serv2"),
                    ],
                    ..Condition::default()
                }],
                fields: vec![field("userID", FieldOp::Lt, 10_i64)],
                ..Condition::default()
            }],
            fields: vec![field("userGroup", FieldOp::Eq, "tes\"t'er")],
        }
    }

    fn cond2_expected() -> Condition {
        Condition {
            op: ConditionOp::Or,
            conditions: vec![
                Condition {
                    fields: vec![
                        field("useriD", FieldOp::Lt, 10_i64),
                        field("s", FieldOp::Eq, true),
                    ],
                    ..Condition::default()
                },
                Condition {
                    fields: vec![
                        field("foo", FieldOp::Eq, "bar"),
                        field("alpha", FieldOp::Eq, 14_i64),
                    ],
                    ..Condition::default()
                },
                Condition {
                    fields: vec![
                        field("test", FieldOp::Eq, 42.1),
                        field("test2", FieldOp::Eq, false),
                    ],
                    ..Condition::default()
                },
            ],
            ..Condition::default()
        }
    }

    #[test]
    fn parses_a_single_field() {
        let got = parse_condition("foo != true").unwrap();
        assert_eq!(
            got,
            Condition {
                fields: vec![field("foo", FieldOp::Ne, true)],
                ..Condition::default()
            }
        );
    }

    #[test]
    fn parses_sibling_fields() {
        let got = parse_condition("foo != true && bar < 20").unwrap();
        assert_eq!(
            got,
            Condition {
                fields: vec![
                    field("foo", FieldOp::Ne, true),
                    field("bar", FieldOp::Lt, 20_i64),
                ],
                ..Condition::default()
            }
        );

        let got = parse_condition("foo != true || bar < 20").unwrap();
        assert_eq!(
            got,
            Condition {
                op: ConditionOp::Or,
                fields: vec![
                    field("foo", FieldOp::Ne, true),
                    field("bar", FieldOp::Lt, 20_i64),
                ],
                ..Condition::default()
            }
        );
    }

    #[test]
    fn parses_nested_conditions() {
        assert_eq!(parse_condition(COND1).unwrap(), cond1_expected());
        assert_eq!(parse_condition(COND2).unwrap(), cond2_expected());
    }

    #[test]
    fn reversed_fields_flip_ordering_operators() {
        let got = parse_condition("10 > userID").unwrap();
        assert_eq!(
            got,
            Condition {
                fields: vec![field("userID", FieldOp::Lt, 10_i64)],
                ..Condition::default()
            }
        );

        let got = parse_condition("10 < userID").unwrap();
        assert_eq!(
            got,
            Condition {
                fields: vec![field("userID", FieldOp::Gt, 10_i64)],
                ..Condition::default()
            }
        );

        let got = parse_condition("'serv1' == serviceName").unwrap();
        assert_eq!(
            got,
            Condition {
                fields: vec![field("serviceName", FieldOp::Eq, "serv1")],
                ..Condition::default()
            }
        );
    }

    #[test]
    fn empty_input_is_the_empty_condition() {
        assert_eq!(parse_condition("").unwrap(), Condition::default());
        assert_eq!(parse_condition("   ").unwrap(), Condition::default());
        assert_eq!(parse_condition("()").unwrap(), Condition::default());
    }

    #[test_case("foo true"; "field without operator")]
    #[test_case("foo != true)"; "stray closing parenthesis")]
    #[test_case("(foo != true"; "unclosed parenthesis")]
    #[test_case("foo != < true"; "double operator")]
    #[test_case("foo == bar"; "identifier as literal")]
    #[test_case("1 == 2"; "literal against literal")]
    #[test_case("&& foo == 1"; "leading operator")]
    #[test_case("foo == 1 &&"; "dangling operator")]
    #[test_case("foo == 99999999999999999999"; "integer out of range")]
    fn parse_errors(input: &str) {
        assert_that!(parse_condition(input)).is_err();
    }

    #[test]
    fn out_of_range_integer_error_is_specific() {
        let err = parse_condition("foo == 99999999999999999999").unwrap_err();
        assert_eq!(err, ParseError::IntOutOfRange { pos: 7 });
    }

    #[test]
    fn arbitrary_input_never_panics() {
        let inputs = [
            "\0\0\0",
            "((((((((",
            "))))))))",
            "a == 'unterminated",
            "== == ==",
            "🦀 == 1",
            "a == 1 || || b == 2",
            "!!!!",
            "\\",
            "0.0.0.0",
            "_ == _",
        ];
        for input in inputs {
            // Errors are fine; panics are not.
            let _ = parse_condition(input);
        }
    }

    #[test_case("foo != true"; "single field")]
    #[test_case("foo != true && bar < 20"; "and fields")]
    #[test_case("foo != true || bar < 20"; "or fields")]
    #[test_case("a == 1 && (b == 'x' || c < 2.5)"; "nested group")]
    fn rendering_round_trips(input: &str) {
        let parsed = parse_condition(input).unwrap();
        let rendered = parsed.to_string();
        assert_eq!(
            parse_condition(&rendered).unwrap(),
            parsed,
            "rendered form: {rendered}"
        );
    }

    #[test]
    fn complex_rendering_round_trips() {
        for input in [COND1, COND2] {
            let parsed = parse_condition(input).unwrap();
            let rendered = parsed.to_string();
            assert_eq!(parse_condition(&rendered).unwrap(), parsed);
        }
    }
}
