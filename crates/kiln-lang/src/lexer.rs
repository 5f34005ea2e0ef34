//! Lexer: source text to spanned tokens.
//!
//! The scanner proper is built from nom recognizers; the surrounding loop
//! tracks rows/columns and the indentation stack, turning physical lines
//! into `Eol`/`Indent`/`Dedent` tokens the way the parser expects blocks.
//! Lexical errors become `Error` tokens plus a diagnostic; lexing always
//! runs to the end of the file so one pass reports everything.

use crate::diagnostics::Diagnostics;
use crate::location::{Coord, Location};
use crate::token::{Token, TokenKind};
use nom::branch::alt;
use nom::bytes::complete::{is_a, take_while, take_while1};
use nom::character::complete::{char as nom_char, digit1};
use nom::combinator::{opt, recognize};
use nom::sequence::{pair, tuple};
use nom::IResult;
use std::sync::Arc;

const OPERATOR_CHARS: &str = "!$%&*+-./:<=>?@^|~";

fn is_id_start(c: char) -> bool {
    c.is_alphabetic() || c == '_'
}

fn is_id_continue(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '\''
}

fn ident(input: &str) -> IResult<&str, &str> {
    recognize(pair(take_while1(is_id_start), take_while(is_id_continue)))(input)
}

fn operator(input: &str) -> IResult<&str, &str> {
    is_a(OPERATOR_CHARS)(input)
}

/// Number recognizer; the caller decides integer vs double by shape.
fn number(input: &str) -> IResult<&str, &str> {
    recognize(tuple((
        digit1,
        opt(pair(nom_char('.'), digit1)),
        opt(tuple((
            alt((nom_char('e'), nom_char('E'))),
            opt(alt((nom_char('+'), nom_char('-')))),
            digit1,
        ))),
    )))(input)
}

fn keyword(text: &str) -> Option<TokenKind> {
    match text {
        "def" => Some(TokenKind::Def),
        "data" => Some(TokenKind::Data),
        "global" => Some(TokenKind::Global),
        "publish" => Some(TokenKind::Publish),
        "subscribe" => Some(TokenKind::Subscribe),
        "prim" => Some(TokenKind::Prim),
        "target" => Some(TokenKind::Target),
        "match" => Some(TokenKind::Match),
        "if" => Some(TokenKind::If),
        "then" => Some(TokenKind::Then),
        "else" => Some(TokenKind::Else),
        _ => None,
    }
}

struct Lexer<'a> {
    src: &'a str,
    file: Arc<str>,
    byte: usize,
    row: u32,
    col: u32,
    indents: Vec<u32>,
    tokens: Vec<Token>,
}

impl<'a> Lexer<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.byte..]
    }

    fn coord(&self) -> Coord {
        Coord::new(self.row, self.col, self.byte as u32)
    }

    fn advance(&mut self, text: &str) {
        for c in text.chars() {
            self.byte += c.len_utf8();
            if c == '\n' {
                self.row += 1;
                self.col = 1;
            } else {
                self.col += 1;
            }
        }
    }

    fn span_from(&self, start: Coord) -> Location {
        Location::new(self.file.clone(), start, self.coord())
    }

    fn push(&mut self, kind: TokenKind, text: &str, start: Coord) {
        let location = self.span_from(start);
        self.tokens.push(Token::new(kind, text, location));
    }

    /// Emit `Indent`/`Dedent` tokens for a new line indented by `width`.
    fn align(&mut self, width: u32, diags: &mut Diagnostics) {
        let start = self.coord();
        let top = *self.indents.last().unwrap();
        if width > top {
            self.indents.push(width);
            self.push(TokenKind::Indent, "", start);
        } else if width < top {
            while *self.indents.last().unwrap() > width {
                self.indents.pop();
                self.push(TokenKind::Dedent, "", start);
            }
            if *self.indents.last().unwrap() != width {
                diags.error(
                    self.span_from(start),
                    "unaligned indentation does not match any enclosing block",
                );
                self.indents.push(width);
            }
        }
    }

    fn string_literal(&mut self, diags: &mut Diagnostics) {
        let start = self.coord();
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        let open = chars.next(); // the quote itself
        debug_assert!(matches!(open, Some((_, '"'))));
        let mut consumed = 1usize;
        let mut closed = false;
        while let Some((_, c)) = chars.next() {
            consumed += c.len_utf8();
            match c {
                '"' => {
                    closed = true;
                    break;
                }
                '\n' => {
                    consumed -= 1;
                    break;
                }
                '\\' => match chars.next() {
                    Some((_, e)) => {
                        consumed += e.len_utf8();
                        match e {
                            'n' => out.push('\n'),
                            't' => out.push('\t'),
                            'r' => out.push('\r'),
                            '0' => out.push('\0'),
                            '\\' => out.push('\\'),
                            '"' => out.push('"'),
                            other => {
                                let here = self.span_from(start);
                                diags.error(here, format!("unknown escape '\\{}'", other));
                            }
                        }
                    }
                    None => break,
                },
                other => out.push(other),
            }
        }
        let text: String = self.rest()[..consumed].to_string();
        self.advance(&text);
        if closed {
            let location = self.span_from(start);
            self.tokens.push(Token::new(TokenKind::Str, out, location));
        } else {
            let location = self.span_from(start);
            diags.error(location.clone(), "unterminated string literal");
            self.tokens.push(Token::new(TokenKind::Error, out, location));
        }
    }

    /// Scan one physical line's tokens. Returns true if anything was emitted.
    fn line_tokens(&mut self, diags: &mut Diagnostics) -> bool {
        let mut emitted = false;
        loop {
            let rest = self.rest();
            let Some(c) = rest.chars().next() else { break };
            match c {
                '\n' => break,
                ' ' | '\t' | '\r' => {
                    let ws: String = rest
                        .chars()
                        .take_while(|&c| c == ' ' || c == '\t' || c == '\r')
                        .collect();
                    self.advance(&ws);
                }
                '#' => {
                    let comment: String = rest.chars().take_while(|&c| c != '\n').collect();
                    self.advance(&comment);
                }
                '"' => {
                    self.string_literal(diags);
                    emitted = true;
                }
                '(' => {
                    let start = self.coord();
                    self.advance("(");
                    self.push(TokenKind::POpen, "(", start);
                    emitted = true;
                }
                ')' => {
                    let start = self.coord();
                    self.advance(")");
                    self.push(TokenKind::PClose, ")", start);
                    emitted = true;
                }
                '\\' => {
                    let start = self.coord();
                    self.advance("\\");
                    self.push(TokenKind::Lambda, "\\", start);
                    emitted = true;
                }
                c if c.is_ascii_digit() => {
                    let start = self.coord();
                    if let Ok((_, text)) = number(rest) {
                        let kind = if text.contains('.') || text.contains('e') || text.contains('E')
                        {
                            TokenKind::Double
                        } else {
                            TokenKind::Integer
                        };
                        let owned = text.to_string();
                        self.advance(&owned);
                        self.push(kind, &owned, start);
                    } else {
                        self.advance(&c.to_string());
                        let location = self.span_from(start);
                        diags.error(location.clone(), "malformed number");
                        self.tokens.push(Token::new(TokenKind::Error, "", location));
                    }
                    emitted = true;
                }
                c if is_id_start(c) => {
                    let start = self.coord();
                    let (_, text) = ident(rest).expect("ident cannot fail on id start");
                    let owned = text.to_string();
                    self.advance(&owned);
                    let kind = keyword(&owned).unwrap_or(TokenKind::Id);
                    self.push(kind, &owned, start);
                    emitted = true;
                }
                c if OPERATOR_CHARS.contains(c) => {
                    let start = self.coord();
                    let (_, text) = operator(rest).expect("operator cannot fail here");
                    let owned = text.to_string();
                    self.advance(&owned);
                    let kind = if owned == "=" {
                        TokenKind::Equals
                    } else {
                        TokenKind::Op
                    };
                    self.push(kind, &owned, start);
                    emitted = true;
                }
                other => {
                    let start = self.coord();
                    self.advance(&other.to_string());
                    let location = self.span_from(start);
                    diags.error(location.clone(), format!("stray character '{}'", other));
                    self.tokens.push(Token::new(TokenKind::Error, "", location));
                    emitted = true;
                }
            }
        }
        emitted
    }
}

/// Lex `text` (from file `file`) into a token stream ending in `End`.
pub fn lex(file: &str, text: &str, diags: &mut Diagnostics) -> Vec<Token> {
    let mut lx = Lexer {
        src: text,
        file: Arc::from(file),
        byte: 0,
        row: 1,
        col: 1,
        indents: vec![0],
        tokens: Vec::new(),
    };

    while lx.byte < lx.src.len() {
        // Measure this line's indentation.
        let mut width = 0u32;
        let line_rest = lx.rest();
        let mut lead = String::new();
        for c in line_rest.chars() {
            match c {
                ' ' => {
                    width += 1;
                    lead.push(c);
                }
                '\t' => {
                    // Tabs count as a single column; mixing is diagnosed by
                    // the unaligned-indentation check when it bites.
                    width += 1;
                    lead.push(c);
                }
                _ => break,
            }
        }
        lx.advance(&lead);

        // Blank and comment-only lines contribute no tokens at all.
        let after = lx.rest();
        let blank = matches!(after.chars().next(), None | Some('\n') | Some('#'));
        if blank {
            let skip: String = after.chars().take_while(|&c| c != '\n').collect();
            lx.advance(&skip);
            if lx.rest().starts_with('\n') {
                lx.advance("\n");
            }
            continue;
        }

        lx.align(width, diags);
        let emitted = lx.line_tokens(diags);
        if emitted {
            let start = lx.coord();
            lx.push(TokenKind::Eol, "", start);
        }
        if lx.rest().starts_with('\n') {
            lx.advance("\n");
        }
    }

    // Close any open blocks.
    let end = lx.coord();
    while lx.indents.len() > 1 {
        lx.indents.pop();
        lx.push(TokenKind::Dedent, "", end);
    }
    lx.push(TokenKind::End, "", end);
    lx.tokens
}
