//! Tokenizer for the nginx configuration language.
//!
//! The language has exactly three punctuation tokens (`;`, `{`, `}`); every
//! other run of characters is a literal. Literals may be quoted with `"` or
//! `'` and may escape any character with a backslash. `#` starts a comment
//! running to the end of the line. A token records both the exact source
//! bytes (`text`) and the unquoted, unescaped form (`value`).

/// Byte offset of a token in its source file. `-1` marks directives that
/// were constructed in memory rather than parsed.
pub type Pos = isize;

/// Position of synthetic directives.
pub const SYNTHETIC: Pos = -1;

/// Resolve a byte offset to a 1-based `(line, column)` pair.
///
/// Synthetic positions resolve to `(0, 0)`.
pub fn line_column(text: &str, pos: Pos) -> (usize, usize) {
    if pos < 0 {
        return (0, 0);
    }
    let pos = pos as usize;
    let prefix = &text.as_bytes()[..=pos];
    let line = 1 + prefix.iter().filter(|&&b| b == b'\n').count();
    let column = match prefix.iter().rposition(|&b| b == b'\n') {
        Some(nl) => pos - nl,
        None => pos + 1,
    };
    (line, column)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Punc,
    Literal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Exact source bytes, quotes and backslashes included.
    pub text: String,
    /// Unquoted text with escapes resolved. Empty for punctuation.
    pub value: String,
    pub pos: Pos,
}

impl Token {
    fn punc(c: char, pos: usize) -> Self {
        Token {
            kind: TokenKind::Punc,
            text: c.to_string(),
            value: String::new(),
            pos: pos as Pos,
        }
    }

    fn literal(text: String, value: String, pos: usize) -> Self {
        Token {
            kind: TokenKind::Literal,
            text,
            value,
            pos: pos as Pos,
        }
    }
}

pub struct Lexer<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Lexer { input, pos: 0 }
    }

    /// Produce the next token, or `None` at end of input.
    pub fn next_token(&mut self) -> Option<Token> {
        // Skip whitespace and comments.
        let mut start = self.pos;
        loop {
            let rest = &self.input[start..];
            let r = rest.chars().next()?;
            if r == '#' {
                match rest.find('\n') {
                    Some(n) => {
                        start += n + 1;
                        continue;
                    }
                    None => return None,
                }
            }
            if r.is_whitespace() {
                start += r.len_utf8();
                continue;
            }
            break;
        }

        let mut esc = false;
        let mut quote: Option<char> = None;
        let mut text = String::new();
        let mut value = String::new();
        let mut i = start;
        while let Some(r) = self.input[i..].chars().next() {
            let width = r.len_utf8();
            if esc {
                esc = false;
                text.push(r);
                match quote {
                    Some(q) => {
                        if r != q {
                            value.push('\\');
                        }
                    }
                    None => match r {
                        ';' | '{' | '}' | ' ' => {}
                        _ => value.push('\\'),
                    },
                }
                value.push(r);
                i += width;
                continue;
            }
            if r == '\\' {
                esc = true;
                text.push(r);
                i += width;
                continue;
            }
            if let Some(q) = quote {
                if r == q {
                    text.push(r);
                    self.pos = i + width;
                    return Some(Token::literal(text, value, start));
                }
                text.push(r);
                value.push(r);
                i += width;
                continue;
            }
            match r {
                '"' | '\'' => {
                    text.push(r);
                    if i == start {
                        quote = Some(r);
                    }
                }
                ';' | '{' | '}' => {
                    if i == start {
                        self.pos = i + width;
                        return Some(Token::punc(r, start));
                    }
                    self.pos = i;
                    return Some(Token::literal(text, value, start));
                }
                '#' => {
                    self.pos = i;
                    return Some(Token::literal(text, value, start));
                }
                _ => {
                    if r.is_whitespace() {
                        self.pos = i + width;
                        return Some(Token::literal(text, value, start));
                    }
                    text.push(r);
                    value.push(r);
                }
            }
            i += width;
        }
        if start == self.input.len() {
            return None;
        }
        self.pos = self.input.len();
        Some(Token::literal(text, value, start))
    }
}
