//! Lexical pass over candidate SQL.
//!
//! `text` is the input with comments blanked; `masked` additionally blanks the
//! contents of single-quoted literals. Both keep the byte offsets of the input,
//! so spans found in `masked` can be used to rewrite `text`.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Normal,
    Literal,
    Identifier,
    LineComment,
    BlockComment,
}

#[derive(Debug)]
pub(crate) struct Scrubbed {
    pub text: String,
    pub masked: String,
    /// A literal or quoted identifier ran to end of input.
    pub unterminated: bool,
}

fn blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        out.extend(std::iter::repeat(' ').take(c.len_utf8()));
    }
}

pub(crate) fn scrub(sql: &str) -> Scrubbed {
    let mut text = String::with_capacity(sql.len());
    let mut masked = String::with_capacity(sql.len());
    let mut mode = Mode::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match mode {
            Mode::Normal => match c {
                '\'' => {
                    mode = Mode::Literal;
                    text.push(c);
                    masked.push(c);
                }
                '"' => {
                    mode = Mode::Identifier;
                    text.push(c);
                    masked.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    mode = Mode::LineComment;
                    text.push_str("  ");
                    masked.push_str("  ");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    mode = Mode::BlockComment;
                    text.push_str("  ");
                    masked.push_str("  ");
                }
                _ => {
                    text.push(c);
                    masked.push(c);
                }
            },
            Mode::Literal => match c {
                '\'' if chars.peek() == Some(&'\'') => {
                    chars.next();
                    text.push_str("''");
                    masked.push_str("  ");
                }
                '\\' => {
                    text.push(c);
                    blank(&mut masked, c);
                    if let Some(escaped) = chars.next() {
                        text.push(escaped);
                        blank(&mut masked, escaped);
                    }
                }
                '\'' => {
                    mode = Mode::Normal;
                    text.push(c);
                    masked.push(c);
                }
                _ => {
                    text.push(c);
                    blank(&mut masked, c);
                }
            },
            Mode::Identifier => {
                if c == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        text.push_str("\"\"");
                        masked.push_str("\"\"");
                        continue;
                    }
                    mode = Mode::Normal;
                }
                text.push(c);
                masked.push(c);
            }
            Mode::LineComment => {
                if c == '\n' {
                    mode = Mode::Normal;
                }
                blank(&mut text, c);
                blank(&mut masked, c);
            }
            Mode::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    mode = Mode::Normal;
                    text.push_str("  ");
                    masked.push_str("  ");
                    continue;
                }
                blank(&mut text, c);
                blank(&mut masked, c);
            }
        }
    }

    Scrubbed {
        text,
        masked,
        unterminated: matches!(mode, Mode::Literal | Mode::Identifier),
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TokKind {
    Word,
    Quoted,
    Number,
    Literal,
    Punct(char),
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Token {
    pub kind: TokKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn raw<'a>(&self, src: &'a str) -> &'a str {
        &src[self.start..self.end]
    }

    /// Lowercased name for words and quoted identifiers.
    pub fn name(&self, src: &str) -> Option<String> {
        match self.kind {
            TokKind::Word => Some(self.raw(src).to_ascii_lowercase()),
            TokKind::Quoted => Some(self.raw(src).trim_matches('"').to_ascii_lowercase()),
            _ => None,
        }
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        self.kind == TokKind::Word && self.raw(src).eq_ignore_ascii_case(word)
    }

    pub fn is_punct(&self, p: char) -> bool {
        self.kind == TokKind::Punct(p)
    }
}

/// Tokenizes `masked` output of [`scrub`].
pub(crate) fn tokenize(masked: &str) -> Vec<Token> {
    let bytes = masked.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let kind = if b.is_ascii_alphabetic() || b == b'_' || b >= 0x80 {
            while i < bytes.len()
                && (bytes[i].is_ascii_alphanumeric()
                    || bytes[i] == b'_'
                    || bytes[i] == b'$'
                    || bytes[i] >= 0x80)
            {
                i += 1;
            }
            TokKind::Word
        } else if b.is_ascii_digit() {
            while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
                i += 1;
            }
            TokKind::Number
        } else if b == b'"' || b == b'\'' {
            i += 1;
            while i < bytes.len() && bytes[i] != b {
                i += 1;
            }
            i = (i + 1).min(bytes.len());
            if b == b'"' {
                TokKind::Quoted
            } else {
                TokKind::Literal
            }
        } else {
            i += 1;
            TokKind::Punct(b as char)
        };
        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }
    tokens
}
