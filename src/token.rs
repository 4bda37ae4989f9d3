//! Byte-at-a-time tokenizer.
//!
//! Tokens are classified and fingerprinted as they are scanned; the
//! parser keys every later decision off the 32-bit fingerprint alone.
//! The source stays on disk: the tokenizer holds a single lookahead byte
//! and supports a precise [`Tokenizer::set_location`] rewind so function
//! bodies can be skipped on the first pass and re-scanned later.

use std::io::{Read, Seek, SeekFrom};

use crate::consts::MAX_TOKEN_TEXT;
use crate::error::{CompileError, CompileResult};
use crate::fingerprint::{self, NUMBER_FP, SEED};

/// Classification of the current token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenClass {
    Number,
    String,
    Word,
    Operator,
    Special,
    Unknown,
    Eof,
}

/// Streaming tokenizer over a seekable byte source.
#[derive(Debug)]
pub struct Tokenizer<S> {
    source: S,
    /// Bytes consumed from the source, including the lookahead byte.
    pos: u32,
    text: [u8; MAX_TOKEN_TEXT],
    class: TokenClass,
    numeric: u32,
    line: u32,
    column: u32,
    next: u8,
    eof: bool,
    str_delim: u8,
}

fn is_word_start(ch: u8) -> bool {
    ch.is_ascii_alphabetic() || ch == b'_'
}

fn is_word_char(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || ch == b'_'
}

impl<S: Read + Seek> Tokenizer<S> {
    /// Start tokenizing `source` from its current position.
    pub fn new(source: S) -> CompileResult<Self> {
        let mut tok = Self {
            source,
            pos: 0,
            text: [0; MAX_TOKEN_TEXT],
            class: TokenClass::Unknown,
            numeric: 0,
            line: 0,
            column: 0,
            next: 0,
            eof: false,
            str_delim: 0,
        };
        tok.read()?;
        Ok(tok)
    }

    fn read(&mut self) -> CompileResult<()> {
        let mut byte = [0u8; 1];
        let got = self.source.read(&mut byte)?;
        self.eof = got != 1;
        self.next = if self.eof { 0 } else { byte[0] };
        if !self.eof {
            self.pos += 1;
        }
        if self.next == b'\n' {
            self.column = 0;
            self.line += 1;
        } else {
            self.column += 1;
        }
        Ok(())
    }

    /// Source offset of the byte after the current lookahead.
    pub fn location(&self) -> u32 {
        self.pos
    }

    /// Rewind to `offset` and resume with the line counter primed to
    /// `line` (1-based, as reported by [`Tokenizer::line`]).
    pub fn set_location(&mut self, offset: u32, line: u32) -> CompileResult<()> {
        self.line = line.saturating_sub(1);
        self.column = 0;
        self.source.seek(SeekFrom::Start(u64::from(offset)))?;
        self.pos = offset;
        self.eof = false;
        self.read()
    }

    /// Text of the current token, up to the buffer capacity.
    pub fn text(&self) -> &[u8] {
        let len = self.text.iter().position(|&b| b == 0).unwrap_or(MAX_TOKEN_TEXT);
        &self.text[..len]
    }

    /// 1-based line of the current token.
    pub fn line(&self) -> u32 {
        self.line + 1
    }

    /// Column within the current line.
    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn class(&self) -> TokenClass {
        self.class
    }

    /// Value of the current numeric literal.
    pub fn numeric(&self) -> u32 {
        self.numeric
    }

    pub fn is_numeric(&self) -> bool {
        self.class == TokenClass::Number
    }

    pub fn is_operator(&self) -> bool {
        self.class == TokenClass::Operator
    }

    pub fn is_special(&self) -> bool {
        self.class == TokenClass::Special
    }

    pub fn is_string(&self) -> bool {
        self.class == TokenClass::String
    }

    /// Scan the next token and return its fingerprint.
    ///
    /// Inside a string literal each call delivers one character in
    /// `text()[0]` (fingerprint 0) until the closing delimiter is
    /// consumed, at which point scanning continues normally.
    pub fn get(&mut self) -> CompileResult<u32> {
        self.numeric = 0;
        self.text = [0; MAX_TOKEN_TEXT];

        if self.class == TokenClass::String {
            if self.eof {
                return Err(CompileError::Lex("unterminated string"));
            }
            if self.next != self.str_delim {
                self.text[0] = self.next;
                self.read()?;
                return Ok(0);
            }
            self.read()?;
        }

        self.class = TokenClass::Unknown;

        // Whitespace and comments interleave; keep skipping until a
        // token byte survives.
        loop {
            let mut skipped = false;
            self.text[0] = self.next;

            while !self.eof && self.next <= 32 {
                self.read()?;
                skipped = true;
            }

            if self.next == b'/' {
                self.read()?;
                skipped = true;
                if self.next == b'/' {
                    while self.next != b'\n' && !self.eof {
                        self.read()?;
                    }
                } else if self.next == b'*' {
                    loop {
                        self.read()?;
                        if self.next == b'*' {
                            self.read()?;
                            if self.next == b'/' {
                                self.read()?;
                                break;
                            }
                        }
                        if self.eof {
                            break;
                        }
                    }
                } else if self.next == b'=' {
                    self.text[1] = self.next;
                    self.read()?;
                    self.class = TokenClass::Operator;
                    return Ok(fingerprint::fp("/="));
                } else {
                    self.class = TokenClass::Operator;
                    return Ok(fingerprint::fp("/"));
                }
            }

            if !skipped {
                break;
            }
        }

        if self.eof {
            self.class = TokenClass::Eof;
            return Ok(0);
        }

        if self.next == b'"' || self.next == b'\'' || self.next == b'`' {
            self.str_delim = self.next;
            self.read()?;
            if self.eof {
                return Err(CompileError::Lex("unterminated string"));
            }
            self.class = TokenClass::String;
            if self.next == self.str_delim {
                // Empty string: stay in string mode for zero characters.
                self.text[0] = 0;
            } else {
                self.text[0] = self.next;
                self.read()?;
            }
            return Ok(0);
        }

        if self.next == b'!' {
            self.class = TokenClass::Operator;
            self.read()?;
            if self.next == b'=' {
                self.text[1] = self.next;
                self.read()?;
                if self.next == b'=' {
                    self.text[2] = self.next;
                    self.read()?;
                    return Ok(fingerprint::fp("!=="));
                }
                return Ok(fingerprint::fp("!="));
            }
            return Ok(fingerprint::fp("!"));
        }

        if self.next == b'~' {
            self.class = TokenClass::Operator;
            self.read()?;
            return Ok(fingerprint::fp("~"));
        }

        if self.next == b'-' {
            self.class = TokenClass::Operator;
            self.read()?;
            if self.next == b'=' {
                self.text[1] = self.next;
                self.read()?;
                return Ok(fingerprint::fp("-="));
            }
            if self.next == b'-' {
                self.text[1] = self.next;
                self.read()?;
                return Ok(fingerprint::fp("--"));
            }
            return Ok(fingerprint::fp("-"));
        }

        for sp in b"(){}[];,." {
            if self.next == *sp {
                self.class = TokenClass::Special;
                self.read()?;
                return Ok(fingerprint::step(SEED, *sp));
            }
        }

        for op in b"+=*^%<>&|" {
            if self.next != *op {
                continue;
            }
            self.class = TokenClass::Operator;
            self.read()?;
            let mut acc = fingerprint::step(SEED, *op);
            if self.next == b'=' {
                self.text[1] = self.next;
                self.read()?;
                return Ok(fingerprint::step(acc, b'='));
            }
            if self.next == *op {
                self.text[1] = self.next;
                self.read()?;
                acc = fingerprint::step(acc, *op);
                // ">>" alone may extend to ">>>" and ">>>=".
                if *op == b'>' && self.next == b'>' {
                    self.text[2] = self.next;
                    self.read()?;
                    acc = fingerprint::step(acc, b'>');
                    if self.next == b'=' {
                        self.text[3] = self.next;
                        self.read()?;
                        return Ok(fingerprint::step(acc, b'='));
                    }
                    return Ok(acc);
                }
                if self.next == b'=' {
                    self.text[2] = self.next;
                    self.read()?;
                    return Ok(fingerprint::step(acc, b'='));
                }
                return Ok(acc);
            }
            return Ok(acc);
        }

        if is_word_start(self.next) {
            self.class = TokenClass::Word;
            let mut acc = SEED;
            let mut pos = 0;
            loop {
                if pos + 1 >= MAX_TOKEN_TEXT {
                    return Err(CompileError::Lex("token too long"));
                }
                self.text[pos] = self.next;
                pos += 1;
                acc = fingerprint::step(acc, self.next);
                self.read()?;
                if self.eof || !is_word_char(self.next) {
                    break;
                }
            }
            return Ok(acc);
        }

        if self.next.is_ascii_digit() {
            self.class = TokenClass::Number;
            self.text[0] = self.next;
            if self.next == b'0' {
                self.read()?;
                if self.next == b'x' || self.next == b'X' {
                    self.text[1] = self.next;
                    self.read()?;
                    return self.scan_radix(16, 2);
                }
                if self.next == b'b' || self.next == b'B' {
                    self.text[1] = self.next;
                    self.read()?;
                    return self.scan_radix(2, 2);
                }
                if !self.next.is_ascii_digit() {
                    return Ok(NUMBER_FP);
                }
                return self.scan_radix(10, 1);
            }
            return self.scan_decimal();
        }

        if !self.eof {
            let ret = fingerprint::step(SEED, self.next);
            self.read()?;
            return Ok(ret);
        }

        self.class = TokenClass::Eof;
        Ok(0)
    }

    fn scan_decimal(&mut self) -> CompileResult<u32> {
        let mut pos = 0;
        loop {
            if pos + 1 >= MAX_TOKEN_TEXT {
                return Err(CompileError::Lex("number too long"));
            }
            self.numeric = self.numeric.wrapping_mul(10).wrapping_add(u32::from(self.next - b'0'));
            self.text[pos] = self.next;
            pos += 1;
            self.read()?;
            if self.eof || !self.next.is_ascii_digit() {
                break;
            }
        }
        Ok(NUMBER_FP)
    }

    fn scan_radix(&mut self, radix: u32, mut pos: usize) -> CompileResult<u32> {
        let mut any = false;
        while !self.eof {
            let digit = match self.next {
                b'0'..=b'9' => u32::from(self.next - b'0'),
                b'a'..=b'f' => 10 + u32::from(self.next - b'a'),
                b'A'..=b'F' => 10 + u32::from(self.next - b'A'),
                _ => break,
            };
            if digit >= radix {
                break;
            }
            if pos + 1 >= MAX_TOKEN_TEXT {
                return Err(CompileError::Lex("number too long"));
            }
            self.numeric = self.numeric.wrapping_mul(radix).wrapping_add(digit);
            self.text[pos] = self.next;
            pos += 1;
            any = true;
            self.read()?;
        }
        if !any {
            return Err(CompileError::Lex("malformed number"));
        }
        Ok(NUMBER_FP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fp;
    use std::io::Cursor;

    fn tok(src: &str) -> Tokenizer<Cursor<Vec<u8>>> {
        Tokenizer::new(Cursor::new(src.as_bytes().to_vec())).unwrap()
    }

    #[test]
    fn words_and_numbers() {
        let mut t = tok("var x = 42;");
        assert_eq!(t.get().unwrap(), fp("var"));
        assert_eq!(t.class(), TokenClass::Word);
        assert_eq!(t.get().unwrap(), fp("x"));
        assert_eq!(t.get().unwrap(), fp("="));
        assert_eq!(t.get().unwrap(), NUMBER_FP);
        assert_eq!(t.numeric(), 42);
        assert_eq!(t.get().unwrap(), fp(";"));
        assert_eq!(t.class(), TokenClass::Special);
        t.get().unwrap();
        assert_eq!(t.class(), TokenClass::Eof);
    }

    #[test]
    fn radix_literals() {
        let mut t = tok("0xFF 0b101 0 12");
        t.get().unwrap();
        assert_eq!(t.numeric(), 0xFF);
        t.get().unwrap();
        assert_eq!(t.numeric(), 0b101);
        t.get().unwrap();
        assert_eq!(t.numeric(), 0);
        t.get().unwrap();
        assert_eq!(t.numeric(), 12);
    }

    #[test]
    fn compound_operators() {
        let mut t = tok("<<= >>> >>>= === !== && ||= ++ -- /=");
        for expect in ["<<=", ">>>", ">>>=", "===", "!==", "&&", "||=", "++", "--", "/="] {
            assert_eq!(t.get().unwrap(), fp(expect), "{expect}");
            assert_eq!(t.class(), TokenClass::Operator, "{expect}");
        }
    }

    #[test]
    fn comments_are_transparent() {
        let mut t = tok("a // comment\n b /* x *** y */ c");
        assert_eq!(t.get().unwrap(), fp("a"));
        assert_eq!(t.get().unwrap(), fp("b"));
        assert_eq!(t.get().unwrap(), fp("c"));
        t.get().unwrap();
        assert_eq!(t.class(), TokenClass::Eof);
    }

    #[test]
    fn string_chars_stream_one_at_a_time() {
        let mut t = tok("\"ab\" x");
        t.get().unwrap();
        assert_eq!(t.class(), TokenClass::String);
        assert_eq!(t.text()[0], b'a');
        t.get().unwrap();
        assert_eq!(t.class(), TokenClass::String);
        assert_eq!(t.text()[0], b'b');
        // Next call consumes the delimiter and scans onward.
        assert_eq!(t.get().unwrap(), fp("x"));
        assert_eq!(t.class(), TokenClass::Word);
    }

    #[test]
    fn rewind_replays_tokens() {
        let mut t = tok("one two three");
        t.get().unwrap();
        let loc = t.location();
        let line = t.line();
        assert_eq!(t.get().unwrap(), fp("two"));
        assert_eq!(t.get().unwrap(), fp("three"));
        t.set_location(loc, line).unwrap();
        assert_eq!(t.get().unwrap(), fp("two"));
    }

    #[test]
    fn line_and_column_track_newlines() {
        let mut t = tok("a\nbb\nccc");
        t.get().unwrap();
        assert_eq!(t.line(), 1);
        t.get().unwrap();
        assert_eq!(t.line(), 2);
        t.get().unwrap();
        assert_eq!(t.line(), 3);
    }

    #[test]
    fn unterminated_string_is_a_lex_error() {
        let mut t = tok("\"abc");
        t.get().unwrap();
        t.get().unwrap();
        t.get().unwrap();
        let err = loop {
            match t.get() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert!(matches!(err, CompileError::Lex(_)));
    }
}
