//! Hand-written, restartable tokenizer.
//!
//! Tokens are lexed on demand from the source text. A [`Mark`] is a cheap
//! position snapshot; rolling back to one exactly restores lexical state,
//! including the regex mode, so the parser can speculate freely and nest
//! speculation without bounded token buffers.
//!
//! Whether a `/` starts a regex is not decidable lexically: the parser knows
//! when it sits at expression position and calls [`Tokenizer::start_regex`],
//! which re-kinds the upcoming slash into a regex string. The same call is
//! used mid-substitution to lex the replacement part (which has no opening
//! slash of its own).

use crate::{
    error::CompileError,
    token::{SourceId, Token, TokenKind},
    value::Value,
};

/// A snapshot of tokenizer state. Restoring it makes the tokenizer forget
/// everything lexed since the snapshot was taken.
#[derive(Debug, Clone)]
pub struct Mark {
    pos: usize,
    regex_mode: bool,
    previous: Option<Token>,
}

pub struct Tokenizer<'src> {
    source: &'src str,
    id: SourceId,
    pos: usize,
    /// Cached peeked token and the position just past it.
    cached: Option<(Token, usize)>,
    regex_mode: bool,
    previous: Option<Token>,
}

impl<'src> Tokenizer<'src> {
    pub fn new(source: &'src str, id: SourceId) -> Self {
        Self {
            source,
            id,
            pos: 0,
            cached: None,
            regex_mode: false,
            previous: None,
        }
    }

    pub fn source_id(&self) -> SourceId {
        self.id
    }

    /// The next token without consuming it.
    pub fn peek(&mut self) -> Result<Token, CompileError> {
        if let Some((tok, _)) = &self.cached {
            return Ok(tok.clone());
        }
        let start = self.pos;
        let result = self.lex();
        match result {
            Ok((tok, end)) => {
                self.pos = start; // lex() moved us; peek must not consume
                self.cached = Some((tok.clone(), end));
                Ok(tok)
            }
            Err(err) => {
                self.pos = start;
                Err(err)
            }
        }
    }

    /// Consumes and returns the next token.
    pub fn advance(&mut self) -> Result<Token, CompileError> {
        let (tok, end) = match self.cached.take() {
            Some(cached) => cached,
            None => self.lex()?,
        };
        self.pos = end;
        if tok.kind == TokenKind::RegexLiteral {
            self.regex_mode = false;
        }
        self.previous = Some(tok.clone());
        Ok(tok)
    }

    /// The most recently consumed token.
    pub fn previous(&self) -> Option<&Token> {
        self.previous.as_ref()
    }

    /// Takes a cheap checkpoint of the full lexical state.
    pub fn mark(&self) -> Mark {
        Mark {
            pos: self.pos,
            regex_mode: self.regex_mode,
            previous: self.previous.clone(),
        }
    }

    /// Restores lexical state to a checkpoint.
    pub fn rollback(&mut self, mark: Mark) {
        self.pos = mark.pos;
        self.regex_mode = mark.regex_mode;
        self.previous = mark.previous;
        self.cached = None;
    }

    /// Switches lexical mode so the next token is lexed as a regex string:
    /// everything up to the next unescaped `/`. If the mode is enabled while
    /// sitting on a `/`, that slash is consumed as the opening delimiter.
    pub fn start_regex(&mut self) {
        self.regex_mode = true;
        self.cached = None;
    }

    // ── Lexing ───────────────────────────────────────────────────────────

    /// Lexes one token starting at `self.pos`, returning it and the position
    /// one past its end. Leaves `self.pos` unspecified (callers restore it).
    fn lex(&mut self) -> Result<(Token, usize), CompileError> {
        if self.regex_mode {
            return self.lex_regex();
        }
        self.skip_trivia_except_newline();
        let start = self.pos;
        let Some(c) = self.current_char() else {
            return Ok((self.make(TokenKind::Eof, start, start), start));
        };

        if c == '\n' {
            // Collapse a run of newlines (and interleaved trivia) into one EOL
            let mut end = self.pos + 1;
            loop {
                self.pos = end;
                self.skip_trivia_except_newline();
                if self.current_char() == Some('\n') {
                    end = self.pos + 1;
                } else {
                    break;
                }
            }
            return Ok((self.make(TokenKind::Eol, start, start + 1), end));
        }
        if c.is_ascii_digit() {
            return self.lex_number(start);
        }
        if c == '\'' || c == '"' {
            return self.lex_string(start, c);
        }
        if c.is_alphabetic() || c == '_' || c == '$' {
            return Ok(self.lex_identifier(start));
        }
        self.lex_operator(start)
    }

    fn lex_regex(&mut self) -> Result<(Token, usize), CompileError> {
        // The mode flag stays set until the regex token is consumed, so a
        // mark taken after a peek still snapshots the right lexical state.
        let start = self.pos;
        if self.current_char() == Some('/') {
            self.pos += 1;
        }
        let mut pattern = String::new();
        loop {
            match self.current_char() {
                None => {
                    let tok = self.make(TokenKind::Eof, start, start);
                    return Err(CompileError::eof("unterminated regex", &tok));
                }
                Some('/') => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => {
                    self.pos += 1;
                    match self.current_char() {
                        Some('/') => {
                            pattern.push('/');
                            self.pos += 1;
                        }
                        Some(other) => {
                            // Other escapes pass through to the regex engine
                            pattern.push('\\');
                            pattern.push(other);
                            self.pos += other.len_utf8();
                        }
                        None => {
                            let tok = self.make(TokenKind::Eof, start, start);
                            return Err(CompileError::eof("unterminated regex", &tok));
                        }
                    }
                }
                Some(other) => {
                    pattern.push(other);
                    self.pos += other.len_utf8();
                }
            }
        }
        let end = self.pos;
        let tok = self
            .make(TokenKind::RegexLiteral, start, end)
            .with_value(Value::String(pattern));
        Ok((tok, end))
    }

    fn lex_number(&mut self, start: usize) -> Result<(Token, usize), CompileError> {
        let mut saw_dot = false;
        while let Some(c) = self.current_char() {
            if c.is_ascii_digit() || c == '_' {
                self.pos += 1;
            } else if c == '.' && !saw_dot && self.char_at(self.pos + 1).is_some_and(|d| d.is_ascii_digit()) {
                saw_dot = true;
                self.pos += 1;
            } else {
                break;
            }
        }
        let digits_end = self.pos;
        let digits: String = self.source[start..digits_end].chars().filter(|c| *c != '_').collect();
        let suffix = self.current_char();
        let (kind, value, end) = match suffix {
            Some('L' | 'l') if !saw_dot => {
                let v: i64 = digits.parse().map_err(|_| self.number_error(start, digits_end))?;
                (TokenKind::LongLiteral, Value::Long(v), digits_end + 1)
            }
            Some('D' | 'd') => {
                let v: f64 = digits.parse().map_err(|_| self.number_error(start, digits_end))?;
                (TokenKind::DoubleLiteral, Value::Double(v), digits_end + 1)
            }
            _ if saw_dot => {
                let v = digits.parse().map_err(|()| self.number_error(start, digits_end))?;
                (TokenKind::DecimalLiteral, Value::Decimal(v), digits_end)
            }
            _ => {
                let v: i64 = digits.parse().map_err(|_| self.number_error(start, digits_end))?;
                let Ok(v) = i32::try_from(v) else {
                    let tok = self.make(TokenKind::IntLiteral, start, digits_end);
                    return Err(CompileError::syntax(
                        "number too large for int (use the L suffix for a long)",
                        &tok,
                    ));
                };
                (TokenKind::IntLiteral, Value::Int(v), digits_end)
            }
        };
        let tok = self.make(kind, start, end).with_value(value);
        Ok((tok, end))
    }

    fn number_error(&self, start: usize, end: usize) -> CompileError {
        let tok = self.make(TokenKind::IntLiteral, start, end);
        CompileError::syntax("malformed numeric literal", &tok)
    }

    fn lex_string(&mut self, start: usize, quote: char) -> Result<(Token, usize), CompileError> {
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.current_char() {
                None | Some('\n') => {
                    let tok = self.make(TokenKind::StringLiteral, start, self.pos);
                    return Err(CompileError::eof("unterminated string", &tok));
                }
                Some(c) if c == quote => {
                    self.pos += 1;
                    break;
                }
                Some('\\') => {
                    self.pos += 1;
                    let escaped = match self.current_char() {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('\\') => '\\',
                        Some('\'') => '\'',
                        Some('"') => '"',
                        Some('$') => '$',
                        Some('0') => '\0',
                        Some(other) => {
                            let tok = self.make(TokenKind::StringLiteral, self.pos, self.pos + 1);
                            return Err(CompileError::syntax(
                                format!("unknown escape sequence '\\{other}'"),
                                &tok,
                            ));
                        }
                        None => {
                            let tok = self.make(TokenKind::StringLiteral, start, self.pos);
                            return Err(CompileError::eof("unterminated string", &tok));
                        }
                    };
                    text.push(escaped);
                    self.pos += 1;
                }
                Some(other) => {
                    text.push(other);
                    self.pos += other.len_utf8();
                }
            }
        }
        let end = self.pos;
        let tok = self
            .make(TokenKind::StringLiteral, start, end)
            .with_value(Value::String(text));
        Ok((tok, end))
    }

    fn lex_identifier(&mut self, start: usize) -> (Token, usize) {
        self.pos += 1;
        while let Some(c) = self.current_char() {
            if c.is_alphanumeric() || c == '_' || c == '$' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let end = self.pos;
        let lexeme = &self.source[start..end];
        match TokenKind::keyword(lexeme) {
            Some(kind) => {
                let mut tok = self.make(kind, start, end);
                tok.keyword = true;
                (tok, end)
            }
            None => (self.make(TokenKind::Identifier, start, end), end),
        }
    }

    fn lex_operator(&mut self, start: usize) -> Result<(Token, usize), CompileError> {
        use TokenKind::*;

        // Longest-match first
        static THREE: &[(&str, TokenKind)] = &[
            ("===", TripleEqual),
            ("!==", BangEqualEqual),
            ("<=>", Spaceship),
            (">>>", ShiftRightUnsigned),
            ("<<=", ShiftLeftEqual),
            (">>=", ShiftRightEqual),
            ("%%=", PercentPercentEqual),
        ];
        static FOUR: &[(&str, TokenKind)] = &[(">>>=", ShiftRightUnsignedEqual)];
        static TWO: &[(&str, TokenKind)] = &[
            ("==", EqualEqual),
            ("!=", BangEqual),
            ("<=", LessEqual),
            (">=", GreaterEqual),
            ("=~", EqualTilde),
            ("!~", BangTilde),
            ("&&", AmpersandAmpersand),
            ("||", PipePipe),
            ("++", PlusPlus),
            ("--", MinusMinus),
            ("+=", PlusEqual),
            ("-=", MinusEqual),
            ("*=", StarEqual),
            ("/=", SlashEqual),
            ("%=", PercentEqual),
            ("%%", PercentPercent),
            ("&=", AmpersandEqual),
            ("|=", PipeEqual),
            ("^=", CaretEqual),
            ("<<", ShiftLeft),
            (">>", ShiftRight),
            ("?.", QuestionDot),
            ("?[", QuestionSquare),
            ("?:", QuestionColon),
            ("?=", QuestionEqual),
            ("->", Arrow),
        ];

        let rest = &self.source[start..];
        // `!in` and `!instanceof` are single tokens when a word boundary follows
        for (word, kind) in [("!instanceof", BangInstanceof), ("!in", BangIn)] {
            if rest.starts_with(word)
                && !rest[word.len()..]
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_')
            {
                let end = start + word.len();
                return Ok((self.make(kind, start, end), end));
            }
        }
        for table in [FOUR, THREE, TWO] {
            for (sym, kind) in table {
                if rest.starts_with(sym) {
                    let end = start + sym.len();
                    return Ok((self.make(*kind, start, end), end));
                }
            }
        }
        let c = rest.chars().next().expect("lex_operator called at EOF");
        let kind = match c {
            '(' => LeftParen,
            ')' => RightParen,
            '{' => LeftBrace,
            '}' => RightBrace,
            '[' => LeftSquare,
            ']' => RightSquare,
            ',' => Comma,
            '.' => Dot,
            ';' => Semicolon,
            ':' => Colon,
            '?' => Question,
            '=' => Equal,
            '!' => Bang,
            '<' => Less,
            '>' => Greater,
            '+' => Plus,
            '-' => Minus,
            '*' => Star,
            '/' => Slash,
            '%' => Percent,
            '&' => Ampersand,
            '|' => Pipe,
            '^' => Caret,
            '~' => Tilde,
            other => {
                let tok = self.make(TokenKind::Eof, start, start + other.len_utf8());
                return Err(CompileError::syntax(format!("unexpected character '{other}'"), &tok));
            }
        };
        let end = start + c.len_utf8();
        Ok((self.make(kind, start, end), end))
    }

    fn skip_trivia_except_newline(&mut self) {
        loop {
            match self.current_char() {
                Some(c) if c != '\n' && c.is_whitespace() => self.pos += c.len_utf8(),
                Some('/') if self.char_at(self.pos + 1) == Some('/') => {
                    while let Some(c) = self.current_char() {
                        if c == '\n' {
                            break;
                        }
                        self.pos += c.len_utf8();
                    }
                }
                Some('/') if self.char_at(self.pos + 1) == Some('*') => {
                    self.pos += 2;
                    while self.pos < self.source.len() {
                        if self.source[self.pos..].starts_with("*/") {
                            self.pos += 2;
                            break;
                        }
                        self.pos += self.current_char().map_or(1, char::len_utf8);
                    }
                }
                _ => break,
            }
        }
    }

    fn current_char(&self) -> Option<char> {
        self.source[self.pos..].chars().next()
    }

    fn char_at(&self, pos: usize) -> Option<char> {
        if pos > self.source.len() {
            return None;
        }
        self.source[pos..].chars().next()
    }

    fn make(&self, kind: TokenKind, start: usize, end: usize) -> Token {
        Token::new(
            kind,
            self.id,
            u32::try_from(start).expect("source too large"),
            &self.source[start.min(self.source.len())..end.min(self.source.len())],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut t = Tokenizer::new(source, SourceId::new(0));
        let mut out = vec![];
        loop {
            let tok = t.advance().unwrap();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn basic_operators() {
        assert_eq!(
            kinds("a <=> b >>> 2"),
            vec![
                TokenKind::Identifier,
                TokenKind::Spaceship,
                TokenKind::Identifier,
                TokenKind::ShiftRightUnsigned,
                TokenKind::IntLiteral,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn bang_in_requires_word_boundary() {
        assert_eq!(
            kinds("x !in list"),
            vec![
                TokenKind::Identifier,
                TokenKind::BangIn,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
        assert_eq!(
            kinds("!index"),
            vec![TokenKind::Bang, TokenKind::Identifier, TokenKind::Eof]
        );
    }

    #[test]
    fn numeric_suffixes() {
        let mut t = Tokenizer::new("1 2L 3.5 4.5D", SourceId::new(0));
        assert_eq!(t.advance().unwrap().kind, TokenKind::IntLiteral);
        assert_eq!(t.advance().unwrap().kind, TokenKind::LongLiteral);
        assert_eq!(t.advance().unwrap().kind, TokenKind::DecimalLiteral);
        assert_eq!(t.advance().unwrap().kind, TokenKind::DoubleLiteral);
    }

    #[test]
    fn int_overflow_needs_long_suffix() {
        let mut t = Tokenizer::new("99999999999", SourceId::new(0));
        assert!(t.advance().is_err());
        let mut t = Tokenizer::new("99999999999L", SourceId::new(0));
        assert_eq!(t.advance().unwrap().value, Some(Value::Long(99_999_999_999)));
    }

    #[test]
    fn string_escapes() {
        let mut t = Tokenizer::new(r"'a\nb'", SourceId::new(0));
        assert_eq!(t.advance().unwrap().value, Some(Value::String("a\nb".into())));
    }

    #[test]
    fn newline_run_collapses_to_one_eol() {
        assert_eq!(
            kinds("a\n\n\nb"),
            vec![
                TokenKind::Identifier,
                TokenKind::Eol,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn comments_are_trivia() {
        assert_eq!(
            kinds("a // comment\nb /* inline */ c"),
            vec![
                TokenKind::Identifier,
                TokenKind::Eol,
                TokenKind::Identifier,
                TokenKind::Identifier,
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn regex_mode_lexes_to_closing_slash() {
        let mut t = Tokenizer::new("/a\\/b/gi", SourceId::new(0));
        t.start_regex();
        let tok = t.advance().unwrap();
        assert_eq!(tok.kind, TokenKind::RegexLiteral);
        assert_eq!(tok.value, Some(Value::String("a/b".into())));
        // Modifiers lex as an adjacent identifier
        let mods = t.advance().unwrap();
        assert_eq!(mods.kind, TokenKind::Identifier);
        assert_eq!(mods.lexeme, "gi");
    }

    #[test]
    fn mark_rollback_restores_regex_mode() {
        let mut t = Tokenizer::new("/ab/ x", SourceId::new(0));
        t.start_regex();
        let mark = t.mark();
        let tok = t.advance().unwrap();
        assert_eq!(tok.kind, TokenKind::RegexLiteral);
        t.rollback(mark);
        let again = t.advance().unwrap();
        assert_eq!(again.kind, TokenKind::RegexLiteral);
        assert_eq!(again.value, Some(Value::String("ab".into())));
    }

    #[test]
    fn nested_marks() {
        let mut t = Tokenizer::new("a b c", SourceId::new(0));
        let outer = t.mark();
        t.advance().unwrap();
        let inner = t.mark();
        t.advance().unwrap();
        t.rollback(inner);
        assert_eq!(t.peek().unwrap().lexeme, "b");
        t.rollback(outer);
        assert_eq!(t.peek().unwrap().lexeme, "a");
    }
}
