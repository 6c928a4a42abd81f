use std::rc::Rc;

use crate::{
    diagnostics::{CodeLocation, Diagnostic, DitError, Result},
    environment::SlotId,
    grammar::{self, Grammar, ValueKind},
};

/// A byte range of a shared source buffer, plus the location its first byte had in
/// the file it was sliced from.
#[derive(Debug, Clone)]
pub struct SourceView {
    source: Rc<str>,
    start: usize,
    end: usize,
    start_loc: CodeLocation,
}

impl SourceView {
    pub fn new(source: impl Into<Rc<str>>) -> Self {
        let source: Rc<str> = source.into();
        let end = source.len();
        Self {
            source,
            start: 0,
            end,
            start_loc: CodeLocation::start(),
        }
    }

    /// Slices `start..end` (offsets relative to this view) into a child view.
    pub fn slice(&self, start: usize, end: usize, start_loc: CodeLocation) -> Self {
        Self {
            source: Rc::clone(&self.source),
            start: self.start + start,
            end: self.start + end,
            start_loc: CodeLocation::new(0, start_loc.col, start_loc.line),
        }
    }

    pub fn text(&self) -> &str {
        &self.source[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn start_loc(&self) -> CodeLocation {
        self.start_loc
    }

    /// Reconstructs the full line containing `loc`, looking past the view's edges
    /// into the enclosing buffer.
    pub fn line_text(&self, loc: CodeLocation) -> &str {
        let abs = (self.start + loc.pos).min(self.source.len());
        let bytes = self.source.as_bytes();
        let begin = bytes[..abs]
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |idx| idx + 1);
        let end = bytes[abs..]
            .iter()
            .position(|byte| *byte == b'\n')
            .map_or(bytes.len(), |idx| abs + idx);
        &self.source[begin..end]
    }
}

/// Cursor over a [`SourceView`].
#[derive(Debug, Clone)]
pub struct CharFeed {
    view: SourceView,
    loc: CodeLocation,
}

impl CharFeed {
    pub fn new(view: SourceView) -> Self {
        let loc = view.start_loc();
        Self { view, loc }
    }

    pub fn view(&self) -> &SourceView {
        &self.view
    }

    pub fn loc(&self) -> CodeLocation {
        self.loc
    }

    /// True once every byte has been popped.
    pub fn eof(&self) -> bool {
        self.loc.pos >= self.view.len()
    }

    /// Byte at the cursor. Callers check [`CharFeed::eof`] first.
    pub fn current(&self) -> u8 {
        self.view.text().as_bytes()[self.loc.pos]
    }

    pub fn peek(&self) -> Option<u8> {
        self.view.text().as_bytes().get(self.loc.pos + 1).copied()
    }

    pub fn pop(&mut self) -> Result<u8> {
        if self.eof() {
            return Err(DitError::from(
                Diagnostic::critical("Character feed popped past end of input").at(self.loc),
            ));
        }
        let byte = self.current();
        self.loc.pos += 1;
        if byte == b'\n' {
            self.loc.line += 1;
            self.loc.col = 1;
        } else {
            self.loc.col += 1;
        }
        Ok(byte)
    }

    /// Offset of the next `target` at or after the cursor, without moving it.
    pub fn find_char_ahead(&self, target: u8) -> Option<usize> {
        self.view.text().as_bytes()[self.loc.pos..]
            .iter()
            .position(|byte| *byte == target)
            .map(|idx| self.loc.pos + idx)
    }

    pub fn line_text(&self, loc: CodeLocation) -> &str {
        self.view.line_text(loc)
    }

    fn char_at_cursor(&self) -> char {
        self.view.text()[self.loc.pos..].chars().next().unwrap_or('?')
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    None,
    Word(String),
    Resolved { word: String, slot: SlotId },
    Number(f64),
}

#[derive(Debug, Clone)]
pub struct Token {
    pub grammar: Grammar,
    pub loc: CodeLocation,
    /// Offset one past the token's last byte.
    pub end: usize,
    pub payload: Payload,
}

impl Token {
    pub fn eof(loc: CodeLocation) -> Self {
        Self {
            grammar: Grammar::Eof,
            loc,
            end: loc.pos,
            payload: Payload::None,
        }
    }

    pub fn word(&self) -> Option<&str> {
        match &self.payload {
            Payload::Word(word) | Payload::Resolved { word, .. } => Some(word),
            _ => None,
        }
    }

    pub fn slot(&self) -> Option<SlotId> {
        match &self.payload {
            Payload::Resolved { slot, .. } => Some(*slot),
            _ => None,
        }
    }

    /// Location just past the token, for errors about what should have followed it.
    pub fn end_loc(&self) -> CodeLocation {
        let width = self.end.saturating_sub(self.loc.pos);
        CodeLocation::new(self.end, self.loc.col + width, self.loc.line)
    }
}

/// An identifier that matched an already-declared attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved {
    pub slot: SlotId,
    pub kind: ValueKind,
}

/// Lets the tokenizer classify words against declared names while scanning.
pub trait SymbolResolver {
    fn resolve(&self, name: &str) -> Option<Resolved>;
}

pub struct Lexer {
    feed: CharFeed,
}

impl Lexer {
    pub fn new(view: SourceView) -> Self {
        Self {
            feed: CharFeed::new(view),
        }
    }

    pub fn from_source(source: &str) -> Self {
        Self::new(SourceView::new(source))
    }

    pub fn feed(&self) -> &CharFeed {
        &self.feed
    }

    pub fn loc(&self) -> CodeLocation {
        self.feed.loc()
    }

    /// Produces the next token. With `resolve_names` unset, unknown and known words
    /// alike come back as raw [`Grammar::Word`] tokens.
    pub fn next_token(
        &mut self,
        resolver: &dyn SymbolResolver,
        resolve_names: bool,
    ) -> Result<Token> {
        self.skip_blank()?;
        if self.feed.eof() {
            return Ok(Token::eof(self.feed.loc()));
        }
        let start = self.feed.loc();
        if let Some(next) = self.feed.peek() {
            if let Some(grammar) = grammar::double([self.feed.current(), next]) {
                self.feed.pop()?;
                self.feed.pop()?;
                return Ok(self.finish(grammar, start, Payload::None));
            }
        }
        if let Some(grammar) = grammar::single(self.feed.current()) {
            self.feed.pop()?;
            return Ok(self.finish(grammar, start, Payload::None));
        }
        if grammar::is_identifier_byte(self.feed.current()) {
            return self.word(start, resolver, resolve_names);
        }
        Err(DitError::from(
            Diagnostic::syntax(format!(
                "Unrecognized token '{}'",
                self.feed.char_at_cursor()
            ))
            .at(start),
        ))
    }

    /// Scans verbatim up to the closing `quote`, leaving the cursor on it.
    pub fn scan_string(&mut self, quote: u8) -> Result<String> {
        let start = self.feed.loc();
        let Some(close) = self.feed.find_char_ahead(quote) else {
            return Err(DitError::from(
                Diagnostic::syntax("Missing closing quote").at(start),
            ));
        };
        let text = self.feed.view().text()[start.pos..close].to_string();
        while self.feed.loc().pos < close {
            self.feed.pop()?;
        }
        Ok(text)
    }

    /// Captures everything up to the brace matching one just consumed, leaving the
    /// cursor on the closing brace.
    pub fn capture_braces(&mut self) -> Result<SourceView> {
        let start = self.feed.loc();
        let mut depth = 1usize;
        loop {
            if self.feed.eof() {
                return Err(DitError::from(
                    Diagnostic::syntax("Missing closing '}'").at(start),
                ));
            }
            match self.feed.current() {
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
                _ => {}
            }
            self.feed.pop()?;
        }
        let end = self.feed.loc().pos;
        Ok(self.feed.view().slice(start.pos, end, start))
    }

    fn skip_blank(&mut self) -> Result<()> {
        while !self.feed.eof() {
            let byte = self.feed.current();
            if byte.is_ascii_whitespace() {
                self.feed.pop()?;
            } else if byte == b'/' && self.feed.peek() == Some(b'/') {
                while !self.feed.eof() && self.feed.current() != b'\n' {
                    self.feed.pop()?;
                }
            } else if byte == b'/' && self.feed.peek() == Some(b'*') {
                let start = self.feed.loc();
                self.feed.pop()?;
                self.feed.pop()?;
                loop {
                    if self.feed.eof() {
                        return Err(DitError::from(
                            Diagnostic::syntax("Unterminated block comment").at(start),
                        ));
                    }
                    if self.feed.current() == b'*' && self.feed.peek() == Some(b'/') {
                        self.feed.pop()?;
                        self.feed.pop()?;
                        break;
                    }
                    self.feed.pop()?;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn word(
        &mut self,
        start: CodeLocation,
        resolver: &dyn SymbolResolver,
        resolve_names: bool,
    ) -> Result<Token> {
        while !self.feed.eof() && grammar::is_identifier_byte(self.feed.current()) {
            self.feed.pop()?;
        }
        if start_is_digit(&self.feed, start) {
            return self.number(start);
        }
        let word = self.feed.view().text()[start.pos..self.feed.loc().pos].to_string();
        if let Some(grammar) = grammar::keyword(&word) {
            return Ok(self.finish(grammar, start, Payload::None));
        }
        if !resolve_names {
            return Ok(self.finish(Grammar::Word, start, Payload::Word(word)));
        }
        match resolver.resolve(&word) {
            Some(resolved) => Ok(self.finish(
                Grammar::Value(resolved.kind),
                start,
                Payload::Resolved {
                    word,
                    slot: resolved.slot,
                },
            )),
            None => Ok(self.finish(Grammar::NewName, start, Payload::Word(word))),
        }
    }

    fn number(&mut self, start: CodeLocation) -> Result<Token> {
        let has_fraction = !self.feed.eof()
            && self.feed.current() == b'.'
            && self.feed.peek().is_some_and(|byte| byte.is_ascii_digit());
        if has_fraction {
            self.feed.pop()?;
            while !self.feed.eof() && grammar::is_identifier_byte(self.feed.current()) {
                self.feed.pop()?;
            }
        }
        let text = &self.feed.view().text()[start.pos..self.feed.loc().pos];
        match text.parse::<f64>() {
            Ok(number) => Ok(self.finish(Grammar::Number, start, Payload::Number(number))),
            Err(_) => Err(DitError::from(
                Diagnostic::syntax(format!("Invalid number literal '{text}'")).at(start),
            )),
        }
    }

    fn finish(&self, grammar: Grammar, start: CodeLocation, payload: Payload) -> Token {
        Token {
            grammar,
            loc: start,
            end: self.feed.loc().pos,
            payload,
        }
    }
}

fn start_is_digit(feed: &CharFeed, start: CodeLocation) -> bool {
    feed.view().text().as_bytes()[start.pos].is_ascii_digit()
}
