use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use ms_syntax::{
    intrinsic_id, new_code, FuncDef, FuncParam, LocalOnlyMode, Opcode, SourceLoc, TacLine, ValMap,
    Value, MAX_SIZE,
};
use serde::{Deserialize, Serialize};

pub const KEYWORDS: &[&str] = &[
    "break", "continue", "else", "end", "for", "function", "if", "in", "isa", "new", "null",
    "then", "repeat", "return", "while", "and", "or", "not", "true", "false",
];

#[derive(Debug, Clone)]
pub enum ParseError {
    Lexer {
        message: String,
        location: Option<SourceLoc>,
    },
    Compiler {
        message: String,
        location: Option<SourceLoc>,
    },
}

impl ParseError {
    pub fn location(&self) -> Option<&SourceLoc> {
        match self {
            ParseError::Lexer { location, .. } | ParseError::Compiler { location, .. } => {
                location.as_ref()
            }
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (prefix, message, location) = match self {
            ParseError::Lexer { message, location } => ("Lexer Error", message, location),
            ParseError::Compiler { message, location } => ("Compiler Error", message, location),
        };
        write!(f, "{}: {}", prefix, message)?;
        if let Some(location) = location {
            write!(f, " {}", location)?;
        }
        Ok(())
    }
}

impl std::error::Error for ParseError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenKind {
    Unknown,
    Keyword,
    Number,
    Str,
    Identifier,
    OpAssign,
    OpPlus,
    OpMinus,
    OpTimes,
    OpDivide,
    OpMod,
    OpPower,
    OpEqual,
    OpNotEqual,
    OpGreater,
    OpGreatEqual,
    OpLesser,
    OpLessEqual,
    OpAssignPlus,
    OpAssignMinus,
    OpAssignTimes,
    OpAssignDivide,
    OpAssignMod,
    OpAssignPower,
    LParen,
    RParen,
    LSquare,
    RSquare,
    LCurly,
    RCurly,
    AddressOf,
    Comma,
    Dot,
    Colon,
    Comment,
    Eol,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Whether whitespace preceded this token; distinguishes a call `f(x)`
    /// from a command argument `f (x)`.
    pub after_space: bool,
    /// The line number in effect once this token has been consumed.
    pub line_after: u32,
}

impl Token {
    pub fn new(kind: TokenKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
            after_space: false,
            line_after: 1,
        }
    }

    fn eof() -> Self {
        Self::new(TokenKind::Eof, "")
    }

    pub fn is_keyword(&self, word: &str) -> bool {
        self.kind == TokenKind::Keyword && self.text == word
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TokenKind::Eol => write!(f, "end of line"),
            TokenKind::Eof => write!(f, "end of input"),
            TokenKind::Str => write!(f, "\"{}\"", self.text),
            _ => write!(f, "'{}'", self.text),
        }
    }
}

fn is_identifier_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (c as u32) > 0x9F
}

fn is_identifier_char(c: char) -> bool {
    is_identifier_start(c) || c.is_ascii_digit()
}

/// Pull-based token stream over MiniScript source, with one-token lookahead
/// via a small pending queue and 1-based line numbering.
pub struct Lexer {
    chars: Vec<char>,
    position: usize,
    lexed_line: u32,
    /// Line number as of the last dequeued token.  Lookahead does not
    /// advance it.
    pub line_num: u32,
    pending: VecDeque<Token>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            position: 0,
            lexed_line: 1,
            line_num: 1,
            pending: VecDeque::new(),
        }
    }

    /// Return the next token without consuming it.  Idempotent.
    pub fn peek(&mut self) -> Result<Token, ParseError> {
        if self.pending.is_empty() {
            let token = self.lex_token()?;
            self.pending.push_back(token);
        }
        Ok(self.pending.front().cloned().expect("just queued"))
    }

    /// Consume and return the next token, advancing the line number past
    /// any line breaks it covers.
    pub fn dequeue(&mut self) -> Result<Token, ParseError> {
        let token = match self.pending.pop_front() {
            Some(token) => token,
            None => self.lex_token()?,
        };
        self.line_num = token.line_after;
        Ok(token)
    }

    pub fn at_end(&mut self) -> bool {
        if !self.pending.is_empty() {
            return self
                .pending
                .iter()
                .all(|token| token.kind == TokenKind::Eof);
        }
        self.skip_whitespace_and_comments();
        self.position >= self.chars.len()
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::Lexer {
            message: message.into(),
            location: Some(SourceLoc::new(None, self.lexed_line)),
        }
    }

    fn current(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn char_at(&self, index: usize) -> Option<char> {
        self.chars.get(index).copied()
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current() {
                Some(' ') | Some('\t') => self.position += 1,
                Some('/') if self.char_at(self.position + 1) == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' || c == '\r' {
                            break;
                        }
                        self.position += 1;
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_token(&mut self) -> Result<Token, ParseError> {
        let before = self.position;
        self.skip_whitespace_and_comments();
        let after_space = self.position > before;
        let mut token = self.lex_token_inner()?;
        token.after_space = after_space;
        token.line_after = self.lexed_line;
        Ok(token)
    }

    fn lex_token_inner(&mut self) -> Result<Token, ParseError> {
        self.skip_whitespace_and_comments();
        let c = match self.current() {
            Some(c) => c,
            None => return Ok(Token::eof()),
        };

        if c == ';' {
            self.position += 1;
            return Ok(Token::new(TokenKind::Eol, ";"));
        }
        if c == '\n' {
            self.position += 1;
            self.lexed_line += 1;
            return Ok(Token::new(TokenKind::Eol, "\n"));
        }
        if c == '\r' {
            self.position += 1;
            // CRLF is a single end-of-line token.
            if self.current() == Some('\n') {
                self.position += 1;
            }
            self.lexed_line += 1;
            return Ok(Token::new(TokenKind::Eol, "\n"));
        }
        if c == '"' {
            return self.lex_string();
        }
        if c.is_ascii_digit()
            || (c == '.' && self.char_at(self.position + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            return Ok(self.lex_number());
        }
        if is_identifier_start(c) {
            return self.lex_identifier_or_keyword();
        }

        if let Some(next) = self.char_at(self.position + 1) {
            let kind = match (c, next) {
                ('=', '=') => Some(TokenKind::OpEqual),
                ('!', '=') => Some(TokenKind::OpNotEqual),
                ('<', '=') => Some(TokenKind::OpLessEqual),
                ('>', '=') => Some(TokenKind::OpGreatEqual),
                ('+', '=') => Some(TokenKind::OpAssignPlus),
                ('-', '=') => Some(TokenKind::OpAssignMinus),
                ('*', '=') => Some(TokenKind::OpAssignTimes),
                ('/', '=') => Some(TokenKind::OpAssignDivide),
                ('%', '=') => Some(TokenKind::OpAssignMod),
                ('^', '=') => Some(TokenKind::OpAssignPower),
                _ => None,
            };
            if let Some(kind) = kind {
                self.position += 2;
                return Ok(Token::new(kind, format!("{}{}", c, next)));
            }
        }

        let kind = match c {
            '=' => TokenKind::OpAssign,
            '+' => TokenKind::OpPlus,
            '-' => TokenKind::OpMinus,
            '*' => TokenKind::OpTimes,
            '/' => TokenKind::OpDivide,
            '%' => TokenKind::OpMod,
            '^' => TokenKind::OpPower,
            '<' => TokenKind::OpLesser,
            '>' => TokenKind::OpGreater,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '[' => TokenKind::LSquare,
            ']' => TokenKind::RSquare,
            '{' => TokenKind::LCurly,
            '}' => TokenKind::RCurly,
            '@' => TokenKind::AddressOf,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            ':' => TokenKind::Colon,
            _ => TokenKind::Unknown,
        };
        self.position += 1;
        Ok(Token::new(kind, c.to_string()))
    }

    fn lex_string(&mut self) -> Result<Token, ParseError> {
        self.position += 1;
        let mut text = String::new();
        loop {
            let c = match self.current() {
                Some(c) => c,
                None => return Err(self.error("unterminated string literal")),
            };
            if c == '\n' || c == '\r' {
                return Err(self.error("unterminated string literal"));
            }
            self.position += 1;
            if c == '"' {
                // A doubled quote is an escaped quote.
                if self.current() == Some('"') {
                    self.position += 1;
                    text.push('"');
                    continue;
                }
                break;
            }
            text.push(c);
        }
        if text.len() > MAX_SIZE {
            return Err(self.error("string literal exceeds maximum length"));
        }
        Ok(Token::new(TokenKind::Str, text))
    }

    fn lex_number(&mut self) -> Token {
        let mut text = String::new();
        let first = self.current().expect("caller checked");
        text.push(first);
        self.position += 1;
        let mut seen_dot = first == '.';
        let mut seen_exp = false;
        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
            } else if c == '.' && !seen_dot && !seen_exp {
                seen_dot = true;
                text.push(c);
            } else if (c == 'E' || c == 'e') && !seen_exp {
                seen_exp = true;
                text.push(c);
                if let Some(sign) = self.char_at(self.position + 1) {
                    if sign == '+' || sign == '-' {
                        self.position += 1;
                        text.push(sign);
                    }
                }
            } else {
                break;
            }
            self.position += 1;
        }
        Token::new(TokenKind::Number, text)
    }

    fn lex_identifier_or_keyword(&mut self) -> Result<Token, ParseError> {
        let mut text = String::new();
        while let Some(c) = self.current() {
            if !is_identifier_char(c) {
                break;
            }
            text.push(c);
            self.position += 1;
        }

        if text == "end" {
            // Compound keyword: `end` must be followed by the block keyword,
            // fetched by recursively lexing the next token.
            let follower = self.lex_token()?;
            if follower.kind != TokenKind::Keyword {
                return Err(self.error(format!("'end' without following keyword (found {})", follower)));
            }
            return Ok(Token::new(
                TokenKind::Keyword,
                format!("end {}", follower.text),
            ));
        }

        if text == "else" {
            // `else if` merges into one keyword.  Detected by peeking the
            // buffer (not by recursive dequeue) so `peek` ordering holds.
            let mut probe = self.position;
            while matches!(self.char_at(probe), Some(' ') | Some('\t')) {
                probe += 1;
            }
            if self.char_at(probe) == Some('i')
                && self.char_at(probe + 1) == Some('f')
                && !self
                    .char_at(probe + 2)
                    .is_some_and(is_identifier_char)
            {
                self.position = probe + 2;
                return Ok(Token::new(TokenKind::Keyword, "else if"));
            }
            return Ok(Token::new(TokenKind::Keyword, "else"));
        }

        if KEYWORDS.contains(&text.as_str()) {
            return Ok(Token::new(TokenKind::Keyword, text));
        }
        Ok(Token::new(TokenKind::Identifier, text))
    }
}

/// Strip a trailing `//` comment that is not inside a string literal.
pub fn trim_comment(source: &str) -> &str {
    let mut iter = source.char_indices().peekable();
    while let Some((index, c)) = iter.next() {
        if c == '/' && iter.peek().map(|&(_, n)| n) == Some('/') {
            let char_pos = source[..index].chars().count();
            if !is_in_string_literal(char_pos, source, 0) {
                return &source[..index];
            }
        }
    }
    source
}

/// Whether the character at `char_pos` falls inside a string literal, judged
/// by quote parity from `start_pos`.  Doubled quotes contribute two quotes
/// and so cancel out.
pub fn is_in_string_literal(char_pos: usize, source: &str, start_pos: usize) -> bool {
    let mut quotes = 0usize;
    for (index, c) in source.chars().enumerate() {
        if index < start_pos {
            continue;
        }
        if index >= char_pos {
            break;
        }
        if c == '"' {
            quotes += 1;
        }
    }
    quotes % 2 == 1
}

/// The last meaningful token on the final line of `source`, used for
/// line-continuation detection.  Lex errors (e.g. an open string) yield an
/// Unknown token rather than propagating.
pub fn last_token(source: &str) -> Token {
    let last_line = source
        .rsplit(['\n', '\r'])
        .next()
        .unwrap_or(source);
    let last_line = trim_comment(last_line);
    let mut lexer = Lexer::new(last_line);
    let mut last = Token::new(TokenKind::Unknown, "");
    loop {
        let token = match lexer.dequeue() {
            Ok(token) => token,
            Err(_) => return Token::new(TokenKind::Unknown, ""),
        };
        match token.kind {
            TokenKind::Eof => break,
            TokenKind::Eol | TokenKind::Comment => continue,
            _ => last = token,
        }
    }
    last
}

#[derive(Debug, Clone)]
struct BackPatch {
    line_index: usize,
    waiting_for: String,
}

#[derive(Debug, Clone)]
struct JumpPoint {
    line_index: usize,
    keyword: String,
}

/// Emission state for one function body.  A fresh state is pushed when a
/// `function` literal opens and popped at `end function`.
struct ParseState {
    code: Vec<TacLine>,
    backpatches: Vec<BackPatch>,
    jump_points: Vec<JumpPoint>,
    next_temp: usize,
    local_only_identifier: Option<String>,
    local_only_strict: bool,
    func: Option<Rc<FuncDef>>,
}

impl ParseState {
    fn new() -> Self {
        Self {
            code: Vec::new(),
            backpatches: Vec::new(),
            jump_points: Vec::new(),
            next_temp: 0,
            local_only_identifier: None,
            local_only_strict: false,
            func: None,
        }
    }
}

/// Single-pass recursive-descent parser that emits three-address code as it
/// goes.  Parser state persists across `parse_repl` calls so multi-line
/// blocks can arrive one line at a time.
pub struct Parser {
    output: Vec<ParseState>,
    pending_state: Option<ParseState>,
    partial_input: String,
    pub error_context: Option<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            output: vec![ParseState::new()],
            pending_state: None,
            partial_input: String::new(),
            error_context: None,
        }
    }

    /// Parse a complete source text.  Open blocks at the end are an error.
    pub fn parse(&mut self, source: &str) -> Result<(), ParseError> {
        self.parse_source(source)?;
        if self.need_more_input() {
            let open = self.describe_open_block();
            return Err(ParseError::Compiler {
                message: format!("unexpected end of input ({})", open),
                location: None,
            });
        }
        Ok(())
    }

    /// Feed one REPL line.  Line continuations are buffered; open blocks are
    /// left open for the next call.
    pub fn parse_repl(&mut self, line: &str) -> Result<(), ParseError> {
        let combined = format!("{}{}", self.partial_input, line);
        if ends_with_line_continuation(&combined) {
            self.partial_input = combined;
            self.partial_input.push(' ');
            return Ok(());
        }
        self.partial_input.clear();
        self.parse_source(&combined)
    }

    pub fn need_more_input(&self) -> bool {
        !self.partial_input.is_empty()
            || self.output.len() > 1
            || !self.output[0].backpatches.is_empty()
    }

    /// The emitted program (the bottom parse state's code).
    pub fn program(&self) -> &[TacLine] {
        &self.output[0].code
    }

    /// Abandon any open blocks and buffered input, keeping the emitted
    /// program.  The REPL calls this after a compile error.
    pub fn partial_reset(&mut self) {
        self.output.truncate(1);
        let root = &mut self.output[0];
        root.backpatches.clear();
        root.jump_points.clear();
        root.local_only_identifier = None;
        root.local_only_strict = false;
        self.pending_state = None;
        self.partial_input.clear();
    }

    fn describe_open_block(&self) -> String {
        let state = self.output.last().expect("never empty");
        if self.output.len() > 1 {
            return "'function' without matching 'end function'".to_string();
        }
        match state.backpatches.last() {
            Some(bp) if bp.waiting_for == "end while" => {
                "'while' without matching 'end while'".to_string()
            }
            Some(bp) if bp.waiting_for == "end for" => {
                "'for' without matching 'end for'".to_string()
            }
            Some(_) => "'if' without matching 'end if'".to_string(),
            None => "open block".to_string(),
        }
    }

    fn state(&mut self) -> &mut ParseState {
        self.output.last_mut().expect("parse state stack never empty")
    }

    fn code_len(&mut self) -> usize {
        self.state().code.len()
    }

    fn next_temp(&mut self) -> usize {
        let state = self.state();
        let index = state.next_temp;
        state.next_temp += 1;
        index
    }

    fn emit(&mut self, line_num: u32, mut line: TacLine) {
        line.location = Some(SourceLoc::new(self.error_context.clone(), line_num));
        self.state().code.push(line);
    }

    fn cerr(&self, lx: &Lexer, message: impl Into<String>) -> ParseError {
        ParseError::Compiler {
            message: message.into(),
            location: Some(SourceLoc::new(self.error_context.clone(), lx.line_num)),
        }
    }

    fn patch_line(&mut self, line_index: usize, target: usize) {
        self.state().code[line_index].rhs_a = Some(Value::Number(target as f64));
    }

    fn push_backpatch(&mut self, line_index: usize, waiting_for: &str) {
        self.state().backpatches.push(BackPatch {
            line_index,
            waiting_for: waiting_for.to_string(),
        });
    }

    /// Whether any emitted jump (or open jump point) targets `index`.
    fn is_jump_target(&mut self, index: usize) -> bool {
        let state = self.state();
        for line in &state.code {
            match line.op {
                Opcode::Goto | Opcode::GotoIf | Opcode::GotoIfTruly | Opcode::GotoIfNot => {
                    if let Some(Value::Number(n)) = &line.rhs_a {
                        if *n as usize == index {
                            return true;
                        }
                    }
                }
                _ => {}
            }
        }
        state.jump_points.iter().any(|jp| jp.line_index == index)
    }

    fn allow_line_break(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        while lx.peek()?.kind == TokenKind::Eol {
            lx.dequeue()?;
        }
        Ok(())
    }

    /// Resolve the newest backpatch waiting for `tag` to the current end of
    /// code.  With `also_break`, open `break` patches resolve there too.
    fn patch(&mut self, lx: &Lexer, tag: &str, also_break: bool) -> Result<(), ParseError> {
        let target = self.code_len();
        let mut idx = self.state().backpatches.len();
        while idx > 0 {
            idx -= 1;
            let waiting = self.state().backpatches[idx].waiting_for.clone();
            if waiting == tag {
                let line = self.state().backpatches[idx].line_index;
                self.patch_line(line, target);
                self.state().backpatches.remove(idx);
                return Ok(());
            }
            if waiting == "break" {
                if also_break {
                    let line = self.state().backpatches[idx].line_index;
                    self.patch_line(line, target);
                    self.state().backpatches.remove(idx);
                }
                continue;
            }
            return Err(self.cerr(lx, format!("'{}' found, but expected '{}'", tag, waiting)));
        }
        let message = match tag {
            "end while" => "'end while' without matching 'while'",
            "end for" => "'end for' without matching 'for'",
            "else" => "'else' without matching 'if'",
            _ => "unmatched block terminator",
        };
        Err(self.cerr(lx, message))
    }

    /// Close an if block: walk the backpatch stack from the top, resolving
    /// every `end if` and `else` to the current end, until the `if:MARK`
    /// sentinel.
    fn patch_if_block(&mut self, lx: &Lexer, single_line: bool) -> Result<(), ParseError> {
        let mut idx = self.state().backpatches.len();
        while idx > 0 {
            idx -= 1;
            let waiting = self.state().backpatches[idx].waiting_for.clone();
            match waiting.as_str() {
                "if:MARK" => {
                    self.state().backpatches.remove(idx);
                    return Ok(());
                }
                "else" | "end if" => {
                    let line = self.state().backpatches[idx].line_index;
                    let target = self.code_len();
                    self.patch_line(line, target);
                    self.state().backpatches.remove(idx);
                }
                "end for" | "end while" if single_line => {
                    return Err(self.cerr(lx, "loops are not allowed in a single-line 'if'"));
                }
                "break" => {}
                other => {
                    return Err(
                        self.cerr(lx, format!("'end if' found, but expected '{}'", other))
                    );
                }
            }
        }
        Err(self.cerr(lx, "'end if' without matching 'if'"))
    }

    fn parse_source(&mut self, source: &str) -> Result<(), ParseError> {
        let mut lx = Lexer::new(source);
        loop {
            while lx.peek()?.kind == TokenKind::Eol {
                lx.dequeue()?;
                if let Some(state) = self.pending_state.take() {
                    self.output.push(state);
                }
            }
            if lx.peek()?.kind == TokenKind::Eof {
                break;
            }
            self.parse_statement(&mut lx)?;
            let tok = lx.dequeue()?;
            if tok.kind != TokenKind::Eol && tok.kind != TokenKind::Eof {
                return Err(self.cerr(&lx, format!("expected end of line, found {}", tok)));
            }
            if let Some(state) = self.pending_state.take() {
                self.output.push(state);
            }
        }
        if let Some(state) = self.pending_state.take() {
            self.output.push(state);
        }
        Ok(())
    }

    fn parse_statement(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        let tok = lx.peek()?;
        if tok.kind != TokenKind::Keyword {
            return self.parse_assignment(lx);
        }
        match tok.text.as_str() {
            "return" => {
                lx.dequeue()?;
                let next = lx.peek()?;
                let rhs = if matches!(next.kind, TokenKind::Eol | TokenKind::Eof)
                    || next.is_keyword("else")
                    || next.is_keyword("else if")
                {
                    Value::Null
                } else {
                    let val = self.parse_expr(lx, false, false)?;
                    self.fully_evaluate(lx, val)
                };
                self.emit(
                    lx.line_num,
                    TacLine::new(Some(Value::Temp(0)), Opcode::Return, Some(rhs), None),
                );
            }
            "if" => {
                lx.dequeue()?;
                self.parse_if(lx)?;
            }
            "else" | "else if" => self.parse_else(lx)?,
            "while" => {
                lx.dequeue()?;
                let top = self.code_len();
                self.state().jump_points.push(JumpPoint {
                    line_index: top,
                    keyword: "while".to_string(),
                });
                let cond = self.parse_expr(lx, false, false)?;
                let cond = self.fully_evaluate(lx, cond);
                let goto_index = self.code_len();
                self.emit(
                    lx.line_num,
                    TacLine::new(None, Opcode::GotoIfNot, None, Some(cond)),
                );
                self.push_backpatch(goto_index, "end while");
            }
            "end while" => {
                lx.dequeue()?;
                let jp = match self.state().jump_points.pop() {
                    Some(jp) if jp.keyword == "while" => jp,
                    _ => return Err(self.cerr(lx, "'end while' without matching 'while'")),
                };
                self.emit(
                    lx.line_num,
                    TacLine::new(
                        None,
                        Opcode::Goto,
                        Some(Value::Number(jp.line_index as f64)),
                        None,
                    ),
                );
                self.patch(lx, "end while", true)?;
            }
            "for" => {
                lx.dequeue()?;
                self.parse_for(lx)?;
            }
            "end for" => {
                lx.dequeue()?;
                let jp = match self.state().jump_points.pop() {
                    Some(jp) if jp.keyword == "for" => jp,
                    _ => return Err(self.cerr(lx, "'end for' without matching 'for'")),
                };
                self.emit(
                    lx.line_num,
                    TacLine::new(
                        None,
                        Opcode::Goto,
                        Some(Value::Number(jp.line_index as f64)),
                        None,
                    ),
                );
                self.patch(lx, "end for", true)?;
            }
            "break" => {
                lx.dequeue()?;
                if self.state().jump_points.is_empty() {
                    return Err(self.cerr(lx, "'break' outside of a loop"));
                }
                let goto_index = self.code_len();
                self.emit(lx.line_num, TacLine::new(None, Opcode::Goto, None, None));
                self.push_backpatch(goto_index, "break");
            }
            "continue" => {
                lx.dequeue()?;
                let target = match self.state().jump_points.last() {
                    Some(jp) => jp.line_index,
                    None => return Err(self.cerr(lx, "'continue' outside of a loop")),
                };
                self.emit(
                    lx.line_num,
                    TacLine::new(
                        None,
                        Opcode::Goto,
                        Some(Value::Number(target as f64)),
                        None,
                    ),
                );
            }
            "end if" => {
                lx.dequeue()?;
                self.patch_if_block(lx, false)?;
            }
            "end function" => {
                lx.dequeue()?;
                if self.output.len() <= 1 {
                    return Err(self.cerr(lx, "'end function' without matching 'function'"));
                }
                let state = self.output.pop().expect("checked above");
                if let Some(bp) = state.backpatches.last() {
                    return Err(self.cerr(
                        lx,
                        format!("'end function' found, but expected '{}'", bp.waiting_for),
                    ));
                }
                let func = state.func.expect("nested states always carry a function");
                *func.code.borrow_mut() = state.code;
            }
            "repeat" => {
                return Err(self.cerr(lx, "'repeat' is reserved but not yet supported"));
            }
            _ => return self.parse_assignment(lx),
        }
        Ok(())
    }

    fn parse_if(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        let cond = self.parse_expr(lx, false, false)?;
        let cond = self.fully_evaluate(lx, cond);
        let tok = lx.peek()?;
        if tok.kind == TokenKind::OpAssign {
            return Err(self.cerr(lx, "found = instead of == in if condition"));
        }
        if !tok.is_keyword("then") {
            return Err(self.cerr(lx, format!("expected 'then' in if statement, found {}", tok)));
        }
        lx.dequeue()?;
        let goto_index = self.code_len();
        self.emit(
            lx.line_num,
            TacLine::new(None, Opcode::GotoIfNot, None, Some(cond)),
        );
        self.push_backpatch(goto_index, "if:MARK");
        self.push_backpatch(goto_index, "else");

        if matches!(lx.peek()?.kind, TokenKind::Eol | TokenKind::Eof) {
            // Block form: the body follows on subsequent lines.
            return Ok(());
        }

        // Single-line form.
        self.parse_statement(lx)?;
        loop {
            let tok = lx.peek()?;
            if tok.is_keyword("else if") {
                lx.dequeue()?;
                let goto_index = self.code_len();
                self.emit(lx.line_num, TacLine::new(None, Opcode::Goto, None, None));
                self.patch(lx, "else", false)?;
                self.push_backpatch(goto_index, "end if");
                let cond = self.parse_expr(lx, false, false)?;
                let cond = self.fully_evaluate(lx, cond);
                let tok = lx.peek()?;
                if tok.kind == TokenKind::OpAssign {
                    return Err(self.cerr(lx, "found = instead of == in if condition"));
                }
                if !tok.is_keyword("then") {
                    return Err(
                        self.cerr(lx, format!("expected 'then' in if statement, found {}", tok))
                    );
                }
                lx.dequeue()?;
                let cond_index = self.code_len();
                self.emit(
                    lx.line_num,
                    TacLine::new(None, Opcode::GotoIfNot, None, Some(cond)),
                );
                self.push_backpatch(cond_index, "else");
                self.parse_statement(lx)?;
            } else if tok.is_keyword("else") {
                lx.dequeue()?;
                let goto_index = self.code_len();
                self.emit(lx.line_num, TacLine::new(None, Opcode::Goto, None, None));
                self.patch(lx, "else", false)?;
                self.push_backpatch(goto_index, "end if");
                self.parse_statement(lx)?;
                break;
            } else {
                break;
            }
        }
        self.patch_if_block(lx, true)
    }

    fn parse_else(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        let tok = lx.dequeue()?;
        let goto_index = self.code_len();
        self.emit(lx.line_num, TacLine::new(None, Opcode::Goto, None, None));
        self.patch(lx, "else", false)?;
        self.push_backpatch(goto_index, "end if");
        if tok.text == "else if" {
            let cond = self.parse_expr(lx, false, false)?;
            let cond = self.fully_evaluate(lx, cond);
            let tok = lx.peek()?;
            if tok.kind == TokenKind::OpAssign {
                return Err(self.cerr(lx, "found = instead of == in if condition"));
            }
            if !tok.is_keyword("then") {
                return Err(self.cerr(lx, format!("expected 'then' in if statement, found {}", tok)));
            }
            lx.dequeue()?;
            let cond_index = self.code_len();
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::GotoIfNot, None, Some(cond)),
            );
            self.push_backpatch(cond_index, "else");
        }
        if !matches!(lx.peek()?.kind, TokenKind::Eol | TokenKind::Eof) {
            // Inline clause body on the same line.
            self.parse_statement(lx)?;
        }
        Ok(())
    }

    fn parse_for(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        let var_tok = lx.dequeue()?;
        if var_tok.kind != TokenKind::Identifier {
            return Err(self.cerr(lx, format!("expected loop variable after 'for', found {}", var_tok)));
        }
        let in_tok = lx.dequeue()?;
        if !in_tok.is_keyword("in") {
            return Err(self.cerr(lx, format!("expected 'in' in for loop, found {}", in_tok)));
        }
        let seq = self.parse_expr(lx, false, false)?;
        let mut seq = self.fully_evaluate(lx, seq);
        if !matches!(seq, Value::Temp(_)) {
            // Evaluate the sequence once, into a hidden slot.
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Assign, Some(seq), None),
            );
            seq = Value::Temp(t);
        }
        let idx_var = Value::var(format!("__{}_idx", var_tok.text));
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(idx_var.clone()),
                Opcode::Assign,
                Some(Value::Number(-1.0)),
                None,
            ),
        );
        let top = self.code_len();
        self.state().jump_points.push(JumpPoint {
            line_index: top,
            keyword: "for".to_string(),
        });
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(idx_var.clone()),
                Opcode::Add,
                Some(idx_var.clone()),
                Some(Value::Number(1.0)),
            ),
        );
        let len_temp = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::Temp(len_temp)),
                Opcode::Length,
                Some(seq.clone()),
                None,
            ),
        );
        let cmp_temp = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::Temp(cmp_temp)),
                Opcode::Gte,
                Some(idx_var.clone()),
                Some(Value::Temp(len_temp)),
            ),
        );
        let exit_index = self.code_len();
        self.emit(
            lx.line_num,
            TacLine::new(None, Opcode::GotoIf, None, Some(Value::Temp(cmp_temp))),
        );
        self.push_backpatch(exit_index, "end for");
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::var(var_tok.text)),
                Opcode::IterElem,
                Some(seq),
                Some(idx_var),
            ),
        );
        Ok(())
    }

    fn check_lvalue(&self, lx: &Lexer, value: &Value) -> Result<(), ParseError> {
        match value {
            Value::Var { .. } | Value::SeqElem { .. } => Ok(()),
            _ => Err(self.cerr(lx, "invalid target for assignment")),
        }
    }

    fn parse_assignment(&mut self, lx: &mut Lexer) -> Result<(), ParseError> {
        let lhs = self.parse_expr(lx, true, true)?;
        let tok = lx.peek()?;
        let compound = match tok.kind {
            TokenKind::OpAssignPlus => Some(Opcode::Add),
            TokenKind::OpAssignMinus => Some(Opcode::Sub),
            TokenKind::OpAssignTimes => Some(Opcode::Mul),
            TokenKind::OpAssignDivide => Some(Opcode::Div),
            TokenKind::OpAssignMod => Some(Opcode::Mod),
            TokenKind::OpAssignPower => Some(Opcode::Pow),
            _ => None,
        };
        if tok.kind == TokenKind::OpAssign {
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            self.check_lvalue(lx, &lhs)?;
            if let Value::Var { name, .. } = &lhs {
                self.state().local_only_identifier = Some(name.to_string());
                self.state().local_only_strict = false;
            }
            let rhs = self.parse_expr(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            self.state().local_only_identifier = None;
            self.emit_assignment(lx, lhs, rhs);
            return Ok(());
        }
        if let Some(op) = compound {
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            self.check_lvalue(lx, &lhs)?;
            if let Value::Var { name, .. } = &lhs {
                self.state().local_only_identifier = Some(name.to_string());
                self.state().local_only_strict = true;
            }
            let rhs = self.parse_expr(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            self.state().local_only_identifier = None;
            let current = match &lhs {
                Value::SeqElem { base, index, .. } => {
                    let t = self.next_temp();
                    self.emit(
                        lx.line_num,
                        TacLine::new(
                            Some(Value::Temp(t)),
                            Opcode::Elem,
                            Some((**base).clone()),
                            Some((**index).clone()),
                        ),
                    );
                    Value::Temp(t)
                }
                // The read of the target itself is local-only strict: the
                // name must already be bound in this scope.
                Value::Var {
                    name, no_invoke, ..
                } => Value::Var {
                    name: Rc::clone(name),
                    no_invoke: *no_invoke,
                    local_only: LocalOnlyMode::Strict,
                },
                _ => lhs.clone(),
            };
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), op, Some(current), Some(rhs)),
            );
            self.emit_assignment(lx, lhs, Value::Temp(t));
            return Ok(());
        }

        // No assignment operator: this is a command statement.  Remaining
        // expressions up to the end of line become positional arguments.
        let mut argc = 0usize;
        loop {
            let tok = lx.peek()?;
            if matches!(tok.kind, TokenKind::Eol | TokenKind::Eof)
                || tok.is_keyword("else")
                || tok.is_keyword("else if")
            {
                break;
            }
            if tok.kind == TokenKind::Comma {
                lx.dequeue()?;
                self.allow_line_break(lx)?;
                continue;
            }
            let arg = self.parse_expr(lx, false, false)?;
            let arg = self.fully_evaluate(lx, arg);
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::PushParam, Some(arg), None),
            );
            argc += 1;
        }
        if argc == 0 {
            let val = self.fully_evaluate(lx, lhs);
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::AssignImplicit, Some(val), None),
            );
        } else {
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(
                    Some(Value::Temp(t)),
                    Opcode::CallFunction,
                    Some(lhs),
                    Some(Value::Number(argc as f64)),
                ),
            );
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::AssignImplicit, Some(Value::Temp(t)), None),
            );
        }
        Ok(())
    }

    /// Emit `target := rhs`, folding into the previous line when that line
    /// already writes the same temp (and nothing jumps to the next line),
    /// or into a `BindAssign` when the rhs is a function literal.
    fn emit_assignment(&mut self, lx: &Lexer, target: Value, rhs: Value) {
        if let Value::Temp(n) = rhs {
            let here = self.code_len();
            if !self.is_jump_target(here) {
                if let Some(last) = self.state().code.last_mut() {
                    if matches!(last.lhs, Some(Value::Temp(m)) if m == n) {
                        last.lhs = Some(target);
                        return;
                    }
                }
            }
        }
        if matches!(rhs, Value::Function(..)) {
            self.emit(
                lx.line_num,
                TacLine::new(Some(target), Opcode::BindAssign, Some(rhs), None),
            );
            return;
        }
        self.emit(
            lx.line_num,
            TacLine::new(Some(target), Opcode::Assign, Some(rhs), None),
        );
    }

    /// Reading a variable or sequence element may turn into an implicit
    /// zero-argument call; `@` and the names `self`/`super` suppress it.
    fn fully_evaluate(&mut self, lx: &Lexer, val: Value) -> Value {
        let invoke = match &val {
            Value::Var {
                name, no_invoke, ..
            } => !*no_invoke && &**name != "self" && &**name != "super",
            Value::SeqElem { no_invoke, .. } => !*no_invoke,
            _ => false,
        };
        if !invoke {
            return val;
        }
        let t = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::Temp(t)),
                Opcode::CallFunction,
                Some(val),
                Some(Value::Number(0.0)),
            ),
        );
        Value::Temp(t)
    }

    fn parse_expr(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        self.parse_function_literal(lx, as_lval, statement_start)
    }

    fn parse_function_literal(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        if !lx.peek()?.is_keyword("function") {
            return self.parse_or(lx, as_lval, statement_start);
        }
        lx.dequeue()?;
        if self.pending_state.is_some() {
            return Err(self.cerr(lx, "can't start two functions in one statement"));
        }
        let mut params = Vec::new();
        if lx.peek()?.kind == TokenKind::LParen {
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            loop {
                if lx.peek()?.kind == TokenKind::RParen {
                    lx.dequeue()?;
                    break;
                }
                let name_tok = lx.dequeue()?;
                if name_tok.kind != TokenKind::Identifier {
                    return Err(
                        self.cerr(lx, format!("expected parameter name, found {}", name_tok))
                    );
                }
                let mut default = Value::Null;
                if lx.peek()?.kind == TokenKind::OpAssign {
                    lx.dequeue()?;
                    let value = self.parse_expr(lx, false, false)?;
                    if matches!(value, Value::Temp(_)) {
                        return Err(self.cerr(lx, "parameter default value must be a literal"));
                    }
                    default = value;
                }
                params.push(FuncParam {
                    name: name_tok.text,
                    default,
                });
                match lx.peek()?.kind {
                    TokenKind::Comma => {
                        lx.dequeue()?;
                        self.allow_line_break(lx)?;
                    }
                    TokenKind::RParen => {}
                    _ => {
                        let found = lx.peek()?;
                        return Err(self.cerr(
                            lx,
                            format!("expected ',' or ')' in parameter list, found {}", found),
                        ));
                    }
                }
            }
        }
        let func = Rc::new(FuncDef {
            params,
            code: new_code(),
        });
        let mut state = ParseState::new();
        state.next_temp = 1; // temp 0 holds the return value
        state.func = Some(Rc::clone(&func));
        self.pending_state = Some(state);
        Ok(Value::Function(func, None))
    }

    fn parse_or(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_and(lx, as_lval, statement_start)?;
        let mut jump_lines = Vec::new();
        while lx.peek()?.is_keyword("or") {
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let goto_index = self.code_len();
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::GotoIfTruly, None, Some(val.clone())),
            );
            jump_lines.push(goto_index);
            let opb = self.parse_and(lx, false, false)?;
            let opb = self.fully_evaluate(lx, opb);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Or, Some(val), Some(opb)),
            );
            val = Value::Temp(t);
        }
        if !jump_lines.is_empty() {
            // Normal path skips the short-circuit constant.
            let after = self.code_len() + 2;
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::Goto, Some(Value::Number(after as f64)), None),
            );
            let target = self.code_len();
            for line in jump_lines {
                self.patch_line(line, target);
            }
            self.emit(
                lx.line_num,
                TacLine::new(Some(val.clone()), Opcode::Assign, Some(Value::Number(1.0)), None),
            );
        }
        Ok(val)
    }

    fn parse_and(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_not(lx, as_lval, statement_start)?;
        let mut jump_lines = Vec::new();
        while lx.peek()?.is_keyword("and") {
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let goto_index = self.code_len();
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::GotoIfNot, None, Some(val.clone())),
            );
            jump_lines.push(goto_index);
            let opb = self.parse_not(lx, false, false)?;
            let opb = self.fully_evaluate(lx, opb);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::And, Some(val), Some(opb)),
            );
            val = Value::Temp(t);
        }
        if !jump_lines.is_empty() {
            let after = self.code_len() + 2;
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::Goto, Some(Value::Number(after as f64)), None),
            );
            let target = self.code_len();
            for line in jump_lines {
                self.patch_line(line, target);
            }
            self.emit(
                lx.line_num,
                TacLine::new(Some(val.clone()), Opcode::Assign, Some(Value::Number(0.0)), None),
            );
        }
        Ok(val)
    }

    fn parse_not(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        if lx.peek()?.is_keyword("not") {
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let val = self.parse_not(lx, false, false)?;
            let val = self.fully_evaluate(lx, val);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Not, Some(val), None),
            );
            return Ok(Value::Temp(t));
        }
        self.parse_isa(lx, as_lval, statement_start)
    }

    fn parse_isa(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_comparisons(lx, as_lval, statement_start)?;
        while lx.peek()?.is_keyword("isa") {
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let rhs = self.parse_comparisons(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Isa, Some(val), Some(rhs)),
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_comparisons(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut left = self.parse_add_sub(lx, as_lval, statement_start)?;
        let mut chain: Option<Value> = None;
        loop {
            let opcode = match lx.peek()?.kind {
                TokenKind::OpEqual => Opcode::Eq,
                TokenKind::OpNotEqual => Opcode::Neq,
                TokenKind::OpGreater => Opcode::Gt,
                TokenKind::OpGreatEqual => Opcode::Gte,
                TokenKind::OpLesser => Opcode::Lt,
                TokenKind::OpLessEqual => Opcode::Lte,
                _ => break,
            };
            left = self.fully_evaluate(lx, left);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let right = self.parse_add_sub(lx, false, false)?;
            let right = self.fully_evaluate(lx, right);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(
                    Some(Value::Temp(t)),
                    opcode,
                    Some(left.clone()),
                    Some(right.clone()),
                ),
            );
            // Chained comparisons AND together by multiplying truth values.
            chain = Some(match chain {
                None => Value::Temp(t),
                Some(prev) => {
                    let c = self.next_temp();
                    self.emit(
                        lx.line_num,
                        TacLine::new(
                            Some(Value::Temp(c)),
                            Opcode::Mul,
                            Some(prev),
                            Some(Value::Temp(t)),
                        ),
                    );
                    Value::Temp(c)
                }
            });
            left = right;
        }
        Ok(chain.unwrap_or(left))
    }

    fn parse_add_sub(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_mult_div(lx, as_lval, statement_start)?;
        loop {
            let opcode = match lx.peek()?.kind {
                TokenKind::OpPlus => Opcode::Add,
                TokenKind::OpMinus => Opcode::Sub,
                _ => break,
            };
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let rhs = self.parse_mult_div(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), opcode, Some(val), Some(rhs)),
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_mult_div(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_unary_minus(lx, as_lval, statement_start)?;
        loop {
            let opcode = match lx.peek()?.kind {
                TokenKind::OpTimes => Opcode::Mul,
                TokenKind::OpDivide => Opcode::Div,
                TokenKind::OpMod => Opcode::Mod,
                _ => break,
            };
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let rhs = self.parse_unary_minus(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), opcode, Some(val), Some(rhs)),
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_unary_minus(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        if lx.peek()?.kind != TokenKind::OpMinus {
            return self.parse_new(lx, as_lval, statement_start);
        }
        lx.dequeue()?;
        self.allow_line_break(lx)?;
        let val = self.parse_new(lx, false, false)?;
        if let Value::Number(n) = val {
            return Ok(Value::Number(-n));
        }
        let val = self.fully_evaluate(lx, val);
        let t = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::Temp(t)),
                Opcode::Sub,
                Some(Value::Number(0.0)),
                Some(val),
            ),
        );
        Ok(Value::Temp(t))
    }

    fn parse_new(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        if !lx.peek()?.is_keyword("new") {
            return self.parse_power(lx, as_lval, statement_start);
        }
        lx.dequeue()?;
        self.allow_line_break(lx)?;
        let val = self.parse_new(lx, false, false)?;
        let val = self.fully_evaluate(lx, val);
        let t = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(Some(Value::Temp(t)), Opcode::New, Some(val), None),
        );
        Ok(Value::Temp(t))
    }

    fn parse_power(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_address_of(lx, as_lval, statement_start)?;
        while lx.peek()?.kind == TokenKind::OpPower {
            val = self.fully_evaluate(lx, val);
            lx.dequeue()?;
            self.allow_line_break(lx)?;
            let rhs = self.parse_address_of(lx, false, false)?;
            let rhs = self.fully_evaluate(lx, rhs);
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Pow, Some(val), Some(rhs)),
            );
            val = Value::Temp(t);
        }
        Ok(val)
    }

    fn parse_address_of(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        if lx.peek()?.kind != TokenKind::AddressOf {
            return self.parse_call_expr(lx, as_lval, statement_start);
        }
        lx.dequeue()?;
        let mut val = self.parse_call_expr(lx, as_lval, statement_start)?;
        match &mut val {
            Value::Var { no_invoke, .. } => *no_invoke = true,
            Value::SeqElem { no_invoke, .. } => *no_invoke = true,
            _ => {}
        }
        Ok(val)
    }

    fn parse_call_expr(
        &mut self,
        lx: &mut Lexer,
        as_lval: bool,
        statement_start: bool,
    ) -> Result<Value, ParseError> {
        let mut val = self.parse_primary(lx, as_lval, statement_start)?;
        loop {
            let tok = lx.peek()?;
            match tok.kind {
                TokenKind::Dot => {
                    // The base resolves (and auto-invokes) before the lookup,
                    // so chains like `d.values.sum` call each link in turn.
                    val = self.fully_evaluate(lx, val);
                    lx.dequeue()?;
                    self.allow_line_break(lx)?;
                    let ident = lx.dequeue()?;
                    if ident.kind != TokenKind::Identifier {
                        return Err(
                            self.cerr(lx, format!("expected identifier after '.', found {}", ident))
                        );
                    }
                    val = Value::SeqElem {
                        base: Box::new(val),
                        index: Box::new(Value::string(ident.text)),
                        no_invoke: false,
                    };
                }
                TokenKind::LSquare => {
                    val = self.fully_evaluate(lx, val);
                    lx.dequeue()?;
                    self.allow_line_break(lx)?;
                    if lx.peek()?.kind == TokenKind::Colon {
                        lx.dequeue()?;
                        self.allow_line_break(lx)?;
                        let to = if lx.peek()?.kind == TokenKind::RSquare {
                            Value::Null
                        } else {
                            let v = self.parse_expr(lx, false, false)?;
                            self.fully_evaluate(lx, v)
                        };
                        self.expect(lx, TokenKind::RSquare, "']'")?;
                        val = self.emit_slice(lx, val, Value::Null, to);
                    } else {
                        let index = self.parse_expr(lx, false, false)?;
                        let index = self.fully_evaluate(lx, index);
                        if lx.peek()?.kind == TokenKind::Colon {
                            lx.dequeue()?;
                            self.allow_line_break(lx)?;
                            let to = if lx.peek()?.kind == TokenKind::RSquare {
                                Value::Null
                            } else {
                                let v = self.parse_expr(lx, false, false)?;
                                self.fully_evaluate(lx, v)
                            };
                            self.expect(lx, TokenKind::RSquare, "']'")?;
                            val = self.emit_slice(lx, val, index, to);
                        } else {
                            self.expect(lx, TokenKind::RSquare, "']'")?;
                            if as_lval {
                                val = Value::SeqElem {
                                    base: Box::new(val),
                                    index: Box::new(index),
                                    no_invoke: false,
                                };
                            } else {
                                let t = self.next_temp();
                                self.emit(
                                    lx.line_num,
                                    TacLine::new(
                                        Some(Value::Temp(t)),
                                        Opcode::Elem,
                                        Some(val),
                                        Some(index),
                                    ),
                                );
                                val = Value::Temp(t);
                            }
                        }
                    }
                }
                TokenKind::LParen => {
                    if statement_start && tok.after_space {
                        // Command form: `print (x)` is an argument, not a call.
                        break;
                    }
                    lx.dequeue()?;
                    self.allow_line_break(lx)?;
                    let mut argc = 0usize;
                    if lx.peek()?.kind != TokenKind::RParen {
                        loop {
                            let arg = self.parse_expr(lx, false, false)?;
                            let arg = self.fully_evaluate(lx, arg);
                            self.emit(
                                lx.line_num,
                                TacLine::new(None, Opcode::PushParam, Some(arg), None),
                            );
                            argc += 1;
                            if lx.peek()?.kind == TokenKind::Comma {
                                lx.dequeue()?;
                                self.allow_line_break(lx)?;
                            } else {
                                break;
                            }
                        }
                    }
                    self.allow_line_break(lx)?;
                    self.expect(lx, TokenKind::RParen, "')'")?;
                    let t = self.next_temp();
                    self.emit(
                        lx.line_num,
                        TacLine::new(
                            Some(Value::Temp(t)),
                            Opcode::CallFunction,
                            Some(val),
                            Some(Value::Number(argc as f64)),
                        ),
                    );
                    val = Value::Temp(t);
                }
                _ => break,
            }
        }
        Ok(val)
    }

    /// `seq[from:to]` compiles to a call through the `slice` intrinsic.
    fn emit_slice(&mut self, lx: &Lexer, seq: Value, from: Value, to: Value) -> Value {
        for arg in [seq, from, to] {
            self.emit(
                lx.line_num,
                TacLine::new(None, Opcode::PushParam, Some(arg), None),
            );
        }
        let id = intrinsic_id("slice").expect("slice is always registered");
        let t = self.next_temp();
        self.emit(
            lx.line_num,
            TacLine::new(
                Some(Value::Temp(t)),
                Opcode::CallIntrinsic,
                Some(Value::Number(id as f64)),
                Some(Value::Number(3.0)),
            ),
        );
        Value::Temp(t)
    }

    fn expect(&self, lx: &mut Lexer, kind: TokenKind, what: &str) -> Result<Token, ParseError> {
        let tok = lx.dequeue()?;
        if tok.kind != kind {
            return Err(self.cerr(lx, format!("expected {}, found {}", what, tok)));
        }
        Ok(tok)
    }

    fn parse_primary(
        &mut self,
        lx: &mut Lexer,
        _as_lval: bool,
        _statement_start: bool,
    ) -> Result<Value, ParseError> {
        let tok = lx.dequeue()?;
        match tok.kind {
            TokenKind::Number => tok
                .text
                .parse::<f64>()
                .map(Value::Number)
                .map_err(|_| self.cerr(lx, format!("invalid numeric literal '{}'", tok.text))),
            TokenKind::Str => Ok(Value::string(tok.text)),
            TokenKind::Identifier => {
                let mut local_only = LocalOnlyMode::Off;
                if self.state().local_only_identifier.as_deref() == Some(tok.text.as_str()) {
                    local_only = if self.state().local_only_strict {
                        LocalOnlyMode::Strict
                    } else {
                        LocalOnlyMode::Warn
                    };
                }
                Ok(Value::Var {
                    name: Rc::from(tok.text),
                    no_invoke: false,
                    local_only,
                })
            }
            TokenKind::LParen => {
                self.allow_line_break(lx)?;
                let val = self.parse_expr(lx, false, false)?;
                self.allow_line_break(lx)?;
                self.expect(lx, TokenKind::RParen, "')'")?;
                Ok(val)
            }
            TokenKind::LSquare => {
                self.allow_line_break(lx)?;
                let mut items = Vec::new();
                if lx.peek()?.kind != TokenKind::RSquare {
                    loop {
                        let item = self.parse_expr(lx, false, false)?;
                        let item = self.fully_evaluate(lx, item);
                        items.push(item);
                        self.allow_line_break(lx)?;
                        if lx.peek()?.kind == TokenKind::Comma {
                            lx.dequeue()?;
                            self.allow_line_break(lx)?;
                            if lx.peek()?.kind == TokenKind::RSquare {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect(lx, TokenKind::RSquare, "']'")?;
                Ok(self.finish_literal(lx, Value::from_vec(items))?)
            }
            TokenKind::LCurly => {
                self.allow_line_break(lx)?;
                let mut map = ValMap::new();
                if lx.peek()?.kind != TokenKind::RCurly {
                    loop {
                        let key = self.parse_expr(lx, false, false)?;
                        let key = self.fully_evaluate(lx, key);
                        self.expect(lx, TokenKind::Colon, "':'")?;
                        self.allow_line_break(lx)?;
                        let value = self.parse_expr(lx, false, false)?;
                        let value = self.fully_evaluate(lx, value);
                        map.insert(key, value);
                        self.allow_line_break(lx)?;
                        if lx.peek()?.kind == TokenKind::Comma {
                            lx.dequeue()?;
                            self.allow_line_break(lx)?;
                            if lx.peek()?.kind == TokenKind::RCurly {
                                break;
                            }
                        } else {
                            break;
                        }
                    }
                }
                self.expect(lx, TokenKind::RCurly, "'}'")?;
                Ok(self.finish_literal(lx, Value::from_map(map))?)
            }
            TokenKind::Keyword => match tok.text.as_str() {
                "null" => Ok(Value::Null),
                "true" => Ok(Value::Number(1.0)),
                "false" => Ok(Value::Number(0.0)),
                _ => Err(self.cerr(
                    lx,
                    format!("unexpected keyword '{}' where an expression is required", tok.text),
                )),
            },
            TokenKind::Eol => Err(self.cerr(lx, "unexpected end of line in expression")),
            TokenKind::Eof => Err(self.cerr(lx, "unexpected end of input in expression")),
            _ => Err(self.cerr(lx, format!("unexpected token {} in expression", tok))),
        }
    }

    /// A list/map literal followed by more postfix syntax is instantiated
    /// into a temp first.
    fn finish_literal(&mut self, lx: &mut Lexer, literal: Value) -> Result<Value, ParseError> {
        let next = lx.peek()?;
        if matches!(
            next.kind,
            TokenKind::Dot | TokenKind::LSquare | TokenKind::LParen
        ) {
            let t = self.next_temp();
            self.emit(
                lx.line_num,
                TacLine::new(Some(Value::Temp(t)), Opcode::Copy, Some(literal), None),
            );
            return Ok(Value::Temp(t));
        }
        Ok(literal)
    }
}

/// True when the statement on the final line of `source` continues onto the
/// next line: it ends in a binary operator, an opening bracket, a comma,
/// colon, dot, `@`, or one of the connective keywords.
pub fn ends_with_line_continuation(source: &str) -> bool {
    let token = last_token(source);
    match token.kind {
        TokenKind::OpAssign
        | TokenKind::OpPlus
        | TokenKind::OpMinus
        | TokenKind::OpTimes
        | TokenKind::OpDivide
        | TokenKind::OpMod
        | TokenKind::OpPower
        | TokenKind::OpEqual
        | TokenKind::OpNotEqual
        | TokenKind::OpGreater
        | TokenKind::OpGreatEqual
        | TokenKind::OpLesser
        | TokenKind::OpLessEqual
        | TokenKind::OpAssignPlus
        | TokenKind::OpAssignMinus
        | TokenKind::OpAssignTimes
        | TokenKind::OpAssignDivide
        | TokenKind::OpAssignMod
        | TokenKind::OpAssignPower
        | TokenKind::LParen
        | TokenKind::LSquare
        | TokenKind::LCurly
        | TokenKind::Comma
        | TokenKind::Colon
        | TokenKind::Dot
        | TokenKind::AddressOf => true,
        TokenKind::Keyword => {
            matches!(token.text.as_str(), "and" | "or" | "isa" | "not" | "new")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex_all(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        let mut tokens = Vec::new();
        loop {
            let token = lexer.dequeue().expect("lex failure");
            if token.kind == TokenKind::Eof {
                break;
            }
            tokens.push(token);
        }
        tokens
    }

    fn parsed(source: &str) -> Vec<TacLine> {
        let mut parser = Parser::new();
        parser.parse(source).expect("parse failure");
        parser.program().to_vec()
    }

    #[test]
    fn lexes_identifier_round_trip() {
        let mut lexer = Lexer::new("foo");
        let token = lexer.dequeue().unwrap();
        assert_eq!(token.kind, TokenKind::Identifier);
        assert_eq!(token.text, "foo");
        assert!(lexer.at_end());
    }

    #[test]
    fn lexes_numeric_literals() {
        for text in ["42", "3.14", ".5", "1e3", "2E-4"] {
            let tokens = lex_all(text);
            assert_eq!(tokens.len(), 1, "{}", text);
            assert_eq!(tokens[0].kind, TokenKind::Number);
            assert_eq!(tokens[0].text, text);
        }
    }

    #[test]
    fn line_numbers_advance_once_per_break() {
        let mut lexer = Lexer::new("a\nb\r\nc");
        while !lexer.at_end() {
            lexer.dequeue().unwrap();
        }
        assert_eq!(lexer.line_num, 3);
    }

    #[test]
    fn semicolon_is_eol_without_line_advance() {
        let mut lexer = Lexer::new("a; b");
        lexer.dequeue().unwrap();
        let token = lexer.dequeue().unwrap();
        assert_eq!(token.kind, TokenKind::Eol);
        assert_eq!(lexer.line_num, 1);
    }

    #[test]
    fn doubled_quotes_escape_in_strings() {
        let tokens = lex_all("\"Hi\"\"There\"");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Str);
        assert_eq!(tokens[0].text, "Hi\"There");
    }

    #[test]
    fn peek_is_idempotent() {
        let mut lexer = Lexer::new("x + y");
        let first = lexer.peek().unwrap();
        let second = lexer.peek().unwrap();
        assert_eq!(first, second);
        assert_eq!(lexer.dequeue().unwrap(), first);
    }

    #[test]
    fn compound_end_keywords_merge() {
        for (source, expected) in [
            ("end if", "end if"),
            ("end while", "end while"),
            ("end for", "end for"),
            ("end function", "end function"),
        ] {
            let tokens = lex_all(source);
            assert_eq!(tokens.len(), 1, "{}", source);
            assert_eq!(tokens[0].kind, TokenKind::Keyword);
            assert_eq!(tokens[0].text, expected);
        }
    }

    #[test]
    fn dangling_end_is_a_lexer_error() {
        let mut lexer = Lexer::new("end");
        assert!(matches!(
            lexer.dequeue(),
            Err(ParseError::Lexer { .. })
        ));
    }

    #[test]
    fn else_if_merges_only_before_nonidentifier() {
        let tokens = lex_all("else if");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].text, "else if");

        let tokens = lex_all("else iffy");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "else");
        assert_eq!(tokens[1].text, "iffy");
    }

    #[test]
    fn unterminated_string_is_a_lexer_error() {
        let mut lexer = Lexer::new("\"open");
        assert!(matches!(lexer.dequeue(), Err(ParseError::Lexer { .. })));
    }

    #[test]
    fn trim_comment_respects_string_literals() {
        assert_eq!(trim_comment("x = 1 // note"), "x = 1 ");
        assert_eq!(trim_comment("s = \"a//b\""), "s = \"a//b\"");
        assert_eq!(trim_comment("s = \"a//b\" // real"), "s = \"a//b\" ");
    }

    #[test]
    fn last_token_uses_final_line() {
        assert_eq!(last_token("x = 1\ny = 2 +").kind, TokenKind::OpPlus);
        assert_eq!(last_token("x = 1 // trailing").text, "1");
    }

    #[test]
    fn detects_line_continuations() {
        assert!(ends_with_line_continuation("x = 1 +"));
        assert!(ends_with_line_continuation("f = g("));
        assert!(ends_with_line_continuation("x = a and"));
        assert!(ends_with_line_continuation("y = d."));
        assert!(!ends_with_line_continuation("x = 1"));
        assert!(!ends_with_line_continuation("print x"));
    }

    #[test]
    fn parses_literal_assignment_to_one_line() {
        let code = parsed("x = 42");
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Opcode::Assign);
        assert!(matches!(code[0].lhs, Some(Value::Var { ref name, .. }) if &**name == "x"));
        assert_eq!(code[0].rhs_a, Some(Value::Number(42.0)));
    }

    #[test]
    fn variable_read_becomes_zero_arg_call() {
        let code = parsed("x = y");
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Opcode::CallFunction);
        assert!(matches!(code[0].lhs, Some(Value::Var { ref name, .. }) if &**name == "x"));
    }

    #[test]
    fn address_of_suppresses_invocation() {
        let code = parsed("x = @y");
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Opcode::Assign);
        assert!(
            matches!(code[0].rhs_a, Some(Value::Var { no_invoke, .. }) if no_invoke)
        );
    }

    #[test]
    fn command_statement_pushes_args_and_assigns_implicit() {
        let code = parsed("print 6*7");
        let ops: Vec<Opcode> = code.iter().map(|line| line.op).collect();
        assert!(ops.contains(&Opcode::Mul));
        assert!(ops.contains(&Opcode::PushParam));
        assert!(ops.contains(&Opcode::CallFunction));
        assert_eq!(*ops.last().unwrap(), Opcode::AssignImplicit);
    }

    #[test]
    fn chained_comparison_multiplies_truth_values() {
        let code = parsed("x = 1 < 2 < 3");
        let lt_count = code.iter().filter(|line| line.op == Opcode::Lt).count();
        assert_eq!(lt_count, 2);
        assert!(code.iter().any(|line| line.op == Opcode::Mul));
    }

    #[test]
    fn short_circuit_or_emits_truly_jump_and_constant() {
        let code = parsed("x = a or b");
        assert!(code.iter().any(|line| line.op == Opcode::GotoIfTruly));
        assert!(code.iter().any(|line| line.op == Opcode::Or));
        let forced = code
            .iter()
            .any(|line| line.op == Opcode::Assign && line.rhs_a == Some(Value::Number(1.0)));
        assert!(forced);
    }

    #[test]
    fn all_jumps_are_patched_after_parse() {
        let source = "if x then\nprint 1\nelse if y then\nprint 2\nelse\nprint 3\nend if\nwhile z\nbreak\nend while";
        let code = parsed(source);
        for line in &code {
            match line.op {
                Opcode::Goto | Opcode::GotoIf | Opcode::GotoIfTruly | Opcode::GotoIfNot => {
                    let target = match &line.rhs_a {
                        Some(Value::Number(n)) => *n as usize,
                        other => panic!("unpatched jump: {:?}", other),
                    };
                    assert!(target <= code.len());
                }
                _ => {}
            }
        }
    }

    #[test]
    fn while_loop_jumps_back_to_condition() {
        let code = parsed("while x\ny = 1\nend while");
        let back = code
            .iter()
            .rev()
            .find(|line| line.op == Opcode::Goto)
            .expect("loop close emits a goto");
        assert_eq!(back.rhs_a, Some(Value::Number(0.0)));
    }

    #[test]
    fn for_loop_uses_hidden_index_counter() {
        let code = parsed("for i in [1,2]\nprint i\nend for");
        let uses_idx = code.iter().any(|line| {
            matches!(&line.lhs, Some(Value::Var { name, .. }) if &**name == "__i_idx")
        });
        assert!(uses_idx);
        assert!(code.iter().any(|line| line.op == Opcode::IterElem));
    }

    #[test]
    fn break_outside_loop_is_an_error() {
        let mut parser = Parser::new();
        let err = parser.parse("break").unwrap_err();
        assert!(matches!(err, ParseError::Compiler { .. }));
    }

    #[test]
    fn continue_outside_loop_is_an_error() {
        let mut parser = Parser::new();
        assert!(parser.parse("continue").is_err());
    }

    #[test]
    fn else_without_if_is_an_error() {
        let mut parser = Parser::new();
        assert!(parser.parse("else").is_err());
    }

    #[test]
    fn assignment_in_if_condition_is_reported() {
        let mut parser = Parser::new();
        let err = parser.parse("if x = 3 then\nend if").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("=="), "{}", message);
    }

    #[test]
    fn single_line_if_may_not_contain_loops() {
        let mut parser = Parser::new();
        assert!(parser.parse("if 1 then while 1").is_err());
    }

    #[test]
    fn open_while_at_end_of_input_is_an_error() {
        let mut parser = Parser::new();
        let err = parser.parse("while 1\nprint 1").unwrap_err();
        assert!(err.to_string().contains("end while"));
    }

    #[test]
    fn function_without_terminator_is_an_error() {
        let mut parser = Parser::new();
        let err = parser.parse("f = function(x)\nreturn x").unwrap_err();
        assert!(err.to_string().contains("end function"));
    }

    #[test]
    fn two_function_literals_in_one_statement_are_rejected() {
        let mut parser = Parser::new();
        assert!(parser.parse("x = [function(a), function(b)]").is_err());
    }

    #[test]
    fn parameter_default_must_be_literal() {
        let mut parser = Parser::new();
        let err = parser.parse("f = function(a=1+2)\nend function").unwrap_err();
        assert!(err.to_string().contains("literal"));
    }

    #[test]
    fn function_body_lands_in_function_code() {
        let code = parsed("f = function(x)\nreturn x\nend function");
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].op, Opcode::BindAssign);
        let func = match &code[0].rhs_a {
            Some(Value::Function(def, _)) => def.clone(),
            other => panic!("expected function literal, got {:?}", other),
        };
        assert_eq!(func.params.len(), 1);
        assert_eq!(func.params[0].name, "x");
        let body = func.code.borrow();
        assert!(body.iter().any(|line| line.op == Opcode::Return));
    }

    #[test]
    fn repl_keeps_blocks_open_across_lines() {
        let mut parser = Parser::new();
        parser.parse_repl("if x then").unwrap();
        assert!(parser.need_more_input());
        parser.parse_repl("print 1").unwrap();
        assert!(parser.need_more_input());
        parser.parse_repl("end if").unwrap();
        assert!(!parser.need_more_input());
    }

    #[test]
    fn repl_buffers_line_continuations() {
        let mut parser = Parser::new();
        parser.parse_repl("x = 1 +").unwrap();
        assert!(parser.need_more_input());
        assert!(parser.program().is_empty());
        parser.parse_repl("2").unwrap();
        assert!(!parser.need_more_input());
        assert_eq!(parser.program().len(), 1);
        assert_eq!(parser.program()[0].op, Opcode::Add);
    }

    #[test]
    fn slice_compiles_to_intrinsic_call() {
        let code = parsed("x = s[1:3]");
        let id = intrinsic_id("slice").unwrap() as f64;
        assert!(code.iter().any(|line| line.op == Opcode::CallIntrinsic
            && line.rhs_a == Some(Value::Number(id))));
    }

    #[test]
    fn emitted_lines_carry_source_locations() {
        let code = parsed("x = 1\ny = 2");
        assert_eq!(code[0].location.as_ref().unwrap().line_num, 1);
        assert_eq!(code[1].location.as_ref().unwrap().line_num, 2);
    }
}
