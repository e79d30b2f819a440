//! Symbol scan over Python source text.
//!
//! A small tokenizer groups the source into logical lines (bracket and
//! backslash continuations joined, comments and string contents dropped,
//! f-string expressions kept), then a single pass collects every bare name
//! that is read and every name that is bound by assignment, `def`, `class`,
//! loop targets, `as` clauses, parameters or imports. Scoping is flat: a name
//! bound anywhere counts as defined everywhere. That is enough to decide which
//! names need an import without attempting type inference.

use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str,
    Op,
}

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// Byte offsets into the scanned source.
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone)]
pub struct LogicalLine {
    pub indent: usize,
    /// Zero-based physical line numbers covered by this logical line.
    pub first_line: usize,
    pub last_line: usize,
    pub tokens: Vec<Token>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Positional,
    VarArgs,
    KwArgs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSignature {
    pub name: String,
    pub kind: ParamKind,
    pub annotation: Option<String>,
    pub default: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub name: String,
    pub params: Vec<ParamSignature>,
    pub indent: usize,
    pub first_line: usize,
    /// Last physical line of the header, i.e. the one holding the colon.
    pub header_last_line: usize,
    pub inline_body: bool,
    pub has_docstring: bool,
    pub is_async: bool,
    /// Byte range of the parameter list, parentheses excluded.
    pub params_span: (usize, usize),
}

#[derive(Debug, Clone, Default)]
pub struct SymbolScan {
    pub references: BTreeSet<String>,
    pub definitions: BTreeSet<String>,
    /// Modules imported with `from <module> import *`.
    pub star_imports: Vec<String>,
    pub functions: Vec<FunctionSignature>,
    pub lines: Vec<LogicalLine>,
}

impl SymbolScan {
    /// Names read somewhere but bound nowhere, builtins excluded.
    pub fn unbound(&self) -> BTreeSet<String> {
        self.references
            .iter()
            .filter(|name| !self.definitions.contains(*name))
            .filter(|name| !is_builtin(name) && !is_keyword(name))
            .cloned()
            .collect()
    }
}

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

const BUILTINS: &[&str] = &[
    "abs", "aiter", "all", "anext", "any", "ascii", "bin", "bool", "breakpoint", "bytearray",
    "bytes", "callable", "chr", "classmethod", "compile", "complex", "copyright", "credits",
    "delattr", "dict", "dir", "divmod", "enumerate", "eval", "exec", "exit", "filter", "float",
    "format", "frozenset", "getattr", "globals", "hasattr", "hash", "help", "hex", "id",
    "input", "int", "isinstance", "issubclass", "iter", "len", "license", "list", "locals",
    "map", "max", "memoryview", "min", "next", "object", "oct", "open", "ord", "pow", "print",
    "property", "quit", "range", "repr", "reversed", "round", "set", "setattr", "slice",
    "sorted", "staticmethod", "str", "sum", "super", "tuple", "type", "vars", "zip",
    "__import__", "__name__", "__file__", "__doc__", "__builtins__", "__spec__", "__loader__",
    "__package__", "__debug__", "__build_class__", "NotImplemented", "Ellipsis", "_",
    "BaseException", "BaseExceptionGroup", "Exception", "ExceptionGroup", "ArithmeticError",
    "AssertionError", "AttributeError", "BlockingIOError", "BrokenPipeError", "BufferError",
    "ChildProcessError", "ConnectionError", "ConnectionAbortedError", "ConnectionRefusedError",
    "ConnectionResetError", "EOFError", "EnvironmentError", "FileExistsError",
    "FileNotFoundError", "FloatingPointError", "GeneratorExit", "IOError", "ImportError",
    "IndentationError", "IndexError", "InterruptedError", "IsADirectoryError", "KeyError",
    "KeyboardInterrupt", "LookupError", "MemoryError", "ModuleNotFoundError", "NameError",
    "NotADirectoryError", "NotImplementedError", "OSError", "OverflowError", "PermissionError",
    "ProcessLookupError", "RecursionError", "ReferenceError", "RuntimeError",
    "StopAsyncIteration", "StopIteration", "SyntaxError", "SystemError", "SystemExit",
    "TabError", "TimeoutError", "TypeError", "UnboundLocalError", "UnicodeDecodeError",
    "UnicodeEncodeError", "UnicodeError", "UnicodeTranslateError", "ValueError",
    "ZeroDivisionError", "Warning", "UserWarning", "DeprecationWarning",
    "PendingDeprecationWarning", "SyntaxWarning", "RuntimeWarning", "FutureWarning",
    "ImportWarning", "UnicodeWarning", "BytesWarning", "ResourceWarning", "EncodingWarning",
];

pub fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

const OPS3: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const OPS2: &[&str] = &[
    "->", ":=", "==", "!=", "<=", ">=", "**", "//", "+=", "-=", "*=", "/=", "%=", "&=", "|=",
    "^=", "@=", "<<", ">>",
];
const STRING_PREFIXES: &[&str] = &["r", "u", "b", "f", "br", "rb", "fr", "rf"];

/// Splits Python source into logical lines of tokens.
pub fn logical_lines(source: &str) -> Vec<LogicalLine> {
    Lexer::new(source).run()
}

struct Lexer<'a> {
    src: &'a str,
    chars: Vec<(usize, char)>,
    pos: usize,
    line: usize,
    depth: usize,
    indent: usize,
    first_line: usize,
    last_line: usize,
    current: Vec<Token>,
    lines: Vec<LogicalLine>,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.char_indices().collect(),
            pos: 0,
            line: 0,
            depth: 0,
            indent: 0,
            first_line: 0,
            last_line: 0,
            current: Vec::new(),
            lines: Vec::new(),
        }
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).map(|(_, c)| *c)
    }

    fn offset(&self, index: usize) -> usize {
        self.chars
            .get(index)
            .map(|(o, _)| *o)
            .unwrap_or(self.src.len())
    }

    fn push(&mut self, kind: TokenKind, start_idx: usize, end_idx: usize) {
        let start = self.offset(start_idx);
        let end = self.offset(end_idx);
        if self.current.is_empty() {
            self.first_line = self.line;
        }
        self.last_line = self.line;
        self.current.push(Token {
            kind,
            text: self.src[start..end].to_string(),
            start,
            end,
        });
    }

    fn flush(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.lines.push(LogicalLine {
            indent: self.indent,
            first_line: self.first_line,
            last_line: self.last_line,
            tokens: std::mem::take(&mut self.current),
        });
    }

    fn run(mut self) -> Vec<LogicalLine> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 && self.current.is_empty() {
                let mut width = 0;
                while let Some(c) = self.peek(0) {
                    match c {
                        ' ' => width += 1,
                        '\t' => width += 8 - width % 8,
                        _ => break,
                    }
                    self.pos += 1;
                }
                self.indent = width;
                at_line_start = false;
                continue;
            }
            let c = self.chars[self.pos].1;
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.flush();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                ' ' | '\t' | '\r' | '\x0c' => self.pos += 1,
                '#' => {
                    while let Some(c) = self.peek(0) {
                        if c == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '\\' => {
                    self.pos += 1;
                    if self.peek(0) == Some('\r') {
                        self.pos += 1;
                    }
                    if self.peek(0) == Some('\n') {
                        self.pos += 1;
                        self.line += 1;
                    }
                }
                '"' | '\'' => self.lex_string(self.pos, false),
                c if c.is_alphabetic() || c == '_' => self.lex_name(),
                c if c.is_ascii_digit() => self.lex_number(),
                '.' if self.peek(1).is_some_and(|c| c.is_ascii_digit()) => self.lex_number(),
                _ => self.lex_op(),
            }
        }
        self.flush();
        self.lines
    }

    fn lex_name(&mut self) {
        let start = self.pos;
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().map(|(_, c)| *c).collect();
        let lower = text.to_ascii_lowercase();
        if matches!(self.peek(0), Some('"') | Some('\'')) && STRING_PREFIXES.contains(&lower.as_str())
        {
            self.lex_string(start, lower.contains('f'));
            return;
        }
        self.push(TokenKind::Name, start, self.pos);
    }

    fn lex_number(&mut self) {
        let start = self.pos;
        let hex = self.peek(0) == Some('0') && matches!(self.peek(1), Some('x') | Some('X'));
        while let Some(c) = self.peek(0) {
            if c.is_alphanumeric() || c == '_' || c == '.' {
                self.pos += 1;
                if !hex && (c == 'e' || c == 'E') && matches!(self.peek(0), Some('+') | Some('-')) {
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
        self.push(TokenKind::Number, start, self.pos);
    }

    fn lex_op(&mut self) {
        let start = self.pos;
        let rest: String = self.chars[self.pos..(self.pos + 3).min(self.chars.len())]
            .iter()
            .map(|(_, c)| *c)
            .collect();
        let len = if OPS3.iter().any(|op| rest.starts_with(op)) {
            3
        } else if OPS2.iter().any(|op| rest.starts_with(op)) {
            2
        } else {
            1
        };
        self.pos += len;
        match self.chars[start].1 {
            '(' | '[' | '{' => self.depth += 1,
            ')' | ']' | '}' => self.depth = self.depth.saturating_sub(1),
            _ => {}
        }
        self.push(TokenKind::Op, start, self.pos);
    }

    /// Lexes a string literal starting at `start` (prefix included). For
    /// f-strings the embedded expressions are tokenized and appended after
    /// the string token so the names they read are seen.
    fn lex_string(&mut self, start: usize, formatted: bool) {
        let quote = self.chars[self.pos].1;
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };
        let start_line = self.line;
        let mut expressions: Vec<(usize, usize)> = Vec::new();
        loop {
            let Some(c) = self.peek(0) else { break };
            match c {
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                '\n' if !triple => break,
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                '{' if formatted => {
                    if self.peek(1) == Some('{') {
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        if let Some(range) = self.fstring_expression() {
                            expressions.push(range);
                        }
                    }
                }
                _ => self.pos += 1,
            }
        }
        self.pos = self.pos.min(self.chars.len());
        let end_line = self.line;
        self.line = start_line;
        self.push(TokenKind::Str, start, self.pos);
        self.line = end_line;
        self.last_line = end_line;
        for (from, to) in expressions {
            let base = self.offset(from);
            let end = self.offset(to);
            let expr = self.src[base..end].trim_end().trim_end_matches('=');
            for line in logical_lines(expr) {
                for mut token in line.tokens {
                    token.start += base;
                    token.end += base;
                    self.current.push(token);
                }
            }
        }
    }

    /// Consumes an f-string replacement field after its opening brace and
    /// returns the char range of the expression part.
    fn fstring_expression(&mut self) -> Option<(usize, usize)> {
        let start = self.pos;
        let mut nesting = 0usize;
        let mut expr_end = None;
        while let Some(c) = self.peek(0) {
            match c {
                '(' | '[' | '{' => nesting += 1,
                ')' | ']' => nesting = nesting.saturating_sub(1),
                '}' if nesting == 0 => {
                    let end = expr_end.unwrap_or(self.pos);
                    self.pos += 1;
                    return Some((start, end));
                }
                '}' => nesting -= 1,
                '!' if nesting == 0 && self.peek(1) != Some('=') && expr_end.is_none() => {
                    expr_end = Some(self.pos)
                }
                ':' if nesting == 0 && expr_end.is_none() => expr_end = Some(self.pos),
                '\'' | '"' if expr_end.is_none() => {
                    let q = c;
                    self.pos += 1;
                    while let Some(inner) = self.peek(0) {
                        if inner == q || inner == '\n' {
                            break;
                        }
                        self.pos += 1;
                    }
                }
                '\n' => return None,
                _ => {}
            }
            self.pos += 1;
        }
        None
    }
}

/// Scans `source` for referenced and bound names.
pub fn scan(source: &str) -> SymbolScan {
    let lines = logical_lines(source);
    let mut scan = SymbolScan::default();
    {
        let mut walker = Walker {
            src: source,
            scan: &mut scan,
            line_index: 0,
            pending_docstring: Vec::new(),
        };
        for (index, line) in lines.iter().enumerate() {
            walker.line_index = index;
            walker.logical_line(&line.tokens, line);
        }
        let pending = std::mem::take(&mut walker.pending_docstring);
        for (function, index) in pending {
            let Some(next) = lines.get(index + 1) else { continue };
            let def_indent = scan.functions[function].indent;
            if next.indent > def_indent
                && next.tokens.first().map(|t| t.kind) == Some(TokenKind::Str)
            {
                scan.functions[function].has_docstring = true;
            }
        }
    }
    scan.lines = lines;
    scan
}

fn is_name(token: Option<&Token>, text: &str) -> bool {
    token.is_some_and(|t| t.kind == TokenKind::Name && t.text == text)
}

fn is_op(token: Option<&Token>, text: &str) -> bool {
    token.is_some_and(|t| t.kind == TokenKind::Op && t.text == text)
}

fn depth_delta(token: &Token) -> isize {
    if token.kind != TokenKind::Op {
        return 0;
    }
    match token.text.as_str() {
        "(" | "[" | "{" => 1,
        ")" | "]" | "}" => -1,
        _ => 0,
    }
}

/// Indices of tokens at bracket depth zero (relative to the slice) that
/// satisfy `pred`.
fn top_level<F: Fn(&Token) -> bool>(tokens: &[Token], pred: F) -> Vec<usize> {
    let mut depth: isize = 0;
    let mut found = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        let delta = depth_delta(token);
        if delta < 0 {
            depth += delta;
        }
        if depth == 0 && pred(token) {
            found.push(i);
        }
        if delta > 0 {
            depth += delta;
        }
    }
    found
}

fn split_top<'t>(tokens: &'t [Token], op: &str) -> Vec<&'t [Token]> {
    let mut parts = Vec::new();
    let mut start = 0;
    for i in top_level(tokens, |t| t.kind == TokenKind::Op && t.text == op) {
        parts.push(&tokens[start..i]);
        start = i + 1;
    }
    parts.push(&tokens[start..]);
    parts
}

/// The colon closing a compound statement header, skipping lambda colons.
fn header_colon(tokens: &[Token]) -> Option<usize> {
    let mut depth: isize = 0;
    let mut lambdas = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        let delta = depth_delta(token);
        if depth == 0 {
            if token.kind == TokenKind::Name && token.text == "lambda" {
                lambdas += 1;
            } else if token.kind == TokenKind::Op && token.text == ":" {
                if lambdas == 0 {
                    return Some(i);
                }
                lambdas -= 1;
            }
        }
        depth += delta;
    }
    None
}

/// Index of the bracket closing the one opened at `open`.
fn matching_close(tokens: &[Token], open: usize) -> usize {
    let mut depth: isize = 0;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        depth += depth_delta(token);
        if depth == 0 {
            return i;
        }
    }
    tokens.len()
}

struct Walker<'s> {
    src: &'s str,
    scan: &'s mut SymbolScan,
    line_index: usize,
    /// (function index, logical line index) awaiting docstring detection.
    pending_docstring: Vec<(usize, usize)>,
}

impl Walker<'_> {
    fn reference(&mut self, name: &str) {
        self.scan.references.insert(name.to_string());
    }

    fn define(&mut self, name: &str) {
        self.scan.definitions.insert(name.to_string());
    }

    fn text(&self, tokens: &[Token]) -> Option<String> {
        let first = tokens.first()?;
        let last = tokens.last()?;
        Some(self.src[first.start..last.end].trim().to_string())
    }

    fn logical_line(&mut self, tokens: &[Token], line: &LogicalLine) {
        let Some(first) = tokens.first() else { return };
        if first.kind == TokenKind::Op && first.text == "@" {
            self.expression(&tokens[1..]);
            return;
        }
        if first.kind == TokenKind::Name {
            match first.text.as_str() {
                "async" => return self.logical_line(&tokens[1..], line),
                "def" => return self.function(tokens, line),
                "class" => return self.class(tokens, line),
                "for" | "while" | "if" | "elif" | "else" | "try" | "finally" | "with"
                | "except" => return self.compound(tokens, line),
                "match" | "case" if header_colon(tokens).is_some_and(|c| c > 1) => {
                    return self.compound(tokens, line)
                }
                _ => {}
            }
        }
        for statement in split_top(tokens, ";") {
            self.simple(statement);
        }
    }

    fn compound(&mut self, tokens: &[Token], line: &LogicalLine) {
        let colon = header_colon(tokens).unwrap_or(tokens.len());
        let header = &tokens[1..colon];
        match tokens[0].text.as_str() {
            "for" => {
                let in_pos = top_level(header, |t| t.kind == TokenKind::Name && t.text == "in");
                match in_pos.first() {
                    Some(&i) => {
                        self.targets(&header[..i]);
                        self.expression(&header[i + 1..]);
                    }
                    None => self.targets(header),
                }
            }
            "with" | "except" => {
                let mut items = header;
                if is_op(items.first(), "(") && matching_close(items, 0) + 1 == items.len() {
                    items = &items[1..items.len() - 1];
                }
                for item in split_top(items, ",") {
                    let item = if is_op(item.first(), "*") { &item[1..] } else { item };
                    let as_pos = top_level(item, |t| t.kind == TokenKind::Name && t.text == "as");
                    match as_pos.first() {
                        Some(&i) => {
                            self.expression(&item[..i]);
                            self.targets(&item[i + 1..]);
                        }
                        None => self.expression(item),
                    }
                }
            }
            "case" => self.pattern(header),
            "else" | "try" | "finally" => {}
            _ => self.expression(header),
        }
        if colon + 1 < tokens.len() {
            self.logical_line(&tokens[colon + 1..], line);
        }
    }

    fn pattern(&mut self, tokens: &[Token]) {
        let guard = top_level(tokens, |t| t.kind == TokenKind::Name && t.text == "if");
        let (pattern, guard) = match guard.first() {
            Some(&i) => (&tokens[..i], Some(&tokens[i + 1..])),
            None => (tokens, None),
        };
        for (i, token) in pattern.iter().enumerate() {
            if token.kind != TokenKind::Name || is_keyword(&token.text) {
                continue;
            }
            let prev_dot = i > 0 && is_op(pattern.get(i - 1), ".");
            let next = pattern.get(i + 1);
            if prev_dot || is_op(next, "=") {
                continue;
            }
            if is_op(next, "(") || is_op(next, ".") {
                self.reference(&token.text);
            } else {
                self.define(&token.text);
            }
        }
        if let Some(guard) = guard {
            self.expression(guard);
        }
    }

    fn simple(&mut self, tokens: &[Token]) {
        let Some(first) = tokens.first() else { return };
        if first.kind == TokenKind::Name {
            match first.text.as_str() {
                "import" => return self.import(&tokens[1..]),
                "from" => return self.from_import(&tokens[1..]),
                "global" | "nonlocal" => {
                    for token in &tokens[1..] {
                        if token.kind == TokenKind::Name {
                            self.define(&token.text);
                        }
                    }
                    return;
                }
                "pass" | "break" | "continue" => return,
                "return" | "yield" | "raise" | "assert" | "del" | "await" => {
                    return self.expression(&tokens[1..])
                }
                _ => {}
            }
        }

        // `=` signs at depth zero, ignoring lambda defaults.
        let mut assigns = Vec::new();
        let mut depth: isize = 0;
        for (i, token) in tokens.iter().enumerate() {
            if depth == 0 {
                if token.kind == TokenKind::Name && token.text == "lambda" {
                    break;
                }
                if token.kind == TokenKind::Op && token.text == "=" {
                    assigns.push(i);
                }
            }
            depth += depth_delta(token);
        }

        let Some(&value_start) = assigns.last() else {
            match header_colon(tokens) {
                Some(colon) => {
                    self.targets(&tokens[..colon]);
                    self.expression(&tokens[colon + 1..]);
                }
                None => self.expression(tokens),
            }
            return;
        };

        let mut start = 0;
        for &eq in &assigns {
            let segment = &tokens[start..eq];
            match header_colon(segment) {
                Some(colon) => {
                    self.targets(&segment[..colon]);
                    self.expression(&segment[colon + 1..]);
                }
                None => self.targets(segment),
            }
            start = eq + 1;
        }
        self.expression(&tokens[value_start + 1..]);
    }

    /// Assignment targets: bare names are bound, everything used to reach an
    /// attribute or subscript is read.
    fn targets(&mut self, tokens: &[Token]) {
        let mut subscript: Vec<bool> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::Op => match token.text.as_str() {
                    "(" | "[" | "{" => {
                        let prev = i.checked_sub(1).and_then(|p| tokens.get(p));
                        let indexes = token.text != "{"
                            && prev.is_some_and(|p| {
                                p.kind == TokenKind::Name
                                    || p.kind == TokenKind::Str
                                    || p.text == ")"
                                    || p.text == "]"
                            });
                        subscript.push(indexes || subscript.last().copied().unwrap_or(false));
                    }
                    ")" | "]" | "}" => {
                        subscript.pop();
                    }
                    _ => {}
                },
                TokenKind::Name => {
                    if is_keyword(&token.text) {
                        continue;
                    }
                    let prev_dot = i > 0 && is_op(tokens.get(i - 1), ".");
                    if prev_dot {
                        continue;
                    }
                    let next = tokens.get(i + 1);
                    let in_subscript = subscript.last().copied().unwrap_or(false);
                    if in_subscript || is_op(next, ".") || is_op(next, "[") || is_op(next, "(") {
                        self.reference(&token.text);
                    } else {
                        self.define(&token.text);
                    }
                }
                _ => {}
            }
        }
    }

    fn expression(&mut self, tokens: &[Token]) {
        let mut brackets: Vec<&str> = Vec::new();
        let mut i = 0;
        while i < tokens.len() {
            let token = &tokens[i];
            match token.kind {
                TokenKind::Op => match token.text.as_str() {
                    "(" | "[" | "{" => brackets.push(token.text.as_str()),
                    ")" | "]" | "}" => {
                        brackets.pop();
                    }
                    _ => {}
                },
                TokenKind::Name => {
                    if i > 0 && is_op(tokens.get(i - 1), ".") {
                        i += 1;
                        continue;
                    }
                    match token.text.as_str() {
                        "lambda" => {
                            i = self.lambda(tokens, i);
                            continue;
                        }
                        "for" => {
                            i = self.comprehension_target(tokens, i);
                            continue;
                        }
                        name if is_keyword(name) => {}
                        name => {
                            let next = tokens.get(i + 1);
                            if is_op(next, "=") && brackets.last() == Some(&"(") {
                                // keyword argument
                            } else if is_op(next, ":=") {
                                self.define(name);
                            } else {
                                self.reference(name);
                            }
                        }
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Binds the names between `for` and `in`; returns the index after `in`.
    fn comprehension_target(&mut self, tokens: &[Token], for_index: usize) -> usize {
        let rest = &tokens[for_index + 1..];
        let in_pos = top_level(rest, |t| t.kind == TokenKind::Name && t.text == "in");
        match in_pos.first() {
            Some(&i) => {
                self.targets(&rest[..i]);
                for_index + 1 + i + 1
            }
            None => {
                self.targets(rest);
                tokens.len()
            }
        }
    }

    /// Binds lambda parameters; returns the index of the lambda body.
    fn lambda(&mut self, tokens: &[Token], lambda_index: usize) -> usize {
        let rest = &tokens[lambda_index + 1..];
        let Some(colon) = header_colon(rest) else {
            return tokens.len();
        };
        for param in split_top(&rest[..colon], ",") {
            let param = match param.first() {
                Some(t) if t.kind == TokenKind::Op && (t.text == "*" || t.text == "**") => &param[1..],
                _ => param,
            };
            if let Some(name) = param.first().filter(|t| t.kind == TokenKind::Name) {
                self.define(&name.text);
            }
            if let Some(&eq) = top_level(param, |t| t.kind == TokenKind::Op && t.text == "=").first() {
                self.expression(&param[eq + 1..]);
            }
        }
        lambda_index + 1 + colon + 1
    }

    fn import(&mut self, tokens: &[Token]) {
        for item in split_top(tokens, ",") {
            let as_pos = item.iter().position(|t| is_name(Some(t), "as"));
            match as_pos {
                Some(i) => {
                    if let Some(alias) = item.get(i + 1) {
                        self.define(&alias.text);
                    }
                }
                None => {
                    if let Some(root) = item.first().filter(|t| t.kind == TokenKind::Name) {
                        self.define(&root.text);
                    }
                }
            }
        }
    }

    fn from_import(&mut self, tokens: &[Token]) {
        let Some(import_pos) = tokens.iter().position(|t| is_name(Some(t), "import")) else {
            return;
        };
        let module: String = tokens[..import_pos].iter().map(|t| t.text.as_str()).collect();
        let mut names = &tokens[import_pos + 1..];
        if is_op(names.first(), "(") {
            let end = if is_op(names.last(), ")") { names.len() - 1 } else { names.len() };
            names = &names[1..end];
        }
        if is_op(names.first(), "*") {
            self.scan.star_imports.push(module);
            return;
        }
        for item in split_top(names, ",") {
            let as_pos = item.iter().position(|t| is_name(Some(t), "as"));
            let bound = match as_pos {
                Some(i) => item.get(i + 1),
                None => item.first(),
            };
            if let Some(bound) = bound.filter(|t| t.kind == TokenKind::Name) {
                self.define(&bound.text);
            }
        }
    }

    fn class(&mut self, tokens: &[Token], line: &LogicalLine) {
        if let Some(name) = tokens.get(1).filter(|t| t.kind == TokenKind::Name) {
            self.define(&name.text);
        }
        let colon = header_colon(tokens).unwrap_or(tokens.len());
        if colon > 2 {
            self.expression(&tokens[2..colon]);
        }
        if colon + 1 < tokens.len() {
            self.logical_line(&tokens[colon + 1..], line);
        }
    }

    fn function(&mut self, tokens: &[Token], line: &LogicalLine) {
        let Some(name) = tokens.get(1).filter(|t| t.kind == TokenKind::Name) else {
            return;
        };
        self.define(&name.text);
        let is_async = line
            .tokens
            .first()
            .is_some_and(|t| t.kind == TokenKind::Name && t.text == "async");

        let mut params = Vec::new();
        let mut params_span = (name.end, name.end);
        let mut after = 2;
        if is_op(tokens.get(2), "(") {
            let close = matching_close(tokens, 2).min(tokens.len());
            let inner = &tokens[3..close.max(3)];
            params_span = (
                tokens[2].end,
                tokens.get(close).map(|t| t.start).unwrap_or(self.src.len()),
            );
            for piece in split_top(inner, ",") {
                if let Some(param) = self.parameter(piece) {
                    params.push(param);
                }
            }
            after = close + 1;
        }
        let rest = tokens.get(after..).unwrap_or(&[]);
        let colon = header_colon(rest).unwrap_or(rest.len());
        if is_op(rest.first(), "->") {
            self.expression(&rest[1..colon]);
        }
        let body = rest.get(colon + 1..).unwrap_or(&[]);
        let inline_body = !body.is_empty();
        let header_last_line = line.first_line
            + self.src[tokens[0].start..rest.get(colon).map(|t| t.end).unwrap_or(self.src.len())]
                .matches('\n')
                .count();

        let index = self.scan.functions.len();
        self.scan.functions.push(FunctionSignature {
            name: name.text.clone(),
            params,
            indent: line.indent,
            first_line: line.first_line,
            header_last_line,
            inline_body,
            has_docstring: inline_body && body.first().map(|t| t.kind) == Some(TokenKind::Str),
            is_async,
            params_span,
        });
        if inline_body {
            self.logical_line(body, line);
        } else {
            self.pending_docstring.push((index, self.line_index));
        }
    }

    fn parameter(&mut self, piece: &[Token]) -> Option<ParamSignature> {
        let (kind, piece) = match piece.first() {
            Some(t) if is_op(Some(t), "**") => (ParamKind::KwArgs, &piece[1..]),
            Some(t) if is_op(Some(t), "*") => (ParamKind::VarArgs, &piece[1..]),
            _ => (ParamKind::Positional, piece),
        };
        let name = piece.first().filter(|t| t.kind == TokenKind::Name)?;
        self.define(&name.text);
        let eq = top_level(piece, |t| t.kind == TokenKind::Op && t.text == "=")
            .first()
            .copied();
        let colon = top_level(piece, |t| t.kind == TokenKind::Op && t.text == ":")
            .first()
            .copied()
            .filter(|c| eq.map_or(true, |e| *c < e));
        let annotation = colon.and_then(|c| {
            let slice = &piece[c + 1..eq.unwrap_or(piece.len())];
            self.expression(slice);
            self.text(slice)
        });
        let default = eq.and_then(|e| {
            let slice = &piece[e + 1..];
            self.expression(slice);
            self.text(slice)
        });
        Some(ParamSignature {
            name: name.text.clone(),
            kind,
            annotation,
            default,
        })
    }
}
