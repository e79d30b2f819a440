use super::QueryAnalyzer;
use crate::core_types::{DetectedValue, DetectedVariable, QueryAnalysis, QueryType, Shape};
use regex::Regex;

const NUMBER: &str = r"\d+(?:[.,]\d+)?";

/// Spelled-out operators, English and Polish, rewritten before scanning.
const WORD_OPERATORS: &[(&str, &str)] = &[
    ("to the power of", "^"),
    ("do potęgi", "^"),
    ("multiplied by", "*"),
    ("pomnożone przez", "*"),
    ("divided by", "/"),
    ("podzielone przez", "/"),
    ("plus", "+"),
    ("minus", "-"),
    ("times", "*"),
    ("razy", "*"),
];

/// Named quantities and the parameter name they map to.
const QUANTITIES: &[(&str, &str)] = &[
    ("radius", "radius"),
    ("promień", "radius"),
    ("promienia", "radius"),
    ("promieniu", "radius"),
    ("promieniem", "radius"),
    ("diameter", "diameter"),
    ("średnica", "diameter"),
    ("średnicy", "diameter"),
    ("średnicą", "diameter"),
    ("side", "side"),
    ("edge", "side"),
    ("bok", "side"),
    ("boku", "side"),
    ("krawędź", "side"),
    ("krawędzi", "side"),
    ("width", "width"),
    ("szerokość", "width"),
    ("szerokości", "width"),
    ("height", "height"),
    ("wysokość", "height"),
    ("wysokości", "height"),
    ("length", "length"),
    ("długość", "length"),
    ("długości", "length"),
    ("base", "base"),
    ("podstawa", "base"),
    ("podstawie", "base"),
    ("podstawy", "base"),
];

const SHAPES: &[(&str, Shape)] = &[
    ("circle", Shape::Circle),
    ("koło", Shape::Circle),
    ("koła", Shape::Circle),
    ("kole", Shape::Circle),
    ("okrąg", Shape::Circle),
    ("okręgu", Shape::Circle),
    ("square", Shape::Square),
    ("kwadrat", Shape::Square),
    ("kwadratu", Shape::Square),
    ("rectangle", Shape::Rectangle),
    ("prostokąt", Shape::Rectangle),
    ("prostokąta", Shape::Rectangle),
    ("triangle", Shape::Triangle),
    ("trójkąt", Shape::Triangle),
    ("trójkąta", Shape::Triangle),
    ("sphere", Shape::Sphere),
    ("kula", Shape::Sphere),
    ("kuli", Shape::Sphere),
    ("cube", Shape::Cube),
    ("sześcian", Shape::Cube),
    ("sześcianu", Shape::Cube),
];

/// Dimensions a bare number is assumed to fill once a shape is named.
fn shape_dimensions(shape: Shape) -> &'static [&'static str] {
    match shape {
        Shape::Circle | Shape::Sphere => &["radius"],
        Shape::Square | Shape::Cube => &["side"],
        Shape::Rectangle => &["width", "height"],
        Shape::Triangle => &["base", "height"],
    }
}

/// Words that may surround a bare arithmetic request without changing it.
const FILLER_WORDS: &[&str] = &[
    "what", "whats", "s", "is", "the", "value", "of", "result", "compute", "calculate",
    "evaluate", "solve", "please", "equals", "equal", "to", "how", "much", "give", "me", "tell",
    "find", "work", "out", "answer", "get", "oblicz", "policz", "wylicz", "ile", "jest", "wynosi",
    "wynik", "podaj", "proszę", "się", "równa", "równe", "działania", "wartość", "wyrażenia",
];

const MAX_NESTING: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Specificity {
    Generic = 0,
    Arithmetic = 1,
    Geometric = 2,
}

/// One element of a parsed arithmetic chain, in source order.
#[derive(Debug, Clone, Copy, PartialEq)]
enum ChainToken {
    Operand(DetectedValue),
    Operator(&'static str),
    Open,
    Close,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Lexeme {
    Number(DetectedValue),
    Operator(&'static str),
    Open,
    Close,
}

#[derive(Debug, Clone, Copy)]
struct Spanned {
    lexeme: Lexeme,
    start: usize,
    end: usize,
}

fn lex(token: &str) -> Option<Lexeme> {
    Some(match token {
        "(" => Lexeme::Open,
        ")" => Lexeme::Close,
        "+" => Lexeme::Operator("+"),
        "-" => Lexeme::Operator("-"),
        "*" => Lexeme::Operator("*"),
        "/" => Lexeme::Operator("/"),
        "%" => Lexeme::Operator("%"),
        "^" | "**" => Lexeme::Operator("**"),
        literal => Lexeme::Number(DetectedValue::parse(literal)?),
    })
}

/// Drops dangling operators and unmatched outer parentheses.
fn trim_segment(mut segment: &[Spanned]) -> &[Spanned] {
    loop {
        let before = segment.len();
        if let Some(first) = segment.first() {
            match first.lexeme {
                Lexeme::Close => segment = &segment[1..],
                Lexeme::Operator(op) if op != "-" && op != "+" => segment = &segment[1..],
                _ => {}
            }
        }
        if let Some(last) = segment.last() {
            if matches!(last.lexeme, Lexeme::Open | Lexeme::Operator(_)) {
                segment = &segment[..segment.len() - 1];
            }
        }
        let opens = segment.iter().filter(|s| s.lexeme == Lexeme::Open).count();
        let closes = segment.iter().filter(|s| s.lexeme == Lexeme::Close).count();
        if opens > closes && segment.first().is_some_and(|s| s.lexeme == Lexeme::Open) {
            segment = &segment[1..];
        } else if closes > opens && segment.last().is_some_and(|s| s.lexeme == Lexeme::Close) {
            segment = &segment[..segment.len() - 1];
        }
        if segment.len() == before {
            return segment;
        }
    }
}

/// Recursive descent over `term (op term)*`, where a term is an optionally
/// signed number or a parenthesized chain.
struct ChainParser<'a> {
    lexemes: &'a [Spanned],
    pos: usize,
    tokens: Vec<ChainToken>,
    binary_operators: usize,
}

impl<'a> ChainParser<'a> {
    fn peek(&self) -> Option<Lexeme> {
        self.lexemes.get(self.pos).map(|s| s.lexeme)
    }

    fn chain(&mut self, depth: usize) -> Option<()> {
        self.term(depth)?;
        while let Some(Lexeme::Operator(op)) = self.peek() {
            self.pos += 1;
            self.tokens.push(ChainToken::Operator(op));
            self.binary_operators += 1;
            self.term(depth)?;
        }
        Some(())
    }

    fn term(&mut self, depth: usize) -> Option<()> {
        let mut negative = false;
        if let Some(Lexeme::Operator(op @ ("-" | "+"))) = self.peek() {
            negative = op == "-";
            self.pos += 1;
        }
        match self.peek()? {
            Lexeme::Number(value) => {
                self.pos += 1;
                let value = if negative { value.negated() } else { value };
                self.tokens.push(ChainToken::Operand(value));
                Some(())
            }
            Lexeme::Open if depth < MAX_NESTING => {
                self.pos += 1;
                if negative {
                    self.tokens.push(ChainToken::Negate);
                }
                self.tokens.push(ChainToken::Open);
                self.chain(depth + 1)?;
                match self.peek()? {
                    Lexeme::Close => {
                        self.pos += 1;
                        self.tokens.push(ChainToken::Close);
                        Some(())
                    }
                    _ => None,
                }
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
enum Found {
    Quantity { name: &'static str, value: DetectedValue },
    Chain { tokens: Vec<ChainToken> },
    Number(DetectedValue),
}

#[derive(Debug, Clone)]
struct Candidate {
    start: usize,
    end: usize,
    specificity: Specificity,
    found: Found,
}

impl Candidate {
    fn overlaps(&self, other: &Candidate) -> bool {
        self.start < other.end && other.start < self.end
    }
}

struct Patterns {
    operators: Vec<(Regex, &'static str)>,
    symbol_times: Regex,
    colon_division: Regex,
    quantity: Regex,
    short_radius: Regex,
    shape: Regex,
    chain_token: Regex,
    arithmetic_operator: Regex,
    number: Regex,
}

impl Patterns {
    fn compile() -> Result<Self, regex::Error> {
        let operators = WORD_OPERATORS
            .iter()
            .map(|(word, op)| {
                Regex::new(&format!(r"\b{}\b", regex::escape(word))).map(|re| (re, *op))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let quantity_words = alternation(QUANTITIES.iter().map(|(w, _)| *w));
        let shape_words = alternation(SHAPES.iter().map(|(w, _)| *w));
        Ok(Self {
            operators,
            symbol_times: Regex::new(r"(\d)\s*[x×]\s*(\d)")?,
            colon_division: Regex::new(r"(\d)\s*[:÷]\s*(\d)")?,
            quantity: Regex::new(&format!(
                r"\b(?P<word>{})\b(?:\s+(?:of|is|equal to|equals|wynosi|równ[aey]|o|the))*\s*[:=]?\s*(?P<value>{})",
                quantity_words, NUMBER
            ))?,
            short_radius: Regex::new(&format!(r"\br\s*=\s*(?P<value>{})", NUMBER))?,
            shape: Regex::new(&format!(r"\b(?P<shape>{})\b", shape_words))?,
            chain_token: Regex::new(&format!(r"{}|\*\*|[-+*/^%()]", NUMBER))?,
            arithmetic_operator: Regex::new(r"[+*/^%]|\d\s*-\s*\d")?,
            number: Regex::new(NUMBER)?,
        })
    }
}

/// Longest words first so prefixes never shadow inflected forms.
fn alternation<'a>(words: impl Iterator<Item = &'a str>) -> String {
    let mut words: Vec<&str> = words.collect();
    words.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    words
        .iter()
        .map(|w| regex::escape(w))
        .collect::<Vec<_>>()
        .join("|")
}

/// True when everything outside `span` is filler around the arithmetic.
fn only_filler_outside(text: &str, span: (usize, usize)) -> bool {
    let residual = format!("{} {}", &text[..span.0], &text[span.1..]);
    if residual
        .chars()
        .any(|c| c.is_ascii_digit() || "+-*/^%()".contains(c))
    {
        return false;
    }
    residual
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .all(|word| FILLER_WORDS.contains(&word))
}

/// Pattern-based analyzer for arithmetic and geometric requests in English
/// and Polish.
///
/// A named shape is read first: its dimensions are filled from named
/// quantities or bare numbers, and the reading only stands when nothing is
/// left over and no arithmetic operator appears. Otherwise candidates from
/// every pattern family are collected and accepted by specificity (geometric
/// over arithmetic over bare numbers) and scan order; a candidate overlapping
/// an accepted one is dropped, which marks the analysis ambiguous. A chain is
/// only an arithmetic request when it is the whole request.
pub struct HeuristicAnalyzer {
    patterns: Option<Patterns>,
}

impl HeuristicAnalyzer {
    pub fn new() -> Self {
        let patterns = Patterns::compile()
            .map_err(|e| log::error!("Query patterns failed to compile: {}", e))
            .ok();
        Self { patterns }
    }

    fn normalize(&self, patterns: &Patterns, lowered: &str, rewrite_times: bool) -> String {
        let mut normalized = lowered.to_string();
        for (re, op) in &patterns.operators {
            normalized = re.replace_all(&normalized, *op).into_owned();
        }
        // Two passes cover chains like `2x3x4`, where matches share a digit.
        for _ in 0..2 {
            if rewrite_times {
                normalized = patterns
                    .symbol_times
                    .replace_all(&normalized, "${1}*${2}")
                    .into_owned();
            }
            normalized = patterns
                .colon_division
                .replace_all(&normalized, "${1}/${2}")
                .into_owned();
        }
        normalized
    }

    fn candidates(&self, patterns: &Patterns, text: &str, with_chains: bool) -> Vec<Candidate> {
        let mut candidates = Vec::new();
        for caps in patterns.quantity.captures_iter(text) {
            let (Some(whole), Some(word), Some(value)) =
                (caps.get(0), caps.name("word"), caps.name("value"))
            else {
                continue;
            };
            let name = QUANTITIES
                .iter()
                .find(|(w, _)| *w == word.as_str())
                .map(|(_, n)| *n);
            if let (Some(name), Some(value)) = (name, DetectedValue::parse(value.as_str())) {
                candidates.push(Candidate {
                    start: whole.start(),
                    end: whole.end(),
                    specificity: Specificity::Geometric,
                    found: Found::Quantity { name, value },
                });
            }
        }
        for caps in patterns.short_radius.captures_iter(text) {
            let (Some(whole), Some(value)) = (caps.get(0), caps.name("value")) else {
                continue;
            };
            if let Some(value) = DetectedValue::parse(value.as_str()) {
                candidates.push(Candidate {
                    start: whole.start(),
                    end: whole.end(),
                    specificity: Specificity::Geometric,
                    found: Found::Quantity { name: "radius", value },
                });
            }
        }
        if with_chains {
            candidates.extend(self.chains(patterns, text));
        }
        for m in patterns.number.find_iter(text) {
            if let Some(value) = DetectedValue::parse(m.as_str()) {
                candidates.push(Candidate {
                    start: m.start(),
                    end: m.end(),
                    specificity: Specificity::Generic,
                    found: Found::Number(value),
                });
            }
        }
        candidates
    }

    /// Splits the text into runs of arithmetic lexemes and parses each run.
    /// Runs break at words, punctuation, and juxtaposed operands.
    fn chains(&self, patterns: &Patterns, text: &str) -> Vec<Candidate> {
        let mut segments: Vec<Vec<Spanned>> = Vec::new();
        let mut current: Vec<Spanned> = Vec::new();
        let mut last_end = 0;
        for m in patterns.chain_token.find_iter(text) {
            let gap_is_blank = text[last_end..m.start()].trim().is_empty();
            last_end = m.end();
            let Some(lexeme) = lex(m.as_str()) else {
                segments.push(std::mem::take(&mut current));
                continue;
            };
            let juxtaposed = matches!(
                (current.last().map(|s| s.lexeme), lexeme),
                (
                    Some(Lexeme::Number(_) | Lexeme::Close),
                    Lexeme::Number(_) | Lexeme::Open
                )
            );
            if !gap_is_blank || juxtaposed {
                segments.push(std::mem::take(&mut current));
            }
            current.push(Spanned {
                lexeme,
                start: m.start(),
                end: m.end(),
            });
        }
        segments.push(current);

        segments
            .iter()
            .filter_map(|segment| {
                let lexemes = trim_segment(segment);
                let mut parser = ChainParser {
                    lexemes,
                    pos: 0,
                    tokens: Vec::new(),
                    binary_operators: 0,
                };
                parser.chain(0)?;
                if parser.pos != lexemes.len() || parser.binary_operators == 0 {
                    return None;
                }
                Some(Candidate {
                    start: lexemes.first()?.start,
                    end: lexemes.last()?.end,
                    specificity: Specificity::Arithmetic,
                    found: Found::Chain {
                        tokens: parser.tokens,
                    },
                })
            })
            .collect()
    }

    /// Accepts candidates by specificity, then scan order.
    fn accept(&self, mut candidates: Vec<Candidate>) -> (Vec<Candidate>, bool) {
        candidates.sort_by(|a, b| {
            b.specificity
                .cmp(&a.specificity)
                .then_with(|| a.start.cmp(&b.start))
        });
        let mut accepted: Vec<Candidate> = Vec::new();
        let mut ambiguous = false;
        for candidate in candidates {
            if accepted.iter().any(|a| a.overlaps(&candidate)) {
                if candidate.specificity != Specificity::Generic {
                    ambiguous = true;
                }
                continue;
            }
            accepted.push(candidate);
        }
        accepted.sort_by_key(|c| c.start);
        (accepted, ambiguous)
    }

    fn shape_reading(&self, patterns: &Patterns, lowered: &str, shape: Shape) -> Option<QueryAnalysis> {
        // `3x4` stays a pair of dimensions here.
        let normalized = self.normalize(patterns, lowered, false);
        if patterns.arithmetic_operator.is_match(&normalized) {
            return None;
        }
        let (accepted, ambiguous) = self.accept(self.candidates(patterns, &normalized, false));
        let has_quantity = accepted
            .iter()
            .any(|c| c.specificity == Specificity::Geometric);
        let mut slots: Vec<&str> = if has_quantity {
            Vec::new()
        } else {
            shape_dimensions(shape).to_vec()
        };
        slots.reverse();

        let mut variables: Vec<DetectedVariable> = Vec::new();
        for candidate in accepted {
            let (base, value) = match candidate.found {
                Found::Quantity { name, value } => (name, value),
                // A number no dimension can take means something else is asked.
                Found::Number(value) => (slots.pop()?, value),
                Found::Chain { .. } => return None,
            };
            let name = unique_name(&variables, base);
            variables.push(DetectedVariable { name, value });
        }
        if variables.is_empty() {
            return None;
        }

        let mut confidence = if has_quantity { 0.9 } else { 0.6 };
        if ambiguous {
            confidence *= 0.75;
        }
        Some(QueryAnalysis {
            query_type: QueryType::Geometric,
            detected_variables: variables,
            confidence,
            expression: None,
            shape: Some(shape),
            ambiguous,
        })
    }

    fn general_reading(&self, patterns: &Patterns, lowered: &str) -> QueryAnalysis {
        let normalized = self.normalize(patterns, lowered, true);
        let (accepted, ambiguous) = self.accept(self.candidates(patterns, &normalized, true));

        let has_quantity = accepted
            .iter()
            .any(|c| c.specificity == Specificity::Geometric);
        let chain_spans: Vec<(usize, usize)> = accepted
            .iter()
            .filter(|c| c.specificity == Specificity::Arithmetic)
            .map(|c| (c.start, c.end))
            .collect();
        let bare_numbers = accepted
            .iter()
            .filter(|c| c.specificity == Specificity::Generic)
            .count();
        let whole_chain = !has_quantity
            && bare_numbers == 0
            && chain_spans.len() == 1
            && only_filler_outside(&normalized, chain_spans[0]);

        let mut variables: Vec<DetectedVariable> = Vec::new();
        let mut expression: Option<String> = None;
        let mut letters = 0usize;
        let mut generic_count = 0usize;
        for candidate in accepted {
            match candidate.found {
                Found::Quantity { name, value } => {
                    let name = unique_name(&variables, name);
                    variables.push(DetectedVariable { name, value });
                }
                Found::Chain { tokens } => {
                    let mut expr = String::new();
                    for token in tokens {
                        match token {
                            ChainToken::Operand(value) => {
                                let name = letter_name(letters);
                                letters += 1;
                                expr.push_str(&name);
                                variables.push(DetectedVariable { name, value });
                            }
                            ChainToken::Operator(op) => {
                                expr.push(' ');
                                expr.push_str(op);
                                expr.push(' ');
                            }
                            ChainToken::Open => expr.push('('),
                            ChainToken::Close => expr.push(')'),
                            ChainToken::Negate => expr.push('-'),
                        }
                    }
                    if expression.is_none() {
                        expression = Some(expr);
                    }
                }
                Found::Number(value) => {
                    generic_count += 1;
                    variables.push(DetectedVariable {
                        name: format!("n{}", generic_count),
                        value,
                    });
                }
            }
        }

        let (query_type, mut confidence) = if has_quantity {
            (QueryType::Geometric, 0.9)
        } else if whole_chain {
            (QueryType::Arithmetic, 0.9)
        } else if !chain_spans.is_empty() {
            (QueryType::Generic, 0.4)
        } else if !variables.is_empty() {
            (QueryType::Generic, 0.3)
        } else {
            (QueryType::Generic, 0.0)
        };
        if ambiguous {
            confidence *= 0.75;
        }

        QueryAnalysis {
            query_type,
            detected_variables: variables,
            confidence,
            expression: if query_type == QueryType::Arithmetic {
                expression
            } else {
                None
            },
            shape: None,
            ambiguous,
        }
    }
}

impl Default for HeuristicAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryAnalyzer for HeuristicAnalyzer {
    fn analyze(&self, text: &str) -> QueryAnalysis {
        let Some(patterns) = &self.patterns else {
            return QueryAnalysis::generic();
        };
        let lowered = text.to_lowercase();
        let shape = patterns
            .shape
            .captures(&lowered)
            .and_then(|caps| caps.name("shape"))
            .and_then(|m| SHAPES.iter().find(|(w, _)| *w == m.as_str()))
            .map(|(_, s)| *s);

        let analysis = shape
            .and_then(|shape| self.shape_reading(patterns, &lowered, shape))
            .unwrap_or_else(|| self.general_reading(patterns, &lowered));
        log::debug!("Analyzed query {:?}: {:?}", text, analysis);
        analysis
    }
}

fn letter_name(index: usize) -> String {
    const LETTERS: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    match LETTERS.get(index) {
        Some(letter) => (*letter as char).to_string(),
        None => format!("x{}", index + 1),
    }
}

fn unique_name(existing: &[DetectedVariable], base: &str) -> String {
    if !existing.iter().any(|v| v.name == base) {
        return base.to_string();
    }
    let mut suffix = 2;
    loop {
        let candidate = format!("{}{}", base, suffix);
        if !existing.iter().any(|v| v.name == candidate) {
            return candidate;
        }
        suffix += 1;
    }
}
