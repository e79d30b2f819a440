//! Normalization of extracted source into a single documented entry point.
//!
//! Every artifact leaving the generator has one top-level function that can be
//! called with no arguments: missing parameter defaults are filled from the
//! query analysis, loose top-level code is wrapped into a function, and a
//! docstring is attached when the model did not write one.

use crate::core_types::{ParamType, Parameter, QueryAnalysis};
use crate::deps::scanner::{
    is_keyword, logical_lines, scan, FunctionSignature, LogicalLine, ParamKind, SymbolScan,
    Token, TokenKind,
};

const PREFERRED_ENTRIES: &[&str] = &["main", "solve", "solution", "calculate", "compute"];
const RESULT_NAMES: &[&str] = &["result", "wynik", "answer", "output", "res"];
const WRAPPER_NAME: &str = "solution";

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub source_text: String,
    pub entry_point_name: String,
    pub parameters: Vec<Parameter>,
}

pub fn normalize(source: &str, analysis: &QueryAnalysis, summary: &str) -> Normalized {
    let mut source = source.trim_matches('\n').to_string();
    source.push('\n');

    let scanned = scan(&source);
    let entry_name = match select_entry(&scanned) {
        Some(entry) => {
            let name = entry.name.clone();
            source = fill_defaults(&source, entry, analysis);
            name
        }
        None => {
            log::debug!("No top-level function found, wrapping body in '{}'", WRAPPER_NAME);
            source = wrap_body(&source, &scanned, analysis);
            WRAPPER_NAME.to_string()
        }
    };

    source = strip_entry_calls(&source, &entry_name);

    let scanned = scan(&source);
    if let Some(entry) = find_top_level(&scanned, &entry_name) {
        let parameters = entry_parameters(entry);
        source = attach_docstring(&source, entry, summary, &parameters);
    }

    let scanned = scan(&source);
    let parameters = find_top_level(&scanned, &entry_name)
        .map(entry_parameters)
        .unwrap_or_default();
    Normalized {
        source_text: source,
        entry_point_name: entry_name,
        parameters,
    }
}

/// Entry point and parameters of existing source, without rewriting it.
pub fn inspect_entry(source: &str) -> Option<(String, Vec<Parameter>)> {
    let scanned = scan(source);
    select_entry(&scanned).map(|entry| (entry.name.clone(), entry_parameters(entry)))
}

/// Docstring block for a function body at `indent`, ending with a newline.
pub fn render_docstring(summary: &str, parameters: &[Parameter], indent: &str) -> String {
    let mut summary = summary
        .trim()
        .replace('\\', "\\\\")
        .replace("\"\"\"", "\\\"\\\"\\\"");
    if summary.ends_with('"') {
        summary.push(' ');
    }
    if parameters.is_empty() {
        return format!("{}\"\"\"{}\"\"\"\n", indent, summary);
    }
    let mut doc = format!("{}\"\"\"{}\n\n{}Parameters:\n", indent, summary, indent);
    for param in parameters {
        match &param.default_value {
            Some(default) => doc.push_str(&format!(
                "{}    {} ({}): defaults to {}\n",
                indent, param.name, param.inferred_type, default
            )),
            None => doc.push_str(&format!(
                "{}    {} ({})\n",
                indent, param.name, param.inferred_type
            )),
        }
    }
    doc.push_str(&format!("{}\"\"\"\n", indent));
    doc
}

fn select_entry(scanned: &SymbolScan) -> Option<&FunctionSignature> {
    let top: Vec<&FunctionSignature> = scanned.functions.iter().filter(|f| f.indent == 0).collect();
    for preferred in PREFERRED_ENTRIES {
        if let Some(entry) = top.iter().find(|f| f.name == *preferred) {
            return Some(*entry);
        }
    }
    top.iter()
        .rev()
        .find(|f| !f.name.starts_with('_'))
        .or(top.last())
        .copied()
}

fn find_top_level<'a>(scanned: &'a SymbolScan, name: &str) -> Option<&'a FunctionSignature> {
    scanned
        .functions
        .iter()
        .find(|f| f.indent == 0 && f.name == name)
}

fn entry_parameters(entry: &FunctionSignature) -> Vec<Parameter> {
    entry
        .params
        .iter()
        .filter(|p| p.kind == ParamKind::Positional)
        .map(|p| Parameter {
            name: p.name.clone(),
            default_value: p.default.clone(),
            inferred_type: ParamType::infer(p.annotation.as_deref(), p.default.as_deref()),
        })
        .collect()
}

struct Slot {
    name: String,
    has_default: bool,
    keyword_only: bool,
    annotated: bool,
    /// Byte offset in the full source right after the parameter.
    insert_at: usize,
}

/// Gives every positional parameter without a default one taken from the
/// analysis, by name first and then by order.
fn fill_defaults(source: &str, entry: &FunctionSignature, analysis: &QueryAnalysis) -> String {
    let (start, end) = entry.params_span;
    if start >= end || end > source.len() || analysis.detected_variables.is_empty() {
        return source.to_string();
    }
    let wrapped = format!("({})", &source[start..end]);
    let Some(line) = logical_lines(&wrapped).into_iter().next() else {
        return source.to_string();
    };
    if line.tokens.len() < 2 {
        return source.to_string();
    }
    let inner = &line.tokens[1..line.tokens.len() - 1];

    let mut slots = Vec::new();
    let mut keyword_only = false;
    for piece in split_commas(inner) {
        let Some(first) = piece.first() else { continue };
        if first.kind == TokenKind::Op {
            if first.text == "*" || first.text == "**" {
                keyword_only = true;
            }
            continue;
        }
        if first.kind != TokenKind::Name {
            continue;
        }
        let (has_default, annotated) = top_level_markers(piece);
        let Some(last) = piece.last() else { continue };
        slots.push(Slot {
            name: first.text.clone(),
            has_default,
            keyword_only,
            annotated,
            insert_at: start + last.end - 1,
        });
    }

    let mut fills: Vec<Option<String>> = slots
        .iter()
        .map(|slot| {
            if slot.has_default {
                None
            } else {
                analysis.variable(&slot.name).map(|v| v.to_python())
            }
        })
        .collect();
    let mut unnamed = analysis
        .detected_variables
        .iter()
        .filter(|v| !slots.iter().any(|s| s.name == v.name));
    for (slot, fill) in slots.iter().zip(fills.iter_mut()) {
        if slot.has_default || fill.is_some() {
            continue;
        }
        match unnamed.next() {
            Some(variable) => *fill = Some(variable.value.to_python()),
            None => break,
        }
    }

    // A positional parameter without a default may not follow one with a
    // default, so only the tail after the last bare one can be filled.
    let last_bare = slots
        .iter()
        .zip(fills.iter())
        .rposition(|(slot, fill)| !slot.keyword_only && !slot.has_default && fill.is_none());
    if let Some(last_bare) = last_bare {
        for (slot, fill) in slots.iter().zip(fills.iter_mut()).take(last_bare) {
            if !slot.keyword_only {
                *fill = None;
            }
        }
    }

    let mut output = source.to_string();
    for (slot, fill) in slots.iter().zip(fills.iter()).rev() {
        if let Some(value) = fill {
            let text = if slot.annotated {
                format!(" = {}", value)
            } else {
                format!("={}", value)
            };
            output.insert_str(slot.insert_at, &text);
        }
    }
    output
}

fn split_commas(tokens: &[Token]) -> Vec<&[Token]> {
    let mut pieces = Vec::new();
    let mut depth = 0isize;
    let mut start = 0;
    for (i, token) in tokens.iter().enumerate() {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "," if depth == 0 => {
                pieces.push(&tokens[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    pieces.push(&tokens[start..]);
    pieces
}

/// Whether a parameter piece has a default (`=`) or annotation (`:`) at
/// bracket depth zero.
fn top_level_markers(piece: &[Token]) -> (bool, bool) {
    let mut depth = 0isize;
    let (mut default, mut annotated) = (false, false);
    for token in piece {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "=" if depth == 0 => default = true,
            ":" if depth == 0 && !default => annotated = true,
            _ => {}
        }
    }
    (default, annotated)
}

fn is_import_line(line: &LogicalLine) -> bool {
    line.indent == 0
        && line.tokens.first().is_some_and(|t| {
            t.kind == TokenKind::Name && (t.text == "import" || t.text == "from")
        })
}

/// Wraps loose top-level code in `def solution(...)`, hoisting imports and
/// turning the final expression into the return value.
fn wrap_body(source: &str, scanned: &SymbolScan, analysis: &QueryAnalysis) -> String {
    let mut lines: Vec<String> = source.lines().map(str::to_string).collect();
    let line_starts = line_starts(source);
    let in_string = string_interior_lines(scanned, &line_starts, lines.len());
    let mut hoisted_lines = vec![false; lines.len()];
    for line in scanned.lines.iter().filter(|l| is_import_line(l)) {
        for flag in hoisted_lines
            .iter_mut()
            .take(line.last_line + 1)
            .skip(line.first_line)
        {
            *flag = true;
        }
    }

    let last_statement = scanned
        .lines
        .iter()
        .filter(|l| l.indent == 0 && !is_import_line(l))
        .last();
    let mut trailer: Vec<String> = Vec::new();
    if last_statement.is_none() {
        trailer.push("return None".to_string());
    }
    if let Some(statement) = last_statement {
        match final_statement(statement) {
            FinalStatement::Print if statement.last_line < lines.len() => {
                // `print(<arg>)` becomes `_result = (<arg>)` in place.
                let column = statement.tokens[0].start - line_starts[statement.first_line];
                let line = &mut lines[statement.first_line];
                line.replace_range(column..column + "print".len(), "_result = ");
                trailer.push("print(_result)".to_string());
                trailer.push("return _result".to_string());
            }
            FinalStatement::Expression if statement.first_line < lines.len() => {
                let line = &mut lines[statement.first_line];
                let indent = line.len() - line.trim_start().len();
                line.insert_str(indent, "return ");
            }
            FinalStatement::Assignment(name) => trailer.push(format!("return {}", name)),
            _ => {
                if let Some(name) = RESULT_NAMES
                    .iter()
                    .find(|n| scanned.definitions.contains(**n))
                {
                    trailer.push(format!("return {}", name));
                }
            }
        }
    }

    let signature = analysis
        .detected_variables
        .iter()
        .map(|v| format!("{}={}", v.name, v.value.to_python()))
        .collect::<Vec<_>>()
        .join(", ");

    let mut output = String::new();
    let mut body = String::new();
    for (index, (line, hoisted)) in lines.iter().zip(hoisted_lines.iter()).enumerate() {
        if *hoisted {
            output.push_str(line);
            output.push('\n');
        } else if in_string[index] {
            body.push_str(line);
            body.push('\n');
        } else if line.trim().is_empty() {
            body.push('\n');
        } else {
            body.push_str("    ");
            body.push_str(line);
            body.push('\n');
        }
    }
    for line in &trailer {
        body.push_str("    ");
        body.push_str(line);
        body.push('\n');
    }
    let body = body.trim_matches('\n');
    if !output.is_empty() {
        output.push('\n');
    }
    output.push_str(&format!("def {}({}):\n", WRAPPER_NAME, signature));
    output.push_str(body);
    output.push('\n');
    output
}

/// Byte offset at which each physical line starts.
fn line_starts(source: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(source.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Physical lines that continue a string literal opened on an earlier line.
/// Their text belongs to the literal and must not be re-indented.
fn string_interior_lines(scanned: &SymbolScan, line_starts: &[usize], count: usize) -> Vec<bool> {
    let line_of = |offset: usize| line_starts.partition_point(|&start| start <= offset) - 1;
    let mut inside = vec![false; count];
    let strings = scanned
        .lines
        .iter()
        .flat_map(|line| &line.tokens)
        .filter(|token| token.kind == TokenKind::Str && token.text.contains('\n'));
    for token in strings {
        let last = line_of(token.end.saturating_sub(1));
        for flag in inside.iter_mut().take(last + 1).skip(line_of(token.start) + 1) {
            *flag = true;
        }
    }
    inside
}

enum FinalStatement {
    Print,
    Expression,
    Assignment(String),
    Other,
}

fn final_statement(line: &LogicalLine) -> FinalStatement {
    let tokens = &line.tokens;
    let Some(first) = tokens.first() else {
        return FinalStatement::Other;
    };
    let Some(last) = tokens.last() else {
        return FinalStatement::Other;
    };

    let is_op = |i: usize, text: &str| {
        tokens
            .get(i)
            .is_some_and(|t| t.kind == TokenKind::Op && t.text == text)
    };

    if first.kind == TokenKind::Name && first.text == "print" && is_op(1, "(") {
        let close = closing_index(tokens, 1);
        if close == tokens.len() - 1 && close > 2 {
            let args = &tokens[2..close];
            let single = split_commas(args).len() == 1
                && !args.iter().any(|t| t.kind == TokenKind::Op && t.text == "=");
            if single {
                return FinalStatement::Print;
            }
        }
        return FinalStatement::Other;
    }

    let (assigns, augmented) = assignment_markers(tokens);
    if assigns > 0 {
        if assigns == 1 && tokens.len() > 2 && first.kind == TokenKind::Name && is_op(1, "=") {
            return FinalStatement::Assignment(first.text.clone());
        }
        return FinalStatement::Other;
    }
    if augmented {
        return FinalStatement::Other;
    }

    let expression_start = match first.kind {
        TokenKind::Number | TokenKind::Str => true,
        TokenKind::Name => {
            !is_keyword(&first.text)
                || matches!(first.text.as_str(), "True" | "False" | "None" | "not" | "lambda" | "await")
        }
        TokenKind::Op => matches!(first.text.as_str(), "(" | "[" | "{" | "-" | "+" | "~"),
    };
    // A trailing colon means a compound statement header.
    if expression_start && !(last.kind == TokenKind::Op && last.text == ":") {
        FinalStatement::Expression
    } else {
        FinalStatement::Other
    }
}

fn closing_index(tokens: &[Token], open: usize) -> usize {
    let mut depth = 0isize;
    for (i, token) in tokens.iter().enumerate().skip(open) {
        if token.kind == TokenKind::Op {
            match token.text.as_str() {
                "(" | "[" | "{" => depth += 1,
                ")" | "]" | "}" => depth -= 1,
                _ => {}
            }
        }
        if depth == 0 {
            return i;
        }
    }
    tokens.len()
}

/// Counts top-level `=` and reports augmented assignment operators.
fn assignment_markers(tokens: &[Token]) -> (usize, bool) {
    const AUGMENTED: &[&str] = &[
        "+=", "-=", "*=", "/=", "//=", "%=", "**=", "&=", "|=", "^=", ">>=", "<<=", "@=",
    ];
    let mut depth = 0isize;
    let mut assigns = 0;
    let mut augmented = false;
    for token in tokens {
        if token.kind != TokenKind::Op {
            continue;
        }
        match token.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "=" if depth == 0 => assigns += 1,
            op if depth == 0 && AUGMENTED.contains(&op) => augmented = true,
            _ => {}
        }
    }
    (assigns, augmented)
}

/// Drops top-level statements that only call the entry point, such as
/// `main()` or `print(main())`; the sandbox makes that call itself.
fn strip_entry_calls(source: &str, entry_name: &str) -> String {
    let scanned = scan(source);
    let mut drop = vec![false; source.lines().count()];
    for line in scanned.lines.iter().filter(|l| l.indent == 0) {
        let tokens = &line.tokens;
        let is = |i: usize, kind: TokenKind, text: &str| {
            tokens.get(i).is_some_and(|t| t.kind == kind && t.text == text)
        };
        let call_at = if is(0, TokenKind::Name, entry_name) && is(1, TokenKind::Op, "(") {
            Some(1)
        } else if is(0, TokenKind::Name, "print")
            && is(1, TokenKind::Op, "(")
            && is(2, TokenKind::Name, entry_name)
            && is(3, TokenKind::Op, "(")
            && closing_index(tokens, 1) == tokens.len() - 1
        {
            Some(3)
        } else {
            None
        };
        let Some(open) = call_at else { continue };
        let whole_line = if open == 1 {
            closing_index(tokens, 1) == tokens.len() - 1
        } else {
            closing_index(tokens, open) == tokens.len() - 2
        };
        if whole_line {
            for flag in drop.iter_mut().take(line.last_line + 1).skip(line.first_line) {
                *flag = true;
            }
        }
    }
    if !drop.iter().any(|d| *d) {
        return source.to_string();
    }
    let mut output: String = source
        .lines()
        .zip(drop.iter())
        .filter(|(_, dropped)| !**dropped)
        .map(|(line, _)| format!("{}\n", line))
        .collect();
    while output.ends_with("\n\n") {
        output.pop();
    }
    output
}

fn attach_docstring(
    source: &str,
    entry: &FunctionSignature,
    summary: &str,
    parameters: &[Parameter],
) -> String {
    if entry.has_docstring || entry.inline_body {
        return source.to_string();
    }
    let lines: Vec<&str> = source.lines().collect();
    let insert_at = entry.header_last_line + 1;
    let indent = lines
        .iter()
        .skip(insert_at)
        .find(|l| !l.trim().is_empty())
        .map(|l| l[..l.len() - l.trim_start().len()].to_string())
        .filter(|indent| indent.len() > entry.indent)
        .unwrap_or_else(|| " ".repeat(entry.indent + 4));
    let docstring = render_docstring(summary, parameters, &indent);

    let mut output = String::new();
    for (i, line) in lines.iter().enumerate() {
        if i == insert_at {
            output.push_str(&docstring);
        }
        output.push_str(line);
        output.push('\n');
    }
    if insert_at >= lines.len() {
        output.push_str(&docstring);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{DetectedValue, DetectedVariable, QueryType};

    fn analysis(vars: &[(&str, i64)]) -> QueryAnalysis {
        QueryAnalysis {
            query_type: QueryType::Arithmetic,
            detected_variables: vars
                .iter()
                .map(|(name, value)| DetectedVariable {
                    name: name.to_string(),
                    value: DetectedValue::Int(*value),
                })
                .collect(),
            confidence: 0.9,
            expression: None,
            shape: None,
            ambiguous: false,
        }
    }

    #[test]
    fn test_existing_entry_gets_defaults_by_name_then_order() {
        let source = "def add(x, b):\n    return x + b\n";
        let normalized = normalize(source, &analysis(&[("a", 2), ("b", 3)]), "Add.");
        assert_eq!(normalized.entry_point_name, "add");
        assert!(normalized.source_text.starts_with("def add(x=2, b=3):\n"));
        assert_eq!(normalized.parameters.len(), 2);
        assert_eq!(normalized.parameters[0].default_value.as_deref(), Some("2"));
        assert_eq!(normalized.parameters[0].inferred_type, ParamType::Int);
    }

    #[test]
    fn test_annotated_parameters_and_partial_fill_stay_valid() {
        let source = "def main(x: int, y: int, z: int = 1):\n    return x + y + z\n";
        let normalized = normalize(source, &analysis(&[("a", 2), ("b", 3)]), "Sum.");
        assert!(normalized
            .source_text
            .starts_with("def main(x: int = 2, y: int = 3, z: int = 1):"));

        let source = "def main(x, y, z):\n    return x\n";
        let normalized = normalize(source, &analysis(&[("z", 7)]), "Only z.");
        assert!(normalized.source_text.starts_with("def main(x, y, z=7):"));

        let source = "def main(x, y):\n    return x\n";
        let normalized = normalize(source, &analysis(&[("x", 7)]), "Only x.");
        assert!(normalized.source_text.starts_with("def main(x, y):"));
    }

    #[test]
    fn test_preferred_entry_name() {
        let source = "def helper(v):\n    return v * 2\n\ndef main():\n    return helper(2)\n\ndef other():\n    pass\n";
        assert_eq!(normalize(source, &analysis(&[]), "x").entry_point_name, "main");
        let source = "def helper(v):\n    return v\n\ndef area(r=1):\n    return r\n";
        assert_eq!(normalize(source, &analysis(&[]), "x").entry_point_name, "area");
    }

    #[test]
    fn test_loose_code_is_wrapped_with_detected_parameters() {
        let source = "import math\nvalue = a + b\nprint(value)\n";
        let normalized = normalize(source, &analysis(&[("a", 2), ("b", 2)]), "Add two numbers.");
        assert_eq!(normalized.entry_point_name, "solution");
        assert!(normalized
            .source_text
            .starts_with("import math\n\ndef solution(a=2, b=2):\n    \"\"\"Add two numbers."));
        assert!(normalized.source_text.contains("    _result = (value)\n    print(_result)\n    return _result\n"));
        assert_eq!(normalized.parameters.len(), 2);
    }

    #[test]
    fn test_wrapped_final_expression_becomes_return() {
        let normalized = normalize("x = 6\nx * 7\n", &analysis(&[]), "Multiply.");
        assert!(normalized.source_text.contains("    return x * 7\n"));

        let normalized = normalize("wynik = 6 * 7\n", &analysis(&[]), "Multiply.");
        assert!(normalized.source_text.ends_with("    wynik = 6 * 7\n    return wynik\n"));

        let normalized = normalize("result = 1\nfor i in range(3):\n    result *= 2\n", &analysis(&[]), "Loop.");
        assert!(normalized.source_text.ends_with("    return result\n"));
    }

    #[test]
    fn test_entry_calls_are_removed() {
        let source = "def main(n=3):\n    return n * 2\n\nprint(main())\nmain()\n";
        let normalized = normalize(source, &analysis(&[]), "Double.");
        assert!(!normalized.source_text.contains("print(main())"));
        assert!(normalized.source_text.trim_end().ends_with("return n * 2"));
    }

    #[test]
    fn test_docstring_attached_once() {
        let source = "def main(n=3):\n    return n\n";
        let normalized = normalize(source, &analysis(&[]), "Identity.");
        assert!(normalized.source_text.contains(
            "def main(n=3):\n    \"\"\"Identity.\n\n    Parameters:\n        n (int): defaults to 3\n    \"\"\"\n    return n\n"
        ));
        let again = normalize(&normalized.source_text, &analysis(&[]), "Identity.");
        assert_eq!(again.source_text, normalized.source_text);
    }

    #[test]
    fn test_docstring_escapes_quotes() {
        let doc = render_docstring("say \"\"\"hi\"\"\"", &[], "    ");
        assert_eq!(doc, "    \"\"\"say \\\"\\\"\\\"hi\\\"\\\"\\\" \"\"\"\n");
    }

    #[test]
    fn test_empty_source_becomes_callable() {
        let normalized = normalize("# nothing here\n", &analysis(&[]), "Nothing.");
        assert_eq!(normalized.entry_point_name, "solution");
        assert!(normalized
            .source_text
            .contains("def solution():\n    \"\"\"Nothing.\"\"\"\n    # nothing here\n    return None\n"));
    }

    #[test]
    fn test_wrapping_leaves_multiline_string_contents_alone() {
        let source = "text = \"\"\"first\n  second\n\nthird\"\"\"\nprint(text.upper())\n";
        let normalized = normalize(source, &analysis(&[]), "Shout.");
        assert!(normalized.source_text.contains(
            "    text = \"\"\"first\n  second\n\nthird\"\"\"\n    _result = (text.upper())\n"
        ));
    }

    #[test]
    fn test_multiline_print_argument_keeps_its_string() {
        let source = "print(\"\"\"a\nb\"\"\")\n";
        let normalized = normalize(source, &analysis(&[]), "Echo.");
        assert!(normalized.source_text.contains(
            "    _result = (\"\"\"a\nb\"\"\")\n    print(_result)\n    return _result\n"
        ));
    }
}
