//! Source extraction from free-form model responses.
//!
//! Strategies run in order until one yields code: Python-tagged fences,
//! untagged fences, then the longest run of lines that look like Python.

use crate::errors::PipelineError;

const PYTHON_TAGS: &[&str] = &["python", "python3", "py"];

const STATEMENT_STARTS: &[&str] = &[
    "def ", "async def ", "class ", "import ", "from ", "return", "for ", "while ", "if ",
    "elif ", "else:", "try:", "except", "finally:", "with ", "print(", "@", "raise ", "assert ",
    "yield", "pass", "break", "continue", "global ", "lambda",
];

#[derive(Debug, Clone)]
struct Fence {
    tag: String,
    body: String,
}

/// Returns the code block found in `response`.
pub fn extract_code(response: &str) -> Result<String, PipelineError> {
    let fences = fences(response);

    let tagged: Vec<&Fence> = fences
        .iter()
        .filter(|f| PYTHON_TAGS.contains(&f.tag.as_str()))
        .collect();
    if let Some(code) = pick(&tagged) {
        log::debug!("Extracted code from a python fence");
        return Ok(code);
    }

    let untagged: Vec<&Fence> = fences.iter().filter(|f| f.tag.is_empty()).collect();
    if let Some(code) = pick(&untagged) {
        log::debug!("Extracted code from an untagged fence");
        return Ok(code);
    }

    if let Some(code) = code_region(response) {
        log::debug!("Extracted code heuristically from unfenced text");
        return Ok(code);
    }

    log::warn!("No code found in model response ({} bytes)", response.len());
    Err(PipelineError::ExtractionFailed)
}

/// Prefers the first block defining a function, then the longest one.
fn pick(candidates: &[&Fence]) -> Option<String> {
    let non_empty: Vec<&&Fence> = candidates
        .iter()
        .filter(|f| !f.body.trim().is_empty())
        .collect();
    non_empty
        .iter()
        .find(|f| f.body.lines().any(|l| l.trim_start().starts_with("def ")))
        .or_else(|| non_empty.iter().max_by_key(|f| f.body.len()))
        .map(|f| f.body.trim_matches('\n').to_string())
}

/// Splits fenced blocks out of markdown. A fence left open at the end of a
/// truncated response still counts.
fn fences(text: &str) -> Vec<Fence> {
    let mut fences = Vec::new();
    let mut current: Option<(String, Vec<&str>)> = None;
    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(rest) = trimmed.strip_prefix("```") {
            match current.take() {
                Some((tag, lines)) => fences.push(Fence {
                    tag,
                    body: lines.join("\n"),
                }),
                None => {
                    let tag = rest.trim().to_lowercase();
                    current = Some((tag, Vec::new()));
                }
            }
            continue;
        }
        if let Some((_, lines)) = current.as_mut() {
            lines.push(line);
        }
    }
    if let Some((tag, lines)) = current {
        fences.push(Fence {
            tag,
            body: lines.join("\n"),
        });
    }
    fences
}

fn looks_like_code(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return false;
    }
    if trimmed.starts_with('#') {
        return true;
    }
    if STATEMENT_STARTS.iter().any(|s| trimmed.starts_with(s)) {
        return true;
    }
    is_assignment(trimmed) || is_call(trimmed)
}

fn is_assignment(line: &str) -> bool {
    let Some(eq) = line.find('=') else {
        return false;
    };
    let target = line[..eq].trim_end_matches(['+', '-', '*', '/', '%']).trim();
    let after = &line[eq + 1..];
    !target.is_empty()
        && !after.starts_with('=')
        && target
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | ',' | ' ' | '.' | '[' | ']' | '\'' | '"'))
        && target.split(',').all(|t| !t.trim().contains(' '))
}

fn is_call(line: &str) -> bool {
    let Some(open) = line.find('(') else {
        return false;
    };
    let callee = &line[..open];
    !callee.is_empty()
        && callee.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
        && line.ends_with(')')
}

/// Longest run of code-looking lines; indented lines and blank lines inside
/// a run continue it. Runs without a definition, import or assignment are
/// treated as prose.
fn code_region(text: &str) -> Option<String> {
    let lines: Vec<&str> = text.lines().collect();
    let mut best: Option<(usize, usize)> = None;
    let mut i = 0;
    while i < lines.len() {
        if !looks_like_code(lines[i]) || lines[i].starts_with(char::is_whitespace) {
            i += 1;
            continue;
        }
        let start = i;
        let mut end = i + 1;
        while end < lines.len() {
            let line = lines[end];
            let continues = if line.trim().is_empty() {
                lines[end + 1..]
                    .iter()
                    .find(|l| !l.trim().is_empty())
                    .is_some_and(|l| looks_like_code(l) || l.starts_with(char::is_whitespace))
            } else {
                line.starts_with(char::is_whitespace) || looks_like_code(line)
            };
            if !continues {
                break;
            }
            end += 1;
        }
        let strong = lines[start..end].iter().any(|l| {
            let t = l.trim_start();
            t.starts_with("def ") || t.starts_with("import ") || t.starts_with("from ")
                || t.starts_with("return") || is_assignment(t.trim())
        });
        let size = end - start;
        if strong && best.map_or(true, |(s, e)| e - s < size) {
            best = Some((start, end));
        }
        i = end;
    }
    best.map(|(start, end)| lines[start..end].join("\n").trim_end().to_string())
}
