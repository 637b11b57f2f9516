//! Source-level optimizer: idempotent text transforms applied before
//! compilation.
//!
//! The pipeline order is fixed and each stage runs only when enabled:
//! 1. strip comments (`--` line and `--[[ ]]` block, any bracket level)
//! 2. reduce whitespace (collapse runs, drop blank lines)
//! 3. fold constants (integer `+ - *` on literal operands, literal string
//!    concatenation)
//! 4. eliminate dead branches (`if false then ... end`,
//!    `while false do ... end` — literal `false` only, no `else` attached)
//! 5. fixed pattern rewrites (literal comparisons and `not true`/`not false`
//!    to their boolean results)
//!
//! Every transform is conservative: string literals and long brackets are
//! opaque, folding never crosses a variable, precedence is respected by
//! refusing to fold next to a tighter-binding operator, and dead-code removal
//! gives up on anything but the exact literal forms. Semantics of
//! side-effecting code are never altered. Running the optimizer twice with
//! the same config yields the same output as running it once.
//!
//! The optimizer also reports which transforms fired and a couple of cheap
//! static-analysis warnings (unused locals, unreachable code after `return`);
//! those land in the chunk cache metadata.

use std::time::{Duration, Instant};

use crate::config::OptimizerConfig;

/// What a single optimize run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizeReport {
    /// Names of transforms that changed the source, in pipeline order.
    pub fired: Vec<&'static str>,
    /// Static-analysis notes; informational only.
    pub warnings: Vec<String>,
    pub original_len: usize,
    pub optimized_len: usize,
    pub duration: Duration,
}

/// Applies the configured transform pipeline to script source.
#[derive(Debug, Clone)]
pub struct SourceOptimizer {
    config: OptimizerConfig,
}

impl SourceOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    /// Runs the pipeline and reports what happened.
    pub fn optimize(&self, source: &str) -> (String, OptimizeReport) {
        let start = Instant::now();
        let mut report = OptimizeReport {
            original_len: source.len(),
            ..Default::default()
        };

        let mut current = source.to_string();

        if self.config.strip_comments {
            let next = strip_comments(&current);
            if next != current {
                report.fired.push("strip_comments");
                current = next;
            }
        }
        if self.config.reduce_whitespace {
            let next = reduce_whitespace(&current);
            if next != current {
                report.fired.push("reduce_whitespace");
                current = next;
            }
        }
        if self.config.fold_constants {
            let next = fold_constants(&current);
            if next != current {
                report.fired.push("fold_constants");
                current = next;
            }
        }
        if self.config.eliminate_dead_code {
            let next = eliminate_dead_code(&current);
            if next != current {
                report.fired.push("eliminate_dead_code");
                current = next;
            }
        }
        if self.config.pattern_opt {
            let next = pattern_rewrites(&current);
            if next != current {
                report.fired.push("pattern_opt");
                // Pattern rewrites can expose new dead branches
                // (`if 1 == 2 then` becomes `if false then`); one more
                // elimination pass keeps the output a fixpoint.
                if self.config.eliminate_dead_code {
                    current = eliminate_dead_code(&next);
                } else {
                    current = next;
                }
            }
        }

        report.warnings = analyze(&current);
        report.optimized_len = current.len();
        report.duration = start.elapsed();
        (current, report)
    }
}

// ── Lexical scanning ──────────────────────────────────────────────────────────

/// Byte classification used by every transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteClass {
    Code,
    Str,
    Comment,
}

/// Classifies every byte of `src` as code, string-literal, or comment.
/// Handles short strings with escapes and long brackets of any level, for
/// both strings and comments.
fn classify(src: &[u8]) -> Vec<ByteClass> {
    let mut classes = vec![ByteClass::Code; src.len()];
    let mut i = 0;

    while i < src.len() {
        let b = src[i];
        match b {
            b'\'' | b'"' => {
                // Short string: scan to the matching quote, honoring escapes.
                classes[i] = ByteClass::Str;
                let quote = b;
                i += 1;
                while i < src.len() {
                    classes[i] = ByteClass::Str;
                    if src[i] == b'\\' && i + 1 < src.len() {
                        classes[i + 1] = ByteClass::Str;
                        i += 2;
                        continue;
                    }
                    if src[i] == quote || src[i] == b'\n' {
                        // Unterminated-on-newline is a syntax error downstream;
                        // stop scanning either way.
                        i += 1;
                        break;
                    }
                    i += 1;
                }
            }
            b'[' => {
                if let Some(level) = long_bracket_open(src, i) {
                    let end = long_bracket_close(src, i, level);
                    for class in classes.iter_mut().take(end).skip(i) {
                        *class = ByteClass::Str;
                    }
                    i = end;
                } else {
                    i += 1;
                }
            }
            b'-' if i + 1 < src.len() && src[i + 1] == b'-' => {
                // Comment: block form if a long bracket follows, else to EOL.
                if let Some(level) = long_bracket_open(src, i + 2) {
                    let end = long_bracket_close(src, i + 2, level);
                    for class in classes.iter_mut().take(end).skip(i) {
                        *class = ByteClass::Comment;
                    }
                    i = end;
                } else {
                    while i < src.len() && src[i] != b'\n' {
                        classes[i] = ByteClass::Comment;
                        i += 1;
                    }
                }
            }
            _ => i += 1,
        }
    }
    classes
}

/// If a long bracket `[`, `[=`, `[==`, ... opens at `i`, returns its level.
fn long_bracket_open(src: &[u8], i: usize) -> Option<usize> {
    if i >= src.len() || src[i] != b'[' {
        return None;
    }
    let mut j = i + 1;
    while j < src.len() && src[j] == b'=' {
        j += 1;
    }
    if j < src.len() && src[j] == b'[' {
        Some(j - i - 1)
    } else {
        None
    }
}

/// Index one past the closing bracket of the long bracket opened at `i`, or
/// the end of input when unterminated.
fn long_bracket_close(src: &[u8], i: usize, level: usize) -> usize {
    let mut j = i + level + 2;
    while j < src.len() {
        if src[j] == b']' {
            let mut k = j + 1;
            let mut eqs = 0;
            while k < src.len() && src[k] == b'=' {
                eqs += 1;
                k += 1;
            }
            if eqs == level && k < src.len() && src[k] == b']' {
                return k + 1;
            }
        }
        j += 1;
    }
    src.len()
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

// ── Stage 1: strip comments ───────────────────────────────────────────────────

fn strip_comments(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let mut out = Vec::with_capacity(src.len());
    for (i, b) in src.iter().enumerate() {
        if classes[i] != ByteClass::Comment {
            out.push(*b);
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Stage 2: reduce whitespace ────────────────────────────────────────────────

fn reduce_whitespace(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);

    // Collapse runs of spaces/tabs in code regions to one space.
    let mut collapsed: Vec<u8> = Vec::with_capacity(src.len());
    let mut collapsed_class: Vec<ByteClass> = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        if classes[i] == ByteClass::Code && (src[i] == b' ' || src[i] == b'\t') {
            let mut j = i;
            while j < src.len()
                && classes[j] == ByteClass::Code
                && (src[j] == b' ' || src[j] == b'\t')
            {
                j += 1;
            }
            collapsed.push(b' ');
            collapsed_class.push(ByteClass::Code);
            i = j;
        } else {
            collapsed.push(src[i]);
            collapsed_class.push(classes[i]);
            i += 1;
        }
    }

    // Drop trailing spaces before newlines and collapse blank lines, again
    // only in code regions.
    let mut out: Vec<u8> = Vec::with_capacity(collapsed.len());
    for (i, b) in collapsed.iter().enumerate() {
        let in_code = collapsed_class[i] == ByteClass::Code;
        if in_code
            && *b == b' '
            && (i + 1 == collapsed.len()
                || (collapsed[i + 1] == b'\n' && collapsed_class[i + 1] == ByteClass::Code))
        {
            continue;
        }
        if in_code && *b == b'\n' {
            // Skip a newline when the output already ends in one (blank line)
            // or is empty (leading blank lines).
            if matches!(out.last(), None | Some(b'\n')) {
                continue;
            }
        }
        out.push(*b);
    }
    // A single trailing newline is conventional; strip trailing blank space.
    while matches!(out.last(), Some(b' ') | Some(b'\t')) {
        out.pop();
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ── Stage 3: constant folding ─────────────────────────────────────────────────

/// Operators whose presence adjacent to a candidate fold means a
/// tighter-binding expression might claim an operand.
const TIGHTER_THAN_ADD: &[u8] = &[b'*', b'/', b'%', b'^'];
const TIGHTER_THAN_MUL: &[u8] = &[b'/', b'%', b'^'];

fn fold_constants(source: &str) -> String {
    let mut current = source.to_string();
    // Iterate to a fixpoint so chains like `1 + 2 + 3` and `"a" .. "b" .. "c"`
    // fold completely; each round does one round of left-to-right folds.
    loop {
        let after_mul = fold_int_ops(&current, &[b'*'], TIGHTER_THAN_MUL);
        let after_add = fold_int_ops(&after_mul, &[b'+', b'-'], TIGHTER_THAN_ADD);
        let after_concat = fold_string_concat(&after_add);
        if after_concat == current {
            return current;
        }
        current = after_concat;
    }
}

/// Scans for `<int> <op> <int>` in code regions and folds when no
/// tighter-binding operator can claim either operand.
fn fold_int_ops(source: &str, ops: &[u8], tighter: &[u8]) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut i = 0;

    'outer: while i < src.len() {
        if classes[i] == ByteClass::Code && src[i].is_ascii_digit() {
            // Candidate left operand: maximal digit run.
            let left_start = i;
            let mut j = i;
            while j < src.len() && classes[j] == ByteClass::Code && src[j].is_ascii_digit() {
                j += 1;
            }
            let left_end = j;

            // The literal must not be part of an identifier, float, hex, or
            // exponent form.
            let mut code_back = out.iter().rev().filter(|b| **b != b' ' && **b != b'\t');
            let prev_code = code_back.next();
            let prev_code2 = code_back.next();
            let boundary_before = match out.last() {
                None => true,
                Some(b) => !is_ident_byte(*b) && *b != b'.',
            };
            // A minus right before the literal is unary when it follows `^`
            // (`2 ^ -2 * 3` groups as `(2^-2) * 3`); refuse to fold there.
            let unary_after_caret =
                prev_code == Some(&b'-') && prev_code2 == Some(&b'^');
            let precedence_ok_before = !unary_after_caret
                && match prev_code {
                    None => true,
                    Some(b) => !tighter.contains(b) && !ops.contains(b) && *b != b'.',
                };

            // Skip spaces, expect an op byte.
            let mut k = left_end;
            while k < src.len() && classes[k] == ByteClass::Code && src[k] == b' ' {
                k += 1;
            }
            if k >= src.len() || classes[k] != ByteClass::Code || !ops.contains(&src[k]) {
                out.push(src[i]);
                i += 1;
                continue;
            }
            let op = src[k];
            // `--` is a comment, `..` a concat; a doubled op byte is never a
            // binary integer op.
            if k + 1 < src.len() && src[k + 1] == op {
                out.push(src[i]);
                i += 1;
                continue;
            }
            let mut m = k + 1;
            while m < src.len() && classes[m] == ByteClass::Code && src[m] == b' ' {
                m += 1;
            }
            // Right operand: digit run.
            let right_start = m;
            while m < src.len() && classes[m] == ByteClass::Code && src[m].is_ascii_digit() {
                m += 1;
            }
            if m == right_start {
                out.push(src[i]);
                i += 1;
                continue;
            }
            let right_end = m;

            // Boundary after: not ident/float/call-adjacent, and no
            // tighter-binding operator waiting to claim the right operand.
            let mut n = right_end;
            while n < src.len() && classes[n] == ByteClass::Code && src[n] == b' ' {
                n += 1;
            }
            let boundary_after = match src.get(right_end) {
                None => true,
                Some(b) => !is_ident_byte(*b) && *b != b'.',
            };
            let precedence_ok_after = match src.get(n) {
                None => true,
                Some(b) => !tighter.contains(b) || classes.get(n) != Some(&ByteClass::Code),
            };

            if boundary_before && precedence_ok_before && boundary_after && precedence_ok_after {
                let left: i64 = match source[left_start..left_end].parse() {
                    Ok(v) => v,
                    Err(_) => {
                        out.push(src[i]);
                        i += 1;
                        continue 'outer;
                    }
                };
                let right: i64 = match source[right_start..right_end].parse() {
                    Ok(v) => v,
                    Err(_) => {
                        out.push(src[i]);
                        i += 1;
                        continue 'outer;
                    }
                };
                let folded = match op {
                    b'+' => left.checked_add(right),
                    b'-' => left.checked_sub(right),
                    b'*' => left.checked_mul(right),
                    _ => None,
                };
                if let Some(value) = folded {
                    out.extend_from_slice(value.to_string().as_bytes());
                    i = right_end;
                    continue;
                }
            }
            // No fold: emit the left literal and move on.
            out.extend_from_slice(&src[left_start..left_end]);
            i = left_end;
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Folds `"lit" .. "lit"` when both literals use the same quote and contain
/// no escapes. Never folds next to another `.` (varargs, method chains).
fn fold_string_concat(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        if classes[i] == ByteClass::Str && (src[i] == b'"' || src[i] == b'\'') {
            let quote = src[i];
            if let Some(left_end) = simple_literal_end(src, &classes, i, quote) {
                // Skip code spaces, expect `..` (exactly two dots).
                let mut k = left_end;
                while k < src.len() && classes[k] == ByteClass::Code && src[k] == b' ' {
                    k += 1;
                }
                let has_concat = k + 1 < src.len()
                    && src[k] == b'.'
                    && src[k + 1] == b'.'
                    && src.get(k + 2) != Some(&b'.');
                if has_concat {
                    let mut m = k + 2;
                    while m < src.len() && classes[m] == ByteClass::Code && src[m] == b' ' {
                        m += 1;
                    }
                    if m < src.len() && src[m] == quote {
                        if let Some(right_end) = simple_literal_end(src, &classes, m, quote) {
                            out.push(quote);
                            out.extend_from_slice(&src[i + 1..left_end - 1]);
                            out.extend_from_slice(&src[m + 1..right_end - 1]);
                            out.push(quote);
                            i = right_end;
                            continue;
                        }
                    }
                }
            }
        }
        out.push(src[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// If the string literal starting at `i` (a quote byte) is escape-free and
/// single-line, returns the index one past its closing quote.
fn simple_literal_end(src: &[u8], classes: &[ByteClass], i: usize, quote: u8) -> Option<usize> {
    let mut j = i + 1;
    while j < src.len() && classes[j] == ByteClass::Str {
        match src[j] {
            b'\\' | b'\n' => return None,
            b if b == quote => return Some(j + 1),
            _ => j += 1,
        }
    }
    None
}

// ── Stage 4: dead-branch elimination ─────────────────────────────────────────

/// Word tokens that open an `end`-terminated block.
fn opens_block(word: &str) -> bool {
    matches!(word, "if" | "function" | "do")
}

fn eliminate_dead_code(source: &str) -> String {
    let mut current = source.to_string();
    loop {
        let next = eliminate_dead_code_once(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn eliminate_dead_code_once(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let words = code_words(src, &classes);

    for (w, (start, _)) in words.iter().enumerate() {
        let word = word_at(source, &words[w]);
        let dead_if = word == "if"
            && matches!(words.get(w + 1).map(|r| word_at(source, r)), Some("false"))
            && matches!(words.get(w + 2).map(|r| word_at(source, r)), Some("then"));
        let dead_while = word == "while"
            && matches!(words.get(w + 1).map(|r| word_at(source, r)), Some("false"))
            && matches!(words.get(w + 2).map(|r| word_at(source, r)), Some("do"));
        if !dead_if && !dead_while {
            continue;
        }

        // Walk forward from the block keyword, tracking nesting. An `else` or
        // `elseif` at depth 1 of a dead `if` means a live branch exists;
        // leave the statement alone.
        let mut depth = 1;
        let mut has_live_branch = false;
        let mut close_end: Option<usize> = None;
        for entry in &words[w + 3..] {
            // `while` itself opens nothing; its `do` is what nests.
            let token = word_at(source, entry);
            if opens_block(token) {
                depth += 1;
            } else if token == "end" {
                depth -= 1;
                if depth == 0 {
                    close_end = Some(entry.1);
                    break;
                }
            } else if dead_if && depth == 1 && (token == "else" || token == "elseif") {
                has_live_branch = true;
                break;
            }
        }

        if has_live_branch {
            continue;
        }
        if let Some(end) = close_end {
            let mut out = String::with_capacity(source.len());
            out.push_str(&source[..*start]);
            out.push_str(&source[end..]);
            return out;
        }
    }
    source.to_string()
}

/// `(start, end)` byte ranges of identifier-ish words in code regions.
fn code_words(src: &[u8], classes: &[ByteClass]) -> Vec<(usize, usize)> {
    let mut words = Vec::new();
    let mut i = 0;
    while i < src.len() {
        if classes[i] == ByteClass::Code && (src[i].is_ascii_alphabetic() || src[i] == b'_') {
            let start = i;
            while i < src.len() && classes[i] == ByteClass::Code && is_ident_byte(src[i]) {
                i += 1;
            }
            words.push((start, i));
        } else {
            i += 1;
        }
    }
    words
}

fn word_at<'s>(source: &'s str, range: &(usize, usize)) -> &'s str {
    &source[range.0..range.1]
}

// ── Stage 5: pattern rewrites ─────────────────────────────────────────────────

/// Fixed list of semantics-preserving literal rewrites:
/// `<int> == <int>`, `<int> ~= <int>` → `true`/`false`, and
/// `not true` / `not false` → their boolean results.
fn pattern_rewrites(source: &str) -> String {
    let mut current = rewrite_literal_comparisons(source);
    loop {
        let next = rewrite_not_literals(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn rewrite_literal_comparisons(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let mut out: Vec<u8> = Vec::with_capacity(src.len());
    let mut i = 0;

    while i < src.len() {
        if classes[i] == ByteClass::Code && src[i].is_ascii_digit() {
            let left_start = i;
            let mut j = i;
            while j < src.len() && classes[j] == ByteClass::Code && src[j].is_ascii_digit() {
                j += 1;
            }
            let left_end = j;
            let boundary_before = match out.last() {
                None => true,
                Some(b) => !is_ident_byte(*b) && *b != b'.',
            };

            let mut k = left_end;
            while k < src.len() && classes[k] == ByteClass::Code && src[k] == b' ' {
                k += 1;
            }
            // `==` or `~=`.
            let negated = match (src.get(k), src.get(k + 1)) {
                (Some(b'='), Some(b'=')) => Some(false),
                (Some(b'~'), Some(b'=')) => Some(true),
                _ => None,
            };
            if let Some(negated) = negated {
                let mut m = k + 2;
                while m < src.len() && classes[m] == ByteClass::Code && src[m] == b' ' {
                    m += 1;
                }
                let right_start = m;
                while m < src.len() && classes[m] == ByteClass::Code && src[m].is_ascii_digit() {
                    m += 1;
                }
                let right_end = m;
                let boundary_after = match src.get(right_end) {
                    None => true,
                    Some(b) => !is_ident_byte(*b) && *b != b'.',
                };
                if right_end > right_start && boundary_before && boundary_after {
                    let left: Option<i64> = source[left_start..left_end].parse().ok();
                    let right: Option<i64> = source[right_start..right_end].parse().ok();
                    if let (Some(l), Some(r)) = (left, right) {
                        let result = (l == r) != negated;
                        out.extend_from_slice(if result { b"true" } else { b"false" });
                        i = right_end;
                        continue;
                    }
                }
            }
            out.extend_from_slice(&src[left_start..left_end]);
            i = left_end;
        } else {
            out.push(src[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn rewrite_not_literals(source: &str) -> String {
    let src = source.as_bytes();
    let classes = classify(src);
    let words = code_words(src, &classes);

    for w in 0..words.len().saturating_sub(1) {
        if word_at(source, &words[w]) != "not" {
            continue;
        }
        let operand = word_at(source, &words[w + 1]);
        let replacement = match operand {
            "true" => "false",
            "false" => "true",
            _ => continue,
        };
        // Only rewrite when nothing but spaces separates the two words.
        let between = &source[words[w].1..words[w + 1].0];
        if !between.chars().all(|c| c == ' ') {
            continue;
        }
        let mut out = String::with_capacity(source.len());
        out.push_str(&source[..words[w].0]);
        out.push_str(replacement);
        out.push_str(&source[words[w + 1].1..]);
        return rewrite_not_literals(&out);
    }
    source.to_string()
}

// ── Static analysis warnings ──────────────────────────────────────────────────

fn analyze(source: &str) -> Vec<String> {
    let mut warnings = Vec::new();
    let src = source.as_bytes();
    let classes = classify(src);
    let words = code_words(src, &classes);

    // Unused locals: `local <name>` where the name never recurs.
    for w in 0..words.len().saturating_sub(1) {
        if word_at(source, &words[w]) != "local" {
            continue;
        }
        let name = word_at(source, &words[w + 1]);
        if name == "function" {
            continue;
        }
        let uses = words
            .iter()
            .filter(|r| word_at(source, r) == name)
            .count();
        if uses == 1 {
            warnings.push(format!("unused local '{name}'"));
        }
    }

    // Unreachable code after a top-of-line `return` that is not the last
    // statement of its block.
    let mut lines = source.lines().peekable();
    while let Some(line) = lines.next() {
        let trimmed = line.trim_start();
        if trimmed == "return" || trimmed.starts_with("return ") {
            if let Some(next) = lines.peek() {
                let follow = next.trim_start();
                let closes_block = follow.is_empty()
                    || follow.starts_with("end")
                    || follow.starts_with("else")
                    || follow.starts_with("elseif")
                    || follow.starts_with("until");
                if !closes_block {
                    warnings.push("unreachable code after return".to_string());
                }
            }
        }
    }

    warnings
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn optimizer() -> SourceOptimizer {
        SourceOptimizer::new(OptimizerConfig::default())
    }

    fn run(src: &str) -> String {
        optimizer().optimize(src).0
    }

    // ── strip_comments ────────────────────────────────────────────────────────

    #[test]
    fn test_strip_line_comment() {
        assert_eq!(strip_comments("x = 1 -- note\ny = 2"), "x = 1 \ny = 2");
    }

    #[test]
    fn test_strip_block_comment() {
        assert_eq!(strip_comments("x = 1 --[[ gone ]] + 2"), "x = 1  + 2");
    }

    #[test]
    fn test_strip_leveled_block_comment() {
        assert_eq!(
            strip_comments("a = 1 --[==[ has ]] inside ]==] b = 2"),
            "a = 1  b = 2"
        );
    }

    #[test]
    fn test_comment_marker_inside_string_kept() {
        let src = "s = 'not -- a comment'";
        assert_eq!(strip_comments(src), src);
    }

    #[test]
    fn test_long_string_not_a_comment() {
        let src = "s = [[ -- still data ]]";
        assert_eq!(strip_comments(src), src);
    }

    // ── reduce_whitespace ─────────────────────────────────────────────────────

    #[test]
    fn test_collapse_space_runs() {
        assert_eq!(reduce_whitespace("x   =    1"), "x = 1");
    }

    #[test]
    fn test_drop_blank_lines_and_trailing_spaces() {
        assert_eq!(reduce_whitespace("x = 1   \n\n\ny = 2"), "x = 1\ny = 2");
    }

    #[test]
    fn test_string_whitespace_preserved() {
        let src = "s = 'a    b'";
        assert_eq!(reduce_whitespace(src), src);
    }

    #[test]
    fn test_long_string_newlines_preserved() {
        let src = "s = [[line1\n\n\nline2]]";
        assert_eq!(reduce_whitespace(src), src);
    }

    // ── fold_constants ────────────────────────────────────────────────────────

    #[test]
    fn test_fold_addition() {
        assert_eq!(fold_constants("return 2 + 3"), "return 5");
    }

    #[test]
    fn test_fold_chain() {
        assert_eq!(fold_constants("return 1 + 2 + 3"), "return 6");
    }

    #[test]
    fn test_fold_respects_precedence() {
        // 2 + 3 * 4 must fold to 14, never (2+3)*4.
        assert_eq!(fold_constants("return 2 + 3 * 4"), "return 14");
    }

    #[test]
    fn test_no_fold_across_division() {
        // `/` produces floats in this language; it is never folded, and the
        // addition must not steal its operand.
        assert_eq!(fold_constants("return 8 / 2 + 1"), "return 8 / 2 + 1");
    }

    #[test]
    fn test_no_fold_with_variables() {
        assert_eq!(fold_constants("return x + 3"), "return x + 3");
        assert_eq!(fold_constants("return 3 + x"), "return 3 + x");
    }

    #[test]
    fn test_no_fold_floats_or_hex() {
        assert_eq!(fold_constants("return 1.5 + 2"), "return 1.5 + 2");
        assert_eq!(fold_constants("return 0x10 + 2"), "return 0x10 + 2");
    }

    #[test]
    fn test_no_fold_inside_strings() {
        assert_eq!(fold_constants("s = '1 + 2'"), "s = '1 + 2'");
    }

    #[test]
    fn test_fold_subtraction_can_go_negative() {
        assert_eq!(fold_constants("return 1 - 2"), "return -1");
    }

    #[test]
    fn test_no_fold_after_minus_chain() {
        // 10 - 2 + 3 is (10-2)+3 = 11; folding 2+3 first would give 5.
        assert_eq!(fold_constants("return 10 - 2 + 3"), "return 11");
    }

    #[test]
    fn test_fold_string_concat() {
        assert_eq!(fold_string_concat(r#"return "a" .. "b""#), r#"return "ab""#);
    }

    #[test]
    fn test_fold_string_concat_chain() {
        assert_eq!(
            fold_constants(r#"return "a" .. "b" .. "c""#),
            r#"return "abc""#
        );
    }

    #[test]
    fn test_no_fold_mixed_quotes_or_escapes() {
        let mixed = r#"return "a" .. 'b'"#;
        assert_eq!(fold_string_concat(mixed), mixed);
        let escaped = r#"return "a\n" .. "b""#;
        assert_eq!(fold_string_concat(escaped), escaped);
    }

    #[test]
    fn test_no_fold_variable_concat() {
        let src = r#"return x .. "b""#;
        assert_eq!(fold_string_concat(src), src);
    }

    // ── eliminate_dead_code ───────────────────────────────────────────────────

    #[test]
    fn test_eliminate_if_false() {
        assert_eq!(
            eliminate_dead_code("a = 1\nif false then a = 2 end\nreturn a").replace('\n', " "),
            "a = 1  return a"
        );
    }

    #[test]
    fn test_eliminate_while_false() {
        let out = eliminate_dead_code("while false do spin() end\nreturn 1");
        assert!(!out.contains("spin"));
        assert!(out.contains("return 1"));
    }

    #[test]
    fn test_eliminate_nested_blocks() {
        let src = "if false then if x then f() end end\nreturn 2";
        let out = eliminate_dead_code(src);
        assert!(!out.contains('f'), "inner block must go too: {out}");
        assert!(out.contains("return 2"));
    }

    #[test]
    fn test_keep_if_false_with_else() {
        // The else branch is live; the statement must be left alone.
        let src = "if false then a() else b() end";
        assert_eq!(eliminate_dead_code(src), src);
    }

    #[test]
    fn test_keep_if_with_non_literal_condition() {
        let src = "if cond then a() end";
        assert_eq!(eliminate_dead_code(src), src);
    }

    #[test]
    fn test_keyword_in_string_not_a_block() {
        let src = "s = 'if false then'\nif false then a() end\nreturn s";
        let out = eliminate_dead_code(src);
        assert!(out.contains("'if false then'"), "string must survive: {out}");
        assert!(!out.contains("a()"));
    }

    // ── pattern rewrites ──────────────────────────────────────────────────────

    #[test]
    fn test_rewrite_literal_equality() {
        assert_eq!(rewrite_literal_comparisons("return 1 == 1"), "return true");
        assert_eq!(rewrite_literal_comparisons("return 1 == 2"), "return false");
        assert_eq!(rewrite_literal_comparisons("return 1 ~= 2"), "return true");
    }

    #[test]
    fn test_rewrite_not_literals() {
        assert_eq!(rewrite_not_literals("return not true"), "return false");
        assert_eq!(rewrite_not_literals("return not false"), "return true");
        assert_eq!(rewrite_not_literals("return not not true"), "return true");
    }

    #[test]
    fn test_no_rewrite_variable_comparison() {
        assert_eq!(rewrite_literal_comparisons("return x == 1"), "return x == 1");
    }

    #[test]
    fn test_pattern_feeds_dead_code() {
        // `if 1 == 2 then` becomes `if false then`, which the follow-up
        // elimination pass removes entirely.
        let out = run("if 1 == 2 then unreachable() end\nreturn 3");
        assert!(!out.contains("unreachable"), "got: {out}");
    }

    // ── pipeline behavior ─────────────────────────────────────────────────────

    #[test]
    fn test_optimizer_idempotent() {
        let sources = [
            "-- header\nlocal x   = 2 + 3\nif false then x = 9 end\nreturn x .. ''",
            "return \"a\" .. \"b\" .. tostring(1 + 2)",
            "while false do end\nreturn 1 == 1",
            "s = [[raw\n  block]] return s",
        ];
        let opt = optimizer();
        for src in sources {
            let (once, _) = opt.optimize(src);
            let (twice, _) = opt.optimize(&once);
            assert_eq!(once, twice, "not idempotent for {src:?}");
        }
    }

    #[test]
    fn test_report_lists_fired_transforms() {
        let (out, report) = optimizer().optimize("-- c\nreturn  2 + 3");
        assert_eq!(out, "return 5");
        assert!(report.fired.contains(&"strip_comments"));
        assert!(report.fired.contains(&"reduce_whitespace"));
        assert!(report.fired.contains(&"fold_constants"));
        assert_eq!(report.original_len, "-- c\nreturn  2 + 3".len());
        assert_eq!(report.optimized_len, "return 5".len());
    }

    #[test]
    fn test_report_empty_when_nothing_fires() {
        let (out, report) = optimizer().optimize("return x");
        assert_eq!(out, "return x");
        assert!(report.fired.is_empty());
    }

    #[test]
    fn test_disabled_transforms_do_not_run() {
        let opt = SourceOptimizer::new(OptimizerConfig {
            strip_comments: false,
            reduce_whitespace: false,
            fold_constants: false,
            eliminate_dead_code: false,
            pattern_opt: false,
        });
        let src = "-- kept\nreturn  1 + 1";
        let (out, report) = opt.optimize(src);
        assert_eq!(out, src);
        assert!(report.fired.is_empty());
    }

    // ── analysis warnings ─────────────────────────────────────────────────────

    #[test]
    fn test_unused_local_warning() {
        let warnings = analyze("local unused = 1\nreturn 2");
        assert!(warnings.iter().any(|w| w.contains("unused local 'unused'")));
    }

    #[test]
    fn test_used_local_no_warning() {
        let warnings = analyze("local x = 1\nreturn x");
        assert!(warnings.is_empty(), "unexpected: {warnings:?}");
    }

    #[test]
    fn test_unreachable_after_return_warning() {
        let warnings = analyze("return 1\nprint('never')");
        assert!(warnings.iter().any(|w| w.contains("unreachable")));
    }

    #[test]
    fn test_return_at_block_end_no_warning() {
        let warnings = analyze("function f()\n  return 1\nend");
        assert!(warnings.is_empty(), "unexpected: {warnings:?}");
    }
}
