//! `.env` file parser.
//!
//! Accepts the subset of shell assignment syntax that deployment env files use
//! in practice: `KEY=value`, optional `export`, single/double quotes, trailing
//! comments and `$VAR` / `${VAR}` references.

use std::iter::Peekable;
use std::str::Chars;

/// A syntax error with its 1-based line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: usize,
    pub details: String,
}

type Resolver<'a> = &'a dyn Fn(&str) -> Option<String>;

/// Parse `text` into ordered assignments. A key assigned twice keeps its
/// position and takes the later value.
///
/// References resolve against earlier assignments in the same text first and
/// then `lookup`; unknown names expand to the empty string.
pub fn parse_dotenv<F>(text: &str, lookup: F) -> Result<Vec<(String, String)>, ParseError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut assignments: Vec<(String, String)> = Vec::new();

    for (idx, raw) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").map_or(line, str::trim_start);

        let Some((key, rest)) = line.split_once('=') else {
            return Err(error(line_no, format!("expected KEY=VALUE, got {line:?}")));
        };
        let key = key.trim();
        if !is_valid_key(key) {
            return Err(error(line_no, format!("invalid variable name {key:?}")));
        }

        let value = {
            let resolve = |name: &str| {
                assignments
                    .iter()
                    .rev()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.clone())
                    .or_else(|| lookup(name))
            };
            parse_value(rest, &resolve).map_err(|details| error(line_no, details))?
        };

        match assignments.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => assignments.push((key.to_string(), value)),
        }
    }

    Ok(assignments)
}

/// Whether `key` is a portable environment variable name.
#[must_use]
pub fn is_valid_key(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn error(line: usize, details: String) -> ParseError {
    ParseError { line, details }
}

/// `rest` is everything after `=`, untrimmed: a `#` opens a comment only when
/// whitespace precedes it, including whitespace right after the `=`.
fn parse_value(rest: &str, resolve: Resolver<'_>) -> Result<String, String> {
    let spaced = rest.starts_with(char::is_whitespace);
    let rest = rest.trim_start();
    if let Some(body) = rest.strip_prefix('"') {
        parse_double_quoted(body, resolve)
    } else if let Some(body) = rest.strip_prefix('\'') {
        let Some(end) = body.find('\'') else {
            return Err("unterminated single quote".to_string());
        };
        ensure_only_comment(&body[end + 1..])?;
        Ok(body[..end].to_string())
    } else {
        parse_unquoted(rest, spaced, resolve)
    }
}

fn parse_double_quoted(body: &str, resolve: Resolver<'_>) -> Result<String, String> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    let mut consumed = 0usize;
    let mut closed = false;

    while let Some(c) = chars.next() {
        consumed += c.len_utf8();
        match c {
            '"' => {
                closed = true;
                break;
            }
            '\\' => {
                let Some(next) = chars.next() else {
                    return Err("dangling escape at end of value".to_string());
                };
                consumed += next.len_utf8();
                match next {
                    'n' => out.push('\n'),
                    't' => out.push('\t'),
                    '"' | '\\' | '$' => out.push(next),
                    other => {
                        out.push('\\');
                        out.push(other);
                    }
                }
            }
            '$' => {
                let before = remaining_len(&chars);
                expand_reference(&mut chars, &mut out, resolve)?;
                consumed += before - remaining_len(&chars);
            }
            other => out.push(other),
        }
    }

    if !closed {
        return Err("unterminated double quote".to_string());
    }
    ensure_only_comment(&body[consumed..])?;
    Ok(out)
}

fn remaining_len(chars: &Peekable<Chars<'_>>) -> usize {
    chars.clone().map(char::len_utf8).sum()
}

fn parse_unquoted(rest: &str, spaced: bool, resolve: Resolver<'_>) -> Result<String, String> {
    let mut end = rest.len();
    let mut prev_ws = spaced;
    for (idx, c) in rest.char_indices() {
        if c == '#' && prev_ws {
            end = idx;
            break;
        }
        prev_ws = c.is_whitespace();
    }
    let raw = rest[..end].trim_end();

    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '$' {
            expand_reference(&mut chars, &mut out, resolve)?;
        } else {
            out.push(c);
        }
    }
    Ok(out)
}

/// Called right after a `$` has been consumed.
fn expand_reference(
    chars: &mut Peekable<Chars<'_>>,
    out: &mut String,
    resolve: Resolver<'_>,
) -> Result<(), String> {
    match chars.peek().copied() {
        Some('{') => {
            chars.next();
            let mut name = String::new();
            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(ch) => name.push(ch),
                    None => return Err("unterminated ${ reference".to_string()),
                }
            }
            if !is_valid_key(&name) {
                return Err(format!("invalid variable reference ${{{name}}}"));
            }
            out.push_str(&resolve(&name).unwrap_or_default());
        }
        Some(ch) if ch == '_' || ch.is_ascii_alphabetic() => {
            let mut name = String::new();
            while let Some(&ch) = chars.peek() {
                if ch == '_' || ch.is_ascii_alphanumeric() {
                    name.push(ch);
                    chars.next();
                } else {
                    break;
                }
            }
            out.push_str(&resolve(&name).unwrap_or_default());
        }
        _ => out.push('$'),
    }
    Ok(())
}

fn ensure_only_comment(trailing: &str) -> Result<(), String> {
    let trailing = trailing.trim_start();
    if trailing.is_empty() || trailing.starts_with('#') {
        Ok(())
    } else {
        Err(format!("unexpected text after closing quote: {trailing:?}"))
    }
}
