//! Mustache-style template rendering for config and settings files
//!
//! Supports the subset of mustache the config files use:
//!
//! - `{{path.to.value}}`, `{{{path}}}` and `{{& path}}` (all unescaped)
//! - sections `{{#name}}...{{/name}}` and inverted sections `{{^name}}...{{/name}}`
//! - comments `{{! ... }}`
//!
//! Partials, blocks and delimiter changes are rejected with a template error.

use crate::error::{Result, RunnerError};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Variable(String),
    Section {
        name: String,
        inverted: bool,
        children: Vec<Token>,
    },
}

/// A parsed template
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    tokens: Vec<Token>,
}

impl Template {
    /// Parse template source
    pub fn parse(source: &str) -> Result<Self> {
        let mut stack: Vec<(String, bool, Vec<Token>)> = Vec::new();
        let mut current: Vec<Token> = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                current.push(Token::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];

            let (tag, consumed) = if let Some(inner) = after.strip_prefix('{') {
                let end = inner
                    .find("}}}")
                    .ok_or_else(|| unclosed(source, rest, start))?;
                (format!("&{}", &inner[..end]), end + 4)
            } else {
                let end = after
                    .find("}}")
                    .ok_or_else(|| unclosed(source, rest, start))?;
                (after[..end].to_string(), end + 2)
            };
            rest = &after[consumed..];

            let tag = tag.trim();
            let (sigil, name) = match tag.chars().next() {
                Some(c @ ('#' | '^' | '/' | '!' | '&' | '>' | '=' | '$' | '<')) => (Some(c), tag[1..].trim()),
                _ => (None, tag),
            };

            match sigil {
                Some('!') => {}
                Some('>') => {
                    return Err(RunnerError::template(format!(
                        "partials are not supported: {{{{>{}}}}}",
                        name
                    )));
                }
                Some('=') => {
                    return Err(RunnerError::template(format!(
                        "delimiter changes are not supported: {{{{{}}}}}",
                        tag
                    )));
                }
                Some(c @ ('$' | '<')) => {
                    return Err(RunnerError::template(format!(
                        "blocks and parents are not supported: {{{{{}{}}}}}",
                        c, name
                    )));
                }
                Some('#') | Some('^') => {
                    check_name(name)?;
                    stack.push((name.to_string(), sigil == Some('^'), std::mem::take(&mut current)));
                }
                Some('/') => {
                    let (open, inverted, parent) = stack.pop().ok_or_else(|| {
                        RunnerError::template(format!("unopened section {{{{/{}}}}}", name))
                    })?;
                    if open != name {
                        return Err(RunnerError::template(format!(
                            "section {{{{#{}}}}} closed by {{{{/{}}}}}",
                            open, name
                        )));
                    }
                    let children = std::mem::replace(&mut current, parent);
                    current.push(Token::Section {
                        name: open,
                        inverted,
                        children,
                    });
                }
                _ => {
                    check_name(name)?;
                    current.push(Token::Variable(name.to_string()));
                }
            }
        }

        if !rest.is_empty() {
            current.push(Token::Text(rest.to_string()));
        }

        if let Some((open, _, _)) = stack.pop() {
            return Err(RunnerError::template(format!("unclosed section {{{{#{}}}}}", open)));
        }

        Ok(Self { tokens: current })
    }

    /// Variable references outside of sections, in document order.
    ///
    /// References inside sections resolve relative to the section value and
    /// are not reported.
    pub fn variables(&self) -> Vec<&str> {
        self.tokens
            .iter()
            .filter_map(|t| match t {
                Token::Variable(name) => Some(name.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Top-level variable references that resolve to nothing (or null) in `values`
    pub fn missing_variables(&self, values: &Value) -> Vec<String> {
        let mut missing: Vec<String> = Vec::new();
        for name in self.variables() {
            let resolved = lookup(values, name).is_some_and(|v| !v.is_null());
            if !resolved && !missing.iter().any(|m| m == name) {
                missing.push(name.to_string());
            }
        }
        missing
    }

    /// Render against `values`. Unresolved references render as empty text.
    pub fn render(&self, values: &Value) -> String {
        let mut out = String::new();
        let mut contexts = vec![values];
        render_tokens(&self.tokens, &mut contexts, &mut out);
        out
    }
}

fn unclosed(source: &str, rest: &str, start: usize) -> RunnerError {
    let offset = source.len() - rest.len() + start;
    let line = source[..offset].matches('\n').count() + 1;
    RunnerError::template(format!("unclosed tag on line {}", line))
}

fn check_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(RunnerError::template("empty tag"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(RunnerError::template(format!("invalid tag name {:?}", name)));
    }
    Ok(())
}

/// Resolve a dotted path (`Values.deploy.bucket`) in `values`.
///
/// `.` resolves to `values` itself. Numeric segments index into arrays.
pub fn lookup<'a>(values: &'a Value, path: &str) -> Option<&'a Value> {
    if path == "." {
        return Some(values);
    }
    path.split('.').try_fold(values, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn lookup_in_stack<'a>(contexts: &[&'a Value], path: &str) -> Option<&'a Value> {
    if path == "." {
        return contexts.last().copied();
    }
    let head = path.split('.').next().unwrap_or(path);
    contexts
        .iter()
        .rev()
        .find(|ctx| ctx.get(head).is_some())
        .copied()
        .and_then(|ctx| lookup(ctx, path))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Number(n) => n.as_f64() != Some(0.0),
        Value::Object(_) => true,
    }
}

fn render_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

fn render_tokens<'a>(tokens: &[Token], contexts: &mut Vec<&'a Value>, out: &mut String) {
    for token in tokens {
        match token {
            Token::Text(text) => out.push_str(text),
            Token::Variable(name) => {
                if let Some(value) = lookup_in_stack(contexts, name) {
                    render_value(value, out);
                }
            }
            Token::Section {
                name,
                inverted,
                children,
            } => {
                let value = lookup_in_stack(contexts, name);
                let truthy = value.is_some_and(is_truthy);

                if *inverted {
                    if !truthy {
                        render_tokens(children, contexts, out);
                    }
                    continue;
                }

                match value {
                    Some(Value::Array(items)) => {
                        for item in items {
                            contexts.push(item);
                            render_tokens(children, contexts, out);
                            contexts.pop();
                        }
                    }
                    Some(v) if truthy => {
                        contexts.push(v);
                        render_tokens(children, contexts, out);
                        contexts.pop();
                    }
                    _ => {}
                }
            }
        }
    }
}
