//! Templated output filenames.
//!
//! A filename spec is either a plain path, or a sequence of brace tokens
//! `{key:value}`. The `root` and `template` keys are structural; every
//! other key defines a substitution variable referenced as `{var}` inside
//! the template value. Example:
//!
//! `{root:/data} {template:sub-{p}_run-{r}.xdf} {p:001} {r:baseline}`
//! resolves to `/data/sub-001_run-baseline.xdf`.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::errors::{RecorderError, Result};

pub fn resolve(spec: &str) -> Result<PathBuf> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(RecorderError::BadRequest("no filename specified".into()));
    }
    if !spec.contains('{') {
        return Ok(PathBuf::from(spec));
    }

    let tokens = parse_tokens(spec)?;
    let template = tokens
        .get("template")
        .ok_or_else(|| RecorderError::BadRequest("no template token specified".into()))?;
    let expanded = expand(template, &tokens)?;
    let path = match tokens.get("root") {
        Some(root) => {
            let mut path = PathBuf::from(root);
            path.push(expanded);
            path
        }
        None => PathBuf::from(expanded),
    };
    Ok(path)
}

/// Extracts every top-level `{key:value}` token. Values may themselves
/// contain `{var}` groups, so the scan is nesting-aware; text outside
/// braces is ignored.
fn parse_tokens(spec: &str) -> Result<HashMap<String, String>> {
    let mut tokens = HashMap::new();
    let mut chars = spec.char_indices();
    while let Some((start, ch)) = chars.next() {
        if ch != '{' {
            continue;
        }
        let mut depth = 1;
        let mut end = None;
        for (index, ch) in chars.by_ref() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        end = Some(index);
                        break;
                    }
                }
                _ => {}
            }
        }
        let end = end.ok_or_else(|| {
            RecorderError::BadRequest(format!("unbalanced braces in filename spec {spec:?}"))
        })?;
        let token = &spec[start + 1..end];
        let (key, value) = token.split_once(':').ok_or_else(|| {
            RecorderError::BadRequest(format!("token {{{token}}} is missing a ':' separator"))
        })?;
        if key.is_empty() {
            return Err(RecorderError::BadRequest(format!(
                "token {{{token}}} has an empty key"
            )));
        }
        tokens.insert(key.to_string(), value.to_string());
    }
    if tokens.is_empty() {
        return Err(RecorderError::BadRequest(format!(
            "no {{key:value}} tokens in filename spec {spec:?}"
        )));
    }
    Ok(tokens)
}

/// Replaces `{var}` groups in the template with their token values.
fn expand(template: &str, tokens: &HashMap<String, String>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let close = after.find('}').ok_or_else(|| {
            RecorderError::BadRequest(format!("unbalanced braces in template {template:?}"))
        })?;
        let var = &after[..close];
        let value = tokens.get(var).ok_or_else(|| {
            RecorderError::BadRequest(format!("template references undefined variable {{{var}}}"))
        })?;
        out.push_str(value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    Ok(out)
}
