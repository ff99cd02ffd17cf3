use tracing::warn;

use crate::types::{ExtensionKind, ExtensionModelRef};

/// A prompt with its extension tags pulled out.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedPrompt {
    /// The prompt text with every recognized tag removed.
    pub text: String,
    /// References parsed from the removed tags, strengths already multiplied.
    pub refs: Vec<ExtensionModelRef>,
}

/// Extract `<kind:name:strength[:clip_strength]>` tags from a prompt.
///
/// `multiplier` is applied to both strengths: +1 for the positive prompt,
/// −1 for the negative prompt. Angle-bracket spans that do not parse as an
/// extension tag are left in the text untouched.
pub fn extract_extension_tags(prompt: &str, multiplier: f64) -> ParsedPrompt {
    let mut text = String::with_capacity(prompt.len());
    let mut refs = Vec::new();
    let mut rest = prompt;

    while let Some(open) = rest.find('<') {
        let (before, tail) = rest.split_at(open);
        match tail.find('>') {
            Some(close) => {
                let span = &tail[1..close];
                text.push_str(before);
                match parse_tag(span, multiplier) {
                    Some(r) => refs.push(r),
                    None => {
                        // Not an extension tag (e.g. attention syntax) — keep it.
                        text.push_str(&tail[..=close]);
                    }
                }
                rest = &tail[close + 1..];
            }
            None => {
                text.push_str(rest);
                rest = "";
            }
        }
    }
    text.push_str(rest);

    ParsedPrompt {
        text: collapse_whitespace(&text),
        refs,
    }
}

fn parse_tag(span: &str, multiplier: f64) -> Option<ExtensionModelRef> {
    let mut parts = span.split(':');
    let kind = match parts.next()?.trim().to_ascii_lowercase().as_str() {
        "lora" => ExtensionKind::Lora,
        "hypernet" | "hypernetwork" => ExtensionKind::Hypernetwork,
        _ => return None,
    };
    let name = parts.next()?.trim();
    if name.is_empty() {
        return None;
    }
    let strength = match parts.next() {
        Some(s) => s.trim().parse::<f64>().ok()?,
        None => 1.0,
    };
    let clip_strength = match parts.next() {
        Some(s) => s.trim().parse::<f64>().ok()?,
        None => strength,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(ExtensionModelRef {
        name: name.to_string(),
        strength: strength * multiplier,
        clip_strength: clip_strength * multiplier,
        kind,
    })
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_space = false;
    for c in text.chars() {
        if c == ' ' {
            if !last_space {
                out.push(c);
            }
            last_space = true;
        } else {
            out.push(c);
            last_space = false;
        }
    }
    out.trim().to_string()
}

/// Strip a trailing file extension, keeping any subfolder prefix.
pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(dot) if dot > name.rfind('/').map(|s| s + 1).unwrap_or(0) => &name[..dot],
        _ => name,
    }
}

/// Resolve a tag name against a cached model list: exact match first, then
/// a match ignoring file extensions on both sides.
pub fn resolve_model_name(name: &str, available: &[String]) -> Option<String> {
    if let Some(exact) = available.iter().find(|m| m.as_str() == name) {
        return Some(exact.clone());
    }
    let stem = file_stem(name);
    available
        .iter()
        .find(|m| file_stem(m) == stem)
        .cloned()
}

/// Resolve the parsed refs against the cached lists, dropping (with a logged
/// warning) anything the backend does not actually have.
pub fn resolve_extension_refs(
    refs: Vec<ExtensionModelRef>,
    loras: &[String],
    hypernetworks: &[String],
) -> Vec<ExtensionModelRef> {
    refs.into_iter()
        .filter_map(|mut r| {
            let available = match r.kind {
                ExtensionKind::Lora => loras,
                ExtensionKind::Hypernetwork => hypernetworks,
            };
            match resolve_model_name(&r.name, available) {
                Some(resolved) => {
                    r.name = resolved;
                    Some(r)
                }
                None => {
                    warn!("dropping unresolved extension model \"{}\"", r.name);
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_lora_tag() {
        let parsed = extract_extension_tags("a castle <lora:foo:0.8> at dusk", 1.0);
        assert_eq!(parsed.text, "a castle at dusk");
        assert_eq!(parsed.refs.len(), 1);
        let r = &parsed.refs[0];
        assert_eq!(r.name, "foo");
        assert_eq!(r.strength, 0.8);
        assert_eq!(r.clip_strength, 0.8);
        assert_eq!(r.kind, ExtensionKind::Lora);
    }

    #[test]
    fn test_negative_prompt_flips_strength() {
        let parsed = extract_extension_tags("<lora:foo:0.8>", -1.0);
        assert_eq!(parsed.refs[0].strength, -0.8);
        assert_eq!(parsed.refs[0].clip_strength, -0.8);
    }

    #[test]
    fn test_explicit_clip_strength() {
        let parsed = extract_extension_tags("<lora:foo:0.8:0.5>", 1.0);
        assert_eq!(parsed.refs[0].strength, 0.8);
        assert_eq!(parsed.refs[0].clip_strength, 0.5);
    }

    #[test]
    fn test_hypernetwork_tag() {
        let parsed = extract_extension_tags("<hypernet:bar:0.6> landscape", 1.0);
        assert_eq!(parsed.refs[0].kind, ExtensionKind::Hypernetwork);
        assert_eq!(parsed.refs[0].name, "bar");
        assert_eq!(parsed.text, "landscape");
    }

    #[test]
    fn test_default_strength_is_one() {
        let parsed = extract_extension_tags("<lora:foo>", 1.0);
        assert_eq!(parsed.refs[0].strength, 1.0);
    }

    #[test]
    fn test_unknown_angle_spans_are_kept() {
        let parsed = extract_extension_tags("a <color:red> house", 1.0);
        assert_eq!(parsed.text, "a <color:red> house");
        assert!(parsed.refs.is_empty());
    }

    #[test]
    fn test_malformed_strength_is_kept() {
        let parsed = extract_extension_tags("<lora:foo:strong>", 1.0);
        assert_eq!(parsed.text, "<lora:foo:strong>");
        assert!(parsed.refs.is_empty());
    }

    #[test]
    fn test_multiple_tags() {
        let parsed = extract_extension_tags("<lora:a:0.5> cat <hypernet:b:0.3> dog", 1.0);
        assert_eq!(parsed.refs.len(), 2);
        assert_eq!(parsed.text, "cat dog");
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("foo.safetensors"), "foo");
        assert_eq!(file_stem("sub/foo.ckpt"), "sub/foo");
        assert_eq!(file_stem("no_extension"), "no_extension");
    }

    #[test]
    fn test_resolve_exact_match_wins() {
        let available = vec!["foo".to_string(), "foo.safetensors".to_string()];
        assert_eq!(resolve_model_name("foo", &available).as_deref(), Some("foo"));
    }

    #[test]
    fn test_resolve_ignoring_extension() {
        let available = vec!["foo.safetensors".to_string()];
        assert_eq!(
            resolve_model_name("foo", &available).as_deref(),
            Some("foo.safetensors")
        );
        assert_eq!(
            resolve_model_name("foo.ckpt", &available).as_deref(),
            Some("foo.safetensors")
        );
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        let available = vec!["foo.safetensors".to_string()];
        assert!(resolve_model_name("bar", &available).is_none());
    }

    #[test]
    fn test_unresolved_refs_are_dropped() {
        let refs = vec![
            ExtensionModelRef {
                name: "known".into(),
                strength: 0.8,
                clip_strength: 0.8,
                kind: ExtensionKind::Lora,
            },
            ExtensionModelRef {
                name: "missing".into(),
                strength: 0.5,
                clip_strength: 0.5,
                kind: ExtensionKind::Lora,
            },
        ];
        let loras = vec!["known.safetensors".to_string()];
        let resolved = resolve_extension_refs(refs, &loras, &[]);
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].name, "known.safetensors");
    }
}
