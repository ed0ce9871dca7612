//! Tier-1 structural healing: scan a flattened DOM snapshot for the element
//! that best matches a logical key, and derive a stable selector for it.
//!
//! Candidates are scored by case-insensitive bag-of-words containment between
//! the key's tokens and the element's text and attributes. Selector
//! preference: `data-*` attribute, then a short non-numeric id, then `name`,
//! then `aria-label`, then a CSS class that does not look build-generated.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Upper bound on elements considered per scan.
pub const SNAPSHOT_LIMIT: usize = 150;

/// JavaScript evaluated in the page to flatten interactive elements.
pub const SNAPSHOT_SCRIPT: &str = r#"
const nodes = document.querySelectorAll(
  'button, input, select, textarea, a, [role="button"], [role="textbox"], [role="link"], [role="tab"]'
);
const out = [];
for (const el of nodes) {
  if (out.length >= 150) break;
  const rect = el.getBoundingClientRect();
  if (rect.width === 0 && rect.height === 0) continue;
  const data = {};
  for (const a of el.attributes) {
    if (a.name.startsWith('data-')) data[a.name] = a.value;
  }
  out.push({
    tag: el.tagName.toLowerCase(),
    id: el.id || '',
    name: el.getAttribute('name') || '',
    classes: Array.from(el.classList),
    aria_label: el.getAttribute('aria-label') || '',
    text: (el.innerText || el.value || '').slice(0, 120),
    data: data,
  });
}
return out;
"#;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomElement {
    #[serde(default)]
    pub tag: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub classes: Vec<String>,
    #[serde(default)]
    pub aria_label: String,
    #[serde(default)]
    pub text: String,
    /// `data-*` attributes; BTreeMap keeps selector choice deterministic.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl DomElement {
    fn haystack(&self) -> String {
        let mut hay = String::new();
        hay.push_str(&self.text);
        hay.push(' ');
        hay.push_str(&self.id);
        hay.push(' ');
        hay.push_str(&self.name);
        hay.push(' ');
        hay.push_str(&self.aria_label);
        for class in &self.classes {
            hay.push(' ');
            hay.push_str(class);
        }
        for (k, v) in &self.data {
            hay.push(' ');
            hay.push_str(k);
            hay.push(' ');
            hay.push_str(v);
        }
        hay.to_lowercase()
    }
}

/// Pick the best-scoring element for `key` and derive a selector for it.
/// Elements with no usable stable attribute are skipped in favor of the next
/// best match.
pub fn best_candidate(key: &str, snapshot: &[DomElement]) -> Option<String> {
    let tokens: Vec<String> = key
        .split(['_', '-', ' '])
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect();
    if tokens.is_empty() {
        return None;
    }

    let mut scored: Vec<(usize, &DomElement)> = snapshot
        .iter()
        .take(SNAPSHOT_LIMIT)
        .map(|el| {
            let hay = el.haystack();
            let score = tokens.iter().filter(|t| hay.contains(t.as_str())).count();
            (score, el)
        })
        .filter(|(score, _)| *score > 0)
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));

    scored.iter().find_map(|(_, el)| selector_for(el))
}

/// Derive the highest-priority stable selector for an element, or None when
/// every attribute looks generated or empty.
pub fn selector_for(el: &DomElement) -> Option<String> {
    if let Some((attr, value)) = el.data.iter().next() {
        if !value.is_empty() {
            return Some(format!("[{attr}=\"{value}\"]"));
        }
        return Some(format!("[{attr}]"));
    }

    if is_stable_id(&el.id) {
        return Some(format!("#{}", el.id));
    }

    if !el.name.is_empty() {
        return Some(format!("{}[name=\"{}\"]", el.tag, el.name));
    }

    if !el.aria_label.is_empty() {
        return Some(format!("[aria-label=\"{}\"]", el.aria_label));
    }

    el.classes
        .iter()
        .find(|c| !c.is_empty() && !looks_generated(c))
        .map(|c| format!("{}.{}", el.tag, c))
}

fn is_stable_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 32
        && !id.chars().all(|c| c.is_ascii_digit())
        && !looks_generated(id)
}

/// Heuristic for build-tool-generated identifiers: known CSS-in-JS prefixes,
/// or a trailing hash-like segment (alphanumeric with digits, no meaning).
pub fn looks_generated(name: &str) -> bool {
    const PREFIXES: [&str; 6] = ["css-", "sc-", "jsx-", "jss", "chakra-", "emotion-"];
    let lower = name.to_lowercase();
    if PREFIXES.iter().any(|p| lower.starts_with(p)) {
        return true;
    }

    let last_segment = lower.rsplit(['-', '_']).next().unwrap_or(&lower);
    let digits = last_segment.chars().filter(|c| c.is_ascii_digit()).count();
    last_segment.len() >= 5 && digits >= 2 && last_segment.chars().all(|c| c.is_ascii_alphanumeric())
}
