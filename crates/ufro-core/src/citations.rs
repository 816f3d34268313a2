//! Citation normalizer for the retrieval bridge.
//!
//! The retrieval backend's citation schema drifts (`document` vs `doc`, `sec` vs `section`,
//! `link` vs `url`, one object vs a list). Everything is folded into [`Citation`] and
//! anything unrecognizable is dropped instead of failing the request.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DOC_KEYS: &[&str] = &["doc", "document", "title", "name"];
const PAGE_KEYS: &[&str] = &["page", "p"];
const SECTION_KEYS: &[&str] = &["section", "sec", "section_number"];
const URL_KEYS: &[&str] = &["url", "link", "href"];

/// Canonical citation. At most one of `page` / `section` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub doc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub url: String,
}

/// Normalize a single citation object or a list of them.
pub fn normalize(raw: &Value) -> Vec<Citation> {
    match raw {
        Value::Object(obj) => normalize_one(obj).into_iter().collect(),
        Value::Array(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(normalize_one)
            .collect(),
        _ => Vec::new(),
    }
}

fn normalize_one(obj: &Map<String, Value>) -> Option<Citation> {
    let doc = first_populated(obj, DOC_KEYS)?;
    let page = first_populated(obj, PAGE_KEYS);
    let section = if page.is_some() {
        None
    } else {
        first_populated(obj, SECTION_KEYS)
    };
    let url = first_populated(obj, URL_KEYS).unwrap_or_default();
    Some(Citation {
        doc,
        page,
        section,
        url,
    })
}

/// Text of the first alias whose value is populated (not null, false, zero or empty).
fn first_populated(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find(|v| is_populated(v))
        .map(as_text)
}

fn is_populated(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn as_text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn aliased_object_is_canonicalized() {
        let out = normalize(&json!({"document": "Civil Code", "sec": "12", "link": "http://x"}));
        assert_eq!(
            serde_json::to_value(&out).unwrap(),
            json!([{"doc": "Civil Code", "section": "12", "url": "http://x"}])
        );
    }

    #[test]
    fn page_wins_over_section() {
        let out = normalize(&json!({"doc": "Reglamento", "page": 4, "section": "2.1"}));
        assert_eq!(out[0].page.as_deref(), Some("4"));
        assert!(out[0].section.is_none());
    }

    #[test]
    fn neither_page_nor_section_keeps_citation() {
        let out = normalize(&json!({"title": "Estatuto"}));
        assert_eq!(
            out,
            vec![Citation {
                doc: "Estatuto".into(),
                page: None,
                section: None,
                url: String::new(),
            }]
        );
        let v = serde_json::to_value(&out[0]).unwrap();
        assert!(v.get("page").is_none());
        assert!(v.get("section").is_none());
        assert_eq!(v["url"], "");
    }

    #[test]
    fn doc_alias_priority_skips_empty_values() {
        let out = normalize(&json!({"doc": "", "document": null, "title": "T", "name": "N"}));
        assert_eq!(out[0].doc, "T");
    }

    #[test]
    fn list_drops_unusable_entries() {
        let out = normalize(&json!([
            {"name": "A", "p": "3", "href": "http://a"},
            {"page": 1},
            "just a string",
            42,
            {"doc": "B", "section_number": 7}
        ]));
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].doc, "A");
        assert_eq!(out[0].page.as_deref(), Some("3"));
        assert_eq!(out[0].url, "http://a");
        assert_eq!(out[1].section.as_deref(), Some("7"));
    }

    #[test]
    fn non_container_input_is_empty() {
        assert!(normalize(&json!("Civil Code")).is_empty());
        assert!(normalize(&json!(null)).is_empty());
        assert!(normalize(&json!(3.5)).is_empty());
        assert!(normalize(&json!([])).is_empty());
        assert!(normalize(&json!({})).is_empty());
    }
}
