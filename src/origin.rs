use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const WILDCARD: &str = "*";

/// Normalized allow-list of embedding origins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowList(pub Vec<String>);

impl AllowList {
    pub fn allow_all() -> Self {
        Self(vec![WILDCARD.to_string()])
    }

    /// Accepts an array, an object of values or a single string; entries that
    /// do not parse as an origin are dropped.
    pub fn from_value(value: &Value) -> Self {
        let raw: Vec<&str> = match value {
            Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
            Value::Object(map) => map.values().filter_map(Value::as_str).collect(),
            Value::String(s) => vec![s.as_str()],
            _ => Vec::new(),
        };
        Self(raw.into_iter().filter_map(normalize_origin).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_wildcard(&self) -> bool {
        self.0.iter().any(|o| o == WILDCARD)
    }

    pub fn contains(&self, origin: &str) -> bool {
        self.0.iter().any(|o| o == origin)
    }
}

/// `*` stays `*`; anything else is reduced to `scheme://host[:port]`.
pub fn normalize_origin(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw == WILDCARD {
        return Some(WILDCARD.to_string());
    }
    let url = url::Url::parse(raw).ok()?;
    let origin = url.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Pass,
    Blocked,
}

/// Decides whether the embedding page may show the widget at all.
pub struct OriginGate<'a> {
    allow: &'a AllowList,
}

impl<'a> OriginGate<'a> {
    pub fn new(allow: &'a AllowList) -> Self {
        Self { allow }
    }

    pub fn check(&self, page_origin: &str) -> GateDecision {
        if self.allow.is_empty() || page_origin.is_empty() || self.allow.has_wildcard() {
            return GateDecision::Pass;
        }
        if self.allow.contains(page_origin) {
            GateDecision::Pass
        } else {
            GateDecision::Blocked
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(list: Value, origin: &str) -> GateDecision {
        let allow = AllowList::from_value(&list);
        OriginGate::new(&allow).check(origin)
    }

    #[test]
    fn exact_origin_passes() {
        assert_eq!(
            gate(json!(["https://foo.example"]), "https://foo.example"),
            GateDecision::Pass
        );
    }

    #[test]
    fn other_origin_blocks() {
        assert_eq!(
            gate(json!(["https://bar.example"]), "https://foo.example"),
            GateDecision::Blocked
        );
    }

    #[test]
    fn wildcard_and_empty_pass() {
        assert_eq!(gate(json!(["https://bar.example", "*"]), "https://foo.example"), GateDecision::Pass);
        assert_eq!(gate(json!([]), "https://foo.example"), GateDecision::Pass);
        assert_eq!(gate(Value::Null, "https://foo.example"), GateDecision::Pass);
    }

    #[test]
    fn entries_are_normalized() {
        let allow = AllowList::from_value(&json!({
            "a": "https://foo.example/some/path?x=1",
            "b": "not an origin",
            "c": "http://localhost:3000/"
        }));
        assert!(allow.contains("https://foo.example"));
        assert!(allow.contains("http://localhost:3000"));
        assert_eq!(allow.0.len(), 2);
    }

    #[test]
    fn single_string_list() {
        assert_eq!(
            gate(json!("https://foo.example"), "https://foo.example"),
            GateDecision::Pass
        );
        assert_eq!(
            gate(json!("https://foo.example"), "https://evil.example"),
            GateDecision::Blocked
        );
    }

    #[test]
    fn list_of_only_garbage_is_open() {
        // Nothing normalizes, so the list is empty and the gate is open.
        assert_eq!(gate(json!(["::::"]), "https://foo.example"), GateDecision::Pass);
    }
}
