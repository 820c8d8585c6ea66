//! Vendor-keyed parameter rewriting.
//!
//! Rules are applied in a fixed order: rename, remove, inject extras under
//! [`EXTRA_PARAMS_FIELD`], then drop nulls. The rule table is read-only after
//! construction and shared by every request.

use std::collections::HashMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::Params;
use crate::providers::rule_key;

/// Nested field that receives a rule's `extra_params`.
pub const EXTRA_PARAMS_FIELD: &str = "extra_body";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VendorParamRule {
    /// Applied in declaration order.
    #[serde(default)]
    pub rename_params: IndexMap<String, String>,
    #[serde(default)]
    pub remove_params: Vec<String>,
    #[serde(default)]
    pub extra_params: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ParamNormalizer {
    rules: HashMap<String, VendorParamRule>,
}

impl ParamNormalizer {
    pub fn new(rules: impl IntoIterator<Item = (String, VendorParamRule)>) -> Self {
        Self {
            rules: rules
                .into_iter()
                .map(|(vendor, rule)| (rule_key(&vendor), rule))
                .collect(),
        }
    }

    pub fn rule_for(&self, vendor: &str) -> Option<&VendorParamRule> {
        self.rules.get(&rule_key(vendor))
    }

    /// Rewrite `params` for `vendor`. Unknown vendors only get the null-drop.
    pub fn apply(&self, vendor: &str, params: Params) -> Params {
        match self.rule_for(vendor) {
            Some(rule) => apply_rule(rule, params),
            None => apply_rule(&VendorParamRule::default(), params),
        }
    }

    pub fn vendors(&self) -> impl Iterator<Item = &str> {
        self.rules.keys().map(String::as_str)
    }
}

pub fn apply_rule(rule: &VendorParamRule, mut params: Params) -> Params {
    for (old, new) in &rule.rename_params {
        if let Some(value) = params.remove(old) {
            params.insert(new.clone(), value);
        }
    }

    for key in &rule.remove_params {
        params.remove(key);
    }

    if !rule.extra_params.is_empty() {
        match params.get_mut(EXTRA_PARAMS_FIELD) {
            Some(Value::Object(existing)) => {
                for (key, value) in &rule.extra_params {
                    existing
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            _ => {
                params.insert(
                    EXTRA_PARAMS_FIELD.to_string(),
                    Value::Object(rule.extra_params.clone()),
                );
            }
        }
    }

    params.retain(|_, value| !value.is_null());
    params
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn rule(value: Value) -> VendorParamRule {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rename_remove_inject() {
        let normalizer = ParamNormalizer::new([(
            "gemini".to_string(),
            rule(json!({
                "rename_params": {"max_tokens": "maxOutputTokens"},
                "remove_params": ["logit_bias"],
                "extra_params": {"safe_mode": true}
            })),
        )]);

        let out = normalizer.apply(
            "gemini",
            params(json!({"max_tokens": 100, "logit_bias": {"5": 1}, "temperature": 0.5})),
        );

        assert_eq!(
            Value::Object(out),
            json!({
                "maxOutputTokens": 100,
                "temperature": 0.5,
                "extra_body": {"safe_mode": true}
            })
        );
    }

    #[test]
    fn test_unknown_vendor_only_drops_nulls() {
        let normalizer = ParamNormalizer::default();
        let out = normalizer.apply(
            "nobody",
            params(json!({"temperature": 0.2, "user": null, "logit_bias": {"1": 2}})),
        );
        assert_eq!(
            Value::Object(out),
            json!({"temperature": 0.2, "logit_bias": {"1": 2}})
        );
    }

    #[test]
    fn test_rename_overwrites_existing_target_in_declaration_order() {
        let r = rule(json!({
            "rename_params": {"max_tokens": "max_output_tokens", "max_completion_tokens": "max_output_tokens"}
        }));
        let out = apply_rule(
            &r,
            params(json!({"max_output_tokens": 1, "max_tokens": 2, "max_completion_tokens": 3})),
        );
        assert_eq!(Value::Object(out), json!({"max_output_tokens": 3}));
    }

    #[test]
    fn test_extras_never_clobber_top_level_keys() {
        let r = rule(json!({"extra_params": {"temperature": 1.9, "safe_mode": true}}));
        let out = apply_rule(&r, params(json!({"temperature": 0.1})));

        assert_eq!(out["temperature"], json!(0.1));
        assert_eq!(out["extra_body"], json!({"temperature": 1.9, "safe_mode": true}));
    }

    #[test]
    fn test_extras_merge_into_caller_extra_body() {
        let r = rule(json!({"extra_params": {"safe_mode": true}}));
        let out = apply_rule(&r, params(json!({"extra_body": {"top_k": 5}})));
        assert_eq!(out["extra_body"], json!({"top_k": 5, "safe_mode": true}));
    }

    #[test]
    fn test_nulls_dropped_after_rename() {
        let r = rule(json!({"rename_params": {"stop": "stop_sequences"}}));
        let out = apply_rule(&r, params(json!({"stop": null, "n": 1})));
        assert_eq!(Value::Object(out), json!({"n": 1}));
    }

    #[test]
    fn test_anthropic_bindings_use_claude_rules() {
        let normalizer = ParamNormalizer::new([(
            "claude".to_string(),
            rule(json!({"remove_params": ["presence_penalty"]})),
        )]);
        let out = normalizer.apply(
            "anthropic",
            params(json!({"presence_penalty": 0.5, "temperature": 0.2})),
        );
        assert_eq!(Value::Object(out), json!({"temperature": 0.2}));
    }

    #[test]
    fn test_apply_is_deterministic() {
        let normalizer = ParamNormalizer::new([(
            "Zhipu".to_string(),
            rule(json!({
                "rename_params": {"a": "b"},
                "remove_params": ["c"],
                "extra_params": {"d": 1}
            })),
        )]);
        let input = params(json!({"a": 1, "c": 2, "e": null, "f": [1, 2]}));

        let first = normalizer.apply("zhipu", input.clone());
        for _ in 0..10 {
            let again = normalizer.apply("ZHIPU", input.clone());
            assert_eq!(again, first);
            assert!(again.values().all(|v| !v.is_null()));
        }
    }
}
