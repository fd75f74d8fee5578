//! Fuzzy "did you mean" suggestions for template and resource errors

use serde_json::Value as JsonValue;

/// Maximum Levenshtein distance to consider for suggestions
const MAX_SUGGESTION_DISTANCE: usize = 3;

/// Filters registered by the evaluator plus common MiniJinja builtins
pub const AVAILABLE_FILTERS: &[&str] = &[
    "toyaml",
    "tojson",
    "b64encode",
    "b64decode",
    "quote",
    "indent",
    "nindent",
    "sha256",
    "default",
    "upper",
    "lower",
    "replace",
    "trim",
    "join",
    "first",
    "last",
    "length",
    "sort",
    "map",
    "select",
    "selectattr",
    "dictsort",
    "items",
    "int",
    "string",
    "list",
];

/// Functions registered by the evaluator plus MiniJinja globals
pub const AVAILABLE_FUNCTIONS: &[&str] = &[
    "ref",
    "secret",
    "randhex",
    "random_password",
    "bcrypt",
    "range",
    "dict",
    "namespace",
];

/// Top-level context variables
pub const CONTEXT_VARIABLES: &[&str] = &["values", "Params", "application", "package"];

#[derive(Debug, Clone)]
pub struct Suggestion {
    pub text: String,
    pub distance: usize,
}

/// Closest candidates within the suggestion distance, best first
pub fn find_closest_matches(
    input: &str,
    candidates: &[&str],
    max_results: usize,
) -> Vec<Suggestion> {
    let mut suggestions: Vec<Suggestion> = candidates
        .iter()
        .filter_map(|&candidate| {
            let distance = strsim::levenshtein(input, candidate);
            (distance <= MAX_SUGGESTION_DISTANCE && distance > 0).then(|| Suggestion {
                text: candidate.to_string(),
                distance,
            })
        })
        .collect();

    suggestions.sort_by_key(|s| s.distance);
    suggestions.truncate(max_results);
    suggestions
}

fn did_you_mean(matches: &[Suggestion]) -> Option<String> {
    if matches.is_empty() {
        return None;
    }
    let names: Vec<String> = matches.iter().map(|s| format!("`{}`", s.text)).collect();
    Some(format!("Did you mean {}?", names.join(" or ")))
}

pub fn suggest_undefined_variable(
    variable_name: &str,
    values: Option<&JsonValue>,
) -> Option<String> {
    if variable_name == "value" || variable_name.starts_with("value.") {
        return Some(format!(
            "Did you mean `{}`? Parameters are accessed as `values.key`",
            variable_name.replacen("value", "values", 1)
        ));
    }

    let root = variable_name.split('.').next().unwrap_or(variable_name);
    if let Some(hint) = did_you_mean(&find_closest_matches(root, CONTEXT_VARIABLES, 1)) {
        return Some(hint);
    }

    let path = variable_name
        .strip_prefix("values.")
        .or_else(|| variable_name.strip_prefix("Params."))?;
    suggest_available_properties(path, values?)
}

/// Walk `path` through `values` and suggest keys where it breaks
pub fn suggest_available_properties(path: &str, values: &JsonValue) -> Option<String> {
    let mut current = values;
    let mut walked = vec!["values"];

    for part in path.split('.') {
        match current.get(part) {
            Some(next) => {
                walked.push(part);
                current = next;
            }
            None => {
                let available: Vec<&str> =
                    current.as_object()?.keys().map(String::as_str).collect();
                let prefix = walked.join(".");
                return Some(match did_you_mean(&find_closest_matches(part, &available, 3)) {
                    Some(hint) => {
                        format!("{hint} Available in `{prefix}`: {}", available.join(", "))
                    }
                    None => format!(
                        "Key `{part}` not found in `{prefix}`. Available keys: {}",
                        available.join(", ")
                    ),
                });
            }
        }
    }
    None
}

pub fn suggest_unknown_filter(filter_name: &str) -> String {
    did_you_mean(&find_closest_matches(filter_name, AVAILABLE_FILTERS, 3)).unwrap_or_else(|| {
        format!(
            "Unknown filter `{filter_name}`. \
             Common filters: toyaml, tojson, b64encode, quote, indent"
        )
    })
}

pub fn suggest_unknown_function(func_name: &str) -> String {
    did_you_mean(&find_closest_matches(func_name, AVAILABLE_FUNCTIONS, 3)).unwrap_or_else(|| {
        format!(
            "Unknown function `{func_name}`. Available functions: {}",
            AVAILABLE_FUNCTIONS.join(", ")
        )
    })
}

/// Hint for a kind under `nyl.io/v1` that does not exist
pub fn suggest_nyl_kind(kind: &str) -> String {
    let known: Vec<&str> = nyl_core::NylKind::ALL.iter().map(|k| k.as_str()).collect();
    did_you_mean(&find_closest_matches(kind, &known, 1))
        .unwrap_or_else(|| format!("Known kinds: {}", known.join(", ")))
}

/// Hint for a secret store name that is not configured
pub fn suggest_store(name: &str, configured: &[&str]) -> String {
    did_you_mean(&find_closest_matches(name, configured, 1)).unwrap_or_else(|| {
        if configured.is_empty() {
            "No secret stores are configured for this application".to_string()
        } else {
            format!("Configured stores: {}", configured.join(", "))
        }
    })
}

/// Extract the first quoted name from an error message
pub fn extract_quoted_name(msg: &str) -> Option<String> {
    for quote in ['`', '\'', '"'] {
        if let Some(start) = msg.find(quote) {
            let rest = &msg[start + 1..];
            if let Some(end) = rest.find(quote) {
                return Some(rest[..end].to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_closest_matches() {
        let matches = find_closest_matches("toyml", AVAILABLE_FILTERS, 3);
        assert_eq!(matches[0].text, "toyaml");
        assert_eq!(matches[0].distance, 1);
    }

    #[test]
    fn test_value_typo() {
        let hint = suggest_undefined_variable("value.image", None).unwrap();
        assert!(hint.contains("values.image"));
    }

    #[test]
    fn test_missing_property() {
        let values = serde_json::json!({"image": {"repository": "nginx", "tag": "1.25"}});
        let hint = suggest_undefined_variable("values.image.tga", Some(&values)).unwrap();
        assert!(hint.contains("`tag`"));
        assert!(hint.contains("values.image"));
    }

    #[test]
    fn test_nyl_kind_suggestion() {
        assert_eq!(suggest_nyl_kind("HelmChrat"), "Did you mean `HelmChart`?");
        assert!(suggest_nyl_kind("Zzzzzzzzzz").contains("StatefulSecret"));
    }

    #[test]
    fn test_store_suggestion() {
        assert_eq!(suggest_store("mian", &["main", "backup"]), "Did you mean `main`?");
        assert!(suggest_store("x", &[]).contains("No secret stores"));
    }

    #[test]
    fn test_unknown_function() {
        assert!(suggest_unknown_function("rf").contains("`ref`"));
    }

    #[test]
    fn test_extract_quoted_name() {
        assert_eq!(extract_quoted_name("unknown filter `toyml`"), Some("toyml".to_string()));
        assert_eq!(extract_quoted_name("no quotes"), None);
    }
}
