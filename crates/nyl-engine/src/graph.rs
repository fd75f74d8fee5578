//! Resource Graph Builder
//!
//! Splits an expanded template into YAML documents and attributes every
//! unresolved lookup to the document its marker landed in. A marker that
//! landed nowhere (consumed by a filter or a condition) taints every
//! document of the file.

use nyl_core::lookup::LookupError;
use nyl_core::{LookupResult, MissingDependency, ResourceId};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::TemplateError;
use crate::evaluator::Expansion;
use crate::functions::RecordedLookup;

/// Where a document came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    /// Template file path
    pub file: String,
    /// 0-based document index within the file
    pub document: usize,
    /// 1-based line of the document start in the expanded text
    pub line: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (document {})", self.file, self.line, self.document)
    }
}

#[derive(Debug, Clone)]
pub enum DocFailure {
    Lookup(Vec<LookupError>),
    Yaml(TemplateError),
    NotAMapping,
}

impl fmt::Display for DocFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocFailure::Lookup(errors) => {
                let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
                f.write_str(&parts.join("; "))
            }
            DocFailure::Yaml(e) => write!(f, "{}", e.message),
            DocFailure::NotAMapping => f.write_str("document is not a mapping"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DocStatus {
    Ready(JsonValue),
    Deferred {
        body: Option<JsonValue>,
        waiting_on: Vec<MissingDependency>,
    },
    Failed {
        body: Option<JsonValue>,
        failure: DocFailure,
    },
}

/// One document of an expanded template
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    pub location: SourceLocation,
    pub text: String,
    /// Lookups whose markers appear in this document
    pub lookups: Vec<RecordedLookup>,
    pub status: DocStatus,
}

impl ResourceSpec {
    /// Identity, when the document parsed far enough to tell
    pub fn id(&self) -> Option<ResourceId> {
        let body = match &self.status {
            DocStatus::Ready(body) => Some(body),
            DocStatus::Deferred { body, .. } | DocStatus::Failed { body, .. } => body.as_ref(),
        }?;
        ResourceId::from_manifest(body).ok()
    }
}

struct RawDocument {
    line: usize,
    text: String,
}

fn is_separator(line: &str) -> bool {
    line.strip_prefix("---")
        .is_some_and(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace))
}

fn split_documents(text: &str) -> Vec<RawDocument> {
    let mut docs = Vec::new();
    let mut current = RawDocument {
        line: 1,
        text: String::new(),
    };

    for (idx, line) in text.lines().enumerate() {
        if is_separator(line) {
            docs.push(std::mem::replace(
                &mut current,
                RawDocument {
                    line: idx + 2,
                    text: String::new(),
                },
            ));
            continue;
        }
        current.text.push_str(line);
        current.text.push('\n');
    }
    docs.push(current);

    docs.into_iter()
        .filter(|d| {
            d.text
                .lines()
                .any(|l| !l.trim().is_empty() && !l.trim_start().starts_with('#'))
        })
        .collect()
}

fn parse(text: &str) -> Result<JsonValue, serde_yaml::Error> {
    serde_yaml::from_str(text)
}

fn classify_lookups(lookups: &[&RecordedLookup]) -> (Vec<MissingDependency>, Vec<LookupError>) {
    let mut deferred = Vec::new();
    let mut errors = Vec::new();
    for lookup in lookups {
        match &lookup.outcome {
            LookupResult::Deferred(missing) => deferred.push(missing.clone()),
            LookupResult::Error(err) => errors.push(err.clone()),
            LookupResult::Resolved(_) => {}
        }
    }
    (deferred, errors)
}

/// Build resource specs for one expanded template file
pub fn build(file: &str, expansion: &Expansion) -> Vec<ResourceSpec> {
    let docs = split_documents(&expansion.text);
    let unresolved: Vec<&RecordedLookup> = expansion.unresolved().collect();

    let landed = |doc: &RawDocument, lookup: &RecordedLookup| -> bool {
        lookup
            .marker
            .as_deref()
            .is_some_and(|marker| doc.text.contains(marker))
    };

    let swallowed: Vec<&RecordedLookup> = unresolved
        .iter()
        .copied()
        .filter(|lookup| !docs.iter().any(|doc| landed(doc, *lookup)))
        .collect();
    if !swallowed.is_empty() {
        tracing::debug!(
            file,
            count = swallowed.len(),
            "unresolved lookups did not land in a document"
        );
    }

    docs.iter()
        .enumerate()
        .filter_map(|(index, doc)| {
            let location = SourceLocation {
                file: file.to_string(),
                document: index,
                line: doc.line,
            };

            let own: Vec<&RecordedLookup> = unresolved
                .iter()
                .copied()
                .filter(|lookup| landed(doc, *lookup))
                .collect();
            let mut affecting = own.clone();
            affecting.extend(swallowed.iter().copied());
            let (waiting_on, errors) = classify_lookups(&affecting);

            let parsed = parse(&doc.text);
            let body = parsed.as_ref().ok().filter(|v| v.is_object()).cloned();

            let status = if !errors.is_empty() {
                DocStatus::Failed {
                    body,
                    failure: DocFailure::Lookup(errors),
                }
            } else if !waiting_on.is_empty() {
                DocStatus::Deferred { body, waiting_on }
            } else {
                match parsed {
                    Ok(JsonValue::Null) => return None,
                    Ok(value @ JsonValue::Object(_)) => DocStatus::Ready(value),
                    Ok(_) => DocStatus::Failed {
                        body: None,
                        failure: DocFailure::NotAMapping,
                    },
                    Err(e) => DocStatus::Failed {
                        body: None,
                        failure: DocFailure::Yaml(TemplateError::yaml(&e, file, &doc.text)),
                    },
                }
            };

            Some(ResourceSpec {
                location,
                text: doc.text.clone(),
                lookups: own.into_iter().cloned().collect(),
                status,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyl_core::lookup::{DeferReason, LookupErrorKind};
    use nyl_core::{Lookup, Reference, SecretRef};

    fn deferred(idx: usize, shorthand: &str) -> RecordedLookup {
        let reference = Reference::parse_shorthand(shorthand, "default").unwrap();
        RecordedLookup {
            lookup: Lookup::Ref(reference.clone()),
            outcome: LookupResult::deferred(Lookup::Ref(reference), DeferReason::NotFound),
            marker: Some(format!("((nyl:deferred:{idx}))")),
        }
    }

    fn failed(idx: usize) -> RecordedLookup {
        let secret = SecretRef {
            store: "main".into(),
            key: "missing".into(),
            optional: false,
        };
        RecordedLookup {
            lookup: Lookup::Secret(secret),
            outcome: LookupResult::Error(LookupError::new(
                LookupErrorKind::SecretNotFound,
                "missing",
            )),
            marker: Some(format!("((nyl:failed:{idx}))")),
        }
    }

    #[test]
    fn test_split_and_attribute() {
        let expansion = Expansion {
            text: concat!(
                "kind: ConfigMap\napiVersion: v1\nmetadata: {name: a}\n",
                "data:\n  ip: ((nyl:deferred:0))\n",
                "---\nkind: ConfigMap\napiVersion: v1\nmetadata: {name: b}\n",
            )
            .into(),
            lookups: vec![deferred(0, "Service:lb.spec.clusterIP")],
        };

        let specs = build("cm.yaml", &expansion);
        assert_eq!(specs.len(), 2);
        assert!(matches!(
            &specs[0].status,
            DocStatus::Deferred { waiting_on, .. } if waiting_on.len() == 1
        ));
        assert_eq!(specs[0].id().unwrap().name, "a");
        assert!(matches!(specs[1].status, DocStatus::Ready(_)));
        assert_eq!(specs[1].location.line, 7);
    }

    #[test]
    fn test_swallowed_marker_defers_whole_file() {
        let expansion = Expansion {
            text: concat!(
                "kind: ConfigMap\napiVersion: v1\nmetadata: {name: a}\n",
                "---\nkind: ConfigMap\napiVersion: v1\nmetadata: {name: b}\n",
            )
            .into(),
            lookups: vec![deferred(0, "Service:lb.spec.clusterIP")],
        };

        let specs = build("cm.yaml", &expansion);
        assert!(specs.iter().all(|s| matches!(s.status, DocStatus::Deferred { .. })));
    }

    #[test]
    fn test_failed_lookup_is_document_scoped() {
        let expansion = Expansion {
            text: concat!(
                "kind: Secret\napiVersion: v1\nmetadata: {name: a}\n",
                "stringData: {k: ((nyl:failed:0))}\n",
                "---\nkind: ConfigMap\napiVersion: v1\nmetadata: {name: b}\n",
            )
            .into(),
            lookups: vec![failed(0)],
        };

        let specs = build("s.yaml", &expansion);
        assert!(matches!(
            specs[0].status,
            DocStatus::Failed { failure: DocFailure::Lookup(_), .. }
        ));
        assert!(matches!(specs[1].status, DocStatus::Ready(_)));
    }

    #[test]
    fn test_empty_and_comment_documents_are_skipped() {
        let expansion = Expansion {
            text: "---\n# only a comment\n---\n\n---\nkind: A\n".into(),
            lookups: vec![],
        };
        let specs = build("x.yaml", &expansion);
        assert_eq!(specs.len(), 1);
    }

    #[test]
    fn test_yaml_error_and_non_mapping() {
        let expansion = Expansion {
            text: "a: [1, 2\n---\n- just\n- a list\n".into(),
            lookups: vec![],
        };
        let specs = build("x.yaml", &expansion);
        assert!(matches!(
            specs[0].status,
            DocStatus::Failed { failure: DocFailure::Yaml(_), .. }
        ));
        assert!(matches!(
            specs[1].status,
            DocStatus::Failed { failure: DocFailure::NotAMapping, .. }
        ));
    }
}
