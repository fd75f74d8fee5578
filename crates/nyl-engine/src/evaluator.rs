//! Template Evaluator
//!
//! Pure function of (template text, context, lookup handler) to either the
//! expanded text plus every lookup it performed, or a template error.

use minijinja::{Environment, ErrorKind, Value};
use nyl_core::{LookupResult, MissingDependency, ObjectKey, TemplateContext};
use std::sync::Arc;

use crate::error::TemplateError;
use crate::filters;
use crate::functions::{FunctionState, LookupHandler, RecordedLookup};
use nyl_core::lookup::DeferReason;

/// Successful expansion of one template file
#[derive(Debug, Clone)]
pub struct Expansion {
    pub text: String,
    pub lookups: Vec<RecordedLookup>,
}

impl Expansion {
    /// Lookups that rendered a marker instead of a value
    pub fn unresolved(&self) -> impl Iterator<Item = &RecordedLookup> {
        self.lookups.iter().filter(|l| l.marker.is_some())
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved().next().is_none()
    }
}

/// Failed evaluation, with the lookups performed before the failure
#[derive(Debug, Clone)]
pub struct EvalFailure {
    pub error: TemplateError,
    pub lookups: Vec<RecordedLookup>,
    /// A pending value reached an operation it cannot take part in
    /// (`ref(...) + 1`); the error is not the template's fault
    pub on_pending: bool,
}

impl EvalFailure {
    /// Lookups this failure is waiting on; empty when the failure is a real
    /// template error regardless of what else was deferred
    pub fn deferred(&self) -> Vec<MissingDependency> {
        if !self.on_pending {
            return Vec::new();
        }
        deferred_of(&self.lookups)
    }
}

/// Errors a [`PendingValue`](crate::functions::PendingValue) can cause when
/// it flows into arithmetic, iteration or a type-checked argument
fn pending_value_error(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::InvalidOperation | ErrorKind::NonPrimitive | ErrorKind::NonKey)
}

pub(crate) fn deferred_of(lookups: &[RecordedLookup]) -> Vec<MissingDependency> {
    lookups
        .iter()
        .filter_map(|l| match &l.outcome {
            LookupResult::Deferred(missing) => Some(missing.clone()),
            _ => None,
        })
        .collect()
}

/// Object keys the handler has not fetched yet
pub fn pending_keys(lookups: &[RecordedLookup]) -> Vec<ObjectKey> {
    let mut keys: Vec<ObjectKey> = deferred_of(lookups)
        .into_iter()
        .filter(|m| m.reason == DeferReason::NotYetFetched)
        .filter_map(|m| match m.lookup {
            nyl_core::Lookup::Ref(r) => Some(r.key),
            nyl_core::Lookup::Secret(_) => None,
        })
        .collect();
    keys.sort();
    keys.dedup();
    keys
}

/// Builds a strict MiniJinja environment per evaluation
#[derive(Debug, Clone, Default)]
pub struct Evaluator;

impl Evaluator {
    pub fn new() -> Self {
        Self
    }

    fn environment<'a>(&self, functions: &FunctionState) -> Environment<'a> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

        let state = functions.clone();
        env.add_filter("toyaml", move |v: Value| filters::toyaml(v).map_err(|e| state.misuse(e)));
        let state = functions.clone();
        env.add_filter("tojson", move |v: Value| filters::tojson(v).map_err(|e| state.misuse(e)));
        let state = functions.clone();
        env.add_filter("b64encode", move |v: String| {
            filters::b64encode(v).map_err(|e| state.misuse(e))
        });
        let state = functions.clone();
        env.add_filter("b64decode", move |v: String| {
            filters::b64decode(v).map_err(|e| state.misuse(e))
        });
        let state = functions.clone();
        env.add_filter("sha256", move |v: String| {
            filters::sha256sum(v).map_err(|e| state.misuse(e))
        });
        env.add_filter("quote", filters::quote);
        env.add_filter("indent", filters::indent);
        env.add_filter("nindent", filters::nindent);

        functions.register(&mut env);
        env
    }

    /// Evaluate one template.
    ///
    /// `scope` prefixes the ids of random thunks created by this evaluation;
    /// it must be unique per template within a render.
    pub fn evaluate(
        &self,
        name: &str,
        source: &str,
        context: &TemplateContext,
        handler: Arc<dyn LookupHandler>,
        scope: &str,
    ) -> Result<Expansion, EvalFailure> {
        let functions = FunctionState::new(handler, scope, context.default_namespace());
        let env = self.environment(&functions);

        let fail = |err: minijinja::Error| {
            let lookups = functions.take_records();
            let on_pending = pending_value_error(err.kind())
                && !functions.misused()
                && !deferred_of(&lookups).is_empty();
            EvalFailure {
                error: TemplateError::from_minijinja(err, name, source, Some(&context.values)),
                lookups,
                on_pending,
            }
        };

        let template = env.template_from_named_str(name, source).map_err(&fail)?;
        let ctx = minijinja::context! {
            values => &context.values,
            Params => &context.values,
            application => &context.application,
            package => &context.package,
        };
        let text = template.render(ctx).map_err(&fail)?;

        Ok(Expansion {
            text,
            lookups: functions.take_records(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nyl_core::lookup::{LookupError, LookupErrorKind};
    use nyl_core::{
        ApplicationInfo, Lookup, Package, Reference, SecretRef, TemplateContext, Values,
    };
    use serde_json::json;
    use std::collections::HashMap;

    /// Resolves refs from a fixed table; everything else is deferred
    struct TableHandler {
        refs: HashMap<String, serde_json::Value>,
    }

    impl LookupHandler for TableHandler {
        fn resolve_ref(&self, reference: &Reference) -> LookupResult {
            match self.refs.get(&reference.to_string()) {
                Some(v) => LookupResult::Resolved(v.clone()),
                None => LookupResult::deferred(
                    Lookup::Ref(reference.clone()),
                    DeferReason::NotYetFetched,
                ),
            }
        }

        fn resolve_secret(&self, secret: &SecretRef) -> LookupResult {
            if secret.optional {
                LookupResult::Resolved(serde_json::Value::Null)
            } else {
                let error = LookupError::new(LookupErrorKind::SecretNotFound, secret.key.clone());
                LookupResult::Error(error)
            }
        }
    }

    fn context(values: serde_json::Value) -> TemplateContext {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("t.yaml"), "").unwrap();
        let package = Package::load(dir.path()).unwrap();
        TemplateContext::new(
            &Values(values),
            &package,
            Some(ApplicationInfo {
                name: "shop".into(),
                namespace: Some("shop".into()),
            }),
        )
    }

    fn handler(refs: &[(&str, serde_json::Value)]) -> Arc<dyn LookupHandler> {
        Arc::new(TableHandler {
            refs: refs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        })
    }

    #[test]
    fn test_values_and_filters() {
        let ctx = context(json!({"image": {"tag": "1.25"}}));
        let out = Evaluator::new()
            .evaluate("t.yaml", "tag: {{ values.image.tag | quote }}\n", &ctx, handler(&[]), "0")
            .unwrap();
        assert_eq!(out.text, "tag: \"1.25\"\n");
        assert!(out.is_complete());
    }

    #[test]
    fn test_ref_resolved_uses_application_namespace() {
        let ctx = context(json!({}));
        let h = handler(&[("Secret:shop/db.password", json!("hunter2"))]);
        let out = Evaluator::new()
            .evaluate("t.yaml", "pw: {{ ref('Secret', 'db', 'password') }}", &ctx, h, "0")
            .unwrap();
        assert_eq!(out.text, "pw: hunter2");
        assert_eq!(out.lookups.len(), 1);
    }

    #[test]
    fn test_ref_deferred_renders_marker() {
        let ctx = context(json!({}));
        let out = Evaluator::new()
            .evaluate(
                "t.yaml",
                "ip: {{ ref('Service:edge/lb.spec.clusterIP') }}",
                &ctx,
                handler(&[]),
                "0",
            )
            .unwrap();

        assert_eq!(out.text, "ip: ((nyl:deferred:0))");
        let keys = pending_keys(&out.lookups);
        assert_eq!(keys, vec![ObjectKey::new("Service", Some("edge".into()), "lb")]);
    }

    #[test]
    fn test_secret_missing_and_optional() {
        let ctx = context(json!({}));
        let out = Evaluator::new()
            .evaluate(
                "t.yaml",
                "a: {{ secret('main', 'x') }}\nb: {{ secret('main', 'y', optional=true) is none }}",
                &ctx,
                handler(&[]),
                "0",
            )
            .unwrap();
        assert_eq!(out.text, "a: ((nyl:failed:0))\nb: true");
    }

    #[test]
    fn test_random_thunks_are_scoped_and_stable() {
        let ctx = context(json!({}));
        let source =
            "{% set pw = randhex(8) %}a: {{ pw }}\nb: {{ pw }}\nc: {{ random_password() }}";
        let out = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "3.1")
            .unwrap();

        let thunks = nyl_core::random::scan(&out.text);
        assert_eq!(thunks.len(), 3);
        assert_eq!(thunks[0], thunks[1]);
        assert_eq!(thunks[0].id, "3.1.0");
        assert_eq!(thunks[0].length, 16);
        assert_eq!(thunks[2].length, 32);
    }

    #[test]
    fn test_attribute_on_deferred_value_keeps_marker() {
        let ctx = context(json!({}));
        let source = "x: {{ ref('ConfigMap:cfg.data').host.upper() }}";
        let out = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "0")
            .unwrap();
        assert_eq!(out.text, "x: ((nyl:deferred:0))");
        assert!(!out.is_complete());
    }

    #[test]
    fn test_arithmetic_on_deferred_value_waits() {
        let ctx = context(json!({}));
        let source = "replicas: {{ ref('ConfigMap:cfg.data.replicas') + 1 }}";
        let failure = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "0")
            .unwrap_err();
        assert!(failure.on_pending);
        assert_eq!(failure.deferred().len(), 1);
    }

    #[test]
    fn test_undefined_value_beside_deferred_ref_is_fatal() {
        let ctx = context(json!({}));
        let source = "ip: {{ ref('Service', 'lb', 'spec.clusterIP') }}\n\
                      typo: {{ values.no_such_value }}\n";
        let failure = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "0")
            .unwrap_err();
        assert!(!failure.on_pending);
        assert!(failure.deferred().is_empty());
        assert_eq!(failure.lookups.len(), 1);
    }

    #[test]
    fn test_filter_error_beside_deferred_ref_is_fatal() {
        let ctx = context(json!({}));
        let source =
            "a: {{ ref('Service:lb.spec.clusterIP') }}\nb: {{ 'not base64!' | b64decode }}";
        let failure = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "0")
            .unwrap_err();
        assert!(failure.deferred().is_empty());
        assert!(failure.error.message.contains("base64"));
    }

    #[test]
    fn test_bcrypt_hash_verifies() {
        let ctx = context(json!({"password": "s3cret"}));
        let out = Evaluator::new()
            .evaluate("t.yaml", "{{ bcrypt(values.password) }}", &ctx, handler(&[]), "0")
            .unwrap();
        assert!(out.text.starts_with("$2b$"));
        assert!(bcrypt::verify("s3cret", &out.text).unwrap());
    }

    #[test]
    fn test_bcrypt_of_deferred_value_keeps_marker() {
        let ctx = context(json!({}));
        let source = "h: {{ bcrypt(ref('Secret:admin.data.password')) }}";
        let out = Evaluator::new()
            .evaluate("t.yaml", source, &ctx, handler(&[]), "0")
            .unwrap();
        assert_eq!(out.text, "h: ((nyl:deferred:0))");
    }

    #[test]
    fn test_params_aliases_values() {
        let ctx = context(json!({"replicas": 3}));
        let out = Evaluator::new()
            .evaluate("t.yaml", "n: {{ Params.replicas }}", &ctx, handler(&[]), "0")
            .unwrap();
        assert_eq!(out.text, "n: 3");
    }

    #[test]
    fn test_syntax_error() {
        let ctx = context(json!({}));
        let failure = Evaluator::new()
            .evaluate("t.yaml", "a: {{ values.x ", &ctx, handler(&[]), "0")
            .unwrap_err();
        assert_eq!(failure.error.kind(), crate::error::TemplateErrorKind::SyntaxError);
        assert!(failure.deferred().is_empty());
    }

    #[test]
    fn test_invalid_ref_is_template_error() {
        let ctx = context(json!({}));
        let failure = Evaluator::new()
            .evaluate("t.yaml", "a: {{ ref('nonsense') }}", &ctx, handler(&[]), "0")
            .unwrap_err();
        assert!(failure.error.message.contains("invalid reference"));
    }
}
