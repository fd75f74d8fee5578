//! Template functions: `ref`, `secret`, `randhex`, `random_password`, `bcrypt`
//!
//! Lookups are delegated to a [`LookupHandler`]; the functions themselves do
//! no I/O. A lookup that is not `Resolved` evaluates to a [`PendingValue`] that
//! renders as an opaque marker and is recorded so the caller can attribute it
//! to the document it lands in.

use minijinja::value::{Kwargs, Object, ObjectRepr};
use minijinja::{Environment, Error, ErrorKind, State, Value};
use nyl_core::random::contains_thunk;
use nyl_core::{Lookup, LookupResult, RandomThunk, Reference, SecretRef};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Upper bound for `randhex()` bytes and `random_password()` length
const MAX_RANDOM_LENGTH: i64 = 4096;

const DEFAULT_PASSWORD_LENGTH: i64 = 32;

const DEFERRED_MARKER_PREFIX: &str = "((nyl:deferred:";
const FAILED_MARKER_PREFIX: &str = "((nyl:failed:";

/// Whether `text` carries the marker of an unresolved lookup
pub(crate) fn contains_lookup_marker(text: &str) -> bool {
    text.contains(DEFERRED_MARKER_PREFIX) || text.contains(FAILED_MARKER_PREFIX)
}

/// Stand-in for a lookup that did not resolve.
///
/// Attribute, item and method access and calls yield the stand-in itself, so
/// `ref(...).spec.host` still lands its marker in the output instead of
/// failing the template.
#[derive(Debug, Clone)]
pub struct PendingValue {
    marker: String,
}

impl PendingValue {
    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// The stand-in carried by `value`, if any
    pub fn of(value: &Value) -> Option<&PendingValue> {
        value.downcast_object_ref::<PendingValue>()
    }
}

impl Object for PendingValue {
    fn repr(self: &Arc<Self>) -> ObjectRepr {
        ObjectRepr::Plain
    }

    fn get_value(self: &Arc<Self>, _key: &Value) -> Option<Value> {
        Some(Value::from_object((**self).clone()))
    }

    fn call(self: &Arc<Self>, _state: &State<'_, '_>, _args: &[Value]) -> Result<Value, Error> {
        Ok(Value::from_object((**self).clone()))
    }

    fn call_method(
        self: &Arc<Self>,
        _state: &State<'_, '_>,
        _method: &str,
        _args: &[Value],
    ) -> Result<Value, Error> {
        Ok(Value::from_object((**self).clone()))
    }

    fn render(self: &Arc<Self>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.marker)
    }
}

/// Resolves lookups for the evaluator; implemented by the dependency resolver
pub trait LookupHandler: Send + Sync {
    fn resolve_ref(&self, reference: &Reference) -> LookupResult;

    fn resolve_secret(&self, secret: &SecretRef) -> LookupResult;
}

/// A lookup performed during one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLookup {
    pub lookup: Lookup,
    pub outcome: LookupResult,

    /// Text substituted into the output when not resolved
    pub marker: Option<String>,
}

/// Shared state captured by the registered functions
#[derive(Clone)]
pub(crate) struct FunctionState {
    handler: Arc<dyn LookupHandler>,
    records: Arc<Mutex<Vec<RecordedLookup>>>,
    thunks: Arc<AtomicUsize>,
    /// A function rejected its own arguments
    misuse: Arc<AtomicBool>,
    scope: String,
    default_namespace: String,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FunctionState {
    pub(crate) fn new(
        handler: Arc<dyn LookupHandler>,
        scope: impl Into<String>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self {
            handler,
            records: Arc::new(Mutex::new(Vec::new())),
            thunks: Arc::new(AtomicUsize::new(0)),
            misuse: Arc::new(AtomicBool::new(false)),
            scope: scope.into(),
            default_namespace: default_namespace.into(),
        }
    }

    pub(crate) fn take_records(&self) -> Vec<RecordedLookup> {
        std::mem::take(&mut *lock(&self.records))
    }

    /// Whether evaluation failed inside one of our own functions
    pub(crate) fn misused(&self) -> bool {
        self.misuse.load(Ordering::SeqCst)
    }

    /// Mark `err` as raised by our own code, not by a pending value
    pub(crate) fn misuse(&self, err: Error) -> Error {
        self.misuse.store(true, Ordering::SeqCst);
        err
    }

    fn record(&self, lookup: Lookup, outcome: LookupResult) -> Value {
        let mut records = lock(&self.records);
        let idx = records.len();

        let (value, marker) = match &outcome {
            LookupResult::Resolved(v) => (Value::from_serialize(v), None),
            LookupResult::Deferred(missing) => {
                tracing::debug!(lookup = %lookup, reason = %missing.reason, "lookup deferred");
                let marker = format!("{DEFERRED_MARKER_PREFIX}{idx}))");
                (pending(&marker), Some(marker))
            }
            LookupResult::Error(err) => {
                tracing::debug!(lookup = %lookup, error = %err, "lookup failed");
                let marker = format!("{FAILED_MARKER_PREFIX}{idx}))");
                (pending(&marker), Some(marker))
            }
        };

        records.push(RecordedLookup {
            lookup,
            outcome,
            marker,
        });
        value
    }

    fn next_thunk_id(&self) -> String {
        format!("{}.{}", self.scope, self.thunks.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn register(&self, env: &mut Environment<'_>) {
        let state = self.clone();
        env.add_function(
            "ref",
            move |kind: String,
                  name: Option<String>,
                  field: Option<String>,
                  kwargs: Kwargs|
                  -> Result<Value, Error> {
                let namespace: Option<String> =
                    kwargs.get("namespace").map_err(|e| state.misuse(e))?;
                kwargs.assert_all_used().map_err(|e| state.misuse(e))?;

                let reference = match (name, field) {
                    (None, None) => Reference::parse_shorthand(&kind, &state.default_namespace)
                        .map(|mut r| {
                            if let Some(ns) = namespace {
                                r.key.namespace = Some(ns);
                            }
                            r
                        }),
                    (Some(name), Some(field)) => Reference::from_parts(
                        &kind,
                        &name,
                        &field,
                        namespace.as_deref(),
                        &state.default_namespace,
                    ),
                    _ => Err(
                        "ref() takes a 'Kind:name.field' string or kind, name and field"
                            .to_string(),
                    ),
                }
                .map_err(|e| state.misuse(Error::new(ErrorKind::InvalidOperation, e)))?;

                let outcome = state.handler.resolve_ref(&reference);
                Ok(state.record(Lookup::Ref(reference), outcome))
            },
        );

        let state = self.clone();
        env.add_function(
            "secret",
            move |store: String, key: String, kwargs: Kwargs| -> Result<Value, Error> {
                let optional: Option<bool> =
                    kwargs.get("optional").map_err(|e| state.misuse(e))?;
                kwargs.assert_all_used().map_err(|e| state.misuse(e))?;

                let secret = SecretRef {
                    store,
                    key,
                    optional: optional.unwrap_or(false),
                };
                let outcome = state.handler.resolve_secret(&secret);
                Ok(state.record(Lookup::Secret(secret), outcome))
            },
        );

        let state = self.clone();
        env.add_function("randhex", move |bytes: i64| -> Result<String, Error> {
            let bytes = check_length("randhex", bytes).map_err(|e| state.misuse(e))?;
            Ok(RandomThunk::hex(state.next_thunk_id(), bytes).marker())
        });

        let state = self.clone();
        env.add_function(
            "random_password",
            move |length: Option<i64>| -> Result<String, Error> {
                let length = check_length(
                    "random_password",
                    length.unwrap_or(DEFAULT_PASSWORD_LENGTH),
                )
                .map_err(|e| state.misuse(e))?;
                Ok(RandomThunk::password(state.next_thunk_id(), length).marker())
            },
        );

        // Salted, so every render produces a different hash for the same input
        let state = self.clone();
        env.add_function("bcrypt", move |password: Value| -> Result<Value, Error> {
            if PendingValue::of(&password).is_some() {
                return Ok(password);
            }
            let password = match password.as_str() {
                Some(s) => s.to_string(),
                None => password.to_string(),
            };
            if contains_thunk(&password) {
                return Err(state.misuse(Error::new(
                    ErrorKind::InvalidOperation,
                    "bcrypt() cannot hash a random value before it is generated",
                )));
            }
            bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map(Value::from)
                .map_err(|e| state.misuse(Error::new(ErrorKind::InvalidOperation, e.to_string())))
        });
    }
}

fn pending(marker: &str) -> Value {
    Value::from_object(PendingValue {
        marker: marker.to_string(),
    })
}

fn check_length(function: &str, length: i64) -> Result<usize, Error> {
    if !(1..=MAX_RANDOM_LENGTH).contains(&length) {
        return Err(Error::new(
            ErrorKind::InvalidOperation,
            format!("{function}() length must be between 1 and {MAX_RANDOM_LENGTH}, got {length}"),
        ));
    }
    Ok(length as usize)
}
