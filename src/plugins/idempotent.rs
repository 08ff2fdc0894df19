//! The idempotent-call wrapper.
//!
//! `Idempotent` turns any `FnOnce(&Transaction, &A) -> Result<T, E>` into an
//! operation that succeeds at most once per `(scope, key)`. The first
//! successful result is stored as JSON; later calls with the same key get that
//! JSON deserialized back into `T` without running the operation again.
//! Failures are recorded and left retriable.
//!
//! ```no_run
//! use decisioning::core::store::Store;
//! use decisioning::plugins::idempotent::Idempotent;
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Store::open(std::path::Path::new(".decisioning"))?;
//! let commit = Idempotent::<(String, String)>::with_key_from("basket_commit", |(basket, _user)| {
//!     basket.clone()
//! })?;
//! let lines: usize = commit.call(&store, &("B-17".into(), "ana".into()), |_tx, _args| {
//!     Ok::<_, std::io::Error>(3)
//! })?;
//! # let _ = lines;
//! # Ok(())
//! # }
//! ```
//!
//! Replayed values are the stored serialization, not the original object.
//! Results that mention domain rows should carry [`EntityRef`]s so a replay
//! round-trips completely.

use crate::core::config::LockPolicy;
use crate::core::error::{ConfigurationError, DecisioningError};
use crate::core::registry::EntityRef;
use crate::core::store::Store;
use crate::core::time::Timestamp;
use crate::plugins::idempotency::{self, IdempotencyRecord, IdempotencyState, NewKey};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;
use time::Duration;
use ulid::Ulid;

/// Error from an idempotent call.
///
/// `Operation` is the wrapped operation's own error, untouched.
/// `Decisioning` is misuse (see [`DecisioningError::is_configuration`]) or a
/// failure of the bookkeeping around the call.
#[derive(Debug, Error)]
pub enum IdempotentError<E> {
    #[error("{0}")]
    Operation(E),
    #[error(transparent)]
    Decisioning(#[from] DecisioningError),
}

impl<E> IdempotentError<E> {
    pub fn is_configuration(&self) -> bool {
        matches!(self, IdempotentError::Decisioning(e) if e.is_configuration())
    }

    pub fn operation(&self) -> Option<&E> {
        match self {
            IdempotentError::Operation(e) => Some(e),
            IdempotentError::Decisioning(_) => None,
        }
    }

    pub fn into_operation(self) -> Option<E> {
        match self {
            IdempotentError::Operation(e) => Some(e),
            IdempotentError::Decisioning(_) => None,
        }
    }
}

// --- Default key derivation ---

/// Default key derivation over call arguments.
///
/// Scalars stringify themselves. Tuples use their first element, the way a
/// first positional argument would. A JSON object is read as keyword
/// arguments and uses its `"key"` member. `None` means no usable key.
pub trait KeyArgs {
    fn idempotency_key(&self) -> Option<String>;
}

impl<T: KeyArgs + ?Sized> KeyArgs for &T {
    fn idempotency_key(&self) -> Option<String> {
        (**self).idempotency_key()
    }
}

impl KeyArgs for str {
    fn idempotency_key(&self) -> Option<String> {
        Some(self.to_string())
    }
}

impl KeyArgs for String {
    fn idempotency_key(&self) -> Option<String> {
        Some(self.clone())
    }
}

macro_rules! key_args_display {
    ($($t:ty),* $(,)?) => {
        $(
            impl KeyArgs for $t {
                fn idempotency_key(&self) -> Option<String> {
                    Some(self.to_string())
                }
            }
        )*
    };
}

key_args_display!(i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, char, Ulid);

impl KeyArgs for EntityRef {
    fn idempotency_key(&self) -> Option<String> {
        Some(self.id.clone())
    }
}

impl<T: KeyArgs> KeyArgs for Option<T> {
    fn idempotency_key(&self) -> Option<String> {
        self.as_ref().and_then(KeyArgs::idempotency_key)
    }
}

impl KeyArgs for () {
    fn idempotency_key(&self) -> Option<String> {
        None
    }
}

macro_rules! key_args_tuple {
    ($first:ident $(, $rest:ident)*) => {
        impl<$first: KeyArgs $(, $rest)*> KeyArgs for ($first, $($rest,)*) {
            fn idempotency_key(&self) -> Option<String> {
                self.0.idempotency_key()
            }
        }
    };
}

key_args_tuple!(A1);
key_args_tuple!(A1, A2);
key_args_tuple!(A1, A2, A3);
key_args_tuple!(A1, A2, A3, A4);
key_args_tuple!(A1, A2, A3, A4, A5);

impl KeyArgs for JsonValue {
    fn idempotency_key(&self) -> Option<String> {
        match self {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            JsonValue::Bool(b) => Some(b.to_string()),
            JsonValue::Object(map) => map.get("key").and_then(|k| match k {
                JsonValue::String(s) => Some(s.clone()),
                JsonValue::Number(n) => Some(n.to_string()),
                _ => None,
            }),
            JsonValue::Array(items) => items.first().and_then(KeyArgs::idempotency_key),
            JsonValue::Null => None,
        }
    }
}

// --- Wrapper ---

type KeyFn<A> = Box<dyn Fn(&A) -> Option<String> + Send + Sync>;
type FingerprintFn<A> = Box<dyn Fn(&A) -> String + Send + Sync>;
type ResultRefFn = Box<dyn Fn(&JsonValue) -> Option<EntityRef> + Send + Sync>;

pub struct Idempotent<A> {
    scope: String,
    key_from: KeyFn<A>,
    fingerprint: Option<FingerprintFn<A>>,
    result_ref: Option<ResultRefFn>,
    ttl: Option<Duration>,
    lock_policy: Option<LockPolicy>,
    actor: String,
}

impl<A> fmt::Debug for Idempotent<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Idempotent")
            .field("scope", &self.scope)
            .field("fingerprint", &self.fingerprint.is_some())
            .field("result_ref", &self.result_ref.is_some())
            .field("ttl", &self.ttl)
            .field("lock_policy", &self.lock_policy)
            .field("actor", &self.actor)
            .finish()
    }
}

/// A call's value plus whether it came from the stored snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation<T> {
    pub value: T,
    pub replayed: bool,
    pub key: String,
}

fn check_scope(scope: &str) -> Result<String, DecisioningError> {
    let scope = scope.trim();
    if scope.is_empty() {
        return Err(ConfigurationError::MissingScope.into());
    }
    Ok(scope.to_string())
}

impl<A: KeyArgs> Idempotent<A> {
    /// Wrapper keyed by the default derivation over `A` (see [`KeyArgs`]).
    pub fn new(scope: &str) -> Result<Self, DecisioningError> {
        Self::build(scope, Box::new(|args: &A| args.idempotency_key()))
    }
}

impl<A> Idempotent<A> {
    pub fn with_key_from<F>(scope: &str, key_from: F) -> Result<Self, DecisioningError>
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        Self::build(scope, Box::new(move |args: &A| Some(key_from(args))))
    }

    fn build(scope: &str, key_from: KeyFn<A>) -> Result<Self, DecisioningError> {
        Ok(Self {
            scope: check_scope(scope)?,
            key_from,
            fingerprint: None,
            result_ref: None,
            ttl: None,
            lock_policy: None,
            actor: "decisioning".to_string(),
        })
    }

    /// Hash of the request body. A replay whose fingerprint differs from the
    /// stored one fails with `RequestMismatch` instead of replaying.
    pub fn fingerprint<F>(mut self, f: F) -> Self
    where
        F: Fn(&A) -> String + Send + Sync + 'static,
    {
        self.fingerprint = Some(Box::new(f));
        self
    }

    /// Pick the created entity out of the stored snapshot. Without this a
    /// snapshot that is itself an `EntityRef` is used.
    pub fn result_ref<F>(mut self, f: F) -> Self
    where
        F: Fn(&JsonValue) -> Option<EntityRef> + Send + Sync + 'static,
    {
        self.result_ref = Some(Box::new(f));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn lock_policy(mut self, policy: LockPolicy) -> Self {
        self.lock_policy = Some(policy);
        self
    }

    pub fn actor(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn derive_key(&self, args: &A) -> Result<String, DecisioningError> {
        match (self.key_from)(args) {
            Some(key) if !key.trim().is_empty() => Ok(key),
            _ => Err(ConfigurationError::NoKey.into()),
        }
    }

    pub fn call<T, E, F>(&self, store: &Store, args: &A, op: F) -> Result<T, IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce(&Transaction<'_>, &A) -> Result<T, E>,
    {
        self.invoke(store, args, op).map(|inv| inv.value)
    }

    pub fn invoke<T, E, F>(
        &self,
        store: &Store,
        args: &A,
        op: F,
    ) -> Result<Invocation<T>, IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce(&Transaction<'_>, &A) -> Result<T, E>,
    {
        let ctx = self.context(store, args)?;
        let policy = self
            .lock_policy
            .unwrap_or(store.config.idempotency.lock_policy);
        let value = match policy {
            LockPolicy::Relaxed => self.run_relaxed(store, &ctx, args, op)?,
            LockPolicy::HoldForExecution => self.run_held(store, &ctx, args, op)?,
        };
        Ok(Invocation {
            replayed: value.1,
            value: value.0,
            key: ctx.key,
        })
    }

    /// Bind the wrapper to a store and an operation for repeated calls.
    pub fn wrap<'a, F>(&'a self, store: &'a Store, op: F) -> IdempotentFn<'a, A, F> {
        IdempotentFn {
            wrapper: self,
            store,
            op,
        }
    }

    fn context(&self, store: &Store, args: &A) -> Result<CallContext, DecisioningError> {
        let key = self.derive_key(args)?;
        let request_hash = self
            .fingerprint
            .as_ref()
            .map(|f| request_hash(&f(args)))
            .unwrap_or_default();
        let ttl = self.ttl.or_else(|| {
            store
                .config
                .idempotency
                .default_ttl_secs
                .map(|secs| Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX)))
        });
        Ok(CallContext {
            intent_ref: format!("{}:{}", self.scope, key),
            scope: self.scope.clone(),
            key,
            request_hash,
            ttl,
            actor: self.actor.clone(),
        })
    }

    fn result_ref_for(&self, snapshot: &JsonValue) -> Option<EntityRef> {
        match &self.result_ref {
            Some(f) => f(snapshot),
            None => serde_json::from_value::<EntityRef>(snapshot.clone()).ok(),
        }
    }

    /// Lock only around fetch-or-create; the operation and each bookkeeping
    /// step get their own transactions.
    fn run_relaxed<T, E, F>(
        &self,
        store: &Store,
        ctx: &CallContext,
        args: &A,
        op: F,
    ) -> Result<(T, bool), IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce(&Transaction<'_>, &A) -> Result<T, E>,
    {
        let broker = store.broker();
        let now = store.now();
        let acquired = broker.with_tx(&ctx.actor, Some(&ctx.intent_ref), "idempotency.acquire", |tx| {
            acquire(tx, ctx, now)
        })?;
        if let Acquired::Replay(record) = acquired {
            return Ok((replay(store, ctx, &record)?, true));
        }

        let mut conn = broker.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DecisioningError::from)?;
        let outcome = op(&tx, args);
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                drop(tx);
                self.mark_failed(store, ctx, short_type_name::<E>(), &e.to_string())?;
                return Err(IdempotentError::Operation(e));
            }
        };
        let snapshot = match serde_json::to_value(&value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                drop(tx);
                self.mark_failed(store, ctx, "SnapshotError", &e.to_string())?;
                return Err(DecisioningError::JsonError(e).into());
            }
        };
        if let Err(e) = tx.commit() {
            self.mark_failed(store, ctx, "CommitError", &e.to_string())?;
            return Err(DecisioningError::RusqliteError(e).into());
        }
        broker.log_event(&ctx.actor, Some(&ctx.intent_ref), "idempotency.execute", "success")?;

        let result_ref = self.result_ref_for(&snapshot);
        let now = store.now();
        broker.with_tx(&ctx.actor, Some(&ctx.intent_ref), "idempotency.succeed", |tx| {
            record_success(tx, ctx, now, snapshot, result_ref)
        })?;
        Ok((value, false))
    }

    /// Acquire, execute and mark-succeeded in one immediate transaction, so
    /// callers sharing a key run strictly one after another.
    fn run_held<T, E, F>(
        &self,
        store: &Store,
        ctx: &CallContext,
        args: &A,
        op: F,
    ) -> Result<(T, bool), IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: FnOnce(&Transaction<'_>, &A) -> Result<T, E>,
    {
        let broker = store.broker();
        let mut conn = broker.connect()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(DecisioningError::from)?;
        let now = store.now();

        let acquired = acquire(&tx, ctx, now);
        broker.log_event(
            &ctx.actor,
            Some(&ctx.intent_ref),
            "idempotency.acquire",
            if acquired.is_ok() { "success" } else { "error" },
        )?;
        if let Acquired::Replay(record) = acquired? {
            drop(tx);
            return Ok((replay(store, ctx, &record)?, true));
        }

        let value = match op(&tx, args) {
            Ok(value) => value,
            Err(e) => {
                drop(tx);
                self.mark_failed(store, ctx, short_type_name::<E>(), &e.to_string())?;
                return Err(IdempotentError::Operation(e));
            }
        };
        let snapshot = match serde_json::to_value(&value) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                drop(tx);
                self.mark_failed(store, ctx, "SnapshotError", &e.to_string())?;
                return Err(DecisioningError::JsonError(e).into());
            }
        };
        broker.log_event(&ctx.actor, Some(&ctx.intent_ref), "idempotency.execute", "success")?;

        let result_ref = self.result_ref_for(&snapshot);
        let finished = record_success(&tx, ctx, store.now(), snapshot, result_ref)
            .and_then(|()| tx.commit().map_err(DecisioningError::from));
        broker.log_event(
            &ctx.actor,
            Some(&ctx.intent_ref),
            "idempotency.succeed",
            if finished.is_ok() { "success" } else { "error" },
        )?;
        finished?;
        Ok((value, false))
    }

    fn mark_failed(
        &self,
        store: &Store,
        ctx: &CallContext,
        code: &str,
        message: &str,
    ) -> Result<(), DecisioningError> {
        let now = store.now();
        let broker = store.broker();
        let mut conn = broker.connect()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let recorded = record_failure(&tx, ctx, now, code, message)
            .and_then(|()| tx.commit().map_err(DecisioningError::from));

        // The row is settled first; audit lines after a failure are best-effort.
        let _ = broker.log_event(&ctx.actor, Some(&ctx.intent_ref), "idempotency.execute", "error");
        let _ = broker.log_event(
            &ctx.actor,
            Some(&ctx.intent_ref),
            "idempotency.fail",
            if recorded.is_ok() { "success" } else { "error" },
        );
        recorded
    }
}

/// An [`Idempotent`] bound to a store and an operation.
pub struct IdempotentFn<'a, A, F> {
    wrapper: &'a Idempotent<A>,
    store: &'a Store,
    op: F,
}

impl<A, F> fmt::Debug for IdempotentFn<'_, A, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdempotentFn")
            .field("wrapper", self.wrapper)
            .field("store", &self.store.root)
            .finish()
    }
}

impl<A, F> IdempotentFn<'_, A, F> {
    pub fn call<T, E>(&self, args: &A) -> Result<T, IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: Fn(&Transaction<'_>, &A) -> Result<T, E>,
    {
        self.wrapper.call(self.store, args, |tx, a| (self.op)(tx, a))
    }

    pub fn invoke<T, E>(&self, args: &A) -> Result<Invocation<T>, IdempotentError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: fmt::Display,
        F: Fn(&Transaction<'_>, &A) -> Result<T, E>,
    {
        self.wrapper.invoke(self.store, args, |tx, a| (self.op)(tx, a))
    }
}

// --- Bookkeeping steps ---

#[derive(Debug, Clone)]
struct CallContext {
    scope: String,
    key: String,
    intent_ref: String,
    request_hash: String,
    ttl: Option<Duration>,
    actor: String,
}

impl CallContext {
    fn new_key(&self, now: Timestamp) -> NewKey {
        NewKey::processing(&self.scope, &self.key, now)
            .request_hash(self.request_hash.clone())
            .expires_at(self.ttl.map(|ttl| now + ttl))
    }
}

enum Acquired {
    Execute,
    Replay(IdempotencyRecord),
}

fn request_hash(fingerprint: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Last path segment of `E`'s type name, generics stripped.
fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Fetch-or-create under the caller's immediate transaction.
fn acquire(conn: &Connection, ctx: &CallContext, now: Timestamp) -> Result<Acquired, DecisioningError> {
    let Some(mut record) = idempotency::get_key(conn, &ctx.scope, &ctx.key)? else {
        idempotency::create_key(conn, &ctx.new_key(now))?;
        return Ok(Acquired::Execute);
    };

    if !ctx.request_hash.is_empty()
        && !record.request_hash.is_empty()
        && record.request_hash != ctx.request_hash
    {
        return Err(DecisioningError::RequestMismatch {
            scope: ctx.scope.clone(),
            key: ctx.key.clone(),
        });
    }

    if record.state == IdempotencyState::Succeeded {
        return Ok(Acquired::Replay(record));
    }

    record.begin_processing(now)?;
    if record.request_hash.is_empty() {
        record.request_hash = ctx.request_hash.clone();
    }
    idempotency::save_key(conn, &record)?;
    Ok(Acquired::Execute)
}

fn replay<T: DeserializeOwned>(
    store: &Store,
    ctx: &CallContext,
    record: &IdempotencyRecord,
) -> Result<T, DecisioningError> {
    store
        .broker()
        .log_event(&ctx.actor, Some(&ctx.intent_ref), "idempotency.replay", "success")?;
    let snapshot = record.response_snapshot.clone().unwrap_or(JsonValue::Null);
    Ok(serde_json::from_value(snapshot)?)
}

/// Reload and move to SUCCEEDED. A record another caller already finished is
/// left as it is; one removed by a sweep mid-flight is recreated.
fn record_success(
    conn: &Connection,
    ctx: &CallContext,
    now: Timestamp,
    snapshot: JsonValue,
    result_ref: Option<EntityRef>,
) -> Result<(), DecisioningError> {
    let mut record = match idempotency::get_key(conn, &ctx.scope, &ctx.key)? {
        Some(record) => record,
        None => idempotency::create_key(conn, &ctx.new_key(now))?,
    };
    if record.state == IdempotencyState::Succeeded {
        return Ok(());
    }
    if record.state != IdempotencyState::Processing {
        record.begin_processing(now)?;
    }
    record.succeed(snapshot, result_ref)?;
    idempotency::save_key(conn, &record)
}

/// Reload and move to FAILED, creating the row if it is gone. Never
/// overwrites a success.
fn record_failure(
    conn: &Connection,
    ctx: &CallContext,
    now: Timestamp,
    code: &str,
    message: &str,
) -> Result<(), DecisioningError> {
    let mut record = match idempotency::get_key(conn, &ctx.scope, &ctx.key)? {
        Some(record) => record,
        None => idempotency::create_key(conn, &ctx.new_key(now))?,
    };
    if record.state == IdempotencyState::Succeeded {
        return Ok(());
    }
    if record.state != IdempotencyState::Processing {
        record.begin_processing(now)?;
    }
    record.fail(code, message)?;
    idempotency::save_key(conn, &record)
}
