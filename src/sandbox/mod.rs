// src/sandbox/mod.rs

use std::future::Future;
use std::ops::Deref;

use crate::config::EvaluateOptions;
use crate::errors::Result;

pub mod memory;

/// Coarse runtime kind of a sandbox value, enough to dispatch a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Callable,
    Other,
}

/// A handle to a value living inside the sandbox.
///
/// Every accessor crosses the sandbox boundary, so each one is a suspension
/// point and may fail.
pub trait SandboxValue: Clone + Send + Sync {
    fn kind(&self) -> impl Future<Output = Result<ValueKind>> + Send;

    /// Runtime class tags of the value.
    fn classes(&self) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Reads a named attribute. `Ok(None)` means the attribute is absent.
    fn get(&self, name: &str) -> impl Future<Output = Result<Option<Self>>> + Send;

    fn to_text(&self) -> impl Future<Output = Result<String>> + Send;

    fn to_bool(&self) -> impl Future<Output = Result<bool>> + Send;
}

/// Creates and resolves named, hierarchical scopes inside the sandbox.
pub trait EnvironmentManager: Send + Sync {
    type Scope: Clone + Send + Sync;

    /// Creates (or replaces) the scope `label` as a child of `parent`.
    /// Fails with `ScopeNotFound` if `parent` is unresolved.
    fn create(&self, label: &str, parent: &str) -> impl Future<Output = Result<Self::Scope>> + Send;

    fn get(&self, label: &str) -> impl Future<Output = Result<Self::Scope>> + Send;
}

/// A value to be bound into a scope.
#[derive(Debug, Clone)]
pub enum Binding<V, S> {
    Text(String),
    Value(V),
    Scope(S),
}

/// A value materialized for display, keeping the underlying result.
#[derive(Debug, Clone)]
pub struct Container<V> {
    pub result: V,
    pub markup: String,
}

/// What the host recorded about the most recent run of the user's code.
#[derive(Debug, Clone)]
pub struct LastRun<V> {
    pub exercise: String,
    pub user_code: String,
    pub value: V,
    pub evaluate_result: V,
}

/// Tracks sandbox values created while it is held. `purge` releases all of
/// them.
pub trait Shelter: Send + Sync {
    type Value: SandboxValue;
    type Scope;

    fn evaluate(
        &self,
        code: &str,
        env: &Self::Scope,
        options: &EvaluateOptions,
    ) -> impl Future<Output = Result<Self::Value>> + Send;

    fn purge(&mut self);
}

/// Owns a shelter and purges it when dropped, so release happens exactly
/// once on every exit path including cancellation.
pub struct ShelterGuard<S: Shelter> {
    shelter: S,
}

impl<S: Shelter> ShelterGuard<S> {
    pub fn new(shelter: S) -> Self {
        Self { shelter }
    }
}

impl<S: Shelter> Deref for ShelterGuard<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.shelter
    }
}

impl<S: Shelter> Drop for ShelterGuard<S> {
    fn drop(&mut self) {
        log::debug!("Purging grading shelter");
        self.shelter.purge();
    }
}

/// The code-evaluation facility of the sandbox.
pub trait Evaluator: Send + Sync {
    type Value: SandboxValue;
    type Scope: Clone + Send + Sync;
    type Environments: EnvironmentManager<Scope = Self::Scope>;
    type Shelter: Shelter<Value = Self::Value, Scope = Self::Scope>;

    fn environments(&self) -> &Self::Environments;

    /// Runs `code` inside the scope labelled `scope`. Fails with `Timeout`
    /// once `options.timelimit` expires.
    fn evaluate(
        &self,
        code: &str,
        scope: &str,
        options: &EvaluateOptions,
    ) -> impl Future<Output = Result<Self::Value>> + Send;

    /// Calls `callable` with `env` as its only argument, under the same
    /// limits as `evaluate`.
    fn invoke(
        &self,
        callable: &Self::Value,
        env: &Self::Scope,
        scope: &str,
        options: &EvaluateOptions,
    ) -> impl Future<Output = Result<Self::Value>> + Send;

    fn bind(
        &self,
        name: &str,
        binding: Binding<Self::Value, Self::Scope>,
        scope: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    fn as_html(
        &self,
        value: &Self::Value,
        options: &EvaluateOptions,
    ) -> impl Future<Output = Result<Container<Self::Value>>> + Send;

    fn shelter(&self) -> impl Future<Output = Result<Self::Shelter>> + Send;

    fn last_run(&self) -> impl Future<Output = Option<LastRun<Self::Value>>> + Send;
}
