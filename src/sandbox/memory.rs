// src/sandbox/memory.rs
//! A scripted, in-process sandbox.
//!
//! Source code is not interpreted: each piece of code the host expects to run
//! is registered up front as an async script. Scopes, bindings, shelters and
//! time limits behave like the real collaborator so the grader can be driven
//! end to end without an interpreter.

use futures::future::{BoxFuture, FutureExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::config::{DEFAULT_TIMELIMIT_MS, EvaluateOptions};
use crate::errors::{GradeError, Result};
use crate::feedback::escape_html;
use crate::sandbox::{
    Binding, Container, EnvironmentManager, Evaluator, LastRun, SandboxValue, Shelter, ValueKind,
};

/// Label of the root scope every sandbox starts with.
pub const GLOBAL_SCOPE: &str = "global";

pub type Script = Arc<dyn Fn(Env) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A callable sandbox value.
#[derive(Clone)]
pub struct Function(Script);

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function(..)")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MemoryScope {
    pub label: String,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub classes: Vec<String>,
    pub attrs: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Object(Object),
    Function(Function),
    Scope(MemoryScope),
    /// A value whose class tags cannot be read.
    Unclassable,
    /// A value that fails to render to markup.
    Unrenderable,
}

impl Value {
    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn object<I, K>(classes: &[&str], attrs: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object(Object {
            classes: classes.iter().map(|c| c.to_string()).collect(),
            attrs: attrs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        })
    }

    /// A structured grade, tagged the way grading helpers tag their results.
    pub fn grade(kind: &str, correct: bool, message: &str) -> Self {
        Value::object(
            &["gradethis_graded", "condition"],
            [
                ("type", Value::str(kind)),
                ("correct", Value::Bool(correct)),
                ("message", Value::str(message)),
            ],
        )
    }

    pub fn function<F, Fut>(f: F) -> Self
    where
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Value::Function(Function(Arc::new(move |env| f(env).boxed())))
    }

    fn describe(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(true) => "[1] TRUE".to_string(),
            Value::Bool(false) => "[1] FALSE".to_string(),
            Value::Int(n) => format!("[1] {}", n),
            Value::Str(s) => format!("[1] \"{}\"", s),
            Value::Object(obj) => format!(
                "<{}>",
                obj.classes.first().map(String::as_str).unwrap_or("object")
            ),
            Value::Function(_) => "function(env)".to_string(),
            Value::Scope(scope) => format!("<environment: {}>", scope.label),
            Value::Unclassable => "<opaque>".to_string(),
            Value::Unrenderable => "<unrenderable>".to_string(),
        }
    }
}

impl SandboxValue for Value {
    async fn kind(&self) -> Result<ValueKind> {
        Ok(match self {
            Value::Null => ValueKind::Null,
            Value::Function(_) => ValueKind::Callable,
            _ => ValueKind::Other,
        })
    }

    async fn classes(&self) -> Result<Vec<String>> {
        let class = match self {
            Value::Null => "NULL",
            Value::Bool(_) => "logical",
            Value::Int(_) => "integer",
            Value::Str(_) => "character",
            Value::Object(obj) => return Ok(obj.classes.clone()),
            Value::Function(_) => "function",
            Value::Scope(_) => "environment",
            Value::Unrenderable => "unrenderable",
            Value::Unclassable => {
                return Err(GradeError::Conversion(
                    "class attribute could not be read".to_string(),
                ));
            }
        };
        Ok(vec![class.to_string()])
    }

    async fn get(&self, name: &str) -> Result<Option<Value>> {
        match self {
            Value::Object(obj) => Ok(obj.attrs.get(name).cloned()),
            _ => Ok(None),
        }
    }

    async fn to_text(&self) -> Result<String> {
        match self {
            Value::Str(s) => Ok(s.clone()),
            Value::Bool(true) => Ok("TRUE".to_string()),
            Value::Bool(false) => Ok("FALSE".to_string()),
            Value::Int(n) => Ok(n.to_string()),
            other => Err(GradeError::Conversion(format!(
                "cannot coerce {} to text",
                other.describe()
            ))),
        }
    }

    async fn to_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(n) => Ok(*n != 0),
            other => Err(GradeError::Conversion(format!(
                "cannot coerce {} to logical",
                other.describe()
            ))),
        }
    }
}

/// Snapshot of everything visible from a scope, handed to scripts.
#[derive(Debug, Clone)]
pub struct Env {
    pub label: String,
    pub bindings: BTreeMap<String, Value>,
}

impl Env {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }
}

#[derive(Debug, Default)]
struct ScopeData {
    parent: Option<String>,
    bindings: BTreeMap<String, Value>,
}

pub struct MemoryEnvironments {
    scopes: RwLock<HashMap<String, ScopeData>>,
}

impl MemoryEnvironments {
    pub fn new() -> Self {
        let mut scopes = HashMap::new();
        scopes.insert(GLOBAL_SCOPE.to_string(), ScopeData::default());
        Self {
            scopes: RwLock::new(scopes),
        }
    }

    pub async fn assign(&self, scope: &str, name: &str, value: Value) -> Result<()> {
        let mut scopes = self.scopes.write().await;
        let data = scopes
            .get_mut(scope)
            .ok_or_else(|| GradeError::ScopeNotFound(scope.to_string()))?;
        data.bindings.insert(name.to_string(), value);
        Ok(())
    }

    /// Names bound directly in `scope`, ignoring anything inherited.
    pub async fn bound_names(&self, scope: &str) -> Result<Vec<String>> {
        let scopes = self.scopes.read().await;
        let data = scopes
            .get(scope)
            .ok_or_else(|| GradeError::ScopeNotFound(scope.to_string()))?;
        Ok(data.bindings.keys().cloned().collect())
    }

    /// Resolves `name` from `scope`, walking up through its parents.
    pub async fn lookup(&self, scope: &str, name: &str) -> Result<Option<Value>> {
        Ok(self.snapshot(scope).await?.bindings.remove(name))
    }

    pub async fn snapshot(&self, scope: &str) -> Result<Env> {
        let scopes = self.scopes.read().await;
        if !scopes.contains_key(scope) {
            return Err(GradeError::ScopeNotFound(scope.to_string()));
        }

        let mut chain = Vec::new();
        let mut current = Some(scope);
        while let Some(label) = current {
            // A re-created ancestor can close a loop; stop once every scope was seen.
            if chain.len() > scopes.len() {
                break;
            }
            let Some(data) = scopes.get(label) else { break };
            chain.push(data);
            current = data.parent.as_deref();
        }

        let mut bindings = BTreeMap::new();
        for data in chain.iter().rev() {
            for (name, value) in &data.bindings {
                bindings.insert(name.clone(), value.clone());
            }
        }

        Ok(Env {
            label: scope.to_string(),
            bindings,
        })
    }
}

impl Default for MemoryEnvironments {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvironmentManager for MemoryEnvironments {
    type Scope = MemoryScope;

    async fn create(&self, label: &str, parent: &str) -> Result<MemoryScope> {
        let mut scopes = self.scopes.write().await;
        if !scopes.contains_key(parent) {
            return Err(GradeError::ScopeNotFound(parent.to_string()));
        }
        scopes.insert(
            label.to_string(),
            ScopeData {
                parent: Some(parent.to_string()),
                bindings: BTreeMap::new(),
            },
        );
        log::debug!("Created scope '{}' under '{}'", label, parent);
        Ok(MemoryScope {
            label: label.to_string(),
        })
    }

    async fn get(&self, label: &str) -> Result<MemoryScope> {
        if self.scopes.read().await.contains_key(label) {
            Ok(MemoryScope {
                label: label.to_string(),
            })
        } else {
            Err(GradeError::ScopeNotFound(label.to_string()))
        }
    }
}

/// Counters describing what the sandbox has been asked to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SandboxStats {
    pub shelters_acquired: usize,
    pub shelters_purged: usize,
    pub sheltered_values: usize,
    pub evaluations: usize,
    pub invocations: usize,
}

#[derive(Default)]
struct Counters {
    shelters_acquired: AtomicUsize,
    shelters_purged: AtomicUsize,
    sheltered_values: AtomicUsize,
    evaluations: AtomicUsize,
    invocations: AtomicUsize,
}

struct Inner {
    environments: MemoryEnvironments,
    scripts: RwLock<HashMap<String, Script>>,
    last_run: RwLock<Option<LastRun<Value>>>,
    locked: RwLock<HashSet<String>>,
    counters: Counters,
}

impl Inner {
    async fn run_code(&self, code: &str, scope: &str, timelimit: Duration) -> Result<Value> {
        let env = self.environments.snapshot(scope).await?;
        self.counters.evaluations.fetch_add(1, Ordering::SeqCst);

        let source = code.trim();
        match source {
            "NULL" => return Ok(Value::Null),
            "TRUE" => return Ok(Value::Bool(true)),
            "FALSE" => return Ok(Value::Bool(false)),
            _ => {}
        }

        // A bare name evaluates to its binding.
        if let Some(value) = env.get(source) {
            return Ok(value.clone());
        }

        let script = self
            .scripts
            .read()
            .await
            .get(source)
            .cloned()
            .ok_or_else(|| GradeError::Evaluation(format!("object '{}' not found", source)))?;

        run_with_limit(script(env), timelimit).await
    }
}

async fn run_with_limit(run: BoxFuture<'static, Result<Value>>, limit: Duration) -> Result<Value> {
    tokio::time::timeout(limit, run)
        .await
        .map_err(|_| GradeError::Timeout {
            limit_ms: limit.as_millis() as u64,
        })?
}

/// In-memory sandbox implementing every collaborator the grader consumes.
#[derive(Clone)]
pub struct MemorySandbox {
    inner: Arc<Inner>,
}

impl MemorySandbox {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                environments: MemoryEnvironments::new(),
                scripts: RwLock::new(HashMap::new()),
                last_run: RwLock::new(None),
                locked: RwLock::new(HashSet::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Registers the behaviour of `code`. Evaluating it anywhere runs `script`
    /// against a snapshot of the evaluating scope.
    pub async fn register<F, Fut>(&self, code: &str, script: F)
    where
        F: Fn(Env) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let script: Script = Arc::new(move |env| script(env).boxed());
        self.inner
            .scripts
            .write()
            .await
            .insert(code.trim().to_string(), script);
    }

    /// Creates the prep scope under the global scope and the result scope
    /// under prep, the layout a user-code run leaves behind.
    pub async fn prepare_scopes(&self, prep: &str, result: &str) -> Result<()> {
        self.inner.environments.create(prep, GLOBAL_SCOPE).await?;
        self.inner.environments.create(result, prep).await?;
        Ok(())
    }

    /// Runs the user's code in `scope` and records it as the last run.
    pub async fn run_user_code(&self, exercise: &str, code: &str, scope: &str) -> Result<Value> {
        let limit = Duration::from_millis(DEFAULT_TIMELIMIT_MS);
        let value = self.inner.run_code(code, scope, limit).await?;
        let evaluate_result = Value::object(
            &["evaluate_result"],
            [("source", Value::str(code)), ("value", value.clone())],
        );

        *self.inner.last_run.write().await = Some(LastRun {
            exercise: exercise.to_string(),
            user_code: code.to_string(),
            value: value.clone(),
            evaluate_result,
        });
        Ok(value)
    }

    /// Locks `name` in every scope: any later attempt to bind it fails, as
    /// assigning to a locked binding does in the interpreter.
    pub async fn lock_binding(&self, name: &str) {
        self.inner.locked.write().await.insert(name.to_string());
    }

    pub fn stats(&self) -> SandboxStats {
        let c = &self.inner.counters;
        SandboxStats {
            shelters_acquired: c.shelters_acquired.load(Ordering::SeqCst),
            shelters_purged: c.shelters_purged.load(Ordering::SeqCst),
            sheltered_values: c.sheltered_values.load(Ordering::SeqCst),
            evaluations: c.evaluations.load(Ordering::SeqCst),
            invocations: c.invocations.load(Ordering::SeqCst),
        }
    }
}

impl Default for MemorySandbox {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MemoryShelter {
    inner: Arc<Inner>,
}

impl Shelter for MemoryShelter {
    type Value = Value;
    type Scope = MemoryScope;

    async fn evaluate(&self, code: &str, env: &MemoryScope, options: &EvaluateOptions) -> Result<Value> {
        let value = self.inner.run_code(code, &env.label, options.timelimit).await?;
        self.inner
            .counters
            .sheltered_values
            .fetch_add(1, Ordering::SeqCst);
        Ok(value)
    }

    fn purge(&mut self) {
        self.inner
            .counters
            .shelters_purged
            .fetch_add(1, Ordering::SeqCst);
    }
}

impl Evaluator for MemorySandbox {
    type Value = Value;
    type Scope = MemoryScope;
    type Environments = MemoryEnvironments;
    type Shelter = MemoryShelter;

    fn environments(&self) -> &MemoryEnvironments {
        &self.inner.environments
    }

    async fn evaluate(&self, code: &str, scope: &str, options: &EvaluateOptions) -> Result<Value> {
        self.inner.run_code(code, scope, options.timelimit).await
    }

    async fn invoke(
        &self,
        callable: &Value,
        env: &MemoryScope,
        scope: &str,
        options: &EvaluateOptions,
    ) -> Result<Value> {
        let Value::Function(Function(f)) = callable else {
            return Err(GradeError::Evaluation(
                "attempt to apply non-function".to_string(),
            ));
        };
        // The call site must exist even though the callee only sees `env`.
        self.inner.environments.get(scope).await?;
        let snapshot = self.inner.environments.snapshot(&env.label).await?;
        self.inner.counters.invocations.fetch_add(1, Ordering::SeqCst);
        run_with_limit(f(snapshot), options.timelimit).await
    }

    async fn bind(&self, name: &str, binding: Binding<Value, MemoryScope>, scope: &str) -> Result<()> {
        if self.inner.locked.read().await.contains(name) {
            return Err(GradeError::Evaluation(format!(
                "cannot change value of locked binding for '{}'",
                name
            )));
        }
        let value = match binding {
            Binding::Text(text) => Value::Str(text),
            Binding::Value(value) => value,
            Binding::Scope(handle) => Value::Scope(handle),
        };
        self.inner.environments.assign(scope, name, value).await
    }

    async fn as_html(&self, value: &Value, _options: &EvaluateOptions) -> Result<Container<Value>> {
        if let Value::Unrenderable = value {
            return Err(GradeError::Conversion(
                "value has no HTML representation".to_string(),
            ));
        }
        Ok(Container {
            result: value.clone(),
            markup: format!("<pre><code>{}</code></pre>", escape_html(&value.describe())),
        })
    }

    async fn shelter(&self) -> Result<MemoryShelter> {
        self.inner
            .counters
            .shelters_acquired
            .fetch_add(1, Ordering::SeqCst);
        Ok(MemoryShelter {
            inner: Arc::clone(&self.inner),
        })
    }

    async fn last_run(&self) -> Option<LastRun<Value>> {
        self.inner.last_run.read().await.clone()
    }
}
