//! Flow definitions: the named unit of work a run executes.

mod params;

pub use params::{ParamKind, ParameterSchema, ParameterSpec, Parameters};

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;

use crate::error::{RunNameError, ValidationError};

pub type FlowFuture = BoxFuture<'static, anyhow::Result<Value>>;

type AsyncFn = dyn Fn(Parameters) -> FlowFuture + Send + Sync;
type BlockingFn = dyn Fn(Parameters) -> anyhow::Result<Value> + Send + Sync;
type NameFn = dyn Fn(&Parameters) -> anyhow::Result<String> + Send + Sync;

/// The callable body of a flow.
#[derive(Clone)]
pub enum FlowFn {
    Async(Arc<AsyncFn>),
    Blocking(Arc<BlockingFn>),
}

/// How a run's display name is derived from its parameters.
#[derive(Clone)]
pub enum RunName {
    /// `"name is {x}"` style template over parameter names.
    Template(String),
    Resolver(Arc<NameFn>),
}

/// Execution strategy handed to the run context. The engine does not interpret it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskRunner {
    #[default]
    Concurrent,
    Sequential,
}

#[derive(Clone)]
pub struct Flow {
    name: String,
    version: Option<String>,
    description: Option<String>,
    func: FlowFn,
    parameters: ParameterSchema,
    run_name: Option<RunName>,
    validate_parameters: bool,
    log_prints: bool,
    task_runner: TaskRunner,
    retries: u32,
    tags: Vec<String>,
    capture_error_causes: bool,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("parameters", &self.parameters)
            .field("validate_parameters", &self.validate_parameters)
            .field("log_prints", &self.log_prints)
            .field("task_runner", &self.task_runner)
            .field("retries", &self.retries)
            .field("tags", &self.tags)
            .finish_non_exhaustive()
    }
}

impl Flow {
    fn with_fn(name: impl Into<String>, func: FlowFn) -> Self {
        Self {
            name: name.into(),
            version: None,
            description: None,
            func,
            parameters: ParameterSchema::default().allow_extra(true),
            run_name: None,
            validate_parameters: true,
            log_prints: false,
            task_runner: TaskRunner::default(),
            retries: 0,
            tags: Vec::new(),
            capture_error_causes: true,
        }
    }

    /// Build a flow from an async body.
    ///
    /// Until a schema is set with [`with_parameters`](Self::with_parameters) every
    /// parameter is passed through unchecked.
    pub fn from_async<F, Fut, T>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Serialize + 'static,
    {
        let func = move |params: Parameters| -> FlowFuture {
            f(params)
                .map(|out| out.and_then(|value| Ok(serde_json::to_value(value)?)))
                .boxed()
        };
        Self::with_fn(name, FlowFn::Async(Arc::new(func)))
    }

    /// Build a flow from a blocking body. Parameters pass through unchecked
    /// until a schema is set.
    pub fn from_blocking<F, T>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Parameters) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Serialize + 'static,
    {
        let func = move |params: Parameters| -> anyhow::Result<Value> {
            Ok(serde_json::to_value(f(params)?)?)
        };
        Self::with_fn(name, FlowFn::Blocking(Arc::new(func)))
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_parameters(mut self, schema: ParameterSchema) -> Self {
        self.parameters = schema;
        self
    }

    pub fn with_run_name(mut self, template: impl Into<String>) -> Self {
        self.run_name = Some(RunName::Template(template.into()));
        self
    }

    pub fn with_run_name_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&Parameters) -> anyhow::Result<String> + Send + Sync + 'static,
    {
        self.run_name = Some(RunName::Resolver(Arc::new(f)));
        self
    }

    pub fn with_validation(mut self, validate: bool) -> Self {
        self.validate_parameters = validate;
        self
    }

    pub fn with_log_prints(mut self, log_prints: bool) -> Self {
        self.log_prints = log_prints;
        self
    }

    pub fn with_task_runner(mut self, task_runner: TaskRunner) -> Self {
        self.task_runner = task_runner;
        self
    }

    /// Number of retries the orchestrator may grant after a failed attempt.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    /// Whether failed states record the source chain of the error.
    pub fn with_error_causes(mut self, capture: bool) -> Self {
        self.capture_error_causes = capture;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn parameter_schema(&self) -> &ParameterSchema {
        &self.parameters
    }

    pub fn should_validate_parameters(&self) -> bool {
        self.validate_parameters
    }

    pub fn log_prints(&self) -> bool {
        self.log_prints
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.task_runner
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn captures_error_causes(&self) -> bool {
        self.capture_error_causes
    }

    /// Key identifying this flow when it is registered as a child work record.
    pub fn task_key(&self) -> String {
        match &self.version {
            Some(version) => format!("{}@{version}", self.name),
            None => self.name.clone(),
        }
    }

    pub fn validate_parameters(&self, parameters: &Parameters) -> Result<Parameters, ValidationError> {
        self.parameters.validate(parameters)
    }

    /// Resolve the custom run name, `Ok(None)` when the flow declares none.
    pub fn resolve_run_name(&self, parameters: &Parameters) -> Result<Option<String>, RunNameError> {
        match &self.run_name {
            None => Ok(None),
            Some(RunName::Template(template)) => render_template(template, parameters).map(Some),
            Some(RunName::Resolver(f)) => f(parameters)
                .map(Some)
                .map_err(|err| RunNameError::Resolver(err.to_string())),
        }
    }

    /// Invoke the flow body.
    pub async fn invoke(&self, parameters: Parameters) -> anyhow::Result<Value> {
        match &self.func {
            FlowFn::Async(f) => f(parameters).await,
            FlowFn::Blocking(f) => f(parameters),
        }
    }
}

fn render_template(template: &str, parameters: &Parameters) -> Result<String, RunNameError> {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(k) => key.push(k),
                        None => {
                            return Err(RunNameError::Malformed(format!(
                                "unclosed placeholder in {template:?}"
                            )));
                        }
                    }
                }
                let key = key.trim();
                match parameters.get(key) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => return Err(RunNameError::UnknownParameter(key.to_string())),
                }
            }
            '}' => {
                return Err(RunNameError::Malformed(format!(
                    "unmatched '}}' in {template:?}"
                )));
            }
            c => out.push(c),
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Parameters {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn basic_init_defaults() {
        let flow = Flow::from_blocking("foo", |_| Ok(42));
        assert_eq!(flow.name(), "foo");
        assert!(flow.should_validate_parameters());
        assert!(!flow.log_prints());
        assert_eq!(flow.retries(), 0);
        assert_eq!(flow.task_runner(), TaskRunner::Concurrent);
        assert_eq!(flow.task_key(), "foo");
    }

    #[test]
    fn undeclared_schema_passes_parameters_through() {
        let flow = Flow::from_blocking("foo", |_| Ok(()));
        let supplied = params(json!({"x": "blue", "n": 3}));
        assert_eq!(flow.validate_parameters(&supplied).unwrap(), supplied);

        let strict = flow.with_parameters(ParameterSchema::new().required("n", ParamKind::Int));
        assert!(strict.validate_parameters(&supplied).is_err());
    }

    #[test]
    fn task_key_includes_version() {
        let flow = Flow::from_blocking("foo", |_| Ok(())).with_version("1.2");
        assert_eq!(flow.task_key(), "foo@1.2");
    }

    #[test]
    fn template_run_name() {
        let flow = Flow::from_blocking("foo", |_| Ok(())).with_run_name("name is {x}");
        let name = flow.resolve_run_name(&params(json!({"x": "blue"}))).unwrap();
        assert_eq!(name.as_deref(), Some("name is blue"));
    }

    #[test]
    fn template_renders_non_strings_and_escapes() {
        let flow = Flow::from_blocking("foo", |_| Ok(())).with_run_name("{{run}} {n}");
        let name = flow.resolve_run_name(&params(json!({"n": 3}))).unwrap();
        assert_eq!(name.as_deref(), Some("{run} 3"));
    }

    #[test]
    fn template_unknown_parameter_is_an_error() {
        let flow = Flow::from_blocking("foo", |_| Ok(())).with_run_name("name is {missing}");
        assert_eq!(
            flow.resolve_run_name(&Parameters::new()).unwrap_err(),
            RunNameError::UnknownParameter("missing".into())
        );
    }

    #[test]
    fn resolver_failure_is_reported() {
        let flow = Flow::from_blocking("foo", |_| Ok(()))
            .with_run_name_fn(|_| Err(anyhow::anyhow!("no name today")));
        assert!(matches!(
            flow.resolve_run_name(&Parameters::new()),
            Err(RunNameError::Resolver(_))
        ));
    }

    #[tokio::test]
    async fn invoke_async_body_serializes_result() {
        let flow = Flow::from_async("bar", |params: Parameters| async move {
            Ok((params["x"].clone(), "nate"))
        });
        let out = flow.invoke(params(json!({"x": 42}))).await.unwrap();
        assert_eq!(out, json!([42, "nate"]));
    }

    #[tokio::test]
    async fn invoke_blocking_body_propagates_error() {
        let flow = Flow::from_blocking("bad", |_| -> anyhow::Result<()> {
            anyhow::bail!("xyz")
        });
        let err = flow.invoke(Parameters::new()).await.unwrap_err();
        assert_eq!(err.to_string(), "xyz");
    }
}
