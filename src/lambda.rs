//! Lambda handlers as seen by the emulator: the handler trait, the invocation context
//! and the resolvers that turn config entries into callable handlers.

use crate::config::HandlerSpec;
use crate::error::{EmulatorError, EmulatorResult};
use crate::event::ACCOUNT_ID;
use crate::mocks::{MockRegistry, ServiceDispatcher};
use async_trait::async_trait;
use lambda_runtime::Context;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Duration;
use tracing::{debug, info, warn};

/// Same as the error type of the lambda runtime so that handler code can use `?` freely.
pub type Error = lambda_runtime::Error;

/// Deadline reported to handlers when no timeout is configured (2034).
const NO_DEADLINE_MS: u64 = 2035313041000;

/// Everything a handler gets besides the event.
#[derive(Clone, Debug)]
pub struct InvocationContext {
    /// The platform context. Cron jobs are invoked without one.
    pub lambda: Option<Context>,
    /// Routes outbound AWS calls to mocks or to the real services.
    pub services: ServiceDispatcher,
}

impl InvocationContext {
    /// HTTP invocations get a fresh request ID and their Cognito calls are mocked.
    pub fn http(request_id: &str, function_name: &str, mocks: Arc<MockRegistry>) -> Self {
        Self {
            lambda: Some(lambda_context(request_id, function_name)),
            services: ServiceDispatcher::Intercepting(mocks),
        }
    }

    /// Stream invocations get a platform context, but no mocks.
    pub fn stream(function_name: &str) -> Self {
        Self {
            lambda: Some(lambda_context(&uuid::Uuid::new_v4().to_string(), function_name)),
            services: ServiceDispatcher::PassThrough,
        }
    }

    /// Cron jobs get no platform context and no mocks.
    pub fn cron() -> Self {
        Self {
            lambda: None,
            services: ServiceDispatcher::PassThrough,
        }
    }
}

fn lambda_context(request_id: &str, function_name: &str) -> Context {
    let mut ctx = Context::default();
    ctx.request_id = request_id.to_owned();
    ctx.deadline = NO_DEADLINE_MS;
    ctx.invoked_function_arn = ["arn:aws:lambda:us-east-1:", ACCOUNT_ID, ":function:", function_name].concat();
    ctx
}

/// A lambda function the emulator can invoke.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Used in logs and error messages.
    fn name(&self) -> &str;

    async fn call(&self, event: Value, ctx: InvocationContext) -> Result<Value, Error>;
}

/// A handler made from an async closure. See [handler_fn].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, Error>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: Value, ctx: InvocationContext) -> Result<Value, Error> {
        (self.f)(event, ctx).await
    }
}

/// Wraps an async function into a [Handler], e.g.
/// `handler_fn("hello", |event, _ctx| async move { Ok(json!({"body": "hi"})) })`.
pub fn handler_fn<F, Fut>(name: &str, f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, InvocationContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, Error>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.to_owned(),
        f,
    })
}

/// Runs the handler on a separate task so that a panic inside the handler cannot take down
/// the caller. Errors, panics and timeouts are all reported as [EmulatorError::HandlerFault].
/// The invocation is not limited in time if `timeout` is None.
pub async fn invoke(
    handler: &Arc<dyn Handler>,
    event: Value,
    ctx: InvocationContext,
    timeout: Option<Duration>,
) -> EmulatorResult<Value> {
    let name = handler.name().to_owned();
    let handler = Arc::clone(handler);
    let mut task = tokio::task::spawn(async move { handler.call(event, ctx).await });

    let joined = match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, &mut task).await {
            Ok(v) => v,
            Err(_) => {
                task.abort();
                return Err(EmulatorError::handler_fault(name, format!("timed out after {timeout:?}")));
            }
        },
        None => task.await,
    };

    match joined {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(EmulatorError::handler_fault(name, e)),
        Err(e) if e.is_panic() => Err(EmulatorError::handler_fault(name, "handler panicked")),
        Err(e) => Err(EmulatorError::handler_fault(name, e)),
    }
}

/// Turns a handler entry from the config into something that can be invoked.
/// Resolution happens once per binding at startup.
pub trait Resolver: Send + Sync {
    fn resolve(&self, spec: &HandlerSpec) -> EmulatorResult<Arc<dyn Handler>>;
}

/// Handlers registered in-process, looked up by `path` + `handler`.
#[derive(Default)]
pub struct Registry {
    handlers: HashMap<HandlerSpec, Arc<dyn Handler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: HandlerSpec, handler: Arc<dyn Handler>) -> &mut Self {
        self.handlers.insert(spec, handler);
        self
    }

    pub fn with(mut self, spec: HandlerSpec, handler: Arc<dyn Handler>) -> Self {
        self.register(spec, handler);
        self
    }
}

impl Resolver for Registry {
    fn resolve(&self, spec: &HandlerSpec) -> EmulatorResult<Arc<dyn Handler>> {
        self.handlers
            .get(spec)
            .cloned()
            .ok_or_else(|| EmulatorError::Configuration(format!("no handler registered for {}", spec.display_name())))
    }
}

/// Resolves handlers to executables under the lambda root folder.
/// The executable gets the event as JSON on stdin and must print the JSON result to stdout.
pub struct CommandResolver {
    root: PathBuf,
    /// URL of the dev server for the mocked AWS services, e.g. http://127.0.0.1:8080
    mock_endpoint: Option<String>,
}

impl CommandResolver {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            mock_endpoint: None,
        }
    }

    /// Child processes invoked over HTTP are pointed at this endpoint for mocked services.
    pub fn with_mock_endpoint<S: Into<String>>(mut self, endpoint: S) -> Self {
        self.mock_endpoint = Some(endpoint.into());
        self
    }
}

impl Resolver for CommandResolver {
    fn resolve(&self, spec: &HandlerSpec) -> EmulatorResult<Arc<dyn Handler>> {
        let dir = self.root.join(&spec.path);
        if !dir.is_dir() {
            return Err(EmulatorError::Configuration(format!(
                "lambda folder {} does not exist",
                dir.display()
            )));
        }

        let mut parts = spec.handler.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| EmulatorError::Configuration(format!("empty handler for {}", spec.path)))?;
        let args = parts.map(str::to_owned).collect();

        // a file in the lambda folder wins over a command on PATH, e.g. `python3 handler.py`
        let local_program = dir.join(program);
        let program = if local_program.is_file() {
            local_program
        } else {
            debug!("{} not found in {}, using PATH", program, dir.display());
            PathBuf::from(program)
        };

        let function_name = dir
            .file_name()
            .map(|v| v.to_string_lossy().to_string())
            .unwrap_or_else(|| spec.path.clone());

        Ok(Arc::new(CommandHandler {
            name: spec.display_name(),
            function_name,
            handler: spec.handler.clone(),
            program,
            args,
            dir,
            mock_endpoint: self.mock_endpoint.clone(),
        }))
    }
}

/// A lambda run as a child process, one process per invocation.
pub struct CommandHandler {
    name: String,
    function_name: String,
    handler: String,
    program: PathBuf,
    args: Vec<String>,
    dir: PathBuf,
    mock_endpoint: Option<String>,
}

#[async_trait]
impl Handler for CommandHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, event: Value, ctx: InvocationContext) -> Result<Value, Error> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .current_dir(&self.dir)
            .env("AWS_LAMBDA_FUNCTION_NAME", &self.function_name)
            .env("_HANDLER", &self.handler)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(lambda) = &ctx.lambda {
            cmd.env("AWS_LAMBDA_REQUEST_ID", &lambda.request_id);
        }

        // only intercepted invocations talk to the mocks
        if let (ServiceDispatcher::Intercepting(mocks), Some(endpoint)) = (&ctx.services, &self.mock_endpoint) {
            for var in mocks.endpoint_env_vars() {
                cmd.env(var, endpoint);
            }
        }

        let mut child = cmd.spawn()?;

        // write the event concurrently with reading the output to avoid filling up the pipes
        let payload = serde_json::to_vec(&event)?;
        if let Some(mut stdin) = child.stdin.take() {
            let name = self.name.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("{name} did not read the event: {e}");
                }
            });
        }

        let output = child.wait_with_output().await?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(format!("{} exited with {}: {}", self.name, output.status, stderr.trim()).into());
        }
        if !stderr.trim().is_empty() {
            info!("{}:\n{}", self.name, stderr.trim_end());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }

        match serde_json::from_str(stdout.trim()) {
            Ok(v) => Ok(v),
            Err(e) => {
                warn!("{} printed non-JSON output:\n{}", self.name, stdout);
                Err(format!("invalid JSON output: {e}").into())
            }
        }
    }
}
