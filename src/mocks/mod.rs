//! Interception of outbound AWS calls made by the handlers.
//!
//! Some AWS services have no local substitute, so calls to them are answered with canned responses.
//! The interception is not global: every invocation carries its own [ServiceDispatcher] in its
//! context, so an intercepted HTTP invocation cannot leak mocks into a concurrent stream or cron one.

use crate::config::Config;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub mod cognito;

/// Overrides for the mocked responses. Read once from the config file.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockConfig {
    /// Shallow-merged over every mocked response
    pub user: Map<String, Value>,
}

impl From<&Config> for MockConfig {
    fn from(config: &Config) -> Self {
        Self {
            user: config.user.clone(),
        }
    }
}

/// A mocked AWS service.
pub trait ServiceMock: Send + Sync {
    /// The service name used by the AWS SDKs, e.g. `CognitoIdentityProvider`.
    fn service(&self) -> &'static str;

    /// The prefix of the `X-Amz-Target` header for the AWS JSON protocol,
    /// e.g. `AWSCognitoIdentityProviderService`.
    fn target_prefix(&self) -> &'static str;

    /// The env var the AWS SDKs read to override the endpoint of this service,
    /// e.g. `AWS_ENDPOINT_URL_COGNITO_IDENTITY_PROVIDER`.
    fn endpoint_env_var(&self) -> &'static str;

    /// Returns the response for the operation. Unknown operations get an empty object.
    fn respond(&self, operation: &str, args: &Value, config: &MockConfig) -> Value;
}

/// All mocked services plus the config overrides.
pub struct MockRegistry {
    mocks: Vec<Box<dyn ServiceMock>>,
    config: Arc<MockConfig>,
}

impl MockRegistry {
    /// Creates a registry with all built-in mocks.
    pub fn new(config: Arc<MockConfig>) -> Self {
        Self {
            mocks: vec![Box::new(cognito::CognitoIdentityProvider)],
            config,
        }
    }

    fn find(&self, service: &str) -> Option<&dyn ServiceMock> {
        self.mocks.iter().find(|m| m.service() == service).map(|m| m.as_ref())
    }

    /// Returns the mocked response or None if the service is not mocked.
    pub fn mock(&self, service: &str, operation: &str, args: &Value) -> Option<Value> {
        let mock = self.find(service)?;
        debug!("Mocked {service}.{operation}");
        Some(mock.respond(operation, args, &self.config))
    }

    /// Env vars that redirect the SDK clients of child processes to the mock endpoint.
    pub fn endpoint_env_vars(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.mocks.iter().map(|m| m.endpoint_env_var())
    }

    /// Splits an `X-Amz-Target` value into the mocked service name and the operation name, e.g.
    /// `AWSCognitoIdentityProviderService.GetUser` -> `("CognitoIdentityProvider", "GetUser")`.
    pub fn resolve_target(&self, target: &str) -> Option<(&'static str, String)> {
        let (prefix, operation) = target.split_once('.')?;
        let mock = self.mocks.iter().find(|m| m.target_prefix() == prefix)?;
        Some((mock.service(), operation.to_owned()))
    }
}

/// Decides whether an outbound call goes to a mock or to the real service.
/// Cloning is cheap.
#[derive(Clone)]
pub enum ServiceDispatcher {
    /// Calls to mocked services are answered locally
    Intercepting(Arc<MockRegistry>),
    /// All calls go to the real services
    PassThrough,
}

impl ServiceDispatcher {
    pub fn is_intercepting(&self) -> bool {
        matches!(self, Self::Intercepting(_))
    }

    /// Routes an outbound call.
    /// * `service` - the SDK client name, e.g. `CognitoIdentityProvider`
    /// * `real_call` - performs the genuine call, only invoked for services that are not mocked
    pub async fn dispatch<F, Fut, E>(&self, service: &str, operation: &str, args: Value, real_call: F) -> Result<Value, E>
    where
        F: FnOnce(Value) -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Self::Intercepting(registry) = self {
            if let Some(response) = registry.mock(service, operation, &args) {
                return Ok(response);
            }
        }

        real_call(args).await
    }
}

impl std::fmt::Debug for ServiceDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intercepting(_) => f.write_str("ServiceDispatcher::Intercepting"),
            Self::PassThrough => f.write_str("ServiceDispatcher::PassThrough"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(user: Value) -> Arc<MockRegistry> {
        let user = match user {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        Arc::new(MockRegistry::new(Arc::new(MockConfig { user })))
    }

    #[tokio::test]
    async fn mocked_service_never_reaches_the_real_call() {
        let calls = AtomicUsize::new(0);
        let dispatcher = ServiceDispatcher::Intercepting(registry(json!({})));

        let resp: Result<Value, String> = dispatcher
            .dispatch("CognitoIdentityProvider", "GetUser", json!({"AccessToken": "t"}), |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<Value, String>(json!({"real": true}))
            })
            .await;

        assert_eq!(
            resp.unwrap(),
            json!({"UserAttributes": [], "Username": "testuser", "UserStatus": "CONFIRMED"})
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn other_services_pass_through() {
        let dispatcher = ServiceDispatcher::Intercepting(registry(json!({})));

        let resp: Result<Value, String> = dispatcher
            .dispatch("S3", "ListBuckets", json!({}), |args| async move { Ok::<Value, String>(json!({"args": args})) })
            .await;

        assert_eq!(resp.unwrap(), json!({"args": {}}));
    }

    #[tokio::test]
    async fn pass_through_dispatcher_does_not_mock() {
        let resp: Result<Value, String> = ServiceDispatcher::PassThrough
            .dispatch("CognitoIdentityProvider", "GetUser", json!({}), |_| async {
                Err::<Value, String>("no network".to_owned())
            })
            .await;

        assert_eq!(resp.unwrap_err(), "no network");
        assert!(!ServiceDispatcher::PassThrough.is_intercepting());
    }

    #[test]
    fn override_is_merged() {
        let registry = registry(json!({"Username": "override"}));
        let resp = registry.mock("CognitoIdentityProvider", "GetUser", &json!({})).unwrap();

        assert_eq!(
            resp,
            json!({"UserAttributes": [], "Username": "override", "UserStatus": "CONFIRMED"})
        );
    }

    #[test]
    fn resolves_amz_target() {
        let registry = registry(json!({}));

        assert_eq!(
            registry.resolve_target("AWSCognitoIdentityProviderService.AdminCreateUser"),
            Some(("CognitoIdentityProvider", "AdminCreateUser".to_owned()))
        );
        assert_eq!(registry.resolve_target("DynamoDB_20120810.GetItem"), None);
        assert_eq!(registry.resolve_target("no-dot"), None);
        assert!(registry.mock("CognitoIdentityProvider", "GetUser", &json!({})).is_some());
        assert!(registry.mock("DynamoDB", "GetItem", &json!({})).is_none());
    }
}
