use super::{MockConfig, ServiceMock};
use serde_json::{json, Value};

/// Cognito Identity Provider (user pools) has no local emulator, so the handlers get canned responses.
pub struct CognitoIdentityProvider;

impl CognitoIdentityProvider {
    /// The canned responses per operation.
    fn canned(operation: &str) -> Value {
        match operation {
            "GetUser" => json!({
                "UserAttributes": [],
                "Username": "testuser",
                "UserStatus": "CONFIRMED",
            }),
            "AdminCreateUser" => json!({
                "User": {
                    "Username": "testuser",
                    "UserStatus": "CONFIRMED",
                    "UserAttributes": [],
                }
            }),
            // AdminAddUserToGroup returns nothing on success, same as any unknown operation
            _ => json!({}),
        }
    }
}

impl ServiceMock for CognitoIdentityProvider {
    fn service(&self) -> &'static str {
        "CognitoIdentityProvider"
    }

    fn target_prefix(&self) -> &'static str {
        "AWSCognitoIdentityProviderService"
    }

    fn endpoint_env_var(&self) -> &'static str {
        "AWS_ENDPOINT_URL_COGNITO_IDENTITY_PROVIDER"
    }

    fn respond(&self, operation: &str, _args: &Value, config: &MockConfig) -> Value {
        let mut response = Self::canned(operation);

        // the user from the config takes precedence over the canned values
        if let Value::Object(response) = &mut response {
            for (k, v) in &config.user {
                response.insert(k.clone(), v.clone());
            }
        }

        response
    }
}
