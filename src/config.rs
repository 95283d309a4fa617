use crate::error::{EmulatorError, EmulatorResult};
use crate::event::Identity;
use clap::Parser;
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tracing::{error, info, warn};

/// Used when the route or job does not name the executable, same as the custom runtime convention on AWS.
pub const DEFAULT_HANDLER: &str = "bootstrap";
/// The scheduling interval for cron jobs that do not specify one.
pub const DEFAULT_CRON_INTERVAL: &str = "1m";
/// How often the stream is polled if not set in the config.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
/// Max number of stream records per poll.
pub const DEFAULT_BATCH_SIZE: i32 = 100;
/// The largest `Limit` GetRecords accepts.
pub const MAX_BATCH_SIZE: i32 = 1000;
/// Where DynamoDB Local listens by default.
pub const DEFAULT_STREAM_ENDPOINT: &str = "http://localhost:8000";

/// Command line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "cloudly-dev", version, about = "Local development server for AWS Lambda handlers")]
pub struct Cli {
    /// IP address to listen on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 8080)]
    pub port: u16,

    /// Path to the YAML config file
    #[arg(long, default_value = "Cloudlyfile.yml")]
    pub config: PathBuf,
}

impl Cli {
    pub fn listener(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Points at an executable inside `root`: `<root>/<path>/<handler>`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct HandlerSpec {
    /// Directory of the function, relative to `root`
    pub path: String,
    /// The executable plus optional arguments, e.g. `bootstrap` or `run.sh --verbose`
    #[serde(default = "default_handler")]
    pub handler: String,
}

impl HandlerSpec {
    pub fn new<P: Into<String>, H: Into<String>>(path: P, handler: H) -> Self {
        Self {
            path: path.into(),
            handler: handler.into(),
        }
    }

    /// A short name for logging, e.g. `hello/bootstrap`.
    pub fn display_name(&self) -> String {
        [self.path.as_str(), "/", self.handler.as_str()].concat()
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct RouteConfig {
    #[serde(flatten)]
    pub handler: HandlerSpec,
    /// E.g. `/users/<id>` or `/users/{id}`
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
}

#[derive(Deserialize, Debug, Clone)]
pub struct StreamConfig {
    /// DynamoDB table with streams enabled
    pub table: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: i32,
    #[serde(default)]
    pub bindings: Vec<HandlerSpec>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct CronConfig {
    #[serde(flatten)]
    pub handler: HandlerSpec,
    /// E.g. `500ms`, `10s`, `5m`, `1h` or a bare number of milliseconds
    #[serde(default = "default_interval", deserialize_with = "interval_from_scalar")]
    pub interval: String,
}

/// The contents of the config file. It is read once at startup and never changes after that.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// Root folder for the lambda functions
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Goes into the synthesized JWT claims
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// The identity used for the JWT claims. All of its fields are also merged
    /// into the mocked Cognito responses.
    #[serde(default)]
    pub user: Map<String, Value>,
    /// No limit if not set
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
    /// Entries with missing or mistyped fields are logged and left out.
    #[serde(default, deserialize_with = "routes_from_list")]
    pub routes: Vec<RouteConfig>,
    #[serde(default, deserialize_with = "streams_from_list")]
    pub streams: Vec<StreamConfig>,
    #[serde(default, deserialize_with = "cron_from_list")]
    pub cron: Vec<CronConfig>,
    #[serde(default = "default_stream_endpoint")]
    pub stream_endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: default_root(),
            client_id: default_client_id(),
            user: Map::new(),
            handler_timeout_ms: None,
            routes: Vec::new(),
            streams: Vec::new(),
            cron: Vec::new(),
            stream_endpoint: default_stream_endpoint(),
            region: default_region(),
        }
    }
}

impl Config {
    /// Reads the config from a YAML file.
    /// A missing file is not an error: the server starts with no bindings and serves the landing page only.
    pub async fn from_file(path: &std::path::Path) -> EmulatorResult<Self> {
        let path_str = path.to_string_lossy().to_string();

        let yaml = match tokio::fs::read_to_string(path).await {
            Ok(v) => v,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Config file {path_str} not found. No handlers will be mapped.");
                return Ok(Self::default());
            }
            Err(source) => return Err(EmulatorError::ConfigFile { path: path_str, source }),
        };

        let config = Self::from_yaml(&yaml).map_err(|source| EmulatorError::ConfigFormat {
            path: path_str.clone(),
            source,
        })?;

        info!(
            "Loaded {path_str}: {} route(s), {} stream(s), {} cron job(s)",
            config.routes.len(),
            config.streams.len(),
            config.cron.len()
        );

        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, serde_yaml::Error> {
        // an empty file is a valid, empty config
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml)
    }

    /// Extracts the identity for the synthesized JWT claims from the `user` section.
    pub fn identity(&self) -> Identity {
        let username = self.user.get("username").and_then(Value::as_str).map(str::to_owned);

        let groups = match self.user.get("groups") {
            Some(Value::Array(groups)) => groups
                .iter()
                .map(|g| match g {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .collect(),
            _ => Vec::new(),
        };

        Identity {
            username,
            groups,
            client_id: self.client_id.clone(),
        }
    }
}

/// Converts every entry of a binding list on its own. A malformed entry is logged and dropped,
/// the other entries are kept.
fn skip_malformed<'de, D, T>(deserializer: D, section: &str) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let entries = Option::<Vec<serde_yaml::Value>>::deserialize(deserializer)?.unwrap_or_default();

    let parsed = entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| match serde_yaml::from_value::<T>(entry) {
            Ok(v) => Some(v),
            Err(e) => {
                error!("{}", EmulatorError::Configuration(format!("{section}[{idx}] skipped: {e}")));
                None
            }
        })
        .collect();

    Ok(parsed)
}

fn routes_from_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<RouteConfig>, D::Error> {
    skip_malformed(deserializer, "routes")
}

fn streams_from_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<StreamConfig>, D::Error> {
    skip_malformed(deserializer, "streams")
}

fn cron_from_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<CronConfig>, D::Error> {
    skip_malformed(deserializer, "cron")
}

/// `interval: 500` is a number in YAML, `interval: 500ms` a string. Both are fine.
fn interval_from_scalar<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::String(v) => Ok(v),
        serde_yaml::Value::Number(v) => Ok(v.to_string()),
        other => Err(D::Error::custom(format!("expected an interval, got {other:?}"))),
    }
}

fn default_handler() -> String {
    DEFAULT_HANDLER.to_owned()
}

fn default_method() -> String {
    "GET".to_owned()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_batch_size() -> i32 {
    DEFAULT_BATCH_SIZE
}

fn default_interval() -> String {
    DEFAULT_CRON_INTERVAL.to_owned()
}

fn default_root() -> PathBuf {
    PathBuf::from("lambdas")
}

fn default_client_id() -> String {
    "testclientid".to_owned()
}

fn default_stream_endpoint() -> String {
    DEFAULT_STREAM_ENDPOINT.to_owned()
}

fn default_region() -> String {
    "us-east-1".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
root: functions
client_id: myclient
handler_timeout_ms: 2500
user:
  username: alice
  groups: [admin, editors]
routes:
  - path: hello
    url: /hello/<name>
  - path: users
    url: /users
    method: POST
    handler: run.sh --fast
streams:
  - table: items
    bindings:
      - path: on_change
cron:
  - path: nightly
    interval: 5m
  - path: default_interval
"#;

    #[test]
    fn parses_full_config() {
        let config = Config::from_yaml(SAMPLE).unwrap();

        assert_eq!(config.root, PathBuf::from("functions"));
        assert_eq!(config.client_id, "myclient");
        assert_eq!(config.handler_timeout_ms, Some(2500));

        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[0].method, "GET");
        assert_eq!(config.routes[0].handler, HandlerSpec::new("hello", "bootstrap"));
        assert_eq!(config.routes[1].method, "POST");
        assert_eq!(config.routes[1].handler.handler, "run.sh --fast");

        let stream = &config.streams[0];
        assert_eq!(stream.table, "items");
        assert!(stream.enabled);
        assert_eq!(stream.poll_interval_ms, 100);
        assert_eq!(stream.batch_size, 100);
        assert_eq!(stream.bindings, vec![HandlerSpec::new("on_change", "bootstrap")]);

        assert_eq!(config.cron[0].interval, "5m");
        assert_eq!(config.cron[1].interval, "1m");
        assert_eq!(config.stream_endpoint, "http://localhost:8000");
    }

    #[test]
    fn identity_from_user_section() {
        let config = Config::from_yaml(SAMPLE).unwrap();
        let identity = config.identity();

        assert_eq!(identity.username.as_deref(), Some("alice"));
        assert_eq!(identity.groups, vec!["admin".to_string(), "editors".to_string()]);
        assert_eq!(identity.client_id, "myclient");
    }

    #[test]
    fn empty_yaml_is_default() {
        let config = Config::from_yaml("  \n").unwrap();
        assert!(config.routes.is_empty());
        assert_eq!(config.client_id, "testclientid");
        assert!(config.identity().username.is_none());
    }

    #[test]
    fn malformed_bindings_are_skipped_and_the_rest_survive() {
        let yaml = r#"
routes:
  - { path: a, url: /a }
  - { path: b }
  - { url: /c }
streams:
  - { bindings: [ { path: x } ] }
  - { table: items, batch_size: lots }
  - { table: users, bindings: [ { path: y } ] }
cron:
  - { path: c, interval: 1s }
  - { path: d, interval: [1, 2] }
"#;
        let config = Config::from_yaml(yaml).unwrap();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].url, "/a");
        assert_eq!(config.streams.len(), 1);
        assert_eq!(config.streams[0].table, "users");
        assert_eq!(config.cron.len(), 1);
        assert_eq!(config.cron[0].handler.path, "c");
    }

    #[test]
    fn null_binding_lists_are_empty() {
        let config = Config::from_yaml("routes:\ncron: ~\n").unwrap();
        assert!(config.routes.is_empty() && config.cron.is_empty());
    }

    #[test]
    fn numeric_interval_is_kept_as_text() {
        let config = Config::from_yaml("cron:\n  - { path: tick, interval: 500 }\n").unwrap();
        assert_eq!(config.cron[0].interval, "500");
    }

    #[tokio::test]
    async fn missing_file_gives_empty_config() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::from_file(&dir.path().join("nope.yml")).await.unwrap();
        assert!(config.routes.is_empty() && config.streams.is_empty() && config.cron.is_empty());
    }

    #[tokio::test]
    async fn reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cloudlyfile.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = Config::from_file(&path).await.unwrap();
        assert_eq!(config.routes.len(), 2);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Cloudlyfile.yml");
        std::fs::write(&path, "routes: [ { url: ").unwrap();

        let err = Config::from_file(&path).await.unwrap_err();
        assert!(matches!(err, EmulatorError::ConfigFormat { .. }));
    }
}
