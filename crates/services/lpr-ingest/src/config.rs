//! Configuration for the LPR push listener
//!
//! Configuration can be loaded from a TOML file and/or environment variables.
//! [`Config::validate`] turns it into the immutable [`ServerConfig`] the
//! listener runs with.

use axum::http::{HeaderValue, Method, StatusCode};
use bytes::Bytes;
use encoding_rs::Encoding;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::SharedSecret;

/// Main configuration for the push listener
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Listen prefixes and transport policy
    #[serde(default)]
    pub listen: ListenConfig,

    /// Request and connection limits
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Shared-secret authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Success response
    #[serde(default)]
    pub response: ResponseConfig,

    /// Field-name aliases
    #[serde(default)]
    pub aliases: AliasConfig,

    /// TLS material for https prefixes
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Listen configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Absolute URI prefixes, e.g. `https://+:8443/lpr/`
    #[serde(default)]
    pub prefixes: Vec<String>,

    /// Reject plain-HTTP prefixes and insecure connections
    #[serde(default = "default_require_https")]
    pub require_https: bool,

    /// Accepted HTTP methods
    #[serde(default = "default_allowed_methods")]
    pub allowed_methods: Vec<String>,
}

fn default_require_https() -> bool {
    true
}

fn default_allowed_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            prefixes: Vec::new(),
            require_https: default_require_https(),
            allowed_methods: default_allowed_methods(),
        }
    }
}

/// Request and connection limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum request body in bytes, 0 for unlimited
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    /// Accept requests without a body
    #[serde(default)]
    pub allow_empty_body: bool,

    /// Maximum concurrently served connections, 0 for unlimited
    #[serde(default)]
    pub max_concurrent_connections: usize,

    /// Delay before retrying after a failed accept
    #[serde(default = "default_accept_error_backoff")]
    pub accept_error_backoff_ms: u64,

    /// How long `stop()` waits for in-flight requests
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,
}

fn default_max_body_bytes() -> u64 {
    1024 * 1024 // 1 MiB
}

fn default_accept_error_backoff() -> u64 {
    100
}

fn default_shutdown_timeout() -> u64 {
    5000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
            allow_empty_body: false,
            max_concurrent_connections: 0,
            accept_error_backoff_ms: default_accept_error_backoff(),
            shutdown_timeout_ms: default_shutdown_timeout(),
        }
    }
}

/// Shared-secret configuration
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Token every push must carry; unset disables the check
    #[serde(default)]
    pub shared_secret: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field(
                "shared_secret",
                &self.shared_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Success response configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    #[serde(default = "default_status")]
    pub status: u16,

    #[serde(default = "default_body")]
    pub body: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    /// Encoding label for response text (WHATWG labels, e.g. `utf-8`, `windows-1252`)
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_status() -> u16 {
    200
}

fn default_body() -> String {
    "OK".to_string()
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

fn default_charset() -> String {
    "utf-8".to_string()
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            status: default_status(),
            body: default_body(),
            content_type: default_content_type(),
            charset: default_charset(),
        }
    }
}

/// Field-name aliases, in priority order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasConfig {
    #[serde(default = "default_plate_aliases")]
    pub plate: Vec<String>,

    #[serde(default = "default_timestamp_aliases")]
    pub timestamp: Vec<String>,

    #[serde(default = "default_confidence_aliases")]
    pub confidence: Vec<String>,

    #[serde(default = "default_token_aliases")]
    pub token: Vec<String>,

    #[serde(default = "default_camera_id_aliases")]
    pub camera_id: Vec<String>,

    #[serde(default = "default_camera_name_aliases")]
    pub camera_name: Vec<String>,
}

fn aliases(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn default_plate_aliases() -> Vec<String> {
    aliases(&[
        "plate",
        "plateNumber",
        "plateText",
        "licensePlate",
        "license",
        "plateNo",
        "lp",
        "lpr",
        "registration",
        "vrm",
        "carPlate",
        "vehiclePlate",
        "number",
    ])
}

fn default_timestamp_aliases() -> Vec<String> {
    aliases(&[
        "timestamp",
        "eventTime",
        "captureTime",
        "dateTime",
        "time",
        "ts",
        "date",
    ])
}

fn default_confidence_aliases() -> Vec<String> {
    aliases(&[
        "confidence",
        "plateConfidence",
        "score",
        "accuracy",
        "reliability",
        "probability",
        "conf",
    ])
}

fn default_token_aliases() -> Vec<String> {
    aliases(&[
        "token",
        "authToken",
        "accessToken",
        "apiKey",
        "secret",
        "key",
    ])
}

fn default_camera_id_aliases() -> Vec<String> {
    aliases(&[
        "cameraId",
        "camId",
        "deviceId",
        "serialNumber",
        "serial",
        "channelId",
        "mac",
    ])
}

fn default_camera_name_aliases() -> Vec<String> {
    aliases(&[
        "cameraName",
        "camName",
        "deviceName",
        "channelName",
        "location",
        "name",
    ])
}

impl Default for AliasConfig {
    fn default() -> Self {
        Self {
            plate: default_plate_aliases(),
            timestamp: default_timestamp_aliases(),
            confidence: default_confidence_aliases(),
            token: default_token_aliases(),
            camera_id: default_camera_id_aliases(),
            camera_name: default_camera_name_aliases(),
        }
    }
}

/// TLS material for https prefixes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM certificate chain
    #[serde(default)]
    pub cert_path: Option<PathBuf>,

    /// PEM private key
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    /// Load configuration from file if it exists, otherwise from environment
    pub fn load<P: AsRef<Path>>(path: Option<P>) -> Result<Self, ConfigError> {
        if let Some(p) = path {
            if p.as_ref().exists() {
                return Self::from_file(p);
            }
        }
        Ok(Self::from_env())
    }

    fn apply_env(&mut self) {
        // Listen
        if let Ok(prefixes) = std::env::var("LPR_PREFIXES") {
            self.listen.prefixes = prefixes
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(flag) = std::env::var("LPR_REQUIRE_HTTPS") {
            if let Ok(f) = flag.parse() {
                self.listen.require_https = f;
            }
        }

        // Limits
        if let Ok(flag) = std::env::var("LPR_ALLOW_EMPTY_BODY") {
            if let Ok(f) = flag.parse() {
                self.limits.allow_empty_body = f;
            }
        }
        if let Ok(max) = std::env::var("LPR_MAX_BODY_BYTES") {
            if let Ok(m) = max.parse() {
                self.limits.max_body_bytes = m;
            }
        }
        if let Ok(max) = std::env::var("LPR_MAX_CONNECTIONS") {
            if let Ok(m) = max.parse() {
                self.limits.max_concurrent_connections = m;
            }
        }
        if let Ok(timeout) = std::env::var("LPR_SHUTDOWN_TIMEOUT_MS") {
            if let Ok(t) = timeout.parse() {
                self.limits.shutdown_timeout_ms = t;
            }
        }

        // Auth
        if let Ok(secret) = std::env::var("LPR_SHARED_SECRET") {
            self.auth.shared_secret = Some(secret);
        }

        // TLS
        if let Ok(path) = std::env::var("LPR_TLS_CERT") {
            self.tls.cert_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("LPR_TLS_KEY") {
            self.tls.key_path = Some(PathBuf::from(path));
        }
    }

    /// Validate into the immutable snapshot the listener consumes
    pub fn validate(&self) -> Result<ServerConfig, ConfigError> {
        if self.listen.prefixes.is_empty() {
            return Err(ConfigError::NoPrefixes);
        }

        let prefixes = self
            .listen
            .prefixes
            .iter()
            .map(|raw| ListenPrefix::parse(raw))
            .collect::<Result<Vec<_>, _>>()?;

        if self.listen.require_https {
            if let Some(plain) = prefixes.iter().find(|p| !p.secure) {
                return Err(ConfigError::InsecurePrefix(plain.raw.clone()));
            }
        }

        let tls = if prefixes.iter().any(|p| p.secure) {
            match (&self.tls.cert_path, &self.tls.key_path) {
                (Some(cert), Some(key)) => Some(TlsFiles {
                    cert_path: cert.clone(),
                    key_path: key.clone(),
                }),
                _ => return Err(ConfigError::MissingTlsMaterial),
            }
        } else {
            None
        };

        let mut allowed_methods = Vec::new();
        for name in &self.listen.allowed_methods {
            let method = Method::from_bytes(name.trim().to_ascii_uppercase().as_bytes())
                .map_err(|_| ConfigError::InvalidMethod(name.clone()))?;
            if !allowed_methods.contains(&method) {
                allowed_methods.push(method);
            }
        }
        if allowed_methods.is_empty() {
            allowed_methods.push(Method::POST);
        }

        let response = SuccessResponse::from_config(&self.response)?;
        let bindings = group_bindings(&prefixes)?;

        Ok(ServerConfig {
            prefixes,
            bindings,
            allowed_methods,
            max_body_bytes: self.limits.max_body_bytes,
            require_https: self.listen.require_https,
            allow_empty_body: self.limits.allow_empty_body,
            shared_secret: self.auth.shared_secret.as_deref().map(SharedSecret::new),
            response,
            shutdown_timeout: Duration::from_millis(self.limits.shutdown_timeout_ms),
            max_concurrent_connections: match self.limits.max_concurrent_connections {
                0 => None,
                n => Some(n),
            },
            accept_error_backoff: Duration::from_millis(self.limits.accept_error_backoff_ms),
            aliases: self.aliases.clone(),
            tls,
        })
    }
}

/// A parsed listen prefix
#[derive(Debug, Clone, PartialEq)]
pub struct ListenPrefix {
    /// Prefix as configured
    pub raw: String,

    pub secure: bool,

    /// Host to bind; `+` and `*` become `0.0.0.0`
    pub host: String,

    pub port: u16,

    /// Path, always starting and ending with `/`
    pub path: String,
}

impl ListenPrefix {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidPrefix {
            prefix: raw.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = raw.trim();
        let (scheme, rest) = trimmed
            .split_once("://")
            .ok_or_else(|| invalid("not an absolute URI"))?;

        let secure = match scheme.to_ascii_lowercase().as_str() {
            "https" => true,
            "http" => false,
            _ => return Err(invalid("scheme must be http or https")),
        };

        // Wildcard hosts are not valid URI hosts; swap them for the
        // unspecified address before handing the prefix to the URL parser.
        let host_end = rest.find([':', '/']).unwrap_or(rest.len());
        let rest = match &rest[..host_end] {
            "+" | "*" => format!("0.0.0.0{}", &rest[host_end..]),
            _ => rest.to_string(),
        };

        let url = url::Url::parse(&format!("{}://{}", scheme, rest))
            .map_err(|e| invalid(&e.to_string()))?;
        if url.query().is_some() || url.fragment().is_some() {
            return Err(invalid("query and fragment are not allowed"));
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;

        let mut path = url.path().to_string();
        if !path.ends_with('/') {
            path.push('/');
        }

        Ok(Self {
            raw: raw.to_string(),
            secure,
            host,
            port,
            path,
        })
    }

    /// `host:port` for binding
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether a request path falls under this prefix
    pub fn matches(&self, request_path: &str) -> bool {
        let request_path = request_path.to_ascii_lowercase();
        let prefix = self.path.to_ascii_lowercase();
        request_path.starts_with(&prefix) || request_path == prefix.trim_end_matches('/')
    }
}

/// One socket to bind and the prefix paths it serves
#[derive(Debug, Clone, PartialEq)]
pub struct Binding {
    pub addr: String,
    pub secure: bool,
    pub prefixes: Vec<ListenPrefix>,
}

fn group_bindings(prefixes: &[ListenPrefix]) -> Result<Vec<Binding>, ConfigError> {
    let mut bindings: Vec<Binding> = Vec::new();
    for prefix in prefixes {
        let addr = prefix.bind_addr();
        match bindings.iter_mut().find(|b| b.addr == addr) {
            Some(binding) if binding.secure != prefix.secure => {
                return Err(ConfigError::ConflictingSchemes(addr));
            }
            Some(binding) => binding.prefixes.push(prefix.clone()),
            None => bindings.push(Binding {
                addr,
                secure: prefix.secure,
                prefixes: vec![prefix.clone()],
            }),
        }
    }
    Ok(bindings)
}

/// Pre-encoded success response
#[derive(Debug, Clone)]
pub struct SuccessResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: HeaderValue,

    /// Encoding applied to success and error bodies
    pub encoding: &'static Encoding,
}

impl SuccessResponse {
    fn from_config(config: &ResponseConfig) -> Result<Self, ConfigError> {
        let status = StatusCode::from_u16(config.status)
            .map_err(|_| ConfigError::InvalidStatus(config.status))?;
        let encoding = Encoding::for_label(config.charset.trim().as_bytes())
            .ok_or_else(|| ConfigError::UnknownEncoding(config.charset.clone()))?;

        Ok(Self {
            status,
            body: encode_text(encoding, &config.body),
            content_type: content_type_with_charset(&config.content_type, encoding)?,
            encoding,
        })
    }
}

/// Encode response text with the configured encoding
pub fn encode_text(encoding: &'static Encoding, text: &str) -> Bytes {
    let (encoded, _, _) = encoding.encode(text);
    Bytes::copy_from_slice(&encoded)
}

fn content_type_with_charset(
    content_type: &str,
    encoding: &'static Encoding,
) -> Result<HeaderValue, ConfigError> {
    let value = if content_type.to_ascii_lowercase().contains("charset=") {
        content_type.to_string()
    } else {
        format!(
            "{}; charset={}",
            content_type,
            encoding.name().to_ascii_lowercase()
        )
    };
    HeaderValue::from_str(&value)
        .map_err(|_| ConfigError::InvalidContentType(content_type.to_string()))
}

/// Paths to the PEM files backing https prefixes
#[derive(Debug, Clone, PartialEq)]
pub struct TlsFiles {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Validated, immutable listener configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    prefixes: Vec<ListenPrefix>,
    bindings: Vec<Binding>,
    allowed_methods: Vec<Method>,
    max_body_bytes: u64,
    require_https: bool,
    allow_empty_body: bool,
    shared_secret: Option<SharedSecret>,
    response: SuccessResponse,
    shutdown_timeout: Duration,
    max_concurrent_connections: Option<usize>,
    accept_error_backoff: Duration,
    aliases: AliasConfig,
    tls: Option<TlsFiles>,
}

impl ServerConfig {
    pub fn prefixes(&self) -> &[ListenPrefix] {
        &self.prefixes
    }

    /// Sockets to bind, one per distinct `host:port`
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    pub fn allowed_methods(&self) -> &[Method] {
        &self.allowed_methods
    }

    pub fn is_method_allowed(&self, method: &Method) -> bool {
        self.allowed_methods.contains(method)
    }

    /// Body limit in bytes; `None` when unlimited
    pub fn max_body_bytes(&self) -> Option<u64> {
        match self.max_body_bytes {
            0 => None,
            n => Some(n),
        }
    }

    pub fn require_https(&self) -> bool {
        self.require_https
    }

    pub fn allow_empty_body(&self) -> bool {
        self.allow_empty_body
    }

    pub fn shared_secret(&self) -> Option<&SharedSecret> {
        self.shared_secret.as_ref()
    }

    pub fn response(&self) -> &SuccessResponse {
        &self.response
    }

    /// Encoding used for every response body
    pub fn response_encoding(&self) -> &'static Encoding {
        self.response.encoding
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    pub fn max_concurrent_connections(&self) -> Option<usize> {
        self.max_concurrent_connections
    }

    pub fn accept_error_backoff(&self) -> Duration {
        self.accept_error_backoff
    }

    pub fn aliases(&self) -> &AliasConfig {
        &self.aliases
    }

    pub fn tls(&self) -> Option<&TlsFiles> {
        self.tls.as_ref()
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("At least one listen prefix is required")]
    NoPrefixes,

    #[error("Invalid prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    #[error("HTTPS is required but prefix '{0}' uses plain HTTP")]
    InsecurePrefix(String),

    #[error("Address {0} is configured with both http and https prefixes")]
    ConflictingSchemes(String),

    #[error("https prefixes need tls.cert_path and tls.key_path")]
    MissingTlsMaterial,

    #[error("Invalid HTTP method: {0}")]
    InvalidMethod(String),

    #[error("Invalid response status: {0}")]
    InvalidStatus(u16),

    #[error("Unknown response encoding: {0}")]
    UnknownEncoding(String),

    #[error("Invalid response content type: {0}")]
    InvalidContentType(String),
}
