//!
//! supportline service configuration
//! ---------------------------------
//! Assembled once at process start: built-in defaults, then `SUPPORTLINE_*` environment
//! variables, then command-line flags. Nothing reads the environment after startup.

use std::time::Duration;

use reqwest::Url;

use crate::error::{AppError, AppResult};

pub const DEFAULT_HTTP_PORT: u16 = 3000;
pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";
pub const DEFAULT_GENERATION_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityBackend {
    /// In-process accounts and sessions.
    Local,
    /// GoTrue-compatible identity service.
    Remote { url: String, api_key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryBackend {
    Memory,
    Rest { url: String, api_key: String },
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub http_port: u16,
    pub bind_host: String,
    /// Externally visible origin, used to build OAuth callback URLs.
    pub public_url: String,
    pub identity: IdentityBackend,
    pub directory: DirectoryBackend,
    pub generation_url: String,
    pub http_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            http_port: DEFAULT_HTTP_PORT,
            bind_host: DEFAULT_BIND_HOST.to_string(),
            public_url: format!("http://localhost:{}", DEFAULT_HTTP_PORT),
            identity: IdentityBackend::Local,
            directory: DirectoryBackend::Memory,
            generation_url: DEFAULT_GENERATION_URL.to_string(),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
        }
    }
}

fn parse_port(name: &str, raw: &str) -> AppResult<u16> {
    raw.trim().parse::<u16>().map_err(|_| AppError::config(format!("{} must be a port number, got '{}'", name, raw)))
}

fn flag_value<'a>(args: &'a [String], flag: &str) -> AppResult<Option<&'a str>> {
    let mut i = 0;
    while i < args.len() {
        if args[i] == flag {
            return match args.get(i + 1) {
                Some(v) if !v.starts_with("--") => Ok(Some(v.as_str())),
                _ => Err(AppError::config(format!("{} requires a value", flag))),
            };
        }
        i += 1;
    }
    Ok(None)
}

pub fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Parse a service base URL so that relative endpoint paths resolve beneath it.
/// `http://host/prefix` and `http://host/prefix/` both keep `/prefix`.
pub fn base_url(raw: &str, what: &str) -> AppResult<Url> {
    let mut url = Url::parse(raw).map_err(|e| AppError::config(format!("invalid {} URL '{}': {}", what, raw, e)))?;
    if url.cannot_be_a_base() {
        return Err(AppError::config(format!("invalid {} URL '{}': not a base URL", what, raw)));
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Cookies are marked `Secure` only when the service is reached over https.
pub fn secure_origin(public_url: &str) -> bool { public_url.starts_with("https://") }

impl ServiceConfig {
    pub fn from_env() -> AppResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> AppResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut cfg = ServiceConfig::default();

        if let Some(p) = get("SUPPORTLINE_HTTP_PORT") {
            cfg.http_port = parse_port("SUPPORTLINE_HTTP_PORT", &p)?;
            cfg.public_url = format!("http://localhost:{}", cfg.http_port);
        }
        if let Some(u) = get("SUPPORTLINE_PUBLIC_URL") {
            cfg.public_url = u;
        }
        if let Some(url) = get("SUPPORTLINE_IDENTITY_URL") {
            cfg.identity = IdentityBackend::Remote { url, api_key: get("SUPPORTLINE_IDENTITY_KEY").unwrap_or_default() };
        }
        if let Some(url) = get("SUPPORTLINE_DIRECTORY_URL") {
            let api_key = get("SUPPORTLINE_DIRECTORY_KEY")
                .ok_or_else(|| AppError::config("SUPPORTLINE_DIRECTORY_KEY is required with SUPPORTLINE_DIRECTORY_URL"))?;
            cfg.directory = DirectoryBackend::Rest { url, api_key };
        }
        if let Some(u) = get("SUPPORTLINE_GENERATION_URL") {
            cfg.generation_url = u;
        }
        if let Some(t) = get("SUPPORTLINE_HTTP_TIMEOUT_SECS") {
            let secs = t
                .parse::<u64>()
                .map_err(|_| AppError::config(format!("SUPPORTLINE_HTTP_TIMEOUT_SECS must be whole seconds, got '{}'", t)))?;
            cfg.http_timeout = Duration::from_secs(secs);
        }
        Ok(cfg)
    }

    /// Command-line flags override the environment.
    pub fn apply_args(mut self, args: &[String]) -> AppResult<Self> {
        if let Some(p) = flag_value(args, "--http-port")? {
            let port = parse_port("--http-port", p)?;
            if self.public_url == format!("http://localhost:{}", self.http_port) {
                self.public_url = format!("http://localhost:{}", port);
            }
            self.http_port = port;
        }
        if let Some(url) = flag_value(args, "--identity-url")? {
            let api_key = match &self.identity {
                IdentityBackend::Remote { api_key, .. } => api_key.clone(),
                IdentityBackend::Local => String::new(),
            };
            self.identity = IdentityBackend::Remote { url: url.to_string(), api_key };
        }
        if let Some(url) = flag_value(args, "--generation-url")? {
            self.generation_url = url.to_string();
        }
        if has_flag(args, "--local-identity") {
            self.identity = IdentityBackend::Local;
        }
        Ok(self)
    }

    pub fn http_client(&self) -> AppResult<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(self.http_timeout)
            .build()
            .map_err(|e| AppError::config(format!("could not build HTTP client: {}", e)))
    }

    /// Client for streamed bodies: only the connect phase is bounded.
    pub fn streaming_client(&self) -> AppResult<reqwest::Client> {
        reqwest::Client::builder()
            .connect_timeout(self.http_timeout)
            .build()
            .map_err(|e| AppError::config(format!("could not build HTTP client: {}", e)))
    }

    pub fn bind_addr(&self) -> String { format!("{}:{}", self.bind_host, self.http_port) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name: &str| map.get(name).cloned()
    }

    fn args(list: &[&str]) -> Vec<String> { list.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn defaults_are_local_and_in_memory() {
        let cfg = ServiceConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.http_port, 3000);
        assert_eq!(cfg.identity, IdentityBackend::Local);
        assert_eq!(cfg.directory, DirectoryBackend::Memory);
        assert!(!secure_origin(&cfg.public_url));
        assert_eq!(cfg.bind_addr(), "0.0.0.0:3000");
    }

    #[test]
    fn environment_selects_remote_backends() {
        let cfg = ServiceConfig::from_lookup(lookup(&[
            ("SUPPORTLINE_HTTP_PORT", "8088"),
            ("SUPPORTLINE_PUBLIC_URL", "https://help.example.com"),
            ("SUPPORTLINE_IDENTITY_URL", "https://id.example.com"),
            ("SUPPORTLINE_IDENTITY_KEY", "anon"),
            ("SUPPORTLINE_DIRECTORY_URL", "https://db.example.com"),
            ("SUPPORTLINE_DIRECTORY_KEY", "service"),
            ("SUPPORTLINE_HTTP_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(cfg.http_port, 8088);
        assert!(secure_origin(&cfg.public_url));
        assert_eq!(cfg.identity, IdentityBackend::Remote { url: "https://id.example.com".into(), api_key: "anon".into() });
        assert_eq!(cfg.directory, DirectoryBackend::Rest { url: "https://db.example.com".into(), api_key: "service".into() });
        assert_eq!(cfg.http_timeout, Duration::from_secs(5));
    }

    #[test]
    fn invalid_values_fail_startup() {
        let err = ServiceConfig::from_lookup(lookup(&[("SUPPORTLINE_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
        let err = ServiceConfig::from_lookup(lookup(&[("SUPPORTLINE_DIRECTORY_URL", "https://db")])).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
        let err = ServiceConfig::default().apply_args(&args(&["bin", "--http-port"])).unwrap_err();
        assert!(matches!(err, AppError::Config { .. }));
    }

    #[test]
    fn flags_override_environment() {
        let cfg = ServiceConfig::from_lookup(lookup(&[("SUPPORTLINE_IDENTITY_URL", "https://id.example.com")]))
            .unwrap()
            .apply_args(&args(&["bin", "--http-port", "9000", "--local-identity", "--generation-url", "http://gen:1"]))
            .unwrap();
        assert_eq!(cfg.http_port, 9000);
        assert_eq!(cfg.public_url, "http://localhost:9000");
        assert_eq!(cfg.identity, IdentityBackend::Local);
        assert_eq!(cfg.generation_url, "http://gen:1");
    }

    #[test]
    fn base_url_keeps_path_prefix() {
        for raw in ["https://proxy.example.com/identity", "https://proxy.example.com/identity/"] {
            let base = base_url(raw, "identity service").unwrap();
            assert_eq!(base.join("auth/v1/token").unwrap().as_str(), "https://proxy.example.com/identity/auth/v1/token");
        }
        let bare = base_url("http://gen.local:8080", "generation service").unwrap();
        assert_eq!(bare.join("api/ai/retrieval").unwrap().as_str(), "http://gen.local:8080/api/ai/retrieval");
        assert!(matches!(base_url("not a url", "x").unwrap_err(), AppError::Config { .. }));
        assert!(matches!(base_url("mailto:ops@example.com", "x").unwrap_err(), AppError::Config { .. }));
    }
}
