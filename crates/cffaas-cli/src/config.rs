//! Environment-driven configuration.
//!
//! Both processes are configured entirely through environment variables, the
//! way the hosting platform injects them. Missing or unparseable required
//! values are fatal at startup. `VCAP_APPLICATION` is the platform's JSON
//! bundle describing this deployment; its admin API address is rewritten to
//! http so `HTTP_PROXY` applies to admin traffic.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::Deserialize;

use cffaas_common::error::{FaasError, Result};
use cffaas_dispatcher::manifest::Manifest;

/// The platform's deployment descriptor, from `VCAP_APPLICATION`.
#[derive(Debug, Clone, Deserialize)]
pub struct VcapApplication {
    #[serde(rename = "cf_api")]
    pub capi_addr: String,
    pub application_id: String,
    #[serde(default)]
    pub application_name: String,
    pub space_id: String,
    pub application_uris: Vec<String>,
}

impl VcapApplication {
    pub fn from_json(data: &str) -> Result<Self> {
        let vcap: VcapApplication = serde_json::from_str(data)
            .map_err(|e| FaasError::Config(format!("invalid VCAP_APPLICATION: {}", e)))?;
        if vcap.application_uris.is_empty() {
            return Err(FaasError::Config(
                "VCAP_APPLICATION has no application_uris".into(),
            ));
        }
        Ok(vcap)
    }

    /// Admin API address with the scheme downgraded so `HTTP_PROXY` applies.
    pub fn capi_http(&self) -> String {
        self.capi_addr.replacen("https", "http", 1)
    }

    /// The externally reachable base address of this app.
    pub fn external_addr(&self) -> String {
        format!("http://{}", self.application_uris[0])
    }
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

fn required(lookup: Lookup, name: &str) -> Result<String> {
    lookup(name).ok_or_else(|| FaasError::Config(format!("{} is required", name)))
}

fn parse<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| FaasError::Config(format!("unparseable {}: {:?}", name, value)))
}

/// Dispatcher process configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub port: u16,
    pub health_port: Option<u16>,
    pub manifest: Manifest,
    pub bootstrap_manifest: Manifest,
    pub resolver_urls: HashMap<String, String>,
    pub instance_index: usize,
    pub skip_ssl_validation: bool,
    pub task_command: String,
    pub vcap: VcapApplication,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: Lookup) -> Result<Self> {
        let port: u16 = parse("PORT", &required(lookup, "PORT")?)?;

        let health_port = match lookup("PROXY_HEALTH_PORT") {
            Some(raw) => Some(parse("PROXY_HEALTH_PORT", &raw)?),
            None => None,
        };

        let manifest = Manifest::from_yaml(&required(lookup, "MANIFEST")?)?;
        if manifest.functions.is_empty() {
            return Err(FaasError::Config("no functions defined".into()));
        }

        let bootstrap_manifest = match lookup("BOOTSTRAP_MANIFEST") {
            Some(raw) => Manifest::from_yaml(&raw)?,
            None => Manifest::default(),
        };

        let resolver_urls = match lookup("RESOLVER_URLS") {
            Some(raw) => parse_resolver_urls(&raw, port)?,
            None => HashMap::new(),
        };

        let instance_index = parse("CF_INSTANCE_INDEX", &required(lookup, "CF_INSTANCE_INDEX")?)?;

        let skip_ssl_validation = match lookup("SKIP_SSL_VALIDATION") {
            Some(raw) => parse("SKIP_SSL_VALIDATION", &raw)?,
            None => false,
        };

        let task_command =
            lookup("WORKER_COMMAND").unwrap_or_else(|| "./worker".to_string());

        let vcap = VcapApplication::from_json(&required(lookup, "VCAP_APPLICATION")?)?;

        Ok(Self {
            port,
            health_port,
            manifest,
            bootstrap_manifest,
            resolver_urls,
            instance_index,
            skip_ssl_validation,
            task_command,
            vcap,
        })
    }
}

/// Parses `kind:addr,kind:addr` resolver mappings.
///
/// A value starting with `/` is a path on this process; anything else is a
/// host that gets an http scheme prepended.
fn parse_resolver_urls(raw: &str, port: u16) -> Result<HashMap<String, String>> {
    let mut urls = HashMap::new();

    for pair in raw.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }

        let (kind, addr) = pair
            .split_once(':')
            .ok_or_else(|| FaasError::Config(format!("bad RESOLVER_URLS entry: {:?}", pair)))?;
        if addr.is_empty() {
            continue;
        }

        let url = if addr.starts_with('/') {
            format!("http://localhost:{}{}", port, addr)
        } else {
            format!("http://{}", addr)
        };
        urls.insert(kind.to_string(), url);
    }

    Ok(urls)
}

/// Worker process configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub pool_addr: String,
    pub app_instance: String,
    pub app_names: Vec<String>,
    pub http_proxy: String,
    pub data_dir: PathBuf,
    pub vcap: VcapApplication,
    /// The raw bundle, forwarded verbatim into user-command environments.
    pub vcap_raw: String,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(&|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: Lookup) -> Result<Self> {
        let pool_addr = required(lookup, "POOL_ADDR")?;
        let app_instance = required(lookup, "X_CF_APP_INSTANCE")?;

        let app_names: Vec<String> = required(lookup, "APP_NAMES")?
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect();
        if app_names.is_empty() {
            return Err(FaasError::Config("APP_NAMES is empty".into()));
        }

        let http_proxy = required(lookup, "HTTP_PROXY")?;

        let data_dir = lookup("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/dev/shm"));

        let vcap_raw = required(lookup, "VCAP_APPLICATION")?;
        let vcap = VcapApplication::from_json(&vcap_raw)?;

        Ok(Self {
            pool_addr,
            app_instance,
            app_names,
            http_proxy,
            data_dir,
            vcap,
            vcap_raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VCAP: &str = r#"{
        "cf_api": "https://api.example.com",
        "application_id": "app-guid",
        "application_name": "faas",
        "space_id": "space-guid",
        "application_uris": ["faas.example.com"]
    }"#;

    const MANIFEST: &str = r#"
functions:
- handler:
    command: ./echo
  events:
    http:
    - path: /v1/echo
      method: POST
"#;

    fn dispatcher_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("PORT", "8080".to_string()),
            ("MANIFEST", MANIFEST.to_string()),
            ("CF_INSTANCE_INDEX", "2".to_string()),
            ("VCAP_APPLICATION", VCAP.to_string()),
        ])
    }

    fn lookup_in(
        env: HashMap<&'static str, String>,
    ) -> impl Fn(&str) -> Option<String> {
        move |name| env.get(name).cloned()
    }

    #[test]
    fn test_dispatcher_config_minimal() {
        let cfg = DispatcherConfig::from_lookup(&lookup_in(dispatcher_env())).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.health_port, None);
        assert_eq!(cfg.instance_index, 2);
        assert!(!cfg.skip_ssl_validation);
        assert_eq!(cfg.task_command, "./worker");
        assert_eq!(cfg.vcap.external_addr(), "http://faas.example.com");
        assert_eq!(cfg.vcap.capi_http(), "http://api.example.com");
    }

    #[test]
    fn test_dispatcher_config_missing_port() {
        let mut env = dispatcher_env();
        env.remove("PORT");
        let err = DispatcherConfig::from_lookup(&lookup_in(env)).unwrap_err();
        assert!(matches!(err, FaasError::Config(msg) if msg.contains("PORT")));
    }

    #[test]
    fn test_dispatcher_config_empty_manifest_rejected() {
        let mut env = dispatcher_env();
        env.insert("MANIFEST", "functions: []".to_string());
        let err = DispatcherConfig::from_lookup(&lookup_in(env)).unwrap_err();
        assert!(matches!(err, FaasError::Config(msg) if msg.contains("no functions")));
    }

    #[test]
    fn test_resolver_urls_normalization() {
        let urls = parse_resolver_urls(
            "queue:plugin.example.com/convert,local: ,cron:/internal/cron",
            8080,
        )
        .unwrap();
        assert_eq!(urls["queue"], "http://plugin.example.com/convert");
        assert_eq!(urls["cron"], "http://localhost:8080/internal/cron");
        assert!(!urls.contains_key("local"));
    }

    #[test]
    fn test_worker_config_defaults_data_dir() {
        let env = HashMap::from([
            ("POOL_ADDR", "http://faas.example.com/x/pool/1".to_string()),
            ("X_CF_APP_INSTANCE", "app-guid:2".to_string()),
            ("APP_NAMES", "faas, other-app".to_string()),
            ("HTTP_PROXY", "http://proxy.example.com".to_string()),
            ("VCAP_APPLICATION", VCAP.to_string()),
        ]);

        let cfg = WorkerConfig::from_lookup(&lookup_in(env)).unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/dev/shm"));
        assert_eq!(
            cfg.app_names,
            vec!["faas".to_string(), "other-app".to_string()]
        );
    }

    #[test]
    fn test_worker_config_requires_app_names() {
        let env = HashMap::from([
            ("POOL_ADDR", "http://x".to_string()),
            ("X_CF_APP_INSTANCE", "a:0".to_string()),
            ("APP_NAMES", " ".to_string()),
            ("HTTP_PROXY", "http://proxy".to_string()),
            ("VCAP_APPLICATION", VCAP.to_string()),
        ]);
        assert!(WorkerConfig::from_lookup(&lookup_in(env)).is_err());
    }

    #[test]
    fn test_vcap_requires_uris() {
        let err = VcapApplication::from_json(
            r#"{"cf_api":"https://api","application_id":"a","space_id":"s","application_uris":[]}"#,
        )
        .unwrap_err();
        assert!(matches!(err, FaasError::Config(_)));
    }
}
