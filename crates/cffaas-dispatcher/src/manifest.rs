//! Declarative route manifest and its plugin resolver.
//!
//! A manifest is YAML: a list of functions, each with a handler (command +
//! optional app name) and events grouped by kind. `http` events resolve
//! locally into routes. Every other kind is late-bound: the raw event data
//! is POSTed to the plugin endpoint registered for that kind in
//! `RESOLVER_URLS`, and the plugin answers with the HTTP functions to mount.
//!
//! ```yaml
//! functions:
//! - handler:
//!     command: ./echo
//!   events:
//!     http:
//!     - path: /v1/echo
//!       method: POST
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use cffaas_common::error::{FaasError, Result};

/// Top-level manifest document.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub functions: Vec<Function>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Function {
    pub handler: HandlerSpec,
    #[serde(default)]
    pub events: HashMap<String, Vec<serde_yaml::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerSpec {
    pub command: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub app_name: String,
}

/// A fully resolved function: handler plus concrete HTTP routes.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpFunction {
    pub handler: HandlerSpec,
    pub events: Vec<HttpEventSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpEventSpec {
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub cache: CacheSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSpec {
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub header: Vec<String>,
}

impl CacheSpec {
    /// Parses the human-readable duration (`1s`, `500ms`, ...), if any.
    pub fn duration(&self) -> Result<Option<Duration>> {
        match self.duration.as_deref() {
            None | Some("") => Ok(None),
            Some(text) => humantime::parse_duration(text)
                .map(Some)
                .map_err(|e| FaasError::Manifest(format!("bad cache duration {:?}: {}", text, e))),
        }
    }
}

impl Manifest {
    /// Parses a manifest from YAML.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let manifest: Manifest = serde_yaml::from_str(data)?;

        for f in &manifest.functions {
            if f.handler.command.is_empty() {
                return Err(FaasError::Manifest("invalid empty command".into()));
            }
            if f.events.is_empty() {
                return Err(FaasError::Manifest("invalid empty events".into()));
            }
        }

        Ok(manifest)
    }

    /// All handler app names, deduplicated, with empty names replaced by
    /// `default_name`.
    pub fn app_names(&self, default_name: &str) -> Vec<String> {
        let mut seen = HashMap::new();
        let mut names = Vec::new();
        for f in &self.functions {
            let name = if f.handler.app_name.is_empty() {
                default_name.to_string()
            } else {
                f.handler.app_name.clone()
            };

            if seen.insert(name.clone(), true).is_none() {
                names.push(name);
            }
        }
        names
    }
}

impl HttpFunction {
    pub fn validate(&self) -> Result<()> {
        if self.handler.command.is_empty() {
            return Err(FaasError::Manifest("invalid empty command".into()));
        }
        if self.events.is_empty() {
            return Err(FaasError::Manifest("invalid empty events".into()));
        }
        for e in &self.events {
            if e.path.is_empty() {
                return Err(FaasError::Manifest("invalid empty path".into()));
            }
            if e.method.is_empty() {
                return Err(FaasError::Manifest("invalid empty method".into()));
            }
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct ConvertRequest {
    functions: Vec<ConvertFunction>,
}

#[derive(Serialize)]
struct ConvertFunction {
    handler: HandlerSpec,
    events: HashMap<String, Vec<serde_json::Value>>,
}

#[derive(Deserialize)]
struct ConvertResponse {
    functions: Vec<HttpFunction>,
}

/// Turns a manifest into the flat HTTP-route list, consulting plugins for
/// non-HTTP event kinds.
pub struct Resolver {
    urls: HashMap<String, String>,
    http: reqwest::Client,
}

impl Resolver {
    pub fn new(urls: HashMap<String, String>, http: reqwest::Client) -> Self {
        Self { urls, http }
    }

    pub async fn resolve(&self, manifest: &Manifest) -> Result<Vec<HttpFunction>> {
        let mut results = Vec::new();
        let mut conversions: HashMap<String, Vec<ConvertFunction>> = HashMap::new();

        for f in &manifest.functions {
            for (kind, events) in &f.events {
                if kind == "http" {
                    results.push(Self::parse_http_events(f, events)?);
                    continue;
                }

                let events = events
                    .iter()
                    .map(serde_json::to_value)
                    .collect::<std::result::Result<Vec<_>, _>>()?;

                conversions
                    .entry(kind.clone())
                    .or_default()
                    .push(ConvertFunction {
                        handler: f.handler.clone(),
                        events: HashMap::from([(kind.clone(), events)]),
                    });
            }
        }

        for (kind, functions) in conversions {
            let url = self.urls.get(&kind).ok_or_else(|| {
                FaasError::Manifest(format!("no resolver configured for event kind {:?}", kind))
            })?;

            let resp = self
                .http
                .post(url)
                .json(&ConvertRequest { functions })
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(FaasError::UnexpectedStatus {
                    context: format!("resolver for {}", kind),
                    status: status.as_u16(),
                    body,
                });
            }

            let converted: ConvertResponse = resp.json().await?;
            results.extend(converted.functions);
        }

        for f in &results {
            f.validate()?;
        }

        Ok(results)
    }

    fn parse_http_events(f: &Function, events: &[serde_yaml::Value]) -> Result<HttpFunction> {
        let events = events
            .iter()
            .map(|e| serde_yaml::from_value::<HttpEventSpec>(e.clone()))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(HttpFunction {
            handler: f.handler.clone(),
            events,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = r#"
functions:
- handler:
    command: ./echo
  events:
    http:
    - path: /v1/echo
      method: POST
"#;

    const CACHED: &str = r#"
functions:
- handler:
    command: ./info
    app_name: info-app
  events:
    http:
    - path: /v1/info
      method: GET
      cache:
        duration: 1s
        header:
        - x-tenant
"#;

    #[test]
    fn test_parses_simple_manifest() {
        let m = Manifest::from_yaml(SIMPLE).unwrap();
        assert_eq!(m.functions.len(), 1);
        assert_eq!(m.functions[0].handler.command, "./echo");
        assert!(m.functions[0].events.contains_key("http"));
    }

    #[test]
    fn test_rejects_empty_command() {
        let err = Manifest::from_yaml(
            r#"
functions:
- handler:
    command: ""
  events:
    http:
    - path: /x
      method: GET
"#,
        )
        .unwrap_err();
        assert!(matches!(err, FaasError::Manifest(_)));
    }

    #[test]
    fn test_rejects_missing_events() {
        let err = Manifest::from_yaml(
            r#"
functions:
- handler:
    command: ./echo
"#,
        )
        .unwrap_err();
        assert!(matches!(err, FaasError::Manifest(_)));
    }

    #[test]
    fn test_app_names_dedup_and_default() {
        let m = Manifest::from_yaml(
            r#"
functions:
- handler:
    command: ./a
  events:
    http:
    - path: /a
      method: GET
- handler:
    command: ./b
    app_name: other-app
  events:
    http:
    - path: /b
      method: GET
- handler:
    command: ./c
    app_name: other-app
  events:
    http:
    - path: /c
      method: GET
"#,
        )
        .unwrap();

        assert_eq!(
            m.app_names("this-app"),
            vec!["this-app".to_string(), "other-app".to_string()]
        );
    }

    #[tokio::test]
    async fn test_resolver_parses_http_events_locally() {
        let m = Manifest::from_yaml(CACHED).unwrap();
        let resolver = Resolver::new(HashMap::new(), reqwest::Client::new());

        let functions = resolver.resolve(&m).await.unwrap();
        assert_eq!(functions.len(), 1);
        assert_eq!(functions[0].handler.app_name, "info-app");

        let event = &functions[0].events[0];
        assert_eq!(event.path, "/v1/info");
        assert_eq!(event.method, "GET");
        assert_eq!(
            event.cache.duration().unwrap(),
            Some(Duration::from_secs(1))
        );
        assert_eq!(event.cache.header, vec!["x-tenant".to_string()]);
    }

    #[tokio::test]
    async fn test_resolver_requires_plugin_for_unknown_kind() {
        let m = Manifest::from_yaml(
            r#"
functions:
- handler:
    command: ./cron
  events:
    schedule:
    - cron: "* * * * *"
"#,
        )
        .unwrap();
        let resolver = Resolver::new(HashMap::new(), reqwest::Client::new());

        let err = resolver.resolve(&m).await.unwrap_err();
        assert!(matches!(err, FaasError::Manifest(_)));
    }

    #[test]
    fn test_cache_spec_duration_absent() {
        assert_eq!(CacheSpec::default().duration().unwrap(), None);
    }

    #[test]
    fn test_cache_spec_duration_invalid() {
        let spec = CacheSpec {
            duration: Some("soon".into()),
            header: Vec::new(),
        };
        assert!(spec.duration().is_err());
    }
}
