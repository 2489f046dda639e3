//! Immutable method + pattern route table.
//!
//! Patterns are literal segments with `{name}` captures, e.g.
//! `/v1/goodbye/{name}`. A table is built once from a resolved manifest and
//! never mutated; swapping in new routes is the hot-swap cell's job. Lookup
//! walks the route list in registration order: first pattern whose segments
//! and method both match wins. A path that matches some pattern but no
//! method yields `405`; no pattern at all yields `404`.

use async_trait::async_trait;
use http::{Method, StatusCode};

use cffaas_common::http::{status_response, EventRequest, EventResponse};

use crate::handler::{Handler, PathVars, SharedHandler};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Var(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    segments: Vec<Segment>,
}

impl Pattern {
    fn parse(pattern: &str) -> Self {
        let segments = pattern
            .trim_start_matches('/')
            .split('/')
            .map(|s| {
                if s.starts_with('{') && s.ends_with('}') && s.len() > 2 {
                    Segment::Var(s[1..s.len() - 1].to_string())
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();

        Self { segments }
    }

    /// Matches a concrete path, returning captured variables on success.
    fn matches(&self, path: &str) -> Option<PathVars> {
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut vars = PathVars::default();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Var(name) => {
                    vars.0.insert(name.clone(), part.to_string());
                }
            }
        }

        Some(vars)
    }
}

struct Route {
    methods: Vec<Method>,
    pattern: Pattern,
    handler: SharedHandler,
}

/// An immutable routing tree.
pub struct RouteTable {
    routes: Vec<Route>,
}

/// Builder for [`RouteTable`].
#[derive(Default)]
pub struct RouteTableBuilder {
    routes: Vec<Route>,
}

impl RouteTableBuilder {
    /// Registers a handler for one method on a pattern.
    pub fn route(self, method: Method, pattern: &str, handler: SharedHandler) -> Self {
        self.route_methods(vec![method], pattern, handler)
    }

    /// Registers a handler for several methods on a pattern.
    pub fn route_methods(
        mut self,
        methods: Vec<Method>,
        pattern: &str,
        handler: SharedHandler,
    ) -> Self {
        self.routes.push(Route {
            methods,
            pattern: Pattern::parse(pattern),
            handler,
        });
        self
    }

    pub fn build(self) -> RouteTable {
        RouteTable {
            routes: self.routes,
        }
    }
}

impl RouteTable {
    pub fn builder() -> RouteTableBuilder {
        RouteTableBuilder::default()
    }
}

#[async_trait]
impl Handler for RouteTable {
    async fn handle(&self, mut req: EventRequest) -> EventResponse {
        let path = req.uri().path().to_string();

        let mut path_matched = false;
        for route in &self.routes {
            let Some(vars) = route.pattern.matches(&path) else {
                continue;
            };
            path_matched = true;

            if !route.methods.contains(req.method()) {
                continue;
            }

            req.extensions_mut().insert(vars);
            return route.handler.handle(req).await;
        }

        if path_matched {
            status_response(StatusCode::METHOD_NOT_ALLOWED)
        } else {
            status_response(StatusCode::NOT_FOUND)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use bytes::Bytes;
    use http::Request;

    use crate::handler::path_vars;

    struct EchoVars;

    #[async_trait]
    impl Handler for EchoVars {
        async fn handle(&self, req: EventRequest) -> EventResponse {
            let vars = path_vars(&req);
            cffaas_common::http::json_response(StatusCode::OK, &vars)
        }
    }

    fn request(method: Method, path: &str) -> EventRequest {
        Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
    }

    fn table() -> RouteTable {
        RouteTable::builder()
            .route(Method::GET, "/v1/goodbye/{name}", Arc::new(EchoVars))
            .route_methods(
                vec![Method::GET, Method::POST],
                "/{id}/relayer/{token}",
                Arc::new(EchoVars),
            )
            .build()
    }

    async fn body_json(resp: EventResponse) -> serde_json::Value {
        use http_body_util::BodyExt;
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_matches_literal_and_captures_vars() {
        let resp = table()
            .handle(request(Method::GET, "/v1/goodbye/alice"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["name"], "alice");
    }

    #[tokio::test]
    async fn test_multiple_captures() {
        let resp = table()
            .handle(request(Method::POST, "/abc123/relayer/tok9"))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let vars = body_json(resp).await;
        assert_eq!(vars["id"], "abc123");
        assert_eq!(vars["token"], "tok9");
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let resp = table().handle(request(Method::GET, "/nope")).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_wrong_method_is_405() {
        let resp = table()
            .handle(request(Method::DELETE, "/v1/goodbye/alice"))
            .await;
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_segment_count_must_match() {
        let resp = table()
            .handle(request(Method::GET, "/v1/goodbye/alice/extra"))
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
