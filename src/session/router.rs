//! Action routing for inbound session requests

use super::{Request, Response, SessionError};
use async_trait::async_trait;
use regex::Regex;
use std::sync::Arc;

/// Handler for one request action
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Result<Response, SessionError>;
}

/// A registered action pattern
#[derive(Clone)]
pub struct Route {
    action: String,
    pattern: Regex,
    handler: Arc<dyn RequestHandler>,
}

impl Route {
    /// Create a route; the action is anchored at both ends before compiling
    pub fn new(action: impl Into<String>, handler: Arc<dyn RequestHandler>) -> Result<Self, SessionError> {
        let action = action.into();
        let body = action.strip_prefix('^').unwrap_or(&action);
        let body = body.strip_suffix('$').unwrap_or(body);
        let pattern = Regex::new(&format!("^(?:{})$", body))
            .map_err(|e| SessionError::InvalidRoute(format!("{}: {}", action, e)))?;

        Ok(Self {
            action,
            pattern,
            handler,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    fn matches(&self, action: &str) -> bool {
        self.pattern.is_match(action)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route").field("action", &self.action).finish()
    }
}

/// Dispatches requests to the first route whose pattern matches
#[derive(Debug, Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_route(&mut self, route: Route) {
        self.routes.push(route);
    }

    pub fn add_routes(&mut self, routes: impl IntoIterator<Item = Route>) {
        self.routes.extend(routes);
    }

    /// Number of registered routes
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run the handler registered for the request's action
    pub async fn dispatch(&self, request: Request) -> Result<Response, SessionError> {
        let route = self
            .routes
            .iter()
            .find(|route| route.matches(&request.action))
            .ok_or_else(|| SessionError::NoHandler(request.action.clone()))?;

        route.handler.handle(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(&'static str);

    #[async_trait]
    impl RequestHandler for Fixed {
        async fn handle(&self, _request: Request) -> Result<Response, SessionError> {
            Ok(Response::success(self.0.as_bytes().to_vec()))
        }
    }

    fn router() -> Router {
        let mut router = Router::new();
        router.add_route(Route::new("/echo", Arc::new(Fixed("echo"))).unwrap());
        router.add_route(Route::new("/user/[0-9]+", Arc::new(Fixed("user"))).unwrap());
        router
    }

    #[tokio::test]
    async fn test_exact_match_only() {
        let router = router();

        let resp = router.dispatch(Request::new("/echo", vec![])).await.unwrap();
        assert_eq!(&resp.body[..], b"echo");

        let err = router.dispatch(Request::new("/echo/more", vec![])).await.unwrap_err();
        assert!(matches!(err, SessionError::NoHandler(_)));

        let err = router.dispatch(Request::new("x/echo", vec![])).await.unwrap_err();
        assert!(matches!(err, SessionError::NoHandler(_)));
    }

    #[tokio::test]
    async fn test_pattern_route() {
        let router = router();
        let resp = router.dispatch(Request::new("/user/42", vec![])).await.unwrap();
        assert_eq!(&resp.body[..], b"user");
    }

    #[tokio::test]
    async fn test_alternation_is_fully_anchored() {
        let mut router = Router::new();
        router.add_route(Route::new("/a|/b", Arc::new(Fixed("ab"))).unwrap());
        router.add_route(Route::new("^/c$", Arc::new(Fixed("c"))).unwrap());

        for action in ["/a", "/b"] {
            let resp = router.dispatch(Request::new(action, vec![])).await.unwrap();
            assert_eq!(&resp.body[..], b"ab");
        }
        for action in ["/a/x", "x/b", "/cc"] {
            let err = router.dispatch(Request::new(action, vec![])).await.unwrap_err();
            assert!(matches!(err, SessionError::NoHandler(_)), "{}", action);
        }
        let resp = router.dispatch(Request::new("/c", vec![])).await.unwrap();
        assert_eq!(&resp.body[..], b"c");
    }

    #[test]
    fn test_invalid_pattern() {
        let err = Route::new("/bad(", Arc::new(Fixed("x"))).unwrap_err();
        assert!(matches!(err, SessionError::InvalidRoute(_)));
    }
}
