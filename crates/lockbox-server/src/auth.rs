use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http_body_util::BodyExt;
use tonic::body::BoxBody;
use tonic::Status;
use tower::{Layer, Service};
use tracing::debug;

use crate::token::TokenManager;

/// Metadata key under which the verified identity is handed to the services.
pub const USERNAME_METADATA_KEY: &str = "username";

/// The full-method-name set gated by [`AuthLayer`]. Built once at startup and
/// passed in; methods outside the set pass unconditionally.
pub fn protected_methods() -> HashSet<String> {
    const SECRET_SERVICE: &str = "/lockbox.v1.Secret/";
    const FILE_SERVICE: &str = "/lockbox.v1.File/";

    let mut methods = HashSet::new();
    for method in [
        "CreateSecret",
        "GetSecret",
        "ListSecret",
        "UpdateSecret",
        "DeleteSecret",
    ] {
        methods.insert(format!("{SECRET_SERVICE}{method}"));
    }
    for method in [
        "CreateFile",
        "DownloadFile",
        "GetFileInfo",
        "ListFiles",
        "UpdateFileName",
        "DeleteFile",
    ] {
        methods.insert(format!("{FILE_SERVICE}{method}"));
    }
    methods
}

/// Per-call authorization decisions: is the method protected, does the call
/// carry a verifiable token, and which account does it act for.
pub struct AuthGate {
    tokens: Arc<TokenManager>,
    protected: HashSet<String>,
}

impl AuthGate {
    pub fn new(tokens: Arc<TokenManager>, protected: HashSet<String>) -> Self {
        Self { tokens, protected }
    }

    /// Decide pass/deny for `method` (the fully-qualified RPC path). Returns
    /// the verified username for protected methods, `None` for open ones.
    pub fn check(
        &self,
        method: &str,
        headers: &http::HeaderMap,
    ) -> Result<Option<String>, Status> {
        if !self.protected.contains(method) {
            return Ok(None);
        }

        let token = headers
            .get("authorization")
            .ok_or_else(|| Status::unauthenticated("authorization token is not provided"))?
            .to_str()
            .map_err(|_| Status::unauthenticated("authorization token is not provided"))?;

        match self.tokens.verify(token) {
            Ok(claims) => {
                debug!(method, username = %claims.username, "request authorized");
                Ok(Some(claims.username))
            }
            Err(e) => Err(Status::unauthenticated(format!(
                "access token is invalid: {e}"
            ))),
        }
    }
}

/// Tower layer wrapping every tonic route. Runs once per call, before the
/// handler sees the request, so for streaming calls the enriched context is
/// visible to every message on the stream.
#[derive(Clone)]
pub struct AuthLayer {
    gate: Arc<AuthGate>,
}

impl AuthLayer {
    pub fn new(gate: AuthGate) -> Self {
        Self {
            gate: Arc::new(gate),
        }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            gate: self.gate.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    gate: Arc<AuthGate>,
}

impl<S, B> Service<http::Request<B>> for AuthMiddleware<S>
where
    S: Service<http::Request<B>, Response = http::Response<BoxBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send,
    B: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: http::Request<B>) -> Self::Future {
        // Swap in the clone, keep the service that was polled ready.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        match self.gate.check(req.uri().path(), req.headers()) {
            Err(status) => {
                tracing::warn!(method = req.uri().path(), error = %status.message(), "request denied");
                Box::pin(std::future::ready(Ok(deny(&status))))
            }
            Ok(identity) => {
                // The verified claim always wins over anything the caller put
                // in the `username` entry themselves.
                req.headers_mut().remove(USERNAME_METADATA_KEY);
                if let Some(username) = identity {
                    match http::HeaderValue::from_str(&username) {
                        Ok(value) => {
                            req.headers_mut().insert(USERNAME_METADATA_KEY, value);
                        }
                        Err(_) => {
                            let status =
                                Status::internal("verified username is not metadata-safe");
                            return Box::pin(std::future::ready(Ok(deny(&status))));
                        }
                    }
                }
                Box::pin(async move { inner.call(req).await })
            }
        }
    }
}

/// Build the trailers-only gRPC refusal response for `status`.
fn deny(status: &Status) -> http::Response<BoxBody> {
    let body = http_body_util::Empty::new()
        .map_err(|never: std::convert::Infallible| -> Status { match never {} })
        .boxed_unsync();

    let mut response = http::Response::new(body);
    let headers = response.headers_mut();
    headers.insert(
        http::header::CONTENT_TYPE,
        http::HeaderValue::from_static("application/grpc"),
    );
    headers.insert(
        "grpc-status",
        http::HeaderValue::from_str(&(status.code() as i32).to_string())
            .expect("status code is a valid header value"),
    );
    if let Ok(message) = http::HeaderValue::from_str(status.message()) {
        headers.insert("grpc-message", message);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Account;
    use std::time::Duration;
    use tonic::Code;

    fn gate(secret: &str) -> AuthGate {
        AuthGate::new(
            Arc::new(TokenManager::new(secret, Duration::from_secs(120))),
            protected_methods(),
        )
    }

    fn token_for(secret: &str, username: &str) -> String {
        let manager = TokenManager::new(secret, Duration::from_secs(120));
        let account = Account {
            id: 1,
            username: username.into(),
            password_hash: String::new(),
            blocked: false,
        };
        manager.issue(&account).unwrap().0
    }

    #[test]
    fn protected_set_covers_the_full_surface() {
        let methods = protected_methods();
        assert_eq!(methods.len(), 11);
        assert!(methods.contains("/lockbox.v1.Secret/CreateSecret"));
        assert!(methods.contains("/lockbox.v1.File/DownloadFile"));
        assert!(!methods.contains("/lockbox.v1.Authentication/Login"));
    }

    #[test]
    fn open_methods_pass_without_credentials() {
        let g = gate("secret");
        let headers = http::HeaderMap::new();
        assert_eq!(
            g.check("/lockbox.v1.Authentication/Login", &headers).unwrap(),
            None
        );
    }

    #[test]
    fn protected_method_without_token_is_unauthenticated() {
        let g = gate("secret");
        let headers = http::HeaderMap::new();
        let status = g
            .check("/lockbox.v1.Secret/GetSecret", &headers)
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert_eq!(status.message(), "authorization token is not provided");
    }

    #[test]
    fn valid_token_resolves_the_identity() {
        let g = gate("secret");
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "authorization",
            token_for("secret", "alice").parse().unwrap(),
        );
        assert_eq!(
            g.check("/lockbox.v1.File/ListFiles", &headers).unwrap(),
            Some("alice".into())
        );
    }

    #[test]
    fn foreign_signed_token_is_unauthenticated() {
        let g = gate("secret");
        let mut headers = http::HeaderMap::new();
        headers.insert(
            "authorization",
            token_for("other-secret", "alice").parse().unwrap(),
        );
        let status = g
            .check("/lockbox.v1.Secret/ListSecret", &headers)
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
        assert!(status.message().starts_with("access token is invalid"));
    }

    #[test]
    fn garbage_token_is_unauthenticated() {
        let g = gate("secret");
        let mut headers = http::HeaderMap::new();
        headers.insert("authorization", "garbage".parse().unwrap());
        let status = g
            .check("/lockbox.v1.Secret/ListSecret", &headers)
            .unwrap_err();
        assert_eq!(status.code(), Code::Unauthenticated);
    }
}
