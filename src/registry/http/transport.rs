use std::sync::Arc;

use anyhow::Context;
use http::{Response, Uri};
use hyper::{Body, Client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::auth::{self, AuthResponse};
use super::request_runner::{run_single_request, RequestFailType};
use crate::credentials::CredentialSource;
use crate::ratelimit::{retry, RateLimiter, RetryClass, RetryPolicy};

/// The rate-limited, auth-refreshing, redirect-following HTTP transport every
/// registry request goes through: token-bucket wait, 429/5xx retry
/// classification (§4.7), auth-challenge response, and redirect-follow all
/// live in one retry loop so callers just await a result.
pub struct HttpTransport {
    pub(super) inner_client: Client<hyper_rustls::HttpsConnector<hyper::client::HttpConnector>>,
    pub(super) auth_info: Arc<Mutex<Option<AuthResponse>>>,
    pub(super) credentials: Arc<dyn CredentialSource>,
    pub(super) registry_name: String,
    pub(super) service_account: Option<String>,
    pub(super) limiter: Arc<RateLimiter>,
    pub(super) retry_policy: RetryPolicy,
    pub(super) cancel: CancellationToken,
}

impl HttpTransport {
    pub async fn request_simple(&self, uri: &Uri, method: http::Method) -> Result<Response<Body>, anyhow::Error> {
        self.request(uri.clone(), (), move |_, builder| {
            let method = method.clone();
            async move { builder.method(method).body(Body::from("")).map_err(|e| e.into()) }
        })
        .await
    }

    /// Run `complete_request` against `uri`, retrying per `self.retry_policy`
    /// and the shared `self.limiter`, transparently handling 401 challenges
    /// (mint a fresh token and retry) and 3xx redirects.
    pub async fn request<Fut, F, B>(
        &self,
        uri: Uri,
        context: B,
        complete_request: F,
    ) -> Result<Response<Body>, anyhow::Error>
    where
        F: Fn(B, http::request::Builder) -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<http::request::Request<Body>>>,
        B: Send + 'static + Sync + Clone,
    {
        let uri = Arc::new(Mutex::new(uri));
        let result = retry(
            &self.retry_policy,
            Some(&self.limiter),
            &self.cancel,
            classify,
            || {
                let uri = uri.clone();
                let context = context.clone();
                async move {
                    self.limiter.acquire(&self.cancel).await.map_err(RequestFailType::AnyhowError)?;
                    let current_uri = uri.lock().await.clone();

                    let outcome = run_single_request(
                        self.auth_info.clone(),
                        &current_uri,
                        context,
                        &complete_request,
                        &self.inner_client,
                    )
                    .await;

                    match &outcome {
                        Ok(_) => {}
                        Err(RequestFailType::Redirection(new_url)) => {
                            if let Ok(new_uri) = new_url.parse::<Uri>() {
                                let mut guard = uri.lock().await;
                                if new_uri.host().is_some() {
                                    *guard = new_uri;
                                } else {
                                    let mut parts = current_uri.into_parts();
                                    parts.path_and_query = new_uri.path_and_query().cloned();
                                    if let Ok(rebuilt) = Uri::from_parts(parts) {
                                        *guard = rebuilt;
                                    }
                                }
                            }
                        }
                        Err(RequestFailType::AuthFailure(_, bearer_config)) => {
                            let auth_info = auth::authenticate_request(
                                bearer_config,
                                &self.inner_client,
                                self.credentials.as_ref(),
                                &self.registry_name,
                                self.service_account.as_deref(),
                            )
                            .await
                            .map_err(RequestFailType::AnyhowError)?;
                            let mut ai = self.auth_info.lock().await;
                            *ai = Some(auth_info);
                        }
                        Err(_) => {}
                    }

                    outcome
                }
            },
        )
        .await;

        result.with_context(|| "Exhausted retries or hit a terminal error issuing an HTTP request".to_string())
    }
}

fn classify(err: &RequestFailType) -> RetryClass {
    match err {
        RequestFailType::ConnectError(_) => RetryClass::Transient,
        RequestFailType::ServerError(_) => RetryClass::Transient,
        RequestFailType::Throttled => RetryClass::Throttled,
        RequestFailType::Redirection(_) => RetryClass::Transient,
        RequestFailType::AuthFailure(_, _) => RetryClass::Transient,
        RequestFailType::HyperError(_) => RetryClass::Terminal,
        RequestFailType::AnyhowError(_) => RetryClass::Terminal,
    }
}
