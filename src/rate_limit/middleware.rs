use crate::error::AdmissionError;
use crate::rate_limit::{RateLimiter, UpstreamRequest, UpstreamResponse};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower_layer::Layer;
use tower_service::Service;

/// A layer that admits requests through a [`RateLimiter`] and reports their outcome.
#[derive(Clone, Debug)]
pub struct BudgetLayer<L> {
    limiter: Arc<L>,
    pace: bool,
}

impl<L> BudgetLayer<L> {
    /// Create a new budget layer.
    pub fn new(limiter: L) -> Self {
        Self { limiter: Arc::new(limiter), pace: false }
    }

    /// Wait out burst spacing before asking for admission instead of being rejected.
    pub fn with_pacing(mut self) -> Self {
        self.pace = true;
        self
    }
}

impl<S, L> Layer<S> for BudgetLayer<L>
where
    L: RateLimiter + 'static,
{
    type Service = BudgetService<S, L>;

    fn layer(&self, service: S) -> Self::Service {
        BudgetService { inner: service, limiter: self.limiter.clone(), pace: self.pace }
    }
}

/// Middleware service that charges the budget before each call and records the outcome.
///
/// Cache-only admissions are returned as [`AdmissionError::Denied`] with `cache_only` set:
/// the wrapped service is never called for them.
#[derive(Clone, Debug)]
pub struct BudgetService<S, L> {
    inner: S,
    limiter: Arc<L>,
    pace: bool,
}

impl<S, L, Req> Service<Req> for BudgetService<S, L>
where
    S: Service<Req> + Clone + Send + 'static,
    S::Response: UpstreamResponse + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + Sync + std::error::Error + 'static,
    L: RateLimiter + Send + Sync + 'static,
    Req: UpstreamRequest + Send + 'static,
{
    type Response = S::Response;
    type Error = AdmissionError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AdmissionError::Inner)
    }

    fn call(&mut self, req: Req) -> Self::Future {
        let limiter = self.limiter.clone();
        let pace = self.pace;
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        Box::pin(async move {
            if pace {
                limiter.pace().await?;
            }
            let endpoint = req.endpoint();
            let check = limiter.acquire(&endpoint).await?;
            if !check.is_live() {
                return Err(AdmissionError::Denied(check));
            }

            match inner.call(req).await {
                Ok(response) => {
                    if let Err(record_err) = limiter.record_success(response.rate_limit_info()).await {
                        tracing::error!(endpoint = %endpoint, error = %record_err, "Failed to record upstream success");
                    }
                    Ok(response)
                }
                Err(e) => {
                    if let Err(record_err) = limiter.record_failure().await {
                        tracing::error!(endpoint = %endpoint, error = %record_err, "Failed to record upstream failure");
                    }
                    Err(AdmissionError::Inner(e))
                }
            }
        })
    }
}
