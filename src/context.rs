//! Identity / tenant context
//!
//! Every engine operation takes a [`Context`]: who is calling, for which
//! tenant, and the cancellation / deadline signal for in-flight store calls.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, AppResult};

#[derive(Debug, Clone)]
pub struct Context {
    tenant_id: i64,
    user_id: i64,
    ignore_tenant: bool,
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    pub fn new(tenant_id: i64, user_id: i64) -> Self {
        Self {
            tenant_id,
            user_id,
            ignore_tenant: false,
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Context for background jobs acting on behalf of no particular user
    pub fn system(tenant_id: i64) -> Self {
        Self::new(tenant_id, 0)
    }

    /// Cross-tenant administration: repository reads are not tenant filtered
    /// and cached views are bypassed.
    pub fn ignoring_tenant(mut self) -> Self {
        self.ignore_tenant = true;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn tenant_id(&self) -> i64 {
        self.tenant_id
    }

    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn ignores_tenant(&self) -> bool {
        self.ignore_tenant
    }

    /// Tenant filter for repository reads (`None` = every tenant)
    pub fn tenant_scope(&self) -> Option<i64> {
        if self.ignore_tenant {
            None
        } else {
            Some(self.tenant_id)
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fail fast when the caller already gave up
    pub fn check(&self) -> AppResult<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(AppError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run a store call under this context's cancellation and deadline
    pub async fn run<T, F>(&self, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>>,
    {
        let guarded = async {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(AppError::Cancelled),
                res = fut => res,
            }
        };
        match self.deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, guarded)
                .await
                .unwrap_or(Err(AppError::DeadlineExceeded)),
            None => guarded.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_passes_result_through() {
        let ctx = Context::new(1, 2);
        let value = ctx.run(async { Ok::<_, AppError>(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(ctx.tenant_scope(), Some(1));
        assert_eq!(ctx.clone().ignoring_tenant().tenant_scope(), None);
    }

    #[tokio::test]
    async fn test_run_cancelled() {
        let token = CancellationToken::new();
        let ctx = Context::new(1, 2).with_cancellation(token.clone());
        token.cancel();
        let result: AppResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AppError::Cancelled)));
        assert!(ctx.check().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_deadline() {
        let ctx = Context::new(1, 2).with_timeout(Duration::from_millis(50));
        let result: AppResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AppError::DeadlineExceeded)));
    }
}
