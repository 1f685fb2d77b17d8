//! Lifecycle hooks: async callbacks the host runs at session milestones.
//!
//! Every hook is bounded by `hook_timeout_ms`. Only `on_session_start` can
//! stop anything: if it fails or times out the session never becomes
//! active. The others are best-effort and their failures are logged.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use gwsession_protocol::{EndReason, SessionRecord};

use crate::SessionError;

/// What a hook returns. Any error type will do; only its message is kept.
pub type HookResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

type Hook = Arc<dyn Fn(HookContext) -> BoxFuture<'static, HookResult> + Send + Sync>;

/// Which hook ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    SessionStart,
    SessionEnd,
    SessionExtend,
    SessionWarning,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::SessionStart => "on_session_start",
            Self::SessionEnd => "on_session_end",
            Self::SessionExtend => "on_session_extend",
            Self::SessionWarning => "on_session_warning",
        };
        f.write_str(s)
    }
}

/// Passed to every hook.
#[derive(Debug, Clone)]
pub struct HookContext {
    /// The session as of the milestone (after an extension, the new
    /// expiry is already in it).
    pub record: SessionRecord,
    pub remaining_seconds: u64,
    /// Set for `on_session_end` only.
    pub reason: Option<EndReason>,
}

/// The set of hooks for one session. All optional.
///
/// ```rust
/// use gwsession::LifecycleHooks;
///
/// let hooks = LifecycleHooks::new()
///     .on_session_start(|ctx| async move {
///         println!("session {} started", ctx.record.session_id);
///         Ok(())
///     })
///     .on_session_warning(|ctx| async move {
///         println!("{}s left", ctx.remaining_seconds);
///         Ok(())
///     });
/// # drop(hooks);
/// ```
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    start: Option<Hook>,
    end: Option<Hook>,
    extend: Option<Hook>,
    warning: Option<Hook>,
}

fn boxed<F, Fut>(f: F) -> Hook
where
    F: Fn(HookContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HookResult> + Send + 'static,
{
    Arc::new(move |ctx| f(ctx).boxed())
}

impl LifecycleHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before the session becomes active. Failing blocks the start.
    pub fn on_session_start<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.start = Some(boxed(f));
        self
    }

    pub fn on_session_end<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.end = Some(boxed(f));
        self
    }

    pub fn on_session_extend<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.extend = Some(boxed(f));
        self
    }

    /// Runs once when the warning threshold is reached, before the
    /// `Warning` event is emitted.
    pub fn on_session_warning<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        self.warning = Some(boxed(f));
        self
    }

    fn get(&self, kind: HookKind) -> Option<&Hook> {
        match kind {
            HookKind::SessionStart => self.start.as_ref(),
            HookKind::SessionEnd => self.end.as_ref(),
            HookKind::SessionExtend => self.extend.as_ref(),
            HookKind::SessionWarning => self.warning.as_ref(),
        }
    }

    /// Runs one hook within `timeout`. A missing hook succeeds at once.
    ///
    /// # Errors
    /// [`SessionError::HookTimeout`] or [`SessionError::HookFailed`].
    pub(crate) async fn run(
        &self,
        kind: HookKind,
        ctx: HookContext,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let Some(hook) = self.get(kind) else {
            return Ok(());
        };
        match tokio::time::timeout(timeout, hook(ctx)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::HookFailed {
                hook: kind,
                message: e.to_string(),
            }),
            Err(_) => Err(SessionError::HookTimeout {
                hook: kind,
                timeout,
            }),
        }
    }

    /// Runs a best-effort hook: failures are logged and swallowed.
    pub(crate) async fn run_best_effort(&self, kind: HookKind, ctx: HookContext, timeout: Duration) {
        if let Err(e) = self.run(kind, ctx, timeout).await {
            tracing::warn!(hook = %kind, error = %e, "lifecycle hook failed");
        }
    }
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("on_session_start", &self.start.is_some())
            .field("on_session_end", &self.end.is_some())
            .field("on_session_extend", &self.extend.is_some())
            .field("on_session_warning", &self.warning.is_some())
            .finish()
    }
}
