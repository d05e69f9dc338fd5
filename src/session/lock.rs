use std::fmt;

/// Identifies one session. Tokens are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionToken(u64);

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type Release = Box<dyn FnOnce()>;

/// Exclusive ownership of the capture/render/segmentation lifecycle.
///
/// Acquiring revokes the current holder first and runs its release callback
/// before the new token becomes active.
#[derive(Default)]
pub struct RunLock {
    last: u64,
    active: Option<(SessionToken, Release)>,
}

impl fmt::Debug for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLock")
            .field("last", &self.last)
            .field("active", &self.active())
            .finish()
    }
}

impl RunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&mut self, release: impl FnOnce() + 'static) -> SessionToken {
        if let Some((previous, release)) = self.active.take() {
            tracing::debug!("Revoking session {}", previous);
            release();
        }
        self.last += 1;
        let token = SessionToken(self.last);
        self.active = Some((token, Box::new(release)));
        token
    }

    /// Release `token` if it is the active one. Returns whether anything was
    /// released; a stale token is a no-op.
    pub fn release(&mut self, token: SessionToken) -> bool {
        match self.active.take() {
            Some((active, release)) if active == token => {
                release();
                true
            }
            other => {
                self.active = other;
                false
            }
        }
    }

    pub fn is_active(&self, token: SessionToken) -> bool {
        self.active() == Some(token)
    }

    pub fn active(&self) -> Option<SessionToken> {
        self.active.as_ref().map(|(token, _)| *token)
    }
}
