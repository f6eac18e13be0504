//! Per-thread authentication context.
//!
//! Job bodies run on blocking worker threads, so the principal a job acts as
//! is bound to the thread for the duration of the call and restored after.

use std::cell::RefCell;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub domain: String,
    pub username: String,
    pub admin: bool,
}

thread_local! {
    static CURRENT: RefCell<Option<AuthContext>> = const { RefCell::new(None) };
}

/// Restores the previous context when dropped, including on unwind.
struct ContextGuard {
    previous: Option<AuthContext>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

fn enter(context: AuthContext) -> ContextGuard {
    let previous = CURRENT.with(|current| current.borrow_mut().replace(context));
    ContextGuard { previous }
}

#[derive(Debug, Clone)]
pub struct SecurityContext {
    admin_user: String,
}

impl SecurityContext {
    pub fn new(admin_user: &str) -> Self {
        Self {
            admin_user: admin_user.to_string(),
        }
    }

    pub fn admin_user(&self) -> &str {
        &self.admin_user
    }

    /// Runs `f` as the administrator of `domain`.
    pub fn call_as_admin<T>(&self, domain: &str, f: impl FnOnce() -> T) -> T {
        self.call_as(
            AuthContext {
                domain: domain.to_string(),
                username: self.admin_user.clone(),
                admin: true,
            },
            f,
        )
    }

    pub fn call_as<T>(&self, context: AuthContext, f: impl FnOnce() -> T) -> T {
        let _guard = enter(context);
        f()
    }
}

pub fn current() -> Option<AuthContext> {
    CURRENT.with(|current| current.borrow().clone())
}

pub fn current_domain() -> Option<String> {
    current().map(|c| c.domain)
}

/// Name of the acting principal, or `fallback` outside of any context.
pub fn who(fallback: &str) -> String {
    current()
        .map(|c| c.username)
        .unwrap_or_else(|| fallback.to_string())
}
