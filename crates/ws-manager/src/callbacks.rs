//! Process-level extension points invoked by the ephemeral manager.
//!
//! Downstream systems (e.g. a per-session MCP pool, a skills-cache layer)
//! register a callback once at process startup via these functions instead
//! of `ws-manager` depending on them directly — that would make the
//! dependency graph circular, since those systems already depend on
//! `ws-manager` for checkout/commit.

use std::sync::OnceLock;

pub type CheckoutCallback = Box<dyn Fn(&str, &str, &str) + Send + Sync>;
pub type SkillsInvalidationCallback = Box<dyn Fn(&str, &str, u64) + Send + Sync>;

static CHECKOUT_CALLBACK: OnceLock<CheckoutCallback> = OnceLock::new();
static SKILLS_INVALIDATION_CALLBACK: OnceLock<SkillsInvalidationCallback> = OnceLock::new();

/// Register the checkout observer. Only the first registration in a
/// process takes effect; later calls are ignored (mirrors `OnceLock`
/// semantics — there is exactly one observer per process).
pub fn register_checkout_callback(cb: CheckoutCallback) {
    let _ = CHECKOUT_CALLBACK.set(cb);
}

pub fn register_skills_invalidation_callback(cb: SkillsInvalidationCallback) {
    let _ = SKILLS_INVALIDATION_CALLBACK.set(cb);
}

pub(crate) fn invoke_checkout(user_id: &str, project_id: &str, session_id: &str) {
    if let Some(cb) = CHECKOUT_CALLBACK.get() {
        cb(user_id, project_id, session_id);
    }
}

pub(crate) fn invoke_skills_invalidation(user_id: &str, project_id: &str, skills_generation: u64) {
    if let Some(cb) = SKILLS_INVALIDATION_CALLBACK.get() {
        cb(user_id, project_id, skills_generation);
    }
}
