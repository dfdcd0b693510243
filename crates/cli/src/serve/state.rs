//! Application state and admin credentials.

use cohort_core::{ExperimentStorage, LifecycleEngine, Settings};
use subtle::ConstantTimeEq;

/// Username and password guarding the admin routes.
pub(crate) struct AdminCredentials {
    username: String,
    password: String,
}

impl AdminCredentials {
    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self {
            username: settings.admin_username.clone(),
            password: settings.admin_password.clone(),
        }
    }

    /// Both comparisons always run, in constant time over the content.
    pub(crate) fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = username.as_bytes().ct_eq(self.username.as_bytes());
        let pass_ok = password.as_bytes().ct_eq(self.password.as_bytes());
        (user_ok & pass_ok).into()
    }
}

/// Application state shared across request handlers.
pub(crate) struct AppState<S> {
    pub(crate) engine: LifecycleEngine<S>,
    pub(crate) admin: AdminCredentials,
}

impl<S: ExperimentStorage> AppState<S> {
    pub(crate) fn new(engine: LifecycleEngine<S>) -> Self {
        let admin = AdminCredentials::from_settings(engine.settings());
        Self { engine, admin }
    }
}
