//! Login flow around an external authentication SDK.
//!
//! The SDK does the actual authentication. This module owns what happens
//! around it: which inputs survive a failure, when to ask for a two-factor
//! code, and what gets persisted afterwards.

use std::future::Future;
use std::pin::Pin;

use crate::error::SessionError;
use crate::session::{AUTHED_KEY, SdkConfig, SessionStorage, persist_sdk_config};

/// SDK error code asking for a two-factor code.
pub const ENTER_2FA_CODE: &str = "enter_2fa";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("two-factor code required")]
    TwoFactorRequired,

    /// Any other SDK failure; `message` is shown to the user verbatim.
    #[error("{message}")]
    Api { code: String, message: String },

    #[error("session storage error: {message}")]
    Session { message: String },
}

impl AuthError {
    pub fn from_api(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        if code == ENTER_2FA_CODE {
            return Self::TwoFactorRequired;
        }
        Self::Api {
            code,
            message: message.into(),
        }
    }
}

impl From<SessionError> for AuthError {
    fn from(e: SessionError) -> Self {
        Self::Session {
            message: e.to_string(),
        }
    }
}

pub type SdkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, AuthError>> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthInfo {
    pub id: u64,
    pub auth_version: u32,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub two_factor_code: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

pub trait AuthSdk: Send + Sync {
    fn auth_info<'a>(&'a self, email: &'a str) -> SdkFuture<'a, AuthInfo>;

    /// Reconfigures the SDK instance.
    fn setup<'a>(&'a self, config: SdkConfig) -> SdkFuture<'a, ()>;

    fn login<'a>(&'a self, credentials: &'a Credentials) -> SdkFuture<'a, ()>;

    fn forgot_password<'a>(&'a self, email: &'a str) -> SdkFuture<'a, ()>;

    /// Current configuration, including secrets after a successful login.
    fn config(&self) -> SdkConfig;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
    pub two_factor_code: String,
    pub show_two_factor_input: bool,
    pub use_recovery_key: bool,
    pub loading: bool,
}

impl LoginForm {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    fn reset_secrets(&mut self) {
        self.password.clear();
        self.two_factor_code.clear();
        self.show_two_factor_input = false;
        self.use_recovery_key = false;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Plans { plan_id: String },
    Drive { base_folder_uuid: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginOutcome {
    /// Nothing to submit, or a login is already running.
    Ignored,
    NeedsTwoFactor,
    LoggedIn { redirect: Redirect },
}

/// `planId` query value of the URL the login page was opened with.
pub fn plan_id_from_url(url: &str) -> Option<&str> {
    let (_, rest) = url.split_once("?planId=")?;
    let id = rest.split(['&', '#']).next().unwrap_or_default();
    (!id.is_empty()).then_some(id)
}

/// Runs one login attempt and updates `form` the way the login page does.
///
/// On `enter_2fa` the two-factor input is shown and nothing else changes.
/// Any other failure clears password and two-factor code but keeps the
/// email, and is returned for display.
pub async fn login(
    form: &mut LoginForm,
    sdk: &dyn AuthSdk,
    storage: &dyn SessionStorage,
    entry_url: &str,
) -> Result<LoginOutcome, AuthError> {
    let email = form.email.trim().to_string();
    if form.loading || email.is_empty() || form.password.is_empty() {
        return Ok(LoginOutcome::Ignored);
    }

    form.loading = true;
    let result = attempt_login(form, &email, sdk, storage, entry_url).await;
    form.loading = false;

    match result {
        Ok(redirect) => {
            tracing::info!(event = "auth.login_succeeded", "auth.login_succeeded");
            Ok(LoginOutcome::LoggedIn { redirect })
        }
        Err(AuthError::TwoFactorRequired) => {
            tracing::info!(event = "auth.two_factor_required", "auth.two_factor_required");
            form.two_factor_code.clear();
            form.show_two_factor_input = true;
            Ok(LoginOutcome::NeedsTwoFactor)
        }
        Err(e) => {
            tracing::warn!(event = "auth.login_failed", error = %e, "auth.login_failed");
            form.reset_secrets();
            Err(e)
        }
    }
}

async fn attempt_login(
    form: &LoginForm,
    email: &str,
    sdk: &dyn AuthSdk,
    storage: &dyn SessionStorage,
    entry_url: &str,
) -> Result<Redirect, AuthError> {
    let info = sdk.auth_info(email).await?;

    sdk.setup(SdkConfig {
        email: email.to_string(),
        connect_to_socket: true,
        metadata_cache: true,
        auth_version: info.auth_version,
        user_id: info.id,
        ..SdkConfig::default()
    })
    .await?;

    let credentials = Credentials {
        email: email.to_string(),
        password: form.password.clone(),
        two_factor_code: form.two_factor_code.clone(),
    };
    sdk.login(&credentials).await?;

    storage.clear()?;
    let persisted = persist_sdk_config(storage, &sdk.config())?;
    sdk.setup(persisted.clone()).await?;
    storage.set(AUTHED_KEY, "true")?;

    Ok(match plan_id_from_url(entry_url) {
        Some(plan_id) => Redirect::Plans {
            plan_id: plan_id.to_string(),
        },
        None => Redirect::Drive {
            base_folder_uuid: persisted.base_folder_uuid,
        },
    })
}

/// Requests a password-reset mail. Blank input is a no-op and returns false.
pub async fn forgot_password(sdk: &dyn AuthSdk, email: &str) -> Result<bool, AuthError> {
    let email = email.trim();
    if email.is_empty() {
        return Ok(false);
    }
    sdk.forgot_password(email).await?;
    tracing::info!(event = "auth.password_reset_requested", "auth.password_reset_requested");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::session::{MemorySessionStorage, REDACTED, SDK_CONFIG_KEY, is_authed, load_sdk_config};

    #[derive(Default)]
    struct FakeSdk {
        config: Mutex<SdkConfig>,
        require_2fa: bool,
        fail_with: Option<AuthError>,
        forgot: Mutex<Vec<String>>,
        logins: Mutex<Vec<Credentials>>,
    }

    impl AuthSdk for FakeSdk {
        fn auth_info<'a>(&'a self, _email: &'a str) -> SdkFuture<'a, AuthInfo> {
            Box::pin(async move {
                Ok(AuthInfo {
                    id: 7,
                    auth_version: 2,
                })
            })
        }

        fn setup<'a>(&'a self, config: SdkConfig) -> SdkFuture<'a, ()> {
            Box::pin(async move {
                *self.config.lock().unwrap() = config;
                Ok(())
            })
        }

        fn login<'a>(&'a self, credentials: &'a Credentials) -> SdkFuture<'a, ()> {
            Box::pin(async move {
                self.logins.lock().unwrap().push(credentials.clone());
                if let Some(e) = &self.fail_with {
                    return Err(e.clone());
                }
                if self.require_2fa && credentials.two_factor_code.is_empty() {
                    return Err(AuthError::from_api(ENTER_2FA_CODE, "Enter 2FA"));
                }
                let mut config = self.config.lock().unwrap();
                config.password = credentials.password.clone();
                config.two_factor_code = credentials.two_factor_code.clone();
                config.base_folder_uuid = "base-folder".to_string();
                Ok(())
            })
        }

        fn forgot_password<'a>(&'a self, email: &'a str) -> SdkFuture<'a, ()> {
            Box::pin(async move {
                self.forgot.lock().unwrap().push(email.to_string());
                Ok(())
            })
        }

        fn config(&self) -> SdkConfig {
            self.config.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn success_persists_redacted_config_and_authed_flag() {
        let sdk = FakeSdk::default();
        let storage = MemorySessionStorage::new();
        storage.set("stale", "value").unwrap();
        let mut form = LoginForm::new("  user@example.com ", "hunter2");

        let outcome = login(&mut form, &sdk, &storage, "https://app.example/login")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            LoginOutcome::LoggedIn {
                redirect: Redirect::Drive {
                    base_folder_uuid: "base-folder".to_string()
                }
            }
        );
        assert!(is_authed(&storage).unwrap());
        assert_eq!(storage.get("stale").unwrap(), None);

        let raw = storage.get(SDK_CONFIG_KEY).unwrap().unwrap();
        assert!(!raw.contains("hunter2"));
        let persisted = load_sdk_config(&storage).unwrap().unwrap();
        assert_eq!(persisted.password, REDACTED);
        assert_eq!(persisted.two_factor_code, REDACTED);
        assert_eq!(persisted.email, "user@example.com");
        assert_eq!(persisted.user_id, 7);
        assert_eq!(sdk.config().password, REDACTED);
        assert!(!form.loading);
    }

    #[tokio::test]
    async fn enter_2fa_shows_code_input_and_keeps_password() {
        let sdk = FakeSdk {
            require_2fa: true,
            ..FakeSdk::default()
        };
        let storage = MemorySessionStorage::new();
        let mut form = LoginForm::new("user@example.com", "hunter2");
        form.two_factor_code = String::new();

        let outcome = login(&mut form, &sdk, &storage, "").await.unwrap();
        assert_eq!(outcome, LoginOutcome::NeedsTwoFactor);
        assert!(form.show_two_factor_input);
        assert_eq!(form.password, "hunter2");
        assert!(!is_authed(&storage).unwrap());

        form.two_factor_code = "123456".to_string();
        let outcome = login(&mut form, &sdk, &storage, "https://app.example/login?planId=pro")
            .await
            .unwrap();
        assert_eq!(
            outcome,
            LoginOutcome::LoggedIn {
                redirect: Redirect::Plans {
                    plan_id: "pro".to_string()
                }
            }
        );
        let raw = storage.get(SDK_CONFIG_KEY).unwrap().unwrap();
        assert!(!raw.contains("123456"));
    }

    #[tokio::test]
    async fn other_errors_reset_secrets_but_keep_email() {
        let sdk = FakeSdk {
            fail_with: Some(AuthError::from_api("email_or_password_wrong", "Invalid credentials")),
            ..FakeSdk::default()
        };
        let storage = MemorySessionStorage::new();
        let mut form = LoginForm::new("user@example.com", "wrong");
        form.two_factor_code = "000000".to_string();
        form.show_two_factor_input = true;
        form.use_recovery_key = true;

        let err = login(&mut form, &sdk, &storage, "").await.unwrap_err();
        assert_eq!(err.to_string(), "Invalid credentials");
        assert_eq!(form.email, "user@example.com");
        assert!(form.password.is_empty());
        assert!(form.two_factor_code.is_empty());
        assert!(!form.show_two_factor_input);
        assert!(!form.use_recovery_key);
        assert!(!form.loading);
        assert!(!is_authed(&storage).unwrap());
    }

    #[tokio::test]
    async fn empty_inputs_or_running_login_are_ignored() {
        let sdk = FakeSdk::default();
        let storage = MemorySessionStorage::new();

        let mut form = LoginForm::new("   ", "pw");
        assert_eq!(login(&mut form, &sdk, &storage, "").await.unwrap(), LoginOutcome::Ignored);

        let mut form = LoginForm::new("a@b.c", "");
        assert_eq!(login(&mut form, &sdk, &storage, "").await.unwrap(), LoginOutcome::Ignored);

        let mut form = LoginForm::new("a@b.c", "pw");
        form.loading = true;
        assert_eq!(login(&mut form, &sdk, &storage, "").await.unwrap(), LoginOutcome::Ignored);

        assert!(sdk.logins.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forgot_password_trims_and_skips_blank() {
        let sdk = FakeSdk::default();
        assert!(!forgot_password(&sdk, "  ").await.unwrap());
        assert!(forgot_password(&sdk, " user@example.com ").await.unwrap());
        assert_eq!(*sdk.forgot.lock().unwrap(), vec!["user@example.com".to_string()]);
    }

    #[test]
    fn plan_id_parsing() {
        assert_eq!(plan_id_from_url("https://x/login?planId=42"), Some("42"));
        assert_eq!(plan_id_from_url("https://x/login?planId=42&ref=a"), Some("42"));
        assert_eq!(plan_id_from_url("https://x/login?planId="), None);
        assert_eq!(plan_id_from_url("https://x/login"), None);
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let c = Credentials {
            email: "a@b.c".to_string(),
            password: "hunter2".to_string(),
            two_factor_code: "123456".to_string(),
        };
        let text = format!("{c:?}");
        assert!(!text.contains("hunter2"));
        assert!(!text.contains("123456"));
    }
}
