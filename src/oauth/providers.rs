use serde_json::Value;

use crate::users::AuthProvider;

/// Identity attributes after provider-specific mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedIdentity {
    pub email: String,
    pub name: Option<String>,
    pub image_url: Option<String>,
}

/// Static description of a supported OAuth2 provider.
pub struct ProviderSpec {
    pub name: &'static str,
    pub provider: AuthProvider,
    pub authorize_url: &'static str,
    pub token_url: &'static str,
    pub userinfo_url: &'static str,
    pub scopes: &'static str,
    /// Maps raw user-info attributes; `None` when no email can be derived.
    pub extract: fn(&Value) -> Option<NormalizedIdentity>,
}

pub static PROVIDERS: &[ProviderSpec] = &[
    ProviderSpec {
        name: "google",
        provider: AuthProvider::Google,
        authorize_url: "https://accounts.google.com/o/oauth2/v2/auth",
        token_url: "https://oauth2.googleapis.com/token",
        userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
        scopes: "openid email profile",
        extract: extract_google,
    },
    ProviderSpec {
        name: "github",
        provider: AuthProvider::Github,
        authorize_url: "https://github.com/login/oauth/authorize",
        token_url: "https://github.com/login/oauth/access_token",
        userinfo_url: "https://api.github.com/user",
        scopes: "read:user user:email",
        extract: extract_github,
    },
];

pub fn find(name: &str) -> Option<&'static ProviderSpec> {
    PROVIDERS
        .iter()
        .find(|p| p.name.eq_ignore_ascii_case(name.trim()))
}

fn text(attrs: &Value, key: &str) -> Option<String> {
    attrs[key]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

fn extract_google(attrs: &Value) -> Option<NormalizedIdentity> {
    Some(NormalizedIdentity {
        email: text(attrs, "email")?,
        name: text(attrs, "name"),
        image_url: text(attrs, "picture"),
    })
}

fn extract_github(attrs: &Value) -> Option<NormalizedIdentity> {
    let login = text(attrs, "login");
    let email = text(attrs, "email")
        .or_else(|| login.as_ref().map(|l| format!("{l}@github.local")))?;
    Some(NormalizedIdentity {
        email,
        name: text(attrs, "name").or(login),
        image_url: text(attrs, "avatar_url"),
    })
}
