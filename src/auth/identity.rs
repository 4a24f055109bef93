use serde::Serialize;

/// Who is making the request, as established by the configured auth mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// Auth disabled; every caller is anonymous and unrestricted.
    Anonymous,

    /// Holder of the single shared Basic credential; unrestricted.
    SharedBasic { username: String },

    /// Per-user Basic credential from the users file.
    User { name: String },

    /// Bearer token validated against the identity provider.
    Oidc {
        /// Value of the configured identity claim
        subject: String,
        email: Option<String>,
        /// Role names from the configured roles claim, with the configured admin role
        /// normalized to `admin`
        roles: Vec<String>,
    },
}

impl Identity {
    /// Identities that bypass per-namespace checks entirely.
    pub fn is_unrestricted(&self) -> bool {
        matches!(self, Self::Anonymous | Self::SharedBasic { .. })
    }

    /// Name used for role bindings and logs.
    pub fn principal(&self) -> &str {
        match self {
            Self::Anonymous => "anonymous",
            Self::SharedBasic { username } => username,
            Self::User { name } => name,
            Self::Oidc { subject, .. } => subject,
        }
    }

    /// Role names asserted by the credential itself rather than stored bindings.
    pub fn claimed_roles(&self) -> &[String] {
        match self {
            Self::Oidc { roles, .. } => roles,
            _ => &[],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Anonymous => "anonymous",
            Self::SharedBasic { .. } => "basic",
            Self::User { .. } => "user",
            Self::Oidc { .. } => "oidc",
        }
    }
}
