//! Authentication credentials for driver sessions.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Credentials presented during session authentication.
///
/// Serializes to the parameter shape the `signin` RPC expects; scope is
/// inferred on the server side from which fields are present.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Credentials {
    /// A user scoped to a single database.
    Database {
        /// User name.
        #[serde(rename = "user")]
        username: String,
        /// Password.
        #[serde(rename = "pass")]
        password: String,
        /// Namespace the user lives in.
        #[serde(rename = "ns")]
        namespace: String,
        /// Database the user lives in.
        #[serde(rename = "db")]
        database: String,
    },
    /// A user scoped to a namespace.
    Namespace {
        /// User name.
        #[serde(rename = "user")]
        username: String,
        /// Password.
        #[serde(rename = "pass")]
        password: String,
        /// Namespace the user lives in.
        #[serde(rename = "ns")]
        namespace: String,
    },
    /// A root-level user.
    Root {
        /// User name.
        #[serde(rename = "user")]
        username: String,
        /// Password.
        #[serde(rename = "pass")]
        password: String,
    },
}

impl Credentials {
    /// Root-level credentials.
    pub fn root(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Root {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Namespace-scoped credentials.
    pub fn namespace(
        username: impl Into<String>,
        password: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Self {
        Self::Namespace {
            username: username.into(),
            password: password.into(),
            namespace: namespace.into(),
        }
    }

    /// Database-scoped credentials.
    pub fn database(
        username: impl Into<String>,
        password: impl Into<String>,
        namespace: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self::Database {
            username: username.into(),
            password: password.into(),
            namespace: namespace.into(),
            database: database.into(),
        }
    }

    /// The user name, regardless of scope.
    #[must_use]
    pub fn username(&self) -> &str {
        match self {
            Self::Root { username, .. }
            | Self::Namespace { username, .. }
            | Self::Database { username, .. } => username,
        }
    }
}

// Passwords never reach logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Root { username, .. } => f
                .debug_struct("Root")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Self::Namespace {
                username,
                namespace,
                ..
            } => f
                .debug_struct("Namespace")
                .field("username", username)
                .field("password", &"<redacted>")
                .field("namespace", namespace)
                .finish(),
            Self::Database {
                username,
                namespace,
                database,
                ..
            } => f
                .debug_struct("Database")
                .field("username", username)
                .field("password", &"<redacted>")
                .field("namespace", namespace)
                .field("database", database)
                .finish(),
        }
    }
}
