use core::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Globally unique ID of a graph node.
///
/// Two prefixes are distinguished:
///
/// - `~<pub>`: a user-owned soul whose fields must carry signatures
///   verifiable under `pub`;
/// - `~@<alias>`: an alias soul whose fields must each reference the soul
///   named by the field key.
///
/// Anything else is an unsigned public soul.
#[derive(Clone, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Deserialize, Serialize)]
#[serde(transparent)]
pub struct Soul(String);

impl Soul {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_string(self) -> String {
        self.0
    }

    /// Classify the soul by its ownership prefix.
    #[must_use]
    pub fn kind(&self) -> SoulKind<'_> {
        if let Some(alias) = self.0.strip_prefix("~@") {
            SoulKind::Alias { alias }
        } else if let Some(pub_key) = self.0.strip_prefix('~') {
            SoulKind::User { pub_key }
        } else {
            SoulKind::Public
        }
    }

    /// Whether merges into this soul require signature verification.
    #[must_use]
    pub fn is_user_owned(&self) -> bool {
        matches!(self.kind(), SoulKind::User { .. })
    }
}

impl From<String> for Soul {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for Soul {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl Display for Soul {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Soul {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ownership class of a soul, borrowed from its string form.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SoulKind<'a> {
    /// Unsigned public data.
    Public,
    /// `~<pub>`: owned by the holder of `pub`'s private key.
    User { pub_key: &'a str },
    /// `~@<alias>`: an alias record; every field must point at the soul
    /// spelled by the field key.
    Alias { alias: &'a str },
}
