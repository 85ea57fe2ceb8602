mod ident;
mod sensor;
mod source;
mod status;

pub use ident::{derive_slug, Identifier, NUMERIC_ID_MAX, NUMERIC_ID_MIN};
pub use sensor::SensorKind;
pub use source::RemoteSource;
pub use status::{DatasetStatus, SessionState};

use serde::{Deserialize, Serialize};

/// Visibility governs who may read or download a dataset.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    OnlyOwner,
    OnlyTeam,
    Public,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::OnlyOwner => "only_owner",
            Visibility::OnlyTeam => "only_team",
            Visibility::Public => "public",
        }
    }
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::OnlyOwner
    }
}

impl std::str::FromStr for Visibility {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "only_owner" => Ok(Visibility::OnlyOwner),
            "only_team" => Ok(Visibility::OnlyTeam),
            "public" => Ok(Visibility::Public),
            other => Err(format!("invalid visibility {other:?}")),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an issued bearer token.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
        }
    }
}

impl std::str::FromStr for TokenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "access" => Ok(TokenKind::Access),
            "refresh" => Ok(TokenKind::Refresh),
            other => Err(format!("invalid token kind {other:?}")),
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
