//! Database model types.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Implements text round-tripping (`as_str`, `parse`, `Display`, rusqlite
/// `ToSql`/`FromSql`) for a fieldless enum stored as TEXT.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }

            pub fn parse(s: &str) -> Option<Self> {
                match s {
                    $($text => Some($ty::$variant),)+
                    _ => None,
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let s = value.as_str()?;
                $ty::parse(s).ok_or_else(|| {
                    FromSqlError::Other(format!("invalid {} value: {}", stringify!($ty), s).into())
                })
            }
        }
    };
}

/// Liveness of a client machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Online,
    Offline,
    Error,
}

text_enum!(ClientStatus {
    Online => "online",
    Offline => "offline",
    Error => "error",
});

/// Operating system family of a client machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Windows,
    Linux,
    Macos,
}

text_enum!(OsType {
    Windows => "windows",
    Linux => "linux",
    Macos => "macos",
});

/// Which client operating systems a package installs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsCompatibility {
    All,
    Windows,
    Linux,
    Macos,
}

text_enum!(OsCompatibility {
    All => "all",
    Windows => "windows",
    Linux => "linux",
    Macos => "macos",
});

impl OsCompatibility {
    pub fn supports(&self, os: OsType) -> bool {
        matches!(
            (self, os),
            (OsCompatibility::All, _)
                | (OsCompatibility::Windows, OsType::Windows)
                | (OsCompatibility::Linux, OsType::Linux)
                | (OsCompatibility::Macos, OsType::Macos)
        )
    }
}

/// State of one per-client deployment row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

text_enum!(RowState {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl RowState {
    /// Terminal states accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RowState::Completed | RowState::Failed | RowState::Cancelled
        )
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RowState::Pending | RowState::InProgress)
    }
}

/// A registered client machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientMachine {
    pub id: i64,
    pub hostname: String,
    pub ip_address: String,
    pub os_type: OsType,
    pub os_version: String,
    pub status: ClientStatus,
    pub last_seen: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
}

/// Registration payload for a client machine.
#[derive(Debug, Clone, Deserialize)]
pub struct NewClient {
    pub hostname: String,
    pub ip_address: String,
    pub os_type: OsType,
    #[serde(default)]
    pub os_version: String,
}

/// An uploaded software package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub name: String,
    pub version: String,
    pub description: String,
    pub os_compatibility: OsCompatibility,
    /// Artifact size in bytes.
    pub size: i64,
    /// Hex SHA-256 of the artifact.
    pub checksum: String,
    /// Opaque reference to the stored artifact blob.
    pub artifact_ref: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPackage {
    pub name: String,
    pub version: String,
    pub description: String,
    pub os_compatibility: OsCompatibility,
    pub size: i64,
    pub checksum: String,
    pub artifact_ref: String,
}

/// One request to install a package on a set of clients.
///
/// `client_ids` keeps request order.
#[derive(Debug, Clone, Serialize)]
pub struct Deployment {
    pub id: i64,
    pub package_id: i64,
    pub client_ids: Vec<i64>,
    pub description: String,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

impl Deployment {
    /// Whether the deployment may be dispatched at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_for.map_or(true, |at| at <= now)
    }
}

#[derive(Debug, Clone)]
pub struct NewDeployment {
    pub package_id: i64,
    pub client_ids: Vec<i64>,
    pub description: String,
    pub created_by: Option<String>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

/// Per-(deployment, client) execution record.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentStatus {
    pub id: i64,
    pub deployment_id: i64,
    pub client_id: i64,
    #[serde(rename = "status")]
    pub state: RowState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub log_output: String,
}

/// A status row joined with its client.
#[derive(Debug, Clone)]
pub struct StatusDetail {
    pub status: DeploymentStatus,
    pub client: ClientMachine,
}

/// A deployment joined with its package and rows, read as one snapshot.
#[derive(Debug, Clone)]
pub struct DeploymentDetail {
    pub deployment: Deployment,
    pub package: Package,
    pub statuses: Vec<StatusDetail>,
}
