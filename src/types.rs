use serde::{Deserialize, Serialize};

/// External system an item was listed from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, clap::ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Drive,
    Slack,
}

impl SourceKind {
    pub const ALL: [SourceKind; 2] = [SourceKind::Drive, SourceKind::Slack];

    /// Name used for the knowledge-base subdirectory and in the state database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Drive => "drive",
            Self::Slack => "slack",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "drive" => Some(Self::Drive),
            "slack" => Some(Self::Slack),
            _ => None,
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the poll loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Auth or configuration problem: stop the owning loop.
    Fatal,
    /// Network trouble or rate limiting: retry later, state untouched.
    Transient,
    /// The item can never be fetched: record the decision, never retry.
    Skip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// How fetched items are named on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FileNamePolicy {
    /// `<stem>_<first 7 chars of id>.<ext>`, deterministic and collision-free.
    #[default]
    #[serde(rename = "name-id7")]
    NameId7,
    /// The remote name as-is, falling back to `name-id7` on collision.
    #[serde(rename = "name")]
    Name,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kind_round_trip() {
        for kind in SourceKind::ALL {
            assert_eq!(SourceKind::from_str(kind.as_str()), Some(kind));
        }
        assert_eq!(SourceKind::from_str("dropbox"), None);
    }

    #[test]
    fn file_name_policy_deserializes_from_cli_names() {
        let p: FileNamePolicy = serde_json::from_str("\"name-id7\"").unwrap();
        assert_eq!(p, FileNamePolicy::NameId7);
        let p: FileNamePolicy = serde_json::from_str("\"name\"").unwrap();
        assert_eq!(p, FileNamePolicy::Name);
    }
}
