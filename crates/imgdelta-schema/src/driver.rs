use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Backing filesystem technology of the image store.
///
/// Unknown driver names are preserved in [`DriverKind::Unsupported`] so the
/// decoder can name them when it refuses to build a baseline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum DriverKind {
    Btrfs,
    Overlay,
    Aufs,
    Overlay2,
    Unsupported(String),
}

impl DriverKind {
    pub fn as_str(&self) -> &str {
        match self {
            DriverKind::Btrfs => "btrfs",
            DriverKind::Overlay => "overlay",
            DriverKind::Aufs => "aufs",
            DriverKind::Overlay2 => "overlay2",
            DriverKind::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, DriverKind::Unsupported(_))
    }
}

impl From<&str> for DriverKind {
    fn from(name: &str) -> Self {
        match name.trim() {
            "btrfs" => DriverKind::Btrfs,
            "overlay" => DriverKind::Overlay,
            "aufs" => DriverKind::Aufs,
            "overlay2" => DriverKind::Overlay2,
            other => DriverKind::Unsupported(other.to_owned()),
        }
    }
}

impl From<String> for DriverKind {
    fn from(name: String) -> Self {
        DriverKind::from(name.as_str())
    }
}

impl From<DriverKind> for String {
    fn from(kind: DriverKind) -> Self {
        kind.as_str().to_owned()
    }
}

impl FromStr for DriverKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(DriverKind::from(s))
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_drivers_parse() {
        assert_eq!(DriverKind::from("btrfs"), DriverKind::Btrfs);
        assert_eq!(DriverKind::from("overlay"), DriverKind::Overlay);
        assert_eq!(DriverKind::from("aufs"), DriverKind::Aufs);
        assert_eq!(DriverKind::from("overlay2"), DriverKind::Overlay2);
    }

    #[test]
    fn unknown_driver_keeps_its_name() {
        let kind = DriverKind::from("devicemapper");
        assert_eq!(kind, DriverKind::Unsupported("devicemapper".to_owned()));
        assert!(!kind.is_supported());
        assert_eq!(kind.to_string(), "devicemapper");
    }

    #[test]
    fn serde_uses_plain_strings() {
        let json = serde_json::to_string(&DriverKind::Overlay2).unwrap();
        assert_eq!(json, "\"overlay2\"");
        let back: DriverKind = serde_json::from_str("\"zfs\"").unwrap();
        assert_eq!(back, DriverKind::Unsupported("zfs".to_owned()));
    }
}
