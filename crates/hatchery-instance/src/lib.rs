use std::collections::HashSet;
use std::fmt;

/// Stable instance identifier.
///
/// Doubles as the data directory name and the container name suffix, so it is
/// restricted to characters that are safe in both places.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Validates an externally supplied id.
    pub fn parse(raw: &str) -> Option<Self> {
        let id = raw.trim();
        if id.is_empty() || id.len() > 128 {
            return None;
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return None;
        }
        if id.starts_with('.') {
            return None;
        }
        Some(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Record persisted, nothing touched in the runtime yet.
    Created,
    Installing,
    /// Installed; container exists but is not running.
    Stopped,
    Running,
    Deleting,
    /// Record exists but no container could be found for it.
    Offline,
}

impl InstanceState {
    /// States that are owned by an in-flight operation rather than derived from
    /// the runtime's view of the container.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            InstanceState::Created | InstanceState::Installing | InstanceState::Deleting
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Created => "created",
            InstanceState::Installing => "installing",
            InstanceState::Stopped => "stopped",
            InstanceState::Running => "running",
            InstanceState::Deleting => "deleting",
            InstanceState::Offline => "offline",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

impl PortProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            PortProtocol::Tcp => "tcp",
            PortProtocol::Udp => "udp",
        }
    }
}

fn default_protocol() -> PortProtocol {
    PortProtocol::Tcp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PortMapping {
    pub internal: u16,
    /// Host port. `0` asks the orchestrator to pick one.
    pub external: u16,
    #[serde(default = "default_protocol")]
    pub protocol: PortProtocol,
}

impl PortMapping {
    pub fn tcp(internal: u16, external: u16) -> Self {
        Self {
            internal,
            external,
            protocol: PortProtocol::Tcp,
        }
    }

    /// Parses `internal:external[/udp]`, or a bare `port` meaning the same on both sides.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (ports, protocol) = match raw.rsplit_once('/') {
            Some((p, "tcp")) => (p, PortProtocol::Tcp),
            Some((p, "udp")) => (p, PortProtocol::Udp),
            Some(_) => return None,
            None => (raw, PortProtocol::Tcp),
        };
        let (internal, external) = match ports.split_once(':') {
            Some((i, e)) => (i.parse().ok()?, e.parse().ok()?),
            None => {
                let p = ports.parse().ok()?;
                (p, p)
            }
        };
        if internal == 0 {
            return None;
        }
        Some(Self {
            internal,
            external,
            protocol,
        })
    }
}

/// Returns the first internal port that appears twice for the same protocol.
pub fn duplicate_internal_port(ports: &[PortMapping]) -> Option<u16> {
    let mut seen = HashSet::new();
    ports
        .iter()
        .find(|p| !seen.insert((p.internal, p.protocol)))
        .map(|p| p.internal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    /// 100 = one full core.
    #[serde(default = "default_cpu_percent")]
    pub cpu_percent: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

fn default_cpu_percent() -> u64 {
    100
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 1024,
            cpu_percent: default_cpu_percent(),
            disk_mb: 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_is_non_empty_and_parses_back() {
        let id = InstanceId::new();
        assert!(!id.0.is_empty());
        assert_eq!(InstanceId::parse(id.as_str()), Some(id));
    }

    #[test]
    fn instance_id_rejects_path_like_values() {
        assert!(InstanceId::parse("").is_none());
        assert!(InstanceId::parse("../etc").is_none());
        assert!(InstanceId::parse("a/b").is_none());
        assert!(InstanceId::parse(".hidden").is_none());
        assert!(InstanceId::parse("ok-id_1.2").is_some());
    }

    #[test]
    fn port_mapping_parse_forms() {
        assert_eq!(PortMapping::parse("25565"), Some(PortMapping::tcp(25565, 25565)));
        assert_eq!(PortMapping::parse("25565:30000"), Some(PortMapping::tcp(25565, 30000)));
        let udp = PortMapping::parse("7777:0/udp").unwrap();
        assert_eq!(udp.protocol, PortProtocol::Udp);
        assert_eq!(udp.external, 0);
        assert!(PortMapping::parse("0:80").is_none());
        assert!(PortMapping::parse("80/sctp").is_none());
        assert!(PortMapping::parse("abc").is_none());
    }

    #[test]
    fn duplicate_internal_ports_are_detected_per_protocol() {
        let ports = vec![PortMapping::tcp(25565, 1), PortMapping::tcp(25575, 2)];
        assert_eq!(duplicate_internal_port(&ports), None);

        let mut with_udp = ports.clone();
        with_udp.push(PortMapping {
            internal: 25565,
            external: 3,
            protocol: PortProtocol::Udp,
        });
        assert_eq!(duplicate_internal_port(&with_udp), None);

        let mut dup = ports;
        dup.push(PortMapping::tcp(25565, 4));
        assert_eq!(duplicate_internal_port(&dup), Some(25565));
    }

    #[test]
    fn state_serializes_snake_case() {
        let s = serde_json::to_string(&InstanceState::Offline).unwrap();
        assert_eq!(s, "\"offline\"");
        assert!(InstanceState::Installing.is_transitional());
        assert!(!InstanceState::Running.is_transitional());
    }

    #[test]
    fn limits_default_cpu_when_missing() {
        let l: ResourceLimits = serde_json::from_str(r#"{"memory_mb":2048}"#).unwrap();
        assert_eq!(l.cpu_percent, 100);
        assert_eq!(l.disk_mb, 0);
    }
}
