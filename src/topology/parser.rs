//! Topology and profile file loading

use super::config::{ClusterTopology, ContainerGroupSpec, SD_CONTAINER_KEY, SD_DRIVER_KEY};
use super::port::{expand_multi_port, PortBinding};
use crate::error::{ArmadaError, Result};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Default topology file name
pub const DEFAULT_TOPOLOGY_FILE: &str = "cluster.yml";

/// Default profile file name
pub const DEFAULT_PROFILE_FILE: &str = "profile.yml";

/// Placeholder substituted from the active profile
const PLACEHOLDER_PATTERN: &str = r"\$\{(\w+)\}";

/// Placeholder substituted with a group's host port
const PORT_PLACEHOLDER: &str = "{port}";

/// Profile values by key
pub type Profile = HashMap<String, String>;

/// Contents of a profile file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterProfiles {
    /// Profile used when none is requested
    #[serde(alias = "activeprofile")]
    pub active_profile: String,
    /// Profiles by name
    pub profiles: HashMap<String, Profile>,
}

impl ClusterProfiles {
    /// Select a profile by name, falling back to the active one
    pub fn select(&self, name: Option<&str>) -> Result<&Profile> {
        let name = name.filter(|n| !n.is_empty()).unwrap_or(&self.active_profile);
        self.profiles
            .get(name)
            .ok_or_else(|| ArmadaError::InvalidConfig(format!("Profile '{}' not found", name)))
    }
}

/// Topology file parser
pub struct TopologyParser;

impl TopologyParser {
    /// Parse a topology file, applying a profile when the profile file exists
    pub fn parse_file(path: &Path, profile_file: Option<&Path>, profile: Option<&str>) -> Result<ClusterTopology> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ArmadaError::TopologyParse(format!("Failed to read {}: {}", path.display(), e)))?;

        let profiles = match profile_file {
            Some(p) => Self::parse_profiles_file(p)?,
            None => None,
        };

        match profiles {
            Some(profiles) => {
                let selected = profiles.select(profile)?;
                tracing::debug!("Applying profile with {} keys", selected.len());
                Self::parse_str(&content, Some(selected))
            }
            None => {
                if let Some(name) = profile {
                    tracing::warn!("Profile '{}' requested but no profile file was found", name);
                }
                Self::parse_str(&content, None)
            }
        }
    }

    /// Load a profile file; a missing file is not an error
    pub fn parse_profiles_file(path: &Path) -> Result<Option<ClusterProfiles>> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_yaml::from_str(&content)
            .map(Some)
            .map_err(|e| ArmadaError::Yaml(format!("Failed to parse profile file: {}", e)))
    }

    /// Parse topology text, substituting `${key}` from `profile` first
    pub fn parse_str(content: &str, profile: Option<&Profile>) -> Result<ClusterTopology> {
        let content = match profile {
            Some(p) => Self::apply_profile(content, p)?,
            None => content.to_string(),
        };

        let mut topology: ClusterTopology = serde_yaml::from_str(&content)
            .map_err(|e| ArmadaError::Yaml(format!("Failed to parse topology: {}", e)))?;

        topology.container.topology = Self::expand_container_groups(topology.container.topology)?;
        Self::validate(&topology)?;
        Ok(topology)
    }

    /// Replace every `${key}` with its profile value
    pub fn apply_profile(content: &str, profile: &Profile) -> Result<String> {
        if profile.is_empty() {
            return Ok(content.to_string());
        }

        let re = Regex::new(PLACEHOLDER_PATTERN).map_err(|e| ArmadaError::InvalidConfig(e.to_string()))?;

        let mut missing = Vec::new();
        let replaced = re.replace_all(content, |caps: &Captures| match profile.get(&caps[1]) {
            Some(v) => v.clone(),
            None => {
                missing.push(caps[1].to_string());
                caps[0].to_string()
            }
        });

        if !missing.is_empty() {
            return Err(ArmadaError::InvalidConfig(format!(
                "Profile has no value for: {}",
                missing.join(", ")
            )));
        }
        Ok(replaced.into_owned())
    }

    /// Split multi-port groups, parse port bindings and fill `{port}`
    fn expand_container_groups(groups: Vec<ContainerGroupSpec>) -> Result<Vec<ContainerGroupSpec>> {
        let mut expanded = Vec::with_capacity(groups.len());

        for spec in groups {
            if spec.port.trim().is_empty() {
                expanded.push(spec);
                continue;
            }

            for port in expand_multi_port(&spec.port) {
                let binding = PortBinding::parse(&port)?;
                let host_port = binding.host_port.to_string();

                let mut group = spec.clone();
                group.group = spec.group.replace(PORT_PLACEHOLDER, &host_port);
                group.url = spec.url.replace(PORT_PLACEHOLDER, &host_port);
                group.port = port;
                tracing::debug!("Port binding parsed for group {}: {}", group.group, binding);
                group.port_binding = Some(binding);
                expanded.push(group);
            }
        }

        Ok(expanded)
    }

    fn validate(topology: &ClusterTopology) -> Result<()> {
        let mut seen = HashSet::new();
        for spec in &topology.container.topology {
            if spec.group.is_empty() {
                return Err(ArmadaError::InvalidConfig("Container group without a name".to_string()));
            }
            if !seen.insert(spec.group.as_str()) {
                return Err(ArmadaError::InvalidConfig(format!(
                    "Container group '{}' declared twice",
                    spec.group
                )));
            }
            if spec.registers_service() && !topology.service_discover.contains_key(&spec.service_discover) {
                return Err(ArmadaError::InvalidConfig(format!(
                    "Container group '{}' registers with undeclared backend '{}'",
                    spec.group, spec.service_discover
                )));
            }
        }

        for (name, description) in &topology.service_discover {
            for key in [SD_DRIVER_KEY, SD_CONTAINER_KEY] {
                if description.get(key).map_or(true, |v| v.is_empty()) {
                    return Err(ArmadaError::InvalidConfig(format!(
                        "Service discover '{}' is missing '{}'",
                        name, key
                    )));
                }
            }
            if let Some(target) = topology.discovery_target(name) {
                if topology.container_group(target).is_none() {
                    return Err(ArmadaError::GroupNotFound(target.to_string()));
                }
            }
        }

        let mut seen = HashSet::new();
        for spec in &topology.machine.topology {
            if !seen.insert(spec.group.as_str()) {
                return Err(ArmadaError::InvalidConfig(format!(
                    "Machine group '{}' declared twice",
                    spec.group
                )));
            }
            if spec.max_num > 0 && spec.min_num > spec.max_num {
                return Err(ArmadaError::InvalidConfig(format!(
                    "Machine group '{}' has min_num {} above max_num {}",
                    spec.group, spec.min_num, spec.max_num
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    const TOPOLOGY: &str = r#"
cluster_by: swarm
master: master-1
master_group: master
discovery: consul://consul-1:8500/swarm
machine:
  cloud:
    aliyun:
      options: "--aliyun-region ${region}"
      default: true
  topology:
    - group: web
      min_num: 2
      max_num: 4
      consul: true
container:
  topology:
    - group: nginx
      num: 2
      image: nginx:1.9
      port: "80:80"
    - group: api-{port}
      num: 3
      image: ${api_image}
      url: v1.api-{port}
      port: "8080|8081:8080/tcp"
      deps: [nginx]
      service_discover: nginx-front
service_discover:
  nginx-front:
    driver: nginx-push
    container: nginx
    upstream: api
"#;

    fn profile() -> Profile {
        HashMap::from([
            ("region".to_string(), "cn-beijing".to_string()),
            ("api_image".to_string(), "registry/api:2".to_string()),
        ])
    }

    #[test]
    fn test_parse_with_profile() {
        let topology = TopologyParser::parse_str(TOPOLOGY, Some(&profile())).unwrap();

        assert_eq!(topology.cluster_by, "swarm");
        assert_eq!(topology.machine.cloud["aliyun"].create_options(), vec!["--aliyun-region", "cn-beijing"]);
        assert_eq!(topology.default_driver().map(|(n, _)| n), Some("aliyun"));

        let web = topology.machine_group("web").unwrap();
        assert_eq!((web.min_num, web.max_num), (2, 4));
        assert!(web.consul);

        let groups: Vec<&str> = topology.container.topology.iter().map(|c| c.group.as_str()).collect();
        assert_eq!(groups, vec!["nginx", "api-8080", "api-8081"]);

        let api = topology.container_group("api-8081").unwrap();
        assert_eq!(api.image, "registry/api:2");
        assert_eq!(api.url, "v1.api-8081");
        assert_eq!(api.deps, vec!["nginx"]);
        assert_eq!(api.container_port(), Some(8080));
        assert_eq!(api.port_binding.as_ref().unwrap().host_port, 8081);
        assert_eq!(topology.discovery_target("nginx-front"), Some("nginx"));
    }

    #[test]
    fn test_missing_placeholder_is_error() {
        let mut p = profile();
        p.remove("api_image");
        let err = TopologyParser::parse_str(TOPOLOGY, Some(&p)).unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("api_image"));
    }

    #[test]
    fn test_bad_port_is_config_error() {
        let content = "container:\n  topology:\n    - group: x\n      port: \"80:80/sctp\"\n";
        let err = TopologyParser::parse_str(content, None).unwrap_err();
        assert!(matches!(err, ArmadaError::InvalidPortBinding(_)));
    }

    #[test]
    fn test_undeclared_backend_rejected() {
        let content = "container:\n  topology:\n    - group: x\n      service_discover: nope\n";
        let err = TopologyParser::parse_str(content, None).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_parse_file_with_profile_file() {
        let dir = tempdir().unwrap();
        let topology_path = dir.path().join(DEFAULT_TOPOLOGY_FILE);
        let profile_path = dir.path().join(DEFAULT_PROFILE_FILE);

        std::fs::write(&topology_path, TOPOLOGY).unwrap();
        let mut f = std::fs::File::create(&profile_path).unwrap();
        writeln!(
            f,
            "active_profile: prod\nprofiles:\n  prod:\n    region: cn-hangzhou\n    api_image: api:prod\n  dev:\n    region: local\n    api_image: api:dev"
        )
        .unwrap();

        let prod = TopologyParser::parse_file(&topology_path, Some(&profile_path), None).unwrap();
        assert_eq!(prod.container_group("api-8080").unwrap().image, "api:prod");

        let dev = TopologyParser::parse_file(&topology_path, Some(&profile_path), Some("dev")).unwrap();
        assert_eq!(dev.container_group("api-8080").unwrap().image, "api:dev");

        let err = TopologyParser::parse_file(&topology_path, Some(&profile_path), Some("qa")).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_missing_profile_file_is_ignored() {
        let dir = tempdir().unwrap();
        assert!(TopologyParser::parse_profiles_file(&dir.path().join("none.yml"))
            .unwrap()
            .is_none());
    }
}
