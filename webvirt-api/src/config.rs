use serde::Deserialize;
use std::path::PathBuf;
use webvirt_orchestrator::credentials::DEFAULT_PASSWORD_LEN;
use webvirt_orchestrator::{DirectoryConfig, HypervisorConfig, WorkflowTimings};

/// Service configuration, read from `WEBVIRT_*` environment variables.
/// Missing fields in a deserialized config fall back to the environment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub bind_addr: String,
    pub db_path: PathBuf,
    pub reaper_interval_secs: u64,
    pub lease_path: PathBuf,
    pub lease_ttl_secs: u64,
    /// Principal allowed to run bulk imports and read the journal.
    pub admin_user: String,
    pub password_length: usize,
    pub home_prefix: String,
    pub hypervisor: HypervisorConfig,
    pub directory: DirectoryConfig,
    pub timings: WorkflowTimings,
}

fn state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".webvirt")
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; unset or
    /// unparsable keys fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let path = |key: &str, default: PathBuf| lookup(key).map(PathBuf::from).unwrap_or(default);
        let flag = |key: &str| {
            lookup(key)
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };
        macro_rules! number {
            ($key:expr, $default:expr) => {
                lookup($key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or($default)
            };
        }

        let hv_defaults = HypervisorConfig::default();
        let dir_defaults = DirectoryConfig::default();
        let timing_defaults = WorkflowTimings::default();

        let hypervisor = HypervisorConfig {
            base_url: string("WEBVIRT_PVE_URL", &hv_defaults.base_url),
            port: number!("WEBVIRT_PVE_PORT", hv_defaults.port),
            node: string("WEBVIRT_PVE_NODE", &hv_defaults.node),
            access_token: string("WEBVIRT_PVE_TOKEN", &hv_defaults.access_token),
            net_bridge: string("WEBVIRT_PVE_BRIDGE", &hv_defaults.net_bridge),
            config_dir: path("WEBVIRT_PVE_CONFIG_DIR", hv_defaults.config_dir.clone()),
            request_timeout_secs: number!("WEBVIRT_PVE_TIMEOUT", hv_defaults.request_timeout_secs),
            accept_invalid_certs: flag("WEBVIRT_PVE_INSECURE"),
        };

        let base_dn = string("WEBVIRT_LDAP_BASE_DN", &dir_defaults.base_dn);
        let directory = DirectoryConfig {
            url: string("WEBVIRT_LDAP_URL", &dir_defaults.url),
            vm_dn: string("WEBVIRT_LDAP_VM_DN", &format!("ou=groups,{base_dn}")),
            user_dn: string("WEBVIRT_LDAP_USER_DN", &format!("ou=people,{base_dn}")),
            admin_user: string("WEBVIRT_LDAP_ADMIN", &dir_defaults.admin_user),
            admin_password: string("WEBVIRT_LDAP_PASSWORD", &dir_defaults.admin_password),
            admin_member_uid: string("WEBVIRT_LDAP_ADMIN_MEMBER", &dir_defaults.admin_member_uid),
            base_group_id: number!("WEBVIRT_LDAP_GID", dir_defaults.base_group_id),
            vnc_hostname: string("WEBVIRT_VNC_HOST", &dir_defaults.vnc_hostname),
            wol_broadcast_addr: string("WEBVIRT_WOL_BROADCAST", &dir_defaults.wol_broadcast_addr),
            timeout_secs: number!("WEBVIRT_LDAP_TIMEOUT", dir_defaults.timeout_secs),
            base_dn,
        };

        let timings = WorkflowTimings {
            config_settle_ms: number!("WEBVIRT_CONFIG_SETTLE_MS", timing_defaults.config_settle_ms),
            mac_settle_ms: number!("WEBVIRT_MAC_SETTLE_MS", timing_defaults.mac_settle_ms),
            stop_poll_ms: number!("WEBVIRT_STOP_POLL_MS", timing_defaults.stop_poll_ms),
            stop_timeout_ms: number!("WEBVIRT_STOP_TIMEOUT_MS", timing_defaults.stop_timeout_ms),
        };

        Self {
            bind_addr: string("WEBVIRT_BIND", "0.0.0.0:8000"),
            db_path: path("WEBVIRT_DB_PATH", state_dir().join("webvirt.db")),
            reaper_interval_secs: number!("WEBVIRT_REAPER_INTERVAL", 60),
            lease_path: path("WEBVIRT_LEASE_PATH", state_dir().join("leases.json")),
            lease_ttl_secs: number!("WEBVIRT_LEASE_TTL", 600),
            admin_user: string("WEBVIRT_ADMIN_USER", &dir_defaults.admin_member_uid),
            password_length: number!("WEBVIRT_PASSWORD_LENGTH", DEFAULT_PASSWORD_LEN),
            home_prefix: string("WEBVIRT_HOME_PREFIX", "/home"),
            hypervisor,
            directory,
            timings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_environment() {
        let config = Config::from_lookup(lookup(&[]));
        assert_eq!(config.bind_addr, "0.0.0.0:8000");
        assert_eq!(config.reaper_interval_secs, 60);
        assert_eq!(config.lease_ttl_secs, 600);
        assert_eq!(config.password_length, 8);
        assert_eq!(config.admin_user, "trcadmin");
        assert_eq!(config.hypervisor.port, 8006);
        assert_eq!(config.timings.config_settle_ms, 5000);
        assert_eq!(config.timings.stop_timeout_ms, 180_000);
        assert!(config.db_path.ends_with(".webvirt/webvirt.db"));
    }

    #[test]
    fn directory_subtrees_follow_base_dn() {
        let config = Config::from_lookup(lookup(&[("WEBVIRT_LDAP_BASE_DN", "dc=lab,dc=edu")]));
        assert_eq!(config.directory.base_dn, "dc=lab,dc=edu");
        assert_eq!(config.directory.vm_dn, "ou=groups,dc=lab,dc=edu");
        assert_eq!(config.directory.user_dn, "ou=people,dc=lab,dc=edu");
    }

    #[test]
    fn reads_overrides_and_ignores_garbage_numbers() {
        let config = Config::from_lookup(lookup(&[
            ("WEBVIRT_PVE_URL", "https://pve.lab"),
            ("WEBVIRT_PVE_INSECURE", "true"),
            ("WEBVIRT_REAPER_INTERVAL", "15"),
            ("WEBVIRT_PASSWORD_LENGTH", "lots"),
        ]));
        assert_eq!(config.hypervisor.base_url, "https://pve.lab");
        assert!(config.hypervisor.accept_invalid_certs);
        assert_eq!(config.reaper_interval_secs, 15);
        assert_eq!(config.password_length, 8);
    }
}
