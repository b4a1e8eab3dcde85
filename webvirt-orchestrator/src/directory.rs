//! LDAP directory backing Guacamole access control.
//!
//! Each VM has a `guacConfigGroup` entry whose members may open its VNC
//! console; each tenant is a posix user under the people subtree.

use async_trait::async_trait;
use ldap3::exop::PasswordModify;
use ldap3::{dn_escape, ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, Scope, SearchEntry};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// `uidNumber` handed out when the directory holds no users yet.
pub const FIRST_UID: u32 = 10000;

const INVALID_CREDENTIALS: u32 = 49;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    pub url: String,
    pub base_dn: String,
    /// Subtree holding one access group per VM.
    pub vm_dn: String,
    /// Subtree holding tenant accounts.
    pub user_dn: String,
    /// Administrator bind: `cn={admin_user},{base_dn}`.
    pub admin_user: String,
    pub admin_password: String,
    /// Member added to every access group alongside the owner.
    pub admin_member_uid: String,
    pub base_group_id: u32,
    /// Host Guacamole connects to for VNC consoles.
    pub vnc_hostname: String,
    pub wol_broadcast_addr: String,
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: "ldap://localhost:389".to_string(),
            base_dn: "dc=example,dc=org".to_string(),
            vm_dn: "ou=groups,dc=example,dc=org".to_string(),
            user_dn: "ou=people,dc=example,dc=org".to_string(),
            admin_user: "admin".to_string(),
            admin_password: String::new(),
            admin_member_uid: "trcadmin".to_string(),
            base_group_id: 500,
            vnc_hostname: "localhost".to_string(),
            wol_broadcast_addr: "255.255.255.255".to_string(),
            timeout_secs: 10,
        }
    }
}

impl DirectoryConfig {
    pub fn admin_dn(&self) -> String {
        format!("cn={},{}", dn_escape(&self.admin_user), self.base_dn)
    }

    pub fn user_entry_dn(&self, username: &str) -> String {
        format!("uid={},{}", dn_escape(username), self.user_dn)
    }

    pub fn group_entry_dn(&self, vm_name: &str) -> String {
        format!("cn={},{}", dn_escape(vm_name), self.vm_dn)
    }
}

#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory unreachable: {0}")]
    Connect(String),

    #[error("Directory bind as {dn} failed: {reason}")]
    Bind { dn: String, reason: String },

    #[error("Directory write to {dn} failed: {reason}")]
    Write { dn: String, reason: String },

    #[error("Directory search under {base} failed: {reason}")]
    Search { base: String, reason: String },

    #[error("Directory operation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Everything needed to register a VM's console with Guacamole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessGroupRequest {
    pub vm_name: String,
    pub owner: String,
    /// TCP port of the VNC console (display + 5900).
    pub vnc_port: u32,
    pub mac_address: String,
    pub core_count: i64,
    pub memory: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub username: String,
    pub uid_number: u32,
    pub password: String,
    pub home_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryUser {
    pub username: String,
    pub uid_number: u32,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn create_access_group(&self, request: &AccessGroupRequest)
        -> Result<(), DirectoryError>;

    async fn delete_access_group(&self, vm_name: &str) -> Result<(), DirectoryError>;

    /// Adds the user entry, then sets its password.
    async fn create_user(&self, user: &NewUser) -> Result<(), DirectoryError>;

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError>;

    /// Names of the access groups `username` belongs to.
    async fn access_groups_for(&self, username: &str) -> Result<Vec<String>, DirectoryError>;

    /// `Ok(false)` for a wrong username or password.
    async fn verify_credentials(&self, username: &str, password: &str)
        -> Result<bool, DirectoryError>;

    async fn next_free_uid(&self) -> Result<u32, DirectoryError> {
        let users = self.list_users().await?;
        Ok(next_uid(users.iter().map(|u| u.uid_number)))
    }

    async fn generate_unique_username(
        &self,
        first_name: &str,
        last_name: &str,
    ) -> Result<String, DirectoryError> {
        let taken: HashSet<String> = self
            .list_users()
            .await?
            .into_iter()
            .map(|u| u.username)
            .collect();
        Ok(pick_unique_username(first_name, last_name, &taken))
    }
}

pub fn next_uid(existing: impl IntoIterator<Item = u32>) -> u32 {
    existing
        .into_iter()
        .max()
        .map(|max| max + 1)
        .unwrap_or(FIRST_UID)
}

/// Shortest `first[..n] + last` not in `taken`, else `first + last + N`.
pub fn pick_unique_username(first_name: &str, last_name: &str, taken: &HashSet<String>) -> String {
    let first: Vec<char> = first_name.chars().collect();
    for n in 1..first.len() {
        let prefix: String = first[..n].iter().collect();
        let candidate = format!("{prefix}{last_name}");
        if !taken.contains(&candidate) {
            return candidate;
        }
    }

    (1u64..)
        .map(|n| format!("{first_name}{last_name}{n}"))
        .find(|candidate| !taken.contains(candidate))
        .unwrap_or_else(|| format!("{first_name}{last_name}"))
}

type Attributes = Vec<(String, HashSet<String>)>;

fn attr(name: &str, values: impl IntoIterator<Item = String>) -> (String, HashSet<String>) {
    (name.to_string(), values.into_iter().collect())
}

pub fn access_group_attributes(config: &DirectoryConfig, request: &AccessGroupRequest) -> Attributes {
    let parameters = [
        format!("hostname={}", config.vnc_hostname),
        format!("port={}", request.vnc_port),
        "wol-send-packet=true".to_string(),
        format!("wol-mac-addr={}", request.mac_address),
        format!("wol-broadcast-addr={}", config.wol_broadcast_addr),
        "wol-udp-port=9".to_string(),
        "wol-wait-time=5".to_string(),
        format!("core-count={}", request.core_count),
        format!("memory={}", request.memory),
    ];

    vec![
        attr(
            "objectClass",
            ["guacConfigGroup".to_string(), "groupOfNames".to_string()],
        ),
        attr("cn", [request.vm_name.clone()]),
        attr("guacConfigProtocol", ["vnc".to_string()]),
        attr("guacConfigParameter", parameters),
        attr(
            "member",
            [
                config.user_entry_dn(&config.admin_member_uid),
                config.user_entry_dn(&request.owner),
            ],
        ),
    ]
}

pub fn user_attributes(config: &DirectoryConfig, user: &NewUser) -> Attributes {
    vec![
        attr(
            "objectClass",
            ["inetOrgPerson", "organizationalPerson", "person", "posixAccount"]
                .map(str::to_string),
        ),
        attr("loginShell", ["/bin/bash".to_string()]),
        attr(
            "homeDirectory",
            [format!(
                "{}/{}",
                user.home_prefix.trim_end_matches('/'),
                user.username
            )],
        ),
        attr("uid", [user.username.clone()]),
        attr("cn", [format!("{} {}", user.first_name, user.last_name)]),
        attr("uidNumber", [user.uid_number.to_string()]),
        attr("gidNumber", [config.base_group_id.to_string()]),
        attr("sn", [user.last_name.clone()]),
        attr("givenName", [user.first_name.clone()]),
    ]
}

/// [`Directory`] over LDAP. Every call opens its own connection and unbinds
/// before returning.
pub struct LdapDirectory {
    config: DirectoryConfig,
}

impl LdapDirectory {
    pub fn new(config: DirectoryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DirectoryConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }

    async fn connect(&self) -> Result<Ldap, DirectoryError> {
        let settings = LdapConnSettings::new().set_conn_timeout(self.timeout());
        let (conn, ldap) = LdapConnAsync::with_settings(settings, &self.config.url)
            .await
            .map_err(|e| DirectoryError::Connect(e.to_string()))?;
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                warn!(error = %e, "Directory connection closed with error");
            }
        });
        Ok(ldap)
    }

    /// Binds as the administrator, runs `op`, then unbinds on every path.
    async fn as_admin<T, F, Fut>(&self, op: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(Ldap) -> Fut + Send,
        Fut: Future<Output = Result<T, DirectoryError>> + Send,
        T: Send,
    {
        let mut ldap = self.connect().await?;
        let admin_dn = self.config.admin_dn();
        let password = self.config.admin_password.clone();
        let session = ldap.clone();

        let work = async move {
            let mut bound = session;
            bound
                .simple_bind(&admin_dn, &password)
                .await
                .and_then(|r| r.success())
                .map_err(|e| DirectoryError::Bind {
                    dn: admin_dn.clone(),
                    reason: e.to_string(),
                })?;
            op(bound).await
        };

        let outcome = tokio::time::timeout(self.timeout(), work)
            .await
            .unwrap_or_else(|_| Err(DirectoryError::TimedOut(self.timeout())));

        if let Err(e) = ldap.unbind().await {
            debug!(error = %e, "Directory unbind failed");
        }
        outcome
    }

    async fn search_entries(
        &self,
        base: String,
        filter: String,
        attrs: Vec<&'static str>,
    ) -> Result<Vec<HashMap<String, Vec<String>>>, DirectoryError> {
        self.as_admin(move |mut ldap| async move {
            let (entries, _) = ldap
                .search(&base, Scope::Subtree, &filter, attrs)
                .await
                .and_then(|r| r.success())
                .map_err(|e| DirectoryError::Search {
                    base: base.clone(),
                    reason: e.to_string(),
                })?;
            Ok(entries
                .into_iter()
                .map(|entry| SearchEntry::construct(entry).attrs)
                .collect())
        })
        .await
    }
}

fn first_value<'a>(attrs: &'a HashMap<String, Vec<String>>, name: &str) -> Option<&'a str> {
    attrs.get(name).and_then(|v| v.first()).map(String::as_str)
}

#[async_trait]
impl Directory for LdapDirectory {
    #[instrument(skip(self, request), fields(vm = %request.vm_name, owner = %request.owner))]
    async fn create_access_group(
        &self,
        request: &AccessGroupRequest,
    ) -> Result<(), DirectoryError> {
        let dn = self.config.group_entry_dn(&request.vm_name);
        let attrs = access_group_attributes(&self.config, request);

        self.as_admin(move |mut ldap| async move {
            ldap.add(&dn, attrs)
                .await
                .and_then(|r| r.success())
                .map_err(|e| DirectoryError::Write {
                    dn: dn.clone(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
        .await?;

        info!("Access group registered");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_access_group(&self, vm_name: &str) -> Result<(), DirectoryError> {
        let dn = self.config.group_entry_dn(vm_name);

        self.as_admin(move |mut ldap| async move {
            ldap.delete(&dn)
                .await
                .and_then(|r| r.success())
                .map_err(|e| DirectoryError::Write {
                    dn: dn.clone(),
                    reason: e.to_string(),
                })?;
            Ok(())
        })
        .await?;

        info!("Access group removed");
        Ok(())
    }

    #[instrument(skip(self, user), fields(username = %user.username, uid = user.uid_number))]
    async fn create_user(&self, user: &NewUser) -> Result<(), DirectoryError> {
        let dn = self.config.user_entry_dn(&user.username);
        let attrs = user_attributes(&self.config, user);
        let password = user.password.clone();

        self.as_admin(move |mut ldap| async move {
            let write_error = |e: ldap3::LdapError| DirectoryError::Write {
                dn: dn.clone(),
                reason: e.to_string(),
            };

            ldap.add(&dn, attrs)
                .await
                .and_then(|r| r.success())
                .map_err(write_error)?;

            ldap.extended(PasswordModify {
                user_id: Some(dn.as_str()),
                old_pass: None,
                new_pass: Some(password.as_str()),
            })
            .await
            .and_then(|r| r.success())
            .map_err(write_error)?;

            Ok(())
        })
        .await?;

        info!("Directory user created");
        Ok(())
    }

    async fn list_users(&self) -> Result<Vec<DirectoryUser>, DirectoryError> {
        let entries = self
            .search_entries(
                self.config.user_dn.clone(),
                "(objectClass=posixAccount)".to_string(),
                vec!["uid", "uidNumber"],
            )
            .await?;

        Ok(entries
            .iter()
            .filter_map(|attrs| {
                let username = first_value(attrs, "uid")?;
                let uid_number = first_value(attrs, "uidNumber")?.parse().ok()?;
                Some(DirectoryUser {
                    username: username.to_string(),
                    uid_number,
                })
            })
            .collect())
    }

    async fn access_groups_for(&self, username: &str) -> Result<Vec<String>, DirectoryError> {
        let member = self.config.user_entry_dn(username);
        let filter = format!(
            "(&(objectClass=guacConfigGroup)(member={}))",
            ldap_escape(&member)
        );

        let entries = self
            .search_entries(self.config.vm_dn.clone(), filter, vec!["cn"])
            .await?;

        let mut names: Vec<String> = entries
            .iter()
            .filter_map(|attrs| first_value(attrs, "cn").map(str::to_string))
            .collect();
        names.sort();
        Ok(names)
    }

    async fn verify_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> Result<bool, DirectoryError> {
        // An empty password would be an unauthenticated bind, which succeeds.
        if password.is_empty() {
            return Ok(false);
        }

        let dn = self.config.user_entry_dn(username);
        let mut ldap = self.connect().await?;

        let outcome = tokio::time::timeout(self.timeout(), ldap.simple_bind(&dn, password)).await;
        let verdict = match outcome {
            Err(_) => Err(DirectoryError::TimedOut(self.timeout())),
            Ok(Err(e)) => Err(DirectoryError::Bind {
                dn: dn.clone(),
                reason: e.to_string(),
            }),
            Ok(Ok(result)) if result.rc == 0 => Ok(true),
            Ok(Ok(result)) if result.rc == INVALID_CREDENTIALS => Ok(false),
            Ok(Ok(result)) => Err(DirectoryError::Bind {
                dn: dn.clone(),
                reason: result.to_string(),
            }),
        };

        if let Err(e) = ldap.unbind().await {
            warn!(error = %e, "Directory unbind failed");
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn taken(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn values<'a>(attrs: &'a Attributes, name: &str) -> &'a HashSet<String> {
        &attrs.iter().find(|(k, _)| k == name).unwrap().1
    }

    #[test]
    fn username_uses_shortest_free_prefix() {
        assert_eq!(pick_unique_username("alice", "smith", &taken(&[])), "asmith");
        assert_eq!(
            pick_unique_username("alice", "smith", &taken(&["asmith", "alsmith"])),
            "alismith"
        );
    }

    #[test]
    fn username_falls_back_to_numbered_full_name() {
        let all_prefixes = taken(&["asmith", "alsmith", "alismith", "alicsmith"]);
        assert_eq!(
            pick_unique_username("alice", "smith", &all_prefixes),
            "alicesmith1"
        );

        let mut more = all_prefixes.clone();
        more.insert("alicesmith1".to_string());
        assert_eq!(pick_unique_username("alice", "smith", &more), "alicesmith2");
    }

    #[test]
    fn single_letter_first_name_goes_straight_to_numbering() {
        assert_eq!(pick_unique_username("a", "li", &taken(&[])), "ali1");
    }

    #[test]
    fn uid_is_max_plus_one() {
        assert_eq!(next_uid([10003, 10001, 10007]), 10008);
        assert_eq!(next_uid(std::iter::empty()), FIRST_UID);
    }

    #[test]
    fn access_group_carries_guacamole_parameters() {
        let config = DirectoryConfig {
            vnc_hostname: "pve.lab".to_string(),
            ..DirectoryConfig::default()
        };
        let request = AccessGroupRequest {
            vm_name: "lab-1".to_string(),
            owner: "jdoe".to_string(),
            vnc_port: 5903,
            mac_address: "BC:24:11:00:00:01".to_string(),
            core_count: 2,
            memory: 2048,
        };

        let attrs = access_group_attributes(&config, &request);
        let params = values(&attrs, "guacConfigParameter");
        assert!(params.contains("hostname=pve.lab"));
        assert!(params.contains("port=5903"));
        assert!(params.contains("wol-mac-addr=BC:24:11:00:00:01"));
        assert!(params.contains("wol-udp-port=9"));
        assert!(params.contains("core-count=2"));
        assert!(params.contains("memory=2048"));

        assert_eq!(
            values(&attrs, "member"),
            &taken(&[
                "uid=trcadmin,ou=people,dc=example,dc=org",
                "uid=jdoe,ou=people,dc=example,dc=org",
            ])
        );
        assert!(values(&attrs, "guacConfigProtocol").contains("vnc"));
    }

    #[test]
    fn user_entry_is_a_posix_account() {
        let config = DirectoryConfig::default();
        let user = NewUser {
            first_name: "Jane".to_string(),
            last_name: "Doe".to_string(),
            username: "jdoe".to_string(),
            uid_number: 10004,
            password: "Secr3tpw".to_string(),
            home_prefix: "/home/".to_string(),
        };

        let attrs = user_attributes(&config, &user);
        assert!(values(&attrs, "objectClass").contains("posixAccount"));
        assert!(values(&attrs, "homeDirectory").contains("/home/jdoe"));
        assert!(values(&attrs, "cn").contains("Jane Doe"));
        assert!(values(&attrs, "uidNumber").contains("10004"));
        assert!(values(&attrs, "gidNumber").contains("500"));
        // The password is set separately and never stored as an attribute.
        assert!(attrs.iter().all(|(k, _)| k != "userPassword"));
    }

    #[test]
    fn entry_dns_escape_values() {
        let config = DirectoryConfig::default();
        let dn = config.group_entry_dn("lab,1");
        assert!(dn.starts_with("cn=lab\\"));
        assert!(dn.ends_with("1,ou=groups,dc=example,dc=org"));
        assert_eq!(config.admin_dn(), "cn=admin,dc=example,dc=org");
    }
}
