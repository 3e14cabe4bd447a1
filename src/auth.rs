//! In-memory user directory: root and alter identities, per-user IP caps and
//! traffic totals. The protocol core only reads from it; registration happens
//! at startup.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;

use crate::user::User;

/// State shared by a root user and all of its alter identities: they belong
/// to one person, so the IP cap and traffic totals are common.
#[derive(Debug)]
struct UserState {
    sent: AtomicU64,
    recv: AtomicU64,
    ips: Mutex<HashSet<IpAddr>>,
    /// 0 = unlimited
    ip_limit: usize,
}

#[derive(Clone, Debug)]
pub struct AuthUser {
    pub user: User,
    state: Arc<UserState>,
}

impl AuthUser {
    pub fn uuid(&self) -> [u8; 16] {
        self.user.uuid
    }

    pub fn cmd_key(&self) -> [u8; 16] {
        self.user.cmd_key
    }

    /// Register a source IP, enforcing the cap. Re-registering an already
    /// known IP always succeeds.
    pub fn add_ip(&self, ip: IpAddr) -> bool {
        let mut ips = match self.state.ips.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if ips.contains(&ip) {
            return true;
        }
        if self.state.ip_limit > 0 && ips.len() >= self.state.ip_limit {
            return false;
        }
        ips.insert(ip);
        true
    }

    pub fn del_ip(&self, ip: &IpAddr) {
        let mut ips = match self.state.ips.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ips.remove(ip);
    }

    pub fn add_traffic(&self, sent: u64, recv: u64) {
        self.state.sent.fetch_add(sent, Ordering::Relaxed);
        self.state.recv.fetch_add(recv, Ordering::Relaxed);
    }

    pub fn traffic(&self) -> (u64, u64) {
        (
            self.state.sent.load(Ordering::Relaxed),
            self.state.recv.load(Ordering::Relaxed),
        )
    }
}

pub struct Authenticator {
    users: DashMap<[u8; 16], AuthUser>,
}

impl Authenticator {
    pub fn new() -> Self {
        Authenticator {
            users: DashMap::new(),
        }
    }

    /// Register a root user and `alter_id` derived identities, all sharing
    /// one accounting state.
    pub fn add_user(&self, root: User, alter_id: usize, ip_limit: usize) {
        let state = Arc::new(UserState {
            sent: AtomicU64::new(0),
            recv: AtomicU64::new(0),
            ips: Mutex::new(HashSet::new()),
            ip_limit,
        });
        self.users.insert(
            root.uuid,
            AuthUser {
                user: root,
                state: state.clone(),
            },
        );
        for alter in root.gen_alter_id_users(alter_id) {
            self.users.insert(
                alter.uuid,
                AuthUser {
                    user: alter,
                    state: state.clone(),
                },
            );
        }
    }

    pub fn list_users(&self) -> Vec<AuthUser> {
        self.users.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

/// "12.34KiB" style rendering for connection close logs.
pub fn human_friendly_traffic(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{}{}", bytes, UNITS[0])
    } else {
        format!("{:.2}{}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::parse_uuid;
    use std::net::Ipv4Addr;

    fn sample_user() -> User {
        User::new(parse_uuid("a684455c-b14f-11ea-bf0d-42010aaa0003").unwrap())
    }

    #[test]
    fn test_alter_identities_registered() {
        let auth = Authenticator::new();
        auth.add_user(sample_user(), 4, 0);
        assert_eq!(auth.user_count(), 5);
        for user in auth.list_users() {
            assert_eq!(user.cmd_key(), sample_user().cmd_key);
        }
    }

    #[test]
    fn test_ip_cap_shared_across_identities() {
        let auth = Authenticator::new();
        auth.add_user(sample_user(), 1, 2);
        let users = auth.list_users();
        let root = &users[0];
        let alter = &users[1];

        let ip1 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let ip2 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let ip3 = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 3));

        assert!(root.add_ip(ip1));
        assert!(alter.add_ip(ip2));
        assert!(!root.add_ip(ip3), "cap of 2 covers root and alter together");
        assert!(root.add_ip(ip1), "known IP is always accepted");

        root.del_ip(&ip1);
        assert!(alter.add_ip(ip3));
    }

    #[test]
    fn test_traffic_accumulates() {
        let auth = Authenticator::new();
        auth.add_user(sample_user(), 0, 0);
        let user = &auth.list_users()[0];
        user.add_traffic(100, 0);
        user.add_traffic(0, 42);
        assert_eq!(user.traffic(), (100, 42));
    }

    #[test]
    fn test_human_friendly_traffic() {
        assert_eq!(human_friendly_traffic(512), "512B");
        assert_eq!(human_friendly_traffic(2048), "2.00KiB");
        assert_eq!(human_friendly_traffic(3 * 1024 * 1024), "3.00MiB");
    }
}
