use bitflags::bitflags;
use serde::Serialize;

use crate::error::{FsError, FsResult};

bitflags! {
    /// rights requested by an open or granted by an ACL entry
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct AccessMask: u32 {
        const READ = 1;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const DELETE = 1 << 3;
        const READ_ATTRIBUTES = 1 << 4;
        const WRITE_ATTRIBUTES = 1 << 5;
        const READ_CONTROL = 1 << 6;
        const WRITE_CONTROL = 1 << 7;
    }
}

impl AccessMask {
    pub const GENERIC_READ: AccessMask = AccessMask::READ
        .union(AccessMask::READ_ATTRIBUTES)
        .union(AccessMask::READ_CONTROL);
    pub const GENERIC_WRITE: AccessMask = AccessMask::WRITE.union(AccessMask::WRITE_ATTRIBUTES);
}

/// who an ACL entry applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Principal {
    Everyone,
    User(u32),
    Group(u32),
}

/// the identity an operation runs under
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Credentials {
    pub uid: u32,
    pub gid: u32,
}

impl Credentials {
    pub fn new(uid: u32, gid: u32) -> Self {
        Credentials { uid, gid }
    }

    /// effective ids of this process
    pub fn current() -> Self {
        Credentials {
            uid: users::get_effective_uid(),
            gid: users::get_effective_gid(),
        }
    }

    fn matches(&self, principal: Principal) -> bool {
        match principal {
            Principal::Everyone => true,
            Principal::User(uid) => uid == self.uid,
            Principal::Group(gid) => gid == self.gid,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub principal: Principal,
    pub allow: AccessMask,
    pub deny: AccessMask,
}

impl AclEntry {
    pub fn allow(principal: Principal, mask: AccessMask) -> Self {
        AclEntry {
            principal,
            allow: mask,
            deny: AccessMask::empty(),
        }
    }

    pub fn deny(principal: Principal, mask: AccessMask) -> Self {
        AclEntry {
            principal,
            allow: AccessMask::empty(),
            deny: mask,
        }
    }
}

/// Access-control list of one file or directory; a deny bit always wins.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acl {
    pub entries: Vec<AclEntry>,
}

impl Acl {
    /// the owner gets everything, everyone else may look
    pub fn default_for(owner: Credentials) -> Self {
        Acl {
            entries: vec![
                AclEntry::allow(Principal::User(owner.uid), AccessMask::all()),
                AclEntry::allow(
                    Principal::Everyone,
                    AccessMask::GENERIC_READ | AccessMask::EXECUTE,
                ),
            ],
        }
    }

    pub fn granted(&self, credentials: Credentials) -> AccessMask {
        let (allow, deny) = self
            .entries
            .iter()
            .filter(|entry| credentials.matches(entry.principal))
            .fold(
                (AccessMask::empty(), AccessMask::empty()),
                |(allow, deny), entry| (allow | entry.allow, deny | entry.deny),
            );
        allow - deny
    }

    pub fn check(&self, credentials: Credentials, requested: AccessMask) -> FsResult<()> {
        let granted = self.granted(credentials);
        if granted.contains(requested) {
            Ok(())
        } else {
            Err(FsError::AccessDenied(format!(
                "uid {} lacks {:?}",
                credentials.uid,
                requested - granted
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_acl() {
        let owner = Credentials::new(1000, 1000);
        let other = Credentials::new(1001, 1000);
        let acl = Acl::default_for(owner);
        assert!(acl.check(owner, AccessMask::all()).is_ok());
        assert!(acl.check(other, AccessMask::GENERIC_READ).is_ok());
        assert!(matches!(
            acl.check(other, AccessMask::WRITE),
            Err(FsError::AccessDenied(_))
        ));
    }

    #[test]
    fn test_deny_wins() {
        let owner = Credentials::new(1000, 100);
        let mut acl = Acl::default_for(owner);
        acl.entries.push(AclEntry::deny(Principal::Group(100), AccessMask::DELETE));
        assert!(acl.check(owner, AccessMask::WRITE).is_ok());
        assert!(acl.check(owner, AccessMask::DELETE).is_err());
        assert_eq!(
            acl.granted(owner),
            AccessMask::all() - AccessMask::DELETE
        );
    }
}
