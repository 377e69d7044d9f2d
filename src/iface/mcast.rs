//! Per-interface multicast group membership lists.

use core::net::{Ipv4Addr, Ipv6Addr};

use crate::config::MAX_MCAST_GROUPS_PER_L2;

#[derive(Debug, Clone, Copy)]
pub struct MemberV4 {
    pub group: Ipv4Addr,
    pub refcount: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct MemberV6 {
    pub group: Ipv6Addr,
    pub refcount: u16,
}

#[derive(Debug, Clone, Default)]
pub struct McastGroupsV4 {
    members: heapless::Vec<MemberV4, MAX_MCAST_GROUPS_PER_L2>,
}

#[derive(Debug, Clone, Default)]
pub struct McastGroupsV6 {
    members: heapless::Vec<MemberV6, MAX_MCAST_GROUPS_PER_L2>,
}

/// Outcome of a join/leave used by the caller to decide whether the driver
/// hardware filter and the IGMP/MLD daemon need to be kicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipChange {
    /// Group newly joined (refcount 0 -> 1): emit a report.
    Joined,
    /// Already a member: no-op.
    AlreadyMember,
    /// Group left entirely (refcount -> 0): emit a leave, update the filter.
    Left,
    /// Still referenced by someone else.
    StillMember,
    /// Leave of a group we were never a member of.
    NotMember,
}

impl McastGroupsV4 {
    pub fn join(&mut self, group: Ipv4Addr) -> Result<MembershipChange, ()> {
        if let Some(m) = self.members.iter_mut().find(|m| m.group == group) {
            m.refcount += 1;
            return Ok(MembershipChange::AlreadyMember);
        }
        self.members
            .push(MemberV4 { group, refcount: 1 })
            .map_err(|_| ())?;
        Ok(MembershipChange::Joined)
    }

    pub fn leave(&mut self, group: Ipv4Addr) -> MembershipChange {
        let Some(idx) = self.members.iter().position(|m| m.group == group) else {
            return MembershipChange::NotMember;
        };
        self.members[idx].refcount -= 1;
        if self.members[idx].refcount == 0 {
            self.members.swap_remove(idx);
            MembershipChange::Left
        } else {
            MembershipChange::StillMember
        }
    }

    pub fn is_member(&self, group: Ipv4Addr) -> bool {
        self.members.iter().any(|m| m.group == group)
    }

    pub fn groups(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.members.iter().map(|m| m.group)
    }
}

impl McastGroupsV6 {
    pub fn join(&mut self, group: Ipv6Addr) -> Result<MembershipChange, ()> {
        if let Some(m) = self.members.iter_mut().find(|m| m.group == group) {
            m.refcount += 1;
            return Ok(MembershipChange::AlreadyMember);
        }
        self.members
            .push(MemberV6 { group, refcount: 1 })
            .map_err(|_| ())?;
        Ok(MembershipChange::Joined)
    }

    pub fn leave(&mut self, group: Ipv6Addr) -> MembershipChange {
        let Some(idx) = self.members.iter().position(|m| m.group == group) else {
            return MembershipChange::NotMember;
        };
        self.members[idx].refcount -= 1;
        if self.members[idx].refcount == 0 {
            self.members.swap_remove(idx);
            MembershipChange::Left
        } else {
            MembershipChange::StillMember
        }
    }

    pub fn is_member(&self, group: Ipv6Addr) -> bool {
        self.members.iter().any(|m| m.group == group)
    }

    pub fn groups(&self) -> impl Iterator<Item = Ipv6Addr> + '_ {
        self.members.iter().map(|m| m.group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_twice_is_noop_leave_drops_to_zero() {
        let mut g = McastGroupsV4::default();
        let addr = Ipv4Addr::new(224, 0, 0, 251);
        assert_eq!(g.join(addr).unwrap(), MembershipChange::Joined);
        assert_eq!(g.join(addr).unwrap(), MembershipChange::AlreadyMember);
        assert_eq!(g.leave(addr), MembershipChange::StillMember);
        assert_eq!(g.leave(addr), MembershipChange::Left);
        assert!(!g.is_member(addr));
    }
}
