//! File attributes (`ATTRS`) with flag-qualified optional fields.

use crate::error::Result;
use crate::message::Packet;
use crate::protocol::{
    SSH_FILEXFER_ATTR_ACMODTIME, SSH_FILEXFER_ATTR_EXTENDED, SSH_FILEXFER_ATTR_PERMISSIONS,
    SSH_FILEXFER_ATTR_SIZE, SSH_FILEXFER_ATTR_UIDGID,
};

/// Attribute set as carried on the wire.
///
/// Each field is present exactly when its SSH_FILEXFER_ATTR_* bit is set,
/// so a field that was not sent can never be read by accident. Callers
/// supply their own defaults through the `*_or` accessors.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attrs {
    pub size: Option<u64>,
    /// `(uid, gid)`
    pub owner: Option<(u32, u32)>,
    pub permissions: Option<u32>,
    /// `(atime, mtime)`
    pub times: Option<(u32, u32)>,
}

impl Attrs {
    /// The empty attribute set (flags word of zero).
    pub const NONE: Attrs = Attrs {
        size: None,
        owner: None,
        permissions: None,
        times: None,
    };

    /// Flags word describing which fields are present.
    pub fn flags(&self) -> u32 {
        let mut flags = 0;
        if self.size.is_some() {
            flags |= SSH_FILEXFER_ATTR_SIZE;
        }
        if self.owner.is_some() {
            flags |= SSH_FILEXFER_ATTR_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= SSH_FILEXFER_ATTR_PERMISSIONS;
        }
        if self.times.is_some() {
            flags |= SSH_FILEXFER_ATTR_ACMODTIME;
        }
        flags
    }

    /// Set or clear the permissions field; negative values clear it.
    pub fn set_permissions(&mut self, perms: i64) {
        self.permissions = u32::try_from(perms).ok();
    }

    pub fn permissions_or(&self, default: u32) -> u32 {
        self.permissions.unwrap_or(default)
    }

    pub fn size_or(&self, default: u64) -> u64 {
        self.size.unwrap_or(default)
    }

    pub(crate) fn encode(&self, pkt: &mut Packet) {
        pkt.put_u32(self.flags());
        if let Some(size) = self.size {
            pkt.put_u64(size);
        }
        if let Some((uid, gid)) = self.owner {
            pkt.put_u32(uid);
            pkt.put_u32(gid);
        }
        if let Some(perms) = self.permissions {
            pkt.put_u32(perms);
        }
        if let Some((atime, mtime)) = self.times {
            pkt.put_u32(atime);
            pkt.put_u32(mtime);
        }
    }

    /// Decode an attribute block. Extended pairs are read and dropped.
    pub(crate) fn decode(pkt: &Packet) -> Result<Self> {
        let flags = pkt.get_u32()?;
        let mut attrs = Attrs::NONE;
        if flags & SSH_FILEXFER_ATTR_SIZE != 0 {
            attrs.size = Some(pkt.get_u64()?);
        }
        if flags & SSH_FILEXFER_ATTR_UIDGID != 0 {
            let uid = pkt.get_u32()?;
            let gid = pkt.get_u32()?;
            attrs.owner = Some((uid, gid));
        }
        if flags & SSH_FILEXFER_ATTR_PERMISSIONS != 0 {
            attrs.permissions = Some(pkt.get_u32()?);
        }
        if flags & SSH_FILEXFER_ATTR_ACMODTIME != 0 {
            let atime = pkt.get_u32()?;
            let mtime = pkt.get_u32()?;
            attrs.times = Some((atime, mtime));
        }
        if flags & SSH_FILEXFER_ATTR_EXTENDED != 0 {
            let count = pkt.get_u32()?;
            for _ in 0..count {
                let _ext_type = pkt.get_string()?;
                let _ext_data = pkt.get_string()?;
            }
        }
        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::protocol::SSH_FXP_ATTRS;

    fn decode_wire(pkt: Packet) -> Result<Attrs> {
        let rx = Packet::from_wire(&pkt.into_bytes())?;
        rx.get_attrs()
    }

    #[test]
    fn empty_attrs_is_one_word() {
        let mut pkt = Packet::new(SSH_FXP_ATTRS);
        pkt.put_attrs(&Attrs::NONE);
        assert_eq!(pkt.len(), 5);
        assert_eq!(decode_wire(pkt).unwrap(), Attrs::NONE);
    }

    #[test]
    fn fields_follow_flag_order() {
        let attrs = Attrs {
            size: Some(0x0102_0304_0506_0708),
            owner: None,
            permissions: Some(0o644),
            times: None,
        };
        let mut pkt = Packet::new(SSH_FXP_ATTRS);
        pkt.put_attrs(&attrs);
        let wire = pkt.into_bytes();
        assert_eq!(&wire[5..9], &[0, 0, 0, 5]);
        assert_eq!(&wire[9..17], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&wire[17..21], &0o644u32.to_be_bytes());
    }

    #[test]
    fn extended_pairs_are_skipped() {
        let mut pkt = Packet::new(SSH_FXP_ATTRS);
        pkt.put_u32(SSH_FILEXFER_ATTR_PERMISSIONS | SSH_FILEXFER_ATTR_EXTENDED);
        pkt.put_u32(0o755);
        pkt.put_u32(2);
        pkt.put_str("acl@example.com");
        pkt.put_string(&[1, 2, 3]);
        pkt.put_str("mime@example.com");
        pkt.put_str("text/plain");
        pkt.put_u32(0xdead_beef);
        let rx = Packet::from_wire(&pkt.into_bytes()).unwrap();
        let attrs = rx.get_attrs().unwrap();
        assert_eq!(attrs.permissions, Some(0o755));
        assert_eq!(attrs.flags(), SSH_FILEXFER_ATTR_PERMISSIONS);
        assert_eq!(rx.get_u32().unwrap(), 0xdead_beef);
    }

    #[test]
    fn missing_field_is_malformed() {
        let mut pkt = Packet::new(SSH_FXP_ATTRS);
        pkt.put_u32(SSH_FILEXFER_ATTR_ACMODTIME);
        pkt.put_u32(1);
        assert_eq!(decode_wire(pkt), Err(Error::Malformed("short buffer")));
    }

    #[test]
    fn permissions_helpers() {
        let mut attrs = Attrs::NONE;
        attrs.set_permissions(0o600);
        assert_eq!(attrs.permissions_or(0o644), 0o600);
        attrs.set_permissions(-1);
        assert_eq!(attrs.permissions, None);
        assert_eq!(attrs.permissions_or(0o644), 0o644);
        assert_eq!(attrs.size_or(7), 7);
    }
}
