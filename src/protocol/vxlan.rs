//! VXLAN header (RFC 7348, with the group-policy extension layout)

use crate::{Error, Result};

pub const VXLAN_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VxlanHeader {
    pub flags: u16,
    pub group_policy_id: u16,
    /// VXLAN Network Identifier (24 bits)
    pub vni: u32,
    pub reserved: u8,
}

impl VxlanHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VXLAN_HEADER_LEN {
            return Err(Error::Parse(format!(
                "VXLAN header needs {} bytes, got {}",
                VXLAN_HEADER_LEN,
                data.len()
            )));
        }

        Ok(Self {
            flags: u16::from_be_bytes([data[0], data[1]]),
            group_policy_id: u16::from_be_bytes([data[2], data[3]]),
            vni: u32::from_be_bytes([0, data[4], data[5], data[6]]),
            reserved: data[7],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_header() {
        let data = [0x08, 0x00, 0x00, 0x2a, 0x00, 0x10, 0x01, 0x00, 0xff];
        let header = VxlanHeader::parse(&data).unwrap();
        assert_eq!(header.flags, 0x0800);
        assert_eq!(header.group_policy_id, 42);
        assert_eq!(header.vni, 0x1001);
        assert_eq!(header.reserved, 0);
    }

    #[test]
    fn test_parse_too_short() {
        assert!(VxlanHeader::parse(&[0x08, 0x00, 0x00]).is_err());
    }
}
