//! Ethernet frame validation and 802.1Q tag reinsertion

use crate::{Error, Result};

/// Minimum Ethernet frame size (without FCS)
pub const MIN_FRAME_SIZE: usize = 14;
/// Length of an 802.1Q tag (TPID + TCI)
pub const VLAN_TAG_LEN: usize = 4;
/// 802.1Q customer tag
pub const TPID_VLAN: u16 = 0x8100;
/// 802.1ad service tag
pub const TPID_QINQ: u16 = 0x88A8;
/// Offset of the EtherType / TPID after both MAC addresses
const ETHERTYPE_OFFSET: usize = 12;

pub fn is_vlan_tpid(value: u16) -> bool {
    value == TPID_VLAN || value == TPID_QINQ
}

/// Validated Ethernet frame (zero-copy reference)
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a [u8],
    vlan_id: Option<u16>,
}

impl<'a> Frame<'a> {
    /// Checks the buffer holds a full Ethernet header, plus the tag when the
    /// outer TPID announces one.
    pub fn parse(buffer: &'a [u8]) -> Result<Self> {
        if buffer.len() < MIN_FRAME_SIZE {
            return Err(Error::Parse(format!(
                "ethernet frame too short: {} bytes",
                buffer.len()
            )));
        }

        let ethertype = u16::from_be_bytes([buffer[ETHERTYPE_OFFSET], buffer[ETHERTYPE_OFFSET + 1]]);
        let vlan_id = if is_vlan_tpid(ethertype) {
            if buffer.len() < MIN_FRAME_SIZE + VLAN_TAG_LEN {
                return Err(Error::Parse("VLAN frame too short".into()));
            }
            Some(u16::from_be_bytes([buffer[14], buffer[15]]) & 0x0FFF)
        } else {
            None
        };

        Ok(Self { buffer, vlan_id })
    }

    /// VLAN id of the outer tag, if any
    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan_id
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.buffer
    }
}

/// Re-inserts an 802.1Q tag that the kernel stripped into the frame.
///
/// Frames shorter than the two MAC addresses are returned unchanged.
pub fn insert_vlan_tag(frame: &[u8], tpid: u16, tci: u16) -> Vec<u8> {
    if frame.len() < ETHERTYPE_OFFSET {
        return frame.to_vec();
    }
    let mut out = Vec::with_capacity(frame.len() + VLAN_TAG_LEN);
    out.extend_from_slice(&frame[..ETHERTYPE_OFFSET]);
    out.extend_from_slice(&tpid.to_be_bytes());
    out.extend_from_slice(&tci.to_be_bytes());
    out.extend_from_slice(&frame[ETHERTYPE_OFFSET..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// dst, src, IPv4 ethertype, 4 byte payload
    const SIMPLE: [u8; 18] = [
        0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0x08, 0x00, 0xde,
        0xad, 0xbe, 0xef,
    ];

    #[test]
    fn test_frame_parse_simple() {
        let frame = Frame::parse(&SIMPLE).unwrap();
        assert!(frame.vlan_id().is_none());
        assert_eq!(frame.as_bytes(), &SIMPLE[..]);
    }

    #[test]
    fn test_frame_parse_qinq() {
        let mut data = SIMPLE[..12].to_vec();
        data.extend_from_slice(&[0x88, 0xa8, 0x20, 0x64, 0x08, 0x00, 0xca, 0xfe]);
        let frame = Frame::parse(&data).unwrap();
        assert_eq!(frame.vlan_id(), Some(100));
    }

    #[test]
    fn test_frame_parse_too_short() {
        assert!(Frame::parse(&SIMPLE[..13]).is_err());
    }

    #[test]
    fn test_frame_parse_vlan_too_short() {
        let mut data = vec![0u8; 14];
        data[12] = 0x81;
        data[13] = 0x00;
        assert!(Frame::parse(&data).is_err());
    }

    #[test]
    fn test_insert_vlan_tag() {
        let tagged = insert_vlan_tag(&SIMPLE, TPID_VLAN, 42);

        assert_eq!(tagged.len(), SIMPLE.len() + VLAN_TAG_LEN);
        assert_eq!(&tagged[12..18], &[0x81, 0x00, 0x00, 0x2a, 0x08, 0x00]);
        assert_eq!(&tagged[18..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(Frame::parse(&tagged).unwrap().vlan_id(), Some(42));
    }

    #[test]
    fn test_insert_vlan_tag_runt() {
        let runt = [1u8, 2, 3];
        assert_eq!(insert_vlan_tag(&runt, TPID_VLAN, 1), runt.to_vec());
    }
}
