//! AF_PACKET TPACKET_V3 ring buffer backend

use super::{CaptureBackend, CaptureMetadata, Counters, FilterExpression, RawPacket, ReadOutcome};
use crate::protocol::ethernet::{insert_vlan_tag, TPID_VLAN};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use pcap::{Capture, Linktype};
use std::collections::VecDeque;
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{fence, Ordering};
use tracing::{debug, info};

const PACKET_RX_RING: libc::c_int = 5;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_FANOUT: libc::c_int = 18;
const TPACKET_V3: libc::c_int = 2;

const PACKET_FANOUT_HASH: u32 = 0;
const PACKET_FANOUT_FLAG_DEFRAG: u32 = 0x8000;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1 << 0;
const TP_STATUS_VLAN_VALID: u32 = 1 << 4;
const TP_STATUS_VLAN_TPID_VALID: u32 = 1 << 6;

const TPACKET_ALIGNMENT: usize = 16;
/// Frames per block, matching the usual libpcap/gopacket default
const FRAMES_PER_BLOCK: usize = 128;
/// Poll timeout and block retire timeout (milliseconds)
const READ_TIMEOUT_MS: u32 = 1000;

#[repr(C)]
struct TpacketReq3 {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
    tp_retire_blk_tov: u32,
    tp_sizeof_priv: u32,
    tp_feature_req_word: u32,
}

#[repr(C)]
struct TpacketBdTs {
    ts_sec: u32,
    ts_nsec: u32,
}

#[repr(C)]
struct TpacketHdrV1 {
    block_status: u32,
    num_pkts: u32,
    offset_to_first_pkt: u32,
    blk_len: u32,
    seq_num: u64,
    ts_first_pkt: TpacketBdTs,
    ts_last_pkt: TpacketBdTs,
}

#[repr(C)]
struct TpacketBlockDesc {
    version: u32,
    offset_to_priv: u32,
    hdr: TpacketHdrV1,
}

#[repr(C)]
struct Tpacket3Hdr {
    tp_next_offset: u32,
    tp_sec: u32,
    tp_nsec: u32,
    tp_snaplen: u32,
    tp_len: u32,
    tp_status: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_rxhash: u32,
    tp_vlan_tci: u32,
    tp_vlan_tpid: u16,
    tp_padding: u16,
}

#[repr(C)]
#[derive(Default)]
struct TpacketStatsV3 {
    tp_packets: u32,
    tp_drops: u32,
    tp_freeze_q_cnt: u32,
}

/// Ring layout derived from the buffer budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingGeometry {
    pub frame_size: usize,
    pub block_size: usize,
    pub block_count: usize,
}

impl RingGeometry {
    pub fn frames_per_block(&self) -> usize {
        self.block_size / self.frame_size
    }

    pub fn total_size(&self) -> usize {
        self.block_size * self.block_count
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Computes frame size, block size and block count for a ring of at most
/// `budget_mb` megabytes.
///
/// Frames hold at least `snaplen` bytes; blocks are whole pages.
pub fn compute_geometry(budget_mb: usize, snaplen: usize, page_size: usize) -> Result<RingGeometry> {
    if page_size == 0 || snaplen == 0 {
        return Err(Error::Setup(format!(
            "invalid ring parameters: snaplen {} page size {}",
            snaplen, page_size
        )));
    }

    let frame_size = if snaplen < page_size {
        page_size / (page_size / snaplen)
    } else {
        (snaplen / page_size + 1) * page_size
    };
    let frame_size = align_up(frame_size, TPACKET_ALIGNMENT);
    let block_size = align_up(frame_size * FRAMES_PER_BLOCK, page_size);
    let block_count = budget_mb.saturating_mul(1024 * 1024) / block_size;

    if block_count == 0 {
        return Err(Error::Setup(format!(
            "interface buffer size {} MB is too small for {} byte blocks",
            budget_mb, block_size
        )));
    }

    Ok(RingGeometry {
        frame_size,
        block_size,
        block_count,
    })
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as usize
    }
}

fn last_os_error() -> Error {
    Error::Io(std::io::Error::last_os_error())
}

fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: &T) -> Result<()> {
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const libc::c_void,
            std::mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Memory-mapped TPACKET_V3 receive ring
pub struct RingBufferCapture {
    fd: RawFd,
    ifindex: i32,
    ring: *mut u8,
    geometry: RingGeometry,
    /// Bytes kept per packet; frames are usually larger
    snaplen: usize,
    current_block: usize,
    pending: VecDeque<RawPacket>,
    with_vlan: bool,
    received: u64,
    dropped: u64,
}

// The mapping is owned by this value and only touched through &mut self.
unsafe impl Send for RingBufferCapture {}

impl RingBufferCapture {
    /// Open a ring on `ifname` (`any` binds every interface)
    pub fn open(ifname: &str, budget_mb: usize, snaplen: usize, with_vlan: bool) -> Result<Self> {
        let geometry = compute_geometry(budget_mb, snaplen, page_size())?;

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW,
                (libc::ETH_P_ALL as u16).to_be() as i32,
            )
        };
        if fd < 0 {
            return Err(Error::Setup(format!(
                "setting af_packet handle: {}",
                std::io::Error::last_os_error()
            )));
        }

        let mut capture = Self {
            fd,
            ifindex: 0,
            ring: std::ptr::null_mut(),
            geometry,
            snaplen,
            current_block: 0,
            pending: VecDeque::new(),
            with_vlan,
            received: 0,
            dropped: 0,
        };
        capture
            .setup(ifname)
            .map_err(|e| Error::Setup(format!("setting af_packet handle: {}", e)))?;

        info!(
            device = ifname,
            frame_size = geometry.frame_size,
            block_size = geometry.block_size,
            blocks = geometry.block_count,
            "opened af_packet ring"
        );
        Ok(capture)
    }

    fn setup(&mut self, ifname: &str) -> Result<()> {
        setsockopt(self.fd, libc::SOL_PACKET, PACKET_VERSION, &TPACKET_V3)?;

        let frames_per_block = self.geometry.frames_per_block();
        let req = TpacketReq3 {
            tp_block_size: self.geometry.block_size as u32,
            tp_block_nr: self.geometry.block_count as u32,
            tp_frame_size: self.geometry.frame_size as u32,
            tp_frame_nr: (frames_per_block * self.geometry.block_count) as u32,
            tp_retire_blk_tov: READ_TIMEOUT_MS,
            tp_sizeof_priv: 0,
            tp_feature_req_word: 0,
        };
        setsockopt(self.fd, libc::SOL_PACKET, PACKET_RX_RING, &req)?;

        let ring = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                self.geometry.total_size(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd,
                0,
            )
        };
        if ring == libc::MAP_FAILED {
            return Err(last_os_error());
        }
        self.ring = ring as *mut u8;

        self.ifindex = if ifname == "any" {
            0
        } else {
            Self::get_ifindex(self.fd, ifname)?
        };

        let sockaddr = libc::sockaddr_ll {
            sll_family: libc::AF_PACKET as u16,
            sll_protocol: (libc::ETH_P_ALL as u16).to_be(),
            sll_ifindex: self.ifindex,
            sll_hatype: 0,
            sll_pkttype: 0,
            sll_halen: 0,
            sll_addr: [0; 8],
        };
        let ret = unsafe {
            libc::bind(
                self.fd,
                &sockaddr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as u32,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }

        if self.ifindex != 0 {
            Self::set_promisc(self.fd, self.ifindex, true)?;
        }
        Ok(())
    }

    fn get_ifindex(fd: RawFd, ifname: &str) -> Result<i32> {
        let ifname_c = CString::new(ifname).map_err(|_| Error::InterfaceNotFound {
            name: ifname.to_string(),
        })?;

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let name_bytes = ifname_c.as_bytes_with_nul();
        if name_bytes.len() > ifr.ifr_name.len() {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name_bytes) {
            *dst = *src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd, libc::SIOCGIFINDEX, &mut ifr) };
        if ret < 0 {
            return Err(Error::InterfaceNotFound {
                name: ifname.to_string(),
            });
        }

        Ok(unsafe { ifr.ifr_ifru.ifru_ifindex })
    }

    fn set_promisc(fd: RawFd, ifindex: i32, enable: bool) -> Result<()> {
        let mreq = libc::packet_mreq {
            mr_ifindex: ifindex,
            mr_type: libc::PACKET_MR_PROMISC as u16,
            mr_alen: 0,
            mr_address: [0; 8],
        };

        let optname = if enable {
            libc::PACKET_ADD_MEMBERSHIP
        } else {
            libc::PACKET_DROP_MEMBERSHIP
        };
        setsockopt(fd, libc::SOL_PACKET, optname, &mreq)
    }

    /// Join fanout group `id`, spreading flows across its members by hash
    pub fn set_fanout(&mut self, id: u16) -> Result<()> {
        let arg: u32 = id as u32 | ((PACKET_FANOUT_HASH | PACKET_FANOUT_FLAG_DEFRAG) << 16);
        setsockopt(self.fd, libc::SOL_PACKET, PACKET_FANOUT, &arg)
            .map_err(|e| Error::Setup(format!("SetFanout '{}' for af_packet: {}", id, e)))?;
        info!(fanout_id = id, "joined af_packet fanout group");
        Ok(())
    }

    fn block(&self, index: usize) -> *mut TpacketBlockDesc {
        unsafe { self.ring.add(index * self.geometry.block_size) as *mut TpacketBlockDesc }
    }

    fn block_ready(&self, index: usize) -> bool {
        let desc = self.block(index);
        let status = unsafe { std::ptr::read_volatile(&(*desc).hdr.block_status) };
        status & TP_STATUS_USER != 0
    }

    /// Copies every packet of the current block out and hands it back to the kernel.
    fn drain_block(&mut self) {
        fence(Ordering::Acquire);
        let desc = self.block(self.current_block);
        let base = desc as *const u8;

        let (num_pkts, first) = unsafe {
            (
                (*desc).hdr.num_pkts as usize,
                (*desc).hdr.offset_to_first_pkt as usize,
            )
        };

        let mut offset = first;
        for _ in 0..num_pkts {
            if offset >= self.geometry.block_size {
                break;
            }
            let hdr = unsafe { &*(base.add(offset) as *const Tpacket3Hdr) };
            let data = unsafe {
                std::slice::from_raw_parts(base.add(offset + hdr.tp_mac as usize), hdr.tp_snaplen as usize)
            };

            let vlan_valid = hdr.tp_status & TP_STATUS_VLAN_VALID != 0;
            let (data, extra) = if self.with_vlan && vlan_valid {
                let tpid = if hdr.tp_status & TP_STATUS_VLAN_TPID_VALID != 0 {
                    hdr.tp_vlan_tpid
                } else {
                    TPID_VLAN
                };
                let tagged = insert_vlan_tag(data, tpid, hdr.tp_vlan_tci as u16);
                let extra = tagged.len() - data.len();
                (tagged, extra)
            } else {
                (data.to_vec(), 0)
            };

            let timestamp = DateTime::from_timestamp(hdr.tp_sec as i64, hdr.tp_nsec)
                .unwrap_or_else(Utc::now);
            self.pending.push_back(RawPacket {
                meta: CaptureMetadata {
                    timestamp,
                    length: hdr.tp_len as usize + extra,
                    capture_length: data.len(),
                },
                data,
            });

            if hdr.tp_next_offset == 0 {
                break;
            }
            offset += hdr.tp_next_offset as usize;
        }

        fence(Ordering::Release);
        unsafe { std::ptr::write_volatile(&mut (*desc).hdr.block_status, TP_STATUS_KERNEL) };
        self.current_block = (self.current_block + 1) % self.geometry.block_count;
    }

    fn poll_readable(&self) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN | libc::POLLERR,
            revents: 0,
        };
        let ret = unsafe { libc::poll(&mut pfd, 1, READ_TIMEOUT_MS as libc::c_int) };
        if ret < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(Error::Capture(err.to_string()));
        }
        Ok(ret > 0)
    }
}

/// Compiles a filter expression to classic BPF for an Ethernet socket.
fn compile_filter(filter: &FilterExpression, snaplen: usize) -> Result<Vec<libc::sock_filter>> {
    let dead = Capture::dead(Linktype::ETHERNET)?;
    let program = dead
        .compile(filter.as_str(), true)
        .map_err(|e| Error::Setup(format!("SetBPFFilter '{}' for af_packet: {}", filter, e)))?;

    program
        .get_instructions()
        .iter()
        .map(|insn| parse_instruction(&insn.to_string(), snaplen))
        .collect()
}

/// Parses libpcap's `code jt jf k` rendering of one instruction.
fn parse_instruction(text: &str, snaplen: usize) -> Result<libc::sock_filter> {
    let bad = || Error::Setup(format!("unexpected BPF instruction: {}", text));
    let mut fields = text.split_whitespace();
    let code: u16 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let jt: u8 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let jf: u8 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;
    let mut k: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(bad)?;

    // `ret #65535` from the dead handle accepts whole packets; cap at snaplen
    const BPF_RET_K: u16 = 0x06;
    if code == BPF_RET_K && k != 0 {
        k = k.min(snaplen as u32);
    }
    Ok(libc::sock_filter { code, jt, jf, k })
}

impl CaptureBackend for RingBufferCapture {
    fn read_packet(&mut self) -> Result<ReadOutcome> {
        if self.fd < 0 {
            return Err(Error::Capture("ring buffer is closed".to_string()));
        }

        if let Some(packet) = self.pending.pop_front() {
            return Ok(ReadOutcome::Packet(packet));
        }

        if !self.block_ready(self.current_block) && !self.poll_readable()? {
            return Ok(ReadOutcome::Timeout);
        }
        if !self.block_ready(self.current_block) {
            return Ok(ReadOutcome::Timeout);
        }

        self.drain_block();
        Ok(match self.pending.pop_front() {
            Some(packet) => ReadOutcome::Packet(packet),
            None => ReadOutcome::Timeout,
        })
    }

    fn install_filter(&mut self, filter: &FilterExpression) -> Result<()> {
        let mut instructions = compile_filter(filter, self.snaplen)?;
        let prog = libc::sock_fprog {
            len: instructions.len() as u16,
            filter: instructions.as_mut_ptr(),
        };
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_ATTACH_FILTER, &prog)
            .map_err(|e| Error::Setup(format!("SetBPFFilter '{}' for af_packet: {}", filter, e)))?;
        debug!(instructions = instructions.len(), "attached socket filter");
        Ok(())
    }

    fn link_type(&self) -> Linktype {
        Linktype::ETHERNET
    }

    fn stats(&mut self) -> Result<Option<Counters>> {
        let mut stats = TpacketStatsV3::default();
        let mut len = std::mem::size_of::<TpacketStatsV3>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_PACKET,
                PACKET_STATISTICS,
                &mut stats as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }

        // the kernel resets these counters on every read
        self.received += stats.tp_packets as u64;
        self.dropped += stats.tp_drops as u64;
        Ok(Some(Counters::RingBuffer {
            received: self.received,
            dropped: self.dropped,
        }))
    }

    fn close(&mut self) {
        if self.fd < 0 {
            return;
        }
        if self.ifindex != 0 {
            let _ = Self::set_promisc(self.fd, self.ifindex, false);
        }
        if !self.ring.is_null() {
            unsafe { libc::munmap(self.ring as *mut libc::c_void, self.geometry.total_size()) };
            self.ring = std::ptr::null_mut();
        }
        unsafe { libc::close(self.fd) };
        self.fd = -1;
        self.pending.clear();
        debug!("closed af_packet ring");
    }
}

impl AsRawFd for RingBufferCapture {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for RingBufferCapture {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: usize = 1024 * 1024;

    fn assert_valid(geometry: RingGeometry, budget_mb: usize, snaplen: usize, page: usize) {
        assert!(geometry.frame_size >= snaplen);
        assert_eq!(geometry.frame_size % TPACKET_ALIGNMENT, 0);
        assert_eq!(geometry.block_size % page, 0);
        assert!(geometry.block_count > 0);
        assert!(geometry.total_size() <= budget_mb * MB);
        assert!(geometry.frames_per_block() > 0);
    }

    #[test]
    fn test_geometry_default_budget() {
        let geometry = compute_geometry(32, 65535, 4096).unwrap();
        assert_eq!(geometry.frame_size, 65536);
        assert_eq!(geometry.block_size, 65536 * 128);
        assert_eq!(geometry.block_count, 4);
        assert_valid(geometry, 32, 65535, 4096);
    }

    #[test]
    fn test_geometry_small_snaplen() {
        let geometry = compute_geometry(8, 1500, 4096).unwrap();
        assert_eq!(geometry.frame_size, 2048);
        assert_valid(geometry, 8, 1500, 4096);
    }

    #[test]
    fn test_geometry_block_rounds_to_page() {
        // 4096 / (4096 / 100) = 102 bytes, which is not page friendly
        let geometry = compute_geometry(4, 100, 4096).unwrap();
        assert_valid(geometry, 4, 100, 4096);
    }

    #[test]
    fn test_geometry_many_inputs() {
        for page in [4096, 16384, 65536] {
            for snaplen in [64, 128, 1514, 4096, 9000, 65535] {
                for budget in [16, 32, 64, 256] {
                    if let Ok(geometry) = compute_geometry(budget, snaplen, page) {
                        assert_valid(geometry, budget, snaplen, page);
                    }
                }
            }
        }
    }

    #[test]
    fn test_geometry_budget_too_small() {
        assert!(matches!(compute_geometry(0, 1500, 4096), Err(Error::Setup(_))));
        assert!(matches!(compute_geometry(1, 65535, 4096), Err(Error::Setup(_))));
    }

    #[test]
    fn test_geometry_invalid_inputs() {
        assert!(compute_geometry(32, 0, 4096).is_err());
        assert!(compute_geometry(32, 1500, 0).is_err());
    }

    #[test]
    fn test_parse_instruction() {
        let insn = parse_instruction("40 0 0 12", 65535).unwrap();
        assert_eq!((insn.code, insn.jt, insn.jf, insn.k), (40, 0, 0, 12));

        let ret = parse_instruction("6 0 0 262144", 2048).unwrap();
        assert_eq!(ret.k, 2048);

        let drop = parse_instruction("6 0 0 0", 2048).unwrap();
        assert_eq!(drop.k, 0);

        assert!(parse_instruction("6 0 0", 2048).is_err());
    }

    #[test]
    fn test_compile_filter() {
        let filter = crate::capture::filter::build(
            crate::capture::FilterMode::SipRtcp,
            "5060-5090",
            true,
            true,
        );
        let program = compile_filter(&filter, 65535).unwrap();
        assert!(!program.is_empty());
        assert!(program.iter().any(|insn| insn.code == 0x06));
    }

    #[test]
    fn test_filter_accepts_snaplen_not_frame_size() {
        let geometry = compute_geometry(8, 1500, 4096).unwrap();
        assert!(geometry.frame_size > 1500);

        let filter = crate::capture::filter::build(
            crate::capture::FilterMode::Sip,
            "5060-5090",
            false,
            false,
        );
        let program = compile_filter(&filter, 1500).unwrap();
        let accepts: Vec<u32> = program
            .iter()
            .filter(|insn| insn.code == 0x06 && insn.k != 0)
            .map(|insn| insn.k)
            .collect();
        assert!(!accepts.is_empty());
        assert!(accepts.iter().all(|&k| k == 1500));
    }
}
