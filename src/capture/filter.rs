//! BPF filter expression builder
//!
//! Every mode starts from the SIP transport rule (TCP/SCTP and UDP on the
//! configured port range plus IPv4/IPv6 fragments) and ORs in the
//! heuristics for its extra traffic class.

use std::fmt;

/// Traffic class selected by the capture mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Sip,
    SipDns,
    SipLog,
    SipRtp,
    /// SIP plus RTCP; also used for unrecognized mode names
    #[default]
    SipRtcp,
}

impl FilterMode {
    /// Maps a mode name to a mode, falling back to `SipRtcp`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "SIP" => FilterMode::Sip,
            "SIPDNS" => FilterMode::SipDns,
            "SIPLOG" => FilterMode::SipLog,
            "SIPRTP" => FilterMode::SipRtp,
            _ => FilterMode::SipRtcp,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            FilterMode::Sip => "SIP",
            FilterMode::SipDns => "SIPDNS",
            FilterMode::SipLog => "SIPLOG",
            FilterMode::SipRtp => "SIPRTP",
            FilterMode::SipRtcp => "SIPRTCP",
        }
    }
}

impl fmt::Display for FilterMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Compiled-once BPF expression string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression(String);

impl FilterExpression {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unfragmented IPv4 UDP whose payload starts with an RTP/RTCP version 2 byte
const RTP_HEURISTIC: &str =
    "(ip and ip[6] & 0x2 = 0 and ip[6:2] & 0x1fff = 0 and udp and udp[8] & 0xc0 = 0x80)";

/// RTP heuristic narrowed to RTCP packet types 200..=204
const RTCP_HEURISTIC: &str = "(ip and ip[6] & 0x2 = 0 and ip[6:2] & 0x1fff = 0 and udp and udp[8] & 0xc0 = 0x80 and udp[9] >= 0xc8 && udp[9] <= 0xcc)";

const DNS_HEURISTIC: &str = "(greater 32 and ip and dst port 53)";

const LOG_HEURISTIC: &str = "(greater 128 and (dst port 514 or port 2223))";

const ERSPAN_PROTO: &str = "proto 47";

fn sip_rule(port_range: &str) -> String {
    format!(
        "(tcp or sctp) and greater 42 and portrange {pr} or (udp and greater 128 and portrange {pr} or ip[6:2] & 0x1fff != 0 or ip6[6]=44)",
        pr = port_range
    )
}

/// Builds the filter expression for a mode, port range and wrapping flags.
///
/// ERSPAN (GRE, IP protocol 47) is ORed onto the mode expression first; the
/// VLAN flag then duplicates everything built so far under `vlan`.
pub fn build(
    mode: FilterMode,
    port_range: &str,
    with_vlan: bool,
    with_erspan: bool,
) -> FilterExpression {
    let sip = sip_rule(port_range);
    let mut expr = match mode {
        FilterMode::Sip => sip,
        FilterMode::SipDns => format!("{} or {} or {}", sip, RTCP_HEURISTIC, DNS_HEURISTIC),
        FilterMode::SipLog => format!("{} or {} or {}", sip, RTCP_HEURISTIC, LOG_HEURISTIC),
        FilterMode::SipRtp => format!("{} or {}", sip, RTP_HEURISTIC),
        FilterMode::SipRtcp => format!("{} or {}", sip, RTCP_HEURISTIC),
    };

    if with_erspan {
        expr = format!("{} or {}", expr, ERSPAN_PROTO);
    }
    if with_vlan {
        expr = format!("{} or (vlan and ({}))", expr, expr);
    }

    FilterExpression(expr)
}
