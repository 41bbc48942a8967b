//! Per-layer counters. Malformed and dropped input is only ever visible
//! here, never to the guest.

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IpStats {
    pub total: u64,
    pub tooshort: u64,
    pub badvers: u64,
    pub badhlen: u64,
    pub badsum: u64,
    pub badlen: u64,
    pub badaddr: u64,
    pub ttl_expired: u64,
    pub fragments: u64,
    pub frag_dropped: u64,
    pub frag_timeout: u64,
    pub reassembled: u64,
    pub noproto: u64,
    pub delivered: u64,
    pub output: u64,
    pub fragmented: u64,
    pub cant_frag: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IcmpStats {
    pub received: u64,
    pub tooshort: u64,
    pub badsum: u64,
    pub reflected: u64,
    pub proxied: u64,
    pub replies: u64,
    pub errors_sent: u64,
    pub errors_suppressed: u64,
    pub echo_expired: u64,
    pub echo_evicted: u64,
    pub proxy_failed: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TcpStats {
    pub received: u64,
    pub badsum: u64,
    pub badoff: u64,
    pub tooshort: u64,
    pub connattempt: u64,
    pub accepts: u64,
    pub connects: u64,
    pub drops: u64,
    pub closed: u64,
    pub conndrops: u64,
    pub timeoutdrop: u64,
    pub rexmttimeo: u64,
    pub persisttimeo: u64,
    pub keepprobe: u64,
    pub keepdrops: u64,
    pub sndtotal: u64,
    pub sndpack: u64,
    pub sndbyte: u64,
    pub sndrexmitpack: u64,
    pub sndacks: u64,
    pub delack: u64,
    pub rcvpack: u64,
    pub rcvbyte: u64,
    pub rcvduppack: u64,
    pub rcvpartduppack: u64,
    pub rcvoopack: u64,
    pub rcvpackafterwin: u64,
    pub rcvbadrst: u64,
    pub rcvdupack: u64,
    pub rcvacktoomuch: u64,
    pub rcvackpack: u64,
    pub rcvackbyte: u64,
    pub predack: u64,
    pub preddat: u64,
    pub fastrexmit: u64,
    pub rstsent: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UdpStats {
    pub received: u64,
    pub tooshort: u64,
    pub badlen: u64,
    pub badsum: u64,
    pub sent: u64,
    pub host_errors: u64,
    pub expired: u64,
    pub delivered: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Stats {
    pub ip: IpStats,
    pub icmp: IcmpStats,
    pub tcp: TcpStats,
    pub udp: UdpStats,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped: u64,
}
