// MYCOFLOW FLOW TABLE
// FIXED 256-SLOT OPEN-ADDRESSED TABLE OF ACTIVE 5-TUPLE FLOWS.
// LINEAR PROBE FROM FNV-1A HASH, LRU EVICTION ON FULL INSERT,
// STALE ENTRIES AGED OUT EVERY TICK. NO ALLOCATION AFTER STARTUP.
//
// FEEDS TWO PERSONA SIGNALS: active_flows AND elephant_flow
// (ONE FLOW CARRYING >= 60% OF ALL TRACKED BYTES).

use std::net::Ipv4Addr;

use log::debug;

pub const FLOW_TABLE_SIZE: usize = 256;
pub const FLOW_MAX_AGE_S: f64 = 60.0;
pub const ELEPHANT_RATIO: f64 = 0.60;

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    fn hash(&self) -> usize {
        // FNV-1A OVER THE FIELD BYTES IN DECLARATION ORDER
        let mut h: u32 = 2166136261;
        let mut mix = |bytes: &[u8]| {
            for &b in bytes {
                h ^= u32::from(b);
                h = h.wrapping_mul(16777619);
            }
        };
        mix(&self.src_ip.to_be_bytes());
        mix(&self.dst_ip.to_be_bytes());
        mix(&self.src_port.to_be_bytes());
        mix(&self.dst_port.to_be_bytes());
        mix(&[self.protocol]);
        h as usize % FLOW_TABLE_SIZE
    }
}

#[derive(Clone, Copy, Default)]
pub struct FlowEntry {
    pub key: FlowKey,
    pub packets: u64,
    pub bytes: u64,
    pub last_seen: f64,
    pub active: bool,
}

pub struct FlowTable {
    entries: [FlowEntry; FLOW_TABLE_SIZE],
    count: usize,
}

impl FlowTable {
    pub fn new() -> Self {
        Self {
            entries: [FlowEntry::default(); FLOW_TABLE_SIZE],
            count: 0,
        }
    }

    // INSERT OR REFRESH. COUNTERS ARE CUMULATIVE PER FLOW (CONNTRACK
    // REPORTS TOTALS), SO MATCHING ENTRIES ARE OVERWRITTEN, NOT SUMMED.
    pub fn update(&mut self, key: &FlowKey, packets: u64, bytes: u64, now: f64) {
        let start = key.hash();
        for i in 0..FLOW_TABLE_SIZE {
            let slot = (start + i) % FLOW_TABLE_SIZE;
            let e = &mut self.entries[slot];
            if !e.active {
                *e = FlowEntry {
                    key: *key,
                    packets,
                    bytes,
                    last_seen: now,
                    active: true,
                };
                self.count += 1;
                return;
            }
            if e.key == *key {
                e.packets = packets;
                e.bytes = bytes;
                e.last_seen = now;
                return;
            }
        }

        // TABLE FULL: EVICT THE SLOT WITH THE SMALLEST last_seen
        let mut victim = 0;
        let mut oldest = self.entries[0].last_seen;
        for (i, e) in self.entries.iter().enumerate().skip(1) {
            if e.last_seen < oldest {
                oldest = e.last_seen;
                victim = i;
            }
        }
        self.entries[victim] = FlowEntry {
            key: *key,
            packets,
            bytes,
            last_seen: now,
            active: true,
        };
    }

    pub fn evict_stale(&mut self, now: f64, max_age_s: f64) {
        for e in self.entries.iter_mut() {
            if e.active && (now - e.last_seen) > max_age_s {
                e.active = false;
                self.count -= 1;
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.count
    }

    pub fn has_elephant(&self, dominance_ratio: f64) -> bool {
        if self.count == 0 {
            return false;
        }
        let mut total: u64 = 0;
        let mut max: u64 = 0;
        for e in self.entries.iter().filter(|e| e.active) {
            total += e.bytes;
            max = max.max(e.bytes);
        }
        if total == 0 {
            return false;
        }
        (max as f64 / total as f64) >= dominance_ratio
    }

    // READ THE KERNEL CONNTRACK TABLE AND FOLD EVERY IPV4 TCP/UDP
    // ENTRY INTO THE TABLE. RETURNS None WHEN CONNTRACK IS UNAVAILABLE
    // (MODULE NOT LOADED OR NO PERMISSION).
    pub fn populate_from_conntrack(&mut self, now: f64) -> Option<usize> {
        let raw = std::fs::read_to_string("/proc/net/nf_conntrack").ok()?;
        let mut parsed = 0;
        for line in raw.lines() {
            if let Some((key, packets, bytes)) = parse_conntrack_line(line) {
                self.update(&key, packets, bytes, now);
                parsed += 1;
            }
        }
        debug!("conntrack: {} flows parsed", parsed);
        Some(parsed)
    }
}

// ONE nf_conntrack LINE -> (KEY, PACKETS, BYTES). ORIGIN DIRECTION ONLY:
// THE FIRST src=/dst=/sport=/dport=/packets=/bytes= TOKENS WIN.
pub fn parse_conntrack_line(line: &str) -> Option<(FlowKey, u64, u64)> {
    let protocol = if line.contains("tcp") {
        6
    } else if line.contains("udp") {
        17
    } else {
        return None;
    };

    let src: Ipv4Addr = token(line, "src=")?.parse().ok()?;
    let dst: Ipv4Addr = token(line, "dst=")?.parse().ok()?;
    let sport: u16 = token(line, "sport=")?.parse().ok()?;
    let dport: u16 = token(line, "dport=")?.parse().ok()?;
    let packets: u64 = token(line, "packets=").and_then(|t| t.parse().ok()).unwrap_or(0);
    let bytes: u64 = token(line, "bytes=").and_then(|t| t.parse().ok()).unwrap_or(0);

    let key = FlowKey {
        src_ip: u32::from(src),
        dst_ip: u32::from(dst),
        src_port: sport,
        dst_port: dport,
        protocol,
    };
    Some((key, packets, bytes))
}

fn token<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = &line[line.find(prefix)? + prefix.len()..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    Some(&rest[..end])
}
