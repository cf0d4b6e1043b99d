// MYCOFLOW METRIC SAMPLER
// ONE CALL PER TICK. NEVER FAILS: SOURCES THAT CANNOT BE READ LEAVE
// THEIR FIELDS AT ZERO AND LOG A WARNING.
//
// COUNTER SOURCES ARE CUMULATIVE (/proc/net/dev, /proc/stat), SO THE
// SAMPLER KEEPS PREVIOUS-SAMPLE REGISTERS AND PUBLISHES DELTAS. THE
// FIRST SAMPLE AFTER STARTUP SEEDS THE REGISTERS AND REPORTS ZERO.

use log::warn;
use rand::Rng;
use serde::Serialize;

use crate::netlink::NetlinkSocket;

const PROBE_COUNT: u32 = 3;
const PROBE_TIMEOUT_S: u32 = 1;

#[derive(Clone, Copy, Default, Debug, Serialize)]
pub struct Metrics {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub rx_bps: f64,
    pub tx_bps: f64,
    pub cpu_pct: f64,
    pub qdisc_backlog: u32,
    pub qdisc_drops: u32,
    pub qdisc_overlimits: u32,
    pub avg_pkt_size: f64,
    pub ebpf_rx_pkts: u64,
    pub ebpf_rx_bytes: u64,
    pub active_flows: usize,
    pub elephant_flow: bool,
    pub ebpf_pkt_rate: f64,
    pub probe_loss_pct: f64,
}

pub struct Sampler {
    prev_rx_bytes: u64,
    prev_tx_bytes: u64,
    prev_rx_pkts: u64,
    prev_tx_pkts: u64,
    prev_rtt: f64,
    prev_cpu_total: u64,
    prev_cpu_idle: u64,
    netlink: Option<NetlinkSocket>,
}

impl Sampler {
    pub fn new() -> Self {
        let netlink = match NetlinkSocket::open() {
            Ok(s) => Some(s),
            Err(e) => {
                warn!("netlink unavailable, qdisc stats zeroed: {}", e);
                None
            }
        };
        Self {
            prev_rx_bytes: 0,
            prev_tx_bytes: 0,
            prev_rx_pkts: 0,
            prev_tx_pkts: 0,
            prev_rtt: 10.0,
            prev_cpu_total: 0,
            prev_cpu_idle: 0,
            netlink,
        }
    }

    pub fn sample(
        &mut self,
        iface: &str,
        probe_host: &str,
        interval_s: f64,
        dummy: bool,
    ) -> Metrics {
        let mut m = Metrics::default();

        match read_netdev(iface) {
            Some((rx_bytes, rx_pkts, tx_bytes, tx_pkts)) => {
                if self.prev_rx_bytes != 0 || self.prev_tx_bytes != 0 {
                    m.rx_bps =
                        (rx_bytes.wrapping_sub(self.prev_rx_bytes) as f64 * 8.0) / interval_s;
                    m.tx_bps =
                        (tx_bytes.wrapping_sub(self.prev_tx_bytes) as f64 * 8.0) / interval_s;
                    let delta_bytes = rx_bytes.wrapping_sub(self.prev_rx_bytes)
                        + tx_bytes.wrapping_sub(self.prev_tx_bytes);
                    let delta_pkts = rx_pkts.wrapping_sub(self.prev_rx_pkts)
                        + tx_pkts.wrapping_sub(self.prev_tx_pkts);
                    if delta_pkts > 0 {
                        m.avg_pkt_size = delta_bytes as f64 / delta_pkts as f64;
                    }
                }
                self.prev_rx_bytes = rx_bytes;
                self.prev_tx_bytes = tx_bytes;
                self.prev_rx_pkts = rx_pkts;
                self.prev_tx_pkts = tx_pkts;
            }
            None => warn!("netdev read failed for {}", iface),
        }

        if dummy {
            m.rtt_ms = dummy_rtt();
            m.jitter_ms = (m.rtt_ms - self.prev_rtt).abs();
            m.probe_loss_pct = 0.0;
        } else {
            match probe_ping(iface, probe_host) {
                Some((rtt, jitter, loss)) => {
                    m.rtt_ms = rtt;
                    m.jitter_ms = jitter;
                    m.probe_loss_pct = loss;
                }
                None => {
                    warn!("icmp probe failed, using fallback");
                    m.rtt_ms = dummy_rtt();
                    m.jitter_ms = (m.rtt_ms - self.prev_rtt).abs();
                    m.probe_loss_pct = 100.0;
                }
            }
        }
        self.prev_rtt = m.rtt_ms;

        m.cpu_pct = self.read_cpu_pct();

        if let Some(nl) = self.netlink.as_mut() {
            if let Some(st) = nl.qdisc_stats(iface) {
                m.qdisc_backlog = st.backlog;
                m.qdisc_drops = st.drops;
                m.qdisc_overlimits = st.overlimits;
            }
        }

        m
    }

    // AGGREGATE CPU FROM /proc/stat. FIRST CALL SEEDS AND RETURNS 0.
    fn read_cpu_pct(&mut self) -> f64 {
        let raw = match std::fs::read_to_string("/proc/stat") {
            Ok(s) => s,
            Err(_) => return 0.0,
        };
        let line = match raw.lines().next() {
            Some(l) => l,
            None => return 0.0,
        };
        let (total, idle) = match parse_cpu_line(line) {
            Some(v) => v,
            None => return 0.0,
        };

        if self.prev_cpu_total == 0 {
            self.prev_cpu_total = total;
            self.prev_cpu_idle = idle;
            return 0.0;
        }

        let totald = total.wrapping_sub(self.prev_cpu_total);
        let idled = idle.wrapping_sub(self.prev_cpu_idle);
        self.prev_cpu_total = total;
        self.prev_cpu_idle = idle;

        if totald == 0 {
            return 0.0;
        }
        ((totald.saturating_sub(idled)) as f64 * 100.0 / totald as f64).max(0.0)
    }

    // STARTUP / RELOAD BASELINE: MEAN RTT AND JITTER OVER N SPACED SAMPLES
    pub fn capture_baseline(
        &mut self,
        iface: &str,
        probe_host: &str,
        samples: u32,
        interval_s: f64,
        dummy: bool,
    ) -> Metrics {
        let samples = samples.max(1);
        let mut baseline = Metrics::default();
        for _ in 0..samples {
            let m = self.sample(iface, probe_host, interval_s, dummy);
            baseline.rtt_ms += m.rtt_ms;
            baseline.jitter_ms += m.jitter_ms;
            std::thread::sleep(std::time::Duration::from_secs_f64(interval_s));
        }
        baseline.rtt_ms /= f64::from(samples);
        baseline.jitter_ms /= f64::from(samples);
        baseline
    }
}

// SLIDING BASELINE: ONLY THE PROBE FIELDS DRIFT WITH THE ENVIRONMENT.
// BPS/CPU ARE NOT MEANINGFUL LONG-TERM CONGESTION REFERENCES.
pub fn drift_baseline(baseline: &mut Metrics, current: &Metrics, decay: f64) {
    if decay <= 0.0 || decay > 1.0 {
        return;
    }
    baseline.rtt_ms = (1.0 - decay) * baseline.rtt_ms + decay * current.rtt_ms;
    baseline.jitter_ms = (1.0 - decay) * baseline.jitter_ms + decay * current.jitter_ms;
}

// SYNTHETIC RTT: UNIFORM [10,20) MS WITH A 5% CHANCE OF A [0,60) MS SPIKE
fn dummy_rtt() -> f64 {
    let mut rng = rand::thread_rng();
    let base = rng.gen_range(10.0..20.0);
    if rng.gen_range(0..100) < 5 {
        base + rng.gen_range(0.0..60.0)
    } else {
        base
    }
}

// THREE ICMP ECHOES BOUND TO iface, 1S TIMEOUT EACH.
// RETURNS (MEAN RTT, SAMPLE STDDEV, LOSS%) OR None ON TOTAL FAILURE.
fn probe_ping(iface: &str, host: &str) -> Option<(f64, f64, f64)> {
    let out = std::process::Command::new("ping")
        .args([
            "-c",
            &PROBE_COUNT.to_string(),
            "-W",
            &PROBE_TIMEOUT_S.to_string(),
            "-I",
            iface,
            host,
        ])
        .output()
        .ok()?;
    parse_ping_output(&String::from_utf8_lossy(&out.stdout), PROBE_COUNT)
}

pub fn parse_ping_output(out: &str, count: u32) -> Option<(f64, f64, f64)> {
    let mut rtts: Vec<f64> = Vec::with_capacity(count as usize);
    let mut transmitted = 0u32;
    let mut received = 0u32;

    for line in out.lines() {
        if let Some(pos) = line.find("time=") {
            let rest = &line[pos + 5..];
            let end = rest.find(' ').unwrap_or(rest.len());
            if let Ok(v) = rest[..end].parse::<f64>() {
                rtts.push(v);
            }
        }
        if line.contains("packets transmitted") {
            let mut words = line.split_whitespace();
            if let Some(t) = words.next().and_then(|w| w.parse().ok()) {
                transmitted = t;
            }
            // "N packets transmitted, M received, ..."
            if let Some(r) = line
                .split(',')
                .nth(1)
                .and_then(|part| part.split_whitespace().next())
                .and_then(|w| w.parse().ok())
            {
                received = r;
            }
        }
    }

    if rtts.is_empty() {
        return None;
    }

    let n = rtts.len() as f64;
    let mean = rtts.iter().sum::<f64>() / n;
    let jitter = if rtts.len() > 1 {
        let var = rtts.iter().map(|r| (r - mean) * (r - mean)).sum::<f64>() / (n - 1.0);
        var.sqrt()
    } else {
        0.0
    };
    let loss = if transmitted > 0 {
        f64::from(transmitted - received) * 100.0 / f64::from(transmitted)
    } else {
        f64::from(count.saturating_sub(rtts.len() as u32)) * 100.0 / f64::from(count.max(1))
    };

    Some((mean, jitter, loss))
}

// ONE /proc/net/dev LINE -> (RX BYTES, RX PKTS, TX BYTES, TX PKTS).
// FIELDS 1/2 AND 9/10 AFTER THE "iface:" PREFIX.
pub fn parse_netdev_line(line: &str, iface: &str) -> Option<(u64, u64, u64, u64)> {
    let (name, rest) = line.split_once(':')?;
    if name.trim() != iface {
        return None;
    }
    let fields: Vec<&str> = rest.split_whitespace().collect();
    if fields.len() < 10 {
        return None;
    }
    Some((
        fields[0].parse().ok()?,
        fields[1].parse().ok()?,
        fields[8].parse().ok()?,
        fields[9].parse().ok()?,
    ))
}

fn read_netdev(iface: &str) -> Option<(u64, u64, u64, u64)> {
    let raw = std::fs::read_to_string("/proc/net/dev").ok()?;
    raw.lines()
        .skip(2)
        .find_map(|line| parse_netdev_line(line, iface))
}

// FIRST /proc/stat LINE -> (TOTAL JIFFIES, IDLE JIFFIES).
// IDLE INCLUDES IOWAIT, MATCHING THE USUAL TOP-STYLE ACCOUNTING.
pub fn parse_cpu_line(line: &str) -> Option<(u64, u64)> {
    let mut words = line.split_whitespace();
    if words.next()? != "cpu" {
        return None;
    }
    let fields: Vec<u64> = words.filter_map(|w| w.parse().ok()).collect();
    if fields.len() < 4 {
        return None;
    }
    let user = fields[0];
    let nice = fields[1];
    let system = fields[2];
    let idle = fields[3];
    let iowait = *fields.get(4).unwrap_or(&0);
    let irq = *fields.get(5).unwrap_or(&0);
    let softirq = *fields.get(6).unwrap_or(&0);
    let steal = *fields.get(7).unwrap_or(&0);

    let idle_all = idle + iowait;
    let non_idle = user + nice + system + irq + softirq + steal;
    Some((idle_all + non_idle, idle_all))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netdev_line_parses_fields_1_2_9_10() {
        let line = " wan0: 1000 20 0 0 0 0 0 0 5000 40 0 0 0 0 0 0";
        let (rxb, rxp, txb, txp) = parse_netdev_line(line, "wan0").unwrap();
        assert_eq!((rxb, rxp, txb, txp), (1000, 20, 5000, 40));
    }

    #[test]
    fn netdev_line_rejects_other_iface() {
        let line = " eth1: 1000 20 0 0 0 0 0 0 5000 40 0 0 0 0 0 0";
        assert!(parse_netdev_line(line, "wan0").is_none());
    }

    #[test]
    fn cpu_line_totals() {
        // user nice system idle iowait irq softirq steal
        let (total, idle) = parse_cpu_line("cpu  100 0 50 800 40 5 5 0").unwrap();
        assert_eq!(idle, 840); // idle + iowait
        assert_eq!(total, 1000);
    }

    #[test]
    fn cpu_line_rejects_per_core_rows() {
        assert!(parse_cpu_line("cpu0 100 0 50 800").is_none());
    }

    #[test]
    fn ping_output_mean_jitter_loss() {
        let out = "PING 1.1.1.1 (1.1.1.1) 56(84) bytes of data.\n\
                   64 bytes from 1.1.1.1: icmp_seq=1 ttl=58 time=10.0 ms\n\
                   64 bytes from 1.1.1.1: icmp_seq=2 ttl=58 time=20.0 ms\n\
                   64 bytes from 1.1.1.1: icmp_seq=3 ttl=58 time=30.0 ms\n\
                   \n\
                   --- 1.1.1.1 ping statistics ---\n\
                   3 packets transmitted, 3 received, 0% packet loss, time 2003ms\n";
        let (mean, jitter, loss) = parse_ping_output(out, 3).unwrap();
        assert!((mean - 20.0).abs() < 1e-9);
        assert!((jitter - 10.0).abs() < 1e-9); // SAMPLE STDDEV OF {10,20,30}
        assert_eq!(loss, 0.0);
    }

    #[test]
    fn ping_output_partial_loss() {
        let out = "64 bytes from 1.1.1.1: icmp_seq=1 ttl=58 time=15.0 ms\n\
                   3 packets transmitted, 1 received, 66% packet loss, time 2031ms\n";
        let (mean, jitter, loss) = parse_ping_output(out, 3).unwrap();
        assert_eq!(mean, 15.0);
        assert_eq!(jitter, 0.0);
        assert!((loss - 66.66666).abs() < 0.001);
    }

    #[test]
    fn ping_output_no_replies_is_none() {
        let out = "3 packets transmitted, 0 received, 100% packet loss, time 2045ms\n";
        assert!(parse_ping_output(out, 3).is_none());
    }

    #[test]
    fn drift_moves_rtt_toward_current() {
        let mut baseline = Metrics {
            rtt_ms: 10.0,
            jitter_ms: 2.0,
            ..Default::default()
        };
        let current = Metrics {
            rtt_ms: 20.0,
            jitter_ms: 4.0,
            cpu_pct: 95.0,
            ..Default::default()
        };
        drift_baseline(&mut baseline, &current, 0.1);
        assert!((baseline.rtt_ms - 11.0).abs() < 1e-9);
        assert!((baseline.jitter_ms - 2.2).abs() < 1e-9);
        // NON-PROBE FIELDS NEVER DRIFT
        assert_eq!(baseline.cpu_pct, 0.0);
    }

    #[test]
    fn drift_ignores_bogus_decay() {
        let mut baseline = Metrics {
            rtt_ms: 10.0,
            ..Default::default()
        };
        let current = Metrics {
            rtt_ms: 100.0,
            ..Default::default()
        };
        drift_baseline(&mut baseline, &current, 0.0);
        drift_baseline(&mut baseline, &current, 1.5);
        assert_eq!(baseline.rtt_ms, 10.0);
    }

    #[test]
    fn dummy_rtt_stays_in_range() {
        for _ in 0..200 {
            let rtt = dummy_rtt();
            assert!((10.0..80.0).contains(&rtt), "rtt out of range: {}", rtt);
        }
    }
}
