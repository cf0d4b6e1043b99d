// MYCOFLOW PERSONA INFERENCE
// MULTI-SIGNAL VOTE -> CANDIDATE -> 5-SAMPLE MAJORITY HYSTERESIS
//
// EACH TICK EVERY SIGNAL CASTS AT MOST ONE VOTE (ELEPHANT CASTS TWO).
// A CANDIDATE ONLY BECOMES THE COMMITTED PERSONA WHEN 3 OF THE LAST 5
// CANDIDATES AGREE. AN ALL-UNKNOWN WINDOW DECAYS BACK TO UNKNOWN.

use log::info;

use crate::sense::Metrics;

// --- SIGNAL THRESHOLDS ---

const LAT_RTT_MS: f64 = 40.0; // RTT ABOVE THIS: LATENCY-SENSITIVE TRAFFIC IS SUFFERING
const LAT_JITTER_MS: f64 = 15.0;
const TX_RX_RATIO: f64 = 1.5; // UPLOAD-DOMINATED LINK: BULK
const SMALL_PKT_B: f64 = 200.0; // GAMING / VOIP / DNS
const LARGE_PKT_B: f64 = 1000.0; // TRANSFERS, STREAMING
const FEW_FLOWS_MAX: usize = 5;
const MANY_FLOWS_MIN: usize = 50;
const HIGH_PKT_RATE_PPS: f64 = 500.0;
const LOW_PKT_RATE_PPS: f64 = 50.0;

const HISTORY_LEN: usize = 5;
const COMMIT_VOTES: usize = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Persona {
    #[default]
    Unknown,
    Interactive,
    Bulk,
}

impl Persona {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Interactive => "interactive",
            Self::Bulk => "bulk",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "unknown" => Some(Self::Unknown),
            "interactive" => Some(Self::Interactive),
            "bulk" => Some(Self::Bulk),
            _ => None,
        }
    }
}

// ONE TICK'S WEIGHTED EVIDENCE
pub fn classify(metrics: &Metrics) -> Persona {
    let mut votes_i = 0u32;
    let mut votes_b = 0u32;

    if metrics.rtt_ms > LAT_RTT_MS || metrics.jitter_ms > LAT_JITTER_MS {
        votes_i += 1;
    }

    if metrics.tx_bps > metrics.rx_bps * TX_RX_RATIO {
        votes_b += 1;
    }

    if metrics.avg_pkt_size > 0.0 {
        if metrics.avg_pkt_size < SMALL_PKT_B {
            votes_i += 1;
        } else if metrics.avg_pkt_size > LARGE_PKT_B {
            votes_b += 1;
        }
    }

    if metrics.active_flows >= 1 && metrics.active_flows < FEW_FLOWS_MAX {
        votes_i += 1;
    } else if metrics.active_flows > MANY_FLOWS_MIN {
        votes_b += 1;
    }

    if metrics.elephant_flow {
        votes_b += 2;
    }

    if metrics.ebpf_pkt_rate > HIGH_PKT_RATE_PPS {
        votes_i += 1;
    } else if metrics.ebpf_pkt_rate > 0.0 && metrics.ebpf_pkt_rate < LOW_PKT_RATE_PPS {
        votes_b += 1;
    }

    if votes_i > votes_b {
        Persona::Interactive
    } else if votes_b > votes_i {
        Persona::Bulk
    } else {
        Persona::Unknown
    }
}

pub struct PersonaState {
    current: Persona,
    history: [Persona; HISTORY_LEN],
    len: usize,
}

impl PersonaState {
    pub fn new() -> Self {
        Self {
            current: Persona::Unknown,
            history: [Persona::Unknown; HISTORY_LEN],
            len: 0,
        }
    }

    pub fn current(&self) -> Persona {
        self.current
    }

    // PUSH THIS TICK'S CANDIDATE AND RE-RUN THE MAJORITY RULE.
    // RETURNS THE COMMITTED PERSONA.
    pub fn update(&mut self, metrics: &Metrics) -> Persona {
        let candidate = classify(metrics);
        if self.len < HISTORY_LEN {
            self.history[self.len] = candidate;
            self.len += 1;
        } else {
            self.history.copy_within(1.., 0);
            self.history[HISTORY_LEN - 1] = candidate;
        }

        let mut count_i = 0;
        let mut count_b = 0;
        for p in &self.history[..self.len] {
            match p {
                Persona::Interactive => count_i += 1,
                Persona::Bulk => count_b += 1,
                Persona::Unknown => {}
            }
        }

        let next = if count_i >= COMMIT_VOTES {
            Persona::Interactive
        } else if count_b >= COMMIT_VOTES {
            Persona::Bulk
        } else if self.len >= HISTORY_LEN && count_i == 0 && count_b == 0 {
            Persona::Unknown
        } else {
            self.current
        };

        if next != self.current {
            info!(
                "persona changed: {} -> {}",
                self.current.label(),
                next.label()
            );
            self.current = next;
        }
        self.current
    }
}
