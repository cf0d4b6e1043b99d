// MYCOFLOW CONTROLLER
// CONGESTION DETECTION + ACTION SELECTION + SAFE-MODE LATCH
//
// DECIDES ONCE PER TICK FROM SMOOTHED METRICS, THE IDLE BASELINE AND
// THE COMMITTED PERSONA. EVERY DECISION IS BOUNDED: BANDWIDTH STAYS IN
// [MIN,MAX], ACTIONS PASS THROUGH THE LOOP'S COOLDOWN, AND ANY OUTLIER
// OR FAILED ACTUATION LATCHES SAFE MODE (HOLD LAST STABLE, STOP ACTING
// UNTIL AN OPERATOR CLEARS IT).
//
// THE FEEDBACK RING CLOSES THE OUTER LOOP: EACH BANDWIDTH CHANGE
// RECORDS RTT BEFORE/AFTER. WHEN MOST ACTIONS FAIL TO MOVE RTT, THE
// STEP IS HALVED ONCE FOR THE LIFE OF THE PROCESS.

use log::{debug, warn};
use serde::Serialize;

use crate::config::Config;
use crate::persona::Persona;
use crate::sense::Metrics;

// --- OUTLIER GUARD ---

const OUTLIER_FACTOR: f64 = 5.0; // RTT/JITTER BEYOND 5X BASELINE: DO NOT ACT ON IT
const BASELINE_FLOOR: f64 = 0.1; // BASELINES BELOW THIS ARE NOT A USABLE REFERENCE

// --- CONGESTION THRESHOLDS (SCALED FROM BASELINE, THEN CLAMPED) ---

const RTT_THRESH_MIN_MS: f64 = 8.0;
const RTT_THRESH_MAX_MS: f64 = 60.0;
const JITTER_THRESH_MIN_MS: f64 = 4.0;
const JITTER_THRESH_MAX_MS: f64 = 30.0;
const LOSS_CONGESTED_PCT: f64 = 2.0;

// --- STABILITY / FEEDBACK ---

const STABLE_COMMIT_CYCLES: u32 = 3; // UNCHANGED DECIDES BEFORE last_stable COMMITS
const FEEDBACK_CAP: usize = 8;
const FEEDBACK_SETTLE_S: f64 = 3.0; // RTT SAMPLE TAKEN THIS LONG AFTER AN ACTION
const EFFECTIVE_RTT_GAIN_MS: f64 = 2.0; // ACTION MUST BUY AT LEAST THIS MUCH RTT
const ADAPT_MIN_FILLED: usize = 4;
const STEP_FLOOR_KBIT: i64 = 500;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize)]
pub struct Policy {
    pub bandwidth_kbit: i64,
    pub ingress_bw_kbit: i64, // 0 = INGRESS NOT TRACKED
    pub boosted: bool,
}

#[derive(Clone, Copy, Default)]
struct FeedbackRecord {
    ts: f64,
    bw_before: i64,
    bw_after: i64,
    rtt_before: f64,
    rtt_after: f64,
    filled: bool,
}

pub struct Decision {
    pub desired: Policy,
    pub reason: &'static str,
    pub change: bool,
}

pub struct ControlState {
    pub current: Policy,
    pub last_stable: Policy,
    pub safe_mode: bool,
    stable_cycles: u32,
    step_kbit: i64,
    step_adapted: bool,
    feedback: [FeedbackRecord; FEEDBACK_CAP],
    feedback_head: usize,
    feedback_len: usize,
}

impl ControlState {
    pub fn new(cfg: &Config) -> Self {
        let current = Policy {
            bandwidth_kbit: cfg.bandwidth_kbit,
            ingress_bw_kbit: if cfg.ingress_enabled {
                cfg.ingress_bandwidth_kbit
            } else {
                0
            },
            boosted: false,
        };
        Self {
            current,
            last_stable: current,
            safe_mode: false,
            stable_cycles: 0,
            step_kbit: cfg.bandwidth_step_kbit,
            step_adapted: false,
            feedback: [FeedbackRecord::default(); FEEDBACK_CAP],
            feedback_head: 0,
            feedback_len: 0,
        }
    }

    pub fn step_kbit(&self) -> i64 {
        self.step_kbit
    }

    pub fn step_adapted(&self) -> bool {
        self.step_adapted
    }

    pub fn decide(
        &mut self,
        cfg: &Config,
        metrics: &Metrics,
        baseline: &Metrics,
        persona: Persona,
        now: f64,
    ) -> Decision {
        self.settle_feedback(metrics, now);

        let mut desired = self.current;
        let mut reason = "no-change";

        if is_outlier(metrics, baseline, cfg) {
            self.safe_mode = true;
            desired = self.last_stable;
            return Decision {
                desired,
                reason: "safe-mode: outlier",
                change: desired.bandwidth_kbit != self.current.bandwidth_kbit,
            };
        }

        let thresh_rtt =
            (baseline.rtt_ms * cfg.rtt_margin_factor).clamp(RTT_THRESH_MIN_MS, RTT_THRESH_MAX_MS);
        let thresh_jitter = (baseline.jitter_ms * cfg.rtt_margin_factor)
            .clamp(JITTER_THRESH_MIN_MS, JITTER_THRESH_MAX_MS);
        let congested = metrics.rtt_ms - baseline.rtt_ms > thresh_rtt
            || metrics.jitter_ms - baseline.jitter_ms > thresh_jitter
            || metrics.qdisc_backlog > 0
            || metrics.probe_loss_pct > LOSS_CONGESTED_PCT;

        let mut delta: i64 = 0;
        match (congested, persona) {
            (true, Persona::Bulk) => {
                delta = -self.step_kbit;
                desired.boosted = false;
                reason = "bulk-congested: throttle";
            }
            (false, Persona::Interactive) => {
                delta = self.step_kbit;
                desired.boosted = true;
                reason = "interactive-clear: boost";
            }
            (true, Persona::Interactive) => {
                delta = -self.step_kbit / 2;
                desired.boosted = false;
                reason = "interactive-congested: soften";
            }
            _ => {}
        }

        desired.bandwidth_kbit = (desired.bandwidth_kbit + delta)
            .clamp(cfg.min_bandwidth_kbit, cfg.max_bandwidth_kbit);
        if desired.ingress_bw_kbit > 0 {
            desired.ingress_bw_kbit = (desired.ingress_bw_kbit + delta)
                .clamp(cfg.min_bandwidth_kbit, cfg.max_bandwidth_kbit);
        }

        if desired.bandwidth_kbit == self.current.bandwidth_kbit {
            self.stable_cycles += 1;
            if self.stable_cycles >= STABLE_COMMIT_CYCLES {
                self.last_stable = self.current;
                self.stable_cycles = 0;
            }
            return Decision {
                desired,
                reason,
                change: false,
            };
        }

        self.stable_cycles = 0;
        self.push_feedback(FeedbackRecord {
            ts: now,
            bw_before: self.current.bandwidth_kbit,
            bw_after: desired.bandwidth_kbit,
            rtt_before: metrics.rtt_ms,
            rtt_after: 0.0,
            filled: false,
        });
        Decision {
            desired,
            reason,
            change: true,
        }
    }

    // ADOPT A SUCCESSFULLY ACTUATED POLICY AS THE NEW CURRENT
    pub fn commit(&mut self, desired: Policy) {
        self.current = desired;
    }

    pub fn on_action_result(&mut self, success: bool) {
        if !success {
            warn!("actuation failed, entering safe mode");
            self.safe_mode = true;
            self.current = self.last_stable;
            self.stable_cycles = 0;
        }
    }

    // OPERATOR-SET BANDWIDTH (IPC). CLEARS THE SAFE-MODE LATCH: AN
    // EXPLICIT POLICY IS THE EXTERNAL CLEAR IN THE STATE MACHINE.
    pub fn adopt_external(&mut self, bandwidth_kbit: i64) {
        self.current.bandwidth_kbit = bandwidth_kbit;
        self.safe_mode = false;
        self.stable_cycles = 0;
    }

    // --- FEEDBACK RING ---

    fn push_feedback(&mut self, rec: FeedbackRecord) {
        self.feedback[self.feedback_head] = rec;
        self.feedback_head = (self.feedback_head + 1) % FEEDBACK_CAP;
        if self.feedback_len < FEEDBACK_CAP {
            self.feedback_len += 1;
        }
    }

    // FILL MATURED RECORDS WITH THE CURRENT RTT, THEN CHECK WHETHER
    // THE STEP SIZE IS DOING ANY GOOD. HALVING FIRES AT MOST ONCE.
    fn settle_feedback(&mut self, metrics: &Metrics, now: f64) {
        for rec in self.feedback[..self.feedback_len].iter_mut() {
            if !rec.filled && now - rec.ts >= FEEDBACK_SETTLE_S {
                rec.rtt_after = metrics.rtt_ms;
                rec.filled = true;
                debug!(
                    "feedback settled: {} -> {} kbit, rtt {:.1} -> {:.1} ms",
                    rec.bw_before, rec.bw_after, rec.rtt_before, rec.rtt_after
                );
            }
        }

        if self.step_adapted {
            return;
        }
        let mut filled = 0usize;
        let mut ineffective = 0usize;
        for rec in self.feedback[..self.feedback_len].iter() {
            if rec.filled {
                filled += 1;
                if rec.rtt_after > rec.rtt_before - EFFECTIVE_RTT_GAIN_MS {
                    ineffective += 1;
                }
            }
        }
        if filled >= ADAPT_MIN_FILLED && ineffective * 2 > filled {
            let halved = (self.step_kbit / 2).max(STEP_FLOOR_KBIT);
            warn!(
                "feedback: {}/{} actions ineffective, step {} -> {} kbit",
                ineffective, filled, self.step_kbit, halved
            );
            self.step_kbit = halved;
            self.step_adapted = true;
        }
    }
}

pub fn is_outlier(metrics: &Metrics, baseline: &Metrics, cfg: &Config) -> bool {
    if metrics.cpu_pct > cfg.max_cpu_pct {
        return true;
    }
    if baseline.rtt_ms > BASELINE_FLOOR && metrics.rtt_ms > baseline.rtt_ms * OUTLIER_FACTOR {
        return true;
    }
    if baseline.jitter_ms > BASELINE_FLOOR
        && metrics.jitter_ms > baseline.jitter_ms * OUTLIER_FACTOR
    {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn cfg() -> Config {
        let mut c = Config::default();
        c.bandwidth_kbit = 20000;
        c.bandwidth_step_kbit = 2000;
        c.min_bandwidth_kbit = 2000;
        c.max_bandwidth_kbit = 100000;
        c.max_cpu_pct = 40.0;
        c.rtt_margin_factor = 0.30;
        c
    }

    fn baseline() -> Metrics {
        Metrics {
            rtt_ms: 10.0,
            jitter_ms: 2.0,
            ..Default::default()
        }
    }

    fn idle_metrics() -> Metrics {
        Metrics {
            rtt_ms: 11.0,
            jitter_ms: 2.0,
            ..Default::default()
        }
    }

    #[test]
    fn outlier_on_cpu() {
        let m = Metrics {
            cpu_pct: 90.0,
            rtt_ms: 12.0,
            jitter_ms: 3.0,
            ..Default::default()
        };
        assert!(is_outlier(&m, &baseline(), &cfg()));
    }

    #[test]
    fn outlier_on_rtt_spike() {
        let m = Metrics {
            rtt_ms: 60.0, // 6X BASELINE
            jitter_ms: 3.0,
            ..Default::default()
        };
        assert!(is_outlier(&m, &baseline(), &cfg()));
    }

    #[test]
    fn outlier_ignores_unprimed_baseline() {
        let m = Metrics {
            rtt_ms: 500.0,
            jitter_ms: 100.0,
            ..Default::default()
        };
        let zero = Metrics::default();
        assert!(!is_outlier(&m, &zero, &cfg()));
    }

    #[test]
    fn idle_tick_is_no_change() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let d = ctl.decide(&cfg, &idle_metrics(), &baseline(), Persona::Unknown, 0.0);
        assert!(!d.change);
        assert_eq!(d.reason, "no-change");
        assert_eq!(ctl.current.bandwidth_kbit, 20000);
    }

    #[test]
    fn last_stable_commits_after_three_quiet_cycles() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        ctl.current.bandwidth_kbit = 24000; // DIVERGE FROM last_stable
        for i in 0..3 {
            ctl.decide(&cfg, &idle_metrics(), &baseline(), Persona::Unknown, i as f64);
        }
        assert_eq!(ctl.last_stable.bandwidth_kbit, 24000);
    }

    #[test]
    fn bulk_congestion_throttles() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let m = Metrics {
            rtt_ms: 50.0, // DELTA 40 > THRESH 8, BELOW 5X OUTLIER BOUND
            jitter_ms: 2.0,
            tx_bps: 10e6,
            rx_bps: 1e6,
            ..Default::default()
        };
        let d = ctl.decide(&cfg, &m, &baseline(), Persona::Bulk, 0.0);
        assert!(d.change);
        assert_eq!(d.desired.bandwidth_kbit, 18000);
        assert_eq!(d.reason, "bulk-congested: throttle");
        assert!(!d.desired.boosted);
    }

    #[test]
    fn interactive_clear_boosts() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let d = ctl.decide(&cfg, &idle_metrics(), &baseline(), Persona::Interactive, 0.0);
        assert!(d.change);
        assert_eq!(d.desired.bandwidth_kbit, 22000);
        assert_eq!(d.reason, "interactive-clear: boost");
        assert!(d.desired.boosted);
    }

    #[test]
    fn interactive_congested_softens_half_step() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let m = Metrics {
            rtt_ms: 30.0, // DELTA 20 > THRESH 8, UNDER OUTLIER BOUND
            jitter_ms: 2.0,
            ..Default::default()
        };
        let d = ctl.decide(&cfg, &m, &baseline(), Persona::Interactive, 0.0);
        assert!(d.change);
        assert_eq!(d.desired.bandwidth_kbit, 19000);
        assert_eq!(d.reason, "interactive-congested: soften");
    }

    #[test]
    fn qdisc_backlog_alone_means_congested() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let m = Metrics {
            rtt_ms: 11.0,
            jitter_ms: 2.0,
            qdisc_backlog: 1500,
            ..Default::default()
        };
        let d = ctl.decide(&cfg, &m, &baseline(), Persona::Bulk, 0.0);
        assert_eq!(d.reason, "bulk-congested: throttle");
    }

    #[test]
    fn probe_loss_alone_means_congested() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let m = Metrics {
            rtt_ms: 11.0,
            jitter_ms: 2.0,
            probe_loss_pct: 5.0,
            ..Default::default()
        };
        let d = ctl.decide(&cfg, &m, &baseline(), Persona::Bulk, 0.0);
        assert_eq!(d.reason, "bulk-congested: throttle");
    }

    #[test]
    fn bandwidth_clamped_to_envelope() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        ctl.current.bandwidth_kbit = cfg.max_bandwidth_kbit;
        let d = ctl.decide(&cfg, &idle_metrics(), &baseline(), Persona::Interactive, 0.0);
        // BOOST AT THE CEILING CLAMPS BACK: NO CHANGE
        assert!(!d.change);
        assert_eq!(d.desired.bandwidth_kbit, cfg.max_bandwidth_kbit);
    }

    #[test]
    fn ingress_tracks_same_delta() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        ctl.current.ingress_bw_kbit = 30000;
        let d = ctl.decide(&cfg, &idle_metrics(), &baseline(), Persona::Interactive, 0.0);
        assert_eq!(d.desired.bandwidth_kbit, 22000);
        assert_eq!(d.desired.ingress_bw_kbit, 32000);
    }

    #[test]
    fn outlier_latches_safe_mode_and_reverts() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let m = Metrics {
            cpu_pct: 90.0,
            rtt_ms: 12.0,
            jitter_ms: 3.0,
            ..Default::default()
        };
        let d = ctl.decide(&cfg, &m, &baseline(), Persona::Bulk, 0.0);
        assert!(ctl.safe_mode);
        assert_eq!(d.reason, "safe-mode: outlier");
        assert_eq!(d.desired, ctl.last_stable);
    }

    #[test]
    fn action_failure_latches_and_reverts() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        ctl.current.bandwidth_kbit = 18000;
        ctl.on_action_result(false);
        assert!(ctl.safe_mode);
        assert_eq!(ctl.current, ctl.last_stable);
    }

    #[test]
    fn adopt_external_clears_safe_mode() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        ctl.on_action_result(false);
        assert!(ctl.safe_mode);
        ctl.adopt_external(15000);
        assert!(!ctl.safe_mode);
        assert_eq!(ctl.current.bandwidth_kbit, 15000);
        // last_stable ONLY MOVES VIA THE 3-CYCLE COMMIT PATH
        assert_eq!(ctl.last_stable.bandwidth_kbit, 20000);
    }

    #[test]
    fn feedback_halves_step_once() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let base = baseline();

        // SIX THROTTLES, EACH 10S APART. RTT NEVER IMPROVES, SO EVERY
        // SETTLED RECORD IS INEFFECTIVE.
        let mut now = 0.0;
        for _ in 0..6 {
            let m = Metrics {
                rtt_ms: 50.0,
                jitter_ms: 2.0,
                ..base
            };
            let d = ctl.decide(&cfg, &m, &base, Persona::Bulk, now);
            if d.change {
                ctl.commit(d.desired);
            }
            now += 10.0;
        }

        assert!(ctl.step_adapted());
        assert_eq!(ctl.step_kbit(), 1000);

        // FURTHER INEFFECTIVE FEEDBACK NEVER HALVES AGAIN
        for _ in 0..6 {
            let m = Metrics {
                rtt_ms: 50.0,
                jitter_ms: 2.0,
                ..base
            };
            let d = ctl.decide(&cfg, &m, &base, Persona::Bulk, now);
            if d.change {
                ctl.commit(d.desired);
            }
            now += 10.0;
        }
        assert_eq!(ctl.step_kbit(), 1000);
    }

    #[test]
    fn step_never_drops_below_floor() {
        let mut cfg = cfg();
        cfg.bandwidth_step_kbit = 600;
        let mut ctl = ControlState::new(&cfg);
        let base = baseline();
        let mut now = 0.0;
        for _ in 0..6 {
            let m = Metrics {
                rtt_ms: 50.0,
                jitter_ms: 2.0,
                ..base
            };
            let d = ctl.decide(&cfg, &m, &base, Persona::Bulk, now);
            if d.change {
                ctl.commit(d.desired);
            }
            now += 10.0;
        }
        assert!(ctl.step_adapted());
        assert_eq!(ctl.step_kbit(), STEP_FLOOR_KBIT);
    }

    #[test]
    fn effective_actions_keep_the_step() {
        let cfg = cfg();
        let mut ctl = ControlState::new(&cfg);
        let base = baseline();

        // RTT DROPS 5MS AFTER EVERY THROTTLE: ACTIONS ARE EFFECTIVE
        // (PEAK 45 STAYS UNDER THE 5X-BASELINE OUTLIER BOUND)
        let mut rtt = 45.0;
        let mut now = 0.0;
        for _ in 0..6 {
            let m = Metrics {
                rtt_ms: rtt,
                jitter_ms: 2.0,
                ..base
            };
            let d = ctl.decide(&cfg, &m, &base, Persona::Bulk, now);
            if d.change {
                ctl.commit(d.desired);
            }
            rtt = (rtt - 5.0).max(20.0);
            now += 10.0;
        }
        assert!(!ctl.step_adapted());
        assert_eq!(ctl.step_kbit(), 2000);
    }
}
