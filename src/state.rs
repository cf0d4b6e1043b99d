// MYCOFLOW SHARED STATE
// THE ONE OBJECT BOTH THREADS TOUCH. A SINGLE MUTEX GUARDS THE LATEST
// SNAPSHOT (METRICS/BASELINE/POLICY/PERSONA/REASON), THE OPERATOR
// PERSONA OVERRIDE, AND THE ACTUATION PARAMETERS THE IPC THREAD NEEDS.
//
// THE LOOP THREAD NEVER RUNS EXTERNAL COMMANDS UNDER THE MUTEX; THE
// IPC THREAD DOES HOLD IT ACROSS ONE BOUNDED apply_policy SO A RACING
// STATUS READ CANNOT OBSERVE A HALF-APPLIED OPERATOR POLICY.
//
// ALSO OWNS THE TWO FILE SURFACES: THE ATOMIC STATUS DUMP
// (/tmp/myco_state.json) AND THE PER-TICK METRIC JOURNAL.

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;
use serde_json::{json, Value};

use crate::act;
use crate::config::Config;
use crate::control::Policy;
use crate::persona::Persona;
use crate::sense::Metrics;

pub const STATE_FILE: &str = "/tmp/myco_state.json";
pub const STATE_FILE_TMP: &str = "/tmp/myco_state.json.tmp";

// ACTUATION PARAMETERS COPIED OUT OF CONFIG FOR THE IPC THREAD.
// REFRESHED BY THE LOOP ON START AND AFTER EVERY RELOAD.
#[derive(Clone, Default)]
pub struct ActParams {
    pub iface: String,
    pub no_tc: bool,
    pub force_fail: bool,
    pub min_bw_kbit: i64,
    pub max_bw_kbit: i64,
    pub step_kbit: i64,
}

impl ActParams {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            iface: cfg.egress_iface.clone(),
            no_tc: cfg.no_tc,
            force_fail: cfg.force_act_fail,
            min_bw_kbit: cfg.min_bandwidth_kbit,
            max_bw_kbit: cfg.max_bandwidth_kbit,
            step_kbit: cfg.bandwidth_step_kbit,
        }
    }
}

#[derive(Default)]
struct StateInner {
    metrics: Metrics,
    baseline: Metrics,
    policy: Policy,
    persona: Persona,
    safe_mode: bool,
    reason: String,
    persona_override: Option<Persona>,
    // OPERATOR-SET BANDWIDTH, CONSUMED BY THE LOOP NEXT TICK
    requested_bw: Option<i64>,
    act: ActParams,
}

pub struct SharedState {
    inner: Mutex<StateInner>,
}

impl SharedState {
    pub fn new(cfg: &Config, initial: Policy) -> Self {
        let inner = StateInner {
            policy: initial,
            reason: "startup".into(),
            act: ActParams::from_config(cfg),
            ..Default::default()
        };
        Self {
            inner: Mutex::new(inner),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        // A POISONED MUTEX MEANS A PANICKING IPC HANDLER; THE SNAPSHOT
        // IS PLAIN DATA, SO KEEP SERVING IT.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // LOOP, START OF TICK: PULL THE OPERATOR INPUTS
    pub fn take_inputs(&self) -> (Option<Persona>, Option<i64>) {
        let mut inner = self.lock();
        (inner.persona_override, inner.requested_bw.take())
    }

    // LOOP, AFTER DECIDE: PUBLISH THIS TICK'S VIEW
    #[allow(clippy::too_many_arguments)]
    pub fn publish(
        &self,
        metrics: &Metrics,
        baseline: &Metrics,
        policy: Policy,
        persona: Persona,
        safe_mode: bool,
        reason: &str,
    ) {
        let mut inner = self.lock();
        inner.metrics = *metrics;
        inner.baseline = *baseline;
        inner.policy = policy;
        inner.persona = persona;
        inner.safe_mode = safe_mode;
        inner.reason.clear();
        inner.reason.push_str(reason);
    }

    // LOOP, AFTER RELOAD: REFRESH WHAT THE IPC THREAD ACTS WITH
    pub fn set_act_params(&self, params: ActParams) {
        self.lock().act = params;
    }

    pub fn status_value(&self) -> Value {
        let inner = self.lock();
        json!({
            "metrics": inner.metrics,
            "baseline": inner.baseline,
            "policy": inner.policy,
            "persona": inner.persona.label(),
            "reason": inner.reason,
            "persona_override": inner.persona_override.is_some(),
            "persona_override_value": inner.persona_override.unwrap_or(Persona::Unknown).label(),
            "safe_mode": inner.safe_mode,
        })
    }

    pub fn policy_value(&self) -> Value {
        let inner = self.lock();
        json!({
            "bandwidth_kbit": inner.policy.bandwidth_kbit,
            "ingress_bw_kbit": inner.policy.ingress_bw_kbit,
            "boosted": inner.policy.boosted,
        })
    }

    // OPERATOR POLICY WRITE: CLAMP, ACTUATE, PUBLISH, HAND TO THE LOOP.
    // A SUCCESSFUL WRITE IS THE EXTERNAL SAFE-MODE CLEAR.
    pub fn set_policy(&self, bandwidth_kbit: i64, reason: &'static str) -> Result<Value, String> {
        let mut inner = self.lock();
        let bw = bandwidth_kbit.clamp(inner.act.min_bw_kbit, inner.act.max_bw_kbit);
        let desired = Policy {
            bandwidth_kbit: bw,
            ..inner.policy
        };
        if !act::apply_policy(&inner.act.iface, &desired, inner.act.no_tc, inner.act.force_fail) {
            return Err("actuation failed".into());
        }
        inner.policy = desired;
        inner.safe_mode = false;
        inner.reason.clear();
        inner.reason.push_str(reason);
        inner.requested_bw = Some(bw);
        Ok(json!({ "bandwidth_kbit": bw }))
    }

    pub fn nudge_policy(&self, step: Option<i64>, up: bool) -> Result<Value, String> {
        let (current, default_step) = {
            let inner = self.lock();
            (inner.policy.bandwidth_kbit, inner.act.step_kbit)
        };
        let step = step.unwrap_or(default_step);
        let target = if up { current + step } else { current - step };
        self.set_policy(target, if up { "ubus-boost" } else { "ubus-throttle" })
    }

    pub fn persona_override(&self) -> Option<Persona> {
        self.lock().persona_override
    }

    pub fn set_persona_override(&self, persona: Persona) {
        self.lock().persona_override = Some(persona);
    }

    pub fn clear_persona_override(&self) {
        self.lock().persona_override = None;
    }

    // ATOMIC STATUS FILE: TEMP WRITE THEN RENAME, SO READERS NEVER SEE
    // A PARTIAL DOCUMENT
    pub fn dump_status_file(&self) {
        let value = self.status_value();
        let pretty = match serde_json::to_string_pretty(&value) {
            Ok(s) => s,
            Err(e) => {
                warn!("status serialize failed: {}", e);
                return;
            }
        };
        if let Err(e) = std::fs::write(STATE_FILE_TMP, pretty) {
            warn!("status dump write failed: {}", e);
            return;
        }
        if let Err(e) = std::fs::rename(STATE_FILE_TMP, STATE_FILE) {
            warn!("status dump rename failed: {}", e);
        }
    }
}

// ONE JSON LINE PER TICK, APPEND-ONLY, FOR OFFLINE ANALYSIS
pub fn append_metric_line(path: &str, metrics: &Metrics, persona: Persona, reason: &str) {
    if path.is_empty() {
        return;
    }
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    let line = json!({
        "ts": (ts * 1000.0).round() / 1000.0,
        "rtt_ms": metrics.rtt_ms,
        "jitter_ms": metrics.jitter_ms,
        "tx_bps": metrics.tx_bps,
        "rx_bps": metrics.rx_bps,
        "cpu_pct": metrics.cpu_pct,
        "persona": persona.label(),
        "reason": reason,
    });

    use std::io::Write;
    let file = std::fs::OpenOptions::new().create(true).append(true).open(path);
    match file {
        Ok(mut f) => {
            if let Err(e) = writeln!(f, "{}", line) {
                warn!("metric journal write failed: {}", e);
            }
        }
        Err(e) => warn!("metric journal open failed ({}): {}", path, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dry_cfg() -> Config {
        Config::default() // no_tc DEFAULTS ON: ACTUATION IS A DRY RUN
    }

    fn state() -> SharedState {
        let cfg = dry_cfg();
        SharedState::new(
            &cfg,
            Policy {
                bandwidth_kbit: cfg.bandwidth_kbit,
                ingress_bw_kbit: 0,
                boosted: false,
            },
        )
    }

    #[test]
    fn status_has_contract_keys() {
        let st = state();
        let v = st.status_value();
        for key in [
            "metrics",
            "baseline",
            "policy",
            "persona",
            "reason",
            "persona_override",
            "persona_override_value",
            "safe_mode",
        ] {
            assert!(v.get(key).is_some(), "missing key {}", key);
        }
        assert_eq!(v["reason"], "startup");
        assert_eq!(v["persona"], "unknown");
    }

    #[test]
    fn set_policy_clamps_and_queues_for_loop() {
        let st = state();
        let out = st.set_policy(999_999_999, "ubus-set").unwrap();
        assert_eq!(out["bandwidth_kbit"], 100000);
        let (_, requested) = st.take_inputs();
        assert_eq!(requested, Some(100000));
        // CONSUMED: SECOND TAKE IS EMPTY
        let (_, requested) = st.take_inputs();
        assert_eq!(requested, None);
        assert_eq!(st.status_value()["reason"], "ubus-set");
    }

    #[test]
    fn set_policy_clears_safe_mode() {
        let st = state();
        st.publish(
            &Metrics::default(),
            &Metrics::default(),
            Policy::default(),
            Persona::Unknown,
            true,
            "safe-mode: outlier",
        );
        assert_eq!(st.status_value()["safe_mode"], true);
        st.set_policy(15000, "ubus-set").unwrap();
        assert_eq!(st.status_value()["safe_mode"], false);
    }

    #[test]
    fn set_policy_fails_when_actuation_fails() {
        let cfg = {
            let mut c = dry_cfg();
            c.force_act_fail = true;
            c
        };
        let st = SharedState::new(&cfg, Policy::default());
        assert!(st.set_policy(15000, "ubus-set").is_err());
        let (_, requested) = st.take_inputs();
        assert_eq!(requested, None);
    }

    #[test]
    fn nudge_uses_default_step() {
        let st = state();
        let out = st.nudge_policy(None, true).unwrap();
        assert_eq!(out["bandwidth_kbit"], 22000);
        let out = st.nudge_policy(Some(5000), false).unwrap();
        assert_eq!(out["bandwidth_kbit"], 17000);
        assert_eq!(st.status_value()["reason"], "ubus-throttle");
    }

    #[test]
    fn persona_override_round_trip() {
        let st = state();
        assert_eq!(st.persona_override(), None);
        st.set_persona_override(Persona::Bulk);
        assert_eq!(st.persona_override(), Some(Persona::Bulk));
        assert_eq!(st.status_value()["persona_override_value"], "bulk");
        st.clear_persona_override();
        assert_eq!(st.persona_override(), None);
    }

    #[test]
    fn metric_journal_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let path = path.to_str().unwrap();
        let m = Metrics {
            rtt_ms: 12.5,
            ..Default::default()
        };
        append_metric_line(path, &m, Persona::Interactive, "no-change");
        append_metric_line(path, &m, Persona::Interactive, "no-change");

        let raw = std::fs::read_to_string(path).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);
        let v: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(v["rtt_ms"], 12.5);
        assert_eq!(v["persona"], "interactive");
    }

    #[test]
    fn empty_journal_path_is_noop() {
        append_metric_line("", &Metrics::default(), Persona::Unknown, "no-change");
    }
}
