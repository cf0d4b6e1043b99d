// MYCOFLOW CONFIGURATION
// DEFAULTS <- TOML FILE <- MYCOFLOW_* ENVIRONMENT, THEN CLAMPS.
// A MISSING FILE IS FINE; A BROKEN FILE IS FATAL AT STARTUP AND A
// WARN + KEEP-PREVIOUS AT RELOAD.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/mycoflow/mycoflow.toml";

#[derive(Clone, Debug)]
pub struct Config {
    pub enabled: bool,
    pub egress_iface: String,
    pub sample_hz: f64,
    pub max_cpu_pct: f64,
    pub log_level: i64,
    pub dummy_metrics: bool,
    pub baseline_samples: u32,
    pub action_cooldown_s: f64,
    pub action_rate_limit: f64,
    pub bandwidth_kbit: i64,
    pub bandwidth_step_kbit: i64,
    pub min_bandwidth_kbit: i64,
    pub max_bandwidth_kbit: i64,
    pub no_tc: bool,
    pub metric_file: String,
    pub probe_host: String,
    pub force_act_fail: bool,
    pub ebpf_enabled: bool,
    pub ebpf_obj: String,
    pub ebpf_attach: bool,
    pub ebpf_tc_dir: String,
    pub ewma_alpha: f64,
    pub baseline_decay: f64,
    pub baseline_update_interval: u64,
    pub rtt_margin_factor: f64,
    pub ingress_enabled: bool,
    pub ingress_iface: String,
    pub ingress_bandwidth_kbit: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            egress_iface: "eth0".into(),
            sample_hz: 1.0,
            max_cpu_pct: 40.0,
            log_level: 2,
            dummy_metrics: true,
            baseline_samples: 5,
            action_cooldown_s: 3.0,
            action_rate_limit: 0.5,
            bandwidth_kbit: 20000,
            bandwidth_step_kbit: 2000,
            min_bandwidth_kbit: 2000,
            max_bandwidth_kbit: 100000,
            no_tc: true,
            metric_file: String::new(),
            probe_host: "1.1.1.1".into(),
            force_act_fail: false,
            ebpf_enabled: false,
            ebpf_obj: "/usr/lib/mycoflow/mycoflow.bpf.o".into(),
            ebpf_attach: false,
            ebpf_tc_dir: "ingress".into(),
            ewma_alpha: 0.3,
            baseline_decay: 0.05,
            baseline_update_interval: 30,
            rtt_margin_factor: 0.30,
            ingress_enabled: false,
            ingress_iface: "ifb0".into(),
            ingress_bandwidth_kbit: 0,
        }
    }
}

// FILE OVERLAY: EVERY OPTION IS OPTIONAL, ABSENT ONES KEEP DEFAULTS
#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct FileOverlay {
    enabled: Option<bool>,
    egress_iface: Option<String>,
    sample_hz: Option<f64>,
    max_cpu_pct: Option<f64>,
    log_level: Option<i64>,
    dummy_metrics: Option<bool>,
    baseline_samples: Option<u32>,
    action_cooldown_s: Option<f64>,
    action_rate_limit: Option<f64>,
    bandwidth_kbit: Option<i64>,
    bandwidth_step_kbit: Option<i64>,
    min_bandwidth_kbit: Option<i64>,
    max_bandwidth_kbit: Option<i64>,
    no_tc: Option<bool>,
    metric_file: Option<String>,
    probe_host: Option<String>,
    force_act_fail: Option<bool>,
    ebpf_enabled: Option<bool>,
    ebpf_obj: Option<String>,
    ebpf_attach: Option<bool>,
    ebpf_tc_dir: Option<String>,
    ewma_alpha: Option<f64>,
    baseline_decay: Option<f64>,
    baseline_update_interval: Option<u64>,
    rtt_margin_factor: Option<f64>,
    ingress_enabled: Option<bool>,
    ingress_iface: Option<String>,
    ingress_bandwidth_kbit: Option<i64>,
}

pub fn load(path: Option<&Path>) -> Result<Config> {
    let mut cfg = Config::default();

    let path = path
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("MYCOFLOW_CONFIG").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if path.exists() {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        let overlay: FileOverlay = toml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        apply_file_overlay(&mut cfg, overlay);
    }

    apply_env_overrides(&mut cfg);
    clamp(&mut cfg);
    Ok(cfg)
}

fn apply_file_overlay(cfg: &mut Config, o: FileOverlay) {
    macro_rules! take {
        ($field:ident) => {
            if let Some(v) = o.$field {
                cfg.$field = v;
            }
        };
    }
    take!(enabled);
    take!(egress_iface);
    take!(sample_hz);
    take!(max_cpu_pct);
    take!(log_level);
    take!(dummy_metrics);
    take!(baseline_samples);
    take!(action_cooldown_s);
    take!(action_rate_limit);
    take!(bandwidth_kbit);
    take!(bandwidth_step_kbit);
    take!(min_bandwidth_kbit);
    take!(max_bandwidth_kbit);
    take!(no_tc);
    take!(metric_file);
    take!(probe_host);
    take!(force_act_fail);
    take!(ebpf_enabled);
    take!(ebpf_obj);
    take!(ebpf_attach);
    take!(ebpf_tc_dir);
    take!(ewma_alpha);
    take!(baseline_decay);
    take!(baseline_update_interval);
    take!(rtt_margin_factor);
    take!(ingress_enabled);
    take!(ingress_iface);
    take!(ingress_bandwidth_kbit);
}

fn apply_env_overrides(cfg: &mut Config) {
    env_bool("MYCOFLOW_ENABLED", &mut cfg.enabled);
    env_str("MYCOFLOW_EGRESS_IFACE", &mut cfg.egress_iface);
    env_f64("MYCOFLOW_SAMPLE_HZ", &mut cfg.sample_hz);
    env_f64("MYCOFLOW_MAX_CPU", &mut cfg.max_cpu_pct);
    env_i64("MYCOFLOW_LOG_LEVEL", &mut cfg.log_level);
    env_bool("MYCOFLOW_DUMMY", &mut cfg.dummy_metrics);
    env_u32("MYCOFLOW_BASELINE_SAMPLES", &mut cfg.baseline_samples);
    env_f64("MYCOFLOW_ACTION_COOLDOWN", &mut cfg.action_cooldown_s);
    env_f64("MYCOFLOW_ACTION_RATE", &mut cfg.action_rate_limit);
    env_i64("MYCOFLOW_BW_KBIT", &mut cfg.bandwidth_kbit);
    env_i64("MYCOFLOW_BW_STEP", &mut cfg.bandwidth_step_kbit);
    env_i64("MYCOFLOW_BW_MIN", &mut cfg.min_bandwidth_kbit);
    env_i64("MYCOFLOW_BW_MAX", &mut cfg.max_bandwidth_kbit);
    env_bool("MYCOFLOW_NO_TC", &mut cfg.no_tc);
    env_str("MYCOFLOW_METRIC_FILE", &mut cfg.metric_file);
    env_str("MYCOFLOW_PROBE_HOST", &mut cfg.probe_host);
    env_bool("MYCOFLOW_FORCE_ACT_FAIL", &mut cfg.force_act_fail);
    env_bool("MYCOFLOW_EBPF", &mut cfg.ebpf_enabled);
    env_str("MYCOFLOW_EBPF_OBJ", &mut cfg.ebpf_obj);
    env_bool("MYCOFLOW_EBPF_ATTACH", &mut cfg.ebpf_attach);
    env_str("MYCOFLOW_EBPF_TC_DIR", &mut cfg.ebpf_tc_dir);
    env_f64("MYCOFLOW_EWMA_ALPHA", &mut cfg.ewma_alpha);
    env_f64("MYCOFLOW_BASELINE_DECAY", &mut cfg.baseline_decay);
    env_u64(
        "MYCOFLOW_BASELINE_UPDATE_INTERVAL",
        &mut cfg.baseline_update_interval,
    );
    env_f64("MYCOFLOW_RTT_MARGIN", &mut cfg.rtt_margin_factor);
    env_bool("MYCOFLOW_INGRESS", &mut cfg.ingress_enabled);
    env_str("MYCOFLOW_INGRESS_IFACE", &mut cfg.ingress_iface);
    env_i64("MYCOFLOW_INGRESS_BW_KBIT", &mut cfg.ingress_bandwidth_kbit);
}

fn env_str(key: &str, out: &mut String) {
    if let Ok(v) = std::env::var(key) {
        if !v.is_empty() {
            *out = v;
        }
    }
}

fn env_i64(key: &str, out: &mut i64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *out = n;
        }
    }
}

fn env_u32(key: &str, out: &mut u32) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *out = n;
        }
    }
}

fn env_u64(key: &str, out: &mut u64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *out = n;
        }
    }
}

fn env_f64(key: &str, out: &mut f64) {
    if let Ok(v) = std::env::var(key) {
        if let Ok(n) = v.trim().parse() {
            *out = n;
        }
    }
}

fn env_bool(key: &str, out: &mut bool) {
    if let Ok(v) = std::env::var(key) {
        match v.trim() {
            "1" | "true" | "yes" | "on" => *out = true,
            "0" | "false" | "no" | "off" => *out = false,
            _ => {}
        }
    }
}

// ENFORCE THE ENVELOPE: MIN <= CURRENT <= MAX, SANE RATES, UNIT-RANGE
// FILTER WEIGHTS. RUNS AFTER EVERY LOAD AND RELOAD.
fn clamp(cfg: &mut Config) {
    if cfg.sample_hz < 0.1 {
        cfg.sample_hz = 0.1;
    }
    if cfg.action_cooldown_s < 0.0 {
        cfg.action_cooldown_s = 0.0;
    }
    if cfg.action_rate_limit <= 0.0 {
        cfg.action_rate_limit = 0.1;
    }
    if cfg.baseline_samples < 1 {
        cfg.baseline_samples = 1;
    }
    if cfg.baseline_update_interval < 1 {
        cfg.baseline_update_interval = 1;
    }
    if cfg.min_bandwidth_kbit < 100 {
        cfg.min_bandwidth_kbit = 100;
    }
    if cfg.max_bandwidth_kbit < cfg.min_bandwidth_kbit {
        cfg.max_bandwidth_kbit = cfg.min_bandwidth_kbit;
    }
    cfg.bandwidth_kbit = cfg
        .bandwidth_kbit
        .clamp(cfg.min_bandwidth_kbit, cfg.max_bandwidth_kbit);
    if cfg.bandwidth_step_kbit < 500 {
        cfg.bandwidth_step_kbit = 500;
    }
    cfg.ewma_alpha = clamp_unit(cfg.ewma_alpha);
    cfg.baseline_decay = clamp_unit(cfg.baseline_decay);
    if cfg.rtt_margin_factor < 0.0 {
        cfg.rtt_margin_factor = 0.0;
    }
    cfg.log_level = cfg.log_level.clamp(0, 3);
    if cfg.ebpf_tc_dir != "ingress" && cfg.ebpf_tc_dir != "egress" {
        cfg.ebpf_tc_dir = "ingress".into();
    }
    if cfg.ingress_enabled && cfg.ingress_bandwidth_kbit == 0 {
        cfg.ingress_bandwidth_kbit = cfg.bandwidth_kbit;
    }
    if cfg.ingress_bandwidth_kbit != 0 {
        cfg.ingress_bandwidth_kbit = cfg
            .ingress_bandwidth_kbit
            .clamp(cfg.min_bandwidth_kbit, cfg.max_bandwidth_kbit);
    }
}

// (0,1]: ZERO OR NEGATIVE WEIGHTS WOULD FREEZE THE FILTER
fn clamp_unit(v: f64) -> f64 {
    if v <= 0.0 {
        0.01
    } else if v > 1.0 {
        1.0
    } else {
        v
    }
}

pub fn level_filter(log_level: i64) -> LevelFilter {
    match log_level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_pass_clamp_unchanged() {
        let mut cfg = Config::default();
        let before = cfg.clone();
        clamp(&mut cfg);
        assert_eq!(cfg.bandwidth_kbit, before.bandwidth_kbit);
        assert_eq!(cfg.sample_hz, before.sample_hz);
        assert_eq!(cfg.ewma_alpha, before.ewma_alpha);
    }

    #[test]
    fn sample_hz_floor() {
        let mut cfg = Config::default();
        cfg.sample_hz = 0.0;
        clamp(&mut cfg);
        assert_eq!(cfg.sample_hz, 0.1);
    }

    #[test]
    fn rate_limit_floor() {
        let mut cfg = Config::default();
        cfg.action_rate_limit = -3.0;
        clamp(&mut cfg);
        assert_eq!(cfg.action_rate_limit, 0.1);
    }

    #[test]
    fn bandwidth_envelope_repairs_itself() {
        let mut cfg = Config::default();
        cfg.min_bandwidth_kbit = 50;
        cfg.max_bandwidth_kbit = 10;
        cfg.bandwidth_kbit = 999999;
        clamp(&mut cfg);
        assert_eq!(cfg.min_bandwidth_kbit, 100);
        assert_eq!(cfg.max_bandwidth_kbit, 100);
        assert_eq!(cfg.bandwidth_kbit, 100);
    }

    #[test]
    fn alpha_clamped_to_unit_range() {
        let mut cfg = Config::default();
        cfg.ewma_alpha = 7.0;
        cfg.baseline_decay = -1.0;
        clamp(&mut cfg);
        assert_eq!(cfg.ewma_alpha, 1.0);
        assert_eq!(cfg.baseline_decay, 0.01);
    }

    #[test]
    fn bogus_tc_dir_falls_back_to_ingress() {
        let mut cfg = Config::default();
        cfg.ebpf_tc_dir = "sideways".into();
        clamp(&mut cfg);
        assert_eq!(cfg.ebpf_tc_dir, "ingress");
    }

    #[test]
    fn ingress_bandwidth_defaults_to_egress_cap() {
        let mut cfg = Config::default();
        cfg.ingress_enabled = true;
        clamp(&mut cfg);
        assert_eq!(cfg.ingress_bandwidth_kbit, cfg.bandwidth_kbit);
    }

    #[test]
    fn file_overlay_applies() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            "egress_iface = \"wan0\"\nbandwidth_kbit = 50000\ndummy_metrics = false"
        )
        .unwrap();
        let cfg = load(Some(f.path())).unwrap();
        assert_eq!(cfg.egress_iface, "wan0");
        assert_eq!(cfg.bandwidth_kbit, 50000);
        assert!(!cfg.dummy_metrics);
        // UNTOUCHED OPTIONS KEEP DEFAULTS
        assert_eq!(cfg.probe_host, "1.1.1.1");
    }

    #[test]
    fn broken_file_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bandwidth_kbit = \"lots\"").unwrap();
        assert!(load(Some(f.path())).is_err());
    }

    #[test]
    fn unknown_key_is_an_error() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "bandwidht_kbit = 1000").unwrap();
        assert!(load(Some(f.path())).is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = load(Some(Path::new("/nonexistent/mycoflow.toml"))).unwrap();
        assert_eq!(cfg.bandwidth_kbit, 20000);
    }

    #[test]
    fn level_filter_mapping() {
        assert_eq!(level_filter(0), LevelFilter::Error);
        assert_eq!(level_filter(2), LevelFilter::Info);
        assert_eq!(level_filter(3), LevelFilter::Debug);
        assert_eq!(level_filter(99), LevelFilter::Debug);
    }
}
