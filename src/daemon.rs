// MYCOFLOW LOOP DRIVER
// ONE TICK = SENSE -> INFER -> DECIDE -> ACT -> STABILIZE.
//
// OWNS EVERY STAGE'S STATE. THE ONLY SHARED OBJECT IS THE SNAPSHOT
// (state::SharedState); THE IPC THREAD FEEDS OPERATOR INPUTS BACK IN
// THROUGH IT AND THE LOOP FOLDS THEM IN AT THE TOP OF THE NEXT TICK.
//
// STOP/RELOAD ARE SIGNAL-SET ATOMIC FLAGS, POLLED ONCE PER TICK.
// NOTHING IN THE LOOP BLOCKS UNBOUNDED: PROBES TIME OUT, ACTUATION IS
// A BOUNDED CHILD PROCESS, AND SAFE MODE TURNS ACTUATION OFF ENTIRELY.

use std::ffi::CStr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use log::{debug, info, warn};

use crate::act;
use crate::config::{self, Config};
use crate::control::ControlState;
use crate::ebpf::EbpfCounter;
use crate::ewma::Ewma;
use crate::flow::{FlowTable, ELEPHANT_RATIO, FLOW_MAX_AGE_S};
use crate::ipc;
use crate::persona::{Persona, PersonaState};
use crate::sense::{self, Sampler};
use crate::state::{self, ActParams, SharedState};

pub fn now_monotonic_s() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

// COOLDOWN AND RATE LIMIT COMPOSE: THE STRICTER ONE WINS
fn min_action_interval(cfg: &Config) -> f64 {
    let mut interval = cfg.action_cooldown_s;
    if cfg.action_rate_limit > 0.0 {
        interval = interval.max(1.0 / cfg.action_rate_limit);
    }
    interval
}

fn log_banner() {
    info!("mycoflow daemon starting (v{})", env!("CARGO_PKG_VERSION"));
    let mut u: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut u) } == 0 {
        let sysname = unsafe { CStr::from_ptr(u.sysname.as_ptr()) };
        let machine = unsafe { CStr::from_ptr(u.machine.as_ptr()) };
        info!(
            "system: {} {}",
            sysname.to_string_lossy(),
            machine.to_string_lossy()
        );
    }
}

pub fn run(
    mut cfg: Config,
    config_path: Option<PathBuf>,
    stop: &AtomicBool,
    reload: &AtomicBool,
) -> Result<()> {
    log_banner();
    info!(
        "egress {} envelope [{},{}] kbit, start {} kbit",
        cfg.egress_iface, cfg.min_bandwidth_kbit, cfg.max_bandwidth_kbit, cfg.bandwidth_kbit
    );

    let mut sampler = Sampler::new();
    let mut flows = FlowTable::new();
    let mut persona_state = PersonaState::new();
    let mut ctl = ControlState::new(&cfg);
    let mut ebpf = EbpfCounter::new(&cfg);
    let mut ewma_rtt = Ewma::new();
    let mut ewma_jitter = Ewma::new();

    let state = Arc::new(SharedState::new(&cfg, ctl.current));
    ipc::start(Arc::clone(&state))?;

    let mut interval_s = 1.0 / cfg.sample_hz;
    let mut min_action = min_action_interval(&cfg);

    info!("baseline capture: {} samples", cfg.baseline_samples);
    let mut baseline = sampler.capture_baseline(
        &cfg.egress_iface,
        &cfg.probe_host,
        cfg.baseline_samples,
        interval_s,
        cfg.dummy_metrics,
    );
    info!(
        "baseline rtt={:.2}ms jitter={:.2}ms",
        baseline.rtt_ms, baseline.jitter_ms
    );

    if cfg.ingress_enabled
        && !act::setup_ingress_ifb(
            &cfg.egress_iface,
            &cfg.ingress_iface,
            ctl.current.ingress_bw_kbit,
            cfg.no_tc,
            cfg.force_act_fail,
        )
    {
        warn!("ingress setup failed, ingress shaping disabled");
        ctl.current.ingress_bw_kbit = 0;
    }

    let mut last_action_ts: f64 = 0.0;
    let mut last_persona = Persona::Unknown;
    let mut prev_ebpf_pkts: u64 = 0;
    let mut cycle: u64 = 0;

    while !stop.load(Ordering::Relaxed) {
        if reload.swap(false, Ordering::Relaxed) {
            match config::load(config_path.as_deref()) {
                Ok(new_cfg) => {
                    cfg = new_cfg;
                    log::set_max_level(config::level_filter(cfg.log_level));
                    interval_s = 1.0 / cfg.sample_hz;
                    min_action = min_action_interval(&cfg);
                    state.set_act_params(ActParams::from_config(&cfg));
                    info!("baseline capture: {} samples", cfg.baseline_samples);
                    baseline = sampler.capture_baseline(
                        &cfg.egress_iface,
                        &cfg.probe_host,
                        cfg.baseline_samples,
                        interval_s,
                        cfg.dummy_metrics,
                    );
                    // RELOAD IS A FRESH START: THE FILTERS RE-PRIME ON
                    // THE NEXT SAMPLE, SAME AS THE BASELINE ABOVE
                    ewma_rtt.reset();
                    ewma_jitter.reset();
                    info!("config reloaded");
                }
                Err(e) => warn!("config reload failed, keeping previous: {:#}", e),
            }
        }

        if !cfg.enabled {
            info!("disabled, sleeping");
            std::thread::sleep(Duration::from_secs_f64(interval_s));
            continue;
        }

        // SENSE
        let mut metrics = sampler.sample(
            &cfg.egress_iface,
            &cfg.probe_host,
            interval_s,
            cfg.dummy_metrics,
        );
        let now = now_monotonic_s();

        if let Some((pkts, bytes)) = ebpf.tick() {
            metrics.ebpf_rx_pkts = pkts;
            metrics.ebpf_rx_bytes = bytes;
            if prev_ebpf_pkts != 0 {
                metrics.ebpf_pkt_rate = pkts.saturating_sub(prev_ebpf_pkts) as f64 / interval_s;
            }
            prev_ebpf_pkts = pkts;
        }

        if flows.populate_from_conntrack(now).is_none() {
            debug!("conntrack unavailable, flow signals zeroed");
        }
        flows.evict_stale(now, FLOW_MAX_AGE_S);
        metrics.active_flows = flows.active_count();
        metrics.elephant_flow = flows.has_elephant(ELEPHANT_RATIO);

        // EWMA (RAW VALUES KEPT FOR THE LOG LINE)
        let raw_rtt = metrics.rtt_ms;
        let raw_jitter = metrics.jitter_ms;
        metrics.rtt_ms = ewma_rtt.update(metrics.rtt_ms, cfg.ewma_alpha);
        metrics.jitter_ms = ewma_jitter.update(metrics.jitter_ms, cfg.ewma_alpha);

        // INFER (OPERATOR OVERRIDE REPLACES THE COMMITTED PERSONA,
        // HYSTERESIS KEEPS OBSERVING THE REAL SIGNALS)
        let (override_persona, requested_bw) = state.take_inputs();
        if let Some(bw) = requested_bw {
            ctl.adopt_external(bw);
        }
        let observed = persona_state.update(&metrics);
        let persona = override_persona.unwrap_or(observed);

        // DECIDE
        let decision = ctl.decide(&cfg, &metrics, &baseline, persona, now);

        state.publish(
            &metrics,
            &baseline,
            ctl.current,
            persona,
            ctl.safe_mode,
            decision.reason,
        );
        state.dump_status_file();
        state::append_metric_line(&cfg.metric_file, &metrics, persona, decision.reason);

        info!(
            "rtt={:.2}(raw={:.2})ms jitter={:.2}(raw={:.2})ms tx={:.0}bps rx={:.0}bps cpu={:.1}% flows={} persona={} bw={}kbit reason={}",
            metrics.rtt_ms,
            raw_rtt,
            metrics.jitter_ms,
            raw_jitter,
            metrics.tx_bps,
            metrics.rx_bps,
            metrics.cpu_pct,
            metrics.active_flows,
            persona.label(),
            ctl.current.bandwidth_kbit,
            decision.reason
        );

        // ACT
        if ctl.safe_mode {
            warn!("safe-mode active, skipping actuation");
        } else {
            if persona != last_persona {
                act::apply_persona_tin(
                    &cfg.egress_iface,
                    persona,
                    ctl.current.bandwidth_kbit,
                    cfg.no_tc,
                    cfg.force_act_fail,
                );
                if ctl.current.ingress_bw_kbit > 0 {
                    act::apply_ingress_policy(
                        &cfg.ingress_iface,
                        persona,
                        ctl.current.ingress_bw_kbit,
                        cfg.no_tc,
                        cfg.force_act_fail,
                    );
                }
                last_persona = persona;
            }

            if decision.change {
                if now - last_action_ts >= min_action {
                    let mut ok = act::apply_policy(
                        &cfg.egress_iface,
                        &decision.desired,
                        cfg.no_tc,
                        cfg.force_act_fail,
                    );
                    if ok && decision.desired.ingress_bw_kbit > 0 {
                        ok = act::apply_ingress_policy(
                            &cfg.ingress_iface,
                            persona,
                            decision.desired.ingress_bw_kbit,
                            cfg.no_tc,
                            cfg.force_act_fail,
                        );
                    }
                    ctl.on_action_result(ok);
                    if ok {
                        ctl.commit(decision.desired);
                        last_action_ts = now;
                    }
                } else {
                    debug!("action skipped (cooldown)");
                }
            }
        }

        // STABILIZE
        cycle += 1;
        if cycle % cfg.baseline_update_interval == 0 {
            sense::drift_baseline(&mut baseline, &metrics, cfg.baseline_decay);
        }
        std::thread::sleep(Duration::from_secs_f64(interval_s));
    }

    info!("shutdown complete");
    if cfg.ingress_enabled {
        act::teardown_ingress_ifb(&cfg.egress_iface, &cfg.ingress_iface, cfg.no_tc);
    }
    ebpf.shutdown();
    let _ = std::fs::remove_file(ipc::socket_path());
    Ok(())
}
