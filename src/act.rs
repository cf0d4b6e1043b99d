// MYCOFLOW ACTUATOR
// TRANSLATES POLICY INTO tc/ip COMMANDS. ALL ACTUATION IS CHILD-PROCESS
// DRIVEN; NO KERNEL HANDLES ARE HELD ACROSS CALLS.
//
// INTERFACE NAMES ARE THE ONLY UNTRUSTED INPUT AND ARE VALIDATED
// AGAINST ^[A-Za-z0-9._-]{1,15}$ BEFORE THEY REACH A COMMAND LINE.
// BANDWIDTH CHANGES TRY `qdisc change` FIRST (PRESERVES QUEUE STATE)
// AND FALL BACK TO `qdisc replace`.

use std::process::Command;
use std::sync::OnceLock;

use log::{debug, info, warn};
use regex::Regex;

use crate::control::Policy;
use crate::persona::Persona;

static IFACE_RE: OnceLock<Regex> = OnceLock::new();

pub fn iface_valid(name: &str) -> bool {
    IFACE_RE
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]{1,15}$").unwrap())
        .is_match(name)
}

// CAKE TIN PARAMETERS PER PERSONA: (AQM TARGET MS, INTERVAL MS)
pub fn tin_params(persona: Persona) -> (u32, u32) {
    match persona {
        Persona::Interactive => (5, 50),
        Persona::Bulk => (20, 200),
        Persona::Unknown => (5, 100),
    }
}

fn exec(prog: &str, args: &[String]) -> bool {
    debug!("exec: {} {}", prog, args.join(" "));
    match Command::new(prog).args(args).output() {
        Ok(out) => out.status.success(),
        Err(e) => {
            warn!("{} spawn failed: {}", prog, e);
            false
        }
    }
}

// LIKE exec BUT EEXIST-STYLE FAILURES FROM PRIOR STATE ARE FINE
fn exec_tolerant(prog: &str, args: &[String]) {
    debug!("exec (tolerant): {} {}", prog, args.join(" "));
    if let Err(e) = Command::new(prog).args(args).output() {
        warn!("{} spawn failed: {}", prog, e);
    }
}

fn strv(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

// PROGRAM THE EGRESS CAKE QDISC TO THE POLICY BANDWIDTH
pub fn apply_policy(iface: &str, policy: &Policy, no_tc: bool, force_fail: bool) -> bool {
    if !iface_valid(iface) {
        warn!("invalid interface name rejected: {:?}", iface);
        return false;
    }
    if force_fail {
        warn!("forced actuation failure");
        return false;
    }
    if no_tc {
        info!(
            "tc disabled, would set {} to {} kbit",
            iface, policy.bandwidth_kbit
        );
        return true;
    }

    let bw = format!("{}kbit", policy.bandwidth_kbit);
    let change = strv(&[
        "qdisc", "change", "dev", iface, "root", "cake", "bandwidth", &bw,
    ]);
    let replace = strv(&[
        "qdisc", "replace", "dev", iface, "root", "cake", "bandwidth", &bw,
    ]);
    let ok = exec("tc", &change) || exec("tc", &replace);
    if ok {
        info!("applied cake bandwidth {} kbit on {}", policy.bandwidth_kbit, iface);
    } else {
        warn!("tc call failed for {}", iface);
    }
    ok
}

// RETUNE AQM TARGET/INTERVAL FOR THE COMMITTED PERSONA.
// CALLED ON PERSONA TRANSITIONS ONLY; NOT SUBJECT TO ACTION PACING.
pub fn apply_persona_tin(
    iface: &str,
    persona: Persona,
    bandwidth_kbit: i64,
    no_tc: bool,
    force_fail: bool,
) -> bool {
    if !iface_valid(iface) {
        warn!("invalid interface name rejected: {:?}", iface);
        return false;
    }
    if force_fail {
        warn!("forced actuation failure");
        return false;
    }
    if no_tc {
        info!(
            "tc disabled, would tune {} for {} persona",
            iface,
            persona.label()
        );
        return true;
    }

    let (target, interval) = tin_params(persona);
    let bw = format!("{}kbit", bandwidth_kbit);
    let target = format!("{}ms", target);
    let interval = format!("{}ms", interval);
    let tail = [
        "root", "cake", "bandwidth", &bw, "diffserv4", "target", &target, "interval", &interval,
    ];
    let mut change = strv(&["qdisc", "change", "dev", iface]);
    change.extend(strv(&tail));
    let mut replace = strv(&["qdisc", "replace", "dev", iface]);
    replace.extend(strv(&tail));

    let ok = exec("tc", &change) || exec("tc", &replace);
    if ok {
        info!("applied {} tin on {}", persona.label(), iface);
    } else {
        warn!("persona tin failed for {}", iface);
    }
    ok
}

// CREATE THE IFB DEVICE AND REDIRECT ALL INGRESS FROM wan INTO IT,
// THEN SHAPE THE IFB. PRIOR STATE (DEVICE/QDISC ALREADY PRESENT) IS
// TOLERATED SO RESTARTS ARE IDEMPOTENT.
pub fn setup_ingress_ifb(
    wan: &str,
    ifb: &str,
    bandwidth_kbit: i64,
    no_tc: bool,
    force_fail: bool,
) -> bool {
    if !iface_valid(wan) || !iface_valid(ifb) {
        warn!("invalid interface name rejected: {:?}/{:?}", wan, ifb);
        return false;
    }
    if force_fail {
        warn!("forced actuation failure");
        return false;
    }
    if no_tc {
        info!("tc disabled, would set up ingress ifb {} for {}", ifb, wan);
        return true;
    }

    exec_tolerant("ip", &strv(&["link", "add", ifb, "type", "ifb"]));
    if !exec("ip", &strv(&["link", "set", ifb, "up"])) {
        warn!("ifb {} bring-up failed", ifb);
        return false;
    }
    exec_tolerant("tc", &strv(&["qdisc", "add", "dev", wan, "handle", "ffff:", "ingress"]));
    exec_tolerant(
        "tc",
        &strv(&[
            "filter", "add", "dev", wan, "parent", "ffff:", "protocol", "all", "u32", "match",
            "u32", "0", "0", "action", "mirred", "egress", "redirect", "dev", ifb,
        ]),
    );

    let bw = format!("{}kbit", bandwidth_kbit);
    let ok = exec(
        "tc",
        &strv(&["qdisc", "replace", "dev", ifb, "root", "cake", "bandwidth", &bw]),
    );
    if ok {
        info!("ingress shaping via {} at {} kbit", ifb, bandwidth_kbit);
    } else {
        warn!("ingress qdisc install failed on {}", ifb);
    }
    ok
}

// SAME TIN PARAMETERS AS EGRESS, APPLIED TO THE IFB DEVICE
pub fn apply_ingress_policy(
    ifb: &str,
    persona: Persona,
    bandwidth_kbit: i64,
    no_tc: bool,
    force_fail: bool,
) -> bool {
    apply_persona_tin(ifb, persona, bandwidth_kbit, no_tc, force_fail)
}

pub fn teardown_ingress_ifb(wan: &str, ifb: &str, no_tc: bool) {
    if !iface_valid(wan) || !iface_valid(ifb) {
        return;
    }
    if no_tc {
        info!("tc disabled, would tear down ingress ifb {}", ifb);
        return;
    }
    exec_tolerant("tc", &strv(&["filter", "del", "dev", wan, "parent", "ffff:"]));
    exec_tolerant("tc", &strv(&["qdisc", "del", "dev", wan, "ingress"]));
    exec_tolerant("ip", &strv(&["link", "del", ifb]));
}
