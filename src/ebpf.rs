// MYCOFLOW EBPF COUNTER
// LOADS AN EXTERNAL BPF OBJECT AND READS ITS SINGLE-ENTRY STATS MAP
// (KEY 0 -> {u64 PACKETS, u64 BYTES}) ONCE PER TICK. ATTACHMENT IS
// PLAIN tc CLSACT PLUMBING, RETRIED EACH TICK UNTIL IT STICKS.
//
// EVERYTHING HERE IS OPTIONAL: WITH ebpf_enabled OFF, OR WHEN THE
// OBJECT CANNOT BE LOADED, THE COUNTER FIELDS SIMPLY STAY ZERO.

use std::process::Command;

use libbpf_rs::{MapCore, MapFlags, Object, ObjectBuilder};
use log::{info, warn};

use crate::config::Config;

const STATS_MAP: &str = "myco_stats";

// MATCHES THE MAP VALUE LAYOUT IN THE BPF PROGRAM
#[repr(C)]
#[derive(Clone, Copy)]
struct CounterSample {
    packets: u64,
    bytes: u64,
}

pub struct EbpfCounter {
    obj: Option<Object>,
    enabled: bool,
    attach_wanted: bool,
    attached: bool,
    obj_path: String,
    iface: String,
    dir: String,
}

impl EbpfCounter {
    pub fn new(cfg: &Config) -> Self {
        let mut counter = Self {
            obj: None,
            enabled: cfg.ebpf_enabled,
            attach_wanted: cfg.ebpf_enabled && cfg.ebpf_attach,
            attached: false,
            obj_path: cfg.ebpf_obj.clone(),
            iface: cfg.egress_iface.clone(),
            dir: cfg.ebpf_tc_dir.clone(),
        };
        if !counter.enabled {
            return counter;
        }

        match ObjectBuilder::default()
            .open_file(&counter.obj_path)
            .and_then(|open| open.load())
        {
            Ok(obj) => {
                if obj.maps().any(|m| m.name().to_str() == Some(STATS_MAP)) {
                    info!("bpf object loaded: {}", counter.obj_path);
                } else {
                    warn!("bpf object has no {} map: {}", STATS_MAP, counter.obj_path);
                }
                counter.obj = Some(obj);
            }
            Err(e) => {
                warn!("bpf object load failed ({}): {}", counter.obj_path, e);
            }
        }
        counter
    }

    // ENSURE ATTACHMENT, THEN READ THE CUMULATIVE COUNTERS.
    // None WHEN THE COUNTER IS OFF OR THE MAP CANNOT BE READ.
    pub fn tick(&mut self) -> Option<(u64, u64)> {
        if !self.enabled {
            return None;
        }
        if self.attach_wanted && !self.attached {
            self.attach_tc();
        }
        self.read()
    }

    fn read(&self) -> Option<(u64, u64)> {
        let obj = self.obj.as_ref()?;
        let map = obj.maps().find(|m| m.name().to_str() == Some(STATS_MAP))?;
        let key = 0u32.to_ne_bytes();
        let val = map.lookup(&key, MapFlags::ANY).ok()??;
        if val.len() < std::mem::size_of::<CounterSample>() {
            return None;
        }
        let sample: CounterSample =
            unsafe { std::ptr::read_unaligned(val.as_ptr() as *const CounterSample) };
        Some((sample.packets, sample.bytes))
    }

    fn attach_tc(&mut self) {
        if !std::path::Path::new(&self.obj_path).exists() {
            warn!("bpf obj not found: {}", self.obj_path);
            return;
        }

        // CLSACT MAY ALREADY EXIST FROM A PRIOR RUN
        let _ = Command::new("tc")
            .args(["qdisc", "add", "dev", &self.iface, "clsact"])
            .output();

        let ok = Command::new("tc")
            .args([
                "filter", "replace", "dev", &self.iface, &self.dir, "bpf", "da", "obj",
                &self.obj_path, "sec", "tc",
            ])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        if ok {
            self.attached = true;
            info!("bpf tc attach ok ({} {})", self.iface, self.dir);
        } else {
            warn!("bpf tc attach failed on {}", self.iface);
        }
    }

    pub fn shutdown(&mut self) {
        if self.attached {
            let _ = Command::new("tc")
                .args(["filter", "del", "dev", &self.iface, &self.dir])
                .output();
            let _ = Command::new("tc")
                .args(["qdisc", "del", "dev", &self.iface, "clsact"])
                .output();
            self.attached = false;
        }
        self.obj = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disabled_cfg() -> Config {
        Config::default() // ebpf_enabled DEFAULTS OFF
    }

    #[test]
    fn disabled_counter_is_inert() {
        let mut c = EbpfCounter::new(&disabled_cfg());
        assert!(c.tick().is_none());
        c.shutdown(); // NO-OP, MUST NOT PANIC
    }

    #[test]
    fn missing_object_degrades_to_none() {
        let mut cfg = Config::default();
        cfg.ebpf_enabled = true;
        cfg.ebpf_obj = "/nonexistent/mycoflow.bpf.o".into();
        let mut c = EbpfCounter::new(&cfg);
        assert!(c.tick().is_none());
    }

    #[test]
    fn counter_sample_abi_layout() {
        assert_eq!(std::mem::size_of::<CounterSample>(), 16);
    }
}
