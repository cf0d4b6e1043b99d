// MYCOFLOW IPC SURFACE
// NEWLINE-DELIMITED JSON OVER A UNIX SOCKET, ONE REQUEST PER LINE:
//   {"method": "policy_set", "args": {"bandwidth_kbit": 15000}}
//   -> {"ok": true, "result": {...}} | {"ok": false, "error": "..."}
//
// SERVED FROM ITS OWN THREAD. EVERY HANDLER RUNS TO COMPLETION AGAINST
// THE SHARED-STATE MUTEX; REQUESTS ARE LOW-RATE AND BOUNDED, SO THE
// LOOP THREAD NEVER WAITS LONG.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::persona::Persona;
use crate::state::SharedState;

pub const DEFAULT_SOCKET: &str = "/tmp/myco_ipc.sock";

pub fn socket_path() -> String {
    std::env::var("MYCOFLOW_IPC_SOCK").unwrap_or_else(|_| DEFAULT_SOCKET.into())
}

pub fn start(state: Arc<SharedState>) -> Result<()> {
    let path = socket_path();
    let _ = std::fs::remove_file(&path); // STALE SOCKET FROM A PRIOR RUN
    let listener = UnixListener::bind(&path).with_context(|| format!("bind ipc socket {}", path))?;
    info!("ipc listening on {}", path);

    std::thread::Builder::new()
        .name("myco-ipc".into())
        .spawn(move || {
            for conn in listener.incoming() {
                match conn {
                    Ok(stream) => {
                        if let Err(e) = serve_connection(stream, &state) {
                            debug!("ipc connection ended: {}", e);
                        }
                    }
                    Err(e) => warn!("ipc accept failed: {}", e),
                }
            }
        })
        .context("spawn ipc thread")?;
    Ok(())
}

fn serve_connection(stream: UnixStream, state: &SharedState) -> std::io::Result<()> {
    let mut writer = stream.try_clone()?;
    let reader = BufReader::new(stream);
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(req) => {
                let method = req["method"].as_str().unwrap_or("");
                match dispatch(state, method, &req["args"]) {
                    Ok(result) => json!({ "ok": true, "result": result }),
                    Err(e) => json!({ "ok": false, "error": e }),
                }
            }
            Err(e) => json!({ "ok": false, "error": format!("bad request: {}", e) }),
        };
        writeln!(writer, "{}", response)?;
    }
    Ok(())
}

pub fn dispatch(state: &SharedState, method: &str, args: &Value) -> Result<Value, String> {
    match method {
        "status" => Ok(state.status_value()),
        "policy_get" => Ok(state.policy_value()),
        "policy_set" => {
            let bw = args["bandwidth_kbit"]
                .as_i64()
                .ok_or("bandwidth_kbit required")?;
            state.set_policy(bw, "ubus-set")
        }
        "policy_boost" => state.nudge_policy(args["step"].as_i64(), true),
        "policy_throttle" => state.nudge_policy(args["step"].as_i64(), false),
        "persona_list" => {
            let personas: Vec<&str> = [Persona::Unknown, Persona::Interactive, Persona::Bulk]
                .iter()
                .map(|p| p.label())
                .collect();
            Ok(json!({
                "personas": personas,
                "override": state.persona_override().map(Persona::label),
            }))
        }
        "persona_add" => {
            let name = args["name"].as_str().ok_or("name required")?;
            let persona = Persona::from_name(name).ok_or("unknown persona")?;
            state.set_persona_override(persona);
            Ok(json!({ "override": persona.label() }))
        }
        "persona_delete" => {
            state.clear_persona_override();
            Ok(json!({ "override": Value::Null }))
        }
        other => Err(format!("unknown method: {}", other)),
    }
}
