// MYCOFLOW DEPENDENCY CHECK
// VERIFIES THE EXTERNAL TOOLS THE ACTUATOR AND SAMPLER SHELL OUT TO,
// PLUS KERNEL SUPPORT FOR CAKE AND IFB.

use std::io::Read;
use std::process::Command;

use anyhow::Result;

fn check_tool(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn check_kernel_option(config: &str, option: &str) -> bool {
    // =y OR =m BOTH WORK; MODULES AUTOLOAD ON FIRST tc USE
    config.contains(&format!("{}=y", option)) || config.contains(&format!("{}=m", option))
}

fn check_kernel_config() -> bool {
    let file = match std::fs::File::open("/proc/config.gz") {
        Ok(f) => f,
        Err(_) => {
            println!("  /proc/config.gz       NOT FOUND (SKIPPED)");
            return true;
        }
    };
    let mut decoder = flate2::read::GzDecoder::new(file);
    let mut config = String::new();
    if decoder.read_to_string(&mut config).is_err() {
        println!("  /proc/config.gz       UNREADABLE (SKIPPED)");
        return true;
    }

    let mut ok = true;
    for option in ["CONFIG_NET_SCH_CAKE", "CONFIG_IFB", "CONFIG_NF_CONNTRACK"] {
        if check_kernel_option(&config, option) {
            println!("  {:<22}OK", option);
        } else {
            println!("  {:<22}NOT FOUND", option);
            ok = false;
        }
    }
    ok
}

pub fn run_check() -> Result<()> {
    println!("MYCOFLOW DEPENDENCY CHECK");
    println!();

    let mut ok = true;
    let tools = ["tc", "ip", "ping", "conntrack"];
    for tool in &tools {
        if check_tool(tool) {
            println!("  {:<24}OK", tool);
        } else {
            println!("  {:<24}MISSING", tool);
            ok = false;
        }
    }
    println!();

    println!("KERNEL CONFIG:");
    if !check_kernel_config() {
        ok = false;
    }
    println!();

    if std::fs::metadata("/proc/net/nf_conntrack").is_ok() {
        println!("  /proc/net/nf_conntrack READABLE");
    } else {
        println!("  /proc/net/nf_conntrack NOT READABLE (flow signals degrade to zero)");
    }
    println!();

    if ok {
        println!("ALL CHECKS PASSED");
    } else {
        println!("SOME CHECKS FAILED");
        std::process::exit(1);
    }

    Ok(())
}
