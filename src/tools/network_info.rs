use std::time::Duration;

use serde_json::{Map, Value, json};
use sysinfo::{Networks, System};

use super::{ToolDescriptor, ToolOutput};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(15);

/// (result key, program, args) probes for the running OS.
pub fn platform_commands(os: &str) -> Vec<(&'static str, &'static str, Vec<&'static str>)> {
    match os {
        "linux" => vec![
            ("ip_addr", "ip", vec!["addr"]),
            ("ip_route", "ip", vec!["route"]),
            ("listening_ports", "ss", vec!["-tuln"]),
        ],
        "macos" => vec![
            ("interfaces", "ifconfig", vec![]),
            ("routes", "netstat", vec!["-rn"]),
        ],
        "windows" => vec![
            ("ipconfig", "ipconfig", vec!["/all"]),
            (
                "interface_ipv4_config",
                "netsh",
                vec!["interface", "ipv4", "show", "config"],
            ),
        ],
        _ => vec![("netstat", "netstat", vec!["-an"])],
    }
}

async fn run_command(program: &str, args: &[&str]) -> Value {
    let rendered = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");
    let child = tokio::process::Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output();

    match tokio::time::timeout(COMMAND_TIMEOUT, child).await {
        Err(_) => json!({ "error": format!("command '{rendered}' timed out") }),
        Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            json!({ "error": format!("command '{program}' not found") })
        }
        Ok(Err(err)) => json!({ "error": format!("error running command '{rendered}': {err}") }),
        Ok(Ok(output)) if !output.status.success() => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            json!({
                "error": format!(
                    "command '{rendered}' failed with {}: {}",
                    output.status,
                    stderr.trim()
                )
            })
        }
        Ok(Ok(output)) => {
            let stdout = String::from_utf8_lossy(&output.stdout);
            json!({ "output": stdout.trim().lines().collect::<Vec<_>>() })
        }
    }
}

fn interface_stats() -> Value {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces = Map::new();
    for (name, data) in &networks {
        interfaces.insert(
            name.clone(),
            json!({
                "mac_address": data.mac_address().to_string(),
                "total_received_bytes": data.total_received(),
                "total_transmitted_bytes": data.total_transmitted(),
            }),
        );
    }
    Value::Object(interfaces)
}

async fn dns_servers() -> Vec<String> {
    let Ok(content) = tokio::fs::read_to_string("/etc/resolv.conf").await else {
        return Vec::new();
    };
    parse_nameservers(&content)
}

pub fn parse_nameservers(resolv_conf: &str) -> Vec<String> {
    let mut servers = Vec::new();
    for line in resolv_conf.lines() {
        let mut parts = line.split_whitespace();
        if parts.next() == Some("nameserver")
            && let Some(server) = parts.next()
            && !servers.iter().any(|existing| existing == server)
        {
            servers.push(server.to_string());
        }
    }
    servers
}

pub async fn collect_network_report() -> Value {
    let os = std::env::consts::OS;
    let mut advanced = Map::new();
    for (key, program, args) in platform_commands(os) {
        advanced.insert(key.to_string(), run_command(program, &args).await);
    }

    let interfaces = tokio::task::spawn_blocking(interface_stats)
        .await
        .unwrap_or_else(|err| json!({ "error": format!("interface probe failed: {err}") }));

    let dns = if os == "linux" {
        dns_servers().await
    } else {
        Vec::new()
    };

    json!({
        "hostname": System::host_name(),
        "os": os,
        "interfaces": interfaces,
        "dns_servers": dns,
        "advanced_info": advanced,
    })
}

pub fn network_info_tool() -> ToolDescriptor {
    ToolDescriptor::from_fn(
        "network_info",
        "Gathers network details for this machine: hostname, interfaces, DNS servers, and the \
         output of the platform's standard network commands.",
        |_params, _state| async { ToolOutput::ok(collect_network_report().await) },
    )
}
