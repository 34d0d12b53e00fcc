//! Bridge network driver. The kernel is driven through ip(8) and
//! iptables(8); every invocation is checked and surfaced with its stderr on
//! failure.
use std::net::Ipv4Addr;
use std::process::Command;
use std::str::FromStr;

use super::{Cidr, Endpoint, Network, NetworkError};

type Result<T> = std::result::Result<T, NetworkError>;

pub struct BridgeDriver;

impl BridgeDriver {
    pub const NAME: &'static str = "bridge";

    /// Creates the bridge, assigns it the gateway address, brings it up and
    /// installs the SNAT masquerade rule for outbound traffic.
    pub fn create(bridge_name: &str, ip_range: &Cidr, gateway: Ipv4Addr) -> Result<()> {
        run(Command::new("ip").args(["link", "add", bridge_name, "type", "bridge"]))?;
        let rollback_link = |err| {
            let _ = run(Command::new("ip").args(["link", "delete", bridge_name]));
            err
        };
        run(Command::new("ip").args([
            "addr",
            "add",
            &format!("{}/{}", gateway, ip_range.prefix()),
            "dev",
            bridge_name,
        ]))
        .map_err(rollback_link)?;
        run(Command::new("ip").args(["link", "set", bridge_name, "up"])).map_err(rollback_link)?;
        run(Command::new("iptables")
            .args(["-t", "nat", "-A", "POSTROUTING"])
            .args(snat_rule_spec(bridge_name, ip_range)))
        .map_err(rollback_link)?;
        Ok(())
    }

    /// Removes the masquerade rule, then the bridge itself.
    pub fn delete(bridge_name: &str, ip_range: &Cidr) -> Result<()> {
        run(Command::new("iptables")
            .args(["-t", "nat", "-D", "POSTROUTING"])
            .args(snat_rule_spec(bridge_name, ip_range)))?;
        run(Command::new("ip").args(["link", "delete", bridge_name]))?;
        Ok(())
    }

    /// Reads the bridge's assigned address back and reconstructs the range
    /// it serves.
    pub fn load(bridge_name: &str) -> Result<Cidr> {
        let output = run(Command::new("ip").args(["-o", "-4", "addr", "show", "dev", bridge_name]))?;
        // a line looks like: "7: cap0    inet 10.20.0.1/24 brd ... scope global cap0"
        for line in output.lines() {
            let mut fields = line.split_whitespace();
            while let Some(field) = fields.next() {
                if field == "inet" {
                    let address = fields
                        .next()
                        .ok_or_else(|| NetworkError::ParseInterface(bridge_name.to_owned()))?;
                    return Cidr::from_str(address);
                }
            }
        }
        Err(NetworkError::ParseInterface(bridge_name.to_owned()))
    }

    /// Plumbs an endpoint: a veth pair with the host end enslaved to the
    /// bridge and the peer configured inside the init process's network
    /// namespace, plus one DNAT rule per port mapping.
    pub fn connect(network: &Network, endpoint: &Endpoint, init_pid: i32) -> Result<()> {
        let (veth_host, veth_peer) = veth_names(&endpoint.id);
        let pid = init_pid.to_string();
        let gateway = network.ip_range.first_host().to_string();
        let address = format!("{}/{}", endpoint.ip, network.ip_range.prefix());

        run(Command::new("ip").args([
            "link", "add", &veth_host, "type", "veth", "peer", "name", &veth_peer,
        ]))?;
        let rollback_veth = |err| {
            let _ = run(Command::new("ip").args(["link", "delete", &veth_host]));
            err
        };
        run(Command::new("ip").args(["link", "set", &veth_host, "master", &network.name]))
            .map_err(rollback_veth)?;
        run(Command::new("ip").args(["link", "set", &veth_host, "up"])).map_err(rollback_veth)?;
        run(Command::new("ip").args(["link", "set", &veth_peer, "netns", &pid]))
            .map_err(rollback_veth)?;

        // the peer now only exists inside the namespace; configure it there
        in_netns(&pid, &["ip", "link", "set", "lo", "up"]).map_err(rollback_veth)?;
        in_netns(&pid, &["ip", "addr", "add", &address, "dev", &veth_peer])
            .map_err(rollback_veth)?;
        in_netns(&pid, &["ip", "link", "set", &veth_peer, "up"]).map_err(rollback_veth)?;
        in_netns(&pid, &["ip", "route", "add", "default", "via", &gateway])
            .map_err(rollback_veth)?;

        for mapping in &endpoint.port_mappings {
            run(Command::new("iptables")
                .args(["-t", "nat", "-A", "PREROUTING"])
                .args(dnat_rule_spec(endpoint, mapping)))
            .map_err(rollback_veth)?;
        }
        Ok(())
    }

    /// Reverses `connect`. Rule or link removal failures are logged and
    /// skipped so one stale rule cannot pin the whole endpoint.
    pub fn disconnect(_network: &Network, endpoint: &Endpoint) -> Result<()> {
        for mapping in &endpoint.port_mappings {
            if let Err(err) = run(Command::new("iptables")
                .args(["-t", "nat", "-D", "PREROUTING"])
                .args(dnat_rule_spec(endpoint, mapping)))
            {
                tracing::warn!(%err, "failed to delete port mapping rule");
            }
        }
        let (veth_host, _) = veth_names(&endpoint.id);
        if let Err(err) = run(Command::new("ip").args(["link", "delete", &veth_host])) {
            tracing::warn!(%err, "failed to delete veth pair");
        }
        Ok(())
    }
}

// Linux interface names cap at 15 characters, so only a prefix of the
// endpoint id fits.
fn veth_names(endpoint_id: &str) -> (String, String) {
    let short: String = endpoint_id.chars().take(8).collect();
    (format!("veth-{short}"), format!("ceth-{short}"))
}

fn snat_rule_spec(bridge_name: &str, ip_range: &Cidr) -> Vec<String> {
    vec![
        "-s".to_owned(),
        ip_range.to_string(),
        "-o".to_owned(),
        bridge_name.to_owned(),
        "-j".to_owned(),
        "MASQUERADE".to_owned(),
    ]
}

fn dnat_rule_spec(endpoint: &Endpoint, mapping: &super::PortMapping) -> Vec<String> {
    vec![
        "-p".to_owned(),
        "tcp".to_owned(),
        "--dport".to_owned(),
        mapping.host_port.to_string(),
        "-j".to_owned(),
        "DNAT".to_owned(),
        "--to-destination".to_owned(),
        format!("{}:{}", endpoint.ip, mapping.container_port),
    ]
}

fn in_netns(pid: &str, args: &[&str]) -> Result<String> {
    run(Command::new("nsenter").args(["-t", pid, "-n", "--"]).args(args))
}

fn run(command: &mut Command) -> Result<String> {
    let rendered = format!("{command:?}");
    tracing::debug!(command = %rendered, "executing");
    let output = command.output().map_err(NetworkError::Io)?;
    if !output.status.success() {
        return Err(NetworkError::Command {
            command: rendered,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_veth_names_fit_interface_limit() {
        let (host, peer) = veth_names("0123456789abcdef");
        assert!(host.len() <= 15, "{host}");
        assert!(peer.len() <= 15, "{peer}");
        assert_ne!(host, peer);
    }

    #[test]
    fn test_snat_rule_spec() {
        let range = Cidr::from_str("10.20.0.0/16").unwrap();
        assert_eq!(
            snat_rule_spec("cap0", &range),
            vec!["-s", "10.20.0.0/16", "-o", "cap0", "-j", "MASQUERADE"]
        );
    }

    #[test]
    fn test_dnat_rule_spec() {
        let endpoint = Endpoint {
            id: "e1".into(),
            network: "cap0".into(),
            ip: std::net::Ipv4Addr::new(10, 20, 0, 2),
            port_mappings: vec![],
        };
        let mapping = super::super::PortMapping {
            host_port: 8080,
            container_port: 80,
        };
        assert_eq!(
            dnat_rule_spec(&endpoint, &mapping),
            vec![
                "-p",
                "tcp",
                "--dport",
                "8080",
                "-j",
                "DNAT",
                "--to-destination",
                "10.20.0.2:80"
            ]
        );
    }
}
