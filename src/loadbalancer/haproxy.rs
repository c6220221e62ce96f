//! haproxy configuration rendering
//!
//! One fixed frontend on the control plane port and one backend line per
//! discovered control plane instance. The file is overwritten in place and
//! followed by a reload, so rendering must be deterministic.

use std::collections::BTreeMap;
use std::fmt::Write;

/// One backend server line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendServer {
    pub address: String,
    pub weight: u32,
}

/// Ephemeral view of the load balancer configuration, rebuilt from instance
/// discovery on every reconfigure.
#[derive(Debug, Clone, Default)]
pub struct ConfigData {
    pub frontend_port: String,
    pub backend_port: String,
    /// Backend servers keyed by instance name; BTreeMap keeps the rendered
    /// output stable across reconciles.
    pub servers: BTreeMap<String, BackendServer>,
}

fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Render the haproxy configuration file.
pub fn render(config: &ConfigData) -> String {
    let mut out = String::with_capacity(512);
    out.push_str(concat!(
        "global\n",
        "  log /dev/log local0\n",
        "  log /dev/log local1 notice\n",
        "  daemon\n",
        "\n",
        "defaults\n",
        "  log global\n",
        "  mode tcp\n",
        "  option dontlognull\n",
        "  timeout connect 5000\n",
        "  timeout client 50000\n",
        "  timeout server 50000\n",
        "\n",
    ));

    let _ = writeln!(out, "frontend control-plane");
    let _ = writeln!(out, "  bind *:{}", config.frontend_port);
    let _ = writeln!(out, "  default_backend kube-apiservers");
    out.push('\n');

    let _ = writeln!(out, "backend kube-apiservers");
    let _ = writeln!(out, "  option httpchk GET /healthz");
    for (name, server) in &config.servers {
        let _ = writeln!(
            out,
            "  server {} {} check check-ssl verify none weight {}",
            name,
            join_host_port(&server.address, &config.backend_port),
            server.weight,
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConfigData {
        ConfigData {
            frontend_port: "6443".to_string(),
            backend_port: "6443".to_string(),
            servers: BTreeMap::from([
                (
                    "c1-control-plane-x7k2p".to_string(),
                    BackendServer {
                        address: "10.0.0.5".to_string(),
                        weight: 100,
                    },
                ),
                (
                    "c1-control-plane-b3nn4".to_string(),
                    BackendServer {
                        address: "10.0.0.7".to_string(),
                        weight: 100,
                    },
                ),
            ]),
        }
    }

    #[test]
    fn test_render_contains_frontend_and_backends() {
        let rendered = render(&config());
        assert!(rendered.contains("bind *:6443"));
        assert!(rendered
            .contains("server c1-control-plane-b3nn4 10.0.0.7:6443 check check-ssl verify none weight 100"));
        assert!(rendered
            .contains("server c1-control-plane-x7k2p 10.0.0.5:6443 check check-ssl verify none weight 100"));
    }

    #[test]
    fn test_render_is_deterministic() {
        assert_eq!(render(&config()), render(&config()));
    }

    #[test]
    fn test_render_empty_backends() {
        let rendered = render(&ConfigData {
            frontend_port: "6443".to_string(),
            backend_port: "6443".to_string(),
            servers: BTreeMap::new(),
        });
        assert!(rendered.contains("backend kube-apiservers"));
        assert!(!rendered.contains("  server "));
    }

    #[test]
    fn test_join_host_port_ipv6() {
        assert_eq!(join_host_port("10.0.0.5", "6443"), "10.0.0.5:6443");
        assert_eq!(join_host_port("fd42::5", "6443"), "[fd42::5]:6443");
    }
}
