//! The proxy route table: session clusters to upstream addresses.

use std::collections::HashMap;

use dashmap::DashMap;
use log::info;
use serde::{Deserialize, Serialize};

/// A routable port on a registered cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteInfo {
    pub container_port: u16,
    pub url: String,
}

/// Upstream address a route resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    pub host: String,
    pub port: u16,
}

/// Container entry passed to [`RouteTable::register_cluster`].
#[derive(Debug, Clone)]
pub struct RegisteredContainer {
    pub container_id: String,
    pub hostname: String,
    /// container port -> host port, when the provider published one.
    pub ports: HashMap<u16, Option<u16>>,
}

#[derive(Debug, Clone)]
struct ClusterRoutes {
    network: String,
    by_port: HashMap<u16, Upstream>,
}

/// Maps `(session, port)` to an upstream. Registration is idempotent per
/// session; re-registering replaces the cluster's routes wholesale.
pub struct RouteTable {
    base_domain: String,
    routes: DashMap<String, ClusterRoutes>,
}

impl RouteTable {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            routes: DashMap::new(),
        }
    }

    /// Register (or replace) the routes for a session's cluster.
    ///
    /// Ports with a published host port route to loopback; everything else
    /// routes to the session network alias `<session>--<port>` resolved by
    /// the provider's DNS.
    pub fn register_cluster(
        &self,
        session_id: &str,
        network: &str,
        containers: &[RegisteredContainer],
    ) -> Vec<RouteInfo> {
        let mut by_port = HashMap::new();
        for container in containers {
            for (&container_port, &host_port) in &container.ports {
                let upstream = match host_port {
                    Some(host_port) => Upstream {
                        host: "127.0.0.1".to_string(),
                        port: host_port,
                    },
                    None => Upstream {
                        host: format!("{}--{}", session_id, container_port),
                        port: container_port,
                    },
                };
                by_port.insert(container_port, upstream);
            }
        }

        let count = by_port.len();
        self.routes.insert(
            session_id.to_string(),
            ClusterRoutes {
                network: network.to_string(),
                by_port,
            },
        );
        info!("Registered {} route(s) for session {}", count, session_id);

        self.get_urls(session_id)
    }

    /// Remove every route for a session. Idempotent.
    pub fn unregister_cluster(&self, session_id: &str) {
        if self.routes.remove(session_id).is_some() {
            info!("Unregistered routes for session {}", session_id);
        }
    }

    /// Public URLs for a session's routable ports, ordered by port.
    pub fn get_urls(&self, session_id: &str) -> Vec<RouteInfo> {
        let Some(cluster) = self.routes.get(session_id) else {
            return Vec::new();
        };

        let mut ports: Vec<u16> = cluster.by_port.keys().copied().collect();
        ports.sort_unstable();
        ports
            .into_iter()
            .map(|port| RouteInfo {
                container_port: port,
                url: format!("http://{}--{}.{}", session_id, port, self.base_domain),
            })
            .collect()
    }

    /// Resolve a `(session, port)` pair to its upstream.
    pub fn resolve(&self, session_id: &str, port: u16) -> Option<Upstream> {
        self.routes
            .get(session_id)
            .and_then(|cluster| cluster.by_port.get(&port).cloned())
    }

    /// The network a session's routes live on.
    pub fn network_for(&self, session_id: &str) -> Option<String> {
        self.routes.get(session_id).map(|c| c.network.clone())
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(ports: &[(u16, Option<u16>)]) -> RegisteredContainer {
        RegisteredContainer {
            container_id: "def-1".to_string(),
            hostname: "s-abc-def".to_string(),
            ports: ports.iter().copied().collect(),
        }
    }

    #[test]
    fn register_then_unregister_is_a_noop() {
        let table = RouteTable::new("lab.test");
        table.register_cluster("sess", "lab-sess", &[container(&[(3000, None)])]);
        assert!(!table.is_empty());
        table.unregister_cluster("sess");
        assert!(table.is_empty());
        assert!(table.get_urls("sess").is_empty());
        // Second unregister is fine.
        table.unregister_cluster("sess");
    }

    #[test]
    fn register_is_idempotent_per_session() {
        let table = RouteTable::new("lab.test");
        table.register_cluster("sess", "lab-sess", &[container(&[(3000, None)])]);
        table.register_cluster("sess", "lab-sess", &[container(&[(3000, None), (8080, None)])]);

        let urls = table.get_urls("sess");
        assert_eq!(urls.len(), 2);
        assert_eq!(urls[0].container_port, 3000);
        assert_eq!(urls[0].url, "http://sess--3000.lab.test");
    }

    #[test]
    fn published_ports_route_to_loopback() {
        let table = RouteTable::new("lab.test");
        table.register_cluster("sess", "lab-sess", &[container(&[(3000, Some(41820))])]);
        let upstream = table.resolve("sess", 3000).unwrap();
        assert_eq!(upstream.host, "127.0.0.1");
        assert_eq!(upstream.port, 41820);
    }

    #[test]
    fn unpublished_ports_route_to_network_alias() {
        let table = RouteTable::new("lab.test");
        table.register_cluster("sess", "lab-sess", &[container(&[(3000, None)])]);
        let upstream = table.resolve("sess", 3000).unwrap();
        assert_eq!(upstream.host, "sess--3000");
        assert_eq!(upstream.port, 3000);
    }

    #[test]
    fn unknown_routes_resolve_to_none() {
        let table = RouteTable::new("lab.test");
        assert!(table.resolve("sess", 3000).is_none());
    }
}
