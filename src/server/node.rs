use std::net::SocketAddr;

use crate::common::timeutils::now_secs;
use crate::Map;

/// A compute node as tracked by the controller.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub addr: SocketAddr,
    /// Time of the last successful RPC exchange, in Unix seconds (0 = never).
    pub last_response: u64,
    pub not_responding: bool,
}

impl NodeRecord {
    pub fn new(name: String, addr: SocketAddr) -> Self {
        Self {
            name,
            addr,
            last_response: 0,
            not_responding: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct NodeTable {
    nodes: Map<String, NodeRecord>,
}

impl NodeTable {
    pub fn insert(&mut self, record: NodeRecord) {
        self.nodes.insert(record.name.clone(), record);
    }

    pub fn find(&self, name: &str) -> Option<&NodeRecord> {
        self.nodes.get(name)
    }

    /// Record a response from a node, clearing any not-responding mark.
    pub fn node_did_resp(&mut self, name: &str) {
        match self.nodes.get_mut(name) {
            Some(node) => {
                node.last_response = now_secs();
                if node.not_responding {
                    log::info!("node {} returned to service", name);
                    node.not_responding = false;
                }
            }
            None => log::error!("node_did_resp unable to find node {}", name),
        }
    }

    /// Mark a node as not responding; the transition is logged once.
    pub fn node_not_resp(&mut self, name: &str) {
        match self.nodes.get_mut(name) {
            Some(node) => {
                if !node.not_responding {
                    log::error!("node {} not responding", name);
                }
                node.not_responding = true;
            }
            None => log::error!("node_not_resp unable to find node {}", name),
        }
    }

    pub fn not_responding_count(&self) -> usize {
        self.nodes.values().filter(|node| node.not_responding).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(names: &[&str]) -> NodeTable {
        let mut table = NodeTable::default();
        for name in names {
            table.insert(NodeRecord::new(
                name.to_string(),
                "127.0.0.1:7001".parse().unwrap(),
            ));
        }
        table
    }

    #[test]
    fn test_did_resp_updates_timestamp() {
        let mut table = table_with(&["n1"]);
        assert_eq!(table.find("n1").unwrap().last_response, 0);
        table.node_did_resp("n1");
        assert!(table.find("n1").unwrap().last_response > 0);
    }

    #[test]
    fn test_not_resp_and_recovery() {
        let mut table = table_with(&["n1", "n2"]);
        table.node_not_resp("n1");
        assert!(table.find("n1").unwrap().not_responding);
        assert_eq!(table.not_responding_count(), 1);
        table.node_did_resp("n1");
        assert!(!table.find("n1").unwrap().not_responding);
        assert_eq!(table.not_responding_count(), 0);
    }

    #[test]
    fn test_unknown_node_is_ignored() {
        let mut table = table_with(&[]);
        table.node_did_resp("ghost");
        table.node_not_resp("ghost");
        assert_eq!(table.not_responding_count(), 0);
    }
}
