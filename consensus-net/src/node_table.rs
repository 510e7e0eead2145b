//! The static validator table.
//!
//! The table is fixed for the lifetime of a run: every node knows every
//! peer's index, node id, IP, and base port. It is the single source of
//! truth for "who are we talking to" — the transport consults it before
//! sending and resolves inbound senders by source IP against it.

use {
    crate::config::PortRole,
    serde::{Deserialize, Serialize},
    std::{
        collections::{BTreeMap, HashMap},
        net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    },
    strand_types::{ChainId, ConsensusError, NodeId, NodeIndex, Result},
};

/// Static identity and addressing of one validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: NodeId,
    pub index: NodeIndex,
    pub ip: Ipv4Addr,
    pub base_port: u16,
}

impl NodeInfo {
    pub fn new(node_id: NodeId, index: NodeIndex, ip: Ipv4Addr, base_port: u16) -> Self {
        Self {
            node_id,
            index,
            ip,
            base_port,
        }
    }

    /// Listen address for one of the node's roles.
    pub fn addr(&self, role: PortRole) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.ip, self.base_port + role.offset()))
    }
}

/// All validators of one chain, indexed by position and by IP.
#[derive(Debug, Clone)]
pub struct NodeTable {
    chain_id: ChainId,
    nodes: BTreeMap<NodeIndex, NodeInfo>,
    by_ip: HashMap<Ipv4Addr, NodeIndex>,
    by_node_id: HashMap<NodeId, NodeIndex>,
}

impl NodeTable {
    /// Build the table. Indices must be exactly 1..=N with unique node
    /// ids; IPs may repeat only across different ports (single-host test
    /// chains), in which case IP lookup resolves to the lowest index.
    pub fn new(chain_id: ChainId, nodes: Vec<NodeInfo>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(ConsensusError::EngineInit("empty node table".into()));
        }
        let count = nodes.len() as u64;
        let mut by_index = BTreeMap::new();
        let mut by_ip = HashMap::new();
        let mut by_node_id = HashMap::new();

        for node in nodes {
            if node.index == 0 || node.index > count {
                return Err(ConsensusError::EngineInit(format!(
                    "node index {} outside 1..={count}",
                    node.index
                )));
            }
            if by_node_id.insert(node.node_id, node.index).is_some() {
                return Err(ConsensusError::EngineInit(format!(
                    "duplicate node id {}",
                    node.node_id
                )));
            }
            by_ip.entry(node.ip).or_insert(node.index);
            if by_index.insert(node.index, node).is_some() {
                return Err(ConsensusError::EngineInit("duplicate node index".into()));
            }
        }
        Ok(Self {
            chain_id,
            nodes: by_index,
            by_ip,
            by_node_id,
        })
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn node_count(&self) -> u64 {
        self.nodes.len() as u64
    }

    pub fn get(&self, index: NodeIndex) -> Option<&NodeInfo> {
        self.nodes.get(&index)
    }

    /// Resolve a sender by source IP; unknown IPs are rejected.
    pub fn by_ip(&self, ip: Ipv4Addr) -> Result<&NodeInfo> {
        let index = self
            .by_ip
            .get(&ip)
            .ok_or(ConsensusError::InvalidSourceIp(ip))?;
        Ok(&self.nodes[index])
    }

    pub fn index_of_node_id(&self, node_id: NodeId) -> Option<NodeIndex> {
        self.by_node_id.get(&node_id).copied()
    }

    /// Iterate validators in index order.
    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Validators other than `index`, in index order.
    pub fn peers_of(&self, index: NodeIndex) -> impl Iterator<Item = &NodeInfo> + '_ {
        self.nodes.values().filter(move |n| n.index != index)
    }
}
