//! Replication topology analysis
//!
//! Nodes are small integer indices into the monitor's server arena; an edge
//! A -> B means "A replicates from B". Each tick rebuilds the edge set from
//! probe results, finds cycles with Tarjan's strongly-connected components,
//! and derives every node's role flags. Multi-master rings elect exactly one
//! master per tick, the member with the lowest server id.

use crate::backend::status_flags;

/// Probe-derived view of one node, inputs to role derivation
#[derive(Debug, Clone, Default)]
pub struct NodeInfo {
    pub reachable: bool,
    pub read_only: bool,
    pub server_id: i64,
    /// Upstream node this one replicates from, resolved to an arena index
    pub upstream: Option<usize>,
    /// Both replication threads are running toward the upstream
    pub replicating: bool,
    pub in_maintenance: bool,
}

/// Derived roles for the whole arena, same order as the input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedRoles {
    pub status: Vec<u32>,
    /// Arena index of the elected master, if any
    pub master: Option<usize>,
    /// Nodes that are members of a multi-node cycle
    pub cycle_members: Vec<usize>,
}

/// Derive role flags from the current edge set
pub fn derive_roles(nodes: &[NodeInfo]) -> DerivedRoles {
    let n = nodes.len();
    let sccs = tarjan_scc(nodes);

    // Multi-node components are replication rings
    let mut cycle_members = Vec::new();
    let mut cycle_of = vec![usize::MAX; n];
    for (cycle_id, scc) in sccs.iter().enumerate() {
        if scc.len() > 1 {
            for &idx in scc {
                cycle_of[idx] = cycle_id;
                cycle_members.push(idx);
            }
        }
    }
    cycle_members.sort_unstable();

    // Master candidates: reachable, writable, and either a replication root
    // or elected within their cycle by lowest server id
    let mut candidates: Vec<usize> = Vec::new();
    for (idx, node) in nodes.iter().enumerate() {
        if !node.reachable || node.read_only || node.in_maintenance {
            continue;
        }
        if cycle_of[idx] != usize::MAX {
            let elected = nodes
                .iter()
                .enumerate()
                .filter(|(other, info)| {
                    cycle_of[*other] == cycle_of[idx] && info.reachable && !info.read_only
                })
                .min_by_key(|(_, info)| info.server_id)
                .map(|(other, _)| other);
            if elected == Some(idx) {
                candidates.push(idx);
            }
        } else if node.upstream.is_none() {
            candidates.push(idx);
        }
    }

    // The master is the root serving the largest replica tree; ties break on
    // lowest server id so the election is stable
    let master = candidates
        .iter()
        .copied()
        .max_by_key(|&idx| {
            let reach = count_reaching(nodes, idx, &cycle_of);
            (reach, std::cmp::Reverse(nodes[idx].server_id))
        })
        .filter(|&idx| nodes[idx].reachable);

    let mut status = vec![0u32; n];
    for (idx, node) in nodes.iter().enumerate() {
        let mut s = 0u32;
        if node.reachable {
            s |= status_flags::RUNNING;
        } else {
            s |= status_flags::DOWN;
        }
        if node.in_maintenance {
            s |= status_flags::MAINTENANCE;
        }
        status[idx] = s;
    }

    if let Some(master_idx) = master {
        status[master_idx] |= status_flags::MASTER;

        // Slave iff the node reaches the master over working replication
        for idx in 0..n {
            if idx == master_idx || !nodes[idx].reachable {
                continue;
            }
            if reaches(nodes, idx, master_idx, &cycle_of) {
                status[idx] |= status_flags::SLAVE;
            }
        }

        // Relay iff it has an upstream master and downstream slaves
        for idx in 0..n {
            if status[idx] & status_flags::SLAVE == 0 {
                continue;
            }
            let has_downstream = nodes.iter().enumerate().any(|(other, info)| {
                other != idx
                    && info.upstream == Some(idx)
                    && info.replicating
                    && status[other] & status_flags::SLAVE != 0
            });
            if has_downstream {
                status[idx] |= status_flags::RELAY;
            }
        }
    }

    DerivedRoles {
        status,
        master,
        cycle_members,
    }
}

/// Whether `from` reaches `target` following working upstream edges
fn reaches(nodes: &[NodeInfo], from: usize, target: usize, cycle_of: &[usize]) -> bool {
    let mut seen = vec![false; nodes.len()];
    let mut at = from;
    loop {
        if seen[at] {
            // Walked into a cycle: reachable if the target is in it
            return cycle_of[at] != usize::MAX && cycle_of[at] == cycle_of[target];
        }
        seen[at] = true;
        match nodes[at].upstream {
            Some(up) => {
                if !nodes[at].replicating {
                    return false;
                }
                if up == target {
                    return true;
                }
                at = up;
            }
            None => return false,
        }
    }
}

/// Count nodes whose replication chain reaches `root`
fn count_reaching(nodes: &[NodeInfo], root: usize, cycle_of: &[usize]) -> usize {
    (0..nodes.len())
        .filter(|&idx| idx != root && nodes[idx].reachable && reaches(nodes, idx, root, cycle_of))
        .count()
}

/// Tarjan's strongly-connected components over the upstream edge set
fn tarjan_scc(nodes: &[NodeInfo]) -> Vec<Vec<usize>> {
    struct State {
        index: usize,
        indices: Vec<Option<usize>>,
        lowlink: Vec<usize>,
        on_stack: Vec<bool>,
        stack: Vec<usize>,
        output: Vec<Vec<usize>>,
    }

    fn strongconnect(v: usize, nodes: &[NodeInfo], st: &mut State) {
        st.indices[v] = Some(st.index);
        st.lowlink[v] = st.index;
        st.index += 1;
        st.stack.push(v);
        st.on_stack[v] = true;

        if let Some(w) = nodes[v].upstream {
            match st.indices[w] {
                None => {
                    strongconnect(w, nodes, st);
                    st.lowlink[v] = st.lowlink[v].min(st.lowlink[w]);
                }
                Some(w_index) => {
                    if st.on_stack[w] {
                        st.lowlink[v] = st.lowlink[v].min(w_index);
                    }
                }
            }
        }

        if st.lowlink[v] == st.indices[v].unwrap() {
            let mut scc = Vec::new();
            loop {
                let w = st.stack.pop().unwrap();
                st.on_stack[w] = false;
                scc.push(w);
                if w == v {
                    break;
                }
            }
            st.output.push(scc);
        }
    }

    let n = nodes.len();
    let mut st = State {
        index: 0,
        indices: vec![None; n],
        lowlink: vec![0; n],
        on_stack: vec![false; n],
        stack: Vec::new(),
        output: Vec::new(),
    };

    for v in 0..n {
        if st.indices[v].is_none() {
            strongconnect(v, nodes, &mut st);
        }
    }

    st.output
}

/// A parsed MariaDB GTID position: one (domain, server, sequence) triple per
/// replication domain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GtidPosition {
    triples: Vec<(u32, u32, u64)>,
}

impl GtidPosition {
    /// Parse "0-1-42" or "0-1-42,1-2-9" style positions
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        if text.is_empty() {
            return Some(GtidPosition::default());
        }
        let mut triples = Vec::new();
        for part in text.split(',') {
            let mut fields = part.trim().split('-');
            let domain = fields.next()?.parse().ok()?;
            let server = fields.next()?.parse().ok()?;
            let sequence = fields.next()?.parse().ok()?;
            triples.push((domain, server, sequence));
        }
        triples.sort_unstable();
        Some(Self { triples })
    }

    pub fn sequence(&self, domain: u32) -> Option<u64> {
        self.triples
            .iter()
            .find(|(d, _, _)| *d == domain)
            .map(|(_, _, seq)| *seq)
    }

    /// Whether this position is at least as advanced as `other` on every
    /// domain `other` has events in
    pub fn contains(&self, other: &GtidPosition) -> bool {
        other.triples.iter().all(|(domain, _, seq)| {
            self.sequence(*domain).map(|own| own >= *seq).unwrap_or(false)
        })
    }

    /// Sum of sequences, used to order candidates by most advanced position
    pub fn total_sequence(&self) -> u64 {
        self.triples.iter().map(|(_, _, seq)| *seq).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(reachable: bool, read_only: bool, server_id: i64, upstream: Option<usize>) -> NodeInfo {
        NodeInfo {
            reachable,
            read_only,
            server_id,
            upstream,
            replicating: upstream.is_some(),
            in_maintenance: false,
        }
    }

    #[test]
    fn test_simple_master_slave() {
        // 0 <- 1, 0 <- 2
        let nodes = vec![
            node(true, false, 1, None),
            node(true, true, 2, Some(0)),
            node(true, true, 3, Some(0)),
        ];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, Some(0));
        assert!(roles.status[0] & status_flags::MASTER != 0);
        assert!(roles.status[1] & status_flags::SLAVE != 0);
        assert!(roles.status[2] & status_flags::SLAVE != 0);
        assert!(roles.cycle_members.is_empty());
    }

    #[test]
    fn test_relay_chain() {
        // 0 <- 1 <- 2 : node 1 relays
        let nodes = vec![
            node(true, false, 1, None),
            node(true, true, 2, Some(0)),
            node(true, true, 3, Some(1)),
        ];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, Some(0));
        assert!(roles.status[1] & status_flags::SLAVE != 0);
        assert!(roles.status[1] & status_flags::RELAY != 0);
        assert!(roles.status[2] & status_flags::SLAVE != 0);
        assert!(roles.status[2] & status_flags::RELAY == 0);
    }

    #[test]
    fn test_broken_replication_breaks_slave_role() {
        let mut nodes = vec![node(true, false, 1, None), node(true, true, 2, Some(0))];
        nodes[1].replicating = false;
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, Some(0));
        assert!(roles.status[1] & status_flags::SLAVE == 0);
        assert!(roles.status[1] & status_flags::RUNNING != 0);
    }

    #[test]
    fn test_unreachable_master_elects_nobody() {
        let nodes = vec![node(false, false, 1, None), node(true, true, 2, Some(0))];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, None);
        assert!(roles.status[0] & status_flags::DOWN != 0);
        assert!(roles.status[1] & status_flags::SLAVE == 0);
    }

    #[test]
    fn test_two_node_ring_elects_lowest_id() {
        // 0 <-> 1 ring, both writable
        let nodes = vec![
            node(true, false, 5, Some(1)),
            node(true, false, 2, Some(0)),
        ];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.cycle_members, vec![0, 1]);
        // Lowest server id (node 1, id 2) wins the election
        assert_eq!(roles.master, Some(1));
        assert!(roles.status[1] & status_flags::MASTER != 0);
        assert!(roles.status[0] & status_flags::SLAVE != 0);
    }

    #[test]
    fn test_ring_with_external_slaves() {
        // ring 0<->1 plus slave 2 replicating from 0
        let nodes = vec![
            node(true, false, 1, Some(1)),
            node(true, false, 3, Some(0)),
            node(true, true, 7, Some(0)),
        ];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, Some(0));
        assert!(roles.status[1] & status_flags::SLAVE != 0);
        assert!(roles.status[2] & status_flags::SLAVE != 0);
    }

    #[test]
    fn test_master_is_root_of_larger_tree() {
        // Two writable roots: node 0 with two slaves, node 3 standalone
        let nodes = vec![
            node(true, false, 10, None),
            node(true, true, 2, Some(0)),
            node(true, true, 3, Some(0)),
            node(true, false, 1, None),
        ];
        let roles = derive_roles(&nodes);

        assert_eq!(roles.master, Some(0));
        assert!(roles.status[3] & status_flags::MASTER == 0);
    }

    #[test]
    fn test_tarjan_finds_three_node_ring() {
        let nodes = vec![
            node(true, false, 1, Some(1)),
            node(true, false, 2, Some(2)),
            node(true, false, 3, Some(0)),
        ];
        let roles = derive_roles(&nodes);
        assert_eq!(roles.cycle_members, vec![0, 1, 2]);
        assert_eq!(roles.master, Some(0)); // server id 1 is lowest
    }

    #[test]
    fn test_gtid_parse_and_compare() {
        let a = GtidPosition::parse("0-1-42").unwrap();
        let b = GtidPosition::parse("0-1-40").unwrap();
        assert!(a.contains(&b));
        assert!(!b.contains(&a));
        assert_eq!(a.sequence(0), Some(42));
        assert_eq!(a.sequence(1), None);
    }

    #[test]
    fn test_gtid_multi_domain() {
        let a = GtidPosition::parse("0-1-42,1-2-10").unwrap();
        let b = GtidPosition::parse("0-1-42,1-2-9").unwrap();
        let c = GtidPosition::parse("1-2-11").unwrap();

        assert!(a.contains(&b));
        assert!(!b.contains(&a));
        assert!(!a.contains(&c));
        assert_eq!(a.total_sequence(), 52);
    }

    #[test]
    fn test_gtid_empty() {
        let empty = GtidPosition::parse("").unwrap();
        let a = GtidPosition::parse("0-1-1").unwrap();
        assert!(empty.is_empty());
        assert!(a.contains(&empty));
        assert!(!empty.contains(&a));
    }
}
