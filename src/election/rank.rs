//! Sibling ranking
//!
//! Orders election nodes by their store-assigned sequence suffix. The
//! node with the smallest suffix is the leader.

use crate::store::path;

/// Election nodes ordered by sequence number, lowest first
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ranking {
    nodes: Vec<(u64, String)>,
}

impl Ranking {
    /// Rank a set of sibling names. Names without a sequence suffix are
    /// not election nodes and are left out.
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut nodes: Vec<(u64, String)> = names
            .into_iter()
            .map(Into::into)
            .filter_map(|name| path::sequence_of(&name).map(|seq| (seq, name)))
            .collect();
        nodes.sort();
        Self { nodes }
    }

    /// Name of the lowest-sequence node
    pub fn leader(&self) -> Option<&str> {
        self.nodes.first().map(|(_, name)| name.as_str())
    }

    /// Position of a node, 0 being the leader
    pub fn rank_of(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|(_, n)| n == name)
    }

    pub fn is_leader(&self, name: &str) -> bool {
        self.leader() == Some(name)
    }

    /// Nodes ranked ahead of `name`, leader first
    pub fn ahead_of<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a str> + 'a {
        let rank = self.rank_of(name).unwrap_or(0);
        self.nodes[..rank].iter().map(|(_, n)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orders_by_sequence_not_name() {
        let ranking = Ranking::new([
            "_c_b-n_0000000007",
            "_c_a-n_0000000012",
            "_c_c-n_0000000003",
            "lock",
        ]);

        assert_eq!(ranking.len(), 3);
        assert_eq!(ranking.leader(), Some("_c_c-n_0000000003"));
        assert_eq!(ranking.rank_of("_c_a-n_0000000012"), Some(2));
        assert_eq!(ranking.rank_of("lock"), None);
        assert!(ranking.is_leader("_c_c-n_0000000003"));
    }

    #[test]
    fn test_ahead_of() {
        let ranking = Ranking::new(["x-0000000001", "y-0000000002", "z-0000000003"]);
        let ahead: Vec<_> = ranking.ahead_of("z-0000000003").collect();
        assert_eq!(ahead, vec!["x-0000000001", "y-0000000002"]);
        assert_eq!(ranking.ahead_of("x-0000000001").count(), 0);
        assert_eq!(ranking.ahead_of("missing").count(), 0);
    }

    #[test]
    fn test_empty() {
        let ranking = Ranking::new(Vec::<String>::new());
        assert!(ranking.is_empty());
        assert_eq!(ranking.leader(), None);
    }
}
