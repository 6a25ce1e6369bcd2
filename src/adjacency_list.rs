use std::collections::HashMap;
use core::hash::Hash;




/**
 * A minimal directed multigraph that stores only edges. Each edge is
 * identified by its insertion number, so that two vertices may be joined by
 * more than one edge and edge attributes can be stored elsewhere.
 */
pub struct AdjacencyList<K> {
    outgoing: HashMap<K, Vec<usize>>,
    incoming: HashMap<K, Vec<usize>>,
    ends: Vec<(K, K)>,
}




// ============================================================================
impl<K> AdjacencyList<K> where K: Hash + Eq + Clone {


    pub fn new() -> Self {
        Self::default()
    }


    /**
     * Return the number of edges in the graph.
     */
    pub fn len(&self) -> usize {
        self.ends.len()
    }


    /**
     * Determine whether there are any edges in the graph.
     */
    pub fn is_empty(&self) -> bool {
        self.ends.is_empty()
    }


    /**
     * Insert an edge from a -> b and return its number. Edges are numbered
     * in insertion order, starting from zero.
     */
    pub fn insert(&mut self, a: K, b: K) -> usize {
        let edge = self.ends.len();
        self.outgoing.entry(a.clone()).or_default().push(edge);
        self.incoming.entry(b.clone()).or_default().push(edge);
        self.ends.push((a, b));
        edge
    }


    /**
     * Return an iterator over the numbers of the edges emanating from the
     * given vertex, in insertion order.
     */
    pub fn outgoing_edges(&self, a: &K) -> impl Iterator<Item = usize> + '_ {
        self.outgoing.get(a).into_iter().flat_map(|edges| edges.iter().copied())
    }


    /**
     * Return an iterator over the numbers of the edges pointing to the given
     * vertex, in insertion order.
     */
    pub fn incoming_edges(&self, b: &K) -> impl Iterator<Item = usize> + '_ {
        self.incoming.get(b).into_iter().flat_map(|edges| edges.iter().copied())
    }

    pub fn in_degree(&self, b: &K) -> usize {
        self.incoming.get(b).map_or(0, |edges| edges.len())
    }
}

impl<K> Default for AdjacencyList<K> {
    fn default() -> Self {
        Self {
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            ends: Vec::new(),
        }
    }
}
