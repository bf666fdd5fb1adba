//! Hierarchical navigable small-world graph
//!
//! Insertion runs in two phases. The neighbor search for every level runs
//! under the shared lock, so queries proceed while a vector is being
//! placed; only the wiring of edges takes the exclusive lock. If a repair
//! pass reshaped the graph in between, the search is redone under the
//! exclusive lock.
//!
//! Deletes only mark nodes. Marked nodes keep routing searches but never
//! appear in results. [`VectorBackend::collect_garbage`] reconnects their
//! neighbors and frees the slots for reuse.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};

use parking_lot::{Mutex, RwLock};

use super::quantized::VectorStorage;
use super::{Neighbor, SearchParams, VectorBackend, VectorInfo};
use crate::query::timeout::{Partial, TimeoutCheck};
use crate::schema::{Compression, VectorOptions};
use crate::types::{DistanceMetric, DocId};
use crate::Result;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Scored {
    dist: f32,
    id: u32,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist.total_cmp(&other.dist).then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone)]
struct Node {
    label: DocId,
    /// `levels[l]` holds neighbor slots at level `l`
    levels: Vec<Vec<u32>>,
    deleted: bool,
}

#[derive(Debug)]
struct Graph {
    nodes: Vec<Option<Node>>,
    storage: VectorStorage,
    labels: HashMap<DocId, u32>,
    free: Vec<u32>,
    entry: Option<u32>,
    max_level: usize,
    marked: usize,
    /// Bumped whenever slots are freed
    generation: u64,
}

impl Graph {
    fn node(&self, id: u32) -> Option<&Node> {
        self.nodes.get(id as usize).and_then(Option::as_ref)
    }

    fn neighbors(&self, id: u32, level: usize) -> &[u32] {
        self.node(id)
            .and_then(|n| n.levels.get(level))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn is_live(&self, id: u32) -> bool {
        matches!(self.node(id), Some(n) if !n.deleted)
    }
}

#[derive(Debug)]
pub struct HnswIndex {
    dim: usize,
    metric: DistanceMetric,
    m: usize,
    m0: usize,
    ml: f64,
    ef_construction: usize,
    ef_runtime: usize,
    epsilon: f64,
    rng: Mutex<fastrand::Rng>,
    graph: RwLock<Graph>,
}

impl HnswIndex {
    pub fn new(options: &VectorOptions, compression: Option<Compression>) -> Self {
        Self::with_seed(options, compression, 0x5eed_cafe)
    }

    pub fn with_seed(options: &VectorOptions, compression: Option<Compression>, seed: u64) -> Self {
        let m = options.m.max(2);
        Self {
            dim: options.dim,
            metric: options.metric,
            m,
            m0: m * 2,
            ml: 1.0 / (m as f64).ln(),
            ef_construction: options.ef_construction.max(1),
            ef_runtime: options.ef_runtime.max(1),
            epsilon: options.epsilon,
            rng: Mutex::new(fastrand::Rng::with_seed(seed)),
            graph: RwLock::new(Graph {
                nodes: Vec::with_capacity(options.initial_cap),
                storage: VectorStorage::new(options.dim, compression, options.training_threshold),
                labels: HashMap::with_capacity(options.initial_cap),
                free: Vec::new(),
                entry: None,
                max_level: 0,
                marked: 0,
                generation: 0,
            }),
        }
    }

    fn random_level(&self) -> usize {
        let r = 1.0 - self.rng.lock().f64();
        (-r.ln() * self.ml).floor() as usize
    }

    fn max_degree(&self, level: usize) -> usize {
        if level == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn dist(&self, g: &Graph, query: &[f32], id: u32) -> f32 {
        g.storage.distance(self.metric, query, id as usize)
    }

    /// Greedy descent from the entry point down to `target_level + 1`.
    fn descend(&self, g: &Graph, query: &[f32], target_level: usize) -> Option<Scored> {
        let entry = g.entry?;
        let mut best = Scored {
            dist: self.dist(g, query, entry),
            id: entry,
        };
        let mut level = g.max_level;
        while level > target_level {
            let mut changed = true;
            while changed {
                changed = false;
                for &n in g.neighbors(best.id, level) {
                    if g.node(n).is_none() {
                        continue;
                    }
                    let d = self.dist(g, query, n);
                    if d < best.dist {
                        best = Scored { dist: d, id: n };
                        changed = true;
                    }
                }
            }
            level -= 1;
        }
        Some(best)
    }

    /// Beam search on one level. Returns up to `ef` nodes, closest first.
    fn search_layer(
        &self,
        g: &Graph,
        query: &[f32],
        entries: &[Scored],
        ef: usize,
        level: usize,
        mut check: Option<&mut TimeoutCheck>,
    ) -> (Vec<Scored>, bool) {
        let mut visited: HashSet<u32> = entries.iter().map(|e| e.id).collect();
        let mut candidates: BinaryHeap<Reverse<Scored>> = entries.iter().map(|e| Reverse(*e)).collect();
        let mut results: BinaryHeap<Scored> = entries.iter().copied().collect();
        while results.len() > ef {
            results.pop();
        }
        let mut timed_out = false;
        while let Some(Reverse(current)) = candidates.pop() {
            if let Some(worst) = results.peek() {
                if current.dist > worst.dist && results.len() >= ef {
                    break;
                }
            }
            if let Some(check) = check.as_deref_mut() {
                if check.tick() {
                    timed_out = true;
                    break;
                }
            }
            for &n in g.neighbors(current.id, level) {
                if !visited.insert(n) || g.node(n).is_none() {
                    continue;
                }
                let d = self.dist(g, query, n);
                let admit = results.len() < ef || results.peek().map_or(true, |w| d < w.dist);
                if admit {
                    let s = Scored { dist: d, id: n };
                    candidates.push(Reverse(s));
                    results.push(s);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        (results.into_sorted_vec(), timed_out)
    }

    /// Diversity heuristic: keep a candidate only if it is closer to the
    /// base than to every neighbor already kept; top up with the closest
    /// rejects when short.
    fn select_neighbors(&self, g: &Graph, candidates: &[Scored], m: usize) -> Vec<u32> {
        let mut kept: Vec<(u32, Vec<f32>)> = Vec::with_capacity(m);
        let mut rejected = Vec::new();
        for c in candidates {
            if kept.len() >= m {
                break;
            }
            let v = g.storage.get(c.id as usize);
            let diverse = kept
                .iter()
                .all(|(_, kv)| super::distance::distance(self.metric, &v, kv) > c.dist);
            if diverse {
                kept.push((c.id, v));
            } else {
                rejected.push(c.id);
            }
        }
        let mut out: Vec<u32> = kept.into_iter().map(|(id, _)| id).collect();
        for id in rejected {
            if out.len() >= m {
                break;
            }
            out.push(id);
        }
        out
    }

    /// Candidate lists per level `0..=min(level, max_level)`.
    fn plan(&self, g: &Graph, query: &[f32], level: usize) -> Vec<Vec<Scored>> {
        let Some(mut entry) = self.descend(g, query, level) else {
            return Vec::new();
        };
        let top = level.min(g.max_level);
        let mut plan = vec![Vec::new(); top + 1];
        let mut entries = vec![entry];
        for l in (0..=top).rev() {
            let (found, _) = self.search_layer(g, query, &entries, self.ef_construction, l, None);
            if let Some(first) = found.first() {
                entry = *first;
            }
            entries = if found.is_empty() { vec![entry] } else { found.clone() };
            plan[l] = found;
        }
        plan
    }

    fn link(&self, g: &mut Graph, label: DocId, vector: &[f32], level: usize, plan: Vec<Vec<Scored>>) {
        let id = match g.free.pop() {
            Some(slot) => {
                g.storage.set(slot as usize, vector);
                slot
            }
            None => g.storage.push(vector) as u32,
        };
        let mut node = Node {
            label,
            levels: vec![Vec::new(); level + 1],
            deleted: false,
        };
        let mut reverse: Vec<(u32, usize)> = Vec::new();
        for (l, candidates) in plan.iter().enumerate() {
            let chosen = self.select_neighbors(g, candidates, self.max_degree(l));
            for &n in &chosen {
                reverse.push((n, l));
            }
            node.levels[l] = chosen;
        }
        if (id as usize) < g.nodes.len() {
            g.nodes[id as usize] = Some(node);
        } else {
            g.nodes.push(Some(node));
        }
        for (n, l) in reverse {
            self.add_edge(g, n, id, l);
        }
        g.labels.insert(label, id);
        if g.entry.is_none() || level > g.max_level {
            g.entry = Some(id);
            g.max_level = level;
        }
    }

    fn add_edge(&self, g: &mut Graph, from: u32, to: u32, level: usize) {
        let limit = self.max_degree(level);
        let current = match g.node(from).and_then(|n| n.levels.get(level)) {
            Some(list) if !list.contains(&to) => list.clone(),
            _ => return,
        };
        let pruned = if current.len() < limit {
            let mut next = current;
            next.push(to);
            next
        } else {
            let base = g.storage.get(from as usize);
            let mut candidates: Vec<Scored> = current
                .iter()
                .chain(std::iter::once(&to))
                .map(|&n| Scored {
                    dist: self.dist(g, &base, n),
                    id: n,
                })
                .collect();
            candidates.sort();
            self.select_neighbors(g, &candidates, limit)
        };
        if let Some(Some(node)) = g.nodes.get_mut(from as usize) {
            node.levels[level] = pruned;
        }
    }

    fn search(
        &self,
        g: &Graph,
        query: &[f32],
        ef: usize,
        check: &mut TimeoutCheck,
    ) -> (Vec<Scored>, bool) {
        match self.descend(g, query, 0) {
            Some(entry) => self.search_layer(g, query, &[entry], ef, 0, Some(check)),
            None => (Vec::new(), false),
        }
    }
}

impl VectorBackend for HnswIndex {
    fn insert(&self, label: DocId, vector: Vec<f32>) -> Result<()> {
        debug_assert_eq!(vector.len(), self.dim);
        self.delete(label);
        let level = self.random_level();
        let (generation, plan) = {
            let g = self.graph.read();
            (g.generation, self.plan(&g, &vector, level))
        };
        let mut g = self.graph.write();
        let plan = if g.generation != generation {
            self.plan(&g, &vector, level)
        } else {
            plan
        };
        self.link(&mut g, label, &vector, level, plan);
        Ok(())
    }

    fn delete(&self, label: DocId) -> bool {
        let mut g = self.graph.write();
        let Some(id) = g.labels.remove(&label) else {
            return false;
        };
        if let Some(Some(node)) = g.nodes.get_mut(id as usize) {
            node.deleted = true;
        }
        g.marked += 1;
        true
    }

    fn knn(
        &self,
        query: &[f32],
        k: usize,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let g = self.graph.read();
        let want = k.min(g.labels.len());
        if want == 0 {
            return Partial::complete(Vec::new());
        }
        let mut ef = params.ef_runtime.unwrap_or(self.ef_runtime).max(k);
        loop {
            let (found, timed_out) = self.search(&g, query, ef, check);
            let live: Vec<Neighbor> = found
                .iter()
                .filter(|s| g.is_live(s.id))
                .take(k)
                .filter_map(|s| g.node(s.id).map(|n| Neighbor::new(n.label, s.dist)))
                .collect();
            // Marked nodes can crowd the beam; widen until enough live ones fit.
            if timed_out || live.len() >= want || ef >= g.nodes.len() {
                return Partial {
                    value: live,
                    timed_out,
                };
            }
            ef = (ef * 2).min(g.nodes.len());
        }
    }

    fn range(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
        check: &mut TimeoutCheck,
    ) -> Partial<Vec<Neighbor>> {
        let g = self.graph.read();
        let epsilon = params.epsilon.unwrap_or(self.epsilon) as f32;
        let boundary = radius + radius.abs() * epsilon;
        let (seeds, timed_out) = self.search(&g, query, self.ef_runtime, check);
        if timed_out {
            return Partial::truncated(Vec::new());
        }
        let mut visited: HashSet<u32> = seeds.iter().map(|s| s.id).collect();
        let mut queue: VecDeque<Scored> = seeds.into_iter().filter(|s| s.dist <= boundary).collect();
        let mut out = Vec::new();
        while let Some(current) = queue.pop_front() {
            if check.tick() {
                return Partial::truncated(out);
            }
            if current.dist <= radius && g.is_live(current.id) {
                if let Some(node) = g.node(current.id) {
                    out.push(Neighbor::new(node.label, current.dist));
                }
            }
            for &n in g.neighbors(current.id, 0) {
                if !visited.insert(n) || g.node(n).is_none() {
                    continue;
                }
                let d = self.dist(&g, query, n);
                if d <= boundary {
                    queue.push_back(Scored { dist: d, id: n });
                }
            }
        }
        Partial::complete(out)
    }

    fn distance_to(&self, label: DocId, query: &[f32]) -> Option<f32> {
        let g = self.graph.read();
        let id = *g.labels.get(&label)?;
        Some(self.dist(&g, query, id))
    }

    fn vector(&self, label: DocId) -> Option<Vec<f32>> {
        let g = self.graph.read();
        let id = *g.labels.get(&label)?;
        Some(g.storage.get(id as usize))
    }

    fn size(&self) -> usize {
        self.graph.read().labels.len()
    }

    fn memory(&self) -> usize {
        let g = self.graph.read();
        let edges: usize = g
            .nodes
            .iter()
            .flatten()
            .map(|n| n.levels.iter().map(|l| l.capacity() * 4).sum::<usize>())
            .sum();
        g.storage.memory() + edges + g.labels.capacity() * 12
    }

    fn info(&self) -> VectorInfo {
        let memory = self.memory();
        let g = self.graph.read();
        VectorInfo {
            algorithm: "HNSW".to_string(),
            size: g.labels.len(),
            memory,
            marked_deleted: g.marked,
            max_level: Some(g.max_level),
            quantized: Some(g.storage.is_quantized()),
            ..Default::default()
        }
    }

    fn collect_garbage(&self) -> usize {
        let mut g = self.graph.write();
        if g.marked == 0 {
            return 0;
        }
        let dead: HashSet<u32> = g
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| matches!(n, Some(n) if n.deleted))
            .map(|(i, _)| i as u32)
            .collect();

        // Reconnect each live node whose adjacency references a dead one.
        let live_ids: Vec<u32> = (0..g.nodes.len() as u32).filter(|id| g.is_live(*id)).collect();
        for id in live_ids {
            let levels = g.node(id).map(|n| n.levels.len()).unwrap_or(0);
            for level in 0..levels {
                let current = g.neighbors(id, level);
                if !current.iter().any(|n| dead.contains(n)) {
                    continue;
                }
                let mut pool: Vec<u32> = Vec::new();
                for &n in current {
                    if dead.contains(&n) {
                        pool.extend(g.neighbors(n, level).iter().filter(|x| !dead.contains(x)));
                    } else {
                        pool.push(n);
                    }
                }
                pool.retain(|x| *x != id);
                pool.sort_unstable();
                pool.dedup();
                let base = g.storage.get(id as usize);
                let mut candidates: Vec<Scored> = pool
                    .into_iter()
                    .map(|n| Scored {
                        dist: self.dist(&g, &base, n),
                        id: n,
                    })
                    .collect();
                candidates.sort();
                let repaired = self.select_neighbors(&g, &candidates, self.max_degree(level));
                if let Some(Some(node)) = g.nodes.get_mut(id as usize) {
                    node.levels[level] = repaired;
                }
            }
        }

        let slot_bytes = g.storage.slot_bytes();
        let mut freed = 0;
        for &id in &dead {
            if let Some(node) = g.nodes[id as usize].take() {
                freed += slot_bytes + node.levels.iter().map(|l| l.capacity() * 4).sum::<usize>();
            }
            g.free.push(id);
        }
        g.marked = 0;
        g.generation += 1;

        if g.entry.map_or(false, |e| dead.contains(&e)) {
            let replacement = g
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(i, n)| n.as_ref().map(|n| (i as u32, n.levels.len() - 1)))
                .max_by_key(|(_, level)| *level);
            g.entry = replacement.map(|(id, _)| id);
            g.max_level = replacement.map(|(_, level)| level).unwrap_or(0);
        }
        tracing::debug!(freed_nodes = dead.len(), bytes = freed, "repaired graph index");
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::VectorAlgorithm;
    use crate::vector::flat::FlatIndex;
    use crate::vector::tests::check;

    fn options(dim: usize) -> VectorOptions {
        let mut opts = VectorOptions::new(VectorAlgorithm::Hnsw);
        opts.dim = dim;
        opts.m = 8;
        opts.ef_construction = 64;
        opts.ef_runtime = 32;
        opts
    }

    fn point(rng: &mut fastrand::Rng, dim: usize) -> Vec<f32> {
        (0..dim).map(|_| rng.f32()).collect()
    }

    #[test]
    fn test_knn_matches_flat_on_small_set() {
        let opts = options(4);
        let graph = HnswIndex::new(&opts, None);
        let flat = FlatIndex::new(&opts);
        let mut rng = fastrand::Rng::with_seed(7);
        for label in 1..=300 {
            let v = point(&mut rng, 4);
            graph.insert(label, v.clone()).unwrap();
            flat.insert(label, v).unwrap();
        }
        let query = point(&mut rng, 4);
        let params = SearchParams {
            ef_runtime: Some(300),
            epsilon: None,
        };
        let expected = flat.knn(&query, 10, &params, &mut check()).value;
        let found = graph.knn(&query, 10, &params, &mut check()).value;
        assert_eq!(found.len(), 10);
        assert_eq!(found, expected);
    }

    #[test]
    fn test_distances_non_decreasing() {
        let graph = HnswIndex::new(&options(3), None);
        let mut rng = fastrand::Rng::with_seed(3);
        for label in 1..=200 {
            graph.insert(label, point(&mut rng, 3)).unwrap();
        }
        let found = graph.knn(&[0.5, 0.5, 0.5], 25, &SearchParams::default(), &mut check()).value;
        assert_eq!(found.len(), 25);
        assert!(found.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_deleted_nodes_excluded_and_repaired() {
        let graph = HnswIndex::new(&options(2), None);
        for label in 1..=50u64 {
            graph.insert(label, vec![label as f32, 0.0]).unwrap();
        }
        for label in 1..=10u64 {
            assert!(graph.delete(label));
        }
        assert!(!graph.delete(1));
        let found = graph.knn(&[0.0, 0.0], 5, &SearchParams::default(), &mut check()).value;
        let labels: Vec<DocId> = found.iter().map(|n| n.label).collect();
        assert_eq!(labels, vec![11, 12, 13, 14, 15]);

        assert!(graph.collect_garbage() > 0);
        assert_eq!(graph.collect_garbage(), 0);
        assert_eq!(graph.info().marked_deleted, 0);
        let found = graph.knn(&[0.0, 0.0], 5, &SearchParams::default(), &mut check()).value;
        let labels: Vec<DocId> = found.iter().map(|n| n.label).collect();
        assert_eq!(labels, vec![11, 12, 13, 14, 15]);

        graph.insert(100, vec![0.5, 0.0]).unwrap();
        let found = graph.knn(&[0.0, 0.0], 1, &SearchParams::default(), &mut check()).value;
        assert_eq!(found[0].label, 100);
    }

    #[test]
    fn test_range_with_epsilon() {
        let graph = HnswIndex::new(&options(1), None);
        for label in 1..=100u64 {
            graph.insert(label, vec![label as f32]).unwrap();
        }
        let params = SearchParams {
            ef_runtime: None,
            epsilon: Some(0.5),
        };
        let found = graph.range(&[50.0], 4.0, &params, &mut check()).value;
        let mut labels: Vec<DocId> = found.iter().map(|n| n.label).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec![48, 49, 50, 51, 52]);
    }

    #[test]
    fn test_quantized_graph_still_finds_neighbors() {
        let mut opts = options(2);
        opts.training_threshold = 100;
        let graph = HnswIndex::new(&opts, Some(Compression::Lvq8));
        for label in 1..=100u64 {
            graph.insert(label, vec![label as f32, label as f32]).unwrap();
        }
        assert_eq!(graph.info().quantized, Some(true));
        let found = graph.knn(&[30.0, 30.0], 3, &SearchParams::default(), &mut check()).value;
        let mut labels: Vec<DocId> = found.iter().map(|n| n.label).collect();
        labels.sort_unstable();
        assert_eq!(labels, vec![29, 30, 31]);
    }
}
