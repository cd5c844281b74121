//! Binary grid labeling by s-t minimum cut
//!
//! Energy over a 4-connected `gh x gw` grid:
//! `E(x) = sum_i cost[x_i][i] + beta * #{(i, j) neighbours : x_i != x_j}`.
//! Nodes left on the source side after max-flow take label 1.

use std::collections::VecDeque;

const CAP_EPS: f32 = 1e-7;

#[derive(Debug, Clone, Copy)]
struct Edge {
    to: usize,
    rev: usize,
    cap: f32,
}

#[derive(Debug, Default)]
struct FlowGraph {
    adj: Vec<Vec<Edge>>,
}

impl FlowGraph {
    fn with_nodes(n: usize) -> Self {
        Self {
            adj: vec![Vec::new(); n],
        }
    }

    /// Directed pair u -> v (cap_uv) and v -> u (cap_vu) sharing residuals
    fn add_edge(&mut self, u: usize, v: usize, cap_uv: f32, cap_vu: f32) {
        let ru = self.adj[v].len();
        let rv = self.adj[u].len();
        self.adj[u].push(Edge {
            to: v,
            rev: ru,
            cap: cap_uv,
        });
        self.adj[v].push(Edge {
            to: u,
            rev: rv,
            cap: cap_vu,
        });
    }

    /// Shortest augmenting path as (node, edge index) hops, None when cut
    fn bfs_path(&self, s: usize, t: usize) -> Option<Vec<(usize, usize)>> {
        let mut parent: Vec<Option<(usize, usize)>> = vec![None; self.adj.len()];
        let mut seen = vec![false; self.adj.len()];
        let mut queue = VecDeque::new();
        seen[s] = true;
        queue.push_back(s);

        while let Some(u) = queue.pop_front() {
            for (ei, e) in self.adj[u].iter().enumerate() {
                if e.cap > CAP_EPS && !seen[e.to] {
                    seen[e.to] = true;
                    parent[e.to] = Some((u, ei));
                    if e.to == t {
                        let mut path = Vec::new();
                        let mut node = t;
                        while let Some((prev, edge)) = parent[node] {
                            path.push((prev, edge));
                            node = prev;
                        }
                        path.reverse();
                        return Some(path);
                    }
                    queue.push_back(e.to);
                }
            }
        }
        None
    }

    /// Edmonds-Karp; returns (augmentations used, budget hit)
    fn max_flow(&mut self, s: usize, t: usize, budget: usize) -> (usize, bool) {
        let mut used = 0;
        loop {
            let Some(path) = self.bfs_path(s, t) else {
                return (used, false);
            };
            if used >= budget {
                return (used, true);
            }
            let bottleneck = path
                .iter()
                .map(|&(u, ei)| self.adj[u][ei].cap)
                .fold(f32::INFINITY, f32::min);
            for &(u, ei) in &path {
                let Edge { to, rev, .. } = self.adj[u][ei];
                self.adj[u][ei].cap -= bottleneck;
                self.adj[to][rev].cap += bottleneck;
            }
            used += 1;
        }
    }

    /// Nodes reachable from `s` in the residual graph
    fn source_side(&self, s: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adj.len()];
        let mut queue = VecDeque::from([s]);
        seen[s] = true;
        while let Some(u) = queue.pop_front() {
            for e in &self.adj[u] {
                if e.cap > CAP_EPS && !seen[e.to] {
                    seen[e.to] = true;
                    queue.push_back(e.to);
                }
            }
        }
        seen
    }
}

/// Labeling returned by [`solve_grid_labeling`]
#[derive(Debug, Clone, PartialEq)]
pub struct GridCut {
    /// Row-major labels, `true` for label 1
    pub labels: Vec<bool>,
    pub energy: f32,
    pub augmentations: usize,
    /// The augmentation budget ran out before the flow was maximal
    pub exhausted: bool,
}

/// Right and down neighbours of each cell, every grid edge once
pub fn grid_edges(gh: usize, gw: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..gh).flat_map(move |y| {
        (0..gw).flat_map(move |x| {
            let i = y * gw + x;
            let right = (x + 1 < gw).then_some((i, i + 1));
            let down = (y + 1 < gh).then_some((i, i + gw));
            right.into_iter().chain(down)
        })
    })
}

/// Energy of a labeling under unary costs and Potts weight `beta`
pub fn labeling_energy(
    labels: &[bool],
    cost0: &[f32],
    cost1: &[f32],
    gh: usize,
    gw: usize,
    beta: f32,
) -> f32 {
    let unary: f32 = labels
        .iter()
        .enumerate()
        .map(|(i, &l)| if l { cost1[i] } else { cost0[i] })
        .sum();
    let pairwise = grid_edges(gh, gw)
        .filter(|&(i, j)| labels[i] != labels[j])
        .count() as f32;
    unary + beta * pairwise
}

/// Minimize the grid energy with at most `budget` augmenting paths
///
/// On budget exhaustion the residual-graph partition is returned as the
/// best labeling found and `exhausted` is set.
///
/// # Panics
///
/// Panics when the cost slices are not `gh * gw` long.
pub fn solve_grid_labeling(
    cost0: &[f32],
    cost1: &[f32],
    gh: usize,
    gw: usize,
    beta: f32,
    budget: usize,
) -> GridCut {
    let n = gh * gw;
    assert_eq!(cost0.len(), n, "cost0 must have one entry per cell");
    assert_eq!(cost1.len(), n, "cost1 must have one entry per cell");

    let (s, t) = (n, n + 1);
    let mut graph = FlowGraph::with_nodes(n + 2);
    for i in 0..n {
        // shift both unaries so capacities are non-negative
        let base = cost0[i].min(cost1[i]);
        let (c0, c1) = (cost0[i] - base, cost1[i] - base);
        if c0 > 0.0 {
            // cut when i lands on the sink side, i.e. label 0
            graph.add_edge(s, i, c0, 0.0);
        }
        if c1 > 0.0 {
            graph.add_edge(i, t, c1, 0.0);
        }
    }
    let beta = beta.max(0.0);
    if beta > 0.0 {
        for (i, j) in grid_edges(gh, gw) {
            graph.add_edge(i, j, beta, beta);
        }
    }

    let (augmentations, exhausted) = graph.max_flow(s, t, budget);
    let side = graph.source_side(s);
    let labels: Vec<bool> = side[..n].to_vec();
    let energy = labeling_energy(&labels, cost0, cost1, gh, gw, beta);

    GridCut {
        labels,
        energy,
        augmentations,
        exhausted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn brute_force(cost0: &[f32], cost1: &[f32], gh: usize, gw: usize, beta: f32) -> f32 {
        let n = gh * gw;
        (0..1u32 << n)
            .map(|bits| {
                let labels: Vec<bool> = (0..n).map(|i| bits >> i & 1 == 1).collect();
                labeling_energy(&labels, cost0, cost1, gh, gw, beta)
            })
            .fold(f32::INFINITY, f32::min)
    }

    #[test]
    fn test_unary_only_picks_cheaper_label() {
        let cut = solve_grid_labeling(&[1.0, 0.0, 2.0], &[0.0, 1.0, 3.0], 1, 3, 0.0, 100);
        assert_eq!(cut.labels, vec![true, false, false]);
        assert!(!cut.exhausted);
        assert_eq!(cut.energy, 2.0);
    }

    #[test]
    fn test_smoothness_flips_isolated_cell() {
        // middle cell prefers 0 slightly, neighbours strongly prefer 1
        let cost0 = [5.0, 0.0, 5.0];
        let cost1 = [0.0, 0.5, 0.0];
        let cut = solve_grid_labeling(&cost0, &cost1, 1, 3, 1.0, 100);
        assert_eq!(cut.labels, vec![true, true, true]);
    }

    #[test]
    fn test_matches_brute_force_on_small_grid() {
        let cost0 = [0.3, 0.9, 0.1, 0.5, 0.7, 0.2, 0.8, 0.4, 0.6];
        let cost1 = [0.6, 0.1, 0.7, 0.4, 0.2, 0.9, 0.1, 0.5, 0.3];
        for beta in [0.0, 0.1, 0.3, 1.0] {
            let cut = solve_grid_labeling(&cost0, &cost1, 3, 3, beta, 1000);
            let best = brute_force(&cost0, &cost1, 3, 3, beta);
            assert!((cut.energy - best).abs() < 1e-4, "beta {beta}: {} vs {best}", cut.energy);
        }
    }

    #[test]
    fn test_zero_budget_flags_exhaustion() {
        let cost0 = [1.0, 1.0];
        let cost1 = [0.5, 2.0];
        let cut = solve_grid_labeling(&cost0, &cost1, 1, 2, 0.1, 0);
        assert!(cut.exhausted);
        assert_eq!(cut.augmentations, 0);
        assert_eq!(cut.labels.len(), 2);
    }

    #[test]
    fn test_grid_edge_count() {
        assert_eq!(grid_edges(3, 4).count(), 3 * 3 + 2 * 4);
        assert_eq!(grid_edges(1, 1).count(), 0);
    }
}
