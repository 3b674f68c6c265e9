//! Proportional tablet balancer.
//!
//! The cell-biased shuffle gives each router a local-first view, which is
//! right when routers and tablets are spread evenly. When they are not, a
//! cell with many routers and few tablets overloads its local tablets. The
//! balancer replaces the shuffle for opted-in keyspaces with a globally
//! aware allocation: it knows which cells contain peer routers, and it
//! spreads each router's outflow so that every tablet in the fleet receives
//! the same absolute load.
//!
//! Allocation model, in abstract flow units:
//!
//! - every tablet should receive `ALLOCATION / total_tablets`,
//! - every router cell emits `ALLOCATION / num_vtgate_cells`,
//! - each router cell first fills its own cell's tablets up to their fair
//!   inflow, then spills the remainder across other cells' residual
//!   capacity proportionally.
//!
//! `pick` draws a weighted-random candidate using this router's flow row;
//! the result is used verbatim, with no locality re-shuffle on top. State is
//! per target and rebuilt lazily whenever the candidate set changes.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;

use shrike_common::types::Target;

use crate::health::TabletHealth;

/// Total abstract flow units distributed across the fleet per target.
const ALLOCATION: u64 = 1_000_000;

/// Flow assignment for one target, from this router's point of view.
#[derive(Debug, Clone, Serialize)]
pub struct TargetAllocation {
    #[serde(skip)]
    tablet_set_hash: u64,
    pub total_tablets: usize,
    /// Tablet count per cell.
    pub tablets_by_cell: BTreeMap<String, usize>,
    /// Flow units this router's cell sends to each tablet cell.
    pub outflow_by_cell: BTreeMap<String, u64>,
}

/// Serializable dump for the debug endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BalancerSnapshot {
    pub local_cell: String,
    pub vtgate_cells: Vec<String>,
    pub allocations: BTreeMap<String, TargetAllocation>,
}

pub struct TabletBalancer {
    local_cell: String,
    vtgate_cells: Vec<String>,
    allocations: Mutex<HashMap<String, TargetAllocation>>,
}

impl TabletBalancer {
    pub fn new(local_cell: impl Into<String>, vtgate_cells: Vec<String>) -> Self {
        let mut vtgate_cells = vtgate_cells;
        vtgate_cells.sort();
        vtgate_cells.dedup();
        Self {
            local_cell: local_cell.into(),
            vtgate_cells,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    /// Choose one candidate with probability proportional to this router's
    /// flow toward the candidate's cell. Returns `None` only for an empty
    /// candidate list.
    pub fn pick(&self, target: &Target, candidates: &[TabletHealth]) -> Option<TabletHealth> {
        if candidates.is_empty() {
            return None;
        }

        let set_hash = tablet_set_hash(candidates);
        let weights: Vec<u64> = {
            let mut allocations = self.allocations.lock();
            let alloc = allocations
                .entry(target.status_key())
                .or_insert_with(|| self.build_allocation(set_hash, candidates));
            if alloc.tablet_set_hash != set_hash {
                *alloc = self.build_allocation(set_hash, candidates);
            }
            candidates
                .iter()
                .map(|t| {
                    let cell = t.cell();
                    let flow = alloc.outflow_by_cell.get(cell).copied().unwrap_or(0);
                    let count = alloc.tablets_by_cell.get(cell).copied().unwrap_or(1).max(1);
                    flow / count as u64
                })
                .collect()
        };

        let total: u64 = weights.iter().sum();
        let mut rng = rand::thread_rng();
        if total == 0 {
            // This router's cell is not in the configured vtgate cells, so
            // no flow row exists for it. Degrade to uniform rather than
            // refusing traffic.
            return Some(candidates[rng.gen_range(0..candidates.len())].clone());
        }
        let mut draw = rng.gen_range(0..total);
        for (tablet, weight) in candidates.iter().zip(&weights) {
            if draw < *weight {
                return Some(tablet.clone());
            }
            draw -= *weight;
        }
        Some(candidates[candidates.len() - 1].clone())
    }

    /// Water-filling flow assignment. Computes every router cell's row and
    /// keeps the one for this router's cell.
    fn build_allocation(&self, set_hash: u64, tablets: &[TabletHealth]) -> TargetAllocation {
        let mut tablets_by_cell: BTreeMap<String, usize> = BTreeMap::new();
        for t in tablets {
            *tablets_by_cell.entry(t.cell().to_string()).or_default() += 1;
        }
        let total = tablets.len() as u64;

        // Fair inflow capacity of each tablet cell.
        let mut capacity: BTreeMap<String, u64> = tablets_by_cell
            .iter()
            .map(|(cell, n)| (cell.clone(), ALLOCATION * *n as u64 / total))
            .collect();

        let per_router_cell = ALLOCATION / self.vtgate_cells.len().max(1) as u64;
        let mut flows: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        let mut leftover: BTreeMap<String, u64> = BTreeMap::new();

        // Phase 1: every router cell fills its own tablets first.
        for vc in &self.vtgate_cells {
            let mut out = per_router_cell;
            if let Some(cap) = capacity.get_mut(vc) {
                let take = out.min(*cap);
                *cap -= take;
                out -= take;
                if take > 0 {
                    flows.entry(vc.clone()).or_default().insert(vc.clone(), take);
                }
            }
            if out > 0 {
                leftover.insert(vc.clone(), out);
            }
        }

        // Phase 2: spill remainders across residual capacity, proportional
        // to what each cell still accepts.
        for (vc, mut out) in leftover {
            let remaining: u64 = capacity.values().sum();
            if remaining == 0 {
                break;
            }
            let shares: Vec<(String, u64)> = capacity
                .iter()
                .filter(|(_, cap)| **cap > 0)
                .map(|(cell, cap)| (cell.clone(), out * *cap / remaining))
                .collect();
            for (cell, share) in shares {
                let Some(cap) = capacity.get_mut(&cell) else { continue };
                let take = share.min(*cap).min(out);
                *cap -= take;
                out -= take;
                if take > 0 {
                    *flows.entry(vc.clone()).or_default().entry(cell).or_default() += take;
                }
            }
            // Flooring can leave a few units; dump them into the first cell
            // that still has room.
            if out > 0 {
                for (cell, cap) in capacity.iter_mut() {
                    if *cap > 0 {
                        let take = out.min(*cap);
                        *cap -= take;
                        *flows
                            .entry(vc.clone())
                            .or_default()
                            .entry(cell.clone())
                            .or_default() += take;
                        break;
                    }
                }
            }
        }

        TargetAllocation {
            tablet_set_hash: set_hash,
            total_tablets: tablets.len(),
            tablets_by_cell,
            outflow_by_cell: flows.remove(&self.local_cell).unwrap_or_default(),
        }
    }

    /// Current allocations for the debug endpoint.
    pub fn snapshot(&self) -> BalancerSnapshot {
        BalancerSnapshot {
            local_cell: self.local_cell.clone(),
            vtgate_cells: self.vtgate_cells.clone(),
            allocations: self
                .allocations
                .lock()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

fn tablet_set_hash(tablets: &[TabletHealth]) -> u64 {
    let mut aliases: Vec<String> = tablets.iter().map(|t| t.alias_string()).collect();
    aliases.sort();
    let mut h = DefaultHasher::new();
    aliases.hash(&mut h);
    h.finish()
}
