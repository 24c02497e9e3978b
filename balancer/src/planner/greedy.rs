use std::collections::BTreeMap;

use dirtree::Rank;
use tracing::{debug, instrument, trace};

use super::{BalanceState, PlanInput, PlanTrigger, RebalancePlan, RebalancePlanner};
use crate::config::BalancerConfig;

// matches below this are noise
const MATCH_FLOOR: f64 = 0.001;

/// Matches overloaded ranks with underloaded ones from the heartbeats of an
/// epoch. Every rank runs it on the same table and keeps only its own exports.
pub struct GreedyPlanner {
    min_rebalance: f64,
    hold_epochs: u64,
    min_offload: f64,
    last_epoch_under: BTreeMap<Rank, u64>,
}

impl GreedyPlanner {
    pub fn new(config: &BalancerConfig) -> Self {
        Self {
            min_rebalance: config.min_rebalance,
            hold_epochs: config.hold_epochs,
            min_offload: config.min_offload,
            last_epoch_under: BTreeMap::new(),
        }
    }

    // ranks never seen underloaded count as underloaded in epoch 0
    fn held(&self, rank: Rank, epoch: u64) -> bool {
        let under = self.last_epoch_under.get(&rank).copied().unwrap_or(0);
        under == epoch || epoch.saturating_sub(under) < self.hold_epochs
    }
}

struct Matcher<'a> {
    whoami: Rank,
    target_load: f64,
    loads: &'a BTreeMap<Rank, f64>,
    state: BalanceState,
}

impl Matcher<'_> {
    fn max_export(&self, rank: Rank) -> f64 {
        self.loads[&rank] - self.target_load - self.state.exported.get(&rank).unwrap_or(&0.0)
    }
    fn max_import(&self, rank: Rank) -> f64 {
        self.target_load - self.loads[&rank] - self.state.imported.get(&rank).unwrap_or(&0.0)
    }
    fn try_match(&mut self, exporter: Rank, max_export: f64, importer: Rank, max_import: f64) {
        let amount = max_export.min(max_import);
        if amount < MATCH_FLOOR {
            return;
        }
        trace!(exporter, importer, amount, "Matched");
        *self.state.imported.entry(importer).or_default() += amount;
        *self.state.exported.entry(exporter).or_default() += amount;
        if exporter == self.whoami {
            *self.state.targets.entry(importer).or_default() += amount;
        }
    }
    // walks both lists in order until one side runs dry
    fn pair_up(&mut self, exporters: &[Rank], importers: &[Rank]) {
        let (mut ex, mut im) = (0, 0);
        while ex < exporters.len() && im < importers.len() {
            let max_export = self.max_export(exporters[ex]);
            if max_export < MATCH_FLOOR {
                ex += 1;
                continue;
            }
            let max_import = self.max_import(importers[im]);
            if max_import < MATCH_FLOOR {
                im += 1;
                continue;
            }
            self.try_match(exporters[ex], max_export, importers[im], max_import);
        }
    }
}

impl RebalancePlanner for GreedyPlanner {
    fn name(&self) -> &'static str {
        "greedy"
    }
    fn trigger(&self) -> PlanTrigger {
        PlanTrigger::HeartbeatsComplete
    }

    #[instrument(name = "greedy_plan", skip(self, input), fields(epoch = input.epoch))]
    fn plan(&mut self, input: &PlanInput<'_>) -> RebalancePlan {
        let whoami = input.whoami;
        let epoch = input.epoch;
        let Some(mine) = input.table.load(whoami) else {
            panic!("load table of epoch {epoch} is complete but has no entry for rank {whoami}");
        };
        // bring the generic loads back into meta load units
        let my_load = mine.mds_load(input.load_mode);
        let meta = mine.auth.meta_load();
        let load_fac = if my_load > 0.0 && meta > 0.0 {
            meta / my_load
        } else {
            1.0
        };
        let loads: BTreeMap<Rank, f64> = input
            .table
            .loads()
            .iter()
            .map(|(rank, snapshot)| (*rank, snapshot.mds_load(input.load_mode) * load_fac))
            .collect();
        let total: f64 = loads.values().sum();
        let target_load = total / loads.len() as f64;
        debug!(load_fac, total, target_load, "Rescaled cluster loads");

        for (rank, load) in &loads {
            if *load < target_load * (1.0 + self.min_rebalance) {
                self.last_epoch_under.insert(*rank, epoch);
            }
        }
        if self.held(whoami, epoch) {
            debug!(
                my_load = loads[&whoami],
                target_load, "Underloaded or not overloaded for long enough, doing nothing"
            );
            return RebalancePlan::Idle;
        }

        let by_load = |ranks: &mut Vec<Rank>| {
            ranks.sort_by(|a, b| loads[a].total_cmp(&loads[b]).then(a.cmp(b)));
        };
        let mut importers: Vec<Rank> = loads
            .iter()
            .filter(|(_, load)| **load < target_load)
            .map(|(rank, _)| *rank)
            .collect();
        let mut exporters: Vec<Rank> = loads
            .iter()
            .filter(|(rank, load)| **load >= target_load && !self.held(**rank, epoch))
            .map(|(rank, _)| *rank)
            .collect();
        by_load(&mut importers);
        by_load(&mut exporters);

        let mut matcher = Matcher {
            whoami,
            target_load,
            loads: &loads,
            state: BalanceState::default(),
        };
        for rank in loads.keys() {
            matcher.state.imported.insert(*rank, 0.0);
            matcher.state.exported.insert(*rank, 0.0);
        }

        // give load back to where it came from first
        for exporter in exporters.iter().rev() {
            let Some(import_map) = input.table.import_map(*exporter) else {
                continue;
            };
            for source in import_map.keys() {
                let max_export = matcher.max_export(*exporter);
                if max_export <= MATCH_FLOOR {
                    break;
                }
                if !importers.contains(source) {
                    continue;
                }
                let max_import = matcher.max_import(*source);
                if max_import <= MATCH_FLOOR {
                    continue;
                }
                matcher.try_match(*exporter, max_export, *source, max_import);
            }
        }

        // alternate which exporters go first so the same pairs do not always win
        if epoch % 2 == 1 {
            let big_first: Vec<Rank> = exporters.iter().rev().copied().collect();
            matcher.pair_up(&big_first, &importers);
        } else {
            matcher.pair_up(&exporters, &importers);
        }

        let mut state = matcher.state;
        let min_offload = self.min_offload;
        state.targets.retain(|rank, amount| {
            let keep = *amount >= min_offload;
            if !keep {
                trace!(rank, amount, "Dropped target below min offload");
            }
            keep
        });
        debug!(targets = ?state.targets, "Rebalance targets");
        RebalancePlan::Targets { state, target_load }
    }

    fn handle_rank_failure(&mut self, rank: Rank) {
        if rank == 0 {
            debug!("Rank 0 failed, forgetting underload history");
            self.last_epoch_under.clear();
        }
    }
}
