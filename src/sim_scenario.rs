// Scenario files
//
// A scenario bundles a configuration, run parameters and a schedule of
// network events. The runner drives a controller tick by tick and applies
// events when their tick comes up.

use std::collections::BTreeMap;
use std::path::Path;

use log::{info, warn};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use crate::sim_config::SimConfig;
use crate::sim_controller::SimController;
use crate::sim_error::SimError;
use crate::sim_interface::Tick;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ScenarioFile {
    pub meta: ScenarioMeta,
    pub config: SimConfig,
    pub run: RunSettings,
    pub events: Vec<ScheduledEvent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScenarioMeta {
    pub name: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Ticks to simulate (default: 10000)
    pub ticks: u64,

    /// Worker threads (default: 4)
    pub workers: usize,

    /// Fixed seed; unseeded runs draw from entropy (default: none)
    pub seed: Option<u64>,

    /// How many of the initial nodes keep the full history (default: 1)
    pub full_history_nodes: u64,

    /// Ticks between driver block proposals, 0 disables them (default: 1000)
    pub block_interval_ticks: Tick,

    /// Transactions per proposed block (default: 10 - 500)
    pub block_transactions_min: u64,
    pub block_transactions_max: u64,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            ticks: 10_000,
            workers: 4,
            seed: None,
            full_history_nodes: 1,
            block_interval_ticks: 1000,
            block_transactions_min: 10,
            block_transactions_max: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScheduledEvent {
    pub tick: Tick,
    pub action: ScenarioAction,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioAction {
    /// Bring new nodes online
    AddNodes {
        count: u64,
        #[serde(default)]
        full_history: bool,
    },

    /// Take random live nodes offline
    DropRandomNodes { count: u64 },

    /// Hand a block to a random live node
    ProposeBlock { transactions: u64 },
}

impl ScenarioFile {
    pub fn from_yaml_str(text: &str) -> Result<Self, SimError> {
        let scenario: ScenarioFile = serde_yaml::from_str(text)?;
        scenario.config.validate()?;
        if scenario.run.block_transactions_min > scenario.run.block_transactions_max {
            return Err(SimError::InvalidConfig(
                "block transaction range is inverted".to_string(),
            ));
        }
        Ok(scenario)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, SimError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn name(&self) -> &str {
        self.meta.name.as_deref().unwrap_or("unnamed")
    }
}

/// Summary of a finished run
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub ticks: Tick,
    pub nodes: usize,
    pub links: usize,
    pub proposals: u64,
    pub top_block: u64,
}

pub struct ScenarioRunner {
    scenario: ScenarioFile,
    controller: SimController,
    rng: StdRng,
    schedule: BTreeMap<Tick, Vec<ScenarioAction>>,
    proposals: u64,
}

impl ScenarioRunner {
    pub fn new(scenario: ScenarioFile) -> Result<Self, SimError> {
        let controller = SimController::new(scenario.config.clone())?;
        let rng = match scenario.run.seed {
            Some(seed) => {
                controller.set_seed(seed);
                StdRng::seed_from_u64(seed ^ 0x5eed)
            }
            None => StdRng::from_entropy(),
        };

        let mut schedule: BTreeMap<Tick, Vec<ScenarioAction>> = BTreeMap::new();
        for event in &scenario.events {
            schedule
                .entry(event.tick)
                .or_default()
                .push(event.action.clone());
        }

        Ok(Self {
            scenario,
            controller,
            rng,
            schedule,
            proposals: 0,
        })
    }

    pub fn controller(&self) -> &SimController {
        &self.controller
    }

    /// Populates the network, runs every tick and stops the engine.
    pub fn run(&mut self) -> Result<RunReport, SimError> {
        let run = self.scenario.run.clone();
        info!(
            "running scenario '{}': {} ticks, {} workers",
            self.scenario.name(),
            run.ticks,
            run.workers
        );

        for i in 0..self.scenario.config.nodes {
            self.controller.new_node(i < run.full_history_nodes, None);
        }

        self.controller.start(run.workers)?;
        for tick in 0..run.ticks {
            if let Some(actions) = self.schedule.remove(&tick) {
                for action in actions {
                    self.apply(action);
                }
            }
            if run.block_interval_ticks > 0 && tick > 0 && tick % run.block_interval_ticks == 0 {
                let transactions = self
                    .rng
                    .gen_range(run.block_transactions_min..=run.block_transactions_max);
                self.apply(ScenarioAction::ProposeBlock { transactions });
            }
            self.controller.run_ticks(1)?;
        }
        self.controller.stop();

        Ok(self.report())
    }

    fn apply(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::AddNodes {
                count,
                full_history,
            } => {
                for _ in 0..count {
                    self.controller.new_node(full_history, None);
                }
                info!("tick {}: adding {} nodes", self.controller.current_tick(), count);
            }
            ScenarioAction::DropRandomNodes { count } => {
                let mut ids = self.controller.node_ids();
                ids.shuffle(&mut self.rng);
                for id in ids.into_iter().take(count as usize) {
                    self.controller.drop_node(id);
                }
                info!("tick {}: dropping {} nodes", self.controller.current_tick(), count);
            }
            ScenarioAction::ProposeBlock { transactions } => {
                let proposed = self
                    .controller
                    .pick_random_node_with(&mut self.rng)
                    .and_then(|node| self.controller.propose_block(node, transactions));
                match proposed {
                    Ok(()) => self.proposals += 1,
                    Err(e) => warn!("block proposal skipped: {}", e),
                }
            }
        }
    }

    fn report(&self) -> RunReport {
        let top_block = self
            .controller
            .node_ids()
            .into_iter()
            .filter_map(|id| self.controller.get_node(id).ok())
            .map(|handle| handle.lock().redacted_top())
            .max()
            .unwrap_or(0);

        RunReport {
            ticks: self.controller.current_tick(),
            nodes: self.controller.node_count(),
            links: self.controller.link_count(),
            proposals: self.proposals,
            top_block,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
meta:
  name: small
config:
  nodes: 6
  redacted_window_size: 40
  link_latency_ms_min: 5
  link_latency_ms_max: 20
run:
  ticks: 400
  workers: 2
  seed: 17
  block_interval_ticks: 150
events:
  - tick: 50
    action:
      type: add_nodes
      count: 2
  - tick: 300
    action:
      type: drop_random_nodes
      count: 1
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = ScenarioFile::from_yaml_str(SCENARIO).unwrap();
        assert_eq!(scenario.name(), "small");
        assert_eq!(scenario.config.nodes, 6);
        // unspecified config keeps defaults
        assert_eq!(scenario.config.node_links_outgoing, 4);
        assert_eq!(scenario.run.seed, Some(17));
        assert_eq!(scenario.run.full_history_nodes, 1);
        assert_eq!(
            scenario.events[0].action,
            ScenarioAction::AddNodes {
                count: 2,
                full_history: false
            }
        );
    }

    #[test]
    fn test_empty_scenario_uses_defaults() {
        let scenario = ScenarioFile::from_yaml_str("{}").unwrap();
        assert_eq!(scenario.config, SimConfig::default());
        assert_eq!(scenario.run.ticks, 10_000);
        assert!(scenario.events.is_empty());
    }

    #[test]
    fn test_inverted_block_range_rejected() {
        let result = ScenarioFile::from_yaml_str(
            "run:\n  block_transactions_min: 50\n  block_transactions_max: 5\n",
        );
        assert!(matches!(result, Err(SimError::InvalidConfig(_))));
    }

    #[test]
    fn test_run_applies_schedule() {
        let scenario = ScenarioFile::from_yaml_str(SCENARIO).unwrap();
        let mut runner = ScenarioRunner::new(scenario).unwrap();
        let report = runner.run().unwrap();

        assert_eq!(report.ticks, 400);
        // 6 initial + 2 added - 1 dropped
        assert_eq!(report.nodes, 7);
        assert_eq!(report.proposals, 2);
        assert!(!runner.controller().is_running());
    }
}
