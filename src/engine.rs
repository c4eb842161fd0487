use crate::config::{Config, RunConfig};
use crate::model::{Agent, Counters, Food, State, interact};
use crate::spatial::{nearest_neighbor, nearest_sorted, pair_mut};
use crate::stats::{Accumulator, DataPoint, close_family_ratio, count_groups, group_labels};
use anyhow::{Context, Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

/// Health below which an agent is removed, tolerating rounding around zero.
const DEATH_THRESHOLD: f64 = -1e-5;

/// Simulation engine.
///
/// Holds the configuration, current state, and random number generator,
/// and provides methods to initialize, step, run, save, and load simulations.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    state: State,
    rng: ChaCha12Rng,
}

/// Positions of every entity after a step, as consumed by renderers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub step: u64,
    pub agent_x: Vec<f64>,
    pub food_x: Vec<f64>,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and a random initial state.
    pub fn generate_initial_condition(cfg: Config) -> Result<Self> {
        let mut rng = match cfg.init.seed {
            Some(seed) => ChaCha12Rng::seed_from_u64(seed),
            None => ChaCha12Rng::try_from_os_rng()?,
        };

        let n_agents = cfg.init.n_agents;
        if n_agents == 0 {
            bail!("initial number of agents must be positive");
        }
        let size_factor = cfg.model.pop_density / n_agents as f64;
        let collision_const = cfg.model.global_collision_const * size_factor;
        let speed_scale = size_factor * cfg.model.global_speed_factor;

        let mut agents = Vec::with_capacity(n_agents);
        for id in 0..n_agents as u64 {
            let agt = Agent::random(id, &cfg.model, speed_scale, &mut rng)
                .with_context(|| format!("failed to create agent {id}"))?;
            agents.push(agt);
        }
        agents.sort_by(|a, b| a.x().total_cmp(&b.x()));

        let state = State {
            size_factor,
            collision_const,
            food_target: cfg.init.n_food(),
            agents,
            food: Vec::new(),
            counters: Counters::default(),
            next_id: n_agents as u64,
            n_steps: 0,
            data: Vec::new(),
        };

        let mut engine = Self { cfg, state, rng };
        engine.regenerate_food();

        Ok(engine)
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Copy of the complete simulation state.
    pub fn snapshot(&self) -> State {
        self.state.clone()
    }

    /// Replace the simulation state wholesale. The random number generator is kept.
    pub fn restore(&mut self, state: State) {
        self.state = state;
    }

    /// Run `run_cfg.steps` steps, restarting from the initial snapshot whenever
    /// the population collapses.
    ///
    /// Returns whether an attempt completed and the number of failed attempts.
    pub fn run(&mut self, run_cfg: &RunConfig) -> Result<(bool, usize)> {
        let max_attempts = run_cfg.max_attempts();
        let print_freq = run_cfg.print_freq();
        let snapshot = self.snapshot();

        let mut i_attempt = 0;
        while i_attempt < max_attempts {
            let mut collapsed = false;
            for i_step in 0..run_cfg.steps {
                if !self.step().context("failed to perform step")? {
                    collapsed = true;
                    break;
                }
                if i_step % print_freq == 0 {
                    self.log_progress(i_step, run_cfg.steps);
                }
                if i_step % run_cfg.data_point_freq == 0 {
                    self.record_data_point();
                }
            }

            if !collapsed {
                self.log_progress(run_cfg.steps, run_cfg.steps);
                return Ok((true, i_attempt));
            }

            i_attempt += 1;
            log::warn!(
                "population collapsed after {} steps, restoring snapshot (attempt {i_attempt})",
                self.state.n_steps - snapshot.n_steps
            );
            self.restore(snapshot.clone());
        }

        log::warn!("population collapsed in all {i_attempt} attempts");
        Ok((false, i_attempt))
    }

    /// Advance the simulation by one step.
    ///
    /// Returns `false` without changing the agents if at most one agent is alive.
    pub fn step(&mut self) -> Result<bool> {
        self.state.n_steps += 1;

        if (self.state.food.len() as f64)
            < self.cfg.model.food_fluctuation * self.state.food_target as f64
        {
            self.regenerate_food();
        }

        if self.state.agents.len() <= 1 {
            return Ok(false);
        }

        let Self { cfg, state, rng } = self;
        let model = &cfg.model;

        state.agents.sort_by(|a, b| a.x().total_cmp(&b.x()));
        state.food.sort_by(|a, b| a.x.total_cmp(&b.x));

        let mut food_x: Vec<f64> = state.food.iter().map(|food| food.x).collect();
        let mut food_cursor = 0;
        let mut newborns = Vec::new();

        let n_agents = state.agents.len();
        for i_agt in 0..n_agents {
            // Removals shift later agents down, so the pass may end early.
            if i_agt >= state.agents.len() {
                break;
            }
            let x = state.agents[i_agt].x();

            let d_food = match nearest_sorted(&food_x, x, &mut food_cursor) {
                Some((i_food, d_food)) => {
                    if d_food.abs() < state.collision_const {
                        food_x.remove(i_food);
                        state.food.remove(i_food);
                        state.agents[i_agt].eat(model.food_const, model);
                        state.counters.eaten += 1;
                        food_cursor = food_cursor.saturating_sub(1);
                    }
                    d_food
                }
                None => 1.0,
            };

            let agents = &mut state.agents;
            let (i_nbr, d_agent) = nearest_neighbor(|i| agents[i].x(), i_agt, agents.len())
                .with_context(|| format!("no neighbor for agent {i_agt} of {}", agents.len()))?;

            let (agt, nbr) = pair_mut(agents, i_agt, i_nbr);
            if d_agent.abs() < state.collision_const {
                state.counters.interactions += 1;
                interact(agt, nbr, &mut state.counters, model).with_context(|| {
                    format!("failed to interact agents {} and {}", agt.id(), nbr.id())
                })?;
            }

            let dx = agt
                .think(d_food, d_agent, nbr, model)
                .with_context(|| format!("agent {} failed to think", agt.id()))?;
            agt.move_by(dx, model);
            agt.age(model);
            agt.regulate_health(model);

            if rng.random::<f64>() < agt.breed_chance() && agt.health() > 0.0 && agt.is_mature() {
                let child = agt
                    .breed(state.next_id, &mut *rng)
                    .with_context(|| format!("agent {} failed to breed", agt.id()))?;
                if let Some(child) = child {
                    state.next_id += 1;
                    state.counters.breeds += 1;
                    newborns.push(child);
                }
            }

            if agt.health() < DEATH_THRESHOLD {
                state.agents.remove(i_agt);
                state.counters.kills += 1;
            }
        }

        log::debug!(
            "step {}: {} born, {} agents alive",
            state.n_steps,
            newborns.len(),
            state.agents.len() + newborns.len()
        );
        state.agents.append(&mut newborns);

        Ok(true)
    }

    /// Record aggregate statistics and reset the interval counters.
    pub fn record_data_point(&mut self) {
        let state = &mut self.state;
        let n_agents = state.agents.len();

        let mut mass = Accumulator::new();
        let mut iq = Accumulator::new();
        let mut eq = Accumulator::new();
        let mut breed_mass_div = Accumulator::new();
        let mut breed_chance = Accumulator::new();
        for agt in &state.agents {
            mass.add(agt.mass());
            iq.add(agt.iq() as f64);
            eq.add(agt.eq() as f64);
            breed_mass_div.add(agt.breed_mass_div());
            breed_chance.add(agt.breed_chance());
        }

        let mut sorted: Vec<&Agent> = state.agents.iter().collect();
        sorted.sort_by(|a, b| a.x().total_cmp(&b.x()));
        let sorted_x: Vec<f64> = sorted.iter().map(|agt| agt.x()).collect();
        let members: Vec<_> = sorted.iter().map(|agt| (agt.id(), agt.parent_id())).collect();
        let threshold = state.collision_const * self.cfg.model.group_factor;
        let labels = group_labels(&sorted_x, threshold);

        let per_capita = |count: u64| {
            if n_agents == 0 { 0.0 } else { count as f64 / n_agents as f64 }
        };

        let counters = &mut state.counters;
        state.data.push(DataPoint {
            step: state.n_steps,
            n_agents,
            n_food: state.food.len(),
            mean_mass: mass.mean(),
            eaten: counters.eaten,
            mean_iq: iq.mean(),
            mean_eq: eq.mean(),
            mean_breed_mass_div: breed_mass_div.mean(),
            mean_breed_chance: breed_chance.mean(),
            interactions: counters.interactions,
            fights_per_capita: per_capita(counters.fights),
            helps_per_capita: per_capita(counters.helps),
            ignores_per_capita: per_capita(counters.ignores),
            n_groups: count_groups(&labels),
            close_family_ratio: close_family_ratio(&members, &labels),
        });
        counters.reset_interval();
    }

    /// Iterator performing one step per frame, for at most `steps` frames.
    pub fn frames(&mut self, steps: usize) -> Frames<'_> {
        Frames {
            engine: self,
            i_step: 0,
            steps,
            done: false,
        }
    }

    fn frame(&self) -> Frame {
        Frame {
            step: self.state.n_steps,
            agent_x: self.state.agents.iter().map(Agent::x).collect(),
            food_x: self.state.food.iter().map(|food| food.x).collect(),
        }
    }

    /// Summary of the current population and cumulative counters.
    pub fn summary(&self) -> Summary {
        let mut mass = Accumulator::new();
        let mut speed = Accumulator::new();
        let mut breed_chance = Accumulator::new();
        let mut breed_mass_div = Accumulator::new();
        for agt in &self.state.agents {
            mass.add(agt.mass());
            speed.add(agt.speed());
            breed_chance.add(agt.breed_chance());
            breed_mass_div.add(agt.breed_mass_div());
        }
        Summary {
            breeds: self.state.counters.breeds,
            kills: self.state.counters.kills,
            eaten: self.state.counters.eaten
                + self.state.data.iter().map(|point| point.eaten).sum::<u64>(),
            mean_mass: mass.mean(),
            mean_speed: speed.mean(),
            mean_breed_chance: breed_chance.mean(),
            mean_breed_mass_div: breed_mass_div.mean(),
        }
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize engine")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }

    /// Discard the remaining food and scatter a fresh batch of
    /// `(1 - food_fluctuation) * food_target` items.
    fn regenerate_food(&mut self) {
        let fraction = 1.0 - self.cfg.model.food_fluctuation;
        let n_food = (fraction * self.state.food_target as f64) as usize;
        let food: Vec<Food> = (0..n_food)
            .map(|_| Food {
                x: self.rng.random_range(-1.0..1.0),
            })
            .collect();
        log::debug!("replaced {} food items with {n_food}", self.state.food.len());
        self.state.food = food;
    }

    fn log_progress(&self, i_step: usize, steps: usize) {
        let progress = 100.0 * i_step as f64 / steps as f64;
        log::info!(
            "completed {progress:06.2}% ({i_step} of {steps}) population: {} food: {}",
            self.state.agents.len(),
            self.state.food.len()
        );
    }
}

/// Streaming variant of [`Engine::run`], see [`Engine::frames`].
///
/// Stops after the population collapses or a step fails.
pub struct Frames<'a> {
    engine: &'a mut Engine,
    i_step: usize,
    steps: usize,
    done: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Frame>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.i_step >= self.steps {
            return None;
        }
        match self.engine.step() {
            Ok(true) => {
                if self.i_step % self.engine.cfg.run.data_point_freq == 0 {
                    self.engine.record_data_point();
                }
                self.i_step += 1;
                Some(Ok(self.engine.frame()))
            }
            Ok(false) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error.context("failed to perform step")))
            }
        }
    }
}

/// End-of-run statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Summary {
    pub breeds: u64,
    pub kills: u64,
    pub eaten: u64,
    pub mean_mass: f64,
    pub mean_speed: f64,
    pub mean_breed_chance: f64,
    pub mean_breed_mass_div: f64,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "breed: {} kill: {} eat: {}", self.breeds, self.kills, self.eaten)?;
        writeln!(f, "avg mass: {}", self.mean_mass)?;
        writeln!(f, "avg speed: {}", self.mean_speed)?;
        writeln!(f, "avg breed chance: {}", self.mean_breed_chance)?;
        write!(f, "avg breed mass divider: {}", self.mean_breed_mass_div)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::{TEST_CONFIG, test_config};
    use crate::model::tests::{make_agent, make_breeder};

    fn engine_with(n_agents: usize, n_food: Option<usize>, seed: u64) -> Engine {
        let mut cfg = test_config();
        cfg.init.n_agents = n_agents;
        cfg.init.n_food = n_food;
        cfg.init.seed = Some(seed);
        Engine::generate_initial_condition(cfg).unwrap()
    }

    #[test]
    fn derived_constants_scale_with_population() {
        let engine = engine_with(50, None, 1);
        let state = engine.state();
        assert!((state.size_factor - 100.0 / 50.0).abs() < 1e-12);
        assert!((state.collision_const - 0.005 * state.size_factor).abs() < 1e-12);
        assert_eq!(state.agents.len(), 50);
        assert_eq!(state.food.len(), 125);
        assert_eq!(state.next_id, 50);

        let speed_scale = state.size_factor * engine.cfg().model.global_speed_factor;
        for agt in &state.agents {
            assert!((agt.speed() - speed_scale / agt.mass()).abs() < 1e-15);
        }
    }

    #[test]
    fn same_seed_gives_same_step() {
        let mut engine_a = engine_with(50, None, 9);
        let mut engine_b = engine_with(50, None, 9);
        assert!(engine_a.step().unwrap());
        assert!(engine_b.step().unwrap());

        let summarize = |engine: &Engine| -> Vec<(f64, f64, f64)> {
            let agents = &engine.state().agents;
            agents.iter().map(|agt| (agt.x(), agt.mass(), agt.health())).collect()
        };
        assert_eq!(summarize(&engine_a), summarize(&engine_b));
        assert_eq!(engine_a.state(), engine_b.state());
    }

    #[test]
    fn steps_preserve_mass_cap_and_ids() {
        let mut engine = engine_with(80, None, 3);
        for _ in 0..200 {
            if !engine.step().unwrap() {
                break;
            }
            let state = engine.state();
            for agt in &state.agents {
                assert!(agt.mass() <= agt.final_mass());
                assert!(agt.id() < state.next_id);
                assert!((-1.0..=1.0).contains(&agt.x()));
            }
            let mut ids: Vec<_> = state.agents.iter().map(Agent::id).collect();
            ids.sort_unstable();
            ids.dedup();
            assert_eq!(ids.len(), state.agents.len());
        }
        let counters = &engine.state().counters;
        assert_eq!(
            engine.state().agents.len() as u64,
            80 + counters.breeds - counters.kills
        );
    }

    #[test]
    fn single_agent_population_is_dead() {
        let mut engine = engine_with(1, Some(0), 4);
        let before = engine.snapshot();
        assert!(!engine.step().unwrap());
        assert_eq!(engine.state().agents, before.agents);
    }

    #[test]
    fn scarce_food_is_replaced_by_a_fresh_batch() {
        let mut engine = engine_with(20, Some(100), 5);
        engine.state.food = (0..40).map(|k| Food { x: -0.8 + k as f64 * 0.04 }).collect();
        let old_x: Vec<f64> = engine.state.food.iter().map(|food| food.x).collect();
        engine.step().unwrap();

        let state = engine.state();
        assert_eq!(state.food.len() + state.counters.eaten as usize, 50);
        assert!(state.food.iter().all(|food| !old_x.contains(&food.x)));
    }

    #[test]
    fn food_above_threshold_is_kept() {
        let mut engine = engine_with(20, Some(100), 5);
        engine.state.food = (0..60).map(|k| Food { x: -0.9 + k as f64 * 0.03 }).collect();
        let old_x: Vec<f64> = engine.state.food.iter().map(|food| food.x).collect();
        engine.step().unwrap();

        let state = engine.state();
        assert_eq!(state.food.len() + state.counters.eaten as usize, 60);
        assert!(state.food.iter().all(|food| old_x.contains(&food.x)));
    }

    #[test]
    fn collapsing_population_exhausts_attempts() {
        // Every agent starves to death on its first step.
        let contents = TEST_CONFIG
            .replace("enlb_const = 0.5", "enlb_const = 10.0")
            .replace("enl_const = 1.0", "enl_const = 1000.0");
        let mut cfg = Config::from_toml(&contents).unwrap();
        cfg.init.n_agents = 2;
        cfg.init.n_food = Some(0);
        let run_cfg = RunConfig {
            steps: 10,
            print_freq: None,
            max_attempts: 3,
            data_point_freq: 1,
        };

        let mut engine = Engine::generate_initial_condition(cfg).unwrap();
        let initial = engine.snapshot();
        assert_eq!(engine.run(&run_cfg).unwrap(), (false, 3));

        let state = engine.state();
        assert_eq!(state.agents, initial.agents);
        assert_eq!(state.n_steps, initial.n_steps);
        assert!(state.data.is_empty());
    }

    #[test]
    fn successful_run_records_data_points() {
        let mut engine = engine_with(60, None, 6);
        let run_cfg = RunConfig {
            steps: 30,
            print_freq: Some(10),
            max_attempts: -1,
            data_point_freq: 10,
        };
        assert_eq!(engine.run(&run_cfg).unwrap(), (true, 0));

        let state = engine.state();
        assert_eq!(state.n_steps, 30);
        assert_eq!(state.data.len(), 3);
        let steps: Vec<u64> = state.data.iter().map(|point| point.step).collect();
        assert_eq!(steps, vec![1, 11, 21]);
        assert!(state.data.iter().all(|point| point.n_groups >= 1));
    }

    #[test]
    fn data_point_resets_interval_counters() {
        let mut engine = engine_with(30, None, 7);
        engine.state.counters.fights = 6;
        engine.state.counters.eaten = 4;
        engine.state.counters.kills = 2;
        engine.record_data_point();

        let point = &engine.state().data[0];
        assert!((point.fights_per_capita - 6.0 / 30.0).abs() < 1e-12);
        assert_eq!(point.eaten, 4);
        assert_eq!(point.n_agents, 30);
        let counters = &engine.state().counters;
        assert_eq!((counters.fights, counters.eaten, counters.kills), (0, 0, 2));
    }

    #[test]
    fn frames_stop_at_requested_steps() {
        let mut engine = engine_with(40, None, 8);
        let frames: Vec<Frame> = engine.frames(5).collect::<Result<_>>().unwrap();
        assert_eq!(frames.len(), 5);
        for (i_frame, frame) in frames.iter().enumerate() {
            assert_eq!(frame.step, i_frame as u64 + 1);
        }
        let last = &frames[4];
        assert_eq!(last.agent_x.len(), engine.state().agents.len());
        assert_eq!(last.food_x.len(), engine.state().food.len());
        assert_eq!(engine.state().data.len(), 1);
    }

    #[test]
    fn removal_skips_the_shifted_agent_and_ends_the_pass_early() {
        // Every agent starves to death as soon as it is processed.
        let contents = TEST_CONFIG
            .replace("enlb_const = 0.5", "enlb_const = 10.0")
            .replace("enl_const = 1.0", "enl_const = 1000.0");
        let mut cfg = Config::from_toml(&contents).unwrap();
        cfg.init.n_agents = 3;
        cfg.init.n_food = Some(0);
        let mut engine = Engine::generate_initial_condition(cfg).unwrap();
        engine.state.agents = vec![
            make_agent(0, -0.6, 10.0, 20.0, 0.0),
            make_agent(1, 0.0, 10.0, 20.0, 0.0),
            make_agent(2, 0.6, 10.0, 20.0, 0.0),
        ];
        let before = engine.snapshot();

        assert!(engine.step().unwrap());

        // Agent 0 dies and agent 1 slides into its index, so agent 2 is
        // processed next and the pass ends with agent 1 untouched.
        let state = engine.state();
        assert_eq!(state.agents.len(), 1);
        assert_eq!(state.agents[0], before.agents[1]);
        assert_eq!(state.counters.kills, 2);
        assert!(!engine.step().unwrap());
    }

    #[test]
    fn newborns_do_not_act_in_their_birth_step() {
        let mut cfg = test_config();
        cfg.init.n_agents = 2;
        cfg.init.n_food = Some(0);
        let mut engine = Engine::generate_initial_condition(cfg).unwrap();
        engine.state.agents = vec![
            make_breeder(0, -0.5, 60.0),
            make_agent(1, 0.5, 10.0, 20.0, 0.0),
        ];
        engine.state.next_id = 2;

        assert!(engine.step().unwrap());

        let state = engine.state();
        assert_eq!(state.agents.len(), 3);
        assert_eq!((state.counters.breeds, state.next_id), (1, 2 + 1));

        let parent = &state.agents[0];
        let child = &state.agents[2];
        assert_eq!(child.id(), 2);
        assert_eq!(child.parent_id(), Some(parent.id()));
        assert!((child.x() - parent.x()).abs() <= 0.001);
        assert_eq!(child.energy(), child.mass());
        assert_eq!(child.health(), child.mass());
    }

    #[test]
    fn restore_rewinds_state() {
        let mut engine = engine_with(40, None, 10);
        let snapshot = engine.snapshot();
        engine.step().unwrap();
        assert_ne!(engine.state(), &snapshot);
        engine.restore(snapshot.clone());
        assert_eq!(engine.state(), &snapshot);
    }

    #[test]
    fn summary_reports_population_means() {
        let engine = engine_with(10, None, 11);
        let summary = engine.summary();
        let n = engine.state().agents.len() as f64;
        let mean_mass = engine.state().agents.iter().map(Agent::mass).sum::<f64>() / n;
        assert!((summary.mean_mass - mean_mass).abs() < 1e-9);
        assert!(summary.to_string().starts_with("breed: 0 kill: 0 eat: 0"));
    }
}
