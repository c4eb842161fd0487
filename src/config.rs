use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub init: InitConfig,
    pub run: RunConfig,
}

/// Constants of the agent and world model.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Energy spent per hidden neuron when thinking or interacting.
    pub int_const: f64,
    /// Energy spent per unit of displacement.
    pub mov_const: f64,
    /// Energy-to-mass ratio below which an agent starves.
    pub enlb_const: f64,
    /// Energy-to-mass ratio above which an agent regenerates (and grows when eating).
    pub engb_const: f64,
    /// Health lost per step while starving.
    pub enl_const: f64,
    /// Health gained per step while thriving.
    pub eng_const: f64,
    /// Nominal life span, used to resolve an automatic aging constant.
    pub max_life_span: f64,
    /// Health lost per step by adult agents.
    pub age_const: AgeConst,
    /// Reference population density (agents per unit of size factor).
    pub pop_density: f64,
    /// Fraction of the final mass at which aging starts.
    pub aging_time: f64,
    pub global_speed_factor: f64,
    /// Energy (or mass) contained in a single food item.
    pub food_const: f64,
    /// Fraction of the final mass initial agents start with.
    pub start_mass_fraction: f64,
    pub global_collision_const: f64,
    pub min_iq: usize,
    pub max_iq: usize,
    pub min_eq: usize,
    pub max_eq: usize,
    /// Fraction of the food target below which food is replenished.
    pub food_fluctuation: f64,
    /// Multiple of the collision distance that still joins two agents in a group.
    pub group_factor: f64,
    /// Sign convention of the movement energy cost.
    #[serde(default)]
    pub move_cost: MoveCost,
}

/// Aging constant, either a literal value or `"auto"`.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgeConst {
    Value(f64),
    Keyword(String),
}

/// How displacement is charged to an agent's energy.
#[derive(Debug, Default, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MoveCost {
    /// `mov_const * dx`: moving towards -1 refunds energy.
    #[default]
    Signed,
    /// `mov_const * |dx|`.
    Absolute,
}

/// Initial condition parameters.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct InitConfig {
    /// Initial number of agents.
    pub n_agents: usize,
    /// Target number of food items (defaults to five per agent).
    pub n_food: Option<usize>,
    /// Seed of the random number generator (random if absent).
    pub seed: Option<u64>,
}

/// Parameters of a single call to [`crate::engine::Engine::run`].
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Number of steps per attempt.
    pub steps: usize,
    /// Number of steps between progress messages (defaults to 1% of the steps).
    pub print_freq: Option<usize>,
    /// Maximum number of attempts, -1 meaning unbounded.
    pub max_attempts: i64,
    /// Number of steps between recorded data points.
    pub data_point_freq: usize,
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a [`Config`] from a TOML string.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.model.validate().context("invalid model parameters")?;
        self.init.validate().context("invalid initial parameters")?;
        self.run.validate().context("invalid run parameters")?;
        Ok(())
    }
}

impl ModelConfig {
    /// Health lost per aging step, resolving `"auto"` to `eng_const - 100 / max_life_span`.
    pub fn age_const(&self) -> f64 {
        match self.age_const {
            AgeConst::Value(value) => value,
            AgeConst::Keyword(_) => self.eng_const - 100.0 / self.max_life_span,
        }
    }

    fn validate(&self) -> Result<()> {
        check_num(self.int_const, 0.0..).context("invalid thinking cost")?;
        check_num(self.mov_const, 0.0..).context("invalid movement cost")?;
        check_num(self.enlb_const, 0.0..).context("invalid starvation bound")?;
        check_num(self.engb_const, 0.0..).context("invalid thriving bound")?;
        check_num(self.enl_const, 0.0..).context("invalid starvation health loss")?;
        check_num(self.eng_const, 0.0..).context("invalid thriving health gain")?;
        check_num(self.max_life_span, 1.0..).context("invalid maximum life span")?;
        if let AgeConst::Keyword(keyword) = &self.age_const {
            if keyword != "auto" {
                bail!("invalid aging constant: must be a number or \"auto\", but is {keyword:?}");
            }
        }
        check_num(self.pop_density, 1e-9..).context("invalid population density")?;
        check_num(self.aging_time, 0.0..=1.0).context("invalid aging time")?;
        check_num(self.global_speed_factor, 0.0..).context("invalid global speed factor")?;
        check_num(self.food_const, 0.0..).context("invalid food constant")?;
        check_num(self.start_mass_fraction, 1e-9..=1.0).context("invalid start mass fraction")?;
        check_num(self.global_collision_const, 0.0..)
            .context("invalid global collision constant")?;
        check_num(self.min_iq, 1..1_000).context("invalid minimum iq")?;
        check_num(self.max_iq, self.min_iq + 1..=1_000).context("invalid maximum iq")?;
        check_num(self.min_eq, 1..1_000).context("invalid minimum eq")?;
        check_num(self.max_eq, self.min_eq + 1..=1_000).context("invalid maximum eq")?;
        check_num(self.food_fluctuation, 0.0..=1.0).context("invalid food fluctuation")?;
        check_num(self.group_factor, 0.0..).context("invalid group factor")?;
        Ok(())
    }
}

impl InitConfig {
    /// Target number of food items.
    pub fn n_food(&self) -> usize {
        self.n_food.unwrap_or(5 * self.n_agents)
    }

    fn validate(&self) -> Result<()> {
        check_num(self.n_agents, 1..1_000_000).context("invalid initial number of agents")?;
        check_num(self.n_food(), 0..10_000_000).context("invalid number of food items")?;
        Ok(())
    }
}

impl RunConfig {
    /// Number of steps between progress messages.
    pub fn print_freq(&self) -> usize {
        self.print_freq.unwrap_or(self.steps / 100).max(1)
    }

    /// Maximum number of attempts, with -1 mapped to an effectively unbounded count.
    pub fn max_attempts(&self) -> usize {
        usize::try_from(self.max_attempts).unwrap_or(usize::MAX)
    }

    fn validate(&self) -> Result<()> {
        check_num(self.steps, 1..1_000_000_000).context("invalid number of steps")?;
        if let Some(print_freq) = self.print_freq {
            check_num(print_freq, 1..).context("invalid print frequency")?;
        }
        if self.max_attempts != -1 {
            check_num(self.max_attempts, 1..).context("invalid maximum number of attempts")?;
        }
        check_num(self.data_point_freq, 1..).context("invalid data point frequency")?;
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}
