use crate::config::{ModelConfig, MoveCost};
use crate::nn::Network;
use crate::spatial::{fold_position, map_range};
use crate::stats::DataPoint;
use anyhow::{Context, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Output threshold above which a social network output counts as a decision.
const URGE_THRESHOLD: f64 = 0.5;

/// Agent of the simulation.
///
/// Moves on the ring under the control of its movement network and decides
/// whether to fight or help its neighbours with its social network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    id: u64,
    parent_id: Option<u64>,

    x: f64,
    mass: f64,
    final_mass: f64,
    energy: f64,
    health: f64,
    speed: f64,
    /// `size_factor * global_speed_factor`, divided by the mass to obtain the speed.
    speed_scale: f64,

    iq: usize,
    eq: usize,
    breed_mass_div: f64,
    breed_chance: f64,

    move_net: Network,
    social_net: Network,
}

impl Agent {
    /// Create an agent of the initial population with random traits.
    pub fn random<R: Rng + ?Sized>(
        id: u64,
        model: &ModelConfig,
        speed_scale: f64,
        rng: &mut R,
    ) -> Result<Self> {
        let iq = rng.random_range(model.min_iq..model.max_iq);
        let eq = rng.random_range(model.min_eq..model.max_eq);
        let final_mass = rng.random_range(1..100) as f64;
        let mass = (final_mass * model.start_mass_fraction).ceil();
        let x = rng.random_range(-1.0..1.0);
        let breed_mass_div = rng.random::<f64>();
        let breed_chance = rng.random::<f64>();

        let move_net =
            Network::new(&move_topology(iq), rng).context("failed to create movement network")?;
        let social_net =
            Network::new(&social_topology(eq), rng).context("failed to create social network")?;

        Ok(Self {
            id,
            parent_id: None,
            x,
            mass,
            final_mass: final_mass.max(mass),
            energy: mass,
            health: mass,
            speed: speed_scale / mass,
            speed_scale,
            iq,
            eq,
            breed_mass_div,
            breed_chance,
            move_net,
            social_net,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }

    pub fn x(&self) -> f64 {
        self.x
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    #[cfg(test)]
    pub fn final_mass(&self) -> f64 {
        self.final_mass
    }

    #[cfg(test)]
    pub fn energy(&self) -> f64 {
        self.energy
    }

    pub fn health(&self) -> f64 {
        self.health
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    pub fn iq(&self) -> usize {
        self.iq
    }

    pub fn eq(&self) -> usize {
        self.eq
    }

    pub fn breed_mass_div(&self) -> f64 {
        self.breed_mass_div
    }

    pub fn breed_chance(&self) -> f64 {
        self.breed_chance
    }

    /// Whether the agent has grown to its final mass.
    pub fn is_mature(&self) -> bool {
        self.mass >= self.final_mass
    }

    /// Adult agents lose health every step.
    pub fn age(&mut self, model: &ModelConfig) {
        if self.mass > self.final_mass * model.aging_time {
            self.health -= model.age_const();
        }
    }

    /// Decide a velocity from the distances to the nearest food and agent.
    ///
    /// Costs `iq * int_const` energy. The position is not updated.
    pub fn think(
        &mut self,
        d_food: f64,
        d_agent: f64,
        nearest: &Agent,
        model: &ModelConfig,
    ) -> Result<f64> {
        let input = [
            map_range(d_food, (-1.0, 1.0), (0.0, 1.0)),
            map_range(d_agent, (-1.0, 1.0), (0.0, 1.0)),
            indicator(nearest.mass > self.mass),
        ];
        let output = self
            .move_net
            .feed_forward(&input)
            .context("failed to feed movement network")?;
        self.energy -= self.iq as f64 * model.int_const;
        Ok(map_range(output[0], (0.0, 1.0), (-self.speed, self.speed)))
    }

    /// Displace the agent by `dx` along the ring and pay for it.
    pub fn move_by(&mut self, dx: f64, model: &ModelConfig) {
        self.x = fold_position(self.x + dx);
        self.energy -= match model.move_cost {
            MoveCost::Signed => model.mov_const * dx,
            MoveCost::Absolute => model.mov_const * dx.abs(),
        };
    }

    /// Eat `food`: a well-fed growing agent turns it into mass, otherwise into energy.
    pub fn eat(&mut self, food: f64, model: &ModelConfig) {
        if self.mass < self.final_mass && self.energy / self.mass > model.engb_const {
            self.mass = (self.mass + food).min(self.final_mass);
            self.speed = self.speed_scale / self.mass;
        } else {
            self.energy += food;
        }
    }

    /// Starving agents lose health, thriving agents regenerate it.
    pub fn regulate_health(&mut self, model: &ModelConfig) {
        if self.energy < model.enlb_const * self.mass {
            self.health -= model.enl_const;
        }
        if self.energy > model.engb_const * self.mass {
            self.health += model.eng_const;
        }
    }

    /// Give birth to a mutated child whose mass is carved out of this agent.
    ///
    /// Returns `None` if the agent dies in childbirth, in which case its
    /// health is set to -1.
    pub fn breed<R: Rng + ?Sized>(&mut self, child_id: u64, rng: &mut R) -> Result<Option<Agent>> {
        let mut move_net = self.move_net.clone();
        move_net.mutate(rng).context("failed to mutate movement network")?;
        let mut social_net = self.social_net.clone();
        social_net.mutate(rng).context("failed to mutate social network")?;

        let spawn_mass =
            ((self.mass + rng.random_range(-10..10) as f64) * self.breed_mass_div).ceil();
        self.health -= spawn_mass;
        self.mass -= spawn_mass;
        if self.health <= 0.0 || self.mass < 1.0 || spawn_mass < 1.0 {
            self.health = -1.0;
            return Ok(None);
        }

        let x = fold_position(self.x + rng.random_range(-0.001..0.001));
        let breed_mass_div = self.breed_mass_div + rng.random_range(-0.01..0.01);
        let breed_chance = self.breed_chance + rng.random_range(-0.01..0.01);
        let final_mass = (spawn_mass / self.breed_mass_div).ceil().max(spawn_mass);

        let child = Agent {
            id: child_id,
            parent_id: Some(self.id),
            x,
            mass: spawn_mass,
            final_mass,
            energy: spawn_mass,
            health: spawn_mass,
            speed: self.speed_scale / spawn_mass,
            speed_scale: self.speed_scale,
            iq: self.iq,
            eq: self.eq,
            breed_mass_div,
            breed_chance,
            move_net,
            social_net,
        };
        Ok(Some(child))
    }

    fn social_urges(&self, other: &Agent, close_family: bool) -> Result<(f64, f64)> {
        let input = [
            indicator(close_family),
            self.energy / self.mass,
            other.energy / other.mass,
            indicator(self.mass > other.mass),
        ];
        let output = self
            .social_net
            .feed_forward(&input)
            .context("failed to feed social network")?;
        Ok((output[0], output[1]))
    }
}

/// Movement network layout for a given iq.
pub fn move_topology(iq: usize) -> Vec<usize> {
    if iq == 1 { vec![3, 1] } else { vec![3, iq, iq, 1] }
}

/// Social network layout for a given eq.
pub fn social_topology(eq: usize) -> Vec<usize> {
    if eq == 1 { vec![4, 1, 2] } else { vec![4, eq, eq, 2] }
}

fn indicator(flag: bool) -> f64 {
    if flag { 1.0 } else { 0.0 }
}

/// Whether one agent is the direct parent of the other.
pub fn is_close_family(a1: &Agent, a2: &Agent) -> bool {
    a1.parent_id == Some(a2.id) || a2.parent_id == Some(a1.id)
}

/// Both agents take damage equal to the other's mass and absorb it as energy.
pub fn fight(a1: &mut Agent, a2: &mut Agent) {
    let (m1, m2) = (a1.mass, a2.mass);
    a1.health -= m2;
    a2.health -= m1;
    a1.energy += m2;
    a2.energy += m1;
}

/// Let two touching agents decide, through their social networks, whether to fight or help.
///
/// The ignore counter only tracks the second agent declining to help.
pub fn interact(
    a1: &mut Agent,
    a2: &mut Agent,
    counters: &mut Counters,
    model: &ModelConfig,
) -> Result<()> {
    a1.energy -= a1.eq as f64 * model.int_const;
    a2.energy -= a2.eq as f64 * model.int_const;

    let close_family = is_close_family(a1, a2);
    let (fight_1, help_1) = a1.social_urges(a2, close_family)?;
    let (fight_2, help_2) = a2.social_urges(a1, close_family)?;

    if fight_1 > URGE_THRESHOLD || fight_2 > URGE_THRESHOLD {
        fight(a1, a2);
        counters.fights += 1;
    }
    if help_1 > URGE_THRESHOLD {
        a1.energy -= model.food_const;
        a2.energy += model.food_const;
        counters.helps += 1;
    }
    if help_2 > URGE_THRESHOLD {
        a1.energy += model.food_const;
        a2.energy -= model.food_const;
        counters.helps += 1;
    } else {
        counters.ignores += 1;
    }

    Ok(())
}

/// Food item, defined only by its position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Food {
    pub x: f64,
}

/// Event counters.
///
/// `breeds` and `kills` are cumulative; the others are reset at every data point.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Counters {
    pub breeds: u64,
    pub kills: u64,
    pub eaten: u64,
    pub interactions: u64,
    pub fights: u64,
    pub helps: u64,
    pub ignores: u64,
}

impl Counters {
    pub fn reset_interval(&mut self) {
        self.eaten = 0;
        self.interactions = 0;
        self.fights = 0;
        self.helps = 0;
        self.ignores = 0;
    }
}

/// Complete state of the simulation.
///
/// Restoring a clone of this value rewinds the simulation wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// Normalization constant `pop_density / n_agents_init`.
    pub size_factor: f64,
    /// Distance below which two entities touch.
    pub collision_const: f64,
    /// Number of food items maintained in the world.
    pub food_target: usize,

    pub agents: Vec<Agent>,
    pub food: Vec<Food>,

    pub counters: Counters,
    pub next_id: u64,
    /// Total number of steps performed.
    pub n_steps: u64,

    /// Recorded data points.
    pub data: Vec<DataPoint>,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rand::SeedableRng;
    use rand_chacha::ChaCha12Rng;

    /// Agent with deterministic state and constant networks.
    pub(crate) fn make_agent(id: u64, x: f64, mass: f64, final_mass: f64, net_value: f64) -> Agent {
        Agent {
            id,
            parent_id: None,
            x,
            mass,
            final_mass,
            energy: mass,
            health: mass,
            speed: 0.01 / mass,
            speed_scale: 0.01,
            iq: 2,
            eq: 2,
            breed_mass_div: 0.5,
            breed_chance: 0.5,
            move_net: Network::constant(&move_topology(2), net_value),
            social_net: Network::constant(&social_topology(2), net_value),
        }
    }

    /// Mature agent certain to attempt breeding, with plenty of health to survive it.
    pub(crate) fn make_breeder(id: u64, x: f64, mass: f64) -> Agent {
        let mut agt = make_agent(id, x, mass, mass, 0.0);
        agt.health = 1_000.0;
        agt.breed_chance = 1.0;
        agt
    }

    #[test]
    fn random_agents_respect_mass_cap_and_trait_bounds() {
        let cfg = test_config();
        let mut rng = ChaCha12Rng::seed_from_u64(7);
        for id in 0..100 {
            let agt = Agent::random(id, &cfg.model, 0.01, &mut rng).unwrap();
            assert!(agt.mass() >= 1.0 && agt.mass() <= agt.final_mass());
            assert!((cfg.model.min_iq..cfg.model.max_iq).contains(&agt.iq()));
            assert!((cfg.model.min_eq..cfg.model.max_eq).contains(&agt.eq()));
            assert!((-1.0..1.0).contains(&agt.x()));
            assert_eq!(agt.energy(), agt.mass());
            assert_eq!(agt.health(), agt.mass());
            assert_eq!(agt.move_net.n_inputs(), 3);
            assert_eq!(agt.social_net.n_inputs(), 4);
        }
    }

    #[test]
    fn unit_width_drops_duplicate_hidden_layer() {
        assert_eq!(move_topology(1), vec![3, 1]);
        assert_eq!(move_topology(4), vec![3, 4, 4, 1]);
        assert_eq!(social_topology(1), vec![4, 1, 2]);
        assert_eq!(social_topology(3), vec![4, 3, 3, 2]);
    }

    #[test]
    fn aging_only_affects_adults() {
        let cfg = test_config();
        let mut young = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        young.age(&cfg.model);
        assert_eq!(young.health(), 10.0);

        let mut adult = make_agent(1, 0.0, 18.0, 20.0, 0.0);
        adult.age(&cfg.model);
        assert!((adult.health() - (18.0 - cfg.model.age_const())).abs() < 1e-12);
    }

    #[test]
    fn think_maps_output_to_speed_range_and_costs_energy() {
        let cfg = test_config();
        let mut agt = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        let other = make_agent(1, 0.1, 5.0, 20.0, 0.0);
        // Zero weights give a sigmoid output of exactly one half, i.e. no movement.
        let dx = agt.think(0.2, 0.1, &other, &cfg.model).unwrap();
        assert!(dx.abs() < 1e-12);
        assert!((agt.energy() - (10.0 - 2.0 * cfg.model.int_const)).abs() < 1e-12);

        let mut eager = make_agent(2, 0.0, 10.0, 20.0, 10.0);
        let dx = eager.think(0.2, 0.1, &other, &cfg.model).unwrap();
        assert!(dx > 0.0 && dx <= eager.speed());
    }

    #[test]
    fn move_cost_sign_follows_config() {
        let mut cfg = test_config();
        let mut agt = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        agt.move_by(-0.5, &cfg.model);
        assert_eq!(agt.x(), -0.5);
        assert!(agt.energy() > 10.0);

        cfg.model.move_cost = MoveCost::Absolute;
        let mut agt = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        agt.move_by(-0.5, &cfg.model);
        assert!((agt.energy() - (10.0 - 0.5 * cfg.model.mov_const)).abs() < 1e-12);
    }

    #[test]
    fn move_wraps_around_the_ring() {
        let cfg = test_config();
        let mut agt = make_agent(0, 0.95, 10.0, 20.0, 0.0);
        agt.move_by(0.1, &cfg.model);
        assert!((agt.x() - -0.05).abs() < 1e-12);
    }

    #[test]
    fn well_fed_agents_grow_up_to_final_mass() {
        let cfg = test_config();
        let mut agt = make_agent(0, 0.0, 10.0, 12.0, 0.0);
        agt.energy = 100.0;
        agt.eat(cfg.model.food_const, &cfg.model);
        assert_eq!(agt.mass(), 12.0);
        assert_eq!(agt.energy(), 100.0);
        assert!((agt.speed() - agt.speed_scale / 12.0).abs() < 1e-15);

        // Once mature, food becomes energy.
        agt.eat(cfg.model.food_const, &cfg.model);
        assert_eq!(agt.mass(), 12.0);
        assert_eq!(agt.energy(), 100.0 + cfg.model.food_const);
    }

    #[test]
    fn hungry_agents_store_food_as_energy() {
        let cfg = test_config();
        let mut agt = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        agt.eat(cfg.model.food_const, &cfg.model);
        assert_eq!(agt.mass(), 10.0);
        assert_eq!(agt.energy(), 10.0 + cfg.model.food_const);
    }

    #[test]
    fn starvation_and_regeneration_are_independent() {
        let cfg = test_config();
        let mut starving = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        starving.energy = 1.0;
        starving.regulate_health(&cfg.model);
        assert_eq!(starving.health(), 10.0 - cfg.model.enl_const);

        let mut thriving = make_agent(1, 0.0, 10.0, 20.0, 0.0);
        thriving.energy = 100.0;
        thriving.regulate_health(&cfg.model);
        assert_eq!(thriving.health(), 10.0 + cfg.model.eng_const);
    }

    #[test]
    fn breeding_conserves_mass() {
        let mut rng = ChaCha12Rng::seed_from_u64(11);
        let mut n_children = 0;
        for id in 0..50 {
            let mut parent = make_agent(id, 0.3, 60.0, 60.0, 0.2);
            parent.health = 1_000.0;
            let child = parent.breed(1_000 + id, &mut rng).unwrap();
            let Some(child) = child else { continue };
            n_children += 1;

            assert!((parent.mass() + child.mass() - 60.0).abs() < 1e-12);
            assert_eq!(child.parent_id(), Some(id));
            assert_eq!(child.id(), 1_000 + id);
            assert_eq!((child.iq(), child.eq()), (parent.iq(), parent.eq()));
            assert!(child.mass() <= child.final_mass());
            assert_eq!(child.final_mass(), (child.mass() / 0.5).ceil());
            assert!((child.x() - 0.3).abs() <= 0.001);
            assert!((child.breed_mass_div() - 0.5).abs() <= 0.01);
            assert!((child.breed_chance() - 0.5).abs() <= 0.01);
            assert_ne!(child.move_net, parent.move_net);
            assert_ne!(child.social_net, parent.social_net);
            assert!(is_close_family(&parent, &child));
        }
        assert!(n_children > 0);
    }

    #[test]
    fn fatal_childbirth_kills_parent() {
        let mut rng = ChaCha12Rng::seed_from_u64(12);
        for id in 0..20 {
            let mut parent = make_agent(id, 0.0, 2.0, 2.0, 0.0);
            parent.health = 0.5;
            parent.breed_mass_div = 0.99;
            let child = parent.breed(100 + id, &mut rng).unwrap();
            assert!(child.is_none());
            assert_eq!(parent.health(), -1.0);
        }
    }

    #[test]
    fn fight_is_symmetric_in_mass() {
        let mut a1 = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        let mut a2 = make_agent(1, 0.0, 4.0, 20.0, 0.0);
        fight(&mut a1, &mut a2);
        assert_eq!((a1.health(), a1.energy()), (6.0, 14.0));
        assert_eq!((a2.health(), a2.energy()), (-6.0, 14.0));
    }

    #[test]
    fn eager_agents_fight_and_help_each_other() {
        let cfg = test_config();
        let mut a1 = make_agent(0, 0.0, 10.0, 20.0, 10.0);
        let mut a2 = make_agent(1, 0.0, 10.0, 20.0, 10.0);
        let mut counters = Counters::default();
        interact(&mut a1, &mut a2, &mut counters, &cfg.model).unwrap();
        assert_eq!((counters.fights, counters.helps, counters.ignores), (1, 2, 0));
        assert_eq!(a1.health(), 0.0);
        assert!((a1.energy() - (20.0 - 2.0 * cfg.model.int_const)).abs() < 1e-9);
    }

    #[test]
    fn ignore_is_counted_only_for_second_agent() {
        let cfg = test_config();
        let mut counters = Counters::default();

        let mut helper = make_agent(0, 0.0, 10.0, 20.0, 10.0);
        helper.social_net = Network::constant(&[4, 2], 10.0);
        let mut passive = make_agent(1, 0.0, 10.0, 20.0, -10.0);
        passive.social_net = Network::constant(&[4, 2], -10.0);

        interact(&mut helper, &mut passive, &mut counters, &cfg.model).unwrap();
        // The helper also wants to fight.
        assert_eq!((counters.fights, counters.helps, counters.ignores), (1, 1, 1));

        let mut counters = Counters::default();
        let mut a1 = make_agent(2, 0.0, 10.0, 20.0, -10.0);
        let mut a2 = make_agent(3, 0.0, 10.0, 20.0, 10.0);
        a1.social_net = Network::constant(&[4, 2], -10.0);
        a2.social_net = Network::constant(&[4, 2], 10.0);
        interact(&mut a1, &mut a2, &mut counters, &cfg.model).unwrap();
        assert_eq!((counters.fights, counters.helps, counters.ignores), (1, 1, 0));
    }

    #[test]
    fn close_family_checks_one_generation() {
        let parent = make_agent(0, 0.0, 10.0, 20.0, 0.0);
        let mut child = make_agent(1, 0.0, 5.0, 20.0, 0.0);
        child.parent_id = Some(0);
        let mut grandchild = make_agent(2, 0.0, 2.0, 20.0, 0.0);
        grandchild.parent_id = Some(1);

        assert!(is_close_family(&parent, &child));
        assert!(is_close_family(&grandchild, &child));
        assert!(!is_close_family(&parent, &grandchild));
    }
}
