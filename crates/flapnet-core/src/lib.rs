//! Core types shared across the FlapNet workspace.
//!
//! One generation of the game lives in a [`Simulation`]: a roster of birds,
//! each driven by a [`BrainRunner`], multiplexed against a shared scrolling
//! pipe field. The tick loop retires birds on mask collision or out-of-bounds
//! exit and records fitness deltas in a [`FitnessLedger`] that the run driver
//! folds back into the optimizer between generations.

use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

new_key_type! {
    /// Stable handle for roster entries backed by a generational slot map.
    pub struct AgentId;
}

/// Number of sensor inputs fed into each brain per tick.
pub const INPUT_SIZE: usize = 3;
/// Number of control outputs produced by each brain.
pub const OUTPUT_SIZE: usize = 1;
/// Number of wing animation frames cycled by the flap cadence.
pub const WING_FRAMES: usize = 3;

/// Bird sprite width in world units.
pub const BIRD_WIDTH: usize = 68;
/// Bird sprite height in world units.
pub const BIRD_HEIGHT: usize = 48;
/// Pipe sprite width in world units.
pub const PIPE_WIDTH: usize = 104;
/// Length of one pipe segment; tall enough to reach past either window edge.
pub const PIPE_BODY_HEIGHT: usize = 640;

const PIPE_CAP_HEIGHT: usize = 40;
const PIPE_BODY_INSET: usize = 6;

/// Vertical band above the jump origin inside which the bird holds its climb tilt.
const TILT_HOLD_BAND: f32 = 50.0;
/// Tilt at which the bird stops flapping and holds the glide frame.
const DIVE_GLIDE_TILT: f32 = -80.0;
/// Steepest dive tilt.
const MAX_DIVE_TILT: f32 = -90.0;

/// Errors surfaced by the core simulation.
#[derive(Debug, Error)]
pub enum SimError {
    /// Indicates an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// A frame sink failed while presenting a tick.
    #[error("frame sink error: {0}")]
    Sink(String),
}

/// Static configuration for one simulation world.
///
/// Defaults mirror the original game's geometry and reward constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimConfig {
    /// Width of the visible world in world units.
    pub world_width: f32,
    /// Height of the visible world in world units.
    pub world_height: f32,
    /// Vertical position of the floor line.
    pub floor_y: f32,
    /// Horizontal position shared by every bird.
    pub bird_x: f32,
    /// Vertical spawn position for new birds.
    pub bird_spawn_y: f32,
    /// Quadratic gravity coefficient applied per tick of the fall arc.
    pub gravity: f32,
    /// Upward velocity assigned on a jump command.
    pub jump_impulse: f32,
    /// Terminal per-tick displacement; falls are clamped to this value.
    pub terminal_displacement: f32,
    /// Extra displacement subtracted on upward arcs for a smoother climb.
    pub climb_correction: f32,
    /// Maximum nose-up tilt in degrees.
    pub max_climb_tilt: f32,
    /// Degrees of nose-down rotation applied per tick of a dive.
    pub dive_rotation: f32,
    /// Ticks between wing animation frames.
    pub animation_period: u32,
    /// Horizontal scroll speed of pipes and ground per tick.
    pub scroll_speed: f32,
    /// Vertical size of the gap between a pipe pair.
    pub pipe_gap: f32,
    /// Lowest permitted gap top edge.
    pub gap_min: f32,
    /// Highest permitted gap top edge.
    pub gap_max: f32,
    /// Horizontal position of the first pipe of a generation.
    pub first_pipe_x: f32,
    /// Width of one looping ground strip.
    pub ground_strip_width: f32,
    /// Sprite slack subtracted before the floor contact test.
    pub floor_margin: f32,
    /// Vertical bound above which a bird is retired.
    pub ceiling_y: f32,
    /// Fitness delta granted to every live genome per survived tick.
    pub survival_reward: f32,
    /// Fitness delta granted population-wide when a pipe is passed.
    pub pass_reward: f32,
    /// Fitness delta subtracted from a genome on collision.
    pub collision_penalty: f32,
    /// Brain output level above which a jump command fires.
    pub jump_threshold: f32,
    /// Score at which an evolve-mode generation ends the whole run.
    pub win_threshold: u32,
    /// Simulation tick rate in Hz.
    pub tick_rate: u32,
    /// Whether the run loop blocks to hold the tick rate. Disable for headless runs.
    pub paced: bool,
    /// Optional RNG seed for reproducible pipe sequences.
    pub rng_seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            world_width: 600.0,
            world_height: 800.0,
            floor_y: 730.0,
            bird_x: 230.0,
            bird_spawn_y: 350.0,
            gravity: 3.0,
            jump_impulse: -10.5,
            terminal_displacement: 16.0,
            climb_correction: 2.0,
            max_climb_tilt: 25.0,
            dive_rotation: 20.0,
            animation_period: 5,
            scroll_speed: 5.0,
            pipe_gap: 200.0,
            gap_min: 50.0,
            gap_max: 450.0,
            first_pipe_x: 700.0,
            ground_strip_width: 672.0,
            floor_margin: 10.0,
            ceiling_y: -50.0,
            survival_reward: 0.01,
            pass_reward: 1.0,
            collision_penalty: 1.0,
            jump_threshold: 0.5,
            win_threshold: 50,
            tick_rate: 60,
            paced: true,
            rng_seed: None,
        }
    }
}

impl SimConfig {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), SimError> {
        if self.world_width <= 0.0 || self.world_height <= 0.0 {
            return Err(SimError::InvalidConfig(
                "world dimensions must be positive",
            ));
        }
        if self.floor_y <= 0.0 || self.floor_y > self.world_height {
            return Err(SimError::InvalidConfig(
                "floor line must sit inside the window",
            ));
        }
        if self.pipe_gap <= 0.0 {
            return Err(SimError::InvalidConfig("pipe gap must be positive"));
        }
        if self.gap_min > self.gap_max {
            return Err(SimError::InvalidConfig(
                "gap offset range must be non-empty",
            ));
        }
        if self.gap_min < 0.0 || self.gap_max > self.world_height {
            return Err(SimError::InvalidConfig(
                "gap offset range must sit inside the window",
            ));
        }
        if self.scroll_speed <= 0.0 {
            return Err(SimError::InvalidConfig("scroll speed must be positive"));
        }
        if self.ground_strip_width <= 0.0 {
            return Err(SimError::InvalidConfig(
                "ground strip width must be positive",
            ));
        }
        if self.animation_period == 0 {
            return Err(SimError::InvalidConfig(
                "animation period must be non-zero",
            ));
        }
        if self.tick_rate == 0 {
            return Err(SimError::InvalidConfig("tick rate must be non-zero"));
        }
        if self.win_threshold == 0 {
            return Err(SimError::InvalidConfig("win threshold must be non-zero"));
        }
        Ok(())
    }

    /// Returns the configured RNG, seeding from entropy if no seed is set.
    fn seeded_rng(&self) -> SmallRng {
        match self.rng_seed {
            Some(seed) => SmallRng::seed_from_u64(seed),
            None => {
                let seed: u64 = rand::random();
                SmallRng::seed_from_u64(seed)
            }
        }
    }
}

/// Shared interface implemented by every bird brain.
pub trait BrainRunner: Send {
    /// Immutable brain identifier (useful for logging and artifacts).
    fn kind(&self) -> &'static str;

    /// Evaluate the brain against the latest sensor vector.
    fn tick(&mut self, inputs: &[f32; INPUT_SIZE]) -> [f32; OUTPUT_SIZE];
}

/// Per-bird physical state mutated once per tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BirdState {
    /// Vertical position of the sprite's top edge.
    pub y: f32,
    /// Vertical velocity carried from the last jump.
    pub velocity: f32,
    /// Sprite tilt in degrees; positive is nose-up.
    pub tilt: f32,
    /// Ticks elapsed since the last jump command.
    pub ticks_since_jump: u32,
    /// Wing animation frame index.
    pub frame: usize,
    jump_origin: f32,
    frame_clock: u32,
}

impl BirdState {
    /// Construct a bird at the given vertical position.
    #[must_use]
    pub fn new(y: f32) -> Self {
        Self {
            y,
            velocity: 0.0,
            tilt: 0.0,
            ticks_since_jump: 0,
            frame: 0,
            jump_origin: y,
            frame_clock: 0,
        }
    }

    /// Reset velocity to the jump impulse. Always succeeds; there is no cooldown.
    pub fn jump(&mut self, config: &SimConfig) {
        self.velocity = config.jump_impulse;
        self.ticks_since_jump = 0;
        self.jump_origin = self.y;
    }

    /// Advance one tick of physics: gravity arc, tilt, and wing cadence.
    pub fn advance(&mut self, config: &SimConfig) {
        self.ticks_since_jump += 1;
        let t = self.ticks_since_jump as f32;

        let mut displacement = self.velocity * t + 0.5 * config.gravity * t * t;
        if displacement >= config.terminal_displacement {
            displacement = config.terminal_displacement;
        }
        if displacement < 0.0 {
            displacement -= config.climb_correction;
        }
        self.y += displacement;

        if displacement < 0.0 || self.y < self.jump_origin + TILT_HOLD_BAND {
            if self.tilt < config.max_climb_tilt {
                self.tilt = config.max_climb_tilt;
            }
        } else if self.tilt > MAX_DIVE_TILT {
            self.tilt = (self.tilt - config.dive_rotation).max(MAX_DIVE_TILT);
        }

        self.frame_clock += 1;
        if self.frame_clock >= config.animation_period {
            self.frame_clock = 0;
            self.frame = (self.frame + 1) % WING_FRAMES;
        }
        // A diving bird stops flapping and holds the glide frame.
        if self.tilt <= DIVE_GLIDE_TILT {
            self.frame = 1;
            self.frame_clock = 0;
        }
    }
}

/// One pipe pair scrolling across the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipe {
    /// Horizontal position of the leading (left) edge.
    pub x: f32,
    /// Bottom edge of the top pipe segment.
    pub gap_top: f32,
    /// Top edge of the bottom pipe segment.
    pub gap_bottom: f32,
    /// Set exactly once, when the leading edge scrolls behind the lead bird.
    pub passed: bool,
}

impl Pipe {
    /// Spawn a pipe at `x` with a freshly randomized gap offset.
    pub fn spawn(x: f32, config: &SimConfig, rng: &mut SmallRng) -> Self {
        let gap_top = rng.random_range(config.gap_min..=config.gap_max);
        Self {
            x,
            gap_top,
            gap_bottom: gap_top + config.pipe_gap,
            passed: false,
        }
    }

    /// Scroll the pipe one tick to the left.
    pub fn advance(&mut self, config: &SimConfig) {
        self.x -= config.scroll_speed;
    }

    /// Whether the trailing edge has scrolled fully off the visible world.
    #[must_use]
    pub fn off_screen(&self) -> bool {
        self.x + (PIPE_WIDTH as f32) < 0.0
    }

    /// Pixel-accurate collision between a bird and either pipe segment.
    #[must_use]
    pub fn collides(&self, bird: &BirdState, bird_x: f32, masks: &MaskSet) -> bool {
        let bird_mask = &masks.bird[bird.frame % WING_FRAMES];
        let bx = bird_x.round() as i32;
        let by = bird.y.round() as i32;
        let px = self.x.round() as i32;

        let top_y = self.gap_top.round() as i32 - PIPE_BODY_HEIGHT as i32;
        let bottom_y = self.gap_bottom.round() as i32;

        bird_mask.overlaps(&masks.pipe_top, px - bx, top_y - by)
            || bird_mask.overlaps(&masks.pipe_bottom, px - bx, bottom_y - by)
    }
}

/// Two horizontally looping ground strips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ground {
    /// Offset of the first strip.
    pub x1: f32,
    /// Offset of the second strip.
    pub x2: f32,
}

impl Ground {
    /// Construct two adjacent strips covering the visible world.
    #[must_use]
    pub fn new(config: &SimConfig) -> Self {
        Self {
            x1: 0.0,
            x2: config.ground_strip_width,
        }
    }

    /// Scroll both strips, wrapping each behind the other for a seamless loop.
    pub fn advance(&mut self, config: &SimConfig) {
        let width = config.ground_strip_width;
        self.x1 -= config.scroll_speed;
        self.x2 -= config.scroll_speed;
        if self.x1 + width < 0.0 {
            self.x1 = self.x2 + width;
        }
        if self.x2 + width < 0.0 {
            self.x2 = self.x1 + width;
        }
    }
}

/// Pixel-silhouette mask used for collision tests.
///
/// Stored as a flat row-major bit grid; overlap is exact per cell rather than
/// a bounding-box approximation.
#[derive(Debug, Clone)]
pub struct SpriteMask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
}

impl SpriteMask {
    /// Build a mask by sampling `filled` over every cell.
    pub fn from_fn(width: usize, height: usize, filled: impl Fn(usize, usize) -> bool) -> Self {
        let mut bits = vec![false; width * height];
        for y in 0..height {
            for x in 0..width {
                bits[y * width + x] = filled(x, y);
            }
        }
        Self {
            width,
            height,
            bits,
        }
    }

    /// Mask width in cells.
    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    /// Mask height in cells.
    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Whether the cell at `(x, y)` belongs to the silhouette.
    #[must_use]
    pub fn filled(&self, x: usize, y: usize) -> bool {
        x < self.width && y < self.height && self.bits[y * self.width + x]
    }

    /// Exact overlap test against `other` placed at offset `(dx, dy)`
    /// relative to this mask's origin.
    #[must_use]
    pub fn overlaps(&self, other: &SpriteMask, dx: i32, dy: i32) -> bool {
        let x_start = dx.max(0);
        let x_end = (dx + other.width as i32).min(self.width as i32);
        let y_start = dy.max(0);
        let y_end = (dy + other.height as i32).min(self.height as i32);
        if x_start >= x_end || y_start >= y_end {
            return false;
        }
        for y in y_start..y_end {
            for x in x_start..x_end {
                if self.filled(x as usize, y as usize)
                    && other.filled((x - dx) as usize, (y - dy) as usize)
                {
                    return true;
                }
            }
        }
        false
    }
}

/// Silhouettes for every drawable collider: one bird mask per wing frame plus
/// the two pipe segments.
#[derive(Debug, Clone)]
pub struct MaskSet {
    /// Bird silhouettes indexed by wing frame.
    pub bird: [SpriteMask; WING_FRAMES],
    /// Top pipe segment; cap lip at its bottom edge.
    pub pipe_top: SpriteMask,
    /// Bottom pipe segment; cap lip at its top edge.
    pub pipe_bottom: SpriteMask,
}

impl MaskSet {
    /// Build the standard sprite silhouettes.
    #[must_use]
    pub fn build() -> Self {
        let bird = [
            Self::bird_mask(WingPose::Up),
            Self::bird_mask(WingPose::Mid),
            Self::bird_mask(WingPose::Down),
        ];
        let pipe_top = SpriteMask::from_fn(PIPE_WIDTH, PIPE_BODY_HEIGHT, |x, y| {
            if y >= PIPE_BODY_HEIGHT - PIPE_CAP_HEIGHT {
                true
            } else {
                x >= PIPE_BODY_INSET && x < PIPE_WIDTH - PIPE_BODY_INSET
            }
        });
        let pipe_bottom = SpriteMask::from_fn(PIPE_WIDTH, PIPE_BODY_HEIGHT, |x, y| {
            if y < PIPE_CAP_HEIGHT {
                true
            } else {
                x >= PIPE_BODY_INSET && x < PIPE_WIDTH - PIPE_BODY_INSET
            }
        });
        Self {
            bird,
            pipe_top,
            pipe_bottom,
        }
    }

    fn bird_mask(pose: WingPose) -> SpriteMask {
        let cx = BIRD_WIDTH as f32 / 2.0;
        let cy = BIRD_HEIGHT as f32 / 2.0;
        // Body ellipse, a beak nub on the right, a tail stub on the left, and
        // a wing bump whose row band depends on the pose.
        SpriteMask::from_fn(BIRD_WIDTH, BIRD_HEIGHT, move |x, y| {
            let fx = x as f32 + 0.5;
            let fy = y as f32 + 0.5;
            let norm = ((fx - cx) / 30.0).powi(2) + ((fy - cy) / 20.0).powi(2);
            if norm <= 1.0 {
                return true;
            }
            // Beak: short wedge on the trailing half of the right edge.
            if x >= BIRD_WIDTH - 8 && (fy - cy).abs() <= 4.0 {
                return true;
            }
            // Tail: stub on the left edge.
            if x < 6 && (fy - cy).abs() <= 5.0 {
                return true;
            }
            let wing_band = match pose {
                WingPose::Up => Some((2, 6)),
                WingPose::Mid => None,
                WingPose::Down => Some((42, 46)),
            };
            if let Some((top, bottom)) = wing_band {
                return (14..34).contains(&x) && y >= top && y < bottom;
            }
            false
        })
    }
}

#[derive(Clone, Copy)]
enum WingPose {
    Up,
    Mid,
    Down,
}

/// Run mode of a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Population evaluation; fitness deltas are recorded and the win
    /// threshold ends the whole run.
    Evolve,
    /// Single pre-trained network; fitness is never mutated and the win
    /// threshold is ignored.
    Replay,
}

/// Additive fitness deltas recorded by the core, indexed by genome slot.
///
/// The core never owns genome lifecycle; the run driver folds this ledger
/// back into the optimizer population after the generation returns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FitnessLedger {
    deltas: Vec<f32>,
}

impl FitnessLedger {
    /// Ledger with `slots` zeroed entries.
    #[must_use]
    pub fn with_slots(slots: usize) -> Self {
        Self {
            deltas: vec![0.0; slots],
        }
    }

    /// Number of slots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.deltas.len()
    }

    /// Whether the ledger carries no slots.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Accumulated deltas, one per genome slot.
    #[must_use]
    pub fn deltas(&self) -> &[f32] {
        &self.deltas
    }

    fn ensure_slot(&mut self, slot: usize) {
        if slot >= self.deltas.len() {
            self.deltas.resize(slot + 1, 0.0);
        }
    }

    fn reward(&mut self, slot: usize, delta: f32) {
        if let Some(entry) = self.deltas.get_mut(slot) {
            *entry += delta;
        }
    }
}

/// One roster record: the bird, its brain, and its genome slot.
pub struct AgentEntry {
    /// Live physical state.
    pub bird: BirdState,
    /// Decision source queried each tick.
    pub brain: Box<dyn BrainRunner>,
    /// Index into the fitness ledger; `None` in replay mode.
    pub slot: Option<usize>,
}

impl fmt::Debug for AgentEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentEntry")
            .field("bird", &self.bird)
            .field("brain", &self.brain.kind())
            .field("slot", &self.slot)
            .finish()
    }
}

/// Events reported by one execution of [`Simulation::step`].
#[derive(Debug, Clone, Copy)]
pub struct TickEvents {
    /// Tick counter after the step.
    pub tick: u64,
    /// Score after the step.
    pub score: u32,
    /// Index of the obstacle the sensors were measured against.
    pub pipe_index: usize,
    /// Whether a pipe's passed flag transitioned this tick.
    pub passed: bool,
    /// Number of agents retired this tick.
    pub retired: usize,
}

/// Terminal states of one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// Every agent was retired.
    Exhausted,
    /// The win threshold was reached in evolve mode; the run driver should
    /// persist the surviving champion and end the whole run.
    ThresholdReached,
    /// An external quit request was observed.
    Aborted,
}

/// Bird fields exposed to the rendering collaborator.
#[derive(Debug, Clone, Serialize)]
pub struct BirdView {
    /// Vertical position of the sprite's top edge.
    pub y: f32,
    /// Sprite tilt in degrees.
    pub tilt: f32,
    /// Wing frame index.
    pub frame: usize,
}

/// Read-only frame handed to a [`FrameSink`] once per tick.
#[derive(Debug, Clone, Serialize)]
pub struct FrameSnapshot {
    /// Tick counter of this frame.
    pub tick: u64,
    /// Score of the current generation.
    pub score: u32,
    /// Best score seen across the whole run.
    pub best_score: u32,
    /// Generation counter threaded in by the run driver.
    pub generation: u32,
    /// Number of live agents.
    pub alive: usize,
    /// Index of the obstacle currently driving the sensors.
    pub pipe_index: usize,
    /// Live bird states.
    pub birds: Vec<BirdView>,
    /// Pipe field.
    pub pipes: Vec<Pipe>,
    /// Ground strip offsets.
    pub ground: Ground,
}

/// Feedback from a sink after one presented frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkSignal {
    /// Keep running.
    Continue,
    /// Cooperative quit request, observed at the top of the next tick.
    Quit,
}

/// Presentation collaborator invoked once per tick.
///
/// Implementations perform presentation only; no simulation state flows back
/// besides the quit signal.
pub trait FrameSink {
    /// Present a single frame.
    fn present(&mut self, frame: &FrameSnapshot) -> Result<SinkSignal, SimError>;
}

/// Sink that drops every frame; used by tests and headless evolution.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl FrameSink for NullSink {
    fn present(&mut self, _frame: &FrameSnapshot) -> Result<SinkSignal, SimError> {
        Ok(SinkSignal::Continue)
    }
}

/// One generation of the game: roster, pipe field, score, and fitness ledger.
pub struct Simulation {
    config: SimConfig,
    mode: RunMode,
    rng: SmallRng,
    roster: SlotMap<AgentId, AgentEntry>,
    spawn_order: Vec<AgentId>,
    pending_retirements: Vec<AgentId>,
    pipes: Vec<Pipe>,
    ground: Ground,
    masks: MaskSet,
    ledger: FitnessLedger,
    score: u32,
    best_score: u32,
    generation: u32,
    tick: u64,
    quit_requested: bool,
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("mode", &self.mode)
            .field("generation", &self.generation)
            .field("tick", &self.tick)
            .field("score", &self.score)
            .field("alive", &self.roster.len())
            .finish()
    }
}

impl Simulation {
    /// Instantiate a generation. `generation` and `best_score` are explicit
    /// run-driver state, not ambient globals.
    pub fn new(
        config: SimConfig,
        mode: RunMode,
        generation: u32,
        best_score: u32,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let mut rng = config.seeded_rng();
        let first_pipe = Pipe::spawn(config.first_pipe_x, &config, &mut rng);
        let ground = Ground::new(&config);
        Ok(Self {
            mode,
            rng,
            roster: SlotMap::with_key(),
            spawn_order: Vec::new(),
            pending_retirements: Vec::new(),
            pipes: vec![first_pipe],
            ground,
            masks: MaskSet::build(),
            ledger: FitnessLedger::default(),
            score: 0,
            best_score,
            generation,
            tick: 0,
            quit_requested: false,
            config,
        })
    }

    /// Add one agent to the roster. `slot` indexes the fitness ledger and
    /// must be `None` in replay mode.
    pub fn spawn_agent(&mut self, brain: Box<dyn BrainRunner>, slot: Option<usize>) -> AgentId {
        if let Some(slot) = slot {
            self.ledger.ensure_slot(slot);
        }
        let id = self.roster.insert(AgentEntry {
            bird: BirdState::new(self.config.bird_spawn_y),
            brain,
            slot,
        });
        self.spawn_order.push(id);
        id
    }

    /// Immutable access to configuration.
    #[must_use]
    pub fn config(&self) -> &SimConfig {
        &self.config
    }

    /// Current run mode.
    #[must_use]
    pub const fn mode(&self) -> RunMode {
        self.mode
    }

    /// Score of the current generation.
    #[must_use]
    pub const fn score(&self) -> u32 {
        self.score
    }

    /// Best score observed across the run so far.
    #[must_use]
    pub const fn best_score(&self) -> u32 {
        self.best_score
    }

    /// Generation counter threaded in by the run driver.
    #[must_use]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    /// Ticks executed so far this generation.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Number of live agents.
    #[must_use]
    pub fn agent_count(&self) -> usize {
        self.roster.len()
    }

    /// Borrow a roster entry.
    #[must_use]
    pub fn agent(&self, id: AgentId) -> Option<&AgentEntry> {
        self.roster.get(id)
    }

    /// The lead agent: the earliest-spawned bird still alive.
    #[must_use]
    pub fn lead_agent(&self) -> Option<AgentId> {
        self.spawn_order
            .iter()
            .copied()
            .find(|id| self.roster.contains_key(*id))
    }

    /// Genome slot of the lead agent, if any.
    #[must_use]
    pub fn lead_slot(&self) -> Option<usize> {
        self.lead_agent().and_then(|id| self.roster[id].slot)
    }

    /// Current pipe field.
    #[must_use]
    pub fn pipes(&self) -> &[Pipe] {
        &self.pipes
    }

    /// Accumulated fitness deltas for this generation.
    #[must_use]
    pub fn ledger(&self) -> &FitnessLedger {
        &self.ledger
    }

    /// Consume the simulation, yielding the fitness ledger.
    #[must_use]
    pub fn into_ledger(self) -> FitnessLedger {
        self.ledger
    }

    /// Index of the obstacle driving the sensor vector: the first pipe,
    /// unless its trailing edge has already scrolled behind the lead bird.
    #[must_use]
    pub fn selected_pipe_index(&self) -> usize {
        if self.pipes.len() > 1
            && !self.roster.is_empty()
            && self.config.bird_x > self.pipes[0].x + PIPE_WIDTH as f32
        {
            1
        } else {
            0
        }
    }

    /// Execute one simulation tick: agents act, the world scrolls, collisions
    /// and pass events resolve, retirements apply.
    pub fn step(&mut self) -> TickEvents {
        self.tick += 1;
        let pipe_index = self.selected_pipe_index();

        self.stage_agents(pipe_index);
        self.ground.advance(&self.config);
        let (passed, collided) = self.stage_pipes(pipe_index);
        self.stage_bounds();
        let retired = collided + self.stage_retirements();

        TickEvents {
            tick: self.tick,
            score: self.score,
            pipe_index,
            passed,
            retired,
        }
    }

    /// Run the generation to completion against `sink`, pacing ticks at the
    /// configured rate. One frame is presented per tick; a quit signal from
    /// the sink is observed cooperatively at the top of the next tick.
    pub fn run(&mut self, sink: &mut dyn FrameSink) -> Result<GenerationOutcome, SimError> {
        let interval = Duration::from_secs_f32(1.0 / self.config.tick_rate as f32);
        loop {
            let tick_start = Instant::now();
            if self.quit_requested {
                return Ok(GenerationOutcome::Aborted);
            }

            let events = self.step();
            let frame = self.frame_snapshot(events.pipe_index);
            if sink.present(&frame)? == SinkSignal::Quit {
                self.quit_requested = true;
            }

            if self.roster.is_empty() {
                return Ok(GenerationOutcome::Exhausted);
            }
            if self.mode == RunMode::Evolve && self.score >= self.config.win_threshold {
                return Ok(GenerationOutcome::ThresholdReached);
            }

            if self.config.paced {
                let elapsed = tick_start.elapsed();
                if elapsed < interval {
                    std::thread::sleep(interval - elapsed);
                }
            }
        }
    }

    /// Assemble the read-only frame for the rendering collaborator.
    #[must_use]
    pub fn frame_snapshot(&self, pipe_index: usize) -> FrameSnapshot {
        let birds = self
            .spawn_order
            .iter()
            .filter_map(|id| self.roster.get(*id))
            .map(|entry| BirdView {
                y: entry.bird.y,
                tilt: entry.bird.tilt,
                frame: entry.bird.frame,
            })
            .collect();
        FrameSnapshot {
            tick: self.tick,
            score: self.score,
            best_score: self.best_score,
            generation: self.generation,
            alive: self.roster.len(),
            pipe_index,
            birds,
            pipes: self.pipes.clone(),
            ground: self.ground.clone(),
        }
    }

    /// Survival reward, physics advance, brain query, and jump command for
    /// every live agent.
    fn stage_agents(&mut self, pipe_index: usize) {
        let Some(pipe) = self.pipes.get(pipe_index).cloned() else {
            return;
        };
        let config = &self.config;
        let evolve = self.mode == RunMode::Evolve;
        for entry in self.roster.values_mut() {
            if evolve && let Some(slot) = entry.slot {
                self.ledger.reward(slot, config.survival_reward);
            }
            entry.bird.advance(config);
            let inputs = [
                entry.bird.y,
                (entry.bird.y - pipe.gap_top).abs(),
                (entry.bird.y - pipe.gap_bottom).abs(),
            ];
            let outputs = entry.brain.tick(&inputs);
            if outputs[0] > config.jump_threshold {
                entry.bird.jump(config);
            }
        }
    }

    /// Advance pipes, retire collided agents, detect the pass event, and
    /// drop off-screen pipes after the scan. Returns the pass flag and
    /// how many agents the collision sweep removed.
    fn stage_pipes(&mut self, pipe_index: usize) -> (bool, usize) {
        for pipe in &mut self.pipes {
            pipe.advance(&self.config);
        }

        // Collided birds leave the roster before the pass gate runs, so a
        // same-tick collision neither scores nor earns the pass bonus.
        let evolve = self.mode == RunMode::Evolve;
        let mut collided = Vec::new();
        if let Some(pipe) = self.pipes.get(pipe_index) {
            for (id, entry) in &self.roster {
                if pipe.collides(&entry.bird, self.config.bird_x, &self.masks) {
                    if evolve && let Some(slot) = entry.slot {
                        self.ledger.reward(slot, -self.config.collision_penalty);
                    }
                    collided.push(id);
                }
            }
        }
        for id in &collided {
            self.roster.remove(*id);
        }
        if !collided.is_empty() {
            self.spawn_order.retain(|id| !collided.contains(id));
        }

        let mut passed = false;
        if self.lead_agent().is_some()
            && let Some(pipe) = self.pipes.get_mut(pipe_index)
            && !pipe.passed
            && pipe.x < self.config.bird_x
        {
            pipe.passed = true;
            passed = true;
        }
        if passed {
            self.score += 1;
            if self.score > self.best_score {
                self.best_score = self.score;
            }
            if evolve {
                // Passing is a population-wide reward: every live genome
                // shares the bonus, not just the lead bird.
                let slots: Vec<usize> =
                    self.roster.values().filter_map(|entry| entry.slot).collect();
                for slot in slots {
                    self.ledger.reward(slot, self.config.pass_reward);
                }
            }
            let spawn = Pipe::spawn(self.config.world_width, &self.config, &mut self.rng);
            self.pipes.push(spawn);
            debug!(tick = self.tick, score = self.score, "pipe passed");
        }

        self.pipes.retain(|pipe| !pipe.off_screen());
        (passed, collided.len())
    }

    /// Retire agents in the floor band or above the ceiling. Carries no
    /// fitness penalty beyond any collision recorded this tick.
    fn stage_bounds(&mut self) {
        for (id, entry) in &self.roster {
            let floor_contact =
                entry.bird.y + BIRD_HEIGHT as f32 - self.config.floor_margin >= self.config.floor_y;
            let above_ceiling = entry.bird.y < self.config.ceiling_y;
            if floor_contact || above_ceiling {
                self.pending_retirements.push(id);
            }
        }
    }

    /// Apply staged retirements in one atomic sweep. An agent queued more
    /// than once this tick is removed exactly once.
    fn stage_retirements(&mut self) -> usize {
        if self.pending_retirements.is_empty() {
            return 0;
        }
        let mut seen = HashSet::new();
        let mut removed = 0usize;
        for id in self.pending_retirements.drain(..) {
            if seen.insert(id) && self.roster.remove(id).is_some() {
                removed += 1;
            }
        }
        self.spawn_order.retain(|id| self.roster.contains_key(*id));
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brain with a constant output level.
    struct ConstBrain(f32);

    impl BrainRunner for ConstBrain {
        fn kind(&self) -> &'static str {
            "const"
        }

        fn tick(&mut self, _inputs: &[f32; INPUT_SIZE]) -> [f32; OUTPUT_SIZE] {
            [self.0]
        }
    }

    fn glide() -> Box<dyn BrainRunner> {
        Box::new(ConstBrain(0.0))
    }

    fn flap() -> Box<dyn BrainRunner> {
        Box::new(ConstBrain(1.0))
    }

    fn headless_config() -> SimConfig {
        SimConfig {
            paced: false,
            rng_seed: Some(7),
            ..SimConfig::default()
        }
    }

    #[test]
    fn config_validation_rejects_bad_values() {
        let mut config = SimConfig::default();
        assert!(config.validate().is_ok());

        config.pipe_gap = 0.0;
        assert!(matches!(
            config.validate(),
            Err(SimError::InvalidConfig(_))
        ));

        let mut config = SimConfig::default();
        config.gap_min = 500.0;
        config.gap_max = 100.0;
        assert!(config.validate().is_err());

        let mut config = SimConfig::default();
        config.win_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn jump_resets_velocity_and_arc_counter() {
        let config = SimConfig::default();
        let mut bird = BirdState::new(350.0);
        bird.advance(&config);
        bird.advance(&config);
        assert_eq!(bird.ticks_since_jump, 2);
        assert!(bird.y > 350.0, "an idle bird falls");

        bird.jump(&config);
        assert_eq!(bird.ticks_since_jump, 0);
        assert_eq!(bird.velocity, config.jump_impulse);

        let before = bird.y;
        bird.advance(&config);
        assert!(bird.y < before, "a jump carries the bird upward");
        assert_eq!(bird.tilt, config.max_climb_tilt);
    }

    #[test]
    fn fall_displacement_clamps_at_terminal_velocity() {
        let config = SimConfig::default();
        let mut bird = BirdState::new(0.0);
        let mut previous = bird.y;
        let mut deltas = Vec::new();
        for _ in 0..8 {
            bird.advance(&config);
            deltas.push(bird.y - previous);
            previous = bird.y;
        }
        // t=1: 1.5, t=2: 6.0, t=3: 13.5, then clamped.
        assert!((deltas[0] - 1.5).abs() < 1e-3);
        assert!((deltas[1] - 6.0).abs() < 1e-3);
        assert!((deltas[2] - 13.5).abs() < 1e-3);
        for delta in &deltas[3..] {
            assert!(*delta <= config.terminal_displacement + 1e-3);
        }
    }

    #[test]
    fn dive_tilt_rotates_toward_max_and_holds_glide_frame() {
        let config = SimConfig::default();
        let mut bird = BirdState::new(100.0);
        for _ in 0..12 {
            bird.advance(&config);
        }
        assert!(bird.tilt <= DIVE_GLIDE_TILT);
        assert!(bird.tilt >= MAX_DIVE_TILT);
        assert_eq!(bird.frame, 1, "diving bird holds the glide frame");
    }

    #[test]
    fn pipe_leaves_the_world_only_past_its_trailing_edge() {
        let config = SimConfig::default();
        let mut rng = config.seeded_rng();
        let mut pipe = Pipe::spawn(-100.0, &config, &mut rng);
        assert!(!pipe.off_screen(), "trailing edge still visible at x=-100");
        pipe.x = -(PIPE_WIDTH as f32);
        assert!(!pipe.off_screen(), "trailing edge exactly at the world edge");
        pipe.x = -(PIPE_WIDTH as f32) - 1.0;
        assert!(pipe.off_screen());
    }

    #[test]
    fn ground_strips_wrap_seamlessly() {
        let config = SimConfig::default();
        let mut ground = Ground::new(&config);
        let width = config.ground_strip_width;
        for _ in 0..1_000 {
            ground.advance(&config);
            let spacing = (ground.x1 - ground.x2).abs();
            assert!(
                (spacing - width).abs() < 1e-3,
                "strips stay exactly one width apart, got {spacing}"
            );
            assert!(ground.x1.min(ground.x2) <= 0.0, "one strip covers the left edge");
        }
    }

    #[test]
    fn mask_overlap_is_tighter_than_bounding_boxes() {
        let masks = MaskSet::build();
        let bird = &masks.bird[1];

        // Dead-center of the body is solid; the sprite corner is not.
        assert!(bird.filled(BIRD_WIDTH / 2, BIRD_HEIGHT / 2));
        assert!(!bird.filled(0, 0));

        // A pipe body aligned with the bird's empty corner misses even though
        // the bounding boxes intersect.
        let offset_x = (BIRD_WIDTH as i32) - 2;
        assert!(!bird.overlaps(&masks.pipe_top, offset_x, -(PIPE_BODY_HEIGHT as i32) + 1));
        // Centered on the body it hits.
        assert!(bird.overlaps(&masks.pipe_top, 0, -(PIPE_BODY_HEIGHT as i32 / 2)));
        // Fully disjoint placements never hit.
        assert!(!bird.overlaps(&masks.pipe_top, PIPE_WIDTH as i32 * 2, 0));
    }

    #[test]
    fn pipe_cap_extends_past_the_body_inset() {
        let masks = MaskSet::build();
        // Cap rows span the full width; body rows are inset.
        assert!(masks.pipe_top.filled(0, PIPE_BODY_HEIGHT - 1));
        assert!(!masks.pipe_top.filled(0, 0));
        assert!(masks.pipe_top.filled(PIPE_BODY_INSET, 0));
        assert!(masks.pipe_bottom.filled(0, 0));
        assert!(!masks.pipe_bottom.filled(0, PIPE_BODY_HEIGHT - 1));
    }

    #[test]
    fn roster_retirement_removes_exactly_the_queued_agents() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Evolve, 1, 0).expect("simulation");
        let a = sim.spawn_agent(glide(), Some(0));
        let b = sim.spawn_agent(glide(), Some(1));
        let c = sim.spawn_agent(glide(), Some(2));
        assert_eq!(sim.agent_count(), 3);

        // Queue one agent twice; it must be removed exactly once.
        sim.pending_retirements.push(b);
        sim.pending_retirements.push(b);
        let removed = sim.stage_retirements();
        assert_eq!(removed, 1);
        assert_eq!(sim.agent_count(), 2);
        assert!(sim.agent(a).is_some());
        assert!(sim.agent(b).is_none());
        assert!(sim.agent(c).is_some());
        assert_eq!(sim.lead_agent(), Some(a));
    }

    #[test]
    fn pass_event_fires_once_and_rewards_every_live_genome() {
        // Pipe a few ticks from the birds, gap wide open so nothing collides.
        let config = SimConfig {
            first_pipe_x: 250.0,
            gap_min: 100.0,
            gap_max: 100.0,
            pipe_gap: 550.0,
            ..headless_config()
        };
        let mut sim = Simulation::new(config, RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));
        sim.spawn_agent(glide(), Some(1));

        let mut pass_ticks = 0;
        for _ in 0..6 {
            let events = sim.step();
            if events.passed {
                pass_ticks += 1;
            }
        }
        assert_eq!(pass_ticks, 1, "the passed flag transitions exactly once");
        assert_eq!(sim.score(), 1);
        assert_eq!(sim.pipes().len(), 2, "a replacement pipe spawned");

        // Survival (6 ticks) plus the population-wide pass bonus, per slot.
        let expected = 6.0 * sim.config().survival_reward + sim.config().pass_reward;
        for delta in sim.ledger().deltas() {
            assert!((delta - expected).abs() < 1e-4, "delta {delta} != {expected}");
        }
    }

    #[test]
    fn selected_pipe_switches_after_trailing_edge_clears_lead_bird() {
        let config = SimConfig {
            first_pipe_x: 250.0,
            gap_min: 50.0,
            gap_max: 50.0,
            pipe_gap: 600.0,
            bird_spawn_y: 100.0,
            ..headless_config()
        };
        let mut sim = Simulation::new(config, RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));

        let mut switched_at = None;
        for tick in 1..=30 {
            sim.step();
            assert!(sim.agent_count() == 1, "bird survived tick {tick}");
            if sim.selected_pipe_index() == 1 {
                switched_at = Some(tick);
                break;
            }
        }
        let switched_at = switched_at.expect("selection switched to the second pipe");
        // Trailing edge clears x=230 once the pipe has scrolled past 126.
        assert!(switched_at > 5, "switch happens only after the pass");
        assert_eq!(sim.pipes().len(), 2);
        assert!(sim.config().bird_x > sim.pipes()[0].x + PIPE_WIDTH as f32);
    }

    #[test]
    fn collision_retires_the_agent_and_applies_the_penalty() {
        // Pipe directly on top of the birds with the gap far above them.
        let config = SimConfig {
            first_pipe_x: 230.0,
            gap_min: 100.0,
            gap_max: 100.0,
            pipe_gap: 50.0,
            ..headless_config()
        };
        let mut sim = Simulation::new(config, RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));

        let events = sim.step();
        assert_eq!(events.retired, 1);
        assert_eq!(sim.agent_count(), 0);
        assert_eq!(sim.score(), 0);
        let expected = sim.config().survival_reward - sim.config().collision_penalty;
        assert!((sim.ledger().deltas()[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn same_tick_collision_forfeits_the_pass() {
        // Placed so a glider clips the bottom pipe on the exact tick the
        // trailing edge crosses the bird. The retirement must win: no score,
        // no pass bonus, no respawned pipe.
        let config = SimConfig {
            first_pipe_x: 335.0,
            gap_min: 440.0,
            gap_max: 440.0,
            pipe_gap: 270.0,
            ..headless_config()
        };
        let mut sim = Simulation::new(config, RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));

        let mut last = None;
        for _ in 0..40 {
            let events = sim.step();
            if sim.agent_count() == 0 {
                last = Some(events);
                break;
            }
        }
        let last = last.expect("glider collided");
        assert_eq!(last.tick, 22, "pipe and bird meet on the pass tick");
        assert_eq!(last.retired, 1);
        assert!(!last.passed, "a collided bird cannot also pass");
        assert_eq!(sim.score(), 0);
        assert_eq!(sim.pipes().len(), 1, "no pass means no respawn");
        let expected =
            22.0 * sim.config().survival_reward - sim.config().collision_penalty;
        assert!((sim.ledger().deltas()[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn floor_exit_retires_without_penalty() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));

        let mut survived_ticks = 0u32;
        while sim.agent_count() > 0 {
            sim.step();
            survived_ticks += 1;
            assert!(survived_ticks < 200, "glider must hit the floor");
        }
        // Only survival increments; the bounds exit itself carries no penalty.
        let expected = survived_ticks as f32 * sim.config().survival_reward;
        assert!((sim.ledger().deltas()[0] - expected).abs() < 1e-4);
    }

    #[test]
    fn ceiling_exit_retires_a_permaflapper() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(flap(), Some(0));

        let mut ticks = 0u32;
        while sim.agent_count() > 0 {
            sim.step();
            ticks += 1;
            assert!(ticks < 200, "permanent flapping must exit the ceiling");
        }
        let deltas = sim.ledger().deltas();
        assert!(deltas[0] > 0.0, "no penalty on a bounds exit");
    }

    #[test]
    fn replay_mode_never_touches_the_ledger() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Replay, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), None);

        let outcome = sim.run(&mut NullSink).expect("run");
        assert_eq!(outcome, GenerationOutcome::Exhausted);
        assert!(sim.ledger().is_empty());
    }

    #[test]
    fn threshold_ends_run_in_evolve_mode_only() {
        let config = SimConfig {
            first_pipe_x: 250.0,
            gap_min: 100.0,
            gap_max: 100.0,
            pipe_gap: 550.0,
            win_threshold: 1,
            ..headless_config()
        };

        let mut evolve =
            Simulation::new(config.clone(), RunMode::Evolve, 1, 0).expect("simulation");
        evolve.spawn_agent(glide(), Some(0));
        assert_eq!(
            evolve.run(&mut NullSink).expect("run"),
            GenerationOutcome::ThresholdReached
        );
        assert_eq!(evolve.score(), 1);
        assert_eq!(evolve.lead_slot(), Some(0));

        let mut replay = Simulation::new(config, RunMode::Replay, 1, 0).expect("simulation");
        replay.spawn_agent(glide(), None);
        assert_eq!(
            replay.run(&mut NullSink).expect("run"),
            GenerationOutcome::Exhausted,
            "replay mode ignores the win threshold"
        );
    }

    #[test]
    fn whole_roster_retiring_in_one_tick_exhausts_cleanly() {
        // Gap squeezed to a sliver well above the birds: everyone collides.
        let config = SimConfig {
            first_pipe_x: 230.0,
            gap_min: 60.0,
            gap_max: 60.0,
            pipe_gap: 10.0,
            ..headless_config()
        };
        let mut sim = Simulation::new(config, RunMode::Evolve, 1, 0).expect("simulation");
        for slot in 0..8 {
            sim.spawn_agent(glide(), Some(slot));
        }

        let outcome = sim.run(&mut NullSink).expect("run");
        assert_eq!(outcome, GenerationOutcome::Exhausted);
        assert_eq!(sim.agent_count(), 0);
        assert_eq!(sim.ledger().len(), 8);
    }

    struct QuitAfter(u64);

    impl FrameSink for QuitAfter {
        fn present(&mut self, frame: &FrameSnapshot) -> Result<SinkSignal, SimError> {
            if frame.tick >= self.0 {
                Ok(SinkSignal::Quit)
            } else {
                Ok(SinkSignal::Continue)
            }
        }
    }

    #[test]
    fn quit_signal_aborts_at_the_top_of_the_next_tick() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Evolve, 1, 0).expect("simulation");
        sim.spawn_agent(glide(), Some(0));

        let outcome = sim.run(&mut QuitAfter(3)).expect("run");
        assert_eq!(outcome, GenerationOutcome::Aborted);
        assert_eq!(sim.tick(), 3, "the quit is observed before tick 4 runs");
    }

    #[test]
    fn frame_snapshot_reflects_roster_and_world() {
        let mut sim =
            Simulation::new(headless_config(), RunMode::Evolve, 3, 12).expect("simulation");
        sim.spawn_agent(glide(), Some(0));
        sim.spawn_agent(glide(), Some(1));
        let events = sim.step();

        let frame = sim.frame_snapshot(events.pipe_index);
        assert_eq!(frame.generation, 3);
        assert_eq!(frame.best_score, 12);
        assert_eq!(frame.alive, 2);
        assert_eq!(frame.birds.len(), 2);
        assert_eq!(frame.pipes.len(), 1);
        assert_eq!(frame.tick, 1);
    }
}
