use std::time::Duration;

use rayon::iter::{IntoParallelIterator, ParallelIterator};

use crate::{
    driver::{BindingSet, TickBackend},
    error::{ConfigError, LifeError},
    rendering::{self, Frame},
};

pub mod gpucompute;

/// Edge length of the square tile processed by one unit of work (one workgroup on the GPU).
pub const TILE_SIZE: u32 = 8;

/// Bytes used by one cell in the state and metric buffers.
pub const CELL_BYTES: u64 = std::mem::size_of::<u32>() as u64;

/// Every cell index must fit a `u32` and the byte size of a buffer must as well.
pub const MAX_CELLS: u64 = u32::MAX as u64 / CELL_BYTES;

/// Value the metric buffer holds before the first tick.
pub const INITIAL_METRIC: u32 = 1;

/// Fixed dimensions of the toroidal grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GridDescriptor {
    width: u32,
    height: u32,
}

impl GridDescriptor {
    pub fn new(width: u32, height: u32) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 {
            return Err(ConfigError::ZeroDimension { width, height });
        }
        let cells = width as u64 * height as u64;
        if cells > MAX_CELLS {
            return Err(ConfigError::TooManyCells {
                cells,
                max: MAX_CELLS,
            });
        }
        Ok(Self { width, height })
    }

    /// Check the grid against what a particular device can address and dispatch.
    pub fn check_limits(&self, limits: &wgpu::Limits) -> Result<(), ConfigError> {
        let max_bytes = (limits.max_storage_buffer_binding_size as u64).min(limits.max_buffer_size);
        let max = max_bytes / CELL_BYTES;
        if self.cell_count() as u64 > max {
            return Err(ConfigError::TooManyCells {
                cells: self.cell_count() as u64,
                max,
            });
        }
        let (tiles_x, tiles_y) = self.tiles();
        let tiles = tiles_x.max(tiles_y);
        if tiles > limits.max_compute_workgroups_per_dimension {
            return Err(ConfigError::TooManyTiles {
                tiles,
                max: limits.max_compute_workgroups_per_dimension,
            });
        }
        Ok(())
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn cell_count(&self) -> usize {
        self.width as usize * self.height as usize
    }

    /// Size in bytes of one state or metric buffer.
    pub fn buffer_size(&self) -> u64 {
        self.cell_count() as u64 * CELL_BYTES
    }

    /// Row-major index of `(x, y)`, wrapping both coordinates around the torus.
    #[inline(always)]
    pub fn index(&self, x: i64, y: i64) -> usize {
        let x = x.rem_euclid(self.width as i64) as usize;
        let y = y.rem_euclid(self.height as i64) as usize;
        y * self.width as usize + x
    }

    /// Fail unless `len` is exactly one cell per grid position.
    pub fn check_len(&self, what: &'static str, len: usize) -> Result<(), ConfigError> {
        if len != self.cell_count() {
            return Err(ConfigError::SizeMismatch {
                what,
                expected: self.cell_count(),
                actual: len,
            });
        }
        Ok(())
    }

    /// Fail unless `other` has the same dimensions.
    pub fn check_same(&self, what: &'static str, other: GridDescriptor) -> Result<(), ConfigError> {
        if *self != other {
            return Err(ConfigError::GridMismatch {
                what,
                expected: (self.width, self.height),
                actual: (other.width, other.height),
            });
        }
        Ok(())
    }

    /// Inverse of [`GridDescriptor::index`] for in-range indices.
    pub fn coords(&self, index: usize) -> (u32, u32) {
        let width = self.width as usize;
        ((index % width) as u32, (index / width) as u32)
    }

    /// Number of tiles along each axis, rounding partial tiles up.
    pub fn tiles(&self) -> (u32, u32) {
        let x = self.width.div_ceil(TILE_SIZE);
        let y = self.height.div_ceil(TILE_SIZE);
        (x, y)
    }

    pub fn tile_count(&self) -> usize {
        let (x, y) = self.tiles();
        x as usize * y as usize
    }
}

/// How one of the two state buffers is populated before the first tick.
#[derive(Clone, Copy, Debug)]
pub enum SeedPolicy {
    /// A cell is alive when a uniform draw in `[0, 1)` exceeds `alive_above`.
    Random { alive_above: f32 },
    /// Cell `i` is alive iff `i` is odd.
    Checkerboard,
    Custom(fn(usize, GridDescriptor) -> bool),
}

impl SeedPolicy {
    pub fn fill(&self, grid: GridDescriptor, rng: &mut fastrand::Rng) -> SimulationFrame {
        let cells = (0..grid.cell_count())
            .map(|i| {
                let alive = match self {
                    SeedPolicy::Random { alive_above } => rng.f32() > *alive_above,
                    SeedPolicy::Checkerboard => i % 2 == 1,
                    SeedPolicy::Custom(f) => f(i, grid),
                };
                alive as u32
            })
            .collect();
        SimulationFrame { grid, cells }
    }
}

/// The parameters controlling the simulation
#[derive(Clone, Debug)]
pub struct SimulationParameters {
    pub width: u32,
    pub height: u32,
    /// Time between two ticks. Zero ticks on every poll.
    pub tick_interval: Duration,
    /// Stop scheduling after this many ticks
    pub max_ticks: Option<u64>,
    /// Seed for state buffer A, the one read by the first tick
    pub primary_seed: SeedPolicy,
    /// Seed for state buffer B
    pub secondary_seed: SeedPolicy,
    /// Fixed random seed; a fresh one is drawn when unset
    pub rng_seed: Option<u64>,
    pub log_level: log::LevelFilter,
}

impl Default for SimulationParameters {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            tick_interval: Duration::from_millis(100),
            max_ticks: None,
            primary_seed: SeedPolicy::Random { alive_above: 0.94 },
            secondary_seed: SeedPolicy::Checkerboard,
            rng_seed: None,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl SimulationParameters {
    /// Defaults overridden by `GPULIFE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key/value source.
    pub fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(width) = parse_override(&lookup, "GPULIFE_WIDTH", |v| v.parse::<u32>())? {
            self.width = width;
        }
        if let Some(height) = parse_override(&lookup, "GPULIFE_HEIGHT", |v| v.parse::<u32>())? {
            self.height = height;
        }
        if let Some(interval) = parse_override(&lookup, "GPULIFE_TICK", humantime::parse_duration)?
        {
            self.tick_interval = interval;
        }
        if let Some(max) = parse_override(&lookup, "GPULIFE_MAX_TICKS", |v| v.parse::<u64>())? {
            self.max_ticks = Some(max);
        }
        if let Some(seed) = parse_override(&lookup, "GPULIFE_SEED", |v| v.parse::<u64>())? {
            self.rng_seed = Some(seed);
        }
        if let Some(level) = parse_override(&lookup, "GPULIFE_LOG", |v| {
            v.parse::<log::LevelFilter>()
        })? {
            self.log_level = level;
        }
        Ok(self)
    }

    pub fn grid(&self) -> Result<GridDescriptor, ConfigError> {
        GridDescriptor::new(self.width, self.height)
    }

    /// Build both seed patterns and the initial metric buffer.
    pub fn initial_state(&self) -> Result<InitialState, ConfigError> {
        let grid = self.grid()?;
        let mut rng = match self.rng_seed {
            Some(seed) => fastrand::Rng::with_seed(seed),
            None => fastrand::Rng::new(),
        };
        Ok(InitialState {
            primary: self.primary_seed.fill(grid, &mut rng),
            secondary: self.secondary_seed.fill(grid, &mut rng),
            metrics: vec![INITIAL_METRIC; grid.cell_count()],
        })
    }
}

fn parse_override<T, E: std::fmt::Display>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(key) else {
        return Ok(None);
    };
    parse(value.trim())
        .map(Some)
        .map_err(|e| ConfigError::InvalidValue {
            key,
            value,
            reason: e.to_string(),
        })
}

/// One full grid of binary cell states, row-major.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimulationFrame {
    pub grid: GridDescriptor,
    pub cells: Vec<u32>,
}

impl SimulationFrame {
    /// An all-dead grid.
    pub fn new(grid: GridDescriptor) -> SimulationFrame {
        SimulationFrame {
            grid,
            cells: vec![0; grid.cell_count()],
        }
    }

    pub fn with_alive(grid: GridDescriptor, alive: &[(u32, u32)]) -> SimulationFrame {
        let mut frame = Self::new(grid);
        for &(x, y) in alive {
            let i = grid.index(x as i64, y as i64);
            frame.cells[i] = 1;
        }
        frame
    }

    pub fn is_alive(&self, x: u32, y: u32) -> bool {
        self.cells[self.grid.index(x as i64, y as i64)] != 0
    }

    pub fn live_count(&self) -> usize {
        self.cells.iter().filter(|&&c| c != 0).count()
    }
}

/// Contents of both state buffers and the metric buffer before the first tick.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// Buffer A
    pub primary: SimulationFrame,
    /// Buffer B
    pub secondary: SimulationFrame,
    pub metrics: Vec<u32>,
}

impl InitialState {
    pub fn grid(&self) -> GridDescriptor {
        self.primary.grid
    }

    /// Both seeds share one grid and every buffer holds one value per cell.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let grid = self.grid();
        grid.check_len("state A", self.primary.cells.len())?;
        grid.check_same("state B", self.secondary.grid)?;
        grid.check_len("state B", self.secondary.cells.len())?;
        grid.check_len("neighbour counts", self.metrics.len())
    }

    /// Start from `primary` with an empty buffer B and a fresh metric buffer.
    pub fn from_frame(primary: SimulationFrame) -> InitialState {
        let grid = primary.grid;
        InitialState {
            primary,
            secondary: SimulationFrame::new(grid),
            metrics: vec![INITIAL_METRIC; grid.cell_count()],
        }
    }
}

/// Next state of a cell given its live neighbour count and current state.
///
/// Counts 1 and 2 keep the current state, 3 and 5 bring the cell alive and
/// everything else kills it. 10 cannot occur with eight neighbours but is
/// treated as a birth count all the same.
#[inline(always)]
pub fn next_state(neighbors: u32, current: u32) -> u32 {
    match neighbors {
        1 | 2 => current,
        3 | 5 | 10 => 1,
        _ => 0,
    }
}

const NEIGHBORS: [(i64, i64); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (-1, 0),
    (1, 0),
    (-1, 1),
    (0, 1),
    (1, 1),
];

/// Live cells among the eight wrapped neighbours of `(x, y)`.
#[inline(always)]
pub fn neighbor_count(grid: GridDescriptor, state: &[u32], x: u32, y: u32) -> u32 {
    NEIGHBORS
        .iter()
        .map(|&(dx, dy)| state[grid.index(x as i64 + dx, y as i64 + dy)])
        .sum()
}

struct CellUpdate {
    index: usize,
    state: u32,
    neighbors: u32,
}

fn update_tile(grid: GridDescriptor, state_in: &[u32], tile: usize) -> Vec<CellUpdate> {
    let (tiles_x, _) = grid.tiles();
    let x0 = (tile % tiles_x as usize) as u32 * TILE_SIZE;
    let y0 = (tile / tiles_x as usize) as u32 * TILE_SIZE;
    let x1 = (x0 + TILE_SIZE).min(grid.width());
    let y1 = (y0 + TILE_SIZE).min(grid.height());

    let mut updates = Vec::with_capacity((TILE_SIZE * TILE_SIZE) as usize);
    for y in y0..y1 {
        for x in x0..x1 {
            let index = grid.index(x as i64, y as i64);
            let neighbors = neighbor_count(grid, state_in, x, y);
            updates.push(CellUpdate {
                index,
                state: next_state(neighbors, state_in[index]),
                neighbors,
            });
        }
    }
    updates
}

/// Advance `state_in` by one generation into `state_out`, recording every
/// cell's neighbour count in `metric_out`.
///
/// One unit of work runs per tile and only ever reads `state_in`, so the
/// result does not depend on the order tiles are evaluated in.
pub fn advance(
    grid: GridDescriptor,
    state_in: &[u32],
    state_out: &mut [u32],
    metric_out: &mut [u32],
) -> Result<(), ConfigError> {
    grid.check_len("input state", state_in.len())?;
    grid.check_len("output state", state_out.len())?;
    grid.check_len("neighbour counts", metric_out.len())?;
    advance_tiles(grid, state_in, state_out, metric_out);
    Ok(())
}

/// [`advance`] on buffers already known to match `grid`.
fn advance_tiles(
    grid: GridDescriptor,
    state_in: &[u32],
    state_out: &mut [u32],
    metric_out: &mut [u32],
) {
    let tiles: Vec<_> = (0..grid.tile_count())
        .into_par_iter()
        .map(|tile| update_tile(grid, state_in, tile))
        .collect();

    for update in tiles.into_iter().flatten() {
        state_out[update.index] = update.state;
        metric_out[update.index] = update.neighbors;
    }
}

/// Borrow the read side and the write side of a binding set at once.
fn split_states<'a>(
    states: &'a mut [Vec<u32>; 2],
    bindings: &BindingSet,
) -> (&'a [u32], &'a mut [u32]) {
    let [a, b] = states;
    match (bindings.read, bindings.write) {
        (0, 1) => (a, b),
        (1, 0) => (b, a),
        _ => unreachable!("binding sets always pair two distinct buffers"),
    }
}

/// Host-side reference backend: the same double buffer, binding sets and
/// tick sequence as the GPU, evaluated with rayon.
pub struct HostSimulation {
    grid: GridDescriptor,
    states: [Vec<u32>; 2],
    metrics: Vec<u32>,
    last_frame: Option<Frame>,
}

impl HostSimulation {
    pub fn new(initial: InitialState) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            grid: initial.grid(),
            states: [initial.primary.cells, initial.secondary.cells],
            metrics: initial.metrics,
            last_frame: None,
        })
    }

    pub fn grid(&self) -> GridDescriptor {
        self.grid
    }

    /// Contents of state buffer `0` (A) or `1` (B).
    pub fn state(&self, buffer: usize) -> Option<SimulationFrame> {
        self.states.get(buffer).map(|cells| SimulationFrame {
            grid: self.grid,
            cells: cells.clone(),
        })
    }

    pub fn metrics(&self) -> &[u32] {
        &self.metrics
    }

    /// The last presented frame.
    pub fn last_frame(&self) -> Option<&Frame> {
        self.last_frame.as_ref()
    }
}

impl TickBackend for HostSimulation {
    type Frame = Frame;

    fn acquire_frame(&mut self) -> Result<Option<Frame>, LifeError> {
        Ok(Some(Frame::cleared(rendering::CLEAR_COLOR)))
    }

    fn dispatch(&mut self, _frame: &mut Frame, bindings: &BindingSet) {
        let (state_in, state_out) = split_states(&mut self.states, bindings);
        advance_tiles(self.grid, state_in, state_out, &mut self.metrics);
    }

    fn draw(&mut self, frame: &mut Frame, bindings: &BindingSet) {
        frame.instances =
            rendering::rasterize(self.grid, &self.states[bindings.read], &self.metrics);
    }

    fn present(&mut self, frame: Frame) -> Result<(), LifeError> {
        self.last_frame = Some(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::BINDING_SETS;

    fn grid(w: u32, h: u32) -> GridDescriptor {
        GridDescriptor::new(w, h).expect("valid grid")
    }

    /// Straightforward row-by-row evaluation, no tiling.
    fn advance_serial(g: GridDescriptor, state_in: &[u32]) -> (Vec<u32>, Vec<u32>) {
        let mut out = vec![0; g.cell_count()];
        let mut metric = vec![0; g.cell_count()];
        for y in 0..g.height() {
            for x in 0..g.width() {
                let i = g.index(x as i64, y as i64);
                let n = neighbor_count(g, state_in, x, y);
                metric[i] = n;
                out[i] = next_state(n, state_in[i]);
            }
        }
        (out, metric)
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(matches!(
            GridDescriptor::new(0, 4),
            Err(ConfigError::ZeroDimension { .. })
        ));
        assert!(matches!(
            GridDescriptor::new(4, 0),
            Err(ConfigError::ZeroDimension { .. })
        ));
    }

    #[test]
    fn rejects_unaddressable_grids() {
        assert!(matches!(
            GridDescriptor::new(u32::MAX, 2),
            Err(ConfigError::TooManyCells { .. })
        ));
    }

    #[test]
    fn device_limits_bound_the_grid() {
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: 1024,
            ..wgpu::Limits::downlevel_defaults()
        };
        assert!(grid(16, 16).check_limits(&limits).is_ok());
        assert!(matches!(
            grid(17, 16).check_limits(&limits),
            Err(ConfigError::TooManyCells { max: 256, .. })
        ));

        let limits = wgpu::Limits {
            max_compute_workgroups_per_dimension: 2,
            ..wgpu::Limits::downlevel_defaults()
        };
        assert!(grid(16, 16).check_limits(&limits).is_ok());
        assert!(matches!(
            grid(17, 4).check_limits(&limits),
            Err(ConfigError::TooManyTiles { tiles: 3, max: 2 })
        ));
    }

    #[test]
    fn wrapped_index_is_a_bijection() {
        for (w, h) in [(1, 1), (1, 5), (3, 2), (4, 4), (7, 9)] {
            let g = grid(w, h);
            let mut seen = vec![false; g.cell_count()];
            for y in 0..h as i64 {
                for x in 0..w as i64 {
                    let i = g.index(x, y);
                    assert!(!seen[i], "index {i} hit twice on {w}x{h}");
                    seen[i] = true;
                    assert_eq!(g.coords(i), (x as u32, y as u32));
                }
            }
            assert!(seen.iter().all(|&s| s));
        }
    }

    #[test]
    fn index_wraps_around_every_edge() {
        let g = grid(5, 3);
        assert_eq!(g.index(-1, 0), g.index(4, 0));
        assert_eq!(g.index(5, 0), g.index(0, 0));
        assert_eq!(g.index(0, -1), g.index(0, 2));
        assert_eq!(g.index(0, 3), g.index(0, 0));
        assert_eq!(g.index(-6, -4), g.index(4, 2));
    }

    #[test]
    fn tiles_round_up() {
        assert_eq!(grid(256, 256).tiles(), (32, 32));
        assert_eq!(grid(9, 8).tiles(), (2, 1));
        assert_eq!(grid(1, 17).tile_count(), 3);
    }

    #[test]
    fn rule_table() {
        for current in [0, 1] {
            assert_eq!(next_state(1, current), current);
            assert_eq!(next_state(2, current), current);
            assert_eq!(next_state(3, current), 1);
            assert_eq!(next_state(5, current), 1);
            assert_eq!(next_state(10, current), 1);
            for n in [0, 4, 6, 7, 8, 9, 11] {
                assert_eq!(next_state(n, current), 0, "count {n}");
            }
        }
    }

    #[test]
    fn neighbor_count_wraps() {
        let g = grid(4, 4);
        let frame = SimulationFrame::with_alive(g, &[(3, 3)]);
        assert_eq!(neighbor_count(g, &frame.cells, 0, 0), 1);
        assert_eq!(neighbor_count(g, &frame.cells, 3, 0), 1);
        assert_eq!(neighbor_count(g, &frame.cells, 1, 1), 0);
        assert_eq!(neighbor_count(g, &frame.cells, 3, 3), 0);
    }

    #[test]
    fn neighbor_count_on_a_full_grid_is_eight() {
        let g = grid(3, 3);
        let full = vec![1; g.cell_count()];
        for y in 0..3 {
            for x in 0..3 {
                assert_eq!(neighbor_count(g, &full, x, y), 8);
            }
        }
    }

    #[test]
    fn single_seed_dies_and_marks_its_neighbours() {
        let g = grid(4, 4);
        let seed = SimulationFrame::with_alive(g, &[(1, 1)]);
        let mut out = vec![7; g.cell_count()];
        let mut metric = vec![7; g.cell_count()];
        advance(g, &seed.cells, &mut out, &mut metric).expect("advance");

        assert!(out.iter().all(|&c| c == 0));
        for y in 0..4 {
            for x in 0..4 {
                let expected = if (x, y) == (1, 1) {
                    0
                } else if (0..=2).contains(&x) && (0..=2).contains(&y) {
                    1
                } else {
                    0
                };
                assert_eq!(metric[g.index(x, y)], expected, "metric at ({x}, {y})");
            }
        }
    }

    #[test]
    fn all_dead_grid_stays_dead() {
        let g = grid(13, 6);
        let dead = vec![0; g.cell_count()];
        let mut out = vec![1; g.cell_count()];
        let mut metric = vec![1; g.cell_count()];
        advance(g, &dead, &mut out, &mut metric).expect("advance");
        assert!(out.iter().all(|&c| c == 0));
        assert!(metric.iter().all(|&m| m == 0));
    }

    #[test]
    fn tiled_advance_matches_serial_evaluation() {
        let mut rng = fastrand::Rng::with_seed(7);
        for (w, h) in [(1, 1), (2, 3), (8, 8), (13, 21), (40, 17)] {
            let g = grid(w, h);
            let state: Vec<u32> = (0..g.cell_count()).map(|_| rng.bool() as u32).collect();
            let (expected_out, expected_metric) = advance_serial(g, &state);

            let mut out = vec![0; g.cell_count()];
            let mut metric = vec![0; g.cell_count()];
            advance(g, &state, &mut out, &mut metric).expect("advance");
            assert_eq!(out, expected_out, "{w}x{h} state");
            assert_eq!(metric, expected_metric, "{w}x{h} metric");
        }
    }

    #[test]
    fn metric_counts_live_neighbours_exactly() {
        let mut rng = fastrand::Rng::with_seed(99);
        let g = grid(11, 9);
        let state: Vec<u32> = (0..g.cell_count()).map(|_| (rng.f32() > 0.6) as u32).collect();
        let mut out = vec![0; g.cell_count()];
        let mut metric = vec![0; g.cell_count()];
        advance(g, &state, &mut out, &mut metric).expect("advance");

        for y in 0..g.height() as i64 {
            for x in 0..g.width() as i64 {
                let mut n = 0;
                for dy in -1..=1 {
                    for dx in -1..=1 {
                        if (dx, dy) != (0, 0) {
                            n += state[g.index(x + dx, y + dy)];
                        }
                    }
                }
                assert_eq!(metric[g.index(x, y)], n);
            }
        }
    }

    #[test]
    fn blinker_period_under_the_relaxed_rule() {
        // Counts of 1 and 2 preserve state, so the row of three keeps its
        // ends alive and grows the column through the count-3 births.
        let g = grid(5, 5);
        let row = SimulationFrame::with_alive(g, &[(1, 2), (2, 2), (3, 2)]);
        let mut out = vec![0; g.cell_count()];
        let mut metric = vec![0; g.cell_count()];
        advance(g, &row.cells, &mut out, &mut metric).expect("advance");
        let next = SimulationFrame { grid: g, cells: out };
        assert!(next.is_alive(2, 1));
        assert!(next.is_alive(2, 3));
        assert!(next.is_alive(1, 2));
        assert!(next.is_alive(3, 2));
        assert_eq!(metric[g.index(2, 2)], 2);
    }

    #[test]
    fn seed_policies() {
        let g = grid(4, 3);
        let mut rng = fastrand::Rng::with_seed(1);
        let checker = SeedPolicy::Checkerboard.fill(g, &mut rng);
        assert_eq!(checker.cells, vec![0, 1, 0, 1, 0, 1, 0, 1, 0, 1, 0, 1]);

        let never = SeedPolicy::Random { alive_above: 1.0 }.fill(g, &mut rng);
        assert_eq!(never.live_count(), 0);
        let always = SeedPolicy::Random { alive_above: -1.0 }.fill(g, &mut rng);
        assert_eq!(always.live_count(), g.cell_count());

        let diagonal = SeedPolicy::Custom(|i, g| {
            let (x, y) = g.coords(i);
            x == y
        })
        .fill(g, &mut rng);
        assert_eq!(diagonal.live_count(), 3);
        assert!(diagonal.is_alive(2, 2));
    }

    #[test]
    fn random_seed_is_sparse_and_reproducible() {
        let params = SimulationParameters {
            rng_seed: Some(42),
            ..Default::default()
        };
        let a = params.initial_state().expect("initial state");
        let b = params.initial_state().expect("initial state");
        assert_eq!(a.primary, b.primary);

        let density = a.primary.live_count() as f32 / a.primary.cells.len() as f32;
        assert!((0.04..0.08).contains(&density), "density {density}");
        assert_eq!(a.secondary.live_count(), a.secondary.cells.len() / 2);
        assert!(a.metrics.iter().all(|&m| m == INITIAL_METRIC));
    }

    #[test]
    fn overrides_are_parsed() {
        let params = SimulationParameters::default()
            .with_overrides(|key| match key {
                "GPULIFE_WIDTH" => Some("64".into()),
                "GPULIFE_TICK" => Some("250ms".into()),
                "GPULIFE_MAX_TICKS" => Some("10".into()),
                "GPULIFE_LOG" => Some("debug".into()),
                _ => None,
            })
            .expect("valid overrides");
        assert_eq!(params.width, 64);
        assert_eq!(params.height, 256);
        assert_eq!(params.tick_interval, Duration::from_millis(250));
        assert_eq!(params.max_ticks, Some(10));
        assert_eq!(params.log_level, log::LevelFilter::Debug);
    }

    #[test]
    fn malformed_override_is_a_config_error() {
        let err = SimulationParameters::default()
            .with_overrides(|key| (key == "GPULIFE_TICK").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                key: "GPULIFE_TICK",
                ..
            }
        ));
    }

    #[test]
    fn zero_width_fails_before_seeding() {
        let params = SimulationParameters {
            width: 0,
            ..Default::default()
        };
        assert!(matches!(
            params.initial_state(),
            Err(ConfigError::ZeroDimension { .. })
        ));
    }

    #[test]
    fn advance_rejects_mismatched_buffers() {
        let g = grid(4, 4);
        let state = vec![0; 16];
        let mut out = vec![0; 15];
        let mut metric = vec![0; 16];
        assert!(matches!(
            advance(g, &state, &mut out, &mut metric),
            Err(ConfigError::SizeMismatch {
                what: "output state",
                expected: 16,
                actual: 15,
            })
        ));
    }

    #[test]
    fn host_simulation_validates_initial_state() {
        let g = grid(4, 4);
        let mut initial = InitialState::from_frame(SimulationFrame::new(g));
        initial.metrics.pop();
        assert!(matches!(
            HostSimulation::new(initial),
            Err(ConfigError::SizeMismatch { .. })
        ));

        let mut initial = InitialState::from_frame(SimulationFrame::new(g));
        initial.secondary = SimulationFrame::new(grid(4, 5));
        assert!(matches!(
            HostSimulation::new(initial),
            Err(ConfigError::GridMismatch {
                expected: (4, 4),
                actual: (4, 5),
                ..
            })
        ));

        let sim = HostSimulation::new(InitialState::from_frame(SimulationFrame::new(g)))
            .expect("valid state");
        assert!(sim.state(1).is_some());
        assert!(sim.state(2).is_none());
    }

    #[test]
    fn split_never_aliases() {
        for set in &BINDING_SETS {
            let mut states = [vec![0u32; 4], vec![1u32; 4]];
            let (read, write) = split_states(&mut states, set);
            assert_eq!(read[0], set.read as u32);
            write[0] = 9;
            assert_eq!(states[set.write][0], 9);
            assert_eq!(states[set.read][0], set.read as u32);
        }
    }
}
