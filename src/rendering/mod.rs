//! Geometry and colour policy of the cell renderer.
//!
//! `render.wgsl` does this per vertex and fragment on the GPU; the functions
//! here compute the same values on the host for the reference backend.

use crate::sim::GridDescriptor;
use crate::util::Color;

/// Two triangles covering the central 80% of a `[-1, 1]` cell.
pub const QUAD_VERTICES: [[f32; 2]; 6] = [
    [-0.8, -0.8],
    [0.8, -0.8],
    [0.8, 0.8],
    [-0.8, -0.8],
    [0.8, 0.8],
    [-0.8, 0.8],
];

pub const VERTICES_PER_CELL: u32 = QUAD_VERTICES.len() as u32;

pub const CLEAR_COLOR: Color = Color::rgba(0.0, 0.0, 0.4, 1.0);

/// Grid cell drawn by instance `instance`.
pub fn instance_cell(grid: GridDescriptor, instance: u32) -> (u32, u32) {
    (instance % grid.width(), instance / grid.width())
}

/// Clip-space centre of a cell: `2 * cell / grid - 1 + 1 / grid`.
pub fn cell_offset(grid: GridDescriptor, (x, y): (u32, u32)) -> [f32; 2] {
    let (w, h) = (grid.width() as f32, grid.height() as f32);
    [
        2.0 * x as f32 / w - 1.0 + 1.0 / w,
        2.0 * y as f32 / h - 1.0 + 1.0 / h,
    ]
}

/// Position of one quad vertex for a cell. Dead cells collapse onto the centre.
pub fn transform_vertex(
    grid: GridDescriptor,
    cell: (u32, u32),
    state: u32,
    vertex: [f32; 2],
) -> [f32; 2] {
    let (w, h) = (grid.width() as f32, grid.height() as f32);
    let [ox, oy] = cell_offset(grid, cell);
    let s = state as f32;
    [vertex[0] * s / w + ox, vertex[1] * s / h + oy]
}

/// Colour ramp over the neighbour count. Channels start at `count / 10`;
/// above 4 green is boosted tenfold, above 2 red fourfold, otherwise blue
/// tenfold. Not clamped.
pub fn cell_color(neighbors: u32) -> Color {
    let c = neighbors as f32 / 10.0;
    if neighbors > 4 {
        Color::rgba(c, c * 10.0, c, 1.0)
    } else if neighbors > 2 {
        Color::rgba(c * 4.0, c, c, 1.0)
    } else {
        Color::rgba(c, c, c * 10.0, 1.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CellInstance {
    pub cell: (u32, u32),
    pub vertices: [[f32; 2]; 6],
    /// Colour as written to the target, i.e. clamped.
    pub color: Color,
}

impl CellInstance {
    /// Dead cells produce a zero-area quad.
    pub fn is_visible(&self) -> bool {
        self.vertices.iter().any(|v| *v != self.vertices[0])
    }
}

/// One drawn frame: the clear colour and one instance per grid cell.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub clear: Color,
    pub instances: Vec<CellInstance>,
}

impl Frame {
    pub fn cleared(clear: Color) -> Self {
        Self {
            clear,
            instances: Vec::new(),
        }
    }

    pub fn visible(&self) -> impl Iterator<Item = &CellInstance> {
        self.instances.iter().filter(|i| i.is_visible())
    }
}

/// Build every instance the draw call would emit for `state` and `metrics`.
/// Cells missing from either slice are not drawn.
pub fn rasterize(grid: GridDescriptor, state: &[u32], metrics: &[u32]) -> Vec<CellInstance> {
    state
        .iter()
        .zip(metrics)
        .take(grid.cell_count())
        .enumerate()
        .map(|(i, (&s, &count))| {
            let cell = instance_cell(grid, i as u32);
            CellInstance {
                cell,
                vertices: QUAD_VERTICES.map(|v| transform_vertex(grid, cell, s, v)),
                color: cell_color(count).clamped(),
            }
        })
        .collect()
}
