//! Edge-aware output tiling.
//!
//! A micro-program can walk at most three strided dimensions, so a 2-D
//! window operation is split into tiles whose outputs all see the same
//! truncated filter window. Along each axis the outputs fall into three
//! kinds of ranges:
//!
//! ```text
//! out:    0   1   2   3   4   5   6   7
//!        [a] [a] [-------- b --------] [c]
//! a: window clipped by the near padding, one output per range
//! b: window fully inside the input, one range up to `center_max`
//! c: window clipped by the far edge, one output per range
//! ```
//!
//! Within a range the y axis is walked with a single row dimension that
//! rolls over. When the vertical stride and the truncated filter height do
//! not line up, consecutive output rows are spread across several phase
//! offsets, each issued as its own program; see [`RowGroup`].

#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use crate::params::Window;
use crate::shape::Shape;
use mvp_driver::limits::MAX_STRIDE;
use mvp_driver::{
    AluConfig, AluOp, ArrayId, Dim, LoadConfig, MvpError, ProgramContext, Result, StoreConfig,
};
use tracing::trace;

/// Geometry of one spatial axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Axis {
    /// Input extent.
    pub input: usize,
    /// Output extent.
    pub output: usize,
    /// Filter taps.
    pub filter: usize,
    /// Output-to-input stride.
    pub stride: usize,
    /// Near-edge padding.
    pub pad: usize,
    /// Distance between taps.
    pub dilation: usize,
}

impl Axis {
    /// Dense axis.
    pub const fn new(input: usize, output: usize, filter: usize, stride: usize, pad: usize) -> Self {
        Self {
            input,
            output,
            filter,
            stride,
            pad,
            dilation: 1,
        }
    }

    /// Set the tap distance.
    #[must_use]
    pub const fn with_dilation(mut self, dilation: usize) -> Self {
        self.dilation = dilation;
        self
    }

    /// Vertical axis of a window operation.
    pub const fn height(input: &Shape, output: &Shape, window: &Window) -> Self {
        Self::new(
            input.height,
            output.height,
            window.filter_height,
            window.stride_height,
            window.pad_height,
        )
        .with_dilation(window.dilation_height)
    }

    /// Horizontal axis of a window operation.
    pub const fn width(input: &Shape, output: &Shape, window: &Window) -> Self {
        Self::new(
            input.width,
            output.width,
            window.filter_width,
            window.stride_width,
            window.pad_width,
        )
        .with_dilation(window.dilation_width)
    }

    /// Input span covered by all taps.
    const fn extent(&self) -> i64 {
        ((self.filter - 1) * self.dilation + 1) as i64
    }

    /// Input coordinate of tap 0 for output `out`; negative inside padding.
    pub const fn origin(&self, out: usize) -> i64 {
        (out * self.stride) as i64 - self.pad as i64
    }

    /// Truncated tap range `[start, end)` for output `out`.
    pub fn taps(&self, out: usize) -> (usize, usize) {
        let origin = self.origin(out);
        let d = self.dilation as i64;
        let start = if origin < 0 { ceil_div(-origin, d) } else { 0 };
        let end = ceil_div(self.input as i64 - origin, d).min(self.filter as i64);
        (start as usize, end.max(start) as usize)
    }

    /// Input coordinate read by the first valid tap of output `out`.
    pub fn first_input(&self, out: usize) -> usize {
        let (start, _) = self.taps(out);
        (self.origin(out) + (start * self.dilation) as i64).max(0) as usize
    }

    /// Partition the outputs into ranges sharing one truncated window.
    pub fn ranges(&self) -> Vec<AxisRange> {
        let center_max = (self.input as i64 - self.extent() + self.pad as i64)
            .div_euclid(self.stride as i64);
        let mut ranges = Vec::new();
        let mut out_min = 0;
        while out_min < self.output {
            let origin = self.origin(out_min);
            let (tap_start, tap_end) = self.taps(out_min);
            let out_max = if origin >= 0 && self.input as i64 - origin >= self.extent() {
                (center_max.max(out_min as i64) as usize).min(self.output - 1)
            } else {
                out_min
            };
            ranges.push(AxisRange {
                out_min,
                out_max,
                tap_start,
                tap_end,
            });
            out_min = out_max + 1;
        }
        ranges
    }
}

fn ceil_div(a: i64, b: i64) -> i64 {
    if a <= 0 {
        0
    } else {
        (a + b - 1) / b
    }
}

/// Contiguous outputs sharing one truncated filter window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisRange {
    /// First output.
    pub out_min: usize,
    /// Last output (inclusive).
    pub out_max: usize,
    /// First valid tap.
    pub tap_start: usize,
    /// One past the last valid tap.
    pub tap_end: usize,
}

impl AxisRange {
    /// Number of outputs.
    #[allow(clippy::len_without_is_empty)]
    pub const fn len(&self) -> usize {
        self.out_max - self.out_min + 1
    }

    /// Number of valid taps.
    pub const fn taps(&self) -> usize {
        self.tap_end - self.tap_start
    }

    fn single(out: usize, tap_start: usize, tap_end: usize) -> Self {
        Self {
            out_min: out,
            out_max: out,
            tap_start,
            tap_end,
        }
    }
}

/// How consecutive output rows of one range share a rolling row walk.
///
/// `taps + extra == incr * stride`: every program walks `taps` input rows
/// per output, skips `extra` more, and produces every `incr`-th output row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowGroup {
    /// Output rows between two outputs of the same program.
    pub incr: usize,
    /// Input rows skipped after each output's taps.
    pub extra: usize,
}

impl RowGroup {
    /// Grouping for `rows` outputs with `taps` valid filter rows.
    pub const fn new(rows: usize, taps: usize, stride: usize, single_x: bool) -> Self {
        let (incr, extra) = if rows == 1 || single_x || stride == taps {
            (1, 0)
        } else if stride > taps {
            (1, stride - taps)
        } else if taps % stride == 0 {
            (taps / stride, 0)
        } else {
            (taps / stride + 1, stride - taps % stride)
        };
        Self { incr, extra }
    }
}

/// One program's worth of outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Output columns.
    pub x: AxisRange,
    /// Output rows of the enclosing range.
    pub y: AxisRange,
    /// The x range is one column wide and the row walk moves along y.
    pub single_x: bool,
    /// Output rows between two outputs of this tile.
    pub incr: usize,
    /// Phase of this tile within the row group.
    pub offset: usize,
    /// Output rows produced.
    pub rows: usize,
    /// Input rows skipped after each output's taps.
    pub skip_rows: usize,
    /// Input rows the row dimension spans before rolling over.
    pub in_rows: usize,
}

impl Tile {
    /// First output row.
    pub const fn first_row(&self) -> usize {
        self.y.out_min + self.offset
    }

    /// Every `(out_y, out_x)` this tile writes.
    pub fn outputs(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        (0..self.rows).flat_map(move |k| {
            let oy = self.first_row() + k * self.incr;
            (self.x.out_min..=self.x.out_max).map(move |ox| (oy, ox))
        })
    }
}

/// Output vector step: elements between two outputs of a tile, and how many
/// extra single-row increments are needed when `incr` rows do not fit one
/// stride.
pub fn output_step(incr: usize, row_elements: usize) -> (usize, usize) {
    if incr * row_elements > MAX_STRIDE as usize {
        (row_elements, incr - 1)
    } else {
        (incr * row_elements, 0)
    }
}

/// Split the output plane into tiles.
///
/// `collapse_stride` is the input vector stride a single-column tile would
/// use to step between output rows; collapsing is skipped when it does not
/// fit the stride field. Dilated rows cannot share a rolling walk, so a
/// dilated y axis is tiled one output row at a time.
///
/// # Errors
///
/// `InvalidRange` if a window lies entirely in padding or the row grouping
/// cannot be expressed.
pub fn plan(x: &Axis, y: &Axis, collapse_stride: usize) -> Result<Vec<Tile>> {
    let y_ranges: Vec<AxisRange> = if y.dilation > 1 {
        y.ranges()
            .into_iter()
            .flat_map(|r| {
                (r.out_min..=r.out_max).map(move |o| AxisRange::single(o, r.tap_start, r.tap_end))
            })
            .collect()
    } else {
        y.ranges()
    };

    let mut tiles = Vec::new();
    for xr in x.ranges() {
        if xr.taps() == 0 {
            return Err(MvpError::invalid_range(format!(
                "output column {} sees only padding",
                xr.out_min
            )));
        }
        let single_x = xr.len() <= 1 && collapse_stride <= MAX_STRIDE as usize;

        for yr in &y_ranges {
            let taps = yr.taps();
            if taps == 0 {
                return Err(MvpError::invalid_range(format!(
                    "output row {} sees only padding",
                    yr.out_min
                )));
            }
            let group = RowGroup::new(yr.len(), taps, y.stride, single_x);
            if yr.len() > 1 && !single_x && taps + group.extra != group.incr * y.stride {
                return Err(MvpError::invalid_range(format!(
                    "row group of {taps}+{} rows does not match stride {}",
                    group.extra, y.stride
                )));
            }

            for offset in 0..group.incr.min(yr.len()) {
                let rows = (yr.len() - offset).div_ceil(group.incr);
                let skip_rows = if rows == 1 { 0 } else { group.extra };
                let in_rows = if single_x {
                    if skip_rows != 0 {
                        return Err(MvpError::invalid_range(
                            "single-column tile cannot skip input rows",
                        ));
                    }
                    taps
                } else {
                    (taps + skip_rows) * rows
                };
                let tile = Tile {
                    x: xr,
                    y: *yr,
                    single_x,
                    incr: group.incr,
                    offset,
                    rows,
                    skip_rows,
                    in_rows,
                };
                trace!(
                    "tile x {}..={} y {}+{}k (k<{}) taps {}x{}",
                    xr.out_min,
                    xr.out_max,
                    tile.first_row(),
                    group.incr,
                    rows,
                    taps,
                    xr.taps()
                );
                tiles.push(tile);
            }
        }
    }
    Ok(tiles)
}

/// Split `count` output channels into groups a single program can walk.
///
/// The channel dimension of a filter walk steps by `channel_stride`; when
/// that does not fit the stride field each channel gets its own program.
pub fn channel_groups(count: usize, channel_stride: usize) -> Vec<(usize, usize)> {
    if count <= 1 || channel_stride <= MAX_STRIDE as usize {
        vec![(0, count)]
    } else {
        (0..count).map(|c| (c, 1)).collect()
    }
}

// ── Emission helpers ─────────────────────────────────────────────────────────

fn noop(ctx: &mut ProgramContext) {
    ctx.compute(AluOp::Noop, AluConfig::new(), LoadConfig::NONE, StoreConfig::NONE);
}

/// `count` increments of `dim` on `array` from do-nothing loops.
///
/// A single increment takes one loop, more take two.
pub(crate) fn emit_skip(ctx: &mut ProgramContext, array: ArrayId, dim: Dim, count: usize) {
    match count {
        0 => {}
        1 => {
            ctx.begin_loop(1);
            noop(ctx);
            ctx.end_loop();
            ctx.postloop_incr_dim(array, dim);
        }
        _ => {
            ctx.begin_loop(count - 1);
            ctx.begin_loop(1);
            noop(ctx);
            ctx.end_loop();
            ctx.postloop_incr_dim(array, dim);
            ctx.end_loop();
            ctx.postloop_incr_dim(array, dim);
        }
    }
}

/// The `extra` output-vector increments of [`output_step`].
pub(crate) fn emit_output_skip(ctx: &mut ProgramContext, output: ArrayId, extra: usize) {
    if extra == 0 {
        return;
    }
    ctx.begin_loop(extra);
    ctx.begin_loop(1);
    noop(ctx);
    ctx.end_loop();
    ctx.postloop_incr_dim(output, Dim::Vec);
    ctx.end_loop();
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_without_padding() {
        let axis = Axis::new(8, 4, 2, 2, 0);
        let ranges = axis.ranges();
        assert_eq!(ranges.len(), 1);
        assert_eq!((ranges[0].out_min, ranges[0].out_max), (0, 3));
        assert_eq!(ranges[0].taps(), 2);
    }

    #[test]
    fn test_ranges_with_same_padding() {
        // 5 inputs, 3 taps, stride 1, pad 1: edges truncated on both sides.
        let axis = Axis::new(5, 5, 3, 1, 1);
        let ranges = axis.ranges();
        let spans: Vec<_> = ranges
            .iter()
            .map(|r| (r.out_min, r.out_max, r.tap_start, r.tap_end))
            .collect();
        assert_eq!(spans, vec![(0, 0, 1, 3), (1, 3, 0, 3), (4, 4, 0, 2)]);
    }

    #[test]
    fn test_taps_with_dilation() {
        // Taps at origin, origin+2, origin+4.
        let axis = Axis::new(6, 6, 3, 1, 2).with_dilation(2);
        assert_eq!(axis.taps(0), (1, 3));
        assert_eq!(axis.first_input(0), 0);
        assert_eq!(axis.taps(2), (0, 3));
        assert_eq!(axis.taps(5), (0, 2));
        assert_eq!(axis.first_input(5), 3);
    }

    #[test]
    fn test_row_group_cases() {
        assert_eq!(RowGroup::new(1, 3, 2, false), RowGroup { incr: 1, extra: 0 });
        assert_eq!(RowGroup::new(4, 2, 2, false), RowGroup { incr: 1, extra: 0 });
        assert_eq!(RowGroup::new(4, 1, 3, false), RowGroup { incr: 1, extra: 2 });
        assert_eq!(RowGroup::new(4, 4, 2, false), RowGroup { incr: 2, extra: 0 });
        assert_eq!(RowGroup::new(4, 3, 2, false), RowGroup { incr: 2, extra: 1 });
        assert_eq!(RowGroup::new(4, 3, 2, true), RowGroup { incr: 1, extra: 0 });
    }

    #[test]
    fn test_output_step_splits_long_strides() {
        assert_eq!(output_step(2, 100), (200, 0));
        assert_eq!(output_step(3, 1000), (1000, 2));
    }

    #[test]
    fn test_plan_phase_offsets() {
        // 3-tap rows at stride 2 need two interleaved programs.
        let x = Axis::new(9, 4, 3, 2, 0);
        let y = Axis::new(9, 4, 3, 2, 0);
        let tiles = plan(&x, &y, 2 * 9).unwrap();
        assert_eq!(tiles.len(), 2);
        assert_eq!((tiles[0].offset, tiles[0].rows, tiles[0].incr), (0, 2, 2));
        assert_eq!((tiles[1].offset, tiles[1].rows), (1, 2));
        assert_eq!(tiles[0].skip_rows, 1);
        assert_eq!(tiles[0].in_rows, 8);
    }

    #[test]
    fn test_plan_rejects_window_in_padding() {
        let x = Axis::new(2, 3, 1, 1, 1);
        let y = Axis::new(2, 2, 1, 1, 0);
        let err = plan(&x, &y, 2).unwrap_err();
        assert_eq!(err.kind(), mvp_driver::ErrorKind::InvalidRange);
    }

    #[test]
    fn test_single_column_collapse() {
        let x = Axis::new(3, 1, 3, 1, 0);
        let y = Axis::new(6, 4, 3, 1, 0);
        let tiles = plan(&x, &y, 3).unwrap();
        assert_eq!(tiles.len(), 1);
        assert!(tiles[0].single_x);
        assert_eq!(tiles[0].in_rows, 3);
        assert_eq!(tiles[0].rows, 4);

        let tiles = plan(&x, &y, 4096).unwrap();
        assert!(!tiles[0].single_x);
    }

    #[test]
    fn test_channel_groups() {
        assert_eq!(channel_groups(8, 27), vec![(0, 8)]);
        assert_eq!(channel_groups(3, 3 * 3 * 256), vec![(0, 1), (1, 1), (2, 1)]);
        assert_eq!(channel_groups(1, 5000), vec![(0, 1)]);
    }

    #[test]
    fn test_skip_increments() {
        let mut ctx = ProgramContext::new();
        ctx.begin_program().unwrap();
        emit_skip(&mut ctx, ArrayId::A0, Dim::Row, 3);
        let loops = ctx.program().loops();
        assert_eq!(loops.len(), 2);
        assert_eq!(loops[0].iterations, 2);
        assert!(loops[0].increments(ArrayId::A0, Dim::Row));
        assert!(loops[1].increments(ArrayId::A0, Dim::Row));
        assert_eq!(ctx.program().instr_count, 1);
    }
}
