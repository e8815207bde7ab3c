//! Where each register of a lane sits in its tensor.
//!
//! A layout places register `r` of the lane `(lane, warp)` at
//!
//! ```text
//! coord[d] = static[r][d] + lane_part[d](lane) + warp_part[d](warp)
//! ```
//!
//! wrapped modulo the extent when the layout tile is larger than the
//! tensor. Registers are enumerated in the layout's own offset order, so
//! register `r` here is register offset `r` of [`tlc_layout::Owner`].
//!
//! Layouts round up: the unwrapped coordinate of a register may reach past
//! the extent. Such a register holds either a replica (the tile wraps) or
//! nothing (the last repetition overhangs). [`Distribution::emit_in_bounds`]
//! tells the two apart at run time.

use crate::ll::{Builder, IntPredicate, Value};
use crate::{CodegenError, CodegenResult};
use smallvec::SmallVec;
use tlc_layout::{BlockedLayout, Dims, DotOperandLayout, Layout, SliceLayout};

/// `((id / stride) % count) * scale`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Term {
    stride: u32,
    count: u32,
    scale: u32,
}

/// The lane and warp dependent part of one dimension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct DimBase {
    lane: Option<Term>,
    warp: Option<Term>,
    wrap: Option<u32>,
}

impl DimBase {
    /// Largest value the lane and warp part takes.
    fn max(&self) -> u32 {
        [self.lane, self.warp]
            .into_iter()
            .flatten()
            .map(|t| (t.count - 1) * t.scale)
            .sum()
    }
}

/// How register coordinates of one dimension map to element coordinates,
/// for blocked dimensions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Blocking {
    spt: u32,
    tpw: u32,
    tile: u32,
    lane_stride: u32,
}

/// One dimension of a distribution.
#[derive(Clone, Debug)]
struct Dim {
    /// Static offset of each register coordinate.
    statics: Vec<u32>,
    base: DimBase,
    blocking: Option<Blocking>,
    /// Extent of the tensor along this dimension.
    extent: u32,
}

/// The static register placement of a layout for one shape.
#[derive(Clone, Debug)]
pub(crate) struct Distribution {
    /// Static coordinate offset of every register.
    pub registers: Vec<Dims>,
    dims: Vec<Dim>,
    reg_stride: Dims,
    /// Lane and warp parts of layout dimensions the tensor does not have.
    /// Lanes that differ only there hold the same elements.
    dropped: Vec<DimBase>,
}

fn strides(extents: &[u32], order: &[u32]) -> Dims {
    let mut strides: Dims = SmallVec::from_elem(0, extents.len());
    let mut stride = 1;
    for &d in order {
        strides[d as usize] = stride;
        stride *= extents[d as usize];
    }
    strides
}

fn blocked_dims(layout: &BlockedLayout, shape: &[u32]) -> Vec<Dim> {
    let spt = &layout.size_per_thread;
    let tpw = &layout.threads_per_warp;
    let wpc = &layout.warps_per_cta;
    let tile = layout.shape_per_cta_tile();
    let local = layout.shape_per_cta(shape);
    let lane_stride = strides(tpw, &layout.order);
    let warp_stride = strides(wpc, &layout.order);
    (0..shape.len())
        .map(|d| {
            let extent = local[d].div_ceil(tile[d]) * spt[d];
            Dim {
                statics: (0..extent)
                    .map(|c| (c / spt[d]) * tile[d] + c % spt[d])
                    .collect(),
                base: DimBase {
                    lane: (tpw[d] > 1).then_some(Term {
                        stride: lane_stride[d],
                        count: tpw[d],
                        scale: spt[d],
                    }),
                    warp: (wpc[d] > 1).then_some(Term {
                        stride: warp_stride[d],
                        count: wpc[d],
                        scale: spt[d] * tpw[d],
                    }),
                    wrap: (tile[d] > local[d]).then_some(local[d]),
                },
                blocking: Some(Blocking {
                    spt: spt[d],
                    tpw: tpw[d],
                    tile: tile[d],
                    lane_stride: lane_stride[d],
                }),
                extent: local[d],
            }
        })
        .collect()
}

/// Dimensions, register order and dropped dimensions of a layout.
fn parts(layout: &Layout, shape: &[u32]) -> (Vec<Dim>, Dims, Vec<DimBase>) {
    match layout {
        Layout::Blocked(b) => (blocked_dims(b, shape), b.order.clone(), Vec::new()),
        Layout::Slice(s) => slice_parts(s, shape),
        Layout::DotOperand(d) => dot_parts(d, shape),
    }
}

fn slice_parts(layout: &SliceLayout, shape: &[u32]) -> (Vec<Dim>, Dims, Vec<DimBase>) {
    let (mut dims, _, mut dropped) = parts(&layout.parent, &layout.parent_shape(shape));
    dropped.push(dims.remove(layout.dim as usize).base);
    (dims, layout.order(), dropped)
}

fn dot_parts(layout: &DotOperandLayout, shape: &[u32]) -> (Vec<Dim>, Dims, Vec<DimBase>) {
    let (kept, parent_shape) = if layout.op_idx == 0 {
        (0, [shape[0], 1])
    } else {
        (1, [1, shape[1]])
    };
    let mut parent = blocked_dims(&layout.parent, &parent_shape);
    let k = Dim {
        statics: (0..shape[1 - kept]).collect(),
        base: DimBase::default(),
        blocking: None,
        extent: shape[1 - kept],
    };
    let kept_dim = parent.swap_remove(kept);
    let dropped = parent.into_iter().map(|d| d.base).collect();
    let dims = if kept == 0 {
        vec![kept_dim, k]
    } else {
        vec![k, kept_dim]
    };
    (dims, SmallVec::from_slice(&[1, 0]), dropped)
}

/// `acc + ((id / stride) % count) * scale`.
fn emit_term(b: &mut Builder<'_>, acc: Value, term: Option<Term>, id: &Value) -> Value {
    match term {
        Some(t) => {
            let q = b.udiv(id.clone(), Value::i32(i64::from(t.stride)));
            let c = b.urem(q, Value::i32(i64::from(t.count)));
            let part = b.mul(c, Value::i32(i64::from(t.scale)));
            b.add(acc, part)
        }
        None => acc,
    }
}

/// `lhs && rhs`, folding constants.
pub(crate) fn and_pred(b: &mut Builder<'_>, lhs: Value, rhs: Value) -> Value {
    match (lhs.as_int(), rhs.as_int()) {
        (Some(0), _) | (_, Some(1)) => lhs,
        (Some(_), _) | (_, Some(0)) => rhs,
        _ => b.and(lhs, rhs),
    }
}

/// Whether `off + base` (reduced modulo `span`) is below `extent` for every
/// `base` in `0..=max`, for none, or depends on the lane.
fn bound(off: u32, max: u32, extent: u32, span: Option<u32>) -> Option<bool> {
    let top = off + max;
    if span.is_some_and(|s| top >= s) {
        return None;
    }
    if top < extent {
        Some(true)
    } else if off >= extent {
        Some(false)
    } else {
        None
    }
}

impl Distribution {
    pub fn new(layout: &Layout, shape: &[u32]) -> CodegenResult<Self> {
        if layout.rank() != shape.len() {
            return Err(CodegenError::TypeError(format!(
                "rank {} layout used for a rank {} tensor",
                layout.rank(),
                shape.len()
            )));
        }
        let (dims, order, dropped) = parts(layout, shape);
        let extents: Dims = dims
            .iter()
            .map(|d| u32::try_from(d.statics.len()).unwrap_or(u32::MAX))
            .collect();
        let reg_stride = strides(&extents, &order);
        let total: u32 = extents.iter().product();
        let registers = (0..total)
            .map(|r| {
                dims.iter()
                    .enumerate()
                    .map(|(d, dim)| dim.statics[((r / reg_stride[d]) % extents[d]) as usize])
                    .collect()
            })
            .collect();
        Ok(Self {
            registers,
            dims,
            reg_stride,
            dropped,
        })
    }

    /// Registers each lane holds.
    pub fn len(&self) -> usize {
        self.registers.len()
    }

    /// Whether two distributions give every register the same lane and warp
    /// dependent base.
    pub fn same_base(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len()
            && self.dims.iter().zip(&other.dims).all(|(a, b)| a.base == b.base)
    }

    /// Whether every element sits in the same warp under both
    /// distributions, replicas included.
    pub fn same_warp_split(&self, other: &Self) -> bool {
        self.dims.len() == other.dims.len()
            && self
                .dims
                .iter()
                .zip(&other.dims)
                .all(|(a, b)| a.base.warp == b.base.warp && a.base.wrap == b.base.wrap)
    }

    /// Static offsets of register `r` reduced modulo `shape`, which
    /// identifies the element the register holds relative to the lane base.
    pub fn element_key(&self, r: usize, shape: &[u32]) -> Dims {
        self.registers[r]
            .iter()
            .zip(shape)
            .map(|(&off, &extent)| off % extent.max(1))
            .collect()
    }

    /// Emit the index of the calling warp along dimension `dim`.
    pub fn emit_warp_index(&self, b: &mut Builder<'_>, warp: &Value, dim: usize) -> Value {
        match self.dims.get(dim).and_then(|d| d.base.warp) {
            Some(t) => {
                let q = b.udiv(warp.clone(), Value::i32(i64::from(t.stride)));
                b.urem(q, Value::i32(i64::from(t.count)))
            }
            None => Value::i32(0),
        }
    }

    /// Whether [`Self::emit_locate`] can find the owner of an element.
    pub fn locatable(&self) -> bool {
        self.dims.iter().all(|d| d.blocking.is_some())
    }

    /// Emit the coordinates of every register of the calling lane.
    pub fn emit_coords(&self, b: &mut Builder<'_>, lane: &Value, warp: &Value) -> Vec<Vec<Value>> {
        let all: Vec<usize> = (0..self.len()).collect();
        self.emit_coords_at(b, lane, warp, &all)
    }

    /// Emit the lane and warp dependent part of dimension `d`, before
    /// wrapping.
    fn emit_base(&self, b: &mut Builder<'_>, lane: &Value, warp: &Value, d: usize) -> Value {
        let mut acc = Value::i32(0);
        for (term, id) in [(self.dims[d].base.lane, lane), (self.dims[d].base.warp, warp)] {
            acc = emit_term(b, acc, term, id);
        }
        acc
    }

    /// Emit the coordinates of the given registers of the calling lane.
    pub fn emit_coords_at(
        &self,
        b: &mut Builder<'_>,
        lane: &Value,
        warp: &Value,
        registers: &[usize],
    ) -> Vec<Vec<Value>> {
        let base: Vec<Value> = (0..self.dims.len())
            .map(|d| self.emit_base(b, lane, warp, d))
            .collect();
        registers
            .iter()
            .map(|&r| {
                self.registers[r]
                    .iter()
                    .zip(&self.dims)
                    .zip(&base)
                    .map(|((&off, dim), base)| {
                        let coord = b.add(base.clone(), Value::i32(i64::from(off)));
                        match dim.base.wrap {
                            Some(extent) => b.urem(coord, Value::i32(i64::from(extent))),
                            None => coord,
                        }
                    })
                    .collect()
            })
            .collect()
    }

    /// Emit, for each of the given registers, whether the calling lane's copy
    /// lies inside the tensor.
    ///
    /// Registers in an overhanging repetition are always outside. Wrapped
    /// replicas count as inside unless `canonical` is set; then only the one
    /// lane whose unwrapped coordinates equal the element's answers, so
    /// each element has exactly one owner. Dimension `except` is not
    /// checked.
    pub fn emit_in_bounds(
        &self,
        b: &mut Builder<'_>,
        lane: &Value,
        warp: &Value,
        registers: &[usize],
        canonical: bool,
        except: Option<usize>,
    ) -> Vec<Value> {
        let mut base: Vec<Option<Value>> = vec![None; self.dims.len()];
        let mut shared = Value::bool(true);
        if canonical {
            for dropped in &self.dropped {
                if dropped.max() == 0 {
                    continue;
                }
                let mut part = Value::i32(0);
                for (term, id) in [(dropped.lane, lane), (dropped.warp, warp)] {
                    part = emit_term(b, part, term, id);
                }
                let first = b.icmp(IntPredicate::Eq, part, Value::i32(0));
                shared = and_pred(b, shared, first);
            }
        }
        registers
            .iter()
            .map(|&r| {
                let mut pred = shared.clone();
                for (d, dim) in self.dims.iter().enumerate() {
                    if except == Some(d) || (dim.base.wrap.is_some() && !canonical) {
                        continue;
                    }
                    let off = self.registers[r][d];
                    let inside = match bound(off, dim.base.max(), dim.extent, None) {
                        Some(known) => Value::bool(known),
                        None => {
                            let at = base[d]
                                .get_or_insert_with(|| self.emit_base(b, lane, warp, d))
                                .clone();
                            let at = b.add(at, Value::i32(i64::from(off)));
                            b.icmp(IntPredicate::Ult, at, Value::i32(i64::from(dim.extent)))
                        }
                    };
                    pred = and_pred(b, pred, inside);
                }
                pred
            })
            .collect()
    }

    /// Emit, for each register, whether it contributes to a reduction over
    /// `dim` whose lanes and warps combine `span` consecutive unwrapped
    /// coordinates (all of them when `None`).
    ///
    /// Within every combining group the first `extent` coordinates hold
    /// each element once; the rest are replicas or overhang.
    pub fn emit_contributes(
        &self,
        b: &mut Builder<'_>,
        lane: &Value,
        warp: &Value,
        dim: usize,
        span: Option<u32>,
    ) -> Vec<Value> {
        let d = &self.dims[dim];
        let mut base: Option<Value> = None;
        (0..self.len())
            .map(|r| {
                let off = self.registers[r][dim];
                match bound(off, d.base.max(), d.extent, span) {
                    Some(known) => Value::bool(known),
                    None => {
                        let at = base
                            .get_or_insert_with(|| self.emit_base(b, lane, warp, dim))
                            .clone();
                        let mut at = b.add(at, Value::i32(i64::from(off)));
                        if let Some(span) = span {
                            at = b.urem(at, Value::i32(i64::from(span)));
                        }
                        b.icmp(IntPredicate::Ult, at, Value::i32(i64::from(d.extent)))
                    }
                }
            })
            .collect()
    }

    /// Emit the lane and register holding the element at `coords`.
    ///
    /// Returns `None` when a dimension is not blocked.
    pub fn emit_locate(&self, b: &mut Builder<'_>, coords: &[Value]) -> Option<(Value, Value)> {
        let i = |v: u32| Value::i32(i64::from(v));
        let mut lane = Value::i32(0);
        let mut reg = Value::i32(0);
        for ((dim, c), &stride) in self.dims.iter().zip(coords).zip(&self.reg_stride) {
            let blk = dim.blocking?;
            let within = b.urem(c.clone(), i(blk.tile));
            let l = b.udiv(within.clone(), i(blk.spt));
            let l = b.urem(l, i(blk.tpw));
            let l = b.mul(l, i(blk.lane_stride));
            lane = b.add(lane, l);
            let rep = b.udiv(c.clone(), i(blk.tile));
            let rep = b.mul(rep, i(blk.spt));
            let e = b.urem(within, i(blk.spt));
            let rc = b.add(rep, e);
            let r = b.mul(rc, i(stride));
            reg = b.add(reg, r);
        }
        Some((lane, reg))
    }
}
