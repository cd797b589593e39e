//! Static pipeline topology.
//!
//! A [`StageTopology`] fixes the pipeline depth `P` and the number of model
//! layers. Resolving it against an interleave factor `V` yields a
//! [`VirtualLayout`]: rank `r` owns `V` non-contiguous layer chunks. With the
//! default [`Placement::Interleaved`], chunk `v` on rank `r` is logical
//! pipeline stage `r + v * P`.
//!
//! ```text
//! P = 2, V = 2, 8 layers:
//!   logical 0 (rank 0, chunk 0): layers 0..2
//!   logical 1 (rank 1, chunk 0): layers 2..4
//!   logical 2 (rank 0, chunk 1): layers 4..6
//!   logical 3 (rank 1, chunk 1): layers 6..8
//! ```
//!
//! [`Placement::VShape`] (ZB-V) folds the pipeline back onto itself: `V` is
//! always 2, chunk 0 on rank `r` is logical stage `r` and chunk 1 is
//! `2P - 1 - r`. Rank 0 then holds both the first and the last stage, and
//! the turn at rank `P - 1` is a local hand-off.
//!
//! ```text
//! P = 2, V-shape, 8 layers:
//!   logical 0 (rank 0, chunk 0): layers 0..2
//!   logical 1 (rank 1, chunk 0): layers 2..4
//!   logical 2 (rank 1, chunk 1): layers 4..6
//!   logical 3 (rank 0, chunk 1): layers 6..8
//! ```

use std::fmt;
use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// One virtual stage: a layer chunk owned by a rank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StageId {
    /// Virtual-stage index on the owning rank (`0..V`).
    pub chunk: usize,
    /// Position in the full pipeline (`0..P*V`).
    pub logical: usize,
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/c{}", self.logical, self.chunk)
    }
}

/// How virtual stages are assigned to ranks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    /// Round-robin: chunk `v` on rank `r` is logical stage `r + v * P`.
    #[default]
    Interleaved,
    /// ZB-V: two chunks per rank, logical stages `r` and `2P - 1 - r`.
    VShape,
}

impl Placement {
    /// Virtual stages per rank the placement requires, if it fixes one.
    pub fn required_chunks(&self) -> Option<usize> {
        match self {
            Placement::Interleaved => None,
            Placement::VShape => Some(2),
        }
    }
}

impl fmt::Display for Placement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Placement::Interleaved => f.write_str("interleaved"),
            Placement::VShape => f.write_str("v_shape"),
        }
    }
}

/// Pipeline depth and layer placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTopology {
    pipeline_depth: usize,
    num_layers: usize,
    virtual_stages: Option<usize>,
}

impl StageTopology {
    /// Create a topology with `pipeline_depth` ranks sharing `num_layers` layers evenly.
    pub fn new(pipeline_depth: usize, num_layers: usize) -> Result<Self> {
        if pipeline_depth == 0 {
            return Err(Error::config("pipeline_depth", "must be >= 1"));
        }
        if num_layers < pipeline_depth {
            return Err(Error::config(
                "num_layers",
                format!("{num_layers} layers cannot fill {pipeline_depth} pipeline stages"),
            ));
        }
        if num_layers % pipeline_depth != 0 {
            return Err(Error::config(
                "num_layers",
                format!("{num_layers} layers must be divisible by pipeline_depth {pipeline_depth}"),
            ));
        }
        Ok(Self {
            pipeline_depth,
            num_layers,
            virtual_stages: None,
        })
    }

    /// Pin the number of virtual stages per rank.
    ///
    /// Schedules built from this topology must then use the same interleave factor.
    pub fn with_virtual_stages(mut self, virtual_stages: usize) -> Result<Self> {
        check_interleave(self.layers_per_rank(), virtual_stages)?;
        self.virtual_stages = Some(virtual_stages);
        Ok(self)
    }

    /// Number of ranks in the pipeline (`P`).
    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth
    }

    /// Model layers across the whole pipeline.
    pub fn num_layers(&self) -> usize {
        self.num_layers
    }

    /// Virtual stages per rank pinned by [`with_virtual_stages`](Self::with_virtual_stages).
    pub fn virtual_stages(&self) -> Option<usize> {
        self.virtual_stages
    }

    /// Layers owned by each rank, summed over its chunks.
    pub fn layers_per_rank(&self) -> usize {
        self.num_layers / self.pipeline_depth
    }

    /// Resolve the round-robin layer layout for `interleave_factor` virtual stages per rank.
    pub fn layout(&self, interleave_factor: usize) -> Result<VirtualLayout> {
        self.layout_with(interleave_factor, Placement::Interleaved)
    }

    /// Resolve the layer layout for `interleave_factor` virtual stages per rank under `placement`.
    pub fn layout_with(&self, interleave_factor: usize, placement: Placement) -> Result<VirtualLayout> {
        if let Some(required) = placement.required_chunks() {
            if interleave_factor != required {
                return Err(Error::config(
                    "interleave_factor",
                    format!("{placement} placement needs exactly {required} virtual stages per rank, got {interleave_factor}"),
                ));
            }
            if self.layers_per_rank() % required != 0 {
                return Err(Error::config(
                    "num_layers",
                    format!(
                        "{placement} placement needs an even number of layers per rank, got {}",
                        self.layers_per_rank()
                    ),
                ));
            }
        }
        check_interleave(self.layers_per_rank(), interleave_factor)?;
        if let Some(pinned) = self.virtual_stages {
            if pinned != interleave_factor {
                return Err(Error::config(
                    "interleave_factor",
                    format!("topology pins {pinned} virtual stages per rank, got {interleave_factor}"),
                ));
            }
        }
        Ok(VirtualLayout {
            pipeline_depth: self.pipeline_depth,
            chunks: interleave_factor,
            layers_per_chunk: self.layers_per_rank() / interleave_factor,
            placement,
        })
    }
}

fn check_interleave(layers_per_rank: usize, interleave_factor: usize) -> Result<()> {
    if interleave_factor == 0 {
        return Err(Error::config("interleave_factor", "must be >= 1"));
    }
    if layers_per_rank % interleave_factor != 0 {
        return Err(Error::config(
            "interleave_factor",
            format!(
                "{interleave_factor} does not evenly divide the {layers_per_rank} layers assigned to each rank"
            ),
        ));
    }
    Ok(())
}

/// Resolved mapping between ranks, chunks, logical stages and layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualLayout {
    pipeline_depth: usize,
    chunks: usize,
    layers_per_chunk: usize,
    #[serde(default)]
    placement: Placement,
}

impl VirtualLayout {
    /// Number of ranks (`P`).
    pub fn pipeline_depth(&self) -> usize {
        self.pipeline_depth
    }

    /// How chunks map onto logical stages.
    pub fn placement(&self) -> Placement {
        self.placement
    }

    /// Virtual stages per rank (`V`).
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    /// Stages in the full pipeline (`P*V`).
    pub fn num_logical_stages(&self) -> usize {
        self.pipeline_depth * self.chunks
    }

    /// Stage held by `rank` as its `chunk`-th virtual stage.
    pub fn stage(&self, rank: usize, chunk: usize) -> StageId {
        let p = self.pipeline_depth;
        let logical = match self.placement {
            Placement::Interleaved => rank + chunk * p,
            Placement::VShape if chunk == 0 => rank,
            Placement::VShape => 2 * p - 1 - rank,
        };
        StageId { chunk, logical }
    }

    /// Stage at pipeline position `logical`.
    pub fn stage_at(&self, logical: usize) -> StageId {
        let chunk = match self.placement {
            Placement::Interleaved => logical / self.pipeline_depth,
            Placement::VShape => usize::from(logical >= self.pipeline_depth),
        };
        StageId { chunk, logical }
    }

    /// Rank that owns `stage`.
    pub fn rank_of(&self, stage: StageId) -> usize {
        let p = self.pipeline_depth;
        match self.placement {
            Placement::Interleaved => stage.logical % p,
            Placement::VShape if stage.logical < p => stage.logical,
            Placement::VShape => 2 * p - 1 - stage.logical,
        }
    }

    pub fn is_first(&self, stage: StageId) -> bool {
        stage.logical == 0
    }

    pub fn is_last(&self, stage: StageId) -> bool {
        stage.logical + 1 == self.num_logical_stages()
    }

    /// Upstream neighbour in forward order.
    pub fn prev(&self, stage: StageId) -> Option<StageId> {
        if self.is_first(stage) {
            None
        } else {
            Some(self.stage_at(stage.logical - 1))
        }
    }

    /// Downstream neighbour in forward order.
    pub fn next(&self, stage: StageId) -> Option<StageId> {
        if self.is_last(stage) {
            None
        } else {
            Some(self.stage_at(stage.logical + 1))
        }
    }

    /// Model layers computed by `stage`.
    pub fn layers(&self, stage: StageId) -> Range<usize> {
        let start = stage.logical * self.layers_per_chunk;
        start..start + self.layers_per_chunk
    }

    /// Virtual stages owned by `rank`, in chunk order.
    pub fn stages_of(&self, rank: usize) -> impl Iterator<Item = StageId> + '_ {
        (0..self.chunks).map(move |chunk| self.stage(rank, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topology_rejects_zero_depth() {
        assert!(matches!(
            StageTopology::new(0, 8),
            Err(Error::Configuration {
                parameter: "pipeline_depth",
                ..
            })
        ));
    }

    #[test]
    fn test_topology_rejects_uneven_layers() {
        let err = StageTopology::new(3, 8).unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration {
                parameter: "num_layers",
                ..
            }
        ));
    }

    #[test]
    fn test_interleave_must_divide_rank_layers() {
        let topo = StageTopology::new(2, 6).unwrap();
        assert!(topo.layout(3).is_ok());
        let err = topo.layout(2).unwrap_err();
        assert!(err.to_string().contains("interleave_factor"));
        assert!(topo.layout(0).is_err());
    }

    #[test]
    fn test_pinned_virtual_stages_must_match() {
        let topo = StageTopology::new(2, 8).unwrap().with_virtual_stages(2).unwrap();
        assert!(topo.layout(2).is_ok());
        assert!(topo.layout(1).is_err());
    }

    #[test]
    fn test_interleaved_layout() {
        let layout = StageTopology::new(2, 8).unwrap().layout(2).unwrap();
        assert_eq!(layout.num_logical_stages(), 4);

        let s = layout.stage(0, 1);
        assert_eq!(s.logical, 2);
        assert_eq!(layout.rank_of(s), 0);
        assert_eq!(layout.layers(s), 4..6);

        // rank 1 chunk 0 hands off to rank 0 chunk 1
        let tail = layout.stage(1, 0);
        assert_eq!(layout.next(tail), Some(layout.stage(0, 1)));
        assert_eq!(layout.prev(layout.stage(0, 1)), Some(tail));

        assert!(layout.is_first(layout.stage(0, 0)));
        assert!(layout.is_last(layout.stage(1, 1)));
        assert_eq!(layout.next(layout.stage(1, 1)), None);
    }

    #[test]
    fn test_v_shape_layout() {
        let layout = StageTopology::new(3, 12)
            .unwrap()
            .layout_with(2, Placement::VShape)
            .unwrap();
        assert_eq!(layout.placement(), Placement::VShape);
        let logical: Vec<Vec<usize>> = (0..3)
            .map(|r| layout.stages_of(r).map(|s| s.logical).collect())
            .collect();
        assert_eq!(logical, vec![vec![0, 5], vec![1, 4], vec![2, 3]]);

        for l in 0..6 {
            let s = layout.stage_at(l);
            assert_eq!(layout.stage(layout.rank_of(s), s.chunk), s);
        }
        // the turn stays on the last rank, the ends meet on rank 0
        let turn = layout.stage(2, 0);
        assert_eq!(layout.rank_of(layout.next(turn).unwrap()), 2);
        assert!(layout.is_last(layout.stage(0, 1)));
        assert_eq!(layout.layers(layout.stage(0, 1)), 10..12);
    }

    #[test]
    fn test_v_shape_needs_two_chunks_and_even_layers() {
        let topo = StageTopology::new(2, 8).unwrap();
        assert!(matches!(
            topo.layout_with(1, Placement::VShape),
            Err(Error::Configuration {
                parameter: "interleave_factor",
                ..
            })
        ));
        assert!(topo.layout_with(4, Placement::VShape).is_err());

        let odd = StageTopology::new(2, 6).unwrap();
        assert!(matches!(
            odd.layout_with(2, Placement::VShape),
            Err(Error::Configuration {
                parameter: "num_layers",
                ..
            })
        ));
    }

    #[test]
    fn test_stages_of_rank() {
        let layout = StageTopology::new(4, 8).unwrap().layout(2).unwrap();
        let logical: Vec<usize> = layout.stages_of(1).map(|s| s.logical).collect();
        assert_eq!(logical, vec![1, 5]);
    }
}
