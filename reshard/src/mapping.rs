//! Rank placement in a tensor-parallel × pipeline-parallel grid.
//!
//! Ranks are laid out tp-major: consecutive ranks share a pipeline stage and
//! differ in tensor-parallel rank, so `tp_rank = rank % tp_size` and
//! `pp_rank = rank / tp_size`.

use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Position of one rank in the parallel layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub world_size: usize,
    pub rank: usize,
    pub tp_size: usize,
    pub pp_size: usize,
    pub tp_rank: usize,
    pub pp_rank: usize,
}

impl Mapping {
    /// Place `rank` in a `tp_size × pp_size` grid.
    ///
    /// # Errors
    /// Returns an error if either size is zero, if `world_size` is not
    /// `tp_size * pp_size`, or if `rank` is outside `[0, world_size)`.
    pub fn new(world_size: usize, rank: usize, tp_size: usize, pp_size: usize) -> Result<Self> {
        if tp_size == 0 || pp_size == 0 {
            return Err(Error::InvalidMapping(format!(
                "tp_size ({tp_size}) and pp_size ({pp_size}) must be positive"
            )));
        }
        if world_size != tp_size * pp_size {
            return Err(Error::InvalidMapping(format!(
                "world_size {world_size} != tp_size {tp_size} * pp_size {pp_size}"
            )));
        }
        if rank >= world_size {
            return Err(Error::InvalidMapping(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self {
            world_size,
            rank,
            tp_size,
            pp_size,
            tp_rank: rank % tp_size,
            pp_rank: rank / tp_size,
        })
    }

    #[must_use]
    pub fn is_first_pp_rank(&self) -> bool {
        self.pp_rank == 0
    }

    #[must_use]
    pub fn is_last_pp_rank(&self) -> bool {
        self.pp_rank == self.pp_size - 1
    }

    /// Global layer indices owned by this rank's pipeline stage.
    ///
    /// Stages get `num_layers / pp_size` layers each; the first
    /// `num_layers % pp_size` stages take one extra, so the ranges of all
    /// stages tile `[0, num_layers)` with no gaps and no overlap.
    ///
    /// # Errors
    /// Returns an error if `num_layers < pp_size`, which would leave a stage
    /// without layers.
    pub fn pp_layers(&self, num_layers: usize) -> Result<Range<usize>> {
        if num_layers < self.pp_size {
            return Err(Error::InvalidMapping(format!(
                "{num_layers} layers cannot fill {} pipeline stages",
                self.pp_size
            )));
        }
        let base = num_layers / self.pp_size;
        let extra = num_layers % self.pp_size;
        let start = self.pp_rank * base + self.pp_rank.min(extra);
        let len = base + usize::from(self.pp_rank < extra);
        Ok(start..start + len)
    }
}
