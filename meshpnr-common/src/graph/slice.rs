use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::ops::RangeInclusive;

use super::GraphError;

/// An inclusive range of atoms of one application vertex, optionally laid out as a
/// multi-dimensional block of `shape` starting at `start`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "SliceFields")]
pub struct Slice {
    lo: u32,
    hi: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start: Option<Vec<u32>>,
}

#[derive(Deserialize)]
struct SliceFields {
    lo: u32,
    hi: u32,
    #[serde(default)]
    shape: Option<Vec<u32>>,
    #[serde(default)]
    start: Option<Vec<u32>>,
}

impl TryFrom<SliceFields> for Slice {
    type Error = anyhow::Error;

    fn try_from(f: SliceFields) -> Result<Self> {
        match (f.shape, f.start) {
            (None, None) => Slice::new(f.lo, f.hi),
            (Some(shape), Some(start)) => Slice::with_shape(f.lo, f.hi, shape, start),
            _ => Err(GraphError::InvalidParameter(
                "slice shape and start must be given together".into(),
            ))?,
        }
    }
}

impl Slice {
    pub fn new(lo: u32, hi: u32) -> Result<Self> {
        ensure!(
            hi >= lo,
            GraphError::InvalidParameter(format!("slice hi atom {} is below lo atom {}", hi, lo))
        );
        Ok(Self {
            lo,
            hi,
            shape: None,
            start: None,
        })
    }

    pub fn with_shape(lo: u32, hi: u32, shape: Vec<u32>, start: Vec<u32>) -> Result<Self> {
        let mut slice = Self::new(lo, hi)?;
        ensure!(
            shape.len() == start.len(),
            GraphError::InvalidParameter(format!(
                "slice shape {:?} and start {:?} differ in dimensions",
                shape, start
            ))
        );
        let size: u64 = shape.iter().map(|s| *s as u64).product();
        ensure!(
            size == slice.n_atoms() as u64,
            GraphError::InvalidParameter(format!(
                "slice shape {:?} holds {} atoms, not {}",
                shape,
                size,
                slice.n_atoms()
            ))
        );
        slice.shape = Some(shape);
        slice.start = Some(start);
        Ok(slice)
    }

    #[inline]
    pub fn lo_atom(&self) -> u32 {
        self.lo
    }

    #[inline]
    pub fn hi_atom(&self) -> u32 {
        self.hi
    }

    #[inline]
    pub fn n_atoms(&self) -> u32 {
        self.hi - self.lo + 1
    }

    pub fn atoms(&self) -> RangeInclusive<u32> {
        self.lo..=self.hi
    }

    pub fn shape(&self) -> Option<&[u32]> {
        self.shape.as_deref()
    }

    pub fn start(&self) -> Option<&[u32]> {
        self.start.as_deref()
    }

    pub fn overlaps(&self, other: &Slice) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

impl Display for Slice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.lo, self.hi)
    }
}
