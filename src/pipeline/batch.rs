//! Batch containers and microbatch slicing.
//!
//! A [`Batch`] mirrors the container shapes a model accepts: a single tensor, a
//! positional tuple, or a keyword map. Every leaf tensor shares the batch dimension
//! (dim 0), and microbatches are contiguous slices along it.

use crate::error::{Error, Result};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::collections::BTreeMap;
use std::ops::Range;

/// Input or label batch as supplied to the orchestrator.
pub enum Batch<R: Runtime> {
    Tensor(Tensor<R>),
    Tuple(Vec<Batch<R>>),
    Map(BTreeMap<String, Batch<R>>),
}

impl<R: Runtime> Clone for Batch<R> {
    fn clone(&self) -> Self {
        match self {
            Batch::Tensor(t) => Batch::Tensor(t.clone()),
            Batch::Tuple(items) => Batch::Tuple(items.clone()),
            Batch::Map(map) => Batch::Map(map.clone()),
        }
    }
}

impl<R: Runtime> From<Tensor<R>> for Batch<R> {
    fn from(t: Tensor<R>) -> Self {
        Batch::Tensor(t)
    }
}

impl<R: Runtime> Batch<R> {
    /// Length of the batch dimension, shared by every leaf tensor.
    pub fn batch_len(&self) -> Result<usize> {
        let mut len = None;
        self.visit_leaves(&mut |t| {
            let n = *t.shape().first().ok_or_else(|| Error::UnsupportedBatch {
                reason: "scalar tensor has no batch dimension".to_string(),
            })?;
            match len {
                None => len = Some(n),
                Some(prev) if prev != n => {
                    return Err(Error::InvalidBatch {
                        reason: format!("leaf batch lengths disagree: {prev} vs {n}"),
                    });
                }
                Some(_) => {}
            }
            Ok(())
        })?;
        len.ok_or_else(|| Error::UnsupportedBatch {
            reason: "batch contains no tensors".to_string(),
        })
    }

    fn visit_leaves(&self, f: &mut impl FnMut(&Tensor<R>) -> Result<()>) -> Result<()> {
        match self {
            Batch::Tensor(t) => f(t),
            Batch::Tuple(items) => items.iter().try_for_each(|item| item.visit_leaves(f)),
            Batch::Map(map) => map.values().try_for_each(|item| item.visit_leaves(f)),
        }
    }

    /// Rows `[start, end)` of every leaf, keeping the container shape.
    pub fn slice(&self, start: usize, end: usize) -> Result<Batch<R>> {
        if start > end {
            return Err(Error::InvalidArgument {
                arg: "start",
                reason: format!("start {start} is past end {end}"),
            });
        }
        match self {
            Batch::Tensor(t) => {
                let rows = t.narrow(0, start, end - start).map_err(Error::Numr)?;
                Ok(Batch::Tensor(rows.contiguous()))
            }
            Batch::Tuple(items) => Ok(Batch::Tuple(
                items
                    .iter()
                    .map(|item| item.slice(start, end))
                    .collect::<Result<_>>()?,
            )),
            Batch::Map(map) => Ok(Batch::Map(
                map.iter()
                    .map(|(k, v)| Ok((k.clone(), v.slice(start, end)?)))
                    .collect::<Result<_>>()?,
            )),
        }
    }

    /// Flatten into positional and keyword arguments.
    ///
    /// - a tensor becomes one positional argument;
    /// - a map becomes keyword arguments;
    /// - a tuple contributes its tensors positionally and merges its maps into the
    ///   keyword arguments.
    ///
    /// Deeper nesting is rejected.
    pub fn into_args_kwargs(self) -> Result<(Vec<Tensor<R>>, BTreeMap<String, Tensor<R>>)> {
        let mut args = Vec::new();
        let mut kwargs = BTreeMap::new();
        match self {
            Batch::Tensor(t) => args.push(t),
            Batch::Map(map) => merge_kwargs(&mut kwargs, map)?,
            Batch::Tuple(items) => {
                for item in items {
                    match item {
                        Batch::Tensor(t) => args.push(t),
                        Batch::Map(map) => merge_kwargs(&mut kwargs, map)?,
                        Batch::Tuple(_) => {
                            return Err(Error::UnsupportedBatch {
                                reason: "nested tuples cannot be flattened into arguments"
                                    .to_string(),
                            });
                        }
                    }
                }
            }
        }
        Ok((args, kwargs))
    }

    /// The batch as a single tensor, as labels are expected to be.
    pub fn into_tensor(self) -> Result<Tensor<R>> {
        match self {
            Batch::Tensor(t) => Ok(t),
            _ => Err(Error::UnsupportedBatch {
                reason: "expected a single tensor".to_string(),
            }),
        }
    }
}

fn merge_kwargs<R: Runtime>(
    kwargs: &mut BTreeMap<String, Tensor<R>>,
    map: BTreeMap<String, Batch<R>>,
) -> Result<()> {
    for (key, value) in map {
        let Batch::Tensor(t) = value else {
            return Err(Error::UnsupportedBatch {
                reason: format!("keyword argument '{key}' is not a tensor"),
            });
        };
        if kwargs.insert(key.clone(), t).is_some() {
            return Err(Error::UnsupportedBatch {
                reason: format!("keyword argument '{key}' supplied twice"),
            });
        }
    }
    Ok(())
}

/// Row ranges of each microbatch for a batch of `batch_len` rows.
///
/// The microbatch size is `ceil(batch_len / num_microbatches)`; trailing ranges
/// are clamped to the batch and may be empty when the division is uneven.
pub fn microbatch_bounds(batch_len: usize, num_microbatches: usize) -> Result<Vec<Range<usize>>> {
    if num_microbatches == 0 {
        return Err(Error::InvalidArgument {
            arg: "num_microbatches",
            reason: "must be > 0".to_string(),
        });
    }
    if batch_len < num_microbatches {
        return Err(Error::InvalidBatch {
            reason: format!(
                "batch length {batch_len} is smaller than the number of microbatches {num_microbatches}"
            ),
        });
    }
    let size = batch_len.div_ceil(num_microbatches);
    Ok((0..num_microbatches)
        .map(|id| {
            let start = (id * size).min(batch_len);
            let end = (start + size).min(batch_len);
            start..end
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;

    fn rows(n: usize, width: usize) -> Tensor<CpuRuntime> {
        let (_client, device) = cpu_setup();
        let data: Vec<f32> = (0..n * width).map(|i| i as f32).collect();
        Tensor::<CpuRuntime>::from_slice(&data, &[n, width], &device)
    }

    #[test]
    fn test_bounds_cover_batch() {
        for batch_len in 1..40 {
            for m in 1..=batch_len.min(9) {
                let bounds = microbatch_bounds(batch_len, m).unwrap();
                assert_eq!(bounds.len(), m);
                assert_eq!(bounds[0].start, 0);
                for pair in bounds.windows(2) {
                    assert_eq!(pair[0].end, pair[1].start, "len={batch_len} m={m}");
                }
                assert_eq!(bounds.last().unwrap().end, batch_len);
                let total: usize = bounds.iter().map(|r| r.len()).sum();
                assert_eq!(total, batch_len);
            }
        }
    }

    #[test]
    fn test_bounds_ceil_size() {
        let bounds = microbatch_bounds(10, 4).unwrap();
        assert_eq!(bounds, vec![0..3, 3..6, 6..9, 9..10]);
    }

    #[test]
    fn test_bounds_reject_too_many_microbatches() {
        assert!(matches!(
            microbatch_bounds(3, 4),
            Err(Error::InvalidBatch { .. })
        ));
        assert!(microbatch_bounds(3, 0).is_err());
    }

    #[test]
    fn test_slice_keeps_container_shape() {
        let mut map = BTreeMap::new();
        map.insert("mask".to_string(), Batch::Tensor(rows(4, 1)));
        let batch = Batch::Tuple(vec![Batch::Tensor(rows(4, 2)), Batch::Map(map)]);
        assert_eq!(batch.batch_len().unwrap(), 4);

        let mb = batch.slice(2, 4).unwrap();
        let (args, kwargs) = mb.into_args_kwargs().unwrap();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0].shape(), &[2, 2]);
        assert_eq!(args[0].to_vec::<f32>(), vec![4.0, 5.0, 6.0, 7.0]);
        assert_eq!(kwargs["mask"].to_vec::<f32>(), vec![2.0, 3.0]);
    }

    #[test]
    fn test_mismatched_leaf_lengths() {
        let batch = Batch::Tuple(vec![Batch::Tensor(rows(4, 1)), Batch::Tensor(rows(3, 1))]);
        assert!(matches!(batch.batch_len(), Err(Error::InvalidBatch { .. })));
    }

    #[test]
    fn test_nested_tuple_unsupported() {
        let batch = Batch::Tuple(vec![Batch::Tuple(vec![Batch::Tensor(rows(2, 1))])]);
        assert!(matches!(
            batch.into_args_kwargs(),
            Err(Error::UnsupportedBatch { .. })
        ));
    }

    #[test]
    fn test_duplicate_kwarg_unsupported() {
        let mut a = BTreeMap::new();
        a.insert("k".to_string(), Batch::Tensor(rows(2, 1)));
        let b = a.clone();
        let batch = Batch::Tuple(vec![Batch::Map(a), Batch::Map(b)]);
        assert!(batch.into_args_kwargs().is_err());
    }
}
