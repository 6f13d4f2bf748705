//! Float weight tensor owned by the trainer
//!
//! Layers never hold the float weights. They keep a binarized snapshot that is
//! refreshed only by an explicit `synchronize` call, so the tensor carries a
//! version counter that layers record to detect a stale snapshot. Each
//! tensor also carries a process-unique id, so a snapshot of one tensor never
//! matches another tensor at the same version.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_TENSOR_ID: AtomicU64 = AtomicU64::new(0);

fn next_tensor_id() -> u64 {
    NEXT_TENSOR_ID.fetch_add(1, Ordering::Relaxed)
}

/// Continuous weights, one per synaptic connection
///
/// Every mutable access bumps [`FloatWeights::version`]. Clones get a fresh
/// identity: diverging copies must not be mistaken for each other.
#[derive(Debug)]
pub struct FloatWeights {
    data: Vec<f32>,
    id: u64,
    version: u64,
}

impl FloatWeights {
    /// Wrap an existing tensor
    pub fn new(data: Vec<f32>) -> Self {
        Self { data, id: next_tensor_id(), version: 0 }
    }

    /// All-zero tensor of `len` weights
    pub fn zeros(len: usize) -> Self {
        Self::new(vec![0.0f32; len])
    }

    /// Read-only view
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable view (counts as an update)
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        self.version += 1;
        &mut self.data
    }

    /// Apply an in-place update, e.g. an optimizer step
    pub fn update<F: FnOnce(&mut [f32])>(&mut self, f: F) {
        f(self.data_mut());
    }

    /// Number of weights
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True when the tensor is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Monotonic update counter
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }
}

impl Clone for FloatWeights {
    fn clone(&self) -> Self {
        Self::new(self.data.clone())
    }
}

impl Default for FloatWeights {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl From<Vec<f32>> for FloatWeights {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

/// Identity and version of the float tensor a binarized snapshot was taken from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct SyncStamp(Option<(u64, u64)>);

impl SyncStamp {
    pub(crate) fn record(&mut self, weights: &FloatWeights) {
        self.0 = Some((weights.id, weights.version));
    }

    /// Snapshot no longer derived from any float tensor (loaded from disk)
    pub(crate) fn detach(&mut self) {
        self.0 = None;
    }

    pub(crate) fn matches(&self, weights: &FloatWeights) -> bool {
        self.0 == Some((weights.id, weights.version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_bumps_on_mutation() {
        let mut w = FloatWeights::zeros(4);
        assert_eq!(w.version(), 0);

        w.update(|d| d[0] = 1.0);
        assert_eq!(w.version(), 1);
        assert_eq!(w.data()[0], 1.0);

        let _ = w.data();
        assert_eq!(w.version(), 1, "reads must not bump the version");
    }

    #[test]
    fn test_sync_stamp() {
        let mut w = FloatWeights::zeros(2);
        let mut stamp = SyncStamp::default();
        assert!(!stamp.matches(&w));

        stamp.record(&w);
        assert!(stamp.matches(&w));

        w.data_mut()[1] = -1.0;
        assert!(!stamp.matches(&w), "mutation must invalidate the stamp");

        stamp.record(&w);
        stamp.detach();
        assert!(!stamp.matches(&w));
    }

    #[test]
    fn test_sync_stamp_distinguishes_tensors() {
        let a = FloatWeights::new(vec![1.0, 1.0]);
        let b = FloatWeights::new(vec![-1.0, -1.0]);
        assert_eq!(a.version(), b.version());

        let mut stamp = SyncStamp::default();
        stamp.record(&a);
        assert!(stamp.matches(&a));
        assert!(!stamp.matches(&b), "same version, different tensor");
        assert!(!stamp.matches(&a.clone()), "a clone is a separate tensor");
    }
}
