//! Span geometry constants and runtime tuning.

/// log2 of the span size.
pub const SPAN_SIZE_BITS: usize = 16;
/// Every small-object span is 64 KiB and aligned to its own size.
pub const SPAN_SIZE: usize = 1 << SPAN_SIZE_BITS;
pub const SPAN_ALIGN_MASK: usize = !(SPAN_SIZE - 1);
/// Bytes reserved for the header at offset 0 of every span.
pub const SPAN_HEADER_SIZE: usize = 128;

/// Alignment of every pointer returned by a plain allocation.
pub const MIN_ALIGN: usize = 16;

/// Page size assumed when the OS cannot be asked.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Fully free spans each size class keeps for itself.
pub const DEFAULT_RETAINED_SPANS: usize = 1;

/// Unassigned spans the span allocator keeps mapped for any class (4 MiB).
pub const DEFAULT_POOL_SPANS: usize = 64;

const _: () = assert!(SPAN_SIZE.is_power_of_two());
const _: () = assert!(SPAN_HEADER_SIZE % MIN_ALIGN == 0);
const _: () = assert!(SPAN_SIZE % DEFAULT_PAGE_SIZE == 0);

/// Runtime knobs for a [`Heap`](crate::Heap).
///
/// ```
/// use spanalloc::Config;
///
/// let config = Config::new().retained_spans(0).pool_spans(16);
/// assert_eq!(config.pool_spans, 16);
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
  /// Fully free spans a size class holds on to before handing them back to
  /// the span allocator. These are the cache of last resort that keeps a
  /// class from unmapping a span it is about to need again.
  pub retained_spans: usize,
  /// Unassigned spans parked in the span allocator's pool before further
  /// releases go straight back to the OS.
  pub pool_spans: usize,
}

impl Config {
  pub const fn new() -> Self {
    Self {
      retained_spans: DEFAULT_RETAINED_SPANS,
      pool_spans: DEFAULT_POOL_SPANS,
    }
  }

  pub const fn retained_spans(mut self, spans: usize) -> Self {
    self.retained_spans = spans;
    self
  }

  pub const fn pool_spans(mut self, spans: usize) -> Self {
    self.pool_spans = spans;
    self
  }
}

impl Default for Config {
  fn default() -> Self {
    Self::new()
  }
}
