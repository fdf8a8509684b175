//! Size-class table.
//!
//! Eight linear classes of 16 bytes cover 16..=128, then each doubling is cut
//! into four geometric steps. Worst-case internal fragmentation stays under
//! roughly 20% while the whole table fits in a few cache lines per thread.

use crate::config::{SPAN_HEADER_SIZE, SPAN_SIZE};

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Largest request served from a size class. Anything bigger is a large object.
pub const MAX_SMALL_SIZE: usize = (SPAN_SIZE - SPAN_HEADER_SIZE) / 2;

/// Upper bound on slots moved between a thread cache and a central store at once.
const MAX_BATCH: usize = 64;
/// Bytes worth of slots moved per transfer, before clamping.
const BATCH_BYTES: usize = 8192;

/// Total number of size classes.
pub const CLASS_COUNT: usize = count_size_classes();

const _: () = assert!(class_to_size(0) == 16);
const _: () = assert!(class_to_size(CLASS_COUNT - 1) == MAX_SMALL_SIZE);
const _: () = assert!(MAX_SMALL_SIZE % 16 == 0);
const _: () = assert!(CLASS_COUNT <= u8::MAX as usize);

/// Static attributes of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClass {
  /// Bytes handed to the caller.
  pub slot_size: usize,
  /// Slots carved out of one span.
  pub slots_per_span: usize,
  /// Slots per transfer between a thread cache and the central store.
  pub batch: usize,
  /// Cached slots a thread keeps before flushing a batch.
  pub high_water: usize,
}

impl SizeClass {
  const fn of(class: usize) -> Self {
    let slot_size = class_to_size(class);
    let slots_per_span = (SPAN_SIZE - SPAN_HEADER_SIZE) / slot_size;
    let mut batch = BATCH_BYTES / slot_size;
    if batch > MAX_BATCH {
      batch = MAX_BATCH;
    }
    if batch < 2 {
      batch = 2;
    }
    if batch > slots_per_span {
      batch = slots_per_span;
    }
    Self {
      slot_size,
      slots_per_span,
      batch,
      high_water: 2 * batch,
    }
  }
}

/// The whole table, built at compile time.
pub static CLASSES: [SizeClass; CLASS_COUNT] = build_table();

const fn build_table() -> [SizeClass; CLASS_COUNT] {
  let mut table = [SizeClass {
    slot_size: 0,
    slots_per_span: 0,
    batch: 0,
    high_water: 0,
  }; CLASS_COUNT];
  let mut class = 0;
  while class < CLASS_COUNT {
    table[class] = SizeClass::of(class);
    class += 1;
  }
  table
}

/// Returns the total number of size classes. Computed at compile-time.
const fn count_size_classes() -> usize {
  let mut class = 0;
  loop {
    if class_to_size(class) >= MAX_SMALL_SIZE {
      return class + 1;
    }
    class += 1;
  }
}

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Convert class index to slot size (inverse of `class_for`).
#[inline(always)]
const fn class_to_size(class: usize) -> usize {
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let size = align_up((base * GEO_MULTIPLIERS[sub]) / 16, 16);

    if size > MAX_SMALL_SIZE {
      MAX_SMALL_SIZE
    } else {
      size
    }
  }
}

/// Smallest class whose slot covers `size`, or `None` for a large object.
///
/// A zero-byte request maps to class 0.
#[inline(always)]
pub fn class_for(size: usize) -> Option<usize> {
  if size > MAX_SMALL_SIZE {
    return None;
  }
  if size <= 128 {
    return Some(size.saturating_sub(1) / CLASSES_LINEAR_STEP);
  }

  // Geometric range: find order via log2, then sub-class via thresholds
  let log2 = (usize::BITS as usize - 1) - size.leading_zeros() as usize;
  let order = log2 - 7;
  let base = 128usize << order;

  let t1 = align_up((base * GEO_MULTIPLIERS[1]) >> 4, 16);
  let t2 = align_up((base * GEO_MULTIPLIERS[2]) >> 4, 16);
  let t3 = align_up((base * GEO_MULTIPLIERS[3]) >> 4, 16);

  // Count exceeded thresholds; exceeding all four rolls over to the next order.
  let exceeded =
    (size > base) as usize + (size > t1) as usize + (size > t2) as usize + (size > t3) as usize;

  let final_order = order + (exceeded >> 2);
  let sub = exceeded & 3;
  let class = CLASSES_LINEAR + final_order * CLASSES_PER_DOUBLING + sub - 1;
  Some(class.min(CLASS_COUNT - 1))
}

/// Smallest class covering `size` whose slots all sit on an `align` boundary.
///
/// Slots start `SPAN_HEADER_SIZE` bytes into a span-aligned region, so a class
/// qualifies when `align` divides both the header size and its slot size.
pub fn class_for_aligned(size: usize, align: usize) -> Option<usize> {
  if align > SPAN_HEADER_SIZE {
    return None;
  }
  let first = class_for(size)?;
  (first..CLASS_COUNT).find(|&class| CLASSES[class].slot_size % align == 0)
}

#[inline(always)]
pub fn slot_size(class: usize) -> usize {
  CLASSES[class].slot_size
}
