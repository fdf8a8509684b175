use thiserror::Error;

/// Failures reported by the allocator.
///
/// Only [`AllocError::OutOfMemory`] is a runtime condition a caller is
/// expected to handle; the others report a bad argument or, for
/// [`AllocError::Corruption`], a heap overflow caught by the
/// `overflow-detection` decorator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  #[error("out of memory: the OS refused to map {pages} pages")]
  OutOfMemory { pages: usize },
  #[error("allocation size overflows the address space")]
  SizeOverflow,
  #[error("alignment {0} is not a power of two")]
  InvalidAlignment(usize),
  #[error("guard bytes overwritten past the allocation at {addr:#x}")]
  Corruption { addr: usize },
}

pub type Result<T> = core::result::Result<T, AllocError>;

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn messages_name_the_failure() {
    assert_eq!(
      AllocError::OutOfMemory { pages: 16 }.to_string(),
      "out of memory: the OS refused to map 16 pages"
    );
    assert_eq!(
      AllocError::InvalidAlignment(24).to_string(),
      "alignment 24 is not a power of two"
    );
    assert!(
      AllocError::Corruption { addr: 0x1000 }
        .to_string()
        .contains("0x1000")
    );
  }
}
