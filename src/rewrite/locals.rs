//! Local slot allocation.

use crate::il::{LocalDecl, LocalIndex, TypeSig};

/// Hands out fresh local slots after the ones a body already declares.
///
/// Slots are staged: nothing touches the body until [`LocalAllocator::into_decls`]
/// is appended to it. Indices increase monotonically and are never reused.
#[derive(Debug)]
pub struct LocalAllocator {
    next: u32,
    limit: u32,
    staged: Vec<LocalDecl>,
}

/// The host refused another slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotLimitReached {
    pub limit: u32,
}

impl LocalAllocator {
    pub fn new(existing: usize, limit: u32) -> Self {
        Self {
            next: existing as u32,
            limit,
            staged: Vec::new(),
        }
    }

    pub fn allocate(&mut self, ty: TypeSig) -> Result<LocalIndex, SlotLimitReached> {
        if self.next >= self.limit {
            return Err(SlotLimitReached { limit: self.limit });
        }
        let index = LocalIndex(self.next);
        self.next += 1;
        self.staged.push(LocalDecl { ty });
        Ok(index)
    }

    /// Number of slots allocated so far.
    pub fn allocated(&self) -> usize {
        self.staged.len()
    }

    pub fn into_decls(self) -> Vec<LocalDecl> {
        self.staged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_follow_existing_locals() {
        let mut alloc = LocalAllocator::new(3, 100);
        assert_eq!(alloc.allocate(TypeSig::Object), Ok(LocalIndex(3)));
        assert_eq!(alloc.allocate(TypeSig::ObjectArray), Ok(LocalIndex(4)));
        assert_eq!(alloc.allocated(), 2);
        assert_eq!(
            alloc.into_decls(),
            vec![
                LocalDecl { ty: TypeSig::Object },
                LocalDecl { ty: TypeSig::ObjectArray }
            ]
        );
    }

    #[test]
    fn test_limit() {
        let mut alloc = LocalAllocator::new(1, 2);
        assert!(alloc.allocate(TypeSig::Object).is_ok());
        assert_eq!(
            alloc.allocate(TypeSig::Object),
            Err(SlotLimitReached { limit: 2 })
        );
    }
}
