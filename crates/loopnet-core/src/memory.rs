//! Shared byte allocations and the non-owning views that address them.
//!
//! An [`Allocation`] is a single zero-initialized byte buffer. A
//! [`MemoryView`] refers to a byte range of an allocation interpreted with a
//! [`Layout`]; it owns no data of its own and cloning it is cheap. Several
//! views may alias one allocation: the loop engine hands the body network
//! a different slice of one concatenated output every iteration without
//! copying.
//!
//! Allocation itself (and the accounting that goes with it) belongs to the
//! runtime engine; this module only provides the storage primitive.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::error::CoreError;
use crate::types::{Layout, Scalar, TensorValues};

/// A zero-initialized byte buffer shared by every view into it.
pub struct Allocation {
    bytes: RwLock<Vec<u8>>,
}

impl Allocation {
    fn zeroed(len: usize) -> Self {
        Allocation {
            bytes: RwLock::new(vec![0; len]),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A typed window `[byte_offset, byte_offset + layout.byte_size())` into an
/// [`Allocation`].
#[derive(Clone)]
pub struct MemoryView {
    allocation: Arc<Allocation>,
    byte_offset: usize,
    layout: Layout,
}

impl MemoryView {
    /// Creates a fresh zeroed allocation exactly large enough for `layout`
    /// and returns a view of all of it.
    pub fn allocate(layout: Layout) -> MemoryView {
        let allocation = Arc::new(Allocation::zeroed(layout.byte_size()));
        MemoryView {
            allocation,
            byte_offset: 0,
            layout,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn byte_offset(&self) -> usize {
        self.byte_offset
    }

    pub fn byte_len(&self) -> usize {
        self.layout.byte_size()
    }

    /// Total size of the backing allocation in bytes.
    pub fn capacity(&self) -> usize {
        self.allocation.len()
    }

    /// Whether both views address the same allocation.
    pub fn shares_allocation(&self, other: &MemoryView) -> bool {
        Arc::ptr_eq(&self.allocation, &other.allocation)
    }

    /// Whether both views address the same bytes with the same layout.
    pub fn same_binding(&self, other: &MemoryView) -> bool {
        self.shares_allocation(other)
            && self.byte_offset == other.byte_offset
            && self.layout == other.layout
    }

    /// A view of `layout` starting `byte_offset` bytes into this view. The
    /// new view must lie entirely inside this one.
    pub fn subview(&self, byte_offset: usize, layout: Layout) -> Result<MemoryView, CoreError> {
        let len = layout.byte_size();
        if byte_offset + len > self.byte_len() {
            return Err(CoreError::ViewOutOfRange {
                offset: self.byte_offset + byte_offset,
                len,
                capacity: self.byte_offset + self.byte_len(),
            });
        }
        Ok(MemoryView {
            allocation: Arc::clone(&self.allocation),
            byte_offset: self.byte_offset + byte_offset,
            layout,
        })
    }

    /// The same starting address viewed with another layout, which may be
    /// larger than the current one as long as it fits the allocation.
    pub fn reinterpret(&self, layout: Layout) -> Result<MemoryView, CoreError> {
        let len = layout.byte_size();
        let capacity = self.capacity();
        if self.byte_offset + len > capacity {
            return Err(CoreError::ViewOutOfRange {
                offset: self.byte_offset,
                len,
                capacity,
            });
        }
        Ok(MemoryView {
            allocation: Arc::clone(&self.allocation),
            byte_offset: self.byte_offset,
            layout,
        })
    }

    /// Runs `f` over the bytes of this view under a shared lock.
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let bytes = self
            .allocation
            .bytes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        f(&bytes[self.byte_offset..self.byte_offset + self.byte_len()])
    }

    /// Runs `f` over the bytes of this view under an exclusive lock.
    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut bytes = self
            .allocation
            .bytes
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let end = self.byte_offset + self.byte_len();
        f(&mut bytes[self.byte_offset..end])
    }

    /// Copies `len` bytes from `src` (starting `src_offset` bytes into it) to
    /// this view (starting `dst_offset` bytes into it). The views may alias.
    pub fn copy_bytes_from(
        &self,
        dst_offset: usize,
        src: &MemoryView,
        src_offset: usize,
        len: usize,
    ) -> Result<(), CoreError> {
        if dst_offset + len > self.byte_len() {
            return Err(CoreError::ViewOutOfRange {
                offset: self.byte_offset + dst_offset,
                len,
                capacity: self.byte_offset + self.byte_len(),
            });
        }
        if src_offset + len > src.byte_len() {
            return Err(CoreError::ViewOutOfRange {
                offset: src.byte_offset + src_offset,
                len,
                capacity: src.byte_offset + src.byte_len(),
            });
        }

        let dst_start = self.byte_offset + dst_offset;
        let src_start = src.byte_offset + src_offset;
        if self.shares_allocation(src) {
            let mut bytes = self
                .allocation
                .bytes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            bytes.copy_within(src_start..src_start + len, dst_start);
        } else {
            let source: Vec<u8> = src.read(|bytes| bytes[src_offset..src_offset + len].to_vec());
            let mut target = self
                .allocation
                .bytes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            target[dst_start..dst_start + len].copy_from_slice(&source);
        }
        Ok(())
    }

    /// Copies all of `src` into this view. Both must have the same data
    /// type and element count.
    pub fn copy_from(&self, src: &MemoryView) -> Result<(), CoreError> {
        if src.layout.data_type != self.layout.data_type
            || src.layout.linear_size() != self.layout.linear_size()
        {
            return Err(CoreError::LayoutMismatch {
                expected: self.layout.clone(),
                actual: src.layout.clone(),
            });
        }
        self.copy_bytes_from(0, src, 0, self.byte_len())
    }

    /// Element `index` of this view.
    pub fn get(&self, index: usize) -> Result<Scalar, CoreError> {
        let data_type = self.layout.data_type;
        let size = data_type.size_in_bytes();
        if index >= self.layout.linear_size() {
            return Err(CoreError::ViewOutOfRange {
                offset: self.byte_offset + index * size,
                len: size,
                capacity: self.byte_offset + self.byte_len(),
            });
        }
        Ok(self.read(|bytes| data_type.decode(&bytes[index * size..])))
    }

    /// Overwrites element `index` of this view.
    pub fn set(&self, index: usize, value: Scalar) -> Result<(), CoreError> {
        let data_type = self.layout.data_type;
        let size = data_type.size_in_bytes();
        if index >= self.layout.linear_size() {
            return Err(CoreError::ViewOutOfRange {
                offset: self.byte_offset + index * size,
                len: size,
                capacity: self.byte_offset + self.byte_len(),
            });
        }
        self.write(|bytes| data_type.encode(value, &mut bytes[index * size..]));
        Ok(())
    }

    /// All elements, decoded.
    pub fn to_scalars(&self) -> Vec<Scalar> {
        let data_type = self.layout.data_type;
        let size = data_type.size_in_bytes();
        self.read(|bytes| bytes.chunks_exact(size).map(|c| data_type.decode(c)).collect())
    }

    pub fn to_f64_vec(&self) -> Vec<f64> {
        self.to_scalars().into_iter().map(Scalar::as_f64).collect()
    }

    pub fn to_i64_vec(&self) -> Vec<i64> {
        self.to_scalars().into_iter().map(Scalar::as_i64).collect()
    }

    /// Overwrites every element from literal values, converting each to
    /// this view's data type.
    pub fn fill(&self, values: &TensorValues) -> Result<(), CoreError> {
        let expected = self.layout.linear_size();
        if values.len() != expected {
            return Err(CoreError::ValueCountMismatch {
                layout: self.layout.clone(),
                expected,
                actual: values.len(),
            });
        }
        let data_type = self.layout.data_type;
        let size = data_type.size_in_bytes();
        self.write(|bytes| {
            for (index, chunk) in bytes.chunks_exact_mut(size).enumerate() {
                if let Some(value) = values.get(index) {
                    data_type.encode(value, chunk);
                }
            }
        });
        Ok(())
    }

    /// Reads the first element as an integer. Used for trip counts,
    /// execution conditions and iteration counters.
    pub fn read_int(&self) -> Result<i64, CoreError> {
        let data_type = self.layout.data_type;
        if data_type.is_float() {
            return Err(CoreError::NonIntegerScalar { data_type });
        }
        self.get(0).map(Scalar::as_i64)
    }

    /// Writes an integer into the first element.
    pub fn write_int(&self, value: i64) -> Result<(), CoreError> {
        let data_type = self.layout.data_type;
        if data_type.is_float() {
            return Err(CoreError::NonIntegerScalar { data_type });
        }
        self.set(0, Scalar::Int(value))
    }
}

impl fmt::Debug for MemoryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryView")
            .field("allocation", &Arc::as_ptr(&self.allocation))
            .field("byte_offset", &self.byte_offset)
            .field("layout", &self.layout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataType;

    fn f32_view(values: &[f64]) -> MemoryView {
        let view = MemoryView::allocate(Layout::new(DataType::F32, &[values.len()]));
        view.fill(&TensorValues::Float(values.to_vec())).unwrap();
        view
    }

    #[test]
    fn allocation_is_zeroed() {
        let view = MemoryView::allocate(Layout::new(DataType::I32, &[3]));
        assert_eq!(view.to_i64_vec(), vec![0, 0, 0]);
        assert_eq!(view.capacity(), 12);
    }

    #[test]
    fn subview_aliases_parent() {
        let parent = f32_view(&[1.0, 2.0, 3.0, 4.0]);
        let child = parent.subview(8, Layout::new(DataType::F32, &[2])).unwrap();
        assert!(child.shares_allocation(&parent));
        assert_eq!(child.to_f64_vec(), vec![3.0, 4.0]);

        child.set(0, Scalar::Float(9.0)).unwrap();
        assert_eq!(parent.to_f64_vec(), vec![1.0, 2.0, 9.0, 4.0]);
    }

    #[test]
    fn subview_out_of_range() {
        let parent = f32_view(&[1.0, 2.0]);
        let err = parent
            .subview(4, Layout::new(DataType::F32, &[2]))
            .unwrap_err();
        assert!(matches!(err, CoreError::ViewOutOfRange { .. }));
    }

    #[test]
    fn reinterpret_may_shrink_and_grow_within_allocation() {
        let parent = f32_view(&[1.0, 2.0, 3.0, 4.0]);
        let short = parent.reinterpret(Layout::new(DataType::F32, &[2])).unwrap();
        assert_eq!(short.to_f64_vec(), vec![1.0, 2.0]);
        let again = short.reinterpret(Layout::new(DataType::F32, &[4])).unwrap();
        assert_eq!(again.to_f64_vec(), vec![1.0, 2.0, 3.0, 4.0]);
        assert!(short.reinterpret(Layout::new(DataType::F32, &[5])).is_err());
    }

    #[test]
    fn copy_from_requires_matching_layout() {
        let a = f32_view(&[1.0, 2.0]);
        let b = MemoryView::allocate(Layout::new(DataType::F32, &[2]));
        b.copy_from(&a).unwrap();
        assert_eq!(b.to_f64_vec(), vec![1.0, 2.0]);

        let c = MemoryView::allocate(Layout::new(DataType::I32, &[2]));
        assert!(matches!(
            c.copy_from(&a),
            Err(CoreError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn copy_within_one_allocation() {
        let parent = f32_view(&[1.0, 2.0, 3.0, 4.0]);
        let low = parent.subview(0, Layout::new(DataType::F32, &[2])).unwrap();
        let high = parent.subview(8, Layout::new(DataType::F32, &[2])).unwrap();
        high.copy_from(&low).unwrap();
        assert_eq!(parent.to_f64_vec(), vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn fill_checks_value_count() {
        let view = MemoryView::allocate(Layout::new(DataType::I64, &[2]));
        let err = view.fill(&TensorValues::Int(vec![1])).unwrap_err();
        assert_eq!(
            err,
            CoreError::ValueCountMismatch {
                layout: Layout::new(DataType::I64, &[2]),
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn read_and_write_int() {
        let view = MemoryView::allocate(Layout::scalar(DataType::I64));
        view.write_int(-1).unwrap();
        assert_eq!(view.read_int().unwrap(), -1);

        let flag = MemoryView::allocate(Layout::scalar(DataType::Bool));
        flag.write_int(7).unwrap();
        assert_eq!(flag.read_int().unwrap(), 1);

        let float = MemoryView::allocate(Layout::scalar(DataType::F32));
        assert!(matches!(
            float.read_int(),
            Err(CoreError::NonIntegerScalar { .. })
        ));
    }
}
