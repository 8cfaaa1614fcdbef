use std::{any::TypeId, collections::HashMap, mem};

use ahash::RandomState;

use crate::{FieldMask, HeapTag, MAX_MASK_WORDS, Violation, WORD_SIZE};

/// Index into a [`ShapeTable`].
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ShapeId(u16);

impl ShapeId {
    /// Objects made through the untyped allocation entry point.
    pub const RAW: Self = Self(0);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Layout descriptor of a fixed-size payload type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shape {
    name: &'static str,
    tag: HeapTag,
    field_mask: FieldMask,
    size: usize,
}

impl Shape {
    fn raw() -> Self {
        Self {
            name: "raw",
            tag: HeapTag::Opaque,
            field_mask: FieldMask::EMPTY,
            size: 0,
        }
    }

    /// Starts describing a `#[repr(C)]` payload type `T`.
    pub fn fixed<T>(name: &'static str) -> ShapeBuilder {
        ShapeBuilder {
            name,
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
            needs_drop: mem::needs_drop::<T>(),
            base: None,
            field_mask: FieldMask::EMPTY,
            error: None,
        }
    }

    /// Describes `D`, which embeds the layout of `base` at offset 0.
    ///
    /// Every pointer field of the base stays a pointer field of the derived
    /// shape; `.pointer()` only adds the fields `D` declares on top.
    pub fn extend<D>(name: &'static str, base: &Shape) -> ShapeBuilder {
        let mut builder = Self::fixed::<D>(name);
        builder.field_mask = base.field_mask;
        builder.base = Some((base.name, base.size));
        builder
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn tag(&self) -> HeapTag {
        self.tag
    }

    #[inline]
    pub fn field_mask(&self) -> FieldMask {
        self.field_mask
    }

    /// Payload size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Byte offsets of the pointer fields, lowest first.
    pub fn pointer_offsets(&self) -> impl Iterator<Item = usize> {
        self.field_mask.words().map(|word| word * WORD_SIZE)
    }
}

#[derive(Debug)]
#[must_use = "a shape builder does nothing until built"]
pub struct ShapeBuilder {
    name: &'static str,
    size: usize,
    align: usize,
    needs_drop: bool,
    base: Option<(&'static str, usize)>,
    field_mask: FieldMask,
    error: Option<Violation>,
}

impl ShapeBuilder {
    /// Declares the word at byte `offset` an owning reference.
    pub fn pointer(mut self, offset: usize) -> Self {
        if self.error.is_some() {
            return self;
        }
        let name = self.name;
        if offset % WORD_SIZE != 0 {
            self.error = Some(Violation::MisalignedField {
                shape: name,
                offset,
            });
        } else if offset
            .checked_add(WORD_SIZE)
            .is_none_or(|end| end > self.size)
        {
            self.error = Some(Violation::FieldOutOfBounds {
                shape: name,
                offset,
                size: self.size,
            });
        } else {
            match FieldMask::for_word(offset / WORD_SIZE) {
                Some(bit) => self.field_mask = self.field_mask | bit,
                None => {
                    self.error = Some(Violation::MaskOverflow {
                        shape: name,
                        word: offset / WORD_SIZE,
                    })
                }
            }
        }
        self
    }

    pub fn build(self) -> Result<Shape, Violation> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.align > WORD_SIZE {
            return Err(Violation::OverAligned {
                shape: self.name,
                align: self.align,
            });
        }
        if self.needs_drop {
            return Err(Violation::NeedsDrop { shape: self.name });
        }
        if let Some((base, base_size)) = self.base {
            if base_size > self.size {
                return Err(Violation::BaseLargerThanDerived {
                    shape: self.name,
                    base,
                });
            }
        }
        debug_assert!(
            self.field_mask
                .highest_word()
                .is_none_or(|w| w < MAX_MASK_WORDS && (w + 1) * WORD_SIZE <= self.size)
        );
        Ok(Shape {
            name: self.name,
            tag: HeapTag::FixedSize,
            field_mask: self.field_mask,
            size: self.size,
        })
    }
}

/// A fixed-size payload type the heap can allocate and trace.
///
/// Implementors are `#[repr(C)]` structs without drop glue whose reference
/// fields are exactly the offsets declared in [`Managed::shape`].
pub trait Managed: Sized + 'static {
    fn shape() -> Result<Shape, Violation>;
}

/// Descriptor arena, one entry per registered Rust type.
#[derive(Debug)]
pub struct ShapeTable {
    shapes: Vec<Shape>,
    by_type: HashMap<TypeId, ShapeId, RandomState>,
}

impl Default for ShapeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeTable {
    pub fn new() -> Self {
        Self {
            shapes: vec![Shape::raw()],
            by_type: HashMap::default(),
        }
    }

    /// Registers `T` on first use and returns its id.
    pub fn register<T: Managed>(&mut self) -> Result<ShapeId, Violation> {
        let key = TypeId::of::<T>();
        if let Some(&id) = self.by_type.get(&key) {
            return Ok(id);
        }
        let shape = T::shape()?;
        let id = u16::try_from(self.shapes.len())
            .map(ShapeId)
            .map_err(|_| Violation::TooManyShapes)?;
        log::debug!(
            "registered shape {} as {:?}: {} bytes, {:?}",
            shape.name,
            id,
            shape.size,
            shape.field_mask
        );
        self.shapes.push(shape);
        self.by_type.insert(key, id);
        Ok(id)
    }

    pub fn lookup<T: 'static>(&self) -> Option<ShapeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn get(&self, id: ShapeId) -> Option<&Shape> {
        self.shapes.get(id.index())
    }

    /// Registered shapes, not counting the raw placeholder.
    pub fn len(&self) -> usize {
        self.shapes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::mem::offset_of;

    use super::*;

    #[repr(C)]
    struct Pair {
        head: usize,
        count: u64,
        tail: usize,
    }

    impl Managed for Pair {
        fn shape() -> Result<Shape, Violation> {
            Shape::fixed::<Self>("Pair")
                .pointer(offset_of!(Self, head))
                .pointer(offset_of!(Self, tail))
                .build()
        }
    }

    #[repr(C)]
    struct Triple {
        pair: Pair,
        extra: usize,
        weight: f64,
    }

    #[test]
    fn fixed_shape_records_pointer_words() {
        let shape = Pair::shape().unwrap();
        assert_eq!(shape.tag(), HeapTag::FixedSize);
        assert_eq!(shape.size(), 3 * WORD_SIZE);
        assert_eq!(shape.field_mask().bits(), 0b101);
        assert_eq!(shape.pointer_offsets().collect::<Vec<_>>(), vec![0, 2 * WORD_SIZE]);
    }

    #[test]
    fn derived_shape_keeps_base_bits() {
        let base = Pair::shape().unwrap();
        let derived = Shape::extend::<Triple>("Triple", &base)
            .pointer(offset_of!(Triple, extra))
            .build()
            .unwrap();
        assert_eq!(derived.field_mask().bits(), 0b1101);
        assert_eq!(derived.size(), 5 * WORD_SIZE);
    }

    #[test]
    fn rejects_bad_layouts() {
        assert_eq!(
            Shape::fixed::<Pair>("Pair").pointer(3).build(),
            Err(Violation::MisalignedField {
                shape: "Pair",
                offset: 3
            })
        );
        assert_eq!(
            Shape::fixed::<Pair>("Pair").pointer(3 * WORD_SIZE).build(),
            Err(Violation::FieldOutOfBounds {
                shape: "Pair",
                offset: 3 * WORD_SIZE,
                size: 3 * WORD_SIZE
            })
        );
        let last_word = usize::MAX - (WORD_SIZE - 1);
        assert_eq!(
            Shape::fixed::<Pair>("Pair").pointer(last_word).build(),
            Err(Violation::FieldOutOfBounds {
                shape: "Pair",
                offset: last_word,
                size: 3 * WORD_SIZE
            })
        );
        assert_eq!(
            Shape::fixed::<[usize; 40]>("Wide").pointer(33 * WORD_SIZE).build(),
            Err(Violation::MaskOverflow {
                shape: "Wide",
                word: 33
            })
        );
        assert_eq!(
            Shape::fixed::<String>("Owned").build(),
            Err(Violation::NeedsDrop { shape: "Owned" })
        );
        assert_eq!(
            Shape::fixed::<u128>("Wide").build().map(|s| s.size()),
            if mem::align_of::<u128>() > WORD_SIZE {
                Err(Violation::OverAligned {
                    shape: "Wide",
                    align: mem::align_of::<u128>()
                })
            } else {
                Ok(16)
            }
        );
    }

    #[test]
    fn base_larger_than_derived_is_rejected() {
        let base = Shape::fixed::<Triple>("Triple").build().unwrap();
        assert_eq!(
            Shape::extend::<Pair>("Pair", &base).build(),
            Err(Violation::BaseLargerThanDerived {
                shape: "Pair",
                base: "Triple"
            })
        );
    }

    #[test]
    fn table_registers_each_type_once() {
        let mut table = ShapeTable::new();
        assert!(table.is_empty());
        let first = table.register::<Pair>().unwrap();
        let second = table.register::<Pair>().unwrap();
        assert_eq!(first, second);
        assert_ne!(first, ShapeId::RAW);
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup::<Pair>(), Some(first));
        assert_eq!(table.lookup::<Triple>(), None);
        assert_eq!(table.get(first).map(Shape::name), Some("Pair"));
    }
}
