use std::{any::TypeId, hash::Hash};

use bytemuck::Pod;
use derive_more::Display;

/// Runtime descriptor of a structured buffer's element type.
///
/// Two descriptors are equal only if they describe the very same Rust type; the
/// stride alone never makes two types compatible.
#[derive(Debug, Clone, Copy, Display)]
#[display("{name}")]
pub struct ElementType {
    id: TypeId,
    name: &'static str,
    stride: usize,
}

impl ElementType {
    #[inline]
    pub fn of<T: Element>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            stride: size_of::<T>(),
        }
    }

    /// Byte size of one element.
    #[inline]
    pub const fn stride(&self) -> usize {
        self.stride
    }

    #[inline]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Checks if this descriptor was created for `T`.
    #[inline]
    pub fn is<T: Element>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }

    /// Byte size of `count` elements.
    #[inline]
    pub const fn size(&self, count: usize) -> usize {
        self.stride * count
    }
}

impl PartialEq for ElementType {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ElementType {}

impl Hash for ElementType {
    #[inline]
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Plain data that can live in a structured buffer.
pub trait Element: Pod + Send + Sync {
    #[inline]
    fn element_type() -> ElementType {
        ElementType::of::<Self>()
    }
}

impl<T: Pod + Send + Sync> Element for T {}

#[cfg(test)]
mod tests {
    use bytemuck::{Pod, Zeroable};
    use half::f16;

    use super::{Element, ElementType};

    #[derive(Debug, Default, Clone, Copy, PartialEq, Pod, Zeroable)]
    #[repr(C)]
    struct Particle {
        position: [f32; 3],
        mass: f32,
    }

    #[test]
    fn test_stride() {
        assert_eq!(ElementType::of::<f32>().stride(), 4);
        assert_eq!(ElementType::of::<f16>().stride(), 2);
        assert_eq!(ElementType::of::<[u32; 4]>().stride(), 16);
        assert_eq!(Particle::element_type().stride(), 16);
        assert_eq!(Particle::element_type().size(10), 160);
    }

    #[test]
    fn test_identity() {
        // same stride, different types
        assert_ne!(ElementType::of::<f32>(), ElementType::of::<u32>());
        assert_ne!(ElementType::of::<[f32; 4]>(), Particle::element_type());
        assert_eq!(ElementType::of::<f32>(), f32::element_type());
        assert!(Particle::element_type().is::<Particle>());
        assert!(!Particle::element_type().is::<[f32; 4]>());
    }
}
