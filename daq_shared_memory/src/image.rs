//! Process image: the real-time side's live variable storage.

use crate::registry::{Signal, VariableRegistry};
use daq::layout::Primitive;

/// Owned, 8-byte aligned byte buffer holding every signal and parameter.
///
/// Offsets handed out at registration index into it; the registry checks
/// element alignment, the `u64` backing keeps the base aligned.
#[derive(Debug, Clone)]
pub struct ProcessImage {
    words: Vec<u64>,
    len: usize,
}

impl ProcessImage {
    /// Zeroed image of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(8)],
            len,
        }
    }

    /// Image large enough for every variable of `registry`.
    pub fn for_registry(registry: &VariableRegistry) -> Self {
        Self::new(registry.image_len())
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the image holds no bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whole image.
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        // SAFETY: `words` owns at least `len` initialized bytes.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }

    /// Whole image, writable.
    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.words.as_mut_ptr() as *mut u8, self.len) }
    }

    /// Current bytes of `signal`.
    #[inline]
    pub fn signal_bytes(&self, signal: &Signal) -> &[u8] {
        &self.bytes()[signal.info.range()]
    }

    /// Store element `element` of `signal`.
    pub fn set_signal<T: Primitive>(&mut self, signal: &Signal, element: usize, value: T) {
        debug_assert_eq!(T::TYPE, signal.info.layout.primitive());
        let width = signal.info.layout.element_width();
        let at = signal.info.offset + element * width;
        value.write_ne(&mut self.bytes_mut()[at..at + width]);
    }

    /// Store a value at a raw byte offset.
    pub fn write<T: Primitive>(&mut self, offset: usize, value: T) {
        let width = T::TYPE.width();
        value.write_ne(&mut self.bytes_mut()[offset..offset + width]);
    }

    /// Load a value from a raw byte offset.
    pub fn read<T: Primitive>(&self, offset: usize) -> T {
        T::read_ne(&self.bytes()[offset..offset + T::TYPE.width()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq::layout::{ElementLayout, PrimitiveType};

    #[test]
    fn test_sized_from_registry() {
        let mut reg = VariableRegistry::new(1);
        reg.register_signal("/a", 0, 1, ElementLayout::scalar(PrimitiveType::U16), 10)
            .unwrap();
        let image = ProcessImage::for_registry(&reg);
        assert_eq!(image.len(), 12);
        assert_eq!(image.bytes().as_ptr() as usize % 8, 0);
    }

    #[test]
    fn test_signal_access() {
        let mut reg = VariableRegistry::new(1);
        let layout = ElementLayout::vector(PrimitiveType::F32, 3).unwrap();
        let idx = reg.register_signal("/v", 0, 1, layout, 4).unwrap();
        let sig = reg.signal(idx).unwrap().clone();

        let mut image = ProcessImage::for_registry(&reg);
        image.set_signal(&sig, 2, 1.5f32);
        assert_eq!(image.read::<f32>(12), 1.5);
        assert_eq!(image.signal_bytes(&sig).len(), 12);

        image.write(4, -1.0f32);
        assert_eq!(f32::read_ne(&image.signal_bytes(&sig)[..4]), -1.0);
    }
}
