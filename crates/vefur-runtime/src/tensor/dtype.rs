use crate::error::{Error, Result};

/// Element type of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F16,
    U32,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_of(&self) -> usize {
        match self {
            DType::F32 | DType::U32 => 4,
            DType::F16 => 2,
        }
    }

    /// Byte size of a buffer holding `shape` elements of this type.
    pub fn buffer_size_for_shape(&self, shape: &[usize]) -> usize {
        shape.iter().product::<usize>() * self.size_of()
    }

    /// Byte size for `capacity` elements, rejecting zero-sized buffers.
    pub fn buffer_size_for_capacity(&self, capacity: usize) -> Result<usize> {
        if capacity == 0 {
            return Err(Error::config("buffer capacity cannot be zero"));
        }
        Ok(capacity * self.size_of())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F16 => "f16",
            DType::U32 => "u32",
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_sizes() {
        assert_eq!(DType::F32.size_of(), 4);
        assert_eq!(DType::U32.size_of(), 4);
        assert_eq!(DType::F16.size_of(), 2);
    }

    #[test]
    fn test_buffer_sizing() {
        assert_eq!(DType::F32.buffer_size_for_shape(&[2, 3, 4]), 96);
        assert_eq!(DType::F16.buffer_size_for_shape(&[8]), 16);
        assert!(DType::F32.buffer_size_for_capacity(0).is_err());
        assert_eq!(DType::U32.buffer_size_for_capacity(16).unwrap(), 64);
    }
}
