use std::fmt;

/// The scalar category of a [`DType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DTypeKind {
    Int,
    UInt,
    Float,
    Handle,
}

/// A numeric type: scalar kind, bit width and vector lane count.
///
/// Booleans are represented as `uint1`, following the usual tensor-IR
/// convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub kind: DTypeKind,
    pub bits: u8,
    pub lanes: u16,
}

impl DType {
    pub const fn new(kind: DTypeKind, bits: u8, lanes: u16) -> Self {
        Self { kind, bits, lanes }
    }

    pub const fn f32() -> Self {
        Self::new(DTypeKind::Float, 32, 1)
    }

    pub const fn f64() -> Self {
        Self::new(DTypeKind::Float, 64, 1)
    }

    pub const fn i32() -> Self {
        Self::new(DTypeKind::Int, 32, 1)
    }

    pub const fn i64() -> Self {
        Self::new(DTypeKind::Int, 64, 1)
    }

    pub const fn u32() -> Self {
        Self::new(DTypeKind::UInt, 32, 1)
    }

    /// The boolean type, `uint1`.
    pub const fn u1() -> Self {
        Self::new(DTypeKind::UInt, 1, 1)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self.kind, DTypeKind::Float)
    }

    pub const fn is_int(&self) -> bool {
        matches!(self.kind, DTypeKind::Int)
    }

    pub const fn is_uint(&self) -> bool {
        matches!(self.kind, DTypeKind::UInt)
    }

    pub const fn is_bool(&self) -> bool {
        self.is_uint() && self.bits == 1
    }

    pub const fn with_lanes(self, lanes: u16) -> Self {
        Self { lanes, ..self }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DTypeKind::Int => write!(f, "int{}", self.bits)?,
            DTypeKind::UInt => write!(f, "uint{}", self.bits)?,
            DTypeKind::Float => write!(f, "float{}", self.bits)?,
            DTypeKind::Handle => write!(f, "handle")?,
        }
        if self.lanes > 1 {
            write!(f, "x{}", self.lanes)?;
        }
        Ok(())
    }
}
