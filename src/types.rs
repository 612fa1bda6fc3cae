//! The source-level type lattice.
//!
//! Primitive types are signed and unsigned integers of 1, 2, 4 and 8 bytes,
//! floats of 4 and 8 bytes, the width-4 `Generic` sentinel used for untyped
//! integers, and `Void`. Derived types cover pointers, arrays, functions,
//! reference parameters, const/volatile modifiers, objects, tuples and
//! bitfields.
//!
//! The type engine in [`crate::typecheck`] operates on this lattice; the
//! machine IR knows nothing about types beyond access widths.

/// Number of bytes in a machine long.
pub const LONG_SIZE: u32 = 4;

/// Largest aggregate that is still passed by value in registers.
pub const MAX_REG_AGGREGATE: u32 = 12;

/// A source-level type.
#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    /// No value.
    Void,
    /// Untyped integer; behaves as a 4-byte integer of unknown signedness.
    Generic,
    /// Integer of `bytes` in {1, 2, 4, 8}.
    Int {
        /// Width in bytes.
        bytes: u32,
        /// True for signed.
        signed: bool,
    },
    /// IEEE float of `bytes` in {4, 8}.
    Float {
        /// Width in bytes.
        bytes: u32,
    },
    /// A language-level string (pointer to counted bytes).
    Str,
    /// Pointer to the inner type.
    Ptr(Box<Type>),
    /// Array of the inner type, with an optional element count.
    Array {
        /// Element type.
        elem: Box<Type>,
        /// Declared element count, if any.
        count: Option<u32>,
    },
    /// Function type.
    Func {
        /// Parameter types.
        params: Vec<Type>,
        /// Result types; more than one entry for tuple-returning functions.
        results: Vec<Type>,
    },
    /// Reference parameter; only valid in parameter position.
    Ref(Box<Type>),
    /// Pass-by-value of a large aggregate, implemented as a managed copy.
    CopyRef(Box<Type>),
    /// Const-qualified type.
    Const(Box<Type>),
    /// Volatile-qualified type.
    Volatile(Box<Type>),
    /// Instance of another module (an object).
    Object {
        /// Class (module) name.
        class: String,
        /// Total variable size in bytes.
        size: u32,
    },
    /// Tuple of types (multiple return values).
    Tuple(Vec<Type>),
    /// Bitfield within an integer.
    Bitfield {
        /// Underlying integer type.
        base: Box<Type>,
        /// Bit offset of the field.
        offset: u32,
        /// Width of the field in bits.
        width: u32,
    },
}

impl Type {
    /// Signed 4-byte integer, the default numeric type.
    pub fn long() -> Self {
        Type::Int {
            bytes: 4,
            signed: true,
        }
    }

    /// Unsigned 4-byte integer.
    pub fn ulong() -> Self {
        Type::Int {
            bytes: 4,
            signed: false,
        }
    }

    /// Signed 8-byte integer.
    pub fn long64() -> Self {
        Type::Int {
            bytes: 8,
            signed: true,
        }
    }

    /// Unsigned 8-byte integer.
    pub fn ulong64() -> Self {
        Type::Int {
            bytes: 8,
            signed: false,
        }
    }

    /// 4-byte float.
    pub fn float() -> Self {
        Type::Float { bytes: 4 }
    }

    /// 8-byte float.
    pub fn double() -> Self {
        Type::Float { bytes: 8 }
    }

    /// Strip const/volatile modifiers.
    pub fn unqualified(&self) -> &Type {
        match self {
            Type::Const(inner) | Type::Volatile(inner) => inner.unqualified(),
            t => t,
        }
    }

    /// Size of a value of this type, in bytes.
    pub fn size(&self) -> u32 {
        match self.unqualified() {
            Type::Void => 0,
            Type::Generic => LONG_SIZE,
            Type::Int { bytes, .. } | Type::Float { bytes } => *bytes,
            Type::Str | Type::Ptr(_) | Type::Func { .. } | Type::Ref(_) | Type::CopyRef(_) => {
                LONG_SIZE
            }
            Type::Array { elem, count } => elem.size() * count.unwrap_or(1),
            Type::Object { size, .. } => *size,
            Type::Tuple(elems) => elems.iter().map(Type::size).sum(),
            Type::Bitfield { base, .. } => base.size(),
            Type::Const(_) | Type::Volatile(_) => unreachable!("unqualified() strips qualifiers"),
        }
    }

    /// Integer (or generic) test. Bitfields count as their base type.
    pub fn is_integer(&self) -> bool {
        matches!(
            self.unqualified(),
            Type::Int { .. } | Type::Generic | Type::Bitfield { .. }
        )
    }

    /// Float of either width.
    pub fn is_float(&self) -> bool {
        matches!(self.unqualified(), Type::Float { .. })
    }

    /// 8-byte float.
    pub fn is_float64(&self) -> bool {
        matches!(self.unqualified(), Type::Float { bytes: 8 })
    }

    /// 8-byte integer of either signedness.
    pub fn is_int64(&self) -> bool {
        matches!(self.unqualified(), Type::Int { bytes: 8, .. })
    }

    /// The untyped-integer sentinel.
    pub fn is_generic(&self) -> bool {
        matches!(self.unqualified(), Type::Generic)
    }

    /// Unsigned integer. Generic integers are treated as signed.
    pub fn is_unsigned(&self) -> bool {
        match self.unqualified() {
            Type::Int { signed, .. } => !signed,
            Type::Bitfield { base, .. } => base.is_unsigned(),
            _ => false,
        }
    }

    /// Pointer (including function pointers).
    pub fn is_pointer(&self) -> bool {
        matches!(self.unqualified(), Type::Ptr(_))
    }

    /// Pointer to a function.
    pub fn is_function_pointer(&self) -> bool {
        match self.unqualified() {
            Type::Ptr(inner) => matches!(inner.unqualified(), Type::Func { .. }),
            _ => false,
        }
    }

    /// Language-level string.
    pub fn is_string(&self) -> bool {
        matches!(self.unqualified(), Type::Str)
    }

    /// Const-qualified at the outermost level.
    pub fn is_const(&self) -> bool {
        matches!(self, Type::Const(_))
    }

    /// True if a value of this type is passed and returned by managed
    /// reference: any structured type bigger than [`MAX_REG_AGGREGATE`]
    /// bytes, or any array whose elements are not longs.
    pub fn passed_by_reference(&self) -> bool {
        match self.unqualified() {
            Type::Object { size, .. } => *size > MAX_REG_AGGREGATE,
            Type::Tuple(_) => self.size() > MAX_REG_AGGREGATE,
            Type::Array { elem, .. } => elem.size() != LONG_SIZE,
            _ => false,
        }
    }

    /// Loose compatibility check used before inserting coercions: two types
    /// are compatible when a value of one can be converted to the other
    /// without a cast in source.
    pub fn compatible(&self, other: &Type) -> bool {
        let a = self.unqualified();
        let b = other.unqualified();
        if a == b {
            return true;
        }
        match (a, b) {
            (Type::Generic, _) | (_, Type::Generic) => true,
            (Type::Int { .. }, Type::Int { .. }) => true,
            (Type::Int { .. }, Type::Float { .. }) | (Type::Float { .. }, Type::Int { .. }) => true,
            (Type::Float { .. }, Type::Float { .. }) => true,
            (Type::Str, Type::Str) => true,
            (Type::Str, Type::Ptr(p)) | (Type::Ptr(p), Type::Str) => {
                matches!(p.unqualified(), Type::Int { bytes: 1, .. })
            }
            (Type::Ptr(x), Type::Ptr(y)) => {
                x.unqualified() == y.unqualified()
                    || matches!(x.unqualified(), Type::Void)
                    || matches!(y.unqualified(), Type::Void)
            }
            (Type::Ptr(x), Type::Array { elem, .. }) | (Type::Array { elem, .. }, Type::Ptr(x)) => {
                x.unqualified() == elem.unqualified()
            }
            (Type::Int { .. }, Type::Ptr(_)) | (Type::Ptr(_), Type::Int { .. }) => false,
            _ => false,
        }
    }

    /// True when converting `self` to `other` silently drops a `const`
    /// qualifier somewhere under a pointer.
    pub fn discards_const(&self, other: &Type) -> bool {
        match (self.unqualified(), other.unqualified()) {
            (Type::Ptr(from), Type::Ptr(to)) => from.is_const() && !to.is_const(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Type::long().size(), 4);
        assert_eq!(Type::long64().size(), 8);
        assert_eq!(Type::double().size(), 8);
        assert_eq!(Type::Ptr(Box::new(Type::double())).size(), 4);
        let arr = Type::Array {
            elem: Box::new(Type::Int {
                bytes: 2,
                signed: false,
            }),
            count: Some(6),
        };
        assert_eq!(arr.size(), 12);
    }

    #[test]
    fn qualifiers_are_transparent() {
        let t = Type::Const(Box::new(Type::Volatile(Box::new(Type::ulong()))));
        assert!(t.is_integer());
        assert!(t.is_unsigned());
        assert_eq!(t.size(), 4);
    }

    #[test]
    fn by_reference_rules() {
        let big = Type::Object {
            class: "fifo".to_string(),
            size: 16,
        };
        let small = Type::Object {
            class: "pair".to_string(),
            size: 8,
        };
        assert!(big.passed_by_reference());
        assert!(!small.passed_by_reference());
        let bytes = Type::Array {
            elem: Box::new(Type::Int {
                bytes: 1,
                signed: false,
            }),
            count: Some(4),
        };
        assert!(bytes.passed_by_reference());
        let longs = Type::Array {
            elem: Box::new(Type::long()),
            count: Some(4),
        };
        assert!(!longs.passed_by_reference());
    }

    #[test]
    fn const_discard() {
        let pc = Type::Ptr(Box::new(Type::Const(Box::new(Type::long()))));
        let pm = Type::Ptr(Box::new(Type::long()));
        assert!(pc.discards_const(&pm));
        assert!(!pm.discards_const(&pc));
    }
}
