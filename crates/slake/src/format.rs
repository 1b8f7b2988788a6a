//! The SLX binary format: header layout, flag bits and the framing
//! constants the loader and value-descriptor decoder share. Bit-exact
//! across conformant implementations of the language; this module is the
//! single place that encodes what "bit-exact" means for this one.

/// Magic bytes every SLX module begins with.
pub const MAGIC: [u8; 4] = *b"SLAX";

/// The only format version this loader accepts. An unknown version is
/// always rejected.
pub const FORMAT_VERSION: u8 = 1;

/// Image-header flag bits.
pub const IMH_MODULE_NAME_PRESENT: u8 = 0x01;

/// Loader behavior flags, supplied by the host at `load_module` time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadFlags(pub u8);

impl LoadFlags {
    pub const NONE: Self = Self(0);
    pub const NO_IMPORT: Self = Self(0x01);
    pub const NO_RELOAD: Self = Self(0x02);
    pub const NO_CONFLICT: Self = Self(0x04);

    #[must_use]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for LoadFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Access-flag bits as they appear on the wire for variables, functions,
/// classes and interfaces.
pub const ACC_PUB: u8 = 0x01;
pub const ACC_STATIC: u8 = 0x02;
pub const ACC_NATIVE: u8 = 0x04;
pub const ACC_OVERRIDE: u8 = 0x08;
pub const ACC_FINAL: u8 = 0x10;
pub const ACC_CONST: u8 = 0x20;
/// Class-only: the class is declared as an interface/trait rather than a
/// concrete class, and has a declared parent (`DERIVED`) worth decoding.
pub const ACC_INTERFACE: u8 = 0x40;
pub const ACC_DERIVED: u8 = 0x80;

/// Maximum generic parameters a single template may declare, matching the
/// historical SLX limit.
pub const GENERIC_PARAM_MAX: u8 = 16;

/// A scope block's five member-kind sections, in on-wire order.
pub const SCOPE_SECTIONS: usize = 5;
