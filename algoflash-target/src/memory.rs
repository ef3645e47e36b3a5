use crate::serialize::{hex_range, hex_u_int};
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Access permissions of a memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryAccess {
    /// The region can be read.
    #[serde(default = "yes")]
    pub read: bool,
    /// The region can be written by the flashing engine.
    #[serde(default = "yes")]
    pub write: bool,
    /// The chip boots from this region.
    #[serde(default)]
    pub boot: bool,
}

fn yes() -> bool {
    true
}

impl Default for MemoryAccess {
    fn default() -> Self {
        MemoryAccess {
            read: true,
            write: true,
            boot: false,
        }
    }
}

/// Common accessors of all memory region kinds.
pub trait Region {
    /// Optional human readable name of the region.
    fn name(&self) -> Option<&str>;

    /// Absolute address range covered by the region.
    fn range(&self) -> &Range<u64>;

    /// Declared access permissions, or the defaults if none were declared.
    fn access(&self) -> MemoryAccess;

    /// Returns whether the region can be read.
    fn is_readable(&self) -> bool {
        self.access().read
    }

    /// Returns whether the region can be written.
    fn is_writable(&self) -> bool {
        self.access().write
    }
}

macro_rules! impl_region {
    ($($ty:ty),*) => {
        $(
            impl Region for $ty {
                fn name(&self) -> Option<&str> {
                    self.name.as_deref()
                }

                fn range(&self) -> &Range<u64> {
                    &self.range
                }

                fn access(&self) -> MemoryAccess {
                    self.access.unwrap_or_default()
                }
            }
        )*
    };
}

/// A flash array serviced by exactly one flash algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NvmRegion {
    /// A name to describe the region.
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region.
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Name of the flash algorithm servicing this region.
    ///
    /// When absent, the algorithm whose flash range contains the region is used.
    #[serde(default)]
    pub algorithm: Option<String>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
}

/// RAM of the target. It can hold algorithms and buffers, but is never flashed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RamRegion {
    /// A name to describe the region.
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region.
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
}

/// Memory which is neither flash nor RAM, e.g. configuration rows or peripherals.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenericRegion {
    /// A name to describe the region.
    #[serde(default)]
    pub name: Option<String>,
    /// Address range of the region.
    #[serde(serialize_with = "hex_range")]
    pub range: Range<u64>,
    /// Access permissions for the region.
    #[serde(default)]
    pub access: Option<MemoryAccess>,
}

impl_region!(NvmRegion, RamRegion, GenericRegion);

/// Declares the type of a memory region.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryRegion {
    /// Memory region describing RAM.
    Ram(RamRegion),
    /// Memory region which is neither flash nor RAM.
    Generic(GenericRegion),
    /// Memory region describing flash.
    Nvm(NvmRegion),
}

impl MemoryRegion {
    fn as_region(&self) -> &dyn Region {
        match self {
            MemoryRegion::Ram(region) => region,
            MemoryRegion::Generic(region) => region,
            MemoryRegion::Nvm(region) => region,
        }
    }

    /// Returns the RAM region if this is a RAM region, otherwise None.
    pub fn as_ram_region(&self) -> Option<&RamRegion> {
        match self {
            MemoryRegion::Ram(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the NVM region if this is a NVM region, otherwise None.
    pub fn as_nvm_region(&self) -> Option<&NvmRegion> {
        match self {
            MemoryRegion::Nvm(region) => Some(region),
            _ => None,
        }
    }

    /// Returns the name of the region, if it has one.
    pub fn name(&self) -> Option<&str> {
        self.as_region().name()
    }

    /// Returns the address range of the memory region.
    pub fn address_range(&self) -> Range<u64> {
        self.as_region().range().clone()
    }

    /// Returns whether the memory region contains the given address.
    pub fn contains(&self, address: u64) -> bool {
        self.as_region().range().contains(&address)
    }

    /// Returns whether the flashing engine may write to this region.
    pub fn is_writable(&self) -> bool {
        self.as_region().is_writable()
    }

    /// Returns `true` if the memory region is [`Ram`].
    ///
    /// [`Ram`]: MemoryRegion::Ram
    #[must_use]
    pub fn is_ram(&self) -> bool {
        matches!(self, Self::Ram(..))
    }

    /// Returns `true` if the memory region is [`Nvm`].
    ///
    /// [`Nvm`]: MemoryRegion::Nvm
    #[must_use]
    pub fn is_nvm(&self) -> bool {
        matches!(self, Self::Nvm(..))
    }
}

/// A group of equally sized erase units.
///
/// Starting at `address` (an offset from the start of the flash), all
/// following sectors have a size of `size`, until the end of the flash or the
/// next `SectorDescription`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SectorDescription {
    /// Size of each individual flash sector.
    #[serde(serialize_with = "hex_u_int")]
    pub size: u64,
    /// Start of the group, relative to the start address of the flash.
    #[serde(serialize_with = "hex_u_int")]
    pub address: u64,
}

/// A single erase unit in flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SectorInfo {
    /// Base address of the flash sector.
    pub base_address: u64,
    /// Size of the flash sector.
    pub size: u64,
}

impl SectorInfo {
    /// Returns the address range of the sector.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size
    }
}

/// A single program unit in flash.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PageInfo {
    /// Base address of the page in flash.
    pub base_address: u64,
    /// Size of the page.
    pub size: u32,
}

impl PageInfo {
    /// Returns the address range of the page.
    pub fn address_range(&self) -> Range<u64> {
        self.base_address..self.base_address + self.size as u64
    }
}

/// Range intersection testing.
pub trait MemoryRange {
    /// Returns true if `self` contains `range` fully. Empty ranges are never contained.
    fn contains_range(&self, range: &Range<u64>) -> bool;

    /// Returns true if `self` and `range` share at least one address.
    fn intersects_range(&self, range: &Range<u64>) -> bool;
}

impl MemoryRange for Range<u64> {
    fn contains_range(&self, range: &Range<u64>) -> bool {
        !range.is_empty() && self.start <= range.start && range.end <= self.end
    }

    fn intersects_range(&self, range: &Range<u64>) -> bool {
        !self.is_empty() && !range.is_empty() && self.start < range.end && range.start < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(0..4, 0..4 => true; "identical")]
    #[test_case(0..4, 1..3 => true; "inner")]
    #[test_case(0..4, 0..5 => false; "overhanging end")]
    #[test_case(4..8, 3..9 => false; "enclosing")]
    #[test_case(4..8, 5..5 => false; "empty")]
    fn contains_range(outer: Range<u64>, inner: Range<u64>) -> bool {
        outer.contains_range(&inner)
    }

    #[test_case(0..4, 3..8 => true; "overlapping tail")]
    #[test_case(4..8, 0..5 => true; "overlapping head")]
    #[test_case(0..4, 4..8 => false; "adjacent")]
    #[test_case(4..8, 0..16 => true; "enclosed")]
    #[test_case(4..8, 6..6 => false; "empty")]
    fn intersects_range(a: Range<u64>, b: Range<u64>) -> bool {
        a.intersects_range(&b)
    }

    #[test]
    fn generic_region_can_be_read_only() {
        let region: MemoryRegion = serde_yaml::from_str(
            r#"
!Generic
name: user_row
range:
  start: 0x804000
  end: 0x804200
access:
  write: false
"#,
        )
        .unwrap();

        assert_eq!(region.name(), Some("user_row"));
        assert_eq!(region.address_range(), 0x80_4000..0x80_4200);
        assert!(!region.is_writable());
        assert!(!region.is_nvm());
    }

    #[test]
    fn nvm_defaults_to_writable() {
        let region = NvmRegion {
            name: None,
            range: 0..0x100,
            algorithm: None,
            access: None,
        };
        assert!(region.is_writable());
    }
}
