//! Size-class taxonomy: fixed block sizes from 8 B to 32 MB, grouped into
//! Small / Medium / Large categories for weight-based tuning.

use std::fmt;

/// Number of discrete size classes.
pub const NUM_SIZE_CLASSES: usize = 23;

const KB: usize = 1024;
const MB: usize = 1024 * 1024;

/// A fixed block size. Requests are rounded up to the smallest enclosing
/// class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SizeClass {
    B8,
    B16,
    B32,
    B64,
    B128,
    B256,
    B512,
    K1,
    K2,
    K4,
    K8,
    K16,
    K32,
    K64,
    K128,
    K256,
    K512,
    M1,
    M2,
    M4,
    M8,
    M16,
    M32,
}

const SIZES: [usize; NUM_SIZE_CLASSES] = [
    8,
    16,
    32,
    64,
    128,
    256,
    512,
    KB,
    2 * KB,
    4 * KB,
    8 * KB,
    16 * KB,
    32 * KB,
    64 * KB,
    128 * KB,
    256 * KB,
    512 * KB,
    MB,
    2 * MB,
    4 * MB,
    8 * MB,
    16 * MB,
    32 * MB,
];

const ALL: [SizeClass; NUM_SIZE_CLASSES] = [
    SizeClass::B8,
    SizeClass::B16,
    SizeClass::B32,
    SizeClass::B64,
    SizeClass::B128,
    SizeClass::B256,
    SizeClass::B512,
    SizeClass::K1,
    SizeClass::K2,
    SizeClass::K4,
    SizeClass::K8,
    SizeClass::K16,
    SizeClass::K32,
    SizeClass::K64,
    SizeClass::K128,
    SizeClass::K256,
    SizeClass::K512,
    SizeClass::M1,
    SizeClass::M2,
    SizeClass::M4,
    SizeClass::M8,
    SizeClass::M16,
    SizeClass::M32,
];

impl SizeClass {
    /// The largest class; oversize requests map here and then take the
    /// direct large path.
    pub const MAX: SizeClass = SizeClass::M32;

    /// All classes in ascending size order.
    pub fn all() -> &'static [SizeClass] {
        &ALL
    }

    /// Block size in bytes.
    pub fn size(self) -> usize {
        SIZES[self as usize]
    }

    /// Position in the ascending class table.
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(index: usize) -> Option<SizeClass> {
        ALL.get(index).copied()
    }

    /// Resolve an exact byte size to its class, if any. Used to reject
    /// unrecognized size values in configuration weights.
    pub fn from_size(size: usize) -> Option<SizeClass> {
        SIZES
            .iter()
            .position(|&s| s == size)
            .map(|i| ALL[i])
    }

    /// Smallest class whose size is >= `size`. Oversize requests return
    /// [`SizeClass::MAX`]; callers bypass the cache and allocate directly.
    pub fn class_of(size: usize) -> SizeClass {
        for (i, &s) in SIZES.iter().enumerate() {
            if size <= s {
                return ALL[i];
            }
        }
        SizeClass::MAX
    }

    pub fn category(self) -> SizeCategory {
        match self.size() {
            s if s <= 4 * KB => SizeCategory::Small,
            s if s <= 64 * KB => SizeCategory::Medium,
            _ => SizeCategory::Large,
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let size = self.size();
        if size < KB {
            write!(f, "{size}B")
        } else if size < MB {
            write!(f, "{}KB", size / KB)
        } else {
            write!(f, "{}MB", size / MB)
        }
    }
}

/// Coarse grouping of size classes. `All` exists only as a subscription
/// filter for configuration events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SizeCategory {
    Small,
    Medium,
    Large,
    All,
}

const SMALL_CLASSES: [SizeClass; 10] = [
    SizeClass::B8,
    SizeClass::B16,
    SizeClass::B32,
    SizeClass::B64,
    SizeClass::B128,
    SizeClass::B256,
    SizeClass::B512,
    SizeClass::K1,
    SizeClass::K2,
    SizeClass::K4,
];

const MEDIUM_CLASSES: [SizeClass; 4] =
    [SizeClass::K8, SizeClass::K16, SizeClass::K32, SizeClass::K64];

const LARGE_CLASSES: [SizeClass; 9] = [
    SizeClass::K128,
    SizeClass::K256,
    SizeClass::K512,
    SizeClass::M1,
    SizeClass::M2,
    SizeClass::M4,
    SizeClass::M8,
    SizeClass::M16,
    SizeClass::M32,
];

impl SizeCategory {
    /// Classes belonging to this category, ascending. Empty for `All`.
    pub fn classes(self) -> &'static [SizeClass] {
        match self {
            SizeCategory::Small => &SMALL_CLASSES,
            SizeCategory::Medium => &MEDIUM_CLASSES,
            SizeCategory::Large => &LARGE_CLASSES,
            SizeCategory::All => &[],
        }
    }
}

impl fmt::Display for SizeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SizeCategory::Small => "small",
            SizeCategory::Medium => "medium",
            SizeCategory::Large => "large",
            SizeCategory::All => "all",
        };
        f.write_str(name)
    }
}
