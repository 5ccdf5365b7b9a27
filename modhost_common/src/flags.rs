//! Flag sets shared by loader and modules.

use bitflags::bitflags;

bitflags! {
    /// Caller-settable load options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LoadFlags: u8 {
        /// Do not report a module that cannot be opened.
        const QUIET = 0x01;
        /// Load even if the dependency check reports a mismatch.
        const FORCE = 0x02;
    }
}

bitflags! {
    /// Architecture modes an instruction binding applies to.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
    pub struct ArchModes: u8 {
        /// System/370.
        const S370   = 0x01;
        /// ESA/390.
        const ESA390 = 0x02;
        /// z/Architecture.
        const ZARCH  = 0x04;
    }
}

impl ArchModes {
    /// Display name of a single mode. Returns `None` for empty or combined sets.
    pub fn mode_name(self) -> Option<&'static str> {
        if self == Self::S370 {
            Some("S/370")
        } else if self == Self::ESA390 {
            Some("ESA/390")
        } else if self == Self::ZARCH {
            Some("z/Arch")
        } else {
            None
        }
    }

    /// Display names of every mode in the set, in ascending bit order.
    pub fn mode_names(self) -> Vec<&'static str> {
        self.iter().filter_map(Self::mode_name).collect()
    }
}
