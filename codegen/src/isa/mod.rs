//! Target selection.
//!
//! A [`TargetIsa`] pairs an architecture with an operating system and picks
//! the calling convention. Only x86-64 has a code generator today; aarch64
//! is reserved as the parallel back end with the same contracts.

pub mod x64;

use core::fmt;
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// Instruction set architectures the back end knows about.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Arch {
    X86_64,
    Aarch64,
}

/// Operating systems, which select the ABI and the object format.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum System {
    Windows,
    Linux,
    MacOs,
}

/// Calling conventions of the x86-64 back end.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CallConv {
    /// System V AMD64, used on Linux and macOS.
    SystemV,
    /// The Windows x64 convention.
    WindowsFastcall,
}

/// Optional instruction set extensions. Nothing downstream keys off these
/// yet; they travel with the module so lowering can start using them
/// without an API change.
#[derive(Copy, Clone, Default, Debug)]
pub struct FeatureSet {
    pub sse41: bool,
    pub popcnt: bool,
    pub avx: bool,
}

/// A compilation target.
#[derive(Copy, Clone, Debug)]
pub struct TargetIsa {
    pub arch: Arch,
    pub system: System,
    pub features: FeatureSet,
}

/// The error produced when a triple names a target the back end cannot
/// compile for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedTarget(pub String);

impl fmt::Display for UnsupportedTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "unsupported target: {}", self.0)
    }
}

impl std::error::Error for UnsupportedTarget {}

impl TargetIsa {
    /// Build a target description from a triple.
    pub fn from_triple(triple: &Triple, features: FeatureSet) -> Result<TargetIsa, UnsupportedTarget> {
        let arch = match triple.architecture {
            Architecture::X86_64 => Arch::X86_64,
            Architecture::Aarch64(_) => Arch::Aarch64,
            other => return Err(UnsupportedTarget(other.to_string())),
        };
        let system = match triple.operating_system {
            OperatingSystem::Windows => System::Windows,
            OperatingSystem::Linux => System::Linux,
            OperatingSystem::Darwin(_) | OperatingSystem::MacOSX(_) => System::MacOs,
            other => return Err(UnsupportedTarget(other.to_string())),
        };
        Ok(TargetIsa { arch, system, features })
    }

    /// The calling convention the system dictates.
    pub fn call_conv(&self) -> CallConv {
        match self.system {
            System::Windows => CallConv::WindowsFastcall,
            System::Linux | System::MacOs => CallConv::SystemV,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn triple_mapping() {
        let linux = Triple::from_str("x86_64-unknown-linux-gnu").unwrap();
        let isa = TargetIsa::from_triple(&linux, FeatureSet::default()).unwrap();
        assert_eq!(isa.arch, Arch::X86_64);
        assert_eq!(isa.call_conv(), CallConv::SystemV);

        let windows = Triple::from_str("x86_64-pc-windows-msvc").unwrap();
        let isa = TargetIsa::from_triple(&windows, FeatureSet::default()).unwrap();
        assert_eq!(isa.call_conv(), CallConv::WindowsFastcall);
    }
}
