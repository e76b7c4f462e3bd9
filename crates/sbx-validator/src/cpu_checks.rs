//! CPU-feature gating.
//!
//! Instructions whose feature set the host lacks are not a sandbox escape;
//! they are warned about once per feature and queued for stubbing so the
//! code degrades instead of faulting on the target machine. Only read-only
//! text turns this into an error, since there the bytes cannot be patched.

use bitflags::bitflags;
use sbx_x86::{CpuidFeature, SegmentIter};

use crate::report::Severity;
use crate::state::ValidatorState;

bitflags! {
    /// Feature bits the validator gates on. Anything not named here is
    /// treated as universally available.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CpuFeatures: u32 {
        const X87 = 1 << 0;
        const CMOV = 1 << 1;
        const CX8 = 1 << 2;
        const CX16 = 1 << 3;
        const TSC = 1 << 4;
        const MMX = 1 << 5;
        const SSE = 1 << 6;
        const SSE2 = 1 << 7;
        const SSE3 = 1 << 8;
        const SSSE3 = 1 << 9;
        const SSE41 = 1 << 10;
        const SSE42 = 1 << 11;
        const SSE4A = 1 << 12;
        const MOVBE = 1 << 13;
        const POPCNT = 1 << 14;
        const LZCNT = 1 << 15;
        const THREE_D_NOW = 1 << 16;
        const E3DNOW = 1 << 17;
        const CLFLUSH = 1 << 18;
        const FXSR = 1 << 19;
        const LONG_MODE = 1 << 20;
    }
}

fn map_feature(feature: CpuidFeature) -> Option<(CpuFeatures, &'static str)> {
    let mapped = match feature {
        CpuidFeature::FPU => (CpuFeatures::X87, "x87"),
        CpuidFeature::CMOV => (CpuFeatures::CMOV, "CMOV"),
        CpuidFeature::CX8 => (CpuFeatures::CX8, "CX8"),
        CpuidFeature::CMPXCHG16B => (CpuFeatures::CX16, "CX16"),
        CpuidFeature::TSC => (CpuFeatures::TSC, "TSC"),
        CpuidFeature::MMX => (CpuFeatures::MMX, "MMX"),
        CpuidFeature::SSE => (CpuFeatures::SSE, "SSE"),
        CpuidFeature::SSE2 => (CpuFeatures::SSE2, "SSE2"),
        CpuidFeature::SSE3 => (CpuFeatures::SSE3, "SSE3"),
        CpuidFeature::SSSE3 => (CpuFeatures::SSSE3, "SSSE3"),
        CpuidFeature::SSE4_1 => (CpuFeatures::SSE41, "SSE41"),
        CpuidFeature::SSE4_2 => (CpuFeatures::SSE42, "SSE42"),
        CpuidFeature::SSE4A => (CpuFeatures::SSE4A, "SSE4A"),
        CpuidFeature::MOVBE => (CpuFeatures::MOVBE, "MOVBE"),
        CpuidFeature::POPCNT => (CpuFeatures::POPCNT, "POPCNT"),
        CpuidFeature::LZCNT => (CpuFeatures::LZCNT, "LZCNT"),
        CpuidFeature::D3NOW => (CpuFeatures::THREE_D_NOW, "3DNOW"),
        CpuidFeature::D3NOWEXT => (CpuFeatures::E3DNOW, "E3DNOW"),
        CpuidFeature::CLFSH => (CpuFeatures::CLFLUSH, "CLFLUSH"),
        CpuidFeature::FXSR => (CpuFeatures::FXSR, "FXSR"),
        CpuidFeature::X64 => (CpuFeatures::LONG_MODE, "LM"),
        _ => return None,
    };
    Some(mapped)
}

pub(crate) fn validate_inst(state: &mut ValidatorState, iter: &SegmentIter<'_>) {
    let inst = iter.cur();
    let mut squash_me = false;
    for &feature in inst.cpuid_features() {
        let Some((bit, name)) = map_feature(feature) else {
            continue;
        };
        if state.config().cpu_features.contains(bit) {
            continue;
        }
        if !state.cpu_reported.contains(bit) {
            state.cpu_reported |= bit;
            state.message(
                Severity::Warning,
                Some(inst.addr()),
                format!("Does not support {name} feature, removing usage(s)"),
            );
        }
        squash_me = true;
    }
    if squash_me {
        if state.config().readonly_text {
            state.inst_error(
                inst,
                "Read-only text: cannot squash unsupported instruction".into(),
            );
        } else {
            state.push_stub_edit(inst.addr(), inst.len());
        }
    }
}
