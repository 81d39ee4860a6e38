use core::ops::Index;

use crate::config::{
    DAC_FULL_SCALE, RAMP_LEN, STEP_INTERVAL_US, SWEEP_PERIOD_US, VBE_TARGET_FRACTION,
    VCE_FULL_SCALE_TENTHS,
};
use crate::instruction::SweepRequest;
use crate::CurveKind;

/// DAC codes for every step of a sweep, starting at zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RampTable([u16; RAMP_LEN]);

impl RampTable {
    pub fn as_slice(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        RAMP_LEN
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn last(&self) -> u16 {
        self.0[RAMP_LEN - 1]
    }
}

impl Index<usize> for RampTable {
    type Output = u16;

    fn index(&self, index: usize) -> &u16 {
        &self.0[index]
    }
}

/// Linear ramp from zero up to the target of `request`.
pub fn plan(request: &SweepRequest) -> RampTable {
    let target = match request.kind {
        CurveKind::Vce => f32::from(request.amplitude_tenths) / f32::from(VCE_FULL_SCALE_TENTHS),
        CurveKind::Vbe => VBE_TARGET_FRACTION,
    };
    let slope = target / SWEEP_PERIOD_US as f32;

    RampTable(core::array::from_fn(|i| {
        let elapsed_us = (i as u32 * STEP_INTERVAL_US) as f32;
        let code = libm::roundf(slope * elapsed_us * f32::from(DAC_FULL_SCALE));
        (code as u16).min(DAC_FULL_SCALE)
    }))
}

/// A request together with its ramp, fixed for the whole sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepPlan {
    pub request: SweepRequest,
    pub ramp: RampTable,
}

impl SweepPlan {
    pub fn new(request: SweepRequest) -> Self {
        Self {
            ramp: plan(&request),
            request,
        }
    }
}
