use core::sync::atomic::{compiler_fence, Ordering};

use curve_tracer_core::{
    acquisition::{CaptureBuffer, CaptureTransport},
    config::CAPTURE_LEN,
    CurveKind,
};
use hal::{
    pac,
    rcc::{self, Enable, Reset, APB2},
};
use stm32f7xx_hal as hal;

const _: () = assert!(CAPTURE_LEN <= u16::MAX as usize);
const CAPTURE_TRANSFERS: u16 = CAPTURE_LEN as u16;

/// 56 ADC clock cycles per sample.
const SAMPLE_TIME: u32 = 0b011;

/// Clears FEIF0, DMEIF0, TEIF0, HTIF0 and TCIF0.
const STREAM0_FLAGS: u32 = 0b11_1101;
const STREAM0_TEIF: u32 = 1 << 3;
const STREAM0_DMEIF: u32 = 1 << 2;

/// ADC1 inputs converted for a curve, in scan order. Samples in the buffer interleave the
/// two.
pub const fn channels(kind: CurveKind) -> [u8; 2] {
    match kind {
        // PA3 collector voltage, PC0 collector current
        CurveKind::Vce => [3, 10],
        // PC0 collector current, PC3 base voltage
        CurveKind::Vbe => [10, 13],
    }
}

/// Free-running two channel ADC1 scan, moved into memory by DMA2 stream 0.
pub struct AdcCapture {
    adc1: pac::ADC1,
    dma2: pac::DMA2,
    in_flight: Option<CaptureBuffer>,
}

impl AdcCapture {
    pub fn init(
        adc1: pac::ADC1,
        adc_common: pac::ADC_COMMON,
        dma2: pac::DMA2,
        apb2: &mut rcc::APB2,
        ahb1: &mut rcc::AHB1,
    ) -> Self {
        let mut this = Self {
            adc1,
            dma2,
            in_flight: None,
        };

        this.init_dma2(ahb1);
        this.init_adc1(apb2, &adc_common);

        this
    }

    /// Configure DMA2 Stream 0 to move 16-bit conversions from ADC1 into memory, once
    fn init_dma2(&mut self, ahb1: &mut rcc::AHB1) {
        let dma2_stream0 = &self.dma2.st[0];
        <pac::DMA2 as Enable>::enable(ahb1);
        // Disable DMA2 Stream 0
        dma2_stream0.cr.modify(|_, w| w.en().disabled());
        while dma2_stream0.cr.read().en().bit_is_set() {}

        dma2_stream0.cr.modify(|_, w| {
            // Select channel 0 (ADC1)
            w.chsel()
                .bits(0)
                // Single buffer, the capture ends when the buffer is full
                .dbm()
                .disabled()
                .circ()
                .disabled()
                // Set data size to 16 bits at memory side
                .msize()
                .bits16()
                // Set data size to 16 bits at peripheral side
                .psize()
                .bits16()
                // Increment memory pointer after each read
                .minc()
                .incremented()
                // Do not increment peripheral data pointer
                .pinc()
                .fixed()
                // Write from peripheral to memory
                .dir()
                .peripheral_to_memory()
                .pfctrl()
                .dma()
                // The end of a capture is decided by the sweep, not the stream
                .tcie()
                .disabled()
                // Enable Transfer Error Interrupt
                .teie()
                .enabled()
                // Enable Direct Mode Error Interrupt
                .dmeie()
                .enabled()
                .ct()
                .memory0()
        });

        // Set peripheral address to ADC1 data register
        dma2_stream0
            .par
            .write(|w| unsafe { w.pa().bits(self.adc1.dr.as_ptr() as u32) });
    }

    /// Configure ADC1 to 12-bits resolution, scanning two channels continuously and read out
    /// using DMA
    fn init_adc1(&mut self, apb2: &mut APB2, adc_common: &pac::ADC_COMMON) {
        let adc1 = &self.adc1;
        <pac::ADC1 as Enable>::enable(apb2);
        // Power down ADC1
        adc1.cr2.modify(|_, w| w.adon().clear_bit());
        <pac::ADC1 as Reset>::reset(apb2);

        // ADCCLK = PCLK2 / 4
        adc_common.ccr.modify(|_, w| unsafe { w.adcpre().bits(0b01) });

        // Scan the regular sequence, no discontinuous mode, no interrupts
        adc1.cr1.modify(|_, w| {
            w.scan()
                .set_bit()
                .discen()
                .clear_bit()
                .eocie()
                .disabled()
                .ovrie()
                .disabled()
        });

        // Setup ADC1 resolution to 12 bit
        adc1.cr1.modify(|_, w| w.res().bits(0b00));

        // Software triggered, right aligned
        adc1.cr2
            .modify(|_, w| unsafe { w.exten().bits(0b00).align().clear_bit() });

        // Two conversions per sequence
        adc1.sqr1.modify(|_, w| unsafe { w.l().bits(1) });

        for kind in [CurveKind::Vce, CurveKind::Vbe] {
            for channel in channels(kind) {
                self.set_sample_time(channel);
            }
        }

        // Power up ADC1
        adc1.cr2.modify(|_, w| w.adon().enabled());
    }

    fn set_sample_time(&self, channel: u8) {
        let adc1 = &self.adc1;
        if channel < 10 {
            let offset = 3 * u32::from(channel);
            adc1.smpr2
                .modify(|r, w| unsafe { w.bits(r.bits() & !(0b111 << offset) | SAMPLE_TIME << offset) });
        } else {
            let offset = 3 * u32::from(channel - 10);
            adc1.smpr1
                .modify(|r, w| unsafe { w.bits(r.bits() & !(0b111 << offset) | SAMPLE_TIME << offset) });
        }
    }

    fn select(&mut self, kind: CurveKind) {
        let [first, second] = channels(kind);
        self.adc1
            .sqr3
            .modify(|_, w| unsafe { w.sq1().bits(first).sq2().bits(second) });
    }

    fn clear_dma_flags(&mut self) {
        self.dma2.lifcr.write(|w| unsafe { w.bits(STREAM0_FLAGS) });
    }
}

impl CaptureTransport for AdcCapture {
    fn start(&mut self, buffer: CaptureBuffer, kind: CurveKind) {
        self.select(kind);
        self.clear_dma_flags();

        let dma2_stream0 = &self.dma2.st[0];
        dma2_stream0
            .m0ar
            .write(|w| unsafe { w.m0a().bits(buffer.as_mut_ptr() as u32) });
        dma2_stream0
            .ndtr
            .modify(|_, w| w.ndt().bits(CAPTURE_TRANSFERS));

        compiler_fence(Ordering::Release);

        // Enable DMA2 Stream 0
        dma2_stream0.cr.modify(|_, w| w.en().enabled());

        self.adc1
            .cr2
            .modify(|_, w| w.cont().continuous().dma().enabled().dds().continuous());
        self.adc1.cr2.modify(|_, w| w.swstart().set_bit());

        self.in_flight = Some(buffer);
    }

    fn stop(&mut self) -> Option<CaptureBuffer> {
        // Finish the running conversion and stop requesting transfers
        self.adc1
            .cr2
            .modify(|_, w| w.cont().clear_bit().dma().clear_bit());

        let dma2_stream0 = &self.dma2.st[0];
        dma2_stream0.cr.modify(|_, w| w.en().disabled());
        while dma2_stream0.cr.read().en().bit_is_set() {}

        compiler_fence(Ordering::Acquire);

        self.in_flight.take()
    }

    fn drain(&mut self) {
        // Reading DR drops a stale conversion and clears EOC
        let _ = self.adc1.dr.read();
        self.adc1
            .sr
            .modify(|_, w| w.ovr().clear_bit().eoc().clear_bit().strt().clear_bit());
        self.clear_dma_flags();
    }

    fn is_armed(&self) -> bool {
        self.in_flight.is_some()
    }
}

/// Stream 0 faults seen by the DMA interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct DmaFaults {
    pub transfer_error: bool,
    pub direct_mode_error: bool,
}

/// Reads and clears the stream 0 flags. Called from the DMA2_STREAM0 interrupt, which does
/// not own the stream.
pub fn take_dma_faults() -> DmaFaults {
    // SAFETY: LISR is read only and LIFCR is write-1-to-clear, no other stream is touched
    let dma2 = unsafe { &*pac::DMA2::ptr() };
    let lisr = dma2.lisr.read().bits();
    dma2.lifcr.write(|w| unsafe { w.bits(STREAM0_FLAGS) });

    DmaFaults {
        transfer_error: lisr & STREAM0_TEIF != 0,
        direct_mode_error: lisr & STREAM0_DMEIF != 0,
    }
}
