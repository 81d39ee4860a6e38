#![no_main]
#![no_std]
#![feature(type_alias_impl_trait)]

use curve_tracer_core::{
    acquisition::{Acquisition, BiasOutput, GainSelector, Peripherals, SweepDone},
    config::{
        CAPTURE_LEN, ERROR_FLASH_INTERVAL_MS, ERROR_FLASH_TOGGLES, GAIN_DISABLED,
        HEARTBEAT_ACK_TIMEOUT_MS, HEARTBEAT_PERIOD_MS, INSTRUCTION_QUEUE_LEN, RELAY_SETTLE_MS,
        STATUS_QUEUE_LEN,
    },
    dispatch::{dispatch, Dispatched},
    frame::{FrameAssembler, Payload},
    heartbeat::HeartbeatMonitor,
    instruction::Command,
    receive::receive_frame,
    BiasChannel, StatusEvent, HEARTBEAT_TEXT,
};
use defmt::{unwrap, Debug2Format};
use defmt_rtt as _;
use embassy_sync::{
    blocking_mutex::raw::CriticalSectionRawMutex, signal::Signal, waitqueue::WakerRegistration,
};
use embedded_hal::serial::Read;
use futures::future::FutureExt;
use panic_probe as _;
use rtic::{app, Mutex};
use rtic_monotonics::{
    systick::{ExtU64, Systick},
    Monotonic,
};
use rtic_sync::{
    arbiter::Arbiter,
    channel::{Receiver, Sender},
    make_channel,
};
use static_cell::StaticCell;
use stm32f7xx_hal::{
    i2c::{BlockingI2c, Mode as I2cMode},
    prelude::*,
    serial::{self, Serial},
    spi::{self, Spi},
};

use curve_tracer_firmware::{
    adc_capture::{self, AdcCapture},
    bias::BiasDacs,
    board::{
        self, Board, ErrorLed, SerialRx, SerialTx, StatusLed, I2C_FREQUENCY_HZ, I2C_TIMEOUT_US,
        SPI_FREQUENCY_HZ,
    },
    front_end::FrontEnd,
    gain::DigitalPot,
    link::{self, Link, RxConsumer, RxProducer, RxQueue, UartBytes, BAUD_RATE},
    sweep_timer::StepTimer,
};

defmt::timestamp!("{=u64:tms}", Systick::now().ticks());

type SharedLink = Arbiter<Link<SerialTx>>;
type Instructions = Sender<'static, Command, INSTRUCTION_QUEUE_LEN>;
type StatusEvents = Sender<'static, StatusEvent, STATUS_QUEUE_LEN>;

/// Posted by the timer interrupt when a sweep finished.
static SWEEP_DONE: SweepDone = Signal::new();
/// Posted when the host acknowledged a heartbeat.
static HEARTBEAT_ACK: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Reports a status event without waiting. A full channel drops the event.
fn post(status: &mut StatusEvents, event: StatusEvent) {
    if status.try_send(event).is_err() {
        defmt::warn!("Status channel full, dropped {}", event);
    }
}

#[app(device = stm32f7xx_hal::pac, dispatchers = [CAN1_RX0, CAN1_RX1, CAN1_SCE])]
mod app {
    use super::*;

    static CAPTURE_BUFFER: StaticCell<[u16; CAPTURE_LEN]> = StaticCell::new();
    static RX_QUEUE: StaticCell<RxQueue> = StaticCell::new();
    static LINK: StaticCell<SharedLink> = StaticCell::new();

    #[shared]
    struct Shared {
        acquisition: Acquisition<Board>,
        heartbeat: HeartbeatMonitor,
        rx_waker: WakerRegistration,
    }

    #[local]
    struct Local {
        rx: SerialRx,
        rx_producer: RxProducer,
    }

    #[init]
    fn init(cx: init::Context) -> (Shared, Local) {
        let p = cx.device;

        defmt::info!("Curve tracer starting");

        let mut rcc = p.RCC.constrain();
        // ADCCLK is PCLK2 / 4 = 27 MHz
        let clocks = rcc
            .cfgr
            .sysclk(216.MHz())
            .hclk(216.MHz())
            .pclk2(108.MHz())
            .freeze();
        defmt::info!("Clocks: {:?}", Debug2Format(&clocks));

        // Setup systick to be used for delays
        let systick_token = rtic_monotonics::create_systick_token!();
        Systick::start(cx.core.SYST, clocks.sysclk().to_Hz(), systick_token);

        let gpioa = p.GPIOA.split();
        let gpiob = p.GPIOB.split();
        let gpioc = p.GPIOC.split();
        let gpiod = p.GPIOD.split();
        let gpioe = p.GPIOE.split();

        let status_led: StatusLed = gpiob.pb7.into_push_pull_output();
        let mut error_led: ErrorLed = gpiob.pb14.into_push_pull_output();

        // ADC inputs, see `adc_capture::channels`
        let _vce_in = gpioa.pa3.into_analog();
        let _ic_in = gpioc.pc0.into_analog();
        let _vbe_in = gpioc.pc3.into_analog();

        // Bias DACs, both have to answer before anything else happens
        let i2c = BlockingI2c::i2c1(
            p.I2C1,
            (
                gpiob.pb8.into_alternate_open_drain::<4>(),
                gpiob.pb9.into_alternate_open_drain::<4>(),
            ),
            I2cMode::fast(I2C_FREQUENCY_HZ.Hz()),
            &clocks,
            &mut rcc.apb1,
            I2C_TIMEOUT_US,
        );
        let mut bias = BiasDacs::new(i2c);
        for channel in [BiasChannel::Collector, BiasChannel::Base] {
            if let Err(e) = bias.probe(channel) {
                defmt::error!(
                    "Bias DAC {} at {=u8:#x} does not answer: {}",
                    channel,
                    curve_tracer_firmware::bias::address(channel),
                    Debug2Format(&e)
                );
                board::halt(&mut error_led);
            }
            if let Err(e) = bias.write(channel, 0) {
                defmt::error!("Failed to zero bias DAC {}: {}", channel, Debug2Format(&e));
                board::halt(&mut error_led);
            }
        }

        // Digital potentiometer
        let spi = Spi::new(
            p.SPI1,
            (
                gpiob.pb3.into_alternate::<5>(),
                gpiob.pb4.into_alternate::<5>(),
                gpiob.pb5.into_alternate::<5>(),
            ),
        )
        .enable::<u8>(
            spi::Mode {
                polarity: spi::Polarity::IdleLow,
                phase: spi::Phase::CaptureOnFirstTransition,
            },
            SPI_FREQUENCY_HZ.Hz(),
            &clocks,
            &mut rcc.apb2,
        );
        let mut gain = DigitalPot::new(spi, gpiod.pd14.into_push_pull_output());
        if let Err(e) = gain.set_gain(GAIN_DISABLED) {
            defmt::error!("Failed to disable the gain stage: {}", Debug2Format(&e));
            board::halt(&mut error_led);
        }

        let front_end = FrontEnd::new(
            gpioa.pa4.into_push_pull_output(),
            gpioe.pe2.into_push_pull_output(),
            gpioa.pa6.into_push_pull_output(),
        );

        let capture = AdcCapture::init(p.ADC1, p.ADC_COMMON, p.DMA2, &mut rcc.apb2, &mut rcc.ahb1);
        let timer = StepTimer::new(p.TIM3, &clocks);

        let acquisition = Acquisition::new(
            Peripherals {
                bias,
                front_end,
                gain,
                capture,
                timer,
            },
            CAPTURE_BUFFER.init_with(|| [0; CAPTURE_LEN]),
            &SWEEP_DONE,
        );

        // Serial link to the host
        let mut serial = Serial::new(
            p.USART3,
            (
                gpiod.pd8.into_alternate::<7>(),
                gpiod.pd9.into_alternate::<7>(),
            ),
            &clocks,
            serial::Config {
                baud_rate: BAUD_RATE.bps(),
                ..Default::default()
            },
        );
        serial.listen(serial::Event::Rxne);
        let (tx, rx) = serial.split();

        let (rx_producer, rx_consumer) = RX_QUEUE.init(RxQueue::new()).split();
        let link: &'static SharedLink = LINK.init(Arbiter::new(Link::new(tx)));

        // Setup message channels
        let (instruction_sender, instruction_receiver) =
            make_channel!(Command, INSTRUCTION_QUEUE_LEN);
        let (status_sender, status_receiver) = make_channel!(StatusEvent, STATUS_QUEUE_LEN);

        // Start tasks
        {
            receive::spawn(rx_consumer, instruction_sender, status_sender.clone())
                .unwrap_or_else(|_| defmt::panic!("Failed to start receive"));

            command_dispatch::spawn(instruction_receiver, link, status_sender.clone())
                .unwrap_or_else(|_| defmt::panic!("Failed to start command_dispatch"));

            heartbeat::spawn(link, status_sender)
                .unwrap_or_else(|_| defmt::panic!("Failed to start heartbeat"));

            status::spawn(status_receiver, link, status_led, error_led)
                .unwrap_or_else(|_| defmt::panic!("Failed to start status"));
        }

        defmt::info!("Ready");

        (
            Shared {
                acquisition,
                heartbeat: HeartbeatMonitor::new(),
                rx_waker: WakerRegistration::new(),
            },
            Local { rx, rx_producer },
        )
    }

    /// Assembles received bytes into frames and queues the commands they carry.
    #[task(shared = [rx_waker], priority = 3)]
    async fn receive(
        mut cx: receive::Context,
        mut bytes: RxConsumer,
        mut instructions: Instructions,
        mut status: StatusEvents,
    ) {
        let mut assembler = FrameAssembler::new();
        let mut source = UartBytes::new(&mut bytes, &mut cx.shared.rx_waker);

        loop {
            match receive_frame(&mut assembler, &mut source).await {
                Ok(command) => {
                    post(&mut status, StatusEvent::Receive);
                    unwrap!(instructions.send(command).await.ok());
                }
                Err(e) => {
                    defmt::warn!("Dropped frame: {}", e);
                    post(&mut status, e.into());
                }
            }
        }
    }

    /// Applies queued commands and sends finished captures to the host.
    #[task(shared = [acquisition, heartbeat], priority = 2)]
    async fn command_dispatch(
        mut cx: command_dispatch::Context,
        mut instructions: Receiver<'static, Command, INSTRUCTION_QUEUE_LEN>,
        link: &'static SharedLink,
        mut status: StatusEvents,
    ) {
        loop {
            futures::select_biased! {
                report = SWEEP_DONE.wait().fuse() => {
                    defmt::info!("Sweep finished: {}", report);
                    if report.bus_faults > 0 {
                        defmt::warn!("{} bias writes failed during the sweep", report.bus_faults);
                    }

                    let capture = match cx.shared.acquisition.lock(|acquisition| acquisition.complete()) {
                        Ok(capture) => capture,
                        Err(e) => {
                            defmt::error!("No capture to send: {}", e);
                            post(&mut status, StatusEvent::ErrorGeneric);
                            continue;
                        }
                    };

                    let sent = link.access().await.send(&Payload::Capture {
                        kind: capture.kind(),
                        samples: capture.samples(),
                    });
                    cx.shared.acquisition.lock(|acquisition| acquisition.release(capture));

                    match sent {
                        Ok(()) => post(&mut status, StatusEvent::Transmit),
                        Err(e) => {
                            defmt::error!("Failed to send capture: {}", e);
                            post(&mut status, StatusEvent::ErrorGeneric);
                        }
                    }
                }
                command = instructions.recv().fuse() => {
                    let command = unwrap!(command.ok());
                    let link_up = cx.shared.heartbeat.lock(|monitor| monitor.is_connected());

                    match cx.shared.acquisition.lock(|acquisition| dispatch(command, acquisition, link_up)) {
                        Ok(Dispatched::HeartbeatAck) => HEARTBEAT_ACK.signal(()),
                        Ok(Dispatched::Loaded(request)) => {
                            defmt::info!("Planned {} sweep", request.kind);
                            defmt::debug!(
                                "Amplitude {=u16} tenths, gain {=u8}, {=u8} samples",
                                request.amplitude_tenths,
                                request.gain,
                                request.sample_count
                            );
                            post(&mut status, StatusEvent::Ok);
                        }
                        Ok(Dispatched::Arming(_)) => {
                            // Relays settle outside the lock
                            Systick::delay(RELAY_SETTLE_MS.millis()).await;
                            cx.shared.acquisition.lock(|acquisition| acquisition.switch_gain_path());
                            Systick::delay(RELAY_SETTLE_MS.millis()).await;

                            match cx.shared.acquisition.lock(|acquisition| acquisition.finish_arm()) {
                                Ok(kind) => defmt::info!("Started {} sweep", kind),
                                Err(e) => {
                                    defmt::warn!("Failed to arm: {}", e);
                                    post(&mut status, e.into());
                                }
                            }
                        }
                        Err(e) => {
                            defmt::warn!("Rejected {}: {}", command, e);
                            post(&mut status, e.into());
                        }
                    }
                }
            }
        }
    }

    /// Tells the host we are alive and watches for its acknowledgement.
    #[task(shared = [heartbeat], priority = 1)]
    async fn heartbeat(
        mut cx: heartbeat::Context,
        link: &'static SharedLink,
        mut status: StatusEvents,
    ) {
        loop {
            HEARTBEAT_ACK.reset();

            if let Err(e) = link.access().await.send_text(HEARTBEAT_TEXT) {
                defmt::error!("Failed to send heartbeat: {}", e);
                post(&mut status, StatusEvent::ErrorGeneric);
            }

            let acked = Systick::timeout_after(HEARTBEAT_ACK_TIMEOUT_MS.millis(), HEARTBEAT_ACK.wait())
                .await
                .is_ok();

            if let Some(event) = cx.shared.heartbeat.lock(|monitor| monitor.record(acked)) {
                post(&mut status, event);
            }

            Systick::delay(HEARTBEAT_PERIOD_MS.millis()).await;
        }
    }

    /// Reports status events on the LEDs and, for link faults, to the host.
    #[task(priority = 1)]
    async fn status(
        _cx: status::Context,
        mut events: Receiver<'static, StatusEvent, STATUS_QUEUE_LEN>,
        link: &'static SharedLink,
        mut status_led: StatusLed,
        mut error_led: ErrorLed,
    ) {
        while let Ok(event) = events.recv().await {
            match event {
                StatusEvent::Ok => status_led.set_high(),
                StatusEvent::ErrorGeneric => {
                    for _ in 0..ERROR_FLASH_TOGGLES {
                        error_led.toggle();
                        Systick::delay(ERROR_FLASH_INTERVAL_MS.millis()).await;
                    }
                }
                StatusEvent::Disconnect => {
                    status_led.set_low();
                    defmt::warn!("Host stopped answering heartbeats");
                }
                StatusEvent::Transmit
                | StatusEvent::Receive
                | StatusEvent::Timeout
                | StatusEvent::Overflow
                | StatusEvent::ErrorReceive => {}
            }

            if event.is_fault() {
                defmt::warn!("Status: {}", event);
            } else {
                defmt::debug!("Status: {}", event);
            }

            if let Some(text) = event.report() {
                if let Err(e) = link.access().await.send_text(text) {
                    defmt::error!("Failed to report {}: {}", event, e);
                }
            }
        }
    }

    /// Drives one sweep step per timer update.
    #[task(binds = TIM3, shared = [acquisition], priority = 4)]
    fn on_sweep_tick(mut cx: on_sweep_tick::Context) {
        cx.shared.acquisition.lock(|acquisition| acquisition.on_tick());
    }

    #[task(binds = DMA2_STREAM0, priority = 4)]
    fn on_capture_dma(_cx: on_capture_dma::Context) {
        let faults = adc_capture::take_dma_faults();
        defmt::error!("Capture DMA fault: {}", faults);
    }

    /// Moves received bytes to the receive task.
    #[task(binds = USART3, local = [rx, rx_producer], shared = [rx_waker], priority = 5)]
    fn on_uart_rx(mut cx: on_uart_rx::Context) {
        let rx = cx.local.rx;
        let dropped = link::enqueue_received(cx.local.rx_producer, || {
            rx.read().map_err(|e| {
                e.map(|e| {
                    defmt::warn!("UART receive error: {}", Debug2Format(&e));
                })
            })
        });
        if dropped > 0 {
            defmt::warn!("Receive queue full, dropped {} bytes", dropped);
        }

        cx.shared.rx_waker.lock(|waker| waker.wake());
    }
}
