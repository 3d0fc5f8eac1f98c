use core::convert::TryInto;
use std::{sync::OnceLock, time::Instant};

use anyhow::Context;
use esp_idf_hal::{
    gpio::OutputPin,
    peripheral::Peripheral,
    rmt::{
        config::TransmitConfig, PinState, Pulse, PulseTicks, RmtChannel, TxRmtDriver,
        VariableLengthSignal,
    },
};
use log::{debug, warn};
use serde::Serialize;

use circadian_common::{LightOutput, Rgb};

// 80 MHz APB / 2 = 40 MHz, 25 ns per tick.
const LED_TICK_DIVIDER: u8 = 2;
const T0H_TICKS: u16 = 16;
const T0L_TICKS: u16 = 34;
const T1H_TICKS: u16 = 32;
const T1L_TICKS: u16 = 18;
const BITS_PER_PIXEL: usize = 24;

enum LedBackend {
    Rmt(TxRmtDriver<'static>),
    Disabled,
}

/// WS2812 ring where every pixel shows the same color.
pub struct LedStrip {
    backend: LedBackend,
    pixel_count: usize,
    last_frame: Option<Rgb>,
    sent_frames: u64,
    failed_frames: u64,
    last_send_ms: Option<u64>,
    last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedDiagnostics {
    pub enabled: bool,
    #[serde(rename = "pixelCount")]
    pub pixel_count: usize,
    #[serde(rename = "lastFrame")]
    pub last_frame: Option<[u8; 3]>,
    #[serde(rename = "sentFrames")]
    pub sent_frames: u64,
    #[serde(rename = "failedFrames")]
    pub failed_frames: u64,
    #[serde(rename = "lastSendMs")]
    pub last_send_ms: Option<u64>,
    #[serde(rename = "lastError")]
    pub last_error: Option<String>,
}

impl LedStrip {
    pub fn new<C, P>(
        channel: impl Peripheral<P = C> + 'static,
        pin: impl Peripheral<P = P> + 'static,
        pixel_count: u16,
    ) -> anyhow::Result<Self>
    where
        C: RmtChannel,
        P: OutputPin,
    {
        let config = TransmitConfig::new()
            .clock_divider(LED_TICK_DIVIDER)
            .carrier(None)
            .idle(Some(PinState::Low));

        let tx =
            TxRmtDriver::new(channel, pin, &config).context("failed to init RMT LED driver")?;

        Ok(Self {
            backend: LedBackend::Rmt(tx),
            ..Self::disabled(pixel_count)
        })
    }

    pub fn disabled(pixel_count: u16) -> Self {
        Self {
            backend: LedBackend::Disabled,
            pixel_count: usize::from(pixel_count.max(1)),
            last_frame: None,
            sent_frames: 0,
            failed_frames: 0,
            last_send_ms: None,
            last_error: None,
        }
    }

    /// Pushes the output to the ring unless the same frame is already showing.
    pub fn render(&mut self, output: &LightOutput) -> anyhow::Result<()> {
        let pixel = output.pixel();
        if self.last_frame == Some(pixel) {
            return Ok(());
        }

        let result = self.write_frame(pixel);
        match &result {
            Ok(()) => {
                debug!("led frame {:?} -> {:?}", output, pixel);
                self.last_frame = Some(pixel);
                self.last_error = None;
            }
            Err(err) => {
                self.failed_frames = self.failed_frames.saturating_add(1);
                self.last_error = Some(format!("{err:#}"));
            }
        }
        result
    }

    pub fn diagnostics(&self) -> LedDiagnostics {
        LedDiagnostics {
            enabled: matches!(self.backend, LedBackend::Rmt(_)),
            pixel_count: self.pixel_count,
            last_frame: self.last_frame.map(|rgb| [rgb.red, rgb.green, rgb.blue]),
            sent_frames: self.sent_frames,
            failed_frames: self.failed_frames,
            last_send_ms: self.last_send_ms,
            last_error: self.last_error.clone(),
        }
    }

    fn write_frame(&mut self, pixel: Rgb) -> anyhow::Result<()> {
        let LedBackend::Rmt(tx) = &mut self.backend else {
            warn!("LED output disabled, dropping frame {pixel:?}");
            return Ok(());
        };

        let zero = [
            Pulse::new(PinState::High, PulseTicks::new(T0H_TICKS)?),
            Pulse::new(PinState::Low, PulseTicks::new(T0L_TICKS)?),
        ];
        let one = [
            Pulse::new(PinState::High, PulseTicks::new(T1H_TICKS)?),
            Pulse::new(PinState::Low, PulseTicks::new(T1L_TICKS)?),
        ];

        let grb = grb_word(pixel);
        let mut signal =
            VariableLengthSignal::with_capacity(self.pixel_count * BITS_PER_PIXEL * 2);
        for _ in 0..self.pixel_count {
            for bit in (0..BITS_PER_PIXEL).rev() {
                let pulses = if (grb >> bit) & 1 == 1 { &one } else { &zero };
                signal
                    .push(pulses.iter())
                    .context("failed to encode LED frame")?;
            }
        }

        tx.start_blocking(&signal)
            .context("failed to transmit LED frame over RMT")?;

        self.last_send_ms = Some(monotonic_ms());
        self.sent_frames = self.sent_frames.saturating_add(1);
        Ok(())
    }
}

/// WS2812 expects green first, most significant bit first.
fn grb_word(pixel: Rgb) -> u32 {
    (u32::from(pixel.green) << 16) | (u32::from(pixel.red) << 8) | u32::from(pixel.blue)
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
