use embedded_graphics::{
    mono_font::{MonoTextStyleBuilder, ascii::FONT_6X10},
    pixelcolor::BinaryColor,
    prelude::*,
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use heapless::String;
use log::{debug, warn};
use ssd1306::{Ssd1306, mode::BufferedGraphicsMode, prelude::*};

/// Number of text rows on the panel.
pub const SLOT_COUNT: usize = 4;

/// Longest text kept per row; anything longer is cut. A 128 px row holds
/// 21 glyphs of the 6 px font.
pub const LINE_LEN: usize = 21;

/// Pixel height of one row on a 128x64 panel.
const ROW_HEIGHT: i32 = 16;

/// Fixed vertical position on the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(u8);

impl Slot {
    /// Title / status row.
    pub const STATUS: Slot = Slot(0);

    /// Row showing the reading of device `index`, if the panel has one.
    pub fn reading(index: u8) -> Option<Slot> {
        let row = usize::from(index) + 1;
        (row < SLOT_COUNT).then_some(Slot(row as u8))
    }

    pub fn row(&self) -> usize {
        usize::from(self.0)
    }
}

/// Text of every row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    rows: [String<LINE_LEN>; SLOT_COUNT],
}

impl Frame {
    pub fn set(&mut self, slot: Slot, text: &str) {
        let Some(row) = self.rows.get_mut(slot.row()) else {
            return;
        };
        row.clear();
        for ch in text.chars() {
            if row.push(ch).is_err() {
                break;
            }
        }
    }

    pub fn row(&self, slot: Slot) -> &str {
        self.rows.get(slot.row()).map(|r| r.as_str()).unwrap_or("")
    }

    pub fn rows(&self) -> impl Iterator<Item = (Slot, &str)> {
        self.rows
            .iter()
            .enumerate()
            .map(|(i, r)| (Slot(i as u8), r.as_str()))
    }
}

/// Positioned text output with an explicit commit.
pub trait DisplaySink {
    /// Stages text for the given rows. Rows not mentioned keep their text.
    fn show(&mut self, lines: &[(&str, Slot)]);

    /// Pushes the staged frame to the device.
    fn commit(&mut self);
}

/// Device that can draw whole text rows.
pub trait TextPanel {
    type Error: core::fmt::Debug;

    fn clear(&mut self) -> Result<(), Self::Error>;

    fn draw_row(&mut self, text: &str, slot: Slot) -> Result<(), Self::Error>;

    /// Update/flush the panel (show the buffer).
    fn flush(&mut self) -> Result<(), Self::Error>;
}

/// Assembles frames incrementally and renders them on commit.
///
/// Without a panel every call is still accepted and only the frame
/// bookkeeping happens.
pub struct FrameDisplay<P> {
    panel: Option<P>,
    staged: Frame,
    shown: Option<Frame>,
}

impl<P: TextPanel> FrameDisplay<P> {
    pub fn new(panel: P) -> Self {
        Self {
            panel: Some(panel),
            staged: Frame::default(),
            shown: None,
        }
    }

    /// Sink for a board whose panel did not come up.
    pub fn absent() -> Self {
        Self {
            panel: None,
            staged: Frame::default(),
            shown: None,
        }
    }

    pub fn is_present(&self) -> bool {
        self.panel.is_some()
    }

    /// Last committed frame.
    pub fn frame(&self) -> Option<&Frame> {
        self.shown.as_ref()
    }

    fn render(panel: &mut P, frame: &Frame) -> Result<(), P::Error> {
        panel.clear()?;
        for (slot, text) in frame.rows() {
            if !text.is_empty() {
                panel.draw_row(text, slot)?;
            }
        }
        panel.flush()
    }
}

impl<P: TextPanel> DisplaySink for FrameDisplay<P> {
    fn show(&mut self, lines: &[(&str, Slot)]) {
        for (text, slot) in lines {
            self.staged.set(*slot, text);
        }
    }

    fn commit(&mut self) {
        if self.shown.as_ref() == Some(&self.staged) {
            debug!("Display frame unchanged, skipping redraw");
            return;
        }
        if let Some(panel) = self.panel.as_mut() {
            if let Err(e) = Self::render(panel, &self.staged) {
                // Leave `shown` alone so the next commit redraws.
                warn!("Display update failed: {:?}", e);
                return;
            }
        }
        self.shown = Some(self.staged.clone());
    }
}

/// SSD1306 OLED in buffered graphics mode, text centered per row.
pub struct Ssd1306Panel<DI, SIZE>
where
    SIZE: DisplaySize,
{
    display: Ssd1306<DI, SIZE, BufferedGraphicsMode<SIZE>>,
}

impl<DI, SIZE> Ssd1306Panel<DI, SIZE>
where
    DI: WriteOnlyDataCommand,
    SIZE: DisplaySize,
{
    /// Initializes the controller. The board mounts the panel upside down.
    pub fn new(interface: DI, size: SIZE) -> Result<Self, &'static str> {
        let mut display =
            Ssd1306::new(interface, size, DisplayRotation::Rotate180).into_buffered_graphics_mode();
        display.init().map_err(|_| "Failed to initialize display")?;
        display
            .clear(BinaryColor::Off)
            .map_err(|_| "Failed to clear display")?;
        display.flush().map_err(|_| "Failed to update display")?;
        Ok(Self { display })
    }
}

impl<DI, SIZE> TextPanel for Ssd1306Panel<DI, SIZE>
where
    DI: WriteOnlyDataCommand,
    SIZE: DisplaySize,
{
    type Error = &'static str;

    fn clear(&mut self) -> Result<(), Self::Error> {
        self.display
            .clear(BinaryColor::Off)
            .map_err(|_| "Failed to clear display")
    }

    fn draw_row(&mut self, text: &str, slot: Slot) -> Result<(), Self::Error> {
        let text_style = MonoTextStyleBuilder::new()
            .font(&FONT_6X10)
            .text_color(BinaryColor::On)
            .build();
        let layout = TextStyleBuilder::new()
            .alignment(Alignment::Center)
            .baseline(Baseline::Top)
            .build();
        let width = self.display.bounding_box().size.width as i32;
        let origin = Point::new(width / 2, slot.row() as i32 * ROW_HEIGHT + 1);
        Text::with_text_style(text, origin, text_style, layout)
            .draw(&mut self.display)
            .map_err(|_| "Failed to draw text")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        self.display.flush().map_err(|_| "Failed to update display")
    }
}
