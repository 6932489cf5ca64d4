use core::fmt::Write;

use heapless::Vec;

use crate::error::{DecodeFault, EncodeFault};
use crate::reading::{MAX_DEVICES, Reading};

/// Largest payload a LoRa packet can carry.
pub const MAX_RECORD_LEN: usize = 255;

/// Label prefix of every line, followed by the 1-based device number.
const LABEL: &str = "Temp ";

/// Unit suffix of every line.
const UNIT: &str = " C";

/// Encoded telemetry, ready for one transmission.
pub type Record = Vec<u8, MAX_RECORD_LEN>;

/// Readings recovered from one record.
pub type Readings = Vec<Reading, MAX_DEVICES>;

/// Line-oriented text form used on the air and on the display:
/// `Temp <n>: <value> C`, one line per reading, joined by `\n`.
///
/// `<n>` is the device index plus one and `<value>` always carries two
/// decimals, so `decode` only has to accept one spelling per reading.
pub fn encode(readings: &[Reading]) -> Result<Record, EncodeFault> {
    if readings.len() > MAX_DEVICES {
        return Err(EncodeFault::TooMany);
    }
    let mut writer = RecordWriter::default();
    for (i, reading) in readings.iter().enumerate() {
        if i > 0 {
            writer.write_char('\n').map_err(|_| EncodeFault::TooLong)?;
        }
        write_line(&mut writer, reading).map_err(|_| EncodeFault::TooLong)?;
    }
    Ok(writer.buf)
}

/// Parses a record produced by [`encode`].
///
/// Anything that `encode` could not have written is rejected as a whole;
/// there is no partial result.
pub fn decode(bytes: &[u8]) -> Result<Readings, DecodeFault> {
    let mut readings = Readings::new();
    if bytes.is_empty() {
        return Ok(readings);
    }
    let text = core::str::from_utf8(bytes).map_err(|_| DecodeFault::Malformed)?;
    for line in text.split('\n') {
        let reading = parse_line(line).ok_or(DecodeFault::Malformed)?;
        readings.push(reading).map_err(|_| DecodeFault::Malformed)?;
    }
    Ok(readings)
}

/// Formats a single reading the same way it goes on the air.
pub fn format_line<const N: usize>(reading: &Reading) -> heapless::String<N> {
    let mut line = heapless::String::new();
    // Truncation only happens for buffers shorter than a line; the caller
    // picks N.
    let _ = write_line(&mut line, reading);
    line
}

fn write_line<W: Write>(out: &mut W, reading: &Reading) -> core::fmt::Result {
    let centi = reading.centi_celsius;
    let sign = if centi < 0 { "-" } else { "" };
    let magnitude = centi.unsigned_abs();
    write!(
        out,
        "{}{}: {}{}.{:02}{}",
        LABEL,
        u16::from(reading.index) + 1,
        sign,
        magnitude / 100,
        magnitude % 100,
        UNIT
    )
}

fn parse_line(line: &str) -> Option<Reading> {
    let rest = line.strip_prefix(LABEL)?;
    let (number, rest) = rest.split_once(": ")?;
    let value = rest.strip_suffix(UNIT)?;

    let number = parse_canonical_uint(number)?;
    let index = u8::try_from(number.checked_sub(1)?).ok()?;

    let (negative, value) = match value.strip_prefix('-') {
        Some(v) => (true, v),
        None => (false, value),
    };
    let (whole, fraction) = value.split_once('.')?;
    if fraction.len() != 2 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let whole = parse_canonical_uint(whole)?;
    let fraction: u32 = fraction.parse().ok()?;

    let magnitude = whole.checked_mul(100)?.checked_add(fraction)?;
    if negative && magnitude == 0 {
        // encode never writes "-0.00"
        return None;
    }
    let magnitude = i64::from(magnitude);
    let centi = if negative { -magnitude } else { magnitude };
    let centi = i32::try_from(centi).ok()?;
    Some(Reading::new(index, centi))
}

/// Decimal digits without sign or leading zeros.
fn parse_canonical_uint(digits: &str) -> Option<u32> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return None;
    }
    digits.parse().ok()
}

#[derive(Default)]
struct RecordWriter {
    buf: Record,
}

impl Write for RecordWriter {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        self.buf
            .extend_from_slice(s.as_bytes())
            .map_err(|_| core::fmt::Error)
    }
}
