//! Annex-B start code scanning for bitstream diagnostics

/// A unit boundary found in an Annex-B stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit {
    /// Offset of the first zero of the start code
    pub start: usize,
    /// Offset of the unit header byte (the byte after `0x01`)
    pub offset: usize,
    /// Low 5 bits of the header byte
    pub nal_type: u8,
}

/// Find start codes of three or more zero bytes followed by `0x01`
///
/// Three-byte start codes (`00 00 01`) are not reported; encoders that feed
/// this tool emit four-byte codes at access unit boundaries.
pub fn scan_start_codes(data: &[u8]) -> Vec<NalUnit> {
    let mut units = Vec::new();
    let mut zeros = 0usize;
    let mut got_start = false;

    for (offset, &byte) in data.iter().enumerate() {
        if got_start {
            units.push(NalUnit {
                start: offset - 1 - zeros,
                offset,
                nal_type: byte & 0x1f,
            });
            got_start = false;
            zeros = 0;
        } else if byte == 0 {
            zeros += 1;
        } else if zeros > 2 && byte == 0x01 {
            got_start = true;
        } else {
            zeros = 0;
        }
    }

    units
}

/// Short name of an H.264 NAL unit type
pub fn nal_type_name(nal_type: u8) -> &'static str {
    match nal_type {
        1 => "non-IDR slice",
        2..=4 => "slice partition",
        5 => "IDR slice",
        6 => "SEI",
        7 => "SPS",
        8 => "PPS",
        9 => "AUD",
        10 => "end of sequence",
        11 => "end of stream",
        12 => "filler",
        _ => "other",
    }
}
