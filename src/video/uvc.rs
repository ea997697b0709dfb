//! UVC H.264 extension unit: control queries and encoder probe/commit.
//!
//! Control payload sizes are selector specific, so every query first asks
//! the unit for the payload length (GET_LEN) and only then issues the real
//! request with a buffer of exactly that size.

use std::fmt;

use tracing::{debug, info};

use super::device::CaptureDevice;
use crate::config::EncoderConfig;
use crate::error::{AppError, Result};

/// Extension unit id used by common UVC 1.5 H.264 cameras
pub const DEFAULT_UNIT_ID: u8 = 12;

/// UVC H.264 extension-unit control selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum XuSelector {
    VideoConfigProbe = 0x01,
    VideoConfigCommit = 0x02,
    RateControlMode = 0x03,
    TemporalScaleMode = 0x04,
    SpatialScaleMode = 0x05,
    SnrScaleMode = 0x06,
    LtrBufferSizeControl = 0x07,
    LtrPictureControl = 0x08,
    PictureTypeControl = 0x09,
    Version = 0x0A,
    EncoderReset = 0x0B,
    FramerateConfig = 0x0C,
    VideoAdvanceConfig = 0x0D,
    BitrateLayers = 0x0E,
    QpStepsLayers = 0x0F,
}

/// UVC class-specific request codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum XuQuery {
    SetCur = 0x01,
    GetCur = 0x81,
    GetMin = 0x82,
    GetMax = 0x83,
    GetRes = 0x84,
    GetLen = 0x85,
    GetInfo = 0x86,
    GetDef = 0x87,
}

impl XuQuery {
    pub fn name(self) -> &'static str {
        match self {
            XuQuery::SetCur => "SET_CUR",
            XuQuery::GetCur => "GET_CUR",
            XuQuery::GetMin => "GET_MIN",
            XuQuery::GetMax => "GET_MAX",
            XuQuery::GetRes => "GET_RES",
            XuQuery::GetLen => "GET_LEN",
            XuQuery::GetInfo => "GET_INFO",
            XuQuery::GetDef => "GET_DEF",
        }
    }
}

impl fmt::Display for XuQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// `uvcx_video_config_probe_commit_t`
///
/// Serialized field by field in declaration order, native byte order,
/// without padding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeCommit {
    /// Frame interval in 100ns units
    pub frame_interval: u32,
    pub bit_rate: u32,
    pub hints: u16,
    pub configuration_index: u16,
    pub width: u16,
    pub height: u16,
    pub slice_units: u16,
    pub slice_mode: u16,
    pub profile: u16,
    /// I-frame period in milliseconds
    pub iframe_period: u16,
    pub estimated_video_delay: u16,
    pub estimated_max_config_delay: u16,
    pub usage_type: u8,
    pub rate_control_mode: u8,
    pub temporal_scale_mode: u8,
    pub spatial_scale_mode: u8,
    pub snr_scale_mode: u8,
    pub stream_mux_option: u8,
    pub stream_format: u8,
    pub entropy_cabac: u8,
    pub timestamp: u8,
    pub num_of_reorder_frames: u8,
    pub preview_flipped: u8,
    pub view: u8,
    pub reserved1: u8,
    pub reserved2: u8,
    pub stream_id: u8,
    pub spatial_layer_ratio: u8,
    pub leaky_bucket_size: u16,
}

impl ProbeCommit {
    pub const SIZE: usize = 46;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut w = Writer::new(&mut out);
        w.u32(self.frame_interval);
        w.u32(self.bit_rate);
        w.u16(self.hints);
        w.u16(self.configuration_index);
        w.u16(self.width);
        w.u16(self.height);
        w.u16(self.slice_units);
        w.u16(self.slice_mode);
        w.u16(self.profile);
        w.u16(self.iframe_period);
        w.u16(self.estimated_video_delay);
        w.u16(self.estimated_max_config_delay);
        for b in [
            self.usage_type,
            self.rate_control_mode,
            self.temporal_scale_mode,
            self.spatial_scale_mode,
            self.snr_scale_mode,
            self.stream_mux_option,
            self.stream_format,
            self.entropy_cabac,
            self.timestamp,
            self.num_of_reorder_frames,
            self.preview_flipped,
            self.view,
            self.reserved1,
            self.reserved2,
            self.stream_id,
            self.spatial_layer_ratio,
        ] {
            w.u8(b);
        }
        w.u16(self.leaky_bucket_size);
        debug_assert_eq!(w.pos, Self::SIZE);
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut r = Reader::new(bytes);
        Self {
            frame_interval: r.u32(),
            bit_rate: r.u32(),
            hints: r.u16(),
            configuration_index: r.u16(),
            width: r.u16(),
            height: r.u16(),
            slice_units: r.u16(),
            slice_mode: r.u16(),
            profile: r.u16(),
            iframe_period: r.u16(),
            estimated_video_delay: r.u16(),
            estimated_max_config_delay: r.u16(),
            usage_type: r.u8(),
            rate_control_mode: r.u8(),
            temporal_scale_mode: r.u8(),
            spatial_scale_mode: r.u8(),
            snr_scale_mode: r.u8(),
            stream_mux_option: r.u8(),
            stream_format: r.u8(),
            entropy_cabac: r.u8(),
            timestamp: r.u8(),
            num_of_reorder_frames: r.u8(),
            preview_flipped: r.u8(),
            view: r.u8(),
            reserved1: r.u8(),
            reserved2: r.u8(),
            stream_id: r.u8(),
            spatial_layer_ratio: r.u8(),
            leaky_bucket_size: r.u16(),
        }
    }

    /// Spatial layer ratio, stored as 4.4 fixed point
    pub fn spatial_layer_ratio(&self) -> f32 {
        let ratio = self.spatial_layer_ratio;
        ((ratio & 0xF0) >> 4) as f32 + (ratio & 0x0F) as f32 / 16.0
    }

    /// Overlay the configured encoder overrides
    pub fn apply(&mut self, config: &EncoderConfig) {
        if let Some(v) = config.iframe_period {
            self.iframe_period = v;
        }
        if let Some(v) = config.bitrate {
            self.bit_rate = v;
        }
        if let Some(v) = config.frame_interval {
            self.frame_interval = v;
        }
        if let Some(v) = config.profile {
            self.profile = v;
        }
        if let Some(v) = config.rate_control_mode {
            self.rate_control_mode = v;
        }
        if let Some(v) = config.width {
            self.width = v;
        }
        if let Some(v) = config.height {
            self.height = v;
        }
    }
}

struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn u8(&mut self, v: u8) {
        self.put(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.put(&v.to_ne_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.put(&v.to_ne_bytes());
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.take())
    }
}

/// Extension-unit client bound to one device and unit id
pub struct EncoderConfigurator<'a, D: CaptureDevice> {
    device: &'a D,
    unit: u8,
}

impl<'a, D: CaptureDevice> EncoderConfigurator<'a, D> {
    pub fn new(device: &'a D, unit: u8) -> Self {
        Self { device, unit }
    }

    fn raw(&self, selector: XuSelector, query: XuQuery, data: &mut [u8]) -> Result<()> {
        self.device
            .control_query(self.unit, selector as u8, query as u8, data)
            .map_err(|e| AppError::ControlQueryFailed {
                selector: selector as u8,
                query: query.name(),
                source: e,
            })
    }

    /// Payload length of a selector (GET_LEN)
    pub fn control_length(&self, selector: XuSelector) -> Result<u16> {
        let mut len = [0u8; 2];
        self.raw(selector, XuQuery::GetLen, &mut len)?;
        Ok(u16::from_ne_bytes(len))
    }

    /// Two-phase query: GET_LEN, then `query` with a buffer of that length
    ///
    /// For `GetLen` the length is returned without a second request. A
    /// buffer whose size differs from the reported length is rejected before
    /// the second request is issued.
    pub fn query(&self, selector: XuSelector, query: XuQuery, data: &mut [u8]) -> Result<u16> {
        let len = self.control_length(selector)?;
        if query == XuQuery::GetLen {
            return Ok(len);
        }
        if data.len() != len as usize {
            return Err(AppError::InvalidControlLength {
                selector: selector as u8,
                expected: len,
                actual: data.len(),
            });
        }
        self.raw(selector, query, data)?;
        Ok(len)
    }

    fn get_record(&self, selector: XuSelector) -> Result<ProbeCommit> {
        let mut bytes = [0u8; ProbeCommit::SIZE];
        self.query(selector, XuQuery::GetCur, &mut bytes)?;
        Ok(ProbeCommit::from_bytes(&bytes))
    }

    fn set_record(&self, selector: XuSelector, record: &ProbeCommit) -> Result<()> {
        let mut bytes = record.to_bytes();
        self.query(selector, XuQuery::SetCur, &mut bytes)?;
        Ok(())
    }

    /// Current probe record
    pub fn read_probe(&self) -> Result<ProbeCommit> {
        self.get_record(XuSelector::VideoConfigProbe)
    }

    /// Probe/commit negotiation
    ///
    /// Reads the current probe, lets `modify` adjust it, proposes it, reads
    /// back what the device accepted and commits that. Returns the committed
    /// record.
    pub fn negotiate<F>(&self, modify: F) -> Result<ProbeCommit>
    where
        F: FnOnce(&mut ProbeCommit),
    {
        let fail = |step: &'static str| {
            move |e: AppError| AppError::EncoderNegotiationFailed {
                step,
                source: Box::new(e),
            }
        };

        let mut probe = self
            .get_record(XuSelector::VideoConfigProbe)
            .map_err(fail("probe GET_CUR"))?;
        debug!("Encoder probe (current): {:?}", probe);

        modify(&mut probe);
        self.set_record(XuSelector::VideoConfigProbe, &probe)
            .map_err(fail("probe SET_CUR"))?;

        let accepted = self
            .get_record(XuSelector::VideoConfigProbe)
            .map_err(fail("probe readback"))?;
        debug!("Encoder probe (accepted): {:?}", accepted);

        self.set_record(XuSelector::VideoConfigCommit, &accepted)
            .map_err(fail("commit SET_CUR"))?;

        info!(
            "Encoder committed: {}x{} bitrate={} iframe_period={}ms profile={:#x}",
            accepted.width,
            accepted.height,
            accepted.bit_rate,
            accepted.iframe_period,
            accepted.profile
        );
        Ok(accepted)
    }

    /// Negotiate using the overrides from configuration
    pub fn configure(&self, config: &EncoderConfig) -> Result<ProbeCommit> {
        self.negotiate(|probe| probe.apply(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::testing::FakeDevice;

    fn sample() -> ProbeCommit {
        ProbeCommit {
            frame_interval: 333_333,
            bit_rate: 4_000_000,
            width: 1920,
            height: 1080,
            profile: 0x6400,
            iframe_period: 1000,
            spatial_layer_ratio: 0x18,
            leaky_bucket_size: 1000,
            ..Default::default()
        }
    }

    #[test]
    fn test_layout_offsets() {
        let bytes = sample().to_bytes();
        assert_eq!(bytes.len(), 46);
        assert_eq!(&bytes[0..4], &333_333u32.to_ne_bytes());
        assert_eq!(&bytes[12..14], &1920u16.to_ne_bytes());
        assert_eq!(&bytes[22..24], &1000u16.to_ne_bytes());
        assert_eq!(bytes[43], 0x18);
        assert_eq!(&bytes[44..46], &1000u16.to_ne_bytes());
    }

    #[test]
    fn test_spatial_layer_ratio() {
        assert_eq!(sample().spatial_layer_ratio(), 1.5);
    }

    #[test]
    fn test_get_len_only() {
        let fake = FakeDevice::new();
        fake.install_probe_commit(sample());
        let xu = EncoderConfigurator::new(&fake, DEFAULT_UNIT_ID);
        let mut unused = [0u8; 0];
        let len = xu
            .query(XuSelector::VideoConfigProbe, XuQuery::GetLen, &mut unused)
            .unwrap();
        assert_eq!(len, 46);
        assert_eq!(fake.state().control_calls.len(), 1);
    }

    #[test]
    fn test_mismatched_length_rejected() {
        let fake = FakeDevice::new();
        fake.install_probe_commit(sample());
        let xu = EncoderConfigurator::new(&fake, DEFAULT_UNIT_ID);

        let len = xu.control_length(XuSelector::VideoConfigProbe).unwrap();
        let mut short = vec![0u8; len as usize - 2];
        let err = xu
            .query(XuSelector::VideoConfigProbe, XuQuery::GetCur, &mut short)
            .unwrap_err();
        assert!(matches!(
            err,
            AppError::InvalidControlLength {
                selector: 0x01,
                expected: 46,
                actual: 44
            }
        ));
        // Only the two GET_LEN requests reached the device
        let calls = fake.state().control_calls.clone();
        assert!(calls.iter().all(|c| c.query == XuQuery::GetLen as u8));
    }

    #[test]
    fn test_probe_commit_sequence() {
        let fake = FakeDevice::new();
        fake.install_probe_commit(sample());
        // Device clamps the I-frame period to 1500ms
        fake.state().clamp_iframe_period = Some(1500);

        let xu = EncoderConfigurator::new(&fake, DEFAULT_UNIT_ID);
        let committed = xu.negotiate(|p| p.iframe_period = 2000).unwrap();
        assert_eq!(committed.iframe_period, 1500);

        let state = fake.state();
        let sequence: Vec<(u8, u8)> = state
            .control_calls
            .iter()
            .filter(|c| c.query != XuQuery::GetLen as u8)
            .map(|c| (c.selector, c.query))
            .collect();
        assert_eq!(
            sequence,
            vec![
                (0x01, XuQuery::GetCur as u8),
                (0x01, XuQuery::SetCur as u8),
                (0x01, XuQuery::GetCur as u8),
                (0x02, XuQuery::SetCur as u8),
            ]
        );
        let committed_bytes = state.controls.get(&0x02).unwrap();
        assert_eq!(
            ProbeCommit::from_bytes(committed_bytes[..].try_into().unwrap()).iframe_period,
            1500
        );
    }

    #[test]
    fn test_negotiation_failure_wraps_step() {
        let fake = FakeDevice::new();
        fake.install_probe_commit(sample());
        fake.state().fail_control_query = Some((0x02, XuQuery::SetCur as u8));

        let xu = EncoderConfigurator::new(&fake, DEFAULT_UNIT_ID);
        let err = xu.configure(&EncoderConfig::default()).unwrap_err();
        match err {
            AppError::EncoderNegotiationFailed { step, source } => {
                assert_eq!(step, "commit SET_CUR");
                assert!(matches!(*source, AppError::ControlQueryFailed { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_unit() {
        let fake = FakeDevice::new();
        let xu = EncoderConfigurator::new(&fake, DEFAULT_UNIT_ID);
        let err = xu.read_probe().unwrap_err();
        assert!(matches!(
            err,
            AppError::ControlQueryFailed {
                query: "GET_LEN",
                ..
            }
        ));
    }
}
