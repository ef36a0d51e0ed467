//! # Capability Tables
//!
//! Static description of what the device can stream: each
//! [`VideoFormat`] carries its frames, each [`VideoFrame`] its sizing and
//! the frame intervals it supports. Negotiation and capture sizing both
//! read from these tables; nothing writes them after build time.

// =============================================================================
// Format GUIDs
// =============================================================================

/// Video format GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatGuid(pub [u8; 16]);

impl FormatGuid {
    /// YUY2 (YUYV 4:2:2).
    pub const YUY2: Self = Self([
        0x59, 0x55, 0x59, 0x32, 0x00, 0x00, 0x10, 0x00,
        0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
    ]);

    /// Motion JPEG.
    pub const MJPEG: Self = Self([
        0x4D, 0x4A, 0x50, 0x47, 0x00, 0x00, 0x10, 0x00,
        0x80, 0x00, 0x00, 0xAA, 0x00, 0x38, 0x9B, 0x71,
    ]);
}

/// Payload encoding of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Uncompressed pixels, streamed one scan line at a time
    Uncompressed,
    /// Motion JPEG, streamed in fixed-size chunks
    Mjpeg,
}

// =============================================================================
// Frames and Formats
// =============================================================================

/// One resolution of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFrame {
    /// 1-based frame index
    pub index: u8,
    /// Width in pixels
    pub width: u16,
    /// Height in pixels
    pub height: u16,
    /// Bytes the sensor delivers per capture wakeup (one line, or one
    /// compressed chunk)
    pub line_length: u32,
    /// Largest frame the sensor can produce at this size
    pub max_video_frame_size: u32,
    /// Default frame interval (100ns units)
    pub default_interval: u32,
    /// Supported frame intervals (100ns units)
    pub intervals: &'static [u32],
}

impl VideoFrame {
    pub fn supports_interval(&self, interval: u32) -> bool {
        self.intervals.contains(&interval)
    }

    /// Frames per second at the default interval.
    pub fn default_fps(&self) -> u32 {
        if self.default_interval == 0 {
            0
        } else {
            10_000_000 / self.default_interval
        }
    }
}

/// One payload format with its frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFormat {
    /// 1-based format index
    pub index: u8,
    pub encoding: Encoding,
    pub guid: FormatGuid,
    /// Bits per pixel (0 for compressed formats)
    pub bits_per_pixel: u8,
    /// 1-based index of the frame offered by default
    pub default_frame_index: u8,
    pub frames: &'static [VideoFrame],
}

impl VideoFormat {
    /// Looks up a frame by its 1-based index.
    pub fn frame(&self, index: u8) -> Option<&'static VideoFrame> {
        let frames: &'static [VideoFrame] = self.frames;
        frames.iter().find(|f| f.index == index)
    }

    /// Lowest-indexed frame.
    pub fn first_frame(&self) -> Option<&'static VideoFrame> {
        let frames: &'static [VideoFrame] = self.frames;
        frames.iter().min_by_key(|f| f.index)
    }
}

/// Read-only set of formats compiled into the device.
#[derive(Debug, Clone, Copy)]
pub struct FormatTable {
    formats: &'static [VideoFormat],
}

impl FormatTable {
    pub const fn new(formats: &'static [VideoFormat]) -> Self {
        Self { formats }
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    pub fn formats(&self) -> &'static [VideoFormat] {
        self.formats
    }

    /// Looks up a format by its 1-based index.
    pub fn format(&self, index: u8) -> Option<&'static VideoFormat> {
        let formats: &'static [VideoFormat] = self.formats;
        formats.iter().find(|f| f.index == index)
    }

    /// Looks up a (format, frame) pair.
    pub fn lookup(&self, format: u8, frame: u8) -> Option<(&'static VideoFormat, &'static VideoFrame)> {
        let fmt = self.format(format)?;
        let frm = fmt.frame(frame)?;
        Some((fmt, frm))
    }

    /// Lowest-indexed format.
    pub fn first_format(&self) -> Option<&'static VideoFormat> {
        let formats: &'static [VideoFormat] = self.formats;
        formats.iter().min_by_key(|f| f.index)
    }
}

impl Default for FormatTable {
    fn default() -> Self {
        DEFAULT_FORMATS
    }
}

// =============================================================================
// Default Table (OV5640-class sensor)
// =============================================================================

/// 15 fps
pub const INTERVAL_15FPS: u32 = 666_666;
/// 7.5 fps
pub const INTERVAL_7_5FPS: u32 = 1_333_333;

/// Sensor's preferred compressed chunk length.
pub const MJPEG_CHUNK_LENGTH: u32 = 960;

const YUY2_FRAMES: &[VideoFrame] = &[
    VideoFrame {
        index: 1,
        width: 320,
        height: 240,
        line_length: 320 * 2,
        max_video_frame_size: 320 * 240 * 2,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
    VideoFrame {
        index: 2,
        width: 640,
        height: 480,
        line_length: 640 * 2,
        max_video_frame_size: 640 * 480 * 2,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
    VideoFrame {
        index: 3,
        width: 800,
        height: 600,
        line_length: 800 * 2,
        max_video_frame_size: 800 * 600 * 2,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
];

const MJPEG_FRAMES: &[VideoFrame] = &[
    VideoFrame {
        index: 1,
        width: 320,
        height: 240,
        line_length: MJPEG_CHUNK_LENGTH,
        max_video_frame_size: MJPEG_CHUNK_LENGTH * 7,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
    VideoFrame {
        index: 2,
        width: 640,
        height: 480,
        line_length: MJPEG_CHUNK_LENGTH,
        max_video_frame_size: MJPEG_CHUNK_LENGTH * 17,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
    VideoFrame {
        index: 3,
        width: 800,
        height: 600,
        line_length: MJPEG_CHUNK_LENGTH,
        max_video_frame_size: MJPEG_CHUNK_LENGTH * 26,
        default_interval: INTERVAL_15FPS,
        intervals: &[INTERVAL_15FPS],
    },
    VideoFrame {
        index: 4,
        width: 1024,
        height: 768,
        line_length: MJPEG_CHUNK_LENGTH,
        max_video_frame_size: MJPEG_CHUNK_LENGTH * 35,
        default_interval: INTERVAL_7_5FPS,
        intervals: &[INTERVAL_7_5FPS],
    },
    VideoFrame {
        index: 5,
        width: 1280,
        height: 1024,
        line_length: MJPEG_CHUNK_LENGTH,
        max_video_frame_size: MJPEG_CHUNK_LENGTH * 69,
        default_interval: INTERVAL_7_5FPS,
        intervals: &[INTERVAL_7_5FPS],
    },
];

const FORMATS: &[VideoFormat] = &[
    VideoFormat {
        index: 1,
        encoding: Encoding::Uncompressed,
        guid: FormatGuid::YUY2,
        bits_per_pixel: 16,
        default_frame_index: 1,
        frames: YUY2_FRAMES,
    },
    VideoFormat {
        index: 2,
        encoding: Encoding::Mjpeg,
        guid: FormatGuid::MJPEG,
        bits_per_pixel: 0,
        default_frame_index: 1,
        frames: MJPEG_FRAMES,
    },
];

/// YUY2 QVGA/VGA/SVGA at 15 fps plus MJPEG up to SXGA.
pub const DEFAULT_FORMATS: FormatTable = FormatTable::new(FORMATS);
