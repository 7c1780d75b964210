//! Fixed-size PCM frames

/// One chunk of 16-bit mono PCM as read from the capture device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    samples: Vec<i16>,
}

impl AudioFrame {
    /// Wrap raw samples
    #[must_use]
    pub const fn new(samples: Vec<i16>) -> Self {
        Self { samples }
    }

    /// A frame of digital silence
    #[must_use]
    pub fn silence(len: usize) -> Self {
        Self::new(vec![0; len])
    }

    /// Build a frame from little-endian PCM16 bytes
    ///
    /// A trailing odd byte is ignored.
    #[must_use]
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        Self::new(
            bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect(),
        )
    }

    /// Build a frame from normalized `[-1.0, 1.0]` float samples
    #[must_use]
    pub fn from_f32(samples: &[f32]) -> Self {
        Self::new(samples.iter().copied().map(f32_to_i16).collect())
    }

    /// Borrow the samples
    #[must_use]
    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    /// Number of samples
    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the frame holds no samples
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Serialize as little-endian PCM16, the wire format of `CONTINUE`
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
        out
    }

    /// Root-mean-square level normalized to `[0.0, 1.0]`
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn rms(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let sum_squares: f64 = self
            .samples
            .iter()
            .map(|&s| {
                let v = f64::from(s) / 32768.0;
                v * v
            })
            .sum();

        (sum_squares / self.samples.len() as f64).sqrt() as f32
    }
}

/// Convert a normalized float sample to PCM16
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}
