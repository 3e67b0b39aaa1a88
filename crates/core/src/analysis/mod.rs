//! Analysis functions bound to pipeline nodes.
//!
//! Every node that computes an estimate does so through one of the function
//! slots in [`AnalysisSuite`]. The defaults below are intentionally simple
//! estimators; callers with better DSP can swap any slot without touching the
//! topology or runtime.

use std::{cell::RefCell, collections::BTreeMap, f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner};
use serde::{Deserialize, Serialize};

use crate::{config::BandMap, LivetapError, Result, Spectrum};

const BEAT_GAIN: f32 = 12.0;
const BEAT_THRESHOLD: f32 = 0.6;
const MIN_BEAT_INTERVAL: f32 = 0.2;
const MAX_BEAT_HISTORY: usize = 32;

/// Number of downsampled spectra multiplied by the harmonic product spectrum.
pub const HPS_HARMONICS: usize = 7;
const MIN_PITCH_HZ: f32 = 40.0;
const MAX_PITCH_HZ: f32 = 4_000.0;

const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

pub type SpectrumFn = Arc<dyn Fn(&[f32], u32) -> Result<Spectrum> + Send + Sync>;
pub type SamplePitchFn = Arc<dyn Fn(&[f32], u32) -> Result<f32> + Send + Sync>;
pub type SpectrumPitchFn = Arc<dyn Fn(&Spectrum) -> Result<f32> + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(f32) -> Result<String> + Send + Sync>;
pub type BandsFn = Arc<dyn Fn(&Spectrum, &BandMap) -> Result<BTreeMap<String, f32>> + Send + Sync>;
pub type EnvelopeFn = Arc<dyn Fn(&[f32]) -> f32 + Send + Sync>;

/// The set of analysis functions handed to the topology builder. Cloning is
/// cheap; every slot is reference counted and the functions are pure, so one
/// suite can back every channel.
#[derive(Clone)]
pub struct AnalysisSuite {
    /// Time to frequency transform used by the spectrum coordinator.
    pub spectrum: SpectrumFn,
    pub zero_crossings: SamplePitchFn,
    pub auto_correlation: SpectrumPitchFn,
    pub hps: SpectrumPitchFn,
    pub fft: SpectrumPitchFn,
    /// Maps a pitch estimate to a note label.
    pub key: KeyFn,
    pub bands: BandsFn,
    /// Amplitude envelope feeding beat detection.
    pub envelope: EnvelopeFn,
}

impl Default for AnalysisSuite {
    fn default() -> Self {
        Self {
            spectrum: Arc::new(magnitude_spectrum),
            zero_crossings: Arc::new(pitch_from_zero_crossings),
            auto_correlation: Arc::new(pitch_from_auto_correlation),
            hps: Arc::new(pitch_from_hps),
            fft: Arc::new(pitch_from_fft),
            key: Arc::new(note_from_pitch),
            bands: Arc::new(band_power),
            envelope: Arc::new(compute_rms),
        }
    }
}

impl fmt::Debug for AnalysisSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnalysisSuite").finish_non_exhaustive()
    }
}

thread_local! {
    // One planner per node thread keeps plan caches free of cross-channel locking.
    static PLANNER: RefCell<RealFftPlanner<f32>> = RefCell::new(RealFftPlanner::new());
}

/// Hann-windowed magnitude spectrum of `samples`.
pub fn magnitude_spectrum(samples: &[f32], sampling_rate: u32) -> Result<Spectrum> {
    let len = samples.len();
    if len < 2 {
        return Err(LivetapError::msg(
            "spectrum requires blocks with at least two samples",
        ));
    }

    let plan = PLANNER.with(|planner| planner.borrow_mut().plan_fft_forward(len));
    let mut input: Vec<f32> = samples
        .iter()
        .enumerate()
        .map(|(index, value)| value * hann_value(index, len))
        .collect();
    let mut output = plan.make_output_vec();
    let mut scratch = plan.make_scratch_vec();
    plan.process_with_scratch(&mut input, &mut output, &mut scratch)?;

    Ok(Spectrum {
        magnitudes: output.iter().map(|bin| bin.norm()).collect(),
        sampling_rate,
        fft_size: len,
    })
}

/// Pitch from the rate at which the signal changes sign.
pub fn pitch_from_zero_crossings(samples: &[f32], sampling_rate: u32) -> Result<f32> {
    if samples.len() < 2 || sampling_rate == 0 {
        return Err(LivetapError::msg(
            "zero-crossing estimate requires at least two samples and a sampling rate",
        ));
    }

    let crossings = samples
        .windows(2)
        .filter(|pair| (pair[0] < 0.0) != (pair[1] < 0.0))
        .count();
    let duration = samples.len() as f32 / sampling_rate as f32;
    Ok(crossings as f32 / (2.0 * duration))
}

/// Pitch from the strongest spectral peak, refined by parabolic interpolation.
pub fn pitch_from_fft(spectrum: &Spectrum) -> Result<f32> {
    let mags = &spectrum.magnitudes;
    if mags.len() < 3 {
        return Err(LivetapError::msg("spectrum too short for a pitch estimate"));
    }

    let Some(peak) = argmax(&mags[1..]).map(|index| index + 1) else {
        return Ok(0.0);
    };
    if mags[peak] <= f32::EPSILON {
        return Ok(0.0);
    }
    Ok(refine_peak(mags, peak) * spectrum.bin_hz())
}

/// Pitch from the harmonic product spectrum over [`HPS_HARMONICS`] harmonics.
pub fn pitch_from_hps(spectrum: &Spectrum) -> Result<f32> {
    let mags = &spectrum.magnitudes;
    let limit = mags.len() / HPS_HARMONICS;
    if limit < 2 {
        return Err(LivetapError::msg(format!(
            "spectrum of {} bins is too short for {HPS_HARMONICS} harmonics",
            mags.len()
        )));
    }

    let products: Vec<f64> = (1..limit)
        .map(|bin| {
            (1..=HPS_HARMONICS)
                .map(|harmonic| f64::from(mags[bin * harmonic]))
                .product()
        })
        .collect();

    match argmax_f64(&products) {
        Some(index) if products[index] > 0.0 => Ok((index + 1) as f32 * spectrum.bin_hz()),
        _ => Ok(0.0),
    }
}

/// Pitch from the autocorrelation of the block, obtained as the inverse
/// transform of its power spectrum.
pub fn pitch_from_auto_correlation(spectrum: &Spectrum) -> Result<f32> {
    let size = spectrum.fft_size;
    if size < 4 || spectrum.magnitudes.len() != size / 2 + 1 {
        return Err(LivetapError::msg(format!(
            "spectrum of {} bins does not match an fft of size {size}",
            spectrum.magnitudes.len()
        )));
    }

    let plan = PLANNER.with(|planner| planner.borrow_mut().plan_fft_inverse(size));
    let mut power: Vec<Complex32> = spectrum
        .magnitudes
        .iter()
        .map(|magnitude| Complex32::new(magnitude * magnitude, 0.0))
        .collect();
    let mut correlation = plan.make_output_vec();
    let mut scratch = plan.make_scratch_vec();
    plan.process_with_scratch(&mut power, &mut correlation, &mut scratch)?;

    let rate = spectrum.sampling_rate as f32;
    let min_lag = ((rate / MAX_PITCH_HZ) as usize).max(1);
    let max_lag = ((rate / MIN_PITCH_HZ) as usize).min(size / 2);
    if min_lag >= max_lag || correlation[0] <= f32::EPSILON {
        return Ok(0.0);
    }

    // Skip the zero-lag lobe before looking for the first period peak.
    let Some(start) = (min_lag..max_lag).find(|&lag| correlation[lag] < 0.0) else {
        return Ok(0.0);
    };
    let Some(offset) = argmax(&correlation[start..max_lag]) else {
        return Ok(0.0);
    };
    let lag = refine_peak(&correlation, start + offset);
    if lag <= 0.0 {
        return Ok(0.0);
    }
    Ok(rate / lag)
}

/// Nearest equal-tempered note for `pitch`, e.g. `A4` for 440 Hz.
pub fn note_from_pitch(pitch: f32) -> Result<String> {
    if !pitch.is_finite() || pitch <= 0.0 {
        return Err(LivetapError::msg(format!(
            "cannot derive a key from pitch {pitch}"
        )));
    }

    let midi = (12.0 * (pitch / 440.0).log2() + 69.0).round() as i32;
    let name = NOTE_NAMES[midi.rem_euclid(12) as usize];
    let octave = midi.div_euclid(12) - 1;
    Ok(format!("{name}{octave}"))
}

/// Share of the total spectral magnitude that falls inside each band, in
/// `[0, 1]`.
pub fn band_power(spectrum: &Spectrum, bands: &BandMap) -> Result<BTreeMap<String, f32>> {
    let bin_hz = spectrum.bin_hz();
    let total: f32 = spectrum.magnitudes.iter().sum();

    let powers = bands
        .iter()
        .map(|(name, [low, high])| {
            let power: f32 = spectrum
                .magnitudes
                .iter()
                .enumerate()
                .filter(|(bin, _)| {
                    let hz = *bin as f32 * bin_hz;
                    hz >= *low && hz <= *high
                })
                .map(|(_, magnitude)| magnitude)
                .sum();
            let share = if total <= f32::EPSILON {
                0.0
            } else {
                (power / total).clamp(0.0, 1.0)
            };
            (name.clone(), share)
        })
        .collect();

    Ok(powers)
}

pub fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Result of feeding one block through a [`BeatTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BeatEstimate {
    pub detected: bool,
    /// Onset strength in `[0, 1]`.
    pub intensity: f32,
    pub tempo_bpm: Option<f32>,
}

/// Envelope-driven onset detector with a running tempo estimate. Owned by a
/// single BPM coordinator, so it is never shared between channels.
#[derive(Debug, Clone)]
pub struct BeatTracker {
    sampling_rate: u32,
    processed_samples: usize,
    last_envelope: f32,
    beat_timestamps: Vec<f32>,
    tempo_bpm: Option<f32>,
}

impl BeatTracker {
    pub fn new(sampling_rate: u32) -> Self {
        Self {
            sampling_rate: sampling_rate.max(1),
            processed_samples: 0,
            last_envelope: 0.0,
            beat_timestamps: Vec::new(),
            tempo_bpm: None,
        }
    }

    pub fn tempo_bpm(&self) -> Option<f32> {
        self.tempo_bpm
    }

    /// Advances the tracker by a block of `block_len` samples whose amplitude
    /// envelope is `envelope`.
    pub fn observe(&mut self, envelope: f32, block_len: usize) -> BeatEstimate {
        let sample_rate = self.sampling_rate as f32;
        let start_time = self.processed_samples as f32 / sample_rate;
        let end_time = (self.processed_samples + block_len) as f32 / sample_rate;
        let timestamp = start_time + (end_time - start_time) * 0.5;
        self.processed_samples += block_len;

        let delta = (envelope - self.last_envelope).max(0.0);
        self.last_envelope = envelope;
        let intensity = (delta * BEAT_GAIN).clamp(0.0, 1.0);

        let detected = intensity >= BEAT_THRESHOLD
            && self
                .beat_timestamps
                .last()
                .map(|last| timestamp - last >= MIN_BEAT_INTERVAL)
                .unwrap_or(true);

        if detected {
            self.beat_timestamps.push(timestamp);
            if self.beat_timestamps.len() > MAX_BEAT_HISTORY {
                let overflow = self.beat_timestamps.len() - MAX_BEAT_HISTORY;
                self.beat_timestamps.drain(0..overflow);
            }
            self.update_tempo_estimate();
        }

        BeatEstimate {
            detected,
            intensity,
            tempo_bpm: self.tempo_bpm,
        }
    }

    fn update_tempo_estimate(&mut self) {
        if self.beat_timestamps.len() < 2 {
            return;
        }

        let mut sum = 0.0;
        let mut count = 0;
        for window in self.beat_timestamps.windows(2) {
            let interval = window[1] - window[0];
            if interval > f32::EPSILON {
                sum += interval;
                count += 1;
            }
        }

        if count > 0 {
            let average_interval = sum / count as f32;
            if average_interval > 0.0 {
                self.tempo_bpm = Some(60.0 / average_interval);
            }
        }
    }
}

fn hann_value(index: usize, len: usize) -> f32 {
    if len <= 1 {
        return 1.0;
    }

    0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos()
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
}

fn argmax_f64(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(index, _)| index)
}

/// Fractional position of the peak at `index` from a parabola through its
/// neighbours.
fn refine_peak(values: &[f32], index: usize) -> f32 {
    if index == 0 || index + 1 >= values.len() {
        return index as f32;
    }
    let (left, centre, right) = (values[index - 1], values[index], values[index + 1]);
    let denominator = left - 2.0 * centre + right;
    if denominator.abs() <= f32::EPSILON {
        return index as f32;
    }
    index as f32 + 0.5 * (left - right) / denominator
}
