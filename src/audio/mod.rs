//! audio - capture, playback scheduling, and the PCM transport codec
//!
//! Uses ALSA for audio I/O on dedicated OS threads. The wire format is
//! 16-bit PCM in base64 text: 16 kHz mono up to the model, 24 kHz mono back.

mod alsa_device;
pub mod capture;
pub mod codec;
pub mod playback;
pub mod resample;

pub use capture::{CaptureError, CapturePipeline, FRAME_SAMPLES, INPUT_SAMPLE_RATE};
pub use codec::{AudioBuffer, CodecError, EncodedChunk};
pub use playback::{OutputClock, PlaybackPipeline, PlaybackScheduler, OUTPUT_SAMPLE_RATE};
