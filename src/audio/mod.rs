//! Audio device access and PCM utilities.

pub mod capture;
pub mod device;
pub mod pcm;
pub mod playback;

pub use capture::{CpalInput, list_input_devices};
pub use device::{AudioInput, AudioOutputDevice, FramePhase, MockAudioInput, MockAudioOutput};
pub use playback::{CpalOutput, list_output_devices};
