//! Microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::device::AudioInput;
use crate::audio::pcm;
use crate::defaults;
use crate::error::{Result, VoiceBridgeError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::{Arc, Mutex};

/// Device name patterns that are never useful as a voice microphone.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "Digital Output",
    "HDMI",
    "S/PDIF",
];

fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

/// List available audio input device identifiers.
///
/// Identifiers are opaque device names usable as `audio.input_device`.
/// Obviously unusable devices (surround channels, HDMI, S/PDIF) are dropped.
///
/// # Errors
/// Returns `VoiceBridgeError::AudioCapture` if device enumeration fails.
pub fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| VoiceBridgeError::AudioCapture {
            message: format!("Failed to enumerate input devices: {}", e),
        })?;

    let mut device_names = Vec::new();
    for device in devices {
        if let Ok(name) = device.name()
            && !should_filter_device(&name)
        {
            device_names.push(name);
        }
    }

    Ok(device_names)
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is only accessed from a single thread at a time
/// through the Mutex wrapper in CpalInput. Stream methods are called
/// synchronously and don't cross thread boundaries unsafely.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture at 16kHz mono i16.
///
/// The device callback appends into a shared buffer under a short critical
/// section; `read_samples` drains it. Tries i16/16kHz/mono first, then
/// f32/16kHz/mono, then the device's native config with software conversion
/// (channel mixing + resampling).
pub struct CpalInput {
    device: cpal::Device,
    stream: Arc<Mutex<Option<SendableStream>>>,
    buffer: Arc<Mutex<Vec<i16>>>,
    sample_rate: u32,
}

impl CpalInput {
    /// Opens an input device by identifier, or the system default.
    ///
    /// # Errors
    /// `AudioDeviceNotFound` when the named device does not exist,
    /// `AudioCapture` when enumeration fails.
    pub fn new(device_name: Option<&str>) -> Result<Self> {
        let host = cpal::default_host();

        let device = if let Some(name) = device_name {
            let devices = host
                .input_devices()
                .map_err(|e| VoiceBridgeError::AudioCapture {
                    message: format!("Failed to enumerate devices: {}", e),
                })?;

            let mut found_device = None;
            for dev in devices {
                if let Ok(dev_name) = dev.name()
                    && dev_name == name
                {
                    found_device = Some(dev);
                    break;
                }
            }

            found_device.ok_or_else(|| VoiceBridgeError::AudioDeviceNotFound {
                device: name.to_string(),
            })?
        } else {
            host.default_input_device()
                .ok_or_else(|| VoiceBridgeError::AudioDeviceNotFound {
                    device: "default".to_string(),
                })?
        };

        Ok(Self {
            device,
            stream: Arc::new(Mutex::new(None)),
            buffer: Arc::new(Mutex::new(Vec::new())),
            sample_rate: defaults::CAPTURE_SAMPLE_RATE,
        })
    }

    fn build_stream(&self) -> Result<cpal::Stream> {
        let preferred_config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(self.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let err_callback = |err| {
            tracing::warn!(error = %err, "input stream error");
        };

        // i16/16kHz/mono - PipeWire/PulseAudio convert transparently
        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend_from_slice(data);
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        // f32/16kHz/mono - devices that only expose float formats
        let buffer = Arc::clone(&self.buffer);
        if let Ok(stream) = self.device.build_input_stream(
            &preferred_config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                if let Ok(mut buf) = buffer.lock() {
                    buf.extend(
                        data.iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16),
                    );
                }
            },
            err_callback,
            None,
        ) {
            return Ok(stream);
        }

        // Last resort: native config with software conversion
        self.build_stream_native()
    }

    /// Build a stream at the device's native config, mixing to mono and
    /// resampling to 16kHz in software.
    fn build_stream_native(&self) -> Result<cpal::Stream> {
        use cpal::SampleFormat;

        let default_config =
            self.device
                .default_input_config()
                .map_err(|e| VoiceBridgeError::AudioCapture {
                    message: format!("Failed to query default input config: {}", e),
                })?;

        let native_rate = default_config.sample_rate().0;
        let native_channels = default_config.channels() as usize;
        let target_rate = self.sample_rate;
        let stream_config: cpal::StreamConfig = default_config.clone().into();

        tracing::info!(
            channels = native_channels,
            rate = native_rate,
            format = ?default_config.sample_format(),
            "using native input format, converting in software"
        );

        let err_callback = |err| {
            tracing::warn!(error = %err, "input stream error");
        };

        let buffer = Arc::clone(&self.buffer);

        match default_config.sample_format() {
            SampleFormat::I16 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        let converted =
                            mix_to_mono(data, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| VoiceBridgeError::AudioCapture {
                    message: format!("Failed to build native i16 stream: {}", e),
                }),
            SampleFormat::F32 => self
                .device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let i16_data: Vec<i16> = data
                            .iter()
                            .map(|&s| (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16)
                            .collect();
                        let converted =
                            mix_to_mono(&i16_data, native_channels, native_rate, target_rate);
                        if let Ok(mut buf) = buffer.lock() {
                            buf.extend_from_slice(&converted);
                        }
                    },
                    err_callback,
                    None,
                )
                .map_err(|e| VoiceBridgeError::AudioCapture {
                    message: format!("Failed to build native f32 stream: {}", e),
                }),
            fmt => Err(VoiceBridgeError::AudioCapture {
                message: format!("Unsupported native sample format: {:?}", fmt),
            }),
        }
    }
}

/// Mix multi-channel audio to mono and resample to the target rate.
fn mix_to_mono(samples: &[i16], channels: usize, source_rate: u32, target_rate: u32) -> Vec<i16> {
    let mono: Vec<i16> = if channels == 1 {
        samples.to_vec()
    } else {
        samples
            .chunks_exact(channels)
            .map(|frame| {
                let sum: i32 = frame.iter().map(|&s| s as i32).sum();
                (sum / channels as i32) as i16
            })
            .collect()
    };

    if source_rate == target_rate {
        mono
    } else {
        pcm::resample(&mono, source_rate, target_rate)
    }
}

impl AudioInput for CpalInput {
    fn start(&mut self) -> Result<()> {
        {
            let stream_guard = self.stream.lock().map_err(|e| VoiceBridgeError::AudioCapture {
                message: format!("Failed to lock stream: {}", e),
            })?;
            if stream_guard.is_some() {
                return Ok(()); // Already started
            }
        }

        let stream = self.build_stream()?;
        stream.play().map_err(|e| VoiceBridgeError::AudioCapture {
            message: format!("Failed to start audio stream: {}", e),
        })?;

        let mut stream_guard = self.stream.lock().map_err(|e| VoiceBridgeError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;
        *stream_guard = Some(SendableStream(stream));
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut stream_guard = self.stream.lock().map_err(|e| VoiceBridgeError::AudioCapture {
            message: format!("Failed to lock stream: {}", e),
        })?;

        if let Some(sendable_stream) = stream_guard.take() {
            sendable_stream
                .0
                .pause()
                .map_err(|e| VoiceBridgeError::AudioPlayback {
                    message: format!("Failed to stop audio stream: {}", e),
                })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<i16>> {
        let mut buffer = self.buffer.lock().map_err(|e| VoiceBridgeError::AudioCapture {
            message: format!("Failed to lock audio buffer: {}", e),
        })?;

        Ok(std::mem::take(&mut *buffer))
    }
}
