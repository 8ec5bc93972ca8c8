//! Audio output for sound particles
//!
//! The sound drawer never plays audio itself. It drives voices through an
//! [`AudioSink`] owned by the host, keeping one voice per live sound particle
//! in a [`SoundPool`].

pub mod sound_pool;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::foundation::math::Vec3;

pub use sound_pool::{SoundInsert, SoundPool, SoundPoolCollection, DEFAULT_SLOT_COUNT};

/// Audio errors
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    /// The sound asset does not exist
    #[error("Sound '{0}' not found")]
    SoundNotFound(String),

    /// No audio device is available
    #[error("Audio device unavailable")]
    DeviceUnavailable,
}

/// Handle to a voice owned by an [`AudioSink`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VoiceId(pub u64);

/// Spatial parameters of one voice
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundParams {
    /// World position
    pub position: Vec3,
    /// World velocity
    pub velocity: Vec3,
    /// Volume multiplier
    pub volume: f32,
    /// Audible radius
    pub radius: f32,
    /// Doppler factor
    pub doppler_factor: f32,
    /// Seconds since the particle spawned
    pub age: f32,
}

impl Default for SoundParams {
    fn default() -> Self {
        Self {
            position: Vec3::zeros(),
            velocity: Vec3::zeros(),
            volume: 1.0,
            radius: 1.0,
            doppler_factor: 0.0,
            age: 0.0,
        }
    }
}

/// Audio service the sound drawer spawns voices through
///
/// Only the update thread touches the sink.
pub trait AudioSink: Send {
    /// Whether audio is enabled for the current world
    fn is_enabled(&self) -> bool;

    /// Whether the sound asset can be loaded
    fn has_sound(&self, sound: &str) -> bool;

    /// Create a playing voice
    fn spawn(&mut self, sound: &str, params: &SoundParams) -> Result<VoiceId, AudioError>;

    /// Move a voice and change its volume
    fn update(&mut self, voice: VoiceId, params: &SoundParams);

    /// Whether a voice is audible right now
    fn is_playing(&self, voice: VoiceId) -> bool;

    /// Restart a stopped voice
    fn play(&mut self, voice: VoiceId);

    /// Stop a voice but keep it alive
    fn stop(&mut self, voice: VoiceId);

    /// Destroy a voice
    fn destroy(&mut self, voice: VoiceId);
}

/// State of one recorded voice
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedVoice {
    /// Sound asset
    pub sound: String,
    /// Latest parameters
    pub params: SoundParams,
    /// Playing or stopped
    pub playing: bool,
}

/// What a [`RecordingAudioSink`] saw
#[derive(Debug, Default)]
pub struct AudioRecording {
    /// Live voices
    pub voices: HashMap<VoiceId, RecordedVoice>,
    /// Voices spawned so far
    pub spawned: u64,
    /// Voices destroyed so far
    pub destroyed: u64,
}

impl AudioRecording {
    /// Voices currently playing
    pub fn playing_count(&self) -> usize {
        self.voices.values().filter(|voice| voice.playing).count()
    }
}

/// Audio sink that records voices instead of playing them
#[derive(Debug)]
pub struct RecordingAudioSink {
    enabled: bool,
    sounds: Vec<String>,
    next_voice: u64,
    recording: Arc<Mutex<AudioRecording>>,
}

impl RecordingAudioSink {
    /// Enabled sink knowing the given sound assets
    pub fn new<I, S>(sounds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            enabled: true,
            sounds: sounds.into_iter().map(Into::into).collect(),
            next_voice: 0,
            recording: Arc::new(Mutex::new(AudioRecording::default())),
        }
    }

    /// Enable or disable audio
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Shared view of the recording
    pub fn recording(&self) -> Arc<Mutex<AudioRecording>> {
        Arc::clone(&self.recording)
    }
}

impl AudioSink for RecordingAudioSink {
    fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn has_sound(&self, sound: &str) -> bool {
        self.sounds.iter().any(|s| s == sound)
    }

    fn spawn(&mut self, sound: &str, params: &SoundParams) -> Result<VoiceId, AudioError> {
        if !self.has_sound(sound) {
            return Err(AudioError::SoundNotFound(sound.to_string()));
        }
        let voice = VoiceId(self.next_voice);
        self.next_voice += 1;
        let mut recording = self.recording.lock();
        recording.voices.insert(
            voice,
            RecordedVoice {
                sound: sound.to_string(),
                params: *params,
                playing: true,
            },
        );
        recording.spawned += 1;
        Ok(voice)
    }

    fn update(&mut self, voice: VoiceId, params: &SoundParams) {
        if let Some(recorded) = self.recording.lock().voices.get_mut(&voice) {
            recorded.params = *params;
        }
    }

    fn is_playing(&self, voice: VoiceId) -> bool {
        self.recording
            .lock()
            .voices
            .get(&voice)
            .is_some_and(|recorded| recorded.playing)
    }

    fn play(&mut self, voice: VoiceId) {
        if let Some(recorded) = self.recording.lock().voices.get_mut(&voice) {
            recorded.playing = true;
        }
    }

    fn stop(&mut self, voice: VoiceId) {
        if let Some(recorded) = self.recording.lock().voices.get_mut(&voice) {
            recorded.playing = false;
        }
    }

    fn destroy(&mut self, voice: VoiceId) {
        let mut recording = self.recording.lock();
        if recording.voices.remove(&voice).is_some() {
            recording.destroyed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_lifecycle() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();

        assert!(sink.spawn("missing", &SoundParams::default()).is_err());
        let voice = sink.spawn("hum", &SoundParams::default()).expect("Should spawn");
        assert!(sink.is_playing(voice));

        sink.stop(voice);
        assert!(!sink.is_playing(voice));
        assert_eq!(recording.lock().playing_count(), 0);

        sink.destroy(voice);
        assert_eq!(recording.lock().destroyed, 1);
        assert!(recording.lock().voices.is_empty());
    }
}
