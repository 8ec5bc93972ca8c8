//! Sound voice pooling
//!
//! One pool per sound asset keeps a voice per live particle, matched by the
//! particle's self id from one update to the next. Particles seen again keep
//! their voice; new particles take over voices left unused this update, and the
//! pool grows when none are left.
//!
//! ## Update cycle
//!
//! - `begin_insert`: reset the playing count
//! - `insert`: update the slot already bound to the particle, or queue a spawn
//! - `end_insert`: spawn queued particles into unused slots, stop the rest

use crate::audio::{AudioError, AudioSink, SoundParams, VoiceId};

/// Slots a fresh pool starts with
pub const DEFAULT_SLOT_COUNT: usize = 10;

/// One particle's sound this update
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SoundInsert {
    /// Particle self id
    pub self_id: [i32; 2],
    /// Voice parameters
    pub params: SoundParams,
}

#[derive(Debug, Clone, Default)]
struct SoundSlot {
    self_id: [i32; 2],
    voice: Option<VoiceId>,
    last_position: Option<[f32; 3]>,
    last_volume: Option<f32>,
    used_update: u64,
}

impl SoundSlot {
    fn used_this_update(&self, update_id: u64) -> bool {
        self.used_update == update_id
    }

    fn update(&mut self, sink: &mut dyn AudioSink, sound: &str, insert: &SoundInsert, update_id: u64) {
        self.used_update = update_id;
        self.apply(sink, sound, insert);
    }

    fn spawn(&mut self, sink: &mut dyn AudioSink, sound: &str, insert: &SoundInsert, update_id: u64) {
        self.used_update = update_id;
        self.self_id = insert.self_id;
        if let Some(voice) = self.voice.take() {
            sink.destroy(voice);
        }
        self.last_position = None;
        self.last_volume = None;
        self.apply(sink, sound, insert);
    }

    fn apply(&mut self, sink: &mut dyn AudioSink, sound: &str, insert: &SoundInsert) {
        let voice = match self.voice {
            Some(voice) => voice,
            None => match sink.spawn(sound, &insert.params) {
                Ok(voice) => {
                    self.voice = Some(voice);
                    self.last_position = Some(insert.params.position.into());
                    self.last_volume = Some(insert.params.volume);
                    voice
                }
                Err(err) => {
                    log::warn!("Could not spawn sound '{}': {}", sound, err);
                    return;
                }
            },
        };

        let position: [f32; 3] = insert.params.position.into();
        if self.last_position != Some(position) || self.last_volume != Some(insert.params.volume) {
            self.last_position = Some(position);
            self.last_volume = Some(insert.params.volume);
            sink.update(voice, &insert.params);
        }
        if !sink.is_playing(voice) {
            sink.play(voice);
        }
    }

    fn unuse(&mut self, sink: &mut dyn AudioSink) {
        let Some(voice) = self.voice else {
            return;
        };
        self.used_update = 0;
        self.self_id = [0, 0];
        if sink.is_playing(voice) {
            sink.stop(voice);
        }
    }

    fn clear(&mut self, sink: &mut dyn AudioSink) {
        if let Some(voice) = self.voice.take() {
            sink.destroy(voice);
        }
    }
}

/// Voices of one sound asset
#[derive(Debug)]
pub struct SoundPool {
    sound: String,
    slots: Vec<SoundSlot>,
    last_updated_slot_count: usize,
    to_spawn: Vec<SoundInsert>,
    playing: usize,
}

impl SoundPool {
    /// Pool for `sound`, which the sink must know
    pub fn new(sound: impl Into<String>, sink: &dyn AudioSink) -> Result<Self, AudioError> {
        let sound = sound.into();
        if sound.is_empty() || !sink.has_sound(&sound) {
            return Err(AudioError::SoundNotFound(sound));
        }
        Ok(Self {
            sound,
            slots: vec![SoundSlot::default(); DEFAULT_SLOT_COUNT],
            last_updated_slot_count: 0,
            to_spawn: Vec::new(),
            playing: 0,
        })
    }

    /// Sound asset
    pub fn sound(&self) -> &str {
        &self.sound
    }

    /// Slot count, grows with demand
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Voices playing after the last update
    pub const fn playing(&self) -> usize {
        self.playing
    }

    /// Start an update
    pub fn begin_insert(&mut self) {
        self.playing = 0;
    }

    /// Update the voice bound to `insert.self_id`, or queue it for spawning
    pub fn insert(&mut self, sink: &mut dyn AudioSink, update_id: u64, insert: SoundInsert) {
        if self.playing < self.slots.len() {
            let bound = self.slots[..self.last_updated_slot_count]
                .iter()
                .position(|slot| slot.self_id == insert.self_id);
            if let Some(index) = bound {
                self.playing += 1;
                self.slots[index].update(sink, &self.sound, &insert, update_id);
                return;
            }
        }
        self.to_spawn.push(insert);
    }

    /// Finish an update: spawn queued voices and stop stale ones
    pub fn end_insert(&mut self, sink: &mut dyn AudioSink, update_id: u64) {
        let mut to_spawn = std::mem::take(&mut self.to_spawn).into_iter();
        let mut last_used = None;

        let mut index = 0;
        while index < self.last_updated_slot_count {
            let slot = &mut self.slots[index];
            if slot.used_this_update(update_id) {
                last_used = Some(index);
            } else if let Some(insert) = to_spawn.next() {
                slot.spawn(sink, &self.sound, &insert, update_id);
                self.playing += 1;
                last_used = Some(index);
            } else {
                slot.unuse(sink);
            }
            index += 1;
        }

        for insert in to_spawn {
            if index >= self.slots.len() {
                self.slots.push(SoundSlot::default());
            }
            self.slots[index].spawn(sink, &self.sound, &insert, update_id);
            self.playing += 1;
            last_used = Some(index);
            index += 1;
        }

        self.last_updated_slot_count = last_used.map_or(0, |i| i + 1);
        log::trace!("Sound pool '{}': {} voices playing", self.sound, self.playing);
    }

    /// Destroy every voice
    pub fn clear(&mut self, sink: &mut dyn AudioSink) {
        for slot in &mut self.slots {
            slot.clear(sink);
        }
        self.last_updated_slot_count = 0;
        self.playing = 0;
    }
}

/// Sound pools of one sound renderer, one per declared sound
#[derive(Debug, Default)]
pub struct SoundPoolCollection {
    pools: Vec<SoundPool>,
    update_id: u64,
}

impl SoundPoolCollection {
    /// Pools for every sound; fails when a sound is unknown or none is declared
    pub fn new(sounds: &[String], sink: &dyn AudioSink) -> Result<Self, AudioError> {
        if sounds.is_empty() {
            return Err(AudioError::SoundNotFound(String::new()));
        }
        let pools = sounds
            .iter()
            .map(|sound| SoundPool::new(sound.clone(), sink))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { pools, update_id: 0 })
    }

    /// Start an update of every pool
    pub fn begin_insert(&mut self) {
        self.update_id += 1;
        for pool in &mut self.pools {
            pool.begin_insert();
        }
    }

    /// Insert into the pool of sound `sound_index`, clamped to the last pool
    pub fn insert(&mut self, sink: &mut dyn AudioSink, sound_index: usize, insert: SoundInsert) {
        let update_id = self.update_id;
        let last = self.pools.len().saturating_sub(1);
        if let Some(pool) = self.pools.get_mut(sound_index.min(last)) {
            pool.insert(sink, update_id, insert);
        }
    }

    /// Finish the update of every pool
    pub fn end_insert(&mut self, sink: &mut dyn AudioSink) {
        let update_id = self.update_id;
        for pool in &mut self.pools {
            pool.end_insert(sink, update_id);
        }
    }

    /// Destroy every voice of every pool
    pub fn clear(&mut self, sink: &mut dyn AudioSink) {
        for pool in &mut self.pools {
            pool.clear(sink);
        }
    }

    /// Pools in sound order
    pub fn pools(&self) -> &[SoundPool] {
        &self.pools
    }

    /// Voices playing across every pool
    pub fn playing(&self) -> usize {
        self.pools.iter().map(SoundPool::playing).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::RecordingAudioSink;
    use crate::foundation::math::Vec3;

    fn insert(id: i32, x: f32) -> SoundInsert {
        SoundInsert {
            self_id: [id, 0],
            params: SoundParams {
                position: Vec3::new(x, 0.0, 0.0),
                ..SoundParams::default()
            },
        }
    }

    fn run(pool: &mut SoundPoolCollection, sink: &mut RecordingAudioSink, inserts: &[SoundInsert]) {
        pool.begin_insert();
        for i in inserts {
            pool.insert(sink, 0, *i);
        }
        pool.end_insert(sink);
    }

    #[test]
    fn test_unknown_sound_fails_setup() {
        let sink = RecordingAudioSink::new(["hum"]);
        assert!(SoundPoolCollection::new(&["buzz".to_string()], &sink).is_err());
        assert!(SoundPoolCollection::new(&[], &sink).is_err());
    }

    #[test]
    fn test_same_particle_keeps_its_voice() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();
        let mut pools = SoundPoolCollection::new(&["hum".to_string()], &sink).expect("Should set up");

        run(&mut pools, &mut sink, &[insert(1, 0.0), insert(2, 0.0)]);
        assert_eq!(recording.lock().spawned, 2);
        assert_eq!(pools.playing(), 2);

        run(&mut pools, &mut sink, &[insert(1, 5.0), insert(2, 0.0)]);
        assert_eq!(recording.lock().spawned, 2);
        let moved = recording
            .lock()
            .voices
            .values()
            .filter(|voice| voice.params.position.x == 5.0)
            .count();
        assert_eq!(moved, 1);
    }

    #[test]
    fn test_dead_particle_voice_is_reused() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();
        let mut pools = SoundPoolCollection::new(&["hum".to_string()], &sink).expect("Should set up");

        run(&mut pools, &mut sink, &[insert(1, 0.0), insert(2, 0.0)]);
        run(&mut pools, &mut sink, &[insert(2, 0.0), insert(3, 0.0)]);

        // particle 3 took over particle 1's slot: old voice destroyed, new one spawned
        let recording = recording.lock();
        assert_eq!(recording.spawned, 3);
        assert_eq!(recording.destroyed, 1);
        assert_eq!(recording.playing_count(), 2);
    }

    #[test]
    fn test_stale_voices_are_stopped() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();
        let mut pools = SoundPoolCollection::new(&["hum".to_string()], &sink).expect("Should set up");

        run(&mut pools, &mut sink, &[insert(1, 0.0), insert(2, 0.0)]);
        run(&mut pools, &mut sink, &[insert(2, 0.0)]);

        assert_eq!(recording.lock().playing_count(), 1);
        assert_eq!(pools.playing(), 1);
    }

    #[test]
    fn test_pool_grows_past_default_slots() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let mut pools = SoundPoolCollection::new(&["hum".to_string()], &sink).expect("Should set up");
        let inserts: Vec<SoundInsert> = (0..25).map(|id| insert(id + 1, 0.0)).collect();

        run(&mut pools, &mut sink, &inserts);
        assert_eq!(pools.pools()[0].slot_count(), 25);
        assert_eq!(pools.playing(), 25);
    }

    #[test]
    fn test_clear_destroys_voices() {
        let mut sink = RecordingAudioSink::new(["hum"]);
        let recording = sink.recording();
        let mut pools = SoundPoolCollection::new(&["hum".to_string()], &sink).expect("Should set up");

        run(&mut pools, &mut sink, &[insert(1, 0.0)]);
        pools.clear(&mut sink);
        assert!(recording.lock().voices.is_empty());
    }
}
