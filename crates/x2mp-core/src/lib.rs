//! X2MP Core - Playback engine
//!
//! This crate provides the playback engine of the X2MP media player:
//! the playback controller, the playlist and history navigator, the
//! equalizer bank, the waveform tap and the sound system it drives.

pub mod command;
pub mod config;
pub mod engine;
pub mod equalizer;
pub mod player;
pub mod playlist;
pub mod tags;
pub mod tap;
pub mod track;

pub use command::{ Command, CommandError };
pub use config::{ ConfigError, FadeOut, LoadFailurePolicy, PlayerConfig };
pub use engine::{ EngineError, NativeSystem, SoundSystem };
pub use equalizer::{ Equalizer, EqualizerBand, BAND_CENTERS, BAND_COUNT };
pub use player::{ PlaybackState, Player, PlayerError, PlayerEvent };
pub use playlist::{ History, Navigator, Playlist };
pub use tags::{ SymphoniaTagReader, TagError, TagReader };
pub use tap::{ TapBuffer, WaveformFrame, VIS_BARS };
pub use track::{ TagInfo, TrackEntry };
