//! Sound system abstraction
//!
//! The player talks to audio hardware through these traits, modelled on a
//! streaming engine: streams open in the background and report readiness,
//! channels play an opened stream, and filters form an ordered chain on a
//! channel. `NativeSystem` is the bundled implementation.

mod decoder;
mod filter;
mod native;
mod output;

use std::path::Path;

use thiserror::Error;

pub use filter::ParamEqFilter;
pub use native::NativeSystem;


/// Failure reported by the sound system.
///
/// Carries the engine's own description; the player surfaces it unchanged.
#[derive( Debug, Clone, Error, PartialEq, Eq )]
pub enum EngineError {
    #[error( "Failed to open stream: {0}" )]
    Open( String ),

    #[error( "Stream is not ready" )]
    NotReady,

    #[error( "Invalid handle: {0}" )]
    InvalidHandle( &'static str ),

    #[error( "Audio output error: {0}" )]
    Output( String ),

    #[error( "Filter error: {0}" )]
    Filter( String ),

    #[error( "{0}" )]
    Other( String ),
}


/// Progress of a non-blocking open.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum OpenState {
    Loading,
    Ready,
    Error,
}


/// Snapshot returned by [`Stream::open_state`].
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct OpenStatus {
    pub state: OpenState,
    pub buffered_percent: u32,
    pub starving: bool,
    pub disk_busy: bool,
}


impl OpenStatus {
    pub fn loading() -> Self {
        Self { state: OpenState::Loading, buffered_percent: 0, starving: false, disk_busy: true }
    }


    pub fn ready() -> Self {
        Self { state: OpenState::Ready, buffered_percent: 100, starving: false, disk_busy: false }
    }


    pub fn error() -> Self {
        Self { state: OpenState::Error, buffered_percent: 0, starving: false, disk_busy: false }
    }
}


/// Block processor run on the audio thread.
///
/// `input` and `output` have the same length and hold interleaved samples.
pub trait DspProcessor: Send {
    fn process( &mut self, input: &[f32], output: &mut [f32], channels: usize );

    /// Called with the device rate when attached to a channel.
    fn set_sample_rate( &mut self, _sample_rate: u32 ) {}
}


/// What [`SoundSystem::create_filter`] should build.
pub enum FilterKind {
    /// Peaking filter. `gain` is linear, `bandwidth` in octaves.
    ParamEq { center: f32, bandwidth: f32, gain: f32 },
    /// Caller supplied DSP.
    Custom( Box<dyn DspProcessor> ),
}


impl std::fmt::Debug for FilterKind {
    fn fmt( &self, f: &mut std::fmt::Formatter<'_> ) -> std::fmt::Result {
        match self {
            FilterKind::ParamEq { center, bandwidth, gain } => f
                .debug_struct( "ParamEq" )
                .field( "center", center )
                .field( "bandwidth", bandwidth )
                .field( "gain", gain )
                .finish(),
            FilterKind::Custom( _ ) => f.write_str( "Custom" ),
        }
    }
}


/// An opened (or opening) sound.
pub trait Stream: Send {
    fn open_state( &self ) -> Result<OpenStatus, EngineError>;

    /// Length in milliseconds. Only meaningful once ready.
    fn length_ms( &self ) -> Result<u32, EngineError>;

    fn release( &mut self ) -> Result<(), EngineError>;
}


/// A playing instance of a stream.
pub trait Channel: Send {
    type Filter: Filter;

    fn paused( &self ) -> Result<bool, EngineError>;

    fn set_paused( &mut self, paused: bool ) -> Result<(), EngineError>;

    fn position_ms( &self ) -> Result<u32, EngineError>;

    fn set_position_ms( &mut self, position: u32 ) -> Result<(), EngineError>;

    fn is_playing( &self ) -> Result<bool, EngineError>;

    fn volume( &self ) -> Result<f32, EngineError>;

    fn set_volume( &mut self, volume: f32 ) -> Result<(), EngineError>;

    /// Appends `filter` to the end of this channel's chain.
    fn add_filter( &mut self, filter: &Self::Filter ) -> Result<(), EngineError>;

    fn stop( &mut self ) -> Result<(), EngineError>;
}


/// A filter node created by the sound system.
pub trait Filter: Send {
    /// Updates a peaking filter's gain. Ignored by custom filters.
    fn set_gain( &mut self, gain: f32 ) -> Result<(), EngineError>;

    fn release( &mut self ) -> Result<(), EngineError>;
}


/// Entry point of a sound system.
///
/// Only one thread drives a system; `update` must be called regularly from
/// that thread.
pub trait SoundSystem: Send + 'static {
    type Stream: Stream;
    type Channel: Channel<Filter = Self::Filter>;
    type Filter: Filter;

    /// Starts opening `path` without blocking.
    fn open_stream( &mut self, path: &Path ) -> Result<Self::Stream, EngineError>;

    /// Creates a channel for a ready stream.
    fn play_sound( &mut self, stream: &mut Self::Stream, paused: bool ) -> Result<Self::Channel, EngineError>;

    fn create_filter( &mut self, kind: FilterKind ) -> Result<Self::Filter, EngineError>;

    /// Per-tick housekeeping.
    fn update( &mut self ) -> Result<(), EngineError>;
}
