//! Player configuration
//!
//! Every field has a default so partial JSON settings files load cleanly.
//! Durations are stored in milliseconds.

use std::time::Duration;

use serde::{ Deserialize, Serialize };
use thiserror::Error;


/// Upper bound accepted by [`PlayerConfig::volume`].
pub const VOLUME_MAX: f32 = 1.5;


/// Invalid configuration values.
#[derive( Debug, Error, PartialEq )]
pub enum ConfigError {
    #[error( "Tick interval must be greater than zero" )]
    ZeroTick,

    #[error( "Open poll interval must be greater than zero" )]
    ZeroPoll,

    #[error( "Fade-out step must be greater than zero" )]
    ZeroFadeStep,

    #[error( "Equalizer bandwidth must be positive, got {0}" )]
    Bandwidth( f32 ),

    #[error( "Volume must be between 0 and 1.5, got {0}" )]
    Volume( f32 ),
}


/// What the player does when a track fails to open.
#[derive( Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize )]
#[serde( rename_all = "snake_case" )]
pub enum LoadFailurePolicy {
    /// Report the failure and advance to the next entry.
    #[default]
    SkipToNext,
    /// Report the failure and go idle.
    Stop,
}


/// Volume ramp applied before a channel is stopped.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize )]
#[serde( default )]
pub struct FadeOut {
    pub duration_ms: u64,
    pub step_ms: u64,
}


impl Default for FadeOut {
    fn default() -> Self {
        Self {
            duration_ms: 500,
            step_ms: 25,
        }
    }
}


impl FadeOut {
    pub fn duration( &self ) -> Duration {
        Duration::from_millis( self.duration_ms )
    }


    pub fn step( &self ) -> Duration {
        Duration::from_millis( self.step_ms )
    }


    /// Number of volume steps in the ramp, at least one.
    pub fn steps( &self ) -> u32 {
        ( self.duration_ms / self.step_ms.max( 1 ) ).clamp( 1, u32::MAX as u64 ) as u32
    }
}


/// Settings of a [`crate::Player`].
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct PlayerConfig {
    /// Cadence of the monitoring loop
    pub tick_interval_ms: u64,

    /// How often a loading stream's open state is polled
    pub open_poll_interval_ms: u64,

    /// `None` stops channels immediately
    pub fade_out: Option<FadeOut>,

    pub load_failure: LoadFailurePolicy,

    /// Width of each equalizer band, in octaves
    pub eq_bandwidth: f32,

    /// Initial channel volume (0.0 to 1.5)
    pub volume: f32,
}


impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 25,
            open_poll_interval_ms: 10,
            fade_out: Some( FadeOut::default() ),
            load_failure: LoadFailurePolicy::default(),
            eq_bandwidth: 1.0,
            volume: 1.0,
        }
    }
}


impl PlayerConfig {
    pub fn tick_interval( &self ) -> Duration {
        Duration::from_millis( self.tick_interval_ms )
    }


    pub fn open_poll_interval( &self ) -> Duration {
        Duration::from_millis( self.open_poll_interval_ms )
    }


    /// Longest a caller waits for the worker to acknowledge a stop.
    pub fn stop_timeout( &self ) -> Duration {
        let fade = self.fade_out.map( |f| f.duration() + f.step() ).unwrap_or_default();
        self.tick_interval() * 4 + fade + Duration::from_secs( 1 )
    }


    /// Checks that the values can drive a player.
    pub fn validate( &self ) -> Result<(), ConfigError> {
        if self.tick_interval_ms == 0 {
            return Err( ConfigError::ZeroTick );
        }
        if self.open_poll_interval_ms == 0 {
            return Err( ConfigError::ZeroPoll );
        }
        if self.fade_out.is_some_and( |f| f.step_ms == 0 ) {
            return Err( ConfigError::ZeroFadeStep );
        }
        if !( self.eq_bandwidth.is_finite() && self.eq_bandwidth > 0.0 ) {
            return Err( ConfigError::Bandwidth( self.eq_bandwidth ) );
        }
        if !( 0.0..=VOLUME_MAX ).contains( &self.volume ) {
            return Err( ConfigError::Volume( self.volume ) );
        }
        Ok(())
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_defaults_are_valid() {
        let config = PlayerConfig::default();
        assert_eq!( config.validate(), Ok(()) );
        assert_eq!( config.tick_interval(), Duration::from_millis( 25 ) );
        assert_eq!( config.fade_out.map( |f| f.steps() ), Some( 20 ) );
    }


    #[test]
    fn test_partial_json_uses_defaults() {
        let config: PlayerConfig = serde_json::from_str(
            r#"{ "tick_interval_ms": 50, "load_failure": "stop", "fade_out": null }"#
        ).unwrap();
        assert_eq!( config.tick_interval_ms, 50 );
        assert_eq!( config.load_failure, LoadFailurePolicy::Stop );
        assert_eq!( config.fade_out, None );
        assert_eq!( config.open_poll_interval_ms, 10 );
        assert_eq!( config.volume, 1.0 );
    }


    #[test]
    fn test_invalid_values_rejected() {
        let config = PlayerConfig { tick_interval_ms: 0, ..Default::default() };
        assert_eq!( config.validate(), Err( ConfigError::ZeroTick ) );

        let config = PlayerConfig { volume: 2.0, ..Default::default() };
        assert_eq!( config.validate(), Err( ConfigError::Volume( 2.0 ) ) );

        let config = PlayerConfig { eq_bandwidth: 0.0, ..Default::default() };
        assert_eq!( config.validate(), Err( ConfigError::Bandwidth( 0.0 ) ) );

        let config = PlayerConfig {
            fade_out: Some( FadeOut { duration_ms: 100, step_ms: 0 } ),
            ..Default::default()
        };
        assert_eq!( config.validate(), Err( ConfigError::ZeroFadeStep ) );
    }


    #[test]
    fn test_stop_timeout_covers_fade() {
        let with_fade = PlayerConfig::default();
        let without = PlayerConfig { fade_out: None, ..Default::default() };
        assert!( with_fade.stop_timeout() > without.stop_timeout() + Duration::from_millis( 500 ) );
    }
}
