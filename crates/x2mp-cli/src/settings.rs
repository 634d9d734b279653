//! Application settings management
//!
//! Persists the player configuration and the equalizer gains between runs.

use std::fs;
use std::path::{ Path, PathBuf };

use serde::{ Deserialize, Serialize };
use x2mp_core::equalizer::GAIN_UNITY;
use x2mp_core::{ Player, PlayerConfig, BAND_COUNT };


/// Application settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Playback engine configuration
    pub player: PlayerConfig,

    /// Equalizer gains, lowest band first
    pub eq_gains: [f32; BAND_COUNT],
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            player: PlayerConfig::default(),
            eq_gains: [ GAIN_UNITY; BAND_COUNT ],
        }
    }
}


impl Settings {
    /// Returns the default path to the settings file.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "x2mp" ).join( "settings.json" ) )
    }


    /// Loads settings from `path`, or returns defaults if missing or invalid.
    pub fn load( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let settings: Self = match fs::read_to_string( path ) {
            Ok( contents ) => match serde_json::from_str( &contents ) {
                Ok( settings ) => settings,
                Err( e ) => {
                    tracing::warn!( "Invalid settings in {:?}: {}", path, e );
                    return Self::default();
                }
            },
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                return Self::default();
            }
        };

        if let Err( e ) = settings.player.validate() {
            tracing::warn!( "Ignoring player settings: {}", e );
            return Self { player: PlayerConfig::default(), ..settings };
        }
        settings
    }


    /// Saves settings to `path`.
    pub fn save( &self, path: &Path ) {
        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            if !parent.exists() {
                if let Err( e ) = fs::create_dir_all( parent ) {
                    tracing::warn!( "Failed to create settings directory: {}", e );
                    return;
                }
            }
        }

        match serde_json::to_string_pretty( self ) {
            Ok( json ) => {
                if let Err( e ) = fs::write( path, json ) {
                    tracing::warn!( "Failed to save settings: {}", e );
                }
            }
            Err( e ) => {
                tracing::warn!( "Failed to serialize settings: {}", e );
            }
        }
    }


    /// Pushes the stored equalizer gains into `player`.
    pub fn apply_equalizer( &self, player: &Player ) {
        for ( band, gain ) in self.eq_gains.iter().enumerate() {
            player.set_band( band, *gain );
        }
    }


    /// Captures the player's current volume and equalizer gains.
    pub fn capture( &mut self, player: &Player ) {
        self.player.volume = player.volume();
        self.eq_gains = player.equalizer().gains();
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    fn temp_path( name: &str ) -> PathBuf {
        std::env::temp_dir()
            .join( format!( "x2mp-settings-{}-{}", std::process::id(), name ) )
            .join( "settings.json" )
    }


    #[test]
    fn test_missing_file_gives_defaults() {
        let settings = Settings::load( Path::new( "/nonexistent/x2mp/settings.json" ) );
        assert_eq!( settings, Settings::default() );
    }


    #[test]
    fn test_save_and_load() {
        let path = temp_path( "roundtrip" );
        let mut settings = Settings::default();
        settings.eq_gains[ 2 ] = 2.0;
        settings.player.tick_interval_ms = 40;
        settings.save( &path );

        assert_eq!( Settings::load( &path ), settings );
        let _ = fs::remove_dir_all( path.parent().unwrap() );
    }


    #[test]
    fn test_invalid_player_config_falls_back() {
        let path = temp_path( "invalid" );
        fs::create_dir_all( path.parent().unwrap() ).unwrap();
        fs::write( &path, r#"{ "player": { "tick_interval_ms": 0 }, "eq_gains": [1,1,1,1,1,1,1,1,1,0.5] }"# ).unwrap();

        let settings = Settings::load( &path );
        assert_eq!( settings.player, PlayerConfig::default() );
        assert_eq!( settings.eq_gains[ 9 ], 0.5 );
        let _ = fs::remove_dir_all( path.parent().unwrap() );
    }
}
