//! Text command parsing.
//!
//! Line commands typed into the player's console. Commands are parsed from
//! user input and executed by the binary against a `Player`.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::equalizer::BAND_COUNT;


/// Errors that can occur during command parsing.
#[derive( Debug, Error, PartialEq )]
pub enum CommandError {
    #[error( "Unknown command: {0}" )]
    Unknown( String ),

    #[error( "Invalid argument: {0}" )]
    InvalidArgument( String ),

    #[error( "Missing argument: {0}" )]
    MissingArgument( String ),
}


/// Parsed console command.
#[derive( Debug, Clone, PartialEq )]
pub enum Command {
    // Playlist commands
    Add { path: PathBuf },
    /// 1-based playlist position, as shown by `list`
    Remove { position: usize },
    Clear,
    List,

    // Playback commands
    Play,
    Pause,
    Stop,
    Next,
    Prev,
    Seek { position: Duration },
    Volume { percent: Option<u32> },

    // Equalizer commands
    Eq { band: usize, gain: f32 },
    EqReset,

    Help,
    Quit,
}


impl Command {
    /// Parses a command line.
    ///
    /// @param input - The command string to parse
    ///
    /// @returns The parsed command or an error
    pub fn parse( input: &str ) -> Result<Self, CommandError> {
        let input = input.trim();
        let mut parts = input.splitn( 2, ' ' );
        let cmd = parts.next().unwrap_or( "" ).to_lowercase();
        let args = parts.next().map( |s| s.trim() ).filter( |s| !s.is_empty() );

        match cmd.as_str() {
            // Playlist commands
            "add" | "a" => {
                let path = args
                    .ok_or_else( || CommandError::MissingArgument( "path".into() ) )?;
                Ok( Command::Add { path: PathBuf::from( path ) } )
            }
            "remove" | "rm" | "del" => {
                let arg = args
                    .ok_or_else( || CommandError::MissingArgument( "playlist position".into() ) )?;
                let position = arg.parse::<usize>()
                    .ok()
                    .filter( |p| *p > 0 )
                    .ok_or_else( || CommandError::InvalidArgument( format!( "Invalid position: {}", arg ) ) )?;
                Ok( Command::Remove { position } )
            }
            "clear" | "cl" => Ok( Command::Clear ),
            "list" | "ls" => Ok( Command::List ),

            // Playback commands
            "play" | "p" => Ok( Command::Play ),
            "pause" | "pa" => Ok( Command::Pause ),
            "stop" | "st" => Ok( Command::Stop ),
            "next" | "n" => Ok( Command::Next ),
            "prev" | "previous" | "pr" => Ok( Command::Prev ),
            "seek" | "sk" => {
                let time_str = args
                    .ok_or_else( || CommandError::MissingArgument( "time position".into() ) )?;
                let position = parse_time( time_str )?;
                Ok( Command::Seek { position } )
            }
            "vol" | "volume" => {
                let percent = args.map( parse_volume ).transpose()?;
                Ok( Command::Volume { percent } )
            }

            // Equalizer commands
            "eq" => {
                let args = args
                    .ok_or_else( || CommandError::MissingArgument( "band and gain".into() ) )?;
                let ( band, gain ) = parse_band( args )?;
                Ok( Command::Eq { band, gain } )
            }
            "eqreset" | "eqr" => Ok( Command::EqReset ),

            "help" | "h" | "?" => Ok( Command::Help ),
            "quit" | "q" | "exit" => Ok( Command::Quit ),

            "" => Err( CommandError::Unknown( "empty command".into() ) ),
            other => Err( CommandError::Unknown( other.to_string() ) ),
        }
    }


    /// Returns a brief description of the command for help text.
    pub fn description( &self ) -> &'static str {
        match self {
            Command::Add { .. } => "Add file to playlist",
            Command::Remove { .. } => "Remove track from playlist",
            Command::Clear => "Clear playlist",
            Command::List => "List playlist",
            Command::Play => "Play or pause",
            Command::Pause => "Pause or resume",
            Command::Stop => "Stop playback",
            Command::Next => "Next track",
            Command::Prev => "Previous track",
            Command::Seek { .. } => "Seek to position",
            Command::Volume { .. } => "Set volume (0-150)",
            Command::Eq { .. } => "Set equalizer band gain",
            Command::EqReset => "Reset equalizer",
            Command::Help => "Show help",
            Command::Quit => "Quit application",
        }
    }
}


/// Parses a time string like "1:30" or "90" into a Duration.
///
/// @param s - Time string in format "MM:SS", "M:SS", or just seconds
///
/// @returns Duration or error
fn parse_time( s: &str ) -> Result<Duration, CommandError> {
    let s = s.trim();

    if let Some(( min, sec )) = s.split_once( ':' ) {
        let minutes: u64 = min.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid minutes: {}", min ) ) )?;
        let seconds: u64 = sec.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid seconds: {}", sec ) ) )?;
        let total = minutes
            .checked_mul( 60 )
            .and_then( |m| m.checked_add( seconds ) )
            .ok_or_else( || CommandError::InvalidArgument( format!( "Time out of range: {}", s ) ) )?;
        Ok( Duration::from_secs( total ) )
    } else {
        let seconds: u64 = s.parse()
            .map_err( |_| CommandError::InvalidArgument( format!( "Invalid time: {}", s ) ) )?;
        Ok( Duration::from_secs( seconds ) )
    }
}


fn parse_volume( s: &str ) -> Result<u32, CommandError> {
    match s.parse::<u32>() {
        Ok( percent ) if percent <= 150 => Ok( percent ),
        _ => Err( CommandError::InvalidArgument( format!( "Invalid volume: '{}'. Use 0-150", s ) ) ),
    }
}


/// Parses "<band> <gain>", band 1-based.
fn parse_band( s: &str ) -> Result<( usize, f32 ), CommandError> {
    let mut parts = s.split_whitespace();
    let band_str = parts.next().unwrap_or( "" );
    let gain_str = parts
        .next()
        .ok_or_else( || CommandError::MissingArgument( "gain".into() ) )?;

    let band = band_str.parse::<usize>()
        .ok()
        .filter( |b| ( 1..=BAND_COUNT ).contains( b ) )
        .ok_or_else( || CommandError::InvalidArgument(
            format!( "Invalid band: '{}'. Use 1-{}", band_str, BAND_COUNT )
        ))?;
    let gain = gain_str.parse::<f32>()
        .ok()
        .filter( |g| g.is_finite() && *g >= 0.0 )
        .ok_or_else( || CommandError::InvalidArgument( format!( "Invalid gain: {}", gain_str ) ) )?;

    Ok(( band - 1, gain ))
}


/// Returns help text listing all available commands.
pub fn help_text() -> &'static str {
    r#"Playlist Commands:
  add <path>        Add file to playlist
  remove <n>        Remove track n (see list)
  clear             Clear playlist
  list              Show playlist

Playback Commands:
  play              Play, or pause/resume
  pause             Pause/resume
  stop              Stop playback
  next              Next track
  prev              Previous track
  seek <time>       Seek to position (e.g., 1:30)
  vol [0-150]       Show or set volume

Equalizer Commands:
  eq <band> <gain>  Set band 1-10 gain (1.0 = flat)
  eqreset           Reset all bands

Other Commands:
  help              Show this help
  quit              Exit x2mp"#
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_add() {
        let cmd = Command::parse( "add /path/to/file.mp3" ).unwrap();
        assert_eq!( cmd, Command::Add { path: PathBuf::from( "/path/to/file.mp3" ) } );
    }


    #[test]
    fn test_parse_add_alias() {
        let cmd = Command::parse( "a /music/My Song.flac" ).unwrap();
        assert_eq!( cmd, Command::Add { path: PathBuf::from( "/music/My Song.flac" ) } );
    }


    #[test]
    fn test_parse_seek() {
        let cmd = Command::parse( "seek 1:30" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 90 ) } );
    }


    #[test]
    fn test_parse_seek_seconds() {
        let cmd = Command::parse( "seek 45" ).unwrap();
        assert_eq!( cmd, Command::Seek { position: Duration::from_secs( 45 ) } );
    }


    #[test]
    fn test_parse_seek_out_of_range() {
        let result = Command::parse( "seek 999999999999999999:00" );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );
        let result = Command::parse( &format!( "seek {}:59", u64::MAX / 60 ) );
        assert!( matches!( result, Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_remove() {
        assert_eq!( Command::parse( "rm 3" ).unwrap(), Command::Remove { position: 3 } );
        assert!( matches!( Command::parse( "remove 0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "remove" ), Err( CommandError::MissingArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_volume() {
        assert_eq!( Command::parse( "vol 80" ).unwrap(), Command::Volume { percent: Some( 80 ) } );
        assert_eq!( Command::parse( "vol" ).unwrap(), Command::Volume { percent: None } );
        assert!( Command::parse( "vol 200" ).is_err() );
    }


    #[test]
    fn test_parse_eq() {
        assert_eq!( Command::parse( "eq 1 2.5" ).unwrap(), Command::Eq { band: 0, gain: 2.5 } );
        assert_eq!( Command::parse( "eq 10 0.5" ).unwrap(), Command::Eq { band: 9, gain: 0.5 } );
        assert!( matches!( Command::parse( "eq 11 1.0" ), Err( CommandError::InvalidArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "eq 3" ), Err( CommandError::MissingArgument( _ ) ) ) );
        assert!( matches!( Command::parse( "eq 3 loud" ), Err( CommandError::InvalidArgument( _ ) ) ) );
    }


    #[test]
    fn test_parse_case_insensitive() {
        assert_eq!( Command::parse( "  NEXT " ).unwrap(), Command::Next );
        assert_eq!( Command::parse( "EqReset" ).unwrap(), Command::EqReset );
    }


    #[test]
    fn test_parse_unknown() {
        let result = Command::parse( "foobar" );
        assert!( matches!( result, Err( CommandError::Unknown( _ ) ) ) );
    }


    #[test]
    fn test_parse_missing_arg() {
        let result = Command::parse( "add" );
        assert!( matches!( result, Err( CommandError::MissingArgument( _ ) ) ) );
    }
}
