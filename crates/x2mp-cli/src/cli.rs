//! Command-line argument parsing for x2mp.

use std::path::PathBuf;

use clap::Parser;


/// x2mp - console driver for the X2MP playback engine.
#[derive( Parser, Debug )]
#[command( name = "x2mp" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Settings file to use instead of the default location.
    #[arg( short, long )]
    pub config: Option<PathBuf>,

    /// Add the files but wait for `play`.
    #[arg( long )]
    pub no_autoplay: bool,

    /// More log output (-v debug, -vv trace).
    #[arg( short, long, action = clap::ArgAction::Count )]
    pub verbose: u8,

    /// Only log errors.
    #[arg( short, long, conflicts_with = "verbose" )]
    pub quiet: bool,

    /// Files to add to the playlist.
    #[arg( trailing_var_arg = true )]
    pub files: Vec<PathBuf>,
}


impl Args {
    /// Log level selected by `-v` / `-q`.
    pub fn log_level( &self ) -> tracing::Level {
        match ( self.quiet, self.verbose ) {
            ( true, _ ) => tracing::Level::ERROR,
            ( false, 0 ) => tracing::Level::INFO,
            ( false, 1 ) => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_parse_files_and_verbosity() {
        let args = Args::parse_from([ "x2mp", "-vv", "a.flac", "b.mp3" ]);
        assert_eq!( args.files, vec![ PathBuf::from( "a.flac" ), PathBuf::from( "b.mp3" ) ] );
        assert_eq!( args.log_level(), tracing::Level::TRACE );
    }


    #[test]
    fn test_quiet() {
        let args = Args::parse_from([ "x2mp", "-q" ]);
        assert_eq!( args.log_level(), tracing::Level::ERROR );
        assert!( args.files.is_empty() );
    }
}
