//! x2mp CLI - console driver for the X2MP playback engine
//!
//! Reads one command per line from stdin and prints what the player reports.

mod cli;
mod settings;

use std::io::{ self, BufRead };
use std::path::{ Path, PathBuf };
use std::thread;
use std::time::Duration;

use anyhow::{ Context, Result };
use clap::Parser;
use crossbeam_channel::{ select, Receiver };

use cli::Args;
use settings::Settings;

use x2mp_core::{
    command,
    Command, PlaybackState, Player, PlayerEvent, SymphoniaTagReader, TrackEntry,
    BAND_CENTERS,
};


fn format_time( duration: Duration ) -> String {
    let secs = duration.as_secs();
    format!( "{}:{:02}", secs / 60, secs % 60 )
}


/// Application state.
struct App {
    player: Player,
    tags: SymphoniaTagReader,
    settings: Settings,
    settings_path: Option<PathBuf>,
    should_quit: bool,
}


impl App {
    /// Creates a new App instance.
    fn new( args: &Args ) -> Result<Self> {
        let settings_path = args.config.clone().or_else( Settings::default_path );
        let settings = settings_path
            .as_deref()
            .map( Settings::load )
            .unwrap_or_default();

        let player = Player::native( settings.player.clone() )
            .context( "Failed to start the player" )?;
        settings.apply_equalizer( &player );

        let app = Self {
            player,
            tags: SymphoniaTagReader::new(),
            settings,
            settings_path,
            should_quit: false,
        };

        for file in &args.files {
            app.add_path( file );
        }

        Ok( app )
    }


    fn add_path( &self, path: &Path ) {
        if !path.is_file() {
            println!( "Not a file: {}", path.display() );
            return;
        }
        let entry = TrackEntry::from_path( path, &self.tags );
        println!( "Added: {}", entry.display_name() );
        self.player.add_to_now_playing( entry );
    }


    fn execute_command( &mut self, input: &str ) {
        if input.trim().is_empty() {
            return;
        }
        match Command::parse( input ) {
            Ok( cmd ) => {
                if let Err( e ) = self.run_command( cmd ) {
                    println!( "Error: {}", e );
                }
            }
            Err( e ) => {
                println!( "{}", e );
            }
        }
    }


    fn run_command( &mut self, cmd: Command ) -> Result<()> {
        match cmd {
            Command::Add { path } => {
                self.add_path( &path );
            }
            Command::Remove { position } => {
                match self.player.remove_at( position - 1 )? {
                    Some( entry ) => println!( "Removed: {}", entry.display_name() ),
                    None => println!( "No track at position {}", position ),
                }
            }
            Command::Clear => {
                self.player.clear_now_playing()?;
                println!( "Playlist cleared" );
            }
            Command::List => {
                self.print_playlist();
            }
            Command::Play | Command::Pause => {
                self.player.play_or_pause( None )?;
            }
            Command::Stop => {
                self.player.stop()?;
            }
            Command::Next => {
                if !self.player.play_next()? {
                    println!( "End of playlist" );
                }
            }
            Command::Prev => {
                if !self.player.play_prev()? {
                    println!( "Nothing to go back to" );
                }
            }
            Command::Seek { position } => {
                if self.player.state() == PlaybackState::Idle {
                    println!( "Nothing is playing" );
                } else {
                    self.player.seek( position )?;
                }
            }
            Command::Volume { percent } => {
                if let Some( percent ) = percent {
                    self.player.set_volume( percent as f32 / 100.0 );
                }
                println!( "Volume: {}%", ( self.player.volume() * 100.0 ).round() as u32 );
            }
            Command::Eq { band, gain } => {
                let clamped = self.player.equalizer().band( band ).map( |b| b.clamp( gain ) );
                if let Some( gain ) = clamped {
                    self.player.set_band( band, gain );
                    println!( "EQ {} Hz: {:.2}", BAND_CENTERS[ band ], gain );
                }
            }
            Command::EqReset => {
                self.player.reset_equalizer();
                println!( "Equalizer reset" );
            }
            Command::Help => {
                println!( "{}", command::help_text() );
            }
            Command::Quit => {
                self.should_quit = true;
            }
        }
        Ok(())
    }


    fn print_playlist( &self ) {
        let tracks = self.player.now_playing();
        if tracks.is_empty() {
            println!( "Playlist is empty" );
            return;
        }
        for ( i, entry ) in tracks.iter().enumerate() {
            let marker = if entry.is_playing() { ">" } else { " " };
            println!( "{} {:3}. {}", marker, i + 1, entry.display_name() );
        }
    }


    fn handle_event( &self, event: PlayerEvent ) {
        match event {
            PlayerEvent::TrackChanged { entry } => {
                println!( "Loading: {}", entry.display_name() );
            }
            PlayerEvent::StateChanged { state } => {
                tracing::debug!( "Player state: {:?}", state );
                match state {
                    PlaybackState::Playing => println!( "Playing ({})", format_time( self.player.length() ) ),
                    PlaybackState::Paused => println!( "Paused at {}", format_time( self.player.position() ) ),
                    PlaybackState::Idle => println!( "Stopped" ),
                    PlaybackState::Loading | PlaybackState::Stopping => {}
                }
            }
            PlayerEvent::LoadFailed { entry, message } => {
                println!( "Could not play {}: {}", entry.display_name(), message );
            }
            PlayerEvent::Error { message } => {
                println!( "Playback error: {}", message );
            }
            PlayerEvent::TrackEnded { entry } => {
                tracing::debug!( "Finished: {}", entry.display_name() );
            }
            PlayerEvent::PositionChanged { .. }
            | PlayerEvent::LengthChanged { .. }
            | PlayerEvent::PlayingChanged { .. }
            | PlayerEvent::EqualizerChanged { .. } => {}
        }
    }


    fn save_settings( &mut self ) {
        self.settings.capture( &self.player );
        if let Some( ref path ) = self.settings_path {
            self.settings.save( path );
        }
    }


    /// Saves the settings, then stops playback.
    fn shutdown( &mut self ) -> Result<()> {
        self.save_settings();
        self.player.stop().context( "Failed to stop playback" )
    }
}


/// Forwards stdin lines to a channel so the main loop can also watch events.
fn spawn_stdin_reader() -> Receiver<String> {
    let ( tx, rx ) = crossbeam_channel::unbounded();
    thread::spawn( move || {
        for line in io::stdin().lock().lines() {
            match line {
                Ok( line ) => {
                    if tx.send( line ).is_err() {
                        break;
                    }
                }
                Err( e ) => {
                    tracing::warn!( "Failed to read stdin: {}", e );
                    break;
                }
            }
        }
    });
    rx
}


fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level( args.log_level() )
        .with_writer( io::stderr )
        .init();

    let mut app = App::new( &args )?;
    let events = app.player.subscribe();
    let lines = spawn_stdin_reader();

    if !args.no_autoplay && !app.player.now_playing().is_empty() {
        app.player.play_or_pause( None )?;
    }

    println!( "Type 'help' for commands." );

    // Main loop
    while !app.should_quit {
        select! {
            recv( lines ) -> line => match line {
                Ok( line ) => app.execute_command( &line ),
                // stdin closed
                Err( _ ) => break,
            },
            recv( events ) -> event => {
                if let Ok( event ) = event {
                    app.handle_event( event );
                }
            }
        }
    }

    app.shutdown()
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_shutdown_saves_settings() {
        let dir = std::env::temp_dir().join( format!( "x2mp-cli-{}", std::process::id() ) );
        let path = dir.join( "settings.json" );
        let args = Args::parse_from([ "x2mp", "--no-autoplay", "--config", path.to_str().unwrap() ]);

        let mut app = App::new( &args ).unwrap();
        app.player.set_volume( 0.4 );
        app.player.set_band( 2, 2.0 );
        app.shutdown().unwrap();

        let saved = Settings::load( &path );
        assert_eq!( saved.player.volume, 0.4 );
        assert_eq!( saved.eq_gains[ 2 ], 2.0 );
        let _ = std::fs::remove_dir_all( &dir );
    }
}
