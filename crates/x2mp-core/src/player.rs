//! Playback controller
//!
//! `Player` is the handle the UI talks to. One worker thread owns the sound
//! system and at most one playback session: it loads tracks, attaches the
//! equalizer and tap filters, publishes position and state, and advances
//! through the navigator when a track ends. The handle sends it requests and
//! reads what it publishes.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };
use std::thread;
use std::time::{ Duration, Instant };

use crossbeam_channel::{ Receiver, RecvTimeoutError, Sender };
use parking_lot::{ Mutex, RwLock };
use thiserror::Error;

use crate::config::{ ConfigError, FadeOut, LoadFailurePolicy, PlayerConfig, VOLUME_MAX };
use crate::engine::{ Channel, EngineError, Filter, FilterKind, NativeSystem, OpenState, SoundSystem, Stream };
use crate::equalizer::{ Equalizer, BAND_CENTERS, BAND_COUNT };
use crate::playlist::{ History, Navigator };
use crate::tap::{ TapBuffer, TapFilter };
use crate::track::TrackEntry;


/// Errors that can occur during playback.
#[derive( Debug, Error )]
pub enum PlayerError {
    #[error( "Invalid configuration: {0}" )]
    Config( #[from] ConfigError ),

    #[error( transparent )]
    Engine( #[from] EngineError ),

    #[error( "Failed to start playback thread: {0}" )]
    Spawn( std::io::Error ),

    #[error( "Playback thread did not respond" )]
    Unresponsive,

    #[error( "Playback thread has exited" )]
    Disconnected,
}


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlaybackState {
    Idle,
    Loading,
    Playing,
    Paused,
    Stopping,
}


/// Events emitted by the player for UI updates.
#[derive( Debug, Clone )]
pub enum PlayerEvent {
    TrackChanged { entry: Arc<TrackEntry> },
    StateChanged { state: PlaybackState },
    PositionChanged { position: Duration },
    LengthChanged { length: Duration },
    PlayingChanged { playing: bool },
    EqualizerChanged { gains: [f32; BAND_COUNT] },
    LoadFailed { entry: Arc<TrackEntry>, message: String },
    TrackEnded { entry: Arc<TrackEntry> },
    Error { message: String },
}


fn millis( duration: Duration ) -> u32 {
    duration.as_millis().min( u32::MAX as u128 ) as u32
}


/// Values only the worker writes.
#[derive( Debug, Clone, Copy )]
struct Status {
    state: PlaybackState,
    position: Duration,
    length: Duration,
    playing: bool,
}


/// The entry being played and the token that cancels its session.
struct ActiveSession {
    entry: Arc<TrackEntry>,
    cancel: Arc<AtomicBool>,
}


impl ActiveSession {
    fn is( &self, entry: &Arc<TrackEntry>, cancel: &Arc<AtomicBool> ) -> bool {
        Arc::ptr_eq( &self.entry, entry ) && Arc::ptr_eq( &self.cancel, cancel )
    }
}


/// State shared between the handle and the worker.
struct Shared {
    navigator: Mutex<Navigator>,
    equalizer: Equalizer,
    tap: Arc<TapBuffer>,
    status: RwLock<Status>,
    active: Mutex<Option<ActiveSession>>,
    /// f32 bits
    volume: AtomicU32,
    subscribers: Mutex<Vec<Sender<PlayerEvent>>>,
}


impl Shared {
    fn new( config: &PlayerConfig ) -> Self {
        Self {
            navigator: Mutex::new( Navigator::new() ),
            equalizer: Equalizer::new(),
            tap: Arc::new( TapBuffer::new() ),
            status: RwLock::new( Status {
                state: PlaybackState::Idle,
                position: Duration::ZERO,
                length: Duration::ZERO,
                playing: false,
            }),
            active: Mutex::new( None ),
            volume: AtomicU32::new( config.volume.to_bits() ),
            subscribers: Mutex::new( Vec::new() ),
        }
    }


    fn publish( &self, event: PlayerEvent ) {
        self.subscribers.lock().retain( |tx| tx.send( event.clone() ).is_ok() );
    }


    fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    fn set_state( &self, state: PlaybackState ) {
        let previous = std::mem::replace( &mut self.status.write().state, state );
        if previous != state {
            tracing::debug!( "State: {:?} → {:?}", previous, state );
            self.publish( PlayerEvent::StateChanged { state } );
        }
    }


    fn set_position( &self, position: Duration ) {
        let previous = std::mem::replace( &mut self.status.write().position, position );
        if previous != position {
            self.publish( PlayerEvent::PositionChanged { position } );
        }
    }


    fn set_length( &self, length: Duration ) {
        let previous = std::mem::replace( &mut self.status.write().length, length );
        if previous != length {
            self.publish( PlayerEvent::LengthChanged { length } );
        }
    }


    fn set_playing( &self, playing: bool ) {
        let previous = std::mem::replace( &mut self.status.write().playing, playing );
        if previous != playing {
            self.publish( PlayerEvent::PlayingChanged { playing } );
        }
    }


    /// Takes the active session and cancels it. The token is set while the
    /// lock is held, so the worker either sees it or has already moved on.
    fn cancel_active( &self ) {
        let mut active = self.active.lock();
        if let Some( session ) = active.take() {
            session.entry.set_playing( false );
            session.cancel.store( true, Ordering::Release );
        }
    }


    /// Forgets the active session if it is still the given one.
    fn clear_active( &self, entry: &Arc<TrackEntry>, cancel: &Arc<AtomicBool> ) {
        let mut active = self.active.lock();
        if active.as_ref().is_some_and( |a| a.is( entry, cancel ) ) {
            *active = None;
        }
    }
}


enum Request {
    Start { entry: Arc<TrackEntry>, cancel: Arc<AtomicBool> },
    Stop { ack: Sender<Result<(), EngineError>> },
    TogglePause { reply: Sender<Result<Option<bool>, EngineError>> },
    Seek( Duration ),
    Shutdown,
}


/// Core audio player.
pub struct Player {
    shared: Arc<Shared>,
    requests: Sender<Request>,
    worker: Option<thread::JoinHandle<()>>,
    /// Serializes commands issued from the caller side
    control: Mutex<()>,
    config: PlayerConfig,
}


impl Player {
    /// Creates a player driving `system` from a new worker thread.
    pub fn new<S: SoundSystem>( system: S, config: PlayerConfig ) -> Result<Self, PlayerError> {
        config.validate()?;

        let shared = Arc::new( Shared::new( &config ) );

        let ( requests, receiver ) = crossbeam_channel::unbounded();
        let worker = Worker {
            system,
            shared: Arc::clone( &shared ),
            requests: receiver,
            config: config.clone(),
            session: None,
        };

        let handle = thread::Builder::new()
            .name( "x2mp-player".into() )
            .spawn( move || worker.run() )
            .map_err( PlayerError::Spawn )?;

        Ok( Self {
            shared,
            requests,
            worker: Some( handle ),
            control: Mutex::new( () ),
            config,
        })
    }


    /// Creates a player on the bundled native sound system.
    pub fn native( config: PlayerConfig ) -> Result<Self, PlayerError> {
        Self::new( NativeSystem::new(), config )
    }


    pub fn config( &self ) -> &PlayerConfig {
        &self.config
    }


    /// Starts `entry`, or toggles pause / starts the next entry when `None`.
    ///
    /// With an entry, any running session is stopped first and the entry is
    /// recorded in the history at its playlist position.
    pub fn play_or_pause( &self, entry: Option<Arc<TrackEntry>> ) -> Result<(), PlayerError> {
        let _control = self.control.lock();

        match entry {
            Some( entry ) => {
                if self.has_session() {
                    self.stop_session( false )?;
                }
                let entry = self.shared.navigator.lock().seed( entry );
                self.start( entry )
            }
            None if self.has_session() => self.toggle_pause(),
            None => {
                let next = self.shared.navigator.lock().next();
                match next {
                    Some( entry ) => self.start( entry ),
                    None => {
                        tracing::debug!( "Nothing to play" );
                        Ok(())
                    }
                }
            }
        }
    }


    /// Stops playback and forgets the history.
    pub fn stop( &self ) -> Result<(), PlayerError> {
        let _control = self.control.lock();
        self.stop_session( true )
    }


    /// Plays the next track in the playlist.
    /// Returns Ok(true) if a track was started, Ok(false) if no next track.
    pub fn play_next( &self ) -> Result<bool, PlayerError> {
        let _control = self.control.lock();
        self.stop_session( false )?;

        let next = self.shared.navigator.lock().next();
        match next {
            Some( entry ) => self.start( entry ).map( |_| true ),
            None => Ok( false ),
        }
    }


    /// Plays the previous track in the history.
    /// Returns Ok(true) if a track was started, Ok(false) if the history is empty.
    pub fn play_prev( &self ) -> Result<bool, PlayerError> {
        let _control = self.control.lock();
        self.stop_session( false )?;

        let prev = self.shared.navigator.lock().prev();
        match prev {
            Some( entry ) => self.start( entry ).map( |_| true ),
            None => Ok( false ),
        }
    }


    pub fn add_to_now_playing( &self, entry: Arc<TrackEntry> ) {
        self.shared.navigator.lock().add( entry );
    }


    /// Removes `entry` from the playlist. Removing the playing entry stops
    /// playback. Returns false if the entry was not in the playlist.
    pub fn remove_from_now_playing( &self, entry: &Arc<TrackEntry> ) -> Result<bool, PlayerError> {
        let _control = self.control.lock();

        if !self.shared.navigator.lock().remove( entry ) {
            return Ok( false );
        }
        if self.is_active( entry ) {
            self.stop_session( true )?;
        }
        Ok( true )
    }


    /// Removes the playlist entry at `index`, see [`Player::remove_from_now_playing`].
    pub fn remove_at( &self, index: usize ) -> Result<Option<Arc<TrackEntry>>, PlayerError> {
        let _control = self.control.lock();

        let removed = self.shared.navigator.lock().remove_at( index );
        if let Some( ref entry ) = removed {
            if self.is_active( entry ) {
                self.stop_session( true )?;
            }
        }
        Ok( removed )
    }


    /// Stops playback and empties the playlist.
    pub fn clear_now_playing( &self ) -> Result<(), PlayerError> {
        let _control = self.control.lock();
        self.stop_session( true )?;
        self.shared.navigator.lock().clear();
        Ok(())
    }


    /// Queues a seek for the next tick. Does nothing while idle.
    pub fn seek( &self, position: Duration ) -> Result<(), PlayerError> {
        if !self.has_session() {
            return Ok(());
        }
        self.send( Request::Seek( position ) )
    }


    /// Last published position.
    pub fn position( &self ) -> Duration {
        self.shared.status.read().position
    }


    /// Length of the current track, zero until it is ready.
    pub fn length( &self ) -> Duration {
        self.shared.status.read().length
    }


    pub fn state( &self ) -> PlaybackState {
        self.shared.status.read().state
    }


    /// True while a channel is producing audio.
    pub fn is_playing( &self ) -> bool {
        self.shared.status.read().playing
    }


    pub fn current_entry( &self ) -> Option<Arc<TrackEntry>> {
        self.shared.active.lock().as_ref().map( |a| Arc::clone( &a.entry ) )
    }


    /// Snapshot of the playlist.
    pub fn now_playing( &self ) -> Vec<Arc<TrackEntry>> {
        self.shared.navigator.lock().playlist().tracks().to_vec()
    }


    /// Snapshot of the history and its pointer.
    pub fn history( &self ) -> History {
        self.shared.navigator.lock().history().clone()
    }


    /// Sets the volume level (0.0 = mute, 1.0 = normal, up to 1.5 = boost).
    pub fn set_volume( &self, volume: f32 ) {
        let volume = volume.clamp( 0.0, VOLUME_MAX );
        self.shared.volume.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        self.shared.volume()
    }


    pub fn equalizer( &self ) -> &Equalizer {
        &self.shared.equalizer
    }


    /// Sets one band's gain. The live filters follow at the next tick.
    pub fn set_band( &self, index: usize, gain: f32 ) -> bool {
        if !self.shared.equalizer.set_band( index, gain ) {
            return false;
        }
        self.shared.publish( PlayerEvent::EqualizerChanged { gains: self.shared.equalizer.gains() } );
        true
    }


    pub fn reset_equalizer( &self ) {
        self.shared.equalizer.reset();
        self.shared.publish( PlayerEvent::EqualizerChanged { gains: self.shared.equalizer.gains() } );
    }


    /// Buffer holding the most recent audio block.
    pub fn tap( &self ) -> Arc<TapBuffer> {
        Arc::clone( &self.shared.tap )
    }


    pub fn subscribe( &self ) -> Receiver<PlayerEvent> {
        let ( tx, rx ) = crossbeam_channel::unbounded();
        self.shared.subscribers.lock().push( tx );
        rx
    }


    fn send( &self, request: Request ) -> Result<(), PlayerError> {
        self.requests.send( request ).map_err( |_| PlayerError::Disconnected )
    }


    fn has_session( &self ) -> bool {
        self.shared.active.lock().is_some()
    }


    fn is_active( &self, entry: &Arc<TrackEntry> ) -> bool {
        self.shared.active.lock().as_ref().is_some_and( |a| Arc::ptr_eq( &a.entry, entry ) )
    }


    fn start( &self, entry: Arc<TrackEntry> ) -> Result<(), PlayerError> {
        let cancel = Arc::new( AtomicBool::new( false ) );
        entry.set_playing( true );
        *self.shared.active.lock() = Some( ActiveSession {
            entry: Arc::clone( &entry ),
            cancel: Arc::clone( &cancel ),
        });
        self.send( Request::Start { entry, cancel } )
    }


    /// Cancels the running session and waits for the worker to tear it down.
    fn stop_session( &self, reset_history: bool ) -> Result<(), PlayerError> {
        self.shared.cancel_active();

        let ( ack, acked ) = crossbeam_channel::bounded( 1 );
        self.send( Request::Stop { ack } )?;
        let result = acked.recv_timeout( self.config.stop_timeout() );

        if reset_history {
            self.shared.navigator.lock().reset_history();
        }

        match result {
            Ok( result ) => result.map_err( PlayerError::from ),
            Err( _ ) => {
                tracing::warn!( "Playback thread did not acknowledge stop" );
                Err( PlayerError::Unresponsive )
            }
        }
    }


    fn toggle_pause( &self ) -> Result<(), PlayerError> {
        let ( reply, replied ) = crossbeam_channel::bounded( 1 );
        self.send( Request::TogglePause { reply } )?;
        match replied.recv_timeout( self.config.stop_timeout() ) {
            Ok( result ) => result.map( |_| () ).map_err( PlayerError::from ),
            Err( _ ) => Err( PlayerError::Unresponsive ),
        }
    }
}


impl Drop for Player {
    fn drop( &mut self ) {
        let _ = self.requests.send( Request::Shutdown );
        if let Some( worker ) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!( "Playback thread panicked" );
            }
        }
    }
}


/// One loaded (or loading) track.
struct Session<S: SoundSystem> {
    entry: Arc<TrackEntry>,
    cancel: Arc<AtomicBool>,
    stream: S::Stream,
    /// None while the stream is loading
    channel: Option<S::Channel>,
    /// Equalizer bands in order, then the tap
    filters: Vec<S::Filter>,
    eq_revision: u64,
    volume: f32,
    paused: bool,
    pending_pause: Option<bool>,
    pending_seek: Option<Duration>,
}


struct Worker<S: SoundSystem> {
    system: S,
    shared: Arc<Shared>,
    requests: Receiver<Request>,
    config: PlayerConfig,
    session: Option<Session<S>>,
}


impl<S: SoundSystem> Worker<S> {
    fn run( mut self ) {
        tracing::debug!( "Playback thread started" );
        let mut next_tick = Instant::now() + self.interval();

        loop {
            match self.requests.recv_deadline( next_tick ) {
                Ok( Request::Shutdown ) | Err( RecvTimeoutError::Disconnected ) => break,
                Ok( request ) => {
                    self.handle( request );
                    next_tick = next_tick.min( Instant::now() + self.interval() );
                }
                Err( RecvTimeoutError::Timeout ) => {
                    self.tick();
                    next_tick = Instant::now() + self.interval();
                }
            }
        }

        if let Err( e ) = self.teardown( false ) {
            tracing::warn!( "Teardown on shutdown failed: {}", e );
        }
        self.go_idle();
        tracing::debug!( "Playback thread exiting" );
    }


    /// Loading streams are polled faster than the monitoring cadence.
    fn interval( &self ) -> Duration {
        match self.session {
            Some( ref session ) if session.channel.is_none() => self.config.open_poll_interval(),
            _ => self.config.tick_interval(),
        }
    }


    fn handle( &mut self, request: Request ) {
        match request {
            Request::Start { entry, cancel } => {
                if cancel.load( Ordering::Acquire ) {
                    tracing::debug!( "Ignoring cancelled start of {:?}", entry.path() );
                    return;
                }
                if let Err( e ) = self.teardown( false ) {
                    tracing::warn!( "Teardown before start failed: {}", e );
                }
                self.begin( entry, cancel );
            }
            Request::Stop { ack } => {
                let result = self.teardown( true );
                self.go_idle();
                let _ = ack.send( result );
            }
            Request::TogglePause { reply } => {
                let _ = reply.send( self.toggle_pause() );
            }
            Request::Seek( position ) => {
                if let Some( ref mut session ) = self.session {
                    session.pending_seek = Some( position );
                }
            }
            Request::Shutdown => {}
        }
    }


    fn tick( &mut self ) {
        if let Err( e ) = self.system.update() {
            self.fail( e );
            return;
        }

        let Some( ref session ) = self.session else {
            return;
        };

        if session.cancel.load( Ordering::Acquire ) {
            tracing::debug!( "Session cancelled" );
            if let Err( e ) = self.teardown( true ) {
                self.shared.publish( PlayerEvent::Error { message: e.to_string() } );
            }
            self.go_idle();
            return;
        }

        if session.channel.is_none() {
            if let Err( e ) = self.poll_open() {
                self.fail( e );
            }
            return;
        }

        match self.monitor() {
            Ok( Some( ended ) ) => self.finish( ended ),
            Ok( None ) => {}
            Err( e ) => self.fail( e ),
        }
    }


    /// Starts loading `entry`, walking the failure policy until a stream is
    /// opening or there is nothing left to try.
    fn begin( &mut self, entry: Arc<TrackEntry>, cancel: Arc<AtomicBool> ) {
        let mut next = Some(( entry, cancel ));
        while let Some(( entry, cancel )) = next.take() {
            if !self.claim( &entry, &cancel ) {
                tracing::debug!( "Start of {:?} was cancelled", entry.path() );
                self.go_idle();
                return;
            }
            if let Err( e ) = self.open( Arc::clone( &entry ), Arc::clone( &cancel ) ) {
                next = self.load_failed( &entry, &cancel, e );
                if next.is_none() {
                    self.go_idle();
                }
            }
        }
    }


    /// Marks `entry` as the active session unless it was cancelled.
    fn claim( &self, entry: &Arc<TrackEntry>, cancel: &Arc<AtomicBool> ) -> bool {
        let mut active = self.shared.active.lock();
        if cancel.load( Ordering::Acquire ) {
            return false;
        }
        entry.set_playing( true );
        *active = Some( ActiveSession { entry: Arc::clone( entry ), cancel: Arc::clone( cancel ) } );
        true
    }


    /// Picks the entry that follows the given session and makes it active.
    ///
    /// Runs under the active lock, so a caller that cancelled the session
    /// first always wins and nothing is taken from the navigator.
    fn advance(
        &self,
        entry: &Arc<TrackEntry>,
        cancel: &Arc<AtomicBool>,
    ) -> Option<( Arc<TrackEntry>, Arc<AtomicBool> )> {
        let mut active = self.shared.active.lock();
        let current = active.as_ref().is_some_and( |a| a.is( entry, cancel ) );
        if !current || cancel.load( Ordering::Acquire ) {
            tracing::debug!( "Session was stopped, not advancing" );
            return None;
        }

        let Some( next ) = self.shared.navigator.lock().next() else {
            tracing::info!( "End of playlist" );
            *active = None;
            return None;
        };
        let next_cancel = Arc::new( AtomicBool::new( false ) );
        *active = Some( ActiveSession { entry: Arc::clone( &next ), cancel: Arc::clone( &next_cancel ) } );
        Some(( next, next_cancel ))
    }


    fn open( &mut self, entry: Arc<TrackEntry>, cancel: Arc<AtomicBool> ) -> Result<(), EngineError> {
        tracing::info!( "Loading: {:?}", entry.path() );

        self.shared.set_position( Duration::ZERO );
        self.shared.set_length( Duration::ZERO );
        self.shared.set_state( PlaybackState::Loading );
        self.shared.publish( PlayerEvent::TrackChanged { entry: Arc::clone( &entry ) } );

        let stream = self.system.open_stream( entry.path() )?;
        self.session = Some( Session {
            entry,
            cancel,
            stream,
            channel: None,
            filters: Vec::with_capacity( BAND_COUNT + 1 ),
            eq_revision: 0,
            volume: 1.0,
            paused: false,
            pending_pause: None,
            pending_seek: None,
        });
        Ok(())
    }


    /// Reports a load failure and picks what to try next, if anything.
    fn load_failed(
        &mut self,
        entry: &Arc<TrackEntry>,
        cancel: &Arc<AtomicBool>,
        error: EngineError,
    ) -> Option<( Arc<TrackEntry>, Arc<AtomicBool> )> {
        tracing::warn!( "Failed to load {:?}: {}", entry.path(), error );

        entry.set_playing( false );
        let next = match self.config.load_failure {
            LoadFailurePolicy::SkipToNext => self.advance( entry, cancel ),
            LoadFailurePolicy::Stop => {
                self.shared.clear_active( entry, cancel );
                None
            }
        };
        self.shared.publish( PlayerEvent::LoadFailed {
            entry: Arc::clone( entry ),
            message: error.to_string(),
        });
        next
    }


    fn poll_open( &mut self ) -> Result<(), EngineError> {
        let Some( ref session ) = self.session else {
            return Ok(());
        };

        match session.stream.open_state()?.state {
            OpenState::Loading => Ok(()),
            OpenState::Ready => self.start_channel(),
            OpenState::Error => {
                let entry = Arc::clone( &session.entry );
                let cancel = Arc::clone( &session.cancel );
                let error = EngineError::Open( format!( "{} could not be opened", entry.path().display() ) );

                let next = self.load_failed( &entry, &cancel, error );
                if let Err( e ) = self.teardown( false ) {
                    tracing::warn!( "Teardown after failed open failed: {}", e );
                }
                match next {
                    Some(( next, cancel )) => self.begin( next, cancel ),
                    None => self.go_idle(),
                }
                Ok(())
            }
        }
    }


    /// Creates the paused channel, attaches the filters and starts it.
    fn start_channel( &mut self ) -> Result<(), EngineError> {
        let Self { system, shared, config, session, .. } = self;
        let Some( session ) = session.as_mut() else {
            return Ok(());
        };

        let length = Duration::from_millis( session.stream.length_ms()? as u64 );
        shared.set_length( length );

        let channel = system.play_sound( &mut session.stream, true )?;
        let channel = session.channel.insert( channel );

        // Equalizer bands in band order, then the tap last
        session.eq_revision = shared.equalizer.revision();
        let gains = shared.equalizer.gains();
        for ( center, gain ) in BAND_CENTERS.iter().zip( gains ) {
            let filter = system.create_filter( FilterKind::ParamEq {
                center: *center,
                bandwidth: config.eq_bandwidth,
                gain,
            })?;
            let attached = channel.add_filter( &filter );
            session.filters.push( filter );
            attached?;
        }

        let tap = system.create_filter( FilterKind::Custom( Box::new( TapFilter::new( Arc::clone( &shared.tap ) ) ) ) )?;
        let attached = channel.add_filter( &tap );
        session.filters.push( tap );
        attached?;

        if let Some( position ) = session.pending_seek.take() {
            channel.set_position_ms( millis( position ) )?;
        }

        session.volume = shared.volume();
        channel.set_volume( session.volume )?;

        session.paused = session.pending_pause.take().unwrap_or( false );
        if !session.paused {
            channel.set_paused( false )?;
        }

        tracing::info!( "Playing: {:?} ({:?})", session.entry.path(), length );
        shared.set_playing( true );
        shared.set_state( if session.paused { PlaybackState::Paused } else { PlaybackState::Playing } );
        Ok(())
    }


    /// One monitoring step. Returns the entry if its channel ended on its own.
    fn monitor( &mut self ) -> Result<Option<Arc<TrackEntry>>, EngineError> {
        let Self { shared, session, .. } = self;
        let Some( session ) = session.as_mut() else {
            return Ok( None );
        };
        let Some( channel ) = session.channel.as_mut() else {
            return Ok( None );
        };

        if let Some( position ) = session.pending_seek.take() {
            tracing::info!( "Seeking to {:?}", position );
            channel.set_position_ms( millis( position ) )?;
        }

        let revision = shared.equalizer.revision();
        if revision != session.eq_revision {
            let gains = shared.equalizer.gains();
            for ( filter, gain ) in session.filters.iter_mut().zip( gains ) {
                filter.set_gain( gain )?;
            }
            session.eq_revision = revision;
        }

        let volume = shared.volume();
        if volume != session.volume {
            channel.set_volume( volume )?;
            session.volume = volume;
        }

        shared.set_position( Duration::from_millis( channel.position_ms()? as u64 ) );

        if channel.is_playing()? {
            shared.set_playing( true );
            Ok( None )
        } else {
            Ok( Some( Arc::clone( &session.entry ) ) )
        }
    }


    /// Natural end of a track: tear down and advance.
    fn finish( &mut self, entry: Arc<TrackEntry> ) {
        tracing::info!( "Track ended: {:?}", entry.path() );
        let Some( cancel ) = self.session.as_ref().map( |s| Arc::clone( &s.cancel ) ) else {
            return;
        };

        let next = self.advance( &entry, &cancel );
        if let Err( e ) = self.teardown( false ) {
            self.shared.publish( PlayerEvent::Error { message: e.to_string() } );
        }
        self.shared.publish( PlayerEvent::TrackEnded { entry } );

        match next {
            Some(( next, cancel )) => self.begin( next, cancel ),
            None => self.go_idle(),
        }
    }


    fn toggle_pause( &mut self ) -> Result<Option<bool>, EngineError> {
        let Some( ref mut session ) = self.session else {
            return Ok( None );
        };

        let Some( ref mut channel ) = session.channel else {
            // Still loading, applied once the channel exists
            let paused = !session.pending_pause.unwrap_or( false );
            session.pending_pause = Some( paused );
            return Ok( Some( paused ) );
        };

        let paused = !channel.paused()?;
        channel.set_paused( paused )?;
        session.paused = paused;

        tracing::info!( "{}", if paused { "Paused" } else { "Resumed" } );
        self.shared.set_state( if paused { PlaybackState::Paused } else { PlaybackState::Playing } );
        Ok( Some( paused ) )
    }


    /// Engine failure inside the loop: report it and drop the session.
    fn fail( &mut self, error: EngineError ) {
        tracing::error!( "Playback error: {}", error );
        self.shared.publish( PlayerEvent::Error { message: error.to_string() } );
        if let Err( e ) = self.teardown( false ) {
            tracing::warn!( "Teardown after error failed: {}", e );
        }
        self.go_idle();
    }


    /// Stops the channel and releases the filters and the stream. Every
    /// release is attempted; the first failure is returned.
    fn teardown( &mut self, fade: bool ) -> Result<(), EngineError> {
        let Some( mut session ) = self.session.take() else {
            return Ok(());
        };
        self.shared.set_state( PlaybackState::Stopping );

        let mut result = Ok(());
        if let Some( mut channel ) = session.channel.take() {
            if let ( true, false, Some( fade_out ) ) = ( fade, session.paused, self.config.fade_out ) {
                self.fade( &mut channel, fade_out );
            }
            result = result.and( channel.stop() );
        }
        for mut filter in session.filters.drain( .. ) {
            result = result.and( filter.release() );
        }
        result = result.and( session.stream.release() );

        session.entry.set_playing( false );
        self.shared.clear_active( &session.entry, &session.cancel );
        self.shared.set_playing( false );
        self.shared.tap.clear();

        tracing::info!( "Stopped: {:?}", session.entry.path() );
        result
    }


    /// Ramps the channel volume down to silence, one step per fade interval.
    ///
    /// The sound system keeps being updated between steps. Requests queue up
    /// until the ramp is done, which bounds how long a stop takes to be
    /// acknowledged (see [`PlayerConfig::stop_timeout`]).
    fn fade( &mut self, channel: &mut S::Channel, fade: FadeOut ) {
        let Ok( start ) = channel.volume() else {
            return;
        };
        let steps = fade.steps();
        for step in ( 0..steps ).rev() {
            if channel.set_volume( start * step as f32 / steps as f32 ).is_err() {
                return;
            }
            thread::sleep( fade.step() );
            if let Err( e ) = self.system.update() {
                tracing::warn!( "Update during fade failed: {}", e );
                return;
            }
        }
    }


    fn go_idle( &self ) {
        self.shared.set_playing( false );
        self.shared.set_position( Duration::ZERO );
        self.shared.set_length( Duration::ZERO );
        self.shared.set_state( PlaybackState::Idle );
    }
}




#[cfg( test )]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;

    use crate::engine::{ DspProcessor, OpenStatus };
    use crate::track::TagInfo;


    /// What a test can observe of one fake channel.
    struct ChannelRecord {
        name: String,
        paused: AtomicBool,
        ended: AtomicBool,
        stopped: AtomicBool,
        position_ms: AtomicU32,
        volume: Mutex<f32>,
        filters: Mutex<Vec<String>>,
        seeks: Mutex<Vec<u32>>,
        fail_paused: AtomicBool,
        fail_position: AtomicBool,
    }


    #[derive( Default )]
    struct Recorder {
        channels: Mutex<Vec<Arc<ChannelRecord>>>,
        eq_gains: Mutex<Vec<Arc<Mutex<f32>>>>,
        released_streams: AtomicUsize,
        released_filters: AtomicUsize,
        updates: AtomicUsize,
        /// Streams stay in the loading state while set
        hold_loading: AtomicBool,
        /// `update` blocks while set
        stalled: AtomicBool,
    }


    impl Recorder {
        fn channel( &self, index: usize ) -> Arc<ChannelRecord> {
            Arc::clone( &self.channels.lock()[ index ] )
        }


        fn channel_count( &self ) -> usize {
            self.channels.lock().len()
        }
    }


    /// Streams named `missing*` fail while loading, `broken*` fail to open.
    struct FakeSystem {
        rec: Arc<Recorder>,
    }


    struct FakeStream {
        name: String,
        fails: bool,
        polls: AtomicUsize,
        released: bool,
        rec: Arc<Recorder>,
    }


    struct FakeChannel {
        rec: Arc<ChannelRecord>,
    }


    struct FakeFilter {
        label: String,
        gain: Arc<Mutex<f32>>,
        dsp: Option<Mutex<Box<dyn DspProcessor>>>,
        released: bool,
        rec: Arc<Recorder>,
    }


    impl SoundSystem for FakeSystem {
        type Stream = FakeStream;
        type Channel = FakeChannel;
        type Filter = FakeFilter;


        fn open_stream( &mut self, path: &Path ) -> Result<FakeStream, EngineError> {
            let name = path.file_stem().map( |s| s.to_string_lossy().into_owned() ).unwrap_or_default();
            if name.starts_with( "broken" ) {
                return Err( EngineError::Open( format!( "{}: unsupported", name ) ) );
            }
            Ok( FakeStream {
                fails: name.starts_with( "missing" ),
                name,
                polls: AtomicUsize::new( 0 ),
                released: false,
                rec: Arc::clone( &self.rec ),
            })
        }


        fn play_sound( &mut self, stream: &mut FakeStream, paused: bool ) -> Result<FakeChannel, EngineError> {
            let rec = Arc::new( ChannelRecord {
                name: stream.name.clone(),
                paused: AtomicBool::new( paused ),
                ended: AtomicBool::new( false ),
                stopped: AtomicBool::new( false ),
                position_ms: AtomicU32::new( 0 ),
                volume: Mutex::new( 1.0 ),
                filters: Mutex::new( Vec::new() ),
                seeks: Mutex::new( Vec::new() ),
                fail_paused: AtomicBool::new( false ),
                fail_position: AtomicBool::new( false ),
            });
            self.rec.channels.lock().push( Arc::clone( &rec ) );
            Ok( FakeChannel { rec } )
        }


        fn create_filter( &mut self, kind: FilterKind ) -> Result<FakeFilter, EngineError> {
            let gain = Arc::new( Mutex::new( 1.0 ) );
            let ( label, dsp ) = match kind {
                FilterKind::ParamEq { center, gain: initial, .. } => {
                    *gain.lock() = initial;
                    self.rec.eq_gains.lock().push( Arc::clone( &gain ) );
                    ( format!( "eq{}", center ), None )
                }
                FilterKind::Custom( dsp ) => ( "tap".to_string(), Some( Mutex::new( dsp ) ) ),
            };
            Ok( FakeFilter { label, gain, dsp, released: false, rec: Arc::clone( &self.rec ) } )
        }


        fn update( &mut self ) -> Result<(), EngineError> {
            while self.rec.stalled.load( Ordering::Relaxed ) {
                thread::sleep( Duration::from_millis( 1 ) );
            }
            self.rec.updates.fetch_add( 1, Ordering::Relaxed );
            Ok(())
        }
    }


    impl Stream for FakeStream {
        fn open_state( &self ) -> Result<OpenStatus, EngineError> {
            if self.released {
                return Err( EngineError::InvalidHandle( "stream" ) );
            }
            if self.rec.hold_loading.load( Ordering::Relaxed ) {
                return Ok( OpenStatus::loading() );
            }
            // One poll in the loading state before settling
            if self.polls.fetch_add( 1, Ordering::Relaxed ) == 0 {
                return Ok( OpenStatus::loading() );
            }
            Ok( if self.fails { OpenStatus::error() } else { OpenStatus::ready() } )
        }


        fn length_ms( &self ) -> Result<u32, EngineError> {
            Ok( 180_000 )
        }


        fn release( &mut self ) -> Result<(), EngineError> {
            self.released = true;
            self.rec.released_streams.fetch_add( 1, Ordering::Relaxed );
            Ok(())
        }
    }


    impl Channel for FakeChannel {
        type Filter = FakeFilter;


        fn paused( &self ) -> Result<bool, EngineError> {
            if self.rec.fail_paused.load( Ordering::Relaxed ) {
                return Err( EngineError::Other( "device lost".into() ) );
            }
            Ok( self.rec.paused.load( Ordering::Relaxed ) )
        }


        fn set_paused( &mut self, paused: bool ) -> Result<(), EngineError> {
            self.rec.paused.store( paused, Ordering::Relaxed );
            Ok(())
        }


        fn position_ms( &self ) -> Result<u32, EngineError> {
            if self.rec.fail_position.load( Ordering::Relaxed ) {
                return Err( EngineError::InvalidHandle( "channel" ) );
            }
            Ok( self.rec.position_ms.load( Ordering::Relaxed ) )
        }


        fn set_position_ms( &mut self, position: u32 ) -> Result<(), EngineError> {
            self.rec.seeks.lock().push( position );
            self.rec.position_ms.store( position, Ordering::Relaxed );
            Ok(())
        }


        fn is_playing( &self ) -> Result<bool, EngineError> {
            Ok( !self.rec.ended.load( Ordering::Relaxed ) )
        }


        fn volume( &self ) -> Result<f32, EngineError> {
            Ok( *self.rec.volume.lock() )
        }


        fn set_volume( &mut self, volume: f32 ) -> Result<(), EngineError> {
            *self.rec.volume.lock() = volume;
            Ok(())
        }


        fn add_filter( &mut self, filter: &FakeFilter ) -> Result<(), EngineError> {
            self.rec.filters.lock().push( filter.label.clone() );
            // Run one stereo block through custom DSP, as an audio callback would
            if let Some( ref dsp ) = filter.dsp {
                let input = [ 0.25f32; 8 ];
                let mut output = [ 0.0f32; 8 ];
                dsp.lock().process( &input, &mut output, 2 );
            }
            Ok(())
        }


        fn stop( &mut self ) -> Result<(), EngineError> {
            self.rec.stopped.store( true, Ordering::Relaxed );
            Ok(())
        }
    }


    impl Filter for FakeFilter {
        fn set_gain( &mut self, gain: f32 ) -> Result<(), EngineError> {
            *self.gain.lock() = gain;
            Ok(())
        }


        fn release( &mut self ) -> Result<(), EngineError> {
            if !self.released {
                self.released = true;
                self.rec.released_filters.fetch_add( 1, Ordering::Relaxed );
            }
            Ok(())
        }
    }


    fn test_config() -> PlayerConfig {
        PlayerConfig {
            tick_interval_ms: 5,
            open_poll_interval_ms: 2,
            fade_out: None,
            ..Default::default()
        }
    }


    fn entry( name: &str ) -> Arc<TrackEntry> {
        TrackEntry::new( format!( "/music/{}.flac", name ), TagInfo::default() )
    }


    fn player_with( config: PlayerConfig, names: &[&str] ) -> ( Player, Arc<Recorder>, Vec<Arc<TrackEntry>> ) {
        let rec = Arc::new( Recorder::default() );
        let player = Player::new( FakeSystem { rec: Arc::clone( &rec ) }, config ).unwrap();
        let entries: Vec<_> = names.iter().map( |n| entry( n ) ).collect();
        for e in &entries {
            player.add_to_now_playing( Arc::clone( e ) );
        }
        ( player, rec, entries )
    }


    /// A worker driven by hand from the test thread.
    fn worker_with( config: PlayerConfig, names: &[&str] ) -> ( Worker<FakeSystem>, Arc<Recorder>, Vec<Arc<TrackEntry>> ) {
        let rec = Arc::new( Recorder::default() );
        let shared = Arc::new( Shared::new( &config ) );
        let entries: Vec<_> = names.iter().map( |n| entry( n ) ).collect();
        for e in &entries {
            shared.navigator.lock().add( Arc::clone( e ) );
        }
        let ( _requests, receiver ) = crossbeam_channel::unbounded();
        let worker = Worker {
            system: FakeSystem { rec: Arc::clone( &rec ) },
            shared,
            requests: receiver,
            config,
            session: None,
        };
        ( worker, rec, entries )
    }


    fn start_next( worker: &mut Worker<FakeSystem> ) {
        let next = worker.shared.navigator.lock().next().unwrap();
        worker.begin( next, Arc::new( AtomicBool::new( false ) ) );
    }


    fn wait_for( what: &str, condition: impl Fn() -> bool ) {
        let deadline = Instant::now() + Duration::from_secs( 3 );
        while !condition() {
            assert!( Instant::now() < deadline, "timed out waiting for {}", what );
            thread::sleep( Duration::from_millis( 2 ) );
        }
    }


    fn is_current( player: &Player, entry: &Arc<TrackEntry> ) -> bool {
        player.current_entry().is_some_and( |e| Arc::ptr_eq( &e, entry ) )
    }


    fn playing_count( entries: &[Arc<TrackEntry>] ) -> usize {
        entries.iter().filter( |e| e.is_playing() ).count()
    }


    #[test]
    fn test_play_attaches_equalizer_then_tap() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );

        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        let channel = rec.channel( 0 );
        assert_eq!( channel.name, "a" );
        assert_eq!( *channel.filters.lock(), vec![
            "eq31.5", "eq63", "eq125", "eq250", "eq500",
            "eq1000", "eq2000", "eq4000", "eq8000", "eq16000", "tap",
        ]);
        assert!( !channel.paused.load( Ordering::Relaxed ) );
        assert!( is_current( &player, &entries[ 0 ] ) );
        assert!( entries[ 0 ].is_playing() );
        assert!( !entries[ 1 ].is_playing() );
        assert_eq!( player.length(), Duration::from_secs( 180 ) );
        assert!( player.is_playing() );
    }


    #[test]
    fn test_empty_playlist_stays_idle() {
        let ( player, rec, _ ) = player_with( test_config(), &[] );
        player.play_or_pause( None ).unwrap();
        assert_eq!( player.state(), PlaybackState::Idle );
        assert!( player.current_entry().is_none() );
        wait_for( "ticks", || rec.updates.load( Ordering::Relaxed ) > 3 );
        assert_eq!( rec.channel_count(), 0 );
    }


    #[test]
    fn test_toggle_pause() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        player.play_or_pause( None ).unwrap();
        assert_eq!( player.state(), PlaybackState::Paused );
        assert!( rec.channel( 0 ).paused.load( Ordering::Relaxed ) );

        player.play_or_pause( None ).unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );
        assert!( !rec.channel( 0 ).paused.load( Ordering::Relaxed ) );
        assert_eq!( rec.channel_count(), 1 );
    }


    #[test]
    fn test_natural_end_advances_to_next() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        let events = player.subscribe();

        player.play_or_pause( None ).unwrap();
        wait_for( "a playing", || player.state() == PlaybackState::Playing );

        rec.channel( 0 ).ended.store( true, Ordering::Relaxed );
        wait_for( "b playing", || {
            is_current( &player, &entries[ 1 ] ) && player.state() == PlaybackState::Playing
        });

        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert!( !entries[ 0 ].is_playing() );
        assert!( entries[ 1 ].is_playing() );
        assert!( events.try_iter().any( |e| matches!(
            e,
            PlayerEvent::TrackEnded { ref entry } if Arc::ptr_eq( entry, &entries[ 0 ] )
        )));
    }


    #[test]
    fn test_end_of_playlist_goes_idle() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        rec.channel( 0 ).ended.store( true, Ordering::Relaxed );
        wait_for( "idle", || player.state() == PlaybackState::Idle );

        assert!( player.current_entry().is_none() );
        assert!( !entries[ 0 ].is_playing() );
        assert!( !player.is_playing() );
        assert_eq!( rec.released_streams.load( Ordering::Relaxed ), 1 );
    }


    #[test]
    fn test_removing_playing_entry_stops_session() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        assert!( player.remove_from_now_playing( &entries[ 0 ] ).unwrap() );

        // stop() waits for the worker, so the session is already gone
        assert_eq!( player.state(), PlaybackState::Idle );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert!( player.current_entry().is_none() );
        assert_eq!( playing_count( &entries ), 0 );
        assert_eq!( player.now_playing().len(), 1 );
        assert!( player.history().is_empty() );
    }


    #[test]
    fn test_removing_other_entry_keeps_playing() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        assert!( player.remove_from_now_playing( &entries[ 1 ] ).unwrap() );
        assert!( !player.remove_from_now_playing( &entries[ 1 ] ).unwrap() );

        assert_eq!( player.state(), PlaybackState::Playing );
        assert!( !rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert!( is_current( &player, &entries[ 0 ] ) );
    }


    #[test]
    fn test_load_failure_skips_to_next() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "missing", "b" ] );
        let events = player.subscribe();

        player.play_or_pause( None ).unwrap();
        wait_for( "b playing", || {
            is_current( &player, &entries[ 1 ] ) && player.state() == PlaybackState::Playing
        });

        assert_eq!( rec.channel_count(), 1 );
        assert_eq!( rec.channel( 0 ).name, "b" );
        assert!( !entries[ 0 ].is_playing() );
        assert!( events.try_iter().any( |e| matches!(
            e,
            PlayerEvent::LoadFailed { ref entry, .. } if Arc::ptr_eq( entry, &entries[ 0 ] )
        )));
    }


    #[test]
    fn test_open_error_skips_to_next() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "broken", "b" ] );

        player.play_or_pause( None ).unwrap();
        wait_for( "b playing", || {
            is_current( &player, &entries[ 1 ] ) && player.state() == PlaybackState::Playing
        });
        assert_eq!( rec.channel_count(), 1 );
        assert_eq!( player.history().len(), 2 );
    }


    #[test]
    fn test_load_failure_stop_policy() {
        let config = PlayerConfig { load_failure: LoadFailurePolicy::Stop, ..test_config() };
        let ( player, rec, entries ) = player_with( config, &[ "missing", "b" ] );
        let events = player.subscribe();

        player.play_or_pause( None ).unwrap();
        wait_for( "failed stream released", || rec.released_streams.load( Ordering::Relaxed ) == 1 );
        wait_for( "idle", || player.state() == PlaybackState::Idle );

        assert!( events.try_iter().any( |e| matches!( e, PlayerEvent::LoadFailed { .. } ) ) );
        assert_eq!( rec.channel_count(), 0 );
        assert_eq!( playing_count( &entries ), 0 );
        assert!( player.current_entry().is_none() );
    }


    #[test]
    fn test_seek_is_noop_when_idle() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.seek( Duration::from_secs( 30 ) ).unwrap();
        assert_eq!( player.state(), PlaybackState::Idle );
        assert_eq!( player.position(), Duration::ZERO );
        assert_eq!( rec.channel_count(), 0 );
    }


    #[test]
    fn test_seek_applied_at_next_tick() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        player.seek( Duration::from_secs( 30 ) ).unwrap();
        wait_for( "seek", || rec.channel( 0 ).seeks.lock().contains( &30_000 ) );
        wait_for( "position", || player.position() == Duration::from_secs( 30 ) );
    }


    #[test]
    fn test_position_is_published() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        let events = player.subscribe();
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        rec.channel( 0 ).position_ms.store( 1234, Ordering::Relaxed );
        wait_for( "position", || player.position() == Duration::from_millis( 1234 ) );
        assert!( events.try_iter().any( |e| matches!(
            e,
            PlayerEvent::PositionChanged { position } if position == Duration::from_millis( 1234 )
        )));
    }


    #[test]
    fn test_next_and_prev_navigate_history() {
        let ( player, _rec, entries ) = player_with( test_config(), &[ "a", "b", "c" ] );

        player.play_or_pause( None ).unwrap();
        wait_for( "a", || is_current( &player, &entries[ 0 ] ) );

        assert!( player.play_next().unwrap() );
        wait_for( "b", || is_current( &player, &entries[ 1 ] ) );

        assert!( player.play_prev().unwrap() );
        wait_for( "a again", || is_current( &player, &entries[ 0 ] ) );
        assert_eq!( player.history().len(), 2 );
        assert_eq!( player.history().pointer(), Some( 0 ) );

        // Replays history instead of consuming c
        assert!( player.play_next().unwrap() );
        wait_for( "b again", || is_current( &player, &entries[ 1 ] ) );
        assert_eq!( player.history().len(), 2 );

        assert!( player.play_next().unwrap() );
        wait_for( "c", || is_current( &player, &entries[ 2 ] ) );
        assert!( !player.play_next().unwrap() );
        assert_eq!( player.state(), PlaybackState::Idle );
        assert_eq!( playing_count( &entries ), 0 );
    }


    #[test]
    fn test_prev_at_start_replays_first() {
        let ( player, _rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "a", || is_current( &player, &entries[ 0 ] ) );

        assert!( player.play_prev().unwrap() );
        assert!( player.play_prev().unwrap() );
        wait_for( "a", || is_current( &player, &entries[ 0 ] ) );
        assert_eq!( player.history().len(), 1 );
        assert_eq!( player.history().pointer(), Some( 0 ) );
    }


    #[test]
    fn test_play_entry_directly_seeds_history() {
        let ( player, _rec, entries ) = player_with( test_config(), &[ "a", "b", "c" ] );

        player.play_or_pause( Some( Arc::clone( &entries[ 1 ] ) ) ).unwrap();
        wait_for( "b", || is_current( &player, &entries[ 1 ] ) );

        // Continues after b in the playlist
        assert!( player.play_next().unwrap() );
        wait_for( "c", || is_current( &player, &entries[ 2 ] ) );

        let history = player.history();
        assert_eq!( history.len(), 2 );
        assert!( Arc::ptr_eq( &history.entries()[ 0 ], &entries[ 1 ] ) );
    }


    #[test]
    fn test_switching_entries_keeps_one_playing() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b", "c" ] );

        for e in &entries {
            player.play_or_pause( Some( Arc::clone( e ) ) ).unwrap();
            assert!( playing_count( &entries ) <= 1 );
        }
        wait_for( "c playing", || {
            is_current( &player, &entries[ 2 ] ) && player.state() == PlaybackState::Playing
        });
        assert_eq!( playing_count( &entries ), 1 );
        assert!( entries[ 2 ].is_playing() );

        // Every channel but the last was stopped
        let channels = rec.channels.lock();
        let live = channels.iter().filter( |c| !c.stopped.load( Ordering::Relaxed ) ).count();
        assert_eq!( live, 1 );
    }


    #[test]
    fn test_equalizer_gain_reaches_live_filter() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        assert!( player.set_band( 3, 2.0 ) );
        wait_for( "gain", || *rec.eq_gains.lock()[ 3 ].lock() == 2.0 );
        assert_eq!( *rec.eq_gains.lock()[ 2 ].lock(), 1.0 );

        assert!( !player.set_band( BAND_COUNT, 2.0 ) );
    }


    #[test]
    fn test_equalizer_gains_survive_sessions() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a", "b" ] );
        assert!( player.set_band( 0, 0.5 ) );

        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );
        assert_eq!( *rec.eq_gains.lock()[ 0 ].lock(), 0.5 );

        assert!( player.play_next().unwrap() );
        wait_for( "second channel", || rec.channel_count() == 2 );
        wait_for( "filters", || rec.eq_gains.lock().len() == 2 * BAND_COUNT );
        assert_eq!( *rec.eq_gains.lock()[ BAND_COUNT ].lock(), 0.5 );
    }


    #[test]
    fn test_volume_applied_to_channel() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.set_volume( 0.5 );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );
        assert_eq!( *rec.channel( 0 ).volume.lock(), 0.5 );

        player.set_volume( 9.0 );
        assert_eq!( player.volume(), VOLUME_MAX );
        wait_for( "volume", || *rec.channel( 0 ).volume.lock() == VOLUME_MAX );
    }


    #[test]
    fn test_tap_receives_channel_audio() {
        let ( player, _rec, _ ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        let frame = player.tap().snapshot();
        assert_eq!( frame.samples.len(), 8 );
        assert_eq!( frame.channels, 2 );
        assert_eq!( frame.frame_length, 4 );
    }


    #[test]
    fn test_stop_releases_session() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        player.stop().unwrap();
        assert_eq!( player.state(), PlaybackState::Idle );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert_eq!( rec.released_filters.load( Ordering::Relaxed ), BAND_COUNT + 1 );
        assert_eq!( rec.released_streams.load( Ordering::Relaxed ), 1 );
        assert!( player.history().is_empty() );
        assert!( player.tap().is_empty() );

        // History was reset, so playback starts over from the first entry
        player.play_or_pause( None ).unwrap();
        wait_for( "a again", || is_current( &player, &entries[ 0 ] ) );
    }


    #[test]
    fn test_clear_now_playing() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        player.clear_now_playing().unwrap();
        assert!( player.now_playing().is_empty() );
        assert!( player.history().is_empty() );
        assert_eq!( playing_count( &entries ), 0 );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
    }


    #[test]
    fn test_fade_out_ramps_volume_before_stop() {
        let config = PlayerConfig {
            fade_out: Some( FadeOut { duration_ms: 20, step_ms: 5 } ),
            ..test_config()
        };
        let ( player, rec, _ ) = player_with( config, &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        let updates = rec.updates.load( Ordering::Relaxed );
        player.stop().unwrap();
        // The sound system is still updated on every fade step
        assert!( rec.updates.load( Ordering::Relaxed ) - updates >= 4 );
        assert_eq!( *rec.channel( 0 ).volume.lock(), 0.0 );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
    }


    #[test]
    fn test_drop_stops_playback() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        drop( player );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert!( !entries[ 0 ].is_playing() );
    }


    #[test]
    fn test_invalid_config_rejected() {
        let rec = Arc::new( Recorder::default() );
        let config = PlayerConfig { tick_interval_ms: 0, ..test_config() };
        let result = Player::new( FakeSystem { rec }, config );
        assert!( matches!( result, Err( PlayerError::Config( ConfigError::ZeroTick ) ) ) );
    }


    #[test]
    fn test_stop_during_track_end_does_not_advance() {
        let ( mut worker, rec, entries ) = worker_with( test_config(), &[ "a", "b", "c" ] );
        start_next( &mut worker );
        worker.tick();
        worker.tick();
        assert_eq!( worker.shared.status.read().state, PlaybackState::Playing );

        // The caller cancels after the tick's cancel check, before the end is handled
        rec.channel( 0 ).ended.store( true, Ordering::Relaxed );
        worker.shared.cancel_active();
        worker.finish( Arc::clone( &entries[ 0 ] ) );

        assert_eq!( worker.shared.status.read().state, PlaybackState::Idle );
        assert_eq!( rec.channel_count(), 1 );
        assert!( worker.shared.active.lock().is_none() );
        assert_eq!( playing_count( &entries ), 0 );

        // b is still there for the caller's own next()
        let mut navigator = worker.shared.navigator.lock();
        assert_eq!( navigator.history().len(), 1 );
        assert!( Arc::ptr_eq( &navigator.next().unwrap(), &entries[ 1 ] ) );
    }


    #[test]
    fn test_stop_during_load_failure_does_not_skip() {
        let ( mut worker, rec, entries ) = worker_with( test_config(), &[ "missing", "b" ] );
        start_next( &mut worker );
        worker.tick();

        worker.shared.cancel_active();
        worker.poll_open().unwrap();

        assert_eq!( worker.shared.status.read().state, PlaybackState::Idle );
        assert_eq!( rec.channel_count(), 0 );
        assert_eq!( rec.released_streams.load( Ordering::Relaxed ), 1 );
        assert!( worker.shared.active.lock().is_none() );

        let mut navigator = worker.shared.navigator.lock();
        assert_eq!( navigator.history().len(), 1 );
        assert!( Arc::ptr_eq( &navigator.next().unwrap(), &entries[ 1 ] ) );
    }


    #[test]
    fn test_track_end_advances_when_not_stopped() {
        let ( mut worker, rec, entries ) = worker_with( test_config(), &[ "a", "b" ] );
        start_next( &mut worker );
        worker.tick();
        worker.tick();

        rec.channel( 0 ).ended.store( true, Ordering::Relaxed );
        worker.tick();
        assert!( worker.shared.active.lock().as_ref().is_some_and( |a| Arc::ptr_eq( &a.entry, &entries[ 1 ] ) ) );
        assert_eq!( worker.shared.status.read().state, PlaybackState::Loading );
        assert!( entries[ 1 ].is_playing() );
        assert!( !entries[ 0 ].is_playing() );
    }


    #[test]
    fn test_failed_pause_query_is_returned() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        rec.channel( 0 ).fail_paused.store( true, Ordering::Relaxed );
        let result = player.play_or_pause( None );
        assert!( matches!( result, Err( PlayerError::Engine( EngineError::Other( _ ) ) ) ) );

        // The session survives a failed toggle
        assert_eq!( player.state(), PlaybackState::Playing );
        assert!( is_current( &player, &entries[ 0 ] ) );
        assert!( !rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
    }


    #[test]
    fn test_engine_failure_in_loop_ends_session() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a", "b" ] );
        let events = player.subscribe();
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        rec.channel( 0 ).fail_position.store( true, Ordering::Relaxed );
        wait_for( "idle", || player.state() == PlaybackState::Idle );

        assert!( events.try_iter().any( |e| matches!(
            e,
            PlayerEvent::Error { ref message } if message.contains( "channel" )
        )));
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
        assert_eq!( rec.released_streams.load( Ordering::Relaxed ), 1 );
        assert_eq!( rec.released_filters.load( Ordering::Relaxed ), BAND_COUNT + 1 );
        assert_eq!( playing_count( &entries ), 0 );
        assert!( player.current_entry().is_none() );
        assert!( !player.is_playing() );

        // No retry and no advance
        assert_eq!( rec.channel_count(), 1 );
    }


    #[test]
    fn test_stop_times_out_when_worker_stalls() {
        let ( player, rec, entries ) = player_with( test_config(), &[ "a" ] );
        player.play_or_pause( None ).unwrap();
        wait_for( "playing", || player.state() == PlaybackState::Playing );

        rec.stalled.store( true, Ordering::Relaxed );
        // Let the next tick block inside update
        thread::sleep( Duration::from_millis( 30 ) );

        let started = Instant::now();
        let result = player.stop();
        assert!( matches!( result, Err( PlayerError::Unresponsive ) ) );
        assert!( started.elapsed() >= player.config().stop_timeout() );
        assert!( player.current_entry().is_none() );
        assert!( !entries[ 0 ].is_playing() );

        // The queued stop is handled once the engine recovers
        rec.stalled.store( false, Ordering::Relaxed );
        wait_for( "idle", || player.state() == PlaybackState::Idle );
        assert!( rec.channel( 0 ).stopped.load( Ordering::Relaxed ) );
    }


    #[test]
    fn test_pause_and_seek_while_loading() {
        let ( player, rec, _ ) = player_with( test_config(), &[ "a" ] );
        rec.hold_loading.store( true, Ordering::Relaxed );

        player.play_or_pause( None ).unwrap();
        wait_for( "loading", || player.state() == PlaybackState::Loading );
        player.play_or_pause( None ).unwrap();
        player.seek( Duration::from_secs( 30 ) ).unwrap();
        assert_eq!( rec.channel_count(), 0 );

        rec.hold_loading.store( false, Ordering::Relaxed );
        wait_for( "paused", || player.state() == PlaybackState::Paused );

        let channel = rec.channel( 0 );
        assert!( channel.paused.load( Ordering::Relaxed ) );
        assert_eq!( *channel.seeks.lock(), vec![ 30_000 ] );
        wait_for( "position", || player.position() == Duration::from_secs( 30 ) );

        // Resuming starts the paused channel
        player.play_or_pause( None ).unwrap();
        assert_eq!( player.state(), PlaybackState::Playing );
        assert!( !channel.paused.load( Ordering::Relaxed ) );
    }
}
