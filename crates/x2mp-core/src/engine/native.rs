//! Native sound system: symphonia decoding, rubato resampling, cpal output.
//!
//! Streams open on a loader thread so `open_stream` never blocks. Each
//! channel owns a decode thread feeding its output queue and one cpal output
//! stream whose callback runs the channel's filter chain.

use std::path::{ Path, PathBuf };
use std::sync::{ Arc, Weak };
use std::sync::atomic::{ AtomicBool, AtomicU64, Ordering };
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use rubato::{ FastFixedOut, PolynomialDegree, Resampler };

use super::decoder::Decoder;
use super::filter::{ FilterNode, ParamEqFilter };
use super::output::{ AudioOutput, ChannelState };
use super::{ Channel, EngineError, Filter, FilterKind, OpenStatus, SoundSystem, Stream };


const NO_SEEK: u64 = u64::MAX;


/// Converts planar samples back to interleaved format.
/// [[L0, L1, ...], [R0, R1, ...]] → [L0, R0, L1, R1, ...]
fn interleave( channels: &[Vec<f32>] ) -> Vec<f32> {
    if channels.is_empty() || channels[ 0 ].is_empty() {
        return Vec::new();
    }
    let frames = channels[ 0 ].len();
    let mut out = Vec::with_capacity( frames * channels.len() );
    for f in 0..frames {
        for ch in channels {
            out.push( ch[ f ] );
        }
    }
    out
}


/// The bundled [`SoundSystem`].
#[derive( Default )]
pub struct NativeSystem {
    channels: Vec<Weak<Playback>>,
    ticks: u64,
}


impl NativeSystem {
    pub fn new() -> Self {
        Self::default()
    }


    /// Number of `update` calls so far.
    pub fn ticks( &self ) -> u64 {
        self.ticks
    }
}


impl SoundSystem for NativeSystem {
    type Stream = NativeStream;
    type Channel = NativeChannel;
    type Filter = NativeFilter;


    fn open_stream( &mut self, path: &Path ) -> Result<NativeStream, EngineError> {
        let slot = Arc::new( Mutex::new( OpenSlot::Loading ) );
        let loader_slot = Arc::clone( &slot );
        let loader_path = path.to_path_buf();

        thread::Builder::new()
            .name( "x2mp-open".into() )
            .spawn( move || {
                let result = Decoder::open( &loader_path );
                let mut slot = loader_slot.lock();
                if matches!( *slot, OpenSlot::Released ) {
                    return;
                }
                *slot = match result {
                    Ok( decoder ) => {
                        let length = decoder.duration().unwrap_or_default();
                        OpenSlot::Ready { decoder: Some( decoder ), length }
                    }
                    Err( e ) => {
                        tracing::warn!( "Failed to open {:?}: {}", loader_path, e );
                        OpenSlot::Failed( e.to_string() )
                    }
                };
            })
            .map_err( |e| EngineError::Open( e.to_string() ) )?;

        Ok( NativeStream { path: path.to_path_buf(), slot } )
    }


    fn play_sound( &mut self, stream: &mut NativeStream, paused: bool ) -> Result<NativeChannel, EngineError> {
        let decoder = match *stream.slot.lock() {
            OpenSlot::Ready { ref mut decoder, .. } => decoder
                .take()
                .ok_or( EngineError::Other( "stream is already playing".into() ) )?,
            OpenSlot::Failed( ref message ) => return Err( EngineError::Open( message.clone() ) ),
            OpenSlot::Loading => return Err( EngineError::NotReady ),
            OpenSlot::Released => return Err( EngineError::InvalidHandle( "stream" ) ),
        };

        tracing::info!( "Playing: {:?}", stream.path );
        let channel = NativeChannel::start( decoder, paused )?;
        self.channels.push( Arc::downgrade( &channel.playback ) );
        Ok( channel )
    }


    fn create_filter( &mut self, kind: FilterKind ) -> Result<NativeFilter, EngineError> {
        let node = match kind {
            FilterKind::ParamEq { center, bandwidth, gain } => {
                if !center.is_finite() || center <= 0.0 || bandwidth <= 0.0 {
                    return Err( EngineError::Filter( format!(
                        "invalid peaking filter: center {} Hz, bandwidth {} octaves",
                        center, bandwidth
                    )));
                }
                let filter = ParamEqFilter::new( center, bandwidth, gain );
                let gain = filter.gain_handle();
                FilterNode::new( Box::new( filter ), Some( gain ) )
            }
            FilterKind::Custom( dsp ) => FilterNode::new( dsp, None ),
        };
        Ok( NativeFilter { node } )
    }


    fn update( &mut self ) -> Result<(), EngineError> {
        self.ticks += 1;
        self.channels.retain( |weak| {
            let Some( playback ) = weak.upgrade() else {
                return false;
            };
            if playback.eof.load( Ordering::Acquire ) && playback.state.queue.is_empty() {
                playback.finished.store( true, Ordering::Release );
            }
            !playback.stopped.load( Ordering::Acquire )
        });
        Ok(())
    }
}


enum OpenSlot {
    Loading,
    Ready { decoder: Option<Decoder>, length: Duration },
    Failed( String ),
    Released,
}


/// A stream opened by [`NativeSystem`].
pub struct NativeStream {
    path: PathBuf,
    slot: Arc<Mutex<OpenSlot>>,
}


impl Stream for NativeStream {
    fn open_state( &self ) -> Result<OpenStatus, EngineError> {
        match *self.slot.lock() {
            OpenSlot::Loading => Ok( OpenStatus::loading() ),
            OpenSlot::Ready { .. } => Ok( OpenStatus::ready() ),
            OpenSlot::Failed( _ ) => Ok( OpenStatus::error() ),
            OpenSlot::Released => Err( EngineError::InvalidHandle( "stream" ) ),
        }
    }


    fn length_ms( &self ) -> Result<u32, EngineError> {
        match *self.slot.lock() {
            OpenSlot::Ready { length, .. } => Ok( length.as_millis().min( u32::MAX as u128 ) as u32 ),
            OpenSlot::Released => Err( EngineError::InvalidHandle( "stream" ) ),
            _ => Err( EngineError::NotReady ),
        }
    }


    fn release( &mut self ) -> Result<(), EngineError> {
        *self.slot.lock() = OpenSlot::Released;
        Ok(())
    }
}


/// Wrapper around AudioOutput that allows it to be stored in a channel handle.
///
/// SAFETY: the output is created, used and dropped by the thread that drives
/// the sound system. cpal::Stream's raw pointers are only touched by the
/// audio callback thread, which cpal manages internally.
#[allow( dead_code )] // Kept alive for its Drop impl which stops the audio stream
struct AudioOutputHandle( AudioOutput );

unsafe impl Send for AudioOutputHandle {}


/// State shared by a channel handle, its decode thread and `update`.
struct Playback {
    state: Arc<ChannelState>,
    stop: AtomicBool,
    stopped: AtomicBool,
    /// Decoder reached the end of the file
    eof: AtomicBool,
    /// End of file and the output queue drained
    finished: AtomicBool,
    frames_decoded: AtomicU64,
    seek_to_ms: AtomicU64,
    source_rate: u32,
    source_channels: usize,
    output_rate: u32,
}


impl Playback {
    fn position( &self ) -> Duration {
        let decoded = self.frames_decoded.load( Ordering::Relaxed ) as f64 / self.source_rate as f64;
        let queued = self.state.queue.len() as f64
            / ( self.source_channels.max( 1 ) as f64 * self.output_rate as f64 );
        Duration::from_secs_f64( ( decoded - queued ).max( 0.0 ) )
    }
}


/// A playing channel of [`NativeSystem`].
pub struct NativeChannel {
    playback: Arc<Playback>,
    output: Option<AudioOutputHandle>,
    thread: Option<thread::JoinHandle<()>>,
}


impl NativeChannel {
    fn start( decoder: Decoder, paused: bool ) -> Result<Self, EngineError> {
        let source_rate = decoder.sample_rate();
        let source_channels = decoder.channels();

        let ( output, state ) = AudioOutput::new( source_rate, source_channels as u16, paused )
            .map_err( |e| EngineError::Output( e.to_string() ) )?;
        let output_rate = output.sample_rate();

        output.play().map_err( |e| EngineError::Output( e.to_string() ) )?;

        let resampler = if source_rate != output_rate {
            tracing::info!( "Resampling: {} Hz → {} Hz", source_rate, output_rate );
            let resampler = FastFixedOut::<f32>::new(
                output_rate as f64 / source_rate as f64,
                2.0,
                PolynomialDegree::Cubic,
                1024,
                source_channels,
            ).map_err( |e| EngineError::Output( format!( "Failed to create resampler: {}", e ) ) )?;
            Some( resampler )
        } else {
            None
        };

        let playback = Arc::new( Playback {
            state,
            stop: AtomicBool::new( false ),
            stopped: AtomicBool::new( false ),
            eof: AtomicBool::new( false ),
            finished: AtomicBool::new( false ),
            frames_decoded: AtomicU64::new( 0 ),
            seek_to_ms: AtomicU64::new( NO_SEEK ),
            source_rate,
            source_channels,
            output_rate,
        });

        let thread_playback = Arc::clone( &playback );
        let thread = thread::Builder::new()
            .name( "x2mp-decode".into() )
            .spawn( move || decode_loop( decoder, thread_playback, resampler ) )
            .map_err( |e| EngineError::Other( e.to_string() ) )?;

        Ok( Self {
            playback,
            output: Some( AudioOutputHandle( output ) ),
            thread: Some( thread ),
        })
    }


    fn live( &self ) -> Result<&Playback, EngineError> {
        if self.playback.stopped.load( Ordering::Acquire ) {
            return Err( EngineError::InvalidHandle( "channel" ) );
        }
        Ok( &self.playback )
    }
}


impl Channel for NativeChannel {
    type Filter = NativeFilter;


    fn paused( &self ) -> Result<bool, EngineError> {
        Ok( self.live()?.state.is_paused() )
    }


    fn set_paused( &mut self, paused: bool ) -> Result<(), EngineError> {
        self.live()?.state.set_paused( paused );
        Ok(())
    }


    fn position_ms( &self ) -> Result<u32, EngineError> {
        let ms = self.live()?.position().as_millis();
        Ok( ms.min( u32::MAX as u128 ) as u32 )
    }


    fn set_position_ms( &mut self, position: u32 ) -> Result<(), EngineError> {
        self.live()?.seek_to_ms.store( position as u64, Ordering::Release );
        Ok(())
    }


    fn is_playing( &self ) -> Result<bool, EngineError> {
        let playback = self.live()?;
        Ok( !playback.finished.load( Ordering::Acquire ) )
    }


    fn volume( &self ) -> Result<f32, EngineError> {
        Ok( self.live()?.state.volume() )
    }


    fn set_volume( &mut self, volume: f32 ) -> Result<(), EngineError> {
        self.live()?.state.set_volume( volume );
        Ok(())
    }


    fn add_filter( &mut self, filter: &NativeFilter ) -> Result<(), EngineError> {
        let playback = self.live()?;
        if filter.node.is_released() {
            return Err( EngineError::InvalidHandle( "filter" ) );
        }
        filter.node.prepare( playback.output_rate );
        playback.state.chain.lock().push( Arc::clone( &filter.node ) );
        Ok(())
    }


    fn stop( &mut self ) -> Result<(), EngineError> {
        if self.playback.stopped.swap( true, Ordering::AcqRel ) {
            return Ok(());
        }
        self.playback.stop.store( true, Ordering::Release );
        self.playback.state.queue.clear();

        if let Some( thread ) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!( "Decode thread panicked" );
            }
        }

        // Dropping the output stops the cpal stream
        self.output = None;
        tracing::info!( "Stopped" );
        Ok(())
    }
}


impl Drop for NativeChannel {
    fn drop( &mut self ) {
        let _ = self.stop();
    }
}


/// A filter node of [`NativeSystem`].
pub struct NativeFilter {
    node: Arc<FilterNode>,
}


impl Filter for NativeFilter {
    fn set_gain( &mut self, gain: f32 ) -> Result<(), EngineError> {
        if self.node.is_released() {
            return Err( EngineError::InvalidHandle( "filter" ) );
        }
        self.node.set_gain( gain );
        Ok(())
    }


    fn release( &mut self ) -> Result<(), EngineError> {
        self.node.release();
        Ok(())
    }
}


/// Pushes samples into the output queue, waiting while it is full.
fn push_all( playback: &Playback, samples: &[f32] ) {
    let mut offset = 0;
    while offset < samples.len() && !playback.stop.load( Ordering::Relaxed ) {
        let pushed = playback.state.queue.push( &samples[ offset.. ] );
        offset += pushed;
        if pushed == 0 {
            thread::sleep( Duration::from_millis( 5 ) );
        }
    }
}


/// The decode loop that runs in a separate thread per channel.
fn decode_loop( mut decoder: Decoder, playback: Arc<Playback>, mut resampler: Option<FastFixedOut<f32>> ) {
    let channels = decoder.channels();
    let mut resample_input: Vec<Vec<f32>> = ( 0..channels ).map( |_| Vec::new() ).collect();

    // Keep about 50ms buffered ahead of the device
    let target_buffer = ( playback.output_rate as usize * channels ) / 20;

    loop {
        if playback.stop.load( Ordering::Relaxed ) {
            tracing::debug!( "Decode loop: stop signal received" );
            break;
        }

        let seek_ms = playback.seek_to_ms.swap( NO_SEEK, Ordering::AcqRel );
        if seek_ms != NO_SEEK {
            let position = Duration::from_millis( seek_ms );
            match decoder.seek( position ) {
                Ok( frame ) => {
                    playback.state.queue.clear();
                    for ch in &mut resample_input {
                        ch.clear();
                    }
                    if let Some( ref mut resampler ) = resampler {
                        resampler.reset();
                    }
                    playback.frames_decoded.store( frame, Ordering::Relaxed );
                    playback.eof.store( false, Ordering::Release );
                    playback.finished.store( false, Ordering::Release );
                    tracing::info!( "Seeked to {:?}, resuming at frame {}", position, frame );
                }
                Err( e ) => tracing::warn!( "Seek failed: {}", e ),
            }
        }

        if playback.state.is_paused() || playback.eof.load( Ordering::Acquire ) {
            thread::sleep( Duration::from_millis( 10 ) );
            continue;
        }

        if playback.state.queue.len() > target_buffer {
            thread::sleep( Duration::from_millis( 5 ) );
            continue;
        }

        match decoder.next_block() {
            Ok( Some( samples ) ) => {
                let source_frames = samples.len() / channels.max( 1 );
                playback.frames_decoded.fetch_add( source_frames as u64, Ordering::Relaxed );

                let Some( ref mut resampler ) = resampler else {
                    push_all( &playback, samples );
                    continue;
                };

                for frame in samples.chunks( channels ) {
                    for ( ch, sample ) in frame.iter().enumerate() {
                        resample_input[ ch ].push( *sample );
                    }
                }

                while resample_input[ 0 ].len() >= resampler.input_frames_next() {
                    let needed = resampler.input_frames_next();
                    let chunk: Vec<Vec<f32>> = resample_input
                        .iter_mut()
                        .map( |ch| ch.drain( ..needed ).collect() )
                        .collect();
                    match resampler.process( &chunk, None ) {
                        Ok( resampled ) => push_all( &playback, &interleave( &resampled ) ),
                        Err( e ) => {
                            tracing::error!( "Resample error: {}", e );
                            break;
                        }
                    }
                }
            }
            Ok( None ) => {
                if let Some( ref mut resampler ) = resampler {
                    if !resample_input[ 0 ].is_empty() {
                        match resampler.process_partial( Some( &resample_input ), None ) {
                            Ok( resampled ) => push_all( &playback, &interleave( &resampled ) ),
                            Err( e ) => tracing::error!( "Final resample error: {}", e ),
                        }
                        for ch in &mut resample_input {
                            ch.clear();
                        }
                    }
                }
                tracing::info!( "Decode loop: reached end of file" );
                playback.eof.store( true, Ordering::Release );
            }
            Err( e ) => {
                tracing::error!( "Decode error: {}", e );
                playback.eof.store( true, Ordering::Release );
            }
        }
    }

    tracing::debug!( "Decode loop: exiting" );
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::engine::OpenState;


    #[test]
    fn test_interleave() {
        let planar = vec![ vec![ 1.0, 2.0 ], vec![ 10.0, 20.0 ] ];
        assert_eq!( interleave( &planar ), vec![ 1.0, 10.0, 2.0, 20.0 ] );
        assert!( interleave( &[] ).is_empty() );
    }


    #[test]
    fn test_missing_file_reports_error_state() {
        let mut system = NativeSystem::new();
        let mut stream = system.open_stream( Path::new( "/no/such/file.flac" ) ).unwrap();

        let mut status = stream.open_state().unwrap();
        for _ in 0..200 {
            if status.state != OpenState::Loading {
                break;
            }
            thread::sleep( Duration::from_millis( 5 ) );
            status = stream.open_state().unwrap();
        }
        assert_eq!( status.state, OpenState::Error );
        assert!( matches!( system.play_sound( &mut stream, true ), Err( EngineError::Open( _ ) ) ) );

        stream.release().unwrap();
        assert!( stream.open_state().is_err() );
    }


    #[test]
    fn test_invalid_param_eq_rejected() {
        let mut system = NativeSystem::new();
        let result = system.create_filter( FilterKind::ParamEq { center: -1.0, bandwidth: 1.0, gain: 1.0 } );
        assert!( matches!( result, Err( EngineError::Filter( _ ) ) ) );
    }


    #[test]
    fn test_released_filter_rejects_gain() {
        let mut system = NativeSystem::new();
        let mut filter = system
            .create_filter( FilterKind::ParamEq { center: 1000.0, bandwidth: 1.0, gain: 1.0 } )
            .unwrap();
        filter.set_gain( 2.0 ).unwrap();
        filter.release().unwrap();
        assert!( filter.set_gain( 1.0 ).is_err() );
    }
}
